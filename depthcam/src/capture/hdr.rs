//! HDR 多曝光采集与融合
//!
//! 每个档位：下发 (曝光, 增益) → 丢弃旧代号的帧和稳定帧 → 每种类型取一帧。
//! 全部档位成功后才融合；任何失败 (包括用户取消) 之后，只要连接还在就恢复拍摄前的配置。

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::time::Instant;

use depthcam_core::capture::{CaptureOutput, CaptureResult, HdrComponent, HdrOutcome};
use depthcam_core::config::{HdrLevel, StreamConfig};
use depthcam_core::error::{CaptureError, ParamError};
use depthcam_core::frame::{depth_payload, point_payload, Frame, FrameMetadata};
use depthcam_core::pixel_format::DataType;

use super::collect::{Collector, Interrupt};
use super::Job;
use crate::imgcodecs::SaveTarget;
use crate::status::StatusCode;

/// 一次 HDR 采集中断时已完成的档位
struct LevelFailure {
    error: CaptureError,
    captured: Vec<Vec<Frame>>,
}

impl Job {
    pub(super) async fn capture_hdr(&self, collector: &mut Collector, levels: &[HdrLevel]) -> CaptureResult {
        let Some(previous) = self.lease.active_config() else {
            return Err(CaptureError::StreamNotRunning);
        };

        let outcome = self.capture_levels(collector, levels, &previous).await;

        // 连接还在就恢复拍摄前的配置；断开时配置随连接一起销毁
        let restored = if self.lease.is_cancelled() {
            Ok(())
        } else {
            self.params
                .apply_on(&self.lease, &previous)
                .await
                .map(|_| ())
        };
        if let Err(e) = &restored {
            tracing::warn!(target: "depthcam::capture", "{}: failed to restore configuration: {}", self.id, e);
        }

        let captured = match (outcome, restored) {
            (Ok(captured), Ok(())) => captured,
            (Ok(_), Err(e)) => return Err(CaptureError::Parameter(e)),
            (Err(LevelFailure { error: CaptureError::Cancelled { .. }, captured }), _) => {
                let items = component_items(self, &captured);
                return self.cancelled(items, collector.dropped()).await;
            }
            (Err(failure), _) => return Err(failure.error),
        };

        // 融合后与各档位原始帧一起保存；任何一个保存失败，整批删除
        let types: Vec<DataType> = self.request.data_types.types().collect();
        let mut items = component_items(self, &captured);
        let component_count = items.len();
        for &data_type in &types {
            let frames: Vec<Frame> = captured
                .iter()
                .filter_map(|level| level.iter().find(|f| f.data_type == data_type).cloned())
                .collect();
            let merged = fuse(levels, &frames).ok_or(CaptureError::InvalidRequest(
                "exposure levels produced frames of different shapes",
            ))?;
            items.push((
                SaveTarget::new(self.id, format!("hdr_{}", data_type.short_name())),
                merged,
            ));
        }

        let mut saved = self.save(items).await?;
        let merged = saved.split_off(component_count);
        let mut per_level = saved.into_iter();
        let components: Vec<HdrComponent> = levels
            .iter()
            .map(|level| HdrComponent {
                level: *level,
                frames: per_level.by_ref().take(types.len()).collect(),
            })
            .collect();

        let frames = component_frames(&components);
        Ok(CaptureOutput {
            job: self.id,
            frames,
            dropped: collector.dropped(),
            hdr: Some(HdrOutcome { components, merged }),
        })
    }

    async fn capture_levels(
        &self,
        collector: &mut Collector,
        levels: &[HdrLevel],
        previous: &StreamConfig,
    ) -> Result<Vec<Vec<Frame>>, LevelFailure> {
        let per_level = self.request.data_types.count();
        let mut captured: Vec<Vec<Frame>> = Vec::with_capacity(levels.len());

        for (index, level) in levels.iter().enumerate() {
            let levels_left = levels.len() - index;
            match self
                .capture_level(collector, index, *level, previous, levels_left)
                .await
            {
                Ok(frames) => {
                    captured.push(frames);
                    let collected = captured.len() * per_level;
                    self.progress(collected, levels.len() * per_level, 0, collector.dropped());
                    self.status.report(StatusCode::HdrLevelCaptured {
                        job: self.id,
                        level: index,
                        of: levels.len(),
                    });
                    tracing::debug!(
                        target: "depthcam::capture",
                        "{}: level {}/{} captured ({} us, gain {})",
                        self.id,
                        index + 1,
                        levels.len(),
                        level.exposure_us,
                        level.gain
                    );
                }
                Err(error) => return Err(LevelFailure { error, captured }),
            }
        }
        Ok(captured)
    }

    async fn capture_level(
        &self,
        collector: &mut Collector,
        index: usize,
        level: HdrLevel,
        previous: &StreamConfig,
        levels_left: usize,
    ) -> Result<Vec<Frame>, CaptureError> {
        let types = self.request.data_types;

        // 1. 切换曝光
        let level_config = previous.with_level(level);
        let generation = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CaptureError::Cancelled { partial: None }),
            applied = self.params.apply_on(&self.lease, &level_config) => match applied {
                Ok(generation) => generation,
                Err(ParamError::NotConnected) if collector.is_cancelled() => {
                    return Err(CaptureError::Cancelled { partial: None })
                }
                Err(e) => return Err(e.into()),
            },
        };
        collector.reset_tracking();

        // 2. 等待稳定并取帧，整个档位共用一个时限
        let deadline = Instant::now() + self.policy.hdr_level_timeout();
        let mut settled: BTreeMap<DataType, u32> = BTreeMap::new();
        let mut frames: Vec<Frame> = Vec::with_capacity(types.count());
        while frames.len() < types.count() {
            let frame = match collector.next(deadline).await {
                Ok(frame) => frame,
                Err(Interrupt::Timeout) => return Err(CaptureError::HdrLevelTimeout { level: index }),
                Err(Interrupt::Cancelled) => return Err(CaptureError::Cancelled { partial: None }),
                Err(Interrupt::StreamStopped) => {
                    let missing = levels_left * types.count() - frames.len();
                    return Err(CaptureError::StreamStopped {
                        missing,
                        dropped: collector.dropped() + missing as u64,
                    });
                }
            };

            // 切换前拉到的帧
            if frame.generation < generation {
                continue;
            }
            let discarded = settled.entry(frame.data_type).or_insert(0);
            if *discarded < self.policy.hdr_settle_frames {
                *discarded += 1;
                continue;
            }
            if frames.iter().any(|f| f.data_type == frame.data_type) {
                continue;
            }
            collector.accept(&frame);
            frames.push(frame);
        }
        frames.sort_by_key(|f| f.data_type);
        Ok(frames)
    }
}

fn component_items(job: &Job, captured: &[Vec<Frame>]) -> Vec<(SaveTarget, Frame)> {
    captured
        .iter()
        .enumerate()
        .flat_map(|(index, frames)| {
            frames.iter().map(move |frame| {
                let label = format!("level{}_{}", index, frame.data_type.short_name());
                (SaveTarget::new(job.id, label), frame.clone())
            })
        })
        .collect()
}

fn component_frames(components: &[HdrComponent]) -> Vec<depthcam_core::capture::CapturedFrame> {
    components
        .iter()
        .flat_map(|c| c.frames.iter().cloned())
        .collect()
}

/// 融合同一数据类型在各档位下的帧
///
/// `frames[i]` 对应 `levels[i]`，尺寸和类型必须一致，否则返回 None。
/// - 8-bit 强度图：按曝光量归一化后加权平均 (帽形权重，过暗和饱和的样本权重低)，
///   再映射回中间档位的曝光量
/// - 深度：按档位顺序取第一个有效值 (非 0)
/// - 点云：按档位顺序取第一个有效点 (z > 0)
pub fn fuse(levels: &[HdrLevel], frames: &[Frame]) -> Option<Frame> {
    let first = frames.first()?;
    if frames.len() != levels.len()
        || frames.iter().any(|f| {
            f.data_type != first.data_type
                || f.width != first.width
                || f.height != first.height
                || !f.is_well_formed()
        })
    {
        return None;
    }

    let data = match first.data_type {
        DataType::Rgb | DataType::IrLeft | DataType::IrRight => fuse_intensity(levels, frames),
        DataType::Depth => {
            let planes: Vec<_> = frames.iter().filter_map(|f| f.depth_values()).collect();
            let mut values = planes.first()?.to_vec();
            for (i, value) in values.iter_mut().enumerate() {
                *value = planes.iter().map(|p| p[i]).find(|&v| v != 0).unwrap_or(0);
            }
            depth_payload(&values)
        }
        DataType::PointCloud => {
            let clouds: Vec<_> = frames.iter().filter_map(|f| f.points()).collect();
            let mut points = clouds.first()?.to_vec();
            for (i, point) in points.iter_mut().enumerate() {
                *point = clouds
                    .iter()
                    .map(|c| c[i])
                    .find(|p| p[2] > 0.0 && p[2].is_finite())
                    .unwrap_or([0.0; 3]);
            }
            point_payload(&points)
        }
    };

    let mut merged = first.clone();
    merged.data = data;
    merged.metadata = FrameMetadata {
        actual_exposure_us: None,
        actual_gain: None,
        merged_levels: Some(levels.len() as u16),
    };
    Some(merged)
}

fn fuse_intensity(levels: &[HdrLevel], frames: &[Frame]) -> Bytes {
    let factors: Vec<f32> = levels.iter().map(|l| l.exposure_factor().max(f32::EPSILON)).collect();
    let reference = factors[factors.len() / 2];
    let len = frames[0].data.len();

    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let mut weighted = 0.0f32;
        let mut total = 0.0f32;
        let mut saturated = false;
        for (frame, factor) in frames.iter().zip(&factors) {
            let v = frame.data[i] as f32;
            // 帽形权重：中间调最可信
            let w = v.min(255.0 - v);
            weighted += w * v / factor;
            total += w;
            saturated |= frame.data[i] == u8::MAX;
        }
        let value = if total > 0.0 {
            weighted / total * reference
        } else if saturated {
            255.0
        } else {
            0.0
        };
        out.push(value.round().clamp(0.0, 255.0) as u8);
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcam_core::frame::RawFrame;
    use std::time::Instant as StdInstant;

    fn frame(data_type: DataType, data: Bytes) -> Frame {
        let raw = RawFrame {
            data_type,
            width: 2,
            height: 1,
            device_index: 1,
            hw_timestamp_ns: 0,
            metadata: Default::default(),
            data,
        };
        Frame::from_raw(raw, 1, 0, StdInstant::now())
    }

    fn ladder() -> Vec<HdrLevel> {
        vec![
            HdrLevel::new(1_000, 1.0),
            HdrLevel::new(5_000, 2.0),
            HdrLevel::new(10_000, 4.0),
        ]
    }

    #[test]
    fn intensity_fusion_prefers_well_exposed_samples() {
        // 线性场景：亮度 = 曝光量 / 40，第二档接近饱和，第三档饱和
        let frames: Vec<_> = [25u8, 250, 255]
            .iter()
            .map(|&v| frame(DataType::IrLeft, Bytes::from(vec![v, 0])))
            .collect();
        let merged = fuse(&ladder(), &frames).unwrap();

        assert_eq!(merged.metadata.merged_levels, Some(3));
        // 映射回中间档位 (10000 µs·gain)，应接近 250
        assert!((249..=251).contains(&merged.data[0]));
        // 全黑像素保持全黑
        assert_eq!(merged.data[1], 0);
    }

    #[test]
    fn fully_saturated_pixels_stay_white() {
        let frames: Vec<_> = (0..3)
            .map(|_| frame(DataType::IrRight, Bytes::from(vec![255u8, 255])))
            .collect();
        let merged = fuse(&ladder(), &frames).unwrap();
        assert_eq!(&merged.data[..], &[255, 255]);
    }

    #[test]
    fn depth_takes_first_valid_value_in_level_order() {
        let frames = vec![
            frame(DataType::Depth, depth_payload(&[0, 1_200])),
            frame(DataType::Depth, depth_payload(&[900, 1_300])),
            frame(DataType::Depth, depth_payload(&[800, 0])),
        ];
        let merged = fuse(&ladder(), &frames).unwrap();
        assert_eq!(merged.depth_values().unwrap().to_vec(), vec![900, 1_200]);
    }

    #[test]
    fn mismatched_inputs_are_refused() {
        let frames = vec![
            frame(DataType::Depth, depth_payload(&[1, 2])),
            frame(DataType::IrLeft, Bytes::from(vec![1u8, 2])),
            frame(DataType::Depth, depth_payload(&[1, 2])),
        ];
        assert!(fuse(&ladder(), &frames).is_none());
        assert!(fuse(&ladder(), &frames[..1]).is_none());
    }
}
