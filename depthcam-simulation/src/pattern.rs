use bytes::Bytes;

use depthcam_core::config::{DepthRange, Resolution, Roi};
use depthcam_core::frame::{depth_payload, point_payload};
use depthcam_core::pixel_format::DataType;

/// 自动曝光时传感器实际采用的曝光
pub(crate) const AUTO_EXPOSURE_US: u32 = 8_000;

/// 每像素亮度与曝光量成正比，在 40 µs·gain 时增加 1 个灰度级
const EXPOSURE_PER_LEVEL: f32 = 40.0;

/// 场景参数：合成一帧需要的全部输入
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scene {
    pub(crate) resolution: Resolution,
    pub(crate) exposure_us: u32,
    pub(crate) gain: f32,
    pub(crate) depth_range: DepthRange,
    pub(crate) roi: Roi,
}

impl Scene {
    /// 8-bit 强度：随曝光量线性增长直到饱和
    pub(crate) fn intensity(&self) -> u8 {
        let level = self.exposure_us as f32 * self.gain / EXPOSURE_PER_LEVEL;
        level.clamp(0.0, 255.0) as u8
    }

    /// 场景中平面的距离 (毫米)，取深度范围的中点
    pub(crate) fn plane_distance_mm(&self) -> u16 {
        let mid = (self.depth_range.min_mm + self.depth_range.max_mm) / 2;
        mid.min(u16::MAX as u32) as u16
    }

    /// ROI 在像素坐标下覆盖的行/列区间
    fn roi_span(&self) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let w = self.resolution.width as f32;
        let h = self.resolution.height as f32;
        let x0 = (self.roi.x * w).round() as usize;
        let x1 = ((self.roi.x + self.roi.width) * w).round() as usize;
        let y0 = (self.roi.y * h).round() as usize;
        let y1 = ((self.roi.y + self.roi.height) * h).round() as usize;
        let y1 = y1.min(self.resolution.height as usize);
        let x1 = x1.min(self.resolution.width as usize);
        (y0.min(y1)..y1, x0.min(x1)..x1)
    }

    pub(crate) fn synthesize(&self, data_type: DataType) -> Bytes {
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        let pixels = width * height;

        match data_type {
            DataType::Rgb => Bytes::from(vec![self.intensity(); pixels * 3]),
            DataType::IrLeft | DataType::IrRight => Bytes::from(vec![self.intensity(); pixels]),
            DataType::Depth => {
                // 深度只在 ROI 内有效，ROI 外为 0 (无效)
                let (rows, cols) = self.roi_span();
                let mut row = vec![0u16; width];
                row[cols].fill(self.plane_distance_mm());
                let mut values = Vec::with_capacity(pixels);
                for y in 0..height {
                    if rows.contains(&y) {
                        values.extend_from_slice(&row);
                    } else {
                        values.resize(values.len() + width, 0);
                    }
                }
                depth_payload(&values)
            }
            DataType::PointCloud => {
                let z = self.plane_distance_mm() as f32 / 1000.0;
                point_payload(&vec![[0.0, 0.0, z]; pixels])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(exposure_us: u32, gain: f32) -> Scene {
        Scene {
            resolution: Resolution::new(10, 10),
            exposure_us,
            gain,
            depth_range: DepthRange {
                min_mm: 1_000,
                max_mm: 3_000,
            },
            roi: Roi::new(0.2, 0.2, 0.6, 0.6),
        }
    }

    #[test]
    fn intensity_scales_with_exposure_and_saturates() {
        assert_eq!(scene(1_000, 1.0).intensity(), 25);
        assert_eq!(scene(5_000, 2.0).intensity(), 250);
        assert_eq!(scene(10_000, 4.0).intensity(), 255);
    }

    #[test]
    fn depth_is_zero_outside_roi() {
        let data = scene(1_000, 1.0).synthesize(DataType::Depth);
        let values: Vec<u16> = data
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values.len(), 100);
        assert_eq!(values[0], 0);
        assert_eq!(values[2 * 10 + 2], 2_000);
        assert_eq!(values[7 * 10 + 7], 2_000);
        assert_eq!(values[8 * 10 + 8], 0);
    }
}
