use std::borrow::Cow;
use std::time::Instant;

use bytes::Bytes;

use crate::pixel_format::{DataType, FourCC};

/// 硬件边界交付的原始帧
///
/// 还没有会话级序列号和配置代号，由 Stream Engine 在发布前补全。
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data_type: DataType,
    pub width: u32,
    pub height: u32,
    /// 设备为每种数据类型独立维护的帧计数，跳号即丢帧
    pub device_index: u64,
    /// 硬件原始时间戳 (纳秒)
    pub hw_timestamp_ns: u64,
    pub metadata: FrameMetadata,
    pub data: Bytes,
}

/// 核心帧结构体
///
/// 一旦发布即不可变；负载是引用计数的共享缓冲区，分发给多个消费者时不复制像素。
#[derive(Debug, Clone)]
pub struct Frame {
    /// 图像宽度 (Pixels)
    pub width: u32,

    /// 图像高度 (Pixels)
    pub height: u32,

    /// 跨距 (Bytes per line)
    pub stride: usize,

    pub data_type: DataType,

    pub format: FourCC,

    /// 会话内单调递增的序列号
    pub sequence: u64,

    /// 设备侧的分类型帧计数
    pub device_index: u64,

    /// 拉取该帧时生效的参数配置代号
    pub generation: u64,

    pub timestamp: Timestamp,

    pub metadata: FrameMetadata,

    pub data: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct Timestamp {
    /// 硬件原始时间戳 (纳秒，单调递增)
    pub hw_raw_ns: u64,

    /// 帧到达主机的时刻
    pub arrival: Instant,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    pub actual_exposure_us: Option<u32>, // 实际曝光时间
    pub actual_gain: Option<f32>,        // 实际增益
    /// HDR 融合结果：参与融合的曝光档位数
    pub merged_levels: Option<u16>,
}

impl Frame {
    pub fn from_raw(raw: RawFrame, sequence: u64, generation: u64, arrival: Instant) -> Self {
        let stride = raw.width as usize * raw.data_type.bytes_per_pixel();
        Self {
            width: raw.width,
            height: raw.height,
            stride,
            data_type: raw.data_type,
            format: raw.data_type.pixel_format(),
            sequence,
            device_index: raw.device_index,
            generation,
            timestamp: Timestamp {
                hw_raw_ns: raw.hw_timestamp_ns,
                arrival,
            },
            metadata: raw.metadata,
            data: raw.data,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// 一行像素实际占用的字节数
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.data_type.bytes_per_pixel()
    }

    /// 行紧密排列 (跨距 = 行字节数) 且负载长度等于 跨距 × 高
    ///
    /// 编码和融合都按紧密排列读取负载。
    pub fn is_well_formed(&self) -> bool {
        self.stride == self.row_bytes() && self.data.len() == self.stride * self.height as usize
    }

    /// 深度值 (毫米)
    ///
    /// 对齐时直接借用负载，否则逐像素读取。
    pub fn depth_values(&self) -> Option<Cow<'_, [u16]>> {
        if self.data_type != DataType::Depth {
            return None;
        }
        Some(match bytemuck::try_cast_slice::<u8, u16>(&self.data) {
            Ok(values) => Cow::Borrowed(values),
            Err(_) => Cow::Owned(
                self.data
                    .chunks_exact(2)
                    .map(bytemuck::pod_read_unaligned)
                    .collect(),
            ),
        })
    }

    /// 点云坐标 (米)
    pub fn points(&self) -> Option<Cow<'_, [[f32; 3]]>> {
        if self.data_type != DataType::PointCloud {
            return None;
        }
        Some(match bytemuck::try_cast_slice::<u8, [f32; 3]>(&self.data) {
            Ok(points) => Cow::Borrowed(points),
            Err(_) => Cow::Owned(
                self.data
                    .chunks_exact(12)
                    .map(bytemuck::pod_read_unaligned)
                    .collect(),
            ),
        })
    }
}

/// 把深度值打包成帧负载 (主机字节序)
pub fn depth_payload(values: &[u16]) -> Bytes {
    Bytes::copy_from_slice(bytemuck::cast_slice(values))
}

/// 把点云坐标打包成帧负载 (主机字节序)
pub fn point_payload(points: &[[f32; 3]]) -> Bytes {
    Bytes::copy_from_slice(bytemuck::cast_slice(points))
}
