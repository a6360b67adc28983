use crate::config::{
    DepthRange, ExposureMode, FillHolePolicy, FilterMode, HdrMode, Resolution, Roi,
    WhiteBalanceMode,
};
use crate::pixel_format::DataTypes;

/// 设备参数键
///
/// 顺序即写入顺序：模式类参数先于数值类参数 (先切手动曝光，再写曝光时间)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamKey {
    Resolution,
    DataTypes,
    ExposureMode,
    ExposureTime,
    Gain,
    WhiteBalanceMode,
    WhiteBalanceTemperature,
    DepthRange,
    Roi,
    Filter,
    FillHole,
    Hdr,
}

impl ParamKey {
    pub const ALL: [ParamKey; 12] = [
        ParamKey::Resolution,
        ParamKey::DataTypes,
        ParamKey::ExposureMode,
        ParamKey::ExposureTime,
        ParamKey::Gain,
        ParamKey::WhiteBalanceMode,
        ParamKey::WhiteBalanceTemperature,
        ParamKey::DepthRange,
        ParamKey::Roi,
        ParamKey::Filter,
        ParamKey::FillHole,
        ParamKey::Hdr,
    ];

    /// 修改后传感器需要稳定时间的参数
    pub fn affects_exposure(self) -> bool {
        matches!(
            self,
            ParamKey::ExposureMode | ParamKey::ExposureTime | ParamKey::Gain | ParamKey::Hdr
        )
    }
}

/// 强类型的参数值
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamValue {
    Resolution(Resolution),
    DataTypes(DataTypes),
    ExposureMode(ExposureMode),
    Micros(u32),
    Gain(f32),
    WhiteBalance(WhiteBalanceMode),
    Kelvin(u32),
    DepthRange(DepthRange),
    Roi(Roi),
    Filter(FilterMode),
    FillHole(FillHolePolicy),
    Hdr(HdrMode),
}

/// 闭区间
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueRange<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> ValueRange<T> {
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }
}

/// 设备上报的参数边界
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceLimits {
    pub resolutions: Vec<Resolution>,
    pub data_types: DataTypes,
    pub exposure_us: ValueRange<u32>,
    pub gain: ValueRange<f32>,
    pub white_balance_k: ValueRange<u32>,
    pub depth_range_mm: ValueRange<u32>,
}
