use std::collections::BTreeMap;

use crate::control::{DeviceLimits, ParamKey, ParamValue};
use crate::error::{ParamError, ParamField};
use crate::pixel_format::DataTypes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ExposureMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum WhiteBalanceMode {
    Auto,
    Manual,
}

/// 深度有效范围 (毫米)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DepthRange {
    pub min_mm: u32,
    pub max_mm: u32,
}

/// 感兴趣区域，归一化坐标 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Roi {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Roi {
    pub const FULL: Roi = Roi {
        x: 0.0,
        y: 0.0,
        width: 1.0,
        height: 1.0,
    };

    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// 完全落在单位正方形内且面积非零
    pub fn is_valid(&self) -> bool {
        let finite = [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.x >= 0.0
            && self.y >= 0.0
            && self.width > 0.0
            && self.height > 0.0
            && self.x + self.width <= 1.0
            && self.y + self.height <= 1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum FilterMode {
    None,
    Smooth,
    Median,
    TimeDomain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum FillHolePolicy {
    Disabled,
    Nearest,
    Farthest,
}

/// HDR 的一个曝光档位
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct HdrLevel {
    pub exposure_us: u32,
    pub gain: f32,
}

impl HdrLevel {
    pub const fn new(exposure_us: u32, gain: f32) -> Self {
        Self { exposure_us, gain }
    }

    /// 曝光量 (曝光时间 × 增益)，用于融合时的亮度归一化
    pub fn exposure_factor(&self) -> f32 {
        self.exposure_us as f32 * self.gain
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum HdrMode {
    #[default]
    Off,
    Manual(Vec<HdrLevel>),
    Auto,
}

/// 一次完整的流配置
///
/// 设备同一时刻只有一份生效的 StreamConfig。
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamConfig {
    pub resolution: Resolution,
    pub data_types: DataTypes,
    pub exposure_mode: ExposureMode,
    pub exposure_us: u32,
    pub gain: f32,
    pub white_balance: WhiteBalanceMode,
    pub white_balance_k: u32,
    pub depth_range: DepthRange,
    pub roi: Roi,
    pub filter: FilterMode,
    pub fill_hole: FillHolePolicy,
    pub hdr: HdrMode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self {
            resolution: Resolution::new(1280, 720),
            data_types: DataTypes::DEPTH,
            exposure_mode: ExposureMode::Auto,
            exposure_us: 5_000,
            gain: 1.0,
            white_balance: WhiteBalanceMode::Auto,
            white_balance_k: 4_600,
            depth_range: DepthRange {
                min_mm: 200,
                max_mm: 5_000,
            },
            roi: Roi::FULL,
            filter: FilterMode::None,
            fill_hole: FillHolePolicy::Disabled,
            hdr: HdrMode::Off,
        }
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::new(width, height);
        self
    }

    /// 支持传入 DataType 或 DataTypes
    pub fn data_types<T: Into<DataTypes>>(mut self, types: T) -> Self {
        self.data_types = types.into();
        self
    }

    /// 手动曝光 (同时切换为 Manual 模式)
    pub fn exposure(mut self, exposure_us: u32, gain: f32) -> Self {
        self.exposure_mode = ExposureMode::Manual;
        self.exposure_us = exposure_us;
        self.gain = gain;
        self
    }

    pub fn auto_exposure(mut self) -> Self {
        self.exposure_mode = ExposureMode::Auto;
        self
    }

    pub fn white_balance(mut self, kelvin: u32) -> Self {
        self.white_balance = WhiteBalanceMode::Manual;
        self.white_balance_k = kelvin;
        self
    }

    pub fn depth_range(mut self, min_mm: u32, max_mm: u32) -> Self {
        self.depth_range = DepthRange { min_mm, max_mm };
        self
    }

    pub fn roi(mut self, roi: Roi) -> Self {
        self.roi = roi;
        self
    }

    pub fn filter(mut self, filter: FilterMode) -> Self {
        self.filter = filter;
        self
    }

    pub fn fill_hole(mut self, policy: FillHolePolicy) -> Self {
        self.fill_hole = policy;
        self
    }

    pub fn hdr(mut self, hdr: HdrMode) -> Self {
        self.hdr = hdr;
        self
    }

    /// 把某个 HDR 档位的曝光/增益写入配置 (手动曝光)
    pub fn with_level(&self, level: HdrLevel) -> Self {
        self.clone().exposure(level.exposure_us, level.gain)
    }

    /// 按设备边界校验，失败时指出第一个不合法的字段
    pub fn validate(&self, limits: &DeviceLimits) -> Result<(), ParamError> {
        let invalid = |field: ParamField| {
            tracing::debug!(target: "depthcam::params", "Rejected stream configuration: invalid {:?}", field);
            Err(ParamError::InvalidParameter(field))
        };

        if !limits.resolutions.contains(&self.resolution) {
            return invalid(ParamField::Resolution);
        }
        if self.data_types.is_empty() || !limits.data_types.contains(self.data_types) {
            return invalid(ParamField::DataTypes);
        }
        if !limits.exposure_us.contains(self.exposure_us) {
            return invalid(ParamField::ExposureTime);
        }
        if !self.gain.is_finite() || !limits.gain.contains(self.gain) {
            return invalid(ParamField::Gain);
        }
        if self.white_balance == WhiteBalanceMode::Manual
            && !limits.white_balance_k.contains(self.white_balance_k)
        {
            return invalid(ParamField::WhiteBalance);
        }
        let range = self.depth_range;
        if range.min_mm >= range.max_mm
            || !limits.depth_range_mm.contains(range.min_mm)
            || !limits.depth_range_mm.contains(range.max_mm)
        {
            return invalid(ParamField::DepthRange);
        }
        if !self.roi.is_valid() {
            return invalid(ParamField::Roi);
        }
        if let HdrMode::Manual(levels) = &self.hdr {
            let in_bounds = levels.iter().all(|l| {
                limits.exposure_us.contains(l.exposure_us)
                    && l.gain.is_finite()
                    && limits.gain.contains(l.gain)
            });
            if levels.is_empty() || !in_bounds {
                return invalid(ParamField::HdrLevels);
            }
        }
        Ok(())
    }

    /// 展开为设备参数，顺序与 `ParamKey` 一致
    pub fn to_params(&self) -> Vec<(ParamKey, ParamValue)> {
        vec![
            (ParamKey::Resolution, ParamValue::Resolution(self.resolution)),
            (ParamKey::DataTypes, ParamValue::DataTypes(self.data_types)),
            (
                ParamKey::ExposureMode,
                ParamValue::ExposureMode(self.exposure_mode),
            ),
            (ParamKey::ExposureTime, ParamValue::Micros(self.exposure_us)),
            (ParamKey::Gain, ParamValue::Gain(self.gain)),
            (
                ParamKey::WhiteBalanceMode,
                ParamValue::WhiteBalance(self.white_balance),
            ),
            (
                ParamKey::WhiteBalanceTemperature,
                ParamValue::Kelvin(self.white_balance_k),
            ),
            (ParamKey::DepthRange, ParamValue::DepthRange(self.depth_range)),
            (ParamKey::Roi, ParamValue::Roi(self.roi)),
            (ParamKey::Filter, ParamValue::Filter(self.filter)),
            (ParamKey::FillHole, ParamValue::FillHole(self.fill_hole)),
            (ParamKey::Hdr, ParamValue::Hdr(self.hdr.clone())),
        ]
    }

    /// 与 `other` 相比发生变化的参数 (`other` 为 None 时全部视为变化)
    pub fn changed_params(&self, other: Option<&StreamConfig>) -> Vec<(ParamKey, ParamValue)> {
        let before: BTreeMap<ParamKey, ParamValue> = other
            .map(|c| c.to_params().into_iter().collect())
            .unwrap_or_default();
        self.to_params()
            .into_iter()
            .filter(|(key, value)| before.get(key) != Some(value))
            .collect()
    }

    /// 从设备读回的参数重建配置；任何键缺失或类型不符时返回 None
    pub fn from_params<'a, I>(params: I) -> Option<StreamConfig>
    where
        I: IntoIterator<Item = &'a (ParamKey, ParamValue)>,
    {
        let map: BTreeMap<ParamKey, &ParamValue> =
            params.into_iter().map(|(k, v)| (*k, v)).collect();
        let get = |key: ParamKey| map.get(&key).copied();

        Some(StreamConfig {
            resolution: match get(ParamKey::Resolution)? {
                ParamValue::Resolution(v) => *v,
                _ => return None,
            },
            data_types: match get(ParamKey::DataTypes)? {
                ParamValue::DataTypes(v) => *v,
                _ => return None,
            },
            exposure_mode: match get(ParamKey::ExposureMode)? {
                ParamValue::ExposureMode(v) => *v,
                _ => return None,
            },
            exposure_us: match get(ParamKey::ExposureTime)? {
                ParamValue::Micros(v) => *v,
                _ => return None,
            },
            gain: match get(ParamKey::Gain)? {
                ParamValue::Gain(v) => *v,
                _ => return None,
            },
            white_balance: match get(ParamKey::WhiteBalanceMode)? {
                ParamValue::WhiteBalance(v) => *v,
                _ => return None,
            },
            white_balance_k: match get(ParamKey::WhiteBalanceTemperature)? {
                ParamValue::Kelvin(v) => *v,
                _ => return None,
            },
            depth_range: match get(ParamKey::DepthRange)? {
                ParamValue::DepthRange(v) => *v,
                _ => return None,
            },
            roi: match get(ParamKey::Roi)? {
                ParamValue::Roi(v) => *v,
                _ => return None,
            },
            filter: match get(ParamKey::Filter)? {
                ParamValue::Filter(v) => *v,
                _ => return None,
            },
            fill_hole: match get(ParamKey::FillHole)? {
                ParamValue::FillHole(v) => *v,
                _ => return None,
            },
            hdr: match get(ParamKey::Hdr)? {
                ParamValue::Hdr(v) => v.clone(),
                _ => return None,
            },
        })
    }
}
