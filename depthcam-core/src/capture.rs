use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::HdrLevel;
use crate::error::CaptureError;
use crate::pixel_format::{DataType, DataTypes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{:04}", self.0)
    }
}

/// 采集方式
///
/// 三种方式共享同一个作业生命周期，只在完成/融合策略上不同。
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureMode {
    /// 每种请求的数据类型各一帧
    Single,
    /// 每种请求的数据类型各 N 帧
    Multiple { count: u32 },
    /// 多曝光融合；`levels` 为空时取流配置中的手动档位或自动档位表
    Hdr { levels: Option<Vec<HdrLevel>> },
}

impl CaptureMode {
    pub fn kind(&self) -> CaptureKind {
        match self {
            CaptureMode::Single => CaptureKind::Single,
            CaptureMode::Multiple { .. } => CaptureKind::Multiple,
            CaptureMode::Hdr { .. } => CaptureKind::Hdr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Single,
    Multiple,
    Hdr,
}

/// 保存编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum SaveFormat {
    /// RGB/IR 为 8-bit PNG，深度为 16-bit PNG，点云为 PLY
    #[default]
    Png,
    /// 原始负载
    Raw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub mode: CaptureMode,
    pub data_types: DataTypes,
    /// None 时使用引擎配置的默认值
    pub save_format: Option<SaveFormat>,
    /// 丢帧上限，None 表示不限 (只上报)
    pub max_drops: Option<u64>,
    /// 取消时是否保存并交付已采到的帧
    pub deliver_partial: bool,
    /// 覆盖单帧等待超时
    pub frame_timeout: Option<Duration>,
}

impl CaptureRequest {
    pub fn new(mode: CaptureMode, data_types: impl Into<DataTypes>) -> Self {
        Self {
            mode,
            data_types: data_types.into(),
            save_format: None,
            max_drops: None,
            deliver_partial: false,
            frame_timeout: None,
        }
    }

    pub fn single(data_types: impl Into<DataTypes>) -> Self {
        Self::new(CaptureMode::Single, data_types)
    }

    pub fn multiple(count: u32, data_types: impl Into<DataTypes>) -> Self {
        Self::new(CaptureMode::Multiple { count }, data_types)
    }

    pub fn hdr(levels: Option<Vec<HdrLevel>>, data_types: impl Into<DataTypes>) -> Self {
        Self::new(CaptureMode::Hdr { levels }, data_types)
    }

    pub fn save_format(mut self, format: SaveFormat) -> Self {
        self.save_format = Some(format);
        self
    }

    pub fn max_drops(mut self, threshold: u64) -> Self {
        self.max_drops = Some(threshold);
        self
    }

    pub fn deliver_partial(mut self, deliver: bool) -> Self {
        self.deliver_partial = deliver;
        self
    }

    pub fn frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// 采集作业的快照
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureJob {
    pub id: JobId,
    pub kind: CaptureKind,
    pub data_types: DataTypes,
    pub save_format: SaveFormat,
    /// 每种类型需要的帧数 (HDR 为档位数)
    pub requested: u32,
    /// 已采到的帧数 (所有类型合计)
    pub progress: u32,
    pub dropped: u64,
    pub status: JobStatus,
}

/// 一帧的保存记录
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub data_type: DataType,
    pub sequence: u64,
    pub device_index: u64,
    pub path: PathBuf,
}

/// HDR 单个档位的采集结果
#[derive(Debug, Clone, PartialEq)]
pub struct HdrComponent {
    pub level: HdrLevel,
    pub frames: Vec<CapturedFrame>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HdrOutcome {
    /// 与配置的档位一一对应，按档位顺序排列
    pub components: Vec<HdrComponent>,
    pub merged: Vec<CapturedFrame>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutput {
    pub job: JobId,
    pub frames: Vec<CapturedFrame>,
    pub dropped: u64,
    pub hdr: Option<HdrOutcome>,
}

impl CaptureOutput {
    pub fn saved_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.frames.iter().map(|f| f.path.clone()).collect();
        if let Some(hdr) = &self.hdr {
            paths.extend(hdr.merged.iter().map(|f| f.path.clone()));
        }
        paths
    }

    pub fn frame_count(&self, data_type: DataType) -> usize {
        self.frames
            .iter()
            .filter(|f| f.data_type == data_type)
            .count()
    }
}

pub type CaptureResult = std::result::Result<CaptureOutput, CaptureError>;
