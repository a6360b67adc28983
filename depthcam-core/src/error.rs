use thiserror::Error;

use crate::control::ParamKey;

/// 硬件边界错误 (驱动/SDK 层)
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device busy: Exclusive access required")]
    DeviceBusy,

    #[error("Frame dropped due to ring buffer overflow")]
    BufferOverflow,

    #[error("Device did not respond in time")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Parameter {0:?} is not supported by this device")]
    UnsupportedParameter(ParamKey),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// 是否值得重试 (拉流阶段的瞬时错误)
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Timeout | DeviceError::Protocol(_))
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// 建立连接失败的分类，供状态上报使用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    NotFound,
    AlreadyConnected,
    Timeout,
    DeviceBusy,
    Protocol,
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("No camera found")]
    NoDevices,

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Session already connected to {0}")]
    AlreadyConnected(String),

    #[error("Timed out while opening device")]
    Timeout,

    #[error("Device busy")]
    DeviceBusy,

    #[error("Protocol error while connecting: {0}")]
    Protocol(#[source] DeviceError),
}

impl ConnectError {
    pub fn kind(&self) -> ConnectFailure {
        match self {
            ConnectError::NoDevices | ConnectError::NotFound(_) => ConnectFailure::NotFound,
            ConnectError::AlreadyConnected(_) => ConnectFailure::AlreadyConnected,
            ConnectError::Timeout => ConnectFailure::Timeout,
            ConnectError::DeviceBusy => ConnectFailure::DeviceBusy,
            ConnectError::Protocol(_) => ConnectFailure::Protocol,
        }
    }
}

impl From<DeviceError> for ConnectError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::NotFound(id) => ConnectError::NotFound(id),
            DeviceError::DeviceBusy => ConnectError::DeviceBusy,
            DeviceError::Timeout => ConnectError::Timeout,
            other => ConnectError::Protocol(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum DisconnectError {
    #[error("Session is not connected")]
    NotConnected,

    /// 句柄仍然被释放，只是有操作没有在时限内退出
    #[error("Active operations did not stop in time; handle released anyway")]
    Timeout,

    #[error("Failed to close device: {0}")]
    Device(#[source] DeviceError),
}

/// 参数校验失败时指出具体字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamField {
    Resolution,
    DataTypes,
    ExposureTime,
    Gain,
    WhiteBalance,
    DepthRange,
    Roi,
    HdrLevels,
}

#[derive(Error, Debug)]
pub enum ParamError {
    #[error("Invalid parameter: {0:?}")]
    InvalidParameter(ParamField),

    #[error("Session is not connected")]
    NotConnected,

    /// 写入失败，已回滚的参数保持原值
    #[error("Device rejected {key:?}; configuration rolled back")]
    Device {
        key: ParamKey,
        #[source]
        source: DeviceError,
    },

    #[error("Rollback of {key:?} failed; device configuration is unknown")]
    RollbackFailed {
        key: ParamKey,
        #[source]
        source: DeviceError,
    },

    #[error("Timed out waiting for a frame boundary")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Session is not connected")]
    NotConnected,

    #[error(transparent)]
    Parameter(#[from] ParamError),

    #[error("Device fault: {0}")]
    DeviceFault(#[source] DeviceError),

    #[error("Device buffers exhausted")]
    BufferExhausted,

    #[error("Operation not valid while stream is {0:?}")]
    InvalidState(crate::state::StreamState),

    #[error("Acquisition loop did not stop in time")]
    Timeout,
}

impl StreamError {
    /// 把拉流阶段的硬件错误归类
    pub fn from_pull(e: DeviceError) -> Self {
        match e {
            DeviceError::BufferOverflow => StreamError::BufferExhausted,
            other => StreamError::DeviceFault(other),
        }
    }
}

/// 采集失败的分类，供状态上报使用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFailure {
    Busy,
    NotConnected,
    StreamNotRunning,
    InvalidRequest,
    Timeout,
    DropThresholdExceeded,
    StreamStopped,
    HdrLevelTimeout,
    Parameter,
    Cancelled,
    Save,
    WorkerLost,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Another capture job is running")]
    Busy,

    #[error("Session is not connected")]
    NotConnected,

    #[error("Stream is not running")]
    StreamNotRunning,

    #[error("Invalid capture request: {0}")]
    InvalidRequest(&'static str),

    /// `dropped` 已包含未采到的帧数
    #[error("Timed out after {collected} frames ({missing} missing, {dropped} dropped)")]
    Timeout {
        collected: usize,
        missing: usize,
        dropped: u64,
    },

    #[error("Dropped {dropped} frames, threshold is {threshold}")]
    DropThresholdExceeded {
        dropped: u64,
        threshold: u64,
        missing: usize,
    },

    #[error("Stream stopped with {missing} frames missing")]
    StreamStopped { missing: usize, dropped: u64 },

    #[error("HDR level {level} did not produce a settled frame in time")]
    HdrLevelTimeout { level: usize },

    #[error(transparent)]
    Parameter(#[from] ParamError),

    #[error("Capture cancelled")]
    Cancelled {
        /// 调用方请求了部分结果时，已采到的帧的保存结果
        partial: Option<Box<crate::capture::CaptureOutput>>,
    },

    #[error("Failed to save captured frame: {0}")]
    Save(#[source] std::io::Error),

    #[error("Capture worker terminated unexpectedly")]
    WorkerLost,
}

impl CaptureError {
    pub fn kind(&self) -> CaptureFailure {
        match self {
            CaptureError::Busy => CaptureFailure::Busy,
            CaptureError::NotConnected => CaptureFailure::NotConnected,
            CaptureError::StreamNotRunning => CaptureFailure::StreamNotRunning,
            CaptureError::InvalidRequest(_) => CaptureFailure::InvalidRequest,
            CaptureError::Timeout { .. } => CaptureFailure::Timeout,
            CaptureError::DropThresholdExceeded { .. } => CaptureFailure::DropThresholdExceeded,
            CaptureError::StreamStopped { .. } => CaptureFailure::StreamStopped,
            CaptureError::HdrLevelTimeout { .. } => CaptureFailure::HdrLevelTimeout,
            CaptureError::Parameter(_) => CaptureFailure::Parameter,
            CaptureError::Cancelled { .. } => CaptureFailure::Cancelled,
            CaptureError::Save(_) => CaptureFailure::Save,
            CaptureError::WorkerLost => CaptureFailure::WorkerLost,
        }
    }

    /// 失败时上报的丢帧数 (包含未采到的帧)
    pub fn dropped(&self) -> Option<u64> {
        match self {
            CaptureError::Timeout { dropped, .. }
            | CaptureError::DropThresholdExceeded { dropped, .. }
            | CaptureError::StreamStopped { dropped, .. } => Some(*dropped),
            _ => None,
        }
    }
}
