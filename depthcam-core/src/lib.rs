// 开启一些 Clippy 检查，保证代码质量
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

// 模块定义
pub mod capture;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod pixel_format;
pub mod state;
pub mod telemetry;
pub mod traits;

// 方便用户使用的 Prelude
pub mod prelude {
    pub use crate::capture::{
        CaptureJob, CaptureMode, CaptureOutput, CaptureRequest, CaptureResult, JobId, JobStatus,
        SaveFormat,
    };
    pub use crate::config::{HdrLevel, HdrMode, Roi, StreamConfig};
    pub use crate::control::{DeviceLimits, ParamKey, ParamValue};
    pub use crate::error::{
        CaptureError, ConnectError, DeviceError, DisconnectError, ParamError, StreamError,
    };
    pub use crate::frame::{Frame, FrameMetadata, RawFrame};
    pub use crate::pixel_format::{DataType, DataTypes};
    pub use crate::state::{SessionState, StreamState};
    pub use crate::traits::{DeviceHandle, DeviceIdentity, DeviceInfo, Driver, PullOutcome};
}

// 重新导出依赖中的关键类型，避免用户版本冲突
pub use async_trait::async_trait;
pub use bytes::Bytes;

// 版本与构建信息常量
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
