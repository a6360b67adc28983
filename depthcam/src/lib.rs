pub mod camera;
pub mod capture;
pub mod config;
pub mod imgcodecs;
pub mod params;
pub mod session;
pub mod status;
pub mod stream;

// Re-export 核心类型，方便 prelude 使用
pub use camera::DepthCamera;
pub use depthcam_core;

/// 预置模块，用户可以通过 `use depthcam::prelude::*;` 导入常用项
pub mod prelude {
    pub use crate::camera::DepthCamera;
    pub use crate::capture::{CaptureHandle, CaptureTool};
    pub use crate::config::EngineConfig;
    pub use crate::imgcodecs::{FileSaveStrategy, MemorySaveStrategy, SaveStrategy, SaveTarget};
    pub use crate::params::ParameterController;
    pub use crate::session::{DeviceEvent, DeviceSession, SessionInfo};
    pub use crate::status::{StatusCode, StatusEvent, StatusReporter, StatusSubscription, StopReason};
    pub use crate::stream::{FrameConsumer, StreamEngine};
    pub use depthcam_core::prelude::*;
}
