use std::time::Duration;

use async_trait::async_trait;

use crate::control::{DeviceLimits, ParamKey, ParamValue};
use crate::error::{DeviceError, Result};
use crate::frame::RawFrame;

/// 设备基本信息 (枚举阶段可得)
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// 对用户友好的显示名称
    pub name: String,

    /// 唯一硬件 ID，用于 Driver::open 的参数
    pub id: String,

    /// 后端类型标识 (e.g. "SIM", "USB")
    pub backend: String,
}

/// 设备身份 (打开后可读)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    pub serial: String,
    pub model: String,
    pub firmware_version: String,
    /// 深度算法版本
    pub algorithm_version: String,
    pub sdk_version: String,
}

/// 一次拉帧的结果
#[derive(Debug)]
pub enum PullOutcome {
    Frame(RawFrame),
    /// 超时内没有新帧
    Timeout,
    Fault(DeviceError),
}

/// 热插拔回调：设备被意外拔出时由驱动调用 (可能在任意线程)
pub type RemovalCallback = Box<dyn Fn() + Send + Sync>;

/// 1. 驱动入口：设备枚举与打开
#[async_trait]
pub trait Driver: Send + Sync {
    /// 扫描总线，返回设备列表
    fn probe(&self) -> Result<Vec<DeviceInfo>>;

    /// 打开设备，返回独占的设备句柄
    async fn open(&self, id: &str) -> Result<Box<dyn DeviceHandle>>;
}

/// 2. 设备句柄：参数面 + 数据面
///
/// 句柄会被 Stream Engine 与 Parameter Controller 并发使用，因此所有方法都取 `&self`。
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    fn identity(&self) -> DeviceIdentity;

    fn limits(&self) -> DeviceLimits;

    fn set_parameter(&self, key: ParamKey, value: ParamValue) -> Result<()>;

    fn get_parameter(&self, key: ParamKey) -> Result<ParamValue>;

    /// 启动采集 (分配缓冲区，开始 DMA)
    async fn start_stream(&self) -> Result<()>;

    /// 停止采集 (释放带宽)
    async fn stop_stream(&self) -> Result<()>;

    /// 获取下一帧，最多等待 `timeout`
    async fn pull_frame(&self, timeout: Duration) -> PullOutcome;

    /// 释放设备
    fn close(&self) -> Result<()>;

    /// 注册热插拔回调，后注册的覆盖先注册的
    fn set_removal_callback(&self, callback: RemovalCallback);
}

impl From<DeviceError> for PullOutcome {
    fn from(e: DeviceError) -> Self {
        PullOutcome::Fault(e)
    }
}
