use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use depthcam_core::config::{ExposureMode, Resolution, StreamConfig};
use depthcam_core::control::{DeviceLimits, ParamKey, ParamValue, ValueRange};
use depthcam_core::error::{DeviceError, Result};
use depthcam_core::frame::{FrameMetadata, RawFrame};
use depthcam_core::pixel_format::{DataType, DataTypes};
use depthcam_core::traits::{DeviceHandle, DeviceIdentity, DeviceInfo, PullOutcome, RemovalCallback};

use crate::pattern::{Scene, AUTO_EXPOSURE_US};

/// 注入的持续性拉流故障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// 协议错误 (可重试)
    Protocol,
    /// 设备缓冲区耗尽
    Overflow,
}

#[derive(Debug, Default)]
struct Faults {
    unplugged: bool,
    busy: bool,
    stalled: bool,
    fault: Option<InjectedFault>,
    timeouts: u32,
    gap: u64,
    burst: u32,
    rejected: Option<ParamKey>,
}

#[derive(Debug, Default)]
struct DeviceState {
    open: bool,
    streaming: bool,
    params: BTreeMap<ParamKey, ParamValue>,
    pending: VecDeque<RawFrame>,
    indices: BTreeMap<DataType, u64>,
    tick: u64,
}

struct Shared {
    info: DeviceInfo,
    identity: DeviceIdentity,
    limits: DeviceLimits,
    frame_interval: Duration,
    open_delay: Duration,
    faults: Mutex<Faults>,
    device: Mutex<DeviceState>,
    removal: Mutex<Option<RemovalCallback>>,
    writes: Mutex<Vec<(ParamKey, ParamValue)>>,
}

// 测试代码里 panic 后锁可能中毒，模拟设备继续使用内部数据
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 一台虚拟深度相机
///
/// 克隆得到的是同一台设备的另一个控制柄：测试持有一份用来注入故障，
/// 驱动持有一份用来打开设备。
#[derive(Clone)]
pub struct SimCamera {
    shared: Arc<Shared>,
}

impl fmt::Debug for SimCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCamera")
            .field("id", &self.shared.info.id)
            .field("frame_interval", &self.shared.frame_interval)
            .finish_non_exhaustive()
    }
}

/// 模拟设备的默认参数边界
pub fn default_limits() -> DeviceLimits {
    DeviceLimits {
        resolutions: vec![
            Resolution::new(320, 240),
            Resolution::new(640, 480),
            Resolution::new(1280, 720),
            Resolution::new(1280, 800),
        ],
        data_types: DataTypes::all(),
        exposure_us: ValueRange::new(20, 200_000),
        gain: ValueRange::new(1.0, 16.0),
        white_balance_k: ValueRange::new(2_800, 6_500),
        depth_range_mm: ValueRange::new(100, 10_000),
    }
}

/// 构造模拟相机的参数
#[derive(Debug, Clone)]
pub struct SimCameraBuilder {
    id: String,
    name: String,
    identity: DeviceIdentity,
    limits: DeviceLimits,
    frame_interval: Duration,
    open_delay: Duration,
}

impl SimCameraBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// 帧间隔，默认 33ms (30 fps)
    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// 打开设备耗时，用于模拟连接超时
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn build(self) -> SimCamera {
        SimCamera {
            shared: Arc::new(Shared {
                info: DeviceInfo {
                    name: self.name,
                    id: self.id,
                    backend: "SIM".to_string(),
                },
                identity: self.identity,
                limits: self.limits,
                frame_interval: self.frame_interval,
                open_delay: self.open_delay,
                faults: Mutex::new(Faults::default()),
                device: Mutex::new(DeviceState::default()),
                removal: Mutex::new(None),
                writes: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl SimCamera {
    pub fn builder(id: impl Into<String>) -> SimCameraBuilder {
        let id = id.into();
        SimCameraBuilder {
            name: format!("Simulated Depth Camera ({id})"),
            identity: DeviceIdentity {
                serial: format!("SIM-{id}"),
                model: "SIM-D400".to_string(),
                firmware_version: "1.2.0".to_string(),
                algorithm_version: "3.1.4".to_string(),
                sdk_version: depthcam_core::VERSION.to_string(),
            },
            id,
            limits: default_limits(),
            frame_interval: Duration::from_millis(33),
            open_delay: Duration::ZERO,
        }
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self::builder(id).build()
    }

    pub fn info(&self) -> DeviceInfo {
        self.shared.info.clone()
    }

    pub fn id(&self) -> &str {
        &self.shared.info.id
    }

    // --- 故障注入 ---

    /// 被其它进程占用
    pub fn set_busy(&self, busy: bool) {
        lock(&self.shared.faults).busy = busy;
    }

    /// 模拟物理拔出：触发热插拔回调，之后所有操作返回 Disconnected
    pub fn unplug(&self) {
        lock(&self.shared.faults).unplugged = true;
        {
            let mut device = lock(&self.shared.device);
            device.open = false;
            device.streaming = false;
            device.pending.clear();
        }
        tracing::info!(target: "depthcam::sim", "Simulated camera {} unplugged", self.id());
        // 回调在锁外执行
        let callback = lock(&self.shared.removal).take();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn replug(&self) {
        lock(&self.shared.faults).unplugged = false;
    }

    /// 卡死：每次拉帧都耗尽超时
    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.shared.faults).stalled = stalled;
    }

    /// 接下来 `count` 次拉帧超时
    pub fn fail_next_pulls(&self, count: u32) {
        lock(&self.shared.faults).timeouts = count;
    }

    /// 下一组帧的设备计数跳过 `frames` 个号 (模拟传输丢帧)
    pub fn inject_gap(&self, frames: u64) {
        lock(&self.shared.faults).gap = frames;
    }

    /// 下一次出帧时一次产生 `framesets` 组帧，拉帧端会连续拿到它们 (模拟积压后的突发)
    pub fn burst(&self, framesets: u32) {
        lock(&self.shared.faults).burst = framesets;
    }

    pub fn set_fault(&self, fault: Option<InjectedFault>) {
        lock(&self.shared.faults).fault = fault;
    }

    /// 拒绝写入某个参数
    pub fn reject_parameter(&self, key: Option<ParamKey>) {
        lock(&self.shared.faults).rejected = key;
    }

    // --- 观测 ---

    pub fn is_open(&self) -> bool {
        lock(&self.shared.device).open
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.shared.device).streaming
    }

    pub fn parameter(&self, key: ParamKey) -> Option<ParamValue> {
        lock(&self.shared.device).params.get(&key).cloned()
    }

    /// 设备当前参数还原出的配置
    pub fn current_config(&self) -> Option<StreamConfig> {
        let device = lock(&self.shared.device);
        let params: Vec<_> = device
            .params
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        StreamConfig::from_params(&params)
    }

    /// 按时间顺序记录的所有成功写入
    pub fn parameter_writes(&self) -> Vec<(ParamKey, ParamValue)> {
        lock(&self.shared.writes).clone()
    }

    pub fn clear_parameter_writes(&self) {
        lock(&self.shared.writes).clear();
    }

    pub(crate) fn open_handle(&self) -> Result<SimHandle> {
        {
            let faults = lock(&self.shared.faults);
            if faults.unplugged {
                return Err(DeviceError::NotFound(self.id().to_string()));
            }
            if faults.busy {
                return Err(DeviceError::DeviceBusy);
            }
        }
        let mut device = lock(&self.shared.device);
        if device.open {
            return Err(DeviceError::DeviceBusy);
        }
        *device = DeviceState {
            open: true,
            params: StreamConfig::new().to_params().into_iter().collect(),
            ..Default::default()
        };
        tracing::info!(target: "depthcam::sim", "Simulated camera {} opened", self.id());
        Ok(SimHandle {
            camera: self.clone(),
        })
    }

    pub(crate) fn open_delay(&self) -> Duration {
        self.shared.open_delay
    }

    pub(crate) fn is_unplugged(&self) -> bool {
        lock(&self.shared.faults).unplugged
    }
}

/// 打开后的设备句柄
pub struct SimHandle {
    camera: SimCamera,
}

impl fmt::Debug for SimHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimHandle")
            .field("id", &self.camera.id())
            .finish()
    }
}

fn value_matches(key: ParamKey, value: &ParamValue) -> bool {
    matches!(
        (key, value),
        (ParamKey::Resolution, ParamValue::Resolution(_))
            | (ParamKey::DataTypes, ParamValue::DataTypes(_))
            | (ParamKey::ExposureMode, ParamValue::ExposureMode(_))
            | (ParamKey::ExposureTime, ParamValue::Micros(_))
            | (ParamKey::Gain, ParamValue::Gain(_))
            | (ParamKey::WhiteBalanceMode, ParamValue::WhiteBalance(_))
            | (ParamKey::WhiteBalanceTemperature, ParamValue::Kelvin(_))
            | (ParamKey::DepthRange, ParamValue::DepthRange(_))
            | (ParamKey::Roi, ParamValue::Roi(_))
            | (ParamKey::Filter, ParamValue::Filter(_))
            | (ParamKey::FillHole, ParamValue::FillHole(_))
            | (ParamKey::Hdr, ParamValue::Hdr(_))
    )
}

impl SimHandle {
    fn shared(&self) -> &Shared {
        &self.camera.shared
    }

    /// 生成一组帧 (每种启用的数据类型一帧) 放入待取队列
    fn produce_frameset(&self, device: &mut DeviceState, gap: u64) {
        let params: Vec<_> = device
            .params
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        let Some(config) = StreamConfig::from_params(&params) else {
            tracing::warn!(target: "depthcam::sim", "Incomplete parameter set, no frame produced");
            return;
        };

        let (exposure_us, gain) = match config.exposure_mode {
            ExposureMode::Manual => (config.exposure_us, config.gain),
            ExposureMode::Auto => (AUTO_EXPOSURE_US, 1.0),
        };
        let scene = Scene {
            resolution: config.resolution,
            exposure_us,
            gain,
            depth_range: config.depth_range,
            roi: config.roi,
        };

        device.tick += 1;
        let hw_timestamp_ns = device.tick * self.shared().frame_interval.as_nanos() as u64;

        for data_type in config.data_types.types() {
            let index = device.indices.entry(data_type).or_insert(0);
            *index += 1 + gap;
            device.pending.push_back(RawFrame {
                data_type,
                width: config.resolution.width,
                height: config.resolution.height,
                device_index: *index,
                hw_timestamp_ns,
                metadata: FrameMetadata {
                    actual_exposure_us: Some(exposure_us),
                    actual_gain: Some(gain),
                    merged_levels: None,
                },
                data: scene.synthesize(data_type),
            });
        }
    }

    /// 拔出或持续性故障：立即决定拉帧结果，不消耗任何注入计数
    fn persistent_fault(&self, faults: &Faults) -> Option<PullOutcome> {
        if faults.unplugged {
            return Some(PullOutcome::Fault(DeviceError::Disconnected(
                self.camera.id().to_string(),
            )));
        }
        match faults.fault {
            Some(InjectedFault::Protocol) => Some(PullOutcome::Fault(DeviceError::Protocol(
                "injected protocol error".into(),
            ))),
            Some(InjectedFault::Overflow) => Some(PullOutcome::Fault(DeviceError::BufferOverflow)),
            None => None,
        }
    }

    /// 拉帧前检查注入的故障；返回 Some 表示本次拉帧的结果已经确定
    fn injected(&self) -> Option<Injected> {
        let mut faults = lock(&self.shared().faults);
        if let Some(outcome) = self.persistent_fault(&faults) {
            return Some(Injected::Now(outcome));
        }
        if faults.stalled {
            return Some(Injected::WaitFullTimeout);
        }
        if faults.timeouts > 0 {
            faults.timeouts -= 1;
            return Some(Injected::WaitFullTimeout);
        }
        None
    }
}

enum Injected {
    Now(PullOutcome),
    WaitFullTimeout,
}

#[async_trait]
impl DeviceHandle for SimHandle {
    fn identity(&self) -> DeviceIdentity {
        self.shared().identity.clone()
    }

    fn limits(&self) -> DeviceLimits {
        self.shared().limits.clone()
    }

    fn set_parameter(&self, key: ParamKey, value: ParamValue) -> Result<()> {
        {
            let faults = lock(&self.shared().faults);
            if faults.unplugged {
                return Err(DeviceError::Disconnected(self.camera.id().to_string()));
            }
            if faults.rejected == Some(key) {
                return Err(DeviceError::Protocol(format!("{key:?} rejected by firmware")));
            }
        }
        if !value_matches(key, &value) {
            return Err(DeviceError::Protocol(format!(
                "value {value:?} does not fit {key:?}"
            )));
        }

        let mut device = lock(&self.shared().device);
        if !device.open {
            return Err(DeviceError::Protocol("device not open".into()));
        }
        if device.params.get(&key) == Some(&value) {
            return Ok(());
        }
        // 曝光或输出格式变化后，已缓存的旧帧作废
        if key.affects_exposure() || matches!(key, ParamKey::Resolution | ParamKey::DataTypes) {
            device.pending.clear();
        }
        device.params.insert(key, value.clone());
        drop(device);

        tracing::debug!(target: "depthcam::sim", "set {:?} = {:?}", key, value);
        lock(&self.shared().writes).push((key, value));
        Ok(())
    }

    fn get_parameter(&self, key: ParamKey) -> Result<ParamValue> {
        if self.camera.is_unplugged() {
            return Err(DeviceError::Disconnected(self.camera.id().to_string()));
        }
        lock(&self.shared().device)
            .params
            .get(&key)
            .cloned()
            .ok_or(DeviceError::UnsupportedParameter(key))
    }

    async fn start_stream(&self) -> Result<()> {
        if self.camera.is_unplugged() {
            return Err(DeviceError::Disconnected(self.camera.id().to_string()));
        }
        let mut device = lock(&self.shared().device);
        if !device.open {
            return Err(DeviceError::Protocol("device not open".into()));
        }
        device.streaming = true;
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        let mut device = lock(&self.shared().device);
        device.streaming = false;
        device.pending.clear();
        Ok(())
    }

    async fn pull_frame(&self, timeout: Duration) -> PullOutcome {
        match self.injected() {
            Some(Injected::Now(outcome)) => return outcome,
            Some(Injected::WaitFullTimeout) => {
                tokio::time::sleep(timeout).await;
                return PullOutcome::Timeout;
            }
            None => {}
        }

        {
            let mut device = lock(&self.shared().device);
            if !device.streaming {
                return PullOutcome::Fault(DeviceError::Protocol("stream not started".into()));
            }
            if let Some(frame) = device.pending.pop_front() {
                return PullOutcome::Frame(frame);
            }
        }

        let interval = self.shared().frame_interval;
        if interval > timeout {
            tokio::time::sleep(timeout).await;
            return PullOutcome::Timeout;
        }
        tokio::time::sleep(interval).await;

        // 等待期间可能被拔出或停流
        let fault = self.persistent_fault(&lock(&self.shared().faults));
        if let Some(outcome) = fault {
            return outcome;
        }
        let (gap, burst) = {
            let mut faults = lock(&self.shared().faults);
            (std::mem::take(&mut faults.gap), std::mem::take(&mut faults.burst))
        };
        let mut device = lock(&self.shared().device);
        if !device.streaming {
            return PullOutcome::Fault(DeviceError::Protocol("stream stopped".into()));
        }
        self.produce_frameset(&mut device, gap);
        for _ in 1..burst {
            self.produce_frameset(&mut device, 0);
        }
        match device.pending.pop_front() {
            Some(frame) => PullOutcome::Frame(frame),
            None => PullOutcome::Timeout,
        }
    }

    fn close(&self) -> Result<()> {
        let mut device = lock(&self.shared().device);
        device.open = false;
        device.streaming = false;
        device.pending.clear();
        drop(device);
        lock(&self.shared().removal).take();
        tracing::info!(target: "depthcam::sim", "Simulated camera {} closed", self.camera.id());
        Ok(())
    }

    fn set_removal_callback(&self, callback: RemovalCallback) {
        *lock(&self.shared().removal) = Some(callback);
    }
}
