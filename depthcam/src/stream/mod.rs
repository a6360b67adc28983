//! 预览流引擎
//!
//! 拉帧在独立的 tokio 任务里进行，与控制面 (start/pause/stop) 分离：
//! 控制面只修改 watch 通道和取消令牌，拉帧循环在每个等待点检查它们。

mod consumer;

pub use consumer::{ConsumerId, FrameConsumer};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use depthcam_core::config::StreamConfig;
use depthcam_core::error::{DeviceError, StreamError};
use depthcam_core::frame::Frame;
use depthcam_core::state::StreamState;
use depthcam_core::telemetry::StreamTelemetry;
use depthcam_core::traits::PullOutcome;

use crate::config::StreamPolicy;
use crate::params::ParameterController;
use crate::session::{DeviceLease, DeviceSession};
use crate::status::{StatusCode, StatusReporter, StopReason};
use consumer::ConsumerRegistry;

#[derive(Debug, Default)]
struct Stats {
    pulled: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
    faults: AtomicU64,
}

/// 拉帧任务与控制面共享的部分
struct Shared {
    policy: StreamPolicy,
    status: StatusReporter,
    state: watch::Sender<StreamState>,
    paused: watch::Sender<bool>,
    consumers: ConsumerRegistry,
    stats: Stats,
    active: RwLock<Option<StreamConfig>>,
    last_error: Mutex<Option<Arc<StreamError>>>,
}

impl Shared {
    fn set_state(&self, state: StreamState) {
        self.state.send_replace(state);
    }

    fn set_active(&self, config: Option<StreamConfig>) {
        *self.active.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    fn publish(&self, frame: Frame) {
        self.stats.pulled.fetch_add(1, Ordering::Relaxed);
        let delivery = self.consumers.publish(&frame);
        self.stats
            .delivered
            .fetch_add(delivery.delivered, Ordering::Relaxed);
        for (consumer, total) in delivery.dropped {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                target: "depthcam::stream",
                "Frame #{} dropped for {:?} (total {})",
                frame.sequence,
                consumer,
                total
            );
            self.status
                .report(StatusCode::FrameDropped { consumer, total });
        }
    }
}

/// 正在运行的拉帧任务
struct Acquisition {
    config: StreamConfig,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

enum Exit {
    Requested,
    Disconnected,
    Fault(StreamError),
}

pub struct StreamEngine {
    session: Arc<DeviceSession>,
    params: ParameterController,
    shared: Arc<Shared>,
    // 串行化 start/stop/pause/resume
    control: tokio::sync::Mutex<Option<Acquisition>>,
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("state", &self.state())
            .field("consumers", &self.shared.consumers.len())
            .field("telemetry", &self.telemetry())
            .finish()
    }
}

impl StreamEngine {
    pub fn new(
        session: Arc<DeviceSession>,
        params: ParameterController,
        policy: StreamPolicy,
        status: StatusReporter,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Stopped);
        let (paused, _) = watch::channel(false);
        Self {
            session,
            params,
            shared: Arc::new(Shared {
                policy,
                status,
                state,
                paused,
                consumers: ConsumerRegistry::default(),
                stats: Stats::default(),
                active: RwLock::new(None),
                last_error: Mutex::new(None),
            }),
            control: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    /// 注册一个新的帧消费者；`capacity` 为队列深度
    pub fn subscribe(&self, capacity: usize) -> FrameConsumer {
        self.shared.consumers.register(capacity)
    }

    /// 用引擎配置的默认队列深度注册消费者
    pub fn subscribe_default(&self) -> FrameConsumer {
        self.subscribe(self.shared.policy.consumer_queue_depth)
    }

    /// 预览流请求的配置 (仅在 Running/Paused 时有值)
    pub fn active_config(&self) -> Option<StreamConfig> {
        self.shared
            .active
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// 最近一次导致停流的故障
    pub fn last_error(&self) -> Option<Arc<StreamError>> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn telemetry(&self) -> StreamTelemetry {
        let stats = &self.shared.stats;
        StreamTelemetry {
            frames_pulled: stats.pulled.load(Ordering::Relaxed),
            frames_delivered: stats.delivered.load(Ordering::Relaxed),
            frames_dropped: stats.dropped.load(Ordering::Relaxed),
            pull_timeouts: stats.timeouts.load(Ordering::Relaxed),
            faults: stats.faults.load(Ordering::Relaxed),
        }
    }

    /// 启动预览
    ///
    /// 已经以相同配置运行时直接返回 (暂停中则恢复)；配置不同则先停后启。
    pub async fn start(&self, config: StreamConfig) -> Result<(), StreamError> {
        let mut control = self.control.lock().await;
        reap(&mut control);

        let lease = self.session.lease().ok_or(StreamError::NotConnected)?;
        config.validate(&lease.info().limits)?;

        if let Some(running) = control.as_ref() {
            if running.config == config {
                if self.state() == StreamState::Paused {
                    self.set_paused(false);
                }
                return Ok(());
            }
            tracing::info!(target: "depthcam::stream", "Configuration changed, restarting preview");
            if let Some(acquisition) = control.take() {
                self.halt(acquisition).await?;
            }
        }

        // 1. 下发配置
        self.shared.set_state(StreamState::Starting);
        self.shared.status.report(StatusCode::PreviewStarting);
        if let Err(e) = self.params.apply_on(&lease, &config).await {
            return Err(self.start_failed(e.into()));
        }

        // 2. 打开设备流
        if let Err(e) = lease.handle().start_stream().await {
            return Err(self.start_failed(StreamError::from_pull(e)));
        }

        // 3. 启动拉帧任务
        *self
            .shared
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = None;
        self.shared.paused.send_replace(false);
        self.shared.set_active(Some(config.clone()));
        self.shared.set_state(StreamState::Running);
        self.shared.status.report(StatusCode::PreviewStarted);
        tracing::info!(
            target: "depthcam::stream",
            "Preview started: {}x{} {:?}",
            config.resolution.width,
            config.resolution.height,
            config.data_types
        );

        let stop = lease.cancel_token().child_token();
        let task = tokio::spawn(acquire(self.shared.clone(), lease, stop.clone()));
        *control = Some(Acquisition { config, stop, task });
        Ok(())
    }

    fn start_failed(&self, err: StreamError) -> StreamError {
        tracing::warn!(target: "depthcam::stream", "Preview start failed: {}", err);
        self.shared.set_state(StreamState::Stopped);
        self.shared.status.report(StatusCode::PreviewStartFailed);
        err
    }

    /// 暂停拉帧，设备流保持打开
    pub async fn pause(&self) -> Result<(), StreamError> {
        let _control = self.control.lock().await;
        match self.state() {
            StreamState::Running => {
                self.set_paused(true);
                Ok(())
            }
            StreamState::Paused => Ok(()),
            other => Err(StreamError::InvalidState(other)),
        }
    }

    pub async fn resume(&self) -> Result<(), StreamError> {
        let _control = self.control.lock().await;
        match self.state() {
            StreamState::Paused => {
                self.set_paused(false);
                Ok(())
            }
            StreamState::Running => Ok(()),
            other => Err(StreamError::InvalidState(other)),
        }
    }

    fn set_paused(&self, paused: bool) {
        self.shared.paused.send_replace(paused);
        if paused {
            self.shared.set_state(StreamState::Paused);
            self.shared.status.report(StatusCode::PreviewPaused);
        } else {
            self.shared.set_state(StreamState::Running);
            self.shared.status.report(StatusCode::PreviewResumed);
        }
    }

    /// 停止预览并释放设备流；已经停止时直接返回
    pub async fn stop(&self) -> Result<(), StreamError> {
        let mut control = self.control.lock().await;
        match control.take() {
            Some(acquisition) => self.halt(acquisition).await,
            None => Ok(()),
        }
    }

    async fn halt(&self, acquisition: Acquisition) -> Result<(), StreamError> {
        let Acquisition { stop, task, .. } = acquisition;
        if !task.is_finished() {
            self.shared.set_state(StreamState::Stopping);
        }
        stop.cancel();

        let abort = task.abort_handle();
        match tokio::time::timeout(self.shared.policy.stop_timeout(), task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::error!(target: "depthcam::stream", "Acquisition task did not stop, aborting");
                abort.abort();
                self.shared.set_active(None);
                self.shared.set_state(StreamState::Stopped);
                Err(StreamError::Timeout)
            }
        }
    }
}

// 故障或断开后任务会自行结束，清掉残留的句柄
fn reap(control: &mut Option<Acquisition>) {
    if control.as_ref().map_or(false, |a| a.task.is_finished()) {
        *control = None;
    }
}

fn exit_reason(lease: &DeviceLease) -> Exit {
    if lease.is_cancelled() {
        Exit::Disconnected
    } else {
        Exit::Requested
    }
}

/// 拉帧循环
///
/// 每次 pull 都在帧闸内进行，并记录当时生效的配置代号；
/// 连续的瞬时错误超过重试上限后判定为故障。
async fn acquire(shared: Arc<Shared>, lease: DeviceLease, stop: CancellationToken) {
    let pull_timeout = shared.policy.pull_timeout();
    let max_retries = shared.policy.max_pull_retries;
    let mut paused = shared.paused.subscribe();
    let mut failures: u32 = 0;

    let exit = loop {
        if *paused.borrow_and_update() {
            tokio::select! {
                _ = stop.cancelled() => break exit_reason(&lease),
                changed = paused.changed() => {
                    if changed.is_err() {
                        break Exit::Requested;
                    }
                    continue;
                }
            }
        }

        let (outcome, generation) = {
            let _boundary = tokio::select! {
                _ = stop.cancelled() => break exit_reason(&lease),
                guard = lease.frame_boundary() => guard,
            };
            let generation = lease.generation();
            let outcome = tokio::select! {
                _ = stop.cancelled() => break exit_reason(&lease),
                outcome = lease.handle().pull_frame(pull_timeout) => outcome,
            };
            (outcome, generation)
        };

        let transient = match outcome {
            PullOutcome::Frame(raw) => {
                failures = 0;
                let frame = Frame::from_raw(raw, lease.next_sequence(), generation, Instant::now());
                shared.publish(frame);
                continue;
            }
            PullOutcome::Timeout => {
                shared.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                DeviceError::Timeout
            }
            PullOutcome::Fault(e) if e.is_transient() => e,
            PullOutcome::Fault(e) => break Exit::Fault(StreamError::from_pull(e)),
        };

        failures += 1;
        if failures > max_retries {
            break Exit::Fault(StreamError::DeviceFault(transient));
        }
        tracing::debug!(
            target: "depthcam::stream",
            "Transient pull failure ({}/{}): {}",
            failures,
            max_retries,
            transient
        );
    };

    if let Err(e) = lease.handle().stop_stream().await {
        tracing::debug!(target: "depthcam::stream", "stop_stream: {}", e);
    }
    shared.set_active(None);

    let reason = match exit {
        Exit::Requested => StopReason::Requested,
        Exit::Disconnected => StopReason::Disconnected,
        Exit::Fault(e) => {
            tracing::error!(target: "depthcam::stream", "Preview stopped by device fault: {}", e);
            shared.stats.faults.fetch_add(1, Ordering::Relaxed);
            *shared.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(e));
            shared.status.report(StatusCode::StreamFault);
            StopReason::Fault
        }
    };
    shared.paused.send_replace(false);
    shared.set_state(StreamState::Stopped);
    shared.status.report(StatusCode::PreviewStopped(reason));
    tracing::info!(target: "depthcam::stream", "Preview stopped ({:?})", reason);
}
