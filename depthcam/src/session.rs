//! 设备会话
//!
//! 会话持有设备句柄，负责连接/断开和热插拔。预览流、参数下发和采集作业
//! 都通过 [`DeviceLease`] 使用设备：断开时先取消连接的 CancellationToken，
//! 再等待所有租约归还，最后才关闭句柄。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::sync::{broadcast, mpsc, watch, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

use depthcam_core::config::StreamConfig;
use depthcam_core::control::DeviceLimits;
use depthcam_core::error::{ConnectError, DisconnectError};
use depthcam_core::state::SessionState;
use depthcam_core::traits::{DeviceHandle, DeviceIdentity, DeviceInfo, Driver};

use crate::config::SessionConfig;
use crate::status::{StatusCode, StatusReporter};

/// 连接成功后缓存的设备信息
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub device_id: String,
    pub identity: DeviceIdentity,
    pub limits: DeviceLimits,
}

/// 会话广播的设备通知
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected(SessionInfo),
    Disconnected { device_id: String },
    /// 设备被意外拔出，每次连接最多出现一次
    Removed { device_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Requested,
    Removed,
}

/// 一次连接的全部状态，断开后整体丢弃
struct Connection {
    handle: Arc<dyn DeviceHandle>,
    info: SessionInfo,
    cancel: CancellationToken,
    // 拉帧循环在每次 pull 期间持有；参数下发拿到它就意味着处于帧边界
    frame_gate: tokio::sync::Mutex<()>,
    active: RwLock<Option<StreamConfig>>,
    generation: AtomicU64,
    sequence: AtomicU64,
    // 每个租约持有一个 Sender 克隆，全部 drop 后 Receiver 返回 None
    ops_tx: Mutex<Option<mpsc::Sender<()>>>,
    ops_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// 对已连接设备的一次计数占用
///
/// 租约存活期间 `disconnect()` 不会关闭句柄 (超时除外)。
#[derive(Clone)]
pub struct DeviceLease {
    conn: Arc<Connection>,
    _guard: mpsc::Sender<()>,
}

impl fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLease")
            .field("device_id", &self.conn.info.device_id)
            .field("generation", &self.generation())
            .field("cancelled", &self.conn.cancel.is_cancelled())
            .finish()
    }
}

impl DeviceLease {
    pub fn handle(&self) -> &dyn DeviceHandle {
        self.conn.handle.as_ref()
    }

    pub fn info(&self) -> &SessionInfo {
        &self.conn.info
    }

    /// 连接级的取消令牌；断开或拔出时触发
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.conn.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.conn.cancel.is_cancelled()
    }

    /// 当前生效的参数代号
    pub fn generation(&self) -> u64 {
        self.conn.generation.load(Ordering::Acquire)
    }

    pub fn active_config(&self) -> Option<StreamConfig> {
        self.conn
            .active
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// 两个租约是否属于同一次连接
    pub fn same_connection(&self, other: &DeviceLease) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }

    pub(crate) async fn frame_boundary(&self) -> MutexGuard<'_, ()> {
        self.conn.frame_gate.lock().await
    }

    /// 必须在持有帧边界时调用
    pub(crate) fn commit(&self, config: Option<StreamConfig>) -> u64 {
        *self
            .conn
            .active
            .write()
            .unwrap_or_else(|p| p.into_inner()) = config;
        self.conn.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.conn.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// 设备会话
///
/// 通过 `Arc` 显式传给参数控制器、预览流和采集工具，不存在进程级的全局句柄。
pub struct DeviceSession {
    driver: Arc<dyn Driver>,
    policy: SessionConfig,
    status: StatusReporter,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<DeviceEvent>,
    // 串行化连接/断开/拔出处理
    transition: tokio::sync::Mutex<()>,
    current: RwLock<Option<Arc<Connection>>>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("state", &self.state())
            .field("device_id", &self.info().map(|i| i.device_id))
            .finish()
    }
}

impl DeviceSession {
    pub fn new(driver: Arc<dyn Driver>, policy: SessionConfig, status: StatusReporter) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            driver,
            policy,
            status,
            state,
            events,
            transition: tokio::sync::Mutex::new(()),
            current: RwLock::new(None),
        })
    }

    pub fn probe(&self) -> depthcam_core::error::Result<Vec<DeviceInfo>> {
        self.driver.probe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    pub fn info(&self) -> Option<SessionInfo> {
        self.connection().map(|c| c.info.clone())
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// 申请租约；未连接或正在断开时返回 None
    pub fn lease(&self) -> Option<DeviceLease> {
        let conn = self.connection()?;
        if conn.cancel.is_cancelled() {
            return None;
        }
        let guard = lock(&conn.ops_tx).clone()?;
        Some(DeviceLease {
            conn,
            _guard: guard,
        })
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// 连接配置的设备；没有配置时连接枚举到的第一台
    pub async fn connect(self: &Arc<Self>) -> Result<SessionInfo, ConnectError> {
        let _transition = self.transition.lock().await;

        if let Some(conn) = self.connection() {
            return match &self.policy.device_id {
                Some(id) if *id != conn.info.device_id => {
                    Err(self.reject_connect(ConnectError::AlreadyConnected(conn.info.device_id.clone())))
                }
                _ => Ok(conn.info.clone()),
            };
        }

        let id = match &self.policy.device_id {
            Some(id) => id.clone(),
            None => {
                let devices = self.driver.probe().map_err(|e| self.reject_connect(e.into()))?;
                match devices.into_iter().next() {
                    Some(device) => device.id,
                    None => return Err(self.reject_connect(ConnectError::NoDevices)),
                }
            }
        };
        self.open(id).await
    }

    /// 连接指定设备
    pub async fn connect_to(self: &Arc<Self>, id: &str) -> Result<SessionInfo, ConnectError> {
        let _transition = self.transition.lock().await;

        if let Some(conn) = self.connection() {
            if conn.info.device_id == id {
                return Ok(conn.info.clone());
            }
            return Err(self.reject_connect(ConnectError::AlreadyConnected(
                conn.info.device_id.clone(),
            )));
        }
        self.open(id.to_string()).await
    }

    fn reject_connect(&self, err: ConnectError) -> ConnectError {
        tracing::warn!(target: "depthcam::session", "Connect failed: {}", err);
        self.status.report(StatusCode::ConnectFailed(err.kind()));
        err
    }

    // 调用方持有 transition 锁
    async fn open(self: &Arc<Self>, id: String) -> Result<SessionInfo, ConnectError> {
        // 1. 进入 Connecting
        self.set_state(SessionState::Connecting);
        self.status.report(StatusCode::Connecting);
        tracing::info!(target: "depthcam::session", "Connecting to {}", id);

        // 2. 打开设备 (有时限)
        let opened = match tokio::time::timeout(self.policy.connect_timeout(), self.driver.open(&id)).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(ConnectError::from(e)),
            Err(_) => Err(ConnectError::Timeout),
        };
        let handle: Arc<dyn DeviceHandle> = match opened {
            Ok(handle) => Arc::from(handle),
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                return Err(self.reject_connect(e));
            }
        };

        // 3. 读取身份与边界，建立连接状态
        let info = SessionInfo {
            device_id: id,
            identity: handle.identity(),
            limits: handle.limits(),
        };
        let (ops_tx, ops_rx) = mpsc::channel(1);
        let conn = Arc::new(Connection {
            handle,
            info: info.clone(),
            cancel: CancellationToken::new(),
            frame_gate: tokio::sync::Mutex::new(()),
            active: RwLock::new(None),
            generation: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            ops_tx: Mutex::new(Some(ops_tx)),
            ops_rx: Mutex::new(Some(ops_rx)),
        });

        // 4. 热插拔：回调只负责唤醒，真正的清理在异步任务里做
        let removed = Arc::new(Notify::new());
        let notify = removed.clone();
        conn.handle
            .set_removal_callback(Box::new(move || notify.notify_one()));
        self.spawn_removal_watcher(conn.clone(), removed);

        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Some(conn);
        self.set_state(SessionState::Connected);
        self.status.report(StatusCode::Connected);
        let _ = self.events.send(DeviceEvent::Connected(info.clone()));
        tracing::info!(
            target: "depthcam::session",
            "Connected to {} ({} / fw {})",
            info.device_id,
            info.identity.model,
            info.identity.firmware_version
        );
        Ok(info)
    }

    fn spawn_removal_watcher(self: &Arc<Self>, conn: Arc<Connection>, removed: Arc<Notify>) {
        let session: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = conn.cancel.cancelled() => {}
                _ = removed.notified() => {
                    if let Some(session) = session.upgrade() {
                        session.handle_removal(conn).await;
                    }
                }
            }
        });
    }

    async fn handle_removal(&self, conn: Arc<Connection>) {
        let _transition = self.transition.lock().await;
        if !self.is_current(&conn) {
            return;
        }
        tracing::warn!(target: "depthcam::session", "Device {} removed", conn.info.device_id);
        if let Err(e) = self.teardown(conn, Teardown::Removed).await {
            tracing::warn!(target: "depthcam::session", "Cleanup after removal incomplete: {}", e);
        }
    }

    fn is_current(&self, conn: &Arc<Connection>) -> bool {
        self.connection()
            .map(|c| Arc::ptr_eq(&c, conn))
            .unwrap_or(false)
    }

    /// 断开连接
    ///
    /// 采集或预览进行中也可以调用：进行中的操作被取消，句柄在它们退出后关闭。
    pub async fn disconnect(&self) -> Result<(), DisconnectError> {
        let _transition = self.transition.lock().await;
        let Some(conn) = self.connection() else {
            return Err(DisconnectError::NotConnected);
        };
        self.teardown(conn, Teardown::Requested).await
    }

    // 调用方持有 transition 锁
    async fn teardown(&self, conn: Arc<Connection>, reason: Teardown) -> Result<(), DisconnectError> {
        let device_id = conn.info.device_id.clone();
        self.set_state(SessionState::Disconnecting);
        match reason {
            Teardown::Requested => self.status.report(StatusCode::Disconnecting),
            Teardown::Removed => {
                self.status.report(StatusCode::DeviceRemoved);
                let _ = self.events.send(DeviceEvent::Removed {
                    device_id: device_id.clone(),
                });
            }
        }

        // 1. 停止发放租约，并取消所有进行中的等待
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = None;
        conn.cancel.cancel();
        drop(lock(&conn.ops_tx).take());

        // 2. 等待所有租约归还
        let ops_rx = lock(&conn.ops_rx).take();
        let drained = match ops_rx {
            Some(mut rx) => tokio::time::timeout(self.policy.disconnect_timeout(), rx.recv())
                .await
                .is_ok(),
            None => true,
        };
        if !drained {
            tracing::warn!(
                target: "depthcam::session",
                "Operations on {} did not finish within {:?}",
                device_id,
                self.policy.disconnect_timeout()
            );
            // 拉帧循环没来得及停流，这里补上
            if let Err(e) = conn.handle.stop_stream().await {
                tracing::debug!(target: "depthcam::session", "stop_stream during teardown: {}", e);
            }
        }

        // 3. 关闭句柄
        let closed = conn.handle.close();
        self.set_state(SessionState::Disconnected);
        let _ = self.events.send(DeviceEvent::Disconnected {
            device_id: device_id.clone(),
        });

        let result = match closed {
            Err(e) if reason == Teardown::Requested => Err(DisconnectError::Device(e)),
            _ if !drained => Err(DisconnectError::Timeout),
            _ => Ok(()),
        };
        match &result {
            Ok(()) => {
                tracing::info!(target: "depthcam::session", "Disconnected from {}", device_id);
                self.status.report(StatusCode::Disconnected);
            }
            Err(e) => {
                tracing::warn!(target: "depthcam::session", "Disconnect from {} incomplete: {}", device_id, e);
                self.status.report(StatusCode::DisconnectFailed);
            }
        }
        result
    }
}
