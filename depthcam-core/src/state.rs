/// 设备会话状态机
///
/// `Connecting` 与 `Disconnecting` 是瞬态，任何失败都回到 `Disconnected`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// 预览流状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl StreamState {
    /// 流句柄是否处于打开状态 (Running 或 Paused)
    pub fn is_active(self) -> bool {
        matches!(self, StreamState::Running | StreamState::Paused)
    }
}
