//! 状态上报
//!
//! 把会话、预览流、采集作业的状态变化映射成状态码，交给 UI 层翻译成文字。
//! 投递是有损的：订阅者的队列满了就丢弃最旧的事件，生产者永远不会被阻塞。

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use depthcam_core::capture::{CaptureKind, JobId};
use depthcam_core::error::{CaptureFailure, ConnectFailure, ParamField};

use crate::stream::ConsumerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Disconnected,
    Fault,
}

/// 状态码：每个失败都有一个与成功事件不同的码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    // --- 设备会话 ---
    Connecting,
    Connected,
    ConnectFailed(ConnectFailure),
    Disconnecting,
    Disconnected,
    /// 句柄已释放，但有操作超时未退出或关闭失败
    DisconnectFailed,
    DeviceRemoved,

    // --- 参数 ---
    ParametersApplied { generation: u64 },
    ParameterRejected(ParamField),
    ParameterWriteFailed,

    // --- 预览流 ---
    PreviewStarting,
    PreviewStarted,
    PreviewStartFailed,
    PreviewPaused,
    PreviewResumed,
    PreviewStopped(StopReason),
    StreamFault,
    FrameDropped { consumer: ConsumerId, total: u64 },

    // --- 采集 ---
    CaptureStarted { job: JobId, kind: CaptureKind },
    CaptureRejected(CaptureFailure),
    CaptureProgress { job: JobId, collected: u32, requested: u32 },
    CaptureFrameDropped { job: JobId, total: u64 },
    HdrLevelCaptured { job: JobId, level: usize, of: usize },
    CaptureCompleted { job: JobId },
    CaptureFailed { job: JobId, reason: CaptureFailure },
    CaptureCancelled { job: JobId },
}

/// 带序号和时间戳的状态事件
///
/// 序号在一个 Reporter 内严格递增，订阅者可以据此发现丢失的事件。
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub seq: u64,
    pub at: SystemTime,
    pub code: StatusCode,
}

struct Subscriber {
    tx: Sender<StatusEvent>,
    // 队列满时用来淘汰最旧的事件；它让通道永远不会断开，
    // 所以订阅者是否还在要看 alive
    evict: Receiver<StatusEvent>,
    alive: Weak<()>,
}

/// 状态事件的接收端，drop 之后 Reporter 会在下一次上报时忘掉它
///
/// 通过 `Deref` 直接当作 crossbeam 的 `Receiver` 使用。
#[derive(Debug)]
pub struct StatusSubscription {
    rx: Receiver<StatusEvent>,
    _alive: Arc<()>,
}

impl Deref for StatusSubscription {
    type Target = Receiver<StatusEvent>;

    fn deref(&self) -> &Self::Target {
        &self.rx
    }
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
    next_seq: AtomicU64,
    lost: AtomicU64,
}

/// 状态上报器，克隆后共享同一个事件序列
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("capacity", &self.inner.capacity)
            .field("next_seq", &self.inner.next_seq.load(Ordering::Relaxed))
            .field("lost", &self.inner.lost.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StatusReporter {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
                next_seq: AtomicU64::new(0),
                lost: AtomicU64::new(0),
            }),
        }
    }

    /// 新的订阅者只收到订阅之后的事件
    pub fn subscribe(&self) -> StatusSubscription {
        let (tx, rx) = bounded(self.inner.capacity);
        let alive = Arc::new(());
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        subscribers.push(Subscriber {
            tx,
            evict: rx.clone(),
            alive: Arc::downgrade(&alive),
        });
        StatusSubscription { rx, _alive: alive }
    }

    pub fn report(&self, code: StatusCode) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner());

        // 在锁内分配序号，保证各订阅者看到的顺序一致
        let event = StatusEvent {
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            at: SystemTime::now(),
            code,
        };
        tracing::trace!(target: "depthcam::status", seq = event.seq, ?code, "status");

        subscribers.retain(|sub| self.deliver(sub, event.clone()));
    }

    /// 返回 false 表示订阅者已经离开
    fn deliver(&self, sub: &Subscriber, mut event: StatusEvent) -> bool {
        if sub.alive.strong_count() == 0 {
            return false;
        }
        loop {
            match sub.tx.try_send(event) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(back)) => {
                    event = back;
                    match sub.evict.try_recv() {
                        Ok(_) | Err(TryRecvError::Empty) => {
                            self.inner.lost.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TryRecvError::Disconnected) => return false,
                    }
                }
            }
        }
    }

    /// 因队列已满被丢弃的事件数 (所有订阅者合计)
    pub fn lost_events(&self) -> u64 {
        self.inner.lost.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribers(reporter: &StatusReporter) -> usize {
        reporter.inner.subscribers.lock().unwrap().len()
    }

    fn codes(rx: &Receiver<StatusEvent>) -> Vec<StatusCode> {
        rx.try_iter().map(|e| e.code).collect()
    }

    #[test]
    fn events_are_sequenced_in_order() {
        let reporter = StatusReporter::new(8);
        let rx = reporter.subscribe();
        reporter.report(StatusCode::Connecting);
        reporter.report(StatusCode::Connected);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].code, StatusCode::Connecting);
        assert_eq!(events[1].code, StatusCode::Connected);
        assert!(events[1].seq > events[0].seq);
    }

    #[test]
    fn full_queue_drops_oldest_without_blocking() {
        let reporter = StatusReporter::new(2);
        let rx = reporter.subscribe();
        reporter.report(StatusCode::PreviewStarting);
        reporter.report(StatusCode::PreviewStarted);
        reporter.report(StatusCode::PreviewPaused);
        assert_eq!(
            codes(&rx),
            vec![StatusCode::PreviewStarted, StatusCode::PreviewPaused]
        );
        assert_eq!(reporter.lost_events(), 1);
    }

    #[test]
    fn dropped_subscribers_are_forgotten() {
        let reporter = StatusReporter::new(2);
        let rx = reporter.subscribe();
        drop(rx);
        reporter.report(StatusCode::Connecting);
        let live = reporter.subscribe();
        reporter.report(StatusCode::Connected);
        assert_eq!(codes(&live), vec![StatusCode::Connected]);
        assert_eq!(subscribers(&reporter), 1);
    }

    #[test]
    fn departed_subscriber_does_not_count_lost_events() {
        let reporter = StatusReporter::new(2);
        let rx = reporter.subscribe();
        reporter.report(StatusCode::Connecting);
        drop(rx);
        for _ in 0..10 {
            reporter.report(StatusCode::Connected);
        }
        assert_eq!(subscribers(&reporter), 0);
        assert_eq!(reporter.lost_events(), 0);
    }
}
