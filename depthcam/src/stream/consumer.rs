use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use depthcam_core::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

/// 预览流的一个订阅端
///
/// 队列满时新帧对这个消费者直接丢弃 (不会阻塞拉帧循环)，丢弃数可以通过 `dropped()` 读取。
/// drop 之后在下一次投递时自动注销。
pub struct FrameConsumer {
    id: ConsumerId,
    rx: mpsc::Receiver<Frame>,
    dropped: Arc<AtomicU64>,
}

impl fmt::Debug for FrameConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameConsumer")
            .field("id", &self.id)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl FrameConsumer {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// 等待下一帧；注册表被销毁时返回 None
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Frame, TryRecvError> {
        self.rx.try_recv()
    }

    /// 因队列已满而没有投递给本消费者的帧数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Slot {
    id: ConsumerId,
    tx: mpsc::Sender<Frame>,
    dropped: Arc<AtomicU64>,
}

/// 一次投递的结果
#[derive(Debug, Default)]
pub(crate) struct Delivery {
    pub(crate) delivered: u64,
    /// (消费者, 该消费者累计丢帧数)
    pub(crate) dropped: Vec<(ConsumerId, u64)>,
}

#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    next_id: AtomicU64,
    slots: Mutex<Vec<Slot>>,
}

impl ConsumerRegistry {
    pub(crate) fn register(&self, capacity: usize) -> FrameConsumer {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let dropped = Arc::new(AtomicU64::new(0));
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Slot {
                id,
                tx,
                dropped: dropped.clone(),
            });
        FrameConsumer { id, rx, dropped }
    }

    /// 按注册顺序把帧推给每个消费者；负载共享，不复制像素
    pub(crate) fn publish(&self, frame: &Frame) -> Delivery {
        let mut delivery = Delivery::default();
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.retain(|slot| match slot.tx.try_send(frame.clone()) {
            Ok(()) => {
                delivery.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                let total = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                delivery.dropped.push((slot.id, total));
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(target: "depthcam::stream", "Consumer {:?} went away", slot.id);
                false
            }
        });
        delivery
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcam_core::frame::RawFrame;
    use depthcam_core::pixel_format::DataType;
    use std::time::Instant;

    fn frame(sequence: u64) -> Frame {
        let raw = RawFrame {
            data_type: DataType::IrLeft,
            width: 2,
            height: 1,
            device_index: sequence,
            hw_timestamp_ns: sequence * 1_000,
            metadata: Default::default(),
            data: bytes::Bytes::from_static(&[1, 2]),
        };
        Frame::from_raw(raw, sequence, 0, Instant::now())
    }

    #[test]
    fn slow_consumer_drops_without_affecting_others() {
        let registry = ConsumerRegistry::default();
        let mut slow = registry.register(1);
        let mut fast = registry.register(8);

        for seq in 1..=3 {
            registry.publish(&frame(seq));
            assert_eq!(fast.try_recv().unwrap().sequence, seq);
        }

        assert_eq!(slow.dropped(), 2);
        assert_eq!(slow.try_recv().unwrap().sequence, 1);
        assert!(slow.try_recv().is_err());
        assert_eq!(fast.dropped(), 0);
    }

    #[test]
    fn closed_consumers_are_unregistered() {
        let registry = ConsumerRegistry::default();
        let gone = registry.register(1);
        let _kept = registry.register(1);
        assert_eq!(registry.len(), 2);
        drop(gone);
        let delivery = registry.publish(&frame(1));
        assert_eq!(delivery.delivered, 1);
        assert_eq!(registry.len(), 1);
    }
}
