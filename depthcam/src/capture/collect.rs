use std::collections::BTreeMap;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use depthcam_core::frame::Frame;
use depthcam_core::pixel_format::{DataType, DataTypes};
use depthcam_core::state::StreamState;

use crate::stream::FrameConsumer;

/// 等待被打断的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Cancelled,
    StreamStopped,
    Timeout,
}

/// 采集作业在预览流上的订阅端
///
/// 丢帧按数据类型统计：同一类型相邻两次被接受的帧之间，设备帧计数的跳号即丢帧数。
/// 这样消费者队列溢出和设备侧丢帧都能被发现。
pub(crate) struct Collector {
    consumer: FrameConsumer,
    types: DataTypes,
    cancel: CancellationToken,
    stream_state: watch::Receiver<StreamState>,
    last_index: BTreeMap<DataType, u64>,
    dropped: u64,
}

async fn stream_stopped(state: &mut watch::Receiver<StreamState>) {
    // 发送端消失也按停流处理
    let _ = state
        .wait_for(|s| matches!(s, StreamState::Stopped | StreamState::Stopping))
        .await;
}

impl Collector {
    pub(crate) fn new(
        consumer: FrameConsumer,
        types: DataTypes,
        cancel: CancellationToken,
        stream_state: watch::Receiver<StreamState>,
    ) -> Self {
        Self {
            consumer,
            types,
            cancel,
            stream_state,
            last_index: BTreeMap::new(),
            dropped: 0,
        }
    }

    /// 等待下一帧请求类型的帧，最晚到 `deadline`
    pub(crate) async fn next(&mut self, deadline: Instant) -> Result<Frame, Interrupt> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Interrupt::Cancelled),
                _ = stream_stopped(&mut self.stream_state) => return Err(Interrupt::StreamStopped),
                received = tokio::time::timeout_at(deadline, self.consumer.recv()) => match received {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return Err(Interrupt::StreamStopped),
                    Err(_) => return Err(Interrupt::Timeout),
                },
            };
            if self.types.has(frame.data_type) {
                return Ok(frame);
            }
        }
    }

    /// 接受一帧并更新丢帧计数，返回新发现的丢帧数
    pub(crate) fn accept(&mut self, frame: &Frame) -> u64 {
        let gap = match self.last_index.insert(frame.data_type, frame.device_index) {
            Some(prev) if frame.device_index > prev + 1 => frame.device_index - prev - 1,
            _ => 0,
        };
        self.dropped += gap;
        gap
    }

    /// 参数切换后设备计数可能跳号，不算丢帧
    pub(crate) fn reset_tracking(&mut self) {
        self.last_index.clear();
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
