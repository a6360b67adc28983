use std::fmt;

/// 预览流的遥测数据
#[derive(Clone, Default, PartialEq)]
pub struct StreamTelemetry {
    /// 从设备成功拉到的帧数
    pub frames_pulled: u64,

    /// 投递给消费者的帧数 (每个消费者各算一次)
    pub frames_delivered: u64,

    /// 因消费者队列已满而丢弃的帧数
    pub frames_dropped: u64,

    /// 拉帧超时次数
    pub pull_timeouts: u64,

    /// 重试后仍失败、导致停流的故障次数
    pub faults: u64,
}

impl fmt::Debug for StreamTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTelemetry")
            .field("pulled", &self.frames_pulled)
            .field("delivered", &self.frames_delivered)
            .field("dropped", &self.frames_dropped)
            .field("timeouts", &self.pull_timeouts)
            .finish()
    }
}

/// 简单的状态指示灯
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHealth {
    Healthy,
    Warning(HealthIssue),
    Critical(HealthIssue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthIssue {
    DeviceFault,
    SlowConsumers,
    PullTimeouts,
}

impl StreamTelemetry {
    /// 丢帧率 (相对于应投递的帧数)
    pub fn drop_ratio(&self) -> f64 {
        let offered = self.frames_delivered + self.frames_dropped;
        if offered == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / offered as f64
        }
    }

    /// 基于遥测数据的健康评估
    pub fn assess_health(&self) -> StreamHealth {
        if self.faults > 0 {
            return StreamHealth::Critical(HealthIssue::DeviceFault);
        }

        let ratio = self.drop_ratio();
        if ratio > 0.5 {
            return StreamHealth::Critical(HealthIssue::SlowConsumers);
        } else if ratio > 0.1 {
            return StreamHealth::Warning(HealthIssue::SlowConsumers);
        }

        if self.pull_timeouts > 10 && self.pull_timeouts * 10 > self.frames_pulled {
            return StreamHealth::Warning(HealthIssue::PullTimeouts);
        }

        StreamHealth::Healthy
    }
}
