//! 引擎配置
//!
//! 所有时限以毫秒写在 JSON 里，通过 `Duration` getter 读取。缺省字段取默认值，
//! 所以一个空对象 `{}` 就是合法配置。

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use depthcam_core::capture::SaveFormat;
use depthcam_core::config::HdrLevel;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub stream: StreamPolicy,
    pub capture: CapturePolicy,
    pub status: StatusConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse engine configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 连接哪台设备；None 时取枚举到的第一台
    pub device_id: Option<String>,
    pub connect_timeout_ms: u64,
    /// 断开时等待进行中操作退出的时限
    pub disconnect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            connect_timeout_ms: 3_000,
            disconnect_timeout_ms: 2_000,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPolicy {
    /// 单次拉帧的等待时限
    pub pull_timeout_ms: u64,
    /// 连续瞬时错误的重试次数，超过后判定为流故障
    pub max_pull_retries: u32,
    /// 停流时等待拉帧循环退出的时限
    pub stop_timeout_ms: u64,
    /// 参数下发时等待帧边界的时限
    pub frame_gate_timeout_ms: u64,
    /// 消费者队列默认深度
    pub consumer_queue_depth: usize,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            pull_timeout_ms: 500,
            max_pull_retries: 3,
            stop_timeout_ms: 2_000,
            frame_gate_timeout_ms: 1_000,
            consumer_queue_depth: 4,
        }
    }
}

impl StreamPolicy {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn frame_gate_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_gate_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapturePolicy {
    /// 等待单帧到达的时限
    pub frame_timeout_ms: u64,
    /// HDR 每个档位的总时限 (包括稳定帧)
    pub hdr_level_timeout_ms: u64,
    /// 切换曝光后丢弃的帧数
    pub hdr_settle_frames: u32,
    /// 丢帧上限；None 表示只上报不失败
    pub max_drops: Option<u64>,
    pub default_save_format: SaveFormat,
    pub output_dir: PathBuf,
    /// 采集作业在预览流上的订阅队列深度
    pub queue_depth: usize,
    /// HDR 自动模式使用的曝光档位表
    pub auto_hdr_levels: Vec<HdrLevel>,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 2_000,
            hdr_level_timeout_ms: 3_000,
            hdr_settle_frames: 3,
            max_drops: None,
            default_save_format: SaveFormat::Png,
            output_dir: PathBuf::from("captures"),
            queue_depth: 16,
            auto_hdr_levels: vec![
                HdrLevel::new(1_000, 1.0),
                HdrLevel::new(5_000, 2.0),
                HdrLevel::new(10_000, 4.0),
            ],
        }
    }
}

impl CapturePolicy {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn hdr_level_timeout(&self) -> Duration {
        Duration::from_millis(self.hdr_level_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// 每个订阅者的事件队列深度
    pub queue_depth: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { queue_depth: 256 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.capture.hdr_settle_frames, 3);
        assert_eq!(config.capture.default_save_format, SaveFormat::Png);
        assert_eq!(config.stream.pull_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let config = EngineConfig::from_json_str(
            r#"{
                "session": { "device_id": "cam1" },
                "capture": { "max_drops": 5, "default_save_format": "Raw" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.session.device_id.as_deref(), Some("cam1"));
        assert_eq!(config.session.connect_timeout_ms, 3_000);
        assert_eq!(config.capture.max_drops, Some(5));
        assert_eq!(config.capture.default_save_format, SaveFormat::Raw);
        assert_eq!(config.capture.auto_hdr_levels.len(), 3);
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = EngineConfig::from_json_str("{ session: ").unwrap_err();
        assert!(err.to_string().contains("engine configuration"));
    }
}
