//! 参数控制器
//!
//! 下发流程：
//! 1. 按设备边界校验，不合法直接返回，不碰硬件
//! 2. 等待帧边界 (拉帧循环在两次 pull 之间释放帧闸)
//! 3. 快照将要修改的键在设备上的当前值
//! 4. 只写变化的键；任何一步失败就按快照逆序回滚
//! 5. 记录生效配置，代号 +1

use std::sync::Arc;
use std::time::Duration;

use depthcam_core::config::StreamConfig;
use depthcam_core::control::{ParamKey, ParamValue};
use depthcam_core::error::{DeviceError, ParamError};

use crate::config::StreamPolicy;
use crate::session::{DeviceLease, DeviceSession};
use crate::status::{StatusCode, StatusReporter};

#[derive(Debug, Clone)]
pub struct ParameterController {
    session: Arc<DeviceSession>,
    status: StatusReporter,
    gate_timeout: Duration,
}

impl ParameterController {
    pub fn new(session: Arc<DeviceSession>, policy: &StreamPolicy, status: StatusReporter) -> Self {
        Self {
            session,
            status,
            gate_timeout: policy.frame_gate_timeout(),
        }
    }

    /// 校验并原子地下发一份完整配置
    pub async fn apply(&self, config: StreamConfig) -> Result<(), ParamError> {
        let lease = self.session.lease().ok_or(ParamError::NotConnected)?;
        self.apply_on(&lease, &config).await.map(|_| ())
    }

    /// 当前生效的配置 (未连接或尚未下发时为 None)
    pub fn effective(&self) -> Option<StreamConfig> {
        self.session.lease().and_then(|l| l.active_config())
    }

    pub fn generation(&self) -> u64 {
        self.session.lease().map(|l| l.generation()).unwrap_or(0)
    }

    /// 从设备读回实际配置
    pub fn read_back(&self) -> Result<StreamConfig, ParamError> {
        let lease = self.session.lease().ok_or(ParamError::NotConnected)?;
        let params = ParamKey::ALL
            .iter()
            .map(|&key| {
                lease
                    .handle()
                    .get_parameter(key)
                    .map(|value| (key, value))
                    .map_err(|source| ParamError::Device { key, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        StreamConfig::from_params(&params).ok_or_else(|| ParamError::Device {
            key: ParamKey::Resolution,
            source: DeviceError::Protocol("inconsistent parameter set".into()),
        })
    }

    /// 在给定租约上下发，返回新的配置代号
    pub(crate) async fn apply_on(&self, lease: &DeviceLease, config: &StreamConfig) -> Result<u64, ParamError> {
        if let Err(e) = config.validate(&lease.info().limits) {
            if let ParamError::InvalidParameter(field) = &e {
                tracing::debug!(target: "depthcam::params", "Rejected {:?}", field);
                self.status.report(StatusCode::ParameterRejected(*field));
            }
            return Err(e);
        }

        let cancel = lease.cancel_token();
        let _boundary = tokio::select! {
            _ = cancel.cancelled() => return Err(ParamError::NotConnected),
            gate = tokio::time::timeout(self.gate_timeout, lease.frame_boundary()) => {
                gate.map_err(|_| ParamError::Timeout)?
            }
        };

        let changed = config.changed_params(lease.active_config().as_ref());
        let result = self.write_atomically(lease, &changed);
        match result {
            Ok(()) => {
                let generation = lease.commit(Some(config.clone()));
                tracing::debug!(
                    target: "depthcam::params",
                    "Applied {} parameter(s), generation {}",
                    changed.len(),
                    generation
                );
                self.status.report(StatusCode::ParametersApplied { generation });
                Ok(generation)
            }
            Err(e) => {
                if matches!(e, ParamError::RollbackFailed { .. }) {
                    // 设备状态未知，不再相信缓存
                    lease.commit(None);
                }
                tracing::warn!(target: "depthcam::params", "Parameter write failed: {}", e);
                self.status.report(StatusCode::ParameterWriteFailed);
                Err(e)
            }
        }
    }

    fn write_atomically(&self, lease: &DeviceLease, changed: &[(ParamKey, ParamValue)]) -> Result<(), ParamError> {
        let handle = lease.handle();

        let snapshot = changed
            .iter()
            .map(|(key, _)| {
                handle
                    .get_parameter(*key)
                    .map(|old| (*key, old))
                    .map_err(|source| ParamError::Device { key: *key, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (written, (key, value)) in changed.iter().enumerate() {
            if let Err(source) = handle.set_parameter(*key, value.clone()) {
                for (old_key, old_value) in snapshot[..written].iter().rev() {
                    if let Err(rollback) = handle.set_parameter(*old_key, old_value.clone()) {
                        return Err(ParamError::RollbackFailed {
                            key: *old_key,
                            source: rollback,
                        });
                    }
                }
                return Err(ParamError::Device { key: *key, source });
            }
        }
        Ok(())
    }
}
