//! 门面：把会话、参数控制器、预览流、采集工具和状态上报装配在一起

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use depthcam_core::capture::{CaptureOutput, CaptureRequest};
use depthcam_core::config::StreamConfig;
use depthcam_core::error::DisconnectError;
use depthcam_core::traits::Driver;

use crate::capture::CaptureTool;
use crate::config::EngineConfig;
use crate::imgcodecs::{FileSaveStrategy, SaveStrategy};
use crate::params::ParameterController;
use crate::session::{DeviceSession, SessionInfo};
use crate::status::StatusReporter;
use crate::stream::StreamEngine;

/// 一台深度相机的完整引擎
///
/// # Example
///
/// ```no_run
/// # async fn demo(driver: std::sync::Arc<dyn depthcam::prelude::Driver>) -> anyhow::Result<()> {
/// use depthcam::prelude::*;
///
/// let camera = DepthCamera::new(driver, EngineConfig::default());
/// camera.open_preview(StreamConfig::new().data_types(DataTypes::DEPTH)).await?;
/// let output = camera.capture_once(CaptureRequest::single(DataType::Depth)).await?;
/// println!("saved {:?}", output.saved_paths());
/// camera.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DepthCamera {
    config: EngineConfig,
    status: StatusReporter,
    session: Arc<DeviceSession>,
    params: ParameterController,
    stream: Arc<StreamEngine>,
    capture: CaptureTool,
}

impl DepthCamera {
    /// 采集结果写到 `config.capture.output_dir`
    pub fn new(driver: Arc<dyn Driver>, config: EngineConfig) -> Self {
        let saver = Arc::new(FileSaveStrategy::new(config.capture.output_dir.clone()));
        Self::with_save_strategy(driver, config, saver)
    }

    pub fn with_save_strategy(
        driver: Arc<dyn Driver>,
        config: EngineConfig,
        saver: Arc<dyn SaveStrategy>,
    ) -> Self {
        let status = StatusReporter::new(config.status.queue_depth);
        let session = DeviceSession::new(driver, config.session.clone(), status.clone());
        let params = ParameterController::new(session.clone(), &config.stream, status.clone());
        let stream = Arc::new(StreamEngine::new(
            session.clone(),
            params.clone(),
            config.stream.clone(),
            status.clone(),
        ));
        let capture = CaptureTool::new(
            session.clone(),
            stream.clone(),
            params.clone(),
            saver,
            config.capture.clone(),
            status.clone(),
        );
        Self {
            config,
            status,
            session,
            params,
            stream,
            capture,
        }
    }

    /// 从 JSON 配置文件创建
    pub fn from_config_file(driver: Arc<dyn Driver>, path: impl AsRef<Path>) -> Result<Self> {
        let config = EngineConfig::load(path)?;
        Ok(Self::new(driver, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn params(&self) -> &ParameterController {
        &self.params
    }

    pub fn stream(&self) -> &Arc<StreamEngine> {
        &self.stream
    }

    pub fn capture(&self) -> &CaptureTool {
        &self.capture
    }

    /// 连接 (已连接时复用) 并以给定配置启动预览
    pub async fn open_preview(&self, config: StreamConfig) -> Result<SessionInfo> {
        let info = self
            .session
            .connect()
            .await
            .context("Failed to connect camera")?;
        self.stream
            .start(config)
            .await
            .context("Failed to start preview")?;
        Ok(info)
    }

    /// 启动一个采集作业并等待结果
    pub async fn capture_once(&self, request: CaptureRequest) -> Result<CaptureOutput> {
        let kind = request.mode.kind();
        let handle = self
            .capture
            .start(request)
            .with_context(|| format!("Failed to start {:?} capture", kind))?;
        let id = handle.id();
        handle
            .wait()
            .await
            .with_context(|| format!("Capture {} failed", id))
    }

    /// 停止预览并断开；未连接时直接返回
    pub async fn shutdown(&self) -> Result<()> {
        self.stream.stop().await.context("Failed to stop preview")?;
        match self.session.disconnect().await {
            Ok(()) | Err(DisconnectError::NotConnected) => Ok(()),
            Err(e) => Err(e).context("Failed to disconnect camera"),
        }
    }
}
