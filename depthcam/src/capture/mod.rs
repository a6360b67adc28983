//! 采集工具
//!
//! 单帧、多帧、HDR 三种方式共用一个作业生命周期：
//! 启动时检查互斥、连接和预览状态，随后在独立任务里从预览流取帧，
//! 最后通过 [`SaveStrategy`] 保存并交付 [`CaptureResult`]。
//! 同一会话同时只允许一个作业。

mod collect;
mod hdr;

pub use hdr::fuse;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use depthcam_core::capture::{
    CaptureJob, CaptureMode, CaptureOutput, CaptureRequest, CaptureResult, CapturedFrame, JobId,
    JobStatus, SaveFormat,
};
use depthcam_core::config::{HdrLevel, HdrMode, StreamConfig};
use depthcam_core::error::{CaptureError, ParamError, ParamField};
use depthcam_core::frame::Frame;
use depthcam_core::pixel_format::DataType;

use crate::config::CapturePolicy;
use crate::imgcodecs::{SaveStrategy, SaveTarget};
use crate::params::ParameterController;
use crate::session::{DeviceLease, DeviceSession};
use crate::status::{StatusCode, StatusReporter};
use crate::stream::StreamEngine;
use collect::{Collector, Interrupt};

/// 已启动作业的句柄
pub struct CaptureHandle {
    id: JobId,
    cancel: CancellationToken,
    job: watch::Receiver<CaptureJob>,
    result: oneshot::Receiver<CaptureResult>,
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("id", &self.id)
            .field("status", &self.job.borrow().status)
            .finish()
    }
}

impl CaptureHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// 请求取消；作业在下一个等待点结束
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 作业的当前快照
    pub fn job(&self) -> CaptureJob {
        self.job.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureJob> {
        self.job.clone()
    }

    /// 等待作业结束
    pub async fn wait(self) -> CaptureResult {
        self.result.await.unwrap_or(Err(CaptureError::WorkerLost))
    }
}

/// 作业要做什么
enum Plan {
    Frames { per_type: u32 },
    Hdr { levels: Vec<HdrLevel> },
}

pub struct CaptureTool {
    session: Arc<DeviceSession>,
    engine: Arc<StreamEngine>,
    params: ParameterController,
    saver: Arc<dyn SaveStrategy>,
    policy: CapturePolicy,
    status: StatusReporter,
    exclusive: Arc<tokio::sync::Mutex<()>>,
    next_job: AtomicU64,
}

impl fmt::Debug for CaptureTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureTool")
            .field("busy", &self.is_busy())
            .field("jobs", &self.next_job.load(Ordering::Relaxed))
            .finish()
    }
}

impl CaptureTool {
    pub fn new(
        session: Arc<DeviceSession>,
        engine: Arc<StreamEngine>,
        params: ParameterController,
        saver: Arc<dyn SaveStrategy>,
        policy: CapturePolicy,
        status: StatusReporter,
    ) -> Self {
        Self {
            session,
            engine,
            params,
            saver,
            policy,
            status,
            exclusive: Arc::new(tokio::sync::Mutex::new(())),
            next_job: AtomicU64::new(0),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.exclusive.try_lock().is_err()
    }

    pub fn cancel(&self, handle: &CaptureHandle) {
        handle.cancel();
    }

    /// 启动一个采集作业
    ///
    /// 需要已连接且预览处于 Running/Paused；请求的数据类型必须已在预览配置中启用。
    pub fn start(&self, request: CaptureRequest) -> Result<CaptureHandle, CaptureError> {
        let guard = self
            .exclusive
            .clone()
            .try_lock_owned()
            .map_err(|_| self.reject(CaptureError::Busy))?;

        let lease = self
            .session
            .lease()
            .ok_or_else(|| self.reject(CaptureError::NotConnected))?;
        let stream_config = match self.engine.active_config() {
            Some(config) if self.engine.state().is_active() => config,
            _ => return Err(self.reject(CaptureError::StreamNotRunning)),
        };
        let plan = self
            .plan(&request, &stream_config, &lease)
            .map_err(|e| self.reject(e))?;

        // 在返回前订阅，保证不漏掉启动之后的帧
        let consumer = self.engine.subscribe(self.policy.queue_depth);
        let cancel = lease.cancel_token().child_token();
        let collector = Collector::new(
            consumer,
            request.data_types,
            cancel.clone(),
            self.engine.subscribe_state(),
        );

        let id = JobId(self.next_job.fetch_add(1, Ordering::Relaxed) + 1);
        let format = request
            .save_format
            .unwrap_or(self.policy.default_save_format);
        let requested = match &plan {
            Plan::Frames { per_type } => *per_type,
            Plan::Hdr { levels } => levels.len() as u32,
        };
        let (snapshot, job_rx) = watch::channel(CaptureJob {
            id,
            kind: request.mode.kind(),
            data_types: request.data_types,
            save_format: format,
            requested,
            progress: 0,
            dropped: 0,
            status: JobStatus::Pending,
        });
        let (done, result) = oneshot::channel();

        let job = Job {
            id,
            frame_timeout: request.frame_timeout.unwrap_or(self.policy.frame_timeout()),
            max_drops: request.max_drops.or(self.policy.max_drops),
            request,
            format,
            lease,
            params: self.params.clone(),
            saver: self.saver.clone(),
            policy: self.policy.clone(),
            status: self.status.clone(),
            cancel: cancel.clone(),
            snapshot,
        };
        tokio::spawn(run(job, collector, plan, guard, done));

        Ok(CaptureHandle {
            id,
            cancel,
            job: job_rx,
            result,
        })
    }

    fn reject(&self, err: CaptureError) -> CaptureError {
        tracing::warn!(target: "depthcam::capture", "Capture rejected: {}", err);
        self.status.report(StatusCode::CaptureRejected(err.kind()));
        err
    }

    fn plan(
        &self,
        request: &CaptureRequest,
        stream_config: &StreamConfig,
        lease: &DeviceLease,
    ) -> Result<Plan, CaptureError> {
        if request.data_types.is_empty() {
            return Err(CaptureError::InvalidRequest("no data type requested"));
        }
        if !stream_config.data_types.contains(request.data_types) {
            return Err(CaptureError::InvalidRequest(
                "requested data type is not enabled in the stream",
            ));
        }

        match &request.mode {
            CaptureMode::Single => Ok(Plan::Frames { per_type: 1 }),
            CaptureMode::Multiple { count: 0 } => {
                Err(CaptureError::InvalidRequest("frame count must be positive"))
            }
            CaptureMode::Multiple { count } => Ok(Plan::Frames { per_type: *count }),
            CaptureMode::Hdr { levels } => {
                // 档位来源：请求 > 手动 HDR 配置 > 自动档位表
                let levels = match (levels, &stream_config.hdr) {
                    (Some(levels), _) => levels.clone(),
                    (None, HdrMode::Manual(levels)) => levels.clone(),
                    (None, _) => self.policy.auto_hdr_levels.clone(),
                };
                if levels.is_empty() {
                    return Err(ParamError::InvalidParameter(ParamField::HdrLevels).into());
                }
                stream_config
                    .clone()
                    .hdr(HdrMode::Manual(levels.clone()))
                    .validate(&lease.info().limits)?;
                Ok(Plan::Hdr { levels })
            }
        }
    }
}

/// 作业任务持有的上下文
struct Job {
    id: JobId,
    request: CaptureRequest,
    format: SaveFormat,
    frame_timeout: Duration,
    max_drops: Option<u64>,
    lease: DeviceLease,
    params: ParameterController,
    saver: Arc<dyn SaveStrategy>,
    policy: CapturePolicy,
    status: StatusReporter,
    cancel: CancellationToken,
    snapshot: watch::Sender<CaptureJob>,
}

async fn run(
    job: Job,
    mut collector: Collector,
    plan: Plan,
    guard: OwnedMutexGuard<()>,
    done: oneshot::Sender<CaptureResult>,
) {
    let id = job.id;
    job.snapshot.send_modify(|j| j.status = JobStatus::Running);
    job.status.report(StatusCode::CaptureStarted {
        job: id,
        kind: job.request.mode.kind(),
    });
    tracing::info!(target: "depthcam::capture", "{} started: {:?}", id, job.request.mode);

    let result = match plan {
        Plan::Frames { per_type } => job.collect_frames(&mut collector, per_type).await,
        Plan::Hdr { levels } => job.capture_hdr(&mut collector, &levels).await,
    };

    let (status, code) = match &result {
        Ok(_) => (JobStatus::Completed, StatusCode::CaptureCompleted { job: id }),
        Err(CaptureError::Cancelled { .. }) => {
            (JobStatus::Cancelled, StatusCode::CaptureCancelled { job: id })
        }
        Err(e) => (
            JobStatus::Failed,
            StatusCode::CaptureFailed {
                job: id,
                reason: e.kind(),
            },
        ),
    };
    let dropped = match &result {
        Ok(output) => output.dropped,
        Err(e) => e.dropped().unwrap_or_else(|| collector.dropped()),
    };
    job.snapshot.send_modify(|j| {
        j.status = status;
        j.dropped = dropped;
    });
    match &result {
        Ok(output) => tracing::info!(
            target: "depthcam::capture",
            "{} completed: {} file(s), {} dropped",
            id,
            output.saved_paths().len(),
            dropped
        ),
        Err(e) => tracing::warn!(target: "depthcam::capture", "{} ended: {}", id, e),
    }
    job.status.report(code);

    // 先归还订阅、租约和互斥锁，调用方拿到结果时即可开始下一个作业
    drop(collector);
    drop(job);
    drop(guard);
    let _ = done.send(result);
}

const PREALLOCATED_FRAMES: usize = 64;

fn frame_label(data_type: DataType, index: u32) -> String {
    format!("{}_{:04}", data_type.short_name(), index)
}

impl Job {
    /// 每种请求的类型各收 `per_type` 帧
    async fn collect_frames(&self, collector: &mut Collector, per_type: u32) -> CaptureResult {
        let types = self.request.data_types;
        let wanted = per_type as usize * types.count();
        let mut taken: BTreeMap<DataType, u32> = BTreeMap::new();
        // 帧数来自调用方，预分配要封顶
        let mut items: Vec<(SaveTarget, Frame)> = Vec::with_capacity(wanted.min(PREALLOCATED_FRAMES));

        let mut deadline = Instant::now() + self.frame_timeout;
        while items.len() < wanted {
            let frame = match collector.next(deadline).await {
                Ok(frame) => frame,
                Err(interrupt) => {
                    return self.interrupted(interrupt, collector, items, wanted).await;
                }
            };
            let count = taken.entry(frame.data_type).or_insert(0);
            if *count >= per_type {
                continue;
            }
            *count += 1;

            let gap = collector.accept(&frame);
            let target = SaveTarget::new(self.id, frame_label(frame.data_type, *count));
            items.push((target, frame));
            self.progress(items.len(), wanted, gap, collector.dropped());
            deadline = Instant::now() + self.frame_timeout;

            if let Some(threshold) = self.max_drops {
                if collector.dropped() > threshold {
                    let missing = wanted - items.len();
                    return Err(CaptureError::DropThresholdExceeded {
                        dropped: collector.dropped() + missing as u64,
                        threshold,
                        missing,
                    });
                }
            }
        }

        let frames = self.save(items).await?;
        Ok(CaptureOutput {
            job: self.id,
            frames,
            dropped: collector.dropped(),
            hdr: None,
        })
    }

    async fn interrupted(
        &self,
        interrupt: Interrupt,
        collector: &Collector,
        items: Vec<(SaveTarget, Frame)>,
        wanted: usize,
    ) -> CaptureResult {
        let collected = items.len();
        let missing = wanted - collected;
        let dropped = collector.dropped() + missing as u64;
        match interrupt {
            Interrupt::Timeout => Err(CaptureError::Timeout {
                collected,
                missing,
                dropped,
            }),
            Interrupt::StreamStopped => Err(CaptureError::StreamStopped { missing, dropped }),
            Interrupt::Cancelled => self.cancelled(items, collector.dropped()).await,
        }
    }

    /// 取消：默认丢弃已采到的帧；请求了部分结果时保存后随错误一起交付
    async fn cancelled(&self, items: Vec<(SaveTarget, Frame)>, dropped: u64) -> CaptureResult {
        if !self.request.deliver_partial {
            return Err(CaptureError::Cancelled { partial: None });
        }
        let frames = self.save(items).await?;
        Err(CaptureError::Cancelled {
            partial: Some(Box::new(CaptureOutput {
                job: self.id,
                frames,
                dropped,
                hdr: None,
            })),
        })
    }

    fn progress(&self, collected: usize, wanted: usize, gap: u64, dropped: u64) {
        self.snapshot.send_modify(|j| {
            j.progress = collected as u32;
            j.dropped = dropped;
        });
        self.status.report(StatusCode::CaptureProgress {
            job: self.id,
            collected: collected as u32,
            requested: wanted as u32,
        });
        if gap > 0 {
            tracing::debug!(target: "depthcam::capture", "{}: {} frame(s) dropped", self.id, gap);
            self.status.report(StatusCode::CaptureFrameDropped {
                job: self.id,
                total: dropped,
            });
        }
    }

    /// 在阻塞线程池里按顺序保存；任何一个失败就删除本批已保存的文件
    async fn save(&self, items: Vec<(SaveTarget, Frame)>) -> Result<Vec<CapturedFrame>, CaptureError> {
        let saver = self.saver.clone();
        let format = self.format;
        let joined = tokio::task::spawn_blocking(move || {
            let mut saved: Vec<CapturedFrame> = Vec::with_capacity(items.len());
            for (target, frame) in &items {
                match saver.save(target, frame, format) {
                    Ok(path) => saved.push(CapturedFrame {
                        data_type: frame.data_type,
                        sequence: frame.sequence,
                        device_index: frame.device_index,
                        path,
                    }),
                    Err(e) => {
                        let paths: Vec<_> = saved.iter().map(|f| f.path.clone()).collect();
                        saver.discard(&paths);
                        return Err(e);
                    }
                }
            }
            Ok(saved)
        })
        .await;

        match joined {
            Ok(Ok(saved)) => Ok(saved),
            Ok(Err(e)) => Err(CaptureError::Save(e)),
            Err(_) => Err(CaptureError::WorkerLost),
        }
    }
}
