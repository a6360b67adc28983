use std::sync::Arc;

use depthcam::prelude::*;
use depthcam_core::config::Resolution;
use depthcam_core::error::CaptureFailure;
use depthcam_simulation::{single_camera_driver, SimCamera};

fn memory_camera() -> (DepthCamera, SimCamera, Arc<MemorySaveStrategy>) {
    memory_camera_with(EngineConfig::default())
}

fn memory_camera_with(config: EngineConfig) -> (DepthCamera, SimCamera, Arc<MemorySaveStrategy>) {
    let (driver, sim) = single_camera_driver("cam0");
    let saver = Arc::new(MemorySaveStrategy::new());
    let camera = DepthCamera::with_save_strategy(driver, config, saver.clone());
    (camera, sim, saver)
}

fn three_levels() -> Vec<HdrLevel> {
    vec![
        HdrLevel::new(1_000, 1.0),
        HdrLevel::new(5_000, 2.0),
        HdrLevel::new(10_000, 4.0),
    ]
}

fn depth_preview() -> StreamConfig {
    StreamConfig::new()
        .resolution(320, 240)
        .data_types(DataTypes::DEPTH)
}

fn drain(events: &crossbeam_channel::Receiver<StatusEvent>) -> Vec<StatusCode> {
    events.try_iter().map(|e| e.code).collect()
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_capture_cancels_job_and_stops_preview() {
    let (camera, sim, saver) = memory_camera();
    let events = camera.status().subscribe();

    let preview = StreamConfig::new()
        .resolution(1280, 720)
        .data_types(DataTypes::DEPTH);
    camera.open_preview(preview).await.unwrap();
    assert_eq!(camera.session().state(), SessionState::Connected);
    assert_eq!(camera.stream().state(), StreamState::Running);

    let single = camera
        .capture_once(CaptureRequest::single(DataType::Depth))
        .await
        .unwrap();
    assert_eq!(single.frames.len(), 1);
    assert_eq!(single.frames[0].data_type, DataType::Depth);

    let handle = camera
        .capture()
        .start(CaptureRequest::multiple(10, DataType::Depth))
        .unwrap();
    sim.set_stalled(true);
    camera.session().disconnect().await.unwrap();

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, CaptureError::Cancelled { partial: None }));
    assert_eq!(camera.stream().state(), StreamState::Stopped);
    assert_eq!(camera.session().state(), SessionState::Disconnected);
    assert!(!sim.is_open());
    // 只有第一次单帧采集的结果
    assert_eq!(saver.saved().len(), 1);

    let codes = drain(&events);
    assert!(codes.contains(&StatusCode::PreviewStopped(StopReason::Disconnected)));
    assert!(codes.contains(&StatusCode::CaptureCancelled { job: JobId(2) }));
    assert_eq!(codes.last(), Some(&StatusCode::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn hdr_capture_saves_levels_in_order_and_restores_configuration() {
    let (camera, sim, saver) = memory_camera();
    let preview = StreamConfig::new()
        .resolution(320, 240)
        .data_types(DataTypes::RGB | DataTypes::DEPTH)
        .roi(Roi::new(0.2, 0.2, 0.6, 0.6));
    camera.open_preview(preview.clone()).await.unwrap();

    let levels = vec![
        HdrLevel::new(1_000, 1.0),
        HdrLevel::new(5_000, 2.0),
        HdrLevel::new(10_000, 4.0),
    ];
    let output = camera
        .capture_once(CaptureRequest::hdr(
            Some(levels.clone()),
            DataTypes::RGB | DataTypes::DEPTH,
        ))
        .await
        .unwrap();

    let hdr = output.hdr.as_ref().unwrap();
    assert_eq!(hdr.components.len(), 3);
    for (component, level) in hdr.components.iter().zip(&levels) {
        assert_eq!(component.level, *level);
        let types: Vec<_> = component.frames.iter().map(|f| f.data_type).collect();
        assert_eq!(types, vec![DataType::Rgb, DataType::Depth]);
    }
    assert_eq!(hdr.merged.len(), 2);
    assert_eq!(output.frames.len(), 6);

    // 各档位 RGB 亮度随曝光量增长：25, 250, 饱和
    let saved = saver.saved();
    let rgb_levels: Vec<u8> = (0..3)
        .map(|i| {
            let name = format!("level{}_rgb.png", i);
            saved
                .iter()
                .find(|s| s.path.ends_with(&name))
                .map(|s| s.data[0])
                .unwrap()
        })
        .collect();
    assert_eq!(rgb_levels, vec![25, 250, 255]);

    let merged_rgb = saved
        .iter()
        .find(|s| s.path.ends_with("hdr_rgb.png"))
        .unwrap();
    assert!((merged_rgb.data[0] as i32 - 250).abs() <= 1);

    // 融合深度只在 ROI 内有值
    let merged_depth = saved
        .iter()
        .find(|s| s.path.ends_with("hdr_depth.png"))
        .unwrap();
    let depth: Vec<u16> = merged_depth
        .data
        .chunks_exact(2)
        .map(|c| u16::from_ne_bytes([c[0], c[1]]))
        .collect();
    assert_eq!(depth[0], 0);
    assert_eq!(depth[120 * 320 + 160], 2_600);

    assert_eq!(camera.params().effective(), Some(preview.clone()));
    assert_eq!(sim.current_config(), Some(preview));
    assert_eq!(camera.stream().state(), StreamState::Running);
}

#[tokio::test(start_paused = true)]
async fn hdr_level_timeout_discards_levels_and_restores_configuration() {
    let mut config = EngineConfig::default();
    // 卡死的设备在重试耗尽之前先触发档位超时
    config.capture.hdr_level_timeout_ms = 1_000;
    let (camera, sim, saver) = memory_camera_with(config);
    let preview = depth_preview();
    camera.open_preview(preview.clone()).await.unwrap();

    let handle = camera
        .capture()
        .start(CaptureRequest::hdr(Some(three_levels()), DataType::Depth))
        .unwrap();
    handle
        .subscribe()
        .wait_for(|j| j.progress >= 1)
        .await
        .unwrap();
    sim.set_stalled(true);

    let mut job = handle.subscribe();
    assert!(matches!(
        handle.wait().await,
        Err(CaptureError::HdrLevelTimeout { level: 1 })
    ));
    assert_eq!(job.borrow_and_update().status, JobStatus::Failed);
    assert!(saver.saved().is_empty());
    assert_eq!(camera.params().effective(), Some(preview.clone()));
    assert_eq!(sim.current_config(), Some(preview));
}

#[tokio::test(start_paused = true)]
async fn hdr_cancel_restores_configuration() {
    let (camera, sim, saver) = memory_camera();
    let events = camera.status().subscribe();
    let preview = depth_preview();
    camera.open_preview(preview.clone()).await.unwrap();

    let handle = camera
        .capture()
        .start(CaptureRequest::hdr(Some(three_levels()), DataType::Depth))
        .unwrap();
    handle
        .subscribe()
        .wait_for(|j| j.progress >= 1)
        .await
        .unwrap();
    handle.cancel();
    assert!(matches!(
        handle.wait().await,
        Err(CaptureError::Cancelled { partial: None })
    ));
    assert!(saver.saved().is_empty());
    assert_eq!(camera.params().effective(), Some(preview.clone()));
    assert_eq!(sim.current_config(), Some(preview.clone()));
    assert_eq!(camera.stream().state(), StreamState::Running);

    let codes = drain(&events);
    assert!(codes.contains(&StatusCode::HdrLevelCaptured {
        job: JobId(1),
        level: 0,
        of: 3
    }));
    assert!(codes.contains(&StatusCode::CaptureCancelled { job: JobId(1) }));

    // 请求部分结果时交付已完成的档位
    let handle = camera
        .capture()
        .start(CaptureRequest::hdr(Some(three_levels()), DataType::Depth).deliver_partial(true))
        .unwrap();
    handle
        .subscribe()
        .wait_for(|j| j.progress >= 1)
        .await
        .unwrap();
    handle.cancel();
    match handle.wait().await {
        Err(CaptureError::Cancelled {
            partial: Some(partial),
        }) => {
            assert_eq!(partial.frames.len(), 1);
            assert!(partial.frames[0].path.ends_with("level0_depth.png"));
            assert_eq!(saver.saved().len(), 1);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(sim.current_config(), Some(preview));
}

#[tokio::test(start_paused = true)]
async fn hdr_without_levels_uses_auto_ladder() {
    let (camera, _sim, _saver) = memory_camera();
    camera
        .open_preview(StreamConfig::new().resolution(320, 240).data_types(DataTypes::IR_LEFT))
        .await
        .unwrap();

    let output = camera
        .capture_once(CaptureRequest::hdr(None, DataType::IrLeft))
        .await
        .unwrap();
    let components = output.hdr.unwrap().components;
    let used: Vec<_> = components.iter().map(|c| c.level).collect();
    assert_eq!(used, camera.config().capture.auto_hdr_levels);
}

#[tokio::test(start_paused = true)]
async fn second_job_is_rejected_while_first_runs() {
    let (camera, _sim, _saver) = memory_camera();
    let events = camera.status().subscribe();
    camera.open_preview(depth_preview()).await.unwrap();

    let first = camera
        .capture()
        .start(CaptureRequest::multiple(50, DataType::Depth))
        .unwrap();
    assert!(camera.capture().is_busy());
    let second = camera.capture().start(CaptureRequest::single(DataType::Depth));
    assert!(matches!(second, Err(CaptureError::Busy)));
    assert!(drain(&events).contains(&StatusCode::CaptureRejected(CaptureFailure::Busy)));

    camera.capture().cancel(&first);
    assert!(first.wait().await.is_err());
    assert!(!camera.capture().is_busy());
    camera
        .capture_once(CaptureRequest::single(DataType::Depth))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn device_gaps_are_counted_as_drops() {
    let (camera, sim, _saver) = memory_camera();
    camera.open_preview(depth_preview()).await.unwrap();

    let handle = camera
        .capture()
        .start(CaptureRequest::multiple(5, DataType::Depth))
        .unwrap();
    let mut job = handle.subscribe();
    job.wait_for(|j| j.progress >= 1).await.unwrap();
    sim.inject_gap(2);

    let output = handle.wait().await.unwrap();
    assert_eq!(output.frames.len(), 5);
    assert_eq!(output.dropped, 2);
    assert_eq!(job.borrow().status, JobStatus::Completed);
    assert_eq!(job.borrow().dropped, 2);
}

#[tokio::test(start_paused = true)]
async fn slow_job_queue_overflow_is_counted_as_drops() {
    let mut config = EngineConfig::default();
    config.capture.queue_depth = 1;
    let (camera, sim, _saver) = memory_camera_with(config);
    let events = camera.status().subscribe();
    camera.open_preview(depth_preview()).await.unwrap();

    let handle = camera
        .capture()
        .start(CaptureRequest::multiple(3, DataType::Depth))
        .unwrap();
    handle
        .subscribe()
        .wait_for(|j| j.progress >= 1)
        .await
        .unwrap();
    // 五帧一次性到达，作业队列只放得下第一帧
    sim.burst(5);

    let output = handle.wait().await.unwrap();
    assert_eq!(output.frames.len(), 3);
    assert_eq!(output.dropped, 4);
    let codes = drain(&events);
    assert!(codes.contains(&StatusCode::CaptureFrameDropped {
        job: JobId(1),
        total: 4
    }));
    assert!(codes
        .iter()
        .any(|c| matches!(c, StatusCode::FrameDropped { total: 4, .. })));
}

#[tokio::test(start_paused = true)]
async fn huge_frame_count_can_be_cancelled() {
    let (camera, _sim, saver) = memory_camera();
    camera.open_preview(depth_preview()).await.unwrap();

    let handle = camera
        .capture()
        .start(CaptureRequest::multiple(u32::MAX, DataType::Depth))
        .unwrap();
    assert_eq!(handle.job().requested, u32::MAX);
    handle
        .subscribe()
        .wait_for(|j| j.progress >= 2)
        .await
        .unwrap();
    handle.cancel();
    assert!(matches!(
        handle.wait().await,
        Err(CaptureError::Cancelled { partial: None })
    ));
    assert!(saver.saved().is_empty());
}

#[tokio::test(start_paused = true)]
async fn drop_threshold_fails_the_job() {
    let (camera, sim, saver) = memory_camera();
    camera.open_preview(depth_preview()).await.unwrap();

    let handle = camera
        .capture()
        .start(CaptureRequest::multiple(5, DataType::Depth).max_drops(1))
        .unwrap();
    let mut job = handle.subscribe();
    job.wait_for(|j| j.progress >= 1).await.unwrap();
    sim.inject_gap(2);

    match handle.wait().await {
        Err(CaptureError::DropThresholdExceeded {
            dropped,
            threshold,
            missing,
        }) => {
            assert_eq!(threshold, 1);
            assert!(missing < 5);
            assert_eq!(dropped, 2 + missing as u64);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(saver.saved().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_discards_frames_unless_partial_requested() {
    let (camera, _sim, saver) = memory_camera();
    camera.open_preview(depth_preview()).await.unwrap();

    let handle = camera
        .capture()
        .start(CaptureRequest::multiple(100, DataType::Depth))
        .unwrap();
    handle
        .subscribe()
        .wait_for(|j| j.progress >= 2)
        .await
        .unwrap();
    handle.cancel();
    assert!(matches!(
        handle.wait().await,
        Err(CaptureError::Cancelled { partial: None })
    ));
    assert!(saver.saved().is_empty());

    let handle = camera
        .capture()
        .start(CaptureRequest::multiple(100, DataType::Depth).deliver_partial(true))
        .unwrap();
    handle
        .subscribe()
        .wait_for(|j| j.progress >= 2)
        .await
        .unwrap();
    handle.cancel();
    match handle.wait().await {
        Err(CaptureError::Cancelled {
            partial: Some(partial),
        }) => {
            assert!(partial.frames.len() >= 2);
            assert_eq!(saver.saved().len(), partial.frames.len());
        }
        other => panic!("unexpected result {other:?}"),
    }
    // 取消后预览不受影响
    assert_eq!(camera.stream().state(), StreamState::Running);
}

#[tokio::test(start_paused = true)]
async fn save_failure_removes_already_saved_frames() {
    let (camera, _sim, saver) = memory_camera();
    camera.open_preview(depth_preview()).await.unwrap();
    saver.fail_after(2);

    let err = camera
        .capture()
        .start(CaptureRequest::multiple(4, DataType::Depth))
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, CaptureError::Save(_)));
    assert!(saver.saved().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejects_capture_without_connection_or_preview() {
    let (camera, _sim, _saver) = memory_camera();
    let events = camera.status().subscribe();

    let request = CaptureRequest::single(DataType::Depth);
    assert!(matches!(
        camera.capture().start(request.clone()),
        Err(CaptureError::NotConnected)
    ));

    camera.session().connect().await.unwrap();
    assert!(matches!(
        camera.capture().start(request.clone()),
        Err(CaptureError::StreamNotRunning)
    ));

    camera.stream().start(depth_preview()).await.unwrap();
    assert!(matches!(
        camera.capture().start(CaptureRequest::single(DataType::Rgb)),
        Err(CaptureError::InvalidRequest(_))
    ));
    assert!(matches!(
        camera.capture().start(CaptureRequest::multiple(0, DataType::Depth)),
        Err(CaptureError::InvalidRequest(_))
    ));

    let codes = drain(&events);
    assert!(codes.contains(&StatusCode::CaptureRejected(CaptureFailure::NotConnected)));
    assert!(codes.contains(&StatusCode::CaptureRejected(CaptureFailure::StreamNotRunning)));
    assert!(codes.contains(&StatusCode::CaptureRejected(CaptureFailure::InvalidRequest)));
}

#[tokio::test(start_paused = true)]
async fn invalid_hdr_level_is_rejected_before_the_job_starts() {
    let (camera, sim, _saver) = memory_camera();
    camera.open_preview(depth_preview()).await.unwrap();
    sim.clear_parameter_writes();

    let request = CaptureRequest::hdr(Some(vec![HdrLevel::new(1_000, 99.0)]), DataType::Depth);
    assert!(matches!(
        camera.capture().start(request),
        Err(CaptureError::Parameter(ParamError::InvalidParameter(_)))
    ));
    assert!(sim.parameter_writes().is_empty());
    assert!(!camera.capture().is_busy());
}

#[tokio::test(start_paused = true)]
async fn unplug_tears_down_session_and_preview() {
    let (camera, sim, _saver) = memory_camera();
    let mut device_events = camera.session().subscribe_events();
    camera.open_preview(depth_preview()).await.unwrap();
    assert!(matches!(
        device_events.recv().await.unwrap(),
        DeviceEvent::Connected(_)
    ));

    sim.unplug();
    camera
        .session()
        .subscribe_state()
        .wait_for(|s| *s == SessionState::Disconnected)
        .await
        .unwrap();
    camera
        .stream()
        .subscribe_state()
        .wait_for(|s| *s == StreamState::Stopped)
        .await
        .unwrap();

    assert!(matches!(
        device_events.recv().await.unwrap(),
        DeviceEvent::Removed { .. }
    ));
    assert!(matches!(
        camera.capture().start(CaptureRequest::single(DataType::Depth)),
        Err(CaptureError::NotConnected)
    ));
    camera.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn preview_restart_with_new_config_is_seen_by_consumers() {
    let (camera, _sim, _saver) = memory_camera();
    camera.open_preview(depth_preview()).await.unwrap();
    let mut consumer = camera.stream().subscribe(4);
    let first = consumer.recv().await.unwrap();
    assert_eq!((first.width, first.height), (320, 240));

    let larger = depth_preview().resolution(640, 480);
    camera.open_preview(larger.clone()).await.unwrap();
    assert_eq!(camera.stream().active_config(), Some(larger));

    // 旧配置下排队的帧之后，总能收到新尺寸的帧
    let resized = loop {
        let frame = consumer.recv().await.unwrap();
        if frame.width == 640 {
            break frame;
        }
    };
    assert_eq!(
        Resolution::new(resized.width, resized.height),
        Resolution::new(640, 480)
    );
    assert!(resized.generation > first.generation);
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_idempotent() {
    let (camera, _sim, _saver) = memory_camera();
    camera.shutdown().await.unwrap();
    camera.open_preview(depth_preview()).await.unwrap();
    camera.shutdown().await.unwrap();
    camera.shutdown().await.unwrap();
    assert_eq!(camera.session().state(), SessionState::Disconnected);
    assert!(!camera.stream().state().is_active());
}
