use std::sync::Arc;

use depthcam::prelude::*;
use depthcam_simulation::single_camera_driver;

fn all_outputs() -> StreamConfig {
    StreamConfig::new()
        .resolution(320, 240)
        .data_types(DataTypes::RGB | DataTypes::DEPTH | DataTypes::POINT_CLOUD)
}

#[tokio::test(start_paused = true)]
async fn single_capture_writes_one_file_per_type() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _sim) = single_camera_driver("cam0");
    let mut config = EngineConfig::default();
    config.capture.output_dir = dir.path().to_path_buf();
    let camera = DepthCamera::new(driver, config);

    camera.open_preview(all_outputs()).await.unwrap();
    let output = camera
        .capture_once(CaptureRequest::single(
            DataTypes::RGB | DataTypes::DEPTH | DataTypes::POINT_CLOUD,
        ))
        .await
        .unwrap();

    let paths = output.saved_paths();
    assert_eq!(paths.len(), 3);
    for path in &paths {
        assert!(path.starts_with(dir.path().join("job-0001")));
        assert!(path.is_file(), "{} missing", path.display());
    }
    let names: Vec<_> = paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names.contains(&"rgb_0001.png".to_string()));
    assert!(names.contains(&"depth_0001.png".to_string()));
    assert!(names.contains(&"point_cloud_0001.ply".to_string()));

    let rgb = image::open(dir.path().join("job-0001/rgb_0001.png"))
        .unwrap()
        .to_rgb8();
    assert_eq!(rgb.dimensions(), (320, 240));

    camera.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn raw_format_keeps_frame_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _sim) = single_camera_driver("cam0");
    let saver = Arc::new(FileSaveStrategy::new(dir.path()));
    let camera = DepthCamera::with_save_strategy(driver, EngineConfig::default(), saver);

    camera
        .open_preview(StreamConfig::new().resolution(320, 240))
        .await
        .unwrap();
    let output = camera
        .capture_once(CaptureRequest::multiple(3, DataType::Depth).save_format(SaveFormat::Raw))
        .await
        .unwrap();

    assert_eq!(output.frame_count(DataType::Depth), 3);
    for frame in &output.frames {
        assert_eq!(frame.path.extension().unwrap(), "raw");
        let bytes = std::fs::read(&frame.path).unwrap();
        assert_eq!(bytes.len(), 320 * 240 * 2);
    }
    let sequences: Vec<_> = output.frames.iter().map(|f| f.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn engine_loads_configuration_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let output_dir = dir.path().join("out");
    let path = dir.path().join("engine.json");
    std::fs::write(
        &path,
        format!(
            r#"{{
                "session": {{ "device_id": "cam0" }},
                "capture": {{ "hdr_settle_frames": 1, "output_dir": {:?}, "default_save_format": "Raw" }}
            }}"#,
            output_dir.to_string_lossy()
        ),
    )?;

    let (driver, _sim) = single_camera_driver("cam0");
    let camera = DepthCamera::from_config_file(driver, &path)?;
    assert_eq!(camera.config().session.device_id.as_deref(), Some("cam0"));
    assert_eq!(camera.config().capture.hdr_settle_frames, 1);
    assert_eq!(camera.config().stream, EngineConfig::default().stream);

    camera
        .open_preview(StreamConfig::new().resolution(320, 240))
        .await?;
    let output = camera
        .capture_once(CaptureRequest::single(DataType::Depth))
        .await?;
    assert!(output.frames[0].path.starts_with(&output_dir));
    assert_eq!(output.frames[0].path.extension().unwrap(), "raw");
    Ok(())
}

#[test]
fn missing_configuration_file_is_reported() {
    let (driver, _sim) = single_camera_driver("cam0");
    let err = DepthCamera::from_config_file(driver, "/nonexistent/engine.json").unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/engine.json"));
}
