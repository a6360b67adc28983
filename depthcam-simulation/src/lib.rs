#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod device;
mod pattern;

pub use device::{default_limits, InjectedFault, SimCamera, SimCameraBuilder, SimHandle};

use std::sync::Arc;

use async_trait::async_trait;
use depthcam_core::error::{DeviceError, Result};
use depthcam_core::traits::{DeviceHandle, DeviceInfo, Driver};

/// 模拟驱动：持有一组虚拟相机
#[derive(Debug, Clone, Default)]
pub struct SimDriver {
    cameras: Vec<SimCamera>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, camera: SimCamera) -> Self {
        self.cameras.push(camera);
        self
    }

    pub fn camera(&self, id: &str) -> Option<&SimCamera> {
        self.cameras.iter().find(|c| c.id() == id)
    }
}

#[async_trait]
impl Driver for SimDriver {
    fn probe(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .cameras
            .iter()
            .filter(|c| !c.is_unplugged())
            .map(SimCamera::info)
            .collect())
    }

    async fn open(&self, id: &str) -> Result<Box<dyn DeviceHandle>> {
        let camera = self
            .camera(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;

        let delay = camera.open_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(Box::new(camera.open_handle()?))
    }
}

/// 单相机的模拟驱动，方便直接使用
pub fn single_camera_driver(id: &str) -> (Arc<dyn Driver>, SimCamera) {
    let camera = SimCamera::new(id);
    let driver = SimDriver::new().with_camera(camera.clone());
    (Arc::new(driver), camera)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcam_core::config::StreamConfig;
    use depthcam_core::control::{ParamKey, ParamValue};
    use depthcam_core::pixel_format::{DataType, DataTypes};
    use depthcam_core::traits::PullOutcome;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn open_streaming(types: DataTypes) -> (Box<dyn DeviceHandle>, SimCamera) {
        let camera = SimCamera::builder("cam0")
            .frame_interval(Duration::from_millis(10))
            .build();
        let driver = SimDriver::new().with_camera(camera.clone());
        let handle = driver.open("cam0").await.unwrap();
        for (key, value) in StreamConfig::new()
            .resolution(320, 240)
            .data_types(types)
            .to_params()
        {
            handle.set_parameter(key, value).unwrap();
        }
        handle.start_stream().await.unwrap();
        (handle, camera)
    }

    fn frame(outcome: PullOutcome) -> depthcam_core::frame::RawFrame {
        match outcome {
            PullOutcome::Frame(f) => f,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn driver_lists_plugged_cameras() {
        let (driver, camera) = single_camera_driver("cam0");
        assert_eq!(driver.probe().unwrap().len(), 1);
        camera.unplug();
        assert!(driver.probe().unwrap().is_empty());
        assert!(matches!(
            driver.open("cam0").await,
            Err(DeviceError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn second_open_is_busy() {
        let (driver, _camera) = single_camera_driver("cam0");
        let _first = driver.open("cam0").await.unwrap();
        assert!(matches!(
            driver.open("cam0").await,
            Err(DeviceError::DeviceBusy)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_arrive_per_type_with_increasing_indices() {
        let (handle, _camera) = open_streaming(DataTypes::RGB | DataTypes::DEPTH).await;
        let a = frame(handle.pull_frame(TIMEOUT).await);
        let b = frame(handle.pull_frame(TIMEOUT).await);
        let c = frame(handle.pull_frame(TIMEOUT).await);
        assert_eq!(a.data_type, DataType::Rgb);
        assert_eq!(b.data_type, DataType::Depth);
        assert_eq!(c.data_type, DataType::Rgb);
        assert_eq!(a.device_index, 1);
        assert_eq!(c.device_index, 2);
        assert_eq!(b.data.len(), 320 * 240 * 2);
        assert!(c.hw_timestamp_ns > a.hw_timestamp_ns);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_gap_skips_device_indices() {
        let (handle, camera) = open_streaming(DataTypes::DEPTH).await;
        assert_eq!(frame(handle.pull_frame(TIMEOUT).await).device_index, 1);
        camera.inject_gap(3);
        assert_eq!(frame(handle.pull_frame(TIMEOUT).await).device_index, 5);
        assert_eq!(frame(handle.pull_frame(TIMEOUT).await).device_index, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_pulled_without_waiting() {
        let (handle, camera) = open_streaming(DataTypes::DEPTH).await;
        assert_eq!(frame(handle.pull_frame(TIMEOUT).await).device_index, 1);
        camera.burst(3);
        assert_eq!(frame(handle.pull_frame(TIMEOUT).await).device_index, 2);

        let start = tokio::time::Instant::now();
        assert_eq!(frame(handle.pull_frame(TIMEOUT).await).device_index, 3);
        assert_eq!(frame(handle.pull_frame(TIMEOUT).await).device_index, 4);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(frame(handle.pull_frame(TIMEOUT).await).device_index, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_device_times_out() {
        let (handle, camera) = open_streaming(DataTypes::DEPTH).await;
        camera.set_stalled(true);
        assert!(matches!(
            handle.pull_frame(TIMEOUT).await,
            PullOutcome::Timeout
        ));
        camera.set_stalled(false);
        camera.fail_next_pulls(1);
        assert!(matches!(
            handle.pull_frame(TIMEOUT).await,
            PullOutcome::Timeout
        ));
        frame(handle.pull_frame(TIMEOUT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_in_flight_does_not_consume_injected_timeouts() {
        let (handle, camera) = open_streaming(DataTypes::DEPTH).await;
        let handle: Arc<dyn DeviceHandle> = Arc::from(handle);
        let in_flight = tokio::spawn({
            let handle = handle.clone();
            async move { handle.pull_frame(TIMEOUT).await }
        });
        tokio::task::yield_now().await;
        camera.fail_next_pulls(2);

        frame(in_flight.await.unwrap());
        for _ in 0..2 {
            assert!(matches!(
                handle.pull_frame(TIMEOUT).await,
                PullOutcome::Timeout
            ));
        }
        frame(handle.pull_frame(TIMEOUT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn unplug_fires_callback_and_faults_pulls() {
        let (handle, camera) = open_streaming(DataTypes::DEPTH).await;
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        handle.set_removal_callback(Box::new(move || flag.store(true, Ordering::SeqCst)));

        camera.unplug();
        assert!(fired.load(Ordering::SeqCst));
        assert!(matches!(
            handle.pull_frame(TIMEOUT).await,
            PullOutcome::Fault(DeviceError::Disconnected(_))
        ));
        assert!(handle
            .set_parameter(ParamKey::Gain, ParamValue::Gain(2.0))
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_parameter_is_not_stored() {
        let (handle, camera) = open_streaming(DataTypes::DEPTH).await;
        camera.reject_parameter(Some(ParamKey::Gain));
        assert!(handle
            .set_parameter(ParamKey::Gain, ParamValue::Gain(4.0))
            .is_err());
        assert_eq!(camera.parameter(ParamKey::Gain), Some(ParamValue::Gain(1.0)));
        assert!(handle
            .set_parameter(ParamKey::Gain, ParamValue::Micros(4))
            .is_err());
    }
}
