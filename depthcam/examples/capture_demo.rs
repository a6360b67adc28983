// depthcam/examples/capture_demo.rs
//
// 在虚拟相机上跑一遍完整流程：连接 → 预览 → 单帧 → 多帧 → HDR → 断开
// 采集结果写到 ./captures (或第一个命令行参数指定的目录)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use depthcam::prelude::*;
use depthcam_simulation::SimDriver;
use depthcam_simulation::SimCamera;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // 1. 准备一台虚拟相机
    let camera = SimCamera::builder("sim-0")
        .name("Simulated RGB-D")
        .frame_interval(Duration::from_millis(33))
        .build();
    let driver: Arc<dyn Driver> = Arc::new(SimDriver::new().with_camera(camera));

    let mut config = EngineConfig::default();
    if let Some(dir) = std::env::args().nth(1) {
        config.capture.output_dir = dir.into();
    }
    let engine = DepthCamera::new(driver, config);

    // 状态码交给一个普通线程打印 (UI 线程的替身)
    let events = engine.status().subscribe();
    std::thread::spawn(move || {
        for event in events.iter() {
            println!("[status #{:03}] {:?}", event.seq, event.code);
        }
    });

    // 2. 连接并启动预览
    let preview = StreamConfig::new()
        .resolution(640, 480)
        .data_types(DataTypes::RGB | DataTypes::DEPTH)
        .roi(Roi::new(0.2, 0.2, 0.6, 0.6));
    let info = engine.open_preview(preview).await?;
    println!(
        "Connected: {} (serial {}, firmware {})",
        info.identity.model, info.identity.serial, info.identity.firmware_version
    );

    // 预览消费者：数几帧
    let mut viewer = engine.stream().subscribe(4);
    for _ in 0..5 {
        if let Some(frame) = viewer.recv().await {
            println!(
                "preview #{} {:?} {}x{} gen {}",
                frame.sequence, frame.data_type, frame.width, frame.height, frame.generation
            );
        }
    }

    // 3. 单帧
    let single = engine
        .capture_once(CaptureRequest::single(DataTypes::RGB | DataTypes::DEPTH))
        .await?;
    println!("single: {:?}", single.saved_paths());

    // 4. 多帧
    let burst = engine
        .capture_once(CaptureRequest::multiple(5, DataType::Depth))
        .await?;
    println!("burst: {} frames, {} dropped", burst.frames.len(), burst.dropped);

    // 5. HDR (自动档位表)
    let hdr = engine
        .capture_once(CaptureRequest::hdr(None, DataTypes::RGB | DataTypes::DEPTH))
        .await?;
    if let Some(outcome) = &hdr.hdr {
        println!(
            "hdr: {} levels, merged {:?}",
            outcome.components.len(),
            outcome.merged.iter().map(|f| &f.path).collect::<Vec<_>>()
        );
    }

    println!("telemetry: {:?}", engine.stream().telemetry());

    // 6. 断开
    engine.shutdown().await?;
    Ok(())
}
