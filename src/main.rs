//! uvc-driver binary for exercising a camera session without a host.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use uvc_driver::bridge::SysfsBridge;
use uvc_driver::transport::V4l2Transport;
use uvc_driver::{logging, CameraFrame, DriverConfig, ExternalCamera, FrameSink};

struct PrintSink;

impl FrameSink for PrintSink {
    fn on_new_camera_frame(&self, frame: &CameraFrame<'_>) {
        println!(
            "Frame {}: {} bytes, {}x{} stride {}, timestamp: {} ns, exposure: {} ns",
            frame.index,
            frame.buffer.len(),
            frame.width,
            frame.height,
            frame.stride,
            frame.timestamp,
            frame.exposure_time
        );
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> uvc_driver::traits::Result<()> {
    let config = DriverConfig::from_env();
    logging::init(&config.log_filter);

    let mut camera = ExternalCamera::new(SysfsBridge::new(&config), V4l2Transport::default());
    camera.open()?;

    if let Some(id) = camera.identity() {
        println!("Device: {:04x}:{:04x}", id.vendor_id, id.product_id);
    }

    let count = camera.num_supported_camera_modes();
    for index in 0..count {
        let mode = camera.supported_camera_mode(index)?;
        println!("Mode {index}: {}x{} @ {} fps", mode.width, mode.height, mode.fps);
    }

    println!("Exposure mode: {:?}", camera.exposure_mode());
    if camera.supports_exposure_value() {
        println!(
            "Exposure: {} ns ({}..{})",
            camera.exposure_value()?,
            camera.exposure_value_min()?,
            camera.exposure_value_max()?
        );
    }
    println!("Focus mode: {:?}", camera.focus_mode());

    let mode = camera.supported_camera_mode(0)?;
    camera.start(mode, Some(Arc::new(PrintSink)))?;
    thread::sleep(Duration::from_secs(3));
    camera.stop()?;
    camera.close();

    Ok(())
}
