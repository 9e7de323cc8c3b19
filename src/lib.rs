//! uvc-driver: an external-camera driver plugin for UVC webcams
//!
//! This library implements the host's external-camera plugin interface on top
//! of USB Video Class devices. Devices are discovered and claimed through a
//! platform [`Bridge`](traits::Bridge) (JNI on Android, sysfs on desktop Linux)
//! and driven through a [`Transport`](traits::Transport) (V4L2, or libuvc with
//! the `libuvc` feature). Both seams are traits, enabling production use with
//! real hardware and testing with mock devices.

pub mod bridge;
pub mod calibration;
pub mod camera;
pub mod config;
pub mod controls;
pub mod driver;
pub mod ffi;
pub mod frame;
pub mod logging;
pub mod modes;
pub mod traits;
pub mod transport;

#[cfg(test)]
pub mod mock;

pub use camera::{Capabilities, ExternalCamera, SessionState};
pub use config::DriverConfig;
pub use driver::Driver;
pub use traits::{
    Bridge, CameraFrame, CameraIntrinsics, CameraMode, DeviceHandle, DriverError, ExposureMode,
    FocusMode, FrameSink, PixelFormat, Transport,
};
