//! Bridges supplying USB devices and calibration data to the session.

#[cfg(any(target_os = "android", feature = "jni-test"))]
pub mod jni;
pub mod sysfs;

#[cfg(any(target_os = "android", feature = "jni-test"))]
pub use self::jni::{JavaPlatform, JniBridge};
pub use sysfs::SysfsBridge;
