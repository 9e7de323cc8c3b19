//! USB video transports.
//!
//! [`v4l2`] drives cameras through the kernel's uvcvideo driver and is always
//! built. [`libuvc`] talks to the device directly through a platform-supplied
//! file descriptor and needs the `libuvc` feature plus the native library.

#[cfg(feature = "libuvc")]
pub mod libuvc;
pub mod v4l2;

#[cfg(feature = "libuvc")]
pub use self::libuvc::LibuvcTransport;
pub use v4l2::{V4l2Handle, V4l2Transport};
