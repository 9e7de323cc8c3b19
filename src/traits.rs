//! Core traits and types for the UVC driver.
//!
//! The session logic in [`crate::camera`] is written against the traits in
//! this module only: [`Bridge`] supplies USB devices and calibration data,
//! [`Transport`] and [`DeviceHandle`] speak the UVC control and streaming
//! vocabulary, and [`FrameSink`] receives finished frames.

use std::sync::Arc;

use thiserror::Error;

/// Four-character code of a pixel format, as reported by a format descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUY2 as carried in a UVC uncompressed format GUID.
    pub const YUY2: Self = Self::new(b"YUY2");
    /// YUYV as named by V4L2 (same layout as YUY2).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Pixel formats known to the host. Discriminants are the host's values.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// Unknown format.
    #[default]
    Unknown = 0,
    /// YUV 4:2:2, single interleaved plane (same as YUY2).
    Yuyv = 1,
    /// YUV 4:2:0, Y plane + interleaved UV plane.
    Nv12 = 2,
    /// YUV 4:2:0, Y plane + interleaved VU plane.
    Nv21 = 3,
}

impl From<i32> for PixelFormat {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::Yuyv,
            2 => Self::Nv12,
            3 => Self::Nv21,
            _ => Self::Unknown,
        }
    }
}

/// Exposure modes known to the host.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExposureMode {
    /// Unknown exposure mode; also the failure sentinel.
    #[default]
    Unknown = 0,
    /// Single trigger auto exposure.
    Auto = 1,
    /// Continuous auto exposure.
    ContinuousAuto = 2,
    /// Manual exposure.
    Manual = 3,
    /// Shutter priority.
    ShutterPriority = 4,
}

impl From<i32> for ExposureMode {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::Auto,
            2 => Self::ContinuousAuto,
            3 => Self::Manual,
            4 => Self::ShutterPriority,
            _ => Self::Unknown,
        }
    }
}

/// Focus modes known to the host.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusMode {
    /// Unknown focus mode; also the failure sentinel.
    #[default]
    Unknown = 0,
    /// Single trigger auto focus.
    Auto = 1,
    /// Continuous auto focus.
    ContinuousAuto = 2,
    /// Macro range.
    Macro = 3,
    /// Focus to infinity.
    InfinityFocus = 4,
    /// Fixed focus.
    Fixed = 5,
}

impl From<i32> for FocusMode {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::Auto,
            2 => Self::ContinuousAuto,
            3 => Self::Macro,
            4 => Self::InfinityFocus,
            5 => Self::Fixed,
            _ => Self::Unknown,
        }
    }
}

/// Size, frame rate and pixel format of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CameraMode {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frames per second.
    pub fps: u32,
    /// Pixel format.
    pub format: PixelFormat,
}

impl CameraMode {
    /// Create a new camera mode.
    #[must_use]
    pub const fn new(width: u32, height: u32, fps: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            fps,
            format,
        }
    }
}

/// Number of floats in a calibration record handed over by a [`Bridge`].
pub const CALIBRATION_LEN: usize = 12;

/// Optical calibration of a camera at one frame size.
///
/// All-zero values mean "not calibrated".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CameraIntrinsics {
    /// Focal length x-component.
    pub focal_length_x: f32,
    /// Focal length y-component.
    pub focal_length_y: f32,
    /// Principal point x-component.
    pub principal_point_x: f32,
    /// Principal point y-component.
    pub principal_point_y: f32,
    /// Distortion coefficients.
    pub distortion_coefficients: [f32; 8],
}

impl CameraIntrinsics {
    /// Build intrinsics from a calibration record laid out as
    /// `[ppx, ppy, fx, fy, d0..d7]`.
    ///
    /// Returns `None` when the record does not have exactly
    /// [`CALIBRATION_LEN`] values.
    #[must_use]
    pub fn from_calibration(values: &[f32]) -> Option<Self> {
        let values: &[f32; CALIBRATION_LEN] = values.try_into().ok()?;
        let [ppx, ppy, fx, fy, d0, d1, d2, d3, d4, d5, d6, d7] = *values;
        Some(Self {
            focal_length_x: fx,
            focal_length_y: fy,
            principal_point_x: ppx,
            principal_point_y: ppy,
            distortion_coefficients: [d0, d1, d2, d3, d4, d5, d6, d7],
        })
    }

    /// Whether any calibration value is set.
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        *self != Self::default()
    }
}

/// A frame as handed to a [`FrameSink`].
///
/// The pixel buffer belongs to the transport and is only valid for the
/// duration of the delivery call.
#[derive(Debug, Clone, Copy)]
pub struct CameraFrame<'a> {
    /// Timestamp in nanoseconds on the monotonic clock.
    pub timestamp: u64,
    /// Exposure duration in nanoseconds.
    pub exposure_time: u64,
    /// Pixel data.
    pub buffer: &'a [u8],
    /// Frame index, ascending.
    pub index: u32,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Bytes per row.
    pub stride: u32,
    /// Pixel format.
    pub format: PixelFormat,
    /// Intrinsics in effect for this stream.
    pub intrinsics: CameraIntrinsics,
}

/// Receiver of assembled frames.
///
/// Called on the transport's delivery thread; implementations must not block.
pub trait FrameSink: Send + Sync {
    /// Handle one frame. The frame must not be retained past the call.
    fn on_new_camera_frame(&self, frame: &CameraFrame<'_>);
}

/// Frame formats in the transport's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// Not a format this driver negotiates.
    #[default]
    Unknown,
    /// Packed YUV 4:2:2.
    Yuyv,
    /// Motion JPEG.
    Mjpeg,
}

/// A frame as delivered by the transport.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    /// Pixel data, borrowed from the transport.
    pub data: &'a [u8],
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Frame format.
    pub format: FrameFormat,
    /// Bytes per row.
    pub step: u32,
    /// Transport sequence number.
    pub sequence: u32,
}

/// Video streaming descriptor subtypes (UVC 1.5, table A-6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorSubtype {
    /// `VS_FORMAT_UNCOMPRESSED`
    FormatUncompressed,
    /// `VS_FRAME_UNCOMPRESSED`
    FrameUncompressed,
    /// `VS_FORMAT_MJPEG`
    FormatMjpeg,
    /// `VS_FRAME_MJPEG`
    FrameMjpeg,
    /// `VS_FORMAT_FRAME_BASED`
    FormatFrameBased,
    /// `VS_FRAME_FRAME_BASED`
    FrameFrameBased,
    /// Any other subtype.
    Other(u8),
}

impl From<u8> for DescriptorSubtype {
    fn from(value: u8) -> Self {
        match value {
            0x04 => Self::FormatUncompressed,
            0x05 => Self::FrameUncompressed,
            0x06 => Self::FormatMjpeg,
            0x07 => Self::FrameMjpeg,
            0x10 => Self::FormatFrameBased,
            0x11 => Self::FrameFrameBased,
            other => Self::Other(other),
        }
    }
}

/// A frame-size descriptor of one format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Descriptor subtype.
    pub subtype: DescriptorSubtype,
    /// Frame width.
    pub width: u16,
    /// Frame height.
    pub height: u16,
    /// Discrete frame intervals in 100 ns units, in reported order.
    pub intervals: Vec<u32>,
}

/// A format descriptor and its frame descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    /// Descriptor subtype.
    pub subtype: DescriptorSubtype,
    /// Four-character code of the format.
    pub fourcc: FourCC,
    /// Frame descriptors in reported order.
    pub frames: Vec<FrameDescriptor>,
}

/// UVC control request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// `GET_CUR`
    Cur,
    /// `GET_MIN`
    Min,
    /// `GET_MAX`
    Max,
    /// `GET_RES`
    Res,
    /// `GET_DEF`
    Def,
}

impl ControlRequest {
    /// Request code as used on the wire.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Cur => 0x81,
            Self::Min => 0x82,
            Self::Max => 0x83,
            Self::Res => 0x84,
            Self::Def => 0x87,
        }
    }
}

/// Identity of a claimed USB device as supplied by the [`Bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbDeviceId {
    /// USB vendor id.
    pub vendor_id: i32,
    /// USB product id.
    pub product_id: i32,
    /// File descriptor of the open usbfs node, or -1.
    pub file_descriptor: i32,
    /// USB bus number.
    pub bus_number: i32,
    /// USB device address on the bus.
    pub device_number: i32,
}

/// Error type for driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The session has no open device handle.
    #[error("no device handle")]
    NoDevice,
    /// No USB candidate could be opened.
    #[error("no usb camera could be opened")]
    NoDeviceOpened,
    /// A bridge call failed.
    #[error("bridge error: {0}")]
    Bridge(String),
    /// A transport call returned an error code.
    #[error("transport error in {op}: code {code}")]
    Transport {
        /// Name of the failing operation.
        op: &'static str,
        /// Error code reported by the transport.
        code: i32,
    },
    /// Stream parameters could not be negotiated.
    #[error("stream negotiation failed: {0}")]
    Negotiation(String),
    /// The device or build does not support the request.
    #[error("not supported: {0}")]
    Unsupported(&'static str),
    /// An argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Callback invoked by the transport for every frame.
pub type FrameCallback = Box<dyn FnMut(&RawFrame<'_>) + Send>;

/// Reads the current absolute exposure (100 µs units) from the delivery thread.
pub type ExposureProbe = Box<dyn Fn() -> Result<u32> + Send>;

/// Shared frame sink, as registered at stream start.
pub type SharedSink = Arc<dyn FrameSink>;

/// Host-side helpers supplying USB devices and calibration data.
pub trait Bridge {
    /// Acquire the helper objects. Idempotent.
    fn attach(&mut self) -> Result<()>;

    /// Number of candidate USB devices.
    fn num_devices(&self) -> Result<i32>;

    /// Request exclusive use of the device at `index`.
    fn use_device(&mut self, index: i32) -> Result<bool>;

    /// Give up the device claimed by [`Bridge::use_device`].
    fn release_device(&mut self) -> Result<()>;

    /// Vendor id of the claimed device.
    fn vendor_id(&self) -> Result<i32>;

    /// Product id of the claimed device.
    fn product_id(&self) -> Result<i32>;

    /// File descriptor of the claimed device.
    fn file_descriptor(&self) -> Result<i32>;

    /// Root of the USB filesystem the claimed device lives on.
    fn usbfs(&self) -> Result<Option<String>>;

    /// Bus number of the claimed device.
    fn bus_number(&self) -> Result<i32>;

    /// Device number of the claimed device.
    fn device_number(&self) -> Result<i32>;

    /// Calibration record for a device at a frame size, if known.
    fn calibration_value(
        &self,
        vendor_id: i32,
        product_id: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<f32>>>;

    /// Collect the identity of the claimed device.
    fn device_identity(&self) -> Result<UsbDeviceId> {
        Ok(UsbDeviceId {
            vendor_id: self.vendor_id()?,
            product_id: self.product_id()?,
            file_descriptor: self.file_descriptor()?,
            bus_number: self.bus_number()?,
            device_number: self.device_number()?,
        })
    }
}

/// USB streaming transport.
///
/// Context, device and handle are released by dropping them; callers drop
/// them in handle, device, context order.
pub trait Transport {
    /// Library context rooted at a USB filesystem.
    type Context;
    /// Reference to a device that has not been opened yet.
    type Device;
    /// An opened device.
    type Handle: DeviceHandle;

    /// Initialise a context.
    fn init(&mut self, usbfs: &str) -> Result<Self::Context>;

    /// Look up a device by its identity.
    fn find_device(&mut self, context: &Self::Context, id: &UsbDeviceId) -> Result<Self::Device>;

    /// Open a device.
    fn open(&mut self, device: &Self::Device) -> Result<Self::Handle>;
}

/// An opened UVC device.
pub trait DeviceHandle {
    /// Negotiated stream parameters.
    type StreamControl;

    /// Format descriptors with their frame descriptors.
    fn format_descriptors(&self) -> Vec<FormatDescriptor>;

    /// `bmControls` of the camera input terminal.
    fn terminal_controls(&self) -> u64;

    /// `bmControls` of the processing unit.
    fn processing_unit_controls(&self) -> u64;

    /// Auto-exposure mode control.
    fn ae_mode(&self, request: ControlRequest) -> Result<u8>;

    /// Set the auto-exposure mode.
    fn set_ae_mode(&mut self, mode: u8) -> Result<()>;

    /// Absolute exposure time in 100 µs units.
    fn exposure_abs(&self, request: ControlRequest) -> Result<u32>;

    /// Set the absolute exposure time in 100 µs units.
    fn set_exposure_abs(&mut self, value: u32) -> Result<()>;

    /// A reader for the current exposure that can run on the delivery thread.
    fn exposure_probe(&self) -> ExposureProbe;

    /// Auto-focus control (0 off, 1 on).
    fn focus_auto(&self, request: ControlRequest) -> Result<u8>;

    /// Set the auto-focus control.
    fn set_focus_auto(&mut self, state: u8) -> Result<()>;

    /// Absolute focus position.
    fn focus_abs(&self, request: ControlRequest) -> Result<i16>;

    /// Set the absolute focus position.
    fn set_focus_abs(&mut self, value: i16) -> Result<()>;

    /// Simple focus range control.
    fn focus_simple_range(&self, _request: ControlRequest) -> Result<u8> {
        Err(DriverError::Unsupported("simple focus range"))
    }

    /// Set the simple focus range control.
    fn set_focus_simple_range(&mut self, _range: u8) -> Result<()> {
        Err(DriverError::Unsupported("simple focus range"))
    }

    /// Negotiate stream parameters for a format, size and rate.
    fn negotiate(
        &mut self,
        format: FrameFormat,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Self::StreamControl>;

    /// Start streaming; `on_frame` runs on the transport's delivery thread.
    fn start_streaming(
        &mut self,
        control: &Self::StreamControl,
        on_frame: FrameCallback,
    ) -> Result<()>;

    /// Stop streaming. A no-op when not streaming.
    fn stop_streaming(&mut self);

    /// Dump transport diagnostics for this device.
    fn log_diagnostics(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsics_from_calibration_order() {
        let values = [
            318.0, 228.0, 678.0, 679.0, 0.1, -1.1, 0.0, 0.0, 2.0, 0.0, 0.0, 0.5,
        ];
        let intrinsics = CameraIntrinsics::from_calibration(&values).expect("12 values");

        assert!((intrinsics.principal_point_x - 318.0).abs() < f32::EPSILON);
        assert!((intrinsics.principal_point_y - 228.0).abs() < f32::EPSILON);
        assert!((intrinsics.focal_length_x - 678.0).abs() < f32::EPSILON);
        assert!((intrinsics.focal_length_y - 679.0).abs() < f32::EPSILON);
        assert!((intrinsics.distortion_coefficients[7] - 0.5).abs() < f32::EPSILON);
        assert!(intrinsics.is_calibrated());
    }

    #[test]
    fn test_intrinsics_wrong_length_is_rejected() {
        assert!(CameraIntrinsics::from_calibration(&[1.0; 11]).is_none());
        assert!(CameraIntrinsics::from_calibration(&[1.0; 13]).is_none());
        assert!(!CameraIntrinsics::default().is_calibrated());
    }

    #[test]
    fn test_host_enum_values() {
        assert_eq!(ExposureMode::from(2), ExposureMode::ContinuousAuto);
        assert_eq!(ExposureMode::from(42), ExposureMode::Unknown);
        assert_eq!(FocusMode::from(5), FocusMode::Fixed);
        assert_eq!(FocusMode::from(-1), FocusMode::Unknown);
        assert_eq!(PixelFormat::from(1), PixelFormat::Yuyv);
        assert_eq!(ExposureMode::ShutterPriority as i32, 4);
        assert_eq!(FocusMode::InfinityFocus as i32, 4);
    }

    #[test]
    fn test_descriptor_subtype_codes() {
        assert_eq!(DescriptorSubtype::from(0x04), DescriptorSubtype::FormatUncompressed);
        assert_eq!(DescriptorSubtype::from(0x05), DescriptorSubtype::FrameUncompressed);
        assert_eq!(DescriptorSubtype::from(0x06), DescriptorSubtype::FormatMjpeg);
        assert_eq!(DescriptorSubtype::from(0x0d), DescriptorSubtype::Other(0x0d));
    }

    #[test]
    fn test_fourcc_display() {
        assert_eq!(FourCC::YUY2.to_string(), "YUY2");
        assert_ne!(FourCC::YUY2, FourCC::YUYV);
    }
}
