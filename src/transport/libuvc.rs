//! Transport over the fd-capable libuvc fork.
//!
//! The fork adds `uvc_init2`, which roots a context at a usbfs path, and
//! `uvc_get_device_with_fd`, which wraps a file descriptor already opened by
//! the platform. Frames arrive on libuvc's own thread.
#![allow(unsafe_code)]

use std::ffi::{c_int, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};

use tracing::{debug, error};

use crate::traits::{
    ControlRequest, DescriptorSubtype, DeviceHandle, DriverError, ExposureProbe,
    FormatDescriptor, FourCC, FrameCallback, FrameDescriptor, FrameFormat, RawFrame, Result,
    Transport, UsbDeviceId,
};

#[allow(non_camel_case_types, non_snake_case, dead_code)]
mod sys {
    use std::ffi::{c_char, c_int, c_void};

    #[repr(C)]
    pub struct uvc_context {
        _private: [u8; 0],
    }

    #[repr(C)]
    pub struct uvc_device {
        _private: [u8; 0],
    }

    #[repr(C)]
    pub struct uvc_device_handle {
        _private: [u8; 0],
    }

    pub type uvc_error_t = c_int;
    pub type uvc_frame_format = c_int;
    pub type uvc_req_code = c_int;

    pub const UVC_SUCCESS: uvc_error_t = 0;
    pub const UVC_FRAME_FORMAT_YUYV: uvc_frame_format = 3;
    pub const UVC_FRAME_FORMAT_MJPEG: uvc_frame_format = 7;

    #[repr(C)]
    pub struct uvc_frame_desc {
        pub parent: *mut uvc_format_desc,
        pub prev: *mut uvc_frame_desc,
        pub next: *mut uvc_frame_desc,
        pub bDescriptorSubtype: c_int,
        pub bFrameIndex: u8,
        pub bmCapabilities: u8,
        pub wWidth: u16,
        pub wHeight: u16,
        pub dwMinBitRate: u32,
        pub dwMaxBitRate: u32,
        pub dwMaxVideoFrameBufferSize: u32,
        pub dwDefaultFrameInterval: u32,
        pub dwMinFrameInterval: u32,
        pub dwMaxFrameInterval: u32,
        pub dwFrameIntervalStep: u32,
        pub bFrameIntervalType: u8,
        pub dwBytesPerLine: u32,
        /// Zero-terminated list of discrete intervals.
        pub intervals: *mut u32,
    }

    #[repr(C)]
    pub struct uvc_format_desc {
        pub parent: *mut c_void,
        pub prev: *mut uvc_format_desc,
        pub next: *mut uvc_format_desc,
        pub bDescriptorSubtype: c_int,
        pub bFormatIndex: u8,
        pub bNumFrameDescriptors: u8,
        /// `guidFormat`; the first four bytes are the fourcc.
        pub guidFormat: [u8; 16],
        pub bBitsPerPixel: u8,
        pub bDefaultFrameIndex: u8,
        pub bAspectRatioX: u8,
        pub bAspectRatioY: u8,
        pub bmInterlaceFlags: u8,
        pub bCopyProtect: u8,
        pub bVariableSize: u8,
        pub frame_descs: *mut uvc_frame_desc,
    }

    #[repr(C)]
    pub struct uvc_input_terminal {
        pub prev: *mut uvc_input_terminal,
        pub next: *mut uvc_input_terminal,
        pub bTerminalID: u8,
        pub wTerminalType: c_int,
        pub wObjectiveFocalLengthMin: u16,
        pub wObjectiveFocalLengthMax: u16,
        pub wOcularFocalLength: u16,
        pub bmControls: u64,
    }

    #[repr(C)]
    pub struct uvc_processing_unit {
        pub prev: *mut uvc_processing_unit,
        pub next: *mut uvc_processing_unit,
        pub bUnitID: u8,
        pub bSourceID: u8,
        pub bmControls: u64,
    }

    #[repr(C)]
    pub struct uvc_frame {
        pub data: *mut c_void,
        pub data_bytes: usize,
        pub actual_bytes: usize,
        pub width: u32,
        pub height: u32,
        pub frame_format: uvc_frame_format,
        pub step: usize,
        pub sequence: u32,
        pub capture_time: libc::timeval,
        pub source: *mut uvc_device_handle,
        pub library_owns_data: u8,
    }

    /// Probe/commit control block, treated as opaque.
    #[repr(C, align(8))]
    #[derive(Clone, Copy)]
    pub struct uvc_stream_ctrl {
        pub bytes: [u8; 64],
    }

    pub type uvc_frame_callback_t = unsafe extern "C" fn(frame: *mut uvc_frame, user_ptr: *mut c_void);

    extern "C" {
        pub fn uvc_init2(ctx: *mut *mut uvc_context, usb_ctx: *mut c_void, usbfs: *const c_char) -> uvc_error_t;
        pub fn uvc_exit(ctx: *mut uvc_context);
        pub fn uvc_get_device_with_fd(
            ctx: *mut uvc_context,
            dev: *mut *mut uvc_device,
            vid: c_int,
            pid: c_int,
            serial: *const c_char,
            fd: c_int,
            busnum: c_int,
            devaddr: c_int,
        ) -> uvc_error_t;
        pub fn uvc_unref_device(dev: *mut uvc_device);
        pub fn uvc_open(dev: *mut uvc_device, devh: *mut *mut uvc_device_handle) -> uvc_error_t;
        pub fn uvc_close(devh: *mut uvc_device_handle);
        pub fn uvc_strerror(err: uvc_error_t) -> *const c_char;
        pub fn uvc_print_diag(devh: *mut uvc_device_handle, stream: *mut c_void);

        pub fn uvc_get_format_descs(devh: *mut uvc_device_handle) -> *const uvc_format_desc;
        pub fn uvc_get_input_terminals(devh: *mut uvc_device_handle) -> *const uvc_input_terminal;
        pub fn uvc_get_processing_units(devh: *mut uvc_device_handle) -> *const uvc_processing_unit;

        pub fn uvc_get_stream_ctrl_format_size(
            devh: *mut uvc_device_handle,
            ctrl: *mut uvc_stream_ctrl,
            format: uvc_frame_format,
            width: c_int,
            height: c_int,
            fps: c_int,
        ) -> uvc_error_t;
        pub fn uvc_start_streaming(
            devh: *mut uvc_device_handle,
            ctrl: *mut uvc_stream_ctrl,
            cb: uvc_frame_callback_t,
            user_ptr: *mut c_void,
            flags: u8,
        ) -> uvc_error_t;
        pub fn uvc_stop_streaming(devh: *mut uvc_device_handle);

        pub fn uvc_get_ae_mode(devh: *mut uvc_device_handle, mode: *mut u8, req: uvc_req_code) -> uvc_error_t;
        pub fn uvc_set_ae_mode(devh: *mut uvc_device_handle, mode: u8) -> uvc_error_t;
        pub fn uvc_get_exposure_abs(devh: *mut uvc_device_handle, time: *mut u32, req: uvc_req_code) -> uvc_error_t;
        pub fn uvc_set_exposure_abs(devh: *mut uvc_device_handle, time: u32) -> uvc_error_t;
        pub fn uvc_get_focus_auto(devh: *mut uvc_device_handle, state: *mut u8, req: uvc_req_code) -> uvc_error_t;
        pub fn uvc_set_focus_auto(devh: *mut uvc_device_handle, state: u8) -> uvc_error_t;
        pub fn uvc_get_focus_abs(devh: *mut uvc_device_handle, focus: *mut i16, req: uvc_req_code) -> uvc_error_t;
        pub fn uvc_set_focus_abs(devh: *mut uvc_device_handle, focus: i16) -> uvc_error_t;
        #[cfg(feature = "simple-focus")]
        pub fn uvc_get_focus_simple_range(devh: *mut uvc_device_handle, focus: *mut u8, req: uvc_req_code) -> uvc_error_t;
        #[cfg(feature = "simple-focus")]
        pub fn uvc_set_focus_simple_range(devh: *mut uvc_device_handle, focus: u8) -> uvc_error_t;
    }
}

/// Message for a libuvc error code.
fn strerror(code: sys::uvc_error_t) -> String {
    // SAFETY: uvc_strerror returns a static string for every code.
    let message = unsafe { sys::uvc_strerror(code) };
    if message.is_null() {
        return format!("libuvc error {code}");
    }
    // SAFETY: non-null, static and NUL-terminated.
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}

fn check(op: &'static str, code: sys::uvc_error_t) -> Result<()> {
    if code == sys::UVC_SUCCESS {
        return Ok(());
    }
    debug!(op, code, message = %strerror(code), "libuvc call failed");
    Err(DriverError::Transport { op, code })
}

fn request_code(request: ControlRequest) -> sys::uvc_req_code {
    sys::uvc_req_code::from(request.code())
}

fn to_c_int(value: u32, what: &str) -> Result<c_int> {
    c_int::try_from(value).map_err(|_| DriverError::InvalidArgument(format!("{what} {value}")))
}

/// Transport over libuvc.
#[derive(Debug, Default)]
pub struct LibuvcTransport;

/// A libuvc context; `uvc_exit` on drop.
pub struct LibuvcContext {
    raw: NonNull<sys::uvc_context>,
}

impl Drop for LibuvcContext {
    fn drop(&mut self) {
        // SAFETY: created by uvc_init2 and released once.
        unsafe { sys::uvc_exit(self.raw.as_ptr()) };
    }
}

/// A referenced libuvc device; unreferenced on drop.
pub struct LibuvcDevice {
    raw: NonNull<sys::uvc_device>,
}

impl Drop for LibuvcDevice {
    fn drop(&mut self) {
        // SAFETY: referenced by uvc_get_device_with_fd and released once.
        unsafe { sys::uvc_unref_device(self.raw.as_ptr()) };
    }
}

impl Transport for LibuvcTransport {
    type Context = LibuvcContext;
    type Device = LibuvcDevice;
    type Handle = LibuvcHandle;

    fn init(&mut self, usbfs: &str) -> Result<LibuvcContext> {
        let usbfs = CString::new(usbfs)
            .map_err(|_| DriverError::InvalidArgument(format!("usbfs path {usbfs:?}")))?;
        let mut raw = ptr::null_mut();
        // SAFETY: out-pointer is valid; usbfs is NUL-terminated and outlives the call.
        check("uvc_init2", unsafe {
            sys::uvc_init2(&mut raw, ptr::null_mut(), usbfs.as_ptr())
        })?;
        NonNull::new(raw)
            .map(|raw| LibuvcContext { raw })
            .ok_or(DriverError::Transport { op: "uvc_init2", code: -1 })
    }

    fn find_device(&mut self, context: &LibuvcContext, id: &UsbDeviceId) -> Result<LibuvcDevice> {
        let mut raw = ptr::null_mut();
        // SAFETY: context is live; out-pointer is valid; no serial filter.
        check("uvc_get_device_with_fd", unsafe {
            sys::uvc_get_device_with_fd(
                context.raw.as_ptr(),
                &mut raw,
                id.vendor_id,
                id.product_id,
                ptr::null(),
                id.file_descriptor,
                id.bus_number,
                id.device_number,
            )
        })?;
        NonNull::new(raw)
            .map(|raw| LibuvcDevice { raw })
            .ok_or(DriverError::Transport { op: "uvc_get_device_with_fd", code: -1 })
    }

    fn open(&mut self, device: &LibuvcDevice) -> Result<LibuvcHandle> {
        let mut raw = ptr::null_mut();
        // SAFETY: device is referenced; out-pointer is valid.
        check("uvc_open", unsafe { sys::uvc_open(device.raw.as_ptr(), &mut raw) })?;
        NonNull::new(raw)
            .map(|raw| LibuvcHandle {
                raw,
                streaming: None,
            })
            .ok_or(DriverError::Transport { op: "uvc_open", code: -1 })
    }
}

/// Device handle pointer that may be used from libuvc's delivery thread.
#[derive(Clone, Copy)]
struct SharedHandle(NonNull<sys::uvc_device_handle>);

// SAFETY: libuvc control requests are synchronous USB control transfers and
// may be issued from any thread; the pointer is only used while streaming,
// which ends before the handle is closed.
unsafe impl Send for SharedHandle {}

impl SharedHandle {
    fn exposure(self) -> Result<u32> {
        let mut value = 0;
        // SAFETY: handle is open; out-pointer is valid.
        check("uvc_get_exposure_abs", unsafe {
            sys::uvc_get_exposure_abs(self.0.as_ptr(), &mut value, request_code(ControlRequest::Cur))
        })?;
        Ok(value)
    }
}

/// Negotiated libuvc stream control.
pub struct LibuvcStreamControl {
    raw: sys::uvc_stream_ctrl,
}

/// An opened libuvc device; `uvc_close` on drop.
pub struct LibuvcHandle {
    raw: NonNull<sys::uvc_device_handle>,
    // Boxed so the address handed to libuvc as user pointer stays put.
    streaming: Option<Box<FrameCallback>>,
}

unsafe extern "C" fn deliver_frame(frame: *mut sys::uvc_frame, user_ptr: *mut c_void) {
    if frame.is_null() || user_ptr.is_null() {
        return;
    }
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: user_ptr is the boxed callback registered in
        // start_streaming; it outlives the stream.
        let on_frame = unsafe { &mut *user_ptr.cast::<FrameCallback>() };
        // SAFETY: libuvc passes a valid frame for the duration of the call.
        let frame = unsafe { &*frame };
        let data = if frame.data.is_null() {
            &[][..]
        } else {
            // SAFETY: data holds data_bytes bytes for the duration of the call.
            unsafe { std::slice::from_raw_parts(frame.data.cast::<u8>(), frame.data_bytes) }
        };
        let format = match frame.frame_format {
            sys::UVC_FRAME_FORMAT_YUYV => FrameFormat::Yuyv,
            sys::UVC_FRAME_FORMAT_MJPEG => FrameFormat::Mjpeg,
            _ => FrameFormat::Unknown,
        };
        on_frame(&RawFrame {
            data,
            width: frame.width,
            height: frame.height,
            format,
            step: u32::try_from(frame.step).unwrap_or(u32::MAX),
            sequence: frame.sequence,
        });
    }));
    if result.is_err() {
        error!("frame callback panicked");
    }
}

impl LibuvcHandle {
    fn frame_descriptors(format: &sys::uvc_format_desc) -> Vec<FrameDescriptor> {
        let mut frames = Vec::new();
        let mut cursor = format.frame_descs.cast_const();
        // SAFETY: libuvc keeps the descriptor lists alive while the handle is open.
        while let Some(frame) = unsafe { cursor.as_ref() } {
            frames.push(FrameDescriptor {
                subtype: DescriptorSubtype::from(u8::try_from(frame.bDescriptorSubtype).unwrap_or(0)),
                width: frame.wWidth,
                height: frame.wHeight,
                intervals: Self::intervals(frame.intervals),
            });
            cursor = frame.next;
        }
        frames
    }

    fn intervals(mut cursor: *const u32) -> Vec<u32> {
        let mut intervals = Vec::new();
        if cursor.is_null() {
            return intervals;
        }
        // SAFETY: the list is zero-terminated.
        unsafe {
            while *cursor != 0 {
                intervals.push(*cursor);
                cursor = cursor.add(1);
            }
        }
        intervals
    }

    fn get_u8(&self, op: &'static str, request: ControlRequest, f: GetU8) -> Result<u8> {
        let mut value = 0;
        // SAFETY: handle is open; out-pointer is valid.
        check(op, unsafe { f(self.raw.as_ptr(), &mut value, request_code(request)) })?;
        Ok(value)
    }
}

type GetU8 = unsafe extern "C" fn(*mut sys::uvc_device_handle, *mut u8, sys::uvc_req_code) -> sys::uvc_error_t;

impl DeviceHandle for LibuvcHandle {
    type StreamControl = LibuvcStreamControl;

    fn format_descriptors(&self) -> Vec<FormatDescriptor> {
        let mut formats = Vec::new();
        // SAFETY: handle is open.
        let mut cursor = unsafe { sys::uvc_get_format_descs(self.raw.as_ptr()) };
        // SAFETY: libuvc keeps the descriptor lists alive while the handle is open.
        while let Some(format) = unsafe { cursor.as_ref() } {
            let [a, b, c, d, ..] = format.guidFormat;
            formats.push(FormatDescriptor {
                subtype: DescriptorSubtype::from(u8::try_from(format.bDescriptorSubtype).unwrap_or(0)),
                fourcc: FourCC([a, b, c, d]),
                frames: Self::frame_descriptors(format),
            });
            cursor = format.next;
        }
        formats
    }

    fn terminal_controls(&self) -> u64 {
        // SAFETY: handle is open; the first terminal is the camera terminal.
        unsafe { sys::uvc_get_input_terminals(self.raw.as_ptr()).as_ref() }
            .map_or(0, |terminal| terminal.bmControls)
    }

    fn processing_unit_controls(&self) -> u64 {
        // SAFETY: handle is open.
        unsafe { sys::uvc_get_processing_units(self.raw.as_ptr()).as_ref() }
            .map_or(0, |unit| unit.bmControls)
    }

    fn ae_mode(&self, request: ControlRequest) -> Result<u8> {
        self.get_u8("uvc_get_ae_mode", request, sys::uvc_get_ae_mode)
    }

    fn set_ae_mode(&mut self, mode: u8) -> Result<()> {
        // SAFETY: handle is open.
        check("uvc_set_ae_mode", unsafe { sys::uvc_set_ae_mode(self.raw.as_ptr(), mode) })
    }

    fn exposure_abs(&self, request: ControlRequest) -> Result<u32> {
        let mut value = 0;
        // SAFETY: handle is open; out-pointer is valid.
        check("uvc_get_exposure_abs", unsafe {
            sys::uvc_get_exposure_abs(self.raw.as_ptr(), &mut value, request_code(request))
        })?;
        Ok(value)
    }

    fn set_exposure_abs(&mut self, value: u32) -> Result<()> {
        // SAFETY: handle is open.
        check("uvc_set_exposure_abs", unsafe {
            sys::uvc_set_exposure_abs(self.raw.as_ptr(), value)
        })
    }

    fn exposure_probe(&self) -> ExposureProbe {
        let handle = SharedHandle(self.raw);
        Box::new(move || handle.exposure())
    }

    fn focus_auto(&self, request: ControlRequest) -> Result<u8> {
        self.get_u8("uvc_get_focus_auto", request, sys::uvc_get_focus_auto)
    }

    fn set_focus_auto(&mut self, state: u8) -> Result<()> {
        // SAFETY: handle is open.
        check("uvc_set_focus_auto", unsafe {
            sys::uvc_set_focus_auto(self.raw.as_ptr(), state)
        })
    }

    fn focus_abs(&self, request: ControlRequest) -> Result<i16> {
        let mut value = 0;
        // SAFETY: handle is open; out-pointer is valid.
        check("uvc_get_focus_abs", unsafe {
            sys::uvc_get_focus_abs(self.raw.as_ptr(), &mut value, request_code(request))
        })?;
        Ok(value)
    }

    fn set_focus_abs(&mut self, value: i16) -> Result<()> {
        // SAFETY: handle is open.
        check("uvc_set_focus_abs", unsafe {
            sys::uvc_set_focus_abs(self.raw.as_ptr(), value)
        })
    }

    #[cfg(feature = "simple-focus")]
    fn focus_simple_range(&self, request: ControlRequest) -> Result<u8> {
        self.get_u8("uvc_get_focus_simple_range", request, sys::uvc_get_focus_simple_range)
    }

    #[cfg(feature = "simple-focus")]
    fn set_focus_simple_range(&mut self, range: u8) -> Result<()> {
        // SAFETY: handle is open.
        check("uvc_set_focus_simple_range", unsafe {
            sys::uvc_set_focus_simple_range(self.raw.as_ptr(), range)
        })
    }

    fn negotiate(
        &mut self,
        format: FrameFormat,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<LibuvcStreamControl> {
        let format = match format {
            FrameFormat::Yuyv => sys::UVC_FRAME_FORMAT_YUYV,
            FrameFormat::Mjpeg => sys::UVC_FRAME_FORMAT_MJPEG,
            FrameFormat::Unknown => return Err(DriverError::Unsupported("frame format")),
        };
        let mut raw = sys::uvc_stream_ctrl { bytes: [0; 64] };
        // SAFETY: handle is open; ctrl is a valid, writable control block.
        let code = unsafe {
            sys::uvc_get_stream_ctrl_format_size(
                self.raw.as_ptr(),
                &mut raw,
                format,
                to_c_int(width, "width")?,
                to_c_int(height, "height")?,
                to_c_int(fps, "fps")?,
            )
        };
        if code != sys::UVC_SUCCESS {
            return Err(DriverError::Negotiation(strerror(code)));
        }
        Ok(LibuvcStreamControl { raw })
    }

    fn start_streaming(
        &mut self,
        control: &LibuvcStreamControl,
        on_frame: FrameCallback,
    ) -> Result<()> {
        if self.streaming.is_some() {
            return Err(DriverError::Transport { op: "uvc_start_streaming", code: -1 });
        }

        let mut callback = Box::new(on_frame);
        let user_ptr: *mut FrameCallback = &mut *callback;
        let mut ctrl = control.raw;
        // SAFETY: handle is open; the callback box is kept in `self.streaming`
        // until uvc_stop_streaming has returned.
        check("uvc_start_streaming", unsafe {
            sys::uvc_start_streaming(self.raw.as_ptr(), &mut ctrl, deliver_frame, user_ptr.cast(), 0)
        })?;
        self.streaming = Some(callback);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if self.streaming.is_none() {
            return;
        }
        // SAFETY: handle is open; joins libuvc's delivery thread.
        unsafe { sys::uvc_stop_streaming(self.raw.as_ptr()) };
        self.streaming = None;
    }

    fn log_diagnostics(&self) {
        // SAFETY: handle is open; a null stream selects stderr.
        unsafe { sys::uvc_print_diag(self.raw.as_ptr(), ptr::null_mut()) };
    }
}

impl Drop for LibuvcHandle {
    fn drop(&mut self) {
        self.stop_streaming();
        // SAFETY: opened by uvc_open and closed once.
        unsafe { sys::uvc_close(self.raw.as_ptr()) };
    }
}

