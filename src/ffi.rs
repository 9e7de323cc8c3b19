//! The host plugin ABI.
//!
//! The host loads the library, calls `vuforiaDriver_init` and talks to the
//! returned driver and cameras through C++ interfaces. Those interfaces have
//! only pure virtual methods and no virtual destructor, so under the Itanium
//! ABI an object is a pointer to a table of function pointers, each taking
//! `this` first. [`HostDriver`] and [`HostCamera`] mirror that layout with a
//! vtable reference as their first field.
//!
//! Every entry point catches panics and turns errors into the sentinel the
//! host expects.
#![allow(unsafe_code)]

use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::camera::ExternalCamera;
use crate::config::DriverConfig;
use crate::driver::Driver;
use crate::logging;
use crate::traits::{
    CameraFrame, CameraIntrinsics, CameraMode, ExposureMode, FocusMode, FrameSink, PixelFormat,
    Result, SharedSink,
};

#[cfg(target_os = "android")]
type HostBridge = crate::bridge::JniBridge;
#[cfg(not(target_os = "android"))]
type HostBridge = crate::bridge::SysfsBridge;

#[cfg(feature = "libuvc")]
type HostTransport = crate::transport::LibuvcTransport;
#[cfg(not(feature = "libuvc"))]
type HostTransport = crate::transport::V4l2Transport;

type Session = ExternalCamera<HostBridge, HostTransport>;

/// API version of the host interfaces implemented here.
pub const API_VERSION: u32 = 2;

/// Version string reported to the host.
pub const LIBRARY_VERSION: &str = concat!("uvc-driver-", env!("CARGO_PKG_VERSION"));

/// Focus value reported when the device cannot be queried.
const FOCUS_SENTINEL: f32 = -1.0;

/// Platform data passed to `vuforiaDriver_init`.
#[cfg(target_os = "android")]
#[repr(C, packed)]
pub struct PlatformData {
    /// The process's Java VM.
    pub java_vm: *mut jni::sys::JavaVM,
    /// The hosting activity.
    pub activity: jni::sys::jobject,
    /// JNI version in use.
    pub jni_version: jni::sys::jint,
}

/// Platform data passed to `vuforiaDriver_init`; empty off Android.
#[cfg(not(target_os = "android"))]
#[repr(C, packed)]
pub struct PlatformData {
    _private: [u8; 0],
}

/// Size, rate and format as the host lays it out.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct HostCameraMode {
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Frames per second.
    pub fps: u32,
    /// `PixelFormat` discriminant.
    pub format: i32,
}

impl From<HostCameraMode> for CameraMode {
    fn from(mode: HostCameraMode) -> Self {
        let (width, height, fps, format) = (mode.width, mode.height, mode.fps, mode.format);
        Self::new(width, height, fps, PixelFormat::from(format))
    }
}

impl From<CameraMode> for HostCameraMode {
    fn from(mode: CameraMode) -> Self {
        Self {
            width: mode.width,
            height: mode.height,
            fps: mode.fps,
            format: mode.format as i32,
        }
    }
}

/// Intrinsics as the host lays them out.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct HostIntrinsics {
    focal_length_x: f32,
    focal_length_y: f32,
    principal_point_x: f32,
    principal_point_y: f32,
    distortion_coefficients: [f32; 8],
}

impl From<CameraIntrinsics> for HostIntrinsics {
    fn from(intrinsics: CameraIntrinsics) -> Self {
        Self {
            focal_length_x: intrinsics.focal_length_x,
            focal_length_y: intrinsics.focal_length_y,
            principal_point_x: intrinsics.principal_point_x,
            principal_point_y: intrinsics.principal_point_y,
            distortion_coefficients: intrinsics.distortion_coefficients,
        }
    }
}

/// A frame as the host lays it out.
#[repr(C, packed)]
pub struct HostFrame {
    timestamp: u64,
    exposure_time: u64,
    buffer: *mut u8,
    buffer_size: u32,
    index: u32,
    width: u32,
    height: u32,
    stride: u32,
    format: i32,
    intrinsics: HostIntrinsics,
}

impl HostFrame {
    fn new(frame: &CameraFrame<'_>) -> Self {
        Self {
            timestamp: frame.timestamp,
            exposure_time: frame.exposure_time,
            // The host treats the buffer as read-only.
            buffer: frame.buffer.as_ptr().cast_mut(),
            buffer_size: u32::try_from(frame.buffer.len()).unwrap_or(u32::MAX),
            index: frame.index,
            width: frame.width,
            height: frame.height,
            stride: frame.stride,
            format: frame.format as i32,
            intrinsics: frame.intrinsics.into(),
        }
    }
}

/// Vtable of the host's `CameraCallback`.
#[repr(C)]
pub struct CallbackVtable {
    /// `onNewCameraFrame(CameraFrame*)`
    pub on_new_camera_frame: unsafe extern "C" fn(this: *mut HostCallback, frame: *mut HostFrame),
}

/// The host's `CameraCallback` object.
#[repr(C)]
pub struct HostCallback {
    /// Vtable pointer.
    pub vtable: *const CallbackVtable,
}

/// Forwards frames to the host callback.
struct HostFrameSink {
    callback: NonNull<HostCallback>,
}

// SAFETY: the host keeps the callback alive until `stop` returns and accepts
// calls from the delivery thread.
unsafe impl Send for HostFrameSink {}
// SAFETY: as above; frames are delivered from one thread at a time.
unsafe impl Sync for HostFrameSink {}

impl FrameSink for HostFrameSink {
    fn on_new_camera_frame(&self, frame: &CameraFrame<'_>) {
        let mut host_frame = HostFrame::new(frame);
        let this = self.callback.as_ptr();
        // SAFETY: the callback and its vtable are live per the Send contract.
        unsafe {
            let vtable = &*(*this).vtable;
            (vtable.on_new_camera_frame)(this, &mut host_frame);
        }
    }
}

/// Vtable of the host's `ExternalCamera` interface, in declaration order.
#[repr(C)]
pub struct CameraVtable {
    open: unsafe extern "C" fn(*mut HostCamera) -> bool,
    close: unsafe extern "C" fn(*mut HostCamera) -> bool,
    start: unsafe extern "C" fn(*mut HostCamera, HostCameraMode, *mut HostCallback) -> bool,
    stop: unsafe extern "C" fn(*mut HostCamera) -> bool,
    get_num_supported_camera_modes: unsafe extern "C" fn(*mut HostCamera) -> u32,
    get_supported_camera_mode: unsafe extern "C" fn(*mut HostCamera, u32, *mut HostCameraMode) -> bool,
    supports_exposure_mode: unsafe extern "C" fn(*mut HostCamera, i32) -> bool,
    get_exposure_mode: unsafe extern "C" fn(*mut HostCamera) -> i32,
    set_exposure_mode: unsafe extern "C" fn(*mut HostCamera, i32) -> bool,
    supports_exposure_value: unsafe extern "C" fn(*mut HostCamera) -> bool,
    get_exposure_value_min: unsafe extern "C" fn(*mut HostCamera) -> u64,
    get_exposure_value_max: unsafe extern "C" fn(*mut HostCamera) -> u64,
    get_exposure_value: unsafe extern "C" fn(*mut HostCamera) -> u64,
    set_exposure_value: unsafe extern "C" fn(*mut HostCamera, u64) -> bool,
    supports_focus_mode: unsafe extern "C" fn(*mut HostCamera, i32) -> bool,
    get_focus_mode: unsafe extern "C" fn(*mut HostCamera) -> i32,
    set_focus_mode: unsafe extern "C" fn(*mut HostCamera, i32) -> bool,
    supports_focus_value: unsafe extern "C" fn(*mut HostCamera) -> bool,
    get_focus_value_min: unsafe extern "C" fn(*mut HostCamera) -> f32,
    get_focus_value_max: unsafe extern "C" fn(*mut HostCamera) -> f32,
    get_focus_value: unsafe extern "C" fn(*mut HostCamera) -> f32,
    set_focus_value: unsafe extern "C" fn(*mut HostCamera, f32) -> bool,
}

/// Vtable of the host's `VuforiaDriver` interface.
#[repr(C)]
pub struct DriverVtable {
    create_external_camera: unsafe extern "C" fn(*mut HostDriver) -> *mut HostCamera,
    destroy_external_camera: unsafe extern "C" fn(*mut HostDriver, *mut HostCamera),
}

/// A camera session as seen by the host.
#[repr(C)]
pub struct HostCamera {
    vtable: &'static CameraVtable,
    session: Session,
}

/// Platform state captured at init.
pub struct HostPlatform {
    config: DriverConfig,
    #[cfg(target_os = "android")]
    java: crate::bridge::JavaPlatform,
}

impl HostPlatform {
    #[cfg(target_os = "android")]
    fn bridge(&self) -> Result<HostBridge> {
        self.java.bridge(&self.config)
    }

    #[cfg(not(target_os = "android"))]
    fn bridge(&self) -> Result<HostBridge> {
        Ok(HostBridge::new(&self.config))
    }

    fn camera(&self) -> Result<HostCamera> {
        Ok(HostCamera {
            vtable: &CAMERA_VTABLE,
            session: ExternalCamera::new(self.bridge()?, HostTransport::default()),
        })
    }
}

/// The driver object handed to the host.
#[repr(C)]
pub struct HostDriver {
    vtable: &'static DriverVtable,
    driver: Driver<HostPlatform, HostCamera>,
}

static DRIVER_VTABLE: DriverVtable = DriverVtable {
    create_external_camera,
    destroy_external_camera,
};

static CAMERA_VTABLE: CameraVtable = CameraVtable {
    open,
    close,
    start,
    stop,
    get_num_supported_camera_modes,
    get_supported_camera_mode,
    supports_exposure_mode,
    get_exposure_mode,
    set_exposure_mode,
    supports_exposure_value,
    get_exposure_value_min,
    get_exposure_value_max,
    get_exposure_value,
    set_exposure_value,
    supports_focus_mode,
    get_focus_mode,
    set_focus_mode,
    supports_focus_value,
    get_focus_value_min,
    get_focus_value_max,
    get_focus_value,
    set_focus_value,
};

/// The one live driver, null when none.
static DRIVER: AtomicPtr<HostDriver> = AtomicPtr::new(ptr::null_mut());

/// Run `f`, returning `fallback` if it panics.
fn guard<T, F>(entry: &'static str, fallback: T, f: F) -> T
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!(entry, "panic caught at plugin boundary");
        fallback
    })
}

/// Run `f` on the session behind `this`.
///
/// # Safety
///
/// `this` must be null or a camera returned by `createExternalCamera` that
/// has not been destroyed.
unsafe fn with_camera<T, F>(this: *mut HostCamera, entry: &'static str, fallback: T, f: F) -> T
where
    F: FnOnce(&mut Session) -> T,
{
    // SAFETY: per the caller's contract.
    let Some(camera) = (unsafe { this.as_mut() }) else {
        error!(entry, "null camera instance");
        return fallback;
    };
    guard(entry, fallback, || f(&mut camera.session))
}

fn report(entry: &'static str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            error!(entry, %err, "camera call failed");
            false
        }
    }
}

fn value_or<T>(entry: &'static str, result: Result<T>, sentinel: T) -> T {
    result.unwrap_or_else(|err| {
        error!(entry, %err, "camera query failed");
        sentinel
    })
}

unsafe extern "C" fn open(this: *mut HostCamera) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe { with_camera(this, "open", false, |camera| report("open", camera.open())) }
}

unsafe extern "C" fn close(this: *mut HostCamera) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "close", false, |camera| {
            camera.close();
            true
        })
    }
}

unsafe extern "C" fn start(
    this: *mut HostCamera,
    mode: HostCameraMode,
    callback: *mut HostCallback,
) -> bool {
    let sink = NonNull::new(callback)
        .map(|callback| Arc::new(HostFrameSink { callback }) as SharedSink);
    if sink.is_none() {
        warn!("start without a frame callback");
    }
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "start", false, |camera| {
            report("start", camera.start(mode.into(), sink))
        })
    }
}

unsafe extern "C" fn stop(this: *mut HostCamera) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe { with_camera(this, "stop", false, |camera| report("stop", camera.stop())) }
}

unsafe extern "C" fn get_num_supported_camera_modes(this: *mut HostCamera) -> u32 {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "getNumSupportedCameraModes", 0, |camera| {
            u32::try_from(camera.num_supported_camera_modes()).unwrap_or(u32::MAX)
        })
    }
}

unsafe extern "C" fn get_supported_camera_mode(
    this: *mut HostCamera,
    index: u32,
    out: *mut HostCameraMode,
) -> bool {
    if out.is_null() {
        error!("null camera mode out-parameter");
        return false;
    }
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "getSupportedCameraMode", false, |camera| {
            let index = usize::try_from(index).unwrap_or(usize::MAX);
            match camera.supported_camera_mode(index) {
                Ok(mode) => {
                    // SAFETY: non-null; HostCameraMode has alignment 1.
                    unsafe { out.write(mode.into()) };
                    true
                }
                Err(err) => {
                    error!(%err, "getSupportedCameraMode failed");
                    false
                }
            }
        })
    }
}

unsafe extern "C" fn supports_exposure_mode(this: *mut HostCamera, mode: i32) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "supportsExposureMode", false, |camera| {
            camera.supports_exposure_mode(ExposureMode::from(mode))
        })
    }
}

unsafe extern "C" fn get_exposure_mode(this: *mut HostCamera) -> i32 {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "getExposureMode", ExposureMode::Unknown as i32, |camera| {
            camera.exposure_mode() as i32
        })
    }
}

unsafe extern "C" fn set_exposure_mode(this: *mut HostCamera, mode: i32) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "setExposureMode", false, |camera| {
            report("setExposureMode", camera.set_exposure_mode(ExposureMode::from(mode)))
        })
    }
}

unsafe extern "C" fn supports_exposure_value(this: *mut HostCamera) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "supportsExposureValue", false, |camera| {
            camera.supports_exposure_value()
        })
    }
}

unsafe extern "C" fn get_exposure_value_min(this: *mut HostCamera) -> u64 {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "getExposureValueMin", 0, |camera| {
            value_or("getExposureValueMin", camera.exposure_value_min(), 0)
        })
    }
}

unsafe extern "C" fn get_exposure_value_max(this: *mut HostCamera) -> u64 {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "getExposureValueMax", 0, |camera| {
            value_or("getExposureValueMax", camera.exposure_value_max(), 0)
        })
    }
}

unsafe extern "C" fn get_exposure_value(this: *mut HostCamera) -> u64 {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "getExposureValue", 0, |camera| {
            value_or("getExposureValue", camera.exposure_value(), 0)
        })
    }
}

unsafe extern "C" fn set_exposure_value(this: *mut HostCamera, ns: u64) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "setExposureValue", false, |camera| {
            report("setExposureValue", camera.set_exposure_value(ns))
        })
    }
}

unsafe extern "C" fn supports_focus_mode(this: *mut HostCamera, mode: i32) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "supportsFocusMode", false, |camera| {
            camera.supports_focus_mode(FocusMode::from(mode))
        })
    }
}

unsafe extern "C" fn get_focus_mode(this: *mut HostCamera) -> i32 {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "getFocusMode", FocusMode::Unknown as i32, |camera| {
            camera.focus_mode() as i32
        })
    }
}

unsafe extern "C" fn set_focus_mode(this: *mut HostCamera, mode: i32) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "setFocusMode", false, |camera| {
            report("setFocusMode", camera.set_focus_mode(FocusMode::from(mode)))
        })
    }
}

unsafe extern "C" fn supports_focus_value(this: *mut HostCamera) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "supportsFocusValue", false, |camera| {
            camera.supports_focus_value()
        })
    }
}

unsafe extern "C" fn get_focus_value_min(this: *mut HostCamera) -> f32 {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "getFocusValueMin", FOCUS_SENTINEL, |camera| {
            value_or("getFocusValueMin", camera.focus_value_min(), FOCUS_SENTINEL)
        })
    }
}

unsafe extern "C" fn get_focus_value_max(this: *mut HostCamera) -> f32 {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "getFocusValueMax", FOCUS_SENTINEL, |camera| {
            value_or("getFocusValueMax", camera.focus_value_max(), FOCUS_SENTINEL)
        })
    }
}

unsafe extern "C" fn get_focus_value(this: *mut HostCamera) -> f32 {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "getFocusValue", FOCUS_SENTINEL, |camera| {
            value_or("getFocusValue", camera.focus_value(), FOCUS_SENTINEL)
        })
    }
}

unsafe extern "C" fn set_focus_value(this: *mut HostCamera, value: f32) -> bool {
    // SAFETY: `this` comes from the host.
    unsafe {
        with_camera(this, "setFocusValue", false, |camera| {
            report("setFocusValue", camera.set_focus_value(value))
        })
    }
}

unsafe extern "C" fn create_external_camera(this: *mut HostDriver) -> *mut HostCamera {
    // SAFETY: `this` is the driver returned by init.
    let Some(host) = (unsafe { this.as_mut() }) else {
        error!("null driver instance");
        return ptr::null_mut();
    };
    guard("createExternalCamera", ptr::null_mut(), || {
        host.driver
            .create_external_camera(HostPlatform::camera)
            .map_or(ptr::null_mut(), ptr::from_mut)
    })
}

unsafe extern "C" fn destroy_external_camera(this: *mut HostDriver, instance: *mut HostCamera) {
    // SAFETY: `this` is the driver returned by init.
    let Some(host) = (unsafe { this.as_mut() }) else {
        error!("null driver instance");
        return;
    };
    guard("destroyExternalCamera", (), || {
        host.driver.destroy_external_camera(instance);
    });
}

#[cfg(target_os = "android")]
fn platform(data: *mut PlatformData, config: DriverConfig) -> Result<HostPlatform> {
    use crate::traits::DriverError;

    // SAFETY: the host passes valid platform data or null.
    let Some(data) = (unsafe { data.as_ref() }) else {
        return Err(DriverError::InvalidArgument("null platform data".to_owned()));
    };
    let (vm, activity) = (data.java_vm, data.activity);
    // SAFETY: the host guarantees a live VM and activity during init.
    let java = unsafe { crate::bridge::JavaPlatform::from_raw(vm, activity) }?;
    Ok(HostPlatform { config, java })
}

#[cfg(not(target_os = "android"))]
fn platform(_data: *mut PlatformData, config: DriverConfig) -> Result<HostPlatform> {
    Ok(HostPlatform { config })
}

/// Returns the host interface version this library implements.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn vuforiaDriver_getAPIVersion() -> u32 {
    API_VERSION
}

/// Copies the library version into `out` without a terminator, truncated
/// to `max_len` bytes. Returns the number of bytes written.
///
/// # Safety
///
/// `out` must be null or valid for `max_len` bytes of writes.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn vuforiaDriver_getLibraryVersion(out: *mut u8, max_len: u32) -> u32 {
    if out.is_null() {
        return 0;
    }
    let len = LIBRARY_VERSION
        .len()
        .min(usize::try_from(max_len).unwrap_or(usize::MAX));
    // SAFETY: `out` holds at least `max_len >= len` bytes per the caller's contract.
    unsafe { ptr::copy_nonoverlapping(LIBRARY_VERSION.as_ptr(), out, len) };
    u32::try_from(len).unwrap_or(0)
}

/// Creates the driver. Returns null if one already exists or setup fails.
///
/// # Safety
///
/// `platform_data` must be null or point to valid platform data.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn vuforiaDriver_init(
    platform_data: *mut PlatformData,
    _user_data: *mut std::ffi::c_void,
) -> *mut HostDriver {
    guard("init", ptr::null_mut(), || {
        let config = DriverConfig::from_env();
        logging::init(&config.log_filter);

        if !DRIVER.load(Ordering::Acquire).is_null() {
            error!("driver already initialized, only one instance is supported");
            return ptr::null_mut();
        }

        let platform = match platform(platform_data, config) {
            Ok(platform) => platform,
            Err(err) => {
                error!(%err, "failed to capture platform data");
                return ptr::null_mut();
            }
        };

        let instance = Box::into_raw(Box::new(HostDriver {
            vtable: &DRIVER_VTABLE,
            driver: Driver::new(platform),
        }));
        match DRIVER.compare_exchange(ptr::null_mut(), instance, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                info!(version = LIBRARY_VERSION, "driver initialized");
                instance
            }
            Err(_) => {
                // SAFETY: created above and never published.
                drop(unsafe { Box::from_raw(instance) });
                error!("driver already initialized, only one instance is supported");
                ptr::null_mut()
            }
        }
    })
}

/// Destroys the driver if `instance` is the one created by init.
///
/// # Safety
///
/// `instance` must not be used after this call if it is the live driver.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn vuforiaDriver_deinit(instance: *mut HostDriver) {
    guard("deinit", (), || {
        if instance.is_null()
            || DRIVER
                .compare_exchange(instance, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            warn!("deinit requested for an unknown driver instance");
            return;
        }
        // SAFETY: `instance` was created by init and just unpublished.
        drop(unsafe { Box::from_raw(instance) });
        debug!("driver deinitialized");
    });
}

#[cfg(all(test, not(target_os = "android")))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicU32;

    fn init() -> *mut HostDriver {
        // SAFETY: off Android platform data is unused.
        unsafe { vuforiaDriver_init(ptr::null_mut(), ptr::null_mut()) }
    }

    fn deinit(instance: *mut HostDriver) {
        // SAFETY: instance comes from init or is foreign on purpose.
        unsafe { vuforiaDriver_deinit(instance) };
    }

    #[test]
    fn test_api_version() {
        assert_eq!(vuforiaDriver_getAPIVersion(), 2);
    }

    #[test]
    fn test_library_version_truncates_without_terminator() {
        let mut buffer = [0xffu8; 64];
        // SAFETY: buffer holds 64 bytes.
        let written = unsafe { vuforiaDriver_getLibraryVersion(buffer.as_mut_ptr(), 5) };
        assert_eq!(written, 5);
        assert_eq!(&buffer[..5], &LIBRARY_VERSION.as_bytes()[..5]);
        assert_eq!(buffer[5], 0xff);

        // SAFETY: buffer holds 64 bytes.
        let written = unsafe { vuforiaDriver_getLibraryVersion(buffer.as_mut_ptr(), 64) };
        assert_eq!(written as usize, LIBRARY_VERSION.len());
        assert!(written > 0);
    }

    #[test]
    #[serial]
    fn test_second_init_fails_until_deinit() {
        let first = init();
        assert!(!first.is_null());
        assert!(init().is_null());

        deinit(first);
        let again = init();
        assert!(!again.is_null());
        deinit(again);
    }

    #[test]
    #[serial]
    fn test_deinit_ignores_foreign_instance() {
        let driver = init();
        let mut foreign = 0u64;
        deinit(ptr::from_mut(&mut foreign).cast());
        deinit(ptr::null_mut());

        assert_eq!(DRIVER.load(Ordering::Acquire), driver);
        deinit(driver);
        assert!(DRIVER.load(Ordering::Acquire).is_null());
    }

    #[test]
    #[serial]
    fn test_camera_through_vtables() {
        let driver = init();
        // SAFETY: driver is live; vtable calls follow the host's protocol.
        unsafe {
            let create = (*driver).vtable.create_external_camera;
            let destroy = (*driver).vtable.destroy_external_camera;

            let camera = create(driver);
            assert!(!camera.is_null());
            assert!(create(driver).is_null());

            let vtable = (*camera).vtable;
            assert_eq!((vtable.get_num_supported_camera_modes)(camera), 0);
            let mut mode = HostCameraMode::from(CameraMode::default());
            assert!(!(vtable.get_supported_camera_mode)(camera, 0, &mut mode));
            assert!((vtable.supports_focus_mode)(camera, FocusMode::Fixed as i32));
            assert!(!(vtable.supports_focus_mode)(camera, FocusMode::Auto as i32));
            assert_eq!((vtable.get_exposure_mode)(camera), ExposureMode::Unknown as i32);
            assert_eq!((vtable.get_exposure_value)(camera), 0);
            assert!(((vtable.get_focus_value)(camera) - FOCUS_SENTINEL).abs() < f32::EPSILON);
            assert!(!(vtable.stop)(camera));
            assert!((vtable.close)(camera));

            destroy(driver, camera);
            let camera = create(driver);
            assert!(!camera.is_null());
            destroy(driver, camera);
        }
        deinit(driver);
    }

    #[test]
    fn test_null_camera_returns_sentinels() {
        // SAFETY: null is handled by every entry point.
        unsafe {
            assert!(!open(ptr::null_mut()));
            assert_eq!(get_num_supported_camera_modes(ptr::null_mut()), 0);
            assert_eq!(get_focus_mode(ptr::null_mut()), FocusMode::Unknown as i32);
            assert!((get_focus_value_max(ptr::null_mut()) - FOCUS_SENTINEL).abs() < f32::EPSILON);
        }
    }

    #[repr(C)]
    struct CountingCallback {
        base: HostCallback,
        frames: AtomicU32,
        last_index: AtomicU32,
        last_size: AtomicU32,
    }

    unsafe extern "C" fn count_frame(this: *mut HostCallback, frame: *mut HostFrame) {
        // SAFETY: `this` is the first field of a CountingCallback.
        let callback = unsafe { &*this.cast::<CountingCallback>() };
        // SAFETY: frame is valid for the call.
        let frame = unsafe { &*frame };
        let (index, size) = (frame.index, frame.buffer_size);
        callback.frames.fetch_add(1, Ordering::SeqCst);
        callback.last_index.store(index, Ordering::SeqCst);
        callback.last_size.store(size, Ordering::SeqCst);
    }

    static COUNTING_VTABLE: CallbackVtable = CallbackVtable {
        on_new_camera_frame: count_frame,
    };

    #[test]
    fn test_host_sink_calls_through_vtable() {
        let mut callback = CountingCallback {
            base: HostCallback {
                vtable: &COUNTING_VTABLE,
            },
            frames: AtomicU32::new(0),
            last_index: AtomicU32::new(0),
            last_size: AtomicU32::new(0),
        };
        let sink = HostFrameSink {
            callback: NonNull::from(&mut callback).cast(),
        };

        let pixels = [0u8; 32];
        let frame = CameraFrame {
            timestamp: 10,
            exposure_time: 20,
            buffer: &pixels,
            index: 7,
            width: 4,
            height: 4,
            stride: 8,
            format: PixelFormat::Yuyv,
            intrinsics: CameraIntrinsics::default(),
        };
        sink.on_new_camera_frame(&frame);

        assert_eq!(callback.frames.load(Ordering::SeqCst), 1);
        assert_eq!(callback.last_index.load(Ordering::SeqCst), 7);
        assert_eq!(callback.last_size.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_host_layouts_are_packed() {
        assert_eq!(std::mem::size_of::<HostCameraMode>(), 16);
        assert_eq!(std::mem::size_of::<HostIntrinsics>(), 48);
        assert_eq!(std::mem::size_of::<HostFrame>(), 8 + 8 + std::mem::size_of::<usize>() + 24 + 48);
        assert_eq!(std::mem::size_of::<PlatformData>(), 0);
    }
}
