//! The camera session: device discovery, capability translation and the
//! open/start/stop/close lifecycle.

use tracing::{debug, error, info, warn};

use crate::controls::{
    self, exposure_from_ns, exposure_to_ns, focus_to_device, AeMode, AeModes, AutoFocus,
    SimpleFocusRange, TerminalCapabilities, SIMPLE_FOCUS,
};
use crate::frame;
use crate::modes;
use crate::traits::{
    Bridge, CameraIntrinsics, CameraMode, ControlRequest, DeviceHandle, DriverError,
    ExposureMode, FocusMode, FrameFormat, Result, SharedSink, Transport, UsbDeviceId,
};

type StreamControl<T> = <<T as Transport>::Handle as DeviceHandle>::StreamControl;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No device handle.
    #[default]
    Closed,
    /// A device is open and idle.
    Opened,
    /// Frames are being delivered.
    Streaming,
}

/// Capabilities read from the device at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Terminal controls the session acts on.
    pub terminal: TerminalCapabilities,
    /// Supported auto-exposure modes.
    pub ae_modes: AeModes,
}

/// A session with one UVC camera.
pub struct ExternalCamera<B: Bridge, T: Transport> {
    bridge: B,
    transport: T,
    // Dropped in this order: handle, device, context.
    handle: Option<T::Handle>,
    device: Option<T::Device>,
    context: Option<T::Context>,
    stream_control: Option<StreamControl<T>>,
    identity: Option<UsbDeviceId>,
    capabilities: Capabilities,
    modes: Vec<CameraMode>,
    sink: Option<SharedSink>,
    intrinsics: CameraIntrinsics,
    state: SessionState,
}

impl<B: Bridge, T: Transport> ExternalCamera<B, T> {
    /// Create a closed session.
    pub fn new(bridge: B, transport: T) -> Self {
        Self {
            bridge,
            transport,
            handle: None,
            device: None,
            context: None,
            stream_control: None,
            identity: None,
            capabilities: Capabilities::default(),
            modes: Vec::new(),
            sink: None,
            intrinsics: CameraIntrinsics::default(),
            state: SessionState::Closed,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Capabilities of the open device.
    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Intrinsics of the last successfully started stream.
    pub const fn intrinsics(&self) -> CameraIntrinsics {
        self.intrinsics
    }

    /// Identity of the open device.
    pub const fn identity(&self) -> Option<UsbDeviceId> {
        self.identity
    }

    /// Open the first USB camera the bridge offers that the transport can open.
    ///
    /// An already open device is closed first, so a failed scan always leaves
    /// the session closed.
    pub fn open(&mut self) -> Result<()> {
        self.bridge.attach()?;
        if self.state != SessionState::Closed {
            info!("closing previous device before rescan");
            self.stop_if_streaming();
            self.close();
        }

        let count = self.bridge.num_devices()?;
        debug!(count, "usb devices offered by bridge");

        let mut opened = None;
        for index in 0..count {
            match self.bridge.use_device(index) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(index, "device could not be claimed");
                    continue;
                }
                Err(err) => {
                    error!(index, %err, "claiming device failed");
                    continue;
                }
            }

            match self.open_claimed(index) {
                Ok(identity) => {
                    opened = Some(identity);
                    break;
                }
                Err(err) => {
                    error!(index, %err, "failed to open device");
                    self.release_transport();
                    self.release_claim();
                }
            }
        }

        let Some(identity) = opened else {
            self.close();
            return Err(DriverError::NoDeviceOpened);
        };

        info!(
            vendor_id = format_args!("{:#06x}", identity.vendor_id),
            product_id = format_args!("{:#06x}", identity.product_id),
            bus = identity.bus_number,
            device = identity.device_number,
            "opened usb camera"
        );
        self.identity = Some(identity);
        self.probe_device();
        self.state = SessionState::Opened;
        Ok(())
    }

    fn open_claimed(&mut self, index: i32) -> Result<UsbDeviceId> {
        let usbfs = self
            .bridge
            .usbfs()?
            .ok_or_else(|| DriverError::Bridge(format!("no usb filesystem path for device {index}")))?;

        if self.release_transport() {
            info!("released previous transport context");
        }

        let context = self.context.insert(self.transport.init(&usbfs)?);
        let identity = self.bridge.device_identity()?;
        let device = self.device.insert(self.transport.find_device(context, &identity)?);
        self.handle = Some(self.transport.open(device)?);
        Ok(identity)
    }

    /// Read modes and capabilities of the freshly opened device.
    fn probe_device(&mut self) {
        let Some(handle) = self.handle.as_ref() else {
            return;
        };

        self.modes = modes::enumerate(&handle.format_descriptors());
        info!(count = self.modes.len(), "camera modes enumerated");

        let terminal_bits = handle.terminal_controls();
        let terminal = TerminalCapabilities::from_bits(terminal_bits);
        let ae_modes = if terminal.ae_mode {
            handle
                .ae_mode(ControlRequest::Res)
                .map(AeModes::from_bits)
                .unwrap_or_else(|err| {
                    warn!(%err, "failed to read supported exposure modes");
                    AeModes::default()
                })
        } else {
            AeModes::default()
        };
        self.capabilities = Capabilities { terminal, ae_modes };

        handle.log_diagnostics();
        controls::log_control_support(terminal_bits, handle.processing_unit_controls());
    }

    /// Drop handle, device and context; returns whether a context existed.
    fn release_transport(&mut self) -> bool {
        self.stream_control = None;
        self.handle = None;
        self.device = None;
        self.context.take().is_some()
    }

    fn release_claim(&mut self) {
        if let Err(err) = self.bridge.release_device() {
            warn!(%err, "failed to release device claim");
        }
    }

    /// Release the device. Idempotent.
    pub fn close(&mut self) {
        self.release_transport();
        if self.identity.take().is_some() {
            self.release_claim();
            debug!("camera closed");
        }
        self.modes.clear();
        self.capabilities = Capabilities::default();
        self.state = SessionState::Closed;
    }

    /// Start streaming `mode`, delivering frames to `sink`.
    pub fn start(&mut self, mode: CameraMode, sink: Option<SharedSink>) -> Result<()> {
        if self.state == SessionState::Streaming {
            return Err(DriverError::InvalidArgument("camera is already streaming".to_owned()));
        }
        let identity = self.identity.ok_or(DriverError::NoDevice)?;
        let intrinsics = self.resolve_intrinsics(identity, mode);
        let handle = self.handle.as_mut().ok_or(DriverError::NoDevice)?;

        let format = modes::frame_format_for(mode.format);
        if format == FrameFormat::Unknown {
            return Err(DriverError::Unsupported("pixel format"));
        }

        let control = handle.negotiate(format, mode.width, mode.height, mode.fps)?;
        let on_frame = frame::delivery(sink.clone(), intrinsics, handle.exposure_probe());
        handle.start_streaming(&control, on_frame)?;

        info!(
            width = mode.width,
            height = mode.height,
            fps = mode.fps,
            calibrated = intrinsics.is_calibrated(),
            "streaming started"
        );
        self.stream_control = Some(control);
        self.sink = sink;
        self.intrinsics = intrinsics;
        self.state = SessionState::Streaming;
        Ok(())
    }

    fn resolve_intrinsics(&self, identity: UsbDeviceId, mode: CameraMode) -> CameraIntrinsics {
        let lookup = self.bridge.calibration_value(
            identity.vendor_id,
            identity.product_id,
            mode.width,
            mode.height,
        );
        match lookup {
            Ok(Some(values)) => CameraIntrinsics::from_calibration(&values).unwrap_or_else(|| {
                warn!(len = values.len(), "malformed calibration record");
                CameraIntrinsics::default()
            }),
            Ok(None) => {
                debug!(width = mode.width, height = mode.height, "no calibration for mode");
                CameraIntrinsics::default()
            }
            Err(err) => {
                error!(%err, "calibration lookup failed");
                CameraIntrinsics::default()
            }
        }
    }

    /// Stop streaming. The sink stays registered.
    pub fn stop(&mut self) -> Result<()> {
        let handle = self.handle.as_mut().ok_or(DriverError::NoDevice)?;
        handle.stop_streaming();
        self.state = SessionState::Opened;
        debug!("streaming stopped");
        Ok(())
    }

    fn stop_if_streaming(&mut self) {
        if self.state == SessionState::Streaming {
            if let Err(err) = self.stop() {
                warn!(%err, "failed to stop streaming");
            }
        }
    }

    /// Number of supported modes.
    pub fn num_supported_camera_modes(&self) -> usize {
        self.modes.len()
    }

    /// The mode at `index`.
    pub fn supported_camera_mode(&self, index: usize) -> Result<CameraMode> {
        self.modes.get(index).copied().ok_or_else(|| {
            DriverError::InvalidArgument(format!(
                "mode index {index} out of range ({} modes)",
                self.modes.len()
            ))
        })
    }

    fn handle(&self) -> Result<&T::Handle> {
        self.handle.as_ref().ok_or(DriverError::NoDevice)
    }

    fn handle_mut(&mut self) -> Result<&mut T::Handle> {
        self.handle.as_mut().ok_or(DriverError::NoDevice)
    }

    /// Whether the device can be put into `mode`.
    pub const fn supports_exposure_mode(&self, mode: ExposureMode) -> bool {
        self.capabilities.terminal.ae_mode && self.capabilities.ae_modes.supports(mode)
    }

    /// The current exposure mode; `Unknown` when it cannot be read.
    pub fn exposure_mode(&self) -> ExposureMode {
        let current = self
            .handle()
            .and_then(|handle| handle.ae_mode(ControlRequest::Cur));
        match current {
            Ok(value) => AeMode::from_value(value).map_or(ExposureMode::Unknown, AeMode::exposure_mode),
            Err(err) => {
                error!(%err, "failed to read exposure mode");
                ExposureMode::Unknown
            }
        }
    }

    /// Put the device into `mode`, trying each backing device mode in turn.
    pub fn set_exposure_mode(&mut self, mode: ExposureMode) -> Result<()> {
        let candidates = AeMode::candidates(mode);
        if candidates.is_empty() {
            return Err(DriverError::Unsupported("exposure mode"));
        }

        let handle = self.handle_mut()?;
        let mut last_error = DriverError::Unsupported("exposure mode");
        for candidate in candidates {
            match handle.set_ae_mode(candidate.value()) {
                Ok(()) => {
                    debug!(?mode, device_mode = ?candidate, "exposure mode set");
                    return Ok(());
                }
                Err(err) => {
                    debug!(device_mode = ?candidate, %err, "device rejected exposure mode");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    /// Whether absolute exposure time can be read and set.
    pub const fn supports_exposure_value(&self) -> bool {
        self.capabilities.terminal.exposure_time_absolute
    }

    fn exposure_request(&self, request: ControlRequest) -> Result<u64> {
        self.handle()?.exposure_abs(request).map(exposure_to_ns)
    }

    /// Minimum exposure time in nanoseconds.
    pub fn exposure_value_min(&self) -> Result<u64> {
        self.exposure_request(ControlRequest::Min)
    }

    /// Maximum exposure time in nanoseconds.
    pub fn exposure_value_max(&self) -> Result<u64> {
        self.exposure_request(ControlRequest::Max)
    }

    /// Current exposure time in nanoseconds.
    pub fn exposure_value(&self) -> Result<u64> {
        self.exposure_request(ControlRequest::Cur)
    }

    /// Set the exposure time in nanoseconds, truncated to device units.
    pub fn set_exposure_value(&mut self, ns: u64) -> Result<()> {
        self.handle_mut()?.set_exposure_abs(exposure_from_ns(ns))
    }

    /// Whether the device can be put into `mode`.
    pub const fn supports_focus_mode(&self, mode: FocusMode) -> bool {
        let terminal = self.capabilities.terminal;
        match mode {
            FocusMode::Fixed => true,
            FocusMode::ContinuousAuto => terminal.focus_auto,
            FocusMode::Macro | FocusMode::InfinityFocus => SIMPLE_FOCUS && terminal.focus_simple,
            FocusMode::Auto | FocusMode::Unknown => false,
        }
    }

    /// The current focus mode.
    pub fn focus_mode(&self) -> FocusMode {
        let Ok(handle) = self.handle() else {
            error!("no device handle for focus mode");
            return FocusMode::Unknown;
        };

        if self.capabilities.terminal.focus_auto {
            match handle.focus_auto(ControlRequest::Cur) {
                Ok(state) if state == AutoFocus::Auto as u8 => return FocusMode::ContinuousAuto,
                Ok(_) => {}
                Err(err) => warn!(%err, "failed to read auto focus"),
            }
        }

        if SIMPLE_FOCUS && self.capabilities.terminal.focus_simple {
            match handle.focus_simple_range(ControlRequest::Cur) {
                Ok(range) => {
                    if let Some(mode) = SimpleFocusRange::focus_mode(range) {
                        return mode;
                    }
                }
                Err(err) => warn!(%err, "failed to read focus range"),
            }
        }

        FocusMode::Fixed
    }

    /// Put the device into `mode`.
    ///
    /// For `Fixed`, auto focus is switched off first; resetting the simple
    /// focus range afterwards is best effort.
    pub fn set_focus_mode(&mut self, mode: FocusMode) -> Result<()> {
        let terminal = self.capabilities.terminal;
        let handle = self.handle_mut()?;

        match mode {
            FocusMode::ContinuousAuto => handle.set_focus_auto(AutoFocus::Auto as u8),
            FocusMode::Macro | FocusMode::InfinityFocus => {
                if !SIMPLE_FOCUS {
                    return Err(DriverError::Unsupported("simple focus range"));
                }
                let range = SimpleFocusRange::for_focus_mode(mode)
                    .ok_or(DriverError::Unsupported("focus mode"))?;
                handle.set_focus_simple_range(range as u8)
            }
            FocusMode::Fixed => {
                if terminal.focus_auto {
                    handle.set_focus_auto(AutoFocus::Fixed as u8)?;
                }
                if SIMPLE_FOCUS && terminal.focus_simple {
                    if let Err(err) =
                        handle.set_focus_simple_range(SimpleFocusRange::FullRange as u8)
                    {
                        warn!(%err, "failed to reset focus range");
                    }
                }
                Ok(())
            }
            FocusMode::Auto | FocusMode::Unknown => Err(DriverError::Unsupported("focus mode")),
        }
    }

    /// Whether the absolute focus position can be read and set.
    pub const fn supports_focus_value(&self) -> bool {
        self.capabilities.terminal.focus_absolute
    }

    fn focus_request(&self, request: ControlRequest) -> Result<f32> {
        self.handle()?.focus_abs(request).map(f32::from)
    }

    /// Minimum focus position.
    pub fn focus_value_min(&self) -> Result<f32> {
        self.focus_request(ControlRequest::Min)
    }

    /// Maximum focus position.
    pub fn focus_value_max(&self) -> Result<f32> {
        self.focus_request(ControlRequest::Max)
    }

    /// Current focus position.
    pub fn focus_value(&self) -> Result<f32> {
        self.focus_request(ControlRequest::Cur)
    }

    /// Set the focus position, saturating to the device range.
    pub fn set_focus_value(&mut self, value: f32) -> Result<()> {
        self.handle_mut()?.set_focus_abs(focus_to_device(value))
    }
}

impl<B: Bridge, T: Transport> Drop for ExternalCamera<B, T> {
    fn drop(&mut self) {
        self.stop_if_streaming();
        self.close();
    }
}
