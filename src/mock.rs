//! Mock bridge and transport for testing without hardware.
//!
//! Both mocks keep their state behind an `Arc<Mutex<_>>` so tests can inspect
//! and steer them after moving them into a session.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::calibration::CalibrationTable;
use crate::controls::{AeMode, TerminalControl};
use crate::traits::{
    Bridge, CameraFrame, CameraIntrinsics, ControlRequest, DescriptorSubtype, DeviceHandle,
    DriverError, ExposureProbe, FormatDescriptor, FourCC, FrameCallback, FrameDescriptor,
    FrameFormat, FrameSink, RawFrame, Result, Transport, UsbDeviceId,
};

/// A USB device offered by [`MockBridge`].
#[derive(Debug, Clone)]
pub struct MockUsbDevice {
    /// Vendor id.
    pub vendor_id: i32,
    /// Product id.
    pub product_id: i32,
    /// Bus number.
    pub bus_number: i32,
    /// Device number; also used as the mock file descriptor.
    pub device_number: i32,
    /// Whether `use_device` succeeds.
    pub claimable: bool,
    /// Reported usbfs root.
    pub usbfs: Option<String>,
}

impl MockUsbDevice {
    /// A claimable camera; the device number is derived from the vendor id.
    #[must_use]
    pub fn camera(vendor_id: i32, product_id: i32) -> Self {
        Self {
            vendor_id,
            product_id,
            bus_number: 1,
            device_number: vendor_id & 0x7f,
            claimable: true,
            usbfs: Some("/dev/bus/usb".to_owned()),
        }
    }
}

/// Calls observed by [`MockBridge`].
#[derive(Debug, Default)]
pub struct BridgeLog {
    /// Times the helper objects were created.
    pub helpers_created: usize,
    /// Indices successfully claimed, in order.
    pub claims: Vec<i32>,
    /// Number of released claims.
    pub releases: usize,
}

/// Bridge serving a fixed device list and the built-in calibrations.
pub struct MockBridge {
    devices: Vec<MockUsbDevice>,
    claimed: Option<usize>,
    attached: bool,
    calibrations: CalibrationTable,
    log: Arc<Mutex<BridgeLog>>,
}

impl MockBridge {
    /// Create a bridge offering `devices`.
    #[must_use]
    pub fn new(devices: Vec<MockUsbDevice>) -> Self {
        Self {
            devices,
            claimed: None,
            attached: false,
            calibrations: CalibrationTable::builtin(),
            log: Arc::default(),
        }
    }

    /// Shared call log.
    #[must_use]
    pub fn log(&self) -> Arc<Mutex<BridgeLog>> {
        Arc::clone(&self.log)
    }

    fn claimed(&self) -> Result<&MockUsbDevice> {
        self.claimed
            .and_then(|index| self.devices.get(index))
            .ok_or_else(|| DriverError::Bridge("no device claimed".to_owned()))
    }

    fn record(&self) -> MutexGuard<'_, BridgeLog> {
        self.log.lock().expect("bridge log poisoned")
    }
}

impl Bridge for MockBridge {
    fn attach(&mut self) -> Result<()> {
        if !self.attached {
            self.attached = true;
            self.record().helpers_created += 1;
        }
        Ok(())
    }

    fn num_devices(&self) -> Result<i32> {
        Ok(i32::try_from(self.devices.len()).unwrap_or(i32::MAX))
    }

    fn use_device(&mut self, index: i32) -> Result<bool> {
        let slot = usize::try_from(index).ok();
        match slot.and_then(|i| self.devices.get(i).map(|d| (i, d.claimable))) {
            Some((slot, true)) => {
                self.claimed = Some(slot);
                self.record().claims.push(index);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_device(&mut self) -> Result<()> {
        if self.claimed.take().is_some() {
            self.record().releases += 1;
        }
        Ok(())
    }

    fn vendor_id(&self) -> Result<i32> {
        Ok(self.claimed()?.vendor_id)
    }

    fn product_id(&self) -> Result<i32> {
        Ok(self.claimed()?.product_id)
    }

    fn file_descriptor(&self) -> Result<i32> {
        Ok(self.claimed()?.device_number)
    }

    fn usbfs(&self) -> Result<Option<String>> {
        Ok(self.claimed()?.usbfs.clone())
    }

    fn bus_number(&self) -> Result<i32> {
        Ok(self.claimed()?.bus_number)
    }

    fn device_number(&self) -> Result<i32> {
        Ok(self.claimed()?.device_number)
    }

    fn calibration_value(
        &self,
        vendor_id: i32,
        product_id: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<f32>>> {
        Ok(self
            .calibrations
            .lookup(vendor_id, product_id, width, height)
            .map(crate::calibration::Calibration::to_values))
    }
}

/// State shared by a [`MockTransport`] and the resources it hands out.
struct MockState {
    live_contexts: usize,
    live_handles: usize,
    fail_open: HashSet<i32>,
    descriptors: Vec<FormatDescriptor>,
    terminal_controls: u64,
    ae_modes: u8,
    ae_mode: u8,
    rejected_ae_modes: HashSet<u8>,
    exposure: u32,
    focus_auto: u8,
    fail_focus_auto: bool,
    focus: i16,
    focus_range: u8,
    fail_negotiation: bool,
    streaming: Option<(MockStreamControl, FrameCallback)>,
    sequence: u32,
}

impl MockState {
    fn new() -> Self {
        let terminal_controls = [
            TerminalControl::AeMode,
            TerminalControl::ExposureTimeAbsolute,
            TerminalControl::FocusAbsolute,
            TerminalControl::FocusAuto,
            TerminalControl::FocusSimple,
        ]
        .iter()
        .fold(0, |bits, control| bits | (1 << control.bit()));

        Self {
            live_contexts: 0,
            live_handles: 0,
            fail_open: HashSet::new(),
            descriptors: default_descriptors(),
            terminal_controls,
            ae_modes: 0x0f,
            ae_mode: AeMode::Auto.value(),
            rejected_ae_modes: HashSet::new(),
            exposure: 333,
            focus_auto: 1,
            fail_focus_auto: false,
            focus: 0,
            focus_range: 0,
            fail_negotiation: false,
            streaming: None,
            sequence: 0,
        }
    }
}

/// YUY2 at 640x480@30 and 1280x720@10, plus an MJPEG format.
fn default_descriptors() -> Vec<FormatDescriptor> {
    let frame = |width: u16, height: u16, interval: u32| FrameDescriptor {
        subtype: DescriptorSubtype::FrameUncompressed,
        width,
        height,
        intervals: vec![interval, interval * 2],
    };
    vec![
        FormatDescriptor {
            subtype: DescriptorSubtype::FormatUncompressed,
            fourcc: FourCC::YUY2,
            frames: vec![frame(640, 480, 333_333), frame(1280, 720, 1_000_000)],
        },
        FormatDescriptor {
            subtype: DescriptorSubtype::FormatMjpeg,
            fourcc: FourCC::MJPG,
            frames: vec![FrameDescriptor {
                subtype: DescriptorSubtype::FrameMjpeg,
                width: 1920,
                height: 1080,
                intervals: vec![333_333],
            }],
        },
    ]
}

type SharedState = Arc<Mutex<MockState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, MockState> {
    state.lock().expect("mock transport state poisoned")
}

/// Transport backed by in-memory state.
#[derive(Clone)]
pub struct MockTransport {
    state: SharedState,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport offering the default descriptors and controls.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new())),
        }
    }

    /// Fail `open` for the device with this device number.
    pub fn fail_open_for(&self, device_number: i32) {
        lock(&self.state).fail_open.insert(device_number);
    }

    /// Set the terminal `bmControls`.
    pub fn set_terminal_controls(&self, bits: u64) {
        lock(&self.state).terminal_controls = bits;
    }

    /// Set the AE-mode resolution bitmap.
    pub fn set_ae_modes(&self, bits: u8) {
        lock(&self.state).ae_modes = bits;
    }

    /// Make the device reject an AE mode value.
    pub fn reject_ae_mode(&self, mode: u8) {
        lock(&self.state).rejected_ae_modes.insert(mode);
    }

    /// Fail every auto-focus set.
    pub fn fail_focus_auto(&self, fail: bool) {
        lock(&self.state).fail_focus_auto = fail;
    }

    /// Fail stream negotiation.
    pub fn fail_negotiation(&self, fail: bool) {
        lock(&self.state).fail_negotiation = fail;
    }

    /// Number of contexts not yet dropped.
    #[must_use]
    pub fn live_contexts(&self) -> usize {
        lock(&self.state).live_contexts
    }

    /// Number of handles not yet dropped.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        lock(&self.state).live_handles
    }

    /// Whether a stream is running.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        lock(&self.state).streaming.is_some()
    }

    /// Current AE mode value.
    #[must_use]
    pub fn ae_mode(&self) -> u8 {
        lock(&self.state).ae_mode
    }

    /// Current exposure in device units.
    #[must_use]
    pub fn exposure(&self) -> u32 {
        lock(&self.state).exposure
    }

    /// Current auto-focus value.
    #[must_use]
    pub fn focus_auto(&self) -> u8 {
        lock(&self.state).focus_auto
    }

    /// Deliver `count` frames on a separate thread, as a transport would.
    pub fn deliver(&self, count: usize) {
        let Some((control, mut on_frame)) = lock(&self.state).streaming.take() else {
            return;
        };
        let first = lock(&self.state).sequence;

        let worker = thread::spawn(move || {
            let stride = control.width * 2;
            let data = vec![0x80u8; (stride * control.height) as usize];
            for sequence in (first..).take(count) {
                on_frame(&RawFrame {
                    data: &data,
                    width: control.width,
                    height: control.height,
                    format: control.format,
                    step: stride,
                    sequence,
                });
            }
            on_frame
        });
        let on_frame = worker.join().expect("delivery thread panicked");

        let mut state = lock(&self.state);
        state.sequence = first + u32::try_from(count).unwrap_or(u32::MAX);
        state.streaming = Some((control, on_frame));
    }
}

/// Context counting itself in the shared state.
pub struct MockContext {
    state: SharedState,
}

impl Drop for MockContext {
    fn drop(&mut self) {
        lock(&self.state).live_contexts -= 1;
    }
}

/// Unopened mock device.
pub struct MockDeviceRef {
    id: UsbDeviceId,
}

impl Transport for MockTransport {
    type Context = MockContext;
    type Device = MockDeviceRef;
    type Handle = MockHandle;

    fn init(&mut self, _usbfs: &str) -> Result<MockContext> {
        lock(&self.state).live_contexts += 1;
        Ok(MockContext {
            state: Arc::clone(&self.state),
        })
    }

    fn find_device(&mut self, _context: &MockContext, id: &UsbDeviceId) -> Result<MockDeviceRef> {
        Ok(MockDeviceRef { id: *id })
    }

    fn open(&mut self, device: &MockDeviceRef) -> Result<MockHandle> {
        let mut state = lock(&self.state);
        if state.fail_open.contains(&device.id.device_number) {
            return Err(DriverError::Transport { op: "open", code: -4 });
        }
        state.live_handles += 1;
        Ok(MockHandle {
            state: Arc::clone(&self.state),
        })
    }
}

/// Negotiated mock stream.
#[derive(Debug, Clone, Copy)]
pub struct MockStreamControl {
    format: FrameFormat,
    width: u32,
    height: u32,
}

/// Opened mock device.
pub struct MockHandle {
    state: SharedState,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.streaming = None;
        state.live_handles -= 1;
    }
}

fn unsupported_request(request: ControlRequest) -> DriverError {
    DriverError::InvalidArgument(format!("request {request:?} not supported by mock"))
}

impl DeviceHandle for MockHandle {
    type StreamControl = MockStreamControl;

    fn format_descriptors(&self) -> Vec<FormatDescriptor> {
        lock(&self.state).descriptors.clone()
    }

    fn terminal_controls(&self) -> u64 {
        lock(&self.state).terminal_controls
    }

    fn processing_unit_controls(&self) -> u64 {
        0b11
    }

    fn ae_mode(&self, request: ControlRequest) -> Result<u8> {
        let state = lock(&self.state);
        match request {
            ControlRequest::Cur => Ok(state.ae_mode),
            ControlRequest::Res => Ok(state.ae_modes),
            other => Err(unsupported_request(other)),
        }
    }

    fn set_ae_mode(&mut self, mode: u8) -> Result<()> {
        let mut state = lock(&self.state);
        if state.rejected_ae_modes.contains(&mode) {
            return Err(DriverError::Transport { op: "set_ae_mode", code: -9 });
        }
        state.ae_mode = mode;
        Ok(())
    }

    fn exposure_abs(&self, request: ControlRequest) -> Result<u32> {
        match request {
            ControlRequest::Cur => Ok(lock(&self.state).exposure),
            ControlRequest::Min => Ok(1),
            ControlRequest::Max => Ok(10_000),
            other => Err(unsupported_request(other)),
        }
    }

    fn set_exposure_abs(&mut self, value: u32) -> Result<()> {
        lock(&self.state).exposure = value;
        Ok(())
    }

    fn exposure_probe(&self) -> ExposureProbe {
        let state = Arc::clone(&self.state);
        Box::new(move || Ok(lock(&state).exposure))
    }

    fn focus_auto(&self, request: ControlRequest) -> Result<u8> {
        match request {
            ControlRequest::Cur => Ok(lock(&self.state).focus_auto),
            other => Err(unsupported_request(other)),
        }
    }

    fn set_focus_auto(&mut self, value: u8) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_focus_auto {
            return Err(DriverError::Transport { op: "set_focus_auto", code: -9 });
        }
        state.focus_auto = value;
        Ok(())
    }

    fn focus_abs(&self, request: ControlRequest) -> Result<i16> {
        match request {
            ControlRequest::Cur => Ok(lock(&self.state).focus),
            ControlRequest::Min => Ok(0),
            ControlRequest::Max => Ok(250),
            other => Err(unsupported_request(other)),
        }
    }

    fn set_focus_abs(&mut self, value: i16) -> Result<()> {
        lock(&self.state).focus = value;
        Ok(())
    }

    fn focus_simple_range(&self, request: ControlRequest) -> Result<u8> {
        match request {
            ControlRequest::Cur => Ok(lock(&self.state).focus_range),
            other => Err(unsupported_request(other)),
        }
    }

    fn set_focus_simple_range(&mut self, range: u8) -> Result<()> {
        lock(&self.state).focus_range = range;
        Ok(())
    }

    fn negotiate(
        &mut self,
        format: FrameFormat,
        width: u32,
        height: u32,
        _fps: u32,
    ) -> Result<MockStreamControl> {
        if lock(&self.state).fail_negotiation {
            return Err(DriverError::Negotiation("mock refused".to_owned()));
        }
        Ok(MockStreamControl {
            format,
            width,
            height,
        })
    }

    fn start_streaming(&mut self, control: &MockStreamControl, on_frame: FrameCallback) -> Result<()> {
        let mut state = lock(&self.state);
        if state.streaming.is_some() {
            return Err(DriverError::Transport { op: "start_streaming", code: -6 });
        }
        state.streaming = Some((*control, on_frame));
        Ok(())
    }

    fn stop_streaming(&mut self) {
        lock(&self.state).streaming = None;
    }

    fn log_diagnostics(&self) {}
}

/// What [`RecordingSink`] kept of a frame.
#[derive(Debug, Clone)]
pub struct RecordedFrame {
    /// Frame index.
    pub index: u32,
    /// Timestamp in nanoseconds.
    pub timestamp: u64,
    /// Exposure in nanoseconds.
    pub exposure_time: u64,
    /// Frame width.
    pub width: u32,
    /// Bytes per row.
    pub stride: u32,
    /// Buffer length.
    pub len: usize,
    /// Intrinsics.
    pub intrinsics: CameraIntrinsics,
}

/// Sink recording frame metadata.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<RecordedFrame>>,
}

impl RecordingSink {
    /// Frames received so far.
    #[must_use]
    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.frames.lock().expect("sink poisoned").clone()
    }
}

impl FrameSink for RecordingSink {
    fn on_new_camera_frame(&self, frame: &CameraFrame<'_>) {
        self.frames.lock().expect("sink poisoned").push(RecordedFrame {
            index: frame.index,
            timestamp: frame.timestamp,
            exposure_time: frame.exposure_time,
            width: frame.width,
            stride: frame.stride,
            len: frame.buffer.len(),
            intrinsics: frame.intrinsics,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_bridge_claim_and_release() {
        let mut bridge = MockBridge::new(vec![MockUsbDevice::camera(0x46d, 0x81b)]);

        assert!(bridge.vendor_id().is_err());
        assert!(bridge.use_device(0).expect("claim"));
        assert!(!bridge.use_device(1).expect("out of range"));
        assert_eq!(bridge.vendor_id().expect("vid"), 0x46d);
        assert!(bridge.calibration_value(0x46d, 0x81b, 640, 480).expect("lookup").is_some());

        bridge.release_device().expect("release");
        assert_eq!(bridge.log().lock().expect("log").releases, 1);
    }

    #[test]
    fn test_mock_transport_counts_resources() {
        let mut transport = MockTransport::new();
        let context = transport.init("/dev/bus/usb").expect("init");
        let device = transport
            .find_device(&context, &UsbDeviceId::default())
            .expect("find");
        let handle = transport.open(&device).expect("open");
        assert_eq!(transport.live_contexts(), 1);
        assert_eq!(transport.live_handles(), 1);

        drop(handle);
        drop(context);
        assert_eq!(transport.live_contexts(), 0);
        assert_eq!(transport.live_handles(), 0);
    }

    #[test]
    fn test_deliver_without_stream_is_noop() {
        let transport = MockTransport::new();
        transport.deliver(3);
        assert!(!transport.is_streaming());
    }
}
