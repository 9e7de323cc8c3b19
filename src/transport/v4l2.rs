//! Transport over the kernel `uvcvideo` driver using the v4l crate.
//!
//! The device is found by matching the USB bus and device numbers of the
//! claimed device against the parents of `/sys/class/video4linux` nodes.
//! V4L2 controls are reported back in UVC terms: control presence as
//! `bmControls` bits, the exposure menu as AE-mode bits.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Description, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::controls::{AeMode, ProcessingUnitControl, SimpleFocusRange, TerminalControl};
use crate::traits::{
    ControlRequest, DescriptorSubtype, DeviceHandle, DriverError, ExposureProbe,
    FormatDescriptor, FourCC, FrameCallback, FrameDescriptor, FrameFormat, RawFrame, Result,
    Transport, UsbDeviceId,
};

const BUFFER_COUNT: u32 = 4;
const DEQUEUE_TIMEOUT_MS: u64 = 200;

/// V4L2 control ids (linux/v4l2-controls.h).
mod cid {
    const USER_BASE: u32 = 0x0098_0900;
    const CAMERA_CLASS_BASE: u32 = 0x009a_0900;

    pub const BRIGHTNESS: u32 = USER_BASE;
    pub const CONTRAST: u32 = USER_BASE + 1;
    pub const SATURATION: u32 = USER_BASE + 2;
    pub const HUE: u32 = USER_BASE + 3;
    pub const AUTO_WHITE_BALANCE: u32 = USER_BASE + 12;
    pub const GAMMA: u32 = USER_BASE + 16;
    pub const GAIN: u32 = USER_BASE + 19;
    pub const POWER_LINE_FREQUENCY: u32 = USER_BASE + 24;
    pub const HUE_AUTO: u32 = USER_BASE + 25;
    pub const WHITE_BALANCE_TEMPERATURE: u32 = USER_BASE + 26;
    pub const SHARPNESS: u32 = USER_BASE + 27;
    pub const BACKLIGHT_COMPENSATION: u32 = USER_BASE + 28;

    pub const EXPOSURE_AUTO: u32 = CAMERA_CLASS_BASE + 1;
    pub const EXPOSURE_ABSOLUTE: u32 = CAMERA_CLASS_BASE + 2;
    pub const EXPOSURE_AUTO_PRIORITY: u32 = CAMERA_CLASS_BASE + 3;
    pub const PAN_RELATIVE: u32 = CAMERA_CLASS_BASE + 4;
    pub const PAN_ABSOLUTE: u32 = CAMERA_CLASS_BASE + 8;
    pub const FOCUS_ABSOLUTE: u32 = CAMERA_CLASS_BASE + 10;
    pub const FOCUS_RELATIVE: u32 = CAMERA_CLASS_BASE + 11;
    pub const FOCUS_AUTO: u32 = CAMERA_CLASS_BASE + 12;
    pub const ZOOM_ABSOLUTE: u32 = CAMERA_CLASS_BASE + 13;
    pub const ZOOM_RELATIVE: u32 = CAMERA_CLASS_BASE + 14;
    pub const PRIVACY: u32 = CAMERA_CLASS_BASE + 16;
    pub const IRIS_ABSOLUTE: u32 = CAMERA_CLASS_BASE + 17;
    pub const IRIS_RELATIVE: u32 = CAMERA_CLASS_BASE + 18;
    pub const AUTO_FOCUS_RANGE: u32 = CAMERA_CLASS_BASE + 31;
}

const TERMINAL_CONTROLS: [(u32, TerminalControl); 14] = [
    (cid::EXPOSURE_AUTO, TerminalControl::AeMode),
    (cid::EXPOSURE_AUTO_PRIORITY, TerminalControl::AePriority),
    (cid::EXPOSURE_ABSOLUTE, TerminalControl::ExposureTimeAbsolute),
    (cid::FOCUS_ABSOLUTE, TerminalControl::FocusAbsolute),
    (cid::FOCUS_RELATIVE, TerminalControl::FocusRelative),
    (cid::IRIS_ABSOLUTE, TerminalControl::IrisAbsolute),
    (cid::IRIS_RELATIVE, TerminalControl::IrisRelative),
    (cid::ZOOM_ABSOLUTE, TerminalControl::ZoomAbsolute),
    (cid::ZOOM_RELATIVE, TerminalControl::ZoomRelative),
    (cid::PAN_ABSOLUTE, TerminalControl::PanTiltAbsolute),
    (cid::PAN_RELATIVE, TerminalControl::PanTiltRelative),
    (cid::FOCUS_AUTO, TerminalControl::FocusAuto),
    (cid::PRIVACY, TerminalControl::Privacy),
    (cid::AUTO_FOCUS_RANGE, TerminalControl::FocusSimple),
];

const PROCESSING_UNIT_CONTROLS: [(u32, ProcessingUnitControl); 12] = [
    (cid::BRIGHTNESS, ProcessingUnitControl::Brightness),
    (cid::CONTRAST, ProcessingUnitControl::Contrast),
    (cid::HUE, ProcessingUnitControl::Hue),
    (cid::SATURATION, ProcessingUnitControl::Saturation),
    (cid::SHARPNESS, ProcessingUnitControl::Sharpness),
    (cid::GAMMA, ProcessingUnitControl::Gamma),
    (cid::WHITE_BALANCE_TEMPERATURE, ProcessingUnitControl::WhiteBalanceTemperature),
    (cid::BACKLIGHT_COMPENSATION, ProcessingUnitControl::BacklightCompensation),
    (cid::GAIN, ProcessingUnitControl::Gain),
    (cid::POWER_LINE_FREQUENCY, ProcessingUnitControl::PowerLineFrequency),
    (cid::HUE_AUTO, ProcessingUnitControl::HueAuto),
    (cid::AUTO_WHITE_BALANCE, ProcessingUnitControl::WhiteBalanceTemperatureAuto),
];

/// `V4L2_EXPOSURE_*` menu index for each AE mode.
const EXPOSURE_MENU: [(i64, AeMode); 4] = [
    (0, AeMode::Auto),
    (1, AeMode::Manual),
    (2, AeMode::ShutterPriority),
    (3, AeMode::AperturePriority),
];

/// `V4L2_AUTO_FOCUS_RANGE_*` menu index for each simple focus range.
const FOCUS_RANGE_MENU: [(i64, SimpleFocusRange); 4] = [
    (0, SimpleFocusRange::FullRange),
    (1, SimpleFocusRange::People),
    (2, SimpleFocusRange::Macro),
    (3, SimpleFocusRange::Scene),
];

fn ae_mode_for_menu(index: i64) -> Option<AeMode> {
    EXPOSURE_MENU
        .iter()
        .find(|(menu, _)| *menu == index)
        .map(|(_, mode)| *mode)
}

fn transport_error(op: &'static str) -> impl Fn(io::Error) -> DriverError {
    move |err| DriverError::Transport {
        op,
        code: err.raw_os_error().map_or(-1, |code| -code),
    }
}

fn clamp_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn clamp_i16(value: i64) -> i16 {
    i16::try_from(value.clamp(i64::from(i16::MIN), i64::from(i16::MAX))).unwrap_or_default()
}

fn read_control(device: &Device, id: u32) -> Result<i64> {
    match device.control(id).map_err(transport_error("get_control"))?.value {
        Value::Integer(value) => Ok(value),
        Value::Boolean(value) => Ok(i64::from(value)),
        _ => Err(DriverError::Unsupported("control value type")),
    }
}

/// The capture node of a USB device, resolved through sysfs.
///
/// A USB camera can own several nodes (metadata nodes with `uvcvideo`); the
/// one with `index` 0 and the lowest number wins.
pub fn find_video_node(sysfs_root: &Path, bus_number: i32, device_number: i32) -> Result<PathBuf> {
    let class_dir = sysfs_root.join("class").join("video4linux");
    let mut best: Option<u32> = None;

    for entry in fs::read_dir(&class_dir)?.flatten() {
        let name = entry.file_name();
        let Some(number) = name
            .to_str()
            .and_then(|n| n.strip_prefix("video"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };

        let node_dir = entry.path();
        let index = fs::read_to_string(node_dir.join("index")).unwrap_or_default();
        if !matches!(index.trim(), "" | "0") {
            continue;
        }

        // device -> the USB interface; its parent is the USB device
        let Ok(interface) = fs::canonicalize(node_dir.join("device")) else {
            continue;
        };
        let Some(usb_device) = interface.parent() else {
            continue;
        };
        let read = |attr: &str| {
            fs::read_to_string(usb_device.join(attr))
                .ok()
                .and_then(|value| value.trim().parse::<i32>().ok())
        };

        if read("busnum") == Some(bus_number)
            && read("devnum") == Some(device_number)
            && best.is_none_or(|b| number < b)
        {
            best = Some(number);
        }
    }

    best.map(|number| PathBuf::from(format!("/dev/video{number}")))
        .ok_or(DriverError::Transport {
            op: "find_device",
            code: -libc::ENODEV,
        })
}

/// Transport opening `/dev/videoN` nodes.
pub struct V4l2Transport {
    sysfs_root: PathBuf,
}

impl Default for V4l2Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Transport {
    /// Transport resolving devices through `/sys`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sysfs_root(PathBuf::from("/sys"))
    }

    /// Transport resolving devices through another sysfs mount.
    #[must_use]
    pub const fn with_sysfs_root(sysfs_root: PathBuf) -> Self {
        Self { sysfs_root }
    }
}

/// Context of the V4L2 transport; only remembers the usbfs root.
#[derive(Debug)]
pub struct V4l2Context {
    usbfs: String,
}

/// A resolved but unopened video node.
#[derive(Debug, Clone)]
pub struct V4l2DeviceRef {
    path: PathBuf,
}

impl Transport for V4l2Transport {
    type Context = V4l2Context;
    type Device = V4l2DeviceRef;
    type Handle = V4l2Handle;

    fn init(&mut self, usbfs: &str) -> Result<V4l2Context> {
        debug!(usbfs, "v4l2 transport context");
        Ok(V4l2Context {
            usbfs: usbfs.to_owned(),
        })
    }

    fn find_device(&mut self, context: &V4l2Context, id: &UsbDeviceId) -> Result<V4l2DeviceRef> {
        let path = find_video_node(&self.sysfs_root, id.bus_number, id.device_number)?;
        debug!(
            usbfs = %context.usbfs,
            path = %path.display(),
            "resolved video node"
        );
        Ok(V4l2DeviceRef { path })
    }

    fn open(&mut self, device: &V4l2DeviceRef) -> Result<V4l2Handle> {
        V4l2Handle::open(&device.path)
    }
}

/// Negotiated V4L2 stream parameters.
#[derive(Debug, Clone, Copy)]
pub struct V4l2StreamControl {
    format: FrameFormat,
    width: u32,
    height: u32,
    stride: u32,
}

struct CaptureThread {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// An opened video node.
pub struct V4l2Handle {
    device: Arc<Device>,
    path: PathBuf,
    controls: Vec<Description>,
    capture: Option<CaptureThread>,
}

impl V4l2Handle {
    /// Open a video node directly.
    pub fn open(path: &Path) -> Result<Self> {
        let device = Device::with_path(path).map_err(transport_error("open"))?;

        let caps = device.query_caps().map_err(transport_error("query_caps"))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(DriverError::Unsupported("video capture"));
        }

        let controls = device.query_controls().unwrap_or_else(|err| {
            warn!(path = %path.display(), %err, "failed to query controls");
            Vec::new()
        });

        Ok(Self {
            device: Arc::new(device),
            path: path.to_owned(),
            controls,
            capture: None,
        })
    }

    /// Path of the node.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn description(&self, id: u32) -> Result<&Description> {
        self.controls
            .iter()
            .find(|desc| desc.id == id)
            .ok_or(DriverError::Unsupported("control not present"))
    }

    fn has_control(&self, id: u32) -> bool {
        self.controls.iter().any(|desc| desc.id == id)
    }

    fn read(&self, id: u32) -> Result<i64> {
        read_control(&self.device, id)
    }

    fn write(&self, id: u32, value: i64) -> Result<()> {
        let desc = self.description(id)?;
        let value = match desc.typ {
            v4l::control::Type::Boolean => Value::Boolean(value != 0),
            _ => Value::Integer(value),
        };
        self.device
            .set_control(Control { id, value })
            .map_err(transport_error("set_control"))
    }

    /// Answer a range request from the control description.
    fn range(&self, id: u32, request: ControlRequest) -> Result<i64> {
        let desc = self.description(id)?;
        Ok(match request {
            ControlRequest::Cur => return self.read(id),
            ControlRequest::Min => desc.minimum,
            ControlRequest::Max => desc.maximum,
            ControlRequest::Def => desc.default,
            ControlRequest::Res => i64::try_from(desc.step).unwrap_or(i64::MAX),
        })
    }

    /// Menu indices a menu control accepts.
    fn menu_indices(&self, id: u32) -> Result<Vec<i64>> {
        let desc = self.description(id)?;
        Ok(desc.items.as_ref().map_or_else(
            || (desc.minimum..=desc.maximum).collect(),
            |items| items.iter().map(|(index, _)| i64::from(*index)).collect(),
        ))
    }

    fn control_bits<C: Copy>(&self, table: &[(u32, C)], bit: fn(C) -> u32) -> u64 {
        table
            .iter()
            .filter(|(id, _)| self.has_control(*id))
            .fold(0, |bits, (_, control)| bits | (1 << bit(*control)))
    }
}

impl DeviceHandle for V4l2Handle {
    type StreamControl = V4l2StreamControl;

    fn format_descriptors(&self) -> Vec<FormatDescriptor> {
        let formats = match self.device.enum_formats() {
            Ok(formats) => formats,
            Err(err) => {
                warn!(%err, "failed to enumerate formats");
                return Vec::new();
            }
        };

        formats
            .into_iter()
            .map(|desc| {
                let compressed = desc.flags.contains(v4l::format::description::Flags::COMPRESSED);
                let fourcc = FourCC::from(desc.fourcc);
                let (subtype, frame_subtype, fourcc) = if fourcc == FourCC::MJPG {
                    (DescriptorSubtype::FormatMjpeg, DescriptorSubtype::FrameMjpeg, fourcc)
                } else if compressed {
                    (DescriptorSubtype::FormatFrameBased, DescriptorSubtype::FrameFrameBased, fourcc)
                } else {
                    // UVC names packed 4:2:2 by its GUID, YUY2
                    let fourcc = if fourcc == FourCC::YUYV { FourCC::YUY2 } else { fourcc };
                    (DescriptorSubtype::FormatUncompressed, DescriptorSubtype::FrameUncompressed, fourcc)
                };

                FormatDescriptor {
                    subtype,
                    fourcc,
                    frames: self.frame_descriptors(desc.fourcc, frame_subtype),
                }
            })
            .collect()
    }

    fn terminal_controls(&self) -> u64 {
        self.control_bits(&TERMINAL_CONTROLS, TerminalControl::bit)
    }

    fn processing_unit_controls(&self) -> u64 {
        self.control_bits(&PROCESSING_UNIT_CONTROLS, ProcessingUnitControl::bit)
    }

    fn ae_mode(&self, request: ControlRequest) -> Result<u8> {
        let value = match request {
            ControlRequest::Res => {
                return Ok(self
                    .menu_indices(cid::EXPOSURE_AUTO)?
                    .into_iter()
                    .filter_map(ae_mode_for_menu)
                    .fold(0, |bits, mode| bits | mode.value()));
            }
            ControlRequest::Min | ControlRequest::Max => {
                return Err(DriverError::Unsupported("AE mode range"));
            }
            ControlRequest::Cur | ControlRequest::Def => self.range(cid::EXPOSURE_AUTO, request)?,
        };
        Ok(ae_mode_for_menu(value).map_or(0, AeMode::value))
    }

    fn set_ae_mode(&mut self, mode: u8) -> Result<()> {
        let menu = EXPOSURE_MENU
            .iter()
            .find(|(_, ae)| ae.value() == mode)
            .map(|(menu, _)| *menu)
            .ok_or_else(|| DriverError::InvalidArgument(format!("AE mode {mode}")))?;
        self.write(cid::EXPOSURE_AUTO, menu)
    }

    fn exposure_abs(&self, request: ControlRequest) -> Result<u32> {
        self.range(cid::EXPOSURE_ABSOLUTE, request).map(clamp_u32)
    }

    fn set_exposure_abs(&mut self, value: u32) -> Result<()> {
        self.write(cid::EXPOSURE_ABSOLUTE, i64::from(value))
    }

    fn exposure_probe(&self) -> ExposureProbe {
        let device = Arc::clone(&self.device);
        Box::new(move || read_control(&device, cid::EXPOSURE_ABSOLUTE).map(clamp_u32))
    }

    fn focus_auto(&self, request: ControlRequest) -> Result<u8> {
        self.range(cid::FOCUS_AUTO, request)
            .map(|value| u8::from(value != 0))
    }

    fn set_focus_auto(&mut self, state: u8) -> Result<()> {
        self.write(cid::FOCUS_AUTO, i64::from(state))
    }

    fn focus_abs(&self, request: ControlRequest) -> Result<i16> {
        self.range(cid::FOCUS_ABSOLUTE, request).map(clamp_i16)
    }

    fn set_focus_abs(&mut self, value: i16) -> Result<()> {
        self.write(cid::FOCUS_ABSOLUTE, i64::from(value))
    }

    fn focus_simple_range(&self, request: ControlRequest) -> Result<u8> {
        let menu = self.range(cid::AUTO_FOCUS_RANGE, request)?;
        FOCUS_RANGE_MENU
            .iter()
            .find(|(index, _)| *index == menu)
            .map(|(_, range)| *range as u8)
            .ok_or(DriverError::Unsupported("focus range"))
    }

    fn set_focus_simple_range(&mut self, range: u8) -> Result<()> {
        let menu = FOCUS_RANGE_MENU
            .iter()
            .find(|(_, r)| *r as u8 == range)
            .map(|(index, _)| *index)
            .ok_or_else(|| DriverError::InvalidArgument(format!("focus range {range}")))?;
        self.write(cid::AUTO_FOCUS_RANGE, menu)
    }

    fn negotiate(
        &mut self,
        format: FrameFormat,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<V4l2StreamControl> {
        let fourcc = match format {
            FrameFormat::Yuyv => v4l::FourCC::new(b"YUYV"),
            FrameFormat::Mjpeg => v4l::FourCC::new(b"MJPG"),
            FrameFormat::Unknown => return Err(DriverError::Unsupported("frame format")),
        };

        let mut fmt = self.device.format().map_err(transport_error("get_format"))?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = fourcc;

        let actual = self
            .device
            .set_format(&fmt)
            .map_err(transport_error("set_format"))?;
        if actual.width != width || actual.height != height || actual.fourcc != fourcc {
            return Err(DriverError::Negotiation(format!(
                "requested {width}x{height} {fourcc}, device chose {}x{} {}",
                actual.width, actual.height, actual.fourcc
            )));
        }

        let params = self
            .device
            .set_params(&Parameters::with_fps(fps))
            .map_err(transport_error("set_params"))?;
        debug!(
            width,
            height,
            interval = ?params.interval,
            "negotiated stream"
        );

        Ok(V4l2StreamControl {
            format,
            width: actual.width,
            height: actual.height,
            stride: actual.stride,
        })
    }

    fn start_streaming(
        &mut self,
        control: &V4l2StreamControl,
        on_frame: FrameCallback,
    ) -> Result<()> {
        if self.capture.is_some() {
            return Err(DriverError::Transport {
                op: "start_streaming",
                code: -libc::EBUSY,
            });
        }

        let device = Arc::clone(&self.device);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let control = *control;
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let worker = thread::Builder::new()
            .name("uvc-capture".to_owned())
            .spawn(move || capture_loop(&device, &flag, on_frame, control, &ready_tx))?;

        // The stream borrows the device, so it is set up on the capture thread.
        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(DriverError::Transport {
                op: "stream",
                code: -libc::EPIPE,
            })
        });
        if let Err(err) = ready {
            if worker.join().is_err() {
                error!("capture thread panicked");
            }
            return Err(err);
        }

        self.capture = Some(CaptureThread { stop, worker });
        Ok(())
    }

    fn stop_streaming(&mut self) {
        let Some(capture) = self.capture.take() else {
            return;
        };
        capture.stop.store(true, Ordering::Release);
        if capture.worker.join().is_err() {
            error!("capture thread panicked");
        }
    }

    fn log_diagnostics(&self) {
        match self.device.query_caps() {
            Ok(caps) => info!(
                path = %self.path.display(),
                driver = %caps.driver,
                card = %caps.card,
                bus = %caps.bus,
                "v4l2 device"
            ),
            Err(err) => warn!(%err, "failed to query capabilities"),
        }
        for desc in &self.controls {
            debug!(
                id = format_args!("{:#010x}", desc.id),
                name = %desc.name,
                min = desc.minimum,
                max = desc.maximum,
                default = desc.default,
                "v4l2 control"
            );
        }
    }
}

impl V4l2Handle {
    fn frame_descriptors(&self, fourcc: v4l::FourCC, subtype: DescriptorSubtype) -> Vec<FrameDescriptor> {
        let sizes = self.device.enum_framesizes(fourcc).unwrap_or_else(|err| {
            warn!(%fourcc, %err, "failed to enumerate frame sizes");
            Vec::new()
        });

        sizes
            .into_iter()
            .filter_map(|size| match size.size {
                v4l::framesize::FrameSizeEnum::Discrete(discrete) => Some(discrete),
                v4l::framesize::FrameSizeEnum::Stepwise(_) => None,
            })
            .map(|size| FrameDescriptor {
                subtype,
                width: u16::try_from(size.width).unwrap_or(u16::MAX),
                height: u16::try_from(size.height).unwrap_or(u16::MAX),
                intervals: self.frame_intervals(fourcc, size.width, size.height),
            })
            .collect()
    }

    /// Discrete frame intervals in 100 ns units.
    fn frame_intervals(&self, fourcc: v4l::FourCC, width: u32, height: u32) -> Vec<u32> {
        let intervals = self
            .device
            .enum_frameintervals(fourcc, width, height)
            .unwrap_or_default();

        intervals
            .into_iter()
            .filter_map(|interval| match interval.interval {
                v4l::frameinterval::FrameIntervalEnum::Discrete(fraction) => Some(fraction),
                v4l::frameinterval::FrameIntervalEnum::Stepwise(_) => None,
            })
            .filter(|fraction| fraction.denominator != 0)
            .map(|fraction| {
                let ticks = u64::from(fraction.numerator) * 10_000_000 / u64::from(fraction.denominator);
                u32::try_from(ticks).unwrap_or(u32::MAX)
            })
            .collect()
    }
}

impl Drop for V4l2Handle {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

fn capture_loop(
    device: &Device,
    stop: &AtomicBool,
    mut on_frame: FrameCallback,
    control: V4l2StreamControl,
    ready: &SyncSender<Result<()>>,
) {
    let mut stream = match Stream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(transport_error("stream")(err)));
            return;
        }
    };
    stream.set_timeout(Duration::from_millis(DEQUEUE_TIMEOUT_MS));
    let _ = ready.send(Ok(()));

    debug!("capture thread started");
    while !stop.load(Ordering::Acquire) {
        match stream.next() {
            Ok((buf, meta)) => {
                let used = usize::try_from(meta.bytesused).map_or(buf.len(), |n| n.min(buf.len()));
                on_frame(&RawFrame {
                    data: buf.get(..used).unwrap_or(buf),
                    width: control.width,
                    height: control.height,
                    format: control.format,
                    step: control.stride,
                    sequence: meta.sequence,
                });
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => {
                error!(%err, "capture failed, ending stream");
                break;
            }
        }
    }
    debug!("capture thread exiting");
}
