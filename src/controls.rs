//! UVC control vocabulary and its translation to host modes.
//!
//! Control presence comes from the `bmControls` bitmaps of the camera input
//! terminal and the processing unit. The bit positions follow UVC 1.5
//! tables 3-6 and 3-8.

use tracing::debug;

use crate::traits::{ExposureMode, FocusMode};

/// Whether bit `bit` is set in `bits`.
#[must_use]
pub const fn has_bit(bits: u64, bit: u32) -> bool {
    bit < 64 && bits & (1 << bit) != 0
}

/// Camera terminal controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TerminalControl {
    ScanningMode,
    AeMode,
    AePriority,
    ExposureTimeAbsolute,
    ExposureTimeRelative,
    FocusAbsolute,
    FocusRelative,
    IrisAbsolute,
    IrisRelative,
    ZoomAbsolute,
    ZoomRelative,
    PanTiltAbsolute,
    PanTiltRelative,
    RollAbsolute,
    RollRelative,
    FocusAuto,
    Privacy,
    FocusSimple,
    DigitalWindow,
    RegionOfInterest,
}

impl TerminalControl {
    /// Every terminal control, in bit order.
    pub const ALL: [Self; 20] = [
        Self::ScanningMode,
        Self::AeMode,
        Self::AePriority,
        Self::ExposureTimeAbsolute,
        Self::ExposureTimeRelative,
        Self::FocusAbsolute,
        Self::FocusRelative,
        Self::IrisAbsolute,
        Self::IrisRelative,
        Self::ZoomAbsolute,
        Self::ZoomRelative,
        Self::PanTiltAbsolute,
        Self::PanTiltRelative,
        Self::RollAbsolute,
        Self::RollRelative,
        Self::FocusAuto,
        Self::Privacy,
        Self::FocusSimple,
        Self::DigitalWindow,
        Self::RegionOfInterest,
    ];

    /// Bit position in the terminal's `bmControls`.
    #[must_use]
    pub const fn bit(self) -> u32 {
        match self {
            Self::ScanningMode => 0,
            Self::AeMode => 1,
            Self::AePriority => 2,
            Self::ExposureTimeAbsolute => 3,
            Self::ExposureTimeRelative => 4,
            Self::FocusAbsolute => 5,
            Self::FocusRelative => 6,
            Self::IrisAbsolute => 7,
            Self::IrisRelative => 8,
            Self::ZoomAbsolute => 9,
            Self::ZoomRelative => 10,
            Self::PanTiltAbsolute => 11,
            Self::PanTiltRelative => 12,
            Self::RollAbsolute => 13,
            Self::RollRelative => 14,
            Self::FocusAuto => 17,
            Self::Privacy => 18,
            Self::FocusSimple => 19,
            Self::DigitalWindow => 20,
            Self::RegionOfInterest => 21,
        }
    }

    /// Whether this control is present in `bits`.
    #[must_use]
    pub const fn is_present(self, bits: u64) -> bool {
        has_bit(bits, self.bit())
    }
}

/// Processing unit controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ProcessingUnitControl {
    Brightness,
    Contrast,
    Hue,
    Saturation,
    Sharpness,
    Gamma,
    WhiteBalanceTemperature,
    WhiteBalanceComponent,
    BacklightCompensation,
    Gain,
    PowerLineFrequency,
    HueAuto,
    WhiteBalanceTemperatureAuto,
    WhiteBalanceComponentAuto,
    DigitalMultiplier,
    DigitalMultiplierLimit,
    AnalogVideoStandard,
    AnalogLockStatus,
    ContrastAuto,
}

impl ProcessingUnitControl {
    /// Every processing unit control, in bit order.
    pub const ALL: [Self; 19] = [
        Self::Brightness,
        Self::Contrast,
        Self::Hue,
        Self::Saturation,
        Self::Sharpness,
        Self::Gamma,
        Self::WhiteBalanceTemperature,
        Self::WhiteBalanceComponent,
        Self::BacklightCompensation,
        Self::Gain,
        Self::PowerLineFrequency,
        Self::HueAuto,
        Self::WhiteBalanceTemperatureAuto,
        Self::WhiteBalanceComponentAuto,
        Self::DigitalMultiplier,
        Self::DigitalMultiplierLimit,
        Self::AnalogVideoStandard,
        Self::AnalogLockStatus,
        Self::ContrastAuto,
    ];

    /// Bit position in the processing unit's `bmControls`.
    #[must_use]
    pub const fn bit(self) -> u32 {
        self as u32
    }

    /// Whether this control is present in `bits`.
    #[must_use]
    pub const fn is_present(self, bits: u64) -> bool {
        has_bit(bits, self.bit())
    }
}

/// The terminal controls the session acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct TerminalCapabilities {
    /// Auto-exposure mode control.
    pub ae_mode: bool,
    /// Absolute exposure time control.
    pub exposure_time_absolute: bool,
    /// Absolute focus control.
    pub focus_absolute: bool,
    /// Auto-focus control.
    pub focus_auto: bool,
    /// Simple focus range control.
    pub focus_simple: bool,
}

impl TerminalCapabilities {
    /// Read the named capabilities out of a terminal `bmControls`.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            ae_mode: TerminalControl::AeMode.is_present(bits),
            exposure_time_absolute: TerminalControl::ExposureTimeAbsolute.is_present(bits),
            focus_absolute: TerminalControl::FocusAbsolute.is_present(bits),
            focus_auto: TerminalControl::FocusAuto.is_present(bits),
            focus_simple: TerminalControl::FocusSimple.is_present(bits),
        }
    }
}

/// Device auto-exposure mode values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeMode {
    /// Manual exposure time and iris.
    Manual = 1,
    /// Auto exposure time and iris.
    Auto = 2,
    /// Manual exposure time, auto iris.
    ShutterPriority = 4,
    /// Auto exposure time, manual iris.
    AperturePriority = 8,
}

impl AeMode {
    /// Value written to and read from the AE-mode control.
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// Parse a current AE-mode value.
    #[must_use]
    pub const fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Manual),
            2 => Some(Self::Auto),
            4 => Some(Self::ShutterPriority),
            8 => Some(Self::AperturePriority),
            _ => None,
        }
    }

    /// The host exposure mode a device mode reports as.
    #[must_use]
    pub const fn exposure_mode(self) -> ExposureMode {
        match self {
            Self::Manual => ExposureMode::Manual,
            Self::Auto | Self::AperturePriority => ExposureMode::ContinuousAuto,
            Self::ShutterPriority => ExposureMode::ShutterPriority,
        }
    }

    /// Device modes to try, in order, for a host exposure mode.
    #[must_use]
    pub const fn candidates(mode: ExposureMode) -> &'static [Self] {
        match mode {
            ExposureMode::ContinuousAuto => &[Self::Auto, Self::AperturePriority],
            ExposureMode::Manual => &[Self::Manual],
            ExposureMode::ShutterPriority => &[Self::ShutterPriority],
            ExposureMode::Auto | ExposureMode::Unknown => &[],
        }
    }
}

/// The AE modes a device supports, from the AE-mode resolution bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct AeModes {
    /// `AeMode::Manual` supported.
    pub manual: bool,
    /// `AeMode::Auto` supported.
    pub auto: bool,
    /// `AeMode::ShutterPriority` supported.
    pub shutter_priority: bool,
    /// `AeMode::AperturePriority` supported.
    pub aperture_priority: bool,
}

impl AeModes {
    /// Decode a resolution bitmap.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self {
            manual: bits & AeMode::Manual.value() != 0,
            auto: bits & AeMode::Auto.value() != 0,
            shutter_priority: bits & AeMode::ShutterPriority.value() != 0,
            aperture_priority: bits & AeMode::AperturePriority.value() != 0,
        }
    }

    /// Whether a host exposure mode is backed by a supported device mode.
    ///
    /// Single-shot `Auto` has no UVC counterpart and is never supported.
    #[must_use]
    pub const fn supports(self, mode: ExposureMode) -> bool {
        match mode {
            ExposureMode::ContinuousAuto => self.auto || self.aperture_priority,
            ExposureMode::Manual => self.manual,
            ExposureMode::ShutterPriority => self.shutter_priority,
            ExposureMode::Auto | ExposureMode::Unknown => false,
        }
    }
}

/// Auto-focus control values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoFocus {
    /// Auto focus off.
    Fixed = 0,
    /// Auto focus on.
    Auto = 1,
}

/// Simple focus range control values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleFocusRange {
    /// Full range.
    FullRange = 0,
    /// Macro, up to about 0.3 m.
    Macro = 1,
    /// People, about 0.3 m to 3 m.
    People = 2,
    /// Scene, 3 m to infinity.
    Scene = 3,
}

impl SimpleFocusRange {
    /// The range backing a host focus mode, if any.
    #[must_use]
    pub const fn for_focus_mode(mode: FocusMode) -> Option<Self> {
        match mode {
            FocusMode::Macro => Some(Self::Macro),
            FocusMode::InfinityFocus => Some(Self::Scene),
            _ => None,
        }
    }

    /// The host focus mode a range reports as.
    #[must_use]
    pub const fn focus_mode(value: u8) -> Option<FocusMode> {
        match value {
            1 => Some(FocusMode::Macro),
            3 => Some(FocusMode::InfinityFocus),
            _ => None,
        }
    }
}

/// Whether the simple focus range control is built into this driver.
pub const SIMPLE_FOCUS: bool = cfg!(feature = "simple-focus");

/// Nanoseconds per device exposure unit (100 µs).
pub const EXPOSURE_UNIT_NS: u64 = 100_000;

/// Convert device exposure units to nanoseconds.
#[must_use]
pub const fn exposure_to_ns(value: u32) -> u64 {
    value as u64 * EXPOSURE_UNIT_NS
}

/// Convert nanoseconds to device exposure units, truncating.
#[must_use]
pub fn exposure_from_ns(ns: u64) -> u32 {
    u32::try_from(ns / EXPOSURE_UNIT_NS).unwrap_or(u32::MAX)
}

/// Convert a host focus value to the device's signed 16-bit range.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn focus_to_device(value: f32) -> i16 {
    // float-to-int `as` saturates and maps NaN to 0
    value.round() as i16
}

/// Log the presence of every terminal and processing unit control.
pub fn log_control_support(terminal: u64, processing: u64) {
    for control in TerminalControl::ALL {
        debug!(
            control = ?control,
            supported = control.is_present(terminal),
            "camera terminal control"
        );
    }
    for control in ProcessingUnitControl::ALL {
        debug!(
            control = ?control,
            supported = control.is_present(processing),
            "processing unit control"
        );
    }
}
