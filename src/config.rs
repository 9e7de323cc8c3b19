//! Driver configuration from the environment.

use std::env;
use std::path::PathBuf;

/// Environment variable naming the Java USB helper class.
pub const ENV_USB_CONTROLLER: &str = "UVC_DRIVER_USB_CONTROLLER";
/// Environment variable naming the Java calibration helper class.
pub const ENV_CALIBRATION_CONTROLLER: &str = "UVC_DRIVER_CALIBRATION_CONTROLLER";
/// Environment variable pointing at a calibration JSON file.
pub const ENV_CALIBRATION_FILE: &str = "UVC_DRIVER_CALIBRATION";
/// Environment variable holding the log filter.
pub const ENV_LOG: &str = "UVC_DRIVER_LOG";
/// Environment variable overriding the usbfs root.
pub const ENV_USBFS: &str = "UVC_DRIVER_USBFS";

/// Runtime configuration of the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// JNI name of the USB helper class.
    pub usb_controller_class: String,
    /// JNI name of the calibration helper class.
    pub calibration_controller_class: String,
    /// Calibration overrides.
    pub calibration_file: Option<PathBuf>,
    /// `tracing` filter directive.
    pub log_filter: String,
    /// Root of the USB device filesystem.
    pub usbfs_root: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            usb_controller_class: "com/vuforia/samples/uvcDriver/USBController".to_owned(),
            calibration_controller_class: "com/vuforia/samples/uvcDriver/CalibrationController"
                .to_owned(),
            calibration_file: None,
            log_filter: "info".to_owned(),
            usbfs_root: PathBuf::from("/dev/bus/usb"),
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by any variables set in the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by the values `lookup` returns. Empty values are ignored.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let defaults = Self::default();

        Self {
            usb_controller_class: get(ENV_USB_CONTROLLER).unwrap_or(defaults.usb_controller_class),
            calibration_controller_class: get(ENV_CALIBRATION_CONTROLLER)
                .unwrap_or(defaults.calibration_controller_class),
            calibration_file: get(ENV_CALIBRATION_FILE).map(PathBuf::from),
            log_filter: get(ENV_LOG).unwrap_or(defaults.log_filter),
            usbfs_root: get(ENV_USBFS).map_or(defaults.usbfs_root, PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_without_environment() {
        let config = DriverConfig::from_lookup(|_| None);
        assert_eq!(config, DriverConfig::default());
        assert_eq!(config.log_filter, "info");
        assert!(config.calibration_file.is_none());
    }

    #[test]
    fn test_overrides_and_empty_values() {
        let vars: HashMap<&str, &str> = [
            (ENV_LOG, "uvc_driver=debug"),
            (ENV_CALIBRATION_FILE, "/etc/uvc/calibration.json"),
            (ENV_USB_CONTROLLER, ""),
            (ENV_USBFS, "/tmp/usb"),
        ]
        .into_iter()
        .collect();

        let config = DriverConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_owned()));

        assert_eq!(config.log_filter, "uvc_driver=debug");
        assert_eq!(
            config.calibration_file,
            Some(PathBuf::from("/etc/uvc/calibration.json"))
        );
        assert_eq!(
            config.usb_controller_class,
            DriverConfig::default().usb_controller_class
        );
        assert_eq!(config.usbfs_root, PathBuf::from("/tmp/usb"));
    }
}
