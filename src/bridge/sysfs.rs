//! Bridge for Linux desktops: USB devices come from sysfs and are claimed by
//! opening their usbfs node.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::calibration::{Calibration, CalibrationTable};
use crate::config::DriverConfig;
use crate::traits::{Bridge, DriverError, Result};

/// USB interface class of video devices.
const VIDEO_INTERFACE_CLASS: u8 = 0x0e;

/// A USB device with a video interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbNode {
    /// Vendor id.
    pub vendor_id: u16,
    /// Product id.
    pub product_id: u16,
    /// Bus number.
    pub bus_number: u16,
    /// Device number on the bus.
    pub device_number: u16,
}

impl UsbNode {
    fn usbfs_path(&self, root: &Path) -> PathBuf {
        root.join(format!("{:03}", self.bus_number))
            .join(format!("{:03}", self.device_number))
    }
}

struct Claim {
    node: UsbNode,
    file: File,
}

/// Desktop bridge over `/sys/bus/usb/devices` and usbfs.
pub struct SysfsBridge {
    sysfs_root: PathBuf,
    usbfs_root: PathBuf,
    calibrations: CalibrationTable,
    devices: Option<Vec<UsbNode>>,
    claim: Option<Claim>,
}

impl SysfsBridge {
    /// Bridge over the system's sysfs and the configured usbfs root.
    #[must_use]
    pub fn new(config: &DriverConfig) -> Self {
        Self::with_roots(
            PathBuf::from("/sys/bus/usb/devices"),
            config.usbfs_root.clone(),
            CalibrationTable::with_overrides(config.calibration_file.as_deref()),
        )
    }

    /// Bridge over explicit roots.
    #[must_use]
    pub const fn with_roots(
        sysfs_root: PathBuf,
        usbfs_root: PathBuf,
        calibrations: CalibrationTable,
    ) -> Self {
        Self {
            sysfs_root,
            usbfs_root,
            calibrations,
            devices: None,
            claim: None,
        }
    }

    /// Devices found at attach.
    pub fn devices(&self) -> &[UsbNode] {
        self.devices.as_deref().unwrap_or_default()
    }

    fn claimed(&self) -> Result<&Claim> {
        self.claim
            .as_ref()
            .ok_or_else(|| DriverError::Bridge("no device claimed".to_owned()))
    }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|value| value.trim().to_owned())
}

fn read_hex(dir: &Path, name: &str) -> Option<u16> {
    u16::from_str_radix(&read_attr(dir, name)?, 16).ok()
}

fn read_dec(dir: &Path, name: &str) -> Option<u16> {
    read_attr(dir, name)?.parse().ok()
}

fn read_node(dir: &Path) -> Option<UsbNode> {
    Some(UsbNode {
        vendor_id: read_hex(dir, "idVendor")?,
        product_id: read_hex(dir, "idProduct")?,
        bus_number: read_dec(dir, "busnum")?,
        device_number: read_dec(dir, "devnum")?,
    })
}

/// Whether any interface directory of the device at `dir` is a video interface.
fn has_video_interface(dir: &Path) -> bool {
    let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let prefix = format!("{name}:");

    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry.file_name().to_string_lossy().starts_with(&prefix)
            && read_attr(&entry.path(), "bInterfaceClass")
                .and_then(|class| u8::from_str_radix(&class, 16).ok())
                == Some(VIDEO_INTERFACE_CLASS)
    })
}

/// USB devices under `root` that expose a video interface, by bus and device number.
pub fn scan(root: &Path) -> Result<Vec<UsbNode>> {
    let mut nodes = Vec::new();

    for entry in fs::read_dir(root)?.flatten() {
        let dir = entry.path();
        match read_node(&dir) {
            Some(node) if has_video_interface(&dir) => {
                debug!(?node, path = %dir.display(), "found usb video device");
                nodes.push(node);
            }
            _ => {}
        }
    }

    nodes.sort_by_key(|node| (node.bus_number, node.device_number));
    Ok(nodes)
}

impl Bridge for SysfsBridge {
    fn attach(&mut self) -> Result<()> {
        if self.devices.is_none() {
            self.devices = Some(scan(&self.sysfs_root)?);
        }
        Ok(())
    }

    fn num_devices(&self) -> Result<i32> {
        Ok(i32::try_from(self.devices().len()).unwrap_or(i32::MAX))
    }

    fn use_device(&mut self, index: i32) -> Result<bool> {
        self.claim = None;

        let node = usize::try_from(index)
            .ok()
            .and_then(|i| self.devices().get(i))
            .cloned()
            .ok_or_else(|| DriverError::InvalidArgument(format!("device index {index}")))?;

        let path = node.usbfs_path(&self.usbfs_root);
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => {
                debug!(path = %path.display(), "claimed usb device");
                self.claim = Some(Claim { node, file });
                Ok(true)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot open usb device node");
                Ok(false)
            }
        }
    }

    fn release_device(&mut self) -> Result<()> {
        self.claim = None;
        Ok(())
    }

    fn vendor_id(&self) -> Result<i32> {
        Ok(i32::from(self.claimed()?.node.vendor_id))
    }

    fn product_id(&self) -> Result<i32> {
        Ok(i32::from(self.claimed()?.node.product_id))
    }

    fn file_descriptor(&self) -> Result<i32> {
        Ok(self.claimed()?.file.as_raw_fd())
    }

    fn usbfs(&self) -> Result<Option<String>> {
        Ok(self
            .claim
            .as_ref()
            .map(|_| self.usbfs_root.to_string_lossy().into_owned()))
    }

    fn bus_number(&self) -> Result<i32> {
        Ok(i32::from(self.claimed()?.node.bus_number))
    }

    fn device_number(&self) -> Result<i32> {
        Ok(i32::from(self.claimed()?.node.device_number))
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
            .map(Calibration::to_values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    fn add_device(sysfs: &Path, name: &str, ids: (&str, &str), bus: u16, dev: u16, class: &str) {
        let dir = sysfs.join(name);
        write(&dir.join("idVendor"), &format!("{}\n", ids.0));
        write(&dir.join("idProduct"), &format!("{}\n", ids.1));
        write(&dir.join("busnum"), &format!("{bus}\n"));
        write(&dir.join("devnum"), &format!("{dev}\n"));
        write(&dir.join(format!("{name}:1.0")).join("bInterfaceClass"), &format!("{class}\n"));
    }

    fn fixture() -> (TempDir, SysfsBridge) {
        let root = TempDir::new().expect("tempdir");
        let sysfs = root.path().join("sys");
        let usbfs = root.path().join("usb");

        add_device(&sysfs, "1-2", ("046d", "081b"), 1, 4, "0e");
        add_device(&sysfs, "1-1", ("8087", "0024"), 1, 2, "09");
        add_device(&sysfs, "2-1", ("045e", "0779"), 2, 3, "0e");
        write(&usbfs.join("001").join("004"), "");

        let bridge = SysfsBridge::with_roots(sysfs, usbfs, CalibrationTable::builtin());
        (root, bridge)
    }

    #[test]
    fn test_scan_keeps_video_devices_in_bus_order() {
        let (_root, mut bridge) = fixture();
        bridge.attach().expect("attach");

        assert_eq!(bridge.num_devices().expect("count"), 2);
        assert_eq!(bridge.devices()[0].vendor_id, 0x046d);
        assert_eq!(bridge.devices()[1].bus_number, 2);
    }

    #[test]
    fn test_claim_reports_identity() {
        let (_root, mut bridge) = fixture();
        bridge.attach().expect("attach");

        assert!(bridge.use_device(0).expect("claim"));
        let id = bridge.device_identity().expect("identity");
        assert_eq!((id.vendor_id, id.product_id), (0x046d, 0x081b));
        assert_eq!((id.bus_number, id.device_number), (1, 4));
        assert!(id.file_descriptor >= 0);
        assert!(bridge.usbfs().expect("usbfs").is_some());
    }

    #[test]
    fn test_missing_node_is_not_claimed() {
        let (_root, mut bridge) = fixture();
        bridge.attach().expect("attach");

        assert!(!bridge.use_device(1).expect("claim attempt"));
        assert!(bridge.usbfs().expect("usbfs").is_none());
        assert!(bridge.vendor_id().is_err());
        assert!(bridge.use_device(7).is_err());
    }

    #[test]
    fn test_release_drops_claim() {
        let (_root, mut bridge) = fixture();
        bridge.attach().expect("attach");
        bridge.use_device(0).expect("claim");

        bridge.release_device().expect("release");
        assert!(bridge.file_descriptor().is_err());
    }

    #[test]
    fn test_calibration_from_table() {
        let (_root, bridge) = fixture();
        let values = bridge
            .calibration_value(0x046d, 0x081b, 640, 480)
            .expect("lookup")
            .expect("calibrated");
        assert_eq!(values.len(), 12);
        assert!(bridge
            .calibration_value(0x046d, 0x081b, 320, 240)
            .expect("lookup")
            .is_none());
    }
}
