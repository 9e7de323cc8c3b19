//! Camera calibration table.
//!
//! Ships with calibrations for a few common cameras and can be extended from
//! a JSON file:
//!
//! ```json
//! {
//!   "devices": [
//!     {
//!       "vendor_id": 1133,
//!       "product_id": 2075,
//!       "calibrations": [
//!         {
//!           "width": 640,
//!           "height": 480,
//!           "principal_point": [316.0, 230.895],
//!           "focal_length": [817.172, 816.951],
//!           "distortion": [-0.0456154, 0.368814, 0.0, 0.0, -0.899576, 0.0, 0.0, 0.0]
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::traits::{DriverError, Result, CALIBRATION_LEN};

/// Calibration of one camera model at one frame size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Principal point `[x, y]`.
    pub principal_point: [f32; 2],
    /// Focal length `[x, y]`.
    pub focal_length: [f32; 2],
    /// Distortion coefficients.
    #[serde(default)]
    pub distortion: [f32; 8],
}

impl Calibration {
    /// The record as handed over by a bridge: `[ppx, ppy, fx, fy, d0..d7]`.
    #[must_use]
    pub fn to_values(&self) -> Vec<f32> {
        let mut values = Vec::with_capacity(CALIBRATION_LEN);
        values.extend_from_slice(&self.principal_point);
        values.extend_from_slice(&self.focal_length);
        values.extend_from_slice(&self.distortion);
        values
    }
}

/// Calibrations of one camera model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCalibrations {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Calibrations per frame size.
    pub calibrations: Vec<Calibration>,
}

#[derive(Debug, Deserialize)]
struct CalibrationFile {
    devices: Vec<DeviceCalibrations>,
}

/// Calibrations keyed by vendor and product id.
#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    devices: HashMap<(u16, u16), Vec<Calibration>>,
}

impl CalibrationTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in calibrations.
    #[must_use]
    pub fn builtin() -> Self {
        let lifecam = Calibration {
            width: 640,
            height: 480,
            principal_point: [318.135, 228.374],
            focal_length: [678.154, 678.17],
            distortion: [0.154_576, -1.191_43, 0.0, 0.0, 2.061_05, 0.0, 0.0, 0.0],
        };
        let c310 = Calibration {
            width: 640,
            height: 480,
            principal_point: [316.0, 230.895],
            focal_length: [817.172, 816.951],
            distortion: [-0.045_615_4, 0.368_814, 0.0, 0.0, -0.899_576, 0.0, 0.0, 0.0],
        };

        let mut table = Self::new();
        // Microsoft LifeCam HD-3000, two product ids
        table.merge(DeviceCalibrations {
            vendor_id: 0x045e,
            product_id: 0x0779,
            calibrations: vec![lifecam.clone()],
        });
        table.merge(DeviceCalibrations {
            vendor_id: 0x045e,
            product_id: 0x0810,
            calibrations: vec![lifecam],
        });
        // Logitech C310
        table.merge(DeviceCalibrations {
            vendor_id: 0x046d,
            product_id: 0x081b,
            calibrations: vec![c310],
        });
        table
    }

    /// Add calibrations for a device.
    ///
    /// A calibration replaces an existing one of the same frame size and is
    /// appended otherwise. Entries with a zero vendor or product id are
    /// ignored.
    pub fn merge(&mut self, device: DeviceCalibrations) {
        if device.vendor_id == 0 || device.product_id == 0 {
            warn!(
                vendor_id = device.vendor_id,
                product_id = device.product_id,
                "ignoring calibration entry without device id"
            );
            return;
        }

        let entries = self
            .devices
            .entry((device.vendor_id, device.product_id))
            .or_default();
        for calibration in device.calibrations {
            match entries
                .iter_mut()
                .find(|c| c.width == calibration.width && c.height == calibration.height)
            {
                Some(existing) => *existing = calibration,
                None => entries.push(calibration),
            }
        }
    }

    /// Merge the calibrations from a JSON file; returns the number of devices read.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path)?;
        let file: CalibrationFile = serde_json::from_str(&text)
            .map_err(|err| DriverError::Config(format!("{}: {err}", path.display())))?;

        let count = file.devices.len();
        for device in file.devices {
            self.merge(device);
        }
        info!(path = %path.display(), devices = count, "loaded calibration overrides");
        Ok(count)
    }

    /// The built-in table extended by an optional override file.
    ///
    /// A file that cannot be read is logged and skipped.
    #[must_use]
    pub fn with_overrides(path: Option<&Path>) -> Self {
        let mut table = Self::builtin();
        if let Some(path) = path {
            if let Err(err) = table.load_file(path) {
                warn!(path = %path.display(), %err, "failed to load calibration overrides");
            }
        }
        table
    }

    /// Calibration for a device at a frame size.
    #[must_use]
    pub fn lookup(&self, vendor_id: i32, product_id: i32, width: u32, height: u32) -> Option<&Calibration> {
        let key = (u16::try_from(vendor_id).ok()?, u16::try_from(product_id).ok()?);
        let found = self
            .devices
            .get(&key)?
            .iter()
            .find(|c| c.width == width && c.height == height);
        if found.is_none() {
            debug!(vendor_id, product_id, width, height, "no calibration for frame size");
        }
        found
    }
}
