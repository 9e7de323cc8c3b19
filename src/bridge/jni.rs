//! Bridge to the Java USB and calibration helpers of an Android app.
//!
//! The helpers are plain Java objects constructed with the hosting activity.
//! Every call attaches the calling thread for its duration (a no-op for
//! threads that are already attached) and runs inside a local reference
//! frame.
#![allow(unsafe_code)]

use jni::errors::Error as JniError;
use jni::objects::{GlobalRef, JFloatArray, JObject, JString, JValue};
use jni::{JNIEnv, JavaVM};
use tracing::{debug, error};

use crate::config::DriverConfig;
use crate::traits::{Bridge, DriverError, Result};

const HELPER_CTOR: &str = "(Landroid/app/Activity;)V";
const LOCAL_FRAME_CAPACITY: i32 = 16;

struct Helpers {
    usb: GlobalRef,
    calibration: GlobalRef,
}

/// Bridge over the app's `USBController` and `CalibrationController`.
pub struct JniBridge {
    vm: JavaVM,
    activity: GlobalRef,
    usb_class: String,
    calibration_class: String,
    helpers: Option<Helpers>,
}

fn bridge_error(what: &str, err: &JniError) -> DriverError {
    DriverError::Bridge(format!("{what}: {err}"))
}

/// A frame dimension as a Java `int`.
fn java_int(value: u32, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| DriverError::InvalidArgument(format!("{what} {value}")))
}

/// The VM and activity handed over by the host at plugin init.
pub struct JavaPlatform {
    vm: JavaVM,
    activity: GlobalRef,
}

impl JavaPlatform {
    /// Take global hold of the host's VM and activity.
    ///
    /// # Safety
    ///
    /// `vm` must be a valid `JavaVM` pointer and `activity` a valid reference
    /// to an `android.app.Activity`, both live for the duration of the call.
    pub unsafe fn from_raw(vm: *mut jni::sys::JavaVM, activity: jni::sys::jobject) -> Result<Self> {
        if vm.is_null() || activity.is_null() {
            return Err(DriverError::InvalidArgument("null VM or activity".to_owned()));
        }

        // SAFETY: non-null and valid per the caller's contract.
        let vm = unsafe { JavaVM::from_raw(vm) }.map_err(|err| bridge_error("JavaVM", &err))?;
        let activity = {
            let env = vm
                .attach_current_thread()
                .map_err(|err| bridge_error("attach", &err))?;
            // SAFETY: valid per the caller's contract; only borrowed to
            // create a global reference.
            let local = unsafe { JObject::from_raw(activity) };
            env.new_global_ref(&local)
                .map_err(|err| bridge_error("activity reference", &err))?
        };

        Ok(Self { vm, activity })
    }

    /// A bridge sharing this VM and activity.
    pub fn bridge(&self, config: &DriverConfig) -> Result<JniBridge> {
        // SAFETY: the pointer comes from a live JavaVM, which is never unloaded.
        let vm = unsafe { JavaVM::from_raw(self.vm.get_java_vm_pointer()) }
            .map_err(|err| bridge_error("JavaVM", &err))?;
        Ok(JniBridge {
            vm,
            activity: self.activity.clone(),
            usb_class: config.usb_controller_class.clone(),
            calibration_class: config.calibration_controller_class.clone(),
            helpers: None,
        })
    }
}

impl JniBridge {
    /// Run `f` on an attached thread inside a local frame.
    ///
    /// A Java exception raised by `f` is described and cleared.
    fn with_env<T, F>(&self, what: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut JNIEnv<'_>) -> std::result::Result<T, JniError>,
    {
        let mut env = self
            .vm
            .attach_current_thread()
            .map_err(|err| bridge_error("attach", &err))?;

        let result = env.with_local_frame(LOCAL_FRAME_CAPACITY, f);
        result.map_err(|err| {
            if env.exception_check().unwrap_or(false) {
                let _ = env.exception_describe();
                let _ = env.exception_clear();
            }
            error!(what, %err, "java call failed");
            bridge_error(what, &err)
        })
    }

    fn helpers(&self) -> Result<&Helpers> {
        self.helpers
            .as_ref()
            .ok_or_else(|| DriverError::Bridge("bridge not attached".to_owned()))
    }

    fn call_int(&self, method: &'static str) -> Result<i32> {
        let usb = &self.helpers()?.usb;
        self.with_env(method, |env| env.call_method(usb, method, "()I", &[])?.i())
    }

    fn construct(&self, class: &str) -> Result<GlobalRef> {
        let activity = &self.activity;
        self.with_env(class, |env| {
            let class = env.find_class(class)?;
            let helper = env.new_object(&class, HELPER_CTOR, &[JValue::Object(activity.as_obj())])?;
            env.new_global_ref(helper)
        })
    }
}

impl Bridge for JniBridge {
    fn attach(&mut self) -> Result<()> {
        if self.helpers.is_none() {
            let usb = self.construct(&self.usb_class)?;
            let calibration = self.construct(&self.calibration_class)?;
            debug!("java helpers created");
            self.helpers = Some(Helpers { usb, calibration });
        }
        Ok(())
    }

    fn num_devices(&self) -> Result<i32> {
        self.call_int("getNumDevices")
    }

    fn use_device(&mut self, index: i32) -> Result<bool> {
        let usb = &self.helpers()?.usb;
        self.with_env("useDevice", |env| {
            env.call_method(usb, "useDevice", "(I)Z", &[JValue::Int(index)])?.z()
        })
    }

    fn release_device(&mut self) -> Result<()> {
        let usb = &self.helpers()?.usb;
        self.with_env("closeConnection", |env| {
            env.call_method(usb, "closeConnection", "()V", &[])?.v()
        })
    }

    fn vendor_id(&self) -> Result<i32> {
        self.call_int("getVendorId")
    }

    fn product_id(&self) -> Result<i32> {
        self.call_int("getProductId")
    }

    fn file_descriptor(&self) -> Result<i32> {
        self.call_int("getFileDescriptor")
    }

    fn usbfs(&self) -> Result<Option<String>> {
        let usb = &self.helpers()?.usb;
        self.with_env("getUSBFS", |env| {
            let path = env
                .call_method(usb, "getUSBFS", "()Ljava/lang/String;", &[])?
                .l()?;
            if path.is_null() {
                return Ok(None);
            }
            let path = JString::from(path);
            let path: String = env.get_string(&path)?.into();
            Ok(Some(path))
        })
    }

    fn bus_number(&self) -> Result<i32> {
        self.call_int("getBusNumber")
    }

    fn device_number(&self) -> Result<i32> {
        self.call_int("getDeviceNumber")
    }

    fn calibration_value(
        &self,
        vendor_id: i32,
        product_id: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<f32>>> {
        let calibration = &self.helpers()?.calibration;
        let width = java_int(width, "width")?;
        let height = java_int(height, "height")?;

        self.with_env("getCalibrationValue", |env| {
            let values = env
                .call_method(
                    calibration,
                    "getCalibrationValue",
                    "(IIII)[F",
                    &[
                        JValue::Int(vendor_id),
                        JValue::Int(product_id),
                        JValue::Int(width),
                        JValue::Int(height),
                    ],
                )?
                .l()?;
            if values.is_null() {
                return Ok(None);
            }

            let values = JFloatArray::from(values);
            let len = usize::try_from(env.get_array_length(&values)?).unwrap_or(0);
            let mut buffer = vec![0.0; len];
            env.get_float_array_region(&values, 0, &mut buffer)?;
            Ok(Some(buffer))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_java_int_range() {
        assert_eq!(java_int(1280, "width").expect("in range"), 1280);
        assert_eq!(java_int(0x7fff_ffff, "width").expect("in range"), i32::MAX);
        assert!(matches!(
            java_int(u32::MAX, "height"),
            Err(DriverError::InvalidArgument(message)) if message == "height 4294967295"
        ));
    }
}
