//! Single-instance camera factory.

use std::ptr;

use tracing::{error, info, warn};

use crate::traits::Result;

/// Owns the platform data and at most one camera session.
///
/// Sessions are boxed so their address stays stable for as long as they
/// exist; that address is the identity the host hands back on destroy.
pub struct Driver<P, S> {
    platform: P,
    camera: Option<Box<S>>,
}

impl<P, S> Driver<P, S> {
    /// Create a driver with no session.
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            camera: None,
        }
    }

    /// Platform data captured at creation.
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    /// Whether a session exists.
    pub const fn has_camera(&self) -> bool {
        self.camera.is_some()
    }

    /// Create the session with `build` unless one already exists.
    pub fn create_external_camera<F>(&mut self, build: F) -> Option<&mut S>
    where
        F: FnOnce(&P) -> Result<S>,
    {
        if self.camera.is_some() {
            error!("external camera already exists, only one instance is supported");
            return None;
        }

        match build(&self.platform) {
            Ok(camera) => {
                info!("external camera created");
                let camera = self.camera.insert(Box::new(camera));
                Some(&mut **camera)
            }
            Err(err) => {
                error!(%err, "failed to create external camera");
                None
            }
        }
    }

    /// Destroy the session if `instance` is it; returns whether it was.
    pub fn destroy_external_camera(&mut self, instance: *const S) -> bool {
        let owned = self
            .camera
            .as_deref()
            .is_some_and(|camera| ptr::eq(camera, instance));
        if !owned {
            warn!("destroy requested for an unknown camera instance");
            return false;
        }

        self.camera = None;
        info!("external camera destroyed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::ExternalCamera;
    use crate::mock::{MockBridge, MockTransport, MockUsbDevice};
    use crate::traits::DriverError;

    type Camera = ExternalCamera<MockBridge, MockTransport>;

    fn build(transport: &MockTransport) -> impl FnOnce(&()) -> Result<Camera> + '_ {
        move |_: &()| {
            Ok(ExternalCamera::new(
                MockBridge::new(vec![MockUsbDevice::camera(1, 1)]),
                transport.clone(),
            ))
        }
    }

    #[test]
    fn test_second_create_rejected() {
        let transport = MockTransport::new();
        let mut driver: Driver<(), Camera> = Driver::new(());

        assert!(driver.create_external_camera(build(&transport)).is_some());
        assert!(driver.create_external_camera(build(&transport)).is_none());
    }

    #[test]
    fn test_create_after_destroy() {
        let transport = MockTransport::new();
        let mut driver: Driver<(), Camera> = Driver::new(());

        let first: *const Camera = driver
            .create_external_camera(build(&transport))
            .map(|camera| &*camera as *const Camera)
            .expect("first create");
        assert!(driver.destroy_external_camera(first));
        assert!(!driver.has_camera());

        assert!(driver.create_external_camera(build(&transport)).is_some());
    }

    #[test]
    fn test_destroy_ignores_foreign_and_repeated_handles() {
        let transport = MockTransport::new();
        let mut driver: Driver<(), Camera> = Driver::new(());
        let instance: *const Camera = driver
            .create_external_camera(build(&transport))
            .map(|camera| &*camera as *const Camera)
            .expect("create");

        assert!(!driver.destroy_external_camera(ptr::null()));
        assert!(driver.has_camera());
        assert!(driver.destroy_external_camera(instance));
        assert!(!driver.destroy_external_camera(instance));
    }

    #[test]
    fn test_destroy_closes_open_camera() {
        let transport = MockTransport::new();
        let mut driver: Driver<(), Camera> = Driver::new(());
        let camera = driver
            .create_external_camera(build(&transport))
            .expect("create");
        camera.open().expect("open");
        let instance: *const Camera = camera;
        assert_eq!(transport.live_handles(), 1);

        driver.destroy_external_camera(instance);
        assert_eq!(transport.live_handles(), 0);
        assert_eq!(transport.live_contexts(), 0);
    }

    #[test]
    fn test_failed_build_leaves_slot_free() {
        let transport = MockTransport::new();
        let mut driver: Driver<(), Camera> = Driver::new(());

        assert!(driver
            .create_external_camera(|_| Err(DriverError::Bridge("no vm".to_owned())))
            .is_none());
        assert!(driver.create_external_camera(build(&transport)).is_some());
    }
}
