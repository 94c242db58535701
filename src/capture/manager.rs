//! Camera enumeration
//!
//! The manager owns the runtime the sensor drivers run on and the ordered list
//! of cameras built from the configured virtual sensors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::capture::camera::Camera;
use crate::capture::config::SensorCapabilities;
use crate::capture::frame::Size;
use crate::error::{CaptureError, Result};
use crate::SensorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Front,
    Back,
    External,
}

#[derive(Debug, Clone)]
pub struct CameraProperties {
    pub location: Location,
    pub model: String,
}

struct DeviceInner {
    id: String,
    properties: CameraProperties,
    capabilities: SensorCapabilities,
    acquired: AtomicBool,
    online: watch::Sender<bool>,
    runtime: Arc<Runtime>,
}

/// One enumerated camera. Cheap to clone; all clones refer to the same device.
#[derive(Clone)]
pub struct CameraDevice {
    inner: Arc<DeviceInner>,
}

impl CameraDevice {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn properties(&self) -> &CameraProperties {
        &self.inner.properties
    }

    pub fn capabilities(&self) -> &SensorCapabilities {
        &self.inner.capabilities
    }

    pub fn is_acquired(&self) -> bool {
        self.inner.acquired.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Take exclusive ownership of the camera.
    pub fn acquire(&self) -> Result<Camera> {
        if !self.is_online() {
            return Err(CaptureError::State(format!(
                "camera {} is disconnected",
                self.id()
            )));
        }
        self.inner
            .acquired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CaptureError::Busy(self.id().to_string()))?;
        info!(camera = self.id(), "Camera acquired");
        Ok(Camera::new(self.clone()))
    }

    /// Simulate loss of the underlying hardware. Running drivers cancel every
    /// pending request and the camera cannot be started again.
    pub fn disconnect(&self) {
        warn!(camera = self.id(), "Camera disconnected");
        self.inner.online.send_replace(false);
    }

    pub(crate) fn release(&self) {
        if self.inner.acquired.swap(false, Ordering::AcqRel) {
            info!(camera = self.id(), "Camera released");
        }
    }

    pub(crate) fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        self.inner.runtime.handle()
    }
}

impl std::fmt::Debug for CameraDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraDevice")
            .field("id", &self.inner.id)
            .field("properties", &self.inner.properties)
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

pub struct CameraManager {
    runtime: Arc<Runtime>,
    cameras: Vec<CameraDevice>,
}

impl CameraManager {
    /// Start the driver runtime and enumerate one camera per sensor entry.
    pub fn new(sensors: &[SensorConfig]) -> Result<Self> {
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("camera-manager")
                .enable_all()
                .build()?,
        );

        let mut cameras: Vec<CameraDevice> = Vec::with_capacity(sensors.len());
        for sensor in sensors {
            if cameras.iter().any(|c| c.id() == sensor.id) {
                return Err(CaptureError::Configuration(format!(
                    "duplicate camera id {}",
                    sensor.id
                )));
            }
            let (online, _) = watch::channel(true);
            cameras.push(CameraDevice {
                inner: Arc::new(DeviceInner {
                    id: sensor.id.clone(),
                    properties: CameraProperties {
                        location: sensor.location,
                        model: sensor.model.clone(),
                    },
                    capabilities: capabilities_of(sensor),
                    acquired: AtomicBool::new(false),
                    online,
                    runtime: runtime.clone(),
                }),
            });
        }

        info!(cameras = cameras.len(), "Camera manager started");
        Ok(Self { runtime, cameras })
    }

    /// Cameras in enumeration order.
    pub fn cameras(&self) -> &[CameraDevice] {
        &self.cameras
    }

    pub fn get(&self, id: &str) -> Option<CameraDevice> {
        self.cameras.iter().find(|c| c.id() == id).cloned()
    }

    /// Handle of the runtime the drivers run on.
    pub fn runtime(&self) -> &Handle {
        self.runtime.handle()
    }
}

fn capabilities_of(sensor: &SensorConfig) -> SensorCapabilities {
    let max_fps = sensor.max_fps.max(1);
    SensorCapabilities {
        formats: sensor.formats.clone(),
        min_size: Size::new(64, 64),
        max_size: Size::new(
            sensor.max_width.max(64) & !1,
            sensor.max_height.max(64) & !1,
        ),
        size_step: Size::new(2, 2),
        stride_alignment: 64,
        min_buffers: 1,
        max_buffers: sensor.max_buffers.max(1),
        max_streams: sensor.max_streams.max(1),
        min_frame_duration: Duration::from_secs(1) / max_fps,
        max_frame_duration: Duration::from_secs(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(id: &str) -> SensorConfig {
        SensorConfig {
            id: id.to_string(),
            ..SensorConfig::default()
        }
    }

    #[test]
    fn get_by_id_returns_same_device() {
        let manager = CameraManager::new(&[sensor("a"), sensor("b")]).unwrap();
        assert_eq!(manager.cameras().len(), 2);
        assert_eq!(manager.cameras()[1].id(), "b");
        assert!(manager.get("a").is_some());
        assert!(manager.get("missing").is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        assert!(matches!(
            CameraManager::new(&[sensor("a"), sensor("a")]),
            Err(CaptureError::Configuration(_))
        ));
    }

    #[test]
    fn second_acquire_is_busy() {
        let manager = CameraManager::new(&[sensor("a")]).unwrap();
        let first_owner = manager.get("a").unwrap();
        let second_owner = manager.get("a").unwrap();

        let mut camera = first_owner.acquire().unwrap();
        assert!(matches!(second_owner.acquire(), Err(CaptureError::Busy(_))));

        camera.release();
        camera.release();
        assert!(!second_owner.is_acquired());
        second_owner.acquire().unwrap();
    }

    #[test]
    fn disconnected_camera_cannot_be_acquired() {
        let manager = CameraManager::new(&[sensor("a")]).unwrap();
        let device = manager.get("a").unwrap();
        device.disconnect();
        assert!(matches!(device.acquire(), Err(CaptureError::State(_))));
    }
}
