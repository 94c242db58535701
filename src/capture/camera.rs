//! Camera lifecycle: configuration, start/stop and request submission

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capture::config::{
    CameraConfiguration, ConfigurationStatus, SensorCapabilities, StreamId, StreamRole,
};
use crate::capture::frame::Plane;
use crate::capture::manager::{CameraDevice, CameraProperties};
use crate::capture::request::{Request, RequestStatus};
use crate::capture::sensor::{self, CompletionSlot, SensorHandle, SensorShared};
use crate::error::{CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Available,
    Acquired,
    Configured,
    Running,
    Stopped,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A request the camera refused, handed back untouched.
#[derive(Error, Debug)]
#[error("request rejected: {error}")]
pub struct QueueRequestError {
    #[source]
    pub error: CaptureError,
    pub request: Request,
}

impl From<QueueRequestError> for CaptureError {
    fn from(rejected: QueueRequestError) -> Self {
        rejected.error
    }
}

/// Exclusive handle to an acquired camera.
///
/// Dropping it stops capture and releases the device.
pub struct Camera {
    device: CameraDevice,
    state: CameraState,
    active: Option<CameraConfiguration>,
    /// Plane layout of every configured stream, by stream index
    layouts: Vec<Vec<Plane>>,
    completion: sensor::CompletionHandler,
    shared: Arc<SensorShared>,
    driver: Option<SensorHandle>,
}

impl Camera {
    pub(crate) fn new(device: CameraDevice) -> Self {
        Self {
            device,
            state: CameraState::Acquired,
            active: None,
            layouts: Vec::new(),
            completion: Arc::new(ArcSwapOption::empty()),
            shared: Arc::new(SensorShared::default()),
            driver: None,
        }
    }

    pub fn id(&self) -> &str {
        self.device.id()
    }

    pub fn properties(&self) -> &CameraProperties {
        self.device.properties()
    }

    pub fn capabilities(&self) -> &SensorCapabilities {
        self.device.capabilities()
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.device.is_online()
    }

    /// The configuration applied by the last successful `configure`.
    pub fn configuration(&self) -> Option<&CameraConfiguration> {
        self.active.as_ref()
    }

    /// Requests handed to the sensor and not yet returned.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// One default descriptor per role. Touches no hardware state.
    pub fn generate_configuration(&self, roles: &[StreamRole]) -> CameraConfiguration {
        let caps = self.capabilities();
        let mut config = CameraConfiguration::new(caps.default_frame_duration());
        for role in roles {
            config.push(caps.default_stream(*role));
        }
        config
    }

    /// Adjust `config` to the closest configuration this camera supports.
    pub fn validate(&self, config: &mut CameraConfiguration) -> ConfigurationStatus {
        self.capabilities().validate(config)
    }

    /// Apply a validated configuration. Assigns a stream to every descriptor.
    #[instrument(skip(self, config), fields(camera = %self.id()))]
    pub fn configure(&mut self, config: &mut CameraConfiguration) -> Result<()> {
        self.sync_connection();
        match self.state {
            CameraState::Available => return Err(self.state_error("configure")),
            CameraState::Running => return Err(self.state_error("configure")),
            _ => {}
        }
        if !self.is_online() {
            return Err(self.disconnected());
        }
        self.capabilities().check(config)?;

        for (index, cfg) in config.streams_mut().iter_mut().enumerate() {
            cfg.set_stream(StreamId(index as u32));
        }
        for cfg in config.iter() {
            info!(
                stream = ?cfg.stream(),
                role = ?cfg.role,
                buffers = cfg.buffer_count,
                stride = cfg.stride,
                frame_size = cfg.frame_size,
                "Configured {}",
                cfg
            );
        }
        self.layouts = config.iter().map(|cfg| cfg.planes()).collect();
        self.active = Some(config.clone());
        self.state = CameraState::Configured;
        Ok(())
    }

    /// New request in the Built state.
    pub fn create_request(&self, cookie: u64) -> Result<Request> {
        match self.state {
            CameraState::Configured | CameraState::Running | CameraState::Stopped => {
                Ok(Request::new(cookie))
            }
            _ => Err(self.state_error("create a request")),
        }
    }

    /// Install the completion handler, replacing any previous one.
    ///
    /// The handler runs on the driver thread for every completed or cancelled
    /// request. It should only forward the request, e.g. to an event loop.
    pub fn set_request_completed<F>(&mut self, handler: F)
    where
        F: Fn(Request) + Send + Sync + 'static,
    {
        self.completion
            .store(Some(Arc::new(CompletionSlot(Box::new(handler)))));
    }

    pub fn clear_request_completed(&mut self) {
        self.completion.store(None);
    }

    #[instrument(skip(self), fields(camera = %self.id()))]
    pub fn start(&mut self) -> Result<()> {
        self.sync_connection();
        if self.state != CameraState::Configured {
            return Err(self.state_error("start"));
        }
        if !self.is_online() {
            return Err(self.disconnected());
        }
        let Some(config) = self.active.as_ref() else {
            return Err(self.state_error("start"));
        };
        if self.completion.load().is_none() {
            warn!("Starting without a completion handler");
        }

        self.driver = Some(sensor::spawn(
            &self.device,
            config,
            self.completion.clone(),
            self.shared.clone(),
        ));
        self.state = CameraState::Running;
        info!("Camera started");
        Ok(())
    }

    /// Submit `request` for capture. On rejection the request comes back in the
    /// error, unchanged.
    pub fn queue_request(&mut self, mut request: Request) -> std::result::Result<(), QueueRequestError> {
        self.sync_connection();
        if let Err(error) = self.check_queueable(&request) {
            return Err(QueueRequestError { error, request });
        }
        let Some(driver) = self.driver.as_ref() else {
            let error = self.state_error("queue a request");
            return Err(QueueRequestError { error, request });
        };

        request.mark_queued();
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        match driver.submit(request) {
            Ok(()) => {
                metrics::counter!("camera_requests_queued_total").increment(1);
                Ok(())
            }
            Err(mut request) => {
                self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                request.mark_unqueued();
                Err(QueueRequestError {
                    error: CaptureError::State("sensor driver is not running".into()),
                    request,
                })
            }
        }
    }

    fn check_queueable(&self, request: &Request) -> Result<()> {
        if !self.is_online() {
            return Err(self.disconnected());
        }
        if self.state != CameraState::Running {
            return Err(self.state_error("queue a request"));
        }
        if request.status() != RequestStatus::Built {
            return Err(CaptureError::State(format!(
                "{request} is not in the Built state"
            )));
        }
        if !request.has_buffers() {
            return Err(CaptureError::Binding(format!("{request} has no buffers")));
        }
        // Exclusive binding is enforced by the ownership table at add_buffer time
        for bound in request.buffers() {
            let Some(layout) = self.layouts.get(bound.stream().0 as usize) else {
                return Err(CaptureError::Binding(format!(
                    "{request} targets {} which is not configured",
                    bound.stream()
                )));
            };
            if bound.buffer().planes() != layout.as_slice() {
                return Err(CaptureError::Binding(format!(
                    "buffer {} was not allocated for the current {} layout",
                    bound.buffer().id(),
                    bound.stream()
                )));
            }
        }
        Ok(())
    }

    /// Cancel every in-flight request and stop capturing. Every request queued
    /// before this call has been delivered as Cancelled or Completed when it
    /// returns, and none completes afterwards.
    #[instrument(skip(self), fields(camera = %self.id()))]
    pub fn stop(&mut self) {
        if self.state != CameraState::Running {
            debug!(state = %self.state, "Camera not running, nothing to stop");
            return;
        }
        self.halt();
        self.state = CameraState::Stopped;
        info!("Camera stopped");
    }

    /// Give up exclusive ownership. Stops capture first if needed.
    pub fn release(&mut self) {
        if self.state == CameraState::Available {
            return;
        }
        self.stop();
        self.active = None;
        self.layouts.clear();
        self.device.release();
        self.state = CameraState::Available;
    }

    fn halt(&mut self) {
        if let Some(driver) = self.driver.take() {
            let leftovers = driver.shutdown();
            if leftovers > 0 {
                debug!(leftovers, "Cancelled requests left in the submission queue");
            }
        }
    }

    /// A lost device forces a running camera into Stopped.
    fn sync_connection(&mut self) {
        if self.state == CameraState::Running && !self.is_online() {
            warn!(camera = %self.id(), "Device lost while running, stopping");
            self.halt();
            self.state = CameraState::Stopped;
        }
    }

    fn state_error(&self, operation: &str) -> CaptureError {
        CaptureError::State(format!(
            "cannot {operation} while camera {} is {}",
            self.id(),
            self.state
        ))
    }

    fn disconnected(&self) -> CaptureError {
        CaptureError::State(format!("camera {} is disconnected", self.id()))
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::allocator::FrameBufferAllocator;
    use crate::capture::frame::Size;
    use crate::capture::manager::CameraManager;
    use crate::SensorConfig;

    fn manager() -> CameraManager {
        CameraManager::new(&[SensorConfig::default()]).unwrap()
    }

    #[test]
    fn configure_rejects_unvalidated_zero_size() {
        let manager = manager();
        let mut camera = manager.cameras()[0].acquire().unwrap();
        let mut config = camera.generate_configuration(&[StreamRole::Viewfinder]);
        config.at_mut(0).unwrap().size = Size::new(0, 0);

        let err = camera.configure(&mut config).unwrap_err();
        assert!(matches!(err, CaptureError::Configuration(_)));
        assert_eq!(camera.state(), CameraState::Acquired);
        assert!(camera.configuration().is_none());
        assert!(config.get(0).unwrap().stream().is_none());
    }

    #[test]
    fn validated_configuration_is_applied() {
        let manager = manager();
        let mut camera = manager.cameras()[0].acquire().unwrap();
        let mut config = camera.generate_configuration(&[StreamRole::Viewfinder, StreamRole::Raw]);
        config.at_mut(0).unwrap().size = Size::new(0, 0);
        assert_eq!(camera.validate(&mut config), ConfigurationStatus::Adjusted);

        camera.configure(&mut config).unwrap();
        assert_eq!(camera.state(), CameraState::Configured);
        assert_eq!(config.get(1).unwrap().stream(), Some(StreamId(1)));
    }

    #[test]
    fn start_requires_configuration() {
        let manager = manager();
        let mut camera = manager.cameras()[0].acquire().unwrap();
        assert!(matches!(camera.start(), Err(CaptureError::State(_))));
        assert!(matches!(camera.create_request(0), Err(CaptureError::State(_))));
    }

    #[test]
    fn queue_requires_running() {
        let manager = manager();
        let mut camera = manager.cameras()[0].acquire().unwrap();
        let mut config = camera.generate_configuration(&[StreamRole::Viewfinder]);
        camera.validate(&mut config);
        camera.configure(&mut config).unwrap();

        let request = camera.create_request(0).unwrap();
        let rejected = camera.queue_request(request).unwrap_err();
        assert!(matches!(rejected.error, CaptureError::State(_)));
        assert_eq!(rejected.request.status(), RequestStatus::Built);
    }

    #[test]
    fn configure_is_refused_while_running() {
        let manager = manager();
        let mut camera = manager.cameras()[0].acquire().unwrap();
        let mut config = camera.generate_configuration(&[StreamRole::Viewfinder]);
        camera.validate(&mut config);
        camera.configure(&mut config).unwrap();
        camera.start().unwrap();

        assert!(matches!(
            camera.configure(&mut config),
            Err(CaptureError::State(_))
        ));
        camera.stop();
        assert_eq!(camera.state(), CameraState::Stopped);
        camera.configure(&mut config).unwrap();
        assert_eq!(camera.state(), CameraState::Configured);
    }

    #[test]
    fn released_camera_refuses_work() {
        let manager = manager();
        let device = manager.cameras()[0].clone();
        let mut camera = device.acquire().unwrap();
        camera.release();
        assert_eq!(camera.state(), CameraState::Available);
        assert!(!device.is_acquired());

        let mut config = camera.generate_configuration(&[StreamRole::Viewfinder]);
        camera.validate(&mut config);
        assert!(matches!(
            camera.configure(&mut config),
            Err(CaptureError::State(_))
        ));
    }

    #[test]
    fn queue_rejects_buffer_of_unconfigured_stream() {
        let manager = manager();
        let mut camera = manager.cameras()[0].acquire().unwrap();
        let mut two = camera.generate_configuration(&[StreamRole::Viewfinder, StreamRole::Viewfinder]);
        camera.validate(&mut two);
        camera.configure(&mut two).unwrap();

        let mut allocator = FrameBufferAllocator::new(usize::MAX);
        let second = allocator.allocate(two.get(1).unwrap()).unwrap()[0].clone();
        let mut request = camera.create_request(0).unwrap();
        request.add_buffer(StreamId(1), &second).unwrap();

        let mut one = camera.generate_configuration(&[StreamRole::Viewfinder]);
        camera.validate(&mut one);
        camera.configure(&mut one).unwrap();
        camera.start().unwrap();

        let rejected = camera.queue_request(request).unwrap_err();
        assert!(matches!(rejected.error, CaptureError::Binding(_)));
        assert_eq!(rejected.request.status(), RequestStatus::Built);
        assert!(!second.is_in_flight());
        assert_eq!(camera.in_flight(), 0);
        camera.stop();
    }
}
