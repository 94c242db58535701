//! Capture orchestration
//!
//! Opens a camera, configures it from [`CaptureConfig`], allocates buffers and
//! builds one request per buffer slot. [`CaptureSession::run`] then starts the
//! camera and runs the event loop: completed requests come back from the sensor
//! driver through `call_later`, are logged, recycled and queued again on the loop
//! thread until the timeout fires or the loop is cancelled.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::capture::allocator::FrameBufferAllocator;
use crate::capture::camera::{Camera, CameraState};
use crate::capture::config::{CameraConfiguration, ConfigurationStatus, StreamId};
use crate::capture::controls::{ControlId, ControlValue};
use crate::capture::manager::CameraDevice;
use crate::capture::request::{Request, RequestStatus};
use crate::error::{CaptureError, Result};
use crate::pipeline::event_loop::{EventLoop, ExitStatus, LoopHandle};
use crate::utils::camera_name;
use crate::CaptureConfig;

/// Outcome of one capture run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub status: Option<ExitStatus>,
    pub completed: u64,
    pub cancelled: u64,
    /// Completed frames per stream
    pub frames: Vec<u64>,
    /// Completed requests that could not be queued again
    pub requeue_failures: u64,
    /// Frames whose sequence number went backwards on their stream
    pub sequence_regressions: u64,
}

impl SessionReport {
    /// Process exit code; 1 when the loop never ran.
    pub fn exit_code(&self) -> i32 {
        self.status.map_or(1, ExitStatus::code)
    }
}

/// Loop context: everything the completion callbacks touch
pub struct SessionState {
    camera: Camera,
    report: SessionReport,
    /// Requests not currently owned by the camera
    idle: Vec<Request>,
    last_sequence: Vec<Option<u32>>,
    brightness: Option<f32>,
}

impl SessionState {
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    fn process_request(&mut self, mut request: Request) {
        match request.status() {
            RequestStatus::Completed => {}
            RequestStatus::Cancelled => {
                self.report.cancelled += 1;
                debug!(request = %request, "Request cancelled");
                self.idle.push(request);
                return;
            }
            status => {
                warn!(request = %request, ?status, "Unexpected request delivered");
                self.idle.push(request);
                return;
            }
        }

        self.report.completed += 1;
        for bound in request.buffers() {
            let metadata = bound.metadata();
            let index = bound.stream().0 as usize;
            if let Some(frames) = self.report.frames.get_mut(index) {
                *frames += 1;
            }
            if let Some(last) = self.last_sequence.get_mut(index) {
                if last.is_some_and(|previous| metadata.sequence < previous) {
                    self.report.sequence_regressions += 1;
                    warn!(stream = %bound.stream(), sequence = metadata.sequence, "Sequence went backwards");
                }
                *last = Some(metadata.sequence);
            }
            info!(
                request = %request,
                stream = %bound.stream(),
                sequence = metadata.sequence,
                timestamp = metadata.timestamp,
                status = ?metadata.status,
                " {}",
                metadata
            );
        }
        for (id, value) in request.metadata().iter() {
            debug!(request = %request, "{id} = {value}");
        }

        if let Err(e) = request.reuse() {
            warn!(request = %request, "Cannot recycle request: {e}");
            self.idle.push(request);
            return;
        }
        if self.camera.state() != CameraState::Running {
            self.idle.push(request);
            return;
        }
        if let Some(brightness) = self.brightness {
            request
                .controls_mut()
                .set(ControlId::Brightness, ControlValue::Float(brightness));
        }
        if let Err(rejected) = self.camera.queue_request(request) {
            self.report.requeue_failures += 1;
            warn!(request = %rejected.request, "Re-queue failed: {}", rejected.error);
            self.idle.push(rejected.request);
        }
    }
}

pub struct CaptureSession {
    event_loop: EventLoop<SessionState>,
    state: SessionState,
    allocator: FrameBufferAllocator,
    streams: Vec<StreamId>,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// Acquire `device` and get it ready to start. The camera is released again
    /// if any step fails.
    #[instrument(skip_all, fields(camera = %device.id()))]
    pub fn open(device: &CameraDevice, config: &CaptureConfig) -> Result<Self> {
        let mut camera = device.acquire()?;
        info!("Opened {}", camera_name(device));

        match Self::prepare(&mut camera, config) {
            Ok((allocator, streams, requests)) => Ok(Self {
                event_loop: EventLoop::new(),
                state: SessionState {
                    camera,
                    report: SessionReport {
                        frames: vec![0; streams.len()],
                        ..SessionReport::default()
                    },
                    idle: requests,
                    last_sequence: vec![None; streams.len()],
                    brightness: config.brightness,
                },
                allocator,
                streams,
            }),
            Err(e) => {
                camera.release();
                Err(e)
            }
        }
    }

    fn prepare(
        camera: &mut Camera,
        config: &CaptureConfig,
    ) -> Result<(FrameBufferAllocator, Vec<StreamId>, Vec<Request>)> {
        let mut camera_config = camera.generate_configuration(&config.roles);
        apply_overrides(&mut camera_config, config);
        if let Some(stream) = camera_config.get(0) {
            debug!("Requested configuration: {}", stream);
        }
        if camera.validate(&mut camera_config) == ConfigurationStatus::Adjusted {
            info!("Configuration adjusted by the camera");
        }
        camera.configure(&mut camera_config)?;

        let budget = config.memory_budget_mb.saturating_mul(1024 * 1024);
        let mut allocator = FrameBufferAllocator::new(budget);
        let mut streams = Vec::with_capacity(camera_config.len());
        for stream_config in &camera_config {
            allocator.allocate(stream_config)?;
            if let Some(stream) = stream_config.stream() {
                streams.push(stream);
            }
        }

        // One request per buffer slot, each taking that slot from every stream
        let slots = streams
            .iter()
            .map(|stream| allocator.buffers(*stream).len())
            .min()
            .unwrap_or(0);
        let mut requests = Vec::with_capacity(slots);
        for slot in 0..slots {
            let mut request = camera.create_request(slot as u64)?;
            for stream in &streams {
                request.add_buffer(*stream, &allocator.buffers(*stream)[slot])?;
            }
            if let Some(brightness) = config.brightness {
                request
                    .controls_mut()
                    .set(ControlId::Brightness, ControlValue::Float(brightness));
            }
            requests.push(request);
        }
        Ok((allocator, streams, requests))
    }

    /// Handle for posting to, exiting or cancelling the session loop from
    /// another thread.
    pub fn loop_handle(&self) -> LoopHandle<SessionState> {
        self.event_loop.handle()
    }

    pub fn camera(&self) -> &Camera {
        &self.state.camera
    }

    pub fn streams(&self) -> &[StreamId] {
        &self.streams
    }

    /// Capture until `timeout` elapses or the loop is ended through a handle.
    /// The camera is stopped and every outstanding request collected before
    /// this returns.
    ///
    /// A session runs once: afterwards the camera is Stopped and its cancelled
    /// requests cannot be recycled. Open a new session to capture again.
    #[instrument(skip(self), fields(camera = %self.state.camera.id()))]
    pub fn run(&mut self, timeout: Duration) -> Result<SessionReport> {
        if self.state.report.status.is_some() {
            return Err(CaptureError::State("capture session has already run".into()));
        }
        let handle = self.event_loop.handle();
        self.state.camera.set_request_completed(move |request| {
            handle.call_later(move |state: &mut SessionState| state.process_request(request));
        });

        if let Err(e) = self.state.camera.start() {
            self.state.camera.clear_request_completed();
            return Err(e);
        }

        let mut pending = std::mem::take(&mut self.state.idle).into_iter();
        while let Some(request) = pending.next() {
            if let Err(rejected) = self.state.camera.queue_request(request) {
                warn!(request = %rejected.request, "Cannot queue request: {}", rejected.error);
                self.state.idle.push(rejected.request);
                self.state.idle.extend(pending);
                self.finish();
                return Err(rejected.error);
            }
        }

        self.event_loop.timeout(timeout);
        let status = self.event_loop.exec(&mut self.state);
        self.finish();

        self.state.report.status = Some(status);
        let report = self.state.report.clone();
        info!(
            %status,
            completed = report.completed,
            cancelled = report.cancelled,
            "Capture finished"
        );
        Ok(report)
    }

    /// Stop the camera and run the completions it delivered on the way down.
    fn finish(&mut self) {
        self.state.camera.stop();
        let collected = self.event_loop.dispatch_pending(&mut self.state);
        debug!(collected, "Collected outstanding requests");
        self.state.camera.clear_request_completed();
    }

    /// Stop capture, free the buffers and release the camera.
    #[instrument(skip(self), fields(camera = %self.state.camera.id()))]
    pub fn close(mut self) -> Result<()> {
        self.finish();
        self.state.idle.clear();
        let freed = self
            .streams
            .iter()
            .try_for_each(|stream| self.allocator.free(*stream));
        self.state.camera.release();
        freed
    }
}

/// Apply the configured overrides to the first stream and the frame rate.
fn apply_overrides(camera_config: &mut CameraConfiguration, config: &CaptureConfig) {
    if let Some(stream) = camera_config.at_mut(0) {
        if let Some(width) = config.width {
            stream.size.width = width;
        }
        if let Some(height) = config.height {
            stream.size.height = height;
        }
        if let Some(format) = config.pixel_format {
            stream.pixel_format = format;
        }
        if let Some(count) = config.buffer_count {
            stream.buffer_count = count;
        }
    }
    if let Some(rate) = config.frame_rate {
        camera_config.set_frame_duration(Duration::from_secs(1) / rate.max(1));
    }
}
