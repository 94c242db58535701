//! Virtual sensor driver
//!
//! One task per running camera, spawned on the camera manager runtime. It takes
//! queued requests in order, paces them at the configured frame duration, fills
//! in completion metadata and hands each request to the completion handler. This
//! task is the producer side: the handler runs on a runtime worker thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::{oneshot, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::capture::config::CameraConfiguration;
use crate::capture::controls::{ControlId, ControlValue};
use crate::capture::frame::{monotonic_ns, FrameStatus, PixelFormat};
use crate::capture::manager::CameraDevice;
use crate::capture::request::Request;

/// The single completion callback of a camera.
pub(crate) struct CompletionSlot(pub(crate) Box<dyn Fn(Request) + Send + Sync + 'static>);

pub(crate) type CompletionHandler = Arc<ArcSwapOption<CompletionSlot>>;

/// Counters shared between a camera and its driver
#[derive(Default)]
pub(crate) struct SensorShared {
    pub(crate) in_flight: AtomicUsize,
}

/// Image controls reported back unchanged in the result metadata
const ECHOED_CONTROLS: [ControlId; 3] = [
    ControlId::AeEnable,
    ControlId::Brightness,
    ControlId::Contrast,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Stop,
    Lost,
}

enum Step {
    Capture(Request),
    Halt(Halt),
}

struct StreamGeometry {
    format: PixelFormat,
    plane_lengths: Vec<u32>,
}

/// Consumer-side handle of a running driver task
pub(crate) struct SensorHandle {
    requests: flume::Sender<Request>,
    pending: flume::Receiver<Request>,
    stop: Option<oneshot::Sender<()>>,
    done: flume::Receiver<()>,
    completion: CompletionHandler,
    shared: Arc<SensorShared>,
}

impl SensorHandle {
    /// Hand a queued request to the driver. Gives it back if the driver is gone.
    pub(crate) fn submit(&self, request: Request) -> Result<(), Request> {
        self.requests.send(request).map_err(|e| e.into_inner())
    }

    /// Stop the driver and wait until every request it held has been cancelled.
    /// Requests that were still sitting in the submission queue when the task
    /// ended are cancelled here, on the caller's thread.
    pub(crate) fn shutdown(mut self) -> usize {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        // The task drops its end of `done` when it returns
        let _ = self.done.recv();

        let mut leftovers = 0;
        for request in self.pending.drain() {
            cancel(&self.completion, &self.shared, request);
            leftovers += 1;
        }
        leftovers
    }
}

struct VirtualSensor {
    camera_id: String,
    streams: Vec<StreamGeometry>,
    frame_duration: Duration,
    sequence: u32,
    requests: flume::Receiver<Request>,
    completion: CompletionHandler,
    shared: Arc<SensorShared>,
    _done: flume::Sender<()>,
}

/// Start a driver task for `device` running `config`.
pub(crate) fn spawn(
    device: &CameraDevice,
    config: &CameraConfiguration,
    completion: CompletionHandler,
    shared: Arc<SensorShared>,
) -> SensorHandle {
    let (requests_tx, requests_rx) = flume::unbounded();
    let (stop_tx, stop_rx) = oneshot::channel();
    let (done_tx, done_rx) = flume::bounded(1);

    let sensor = VirtualSensor {
        camera_id: device.id().to_string(),
        streams: config
            .iter()
            .map(|cfg| StreamGeometry {
                format: cfg.pixel_format,
                plane_lengths: cfg.planes().iter().map(|p| p.length).collect(),
            })
            .collect(),
        frame_duration: config.frame_duration(),
        sequence: 0,
        requests: requests_rx.clone(),
        completion: completion.clone(),
        shared: shared.clone(),
        _done: done_tx,
    };

    info!(
        camera = device.id(),
        streams = config.len(),
        frame_duration_us = config.frame_duration().as_micros() as u64,
        "Sensor streaming"
    );
    device
        .runtime()
        .spawn(sensor.run(stop_rx, device.subscribe_online()));

    SensorHandle {
        requests: requests_tx,
        pending: requests_rx,
        stop: Some(stop_tx),
        done: done_rx,
        completion,
        shared,
    }
}

impl VirtualSensor {
    async fn run(mut self, mut stop: oneshot::Receiver<()>, mut online: watch::Receiver<bool>) {
        // The first frame needs a full exposure
        let mut ticker = time::interval_at(
            time::Instant::now() + self.frame_duration,
            self.frame_duration,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let halt = loop {
            let step = tokio::select! {
                biased;
                _ = &mut stop => Step::Halt(Halt::Stop),
                _ = online.wait_for(|up| !*up) => Step::Halt(Halt::Lost),
                next = self.requests.recv_async() => match next {
                    Ok(request) => Step::Capture(request),
                    Err(_) => Step::Halt(Halt::Stop),
                },
            };
            let request = match step {
                Step::Capture(request) => request,
                Step::Halt(halt) => break halt,
            };

            // Exposure: wait for the next frame slot unless the sensor goes away
            let interrupted = tokio::select! {
                biased;
                _ = &mut stop => Some(Halt::Stop),
                _ = online.wait_for(|up| !*up) => Some(Halt::Lost),
                _ = ticker.tick() => None,
            };
            match interrupted {
                Some(halt) => {
                    cancel(&self.completion, &self.shared, request);
                    break halt;
                }
                None => self.expose(request),
            }
        };

        let mut cancelled = 0usize;
        for request in self.requests.drain() {
            cancel(&self.completion, &self.shared, request);
            cancelled += 1;
        }

        match halt {
            Halt::Stop => debug!(camera = %self.camera_id, cancelled, "Sensor stopped"),
            Halt::Lost => error!(
                camera = %self.camera_id,
                cancelled,
                "Sensor lost, pending requests cancelled"
            ),
        }
    }

    /// Fill `request` as one captured frame and deliver it.
    fn expose(&mut self, mut request: Request) {
        let timestamp = monotonic_ns();
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let frame_us = self.frame_duration.as_micros().min(i64::MAX as u128) as i64;
        let exposure = request
            .controls()
            .get(ControlId::ExposureTime)
            .and_then(|v| v.as_i64())
            .unwrap_or(frame_us * 9 / 10)
            .clamp(1, frame_us.max(1));
        let gain = request
            .controls()
            .get(ControlId::AnalogueGain)
            .and_then(|v| v.as_f32())
            .unwrap_or(1.0);

        for bound in request.buffers_mut() {
            let geometry = self.streams.get(bound.stream().0 as usize);
            let meta = bound.metadata_mut();
            meta.sequence = sequence;
            meta.timestamp = timestamp;
            let Some(geometry) = geometry else {
                meta.status = FrameStatus::Error;
                continue;
            };
            meta.status = FrameStatus::Success;
            for (plane, length) in meta.planes_mut().iter_mut().zip(&geometry.plane_lengths) {
                plane.bytes_used = if geometry.format.is_compressed() {
                    // Encoded frames vary in size from one frame to the next
                    (length / 4 + (sequence % 97) * 64).min(*length)
                } else {
                    *length
                };
            }
        }

        let (controls, metadata) = request.controls_and_metadata_mut();
        metadata.set(ControlId::SensorTimestamp, ControlValue::Int64(timestamp as i64));
        metadata.set(ControlId::FrameDuration, ControlValue::Int64(frame_us));
        metadata.set(
            ControlId::ExposureTime,
            ControlValue::Int32(exposure.min(i32::MAX as i64) as i32),
        );
        metadata.set(ControlId::AnalogueGain, ControlValue::Float(gain));
        for id in ECHOED_CONTROLS {
            if let Some(value) = controls.get(id) {
                metadata.set(id, value);
            }
        }

        request.mark_completed();
        if let Some(queued_at) = request.queued_at() {
            metrics::histogram!("request_latency_us").record(queued_at.elapsed().as_micros() as f64);
        }
        metrics::counter!("camera_requests_completed_total").increment(1);
        trace!(camera = %self.camera_id, sequence, request = %request, "Frame captured");

        deliver(&self.completion, &self.shared, request);
    }
}

fn cancel(completion: &CompletionHandler, shared: &SensorShared, mut request: Request) {
    request.mark_cancelled();
    metrics::counter!("camera_requests_cancelled_total").increment(1);
    deliver(completion, shared, request);
}

fn deliver(completion: &CompletionHandler, shared: &SensorShared, request: Request) {
    shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    match completion.load_full() {
        Some(slot) => (slot.0)(request),
        None => warn!(request = %request, "No completion handler, dropping request"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::capture::allocator::FrameBufferAllocator;
    use crate::capture::config::StreamRole;
    use crate::capture::controls::{ControlId, ControlValue};
    use crate::capture::frame::FrameStatus;
    use crate::capture::manager::CameraManager;
    use crate::capture::request::RequestStatus;
    use crate::SensorConfig;

    #[test]
    fn frames_carry_sequence_and_echoed_controls() {
        let manager = CameraManager::new(&[SensorConfig {
            max_fps: 200,
            ..SensorConfig::default()
        }])
        .unwrap();
        let mut camera = manager.cameras()[0].acquire().unwrap();
        let mut config = camera.generate_configuration(&[StreamRole::StillCapture]);
        config.set_frame_duration(Duration::from_millis(5));
        camera.validate(&mut config);
        camera.configure(&mut config).unwrap();

        let stream = config.get(0).unwrap().stream().unwrap();
        let mut allocator = FrameBufferAllocator::new(usize::MAX);
        let buffers = allocator.allocate(config.get(0).unwrap()).unwrap().to_vec();

        let (tx, rx) = flume::unbounded();
        camera.set_request_completed(move |request| {
            let _ = tx.send(request);
        });
        camera.start().unwrap();
        for (cookie, buffer) in buffers.iter().take(2).enumerate() {
            let mut request = camera.create_request(cookie as u64).unwrap();
            request.add_buffer(stream, buffer).unwrap();
            request
                .controls_mut()
                .set(ControlId::Brightness, ControlValue::Float(0.5));
            request
                .controls_mut()
                .set(ControlId::ExposureTime, ControlValue::Int32(1000));
            camera.queue_request(request).unwrap();
        }

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        camera.stop();

        assert_eq!(first.status(), RequestStatus::Completed);
        assert_eq!(first.cookie(), 0);
        let meta = first.buffer(stream).unwrap().metadata();
        let next = second.buffer(stream).unwrap().metadata();
        assert_eq!(meta.status, FrameStatus::Success);
        assert_eq!(next.sequence, meta.sequence + 1);
        assert!(next.timestamp > meta.timestamp);
        // Encoded frames never fill the whole buffer
        assert!(meta.planes()[0].bytes_used < buffers[0].planes()[0].length);

        assert_eq!(
            first.metadata().get(ControlId::Brightness),
            Some(ControlValue::Float(0.5))
        );
        assert_eq!(
            first.metadata().get(ControlId::ExposureTime),
            Some(ControlValue::Int32(1000))
        );
        assert!(first.metadata().contains(ControlId::SensorTimestamp));
    }
}
