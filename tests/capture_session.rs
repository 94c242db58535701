//! Integration tests for the capture request loop

use std::time::Duration;

use camloop::capture::{
    Camera, CameraManager, CameraState, FrameBufferAllocator, FrameStatus, Request,
    RequestStatus, Size, StreamId, StreamRole,
};
use camloop::pipeline::{EventLoop, ExitStatus};
use camloop::{CaptureError, SensorConfig};

const BUDGET: usize = 64 * 1024 * 1024;

fn manager() -> CameraManager {
    CameraManager::new(&[SensorConfig::default()]).unwrap()
}

/// Configure one 640x480 stream with four buffers and build one request per
/// buffer.
fn prepare(
    camera: &mut Camera,
    frame_duration: Option<Duration>,
) -> (FrameBufferAllocator, StreamId, Vec<Request>) {
    let mut config = camera.generate_configuration(&[StreamRole::Viewfinder]);
    {
        let stream = config.at_mut(0).unwrap();
        stream.size = Size::new(640, 480);
        stream.buffer_count = 4;
    }
    if let Some(duration) = frame_duration {
        config.set_frame_duration(duration);
    }
    camera.validate(&mut config);
    camera.configure(&mut config).unwrap();

    let stream = config.get(0).unwrap().stream().unwrap();
    let mut allocator = FrameBufferAllocator::new(BUDGET);
    let buffers = allocator.allocate(config.get(0).unwrap()).unwrap();
    assert_eq!(buffers.len(), 4);

    let requests = buffers
        .iter()
        .enumerate()
        .map(|(cookie, buffer)| {
            let mut request = camera.create_request(cookie as u64).unwrap();
            request.add_buffer(stream, buffer).unwrap();
            request
        })
        .collect();
    (allocator, stream, requests)
}

struct Capture {
    camera: Camera,
    stream: StreamId,
    sequences: Vec<u32>,
    cancelled: usize,
}

impl Capture {
    fn process(&mut self, mut request: Request) {
        if request.status() == RequestStatus::Cancelled {
            self.cancelled += 1;
            return;
        }
        let metadata = request.buffer(self.stream).unwrap().metadata();
        assert_eq!(metadata.status, FrameStatus::Success);
        assert_eq!(metadata.planes()[0].bytes_used, 640 * 4 * 480);
        self.sequences.push(metadata.sequence);

        request.reuse().unwrap();
        if self.camera.state() == CameraState::Running {
            self.camera.queue_request(request).unwrap();
        }
    }
}

#[test]
fn capture_runs_until_timeout() {
    let manager = manager();
    let mut camera = manager.cameras()[0].acquire().unwrap();
    let (_allocator, stream, requests) = prepare(&mut camera, None);

    let mut event_loop: EventLoop<Capture> = EventLoop::new();
    let handle = event_loop.handle();
    camera.set_request_completed(move |request| {
        handle.call_later(move |capture: &mut Capture| capture.process(request));
    });
    camera.start().unwrap();
    for request in requests {
        camera.queue_request(request).unwrap();
    }

    let mut capture = Capture {
        camera,
        stream,
        sequences: Vec::new(),
        cancelled: 0,
    };
    event_loop.timeout(Duration::from_secs(3));
    let status = event_loop.exec(&mut capture);
    capture.camera.stop();
    event_loop.dispatch_pending(&mut capture);

    assert_eq!(status, ExitStatus::TimedOut);
    assert_eq!(status.code(), 0);
    assert!(!capture.sequences.is_empty());
    assert!(capture.sequences.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(capture.camera.in_flight(), 0);
}

#[test]
fn stop_cancels_every_queued_request() {
    let manager = manager();
    let mut camera = manager.cameras()[0].acquire().unwrap();
    let (_allocator, _stream, requests) = prepare(&mut camera, Some(Duration::from_secs(1)));

    let (tx, rx) = flume::unbounded();
    camera.set_request_completed(move |request| {
        let _ = tx.send(request);
    });
    camera.start().unwrap();
    for request in requests {
        camera.queue_request(request).unwrap();
    }
    assert_eq!(camera.in_flight(), 4);

    camera.stop();
    assert_eq!(camera.state(), CameraState::Stopped);
    assert_eq!(camera.in_flight(), 0);

    let returned: Vec<Request> = rx.try_iter().collect();
    assert_eq!(returned.len(), 4);
    for request in &returned {
        assert_eq!(request.status(), RequestStatus::Cancelled);
        assert!(request.metadata().is_empty());
        assert!(!request.buffers()[0].buffer().is_in_flight());
    }

    // Nothing completes after stop returns
    std::thread::sleep(Duration::from_millis(100));
    assert!(rx.try_recv().is_err());
}

#[test]
fn unvalidated_zero_size_configuration_is_rejected() {
    let manager = manager();
    let mut camera = manager.cameras()[0].acquire().unwrap();
    let mut config = camera.generate_configuration(&[StreamRole::Viewfinder]);
    config.at_mut(0).unwrap().size = Size::new(0, 0);

    assert!(matches!(
        camera.configure(&mut config),
        Err(CaptureError::Configuration(_))
    ));
    assert_eq!(camera.state(), CameraState::Acquired);
}

#[test]
fn second_owner_gets_busy() {
    let manager = manager();
    let first = manager.cameras()[0].clone();
    let second = manager.get(first.id()).unwrap();

    let _camera = first.acquire().unwrap();
    assert!(matches!(second.acquire(), Err(CaptureError::Busy(_))));
}

#[test]
fn queue_rejects_requests_that_are_not_ready() {
    let manager = manager();
    let mut camera = manager.cameras()[0].acquire().unwrap();
    let (_allocator, _stream, mut requests) = prepare(&mut camera, Some(Duration::from_secs(1)));
    camera.start().unwrap();

    let empty = camera.create_request(99).unwrap();
    let rejected = camera.queue_request(empty).unwrap_err();
    assert!(matches!(rejected.error, CaptureError::Binding(_)));
    assert_eq!(rejected.request.cookie(), 99);

    let request = requests.remove(0);
    camera.queue_request(request).unwrap();
    camera.stop();
}

#[test]
fn queue_rejects_buffers_from_an_earlier_configuration() {
    let manager = manager();
    let mut camera = manager.cameras()[0].acquire().unwrap();

    let mut small = camera.generate_configuration(&[StreamRole::Viewfinder]);
    small.at_mut(0).unwrap().size = Size::new(64, 64);
    camera.validate(&mut small);
    camera.configure(&mut small).unwrap();
    let stream = small.get(0).unwrap().stream().unwrap();
    let mut allocator = FrameBufferAllocator::new(BUDGET);
    let buffer = allocator.allocate(small.get(0).unwrap()).unwrap()[0].clone();
    let mut request = camera.create_request(0).unwrap();
    request.add_buffer(stream, &buffer).unwrap();

    let mut large = camera.generate_configuration(&[StreamRole::Viewfinder]);
    large.at_mut(0).unwrap().size = Size::new(1920, 1080);
    camera.validate(&mut large);
    camera.configure(&mut large).unwrap();
    assert_eq!(large.get(0).unwrap().stream(), Some(stream));
    camera.start().unwrap();

    let rejected = camera.queue_request(request).unwrap_err();
    assert!(matches!(rejected.error, CaptureError::Binding(_)));
    assert_eq!(rejected.request.status(), RequestStatus::Built);
    assert!(!buffer.is_in_flight());
    camera.stop();
}

#[test]
fn device_loss_cancels_and_stops() {
    let manager = manager();
    let device = manager.cameras()[0].clone();
    let mut camera = device.acquire().unwrap();
    let (_allocator, _stream, requests) = prepare(&mut camera, Some(Duration::from_secs(1)));

    let (tx, rx) = flume::unbounded();
    camera.set_request_completed(move |request| {
        let _ = tx.send(request);
    });
    camera.start().unwrap();
    for request in requests {
        camera.queue_request(request).unwrap();
    }

    device.disconnect();
    for _ in 0..4 {
        let request = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(request.status(), RequestStatus::Cancelled);
    }

    assert!(matches!(camera.start(), Err(CaptureError::State(_))));
    assert_eq!(camera.state(), CameraState::Stopped);
    assert_eq!(camera.in_flight(), 0);
}
