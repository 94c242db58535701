//! Capture request state machine
//!
//! Built -> Queued -> {Completed, Cancelled}, and Completed -> Built through
//! [`Request::reuse`]. The recycling path keeps every binding and every vector it
//! owns, so a steady capture loop does not allocate per frame.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::capture::allocator::FrameBuffer;
use crate::capture::config::StreamId;
use crate::capture::controls::ControlList;
use crate::capture::frame::{FrameMetadata, FrameStatus};
use crate::error::{CaptureError, Result};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Built,
    Queued,
    Completed,
    Cancelled,
}

impl RequestStatus {
    fn code(self) -> char {
        match self {
            RequestStatus::Built => 'B',
            RequestStatus::Queued => 'Q',
            RequestStatus::Completed => 'C',
            RequestStatus::Cancelled => 'X',
        }
    }
}

/// A buffer bound to one stream of a request, with its completion record.
#[derive(Debug)]
pub struct BoundBuffer {
    stream: StreamId,
    buffer: FrameBuffer,
    metadata: FrameMetadata,
}

impl BoundBuffer {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut FrameMetadata {
        &mut self.metadata
    }
}

#[derive(Debug)]
pub struct Request {
    id: u64,
    cookie: u64,
    status: RequestStatus,
    buffers: Vec<BoundBuffer>,
    controls: ControlList,
    metadata: ControlList,
    queued_at: Option<Instant>,
}

impl Request {
    pub(crate) fn new(cookie: u64) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            cookie,
            status: RequestStatus::Built,
            buffers: Vec::new(),
            controls: ControlList::new(),
            metadata: ControlList::new(),
            queued_at: None,
        }
    }

    /// Process-unique id, used as the owner key in buffer tables.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Application value given at creation.
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Bind `buffer` as the target for `stream`.
    pub fn add_buffer(&mut self, stream: StreamId, buffer: &FrameBuffer) -> Result<()> {
        self.expect_status(RequestStatus::Built, "add a buffer")?;

        if buffer.stream() != stream {
            return Err(CaptureError::Binding(format!(
                "buffer {} belongs to {}, not {}",
                buffer.id(),
                buffer.stream(),
                stream
            )));
        }
        let slot = match self.buffers.binary_search_by_key(&stream, |b| b.stream) {
            Ok(_) => {
                return Err(CaptureError::Binding(format!(
                    "request {} already has a buffer for {}",
                    self.id, stream
                )))
            }
            Err(slot) => slot,
        };
        buffer.claim(self.id).map_err(|owner| {
            CaptureError::Binding(format!(
                "buffer {} is already bound to request {}",
                buffer.id(),
                owner
            ))
        })?;

        self.buffers.insert(
            slot,
            BoundBuffer {
                stream,
                buffer: buffer.clone(),
                metadata: FrameMetadata::with_planes(buffer.planes().len()),
            },
        );
        Ok(())
    }

    /// Unbind the buffer of `stream` so it can be bound elsewhere.
    pub fn remove_buffer(&mut self, stream: StreamId) -> Result<FrameBuffer> {
        self.expect_status(RequestStatus::Built, "remove a buffer")?;
        let index = self
            .buffers
            .binary_search_by_key(&stream, |b| b.stream)
            .map_err(|_| {
                CaptureError::Binding(format!("request {} has no buffer for {}", self.id, stream))
            })?;
        let bound = self.buffers.remove(index);
        bound.buffer.release(self.id);
        Ok(bound.buffer)
    }

    pub fn buffer(&self, stream: StreamId) -> Option<&BoundBuffer> {
        self.buffers
            .binary_search_by_key(&stream, |b| b.stream)
            .ok()
            .map(|index| &self.buffers[index])
    }

    /// Bindings ordered by stream.
    pub fn buffers(&self) -> &[BoundBuffer] {
        &self.buffers
    }

    pub fn has_buffers(&self) -> bool {
        !self.buffers.is_empty()
    }

    /// Per-frame controls applied by the sensor for this request.
    pub fn controls(&self) -> &ControlList {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut ControlList {
        &mut self.controls
    }

    /// Result metadata, populated only on completion.
    pub fn metadata(&self) -> &ControlList {
        &self.metadata
    }

    /// Recycle a completed request: clears metadata and controls, keeps bindings.
    pub fn reuse(&mut self) -> Result<()> {
        self.expect_status(RequestStatus::Completed, "reuse")?;
        self.metadata.clear();
        self.controls.clear();
        for bound in &mut self.buffers {
            bound.metadata.reset();
        }
        self.queued_at = None;
        self.status = RequestStatus::Built;
        Ok(())
    }

    fn expect_status(&self, expected: RequestStatus, operation: &str) -> Result<()> {
        if self.status != expected {
            return Err(CaptureError::State(format!(
                "cannot {operation} on request {} in {:?} state",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub(crate) fn mark_queued(&mut self) {
        self.status = RequestStatus::Queued;
        self.queued_at = Some(Instant::now());
        for bound in &self.buffers {
            bound.buffer.set_in_flight(true);
        }
    }

    /// Undo `mark_queued` for a request the driver never accepted.
    pub(crate) fn mark_unqueued(&mut self) {
        self.status = RequestStatus::Built;
        self.queued_at = None;
        self.land();
    }

    /// Return the request to the consumer as Completed. Result metadata must be
    /// filled in beforehand.
    pub(crate) fn mark_completed(&mut self) {
        self.status = RequestStatus::Completed;
        self.land();
    }

    /// Return the request to the consumer as Cancelled, with no metadata.
    pub(crate) fn mark_cancelled(&mut self) {
        self.status = RequestStatus::Cancelled;
        self.metadata.clear();
        for bound in &mut self.buffers {
            bound.metadata.reset();
            bound.metadata.status = FrameStatus::Cancelled;
        }
        self.land();
    }

    fn land(&mut self) {
        for bound in &self.buffers {
            bound.buffer.set_in_flight(false);
        }
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut [BoundBuffer] {
        &mut self.buffers
    }

    pub(crate) fn controls_and_metadata_mut(&mut self) -> (&ControlList, &mut ControlList) {
        (&self.controls, &mut self.metadata)
    }

    pub(crate) fn queued_at(&self) -> Option<Instant> {
        self.queued_at
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        for bound in &self.buffers {
            bound.buffer.release(self.id);
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request({}:{}:{})",
            self.id,
            self.status.code(),
            self.cookie
        )
    }
}
