//! Frame buffer pool
//!
//! Buffers are mapped once per stream at setup time and handed out as cheap
//! reference-counted handles. Which request currently holds a buffer is tracked
//! in a per-stream ownership table indexed by buffer index, so the same buffer
//! can never be bound into two requests or freed while the sensor is filling it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use memmap2::MmapMut;
use tracing::{debug, info, instrument};

use crate::capture::config::{StreamConfiguration, StreamId};
use crate::capture::frame::Plane;
use crate::error::{CaptureError, Result};

/// Owner value of a slot nobody holds
const UNBOUND: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub stream: StreamId,
    pub index: usize,
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream, self.index)
    }
}

#[derive(Default)]
struct Lease {
    owner: AtomicU64,
    in_flight: AtomicBool,
}

/// Buffer index -> owning request id for one stream
pub(crate) struct BufferTable {
    stream: StreamId,
    slots: Box<[CachePadded<Lease>]>,
}

impl BufferTable {
    fn new(stream: StreamId, count: usize) -> Self {
        Self {
            stream,
            slots: (0..count).map(|_| CachePadded::new(Lease::default())).collect(),
        }
    }

    /// Bind slot `index` to `request`. On conflict returns the current owner.
    pub(crate) fn claim(&self, index: usize, request: u64) -> std::result::Result<(), u64> {
        match self.slots[index]
            .owner
            .compare_exchange(UNBOUND, request, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(owner) if owner == request => Ok(()),
            Err(owner) => Err(owner),
        }
    }

    /// Unbind slot `index` if `request` still owns it.
    pub(crate) fn release(&self, index: usize, request: u64) {
        let slot = &self.slots[index];
        if slot
            .owner
            .compare_exchange(request, UNBOUND, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            slot.in_flight.store(false, Ordering::Release);
        }
    }

    pub(crate) fn owner(&self, index: usize) -> Option<u64> {
        match self.slots[index].owner.load(Ordering::Acquire) {
            UNBOUND => None,
            owner => Some(owner),
        }
    }

    pub(crate) fn set_in_flight(&self, index: usize, in_flight: bool) {
        self.slots[index].in_flight.store(in_flight, Ordering::Release);
    }

    pub(crate) fn is_in_flight(&self, index: usize) -> bool {
        self.slots[index].in_flight.load(Ordering::Acquire)
    }

    fn in_flight_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.in_flight.load(Ordering::Acquire))
            .count()
    }
}

struct BufferInner {
    id: BufferId,
    planes: Vec<Plane>,
    memory: MmapMut,
    table: Arc<BufferTable>,
}

/// Handle to one pooled buffer. Clones refer to the same memory.
#[derive(Clone)]
pub struct FrameBuffer {
    inner: Arc<BufferInner>,
}

impl FrameBuffer {
    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn stream(&self) -> StreamId {
        self.inner.id.stream
    }

    pub fn planes(&self) -> &[Plane] {
        &self.inner.planes
    }

    pub fn len(&self) -> usize {
        self.inner.planes.iter().map(|p| p.length as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Image memory of plane `index`.
    pub fn plane_data(&self, index: usize) -> Option<&[u8]> {
        let plane = self.inner.planes.get(index)?;
        let start = plane.offset as usize;
        self.inner.memory.get(start..start + plane.length as usize)
    }

    /// Id of the request this buffer is bound to, if any.
    pub fn owner(&self) -> Option<u64> {
        self.inner.table.owner(self.inner.id.index)
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.table.is_in_flight(self.inner.id.index)
    }

    pub(crate) fn claim(&self, request: u64) -> std::result::Result<(), u64> {
        self.inner.table.claim(self.inner.id.index, request)
    }

    pub(crate) fn release(&self, request: u64) {
        self.inner.table.release(self.inner.id.index, request)
    }

    pub(crate) fn set_in_flight(&self, in_flight: bool) {
        self.inner.table.set_in_flight(self.inner.id.index, in_flight)
    }

    pub(crate) fn same_as(&self, other: &FrameBuffer) -> bool {
        Arc::ptr_eq(&self.inner.table, &other.inner.table) && self.inner.id == other.inner.id
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("id", &self.inner.id)
            .field("planes", &self.inner.planes.len())
            .field("owner", &self.owner())
            .finish()
    }
}

struct StreamBuffers {
    table: Arc<BufferTable>,
    buffers: Vec<FrameBuffer>,
    bytes: usize,
}

/// Pool of frame buffers for the streams of one configured camera.
pub struct FrameBufferAllocator {
    streams: BTreeMap<StreamId, StreamBuffers>,
    budget: usize,
    allocated: usize,
}

impl FrameBufferAllocator {
    /// Pool limited to `budget` bytes of mapped memory across all streams.
    pub fn new(budget: usize) -> Self {
        Self {
            streams: BTreeMap::new(),
            budget,
            allocated: 0,
        }
    }

    /// Map `buffer_count` buffers laid out as `cfg` describes.
    #[instrument(skip(self, cfg), fields(stream = ?cfg.stream(), config = %cfg))]
    pub fn allocate(&mut self, cfg: &StreamConfiguration) -> Result<&[FrameBuffer]> {
        let stream = cfg.stream().ok_or_else(|| {
            CaptureError::Allocation("stream configuration has not been applied".into())
        })?;
        if self.streams.contains_key(&stream) {
            return Err(CaptureError::Allocation(format!(
                "buffers for {stream} already allocated"
            )));
        }
        if cfg.buffer_count == 0 || cfg.frame_size == 0 {
            return Err(CaptureError::Allocation(format!("{stream} is unconfigured")));
        }

        let page = page_size::get();
        let mapping = (cfg.frame_size as usize).div_ceil(page) * page;
        let total = mapping * cfg.buffer_count as usize;
        if self.allocated + total > self.budget {
            return Err(CaptureError::Allocation(format!(
                "{total} bytes for {stream} exceed the remaining budget of {} bytes",
                self.budget - self.allocated
            )));
        }

        let table = Arc::new(BufferTable::new(stream, cfg.buffer_count as usize));
        let planes = cfg.planes();
        let mut buffers = Vec::with_capacity(cfg.buffer_count as usize);
        for index in 0..cfg.buffer_count as usize {
            let memory = MmapMut::map_anon(mapping)
                .map_err(|e| CaptureError::Allocation(format!("{stream}: {e}")))?;
            buffers.push(FrameBuffer {
                inner: Arc::new(BufferInner {
                    id: BufferId { stream, index },
                    planes: planes.clone(),
                    memory,
                    table: table.clone(),
                }),
            });
        }

        self.allocated += total;
        info!(
            buffers = buffers.len(),
            bytes = total,
            "Allocated buffers for {}",
            stream
        );

        let entry = self.streams.entry(stream).or_insert(StreamBuffers {
            table,
            buffers,
            bytes: total,
        });
        Ok(entry.buffers.as_slice())
    }

    pub fn buffers(&self, stream: StreamId) -> &[FrameBuffer] {
        self.streams
            .get(&stream)
            .map(|s| s.buffers.as_slice())
            .unwrap_or(&[])
    }

    /// Release every buffer of `stream`. Handles still held by requests keep
    /// their memory alive until those requests drop them.
    #[instrument(skip(self))]
    pub fn free(&mut self, stream: StreamId) -> Result<()> {
        let Some(entry) = self.streams.get(&stream) else {
            return Err(CaptureError::State(format!("no buffers allocated for {stream}")));
        };
        let in_flight = entry.table.in_flight_count();
        if in_flight > 0 {
            return Err(CaptureError::State(format!(
                "{in_flight} buffers of {} still in flight",
                entry.table.stream
            )));
        }
        if let Some(entry) = self.streams.remove(&stream) {
            self.allocated -= entry.bytes;
            debug!(bytes = entry.bytes, "Freed buffers for {}", stream);
        }
        Ok(())
    }

    pub fn allocated(&self) -> bool {
        !self.streams.is_empty()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::config::StreamRole;
    use crate::capture::frame::{PixelFormat, Size};

    fn applied(stream: u32, count: u32) -> StreamConfiguration {
        let mut cfg = StreamConfiguration::new(
            StreamRole::Viewfinder,
            PixelFormat::Nv12,
            Size::new(64, 64),
            count,
        );
        cfg.stride = 64;
        cfg.frame_size = cfg.planes().iter().map(|p| p.length).sum();
        cfg.set_stream(StreamId(stream));
        cfg
    }

    #[test]
    fn allocates_configured_count() {
        let mut allocator = FrameBufferAllocator::new(usize::MAX);
        let buffers = allocator.allocate(&applied(0, 4)).unwrap();
        assert_eq!(buffers.len(), 4);
        assert_eq!(buffers[0].planes().len(), 2);
        assert_eq!(buffers[0].plane_data(1).unwrap().len(), 64 * 32);
        assert!(buffers.iter().all(|b| b.owner().is_none()));
    }

    #[test]
    fn streams_never_share_buffers() {
        let mut allocator = FrameBufferAllocator::new(usize::MAX);
        allocator.allocate(&applied(0, 2)).unwrap();
        allocator.allocate(&applied(1, 3)).unwrap();
        let first = allocator.buffers(StreamId(0));
        let second = allocator.buffers(StreamId(1));
        assert_eq!(second.len(), 3);
        for a in first {
            assert!(second.iter().all(|b| !a.same_as(b)));
        }
    }

    #[test]
    fn unapplied_descriptor_is_rejected() {
        let mut allocator = FrameBufferAllocator::new(usize::MAX);
        let cfg = StreamConfiguration::new(
            StreamRole::Viewfinder,
            PixelFormat::Nv12,
            Size::new(64, 64),
            4,
        );
        assert!(matches!(
            allocator.allocate(&cfg),
            Err(CaptureError::Allocation(_))
        ));
    }

    #[test]
    fn budget_exhaustion_is_an_allocation_error() {
        let mut allocator = FrameBufferAllocator::new(page_size::get());
        assert!(matches!(
            allocator.allocate(&applied(0, 4)),
            Err(CaptureError::Allocation(_))
        ));
        assert!(!allocator.allocated());
    }

    #[test]
    fn free_refuses_while_in_flight() {
        let mut allocator = FrameBufferAllocator::new(usize::MAX);
        let buffer = allocator.allocate(&applied(0, 1)).unwrap()[0].clone();
        buffer.claim(7).unwrap();
        buffer.set_in_flight(true);
        assert!(matches!(
            allocator.free(StreamId(0)),
            Err(CaptureError::State(_))
        ));
        buffer.set_in_flight(false);
        allocator.free(StreamId(0)).unwrap();
        assert_eq!(allocator.allocated_bytes(), 0);
        assert!(allocator.buffers(StreamId(0)).is_empty());
    }

    #[test]
    fn claim_is_exclusive() {
        let mut allocator = FrameBufferAllocator::new(usize::MAX);
        let buffer = allocator.allocate(&applied(0, 1)).unwrap()[0].clone();
        buffer.claim(1).unwrap();
        assert_eq!(buffer.claim(2), Err(1));
        buffer.release(2);
        assert_eq!(buffer.owner(), Some(1));
        buffer.release(1);
        assert_eq!(buffer.owner(), None);
        buffer.claim(2).unwrap();
    }
}
