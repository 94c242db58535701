use std::fmt;
use std::time::Instant;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Reference point for frame timestamps
static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since the first timestamp taken in this process.
pub fn monotonic_ns() -> u64 {
    CLOCK_EPOCH.elapsed().as_nanos() as u64
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Xrgb8888,
    Yuyv4,
    Mjpeg,
    Nv12,
    /// 10-bit Bayer RGGB, unpacked into 16-bit containers
    Srggb10,
}

impl PixelFormat {
    pub fn fourcc(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB3",
            PixelFormat::Bgr24 => "BGR3",
            PixelFormat::Xrgb8888 => "XR24",
            PixelFormat::Yuyv4 => "YUYV",
            PixelFormat::Mjpeg => "MJPG",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Srggb10 => "RG10",
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    pub fn is_raw(self) -> bool {
        matches!(self, PixelFormat::Srggb10)
    }

    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Nv12 => 2,
            _ => 1,
        }
    }

    /// Bytes per line of the first plane before any hardware alignment.
    /// Compressed formats have no stride.
    pub fn min_stride(self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => width * 3,
            PixelFormat::Xrgb8888 => width * 4,
            PixelFormat::Yuyv4 | PixelFormat::Srggb10 => width * 2,
            PixelFormat::Nv12 => width,
            PixelFormat::Mjpeg => 0,
        }
    }

    /// Plane layout of one frame at `size` with the given first-plane stride.
    pub fn frame_layout(self, size: Size, stride: u32) -> Vec<Plane> {
        match self {
            PixelFormat::Mjpeg => vec![Plane {
                offset: 0,
                length: size.width * size.height * 2,
                stride: 0,
            }],
            PixelFormat::Nv12 => {
                let luma = stride * size.height;
                let chroma = stride * size.height.div_ceil(2);
                vec![
                    Plane {
                        offset: 0,
                        length: luma,
                        stride,
                    },
                    Plane {
                        offset: luma,
                        length: chroma,
                        stride,
                    },
                ]
            }
            _ => vec![Plane {
                offset: 0,
                length: stride * size.height,
                stride,
            }],
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fourcc())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Location of one plane inside a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub offset: u32,
    pub length: u32,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Not yet filled by the sensor
    Pending,
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneMetadata {
    pub bytes_used: u32,
}

/// Completion record of one buffer
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub status: FrameStatus,
    pub sequence: u32,
    /// Sensor timestamp in nanoseconds
    pub timestamp: u64,
    planes: Vec<PlaneMetadata>,
}

impl FrameMetadata {
    pub(crate) fn with_planes(count: usize) -> Self {
        Self {
            status: FrameStatus::Pending,
            sequence: 0,
            timestamp: 0,
            planes: vec![PlaneMetadata::default(); count],
        }
    }

    pub fn planes(&self) -> &[PlaneMetadata] {
        &self.planes
    }

    pub(crate) fn planes_mut(&mut self) -> &mut [PlaneMetadata] {
        &mut self.planes
    }

    /// Back to the pending state. Keeps the plane vector.
    pub(crate) fn reset(&mut self) {
        self.status = FrameStatus::Pending;
        self.sequence = 0;
        self.timestamp = 0;
        self.planes.iter_mut().for_each(|p| p.bytes_used = 0);
    }
}

impl fmt::Display for FrameMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq: {:06} timestamp: {} bytesused: ",
            self.sequence, self.timestamp
        )?;
        for (i, plane) in self.planes.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", plane.bytes_used)?;
        }
        Ok(())
    }
}
