//! Stream descriptors, camera configurations and the rules that validate them

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::frame::{PixelFormat, Plane, Size};
use crate::error::{CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamRole {
    Raw,
    Viewfinder,
    StillCapture,
    VideoRecording,
}

/// Handle of a configured stream, valid for the configuration that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// One stream descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfiguration {
    pub role: StreamRole,
    pub pixel_format: PixelFormat,
    pub size: Size,
    pub buffer_count: u32,
    /// First-plane stride, filled in by validation
    pub stride: u32,
    /// Total bytes of one frame, filled in by validation
    pub frame_size: u32,
    stream: Option<StreamId>,
}

impl StreamConfiguration {
    pub fn new(role: StreamRole, pixel_format: PixelFormat, size: Size, buffer_count: u32) -> Self {
        Self {
            role,
            pixel_format,
            size,
            buffer_count,
            stride: 0,
            frame_size: 0,
            stream: None,
        }
    }

    /// The stream this descriptor was applied to, once the camera is configured.
    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    pub(crate) fn set_stream(&mut self, stream: StreamId) {
        self.stream = Some(stream);
    }

    pub fn planes(&self) -> Vec<Plane> {
        self.pixel_format.frame_layout(self.size, self.stride)
    }
}

impl fmt::Display for StreamConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.size, self.pixel_format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationStatus {
    Valid,
    /// Some values were changed to the closest supported ones
    Adjusted,
}

/// Ordered set of stream descriptors plus the sensor frame duration.
///
/// Any mutable access drops the validated mark, so a configuration edited after
/// validation has to be validated again before the camera accepts it.
#[derive(Debug, Clone)]
pub struct CameraConfiguration {
    streams: Vec<StreamConfiguration>,
    frame_duration: Duration,
    validated: bool,
}

impl CameraConfiguration {
    pub(crate) fn new(frame_duration: Duration) -> Self {
        Self {
            streams: Vec::new(),
            frame_duration,
            validated: false,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StreamConfiguration> {
        self.streams.get(index)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut StreamConfiguration> {
        self.validated = false;
        self.streams.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamConfiguration> {
        self.streams.iter()
    }

    pub fn push(&mut self, stream: StreamConfiguration) {
        self.validated = false;
        self.streams.push(stream);
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    pub fn set_frame_duration(&mut self, frame_duration: Duration) {
        self.validated = false;
        self.frame_duration = frame_duration;
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub(crate) fn streams_mut(&mut self) -> &mut [StreamConfiguration] {
        &mut self.streams
    }
}

impl<'a> IntoIterator for &'a CameraConfiguration {
    type Item = &'a StreamConfiguration;
    type IntoIter = std::slice::Iter<'a, StreamConfiguration>;

    fn into_iter(self) -> Self::IntoIter {
        self.streams.iter()
    }
}

/// Hardware-supported values of a sensor
#[derive(Debug, Clone)]
pub struct SensorCapabilities {
    pub formats: Vec<PixelFormat>,
    pub min_size: Size,
    pub max_size: Size,
    /// Width/height granularity
    pub size_step: Size,
    pub stride_alignment: u32,
    pub min_buffers: u32,
    pub max_buffers: u32,
    pub max_streams: usize,
    pub min_frame_duration: Duration,
    pub max_frame_duration: Duration,
}

impl SensorCapabilities {
    pub fn supports(&self, format: PixelFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn default_frame_duration(&self) -> Duration {
        Duration::from_micros(33_333).clamp(self.min_frame_duration, self.max_frame_duration)
    }

    /// Library-chosen descriptor for a role, already validated.
    pub fn default_stream(&self, role: StreamRole) -> StreamConfiguration {
        let (size, buffers) = match role {
            StreamRole::Raw | StreamRole::StillCapture => (self.max_size, 4),
            StreamRole::Viewfinder => (Size::new(640, 480), 4),
            StreamRole::VideoRecording => (Size::new(1920, 1080), 4),
        };
        // A role without a usable format keeps a placeholder; validate drops it
        let format = self.default_format(role).unwrap_or(PixelFormat::Nv12);
        let mut cfg = StreamConfiguration::new(role, format, size, buffers);
        self.adjust(&mut cfg);
        cfg
    }

    /// Preferred format for `role`, or None when the sensor has nothing usable
    /// for it.
    fn default_format(&self, role: StreamRole) -> Option<PixelFormat> {
        let preferred: &[PixelFormat] = match role {
            StreamRole::Raw => &[PixelFormat::Srggb10],
            StreamRole::Viewfinder => &[
                PixelFormat::Xrgb8888,
                PixelFormat::Rgb24,
                PixelFormat::Yuyv4,
                PixelFormat::Nv12,
            ],
            StreamRole::StillCapture => &[PixelFormat::Mjpeg, PixelFormat::Nv12, PixelFormat::Rgb24],
            StreamRole::VideoRecording => &[PixelFormat::Nv12, PixelFormat::Yuyv4],
        };
        preferred
            .iter()
            .copied()
            .find(|f| self.supports(*f))
            .or_else(|| {
                self.formats
                    .iter()
                    .copied()
                    .find(|f| f.is_raw() == (role == StreamRole::Raw))
            })
    }

    fn format_allowed(&self, role: StreamRole, format: PixelFormat) -> bool {
        self.supports(format) && format.is_raw() == (role == StreamRole::Raw)
    }

    fn stride_for(&self, format: PixelFormat, width: u32) -> u32 {
        let stride = format.min_stride(width);
        let align = self.stride_alignment.max(1);
        stride.div_ceil(align) * align
    }

    /// Move every field of `cfg` to the closest supported value. Returns true when
    /// anything user-visible changed.
    pub(crate) fn adjust(&self, cfg: &mut StreamConfiguration) -> bool {
        let mut adjusted = false;

        if !self.format_allowed(cfg.role, cfg.pixel_format) {
            if let Some(format) = self.default_format(cfg.role) {
                cfg.pixel_format = format;
                adjusted = true;
            }
        }

        let size = Size::new(
            fit(cfg.size.width, self.min_size.width, self.max_size.width, self.size_step.width),
            fit(cfg.size.height, self.min_size.height, self.max_size.height, self.size_step.height),
        );
        if size != cfg.size {
            cfg.size = size;
            adjusted = true;
        }

        let buffers = cfg.buffer_count.clamp(self.min_buffers, self.max_buffers);
        if buffers != cfg.buffer_count {
            cfg.buffer_count = buffers;
            adjusted = true;
        }

        // Derived fields are always recomputed and never count as an adjustment
        cfg.stride = self.stride_for(cfg.pixel_format, cfg.size.width);
        cfg.frame_size = cfg.planes().iter().map(|p| p.length).sum();
        adjusted
    }

    /// Clamp and round `config` into something the hardware accepts. Never fails.
    /// Streams whose role has no usable format are dropped.
    pub fn validate(&self, config: &mut CameraConfiguration) -> ConfigurationStatus {
        let mut status = ConfigurationStatus::Valid;

        let requested = config.streams.len();
        config
            .streams
            .retain(|cfg| self.default_format(cfg.role).is_some());
        if config.streams.len() != requested {
            status = ConfigurationStatus::Adjusted;
        }

        if config.streams.len() > self.max_streams {
            config.streams.truncate(self.max_streams);
            status = ConfigurationStatus::Adjusted;
        }

        for cfg in config.streams.iter_mut() {
            if self.adjust(cfg) {
                status = ConfigurationStatus::Adjusted;
            }
        }

        let duration = config
            .frame_duration
            .clamp(self.min_frame_duration, self.max_frame_duration);
        if duration != config.frame_duration {
            config.frame_duration = duration;
            status = ConfigurationStatus::Adjusted;
        }

        config.validated = true;
        status
    }

    /// Strict check applied by `Camera::configure`; nothing is adjusted.
    pub fn check(&self, config: &CameraConfiguration) -> Result<()> {
        if !config.validated {
            return Err(CaptureError::Configuration(
                "configuration has not been validated".into(),
            ));
        }
        if config.streams.is_empty() {
            return Err(CaptureError::Configuration("no streams requested".into()));
        }
        if config.streams.len() > self.max_streams {
            return Err(CaptureError::Configuration(format!(
                "{} streams requested, at most {} supported",
                config.streams.len(),
                self.max_streams
            )));
        }
        if config.frame_duration < self.min_frame_duration
            || config.frame_duration > self.max_frame_duration
        {
            return Err(CaptureError::Configuration(format!(
                "frame duration {:?} outside {:?}..={:?}",
                config.frame_duration, self.min_frame_duration, self.max_frame_duration
            )));
        }
        for (index, cfg) in config.streams.iter().enumerate() {
            self.check_stream(cfg)
                .map_err(|reason| CaptureError::Configuration(format!("stream {index}: {reason}")))?;
        }
        Ok(())
    }

    fn check_stream(&self, cfg: &StreamConfiguration) -> std::result::Result<(), String> {
        if !self.format_allowed(cfg.role, cfg.pixel_format) {
            return Err(format!("format {} not usable for {:?}", cfg.pixel_format, cfg.role));
        }
        let size_ok = cfg.size.width >= self.min_size.width
            && cfg.size.width <= self.max_size.width
            && cfg.size.height >= self.min_size.height
            && cfg.size.height <= self.max_size.height;
        if cfg.size.is_empty() || !size_ok {
            return Err(format!(
                "size {} outside {}..={}",
                cfg.size, self.min_size, self.max_size
            ));
        }
        if (cfg.size.width - self.min_size.width) % self.size_step.width.max(1) != 0
            || (cfg.size.height - self.min_size.height) % self.size_step.height.max(1) != 0
        {
            return Err(format!("size {} not aligned to {}", cfg.size, self.size_step));
        }
        if cfg.buffer_count < self.min_buffers || cfg.buffer_count > self.max_buffers {
            return Err(format!(
                "buffer count {} outside {}..={}",
                cfg.buffer_count, self.min_buffers, self.max_buffers
            ));
        }
        if cfg.stride != self.stride_for(cfg.pixel_format, cfg.size.width) {
            return Err(format!("stride {} does not match hardware", cfg.stride));
        }
        let expected: u32 = cfg.planes().iter().map(|p| p.length).sum();
        if cfg.frame_size != expected {
            return Err(format!("frame size {} does not match hardware", cfg.frame_size));
        }
        Ok(())
    }
}

/// Clamp into `min..=max` and snap to the nearest `step` counted from `min`.
fn fit(value: u32, min: u32, max: u32, step: u32) -> u32 {
    let step = step.max(1);
    let value = value.clamp(min, max);
    let snapped = (value - min + step / 2) / step * step + min;
    if snapped > max {
        snapped - step
    } else {
        snapped
    }
}
