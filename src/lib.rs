pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod utils;

use std::path::Path;

use capture::config::StreamRole;
use capture::frame::PixelFormat;
use capture::manager::Location;
use config::builder::{ConfigBuilder, DefaultState};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use error::{CaptureError, Result};

/// Prefix of environment overrides, e.g. `CAMLOOP_SESSION__TIMEOUT_SECS=5`
pub const ENV_PREFIX: &str = "CAMLOOP";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub session: SessionConfig,
    /// Virtual sensors exposed by the camera manager, in enumeration order
    pub sensors: Vec<SensorConfig>,
    pub log_filter: String,
}

/// What to capture. Unset overrides keep the camera's defaults for the role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera id; the first enumerated camera when unset
    pub camera: Option<String>,
    pub roles: Vec<StreamRole>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixel_format: Option<PixelFormat>,
    pub buffer_count: Option<u32>,
    pub frame_rate: Option<u32>,
    /// Brightness control set on every request, -1.0..=1.0
    pub brightness: Option<f32>,
    pub memory_budget_mb: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub id: String,
    pub model: String,
    pub location: Location,
    pub max_width: u32,
    pub max_height: u32,
    pub formats: Vec<PixelFormat>,
    pub max_fps: u32,
    pub max_streams: usize,
    pub max_buffers: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            session: SessionConfig::default(),
            sensors: vec![SensorConfig::default()],
            log_filter: "camloop=info".into(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera: None,
            roles: vec![StreamRole::Viewfinder],
            width: None,
            height: None,
            pixel_format: None,
            buffer_count: None,
            frame_rate: None,
            brightness: None,
            memory_budget_mb: 256,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { timeout_secs: 3 }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            id: "virtual0".into(),
            model: "camloop-vs1".into(),
            location: Location::External,
            max_width: 1920,
            max_height: 1080,
            formats: vec![
                PixelFormat::Xrgb8888,
                PixelFormat::Yuyv4,
                PixelFormat::Nv12,
                PixelFormat::Mjpeg,
                PixelFormat::Srggb10,
            ],
            max_fps: 30,
            max_streams: 2,
            max_buffers: 8,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then `CAMLOOP_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
