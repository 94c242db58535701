pub mod allocator;
pub mod camera;
pub mod config;
pub mod controls;
pub mod frame;
pub mod manager;
pub mod request;
mod sensor;

pub use allocator::{BufferId, FrameBuffer, FrameBufferAllocator};
pub use camera::{Camera, CameraState, QueueRequestError};
pub use config::{
    CameraConfiguration, ConfigurationStatus, SensorCapabilities, StreamConfiguration, StreamId,
    StreamRole,
};
pub use controls::{ControlId, ControlList, ControlValue};
pub use frame::{FrameMetadata, FrameStatus, PixelFormat, Size};
pub use manager::{CameraDevice, CameraManager, CameraProperties, Location};
pub use request::{BoundBuffer, Request, RequestStatus};
