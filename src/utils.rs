use tracing::info;

use crate::capture::manager::{CameraDevice, CameraManager, Location};
use crate::error::{CaptureError, Result};

/// Human-readable camera name built from its properties
pub fn camera_name(camera: &CameraDevice) -> String {
    let properties = camera.properties();
    let mut name = match properties.location {
        Location::Front => "Internal front camera".to_string(),
        Location::Back => "Internal back camera".to_string(),
        Location::External => "External camera".to_string(),
    };
    if properties.location == Location::External && !properties.model.is_empty() {
        name.push_str(&format!(" '{}'", properties.model));
    }
    name.push_str(&format!(" ({})", camera.id()));
    name
}

/// Pick the camera named `id`, or the first enumerated one
pub fn select_camera(manager: &CameraManager, id: Option<&str>) -> Result<CameraDevice> {
    let camera = match id {
        Some(id) => manager
            .get(id)
            .ok_or_else(|| CaptureError::NotFound(id.to_string()))?,
        None => manager
            .cameras()
            .first()
            .cloned()
            .ok_or_else(|| CaptureError::NotFound("<any>".to_string()))?,
    };
    info!("Using camera: {}", camera_name(&camera));
    Ok(camera)
}
