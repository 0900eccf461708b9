// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use log::{debug, error, warn};

use crate::capture_device::{CameraId, CaptureDevice};
use crate::error::{CaptureError, DeviceErrorReason};

// Returns the camera whose lens faces the user:
// * No cameras at all, or none facing the user, is NoCameraAvailable.
// * If the camera service cannot be queried, the failure is reported as a
//   service fault.
// * With several front-facing cameras the first one listed wins.
pub fn select_front_camera<D>(device: &D) -> Result<CameraId, CaptureError>
where D: CaptureDevice + ?Sized
{
    let cameras = device.list_cameras().map_err(|e| {
        error!("Could not list cameras: {}", e);
        CaptureError::Device(DeviceErrorReason::ServiceError)
    })?;
    if cameras.is_empty() {
        warn!("No cameras found");
        return Err(CaptureError::NoCameraAvailable);
    }
    debug!("Available cameras: {}", cameras.iter()
           .map(|info| format!("{} ({:?})", info.id, info.facing))
           .collect::<Vec<_>>().join(", "));
    match device.find_front_facing() {
        Ok(Some(id)) => Ok(id),
        Ok(None) => {
            warn!("No front-facing camera among {} cameras", cameras.len());
            Err(CaptureError::NoCameraAvailable)
        },
        Err(e) => {
            error!("Could not query lens facing: {}", e);
            Err(CaptureError::Device(DeviceErrorReason::ServiceError))
        },
    }
}
