// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use canonical_error::{CanonicalError, aborted_error, deadline_exceeded_error,
                      failed_precondition_error, internal_error,
                      invalid_argument_error, not_found_error,
                      permission_denied_error, unavailable_error};
use thiserror::Error;

use crate::session_manager::CaptureSessionState;

/// Why the camera device reported an error while opening or while open.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceErrorReason {
    InUse,
    MaxCamerasInUse,
    Disabled,
    DeviceError,
    ServiceError,
}

impl fmt::Display for DeviceErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            DeviceErrorReason::InUse => "camera in use",
            DeviceErrorReason::MaxCamerasInUse => "max cameras in use",
            DeviceErrorReason::Disabled => "camera disabled",
            DeviceErrorReason::DeviceError => "camera device error",
            DeviceErrorReason::ServiceError => "camera service error",
        };
        write!(f, "{}", text)
    }
}

/// Why the hardware dropped a single capture request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureFailureReason {
    /// The hardware hit an error while producing the frame.
    Error,
    /// The request was flushed before completion (session closed under it).
    Flushed,
}

impl fmt::Display for CaptureFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CaptureFailureReason::Error => write!(f, "error"),
            CaptureFailureReason::Flushed => write!(f, "flushed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera permission not granted")]
    PermissionDenied,

    #[error("no front-facing camera available")]
    NoCameraAvailable,

    #[error("camera device error: {0}")]
    Device(DeviceErrorReason),

    #[error("capture session configuration failed")]
    SessionConfigureFailed,

    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CaptureSessionState,
    },

    #[error("capture failed: {0}")]
    CaptureFailed(CaptureFailureReason),

    #[error("camera device lost")]
    DeviceLost,

    #[error("could not decode image: {0}")]
    Decode(String),

    #[error("could not encode image: {0}")]
    Encode(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<CaptureError> for CanonicalError {
    fn from(err: CaptureError) -> CanonicalError {
        let msg = err.to_string();
        match err {
            CaptureError::PermissionDenied => permission_denied_error(&msg),
            CaptureError::NoCameraAvailable => not_found_error(&msg),
            CaptureError::Device(_) | CaptureError::DeviceLost |
            CaptureError::SessionConfigureFailed => unavailable_error(&msg),
            CaptureError::InvalidState { .. } => failed_precondition_error(&msg),
            CaptureError::CaptureFailed(_) => aborted_error(&msg),
            CaptureError::Decode(_) | CaptureError::InvalidArgument(_) =>
                invalid_argument_error(&msg),
            CaptureError::Timeout(_) => deadline_exceeded_error(&msg),
            CaptureError::Encode(_) | CaptureError::Io(_) => internal_error(&msg),
        }
    }
}
