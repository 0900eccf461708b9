// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::Path;

use log::warn;

use crate::capture_device::CaptureDevice;
use crate::error::{CaptureError, CaptureFailureReason};
use crate::photo_store;
use crate::pipeline::ProcessedPhoto;
use crate::session_manager::{CaptureSessionManager, CaptureSessionState};
use crate::status::StatusLog;

/// Turns capture button presses into captures and reports
/// progress as status messages.
pub struct CaptureOrchestrator<D: CaptureDevice> {
    manager: CaptureSessionManager<D>,
    status: StatusLog,
    capture_enabled: bool,
}

// Status text for each failure kind.
fn describe_error(err: &CaptureError) -> String {
    match err {
        CaptureError::PermissionDenied =>
            "Camera permission not granted. Grant it and try again".to_string(),
        CaptureError::NoCameraAvailable =>
            "No front-facing camera found".to_string(),
        CaptureError::Device(reason) =>
            format!("Camera unavailable: {}", reason),
        CaptureError::SessionConfigureFailed =>
            "Could not configure the camera session".to_string(),
        CaptureError::InvalidState { .. } =>
            "Camera not ready, please wait".to_string(),
        CaptureError::CaptureFailed(CaptureFailureReason::Flushed) =>
            "Capture was cancelled".to_string(),
        CaptureError::CaptureFailed(reason) =>
            format!("Capture failed: {}", reason),
        CaptureError::DeviceLost =>
            "Camera disconnected. Press start to reconnect".to_string(),
        CaptureError::Decode(e) => format!("Could not read captured image: {}", e),
        CaptureError::Encode(e) => format!("Could not encode photo: {}", e),
        CaptureError::Io(e) => format!("Could not save photo: {}", e),
        CaptureError::Timeout(what) => format!("Camera timed out waiting for {}", what),
        CaptureError::InvalidArgument(e) => format!("Processing error: {}", e),
    }
}

impl<D: CaptureDevice> CaptureOrchestrator<D> {
    pub fn new(manager: CaptureSessionManager<D>) -> Self {
        CaptureOrchestrator { manager, status: StatusLog::new(), capture_enabled: false }
    }

    pub fn status(&self) -> &StatusLog {
        &self.status
    }

    pub fn manager(&self) -> &CaptureSessionManager<D> {
        &self.manager
    }

    /// Whether the capture button should accept presses.
    pub fn capture_enabled(&self) -> bool {
        self.capture_enabled
    }

    /// Brings the camera up. Can be called again after a failure.
    pub async fn start(&mut self) -> Result<(), CaptureError> {
        self.status.update("Initializing camera");
        let result = self.manager.initialize().await;
        match &result {
            Ok(()) => {
                self.status.update("Camera ready");
                self.capture_enabled = true;
            },
            Err(CaptureError::PermissionDenied) => {
                self.status.update("Camera permission required");
                self.capture_enabled = false;
            },
            Err(e) => {
                self.status.update(format!("Camera initialization failed: {}",
                                           describe_error(e)));
                self.capture_enabled = false;
            },
        }
        result
    }

    /// Handles one capture button press: capture, process, save, then reset
    /// the session for the next press. Progress is posted as each stage
    /// finishes.
    pub async fn on_capture_requested(&mut self) -> Result<ProcessedPhoto, CaptureError> {
        self.capture_enabled = false;
        self.status.update("Starting photo capture");
        let result = self.capture_and_process().await;
        if let Err(e) = &result {
            self.status.update(format!("Error: {}", describe_error(e)));
        }

        if self.manager.state() == CaptureSessionState::SessionReady {
            if let Err(e) = self.manager.reset_session().await {
                warn!("Session reset after capture failed: {}", e);
                self.status.update(format!("Camera reset failed: {}", describe_error(&e)));
            }
        }
        // A failed session is retried through capture_photo() or start(), so
        // the button stays usable either way.
        self.capture_enabled = true;
        result
    }

    pub async fn shutdown(&mut self) {
        self.capture_enabled = false;
        self.manager.shutdown().await;
        self.status.update("Camera closed");
    }

    async fn capture_and_process(&mut self) -> Result<ProcessedPhoto, CaptureError> {
        let frame = self.manager.capture_frame().await?;
        let frame_number = frame.frame_number();
        let raw_path = self.manager.pipeline().save_raw(frame)?;
        self.status.update(format!("Photo captured: {}", file_name(&raw_path)));

        self.status.update("Processing image");
        let photo = self.manager.pipeline().process_saved(&raw_path, frame_number)?;
        let size = photo_store::file_size(photo.path())
            .unwrap_or_else(|_| "unknown size".to_string());
        self.status.update(format!("Image processed and saved: {} ({})",
                                   file_name(photo.path()), size));
        self.status.update(format!("Location: {}", photo.path().display()));
        self.status.update("Process completed successfully");
        Ok(photo)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}
