// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::CanonicalError;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout_at};

use crate::capture_device::{CameraId, CaptureDevice, CaptureRequestSpec,
                            CapturedFrame, DeviceEvent, DeviceHandle,
                            EventReceiver, OutputSurfaceSpec, SessionHandle};
use crate::error::{CaptureError, DeviceErrorReason};
use crate::pipeline::{PhotoPipeline, ProcessedPhoto};
use crate::select_camera::select_front_camera;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureSessionState {
    Uninitialized,
    DeviceOpening,
    DeviceOpen,
    SessionConfiguring,
    SessionReady,
    Capturing,
    Resetting,
    Closed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Upper bound on the wait for any single open, configure or capture
    /// callback.
    pub callback_timeout: Duration,

    /// Pause between closing a session and configuring its replacement.
    /// Works around late image buffer release on some camera HALs; the
    /// minimum safe value is hardware dependent and needs tuning per device.
    pub settle_interval: Duration,

    pub surface: OutputSurfaceSpec,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            callback_timeout: Duration::from_secs(5),
            settle_interval: Duration::from_millis(500),
            surface: OutputSurfaceSpec::default(),
        }
    }
}

/// Drives a CaptureDevice through open, session configuration, capture and
/// reset. Owns the device and the session handles exclusively; every state
/// change happens in a `&mut self` method, and hardware callbacks are consumed
/// from a single event queue, so transitions are serialized.
pub struct CaptureSessionManager<D: CaptureDevice> {
    device: D,
    config: SessionConfig,
    pipeline: PhotoPipeline,

    state: CaptureSessionState,
    camera: Option<CameraId>,
    device_handle: Option<DeviceHandle>,
    session: Option<SessionHandle>,

    // Created per open; dropping it makes late callbacks from the device
    // fail to send.
    events: Option<EventReceiver>,

    // Set when the device disconnects or errors while open. Cleared once the
    // device has been brought up again.
    device_lost: bool,
    last_error: Option<String>,
}

fn hal_error(call: &str, err: CanonicalError) -> CaptureError {
    error!("Camera rejected {}: {}", call, err);
    CaptureError::Device(DeviceErrorReason::ServiceError)
}

impl<D: CaptureDevice> CaptureSessionManager<D> {
    pub fn new(device: D, config: SessionConfig, pipeline: PhotoPipeline) -> Self {
        CaptureSessionManager {
            device,
            config,
            pipeline,
            state: CaptureSessionState::Uninitialized,
            camera: None,
            device_handle: None,
            session: None,
            events: None,
            device_lost: false,
            last_error: None,
        }
    }

    /// Last known state. Callbacks queued since the last operation, and a
    /// capture whose caller gave up on it, are not reflected; see
    /// poll_events().
    pub fn state(&self) -> CaptureSessionState {
        self.state
    }

    /// Why the manager last entered Failed.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn pipeline(&self) -> &PhotoPipeline {
        &self.pipeline
    }

    /// Applies any hardware callbacks that arrived while no operation was
    /// running (e.g. a disconnect while idle) and returns the resulting state.
    pub fn poll_events(&mut self) -> CaptureSessionState {
        // Holding `&mut self` here means no capture_frame() call is running,
        // so a leftover Capturing state belongs to a dropped future.
        if self.state == CaptureSessionState::Capturing {
            warn!("Capture abandoned before completion");
            if let Some(session) = self.session {
                self.device.discard_pending_images(session);
            }
            self.set_state(CaptureSessionState::SessionReady);
        }
        while let Some(event) = self.events.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.handle_unsolicited(event);
        }
        self.state
    }

    /// Opens the front camera and configures a capture session. Valid from
    /// Uninitialized, and from Failed to retry.
    pub async fn initialize(&mut self) -> Result<(), CaptureError> {
        self.poll_events();
        match self.state {
            CaptureSessionState::Uninitialized | CaptureSessionState::Failed => (),
            state => return Err(CaptureError::InvalidState { operation: "initialize", state }),
        }
        // Leftovers from an earlier failed attempt.
        self.release_hardware().await;
        info!("Initializing capture session");
        match self.bring_up().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abandon(e).await),
        }
    }

    /// Takes one photo and runs it through the pipeline. Only valid in
    /// SessionReady; there is no queueing of overlapping requests.
    pub async fn capture_photo(&mut self) -> Result<ProcessedPhoto, CaptureError> {
        let frame = self.capture_frame().await?;
        // Processing failures leave the session usable.
        self.pipeline.process_frame(frame)
    }

    /// The capture half of capture_photo(): returns the frame as delivered,
    /// leaving processing to the caller. Dropping the returned future before
    /// it completes abandons the capture; the next call on the manager puts
    /// the session back to SessionReady and discards the pending frame.
    pub async fn capture_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        self.poll_events();
        if self.state != CaptureSessionState::SessionReady {
            if self.state == CaptureSessionState::Failed && self.device_lost {
                return Err(CaptureError::DeviceLost);
            }
            return Err(CaptureError::InvalidState { operation: "capture_photo",
                                                    state: self.state });
        }
        let session = match self.session {
            Some(session) => session,
            None => return Err(CaptureError::InvalidState { operation: "capture_photo",
                                                            state: self.state }),
        };
        let request = CaptureRequestSpec::still_capture(self.config.surface.id);
        self.set_state(CaptureSessionState::Capturing);
        info!("Starting photo capture");
        if let Err(e) = self.device.capture(session, &request) {
            self.set_state(CaptureSessionState::SessionReady);
            return Err(hal_error("capture", e));
        }
        let frame = match self.await_frame(session).await {
            Ok(frame) => frame,
            Err(CaptureError::DeviceLost) => {
                self.lose_device(None);
                return Err(CaptureError::DeviceLost);
            },
            Err(CaptureError::Device(reason)) => {
                self.lose_device(Some(reason));
                return Err(CaptureError::DeviceLost);
            },
            Err(e) => {
                warn!("Capture did not complete: {}", e);
                self.set_state(CaptureSessionState::SessionReady);
                return Err(e);
            },
        };
        self.set_state(CaptureSessionState::SessionReady);
        Ok(frame)
    }

    /// Closes the session, drops any frames not yet consumed, waits the
    /// settle interval, then configures a fresh session. Valid from
    /// SessionReady or Failed; from Failed with the device gone, the device is
    /// reopened as well.
    pub async fn reset_session(&mut self) -> Result<(), CaptureError> {
        self.poll_events();
        match self.state {
            CaptureSessionState::SessionReady | CaptureSessionState::Failed => (),
            state => return Err(CaptureError::InvalidState { operation: "reset_session",
                                                             state }),
        }
        info!("Resetting capture session");
        self.set_state(CaptureSessionState::Resetting);
        self.close_session().await;
        sleep(self.config.settle_interval).await;

        let result = if self.device_handle.is_some() && !self.device_lost {
            self.configure_session().await
        } else {
            self.close_device().await;
            self.bring_up().await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abandon(e).await),
        }
    }

    /// Releases the session and the device. Valid in any state; repeated calls
    /// do nothing.
    pub async fn shutdown(&mut self) {
        if self.state == CaptureSessionState::Closed {
            return;
        }
        info!("Shutting down capture session");
        self.release_hardware().await;
        self.set_state(CaptureSessionState::Closed);
    }

    fn set_state(&mut self, state: CaptureSessionState) {
        if self.state != state {
            debug!("Capture session {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn fail(&mut self, err: CaptureError) -> CaptureError {
        error!("Capture session failed: {}", err);
        self.last_error = Some(err.to_string());
        self.set_state(CaptureSessionState::Failed);
        err
    }

    fn is_current_device(&self, device: DeviceHandle) -> bool {
        self.device_handle == Some(device)
    }

    fn lose_device(&mut self, reason: Option<DeviceErrorReason>) {
        let detail = match reason {
            Some(reason) => format!("{}: {}", CaptureError::DeviceLost, reason),
            None => format!("{}: disconnected", CaptureError::DeviceLost),
        };
        self.device_lost = true;
        if self.state == CaptureSessionState::Closed {
            debug!("Ignoring {} after shutdown", detail);
            return;
        }
        error!("Capture session failed: {}", detail);
        self.last_error = Some(detail);
        self.set_state(CaptureSessionState::Failed);
    }

    fn handle_unsolicited(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Disconnected { device } if self.is_current_device(device) => {
                self.lose_device(None);
            },
            DeviceEvent::Error { device, reason } if self.is_current_device(device) => {
                self.lose_device(Some(reason));
            },
            DeviceEvent::ImageAvailable { session, frame } => {
                // Dropping the frame returns its buffer.
                debug!("Releasing unclaimed frame {} from {:?}",
                       frame.frame_number(), session);
            },
            other => debug!("Ignoring {:?}", other),
        }
    }

    async fn next_event(&mut self, deadline: Instant, waiting_for: &'static str)
                        -> Result<DeviceEvent, CaptureError> {
        let events = match self.events.as_mut() {
            Some(events) => events,
            None => return Err(CaptureError::DeviceLost),
        };
        let received = timeout_at(deadline, events.recv()).await;
        match received {
            Ok(Some(event)) => Ok(event),
            // The device dropped every sender without a Disconnected.
            Ok(None) => {
                self.device_lost = true;
                Err(CaptureError::DeviceLost)
            },
            Err(_) => Err(CaptureError::Timeout(waiting_for)),
        }
    }

    // Permission check, camera discovery, open and configure.
    async fn bring_up(&mut self) -> Result<(), CaptureError> {
        if !self.device.permission_granted() {
            return Err(CaptureError::PermissionDenied);
        }
        let camera = select_front_camera(&self.device)?;
        info!("Using front camera {} of {}", camera, self.device.model());
        self.camera = Some(camera);
        self.open_device().await?;
        self.configure_session().await?;
        self.device_lost = false;
        self.last_error = None;
        Ok(())
    }

    async fn open_device(&mut self) -> Result<(), CaptureError> {
        let camera = self.camera.clone().ok_or(CaptureError::NoCameraAvailable)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.events = Some(receiver);
        self.set_state(CaptureSessionState::DeviceOpening);
        let device = self.device.open(&camera, sender).map_err(|e| hal_error("open", e))?;
        self.device_handle = Some(device);

        let deadline = Instant::now() + self.config.callback_timeout;
        loop {
            match self.next_event(deadline, "camera to open").await? {
                DeviceEvent::Opened { device: d } if d == device => {
                    info!("Camera {} opened", camera);
                    self.set_state(CaptureSessionState::DeviceOpen);
                    return Ok(());
                },
                DeviceEvent::Disconnected { device: d } if d == device => {
                    self.device_lost = true;
                    return Err(CaptureError::DeviceLost);
                },
                DeviceEvent::Error { device: d, reason } if d == device => {
                    return Err(CaptureError::Device(reason));
                },
                other => self.handle_unsolicited(other),
            }
        }
    }

    async fn configure_session(&mut self) -> Result<(), CaptureError> {
        let device = self.device_handle.ok_or(CaptureError::DeviceLost)?;
        self.set_state(CaptureSessionState::SessionConfiguring);
        let session = self.device.configure_session(device, &self.config.surface)
            .map_err(|e| hal_error("configure_session", e))?;
        self.session = Some(session);

        let deadline = Instant::now() + self.config.callback_timeout;
        loop {
            match self.next_event(deadline, "session configuration").await? {
                DeviceEvent::Configured { session: s } if s == session => {
                    info!("Capture session configured");
                    self.set_state(CaptureSessionState::SessionReady);
                    return Ok(());
                },
                DeviceEvent::ConfigureFailed { session: s } if s == session => {
                    return Err(CaptureError::SessionConfigureFailed);
                },
                DeviceEvent::Disconnected { device: d } if d == device => {
                    self.device_lost = true;
                    return Err(CaptureError::DeviceLost);
                },
                DeviceEvent::Error { device: d, reason } if d == device => {
                    self.device_lost = true;
                    return Err(CaptureError::Device(reason));
                },
                other => self.handle_unsolicited(other),
            }
        }
    }

    // Waits for both the frame and the completion of the request. Whatever
    // frame is held when an error is returned is dropped, releasing it.
    async fn await_frame(&mut self, session: SessionHandle)
                         -> Result<CapturedFrame, CaptureError> {
        let deadline = Instant::now() + self.config.callback_timeout;
        let mut frame: Option<CapturedFrame> = None;
        let mut completed = false;
        loop {
            if completed && frame.is_some() {
                return frame.ok_or(CaptureError::DeviceLost);
            }
            match self.next_event(deadline, "capture").await? {
                DeviceEvent::ImageAvailable { session: s, frame: f } if s == session => {
                    debug!("Frame {} available", f.frame_number());
                    frame = Some(f);
                },
                DeviceEvent::CaptureCompleted { session: s, frame_number } if s == session => {
                    info!("Capture completed, frame {}", frame_number);
                    completed = true;
                },
                DeviceEvent::CaptureFailed { session: s, reason } if s == session => {
                    return Err(CaptureError::CaptureFailed(reason));
                },
                DeviceEvent::SequenceCompleted { session: s, sequence_id, frame_number }
                if s == session => {
                    debug!("Capture sequence {} completed, frame {}",
                           sequence_id, frame_number);
                },
                DeviceEvent::Disconnected { device } if self.is_current_device(device) => {
                    return Err(CaptureError::DeviceLost);
                },
                DeviceEvent::Error { device, reason } if self.is_current_device(device) => {
                    return Err(CaptureError::Device(reason));
                },
                other => self.handle_unsolicited(other),
            }
        }
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.device.discard_pending_images(session);
            self.device.close_session(session).await;
            debug!("Closed {:?}", session);
        }
        // Frames already queued for the old session.
        self.poll_events();
    }

    async fn close_device(&mut self) {
        if let Some(device) = self.device_handle.take() {
            self.device.close(device).await;
            debug!("Closed {:?}", device);
        }
        self.events = None;
    }

    async fn release_hardware(&mut self) {
        self.close_session().await;
        self.close_device().await;
    }

    // Cleans up after a failed bring-up or reset and enters Failed. The
    // device stays open for a later reset unless it never opened or is gone.
    async fn abandon(&mut self, err: CaptureError) -> CaptureError {
        let opening = self.state == CaptureSessionState::DeviceOpening;
        self.close_session().await;
        if opening || self.device_lost {
            self.close_device().await;
        }
        self.fail(err)
    }
}

impl<D: CaptureDevice> Drop for CaptureSessionManager<D> {
    fn drop(&mut self) {
        if self.device_handle.is_some() {
            warn!("Capture session manager dropped without shutdown()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_device::{CameraInfo, LensFacing};
    use crate::error::CaptureFailureReason;
    use crate::image_device::{DeviceController, Faults, ImageDevice};
    use crate::photo_store;
    use crate::pipeline::PipelineConfig;
    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;

    fn test_config() -> SessionConfig {
        SessionConfig {
            callback_timeout: Duration::from_millis(300),
            settle_interval: Duration::from_millis(10),
            surface: OutputSurfaceSpec::default(),
        }
    }

    fn small_device() -> ImageDevice {
        let image = RgbaImage::from_pixel(64, 36, Rgba([120, 120, 120, 255]));
        ImageDevice::from_image(&image).unwrap()
            .with_callback_delay(Duration::from_millis(2))
    }

    fn manager(device: ImageDevice, dir: &TempDir)
               -> (CaptureSessionManager<ImageDevice>, DeviceController) {
        let controller = device.controller();
        let pipeline = PhotoPipeline::new(PipelineConfig::new(dir.path()));
        (CaptureSessionManager::new(device, test_config(), pipeline), controller)
    }

    #[tokio::test]
    async fn initialize_then_capture() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        assert_eq!(manager.state(), CaptureSessionState::Uninitialized);
        manager.initialize().await.unwrap();
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);

        let photo = manager.capture_photo().await.unwrap();
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);
        assert_eq!(photo.image().dimensions(), (36, 64));
        assert!(photo.path().exists());
        assert!(photo.raw_path().exists());
        assert_eq!(controller.buffers_held(), 0);

        manager.reset_session().await.unwrap();
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);
        let second = manager.capture_photo().await.unwrap();
        assert_eq!(second.frame_number(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn end_to_end_landscape_frame() {
        let dir = TempDir::new().unwrap();
        let image = RgbaImage::from_pixel(1280, 720, Rgba([100, 150, 200, 255]));
        let device = ImageDevice::from_image(&image).unwrap();
        let (mut manager, _controller) = manager(device, &dir);
        manager.initialize().await.unwrap();
        let photo = manager.capture_photo().await.unwrap();
        let decoded = photo_store::decode_file(photo.path()).unwrap();
        assert_eq!(decoded.dimensions(), (337, 600));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn capture_outside_session_ready_is_invalid() {
        let dir = TempDir::new().unwrap();
        let (mut manager, _controller) = manager(small_device(), &dir);
        assert!(matches!(manager.capture_photo().await,
                         Err(CaptureError::InvalidState {
                             state: CaptureSessionState::Uninitialized, .. })));
        assert_eq!(manager.state(), CaptureSessionState::Uninitialized);

        manager.shutdown().await;
        assert!(matches!(manager.capture_photo().await,
                         Err(CaptureError::InvalidState {
                             state: CaptureSessionState::Closed, .. })));
        assert_eq!(manager.state(), CaptureSessionState::Closed);
    }

    #[tokio::test]
    async fn permission_denied_is_distinct() {
        let dir = TempDir::new().unwrap();
        let (mut manager, _controller) = manager(small_device().with_permission(false), &dir);
        assert!(matches!(manager.initialize().await, Err(CaptureError::PermissionDenied)));
        assert_eq!(manager.state(), CaptureSessionState::Failed);
        assert!(manager.last_error().is_some());
    }

    #[tokio::test]
    async fn no_front_camera() {
        let dir = TempDir::new().unwrap();
        let device = small_device().with_cameras(vec![CameraInfo {
            id: CameraId("0".to_string()), facing: LensFacing::Back,
            model: "back".to_string() }]);
        let (mut manager, _controller) = manager(device, &dir);
        assert!(matches!(manager.initialize().await, Err(CaptureError::NoCameraAvailable)));
        assert_eq!(manager.state(), CaptureSessionState::Failed);
    }

    #[tokio::test]
    async fn open_error_then_retry() {
        let dir = TempDir::new().unwrap();
        let device = small_device().with_faults(Faults {
            open_error: Some(DeviceErrorReason::InUse), ..Faults::default() });
        let (mut manager, controller) = manager(device, &dir);
        assert!(matches!(manager.initialize().await,
                         Err(CaptureError::Device(DeviceErrorReason::InUse))));
        assert_eq!(manager.state(), CaptureSessionState::Failed);
        assert!(!controller.is_open());

        controller.set_faults(Faults::default());
        manager.initialize().await.unwrap();
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn configure_failure() {
        let dir = TempDir::new().unwrap();
        let device = small_device().with_faults(Faults {
            configure_fails: true, ..Faults::default() });
        let (mut manager, controller) = manager(device, &dir);
        assert!(matches!(manager.initialize().await,
                         Err(CaptureError::SessionConfigureFailed)));
        assert_eq!(manager.state(), CaptureSessionState::Failed);

        // The device is still open, so a reset only has to reconfigure.
        assert!(controller.is_open());
        controller.set_faults(Faults::default());
        manager.reset_session().await.unwrap();
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn open_timeout() {
        let dir = TempDir::new().unwrap();
        let device = small_device().with_faults(Faults {
            unresponsive: true, ..Faults::default() });
        let (mut manager, controller) = manager(device, &dir);
        assert!(matches!(manager.initialize().await, Err(CaptureError::Timeout(_))));
        assert_eq!(manager.state(), CaptureSessionState::Failed);
        assert!(!controller.is_open());
    }

    #[tokio::test]
    async fn disconnect_while_idle() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        controller.disconnect();
        assert_eq!(manager.poll_events(), CaptureSessionState::Failed);
        assert!(matches!(manager.capture_photo().await, Err(CaptureError::DeviceLost)));
        assert!(matches!(manager.capture_photo().await, Err(CaptureError::DeviceLost)));

        manager.initialize().await.unwrap();
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);
        manager.capture_photo().await.unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn disconnect_during_capture() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        controller.set_faults(Faults {
            capture_delay: Some(Duration::from_millis(100)), ..Faults::default() });

        let unplug = controller.clone();
        let unplugger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            unplug.disconnect();
        });
        assert!(matches!(manager.capture_photo().await, Err(CaptureError::DeviceLost)));
        assert_eq!(manager.state(), CaptureSessionState::Failed);
        unplugger.await.unwrap();

        manager.shutdown().await;
        // The delayed frame was never delivered; its buffer is back.
        assert_eq!(controller.buffers_held(), 0);
    }

    #[tokio::test]
    async fn capture_failure_keeps_session() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        controller.fail_next_capture(CaptureFailureReason::Error);
        assert!(matches!(manager.capture_photo().await,
                         Err(CaptureError::CaptureFailed(CaptureFailureReason::Error))));
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);

        manager.reset_session().await.unwrap();
        manager.capture_photo().await.unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn capture_timeout_then_reset_discards_late_frame() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        controller.set_faults(Faults {
            capture_delay: Some(Duration::from_secs(2)), ..Faults::default() });
        assert!(matches!(manager.capture_photo().await, Err(CaptureError::Timeout(_))));
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);
        // The frame is still held by the hardware.
        assert_eq!(controller.buffers_held(), 1);

        controller.set_faults(Faults::default());
        manager.reset_session().await.unwrap();
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);
        assert_eq!(controller.buffers_held(), 0);
        manager.capture_photo().await.unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn pipeline_failure_keeps_session() {
        let dir = TempDir::new().unwrap();
        let device = ImageDevice::new(b"definitely not a jpeg".to_vec())
            .with_callback_delay(Duration::from_millis(2));
        let (mut manager, _controller) = manager(device, &dir);
        manager.initialize().await.unwrap();
        assert!(matches!(manager.capture_photo().await, Err(CaptureError::Decode(_))));
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reset_requires_ready_or_failed() {
        let dir = TempDir::new().unwrap();
        let (mut manager, _controller) = manager(small_device(), &dir);
        assert!(matches!(manager.reset_session().await,
                         Err(CaptureError::InvalidState {
                             state: CaptureSessionState::Uninitialized, .. })));
    }

    #[tokio::test]
    async fn reset_from_failed_after_disconnect_reopens() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        controller.disconnect();
        manager.poll_events();
        manager.reset_session().await.unwrap();
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);
        assert!(controller.is_open());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        manager.shutdown().await;
        assert_eq!(manager.state(), CaptureSessionState::Closed);
        assert!(!controller.is_open());
        manager.shutdown().await;
        assert_eq!(manager.state(), CaptureSessionState::Closed);
        assert!(matches!(manager.initialize().await,
                         Err(CaptureError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn abandoned_capture_can_be_reset() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        controller.set_faults(Faults {
            capture_delay: Some(Duration::from_millis(200)), ..Faults::default() });

        let gave_up = tokio::time::timeout(Duration::from_millis(20),
                                           manager.capture_photo()).await;
        assert!(gave_up.is_err());
        assert_eq!(manager.poll_events(), CaptureSessionState::SessionReady);

        controller.set_faults(Faults::default());
        manager.reset_session().await.unwrap();
        assert_eq!(controller.buffers_held(), 0);
        let photo = manager.capture_photo().await.unwrap();
        assert_eq!(photo.frame_number(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn abandoned_capture_then_initialize_is_invalid() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        controller.set_faults(Faults {
            capture_delay: Some(Duration::from_millis(200)), ..Faults::default() });
        let _ = tokio::time::timeout(Duration::from_millis(20),
                                     manager.capture_frame()).await;
        // The session is usable again, so only reset applies.
        assert!(matches!(manager.initialize().await,
                         Err(CaptureError::InvalidState {
                             state: CaptureSessionState::SessionReady, .. })));
        manager.shutdown().await;
        assert_eq!(controller.buffers_held(), 0);
    }

    #[tokio::test]
    async fn device_error_while_idle() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        controller.raise_error(DeviceErrorReason::DeviceError);
        assert_eq!(manager.poll_events(), CaptureSessionState::Failed);
        assert!(manager.last_error().unwrap().contains("camera device error"));
        assert!(matches!(manager.capture_photo().await, Err(CaptureError::DeviceLost)));

        manager.initialize().await.unwrap();
        assert_eq!(manager.state(), CaptureSessionState::SessionReady);
        manager.capture_photo().await.unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn device_error_during_capture() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        controller.set_faults(Faults {
            capture_delay: Some(Duration::from_millis(100)), ..Faults::default() });

        let faulty = controller.clone();
        let fault = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            faulty.raise_error(DeviceErrorReason::Disabled);
        });
        assert!(matches!(manager.capture_photo().await, Err(CaptureError::DeviceLost)));
        fault.await.unwrap();
        assert_eq!(manager.state(), CaptureSessionState::Failed);
        assert!(manager.last_error().unwrap().contains("camera disabled"));
        assert!(matches!(manager.capture_photo().await, Err(CaptureError::DeviceLost)));

        manager.shutdown().await;
        assert_eq!(controller.buffers_held(), 0);
    }

    #[tokio::test]
    async fn callbacks_after_shutdown_are_discarded() {
        let dir = TempDir::new().unwrap();
        let (mut manager, controller) = manager(small_device(), &dir);
        manager.initialize().await.unwrap();
        controller.set_faults(Faults {
            capture_delay: Some(Duration::from_millis(100)), ..Faults::default() });
        let _ = tokio::time::timeout(Duration::from_millis(20),
                                     manager.capture_photo()).await;
        manager.shutdown().await;
        assert_eq!(manager.state(), CaptureSessionState::Closed);

        // Past the point where the frame would have been delivered.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.poll_events(), CaptureSessionState::Closed);
        assert_eq!(controller.buffers_held(), 0);
        assert!(!controller.is_open());
        assert!(matches!(manager.capture_photo().await,
                         Err(CaptureError::InvalidState {
                             state: CaptureSessionState::Closed, .. })));
    }
}
