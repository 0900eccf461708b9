// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Fake camera device that yields a fixed JPEG. For testing.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error, not_found_error, unavailable_error};
use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::capture_device::{BufferLease, CameraId, CameraInfo, CaptureDevice,
                            CaptureRequestSpec, CapturedFrame, DeviceEvent,
                            DeviceHandle, EventSender, LensFacing,
                            OutputSurfaceSpec, SessionHandle};
use crate::error::{CaptureError, CaptureFailureReason, DeviceErrorReason};
use crate::photo_store::encode_jpeg;
use crate::pixel_transform::PixelBuffer;

/// Misbehaviors the fake hardware can be told to exhibit.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// open() resolves to Error with this reason.
    pub open_error: Option<DeviceErrorReason>,
    /// open() resolves to Disconnected.
    pub disconnect_on_open: bool,
    /// configure_session() resolves to ConfigureFailed.
    pub configure_fails: bool,
    /// The next capture resolves to CaptureFailed with this reason.
    pub fail_next_capture: Option<CaptureFailureReason>,
    /// Requests are accepted but no callback is ever posted.
    pub unresponsive: bool,
    /// Capture callbacks are posted after this delay instead of the usual
    /// callback delay.
    pub capture_delay: Option<Duration>,
}

#[derive(Default)]
struct SharedState {
    events: Option<EventSender>,
    device: Option<DeviceHandle>,
    session: Option<(SessionHandle, OutputSurfaceSpec)>,
    faults: Faults,
}

pub struct ImageDevice {
    jpeg: Arc<Vec<u8>>,
    cameras: Vec<CameraInfo>,
    permission_granted: bool,

    // Delay before each callback is posted, standing in for hardware latency.
    callback_delay: Duration,

    state: Arc<Mutex<SharedState>>,

    // Number of image buffers currently handed out to the consumer.
    buffers_held: Arc<AtomicUsize>,

    next_handle: u64,
    frame_number: u64,
    sequence_id: i32,

    // Pending callback deliveries.
    callbacks: Vec<JoinHandle<()>>,
}

/// Reaches the fake hardware from outside the component that owns the
/// device, the way a cable pull or a vendor fault would.
#[derive(Clone)]
pub struct DeviceController {
    state: Arc<Mutex<SharedState>>,
    buffers_held: Arc<AtomicUsize>,
}

impl DeviceController {
    /// Simulates the camera going away. Posts Disconnected for the open
    /// device; later calls against it are rejected.
    pub fn disconnect(&self) {
        let mut locked_state = self.state.lock().unwrap();
        if let (Some(device), Some(events)) =
            (locked_state.device.take(), locked_state.events.take())
        {
            debug!("Simulating disconnect of {:?}", device);
            let _ = events.send(DeviceEvent::Disconnected { device });
        }
        locked_state.session = None;
    }

    /// Simulates a fatal device error. Posts Error for the open device and
    /// drops its session; the device stays open until the owner closes it.
    pub fn raise_error(&self, reason: DeviceErrorReason) {
        let mut locked_state = self.state.lock().unwrap();
        if let (Some(device), Some(events)) = (locked_state.device, &locked_state.events) {
            debug!("Simulating {} on {:?}", reason, device);
            let _ = events.send(DeviceEvent::Error { device, reason });
        }
        locked_state.session = None;
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().unwrap().faults = faults;
    }

    pub fn fail_next_capture(&self, reason: CaptureFailureReason) {
        self.state.lock().unwrap().faults.fail_next_capture = Some(reason);
    }

    pub fn buffers_held(&self) -> usize {
        self.buffers_held.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().device.is_some()
    }
}

impl ImageDevice {
    /// A back camera "0" and a front camera "1", both yielding `jpeg`.
    pub fn new(jpeg: Vec<u8>) -> Self {
        ImageDevice {
            jpeg: Arc::new(jpeg),
            cameras: vec![
                CameraInfo { id: CameraId("0".to_string()), facing: LensFacing::Back,
                             model: "ImageDevice back".to_string() },
                CameraInfo { id: CameraId("1".to_string()), facing: LensFacing::Front,
                             model: "ImageDevice front".to_string() },
            ],
            permission_granted: true,
            callback_delay: Duration::from_millis(5),
            state: Arc::new(Mutex::new(SharedState::default())),
            buffers_held: Arc::new(AtomicUsize::new(0)),
            next_handle: 1,
            frame_number: 0,
            sequence_id: 0,
            callbacks: Vec::new(),
        }
    }

    pub fn from_image(image: &PixelBuffer) -> Result<Self, CaptureError> {
        Ok(ImageDevice::new(encode_jpeg(image)?))
    }

    pub fn with_cameras(mut self, cameras: Vec<CameraInfo>) -> Self {
        self.cameras = cameras;
        self
    }

    pub fn with_permission(mut self, granted: bool) -> Self {
        self.permission_granted = granted;
        self
    }

    pub fn with_callback_delay(mut self, delay: Duration) -> Self {
        self.callback_delay = delay;
        self
    }

    pub fn with_faults(self, faults: Faults) -> Self {
        self.state.lock().unwrap().faults = faults;
        self
    }

    pub fn controller(&self) -> DeviceController {
        DeviceController { state: self.state.clone(),
                           buffers_held: self.buffers_held.clone() }
    }

    fn new_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn post(&mut self, events: Vec<DeviceEvent>) {
        self.post_after(self.callback_delay, events);
    }

    // Delivers `events` in order from a background task after `delay`.
    fn post_after(&mut self, delay: Duration, events: Vec<DeviceEvent>) {
        let sender = match &self.state.lock().unwrap().events {
            Some(sender) => sender.clone(),
            None => return,
        };
        self.callbacks.retain(|task| !task.is_finished());
        self.callbacks.push(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for event in events {
                // Receiver is gone once the owner shut down; drop the rest.
                if sender.send(event).is_err() {
                    break;
                }
            }
        }));
    }

    async fn cancel_callbacks(&mut self) {
        for task in self.callbacks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

#[async_trait]
impl CaptureDevice for ImageDevice {
    fn model(&self) -> String {
        "ImageDevice".to_string()
    }

    fn permission_granted(&self) -> bool {
        self.permission_granted
    }

    fn list_cameras(&self) -> Result<Vec<CameraInfo>, CanonicalError> {
        Ok(self.cameras.clone())
    }

    fn open(&mut self, id: &CameraId, events: EventSender)
            -> Result<DeviceHandle, CanonicalError> {
        if !self.cameras.iter().any(|info| info.id == *id) {
            return Err(not_found_error(format!("No camera with id {}", id).as_str()));
        }
        let device = DeviceHandle(self.new_handle());
        let faults = {
            let mut locked_state = self.state.lock().unwrap();
            if locked_state.device.is_some() {
                return Err(failed_precondition_error("Camera already open"));
            }
            locked_state.events = Some(events);
            locked_state.device = Some(device);
            locked_state.faults.clone()
        };
        if faults.unresponsive {
            return Ok(device);
        }
        if let Some(reason) = faults.open_error {
            self.post(vec![DeviceEvent::Error { device, reason }]);
        } else if faults.disconnect_on_open {
            self.post(vec![DeviceEvent::Disconnected { device }]);
        } else {
            self.post(vec![DeviceEvent::Opened { device }]);
        }
        Ok(device)
    }

    fn configure_session(&mut self, device: DeviceHandle, surface: &OutputSurfaceSpec)
                         -> Result<SessionHandle, CanonicalError> {
        let session = SessionHandle(self.new_handle());
        let faults = {
            let mut locked_state = self.state.lock().unwrap();
            if locked_state.device != Some(device) {
                return Err(unavailable_error("Camera device is not open"));
            }
            // A new session replaces any previous one.
            locked_state.session = Some((session, *surface));
            locked_state.faults.clone()
        };
        if faults.unresponsive {
            return Ok(session);
        }
        if faults.configure_fails {
            self.post(vec![DeviceEvent::ConfigureFailed { session }]);
        } else {
            self.post(vec![DeviceEvent::Configured { session }]);
        }
        Ok(session)
    }

    fn capture(&mut self, session: SessionHandle, request: &CaptureRequestSpec)
               -> Result<(), CanonicalError> {
        let (surface, faults) = {
            let mut locked_state = self.state.lock().unwrap();
            let surface = match locked_state.session {
                Some((current, surface)) if current == session => surface,
                _ => return Err(unavailable_error("Capture session is not active")),
            };
            let faults = locked_state.faults.clone();
            locked_state.faults.fail_next_capture = None;
            (surface, faults)
        };
        if request.target != surface.id {
            return Err(invalid_argument_error(
                format!("Request targets {:?} but session has {:?}",
                        request.target, surface.id).as_str()));
        }
        if faults.unresponsive {
            return Ok(());
        }
        self.sequence_id += 1;
        let sequence_id = self.sequence_id;
        if let Some(reason) = faults.fail_next_capture {
            self.post(vec![DeviceEvent::CaptureFailed { session, reason }]);
            return Ok(());
        }
        if self.buffers_held.load(Ordering::SeqCst) >= surface.max_images {
            warn!("No free image buffer on {:?}; failing capture", surface.id);
            self.post(vec![DeviceEvent::CaptureFailed {
                session, reason: CaptureFailureReason::Error }]);
            return Ok(());
        }
        self.frame_number += 1;
        let frame_number = self.frame_number;
        let frame = CapturedFrame::new(frame_number, self.jpeg.as_ref().clone(),
                                       Some(BufferLease::acquire(&self.buffers_held)));
        let delay = faults.capture_delay.unwrap_or(self.callback_delay);
        self.post_after(delay, vec![
            DeviceEvent::ImageAvailable { session, frame },
            DeviceEvent::CaptureCompleted { session, frame_number },
            DeviceEvent::SequenceCompleted { session, sequence_id, frame_number },
        ]);
        Ok(())
    }

    fn discard_pending_images(&mut self, session: SessionHandle) {
        debug!("Discarding pending images for {:?}", session);
        for task in &self.callbacks {
            task.abort();
        }
    }

    async fn close_session(&mut self, session: SessionHandle) {
        self.cancel_callbacks().await;
        let mut locked_state = self.state.lock().unwrap();
        if matches!(locked_state.session, Some((current, _)) if current == session) {
            locked_state.session = None;
        }
    }

    async fn close(&mut self, device: DeviceHandle) {
        self.cancel_callbacks().await;
        let mut locked_state = self.state.lock().unwrap();
        if locked_state.device == Some(device) {
            locked_state.device = None;
            locked_state.session = None;
            locked_state.events = None;
        }
    }
}
