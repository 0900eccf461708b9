// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use canonical_error::CanonicalError;
use tokio::sync::mpsc;

use crate::error::{CaptureFailureReason, DeviceErrorReason};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CameraId(pub String);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LensFacing {
    Front,
    Back,
    External,
}

#[derive(Clone, Debug)]
pub struct CameraInfo {
    pub id: CameraId,
    pub facing: LensFacing,
    pub model: String,
}

/// Identifies an open device. Handles are never reused by an implementation,
/// so events tagged with a stale handle can be recognized and dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceHandle(pub u64);

/// Identifies a configured capture session; same uniqueness rule as
/// DeviceHandle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SurfaceId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
}

/// The memory target the hardware writes captured frames into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputSurfaceSpec {
    pub id: SurfaceId,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,

    /// Number of frames the surface can hold before the consumer releases
    /// one. A capture issued while all buffers are held cannot complete.
    pub max_images: usize,
}

impl Default for OutputSurfaceSpec {
    fn default() -> Self {
        OutputSurfaceSpec {
            id: SurfaceId(0),
            width: 1280,
            height: 720,
            format: OutputFormat::Jpeg,
            max_images: 1,
        }
    }
}

/// JPEG quality values range from 0 to 100, inclusive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JpegQuality(u8);

impl JpegQuality {
    pub fn new(quality: u8) -> JpegQuality {
        assert!(quality <= 100);
        JpegQuality(quality)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FocusMode {
    /// Autofocus off; lens driven to a fixed distance in diopters. 0.0 is
    /// infinity.
    Manual { distance_diopters: f32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AutoExposureMode {
    Off, On,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WhiteBalanceMode {
    Off, Auto,
}

/// Shared by noise reduction, edge enhancement and the color correction
/// stages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessingMode {
    Off, Fast, HighQuality,
}

/// Parameters of one still capture attempt. Built fresh for every capture
/// and never modified afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureRequestSpec {
    pub target: SurfaceId,
    pub focus: FocusMode,
    pub auto_exposure: AutoExposureMode,
    pub white_balance: WhiteBalanceMode,
    pub color_correction: ProcessingMode,
    pub aberration_correction: ProcessingMode,
    pub noise_reduction: ProcessingMode,
    pub edge_enhancement: ProcessingMode,
    pub jpeg_quality: JpegQuality,
    pub exposure_compensation: i32,
}

impl CaptureRequestSpec {
    /// The fixed parameter set used for every photo: focus locked at infinity,
    /// automatic exposure and white balance, fast processing stages.
    pub fn still_capture(target: SurfaceId) -> Self {
        CaptureRequestSpec {
            target,
            focus: FocusMode::Manual { distance_diopters: 0.0 },
            auto_exposure: AutoExposureMode::On,
            white_balance: WhiteBalanceMode::Auto,
            color_correction: ProcessingMode::Fast,
            aberration_correction: ProcessingMode::Fast,
            noise_reduction: ProcessingMode::Fast,
            edge_enhancement: ProcessingMode::Fast,
            jpeg_quality: JpegQuality::new(85),
            exposure_compensation: 0,
        }
    }
}

/// Accounts for one hardware image buffer held by the consumer. The buffer is
/// returned to the device when the lease is dropped.
#[derive(Debug)]
pub struct BufferLease {
    held: Arc<AtomicUsize>,
}

impl BufferLease {
    pub fn acquire(held: &Arc<AtomicUsize>) -> BufferLease {
        held.fetch_add(1, Ordering::SeqCst);
        BufferLease { held: held.clone() }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.held.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Encoded (JPEG) bytes of one captured frame. Owned by whoever holds it;
/// dropping it releases the underlying hardware buffer.
#[derive(Debug)]
pub struct CapturedFrame {
    frame_number: u64,
    data: Vec<u8>,
    _lease: Option<BufferLease>,
}

impl CapturedFrame {
    pub fn new(frame_number: u64, data: Vec<u8>, lease: Option<BufferLease>) -> Self {
        CapturedFrame { frame_number, data, _lease: lease }
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Asynchronous notifications from the hardware. Implementations post these
/// from their own execution context onto the sender passed to open().
#[derive(Debug)]
pub enum DeviceEvent {
    Opened { device: DeviceHandle },
    Disconnected { device: DeviceHandle },
    Error { device: DeviceHandle, reason: DeviceErrorReason },

    Configured { session: SessionHandle },
    ConfigureFailed { session: SessionHandle },

    ImageAvailable { session: SessionHandle, frame: CapturedFrame },
    CaptureCompleted { session: SessionHandle, frame_number: u64 },
    CaptureFailed { session: SessionHandle, reason: CaptureFailureReason },
    SequenceCompleted { session: SessionHandle, sequence_id: i32, frame_number: u64 },
}

pub type EventSender = mpsc::UnboundedSender<DeviceEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<DeviceEvent>;

/// CaptureDevice models the camera hardware layer. Calls return as soon as the
/// request has been handed to the hardware; the outcome arrives later as a
/// DeviceEvent. An Err return means the hardware rejected the call outright.
/// Exclusive ownership of an opened device is enforced by the hardware
/// layer, not by implementations of this trait.
#[async_trait]
pub trait CaptureDevice: Send {
    /// Returns a string identifying what kind of device this is.
    fn model(&self) -> String;

    /// Whether the host environment has granted camera access.
    fn permission_granted(&self) -> bool;

    fn list_cameras(&self) -> Result<Vec<CameraInfo>, CanonicalError>;

    /// Returns the first camera whose lens faces the user, if any.
    fn find_front_facing(&self) -> Result<Option<CameraId>, CanonicalError> {
        Ok(self.list_cameras()?.into_iter()
           .find(|info| info.facing == LensFacing::Front)
           .map(|info| info.id))
    }

    /// Starts opening the camera. Resolves to Opened, Disconnected or Error
    /// on `events`; all later events for this device go to the same sender.
    fn open(&mut self, id: &CameraId, events: EventSender)
            -> Result<DeviceHandle, CanonicalError>;

    /// Starts negotiating a session against `surface`. Resolves to Configured
    /// or ConfigureFailed.
    fn configure_session(&mut self, device: DeviceHandle, surface: &OutputSurfaceSpec)
                         -> Result<SessionHandle, CanonicalError>;

    /// Issues one capture request. Exactly one of CaptureCompleted or
    /// CaptureFailed follows, with ImageAvailable carrying the frame on
    /// success.
    fn capture(&mut self, session: SessionHandle, request: &CaptureRequestSpec)
               -> Result<(), CanonicalError>;

    /// Stops delivery of any frames not yet handed to the consumer.
    fn discard_pending_images(&mut self, session: SessionHandle);

    async fn close_session(&mut self, session: SessionHandle);

    /// Releases the device. No events are posted for `device` afterwards.
    async fn close(&mut self, device: DeviceHandle);
}
