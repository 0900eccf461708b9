// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::capture_device::CapturedFrame;
use crate::error::CaptureError;
use crate::photo_store::{self, PROCESSED_PREFIX, RAW_PREFIX};
use crate::pixel_transform::{self, PixelBuffer};

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Where raw and processed photos are written. Must exist and be writable.
    pub output_dir: PathBuf,

    /// Clockwise. The front sensor is mounted so that 270 gives an upright
    /// portrait.
    pub rotation_degrees: i32,

    pub max_width: u32,
    pub max_height: u32,

    pub color_balance: bool,

    /// When set, the bus label and time are stamped onto the photo.
    pub overlay_label: Option<String>,
}

impl PipelineConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        PipelineConfig {
            output_dir: output_dir.into(),
            rotation_degrees: 270,
            max_width: 800,
            max_height: 600,
            color_balance: true,
            overlay_label: None,
        }
    }
}

/// Result of one capture request after processing and saving.
#[derive(Clone, Debug)]
pub struct ProcessedPhoto {
    image: PixelBuffer,
    path: PathBuf,
    raw_path: PathBuf,
    frame_number: u64,
}

impl ProcessedPhoto {
    pub fn image(&self) -> &PixelBuffer {
        &self.image
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The frame exactly as delivered by the camera.
    pub fn raw_path(&self) -> &Path {
        &self.raw_path
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }
}

#[derive(Clone, Debug)]
pub struct PhotoPipeline {
    config: PipelineConfig,
}

impl PhotoPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        PhotoPipeline { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// rotate -> resize -> color balance -> overlay, each as configured.
    pub fn transform(&self, buffer: PixelBuffer) -> Result<PixelBuffer, CaptureError> {
        let buffer = pixel_transform::rotate(buffer, self.config.rotation_degrees)?;
        let buffer = pixel_transform::resize_to_fit(
            buffer, self.config.max_width, self.config.max_height)?;
        let buffer = if self.config.color_balance {
            pixel_transform::adjust_color_balance(buffer)
        } else {
            buffer
        };
        Ok(match &self.config.overlay_label {
            Some(label) => pixel_transform::add_text_overlay(buffer, label),
            None => buffer,
        })
    }

    /// Persists the raw frame, then decodes, transforms and saves it. The
    /// frame's hardware buffer is released as soon as its bytes are on disk.
    pub fn process_frame(&self, frame: CapturedFrame) -> Result<ProcessedPhoto, CaptureError> {
        let frame_number = frame.frame_number();
        let raw_path = self.save_raw(frame)?;
        self.process_saved(&raw_path, frame_number)
    }

    /// Writes the frame verbatim as `PHOTO_{timestamp}.jpg`, releasing its
    /// buffer.
    pub fn save_raw(&self, frame: CapturedFrame) -> Result<PathBuf, CaptureError> {
        let raw_path = photo_store::save_frame(frame, &self.config.output_dir, RAW_PREFIX)?;
        info!("Photo captured: {}", raw_path.display());
        Ok(raw_path)
    }

    /// Second half of process_frame(): decode the saved raw frame, transform
    /// and save the result.
    pub fn process_saved(&self, raw_path: &Path, frame_number: u64)
                         -> Result<ProcessedPhoto, CaptureError> {
        let decoded = photo_store::decode_file(raw_path)?;
        debug!("Decoded frame {} as {}x{}", frame_number, decoded.width(), decoded.height());
        let image = self.transform(decoded)?;
        let path = photo_store::encode_and_save(&image, &self.config.output_dir,
                                                PROCESSED_PREFIX)?;
        info!("Processed {}x{} photo saved: {}", image.width(), image.height(),
              path.display());
        Ok(ProcessedPhoto { image, path, raw_path: raw_path.to_path_buf(), frame_number })
    }
}
