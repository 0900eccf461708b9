// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::Local;
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use log::debug;

use crate::capture_device::CapturedFrame;
use crate::error::CaptureError;
use crate::pixel_transform::PixelBuffer;

pub const JPEG_QUALITY: u8 = 85;

/// File name prefix of frames as delivered by the camera.
pub const RAW_PREFIX: &str = "PHOTO";
/// File name prefix of photos that went through the pipeline.
pub const PROCESSED_PREFIX: &str = "PHOTO_PROCESSED";

// Standard alphabet; trailing '=' padding may be present or not.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent));

pub fn decode_file(path: &Path) -> Result<PixelBuffer, CaptureError> {
    let bytes = fs::read(path)?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| CaptureError::Decode(format!("{}: {}", path.display(), e)))?;
    Ok(image.to_rgba8())
}

/// JPEG bytes of `buffer` at JPEG_QUALITY. Alpha is dropped.
pub fn encode_jpeg(buffer: &PixelBuffer) -> Result<Vec<u8>, CaptureError> {
    let rgb = DynamicImage::ImageRgba8(buffer.clone()).to_rgb8();
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| CaptureError::Encode(e.to_string()))?;
    Ok(encoded)
}

/// Encodes `buffer` as JPEG and writes it to a new file named
/// `{prefix}_{yyyy-MM-dd-HH-mm-ss-SSS}.jpg` in `directory`.
pub fn encode_and_save(buffer: &PixelBuffer, directory: &Path, prefix: &str)
                       -> Result<PathBuf, CaptureError> {
    let encoded = encode_jpeg(buffer)?;
    let path = write_new_file(directory, prefix, &encoded)?;
    debug!("Saved {}x{} image to {}", buffer.width(), buffer.height(), path.display());
    Ok(path)
}

/// Writes the frame's encoded bytes verbatim. The frame, and with it the
/// hardware buffer, is released when this returns.
pub fn save_frame(frame: CapturedFrame, directory: &Path, prefix: &str)
                  -> Result<PathBuf, CaptureError> {
    let path = write_new_file(directory, prefix, frame.data())?;
    debug!("Saved frame {} ({} bytes) to {}",
           frame.frame_number(), frame.data().len(), path.display());
    Ok(path)
}

/// Decodes standard Base64 (padding optional, whitespace ignored) and writes
/// the bytes to `output_path`.
pub fn base64_to_file(data: &str, output_path: &Path) -> Result<(), CaptureError> {
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = LENIENT_BASE64.decode(compact.as_bytes())
        .map_err(|e| CaptureError::Decode(format!("invalid base64: {}", e)))?;
    write_atomically(output_path, &bytes)
}

/// Formats a byte count with integer-truncated B/KB/MB units.
pub fn human_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{} KB", bytes / KB)
    } else {
        format!("{} MB", bytes / MB)
    }
}

pub fn file_size(path: &Path) -> Result<String, CaptureError> {
    Ok(human_file_size(fs::metadata(path)?.len()))
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d-%H-%M-%S-%3f").to_string()
}

// Picks a file name that does not exist yet. Two saves with the same prefix
// within one millisecond get a numeric suffix.
fn unique_path(directory: &Path, prefix: &str) -> PathBuf {
    let stem = format!("{}_{}", prefix, timestamp());
    let mut path = directory.join(format!("{}.jpg", stem));
    let mut n = 1;
    while path.exists() {
        path = directory.join(format!("{}_{}.jpg", stem, n));
        n += 1;
    }
    path
}

fn write_new_file(directory: &Path, prefix: &str, bytes: &[u8])
                  -> Result<PathBuf, CaptureError> {
    let path = unique_path(directory, prefix);
    write_atomically(&path, bytes)?;
    Ok(path)
}

// Writes to a hidden sibling then renames, so a partially written file is
// never visible under the final name.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), CaptureError> {
    let file_name = path.file_name()
        .ok_or_else(|| CaptureError::InvalidArgument(
            format!("{} is not a file path", path.display())))?;
    let mut partial_name = std::ffi::OsString::from(".");
    partial_name.push(file_name);
    partial_name.push(".part");
    let partial = path.with_file_name(partial_name);

    let result = (|| -> std::io::Result<()> {
        let mut file: File = OpenOptions::new()
            .write(true).create(true).truncate(true).open(&partial)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&partial, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;

    #[test]
    fn human_file_size_truncates() {
        assert_eq!(human_file_size(0), "0 B");
        assert_eq!(human_file_size(1023), "1023 B");
        assert_eq!(human_file_size(1024), "1 KB");
        assert_eq!(human_file_size(2047), "1 KB");
        assert_eq!(human_file_size(1048575), "1023 KB");
        assert_eq!(human_file_size(1048576), "1 MB");
        assert_eq!(human_file_size(5 * 1048576 + 1048575), "5 MB");
    }

    #[test]
    fn save_then_decode_keeps_dimensions() {
        let dir = TempDir::new().unwrap();
        let buffer = RgbaImage::from_pixel(337, 600, Rgba([10, 120, 200, 255]));
        let path = encode_and_save(&buffer, dir.path(), PROCESSED_PREFIX).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("PHOTO_PROCESSED_"));
        assert!(name.ends_with(".jpg"));
        // PHOTO_PROCESSED_ + yyyy-MM-dd-HH-mm-ss-SSS + .jpg
        assert_eq!(name.len(), "PHOTO_PROCESSED_".len() + 23 + 4);

        let decoded = decode_file(&path).unwrap();
        assert_eq!(decoded.dimensions(), (337, 600));
    }

    #[test]
    fn saves_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let buffer = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255]));
        let mut paths: Vec<PathBuf> = (0..5)
            .map(|_| encode_and_save(&buffer, dir.path(), RAW_PREFIX).unwrap())
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 5);
        // No partial files left behind.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 5);
    }

    #[test]
    fn save_frame_writes_bytes_verbatim() {
        let dir = TempDir::new().unwrap();
        let frame = CapturedFrame::new(3, vec![0xff, 0xd8, 1, 2, 3], None);
        let path = save_frame(frame, dir.path(), RAW_PREFIX).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0xff, 0xd8, 1, 2, 3]);
        assert_eq!(file_size(&path).unwrap(), "5 B");
    }

    #[test]
    fn save_into_missing_directory_is_io_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let buffer = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        assert!(matches!(encode_and_save(&buffer, &missing, RAW_PREFIX),
                         Err(CaptureError::Io(_))));
    }

    #[test]
    fn decode_rejects_non_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.jpg");
        fs::write(&path, b"not an image").unwrap();
        assert!(matches!(decode_file(&path), Err(CaptureError::Decode(_))));
        assert!(matches!(decode_file(&dir.path().join("absent.jpg")),
                         Err(CaptureError::Io(_))));
    }

    #[test]
    fn base64_round_trip() {
        let dir = TempDir::new().unwrap();
        let bytes: Vec<u8> = (0..=255u8).chain([0, 1, 2]).collect();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let path = dir.path().join("out.bin");
        base64_to_file(&encoded, &path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn base64_tolerates_missing_padding_and_whitespace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        base64_to_file("aGVsbG8", &path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        base64_to_file("aGVs\nbG8=\n", &path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn base64_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        assert!(matches!(base64_to_file("!!not*base64", &path),
                         Err(CaptureError::Decode(_))));
        assert!(!path.exists());
    }
}
