// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Pure transforms over an RGBA pixel buffer. Each function takes ownership of
// its input and returns the output buffer, reusing the input allocation when
// the dimensions do not change.

use chrono::{DateTime, Local};
use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use font8x8::{BASIC_FONTS, LATIN_FONTS, UnicodeFonts};
use image::{Rgba, RgbaImage};
use image::imageops::{rotate180_in_place, rotate270, rotate90};
use imageproc::drawing::{Blend, draw_filled_rect_mut};
use imageproc::rect::Rect;

use crate::error::CaptureError;

/// 8-bit-per-channel RGBA, row major.
pub type PixelBuffer = RgbaImage;

/// Rotates clockwise by `degrees`, which must be a multiple of 90. Negative
/// and >= 360 values are normalized.
pub fn rotate(mut buffer: PixelBuffer, degrees: i32) -> Result<PixelBuffer, CaptureError> {
    if degrees % 90 != 0 {
        return Err(CaptureError::InvalidArgument(
            format!("rotation of {} degrees is not a multiple of 90", degrees)));
    }
    match degrees.rem_euclid(360) {
        0 => Ok(buffer),
        90 => Ok(rotate90(&buffer)),
        180 => {
            rotate180_in_place(&mut buffer);
            Ok(buffer)
        },
        _ => Ok(rotate270(&buffer)),
    }
}

/// Downscales so the result fits within `max_width` x `max_height`, keeping
/// the aspect ratio. Never upscales: if the buffer already fits it is returned
/// as is.
pub fn resize_to_fit(buffer: PixelBuffer, max_width: u32, max_height: u32)
                     -> Result<PixelBuffer, CaptureError> {
    let (width, height) = buffer.dimensions();
    if width == 0 || height == 0 || max_width == 0 || max_height == 0 {
        return Err(CaptureError::InvalidArgument(
            format!("cannot fit {}x{} into {}x{}", width, height, max_width, max_height)));
    }
    let scale = f32::min(max_width as f32 / width as f32,
                         max_height as f32 / height as f32);
    if scale >= 1.0 {
        return Ok(buffer);
    }
    // A very thin buffer can scale to zero along one axis; keep one pixel.
    let new_width = u32::max(1, (width as f32 * scale) as u32);
    let new_height = u32::max(1, (height as f32 * scale) as u32);

    let src = Image::from_vec_u8(width, height, buffer.into_raw(), PixelType::U8x4)
        .map_err(|e| CaptureError::InvalidArgument(e.to_string()))?;
    let mut dst = Image::new(new_width, new_height, PixelType::U8x4);
    let mut resizer = Resizer::new();
    resizer.resize(&src, &mut dst,
                   &ResizeOptions::new().resize_alg(
                       ResizeAlg::Convolution(FilterType::Bilinear)))
        .map_err(|e| CaptureError::InvalidArgument(e.to_string()))?;
    RgbaImage::from_raw(new_width, new_height, dst.into_vec())
        .ok_or_else(|| CaptureError::InvalidArgument(
            "resized buffer has unexpected length".to_string()))
}

/// Fixed correction for the green cast of the front sensor: green scaled by
/// 0.9, red by 1.05 and blue by 1.02 (both clamped at 255), alpha unchanged.
/// Not idempotent; every application shifts the color again.
pub fn adjust_color_balance(mut buffer: PixelBuffer) -> PixelBuffer {
    for pixel in buffer.pixels_mut() {
        let Rgba([red, green, blue, alpha]) = *pixel;
        let red = u32::min(255, (red as f64 * 1.05) as u32) as u8;
        let green = (green as f64 * 0.9) as u8;
        let blue = u32::min(255, (blue as f64 * 1.02) as u32) as u8;
        *pixel = Rgba([red, green, blue, alpha]);
    }
    buffer
}

/// Stamps the bus label and the current local time at the bottom left.
pub fn add_text_overlay(buffer: PixelBuffer, label: &str) -> PixelBuffer {
    add_text_overlay_at(buffer, label, Local::now())
}

const GLYPH_SIZE: u32 = 8;
// Android's Color.argb(180, 0, 0, 0).
const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 180]);
const TEXT: Rgba<u8> = Rgba([255, 255, 255, 255]);
const SHADOW: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// As add_text_overlay(), with the timestamp supplied by the caller.
pub fn add_text_overlay_at(buffer: PixelBuffer, label: &str, when: DateTime<Local>)
                           -> PixelBuffer {
    let (width, height) = buffer.dimensions();
    if width == 0 || height == 0 {
        return buffer;
    }
    let line1 = format!("Bus: {}", label);
    let line2 = format!("Date: {}", when.format("%d/%m/%Y %H:%M:%S"));

    // Glyphs are 8x8 cells scaled up to roughly 5% of the buffer width.
    let font_size = width as f32 * 0.05;
    let scale = u32::max(1, (font_size / GLYPH_SIZE as f32).round() as u32);
    let text_height = GLYPH_SIZE * scale;
    // Labels of any length are accepted; the box is capped at the buffer width.
    let text_width = |line: &str| {
        u32::try_from(line.chars().count()).unwrap_or(u32::MAX)
            .saturating_mul(GLYPH_SIZE * scale)
    };
    let max_text_width = u32::max(text_width(&line1), text_width(&line2));
    let line_spacing = (text_height as f32 * 0.3) as u32;
    let padding = (width as f32 * 0.03) as u32;

    let background_height = text_height * 2 + line_spacing + padding * 2;
    let background_y = height as i64 - background_height as i64;
    let background_width = u32::min(width, max_text_width.saturating_add(padding * 2));

    let mut canvas = Blend(buffer);
    draw_filled_rect_mut(&mut canvas,
                         Rect::at(0, clamp_i32(background_y))
                         .of_size(background_width, background_height),
                         BACKGROUND);
    let Blend(mut buffer) = canvas;

    let x = padding as i64;
    let mut y = background_y + padding as i64;
    let shadow_offset = i64::from(u32::max(1, scale / 2));
    for line in [&line1, &line2] {
        draw_line(&mut buffer, line, x + shadow_offset, y + shadow_offset, scale, SHADOW);
        draw_line(&mut buffer, line, x, y, scale, TEXT);
        y += (text_height + line_spacing) as i64;
    }
    buffer
}

fn glyph(c: char) -> [u8; 8] {
    BASIC_FONTS.get(c)
        .or_else(|| LATIN_FONTS.get(c))
        .or_else(|| BASIC_FONTS.get('?'))
        .unwrap_or([0; 8])
}

fn draw_line(buffer: &mut PixelBuffer, line: &str, x: i64, y: i64, scale: u32,
             color: Rgba<u8>) {
    let advance = (GLYPH_SIZE * scale) as i64;
    for (i, c) in line.chars().enumerate() {
        let glyph_x = x + i as i64 * advance;
        if glyph_x >= buffer.width() as i64 {
            break;
        }
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                // Bit 0 is the leftmost pixel.
                if bits & (1 << col) == 0 {
                    continue;
                }
                let px = glyph_x + (col * scale) as i64;
                let py = y + (row as u32 * scale) as i64;
                draw_filled_rect_mut(buffer,
                                     Rect::at(clamp_i32(px), clamp_i32(py))
                                     .of_size(scale, scale),
                                     color);
            }
        }
    }
}

fn clamp_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}
