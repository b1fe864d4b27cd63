//! Frame type and pixel conversion — YUYV/MJPG to RGB, dark detection.

use image::{Rgb, RgbImage};

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap an already decoded image, computing the dark flag.
    pub fn from_image(image: RgbImage, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&image, DARK_FRAME_FRACTION);
        Self {
            image,
            sequence,
            is_dark,
        }
    }
}

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_FRACTION: f32 = 0.95;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decoded MJPG frame is {actual:?}, negotiated {expected:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range YCbCr to RGB, fixed point.
fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> Rgb<u8> {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    Rgb([
        clamp_u8((c + 409 * e + 128) >> 8),
        clamp_u8((c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((c + 516 * d + 128) >> 8),
    ])
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let data = &yuyv[..expected];
    let at = |i: usize| data.get(i).copied().unwrap_or(128);
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let idx = (y * width + x) as usize;
        let base = (idx / 2) * 4;
        let luma = if idx % 2 == 0 { at(base) } else { at(base + 2) };
        ycbcr_to_rgb(luma, at(base + 1), at(base + 3))
    }))
}

/// Decode a motion-JPEG buffer and check it matches the negotiated size.
pub fn mjpg_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let image = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?.to_rgb8();
    if image.dimensions() != (width, height) {
        return Err(FrameError::SizeMismatch {
            expected: (width, height),
            actual: image.dimensions(),
        });
    }
    Ok(image)
}

/// Returns true if more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = image.width() as usize * image.height() as usize;
    if total == 0 {
        return true;
    }
    let dark = image
        .pixels()
        .filter(|p| {
            let luma = (299 * p[0] as u32 + 587 * p[1] as u32 + 114 * p[2] as u32) / 1000;
            luma < 32
        })
        .count();
    (dark as f32 / total as f32) > threshold_pct
}
