//! Operator feedback: boxes and names drawn over the live frame.

use crate::font;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use rollcall_vision::BoundingBox;
use thiserror::Error;

pub const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BANNER_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const BOX_THICKNESS: u32 = 2;
const TEXT_SCALE: u32 = 3;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("window error: {0}")]
    Window(String),
}

/// One face to draw.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub label: String,
    pub known: bool,
}

/// Where frames go for the operator to see.
pub trait Viewer {
    fn show(
        &mut self,
        image: &RgbImage,
        annotations: &[Annotation],
        banner: Option<&str>,
    ) -> Result<(), DisplayError>;

    /// True once the operator asked to stop (Esc/Q, closed window, ...).
    fn stop_requested(&self) -> bool;
}

/// Draw annotations and an optional banner onto `image`.
pub fn annotate(image: &mut RgbImage, annotations: &[Annotation], banner: Option<&str>) {
    for a in annotations {
        let color = if a.known { KNOWN_COLOR } else { UNKNOWN_COLOR };
        let (x0, y0) = (a.bbox.x.round() as i32, a.bbox.y.round() as i32);
        let width = a.bbox.width.round().max(1.0) as u32;
        let height = a.bbox.height.round().max(1.0) as u32;

        for inset in 0..BOX_THICKNESS {
            if width <= 2 * inset || height <= 2 * inset {
                break;
            }
            let rect = Rect::at(x0 + inset as i32, y0 + inset as i32)
                .of_size(width - 2 * inset, height - 2 * inset);
            draw_hollow_rect_mut(image, rect, color);
        }

        // Filled strip under the box holding the name.
        let strip_y = y0 + height as i32;
        let strip_h = font::GLYPH_HEIGHT * TEXT_SCALE + 6;
        let strip_w = width.max(font::text_width(&a.label, TEXT_SCALE) + 6);
        draw_filled_rect_mut(image, Rect::at(x0, strip_y).of_size(strip_w, strip_h), color);
        font::draw_text(
            image,
            x0 as i64 + 3,
            strip_y as i64 + 3,
            &a.label,
            LABEL_TEXT_COLOR,
            TEXT_SCALE,
        );
    }

    if let Some(text) = banner {
        font::draw_text(image, 10, 10, text, BANNER_COLOR, TEXT_SCALE);
    }
}

/// A desktop window via `minifb`. Esc or Q requests stop, as does reaching
/// `max_frames` if given.
pub struct WindowViewer {
    window: minifb::Window,
    buffer: Vec<u32>,
    shown: usize,
    max_frames: Option<usize>,
}

impl WindowViewer {
    pub fn new(
        title: &str,
        width: usize,
        height: usize,
        max_frames: Option<usize>,
    ) -> Result<Self, DisplayError> {
        let mut window = minifb::Window::new(
            title,
            width,
            height,
            minifb::WindowOptions {
                resize: true,
                ..minifb::WindowOptions::default()
            },
        )
        .map_err(|e| DisplayError::Window(format!("failed to create window: {e}")))?;
        window.set_target_fps(30);

        Ok(Self {
            window,
            buffer: vec![0; width * height],
            shown: 0,
            max_frames,
        })
    }
}

impl Viewer for WindowViewer {
    fn show(
        &mut self,
        image: &RgbImage,
        annotations: &[Annotation],
        banner: Option<&str>,
    ) -> Result<(), DisplayError> {
        let mut canvas = image.clone();
        annotate(&mut canvas, annotations, banner);

        let (w, h) = (canvas.width() as usize, canvas.height() as usize);
        self.buffer.clear();
        self.buffer.extend(
            canvas
                .pixels()
                .map(|p| ((p[0] as u32) << 16) | ((p[1] as u32) << 8) | p[2] as u32),
        );

        self.shown += 1;
        self.window
            .update_with_buffer(&self.buffer, w, h)
            .map_err(|e| DisplayError::Window(format!("window update failed: {e}")))
    }

    fn stop_requested(&self) -> bool {
        self.max_frames.is_some_and(|max| self.shown >= max)
            || !self.window.is_open()
            || self.window.is_key_down(minifb::Key::Escape)
            || self.window.is_key_down(minifb::Key::Q)
    }
}

/// No window; stops after `max_frames` frames if given.
#[derive(Debug, Default)]
pub struct HeadlessViewer {
    max_frames: Option<usize>,
    pub shown: usize,
    #[cfg(test)]
    pub last_annotations: Vec<Annotation>,
}

impl HeadlessViewer {
    pub fn new(max_frames: Option<usize>) -> Self {
        Self {
            max_frames,
            ..Self::default()
        }
    }
}

impl Viewer for HeadlessViewer {
    fn show(
        &mut self,
        _image: &RgbImage,
        annotations: &[Annotation],
        _banner: Option<&str>,
    ) -> Result<(), DisplayError> {
        self.shown += 1;
        if !annotations.is_empty() {
            let labels: Vec<&str> = annotations.iter().map(|a| a.label.as_str()).collect();
            tracing::debug!(frame = self.shown, ?labels, "faces in frame");
        }
        #[cfg(test)]
        {
            self.last_annotations = annotations.to_vec();
        }
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        self.max_frames.is_some_and(|max| self.shown >= max)
    }
}
