//! A compact 3x5 bitmap font for operator labels.
//!
//! Lowercase letters are drawn as uppercase; unknown characters render as a
//! filled block.

use image::{Rgb, RgbImage};

pub const GLYPH_WIDTH: u32 = 3;
pub const GLYPH_HEIGHT: u32 = 5;

/// Rows top to bottom, 3 bits each (bit 2 = leftmost column).
fn glyph(c: char) -> [u8; 5] {
    match c.to_ascii_uppercase() {
        'A' => [0x2, 0x5, 0x7, 0x5, 0x5],
        'B' => [0x6, 0x5, 0x6, 0x5, 0x6],
        'C' => [0x3, 0x4, 0x4, 0x4, 0x3],
        'D' => [0x6, 0x5, 0x5, 0x5, 0x6],
        'E' => [0x7, 0x4, 0x6, 0x4, 0x7],
        'F' => [0x7, 0x4, 0x6, 0x4, 0x4],
        'G' => [0x3, 0x4, 0x5, 0x5, 0x3],
        'H' => [0x5, 0x5, 0x7, 0x5, 0x5],
        'I' => [0x7, 0x2, 0x2, 0x2, 0x7],
        'J' => [0x1, 0x1, 0x1, 0x5, 0x2],
        'K' => [0x5, 0x5, 0x6, 0x5, 0x5],
        'L' => [0x4, 0x4, 0x4, 0x4, 0x7],
        'M' => [0x5, 0x7, 0x7, 0x5, 0x5],
        'N' => [0x6, 0x5, 0x5, 0x5, 0x5],
        'O' => [0x2, 0x5, 0x5, 0x5, 0x2],
        'P' => [0x6, 0x5, 0x6, 0x4, 0x4],
        'Q' => [0x2, 0x5, 0x5, 0x6, 0x3],
        'R' => [0x6, 0x5, 0x6, 0x5, 0x5],
        'S' => [0x3, 0x4, 0x2, 0x1, 0x6],
        'T' => [0x7, 0x2, 0x2, 0x2, 0x2],
        'U' => [0x5, 0x5, 0x5, 0x5, 0x7],
        'V' => [0x5, 0x5, 0x5, 0x5, 0x2],
        'W' => [0x5, 0x5, 0x7, 0x7, 0x5],
        'X' => [0x5, 0x5, 0x2, 0x5, 0x5],
        'Y' => [0x5, 0x5, 0x2, 0x2, 0x2],
        'Z' => [0x7, 0x1, 0x2, 0x4, 0x7],
        '0' => [0x7, 0x5, 0x5, 0x5, 0x7],
        '1' => [0x2, 0x6, 0x2, 0x2, 0x7],
        '2' => [0x6, 0x1, 0x2, 0x4, 0x7],
        '3' => [0x6, 0x1, 0x2, 0x1, 0x6],
        '4' => [0x5, 0x5, 0x7, 0x1, 0x1],
        '5' => [0x7, 0x4, 0x6, 0x1, 0x6],
        '6' => [0x3, 0x4, 0x7, 0x5, 0x7],
        '7' => [0x7, 0x1, 0x2, 0x2, 0x2],
        '8' => [0x7, 0x5, 0x7, 0x5, 0x7],
        '9' => [0x7, 0x5, 0x7, 0x1, 0x6],
        ' ' => [0x0, 0x0, 0x0, 0x0, 0x0],
        '.' => [0x0, 0x0, 0x0, 0x0, 0x2],
        ',' => [0x0, 0x0, 0x0, 0x2, 0x4],
        ':' => [0x0, 0x2, 0x0, 0x2, 0x0],
        '-' => [0x0, 0x0, 0x7, 0x0, 0x0],
        '_' => [0x0, 0x0, 0x0, 0x0, 0x7],
        '/' => [0x1, 0x1, 0x2, 0x4, 0x4],
        '(' => [0x2, 0x4, 0x4, 0x4, 0x2],
        ')' => [0x2, 0x1, 0x1, 0x1, 0x2],
        '!' => [0x2, 0x2, 0x2, 0x0, 0x2],
        '?' => [0x6, 0x1, 0x2, 0x0, 0x2],
        '\'' => [0x2, 0x2, 0x0, 0x0, 0x0],
        _ => [0x7, 0x7, 0x7, 0x7, 0x7],
    }
}

/// Advance per character at `scale`, including one column of spacing.
pub fn advance(scale: u32) -> u32 {
    (GLYPH_WIDTH + 1) * scale
}

pub fn text_width(text: &str, scale: u32) -> u32 {
    text.chars().count() as u32 * advance(scale)
}

/// Draw `text` with its top-left corner at (x, y). Pixels outside the image
/// are clipped.
pub fn draw_text(image: &mut RgbImage, x: i64, y: i64, text: &str, color: Rgb<u8>, scale: u32) {
    let scale = scale.max(1) as i64;
    let mut cx = x;
    for c in text.chars() {
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH as i64 {
                if bits & (0x4 >> col) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        put_clipped(image, cx + col * scale + dx, y + row as i64 * scale + dy, color);
                    }
                }
            }
        }
        cx += advance(scale as u32) as i64;
    }
}

fn put_clipped(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u64) < image.width() as u64 && (y as u64) < image.height() as u64 {
        image.put_pixel(x as u32, y as u32, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_width() {
        assert_eq!(text_width("ALICE", 2), 5 * 8);
        assert_eq!(text_width("", 3), 0);
    }

    #[test]
    fn test_draw_letter_l() {
        let mut image = RgbImage::new(10, 10);
        let white = Rgb([255, 255, 255]);
        draw_text(&mut image, 0, 0, "l", white, 1);

        // Left column fully lit, bottom row fully lit, top-right dark.
        for y in 0..5 {
            assert_eq!(*image.get_pixel(0, y), white);
        }
        for x in 0..3 {
            assert_eq!(*image.get_pixel(x, 4), white);
        }
        assert_eq!(*image.get_pixel(2, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_is_clipped() {
        let mut image = RgbImage::new(4, 4);
        draw_text(&mut image, -2, -2, "WW", Rgb([1, 2, 3]), 2);
        draw_text(&mut image, 3, 3, "W", Rgb([1, 2, 3]), 2);
    }
}
