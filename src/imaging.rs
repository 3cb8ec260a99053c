//! Raster operations on item files: crop/resize normalization, tonal
//! curves, and quarter-turn rotation.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use std::path::Path;

pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("opening image {}", path.display()))
}

pub fn save_image(image: &DynamicImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image
        .save(path)
        .with_context(|| format!("saving image {}", path.display()))
}

/// Dimensions of an on-disk image without decoding pixel data.
pub fn image_dimensions(path: &Path) -> Result<(u32, u32)> {
    image::image_dimensions(path)
        .with_context(|| format!("reading dimensions of {}", path.display()))
}

/// Downscale to fit within `size`x`size`, preserving aspect ratio.
pub fn thumbnail(image: &DynamicImage, size: u32) -> DynamicImage {
    image.thumbnail(size, size)
}

/// Resize so height equals `target_height`, preserving aspect ratio.
pub fn resize_to_height(image: &DynamicImage, target_height: u32) -> DynamicImage {
    let width = (image.width() as f64 * target_height as f64 / image.height() as f64)
        .round()
        .max(1.0) as u32;
    image.resize_exact(width, target_height, FilterType::Lanczos3)
}

/// Crop by two corner points given in the source image's own pixel space,
/// then normalize to the canonical display height. Corners may arrive in
/// any order and are clamped to the image bounds.
pub fn crop_and_resize_image(
    image: &DynamicImage,
    corner_a: (f64, f64),
    corner_b: (f64, f64),
    target_height: u32,
) -> Result<DynamicImage> {
    let (width, height) = (image.width() as f64, image.height() as f64);

    let left = corner_a.0.min(corner_b.0).clamp(0.0, width);
    let right = corner_a.0.max(corner_b.0).clamp(0.0, width);
    let top = corner_a.1.min(corner_b.1).clamp(0.0, height);
    let bottom = corner_a.1.max(corner_b.1).clamp(0.0, height);

    let crop_w = ((right - left).round() as u32).max(1);
    let crop_h = ((bottom - top).round() as u32).max(1);

    let cropped = image.crop_imm(left.round() as u32, top.round() as u32, crop_w, crop_h);
    Ok(resize_to_height(&cropped, target_height))
}

/// Map two on-screen corner points from the rendered size back to source
/// pixels, then crop and normalize.
pub fn crop_from_view(
    image: &DynamicImage,
    rendered: (u32, u32),
    corner_a: (f64, f64),
    corner_b: (f64, f64),
    target_height: u32,
) -> Result<DynamicImage> {
    let scale_x = image.width() as f64 / rendered.0.max(1) as f64;
    let scale_y = image.height() as f64 / rendered.1.max(1) as f64;
    crop_and_resize_image(
        image,
        (corner_a.0 * scale_x, corner_a.1 * scale_y),
        (corner_b.0 * scale_x, corner_b.1 * scale_y),
        target_height,
    )
}

/// Build the 256-entry tonal lookup table for a contrast curve. `alpha` in
/// [-1, 1] bends the midpoint: 0 is identity, positive brightens shadows,
/// negative deepens them. The curve passes through (0,0), (x, 255-x) and
/// (255,255) where x = 127.5 * (1 - alpha).
pub fn build_curve(alpha: f64) -> [u8; 256] {
    let alpha = alpha.clamp(-1.0, 1.0);
    let x = 127.5 * (1.0 - alpha);
    let y = 255.0 - x;

    let mut lut = [0u8; 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        let t = i as f64;
        let value = if (x - 127.5).abs() < f64::EPSILON {
            t
        } else if t <= x {
            t * y / x.max(f64::EPSILON)
        } else {
            y + (t - x) * (255.0 - y) / (255.0 - x)
        };
        *slot = value.clamp(0.0, 255.0).round() as u8;
    }
    lut
}

/// Apply a tonal curve to the RGB channels, leaving alpha untouched.
pub fn apply_rgb_curve(image: &DynamicImage, alpha: f64) -> DynamicImage {
    if alpha == 0.0 {
        return image.clone();
    }
    let lut = build_curve(alpha);
    let mut rgba: RgbaImage = image.to_rgba8();
    for Rgba([r, g, b, _a]) in rgba.pixels_mut() {
        *r = lut[*r as usize];
        *g = lut[*g as usize];
        *b = lut[*b as usize];
    }
    DynamicImage::ImageRgba8(rgba)
}

/// Rotate by quarter turns; positive turns are clockwise.
pub fn rotate_quarter_turns(image: &DynamicImage, turns: i32) -> DynamicImage {
    match turns.rem_euclid(4) {
        1 => image.rotate90(),
        2 => image.rotate180(),
        3 => image.rotate270(),
        _ => image.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img = RgbaImage::from_fn(width, height, |x, _y| {
            Rgba([(x % 256) as u8, 0, 0, 255])
        });
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn test_resize_to_height_preserves_aspect() {
        let img = gradient(400, 200);
        let resized = resize_to_height(&img, 800);
        assert_eq!(resized.height(), 800);
        assert_eq!(resized.width(), 1600);
    }

    #[test]
    fn test_crop_corners_any_order() {
        let img = gradient(200, 100);
        let a = crop_and_resize_image(&img, (10.0, 10.0), (110.0, 60.0), 50).unwrap();
        let b = crop_and_resize_image(&img, (110.0, 60.0), (10.0, 10.0), 50).unwrap();
        assert_eq!(a.dimensions(), b.dimensions());
        assert_eq!(a.height(), 50);
        assert_eq!(a.width(), 100);
    }

    #[test]
    fn test_crop_clamps_out_of_bounds() {
        let img = gradient(100, 100);
        let cropped = crop_and_resize_image(&img, (-50.0, -50.0), (500.0, 500.0), 100).unwrap();
        assert_eq!(cropped.dimensions(), (100, 100));
    }

    #[test]
    fn test_curve_identity() {
        let lut = build_curve(0.0);
        for (i, v) in lut.iter().enumerate() {
            assert_eq!(*v as usize, i);
        }
    }

    #[test]
    fn test_curve_endpoints_fixed() {
        for alpha in [-0.8, -0.3, 0.3, 0.8] {
            let lut = build_curve(alpha);
            assert_eq!(lut[0], 0);
            assert_eq!(lut[255], 255);
        }
        // Positive alpha lifts the lower midtones.
        let lifted = build_curve(0.5);
        assert!(lifted[64] > 64);
        let deepened = build_curve(-0.5);
        assert!(deepened[64] < 64);
    }

    #[test]
    fn test_rotate_clockwise() {
        let img = gradient(200, 100);
        let once = rotate_quarter_turns(&img, 1);
        assert_eq!(once.dimensions(), (100, 200));
        // Top-left of the source ends up at the top-right after a
        // clockwise turn.
        assert_eq!(once.get_pixel(99, 0), img.get_pixel(0, 0));
        let around = rotate_quarter_turns(&img, 4);
        assert_eq!(around.dimensions(), (200, 100));
    }
}
