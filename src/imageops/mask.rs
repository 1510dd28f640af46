use image::{GrayImage, Luma, Rgb, RgbImage, RgbaImage};
use imageproc::morphology::{grayscale_dilate, grayscale_erode, Mask};

use crate::errors::{Result, SpriteCullError};
use crate::imageops::blur::gaussian_blur_gray;

fn disk(radius: u32) -> Mask {
    Mask::disk(radius.min(u8::MAX as u32) as u8)
}

/// Minimum filter with an elliptical window of the given radius.
pub fn erode(mask: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    grayscale_erode(mask, &disk(radius))
}

/// Maximum filter with an elliptical window of the given radius.
pub fn dilate(mask: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    grayscale_dilate(mask, &disk(radius))
}

pub fn open(mask: &GrayImage, radius: u32) -> GrayImage {
    dilate(&erode(mask, radius), radius)
}

pub fn close(mask: &GrayImage, radius: u32) -> GrayImage {
    erode(&dilate(mask, radius), radius)
}

/// Binarises: values strictly above `level` become 255, everything else 0.
pub fn threshold(mask: &GrayImage, level: u8) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([if mask.get_pixel(x, y)[0] > level { 255 } else { 0 }])
    })
}

/// Softens mask edges with a `(2 * radius + 1)` Gaussian window.
pub fn feather(mask: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    gaussian_blur_gray(mask, (radius * 2 + 1) as usize, 0.0)
}

/// Keeps only pixels opaque in both masks (per-pixel minimum).
pub fn intersect_alpha(mask: &GrayImage, existing: &GrayImage) -> Result<GrayImage> {
    ensure_same_size(mask.dimensions(), existing.dimensions())?;
    Ok(GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([mask.get_pixel(x, y)[0].min(existing.get_pixel(x, y)[0])])
    }))
}

pub fn alpha_channel(image: &RgbaImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y)[3]])
    })
}

/// Builds an RGBA image from colour data and a mask of the same size.
pub fn replace_alpha(rgb: &RgbImage, mask: &GrayImage) -> Result<RgbaImage> {
    ensure_same_size(rgb.dimensions(), mask.dimensions())?;
    Ok(RgbaImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let Rgb([r, g, b]) = *rgb.get_pixel(x, y);
        image::Rgba([r, g, b, mask.get_pixel(x, y)[0]])
    }))
}

fn ensure_same_size(expected: (u32, u32), actual: (u32, u32)) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(SpriteCullError::validation(
            "mask",
            format!(
                "size {}x{} does not match image size {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask() -> GrayImage {
        GrayImage::from_fn(21, 21, |x, y| {
            Luma([if (5..16).contains(&x) && (5..16).contains(&y) { 255 } else { 0 }])
        })
    }

    fn count_on(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p[0] > 0).count()
    }

    #[test]
    fn test_erode_and_dilate_change_area() {
        let mask = square_mask();
        let base = count_on(&mask);
        assert!(count_on(&erode(&mask, 2)) < base);
        assert!(count_on(&dilate(&mask, 2)) > base);
        assert_eq!(count_on(&erode(&mask, 0)), base);
    }

    #[test]
    fn test_open_removes_speck() {
        let mut mask = square_mask();
        mask.put_pixel(1, 1, Luma([255]));
        let opened = open(&mask, 1);
        assert_eq!(opened.get_pixel(1, 1)[0], 0);
        assert_eq!(opened.get_pixel(10, 10)[0], 255);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mask = GrayImage::from_fn(3, 1, |x, _| Luma([[10, 11, 200][x as usize]]));
        let out = threshold(&mask, 10);
        assert_eq!(out.as_raw(), &vec![0, 255, 255]);
    }

    #[test]
    fn test_intersect_alpha() -> Result<()> {
        let a = GrayImage::from_fn(2, 1, |x, _| Luma([if x == 0 { 255 } else { 100 }]));
        let b = GrayImage::from_fn(2, 1, |x, _| Luma([if x == 0 { 0 } else { 255 }]));
        let out = intersect_alpha(&a, &b)?;
        assert_eq!(out.as_raw(), &vec![0, 100]);

        let small = GrayImage::new(1, 1);
        assert!(intersect_alpha(&a, &small).is_err());
        Ok(())
    }

    #[test]
    fn test_replace_alpha() -> Result<()> {
        let rgb = RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]));
        let mask = GrayImage::from_pixel(2, 2, Luma([77]));
        let rgba = replace_alpha(&rgb, &mask)?;
        assert_eq!(rgba.get_pixel(1, 1).0, [1, 2, 3, 77]);
        Ok(())
    }
}
