//! Background removal by matting model or HSV colour key, plus the outline
//! and edge-shrink passes that operate on the resulting alpha.

use clap::ValueEnum;
use image::{DynamicImage, GrayImage, Rgb, RgbaImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::frames::{process_frames, FrameProject, ImageSource};
use crate::imageops::{
    alpha_channel, close, dilate, erode, feather, gaussian_blur_gray, intersect_alpha, open,
    replace_alpha, rgb_to_hsv, threshold, Hsv,
};
use crate::model::AiModel;
use crate::progress_tracker::CancelFlag;
use crate::traits::MattingModel;

const OUTLINE_MIN_AREA: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
    #[default]
    Ai,
    Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outline {
    pub thickness: u32,
    pub color: Rgb<u8>,
}

impl Default for Outline {
    fn default() -> Self {
        Self {
            thickness: 2,
            color: Rgb([0, 0, 0]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiParams {
    pub model: AiModel,
    /// Binarise the mask above this value; 0 keeps it soft.
    pub alpha_threshold: u8,
    /// Positive erodes, negative dilates.
    pub erode: i32,
    pub feather: u32,
    pub force_cpu: bool,
    pub outline: Option<Outline>,
}

impl Default for AiParams {
    fn default() -> Self {
        Self {
            model: AiModel::default(),
            alpha_threshold: 0,
            erode: 0,
            feather: 0,
            force_cpu: false,
            outline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorParams {
    pub lower: Hsv,
    pub upper: Hsv,
    /// Keep the matched colour instead of removing it.
    pub invert: bool,
    pub feather: u32,
    pub denoise: u32,
}

impl Default for ColorParams {
    fn default() -> Self {
        ColorPreset::Green.params()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorPreset {
    Green,
    Blue,
    White,
    Black,
}

impl ColorPreset {
    pub fn params(self) -> ColorParams {
        let (lower, upper) = match self {
            Self::Green => (Hsv::new(35, 50, 50), Hsv::new(85, 255, 255)),
            Self::Blue => (Hsv::new(100, 50, 50), Hsv::new(130, 255, 255)),
            Self::White => (Hsv::new(0, 0, 200), Hsv::new(180, 30, 255)),
            Self::Black => (Hsv::new(0, 0, 0), Hsv::new(180, 255, 50)),
        };
        ColorParams {
            lower,
            upper,
            invert: false,
            feather: 0,
            denoise: 1,
        }
    }
}

/// Threshold, then erode or dilate, then feather.
pub fn postprocess_mask(mask: &GrayImage, alpha_threshold: u8, erode_px: i32, feather_px: u32) -> GrayImage {
    let mut result = if alpha_threshold > 0 {
        threshold(mask, alpha_threshold)
    } else {
        mask.clone()
    };
    if erode_px > 0 {
        result = erode(&result, erode_px.unsigned_abs());
    } else if erode_px < 0 {
        result = dilate(&result, erode_px.unsigned_abs());
    }
    feather(&result, feather_px)
}

/// Foreground mask of everything outside (or, inverted, inside) the HSV range.
pub fn color_mask(image: &DynamicImage, params: &ColorParams) -> GrayImage {
    let rgb = image.to_rgb8();
    let mut mask = GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let matched = rgb_to_hsv(*rgb.get_pixel(x, y)).within(&params.lower, &params.upper);
        image::Luma([if matched != params.invert { 0 } else { 255 }])
    });
    if params.denoise > 0 {
        mask = close(&open(&mask, params.denoise), params.denoise);
    }
    feather(&mask, params.feather)
}

/// Attaches `mask` as alpha, intersected with any alpha the image already has.
pub fn apply_mask(image: &DynamicImage, mask: &GrayImage) -> Result<RgbaImage> {
    let mask = if image.color().has_alpha() {
        intersect_alpha(mask, &alpha_channel(&image.to_rgba8()))?
    } else {
        mask.clone()
    };
    replace_alpha(&image.to_rgb8(), &mask)
}

/// Either removal strategy, ready to run on many frames.
pub enum BackgroundRemover<'a> {
    Ai {
        model: &'a dyn MattingModel,
        params: AiParams,
    },
    Color(ColorParams),
}

impl BackgroundRemover<'_> {
    pub fn remove(&self, image: &DynamicImage) -> Result<RgbaImage> {
        match self {
            Self::Ai { model, params } => {
                let predicted = model.predict_mask(&image.to_rgb8())?;
                let mask = postprocess_mask(&predicted, params.alpha_threshold, params.erode, params.feather);
                let rgba = apply_mask(image, &mask)?;
                Ok(match params.outline {
                    Some(outline) => add_outline(&rgba, outline.thickness, outline.color),
                    None => rgba,
                })
            }
            Self::Color(params) => apply_mask(image, &color_mask(image, params)),
        }
    }
}

fn shoelace_area(points: &[imageproc::point::Point<i32>]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let twice: i64 = (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64
        })
        .sum();
    twice.abs() as f64 / 2.0
}

/// Draws a `thickness`-wide band in `color` along the outer silhouette.
/// Specks with an area of 100 px or less get no outline. Alpha is untouched.
pub fn add_outline(rgba: &RgbaImage, thickness: u32, color: Rgb<u8>) -> RgbaImage {
    if thickness == 0 {
        return rgba.clone();
    }

    let smoothed = gaussian_blur_gray(&alpha_channel(rgba), 5, 0.0);
    let binary = erode(&close(&threshold(&smoothed, 127), 2), 2);
    let contours: Vec<_> = find_contours::<i32>(&binary)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter(|c| shoelace_area(&c.points) > OUTLINE_MIN_AREA)
        .collect();
    if contours.is_empty() {
        return rgba.clone();
    }

    // a thickness x thickness stamp per contour point, so a straight edge
    // gets a band exactly `thickness` wide
    let mut band = GrayImage::new(rgba.width(), rgba.height());
    let lead = ((thickness - 1) / 2) as i32;
    for contour in &contours {
        for point in &contour.points {
            let stamp = Rect::at(point.x - lead, point.y - lead).of_size(thickness, thickness);
            draw_filled_rect_mut(&mut band, stamp, image::Luma([255]));
        }
    }

    let mut result = rgba.clone();
    for (x, y, pixel) in result.enumerate_pixels_mut() {
        if band.get_pixel(x, y)[0] > 0 {
            pixel[0] = color[0];
            pixel[1] = color[1];
            pixel[2] = color[2];
        }
    }
    result
}

/// Erodes the alpha channel by `px`. Frames without alpha return `None`.
pub fn shrink_edges(image: &DynamicImage, px: u32) -> Option<RgbaImage> {
    if !image.color().has_alpha() {
        return None;
    }
    let rgba = image.to_rgba8();
    let alpha = erode(&alpha_channel(&rgba), px);
    replace_alpha(&image.to_rgb8(), &alpha).ok()
}

pub fn remove_backgrounds(
    project: &mut FrameProject,
    indices: &[usize],
    remover: &BackgroundRemover<'_>,
    source: ImageSource,
    progress: &ProgressBar,
    cancel: &CancelFlag,
) -> Result<usize> {
    let written = process_frames(project, indices, source, progress, cancel, |image| {
        remover.remove(image).map(|rgba| Some(DynamicImage::ImageRgba8(rgba)))
    })?;
    tracing::info!("removed background from {} frames", written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockMattingModel;
    use image::{RgbImage, Rgba};
    use tempfile::TempDir;

    fn green_screen() -> RgbImage {
        let mut image = RgbImage::from_pixel(40, 40, Rgb([0, 255, 0]));
        for y in 10..30 {
            for x in 10..30 {
                image.put_pixel(x, y, Rgb([200, 40, 40]));
            }
        }
        image
    }

    fn opaque_square(size: u32, inset: u32) -> RgbaImage {
        RgbaImage::from_fn(size, size, |x, y| {
            let inside = (inset..size - inset).contains(&x) && (inset..size - inset).contains(&y);
            if inside {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([255, 255, 255, 0])
            }
        })
    }

    #[test]
    fn test_postprocess_mask_steps() {
        let mut mask = GrayImage::new(20, 20);
        for y in 5..15 {
            for x in 5..15 {
                mask.put_pixel(x, y, image::Luma([180]));
            }
        }
        mask.put_pixel(0, 0, image::Luma([40]));

        let hard = postprocess_mask(&mask, 100, 0, 0);
        assert_eq!(hard.get_pixel(6, 6)[0], 255);
        assert_eq!(hard.get_pixel(0, 0)[0], 0);

        let eroded = postprocess_mask(&mask, 100, 1, 0);
        assert_eq!(eroded.get_pixel(5, 5)[0], 0);
        assert_eq!(eroded.get_pixel(10, 10)[0], 255);

        let dilated = postprocess_mask(&mask, 100, -1, 0);
        assert_eq!(dilated.get_pixel(4, 10)[0], 255);

        let soft = postprocess_mask(&mask, 100, 0, 2);
        let edge = soft.get_pixel(5, 10)[0];
        assert!(edge > 0 && edge < 255);
    }

    #[test]
    fn test_color_key_green_screen() -> Result<()> {
        let image = DynamicImage::ImageRgb8(green_screen());
        let rgba = BackgroundRemover::Color(ColorPreset::Green.params()).remove(&image)?;
        assert_eq!(rgba.get_pixel(0, 0)[3], 0);
        assert_eq!(rgba.get_pixel(20, 20)[3], 255);
        assert_eq!(rgba.get_pixel(20, 20)[0], 200);

        let inverted = ColorParams {
            invert: true,
            ..ColorPreset::Green.params()
        };
        let mask = color_mask(&image, &inverted);
        assert_eq!(mask.get_pixel(0, 0)[0], 255);
        assert_eq!(mask.get_pixel(20, 20)[0], 0);
        Ok(())
    }

    #[test]
    fn test_existing_alpha_is_kept() -> Result<()> {
        let mut rgba = RgbaImage::from_pixel(8, 8, Rgba([200, 10, 10, 255]));
        rgba.put_pixel(3, 3, Rgba([200, 10, 10, 0]));
        let image = DynamicImage::ImageRgba8(rgba);

        let model = MockMattingModel::new(320);
        let remover = BackgroundRemover::Ai {
            model: &model,
            params: AiParams::default(),
        };
        let out = remover.remove(&image)?;
        assert_eq!(out.get_pixel(3, 3)[3], 0);
        assert_eq!(out.get_pixel(4, 4)[3], 255);
        Ok(())
    }

    #[test]
    fn test_add_outline_colours_edge_only() {
        let rgba = opaque_square(40, 10);
        let outlined = add_outline(&rgba, 2, Rgb([255, 0, 0]));
        let edge_hits = outlined
            .pixels()
            .filter(|p| p.0 == [255, 0, 0, 255] || p.0 == [255, 0, 0, 0])
            .count();
        assert!(edge_hits > 0);
        assert_eq!(outlined.get_pixel(20, 20), &Rgba([255, 255, 255, 255]));
        assert_eq!(alpha_channel(&outlined), alpha_channel(&rgba));
    }

    #[test]
    fn test_add_outline_band_width_matches_thickness() {
        let rgba = opaque_square(40, 10);
        for thickness in 1..=4 {
            let outlined = add_outline(&rgba, thickness, Rgb([255, 0, 0]));
            // column through the middle of the top edge
            let rows = (0..20)
                .filter(|&y| outlined.get_pixel(20, y).0[..3] == [255, 0, 0])
                .count();
            assert_eq!(rows, thickness as usize, "thickness {}", thickness);
        }
    }

    #[test]
    fn test_add_outline_ignores_specks() {
        let rgba = opaque_square(20, 7);
        assert_eq!(add_outline(&rgba, 2, Rgb([255, 0, 0])), rgba);
        assert_eq!(add_outline(&opaque_square(40, 10), 0, Rgb([255, 0, 0])), opaque_square(40, 10));
    }

    #[test]
    fn test_shrink_edges() {
        let rgba = opaque_square(20, 5);
        let shrunk = shrink_edges(&DynamicImage::ImageRgba8(rgba), 1).unwrap();
        assert_eq!(shrunk.get_pixel(5, 10)[3], 0);
        assert_eq!(shrunk.get_pixel(10, 10)[3], 255);
        assert!(shrink_edges(&DynamicImage::new_rgb8(4, 4), 1).is_none());
    }

    #[test]
    fn test_remove_backgrounds_updates_project() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut project = FrameProject::create(temp_dir.path().join("p"), None)?;
        for _ in 0..3 {
            project.add_frame(&DynamicImage::ImageRgb8(green_screen()), 0.0)?;
        }

        let remover = BackgroundRemover::Color(ColorPreset::Green.params());
        let written = remove_backgrounds(
            &mut project,
            &[0, 2],
            &remover,
            ImageSource::Processed,
            &ProgressBar::hidden(),
            &CancelFlag::new(),
        )?;
        assert_eq!(written, 2);
        assert!(project.frame(0).unwrap().has_processed());
        assert!(!project.frame(1).unwrap().has_processed());
        assert_eq!(project.load_display_image(2)?.to_rgba8().get_pixel(0, 0)[3], 0);
        Ok(())
    }
}
