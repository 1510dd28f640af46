//! Geometry passes over the selected frames: scaling and whitespace cropping,
//! plus the batch forms of the alpha edge passes.

use image::{DynamicImage, GenericImage, GenericImageView, Rgb};
use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::background::{add_outline, shrink_edges};
use crate::errors::{Result, SpriteCullError};
use crate::frames::{process_frames, FrameProject, ImageSource};
use crate::imageops::{resize_dynamic, ResampleFilter};
use crate::progress_tracker::CancelFlag;

/// RGB pixels count as content when their channel mean exceeds this.
const RGB_CONTENT_LEVEL: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScaleTarget {
    Percent(f32),
    Fixed(u32, u32),
}

impl ScaleTarget {
    /// Output size for a frame of `width x height`, never below 1x1.
    pub fn target_size(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Self::Percent(pct) => (
                ((width as f32 * pct / 100.0) as u32).max(1),
                ((height as f32 * pct / 100.0) as u32).max(1),
            ),
            Self::Fixed(w, h) => (w.max(1), h.max(1)),
        }
    }

    fn validate(self) -> Result<()> {
        match self {
            Self::Percent(pct) if !(pct > 0.0 && pct.is_finite()) => Err(SpriteCullError::validation(
                "scale",
                format!("percentage must be positive, got {}", pct),
            )),
            Self::Fixed(0, _) | Self::Fixed(_, 0) => Err(SpriteCullError::validation(
                "scale",
                "fixed width and height must be non-zero",
            )),
            _ => Ok(()),
        }
    }
}

/// Inclusive pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bounds {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Bounds {
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    fn union(self, other: Self) -> Self {
        Self {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Margins {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl Margins {
    pub fn uniform(px: u32) -> Self {
        Self {
            top: px,
            bottom: px,
            left: px,
            right: px,
        }
    }
}

/// Bounding box of visible pixels: alpha above zero for images with alpha,
/// a channel mean above 10 otherwise.
pub fn content_bounds(image: &DynamicImage) -> Option<Bounds> {
    let has_alpha = image.color().has_alpha();
    let mut bounds: Option<Bounds> = None;
    for (x, y, pixel) in image.pixels() {
        let visible = if has_alpha {
            pixel[3] > 0
        } else {
            (pixel[0] as f32 + pixel[1] as f32 + pixel[2] as f32) / 3.0 > RGB_CONTENT_LEVEL
        };
        if visible {
            let point = Bounds {
                min_x: x,
                min_y: y,
                max_x: x,
                max_y: y,
            };
            bounds = Some(bounds.map_or(point, |b| b.union(point)));
        }
    }
    bounds
}

pub fn union_content_bounds(images: &[DynamicImage]) -> Option<Bounds> {
    images
        .par_iter()
        .filter_map(content_bounds)
        .reduce_with(Bounds::union)
}

/// Grows `bounds` by `margins`, clamped to a `width x height` frame.
pub fn apply_margins(bounds: Bounds, margins: Margins, width: u32, height: u32) -> Bounds {
    Bounds {
        min_x: bounds.min_x.saturating_sub(margins.left),
        min_y: bounds.min_y.saturating_sub(margins.top),
        max_x: bounds
            .max_x
            .saturating_add(margins.right)
            .min(width.saturating_sub(1))
            .max(bounds.min_x),
        max_y: bounds
            .max_y
            .saturating_add(margins.bottom)
            .min(height.saturating_sub(1))
            .max(bounds.min_y),
    }
}

/// Cuts `bounds` out of `image`. The result always has the size of the box;
/// parts of the box outside a smaller image stay transparent (or black
/// without alpha).
pub fn crop_to(image: &DynamicImage, bounds: Bounds) -> Result<DynamicImage> {
    let (width, height) = image.dimensions();
    if bounds.max_x < width && bounds.max_y < height {
        return Ok(image.crop_imm(bounds.min_x, bounds.min_y, bounds.width(), bounds.height()));
    }

    let mut canvas = DynamicImage::new(bounds.width(), bounds.height(), image.color());
    if bounds.min_x < width && bounds.min_y < height {
        let overlap = image.crop_imm(
            bounds.min_x,
            bounds.min_y,
            (width - bounds.min_x).min(bounds.width()),
            (height - bounds.min_y).min(bounds.height()),
        );
        canvas
            .copy_from(&overlap, 0, 0)
            .map_err(|e| SpriteCullError::ImageProcessing {
                path: String::new(),
                operation: "crop".to_string(),
                source: Box::new(e),
            })?;
    }
    Ok(canvas)
}

/// Largest width and height among `sizes`.
fn max_dimensions(sizes: impl IntoIterator<Item = (u32, u32)>) -> (u32, u32) {
    sizes
        .into_iter()
        .fold((0, 0), |(w, h), (iw, ih)| (w.max(iw), h.max(ih)))
}

/// Crops every image to the shared content box plus `margins`. Margins stop
/// at the edges of the largest image.
pub fn crop_whitespace(images: &[DynamicImage], margins: Margins) -> Result<Vec<DynamicImage>> {
    if images.is_empty() {
        return Err(SpriteCullError::validation("frames", "nothing to crop"));
    }
    let bounds = union_content_bounds(images)
        .ok_or_else(|| SpriteCullError::validation("frames", "no visible content found"))?;
    let (width, height) = max_dimensions(images.iter().map(|image| image.dimensions()));
    let bounds = apply_margins(bounds, margins, width, height);
    images.iter().map(|image| crop_to(image, bounds)).collect()
}

fn require_frames(indices: &[usize]) -> Result<()> {
    if indices.is_empty() {
        return Err(SpriteCullError::validation("selection", "no frames selected"));
    }
    Ok(())
}

/// Scales the listed frames to a size derived from the first one. Returns
/// `Ok(0)` without touching anything when that size is unchanged.
pub fn scale_frames(
    project: &mut FrameProject,
    indices: &[usize],
    target: ScaleTarget,
    filter: ResampleFilter,
    progress: &ProgressBar,
    cancel: &CancelFlag,
) -> Result<usize> {
    require_frames(indices)?;
    target.validate()?;
    let (width, height) = project.load_display_image(indices[0])?.dimensions();
    let (new_w, new_h) = target.target_size(width, height);
    if (new_w, new_h) == (width, height) {
        tracing::info!("frames already {}x{}, nothing to scale", width, height);
        return Ok(0);
    }

    let written = process_frames(project, indices, ImageSource::Processed, progress, cancel, |image| {
        Ok(Some(resize_dynamic(image, new_w, new_h, filter)))
    })?;
    tracing::info!(
        "scaled {} frames from {}x{} to {}x{} ({:?})",
        written,
        width,
        height,
        new_w,
        new_h,
        filter
    );
    Ok(written)
}

/// Crops the listed frames to their shared content box. Returns the box used.
pub fn crop_frames(
    project: &mut FrameProject,
    indices: &[usize],
    margins: Margins,
    progress: &ProgressBar,
    cancel: &CancelFlag,
) -> Result<Bounds> {
    require_frames(indices)?;

    let shared: &FrameProject = project;
    let found: Vec<(Option<Bounds>, (u32, u32))> = indices
        .par_iter()
        .map(|&index| -> Result<(Option<Bounds>, (u32, u32))> {
            cancel.check()?;
            let image = shared.load_display_image(index)?;
            Ok((content_bounds(&image), image.dimensions()))
        })
        .collect::<Result<_>>()?;
    let (width, height) = max_dimensions(found.iter().map(|(_, size)| *size));
    let bounds = found
        .into_iter()
        .filter_map(|(bounds, _)| bounds)
        .reduce(Bounds::union)
        .ok_or_else(|| SpriteCullError::validation("frames", "no visible content found"))?;
    let bounds = apply_margins(bounds, margins, width, height);
    tracing::debug!("crop box {:?} on {}x{} frames", bounds, width, height);

    process_frames(project, indices, ImageSource::Processed, progress, cancel, |image| {
        crop_to(image, bounds).map(Some)
    })?;
    tracing::info!(
        "cropped {} frames from {}x{} to {}x{}",
        indices.len(),
        width,
        height,
        bounds.width(),
        bounds.height()
    );
    Ok(bounds)
}

/// Erodes the alpha of the listed frames. Frames without alpha are skipped.
pub fn shrink_frames(
    project: &mut FrameProject,
    indices: &[usize],
    px: u32,
    progress: &ProgressBar,
    cancel: &CancelFlag,
) -> Result<usize> {
    require_frames(indices)?;
    let written = process_frames(project, indices, ImageSource::Processed, progress, cancel, |image| {
        Ok(shrink_edges(image, px).map(DynamicImage::ImageRgba8))
    })?;
    tracing::info!("shrank edges of {} frames by {}px", written, px);
    Ok(written)
}

/// Outlines the listed frames. Frames without alpha are skipped.
pub fn outline_frames(
    project: &mut FrameProject,
    indices: &[usize],
    thickness: u32,
    color: Rgb<u8>,
    progress: &ProgressBar,
    cancel: &CancelFlag,
) -> Result<usize> {
    require_frames(indices)?;
    let written = process_frames(project, indices, ImageSource::Processed, progress, cancel, |image| {
        if !image.color().has_alpha() {
            return Ok(None);
        }
        Ok(Some(DynamicImage::ImageRgba8(add_outline(
            &image.to_rgba8(),
            thickness,
            color,
        ))))
    })?;
    tracing::info!("outlined {} frames", written);
    Ok(written)
}

/// Loads the listed frames in parallel.
pub fn load_frames(
    project: &FrameProject,
    indices: &[usize],
    source: ImageSource,
    progress: &ProgressBar,
) -> Result<Vec<DynamicImage>> {
    let images = indices
        .par_iter()
        .progress_with(progress.clone())
        .map(|&index| project.load_image(index, source))
        .collect::<Result<Vec<_>>>()?;
    progress.finish();
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage, RgbImage};
    use tempfile::TempDir;

    fn sprite(width: u32, height: u32, x0: u32, y0: u32, x1: u32, y1: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            if (x0..=x1).contains(&x) && (y0..=y1).contains(&y) {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        }))
    }

    fn project_of(images: &[DynamicImage]) -> Result<(TempDir, FrameProject)> {
        let temp_dir = TempDir::new()?;
        let mut project = FrameProject::create(temp_dir.path().join("p"), None)?;
        for image in images {
            project.add_frame(image, 0.0)?;
        }
        Ok((temp_dir, project))
    }

    #[test]
    fn test_target_size() {
        assert_eq!(ScaleTarget::Percent(50.0).target_size(101, 40), (50, 20));
        assert_eq!(ScaleTarget::Percent(1.0).target_size(10, 10), (1, 1));
        assert_eq!(ScaleTarget::Fixed(64, 32).target_size(10, 10), (64, 32));
        assert!(ScaleTarget::Percent(0.0).validate().is_err());
        assert!(ScaleTarget::Fixed(0, 5).validate().is_err());
    }

    #[test]
    fn test_content_bounds_rgb_and_rgba() {
        let rgba = sprite(10, 10, 2, 3, 5, 7);
        assert_eq!(
            content_bounds(&rgba),
            Some(Bounds { min_x: 2, min_y: 3, max_x: 5, max_y: 7 })
        );

        let mut rgb = RgbImage::new(6, 6);
        rgb.put_pixel(4, 1, Rgb([30, 30, 30]));
        rgb.put_pixel(1, 1, Rgb([10, 10, 10]));
        let bounds = content_bounds(&DynamicImage::ImageRgb8(rgb));
        assert_eq!(bounds, Some(Bounds { min_x: 4, min_y: 1, max_x: 4, max_y: 1 }));

        assert_eq!(content_bounds(&DynamicImage::new_rgba8(4, 4)), None);
    }

    #[test]
    fn test_crop_whitespace_union_with_margins() -> Result<()> {
        let images = [sprite(20, 20, 5, 5, 8, 8), sprite(20, 20, 7, 9, 12, 14)];
        let cropped = crop_whitespace(&images, Margins { top: 2, bottom: 10, left: 1, right: 0 })?;
        // union (5,5)-(12,14), bottom margin clamped to row 19
        for image in &cropped {
            assert_eq!(image.dimensions(), (9, 17));
        }
        assert_eq!(cropped[0].to_rgba8().get_pixel(1, 2)[3], 255);
        assert_eq!(cropped[0].to_rgba8().get_pixel(0, 0)[3], 0);

        assert!(matches!(
            crop_whitespace(&[DynamicImage::new_rgba8(4, 4)], Margins::default()),
            Err(SpriteCullError::Validation { .. })
        ));
        assert!(crop_whitespace(&[], Margins::default()).is_err());
        Ok(())
    }

    #[test]
    fn test_crop_whitespace_mixed_sizes() -> Result<()> {
        // small transparent frame first, content only in the larger one
        let images = [DynamicImage::new_rgba8(10, 10), sprite(100, 100, 50, 50, 59, 59)];
        let cropped = crop_whitespace(&images, Margins::uniform(5))?;
        for image in &cropped {
            assert_eq!(image.dimensions(), (20, 20));
        }
        assert_eq!(cropped[1].to_rgba8().get_pixel(5, 5)[3], 255);
        assert_eq!(cropped[1].to_rgba8().get_pixel(4, 4)[3], 0);
        assert!(cropped[0].to_rgba8().pixels().all(|p| p[3] == 0));
        Ok(())
    }

    #[test]
    fn test_crop_to_pads_partial_overlap() -> Result<()> {
        let bounds = Bounds { min_x: 6, min_y: 6, max_x: 11, max_y: 11 };
        let cropped = crop_to(&sprite(8, 8, 0, 0, 7, 7), bounds)?;
        assert_eq!(cropped.dimensions(), (6, 6));
        let rgba = cropped.to_rgba8();
        assert_eq!(rgba.get_pixel(1, 1)[3], 255);
        assert_eq!(rgba.get_pixel(2, 2)[3], 0);

        let rgb = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([200, 200, 200])));
        let outside = crop_to(&rgb, bounds)?;
        assert_eq!(outside.dimensions(), (6, 6));
        assert!(!outside.color().has_alpha());
        assert_eq!(outside.to_rgb8().get_pixel(0, 0).0, [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_apply_margins_keeps_box_ordered() {
        let bounds = Bounds { min_x: 50, min_y: 50, max_x: 59, max_y: 59 };
        let clamped = apply_margins(bounds, Margins::uniform(5), 10, 10);
        assert!(clamped.max_x >= clamped.min_x && clamped.max_y >= clamped.min_y);
        assert_eq!((clamped.width(), clamped.height()), (6, 6));
    }

    #[test]
    fn test_crop_frames_mixed_sizes() -> Result<()> {
        let (_tmp, mut project) =
            project_of(&[DynamicImage::new_rgba8(10, 10), sprite(100, 100, 50, 50, 59, 59)])?;
        let bounds = crop_frames(&mut project, &[0, 1], Margins::default(), &ProgressBar::hidden(), &CancelFlag::new())?;
        assert_eq!(bounds, Bounds { min_x: 50, min_y: 50, max_x: 59, max_y: 59 });
        assert_eq!(project.load_display_image(0)?.dimensions(), (10, 10));
        assert_eq!(project.load_display_image(1)?.dimensions(), (10, 10));
        Ok(())
    }

    #[test]
    fn test_scale_frames_noop_and_resize() -> Result<()> {
        let (_tmp, mut project) = project_of(&[sprite(40, 20, 0, 0, 9, 9), sprite(40, 20, 0, 0, 9, 9)])?;
        let progress = ProgressBar::hidden();
        let cancel = CancelFlag::new();

        let unchanged = scale_frames(&mut project, &[0, 1], ScaleTarget::Percent(100.0), ResampleFilter::Lanczos, &progress, &cancel)?;
        assert_eq!(unchanged, 0);
        assert!(!project.frame(0).unwrap().has_processed());

        let written = scale_frames(&mut project, &[0, 1], ScaleTarget::Percent(50.0), ResampleFilter::Nearest, &progress, &cancel)?;
        assert_eq!(written, 2);
        let scaled = project.load_display_image(1)?;
        assert_eq!(scaled.dimensions(), (20, 10));
        assert!(scaled.color().has_alpha());

        assert!(scale_frames(&mut project, &[], ScaleTarget::Percent(50.0), ResampleFilter::Nearest, &progress, &cancel).is_err());
        Ok(())
    }

    #[test]
    fn test_crop_frames_writes_processed() -> Result<()> {
        let (_tmp, mut project) = project_of(&[sprite(16, 16, 4, 4, 7, 7), sprite(16, 16, 6, 6, 9, 9)])?;
        let bounds = crop_frames(&mut project, &[0, 1], Margins::uniform(1), &ProgressBar::hidden(), &CancelFlag::new())?;
        assert_eq!(bounds, Bounds { min_x: 3, min_y: 3, max_x: 10, max_y: 10 });
        assert_eq!(project.load_display_image(0)?.dimensions(), (8, 8));
        assert_eq!(project.load_image(0, ImageSource::Original)?.dimensions(), (16, 16));
        Ok(())
    }

    #[test]
    fn test_edge_passes_skip_rgb() -> Result<()> {
        let rgb = DynamicImage::ImageRgb8(RgbImage::from_pixel(12, 12, Rgb([9, 9, 9])));
        let (_tmp, mut project) = project_of(&[sprite(12, 12, 2, 2, 9, 9), rgb])?;
        let progress = ProgressBar::hidden();
        let cancel = CancelFlag::new();

        assert_eq!(shrink_frames(&mut project, &[0, 1], 1, &progress, &cancel)?, 1);
        assert_eq!(project.load_display_image(0)?.to_rgba8().get_pixel(2, 2)[3], 0);
        assert!(!project.frame(1).unwrap().has_processed());

        assert_eq!(outline_frames(&mut project, &[0, 1], 2, Rgb([0, 0, 255]), &progress, &cancel)?, 1);
        Ok(())
    }

    #[test]
    fn test_cancelled_batch() -> Result<()> {
        let (_tmp, mut project) = project_of(&[sprite(8, 8, 1, 1, 4, 4)])?;
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(matches!(
            shrink_frames(&mut project, &[0], 1, &ProgressBar::hidden(), &cancel),
            Err(SpriteCullError::Cancelled)
        ));
        Ok(())
    }
}
