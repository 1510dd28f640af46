use clap::ValueEnum;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

/// Resampling filters offered for frame scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResampleFilter {
    Nearest,
    Box,
    Bilinear,
    Hamming,
    Bicubic,
    #[default]
    Lanczos,
}

impl ResampleFilter {
    /// Closest `image` filter. `Hamming` has no counterpart and uses the triangle filter.
    pub fn filter_type(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Box | Self::Bilinear | Self::Hamming => FilterType::Triangle,
            Self::Bicubic => FilterType::CatmullRom,
            Self::Lanczos => FilterType::Lanczos3,
        }
    }
}

/// Resizes to exactly `width x height`. Box filtering of a downscale goes
/// through `thumbnail`, which averages whole source areas.
pub fn resize_rgba(image: &RgbaImage, width: u32, height: u32, filter: ResampleFilter) -> RgbaImage {
    let width = width.max(1);
    let height = height.max(1);
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    if filter == ResampleFilter::Box && width <= image.width() && height <= image.height() {
        return imageops::thumbnail(image, width, height);
    }
    imageops::resize(image, width, height, filter.filter_type())
}

/// Area-averaging resize for downscales, triangle filter otherwise.
pub fn resize_gray_area(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    let width = width.max(1);
    let height = height.max(1);
    if width <= image.width() && height <= image.height() {
        imageops::thumbnail(image, width, height)
    } else {
        imageops::resize(image, width, height, FilterType::Triangle)
    }
}

/// Same as [`resize_rgba`] but keeps the colour type of the input.
pub fn resize_dynamic(
    image: &DynamicImage,
    width: u32,
    height: u32,
    filter: ResampleFilter,
) -> DynamicImage {
    if image.color().has_alpha() {
        DynamicImage::ImageRgba8(resize_rgba(&image.to_rgba8(), width, height, filter))
    } else {
        let rgba = resize_rgba(&image.to_rgba8(), width, height, filter);
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(rgba).to_rgb8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_resize_dimensions() {
        let image = RgbaImage::from_pixel(10, 6, Rgba([10, 20, 30, 255]));
        for filter in ResampleFilter::value_variants() {
            let out = resize_rgba(&image, 5, 3, *filter);
            assert_eq!(out.dimensions(), (5, 3), "filter {filter:?}");
        }
        assert_eq!(resize_rgba(&image, 20, 12, ResampleFilter::Box).dimensions(), (20, 12));
    }

    #[test]
    fn test_resize_dynamic_keeps_colour_type() {
        let rgb = DynamicImage::new_rgb8(8, 8);
        let out = resize_dynamic(&rgb, 4, 4, ResampleFilter::Bilinear);
        assert!(!out.color().has_alpha());

        let rgba = DynamicImage::new_rgba8(8, 8);
        let out = resize_dynamic(&rgba, 4, 4, ResampleFilter::Nearest);
        assert!(out.color().has_alpha());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ResampleFilter::Lanczos).unwrap();
        assert_eq!(json, "\"lanczos\"");
    }
}
