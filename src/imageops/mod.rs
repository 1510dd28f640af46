//! Pixel-level helpers shared by the matting, analysis and export stages.

pub mod blur;
pub mod color;
pub mod mask;
pub mod padding;
pub mod resample;

pub use blur::{gaussian_blur_gray, gaussian_blur_plane, opencv_sigma};
pub use color::{composite_over, rgb_to_hsv, to_gray, Hsv};
pub use mask::{
    alpha_channel, close, dilate, erode, feather, intersect_alpha, open, replace_alpha, threshold,
};
pub use padding::{aspect_canvas, padding, Position};
pub use resample::{resize_dynamic, resize_gray_area, resize_rgba, ResampleFilter};
