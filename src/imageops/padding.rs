use clap::ValueEnum;
use image::{imageops, GenericImageView, ImageBuffer, Pixel, Primitive};
use serde::{Deserialize, Serialize};

/// Anchor of a frame placed on a larger canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    #[default]
    Center,
    Bottom,
    TopLeft,
}

/// Offset of a `width x height` image inside a `canvas_w x canvas_h` canvas,
/// or `None` when it does not fit.
pub fn offset_for(
    width: u32,
    height: u32,
    canvas_w: u32,
    canvas_h: u32,
    position: Position,
) -> Option<(i64, i64)> {
    if width > canvas_w || height > canvas_h {
        return None;
    }

    let spare_w = canvas_w - width;
    let spare_h = canvas_h - height;
    let (x, y) = match position {
        Position::Bottom => (spare_w / 2, spare_h),
        Position::TopLeft => (0, 0),
        Position::Center => (spare_w / 2, spare_h / 2),
    };
    Some((x as i64, y as i64))
}

/// Places `image` on a canvas filled with `fill`.
pub fn padding<I, P, S>(
    image: &I,
    canvas_w: u32,
    canvas_h: u32,
    position: Position,
    fill: P,
) -> Option<ImageBuffer<P, Vec<S>>>
where
    I: GenericImageView<Pixel = P>,
    P: Pixel<Subpixel = S>,
    S: Primitive,
{
    let (width, height) = image.dimensions();
    offset_for(width, height, canvas_w, canvas_h, position).map(|(x, y)| {
        let mut canvas = ImageBuffer::from_pixel(canvas_w, canvas_h, fill);
        imageops::overlay(&mut canvas, image, x, y);
        canvas
    })
}

/// Smallest canvas containing `(width, height)` with the aspect `aspect_w:aspect_h`.
pub fn aspect_canvas(width: u32, height: u32, aspect_w: u32, aspect_h: u32) -> (u32, u32) {
    let target = aspect_w as f64 / aspect_h.max(1) as f64;
    let current = width as f64 / height.max(1) as f64;
    if current > target {
        (width, (width as f64 / target).ceil() as u32)
    } else {
        ((height as f64 * target).ceil() as u32, height)
    }
}
