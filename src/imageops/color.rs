use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

/// 8-bit HSV with hue halved into `0..180`, the layout colour-key presets use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hsv {
    pub h: u8,
    pub s: u8,
    pub v: u8,
}

impl Hsv {
    pub const fn new(h: u8, s: u8, v: u8) -> Self {
        Self { h, s, v }
    }

    /// Inclusive per-channel range test.
    pub fn within(&self, lower: &Hsv, upper: &Hsv) -> bool {
        (lower.h..=upper.h).contains(&self.h)
            && (lower.s..=upper.s).contains(&self.s)
            && (lower.v..=upper.v).contains(&self.v)
    }
}

pub fn rgb_to_hsv(Rgb([r, g, b]): Rgb<u8>) -> Hsv {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let s = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let h = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / delta
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    Hsv {
        h: ((h / 2.0).round() as u32 % 180) as u8,
        s: s.round().clamp(0.0, 255.0) as u8,
        v: max as u8,
    }
}

fn luma(Rgb([r, g, b]): Rgb<u8>) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}

pub fn to_gray(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([luma(*image.get_pixel(x, y))])
    })
}

/// Alpha-blends `image` onto an opaque background colour.
pub fn composite_over(image: &RgbaImage, background: Rgb<u8>) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let Rgba([r, g, b, a]) = *image.get_pixel(x, y);
        let alpha = a as f32 / 255.0;
        let blend = |fg: u8, bg: u8| (fg as f32 * alpha + bg as f32 * (1.0 - alpha)).round() as u8;
        Rgb([
            blend(r, background[0]),
            blend(g, background[1]),
            blend(b, background[2]),
        ])
    })
}

/// Two-tone checkerboard used behind transparent previews.
pub fn checkerboard(width: u32, height: u32, square_size: u32) -> RgbImage {
    let square_size = square_size.max(1);
    RgbImage::from_fn(width, height, |x, y| {
        if ((x / square_size) + (y / square_size)) % 2 == 0 {
            Rgb([200, 200, 200])
        } else {
            Rgb([255, 255, 255])
        }
    })
}

/// Flattens a transparent frame onto a checkerboard for preview output.
pub fn composite_on_checkerboard(image: &RgbaImage, square_size: u32) -> RgbImage {
    let board = checkerboard(image.width(), image.height(), square_size);
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let Rgba([r, g, b, a]) = *image.get_pixel(x, y);
        let bg = board.get_pixel(x, y);
        let alpha = a as f32 / 255.0;
        let blend = |fg: u8, bg: u8| (fg as f32 * alpha + bg as f32 * (1.0 - alpha)) as u8;
        Rgb([blend(r, bg[0]), blend(g, bg[1]), blend(b, bg[2])])
    })
}
