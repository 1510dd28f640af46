use image::{GrayImage, Luma};
use ndarray::Array2;

/// Sigma OpenCV derives when a Gaussian is requested with `sigma <= 0`.
pub fn opencv_sigma(ksize: usize) -> f64 {
    0.3 * ((ksize as f64 - 1.0) * 0.5 - 1.0) + 0.8
}

fn gaussian_kernel(ksize: usize, sigma: f64) -> Vec<f64> {
    let sigma = if sigma > 0.0 { sigma } else { opencv_sigma(ksize) };
    let half = (ksize / 2) as f64;
    let mut kernel: Vec<f64> = (0..ksize)
        .map(|i| {
            let x = i as f64 - half;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

// BORDER_REFLECT_101: gfedcb|abcdefgh|gfedcba
fn reflect101(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let n = len as isize;
    let mut i = i;
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * (n - 1) - i;
        }
    }
    i as usize
}

/// Separable Gaussian blur over a 2-D plane with an odd `ksize`.
pub fn gaussian_blur_plane(plane: &Array2<f64>, ksize: usize, sigma: f64) -> Array2<f64> {
    let ksize = if ksize % 2 == 0 { ksize + 1 } else { ksize };
    let kernel = gaussian_kernel(ksize, sigma);
    let radius = (ksize / 2) as isize;
    let (rows, cols) = plane.dim();
    if rows == 0 || cols == 0 {
        return plane.clone();
    }

    let mut horizontal = Array2::<f64>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let cc = reflect101(c as isize + k as isize - radius, cols);
                acc += weight * plane[[r, cc]];
            }
            horizontal[[r, c]] = acc;
        }
    }

    let mut out = Array2::<f64>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let rr = reflect101(r as isize + k as isize - radius, rows);
                acc += weight * horizontal[[rr, c]];
            }
            out[[r, c]] = acc;
        }
    }
    out
}

pub fn gray_to_plane(image: &GrayImage) -> Array2<f64> {
    let (w, h) = image.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        image.get_pixel(x as u32, y as u32)[0] as f64
    })
}

pub fn plane_to_gray(plane: &Array2<f64>) -> GrayImage {
    let (h, w) = plane.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        Luma([plane[[y as usize, x as usize]].round().clamp(0.0, 255.0) as u8])
    })
}

/// Gaussian blur of an 8-bit mask, `ksize x ksize` window.
pub fn gaussian_blur_gray(image: &GrayImage, ksize: usize, sigma: f64) -> GrayImage {
    plane_to_gray(&gaussian_blur_plane(&gray_to_plane(image), ksize, sigma))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_normalised() {
        let kernel = gaussian_kernel(11, 1.5);
        assert_eq!(kernel.len(), 11);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(kernel[5] > kernel[4]);
    }

    #[test]
    fn test_reflect101() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(-2, 5), 2);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(6, 5), 2);
        assert_eq!(reflect101(3, 1), 0);
    }

    #[test]
    fn test_blur_constant_plane_is_identity() {
        let plane = Array2::from_elem((7, 9), 42.0);
        let blurred = gaussian_blur_plane(&plane, 5, 0.0);
        assert!(blurred.iter().all(|v| (v - 42.0).abs() < 1e-9));
    }

    #[test]
    fn test_blur_softens_edge() {
        let image = GrayImage::from_fn(10, 1, |x, _| Luma([if x < 5 { 0 } else { 255 }]));
        let blurred = gaussian_blur_gray(&image, 5, 0.0);
        let left = blurred.get_pixel(4, 0)[0];
        let right = blurred.get_pixel(5, 0)[0];
        assert!(left > 0 && left < 128);
        assert!(right > 128 && right < 255);
    }
}
