//! Per-frame similarity features used to detect near-duplicate frames.
//!
//! Four detectors are available: joint angles from a pose estimator, Hu
//! moments of the silhouette contour, a colour histogram blended with a
//! difference hash, and a banded SSIM that weights the lower body most.

use std::collections::BTreeMap;

use clap::ValueEnum;
use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::morphology::dilate;
use indicatif::{ParallelProgressIterator, ProgressBar};
use ndarray::{Array2, Zip};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SpriteCullError};
use crate::frames::FrameProject;
use crate::imageops::blur::gaussian_blur_plane;
use crate::imageops::{rgb_to_hsv, resize_gray_area, to_gray};
use crate::pose::PoseData;
use crate::progress_tracker::CancelFlag;
use crate::traits::PoseEstimator;

/// Alpha at or below this counts as background.
const ALPHA_BACKGROUND: u8 = 10;

/// Pairwise similarity in `[0, 1]`, 1 meaning identical.
pub trait FrameFeature {
    fn similarity_to(&self, other: &Self) -> f32;
}

impl FrameFeature for PoseData {
    fn similarity_to(&self, other: &Self) -> f32 {
        PoseData::similarity_to(self, other)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DetectMode {
    Pose,
    Contour,
    Image,
    #[default]
    Regional,
}

impl std::fmt::Display for DetectMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pose => "pose",
            Self::Contour => "contour",
            Self::Image => "image",
            Self::Regional => "regional",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// contour

/// Log-scaled Hu moments of the largest outer silhouette contour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContourFeature {
    pub hu_moments: [f64; 7],
}

impl ContourFeature {
    /// `None` when the frame has no foreground at all.
    pub fn extract(image: &DynamicImage) -> Option<Self> {
        let mask = silhouette_mask(image);
        let contours = find_contours::<i32>(&mask);
        let largest = contours
            .iter()
            .filter(|c| c.border_type == BorderType::Outer)
            .map(|c| {
                let points: Vec<(f64, f64)> =
                    c.points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
                points
            })
            .max_by(|a, b| polygon_area(a).total_cmp(&polygon_area(b)))?;

        let hu = hu_moments(&polygon_moments(&largest));
        Some(Self {
            hu_moments: hu.map(|h| h.signum() * (h.abs() + 1e-10).log10()),
        })
    }

    /// Sum of absolute differences over all seven moments.
    pub fn distance_to(&self, other: &Self) -> f64 {
        self.hu_moments
            .iter()
            .zip(other.hu_moments.iter())
            .map(|(a, b)| (a - b).abs())
            .sum()
    }
}

impl FrameFeature for ContourFeature {
    /// `exp(-2 d)` with `d` the I1 distance between the log-scaled moments.
    fn similarity_to(&self, other: &Self) -> f32 {
        (-2.0 * self.distance_to(other)).exp() as f32
    }
}

fn silhouette_mask(image: &DynamicImage) -> GrayImage {
    if image.color().has_alpha() {
        let rgba = image.to_rgba8();
        GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
            Luma([if rgba.get_pixel(x, y)[3] > ALPHA_BACKGROUND { 255 } else { 0 }])
        })
    } else {
        let edges = canny(&to_gray(&image.to_rgb8()), 50.0, 150.0);
        // two passes of a 3x3 square
        dilate(&dilate(&edges, Norm::LInf, 1), Norm::LInf, 1)
    }
}

fn polygon_area(points: &[(f64, f64)]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let twice: f64 = (0..n)
        .map(|i| {
            let (x0, y0) = points[i];
            let (x1, y1) = points[(i + 1) % n];
            x0 * y1 - x1 * y0
        })
        .sum();
    (twice / 2.0).abs()
}

/// Raw spatial moments `[m00, m10, m01, m20, m11, m02, m30, m21, m12, m03]`
/// of a closed polygon, via Green's theorem.
fn polygon_moments(points: &[(f64, f64)]) -> [f64; 10] {
    let n = points.len();
    if n < 3 {
        return [0.0; 10];
    }

    let mut a = [0.0f64; 10];
    let (mut xp, mut yp) = points[n - 1];
    for &(x, y) in points {
        let dxy = xp * y - x * yp;
        let xs = xp + x;
        let ys = yp + y;
        a[0] += dxy;
        a[1] += dxy * xs;
        a[2] += dxy * ys;
        a[3] += dxy * (xp * xs + x * x);
        a[4] += dxy * (xp * (ys + yp) + x * (ys + y));
        a[5] += dxy * (yp * ys + y * y);
        a[6] += dxy * xs * (xp * xp + x * x);
        a[7] += dxy * (xp * xp * (3.0 * yp + y) + 2.0 * x * xp * ys + x * x * (yp + 3.0 * y));
        a[8] += dxy * (yp * yp * (3.0 * xp + x) + 2.0 * y * yp * xs + y * y * (xp + 3.0 * x));
        a[9] += dxy * ys * (yp * yp + y * y);
        xp = x;
        yp = y;
    }

    if a[0].abs() <= f64::EPSILON {
        return [0.0; 10];
    }
    // orientation-independent
    let sign = a[0].signum();
    let divisors = [2.0, 6.0, 6.0, 12.0, 24.0, 12.0, 20.0, 60.0, 60.0, 20.0];
    let mut m = [0.0f64; 10];
    for i in 0..10 {
        m[i] = sign * a[i] / divisors[i];
    }
    m
}

fn hu_moments(m: &[f64; 10]) -> [f64; 7] {
    let [m00, m10, m01, m20, m11, m02, m30, m21, m12, m03] = *m;
    if m00.abs() <= f64::EPSILON {
        return [0.0; 7];
    }

    let cx = m10 / m00;
    let cy = m01 / m00;
    let mu20 = m20 - m10 * cx;
    let mu11 = m11 - m10 * cy;
    let mu02 = m02 - m01 * cy;
    let mu30 = m30 - cx * (3.0 * mu20 + cx * m10);
    let mu21 = m21 - cx * (2.0 * mu11 + cx * m01) - cy * mu20;
    let mu12 = m12 - cy * (2.0 * mu11 + cy * m10) - cx * mu02;
    let mu03 = m03 - cy * (3.0 * mu02 + cy * m01);

    let s2 = 1.0 / (m00 * m00);
    let s3 = s2 / m00.abs().sqrt();
    let (n20, n11, n02) = (mu20 * s2, mu11 * s2, mu02 * s2);
    let (n30, n21, n12, n03) = (mu30 * s3, mu21 * s3, mu12 * s3, mu03 * s3);

    let mut t0 = n30 + n12;
    let mut t1 = n21 + n03;
    let q0 = t0 * t0;
    let q1 = t1 * t1;
    let n4 = 4.0 * n11;
    let s = n20 + n02;
    let d = n20 - n02;

    let h0 = s;
    let h1 = d * d + n4 * n11;
    let h3 = q0 + q1;
    let h5 = d * (q0 - q1) + n4 * t0 * t1;

    t0 *= q0 - 3.0 * q1;
    t1 *= 3.0 * q0 - q1;
    let p0 = n30 - 3.0 * n12;
    let p1 = 3.0 * n21 - n03;

    let h2 = p0 * p0 + p1 * p1;
    let h4 = p0 * t0 + p1 * t1;
    let h6 = p1 * t0 - p0 * t1;

    [h0, h1, h2, h3, h4, h5, h6]
}

// ---------------------------------------------------------------------------
// image

const HUE_BINS: usize = 30;
const SAT_BINS: usize = 32;

/// Hue/saturation histogram plus a 64-bit difference hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFeature {
    pub histogram: Vec<f32>,
    pub hash: u64,
}

impl ImageFeature {
    pub fn extract(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        Self {
            histogram: hue_saturation_histogram(&rgb),
            hash: difference_hash(&rgb),
        }
    }
}

impl FrameFeature for ImageFeature {
    fn similarity_to(&self, other: &Self) -> f32 {
        let correlation = histogram_correlation(&self.histogram, &other.histogram);
        let hamming = (self.hash ^ other.hash).count_ones() as f32;
        0.6 * correlation.max(0.0) + 0.4 * (1.0 - hamming / 64.0)
    }
}

/// 30x32 joint histogram over H `0..180` and S `0..256`, min-max scaled to `[0, 1]`.
fn hue_saturation_histogram(image: &RgbImage) -> Vec<f32> {
    let mut histogram = vec![0.0f32; HUE_BINS * SAT_BINS];
    for pixel in image.pixels() {
        let hsv = rgb_to_hsv(*pixel);
        let h = (hsv.h as usize * HUE_BINS / 180).min(HUE_BINS - 1);
        let s = hsv.s as usize * SAT_BINS / 256;
        histogram[h * SAT_BINS + s] += 1.0;
    }

    let min = histogram.iter().copied().fold(f32::INFINITY, f32::min);
    let max = histogram.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    for v in histogram.iter_mut() {
        *v = if range > f32::EPSILON { (*v - min) / range } else { 0.0 };
    }
    histogram
}

/// Pearson correlation; flat inputs count as a perfect match.
fn histogram_correlation(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let mean_a = a[..n].iter().map(|v| *v as f64).sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().map(|v| *v as f64).sum::<f64>() / n as f64;

    let (mut num, mut var_a, mut var_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a[..n].iter().zip(&b[..n]) {
        let da = *x as f64 - mean_a;
        let db = *y as f64 - mean_b;
        num += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = var_a * var_b;
    if denom.abs() > f64::EPSILON {
        (num / denom.sqrt()) as f32
    } else {
        1.0
    }
}

/// Row-wise gradient sign hash of a 9x8 grey thumbnail.
fn difference_hash(image: &RgbImage) -> u64 {
    let small = resize_gray_area(&to_gray(image), 9, 8);
    let mut hash = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            hash <<= 1;
            if small.get_pixel(x + 1, y)[0] > small.get_pixel(x, y)[0] {
                hash |= 1;
            }
        }
    }
    hash
}

// ---------------------------------------------------------------------------
// regional

pub const REGION_WIDTH: u32 = 128;
pub const REGION_HEIGHT: u32 = 64;
pub const DEFAULT_REGION_WEIGHTS: [f32; 3] = [0.2, 0.3, 0.5];

/// Grey thumbnails of the upper, middle and lower thirds of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalFeature {
    pub upper: Vec<u8>,
    pub middle: Vec<u8>,
    pub lower: Vec<u8>,
    pub weights: [f32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionScores {
    pub upper: f32,
    pub middle: f32,
    pub lower: f32,
    pub weights: [f32; 3],
}

impl RegionalFeature {
    /// `None` for frames shorter than three rows.
    pub fn extract(image: &DynamicImage, weights: [f32; 3]) -> Option<Self> {
        let gray = if image.color().has_alpha() {
            let rgba = image.to_rgba8();
            let gray = to_gray(&image.to_rgb8());
            GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
                if rgba.get_pixel(x, y)[3] > ALPHA_BACKGROUND {
                    *gray.get_pixel(x, y)
                } else {
                    Luma([128])
                }
            })
        } else {
            to_gray(&image.to_rgb8())
        };

        let (width, height) = gray.dimensions();
        let h1 = height / 3;
        let h2 = h1 * 2;
        if h1 == 0 || width == 0 {
            return None;
        }

        let band = |top: u32, bottom: u32| {
            let view = image::imageops::crop_imm(&gray, 0, top, width, bottom - top).to_image();
            resize_gray_area(&view, REGION_WIDTH, REGION_HEIGHT).into_raw()
        };

        Some(Self {
            upper: band(0, h1),
            middle: band(h1, h2),
            lower: band(h2, height),
            weights,
        })
    }

    pub fn region_similarities(&self, other: &Self) -> RegionScores {
        RegionScores {
            upper: ssim(&self.upper, &other.upper),
            middle: ssim(&self.middle, &other.middle),
            lower: ssim(&self.lower, &other.lower),
            weights: self.weights,
        }
    }
}

impl FrameFeature for RegionalFeature {
    fn similarity_to(&self, other: &Self) -> f32 {
        let scores = self.region_similarities(other);
        let [wu, wm, wl] = scores.weights;
        (wu * scores.upper + wm * scores.middle + wl * scores.lower).clamp(0.0, 1.0)
    }
}

fn band_plane(data: &[u8]) -> Option<Array2<f64>> {
    Array2::from_shape_vec(
        (REGION_HEIGHT as usize, REGION_WIDTH as usize),
        data.iter().map(|v| *v as f64).collect(),
    )
    .ok()
}

/// Mean SSIM over an 11x11 Gaussian window (sigma 1.5).
fn ssim(a: &[u8], b: &[u8]) -> f32 {
    let (Some(x), Some(y)) = (band_plane(a), band_plane(b)) else {
        return 0.0;
    };
    ssim_planes(&x, &y)
}

fn ssim_planes(x: &Array2<f64>, y: &Array2<f64>) -> f32 {
    const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
    const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);
    let blur = |plane: &Array2<f64>| gaussian_blur_plane(plane, 11, 1.5);

    let mu_x = blur(x);
    let mu_y = blur(y);
    let xx = blur(&(x * x));
    let yy = blur(&(y * y));
    let xy = blur(&(x * y));

    let mut total = 0.0;
    Zip::from(&mu_x)
        .and(&mu_y)
        .and(&xx)
        .and(&yy)
        .and(&xy)
        .for_each(|&mx, &my, &sxx, &syy, &sxy| {
            let var_x = sxx - mx * mx;
            let var_y = syy - my * my;
            let cov = sxy - mx * my;
            total += ((2.0 * mx * my + C1) * (2.0 * cov + C2))
                / ((mx * mx + my * my + C1) * (var_x + var_y + C2));
        });
    (total / x.len().max(1) as f64) as f32
}

// ---------------------------------------------------------------------------
// feature sets

/// One frame's feature in whichever mode it was computed.
#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    Pose(PoseData),
    Contour(ContourFeature),
    Image(ImageFeature),
    Regional(RegionalFeature),
}

impl Feature {
    pub fn mode(&self) -> DetectMode {
        match self {
            Self::Pose(_) => DetectMode::Pose,
            Self::Contour(_) => DetectMode::Contour,
            Self::Image(_) => DetectMode::Image,
            Self::Regional(_) => DetectMode::Regional,
        }
    }
}

/// Features of one detect mode keyed by stable frame id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "mode",
    content = "features",
    rename_all = "lowercase",
    try_from = "StoredFeatureSet"
)]
pub enum FeatureSet {
    Pose(BTreeMap<u64, PoseData>),
    Contour(BTreeMap<u64, ContourFeature>),
    Image(BTreeMap<u64, ImageFeature>),
    Regional(BTreeMap<u64, RegionalFeature>),
}

/// On-disk shape of a [`FeatureSet`]. Read through this so `mode` may
/// follow `features` in the document.
#[derive(Deserialize)]
struct StoredFeatureSet {
    mode: DetectMode,
    #[serde(default)]
    features: BTreeMap<String, serde_json::Value>,
}

fn typed_features<F: DeserializeOwned>(
    raw: BTreeMap<String, serde_json::Value>,
) -> std::result::Result<BTreeMap<u64, F>, String> {
    raw.into_iter()
        .map(|(key, value)| {
            let id: u64 = key
                .parse()
                .map_err(|e| format!("frame id {:?}: {}", key, e))?;
            let feature = serde_json::from_value(value).map_err(|e| format!("frame {}: {}", id, e))?;
            Ok((id, feature))
        })
        .collect()
}

impl TryFrom<StoredFeatureSet> for FeatureSet {
    type Error = String;

    fn try_from(stored: StoredFeatureSet) -> std::result::Result<Self, Self::Error> {
        let features = stored.features;
        Ok(match stored.mode {
            DetectMode::Pose => Self::Pose(typed_features(features)?),
            DetectMode::Contour => Self::Contour(typed_features(features)?),
            DetectMode::Image => Self::Image(typed_features(features)?),
            DetectMode::Regional => Self::Regional(typed_features(features)?),
        })
    }
}

fn pair_similarity<F: FrameFeature>(map: &BTreeMap<u64, F>, a: u64, b: u64) -> Option<f32> {
    Some(map.get(&a)?.similarity_to(map.get(&b)?))
}

impl FeatureSet {
    pub fn new(mode: DetectMode) -> Self {
        match mode {
            DetectMode::Pose => Self::Pose(BTreeMap::new()),
            DetectMode::Contour => Self::Contour(BTreeMap::new()),
            DetectMode::Image => Self::Image(BTreeMap::new()),
            DetectMode::Regional => Self::Regional(BTreeMap::new()),
        }
    }

    pub fn mode(&self) -> DetectMode {
        match self {
            Self::Pose(_) => DetectMode::Pose,
            Self::Contour(_) => DetectMode::Contour,
            Self::Image(_) => DetectMode::Image,
            Self::Regional(_) => DetectMode::Regional,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Pose(m) => m.len(),
            Self::Contour(m) => m.len(),
            Self::Image(m) => m.len(),
            Self::Regional(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        match self {
            Self::Pose(m) => m.contains_key(&id),
            Self::Contour(m) => m.contains_key(&id),
            Self::Image(m) => m.contains_key(&id),
            Self::Regional(m) => m.contains_key(&id),
        }
    }

    pub fn insert(&mut self, id: u64, feature: Feature) -> Result<()> {
        match (self, feature) {
            (Self::Pose(m), Feature::Pose(f)) => {
                m.insert(id, f);
            }
            (Self::Contour(m), Feature::Contour(f)) => {
                m.insert(id, f);
            }
            (Self::Image(m), Feature::Image(f)) => {
                m.insert(id, f);
            }
            (Self::Regional(m), Feature::Regional(f)) => {
                m.insert(id, f);
            }
            (set, feature) => {
                return Err(SpriteCullError::validation(
                    "feature",
                    format!("{} feature cannot join a {} set", feature.mode(), set.mode()),
                ))
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> bool {
        match self {
            Self::Pose(m) => m.remove(&id).is_some(),
            Self::Contour(m) => m.remove(&id).is_some(),
            Self::Image(m) => m.remove(&id).is_some(),
            Self::Regional(m) => m.remove(&id).is_some(),
        }
    }

    pub fn pose(&self, id: u64) -> Option<&PoseData> {
        match self {
            Self::Pose(m) => m.get(&id),
            _ => None,
        }
    }

    /// `None` unless both frames have a feature.
    pub fn similarity(&self, a: u64, b: u64) -> Option<f32> {
        match self {
            Self::Pose(m) => pair_similarity(m, a, b),
            Self::Contour(m) => pair_similarity(m, a, b),
            Self::Image(m) => pair_similarity(m, a, b),
            Self::Regional(m) => pair_similarity(m, a, b),
        }
    }

    pub fn region_similarities(&self, a: u64, b: u64) -> Option<RegionScores> {
        match self {
            Self::Regional(m) => Some(m.get(&a)?.region_similarities(m.get(&b)?)),
            _ => None,
        }
    }
}

/// Computes one frame's feature. `Ok(None)` when the detector finds nothing.
pub fn extract_feature(
    mode: DetectMode,
    image: &DynamicImage,
    frame_index: usize,
    estimator: Option<&dyn PoseEstimator>,
    weights: [f32; 3],
) -> Result<Option<Feature>> {
    let feature = match mode {
        DetectMode::Pose => {
            let estimator = estimator.ok_or_else(|| {
                SpriteCullError::validation("detect_mode", "pose mode needs a pose model")
            })?;
            estimator
                .estimate(&image.to_rgb8(), frame_index)?
                .map(Feature::Pose)
        }
        DetectMode::Contour => ContourFeature::extract(image).map(Feature::Contour),
        DetectMode::Image => Some(Feature::Image(ImageFeature::extract(image))),
        DetectMode::Regional => RegionalFeature::extract(image, weights).map(Feature::Regional),
    };
    Ok(feature)
}

/// Frame to analyse: stable id plus current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisTarget {
    pub id: u64,
    pub index: usize,
}

/// Extracts features for every target in parallel. Frames where the
/// detector finds nothing are left out of the set.
pub fn analyze<L>(
    targets: &[AnalysisTarget],
    mode: DetectMode,
    estimator: Option<&dyn PoseEstimator>,
    weights: [f32; 3],
    load: L,
    progress: &ProgressBar,
    cancel: &CancelFlag,
) -> Result<FeatureSet>
where
    L: Fn(&AnalysisTarget) -> Result<DynamicImage> + Sync,
{
    if mode == DetectMode::Pose && estimator.is_none() {
        return Err(SpriteCullError::validation(
            "detect_mode",
            "pose mode needs a pose model",
        ));
    }

    let extracted: Vec<(u64, Option<Feature>)> = targets
        .par_iter()
        .progress_with(progress.clone())
        .map(|target| -> Result<(u64, Option<Feature>)> {
            cancel.check()?;
            let image = load(target)?;
            let feature = extract_feature(mode, &image, target.index, estimator, weights)?;
            if feature.is_none() {
                tracing::debug!("no {} feature for frame {}", mode, target.index);
            }
            Ok((target.id, feature))
        })
        .collect::<Result<_>>()?;
    progress.finish();

    let mut set = FeatureSet::new(mode);
    for (id, feature) in extracted {
        if let Some(feature) = feature {
            set.insert(id, feature)?;
        }
    }
    tracing::info!(
        "{} analysis: {}/{} frames have features",
        mode,
        set.len(),
        targets.len()
    );
    Ok(set)
}

/// Analyses the selected frames of `project` from their display images and
/// stores the result as its feature set. Returns the number of frames with
/// a feature.
pub fn analyze_project(
    project: &mut FrameProject,
    mode: DetectMode,
    estimator: Option<&dyn PoseEstimator>,
    weights: [f32; 3],
    progress: &ProgressBar,
    cancel: &CancelFlag,
) -> Result<usize> {
    let targets: Vec<AnalysisTarget> = project
        .selected_frames()
        .into_iter()
        .map(|f| AnalysisTarget {
            id: f.id,
            index: f.index,
        })
        .collect();
    if targets.is_empty() {
        return Err(SpriteCullError::validation("selection", "no frames selected"));
    }

    let shared: &FrameProject = project;
    let set = analyze(
        &targets,
        mode,
        estimator,
        weights,
        |target| shared.load_display_image(target.index),
        progress,
        cancel,
    )?;
    let found = set.len();
    project.set_features(set);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockPoseEstimator;
    use image::{Rgb, Rgba, RgbaImage};

    fn blob(width: u32, height: u32, cx: f32, cy: f32, rx: f32, ry: f32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            let dx = (x as f32 - cx) / rx;
            let dy = (y as f32 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                Rgba([200, 60, 60, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        }))
    }

    fn stripes(width: u32, height: u32, period: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, _| {
            if (x / period) % 2 == 0 {
                Rgb([240, 240, 240])
            } else {
                Rgb([20, 20, 200])
            }
        }))
    }

    #[test]
    fn test_polygon_moments_of_square() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        let m = polygon_moments(&square);
        assert!((m[0] - 100.0).abs() < 1e-9);
        assert!((m[1] / m[0] - 5.0).abs() < 1e-9);
        assert!((m[2] / m[0] - 5.0).abs() < 1e-9);

        // orientation must not change the result
        let reversed: Vec<_> = square.iter().rev().copied().collect();
        assert_eq!(polygon_moments(&reversed)[0], m[0]);

        let hu = hu_moments(&m);
        // first Hu invariant of a square is 1/6
        assert!((hu[0] - 1.0 / 6.0).abs() < 1e-9);
        assert!(hu[1].abs() < 1e-12);
    }

    #[test]
    fn test_contour_feature_scale_invariant() {
        let small = ContourFeature::extract(&blob(64, 64, 32.0, 32.0, 10.0, 20.0)).unwrap();
        let large = ContourFeature::extract(&blob(128, 128, 64.0, 64.0, 20.0, 40.0)).unwrap();
        let wide = ContourFeature::extract(&blob(128, 128, 64.0, 64.0, 40.0, 8.0)).unwrap();

        assert!(small.similarity_to(&large) > wide.similarity_to(&small));
        assert!((small.similarity_to(&small) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_contour_distance_is_plain_i1() {
        let zero = ContourFeature { hu_moments: [0.0; 7] };
        let five = ContourFeature { hu_moments: [5.0; 7] };
        assert!((zero.distance_to(&five) - 35.0).abs() < 1e-12);
        assert!(zero.similarity_to(&five) < 1e-20);

        let a = ContourFeature { hu_moments: [-2.0; 7] };
        let b = ContourFeature { hu_moments: [-4.0; 7] };
        assert!((a.distance_to(&b) - 14.0).abs() < 1e-12);
        assert!((a.similarity_to(&b) as f64 - (-28.0f64).exp()).abs() < 1e-15);

        let near = ContourFeature { hu_moments: [0.01; 7] };
        assert!((zero.distance_to(&near) - 0.07).abs() < 1e-12);
        assert!((zero.similarity_to(&near) - (-0.14f32).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_contour_feature_empty_frame() {
        let empty = DynamicImage::ImageRgba8(RgbaImage::new(16, 16));
        assert!(ContourFeature::extract(&empty).is_none());
    }

    #[test]
    fn test_contour_feature_from_rgb_edges() {
        let mut image = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
        for y in 16..48 {
            for x in 20..44 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        assert!(ContourFeature::extract(&DynamicImage::ImageRgb8(image)).is_some());
    }

    #[test]
    fn test_histogram_is_normalised() {
        let feature = ImageFeature::extract(&stripes(32, 32, 4));
        assert_eq!(feature.histogram.len(), HUE_BINS * SAT_BINS);
        let max = feature.histogram.iter().copied().fold(0.0f32, f32::max);
        assert!((max - 1.0).abs() < 1e-6);
        assert!(feature.histogram.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_image_feature_similarity() {
        let a = ImageFeature::extract(&stripes(64, 64, 8));
        let b = ImageFeature::extract(&stripes(64, 64, 8));
        let c = ImageFeature::extract(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
            64,
            64,
            Rgb([30, 200, 30]),
        )));
        assert!((a.similarity_to(&b) - 1.0).abs() < 1e-6);
        assert!(a.similarity_to(&c) < 0.9);
    }

    #[test]
    fn test_difference_hash_detects_gradient() {
        let ramp = RgbImage::from_fn(90, 80, |x, _| {
            let v = (x * 255 / 89) as u8;
            Rgb([v, v, v])
        });
        assert_eq!(difference_hash(&ramp), u64::MAX);
        let flat = RgbImage::from_pixel(90, 80, Rgb([9, 9, 9]));
        assert_eq!(difference_hash(&flat), 0);
    }

    #[test]
    fn test_correlation_edge_cases() {
        assert!((histogram_correlation(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-6);
        assert!((histogram_correlation(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]) + 1.0).abs() < 1e-6);
        assert_eq!(histogram_correlation(&[0.0; 4], &[0.0; 4]), 1.0);
    }

    #[test]
    fn test_regional_identical_frames() {
        let image = stripes(60, 90, 6);
        let a = RegionalFeature::extract(&image, DEFAULT_REGION_WEIGHTS).unwrap();
        assert_eq!(a.upper.len(), (REGION_WIDTH * REGION_HEIGHT) as usize);
        assert!((a.similarity_to(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_regional_weights_lower_band() {
        let base = RgbImage::from_fn(60, 90, |x, y| {
            let v = ((x * 7 + y * 3) % 255) as u8;
            Rgb([v, v, v])
        });
        let mut changed = base.clone();
        for y in 60..90 {
            for x in 0..60 {
                changed.put_pixel(x, y, Rgb([255 - ((x * 13) % 255) as u8, 0, 0]));
            }
        }
        let a = RegionalFeature::extract(&DynamicImage::ImageRgb8(base), DEFAULT_REGION_WEIGHTS).unwrap();
        let b = RegionalFeature::extract(&DynamicImage::ImageRgb8(changed), DEFAULT_REGION_WEIGHTS).unwrap();

        let scores = a.region_similarities(&b);
        assert!((scores.upper - 1.0).abs() < 1e-5);
        assert!(scores.lower < 0.9);
        assert!(a.similarity_to(&b) < 1.0);
        assert!(a.similarity_to(&b) >= 0.0);
    }

    #[test]
    fn test_regional_background_is_neutral() {
        let mut a = RgbaImage::from_pixel(30, 30, Rgba([255, 255, 255, 0]));
        let mut b = RgbaImage::from_pixel(30, 30, Rgba([0, 0, 0, 5]));
        a.put_pixel(15, 15, Rgba([10, 10, 10, 255]));
        b.put_pixel(15, 15, Rgba([10, 10, 10, 255]));
        let fa = RegionalFeature::extract(&DynamicImage::ImageRgba8(a), DEFAULT_REGION_WEIGHTS).unwrap();
        let fb = RegionalFeature::extract(&DynamicImage::ImageRgba8(b), DEFAULT_REGION_WEIGHTS).unwrap();
        assert_eq!(fa, fb);
    }

    #[test]
    fn test_regional_tiny_frame() {
        let tiny = DynamicImage::ImageRgb8(RgbImage::new(4, 2));
        assert!(RegionalFeature::extract(&tiny, DEFAULT_REGION_WEIGHTS).is_none());
    }

    #[test]
    fn test_feature_set_mode_guard() -> Result<()> {
        let mut set = FeatureSet::new(DetectMode::Image);
        set.insert(3, Feature::Image(ImageFeature::extract(&stripes(8, 8, 2))))?;
        assert!(set.contains(3));
        assert!(set
            .insert(4, Feature::Contour(ContourFeature { hu_moments: [0.0; 7] }))
            .is_err());
        assert_eq!(set.similarity(3, 3), Some(1.0));
        assert_eq!(set.similarity(3, 9), None);
        assert!(set.remove(3));
        assert!(set.is_empty());
        Ok(())
    }

    #[test]
    fn test_feature_set_json_shape() -> Result<()> {
        let mut set = FeatureSet::new(DetectMode::Contour);
        set.insert(7, Feature::Contour(ContourFeature { hu_moments: [-1.0; 7] }))?;
        let json = serde_json::to_value(&set)?;
        assert_eq!(json["mode"], "contour");
        assert!(json["features"]["7"].is_object());
        let back: FeatureSet = serde_json::from_value(json)?;
        assert_eq!(back, set);

        let text = serde_json::to_string(&set)?;
        assert_eq!(serde_json::from_str::<FeatureSet>(&text)?, set);
        Ok(())
    }

    #[test]
    fn test_feature_set_reads_features_before_mode() -> Result<()> {
        let text = r#"{"features":{"3":{"hu_moments":[1,2,3,4,5,6,7]}},"mode":"contour"}"#;
        let set: FeatureSet = serde_json::from_str(text)?;
        assert_eq!(set.mode(), DetectMode::Contour);
        assert!(set.contains(3));

        let empty: FeatureSet = serde_json::from_str(r#"{"mode":"regional"}"#)?;
        assert!(empty.is_empty());

        assert!(serde_json::from_str::<FeatureSet>(r#"{"mode":"contour","features":{"x":{}}}"#).is_err());
        Ok(())
    }

    #[test]
    fn test_analyze_in_parallel() -> Result<()> {
        let targets: Vec<_> = (0..4)
            .map(|i| AnalysisTarget { id: 100 + i, index: i as usize })
            .collect();
        let set = analyze(
            &targets,
            DetectMode::Image,
            None,
            DEFAULT_REGION_WEIGHTS,
            |t| Ok(stripes(16, 16, 1 + t.index as u32)),
            &ProgressBar::hidden(),
            &CancelFlag::new(),
        )?;
        assert_eq!(set.mode(), DetectMode::Image);
        assert_eq!(set.len(), 4);
        assert!(set.contains(103));
        Ok(())
    }

    #[test]
    fn test_analyze_pose_requires_estimator() {
        let targets = [AnalysisTarget { id: 0, index: 0 }];
        let result = analyze(
            &targets,
            DetectMode::Pose,
            None,
            DEFAULT_REGION_WEIGHTS,
            |_| Ok(stripes(8, 8, 2)),
            &ProgressBar::hidden(),
            &CancelFlag::new(),
        );
        assert!(matches!(result, Err(SpriteCullError::Validation { .. })));

        let estimator = MockPoseEstimator::standing();
        let set = analyze(
            &targets,
            DetectMode::Pose,
            Some(&estimator),
            DEFAULT_REGION_WEIGHTS,
            |_| Ok(stripes(8, 8, 2)),
            &ProgressBar::hidden(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert!(set.pose(0).is_some());
    }

    #[test]
    fn test_analyze_cancelled() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let targets = [AnalysisTarget { id: 0, index: 0 }];
        let result = analyze(
            &targets,
            DetectMode::Image,
            None,
            DEFAULT_REGION_WEIGHTS,
            |_| Ok(stripes(8, 8, 2)),
            &ProgressBar::hidden(),
            &cancel,
        );
        assert!(matches!(result, Err(SpriteCullError::Cancelled)));
    }
}
