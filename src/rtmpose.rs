//! RTMPose (SimCC) keypoint model with an optional YOLOX person detector.

use std::path::{Path, PathBuf};

use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use ndarray::prelude::*;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;

use crate::errors::{Result, SpriteCullError};
use crate::imageops::{aspect_canvas, padding, Position};
use crate::model::{build_session, input_dims};
use crate::pose::{Landmark, PoseData, LANDMARK_COUNT};
use crate::traits::PoseEstimator;

pub const DEFAULT_DETECTOR_FILE: &str = "yolox_m_8xb8-300e_humanart-c2c7a14a.onnx";
pub const DEFAULT_POSE_FILE: &str = "rtmw-dw-x-l_simcc-cocktail14_270e-256x192_20231122.onnx";

/// `(width, height)` used when neither the file name nor the graph says otherwise.
pub const DEFAULT_INPUT_SIZE: (u32, u32) = (192, 256);
const DETECTOR_INPUT: u32 = 640;
const DETECTOR_PAD: u8 = 114;
const DETECTOR_SCORE: f32 = 0.3;
const BBOX_PADDING: f32 = 1.25;
const SIMCC_SPLIT_RATIO: f32 = 2.0;

const POSE_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const POSE_STD: [f32; 3] = [58.395, 57.12, 57.375];

/// Landmark slot for each of the 17 COCO body keypoints.
pub const COCO_TO_LANDMARK: [usize; 17] = [0, 2, 5, 7, 8, 11, 12, 13, 14, 15, 16, 23, 24, 25, 26, 27, 28];

/// Model input `(width, height)` encoded in an RTMPose file name.
pub fn input_size_from_name(path: &Path) -> Option<(u32, u32)> {
    let name = path.file_name()?.to_str()?;
    if name.contains("256x192") {
        Some((192, 256))
    } else if name.contains("384x288") {
        Some((288, 384))
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl BoundingBox {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x1: 0.0,
            y1: 0.0,
            x2: width as f32,
            y2: height as f32,
            score: 1.0,
        }
    }
}

fn first_input_name(session: &Session, path: &Path) -> Result<String> {
    session
        .inputs
        .first()
        .map(|input| input.name.clone())
        .ok_or_else(|| SpriteCullError::Configuration {
            message: format!("{} declares no inputs", path.display()),
        })
}

/// YOLOX person detector exported with boxes, scores and optional labels.
pub struct YoloxDetector {
    session: Mutex<Session>,
    input_name: String,
}

impl YoloxDetector {
    pub fn new(path: &Path, device_id: i32, force_cpu: bool) -> Result<Self> {
        let session = build_session(path, device_id, force_cpu)?;
        let input_name = first_input_name(&session, path)?;
        Ok(Self {
            session: Mutex::new(session),
            input_name,
        })
    }

    /// Highest-scoring person box in image coordinates.
    pub fn detect(&self, image: &RgbImage) -> Result<Option<BoundingBox>> {
        let (tensor, ratio) = letterbox(image, DETECTOR_INPUT);

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor)?
        ])?;
        let dets = outputs[0].try_extract_array::<f32>()?;
        let dets = dets.into_dimensionality::<Ix3>()?;
        let labels = if outputs.len() > 1 {
            outputs[1]
                .try_extract_array::<i64>()
                .ok()
                .map(|l| l.iter().copied().collect::<Vec<_>>())
        } else {
            None
        };

        Ok(pick_person(dets.index_axis(Axis(0), 0), labels.as_deref(), ratio))
    }
}

/// Resize-to-fit into a `size` square anchored top-left, padded grey, BGR planes.
fn letterbox(image: &RgbImage, size: u32) -> (Array4<f32>, f32) {
    let (w, h) = image.dimensions();
    let ratio = (size as f32 / h.max(1) as f32).min(size as f32 / w.max(1) as f32);
    let rw = ((w as f32 * ratio) as u32).clamp(1, size);
    let rh = ((h as f32 * ratio) as u32).clamp(1, size);
    let resized = imageops::resize(image, rw, rh, FilterType::Triangle);
    let canvas = padding(&resized, size, size, Position::TopLeft, Rgb([DETECTOR_PAD; 3]))
        .unwrap_or_else(|| RgbImage::from_pixel(size, size, Rgb([DETECTOR_PAD; 3])));

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[2 - c] as f32;
        }
    }
    (tensor, ratio)
}

fn pick_person(dets: ArrayView2<f32>, labels: Option<&[i64]>, ratio: f32) -> Option<BoundingBox> {
    if dets.ncols() < 5 || ratio <= 0.0 {
        return None;
    }
    dets.outer_iter()
        .enumerate()
        .filter(|(i, row)| {
            row[4] > DETECTOR_SCORE && labels.map_or(true, |l| l.get(*i).copied() == Some(0))
        })
        .map(|(_, row)| BoundingBox {
            x1: row[0] / ratio,
            y1: row[1] / ratio,
            x2: row[2] / ratio,
            y2: row[3] / ratio,
            score: row[4],
        })
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

/// Where the model input window sits in the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CropWindow {
    x0: f32,
    y0: f32,
    width: f32,
    height: f32,
}

pub struct RtmPoseModel {
    session: Mutex<Session>,
    input_name: String,
    input_size: (u32, u32),
    detector: Option<YoloxDetector>,
}

impl RtmPoseModel {
    pub fn new(
        pose_path: &Path,
        detector_path: Option<&Path>,
        device_id: i32,
        force_cpu: bool,
    ) -> Result<Self> {
        let session = build_session(pose_path, device_id, force_cpu)?;
        let input_name = first_input_name(&session, pose_path)?;
        let input_size = input_size_from_name(pose_path)
            .or_else(|| {
                let dims = input_dims(&session)?;
                match dims.as_slice() {
                    [_, _, h, w] if *h > 0 && *w > 0 => Some((*w as u32, *h as u32)),
                    _ => None,
                }
            })
            .unwrap_or(DEFAULT_INPUT_SIZE);

        let detector = detector_path
            .map(|path| YoloxDetector::new(path, device_id, force_cpu))
            .transpose()?;
        tracing::info!(
            "pose model input {}x{}, person detector {}",
            input_size.0,
            input_size.1,
            if detector.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            input_size,
            detector,
        })
    }

    /// Loads the default pair from `dir`; the detector is used only if present.
    pub fn from_dir(dir: &Path, device_id: i32, force_cpu: bool) -> Result<Self> {
        let (detector, pose) = default_paths(dir);
        let detector = detector.is_file().then_some(detector);
        Self::new(&pose, detector.as_deref(), device_id, force_cpu)
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn crop_window(&self, bbox: &BoundingBox) -> CropWindow {
        let (mw, mh) = self.input_size;
        let cx = (bbox.x1 + bbox.x2) / 2.0;
        let cy = (bbox.y1 + bbox.y2) / 2.0;
        let bw = ((bbox.x2 - bbox.x1) * BBOX_PADDING).ceil().max(1.0) as u32;
        let bh = ((bbox.y2 - bbox.y1) * BBOX_PADDING).ceil().max(1.0) as u32;
        let (width, height) = aspect_canvas(bw, bh, mw, mh);
        CropWindow {
            x0: cx - width as f32 / 2.0,
            y0: cy - height as f32 / 2.0,
            width: width as f32,
            height: height as f32,
        }
    }

    fn input_tensor(&self, image: &RgbImage, window: &CropWindow) -> Array4<f32> {
        let (mw, mh) = self.input_size;
        let mut crop = RgbImage::new(window.width as u32, window.height as u32);
        imageops::overlay(
            &mut crop,
            image,
            -(window.x0.round() as i64),
            -(window.y0.round() as i64),
        );
        let resized = imageops::resize(&crop, mw, mh, FilterType::Triangle);

        let mut tensor = Array4::<f32>::zeros((1, 3, mh as usize, mw as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - POSE_MEAN[c]) / POSE_STD[c];
            }
        }
        tensor
    }
}

pub fn default_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join(DEFAULT_DETECTOR_FILE), dir.join(DEFAULT_POSE_FILE))
}

/// Argmax per keypoint over both SimCC axes. Returns `(x, y, score)` in
/// model input pixels; keypoints with no positive response get `-1`.
fn decode_simcc(simcc_x: ArrayView2<f32>, simcc_y: ArrayView2<f32>) -> Vec<(f32, f32, f32)> {
    let argmax = |row: ArrayView1<f32>| {
        row.iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
    };

    simcc_x
        .outer_iter()
        .zip(simcc_y.outer_iter())
        .map(|(row_x, row_y)| {
            let (ix, vx) = argmax(row_x);
            let (iy, vy) = argmax(row_y);
            let score = vx.min(vy);
            if score <= 0.0 {
                (-1.0, -1.0, score)
            } else {
                (ix as f32 / SIMCC_SPLIT_RATIO, iy as f32 / SIMCC_SPLIT_RATIO, score)
            }
        })
        .collect()
}

/// Places COCO body keypoints (image pixels) into the 33-point layout.
pub fn keypoints_to_pose(
    keypoints: &[(f32, f32, f32)],
    width: u32,
    height: u32,
    frame_index: usize,
) -> PoseData {
    let mut landmarks = vec![Landmark::hidden(); LANDMARK_COUNT];
    for (&(x, y, score), &slot) in keypoints.iter().zip(COCO_TO_LANDMARK.iter()) {
        let (nx, ny) = if width > 0 && height > 0 {
            (x / width as f32, y / height as f32)
        } else {
            (0.0, 0.0)
        };
        landmarks[slot] = Landmark::new(nx, ny, score);
    }
    PoseData::new(frame_index, landmarks)
}

impl PoseEstimator for RtmPoseModel {
    fn estimate(&self, image: &RgbImage, frame_index: usize) -> Result<Option<PoseData>> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(None);
        }

        let bbox = match &self.detector {
            Some(detector) => match detector.detect(image)? {
                Some(bbox) => bbox,
                None => return Ok(None),
            },
            None => BoundingBox::full(width, height),
        };
        let window = self.crop_window(&bbox);
        let tensor = self.input_tensor(image, &window);

        let decoded = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![
                self.input_name.as_str() => TensorRef::from_array_view(&tensor)?
            ])?;
            let simcc_x = outputs[0].try_extract_array::<f32>()?.into_dimensionality::<Ix3>()?;
            let simcc_y = outputs[1].try_extract_array::<f32>()?.into_dimensionality::<Ix3>()?;
            decode_simcc(simcc_x.index_axis(Axis(0), 0), simcc_y.index_axis(Axis(0), 0))
        };
        if decoded.is_empty() {
            return Ok(None);
        }

        let (mw, mh) = self.input_size;
        let keypoints: Vec<(f32, f32, f32)> = decoded
            .into_iter()
            .map(|(x, y, score)| {
                (
                    x * window.width / mw as f32 + window.x0,
                    y * window.height / mh as f32 + window.y0,
                    score,
                )
            })
            .collect();
        Ok(Some(keypoints_to_pose(&keypoints, width, height, frame_index)))
    }
}
