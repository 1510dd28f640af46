//! ONNX Runtime sessions and the background matting models that run on them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::ValueEnum;
use image::{imageops, imageops::FilterType, GrayImage, Luma, RgbImage};
use ndarray::prelude::*;
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SpriteCullError};
use crate::traits::MattingModel;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Opens `path` with TensorRT and CUDA registered ahead of the CPU fallback,
/// or on the CPU only when `force_cpu` is set.
pub fn build_session(path: &Path, device_id: i32, force_cpu: bool) -> Result<Session> {
    if !path.exists() {
        return Err(SpriteCullError::fs(
            path,
            "open model",
            std::io::Error::new(std::io::ErrorKind::NotFound, "model file does not exist"),
        ));
    }

    let mut builder = Session::builder()
        .map_err(|e| SpriteCullError::model("create session builder", e))?;
    if !force_cpu {
        builder = builder
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| SpriteCullError::model("register execution providers", e))?;
    }
    let session = builder
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| SpriteCullError::model("set optimization level", e))?
        .commit_from_file(path)
        .map_err(|e| SpriteCullError::model(format!("load model {}", path.display()), e))?;

    tracing::info!(
        "loaded {} ({})",
        path.display(),
        if force_cpu { "cpu" } else { "gpu preferred" }
    );
    Ok(session)
}

/// `[N, C, H, W]` dims of the first input, if the model declares them.
pub fn input_dims(session: &Session) -> Option<Vec<i64>> {
    session
        .inputs
        .first()
        .and_then(|input| input.input_type.tensor_shape())
        .map(|shape| shape.iter().copied().collect())
}

/// Background matting models known to the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
pub enum AiModel {
    #[default]
    #[serde(rename = "u2net")]
    #[value(name = "u2net")]
    U2Net,
    #[serde(rename = "u2net_human_seg")]
    #[value(name = "u2net_human_seg")]
    U2NetHumanSeg,
    #[serde(rename = "silueta")]
    #[value(name = "silueta")]
    Silueta,
    #[serde(rename = "isnet-anime")]
    #[value(name = "isnet-anime")]
    IsNetAnime,
    #[serde(rename = "bria-rmbg-2.0")]
    #[value(name = "bria-rmbg-2.0")]
    BriaRmbg,
}

pub const ALL_MODELS: [AiModel; 5] = [
    AiModel::U2Net,
    AiModel::U2NetHumanSeg,
    AiModel::Silueta,
    AiModel::IsNetAnime,
    AiModel::BriaRmbg,
];

impl AiModel {
    /// File stem of the `.onnx` file.
    pub fn name(self) -> &'static str {
        match self {
            Self::U2Net => "u2net",
            Self::U2NetHumanSeg => "u2net_human_seg",
            Self::Silueta => "silueta",
            Self::IsNetAnime => "isnet-anime",
            Self::BriaRmbg => "bria-rmbg-2.0",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::U2Net => "U2Net (general)",
            Self::U2NetHumanSeg => "U2Net Human (portrait)",
            Self::Silueta => "Silueta (outline)",
            Self::IsNetAnime => "ISNet Anime (anime)",
            Self::BriaRmbg => "BRIA RMBG 2.0 (recommended)",
        }
    }

    pub fn download_size(self) -> &'static str {
        match self {
            Self::U2Net | Self::U2NetHumanSeg | Self::IsNetAnime => "176MB",
            Self::Silueta => "43MB",
            Self::BriaRmbg => "100MB+",
        }
    }

    /// `None` for models that must be supplied locally.
    pub fn url(self) -> Option<String> {
        match self {
            Self::BriaRmbg => None,
            other => Some(format!(
                "https://github.com/danielgatis/rembg/releases/download/v0.0.0/{}.onnx",
                other.name()
            )),
        }
    }

    pub fn input_size(self) -> u32 {
        match self {
            Self::U2Net | Self::U2NetHumanSeg | Self::Silueta => 320,
            Self::IsNetAnime | Self::BriaRmbg => 1024,
        }
    }

    /// First existing file among `model_dir/{name}.onnx` and `~/.u2net/{name}.onnx`.
    pub fn model_path(self, model_dir: &Path) -> Option<PathBuf> {
        let file = format!("{}.onnx", self.name());
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(|home| PathBuf::from(home).join(".u2net").join(&file));
        std::iter::once(model_dir.join(&file))
            .chain(home)
            .find(|path| path.is_file())
    }
}

impl std::fmt::Display for AiModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Install status of one catalogue entry.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub model: AiModel,
    pub path: Option<PathBuf>,
}

impl ModelStatus {
    pub fn installed(&self) -> bool {
        self.path.is_some()
    }
}

pub fn available_models(model_dir: &Path) -> Vec<ModelStatus> {
    ALL_MODELS
        .iter()
        .map(|&model| ModelStatus {
            model,
            path: model.model_path(model_dir),
        })
        .collect()
}

/// Salient-object matting network (U2Net family, ISNet, RMBG).
pub struct OnnxMattingModel {
    pub model: AiModel,
    input_size: u32,
    input_name: String,
    session: Mutex<Session>,
}

impl OnnxMattingModel {
    pub fn new(model: AiModel, model_dir: &Path, device_id: i32, force_cpu: bool) -> Result<Self> {
        let path = model.model_path(model_dir).ok_or_else(|| {
            SpriteCullError::Configuration {
                message: format!(
                    "model {} not found; download it from {} into {}",
                    model.display_name(),
                    model.url().unwrap_or_else(|| "a local copy".to_string()),
                    model_dir.join(format!("{}.onnx", model.name())).display()
                ),
            }
        })?;
        let session = build_session(&path, device_id, force_cpu)?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| SpriteCullError::Configuration {
                message: format!("{} declares no inputs", path.display()),
            })?;

        Ok(Self {
            model,
            input_size: model.input_size(),
            input_name,
            session: Mutex::new(session),
        })
    }

    pub fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array2<f32>> {
        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        let prediction = outputs[0].try_extract_array::<f32>()?;
        let prediction = prediction.into_dimensionality::<Ix4>()?;
        Ok(prediction.slice(s![0, 0, .., ..]).to_owned())
    }
}

impl MattingModel for OnnxMattingModel {
    fn predict_mask(&self, image: &RgbImage) -> Result<GrayImage> {
        let tensor = preprocess(image, self.input_size);
        let prediction = self.predict(tensor.view())?;
        Ok(postprocess(&prediction, image.width(), image.height()))
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }
}

/// Lanczos resize, scale by the brightest value, ImageNet normalise, NCHW.
pub fn preprocess(image: &RgbImage, size: u32) -> Array4<f32> {
    let resized = imageops::resize(image, size, size, FilterType::Lanczos3);
    let max = resized
        .as_raw()
        .iter()
        .copied()
        .max()
        .map_or(1e-6, |m| (m as f32).max(1e-6));

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 / max - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    tensor
}

/// Min-max scales the prediction to a mask of `width x height`.
pub fn postprocess(prediction: &Array2<f32>, width: u32, height: u32) -> GrayImage {
    let (rows, cols) = prediction.dim();
    let min = prediction.iter().copied().fold(f32::INFINITY, f32::min);
    let max = prediction.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = if max - min > f32::EPSILON { max - min } else { 1.0 };

    let mask = GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        let v = (prediction[[y as usize, x as usize]] - min) / range;
        Luma([(v.clamp(0.0, 1.0) * 255.0) as u8])
    });
    if mask.dimensions() == (width, height) {
        mask
    } else {
        imageops::resize(&mask, width, height, FilterType::Lanczos3)
    }
}

/// Loaded matting models keyed by model and device choice.
#[derive(Default)]
pub struct MattingSessionCache {
    sessions: Mutex<HashMap<(AiModel, bool), Arc<OnnxMattingModel>>>,
}

impl MattingSessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(
        &self,
        model: AiModel,
        model_dir: &Path,
        device_id: i32,
        force_cpu: bool,
    ) -> Result<Arc<OnnxMattingModel>> {
        let mut sessions = self.sessions.lock();
        if let Some(loaded) = sessions.get(&(model, force_cpu)) {
            return Ok(Arc::clone(loaded));
        }
        let loaded = Arc::new(OnnxMattingModel::new(model, model_dir, device_id, force_cpu)?);
        sessions.insert((model, force_cpu), Arc::clone(&loaded));
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
