//! Super-resolution through the `realesrgan-ncnn-vulkan` executable.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use clap::ValueEnum;
use image::{DynamicImage, ImageFormat};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SpriteCullError};
use crate::frames::{FrameProject, ImageSource};
use crate::progress_tracker::CancelFlag;
use crate::video::spawn_error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
pub enum UpscaleModel {
    #[default]
    #[serde(rename = "realesrgan-x4plus")]
    #[value(name = "realesrgan-x4plus")]
    X4Plus,
    #[serde(rename = "realesrgan-x4plus-anime")]
    #[value(name = "realesrgan-x4plus-anime")]
    X4PlusAnime,
    #[serde(rename = "realesr-animevideov3-x2")]
    #[value(name = "realesr-animevideov3-x2")]
    AnimeVideoV3X2,
    #[serde(rename = "realesr-animevideov3-x3")]
    #[value(name = "realesr-animevideov3-x3")]
    AnimeVideoV3X3,
    #[serde(rename = "realesr-animevideov3-x4")]
    #[value(name = "realesr-animevideov3-x4")]
    AnimeVideoV3X4,
}

pub const ALL_UPSCALE_MODELS: [UpscaleModel; 5] = [
    UpscaleModel::X4Plus,
    UpscaleModel::X4PlusAnime,
    UpscaleModel::AnimeVideoV3X2,
    UpscaleModel::AnimeVideoV3X3,
    UpscaleModel::AnimeVideoV3X4,
];

impl UpscaleModel {
    /// Name passed to `-n`, also the stem of the `.param`/`.bin` pair.
    pub fn name(self) -> &'static str {
        match self {
            Self::X4Plus => "realesrgan-x4plus",
            Self::X4PlusAnime => "realesrgan-x4plus-anime",
            Self::AnimeVideoV3X2 => "realesr-animevideov3-x2",
            Self::AnimeVideoV3X3 => "realesr-animevideov3-x3",
            Self::AnimeVideoV3X4 => "realesr-animevideov3-x4",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::X4Plus => "RealESRGAN x4+ (general)",
            Self::X4PlusAnime => "RealESRGAN x4+ Anime",
            Self::AnimeVideoV3X2 => "RealESRGAN AnimeVideo v3 x2",
            Self::AnimeVideoV3X3 => "RealESRGAN AnimeVideo v3 x3",
            Self::AnimeVideoV3X4 => "RealESRGAN AnimeVideo v3 x4",
        }
    }

    pub fn scale(self) -> u32 {
        match self {
            Self::AnimeVideoV3X2 => 2,
            Self::AnimeVideoV3X3 => 3,
            _ => 4,
        }
    }

    pub fn recommended(self) -> bool {
        matches!(self, Self::X4Plus | Self::X4PlusAnime)
    }
}

impl std::fmt::Display for UpscaleModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A Real-ESRGAN ncnn install: the executable with a `models/` directory
/// next to it.
#[derive(Debug, Clone)]
pub struct RealEsrgan {
    executable: PathBuf,
    models_dir: PathBuf,
}

impl RealEsrgan {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        let executable = executable.into();
        let models_dir = executable
            .parent()
            .map(|dir| dir.join("models"))
            .unwrap_or_else(|| PathBuf::from("models"));
        Self {
            executable,
            models_dir,
        }
    }

    pub fn with_models_dir(mut self, models_dir: impl Into<PathBuf>) -> Self {
        self.models_dir = models_dir.into();
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn is_available(&self) -> bool {
        self.executable.is_file() && self.models_dir.is_dir()
    }

    pub fn is_installed(&self, model: UpscaleModel) -> bool {
        ["param", "bin"]
            .iter()
            .all(|ext| self.models_dir.join(format!("{}.{}", model.name(), ext)).is_file())
    }

    pub fn available_models(&self) -> Vec<(UpscaleModel, bool)> {
        ALL_UPSCALE_MODELS
            .iter()
            .map(|&model| (model, self.is_installed(model)))
            .collect()
    }

    fn tool_error(&self, reason: impl Into<String>) -> SpriteCullError {
        SpriteCullError::ExternalTool {
            tool: self.executable.display().to_string(),
            operation: "upscale".to_string(),
            reason: reason.into(),
        }
    }

    /// Upscales one image. `tile` 0 lets the tool pick its tile size.
    pub fn upscale(
        &self,
        image: &DynamicImage,
        model: UpscaleModel,
        tile: u32,
        cancel: &CancelFlag,
    ) -> Result<DynamicImage> {
        if !self.is_available() {
            return Err(self.tool_error(format!(
                "executable or models directory {} missing",
                self.models_dir.display()
            )));
        }
        if !self.is_installed(model) {
            return Err(SpriteCullError::validation(
                "model",
                format!("{} is not installed in {}", model, self.models_dir.display()),
            ));
        }

        let scratch = tempfile::tempdir()
            .map_err(|e| SpriteCullError::fs(std::env::temp_dir(), "create scratch dir", e))?;
        let input = scratch.path().join("input.png");
        let output = scratch.path().join("output.png");
        image
            .save_with_format(&input, ImageFormat::Png)
            .map_err(|e| SpriteCullError::ImageProcessing {
                path: input.display().to_string(),
                operation: "write upscale input".to_string(),
                source: Box::new(e),
            })?;

        let mut command = Command::new(&self.executable);
        command
            .arg("-i")
            .arg(&input)
            .arg("-o")
            .arg(&output)
            .args(["-n", model.name()])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if tile > 0 {
            command.args(["-t", &tile.to_string()]);
        }
        if let Some(dir) = self.executable.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| spawn_error(&self.executable, "upscale", e))?;
        let status = loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SpriteCullError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(spawn_error(&self.executable, "upscale", e)),
            }
        };
        if !status.success() {
            return Err(self.tool_error(format!("exited with {}", status)));
        }
        if !output.exists() {
            return Err(self.tool_error("no output image written"));
        }

        image::open(&output).map_err(|e| SpriteCullError::ImageProcessing {
            path: output.display().to_string(),
            operation: "read upscale output".to_string(),
            source: Box::new(e),
        })
    }
}

/// Upscales the listed frames one at a time into their processed copies.
pub fn upscale_frames(
    project: &mut FrameProject,
    indices: &[usize],
    upscaler: &RealEsrgan,
    model: UpscaleModel,
    tile: u32,
    progress: &ProgressBar,
    cancel: &CancelFlag,
) -> Result<usize> {
    if indices.is_empty() {
        return Err(SpriteCullError::validation("selection", "no frames selected"));
    }

    for &index in indices {
        cancel.check()?;
        let image = project.load_image(index, ImageSource::Processed)?;
        let upscaled = upscaler.upscale(&image, model, tile, cancel)?;
        tracing::debug!(
            "frame {} upscaled {}x{} -> {}x{}",
            index,
            image.width(),
            image.height(),
            upscaled.width(),
            upscaled.height()
        );
        project.update_image(index, &upscaled, true)?;
        progress.inc(1);
    }
    progress.finish();
    tracing::info!("upscaled {} frames with {} (x{})", indices.len(), model, model.scale());
    Ok(indices.len())
}
