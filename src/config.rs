use std::fs;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SpriteCullError};
use crate::features::DetectMode;

pub const DEFAULT_SETTINGS_FILE: &str = "sprite-cull.json";

/// Persistent defaults. CLI flags override these per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub extract_fps: f64,
    pub similarity_threshold: f32,
    pub detect_mode: DetectMode,
    pub model_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub pngquant_path: Option<PathBuf>,
    pub realesrgan_path: Option<PathBuf>,
    pub device_id: i32,
    pub last_video_dir: Option<PathBuf>,
    pub last_export_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            extract_fps: 10.0,
            similarity_threshold: 0.90,
            detect_mode: DetectMode::Regional,
            model_dir: PathBuf::from("models"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            pngquant_path: None,
            realesrgan_path: None,
            device_id: 0,
            last_video_dir: None,
            last_export_dir: None,
        }
    }
}

impl Settings {
    /// Reads settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path).map_err(|e| SpriteCullError::fs(path, "read settings", e))?;
        let settings: Settings =
            serde_json::from_str(&text).map_err(|e| SpriteCullError::Configuration {
                message: format!("invalid settings file {}: {}", path.display(), e),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|e| SpriteCullError::fs(path, "write settings", e))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.extract_fps > 0.0) {
            return Err(SpriteCullError::validation(
                "extract_fps",
                "must be greater than zero",
            ));
        }
        check_threshold(self.similarity_threshold)
    }

    /// `models/rtmpose` under the configured model directory.
    pub fn rtmpose_dir(&self) -> PathBuf {
        self.model_dir.join("rtmpose")
    }
}

pub fn check_threshold(threshold: f32) -> Result<()> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(SpriteCullError::validation(
            "similarity_threshold",
            format!("must be within 0..=1 (got {})", threshold),
        ))
    }
}

/// clap value parser accepting any writable image extension.
pub fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let settings = Settings::load(&temp_dir.path().join("nope.json"))?;
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.extract_fps, 10.0);
        Ok(())
    }

    #[test]
    fn test_partial_file_fills_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("settings.json");
        fs::write(&path, r#"{ "extract_fps": 24.0, "detect_mode": "pose" }"#)?;

        let settings = Settings::load(&path)?;
        assert_eq!(settings.extract_fps, 24.0);
        assert_eq!(settings.detect_mode, DetectMode::Pose);
        assert_eq!(settings.similarity_threshold, 0.90);
        Ok(())
    }

    #[test]
    fn test_save_then_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("settings.json");
        let settings = Settings {
            similarity_threshold: 0.75,
            pngquant_path: Some(PathBuf::from("/opt/pngquant")),
            ..Settings::default()
        };
        settings.save(&path)?;
        assert_eq!(Settings::load(&path)?, settings);
        Ok(())
    }

    #[test]
    fn test_invalid_values_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        fs::write(&path, r#"{ "similarity_threshold": 1.5 }"#).unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(SpriteCullError::Validation { .. })
        ));

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(SpriteCullError::Configuration { .. })
        ));
    }

    #[test]
    fn test_check_format() {
        assert!(check_format("png").is_ok());
        assert!(check_format("txt").is_err());
    }
}
