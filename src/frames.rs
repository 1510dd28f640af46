//! On-disk frame project: a `frames.json` manifest next to `raw/` and
//! `processed/` PNG directories, plus an optional `features.json`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::errors::{Result, SpriteCullError};
use crate::features::{DetectMode, FeatureSet};
use crate::progress_tracker::CancelFlag;
use crate::video::VideoInfo;

pub const MANIFEST_FILE: &str = "frames.json";
pub const FEATURES_FILE: &str = "features.json";
const RAW_DIR: &str = "raw";
const PROCESSED_DIR: &str = "processed";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    #[default]
    Raw,
    BackgroundRemoved,
    PoseDetected,
}

/// Which copy of a frame to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ImageSource {
    Original,
    #[default]
    Processed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameData {
    pub index: usize,
    /// Stable across reordering and removal; names the files and keys features.
    pub id: u64,
    pub timestamp: f64,
    pub image_file: PathBuf,
    #[serde(default)]
    pub processed_file: Option<PathBuf>,
    #[serde(default)]
    pub status: FrameStatus,
    #[serde(default = "selected_by_default")]
    pub is_selected: bool,
}

fn selected_by_default() -> bool {
    true
}

impl FrameData {
    pub fn has_processed(&self) -> bool {
        self.processed_file.is_some()
    }

    /// The processed copy when present, the original otherwise.
    pub fn display_file(&self) -> &Path {
        self.processed_file.as_deref().unwrap_or(&self.image_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    #[serde(default)]
    source: Option<VideoInfo>,
    created_at: DateTime<Utc>,
    next_id: u64,
    #[serde(default)]
    feature_mode: Option<DetectMode>,
    frames: Vec<FrameData>,
}

#[derive(Debug)]
pub struct FrameProject {
    root: PathBuf,
    manifest: Manifest,
    features: Option<FeatureSet>,
}

fn read_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| SpriteCullError::ImageProcessing {
        path: path.display().to_string(),
        operation: "load frame".to_string(),
        source: Box::new(e),
    })
}

fn write_png(image: &DynamicImage, path: &Path) -> Result<()> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| SpriteCullError::ImageProcessing {
            path: path.display().to_string(),
            operation: "save frame".to_string(),
            source: Box::new(e),
        })
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            matches!(
                ext.to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "webp" | "bmp" | "gif" | "tiff"
            )
        })
        .unwrap_or(false)
}

impl FrameProject {
    /// Initialises an empty project in `root`, refusing to overwrite one.
    pub fn create(root: impl Into<PathBuf>, source: Option<VideoInfo>) -> Result<Self> {
        let root = root.into();
        if root.join(MANIFEST_FILE).exists() {
            return Err(SpriteCullError::validation(
                "project",
                format!("{} already contains a frame project", root.display()),
            ));
        }
        for dir in [RAW_DIR, PROCESSED_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| SpriteCullError::fs(&path, "create directory", e))?;
        }

        let project = Self {
            root,
            manifest: Manifest {
                version: MANIFEST_VERSION,
                source,
                created_at: Utc::now(),
                next_id: 0,
                feature_mode: None,
                frames: Vec::new(),
            },
            features: None,
        };
        project.save()?;
        tracing::info!("created frame project at {}", project.root.display());
        Ok(project)
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let manifest_path = root.join(MANIFEST_FILE);
        let text = fs::read_to_string(&manifest_path)
            .map_err(|e| SpriteCullError::fs(&manifest_path, "read manifest", e))?;
        let manifest: Manifest =
            serde_json::from_str(&text).map_err(|e| SpriteCullError::Configuration {
                message: format!("invalid manifest {}: {}", manifest_path.display(), e),
            })?;

        let features_path = root.join(FEATURES_FILE);
        let features = if features_path.exists() {
            let text = fs::read_to_string(&features_path)
                .map_err(|e| SpriteCullError::fs(&features_path, "read features", e))?;
            Some(serde_json::from_str::<FeatureSet>(&text)?)
        } else {
            None
        };

        tracing::debug!(
            "opened {} with {} frames",
            root.display(),
            manifest.frames.len()
        );
        Ok(Self {
            root,
            manifest,
            features,
        })
    }

    /// Writes the manifest, and the feature store when one is loaded.
    pub fn save(&self) -> Result<()> {
        let manifest_path = self.root.join(MANIFEST_FILE);
        let text = serde_json::to_string_pretty(&self.manifest)?;
        fs::write(&manifest_path, text)
            .map_err(|e| SpriteCullError::fs(&manifest_path, "write manifest", e))?;

        let features_path = self.root.join(FEATURES_FILE);
        match &self.features {
            Some(features) => {
                let text = serde_json::to_string(features)?;
                fs::write(&features_path, text)
                    .map_err(|e| SpriteCullError::fs(&features_path, "write features", e))?;
            }
            None if features_path.exists() => {
                fs::remove_file(&features_path)
                    .map_err(|e| SpriteCullError::fs(&features_path, "remove features", e))?;
            }
            None => {}
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source(&self) -> Option<&VideoInfo> {
        self.manifest.source.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.manifest.created_at
    }

    pub fn frames(&self) -> &[FrameData] {
        &self.manifest.frames
    }

    pub fn len(&self) -> usize {
        self.manifest.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&FrameData> {
        self.manifest.frames.get(index)
    }

    fn frame_or_err(&self, index: usize) -> Result<&FrameData> {
        self.frame(index).ok_or_else(|| {
            SpriteCullError::validation(
                "index",
                format!("{} is out of range (0..{})", index, self.len()),
            )
        })
    }

    fn frame_file(&self, dir: &str, id: u64) -> PathBuf {
        PathBuf::from(dir).join(format!("frame_{:05}.png", id))
    }

    /// Stores a new frame as PNG and appends it, selected. Returns its index.
    pub fn add_frame(&mut self, image: &DynamicImage, timestamp: f64) -> Result<usize> {
        let id = self.manifest.next_id;
        let image_file = self.frame_file(RAW_DIR, id);
        write_png(image, &self.root.join(&image_file))?;

        let index = self.manifest.frames.len();
        self.manifest.next_id += 1;
        self.manifest.frames.push(FrameData {
            index,
            id,
            timestamp,
            image_file,
            processed_file: None,
            status: FrameStatus::Raw,
            is_selected: true,
        });
        Ok(index)
    }

    /// Removes a frame with its files and feature, shifting later frames down.
    pub fn remove_frame(&mut self, index: usize) -> Result<FrameData> {
        self.frame_or_err(index)?;
        let frame = self.manifest.frames.remove(index);
        for (i, f) in self.manifest.frames.iter_mut().enumerate().skip(index) {
            f.index = i;
        }

        for file in std::iter::once(&frame.image_file).chain(frame.processed_file.as_ref()) {
            let path = self.root.join(file);
            if path.exists() {
                fs::remove_file(&path).map_err(|e| SpriteCullError::fs(&path, "remove frame", e))?;
            }
        }
        if let Some(features) = self.features.as_mut() {
            features.remove(frame.id);
        }
        Ok(frame)
    }

    /// Out-of-range indices are ignored.
    pub fn select(&mut self, index: usize, selected: bool) {
        if let Some(frame) = self.manifest.frames.get_mut(index) {
            frame.is_selected = selected;
        }
    }

    pub fn select_all(&mut self) {
        self.manifest.frames.iter_mut().for_each(|f| f.is_selected = true);
    }

    pub fn deselect_all(&mut self) {
        self.manifest.frames.iter_mut().for_each(|f| f.is_selected = false);
    }

    /// Selects `start..=end`, clamped to the frame list. Other frames keep their state.
    pub fn select_range(&mut self, start: usize, end: usize) {
        let end = end.saturating_add(1).min(self.len());
        for frame in self.manifest.frames.iter_mut().take(end).skip(start) {
            frame.is_selected = true;
        }
    }

    /// Thins the current selection to every `interval`-th frame counted from
    /// the first selected one. The last selected frame is always kept.
    pub fn select_interval(&mut self, interval: usize) {
        let selected = self.selected_indices();
        let (Some(&first), Some(&last)) = (selected.first(), selected.last()) else {
            return;
        };
        if interval <= 1 {
            return;
        }

        let mut keep: HashSet<usize> = (first..=last).step_by(interval).collect();
        keep.insert(last);
        for index in selected {
            self.manifest.frames[index].is_selected = keep.contains(&index);
        }
    }

    pub fn selected_indices(&self) -> Vec<usize> {
        self.manifest
            .frames
            .iter()
            .filter(|f| f.is_selected)
            .map(|f| f.index)
            .collect()
    }

    pub fn selected_frames(&self) -> Vec<&FrameData> {
        self.manifest.frames.iter().filter(|f| f.is_selected).collect()
    }

    pub fn frames_by_status(&self, status: FrameStatus) -> Vec<&FrameData> {
        self.manifest
            .frames
            .iter()
            .filter(|f| f.status == status)
            .collect()
    }

    /// Replaces a frame's pixels. `processed` writes the processed copy and
    /// marks the frame as background-removed; otherwise the original is
    /// overwritten.
    pub fn update_image(&mut self, index: usize, image: &DynamicImage, processed: bool) -> Result<()> {
        let id = self.frame_or_err(index)?.id;
        let file = if processed {
            self.frame_file(PROCESSED_DIR, id)
        } else {
            self.manifest.frames[index].image_file.clone()
        };
        write_png(image, &self.root.join(&file))?;

        let frame = &mut self.manifest.frames[index];
        if processed {
            frame.processed_file = Some(file);
            frame.status = FrameStatus::BackgroundRemoved;
        }
        Ok(())
    }

    pub fn load_image(&self, index: usize, source: ImageSource) -> Result<DynamicImage> {
        let frame = self.frame_or_err(index)?;
        let file = match source {
            ImageSource::Original => frame.image_file.as_path(),
            ImageSource::Processed => frame.display_file(),
        };
        read_image(&self.root.join(file))
    }

    pub fn load_display_image(&self, index: usize) -> Result<DynamicImage> {
        self.load_image(index, ImageSource::Processed)
    }

    /// Applies `new_order[i] = old index`. Anything other than a permutation
    /// of the current indices is ignored and `false` returned.
    pub fn reorder(&mut self, new_order: &[usize]) -> bool {
        let n = self.len();
        let mut seen = vec![false; n];
        if new_order.len() != n
            || new_order
                .iter()
                .any(|&i| i >= n || std::mem::replace(&mut seen[i], true))
        {
            return false;
        }

        let mut frames: Vec<FrameData> = new_order
            .iter()
            .map(|&old| self.manifest.frames[old].clone())
            .collect();
        for (i, frame) in frames.iter_mut().enumerate() {
            frame.index = i;
        }
        self.manifest.frames = frames;
        true
    }

    /// Copies every image under `dir` (sorted by path) into the project.
    /// Timestamps are assigned from `fps` when given, otherwise zero.
    pub fn import_dir(&mut self, dir: &Path, fps: Option<f64>) -> Result<usize> {
        if !dir.is_dir() {
            return Err(SpriteCullError::fs(
                dir,
                "import directory",
                std::io::Error::new(std::io::ErrorKind::NotFound, "directory does not exist"),
            ));
        }

        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| p.is_file() && is_supported_image(p))
            .collect();
        files.sort();

        for (i, file) in files.iter().enumerate() {
            let image = read_image(file)?;
            let timestamp = fps.filter(|f| *f > 0.0).map_or(0.0, |f| i as f64 / f);
            self.add_frame(&image, timestamp)?;
        }
        tracing::info!("imported {} images from {}", files.len(), dir.display());
        Ok(files.len())
    }

    pub fn features(&self) -> Option<&FeatureSet> {
        self.features.as_ref()
    }

    /// Replaces the feature store. Pose features mark their frames as pose-detected.
    pub fn set_features(&mut self, features: FeatureSet) {
        if features.mode() == DetectMode::Pose {
            for frame in self.manifest.frames.iter_mut() {
                if features.contains(frame.id) {
                    frame.status = FrameStatus::PoseDetected;
                }
            }
        }
        self.manifest.feature_mode = Some(features.mode());
        self.features = Some(features);
    }
}

/// Runs `op` on each listed frame in parallel and stores the results as
/// processed copies. `None` leaves a frame untouched. Returns the number of
/// frames written.
pub fn process_frames<F>(
    project: &mut FrameProject,
    indices: &[usize],
    source: ImageSource,
    progress: &ProgressBar,
    cancel: &CancelFlag,
    op: F,
) -> Result<usize>
where
    F: Fn(&DynamicImage) -> Result<Option<DynamicImage>> + Sync,
{
    let shared: &FrameProject = project;
    let results: Vec<(usize, Option<DynamicImage>)> = indices
        .par_iter()
        .progress_with(progress.clone())
        .map(|&index| -> Result<(usize, Option<DynamicImage>)> {
            cancel.check()?;
            let image = shared.load_image(index, source)?;
            Ok((index, op(&image)?))
        })
        .collect::<Result<_>>()?;
    progress.finish();

    let mut written = 0;
    for (index, result) in results {
        match result {
            Some(image) => {
                project.update_image(index, &image, true)?;
                written += 1;
            }
            None => tracing::debug!("frame {} left unchanged", index),
        }
    }
    Ok(written)
}
