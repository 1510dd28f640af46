//! Turns a character video clip into a trimmed, background-free sprite
//! animation: frames are sampled into an on-disk project, matted, compared
//! for near-duplicates and exported as sheets, GIFs or Godot resources.

pub mod background;
pub mod config;
pub mod cull;
pub mod errors;
pub mod export;
pub mod features;
pub mod frames;
pub mod imageops;
pub mod model;
pub mod pose;
pub mod progress_tracker;
pub mod rtmpose;
pub mod traits;
pub mod transform;
pub mod upscale;
pub mod video;

pub mod mocks;

pub use background::{AiParams, BackgroundMode, BackgroundRemover, ColorParams, ColorPreset};
pub use config::Settings;
pub use cull::{CullReport, FrameGroup, LoopPoint};
pub use errors::{Result, SpriteCullError};
pub use export::{ExportConfig, ExportFormat, ExportFrame, ExportReport, LayoutMode};
pub use features::{DetectMode, FeatureSet};
pub use frames::{FrameData, FrameProject, FrameStatus, ImageSource};
pub use model::{AiModel, MattingSessionCache, OnnxMattingModel};
pub use pose::{Landmark, PoseData};
pub use progress_tracker::CancelFlag;
pub use rtmpose::RtmPoseModel;
pub use traits::*;
pub use video::{FrameExtractor, VideoInfo};

#[cfg(test)]
pub use mocks::*;
