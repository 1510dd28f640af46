use image::{GrayImage, RgbImage};

use crate::errors::Result;
use crate::pose::PoseData;

/// Foreground matting model producing a soft alpha mask.
///
/// Implementations must be shareable across rayon workers, so any
/// interior session state sits behind a lock.
pub trait MattingModel: Send + Sync {
    /// Mask with the same size as `image`, 255 = foreground.
    fn predict_mask(&self, image: &RgbImage) -> Result<GrayImage>;

    /// Square input edge the model was exported with.
    fn input_size(&self) -> u32;
}

/// Single-person keypoint estimator.
pub trait PoseEstimator: Send + Sync {
    /// `Ok(None)` when no person is found.
    fn estimate(&self, image: &RgbImage, frame_index: usize) -> Result<Option<PoseData>>;
}
