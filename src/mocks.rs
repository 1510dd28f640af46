use image::{GrayImage, Luma, RgbImage};

use crate::errors::Result;
use crate::pose::{Landmark, PoseData, LANDMARK_COUNT};
use crate::traits::{MattingModel, PoseEstimator};

/// Matting model that keys out pure black pixels.
#[derive(Debug, Clone)]
pub struct MockMattingModel {
    pub input_size: u32,
}

impl MockMattingModel {
    pub const fn new(input_size: u32) -> Self {
        Self { input_size }
    }
}

impl MattingModel for MockMattingModel {
    fn predict_mask(&self, image: &RgbImage) -> Result<GrayImage> {
        Ok(GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let p = image.get_pixel(x, y);
            if p.0 == [0, 0, 0] {
                Luma([0])
            } else {
                Luma([255])
            }
        }))
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }
}

/// Pose estimator returning a fixed skeleton, or nothing for blank frames.
#[derive(Debug, Clone)]
pub struct MockPoseEstimator {
    landmarks: Vec<Landmark>,
}

impl MockPoseEstimator {
    pub fn new(landmarks: Vec<Landmark>) -> Self {
        Self { landmarks }
    }

    /// Every joint visible and straight.
    pub fn standing() -> Self {
        let mut landmarks = vec![Landmark::new(0.5, 0.1, 0.9); LANDMARK_COUNT];
        let points = [
            (11, 0.4, 0.3),
            (12, 0.6, 0.3),
            (13, 0.35, 0.45),
            (14, 0.65, 0.45),
            (15, 0.3, 0.6),
            (16, 0.7, 0.6),
            (23, 0.45, 0.6),
            (24, 0.55, 0.6),
            (25, 0.45, 0.75),
            (26, 0.55, 0.75),
            (27, 0.45, 0.9),
            (28, 0.55, 0.9),
        ];
        for (i, x, y) in points {
            landmarks[i] = Landmark::new(x, y, 0.9);
        }
        Self::new(landmarks)
    }
}

impl PoseEstimator for MockPoseEstimator {
    fn estimate(&self, image: &RgbImage, frame_index: usize) -> Result<Option<PoseData>> {
        if image.pixels().all(|p| p.0 == [0, 0, 0]) && image.width() * image.height() > 64 {
            return Ok(None);
        }
        Ok(Some(PoseData::new(frame_index, self.landmarks.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_mock_matting_mask() -> Result<()> {
        let mut image = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        image.put_pixel(1, 1, Rgb([200, 10, 10]));
        let mask = MockMattingModel::new(320).predict_mask(&image)?;
        assert_eq!(mask.get_pixel(1, 1)[0], 255);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        Ok(())
    }

    #[test]
    fn test_mock_pose_skips_blank_frames() -> Result<()> {
        let estimator = MockPoseEstimator::standing();
        assert!(estimator.estimate(&RgbImage::new(16, 16), 0)?.is_none());
        let pose = estimator
            .estimate(&RgbImage::from_pixel(16, 16, Rgb([9, 9, 9])), 4)?
            .unwrap();
        assert_eq!(pose.frame_index, 4);
        assert!((pose.similarity_to(&pose) - 1.0).abs() < 1e-6);
        Ok(())
    }
}
