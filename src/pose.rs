//! 33-point body landmarks and the angle-based pose similarity built on them.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use serde::{Deserialize, Serialize};

pub const LANDMARK_COUNT: usize = 33;

pub const NOSE: usize = 0;
pub const LEFT_EYE_INNER: usize = 1;
pub const LEFT_EYE: usize = 2;
pub const LEFT_EYE_OUTER: usize = 3;
pub const RIGHT_EYE_INNER: usize = 4;
pub const RIGHT_EYE: usize = 5;
pub const RIGHT_EYE_OUTER: usize = 6;
pub const LEFT_EAR: usize = 7;
pub const RIGHT_EAR: usize = 8;
pub const MOUTH_LEFT: usize = 9;
pub const MOUTH_RIGHT: usize = 10;
pub const LEFT_SHOULDER: usize = 11;
pub const RIGHT_SHOULDER: usize = 12;
pub const LEFT_ELBOW: usize = 13;
pub const RIGHT_ELBOW: usize = 14;
pub const LEFT_WRIST: usize = 15;
pub const RIGHT_WRIST: usize = 16;
pub const LEFT_PINKY: usize = 17;
pub const RIGHT_PINKY: usize = 18;
pub const LEFT_INDEX: usize = 19;
pub const RIGHT_INDEX: usize = 20;
pub const LEFT_THUMB: usize = 21;
pub const RIGHT_THUMB: usize = 22;
pub const LEFT_HIP: usize = 23;
pub const RIGHT_HIP: usize = 24;
pub const LEFT_KNEE: usize = 25;
pub const RIGHT_KNEE: usize = 26;
pub const LEFT_ANKLE: usize = 27;
pub const RIGHT_ANKLE: usize = 28;
pub const LEFT_HEEL: usize = 29;
pub const RIGHT_HEEL: usize = 30;
pub const LEFT_FOOT_INDEX: usize = 31;
pub const RIGHT_FOOT_INDEX: usize = 32;

/// Skeleton edges drawn between landmarks.
pub const POSE_CONNECTIONS: [(usize, usize); 35] = [
    // head
    (NOSE, LEFT_EYE_INNER),
    (LEFT_EYE_INNER, LEFT_EYE),
    (LEFT_EYE, LEFT_EYE_OUTER),
    (NOSE, RIGHT_EYE_INNER),
    (RIGHT_EYE_INNER, RIGHT_EYE),
    (RIGHT_EYE, RIGHT_EYE_OUTER),
    (LEFT_EYE_OUTER, LEFT_EAR),
    (RIGHT_EYE_OUTER, RIGHT_EAR),
    (MOUTH_LEFT, MOUTH_RIGHT),
    // torso
    (LEFT_SHOULDER, RIGHT_SHOULDER),
    (LEFT_SHOULDER, LEFT_HIP),
    (RIGHT_SHOULDER, RIGHT_HIP),
    (LEFT_HIP, RIGHT_HIP),
    // left arm
    (LEFT_SHOULDER, LEFT_ELBOW),
    (LEFT_ELBOW, LEFT_WRIST),
    (LEFT_WRIST, LEFT_PINKY),
    (LEFT_WRIST, LEFT_INDEX),
    (LEFT_WRIST, LEFT_THUMB),
    (LEFT_PINKY, LEFT_INDEX),
    // right arm
    (RIGHT_SHOULDER, RIGHT_ELBOW),
    (RIGHT_ELBOW, RIGHT_WRIST),
    (RIGHT_WRIST, RIGHT_PINKY),
    (RIGHT_WRIST, RIGHT_INDEX),
    (RIGHT_WRIST, RIGHT_THUMB),
    (RIGHT_PINKY, RIGHT_INDEX),
    // left leg
    (LEFT_HIP, LEFT_KNEE),
    (LEFT_KNEE, LEFT_ANKLE),
    (LEFT_ANKLE, LEFT_HEEL),
    (LEFT_ANKLE, LEFT_FOOT_INDEX),
    (LEFT_HEEL, LEFT_FOOT_INDEX),
    // right leg
    (RIGHT_HIP, RIGHT_KNEE),
    (RIGHT_KNEE, RIGHT_ANKLE),
    (RIGHT_ANKLE, RIGHT_HEEL),
    (RIGHT_ANKLE, RIGHT_FOOT_INDEX),
    (RIGHT_HEEL, RIGHT_FOOT_INDEX),
];

/// Joints compared by [`PoseData::similarity_to`]; the middle index is the vertex.
pub const JOINTS: [(&str, usize, usize, usize); 10] = [
    ("left_elbow", LEFT_SHOULDER, LEFT_ELBOW, LEFT_WRIST),
    ("right_elbow", RIGHT_SHOULDER, RIGHT_ELBOW, RIGHT_WRIST),
    ("left_shoulder", LEFT_ELBOW, LEFT_SHOULDER, LEFT_HIP),
    ("right_shoulder", RIGHT_ELBOW, RIGHT_SHOULDER, RIGHT_HIP),
    ("left_hip", LEFT_SHOULDER, LEFT_HIP, LEFT_KNEE),
    ("right_hip", RIGHT_SHOULDER, RIGHT_HIP, RIGHT_KNEE),
    ("left_knee", LEFT_HIP, LEFT_KNEE, LEFT_ANKLE),
    ("right_knee", RIGHT_HIP, RIGHT_KNEE, RIGHT_ANKLE),
    ("torso_left", RIGHT_SHOULDER, LEFT_SHOULDER, LEFT_HIP),
    ("torso_right", LEFT_SHOULDER, RIGHT_SHOULDER, RIGHT_HIP),
];

const VISIBLE: f32 = 0.5;
/// Mean angle difference (degrees) at which similarity reaches zero.
const ZERO_SIMILARITY_DEGREES: f32 = 30.0;

/// A keypoint in normalised image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
    #[serde(default = "full_visibility")]
    pub visibility: f32,
}

fn full_visibility() -> f32 {
    1.0
}

impl Landmark {
    pub const fn new(x: f32, y: f32, visibility: f32) -> Self {
        Self {
            x,
            y,
            z: 0.0,
            visibility,
        }
    }

    pub const fn hidden() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn to_pixel(&self, width: u32, height: u32) -> (i32, i32) {
        ((self.x * width as f32) as i32, (self.y * height as f32) as i32)
    }

    pub fn distance_to(&self, other: &Landmark) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }

    pub fn is_visible(&self) -> bool {
        self.visibility > VISIBLE
    }
}

/// Angle at `p2` in radians, or `None` for occluded or degenerate joints.
fn joint_angle(p1: &Landmark, p2: &Landmark, p3: &Landmark) -> Option<f32> {
    if p1.visibility < VISIBLE || p2.visibility < VISIBLE || p3.visibility < VISIBLE {
        return None;
    }

    let v1 = (p1.x - p2.x, p1.y - p2.y);
    let v2 = (p3.x - p2.x, p3.y - p2.y);
    let mag1 = (v1.0 * v1.0 + v1.1 * v1.1).sqrt();
    let mag2 = (v2.0 * v2.0 + v2.1 * v2.1).sqrt();
    if mag1 < 1e-6 || mag2 < 1e-6 {
        return None;
    }

    let cos = ((v1.0 * v2.0 + v1.1 * v2.1) / (mag1 * mag2)).clamp(-1.0, 1.0);
    Some(cos.acos())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseData {
    pub frame_index: usize,
    pub landmarks: Vec<Landmark>,
    pub confidence: f32,
}

impl PoseData {
    /// Confidence is the mean visibility of the clearly visible points.
    pub fn new(frame_index: usize, landmarks: Vec<Landmark>) -> Self {
        let visible: Vec<f32> = landmarks
            .iter()
            .filter(|lm| lm.is_visible())
            .map(|lm| lm.visibility)
            .collect();
        let confidence = if visible.is_empty() {
            0.0
        } else {
            visible.iter().sum::<f32>() / visible.len() as f32
        };
        Self {
            frame_index,
            landmarks,
            confidence,
        }
    }

    pub fn landmark(&self, index: usize) -> Option<&Landmark> {
        self.landmarks.get(index)
    }

    /// Position-independent joint angles in radians.
    pub fn joint_angles(&self) -> Vec<(&'static str, Option<f32>)> {
        JOINTS
            .iter()
            .map(|&(name, a, b, c)| {
                let angle = match (self.landmark(a), self.landmark(b), self.landmark(c)) {
                    (Some(p1), Some(p2), Some(p3)) => joint_angle(p1, p2, p3),
                    _ => None,
                };
                (name, angle)
            })
            .collect()
    }

    /// 1.0 for identical joint angles, falling linearly to 0 at a mean
    /// difference of 30 degrees.
    pub fn similarity_to(&self, other: &PoseData) -> f32 {
        if self.landmarks.len() != other.landmarks.len() || self.landmarks.len() < LANDMARK_COUNT
        {
            return 0.0;
        }

        let (total, count) = self
            .joint_angles()
            .into_iter()
            .zip(other.joint_angles())
            .filter_map(|((_, a), (_, b))| Some((a?, b?)))
            .fold((0.0f32, 0usize), |(sum, n), (a, b)| (sum + (a - b).abs(), n + 1));
        if count == 0 {
            return 0.0;
        }

        let mean_degrees = (total / count as f32).to_degrees();
        (1.0 - mean_degrees / ZERO_SIMILARITY_DEGREES).max(0.0)
    }

    /// Flattened `[x, y, z]` per landmark.
    pub fn to_vector(&self) -> Vec<f32> {
        self.landmarks
            .iter()
            .flat_map(|lm| [lm.x, lm.y, lm.z])
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoseStyle {
    pub landmark_color: Rgb<u8>,
    pub connection_color: Rgb<u8>,
    pub thickness: u32,
    pub draw_landmarks: bool,
    pub draw_connections: bool,
}

impl Default for PoseStyle {
    fn default() -> Self {
        Self {
            landmark_color: Rgb([0, 184, 212]),
            connection_color: Rgb([255, 255, 255]),
            thickness: 2,
            draw_landmarks: true,
            draw_connections: true,
        }
    }
}

/// Overlays the skeleton on a copy of `image`. Only visible points are drawn.
pub fn draw_pose(image: &RgbImage, pose: &PoseData, style: &PoseStyle) -> RgbImage {
    let mut canvas = image.clone();
    let (w, h) = image.dimensions();

    if style.draw_connections {
        let half = (style.thickness / 2) as i32;
        for &(start, end) in POSE_CONNECTIONS.iter() {
            let (Some(a), Some(b)) = (pose.landmark(start), pose.landmark(end)) else {
                continue;
            };
            if !a.is_visible() || !b.is_visible() {
                continue;
            }
            let (ax, ay) = a.to_pixel(w, h);
            let (bx, by) = b.to_pixel(w, h);
            for dx in -half..=half {
                for dy in -half..=half {
                    draw_line_segment_mut(
                        &mut canvas,
                        ((ax + dx) as f32, (ay + dy) as f32),
                        ((bx + dx) as f32, (by + dy) as f32),
                        style.connection_color,
                    );
                }
            }
        }
    }

    if style.draw_landmarks {
        let radius = style.thickness as i32 + 2;
        for lm in pose.landmarks.iter().filter(|lm| lm.is_visible()) {
            draw_filled_circle_mut(&mut canvas, lm.to_pixel(w, h), radius, style.landmark_color);
        }
    }

    canvas
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Upright figure with straight limbs, every point visible.
    pub(crate) fn standing_pose(frame_index: usize) -> PoseData {
        let mut landmarks = vec![Landmark::new(0.5, 0.1, 0.9); LANDMARK_COUNT];
        let mut set = |i: usize, x: f32, y: f32| landmarks[i] = Landmark::new(x, y, 0.9);
        set(LEFT_SHOULDER, 0.4, 0.3);
        set(RIGHT_SHOULDER, 0.6, 0.3);
        set(LEFT_ELBOW, 0.35, 0.45);
        set(RIGHT_ELBOW, 0.65, 0.45);
        set(LEFT_WRIST, 0.3, 0.6);
        set(RIGHT_WRIST, 0.7, 0.6);
        set(LEFT_HIP, 0.45, 0.6);
        set(RIGHT_HIP, 0.55, 0.6);
        set(LEFT_KNEE, 0.45, 0.75);
        set(RIGHT_KNEE, 0.55, 0.75);
        set(LEFT_ANKLE, 0.45, 0.9);
        set(RIGHT_ANKLE, 0.55, 0.9);
        PoseData::new(frame_index, landmarks)
    }

    #[test]
    fn test_landmark_helpers() {
        let lm = Landmark::new(0.5, 0.25, 1.0);
        assert_eq!(lm.to_pixel(200, 100), (100, 25));
        let other = Landmark::new(0.5, 0.0, 1.0);
        assert!((lm.distance_to(&other) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_joint_angle_right_angle() {
        let a = Landmark::new(1.0, 0.0, 1.0);
        let b = Landmark::new(0.0, 0.0, 1.0);
        let c = Landmark::new(0.0, 1.0, 1.0);
        let angle = joint_angle(&a, &b, &c).unwrap();
        assert!((angle.to_degrees() - 90.0).abs() < 1e-3);

        let hidden = Landmark::new(0.0, 1.0, 0.4);
        assert!(joint_angle(&a, &b, &hidden).is_none());
        assert!(joint_angle(&a, &b, &b).is_none());
    }

    #[test]
    fn test_identical_poses_fully_similar() {
        let pose = standing_pose(0);
        assert_eq!(pose.joint_angles().len(), 10);
        assert!((pose.similarity_to(&standing_pose(1)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_translation_does_not_matter() {
        let pose = standing_pose(0);
        let mut moved = pose.clone();
        for lm in moved.landmarks.iter_mut() {
            lm.x += 0.1;
        }
        assert!((pose.similarity_to(&moved) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_bent_knee_lowers_similarity() {
        let pose = standing_pose(0);
        let mut bent = pose.clone();
        bent.landmarks[LEFT_ANKLE] = Landmark::new(0.6, 0.8, 0.9);
        let similarity = pose.similarity_to(&bent);
        assert!(similarity < 1.0);
        assert!(similarity >= 0.0);
    }

    #[test]
    fn test_short_or_invisible_poses() {
        let pose = standing_pose(0);
        let short = PoseData::new(1, pose.landmarks[..20].to_vec());
        assert_eq!(pose.similarity_to(&short), 0.0);

        let invisible = PoseData::new(2, vec![Landmark::hidden(); LANDMARK_COUNT]);
        assert_eq!(invisible.confidence, 0.0);
        assert_eq!(invisible.similarity_to(&invisible), 0.0);
    }

    #[test]
    fn test_confidence_and_vector() {
        let mut landmarks = vec![Landmark::hidden(); LANDMARK_COUNT];
        landmarks[0] = Landmark::new(0.1, 0.2, 0.8);
        landmarks[1] = Landmark::new(0.1, 0.2, 0.6);
        let pose = PoseData::new(0, landmarks);
        assert!((pose.confidence - 0.7).abs() < 1e-6);
        assert_eq!(pose.to_vector().len(), LANDMARK_COUNT * 3);
    }

    #[test]
    fn test_draw_pose_marks_visible_points() {
        let image = RgbImage::new(100, 100);
        let pose = standing_pose(0);
        let drawn = draw_pose(&image, &pose, &PoseStyle::default());
        let (x, y) = pose.landmarks[LEFT_KNEE].to_pixel(100, 100);
        assert_eq!(drawn.get_pixel(x as u32, y as u32), &Rgb([0, 184, 212]));
        assert_eq!(image.get_pixel(x as u32, y as u32), &Rgb([0, 0, 0]));
    }
}
