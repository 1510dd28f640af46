//! Near-duplicate culling and loop-point search over the selected frames.

use serde::Serialize;

use crate::errors::{Result, SpriteCullError};
use crate::features::FeatureSet;
use crate::frames::FrameProject;

/// Consecutive frames similar to their first member (the anchor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameGroup {
    pub anchor: usize,
    /// Frame indices in order, anchor first.
    pub members: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CullReport {
    pub groups: Vec<FrameGroup>,
    pub kept: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoopPoint {
    pub first: usize,
    pub loop_frame: usize,
    pub similarity: f32,
    /// Last frame of the loop; the loop frame itself repeats the first.
    pub suggested_end: usize,
}

/// `(index, id)` of selected frames, failing when fewer than two.
fn selected_pairs(project: &FrameProject) -> Result<Vec<(usize, u64)>> {
    let selected: Vec<(usize, u64)> = project
        .selected_frames()
        .into_iter()
        .map(|f| (f.index, f.id))
        .collect();
    if selected.len() < 2 {
        return Err(SpriteCullError::validation(
            "selection",
            format!("needs at least 2 selected frames (have {})", selected.len()),
        ));
    }
    Ok(selected)
}

fn project_features(project: &FrameProject) -> Result<&FeatureSet> {
    project
        .features()
        .ok_or_else(|| SpriteCullError::validation("features", "none computed; run analyze first"))
}

/// Walks `frames` in order, starting a new group whenever a frame's
/// similarity to the current anchor drops below `threshold`. Frames without
/// a feature are skipped.
pub fn group_similar(
    frames: &[(usize, u64)],
    features: &FeatureSet,
    threshold: f32,
) -> Result<Vec<FrameGroup>> {
    let with_data: Vec<(usize, u64)> = frames
        .iter()
        .copied()
        .filter(|(_, id)| features.contains(*id))
        .collect();
    if with_data.len() < 2 {
        return Err(SpriteCullError::validation(
            "features",
            format!(
                "{} of the selected frames have {} features; at least 2 are needed",
                with_data.len(),
                features.mode()
            ),
        ));
    }

    let mut groups = Vec::new();
    let (mut anchor_index, mut anchor_id) = with_data[0];
    let mut members = vec![anchor_index];
    for &(index, id) in &with_data[1..] {
        let similarity = features.similarity(anchor_id, id).unwrap_or(0.0);
        if similarity >= threshold {
            members.push(index);
        } else {
            groups.push(FrameGroup {
                anchor: anchor_index,
                members: std::mem::take(&mut members),
            });
            anchor_index = index;
            anchor_id = id;
            members.push(index);
        }
    }
    groups.push(FrameGroup {
        anchor: anchor_index,
        members,
    });
    Ok(groups)
}

/// Keeps each group's anchor selected and deselects the rest.
pub fn apply_groups(project: &mut FrameProject, groups: Vec<FrameGroup>) -> CullReport {
    let mut removed = 0;
    for group in &groups {
        project.select(group.anchor, true);
        for &member in group.members.iter().skip(1) {
            project.select(member, false);
            removed += 1;
        }
    }
    CullReport {
        kept: groups.len(),
        removed,
        groups,
    }
}

/// Groups the selected frames and reduces the selection to the anchors.
pub fn cull(project: &mut FrameProject, threshold: f32) -> Result<CullReport> {
    crate::config::check_threshold(threshold)?;
    let selected = selected_pairs(project)?;
    let groups = group_similar(&selected, project_features(project)?, threshold)?;
    let report = apply_groups(project, groups);
    tracing::info!(
        "{} groups, kept {} frames, deselected {}",
        report.groups.len(),
        report.kept,
        report.removed
    );
    Ok(report)
}

/// Finds the selected frame most similar to the first selected one. Later
/// frames win ties.
pub fn find_loop(project: &FrameProject) -> Result<LoopPoint> {
    let selected = selected_pairs(project)?;
    let features = project_features(project)?;
    let (first, first_id) = selected[0];
    if !features.contains(first_id) {
        return Err(SpriteCullError::validation(
            "features",
            format!("first selected frame #{} has no {} feature", first, features.mode()),
        ));
    }

    let mut best: Option<(usize, f32)> = None;
    for &(index, id) in selected[1..].iter().rev() {
        if let Some(similarity) = features.similarity(first_id, id) {
            if best.map_or(true, |(_, s)| similarity > s) {
                best = Some((index, similarity));
            }
        }
    }

    let (loop_frame, similarity) = best.ok_or_else(|| {
        SpriteCullError::validation(
            "features",
            format!("no other selected frame has a {} feature", features.mode()),
        )
    })?;
    Ok(LoopPoint {
        first,
        loop_frame,
        similarity,
        suggested_end: loop_frame - 1,
    })
}

/// Deselects every frame outside `first..loop_frame`. Frames inside keep their state.
pub fn restrict_to_loop(project: &mut FrameProject, point: &LoopPoint) {
    for index in 0..project.len() {
        if index < point.first || index >= point.loop_frame {
            project.select(index, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{DetectMode, Feature, ImageFeature};
    use image::{DynamicImage, Rgb, RgbImage};
    use tempfile::TempDir;

    /// Image features with flat histograms, so similarity is
    /// `0.6 + 0.4 * (1 - hamming / 64)`.
    fn hashed_set(hashes: &[u64]) -> Result<FeatureSet> {
        let mut set = FeatureSet::new(DetectMode::Image);
        for (id, &hash) in hashes.iter().enumerate() {
            set.insert(
                id as u64,
                Feature::Image(ImageFeature {
                    histogram: vec![0.0; 4],
                    hash,
                }),
            )?;
        }
        Ok(set)
    }

    fn project(n: usize) -> Result<(TempDir, FrameProject)> {
        let temp_dir = TempDir::new()?;
        let mut project = FrameProject::create(temp_dir.path().join("p"), None)?;
        for i in 0..n {
            let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([i as u8; 3])));
            project.add_frame(&image, i as f64)?;
        }
        Ok((temp_dir, project))
    }

    #[test]
    fn test_group_similar_uses_anchor() -> Result<()> {
        // 2 and 3 sit 32 bits away from the first group and from 4
        let set = hashed_set(&[0, 0, u64::MAX >> 32, u64::MAX >> 32, u64::MAX])?;
        let frames: Vec<_> = (0..5).map(|i| (i, i as u64)).collect();
        let groups = group_similar(&frames, &set, 0.95)?;
        assert_eq!(
            groups,
            vec![
                FrameGroup { anchor: 0, members: vec![0, 1] },
                FrameGroup { anchor: 2, members: vec![2, 3] },
                FrameGroup { anchor: 4, members: vec![4] },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_group_similar_needs_two_features() -> Result<()> {
        let set = hashed_set(&[0])?;
        let frames = [(0, 0), (1, 7)];
        assert!(matches!(
            group_similar(&frames, &set, 0.9),
            Err(SpriteCullError::Validation { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_cull_updates_selection() -> Result<()> {
        let (_tmp, mut project) = project(4)?;
        project.set_features(hashed_set(&[0, 0, 0, u64::MAX])?);

        let report = cull(&mut project, 0.9)?;
        assert_eq!(report.kept, 2);
        assert_eq!(report.removed, 2);
        assert_eq!(project.selected_indices(), vec![0, 3]);

        assert!(cull(&mut project, 1.5).is_err());
        Ok(())
    }

    #[test]
    fn test_cull_without_features() -> Result<()> {
        let (_tmp, mut project) = project(3)?;
        assert!(matches!(
            cull(&mut project, 0.9),
            Err(SpriteCullError::Validation { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_find_loop_prefers_later_on_tie() -> Result<()> {
        let (_tmp, mut project) = project(6)?;
        project.set_features(hashed_set(&[0, u64::MAX, 0b1, u64::MAX, 0b1, u64::MAX])?);

        let point = find_loop(&project)?;
        assert_eq!(point.first, 0);
        assert_eq!(point.loop_frame, 4);
        assert_eq!(point.suggested_end, 3);
        assert!((point.similarity - (0.6 + 0.4 * 63.0 / 64.0)).abs() < 1e-6);

        project.select(2, false);
        restrict_to_loop(&mut project, &point);
        assert_eq!(project.selected_indices(), vec![0, 1, 3]);
        Ok(())
    }

    #[test]
    fn test_find_loop_needs_first_feature() -> Result<()> {
        let (_tmp, mut project) = project(3)?;
        let mut set = hashed_set(&[0, 0, 0])?;
        set.remove(0);
        project.set_features(set);
        assert!(find_loop(&project).is_err());

        project.deselect_all();
        project.select(1, true);
        assert!(find_loop(&project).is_err());
        Ok(())
    }
}
