//! Turns raw volumes into a detrended, condition-filtered design matrix

use crate::ml::stats::detrend_linear;
use crate::structs::{Attributes, DecodeError, DecodingData, Result};
use ndarray::{s, Array2, Array3, Array4, Axis};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Preprocessing knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreprocessConfig {
    /// Largest label kept as a task condition
    pub max_label: i64,
    /// Label dropped after the range filter (rest/baseline)
    pub rest_label: i64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_label: 2,
            rest_label: 0,
        }
    }
}

/// Grid coordinates of in-mask voxels, row-major (z varies fastest)
#[must_use]
pub fn masked_voxels(mask: &Array3<f64>) -> Vec<[usize; 3]> {
    mask.indexed_iter()
        .filter(|(_, &v)| v != 0.0)
        .map(|((x, y, z), _)| [x, y, z])
        .collect()
}

impl DecodingData {
    /// Mask, flatten, detrend per session and filter conditions
    ///
    /// # Errors
    /// Returns `Load` error on shape mismatches and `Config` error when the
    /// mask is empty or no sample survives the condition filter
    pub fn from_volume(
        volume: &Array4<f64>,
        mask: &Array3<f64>,
        attributes: &Attributes,
        config: &PreprocessConfig,
    ) -> Result<Self> {
        let mut data = Self::masked(volume, mask, attributes)?;
        data.detrend_by_session();
        data.filter_conditions(config)
    }

    /// Select in-mask voxels of every frame; rows = volumes, columns = voxels
    ///
    /// # Errors
    /// Returns `Load` error on shape mismatches, `Config` error on an empty mask
    pub fn masked(
        volume: &Array4<f64>,
        mask: &Array3<f64>,
        attributes: &Attributes,
    ) -> Result<Self> {
        let (nx, ny, nz, nt) = volume.dim();
        if mask.dim() != (nx, ny, nz) {
            return Err(DecodeError::Load(format!(
                "mask shape {:?} does not match volume spatial shape {:?}",
                mask.dim(),
                (nx, ny, nz)
            )));
        }
        if attributes.len() != nt {
            return Err(DecodeError::Load(format!(
                "{} attribute rows for {nt} volumes",
                attributes.len()
            )));
        }

        let voxels = masked_voxels(mask);
        if voxels.is_empty() {
            return Err(DecodeError::Config(
                "mask selects no voxels; refusing to decode with zero features".into(),
            ));
        }

        let mut x = Array2::<f64>::zeros((nt, voxels.len()));
        for (j, &[vx, vy, vz]) in voxels.iter().enumerate() {
            x.column_mut(j).assign(&volume.slice(s![vx, vy, vz, ..]));
        }

        info!(
            "Masked {} of {} voxels across {nt} volumes",
            voxels.len(),
            nx * ny * nz
        );

        Self::new(x, attributes.labels.clone(), attributes.sessions.clone())
    }

    /// Linearly detrend the rows of each session independently
    ///
    /// Rows of a session need not be contiguous; they are detrended in
    /// their original order.
    pub fn detrend_by_session(&mut self) {
        let mut sessions: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (row, &session) in self.sessions.iter().enumerate() {
            sessions.entry(session).or_default().push(row);
        }

        for (session, rows) in &sessions {
            let mut block = self.x.select(Axis(0), rows);
            detrend_linear(block.view_mut());
            for (&row, detrended) in rows.iter().zip(block.axis_iter(Axis(0))) {
                self.x.row_mut(row).assign(&detrended);
            }
            debug!("Detrended session {session} ({} volumes)", rows.len());
        }
    }

    /// Keep rows whose label is a task condition, in lockstep
    ///
    /// Drops `label > max_label`, then drops `label == rest_label`.
    ///
    /// # Errors
    /// Returns `Config` error if no sample remains
    pub fn filter_conditions(self, config: &PreprocessConfig) -> Result<Self> {
        let in_range = self.retain_rows(|label| label <= config.max_label);
        let filtered = in_range.retain_rows(|label| label != config.rest_label);

        if filtered.n_samples() == 0 {
            return Err(DecodeError::Config(format!(
                "no samples left after keeping labels <= {} and dropping label {}",
                config.max_label, config.rest_label
            )));
        }

        info!(
            "Kept {} samples in {} conditions",
            filtered.n_samples(),
            filtered.n_conditions()
        );
        Ok(filtered)
    }

    fn retain_rows(self, keep: impl Fn(i64) -> bool) -> Self {
        let rows: Vec<usize> = self
            .labels
            .iter()
            .enumerate()
            .filter(|(_, &label)| keep(label))
            .map(|(i, _)| i)
            .collect();

        Self {
            x: self.x.select(Axis(0), &rows),
            labels: rows.iter().map(|&i| self.labels[i]).collect(),
            sessions: rows.iter().map(|&i| self.sessions[i]).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes(labels: &[i64], sessions: &[i64]) -> Attributes {
        Attributes {
            labels: labels.to_vec(),
            sessions: sessions.to_vec(),
        }
    }

    fn volume(nt: usize) -> Array4<f64> {
        Array4::from_shape_fn((2, 2, 1, nt), |(x, y, _, t)| {
            (x * 10 + y) as f64 + (t as f64) * 0.5 + if t % 2 == 0 { 1.0 } else { -1.0 }
        })
    }

    #[test]
    fn test_masked_voxels_order() {
        let mut mask = Array3::<f64>::zeros((2, 2, 2));
        mask[[0, 1, 1]] = 1.0;
        mask[[1, 0, 0]] = 3.0;
        mask[[0, 0, 1]] = 1.0;

        assert_eq!(masked_voxels(&mask), vec![[0, 0, 1], [0, 1, 1], [1, 0, 0]]);
    }

    #[test]
    fn test_masked_design_matrix() {
        let vol = volume(4);
        let mut mask = Array3::<f64>::zeros((2, 2, 1));
        mask[[0, 1, 0]] = 1.0;
        mask[[1, 1, 0]] = 1.0;

        let data = DecodingData::masked(&vol, &mask, &attributes(&[1, 2, 1, 2], &[0, 0, 1, 1]))
            .expect("mask");

        assert_eq!(data.n_samples(), 4);
        assert_eq!(data.n_features(), 2);
        assert!((data.x[[2, 1]] - vol[[1, 1, 0, 2]]).abs() < 1e-12);
    }

    #[test]
    fn test_empty_mask_is_config_error() {
        let vol = volume(4);
        let mask = Array3::<f64>::zeros((2, 2, 1));
        let result = DecodingData::masked(&vol, &mask, &attributes(&[1, 2, 1, 2], &[0, 0, 1, 1]));
        assert!(matches!(result, Err(DecodeError::Config(_))));
    }

    #[test]
    fn test_shape_mismatches_are_load_errors() {
        let vol = volume(4);
        let mask = Array3::<f64>::ones((2, 2, 1));
        let short = DecodingData::masked(&vol, &mask, &attributes(&[1, 2, 1], &[0, 0, 1]));
        assert!(matches!(short, Err(DecodeError::Load(_))));

        let wrong_mask = Array3::<f64>::ones((2, 3, 1));
        let attrs = attributes(&[1, 2, 1, 2], &[0, 0, 1, 1]);
        let result = DecodingData::masked(&vol, &wrong_mask, &attrs);
        assert!(matches!(result, Err(DecodeError::Load(_))));
    }

    #[test]
    fn test_detrend_is_per_session() {
        let vol = volume(6);
        let mask = Array3::<f64>::ones((2, 2, 1));
        // Interleaved sessions
        let attrs = attributes(&[1, 2, 1, 2, 1, 2], &[0, 1, 0, 1, 0, 1]);
        let mut data = DecodingData::masked(&vol, &mask, &attrs).expect("mask");
        data.detrend_by_session();

        for session in [0, 1] {
            let rows: Vec<usize> = (0..6).filter(|r| attrs.sessions[*r] == session).collect();
            let block = data.x.select(Axis(0), &rows);
            for column in block.axis_iter(Axis(1)) {
                assert!(column.sum().abs() < 1e-9);
            }
        }
        assert_eq!(data.n_samples(), 6);
    }

    #[test]
    fn test_filter_keeps_alignment() {
        let vol = volume(6);
        let mask = Array3::<f64>::ones((2, 2, 1));
        let attrs = attributes(&[0, 1, 2, 3, 1, 2], &[0, 0, 0, 1, 1, 1]);
        let data = DecodingData::masked(&vol, &mask, &attrs).expect("mask");
        let original = data.x.clone();

        let filtered = data
            .filter_conditions(&PreprocessConfig::default())
            .expect("filter");

        assert_eq!(filtered.labels, vec![1, 2, 1, 2]);
        assert_eq!(filtered.sessions, vec![0, 0, 1, 1]);
        assert_eq!(filtered.x.nrows(), filtered.labels.len());
        assert_eq!(filtered.x.row(2), original.row(4));
    }

    #[test]
    fn test_filter_everything_is_config_error() {
        let vol = volume(2);
        let mask = Array3::<f64>::ones((2, 2, 1));
        let data = DecodingData::masked(&vol, &mask, &attributes(&[0, 7], &[0, 1])).expect("mask");
        let result = data.filter_conditions(&PreprocessConfig::default());
        assert!(matches!(result, Err(DecodeError::Config(_))));
    }

    #[test]
    fn test_from_volume_pipeline() {
        let vol = volume(8);
        let mask = Array3::<f64>::ones((2, 2, 1));
        let attrs = attributes(&[1, 2, 0, 1, 2, 1, 5, 2], &[0, 0, 0, 0, 1, 1, 1, 1]);

        let data = DecodingData::from_volume(&vol, &mask, &attrs, &PreprocessConfig::default())
            .expect("preprocess");

        assert_eq!(data.n_samples(), 6);
        assert_eq!(data.labels.len(), data.sessions.len());
        assert_eq!(data.n_features(), 4);
    }
}
