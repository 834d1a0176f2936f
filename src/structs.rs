//! Consolidated public types for the decoder
//!
//! This module contains the error type, the data model shared by the loader,
//! preprocessor, estimators and reporter, and the estimator traits.

use ndarray::{Array2, ArrayView2};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Fold error (held-out group {group}): {message}")]
    Fold { group: i64, message: String },

    #[error("ML error: {0}")]
    Ml(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

// ============================================================================
// Input Types
// ============================================================================

/// Per-volume attributes: condition label and acquisition session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub labels: Vec<i64>,
    pub sessions: Vec<i64>,
}

impl Attributes {
    /// Number of rows (one per imaging volume)
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

// ============================================================================
// Decoding Data
// ============================================================================

/// Design matrix with its aligned label and session vectors
///
/// Rows are imaging volumes, columns are in-mask voxels. `labels` and
/// `sessions` are aligned index-for-index with the rows of `x`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodingData {
    pub x: Array2<f64>,
    pub labels: Vec<i64>,
    pub sessions: Vec<i64>,
}

impl DecodingData {
    /// Build from parts, enforcing the row alignment invariant
    ///
    /// # Errors
    /// Returns `Load` error if the three parts disagree on the sample count
    pub fn new(x: Array2<f64>, labels: Vec<i64>, sessions: Vec<i64>) -> Result<Self> {
        if x.nrows() != labels.len() || labels.len() != sessions.len() {
            return Err(DecodeError::Load(format!(
                "{} samples in design matrix but {} labels and {} sessions",
                x.nrows(),
                labels.len(),
                sessions.len()
            )));
        }
        Ok(Self {
            x,
            labels,
            sessions,
        })
    }

    /// Get number of samples (rows)
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.x.nrows()
    }

    /// Get number of features (in-mask voxels)
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    /// Distinct condition codes, sorted
    #[must_use]
    pub fn conditions(&self) -> Vec<i64> {
        let set: BTreeSet<i64> = self.labels.iter().copied().collect();
        set.into_iter().collect()
    }

    #[must_use]
    pub fn n_conditions(&self) -> usize {
        self.conditions().len()
    }

    /// Accuracy expected from random guessing
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn chance_level(&self) -> f64 {
        match self.n_conditions() {
            0 => 0.0,
            n => 1.0 / n as f64,
        }
    }

    #[must_use]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.x.view()
    }
}

// ============================================================================
// Cross-Validation Types
// ============================================================================

/// One leave-one-group-out split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    /// Held-out group id
    pub group: i64,
    /// Training row indices (every other group)
    pub train: Vec<usize>,
    /// Held-out row indices
    pub test: Vec<usize>,
}

/// Score of one held-out group
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FoldScore {
    pub group: i64,
    pub n_test: usize,
    pub accuracy: f64,
}

/// How fold scores are collapsed into the reported accuracy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AccuracyNormalization {
    /// Fold scores taken as correct-prediction counts, summed and divided
    /// by `n_samples`
    #[default]
    SumOverSamples,
    /// Plain mean of per-fold accuracies
    FoldMean,
    /// Per-fold accuracies weighted by held-out size
    SampleWeighted,
}

impl AccuracyNormalization {
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::SumOverSamples => "summed fold scores / n_samples",
            Self::FoldMean => "mean of fold scores",
            Self::SampleWeighted => "sample-weighted mean",
        }
    }
}

/// Every accuracy normalization side by side, plus the chance baseline
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccuracySummary {
    pub sum_over_samples: f64,
    pub fold_mean: f64,
    pub sample_weighted: f64,
    pub chance_level: f64,
    pub n_samples: usize,
    pub n_folds: usize,
}

impl AccuracySummary {
    /// Value selected by `normalization`
    #[must_use]
    pub fn value(&self, normalization: AccuracyNormalization) -> f64 {
        match normalization {
            AccuracyNormalization::SumOverSamples => self.sum_over_samples,
            AccuracyNormalization::FoldMean => self.fold_mean,
            AccuracyNormalization::SampleWeighted => self.sample_weighted,
        }
    }
}

// ============================================================================
// Estimator Types
// ============================================================================

/// Which estimator variants a run evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum EstimatorChoice {
    #[default]
    Both,
    Anova,
    Clustering,
}

impl EstimatorChoice {
    #[must_use]
    pub fn runs_anova(self) -> bool {
        matches!(self, Self::Both | Self::Anova)
    }

    #[must_use]
    pub fn runs_clustering(self) -> bool {
        matches!(self, Self::Both | Self::Clustering)
    }
}

/// Iteration history of a fitted supervised-clustering estimator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusteringTrace {
    /// Inner cross-validated score of every visited parcellation
    pub scores: Vec<f64>,
    /// Differences between consecutive scores
    pub delta_scores: Vec<f64>,
    /// Parcels in the retained parcellation
    pub n_parcels: usize,
}

/// Outcome of evaluating one estimator variant
#[derive(Debug, Clone, Serialize)]
pub struct EstimatorReport {
    pub name: String,
    pub folds: Vec<FoldScore>,
    pub accuracy: AccuracySummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clustering: Option<ClusteringTrace>,
}

/// Univariate feature selector fitted on training rows only
pub trait Selector {
    /// Score features on `x`/`y` and fix the retained support
    ///
    /// # Errors
    /// Returns error if the selection cannot be computed
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[i64]) -> Result<()>;

    /// Keep the retained columns of `x`
    ///
    /// # Errors
    /// Returns error if not fitted or if `x` has the wrong width
    fn transform(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// Retained feature indices in ascending order, once fitted
    fn support(&self) -> Option<&[usize]>;
}

/// Anything that learns to predict condition codes
pub trait Classifier {
    /// # Errors
    /// Returns error if training fails
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[i64]) -> Result<()>;

    /// # Errors
    /// Returns error if not fitted or if `x` has the wrong width
    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Vec<i64>>;

    /// Fraction of correctly predicted samples
    ///
    /// # Errors
    /// Returns error if prediction fails or `y` is misaligned
    fn score(&self, x: ArrayView2<'_, f64>, y: &[i64]) -> Result<f64> {
        let predicted = self.predict(x)?;
        crate::ml::stats::accuracy(&predicted, y)
    }
}
