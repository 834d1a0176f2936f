//! Decoding run that orchestrates loading, preprocessing and both estimators

use crate::cache::{CacheKey, DiskCache};
use crate::loader::{load_inputs, load_mask, DataPaths};
use crate::ml::clustering::{ClusteringConfig, SupervisedClustering};
use crate::ml::connectivity::{grid_to_graph, VoxelGraph};
use crate::ml::cross_val::{cross_val_score, LeaveOneGroupOut};
use crate::ml::estimator::anova_svc;
use crate::ml::features::PreprocessConfig;
use crate::structs::{
    AccuracyNormalization, AccuracySummary, Classifier, DecodeError, DecodingData,
    EstimatorChoice, EstimatorReport, FoldScore, Result,
};
use ndarray::Array3;
use std::sync::Arc;
use tracing::info;

pub const ANOVA_NAME: &str = "ANOVA";
pub const CLUSTERING_NAME: &str = "Supervised clustering";

/// Configuration for a decoding run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeConfig {
    /// Features kept by the ANOVA selector
    pub k: usize,
    pub svm_c: f64,
    /// Consecutive sessions merged into one cross-validation group
    pub sessions_per_fold: i64,
    pub preprocess: PreprocessConfig,
    /// Fold workers of the ANOVA evaluation (0 = one per core)
    pub n_jobs: usize,
    pub clustering: ClusteringConfig,
    pub estimator: EstimatorChoice,
    pub accuracy: AccuracyNormalization,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            k: 500,
            svm_c: 1.0,
            sessions_per_fold: 5,
            preprocess: PreprocessConfig::default(),
            n_jobs: 0,
            clustering: ClusteringConfig::default(),
            estimator: EstimatorChoice::default(),
            accuracy: AccuracyNormalization::default(),
        }
    }
}

impl DecodeConfig {
    /// Check every setting that does not depend on the data
    ///
    /// # Errors
    /// Returns `Config` error naming the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DecodeError::Config("k must be at least 1".into()));
        }
        if self.svm_c.is_nan() || self.svm_c <= 0.0 || self.clustering.svm_c <= 0.0 {
            return Err(DecodeError::Config(format!(
                "SVM regularization must be positive, got {}",
                self.svm_c
            )));
        }
        if self.sessions_per_fold <= 0 {
            return Err(DecodeError::Config(format!(
                "sessions per fold must be positive, got {}",
                self.sessions_per_fold
            )));
        }
        if self.clustering.n_iterations == 0 {
            return Err(DecodeError::Config("clustering needs at least 1 iteration".into()));
        }
        if self.clustering.inner_folds < 2 {
            return Err(DecodeError::Config(format!(
                "clustering needs at least 2 inner folds, got {}",
                self.clustering.inner_folds
            )));
        }
        Ok(())
    }
}

/// Preprocessed data plus the mask it was extracted with
#[derive(Debug, Clone)]
pub struct PreparedInputs {
    pub data: DecodingData,
    pub mask: Array3<f64>,
}

impl PreparedInputs {
    /// Voxel adjacency graph of the masked grid
    ///
    /// # Errors
    /// Returns error if the mask does not match the design matrix
    pub fn connectivity(&self) -> Result<VoxelGraph> {
        let (nx, ny, nz) = self.mask.dim();
        let graph = grid_to_graph(nx, ny, nz, &self.mask)?;
        if graph.n_nodes() != self.data.n_features() {
            return Err(DecodeError::Load(format!(
                "mask selects {} voxels but the design matrix has {} columns",
                graph.n_nodes(),
                self.data.n_features()
            )));
        }
        info!(
            "Connectivity graph: {} voxels, {} edges",
            graph.n_nodes(),
            graph.n_edges()
        );
        Ok(graph)
    }
}

/// Cache key of the load+preprocess step
///
/// # Errors
/// Returns error if an input file cannot be read
pub fn preprocess_key(paths: &DataPaths, preprocess: &PreprocessConfig) -> Result<CacheKey> {
    Ok(CacheKey::new("load_and_preprocess")
        .file("attributes", &paths.attributes)?
        .file("bold", &paths.bold)?
        .file("mask", &paths.mask)?
        .arg("max_label", &preprocess.max_label)
        .arg("rest_label", &preprocess.rest_label))
}

/// Load the inputs and build the design matrix, memoized when `cache` is given
///
/// # Errors
/// Returns `Load` error for missing or inconsistent inputs and `Config`
/// error for an empty mask or an empty condition filter
pub fn prepare(
    paths: &DataPaths,
    preprocess: &PreprocessConfig,
    cache: Option<&DiskCache>,
) -> Result<PreparedInputs> {
    paths.check_exist()?;

    let compute = || {
        let raw = load_inputs(paths)?;
        DecodingData::from_volume(&raw.volume, &raw.mask, &raw.attributes, preprocess)
    };
    let data = match cache {
        Some(cache) => cache.get_or_compute(&preprocess_key(paths, preprocess)?, compute)?,
        None => compute()?,
    };
    let mask = load_mask(&paths.mask)?;

    info!(
        "Design matrix: {} samples x {} voxels, {} conditions",
        data.n_samples(),
        data.n_features(),
        data.n_conditions()
    );
    Ok(PreparedInputs { data, mask })
}

fn report(name: &str, data: &DecodingData, folds: Vec<FoldScore>) -> EstimatorReport {
    let accuracy = AccuracySummary::from_folds(&folds, data.n_samples(), data.chance_level());
    EstimatorReport {
        name: name.to_string(),
        folds,
        accuracy,
        clustering: None,
    }
}

/// Cross-validate every selected estimator variant
///
/// The ANOVA pipeline runs its folds on `n_jobs` workers. The clustering
/// estimator runs its folds one at a time (each fit is parallel inside)
/// and is then fitted once on all samples to report its iteration trace.
///
/// # Errors
/// Returns `Config` error for invalid settings, `Fold` error if any fold fails
pub fn run_decoding(
    data: &DecodingData,
    graph: Option<Arc<VoxelGraph>>,
    config: &DecodeConfig,
) -> Result<Vec<EstimatorReport>> {
    config.validate()?;
    let cv = LeaveOneGroupOut::from_sessions(&data.sessions, config.sessions_per_fold)?;
    info!(
        "{} samples in {} cross-validation groups",
        data.n_samples(),
        cv.n_splits()
    );

    let mut reports = Vec::new();

    if config.estimator.runs_anova() {
        if config.k > data.n_features() {
            return Err(DecodeError::Config(format!(
                "k = {} exceeds the {} available features",
                config.k,
                data.n_features()
            )));
        }
        info!("Evaluating {ANOVA_NAME} (k = {}, C = {})", config.k, config.svm_c);
        let make = || anova_svc(config.k, config.svm_c);
        let folds = cross_val_score(make, data, &cv, config.n_jobs)?;
        reports.push(report(ANOVA_NAME, data, folds));
    }

    if config.estimator.runs_clustering() {
        let graph = graph.ok_or_else(|| {
            DecodeError::Config("supervised clustering needs a connectivity graph".into())
        })?;
        if graph.n_nodes() != data.n_features() {
            return Err(DecodeError::Config(format!(
                "connectivity graph has {} nodes but data has {} features",
                graph.n_nodes(),
                data.n_features()
            )));
        }

        info!(
            "Evaluating {CLUSTERING_NAME} ({} iterations, {} workers)",
            config.clustering.n_iterations, config.clustering.n_jobs
        );
        let make = || SupervisedClustering::new(Arc::clone(&graph), config.clustering);
        let folds = cross_val_score(make, data, &cv, 1)?;

        let mut full = make();
        full.fit(data.view(), &data.labels)?;
        let mut clustering_report = report(CLUSTERING_NAME, data, folds);
        clustering_report.clustering = full.trace();
        reports.push(clustering_report);
    }

    Ok(reports)
}
