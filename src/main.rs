#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::uninlined_format_args)]

mod cache;
mod loader;
mod ml;
mod structs;
mod thread_pool;

use cache::DiskCache;
use clap::{Parser, Subcommand};
use loader::DataPaths;
use ml::clustering::ClusteringConfig;
use ml::features::PreprocessConfig;
use ml::pipeline::DecodeConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use structs::{AccuracyNormalization, DecodeError, EstimatorChoice, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Decode experimental conditions from fMRI voxel time series
#[derive(Parser, Debug)]
#[command(name = "voxel-decoder")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Logging verbosity: trace, debug, info, warn or error
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cross-validate the decoders and write the reports
    Decode {
        /// Directory holding the input files
        #[arg(long, default_value = ".")]
        data_dir: PathBuf,

        /// Attribute table (label session per volume), relative to the data dir
        #[arg(long, default_value = "attributes.txt")]
        attributes: PathBuf,

        /// 4-D functional image, relative to the data dir
        #[arg(long, default_value = "bold.nii.gz")]
        bold: PathBuf,

        /// 3-D brain mask, relative to the data dir
        #[arg(long, default_value = "mask.nii.gz")]
        mask: PathBuf,

        /// Output directory for reports
        #[arg(short, long, default_value = "./decoding_output")]
        output_dir: PathBuf,

        /// Estimator variants to evaluate
        #[arg(long, value_enum, default_value_t = EstimatorChoice::Both)]
        estimator: EstimatorChoice,

        /// Voxels kept by the ANOVA selector
        #[arg(short = 'k', long, default_value = "500")]
        k_features: usize,

        /// SVM regularization parameter
        #[arg(short = 'c', long, default_value = "1.0")]
        svm_c: f64,

        /// Consecutive sessions merged into one cross-validation group
        #[arg(long, default_value = "5")]
        sessions_per_fold: i64,

        /// Largest label treated as a task condition
        #[arg(long, default_value = "2", allow_negative_numbers = true)]
        max_label: i64,

        /// Rest/baseline label dropped before decoding
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        rest_label: i64,

        /// Fold workers for the ANOVA decoder (0 = one per core)
        #[arg(long, default_value = "0")]
        n_jobs: usize,

        /// Workers inside each supervised-clustering fit (0 = one per core)
        #[arg(long, default_value = "8")]
        clustering_jobs: usize,

        /// Maximum supervised-clustering iterations
        #[arg(long, default_value = "100")]
        iterations: usize,

        /// Inner folds used to score candidate parcellations
        #[arg(long, default_value = "3")]
        inner_folds: usize,

        /// Normalization reported as the classification accuracy
        #[arg(long, value_enum, default_value_t = AccuracyNormalization::SumOverSamples)]
        accuracy: AccuracyNormalization,

        /// Directory holding the memoization cache
        #[arg(long, default_value = ".")]
        cache_dir: PathBuf,

        /// Recompute everything without reading or writing the cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Remove every memoized entry
    ClearCache {
        /// Directory holding the memoization cache
        #[arg(long, default_value = ".")]
        cache_dir: PathBuf,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => {
            return Err(DecodeError::Config(format!("Unknown log level: {other}")));
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| DecodeError::Config(format!("Failed to install logger: {e}")))
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    match args.command {
        Some(Commands::Decode {
            data_dir,
            attributes,
            bold,
            mask,
            output_dir,
            estimator,
            k_features,
            svm_c,
            sessions_per_fold,
            max_label,
            rest_label,
            n_jobs,
            clustering_jobs,
            iterations,
            inner_folds,
            accuracy,
            cache_dir,
            no_cache,
        }) => {
            let paths = DataPaths::in_dir(&data_dir, &attributes, &bold, &mask);
            let config = DecodeConfig {
                k: k_features,
                svm_c,
                sessions_per_fold,
                preprocess: PreprocessConfig {
                    max_label,
                    rest_label,
                },
                n_jobs,
                clustering: ClusteringConfig {
                    n_iterations: iterations,
                    n_jobs: clustering_jobs,
                    inner_folds,
                    svm_c,
                },
                estimator,
                accuracy,
            };
            let cache_dir = (!no_cache).then_some(cache_dir);
            run_decode(&paths, &output_dir, &config, cache_dir.as_deref())
        }

        Some(Commands::ClearCache { cache_dir }) => {
            let cache = DiskCache::open(&cache_dir)?;
            let removed = cache.clear()?;
            eprintln!(
                "Removed {removed} cache entries from {}",
                cache.root().display()
            );
            Ok(())
        }

        None => {
            eprintln!(
                "No subcommand provided. Use 'voxel-decoder decode' or 'voxel-decoder clear-cache'."
            );
            eprintln!("Run 'voxel-decoder --help' for usage information.");
            std::process::exit(1);
        }
    }
}

/// Run the decoding analysis
fn run_decode(
    paths: &DataPaths,
    output_dir: &Path,
    config: &DecodeConfig,
    cache_dir: Option<&Path>,
) -> Result<()> {
    config.validate()?;

    let cache = cache_dir.map(DiskCache::open).transpose()?;
    let prepared = ml::pipeline::prepare(paths, &config.preprocess, cache.as_ref())?;

    let graph = if config.estimator.runs_clustering() {
        Some(Arc::new(prepared.connectivity()?))
    } else {
        None
    };

    let reports = ml::pipeline::run_decoding(&prepared.data, graph, config)?;
    ml::output::print_reports(&reports, config.accuracy);

    std::fs::create_dir_all(output_dir)?;
    let summary = ml::output::build_summary(&prepared.data, &reports, config.accuracy);
    ml::output::write_summary(output_dir, &summary)?;
    ml::output::write_scores_json(output_dir, &prepared.data, &reports, config.accuracy)?;

    let mut written = vec!["summary.txt", "scores.json"];
    if let Some(trace) = reports.iter().find_map(|r| r.clustering.as_ref()) {
        ml::output::write_clustering_curve(output_dir, trace)?;
        written.push("clustering_scores.csv");
    }

    info!("Output written to {}", output_dir.display());
    for file in written {
        info!("  - {file}");
    }
    Ok(())
}
