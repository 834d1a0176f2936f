//! Report rendering and output file writers

use crate::structs::{
    AccuracyNormalization, ClusteringTrace, DecodingData, EstimatorReport, Result,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

const NORMALIZATIONS: [AccuracyNormalization; 3] = [
    AccuracyNormalization::SumOverSamples,
    AccuracyNormalization::FoldMean,
    AccuracyNormalization::SampleWeighted,
];

/// Result lines of one estimator
///
/// The headline accuracy uses `normalization`; the other two
/// normalizations follow on their own line.
#[must_use]
pub fn format_report(report: &EstimatorReport, normalization: AccuracyNormalization) -> String {
    let mut out = String::new();
    let accuracy = &report.accuracy;

    let _ = writeln!(out, "=== {} ===", report.name.to_uppercase());
    let _ = writeln!(
        out,
        "Classification accuracy: {:.6}  / Chance level: {:.6}",
        accuracy.value(normalization),
        accuracy.chance_level
    );

    let others: Vec<String> = NORMALIZATIONS
        .iter()
        .filter(|&&n| n != normalization)
        .map(|&n| format!("{} {:.6}", n.display_name(), accuracy.value(n)))
        .collect();
    let _ = writeln!(out, "  ({})", others.join(", "));

    if let Some(trace) = &report.clustering {
        let _ = writeln!(out, "Number of parcellations : {}", trace.n_parcels);
    }
    out
}

/// Print every report to stdout
pub fn print_reports(reports: &[EstimatorReport], normalization: AccuracyNormalization) {
    for report in reports {
        print!("{}", format_report(report, normalization));
    }
}

/// Human-readable overview of a run
#[must_use]
pub fn build_summary(
    data: &DecodingData,
    reports: &[EstimatorReport],
    normalization: AccuracyNormalization,
) -> String {
    let mut out = String::from("Decoding summary\n================\n\n");
    let _ = writeln!(out, "Samples: {}", data.n_samples());
    let _ = writeln!(out, "Voxels: {}", data.n_features());
    let _ = writeln!(out, "Conditions: {:?}", data.conditions());
    let _ = writeln!(out, "Headline accuracy: {}\n", normalization.display_name());

    for report in reports {
        out.push_str(&format_report(report, normalization));
        for fold in &report.folds {
            let _ = writeln!(
                out,
                "  group {}: {:.4} on {} held-out samples",
                fold.group, fold.accuracy, fold.n_test
            );
        }
        out.push('\n');
    }
    out
}

/// Write `summary.txt` - human readable overview
///
/// # Errors
/// Returns error if file cannot be written
pub fn write_summary(output_dir: &Path, content: &str) -> Result<()> {
    let path = output_dir.join("summary.txt");
    fs::write(path, content)?;
    Ok(())
}

/// Write `scores.json` - per-estimator fold scores and accuracy summaries
///
/// # Errors
/// Returns error if file cannot be written
pub fn write_scores_json(
    output_dir: &Path,
    data: &DecodingData,
    reports: &[EstimatorReport],
    normalization: AccuracyNormalization,
) -> Result<()> {
    let path = output_dir.join("scores.json");

    let output = ScoresOutput {
        n_samples: data.n_samples(),
        n_features: data.n_features(),
        conditions: data.conditions(),
        normalization,
        estimators: reports
            .iter()
            .map(|report| EstimatorEntry {
                accuracy_reported: report.accuracy.value(normalization),
                report,
            })
            .collect(),
    };

    let json = serde_json::to_string_pretty(&output)?;
    fs::write(path, json)?;
    Ok(())
}

/// Write `clustering_scores.csv` - score and delta of every clustering iteration
///
/// # Errors
/// Returns error if file cannot be written
pub fn write_clustering_curve(output_dir: &Path, trace: &ClusteringTrace) -> Result<()> {
    let path = output_dir.join("clustering_scores.csv");
    let mut content = String::from("iteration,score,delta\n");

    for (iteration, score) in trace.scores.iter().enumerate() {
        // The initial parcellation has no predecessor
        let delta = iteration
            .checked_sub(1)
            .and_then(|i| trace.delta_scores.get(i))
            .map_or_else(String::new, |d| format!("{d:.6}"));
        let _ = writeln!(content, "{iteration},{score:.6},{delta}");
    }

    fs::write(path, content)?;
    Ok(())
}

// JSON output structures

#[derive(Serialize)]
struct ScoresOutput<'a> {
    n_samples: usize,
    n_features: usize,
    conditions: Vec<i64>,
    normalization: AccuracyNormalization,
    estimators: Vec<EstimatorEntry<'a>>,
}

#[derive(Serialize)]
struct EstimatorEntry<'a> {
    #[serde(flatten)]
    report: &'a EstimatorReport,
    accuracy_reported: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{AccuracySummary, FoldScore};
    use ndarray::Array2;
    use tempfile::TempDir;

    fn anova_report() -> EstimatorReport {
        EstimatorReport {
            name: "ANOVA".to_string(),
            folds: vec![
                FoldScore { group: 0, n_test: 12, accuracy: 1.0 },
                FoldScore { group: 1, n_test: 8, accuracy: 0.75 },
            ],
            accuracy: AccuracySummary {
                sum_over_samples: 0.9,
                fold_mean: 0.875,
                sample_weighted: 0.9,
                chance_level: 0.5,
                n_samples: 20,
                n_folds: 2,
            },
            clustering: None,
        }
    }

    fn data() -> DecodingData {
        let labels: Vec<i64> = (0..20).map(|i| 1 + i % 2).collect();
        let sessions: Vec<i64> = (0..20).map(|i| i / 10).collect();
        DecodingData::new(Array2::zeros((20, 3)), labels, sessions).expect("aligned")
    }

    #[test]
    fn test_format_report_headline() {
        let report = anova_report();

        let literal = format_report(&report, AccuracyNormalization::SumOverSamples);
        assert!(literal.starts_with("=== ANOVA ===\n"));
        assert!(literal.contains("Classification accuracy: 0.900000  / Chance level: 0.500000"));
        assert!(literal.contains("mean of fold scores 0.875000"));
        assert!(!literal.contains("Number of parcellations"));

        let mean = format_report(&report, AccuracyNormalization::FoldMean);
        assert!(mean.contains("Classification accuracy: 0.875000"));
        assert!(mean.contains("summed fold scores / n_samples 0.900000"));
    }

    #[test]
    fn test_format_report_parcels() {
        let mut report = anova_report();
        report.name = "Supervised clustering".to_string();
        report.clustering = Some(ClusteringTrace {
            scores: vec![0.5, 0.7],
            delta_scores: vec![0.2],
            n_parcels: 4,
        });

        let text = format_report(&report, AccuracyNormalization::SumOverSamples);
        assert!(text.starts_with("=== SUPERVISED CLUSTERING ===\n"));
        assert!(text.contains("Number of parcellations : 4"));
    }

    #[test]
    fn test_write_summary() {
        let dir = TempDir::new().expect("create temp dir");
        let summary = build_summary(&data(), &[anova_report()], AccuracyNormalization::FoldMean);
        write_summary(dir.path(), &summary).expect("write summary");

        let content = fs::read_to_string(dir.path().join("summary.txt")).expect("read");
        assert!(content.contains("Samples: 20"));
        assert!(content.contains("Conditions: [1, 2]"));
        assert!(content.contains("group 1: 0.7500 on 8 held-out samples"));
    }

    #[test]
    fn test_write_scores_json() {
        let dir = TempDir::new().expect("create temp dir");
        write_scores_json(dir.path(), &data(), &[anova_report()], AccuracyNormalization::FoldMean)
            .expect("write scores");

        let content = fs::read_to_string(dir.path().join("scores.json")).expect("read");
        let json: serde_json::Value = serde_json::from_str(&content).expect("parse");

        assert_eq!(json["normalization"], "fold-mean");
        assert_eq!(json["estimators"][0]["name"], "ANOVA");
        assert_eq!(json["estimators"][0]["folds"].as_array().map(Vec::len), Some(2));
        let reported = json["estimators"][0]["accuracy_reported"].as_f64().expect("number");
        assert!((reported - 0.875).abs() < 1e-12);
        assert!(json["estimators"][0].get("clustering").is_none());
    }

    #[test]
    fn test_write_clustering_curve() {
        let dir = TempDir::new().expect("create temp dir");
        let trace = ClusteringTrace {
            scores: vec![0.5, 0.75, 0.7],
            delta_scores: vec![0.25, -0.05],
            n_parcels: 2,
        };
        write_clustering_curve(dir.path(), &trace).expect("write curve");

        let content = fs::read_to_string(dir.path().join("clustering_scores.csv")).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "iteration,score,delta");
        assert_eq!(lines[1], "0,0.500000,");
        assert_eq!(lines[2], "1,0.750000,0.250000");
        assert_eq!(lines[3], "2,0.700000,-0.050000");
    }
}
