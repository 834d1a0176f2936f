use crate::structs::{AccuracySummary, DecodeError, FoldScore, Result};
use ndarray::{Array1, ArrayView2, ArrayViewMut2, Axis};
use std::collections::BTreeMap;

/// Remove the least-squares linear trend from every column, in place
///
/// Rows are consecutive time points. A single row detrends to zero.
#[allow(clippy::cast_precision_loss)]
pub fn detrend_linear(mut block: ArrayViewMut2<'_, f64>) {
    let n = block.nrows();
    if n == 0 {
        return;
    }

    let t_mean = (n - 1) as f64 / 2.0;
    let t_centered: Array1<f64> = (0..n).map(|t| t as f64 - t_mean).collect();
    let s_tt = t_centered.dot(&t_centered);

    for mut column in block.axis_iter_mut(Axis(1)) {
        let mean = column.sum() / n as f64;
        let slope = if s_tt > 0.0 {
            t_centered
                .iter()
                .zip(column.iter())
                .map(|(t, v)| t * (v - mean))
                .sum::<f64>()
                / s_tt
        } else {
            0.0
        };
        for (value, t) in column.iter_mut().zip(t_centered.iter()) {
            *value -= mean + slope * t;
        }
    }
}

/// ANOVA F-statistic of every column across the label groups
///
/// `F = (SSB / (k - 1)) / (SSW / (n - k))`. Columns with no within-group
/// variance score `+inf` when the group means differ and `NaN` when the
/// column is constant.
///
/// # Errors
/// Returns error if `y` is misaligned, there are fewer than two groups,
/// or there are no more samples than groups
#[allow(clippy::cast_precision_loss)]
pub fn f_classif(x: ArrayView2<'_, f64>, y: &[i64]) -> Result<Array1<f64>> {
    if x.nrows() != y.len() {
        return Err(DecodeError::Ml(format!(
            "F-test got {} rows but {} labels",
            x.nrows(),
            y.len()
        )));
    }

    let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (row, &label) in y.iter().enumerate() {
        groups.entry(label).or_default().push(row);
    }

    let n = y.len();
    let k = groups.len();
    if k < 2 {
        return Err(DecodeError::Ml(format!(
            "F-test needs at least 2 conditions, got {k}"
        )));
    }
    if n <= k {
        return Err(DecodeError::Ml(format!(
            "F-test needs more samples than conditions ({n} samples, {k} conditions)"
        )));
    }

    let grand_mean = x
        .mean_axis(Axis(0))
        .ok_or_else(|| DecodeError::Ml("F-test on empty data".into()))?;

    let mut ssb = Array1::<f64>::zeros(x.ncols());
    let mut ssw = Array1::<f64>::zeros(x.ncols());

    for rows in groups.values() {
        let group = x.select(Axis(0), rows);
        let group_mean = group
            .mean_axis(Axis(0))
            .ok_or_else(|| DecodeError::Ml("F-test on empty group".into()))?;

        let diff = &group_mean - &grand_mean;
        ssb = ssb + diff.mapv(|d| d * d) * rows.len() as f64;

        let centered = &group - &group_mean;
        ssw = ssw + centered.mapv(|d| d * d).sum_axis(Axis(0));
    }

    let df_between = (k - 1) as f64;
    let df_within = (n - k) as f64;

    Ok(ssb
        .iter()
        .zip(ssw.iter())
        .map(|(&b, &w)| (b / df_between) / (w / df_within))
        .collect())
}

/// Fraction of positions where `predicted` matches `truth`
///
/// # Errors
/// Returns error on length mismatch or empty input
#[allow(clippy::cast_precision_loss)]
pub fn accuracy(predicted: &[i64], truth: &[i64]) -> Result<f64> {
    if predicted.len() != truth.len() {
        return Err(DecodeError::Ml(format!(
            "{} predictions for {} labels",
            predicted.len(),
            truth.len()
        )));
    }
    if truth.is_empty() {
        return Err(DecodeError::Ml("Cannot score an empty sample set".into()));
    }

    let correct = predicted
        .iter()
        .zip(truth.iter())
        .filter(|(p, t)| p == t)
        .count();
    Ok(correct as f64 / truth.len() as f64)
}

impl AccuracySummary {
    /// Collapse fold scores every supported way
    ///
    /// `sum_over_samples` scores each fold by its count of correct
    /// predictions (`n_test * accuracy`) and divides the sum by the total
    /// sample count. With folds covering every sample it equals
    /// `sample_weighted`; `fold_mean` ignores fold sizes.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_folds(folds: &[FoldScore], n_samples: usize, chance_level: f64) -> Self {
        let sum: f64 = folds.iter().map(|f| f.accuracy).sum();
        let held_out: usize = folds.iter().map(|f| f.n_test).sum();
        let correct: f64 = folds.iter().map(|f| f.accuracy * f.n_test as f64).sum();

        let ratio = |num: f64, den: usize| if den == 0 { 0.0 } else { num / den as f64 };

        Self {
            sum_over_samples: ratio(correct, n_samples),
            fold_mean: ratio(sum, folds.len()),
            sample_weighted: ratio(correct, held_out),
            chance_level,
            n_samples,
            n_folds: folds.len(),
        }
    }
}
