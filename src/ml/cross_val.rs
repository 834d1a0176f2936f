//! Leave-one-group-out cross-validation

use crate::structs::{Classifier, DecodeError, DecodingData, Fold, FoldScore, Result};
use crate::thread_pool;
use ndarray::{ArrayView2, Axis};
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::info;

/// Holds out each distinct group once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOneGroupOut {
    groups: Vec<i64>,
}

impl LeaveOneGroupOut {
    #[must_use]
    pub fn new(groups: Vec<i64>) -> Self {
        Self { groups }
    }

    /// Group consecutive session ids: `group = session div sessions_per_fold`
    ///
    /// # Errors
    /// Returns `Config` error if `sessions_per_fold` is not positive
    pub fn from_sessions(sessions: &[i64], sessions_per_fold: i64) -> Result<Self> {
        if sessions_per_fold <= 0 {
            return Err(DecodeError::Config(format!(
                "sessions per fold must be positive, got {sessions_per_fold}"
            )));
        }
        Ok(Self::new(
            sessions
                .iter()
                .map(|s| s.div_euclid(sessions_per_fold))
                .collect(),
        ))
    }

    /// Group id of every sample
    #[must_use]
    pub fn groups(&self) -> &[i64] {
        &self.groups
    }

    #[must_use]
    pub fn distinct_groups(&self) -> Vec<i64> {
        let set: BTreeSet<i64> = self.groups.iter().copied().collect();
        set.into_iter().collect()
    }

    #[must_use]
    pub fn n_splits(&self) -> usize {
        self.distinct_groups().len()
    }

    /// One fold per distinct group, in ascending group order
    ///
    /// # Errors
    /// Returns `Config` error with fewer than two groups
    pub fn split(&self) -> Result<Vec<Fold>> {
        let distinct = self.distinct_groups();
        if distinct.len() < 2 {
            return Err(DecodeError::Config(format!(
                "leave-one-group-out needs at least 2 groups, got {}",
                distinct.len()
            )));
        }

        Ok(distinct
            .into_iter()
            .map(|group| {
                let (test, train): (Vec<usize>, Vec<usize>) =
                    (0..self.groups.len()).partition(|&i| self.groups[i] == group);
                Fold { group, train, test }
            })
            .collect())
    }
}

/// Fit a fresh estimator on the fold's training rows and score the held-out rows
///
/// The estimator only ever receives copies of the training rows.
///
/// # Errors
/// Returns error if fitting or scoring fails
pub fn fit_fold<C, F>(
    make: &F,
    x: ArrayView2<'_, f64>,
    y: &[i64],
    fold: &Fold,
) -> Result<(C, FoldScore)>
where
    C: Classifier,
    F: Fn() -> C,
{
    let x_train = x.select(Axis(0), &fold.train);
    let y_train: Vec<i64> = fold.train.iter().map(|&i| y[i]).collect();
    let x_test = x.select(Axis(0), &fold.test);
    let y_test: Vec<i64> = fold.test.iter().map(|&i| y[i]).collect();

    let mut estimator = make();
    estimator.fit(x_train.view(), &y_train)?;
    let accuracy = estimator.score(x_test.view(), &y_test)?;

    Ok((
        estimator,
        FoldScore {
            group: fold.group,
            n_test: fold.test.len(),
            accuracy,
        },
    ))
}

/// Configuration mistakes stay configuration errors; anything else is a fold failure
fn fold_error(group: i64, err: DecodeError) -> DecodeError {
    match err {
        DecodeError::Config(_) | DecodeError::Fold { .. } => err,
        other => DecodeError::Fold {
            group,
            message: other.to_string(),
        },
    }
}

/// Score one fresh estimator per fold on a pool of `n_jobs` workers
///
/// Scores come back in ascending group order. The first failing fold
/// aborts the whole evaluation.
///
/// # Errors
/// Returns `Config` error for a misaligned or single-group split and
/// `Fold` error if any fold fails
pub fn cross_val_score<C, F>(
    make: F,
    data: &DecodingData,
    cv: &LeaveOneGroupOut,
    n_jobs: usize,
) -> Result<Vec<FoldScore>>
where
    C: Classifier,
    F: Fn() -> C + Sync,
{
    if cv.groups().len() != data.n_samples() {
        return Err(DecodeError::Config(format!(
            "{} group ids for {} samples",
            cv.groups().len(),
            data.n_samples()
        )));
    }

    let folds = cv.split()?;
    let x = data.view();
    let labels = data.labels.as_slice();

    info!("Cross-validating {} folds on {} workers", folds.len(), n_jobs);

    thread_pool::install(n_jobs, || {
        folds
            .par_iter()
            .map(|fold| {
                let (_, score) =
                    fit_fold(&make, x, labels, fold).map_err(|e| fold_error(fold.group, e))?;
                info!(
                    "Fold {}: accuracy {:.4} on {} held-out samples",
                    score.group, score.accuracy, score.n_test
                );
                Ok(score)
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::estimator::anova_svc;
    use crate::ml::selection::AnovaSelector;
    use crate::structs::Selector;
    use ndarray::Array2;

    struct Failing;

    impl Classifier for Failing {
        fn fit(&mut self, _x: ArrayView2<'_, f64>, _y: &[i64]) -> Result<()> {
            Err(DecodeError::Ml("did not converge".into()))
        }

        fn predict(&self, _x: ArrayView2<'_, f64>) -> Result<Vec<i64>> {
            Ok(Vec::new())
        }
    }

    fn data() -> DecodingData {
        let labels: Vec<i64> = (0..24).map(|i| if i % 2 == 0 { 1 } else { 2 }).collect();
        let sessions: Vec<i64> = (0..24).map(|i| i / 8).collect();
        let x = Array2::from_shape_fn((24, 8), |(i, j)| {
            let noise = ((i * 5 + j * 3) % 7) as f64 * 0.1;
            match j {
                0 | 1 => if labels[i] == 1 { 1.5 + noise } else { -1.5 - noise },
                _ => noise,
            }
        });
        DecodingData::new(x, labels, sessions).expect("aligned")
    }

    #[test]
    fn test_folds_are_disjoint_cover() {
        let cv = LeaveOneGroupOut::new(vec![2, 0, 1, 0, 2, 1, 1]);
        let folds = cv.split().expect("split");

        assert_eq!(folds.iter().map(|f| f.group).collect::<Vec<_>>(), vec![0, 1, 2]);

        let mut seen = vec![0usize; 7];
        for fold in &folds {
            for &i in &fold.test {
                seen[i] += 1;
            }
            assert_eq!(fold.train.len() + fold.test.len(), 7);
            assert!(fold.train.iter().all(|i| !fold.test.contains(i)));
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_sessions_per_fold() {
        let sessions: Vec<i64> = (0..10).collect();
        let cv = LeaveOneGroupOut::from_sessions(&sessions, 5).expect("cv");
        assert_eq!(cv.n_splits(), 2);
        assert_eq!(cv.groups()[4], 0);
        assert_eq!(cv.groups()[5], 1);

        assert!(LeaveOneGroupOut::from_sessions(&sessions, 0).is_err());
    }

    #[test]
    fn test_single_group_is_config_error() {
        let cv = LeaveOneGroupOut::new(vec![3, 3, 3]);
        assert!(matches!(cv.split(), Err(DecodeError::Config(_))));
    }

    #[test]
    fn test_selection_ignores_held_out_rows() {
        let data = data();
        let cv = LeaveOneGroupOut::from_sessions(&data.sessions, 1).expect("cv");
        let folds = cv.split().expect("split");
        let make = || anova_svc(2, 1.0);

        for fold in &folds {
            let (fitted, _) = fit_fold(&make, data.view(), &data.labels, fold).expect("fold");

            // Scramble the held-out rows: the fitted selection must not move
            let mut perturbed = data.x.clone();
            for &i in &fold.test {
                perturbed.row_mut(i).fill(1.0e6 * (i as f64 + 1.0));
            }
            let (refitted, _) =
                fit_fold(&make, perturbed.view(), &data.labels, fold).expect("fold");

            assert_eq!(fitted.selector.support(), refitted.selector.support());
        }
    }

    #[test]
    fn test_fold_selection_matches_training_rows_alone() {
        let data = data();
        let cv = LeaveOneGroupOut::from_sessions(&data.sessions, 1).expect("cv");

        for fold in &cv.split().expect("split") {
            let (fitted, _) =
                fit_fold(&|| anova_svc(3, 1.0), data.view(), &data.labels, fold).expect("fold");

            let x_train = data.x.select(Axis(0), &fold.train);
            let y_train: Vec<i64> = fold.train.iter().map(|&i| data.labels[i]).collect();
            let mut selector = AnovaSelector::new(3);
            selector.fit(x_train.view(), &y_train).expect("fit");

            assert_eq!(fitted.selector.support(), selector.support());
        }
    }

    #[test]
    fn test_cross_val_score_order_and_count() {
        let data = data();
        let cv = LeaveOneGroupOut::from_sessions(&data.sessions, 1).expect("cv");
        let scores = cross_val_score(|| anova_svc(2, 1.0), &data, &cv, 0).expect("cv");

        assert_eq!(scores.len(), 3);
        assert_eq!(scores.iter().map(|s| s.group).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(scores.iter().all(|s| s.n_test == 8));
        assert!(scores.iter().all(|s| s.accuracy > 0.9));
    }

    #[test]
    fn test_failing_fold_aborts() {
        let data = data();
        let cv = LeaveOneGroupOut::from_sessions(&data.sessions, 1).expect("cv");
        let result = cross_val_score(|| Failing, &data, &cv, 2);
        assert!(matches!(result, Err(DecodeError::Fold { .. })));
    }

    #[test]
    fn test_config_error_passes_through() {
        let data = data();
        let cv = LeaveOneGroupOut::from_sessions(&data.sessions, 1).expect("cv");
        let result = cross_val_score(|| anova_svc(100, 1.0), &data, &cv, 1);
        assert!(matches!(result, Err(DecodeError::Config(_))));
    }
}
