//! Univariate ANOVA feature selection (keep the K best F-scores)

use crate::ml::stats::f_classif;
use crate::structs::{DecodeError, Result, Selector};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::cmp::Ordering;

/// Keeps the `k` features with the highest ANOVA F-statistic
#[derive(Debug, Clone)]
pub struct AnovaSelector {
    k: usize,
    n_features_in: usize,
    support: Option<Vec<usize>>,
}

impl AnovaSelector {
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            n_features_in: 0,
            support: None,
        }
    }
}

/// Order feature indices best-first: higher score, NaN last, lower index on ties
fn rank_features(scores: &Array1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        let (sa, sb) = (scores[a], scores[b]);
        match (sa.is_nan(), sb.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => sb.partial_cmp(&sa).unwrap_or(Ordering::Equal),
        }
        .then(a.cmp(&b))
    });
    order
}

impl Selector for AnovaSelector {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[i64]) -> Result<()> {
        let n_features = x.ncols();
        if self.k == 0 {
            return Err(DecodeError::Config("feature selection needs k >= 1".into()));
        }
        if self.k > n_features {
            return Err(DecodeError::Config(format!(
                "requested k={} features but only {n_features} are available",
                self.k
            )));
        }

        let scores = f_classif(x, y)?;
        let mut support: Vec<usize> = rank_features(&scores).into_iter().take(self.k).collect();
        support.sort_unstable();

        self.n_features_in = n_features;
        self.support = Some(support);
        Ok(())
    }

    fn transform(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let support = self
            .support
            .as_ref()
            .ok_or_else(|| DecodeError::Ml("feature selector used before fit".into()))?;
        if x.ncols() != self.n_features_in {
            return Err(DecodeError::Ml(format!(
                "selector fitted on {} features, got {}",
                self.n_features_in,
                x.ncols()
            )));
        }
        Ok(x.select(Axis(1), support))
    }

    fn support(&self) -> Option<&[usize]> {
        self.support.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn informative() -> (Array2<f64>, Vec<i64>) {
        // Columns 1 and 3 carry the condition, 0 and 2 do not
        let x = array![
            [0.1, 1.0, 0.3, 2.0],
            [0.2, 1.1, -0.3, 2.1],
            [-0.1, 0.9, 0.2, 1.9],
            [0.0, -1.0, -0.2, -2.0],
            [0.1, -1.1, 0.1, -2.1],
            [-0.2, -0.9, -0.1, -1.9]
        ];
        (x, vec![1, 1, 1, 2, 2, 2])
    }

    #[test]
    fn test_selects_informative_features() {
        let (x, y) = informative();
        let mut selector = AnovaSelector::new(2);
        selector.fit(x.view(), &y).expect("fit");

        assert_eq!(selector.support(), Some(&[1, 3][..]));
        let reduced = selector.transform(x.view()).expect("transform");
        assert_eq!(reduced.ncols(), 2);
        assert!((reduced[[0, 1]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_k_too_large_is_config_error() {
        let (x, y) = informative();
        let mut selector = AnovaSelector::new(5);
        assert!(matches!(
            selector.fit(x.view(), &y),
            Err(DecodeError::Config(_))
        ));
    }

    #[test]
    fn test_transform_before_fit() {
        let (x, _) = informative();
        let selector = AnovaSelector::new(2);
        assert!(selector.transform(x.view()).is_err());
    }

    #[test]
    fn test_rank_puts_nan_last() {
        let scores = array![f64::NAN, 1.0, f64::INFINITY, 1.0];
        assert_eq!(rank_features(&scores), vec![2, 1, 3, 0]);
    }
}
