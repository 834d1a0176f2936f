//! Two-stage estimator: feature selection followed by classification

use crate::ml::selection::AnovaSelector;
use crate::ml::svm::LinearSvc;
use crate::structs::{Classifier, DecodeError, Result, Selector};
use ndarray::ArrayView2;
use tracing::debug;

/// A `Selector` feeding a `Classifier`
///
/// Both stages are fitted on the same training rows; prediction projects
/// through the fitted selector, so nothing about the selection is ever
/// learned from scored data.
pub struct Pipeline<S, C> {
    pub selector: S,
    pub classifier: C,
}

impl<S: Selector, C: Classifier> Pipeline<S, C> {
    pub fn new(selector: S, classifier: C) -> Self {
        Self {
            selector,
            classifier,
        }
    }
}

impl<S: Selector, C: Classifier> Classifier for Pipeline<S, C> {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[i64]) -> Result<()> {
        if x.nrows() != y.len() {
            return Err(DecodeError::Ml(format!(
                "pipeline got {} rows but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        self.selector.fit(x, y)?;
        if let Some(support) = self.selector.support() {
            debug!("Selected {} of {} features", support.len(), x.ncols());
        }
        let reduced = self.selector.transform(x)?;
        self.classifier.fit(reduced.view(), y)
    }

    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Vec<i64>> {
        let reduced = self.selector.transform(x)?;
        self.classifier.predict(reduced.view())
    }
}

/// ANOVA top-`k` selection feeding a linear SVM with regularization `c`
#[must_use]
pub fn anova_svc(k: usize, c: f64) -> Pipeline<AnovaSelector, LinearSvc> {
    Pipeline::new(AnovaSelector::new(k), LinearSvc::new(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn data() -> (Array2<f64>, Vec<i64>) {
        // 12 samples, 6 features, feature 4 carries the condition
        let y: Vec<i64> = (0..12).map(|i| if i % 2 == 0 { 1 } else { 2 }).collect();
        let x = Array2::from_shape_fn((12, 6), |(i, j)| {
            let noise = ((i * 7 + j * 13) % 11) as f64 * 0.05;
            if j == 4 {
                if y[i] == 1 { 2.0 + noise } else { -2.0 - noise }
            } else {
                noise
            }
        });
        (x, y)
    }

    #[test]
    fn test_pipeline_fit_score() {
        let (x, y) = data();
        let mut pipeline = anova_svc(2, 1.0);
        pipeline.fit(x.view(), &y).expect("fit");

        let support = pipeline.selector.support().expect("fitted");
        assert!(support.contains(&4));
        assert!((pipeline.score(x.view(), &y).expect("score") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pipeline_rejects_large_k() {
        let (x, y) = data();
        let mut pipeline = anova_svc(7, 1.0);
        assert!(matches!(
            pipeline.fit(x.view(), &y),
            Err(DecodeError::Config(_))
        ));
    }
}
