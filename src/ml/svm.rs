//! Linear-kernel SVM classifier, one-vs-one over condition codes

use crate::structs::{Classifier, DecodeError, Result};
use linfa::traits::{Fit, Predict};
use linfa::Dataset;
use linfa_svm::Svm;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::collections::BTreeSet;

/// Binary machine separating `positive` from `negative`
struct PairwiseMachine {
    positive: i64,
    negative: i64,
    model: Svm<f64, bool>,
}

/// Maximum-margin linear classifier
///
/// Two conditions train a single machine; more train one machine per pair
/// and predict by majority vote, ties going to the smaller condition code.
pub struct LinearSvc {
    c: f64,
    n_features_in: usize,
    classes: Vec<i64>,
    machines: Vec<PairwiseMachine>,
}

impl LinearSvc {
    #[must_use]
    pub fn new(c: f64) -> Self {
        Self {
            c,
            n_features_in: 0,
            classes: Vec::new(),
            machines: Vec::new(),
        }
    }

    /// Linear weights, one row per pairwise machine
    ///
    /// # Errors
    /// Returns error if called before fit
    pub fn coefficients(&self) -> Result<Array2<f64>> {
        if self.machines.is_empty() {
            return Err(DecodeError::Ml("SVM coefficients requested before fit".into()));
        }

        let mut coef = Array2::<f64>::zeros((self.machines.len(), self.n_features_in));
        for (machine, mut row) in self.machines.iter().zip(coef.axis_iter_mut(Axis(0))) {
            for (j, weight) in row.iter_mut().enumerate() {
                let mut unit = Array1::<f64>::zeros(self.n_features_in);
                unit[j] = 1.0;
                *weight = machine.model.weighted_sum(&unit);
            }
        }
        Ok(coef)
    }

    fn class_index(&self, class: i64) -> Result<usize> {
        self.classes
            .binary_search(&class)
            .map_err(|_| DecodeError::Ml(format!("unknown condition {class}")))
    }

    fn fit_pair(
        &self,
        x: ArrayView2<'_, f64>,
        y: &[i64],
        positive: i64,
        negative: i64,
    ) -> Result<PairwiseMachine> {
        let rows: Vec<usize> = y
            .iter()
            .enumerate()
            .filter(|(_, &label)| label == positive || label == negative)
            .map(|(i, _)| i)
            .collect();

        let records = x.select(Axis(0), &rows);
        let targets: Array1<bool> = rows.iter().map(|&i| y[i] == positive).collect();
        let dataset = Dataset::new(records, targets);

        let model = Svm::<f64, bool>::params()
            .pos_neg_weights(self.c, self.c)
            .linear_kernel()
            .fit(&dataset)
            .map_err(|e| {
                DecodeError::Ml(format!("SVM fit failed ({positive} vs {negative}): {e}"))
            })?;

        Ok(PairwiseMachine {
            positive,
            negative,
            model,
        })
    }
}

impl Classifier for LinearSvc {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[i64]) -> Result<()> {
        if x.nrows() != y.len() {
            return Err(DecodeError::Ml(format!(
                "SVM got {} rows but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        if self.c <= 0.0 {
            return Err(DecodeError::Config(format!(
                "SVM regularization C must be positive, got {}",
                self.c
            )));
        }

        let classes: Vec<i64> = y.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if classes.len() < 2 {
            return Err(DecodeError::Ml(format!(
                "SVM needs at least 2 conditions in training data, got {}",
                classes.len()
            )));
        }

        let mut machines = Vec::with_capacity(classes.len() * (classes.len() - 1) / 2);
        for (i, &positive) in classes.iter().enumerate() {
            for &negative in &classes[i + 1..] {
                machines.push(self.fit_pair(x, y, positive, negative)?);
            }
        }

        self.n_features_in = x.ncols();
        self.classes = classes;
        self.machines = machines;
        Ok(())
    }

    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Vec<i64>> {
        if self.machines.is_empty() {
            return Err(DecodeError::Ml("SVM used before fit".into()));
        }
        if x.ncols() != self.n_features_in {
            return Err(DecodeError::Ml(format!(
                "SVM fitted on {} features, got {}",
                self.n_features_in,
                x.ncols()
            )));
        }

        let records = x.to_owned();
        let mut votes = Array2::<usize>::zeros((x.nrows(), self.classes.len()));

        for machine in &self.machines {
            let decisions: Array1<bool> = machine.model.predict(&records);
            let pos = self.class_index(machine.positive)?;
            let neg = self.class_index(machine.negative)?;
            for (row, &is_positive) in decisions.iter().enumerate() {
                votes[[row, if is_positive { pos } else { neg }]] += 1;
            }
        }

        Ok(votes
            .axis_iter(Axis(0))
            .map(|row| {
                let mut best = 0;
                for (idx, &count) in row.iter().enumerate() {
                    if count > row[best] {
                        best = idx;
                    }
                }
                self.classes[best]
            })
            .collect())
    }
}
