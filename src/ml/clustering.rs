//! Supervised clustering of voxels into parcels
//!
//! Voxels are first agglomerated bottom-up into a Ward tree whose merges are
//! restricted to spatial neighbours. The tree is then explored top-down: at
//! each iteration the parcel whose split most improves the inner
//! cross-validated accuracy is split into its two children. The best
//! parcellation seen is kept and a linear SVM is trained on parcel means.

use crate::ml::connectivity::VoxelGraph;
use crate::ml::svm::LinearSvc;
use crate::structs::{Classifier, ClusteringTrace, DecodeError, Fold, Result};
use crate::thread_pool;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Settings of the supervised-clustering estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusteringConfig {
    /// Maximum number of top-down splits
    pub n_iterations: usize,
    /// Workers scoring candidate splits (0 = one per core)
    pub n_jobs: usize,
    /// Stratified folds of the inner scoring loop
    pub inner_folds: usize,
    /// Regularization of the parcel-level SVM
    pub svm_c: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            n_iterations: 100,
            n_jobs: 8,
            inner_folds: 3,
            svm_c: 1.0,
        }
    }
}

// ============================================================================
// Ward tree
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct MergeCandidate {
    cost: f64,
    a: usize,
    b: usize,
}

impl PartialEq for MergeCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeCandidate {}

impl PartialOrd for MergeCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| self.a.cmp(&other.a))
            .then_with(|| self.b.cmp(&other.b))
    }
}

/// Increase of within-cluster variance caused by merging two clusters
#[allow(clippy::cast_precision_loss)]
fn ward_cost(sum_a: &Array1<f64>, n_a: usize, sum_b: &Array1<f64>, n_b: usize) -> f64 {
    let (na, nb) = (n_a as f64, n_b as f64);
    let dist: f64 = sum_a
        .iter()
        .zip(sum_b.iter())
        .map(|(a, b)| {
            let d = a / na - b / nb;
            d * d
        })
        .sum();
    na * nb / (na + nb) * dist
}

/// Binary agglomeration tree over voxels
///
/// Nodes `0..n_leaves` are voxels; every later node merges two earlier ones.
/// Disconnected parts of the graph stay separate trees.
#[derive(Debug, Clone)]
pub struct WardTree {
    children: Vec<Option<(usize, usize)>>,
    roots: Vec<usize>,
}

impl WardTree {
    /// Agglomerate the columns of `x`, merging only graph neighbours
    ///
    /// # Errors
    /// Returns `Config` error if the graph and `x` disagree on the voxel count
    pub fn build(x: ArrayView2<'_, f64>, graph: &VoxelGraph) -> Result<Self> {
        let p = x.ncols();
        if graph.n_nodes() != p {
            return Err(DecodeError::Config(format!(
                "connectivity graph has {} nodes but data has {p} features",
                graph.n_nodes()
            )));
        }

        let mut sums: Vec<Option<Array1<f64>>> =
            x.axis_iter(Axis(1)).map(|c| Some(c.to_owned())).collect();
        let mut sizes = vec![1usize; p];
        let mut children: Vec<Option<(usize, usize)>> = vec![None; p];
        let mut active = vec![true; p];
        let mut neighbors: Vec<BTreeSet<usize>> = (0..p)
            .map(|i| graph.neighbors(i).iter().copied().collect())
            .collect();

        let mut heap = BinaryHeap::new();
        for &(a, b) in &graph.edges {
            if let (Some(sa), Some(sb)) = (&sums[a], &sums[b]) {
                heap.push(Reverse(MergeCandidate {
                    cost: ward_cost(sa, 1, sb, 1),
                    a,
                    b,
                }));
            }
        }

        while let Some(Reverse(MergeCandidate { a, b, .. })) = heap.pop() {
            if !active[a] || !active[b] {
                continue;
            }
            let (Some(sum_a), Some(sum_b)) = (sums[a].take(), sums[b].take()) else {
                continue;
            };

            let merged = sizes.len();
            let merged_sum = sum_a + sum_b;
            let merged_size = sizes[a] + sizes[b];

            let mut merged_neighbors: BTreeSet<usize> =
                neighbors[a].union(&neighbors[b]).copied().collect();
            merged_neighbors.remove(&a);
            merged_neighbors.remove(&b);
            neighbors[a].clear();
            neighbors[b].clear();

            for &c in &merged_neighbors {
                neighbors[c].remove(&a);
                neighbors[c].remove(&b);
                neighbors[c].insert(merged);
                if let Some(sum_c) = &sums[c] {
                    heap.push(Reverse(MergeCandidate {
                        cost: ward_cost(&merged_sum, merged_size, sum_c, sizes[c]),
                        a: c.min(merged),
                        b: c.max(merged),
                    }));
                }
            }

            active[a] = false;
            active[b] = false;
            active.push(true);
            sizes.push(merged_size);
            children.push(Some((a, b)));
            sums.push(Some(merged_sum));
            neighbors.push(merged_neighbors);
        }

        let roots = (0..children.len()).filter(|&i| active[i]).collect();

        Ok(Self { children, roots })
    }

    #[must_use]
    pub fn n_nodes(&self) -> usize {
        self.children.len()
    }

    /// Top-level nodes, one per connected component
    #[must_use]
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    #[must_use]
    pub fn children(&self, node: usize) -> Option<(usize, usize)> {
        self.children.get(node).copied().flatten()
    }

    /// Voxels under `node`, ascending
    #[must_use]
    pub fn leaves(&self, node: usize) -> Vec<usize> {
        let mut leaves = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            match self.children(current) {
                Some((a, b)) => {
                    stack.push(a);
                    stack.push(b);
                }
                None => leaves.push(current),
            }
        }
        leaves.sort_unstable();
        leaves
    }
}

// ============================================================================
// Estimator
// ============================================================================

struct FittedClustering {
    n_features_in: usize,
    parcels: Vec<Vec<usize>>,
    classifier: LinearSvc,
    coef: Array2<f64>,
    scores: Vec<f64>,
    delta_scores: Vec<f64>,
}

/// Supervised-clustering classifier over a voxel connectivity graph
pub struct SupervisedClustering {
    graph: Arc<VoxelGraph>,
    config: ClusteringConfig,
    fitted: Option<FittedClustering>,
}

impl SupervisedClustering {
    #[must_use]
    pub fn new(graph: Arc<VoxelGraph>, config: ClusteringConfig) -> Self {
        Self {
            graph,
            config,
            fitted: None,
        }
    }

    /// Parcel weights of the final SVM, one row per pairwise machine
    #[must_use]
    pub fn coef(&self) -> Option<&Array2<f64>> {
        self.fitted.as_ref().map(|f| &f.coef)
    }

    /// Inner score of every visited parcellation
    #[must_use]
    pub fn scores(&self) -> &[f64] {
        self.fitted.as_ref().map_or(&[][..], |f| f.scores.as_slice())
    }

    /// Differences between consecutive scores
    #[must_use]
    pub fn delta_scores(&self) -> &[f64] {
        self.fitted.as_ref().map_or(&[][..], |f| f.delta_scores.as_slice())
    }

    /// Parcels of the retained parcellation, one `coef` column each
    #[must_use]
    pub fn n_parcels(&self) -> usize {
        self.coef().map_or(0, Array2::ncols)
    }

    #[must_use]
    pub fn trace(&self) -> Option<ClusteringTrace> {
        self.fitted.as_ref()?;
        Some(ClusteringTrace {
            scores: self.scores().to_vec(),
            delta_scores: self.delta_scores().to_vec(),
            n_parcels: self.n_parcels(),
        })
    }

    fn validate(&self, x: ArrayView2<'_, f64>, y: &[i64]) -> Result<()> {
        if self.config.n_iterations == 0 {
            return Err(DecodeError::Config("clustering needs at least 1 iteration".into()));
        }
        if self.config.inner_folds < 2 {
            return Err(DecodeError::Config(format!(
                "clustering needs at least 2 inner folds, got {}",
                self.config.inner_folds
            )));
        }
        if x.nrows() != y.len() {
            return Err(DecodeError::Ml(format!(
                "clustering got {} rows but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        if x.nrows() < self.config.inner_folds {
            return Err(DecodeError::Ml(format!(
                "{} training samples cannot fill {} inner folds",
                x.nrows(),
                self.config.inner_folds
            )));
        }
        Ok(())
    }
}

/// Inner fold count that leaves every condition in every training split
///
/// Capped at the size of the rarest condition.
///
/// # Errors
/// Returns `Config` error if some condition has fewer than two samples
fn effective_inner_folds(y: &[i64], requested: usize) -> Result<usize> {
    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for &label in y {
        *counts.entry(label).or_insert(0) += 1;
    }

    let Some((&rarest, &count)) = counts.iter().min_by_key(|&(_, &count)| count) else {
        return Err(DecodeError::Ml("clustering got no training samples".into()));
    };
    if count < 2 {
        return Err(DecodeError::Config(format!(
            "condition {rarest} has {count} training sample, supervised clustering needs 2"
        )));
    }
    if count < requested {
        warn!(
            "Condition {rarest} has {count} training samples, \
             using {count} inner folds instead of {requested}"
        );
        return Ok(count);
    }
    Ok(requested)
}

/// Folds that spread every condition evenly, deterministic
#[allow(clippy::cast_possible_wrap)]
fn stratified_folds(y: &[i64], k: usize) -> Vec<Fold> {
    let mut order: Vec<usize> = (0..y.len()).collect();
    order.sort_by_key(|&i| (y[i], i));

    let mut assignment = vec![0usize; y.len()];
    for (position, &row) in order.iter().enumerate() {
        assignment[row] = position % k;
    }

    (0..k)
        .map(|f| {
            let (test, train): (Vec<usize>, Vec<usize>) =
                (0..y.len()).partition(|&i| assignment[i] == f);
            Fold {
                group: f as i64,
                train,
                test,
            }
        })
        .filter(|fold| !fold.test.is_empty())
        .collect()
}

/// Parcel-mean features: column `j` averages the voxels of parcel `j`
fn parcel_features(x: ArrayView2<'_, f64>, parcels: &[Vec<usize>]) -> Result<Array2<f64>> {
    let mut features = Array2::<f64>::zeros((x.nrows(), parcels.len()));
    for (j, voxels) in parcels.iter().enumerate() {
        let mean = x
            .select(Axis(1), voxels)
            .mean_axis(Axis(1))
            .ok_or_else(|| DecodeError::Ml("empty parcel".into()))?;
        features.column_mut(j).assign(&mean);
    }
    Ok(features)
}

/// Mean inner cross-validated accuracy of an SVM on the given columns
#[allow(clippy::cast_precision_loss)]
fn inner_score(features: &Array2<f64>, y: &[i64], folds: &[Fold], c: f64) -> Result<f64> {
    let mut total = 0.0;
    for fold in folds {
        let x_train = features.select(Axis(0), &fold.train);
        let y_train: Vec<i64> = fold.train.iter().map(|&i| y[i]).collect();
        let x_test = features.select(Axis(0), &fold.test);
        let y_test: Vec<i64> = fold.test.iter().map(|&i| y[i]).collect();

        let mut svc = LinearSvc::new(c);
        svc.fit(x_train.view(), &y_train)?;
        total += svc.score(x_test.view(), &y_test)?;
    }
    Ok(total / folds.len() as f64)
}

/// Replace `node` with its two children, keeping node ids ascending
fn split_parcellation(current: &[usize], node: usize, children: (usize, usize)) -> Vec<usize> {
    let mut next: Vec<usize> = current.iter().copied().filter(|&n| n != node).collect();
    next.push(children.0);
    next.push(children.1);
    next.sort_unstable();
    next
}

/// Caches the per-sample mean of every visited tree node
struct NodeMeans<'x, 't> {
    x: ArrayView2<'x, f64>,
    tree: &'t WardTree,
    means: HashMap<usize, Array1<f64>>,
}

impl<'x, 't> NodeMeans<'x, 't> {
    fn new(x: ArrayView2<'x, f64>, tree: &'t WardTree) -> Self {
        Self {
            x,
            tree,
            means: HashMap::new(),
        }
    }

    fn ensure(&mut self, node: usize) -> Result<()> {
        if !self.means.contains_key(&node) {
            let leaves = self.tree.leaves(node);
            let mean = self
                .x
                .select(Axis(1), &leaves)
                .mean_axis(Axis(1))
                .ok_or_else(|| DecodeError::Ml(format!("tree node {node} has no voxels")))?;
            self.means.insert(node, mean);
        }
        Ok(())
    }

    fn features(&self, parcellation: &[usize]) -> Result<Array2<f64>> {
        let mut features = Array2::<f64>::zeros((self.x.nrows(), parcellation.len()));
        for (j, node) in parcellation.iter().enumerate() {
            let mean = self
                .means
                .get(node)
                .ok_or_else(|| DecodeError::Ml(format!("mean of node {node} not computed")))?;
            features.column_mut(j).assign(mean);
        }
        Ok(features)
    }
}

impl Classifier for SupervisedClustering {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[i64]) -> Result<()> {
        self.validate(x, y)?;

        let tree = WardTree::build(x, &self.graph)?;
        debug!(
            "Ward tree: {} nodes, {} roots",
            tree.n_nodes(),
            tree.roots().len()
        );

        let folds = stratified_folds(y, effective_inner_folds(y, self.config.inner_folds)?);
        let c = self.config.svm_c;
        let pool = thread_pool::build(self.config.n_jobs)?;
        let mut means = NodeMeans::new(x, &tree);

        let mut current: Vec<usize> = tree.roots().to_vec();
        for &root in &current {
            means.ensure(root)?;
        }

        let mut history = vec![current.clone()];
        let mut scores = vec![inner_score(&means.features(&current)?, y, &folds, c)?];

        for iteration in 0..self.config.n_iterations {
            let candidates: Vec<(usize, (usize, usize))> = current
                .iter()
                .filter_map(|&node| tree.children(node).map(|ch| (node, ch)))
                .collect();
            if candidates.is_empty() {
                break;
            }
            for &(_, (a, b)) in &candidates {
                means.ensure(a)?;
                means.ensure(b)?;
            }

            let means_ref = &means;
            let current_ref = &current;
            let folds_ref = &folds;
            let evaluated: Vec<(usize, f64)> = pool.install(|| {
                candidates
                    .par_iter()
                    .map(|&(node, ch)| {
                        let split = split_parcellation(current_ref, node, ch);
                        let score = inner_score(&means_ref.features(&split)?, y, folds_ref, c)?;
                        Ok((node, score))
                    })
                    .collect::<Result<Vec<_>>>()
            })?;

            // Candidates are in ascending node order, so ties keep the lowest id
            let mut best = 0;
            for (idx, &(_, score)) in evaluated.iter().enumerate() {
                if score > evaluated[best].1 {
                    best = idx;
                }
            }
            let (node, score) = evaluated[best];
            let ch = candidates[best].1;

            current = split_parcellation(&current, node, ch);
            debug!(
                "Iteration {}: split node {node} -> {} parcels, score {score:.4}",
                iteration + 1,
                current.len()
            );
            history.push(current.clone());
            scores.push(score);
        }

        let delta_scores: Vec<f64> = scores.windows(2).map(|w| w[1] - w[0]).collect();

        let mut best_step = 0;
        for (step, &score) in scores.iter().enumerate() {
            if score > scores[best_step] {
                best_step = step;
            }
        }

        let parcels: Vec<Vec<usize>> = history[best_step].iter().map(|&n| tree.leaves(n)).collect();
        let features = means.features(&history[best_step])?;
        let mut classifier = LinearSvc::new(c);
        classifier.fit(features.view(), y)?;
        let coef = classifier.coefficients()?;

        info!(
            "Supervised clustering kept {} parcels (inner score {:.4}) after {} splits",
            parcels.len(),
            scores[best_step],
            scores.len() - 1
        );

        self.fitted = Some(FittedClustering {
            n_features_in: x.ncols(),
            parcels,
            classifier,
            coef,
            scores,
            delta_scores,
        });
        Ok(())
    }

    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Vec<i64>> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or_else(|| DecodeError::Ml("supervised clustering used before fit".into()))?;
        if x.ncols() != fitted.n_features_in {
            return Err(DecodeError::Ml(format!(
                "clustering fitted on {} features, got {}",
                fitted.n_features_in,
                x.ncols()
            )));
        }
        let features = parcel_features(x, &fitted.parcels)?;
        fitted.classifier.predict(features.view())
    }
}
