//! UMAP-style dimensionality reduction.
//!
//! Embeddings are far too wide for a full-covariance Gaussian mixture, so
//! each tree level is first projected into a handful of dimensions:
//!
//! 1. a k-nearest-neighbour graph is built in the original space;
//! 2. neighbour distances become fuzzy memberships
//!    `w = exp(-max(0, d - rho) / sigma)`, where `rho` is the distance to the
//!    nearest neighbour and `sigma` is calibrated so the memberships of each
//!    point sum to `log2(k + 1)`; the directed graph is symmetrised with
//!    `a + b - a * b`;
//! 3. a random layout is drawn in the target space;
//! 4. the layout is optimised by stochastic gradient steps that pull graph
//!    neighbours together and push negative samples apart under the kernel
//!    `1 / (1 + a * d^(2b))`.
//!
//! Local neighbourhoods are preserved; global distances are not.

use std::collections::BTreeMap;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::{DistanceMetric, ReductionConfig};

/// Floor for distances and bandwidths so identical points never divide by zero.
const EPSILON: f64 = 1e-8;

/// `sigma` is never smaller than this fraction of the mean neighbour distance.
const MIN_BANDWIDTH_SCALE: f64 = 1e-3;

/// Gradient components are clipped to `[-CLIP, CLIP]`.
const CLIP: f64 = 4.0;

/// Initial layout coordinates are drawn from `[-INIT_RANGE, INIT_RANGE]`.
const INIT_RANGE: f64 = 10.0;

/// Projects embeddings into a low-dimensional space preserving neighbourhoods.
#[derive(Debug, Clone)]
pub struct DimensionReducer {
    config: ReductionConfig,
    seed: Option<u64>,
}

impl DimensionReducer {
    /// Create a reducer; without a seed the layout is drawn from OS entropy.
    pub fn new(config: ReductionConfig) -> Self {
        Self { config, seed: None }
    }

    /// Make the layout reproducible.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Reduce `data` (N rows of equal width) to `target_dim` columns.
    ///
    /// With at most one point, or when the input is already no wider than the
    /// target, the input is returned unchanged (converted to `f64`).
    pub fn reduce(&self, data: &[Vec<f32>]) -> Array2<f64> {
        let n = data.len();
        let width = data.first().map_or(0, Vec::len);
        let points = to_matrix(data, width);

        if n <= 1 || width <= self.config.target_dim {
            debug!(points = n, width, target = self.config.target_dim, "identity reduction");
            return points;
        }

        let k = self.config.n_neighbors.unwrap_or_else(|| default_neighbors(n)).clamp(1, n - 1);
        let distances = pairwise_distances(&points, self.config.metric);
        let neighbors = nearest_neighbors(&distances, k);
        let edges = fuzzy_edges(&neighbors, k);

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut layout = Array2::from_shape_fn((n, self.config.target_dim), |_| {
            rng.random_range(-INIT_RANGE..INIT_RANGE)
        });

        self.optimize_layout(&mut layout, &edges, &mut rng);
        debug!(points = n, k, edges = edges.len(), target = self.config.target_dim, "reduced");
        layout
    }

    /// Stochastic layout optimisation; edges are sampled in proportion to
    /// their membership weight.
    fn optimize_layout(
        &self,
        layout: &mut Array2<f64>,
        edges: &[(usize, usize, f64)],
        rng: &mut StdRng,
    ) {
        let n = layout.nrows();
        let dim = layout.ncols();
        let n_epochs = self.config.n_epochs;
        if edges.is_empty() || n_epochs == 0 {
            return;
        }

        let a = self.config.curve_a;
        let b = self.config.curve_b;
        let negative_rate = self.config.negative_sample_rate.max(1) as f64;

        let max_weight = edges.iter().map(|e| e.2).fold(0.0_f64, f64::max).max(EPSILON);
        let epochs_per_sample: Vec<f64> =
            edges.iter().map(|&(_, _, w)| max_weight / w.max(EPSILON)).collect();
        let epochs_per_negative: Vec<f64> =
            epochs_per_sample.iter().map(|e| e / negative_rate).collect();
        let mut next_sample = epochs_per_sample.clone();
        let mut next_negative = epochs_per_negative.clone();

        let mut delta = vec![0.0; dim];
        for epoch in 0..n_epochs {
            let alpha = self.config.learning_rate * (1.0 - epoch as f64 / n_epochs as f64);
            let epoch_f = epoch as f64;

            for (e, &(i, j, _)) in edges.iter().enumerate() {
                if next_sample[e] > epoch_f {
                    continue;
                }

                // Attraction between graph neighbours.
                let dist_sq = squared_distance(layout, i, j, &mut delta);
                let coeff = if dist_sq > 0.0 {
                    -2.0 * a * b * dist_sq.powf(b - 1.0) / (a * dist_sq.powf(b) + 1.0)
                } else {
                    0.0
                };
                for d in 0..dim {
                    let grad = (coeff * delta[d]).clamp(-CLIP, CLIP) * alpha;
                    layout[[i, d]] += grad;
                    layout[[j, d]] -= grad;
                }
                next_sample[e] += epochs_per_sample[e];

                // Repulsion from random points.
                let negatives =
                    ((epoch_f - next_negative[e]) / epochs_per_negative[e]).max(0.0) as usize;
                for _ in 0..negatives {
                    let other = rng.random_range(0..n);
                    if other == i {
                        continue;
                    }
                    let dist_sq = squared_distance(layout, i, other, &mut delta);
                    let coeff = if dist_sq > 0.0 {
                        2.0 * b / ((0.001 + dist_sq) * (a * dist_sq.powf(b) + 1.0))
                    } else {
                        0.0
                    };
                    for d in 0..dim {
                        let grad =
                            if coeff > 0.0 { (coeff * delta[d]).clamp(-CLIP, CLIP) } else { CLIP };
                        layout[[i, d]] += grad * alpha;
                    }
                }
                next_negative[e] += negatives as f64 * epochs_per_negative[e];
            }
        }
    }
}

/// `floor(sqrt(n - 1))`, at least 1.
pub fn default_neighbors(n: usize) -> usize {
    ((n.saturating_sub(1)) as f64).sqrt().floor().max(1.0) as usize
}

fn to_matrix(data: &[Vec<f32>], width: usize) -> Array2<f64> {
    Array2::from_shape_fn((data.len(), width), |(i, j)| {
        data[i].get(j).copied().map_or(0.0, f64::from)
    })
}

/// Writes `layout[i] - layout[j]` into `delta` and returns its squared norm.
fn squared_distance(layout: &Array2<f64>, i: usize, j: usize, delta: &mut [f64]) -> f64 {
    let mut total = 0.0;
    for (d, slot) in delta.iter_mut().enumerate() {
        let diff = layout[[i, d]] - layout[[j, d]];
        *slot = diff;
        total += diff * diff;
    }
    total
}

fn pairwise_distances(points: &Array2<f64>, metric: DistanceMetric) -> Array2<f64> {
    let n = points.nrows();
    let norms: Vec<f64> = points.rows().into_iter().map(|row| row.dot(&row).sqrt()).collect();
    let mut distances = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let (a, b) = (points.row(i), points.row(j));
            let distance = match metric {
                DistanceMetric::Euclidean => {
                    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
                }
                DistanceMetric::Cosine => {
                    if norms[i] < EPSILON || norms[j] < EPSILON {
                        1.0
                    } else {
                        (1.0 - a.dot(&b) / (norms[i] * norms[j])).max(0.0)
                    }
                }
            };
            distances[[i, j]] = distance;
            distances[[j, i]] = distance;
        }
    }
    distances
}

/// The `k` nearest other points of every point, closest first.
fn nearest_neighbors(distances: &Array2<f64>, k: usize) -> Vec<Vec<(usize, f64)>> {
    let n = distances.nrows();
    (0..n)
        .map(|i| {
            let mut row: Vec<(usize, f64)> =
                (0..n).filter(|&j| j != i).map(|j| (j, distances[[i, j]])).collect();
            row.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            row.truncate(k);
            row
        })
        .collect()
}

/// Symmetric fuzzy membership edges `(i, j, w)`, listed in both directions.
fn fuzzy_edges(neighbors: &[Vec<(usize, f64)>], k: usize) -> Vec<(usize, usize, f64)> {
    let target = ((k + 1) as f64).log2();
    let mean_distance = {
        let all: Vec<f64> = neighbors.iter().flatten().map(|&(_, d)| d).collect();
        if all.is_empty() { 0.0 } else { all.iter().sum::<f64>() / all.len() as f64 }
    };

    // BTreeMap keeps edge order, and with it the seeded layout, reproducible.
    let mut directed: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for (i, row) in neighbors.iter().enumerate() {
        let rho = row.iter().map(|&(_, d)| d).find(|&d| d > 0.0).unwrap_or(0.0);
        let sigma = calibrate_bandwidth(row, rho, target)
            .max(MIN_BANDWIDTH_SCALE * mean_distance)
            .max(EPSILON);
        for &(j, d) in row {
            let w = (-(d - rho).max(0.0) / sigma).exp();
            directed.insert((i, j), w);
        }
    }

    let mut edges = Vec::with_capacity(directed.len() * 2);
    for (&(i, j), &w_ij) in &directed {
        let w_ji = directed.get(&(j, i)).copied().unwrap_or(0.0);
        if w_ji > 0.0 && j < i {
            // Already emitted from the (j, i) side.
            continue;
        }
        let w = w_ij + w_ji - w_ij * w_ji;
        if w > 0.0 {
            edges.push((i, j, w));
            edges.push((j, i, w));
        }
    }
    edges
}

/// Binary search for `sigma` with `sum exp(-max(0, d - rho) / sigma) = target`.
fn calibrate_bandwidth(row: &[(usize, f64)], rho: f64, target: f64) -> f64 {
    const ITERATIONS: usize = 64;
    const TOLERANCE: f64 = 1e-5;

    let mut lo = 0.0;
    let mut hi = f64::INFINITY;
    let mut mid = 1.0;
    for _ in 0..ITERATIONS {
        let total: f64 = row.iter().map(|&(_, d)| (-(d - rho).max(0.0) / mid).exp()).sum();
        if (total - target).abs() < TOLERANCE {
            break;
        }
        if total > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
        }
    }
    mid
}
