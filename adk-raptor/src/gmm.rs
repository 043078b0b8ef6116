//! Gaussian mixture clustering with BIC model-order selection.
//!
//! # The model
//!
//! ```text
//! P(x) = Σₖ πₖ · N(x | μₖ, Σₖ)
//! ```
//!
//! fitted by Expectation-Maximisation with full covariances:
//!
//! - **E-step**: `γₙₖ = πₖ N(xₙ | μₖ, Σₖ) / Σⱼ πⱼ N(xₙ | μⱼ, Σⱼ)`, computed
//!   in log space with log-sum-exp.
//! - **M-step**: `πₖ = Nₖ / N`, `μₖ = Σₙ γₙₖ xₙ / Nₖ`,
//!   `Σₖ = (Sₖ + d·τ·I) / (Nₖ + d) + reg·I`, where `Sₖ` is the weighted
//!   scatter matrix of component k and `τ` the pooled per-dimension variance
//!   of all components.
//!
//! The shrinkage toward `τ·I` keeps a component holding fewer than `d + 1`
//! points at full rank. Without it, such a component's log-determinant
//! collapses and its likelihood outgrows any BIC penalty. `reg` is
//! `reg_covar` times the mean variance of the data, so it scales with the
//! embedding.
//!
//! # Model order
//!
//! Every K in `[min_k, max_k]` is fitted and scored with
//! `BIC = -2·LL + p·ln(N)`, `p = K·d + K·d(d+1)/2 + (K - 1)`. The lowest BIC
//! wins; on a tie the smaller K wins.
//!
//! # Soft membership
//!
//! A point joins every component whose responsibility exceeds the configured
//! threshold, and its arg-max component if none does. This overlap is what
//! lets one chunk sit under several summaries at the next tree level.
//!
//! # Failure modes
//!
//! Nothing here returns an error. Near-singular covariances get more
//! regularisation until they factorise; too few points produce a single
//! cluster holding everything.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::ClusteringConfig;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Lloyd iterations used to refine the k-means++ seeding.
const KMEANS_ITERATIONS: usize = 10;

/// Regularisation escalations tried before falling back to a diagonal factor.
const MAX_ESCALATIONS: usize = 12;

/// One fitted Gaussian component.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianComponent {
    /// Mixture weight πₖ.
    pub weight: f64,
    /// Mean μₖ.
    pub mean: Array1<f64>,
    /// Covariance Σₖ (regularised).
    pub covariance: Array2<f64>,
}

/// A soft cluster: member indices with their responsibilities.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Indices of member points, ascending.
    pub members: Vec<usize>,
    /// Responsibility of this cluster's component for each member.
    pub responsibilities: Vec<f64>,
    /// The component that generated the cluster.
    pub component: GaussianComponent,
}

impl Cluster {
    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the cluster has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// BIC score of every candidate component count and the winner.
#[derive(Debug, Clone, PartialEq)]
pub struct BicSelection {
    /// `(K, BIC)` for each K evaluated, ascending in K.
    pub scores: Vec<(usize, f64)>,
    /// The selected K.
    pub chosen: usize,
}

/// Result of one clustering call.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusteringOutcome {
    /// Component count of the selected mixture.
    pub n_components: usize,
    /// `responsibilities[i][k]`: probability that point i belongs to component k.
    pub responsibilities: Vec<Vec<f64>>,
    /// Non-empty soft clusters, in component order.
    pub clusters: Vec<Cluster>,
    /// Model-order search; `None` for the degenerate single-cluster result.
    pub selection: Option<BicSelection>,
    /// Whether clustering was skipped because there were too few points.
    pub degenerate: bool,
}

impl ClusteringOutcome {
    /// Indices of the clusters that claim point `i`.
    pub fn memberships(&self, point: usize) -> Vec<usize> {
        self.clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| c.members.binary_search(&point).is_ok())
            .map(|(idx, _)| idx)
            .collect()
    }

    fn degenerate(data: &Array2<f64>, reg_covar: f64) -> Self {
        let m = data.nrows();
        let ridge = ridge(reg_covar, mean_variance(data));
        let component = GaussianComponent {
            weight: 1.0,
            mean: column_mean(data),
            covariance: weighted_covariance(data, &vec![1.0; m], ridge),
        };
        let clusters = if m == 0 {
            Vec::new()
        } else {
            vec![Cluster { members: (0..m).collect(), responsibilities: vec![1.0; m], component }]
        };
        Self {
            n_components: 1,
            responsibilities: vec![vec![1.0]; m],
            clusters,
            selection: None,
            degenerate: true,
        }
    }
}

/// A Gaussian mixture fitted for a fixed component count.
#[derive(Debug, Clone)]
pub struct FittedMixture {
    /// Mixture weights.
    pub weights: Array1<f64>,
    /// Component means, one row per component.
    pub means: Array2<f64>,
    /// Component covariances.
    pub covariances: Vec<Array2<f64>>,
    /// Responsibilities under the final parameters (points × components).
    pub responsibilities: Array2<f64>,
    /// Total log-likelihood under the final parameters.
    pub log_likelihood: f64,
    /// EM iterations performed.
    pub iterations: usize,
    /// Whether the tolerance was met before the iteration cap.
    pub converged: bool,
}

impl FittedMixture {
    /// Number of components.
    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    /// Free parameters of a full-covariance mixture.
    pub fn n_parameters(&self) -> usize {
        let k = self.n_components();
        let d = self.means.ncols();
        k * d + k * d * (d + 1) / 2 + (k - 1)
    }

    /// Bayesian information criterion for `n_samples` points.
    pub fn bic(&self, n_samples: usize) -> f64 {
        -2.0 * self.log_likelihood + self.n_parameters() as f64 * (n_samples as f64).ln()
    }
}

/// EM fitting of a K-component full-covariance mixture.
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    n_components: usize,
    max_iter: usize,
    tol: f64,
    reg_covar: f64,
    n_init: usize,
    seed: Option<u64>,
}

impl GaussianMixture {
    /// Create a mixture with `n_components` components and default EM settings.
    pub fn new(n_components: usize) -> Self {
        Self::from_config(n_components, &ClusteringConfig::default())
    }

    /// Create a mixture using the EM settings of `config`.
    pub fn from_config(n_components: usize, config: &ClusteringConfig) -> Self {
        Self {
            n_components,
            max_iter: config.max_iter,
            tol: config.tol,
            reg_covar: config.reg_covar,
            n_init: config.n_init.max(1),
            seed: None,
        }
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Fit to `data` (points × dims), keeping the best of `n_init` restarts.
    ///
    /// The component count is clamped to the number of points.
    pub fn fit(&self, data: &Array2<f64>) -> FittedMixture {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut best: Option<FittedMixture> = None;
        for _ in 0..self.n_init {
            let fitted = self.fit_once(data, &mut rng);
            if best.as_ref().is_none_or(|b| fitted.log_likelihood > b.log_likelihood) {
                best = Some(fitted);
            }
        }
        best.unwrap_or_else(|| self.fit_once(data, &mut rng))
    }

    fn fit_once(&self, data: &Array2<f64>, rng: &mut StdRng) -> FittedMixture {
        let m = data.nrows();
        let d = data.ncols();
        let k = self.n_components.clamp(1, m.max(1));

        let variance = mean_variance(data);
        let ridge = ridge(self.reg_covar, variance);
        let mut means = kmeans_init(data, k, rng);
        let mut covariances: Vec<Array2<f64>> =
            (0..k).map(|_| Array2::<f64>::eye(d) * (variance.max(ridge) + ridge)).collect();
        let mut weights = Array1::from_elem(k, 1.0 / k as f64);

        let (mut resp, mut log_likelihood) =
            self.expectation(data, &weights, &means, &covariances, ridge);
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iter {
            iterations += 1;
            (weights, means, covariances) = self.maximization(data, &resp, ridge);
            let (next_resp, next_ll) =
                self.expectation(data, &weights, &means, &covariances, ridge);
            let gain = (next_ll - log_likelihood) / m.max(1) as f64;
            resp = next_resp;
            log_likelihood = next_ll;
            if gain.abs() < self.tol {
                converged = true;
                break;
            }
        }

        FittedMixture {
            weights,
            means,
            covariances,
            responsibilities: resp,
            log_likelihood,
            iterations,
            converged,
        }
    }

    /// Responsibilities and total log-likelihood under the given parameters.
    fn expectation(
        &self,
        data: &Array2<f64>,
        weights: &Array1<f64>,
        means: &Array2<f64>,
        covariances: &[Array2<f64>],
        ridge: f64,
    ) -> (Array2<f64>, f64) {
        let m = data.nrows();
        let k = weights.len();
        let d = data.ncols() as f64;

        let mut log_prob = Array2::zeros((m, k));
        let mut diff = vec![0.0; data.ncols()];
        for c in 0..k {
            let factor = regularized_cholesky(&covariances[c], ridge);
            let log_det = 2.0 * factor.diag().iter().map(|v| v.ln()).sum::<f64>();
            let log_weight = weights[c].max(f64::MIN_POSITIVE).ln();
            for i in 0..m {
                for (j, slot) in diff.iter_mut().enumerate() {
                    *slot = data[[i, j]] - means[[c, j]];
                }
                let maha = mahalanobis_sq(&factor, &diff);
                log_prob[[i, c]] = log_weight - 0.5 * (d * LN_2PI + log_det + maha);
            }
        }

        let mut log_likelihood = 0.0;
        for mut row in log_prob.rows_mut() {
            let lse = logsumexp(row.view());
            log_likelihood += lse;
            row.mapv_inplace(|v| (v - lse).exp());
        }
        (log_prob, log_likelihood)
    }

    fn maximization(
        &self,
        data: &Array2<f64>,
        resp: &Array2<f64>,
        ridge: f64,
    ) -> (Array1<f64>, Array2<f64>, Vec<Array2<f64>>) {
        let m = data.nrows();
        let k = resp.ncols();
        let d = data.ncols();

        let nk: Array1<f64> = resp.sum_axis(Axis(0)) + 10.0 * f64::EPSILON;
        let weights = &nk / m as f64;

        let mut means = resp.t().dot(data);
        for c in 0..k {
            means.row_mut(c).mapv_inplace(|v| v / nk[c]);
        }

        let scatters: Vec<Array2<f64>> = (0..k)
            .map(|c| {
                let mut scatter = Array2::<f64>::zeros((d, d));
                for i in 0..m {
                    let r = resp[[i, c]];
                    if r == 0.0 {
                        continue;
                    }
                    for a in 0..d {
                        let da = data[[i, a]] - means[[c, a]];
                        for b in 0..=a {
                            scatter[[a, b]] += r * da * (data[[i, b]] - means[[c, b]]);
                        }
                    }
                }
                for a in 0..d {
                    for b in 0..a {
                        scatter[[b, a]] = scatter[[a, b]];
                    }
                }
                scatter
            })
            .collect();

        // shrinkage target: pooled per-dimension variance of all components
        let prior = d as f64;
        let pooled = scatters.iter().map(|s| s.diag().sum()).sum::<f64>()
            / (prior.max(1.0) * nk.sum());

        let covariances = scatters
            .into_iter()
            .enumerate()
            .map(|(c, scatter)| {
                let target = Array2::<f64>::eye(d) * (prior * pooled);
                let mut cov = (scatter + &target) / (nk[c] + prior);
                cov.diag_mut().mapv_inplace(|v| v + ridge);
                cov
            })
            .collect();

        (weights, means, covariances)
    }
}

/// BIC-driven soft clusterer.
#[derive(Debug, Clone)]
pub struct SoftClusterer {
    config: ClusteringConfig,
    seed: Option<u64>,
}

impl SoftClusterer {
    /// Create a clusterer.
    pub fn new(config: ClusteringConfig) -> Self {
        Self { config, seed: None }
    }

    /// Make EM initialisation reproducible.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Largest K actually searched for `m` points: `max_k`, but never more
    /// than `m / 2` and never less than `min_k`.
    pub fn effective_max_k(&self, m: usize) -> usize {
        self.config.max_k.min(m / 2).max(self.config.min_k)
    }

    /// Cluster `data` (points × dims).
    pub fn cluster(&self, data: &Array2<f64>) -> ClusteringOutcome {
        let m = data.nrows();
        let min_k = self.config.min_k.max(1);
        if m < self.config.min_points || m < 2 * min_k {
            debug!(
                points = m,
                min_points = self.config.min_points,
                "too few points, single cluster"
            );
            return ClusteringOutcome::degenerate(data, self.config.reg_covar);
        }

        let (selection, mixture) = self.select(data);
        let threshold = self.config.membership_threshold;
        let k = mixture.n_components();
        let resp = &mixture.responsibilities;

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); k];
        let mut member_resp: Vec<Vec<f64>> = vec![Vec::new(); k];
        for (i, row) in resp.rows().into_iter().enumerate() {
            let mut claimed = false;
            for c in 0..k {
                if row[c] > threshold {
                    members[c].push(i);
                    member_resp[c].push(row[c]);
                    claimed = true;
                }
            }
            if !claimed {
                let best = argmax(row);
                members[best].push(i);
                member_resp[best].push(row[best]);
            }
        }

        let clusters = members
            .into_iter()
            .zip(member_resp)
            .enumerate()
            .filter(|(_, (members, _))| !members.is_empty())
            .map(|(c, (members, responsibilities))| Cluster {
                members,
                responsibilities,
                component: GaussianComponent {
                    weight: mixture.weights[c],
                    mean: mixture.means.row(c).to_owned(),
                    covariance: mixture.covariances[c].clone(),
                },
            })
            .collect();

        ClusteringOutcome {
            n_components: k,
            responsibilities: resp.rows().into_iter().map(|row| row.to_vec()).collect(),
            clusters,
            selection: Some(selection),
            degenerate: false,
        }
    }

    /// Fit every K in the search range and keep the lowest BIC.
    pub fn select(&self, data: &Array2<f64>) -> (BicSelection, FittedMixture) {
        let m = data.nrows();
        let min_k = self.config.min_k.max(1);
        let max_k = self.effective_max_k(m);

        let mut scores = Vec::with_capacity(max_k + 1 - min_k);
        let mut fits = Vec::with_capacity(max_k + 1 - min_k);
        for k in min_k..=max_k {
            let seed = self.seed.map(|s| s.wrapping_add(k as u64));
            let fitted = GaussianMixture::from_config(k, &self.config).with_seed(seed).fit(data);
            let bic = fitted.bic(m);
            debug!(
                k,
                bic,
                log_likelihood = fitted.log_likelihood,
                iterations = fitted.iterations,
                "evaluated component count"
            );
            scores.push((k, bic));
            fits.push(fitted);
        }

        let best = lowest_bic(&scores);
        let chosen = scores[best].0;
        let mixture = fits.swap_remove(best);
        (BicSelection { scores, chosen }, mixture)
    }
}

/// Index of the lowest score; earlier (smaller K) entries win ties.
pub fn lowest_bic(scores: &[(usize, f64)]) -> usize {
    let mut best = 0;
    for (idx, &(_, bic)) in scores.iter().enumerate().skip(1) {
        if bic < scores[best].1 || (scores[best].1.is_nan() && !bic.is_nan()) {
            best = idx;
        }
    }
    best
}

/// Lower-triangular Cholesky factor, or `None` if `a` is not positive definite.
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for p in 0..j {
                sum -= l[[i, p]] * l[[j, p]];
            }
            if i == j {
                if !(sum > 0.0) || !sum.is_finite() {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Cholesky factor of `cov`, adding `reg * 10^t` to the diagonal until it
/// factorises. Falls back to the square root of the (floored) diagonal.
fn regularized_cholesky(cov: &Array2<f64>, reg: f64) -> Array2<f64> {
    if let Some(factor) = cholesky(cov) {
        return factor;
    }
    let n = cov.nrows();
    let mut extra = reg.max(f64::EPSILON);
    for _ in 0..MAX_ESCALATIONS {
        extra *= 10.0;
        let adjusted = cov + &(Array2::<f64>::eye(n) * extra);
        if let Some(factor) = cholesky(&adjusted) {
            debug!(extra_regularization = extra, "covariance regularised to factorise");
            return factor;
        }
    }
    debug!("covariance not factorisable, using diagonal");
    Array2::from_diag(
        &cov.diag().mapv(|v| if v.is_finite() { v.abs().max(reg).sqrt() } else { 1.0 }),
    )
}

/// `‖L⁻¹ x‖²` by forward substitution.
fn mahalanobis_sq(factor: &Array2<f64>, x: &[f64]) -> f64 {
    let n = x.len();
    let mut z = vec![0.0; n];
    let mut total = 0.0;
    for i in 0..n {
        let mut s = x[i];
        for p in 0..i {
            s -= factor[[i, p]] * z[p];
        }
        z[i] = s / factor[[i, i]];
        total += z[i] * z[i];
    }
    total
}

fn logsumexp(values: ArrayView1<'_, f64>) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

fn argmax(row: ArrayView1<'_, f64>) -> usize {
    row.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)))
        .map_or(0, |(idx, _)| idx)
}

fn column_mean(data: &Array2<f64>) -> Array1<f64> {
    data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(data.ncols()))
}

/// Diagonal ridge: `reg_covar` relative to the data's mean variance.
fn ridge(reg_covar: f64, variance: f64) -> f64 {
    let scale = if variance.is_finite() && variance > 0.0 { variance } else { 1.0 };
    (reg_covar * scale).max(f64::MIN_POSITIVE)
}

/// Average per-dimension variance of `data`.
fn mean_variance(data: &Array2<f64>) -> f64 {
    if data.nrows() == 0 || data.ncols() == 0 {
        return 1.0;
    }
    data.var_axis(Axis(0), 0.0).mean().unwrap_or(1.0)
}

fn weighted_covariance(data: &Array2<f64>, weights: &[f64], reg: f64) -> Array2<f64> {
    let d = data.ncols();
    let total: f64 = weights.iter().sum::<f64>().max(f64::EPSILON);
    let mean = column_mean(data);
    let mut cov = Array2::<f64>::eye(d) * reg;
    for (i, row) in data.rows().into_iter().enumerate() {
        let centered = &row - &mean;
        for a in 0..d {
            for b in 0..d {
                cov[[a, b]] += weights[i] * centered[a] * centered[b] / total;
            }
        }
    }
    cov
}

/// k-means++ seeding followed by a few Lloyd iterations.
fn kmeans_init(data: &Array2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let m = data.nrows();
    let d = data.ncols();
    let mut centers = Array2::<f64>::zeros((k, d));
    if m == 0 {
        return centers;
    }

    let sq_dist = |i: usize, center: ArrayView1<'_, f64>| -> f64 {
        data.row(i).iter().zip(center.iter()).map(|(a, b)| (a - b) * (a - b)).sum()
    };

    centers.row_mut(0).assign(&data.row(rng.random_range(0..m)));
    let mut closest: Vec<f64> = (0..m).map(|i| sq_dist(i, centers.row(0))).collect();
    for c in 1..k {
        let total: f64 = closest.iter().sum();
        let pick = if total > 0.0 {
            let mut target = rng.random::<f64>() * total;
            let mut chosen = m - 1;
            for (i, &dist) in closest.iter().enumerate() {
                if target < dist {
                    chosen = i;
                    break;
                }
                target -= dist;
            }
            chosen
        } else {
            rng.random_range(0..m)
        };
        centers.row_mut(c).assign(&data.row(pick));
        for (i, slot) in closest.iter_mut().enumerate() {
            *slot = slot.min(sq_dist(i, centers.row(c)));
        }
    }

    let mut labels = vec![0usize; m];
    for _ in 0..KMEANS_ITERATIONS {
        for (i, label) in labels.iter_mut().enumerate() {
            *label = (0..k)
                .min_by(|&a, &b| sq_dist(i, centers.row(a)).total_cmp(&sq_dist(i, centers.row(b))))
                .unwrap_or(0);
        }
        for c in 0..k {
            let members: Vec<usize> = (0..m).filter(|&i| labels[i] == c).collect();
            if members.is_empty() {
                continue;
            }
            let mut sum = Array1::<f64>::zeros(d);
            for &i in &members {
                sum += &data.row(i);
            }
            centers.row_mut(c).assign(&(sum / members.len() as f64));
        }
    }
    centers
}
