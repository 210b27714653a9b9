//! Edge inclusion priors.
//!
//! The edge prior rewrites the inclusion-probability matrix from the
//! current indicators after every indicator sweep. It is independent of
//! the model family, cloned per chain, and owns whatever internal state it
//! needs (cluster labels and block probabilities for the stochastic block
//! model).

use nalgebra::DMatrix;
use statrs::function::gamma::ln_gamma;

use crate::errors::{Result, SamplerError};
use crate::math::logaddexp;
use crate::rng::ChainRng;

#[derive(Clone)]
pub enum EdgePrior {
    /// Fixed inclusion probabilities; update is a no-op.
    Bernoulli,
    /// A single shared inclusion probability drawn from its Beta posterior.
    BetaBernoulli { alpha: f64, beta: f64 },
    /// Mixture-of-finite-mixtures stochastic block model.
    StochasticBlock(StochasticBlockPrior),
}

impl EdgePrior {
    pub fn bernoulli() -> Self {
        EdgePrior::Bernoulli
    }

    pub fn beta_bernoulli(alpha: f64, beta: f64) -> Result<Self> {
        if alpha <= 0.0 || beta <= 0.0 {
            return Err(SamplerError::InvalidArgument(
                "beta-bernoulli hyperparameters must be positive".into(),
            ));
        }
        Ok(EdgePrior::BetaBernoulli { alpha, beta })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn stochastic_block(
        alpha_within: f64,
        beta_within: f64,
        alpha_between: f64,
        beta_between: f64,
        dirichlet_alpha: f64,
        lambda: f64,
    ) -> Result<Self> {
        if alpha_within <= 0.0
            || beta_within <= 0.0
            || alpha_between <= 0.0
            || beta_between <= 0.0
            || dirichlet_alpha <= 0.0
            || lambda <= 0.0
        {
            return Err(SamplerError::InvalidArgument(
                "stochastic block hyperparameters must be positive".into(),
            ));
        }
        Ok(EdgePrior::StochasticBlock(StochasticBlockPrior {
            alpha_within,
            beta_within,
            alpha_between,
            beta_between,
            dirichlet_alpha,
            lambda,
            initialized: false,
            allocations: Vec::new(),
            cluster_prob: DMatrix::zeros(0, 0),
            log_v: Vec::new(),
        }))
    }

    pub fn update(
        &mut self,
        edge_indicators: &DMatrix<u8>,
        inclusion_probability: &mut DMatrix<f64>,
        num_variables: usize,
        num_pairwise: usize,
        rng: &mut ChainRng,
    ) {
        match self {
            EdgePrior::Bernoulli => {}
            EdgePrior::BetaBernoulli { alpha, beta } => {
                let mut included = 0usize;
                for i in 0..num_variables.saturating_sub(1) {
                    for j in i + 1..num_variables {
                        included += edge_indicators[(i, j)] as usize;
                    }
                }
                let prob = rng.beta(
                    *alpha + included as f64,
                    *beta + (num_pairwise - included) as f64,
                );
                for i in 0..num_variables.saturating_sub(1) {
                    for j in i + 1..num_variables {
                        inclusion_probability[(i, j)] = prob;
                        inclusion_probability[(j, i)] = prob;
                    }
                }
            }
            EdgePrior::StochasticBlock(sbm) => {
                sbm.update(edge_indicators, inclusion_probability, num_variables, rng);
            }
        }
    }

    pub fn has_allocations(&self) -> bool {
        matches!(self, EdgePrior::StochasticBlock(sbm) if sbm.initialized)
    }

    /// Current cluster labels (0-based), when the prior maintains them.
    pub fn allocations(&self) -> Option<&[usize]> {
        match self {
            EdgePrior::StochasticBlock(sbm) if sbm.initialized => Some(&sbm.allocations),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct StochasticBlockPrior {
    alpha_within: f64,
    beta_within: f64,
    alpha_between: f64,
    beta_between: f64,
    dirichlet_alpha: f64,
    lambda: f64,

    initialized: bool,
    allocations: Vec<usize>,
    cluster_prob: DMatrix<f64>,
    /// log V_n(t) for t = 1.. clusters, precomputed once.
    log_v: Vec<f64>,
}

impl StochasticBlockPrior {
    fn update(
        &mut self,
        edge_indicators: &DMatrix<u8>,
        inclusion_probability: &mut DMatrix<f64>,
        p: usize,
        rng: &mut ChainRng,
    ) {
        if !self.initialized {
            self.initialize(edge_indicators, p, rng);
        }
        if p < 2 {
            return;
        }

        self.resample_allocations(edge_indicators, p, rng);
        self.compact_labels();
        self.cluster_prob = self.sample_block_probs(edge_indicators, p, rng);

        for i in 0..p.saturating_sub(1) {
            for j in i + 1..p {
                let prob = self.cluster_prob[(self.allocations[i], self.allocations[j])];
                inclusion_probability[(i, j)] = prob;
                inclusion_probability[(j, i)] = prob;
            }
        }
    }

    fn initialize(&mut self, edge_indicators: &DMatrix<u8>, p: usize, rng: &mut ChainRng) {
        self.allocations = vec![0; p];
        if p > 1 {
            self.allocations[1] = 1;
        }
        for label in self.allocations.iter_mut().skip(2) {
            *label = usize::from(rng.uniform() > 0.5);
        }
        self.cluster_prob = self.sample_block_probs(edge_indicators, p, rng);
        self.log_v = compute_log_v(p, self.dirichlet_alpha, p + 10, self.lambda);
        self.initialized = true;
    }

    fn num_clusters(&self) -> usize {
        self.allocations.iter().copied().max().map_or(0, |m| m + 1)
    }

    /// Gibbs sweep over the labels. Occupied clusters are weighted by
    /// `n_c + alpha0` times the edge likelihood under the current block
    /// probabilities; a fresh cluster is weighted by
    /// `alpha0 * exp(log V(t+1) - log V(t))` times the prior-predictive
    /// edge likelihood.
    fn resample_allocations(
        &mut self,
        edge_indicators: &DMatrix<u8>,
        p: usize,
        rng: &mut ChainRng,
    ) {
        let between_mean = self.alpha_between / (self.alpha_between + self.beta_between);

        for i in 0..p {
            let mut counts = vec![0usize; self.num_clusters()];
            for (j, &label) in self.allocations.iter().enumerate() {
                if j != i {
                    counts[label] += 1;
                }
            }
            let occupied: Vec<usize> = (0..counts.len()).filter(|&c| counts[c] > 0).collect();
            let t = occupied.len();

            let mut log_weights = Vec::with_capacity(t + 1);
            for &c in &occupied {
                let mut lw = (counts[c] as f64 + self.dirichlet_alpha).ln();
                for j in 0..p {
                    if j == i {
                        continue;
                    }
                    let theta = self.cluster_prob[(c, self.allocations[j])];
                    lw += if edge_indicators[(i, j)] == 1 {
                        theta.ln()
                    } else {
                        (1.0 - theta).ln()
                    };
                }
                log_weights.push(lw);
            }

            // Fresh singleton cluster.
            let mut lw_new = self.dirichlet_alpha.ln() + self.log_v[t] - self.log_v[t - 1];
            for j in 0..p {
                if j == i {
                    continue;
                }
                lw_new += if edge_indicators[(i, j)] == 1 {
                    between_mean.ln()
                } else {
                    (1.0 - between_mean).ln()
                };
            }
            log_weights.push(lw_new);

            let log_norm = log_weights
                .iter()
                .fold(f64::NEG_INFINITY, |acc, &w| logaddexp(acc, w));
            let u = rng.uniform();
            let mut cumulative = 0.0;
            let mut chosen = log_weights.len() - 1;
            for (k, &lw) in log_weights.iter().enumerate() {
                cumulative += (lw - log_norm).exp();
                if u <= cumulative {
                    chosen = k;
                    break;
                }
            }

            if chosen < t {
                self.allocations[i] = occupied[chosen];
            } else {
                let new_label = self.open_cluster(edge_indicators, i, p, rng);
                self.allocations[i] = new_label;
            }
        }
    }

    /// Grow the block-probability matrix with posterior draws for a new
    /// singleton cluster holding only node `i`.
    fn open_cluster(
        &mut self,
        edge_indicators: &DMatrix<u8>,
        i: usize,
        p: usize,
        rng: &mut ChainRng,
    ) -> usize {
        let old = self.cluster_prob.nrows();
        let mut grown = DMatrix::zeros(old + 1, old + 1);
        grown.view_mut((0, 0), (old, old)).copy_from(&self.cluster_prob);

        for c in 0..old {
            let mut edges = 0usize;
            let mut pairs = 0usize;
            for (j, &label) in self.allocations.iter().enumerate() {
                if j != i && label == c {
                    pairs += 1;
                    edges += edge_indicators[(i, j)] as usize;
                }
            }
            let theta = rng.beta(
                self.alpha_between + edges as f64,
                self.beta_between + (pairs - edges) as f64,
            );
            grown[(c, old)] = theta;
            grown[(old, c)] = theta;
        }
        grown[(old, old)] = rng.beta(self.alpha_within, self.beta_within);

        self.cluster_prob = grown;
        old
    }

    /// Relabel the allocations onto 0..C-1, dropping empty clusters. The
    /// block-probability matrix is resampled right afterwards, so only the
    /// labels need remapping.
    fn compact_labels(&mut self) {
        let max_label = self.num_clusters();
        let mut remap = vec![usize::MAX; max_label];
        let mut next = 0;
        for &label in &self.allocations {
            if remap[label] == usize::MAX {
                remap[label] = next;
                next += 1;
            }
        }
        for label in &mut self.allocations {
            *label = remap[*label];
        }
    }

    /// Independent Beta posterior draws for every block pair, conditional
    /// on the labels and the observed edges.
    fn sample_block_probs(
        &self,
        edge_indicators: &DMatrix<u8>,
        p: usize,
        rng: &mut ChainRng,
    ) -> DMatrix<f64> {
        let clusters = self.num_clusters().max(1);
        let mut edges = DMatrix::<f64>::zeros(clusters, clusters);
        let mut pairs = DMatrix::<f64>::zeros(clusters, clusters);

        for i in 0..p.saturating_sub(1) {
            for j in i + 1..p {
                let (c1, c2) = {
                    let a = self.allocations[i];
                    let b = self.allocations[j];
                    (a.min(b), a.max(b))
                };
                pairs[(c1, c2)] += 1.0;
                edges[(c1, c2)] += edge_indicators[(i, j)] as f64;
            }
        }

        let mut probs = DMatrix::zeros(clusters, clusters);
        for c1 in 0..clusters {
            for c2 in c1..clusters {
                let (alpha, beta) = if c1 == c2 {
                    (self.alpha_within, self.beta_within)
                } else {
                    (self.alpha_between, self.beta_between)
                };
                let e = edges[(c1, c2)];
                let n = pairs[(c1, c2)];
                let draw = rng.beta(alpha + e, beta + (n - e));
                probs[(c1, c2)] = draw;
                probs[(c2, c1)] = draw;
            }
        }
        probs
    }
}

/// Coefficients `log V_n(t)` of the mixture-of-finite-mixtures prior with
/// a zero-truncated Poisson(lambda) on the number of components:
/// `V_n(t) = sum_k k_(t) / (alpha0 k)^(n) * p(k)`.
fn compute_log_v(
    num_variables: usize,
    dirichlet_alpha: f64,
    t_max: usize,
    lambda: f64,
) -> Vec<f64> {
    let n = num_variables as f64;
    // log(1 - e^{-lambda}): normalizer of the zero-truncated Poisson.
    let log_truncation = (-(-lambda).exp()).ln_1p();
    let mut log_v = Vec::with_capacity(t_max);

    for t in 1..=t_max {
        let mut acc = f64::NEG_INFINITY;
        for k in t..t + 400 {
            let kf = k as f64;
            // log falling factorial k_(t)
            let falling = ln_gamma(kf + 1.0) - ln_gamma(kf - t as f64 + 1.0);
            // log rising factorial (alpha0 k)^(n)
            let rising = ln_gamma(dirichlet_alpha * kf + n) - ln_gamma(dirichlet_alpha * kf);
            // zero-truncated Poisson mass
            let log_pk = kf * lambda.ln() - lambda - ln_gamma(kf + 1.0) - log_truncation;

            let term = falling - rising + log_pk;
            if term < acc - 40.0 {
                break;
            }
            acc = logaddexp(acc, term);
        }
        log_v.push(acc);
    }
    log_v
}
