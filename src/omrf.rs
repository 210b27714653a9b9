//! Ordinal Markov random field with joint pseudo-likelihood inference.
//!
//! Variables are either ordinal (one threshold per non-baseline category)
//! or Blume-Capel (linear and quadratic effects around a baseline
//! category). Pairwise effects live on a symmetric zero-diagonal matrix
//! under a spike-and-slab prior. The residual matrix `X · Θ` is maintained
//! incrementally: a change of `Δ` on the pair (i, j) adds `Δ · X[:, j]` to
//! column i and `Δ · X[:, i]` to column j.

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::adapt::{rm_weight, robbins_monro_sd, RWM_TARGET_ACCEPT};
use crate::edge_prior::EdgePrior;
use crate::errors::{Result, SamplerError};
use crate::math::{log1p_exp, log_cauchy_pdf, log_normal_pdf};
use crate::model::{strict_upper_indicators, validate_edge_inputs, Model};
use crate::partition::{
    denom_blume_capel, denom_ordinal, logz_probs_blume_capel, logz_probs_ordinal,
};
use crate::rng::ChainRng;
use crate::rwm::rwm_step;
use crate::schedule::WarmupSchedule;

/// Marker for a pairwise slot that is not an active parameter.
const NO_PARAM: usize = usize::MAX;

#[derive(Clone)]
pub struct OmrfModel {
    n: usize,
    p: usize,

    observations: DMatrix<i64>,
    observations_f: DMatrix<f64>,
    observations_f_t: DMatrix<f64>,
    num_categories: Vec<usize>,
    is_ordinal: Vec<bool>,
    baseline_category: Vec<usize>,

    // Sufficient statistics.
    counts_per_category: DMatrix<i64>,
    blume_capel_stats: DMatrix<i64>,
    pairwise_stats: DMatrix<f64>,
    residual: DMatrix<f64>,

    // Parameters.
    main_effects: DMatrix<f64>,
    pairwise_effects: DMatrix<f64>,
    edge_indicators: DMatrix<u8>,

    // Priors.
    inclusion_probability: DMatrix<f64>,
    main_alpha: f64,
    main_beta: f64,
    pairwise_scale: f64,
    pairwise_scaling_factors: DMatrix<f64>,

    edge_selection: bool,
    edge_selection_active: bool,

    num_main: usize,
    num_pairwise: usize,

    proposal_sd_main: DMatrix<f64>,
    proposal_sd_pairwise: DMatrix<f64>,
    mh_adaptation_iters: Option<usize>,

    rng: ChainRng,
    inv_mass: DVector<f64>,

    missing_index: Vec<(usize, usize)>,

    // Gradient caches.
    grad_obs_cache: DVector<f64>,
    index_map: DMatrix<usize>,
    gradient_cache_valid: bool,

    pair_index: Vec<(usize, usize)>,
    shuffled_edge_order: Vec<usize>,
}

fn col(m: &DMatrix<f64>, j: usize) -> &[f64] {
    let n = m.nrows();
    &m.as_slice()[j * n..(j + 1) * n]
}

impl OmrfModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        observations: DMatrix<i64>,
        num_categories: Vec<usize>,
        inclusion_probability: DMatrix<f64>,
        initial_edge_indicators: DMatrix<u8>,
        is_ordinal: Vec<bool>,
        baseline_category: Vec<usize>,
        main_alpha: f64,
        main_beta: f64,
        pairwise_scale: f64,
        edge_selection: bool,
    ) -> Result<Self> {
        let n = observations.nrows();
        let p = observations.ncols();
        if p == 0 {
            return Err(SamplerError::InvalidArgument(
                "at least one variable is required".into(),
            ));
        }
        if num_categories.len() != p || is_ordinal.len() != p || baseline_category.len() != p {
            return Err(SamplerError::InvalidArgument(
                "per-variable metadata must have one entry per variable".into(),
            ));
        }
        validate_edge_inputs(&inclusion_probability, &initial_edge_indicators, p)?;
        if main_alpha <= 0.0 || main_beta <= 0.0 || pairwise_scale <= 0.0 {
            return Err(SamplerError::InvalidArgument(
                "prior hyperparameters must be positive".into(),
            ));
        }
        for v in 0..p {
            if num_categories[v] == 0 {
                return Err(SamplerError::InvalidArgument(format!(
                    "variable {v} must have at least one non-baseline category"
                )));
            }
            if !is_ordinal[v] && baseline_category[v] > num_categories[v] {
                return Err(SamplerError::InvalidArgument(format!(
                    "baseline category of variable {v} is out of range"
                )));
            }
            for i in 0..n {
                let x = observations[(i, v)];
                if x < 0 || x > num_categories[v] as i64 {
                    return Err(SamplerError::InvalidArgument(format!(
                        "observation ({i}, {v}) is outside the category range"
                    )));
                }
            }
        }

        let max_cats = num_categories.iter().copied().max().unwrap_or(1);
        let num_main: usize = (0..p)
            .map(|v| if is_ordinal[v] { num_categories[v] } else { 2 })
            .sum();
        let num_pairwise = p * (p - 1) / 2;

        let observations_f = observations.map(|x| x as f64);
        let observations_f_t = observations_f.transpose();

        let mut pair_index = Vec::with_capacity(num_pairwise);
        for v1 in 0..p.saturating_sub(1) {
            for v2 in v1 + 1..p {
                pair_index.push((v1, v2));
            }
        }

        let mut model = Self {
            n,
            p,
            observations,
            observations_f,
            observations_f_t,
            num_categories,
            is_ordinal,
            baseline_category,
            counts_per_category: DMatrix::zeros(max_cats + 1, p),
            blume_capel_stats: DMatrix::zeros(2, p),
            pairwise_stats: DMatrix::zeros(p, p),
            residual: DMatrix::zeros(n, p),
            main_effects: DMatrix::zeros(p, max_cats.max(2)),
            pairwise_effects: DMatrix::zeros(p, p),
            edge_indicators: initial_edge_indicators,
            inclusion_probability,
            main_alpha,
            main_beta,
            pairwise_scale,
            pairwise_scaling_factors: DMatrix::from_element(p, p, 1.0),
            edge_selection,
            edge_selection_active: false,
            num_main,
            num_pairwise,
            proposal_sd_main: DMatrix::from_element(p, max_cats.max(2), 1.0),
            proposal_sd_pairwise: DMatrix::from_element(p, p, 1.0),
            mh_adaptation_iters: None,
            rng: ChainRng::seed_from(0),
            inv_mass: DVector::from_element(num_main + num_pairwise, 1.0),
            missing_index: Vec::new(),
            grad_obs_cache: DVector::zeros(0),
            index_map: DMatrix::from_element(p, p, NO_PARAM),
            gradient_cache_valid: false,
            pair_index,
            shuffled_edge_order: (0..num_pairwise).collect(),
        };
        model.compute_sufficient_statistics();
        model.update_residual_matrix();
        Ok(model)
    }

    /// Register missing entries as (person, variable) pairs.
    pub fn set_missing_data(&mut self, missing_index: Vec<(usize, usize)>) -> Result<()> {
        for &(person, variable) in &missing_index {
            if person >= self.n || variable >= self.p {
                return Err(SamplerError::InvalidArgument(
                    "missing-data index out of bounds".into(),
                ));
            }
        }
        self.missing_index = missing_index;
        Ok(())
    }

    /// Per-pair multipliers on the Cauchy slab scale.
    pub fn set_pairwise_scaling_factors(&mut self, factors: DMatrix<f64>) -> Result<()> {
        if factors.nrows() != self.p || factors.ncols() != self.p {
            return Err(SamplerError::InvalidArgument(
                "scaling factor matrix has wrong dimensions".into(),
            ));
        }
        if factors.iter().any(|&f| f <= 0.0) {
            return Err(SamplerError::InvalidArgument(
                "scaling factors must be positive".into(),
            ));
        }
        self.pairwise_scaling_factors = factors;
        Ok(())
    }

    pub fn main_effects(&self) -> &DMatrix<f64> {
        &self.main_effects
    }

    pub fn pairwise_effects(&self) -> &DMatrix<f64> {
        &self.pairwise_effects
    }

    pub fn edge_indicator_matrix(&self) -> &DMatrix<u8> {
        &self.edge_indicators
    }

    pub fn residual_matrix(&self) -> &DMatrix<f64> {
        &self.residual
    }

    pub fn proposal_sd_pairwise(&self) -> &DMatrix<f64> {
        &self.proposal_sd_pairwise
    }

    pub fn proposal_sd_main(&self) -> &DMatrix<f64> {
        &self.proposal_sd_main
    }

    fn compute_sufficient_statistics(&mut self) {
        self.counts_per_category.fill(0);
        self.blume_capel_stats.fill(0);
        for v in 0..self.p {
            if self.is_ordinal[v] {
                for i in 0..self.n {
                    let cat = self.observations[(i, v)] as usize;
                    self.counts_per_category[(cat, v)] += 1;
                }
            } else {
                let baseline = self.baseline_category[v] as i64;
                for i in 0..self.n {
                    let s = self.observations[(i, v)] - baseline;
                    self.blume_capel_stats[(0, v)] += s;
                    self.blume_capel_stats[(1, v)] += s * s;
                }
            }
        }
        self.pairwise_stats = &self.observations_f_t * &self.observations_f;
    }

    fn update_residual_matrix(&mut self) {
        self.residual = &self.observations_f * &self.pairwise_effects;
    }

    fn update_residual_columns(&mut self, var1: usize, var2: usize, delta: f64) {
        for i in 0..self.n {
            self.residual[(i, var1)] += delta * self.observations_f[(i, var2)];
            self.residual[(i, var2)] += delta * self.observations_f[(i, var1)];
        }
    }

    fn invalidate_gradient_cache(&mut self) {
        self.gradient_cache_valid = false;
    }

    fn log_beta_prime(&self, x: f64) -> f64 {
        x * self.main_alpha - log1p_exp(x) * (self.main_alpha + self.main_beta)
    }

    fn scaled_pairwise_scale(&self, v1: usize, v2: usize) -> f64 {
        self.pairwise_scale * self.pairwise_scaling_factors[(v1, v2)]
    }

    fn count_active_edges(&self) -> usize {
        self.pair_index
            .iter()
            .filter(|&&(v1, v2)| self.edge_indicators[(v1, v2)] == 1)
            .count()
    }

    // -----------------------------------------------------------------
    // Vectorization
    // -----------------------------------------------------------------

    fn write_main_effects(&self, out: &mut DVector<f64>, mut offset: usize) -> usize {
        for v in 0..self.p {
            if self.is_ordinal[v] {
                for c in 0..self.num_categories[v] {
                    out[offset] = self.main_effects[(v, c)];
                    offset += 1;
                }
            } else {
                out[offset] = self.main_effects[(v, 0)];
                out[offset + 1] = self.main_effects[(v, 1)];
                offset += 2;
            }
        }
        offset
    }

    fn unvectorize_to_temps(
        &self,
        parameters: &DVector<f64>,
    ) -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>) {
        let mut temp_main = self.main_effects.clone();
        let mut temp_pairwise = DMatrix::zeros(self.p, self.p);
        let mut offset = 0;
        for v in 0..self.p {
            if self.is_ordinal[v] {
                for c in 0..self.num_categories[v] {
                    temp_main[(v, c)] = parameters[offset];
                    offset += 1;
                }
            } else {
                temp_main[(v, 0)] = parameters[offset];
                temp_main[(v, 1)] = parameters[offset + 1];
                offset += 2;
            }
        }
        for &(v1, v2) in &self.pair_index {
            if self.edge_indicators[(v1, v2)] == 1 {
                temp_pairwise[(v1, v2)] = parameters[offset];
                temp_pairwise[(v2, v1)] = parameters[offset];
                offset += 1;
            }
        }
        let temp_residual = &self.observations_f * &temp_pairwise;
        (temp_main, temp_pairwise, temp_residual)
    }

    // -----------------------------------------------------------------
    // Log pseudo-posterior
    // -----------------------------------------------------------------

    fn log_pseudoposterior_with_state(
        &self,
        main_eff: &DMatrix<f64>,
        pairwise_eff: &DMatrix<f64>,
        residual: &DMatrix<f64>,
    ) -> f64 {
        let mut log_post = 0.0;

        // Main effects: priors and sufficient-statistics terms.
        for v in 0..self.p {
            if self.is_ordinal[v] {
                for c in 0..self.num_categories[v] {
                    let value = main_eff[(v, c)];
                    log_post += self.log_beta_prime(value);
                    log_post += value * self.counts_per_category[(c + 1, v)] as f64;
                }
            } else {
                for k in 0..2 {
                    let value = main_eff[(v, k)];
                    log_post += self.log_beta_prime(value);
                    log_post += value * self.blume_capel_stats[(k, v)] as f64;
                }
            }
        }

        // Per-variable log-partition terms.
        for v in 0..self.p {
            let k = self.num_categories[v];
            let residual_col = col(residual, v);
            if self.is_ordinal[v] {
                let main: Vec<f64> = (0..k).map(|c| main_eff[(v, c)]).collect();
                let bound: Vec<f64> = residual_col.iter().map(|r| k as f64 * r).collect();
                match logz_probs_ordinal(&main, residual_col, &bound) {
                    Ok(out) => log_post -= out.log_z.sum(),
                    Err(err) => {
                        warn!("partition function failed for variable {v}: {err}");
                        return f64::NEG_INFINITY;
                    }
                }
            } else {
                match logz_probs_blume_capel(
                    residual_col,
                    main_eff[(v, 0)],
                    main_eff[(v, 1)],
                    self.baseline_category[v],
                    k,
                ) {
                    Ok(out) => log_post -= out.log_z.sum(),
                    Err(err) => {
                        warn!("partition function failed for variable {v}: {err}");
                        return f64::NEG_INFINITY;
                    }
                }
            }
        }

        // Pairwise effects: sufficient statistics and Cauchy slab.
        for &(v1, v2) in &self.pair_index {
            if self.edge_indicators[(v1, v2)] == 1 {
                let effect = pairwise_eff[(v1, v2)];
                log_post += 2.0 * self.pairwise_stats[(v1, v2)] * effect;
                log_post += log_cauchy_pdf(effect, self.scaled_pairwise_scale(v1, v2));
            }
        }

        log_post
    }

    /// Component log pseudo-posterior of a single main-effect parameter at a
    /// trial value. `idx` is the category for ordinal variables and 0/1 for
    /// the Blume-Capel linear/quadratic effect.
    fn main_component_logp(&self, v: usize, idx: usize, value: f64) -> f64 {
        let k = self.num_categories[v];
        let residual_col = col(&self.residual, v);

        if self.is_ordinal[v] {
            let mut main: Vec<f64> = (0..k).map(|c| self.main_effects[(v, c)]).collect();
            main[idx] = value;

            let mut log_post = value * self.counts_per_category[(idx + 1, v)] as f64;
            log_post += self.log_beta_prime(value);

            let bound: Vec<f64> = residual_col.iter().map(|r| k as f64 * r).collect();
            let denom = denom_ordinal(&main, residual_col, &bound);
            for i in 0..self.n {
                log_post -= bound[i] + denom[i].ln();
            }
            log_post
        } else {
            let lin = if idx == 0 { value } else { self.main_effects[(v, 0)] };
            let quad = if idx == 1 { value } else { self.main_effects[(v, 1)] };

            let mut log_post = value * self.blume_capel_stats[(idx, v)] as f64;
            log_post += self.log_beta_prime(value);

            let (denom, bound) =
                denom_blume_capel(residual_col, lin, quad, self.baseline_category[v], k);
            for i in 0..self.n {
                log_post -= bound[i] + denom[i].ln();
            }
            log_post
        }
    }

    /// Pairwise log pseudo-posterior evaluated with the pair (v1, v2)
    /// offset by `delta` from its current value.
    fn pairwise_logp_at_delta(&self, v1: usize, v2: usize, delta: f64) -> f64 {
        let proposed = self.pairwise_effects[(v1, v2)] + delta;
        let mut log_post = 2.0 * proposed * self.pairwise_stats[(v1, v2)];

        for &var in &[v1, v2] {
            let other = if var == v1 { v2 } else { v1 };
            let k = self.num_categories[var];
            let residual_col = col(&self.residual, var);
            let shifted: Vec<f64> = residual_col
                .iter()
                .enumerate()
                .map(|(i, r)| r + self.observations_f[(i, other)] * delta)
                .collect();

            if self.is_ordinal[var] {
                let main: Vec<f64> = (0..k).map(|c| self.main_effects[(var, c)]).collect();
                let bound: Vec<f64> = shifted.iter().map(|r| k as f64 * r).collect();
                let denom = denom_ordinal(&main, &shifted, &bound);
                for i in 0..self.n {
                    log_post -= denom[i].ln() + bound[i];
                }
            } else {
                let (denom, bound) = denom_blume_capel(
                    &shifted,
                    self.main_effects[(var, 0)],
                    self.main_effects[(var, 1)],
                    self.baseline_category[var],
                    k,
                );
                for i in 0..self.n {
                    log_post -= denom[i].ln() + bound[i];
                }
            }
        }

        if self.edge_indicators[(v1, v2)] == 1 {
            log_post += log_cauchy_pdf(proposed, self.scaled_pairwise_scale(v1, v2));
        }
        log_post
    }

    /// Pseudo-likelihood ratio of one variable's conditional between two
    /// values of an interaction coefficient.
    fn variable_log_ratio(
        &self,
        variable: usize,
        other: usize,
        proposed: f64,
        current: f64,
    ) -> f64 {
        let k = self.num_categories[variable];
        let residual_col = col(&self.residual, variable);

        // Linear predictor with the current interaction removed.
        let base: Vec<f64> = residual_col
            .iter()
            .enumerate()
            .map(|(i, r)| r - self.observations_f[(i, other)] * current)
            .collect();
        let with_current: Vec<f64> = base
            .iter()
            .enumerate()
            .map(|(i, b)| b + self.observations_f[(i, other)] * current)
            .collect();
        let with_proposed: Vec<f64> = base
            .iter()
            .enumerate()
            .map(|(i, b)| b + self.observations_f[(i, other)] * proposed)
            .collect();

        if self.is_ordinal[variable] {
            let main: Vec<f64> = (0..k).map(|c| self.main_effects[(variable, c)]).collect();
            // Shared bound from the interaction-free predictor cancels.
            let bound: Vec<f64> = base.iter().map(|b| k as f64 * b).collect();
            let denom_current = denom_ordinal(&main, &with_current, &bound);
            let denom_proposed = denom_ordinal(&main, &with_proposed, &bound);
            (0..self.n)
                .map(|i| denom_current[i].ln() - denom_proposed[i].ln())
                .sum()
        } else {
            let lin = self.main_effects[(variable, 0)];
            let quad = self.main_effects[(variable, 1)];
            let baseline = self.baseline_category[variable];
            let (denom_current, bound_current) =
                denom_blume_capel(&with_current, lin, quad, baseline, k);
            let (denom_proposed, bound_proposed) =
                denom_blume_capel(&with_proposed, lin, quad, baseline, k);
            (0..self.n)
                .map(|i| {
                    denom_current[i].ln() + bound_current[i]
                        - denom_proposed[i].ln()
                        - bound_proposed[i]
                })
                .sum()
        }
    }

    fn pairwise_log_ratio(&self, v1: usize, v2: usize, proposed: f64, current: f64) -> f64 {
        let delta = proposed - current;
        2.0 * self.pairwise_stats[(v1, v2)] * delta
            + self.variable_log_ratio(v1, v2, proposed, current)
            + self.variable_log_ratio(v2, v1, proposed, current)
    }

    // -----------------------------------------------------------------
    // Gradient
    // -----------------------------------------------------------------

    fn ensure_gradient_cache(&mut self) {
        if self.gradient_cache_valid {
            return;
        }

        self.index_map.fill(NO_PARAM);
        let mut num_active = 0;
        for &(i, j) in &self.pair_index {
            if self.edge_indicators[(i, j)] == 1 {
                self.index_map[(i, j)] = self.num_main + num_active;
                self.index_map[(j, i)] = self.index_map[(i, j)];
                num_active += 1;
            }
        }

        let mut grad_obs = DVector::zeros(self.num_main + num_active);
        let mut offset = 0;
        for v in 0..self.p {
            if self.is_ordinal[v] {
                for c in 0..self.num_categories[v] {
                    grad_obs[offset + c] = self.counts_per_category[(c + 1, v)] as f64;
                }
                offset += self.num_categories[v];
            } else {
                grad_obs[offset] = self.blume_capel_stats[(0, v)] as f64;
                grad_obs[offset + 1] = self.blume_capel_stats[(1, v)] as f64;
                offset += 2;
            }
        }
        for &(i, j) in &self.pair_index {
            if self.edge_indicators[(i, j)] == 1 {
                grad_obs[self.index_map[(i, j)]] = 2.0 * self.pairwise_stats[(i, j)];
            }
        }

        self.grad_obs_cache = grad_obs;
        self.gradient_cache_valid = true;
    }

    fn scatter_pairwise_gradient(
        &self,
        variable: usize,
        expected: &DVector<f64>,
        gradient: &mut DVector<f64>,
    ) {
        let pw_grad = &self.observations_f_t * expected;
        for j in 0..self.p {
            if j == variable || self.edge_indicators[(variable, j)] == 0 {
                continue;
            }
            let location = self.index_map[(variable, j)];
            if location != NO_PARAM {
                gradient[location] -= pw_grad[j];
            }
        }
    }

    fn prior_gradient(&self, temp_main: &DMatrix<f64>, temp_pairwise: &DMatrix<f64>, gradient: &mut DVector<f64>) {
        let mut offset = 0;
        for v in 0..self.p {
            let count = if self.is_ordinal[v] {
                self.num_categories[v]
            } else {
                2
            };
            for k in 0..count {
                let param = temp_main[(v, k)];
                let prob = 1.0 / (1.0 + (-param).exp());
                gradient[offset + k] +=
                    self.main_alpha - (self.main_alpha + self.main_beta) * prob;
            }
            offset += count;
        }
        for &(i, j) in &self.pair_index {
            if self.edge_indicators[(i, j)] == 0 {
                continue;
            }
            let location = self.index_map[(i, j)];
            let effect = temp_pairwise[(i, j)];
            let scale = self.scaled_pairwise_scale(i, j);
            gradient[location] -= 2.0 * effect / (effect * effect + scale * scale);
        }
    }

    // -----------------------------------------------------------------
    // Metropolis updates
    // -----------------------------------------------------------------

    fn update_main_effect_parameter(&mut self, v: usize, idx: usize) -> f64 {
        let current = self.main_effects[(v, idx)];
        let proposal_sd = self.proposal_sd_main[(v, idx)];

        let mut rng = self.rng.clone();
        let (value, accept_prob) = rwm_step(&mut rng, current, proposal_sd, |x| {
            self.main_component_logp(v, idx, x)
        });
        self.rng = rng;

        self.main_effects[(v, idx)] = value;
        accept_prob
    }

    fn update_pairwise_effect(&mut self, v1: usize, v2: usize) -> f64 {
        if self.edge_indicators[(v1, v2)] == 0 {
            return 1.0;
        }

        let current = self.pairwise_effects[(v1, v2)];
        let proposal_sd = self.proposal_sd_pairwise[(v1, v2)];

        let mut rng = self.rng.clone();
        let (value, accept_prob) = rwm_step(&mut rng, current, proposal_sd, |x| {
            self.pairwise_logp_at_delta(v1, v2, x - current)
        });
        self.rng = rng;

        if value != current {
            self.pairwise_effects[(v1, v2)] = value;
            self.pairwise_effects[(v2, v1)] = value;
            self.update_residual_columns(v1, v2, value - current);
        }
        accept_prob
    }

    fn update_edge_indicator(&mut self, v1: usize, v2: usize) {
        let current = self.pairwise_effects[(v1, v2)];
        let proposal_sd = self.proposal_sd_pairwise[(v1, v2)];
        let proposing_addition = self.edge_indicators[(v1, v2)] == 0;
        let proposed = if proposing_addition {
            self.rng.normal(current, proposal_sd)
        } else {
            0.0
        };

        let mut log_accept = self.pairwise_log_ratio(v1, v2, proposed, current);

        let incl = self.inclusion_probability[(v1, v2)];
        let scale = self.scaled_pairwise_scale(v1, v2);

        if proposing_addition {
            log_accept += log_cauchy_pdf(proposed, scale);
            log_accept -= log_normal_pdf(proposed, current, proposal_sd);
            log_accept += incl.ln() - (1.0 - incl).ln();
        } else {
            log_accept -= log_cauchy_pdf(current, scale);
            log_accept += log_normal_pdf(current, proposed, proposal_sd);
            log_accept -= incl.ln() - (1.0 - incl).ln();
        }

        if self.rng.uniform().ln() < log_accept {
            let updated = 1 - self.edge_indicators[(v1, v2)];
            self.edge_indicators[(v1, v2)] = updated;
            self.edge_indicators[(v2, v1)] = updated;

            self.pairwise_effects[(v1, v2)] = proposed;
            self.pairwise_effects[(v2, v1)] = proposed;

            self.update_residual_columns(v1, v2, proposed - current);
            self.invalidate_gradient_cache();
        }
    }

    fn adapt_after_sweep(&mut self, iteration: usize) -> bool {
        match self.mh_adaptation_iters {
            Some(total_warmup) => iteration >= 1 && iteration < total_warmup,
            None => false,
        }
    }
}

impl Model for OmrfModel {
    fn has_gradient(&self) -> bool {
        true
    }

    fn has_adaptive_mh(&self) -> bool {
        true
    }

    fn has_edge_selection(&self) -> bool {
        self.edge_selection
    }

    fn has_missing_data(&self) -> bool {
        !self.missing_index.is_empty()
    }

    fn logp(&mut self, parameters: &DVector<f64>) -> f64 {
        let (temp_main, temp_pairwise, temp_residual) = self.unvectorize_to_temps(parameters);
        self.log_pseudoposterior_with_state(&temp_main, &temp_pairwise, &temp_residual)
    }

    fn logp_and_gradient(&mut self, parameters: &DVector<f64>) -> (f64, DVector<f64>) {
        self.ensure_gradient_cache();
        let (temp_main, temp_pairwise, temp_residual) = self.unvectorize_to_temps(parameters);

        let mut log_pp = 0.0;
        let mut gradient = self.grad_obs_cache.clone();

        // Main effects: priors plus sufficient statistics.
        for v in 0..self.p {
            if self.is_ordinal[v] {
                for c in 0..self.num_categories[v] {
                    let value = temp_main[(v, c)];
                    log_pp += self.counts_per_category[(c + 1, v)] as f64 * value;
                    log_pp += self.log_beta_prime(value);
                }
            } else {
                for k in 0..2 {
                    let value = temp_main[(v, k)];
                    log_pp += self.blume_capel_stats[(k, v)] as f64 * value;
                    log_pp += self.log_beta_prime(value);
                }
            }
        }

        // Pairwise effects: priors plus sufficient statistics.
        for &(v1, v2) in &self.pair_index {
            if self.edge_indicators[(v1, v2)] == 0 {
                continue;
            }
            let value = temp_pairwise[(v1, v2)];
            log_pp += 2.0 * self.pairwise_stats[(v1, v2)] * value;
            log_pp += log_cauchy_pdf(value, self.scaled_pairwise_scale(v1, v2));
        }

        // Per-variable log-partition and expected statistics in one pass.
        let mut offset = 0;
        for v in 0..self.p {
            let k = self.num_categories[v];
            let residual_col = col(&temp_residual, v);

            if self.is_ordinal[v] {
                let main: Vec<f64> = (0..k).map(|c| temp_main[(v, c)]).collect();
                let bound: Vec<f64> = residual_col.iter().map(|r| k as f64 * r).collect();
                let out = match logz_probs_ordinal(&main, residual_col, &bound) {
                    Ok(out) => out,
                    Err(err) => {
                        warn!("partition function failed for variable {v}: {err}");
                        return (f64::NEG_INFINITY, DVector::zeros(gradient.len()));
                    }
                };
                log_pp -= out.log_z.sum();

                for c in 0..k {
                    gradient[offset + c] -= out.probs.column(c + 1).sum();
                }

                // Expected interaction score per observation.
                let mut expected = DVector::zeros(self.n);
                for c in 1..=k {
                    for i in 0..self.n {
                        expected[i] += c as f64 * out.probs[(i, c)];
                    }
                }
                self.scatter_pairwise_gradient(v, &expected, &mut gradient);
                offset += k;
            } else {
                let baseline = self.baseline_category[v];
                let out = match logz_probs_blume_capel(
                    residual_col,
                    temp_main[(v, 0)],
                    temp_main[(v, 1)],
                    baseline,
                    k,
                ) {
                    Ok(out) => out,
                    Err(err) => {
                        warn!("partition function failed for variable {v}: {err}");
                        return (f64::NEG_INFINITY, DVector::zeros(gradient.len()));
                    }
                };
                log_pp -= out.log_z.sum();

                let mut expected = DVector::zeros(self.n);
                let mut expected_sq_sum = 0.0;
                for c in 0..=k {
                    let score = c as f64 - baseline as f64;
                    for i in 0..self.n {
                        let term = out.probs[(i, c)];
                        expected[i] += score * term;
                        expected_sq_sum += score * score * term;
                    }
                }
                gradient[offset] -= expected.sum();
                gradient[offset + 1] -= expected_sq_sum;

                self.scatter_pairwise_gradient(v, &expected, &mut gradient);
                offset += 2;
            }
        }

        self.prior_gradient(&temp_main, &temp_pairwise, &mut gradient);
        (log_pp, gradient)
    }

    fn do_one_mh_step(&mut self, iteration: usize) {
        let adapt = self.adapt_after_sweep(iteration);
        let weight = rm_weight(iteration);

        // Pairwise sweep.
        for idx in 0..self.pair_index.len() {
            let (v1, v2) = self.pair_index[idx];
            let accept_prob = self.update_pairwise_effect(v1, v2);
            if adapt && self.edge_indicators[(v1, v2)] == 1 {
                let sd = robbins_monro_sd(
                    self.proposal_sd_pairwise[(v1, v2)],
                    accept_prob.ln(),
                    weight,
                    RWM_TARGET_ACCEPT,
                );
                self.proposal_sd_pairwise[(v1, v2)] = sd;
                self.proposal_sd_pairwise[(v2, v1)] = sd;
            }
        }

        // Main-effect sweep.
        for v in 0..self.p {
            let count = if self.is_ordinal[v] {
                self.num_categories[v]
            } else {
                2
            };
            for idx in 0..count {
                let accept_prob = self.update_main_effect_parameter(v, idx);
                if adapt {
                    self.proposal_sd_main[(v, idx)] = robbins_monro_sd(
                        self.proposal_sd_main[(v, idx)],
                        accept_prob.ln(),
                        weight,
                        RWM_TARGET_ACCEPT,
                    );
                }
            }
        }

        self.invalidate_gradient_cache();
    }

    fn prepare_iteration(&mut self) {
        // Advances the chain RNG whether or not the order is consumed.
        self.shuffled_edge_order = self.rng.permutation(self.num_pairwise);
    }

    fn init_warmup(&mut self, schedule: &WarmupSchedule) {
        self.mh_adaptation_iters = Some(schedule.total_warmup);
    }

    fn tune_proposal_sd(&mut self, iteration: usize, schedule: &WarmupSchedule) {
        if !schedule.adapt_proposal_sd(iteration) {
            return;
        }

        let t = iteration - schedule.stage3b_start + 1;
        let weight = rm_weight(t);

        for idx in 0..self.pair_index.len() {
            let (v1, v2) = self.pair_index[idx];
            let current = self.pairwise_effects[(v1, v2)];
            let proposal_sd = self.proposal_sd_pairwise[(v1, v2)];

            let mut rng = self.rng.clone();
            let (value, accept_prob) = rwm_step(&mut rng, current, proposal_sd, |x| {
                self.pairwise_logp_at_delta(v1, v2, x - current)
            });
            self.rng = rng;

            if value != current {
                self.pairwise_effects[(v1, v2)] = value;
                self.pairwise_effects[(v2, v1)] = value;
                self.update_residual_columns(v1, v2, value - current);
            }

            let sd = robbins_monro_sd(proposal_sd, accept_prob.ln(), weight, RWM_TARGET_ACCEPT);
            self.proposal_sd_pairwise[(v1, v2)] = sd;
            self.proposal_sd_pairwise[(v2, v1)] = sd;
        }

        self.invalidate_gradient_cache();
    }

    fn parameter_dimension(&self) -> usize {
        self.num_main + self.count_active_edges()
    }

    fn full_parameter_dimension(&self) -> usize {
        self.num_main + self.num_pairwise
    }

    fn vectorized_parameters(&self) -> DVector<f64> {
        let mut out = DVector::zeros(self.parameter_dimension());
        let mut offset = self.write_main_effects(&mut out, 0);
        for &(v1, v2) in &self.pair_index {
            if self.edge_indicators[(v1, v2)] == 1 {
                out[offset] = self.pairwise_effects[(v1, v2)];
                offset += 1;
            }
        }
        out
    }

    fn set_vectorized_parameters(&mut self, parameters: &DVector<f64>) {
        let mut offset = 0;
        for v in 0..self.p {
            if self.is_ordinal[v] {
                for c in 0..self.num_categories[v] {
                    self.main_effects[(v, c)] = parameters[offset];
                    offset += 1;
                }
            } else {
                self.main_effects[(v, 0)] = parameters[offset];
                self.main_effects[(v, 1)] = parameters[offset + 1];
                offset += 2;
            }
        }
        for idx in 0..self.pair_index.len() {
            let (v1, v2) = self.pair_index[idx];
            if self.edge_indicators[(v1, v2)] == 1 {
                self.pairwise_effects[(v1, v2)] = parameters[offset];
                self.pairwise_effects[(v2, v1)] = parameters[offset];
                offset += 1;
            }
        }
        self.update_residual_matrix();
        self.invalidate_gradient_cache();
    }

    fn full_vectorized_parameters(&self) -> DVector<f64> {
        let mut out = DVector::zeros(self.full_parameter_dimension());
        let mut offset = self.write_main_effects(&mut out, 0);
        for &(v1, v2) in &self.pair_index {
            out[offset] = self.pairwise_effects[(v1, v2)];
            offset += 1;
        }
        out
    }

    fn vectorized_indicators(&self) -> Vec<u8> {
        strict_upper_indicators(&self.edge_indicators)
    }

    fn update_edge_indicators(&mut self) {
        for i in 0..self.num_pairwise {
            let idx = self.shuffled_edge_order[i];
            let (v1, v2) = self.pair_index[idx];
            self.update_edge_indicator(v1, v2);
        }
    }

    fn set_edge_selection_active(&mut self, active: bool) {
        self.edge_selection_active = active;
    }

    fn initialize_graph(&mut self) {
        for idx in 0..self.pair_index.len() {
            let (v1, v2) = self.pair_index[idx];
            let pr = self.inclusion_probability[(v1, v2)];
            let draw = u8::from(self.rng.uniform() < pr);
            self.edge_indicators[(v1, v2)] = draw;
            self.edge_indicators[(v2, v1)] = draw;
            if draw == 0 {
                self.pairwise_effects[(v1, v2)] = 0.0;
                self.pairwise_effects[(v2, v1)] = 0.0;
            }
        }
        self.update_residual_matrix();
        self.invalidate_gradient_cache();
    }

    fn impute_missing(&mut self) {
        if self.missing_index.is_empty() {
            return;
        }

        let max_cats = self.num_categories.iter().copied().max().unwrap_or(1);
        let mut cumulative = vec![0.0; max_cats + 1];

        for m in 0..self.missing_index.len() {
            let (person, variable) = self.missing_index[m];
            let residual_score = self.residual[(person, variable)];
            let k = self.num_categories[variable];

            // Cumulative unnormalized conditional over categories.
            let total = if self.is_ordinal[variable] {
                let mut cumsum = 1.0;
                cumulative[0] = cumsum;
                for cat in 0..k {
                    let score = (cat + 1) as f64;
                    let exponent = self.main_effects[(variable, cat)] + score * residual_score;
                    cumsum += exponent.exp();
                    cumulative[cat + 1] = cumsum;
                }
                cumsum
            } else {
                let baseline = self.baseline_category[variable] as f64;
                let lin = self.main_effects[(variable, 0)];
                let quad = self.main_effects[(variable, 1)];
                let mut cumsum = 0.0;
                for cat in 0..=k {
                    let score = cat as f64 - baseline;
                    let exponent = lin * score + quad * score * score + score * residual_score;
                    cumsum += exponent.exp();
                    cumulative[cat] = cumsum;
                }
                cumsum
            };

            let u = self.rng.uniform() * total;
            let mut sampled = 0usize;
            while u > cumulative[sampled] && sampled < k {
                sampled += 1;
            }

            let new_value = sampled as i64;
            let old_value = self.observations[(person, variable)];
            if new_value == old_value {
                continue;
            }

            self.observations[(person, variable)] = new_value;
            self.observations_f[(person, variable)] = new_value as f64;
            self.observations_f_t[(variable, person)] = new_value as f64;

            if self.is_ordinal[variable] {
                self.counts_per_category[(old_value as usize, variable)] -= 1;
                self.counts_per_category[(new_value as usize, variable)] += 1;
            } else {
                let baseline = self.baseline_category[variable] as i64;
                let new_s = new_value - baseline;
                let old_s = old_value - baseline;
                self.blume_capel_stats[(0, variable)] += new_s - old_s;
                self.blume_capel_stats[(1, variable)] += new_s * new_s - old_s * old_s;
            }

            let delta = (new_value - old_value) as f64;
            for var in 0..self.p {
                self.residual[(person, var)] += delta * self.pairwise_effects[(var, variable)];
            }
        }

        self.pairwise_stats = &self.observations_f_t * &self.observations_f;
        self.invalidate_gradient_cache();
    }

    fn num_variables(&self) -> usize {
        self.p
    }

    fn num_pairwise(&self) -> usize {
        self.num_pairwise
    }

    fn update_edge_prior(&mut self, prior: &mut EdgePrior) {
        prior.update(
            &self.edge_indicators,
            &mut self.inclusion_probability,
            self.p,
            self.num_pairwise,
            &mut self.rng,
        );
    }

    fn set_inv_mass(&mut self, inv_mass: DVector<f64>) {
        self.inv_mass = inv_mass;
    }

    fn active_inv_mass(&self) -> DVector<f64> {
        if !self.edge_selection_active {
            return self.inv_mass.clone();
        }

        let mut out = DVector::zeros(self.parameter_dimension());
        for i in 0..self.num_main {
            out[i] = self.inv_mass[i];
        }
        let mut offset_full = self.num_main;
        let mut offset_active = self.num_main;
        for &(v1, v2) in &self.pair_index {
            if self.edge_indicators[(v1, v2)] == 1 {
                out[offset_active] = self.inv_mass[offset_full];
                offset_active += 1;
            }
            offset_full += 1;
        }
        out
    }

    fn set_seed(&mut self, seed: u64) {
        self.rng = ChainRng::seed_from(seed);
    }

    fn rng_mut(&mut self) -> &mut ChainRng {
        &mut self.rng
    }
}
