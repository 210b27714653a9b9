//! Gaussian graphical model: element-wise Metropolis sampling of the
//! precision matrix with an incrementally maintained Cholesky factor.
//!
//! Each off-diagonal move reparametrizes `(omega_ij, omega_jj)` through a
//! scalar auxiliary so the proposal stays inside the positive-definite
//! cone; the constrained diagonal keeps the Schur complement fixed. After
//! an accepted move the factor is adjusted by a symmetric rank-2 (or
//! rank-1) update and the inverse refreshed from a triangular solve, so
//! likelihood ratios reduce to 2×2 determinants.

use log::warn;
use nalgebra::{Cholesky, DMatrix, DVector};

use crate::adapt::AdaptiveProposal;
use crate::chol::{rank_one_downdate, rank_one_update, rank_two_update};
use crate::edge_prior::EdgePrior;
use crate::errors::{Result, SamplerError};
use crate::math::{log_cauchy_pdf, log_gamma_pdf, log_normal_pdf};
use crate::model::{strict_upper_indicators, validate_edge_inputs, Model};
use crate::rng::ChainRng;

const ADAPTATION_WINDOW: usize = 500;

#[derive(Clone)]
pub struct GgmModel {
    n: usize,
    p: usize,
    /// Upper triangle including the diagonal: p(p+1)/2 parameters.
    dim: usize,
    suf_stat: DMatrix<f64>,
    inclusion_probability: DMatrix<f64>,
    edge_selection: bool,
    edge_selection_active: bool,
    pairwise_scale: f64,

    precision: DMatrix<f64>,
    /// Upper-triangular factor with `cholᵀ · chol == precision`.
    chol: DMatrix<f64>,
    inv_chol: DMatrix<f64>,
    /// `precision⁻¹`, maintained as `inv_chol · inv_cholᵀ`.
    covariance: DMatrix<f64>,
    edge_indicators: DMatrix<u8>,

    proposal: AdaptiveProposal,
    rng: ChainRng,

    // Scratch for proposals and factor updates.
    precision_proposal: DMatrix<f64>,
    chol_backup: DMatrix<f64>,
    // [0] Phi*, [1] Phi**, [2] omega_ij - Phi* Phi**, [3] Phi**,
    // [4] omega_jj - Phi*^2, [5] constrained diagonal at x = 0.
    constants: [f64; 6],
    vf1: DVector<f64>,
    vf2: DVector<f64>,
}

impl GgmModel {
    /// Construct from raw observations (n × p).
    pub fn new(
        observations: &DMatrix<f64>,
        inclusion_probability: DMatrix<f64>,
        initial_edge_indicators: DMatrix<u8>,
        edge_selection: bool,
        pairwise_scale: f64,
    ) -> Result<Self> {
        let suf_stat = observations.transpose() * observations;
        Self::from_suf_stat(
            observations.nrows(),
            suf_stat,
            inclusion_probability,
            initial_edge_indicators,
            edge_selection,
            pairwise_scale,
        )
    }

    /// Construct from the sufficient statistics (n, XᵀX).
    pub fn from_suf_stat(
        n: usize,
        suf_stat: DMatrix<f64>,
        inclusion_probability: DMatrix<f64>,
        initial_edge_indicators: DMatrix<u8>,
        edge_selection: bool,
        pairwise_scale: f64,
    ) -> Result<Self> {
        let p = suf_stat.ncols();
        if p == 0 {
            return Err(SamplerError::InvalidArgument(
                "at least one variable is required".into(),
            ));
        }
        if suf_stat.nrows() != p {
            return Err(SamplerError::InvalidArgument(
                "sufficient statistic matrix must be square".into(),
            ));
        }
        for i in 0..p {
            for j in 0..p {
                if (suf_stat[(i, j)] - suf_stat[(j, i)]).abs() > 1e-8 {
                    return Err(SamplerError::InvalidArgument(
                        "sufficient statistic matrix must be symmetric".into(),
                    ));
                }
            }
        }
        validate_edge_inputs(&inclusion_probability, &initial_edge_indicators, p)?;
        if pairwise_scale <= 0.0 {
            return Err(SamplerError::InvalidArgument(
                "pairwise scale must be positive".into(),
            ));
        }

        let dim = p * (p + 1) / 2;
        Ok(Self {
            n,
            p,
            dim,
            suf_stat,
            inclusion_probability,
            edge_selection,
            edge_selection_active: false,
            pairwise_scale,
            precision: DMatrix::identity(p, p),
            chol: DMatrix::identity(p, p),
            inv_chol: DMatrix::identity(p, p),
            covariance: DMatrix::identity(p, p),
            edge_indicators: initial_edge_indicators,
            proposal: AdaptiveProposal::new(dim, ADAPTATION_WINDOW),
            rng: ChainRng::seed_from(0),
            precision_proposal: DMatrix::zeros(p, p),
            chol_backup: DMatrix::zeros(p, p),
            constants: [0.0; 6],
            vf1: DVector::zeros(p),
            vf2: DVector::zeros(p),
        })
    }

    pub fn precision_matrix(&self) -> &DMatrix<f64> {
        &self.precision
    }

    pub fn cholesky_factor(&self) -> &DMatrix<f64> {
        &self.chol
    }

    pub fn covariance_matrix(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn edge_indicator_matrix(&self) -> &DMatrix<u8> {
        &self.edge_indicators
    }

    /// `(n/2)·ln det Ω − tr(S·Ω)/2`, up to an Ω-free constant.
    pub fn log_likelihood(&self) -> f64 {
        let logdet = self.log_det();
        let trace_prod = self.precision.dot(&self.suf_stat);
        0.5 * (self.n as f64 * logdet - trace_prod)
    }

    fn log_det(&self) -> f64 {
        2.0 * (0..self.p).map(|k| self.chol[(k, k)].ln()).sum::<f64>()
    }

    /// Entry (ii, jj) of the inverse of the submatrix of `covariance` with
    /// row/column `i` removed, up to the shared determinant factor.
    fn inv_submatrix_entry(&self, i: usize, ii: usize, jj: usize) -> f64 {
        let a = &self.covariance;
        a[(ii, jj)] - a[(ii, i)] * a[(jj, i)] / a[(i, i)]
    }

    /// Reparametrization constants for the pair (i, j), from the maintained
    /// factor and inverse on the log scale.
    fn compute_constants(&mut self, i: usize, j: usize) {
        let logdet = self.log_det();
        let cov = &self.covariance;

        let log_adj_ii = logdet + cov[(i, i)].abs().ln();
        let log_adj_ij = logdet + cov[(i, j)].abs().ln();
        let log_adj_jj = logdet + cov[(j, j)].abs().ln();

        let inv_sub_jj = self.inv_submatrix_entry(i, j, j);
        let log_abs_inv_sub_jj = log_adj_ii + inv_sub_jj.abs().ln();

        let sign = if cov[(i, j)].is_sign_negative() { 1.0 } else { -1.0 };
        let phi_star = sign * (log_adj_ij - (log_adj_jj + log_abs_inv_sub_jj) / 2.0).exp();
        let phi_dbl_star = ((log_adj_jj - log_abs_inv_sub_jj) / 2.0).exp();

        self.constants[0] = phi_star;
        self.constants[1] = phi_dbl_star;
        self.constants[2] = self.precision[(i, j)] - phi_star * phi_dbl_star;
        self.constants[3] = phi_dbl_star;
        self.constants[4] = self.precision[(j, j)] - phi_star * phi_star;
        self.constants[5] =
            self.constants[4] + self.constants[2] * self.constants[2]
                / (self.constants[3] * self.constants[3]);
    }

    /// Diagonal value omega_jj that keeps the precision matrix positive
    /// definite after the off-diagonal moves to `x`.
    fn constrained_diagonal(&self, x: f64) -> f64 {
        if x == 0.0 {
            self.constants[5]
        } else {
            let c = &self.constants;
            c[4] + ((x - c[2]) / c[3]).powi(2)
        }
    }

    /// Log-likelihood ratio for the proposal touching (i, j) and (j, j),
    /// from the 2×2 determinant of the altered submatrix.
    fn edge_log_ratio(&self, i: usize, j: usize) -> f64 {
        let u_i2 = self.precision[(i, j)] - self.precision_proposal[(i, j)];
        let u_j2 = (self.precision[(j, j)] - self.precision_proposal[(j, j)]) / 2.0;
        let cov = &self.covariance;

        let cc11 = cov[(j, j)];
        let cc12 = 1.0 - (cov[(i, j)] * u_i2 + cov[(j, j)] * u_j2);
        let cc22 = u_i2 * u_i2 * cov[(i, i)]
            + 2.0 * u_i2 * u_j2 * cov[(i, j)]
            + u_j2 * u_j2 * cov[(j, j)];

        let logdet = (cc11 * cc22 - cc12 * cc12).abs().ln();
        let trace_prod = -2.0 * (self.suf_stat[(j, j)] * u_j2 + self.suf_stat[(i, j)] * u_i2);

        (self.n as f64 * logdet - trace_prod) / 2.0
    }

    /// Same ratio for a diagonal-only proposal (u_i2 = 0).
    fn diag_log_ratio(&self, j: usize) -> f64 {
        let u_j2 = (self.precision[(j, j)] - self.precision_proposal[(j, j)]) / 2.0;
        let cov_jj = self.covariance[(j, j)];

        let cc11 = cov_jj;
        let cc12 = 1.0 - cov_jj * u_j2;
        let cc22 = u_j2 * u_j2 * cov_jj;

        let logdet = (cc11 * cc22 - cc12 * cc12).abs().ln();
        let trace_prod = -2.0 * self.suf_stat[(j, j)] * u_j2;

        (self.n as f64 * logdet - trace_prod) / 2.0
    }

    fn refresh_inverse(&mut self) {
        let identity = DMatrix::identity(self.p, self.p);
        match self.chol.solve_upper_triangular(&identity) {
            Some(inv) => self.inv_chol = inv,
            None => {
                warn!("triangular inverse failed; refactorizing the precision matrix");
                if let Some(ch) = Cholesky::new(self.precision.clone()) {
                    self.chol = ch.l().transpose();
                    if let Some(inv) = self.chol.solve_upper_triangular(&identity) {
                        self.inv_chol = inv;
                    }
                }
            }
        }
        self.covariance = &self.inv_chol * self.inv_chol.transpose();
    }

    /// Rank-2 factor adjustment after a move on (i, j)/(j, j). Restores the
    /// factor and reports false when the downdate loses positive
    /// definiteness, so the caller can reject the move.
    fn factor_update_after_edge(
        &mut self,
        omega_ij_old: f64,
        omega_jj_old: f64,
        i: usize,
        j: usize,
    ) -> bool {
        self.vf1[j] = -1.0;
        self.vf2[i] = omega_ij_old - self.precision_proposal[(i, j)];
        self.vf2[j] = (omega_jj_old - self.precision_proposal[(j, j)]) / 2.0;

        self.chol_backup.copy_from(&self.chol);
        let outcome = rank_two_update(&mut self.chol, &self.vf1, &self.vf2);

        self.vf1[j] = 0.0;
        self.vf2[i] = 0.0;
        self.vf2[j] = 0.0;

        match outcome {
            Ok(()) => {
                self.refresh_inverse();
                true
            }
            Err(err) => {
                warn!("rejecting precision move on ({i}, {j}): {err}");
                self.chol.copy_from(&self.chol_backup);
                false
            }
        }
    }

    fn factor_update_after_diag(&mut self, omega_ii_old: f64, i: usize) -> bool {
        let delta = omega_ii_old - self.precision_proposal[(i, i)];
        self.vf1[i] = delta.abs().sqrt();

        self.chol_backup.copy_from(&self.chol);
        let outcome = if delta > 0.0 {
            rank_one_downdate(&mut self.chol, &self.vf1)
        } else {
            rank_one_update(&mut self.chol, &self.vf1);
            Ok(())
        };
        self.vf1[i] = 0.0;

        match outcome {
            Ok(()) => {
                self.refresh_inverse();
                true
            }
            Err(err) => {
                warn!("rejecting diagonal move on ({i}, {i}): {err}");
                self.chol.copy_from(&self.chol_backup);
                false
            }
        }
    }

    fn update_edge_parameter(&mut self, i: usize, j: usize) {
        if self.edge_indicators[(i, j)] == 0 {
            return;
        }

        self.compute_constants(i, j);
        let phi_star = self.constants[0];

        let e = j * (j + 1) / 2 + i;
        let proposal_sd = self.proposal.proposal_sd(e);

        let phi_prop = self.rng.normal(phi_star, proposal_sd);
        let omega_prop_ij = self.constants[2] + self.constants[3] * phi_prop;
        let omega_prop_jj = self.constrained_diagonal(omega_prop_ij);

        self.precision_proposal.copy_from(&self.precision);
        self.precision_proposal[(i, j)] = omega_prop_ij;
        self.precision_proposal[(j, i)] = omega_prop_ij;
        self.precision_proposal[(j, j)] = omega_prop_jj;

        let mut ln_alpha = self.edge_log_ratio(i, j);
        ln_alpha += log_cauchy_pdf(omega_prop_ij, self.pairwise_scale);
        ln_alpha -= log_cauchy_pdf(self.precision[(i, j)], self.pairwise_scale);

        if self.rng.uniform().ln() < ln_alpha {
            let omega_ij_old = self.precision[(i, j)];
            let omega_jj_old = self.precision[(j, j)];

            self.precision[(i, j)] = omega_prop_ij;
            self.precision[(j, i)] = omega_prop_ij;
            self.precision[(j, j)] = omega_prop_jj;

            if self.factor_update_after_edge(omega_ij_old, omega_jj_old, i, j) {
                self.proposal.increment_accepts(e);
            } else {
                self.precision[(i, j)] = omega_ij_old;
                self.precision[(j, i)] = omega_ij_old;
                self.precision[(j, j)] = omega_jj_old;
            }
        }

        self.proposal.update_proposal_sd(e);
    }

    fn update_diagonal_parameter(&mut self, i: usize) {
        let logdet = self.log_det();
        let logdet_sub_ii = logdet + self.covariance[(i, i)].ln();

        let e = i * (i + 3) / 2;
        let proposal_sd = self.proposal.proposal_sd(e);

        let theta_curr = (logdet - logdet_sub_ii) / 2.0;
        let theta_prop = self.rng.normal(theta_curr, proposal_sd);

        self.precision_proposal.copy_from(&self.precision);
        self.precision_proposal[(i, i)] = self.precision[(i, i)]
            - (2.0 * theta_curr).exp()
            + (2.0 * theta_prop).exp();

        let mut ln_alpha = self.diag_log_ratio(i);
        ln_alpha += log_gamma_pdf(theta_prop.exp(), 1.0, 1.0);
        ln_alpha -= log_gamma_pdf(theta_curr.exp(), 1.0, 1.0);
        // Jacobian of the log-scale proposal
        ln_alpha += theta_prop - theta_curr;

        if self.rng.uniform().ln() < ln_alpha {
            let omega_ii_old = self.precision[(i, i)];
            self.precision[(i, i)] = self.precision_proposal[(i, i)];

            if self.factor_update_after_diag(omega_ii_old, i) {
                self.proposal.increment_accepts(e);
            } else {
                self.precision[(i, i)] = omega_ii_old;
            }
        }

        self.proposal.update_proposal_sd(e);
    }

    fn update_edge_indicator_pair(&mut self, i: usize, j: usize) {
        let e = j * (j + 1) / 2 + i;
        let proposal_sd = self.proposal.proposal_sd(e);
        let incl = self.inclusion_probability[(i, j)];

        if self.edge_indicators[(i, j)] == 1 {
            // Propose to turn the edge off.
            self.precision_proposal.copy_from(&self.precision);
            self.precision_proposal[(i, j)] = 0.0;
            self.precision_proposal[(j, i)] = 0.0;

            self.compute_constants(i, j);
            self.precision_proposal[(j, j)] = self.constrained_diagonal(0.0);

            let mut ln_alpha = self.edge_log_ratio(i, j);
            ln_alpha += (1.0 - incl).ln() - incl.ln();
            ln_alpha += log_normal_pdf(self.precision[(i, j)] / self.constants[3], 0.0, proposal_sd)
                - self.constants[3].ln();
            ln_alpha -= log_cauchy_pdf(self.precision[(i, j)], self.pairwise_scale);

            if self.rng.uniform().ln() < ln_alpha {
                let omega_ij_old = self.precision[(i, j)];
                let omega_jj_old = self.precision[(j, j)];

                self.precision[(i, j)] = 0.0;
                self.precision[(j, i)] = 0.0;
                self.precision[(j, j)] = self.precision_proposal[(j, j)];
                self.edge_indicators[(i, j)] = 0;
                self.edge_indicators[(j, i)] = 0;

                if !self.factor_update_after_edge(omega_ij_old, omega_jj_old, i, j) {
                    self.precision[(i, j)] = omega_ij_old;
                    self.precision[(j, i)] = omega_ij_old;
                    self.precision[(j, j)] = omega_jj_old;
                    self.edge_indicators[(i, j)] = 1;
                    self.edge_indicators[(j, i)] = 1;
                }
            }
        } else {
            // Propose to turn the edge on.
            let epsilon = self.rng.normal(0.0, proposal_sd);

            self.compute_constants(i, j);
            let omega_prop_ij = self.constants[3] * epsilon;
            let omega_prop_jj = self.constrained_diagonal(omega_prop_ij);

            self.precision_proposal.copy_from(&self.precision);
            self.precision_proposal[(i, j)] = omega_prop_ij;
            self.precision_proposal[(j, i)] = omega_prop_ij;
            self.precision_proposal[(j, j)] = omega_prop_jj;

            let mut ln_alpha = self.edge_log_ratio(i, j);
            ln_alpha += incl.ln() - (1.0 - incl).ln();
            ln_alpha += log_cauchy_pdf(omega_prop_ij, self.pairwise_scale);
            ln_alpha -= log_normal_pdf(omega_prop_ij / self.constants[3], 0.0, proposal_sd)
                - self.constants[3].ln();

            if self.rng.uniform().ln() < ln_alpha {
                self.proposal.increment_accepts(e);

                let omega_ij_old = self.precision[(i, j)];
                let omega_jj_old = self.precision[(j, j)];

                self.precision[(i, j)] = omega_prop_ij;
                self.precision[(j, i)] = omega_prop_ij;
                self.precision[(j, j)] = omega_prop_jj;
                self.edge_indicators[(i, j)] = 1;
                self.edge_indicators[(j, i)] = 1;

                if !self.factor_update_after_edge(omega_ij_old, omega_jj_old, i, j) {
                    self.precision[(i, j)] = omega_ij_old;
                    self.precision[(j, i)] = omega_ij_old;
                    self.precision[(j, j)] = omega_jj_old;
                    self.edge_indicators[(i, j)] = 0;
                    self.edge_indicators[(j, i)] = 0;
                }
            }
        }
    }

    fn packed_upper_triangle(&self) -> DVector<f64> {
        let mut out = DVector::zeros(self.dim);
        let mut e = 0;
        for j in 0..self.p {
            for i in 0..=j {
                out[e] = self.precision[(i, j)];
                e += 1;
            }
        }
        out
    }
}

impl Model for GgmModel {
    fn has_adaptive_mh(&self) -> bool {
        true
    }

    fn has_edge_selection(&self) -> bool {
        self.edge_selection
    }

    // Component-wise sampling only; the joint density is never evaluated
    // through the vectorized interface.
    fn logp(&mut self, _parameters: &DVector<f64>) -> f64 {
        0.0
    }

    fn do_one_mh_step(&mut self, _iteration: usize) {
        for i in 0..self.p.saturating_sub(1) {
            for j in i + 1..self.p {
                self.update_edge_parameter(i, j);
            }
        }

        for i in 0..self.p {
            self.update_diagonal_parameter(i);
        }

        if self.edge_selection_active {
            for i in 0..self.p - 1 {
                for j in i + 1..self.p {
                    self.update_edge_indicator_pair(i, j);
                }
            }
        }

        self.proposal.increment_iteration();
    }

    fn parameter_dimension(&self) -> usize {
        self.dim
    }

    fn full_parameter_dimension(&self) -> usize {
        self.dim
    }

    fn vectorized_parameters(&self) -> DVector<f64> {
        self.packed_upper_triangle()
    }

    fn set_vectorized_parameters(&mut self, parameters: &DVector<f64>) {
        let mut e = 0;
        for j in 0..self.p {
            for i in 0..=j {
                self.precision[(i, j)] = parameters[e];
                self.precision[(j, i)] = parameters[e];
                e += 1;
            }
        }
        if let Some(ch) = Cholesky::new(self.precision.clone()) {
            self.chol = ch.l().transpose();
            self.refresh_inverse();
        }
    }

    fn full_vectorized_parameters(&self) -> DVector<f64> {
        self.packed_upper_triangle()
    }

    fn vectorized_indicators(&self) -> Vec<u8> {
        strict_upper_indicators(&self.edge_indicators)
    }

    fn set_edge_selection_active(&mut self, active: bool) {
        self.edge_selection_active = active;
    }

    fn initialize_graph(&mut self) {
        for i in 0..self.p.saturating_sub(1) {
            for j in i + 1..self.p {
                let pr = self.inclusion_probability[(i, j)];
                let previous = self.edge_indicators[(i, j)];
                let draw = u8::from(self.rng.uniform() < pr);
                self.edge_indicators[(i, j)] = draw;
                self.edge_indicators[(j, i)] = draw;
                if draw == 0 {
                    self.precision_proposal.copy_from(&self.precision);
                    self.precision_proposal[(i, j)] = 0.0;
                    self.precision_proposal[(j, i)] = 0.0;
                    self.compute_constants(i, j);
                    self.precision_proposal[(j, j)] = self.constrained_diagonal(0.0);

                    let omega_ij_old = self.precision[(i, j)];
                    let omega_jj_old = self.precision[(j, j)];
                    self.precision[(j, j)] = self.precision_proposal[(j, j)];
                    self.precision[(i, j)] = 0.0;
                    self.precision[(j, i)] = 0.0;
                    if !self.factor_update_after_edge(omega_ij_old, omega_jj_old, i, j) {
                        self.precision[(i, j)] = omega_ij_old;
                        self.precision[(j, i)] = omega_ij_old;
                        self.precision[(j, j)] = omega_jj_old;
                        self.edge_indicators[(i, j)] = previous;
                        self.edge_indicators[(j, i)] = previous;
                    }
                }
            }
        }
    }

    fn num_variables(&self) -> usize {
        self.p
    }

    fn update_edge_prior(&mut self, prior: &mut EdgePrior) {
        let m = self.p * (self.p - 1) / 2;
        prior.update(
            &self.edge_indicators,
            &mut self.inclusion_probability,
            self.p,
            m,
            &mut self.rng,
        );
    }

    fn set_seed(&mut self, seed: u64) {
        self.rng = ChainRng::seed_from(seed);
    }

    fn rng_mut(&mut self) -> &mut ChainRng {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_model(p: usize, edge_selection: bool) -> GgmModel {
        let incl = DMatrix::from_element(p, p, 0.5);
        let mut ind = DMatrix::from_element(p, p, 1u8);
        ind.fill_diagonal(0);
        // Deterministic pseudo-data
        let n = 40;
        let x = DMatrix::from_fn(n, p, |i, j| {
            (((i * 31 + j * 17 + 7) % 13) as f64 / 13.0 - 0.5) * 2.0
        });
        let mut m = GgmModel::new(&x, incl, ind, edge_selection, 2.5).unwrap();
        m.set_seed(42);
        m
    }

    fn check_factor_invariants(m: &GgmModel) {
        let rebuilt = m.cholesky_factor().transpose() * m.cholesky_factor();
        assert_relative_eq!(rebuilt, *m.precision_matrix(), epsilon = 1e-6);
        for k in 0..m.num_variables() {
            assert!(m.cholesky_factor()[(k, k)] > 0.0);
        }
        let id = m.cholesky_factor() * &m.inv_chol;
        assert_relative_eq!(id, DMatrix::identity(m.num_variables(), m.num_variables()),
            epsilon = 1e-8);
    }

    #[test]
    fn factor_tracks_precision_through_sweeps() {
        let mut m = test_model(5, false);
        for iter in 0..50 {
            m.do_one_mh_step(iter);
        }
        check_factor_invariants(&m);
    }

    #[test]
    fn edge_selection_keeps_indicators_symmetric() {
        let mut m = test_model(5, true);
        m.set_edge_selection_active(true);
        m.initialize_graph();
        for iter in 0..50 {
            m.do_one_mh_step(iter);
        }
        let ind = m.edge_indicator_matrix();
        for i in 0..5 {
            assert_eq!(ind[(i, i)], 0);
            for j in 0..5 {
                assert_eq!(ind[(i, j)], ind[(j, i)]);
                assert!(ind[(i, j)] <= 1);
            }
        }
        // Inactive edges carry exactly zero precision entries.
        for i in 0..4 {
            for j in i + 1..5 {
                if ind[(i, j)] == 0 {
                    assert_eq!(m.precision_matrix()[(i, j)], 0.0);
                }
            }
        }
        check_factor_invariants(&m);
    }

    #[test]
    fn ratio_functions_match_full_likelihood() {
        let mut m = test_model(4, false);
        for iter in 0..10 {
            m.do_one_mh_step(iter);
        }

        // Construct an edge proposal by hand and compare the incremental
        // ratio to a likelihood difference on explicit matrices.
        let (i, j) = (0, 2);
        m.compute_constants(i, j);
        let omega_prop_ij = m.precision[(i, j)] + 0.05;
        let omega_prop_jj = m.constrained_diagonal(omega_prop_ij);
        m.precision_proposal.copy_from(&m.precision);
        m.precision_proposal[(i, j)] = omega_prop_ij;
        m.precision_proposal[(j, i)] = omega_prop_ij;
        m.precision_proposal[(j, j)] = omega_prop_jj;

        let incremental = m.edge_log_ratio(i, j);

        let direct = |omega: &DMatrix<f64>| -> f64 {
            let logdet = Cholesky::new(omega.clone())
                .unwrap()
                .l()
                .diagonal()
                .iter()
                .map(|d| 2.0 * d.ln())
                .sum::<f64>();
            0.5 * (m.n as f64 * logdet - omega.dot(&m.suf_stat))
        };
        let expect = direct(&m.precision_proposal) - direct(&m.precision);
        assert_relative_eq!(incremental, expect, epsilon = 1e-6);
    }

    #[test]
    fn vectorization_round_trips() {
        let mut m = test_model(4, false);
        for iter in 0..5 {
            m.do_one_mh_step(iter);
        }
        let v = m.vectorized_parameters();
        assert_eq!(v.len(), 4 * 5 / 2);
        let mut m2 = m.clone();
        m2.set_vectorized_parameters(&v);
        assert_relative_eq!(*m2.precision_matrix(), *m.precision_matrix(), epsilon = 1e-12);
    }

    #[test]
    fn zero_observations_prior_dominates() {
        // n = 0 with a zero scatter matrix: the posterior is proper and the
        // precision stays positive definite.
        let p = 6;
        let incl = DMatrix::from_element(p, p, 0.5);
        let mut ind = DMatrix::from_element(p, p, 1u8);
        ind.fill_diagonal(0);
        let mut m = GgmModel::from_suf_stat(
            0,
            DMatrix::zeros(p, p),
            incl,
            ind,
            false,
            2.5,
        )
        .unwrap();
        m.set_seed(13);
        for iter in 0..100 {
            m.do_one_mh_step(iter);
        }
        check_factor_invariants(&m);
        for k in 0..p {
            assert!(m.precision_matrix()[(k, k)].is_finite());
        }
    }

    #[test]
    fn rejects_malformed_inputs() {
        let p = 3;
        let incl = DMatrix::from_element(p, p, 0.5);
        let mut ind = DMatrix::from_element(p, p, 1u8);
        ind.fill_diagonal(0);

        // non-symmetric scatter
        let mut s = DMatrix::zeros(p, p);
        s[(0, 1)] = 1.0;
        assert!(GgmModel::from_suf_stat(5, s, incl.clone(), ind.clone(), true, 2.5).is_err());

        // diagonal indicator set
        let mut bad = ind.clone();
        bad[(1, 1)] = 1;
        assert!(
            GgmModel::from_suf_stat(5, DMatrix::identity(p, p), incl.clone(), bad, true, 2.5)
                .is_err()
        );

        // inclusion probability outside (0, 1)
        let bad_incl = DMatrix::from_element(p, p, 1.0);
        assert!(
            GgmModel::from_suf_stat(5, DMatrix::identity(p, p), bad_incl, ind, true, 2.5).is_err()
        );
    }
}
