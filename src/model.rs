//! Capability-typed model abstraction.
//!
//! A [`Model`] owns its parameters, sufficient statistics, edge indicators,
//! proposal standard deviations and chain RNG. Samplers and the chain
//! driver are generic over this trait; each chain works on an independent
//! deep clone.

use nalgebra::{DMatrix, DVector};

use crate::edge_prior::EdgePrior;
use crate::errors::{Result, SamplerError};
use crate::rng::ChainRng;
use crate::schedule::WarmupSchedule;

pub trait Model: Clone + Send {
    // Capability queries.
    fn has_gradient(&self) -> bool {
        false
    }
    fn has_adaptive_mh(&self) -> bool {
        false
    }
    fn has_edge_selection(&self) -> bool {
        false
    }
    fn has_missing_data(&self) -> bool {
        false
    }

    /// Log pseudo-posterior at an active-parameter vector.
    fn logp(&mut self, parameters: &DVector<f64>) -> f64;

    /// Joint log-density and gradient; the two usually share most of the
    /// computation.
    fn logp_and_gradient(&mut self, _parameters: &DVector<f64>) -> (f64, DVector<f64>) {
        panic!("gradient-based sampling requires a model with gradients")
    }

    fn gradient(&mut self, parameters: &DVector<f64>) -> DVector<f64> {
        self.logp_and_gradient(parameters).1
    }

    /// One full component-wise Metropolis sweep over all parameters.
    fn do_one_mh_step(&mut self, iteration: usize);

    /// Per-iteration RNG consumption that must happen whether or not its
    /// output is used this iteration (keeps RNG state identical across
    /// configurations).
    fn prepare_iteration(&mut self) {}

    /// Called once before the chain loop with the final schedule.
    fn init_warmup(&mut self, _schedule: &WarmupSchedule) {}

    /// Called every iteration; runs Stage-3b proposal-SD tuning internally.
    fn tune_proposal_sd(&mut self, _iteration: usize, _schedule: &WarmupSchedule) {}

    /// Dimension of the active parameter space (changes with indicators).
    fn parameter_dimension(&self) -> usize;

    /// Fixed output dimension used for sample storage.
    fn full_parameter_dimension(&self) -> usize {
        self.parameter_dimension()
    }

    /// Dense vector over active parameters, for gradient samplers.
    fn vectorized_parameters(&self) -> DVector<f64>;

    fn set_vectorized_parameters(&mut self, parameters: &DVector<f64>);

    /// Fixed-size vector with zeros for inactive edges, for storage.
    fn full_vectorized_parameters(&self) -> DVector<f64>;

    /// Strict upper-triangle edge indicators in row-major pair order.
    fn vectorized_indicators(&self) -> Vec<u8> {
        Vec::new()
    }

    /// One spike-and-slab sweep over edge indicators.
    fn update_edge_indicators(&mut self) {}

    fn set_edge_selection_active(&mut self, _active: bool) {}

    /// Sample an initial indicator configuration from the inclusion
    /// probabilities.
    fn initialize_graph(&mut self) {}

    fn impute_missing(&mut self) {}

    fn num_variables(&self) -> usize;

    fn num_pairwise(&self) -> usize {
        let p = self.num_variables();
        p * (p - 1) / 2
    }

    /// Hand the edge prior the indicator matrix, the inclusion-probability
    /// matrix and the chain RNG in one call.
    fn update_edge_prior(&mut self, _prior: &mut EdgePrior) {}

    /// Diagonal inverse mass over the full parameter vector.
    fn set_inv_mass(&mut self, _inv_mass: DVector<f64>) {}

    /// Inverse mass restricted to the active parameters.
    fn active_inv_mass(&self) -> DVector<f64> {
        DVector::from_element(self.parameter_dimension(), 1.0)
    }

    fn set_seed(&mut self, seed: u64);

    fn rng_mut(&mut self) -> &mut ChainRng;
}

/// Construction-time checks shared by the concrete models.
pub(crate) fn validate_edge_inputs(
    inclusion_probability: &DMatrix<f64>,
    indicators: &DMatrix<u8>,
    p: usize,
) -> Result<()> {
    if inclusion_probability.nrows() != p || inclusion_probability.ncols() != p {
        return Err(SamplerError::InvalidArgument(
            "inclusion probability matrix has wrong dimensions".into(),
        ));
    }
    if indicators.nrows() != p || indicators.ncols() != p {
        return Err(SamplerError::InvalidArgument(
            "edge indicator matrix has wrong dimensions".into(),
        ));
    }
    for i in 0..p {
        if indicators[(i, i)] != 0 {
            return Err(SamplerError::InvalidArgument(
                "edge indicator diagonal must be zero".into(),
            ));
        }
        for j in 0..p {
            if indicators[(i, j)] > 1 {
                return Err(SamplerError::InvalidArgument(
                    "edge indicators must be 0 or 1".into(),
                ));
            }
            if indicators[(i, j)] != indicators[(j, i)] {
                return Err(SamplerError::InvalidArgument(
                    "edge indicator matrix must be symmetric".into(),
                ));
            }
            if i != j {
                let pr = inclusion_probability[(i, j)];
                if !(pr > 0.0 && pr < 1.0) {
                    return Err(SamplerError::InvalidArgument(
                        "inclusion probabilities must lie in (0, 1)".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Strict upper-triangle indicators in row-major pair order.
pub(crate) fn strict_upper_indicators(indicators: &DMatrix<u8>) -> Vec<u8> {
    let p = indicators.nrows();
    let mut out = Vec::with_capacity(p * (p.saturating_sub(1)) / 2);
    for i in 0..p.saturating_sub(1) {
        for j in i + 1..p {
            out.push(indicators[(i, j)]);
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod test_model {
    //! A minimal Gaussian target used by the sampler unit tests.

    use super::*;
    use crate::rwm::rwm_step;

    #[derive(Clone)]
    pub(crate) struct NormalTarget {
        pub dim: usize,
        pub mu: f64,
        pub state: DVector<f64>,
        pub rng: ChainRng,
    }

    impl NormalTarget {
        pub(crate) fn new(dim: usize, mu: f64) -> Self {
            Self {
                dim,
                mu,
                state: DVector::zeros(dim),
                rng: ChainRng::seed_from(0),
            }
        }
    }

    impl Model for NormalTarget {
        fn has_gradient(&self) -> bool {
            true
        }

        fn logp(&mut self, parameters: &DVector<f64>) -> f64 {
            parameters.iter().map(|x| -0.5 * (x - self.mu).powi(2)).sum()
        }

        fn logp_and_gradient(&mut self, parameters: &DVector<f64>) -> (f64, DVector<f64>) {
            let mut logp = 0.0;
            let mut grad = DVector::zeros(self.dim);
            for i in 0..self.dim {
                let diff = parameters[i] - self.mu;
                logp -= 0.5 * diff * diff;
                grad[i] = -diff;
            }
            (logp, grad)
        }

        fn do_one_mh_step(&mut self, _iteration: usize) {
            let mu = self.mu;
            for i in 0..self.dim {
                let current = self.state[i];
                let mut rng = self.rng.clone();
                let (new_state, _) =
                    rwm_step(&mut rng, current, 0.8, |x| -0.5 * (x - mu) * (x - mu));
                self.rng = rng;
                self.state[i] = new_state;
            }
        }

        fn parameter_dimension(&self) -> usize {
            self.dim
        }

        fn vectorized_parameters(&self) -> DVector<f64> {
            self.state.clone()
        }

        fn set_vectorized_parameters(&mut self, parameters: &DVector<f64>) {
            self.state.copy_from(parameters);
        }

        fn full_vectorized_parameters(&self) -> DVector<f64> {
            self.state.clone()
        }

        fn num_variables(&self) -> usize {
            self.dim
        }

        fn num_pairwise(&self) -> usize {
            0
        }

        fn set_seed(&mut self, seed: u64) {
            self.rng = ChainRng::seed_from(seed);
        }

        fn rng_mut(&mut self) -> &mut ChainRng {
            &mut self.rng
        }
    }
}
