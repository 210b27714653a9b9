//! Sampler selection, configuration, and the warmup adaptation controller
//! shared by the gradient-based samplers.

use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::adapt::RunningVariance;
use crate::errors::{Result, SamplerError};
use crate::hmc::hmc_step;
use crate::model::Model;
use crate::nuts::{nuts_step, NutsDiagnostics};
use crate::schedule::WarmupSchedule;
use crate::stepsize::{heuristic_step_size, DualAverage, DualAverageSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerKind {
    /// Component-wise adaptive Metropolis, delegated to the model.
    Mh,
    /// Fixed-length Hamiltonian Monte Carlo.
    Hmc,
    /// No-U-Turn sampler.
    Nuts,
}

/// Settings for a sampling run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerSettings {
    pub sampler: SamplerKind,
    /// Post-warmup iterations recorded into the chain result.
    pub no_iter: usize,
    /// Warmup iterations used for adaptation.
    pub no_warmup: usize,
    /// Enable spike-and-slab indicator moves.
    pub edge_selection: bool,
    /// Enable missing-data imputation.
    pub na_impute: bool,
    /// Base seed; chain `c` uses `seed + c`.
    pub seed: u64,
    /// Seed value for dual averaging.
    pub initial_step_size: f64,
    pub target_acceptance: f64,
    /// NUTS tree-depth cap.
    pub max_tree_depth: u32,
    /// HMC path length.
    pub num_leapfrogs: usize,
    pub dual_average: DualAverageSettings,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            sampler: SamplerKind::Mh,
            no_iter: 1000,
            no_warmup: 500,
            edge_selection: false,
            na_impute: false,
            seed: 42,
            initial_step_size: 0.1,
            target_acceptance: 0.8,
            max_tree_depth: 10,
            num_leapfrogs: 10,
            dual_average: DualAverageSettings::default(),
        }
    }
}

impl SamplerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.no_iter == 0 {
            return Err(SamplerError::InvalidArgument(
                "at least one sampling iteration is required".into(),
            ));
        }
        if !(self.initial_step_size > 0.0) {
            return Err(SamplerError::InvalidArgument(
                "initial step size must be positive".into(),
            ));
        }
        if !(self.target_acceptance > 0.0 && self.target_acceptance < 1.0) {
            return Err(SamplerError::InvalidArgument(
                "target acceptance must lie in (0, 1)".into(),
            ));
        }
        if self.max_tree_depth == 0 {
            return Err(SamplerError::InvalidArgument(
                "maximum tree depth must be at least 1".into(),
            ));
        }
        if self.num_leapfrogs == 0 {
            return Err(SamplerError::InvalidArgument(
                "HMC needs at least one leapfrog step".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one sampler step.
pub(crate) struct StepInfo {
    pub accept_prob: f64,
    pub diagnostics: Option<NutsDiagnostics>,
}

/// Warmup adaptation for HMC and NUTS: dual-averaging step size in Stages
/// 1, 2, 3a and 3c, diagonal mass-matrix estimation in the Stage-2
/// doubling windows, step size frozen to the averaged estimate from the
/// Stage-3b boundary on.
pub(crate) struct GradientAdaptation {
    step_size: f64,
    target_accept: f64,
    dual_avg: DualAverage,
    mass_accumulator: RunningVariance,
    initialized: bool,
}

impl GradientAdaptation {
    fn new(settings: &SamplerSettings) -> Self {
        Self {
            step_size: settings.initial_step_size,
            target_accept: settings.target_acceptance,
            dual_avg: DualAverage::new(settings.dual_average, settings.initial_step_size),
            mass_accumulator: RunningVariance::new(0),
            initialized: false,
        }
    }

    pub(crate) fn step_size(&self) -> f64 {
        self.step_size
    }

    fn ensure_initialized<M: Model>(&mut self, model: &mut M, schedule: &WarmupSchedule) {
        if self.initialized {
            return;
        }
        let full_dim = model.full_parameter_dimension();
        model.set_inv_mass(DVector::from_element(full_dim, 1.0));
        self.mass_accumulator = RunningVariance::new(full_dim);

        if schedule.total_warmup > 0 {
            let theta = model.vectorized_parameters();
            let inv_mass = model.active_inv_mass();
            let mut rng = model.rng_mut().clone();
            let eps = heuristic_step_size(
                model,
                &mut rng,
                &theta,
                &inv_mass,
                self.target_accept,
                1.0,
                20,
            );
            *model.rng_mut() = rng;
            self.step_size = eps;
            self.dual_avg.restart(eps);
            debug!("initial step size heuristic settled on {eps}");
        }
        self.initialized = true;
    }

    fn update<M: Model>(
        &mut self,
        model: &mut M,
        accept_prob: f64,
        iteration: usize,
        schedule: &WarmupSchedule,
    ) {
        // Step-size adaptation runs in every stage except 3b; Stage 3c
        // re-adapts because selection changes the active parameter set.
        if schedule.in_stage1(iteration)
            || schedule.in_stage2(iteration)
            || schedule.in_stage3a(iteration)
            || schedule.in_stage3c(iteration)
        {
            self.dual_avg.advance(accept_prob, self.target_accept);
            self.step_size = self.dual_avg.current_step_size();
        }

        // Mass-matrix estimation only inside Stage-2 windows.
        if schedule.in_stage2(iteration) {
            self.mass_accumulator
                .add_sample(&model.full_vectorized_parameters());
            if schedule.at_window_end(iteration) {
                let inv_mass = self.mass_accumulator.variance();
                self.mass_accumulator.reset();
                model.set_inv_mass(inv_mass);

                // Re-anchor dual averaging around a fresh search from the
                // new metric.
                let theta = model.vectorized_parameters();
                let active_inv_mass = model.active_inv_mass();
                let mut rng = model.rng_mut().clone();
                let eps = heuristic_step_size(
                    model,
                    &mut rng,
                    &theta,
                    &active_inv_mass,
                    0.625,
                    self.step_size,
                    20,
                );
                *model.rng_mut() = rng;
                self.step_size = eps;
                self.dual_avg.restart(eps);
            }
        }

        // Freeze at the Stage-3b boundary and during sampling.
        if iteration == schedule.stage3b_start || schedule.sampling(iteration) {
            self.step_size = self.dual_avg.current_step_size_adapted();
        }
    }
}

pub(crate) enum Sampler {
    Mh,
    Hmc {
        adaptation: GradientAdaptation,
        num_leapfrogs: usize,
    },
    Nuts {
        adaptation: GradientAdaptation,
        max_depth: u32,
    },
}

impl Sampler {
    pub(crate) fn new(settings: &SamplerSettings) -> Self {
        match settings.sampler {
            SamplerKind::Mh => Sampler::Mh,
            SamplerKind::Hmc => Sampler::Hmc {
                adaptation: GradientAdaptation::new(settings),
                num_leapfrogs: settings.num_leapfrogs,
            },
            SamplerKind::Nuts => Sampler::Nuts {
                adaptation: GradientAdaptation::new(settings),
                max_depth: settings.max_tree_depth,
            },
        }
    }

    pub(crate) fn requires_gradient(&self) -> bool {
        !matches!(self, Sampler::Mh)
    }

    pub(crate) fn collects_nuts_diagnostics(&self) -> bool {
        matches!(self, Sampler::Nuts { .. })
    }

    pub(crate) fn step<M: Model>(
        &mut self,
        model: &mut M,
        iteration: usize,
        schedule: &WarmupSchedule,
    ) -> StepInfo {
        match self {
            Sampler::Mh => {
                model.do_one_mh_step(iteration);
                StepInfo {
                    accept_prob: 1.0,
                    diagnostics: None,
                }
            }
            Sampler::Hmc {
                adaptation,
                num_leapfrogs,
            } => {
                adaptation.ensure_initialized(model, schedule);
                let theta = model.vectorized_parameters();
                let inv_mass = model.active_inv_mass();

                let mut rng = model.rng_mut().clone();
                let out = hmc_step(
                    model,
                    &mut rng,
                    &theta,
                    adaptation.step_size(),
                    *num_leapfrogs,
                    &inv_mass,
                );
                *model.rng_mut() = rng;

                model.set_vectorized_parameters(&out.state);
                adaptation.update(model, out.accept_prob, iteration, schedule);
                StepInfo {
                    accept_prob: out.accept_prob,
                    diagnostics: None,
                }
            }
            Sampler::Nuts {
                adaptation,
                max_depth,
            } => {
                adaptation.ensure_initialized(model, schedule);
                let theta = model.vectorized_parameters();
                let inv_mass = model.active_inv_mass();

                let mut rng = model.rng_mut().clone();
                let out = nuts_step(
                    model,
                    &mut rng,
                    &theta,
                    adaptation.step_size(),
                    &inv_mass,
                    *max_depth,
                );
                *model.rng_mut() = rng;

                model.set_vectorized_parameters(&out.state);
                adaptation.update(model, out.accept_prob, iteration, schedule);
                StepInfo {
                    accept_prob: out.accept_prob,
                    diagnostics: Some(out.diagnostics),
                }
            }
        }
    }
}
