//! Step-size adaptation: Nesterov dual averaging and the initial step-size
//! search heuristic.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::integrator::{kinetic_energy, leapfrog};
use crate::model::Model;
use crate::rng::ChainRng;

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DualAverageSettings {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageSettings {
    fn default() -> DualAverageSettings {
        DualAverageSettings {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageSettings,
}

impl DualAverage {
    pub fn new(settings: DualAverageSettings, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    /// Restart adaptation around a new step size, re-anchoring the shrink
    /// target at `10 * initial_step`.
    pub fn restart(&mut self, initial_step: f64) {
        self.log_step = initial_step.ln();
        self.log_step_adapted = initial_step.ln();
        self.hbar = 0f64;
        self.mu = (10. * initial_step).ln();
        self.count = 1;
    }
}

/// Search for a reasonable initial step size.
///
/// Starting from `init_step`, takes single leapfrog probes from `theta`
/// (resampling the momentum each attempt) and doubles or halves the step
/// until the Hamiltonian error first crosses back over ±ln 2, or the
/// attempt cap is reached.
pub(crate) fn heuristic_step_size<M: Model>(
    model: &mut M,
    rng: &mut ChainRng,
    theta: &DVector<f64>,
    inv_mass: &DVector<f64>,
    target_accept: f64,
    init_step: f64,
    max_attempts: usize,
) -> f64 {
    let mut eps = init_step;

    // Position never changes, so the joint evaluation happens once.
    let (logp0, grad0) = model.logp_and_gradient(theta);

    let draw_momentum = |rng: &mut ChainRng| {
        DVector::from_fn(theta.len(), |i, _| {
            rng.std_normal() / inv_mass[i].sqrt()
        })
    };

    let mut r = draw_momentum(rng);
    let mut h0 = logp0 - kinetic_energy(&r, inv_mass);

    let mut probe = leapfrog(model, theta, &r, eps, 1, inv_mass, Some(&grad0));
    let mut h1 = probe.logp - kinetic_energy(&probe.r, inv_mass);

    let direction: f64 = if h1 - h0 > target_accept.ln() { 1. } else { -1. };

    let mut attempts = 0;
    while direction * (h1 - h0) > -direction * 2f64.ln() && attempts < max_attempts {
        eps = if direction > 0. { 2.0 * eps } else { 0.5 * eps };

        r = draw_momentum(rng);
        h0 = logp0 - kinetic_energy(&r, inv_mass);

        probe = leapfrog(model, theta, &r, eps, 1, inv_mass, Some(&grad0));
        h1 = probe.logp - kinetic_energy(&probe.r, inv_mass);

        attempts += 1;
    }

    eps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_model::NormalTarget;

    #[test]
    fn dual_average_converges_toward_target() {
        let mut da = DualAverage::new(DualAverageSettings::default(), 0.5);
        // Pretend acceptance always matches the target: the averaged step
        // should stay near its anchor and remain finite.
        for _ in 0..500 {
            da.advance(0.8, 0.8);
        }
        assert!(da.current_step_size_adapted().is_finite());

        // Persistently low acceptance shrinks the step.
        let mut da = DualAverage::new(DualAverageSettings::default(), 0.5);
        for _ in 0..200 {
            da.advance(0.1, 0.8);
        }
        assert!(da.current_step_size() < 0.5);

        // Persistently high acceptance grows it.
        let mut da = DualAverage::new(DualAverageSettings::default(), 0.5);
        for _ in 0..200 {
            da.advance(1.0, 0.8);
        }
        assert!(da.current_step_size() > 0.5);
    }

    #[test]
    fn restart_resets_state() {
        let mut da = DualAverage::new(DualAverageSettings::default(), 0.5);
        for _ in 0..50 {
            da.advance(0.2, 0.8);
        }
        da.restart(0.3);
        assert!((da.current_step_size() - 0.3).abs() < 1e-12);
        assert!((da.current_step_size_adapted() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn heuristic_finds_moderate_step_for_gaussian() {
        let mut model = NormalTarget::new(10, 0.0);
        let mut rng = ChainRng::seed_from(42);
        let theta = DVector::from_element(10, 0.5);
        let inv_mass = DVector::from_element(10, 1.0);

        let eps = heuristic_step_size(&mut model, &mut rng, &theta, &inv_mass, 0.625, 1.0, 20);
        // For a unit Gaussian the stable step size is order one.
        assert!(eps > 1e-3 && eps < 16.0, "eps = {eps}");
    }
}
