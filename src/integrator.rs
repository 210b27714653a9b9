//! Leapfrog integration and the one-slot joint-evaluation cache.

use itertools::izip;
use nalgebra::DVector;

use crate::model::Model;

/// Single-entry cache for joint logp + gradient evaluations.
///
/// Within one NUTS iteration the typical pattern is a gradient lookup at a
/// fresh position followed by a logp lookup at the same position. Each
/// leapfrog endpoint is unique, so a map would almost never hit; one slot
/// with exact bit equality on the position is sufficient.
pub(crate) struct JointCache {
    position: DVector<f64>,
    logp: f64,
    gradient: DVector<f64>,
    valid: bool,
}

impl JointCache {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            position: DVector::zeros(dim),
            logp: 0.0,
            gradient: DVector::zeros(dim),
            valid: false,
        }
    }

    fn matches(&self, position: &DVector<f64>) -> bool {
        self.valid
            && self.position.len() == position.len()
            && self
                .position
                .iter()
                .zip(position.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    fn ensure<M: Model>(&mut self, model: &mut M, position: &DVector<f64>) {
        if self.matches(position) {
            return;
        }
        let (logp, gradient) = model.logp_and_gradient(position);
        self.position = position.clone();
        self.logp = logp;
        self.gradient = gradient;
        self.valid = true;
    }

    pub(crate) fn logp<M: Model>(&mut self, model: &mut M, position: &DVector<f64>) -> f64 {
        self.ensure(model, position);
        self.logp
    }

    pub(crate) fn gradient<M: Model>(
        &mut self,
        model: &mut M,
        position: &DVector<f64>,
    ) -> &DVector<f64> {
        self.ensure(model, position);
        &self.gradient
    }
}

/// One leapfrog step through the cache; used by the NUTS tree expansion.
pub(crate) fn leapfrog_cached<M: Model>(
    model: &mut M,
    cache: &mut JointCache,
    theta: &DVector<f64>,
    r: &DVector<f64>,
    eps: f64,
    inv_mass: &DVector<f64>,
) -> (DVector<f64>, DVector<f64>) {
    let mut r_half = r.clone();
    r_half.axpy(0.5 * eps, cache.gradient(model, theta), 1.0);

    let mut theta_new = theta.clone();
    izip!(theta_new.iter_mut(), inv_mass.iter(), r_half.iter())
        .for_each(|(t, im, rh)| *t += eps * im * rh);

    r_half.axpy(0.5 * eps, cache.gradient(model, &theta_new), 1.0);
    (theta_new, r_half)
}

pub(crate) struct LeapfrogResult {
    pub theta: DVector<f64>,
    pub r: DVector<f64>,
    pub logp: f64,
    #[allow(dead_code)]
    pub gradient: DVector<f64>,
}

/// Fixed-length leapfrog integration.
///
/// Interior steps evaluate only the gradient; the final step uses the joint
/// function so both logp and gradient at the endpoint are available. An
/// already-known gradient at the start position avoids one re-evaluation.
pub(crate) fn leapfrog<M: Model>(
    model: &mut M,
    theta_init: &DVector<f64>,
    r_init: &DVector<f64>,
    eps: f64,
    num_steps: usize,
    inv_mass: &DVector<f64>,
    init_grad: Option<&DVector<f64>>,
) -> LeapfrogResult {
    let mut theta = theta_init.clone();
    let mut r = r_init.clone();

    let mut grad = match init_grad {
        Some(g) => g.clone(),
        None => model.gradient(&theta),
    };

    if num_steps == 0 {
        let (logp, gradient) = model.logp_and_gradient(&theta);
        return LeapfrogResult {
            theta,
            r,
            logp,
            gradient,
        };
    }

    for _ in 0..num_steps - 1 {
        r.axpy(0.5 * eps, &grad, 1.0);
        izip!(theta.iter_mut(), inv_mass.iter(), r.iter())
            .for_each(|(t, im, ri)| *t += eps * im * ri);
        grad = model.gradient(&theta);
        r.axpy(0.5 * eps, &grad, 1.0);
    }

    r.axpy(0.5 * eps, &grad, 1.0);
    izip!(theta.iter_mut(), inv_mass.iter(), r.iter())
        .for_each(|(t, im, ri)| *t += eps * im * ri);
    let (logp, gradient) = model.logp_and_gradient(&theta);
    r.axpy(0.5 * eps, &gradient, 1.0);

    LeapfrogResult {
        theta,
        r,
        logp,
        gradient,
    }
}

/// Kinetic energy `½ rᵀ M⁻¹ r` with diagonal inverse mass.
pub(crate) fn kinetic_energy(r: &DVector<f64>, inv_mass: &DVector<f64>) -> f64 {
    0.5 * r
        .iter()
        .zip(inv_mass.iter())
        .map(|(ri, mi)| ri * ri * mi)
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_model::NormalTarget;

    #[test]
    fn cache_evaluates_once_per_position() {
        let mut model = NormalTarget::new(3, 1.0);
        let mut cache = JointCache::new(3);
        let theta = DVector::from_vec(vec![0.5, -0.2, 1.4]);

        let g1 = cache.gradient(&mut model, &theta).clone();
        let lp = cache.logp(&mut model, &theta);
        let (expect_lp, expect_g) = model.logp_and_gradient(&theta);
        assert_eq!(lp, expect_lp);
        assert_eq!(g1, expect_g);
    }

    #[test]
    fn leapfrog_is_time_reversible() {
        let mut model = NormalTarget::new(2, 0.0);
        let theta = DVector::from_vec(vec![1.0, -0.5]);
        let r = DVector::from_vec(vec![0.3, 0.7]);
        let inv_mass = DVector::from_element(2, 1.0);

        let fwd = leapfrog(&mut model, &theta, &r, 0.1, 8, &inv_mass, None);
        // Flip momentum and integrate back.
        let back = leapfrog(&mut model, &fwd.theta, &(-&fwd.r), 0.1, 8, &inv_mass, None);

        assert!((&back.theta - &theta).norm() < 1e-10);
        assert!((&back.r + &r).norm() < 1e-10);
    }

    #[test]
    fn leapfrog_conserves_energy_for_small_steps() {
        let mut model = NormalTarget::new(2, 0.0);
        let theta = DVector::from_vec(vec![1.0, 0.2]);
        let r = DVector::from_vec(vec![-0.4, 0.9]);
        let inv_mass = DVector::from_element(2, 1.0);

        let (logp0, _) = model.logp_and_gradient(&theta);
        let h0 = -logp0 + kinetic_energy(&r, &inv_mass);

        let out = leapfrog(&mut model, &theta, &r, 0.01, 100, &inv_mass, None);
        let h1 = -out.logp + kinetic_energy(&out.r, &inv_mass);
        assert!((h1 - h0).abs() < 1e-3);
    }

    #[test]
    fn cached_single_step_matches_plain_leapfrog() {
        let mut model = NormalTarget::new(2, 0.5);
        let mut cache = JointCache::new(2);
        let theta = DVector::from_vec(vec![0.1, -0.3]);
        let r = DVector::from_vec(vec![0.2, 0.4]);
        let inv_mass = DVector::from_vec(vec![1.5, 0.5]);

        let (t1, r1) = leapfrog_cached(&mut model, &mut cache, &theta, &r, 0.2, &inv_mass);
        let plain = leapfrog(&mut model, &theta, &r, 0.2, 1, &inv_mass, None);
        assert!((&t1 - &plain.theta).norm() < 1e-14);
        assert!((&r1 - &plain.r).norm() < 1e-14);
    }
}
