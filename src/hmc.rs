//! Fixed-length Hamiltonian Monte Carlo step.

use nalgebra::DVector;

use crate::integrator::{kinetic_energy, leapfrog};
use crate::model::Model;
use crate::rng::ChainRng;

pub(crate) struct HmcResult {
    pub state: DVector<f64>,
    pub accept_prob: f64,
}

/// One HMC iteration: draw momentum from N(0, M), integrate `num_leapfrogs`
/// steps, and accept on the Metropolis criterion for the Hamiltonian error.
pub(crate) fn hmc_step<M: Model>(
    model: &mut M,
    rng: &mut ChainRng,
    theta: &DVector<f64>,
    step_size: f64,
    num_leapfrogs: usize,
    inv_mass: &DVector<f64>,
) -> HmcResult {
    let r0 = DVector::from_fn(theta.len(), |i, _| rng.std_normal() / inv_mass[i].sqrt());

    let (logp0, grad0) = model.logp_and_gradient(theta);

    let out = leapfrog(
        model,
        theta,
        &r0,
        step_size,
        num_leapfrogs,
        inv_mass,
        Some(&grad0),
    );

    let current_h = -logp0 + kinetic_energy(&r0, inv_mass);
    let proposed_h = -out.logp + kinetic_energy(&out.r, inv_mass);
    let log_accept = current_h - proposed_h;

    let state = if rng.uniform().ln() < log_accept {
        out.theta
    } else {
        theta.clone()
    };

    HmcResult {
        state,
        accept_prob: log_accept.exp().min(1.0),
    }
}
