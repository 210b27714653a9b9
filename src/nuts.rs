//! No-U-Turn sampler with the generalized U-turn criterion.
//!
//! Tree expansion by binary doubling; termination via the criterion of
//! Betancourt (2017) with the two junction-level checks of Stan's base
//! implementation, or when the slice/energy threshold is exceeded
//! (flagged as a divergence), or at the maximum depth. Multinomial
//! sampling across subtrees weights by the number of valid proposals.

use nalgebra::DVector;

use crate::integrator::{kinetic_energy, leapfrog_cached, JointCache};
use crate::model::Model;
use crate::rng::ChainRng;

const DELTA_MAX: f64 = 1000.0;

/// Per-iteration NUTS diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct NutsDiagnostics {
    /// Final depth of the trajectory tree.
    pub tree_depth: u32,
    /// Whether any leapfrog step exceeded the energy threshold.
    pub divergent: bool,
    /// Final Hamiltonian, `-logp + kinetic`.
    pub energy: f64,
}

pub(crate) struct NutsResult {
    pub state: DVector<f64>,
    pub accept_prob: f64,
    pub diagnostics: NutsDiagnostics,
}

#[inline]
fn criterion(p_sharp_minus: &DVector<f64>, p_sharp_plus: &DVector<f64>, rho: &DVector<f64>) -> bool {
    p_sharp_plus.dot(rho) > 0.0 && p_sharp_minus.dot(rho) > 0.0
}

struct BuildTreeResult {
    theta_min: DVector<f64>,
    r_min: DVector<f64>,
    theta_plus: DVector<f64>,
    r_plus: DVector<f64>,
    theta_prime: DVector<f64>,
    r_prime: DVector<f64>,
    rho: DVector<f64>,
    p_sharp_beg: DVector<f64>,
    p_sharp_end: DVector<f64>,
    p_beg: DVector<f64>,
    p_end: DVector<f64>,
    n_prime: u64,
    s_prime: bool,
    alpha: f64,
    n_alpha: u64,
    divergent: bool,
}

#[allow(clippy::too_many_arguments)]
fn build_tree<M: Model>(
    model: &mut M,
    cache: &mut JointCache,
    rng: &mut ChainRng,
    theta: &DVector<f64>,
    r: &DVector<f64>,
    log_u: f64,
    v: i32,
    depth: u32,
    step_size: f64,
    logp0: f64,
    kin0: f64,
    inv_mass: &DVector<f64>,
) -> BuildTreeResult {
    if depth == 0 {
        // Base case: one leapfrog step.
        let (theta_new, r_new) =
            leapfrog_cached(model, cache, theta, r, v as f64 * step_size, inv_mass);

        let logp = cache.logp(model, &theta_new);
        let kin = kinetic_energy(&r_new, inv_mass);
        let n_new = u64::from(log_u <= logp - kin);
        let s_new = log_u <= DELTA_MAX + logp - kin;
        let alpha = (logp - kin - logp0 + kin0).exp().min(1.0);

        let p_sharp = inv_mass.component_mul(&r_new);

        return BuildTreeResult {
            theta_min: theta_new.clone(),
            r_min: r_new.clone(),
            theta_plus: theta_new.clone(),
            r_plus: r_new.clone(),
            theta_prime: theta_new,
            r_prime: r_new.clone(),
            rho: r_new.clone(),
            p_sharp_beg: p_sharp.clone(),
            p_sharp_end: p_sharp,
            p_beg: r_new.clone(),
            p_end: r_new,
            n_prime: n_new,
            s_prime: s_new,
            alpha,
            n_alpha: 1,
            divergent: !s_new,
        };
    }

    // Build the first subtree.
    let init = build_tree(
        model, cache, rng, theta, r, log_u, v, depth - 1, step_size, logp0, kin0, inv_mass,
    );
    if !init.s_prime {
        return init;
    }

    let mut divergent = init.divergent;
    let mut theta_min = init.theta_min;
    let mut r_min = init.r_min;
    let mut theta_plus = init.theta_plus;
    let mut r_plus = init.r_plus;
    let mut theta_prime = init.theta_prime;
    let mut r_prime = init.r_prime;

    // Second subtree continues in the same direction from the moving end.
    let fin = if v == -1 {
        let fin = build_tree(
            model, cache, rng, &theta_min, &r_min, log_u, v, depth - 1, step_size, logp0, kin0,
            inv_mass,
        );
        theta_min = fin.theta_min.clone();
        r_min = fin.r_min.clone();
        fin
    } else {
        let fin = build_tree(
            model, cache, rng, &theta_plus, &r_plus, log_u, v, depth - 1, step_size, logp0, kin0,
            inv_mass,
        );
        theta_plus = fin.theta_plus.clone();
        r_plus = fin.r_plus.clone();
        fin
    };

    divergent = divergent || fin.divergent;
    let n_prime = init.n_prime + fin.n_prime;
    let alpha = init.alpha + fin.alpha;
    let n_alpha = init.n_alpha + fin.n_alpha;
    let rho = &init.rho + &fin.rho;

    if !fin.s_prime {
        // Second subtree invalid: propagate without criterion checks.
        return BuildTreeResult {
            theta_min,
            r_min,
            theta_plus,
            r_plus,
            theta_prime,
            r_prime,
            rho,
            p_sharp_beg: init.p_sharp_beg,
            p_sharp_end: fin.p_sharp_end,
            p_beg: init.p_beg,
            p_end: fin.p_end,
            n_prime,
            s_prime: false,
            alpha,
            n_alpha,
            divergent,
        };
    }

    // Multinomial draw from the combined subtree.
    let prob = fin.n_prime as f64 / n_prime.max(1) as f64;
    if rng.uniform() < prob {
        theta_prime = fin.theta_prime.clone();
        r_prime = fin.r_prime.clone();
    }

    // Generalized U-turn criterion: whole subtree plus the two junctions.
    // The init subtree is always visited first in the build direction, so
    // "beg" comes from init and "end" from fin regardless of direction.
    let mut persist = criterion(&init.p_sharp_beg, &fin.p_sharp_end, &rho);
    if persist {
        let rho_ext = &init.rho + &fin.p_beg;
        persist = criterion(&init.p_sharp_beg, &fin.p_sharp_beg, &rho_ext);
    }
    if persist {
        let rho_ext = &fin.rho + &init.p_end;
        persist = criterion(&init.p_sharp_end, &fin.p_sharp_end, &rho_ext);
    }

    BuildTreeResult {
        theta_min,
        r_min,
        theta_plus,
        r_plus,
        theta_prime,
        r_prime,
        rho,
        p_sharp_beg: init.p_sharp_beg,
        p_sharp_end: fin.p_sharp_end,
        p_beg: init.p_beg,
        p_end: fin.p_end,
        n_prime,
        s_prime: persist,
        alpha,
        n_alpha,
        divergent,
    }
}

/// One NUTS draw starting from `init_theta`.
pub(crate) fn nuts_step<M: Model>(
    model: &mut M,
    rng: &mut ChainRng,
    init_theta: &DVector<f64>,
    step_size: f64,
    inv_mass: &DVector<f64>,
    max_depth: u32,
) -> NutsResult {
    let dim = init_theta.len();
    let mut cache = JointCache::new(dim);
    let mut any_divergence = false;

    let r0 = DVector::from_fn(dim, |i, _| rng.std_normal() / inv_mass[i].sqrt());
    let logp0 = cache.logp(model, init_theta);
    let kin0 = kinetic_energy(&r0, inv_mass);
    let log_u = rng.uniform().ln() + (logp0 - kin0);

    let mut theta_min = init_theta.clone();
    let mut r_min = r0.clone();
    let mut theta_plus = init_theta.clone();
    let mut r_plus = r0.clone();
    let mut theta = init_theta.clone();
    let mut r = r0.clone();

    let p_sharp0 = inv_mass.component_mul(&r0);
    let mut p_sharp_bck_bck = p_sharp0.clone();
    let mut p_sharp_fwd_fwd = p_sharp0.clone();
    let mut p_fwd_bck = r0.clone();
    let mut p_sharp_fwd_bck = p_sharp0.clone();
    let mut p_bck_fwd = r0.clone();
    let mut p_sharp_bck_fwd = p_sharp0;
    let mut rho = r0;

    let mut depth = 0u32;
    let mut n: u64 = 1;
    let mut s = true;
    let mut alpha = 0.5;
    let mut n_alpha: u64 = 1;

    while s && depth < max_depth {
        let v: i32 = if rng.uniform() < 0.5 { -1 } else { 1 };

        let (rho_bck, rho_fwd, result);
        if v == -1 {
            let res = build_tree(
                model, &mut cache, rng, &theta_min, &r_min, log_u, v, depth, step_size, logp0,
                kin0, inv_mass,
            );
            theta_min = res.theta_min.clone();
            r_min = res.r_min.clone();
            rho_fwd = rho.clone();
            rho_bck = res.rho.clone();
            p_sharp_bck_bck = res.p_sharp_beg.clone();
            p_bck_fwd = res.p_end.clone();
            p_sharp_bck_fwd = res.p_sharp_end.clone();
            result = res;
        } else {
            let res = build_tree(
                model, &mut cache, rng, &theta_plus, &r_plus, log_u, v, depth, step_size, logp0,
                kin0, inv_mass,
            );
            theta_plus = res.theta_plus.clone();
            r_plus = res.r_plus.clone();
            rho_bck = rho.clone();
            rho_fwd = res.rho.clone();
            p_sharp_fwd_fwd = res.p_sharp_end.clone();
            p_fwd_bck = res.p_beg.clone();
            p_sharp_fwd_bck = res.p_sharp_beg.clone();
            result = res;
        }

        any_divergence = any_divergence || result.divergent;
        alpha = result.alpha;
        n_alpha = result.n_alpha;

        if result.s_prime {
            let prob = result.n_prime as f64 / n as f64;
            if rng.uniform() < prob {
                theta = result.theta_prime.clone();
                r = result.r_prime.clone();
            }
        }

        rho = &rho_bck + &rho_fwd;
        let mut persist = true;
        if result.s_prime {
            persist = criterion(&p_sharp_bck_bck, &p_sharp_fwd_fwd, &rho);
            if persist {
                let rho_ext = &rho_bck + &p_fwd_bck;
                persist = criterion(&p_sharp_bck_bck, &p_sharp_fwd_bck, &rho_ext);
            }
            if persist {
                let rho_ext = &rho_fwd + &p_bck_fwd;
                persist = criterion(&p_sharp_bck_fwd, &p_sharp_fwd_fwd, &rho_ext);
            }
        }

        s = result.s_prime && persist;
        n += result.n_prime;
        depth += 1;
    }

    let accept_prob = alpha / n_alpha as f64;
    let logp_final = cache.logp(model, &theta);
    let kin_final = kinetic_energy(&r, inv_mass);

    NutsResult {
        state: theta,
        accept_prob,
        diagnostics: NutsDiagnostics {
            tree_depth: depth,
            divergent: any_divergence,
            energy: -logp_final + kin_final,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_model::NormalTarget;

    #[test]
    fn samples_gaussian_posterior() {
        let mu = -1.5;
        let dim = 5;
        let mut model = NormalTarget::new(dim, mu);
        let mut rng = ChainRng::seed_from(42);
        let inv_mass = DVector::from_element(dim, 1.0);

        let mut theta = DVector::zeros(dim);
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let draws = 2000;
        for _ in 0..draws {
            let out = nuts_step(&mut model, &mut rng, &theta, 0.4, &inv_mass, 10);
            theta = out.state;
            let m = theta.mean();
            sum += m;
            sum_sq += theta[0] * theta[0];
            assert!(out.diagnostics.tree_depth <= 10);
            assert!(out.diagnostics.energy.is_finite());
        }
        let mean = sum / draws as f64;
        assert!((mean - mu).abs() < 0.2, "posterior mean {mean}");
        // E[x^2] = mu^2 + 1
        let second_moment = sum_sq / draws as f64;
        assert!((second_moment - (mu * mu + 1.0)).abs() < 0.8);
    }

    #[test]
    fn oversized_steps_diverge() {
        let mut model = NormalTarget::new(2, 0.0);
        let mut rng = ChainRng::seed_from(3);
        let inv_mass = DVector::from_element(2, 1.0);
        // A step size of this magnitude explodes the Hamiltonian error.
        let theta = DVector::from_element(2, 40.0);

        let mut saw_divergence = false;
        let mut current = theta;
        for _ in 0..50 {
            let out = nuts_step(&mut model, &mut rng, &current, 50.0, &inv_mass, 6);
            current = out.state;
            saw_divergence = saw_divergence || out.diagnostics.divergent;
        }
        assert!(saw_divergence);
    }

    #[test]
    fn respects_max_depth() {
        let mut model = NormalTarget::new(2, 0.0);
        let mut rng = ChainRng::seed_from(8);
        let inv_mass = DVector::from_element(2, 1.0);
        let theta = DVector::zeros(2);

        // A very small step cannot turn within 3 doublings.
        let out = nuts_step(&mut model, &mut rng, &theta, 1e-4, &inv_mass, 3);
        assert_eq!(out.diagnostics.tree_depth, 3);
    }
}
