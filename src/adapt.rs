//! Adaptation primitives: the diagonal variance estimator used for mass
//! matrix learning, the Robbins-Monro proposal-SD update, and the
//! per-parameter proposal bank used by the GGM element-wise sweeps.

use nalgebra::DVector;

/// Online diagonal variance estimate (Welford updates).
///
/// The reported variance blends the empirical estimate with a weak prior
/// (weight 5 on 1e-3) so short windows cannot produce degenerate zeros.
#[derive(Debug, Clone)]
pub struct RunningVariance {
    count: u64,
    mean: DVector<f64>,
    m2: DVector<f64>,
}

impl RunningVariance {
    const PRIOR_WEIGHT: f64 = 5.0;
    const PRIOR_VARIANCE: f64 = 1e-3;

    pub fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: DVector::zeros(dim),
            m2: DVector::zeros(dim),
        }
    }

    pub fn add_sample(&mut self, sample: &DVector<f64>) {
        self.count += 1;
        let n = self.count as f64;
        for i in 0..self.mean.len() {
            let delta = sample[i] - self.mean[i];
            self.mean[i] += delta / n;
            let delta2 = sample[i] - self.mean[i];
            self.m2[i] += delta * delta2;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn variance(&self) -> DVector<f64> {
        let n = self.count as f64;
        let w = n / (n + Self::PRIOR_WEIGHT);
        let prior = (Self::PRIOR_WEIGHT / (n + Self::PRIOR_WEIGHT)) * Self::PRIOR_VARIANCE;
        self.m2.map(|m2| w * m2 / 1f64.max(n - 1.0) + prior)
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.mean.fill(0.0);
        self.m2.fill(0.0);
    }
}

pub(crate) const RM_LOWER_BOUND: f64 = 0.001;
pub(crate) const RM_UPPER_BOUND: f64 = 2.0;
pub(crate) const RM_DECAY_RATE: f64 = 0.75;
pub(crate) const RWM_TARGET_ACCEPT: f64 = 0.44;

/// Robbins-Monro update of a proposal standard deviation toward a target
/// acceptance rate: `sd += (alpha - target) * weight`, clamped to
/// [0.001, 2.0]; NaN resets to 1.
pub fn robbins_monro_sd(
    current_sd: f64,
    observed_log_accept: f64,
    rm_weight: f64,
    target_accept: f64,
) -> f64 {
    let observed = if observed_log_accept < 0.0 {
        observed_log_accept.exp()
    } else {
        1.0
    };

    let mut updated = current_sd + (observed - target_accept) * rm_weight;
    if updated.is_nan() {
        updated = 1.0;
    }
    updated.clamp(RM_LOWER_BOUND, RM_UPPER_BOUND)
}

/// Robbins-Monro weight at iteration `t`, guarded so the first update stays
/// finite.
pub(crate) fn rm_weight(t: usize) -> f64 {
    (t.max(1) as f64).powf(-RM_DECAY_RATE)
}

/// Per-parameter proposal-SD bank for the GGM element-wise sampler.
///
/// Tracks cumulative acceptance counts and nudges each SD toward the 0.44
/// target with Robbins-Monro steps for a fixed window of sweeps, then
/// freezes.
#[derive(Debug, Clone)]
pub struct AdaptiveProposal {
    proposal_sds: Vec<f64>,
    acceptance_counts: Vec<u64>,
    iterations: usize,
    adaptation_window: usize,
    target_accept: f64,
    adapting: bool,
}

impl AdaptiveProposal {
    pub fn new(num_params: usize, adaptation_window: usize) -> Self {
        Self {
            proposal_sds: vec![0.25; num_params],
            acceptance_counts: vec![0; num_params],
            iterations: 0,
            adaptation_window,
            target_accept: RWM_TARGET_ACCEPT,
            adapting: true,
        }
    }

    pub fn proposal_sd(&self, param: usize) -> f64 {
        self.proposal_sds[param]
    }

    pub fn increment_accepts(&mut self, param: usize) {
        self.acceptance_counts[param] += 1;
    }

    pub fn update_proposal_sd(&mut self, param: usize) {
        if !self.adapting {
            return;
        }
        let observed =
            self.acceptance_counts[param] as f64 / (self.iterations as f64 + 1.0);
        let weight = rm_weight(self.iterations);
        let updated = self.proposal_sds[param] + (observed - self.target_accept) * weight;
        self.proposal_sds[param] = if updated.is_nan() {
            1.0
        } else {
            updated.clamp(RM_LOWER_BOUND, RM_UPPER_BOUND)
        };
    }

    pub fn increment_iteration(&mut self) {
        self.iterations += 1;
        if self.iterations >= self.adaptation_window {
            self.adapting = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn welford_matches_two_pass_variance() {
        let samples = [
            vec![1.0, -2.0],
            vec![0.5, 0.3],
            vec![-1.2, 1.8],
            vec![2.2, -0.4],
            vec![0.1, 0.9],
        ];
        let mut rv = RunningVariance::new(2);
        for s in &samples {
            rv.add_sample(&DVector::from_vec(s.clone()));
        }

        let n = samples.len() as f64;
        for d in 0..2 {
            let mean: f64 = samples.iter().map(|s| s[d]).sum::<f64>() / n;
            let emp: f64 =
                samples.iter().map(|s| (s[d] - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let blended = (n / (n + 5.0)) * emp + (5.0 / (n + 5.0)) * 1e-3;
            assert!((rv.variance()[d] - blended).abs() < 1e-12);
        }
    }

    #[test]
    fn welford_short_window_stays_positive() {
        let mut rv = RunningVariance::new(3);
        rv.add_sample(&DVector::from_element(3, 1.5));
        rv.add_sample(&DVector::from_element(3, 1.5));
        for d in 0..3 {
            assert!(rv.variance()[d] > 0.0);
        }
    }

    #[test]
    fn robbins_monro_nan_resets() {
        assert_eq!(robbins_monro_sd(f64::NAN, -0.1, 0.5, 0.44), 1.0);
    }

    #[test]
    fn adaptive_proposal_freezes_after_window() {
        let mut prop = AdaptiveProposal::new(1, 3);
        for _ in 0..3 {
            prop.increment_iteration();
        }
        let before = prop.proposal_sd(0);
        prop.update_proposal_sd(0);
        assert_eq!(prop.proposal_sd(0), before);
    }

    proptest! {
        #[test]
        fn robbins_monro_stays_in_bounds(
            sd in 0.001f64..2.0,
            log_accept in -20f64..0.0,
            t in 1usize..5000,
        ) {
            let updated = robbins_monro_sd(sd, log_accept, rm_weight(t), 0.44);
            prop_assert!((RM_LOWER_BOUND..=RM_UPPER_BOUND).contains(&updated));
        }
    }
}
