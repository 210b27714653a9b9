//! Scalar random-walk Metropolis kernel.

use crate::rng::ChainRng;

/// One random-walk Metropolis step on a scalar parameter.
///
/// Proposes `theta' ~ N(theta, sd)` and accepts with probability
/// `min(1, exp(logp(theta') - logp(theta)))`. Returns the accepted state
/// and the clamped acceptance probability.
pub fn rwm_step<F>(rng: &mut ChainRng, current: f64, sd: f64, mut log_post: F) -> (f64, f64)
where
    F: FnMut(f64) -> f64,
{
    let proposed = rng.normal(current, sd);
    let log_accept = log_post(proposed) - log_post(current);
    let accept_prob = log_accept.exp().min(1.0);

    let state = if rng.uniform() < accept_prob {
        proposed
    } else {
        current
    };
    (state, accept_prob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_accepts_uphill_moves() {
        // Monotone increasing target: any proposal above current accepts.
        let mut rng = ChainRng::seed_from(5);
        for _ in 0..100 {
            let (state, accept) = rwm_step(&mut rng, 0.0, 1.0, |x| 10.0 * x);
            if state > 0.0 {
                assert_eq!(accept, 1.0);
            }
            assert!((0.0..=1.0).contains(&accept));
        }
    }

    #[test]
    fn samples_standard_normal_mean() {
        let mut rng = ChainRng::seed_from(42);
        let mut x = 3.0;
        let mut sum = 0.0;
        let n = 20_000;
        for _ in 0..n {
            let (state, _) = rwm_step(&mut rng, x, 1.2, |t| -0.5 * t * t);
            x = state;
            sum += x;
        }
        assert!((sum / n as f64).abs() < 0.1);
    }

    #[test]
    fn rejects_into_previous_state() {
        // Impossible proposal region: logp is -inf away from the current
        // point, so the state never moves.
        let mut rng = ChainRng::seed_from(9);
        let (state, accept) = rwm_step(&mut rng, 1.0, 0.5, |x| {
            if (x - 1.0).abs() < 1e-12 {
                0.0
            } else {
                f64::NEG_INFINITY
            }
        });
        assert_eq!(state, 1.0);
        assert_eq!(accept, 0.0);
    }
}
