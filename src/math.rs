//! Scalar numeric helpers shared by the samplers and models.

use std::f64::consts::PI;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// log(1 + exp(x)) without overflow for large |x|.
#[inline]
pub(crate) fn log1p_exp(x: f64) -> f64 {
    if x > 0. {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

#[inline]
pub(crate) fn log_normal_pdf(x: f64, mu: f64, sd: f64) -> f64 {
    let z = (x - mu) / sd;
    -0.5 * z * z - sd.ln() - 0.5 * (2. * PI).ln()
}

#[inline]
pub(crate) fn log_cauchy_pdf(x: f64, scale: f64) -> f64 {
    let z = x / scale;
    -PI.ln() - scale.ln() - (z * z).ln_1p()
}

/// Log density of Gamma(shape, scale) at x > 0.
#[inline]
pub(crate) fn log_gamma_pdf(x: f64, shape: f64, scale: f64) -> f64 {
    (shape - 1.) * x.ln() - x / scale
        - shape * scale.ln()
        - statrs::function::gamma::ln_gamma(shape)
}
