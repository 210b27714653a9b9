//! Stabilized per-variable partition functions and probability tables.
//!
//! For each observation the conditional of one categorical variable given
//! the rest is an exponential family whose exponents combine the main
//! effects with the residual score `r_i`. These kernels produce the
//! `(n × K+1)` category-probability table and the length-`n` vector of
//! log-partition values in a single pass.
//!
//! Observations are processed in contiguous runs. Where the overflow bound
//! stays inside ±709 a pre-exponentiated power chain is used (`exp(r)`
//! raised incrementally per category); outside that range a direct
//! exp-of-sum fallback evaluates each shifted exponent.

use multiversion::multiversion;
use nalgebra::{DMatrix, DVector};

use crate::errors::{Result, SamplerError};

/// Largest argument for which `exp` stays finite in f64.
const EXP_BOUND: f64 = 709.0;

pub struct LogZProbs {
    /// Row-stochastic table, one row per observation, `K+1` columns.
    pub probs: DMatrix<f64>,
    /// Log-partition value per observation.
    pub log_z: DVector<f64>,
}

#[inline]
fn block_end(flags: impl Fn(usize) -> bool, start: usize, n: usize) -> usize {
    let fast = flags(start);
    let mut j = start + 1;
    while j < n && flags(j) == fast {
        j += 1;
    }
    j
}

// ---------------------------------------------------------------------------
// Ordinal variables: numerator(0) = 1, numerator(c) = exp(main[c-1] + c * r)
// ---------------------------------------------------------------------------

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn ordinal_fast_block(
    e_main: &[f64],
    residual: &[f64],
    bound: &[f64],
    table: &mut [f64],
    log_z: &mut [f64],
    range: (usize, usize),
    n: usize,
) {
    let k = e_main.len();
    for i in range.0..range.1 {
        let e_r = residual[i].exp();
        let e_b = (-bound[i]).exp();
        let mut pow = e_r;
        let mut den = e_b;
        for (c, &em) in e_main.iter().enumerate() {
            let term = em * pow * e_b;
            table[(c + 1) * n + i] = term;
            den += term;
            pow *= e_r;
        }
        let inv = 1.0 / den;
        for c in 0..k {
            table[(c + 1) * n + i] *= inv;
        }
        log_z[i] = bound[i] + den.ln();
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn ordinal_safe_block(
    main: &[f64],
    residual: &[f64],
    bound: &[f64],
    table: &mut [f64],
    log_z: &mut [f64],
    range: (usize, usize),
    n: usize,
) {
    let k = main.len();
    for i in range.0..range.1 {
        let b = bound[i].max(0.0);
        let mut den = (-b).exp();
        for (c, &m) in main.iter().enumerate() {
            let term = (m + (c + 1) as f64 * residual[i] - b).exp();
            table[(c + 1) * n + i] = term;
            den += term;
        }
        let inv = 1.0 / den;
        for c in 0..k {
            table[(c + 1) * n + i] *= inv;
        }
        log_z[i] = b + den.ln();
    }
}

/// Joint probability table and log-partition vector for an ordinal variable
/// with `main.len()` non-baseline categories. `bound` is the caller-supplied
/// overflow bound `K · r` per observation.
pub fn logz_probs_ordinal(main: &[f64], residual: &[f64], bound: &[f64]) -> Result<LogZProbs> {
    let n = residual.len();
    let k = main.len();
    debug_assert_eq!(bound.len(), n);

    let mut probs = DMatrix::<f64>::zeros(n, k + 1);
    let mut log_z = DVector::<f64>::zeros(n);

    if k == 1 {
        // Binary shortcut: the conditional collapses to a logistic.
        for i in 0..n {
            let b = bound[i].max(0.0);
            let t = (main[0] + residual[i] - b).exp();
            let den = (-b).exp() + t;
            probs[(i, 1)] = t / den;
            probs[(i, 0)] = 1.0 - probs[(i, 1)];
            log_z[i] = b + den.ln();
        }
        return finish(probs, log_z);
    }

    let e_main: Vec<f64> = main.iter().map(|m| m.exp()).collect();
    {
        let table = probs.as_mut_slice();
        let lz = log_z.as_mut_slice();
        let mut i = 0;
        while i < n {
            let fast = bound[i].abs() <= EXP_BOUND;
            let j = block_end(|t| bound[t].abs() <= EXP_BOUND, i, n);
            if fast {
                ordinal_fast_block(&e_main, residual, bound, table, lz, (i, j), n);
            } else {
                ordinal_safe_block(main, residual, bound, table, lz, (i, j), n);
            }
            i = j;
        }
    }

    for i in 0..n {
        let mut sum = 0.0;
        for c in 1..=k {
            sum += probs[(i, c)];
        }
        probs[(i, 0)] = (1.0 - sum).max(0.0);
    }
    finish(probs, log_z)
}

/// Per-observation denominator for an ordinal conditional; the exponents are
/// shifted by the caller's `bound` without clamping, so paired denominators
/// cancel exactly in likelihood ratios.
pub fn denom_ordinal(main: &[f64], residual: &[f64], bound: &[f64]) -> Vec<f64> {
    let n = residual.len();
    let k = main.len();
    let mut denom = vec![0.0; n];

    if k == 1 {
        for i in 0..n {
            denom[i] = (-bound[i]).exp() + (main[0] + residual[i] - bound[i]).exp();
        }
        return denom;
    }

    let e_main: Vec<f64> = main.iter().map(|m| m.exp()).collect();
    let mut i = 0;
    while i < n {
        let fast = bound[i].abs() <= EXP_BOUND;
        let j = block_end(|t| bound[t].abs() <= EXP_BOUND, i, n);
        if fast {
            for t in i..j {
                let e_r = residual[t].exp();
                let e_b = (-bound[t]).exp();
                let mut pow = e_r;
                let mut d = e_b;
                for &em in &e_main {
                    d += em * pow * e_b;
                    pow *= e_r;
                }
                denom[t] = d;
            }
        } else {
            for t in i..j {
                let mut d = (-bound[t]).exp();
                for (c, &m) in main.iter().enumerate() {
                    d += (m + (c + 1) as f64 * residual[t] - bound[t]).exp();
                }
                denom[t] = d;
            }
        }
        i = j;
    }
    denom
}

// ---------------------------------------------------------------------------
// Blume-Capel variables: numerator(c) = exp(theta(c) + (c - b) * r) with
// theta(c) = lin * (c - b) + quad * (c - b)^2, categories 0..=K.
// ---------------------------------------------------------------------------

struct BcExponents {
    centered: Vec<f64>,
    theta: Vec<f64>,
    e_theta: Vec<f64>,
}

fn bc_exponents(lin: f64, quad: f64, baseline: usize, num_cats: usize) -> BcExponents {
    let centered: Vec<f64> = (0..=num_cats).map(|c| c as f64 - baseline as f64).collect();
    let theta: Vec<f64> = centered.iter().map(|&s| lin * s + quad * s * s).collect();
    let e_theta: Vec<f64> = theta.iter().map(|t| t.exp()).collect();
    BcExponents {
        centered,
        theta,
        e_theta,
    }
}

/// Per-observation overflow bound: the largest exponent over categories.
fn bc_bound(exps: &BcExponents, residual: &[f64]) -> Vec<f64> {
    residual
        .iter()
        .map(|&r| {
            exps.theta
                .iter()
                .zip(exps.centered.iter())
                .map(|(&t, &s)| t + s * r)
                .fold(f64::NEG_INFINITY, f64::max)
        })
        .collect()
}

fn bc_fast_flags(exps: &BcExponents, residual: &[f64], bound: &[f64]) -> Vec<bool> {
    let lo = exps.centered[0];
    let hi = *exps.centered.last().unwrap();
    residual
        .iter()
        .zip(bound.iter())
        .map(|(&r, &b)| {
            let pow_bound = (lo * r - b).abs().max((hi * r - b).abs());
            b.abs() <= EXP_BOUND && pow_bound <= EXP_BOUND
        })
        .collect()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn bc_fast_block(
    e_theta: &[f64],
    lo_centered: f64,
    residual: &[f64],
    bound: &[f64],
    table: &mut [f64],
    log_z: &mut [f64],
    range: (usize, usize),
    n: usize,
) {
    let cats = e_theta.len();
    for i in range.0..range.1 {
        let e_r = residual[i].exp();
        let mut pow = (lo_centered * residual[i] - bound[i]).exp();
        let mut den = 0.0;
        for (c, &et) in e_theta.iter().enumerate() {
            if c > 0 {
                pow *= e_r;
            }
            let term = et * pow;
            table[c * n + i] = term;
            den += term;
        }
        let inv = 1.0 / den;
        for c in 0..cats {
            table[c * n + i] *= inv;
        }
        log_z[i] = bound[i] + den.ln();
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn bc_safe_block(
    theta: &[f64],
    centered: &[f64],
    residual: &[f64],
    bound: &[f64],
    table: &mut [f64],
    log_z: &mut [f64],
    range: (usize, usize),
    n: usize,
) {
    let cats = theta.len();
    for i in range.0..range.1 {
        let mut den = 0.0;
        for c in 0..cats {
            let term = (theta[c] + centered[c] * residual[i] - bound[i]).exp();
            table[c * n + i] = term;
            den += term;
        }
        let inv = 1.0 / den;
        for c in 0..cats {
            table[c * n + i] *= inv;
        }
        log_z[i] = bound[i] + den.ln();
    }
}

/// Joint probability table and log-partition vector for a Blume-Capel
/// variable with categories `0..=num_cats` centered on `baseline`.
pub fn logz_probs_blume_capel(
    residual: &[f64],
    lin: f64,
    quad: f64,
    baseline: usize,
    num_cats: usize,
) -> Result<LogZProbs> {
    let n = residual.len();
    let exps = bc_exponents(lin, quad, baseline, num_cats);
    let bound = bc_bound(&exps, residual);
    let flags = bc_fast_flags(&exps, residual, &bound);

    let mut probs = DMatrix::<f64>::zeros(n, num_cats + 1);
    let mut log_z = DVector::<f64>::zeros(n);
    {
        let table = probs.as_mut_slice();
        let lz = log_z.as_mut_slice();
        let mut i = 0;
        while i < n {
            let j = block_end(|t| flags[t], i, n);
            if flags[i] {
                bc_fast_block(
                    &exps.e_theta,
                    exps.centered[0],
                    residual,
                    &bound,
                    table,
                    lz,
                    (i, j),
                    n,
                );
            } else {
                bc_safe_block(
                    &exps.theta,
                    &exps.centered,
                    residual,
                    &bound,
                    table,
                    lz,
                    (i, j),
                    n,
                );
            }
            i = j;
        }
    }
    finish(probs, log_z)
}

/// Per-observation denominator and bound for a Blume-Capel conditional.
pub fn denom_blume_capel(
    residual: &[f64],
    lin: f64,
    quad: f64,
    baseline: usize,
    num_cats: usize,
) -> (Vec<f64>, Vec<f64>) {
    let n = residual.len();
    let exps = bc_exponents(lin, quad, baseline, num_cats);
    let bound = bc_bound(&exps, residual);
    let flags = bc_fast_flags(&exps, residual, &bound);

    let mut denom = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let j = block_end(|t| flags[t], i, n);
        if flags[i] {
            for t in i..j {
                let e_r = residual[t].exp();
                let mut pow = (exps.centered[0] * residual[t] - bound[t]).exp();
                let mut d = 0.0;
                for (c, &et) in exps.e_theta.iter().enumerate() {
                    if c > 0 {
                        pow *= e_r;
                    }
                    d += et * pow;
                }
                denom[t] = d;
            }
        } else {
            for t in i..j {
                let mut d = 0.0;
                for c in 0..exps.theta.len() {
                    d += (exps.theta[c] + exps.centered[c] * residual[t] - bound[t]).exp();
                }
                denom[t] = d;
            }
        }
        i = j;
    }
    (denom, bound)
}

fn finish(probs: DMatrix<f64>, log_z: DVector<f64>) -> Result<LogZProbs> {
    if log_z.iter().any(|z| !z.is_finite()) {
        return Err(SamplerError::NumericOverflow);
    }
    Ok(LogZProbs { probs, log_z })
}
