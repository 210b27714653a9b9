//! Rank-1 update and downdate of an upper-triangular Cholesky factor.
//!
//! Given `R` with `A = RᵀR`, [`rank_one_update`] produces the factor of
//! `A + uuᵀ` using Givens rotations and [`rank_one_downdate`] the factor of
//! `A − uuᵀ` using hyperbolic rotations, both column by column in O(p²).
//! The strictly-lower part of the two leftmost columns of `R` is used as
//! rotation scratch and zeroed again before returning.
//!
//! A downdate can fail when `A − uuᵀ` is not positive definite. The factor
//! is left partially transformed in that case; callers that need to recover
//! must snapshot `R` beforehand.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CholeskyError {
    #[error("rank-1 downdate left the matrix indefinite at column {column}")]
    NotPositiveDefinite { column: usize },
}

const DOWNDATE_EPS: f64 = 1e-12;

fn zero_scratch(r: &mut DMatrix<f64>) {
    let n = r.nrows();
    for k in 0..n.saturating_sub(2) {
        r[(2 + k, 0)] = 0.0;
        r[(2 + k, 1)] = 0.0;
    }
}

/// Update `R` in place so that `RᵀR` becomes `RᵀR + uuᵀ`.
pub fn rank_one_update(r: &mut DMatrix<f64>, u: &DVector<f64>) {
    let n = r.nrows();
    debug_assert_eq!(r.ncols(), n);
    debug_assert_eq!(u.len(), n);

    let mut c0 = 0.0;
    let mut s0 = 0.0;
    for j in 0..n {
        let mut z = u[j];
        // rotations from earlier columns, oldest first
        for k in 0..j.saturating_sub(1) {
            let c = r[(2 + k, 0)];
            let s = r[(2 + k, 1)];
            let z0 = z;
            z = c * z - s * r[(k, j)];
            r[(k, j)] = s * z0 + c * r[(k, j)];
        }
        if j > 0 {
            let z0 = z;
            let x = r[(j - 1, j)];
            z = c0 * z - s0 * x;
            r[(j - 1, j)] = s0 * z0 + c0 * x;
            if j < n - 1 {
                r[(2 + j - 1, 0)] = c0;
                r[(2 + j - 1, 1)] = s0;
            }
        }
        // construct the rotation that zeroes z against R[j, j]
        let x = r[(j, j)];
        let z0 = z.hypot(x);
        c0 = x / z0;
        s0 = z / z0;
        r[(j, j)] = s0 * z + c0 * x;
    }
    zero_scratch(r);
}

/// Update `R` in place so that `RᵀR` becomes `RᵀR − uuᵀ`.
///
/// Fails when the downdated matrix is not positive definite; the factor is
/// left in an unspecified state on failure.
pub fn rank_one_downdate(r: &mut DMatrix<f64>, u: &DVector<f64>) -> Result<(), CholeskyError> {
    let n = r.nrows();
    debug_assert_eq!(r.ncols(), n);
    debug_assert_eq!(u.len(), n);

    let mut c0 = 0.0;
    let mut s0 = 0.0;
    for j in 0..n {
        let mut z = u[j];
        for k in 0..j.saturating_sub(1) {
            let c = r[(2 + k, 0)];
            let s = r[(2 + k, 1)];
            let z0 = z;
            z = c * z - s * r[(k, j)];
            r[(k, j)] = -s * z0 + c * r[(k, j)];
        }
        if j > 0 {
            let z0 = z;
            let x = r[(j - 1, j)];
            z = c0 * z - s0 * x;
            r[(j - 1, j)] = -s0 * z0 + c0 * x;
            if j < n - 1 {
                r[(2 + j - 1, 0)] = c0;
                r[(2 + j - 1, 1)] = s0;
            }
        }
        let x = r[(j, j)];
        let mut z0 = z / x;
        if z0.abs() >= 1.0 {
            zero_scratch(r);
            return Err(CholeskyError::NotPositiveDefinite { column: j });
        }
        if z0 > 1.0 - DOWNDATE_EPS {
            z0 = 1.0 - DOWNDATE_EPS;
        }
        c0 = 1.0 / (1.0 - z0 * z0).sqrt();
        s0 = c0 * z0;
        r[(j, j)] = -s0 * z + c0 * x;
    }
    zero_scratch(r);
    Ok(())
}

/// Symmetric rank-2 update: `RᵀR` becomes `RᵀR + vwᵀ + wvᵀ`, decomposed into
/// one rank-1 update with `(v + w)/√2` and one downdate with `(v − w)/√2`.
pub fn rank_two_update(
    r: &mut DMatrix<f64>,
    v: &DVector<f64>,
    w: &DVector<f64>,
) -> Result<(), CholeskyError> {
    let inv_sqrt2 = std::f64::consts::FRAC_1_SQRT_2;
    let u1 = (v + w) * inv_sqrt2;
    let u2 = (v - w) * inv_sqrt2;
    rank_one_update(r, &u1);
    rank_one_downdate(r, &u2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn upper_factor(a: &DMatrix<f64>) -> DMatrix<f64> {
        nalgebra::Cholesky::new(a.clone())
            .expect("test matrix must be positive definite")
            .l()
            .transpose()
    }

    fn random_spd(p: usize, vals: &[f64]) -> DMatrix<f64> {
        let b = DMatrix::from_fn(p, p, |i, j| vals[(i * p + j) % vals.len()]);
        &b.transpose() * &b + DMatrix::identity(p, p)
    }

    #[test]
    fn update_matches_direct_factorization() {
        for p in [1usize, 2, 3, 5, 8] {
            let vals: Vec<f64> = (0..p * p).map(|k| ((k * 7 + 3) % 11) as f64 / 11.0).collect();
            let a = random_spd(p, &vals);
            let u = DVector::from_fn(p, |i, _| 0.3 * (i as f64 + 1.0) / p as f64);

            let mut r = upper_factor(&a);
            rank_one_update(&mut r, &u);

            let expect = upper_factor(&(&a + &u * u.transpose()));
            assert_relative_eq!(r, expect, epsilon = 1e-9);
        }
    }

    #[test]
    fn downdate_matches_direct_factorization() {
        let a = random_spd(4, &[0.4, -0.2, 0.9, 0.1, 0.7, -0.5, 0.3, 0.2]);
        let u = DVector::from_vec(vec![0.2, -0.1, 0.15, 0.05]);
        let mut r = upper_factor(&(&a + &u * u.transpose()));
        rank_one_downdate(&mut r, &u).unwrap();
        assert_relative_eq!(r, upper_factor(&a), epsilon = 1e-8);
    }

    #[test]
    fn downdate_detects_indefinite_result() {
        let a = DMatrix::identity(3, 3);
        let mut r = upper_factor(&a);
        let u = DVector::from_vec(vec![2.0, 0.0, 0.0]);
        assert!(rank_one_downdate(&mut r, &u).is_err());
    }

    #[test]
    fn rank_two_matches_direct_factorization() {
        let a = random_spd(5, &[0.3, 0.8, -0.1, 0.6, 0.2, -0.4, 0.5]);
        let v = DVector::from_vec(vec![0.0, -1.0, 0.0, 0.0, 0.0]);
        let w = DVector::from_vec(vec![0.0, 0.12, 0.0, 0.0, -0.07]);

        let mut r = upper_factor(&a);
        rank_two_update(&mut r, &v, &w).unwrap();

        let sym = &v * w.transpose() + &w * v.transpose();
        let expect = upper_factor(&(&a + sym));
        assert_relative_eq!(r, expect, epsilon = 1e-8);
    }

    #[test]
    fn scratch_columns_are_zeroed() {
        let a = random_spd(6, &[0.9, 0.1, -0.3, 0.5]);
        let mut r = upper_factor(&a);
        let u = DVector::from_element(6, 0.2);
        rank_one_update(&mut r, &u);
        for i in 2..6 {
            assert_eq!(r[(i, 0)], 0.0);
            assert_eq!(r[(i, 1)], 0.0);
        }
    }

    proptest! {
        #[test]
        fn update_then_downdate_restores_factor(
            seed in 0u64..1000,
            scale in 0.01f64..0.8,
        ) {
            let p = 4;
            let vals: Vec<f64> = (0..16)
                .map(|k| (((seed + k) * 2654435761) % 1000) as f64 / 1000.0 - 0.5)
                .collect();
            let a = random_spd(p, &vals);
            let r0 = upper_factor(&a);
            let u = DVector::from_fn(p, |i, _| scale * ((i as f64) - 1.5) / 4.0);

            let mut r = r0.clone();
            rank_one_update(&mut r, &u);
            rank_one_downdate(&mut r, &u).unwrap();

            prop_assert!((&r - &r0).norm() < 1e-10 * (1.0 + r0.norm()));
        }
    }
}
