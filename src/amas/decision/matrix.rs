//! Dense row-major linear algebra for the ridge-regression bandit.
//!
//! Matrices are flat `Vec<f64>` of length `d * d`.

pub const MIN_LAMBDA: f64 = 1e-3;
pub const MIN_RANK1_DIAG: f64 = 1e-6;
pub const EPSILON: f64 = 1e-10;
pub const MAX_FEATURE_ABS: f64 = 50.0;
pub const MAX_COVARIANCE: f64 = 1e9;
const MAX_CONDITION_ESTIMATE: f64 = 1e8;

pub fn identity_scaled(d: usize, scale: f64) -> Vec<f64> {
    let mut m = vec![0.0; d * d];
    for i in 0..d {
        m[i * d + i] = scale;
    }
    m
}

/// Full Cholesky decomposition. Non-positive pivots are replaced by `sqrt(lambda)`
/// so the result is always usable as a factor.
pub fn cholesky_decompose(a: &[f64], d: usize, lambda: f64) -> Vec<f64> {
    let safe_lambda = lambda.max(MIN_LAMBDA);
    let mut l = vec![0.0; d * d];

    for i in 0..d {
        for j in 0..=i {
            let mut sum = a[i * d + j];
            if i == j {
                sum += safe_lambda * EPSILON;
            }
            for k in 0..j {
                sum -= l[i * d + k] * l[j * d + k];
            }

            if i == j {
                l[i * d + i] = if sum > 0.0 && sum.is_finite() {
                    sum.sqrt()
                } else {
                    safe_lambda.sqrt()
                };
            } else {
                let diag = l[j * d + j];
                l[i * d + j] = if diag.abs() > EPSILON { sum / diag } else { 0.0 };
            }
        }
    }

    l
}

/// Givens-rotation rank-1 update of `L` so that `L Lᵀ` becomes `L Lᵀ + x xᵀ`.
///
/// Returns `false` when a pivot collapses; `l` must then be recomputed.
pub fn cholesky_rank1_update(l: &mut [f64], x: &[f64], d: usize, min_diag: f64) -> bool {
    let safe_min_diag = min_diag.max(MIN_RANK1_DIAG);
    let mut work = x.to_vec();

    for k in 0..d {
        let l_kk = l[k * d + k];
        let x_k = work[k];
        let r = (l_kk * l_kk + x_k * x_k).sqrt();

        if !r.is_finite() || r < safe_min_diag {
            return false;
        }

        let c = l_kk / r;
        let s = x_k / r;
        l[k * d + k] = r;

        for i in (k + 1)..d {
            let l_ik = l[i * d + k];
            let x_i = work[i];
            l[i * d + k] = c * l_ik + s * x_i;
            work[i] = -s * l_ik + c * x_i;
        }
    }

    (0..d).all(|i| {
        let diag = l[i * d + i];
        diag.is_finite() && diag >= safe_min_diag
    })
}

pub fn solve_triangular_lower(l: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut x = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[i * n + j] * x[j];
        }
        let diag = l[i * n + i];
        x[i] = if diag.abs() > EPSILON { sum / diag } else { 0.0 };
    }
    x
}

fn solve_triangular_upper_transpose(l: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = b[i];
        for j in (i + 1)..n {
            sum -= l[j * n + i] * x[j];
        }
        let diag = l[i * n + i];
        x[i] = if diag.abs() > EPSILON { sum / diag } else { 0.0 };
    }
    x
}

/// Solves `(L Lᵀ) x = b`.
pub fn solve_cholesky(l: &[f64], b: &[f64], d: usize) -> Vec<f64> {
    let y = solve_triangular_lower(l, b, d);
    solve_triangular_upper_transpose(l, &y, d)
}

/// `xᵀ A⁻¹ x` computed as `‖L⁻¹x‖²`.
pub fn quadratic_form(l: &[f64], x: &[f64], d: usize) -> f64 {
    solve_triangular_lower(l, x, d).iter().map(|v| v * v).sum()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn mat_vec_mul(a: &[f64], x: &[f64], d: usize) -> Vec<f64> {
    let mut out = vec![0.0; d];
    for i in 0..d {
        for j in 0..d {
            out[i] += a[i * d + j] * x[j];
        }
    }
    out
}

pub fn rank1_update_matrix(a: &mut [f64], x: &[f64], d: usize) {
    for i in 0..d {
        for j in 0..d {
            a[i * d + j] += x[i] * x[j];
        }
    }
}

pub fn vec_add_scaled(a: &mut [f64], b: &[f64], scale: f64) {
    for (ai, bi) in a.iter_mut().zip(b.iter()) {
        *ai += scale * bi;
    }
}

pub fn has_invalid_values(values: &[f64]) -> bool {
    values.iter().any(|v| !v.is_finite())
}

pub fn sanitize_feature_vector(x: &mut [f64]) {
    for val in x.iter_mut() {
        if !val.is_finite() {
            *val = 0.0;
        } else {
            *val = val.clamp(-MAX_FEATURE_ABS, MAX_FEATURE_ABS);
        }
    }
}

/// Restores symmetry, finiteness and a positive diagonal floor on `a`.
pub fn sanitize_covariance(a: &mut [f64], d: usize, lambda: f64) {
    let safe_lambda = lambda.max(MIN_LAMBDA);

    for i in 0..d {
        for j in 0..d {
            let idx = i * d + j;
            let val = a[idx];
            if !val.is_finite() {
                a[idx] = if i == j { safe_lambda } else { 0.0 };
            } else if val.abs() > MAX_COVARIANCE {
                a[idx] = val.signum() * MAX_COVARIANCE;
            }
        }
        let diag = i * d + i;
        if a[diag] < safe_lambda {
            a[diag] = safe_lambda;
        }
    }

    for i in 0..d {
        for j in (i + 1)..d {
            let avg = (a[i * d + j] + a[j * d + i]) / 2.0;
            a[i * d + j] = avg;
            a[j * d + i] = avg;
        }
    }
}

/// Whether the factor should be rebuilt from scratch rather than trusted.
pub fn needs_full_recompute(update_count: u64, interval: u64, l: &[f64], d: usize) -> bool {
    if l.len() != d * d {
        return true;
    }
    if interval > 0 && update_count > 0 && update_count % interval == 0 {
        return true;
    }

    let mut min_diag = f64::MAX;
    let mut max_diag = 0.0_f64;
    for i in 0..d {
        let diag = l[i * d + i];
        if !diag.is_finite() || diag < MIN_RANK1_DIAG {
            return true;
        }
        min_diag = min_diag.min(diag);
        max_diag = max_diag.max(diag);
    }

    d > 0 && max_diag / min_diag > MAX_CONDITION_ESTIMATE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(l: &[f64], d: usize) -> Vec<f64> {
        let mut a = vec![0.0; d * d];
        for i in 0..d {
            for j in 0..d {
                for k in 0..d {
                    a[i * d + j] += l[i * d + k] * l[j * d + k];
                }
            }
        }
        a
    }

    #[test]
    fn cholesky_of_identity_is_identity() {
        let l = cholesky_decompose(&identity_scaled(3, 1.0), 3, 1.0);
        for i in 0..3 {
            assert!((l[i * 3 + i] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn solve_cholesky_inverts_system() {
        let d = 2;
        let a = vec![2.0, 1.0, 1.0, 2.0];
        let b = vec![1.0, 2.0];
        let l = cholesky_decompose(&a, d, 1.0);
        let x = solve_cholesky(&l, &b, d);
        let ax = mat_vec_mul(&a, &x, d);
        for i in 0..d {
            assert!((ax[i] - b[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn rank1_update_matches_full_decomposition() {
        let d = 3;
        let mut a = vec![4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0];
        let mut l = cholesky_decompose(&a, d, 1.0);
        let x = vec![0.3, -0.7, 1.1];

        assert!(cholesky_rank1_update(&mut l, &x, d, MIN_RANK1_DIAG));
        rank1_update_matrix(&mut a, &x, d);

        let rebuilt = reconstruct(&l, d);
        for (lhs, rhs) in rebuilt.iter().zip(a.iter()) {
            assert!((lhs - rhs).abs() < 1e-6);
        }
    }

    #[test]
    fn quadratic_form_of_identity_is_squared_norm() {
        let l = identity_scaled(2, 1.0);
        assert!((quadratic_form(&l, &[3.0, 4.0], 2) - 25.0).abs() < 1e-10);
    }

    #[test]
    fn sanitize_covariance_symmetrizes_and_floors() {
        let mut a = vec![f64::NAN, 2.0, 0.0, -5.0];
        sanitize_covariance(&mut a, 2, 1.0);
        assert_eq!(a[0], 1.0);
        assert_eq!(a[1], a[2]);
        assert_eq!(a[3], 1.0);
    }

    #[test]
    fn wrong_sized_factor_needs_recompute() {
        assert!(needs_full_recompute(1, 100, &[1.0], 2));
        assert!(!needs_full_recompute(1, 100, &identity_scaled(2, 1.0), 2));
        assert!(needs_full_recompute(100, 100, &identity_scaled(2, 1.0), 2));
    }
}
