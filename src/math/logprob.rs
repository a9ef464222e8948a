//! Log-domain probability arithmetic
//!
//! All lattice computations run in log space. Zero probability is a finite
//! sentinel rather than IEEE negative infinity: subtracting two infinities
//! yields NaN, and a single NaN poisons every downstream sum. Arithmetic
//! here saturates at the sentinel instead.

/// Log-domain zero. Finite so that differences stay well-defined.
pub const LOG_ZERO: f64 = -1.0e10;

/// Values at or below this threshold are treated as log-domain zero.
const LOG_ZERO_BARRIER: f64 = -0.5e10;

/// Whether a log-domain value represents zero probability.
#[inline]
pub fn is_log_zero(x: f64) -> bool {
    x <= LOG_ZERO_BARRIER
}

/// Natural log that maps non-positive inputs to [`LOG_ZERO`].
#[inline]
pub fn safe_ln(p: f64) -> f64 {
    if p > 0.0 {
        sanitize_ln(p.ln())
    } else {
        LOG_ZERO
    }
}

/// Map NaN and infinities to their finite log-domain stand-ins.
///
/// NaN and -inf become [`LOG_ZERO`]; +inf is clamped to the largest finite
/// value. The contract is that no non-number ever leaves this function.
#[inline]
pub fn sanitize_ln(x: f64) -> f64 {
    if x.is_nan() {
        LOG_ZERO
    } else if x == f64::INFINITY {
        f64::MAX
    } else if x == f64::NEG_INFINITY {
        LOG_ZERO
    } else {
        x
    }
}

/// Numerically stable `log(exp(a) + exp(b))` with the sentinel as identity.
#[inline]
pub fn log_add(a: f64, b: f64) -> f64 {
    if is_log_zero(a) {
        return b;
    }
    if is_log_zero(b) {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Log-sum-exp over a slice, skipping zero-probability entries.
pub fn log_sum(xs: &[f64]) -> f64 {
    let mut acc = LOG_ZERO;
    for &x in xs {
        acc = log_add(acc, x);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_add_identity() {
        assert_eq!(log_add(LOG_ZERO, -5.0), -5.0);
        assert_eq!(log_add(-5.0, LOG_ZERO), -5.0);
        assert_eq!(log_add(LOG_ZERO, LOG_ZERO), LOG_ZERO);
    }

    #[test]
    fn test_log_add_known_value() {
        // log(exp(0) + exp(0)) = ln 2
        let r = log_add(0.0, 0.0);
        assert!((r - 2.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_log_add_never_nan() {
        // The failure mode the sentinel exists for: -inf - -inf
        let r = log_add(LOG_ZERO, LOG_ZERO);
        assert!(!r.is_nan());

        let r2 = log_add(-1e9, -1e9);
        assert!(r2.is_finite());
    }

    #[test]
    fn test_safe_ln() {
        assert_eq!(safe_ln(0.0), LOG_ZERO);
        assert_eq!(safe_ln(-1.0), LOG_ZERO);
        assert!((safe_ln(1.0) - 0.0).abs() < 1e-15);
    }

    #[test]
    fn test_sanitize_ln() {
        assert_eq!(sanitize_ln(f64::NAN), LOG_ZERO);
        assert_eq!(sanitize_ln(f64::NEG_INFINITY), LOG_ZERO);
        assert_eq!(sanitize_ln(f64::INFINITY), f64::MAX);
        assert_eq!(sanitize_ln(-3.5), -3.5);
    }

    #[test]
    fn test_log_sum() {
        let xs = [0.5_f64.ln(), 0.25_f64.ln(), 0.25_f64.ln()];
        assert!((log_sum(&xs) - 0.0).abs() < 1e-12);
        assert_eq!(log_sum(&[]), LOG_ZERO);
    }
}
