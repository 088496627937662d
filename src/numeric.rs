//! Floating point tolerance helpers, thin wrappers around the approx crate.
//!
//! Population values are `f64` and accumulate rounding error as they flow through the graph.
//! These helpers decide when a discrepancy is rounding noise and when it is a real modeling
//! violation.

use approx::AbsDiffEq;

/// Tolerance separating floating point noise from a modeling violation when a bucket's population
/// is compared against the outflow taken from it. Scaled by the bucket's magnitude when above 1.
pub const NEGATIVE_TOLERANCE: f64 = 1e-9;

/// True when `a` and `b` differ by at most `acc`. Infinities are only equal to themselves.
#[must_use]
pub fn almost_eq(a: f64, b: f64, acc: f64) -> bool {
    if a.is_infinite() && b.is_infinite() {
        return a == b;
    }
    a.abs_diff_eq(&b, acc)
}

/// True when `value` is larger than `limit` by more than the rounding noise expected at the
/// magnitude of `limit`.
#[must_use]
pub fn exceeds(value: f64, limit: f64) -> bool {
    value - limit > NEGATIVE_TOLERANCE * limit.abs().max(1.0)
}

#[macro_export]
macro_rules! assert_almost_eq {
    ($a:expr, $b:expr, $prec:expr $(,)?) => {
        if !$crate::numeric::almost_eq($a, $b, $prec) {
            panic!(
                "assertion failed: `abs(left - right) < {:e}`, (left: `{}`, right: `{}`)",
                $prec, $a, $b
            );
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_almost_eq;

    #[test]
    fn population_totals_compare_absolutely() {
        // 0.1 ten times is not exactly 1.0
        let total: f64 = std::iter::repeat_n(0.1, 10).sum();
        assert_ne!(total, 1.0);
        assert!(almost_eq(total, 1.0, 1e-12));
        assert!(!almost_eq(590.49, 590.5, 1e-3));
        assert!(almost_eq(f64::INFINITY, f64::INFINITY, 0.0));
        assert!(!almost_eq(f64::INFINITY, f64::NEG_INFINITY, 1e9));
    }

    #[test]
    fn exceeds_ignores_rounding_noise() {
        assert!(!exceeds(100.0 + 1e-12, 100.0));
        assert!(!exceeds(1e6 * (1.0 + 1e-12), 1e6));
        assert!(exceeds(100.5, 100.0));
        assert!(exceeds(1e-6, 0.0));
    }

    #[test]
    fn macro_accepts_decay_rounding() {
        assert_almost_eq!(1000.0 * 0.9_f64.powi(4), 656.1, 1e-9);
    }

    #[test]
    #[should_panic(expected = "abs(left - right)")]
    fn macro_reports_the_difference() {
        assert_almost_eq!(729.0, 729.01, 1e-3);
    }
}
