//! Moment-based summary statistics.
//!
//! Conventions match NumPy: empty input yields NaN, NaN inputs propagate,
//! and `population_std` uses ddof = 0. Callers filter non-finite samples
//! before summarizing.

/// Arithmetic mean. NaN for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (ddof = 0). NaN for empty input.
///
/// Two-pass computation: the mean is subtracted before squaring, which
/// keeps the result stable for series with a large offset.
pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / values.len() as f64).sqrt()
}

/// Exponentially weighted moving average.
///
/// With no previous value the average initializes to `value`, so the
/// first observation is never damped toward zero.
pub fn ewma(prev: Option<f64>, value: f64, alpha: f64) -> f64 {
    match prev {
        None => value,
        Some(p) => alpha * value + (1.0 - alpha) * p,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        if a.is_nan() || b.is_nan() {
            return false;
        }
        (a - b).abs() <= tol
    }

    #[test]
    fn mean_basic() {
        assert!(approx_eq(mean(&[1.0, 2.0, 3.0]), 2.0, 1e-12));
    }

    #[test]
    fn mean_empty_is_nan() {
        assert!(mean(&[]).is_nan());
    }

    #[test]
    fn population_std_known_series() {
        // [2, 4, 4, 4, 5, 5, 7, 9] has population std exactly 2
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!(approx_eq(population_std(&v), 2.0, 1e-12));
    }

    #[test]
    fn population_std_constant_series_is_zero() {
        let v = [5.0; 16];
        assert!(approx_eq(population_std(&v), 0.0, 1e-12));
    }

    #[test]
    fn population_std_offset_stability() {
        let base = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let shifted: Vec<f64> = base.iter().map(|v| v + 1.0e9).collect();
        assert!(approx_eq(population_std(&shifted), 2.0, 1e-3));
    }

    #[test]
    fn ewma_initializes_to_first_value() {
        assert!(approx_eq(ewma(None, 42.0, 0.3), 42.0, 1e-12));
    }

    #[test]
    fn ewma_blends_toward_new_value() {
        let out = ewma(Some(10.0), 20.0, 0.3);
        assert!(approx_eq(out, 13.0, 1e-12));
    }
}
