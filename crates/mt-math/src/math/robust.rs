//! Order statistics and robust dispersion measures.
//!
//! Median, MAD, and percentiles follow NumPy semantics: percentile uses
//! linear interpolation between the two nearest ranks, median of an
//! even-length series averages the two middle elements.

/// Consistency factor relating MAD to the standard deviation of a
/// normal distribution: sigma ~= 1.4826 * MAD.
pub const MAD_CONSISTENCY: f64 = 1.4826;

fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted
}

/// Median. NaN for empty input.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let sorted = sorted_copy(values);
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Median absolute deviation from the median. NaN for empty input.
pub fn mad(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let med = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations)
}

/// Percentile with linear interpolation, `q` in [0, 100].
///
/// NaN for empty input; `q` outside the range clamps to the endpoints.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let sorted = sorted_copy(values);
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let q = q.clamp(0.0, 100.0);
    let rank = (n - 1) as f64 * q / 100.0;
    let lower = rank.floor() as usize;
    let frac = rank - lower as f64;
    if lower + 1 >= n {
        return sorted[n - 1];
    }
    sorted[lower] + frac * (sorted[lower + 1] - sorted[lower])
}
