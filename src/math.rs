use std::f64::consts::SQRT_2;

use statrs::consts::LN_SQRT_2PI;
use statrs::function::erf::{erfc, erfc_inv};

/// Cumulative distribution function of the standard normal.
#[inline]
pub fn std_normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Quantile (probit) of the standard normal. Returns ±∞ at 0 and 1.
#[inline]
pub fn std_normal_quantile(p: f64) -> f64 {
    -SQRT_2 * erfc_inv(2. * p)
}

#[inline]
pub fn std_normal_ln_pdf(x: f64) -> f64 {
    -0.5 * x * x - LN_SQRT_2PI
}

#[inline]
pub fn normal_ln_pdf(x: f64, mean: f64, std: f64) -> f64 {
    let z = (x - mean) / std;
    -0.5 * z * z - LN_SQRT_2PI - std.ln()
}

/// Log of the Metropolis ratio for a standard normal target in every
/// dimension.
///
/// Identical vectors give exactly zero, so such a move is always accepted.
pub fn log_acceptance_ratio(candidate: &[f64], current: &[f64]) -> f64 {
    assert!(candidate.len() == current.len());
    candidate
        .iter()
        .zip(current)
        .map(|(&c, &p)| std_normal_ln_pdf(c) - std_normal_ln_pdf(p))
        .fold(0f64, |acc, term| acc + term)
}

/// Acceptance test in log space: `ln(u) < log_ratio`.
#[inline]
pub fn accept(log_ratio: f64, uniform: f64) -> bool {
    uniform.ln() < log_ratio
}

/// Mean and population standard deviation.
///
/// Returns `None` for an empty input.
pub fn mean_std<I>(values: I) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = f64>,
    I::IntoIter: Clone,
{
    let values = values.into_iter();
    let (count, sum) = values
        .clone()
        .fold((0usize, 0f64), |(count, sum), x| (count + 1, sum + x));
    if count == 0 {
        return None;
    }
    let mean = sum / count as f64;
    let sq = values.fold(0f64, |acc, x| acc + (x - mean) * (x - mean));
    Some((mean, (sq / count as f64).sqrt()))
}
