//! Numeric helpers shared by the analysis methods.
//!
//! All functions are pure and return `None` for empty input rather than a
//! made-up zero.

/// Consistency constant making MAD comparable to a standard deviation for
/// normally distributed data.
pub const MAD_SCALE: f64 = 1.4826;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1). Needs at least two values.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median absolute deviation around the median (unscaled).
pub fn mad(values: &[f64]) -> Option<f64> {
    let m = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - m).abs()).collect();
    median(&deviations)
}

/// Smallest spread a deviation is measured against. Constant or near-constant
/// history would otherwise turn any small change into an extreme score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadFloor {
    /// In the metric's own units.
    pub absolute: f64,
    /// Fraction of the center's magnitude.
    pub relative: f64,
}

impl SpreadFloor {
    pub fn apply(&self, spread: f64, center: f64) -> f64 {
        let spread = if spread.is_finite() { spread } else { 0.0 };
        spread.max(self.absolute).max(self.relative * center.abs())
    }
}

/// Signed z-score of `value` against `center`, with `spread` raised to the
/// floor. `None` when the floored spread is still not positive.
pub fn floored_z(value: f64, center: f64, spread: f64, floor: SpreadFloor) -> Option<f64> {
    let spread = floor.apply(spread, center);
    if spread.is_nan() || spread <= 0.0 {
        return None;
    }
    Some((value - center) / spread).filter(|z| z.is_finite())
}

/// Ordinary least squares fit of `y` against its index. Returns `(slope, intercept)`.
pub fn ols(y: &[f64]) -> Option<(f64, f64)> {
    if y.len() < 2 {
        return None;
    }
    let n = y.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = mean(y)?;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (i, v) in y.iter().enumerate() {
        let dx = i as f64 - x_mean;
        sxy += dx * (v - y_mean);
        sxx += dx * dx;
    }
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    Some((slope, y_mean - slope * x_mean))
}

/// Percentile rank in `[0, 100]`, counting ties as half below.
pub fn percentile_rank(value: f64, population: &[f64]) -> Option<f64> {
    if population.is_empty() {
        return None;
    }
    let below = population.iter().filter(|v| **v < value).count() as f64;
    let equal = population.iter().filter(|v| **v == value).count() as f64;
    Some((below + 0.5 * equal) / population.len() as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_mad() {
        // median 3, deviations 2,1,0,1,6 -> median 1
        assert_eq!(mad(&[1.0, 2.0, 3.0, 4.0, 9.0]), Some(1.0));
    }

    #[test]
    fn test_zero_spread_uses_floor() {
        let floor = SpreadFloor {
            absolute: 1.0,
            relative: 0.05,
        };
        assert_eq!(floored_z(5.0, 5.0, 0.0, floor), Some(0.0));
        assert_eq!(floored_z(6.0, 5.0, 0.0, floor), Some(1.0));
        assert_eq!(floored_z(4.0, 5.0, 0.0, floor), Some(-1.0));
        assert_eq!(floored_z(8.0, 5.0, 1.5, floor), Some(2.0));
        assert_eq!(floored_z(1100.0, 1000.0, 0.0, floor), Some(2.0), "relative floor of 50");
        let none = SpreadFloor {
            absolute: 0.0,
            relative: 0.0,
        };
        assert_eq!(floored_z(6.0, 5.0, 0.0, none), None);
    }

    #[test]
    fn test_ols_recovers_line() {
        let (slope, intercept) = ols(&[1.0, 3.0, 5.0, 7.0]).expect("fit");
        assert!((slope - 2.0).abs() < 1e-12);
        assert!((intercept - 1.0).abs() < 1e-12);
        assert!(ols(&[1.0]).is_none());
    }

    #[test]
    fn test_std_dev_sample() {
        let sd = std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).expect("sd");
        assert!((sd - 2.138089935).abs() < 1e-6);
        assert!(std_dev(&[1.0]).is_none());
    }

    #[test]
    fn test_percentile_rank_ties() {
        let pop = [1.0, 2.0, 2.0, 3.0];
        assert_eq!(percentile_rank(2.0, &pop), Some(50.0));
        assert_eq!(percentile_rank(0.0, &pop), Some(0.0));
        assert_eq!(percentile_rank(9.0, &pop), Some(100.0));
    }
}
