//! Ownership statistics for an allocation ring.

use std::fmt;

/// Growth of ownership standard deviation above which an allocation warns.
pub const WARN_STDEV_GROWTH: f64 = 0.05;

/// Summary of per-token replicated ownership across ring members.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OwnershipStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

impl OwnershipStats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        // Sample standard deviation, as reported by the usual summary tools.
        let stddev = if values.len() > 1 {
            (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        Self {
            count: values.len(),
            mean,
            min,
            max,
            stddev,
        }
    }

    /// Standard deviation relative to the mean.
    pub fn relative_stddev(&self) -> f64 {
        if self.mean == 0.0 {
            0.0
        } else {
            self.stddev / self.mean
        }
    }

    /// How much the standard deviation grew going from `self` to `after`.
    pub fn stddev_growth(&self, after: &OwnershipStats) -> f64 {
        after.stddev - self.stddev
    }

    pub fn exceeds_warning(&self, after: &OwnershipStats) -> bool {
        self.stddev_growth(after) > WARN_STDEV_GROWTH
    }

    /// Warning to log when going from `self` to `after` unbalanced the ring.
    pub fn growth_warning(&self, after: &OwnershipStats) -> Option<String> {
        self.exceeds_warning(after).then(|| {
            format!(
                "Growth of {:.2}% in token ownership standard deviation after allocation above warning threshold of {}%",
                self.stddev_growth(after) * 100.0,
                (WARN_STDEV_GROWTH * 100.0).round() as u32
            )
        })
    }
}

impl fmt::Display for OwnershipStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mean == 0.0 {
            return write!(f, "empty");
        }
        write!(
            f,
            "max {:.2} min {:.2} stddev {:.4}",
            self.max / self.mean,
            self.min / self.mean,
            self.stddev
        )
    }
}
