//! Scoring terms

use std::cmp::Ordering;

/// Min-max normalization into [0, 1]; a degenerate range maps to 0
pub fn normalize(value: f64, min: f64, max: f64) -> f64 {
    let range = max - min;
    if !range.is_finite() || range.abs() < f64::EPSILON {
        return 0.0;
    }
    ((value - min) / range).clamp(0.0, 1.0)
}

/// (min, max) of a set of values; (0, 0) when empty
pub fn bounds(values: impl IntoIterator<Item = f64>) -> (f64, f64) {
    values
        .into_iter()
        .fold(None, |acc: Option<(f64, f64)>, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
        .unwrap_or((0.0, 0.0))
}

/// How well a capacity matches the demand it must serve.
///
/// `required = max(cpu_request, predicted_demand)`. Capacity inside
/// `required * (1 +/- tolerance)` scores 1, less scores 0, and more decays
/// with the over-provisioning ratio.
pub fn forecast_fit(capacity: f64, cpu_request: f64, predicted_demand: f64, tolerance: f64) -> f64 {
    let required = cpu_request.max(predicted_demand);
    if required <= 0.0 || capacity <= 0.0 {
        return 0.0;
    }
    let lower = required * (1.0 - tolerance);
    let upper = required * (1.0 + tolerance);
    if capacity < lower {
        0.0
    } else if capacity <= upper {
        1.0
    } else {
        upper / capacity
    }
}

/// Tie-break ordering: lower carbon, then lower projected energy cost, then
/// earlier discovery. `Less` means `a` wins.
pub fn tie_break(a: (f64, f64, usize), b: (f64, f64, usize)) -> Ordering {
    a.0.total_cmp(&b.0)
        .then_with(|| a.1.total_cmp(&b.1))
        .then_with(|| a.2.cmp(&b.2))
}
