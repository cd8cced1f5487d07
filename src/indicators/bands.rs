use super::{calculate_sma, calculate_stddev};

/// Price channel of mean +- k standard deviations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
}

/// Compute bands over the last `period` closes
///
/// Returns `None` when fewer than `period` closes are available.
pub fn calculate_bands(closes: &[f64], period: usize, multiplier: f64) -> Option<Bands> {
    let middle = calculate_sma(closes, period)?;
    let stddev = calculate_stddev(closes, period)?;

    Some(Bands {
        middle,
        upper: middle + multiplier * stddev,
        lower: middle - multiplier * stddev,
    })
}
