// Technical indicators used by the strategy units

pub mod bands;
pub mod moving_average;

pub use bands::{calculate_bands, Bands};
pub use moving_average::{calculate_sma, calculate_stddev};
