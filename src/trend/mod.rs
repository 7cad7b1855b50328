//! Dense trend reconstruction on top of the loaders.
//!
//! Sensor samples arrive sparse and irregularly timestamped. A trend window
//! is the dense, minute-resolution view of the trailing span ending at an
//! anchor: one point per minute, `None` wherever no sample landed exactly on
//! that minute.

mod selector;
mod window;

pub use selector::{fetch_ranges, RangeKey, TrendKey, TrendRequest, TrendSourceSelector};
pub use window::{
    truncate_to_minute, TrendPoint, TrendSeries, TrendWindowBuilder, DEFAULT_SPAN_MINUTES,
};
