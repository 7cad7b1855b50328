use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Timelike, Utc};

/// Eight hours of minutes.
pub const DEFAULT_SPAN_MINUTES: u32 = 480;

/// Sparse samples, ordered by timestamp. Timestamps are unique by
/// construction.
pub type TrendSeries = BTreeMap<DateTime<Utc>, f64>;

/// One minute of a dense trend window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

/// Zero the seconds and sub-second components.
pub fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        - TimeDelta::seconds(i64::from(instant.second()))
        - TimeDelta::nanoseconds(i64::from(instant.nanosecond()))
}

/// Builds dense, minute-resolution windows of a fixed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendWindowBuilder {
    span_minutes: u32,
}

impl Default for TrendWindowBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_SPAN_MINUTES)
    }
}

impl TrendWindowBuilder {
    pub fn new(span_minutes: u32) -> Self {
        Self { span_minutes }
    }

    #[inline]
    pub fn span_minutes(&self) -> u32 {
        self.span_minutes
    }

    /// Reconstruct the window ending at `anchor` (truncated to the minute).
    ///
    /// The result always holds exactly `span_minutes` points, ascending one
    /// minute apart, the last one at the truncated anchor. A point carries a
    /// value only if `samples` has one at exactly that timestamp; gaps are
    /// `None`, never filled from neighbouring samples, and samples outside
    /// the window are ignored.
    pub fn build(&self, samples: &TrendSeries, anchor: DateTime<Utc>) -> Vec<TrendPoint> {
        let anchor = truncate_to_minute(anchor);

        (0..i64::from(self.span_minutes))
            .rev()
            .map(|minutes_back| {
                let timestamp = anchor - TimeDelta::minutes(minutes_back);

                TrendPoint {
                    timestamp,
                    value: samples.get(&timestamp).copied(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn truncation_drops_seconds_and_fractions() {
        let instant = Utc.with_ymd_and_hms(2023, 1, 15, 10, 42, 37).unwrap()
            + TimeDelta::milliseconds(250);

        assert_eq!(
            truncate_to_minute(instant),
            Utc.with_ymd_and_hms(2023, 1, 15, 10, 42, 0).unwrap()
        );
    }

    #[test]
    fn zero_span_is_empty() {
        let anchor = Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap();
        assert!(TrendWindowBuilder::new(0).build(&TrendSeries::new(), anchor).is_empty());
    }
}
