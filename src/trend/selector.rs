use std::future::Future;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::window::{TrendPoint, TrendSeries, TrendWindowBuilder};
use crate::{
    cancel::Cancellable,
    data::{KeySet, ValueSet},
    result::{Loader, LoaderResult},
};

/// A single trend: one column of one machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrendKey {
    pub machine: String,
    pub column: String,
}

impl TrendKey {
    pub fn new(machine: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            column: column.into(),
        }
    }
}

/// The trailing span of a trend ending at `end`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeKey {
    pub trend: TrendKey,
    pub end: DateTime<Utc>,
}

/// How a trend is sourced. The two modes share window reconstruction but
/// nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendRequest {
    /// The most recent cached series, up to now.
    Latest,

    /// The historical series ending at an explicit instant.
    Ending(DateTime<Utc>),
}

impl From<Option<DateTime<Utc>>> for TrendRequest {
    fn from(end: Option<DateTime<Utc>>) -> Self {
        match end {
            None => TrendRequest::Latest,
            Some(end) => TrendRequest::Ending(end),
        }
    }
}

/// Batch function for ranged trends, built on a per-key range fetch. All
/// ranges in the batch are fetched concurrently; a range with no data has no
/// value, and a failed range fails only the loads waiting on it.
///
/// ```ignore
/// let rules = BatchRules {
///     batcher: |keys, cancel| fetch_ranges(&fetch_range, keys, cancel),
///     window: NextTick,
///     max_keys: None,
/// };
/// ```
pub async fn fetch_ranges<FetchRange, Fut, Error>(
    fetch_range: &FetchRange,
    keys: KeySet<RangeKey>,
    cancel: CancellationToken,
) -> Result<ValueSet<TrendSeries, Error>, Error>
where
    FetchRange: Fn(&TrendKey, DateTime<Utc>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Option<TrendSeries>, Error>>,
{
    let requested: Vec<RangeKey> = keys.keys().cloned().collect();

    let results = join_all(
        requested
            .iter()
            .map(|key| fetch_range(&key.trend, key.end, cancel.clone())),
    )
    .await;

    let pairs = requested
        .into_iter()
        .zip(results)
        .filter_map(|(key, result)| match result {
            Ok(Some(series)) => Some((key, Ok(series))),
            Ok(None) => None,
            Err(err) => Some((key, Err(err))),
        });

    Ok(keys.results_from_pairs(pairs))
}

/// Serves dense trend windows from one of two sources: a per-scope cache of
/// the latest known series, or a batched range query for an explicit end
/// time. Errors from either source, and from the machine clock, pass through
/// unchanged.
pub struct TrendSourceSelector<Latest, Ranged, Clock> {
    latest: Latest,
    ranged: Ranged,
    clock: Clock,
    builder: TrendWindowBuilder,
    cancel: CancellationToken,
}

impl<Latest, Ranged, Clock> TrendSourceSelector<Latest, Ranged, Clock> {
    pub fn new(latest: Latest, ranged: Ranged, clock: Clock) -> Self {
        Self {
            latest,
            ranged,
            clock,
            builder: TrendWindowBuilder::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_builder(mut self, builder: TrendWindowBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Cancel machine clock lookups with `cancel`. The loaders carry their
    /// own tokens.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn builder(&self) -> &TrendWindowBuilder {
        &self.builder
    }
}

impl<Latest, Ranged, Clock, ClockFut, Error> TrendSourceSelector<Latest, Ranged, Clock>
where
    Latest: Loader<TrendKey, Value = TrendSeries, Error = Error>,
    Ranged: Loader<RangeKey, Value = TrendSeries, Error = Error>,
    Clock: Fn(&str, CancellationToken) -> ClockFut,
    ClockFut: Future<Output = Result<Option<DateTime<Utc>>, Error>>,
{
    pub async fn trend(
        &self,
        key: TrendKey,
        request: TrendRequest,
    ) -> LoaderResult<Vec<TrendPoint>, Error> {
        match request {
            TrendRequest::Latest => self.latest_trend(key).await,
            TrendRequest::Ending(end) => self.ranged_trend(key, end).await,
        }
    }

    /// The window ending at the newest cached sample. A series that is known
    /// but empty is anchored at the machine's current time instead, giving a
    /// window of nothing but gaps; a series with no cache entry at all is
    /// absent, and the clock is never consulted.
    pub async fn latest_trend(&self, key: TrendKey) -> LoaderResult<Vec<TrendPoint>, Error> {
        let series = match self.latest.load(key.clone()).await? {
            Some(series) => series,
            None => return Ok(None),
        };

        if let Some((&newest, _)) = series.iter().next_back() {
            return Ok(Some(self.builder.build(&series, newest)));
        }

        debug!(machine = %key.machine, "no cached samples, anchoring trend at machine time");
        let clock = (self.clock)(&key.machine, self.cancel.clone());

        Ok(Cancellable::new(clock, self.cancel.clone())
            .await?
            .map(|now| self.builder.build(&TrendSeries::new(), now)))
    }

    /// The window ending at `end`, from the batched range query.
    pub async fn ranged_trend(
        &self,
        key: TrendKey,
        end: DateTime<Utc>,
    ) -> LoaderResult<Vec<TrendPoint>, Error> {
        let series = self.ranged.load(RangeKey { trend: key, end }).await?;

        Ok(series.map(|series| self.builder.build(&series, end)))
    }
}
