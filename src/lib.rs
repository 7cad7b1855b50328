//! Trendloader provides request-scoped data loaders in the style of the
//! [dataloader pattern](https://github.com/graphql/dataloader): many
//! independent call sites ask for per-entity data while one incoming query
//! is evaluated, and the loaders collapse those requests so that each
//! logical resource is fetched downstream at most once at a time. On top of
//! the loaders sits reconstruction of dense, minute-resolution trend windows
//! from sparse sensor samples.
//!
//! ## Overview
//!
//! There are two loaders, both returning a [`LoaderResult`] for each key:
//!
//! - [`BatchController`] collects the keys requested during a short window
//!   and hands them, deduplicated, to a single call of your batch function.
//!   Each caller receives the result for exactly its own key.
//! - [`ScopedCacheLoader`] fetches each key at most once for its lifetime,
//!   serving every later or concurrent request from the same slot. It can
//!   also serve values pushed by an event source through a long-lived
//!   [`SubscriptionRegistry`].
//!
//! Both are meant to be created per logical request and dropped with it.
//!
//! A [`LoaderResult`] distinguishes three outcomes: a value (`Ok(Some(..))`),
//! legitimate absence (`Ok(None)`), and an error ([`LoadError`]), which is
//! either the downstream collaborator's failure or a cancellation.
//!
//! ## Batching
//!
//! A batch function takes a [`KeySet`], which contains all the keys to be
//! batched, and returns a `Result<ValueSet<V, E>, E>`. A [`ValueSet`]
//! contains the results matched with their original keys, and the only way
//! to create one is through the methods on [`KeySet`], which correlate by key
//! identity rather than position.
//!
//! ```
//! use trendloader::{KeySet, ValueSet};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Clone)]
//! struct User {
//!     id: u32,
//!     name: String,
//! }
//!
//! #[derive(Debug, Clone)]
//! struct DirectoryError;
//!
//! async fn get_users(ids: Vec<u32>) -> Result<Vec<User>, DirectoryError> {
//!     Ok(vec![])
//! }
//!
//! async fn batch_get_users(
//!     ids: KeySet<u32>,
//!     _cancel: CancellationToken,
//! ) -> Result<ValueSet<User, DirectoryError>, DirectoryError> {
//!     let users = get_users(ids.keys().copied().collect()).await?;
//!
//!     // Requested ids missing from the response have no value.
//!     Ok(ids.values_from_pairs(users.into_iter().map(|user| (user.id, user))))
//! }
//! ```
//!
//! A [`BatchController`] is configured with [`BatchRules`]:
//! - The `batcher` is the batch function.
//! - `window` is a [`BatchScheduler`], which decides how long a batch stays
//!   open. [`NextTick`] closes it at the next yield point; [`Delayed`] holds
//!   it open for a fixed duration; any closure returning a future works too.
//! - `max_keys` is an optional maximum number of keys per batch. If set,
//!   the batch will be dispatched immediately when this number of keys is
//!   reached, regardless of the window.
//!
//! ```
//! # use trendloader::{KeySet, ValueSet};
//! # use tokio_util::sync::CancellationToken;
//! # #[derive(Debug, Clone)] struct User { id: u32 }
//! # #[derive(Debug, Clone)] struct DirectoryError;
//! # async fn batch_get_users(
//! #     ids: KeySet<u32>,
//! #     _cancel: CancellationToken,
//! # ) -> Result<ValueSet<User, DirectoryError>, DirectoryError> {
//! #     Ok(ids.into_values(|&id| User { id }))
//! # }
//! use trendloader::{BatchController, BatchRules, NextTick};
//! use futures::{executor, future};
//!
//! let rules = BatchRules {
//!     batcher: batch_get_users,
//!     window: NextTick,
//!     max_keys: None,
//! };
//! let controller = BatchController::new(&rules);
//!
//! let (first, second) = executor::block_on(future::join(
//!     controller.load(1),
//!     controller.load(2),
//! ));
//!
//! assert_eq!(first.unwrap().unwrap().id, 1);
//! assert_eq!(second.unwrap().unwrap().id, 2);
//! ```
//!
//! ## Design notes
//!
//! ### Poll-driven design
//!
//! All of the asynchronous work in a [`BatchController`] is driven through
//! polling [`BatchFuture`]. The batch function is not scheduled in any
//! runtime or run in the background; it is driven directly in the foreground
//! by whichever waiting future was polled most recently. If that future is
//! dropped, another is woken to take over. When the batch completes, every
//! future is notified and extracts its own value when next polled.
//!
//! ### Cancellation
//!
//! Each loader carries a [`CancellationToken`](tokio_util::sync::CancellationToken).
//! Cancelling it abandons in-flight fetches. A dispatched batch is shared,
//! so cancellation is batch-wide: every load in it resolves to
//! [`LoadError::Cancelled`].
//!
//! ### Trends
//!
//! [`TrendWindowBuilder`] turns a sparse [`TrendSeries`] into exactly
//! `span_minutes` points ending at a minute-truncated anchor, with gaps left
//! as `None`. [`TrendSourceSelector`] chooses between the cached latest
//! series and a batched range query, depending on the [`TrendRequest`].

mod batch;
mod cache;
mod cancel;
mod data;
mod result;
mod scheduler;
mod subscription;
pub mod trend;
mod wakerset;


pub use batch::{BatchController, BatchFuture, BatchRules};
pub use cache::{CacheFuture, ScopedCacheLoader};
pub use cancel::Cancellable;
pub use data::{KeySet, ValueSet};
pub use result::{LoadError, Loader, LoaderResult};
pub use scheduler::{BatchScheduler, Delayed, NextTick, YieldOnce};
pub use subscription::{PublishError, SubscriptionRegistry, UpdateSender};
pub use trend::{
    fetch_ranges, RangeKey, TrendKey, TrendPoint, TrendRequest, TrendSeries, TrendSourceSelector,
    TrendWindowBuilder,
};
