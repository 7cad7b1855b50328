//! The common return type of every loader operation.

use std::future::Future;

use thiserror::Error;

/// Why a load produced no result.
///
/// `Fetch` carries the downstream collaborator's own error, shared by every
/// caller waiting on the same batch or cache slot. `Cancelled` means the
/// owning scope was cancelled before the fetch settled; it is never produced
/// by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    #[error("load was cancelled before it completed")]
    Cancelled,

    #[error("downstream fetch failed: {0}")]
    Fetch(E),
}

impl<E> LoadError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }

    /// Get the downstream error, if this isn't a cancellation.
    pub fn fetch_error(&self) -> Option<&E> {
        match self {
            LoadError::Cancelled => None,
            LoadError::Fetch(err) => Some(err),
        }
    }
}

/// The result of a single load. `Ok(None)` is legitimate absence: the key
/// exists in the downstream key space but has no value. It is distinct from
/// an error everywhere in this crate.
pub type LoaderResult<Value, Error> = Result<Option<Value>, LoadError<Error>>;

/// Something that can look up a single key and hand back a
/// [`LoaderResult`]. Both [`BatchController`](crate::BatchController) and
/// [`ScopedCacheLoader`](crate::ScopedCacheLoader) implement this, so that
/// orchestration code can be written against either.
pub trait Loader<Key> {
    type Value;
    type Error;
    type Future: Future<Output = LoaderResult<Self::Value, Self::Error>>;

    fn load(&self, key: Key) -> Self::Future;
}

impl<Key, L: Loader<Key> + ?Sized> Loader<Key> for &L {
    type Value = L::Value;
    type Error = L::Error;
    type Future = L::Future;

    #[inline]
    fn load(&self, key: Key) -> Self::Future {
        (**self).load(key)
    }
}
