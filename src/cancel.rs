use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::result::{LoadError, LoaderResult};

/// Wraps a downstream fetch so that it resolves to `LoadError::Cancelled` as
/// soon as its scope's token is cancelled. The fetch itself is dropped at
/// that point, without being polled again.
pub struct Cancellable<Fut> {
    fut: Option<Pin<Box<Fut>>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<Fut> Cancellable<Fut> {
    pub fn new(fut: Fut, cancel: CancellationToken) -> Self {
        Self {
            fut: Some(Box::pin(fut)),
            cancelled: Box::pin(cancel.cancelled_owned()),
        }
    }
}

impl<Fut> Debug for Cancellable<Fut> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("fut", &self.fut.as_ref().map(|_| "<future>"))
            .finish()
    }
}

impl<Fut, Value, Error> Future for Cancellable<Fut>
where
    Fut: Future<Output = Result<Option<Value>, Error>>,
{
    type Output = LoaderResult<Value, Error>;

    fn poll(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if this.cancelled.as_mut().poll(ctx).is_ready() {
            this.fut = None;
            return Poll::Ready(Err(LoadError::Cancelled));
        }

        let fut = this
            .fut
            .as_mut()
            .expect("Can't re-poll a completed Cancellable");

        let result = match fut.as_mut().poll(ctx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };

        this.fut = None;
        Poll::Ready(result.map_err(LoadError::Fetch))
    }
}
