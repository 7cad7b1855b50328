//! Policies for deciding when an accumulating batch is closed and handed to
//! the batch function.
//!
//! A batch's window opens when its first key is requested. While the window
//! future is pending, further keys join the batch; once it resolves, the
//! batch is dispatched. The window is only polled by the batch's driving
//! future, so its waker is the one woken when the window closes. The policy
//! never changes what the loader returns, only how many keys end up sharing
//! a dispatch.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_timer::Delay;

pub trait BatchScheduler {
    type Window: Future<Output = ()>;

    /// Open the window for a new batch.
    fn open_window(&self) -> Self::Window;
}

/// Any `Fn() -> impl Future<Output = ()>` is a scheduler, so a window can be
/// written inline as a closure, eg `|| Delay::new(Duration::from_millis(5))`.
impl<F, W> BatchScheduler for F
where
    F: Fn() -> W,
    W: Future<Output = ()>,
{
    type Window = W;

    #[inline]
    fn open_window(&self) -> W {
        self()
    }
}

/// The default policy: close the batch at the next yield point. The window
/// is polled only by the batch's driving future, so it closes when that
/// future is re-polled after yielding. Every key requested in the meantime,
/// including by sibling futures polled in the same tick, joins the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NextTick;

impl BatchScheduler for NextTick {
    type Window = YieldOnce;

    #[inline]
    fn open_window(&self) -> YieldOnce {
        YieldOnce { yielded: false }
    }
}

/// Future that returns Pending exactly once, waking itself immediately.
#[derive(Debug)]
pub struct YieldOnce {
    yielded: bool,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            ctx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Hold every batch open for a fixed duration, trading latency for larger
/// batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delayed(pub Duration);

impl Default for Delayed {
    fn default() -> Self {
        Delayed(Duration::from_millis(1))
    }
}

impl BatchScheduler for Delayed {
    type Window = Delay;

    #[inline]
    fn open_window(&self) -> Delay {
        Delay::new(self.0)
    }
}
