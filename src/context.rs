//! Per-caller cancellation and deadlines.

use std::future::Future;
use std::time::{Duration, Instant};

use futures::{future, pin_mut, select_biased, FutureExt};
use futures_timer::Delay;
use tokio_util::sync::CancellationToken;

use crate::error::LoadError;

/// The caller's side of a load: a cancellation signal and an optional
/// deadline. Cancelling a context, or letting its deadline pass, abandons
/// only the loads made through it. The batches those loads joined are still
/// dispatched for their other waiters.
///
/// Contexts are cheap to clone; clones share the same cancellation signal.
/// [`child`](RequestContext::child) derives a context that is cancelled with
/// its parent but can also be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose loads fail with [`LoadError::DeadlineExceeded`] once
    /// `timeout` has elapsed from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_in(timeout)
    }

    /// Tighten the deadline to `timeout` from now. A deadline that is
    /// already earlier is kept.
    pub fn deadline_in(self, timeout: Duration) -> Self {
        self.deadline_at(Instant::now() + timeout)
    }

    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// A context cancelled together with this one, with the same deadline.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= Instant::now())
    }

    /// Run `fut` until it completes, this context is cancelled, or the
    /// deadline passes, whichever happens first. When the context wins, `fut`
    /// is dropped, which withdraws the caller from its batch.
    pub(crate) async fn guard<T, E, F>(&self, fut: F) -> Result<T, LoadError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if self.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        if self.is_expired() {
            return Err(LoadError::DeadlineExceeded);
        }

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => Delay::new(deadline.saturating_duration_since(Instant::now())).await,
                None => future::pending().await,
            }
        };

        let fut = fut.fuse();
        let cancelled = self.cancel.cancelled().fuse();
        let expired = expired.fuse();
        pin_mut!(fut, cancelled, expired);

        select_biased! {
            result = fut => result.map_err(LoadError::Fetch),
            () = cancelled => Err(LoadError::Cancelled),
            () = expired => Err(LoadError::DeadlineExceeded),
        }
    }
}
