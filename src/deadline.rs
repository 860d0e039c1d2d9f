// ABOUTME: Absolute-deadline type shared by every suspending operation
// ABOUTME: Wraps tokio timeouts so adapters never deal with Elapsed directly

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// An absolute point in monotonic time by which an operation must finish.
///
/// Every suspending operation in the crate (`send`, `recv`, `accept`,
/// `connect`, `done`, `stop`) takes a `Deadline`. [`Deadline::NEVER`] means
/// the operation may block indefinitely. When the deadline is reached without
/// forward progress the operation fails with [`Error::TimedOut`].
///
/// # Example
///
/// ```rust,no_run
/// use sockstack::Deadline;
/// use std::time::Duration;
///
/// let never = Deadline::NEVER;
/// let soon = Deadline::after(Duration::from_millis(100));
/// assert!(soon.instant().is_some());
/// assert!(never.instant().is_none());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline; the operation may block forever.
    pub const NEVER: Deadline = Deadline(None);

    /// Deadline at an absolute instant.
    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    /// Deadline `dur` from now.
    pub fn after(dur: Duration) -> Self {
        Deadline(Some(Instant::now() + dur))
    }

    /// The underlying instant, if any.
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Whether the deadline has already passed.
    pub fn expired(&self) -> bool {
        matches!(self.0, Some(at) if at <= Instant::now())
    }

    /// Run `fut` to completion, failing with [`Error::TimedOut`] if this
    /// deadline is reached first.
    pub async fn cap<T, F>(self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.0 {
            None => fut.await,
            Some(at) => match tokio::time::timeout_at(at, fut).await {
                Ok(res) => res,
                Err(_) => Err(Error::TimedOut),
            },
        }
    }
}
