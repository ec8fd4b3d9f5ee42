use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Settable read deadline for one side of a relay.
///
/// The copy loop reading from that side races each read against
/// [`ReadDeadline::expired`]. Any holder of the handle may set or move the
/// deadline while a read is pending; the pending read observes the change.
#[derive(Debug)]
pub struct ReadDeadline {
    tx: watch::Sender<Option<Instant>>,
}

impl ReadDeadline {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn set(&self, at: Instant) {
        self.tx.send_replace(Some(at));
    }

    /// Sets the deadline `after` from now. A duration too large to be
    /// represented clears the deadline instead.
    pub fn set_after(&self, after: Duration) {
        self.tx.send_replace(Instant::now().checked_add(after));
    }

    pub fn get(&self) -> Option<Instant> {
        *self.tx.borrow()
    }

    /// Completes once the current deadline, as it may be moved later, has
    /// passed. Never completes while no deadline is set.
    pub fn expired(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            loop {
                let current = *rx.borrow_and_update();
                match current {
                    Some(at) => {
                        tokio::select! {
                            _ = sleep_until(at) => return,
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    sleep_until(at).await;
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        if rx.changed().await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
            }
        }
    }

    /// Runs `read` until it completes or the deadline passes.
    pub async fn guard<F, T>(&self, read: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        tokio::select! {
            res = read => res,
            _ = self.expired() => Err(timed_out()),
        }
    }
}

impl Default for ReadDeadline {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")
}
