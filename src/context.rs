//! Cancellation and deadline propagation for store calls.
//!
//! Every store operation receives a [`Context`]. A context is done once any
//! of its cancel handles fires or its deadline passes; derived contexts
//! inherit both from their parent.

use std::future::Future;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::StoreError;

/// Cancellation signal and optional deadline carried alongside a key.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Fires the cancellation of the context it was created with.
///
/// Dropping the handle without calling [`CancelHandle::cancel`] leaves the
/// context live.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel the associated context and every context derived from it.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child context that can be canceled independently.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut child = self.clone();
        child.cancel.push(rx);
        (child, CancelHandle { tx })
    }

    /// Derive a child context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context that expires at `deadline`, or at the parent's
    /// deadline if that comes first.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        });
        child
    }

    /// The instant this context expires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the context has been canceled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return true;
        }
        self.cancel.iter().any(|rx| *rx.borrow())
    }

    /// Resolve once the context is done. Never resolves for a background
    /// context.
    pub async fn done(&self) {
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        if self.cancel.is_empty() {
            expired.await;
            return;
        }

        let signals = self.cancel.iter().map(|rx| {
            let mut rx = rx.clone();
            Box::pin(async move {
                loop {
                    let canceled = *rx.borrow_and_update();
                    if canceled {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // handle dropped without canceling
                        std::future::pending::<()>().await;
                    }
                }
            })
        });
        let canceled = select_all(signals);

        tokio::select! {
            _ = canceled => {}
            _ = expired => {}
        }
    }

    /// Drive `fut` to completion unless the context finishes first, in which
    /// case `fut` is dropped and [`StoreError::Canceled`] is returned.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if self.is_done() {
            return Err(StoreError::Canceled);
        }

        tokio::select! {
            biased;
            _ = self.done() => Err(StoreError::Canceled),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_background_is_never_done() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.deadline().is_none());

        let value = assert_ok!(ctx.run(async { Ok::<_, StoreError>(7) }).await);
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let (parent, handle) = Context::background().with_cancel();
        let (child, _child_handle) = parent.with_cancel();

        assert!(!child.is_done());
        handle.cancel();
        assert!(parent.is_done());
        assert!(child.is_done());

        let res = child.run(async { Ok::<_, StoreError>(()) }).await;
        assert_eq!(assert_err!(res), StoreError::Canceled);
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_live() {
        let (parent, _handle) = Context::background().with_cancel();
        let (child, child_handle) = parent.with_cancel();

        child_handle.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        let (ctx, handle) = Context::background().with_cancel();
        drop(handle);
        assert!(!ctx.is_done());

        let res = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(res.is_err(), "done() should not resolve");
    }

    #[tokio::test]
    async fn test_deadline_aborts_outstanding_future() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));

        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StoreError>(())
            })
            .await;

        assert_eq!(assert_err!(res), StoreError::Canceled);
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_cancel_while_outstanding() {
        let (ctx, handle) = Context::background().with_cancel();

        let canceler = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StoreError>(())
            })
            .await;

        assert_eq!(assert_err!(res), StoreError::Canceled);
        canceler.await.unwrap();
    }

    #[test]
    fn test_child_deadline_never_extends_parent() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let parent = Context::background().with_timeout(Duration::from_millis(10));
            let child = parent.with_timeout(Duration::from_secs(60));
            assert_eq!(child.deadline(), parent.deadline());
        });
    }
}
