//! A minimal cancellation handle shared by OCC retry loops, change-stream
//! tasks, and lock refresh tasks.
//!
//! The corpus doesn't depend on `tokio-util`, so rather than pull it in for
//! `CancellationToken` alone, this wraps a `tokio::sync::watch` channel —
//! the same primitive the teacher already depends on (`tokio`'s `sync`
//! feature) — to get the same parent/child cancel-propagates-down shape.

use tokio::sync::watch;

/// A cancellable handle. Cloning shares the same cancellation state;
/// [`CancellationToken::child`] creates an independent token that is also
/// cancelled when the parent is, modeling the store→registry→document→
/// subscriber context tree.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Construct a new, uncancelled, root token.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Signal cancellation. Idempotent; all clones and the whole subtree
    /// rooted from [`Self::child`] observe it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether [`Self::cancel`] has been called on this token or an
    /// ancestor.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until this token is cancelled. Resolves immediately if already
    /// cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Create an independent child token that is cancelled whenever this
    /// token is, but whose own `cancel()` does not affect the parent.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut parent_rx = self.rx.clone();
        let child_tx = child.tx.clone();
        if *parent_rx.borrow() {
            let _ = child_tx.send(true);
            return child;
        }
        tokio::spawn(async move {
            if parent_rx.changed().await.is_ok() && *parent_rx.borrow() {
                let _ = child_tx.send(true);
            }
        });
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_is_observed() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn cancellation_propagates_to_children() {
        let parent = CancellationToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child should observe parent cancellation");
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_parent_yields_cancelled_child() {
        let parent = CancellationToken::new();
        parent.cancel();
        let child = parent.child();
        assert!(child.is_cancelled());
    }
}
