//! Cancellation and deadlines for a reconciliation call

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Caller-supplied context; cloning shares the cancellation signal
#[derive(Debug, Clone)]
pub struct Context {
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

/// Cancels every [`Context`] derived from the same [`Context::with_cancel`] call
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            cancel: rx,
            deadline: None,
        }
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                cancel: rx,
                deadline: None,
            },
            CancelHandle { tx },
        )
    }

    /// Add a deadline; an earlier existing deadline wins
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        let signal = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender gone: cancellation can no longer happen
                    std::future::pending::<()>().await;
                }
            }
        };

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = signal => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => signal.await,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
