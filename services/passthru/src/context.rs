//! Cancellable, deadline-bound contexts.
//!
//! A [`Context`] bounds a unit of work (identifying a connection, waiting for
//! the next queued connection) by an explicit cancellation signal and an
//! optional deadline. Children inherit both; cancelling a child never
//! cancels its parent.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupt {
    /// The context (or one of its ancestors) was cancelled.
    #[error("context cancelled")]
    Cancelled,
    /// The context deadline elapsed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation token plus optional deadline.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done unless cancelled.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A fresh context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Derive a context from an existing cancellation token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A child with its own cancellation and the same deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child whose deadline is the earlier of the parent's and `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(own, |parent| parent.min(own))),
        }
    }

    /// A child that follows the parent's cancellation but not its deadline,
    /// expiring `timeout` from now instead.
    pub fn child_with_fresh_timeout(&self, timeout: Duration) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<Interrupt> {
        if self.token.is_cancelled() {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::DeadlineExceeded),
            _ => None,
        }
    }

    /// Wait until the context is cancelled or its deadline elapses.
    pub async fn done(&self) -> Interrupt {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Interrupt::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Interrupt::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Interrupt::Cancelled
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
