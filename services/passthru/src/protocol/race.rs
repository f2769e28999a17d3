//! First-success race with cancellation of the losers.
//!
//! Every entrant runs as its own task bound to a child of the caller's
//! context. The first entrant to succeed wins; entrants that fail drop out
//! without stopping the race. When a winner is found, the caller's context
//! is done, or every entrant has dropped out, the child context is cancelled
//! and all remaining tasks are aborted.

use std::fmt;
use std::future::Future;

use tokio::task::JoinSet;
use tracing::{trace, warn};

use crate::context::{Context, Interrupt};

/// How a race ended.
#[derive(Debug)]
pub(crate) enum RaceOutcome<K, T> {
    /// `entrant` finished first with `value`.
    Won { entrant: K, value: T },
    /// Every entrant failed.
    Exhausted,
    /// The context was done before anyone won.
    Interrupted(Interrupt),
}

pub(crate) async fn first_success<K, T, E, F, Fut>(
    ctx: &Context,
    entrants: impl IntoIterator<Item = (K, F)>,
) -> RaceOutcome<K, T>
where
    K: fmt::Display + Send + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let race_ctx = ctx.child();
    let mut tasks = JoinSet::new();

    for (entrant, start) in entrants {
        let attempt = start(race_ctx.clone());
        tasks.spawn(async move { (entrant, attempt.await) });
    }

    let outcome = loop {
        tokio::select! {
            biased;
            interrupt = race_ctx.done() => break RaceOutcome::Interrupted(interrupt),
            joined = tasks.join_next() => match joined {
                None => break RaceOutcome::Exhausted,
                Some(Ok((entrant, Ok(value)))) => break RaceOutcome::Won { entrant, value },
                Some(Ok((entrant, Err(e)))) => {
                    trace!(entrant = %entrant, error = %e, "Entrant dropped out");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Entrant task failed");
                }
            },
        }
    };

    race_ctx.cancel();
    tasks.abort_all();
    outcome
}
