//! The external text-completion collaborator, at its interface.
//!
//! The engine never decides *what* a summary says; it hands bounded work
//! to a collaborator: "given these messages and a token budget, return
//! text, or fail". [`Collaborator`] is dyn-safe via boxed futures so hosts
//! can plug in their own transport; [`client::OpenRouterCollaborator`] is
//! the default implementation. Every call is wrapped in [`CallBounds`]
//! (timeout plus a caller-supplied cancellation signal), so no collaborator
//! call can block the engine indefinitely.

pub mod client;
pub mod retry;

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::Message;

pub use client::OpenRouterCollaborator;
pub use retry::RetryConfig;

/// Boxed future returned by collaborator methods, keeping the trait
/// dyn-safe.
pub type CollabFuture<'a, T> = BoxFuture<'a, T>;

/// One summarization work order.
pub struct SummarizeRequest<'a> {
    /// Messages to summarize, oldest first.
    pub messages: &'a [Message],
    /// Running summary from earlier stages, to be merged rather than
    /// appended.
    pub previous_summary: Option<String>,
    /// Extra instructions for special passes (dropped-history recovery,
    /// split-turn prefixes).
    pub custom_instructions: Option<String>,
    /// Token budget for the response.
    pub max_tokens: u32,
}

/// External text-completion service consumed by the engine.
pub trait Collaborator: Send + Sync {
    /// Summarize messages into prose, merging `previous_summary` when
    /// present.
    fn summarize<'a>(&'a self, request: SummarizeRequest<'a>)
    -> CollabFuture<'a, Result<String, String>>;

    /// Produce a structured checkpoint refinement from the serialized
    /// heuristic checkpoint and recent messages. `Ok(None)` means the
    /// collaborator had nothing to add.
    fn enrich<'a>(
        &'a self,
        checkpoint_json: &'a str,
        recent: &'a [Message],
    ) -> CollabFuture<'a, Result<Option<String>, String>>;
}

// ── Call bounds ────────────────────────────────────────────────────

/// Timeout and cancellation applied to every collaborator call.
///
/// The cancel signal is a `watch` channel owned by the caller; flipping it
/// to `true` unwinds the in-flight call. The write-then-rename persistence
/// protocol means an unwound call never leaves partial checkpoint files.
#[derive(Clone)]
pub struct CallBounds {
    pub timeout: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl CallBounds {
    /// Bound calls by timeout only.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: None,
        }
    }

    /// Bound calls by timeout and a cancellation signal.
    pub fn cancellable(timeout: Duration, cancel: watch::Receiver<bool>) -> Self {
        Self {
            timeout,
            cancel: Some(cancel),
        }
    }

    /// Run a collaborator future under these bounds.
    pub async fn run<T>(
        &self,
        fut: impl Future<Output = Result<T, String>>,
    ) -> Result<T, String> {
        match self.cancel.clone() {
            None => flatten_timeout(tokio::time::timeout(self.timeout, fut).await, self.timeout),
            Some(mut cancel) => {
                tokio::select! {
                    outcome = tokio::time::timeout(self.timeout, fut) => {
                        flatten_timeout(outcome, self.timeout)
                    }
                    _ = cancelled(&mut cancel) => Err("collaborator call cancelled".to_string()),
                }
            }
        }
    }
}

fn flatten_timeout<T>(
    outcome: Result<Result<T, String>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> Result<T, String> {
    match outcome {
        Ok(inner) => inner,
        Err(_) => Err(format!(
            "collaborator call timed out after {:.1}s",
            timeout.as_secs_f64()
        )),
    }
}

/// Resolves when the cancel flag flips to `true`; pends forever if the
/// sender is dropped without cancelling.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn slow_ok() -> Result<u32, String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(1)
    }

    #[tokio::test]
    async fn timeout_bounds_the_call() {
        tokio::time::pause();
        let bounds = CallBounds::with_timeout(Duration::from_millis(100));
        let result = bounds.run(slow_ok()).await;
        assert!(result.unwrap_err().contains("timed out"));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let bounds = CallBounds::with_timeout(Duration::from_secs(5));
        let result = bounds.run(async { Ok::<_, String>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let bounds = CallBounds::with_timeout(Duration::from_secs(5));
        let result: Result<u32, String> =
            bounds.run(async { Err("upstream broke".to_string()) }).await;
        assert_eq!(result.unwrap_err(), "upstream broke");
    }

    #[tokio::test]
    async fn cancellation_unwinds_the_call() {
        tokio::time::pause();
        let (tx, rx) = watch::channel(false);
        let bounds = CallBounds::cancellable(Duration::from_secs(60), rx);

        let call = bounds.run(slow_ok());
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
            // Keep the sender alive until the call observes the flag.
            std::future::pending::<Result<u32, String>>().await
        };

        let result = tokio::select! {
            r = call => r,
            r = cancel => r,
        };
        assert!(result.unwrap_err().contains("cancelled"));
    }

    #[tokio::test]
    async fn pre_cancelled_signal_rejects_immediately() {
        let (tx, rx) = watch::channel(true);
        let bounds = CallBounds::cancellable(Duration::from_secs(60), rx);
        let result = bounds.run(slow_ok()).await;
        assert!(result.unwrap_err().contains("cancelled"));
        drop(tx);
    }
}
