//! Deferred open results and the retry backoff.
//!
//! An async open that cannot finish immediately hands a [`RetryToken`] to
//! whoever will produce the connection: a pool waiter, the non-pooled
//! throttle, or a backoff timer after a pool shut down mid-open. The caller
//! awaits the matching receiver.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::FactoryConfig;
use crate::error::PoolError;
use crate::internal::InternalConnection;

/// Remaining attempts and the next sleep of the open retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backoff {
    remaining: u32,
    delay: Duration,
}

impl Backoff {
    pub(crate) fn new(config: &FactoryConfig) -> Self {
        Self {
            remaining: config.max_open_retries,
            delay: config.initial_retry_delay,
        }
    }

    /// The sleep before the next attempt and the state after it, or `None`
    /// once attempts are used up.
    pub(crate) fn step(self) -> Option<(Duration, Backoff)> {
        if self.remaining <= 1 {
            return None;
        }
        let next = Backoff {
            remaining: self.remaining - 1,
            delay: self.delay.saturating_mul(2),
        };
        Some((self.delay, next))
    }
}

/// How a deferred open ended.
#[derive(Debug)]
pub(crate) enum Completion {
    Ready(InternalConnection),
    Failed(PoolError),
    /// The pool shut down mid-open; try again with this backoff.
    Retry(Backoff),
}

/// Completion handle for one deferred open.
#[derive(Debug)]
pub(crate) struct RetryToken {
    tx: oneshot::Sender<Completion>,
    backoff: Backoff,
}

impl RetryToken {
    pub(crate) fn new(backoff: Backoff) -> (Self, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx, backoff }, rx)
    }

    pub(crate) fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// The caller stopped waiting.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the caller stops waiting.
    pub(crate) async fn abandoned(&mut self) {
        self.tx.closed().await;
    }

    /// Deliver the result. Hands it back when nobody is listening.
    pub(crate) fn complete(self, completion: Completion) -> Result<(), Completion> {
        self.tx.send(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_exhausted() {
        let config = FactoryConfig::new()
            .max_open_retries(3)
            .initial_retry_delay(Duration::from_millis(1));
        let backoff = Backoff::new(&config);

        let (first, backoff) = backoff.step().unwrap();
        assert_eq!(first, Duration::from_millis(1));
        let (second, backoff) = backoff.step().unwrap();
        assert_eq!(second, Duration::from_millis(2));
        assert!(backoff.step().is_none());
    }

    #[test]
    fn test_single_attempt_never_sleeps() {
        let config = FactoryConfig::new().max_open_retries(1);
        assert!(Backoff::new(&config).step().is_none());
    }

    #[tokio::test]
    async fn test_token_reports_abandoned_caller() {
        let (token, rx) = RetryToken::new(Backoff::new(&FactoryConfig::new()));
        assert!(!token.is_abandoned());
        drop(rx);
        assert!(token.is_abandoned());
        let returned = token.complete(Completion::Failed(PoolError::pooled_open_timeout(1)));
        assert!(matches!(returned, Err(Completion::Failed(_))));
    }
}
