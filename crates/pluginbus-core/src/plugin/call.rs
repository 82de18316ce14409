//! Per-call deadline and cancellation.

use crate::cancel::CancellationToken;
use crate::config::PluginConfig;
use std::time::Duration;

/// Deadline and cancellation token for one `send`.
///
/// `CallContext::default()` waits forever and is never cancelled; the token
/// can be cancelled from any task holding a clone of it.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Use [`PluginConfig::DEFAULT_REQUEST_TIMEOUT`].
    pub fn with_default_timeout() -> Self {
        Self::with_timeout(PluginConfig::DEFAULT_REQUEST_TIMEOUT)
    }

    /// Observe `token` as well; cancelling it aborts the wait.
    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves when the timeout elapses; never, if there is none.
    pub(crate) async fn expired(&self) {
        match self.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    }
}
