//! Per-call context: cancellation and correlation.

use tokio_util::sync::CancellationToken;

/// Context carried through one logical call.
///
/// The cancellation token aborts retry backoff waits, bulkhead queueing and
/// in-flight attempts; cancellation always surfaces as
/// [`ErrorKind::Cancelled`](resilience_core::ErrorKind::Cancelled). The
/// correlation id is copied onto every event and error the call produces.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancellation: CancellationToken,
    correlation_id: Option<String>,
}

impl CallContext {
    /// Context with a fresh token and no correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with a fresh token and a random UUID v4 correlation id.
    #[must_use]
    pub fn with_generated_correlation_id() -> Self {
        Self::new().with_correlation_id(uuid::Uuid::new_v4().to_string())
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Use `token` for cancellation, e.g. a child of a request-scoped token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Correlation id, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The cancellation token.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Cancel the call.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Whether the call has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the call is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_correlation_ids_differ() {
        let a = CallContext::with_generated_correlation_id();
        let b = CallContext::with_generated_correlation_id();
        assert_eq!(a.correlation_id().unwrap().len(), 36);
        assert_ne!(a.correlation_id(), b.correlation_id());
    }

    #[test]
    fn test_clones_share_cancellation() {
        let ctx = CallContext::new().with_correlation_id("req-1");
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());

        ctx.cancel();
        assert!(clone.is_cancelled());
        assert_eq!(clone.correlation_id(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_child_token_cancelled_by_parent() {
        let parent = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(parent.child_token());

        parent.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
