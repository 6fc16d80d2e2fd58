//! Per-call context: cancellation, deadline and out-of-band metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::status::Status;

/// Metadata key whose presence marks a call as safe to repeat.
pub const IDEMPOTENCY_KEY: &str = "x-idempotency-token";

/// Context carried alongside a single logical call.
///
/// Cheap to clone; clones share the same cancellation token. Created per call
/// and dropped when the call completes.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    metadata: Arc<HashMap<String, String>>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// A context with no deadline and no metadata.
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            metadata: Arc::new(HashMap::new()),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Attach a metadata entry. Keys are case-insensitive.
    pub fn with_metadata(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.metadata).insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Mark this call as idempotent, making it eligible for retries.
    pub fn with_idempotency_token(self, token: impl Into<String>) -> Self {
        self.with_metadata(IDEMPOTENCY_KEY, token)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// `true` when a non-empty idempotency token is attached. The token's
    /// value is otherwise never inspected.
    pub fn is_idempotent(&self) -> bool {
        self.metadata(IDEMPOTENCY_KEY)
            .is_some_and(|token| !token.is_empty())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A context that inherits deadline and metadata and is cancelled along
    /// with this one.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            metadata: Arc::clone(&self.metadata),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The context's error if it has already ended, `None` otherwise.
    pub fn err(&self) -> Option<Status> {
        if self.cancel.is_cancelled() {
            return Some(cancelled());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(deadline_exceeded()),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Status {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => cancelled(),
                _ = tokio::time::sleep_until(deadline) => deadline_exceeded(),
            },
            None => {
                self.cancel.cancelled().await;
                cancelled()
            }
        }
    }
}

fn cancelled() -> Status {
    Status::cancelled("context canceled")
}

fn deadline_exceeded() -> Status {
    Status::deadline_exceeded("context deadline exceeded")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn idempotency_requires_non_empty_token() {
        assert!(!CallContext::new().is_idempotent());
        assert!(!CallContext::new().with_idempotency_token("").is_idempotent());
        assert!(CallContext::new().with_idempotency_token("abc").is_idempotent());
        assert!(CallContext::new()
            .with_metadata("X-Idempotency-Token", "k")
            .is_idempotent());
    }

    #[test]
    fn cancelled_context_reports_error() {
        let ctx = CallContext::new();
        assert!(ctx.err().is_none());
        ctx.cancel();
        assert_eq!(ctx.err().map(|s| s.code()), Some(Code::Cancelled));
    }

    #[test]
    fn child_follows_parent_cancellation() {
        let parent = CallContext::new().with_idempotency_token("t");
        let child = parent.child();
        assert!(child.is_idempotent());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn done_fires_at_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        let start = Instant::now();
        let status = ctx.done().await;
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(ctx.err().map(|s| s.code()), Some(Code::DeadlineExceeded));
    }
}
