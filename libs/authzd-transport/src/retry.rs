//! RPC-level retry helper for unary calls to tenant backends.
//!
//! Retries only transient, network-shaped failures: `UNAVAILABLE` and a
//! deadline that expired before the request was sent. Everything else is
//! returned immediately — domain errors are not transient and command
//! execution is not idempotent in general.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tonic::{Code, Status};
use tracing::Instrument;

/// Retry policy for unary RPC calls.
#[derive(Debug, Clone)]
#[must_use]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the initial call).
    pub max_retries: u32,

    /// Backoff before each retry attempt, indexed by attempt number.
    /// Attempts beyond the list reuse the last entry.
    pub backoff: Vec<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: vec![Duration::from_millis(100), Duration::from_millis(300)],
        }
    }
}

impl RetryConfig {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1)) as usize;
        self.backoff
            .get(idx.min(self.backoff.len().saturating_sub(1)))
            .copied()
            .unwrap_or(Duration::from_millis(100))
    }
}

fn retryable(code: Code) -> bool {
    matches!(code, Code::Unavailable | Code::DeadlineExceeded)
}

/// Execute a unary gRPC call with retries on transient transport errors.
///
/// The request must be cheap to clone; the closure performs the actual
/// call. `op_name` labels log lines and trace spans.
///
/// # Errors
/// The final `Status` when retries are exhausted or the error is not
/// retryable.
pub async fn call_with_retry<TClient, F, Req, Res>(
    client: &mut TClient,
    cfg: Arc<RetryConfig>,
    req: Req,
    call: F,
    op_name: &'static str,
) -> Result<Res, Status>
where
    F: AsyncFn(&mut TClient, Req) -> Result<Res, Status>,
    Req: Clone,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let span = tracing::debug_span!("grpc_call", op = op_name, attempt);
        let result = call(client, req.clone()).instrument(span).await;

        match result {
            Ok(res) => {
                if attempt > 1 {
                    tracing::info!(op = op_name, attempt, "gRPC call succeeded after retries");
                }
                return Ok(res);
            }
            Err(status) => {
                let code = status.code();
                if !retryable(code) || attempt > cfg.max_retries {
                    if retryable(code) {
                        tracing::warn!(op = op_name, attempt, code = ?code, "gRPC call giving up");
                    }
                    return Err(status);
                }
                let backoff = cfg.backoff_for(attempt);
                tracing::debug!(
                    op = op_name,
                    attempt,
                    code = ?code,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying gRPC call after backoff"
                );
                sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockClient {
        calls: Arc<AtomicU32>,
    }

    fn mock() -> (MockClient, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            MockClient {
                calls: calls.clone(),
            },
            calls,
        )
    }

    fn fast_cfg(max_retries: u32) -> Arc<RetryConfig> {
        Arc::new(RetryConfig {
            max_retries,
            backoff: vec![Duration::from_millis(1), Duration::from_millis(2)],
        })
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let (mut client, calls) = mock();
        let result = call_with_retry(
            &mut client,
            fast_cfg(2),
            (),
            |c, ()| {
                c.calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, Status>("ok") }
            },
            "test.op",
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_unavailable_then_succeeds() {
        let (mut client, calls) = mock();
        let result = call_with_retry(
            &mut client,
            fast_cfg(2),
            (),
            |c, ()| {
                let n = c.calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Status::unavailable("starting up"))
                    } else {
                        Ok("ok")
                    }
                }
            },
            "test.op",
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_deadline_expired_before_send() {
        let (mut client, calls) = mock();
        let result = call_with_retry(
            &mut client,
            fast_cfg(2),
            (),
            |c, ()| {
                let n = c.calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 2 {
                        Err(Status::deadline_exceeded("queued too long"))
                    } else {
                        Ok("ok")
                    }
                }
            },
            "test.op",
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn domain_errors_are_not_retried() {
        let (mut client, calls) = mock();
        let result: Result<&str, Status> = call_with_retry(
            &mut client,
            fast_cfg(3),
            (),
            |c, ()| {
                c.calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Status::not_found("no such entity")) }
            },
            "test.op",
        )
        .await;
        assert_eq!(result.unwrap_err().code(), Code::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (mut client, calls) = mock();
        let result: Result<&str, Status> = call_with_retry(
            &mut client,
            fast_cfg(2),
            (),
            |c, ()| {
                c.calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Status::unavailable("down")) }
            },
            "test.op",
        )
        .await;
        assert_eq!(result.unwrap_err().code(), Code::Unavailable);
        // Initial attempt + 2 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
