//! Bounded exponential backoff around storage and ledger calls.

use crate::utils::{RecoveryError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Total attempts including the first one.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Run `f` with a per-attempt timeout, retrying transient failures with
    /// exponential backoff plus jitter. Non-transient errors return at once;
    /// on exhaustion the last error is returned.
    pub async fn run<T, F, Fut>(&self, step: &str, timeout: Duration, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay_ms = self.base_delay_ms;
        let mut last_err = None;

        for attempt in 0..self.attempts() {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(self.max_delay_ms);
            }

            let outcome = match tokio::time::timeout(timeout, f()).await {
                Ok(res) => res,
                Err(_) => Err(RecoveryError::Timeout {
                    step: step.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(val) => return Ok(val),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    tracing::warn!(
                        step,
                        attempt = attempt + 1,
                        max_attempts = self.attempts(),
                        error = %e,
                        "Transient failure, retrying"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| RecoveryError::Timeout {
            step: step.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }))
    }

    /// Like [`run`](Self::run) but an exhausted transient failure surfaces as
    /// `LedgerUnavailable`.
    pub async fn run_ledger<T, F, Fut>(&self, step: &str, timeout: Duration, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(step, timeout, f).await.map_err(|e| {
            if e.is_transient() {
                RecoveryError::LedgerUnavailable {
                    step: step.to_string(),
                    attempts: self.attempts(),
                    cause: e.to_string(),
                }
            } else {
                e
            }
        })
    }
}

/// Single bounded wait, no retries. Used on the primary fast path.
pub async fn with_timeout<T, Fut>(step: &str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(RecoveryError::Timeout {
            step: step.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let value = fast_policy(3)
            .run("ledger.submit", Duration::from_secs(1), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RecoveryError::Ledger("connection reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_integrity_failures_are_never_retried() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(5)
            .run("restore.fetch", Duration::from_secs(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RecoveryError::ChecksumMismatch {
                    backup_id: "b".into(),
                    step: "validating".into(),
                    expected: "a".into(),
                    actual: "c".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_ledger_calls_become_unavailable() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(2)
            .run_ledger("ledger.query_all", Duration::from_millis(5), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, RecoveryError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            RecoveryError::LedgerUnavailable { attempts, step, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(step, "ledger.query_all");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
