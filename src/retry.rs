//! Bounded retry supervisor
//!
//! Re-runs a whole operation (one fresh attempt per invocation) until it
//! succeeds or the attempt budget is spent. Attempts are numbered from 1 and
//! the first attempt counts toward the budget.
//!
//! # Example
//!
//! ```ignore
//! use cluster_bringup::retry::{run_with_retries, RetryPolicy};
//!
//! let value = run_with_retries(&RetryPolicy::default(), "create-cluster", |attempt| async move {
//!     provision(attempt).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{error_chain, ErrorKind};
use crate::Result;

/// Default number of attempts for a cluster creation
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Retry policy for whole-workflow attempts
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (values below 1 mean 1)
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
    /// Error kinds that are expected and logged as a one-line notice
    pub terse_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
            terse_kinds: vec![ErrorKind::AttemptTimedOut],
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Whether failures of `kind` get the short log line
    pub fn is_terse(&self, kind: ErrorKind) -> bool {
        self.terse_kinds.contains(&kind)
    }

    fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `operation` until it succeeds or the policy's attempts are exhausted
///
/// `operation` receives the 1-based attempt number. The last error is
/// returned unchanged when the budget runs out. Process-fatal kinds stop the
/// loop immediately.
pub async fn run_with_retries<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.attempt_budget();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        info!(operation = %operation_name, attempt, max_attempts, "Starting attempt");

        let err = match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = %operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        let kind = err.kind();
        if policy.is_terse(kind) {
            warn!(
                operation = %operation_name,
                attempt,
                max_attempts,
                %kind,
                "Attempt failed: {}",
                err
            );
        } else {
            error!(
                operation = %operation_name,
                attempt,
                max_attempts,
                %kind,
                error = %error_chain(&err),
                details = ?err,
                "Attempt failed"
            );
        }

        if kind.is_process_fatal() {
            error!(operation = %operation_name, %kind, "Unrecoverable failure, not retrying");
            return Err(err);
        }

        if attempt >= max_attempts {
            error!(
                operation = %operation_name,
                attempts = attempt,
                "Operation failed after max attempts"
            );
            return Err(err);
        }

        info!(
            operation = %operation_name,
            delay_secs = policy.delay.as_secs(),
            "Retrying after delay"
        );
        tokio::time::sleep(policy.delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy(max_attempts: u32, delay_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_secs(delay_secs),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_immediately() {
        let start = Instant::now();
        let result = run_with_retries(&policy(3, 10), "op", |_| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_runs_exactly_max_attempts_with_n_minus_one_delays() {
        for n in 1..=5u32 {
            let count = Arc::new(AtomicU32::new(0));
            let c = count.clone();
            let start = Instant::now();

            let result: Result<()> = run_with_retries(&policy(n, 7), "op", |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::controller_deploy("rejected"))
                }
            })
            .await;

            assert_eq!(result.unwrap_err().kind(), ErrorKind::ControllerDeployFailed);
            assert_eq!(count.load(Ordering::SeqCst), n);
            assert_eq!(start.elapsed(), Duration::from_secs(7 * u64::from(n - 1)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_first_success() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = run_with_retries(&policy(5, 1), "op", |attempt| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(Error::config_invalid("transient"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    /// Three attempts, ten seconds apart, the first two fail provisioning.
    #[tokio::test(start_paused = true)]
    async fn two_provisioning_failures_then_success() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let start = Instant::now();

        let result = run_with_retries(&policy(3, 10), "create-cluster", |attempt| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                if attempt <= 2 {
                    Err(Error::provisioning("c1", "aws", "stack rollback"))
                } else {
                    Ok("ready")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ready");
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn process_fatal_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = run_with_retries(&policy(3, 10), "op", |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::ImageMissing {
                    image: "repo/controller:v1".into(),
                })
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::ImageMissing);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_runs_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let _: Result<()> = run_with_retries(&policy(0, 10), "op", |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::internal("nope"))
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeouts_are_terse_by_default() {
        let policy = RetryPolicy::default();
        assert!(policy.is_terse(ErrorKind::AttemptTimedOut));
        assert!(!policy.is_terse(ErrorKind::InfraProvisioningFailed));
        assert_eq!(RetryPolicy::with_max_attempts(7).max_attempts, 7);
    }

    /// Formatted log output written by the subscriber under test
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn failure_lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .filter(|l| l.contains("Attempt failed"))
                .map(String::from)
                .collect()
        }
    }

    async fn fail_once_with(err: Error) -> CapturedLogs {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut err = Some(err);
        let _: Result<()> = run_with_retries(&policy(1, 0), "create-cluster", |_| {
            let e = err.take().expect("single attempt");
            async move { Err(e) }
        })
        .await;
        logs
    }

    #[tokio::test]
    async fn terse_kinds_log_a_single_warning() {
        let logs = fail_once_with(Error::AttemptTimedOut {
            task: "attempt-1".into(),
            deadline: Duration::from_secs(2700),
        })
        .await;

        let lines = logs.failure_lines();
        assert_eq!(lines.len(), 1, "{:?}", lines);
        assert!(lines[0].contains("WARN"));
        assert!(lines[0].contains("attempt-1"));
        assert!(!lines[0].contains("details="));
    }

    #[tokio::test]
    async fn other_kinds_log_the_full_error() {
        let logs = fail_once_with(Error::provisioning("c1", "gcp", "quota exceeded")).await;

        let lines = logs.failure_lines();
        assert_eq!(lines.len(), 1, "{:?}", lines);
        assert!(lines[0].contains("ERROR"));
        assert!(lines[0].contains("error="));
        assert!(lines[0].contains("details=InfraProvisioning"));
        assert!(lines[0].contains("quota exceeded"));
    }
}
