//! Top-level entry point: acquire a kernel, run one session, retry with
//! backoff on infrastructure failure.

use std::sync::Arc;

use tracing::{info, warn};

use crate::kernel_admin::KernelAdmin;
use crate::pool::Pool;
use crate::{kernel_session, Config, Error, ProgressSink};

/// Execute `code` against `pool`, retrying up to `config.max_retry_attempts`
/// times on infrastructure failure, and returning the aggregated output of
/// whichever attempt succeeded.
///
/// A [`Error::RemoteExecutionError`] (the submitted code itself raised)
/// short-circuits retry entirely and is returned on the first attempt, since
/// a different kernel would fail the same way. Every other error kind marks
/// the kernel that produced it failed and is retried on a freshly acquired
/// kernel, which may or may not be the same one.
pub async fn execute<A: KernelAdmin + 'static>(
    pool: &Arc<Pool<A>>,
    code: &str,
    progress: &dyn ProgressSink,
    config: &Config,
) -> Result<String, Error> {
    pool.initialize().await;

    let mut last_error = None;

    for attempt in 0..config.max_retry_attempts {
        if attempt > 0 {
            let delay = config.backoff(attempt - 1);
            warn!(attempt, delay_secs = delay.as_secs_f64(), "retrying execution");
            progress
                .progress(format!("Retrying after a transient failure (attempt {})...", attempt + 1))
                .await;
            tokio::time::sleep(delay).await;
        }

        let Some(kernel_id) = pool.acquire().await else {
            last_error = Some(Error::PoolExhausted);
            continue;
        };

        let mut channel = match pool.open_channel(&kernel_id).await {
            Ok(channel) => channel,
            Err(err) => {
                // A channel-open failure is always a kernel-side infrastructure
                // problem, never the submitted code's fault, so it is always
                // retried against a fresh kernel.
                pool.release(&kernel_id, true).await;
                last_error = Some(err);
                continue;
            }
        };

        let result = kernel_session::run(&kernel_id, channel.as_mut(), code, progress, config).await;
        channel.close().await;

        match result {
            Ok(output) => {
                pool.release(&kernel_id, false).await;
                info!(kernel_id, attempt, "execution succeeded");
                return Ok(output);
            }
            Err(err) => {
                let retryable = err.is_retryable();
                pool.release(&kernel_id, retryable).await;
                if !retryable {
                    return Err(err);
                }
                warn!(kernel_id, attempt, %err, "execution failed, will retry if attempts remain");
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or(Error::PoolExhausted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::kernel_admin::{KernelChannel, RecvOutcome};
    use crate::wire::Classified;

    struct NoopSink;

    #[async_trait]
    impl ProgressSink for NoopSink {
        async fn progress(&self, _text: String) {}
    }

    struct SucceedsAfterNAttempts {
        kernels_created: AtomicU32,
        fail_until_attempt: u32,
    }

    struct FlakyChannel {
        should_fail: bool,
        sent: bool,
    }

    #[async_trait]
    impl KernelChannel for FlakyChannel {
        async fn send_execute_request(&mut self, _code: &str) -> Result<String, Error> {
            self.sent = true;
            Ok("msg-id".to_string())
        }

        async fn recv(&mut self, _timeout: Duration) -> RecvOutcome {
            if self.should_fail {
                RecvOutcome::Closed
            } else {
                RecvOutcome::Envelope(crate::wire::IncomingEnvelope {
                    parent_msg_id: Some("msg-id".to_string()),
                    classified: Some(Classified::Status { idle: true }),
                })
            }
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl KernelAdmin for SucceedsAfterNAttempts {
        async fn create_kernel(&self, _spec_name: &str) -> Result<String, Error> {
            let n = self.kernels_created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("kernel-{n}"))
        }

        async fn delete_kernel(&self, _kernel_id: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn open_channel(&self, kernel_id: &str) -> Result<Box<dyn KernelChannel>, Error> {
            let attempt: u32 = kernel_id
                .strip_prefix("kernel-")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            Ok(Box::new(FlakyChannel {
                should_fail: attempt < self.fail_until_attempt,
                sent: false,
            }))
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_kernel_works() {
        let admin = SucceedsAfterNAttempts {
            kernels_created: AtomicU32::new(0),
            fail_until_attempt: 0,
        };
        let config = Config::default().with_min_kernels(1).with_max_kernels(2);
        let pool = Pool::new(admin, config.clone());
        let sink = NoopSink;

        let output = execute(&pool, "1+1", &sink, &config).await.unwrap();
        assert_eq!(output, "[Execution successful with no output]");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn retries_on_channel_closed_and_eventually_succeeds() {
        let admin = SucceedsAfterNAttempts {
            kernels_created: AtomicU32::new(0),
            fail_until_attempt: 1,
        };
        let config = Config::default()
            .with_min_kernels(1)
            .with_max_kernels(3)
            .with_max_retry_attempts(3);
        let pool = Pool::new(admin, config.clone());
        let sink = NoopSink;

        let output = execute(&pool, "1+1", &sink, &config).await.unwrap();
        assert_eq!(output, "[Execution successful with no output]");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn gives_up_after_max_retry_attempts() {
        let admin = SucceedsAfterNAttempts {
            kernels_created: AtomicU32::new(0),
            fail_until_attempt: 100,
        };
        let config = Config::default()
            .with_min_kernels(1)
            .with_max_kernels(3)
            .with_max_retry_attempts(2);
        let pool = Pool::new(admin, config.clone());
        let sink = NoopSink;

        let err = execute(&pool, "1+1", &sink, &config).await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed { .. }));
        pool.shutdown().await;
    }

    struct ErrorOnExecuteAdmin;

    struct ErrorChannel;

    #[async_trait]
    impl KernelChannel for ErrorChannel {
        async fn send_execute_request(&mut self, _code: &str) -> Result<String, Error> {
            Ok("msg-id".to_string())
        }

        async fn recv(&mut self, _timeout: Duration) -> RecvOutcome {
            RecvOutcome::Envelope(crate::wire::IncomingEnvelope {
                parent_msg_id: Some("msg-id".to_string()),
                classified: Some(Classified::Error {
                    traceback: "NameError: name 'x' is not defined".to_string(),
                }),
            })
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl KernelAdmin for ErrorOnExecuteAdmin {
        async fn create_kernel(&self, _spec_name: &str) -> Result<String, Error> {
            Ok("kernel-0".to_string())
        }
        async fn delete_kernel(&self, _kernel_id: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn open_channel(&self, _kernel_id: &str) -> Result<Box<dyn KernelChannel>, Error> {
            Ok(Box::new(ErrorChannel))
        }
    }

    #[tokio::test]
    async fn remote_execution_error_is_not_retried() {
        let config = Config::default()
            .with_min_kernels(1)
            .with_max_kernels(1)
            .with_max_retry_attempts(5);
        let pool = Pool::new(ErrorOnExecuteAdmin, config.clone());
        let sink = NoopSink;

        let err = execute(&pool, "x", &sink, &config).await.unwrap_err();
        assert!(matches!(err, Error::RemoteExecutionError { .. }));
        assert!(!err.is_retryable());

        // The kernel should have been released healthy, not evicted, since
        // a RemoteExecutionError is the user's fault, not the kernel's.
        assert_eq!(pool.len().await, 1);
        pool.shutdown().await;
    }
}
