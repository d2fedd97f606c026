//! The thin shim a tool-calling framework talks to: one incoming call in,
//! one string out, never an exception.

use std::sync::Arc;

use crate::kernel_admin::KernelAdmin;
use crate::pool::Pool;
use crate::{engine, Config, ErrorResponse, ProgressSink};

/// Name of the single tool this crate exposes to a tool-calling framework.
pub const TOOL_NAME: &str = "execute_python_code";

/// Run `command` to completion and return either its aggregated output or a
/// string beginning with `"Error:"` describing the failure.
///
/// This is the only place an [`crate::Error`] is flattened into a plain
/// string; every layer below composes with `?` instead. A web-scraping
/// companion tool exists in the reference implementation this crate is
/// modeled on but is out of scope here.
pub async fn execute_python_code<A: KernelAdmin + 'static>(
    pool: &Arc<Pool<A>>,
    command: &str,
    progress: &dyn ProgressSink,
    config: &Config,
) -> String {
    match engine::execute(pool, command, progress, config).await {
        Ok(output) => output,
        Err(err @ crate::Error::RemoteExecutionError { .. }) => err.to_string(),
        Err(err) => format!("Error: {}", ErrorResponse::from(&err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::kernel_admin::{KernelChannel, RecvOutcome};
    use crate::wire::{Classified, IncomingEnvelope};
    use crate::Error;

    struct NoopSink;

    #[async_trait]
    impl ProgressSink for NoopSink {
        async fn progress(&self, _text: String) {}
    }

    struct AlwaysIdleChannel;

    #[async_trait]
    impl KernelChannel for AlwaysIdleChannel {
        async fn send_execute_request(&mut self, _code: &str) -> Result<String, Error> {
            Ok("msg".to_string())
        }
        async fn recv(&mut self, _timeout: Duration) -> RecvOutcome {
            RecvOutcome::Envelope(IncomingEnvelope {
                parent_msg_id: Some("msg".to_string()),
                classified: Some(Classified::Status { idle: true }),
            })
        }
        async fn close(&mut self) {}
    }

    struct WorkingAdmin;

    #[async_trait]
    impl KernelAdmin for WorkingAdmin {
        async fn create_kernel(&self, _spec_name: &str) -> Result<String, Error> {
            Ok("kernel-0".to_string())
        }
        async fn delete_kernel(&self, _kernel_id: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn open_channel(&self, _kernel_id: &str) -> Result<Box<dyn KernelChannel>, Error> {
            Ok(Box::new(AlwaysIdleChannel))
        }
    }

    struct NeverCreatesAdmin;

    #[async_trait]
    impl KernelAdmin for NeverCreatesAdmin {
        async fn create_kernel(&self, _spec_name: &str) -> Result<String, Error> {
            Err(Error::AdminFailure("kernel host unreachable".to_string()))
        }
        async fn delete_kernel(&self, _kernel_id: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn open_channel(&self, _kernel_id: &str) -> Result<Box<dyn KernelChannel>, Error> {
            unreachable!("no kernel is ever created")
        }
    }

    #[tokio::test]
    async fn successful_execution_returns_output_unprefixed() {
        let config = Config::default().with_min_kernels(1).with_max_kernels(1);
        let pool = Pool::new(WorkingAdmin, config.clone());
        let sink = NoopSink;

        let result = execute_python_code(&pool, "1+1", &sink, &config).await;
        assert_eq!(result, "[Execution successful with no output]");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn infrastructure_failure_surfaces_as_error_prefixed_string() {
        let config = Config::default()
            .with_min_kernels(1)
            .with_max_kernels(1)
            .with_max_retry_attempts(1);
        let pool = Pool::new(NeverCreatesAdmin, config.clone());
        let sink = NoopSink;

        let result = execute_python_code(&pool, "1+1", &sink, &config).await;
        assert!(result.starts_with("Error:"));
    }
}
