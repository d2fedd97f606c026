//! A broker that dispatches code-execution requests from a tool-calling agent
//! to a pool of long-lived Jupyter kernels reachable over WebSocket.
//!
//! [`pool::Pool`] is the kernel lifecycle manager, [`engine::execute`] is the
//! retrying top-level entry point, and [`tool_adapter`] is the thin shim that
//! maps one tool call onto one [`engine::execute`] call.

#![deny(unsafe_code)]

use std::fmt;

pub mod config;
pub mod engine;
pub mod kernel_admin;
pub mod kernel_session;
pub mod pool;
pub mod tool_adapter;
pub mod wire;

pub use config::Config;
pub use engine::execute;
pub use kernel_admin::{HttpKernelAdmin, KernelAdmin, KernelChannel};
pub use pool::Pool;
pub use tool_adapter::execute_python_code;

/// Install a default `tracing` subscriber that writes formatted events to
/// stderr. A convenience for a hosting process that has no logging setup of
/// its own; callers that already configure `tracing` should do that instead
/// of calling this.
pub fn init_tracing() {
    tracing_subscriber::fmt().init();
}

/// Capability for receiving incremental progress text from a running
/// execution, distinct from the final aggregated result.
///
/// Implementations must treat their own failures as non-fatal to the
/// execution they're reporting on; the core never aborts a session because
/// a progress update could not be delivered.
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    /// Deliver one incremental progress update.
    async fn progress(&self, text: String);
}

/// Errors produced by the broker core.
///
/// Every propagating failure mode named in the component design is a variant
/// here, so that internal layers can compose with `?`. [`tool_adapter`] is
/// the only place that flattens an `Error` into the plain strings promised
/// by the tool surface contract.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No kernel was available and the pool was already at `MAX_KERNELS`.
    #[error("no available kernels in pool")]
    PoolExhausted,

    /// A kernel create/delete call against the admin surface failed.
    #[error("kernel admin request failed: {0}")]
    AdminFailure(String),

    /// An invalid URL was constructed from the configured admin/websocket base.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Could not open a message channel to the kernel.
    #[error("could not connect to kernel {kernel_id}: {source}")]
    ChannelOpenFailure {
        /// The kernel that could not be reached.
        kernel_id: String,
        /// The underlying connection error.
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// The message channel closed before an idle status was observed.
    #[error("channel to kernel {kernel_id} closed before execution completed")]
    ChannelClosed {
        /// The kernel whose channel closed.
        kernel_id: String,
    },

    /// A protocol-level error occurred on an open channel.
    #[error("protocol error on channel to kernel {kernel_id}: {source}")]
    ChannelProtocolError {
        /// The kernel whose channel misbehaved.
        kernel_id: String,
        /// The underlying transport error.
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// The wall-clock ceiling for one execution attempt was exceeded.
    #[error("execution timed out after {elapsed_secs}s on kernel {kernel_id}")]
    SessionTimeout {
        /// The kernel the timed-out session was running on.
        kernel_id: String,
        /// Wall-clock seconds elapsed before the timeout fired.
        elapsed_secs: u64,
    },

    /// The kernel raised an exception while running the submitted code. This
    /// is a user error (bad code), not an infrastructure failure, and is
    /// never retried.
    #[error("Execution Error:\n{traceback}")]
    RemoteExecutionError {
        /// The joined traceback lines reported by the kernel.
        traceback: String,
    },
}

impl Error {
    /// Whether the execution engine should retry this failure on a different
    /// kernel, per the propagation policy in the error-handling design.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::RemoteExecutionError { .. })
    }

    /// The kernel this error should be blamed on, if any, for the purpose of
    /// marking a release as failed.
    pub fn kernel_id(&self) -> Option<&str> {
        match self {
            Error::ChannelOpenFailure { kernel_id, .. }
            | Error::ChannelClosed { kernel_id }
            | Error::ChannelProtocolError { kernel_id, .. }
            | Error::SessionTimeout { kernel_id, .. } => Some(kernel_id),
            _ => None,
        }
    }
}

/// A plain-string summary of an [`Error`], suitable for returning across the
/// tool-calling boundary.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    message: String,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<&Error> for ErrorResponse {
    fn from(error: &Error) -> Self {
        ErrorResponse {
            message: error.to_string(),
        }
    }
}
