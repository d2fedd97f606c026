//! Driving exactly one code execution to completion on one open kernel
//! message channel.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::kernel_admin::{KernelChannel, RecvOutcome};
use crate::wire::Classified;
use crate::{Config, Error, ProgressSink};

/// Run one execution of `code` on `channel`, forwarding incremental output
/// through `progress` and returning the aggregated result text.
///
/// This is the `Kernel Session` component: it owns the channel exclusively
/// for the duration of the call, sends one `execute_request`, demultiplexes
/// replies by `parent_msg_id`, and terminates on a matching idle status, a
/// matching error, or a wall-clock timeout.
pub async fn run(
    kernel_id: &str,
    channel: &mut dyn KernelChannel,
    code: &str,
    progress: &dyn ProgressSink,
    config: &Config,
) -> Result<String, Error> {
    progress
        .progress(format!(
            "Executing on kernel {}...",
            &kernel_id[..kernel_id.len().min(8)]
        ))
        .await;

    let sent_msg_id = channel.send_execute_request(code).await?;
    info!(kernel_id, msg_id = %sent_msg_id, "sent execute_request");

    let start = Instant::now();
    let mut last_activity = start;
    let mut output = String::new();

    loop {
        let elapsed = start.elapsed();
        if elapsed >= config.ws_timeout {
            warn!(kernel_id, msg_id = %sent_msg_id, elapsed_secs = elapsed.as_secs(), "session timed out");
            return Err(Error::SessionTimeout {
                kernel_id: kernel_id.to_string(),
                elapsed_secs: elapsed.as_secs(),
            });
        }

        let recv_budget = config
            .recv_timeout(last_activity.elapsed())
            .min(config.ws_timeout.saturating_sub(elapsed).max(Duration::from_millis(1)));

        match channel.recv(recv_budget).await {
            RecvOutcome::Timeout => {
                let elapsed_secs = start.elapsed().as_secs();
                progress
                    .progress(format!("Still executing... ({elapsed_secs} seconds elapsed)"))
                    .await;
                continue;
            }
            RecvOutcome::Closed => {
                warn!(kernel_id, msg_id = %sent_msg_id, "channel closed before idle");
                return Err(Error::ChannelClosed {
                    kernel_id: kernel_id.to_string(),
                });
            }
            RecvOutcome::Malformed => {
                // Logged by the channel implementation; keep reading.
                continue;
            }
            RecvOutcome::Envelope(envelope) => {
                last_activity = Instant::now();

                if envelope.parent_msg_id.as_deref() != Some(sent_msg_id.as_str()) {
                    continue;
                }

                match envelope.classified {
                    Some(Classified::Stream { text }) => {
                        progress.progress(text.trim_end().to_string()).await;
                        output.push_str(&text);
                    }
                    Some(Classified::Result { text_plain }) => {
                        output.push_str(&text_plain);
                    }
                    Some(Classified::Error { traceback }) => {
                        warn!(kernel_id, msg_id = %sent_msg_id, "kernel reported an execution error");
                        return Err(Error::RemoteExecutionError { traceback });
                    }
                    Some(Classified::Status { idle: true }) => {
                        progress.progress("Execution completed".to_string()).await;
                        info!(kernel_id, msg_id = %sent_msg_id, "execution completed");
                        return Ok(if output.is_empty() {
                            "[Execution successful with no output]".to_string()
                        } else {
                            output
                        });
                    }
                    Some(Classified::Status { idle: false }) | None => {}
                }
            }
        }
    }
}
