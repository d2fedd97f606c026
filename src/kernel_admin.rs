//! Creating, deleting, and probing kernels over the kernel host's
//! administrative HTTP surface, and opening message channels to them over
//! WebSocket.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::wire::{self, IncomingEnvelope};
use crate::{Config, Error};

/// The outcome of one bounded receive on a [`KernelChannel`].
pub enum RecvOutcome {
    /// A recognized-or-not envelope arrived within the timeout.
    Envelope(IncomingEnvelope),
    /// No envelope arrived before the timeout elapsed.
    Timeout,
    /// The channel closed.
    Closed,
    /// An envelope arrived but could not be parsed; the caller should log
    /// and keep reading, per the wire codec's failure policy.
    Malformed,
}

/// An open message channel to one specific kernel, able to send a single
/// execute-request and stream back the replies.
///
/// A channel is opened fresh for the duration of one execution (see
/// `SPEC_FULL.md` §4.2) and closed when the caller drops it.
#[async_trait::async_trait]
pub trait KernelChannel: Send {
    /// Send an execute-request envelope, returning the `msg_id` a caller
    /// should correlate replies against.
    async fn send_execute_request(&mut self, code: &str) -> Result<String, Error>;

    /// Wait up to `timeout` for the next envelope.
    async fn recv(&mut self, timeout: Duration) -> RecvOutcome;

    /// Close the channel.
    async fn close(&mut self);
}

/// Creates, destroys, and health-probes kernels, and opens message channels
/// to them. This is the `KernelAdmin` external collaborator the core
/// consumes (`SPEC_FULL.md` §1) — the only thing standing between the pool
/// and the kernel host.
#[async_trait::async_trait]
pub trait KernelAdmin: Send + Sync {
    /// Create a new kernel, returning its id.
    async fn create_kernel(&self, spec_name: &str) -> Result<String, Error>;

    /// Delete a kernel. Failures are the caller's to log; they never
    /// propagate past the pool (`SPEC_FULL.md` §7 AdminFailure policy).
    async fn delete_kernel(&self, kernel_id: &str) -> Result<(), Error>;

    /// Open a fresh message channel to `kernel_id`.
    async fn open_channel(&self, kernel_id: &str) -> Result<Box<dyn KernelChannel>, Error>;

    /// Run a trivial execution (`1+1`) on `kernel_id` and report whether it
    /// completed within the probe timeout.
    async fn probe(&self, kernel_id: &str, probe_timeout: Duration) -> bool {
        let mut channel = match self.open_channel(kernel_id).await {
            Ok(c) => c,
            Err(_) => return false,
        };
        let sent_msg_id = match channel.send_execute_request("1+1").await {
            Ok(id) => id,
            Err(_) => return false,
        };

        let deadline = tokio::time::Instant::now() + probe_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                channel.close().await;
                return false;
            }
            match channel.recv(remaining.min(Duration::from_secs(2))).await {
                RecvOutcome::Envelope(env) => {
                    if env.parent_msg_id.as_deref() == Some(sent_msg_id.as_str()) {
                        if let Some(wire::Classified::Status { idle: true }) = env.classified {
                            channel.close().await;
                            return true;
                        }
                    }
                }
                RecvOutcome::Malformed => continue,
                RecvOutcome::Timeout => {
                    if tokio::time::Instant::now() >= deadline {
                        channel.close().await;
                        return false;
                    }
                }
                RecvOutcome::Closed => {
                    channel.close().await;
                    return false;
                }
            }
        }
    }

    /// Attempt to adopt a pre-existing kernel id recorded on disk, if one is
    /// present and answers a health probe. Absence, emptiness, an unreadable
    /// file, or a failed probe are all non-fatal and simply mean "nothing to
    /// adopt" (`SPEC_FULL.md` §4.3, §9 open question).
    async fn discover_existing(
        &self,
        path: &str,
        probe_timeout: Duration,
    ) -> Option<String> {
        let contents = tokio::fs::read_to_string(path).await.ok()?;
        let kernel_id = contents.trim();
        if kernel_id.is_empty() {
            return None;
        }
        if self.probe(kernel_id, probe_timeout).await {
            Some(kernel_id.to_string())
        } else {
            None
        }
    }
}

/// A [`KernelAdmin`] backed by a real kernel host's HTTP and WebSocket
/// surfaces.
pub struct HttpKernelAdmin {
    http: reqwest::Client,
    admin_base: url::Url,
    ws_base: String,
    create_timeout: Duration,
    delete_timeout: Duration,
    ws_ping_interval: Duration,
    ws_ping_timeout: Duration,
}

impl HttpKernelAdmin {
    /// Build a client talking to a kernel host at `admin_base` (HTTP) and
    /// `ws_base` (`ws://` or `wss://`) using the timeouts in `config`.
    pub fn new(admin_base: &str, ws_base: &str, config: &Config) -> Result<Self, Error> {
        Ok(HttpKernelAdmin {
            http: reqwest::Client::new(),
            admin_base: url::Url::parse(admin_base)?,
            ws_base: ws_base.trim_end_matches('/').to_string(),
            create_timeout: config.admin_create_timeout,
            delete_timeout: config.admin_delete_timeout,
            ws_ping_interval: config.ws_ping_interval,
            ws_ping_timeout: config.ws_ping_timeout,
        })
    }
}

#[async_trait::async_trait]
impl KernelAdmin for HttpKernelAdmin {
    async fn create_kernel(&self, spec_name: &str) -> Result<String, Error> {
        let url = self
            .admin_base
            .join("api/kernels")
            .map_err(Error::InvalidUrl)?;

        #[derive(Deserialize)]
        struct CreatedKernel {
            id: String,
        }

        let resp = timeout(
            self.create_timeout,
            self.http.post(url).json(&json!({ "name": spec_name })).send(),
        )
        .await
        .map_err(|_| Error::AdminFailure("kernel create timed out".to_string()))?
        .map_err(|err| Error::AdminFailure(format!("kernel create request failed: {err}")))?;

        if resp.status() != reqwest::StatusCode::CREATED {
            return Err(Error::AdminFailure(format!(
                "kernel create returned status {}",
                resp.status()
            )));
        }

        let created: CreatedKernel = resp
            .json()
            .await
            .map_err(|err| Error::AdminFailure(format!("malformed kernel create response: {err}")))?;
        info!(kernel_id = %created.id, "created kernel");
        Ok(created.id)
    }

    async fn delete_kernel(&self, kernel_id: &str) -> Result<(), Error> {
        let url = self
            .admin_base
            .join(&format!("api/kernels/{kernel_id}"))
            .map_err(Error::InvalidUrl)?;

        let result = timeout(self.delete_timeout, self.http.delete(url).send()).await;
        match result {
            Ok(Ok(resp)) if resp.status().is_success() => {
                info!(kernel_id, "deleted kernel");
                Ok(())
            }
            Ok(Ok(resp)) => {
                let status = resp.status();
                warn!(kernel_id, %status, "kernel delete returned non-success status");
                Err(Error::AdminFailure(format!(
                    "kernel delete returned status {status}"
                )))
            }
            Ok(Err(err)) => {
                warn!(kernel_id, %err, "kernel delete request failed");
                Err(Error::AdminFailure(format!("kernel delete request failed: {err}")))
            }
            Err(_) => {
                warn!(kernel_id, "kernel delete timed out");
                Err(Error::AdminFailure("kernel delete timed out".to_string()))
            }
        }
    }

    async fn open_channel(&self, kernel_id: &str) -> Result<Box<dyn KernelChannel>, Error> {
        let url = format!("{}/api/kernels/{kernel_id}/channels", self.ws_base);
        let request = url
            .into_client_request()
            .map_err(|source| Error::ChannelOpenFailure {
                kernel_id: kernel_id.to_string(),
                source,
            })?;

        let (stream, _resp) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|source| Error::ChannelOpenFailure {
                kernel_id: kernel_id.to_string(),
                source,
            })?;

        let now = tokio::time::Instant::now();
        Ok(Box::new(WebSocketChannel {
            kernel_id: kernel_id.to_string(),
            stream,
            ping_interval: self.ws_ping_interval,
            ping_timeout: self.ws_ping_timeout,
            last_activity: now,
            next_ping_due: now + self.ws_ping_interval,
            pong_deadline: None,
        }))
    }
}

struct WebSocketChannel {
    kernel_id: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ping_interval: Duration,
    ping_timeout: Duration,
    last_activity: tokio::time::Instant,
    /// When the next keepalive ping is due.
    next_ping_due: tokio::time::Instant,
    /// Set when a ping has been sent and we're waiting on its pong; if `now`
    /// passes this with no pong observed, the channel is treated as dead.
    pong_deadline: Option<tokio::time::Instant>,
}

impl WebSocketChannel {
    /// Record that traffic was just observed on the channel: clears any
    /// pending pong wait and pushes the next keepalive ping out another full
    /// interval, so pings are only sent during genuine quiet periods.
    fn note_activity(&mut self) {
        self.last_activity = tokio::time::Instant::now();
        self.pong_deadline = None;
        self.next_ping_due = self.last_activity + self.ping_interval;
    }
}

#[async_trait::async_trait]
impl KernelChannel for WebSocketChannel {
    async fn send_execute_request(&mut self, code: &str) -> Result<String, Error> {
        use futures_util::SinkExt;

        let (msg_id, envelope) = wire::build_execute_request(code);
        let payload = serde_json::to_string(&envelope)
            .expect("execute-request envelope always serializes");

        self.stream
            .send(Message::Text(payload))
            .await
            .map_err(|source| Error::ChannelProtocolError {
                kernel_id: self.kernel_id.clone(),
                source,
            })?;

        Ok(msg_id)
    }

    /// Waits up to `recv_timeout` for the next envelope, interleaving the
    /// `ws_ping_interval`/`ws_ping_timeout` keepalive: a `Ping` is sent every
    /// `ping_interval` of quiet, and the channel is treated as closed if no
    /// `Pong` (or other traffic) answers within `ping_timeout`.
    async fn recv(&mut self, recv_timeout: Duration) -> RecvOutcome {
        use futures_util::{SinkExt, StreamExt};

        let deadline = tokio::time::Instant::now() + recv_timeout;

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return RecvOutcome::Timeout;
            }

            let mut wake_at = deadline.min(self.next_ping_due);
            if let Some(pong_deadline) = self.pong_deadline {
                wake_at = wake_at.min(pong_deadline);
            }

            tokio::select! {
                item = self.stream.next() => {
                    match item {
                        None => return RecvOutcome::Closed,
                        Some(Err(_)) => return RecvOutcome::Closed,
                        Some(Ok(Message::Text(text))) => {
                            self.note_activity();
                            return match wire::parse_envelope(&text) {
                                Ok(envelope) => RecvOutcome::Envelope(envelope),
                                Err(err) => {
                                    warn!(kernel_id = %self.kernel_id, %err, "skipping malformed envelope");
                                    RecvOutcome::Malformed
                                }
                            };
                        }
                        Some(Ok(Message::Pong(_))) => {
                            // A reply to our keepalive ping; liveness only.
                            self.note_activity();
                        }
                        Some(Ok(Message::Ping(_))) => {
                            // tungstenite answers the peer's ping for us; just
                            // note the liveness signal.
                            self.note_activity();
                        }
                        Some(Ok(Message::Close(_))) => return RecvOutcome::Closed,
                        Some(Ok(_)) => return RecvOutcome::Malformed,
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => {
                    let now = tokio::time::Instant::now();
                    if let Some(pong_deadline) = self.pong_deadline {
                        if now >= pong_deadline {
                            warn!(kernel_id = %self.kernel_id, "no pong within ws_ping_timeout, treating channel as closed");
                            return RecvOutcome::Closed;
                        }
                    }
                    if now >= self.next_ping_due {
                        if self.stream.send(Message::Ping(Vec::new())).await.is_err() {
                            return RecvOutcome::Closed;
                        }
                        self.pong_deadline = Some(now + self.ping_timeout);
                        self.next_ping_due = now + self.ping_interval;
                    } else if now >= deadline {
                        return RecvOutcome::Timeout;
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        use futures_util::SinkExt;
        let _ = self.stream.close(None).await;
    }
}
