//! Jupyter kernel wire protocol: building `execute_request` envelopes and
//! classifying incoming envelopes.
//!
//! See the [Messaging in Jupyter](https://jupyter-client.readthedocs.io/en/stable/messaging.html)
//! page for background. This module implements the JSON-envelope variant of
//! the protocol carried over WebSocket, not the binary-framed
//! `v1.kernel.websocket.jupyter.org` subprotocol or the raw ZeroMQ wire
//! format.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version placed in every outgoing header.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Header of a message, part of the `{header, parent_header, metadata,
/// content, buffers}` 5-tuple.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Unique id of this message; replies and broadcasts reference it via
    /// `parent_header.msg_id`.
    pub msg_id: String,

    /// Id of the session this message belongs to.
    pub session: String,

    /// Username attributed to the message.
    pub username: String,

    /// The message type, e.g. `"execute_request"`, `"stream"`, `"status"`.
    pub msg_type: String,

    /// Message protocol version.
    pub version: String,
}

/// A parent header as it appears embedded in a reply, which may be entirely
/// absent (a kernel `starting` status broadcast has none) or present but
/// missing fields we don't otherwise require.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ParentHeader {
    /// The `msg_id` of the message this one replies to or was caused by.
    #[serde(default)]
    pub msg_id: Option<String>,
}

/// Content of an `execute_request` message.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteRequestContent {
    /// Source code to be executed by the kernel.
    pub code: String,
    /// If true, the kernel executes as quietly as possible.
    pub silent: bool,
    /// If true, the kernel populates execution history.
    pub store_history: bool,
    /// Expressions to evaluate in the user's namespace after execution.
    pub user_expressions: BTreeMap<String, String>,
    /// If true, the kernel may prompt for stdin.
    pub allow_stdin: bool,
    /// If true, abort the execution queue on an exception.
    pub stop_on_error: bool,
}

/// A fully-built outgoing envelope, ready to be serialized to JSON and sent
/// over the kernel's message channel.
#[derive(Serialize, Clone, Debug)]
pub struct OutgoingEnvelope {
    pub header: Header,
    pub parent_header: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, Value>,
    pub content: ExecuteRequestContent,
    pub buffers: Vec<Value>,
}

/// Generate a fresh 128-bit random id rendered as a 32-character lowercase
/// hex string, matching `uuid.uuid4().hex` in the reference implementation
/// (i.e. a v4 UUID without its dashes, not a cryptographic nonce).
pub fn new_hex_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Build an `execute_request` envelope for `code`. Returns the envelope
/// along with the `msg_id` a caller should correlate replies against.
pub fn build_execute_request(code: &str) -> (String, OutgoingEnvelope) {
    let msg_id = new_hex_id();
    let session = new_hex_id();
    let envelope = OutgoingEnvelope {
        header: Header {
            msg_id: msg_id.clone(),
            session,
            username: "kernelbroker".to_string(),
            msg_type: "execute_request".to_string(),
            version: PROTOCOL_VERSION.to_string(),
        },
        parent_header: BTreeMap::new(),
        metadata: BTreeMap::new(),
        content: ExecuteRequestContent {
            code: code.to_string(),
            silent: false,
            store_history: false,
            user_expressions: BTreeMap::new(),
            allow_stdin: false,
            stop_on_error: true,
        },
        buffers: Vec::new(),
    };
    (msg_id, envelope)
}

/// A recognized classification of an incoming envelope, holding only the
/// fields the session driver needs from `content`. Unrecognized `msg_type`s
/// produce `None` from [`classify`] and are discarded by the caller —
/// forward-compatible with future kernel protocol revisions per the design
/// note in `SPEC_FULL.md` §9.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// `stream`: incremental stdout/stderr-like text.
    Stream { text: String },
    /// `execute_result` or `display_data`: a final or intermediate rich
    /// result; only the `text/plain` representation is kept.
    Result { text_plain: String },
    /// `error`: the kernel raised an exception while running the code.
    Error { traceback: String },
    /// `status`: a kernel execution-state broadcast.
    Status { idle: bool },
}

/// The parsed pieces of one incoming envelope that the session driver needs:
/// which request it replies to (if any) and its classification (if
/// recognized).
#[derive(Debug, Clone)]
pub struct IncomingEnvelope {
    pub parent_msg_id: Option<String>,
    pub classified: Option<Classified>,
}

/// Parse and classify one incoming envelope from raw JSON text.
///
/// Returns `Err` only when the envelope is not even well-formed JSON with a
/// `header`/`content` shape — per the design, such a failure is logged and
/// the envelope is skipped; it must never abort the session.
pub fn parse_envelope(raw: &str) -> Result<IncomingEnvelope, serde_json::Error> {
    #[derive(Deserialize)]
    struct RawEnvelope {
        header: RawHeader,
        #[serde(default)]
        parent_header: ParentHeader,
        #[serde(default)]
        content: Value,
    }

    #[derive(Deserialize)]
    struct RawHeader {
        msg_type: String,
    }

    let envelope: RawEnvelope = serde_json::from_str(raw)?;
    let classified = classify(&envelope.header.msg_type, &envelope.content);

    Ok(IncomingEnvelope {
        parent_msg_id: envelope.parent_header.msg_id,
        classified,
    })
}

fn classify(msg_type: &str, content: &Value) -> Option<Classified> {
    match msg_type {
        "stream" => Some(Classified::Stream {
            text: content.get("text")?.as_str()?.to_string(),
        }),
        "execute_result" | "display_data" => {
            let text_plain = content
                .get("data")
                .and_then(|d| d.get("text/plain"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            Some(Classified::Result { text_plain })
        }
        "error" => {
            let traceback = content
                .get("traceback")
                .and_then(|v| v.as_array())
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(|l| l.as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            Some(Classified::Error { traceback })
        }
        "status" => {
            let idle = content.get("execution_state").and_then(|v| v.as_str()) == Some("idle");
            Some(Classified::Status { idle })
        }
        _ => None,
    }
}
