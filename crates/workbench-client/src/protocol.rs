//! Wire types for the gateway ↔ worker IPC channel.
//!
//! One JSON object per line over the worker's stdio. The `socket` envelope is
//! special: it is written as the first line of a session-socket connection
//! instead of the stdio channel, and raw bytes follow it (see
//! [`crate::client::WorkerHandle::handoff_socket`]).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A resolved start location for a session and whether it denotes a
/// workspace root (as opposed to a single file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPath {
    pub url: String,
    pub workspace: bool,
}

/// A query parameter value: a single string or a repeated one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    One(String),
    Many(Vec<String>),
}

impl QueryValue {
    /// First non-empty value, if any.
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::One(value) => Some(value.as_str()).filter(|value| !value.is_empty()),
            Self::Many(values) => values
                .iter()
                .map(String::as_str)
                .find(|value| !value.is_empty()),
        }
    }

    /// The value as a single string, when it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::One(value) => Some(value.as_str()),
            Self::Many(_) => None,
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

/// Parsed query parameters of an inbound request, forwarded to the worker
/// opaquely on socket handoff.
pub type Query = HashMap<String, QueryValue>;

/// Payload sent to the worker when initializing a browser session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    /// Gateway arguments, carried opaquely.
    pub args: Value,
    /// The requesting host, used by the worker as the remote authority.
    pub remote_authority: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_path: Option<StartPath>,
}

/// Payload returned by the worker describing what the browser should render.
///
/// Opaque beyond the field names; the gateway only substitutes these into
/// the root page shell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkbenchOptions {
    pub remote_user_data_uri: Value,
    pub product_configuration: Value,
    pub workbench_web_configuration: Value,
    pub nls_configuration: Value,
}

/// Messages sent gateway → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GatewayMessage {
    /// Begin a session; answered by [`WorkerMessage::Options`] with the
    /// same id.
    Init { id: Uuid, options: SessionOptions },
    /// Announces a handed-off connection; raw socket bytes follow.
    Socket { query: Query },
}

/// Messages sent worker → gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// The worker is initialized and able to accept sessions.
    Ready,
    /// Handshake response, correlated by id.
    Options { id: Uuid, options: WorkbenchOptions },
}
