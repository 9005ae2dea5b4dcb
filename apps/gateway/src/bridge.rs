//! WebSocket upgrade and raw socket handoff.
//!
//! The gateway answers the upgrade itself and then gets out of the way: the
//! upgraded byte stream goes to the worker, which owns all WebSocket framing
//! from then on.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

/// Fixed GUID from the WebSocket handshake algorithm (RFC 6455 §4.2.2).
const WEBSOCKET_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` value for a client's `Sec-WebSocket-Key`.
pub fn websocket_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_MAGIC_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}
