//! Cookie-based session gate.
//!
//! The gateway only checks presence of a valid session cookie; issuing the
//! cookie (the login flow itself) belongs to the outer web layer.

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use sha2::{Digest, Sha256};

use crate::config::{AuthMode, Config};

pub const SESSION_COOKIE_NAME: &str = "workbench_session";

/// The expected cookie value for a password: its SHA-256 hex digest.
pub fn session_token(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

pub fn authenticated(config: &Config, headers: &HeaderMap) -> bool {
    match config.auth_mode {
        AuthMode::None => true,
        AuthMode::Password => {
            let Some(password) = config.password.as_deref() else {
                return false;
            };
            cookie_value(headers, SESSION_COOKIE_NAME)
                .is_some_and(|value| value == session_token(password))
        }
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
