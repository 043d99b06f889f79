//! Inbound request authentication.
//!
//! Editor plugins present the relay's own key as `Authorization: Basic
//! base64(key)`. This key only grants access to the relay; it is never
//! forwarded upstream — each outbound call carries its target's configured
//! credential instead.

use crate::config::RelayConfig;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use subtle::ConstantTimeEq;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthDecision {
    Allowed,
    Denied,
}

/// Checks the presented Authorization header against the relay's key.
///
/// A `require_api_key` config with an empty `api_key` denies everything: a
/// misconfigured relay must not become an open one.
pub fn check(authorization: Option<&str>, config: &RelayConfig) -> AuthDecision {
    if !config.require_api_key {
        return AuthDecision::Allowed;
    }

    if config.api_key.is_empty() {
        tracing::error!("require_api_key is set but api_key is empty, denying all requests");
        return AuthDecision::Denied;
    }

    let Some(header) = authorization else {
        tracing::info!("api key required but not provided");
        return AuthDecision::Denied;
    };

    let Some(encoded) = header.strip_prefix("Basic ") else {
        tracing::info!("invalid api key format");
        return AuthDecision::Denied;
    };

    let Ok(presented) = STANDARD.decode(encoded.trim()) else {
        tracing::info!("invalid api key encoding");
        return AuthDecision::Denied;
    };

    // Constant-time comparison; ct_eq on unequal lengths is already false
    if bool::from(presented.ct_eq(config.api_key.as_bytes())) {
        AuthDecision::Allowed
    } else {
        tracing::info!("invalid api key");
        AuthDecision::Denied
    }
}

/// Builds the `Basic` Authorization value carrying an upstream credential.
pub fn basic_header_value(credential: &str) -> String {
    format!("Basic {}", STANDARD.encode(credential))
}
