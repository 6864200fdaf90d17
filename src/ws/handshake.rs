//! RFC 6455 opening handshake: server-side request validation plus the
//! `Sec-WebSocket-Accept` derivation, and client-side key generation plus
//! accept verification.
//!
//! The accept-value derivation (`base64(sha1(key || GUID))`) is treated as
//! a black-box primitive per spec §1 — no teacher module computes it, so
//! this is grounded directly in the RFC text via the pack's `sha1`/`base64`
//! dependencies rather than any example's code.

use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::http::Request;
use crate::{Error, ErrorKind};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn accept_value(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Validates an incoming upgrade request per spec §4.7 and, if valid,
/// returns the `Sec-WebSocket-Accept` value the server should echo back in
/// a 101 response.
pub fn validate_server_request(request: &Request) -> Result<String, Error> {
    let upgrade_ok = request
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection_ok = request
        .header("connection")
        .is_some_and(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")));
    let version_ok = request.header("sec-websocket-version") == Some("13");
    let key = request.header("sec-websocket-key").unwrap_or("");

    if !upgrade_ok || !connection_ok || !version_ok || key.is_empty() {
        return Err(Error::new(
            ErrorKind::ProtocolError,
            "request does not satisfy the WebSocket upgrade handshake contract",
        ));
    }
    Ok(accept_value(key))
}

/// Generates a fresh client handshake key: 16 random bytes, base64-encoded.
pub fn generate_client_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Verifies a server's `Sec-WebSocket-Accept` header value against the key
/// the client sent.
pub fn verify_server_accept(key: &str, accept_header: &str) -> bool {
    accept_value(key) == accept_header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Version};

    fn upgrade_request(key: &str) -> Request {
        Request::new(
            Method::Get,
            Version::Http11,
            "/chat".to_string(),
            vec![
                ("Upgrade".to_string(), "websocket".to_string()),
                ("Connection".to_string(), "Upgrade".to_string()),
                ("Sec-WebSocket-Version".to_string(), "13".to_string()),
                ("Sec-WebSocket-Key".to_string(), key.to_string()),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn known_key_produces_the_rfc_example_accept_value() {
        // RFC 6455 §1.3 worked example.
        let accept = accept_value("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn valid_upgrade_request_yields_accept_value() {
        let req = upgrade_request("dGhlIHNhbXBsZSBub25jZQ==");
        let accept = validate_server_request(&req).unwrap();
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn missing_upgrade_header_is_rejected() {
        let req = Request::new(
            Method::Get,
            Version::Http11,
            "/chat".to_string(),
            vec![
                ("Connection".to_string(), "Upgrade".to_string()),
                ("Sec-WebSocket-Version".to_string(), "13".to_string()),
                ("Sec-WebSocket-Key".to_string(), "key".to_string()),
            ],
            Vec::new(),
        );
        assert!(validate_server_request(&req).is_err());
    }

    #[test]
    fn client_round_trip_generates_and_verifies() {
        let key = generate_client_key();
        let accept = accept_value(&key);
        assert!(verify_server_accept(&key, &accept));
        assert!(!verify_server_accept(&key, "wrong"));
    }
}
