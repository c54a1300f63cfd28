//! WebSocket opening handshake on top of the HTTP host.
//!
//! Recognizes upgrade requests, computes `Sec-WebSocket-Accept`, answers `101 Switching
//! Protocols`, and takes the raw connection from hyper once the response is out.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use base64::Engine;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("webserver doesn't support hijacking")]
    StreamUnavailable,
}

/// Upgrade predicate: `Connection` contains "upgrade" and `Upgrade` equals "websocket",
/// both case-insensitive.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    connection.to_ascii_lowercase().contains("upgrade")
        && upgrade.eq_ignore_ascii_case("websocket")
}

/// base64(SHA-1(key ++ GUID)).
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// An accepted upgrade: the 101 response to send and the pending raw stream.
pub struct Negotiated {
    accept: String,
    on_upgrade: OnUpgrade,
}

/// Validate an upgrade request and claim its connection. Nothing is registered yet, so an
/// error here leaves no state behind.
pub fn negotiate(req: &mut Request) -> Result<Negotiated, HandshakeError> {
    let key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?;
    let accept = accept_key(key);
    let on_upgrade = req
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(HandshakeError::StreamUnavailable)?;
    Ok(Negotiated { accept, on_upgrade })
}

impl Negotiated {
    pub fn accept(&self) -> &str {
        &self.accept
    }

    /// The `101 Switching Protocols` response.
    pub fn response(&self) -> Response {
        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = res.headers_mut();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Ok(accept) = HeaderValue::from_str(&self.accept) {
            headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        }
        res
    }

    /// Wait for hyper to hand over the connection after the 101 has been written.
    pub async fn into_stream(self) -> Result<TokioIo<Upgraded>, hyper::Error> {
        self.on_upgrade.await.map(TokioIo::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers(connection: &str, upgrade: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_str(connection).unwrap());
        headers.insert(header::UPGRADE, HeaderValue::from_str(upgrade).unwrap());
        headers
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn upgrade_predicate_is_case_insensitive() {
        assert!(is_upgrade_request(&upgrade_headers("Upgrade", "websocket")));
        assert!(is_upgrade_request(&upgrade_headers("keep-alive, UPGRADE", "WebSocket")));
        assert!(!is_upgrade_request(&upgrade_headers("keep-alive", "websocket")));
        assert!(!is_upgrade_request(&upgrade_headers("Upgrade", "h2c")));
        assert!(!is_upgrade_request(&HeaderMap::new()));
    }

    #[test]
    fn missing_key_is_rejected_before_claiming_stream() {
        let mut req = axum::http::Request::builder()
            .uri("/?room=abc")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(negotiate(&mut req), Err(HandshakeError::MissingKey)));
    }

    #[test]
    fn request_without_upgrade_extension_cannot_be_claimed() {
        let mut req = axum::http::Request::builder()
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(negotiate(&mut req), Err(HandshakeError::StreamUnavailable)));
    }
}
