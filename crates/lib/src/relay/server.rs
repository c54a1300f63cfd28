//! Relay HTTP + WebSocket server (single port, single path).

use crate::config::Config;
use crate::relay::handshake::{self, HandshakeError};
use crate::relay::heartbeat;
use crate::relay::registry::Registry;
use crate::relay::session;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeDir;

/// Shared state for the relay (registry and static assets).
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<Registry>,
    assets: ServeDir,
}

/// Query string of an upgrade request: `?room=<ticket>`.
#[derive(Debug, Default, Deserialize)]
struct UpgradeQuery {
    room: Option<String>,
}

fn requested_room(uri: &Uri) -> Option<String> {
    Query::<UpgradeQuery>::try_from_uri(uri)
        .map(|Query(q)| q.room)
        .unwrap_or_default()
}

/// Run the relay server; binds to config.server.bind:config.server.port.
/// Starts the heartbeat monitor, prints the startup banner, and blocks until shutdown
/// (Ctrl+C / SIGTERM), at which point every open connection is closed.
pub async fn run_relay(config: Config) -> Result<()> {
    let registry = Arc::new(Registry::new());
    let state = RelayState {
        registry: registry.clone(),
        assets: ServeDir::new(&config.server.dir),
    };

    let app = Router::new().fallback(handle_request).with_state(state);

    let bind_addr = format!("{}:{}", config.server.bind.trim(), config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("relay listening on {}", bind_addr);
    print_banner(&config.server.dir, config.server.port);

    let monitor = heartbeat::spawn(registry.clone(), config.server.heartbeat_interval());

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(registry))
        .await
        .context("relay server exited")?;
    monitor.abort();
    log::info!("relay stopped");
    Ok(())
}

/// Every request lands here: upgrades go to the handshake, everything else to static assets.
async fn handle_request(
    State(state): State<RelayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request,
) -> Response {
    let is_ws = handshake::is_upgrade_request(req.headers());
    log::debug!(
        "{} {} {:?} {} | {}",
        if is_ws { "WS" } else { req.method().as_str() },
        req.uri().path(),
        req.version(),
        peer,
        req.headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    );

    if is_ws {
        return upgrade(state, &mut req);
    }

    match state.assets.oneshot(req).await {
        Ok(res) => res.map(Body::new),
        Err(never) => match never {},
    }
}

/// Answer the handshake and hand the stream to a session task once hyper releases it.
///
/// A request without `Sec-WebSocket-Key` cannot be dropped without an HTTP answer here, so it
/// gets `400` with `Connection: close` and no registry state.
fn upgrade(state: RelayState, req: &mut Request) -> Response {
    let room = requested_room(req.uri());
    let negotiated = match handshake::negotiate(req) {
        Ok(n) => n,
        Err(HandshakeError::MissingKey) => {
            log::debug!("upgrade request without Sec-WebSocket-Key, dropping");
            return refuse_upgrade();
        }
        Err(e @ HandshakeError::StreamUnavailable) => {
            log::error!("websocket upgrade failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    log::debug!("handshake accepted ({})", negotiated.accept());
    let response = negotiated.response();
    tokio::spawn(async move {
        match negotiated.into_stream().await {
            Ok(stream) => session::serve(stream, state.registry, room).await,
            Err(e) => log::error!("websocket upgrade failed: {}", e),
        }
    });
    response
}

fn refuse_upgrade() -> Response {
    (StatusCode::BAD_REQUEST, [(header::CONNECTION, "close")]).into_response()
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Closes every relay connection so each session tears itself down.
async fn shutdown_signal(registry: Arc<Registry>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing {} connection(s)", registry.len().await);
    registry.close_all().await;
}

fn print_banner(dir: &Path, port: u16) {
    println!("\x1b[1mServing: {}", dir.display());
    println!("\x1b[38;5;159mhttp://localhost:{}", port);
    println!("\x1b[38;5;158mhttp://{}:{}", local_lan_addr(), port);
    println!("\x1b[38;5;225mCtrl-C\x1b[0m to exit");
}

/// First non-loopback IPv4 address of this host, or 127.0.0.1. Connecting a UDP socket only
/// selects a route; nothing is sent.
fn local_lan_addr() -> IpAddr {
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) else {
        return loopback;
    };
    if socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).is_err() {
        return loopback;
    }
    match socket.local_addr() {
        Ok(addr) if is_lan(addr.ip()) => addr.ip(),
        _ => loopback,
    }
}

fn is_lan(ip: IpAddr) -> bool {
    ip.is_ipv4() && !ip.is_loopback() && !ip.is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_comes_from_query() {
        let uri: Uri = "/?room=3fa9c2d1".parse().unwrap();
        assert_eq!(requested_room(&uri).as_deref(), Some("3fa9c2d1"));
        let uri: Uri = "/?other=1".parse().unwrap();
        assert_eq!(requested_room(&uri), None);
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(requested_room(&uri), None);
    }

    #[test]
    fn missing_key_refusal_closes_the_connection() {
        let res = refuse_upgrade();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.headers()[header::CONNECTION], "close");
    }

    #[test]
    fn lan_addr_is_ipv4() {
        assert!(local_lan_addr().is_ipv4());
    }
}
