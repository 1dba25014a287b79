//! The signaling listeners: plain WebSocket on `wsPort`, TLS WebSocket on
//! `wssPort`.
//!
//! Each accepted connection runs the same attach flow: read `wsid` (and
//! the optional `callerId`/`name`) from the upgrade query string, consume
//! the pending-attach record, bind the endpoint to its hub in
//! callee-first order, then run the receive loop until the socket closes.
//! Stale or unknown tickets are dropped silently; the client on the other
//! end is a leftover tab, not a peer worth an error frame.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::{self, Certificate, PrivateKey};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use ringline_shared::types::{AttachTicket, Role};

use crate::endpoint::{EndpointParams, Outbound, SignalingEndpoint};
use crate::error::ServerError;
use crate::hub::HubState;
use crate::keepalive::KeepAliveMgr;
use crate::registry::HubRegistry;

pub struct ListenerCtx {
    pub registry: Arc<HubRegistry>,
    pub keepalive: Arc<KeepAliveMgr>,
    pub shutdown: Arc<std::sync::atomic::AtomicBool>,
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

pub async fn run_ws_listener(ctx: Arc<ListenerCtx>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "signaling listener (ws) running");

    loop {
        let (stream, remote) = listener.accept().await?;
        if ctx.shutdown.load(Ordering::Acquire) {
            break;
        }
        let ctx = ctx.clone();
        tokio::spawn(async move {
            serve_conn(ctx, stream, remote, "serveWs").await;
        });
    }
    Ok(())
}

pub async fn run_wss_listener(
    ctx: Arc<ListenerCtx>,
    port: u16,
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<()> {
    let tls_config = build_tls_config(cert_path, key_path)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "signaling listener (wss) running");

    loop {
        let (stream, remote) = listener.accept().await?;
        if ctx.shutdown.load(Ordering::Acquire) {
            break;
        }
        let ctx = ctx.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => serve_conn(ctx, tls_stream, remote, "serveWss").await,
                Err(e) => debug!(remote = %remote, error = %e, "TLS handshake failed"),
            }
        });
    }
    Ok(())
}

/// TLS 1.2+, server cipher-suite preference, P-256 and X25519 only, and
/// the ECDHE GCM/CHACHA20-POLY1305 suites (plus the TLS 1.3 AEAD suites,
/// which rustls requires for 1.3 handshakes).
fn build_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig, ServerError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_cipher_suites(&[
            rustls::cipher_suite::TLS13_AES_256_GCM_SHA384,
            rustls::cipher_suite::TLS13_AES_128_GCM_SHA256,
            rustls::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            rustls::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            rustls::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            rustls::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            rustls::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            rustls::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            rustls::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ])
        .with_kx_groups(&[&rustls::kx_group::SECP256R1, &rustls::kx_group::X25519])
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| ServerError::Tls(format!("protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("certificate: {}", e)))?;

    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, ServerError> {
    let data = std::fs::read(path)
        .map_err(|e| ServerError::Tls(format!("read {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut data.as_slice())
        .map_err(|_| ServerError::Tls("failed to parse certificate".into()))?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKey, ServerError> {
    let data = std::fs::read(path)
        .map_err(|e| ServerError::Tls(format!("read {}: {}", path.display(), e)))?;

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut data.as_slice())
        .map_err(|_| ServerError::Tls("failed to parse private key".into()))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut data.as_slice())
            .map_err(|_| ServerError::Tls("failed to parse private key".into()))?;
    }
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| ServerError::Tls(format!("no private keys in {}", path.display())))
}

// ---------------------------------------------------------------------------
// Attach flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachQuery {
    pub ticket: AttachTicket,
    pub caller_id: String,
    pub caller_name: String,
}

/// Pull `wsid`, `callerId` and `name` out of the upgrade request URI.
pub fn parse_attach_query(uri: &str) -> Option<AttachQuery> {
    // the URI on the wire is origin-form; graft it onto a dummy base so
    // the url crate handles the percent decoding
    let full = format!("http://s{}", uri);
    let parsed = url::Url::parse(&full).ok()?;

    let mut wsid = String::new();
    let mut caller_id = String::new();
    let mut caller_name = String::new();
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "wsid" => wsid = value.to_string(),
            "callerId" => caller_id = value.to_ascii_lowercase(),
            "name" => caller_name = value.to_string(),
            _ => {}
        }
    }

    let ticket = AttachTicket::parse(&wsid).ok()?;
    Some(AttachQuery {
        ticket,
        caller_id,
        caller_name,
    })
}

/// Which side of the hub a new connection becomes: callee first, then
/// one caller; with both slots filled the connection is tolerated but
/// never bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachRole {
    Callee,
    Caller,
    Unbound,
}

pub fn determine_role(state: &HubState) -> AttachRole {
    if state.callee.is_none() {
        AttachRole::Callee
    } else if state.caller.is_none() {
        AttachRole::Caller
    } else {
        AttachRole::Unbound
    }
}

async fn serve_conn<S>(ctx: Arc<ListenerCtx>, stream: S, remote: SocketAddr, conn_type: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // capture URI and the headers we care about during the handshake
    let mut uri = String::new();
    let mut real_ip: Option<String> = None;
    let mut user_agent = String::new();

    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        uri = req.uri().to_string();
        real_ip = req
            .headers()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        user_agent = req
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(remote = %remote, error = %e, "websocket handshake failed");
            return;
        }
    };

    let Some(query) = parse_attach_query(&uri) else {
        // no or invalid wsid: stale client, drop without a word
        debug!(remote = %remote, uri = %uri, "attach without valid wsid");
        return;
    };

    // reverse proxies hand us the real client address in a header
    let remote_addr = real_ip.unwrap_or_else(|| remote.to_string());

    let services = ctx.registry.services().clone();
    if !services.rate.check(remote.ip()).await {
        return;
    }

    let Some(pending) = ctx.registry.claim_ticket(query.ticket.value()).await else {
        // the callee has just exited, or the ticket was already used
        return;
    };

    let hub = pending.hub.clone();
    let role = determine_role(&*hub.state.read().await);

    let (ep, outbound_rx) = SignalingEndpoint::new(EndpointParams {
        role: match role {
            AttachRole::Callee => Role::Callee,
            _ => Role::Caller,
        },
        hub: Arc::downgrade(&hub),
        callee_id: pending.callee_id.clone(),
        global_id: pending.global_id.clone(),
        remote_addr,
        user_agent,
        client_version: pending.client_version.clone(),
        caller_id: query.caller_id,
        caller_name: query.caller_name,
        conn_type,
    });

    ctx.keepalive.add(&ep);
    ep.set_online(true);

    match role {
        AttachRole::Callee => hub.attach_callee(&ep, &pending).await,
        AttachRole::Caller => hub.attach_caller(&ep).await,
        AttachRole::Unbound => {
            // second caller: transport succeeded, the hub ignores it
            debug!(
                callee = %hub.callee_id,
                addr = %ep.remote_addr,
                "both hub slots taken, connection left unbound"
            );
        }
    }

    let (ws_tx, ws_rx) = ws_stream.split();
    let writer = tokio::spawn(write_loop(outbound_rx, ws_tx));

    read_loop(&ctx, &ep, ws_rx).await;

    // teardown
    ctx.keepalive.remove(ep.conn_id);
    ep.set_online(false);
    if ep.role.is_callee() && ep.is_connected_to_peer() {
        hub.peer_con_has_ended(&ep, "OnClose").await;
    }
    hub.unregister(&ep, "OnClose").await;
    writer.abort();
}

async fn write_loop<S>(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut ws_tx: SplitSink<WebSocketStream<S>, Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let result = match frame {
            Outbound::Text(text) => ws_tx.send(Message::Text(text)).await,
            Outbound::Ping => ws_tx.send(Message::Ping(Vec::new())).await,
            Outbound::Pong => ws_tx.send(Message::Pong(Vec::new())).await,
            Outbound::Close => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
}

async fn read_loop<S>(
    ctx: &Arc<ListenerCtx>,
    ep: &Arc<SignalingEndpoint>,
    mut ws_rx: SplitStream<WebSocketStream<S>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = ep.closed() => break,
            frame = ws_rx.next() => {
                let msg = match frame {
                    None => break,
                    Some(Err(e)) => {
                        debug!(callee = %ep.callee_id, error = %e, "receive error");
                        break;
                    }
                    Some(Ok(msg)) => msg,
                };
                match msg {
                    Message::Text(text) => {
                        ctx.keepalive.activity(ep.conn_id);
                        ep.handle_frame(&text).await;
                    }
                    Message::Ping(_) => {
                        ctx.keepalive.activity(ep.conn_id);
                        ep.counters.ping_received.fetch_add(1, Ordering::Relaxed);
                        ep.send_pong();
                    }
                    Message::Pong(_) => {
                        ctx.keepalive.activity(ep.conn_id);
                        ep.counters.pong_received.fetch_add(1, Ordering::Relaxed);
                    }
                    Message::Binary(data) => {
                        ctx.keepalive.activity(ep.conn_id);
                        warn!(
                            callee = %ep.callee_id,
                            len = data.len(),
                            "unexpected binary frame"
                        );
                    }
                    Message::Close(_) => break,
                    Message::Frame(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attach_query() {
        let q = parse_attach_query("/ws?wsid=47639023704&callerId=Bob&name=Bob%20X").unwrap();
        assert_eq!(q.ticket.value(), 47639023704);
        assert_eq!(q.caller_id, "bob");
        assert_eq!(q.caller_name, "Bob X");
    }

    #[test]
    fn test_parse_attach_query_requires_nonzero_wsid() {
        assert!(parse_attach_query("/ws").is_none());
        assert!(parse_attach_query("/ws?wsid=0").is_none());
        assert!(parse_attach_query("/ws?wsid=abc").is_none());
        assert!(parse_attach_query("/ws?callerId=bob").is_none());
    }

    #[test]
    fn test_parse_attach_query_optional_fields_default_empty() {
        let q = parse_attach_query("/ws?wsid=7").unwrap();
        assert_eq!(q.caller_id, "");
        assert_eq!(q.caller_name, "");
    }

    #[test]
    fn test_determine_role_orders_callee_first() {
        let state = HubState::default();
        assert_eq!(determine_role(&state), AttachRole::Callee);
    }

    #[tokio::test]
    async fn test_determine_role_progression() {
        let env = crate::testutil::TestEnv::new();
        let (hub, _callee, _rx) = env.attach_callee("alice").await;
        assert_eq!(determine_role(&*hub.state.read().await), AttachRole::Caller);

        let (_caller, _crx) = env.insert_caller(&hub, "bob", "Bob").await;
        // a second caller upgrade succeeds at the transport layer but is
        // never bound
        assert_eq!(determine_role(&*hub.state.read().await), AttachRole::Unbound);
    }

    #[test]
    fn test_load_certs_missing_file() {
        let err = load_certs(Path::new("/nonexistent/tls.pem")).unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
    }
}
