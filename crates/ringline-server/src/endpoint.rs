//! One WebSocket signaling connection.
//!
//! A [`SignalingEndpoint`] is created at upgrade and dropped at close. It
//! holds a non-owning handle to its hub; the hub owns the endpoint for the
//! duration of the attachment. All transition flags are atomics so that
//! watchdog tasks and the keep-alive scanner can read them without ever
//! touching the hub lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ringline_shared::protocol::{parse_frame, sanitize_text_msg, Command, PeerReport};
use ringline_shared::types::{CalleeId, CallerInfo, GlobalCalleeId, Role};

use crate::error::ServerError;
use crate::hub::Hub;
use crate::util::now_secs;

/// Frames queued for the per-socket writer task. The queue is the write
/// serialization point: everything sent through it leaves the socket in
/// FIFO order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Pong,
    Close,
}

#[derive(Debug, Default)]
pub struct PingCounters {
    pub ping_sent: AtomicU64,
    pub pong_received: AtomicU64,
    pub ping_received: AtomicU64,
    pub pong_sent: AtomicU64,
}

pub struct SignalingEndpoint {
    pub conn_id: Uuid,
    pub role: Role,
    pub callee_id: CalleeId,
    pub global_id: GlobalCalleeId,
    /// `ip:port` of the remote, reverse-proxy aware.
    pub remote_addr: String,
    /// Remote IP without the port.
    pub remote_ip: String,
    pub user_agent: String,
    pub client_version: String,
    /// For caller-role connections: the caller's own id and display name
    /// from the attach query string.
    pub caller_id: String,
    pub caller_name: String,
    /// "serveWs" or "serveWss"; used in log lines only.
    pub conn_type: &'static str,

    hub: Weak<Hub>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Wakes the reader loop so a server-side close tears the connection
    /// down promptly.
    close_notify: Notify,

    is_online: AtomicBool,
    is_connected_to_peer: AtomicBool,
    is_media_connected_to_peer: AtomicBool,
    pickup_sent: AtomicBool,
    callee_init_received: AtomicBool,
    caller_offer_forwarded: AtomicBool,
    clear_on_close_done: AtomicBool,

    /// Text left by the caller via `msg|`; consumed when a missed call is
    /// recorded. Lives on the callee endpoint.
    caller_text_msg: Mutex<String>,

    pub counters: PingCounters,
}

pub struct EndpointParams {
    pub role: Role,
    pub hub: Weak<Hub>,
    pub callee_id: CalleeId,
    pub global_id: GlobalCalleeId,
    pub remote_addr: String,
    pub user_agent: String,
    pub client_version: String,
    pub caller_id: String,
    pub caller_name: String,
    pub conn_type: &'static str,
}

impl SignalingEndpoint {
    pub fn new(params: EndpointParams) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote_ip = params
            .remote_addr
            .rsplit_once(':')
            .map(|(ip, _)| ip.to_string())
            .unwrap_or_else(|| params.remote_addr.clone());
        let ep = std::sync::Arc::new(Self {
            conn_id: Uuid::new_v4(),
            role: params.role,
            callee_id: params.callee_id,
            global_id: params.global_id,
            remote_addr: params.remote_addr,
            remote_ip,
            user_agent: params.user_agent,
            client_version: params.client_version,
            caller_id: params.caller_id,
            caller_name: params.caller_name,
            conn_type: params.conn_type,
            hub: params.hub,
            outbound: tx,
            close_notify: Notify::new(),
            is_online: AtomicBool::new(false),
            is_connected_to_peer: AtomicBool::new(false),
            is_media_connected_to_peer: AtomicBool::new(false),
            pickup_sent: AtomicBool::new(false),
            callee_init_received: AtomicBool::new(false),
            caller_offer_forwarded: AtomicBool::new(false),
            clear_on_close_done: AtomicBool::new(false),
            caller_text_msg: Mutex::new(String::new()),
            counters: PingCounters::default(),
        });
        (ep, rx)
    }

    pub fn hub(&self) -> Option<std::sync::Arc<Hub>> {
        self.hub.upgrade()
    }

    // --- atomic flags -----------------------------------------------------

    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, v: bool) {
        self.is_online.store(v, Ordering::Release);
    }

    pub fn is_connected_to_peer(&self) -> bool {
        self.is_connected_to_peer.load(Ordering::Acquire)
    }

    pub fn set_connected_to_peer(&self, v: bool) {
        self.is_connected_to_peer.store(v, Ordering::Release);
    }

    pub fn is_media_connected_to_peer(&self) -> bool {
        self.is_media_connected_to_peer.load(Ordering::Acquire)
    }

    pub fn set_media_connected_to_peer(&self, v: bool) {
        self.is_media_connected_to_peer.store(v, Ordering::Release);
    }

    pub fn pickup_sent(&self) -> bool {
        self.pickup_sent.load(Ordering::Acquire)
    }

    pub fn set_pickup_sent(&self, v: bool) {
        self.pickup_sent.store(v, Ordering::Release);
    }

    pub fn callee_init_received(&self) -> bool {
        self.callee_init_received.load(Ordering::Acquire)
    }

    pub fn set_callee_init_received(&self, v: bool) {
        self.callee_init_received.store(v, Ordering::Release);
    }

    pub fn caller_offer_forwarded(&self) -> bool {
        self.caller_offer_forwarded.load(Ordering::Acquire)
    }

    pub fn set_caller_offer_forwarded(&self, v: bool) {
        self.caller_offer_forwarded.store(v, Ordering::Release);
    }

    /// Latches true; returns whether this call did the latching. Guards
    /// the close-time bookkeeping against running twice.
    pub fn claim_clear_on_close(&self) -> bool {
        !self.clear_on_close_done.swap(true, Ordering::AcqRel)
    }

    pub fn reset_clear_on_close(&self) {
        self.clear_on_close_done.store(false, Ordering::Release);
    }

    pub fn caller_text_msg(&self) -> String {
        self.caller_text_msg.lock().expect("text msg mutex").clone()
    }

    pub fn set_caller_text_msg(&self, text: &str) {
        *self.caller_text_msg.lock().expect("text msg mutex") = text.to_string();
    }

    // --- writing ----------------------------------------------------------

    /// Queue a TEXT frame. Fails with [`ServerError::WriteNotConnected`]
    /// once the endpoint has gone offline.
    pub fn write(&self, text: impl Into<String>) -> Result<(), ServerError> {
        if !self.is_online() {
            return Err(ServerError::WriteNotConnected);
        }
        self.outbound
            .send(Outbound::Text(text.into()))
            .map_err(|_| ServerError::WriteNotConnected)
    }

    pub fn send_ping(&self) {
        if self.outbound.send(Outbound::Ping).is_ok() {
            self.counters.ping_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn send_pong(&self) {
        if self.outbound.send(Outbound::Pong).is_ok() {
            self.counters.pong_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Close this connection from the server side. Safe to call more than
    /// once; the reader loop runs the actual teardown.
    pub fn close(&self, reason: &str) {
        if self.is_online() {
            debug!(
                callee = %self.global_id,
                role = %self.role,
                reason,
                "closing signaling socket"
            );
            let _ = self.outbound.send(Outbound::Close);
        }
        self.close_notify.notify_one();
    }

    pub async fn closed(&self) {
        self.close_notify.notified().await;
    }

    // --- inbound dispatch -------------------------------------------------

    /// Handle one inbound TEXT frame.
    pub async fn handle_frame(&self, raw: &str) {
        let frame = match parse_frame(raw) {
            Ok(f) => f,
            // malformed frame: drop, keep the socket
            Err(_) => return,
        };

        let Some(hub) = self.hub() else {
            warn!(
                callee = %self.callee_id,
                cmd = frame.cmd,
                "frame for an already-evicted hub"
            );
            return;
        };

        if hub.services().runtime.read().await.log_wanted("wsreceive") {
            info!(
                conn = self.conn_type,
                callee = %self.callee_id,
                from = %self.role,
                cmd = frame.cmd,
                len = raw.len(),
                "received"
            );
        }

        match Command::classify(frame.cmd) {
            Command::Init => {
                if !self.role.is_callee() {
                    // impersonation attempt: refuse, keep the socket
                    warn!(
                        callee = %self.callee_id,
                        addr = %self.remote_addr,
                        "deny init from non-callee"
                    );
                    let _ = self.write("cancel|busy");
                    return;
                }
                if self.callee_init_received() {
                    // only the first init counts
                    return;
                }
                hub.callee_init(self).await;
            }
            Command::Dummy => {
                info!(
                    callee = %self.callee_id,
                    payload = frame.payload,
                    addr = %self.remote_addr,
                    ua = %self.user_agent,
                    "dummy"
                );
            }
            Command::Msg => {
                let clean = sanitize_text_msg(frame.payload);
                hub.store_caller_text_msg(self, &clean).await;
            }
            Command::MissedCall => {
                info!(
                    callee = %self.callee_id,
                    text = frame.payload,
                    addr = %self.remote_addr,
                    "missedcall from client"
                );
                let info = CallerInfo {
                    addr_port: self.remote_addr.clone(),
                    caller_name: self.caller_name.clone(),
                    call_time: now_secs(),
                    caller_id: self.caller_id.clone(),
                    text_msg: sanitize_text_msg(frame.payload),
                };
                hub.record_missed_call(info, "cmd=missedcall").await;
            }
            Command::CallerOffer => {
                if self.role.is_callee() {
                    debug!(callee = %self.callee_id, "drop callerOffer from callee");
                    return;
                }
                if self.caller_offer_forwarded() {
                    // prevent double callerOffer
                    return;
                }
                hub.handle_caller_offer(self, raw).await;
            }
            Command::RtcConnect => {}
            Command::Cancel => {
                hub.handle_cancel(self, frame.payload).await;
            }
            Command::CalleeHidden => {
                if !self.role.is_callee() {
                    return;
                }
                hub.set_callee_hidden(frame.payload == "true").await;
            }
            Command::DialSoundsMuted => {
                if !self.role.is_callee() {
                    return;
                }
                hub.set_dial_sounds_muted(frame.payload == "true").await;
            }
            Command::PickupWaitingCaller => {
                if !self.role.is_callee() {
                    return;
                }
                hub.release_waiting_caller(frame.payload).await;
            }
            Command::DeleteMissedCall => {
                if !self.role.is_callee() {
                    return;
                }
                hub.delete_missed_call(self, frame.payload).await;
            }
            Command::Pickup => {
                if !self.role.is_callee() {
                    return;
                }
                if !self.is_connected_to_peer() {
                    debug!(
                        callee = %self.callee_id,
                        addr = %self.remote_addr,
                        "pickup ignored, no peer connect"
                    );
                    return;
                }
                if self.pickup_sent() {
                    // prevent sending pickup twice
                    return;
                }
                hub.handle_pickup(self, raw).await;
            }
            Command::Heartbeat => {}
            Command::Check => {
                let _ = self.write(format!("confirm|{}", frame.payload));
            }
            Command::Log => {
                let report = match PeerReport::parse(frame.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(callee = %self.callee_id, error = %e, "bad peer report");
                        return;
                    }
                };
                hub.handle_peer_report(self, report).await;
            }
            Command::ServerSent => {
                // reserved for server-to-client traffic; never forwarded
            }
            Command::Other => {
                if !frame.payload.is_empty() {
                    hub.forward_to_opposite(self, raw).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_endpoint(role: Role) -> (std::sync::Arc<SignalingEndpoint>, mpsc::UnboundedReceiver<Outbound>) {
        SignalingEndpoint::new(EndpointParams {
            role,
            hub: Weak::new(),
            callee_id: CalleeId::new("alice"),
            global_id: GlobalCalleeId::single(&CalleeId::new("alice")),
            remote_addr: "9.8.7.6:1234".into(),
            user_agent: "test-ua".into(),
            client_version: "1.0".into(),
            caller_id: String::new(),
            caller_name: String::new(),
            conn_type: "serveWs",
        })
    }

    #[test]
    fn test_write_requires_online() {
        let (ep, mut rx) = bare_endpoint(Role::Callee);
        assert!(matches!(
            ep.write("status|x"),
            Err(ServerError::WriteNotConnected)
        ));

        ep.set_online(true);
        ep.write("status|x").unwrap();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("status|x".into()));
    }

    #[test]
    fn test_writes_stay_fifo() {
        let (ep, mut rx) = bare_endpoint(Role::Callee);
        ep.set_online(true);
        ep.write("a|1").unwrap();
        ep.write("b|2").unwrap();
        ep.write("c|3").unwrap();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("a|1".into()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("b|2".into()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("c|3".into()));
    }

    #[test]
    fn test_remote_ip_strips_port() {
        let (ep, _rx) = bare_endpoint(Role::Caller);
        assert_eq!(ep.remote_ip, "9.8.7.6");
    }

    #[test]
    fn test_claim_clear_on_close_latches() {
        let (ep, _rx) = bare_endpoint(Role::Callee);
        assert!(ep.claim_clear_on_close());
        assert!(!ep.claim_clear_on_close());
        ep.reset_clear_on_close();
        assert!(ep.claim_clear_on_close());
    }

    #[tokio::test]
    async fn test_close_wakes_reader_and_queues_close_frame() {
        let (ep, mut rx) = bare_endpoint(Role::Caller);
        ep.set_online(true);
        ep.close("test");
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        // the stored permit means a later await returns immediately
        ep.closed().await;
    }

    #[tokio::test]
    async fn test_media_connected_implies_connected_is_callers_duty() {
        // the flag pair itself is independent; transitions couple them
        let (ep, _rx) = bare_endpoint(Role::Callee);
        ep.set_connected_to_peer(true);
        ep.set_media_connected_to_peer(true);
        assert!(ep.is_connected_to_peer());
        assert!(ep.is_media_connected_to_peer());
    }
}
