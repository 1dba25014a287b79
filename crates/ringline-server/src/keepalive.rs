//! Keep-alive for thousands of idle signaling sockets.
//!
//! Browser clients never ping, and mobile clients on power-savers send
//! nothing either, so liveness is entirely server-driven: when a socket
//! has been silent for `PING_PERIOD_SECS` we send a PING and arm a read
//! deadline; any inbound frame (data, PING, PONG) pushes the next ping
//! out again and clears the deadline. A socket that stays silent past the
//! deadline is closed. One scanner task covers all sockets at a 2 s
//! granularity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use ringline_shared::constants::{KEEPALIVE_SCAN_SECS, PING_PERIOD_SECS, PONG_WAIT_SECS};

use crate::endpoint::SignalingEndpoint;

struct Entry {
    endpoint: Weak<SignalingEndpoint>,
    next_ping_at: Instant,
    read_deadline: Option<Instant>,
}

#[derive(Default)]
pub struct KeepAliveMgr {
    clients: RwLock<HashMap<Uuid, Entry>>,
}

impl KeepAliveMgr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a freshly upgraded socket. The first ping is due one
    /// full period from now.
    pub fn add(&self, ep: &Arc<SignalingEndpoint>) {
        let mut clients = self.clients.write().expect("keepalive lock");
        clients.insert(
            ep.conn_id,
            Entry {
                endpoint: Arc::downgrade(ep),
                next_ping_at: Instant::now() + Duration::from_secs(PING_PERIOD_SECS),
                read_deadline: None,
            },
        );
    }

    pub fn remove(&self, conn_id: Uuid) {
        self.clients.write().expect("keepalive lock").remove(&conn_id);
    }

    /// Any inbound event: postpone the next ping and clear the read
    /// deadline.
    pub fn activity(&self, conn_id: Uuid) {
        let mut clients = self.clients.write().expect("keepalive lock");
        if let Some(entry) = clients.get_mut(&conn_id) {
            entry.next_ping_at = Instant::now() + Duration::from_secs(PING_PERIOD_SECS);
            entry.read_deadline = None;
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().expect("keepalive lock").len()
    }

    /// Scanner loop. Exits when the shutdown flag flips.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(KEEPALIVE_SCAN_SECS));
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Acquire) {
                info!("keepalive scanner stopping");
                break;
            }
            self.scan(Instant::now());
        }
    }

    /// One pass over all sockets. Sends pings where due and closes
    /// sockets whose read deadline has passed. Socket operations happen
    /// after the lock is released.
    pub fn scan(&self, now: Instant) {
        enum Action {
            Ping(Arc<SignalingEndpoint>),
            Expire(Arc<SignalingEndpoint>),
            Forget(Uuid),
        }

        let mut actions = Vec::new();
        {
            let mut clients = self.clients.write().expect("keepalive lock");
            for (conn_id, entry) in clients.iter_mut() {
                let Some(ep) = entry.endpoint.upgrade() else {
                    actions.push(Action::Forget(*conn_id));
                    continue;
                };
                if let Some(deadline) = entry.read_deadline {
                    if now >= deadline {
                        actions.push(Action::Expire(ep));
                        continue;
                    }
                }
                if now >= entry.next_ping_at {
                    entry.next_ping_at = now + Duration::from_secs(PING_PERIOD_SECS);
                    entry.read_deadline = Some(now + Duration::from_secs(PONG_WAIT_SECS));
                    actions.push(Action::Ping(ep));
                }
            }
        }

        for action in actions {
            match action {
                Action::Ping(ep) => {
                    debug!(callee = %ep.callee_id, "sendPing");
                    ep.send_ping();
                }
                Action::Expire(ep) => {
                    info!(
                        callee = %ep.callee_id,
                        addr = %ep.remote_addr,
                        "no response to ping, closing"
                    );
                    ep.close("ping timeout");
                    self.remove(ep.conn_id);
                }
                Action::Forget(conn_id) => {
                    self.remove(conn_id);
                }
            }
        }
    }
}
