//! Process-wide hub map, pending-attach records, and the small side
//! tables the external collaborators read: stored caller IPs (TURN
//! authorization), the hidden-state mirror, and the waiting-caller
//! release channels for the front-end long poll.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use ringline_shared::constants::VACANT_HUB_GRACE_SECS;
use ringline_shared::types::{AttachTicket, CalleeId, GlobalCalleeId};
use ringline_store::UserRecord;

use crate::config::SharedConfig;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::ledger::CallLedger;
use crate::request_rate::RequestRate;

/// Services every hub needs a handle to.
pub struct SharedServices {
    pub runtime: SharedConfig,
    pub ledger: Arc<CallLedger>,
    pub rate: Arc<RequestRate>,
}

/// Registered at HTTP login, consumed by the matching WebSocket attach.
pub struct PendingAttach {
    pub ticket: AttachTicket,
    pub callee_id: CalleeId,
    pub global_id: GlobalCalleeId,
    pub client_version: String,
    pub registration_start_time: i64,
    /// Profile snapshot taken at login.
    pub user: UserRecord,
    pub hub: Arc<Hub>,
    pub remove_flag: bool,
}

pub struct HubRegistry {
    services: Arc<SharedServices>,
    /// For hub back-references and eviction tasks.
    self_weak: std::sync::Weak<HubRegistry>,
    hubs: RwLock<HashMap<GlobalCalleeId, Arc<Hub>>>,
    tickets: RwLock<HashMap<u64, PendingAttach>>,
    caller_ips: RwLock<HashMap<GlobalCalleeId, String>>,
    hidden: RwLock<HashMap<CalleeId, bool>>,
    waiting_chans: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl HubRegistry {
    pub fn new(services: Arc<SharedServices>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            services,
            self_weak: self_weak.clone(),
            hubs: RwLock::new(HashMap::new()),
            tickets: RwLock::new(HashMap::new()),
            caller_ips: RwLock::new(HashMap::new()),
            hidden: RwLock::new(HashMap::new()),
            waiting_chans: Mutex::new(HashMap::new()),
        })
    }

    pub fn services(&self) -> &Arc<SharedServices> {
        &self.services
    }

    // --- login / attach ---------------------------------------------------

    /// Entry point for the HTTP login collaborator: create (or reuse) the
    /// hub for this identity and register a pending-attach record. The
    /// returned ticket goes into the client's attach URL.
    pub async fn register_ticket(
        &self,
        callee_id: CalleeId,
        client_version: &str,
        registration_start_time: i64,
        user: UserRecord,
    ) -> AttachTicket {
        let ticket = AttachTicket::generate();

        let global_id = {
            let runtime = self.services.runtime.read().await;
            if runtime.is_multi_callee(callee_id.as_str()) {
                GlobalCalleeId::multi(&callee_id, ticket)
            } else {
                GlobalCalleeId::single(&callee_id)
            }
        };

        let hub = {
            let mut hubs = self.hubs.write().await;
            hubs.entry(global_id.clone())
                .or_insert_with(|| {
                    Hub::new(
                        callee_id.clone(),
                        global_id.clone(),
                        self.self_weak.clone(),
                        self.services.clone(),
                    )
                })
                .clone()
        };

        let pending = PendingAttach {
            ticket,
            callee_id: callee_id.clone(),
            global_id,
            client_version: client_version.to_string(),
            registration_start_time,
            user,
            hub,
            remove_flag: false,
        };
        self.tickets.write().await.insert(ticket.value(), pending);

        debug!(callee = %callee_id, ticket = ticket.value(), "pending attach registered");
        ticket
    }

    /// Consume the pending-attach record for `ticket`. Returns `None` for
    /// unknown tickets and for tickets a cleanup path has already
    /// flagged.
    pub async fn claim_ticket(&self, ticket: u64) -> Option<PendingAttach> {
        let mut tickets = self.tickets.write().await;
        let pending = tickets.remove(&ticket)?;
        if pending.remove_flag {
            debug!(ticket, "claim of an invalidated ticket");
            return None;
        }
        Some(pending)
    }

    /// Cleanup path: mark a not-yet-consumed ticket invalid.
    pub async fn invalidate_ticket(&self, ticket: u64) {
        if let Some(pending) = self.tickets.write().await.get_mut(&ticket) {
            pending.remove_flag = true;
        }
    }

    pub async fn pending_ticket_count(&self) -> usize {
        self.tickets.read().await.len()
    }

    // --- hub lookup and eviction -----------------------------------------

    pub async fn get_hub(&self, global_id: &GlobalCalleeId) -> Option<Arc<Hub>> {
        self.hubs.read().await.get(global_id).cloned()
    }

    pub async fn hub_count(&self) -> usize {
        self.hubs.read().await.len()
    }

    /// Remove the hub if its callee slot is still empty. Returns whether
    /// an eviction happened.
    pub async fn evict_if_vacant(&self, global_id: &GlobalCalleeId) -> bool {
        let hub = {
            let hubs = self.hubs.read().await;
            match hubs.get(global_id) {
                Some(hub) => hub.clone(),
                None => return false,
            }
        };
        if !hub.is_vacant().await {
            return false;
        }

        let mut hubs = self.hubs.write().await;
        // re-check under the write lock; a reattach may have won the race
        if !hub.is_vacant().await {
            return false;
        }
        hubs.remove(global_id);
        drop(hubs);

        self.caller_ips.write().await.remove(global_id);
        self.hidden.write().await.remove(&hub.callee_id);
        info!(callee = %global_id, "vacant hub evicted");
        true
    }

    /// Grace-interval eviction after a callee disconnect.
    pub fn schedule_evict(&self, global_id: &GlobalCalleeId) {
        let registry = self.self_weak.clone();
        let global_id = global_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(VACANT_HUB_GRACE_SECS)).await;
            if let Some(registry) = registry.upgrade() {
                registry.evict_if_vacant(&global_id).await;
            }
        });
    }

    // --- caller IPs for the TURN authorization hook ----------------------

    /// Record (or with an empty `addr`, clear) the current caller address
    /// of a hub. Fails with a key-not-found when the callee has already
    /// signed off. With `overwrite_only` set, an absent entry is left
    /// absent.
    pub async fn store_caller_ip(
        &self,
        global_id: &GlobalCalleeId,
        addr: &str,
        overwrite_only: bool,
    ) -> Result<(), ServerError> {
        if !self.hubs.read().await.contains_key(global_id) {
            return Err(ServerError::KeyNotFound(global_id.to_string()));
        }

        let mut caller_ips = self.caller_ips.write().await;
        if overwrite_only && !caller_ips.contains_key(global_id) {
            return Ok(());
        }
        if addr.is_empty() {
            caller_ips.remove(global_id);
        } else {
            caller_ips.insert(global_id.clone(), addr.to_string());
        }
        Ok(())
    }

    /// Clear wrapper that swallows the expected signed-off case.
    pub async fn clear_caller_ip(&self, global_id: &GlobalCalleeId) {
        match self.store_caller_ip(global_id, "", false).await {
            Ok(()) => {}
            Err(e) if e.is_key_not_found() => {}
            Err(e) => {
                warn!(callee = %global_id, error = %e, "failed to clear caller ip");
            }
        }
    }

    pub async fn caller_ip(&self, global_id: &GlobalCalleeId) -> Option<String> {
        self.caller_ips.read().await.get(global_id).cloned()
    }

    // --- hidden-state mirror ---------------------------------------------

    pub async fn set_callee_hidden(&self, callee_id: &CalleeId, hidden: bool) {
        self.hidden.write().await.insert(callee_id.clone(), hidden);
    }

    pub async fn is_callee_hidden(&self, callee_id: &CalleeId) -> bool {
        self.hidden.read().await.get(callee_id).copied().unwrap_or(false)
    }

    // --- waiting-caller long-poll release channels -----------------------

    /// The front-end parks a caller here while it rings a busy callee.
    pub async fn register_waiting_caller(&self, addr_port: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiting_chans
            .lock()
            .await
            .insert(addr_port.to_string(), tx);
        rx
    }

    /// `pickupWaitingCaller|<addrPort>` from the callee releases the
    /// parked request. Returns whether a channel was waiting.
    pub async fn release_waiting_caller(&self, addr_port: &str) -> bool {
        let tx = self.waiting_chans.lock().await.remove(addr_port);
        match tx {
            Some(tx) => tx.send(()).is_ok(),
            None => {
                debug!(caller = addr_port, "no waiting caller to release");
                false
            }
        }
    }

    // --- statistics -------------------------------------------------------

    /// `(callees, callers)` currently online in this process.
    pub async fn online_callee_count(&self, include_hidden: bool) -> (i64, i64) {
        let hubs: Vec<Arc<Hub>> = self.hubs.read().await.values().cloned().collect();
        let mut callees = 0;
        let mut callers = 0;
        for hub in hubs {
            let snap = hub.snapshot().await;
            if !snap.has_callee {
                continue;
            }
            if snap.is_callee_hidden && !include_hidden {
                continue;
            }
            callees += 1;
            if snap.has_caller {
                callers += 1;
            }
        }
        (callees, callers)
    }

    /// Counts for the periodic stats line: online callees, active calls,
    /// and active pure-P2P calls.
    pub async fn call_stats(&self) -> (i64, i64, i64) {
        let hubs: Vec<Arc<Hub>> = self.hubs.read().await.values().cloned().collect();
        let mut callees = 0;
        let mut active_calls = 0;
        let mut pure_p2p = 0;
        for hub in hubs {
            let snap = hub.snapshot().await;
            callees += 1;
            if snap.in_call && snap.has_caller {
                active_calls += 1;
                if snap.pure_p2p {
                    pure_p2p += 1;
                }
            }
        }
        (callees, active_calls, pure_p2p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{TestEnv, REG_START};
    use ringline_shared::types::CalleeId;

    #[tokio::test]
    async fn test_ticket_is_single_use() {
        let env = TestEnv::new();
        let callee = CalleeId::new("alice");
        let ticket = env
            .registry
            .register_ticket(callee, "1.0", REG_START, UserRecord::default())
            .await;

        assert!(env.registry.claim_ticket(ticket.value()).await.is_some());
        assert!(env.registry.claim_ticket(ticket.value()).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidated_ticket_cannot_attach() {
        let env = TestEnv::new();
        let callee = CalleeId::new("alice");
        let ticket = env
            .registry
            .register_ticket(callee, "1.0", REG_START, UserRecord::default())
            .await;

        env.registry.invalidate_ticket(ticket.value()).await;
        assert!(env.registry.claim_ticket(ticket.value()).await.is_none());
        assert_eq!(env.registry.pending_ticket_count().await, 0);
    }

    #[tokio::test]
    async fn test_one_hub_per_global_id() {
        let env = TestEnv::new();
        let a = env.login("alice").await;
        let b = env.login("alice").await;

        assert!(Arc::ptr_eq(&a.hub, &b.hub));
        assert_eq!(env.registry.hub_count().await, 1);
    }

    #[tokio::test]
    async fn test_multi_callee_gets_distinct_hubs() {
        let env = TestEnv::new();
        env.services().runtime.write().await.multi_callees = "kiosk".into();

        let a = env.login("kiosk").await;
        let b = env.login("kiosk").await;

        assert!(!Arc::ptr_eq(&a.hub, &b.hub));
        assert_eq!(env.registry.hub_count().await, 2);
        assert_ne!(a.global_id, b.global_id);
    }

    #[tokio::test]
    async fn test_store_caller_ip_requires_live_hub() {
        let env = TestEnv::new();
        let ghost = env.global("nobody");
        let err = env
            .registry
            .store_caller_ip(&ghost, "1.1.1.1:1", false)
            .await
            .unwrap_err();
        assert!(err.is_key_not_found());

        let _pending = env.login("alice").await;
        let global = env.global("alice");
        env.registry
            .store_caller_ip(&global, "1.1.1.1:1", false)
            .await
            .unwrap();
        assert_eq!(
            env.registry.caller_ip(&global).await.as_deref(),
            Some("1.1.1.1:1")
        );

        // empty addr clears
        env.registry.store_caller_ip(&global, "", false).await.unwrap();
        assert!(env.registry.caller_ip(&global).await.is_none());
    }

    #[tokio::test]
    async fn test_store_caller_ip_overwrite_only() {
        let env = TestEnv::new();
        let _pending = env.login("alice").await;
        let global = env.global("alice");

        // no entry yet: overwrite-only is a no-op
        env.registry
            .store_caller_ip(&global, "2.2.2.2:2", true)
            .await
            .unwrap();
        assert!(env.registry.caller_ip(&global).await.is_none());

        env.registry
            .store_caller_ip(&global, "2.2.2.2:2", false)
            .await
            .unwrap();
        env.registry
            .store_caller_ip(&global, "3.3.3.3:3", true)
            .await
            .unwrap();
        assert_eq!(
            env.registry.caller_ip(&global).await.as_deref(),
            Some("3.3.3.3:3")
        );
    }

    #[tokio::test]
    async fn test_hidden_mirror() {
        let env = TestEnv::new();
        let callee = CalleeId::new("alice");
        assert!(!env.registry.is_callee_hidden(&callee).await);
        env.registry.set_callee_hidden(&callee, true).await;
        assert!(env.registry.is_callee_hidden(&callee).await);
    }

    #[tokio::test]
    async fn test_waiting_caller_release() {
        let env = TestEnv::new();
        let rx = env.registry.register_waiting_caller("9.9.9.9:9").await;
        assert!(env.registry.release_waiting_caller("9.9.9.9:9").await);
        rx.await.unwrap();

        // releasing an unknown caller reports false
        assert!(!env.registry.release_waiting_caller("9.9.9.9:9").await);
    }

    #[tokio::test]
    async fn test_evict_only_vacant_hubs() {
        let env = TestEnv::new();
        let (hub, callee, _rx) = env.attach_callee("alice").await;
        let global = env.global("alice");

        // occupied: not evicted
        assert!(!env.registry.evict_if_vacant(&global).await);
        assert_eq!(env.registry.hub_count().await, 1);

        hub.unregister(&callee, "OnClose").await;
        assert!(env.registry.evict_if_vacant(&global).await);
        assert_eq!(env.registry.hub_count().await, 0);
        assert!(env.registry.get_hub(&global).await.is_none());
    }

    #[tokio::test]
    async fn test_online_counts_respect_hidden() {
        let env = TestEnv::new();
        let (hub_a, callee_a, _rx_a) = env.attach_callee("alice").await;
        let (_hub_b, _callee_b, _rx_b) = env.attach_callee("bob").await;
        let (_caller, _crx) = env.attach_caller(&hub_a, "carol", "Carol").await;
        callee_a.handle_frame("calleeHidden|true").await;

        let (visible, callers) = env.registry.online_callee_count(false).await;
        assert_eq!(visible, 1);
        assert_eq!(callers, 0);

        let (all, callers) = env.registry.online_callee_count(true).await;
        assert_eq!(all, 2);
        assert_eq!(callers, 1);
    }

    #[tokio::test]
    async fn test_call_stats_counts_active_calls() {
        let env = TestEnv::new();
        let (hub, callee, _rx) = env.attach_callee("alice").await;
        let (caller, _crx) = env.attach_caller(&hub, "bob", "Bob").await;
        callee.handle_frame("log|callee Incoming p2p/p2p").await;
        callee.handle_frame("pickup|answer").await;
        let _ = caller;

        let (callees, active, pure_p2p) = env.registry.call_stats().await;
        assert_eq!(callees, 1);
        assert_eq!(active, 1);
        assert_eq!(pure_p2p, 1);
    }
}
