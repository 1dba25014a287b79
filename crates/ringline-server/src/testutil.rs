//! Shared fixtures for the hub and registry tests: a registry wired to
//! temp-file stores, plus endpoint builders that stand in for upgraded
//! sockets. The outbound receiver of each endpoint doubles as the
//! "client": whatever the server writes shows up there.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;

use ringline_shared::types::{CalleeId, GlobalCalleeId, Role};
use ringline_store::models::buckets;
use ringline_store::{KvStore, UserRecord};

use crate::config::{RuntimeConfig, SharedConfig};
use crate::endpoint::{EndpointParams, Outbound, SignalingEndpoint};
use crate::hub::Hub;
use crate::ledger::CallLedger;
use crate::registry::{HubRegistry, PendingAttach, SharedServices};
use crate::request_rate::RequestRate;

pub const REG_START: i64 = 1000;

pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub registry: Arc<HubRegistry>,
    pub kv_main: Arc<KvStore>,
    pub kv_calls: Arc<KvStore>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let kv_main = Arc::new(KvStore::open_at("main", &dir.path().join("main.db")).unwrap());
        kv_main.create_bucket(buckets::USER_DATA).unwrap();
        let kv_calls = Arc::new(KvStore::open_at("calls", &dir.path().join("calls.db")).unwrap());
        kv_calls.create_bucket(buckets::WAITING_CALLERS).unwrap();
        kv_calls.create_bucket(buckets::MISSED_CALLS).unwrap();

        let ledger = Arc::new(CallLedger::new(kv_main.clone(), kv_calls.clone(), dir.path()));
        let runtime: SharedConfig = Arc::new(RwLock::new(RuntimeConfig::default()));
        let services = Arc::new(SharedServices {
            runtime,
            ledger,
            rate: Arc::new(RequestRate::default()),
        });
        let registry = HubRegistry::new(services);

        Self {
            dir,
            registry,
            kv_main,
            kv_calls,
        }
    }

    pub fn services(&self) -> &Arc<SharedServices> {
        self.registry.services()
    }

    /// Simulate the HTTP login collaborator: seed the user record and
    /// register a pending attach, then consume it the way the upgrade
    /// path would.
    pub async fn login(&self, name: &str) -> PendingAttach {
        let callee = CalleeId::new(name);
        let user = UserRecord {
            store_missed_calls: true,
            ..Default::default()
        };
        self.kv_main
            .put(buckets::USER_DATA, &callee.user_key(REG_START), &user, true)
            .unwrap();

        let ticket = self
            .registry
            .register_ticket(callee, "1.0", REG_START, user)
            .await;
        self.registry
            .claim_ticket(ticket.value())
            .await
            .expect("fresh ticket must claim")
    }

    /// Login plus callee attach; the endpoint is online and bound.
    pub async fn attach_callee(
        &self,
        name: &str,
    ) -> (
        Arc<Hub>,
        Arc<SignalingEndpoint>,
        UnboundedReceiver<Outbound>,
    ) {
        let pending = self.login(name).await;
        let hub = pending.hub.clone();
        let (ep, rx) = SignalingEndpoint::new(EndpointParams {
            role: Role::Callee,
            hub: Arc::downgrade(&hub),
            callee_id: pending.callee_id.clone(),
            global_id: pending.global_id.clone(),
            remote_addr: "10.0.0.1:40001".into(),
            user_agent: "callee-ua".into(),
            client_version: pending.client_version.clone(),
            caller_id: String::new(),
            caller_name: String::new(),
            conn_type: "serveWs",
        });
        hub.attach_callee(&ep, &pending).await;
        ep.set_online(true);
        (hub, ep, rx)
    }

    pub fn caller_endpoint(
        &self,
        hub: &Arc<Hub>,
        caller_id: &str,
        caller_name: &str,
    ) -> (Arc<SignalingEndpoint>, UnboundedReceiver<Outbound>) {
        let (ep, rx) = SignalingEndpoint::new(EndpointParams {
            role: Role::Caller,
            hub: Arc::downgrade(hub),
            callee_id: hub.callee_id.clone(),
            global_id: hub.global_id.clone(),
            remote_addr: "20.0.0.2:50002".into(),
            user_agent: "caller-ua".into(),
            client_version: String::new(),
            caller_id: caller_id.into(),
            caller_name: caller_name.into(),
            conn_type: "serveWs",
        });
        ep.set_online(true);
        (ep, rx)
    }

    /// Caller attach through the real admission path (spawns the
    /// no-peer-con watchdog).
    pub async fn attach_caller(
        &self,
        hub: &Arc<Hub>,
        caller_id: &str,
        caller_name: &str,
    ) -> (Arc<SignalingEndpoint>, UnboundedReceiver<Outbound>) {
        let (ep, rx) = self.caller_endpoint(hub, caller_id, caller_name);
        hub.attach_caller(&ep).await;
        (ep, rx)
    }

    /// Put a caller straight into the slot, without the watchdog. Keeps
    /// timer-driven tests deterministic.
    pub async fn insert_caller(
        &self,
        hub: &Arc<Hub>,
        caller_id: &str,
        caller_name: &str,
    ) -> (Arc<SignalingEndpoint>, UnboundedReceiver<Outbound>) {
        let (ep, rx) = self.caller_endpoint(hub, caller_id, caller_name);
        hub.state.write().await.caller = Some(ep.clone());
        (ep, rx)
    }

    pub fn missed_calls(&self, callee: &str) -> Vec<ringline_shared::types::CallerInfo> {
        self.kv_calls
            .get(buckets::MISSED_CALLS, CalleeId::new(callee).as_str())
            .unwrap_or_default()
    }

    pub fn global(&self, name: &str) -> GlobalCalleeId {
        GlobalCalleeId::single(&CalleeId::new(name))
    }
}

/// Pull every queued TEXT frame off an endpoint receiver.
pub fn drain_text(rx: &mut UnboundedReceiver<Outbound>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Outbound::Text(text) = frame {
            out.push(text);
        }
    }
    out
}

/// True when the receiver holds a queued Close frame.
pub fn saw_close(rx: &mut UnboundedReceiver<Outbound>) -> bool {
    let mut saw = false;
    while let Ok(frame) = rx.try_recv() {
        if frame == Outbound::Close {
            saw = true;
        }
    }
    saw
}
