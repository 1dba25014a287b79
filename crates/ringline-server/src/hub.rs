//! Per-callee rendezvous.
//!
//! A hub pairs exactly one callee with at most one caller and drives the
//! session phases between them: attach, ring, pickup, peer connect, media
//! connect, teardown. The hub lock protects the slot pair and the
//! accounting fields; the per-endpoint transition flags are atomics and
//! are read lock-free by the watchdogs.
//!
//! The lock is never held across a socket write. Writes go through each
//! endpoint's outbound queue, but the discipline is kept anyway: snapshot
//! the endpoints, release, then send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use ringline_shared::constants::{NO_PEER_CON_SECS, POST_MEDIA_CLOSE_DELAY_MS};
use ringline_shared::protocol::{ConState, PeerReport};
use ringline_shared::types::{CalleeId, CallerInfo, GlobalCalleeId};

use crate::endpoint::SignalingEndpoint;
use crate::registry::{HubRegistry, PendingAttach, SharedServices};
use crate::timeout::TimeoutController;
use crate::util::now_secs;

/// Shown to both sides when a caller produced no peer connection within
/// the watchdog window. Must stay a single line without apostrophes.
const NO_PEER_CON_STATUS: &str = "status|Unable to establish a direct P2P connection. \
    This is likely a WebRTC issue with the browser or WebView on either side, \
    or a firewall issue.";

const RING_TIMEOUT_STATUS: &str = "status|Ring timeout, the call was not answered.";

#[derive(Default)]
pub struct HubState {
    pub callee: Option<Arc<SignalingEndpoint>>,
    pub caller: Option<Arc<SignalingEndpoint>>,
    pub is_callee_hidden: bool,
    /// Address for which a hidden callee is temporarily visible; set by
    /// the HTTP front-end.
    pub unhidden_for_caller_addr: String,
    pub ticket: u64,
    pub registration_start_time: i64,
    pub service_start_time: i64,
    /// Epoch seconds of the current pickup, 0 outside a call.
    pub last_call_start_time: i64,
    pub call_duration_secs: i64,
    /// Lifetime peer-connected seconds, mirrored from the user record.
    pub connected_to_peer_secs: i64,
    pub service_duration_secs: i64,
    pub local_p2p: bool,
    pub remote_p2p: bool,
    pub max_ring_secs: i64,
    pub max_talk_secs_if_no_p2p: i64,
}

pub struct Hub {
    pub callee_id: CalleeId,
    pub global_id: GlobalCalleeId,
    pub(crate) state: RwLock<HubState>,
    pub(crate) deadline: TimeoutController,
    pub callee_login: AtomicBool,
    /// Handed to deadline and watchdog tasks so they never keep the hub
    /// alive.
    self_weak: Weak<Hub>,
    registry: Weak<HubRegistry>,
    services: Arc<SharedServices>,
}

impl Hub {
    pub fn new(
        callee_id: CalleeId,
        global_id: GlobalCalleeId,
        registry: Weak<HubRegistry>,
        services: Arc<SharedServices>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            callee_id,
            global_id,
            state: RwLock::new(HubState::default()),
            deadline: TimeoutController::new(),
            callee_login: AtomicBool::new(false),
            self_weak: self_weak.clone(),
            registry,
            services,
        })
    }

    pub fn services(&self) -> &Arc<SharedServices> {
        &self.services
    }

    fn registry(&self) -> Option<Arc<HubRegistry>> {
        self.registry.upgrade()
    }

    // --- attach -----------------------------------------------------------

    /// Bind a freshly upgraded callee connection. Quota fields come from
    /// the pending-attach snapshot; ring/talk policy is assigned here.
    pub async fn attach_callee(&self, ep: &Arc<SignalingEndpoint>, pending: &PendingAttach) {
        let (free_talk_secs, ring_secs) = {
            let runtime = self.services.runtime.read().await;
            (runtime.free_account_talk_secs, crate::config::DEFAULT_RING_SECS)
        };

        let mut st = self.state.write().await;
        st.is_callee_hidden = pending.user.is_hidden();
        st.unhidden_for_caller_addr.clear();
        st.ticket = pending.ticket.value();
        st.callee = Some(ep.clone());
        st.caller = None;
        st.registration_start_time = pending.registration_start_time;
        st.service_start_time = if pending.registration_start_time > 0 {
            pending.registration_start_time
        } else {
            now_secs()
        };
        st.connected_to_peer_secs = pending.user.connected_to_peer_secs;
        st.call_duration_secs = 0;
        st.max_ring_secs = ring_secs;
        st.max_talk_secs_if_no_p2p =
            (free_talk_secs - pending.user.connected_to_peer_secs).max(0);
        let hidden = st.is_callee_hidden;
        drop(st);

        ep.set_callee_init_received(false);
        if let Some(registry) = self.registry() {
            registry.set_callee_hidden(&self.callee_id, hidden).await;
        }

        info!(
            conn = ep.conn_type,
            callee = %self.callee_id,
            ticket = pending.ticket.value(),
            addr = %ep.remote_addr,
            "callee conn"
        );
    }

    /// Bind a freshly upgraded caller connection and start the
    /// no-peer-con watchdog.
    pub async fn attach_caller(&self, ep: &Arc<SignalingEndpoint>) {
        {
            let mut st = self.state.write().await;
            st.call_duration_secs = 0;
            st.caller = Some(ep.clone());
        }
        ep.set_caller_offer_forwarded(false);

        info!(
            conn = ep.conn_type,
            callee = %self.callee_id,
            caller_id = %ep.caller_id,
            addr = %ep.remote_addr,
            "caller conn"
        );

        spawn_no_peer_con_watchdog(self.self_weak.clone(), Arc::downgrade(ep));
    }

    // --- callee init ------------------------------------------------------

    /// First `init|` from the attached callee: reset per-session state,
    /// deliver the client version, push waiting and missed calls.
    pub async fn callee_init(&self, ep: &SignalingEndpoint) {
        {
            let mut st = self.state.write().await;
            st.caller = None;
        }

        ep.set_callee_init_received(true);
        self.callee_login.store(true, Ordering::Release);
        ep.set_pickup_sent(false);
        ep.reset_clear_on_close();
        ep.set_caller_text_msg("");

        info!(
            conn = ep.conn_type,
            callee = %self.callee_id,
            addr = %ep.remote_addr,
            ver = %ep.client_version,
            "callee init"
        );

        let client_version = self.services.runtime.read().await.callee_client_version.clone();
        if ep.write(format!("sessionId|{}", client_version)).is_err() {
            return;
        }

        let (waiting, missed) = self.services.ledger.load_lists(&self.callee_id);
        if !waiting.is_empty() || !missed.is_empty() {
            debug!(
                callee = %self.callee_id,
                waiting = waiting.len(),
                missed = missed.len(),
                "pushing caller lists"
            );
            if let Ok(json) = serde_json::to_string(&waiting) {
                let _ = ep.write(format!("waitingCallers|{}", json));
            }
            if let Ok(json) = serde_json::to_string(&missed) {
                let _ = ep.write(format!("missedCalls|{}", json));
            }
        }
    }

    // --- ring -------------------------------------------------------------

    /// Forward the first `callerOffer` to the callee, exchange caller
    /// info and user agents, arm the ring deadline, and record the caller
    /// address for the TURN authorization hook.
    pub async fn handle_caller_offer(&self, ep: &SignalingEndpoint, raw: &str) {
        let st = self.state.read().await;
        let Some(callee) = st.callee.clone() else {
            warn!(callee = %self.callee_id, addr = %ep.remote_addr, "callerOffer without callee");
            return;
        };
        let Some(caller) = st.caller.clone() else {
            warn!(callee = %self.callee_id, "callerOffer without admitted caller");
            return;
        };
        if !std::ptr::eq(Arc::as_ptr(&caller), ep) {
            // a non-admitted second caller
            debug!(callee = %self.callee_id, addr = %ep.remote_addr, "drop offer from second caller");
            return;
        }
        let max_ring_secs = st.max_ring_secs;
        drop(st);

        info!(
            conn = ep.conn_type,
            callee = %self.callee_id,
            callee_addr = %callee.remote_addr,
            caller_addr = %ep.remote_addr,
            caller_id = %ep.caller_id,
            ua = %ep.user_agent,
            "CALL"
        );

        if callee.write(raw).is_err() {
            return;
        }
        ep.set_caller_offer_forwarded(true);

        if !ep.caller_id.is_empty() || !ep.caller_name.is_empty() {
            if callee
                .write(format!("callerInfo|{}:{}", ep.caller_id, ep.caller_name))
                .is_err()
            {
                return;
            }
        }

        // exchange user agents
        if ep.write(format!("ua|{}", callee.user_agent)).is_err() {
            return;
        }
        if callee.write(format!("ua|{}", ep.user_agent)).is_err() {
            return;
        }

        if max_ring_secs > 0 {
            // callee gets disconnected from the call if it does not pick
            // up in time
            self.set_deadline(max_ring_secs, "ring");
        }

        if let Some(registry) = self.registry() {
            match registry
                .store_caller_ip(&self.global_id, &ep.remote_addr, false)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_key_not_found() => {} // callee just signed off
                Err(e) => {
                    warn!(callee = %self.global_id, error = %e, "callerOffer: store caller ip");
                }
            }
        }
    }

    // --- pickup -----------------------------------------------------------

    pub async fn handle_pickup(&self, ep: &SignalingEndpoint, raw: &str) {
        {
            let mut st = self.state.write().await;
            st.last_call_start_time = now_secs();
        }
        info!(
            conn = ep.conn_type,
            callee = %self.callee_id,
            online = ep.is_online(),
            peer_con = ep.is_connected_to_peer(),
            "pickup"
        );

        let caller = self.state.read().await.caller.clone();
        if let Some(caller) = caller {
            let _ = caller.write(raw);
            ep.set_pickup_sent(true);
        }
        self.set_deadline(0, "pickup");
    }

    // --- cancel -----------------------------------------------------------

    pub async fn handle_cancel(&self, ep: &SignalingEndpoint, payload: &str) {
        let callee = self.state.read().await.callee.clone();
        let Some(callee) = callee else {
            // the callee is gone; close the stray sender
            ep.close("callee already closed");
            return;
        };

        if callee.is_connected_to_peer() {
            info!(
                conn = ep.conn_type,
                callee = %self.callee_id,
                from = %ep.role,
                addr = %ep.remote_addr,
                reason = payload,
                "DISCON"
            );
            self.peer_con_has_ended(&callee, "cancel").await;
        }
        // otherwise: already disconnected, ignore
    }

    // --- peer reports -----------------------------------------------------

    /// `log|<side> <constate> <local>/<remote>` from either side.
    pub async fn handle_peer_report(&self, ep: &SignalingEndpoint, report: PeerReport) {
        let st = self.state.read().await;
        let Some(caller) = st.caller.clone() else {
            drop(st);
            // caller disconnected right away, or was late and the callee
            // already peer-disconnected
            debug!(
                callee = %self.callee_id,
                from = %ep.role,
                "peer report without caller"
            );
            if let Some(registry) = self.registry() {
                registry.clear_caller_ip(&self.global_id).await;
            }
            return;
        };
        let Some(callee) = st.callee.clone() else {
            drop(st);
            debug!(callee = %self.callee_id, "peer report without callee");
            return;
        };
        drop(st);

        if !ep.role.is_callee() && !std::ptr::eq(Arc::as_ptr(&caller), ep) {
            debug!(callee = %self.callee_id, "drop peer report from second caller");
            return;
        }

        info!(
            conn = ep.conn_type,
            callee = %self.callee_id,
            from = %ep.role,
            constate = ?report.constate,
            callee_ip = %callee.remote_ip,
            caller_ip = %caller.remote_ip,
            "PEER"
        );

        // peer-connect, not yet full media-connect
        ep.set_connected_to_peer(true);
        if !ep.role.is_callee() {
            // a caller report implies the callee is peer-connected too
            callee.set_connected_to_peer(true);
        }

        {
            let mut st = self.state.write().await;
            st.local_p2p = report.local_mode.is_p2p();
            st.remote_p2p = report.remote_mode.is_p2p();
        }

        if !matches!(report.constate, ConState::Connected | ConState::ConForce) {
            return;
        }

        if ep.role.is_callee() {
            // callee reports media connected; may repeat, only the first
            // one counts
            if ep.is_media_connected_to_peer() {
                return;
            }
            ep.set_media_connected_to_peer(true);
            // media up implies peer-connected, even if the caller never
            // reported on its own
            caller.set_connected_to_peer(true);
            caller.set_media_connected_to_peer(true);

            self.services.rate.clear(&callee.remote_ip).await;
            self.services.rate.clear(&caller.remote_ip).await;

            let (max_talk, fully_p2p) = {
                let st = self.state.read().await;
                (st.max_talk_secs_if_no_p2p, st.local_p2p && st.remote_p2p)
            };
            if max_talk > 0 && !fully_p2p {
                // relayed session: talk time is capped
                self.set_deadline(max_talk, "peer con");
                self.broadcast(&format!("sessionDuration|{}", max_talk)).await;
            }
        } else if report.constate == ConState::ConForce {
            // test callers do not really connect p2p
            let _ = callee.write("callerConnect|");
        } else {
            // both peers are now directly connected; the signaling socket
            // of the caller is redundant from here on
            let (disconnect_callee, disconnect_caller) = {
                let runtime = self.services.runtime.read().await;
                (
                    runtime.disconnect_callees_when_peer_connected,
                    runtime.disconnect_callers_when_peer_connected,
                )
            };
            if disconnect_callee || disconnect_caller {
                tokio::time::sleep(Duration::from_millis(POST_MEDIA_CLOSE_DELAY_MS)).await;
            }
            if disconnect_callee {
                callee.close("disconnect callee on peer connect");
            }
            if disconnect_caller {
                caller.close("disconnect caller on peer connect");
            }
        }
    }

    // --- settings ---------------------------------------------------------

    pub async fn set_callee_hidden(&self, hidden: bool) {
        let registration_start_time = {
            let mut st = self.state.write().await;
            st.is_callee_hidden = hidden;
            st.unhidden_for_caller_addr.clear();
            st.registration_start_time
        };

        if let Some(registry) = self.registry() {
            registry.set_callee_hidden(&self.callee_id, hidden).await;
        }

        match self
            .services
            .ledger
            .update_user(&self.callee_id, registration_start_time, |user| {
                user.set_hidden(hidden)
            }) {
            Ok(user) => {
                info!(callee = %self.callee_id, hidden, int2 = user.int2, "set hidden");
            }
            Err(e) => {
                warn!(callee = %self.callee_id, error = %e, "failed to persist hidden flag");
            }
        }
    }

    pub async fn set_dial_sounds_muted(&self, muted: bool) {
        let registration_start_time = self.state.read().await.registration_start_time;
        match self
            .services
            .ledger
            .update_user(&self.callee_id, registration_start_time, |user| {
                user.set_dial_sounds_muted(muted)
            }) {
            Ok(user) => {
                info!(callee = %self.callee_id, muted, int2 = user.int2, "set dialSoundsMuted");
            }
            Err(e) => {
                warn!(callee = %self.callee_id, error = %e, "failed to persist dial sounds flag");
            }
        }
    }

    /// Make a hidden callee visible to one caller address; used by the
    /// HTTP front-end.
    pub async fn unhide_for_caller(&self, addr: &str) {
        let mut st = self.state.write().await;
        st.unhidden_for_caller_addr = addr.to_string();
    }

    // --- waiting / missed calls ------------------------------------------

    pub async fn release_waiting_caller(&self, addr_port: &str) {
        info!(callee = %self.callee_id, caller = addr_port, "pickupWaitingCaller");
        if let Some(registry) = self.registry() {
            registry.release_waiting_caller(addr_port).await;
        }
    }

    pub async fn delete_missed_call(&self, ep: &SignalingEndpoint, delete_key: &str) {
        let registration_start_time = self.state.read().await.registration_start_time;
        let Some(modified) = self.services.ledger.delete_missed_call(
            &self.callee_id,
            registration_start_time,
            delete_key,
        ) else {
            return;
        };
        if let Ok(json) = serde_json::to_string(&modified) {
            let _ = ep.write(format!("missedCalls|{}", json));
        }
    }

    /// `missedcall|` from a caller closing the page.
    pub async fn record_missed_call(&self, info: CallerInfo, cause: &str) {
        let registration_start_time = self.state.read().await.registration_start_time;
        self.services.ledger.add_missed_call(
            &self.callee_id,
            registration_start_time,
            info,
            cause,
        );
    }

    /// `msg|` text is kept on the callee endpoint until teardown turns it
    /// into part of a missed-call record.
    pub async fn store_caller_text_msg(&self, from: &SignalingEndpoint, clean: &str) {
        let callee = self.state.read().await.callee.clone();
        match callee {
            Some(callee) => {
                info!(
                    callee = %self.callee_id,
                    from = %from.remote_addr,
                    msg = clean,
                    "caller text msg"
                );
                callee.set_caller_text_msg(clean);
            }
            None => {
                warn!(callee = %self.callee_id, "msg but no callee attached");
            }
        }
    }

    // --- deadline ---------------------------------------------------------

    pub fn set_deadline(&self, secs: i64, cause: &str) {
        if secs <= 0 {
            self.deadline.disarm(cause);
        } else {
            self.deadline.arm(self.self_weak.clone(), secs, cause);
        }
    }

    /// Invoked by the deadline task.
    pub(crate) async fn deadline_fired(&self, cause: &str) {
        let callee = self.state.read().await.callee.clone();
        let Some(callee) = callee else {
            return;
        };
        info!(callee = %self.callee_id, cause, "deadline fired");

        // a confirmed ring that was never picked up is worth a
        // user-visible note on both sides
        if cause == "ring" && callee.is_connected_to_peer() && !callee.pickup_sent() {
            self.broadcast(RING_TIMEOUT_STATUS).await;
        }

        self.peer_con_has_ended(&callee, &format!("deadline {}", cause)).await;
    }

    // --- forwarding -------------------------------------------------------

    /// Send one frame to both sides; absent sides are skipped.
    pub async fn broadcast(&self, text: &str) {
        let (callee, caller) = {
            let st = self.state.read().await;
            (st.callee.clone(), st.caller.clone())
        };
        if let Some(callee) = callee {
            let _ = callee.write(text);
        }
        if let Some(caller) = caller {
            let _ = caller.write(text);
        }
    }

    /// Generic forwarding for non-reserved commands. Frames are dropped,
    /// never queued, when the opposite endpoint is absent.
    pub async fn forward_to_opposite(&self, ep: &SignalingEndpoint, raw: &str) {
        let (callee, caller) = {
            let st = self.state.read().await;
            (st.callee.clone(), st.caller.clone())
        };
        if ep.role.is_callee() {
            if let Some(caller) = caller {
                let _ = caller.write(raw);
            }
        } else {
            match caller {
                Some(caller) if std::ptr::eq(Arc::as_ptr(&caller), ep) => {
                    if let Some(callee) = callee {
                        let _ = callee.write(raw);
                    }
                }
                _ => {
                    debug!(callee = %self.callee_id, "drop forward from second caller");
                }
            }
        }
    }

    // --- teardown ---------------------------------------------------------

    /// Canonical teardown of a peer connection. Runs on the callee
    /// endpoint only; any caller-side invocation is a no-op.
    pub async fn peer_con_has_ended(&self, ep: &SignalingEndpoint, cause: &str) {
        if !ep.role.is_callee() {
            warn!(
                callee = %self.callee_id,
                cause,
                "peer_con_has_ended ignored for caller endpoint"
            );
            return;
        }

        self.set_deadline(0, cause);

        // talk-time accounting for the finished call
        let ended_call = {
            let mut st = self.state.write().await;
            if st.last_call_start_time > 0 {
                let duration = (now_secs() - st.last_call_start_time).max(0);
                st.call_duration_secs = duration;
                st.last_call_start_time = 0;
                Some((duration, st.registration_start_time))
            } else {
                None
            }
        };
        if let Some((duration, registration_start_time)) = ended_call {
            let total = self.services.ledger.record_call_end(
                &self.callee_id,
                registration_start_time,
                duration,
            );
            let mut st = self.state.write().await;
            st.connected_to_peer_secs = total;
        }

        // prepare for the next session
        ep.set_callee_init_received(false);

        if !ep.is_connected_to_peer() {
            return;
        }

        ep.set_connected_to_peer(false);
        ep.set_media_connected_to_peer(false);

        // clear both flags on the other side too, then snapshot what the
        // call-ended log line and the missed-call record need before the
        // caller slot is dropped
        let (dropped_caller, call_duration_secs, registration_start_time, local_p2p, remote_p2p) = {
            let mut st = self.state.write().await;
            if let Some(caller) = &st.caller {
                caller.set_connected_to_peer(false);
                caller.set_media_connected_to_peer(false);
            }
            (
                st.caller.take(),
                st.call_duration_secs,
                st.registration_start_time,
                st.local_p2p,
                st.remote_p2p,
            )
        };

        let caller_addr = dropped_caller
            .as_ref()
            .map(|c| c.remote_addr.clone())
            .unwrap_or_default();
        info!(
            conn = ep.conn_type,
            callee = %self.callee_id,
            call_secs = call_duration_secs,
            local = if local_p2p { "p2p" } else { "relay" },
            remote = if remote_p2p { "p2p" } else { "relay" },
            callee_addr = %ep.remote_addr,
            caller_addr = %caller_addr,
            cause,
            "PEER DISCON"
        );

        // a ring that never turned into a call becomes a missed call
        if call_duration_secs == 0 {
            if let Some(caller) = &dropped_caller {
                let info = CallerInfo {
                    addr_port: caller.remote_addr.clone(),
                    caller_name: caller.caller_name.clone(),
                    call_time: now_secs(),
                    caller_id: caller.caller_id.clone(),
                    text_msg: ep.caller_text_msg(),
                };
                self.services.ledger.add_missed_call(
                    &self.callee_id,
                    registration_start_time,
                    info,
                    cause,
                );
            }
        }

        if let Some(registry) = self.registry() {
            registry.clear_caller_ip(&self.global_id).await;
        }
    }

    /// Socket-close path. Clears the endpoint out of its slot; a callee
    /// close leaves the hub vacant and schedules its eviction.
    pub async fn unregister(&self, ep: &SignalingEndpoint, reason: &str) {
        if ep.role.is_callee() {
            if ep.claim_clear_on_close() {
                self.set_deadline(0, reason);
                let service_secs = {
                    let mut st = self.state.write().await;
                    if st.service_start_time > 0 {
                        st.service_duration_secs = now_secs() - st.service_start_time;
                    }
                    st.service_duration_secs
                };
                info!(
                    conn = ep.conn_type,
                    callee = %self.callee_id,
                    service_secs,
                    reason,
                    "callee logoff"
                );
            }

            {
                let mut st = self.state.write().await;
                let is_current = st
                    .callee
                    .as_ref()
                    .map(|c| std::ptr::eq(Arc::as_ptr(c), ep))
                    .unwrap_or(false);
                if is_current {
                    st.callee = None;
                    // a caller may never outlive its callee in the hub
                    st.caller = None;
                }
            }
            self.callee_login.store(false, Ordering::Release);

            if let Some(registry) = self.registry() {
                registry.schedule_evict(&self.global_id);
            }
        } else {
            // the caller slot is cleared by the teardown paths, not
            // here: a missed-call record still needs the caller details
            // after an abrupt page close
            debug!(
                conn = ep.conn_type,
                callee = %self.callee_id,
                reason,
                "caller socket closed"
            );
        }
    }

    // --- introspection ----------------------------------------------------

    pub async fn is_vacant(&self) -> bool {
        self.state.read().await.callee.is_none()
    }

    pub async fn snapshot(&self) -> HubSnapshot {
        let st = self.state.read().await;
        HubSnapshot {
            has_callee: st.callee.is_some(),
            has_caller: st.caller.is_some(),
            is_callee_hidden: st.is_callee_hidden,
            in_call: st.last_call_start_time > 0,
            pure_p2p: st.local_p2p && st.remote_p2p,
        }
    }
}

/// Cheap copy of the fields the registry statistics need.
#[derive(Debug, Clone, Copy)]
pub struct HubSnapshot {
    pub has_callee: bool,
    pub has_caller: bool,
    pub is_callee_hidden: bool,
    pub in_call: bool,
    pub pure_p2p: bool,
}

/// Watchdog for a freshly admitted caller: if the callee still has no
/// peer connection after eleven seconds and an offer was actually sent,
/// report the P2P failure to both sides and drop the caller.
///
/// Both handles are weak: the watchdog must not keep the hub or the
/// caller alive, and it must not act on a *different* caller that was
/// admitted after its own one left.
fn spawn_no_peer_con_watchdog(hub: Weak<Hub>, watched_caller: Weak<SignalingEndpoint>) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(NO_PEER_CON_SECS)).await;

        let Some(hub) = hub.upgrade() else {
            return;
        };
        let Some(watched_caller) = watched_caller.upgrade() else {
            return;
        };

        let (callee, caller) = {
            let st = hub.state.read().await;
            (st.callee.clone(), st.caller.clone())
        };
        let Some(callee) = callee else {
            return;
        };
        if callee.is_connected_to_peer() {
            return;
        }
        let Some(caller) = caller else {
            return;
        };
        if !Arc::ptr_eq(&caller, &watched_caller) {
            // the slot holds a newer caller; not ours to judge
            return;
        }
        if !caller.caller_offer_forwarded() {
            return;
        }

        info!(
            callee = %hub.callee_id,
            secs = NO_PEER_CON_SECS,
            callee_addr = %callee.remote_addr,
            caller_addr = %caller.remote_addr,
            caller_id = %caller.caller_id,
            ua = %caller.user_agent,
            "NO PEERCON"
        );

        let _ = caller.write(NO_PEER_CON_STATUS);
        let _ = callee.write(NO_PEER_CON_STATUS);

        {
            let mut st = hub.state.write().await;
            // re-check under the write lock; the slot may have changed
            // while the status frames were queued
            if st
                .caller
                .as_ref()
                .map(|c| Arc::ptr_eq(c, &watched_caller))
                .unwrap_or(false)
            {
                st.caller = None;
            }
        }

        if let Some(registry) = hub.registry() {
            registry.clear_caller_ip(&hub.global_id).await;
        }
    });
}
