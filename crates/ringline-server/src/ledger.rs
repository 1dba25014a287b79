//! Waiting-caller and missed-call lists plus talk-time accounting.
//!
//! Both lists live in the calls store under the callee id and are updated
//! read-modify-write. There is no cross-process lock: only the callee's
//! own signaling path mutates its lists, which makes the single-writer
//! property hold by construction.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use ringline_shared::constants::{MISSED_CALL_DEDUPE_SECS, WAITING_CALLER_MAX_AGE_SECS};
use ringline_shared::types::{CalleeId, CallerInfo};
use ringline_store::models::buckets;
use ringline_store::{KvStore, StoreError, UserRecord};

use crate::config::STATS_FILE_NAME;
use crate::util::{current_day_of_month, now_secs};

/// Process-wide daily counters, persisted across restarts via the stats
/// file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TodayCounters {
    pub calls_today: i64,
    pub call_secs_today: i64,
    pub last_day_of_month: u32,
}

pub struct CallLedger {
    kv_main: Arc<KvStore>,
    kv_calls: Arc<KvStore>,
    today: Mutex<TodayCounters>,
    stats_path: PathBuf,
}

impl CallLedger {
    pub fn new(kv_main: Arc<KvStore>, kv_calls: Arc<KvStore>, stats_dir: &std::path::Path) -> Self {
        let stats_path = stats_dir.join(STATS_FILE_NAME);
        let today = read_stats_file(&stats_path);
        Self {
            kv_main,
            kv_calls,
            today: Mutex::new(today),
            stats_path,
        }
    }

    // --- user records -----------------------------------------------------

    pub fn get_user(
        &self,
        callee: &CalleeId,
        registration_start_time: i64,
    ) -> Result<UserRecord, StoreError> {
        self.kv_main.get(
            buckets::USER_DATA,
            &callee.user_key(registration_start_time),
        )
    }

    /// Read-modify-write of the user record. Absent records are treated
    /// as an error; the login path creates them.
    pub fn update_user(
        &self,
        callee: &CalleeId,
        registration_start_time: i64,
        mutate: impl FnOnce(&mut UserRecord),
    ) -> Result<UserRecord, StoreError> {
        let key = callee.user_key(registration_start_time);
        let mut user: UserRecord = self.kv_main.get(buckets::USER_DATA, &key)?;
        mutate(&mut user);
        self.kv_main.put(buckets::USER_DATA, &key, &user, true)?;
        Ok(user)
    }

    // --- waiting callers / missed calls ----------------------------------

    /// Load both lists for a freshly attached callee. Waiting entries
    /// older than ten minutes are pruned, and the pruned list is written
    /// back when anything was removed.
    pub fn load_lists(&self, callee: &CalleeId) -> (Vec<CallerInfo>, Vec<CallerInfo>) {
        let now = now_secs();

        let mut waiting: Vec<CallerInfo> = self
            .kv_calls
            .get(buckets::WAITING_CALLERS, callee.as_str())
            .unwrap_or_default();
        let before = waiting.len();
        waiting.retain(|entry| now - entry.call_time <= WAITING_CALLER_MAX_AGE_SECS);
        if waiting.len() != before {
            info!(
                callee = %callee,
                removed = before - waiting.len(),
                "pruned outdated waiting callers"
            );
            if let Err(e) =
                self.kv_calls
                    .put(buckets::WAITING_CALLERS, callee.as_str(), &waiting, true)
            {
                warn!(callee = %callee, error = %e, "failed to store pruned waiting callers");
            }
        }

        let missed: Vec<CallerInfo> = self
            .kv_calls
            .get(buckets::MISSED_CALLS, callee.as_str())
            .unwrap_or_default();

        (waiting, missed)
    }

    /// Append a missed call, if the account opted in. Best-effort: store
    /// failures are logged, never propagated into the teardown path.
    ///
    /// A record for the same caller address within one second of an
    /// existing entry is a duplicate (the caller's page sends both a
    /// `missedcall|` and a hangup) and is dropped.
    pub fn add_missed_call(
        &self,
        callee: &CalleeId,
        registration_start_time: i64,
        info: CallerInfo,
        cause: &str,
    ) {
        let user = match self.get_user(callee, registration_start_time) {
            Ok(user) => user,
            Err(e) => {
                warn!(callee = %callee, error = %e, "missed call: failed to get user");
                return;
            }
        };
        if !user.store_missed_calls {
            return;
        }

        let mut missed: Vec<CallerInfo> = self
            .kv_calls
            .get(buckets::MISSED_CALLS, callee.as_str())
            .unwrap_or_default();

        let duplicate = missed.iter().any(|m| {
            m.addr_port == info.addr_port
                && (m.call_time - info.call_time).abs() <= MISSED_CALL_DEDUPE_SECS
        });
        if duplicate {
            debug!(callee = %callee, caller = %info.addr_port, "missed call deduped");
            return;
        }

        info!(
            callee = %callee,
            caller = %info.addr_port,
            caller_id = %info.caller_id,
            cause,
            "missed call recorded"
        );
        missed.push(info);
        if let Err(e) = self
            .kv_calls
            .put(buckets::MISSED_CALLS, callee.as_str(), &missed, true)
        {
            warn!(callee = %callee, error = %e, "failed to store missed calls");
        }
    }

    /// Remove the entry matching `<addrPort>_<callTime>`. Returns the
    /// modified list when an entry was removed, `None` otherwise.
    pub fn delete_missed_call(
        &self,
        callee: &CalleeId,
        registration_start_time: i64,
        delete_key: &str,
    ) -> Option<Vec<CallerInfo>> {
        let user = match self.get_user(callee, registration_start_time) {
            Ok(user) => user,
            Err(e) => {
                warn!(callee = %callee, error = %e, "deleteMissedCall: failed to get user");
                return None;
            }
        };
        if !user.store_missed_calls {
            return None;
        }

        let mut missed: Vec<CallerInfo> = self
            .kv_calls
            .get(buckets::MISSED_CALLS, callee.as_str())
            .unwrap_or_default();

        let before = missed.len();
        // remove the first match only; duplicates stay individually
        // deletable
        if let Some(idx) = missed.iter().position(|m| m.delete_key() == delete_key) {
            missed.remove(idx);
        }
        if missed.len() == before {
            return None;
        }

        if let Err(e) = self
            .kv_calls
            .put(buckets::MISSED_CALLS, callee.as_str(), &missed, false)
        {
            warn!(callee = %callee, error = %e, "failed to store missed calls after delete");
        }
        Some(missed)
    }

    // --- talk-time accounting --------------------------------------------

    /// Persist the outcome of a finished call: lifetime peer-connected
    /// seconds on the user record, plus the today-counters. Returns the
    /// new lifetime total.
    pub fn record_call_end(
        &self,
        callee: &CalleeId,
        registration_start_time: i64,
        call_duration_secs: i64,
    ) -> i64 {
        let total = match self.update_user(callee, registration_start_time, |user| {
            user.connected_to_peer_secs += call_duration_secs;
        }) {
            Ok(user) => user.connected_to_peer_secs,
            Err(e) => {
                warn!(callee = %callee, error = %e, "failed to persist talk time");
                call_duration_secs
            }
        };

        let mut today = self.today.lock().expect("today mutex");
        today.calls_today += 1;
        today.call_secs_today += call_duration_secs;
        total
    }

    // --- today-counters and the stats file -------------------------------

    pub fn today_snapshot(&self) -> TodayCounters {
        *self.today.lock().expect("today mutex")
    }

    /// Reset the counters when the local day of month has changed.
    pub fn roll_day_if_needed(&self) {
        let day = current_day_of_month();
        let mut today = self.today.lock().expect("today mutex");
        if today.last_day_of_month != day {
            if today.last_day_of_month != 0 {
                info!(
                    calls = today.calls_today,
                    call_secs = today.call_secs_today,
                    "day rollover, resetting today-counters"
                );
            }
            today.calls_today = 0;
            today.call_secs_today = 0;
            today.last_day_of_month = day;
        }
    }

    /// Write the stats file; called once at shutdown.
    pub fn write_stats_file(&self) {
        let today = self.today_snapshot();
        let data = format!(
            "numberOfCallsToday = {}\nnumberOfCallSecondsToday = {}\nlastCurrentDayOfMonth = {}\n",
            today.calls_today, today.call_secs_today, today.last_day_of_month
        );
        match std::fs::write(&self.stats_path, &data) {
            Ok(()) => info!(path = %self.stats_path.display(), "wrote stats file"),
            Err(e) => warn!(path = %self.stats_path.display(), error = %e, "failed to write stats file"),
        }
    }
}

fn read_stats_file(path: &std::path::Path) -> TodayCounters {
    let mut counters = TodayCounters::default();
    let Some(map) = crate::config::read_kv_file(path) else {
        return counters;
    };
    if let Some(v) = map.get("numberOfCallsToday").and_then(|v| v.parse().ok()) {
        counters.calls_today = v;
    }
    if let Some(v) = map
        .get("numberOfCallSecondsToday")
        .and_then(|v| v.parse().ok())
    {
        counters.call_secs_today = v;
    }
    if let Some(v) = map
        .get("lastCurrentDayOfMonth")
        .and_then(|v| v.parse().ok())
    {
        counters.last_day_of_month = v;
    }
    counters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> (tempfile::TempDir, CallLedger, CalleeId) {
        let dir = tempfile::tempdir().unwrap();
        let kv_main = Arc::new(KvStore::open_at("main", &dir.path().join("main.db")).unwrap());
        kv_main.create_bucket(buckets::USER_DATA).unwrap();
        let kv_calls = Arc::new(KvStore::open_at("calls", &dir.path().join("calls.db")).unwrap());
        kv_calls.create_bucket(buckets::WAITING_CALLERS).unwrap();
        kv_calls.create_bucket(buckets::MISSED_CALLS).unwrap();

        let callee = CalleeId::new("alice");
        kv_main
            .put(
                buckets::USER_DATA,
                &callee.user_key(1000),
                &UserRecord {
                    store_missed_calls: true,
                    ..Default::default()
                },
                true,
            )
            .unwrap();

        let ledger = CallLedger::new(kv_main, kv_calls, dir.path());
        (dir, ledger, callee)
    }

    fn caller(addr: &str, call_time: i64) -> CallerInfo {
        CallerInfo {
            addr_port: addr.to_string(),
            caller_name: "Bob".into(),
            call_time,
            caller_id: "bob".into(),
            text_msg: String::new(),
        }
    }

    #[test]
    fn test_waiting_callers_pruned_on_load() {
        let (_dir, ledger, callee) = ledger();
        let now = now_secs();
        let entries = vec![
            caller("1.1.1.1:1", now - WAITING_CALLER_MAX_AGE_SECS - 5),
            caller("2.2.2.2:2", now - 30),
        ];
        ledger
            .kv_calls
            .put(buckets::WAITING_CALLERS, callee.as_str(), &entries, true)
            .unwrap();

        let (waiting, _missed) = ledger.load_lists(&callee);
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].addr_port, "2.2.2.2:2");

        // pruning was persisted
        let stored: Vec<CallerInfo> = ledger
            .kv_calls
            .get(buckets::WAITING_CALLERS, callee.as_str())
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn test_missed_call_appended_once() {
        let (_dir, ledger, callee) = ledger();
        let now = now_secs();

        ledger.add_missed_call(&callee, 1000, caller("3.3.3.3:3", now), "cancel");
        // the page-close duplicate arrives one second later
        ledger.add_missed_call(&callee, 1000, caller("3.3.3.3:3", now + 1), "cmd=missedcall");

        let (_, missed) = ledger.load_lists(&callee);
        assert_eq!(missed.len(), 1);
    }

    #[test]
    fn test_missed_call_requires_opt_in() {
        let (_dir, ledger, callee) = ledger();
        ledger
            .update_user(&callee, 1000, |u| u.store_missed_calls = false)
            .unwrap();

        ledger.add_missed_call(&callee, 1000, caller("4.4.4.4:4", now_secs()), "cancel");
        let (_, missed) = ledger.load_lists(&callee);
        assert!(missed.is_empty());
    }

    #[test]
    fn test_delete_missed_call() {
        let (_dir, ledger, callee) = ledger();
        ledger.add_missed_call(&callee, 1000, caller("1.2.3.4:5555", 1700000000), "cancel");
        ledger.add_missed_call(&callee, 1000, caller("5.6.7.8:9999", 1700000100), "cancel");

        let modified = ledger
            .delete_missed_call(&callee, 1000, "1.2.3.4:5555_1700000000")
            .expect("entry should be removed");
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].addr_port, "5.6.7.8:9999");

        // persisted list no longer contains the entry
        let (_, missed) = ledger.load_lists(&callee);
        assert!(!missed.iter().any(|m| m.addr_port == "1.2.3.4:5555"));

        // deleting again finds nothing
        assert!(ledger
            .delete_missed_call(&callee, 1000, "1.2.3.4:5555_1700000000")
            .is_none());
    }

    #[test]
    fn test_record_call_end_accumulates() {
        let (_dir, ledger, callee) = ledger();
        assert_eq!(ledger.record_call_end(&callee, 1000, 30), 30);
        assert_eq!(ledger.record_call_end(&callee, 1000, 12), 42);

        let today = ledger.today_snapshot();
        assert_eq!(today.calls_today, 2);
        assert_eq!(today.call_secs_today, 42);

        let user = ledger.get_user(&callee, 1000).unwrap();
        assert_eq!(user.connected_to_peer_secs, 42);
    }

    #[test]
    fn test_stats_file_roundtrip() {
        let (dir, ledger, callee) = ledger();
        ledger.record_call_end(&callee, 1000, 30);
        ledger.write_stats_file();

        let counters = read_stats_file(&dir.path().join(STATS_FILE_NAME));
        assert_eq!(counters.calls_today, 1);
        assert_eq!(counters.call_secs_today, 30);
    }

    #[test]
    fn test_day_rollover_resets_counters() {
        let (_dir, ledger, callee) = ledger();
        ledger.record_call_end(&callee, 1000, 30);
        {
            let mut today = ledger.today.lock().unwrap();
            today.last_day_of_month = 0; // force a change
        }
        ledger.roll_day_if_needed();
        let today = ledger.today_snapshot();
        assert_eq!(today.calls_today, 0);
        assert_eq!(today.call_secs_today, 0);
        assert_eq!(today.last_day_of_month, current_day_of_month());
    }
}
