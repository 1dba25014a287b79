//! The per-hub deadline.
//!
//! A hub owns at most one armed deadline at a time: the ring timeout, the
//! relay max-talk timeout, or nothing. Arming replaces any previous
//! deadline; disarming cancels it. Expiry funnels into
//! `peer_con_has_ended("deadline <cause>")` on the hub's callee endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::hub::Hub;

#[derive(Default)]
pub struct TimeoutController {
    inner: Mutex<Option<Armed>>,
    generation: AtomicU64,
}

struct Armed {
    generation: u64,
    cause: String,
    handle: JoinHandle<()>,
}

impl TimeoutController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending deadline.
    pub fn disarm(&self, cause: &str) {
        let mut slot = self.inner.lock().expect("deadline mutex");
        if let Some(armed) = slot.take() {
            debug!(was = %armed.cause, now = cause, "deadline disarmed");
            armed.handle.abort();
        }
    }

    /// Arm a deadline `secs` from now. `secs == 0` disarms instead.
    pub fn arm(&self, hub: Weak<Hub>, secs: i64, cause: &str) {
        if secs <= 0 {
            self.disarm(cause);
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cause_owned = cause.to_string();
        let task_cause = cause_owned.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs as u64)).await;
            let Some(hub) = hub.upgrade() else {
                return;
            };
            // Clear our own slot before firing: peer_con_has_ended will
            // disarm, and it must not abort the task that is running it.
            if !hub.deadline.take_generation(generation) {
                return; // superseded by a newer deadline
            }
            hub.deadline_fired(&task_cause).await;
        });

        let mut slot = self.inner.lock().expect("deadline mutex");
        if let Some(prev) = slot.take() {
            debug!(was = %prev.cause, now = %cause_owned, "deadline replaced");
            prev.handle.abort();
        }
        debug!(cause = %cause_owned, secs, "deadline armed");
        *slot = Some(Armed {
            generation,
            cause: cause_owned,
            handle,
        });
    }

    /// Remove the armed entry if it still belongs to `generation`.
    /// Returns false when a newer deadline has replaced it.
    pub(crate) fn take_generation(&self, generation: u64) -> bool {
        let mut slot = self.inner.lock().expect("deadline mutex");
        match slot.as_ref() {
            Some(armed) if armed.generation == generation => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().expect("deadline mutex").is_some()
    }
}

impl Drop for TimeoutController {
    fn drop(&mut self) {
        if let Some(armed) = self.inner.lock().expect("deadline mutex").take() {
            armed.handle.abort();
        }
    }
}
