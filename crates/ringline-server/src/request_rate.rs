//! Per-IP request-rate records for the signaling attach path.
//!
//! Each remote IP gets a counter that rolls over on a fixed window
//! (attempts per half hour). Attach attempts past the cap are refused.
//! The records for both remotes are wiped on the first media connect of
//! a call, so a successfully connected pair never carries stale debt
//! into the next call.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

const DEFAULT_WINDOW: Duration = Duration::from_secs(30 * 60);
const DEFAULT_MAX_PER_WINDOW: u32 = 300;

#[derive(Debug)]
struct WindowRecord {
    started_at: Instant,
    attempts: u32,
}

#[derive(Clone)]
pub struct RequestRate {
    records: Arc<Mutex<HashMap<IpAddr, WindowRecord>>>,
    max_per_window: u32,
    window: Duration,
}

impl RequestRate {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            max_per_window,
            window,
        }
    }

    /// Count one attach attempt for `ip`; `false` means the attempt
    /// should be refused. The counter restarts once the window lapses.
    pub async fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        let record = records.entry(ip).or_insert(WindowRecord {
            started_at: now,
            attempts: 0,
        });

        if now.duration_since(record.started_at) >= self.window {
            record.started_at = now;
            record.attempts = 0;
        }
        record.attempts += 1;

        if record.attempts > self.max_per_window {
            warn!(ip = %ip, attempts = record.attempts, "attach rate limit exceeded");
            return false;
        }
        true
    }

    /// Drop the record for `ip` entirely (first media connect of a call).
    pub async fn clear(&self, ip: &str) {
        if let Ok(ip) = ip.parse::<IpAddr>() {
            self.records.lock().await.remove(&ip);
        }
    }

    /// Forget every record whose window has already lapsed; such a
    /// counter would restart on the next attempt anyway.
    pub async fn purge_stale(&self) {
        let now = Instant::now();
        let window = self.window;
        self.records
            .lock()
            .await
            .retain(|_, record| now.duration_since(record.started_at) < window);
    }
}

impl Default for RequestRate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_WINDOW, DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refuses_past_the_cap() {
        let rate = RequestRate::new(3, Duration::from_secs(1800));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..3 {
            assert!(rate.check(ip).await);
        }
        assert!(!rate.check(ip).await);
        assert!(!rate.check(ip).await);
    }

    #[tokio::test]
    async fn test_ips_are_counted_separately() {
        let rate = RequestRate::new(1, Duration::from_secs(1800));
        let first: IpAddr = "10.0.0.1".parse().unwrap();
        let second: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(rate.check(first).await);
        assert!(!rate.check(first).await);
        assert!(rate.check(second).await);
    }

    #[tokio::test]
    async fn test_clear_forgets_the_record() {
        let rate = RequestRate::new(1, Duration::from_secs(1800));
        let ip: IpAddr = "10.1.1.1".parse().unwrap();

        assert!(rate.check(ip).await);
        assert!(!rate.check(ip).await);

        rate.clear("10.1.1.1").await;
        assert!(rate.check(ip).await);
    }

    #[tokio::test]
    async fn test_counter_restarts_after_window() {
        let rate = RequestRate::new(1, Duration::from_millis(10));
        let ip: IpAddr = "10.2.2.2".parse().unwrap();

        assert!(rate.check(ip).await);
        assert!(!rate.check(ip).await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rate.check(ip).await);
    }

    #[tokio::test]
    async fn test_purge_drops_only_lapsed_windows() {
        let rate = RequestRate::new(5, Duration::from_millis(10));
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(rate.check(ip).await);

        // still inside the window: kept
        rate.purge_stale().await;
        assert_eq!(rate.records.lock().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        rate.purge_stale().await;
        assert!(rate.records.lock().await.is_empty());
    }
}
