//! Configuration loading and the 10 s reload cycle.
//!
//! `config.ini` is a flat `key = value` file. Keys split into two groups:
//! the init-only group (ports, paths, TLS, database locations) is read
//! once at boot; the runtime group is re-read every 10 s and swapped in
//! behind a reader-writer lock, so operators can flip policy without a
//! restart.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

pub const CONFIG_FILE_NAME: &str = "config.ini";
pub const STATS_FILE_NAME: &str = "stats.ini";

pub const FREE_ACCOUNT_TALK_SECS: i64 = 3 * 60 * 60;
pub const FREE_ACCOUNT_SERVICE_SECS: i64 = 3 * 24 * 60 * 60;
pub const RANDOM_CALLER_WAIT_SECS: i64 = 1800;
pub const RANDOM_CALLER_CALL_SECS: i64 = 600;

/// Ring policy handed to a hub when its callee attaches.
pub const DEFAULT_RING_SECS: i64 = 90;

/// Handle to the runtime-reloadable subset.
pub type SharedConfig = Arc<RwLock<RuntimeConfig>>;

/// Everything fixed at boot.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub http_port: u16,
    pub https_port: u16,
    pub http_to_https: bool,
    pub ws_port: u16,
    pub wss_port: u16,
    pub html_path: String,
    pub insecure_skip_verify: bool,
    pub run_turn: bool,
    pub turn_ip: String,
    pub turn_port: u16,
    pub pprof_port: u16,
    /// Remote KV address; empty selects the local on-disk store.
    pub rtcdb: String,
    pub db_path: PathBuf,
    pub twitter_key: String,
    pub twitter_secret: String,
    pub vapid_public_key: String,
    pub vapid_private_key: String,
    pub runtime: RuntimeConfig,
}

/// The subset that the 10 s reload cycle may replace.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub maintenance_mode: bool,
    pub allow_new_accounts: bool,
    pub free_account_talk_secs: i64,
    pub free_account_service_secs: i64,
    pub random_caller_wait_secs: i64,
    pub random_caller_call_secs: i64,
    /// Comma-separated ids that may hold several concurrent identities.
    pub multi_callees: String,
    /// Log topics enabled via the `logevents` key; replaced wholesale on
    /// reload (copy-on-reconfig).
    pub logevents: HashSet<String>,
    pub disconnect_callees_when_peer_connected: bool,
    pub disconnect_callers_when_peer_connected: bool,
    pub callee_client_version: String,
    pub ws_url: String,
    pub wss_url: String,
    pub turn_debug_level: i64,
    pub admin_email: String,
    pub calllog: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            maintenance_mode: false,
            allow_new_accounts: true,
            free_account_talk_secs: FREE_ACCOUNT_TALK_SECS,
            free_account_service_secs: FREE_ACCOUNT_SERVICE_SECS,
            random_caller_wait_secs: RANDOM_CALLER_WAIT_SECS,
            random_caller_call_secs: RANDOM_CALLER_CALL_SECS,
            multi_callees: String::new(),
            logevents: HashSet::new(),
            disconnect_callees_when_peer_connected: false,
            disconnect_callers_when_peer_connected: true,
            callee_client_version: String::new(),
            ws_url: String::new(),
            wss_url: String::new(),
            turn_debug_level: 3,
            admin_email: String::new(),
            calllog: String::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn log_wanted(&self, topic: &str) -> bool {
        self.logevents.contains(topic)
    }

    pub fn is_multi_callee(&self, callee_id: &str) -> bool {
        self.multi_callees
            .split(',')
            .any(|s| !s.trim().is_empty() && s.trim() == callee_id)
    }

    fn apply(&mut self, map: &HashMap<String, String>) {
        read_bool(map, "maintenanceMode", &mut self.maintenance_mode);
        read_bool(map, "allowNewAccounts", &mut self.allow_new_accounts);
        read_scaled(
            map,
            "freeAccountTalkHours",
            &mut self.free_account_talk_secs,
            60 * 60,
        );
        read_scaled(
            map,
            "freeAccountServiceDays",
            &mut self.free_account_service_secs,
            24 * 60 * 60,
        );
        read_scaled(
            map,
            "randomCallerWaitSecs",
            &mut self.random_caller_wait_secs,
            1,
        );
        read_scaled(
            map,
            "randomCallerCallSecs",
            &mut self.random_caller_call_secs,
            1,
        );
        read_string(map, "multiCallees", &mut self.multi_callees);

        if let Some(raw) = map.get("logevents") {
            self.logevents = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        read_bool(
            map,
            "disconnectCalleesWhenPeerConnected",
            &mut self.disconnect_callees_when_peer_connected,
        );
        read_bool(
            map,
            "disconnectCallersWhenPeerConnected",
            &mut self.disconnect_callers_when_peer_connected,
        );
        read_string(map, "calleeClientVersion", &mut self.callee_client_version);
        read_string(map, "wsUrl", &mut self.ws_url);
        read_string(map, "wssUrl", &mut self.wss_url);
        read_scaled(map, "turnDebugLevel", &mut self.turn_debug_level, 1);
        read_string(map, "adminEmail", &mut self.admin_email);
        read_string(map, "calllog", &mut self.calllog);
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            http_port: 8067,
            https_port: 0,
            http_to_https: false,
            ws_port: 8071,
            wss_port: 0,
            html_path: "webroot".to_string(),
            insecure_skip_verify: false,
            run_turn: false,
            turn_ip: String::new(),
            turn_port: 3739,
            pprof_port: 0,
            rtcdb: String::new(),
            db_path: PathBuf::from("db/"),
            twitter_key: String::new(),
            twitter_secret: String::new(),
            vapid_public_key: String::new(),
            vapid_private_key: String::new(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load the full configuration. A missing file yields defaults and is
    /// reported once.
    pub fn load(path: &Path) -> Self {
        let mut config = Self::default();
        let map = match read_kv_file(path) {
            Some(map) => map,
            None => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                return config;
            }
        };

        read_string(&map, "hostname", &mut config.hostname);
        read_port(&map, "httpPort", &mut config.http_port);
        read_port(&map, "httpsPort", &mut config.https_port);
        read_bool(&map, "httpToHttps", &mut config.http_to_https);
        read_port(&map, "wsPort", &mut config.ws_port);
        read_port(&map, "wssPort", &mut config.wss_port);
        read_string(&map, "htmlPath", &mut config.html_path);
        read_bool(&map, "insecureSkipVerify", &mut config.insecure_skip_verify);
        read_bool(&map, "runTurn", &mut config.run_turn);
        read_string(&map, "turnIP", &mut config.turn_ip);
        read_port(&map, "turnPort", &mut config.turn_port);
        read_port(&map, "pprofPort", &mut config.pprof_port);

        read_string(&map, "rtcdb", &mut config.rtcdb);
        if !config.rtcdb.is_empty() && !config.rtcdb.contains(':') {
            config.rtcdb = format!("{}:8061", config.rtcdb);
        }
        if let Some(v) = map.get("dbPath") {
            config.db_path = PathBuf::from(v);
        }

        read_string(&map, "twitterKey", &mut config.twitter_key);
        read_string(&map, "twitterSecret", &mut config.twitter_secret);
        read_string(&map, "vapidPublicKey", &mut config.vapid_public_key);
        read_string(&map, "vapidPrivateKey", &mut config.vapid_private_key);

        config.runtime.apply(&map);
        config
    }
}

/// Re-read the runtime subset from `path` and swap it into `shared`.
/// Keys missing from the file keep their current values.
pub async fn reload_runtime(path: &Path, shared: &SharedConfig) {
    let Some(map) = read_kv_file(path) else {
        return;
    };
    let mut fresh = shared.read().await.clone();
    fresh.apply(&map);
    *shared.write().await = fresh;
}

/// Parse a flat `key = value` file. Lines starting with `#` or `;` are
/// comments. Returns `None` when the file cannot be read.
pub fn read_kv_file(path: &Path) -> Option<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mut map = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Some(map)
}

fn read_string(map: &HashMap<String, String>, key: &str, out: &mut String) {
    if let Some(v) = map.get(key) {
        *out = v.clone();
    }
}

fn read_bool(map: &HashMap<String, String>, key: &str, out: &mut bool) {
    if let Some(v) = map.get(key) {
        *out = matches!(v.as_str(), "true" | "yes" | "1");
    }
}

fn read_port(map: &HashMap<String, String>, key: &str, out: &mut u16) {
    if let Some(v) = map.get(key) {
        match v.parse::<u16>() {
            Ok(port) => *out = port,
            Err(_) => tracing::warn!(key, value = %v, "ignoring invalid port in config"),
        }
    }
}

fn read_scaled(map: &HashMap<String, String>, key: &str, out: &mut i64, scale: i64) {
    if let Some(v) = map.get(key) {
        match v.parse::<i64>() {
            Ok(n) => *out = n * scale,
            Err(_) => tracing::warn!(key, value = %v, "ignoring invalid number in config"),
        }
    }
}
