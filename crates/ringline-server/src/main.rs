mod config;
mod diag;
mod endpoint;
mod error;
mod hub;
mod keepalive;
mod ledger;
mod listener;
mod registry;
mod request_rate;
mod timeout;
mod util;

#[cfg(test)]
mod testutil;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ringline_store::models::buckets;
use ringline_store::KvStore;

use crate::config::{ServerConfig, SharedConfig, CONFIG_FILE_NAME};
use crate::keepalive::KeepAliveMgr;
use crate::ledger::CallLedger;
use crate::listener::ListenerCtx;
use crate::registry::{HubRegistry, SharedServices};
use crate::request_rate::RequestRate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ringline_server=debug")),
        )
        .init();

    info!(
        "Starting Ringline signaling server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ServerConfig::load(Path::new(CONFIG_FILE_NAME));
    info!(
        ws_port = config.ws_port,
        wss_port = config.wss_port,
        pprof_port = config.pprof_port,
        db_path = %config.db_path.display(),
        "Loaded configuration"
    );
    if !config.rtcdb.is_empty() {
        warn!(rtcdb = %config.rtcdb, "remote kv is not supported, using the local store");
    }

    std::fs::create_dir_all(&config.db_path)?;

    // the five stores, opened in boot order
    let kv_main = open_store(
        "rtcsig",
        &config.db_path,
        &[
            buckets::REGISTERED_IDS,
            buckets::BLOCKED_IDS,
            buckets::USER_DATA,
        ],
    )?;
    let kv_calls = open_store(
        "rtccalls",
        &config.db_path,
        &[buckets::WAITING_CALLERS, buckets::MISSED_CALLS],
    )?;
    let kv_notif = open_store("rtcnotif", &config.db_path, &[buckets::SENT_NOTIF_TWEETS])?;
    let kv_hashed_pw = open_store("rtchashedpw", &config.db_path, &[buckets::HASHED_PW])?;
    let kv_contacts = open_store("rtccontacts", &config.db_path, &[buckets::CONTACTS])?;

    let runtime: SharedConfig = Arc::new(RwLock::new(config.runtime.clone()));
    let ledger = Arc::new(CallLedger::new(
        kv_main.clone(),
        kv_calls.clone(),
        Path::new("."),
    ));
    ledger.roll_day_if_needed();

    let rate = Arc::new(RequestRate::default());
    let services = Arc::new(SharedServices {
        runtime: runtime.clone(),
        ledger: ledger.clone(),
        rate: rate.clone(),
    });
    let registry = HubRegistry::new(services);
    let keepalive = Arc::new(KeepAliveMgr::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    tokio::spawn(keepalive.clone().run(shutdown.clone()));

    // periodically re-read the runtime config subset
    {
        let runtime = runtime.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                config::reload_runtime(Path::new(CONFIG_FILE_NAME), &runtime).await;
            }
        });
    }

    // periodic stats line and today-counter day rollover
    {
        let registry = registry.clone();
        let ledger = ledger.clone();
        let keepalive = keepalive.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                ledger.roll_day_if_needed();
                let (callees, active_calls, pure_p2p) = registry.call_stats().await;
                let today = ledger.today_snapshot();
                info!(
                    callees,
                    active_calls,
                    pure_p2p,
                    sockets = keepalive.client_count(),
                    calls_today = today.calls_today,
                    call_secs_today = today.call_secs_today,
                    "stats"
                );
            }
        });
    }

    // drop lapsed per-IP request windows every 5 min
    {
        let rate = rate.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                rate.purge_stale().await;
            }
        });
    }

    let ctx = Arc::new(ListenerCtx {
        registry: registry.clone(),
        keepalive: keepalive.clone(),
        shutdown: shutdown.clone(),
    });

    let ws_listener = {
        let ctx = ctx.clone();
        let port = config.ws_port;
        async move {
            if port > 0 {
                listener::run_ws_listener(ctx, port).await
            } else {
                std::future::pending().await
            }
        }
    };
    let wss_listener = {
        let ctx = ctx.clone();
        let port = config.wss_port;
        async move {
            if port > 0 {
                listener::run_wss_listener(ctx, port, Path::new("tls.pem"), Path::new("tls.key"))
                    .await
            } else {
                std::future::pending().await
            }
        }
    };

    if config.pprof_port > 0 {
        let registry = registry.clone();
        let port = config.pprof_port;
        tokio::spawn(async move {
            if let Err(e) = diag::serve(registry, port).await {
                error!(error = %e, "diagnostics endpoint failed");
            }
        });
    }

    info!("awaiting SIGINT/SIGTERM for shutdown...");
    tokio::select! {
        result = ws_listener => {
            error!(error = ?result.err(), "ws listener failed");
            anyhow::bail!("ws listener failed");
        }
        result = wss_listener => {
            error!(error = ?result.err(), "wss listener failed");
            anyhow::bail!("wss listener failed");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal, shutting down...");
        }
    }

    // the flag stops the periodic tasks
    shutdown.store(true, Ordering::Release);

    ledger.write_stats_file();

    // give in-flight handlers a moment before the stores go away
    tokio::time::sleep(Duration::from_secs(2)).await;

    for store in [&kv_contacts, &kv_hashed_pw, &kv_notif, &kv_calls, &kv_main] {
        if let Err(e) = store.close() {
            error!(store = store.name(), error = %e, "store close failed");
        }
    }

    Ok(())
}

fn open_store(
    name: &str,
    dir: &Path,
    bucket_names: &[&str],
) -> anyhow::Result<Arc<KvStore>> {
    let store = KvStore::open_at(name, &dir.join(format!("{}.db", name)))?;
    for bucket in bucket_names {
        store.create_bucket(bucket)?;
    }
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
