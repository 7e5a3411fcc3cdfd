use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use rackbook::config::Config;
use rackbook::engine::Engine;
use rackbook::notify::NotifyHub;
use rackbook::observability;
use rackbook::store::InMemoryStore;
use rackbook::wire;

/// Compact the WAL once enough appends have piled up.
async fn run_compactor(store: Arc<InMemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact();
        if appends < threshold {
            continue;
        }
        match store.compact() {
            Ok(()) => {
                metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
                info!("compacted WAL after {appends} appends");
            }
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(InMemoryStore::open(&config.wal_path())?);
    info!(
        "restored {} bookings ({} sessions) from {}",
        store.template_count(),
        store.instance_count(),
        config.wal_path().display()
    );
    let engine = Arc::new(Engine::new(store.clone(), Arc::new(NotifyHub::new()), config.engine.clone()));
    tokio::spawn(run_compactor(store, config.compact_threshold));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    let gate = &config.engine.gate;
    info!("rackbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!(
        "  notification window: {}",
        if gate.notification_window_enabled {
            format!("day {} at {}", gate.window_day, gate.window_time.format("%H:%M"))
        } else {
            "disabled".to_string()
        }
    );
    info!(
        "  hard restriction: {}",
        if gate.hard_restriction_enabled {
            format!("{}h", gate.hard_restriction_hours)
        } else {
            "disabled".to_string()
        }
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, engine).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("rackbook stopped");
    Ok(())
}
