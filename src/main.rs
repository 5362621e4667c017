use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use seatd::limits::DEFAULT_SWEEP_INTERVAL_SECS;
use seatd::site::SiteManager;
use seatd::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let env_num = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok());

    let metrics_port: Option<u16> = std::env::var("SEATD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    seatd::observability::init(metrics_port)?;

    let port = std::env::var("SEATD_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("SEATD_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("SEATD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("SEATD_PASSWORD").unwrap_or_else(|_| "seatd".into());
    let max_connections = env_num("SEATD_MAX_CONNECTIONS").unwrap_or(256) as usize;
    let compact_threshold = env_num("SEATD_COMPACT_THRESHOLD").unwrap_or(1000);
    let sweep_interval = Duration::from_secs(
        env_num("SEATD_SWEEP_INTERVAL_SECS")
            .filter(|&secs| secs > 0)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
    );

    let tls_cert = std::env::var("SEATD_TLS_CERT").ok();
    let tls_key = std::env::var("SEATD_TLS_KEY").ok();
    let tls_acceptor =
        seatd::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;

    let sites = Arc::new(SiteManager::new(
        PathBuf::from(&data_dir),
        compact_threshold,
        sweep_interval,
    ));
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("seatd listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  sweep_interval: {}s", sweep_interval.as_secs());
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
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
                        metrics::counter!(seatd::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(seatd::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(seatd::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let sites = sites.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, sites, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(seatd::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
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

    info!("seatd stopped");
    Ok(())
}
