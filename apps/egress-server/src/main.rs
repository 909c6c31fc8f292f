use std::time::Duration;

use egress_core::ConfigError;
use tracing::{error, info, warn};

mod bootstrap;
mod health;
mod tasks;

#[tokio::main]
async fn main() {
    if let Some(path) = std::env::var("EGRESS_SCHEMA_OUT")
        .ok()
        .filter(|s| !s.trim().is_empty())
    {
        if let Err(err) = egress_core::write_schema_file(&path) {
            eprintln!("error: failed to write EGRESS_SCHEMA_OUT: {err}");
            std::process::exit(2);
        }
        return;
    }

    egress_otel::init();
    let cfg = match egress_core::load_from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "invalid configuration");
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };

    let node = match bootstrap::build(cfg).await {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "bootstrap failed");
            eprintln!("error: {err:#}");
            std::process::exit(if err.is::<ConfigError>() { 2 } else { 1 });
        }
    };
    let bootstrap::Node {
        service,
        transport: _,
        health_addr,
        background_tasks,
        shutdown,
    } = node;

    let health = health_addr.map(|addr| {
        let service = service.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = health::serve(addr, service, token).await {
                error!(%err, "health server failed");
            }
        })
    });

    shutdown_signal().await;
    info!(live = service.live_count(), "draining egresses; signal again to terminate");
    tokio::select! {
        _ = service.shutdown(true) => {}
        _ = shutdown_signal() => {
            warn!("second shutdown signal; terminating egresses");
            service.shutdown(false).await;
        }
    }

    shutdown.cancel();
    if let Some(handle) = health {
        let _ = handle.await;
    }
    // the update forwarder exits once the last service handle is gone
    drop(service);
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
    info!("egress node stopped");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
