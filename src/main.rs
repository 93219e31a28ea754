use std::path::Path;
use std::sync::Arc;

use device_agent::agent::{Agent, AgentDeps};
use device_agent::config::{AgentConfig, SessionConfig};
use device_agent::device::{AdbDevice, DeviceControl, discover_slots};
use device_agent::playbook::{Playbook, PlaybookDriver};
use device_agent::source::HttpTaskSource;
use device_agent::verification::HttpCodeProvider;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env()?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📱 Device Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {}", config.agent_id);
    eprintln!("   Handler: {}", config.handler_url);

    let code_service_url = config.require_code_service_url()?.to_string();
    let playbook = Playbook::from_file(config.require_playbook_path()?).await?;

    let slots = discover_slots(&config.adb_path, config.fallback_slots()).await;
    let slots: Vec<_> = slots
        .into_iter()
        .map(|slot| {
            let device: Arc<dyn DeviceControl> =
                Arc::new(AdbDevice::new(&config.adb_path, &slot.device_address));
            (slot, device)
        })
        .collect();
    eprintln!("   Slots: {}", slots.len());

    let source = Arc::new(
        HttpTaskSource::new(&config.handler_url, &config.agent_id).with_timeout(config.request_timeout),
    );
    let deps = AgentDeps {
        source,
        driver: Arc::new(PlaybookDriver::new(playbook)),
        codes: Arc::new(HttpCodeProvider::new(code_service_url)),
        slots,
    };
    let agent = Agent::new(config, SessionConfig::default(), deps).inspect_err(|e| {
        error!(error = %e, "Agent could not start");
    })?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown requested, finishing current device operations");
            shutdown.cancel();
        }
    });

    agent.run(shutdown).await;
    Ok(())
}

/// Console logging plus an optional daily file under `log_dir`.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "device-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
