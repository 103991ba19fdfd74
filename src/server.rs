use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::config::Settings;
use crate::macro_store::{MacroStore, MacroStoreError};
use crate::soco::{CommandDispatcher, DispatchError, ProcessSupervisor, SupervisorError};
use crate::upgrade::{UpgradeCoordinator, UpgradeError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("supervisor init failed: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("dispatcher init failed: {0}")]
    Dispatcher(#[from] DispatchError),
    #[error("macro store init failed: {0}")]
    Macros(#[from] MacroStoreError),
    #[error("upgrade coordinator init failed: {0}")]
    Upgrades(#[from] UpgradeError),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("http server failed: {0}")]
    Serve(io::Error),
}

pub async fn run_server(settings: Settings) -> Result<(), ServerError> {
    let supervisor = Arc::new(ProcessSupervisor::new(settings.supervisor_config())?);
    let dispatcher = Arc::new(CommandDispatcher::new(
        supervisor.clone(),
        settings.command_timeout,
    )?);
    let macros = Arc::new(MacroStore::new(
        settings.macros_file_path.clone(),
        settings.macros_metadata_path.clone(),
    ));
    macros.ensure_file_exists().await?;
    let upgrades = Arc::new(UpgradeCoordinator::new(settings.upgrade_config())?);
    let restart = upgrades.restart_requested();

    let state = AppState {
        supervisor: supervisor.clone(),
        dispatcher,
        macros,
        upgrades,
    };

    if settings.autostart {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if !supervisor.start().await {
                warn!("command server did not start; it will be retried on the first command");
            }
        });
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {}
            _ = wait_for_restart(restart) => info!("restarting after upgrade"),
        }
        let _ = shutdown_tx.send(true);
    });

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: settings.bind_addr.clone(),
            source,
        })?;
    info!(
        addr = %settings.bind_addr,
        soco_cli = %settings.soco_cli_url(),
        macros = %settings.macros_file_path.display(),
        "sndctl listening"
    );

    let served = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
            info!("shutdown requested; draining requests");
        })
        .await;

    info!("stopping command server");
    if !supervisor.stop().await {
        error!("command server did not stop cleanly");
    }
    drop(supervisor);
    info!("shutdown complete");

    served.map_err(ServerError::Serve)
}

/// Never resolves if the coordinator goes away without asking for a restart.
async fn wait_for_restart(mut restart: watch::Receiver<bool>) {
    if restart.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("failed to listen for SIGTERM: {}", err);
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", err);
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!("failed to listen for ctrl-c: {}", err);
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", err);
    }
}
