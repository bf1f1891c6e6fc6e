use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use tokio::{self, signal, sync::watch};
use tracing::{error, info};

use super::routes::RouteState;
use crate::{
    config::ServerConfig,
    executors::{ExecutorRegistry, NodeBlacklist, RunnerManager},
    processor::{FileSelector, SelectorSettings},
    routes::create_routes,
    state_store::{FileRepository, FileStore},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub repository: Arc<dyn FileRepository>,
    pub runner_manager: Arc<RunnerManager>,
    pub selector: Arc<FileSelector>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let repository: Arc<dyn FileRepository> = Arc::new(FileStore::new(
            config.libraries.clone(),
            config.nodes.clone(),
            config.flows.clone(),
        ));
        let runner_manager = Arc::new(RunnerManager::new(
            repository.clone(),
            Arc::new(ExecutorRegistry::new()),
            Arc::new(NodeBlacklist::new()),
            config.runner_timeout(),
            config.runner_failure_pause(),
        ));
        let selector = Arc::new(FileSelector::new(
            repository.clone(),
            runner_manager.clone(),
            SelectorSettings {
                node_stale_after: config.node_stale_after(),
                ..Default::default()
            },
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            repository,
            runner_manager,
            selector,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let reset = self
            .runner_manager
            .sweep_orphaned()
            .await
            .context("resetting orphaned files")?;
        if reset > 0 {
            info!(reset, "reset files left in processing by a previous run");
        }

        let runner_manager = self.runner_manager.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            runner_manager.start_liveness_monitor(shutdown_rx).await;
        });

        let route_state = RouteState {
            repository: self.repository.clone(),
            selector: self.selector.clone(),
            runner_manager: self.runner_manager.clone(),
            max_flow_parts: self.config.max_flow_parts,
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

pub async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}
