use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::ServerConfig,
    data_model::{
        CompletionReport,
        Flow,
        FlowExecutorInfo,
        Library,
        LibraryFile,
        LibraryFileId,
        LibraryId,
        NodeId,
        ProcessingNode,
        RunnerId,
        RunnerMessage,
    },
    data_model::test_objects::tests::TEST_NODE_VERSION,
    executors::RunnerManager,
    processor::file_selector::NextFile,
    routes::{create_routes, RouteState},
    runner::client::CoordinatorClient,
    service::Service,
};

pub struct TestService {
    pub service: Service,
}

impl TestService {
    pub fn new(libraries: Vec<Library>, nodes: Vec<ProcessingNode>, flows: Vec<Flow>) -> Result<Self> {
        Self::with_config(ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            libraries,
            nodes,
            flows,
            ..Default::default()
        })
    }

    pub fn with_config(cfg: ServerConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let srv = Service::new(cfg)?;
        Ok(Self { service: srv })
    }

    pub fn runner_manager(&self) -> Arc<RunnerManager> {
        self.service.runner_manager.clone()
    }

    pub async fn enqueue(&self, library: &str, name: &str, size: u64) -> Result<LibraryFile> {
        self.service
            .repository
            .enqueue(&LibraryId::from(library), name, size, 0)
            .await
    }

    pub async fn file(&self, uid: &LibraryFileId) -> Result<LibraryFile> {
        match self.service.repository.get(uid).await? {
            Some(file) => Ok(file),
            None => bail!("file {uid} not found"),
        }
    }

    /// One poll from `node` with a compatible version.
    pub async fn poll(&self, node: &str) -> NextFile {
        self.service
            .selector
            .select_next(&NodeId::from(node), TEST_NODE_VERSION)
            .await
    }

    /// Serves the HTTP routes on an ephemeral port.
    pub async fn serve(&self) -> Result<SocketAddr> {
        let route_state = RouteState {
            repository: self.service.repository.clone(),
            selector: self.service.selector.clone(),
            runner_manager: self.service.runner_manager.clone(),
            max_flow_parts: self.service.config.max_flow_parts,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, create_routes(route_state)).await {
                tracing::error!("test server stopped: {:?}", err);
            }
        });
        Ok(addr)
    }
}

/// Talks to a [`RunnerManager`] in-process instead of over HTTP.
pub struct LocalCoordinatorClient {
    manager: Arc<RunnerManager>,
    hello_ok: AtomicBool,
    pub hellos: AtomicU32,
    pub finishes: AtomicU32,
}

impl LocalCoordinatorClient {
    pub fn new(manager: Arc<RunnerManager>) -> Self {
        Self {
            manager,
            hello_ok: AtomicBool::new(true),
            hellos: AtomicU32::new(0),
            finishes: AtomicU32::new(0),
        }
    }

    /// Makes every following hello fail as if the coordinator were unreachable.
    pub fn fail_hellos(&self, fail: bool) {
        self.hello_ok.store(!fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinatorClient for LocalCoordinatorClient {
    async fn hello(&self, runner: &RunnerId, info: &FlowExecutorInfo) -> Result<bool> {
        self.hellos.fetch_add(1, Ordering::SeqCst);
        if !self.hello_ok.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        self.manager.hello(runner, info.clone()).await
    }

    async fn log_message(&self, runner: &RunnerId, file: &LibraryFileId, text: &str) -> Result<()> {
        self.manager.log_message(runner, file, text).await
    }

    async fn subscribe(&self, _runner: &RunnerId) -> Result<mpsc::Receiver<RunnerMessage>> {
        let mut events = self.manager.subscribe();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn finish(&self, runner: &RunnerId, report: &CompletionReport) -> Result<()> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        self.manager.finish(runner, report.clone()).await?;
        Ok(())
    }
}
