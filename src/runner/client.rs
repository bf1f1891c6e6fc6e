use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    data_model::{CompletionReport, FlowExecutorInfo, LibraryFileId, RunnerId, RunnerMessage},
    http_objects::{HelloResponse, LogMessageRequest},
    state_store,
};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Applies to every call except the event stream, which stays open.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// False for rejections that will not change on a retry: the runner no
/// longer owns the file or the file already left `Processing`.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(store_err) = err.downcast_ref::<state_store::Error>() {
        return !matches!(
            store_err,
            state_store::Error::NotOwner { .. } | state_store::Error::InvalidTransition { .. }
        );
    }
    if let Some(status) = err.downcast_ref::<reqwest::Error>().and_then(|e| e.status()) {
        return status != reqwest::StatusCode::FORBIDDEN && status != reqwest::StatusCode::CONFLICT;
    }
    true
}

/// The coordinator RPC surface a runner talks to.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn hello(&self, runner: &RunnerId, info: &FlowExecutorInfo) -> Result<bool>;

    async fn log_message(&self, runner: &RunnerId, file: &LibraryFileId, text: &str)
        -> Result<()>;

    /// Opens the inbound message stream. The receiver closes when the
    /// connection drops.
    async fn subscribe(&self, runner: &RunnerId) -> Result<mpsc::Receiver<RunnerMessage>>;

    async fn finish(&self, runner: &RunnerId, report: &CompletionReport) -> Result<()>;
}

pub struct HttpCoordinatorClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCoordinatorClient {
    pub fn new(server_addr: &str) -> Result<Self> {
        let base_url = if server_addr.starts_with("http://") || server_addr.starts_with("https://")
        {
            server_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", server_addr.trim_end_matches('/'))
        };
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("building coordinator http client")?;
        Ok(Self { client, base_url })
    }

    fn runner_url(&self, runner: &RunnerId, path: &str) -> String {
        format!("{}/internal/runners/{}/{}", self.base_url, runner, path)
    }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn hello(&self, runner: &RunnerId, info: &FlowExecutorInfo) -> Result<bool> {
        let response: HelloResponse = self
            .client
            .post(self.runner_url(runner, "hello"))
            .timeout(REQUEST_TIMEOUT)
            .json(info)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.accepted)
    }

    async fn log_message(
        &self,
        runner: &RunnerId,
        file: &LibraryFileId,
        text: &str,
    ) -> Result<()> {
        self.client
            .post(self.runner_url(runner, "log"))
            .timeout(REQUEST_TIMEOUT)
            .json(&LogMessageRequest {
                library_file_uid: file.clone(),
                text: text.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn subscribe(&self, runner: &RunnerId) -> Result<mpsc::Receiver<RunnerMessage>> {
        let response = self
            .client
            .get(self.runner_url(runner, "events"))
            .send()
            .await?
            .error_for_status()?;
        let (tx, rx) = mpsc::channel(16);
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        debug!("runner event stream closed: {}", err);
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    let Some(data) = line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    match serde_json::from_str::<RunnerMessage>(data.trim()) {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!("unparseable runner event {:?}: {}", data, err),
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn finish(&self, runner: &RunnerId, report: &CompletionReport) -> Result<()> {
        self.client
            .post(self.runner_url(runner, "finish"))
            .timeout(REQUEST_TIMEOUT)
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
