use std::{path::PathBuf, process::Stdio};

use anyhow::{Context, Result};
use tokio::{process::Command, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    config::NodeConfig,
    data_model::{LibraryFileId, NodeId, RunnerId, RunnerParameters},
    http_objects::{NextFileRequest, NextFileResponse, RunnerFailedRequest},
    processor::NextFileStatus,
};

/// A runner launched by this node.
#[derive(Debug, Clone)]
pub struct LaunchedRunner {
    pub runner_uid: RunnerId,
    pub library_file_uid: LibraryFileId,
    pub params_path: PathBuf,
}

/// Processing node agent: polls the coordinator and launches a runner
/// process for every file it is handed.
pub struct NodeAgent {
    config: NodeConfig,
    node_uid: NodeId,
    client: reqwest::Client,
    base_url: String,
    runners: JoinSet<()>,
}

impl NodeAgent {
    pub fn new(config: NodeConfig) -> Result<Self> {
        let base_url = if config.server_addr.starts_with("http://")
            || config.server_addr.starts_with("https://")
        {
            config.server_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", config.server_addr.trim_end_matches('/'))
        };
        let client = reqwest::Client::builder()
            .build()
            .context("building node http client")?;
        Ok(Self {
            node_uid: NodeId::new(config.node_uid.clone()),
            config,
            client,
            base_url,
            runners: JoinSet::new(),
        })
    }

    fn node_url(&self, path: &str) -> String {
        format!("{}/internal/nodes/{}/{}", self.base_url, self.node_uid, path)
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.temp_path)
            .await
            .with_context(|| {
                format!(
                    "creating temp path {}",
                    self.config.temp_path.display()
                )
            })?;
        info!(
            node_uid = %self.node_uid,
            server = %self.base_url,
            "processing node started"
        );

        loop {
            self.reap();
            let launched = match self.poll_once().await {
                Ok(launched) => launched.is_some(),
                Err(err) => {
                    warn!("failed to poll coordinator: {:?}", err);
                    false
                }
            };
            // Work was handed out, there may be more.
            if launched {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        info!(
            running = self.runners.len(),
            "processing node stopping, runners keep going until they report"
        );
        self.runners.detach_all();
        Ok(())
    }

    fn reap(&mut self) {
        while let Some(result) = self.runners.try_join_next() {
            if let Err(err) = result {
                warn!("runner watcher ended abnormally: {}", err);
            }
        }
    }

    /// Asks for one file and launches a runner for it.
    pub async fn poll_once(&mut self) -> Result<Option<LaunchedRunner>> {
        let response: NextFileResponse = self
            .client
            .post(self.node_url("next_file"))
            .json(&NextFileRequest {
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status != NextFileStatus::Ok {
            debug!(status = %response.status, "no work for this node");
            return Ok(None);
        }
        let (Some(runner_uid), Some(file), Some(library)) =
            (response.runner_uid, response.file, response.library)
        else {
            warn!("coordinator returned an incomplete work item");
            return Ok(None);
        };

        let params = RunnerParameters {
            runner_uid: runner_uid.clone(),
            node_uid: self.node_uid.clone(),
            server_addr: self.base_url.clone(),
            file,
            library,
            flow: response.flow,
            sub_flows: response.sub_flows,
            max_flow_parts: response.max_flow_parts,
            temp_path: self.config.temp_path.clone(),
            mappings: response.mappings,
        };
        let launched = LaunchedRunner {
            runner_uid: runner_uid.clone(),
            library_file_uid: params.file.uid.clone(),
            params_path: self.config.temp_path.join(format!("{runner_uid}.json")),
        };

        if let Err(err) = self.launch(&params, &launched) {
            error!(
                runner_uid = %runner_uid,
                file_uid = %launched.library_file_uid,
                "failed to launch runner: {:?}",
                err
            );
            self.report_runner_failed(&launched, &format!("{err:#}"))
                .await?;
            return Ok(None);
        }
        Ok(Some(launched))
    }

    fn launch(&mut self, params: &RunnerParameters, launched: &LaunchedRunner) -> Result<()> {
        params.save(&launched.params_path)?;
        let executable = self.config.runner_executable()?;
        let mut child = Command::new(&executable)
            .arg("runner")
            .arg("--params")
            .arg(&launched.params_path)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning runner {}", executable.display()))?;
        info!(
            runner_uid = %launched.runner_uid,
            file_uid = %launched.library_file_uid,
            name = %params.file.name,
            "runner launched"
        );

        let launched = launched.clone();
        let span = tracing::info_span!("runner_watch", runner_uid = %launched.runner_uid);
        self.runners.spawn(
            async move {
                match child.wait().await {
                    Ok(status) if status.success() => debug!("runner exited"),
                    Ok(status) => warn!(%status, "runner exited with failure"),
                    Err(err) => warn!("failed waiting for runner: {:?}", err),
                }
                if let Err(err) = tokio::fs::remove_file(&launched.params_path).await {
                    debug!("could not remove runner parameters: {}", err);
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn report_runner_failed(&self, launched: &LaunchedRunner, reason: &str) -> Result<()> {
        self.client
            .post(self.node_url("runner_failed"))
            .json(&RunnerFailedRequest {
                runner_uid: launched.runner_uid.clone(),
                library_file_uid: launched.library_file_uid.clone(),
                reason: reason.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
