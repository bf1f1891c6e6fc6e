pub mod client;
pub mod completion;
pub mod elements;
pub mod flow_executor;
pub mod heartbeat;
pub mod log;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use strum::Display;
use tokio::{io::AsyncReadExt, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use self::{
    client::CoordinatorClient,
    completion::CompletionReporter,
    elements::ElementContext,
    flow_executor::{FlowExecutor, FlowResult},
    heartbeat::HeartbeatChannel,
    log::RunnerLog,
};
use crate::{
    data_model::{
        map_path,
        CompletionReport,
        ExecutedNode,
        FileStatus,
        FlowExecutorInfo,
        RunnerParameters,
    },
    utils::{get_epoch_time_in_ms, retry::ReconnectPolicy},
};

pub const CANCELED_REASON: &str = "Flow was canceled";
/// Longest wait for queued log batches before the completion report goes out.
pub const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RunnerState {
    Starting,
    Registering,
    Executing,
    Finishing,
    Terminal,
}

/// Outcome of the flow before it is turned into a persisted status.
struct Outcome {
    status: FileStatus,
    failure_reason: Option<String>,
}

impl From<FlowResult> for Outcome {
    fn from(result: FlowResult) -> Self {
        let (status, failure_reason) = match result {
            FlowResult::Completed => (FileStatus::Processed, None),
            FlowResult::Failure(reason) => (FileStatus::ProcessingFailed, Some(reason)),
            FlowResult::Canceled => (FileStatus::ProcessingFailed, Some(CANCELED_REASON.to_string())),
            FlowResult::MappingIssue(reason) => (FileStatus::MappingIssue, Some(reason)),
            FlowResult::FlowNotFound(reason) => (FileStatus::FlowNotFound, Some(reason)),
        };
        Self {
            status,
            failure_reason,
        }
    }
}

/// Executes one claimed file from start to a delivered completion report.
pub struct Runner {
    params: RunnerParameters,
    client: Arc<dyn CoordinatorClient>,
    state_tx: watch::Sender<RunnerState>,
}

impl Runner {
    pub fn new(params: RunnerParameters, client: Arc<dyn CoordinatorClient>) -> Self {
        let (state_tx, _) = watch::channel(RunnerState::Starting);
        Self {
            params,
            client,
            state_tx,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> watch::Receiver<RunnerState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, state: RunnerState) {
        info!(runner_uid = %self.params.runner_uid, %state, "runner state");
        self.state_tx.send_replace(state);
    }

    fn initial_info(&self) -> FlowExecutorInfo {
        let now = get_epoch_time_in_ms();
        FlowExecutorInfo {
            runner_uid: self.params.runner_uid.clone(),
            node_uid: self.params.node_uid.clone(),
            library_file_uid: self.params.file.uid.clone(),
            library_uid: self.params.library.uid.clone(),
            flow_uid: self.params.flow.as_ref().map(|f| f.uid.clone()),
            working_file: self.params.file.name.clone(),
            initial_size: self.params.file.size,
            started_at: now,
            last_update: now,
            ..Default::default()
        }
    }

    fn report_for(&self, outcome: Outcome, log: &RunnerLog) -> CompletionReport {
        CompletionReport {
            library_file_uid: self.params.file.uid.clone(),
            status: outcome.status,
            failure_reason: outcome.failure_reason,
            final_size: None,
            final_fingerprint: None,
            output_path: None,
            executed_nodes: vec![],
            processing_ended: get_epoch_time_in_ms(),
            log: log.contents(),
        }
    }

    /// Runs the file and returns the report that was delivered.
    ///
    /// Returns an error when registration fails (nothing is reported, the
    /// coordinator requeues the file once the runner lapses) or when the
    /// completion report could not be delivered in time.
    #[tracing::instrument(skip(self), fields(runner_uid = %self.params.runner_uid, file_uid = %self.params.file.uid))]
    pub async fn run(self) -> Result<CompletionReport> {
        self.transition(RunnerState::Starting);
        let (log, log_sender) = RunnerLog::streaming(
            self.client.clone(),
            self.params.runner_uid.clone(),
            self.params.file.uid.clone(),
        );
        log.info(&format!("Runner {} starting for {}", self.params.runner_uid, self.params.file.name));

        if let Err(err) = check_paths(&self.params.temp_path).await {
            error!("startup failed: {:?}", err);
            log.error(&format!("{err:#}"));
            let report = self.report_for(
                Outcome {
                    status: FileStatus::ProcessingFailed,
                    failure_reason: Some(format!("{err:#}")),
                },
                &log,
            );
            return self.deliver(report, log, log_sender).await;
        }

        self.transition(RunnerState::Registering);
        let heartbeat = HeartbeatChannel::new(
            self.client.clone(),
            self.params.runner_uid.clone(),
            self.params.file.uid.clone(),
        )
        .with_policy(ReconnectPolicy::default());
        let info = self.initial_info();
        if let Err(err) = heartbeat.register(&info).await {
            error!("failed to register with coordinator: {:?}", err);
            self.transition(RunnerState::Terminal);
            log_sender.abort();
            return Err(err.context("registering runner"));
        }

        self.transition(RunnerState::Executing);
        let (progress_tx, progress_rx) = watch::channel(info);
        let cancel = CancellationToken::new();
        let tasks = heartbeat.start(progress_rx, cancel.clone());

        let (outcome, executed_nodes, working_file) =
            self.execute(&log, progress_tx, cancel).await;

        self.transition(RunnerState::Finishing);
        tasks.stop().await;

        let mut report = self.report_for(outcome, &log);
        report.executed_nodes = executed_nodes;
        if let Some(working_file) = working_file {
            match fingerprint(&working_file).await {
                Ok((size, digest)) => {
                    report.final_size = Some(size);
                    report.final_fingerprint = Some(digest);
                    report.output_path = Some(working_file.display().to_string());
                }
                Err(err) => warn!("could not fingerprint output: {:?}", err),
            }
        }
        self.deliver(report, log, log_sender).await
    }

    async fn execute(
        &self,
        log: &Arc<RunnerLog>,
        progress: watch::Sender<FlowExecutorInfo>,
        cancel: CancellationToken,
    ) -> (Outcome, Vec<ExecutedNode>, Option<PathBuf>) {
        let Some(flow) = self.params.flow.as_ref() else {
            let reason = format!("Flow not found for library {}", self.params.library.name);
            log.error(&reason);
            return (FlowResult::FlowNotFound(reason).into(), vec![], None);
        };

        let working_file = PathBuf::from(map_path(&self.params.mappings, &self.params.file.name));
        if !tokio::fs::try_exists(&working_file).await.unwrap_or(false) {
            let reason = format!("Failed to locate file: {}", working_file.display());
            log.error(&reason);
            return (FlowResult::MappingIssue(reason).into(), vec![], None);
        }
        progress.send_modify(|info| info.working_file = working_file.display().to_string());

        let mut ctx = ElementContext {
            original_file: working_file.clone(),
            working_file,
            log: log.clone(),
            cancel,
            progress,
            failure_reason: None,
        };
        let mut executor = FlowExecutor::new(self.params.sub_flows.clone(), self.params.max_flow_parts);
        let result = executor.execute(flow, &mut ctx).await;
        match &result {
            FlowResult::Completed => log.info("Flow completed"),
            FlowResult::Canceled => log.warn(CANCELED_REASON),
            other => log.error(&format!("Flow ended: {other:?}")),
        }
        info!(
            counted_steps = executor.counted_steps(),
            total_steps = executor.total_steps(),
            executed = executor.executed_nodes().len(),
            "flow finished"
        );
        let output = tokio::fs::try_exists(&ctx.working_file)
            .await
            .unwrap_or(false)
            .then(|| ctx.working_file.clone());
        (result.into(), executor.into_executed_nodes(), output)
    }

    async fn deliver(
        &self,
        report: CompletionReport,
        log: Arc<RunnerLog>,
        mut log_sender: tokio::task::JoinHandle<()>,
    ) -> Result<CompletionReport> {
        log.flush();
        let log_path = self
            .params
            .temp_path
            .join(format!("{}.log", self.params.file.uid));
        if let Err(err) = tokio::fs::write(&log_path, log.contents()).await {
            warn!("failed to write flow log {}: {}", log_path.display(), err);
        }
        // Queued batches go out before the final report. The report carries
        // the full log, so batches still pending at the deadline are dropped.
        drop(log);
        match tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut log_sender).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("flow log sender ended abnormally: {}", err),
            Err(_) => {
                warn!("flow log sender still busy after {:?}, abandoning it", LOG_DRAIN_TIMEOUT);
                log_sender.abort();
            }
        }

        let result = CompletionReporter::new(self.client.clone(), self.params.runner_uid.clone())
            .report(&report)
            .await;
        self.transition(RunnerState::Terminal);
        result?;
        Ok(report)
    }
}

async fn check_paths(temp_path: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(temp_path)
        .await
        .with_context(|| format!("Temp path does not exist: {}", temp_path.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("Temp path is not a directory: {}", temp_path.display());
    }
    Ok(())
}

/// Size and sha256 hex digest of a file.
pub async fn fingerprint(path: &Path) -> Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        size += read as u64;
        hasher.update(&buf[..read]);
    }
    Ok((size, hex::encode(hasher.finalize())))
}
