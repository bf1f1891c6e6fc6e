use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use dashmap::{mapref::entry::Entry, DashMap};
use priority_queue::PriorityQueue;
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch, Notify, RwLock},
    time::Instant,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    data_model::{
        CompletionReport,
        EpochMs,
        FileStatus,
        FlowExecutorInfo,
        LibraryFile,
        LibraryFileId,
        LibraryId,
        NodeId,
        RunnerId,
        RunnerMessage,
    },
    state_store::FileRepository,
    utils::get_epoch_time_in_ms,
};

/// Wrapper for `tokio::time::Instant` that reverses the ordering for deadline.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReverseInstant(pub Instant);

impl Ord for ReverseInstant {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

impl PartialOrd for ReverseInstant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A file that has been claimed by a node and is owned by one runner.
#[derive(Debug, Clone, Serialize)]
pub struct FlowExecution {
    pub library_file_uid: LibraryFileId,
    pub runner_uid: RunnerId,
    pub node_uid: NodeId,
    pub library_uid: LibraryId,
    pub started_at: EpochMs,
    pub last_hello: Option<EpochMs>,
    pub info: Option<FlowExecutorInfo>,
}

/// Process-wide table of in-flight files.
///
/// Insertion is atomic per file, so two concurrent claims of the same file
/// can never both register.
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    executions: DashMap<LibraryFileId, FlowExecution>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the execution unless the file is already in flight.
    pub fn try_register(&self, execution: FlowExecution) -> bool {
        match self.executions.entry(execution.library_file_uid.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(execution);
                true
            }
        }
    }

    pub fn remove(&self, file: &LibraryFileId) -> Option<FlowExecution> {
        self.executions.remove(file).map(|(_, execution)| execution)
    }

    /// Removes the file only while it is still owned by `runner`.
    pub fn remove_owned(&self, file: &LibraryFileId, runner: &RunnerId) -> Option<FlowExecution> {
        self.executions
            .remove_if(file, |_, execution| &execution.runner_uid == runner)
            .map(|(_, execution)| execution)
    }

    pub fn get(&self, file: &LibraryFileId) -> Option<FlowExecution> {
        self.executions.get(file).map(|e| e.value().clone())
    }

    pub fn find_by_runner(&self, runner: &RunnerId) -> Option<FlowExecution> {
        self.executions
            .iter()
            .find(|e| &e.runner_uid == runner)
            .map(|e| e.value().clone())
    }

    pub fn contains(&self, file: &LibraryFileId) -> bool {
        self.executions.contains_key(file)
    }

    pub fn in_flight(&self) -> HashSet<LibraryFileId> {
        self.executions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count_for_node(&self, node: &NodeId) -> u32 {
        self.executions
            .iter()
            .filter(|e| &e.node_uid == node)
            .count() as u32
    }

    #[cfg(test)]
    pub fn count_for_library(&self, library: &LibraryId) -> u32 {
        self.executions
            .iter()
            .filter(|e| &e.library_uid == library)
            .count() as u32
    }

    pub fn counts_by_node(&self) -> HashMap<NodeId, u32> {
        let mut counts = HashMap::new();
        for execution in self.executions.iter() {
            *counts.entry(execution.node_uid.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn counts_by_library(&self) -> HashMap<LibraryId, u32> {
        let mut counts = HashMap::new();
        for execution in self.executions.iter() {
            *counts.entry(execution.library_uid.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Stores the snapshot from a runner hello. Returns false when the runner
    /// owns nothing.
    pub fn update_info(&self, runner: &RunnerId, info: FlowExecutorInfo, now_ms: EpochMs) -> bool {
        for mut execution in self.executions.iter_mut() {
            if &execution.runner_uid == runner {
                execution.last_hello = Some(now_ms);
                execution.info = Some(info);
                return true;
            }
        }
        false
    }

    pub fn list(&self) -> Vec<FlowExecution> {
        let mut executions: Vec<FlowExecution> =
            self.executions.iter().map(|e| e.value().clone()).collect();
        executions.sort_by_key(|e| e.started_at);
        executions
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

/// Nodes that may not be handed work until an expiry timestamp.
#[derive(Debug, Default)]
pub struct NodeBlacklist {
    entries: DashMap<NodeId, EpochMs>,
}

impl NodeBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_until(&self, node: &NodeId, until_ms: EpochMs) {
        self.entries.insert(node.clone(), until_ms);
    }

    pub fn is_blocked(&self, node: &NodeId, now_ms: EpochMs) -> bool {
        let blocked = self
            .entries
            .get(node)
            .map(|until| *until > now_ms)
            .unwrap_or(false);
        if !blocked {
            self.entries.remove_if(node, |_, until| *until <= now_ms);
        }
        blocked
    }
}

/// Represents the possible outcomes of waiting in the liveness monitor
enum WaitResult {
    Deadline,
    Notified,
    Shutdown,
}

/// Coordinator side of the runner protocol.
pub struct RunnerManager {
    pub registry: Arc<ExecutorRegistry>,
    pub blacklist: Arc<NodeBlacklist>,
    repository: Arc<dyn FileRepository>,
    heartbeat_state: RwLock<PriorityQueue<RunnerId, ReverseInstant>>,
    /// Used to wake the monitor only when necessary
    notify: Arc<Notify>,
    runner_timeout: Duration,
    runner_failure_pause: Duration,
    events_tx: broadcast::Sender<RunnerMessage>,
}

impl RunnerManager {
    pub fn new(
        repository: Arc<dyn FileRepository>,
        registry: Arc<ExecutorRegistry>,
        blacklist: Arc<NodeBlacklist>,
        runner_timeout: Duration,
        runner_failure_pause: Duration,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(100);
        Self {
            registry,
            blacklist,
            repository,
            heartbeat_state: RwLock::new(PriorityQueue::new()),
            notify: Arc::new(Notify::new()),
            runner_timeout,
            runner_failure_pause,
            events_tx,
        }
    }

    /// Starts the liveness deadline for a freshly claimed runner.
    pub async fn track(&self, runner: &RunnerId) {
        let was_empty = {
            let new_deadline = ReverseInstant(Instant::now() + self.runner_timeout);
            let mut state = self.heartbeat_state.write().await;
            let was_empty = state.is_empty();
            if state.change_priority(runner, new_deadline).is_none() {
                state.push(runner.clone(), new_deadline);
            }
            was_empty
        };
        if was_empty {
            self.notify.notify_one();
        }
    }

    async fn untrack(&self, runner: &RunnerId) {
        self.heartbeat_state.write().await.remove(runner);
    }

    #[tracing::instrument(skip(self, info), fields(runner_uid = %runner))]
    pub async fn hello(&self, runner: &RunnerId, info: FlowExecutorInfo) -> Result<bool> {
        if !self
            .registry
            .update_info(runner, info, get_epoch_time_in_ms())
        {
            debug!("hello from unknown runner");
            return Ok(false);
        }
        trace!("hello received");
        self.track(runner).await;
        Ok(true)
    }

    pub async fn log_message(
        &self,
        runner: &RunnerId,
        file: &LibraryFileId,
        text: &str,
    ) -> Result<()> {
        match self.registry.get(file) {
            Some(execution) if &execution.runner_uid == runner => {
                self.repository.append_log(file, text).await
            }
            _ => {
                debug!(runner_uid = %runner, file_uid = %file, "dropping log from non-owner");
                Ok(())
            }
        }
    }

    #[tracing::instrument(skip(self, report), fields(runner_uid = %runner, file_uid = %report.library_file_uid))]
    pub async fn finish(&self, runner: &RunnerId, report: CompletionReport) -> Result<LibraryFile> {
        let file = self
            .repository
            .set_terminal_status(&report.library_file_uid, runner, &report)
            .await?;
        if !report.log.is_empty() {
            self.repository
                .replace_log(&report.library_file_uid, &report.log)
                .await?;
        }
        self.registry.remove_owned(&report.library_file_uid, runner);
        self.untrack(runner).await;
        info!(status = %file.status, "runner finished");
        Ok(file)
    }

    /// Pushes an abort to the runner owning `file`. Returns false when the
    /// file is not in flight.
    pub fn abort(&self, file: &LibraryFileId) -> bool {
        if !self.registry.contains(file) {
            return false;
        }
        let message = RunnerMessage::AbortFlow {
            library_file_uid: file.clone(),
        };
        if let Err(err) = self.events_tx.send(message) {
            warn!(file_uid = %file, "no runner connected to receive abort: {}", err);
        }
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerMessage> {
        self.events_tx.subscribe()
    }

    /// A node could not launch the runner for a claimed file.
    pub async fn runner_failed(
        &self,
        node: &NodeId,
        runner: &RunnerId,
        file: &LibraryFileId,
        reason: &str,
    ) -> Result<()> {
        warn!(node_uid = %node, runner_uid = %runner, file_uid = %file, reason, "runner failed to start");
        let until = get_epoch_time_in_ms() + self.runner_failure_pause.as_millis() as u64;
        self.blacklist.block_until(node, until);
        self.release(file, runner).await
    }

    /// Drops the claim of `runner` on `file` and puts the file back in the queue.
    async fn release(&self, file: &LibraryFileId, runner: &RunnerId) -> Result<()> {
        self.registry.remove_owned(file, runner);
        self.untrack(runner).await;
        let status = self.requeue_status(file).await?;
        self.repository
            .reset_processing(file, Some(runner), status)
            .await?;
        Ok(())
    }

    async fn requeue_status(&self, file: &LibraryFileId) -> Result<FileStatus> {
        let sticky = self
            .repository
            .get(file)
            .await?
            .is_some_and(|f| f.process_on_node_uid.is_some());
        Ok(if sticky {
            FileStatus::ReprocessByFlow
        } else {
            FileStatus::Unprocessed
        })
    }

    /// Resets files left in `Processing` that no runner owns.
    pub async fn sweep_orphaned(&self) -> Result<usize> {
        let mut reset = 0;
        for file in self.repository.list(Some(FileStatus::Processing)).await? {
            if self.registry.contains(&file.uid) {
                continue;
            }
            let status = self.requeue_status(&file.uid).await?;
            if self
                .repository
                .reset_processing(&file.uid, None, status)
                .await?
            {
                info!(file_uid = %file.uid, "reset orphaned processing file");
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn wait_for_deadline(&self, shutdown_rx: &mut watch::Receiver<()>) -> WaitResult {
        let next_deadline = {
            let state = self.heartbeat_state.read().await;
            state.peek().map(|(_, deadline)| deadline.0)
        };

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => WaitResult::Deadline,
                    _ = self.notify.notified() => WaitResult::Notified,
                    _ = shutdown_rx.changed() => WaitResult::Shutdown,
                }
            }
            None => {
                tokio::select! {
                    _ = self.notify.notified() => WaitResult::Notified,
                    _ = shutdown_rx.changed() => WaitResult::Shutdown,
                }
            }
        }
    }

    /// Resets the files of runners that stopped saying hello.
    pub async fn start_liveness_monitor(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            match self.wait_for_deadline(&mut shutdown_rx).await {
                WaitResult::Deadline => {
                    if let Err(err) = self.process_lapsed_runners().await {
                        error!("failed to process lapsed runners: {:?}", err);
                    }
                }
                WaitResult::Notified => continue,
                WaitResult::Shutdown => {
                    trace!("liveness monitor shutting down");
                    break;
                }
            }
        }
    }

    pub async fn process_lapsed_runners(&self) -> Result<()> {
        let now = Instant::now();
        let mut lapsed = Vec::new();
        {
            let mut state = self.heartbeat_state.write().await;
            while let Some((_, deadline)) = state.peek() {
                if deadline.0 > now {
                    break;
                }
                match state.pop() {
                    Some((runner, _)) => lapsed.push(runner),
                    None => break,
                }
            }
        }

        for runner in lapsed {
            let Some(execution) = self.registry.find_by_runner(&runner) else {
                continue;
            };
            warn!(
                runner_uid = %runner,
                file_uid = %execution.library_file_uid,
                "runner lapsed, requeueing file"
            );
            self.release(&execution.library_file_uid, &runner).await?;
        }
        Ok(())
    }
}
