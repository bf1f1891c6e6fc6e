use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::arbitration::{should_defer, ArbitrationContext};
use crate::{
    data_model::{
        Flow,
        FlowId,
        Library,
        LibraryFile,
        LibraryId,
        NodeId,
        ProcessingNode,
        RunnerId,
    },
    executors::{FlowExecution, RunnerManager},
    state_store::{FileQuery, FileRepository},
    utils::is_version_compatible,
};

/// Outcome of a node poll. Every admission failure is a status, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum NextFileStatus {
    Ok,
    NoFile,
    NodeNotFound,
    NodeDisabled,
    NodePaused,
    OutOfSchedule,
    VersionMismatch,
    MaxedOut,
}

#[derive(Debug, Clone)]
pub struct NextFile {
    pub status: NextFileStatus,
    pub file: Option<LibraryFile>,
    pub runner_uid: Option<RunnerId>,
}

impl NextFile {
    fn status(status: NextFileStatus) -> Self {
        Self {
            status,
            file: None,
            runner_uid: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectorSettings {
    pub server_version: String,
    pub node_stale_after: Duration,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            node_stale_after: Duration::from_secs(600),
        }
    }
}

/// Matches queued files to polling nodes.
///
/// Every poll runs behind one admission lock, so a file can only be claimed
/// by one poll and the claim is visible to the next poll.
pub struct FileSelector {
    repository: Arc<dyn FileRepository>,
    runner_manager: Arc<RunnerManager>,
    settings: SelectorSettings,
    admission: Mutex<()>,
}

impl FileSelector {
    pub fn new(
        repository: Arc<dyn FileRepository>,
        runner_manager: Arc<RunnerManager>,
        settings: SelectorSettings,
    ) -> Self {
        Self {
            repository,
            runner_manager,
            settings,
            admission: Mutex::new(()),
        }
    }

    pub async fn select_next(&self, node_uid: &NodeId, node_version: &str) -> NextFile {
        self.select_next_at(node_uid, node_version, &Local::now())
            .await
    }

    #[tracing::instrument(skip(self, now), fields(node_uid = %node_uid))]
    pub async fn select_next_at<Tz>(
        &self,
        node_uid: &NodeId,
        node_version: &str,
        now: &DateTime<Tz>,
    ) -> NextFile
    where
        Tz: TimeZone + Send + Sync,
        Tz::Offset: Send + Sync,
    {
        let _admission = self.admission.lock().await;
        match self.select_locked(node_uid, node_version, now).await {
            Ok(next) => next,
            Err(err) => {
                error!("failed to select next file: {:?}", err);
                NextFile::status(NextFileStatus::NoFile)
            }
        }
    }

    async fn select_locked<Tz>(
        &self,
        node_uid: &NodeId,
        node_version: &str,
        now: &DateTime<Tz>,
    ) -> Result<NextFile>
    where
        Tz: TimeZone + Send + Sync,
        Tz::Offset: Send + Sync,
    {
        let now_ms = now.timestamp_millis().max(0) as u64;
        let registry = &self.runner_manager.registry;

        let Some(node) = self
            .repository
            .touch_node(node_uid, node_version, now_ms)
            .await?
        else {
            return Ok(NextFile::status(NextFileStatus::NodeNotFound));
        };
        if !node.enabled {
            return Ok(NextFile::status(NextFileStatus::NodeDisabled));
        }
        if !is_version_compatible(&node.version, &self.settings.server_version) {
            return Ok(NextFile::status(NextFileStatus::VersionMismatch));
        }
        if self.runner_manager.blacklist.is_blocked(&node.uid, now_ms) {
            return Ok(NextFile::status(NextFileStatus::NodePaused));
        }
        if registry.count_for_node(&node.uid) >= node.flow_runners {
            return Ok(NextFile::status(NextFileStatus::MaxedOut));
        }

        let in_flight = registry.in_flight();
        let libraries = self.repository.libraries().await?;
        let (allowed, eligible) = library_sets(&node, &libraries, &registry.counts_by_library(), now);

        let node_in_schedule = node.is_in_schedule(now);
        if !node_in_schedule
            && !self
                .repository
                .has_forced_files(&node.uid, &allowed, &in_flight, node.max_file_size_bytes())
                .await?
        {
            return Ok(NextFile::status(NextFileStatus::OutOfSchedule));
        }

        if let Some(file) = self
            .repository
            .sticky_reprocess(&node.uid, &in_flight)
            .await?
        {
            debug!(file_uid = %file.uid, "returning sticky reprocess file");
            return self.claim(&node, file, now_ms).await;
        }

        let query = FileQuery {
            node_uid: node.uid.clone(),
            allowed_libraries: allowed,
            eligible_libraries: eligible,
            exclude: in_flight,
            max_size: node.max_file_size_bytes(),
            forced_only: !node_in_schedule,
            now_ms,
        };
        let Some(candidate) = self.repository.next_candidate(&query).await? else {
            return Ok(NextFile::status(NextFileStatus::NoFile));
        };

        if !candidate.is_sticky_to(&node.uid) {
            let nodes = self.repository.nodes().await?;
            let counts = registry.counts_by_node();
            let ctx = ArbitrationContext {
                now,
                now_ms,
                server_version: &self.settings.server_version,
                stale_after_ms: self.settings.node_stale_after.as_millis() as u64,
                runner_counts: &counts,
                blacklist: &self.runner_manager.blacklist,
            };
            if should_defer(&node, &candidate, &nodes, &ctx) {
                debug!(file_uid = %candidate.uid, "deferring file to a better placed node");
                return Ok(NextFile::status(NextFileStatus::NoFile));
            }
        }

        self.claim(&node, candidate, now_ms).await
    }

    /// Registers the file in flight and flips it to `Processing` before the
    /// admission lock is released.
    async fn claim(
        &self,
        node: &ProcessingNode,
        file: LibraryFile,
        now_ms: u64,
    ) -> Result<NextFile> {
        let runner_uid = RunnerId::generate();
        let registered = self.runner_manager.registry.try_register(FlowExecution {
            library_file_uid: file.uid.clone(),
            runner_uid: runner_uid.clone(),
            node_uid: node.uid.clone(),
            library_uid: file.library_uid.clone(),
            started_at: now_ms,
            last_hello: None,
            info: None,
        });
        if !registered {
            return Ok(NextFile::status(NextFileStatus::NoFile));
        }
        let claimed = match self
            .repository
            .mark_processing(&file.uid, &node.uid, &runner_uid, now_ms)
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                self.runner_manager.registry.remove(&file.uid);
                return Err(err);
            }
        };
        self.runner_manager.track(&runner_uid).await;
        info!(
            file_uid = %claimed.uid,
            node_uid = %node.uid,
            runner_uid = %runner_uid,
            "file claimed"
        );
        Ok(NextFile {
            status: NextFileStatus::Ok,
            file: Some(claimed),
            runner_uid: Some(runner_uid),
        })
    }

    /// Resolves a flow and every sub-flow it references, transitively.
    pub async fn resolve_flows(&self, flow_uid: &FlowId) -> Result<(Option<Flow>, Vec<Flow>)> {
        let Some(flow) = self.repository.flow(flow_uid).await? else {
            return Ok((None, vec![]));
        };
        let mut seen: HashSet<FlowId> = HashSet::from([flow.uid.clone()]);
        let mut pending = flow.sub_flow_uids();
        let mut sub_flows = Vec::new();
        while let Some(uid) = pending.pop() {
            if !seen.insert(uid.clone()) {
                continue;
            }
            if let Some(sub_flow) = self.repository.flow(&uid).await? {
                pending.extend(sub_flow.sub_flow_uids());
                sub_flows.push(sub_flow);
            }
        }
        Ok((Some(flow), sub_flows))
    }
}

/// Splits the libraries a node may serve into the set forced files may come
/// from and the set ordinary files may come from.
fn library_sets<Tz: TimeZone>(
    node: &ProcessingNode,
    libraries: &[Library],
    active: &HashMap<LibraryId, u32>,
    now: &DateTime<Tz>,
) -> (HashSet<LibraryId>, HashSet<LibraryId>) {
    let mut allowed = HashSet::new();
    let mut eligible = HashSet::new();
    for library in libraries {
        if !node.libraries.allows(&library.uid) {
            continue;
        }
        allowed.insert(library.uid.clone());
        let running = active.get(&library.uid).copied().unwrap_or(0);
        let under_cap = library.max_runners == 0 || running < library.max_runners;
        if library.enabled && library.is_in_schedule(now) && under_cap {
            eligible.insert(library.uid.clone());
        }
    }
    (allowed, eligible)
}
