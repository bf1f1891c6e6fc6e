use std::{
    cmp::{Ordering, Reverse},
    collections::{HashMap, HashSet},
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Error, FileQuery, FileRepository};
use crate::data_model::{
    CompletionReport,
    EpochMs,
    FileFlags,
    FileStatus,
    Flow,
    FlowId,
    Library,
    LibraryFile,
    LibraryFileBuilder,
    LibraryFileId,
    LibraryId,
    NodeId,
    ProcessingNode,
    ProcessingOrder,
    RunnerId,
};

#[derive(Debug, Default)]
struct StoreState {
    libraries: HashMap<LibraryId, Library>,
    nodes: HashMap<NodeId, ProcessingNode>,
    flows: HashMap<FlowId, Flow>,
    files: HashMap<LibraryFileId, LibraryFile>,
    logs: HashMap<LibraryFileId, String>,
}

/// In-memory [`FileRepository`].
#[derive(Debug, Default)]
pub struct FileStore {
    state: RwLock<StoreState>,
}

impl FileStore {
    pub fn new(libraries: Vec<Library>, nodes: Vec<ProcessingNode>, flows: Vec<Flow>) -> Self {
        let state = StoreState {
            libraries: libraries.into_iter().map(|l| (l.uid.clone(), l)).collect(),
            nodes: nodes.into_iter().map(|n| (n.uid.clone(), n)).collect(),
            flows: flows.into_iter().map(|f| (f.uid.clone(), f)).collect(),
            ..Default::default()
        };
        info!(
            libraries = state.libraries.len(),
            nodes = state.nodes.len(),
            flows = state.flows.len(),
            "file store initialized"
        );
        Self {
            state: RwLock::new(state),
        }
    }

    #[cfg(test)]
    pub async fn insert_file(&self, file: LibraryFile) {
        self.state.write().await.files.insert(file.uid.clone(), file);
    }

    #[cfg(test)]
    pub async fn upsert_library(&self, library: Library) {
        self.state
            .write()
            .await
            .libraries
            .insert(library.uid.clone(), library);
    }
}

fn rank(file: &LibraryFile) -> u32 {
    if file.order == 0 {
        u32::MAX
    } else {
        file.order
    }
}

/// Ordering of two files from the same library.
fn compare_in_library(
    order: ProcessingOrder,
    a: &LibraryFile,
    b: &LibraryFile,
    random_keys: &HashMap<LibraryFileId, u64>,
) -> Ordering {
    let by_order = match order {
        ProcessingOrder::Alphabetical => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        ProcessingOrder::Random => random_keys.get(&a.uid).cmp(&random_keys.get(&b.uid)),
        ProcessingOrder::OldestFirst => a.creation_time.cmp(&b.creation_time),
        ProcessingOrder::NewestFirst => b.creation_time.cmp(&a.creation_time),
        ProcessingOrder::AsFound => Ordering::Equal,
        ProcessingOrder::LargestFirst => b.size.cmp(&a.size),
        ProcessingOrder::SmallestFirst => a.size.cmp(&b.size),
    };
    Reverse(a.is_forced())
        .cmp(&Reverse(b.is_forced()))
        .then(rank(a).cmp(&rank(b)))
        .then(by_order)
        .then(a.date_created.cmp(&b.date_created))
        .then_with(|| a.uid.cmp(&b.uid))
}

/// Ordering of the best files of two different libraries.
fn compare_across_libraries(
    a: (&LibraryFile, i32),
    b: (&LibraryFile, i32),
) -> Ordering {
    let (a, a_priority) = a;
    let (b, b_priority) = b;
    Reverse(a.is_forced())
        .cmp(&Reverse(b.is_forced()))
        .then(rank(a).cmp(&rank(b)))
        .then(b_priority.cmp(&a_priority))
        .then(a.date_created.cmp(&b.date_created))
        .then_with(|| a.uid.cmp(&b.uid))
}

impl StoreState {
    fn file_mut(&mut self, uid: &LibraryFileId) -> Result<&mut LibraryFile> {
        self.files
            .get_mut(uid)
            .ok_or_else(|| Error::FileNotFound { uid: uid.clone() }.into())
    }

    fn is_candidate(&self, file: &LibraryFile, query: &FileQuery) -> bool {
        if !file.status.is_queued() || query.exclude.contains(&file.uid) {
            return false;
        }
        if file.is_pinned_elsewhere(&query.node_uid) {
            return false;
        }
        if let Some(max) = query.max_size {
            if file.size > max {
                return false;
            }
        }
        if file.is_forced() {
            return query.allowed_libraries.contains(&file.library_uid);
        }
        !query.forced_only
            && query.eligible_libraries.contains(&file.library_uid)
            && !file.is_on_hold(query.now_ms)
    }
}

#[async_trait]
impl FileRepository for FileStore {
    async fn next_candidate(&self, query: &FileQuery) -> Result<Option<LibraryFile>> {
        let state = self.state.read().await;

        let mut per_library: HashMap<&LibraryId, Vec<&LibraryFile>> = HashMap::new();
        for file in state.files.values() {
            if state.is_candidate(file, query) {
                per_library.entry(&file.library_uid).or_default().push(file);
            }
        }

        let mut heads = Vec::with_capacity(per_library.len());
        for (library_uid, files) in per_library {
            let library = crate::unwrap_or_continue!(state.libraries.get(library_uid));
            let random_keys: HashMap<LibraryFileId, u64> =
                if library.processing_order == ProcessingOrder::Random {
                    files
                        .iter()
                        .map(|f| (f.uid.clone(), rand::random::<u64>()))
                        .collect()
                } else {
                    HashMap::new()
                };
            let head = files.into_iter().min_by(|a, b| {
                compare_in_library(library.processing_order, a, b, &random_keys)
            });
            if let Some(head) = head {
                heads.push((head, library.priority));
            }
        }

        let best = heads
            .into_iter()
            .min_by(|a, b| compare_across_libraries(*a, *b))
            .map(|(file, _)| file.clone());
        Ok(best)
    }

    async fn sticky_reprocess(
        &self,
        node: &NodeId,
        exclude: &HashSet<LibraryFileId>,
    ) -> Result<Option<LibraryFile>> {
        let state = self.state.read().await;
        Ok(state
            .files
            .values()
            .filter(|f| {
                f.status == FileStatus::ReprocessByFlow
                    && f.is_sticky_to(node)
                    && !exclude.contains(&f.uid)
            })
            .min_by(|a, b| {
                a.date_created
                    .cmp(&b.date_created)
                    .then_with(|| a.uid.cmp(&b.uid))
            })
            .cloned())
    }

    async fn has_forced_files(
        &self,
        node: &NodeId,
        libraries: &HashSet<LibraryId>,
        exclude: &HashSet<LibraryFileId>,
        max_size: Option<u64>,
    ) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.files.values().any(|f| {
            f.status.is_queued()
                && f.is_forced()
                && libraries.contains(&f.library_uid)
                && !f.is_pinned_elsewhere(node)
                && !exclude.contains(&f.uid)
                && max_size.map_or(true, |max| f.size <= max)
        }))
    }

    async fn mark_processing(
        &self,
        uid: &LibraryFileId,
        node: &NodeId,
        runner: &RunnerId,
        now_ms: EpochMs,
    ) -> Result<LibraryFile> {
        let mut state = self.state.write().await;
        let file = state.file_mut(uid)?;
        if !file.status.is_queued() {
            return Err(Error::InvalidTransition {
                uid: uid.clone(),
                from: file.status,
                to: FileStatus::Processing,
            }
            .into());
        }
        file.status = FileStatus::Processing;
        file.node_uid = Some(node.clone());
        file.worker_uid = Some(runner.clone());
        file.processing_started = Some(now_ms);
        file.processing_ended = None;
        file.failure_reason = None;
        debug!(file_uid = %uid, node_uid = %node, runner_uid = %runner, "file marked processing");
        Ok(file.clone())
    }

    async fn set_terminal_status(
        &self,
        uid: &LibraryFileId,
        runner: &RunnerId,
        report: &CompletionReport,
    ) -> Result<LibraryFile> {
        let mut state = self.state.write().await;
        let file = state.file_mut(uid)?;
        if file.worker_uid.as_ref() != Some(runner) {
            return Err(Error::NotOwner {
                uid: uid.clone(),
                runner: runner.clone(),
            }
            .into());
        }
        if file.status == report.status {
            return Ok(file.clone());
        }
        if file.status != FileStatus::Processing || !report.status.is_terminal() {
            return Err(Error::InvalidTransition {
                uid: uid.clone(),
                from: file.status,
                to: report.status,
            }
            .into());
        }
        file.status = report.status;
        file.failure_reason = report.failure_reason.clone();
        file.final_size = report.final_size;
        file.final_fingerprint = report.final_fingerprint.clone();
        file.output_path = report.output_path.clone();
        file.executed_nodes = report.executed_nodes.clone();
        file.processing_ended = Some(report.processing_ended);
        file.flags.remove(FileFlags::FORCE_PROCESSING);
        file.process_on_node_uid = None;
        Ok(file.clone())
    }

    async fn reset_processing(
        &self,
        uid: &LibraryFileId,
        runner: Option<&RunnerId>,
        status: FileStatus,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let file = state.file_mut(uid)?;
        if file.status != FileStatus::Processing {
            return Ok(false);
        }
        if let Some(runner) = runner {
            if file.worker_uid.as_ref() != Some(runner) {
                return Ok(false);
            }
        }
        if !status.is_queued() {
            return Err(Error::InvalidTransition {
                uid: uid.clone(),
                from: file.status,
                to: status,
            }
            .into());
        }
        file.status = status;
        file.node_uid = None;
        file.worker_uid = None;
        file.processing_started = None;
        Ok(true)
    }

    async fn libraries(&self) -> Result<Vec<Library>> {
        Ok(self.state.read().await.libraries.values().cloned().collect())
    }

    async fn nodes(&self) -> Result<Vec<ProcessingNode>> {
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }

    async fn node(&self, uid: &NodeId) -> Result<Option<ProcessingNode>> {
        Ok(self.state.read().await.nodes.get(uid).cloned())
    }

    async fn touch_node(
        &self,
        uid: &NodeId,
        version: &str,
        now_ms: EpochMs,
    ) -> Result<Option<ProcessingNode>> {
        let mut state = self.state.write().await;
        let Some(node) = state.nodes.get_mut(uid) else {
            return Ok(None);
        };
        node.last_seen = now_ms;
        if !version.is_empty() {
            node.version = version.to_string();
        }
        Ok(Some(node.clone()))
    }

    async fn flow(&self, uid: &FlowId) -> Result<Option<Flow>> {
        Ok(self.state.read().await.flows.get(uid).cloned())
    }

    async fn enqueue(
        &self,
        library: &LibraryId,
        name: &str,
        size: u64,
        creation_time: EpochMs,
    ) -> Result<LibraryFile> {
        let mut state = self.state.write().await;
        let Some(lib) = state.libraries.get(library) else {
            return Err(Error::LibraryNotFound {
                uid: library.clone(),
            }
            .into());
        };
        let now = crate::utils::get_epoch_time_in_ms();
        let hold_until = if lib.hold_minutes > 0 {
            now + u64::from(lib.hold_minutes) * 60_000
        } else {
            0
        };
        let file = LibraryFileBuilder::default()
            .name(name)
            .library_uid(library.clone())
            .flow_uid(lib.flow_uid.clone())
            .size(size)
            .creation_time(creation_time)
            .date_created(now)
            .hold_until(hold_until)
            .build()?;
        state.files.insert(file.uid.clone(), file.clone());
        info!(file_uid = %file.uid, library_uid = %library, "file enqueued");
        Ok(file)
    }

    async fn get(&self, uid: &LibraryFileId) -> Result<Option<LibraryFile>> {
        Ok(self.state.read().await.files.get(uid).cloned())
    }

    async fn list(&self, status: Option<FileStatus>) -> Result<Vec<LibraryFile>> {
        let state = self.state.read().await;
        let mut files: Vec<LibraryFile> = state
            .files
            .values()
            .filter(|f| status.map_or(true, |s| s == f.status))
            .cloned()
            .collect();
        files.sort_by(|a, b| {
            a.date_created
                .cmp(&b.date_created)
                .then_with(|| a.uid.cmp(&b.uid))
        });
        Ok(files)
    }

    async fn set_force(&self, uid: &LibraryFileId, force: bool) -> Result<LibraryFile> {
        let mut state = self.state.write().await;
        let file = state.file_mut(uid)?;
        if force {
            file.flags.insert(FileFlags::FORCE_PROCESSING);
        } else {
            file.flags.remove(FileFlags::FORCE_PROCESSING);
        }
        Ok(file.clone())
    }

    async fn reprocess(&self, uid: &LibraryFileId, node: Option<NodeId>) -> Result<LibraryFile> {
        let mut state = self.state.write().await;
        let file = state.file_mut(uid)?;
        if file.status == FileStatus::Processing {
            return Err(Error::InvalidTransition {
                uid: uid.clone(),
                from: file.status,
                to: FileStatus::ReprocessByFlow,
            }
            .into());
        }
        file.status = FileStatus::ReprocessByFlow;
        file.process_on_node_uid = node;
        file.hold_until = 0;
        file.node_uid = None;
        file.worker_uid = None;
        file.processing_started = None;
        file.processing_ended = None;
        file.failure_reason = None;
        file.executed_nodes.clear();
        let file = file.clone();
        state.logs.remove(uid);
        Ok(file)
    }

    async fn append_log(&self, uid: &LibraryFileId, text: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.files.contains_key(uid) {
            return Err(Error::FileNotFound { uid: uid.clone() }.into());
        }
        state.logs.entry(uid.clone()).or_default().push_str(text);
        Ok(())
    }

    async fn replace_log(&self, uid: &LibraryFileId, text: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.files.contains_key(uid) {
            return Err(Error::FileNotFound { uid: uid.clone() }.into());
        }
        state.logs.insert(uid.clone(), text.to_string());
        Ok(())
    }

    async fn log(&self, uid: &LibraryFileId) -> Result<Option<String>> {
        Ok(self.state.read().await.logs.get(uid).cloned())
    }
}
