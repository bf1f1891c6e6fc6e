use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::data_model::{
    CompletionReport,
    EpochMs,
    FileStatus,
    Flow,
    FlowId,
    Library,
    LibraryFile,
    LibraryFileId,
    LibraryId,
    NodeId,
    ProcessingNode,
    RunnerId,
};

pub mod in_memory_state;

pub use in_memory_state::FileStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    FileNotFound {
        uid: LibraryFileId,
    },
    LibraryNotFound {
        uid: LibraryId,
    },
    NotOwner {
        uid: LibraryFileId,
        runner: RunnerId,
    },
    InvalidTransition {
        uid: LibraryFileId,
        from: FileStatus,
        to: FileStatus,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::FileNotFound { uid } => write!(f, "Library file not found: {uid}"),
            Error::LibraryNotFound { uid } => write!(f, "Library not found: {uid}"),
            Error::NotOwner { uid, runner } => {
                write!(f, "Runner {runner} does not own library file {uid}")
            }
            Error::InvalidTransition { uid, from, to } => {
                write!(f, "Library file {uid} cannot move from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Filters for the next-candidate query of a single poll.
#[derive(Debug, Clone, Default)]
pub struct FileQuery {
    pub node_uid: NodeId,
    /// Libraries the node may serve at all. Forced files only need this.
    pub allowed_libraries: HashSet<LibraryId>,
    /// Allowed libraries that are enabled, in schedule and below their
    /// runner cap. Unforced files need this.
    pub eligible_libraries: HashSet<LibraryId>,
    pub exclude: HashSet<LibraryFileId>,
    pub max_size: Option<u64>,
    /// The node is out of schedule, only forced files qualify.
    pub forced_only: bool,
    pub now_ms: EpochMs,
}

/// The persistence collaborator consumed by the scheduler and runner manager.
#[async_trait]
pub trait FileRepository: Send + Sync {
    /// Best queued file for the query, without claiming it.
    async fn next_candidate(&self, query: &FileQuery) -> Result<Option<LibraryFile>>;

    /// A `ReprocessByFlow` file pinned to `node`.
    async fn sticky_reprocess(
        &self,
        node: &NodeId,
        exclude: &HashSet<LibraryFileId>,
    ) -> Result<Option<LibraryFile>>;

    /// Whether a forced file within `max_size` is waiting for `node`.
    async fn has_forced_files(
        &self,
        node: &NodeId,
        libraries: &HashSet<LibraryId>,
        exclude: &HashSet<LibraryFileId>,
        max_size: Option<u64>,
    ) -> Result<bool>;

    async fn mark_processing(
        &self,
        uid: &LibraryFileId,
        node: &NodeId,
        runner: &RunnerId,
        now_ms: EpochMs,
    ) -> Result<LibraryFile>;

    /// Records the outcome reported by the runner owning the claim.
    async fn set_terminal_status(
        &self,
        uid: &LibraryFileId,
        runner: &RunnerId,
        report: &CompletionReport,
    ) -> Result<LibraryFile>;

    /// Returns a `Processing` file to the queue. When `runner` is given the
    /// reset only applies to that runner's claim. Returns whether anything
    /// changed.
    async fn reset_processing(
        &self,
        uid: &LibraryFileId,
        runner: Option<&RunnerId>,
        status: FileStatus,
    ) -> Result<bool>;

    async fn libraries(&self) -> Result<Vec<Library>>;

    async fn nodes(&self) -> Result<Vec<ProcessingNode>>;

    async fn node(&self, uid: &NodeId) -> Result<Option<ProcessingNode>>;

    /// Stamps `last_seen` and the reported version, returning the node.
    async fn touch_node(
        &self,
        uid: &NodeId,
        version: &str,
        now_ms: EpochMs,
    ) -> Result<Option<ProcessingNode>>;

    async fn flow(&self, uid: &FlowId) -> Result<Option<Flow>>;

    async fn enqueue(
        &self,
        library: &LibraryId,
        name: &str,
        size: u64,
        creation_time: EpochMs,
    ) -> Result<LibraryFile>;

    async fn get(&self, uid: &LibraryFileId) -> Result<Option<LibraryFile>>;

    async fn list(&self, status: Option<FileStatus>) -> Result<Vec<LibraryFile>>;

    async fn set_force(&self, uid: &LibraryFileId, force: bool) -> Result<LibraryFile>;

    async fn reprocess(&self, uid: &LibraryFileId, node: Option<NodeId>) -> Result<LibraryFile>;

    async fn append_log(&self, uid: &LibraryFileId, text: &str) -> Result<()>;

    async fn replace_log(&self, uid: &LibraryFileId, text: &str) -> Result<()>;

    async fn log(&self, uid: &LibraryFileId) -> Result<Option<String>>;
}
