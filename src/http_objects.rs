use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    data_model::{
        EffectiveStatus,
        EpochMs,
        ExecutedNode,
        FileFlags,
        FileStatus,
        Flow,
        FlowExecutorInfo,
        Library,
        LibraryFile,
        LibraryFileId,
        LibraryId,
        NodeId,
        PathMapping,
        RunnerId,
    },
    executors::FlowExecution,
    processor::NextFileStatus,
    state_store,
};

#[derive(Debug)]
pub struct FileFlowsAPIError {
    status_code: StatusCode,
    message: String,
}

impl FileFlowsAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for FileFlowsAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<anyhow::Error> for FileFlowsAPIError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<state_store::Error>() {
            Some(
                store_err @ (state_store::Error::FileNotFound { .. }
                | state_store::Error::LibraryNotFound { .. }),
            ) => Self::not_found(&store_err.to_string()),
            Some(store_err @ state_store::Error::NotOwner { .. }) => {
                Self::new(StatusCode::FORBIDDEN, &store_err.to_string())
            }
            Some(store_err @ state_store::Error::InvalidTransition { .. }) => {
                Self::new(StatusCode::CONFLICT, &store_err.to_string())
            }
            None => Self::internal_error(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NextFileRequest {
    #[serde(default)]
    pub version: String,
}

/// Work handed to a node, everything it needs to launch the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextFileResponse {
    pub status: NextFileStatus,
    pub runner_uid: Option<RunnerId>,
    pub file: Option<LibraryFile>,
    pub library: Option<Library>,
    pub flow: Option<Flow>,
    #[serde(default)]
    pub sub_flows: Vec<Flow>,
    pub max_flow_parts: u32,
    /// Path mappings of the polling node.
    #[serde(default)]
    pub mappings: Vec<PathMapping>,
}

impl NextFileResponse {
    pub fn empty(status: NextFileStatus, max_flow_parts: u32) -> Self {
        Self {
            status,
            runner_uid: None,
            file: None,
            library: None,
            flow: None,
            sub_flows: vec![],
            max_flow_parts,
            mappings: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerFailedRequest {
    pub runner_uid: RunnerId,
    pub library_file_uid: LibraryFileId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessageRequest {
    pub library_file_uid: LibraryFileId,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueFileRequest {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub creation_time: EpochMs,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReprocessRequest {
    pub node_uid: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceRequest {
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListFilesParams {
    pub status: Option<FileStatus>,
}

/// A library file as shown to operators, with its effective status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryFileView {
    pub uid: LibraryFileId,
    pub name: String,
    pub library_uid: LibraryId,
    pub status: EffectiveStatus,
    pub flags: FileFlags,
    pub order: u32,
    pub size: u64,
    pub node_uid: Option<NodeId>,
    pub worker_uid: Option<RunnerId>,
    pub process_on_node_uid: Option<NodeId>,
    pub processing_started: Option<EpochMs>,
    pub processing_ended: Option<EpochMs>,
    pub final_size: Option<u64>,
    pub final_fingerprint: Option<String>,
    pub output_path: Option<String>,
    pub failure_reason: Option<String>,
    pub executed_nodes: Vec<ExecutedNode>,
}

impl LibraryFileView {
    pub fn new(file: LibraryFile, status: EffectiveStatus) -> Self {
        Self {
            uid: file.uid,
            name: file.name,
            library_uid: file.library_uid,
            status,
            flags: file.flags,
            order: file.order,
            size: file.size,
            node_uid: file.node_uid,
            worker_uid: file.worker_uid,
            process_on_node_uid: file.process_on_node_uid,
            processing_started: file.processing_started,
            processing_ended: file.processing_ended,
            final_size: file.final_size,
            final_fingerprint: file.final_fingerprint,
            output_path: file.output_path,
            failure_reason: file.failure_reason,
            executed_nodes: file.executed_nodes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryFileList {
    pub files: Vec<LibraryFileView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorView {
    pub library_file_uid: LibraryFileId,
    pub runner_uid: RunnerId,
    pub node_uid: NodeId,
    pub library_uid: LibraryId,
    pub started_at: EpochMs,
    pub last_hello: Option<EpochMs>,
    pub info: Option<FlowExecutorInfo>,
}

impl From<FlowExecution> for ExecutorView {
    fn from(execution: FlowExecution) -> Self {
        Self {
            library_file_uid: execution.library_file_uid,
            runner_uid: execution.runner_uid,
            node_uid: execution.node_uid,
            library_uid: execution.library_uid,
            started_at: execution.started_at,
            last_hello: execution.last_hello,
            info: execution.info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorList {
    pub executors: Vec<ExecutorView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortResponse {
    pub aborted: bool,
}
