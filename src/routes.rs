use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse,
        Sse,
    },
    routing::{get, post},
    Json,
    Router,
};
use chrono::Local;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::{
    data_model::{
        CompletionReport,
        FlowExecutorInfo,
        LibraryFile,
        LibraryFileId,
        LibraryId,
        NodeId,
        RunnerId,
        RunnerMessage,
    },
    executors::RunnerManager,
    http_objects::{
        AbortResponse,
        EnqueueFileRequest,
        ExecutorList,
        FileFlowsAPIError,
        ForceRequest,
        HelloResponse,
        LibraryFileList,
        LibraryFileView,
        ListFilesParams,
        LogMessageRequest,
        NextFileRequest,
        NextFileResponse,
        ReprocessRequest,
        RunnerFailedRequest,
    },
    processor::{FileSelector, NextFileStatus},
    state_store::FileRepository,
};

#[derive(Clone)]
pub struct RouteState {
    pub repository: Arc<dyn FileRepository>,
    pub selector: Arc<FileSelector>,
    pub runner_manager: Arc<RunnerManager>,
    pub max_flow_parts: u32,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/internal/nodes/{node}/next_file", post(next_file))
        .route("/internal/nodes/{node}/runner_failed", post(runner_failed))
        .route("/internal/runners/{runner}/hello", post(hello))
        .route("/internal/runners/{runner}/log", post(log_message))
        .route("/internal/runners/{runner}/finish", post(finish))
        .route("/internal/runners/{runner}/events", get(runner_events))
        .route("/v1/libraries/{library}/files", post(enqueue_file))
        .route("/v1/files", get(list_files))
        .route("/v1/files/{file}", get(get_file))
        .route("/v1/files/{file}/log", get(get_file_log))
        .route("/v1/files/{file}/abort", post(abort_file))
        .route("/v1/files/{file}/reprocess", post(reprocess_file))
        .route("/v1/files/{file}/force", post(force_file))
        .route("/v1/executors", get(list_executors))
        .with_state(route_state)
}

async fn index() -> &'static str {
    "FileFlows coordinator"
}

async fn file_view(
    repository: &dyn FileRepository,
    file: LibraryFile,
) -> Result<LibraryFileView, FileFlowsAPIError> {
    let libraries = repository.libraries().await?;
    let library = libraries.iter().find(|l| l.uid == file.library_uid);
    let status = file.effective_status(library, &Local::now());
    Ok(LibraryFileView::new(file, status))
}

#[tracing::instrument(skip(state, request))]
async fn next_file(
    Path(node): Path<NodeId>,
    State(state): State<RouteState>,
    Json(request): Json<NextFileRequest>,
) -> Result<Json<NextFileResponse>, FileFlowsAPIError> {
    let next = state.selector.select_next(&node, &request.version).await;
    let (NextFileStatus::Ok, Some(file), Some(runner_uid)) =
        (next.status, next.file, next.runner_uid)
    else {
        return Ok(Json(NextFileResponse::empty(next.status, state.max_flow_parts)));
    };

    let libraries = state.repository.libraries().await?;
    let library = libraries.into_iter().find(|l| l.uid == file.library_uid);
    let flow_uid = file
        .flow_uid
        .clone()
        .or_else(|| library.as_ref().and_then(|l| l.flow_uid.clone()));
    let (flow, sub_flows) = match flow_uid {
        Some(flow_uid) => state.selector.resolve_flows(&flow_uid).await?,
        None => (None, vec![]),
    };
    let mappings = state
        .repository
        .node(&node)
        .await?
        .map(|n| n.mappings)
        .unwrap_or_default();
    Ok(Json(NextFileResponse {
        status: NextFileStatus::Ok,
        runner_uid: Some(runner_uid),
        file: Some(file),
        library,
        flow,
        sub_flows,
        max_flow_parts: state.max_flow_parts,
        mappings,
    }))
}

async fn runner_failed(
    Path(node): Path<NodeId>,
    State(state): State<RouteState>,
    Json(request): Json<RunnerFailedRequest>,
) -> Result<StatusCode, FileFlowsAPIError> {
    state
        .runner_manager
        .runner_failed(
            &node,
            &request.runner_uid,
            &request.library_file_uid,
            &request.reason,
        )
        .await?;
    Ok(StatusCode::OK)
}

async fn hello(
    Path(runner): Path<RunnerId>,
    State(state): State<RouteState>,
    Json(info): Json<FlowExecutorInfo>,
) -> Result<Json<HelloResponse>, FileFlowsAPIError> {
    let accepted = state.runner_manager.hello(&runner, info).await?;
    Ok(Json(HelloResponse { accepted }))
}

async fn log_message(
    Path(runner): Path<RunnerId>,
    State(state): State<RouteState>,
    Json(request): Json<LogMessageRequest>,
) -> Result<StatusCode, FileFlowsAPIError> {
    state
        .runner_manager
        .log_message(&runner, &request.library_file_uid, &request.text)
        .await?;
    Ok(StatusCode::OK)
}

async fn finish(
    Path(runner): Path<RunnerId>,
    State(state): State<RouteState>,
    Json(report): Json<CompletionReport>,
) -> Result<Json<LibraryFileView>, FileFlowsAPIError> {
    let file = state.runner_manager.finish(&runner, report).await?;
    Ok(Json(file_view(state.repository.as_ref(), file).await?))
}

async fn runner_events(
    Path(runner): Path<RunnerId>,
    State(state): State<RouteState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    debug!(runner_uid = %runner, "runner subscribed to events");
    let mut rx = state.runner_manager.subscribe();
    let registry = state.runner_manager.registry.clone();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let RunnerMessage::AbortFlow { library_file_uid } = &message;
                    let owned = registry
                        .get(library_file_uid)
                        .is_some_and(|execution| execution.runner_uid == runner);
                    if owned {
                        yield Event::default().json_data(&message);
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(1))
            .text("keep-alive-text"),
    )
}

async fn enqueue_file(
    Path(library): Path<LibraryId>,
    State(state): State<RouteState>,
    Json(request): Json<EnqueueFileRequest>,
) -> Result<Json<LibraryFileView>, FileFlowsAPIError> {
    if request.name.trim().is_empty() {
        return Err(FileFlowsAPIError::bad_request("file name must not be empty"));
    }
    let file = state
        .repository
        .enqueue(&library, &request.name, request.size, request.creation_time)
        .await?;
    Ok(Json(file_view(state.repository.as_ref(), file).await?))
}

async fn list_files(
    State(state): State<RouteState>,
    Query(params): Query<ListFilesParams>,
) -> Result<Json<LibraryFileList>, FileFlowsAPIError> {
    let files = state.repository.list(params.status).await?;
    let libraries: HashMap<_, _> = state
        .repository
        .libraries()
        .await?
        .into_iter()
        .map(|l| (l.uid.clone(), l))
        .collect();
    let now = Local::now();
    let files = files
        .into_iter()
        .map(|file| {
            let status = file.effective_status(libraries.get(&file.library_uid), &now);
            LibraryFileView::new(file, status)
        })
        .collect();
    Ok(Json(LibraryFileList { files }))
}

async fn get_file(
    Path(file): Path<LibraryFileId>,
    State(state): State<RouteState>,
) -> Result<Json<LibraryFileView>, FileFlowsAPIError> {
    let Some(file) = state.repository.get(&file).await? else {
        return Err(FileFlowsAPIError::not_found(&format!("file {file} not found")));
    };
    Ok(Json(file_view(state.repository.as_ref(), file).await?))
}

async fn get_file_log(
    Path(file): Path<LibraryFileId>,
    State(state): State<RouteState>,
) -> Result<impl IntoResponse, FileFlowsAPIError> {
    match state.repository.log(&file).await? {
        Some(log) => Ok(log),
        None => Err(FileFlowsAPIError::not_found(&format!("no log for file {file}"))),
    }
}

async fn abort_file(
    Path(file): Path<LibraryFileId>,
    State(state): State<RouteState>,
) -> Result<Json<AbortResponse>, FileFlowsAPIError> {
    let aborted = state.runner_manager.abort(&file);
    info!(file_uid = %file, aborted, "abort requested");
    Ok(Json(AbortResponse { aborted }))
}

async fn reprocess_file(
    Path(file): Path<LibraryFileId>,
    State(state): State<RouteState>,
    Json(request): Json<ReprocessRequest>,
) -> Result<Json<LibraryFileView>, FileFlowsAPIError> {
    let file = state.repository.reprocess(&file, request.node_uid).await?;
    Ok(Json(file_view(state.repository.as_ref(), file).await?))
}

async fn force_file(
    Path(file): Path<LibraryFileId>,
    State(state): State<RouteState>,
    Json(request): Json<ForceRequest>,
) -> Result<Json<LibraryFileView>, FileFlowsAPIError> {
    let file = state.repository.set_force(&file, request.force).await?;
    Ok(Json(file_view(state.repository.as_ref(), file).await?))
}

async fn list_executors(State(state): State<RouteState>) -> Json<ExecutorList> {
    let executors = state
        .runner_manager
        .registry
        .list()
        .into_iter()
        .map(Into::into)
        .collect();
    Json(ExecutorList { executors })
}
