use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::log::RunnerLog;
use crate::data_model::{FlowElementKind, FlowExecutorInfo};

/// Output that ends the flow with a failure.
pub const FAILURE_OUTPUT: i32 = -1;

#[derive(Debug)]
pub enum ElementError {
    Canceled,
    Failed(String),
}

impl std::fmt::Display for ElementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementError::Canceled => write!(f, "canceled"),
            ElementError::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for ElementError {}

impl From<anyhow::Error> for ElementError {
    fn from(err: anyhow::Error) -> Self {
        ElementError::Failed(format!("{err:#}"))
    }
}

/// State shared by the elements of one flow execution.
pub struct ElementContext {
    pub working_file: PathBuf,
    pub original_file: PathBuf,
    pub log: Arc<RunnerLog>,
    pub cancel: CancellationToken,
    pub progress: watch::Sender<FlowExecutorInfo>,
    /// Set by an element that fails on purpose.
    pub failure_reason: Option<String>,
}

impl ElementContext {
    fn destination_for(&self, destination: &str) -> PathBuf {
        let destination = PathBuf::from(destination);
        let into_dir = destination.is_dir() || destination.to_string_lossy().ends_with('/');
        match (into_dir, self.working_file.file_name()) {
            (true, Some(name)) => destination.join(name),
            _ => destination,
        }
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    Ok(())
}

fn extension_matches(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
        return false;
    };
    extensions
        .iter()
        .any(|candidate| candidate.trim_start_matches('.').to_lowercase() == ext)
}

/// Runs one element and returns the output it took.
pub async fn execute(
    element: &FlowElementKind,
    ctx: &mut ElementContext,
) -> Result<i32, ElementError> {
    match element {
        FlowElementKind::InputFile | FlowElementKind::SubFlowInput => Ok(1),
        FlowElementKind::SubFlow { flow_uid } => Err(ElementError::Failed(format!(
            "sub flow {flow_uid} cannot run as a plain element"
        ))),
        FlowElementKind::Log { message } => {
            ctx.log.info(message);
            Ok(1)
        }
        FlowElementKind::CopyFile { destination } => {
            let target = ctx.destination_for(destination);
            ensure_parent(&target).await?;
            tokio::fs::copy(&ctx.working_file, &target)
                .await
                .with_context(|| {
                    format!(
                        "copying {} to {}",
                        ctx.working_file.display(),
                        target.display()
                    )
                })?;
            ctx.log.info(&format!("Copied file to: {}", target.display()));
            ctx.working_file = target;
            Ok(1)
        }
        FlowElementKind::MoveFile { destination } => {
            let target = ctx.destination_for(destination);
            ensure_parent(&target).await?;
            if tokio::fs::rename(&ctx.working_file, &target).await.is_err() {
                // Cross-device moves fall back to copy and delete.
                tokio::fs::copy(&ctx.working_file, &target)
                    .await
                    .with_context(|| format!("moving to {}", target.display()))?;
                tokio::fs::remove_file(&ctx.working_file)
                    .await
                    .with_context(|| format!("removing {}", ctx.working_file.display()))?;
            }
            ctx.log.info(&format!("Moved file to: {}", target.display()));
            ctx.working_file = target;
            Ok(1)
        }
        FlowElementKind::DeleteOriginal => {
            if ctx.original_file != ctx.working_file
                && tokio::fs::try_exists(&ctx.original_file).await.unwrap_or(false)
            {
                tokio::fs::remove_file(&ctx.original_file)
                    .await
                    .with_context(|| format!("deleting {}", ctx.original_file.display()))?;
                ctx.log
                    .info(&format!("Deleted original: {}", ctx.original_file.display()));
            }
            Ok(1)
        }
        FlowElementKind::FileSizeGreaterThan { bytes } => {
            let size = tokio::fs::metadata(&ctx.working_file)
                .await
                .with_context(|| format!("reading size of {}", ctx.working_file.display()))?
                .len();
            Ok(if size > *bytes { 1 } else { 2 })
        }
        FlowElementKind::FileExtension { extensions } => {
            Ok(if extension_matches(&ctx.working_file, extensions) {
                1
            } else {
                2
            })
        }
        FlowElementKind::SetAdditionalInfo { key, value, steps } => {
            ctx.progress
                .send_modify(|info| info.record_additional_info(key, value, *steps));
            Ok(1)
        }
        FlowElementKind::Delay { millis } => {
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(ElementError::Canceled),
                _ = tokio::time::sleep(Duration::from_millis(*millis)) => Ok(1),
            }
        }
        FlowElementKind::Fail { reason } => {
            ctx.log.error(reason);
            ctx.failure_reason = Some(reason.clone());
            Ok(FAILURE_OUTPUT)
        }
    }
}
