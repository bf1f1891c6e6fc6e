use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tracing::info;

use super::client::{is_retryable, CoordinatorClient};
use crate::{
    data_model::{CompletionReport, RunnerId},
    utils::retry::retry_until_deadline,
};

pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const COMPLETION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Delivers the final report, retrying until acknowledged, refused for good,
/// or the budget runs out. A file whose report is never delivered stays `Processing` until the
/// coordinator's liveness monitor requeues it.
pub struct CompletionReporter {
    client: Arc<dyn CoordinatorClient>,
    runner_uid: RunnerId,
    timeout: Duration,
    poll_interval: Duration,
}

impl CompletionReporter {
    pub fn new(client: Arc<dyn CoordinatorClient>, runner_uid: RunnerId) -> Self {
        Self {
            client,
            runner_uid,
            timeout: COMPLETION_TIMEOUT,
            poll_interval: COMPLETION_POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub async fn report(&self, report: &CompletionReport) -> Result<()> {
        retry_until_deadline(
            self.timeout,
            self.poll_interval,
            "reporting completion",
            || {
                let client = self.client.clone();
                let runner = self.runner_uid.clone();
                let report = report.clone();
                async move { client.finish(&runner, &report).await }
            },
            is_retryable,
        )
        .await?;
        info!(
            runner_uid = %self.runner_uid,
            file_uid = %report.library_file_uid,
            status = %report.status,
            "completion reported"
        );
        Ok(())
    }
}
