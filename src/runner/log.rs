use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Local;
use strum::Display;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use super::client::CoordinatorClient;
use crate::data_model::{LibraryFileId, RunnerId};

/// Pending text is shipped once it grows past this many bytes.
pub const FLUSH_THRESHOLD: usize = 1024;
/// A batch not acknowledged within this window is dropped.
pub const LOG_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Default)]
struct LogBuffer {
    full: String,
    pending: String,
}

/// The per-file flow log.
///
/// Everything is kept locally in full; the pending batch is streamed to the
/// coordinator and may be lost, the full text is re-sent on completion.
#[derive(Debug)]
pub struct RunnerLog {
    buffer: Mutex<LogBuffer>,
    tx: mpsc::UnboundedSender<String>,
}

impl RunnerLog {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            buffer: Mutex::new(LogBuffer::default()),
            tx,
        }
    }

    /// A log streaming to the coordinator through a background sender.
    pub fn streaming(
        client: Arc<dyn CoordinatorClient>,
        runner: RunnerId,
        file: LibraryFileId,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(send_batches(client, runner, file, rx));
        (Arc::new(Self::new(tx)), handle)
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn info(&self, text: &str) {
        self.append(LogLevel::Info, text);
    }

    pub fn warn(&self, text: &str) {
        self.append(LogLevel::Warn, text);
    }

    pub fn error(&self, text: &str) {
        self.append(LogLevel::Error, text);
    }

    fn append(&self, level: LogLevel, text: &str) {
        let line = format!(
            "{} - {} -> {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            text
        );
        let over_threshold = {
            let mut buffer = self.lock();
            buffer.full.push_str(&line);
            buffer.pending.push_str(&line);
            buffer.pending.len() > FLUSH_THRESHOLD
        };
        if over_threshold {
            self.flush();
        }
    }

    pub fn flush(&self) {
        let batch = std::mem::take(&mut self.lock().pending);
        if batch.is_empty() {
            return;
        }
        if self.tx.send(batch).is_err() {
            debug!("flow log sender is gone, dropping batch");
        }
    }

    pub fn contents(&self) -> String {
        self.lock().full.clone()
    }
}

async fn send_batches(
    client: Arc<dyn CoordinatorClient>,
    runner: RunnerId,
    file: LibraryFileId,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(batch) = rx.recv().await {
        match tokio::time::timeout(LOG_SEND_TIMEOUT, client.log_message(&runner, &file, &batch))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(runner_uid = %runner, "dropping flow log batch: {}", err),
            Err(_) => debug!(runner_uid = %runner, "flow log batch timed out, dropping it"),
        }
    }
}
