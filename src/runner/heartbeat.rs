//! Runner side of the coordinator connection.
//!
//! Two loops run next to the flow:
//! - the liveness loop says hello every [`HELLO_INTERVAL`] (and right away
//!   when progress changes) and cancels the flow once hellos have failed for
//!   longer than [`HELLO_GRACE`];
//! - the inbound loop keeps the event stream open, reconnecting according to
//!   a [`ReconnectPolicy`], and turns `AbortFlow` for this runner's file into
//!   cancellation.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::CoordinatorClient;
use crate::{
    data_model::{FlowExecutorInfo, LibraryFileId, RunnerId, RunnerMessage},
    utils::retry::ReconnectPolicy,
};

pub const HELLO_INTERVAL: Duration = Duration::from_secs(5);
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
pub const HELLO_GRACE: Duration = Duration::from_secs(2 * 60);
const MIN_FAILURES_BEFORE_CANCEL: u32 = 2;

pub struct HeartbeatChannel {
    client: Arc<dyn CoordinatorClient>,
    runner_uid: RunnerId,
    file_uid: LibraryFileId,
    policy: ReconnectPolicy,
    healthy: Arc<AtomicBool>,
}

/// Handles of the running loops. Dropping it leaves them running until the
/// shutdown token fires.
pub struct HeartbeatTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl HeartbeatTasks {
    pub async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!("heartbeat task ended abnormally: {}", err);
            }
        }
    }
}

impl HeartbeatChannel {
    pub fn new(
        client: Arc<dyn CoordinatorClient>,
        runner_uid: RunnerId,
        file_uid: LibraryFileId,
    ) -> Self {
        Self {
            client,
            runner_uid,
            file_uid,
            policy: ReconnectPolicy::default(),
            healthy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[cfg(test)]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Initial handshake. The runner must not start the flow if this fails.
    pub async fn register(&self, info: &FlowExecutorInfo) -> Result<()> {
        let accepted =
            match tokio::time::timeout(HELLO_TIMEOUT, self.client.hello(&self.runner_uid, info))
                .await
            {
                Ok(result) => result?,
                Err(_) => bail!("initial hello timed out after {:?}", HELLO_TIMEOUT),
            };
        if !accepted {
            bail!("coordinator rejected runner {}", self.runner_uid);
        }
        self.healthy.store(true, Ordering::SeqCst);
        info!(runner_uid = %self.runner_uid, "registered with coordinator");
        Ok(())
    }

    /// Spawns the liveness and inbound loops. Both cancel `flow_cancel` when
    /// the flow must stop.
    pub fn start(
        &self,
        progress: watch::Receiver<FlowExecutorInfo>,
        flow_cancel: CancellationToken,
    ) -> HeartbeatTasks {
        let shutdown = CancellationToken::new();
        let liveness = LivenessLoop {
            client: self.client.clone(),
            runner_uid: self.runner_uid.clone(),
            healthy: self.healthy.clone(),
            progress,
            flow_cancel: flow_cancel.clone(),
            shutdown: shutdown.clone(),
        };
        let inbound = InboundLoop {
            client: self.client.clone(),
            runner_uid: self.runner_uid.clone(),
            file_uid: self.file_uid.clone(),
            policy: self.policy,
            flow_cancel,
            shutdown: shutdown.clone(),
        };
        let handles = vec![
            tokio::spawn(liveness.run()),
            tokio::spawn(inbound.run()),
        ];
        HeartbeatTasks { shutdown, handles }
    }
}

struct LivenessLoop {
    client: Arc<dyn CoordinatorClient>,
    runner_uid: RunnerId,
    healthy: Arc<AtomicBool>,
    progress: watch::Receiver<FlowExecutorInfo>,
    flow_cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl LivenessLoop {
    async fn send_hello(&self, info: &FlowExecutorInfo) -> Result<()> {
        match tokio::time::timeout(HELLO_TIMEOUT, self.client.hello(&self.runner_uid, info)).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => bail!("coordinator does not know this runner"),
            Ok(Err(err)) => Err(err),
            Err(_) => bail!("hello timed out after {:?}", HELLO_TIMEOUT),
        }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(HELLO_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The registration hello already counts as the first tick.
        ticker.tick().await;

        let mut progress_open = true;
        let mut last_success = Instant::now();
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
                changed = self.progress.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                        continue;
                    }
                }
            }

            let info = self.progress.borrow_and_update().clone();
            match self.send_hello(&info).await {
                Ok(()) => {
                    if failures > 0 {
                        info!(runner_uid = %self.runner_uid, "hello recovered after {} failures", failures);
                    }
                    failures = 0;
                    last_success = Instant::now();
                    self.healthy.store(true, Ordering::SeqCst);
                }
                Err(err) => {
                    failures += 1;
                    self.healthy.store(false, Ordering::SeqCst);
                    let since_success = last_success.elapsed();
                    warn!(
                        runner_uid = %self.runner_uid,
                        failures,
                        since_success_s = since_success.as_secs(),
                        "hello failed: {}",
                        err
                    );
                    if failures >= MIN_FAILURES_BEFORE_CANCEL && since_success > HELLO_GRACE {
                        warn!(runner_uid = %self.runner_uid, "coordinator lost track of runner, canceling flow");
                        self.flow_cancel.cancel();
                        return;
                    }
                }
            }
        }
    }
}

struct InboundLoop {
    client: Arc<dyn CoordinatorClient>,
    runner_uid: RunnerId,
    file_uid: LibraryFileId,
    policy: ReconnectPolicy,
    flow_cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl InboundLoop {
    /// Returns true when the flow was canceled.
    fn dispatch(&self, message: RunnerMessage) -> bool {
        match message {
            RunnerMessage::AbortFlow { library_file_uid } => {
                if library_file_uid != self.file_uid {
                    return false;
                }
                info!(runner_uid = %self.runner_uid, file_uid = %library_file_uid, "abort requested");
                self.flow_cancel.cancel();
                true
            }
        }
    }

    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            let connection = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                connection = self.client.subscribe(&self.runner_uid) => connection,
            };
            match connection {
                Ok(mut rx) => {
                    attempt = 0;
                    loop {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            message = rx.recv() => match message {
                                Some(message) => {
                                    if self.dispatch(message) {
                                        return;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                    debug!(runner_uid = %self.runner_uid, "event stream closed");
                }
                Err(err) => {
                    warn!(runner_uid = %self.runner_uid, attempt, "event stream connect failed: {}", err);
                }
            }

            let Some(delay) = self.policy.delay_for(attempt) else {
                warn!(
                    runner_uid = %self.runner_uid,
                    "giving up on event stream after {} attempts",
                    attempt
                );
                return;
            };
            attempt += 1;
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex};

    use super::*;
    use crate::data_model::CompletionReport;

    /// Scripted coordinator: hellos follow `hello_ok`, subscriptions hand out
    /// queued receivers and fail once the queue is empty.
    struct ScriptedClient {
        hello_ok: AtomicBool,
        hellos: AtomicU32,
        subscribes: AtomicU32,
        streams: Mutex<Vec<mpsc::Receiver<RunnerMessage>>>,
    }

    impl ScriptedClient {
        fn new(hello_ok: bool) -> Self {
            Self {
                hello_ok: AtomicBool::new(hello_ok),
                hellos: AtomicU32::new(0),
                subscribes: AtomicU32::new(0),
                streams: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl CoordinatorClient for ScriptedClient {
        async fn hello(&self, _runner: &RunnerId, _info: &FlowExecutorInfo) -> Result<bool> {
            self.hellos.fetch_add(1, Ordering::SeqCst);
            if self.hello_ok.load(Ordering::SeqCst) {
                Ok(true)
            } else {
                bail!("connection refused")
            }
        }

        async fn log_message(&self, _: &RunnerId, _: &LibraryFileId, _: &str) -> Result<()> {
            Ok(())
        }

        async fn subscribe(&self, _runner: &RunnerId) -> Result<mpsc::Receiver<RunnerMessage>> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            match self.streams.lock().await.pop() {
                Some(rx) => Ok(rx),
                None => bail!("connection refused"),
            }
        }

        async fn finish(&self, _: &RunnerId, _: &CompletionReport) -> Result<()> {
            Ok(())
        }
    }

    fn channel(client: Arc<ScriptedClient>) -> HeartbeatChannel {
        HeartbeatChannel::new(client, RunnerId::from("runner"), LibraryFileId::from("file"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_hellos_cancel_after_grace() {
        let client = Arc::new(ScriptedClient::new(true));
        let heartbeat = channel(client.clone());
        heartbeat.register(&FlowExecutorInfo::default()).await.unwrap();

        let (_progress_tx, progress_rx) = watch::channel(FlowExecutorInfo::default());
        let cancel = CancellationToken::new();
        let tasks = heartbeat.start(progress_rx, cancel.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!cancel.is_cancelled());
        assert!(heartbeat.is_healthy());

        client.hello_ok.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        // Failing, but still inside the grace period.
        assert!(!cancel.is_cancelled());
        assert!(!heartbeat.is_healthy());

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(cancel.is_cancelled());
        tasks.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_hello_resets_grace() {
        let client = Arc::new(ScriptedClient::new(true));
        let heartbeat = channel(client.clone());
        heartbeat.register(&FlowExecutorInfo::default()).await.unwrap();
        let (_progress_tx, progress_rx) = watch::channel(FlowExecutorInfo::default());
        let cancel = CancellationToken::new();
        let tasks = heartbeat.start(progress_rx, cancel.clone());

        for _ in 0..3 {
            client.hello_ok.store(false, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(100)).await;
            client.hello_ok.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        assert!(!cancel.is_cancelled());
        tasks.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_change_sends_hello() {
        let client = Arc::new(ScriptedClient::new(true));
        let heartbeat = channel(client.clone());
        let (progress_tx, progress_rx) = watch::channel(FlowExecutorInfo::default());
        let tasks = heartbeat.start(progress_rx, CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = client.hellos.load(Ordering::SeqCst);
        progress_tx.send_modify(|info| info.current_part = 3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.hellos.load(Ordering::SeqCst), before + 1);
        tasks.stop().await;
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let client = Arc::new(ScriptedClient::new(false));
        let heartbeat = channel(client);
        assert!(heartbeat.register(&FlowExecutorInfo::default()).await.is_err());
        assert!(!heartbeat.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_for_own_file_cancels() {
        let client = Arc::new(ScriptedClient::new(true));
        let (tx, rx) = mpsc::channel(4);
        client.streams.lock().await.push(rx);
        let heartbeat = channel(client.clone());
        let (_progress_tx, progress_rx) = watch::channel(FlowExecutorInfo::default());
        let cancel = CancellationToken::new();
        let tasks = heartbeat.start(progress_rx, cancel.clone());

        tx.send(RunnerMessage::AbortFlow {
            library_file_uid: LibraryFileId::from("other_file"),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!cancel.is_cancelled());

        tx.send(RunnerMessage::AbortFlow {
            library_file_uid: LibraryFileId::from("file"),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cancel.is_cancelled());
        tasks.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_policy() {
        let client = Arc::new(ScriptedClient::new(true));
        let heartbeat = channel(client.clone()).with_policy(ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
        });
        let (_progress_tx, progress_rx) = watch::channel(FlowExecutorInfo::default());
        let cancel = CancellationToken::new();
        let tasks = heartbeat.start(progress_rx, cancel.clone());

        // 1 + 2 + 4 seconds of backoff, then no more attempts.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.subscribes.load(Ordering::SeqCst), 4);
        // Losing the event stream alone never cancels the flow.
        assert!(!cancel.is_cancelled());
        tasks.stop().await;
    }
}
