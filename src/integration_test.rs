#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, time::Duration};

    use anyhow::Result;
    use tokio::sync::watch;

    use crate::{
        config::{NodeConfig, ServerConfig},
        data_model::{
            test_objects::tests::{mock_library, mock_linear_flow, mock_node, part, TEST_FLOW},
            CompletionReport,
            FileStatus,
            Flow,
            FlowElementKind,
            FlowId,
            LibraryFile,
            NodeId,
            RunnerId,
            RunnerParameters,
            Schedule,
        },
        http_objects::{LibraryFileList, LibraryFileView},
        node::NodeAgent,
        processor::NextFileStatus,
        runner::{Runner, RunnerState, CANCELED_REASON},
        testing::{LocalCoordinatorClient, TestService},
    };

    fn delay_flow() -> Flow {
        Flow {
            uid: FlowId::from(TEST_FLOW),
            name: "slow".to_string(),
            enabled: true,
            parts: vec![
                part("start", FlowElementKind::InputFile, &[(1, "wait")]),
                part("wait", FlowElementKind::Delay { millis: 600_000 }, &[]),
            ],
        }
    }

    async fn runner_params(
        test_srv: &TestService,
        file: LibraryFile,
        runner_uid: RunnerId,
        node: &str,
        temp_path: &std::path::Path,
    ) -> Result<RunnerParameters> {
        let library = test_srv
            .service
            .repository
            .libraries()
            .await?
            .into_iter()
            .find(|l| l.uid == file.library_uid)
            .ok_or_else(|| anyhow::anyhow!("library missing"))?;
        let (flow, sub_flows) = test_srv
            .service
            .selector
            .resolve_flows(&FlowId::from(TEST_FLOW))
            .await?;
        Ok(RunnerParameters {
            runner_uid,
            node_uid: NodeId::from(node),
            server_addr: String::new(),
            file,
            library,
            flow,
            sub_flows,
            max_flow_parts: test_srv.service.config.max_flow_parts,
            temp_path: temp_path.to_path_buf(),
            mappings: vec![],
        })
    }

    #[tokio::test]
    async fn test_file_flows_from_queue_to_processed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("movie.mkv");
        tokio::fs::write(&source, b"0123456789").await?;
        let out_dir = format!("{}/out/", dir.path().display());

        let flow = Flow {
            uid: FlowId::from(TEST_FLOW),
            name: "copy".to_string(),
            enabled: true,
            parts: vec![
                part("start", FlowElementKind::InputFile, &[(1, "copy")]),
                part(
                    "copy",
                    FlowElementKind::CopyFile {
                        destination: out_dir,
                    },
                    &[(1, "done")],
                ),
                part(
                    "done",
                    FlowElementKind::Log {
                        message: "all done".to_string(),
                    },
                    &[],
                ),
            ],
        };
        let test_srv = TestService::new(
            vec![mock_library("lib")],
            vec![mock_node("node-a", 1)],
            vec![flow],
        )?;
        let queued = test_srv
            .enqueue("lib", &source.display().to_string(), 10)
            .await?;

        let next = test_srv.poll("node-a").await;
        assert_eq!(next.status, NextFileStatus::Ok);
        let (Some(file), Some(runner_uid)) = (next.file, next.runner_uid) else {
            panic!("expected a claimed file");
        };
        assert_eq!(file.uid, queued.uid);
        assert_eq!(file.status, FileStatus::Processing);
        assert_eq!(file.worker_uid.as_ref(), Some(&runner_uid));

        // A second poll sees the node maxed out.
        assert_eq!(test_srv.poll("node-a").await.status, NextFileStatus::MaxedOut);

        let params = runner_params(&test_srv, file, runner_uid, "node-a", dir.path()).await?;
        let client = Arc::new(LocalCoordinatorClient::new(test_srv.runner_manager()));
        let runner = Runner::new(params, client.clone());
        let state = runner.state();
        let report = runner.run().await?;

        assert_eq!(*state.borrow(), RunnerState::Terminal);
        assert_eq!(report.status, FileStatus::Processed);
        assert_eq!(report.final_size, Some(10));
        assert!(report.final_fingerprint.is_some());
        assert_eq!(report.executed_nodes.len(), 3);

        let stored = test_srv.file(&queued.uid).await?;
        assert_eq!(stored.status, FileStatus::Processed);
        assert_eq!(stored.final_fingerprint, report.final_fingerprint);
        assert!(test_srv.service.runner_manager.registry.is_empty());
        assert!(dir.path().join("out").join("movie.mkv").exists());

        let log = test_srv
            .service
            .repository
            .log(&queued.uid)
            .await?
            .unwrap_or_default();
        assert!(log.contains("all done"));
        assert!(dir.path().join(format!("{}.log", queued.uid)).exists());

        // Nothing left for the node.
        assert_eq!(test_srv.poll("node-a").await.status, NextFileStatus::NoFile);
        Ok(())
    }

    #[tokio::test]
    async fn test_library_runner_cap_holds_across_nodes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("f.mkv");
        tokio::fs::write(&source, b"data").await?;

        let mut library = mock_library("lib");
        library.max_runners = 1;
        let test_srv = TestService::new(
            vec![library],
            vec![mock_node("node-a", 1), mock_node("node-b", 1)],
            vec![mock_linear_flow(TEST_FLOW, 1)],
        )?;
        let queued = test_srv
            .enqueue("lib", &source.display().to_string(), 4)
            .await?;

        let next = test_srv.poll("node-a").await;
        assert_eq!(next.status, NextFileStatus::Ok);
        let (Some(file), Some(runner_uid)) = (next.file, next.runner_uid) else {
            panic!("expected node-a to claim the file");
        };
        assert_eq!(file.uid, queued.uid);

        // The claimed file is invisible to the other node.
        assert_eq!(test_srv.poll("node-b").await.status, NextFileStatus::NoFile);

        // A second file waits while the library's only runner slot is taken.
        let waiting = test_srv.enqueue("lib", "/media/g.mkv", 4).await?;
        assert_eq!(test_srv.poll("node-b").await.status, NextFileStatus::NoFile);

        let params = runner_params(&test_srv, file, runner_uid, "node-a", dir.path()).await?;
        let client = Arc::new(LocalCoordinatorClient::new(test_srv.runner_manager()));
        let report = Runner::new(params, client).run().await?;
        assert_eq!(report.status, FileStatus::Processed);
        assert_eq!(
            test_srv.file(&queued.uid).await?.status,
            FileStatus::Processed
        );

        // The freed slot goes to the waiting file, then the library is full again.
        let next = test_srv.poll("node-b").await;
        assert_eq!(next.status, NextFileStatus::Ok);
        assert_eq!(next.file.map(|f| f.uid), Some(waiting.uid));
        assert_eq!(test_srv.poll("node-a").await.status, NextFileStatus::NoFile);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_polls_never_share_a_file() -> Result<()> {
        let mut node = mock_node("node-a", 1);
        node.flow_runners = 20;
        let test_srv = TestService::new(
            vec![mock_library("lib")],
            vec![node],
            vec![mock_linear_flow(TEST_FLOW, 1)],
        )?;
        for i in 0..5 {
            test_srv.enqueue("lib", &format!("/media/{i}.mkv"), 1).await?;
        }

        let mut polls = Vec::new();
        for _ in 0..12 {
            let selector = test_srv.service.selector.clone();
            polls.push(tokio::spawn(async move {
                selector
                    .select_next(&NodeId::from("node-a"), env!("CARGO_PKG_VERSION"))
                    .await
            }));
        }
        let mut claimed = HashSet::new();
        let mut empty = 0;
        for poll in polls {
            let next = poll.await?;
            match next.file {
                Some(file) => assert!(claimed.insert(file.uid), "file handed out twice"),
                None => {
                    assert_eq!(next.status, NextFileStatus::NoFile);
                    empty += 1;
                }
            }
        }
        assert_eq!(claimed.len(), 5);
        assert_eq!(empty, 7);
        assert_eq!(test_srv.service.runner_manager.registry.len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_forced_file_ignores_library_gates() -> Result<()> {
        let mut library = mock_library("lib");
        library.enabled = false;
        library.schedule = Schedule::never();
        let test_srv = TestService::new(
            vec![library],
            vec![mock_node("node-a", 1)],
            vec![mock_linear_flow(TEST_FLOW, 1)],
        )?;
        let file = test_srv.enqueue("lib", "/media/a.mkv", 1).await?;

        assert_eq!(test_srv.poll("node-a").await.status, NextFileStatus::NoFile);

        test_srv.service.repository.set_force(&file.uid, true).await?;
        let next = test_srv.poll("node-a").await;
        assert_eq!(next.status, NextFileStatus::Ok);
        assert_eq!(next.file.map(|f| f.uid), Some(file.uid));
        Ok(())
    }

    #[tokio::test]
    async fn test_node_out_of_schedule_only_takes_forced_files() -> Result<()> {
        let mut node = mock_node("node-a", 1);
        node.schedule = Schedule::never();
        node.flow_runners = 2;
        let test_srv = TestService::new(
            vec![mock_library("lib")],
            vec![node],
            vec![mock_linear_flow(TEST_FLOW, 1)],
        )?;
        test_srv.enqueue("lib", "/media/plain.mkv", 1).await?;
        assert_eq!(
            test_srv.poll("node-a").await.status,
            NextFileStatus::OutOfSchedule
        );

        let forced = test_srv.enqueue("lib", "/media/forced.mkv", 1).await?;
        test_srv.service.repository.set_force(&forced.uid, true).await?;
        let next = test_srv.poll("node-a").await;
        assert_eq!(next.status, NextFileStatus::Ok);
        assert_eq!(next.file.map(|f| f.uid), Some(forced.uid));

        // The plain file still waits for the schedule.
        assert_eq!(
            test_srv.poll("node-a").await.status,
            NextFileStatus::OutOfSchedule
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_forced_file_keeps_node_out_of_schedule() -> Result<()> {
        let mut node = mock_node("node-a", 1);
        node.schedule = Schedule::never();
        node.max_file_size_mb = 1;
        let test_srv = TestService::new(
            vec![mock_library("lib")],
            vec![node],
            vec![mock_linear_flow(TEST_FLOW, 1)],
        )?;
        let forced = test_srv
            .enqueue("lib", "/media/huge.mkv", 2 * 1024 * 1024)
            .await?;
        test_srv.service.repository.set_force(&forced.uid, true).await?;
        assert_eq!(
            test_srv.poll("node-a").await.status,
            NextFileStatus::OutOfSchedule
        );

        let small = test_srv.enqueue("lib", "/media/small.mkv", 1024).await?;
        test_srv.service.repository.set_force(&small.uid, true).await?;
        let next = test_srv.poll("node-a").await;
        assert_eq!(next.status, NextFileStatus::Ok);
        assert_eq!(next.file.map(|f| f.uid), Some(small.uid));
        Ok(())
    }

    #[tokio::test]
    async fn test_reprocess_sticks_to_requested_node() -> Result<()> {
        let test_srv = TestService::new(
            vec![mock_library("lib")],
            vec![mock_node("node-a", 10), mock_node("node-b", 1)],
            vec![mock_linear_flow(TEST_FLOW, 1)],
        )?;
        let file = test_srv.enqueue("lib", "/media/a.mkv", 1).await?;
        test_srv
            .service
            .repository
            .reprocess(&file.uid, Some(NodeId::from("node-b")))
            .await?;

        // The better node cannot see a file pinned elsewhere.
        assert_eq!(test_srv.poll("node-a").await.status, NextFileStatus::NoFile);

        let next = test_srv.poll("node-b").await;
        assert_eq!(next.status, NextFileStatus::Ok);
        let claimed = next.file.expect("sticky file");
        assert_eq!(claimed.uid, file.uid);
        assert_eq!(claimed.node_uid, Some(NodeId::from("node-b")));
        Ok(())
    }

    #[tokio::test]
    async fn test_higher_priority_node_gets_the_file() -> Result<()> {
        let test_srv = TestService::new(
            vec![mock_library("lib")],
            vec![mock_node("fast", 10), mock_node("slow", 1)],
            vec![mock_linear_flow(TEST_FLOW, 1)],
        )?;
        // An empty poll is enough for the fast node to count as alive.
        assert_eq!(test_srv.poll("fast").await.status, NextFileStatus::NoFile);

        let file = test_srv.enqueue("lib", "/media/a.mkv", 1).await?;
        assert_eq!(test_srv.poll("slow").await.status, NextFileStatus::NoFile);
        assert_eq!(
            test_srv.poll("fast").await.file.map(|f| f.uid),
            Some(file.uid)
        );

        // With its only slot taken the fast node no longer wins.
        let second = test_srv.enqueue("lib", "/media/b.mkv", 1).await?;
        let next = test_srv.poll("slow").await;
        assert_eq!(next.file.map(|f| f.uid), Some(second.uid));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_runner_returns_file_to_queue() -> Result<()> {
        let test_srv = TestService::with_config(ServerConfig {
            runner_timeout_secs: 1,
            libraries: vec![mock_library("lib")],
            nodes: vec![mock_node("node-a", 1)],
            flows: vec![mock_linear_flow(TEST_FLOW, 1)],
            ..Default::default()
        })?;
        let file = test_srv.enqueue("lib", "/media/a.mkv", 1).await?;
        let next = test_srv.poll("node-a").await;
        assert_eq!(next.status, NextFileStatus::Ok);
        let runner_uid = next.runner_uid.expect("runner uid");

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let monitor = tokio::spawn(test_srv.runner_manager().start_liveness_monitor(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let stored = test_srv.file(&file.uid).await?;
        assert_eq!(stored.status, FileStatus::Unprocessed);
        assert!(stored.worker_uid.is_none());
        assert!(test_srv.service.runner_manager.registry.is_empty());

        // A late report from the lapsed runner is refused.
        let late = CompletionReport {
            library_file_uid: file.uid.clone(),
            status: FileStatus::Processed,
            failure_reason: None,
            final_size: None,
            final_fingerprint: None,
            output_path: None,
            executed_nodes: vec![],
            processing_ended: 0,
            log: String::new(),
        };
        assert!(test_srv
            .runner_manager()
            .finish(&runner_uid, late)
            .await
            .is_err());
        assert_eq!(
            test_srv.file(&file.uid).await?.status,
            FileStatus::Unprocessed
        );

        let _ = shutdown_tx.send(());
        monitor.await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_cancels_flow_when_coordinator_is_lost() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("a.mkv");
        tokio::fs::write(&source, b"abc").await?;
        let test_srv = TestService::new(
            vec![mock_library("lib")],
            vec![mock_node("node-a", 1)],
            vec![delay_flow()],
        )?;
        let queued = test_srv
            .enqueue("lib", &source.display().to_string(), 3)
            .await?;
        let next = test_srv.poll("node-a").await;
        let (Some(file), Some(runner_uid)) = (next.file, next.runner_uid) else {
            panic!("expected a claimed file");
        };

        let params = runner_params(&test_srv, file, runner_uid, "node-a", dir.path()).await?;
        let client = Arc::new(LocalCoordinatorClient::new(test_srv.runner_manager()));
        let run = tokio::spawn(Runner::new(params, client.clone()).run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        client.fail_hellos(true);

        let report = run.await??;
        assert_eq!(report.status, FileStatus::ProcessingFailed);
        assert_eq!(report.failure_reason.as_deref(), Some(CANCELED_REASON));
        assert_eq!(
            test_srv.file(&queued.uid).await?.status,
            FileStatus::ProcessingFailed
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_reaches_running_flow() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("a.mkv");
        tokio::fs::write(&source, b"abc").await?;
        let test_srv = TestService::new(
            vec![mock_library("lib")],
            vec![mock_node("node-a", 1)],
            vec![delay_flow()],
        )?;
        let queued = test_srv
            .enqueue("lib", &source.display().to_string(), 3)
            .await?;
        let next = test_srv.poll("node-a").await;
        let (Some(file), Some(runner_uid)) = (next.file, next.runner_uid) else {
            panic!("expected a claimed file");
        };

        let params = runner_params(&test_srv, file, runner_uid, "node-a", dir.path()).await?;
        let manager = test_srv.runner_manager();
        let client = Arc::new(LocalCoordinatorClient::new(manager.clone()));
        let run = tokio::spawn(Runner::new(params, client).run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.abort(&queued.uid));

        let report = run.await??;
        assert_eq!(report.status, FileStatus::ProcessingFailed);
        assert!(test_srv.service.runner_manager.registry.is_empty());
        assert!(!manager.abort(&queued.uid));
        Ok(())
    }

    #[tokio::test]
    async fn test_node_reports_failed_launch_over_http() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let test_srv = TestService::new(
            vec![mock_library("lib")],
            vec![mock_node("node-a", 1)],
            vec![mock_linear_flow(TEST_FLOW, 1)],
        )?;
        let addr = test_srv.serve().await?;
        let base = format!("http://{addr}");
        let http = reqwest::Client::new();

        let enqueued: LibraryFileView = http
            .post(format!("{base}/v1/libraries/lib/files"))
            .json(&serde_json::json!({ "name": "/media/a.mkv", "size": 1 }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut agent = NodeAgent::new(NodeConfig {
            node_uid: "node-a".to_string(),
            server_addr: addr.to_string(),
            temp_path: dir.path().to_path_buf(),
            poll_interval_secs: 1,
            runner_executable: Some(dir.path().join("no-such-runner")),
            structured_logging: false,
        })?;
        assert!(agent.poll_once().await?.is_none());

        let stored = test_srv.file(&enqueued.uid).await?;
        assert_eq!(stored.status, FileStatus::Unprocessed);
        assert!(test_srv.service.runner_manager.registry.is_empty());
        // The node sits out the failure pause.
        assert_eq!(test_srv.poll("node-a").await.status, NextFileStatus::NodePaused);

        let listed: LibraryFileList = http
            .get(format!("{base}/v1/files?status=Unprocessed"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(listed.files.len(), 1);

        let missing = http.get(format!("{base}/v1/files/nope")).send().await?;
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        Ok(())
    }
}
