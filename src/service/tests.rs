//! Sync Service Tests
//!
//! ## Test Scopes
//! - **Producer contract**: Policies, log hooks and append failures.
//! - **End to end**: Farm and staging peers over the loopback transport.
//! - **Administration**: Destinations, groups, statistics and the HTTP handlers.
//! - **Durability**: Logs reopen from their file journals.

#[cfg(test)]
mod tests {
    use crate::dispatch::dispatcher::DispatchSettings;
    use crate::dispatch::transport::LoopbackTransport;
    use crate::error::{LogError, SyncError};
    use crate::executor::executor::{ExecutorSettings, LocalTaskExecutor};
    use crate::executor::farm::{LocalCaches, register_farm_handlers};
    use crate::executor::registry::TaskHandlerRegistry;
    use crate::executor::staging::{StagedObjectStore, register_staging_handlers};
    use crate::health::tracker::HealthTracker;
    use crate::health::types::*;
    use crate::hooks::registry::{HookOutcome, HookPoint, HookRegistry, HookSubject};
    use crate::log::journal::MemoryJournal;
    use crate::log::task_log::TaskLog;
    use crate::policy::defaults::{WEBFARM_LOG, register_default_policies, staging_log_name};
    use crate::policy::registry::{ChangeContext, ChangeKind, LoggingPolicyRegistry};
    use crate::service::handlers::{handle_cancel_group, handle_change};
    use crate::service::service::*;
    use crate::task::types::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::{Extension, Json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn settings() -> ServiceSettings {
        ServiceSettings {
            dispatch: DispatchSettings {
                max_retries: 5,
                retry_base: Duration::from_millis(1),
                retry_max: Duration::from_millis(10),
                idle_poll: Duration::from_millis(50),
            },
            probe_interval: Duration::from_millis(20),
            compact_interval: Duration::from_secs(3600),
            dead_retention: Duration::from_secs(3600),
            journal_dir: None,
        }
    }

    fn service_with(
        transport: Arc<LoopbackTransport>,
        hooks: Arc<HookRegistry>,
        settings: ServiceSettings,
    ) -> Arc<SyncService> {
        let policies = LoggingPolicyRegistry::new();
        register_default_policies(&policies, &["s1".to_string()], &["article".to_string()]);
        SyncService::new(
            NodeId::named("web1"),
            SyncComponents {
                policies,
                hooks,
                tracker: Arc::new(HealthTracker::new(3, DisabledPolicy::Retain)),
                transport: transport.clone(),
                prober: transport,
            },
            settings,
        )
    }

    fn service() -> (Arc<SyncService>, Arc<LoopbackTransport>) {
        let transport = LoopbackTransport::new();
        (
            service_with(transport.clone(), HookRegistry::new(), settings()),
            transport,
        )
    }

    fn farm_peer(name: &str) -> (Arc<LocalTaskExecutor>, Arc<LocalCaches>) {
        let caches = LocalCaches::new();
        let registry = TaskHandlerRegistry::new();
        register_farm_handlers(&registry, caches.clone()).unwrap();
        registry.seal();
        let executor = LocalTaskExecutor::new(
            NodeId::named(name),
            registry,
            HookRegistry::new(),
            ExecutorSettings::default(),
        );
        (executor, caches)
    }

    fn staging_peer(name: &str) -> (Arc<LocalTaskExecutor>, Arc<StagedObjectStore>) {
        let store = StagedObjectStore::new();
        let registry = TaskHandlerRegistry::new();
        register_staging_handlers(&registry, store.clone()).unwrap();
        registry.seal();
        let executor = LocalTaskExecutor::new(
            NodeId::named(name),
            registry,
            HookRegistry::new(),
            ExecutorSettings::default(),
        );
        (executor, store)
    }

    fn article_update(id: &str) -> ChangeContext {
        ChangeContext::new("article", id, ChangeKind::Update)
            .with_fields(TaskPayload::new().with("title", "Release notes"))
    }

    async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    // ============================================================
    // TEST 1: Producer contract
    // ============================================================

    #[tokio::test]
    async fn test_on_change_appends_to_every_matching_log() {
        let (service, _) = service();

        let appended = service.on_change(&article_update("42")).unwrap();

        assert_eq!(
            appended,
            vec![
                AppendedTask { log: WEBFARM_LOG.to_string(), seq: 1 },
                AppendedTask { log: staging_log_name("s1"), seq: 1 },
            ]
        );
        assert_eq!(service.log_names(), vec!["staging:s1".to_string(), "webfarm".to_string()]);

        let task = service.log(WEBFARM_LOG).unwrap().peek_from(1).unwrap();
        assert_eq!(task.source_node, NodeId::named("web1"));
        assert_eq!(task.task_type, "invalidate-object");
    }

    #[tokio::test]
    async fn test_log_hook_cancels_single_task() {
        let hooks = HookRegistry::new();
        let cancelled = Arc::new(AtomicUsize::new(0));

        hooks.before(HookPoint::LogTask, "no-staging", |subject| match subject {
            HookSubject::LogTask { log, .. } if log.starts_with("staging:") => HookOutcome::CANCEL,
            _ => HookOutcome::PROCEED,
        });
        let counter = cancelled.clone();
        hooks.after(HookPoint::LogTask, "audit", move |_, outcome| {
            if !outcome.proceed {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let service = service_with(LoopbackTransport::new(), hooks, settings());
        let appended = service.on_change(&article_update("42")).unwrap();

        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].log, WEBFARM_LOG);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_append_failure_reaches_producer() {
        let (service, _) = service();
        let journal = MemoryJournal::new();
        let log = TaskLog::open(WEBFARM_LOG, Box::new(journal.clone()), NodeId::named("web1")).unwrap();
        service.attach_log(log);
        journal.set_fail_writes(true);

        let result = service.on_change(&ChangeContext::new("session", "s", ChangeKind::Delete));

        assert!(matches!(
            result,
            Err(SyncError::Log(LogError::AppendFailed { .. }))
        ));
    }

    // ============================================================
    // TEST 2: End to end
    // ============================================================

    #[tokio::test]
    async fn test_change_reaches_farm_and_staging_peers() {
        let (service, transport) = service();
        let (web2, caches) = farm_peer("web2");
        let (s1, store) = staging_peer("s1");
        transport.connect("web2", web2);
        transport.connect("s1", s1);
        caches.put("article", "42", "stale copy");

        service
            .add_destination(Destination::farm_node("web2", "loopback://web2"), &[WEBFARM_LOG.to_string()])
            .unwrap();
        service
            .add_destination(Destination::staging_target("s1", "loopback://s1"), &[staging_log_name("s1")])
            .unwrap();
        service.start();
        assert_eq!(service.dispatcher_count(), 2);

        service.on_change(&article_update("42").with_binary(vec![9; 16])).unwrap();

        assert!(eventually(|| caches.get("article", "42").is_none()).await);
        assert!(eventually(|| store.get("article", "42").is_some()).await);
        let staged = store.get("article", "42").unwrap();
        assert_eq!(staged.binary, Some(vec![9; 16]));

        service.shutdown();
        assert_eq!(service.dispatcher_count(), 0);
    }

    #[tokio::test]
    async fn test_rapid_updates_leave_latest_staged_state() {
        let (service, transport) = service();
        let (s1, store) = staging_peer("s1");
        transport.connect("s1", s1);
        service
            .add_destination(Destination::staging_target("s1", "loopback://s1"), &[staging_log_name("s1")])
            .unwrap();

        for version in 0..50 {
            let change = ChangeContext::new("article", "42", ChangeKind::Update)
                .with_fields(TaskPayload::new().with("title", format!("v{}", version)));
            service.on_change(&change).unwrap();
        }
        service.start();

        let log = service.log(&staging_log_name("s1")).unwrap();
        assert!(eventually(|| log.depth("s1").unwrap() == 0).await);

        let staged = store.get("article", "42").unwrap();
        assert_eq!(staged.fields.get("title"), Some(&FieldValue::Text("v49".into())));
        assert_eq!(staged.version.seq, 50);
        service.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_peer_catches_up_after_recovery() {
        let (service, transport) = service();
        let (web2, caches) = farm_peer("web2");
        transport.connect("web2", web2);
        transport.set_reachable("web2", false);
        caches.put("article", "1", "x");
        caches.put("article", "2", "x");

        service
            .add_destination(Destination::farm_node("web2", "loopback://web2"), &[WEBFARM_LOG.to_string()])
            .unwrap();
        service.start();

        service.on_change(&article_update("1")).unwrap();
        service.on_change(&article_update("2")).unwrap();

        let tracker = service.tracker().clone();
        assert!(eventually(|| tracker.state("web2") == Some(HealthState::Unreachable)).await);
        assert_eq!(caches.group_len("article"), 2);

        transport.set_reachable("web2", true);

        assert!(eventually(|| caches.group_len("article") == 0).await);
        assert_eq!(tracker.state("web2"), Some(HealthState::Healthy));
        service.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_and_add_run_one_dispatcher_per_pair() {
        for _ in 0..20 {
            let (service, transport) = service();
            for name in ["web2", "web3"] {
                let (peer, _) = farm_peer(name);
                transport.connect(name, peer);
            }
            service
                .add_destination(Destination::farm_node("web2", "loopback://web2"), &[WEBFARM_LOG.to_string()])
                .unwrap();

            let starter = {
                let service = service.clone();
                tokio::task::spawn_blocking(move || service.start())
            };
            let adder = {
                let service = service.clone();
                tokio::task::spawn_blocking(move || {
                    service.add_destination(
                        Destination::farm_node("web3", "loopback://web3"),
                        &[WEBFARM_LOG.to_string()],
                    )
                })
            };
            starter.await.unwrap();
            adder.await.unwrap().unwrap();

            assert_eq!(service.dispatcher_count(), 2);
            let log = service.log(WEBFARM_LOG).unwrap();
            assert!(eventually(|| log.watcher_count() == 2).await);
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(log.watcher_count(), 2);

            service.shutdown();
        }
    }

    // ============================================================
    // TEST 3: Administration
    // ============================================================

    #[tokio::test]
    async fn test_remove_destination_reassigns_pending_tasks() {
        let (service, _) = service();
        service.open_log("fallback").unwrap();
        service
            .add_destination(Destination::farm_node("web2", "loopback://web2"), &[WEBFARM_LOG.to_string()])
            .unwrap();
        service
            .add_destination(Destination::farm_node("web3", "loopback://web3"), &["fallback".to_string()])
            .unwrap();

        service.on_change(&article_update("1")).unwrap();
        service.on_change(&article_update("2")).unwrap();

        let moved = service
            .remove_destination("web2", RemovalPolicy::Reassign { log: "fallback".into() })
            .unwrap();

        assert_eq!(moved, 2);
        let fallback = service.log("fallback").unwrap();
        assert_eq!(fallback.depth("web3").unwrap(), 2);
        assert!(service.tracker().health("web2").is_none());
        assert!(service.log(WEBFARM_LOG).unwrap().destinations().is_empty());
    }

    #[tokio::test]
    async fn test_remove_destination_errors() {
        let (service, _) = service();
        service
            .add_destination(Destination::farm_node("web2", "loopback://web2"), &[WEBFARM_LOG.to_string()])
            .unwrap();

        assert!(matches!(
            service.remove_destination("ghost", RemovalPolicy::Discard),
            Err(SyncError::UnknownDestination(_))
        ));
        assert!(matches!(
            service.remove_destination("web2", RemovalPolicy::Reassign { log: "nowhere".into() }),
            Err(SyncError::UnknownLog(_))
        ));
        assert_eq!(service.remove_destination("web2", RemovalPolicy::Discard).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_readding_destination_with_other_address_is_rejected() {
        let (service, _) = service();
        service
            .add_destination(Destination::farm_node("web2", "http://a"), &[WEBFARM_LOG.to_string()])
            .unwrap();

        service
            .add_destination(Destination::farm_node("web2", "http://a"), &["other".to_string()])
            .unwrap();
        assert!(matches!(
            service.add_destination(Destination::farm_node("web2", "http://b"), &[]),
            Err(SyncError::DuplicateDestination(_))
        ));
    }

    #[tokio::test]
    async fn test_group_cancel_and_replay() {
        let (service, _) = service();
        service
            .add_destination(Destination::farm_node("web2", "loopback://web2"), &[WEBFARM_LOG.to_string()])
            .unwrap();
        service
            .add_destination(Destination::staging_target("s1", "loopback://s1"), &[staging_log_name("s1")])
            .unwrap();

        let group = service.create_group("spring-launch", "Homepage refresh");
        service.on_change(&article_update("1").in_group(group.id.clone())).unwrap();
        service.on_change(&article_update("2").in_group(group.id.clone())).unwrap();
        service.on_change(&article_update("3")).unwrap();

        assert_eq!(service.cancel_group(&group.id).unwrap(), 4);
        assert_eq!(service.dead_letters().len(), 4);
        assert!(
            service
                .dead_letters()
                .iter()
                .all(|entry| entry.dead.reason == "task group cancelled")
        );

        let staging = service.log(&staging_log_name("s1")).unwrap();
        assert_eq!(staging.depth("s1").unwrap(), 1);

        assert_eq!(service.replay_group(&group.id).unwrap(), 4);
        assert_eq!(staging.depth("s1").unwrap(), 3);
        assert_eq!(staging.tasks_in_group(&group.id).len(), 4);

        let unknown = TaskGroupId::new();
        assert!(matches!(
            service.cancel_group(&unknown),
            Err(SyncError::UnknownGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_destination_stats_and_admin_toggles() {
        let (service, _) = service();
        service
            .add_destination(Destination::farm_node("web2", "loopback://web2"), &[WEBFARM_LOG.to_string()])
            .unwrap();
        service.on_change(&article_update("1")).unwrap();

        service.disable_destination("web2").unwrap();
        let stats = service.destination_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].state, HealthState::Disabled);
        assert_eq!(stats[0].logs[0].depth, 1);
        assert_eq!(stats[0].dead, 0);

        service.enable_destination("web2").unwrap();
        assert_eq!(service.destination_stats()[0].state, HealthState::Healthy);

        assert!(matches!(
            service.enable_destination("ghost"),
            Err(SyncError::UnknownDestination(_))
        ));
    }

    #[tokio::test]
    async fn test_http_handlers() {
        let (service, _) = service();

        let (status, body) =
            handle_change(Extension(service.clone()), Json(article_update("5"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0.appended.len(), 2);

        let (status, body) =
            handle_cancel_group(Extension(service), Path("no-such-group".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.0.error.is_some());
    }

    // ============================================================
    // TEST 4: Durability
    // ============================================================

    #[tokio::test]
    async fn test_logs_reopen_from_journal_directory() {
        let dir = tempfile::tempdir().unwrap();
        let durable = ServiceSettings {
            journal_dir: Some(dir.path().to_path_buf()),
            ..settings()
        };

        {
            let service = service_with(LoopbackTransport::new(), HookRegistry::new(), durable.clone());
            service
                .add_destination(Destination::farm_node("web2", "loopback://web2"), &[WEBFARM_LOG.to_string()])
                .unwrap();
            service.on_change(&article_update("1")).unwrap();
            service.on_change(&article_update("2")).unwrap();
        }

        let service = service_with(LoopbackTransport::new(), HookRegistry::new(), durable);
        let log = service.open_log(WEBFARM_LOG).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.destinations(), vec!["web2".to_string()]);
        assert_eq!(log.depth("web2").unwrap(), 2);
        assert!(dir.path().join("webfarm.journal").exists());
        assert!(dir.path().join("staging_3as1.journal").exists());
    }

    #[test]
    fn test_journal_file_names_do_not_collide() {
        assert_eq!(journal_file_name("webfarm"), "webfarm.journal");
        assert_eq!(journal_file_name("staging:s1"), "staging_3as1.journal");
        assert_eq!(journal_file_name("staging_s1"), "staging_5fs1.journal");
        assert_eq!(journal_file_name("../etc"), "_2e_2e_2fetc.journal");

        let names = ["staging:s1", "staging_s1", "staging/s1", "staging-s1", "staging s1"];
        let files: std::collections::HashSet<String> =
            names.iter().map(|name| journal_file_name(name)).collect();
        assert_eq!(files.len(), names.len());
    }

    #[tokio::test]
    async fn test_separately_named_logs_keep_separate_journals() {
        let dir = tempfile::tempdir().unwrap();
        let durable = ServiceSettings {
            journal_dir: Some(dir.path().to_path_buf()),
            ..settings()
        };

        {
            let service = service_with(LoopbackTransport::new(), HookRegistry::new(), durable.clone());
            service.open_log("staging:s1").unwrap().append(TaskDraft::new("upsert-object")).unwrap();
            service.open_log("staging_s1").unwrap();
        }

        let service = service_with(LoopbackTransport::new(), HookRegistry::new(), durable);
        assert_eq!(service.open_log("staging:s1").unwrap().len(), 1);
        assert_eq!(service.open_log("staging_s1").unwrap().len(), 0);
    }
}
