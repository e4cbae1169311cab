// ABOUTME: Control plane bootstrap: builds stores, manager, reaper and router, then serves
// ABOUTME: On SIGINT or SIGTERM it drains, stops the reaper and flushes replay buffers before exiting

use anyhow::Context;
use sandchest_api::{create_router, AppState, DrainController, RateLimiter, StaticQuotas};
use sandchest_coordination::{
    CoordinationStore, LeaderElection, LeaseManager, MemoryCoordinationStore, SqlCoordinationStore,
};
use sandchest_core::{Clock, SystemClock};
use sandchest_sandbox::{
    HttpNodeClient, ManagerConfig, ManagerDeps, Reaper, ReaperConfig, ReplayNotifier,
    ReplayRecorder, RepositoryDirectory, SandboxManager,
};
use sandchest_storage::{
    MemoryObjectStore, ObjectStore, S3Config, S3ObjectStore, SqliteRepository,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{Config, CoordinationBackend, ObjectStoreBackend};

/// Pieces the shutdown sequence needs after the router takes the state.
struct Shutdown {
    drain: DrainController,
    reaper: Arc<Reaper>,
    notifier: ReplayNotifier,
    recorder: Arc<ReplayRecorder>,
    drain_timeout: Duration,
}

async fn build_objects(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config.object_store {
        ObjectStoreBackend::Memory => {
            warn!("Using in-memory object store; replay logs and artifacts will not survive restarts");
            Ok(Arc::new(MemoryObjectStore::new()))
        }
        ObjectStoreBackend::S3 => {
            let bucket = config
                .s3_bucket
                .clone()
                .context("SANDCHEST_S3_BUCKET is required for the s3 object store")?;
            let store = S3ObjectStore::from_config(S3Config {
                bucket,
                region: config.s3_region.clone(),
                endpoint: config.s3_endpoint.clone(),
                operation_timeout: Duration::from_secs(config.s3_timeout_secs),
            })
            .await
            .context("failed to initialize S3 object store")?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let repo = Arc::new(
        SqliteRepository::connect(&config.database_url)
            .await
            .context("failed to open database")?,
    );
    let coordination: Arc<dyn CoordinationStore> = match config.coordination {
        CoordinationBackend::Memory => {
            warn!("Using in-memory coordination; leases and rate limits are local to this instance");
            Arc::new(MemoryCoordinationStore::new(clock.clone()))
        }
        CoordinationBackend::Sql => Arc::new(
            SqlCoordinationStore::new(repo.pool().clone(), clock.clone())
                .await
                .context("failed to initialize coordination store")?,
        ),
    };
    let objects = build_objects(&config).await?;

    let nodes = Arc::new(
        HttpNodeClient::new(
            Arc::new(RepositoryDirectory::new(repo.clone())),
            Duration::from_secs(config.node_timeout_secs),
        )
        .context("failed to build node client")?,
    );
    let recorder = Arc::new(ReplayRecorder::new(
        coordination.clone(),
        objects.clone(),
        clock.clone(),
    ));
    let (notifier, _notifier_task) = ReplayNotifier::spawn(recorder.clone());

    let manager = SandboxManager::new(
        ManagerDeps {
            repo,
            nodes,
            coordination: coordination.clone(),
            leases: LeaseManager::new(coordination.clone(), config.lease_ttl_secs),
            objects,
            recorder: recorder.clone(),
            notifier: notifier.clone(),
            clock: clock.clone(),
        },
        ManagerConfig {
            max_fork_depth: config.max_fork_depth,
            default_ttl_secs: config.default_ttl_secs,
            node_heartbeat_ttl_secs: config.node_heartbeat_ttl_secs,
            ..ManagerConfig::default()
        },
    );

    let reaper = Arc::new(Reaper::new(
        manager.clone(),
        LeaderElection::new(
            coordination.clone(),
            config.instance_id.clone(),
            config.leader_ttl_secs,
        ),
        ReaperConfig {
            interval_secs: config.reaper_interval_secs,
            idle_timeout_secs: config.idle_timeout_secs,
            transition_timeout_secs: config.transition_timeout_secs,
            replay_retention_days: config.replay_retention_days,
            ..ReaperConfig::default()
        },
    ));
    reaper.start().await;

    if config.api_keys.is_empty() {
        warn!("No API keys configured; every tenant request will be rejected");
    }
    if config.internal_token.is_none() {
        warn!("No internal token configured; node heartbeats will be rejected");
    }

    let drain = DrainController::new();
    let limiter = RateLimiter::new(
        coordination,
        Arc::new(StaticQuotas::new(config.rate_limits)),
        clock,
    );
    let state = AppState::new(
        manager,
        config.api_keys.clone(),
        config.internal_token.clone(),
        limiter,
        drain.clone(),
    );
    let app = create_router(state);

    let addr = SocketAddr::new(config.bind, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(
        address = %addr,
        instance_id = %config.instance_id,
        api_keys = config.api_keys.len(),
        "Sandchest control plane listening"
    );

    let shutdown = Shutdown {
        drain,
        reaper,
        notifier,
        recorder,
        drain_timeout: Duration::from_secs(config.drain_timeout_secs),
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_sequence(shutdown))
        .await
        .context("server error")?;

    info!("Sandchest control plane stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Resolves once in-flight work has drained or the timeout passed and buffers are flushed.
async fn shutdown_sequence(shutdown: Shutdown) {
    shutdown_signal().await;
    run_shutdown(shutdown).await;
}

async fn run_shutdown(shutdown: Shutdown) {
    shutdown.drain.begin_drain();
    if tokio::time::timeout(shutdown.drain_timeout, shutdown.drain.await_drained())
        .await
        .is_err()
    {
        warn!(
            active_connections = shutdown.drain.active_connections(),
            timeout_secs = shutdown.drain_timeout.as_secs(),
            "Drain timed out, shutting down with requests in flight"
        );
    } else {
        info!("All in-flight requests finished");
    }

    shutdown.reaper.stop().await;
    shutdown.notifier.sync().await;
    let flushed = shutdown.recorder.flush_all().await;
    info!(flushed_sandboxes = flushed, "Replay buffers flushed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandchest_core::ManualClock;

    #[tokio::test]
    async fn test_shutdown_flushes_buffered_replay_events() {
        let clock = ManualClock::new(1_767_225_600_000);
        let coordination = Arc::new(MemoryCoordinationStore::new(Arc::new(clock.clone())));
        let objects = Arc::new(MemoryObjectStore::new());
        let recorder = Arc::new(ReplayRecorder::new(
            coordination.clone(),
            objects.clone(),
            Arc::new(clock.clone()),
        ));
        let (notifier, _task) = ReplayNotifier::spawn(recorder.clone());
        let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
        let manager = SandboxManager::new(
            ManagerDeps {
                repo,
                nodes: Arc::new(HttpNodeClient::new(
                    Arc::new(sandchest_sandbox::StaticDirectory::new(Default::default())),
                    Duration::from_secs(1),
                )
                .unwrap()),
                coordination: coordination.clone(),
                leases: LeaseManager::new(coordination.clone(), 60),
                objects: objects.clone(),
                recorder: recorder.clone(),
                notifier: notifier.clone(),
                clock: Arc::new(clock.clone()),
            },
            ManagerConfig::default(),
        );
        let sandbox = manager
            .create(sandchest_sandbox::CreateSandboxRequest {
                org_id: "org_1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let reaper = Arc::new(Reaper::new(
            manager.clone(),
            LeaderElection::new(coordination.clone(), "inst_test", 30),
            ReaperConfig::default(),
        ));
        reaper.start().await;

        let drain = DrainController::new();
        run_shutdown(Shutdown {
            drain: drain.clone(),
            reaper,
            notifier,
            recorder,
            drain_timeout: Duration::from_secs(1),
        })
        .await;

        assert!(drain.is_draining());
        let keys = objects.keys().await;
        assert!(
            keys.iter().any(|k| k.contains(&sandbox.id) && k.ends_with("events.jsonl")),
            "{:?}",
            keys
        );
    }

    #[tokio::test]
    async fn test_shutdown_gives_up_after_the_drain_timeout() {
        let clock = ManualClock::new(0);
        let coordination = Arc::new(MemoryCoordinationStore::new(Arc::new(clock.clone())));
        let recorder = Arc::new(ReplayRecorder::new(
            coordination.clone(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(clock.clone()),
        ));
        let (notifier, _task) = ReplayNotifier::spawn(recorder.clone());
        let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
        let manager = SandboxManager::new(
            ManagerDeps {
                repo,
                nodes: Arc::new(HttpNodeClient::new(
                    Arc::new(sandchest_sandbox::StaticDirectory::new(Default::default())),
                    Duration::from_secs(1),
                )
                .unwrap()),
                coordination: coordination.clone(),
                leases: LeaseManager::new(coordination.clone(), 60),
                objects: Arc::new(MemoryObjectStore::new()),
                recorder: recorder.clone(),
                notifier: notifier.clone(),
                clock: Arc::new(clock),
            },
            ManagerConfig::default(),
        );
        let reaper = Arc::new(Reaper::new(
            manager,
            LeaderElection::new(coordination, "inst_test", 30),
            ReaperConfig::default(),
        ));

        let drain = DrainController::new();
        let _stuck = drain.track_connection();
        let started = std::time::Instant::now();
        run_shutdown(Shutdown {
            drain: drain.clone(),
            reaper,
            notifier,
            recorder,
            drain_timeout: Duration::from_millis(100),
        })
        .await;

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(drain.active_connections(), 1);
    }
}
