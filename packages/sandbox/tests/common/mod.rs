// ABOUTME: Shared fixture for sandbox integration tests
// ABOUTME: In-memory SQLite, in-memory coordination and object stores, a fake node agent and a manual clock

#![allow(dead_code)]

use sandchest_coordination::{LeaseManager, MemoryCoordinationStore};
use sandchest_core::ManualClock;
use sandchest_sandbox::{
    CreateSandboxRequest, FakeNodeClient, ManagerConfig, ManagerDeps, NodeHeartbeat,
    ReplayNotifier, ReplayRecorder, SandboxManager,
};
use sandchest_storage::{MemoryObjectStore, Sandbox, SqliteRepository};
use std::collections::HashMap;
use std::sync::Arc;

pub const ORG: &str = "org_acme";
pub const START_MS: i64 = 1_767_225_600_000;

pub struct Harness {
    pub manager: SandboxManager,
    pub repo: Arc<SqliteRepository>,
    pub coordination: Arc<MemoryCoordinationStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub nodes: Arc<FakeNodeClient>,
    pub recorder: Arc<ReplayRecorder>,
    pub notifier: ReplayNotifier,
    pub clock: ManualClock,
}

pub async fn harness() -> Harness {
    harness_with(ManagerConfig {
        flush_timeout_secs: 5,
        ..ManagerConfig::default()
    })
    .await
}

pub async fn harness_with(config: ManagerConfig) -> Harness {
    let clock = ManualClock::new(START_MS);
    let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
    let coordination = Arc::new(MemoryCoordinationStore::new(Arc::new(clock.clone())));
    let objects = Arc::new(MemoryObjectStore::new());
    let nodes = Arc::new(FakeNodeClient::new());
    let recorder = Arc::new(ReplayRecorder::new(
        coordination.clone(),
        objects.clone(),
        Arc::new(clock.clone()),
    ));
    let (notifier, _worker) = ReplayNotifier::spawn(recorder.clone());

    let manager = SandboxManager::new(
        ManagerDeps {
            repo: repo.clone(),
            nodes: nodes.clone(),
            coordination: coordination.clone(),
            leases: LeaseManager::new(coordination.clone(), 60),
            objects: objects.clone(),
            recorder: recorder.clone(),
            notifier: notifier.clone(),
            clock: Arc::new(clock.clone()),
        },
        config,
    );

    Harness {
        manager,
        repo,
        coordination,
        objects,
        nodes,
        recorder,
        notifier,
        clock,
    }
}

impl Harness {
    pub async fn add_node(&self, node_id: &str, slots_total: u32) {
        self.manager
            .node_heartbeat(NodeHeartbeat {
                node_id: node_id.to_string(),
                address: Some(format!("http://{}.internal:7070", node_id)),
                slots_total,
                active_sandbox_ids: Vec::new(),
            })
            .await
            .unwrap();
    }

    pub async fn create(&self) -> Sandbox {
        self.create_with(CreateSandboxRequest {
            org_id: ORG.to_string(),
            ..CreateSandboxRequest::default()
        })
        .await
    }

    pub async fn create_with(&self, request: CreateSandboxRequest) -> Sandbox {
        self.manager.create(request).await.unwrap()
    }

    /// Event types recorded so far for `sandbox_id`, after the notifier drains.
    pub async fn event_types(&self, sandbox_id: &str) -> Vec<String> {
        self.notifier.sync().await;
        self.manager
            .replay(ORG, sandbox_id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }
}

pub fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
