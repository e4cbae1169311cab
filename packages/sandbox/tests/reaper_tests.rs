// ABOUTME: Integration tests for the leader-gated reaper duties
// ABOUTME: Drives each duty directly against a manual clock and checks resulting sandbox state

mod common;

use common::{harness, Harness, ORG};
use pretty_assertions::assert_eq;
use sandchest_coordination::{CoordinationStore, LeaderElection};
use sandchest_core::Clock;
use sandchest_sandbox::{CreateSandboxRequest, Reaper, ReaperConfig, DUTIES};
use sandchest_storage::{replay_log_key, SandboxRepository, SandboxStatus};
use std::sync::Arc;

fn reaper(h: &Harness, instance_id: &str) -> Reaper {
    Reaper::new(
        h.manager.clone(),
        LeaderElection::new(h.coordination.clone(), instance_id, 30),
        ReaperConfig::default(),
    )
}

async fn create_with_ttl(h: &Harness, ttl_seconds: i64) -> sandchest_storage::Sandbox {
    h.create_with(CreateSandboxRequest {
        org_id: ORG.to_string(),
        ttl_seconds: Some(ttl_seconds),
        ..CreateSandboxRequest::default()
    })
    .await
}

#[tokio::test]
async fn ttl_duty_stops_expired_sandboxes() {
    let h = harness().await;
    h.add_node("node_a", 2).await;
    let short = create_with_ttl(&h, 60).await;
    let long = create_with_ttl(&h, 3600).await;
    let reaper = reaper(&h, "instance-a");

    h.clock.advance_secs(61);
    assert_eq!(reaper.run_duty("ttl").await.unwrap(), 1);

    let short = h.manager.get(ORG, &short.id).await.unwrap();
    assert_eq!(short.status, SandboxStatus::Stopped);
    assert_eq!(short.failure_reason.as_deref(), Some("ttl_expired"));
    assert_eq!(h.manager.leases().holder("node_a", 0).await.unwrap(), None);
    assert_eq!(
        h.manager.get(ORG, &long.id).await.unwrap().status,
        SandboxStatus::Running
    );

    assert_eq!(reaper.run_duty("ttl").await.unwrap(), 0);
}

#[tokio::test]
async fn ttl_warning_fires_once() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = create_with_ttl(&h, 600).await;
    let reaper = reaper(&h, "instance-a");

    assert_eq!(reaper.run_duty("ttl_warning").await.unwrap(), 0);
    h.clock.advance_secs(400);
    assert_eq!(reaper.run_duty("ttl_warning").await.unwrap(), 1);
    assert_eq!(reaper.run_duty("ttl_warning").await.unwrap(), 0);

    let warnings = h
        .event_types(&sandbox.id)
        .await
        .into_iter()
        .filter(|t| t == "sandbox.ttl_warning")
        .count();
    assert_eq!(warnings, 1);
}

#[tokio::test]
async fn idle_duty_stops_inactive_sandboxes() {
    let h = harness().await;
    h.add_node("node_a", 2).await;
    let idle = h.create().await;
    let busy = h.create().await;
    let reaper = reaper(&h, "instance-a");

    h.clock.advance_secs(600);
    h.manager
        .put_file(ORG, &busy.id, "/work/keepalive", b"1".to_vec())
        .await
        .unwrap();
    h.clock.advance_secs(301);

    assert_eq!(reaper.run_duty("idle").await.unwrap(), 1);
    let idle = h.manager.get(ORG, &idle.id).await.unwrap();
    assert_eq!(idle.status, SandboxStatus::Stopped);
    assert_eq!(idle.failure_reason.as_deref(), Some("idle_timeout"));
    assert_eq!(
        h.manager.get(ORG, &busy.id).await.unwrap().status,
        SandboxStatus::Running
    );
}

#[tokio::test]
async fn queue_duty_fails_sandboxes_past_deadline() {
    let h = harness().await;
    let sandbox = h
        .create_with(CreateSandboxRequest {
            org_id: ORG.to_string(),
            queue_timeout_seconds: Some(10),
            ..CreateSandboxRequest::default()
        })
        .await;
    let reaper = reaper(&h, "instance-a");

    h.clock.advance_secs(5);
    assert_eq!(reaper.run_duty("queue").await.unwrap(), 0);
    h.clock.advance_secs(6);
    assert_eq!(reaper.run_duty("queue").await.unwrap(), 1);

    let sandbox = h.manager.get(ORG, &sandbox.id).await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Failed);
    assert_eq!(sandbox.failure_reason.as_deref(), Some("queue_timeout"));
}

#[tokio::test]
async fn scheduler_duty_places_queued_sandboxes_once_capacity_appears() {
    let h = harness().await;
    let sandbox = h.create().await;
    let reaper = reaper(&h, "instance-a");

    assert_eq!(reaper.run_duty("scheduler").await.unwrap(), 0);
    h.add_node("node_a", 1).await;
    assert_eq!(reaper.run_duty("scheduler").await.unwrap(), 1);

    let sandbox = h.manager.get(ORG, &sandbox.id).await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Running);
    assert_eq!(sandbox.node_id.as_deref(), Some("node_a"));
}

#[tokio::test]
async fn nodes_duty_fails_sandboxes_on_silent_nodes() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    h.add_node("node_b", 1).await;
    let on_a = h.create().await;
    let on_b = h.create().await;
    let reaper = reaper(&h, "instance-a");

    h.clock.advance_secs(30);
    h.add_node(on_b.node_id.as_deref().unwrap(), 1).await;
    h.clock.advance_secs(20);

    assert_eq!(reaper.run_duty("nodes").await.unwrap(), 1);
    let lost = h.manager.get(ORG, &on_a.id).await.unwrap();
    assert_eq!(lost.status, SandboxStatus::Failed);
    assert_eq!(lost.failure_reason.as_deref(), Some("node_lost"));
    assert_eq!(
        h.manager.get(ORG, &on_b.id).await.unwrap().status,
        SandboxStatus::Running
    );
}

#[tokio::test]
async fn nodes_duty_treats_store_outage_as_unknown() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;
    let reaper = reaper(&h, "instance-a");

    h.coordination.set_unavailable(true);
    assert!(reaper.run_duty("nodes").await.is_err());
    h.coordination.set_unavailable(false);

    assert_eq!(
        h.manager.get(ORG, &sandbox.id).await.unwrap().status,
        SandboxStatus::Running
    );
}

#[tokio::test]
async fn lease_duty_keeps_running_sandboxes_leased() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;
    let reaper = reaper(&h, "instance-a");

    for _ in 0..3 {
        h.clock.advance_secs(40);
        assert_eq!(reaper.run_duty("leases").await.unwrap(), 1);
    }
    assert_eq!(
        h.manager.leases().holder("node_a", 0).await.unwrap().as_deref(),
        Some(sandbox.id.as_str())
    );
}

#[tokio::test]
async fn lease_duty_fails_a_sandbox_whose_slot_was_taken() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let first = h.create().await;
    assert_eq!(first.slot, Some(0));
    let reaper = reaper(&h, "instance-a");

    // The lease lapses while the node keeps heartbeating and a newcomer takes the slot.
    h.clock.advance_secs(61);
    h.add_node("node_a", 1).await;
    let second = h.create().await;
    assert_eq!(second.status, SandboxStatus::Running);
    assert_eq!(second.slot, Some(0));

    assert_eq!(reaper.run_duty("leases").await.unwrap(), 1);

    let first = h.manager.get(ORG, &first.id).await.unwrap();
    assert_eq!(first.status, SandboxStatus::Failed);
    assert_eq!(first.failure_reason.as_deref(), Some("lease_lost"));
    assert!(!h.nodes.has_vm(&first.id));
    assert_eq!(
        h.manager.get(ORG, &second.id).await.unwrap().status,
        SandboxStatus::Running
    );
    assert_eq!(
        h.manager.leases().holder("node_a", 0).await.unwrap().as_deref(),
        Some(second.id.as_str())
    );
}

#[tokio::test]
async fn lease_duty_renews_sandboxes_that_are_stopping() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;
    assert!(h
        .repo
        .transition_status(
            &sandbox.id,
            &[SandboxStatus::Running],
            SandboxStatus::Stopping,
            None,
            h.clock.now(),
        )
        .await
        .unwrap());
    let reaper = reaper(&h, "instance-a");

    for _ in 0..3 {
        h.clock.advance_secs(40);
        assert_eq!(reaper.run_duty("leases").await.unwrap(), 1);
    }
    assert_eq!(
        h.manager.leases().holder("node_a", 0).await.unwrap().as_deref(),
        Some(sandbox.id.as_str())
    );
}

#[tokio::test]
async fn stuck_duty_fails_sandboxes_left_mid_transition() {
    let h = harness().await;
    h.add_node("node_a", 2).await;
    let stopping = h.create().await;
    h.repo
        .transition_status(
            &stopping.id,
            &[SandboxStatus::Running],
            SandboxStatus::Stopping,
            None,
            h.clock.now(),
        )
        .await
        .unwrap();
    let running = h.create().await;
    let reaper = reaper(&h, "instance-a");

    h.clock.advance_secs(299);
    assert_eq!(reaper.run_duty("stuck").await.unwrap(), 0);
    h.clock.advance_secs(1);
    assert_eq!(reaper.run_duty("stuck").await.unwrap(), 1);

    let stopping = h.manager.get(ORG, &stopping.id).await.unwrap();
    assert_eq!(stopping.status, SandboxStatus::Failed);
    assert_eq!(stopping.failure_reason.as_deref(), Some("transition_timeout"));
    assert_eq!(h.manager.leases().holder("node_a", 0).await.unwrap(), None);
    assert_eq!(
        h.manager.get(ORG, &running.id).await.unwrap().status,
        SandboxStatus::Running
    );
    assert_eq!(reaper.run_duty("stuck").await.unwrap(), 0);
}

#[tokio::test]
async fn stuck_duty_fails_abandoned_provisioning() {
    let h = harness().await;
    let sandbox = h.create().await;
    assert_eq!(sandbox.status, SandboxStatus::Queued);
    // An instance assigned the slot and died before the node answered.
    assert!(h
        .repo
        .assign_node(&sandbox.id, "node_a", 0, h.clock.now())
        .await
        .unwrap());
    let reaper = reaper(&h, "instance-a");

    h.clock.advance_secs(120);
    assert_eq!(reaper.run_duty("stuck").await.unwrap(), 0);
    h.clock.advance_secs(200);
    assert_eq!(reaper.run_duty("stuck").await.unwrap(), 1);

    let sandbox = h.manager.get(ORG, &sandbox.id).await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Failed);
    assert_eq!(sandbox.failure_reason.as_deref(), Some("transition_timeout"));
}

#[tokio::test]
async fn replay_retention_is_set_then_purged() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;
    h.manager.stop(ORG, &sandbox.id).await.unwrap();
    h.notifier.sync().await;
    let reaper = reaper(&h, "instance-a");

    let key = replay_log_key(ORG, &sandbox.id);
    assert!(h.objects.keys().await.contains(&key));

    assert_eq!(reaper.run_duty("replay_expiry").await.unwrap(), 1);
    let stopped = h.repo.get_sandbox(&sandbox.id).await.unwrap();
    let ended_at = stopped.ended_at.unwrap();
    assert_eq!(
        stopped.replay_expires_at,
        Some(ended_at + chrono::Duration::days(30))
    );
    assert_eq!(reaper.run_duty("replay_expiry").await.unwrap(), 0);

    assert_eq!(reaper.run_duty("replay_purge").await.unwrap(), 0);
    h.clock.advance_secs(31 * 24 * 3600);
    assert_eq!(reaper.run_duty("replay_purge").await.unwrap(), 1);

    assert!(!h.objects.keys().await.contains(&key));
    let purged = h.repo.get_sandbox(&sandbox.id).await.unwrap();
    assert!(purged.replay_purged_at.is_some());
    assert!(h.manager.replay(ORG, &sandbox.id, 0).await.unwrap().is_empty());
    assert_eq!(reaper.run_duty("replay_purge").await.unwrap(), 0);
}

#[tokio::test]
async fn only_one_instance_leads_each_duty() {
    let h = harness().await;
    let a = reaper(&h, "instance-a");
    let b = reaper(&h, "instance-b");

    let report_a = a.sweep_once().await;
    let report_b = b.sweep_once().await;
    assert_eq!(report_a.len(), DUTIES.len());
    assert!(report_b.is_empty());

    h.clock.advance_secs(31);
    let report_b = b.sweep_once().await;
    assert_eq!(report_b.len(), DUTIES.len());
    assert!(a.sweep_once().await.is_empty());
}

#[tokio::test]
async fn leader_lock_outage_skips_every_duty() {
    let h = harness().await;
    let a = reaper(&h, "instance-a");

    h.coordination.set_unavailable(true);
    assert!(a.sweep_once().await.is_empty());
    h.coordination.set_unavailable(false);
    assert!(h.coordination.purge_expired().await.is_ok());
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let h = harness().await;
    let reaper = Arc::new(reaper(&h, "instance-a"));

    reaper.start().await;
    reaper.start().await;
    reaper.stop().await;
    reaper.stop().await;
}
