// ABOUTME: Integration tests for the sandbox state machine and fork manager
// ABOUTME: Scheduling, forking, fork trees, stop/delete idempotence, exec, sessions, files and artifacts

mod common;

use common::{env, harness, harness_with, ORG};
use pretty_assertions::assert_eq;
use sandchest_core::Clock;
use sandchest_sandbox::{
    CreateSandboxRequest, ExecRequest, ForkRequest, ManagerConfig, ManagerError, ScriptedExec,
};
use sandchest_storage::{ExecStatus, Sandbox, SandboxRepository, SandboxStatus};
use std::collections::HashSet;
use std::time::Duration;

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[tokio::test]
async fn create_places_sandbox_on_live_node() {
    let h = harness().await;
    h.add_node("node_a", 2).await;

    let sandbox = h.create().await;

    assert_eq!(sandbox.status, SandboxStatus::Running);
    assert_eq!(sandbox.node_id.as_deref(), Some("node_a"));
    assert_eq!(sandbox.slot, Some(0));
    assert!(sandbox.started_at.is_some());
    assert!(sandbox.expires_at.is_some());
    assert!(h.nodes.has_vm(&sandbox.id));
    assert_eq!(
        h.manager.leases().holder("node_a", 0).await.unwrap().as_deref(),
        Some(sandbox.id.as_str())
    );
}

#[tokio::test]
async fn sandbox_created_event_hides_env_values() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h
        .create_with(CreateSandboxRequest {
            org_id: ORG.to_string(),
            env: env(&[("OPENAI_API_KEY", "sk-secret")]),
            ..CreateSandboxRequest::default()
        })
        .await;

    h.notifier.sync().await;
    let events = h.manager.replay(ORG, &sandbox.id, 0).await.unwrap();
    assert_eq!(events[0].seq, 1);
    assert_eq!(events[0].kind, "sandbox.created");
    assert_eq!(events[0].data["env"]["OPENAI_API_KEY"], "[REDACTED]");
    assert!(!events[0].data.to_string().contains("sk-secret"));
}

#[tokio::test]
async fn create_without_capacity_stays_queued() {
    let h = harness().await;
    let sandbox = h.create().await;

    assert_eq!(sandbox.status, SandboxStatus::Queued);
    assert_eq!(sandbox.node_id, None);
}

#[tokio::test]
async fn create_rejects_unknown_profile_and_bad_ttl() {
    let h = harness().await;
    let err = h
        .manager
        .create(CreateSandboxRequest {
            org_id: ORG.to_string(),
            profile: Some("huge".to_string()),
            ..CreateSandboxRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Validation(_)));

    let err = h
        .manager
        .create(CreateSandboxRequest {
            org_id: ORG.to_string(),
            ttl_seconds: Some(0),
            ..CreateSandboxRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Validation(_)));
}

#[tokio::test]
async fn boot_failure_fails_sandbox_and_frees_slot() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    h.nodes.set_fail_create(true);

    let sandbox = h.create().await;

    assert_eq!(sandbox.status, SandboxStatus::Failed);
    assert_eq!(sandbox.failure_reason.as_deref(), Some("provision_failed"));
    assert!(sandbox.ended_at.is_some());
    assert_eq!(h.manager.leases().holder("node_a", 0).await.unwrap(), None);
}

#[tokio::test]
async fn lease_store_outage_propagates_from_create() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    h.coordination.set_unavailable(true);

    let err = h
        .manager
        .create(CreateSandboxRequest {
            org_id: ORG.to_string(),
            ..CreateSandboxRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Coordination(_)));
}

#[tokio::test]
async fn other_tenants_cannot_see_a_sandbox() {
    let h = harness().await;
    let sandbox = h.create().await;

    let err = h.manager.get("org_other", &sandbox.id).await.unwrap_err();
    assert!(matches!(err, ManagerError::NotFound(_)));
    let err = h.manager.delete("org_other", &sandbox.id).await.unwrap_err();
    assert!(matches!(err, ManagerError::NotFound(_)));
}

#[tokio::test]
async fn fork_depth_is_parent_depth_plus_one() {
    let h = harness().await;
    h.add_node("node_a", 4).await;
    let root = h.create().await;

    let child = h
        .manager
        .fork(ORG, &root.id, ForkRequest::default())
        .await
        .unwrap();
    let grandchild = h
        .manager
        .fork(ORG, &child.id, ForkRequest::default())
        .await
        .unwrap();

    assert_eq!(child.status, SandboxStatus::Running);
    assert_eq!(child.fork_depth, 1);
    assert_eq!(child.forked_from.as_deref(), Some(root.id.as_str()));
    assert_eq!(grandchild.fork_depth, 2);
    assert_eq!(grandchild.forked_from.as_deref(), Some(child.id.as_str()));
    assert_ne!(child.slot, root.slot);

    let root = h.manager.get(ORG, &root.id).await.unwrap();
    assert_eq!(root.fork_count, 1);
    assert!(h.nodes.has_vm(&grandchild.id));

    let types = h.event_types(&root.id).await;
    assert!(types.contains(&"sandbox.forked".to_string()));
}

#[tokio::test]
async fn fork_merges_env_and_overrides_ttl() {
    let h = harness().await;
    h.add_node("node_a", 2).await;
    let root = h
        .create_with(CreateSandboxRequest {
            org_id: ORG.to_string(),
            env: env(&[("A", "1"), ("B", "1")]),
            ..CreateSandboxRequest::default()
        })
        .await;

    let child = h
        .manager
        .fork(
            ORG,
            &root.id,
            ForkRequest {
                env: env(&[("B", "2")]),
                ttl_seconds: Some(120),
            },
        )
        .await
        .unwrap();

    assert_eq!(child.env.get("A").map(String::as_str), Some("1"));
    assert_eq!(child.env.get("B").map(String::as_str), Some("2"));
    assert_eq!(child.ttl_seconds, 120);
}

#[tokio::test]
async fn fork_depth_limit_is_enforced() {
    let h = harness_with(ManagerConfig {
        max_fork_depth: 1,
        flush_timeout_secs: 5,
        ..ManagerConfig::default()
    })
    .await;
    h.add_node("node_a", 4).await;
    let root = h.create().await;
    let child = h
        .manager
        .fork(ORG, &root.id, ForkRequest::default())
        .await
        .unwrap();

    let err = h
        .manager
        .fork(ORG, &child.id, ForkRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Validation(_)));
}

#[tokio::test]
async fn fork_requires_running_parent() {
    let h = harness().await;
    h.add_node("node_a", 2).await;
    let root = h.create().await;
    h.manager.stop(ORG, &root.id).await.unwrap();

    let err = h
        .manager
        .fork(ORG, &root.id, ForkRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::SandboxNotRunning(_)));
}

#[tokio::test]
async fn fork_on_full_node_reports_no_capacity() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let root = h.create().await;

    let err = h
        .manager
        .fork(ORG, &root.id, ForkRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::CapacityUnavailable(_)));
    assert_eq!(h.manager.get(ORG, &root.id).await.unwrap().fork_count, 0);
}

#[tokio::test]
async fn failed_clone_releases_the_child_slot() {
    let h = harness().await;
    h.add_node("node_a", 2).await;
    let root = h.create().await;
    h.nodes.set_fail_fork(true);

    assert!(h
        .manager
        .fork(ORG, &root.id, ForkRequest::default())
        .await
        .is_err());
    assert_eq!(h.manager.leases().holder("node_a", 1).await.unwrap(), None);
}

#[tokio::test]
async fn fork_tree_walks_to_root_then_breadth_first() {
    let h = harness().await;
    h.add_node("node_a", 8).await;
    let root = h.create().await;
    let a = h.manager.fork(ORG, &root.id, ForkRequest::default()).await.unwrap();
    let b = h.manager.fork(ORG, &root.id, ForkRequest::default()).await.unwrap();
    let c = h.manager.fork(ORG, &a.id, ForkRequest::default()).await.unwrap();

    let tree = h.manager.fork_tree(ORG, &c.id).await.unwrap();

    assert_eq!(tree.root, root.id);
    assert_eq!(tree.nodes.len(), 4);
    assert_eq!(tree.nodes[0].sandbox.id, root.id);
    assert_eq!(tree.nodes[3].sandbox.id, c.id);
    let root_children: HashSet<&str> =
        tree.nodes[0].children.iter().map(String::as_str).collect();
    assert_eq!(root_children, HashSet::from([a.id.as_str(), b.id.as_str()]));
    for node in &tree.nodes {
        if let Some(parent_id) = &node.sandbox.forked_from {
            let parent = tree
                .nodes
                .iter()
                .find(|n| &n.sandbox.id == parent_id)
                .unwrap();
            assert_eq!(node.sandbox.fork_depth, parent.sandbox.fork_depth + 1);
        }
    }
}

#[tokio::test]
async fn fork_tree_drops_foreign_tenant_descendants() {
    let h = harness().await;
    h.add_node("node_a", 4).await;
    let root = h.create().await;
    let mine = h.manager.fork(ORG, &root.id, ForkRequest::default()).await.unwrap();

    let mut foreign = Sandbox::forked_from(&root, "sb_foreign".to_string(), h.clock.now());
    foreign.org_id = "org_other".to_string();
    h.repo.create_sandbox(&foreign).await.unwrap();

    let tree = h.manager.fork_tree(ORG, &root.id).await.unwrap();
    let ids: Vec<&str> = tree.nodes.iter().map(|n| n.sandbox.id.as_str()).collect();
    assert_eq!(ids, vec![root.id.as_str(), mine.id.as_str()]);
    assert_eq!(tree.nodes[0].children, vec![mine.id.clone()]);
}

#[tokio::test]
async fn fork_tree_stops_at_foreign_tenant_ancestor() {
    let h = harness().await;
    h.add_node("node_a", 4).await;
    let origin = h.create().await;

    let mut foreign_parent =
        Sandbox::forked_from(&origin, "sb_foreign_parent".to_string(), h.clock.now());
    foreign_parent.org_id = "org_other".to_string();
    h.repo.create_sandbox(&foreign_parent).await.unwrap();

    let mut child = Sandbox::forked_from(&foreign_parent, "sb_child".to_string(), h.clock.now());
    child.org_id = ORG.to_string();
    h.repo.create_sandbox(&child).await.unwrap();
    let grandchild = Sandbox::forked_from(&child, "sb_grandchild".to_string(), h.clock.now());
    h.repo.create_sandbox(&grandchild).await.unwrap();

    let tree = h.manager.fork_tree(ORG, &child.id).await.unwrap();

    assert_eq!(tree.root, child.id);
    let ids: Vec<&str> = tree.nodes.iter().map(|n| n.sandbox.id.as_str()).collect();
    assert_eq!(ids, vec!["sb_child", "sb_grandchild"]);
    assert_eq!(tree.nodes[0].children, vec![grandchild.id.clone()]);
}

#[tokio::test]
async fn stop_collects_flushes_and_releases() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;

    let stopped = h.manager.stop(ORG, &sandbox.id).await.unwrap();

    assert_eq!(stopped.status, SandboxStatus::Stopped);
    assert!(stopped.ended_at.is_some());
    assert_eq!(stopped.failure_reason, None);
    assert_eq!(h.manager.leases().holder("node_a", 0).await.unwrap(), None);
    assert!(!h.nodes.has_vm(&sandbox.id));

    let types = h.event_types(&sandbox.id).await;
    assert_eq!(types.first().map(String::as_str), Some("sandbox.created"));
    assert_eq!(types.last().map(String::as_str), Some("sandbox.stopped"));
    assert!(types.contains(&"sandbox.stopping".to_string()));

    let key = format!("{}/{}/events.jsonl", ORG, sandbox.id);
    let durable = h.objects.keys().await;
    assert!(durable.contains(&key));
}

#[tokio::test]
async fn stop_is_a_no_op_unless_running() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;

    let first = h.manager.stop(ORG, &sandbox.id).await.unwrap();
    let second = h.manager.stop(ORG, &sandbox.id).await.unwrap();
    assert_eq!(second.status, SandboxStatus::Stopped);
    assert_eq!(second.ended_at, first.ended_at);

    let queued = {
        let h = harness().await;
        let queued = h.create().await;
        h.manager.stop(ORG, &queued.id).await.unwrap()
    };
    assert_eq!(queued.status, SandboxStatus::Queued);
}

#[tokio::test]
async fn delete_sets_reason_once_and_is_idempotent() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;

    let deleted = h.manager.delete(ORG, &sandbox.id).await.unwrap();
    assert_eq!(deleted.status, SandboxStatus::Deleted);
    assert_eq!(deleted.failure_reason.as_deref(), Some("sandbox_deleted"));
    assert!(!h.nodes.has_vm(&sandbox.id));
    assert_eq!(h.manager.leases().holder("node_a", 0).await.unwrap(), None);

    let again = h.manager.delete(ORG, &sandbox.id).await.unwrap();
    assert_eq!(again.status, SandboxStatus::Deleted);
    assert_eq!(again.ended_at, deleted.ended_at);
}

#[tokio::test]
async fn delete_leaves_terminal_sandboxes_alone() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;
    h.manager.stop(ORG, &sandbox.id).await.unwrap();

    let after = h.manager.delete(ORG, &sandbox.id).await.unwrap();
    assert_eq!(after.status, SandboxStatus::Stopped);
    assert_eq!(after.failure_reason, None);
}

#[tokio::test]
async fn delete_of_queued_sandbox_skips_the_node() {
    let h = harness().await;
    let sandbox = h.create().await;

    let deleted = h.manager.delete(ORG, &sandbox.id).await.unwrap();
    assert_eq!(deleted.status, SandboxStatus::Deleted);
    assert!(h.nodes.calls().is_empty());
}

#[tokio::test]
async fn artifact_registration_dedups_by_path() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;

    let first = h
        .manager
        .register_artifacts(ORG, &sandbox.id, cmd(&["/output/a.txt"]), None)
        .await
        .unwrap();
    let second = h
        .manager
        .register_artifacts(ORG, &sandbox.id, cmd(&["/output/a.txt", "/output/new.txt"]), None)
        .await
        .unwrap();

    assert_eq!(first, (1, 1));
    assert_eq!(second, (1, 2));
}

#[tokio::test]
async fn artifact_paths_are_validated_and_capped() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;

    let err = h
        .manager
        .register_artifacts(ORG, &sandbox.id, cmd(&["relative.txt"]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Validation(_)));

    let many: Vec<String> = (0..101).map(|i| format!("/output/{}.txt", i)).collect();
    let err = h
        .manager
        .register_artifacts(ORG, &sandbox.id, many, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Validation(_)));
}

#[tokio::test]
async fn stop_collects_registered_artifacts() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;
    h.manager
        .register_artifacts(ORG, &sandbox.id, cmd(&["/output/a.txt", "/output/missing.txt"]), None)
        .await
        .unwrap();
    h.nodes.seed_file(&sandbox.id, "/output/a.txt", b"hello");

    h.manager.stop(ORG, &sandbox.id).await.unwrap();

    let views = h.manager.list_artifacts(ORG, &sandbox.id).await.unwrap();
    let collected = views
        .iter()
        .find(|v| v.artifact.path == "/output/a.txt")
        .unwrap();
    assert_eq!(collected.artifact.bytes, Some(5));
    assert_eq!(
        collected.artifact.sha256.as_deref(),
        Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
    );
    assert!(collected.download_url.is_some());

    let missing = views
        .iter()
        .find(|v| v.artifact.path == "/output/missing.txt")
        .unwrap();
    assert_eq!(missing.download_url, None);
}

#[tokio::test]
async fn exec_wait_returns_output_and_sequences_per_sandbox() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;

    let first = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecRequest {
                cmd: cmd(&["echo", "hi"]),
                wait: true,
                ..ExecRequest::default()
            },
        )
        .await
        .unwrap();
    let second = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecRequest {
                cmd: cmd(&["true"]),
                wait: true,
                ..ExecRequest::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(first.exec.status, ExecStatus::Done);
    assert_eq!(first.exec.exit_code, Some(0));
    assert_eq!(first.stdout, "echo hi\n");
    assert_eq!(first.exec.seq, 1);
    assert_eq!(second.exec.seq, 2);

    let types = h.event_types(&sandbox.id).await;
    let exec_types: Vec<&str> = types
        .iter()
        .map(String::as_str)
        .filter(|t| t.starts_with("exec."))
        .take(3)
        .collect();
    assert_eq!(exec_types, vec!["exec.started", "exec.output", "exec.completed"]);
}

#[tokio::test]
async fn non_zero_exit_is_still_done() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;
    h.nodes.script_exec(ScriptedExec {
        exit_code: 3,
        stderr: vec!["boom\n".to_string()],
        ..ScriptedExec::default()
    });

    let outcome = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecRequest {
                cmd: cmd(&["false"]),
                wait: true,
                ..ExecRequest::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.exec.status, ExecStatus::Done);
    assert_eq!(outcome.exec.exit_code, Some(3));
    assert_eq!(outcome.stderr, "boom\n");
}

#[tokio::test]
async fn exec_past_deadline_times_out() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;
    h.nodes.script_exec(ScriptedExec {
        delay: Duration::from_secs(3),
        ..ScriptedExec::default()
    });

    let outcome = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecRequest {
                cmd: cmd(&["sleep", "10"]),
                timeout_secs: Some(1),
                wait: true,
                ..ExecRequest::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.exec.status, ExecStatus::TimedOut);
    assert_eq!(outcome.exec.exit_code, None);
}

#[tokio::test]
async fn node_error_fails_the_exec() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;
    h.nodes.set_unreachable(true);

    let outcome = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecRequest {
                cmd: cmd(&["ls"]),
                wait: true,
                ..ExecRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.exec.status, ExecStatus::Failed);
}

#[tokio::test]
async fn async_exec_returns_queued_then_finishes() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;

    let outcome = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecRequest {
                cmd: cmd(&["ls"]),
                wait: false,
                ..ExecRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.exec.status, ExecStatus::Queued);

    let mut status = outcome.exec.status;
    for _ in 0..200 {
        status = h
            .manager
            .get_exec(ORG, &sandbox.id, &outcome.exec.id)
            .await
            .unwrap()
            .status;
        if status.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, ExecStatus::Done);
}

#[tokio::test]
async fn exec_requires_running_sandbox() {
    let h = harness().await;
    let queued = h.create().await;

    let err = h
        .manager
        .exec(
            ORG,
            &queued.id,
            ExecRequest {
                cmd: cmd(&["ls"]),
                wait: true,
                ..ExecRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::SandboxNotRunning(_)));
}

#[tokio::test]
async fn session_lifecycle() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;

    let session = h
        .manager
        .create_session(ORG, &sandbox.id, None, env(&[]))
        .await
        .unwrap();
    assert_eq!(session.shell, "/bin/bash");

    let outcome = h
        .manager
        .session_exec(ORG, &sandbox.id, &session.id, "pwd", None)
        .await
        .unwrap();
    assert_eq!(outcome.exec.status, ExecStatus::Done);
    assert_eq!(outcome.exec.session_id.as_deref(), Some(session.id.as_str()));
    assert_eq!(outcome.stdout, "pwd\n");

    h.manager
        .session_input(ORG, &sandbox.id, &session.id, "ls\n")
        .await
        .unwrap();

    let destroyed = h
        .manager
        .destroy_session(ORG, &sandbox.id, &session.id)
        .await
        .unwrap();
    let again = h
        .manager
        .destroy_session(ORG, &sandbox.id, &session.id)
        .await
        .unwrap();
    assert_eq!(again.destroyed_at, destroyed.destroyed_at);

    let err = h
        .manager
        .session_exec(ORG, &sandbox.id, &session.id, "pwd", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Conflict(_)));

    let types = h.event_types(&sandbox.id).await;
    for expected in ["session.created", "session.exec", "session.destroyed"] {
        assert!(types.contains(&expected.to_string()), "missing {}", expected);
    }
}

#[tokio::test]
async fn files_round_trip_and_bump_activity() {
    let h = harness().await;
    h.add_node("node_a", 1).await;
    let sandbox = h.create().await;
    h.clock.advance_secs(10);

    h.manager
        .put_file(ORG, &sandbox.id, "/work/notes.txt", b"hi".to_vec())
        .await
        .unwrap();
    assert_eq!(
        h.manager
            .get_file(ORG, &sandbox.id, "/work/notes.txt")
            .await
            .unwrap(),
        b"hi".to_vec()
    );
    let listing = h.manager.list_files(ORG, &sandbox.id, "/work").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "notes.txt");

    h.manager
        .delete_file(ORG, &sandbox.id, "/work/notes.txt")
        .await
        .unwrap();
    assert!(h
        .manager
        .get_file(ORG, &sandbox.id, "/work/notes.txt")
        .await
        .is_err());

    let refreshed = h.manager.get(ORG, &sandbox.id).await.unwrap();
    assert!(refreshed.last_activity_at > sandbox.last_activity_at);

    let err = h
        .manager
        .put_file(ORG, &sandbox.id, "notes.txt", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Validation(_)));
}

#[tokio::test]
async fn public_replay_requires_opt_in() {
    let h = harness().await;
    let sandbox = h.create().await;
    h.notifier.sync().await;

    assert!(matches!(
        h.manager.public_replay(&sandbox.id, 0).await.unwrap_err(),
        ManagerError::NotFound(_)
    ));

    let updated = h
        .manager
        .set_replay_public(ORG, &sandbox.id, true)
        .await
        .unwrap();
    assert!(updated.replay_public);

    let (_, events) = h.manager.public_replay(&sandbox.id, 0).await.unwrap();
    assert_eq!(events[0].kind, "sandbox.created");
}
