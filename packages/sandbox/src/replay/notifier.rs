// ABOUTME: Post-commit replay notifications that never block or fail the caller
// ABOUTME: One background worker applies record and flush commands in submission order

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ReplayRecorder, ReplayTarget};
use crate::node::OutputStream;

enum Command {
    Record {
        target: ReplayTarget,
        kind: String,
        data: Value,
    },
    ExecOutput {
        target: ReplayTarget,
        exec_id: String,
        stream: OutputStream,
        data: String,
    },
    Flush {
        sandbox_id: String,
        release: bool,
        done: Option<oneshot::Sender<()>>,
    },
    Barrier(oneshot::Sender<()>),
}

/// Handle for queueing replay side effects after a state change commits.
///
/// Submission is a non-blocking channel send. Failures surface as `warn`
/// logs tagged `replay_record_failed` instead of reaching the caller.
#[derive(Clone)]
pub struct ReplayNotifier {
    tx: mpsc::UnboundedSender<Command>,
}

impl ReplayNotifier {
    /// Start the worker. It exits once every handle has been dropped.
    pub fn spawn(recorder: Arc<ReplayRecorder>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                apply(&recorder, command).await;
            }
            debug!("Replay notifier stopped");
        });
        (Self { tx }, handle)
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!(replay_record_failed = true, "Replay notifier is not running");
        }
    }

    pub fn record(&self, target: &ReplayTarget, kind: &str, data: Value) {
        self.send(Command::Record {
            target: target.clone(),
            kind: kind.to_string(),
            data,
        });
    }

    pub fn exec_output(&self, target: &ReplayTarget, exec_id: &str, stream: OutputStream, data: String) {
        self.send(Command::ExecOutput {
            target: target.clone(),
            exec_id: exec_id.to_string(),
            stream,
            data,
        });
    }

    /// Queue a durable flush; `release` also drops the sandbox's buffer.
    pub fn flush(&self, sandbox_id: &str, release: bool) {
        self.send(Command::Flush {
            sandbox_id: sandbox_id.to_string(),
            release,
            done: None,
        });
    }

    /// Flush after every earlier command for this instance has been applied.
    pub async fn flush_and_wait(&self, sandbox_id: &str, release: bool) {
        let (done, wait) = oneshot::channel();
        self.send(Command::Flush {
            sandbox_id: sandbox_id.to_string(),
            release,
            done: Some(done),
        });
        let _ = wait.await;
    }

    /// Resolve once every command submitted so far has been applied.
    pub async fn sync(&self) {
        let (done, wait) = oneshot::channel();
        self.send(Command::Barrier(done));
        let _ = wait.await;
    }
}

async fn apply(recorder: &ReplayRecorder, command: Command) {
    match command {
        Command::Record { target, kind, data } => {
            if let Err(e) = recorder.record(&target, &kind, data).await {
                warn!(
                    sandbox_id = %target.sandbox_id,
                    event_type = %kind,
                    error = %e,
                    replay_record_failed = true,
                    "Replay event dropped"
                );
            }
        }
        Command::ExecOutput {
            target,
            exec_id,
            stream,
            data,
        } => {
            if let Err(e) = recorder
                .record_exec_output(&target, &exec_id, stream, &data)
                .await
            {
                warn!(
                    sandbox_id = %target.sandbox_id,
                    exec_id = %exec_id,
                    error = %e,
                    replay_record_failed = true,
                    "Exec output event dropped"
                );
            }
        }
        Command::Flush {
            sandbox_id,
            release,
            done,
        } => {
            let result = if release {
                recorder.release(&sandbox_id).await
            } else {
                recorder.flush(&sandbox_id).await.map(|_| ())
            };
            if let Err(e) = result {
                warn!(sandbox_id = %sandbox_id, error = %e, replay_record_failed = true, "Replay flush failed");
            }
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
        Command::Barrier(done) => {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandchest_coordination::MemoryCoordinationStore;
    use sandchest_core::ManualClock;
    use sandchest_storage::{MemoryObjectStore, ObjectStore};
    use serde_json::json;

    fn target() -> ReplayTarget {
        ReplayTarget {
            sandbox_id: "sb_1".to_string(),
            org_id: "org_1".to_string(),
            live_ttl_secs: 600,
        }
    }

    #[tokio::test]
    async fn commands_apply_in_submission_order() {
        let clock = Arc::new(ManualClock::new(0));
        let objects = Arc::new(MemoryObjectStore::new());
        let recorder = Arc::new(ReplayRecorder::new(
            Arc::new(MemoryCoordinationStore::new(clock.clone())),
            objects.clone(),
            clock,
        ));
        let (notifier, _worker) = ReplayNotifier::spawn(recorder.clone());

        notifier.record(&target(), "sandbox.created", json!({}));
        notifier.exec_output(&target(), "ex_1", OutputStream::Stdout, "hi\n".to_string());
        notifier.record(&target(), "sandbox.stopped", json!({}));
        notifier.flush_and_wait("sb_1", true).await;

        let events = recorder.get_events("org_1", "sb_1", 0).await.unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["sandbox.created", "exec.output", "sandbox.stopped"]);
        assert!(objects.get_object("org_1/sb_1/events.jsonl").await.unwrap().is_some());
        assert_eq!(recorder.buffered_sandboxes(), 0);
    }

    #[tokio::test]
    async fn recording_failures_do_not_reach_the_caller() {
        let clock = Arc::new(ManualClock::new(0));
        let objects = Arc::new(MemoryObjectStore::new());
        let recorder = Arc::new(ReplayRecorder::new(
            Arc::new(MemoryCoordinationStore::new(clock.clone())),
            objects.clone(),
            clock,
        ));
        let (notifier, _worker) = ReplayNotifier::spawn(recorder);

        objects.set_fail_writes(true);
        notifier.record(&target(), "sandbox.created", json!({}));
        notifier.flush_and_wait("sb_1", false).await;
        notifier.sync().await;
    }
}
