// ABOUTME: In-process stand-in for a node agent
// ABOUTME: Keeps per-VM files and sessions in memory and lets tests script failures and exec results

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    CollectedFile, ExecCompletion, ExecSpec, FileEntry, NodeClient, NodeError, NodeResult,
    OutputChunk, OutputSink, OutputStream, ProvisionSpec, SessionExecOutput,
};

#[derive(Debug, Default, Clone)]
struct FakeVm {
    node_id: String,
    files: BTreeMap<String, Vec<u8>>,
    sessions: HashSet<String>,
}

/// Scripted outcome for the next commands.
#[derive(Debug, Clone)]
pub struct ScriptedExec {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub delay: Duration,
}

impl Default for ScriptedExec {
    fn default() -> Self {
        Self {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
pub struct FakeNodeClient {
    vms: Mutex<HashMap<String, FakeVm>>,
    calls: Mutex<Vec<String>>,
    script: Mutex<Option<ScriptedExec>>,
    fail_create: AtomicBool,
    fail_fork: AtomicBool,
    unreachable: AtomicBool,
}

impl FakeNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_fork(&self, fail: bool) {
        self.fail_fork.store(fail, Ordering::SeqCst);
    }

    /// Every call fails as if the node were offline.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Replace the default echo behaviour of `exec` and `session_exec`.
    pub fn script_exec(&self, script: ScriptedExec) {
        *self.script.lock().unwrap_or_else(|e| e.into_inner()) = Some(script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn has_vm(&self, sandbox_id: &str) -> bool {
        self.vms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(sandbox_id)
    }

    /// Place a file directly into a VM.
    pub fn seed_file(&self, sandbox_id: &str, path: &str, content: &[u8]) {
        let mut vms = self.vms.lock().unwrap_or_else(|e| e.into_inner());
        vms.entry(sandbox_id.to_string())
            .or_default()
            .files
            .insert(path.to_string(), content.to_vec());
    }

    fn record(&self, call: String) -> NodeResult<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(NodeError::Unreachable("fake node offline".to_string()));
        }
        Ok(())
    }

    fn with_vm<T>(
        &self,
        sandbox_id: &str,
        f: impl FnOnce(&mut FakeVm) -> NodeResult<T>,
    ) -> NodeResult<T> {
        let mut vms = self.vms.lock().unwrap_or_else(|e| e.into_inner());
        let vm = vms
            .get_mut(sandbox_id)
            .ok_or_else(|| NodeError::NotFound(format!("sandbox {}", sandbox_id)))?;
        f(vm)
    }

    fn scripted(&self, cmd: &str) -> ScriptedExec {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| ScriptedExec {
                stdout: vec![format!("{}\n", cmd)],
                ..ScriptedExec::default()
            })
    }
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[async_trait]
impl NodeClient for FakeNodeClient {
    async fn create_sandbox(&self, node_id: &str, spec: &ProvisionSpec) -> NodeResult<()> {
        self.record(format!("create_sandbox {} {}", node_id, spec.sandbox_id))?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(NodeError::Rejected {
                status: 500,
                message: "boot failed".to_string(),
            });
        }
        let mut vms = self.vms.lock().unwrap_or_else(|e| e.into_inner());
        let vm = vms.entry(spec.sandbox_id.clone()).or_default();
        vm.node_id = node_id.to_string();
        Ok(())
    }

    async fn destroy_sandbox(&self, node_id: &str, sandbox_id: &str) -> NodeResult<()> {
        self.record(format!("destroy_sandbox {} {}", node_id, sandbox_id))?;
        self.vms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sandbox_id);
        Ok(())
    }

    async fn fork_sandbox(
        &self,
        node_id: &str,
        source_id: &str,
        dest_id: &str,
        _env: &HashMap<String, String>,
    ) -> NodeResult<()> {
        self.record(format!("fork_sandbox {} {} {}", node_id, source_id, dest_id))?;
        if self.fail_fork.load(Ordering::SeqCst) {
            return Err(NodeError::Rejected {
                status: 500,
                message: "snapshot failed".to_string(),
            });
        }
        let clone = self.with_vm(source_id, |vm| {
            Ok(FakeVm {
                sessions: HashSet::new(),
                ..vm.clone()
            })
        })?;
        self.vms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dest_id.to_string(), clone);
        Ok(())
    }

    async fn exec(
        &self,
        node_id: &str,
        sandbox_id: &str,
        spec: &ExecSpec,
        output: OutputSink,
    ) -> NodeResult<ExecCompletion> {
        self.record(format!("exec {} {} {}", node_id, sandbox_id, spec.exec_id))?;
        self.with_vm(sandbox_id, |_| Ok(()))?;

        let script = self.scripted(&spec.cmd.join(" "));
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        for data in &script.stdout {
            let _ = output.send(OutputChunk {
                stream: OutputStream::Stdout,
                data: data.clone(),
            });
        }
        for data in &script.stderr {
            let _ = output.send(OutputChunk {
                stream: OutputStream::Stderr,
                data: data.clone(),
            });
        }

        Ok(ExecCompletion {
            exit_code: script.exit_code,
            duration_ms: script.delay.as_millis() as i64,
            usage: Default::default(),
        })
    }

    async fn create_session(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        _shell: &str,
        _env: &HashMap<String, String>,
    ) -> NodeResult<()> {
        self.record(format!("create_session {} {} {}", node_id, sandbox_id, session_id))?;
        self.with_vm(sandbox_id, |vm| {
            vm.sessions.insert(session_id.to_string());
            Ok(())
        })
    }

    async fn session_exec(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        cmd: &str,
        _timeout_secs: u64,
    ) -> NodeResult<SessionExecOutput> {
        self.record(format!("session_exec {} {} {}", node_id, sandbox_id, session_id))?;
        self.with_vm(sandbox_id, |vm| {
            if vm.sessions.contains(session_id) {
                Ok(())
            } else {
                Err(NodeError::NotFound(format!("session {}", session_id)))
            }
        })?;

        let script = self.scripted(cmd);
        Ok(SessionExecOutput {
            exit_code: script.exit_code,
            stdout: script.stdout.concat(),
            stderr: script.stderr.concat(),
            duration_ms: script.delay.as_millis() as i64,
        })
    }

    async fn session_input(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        _data: &str,
    ) -> NodeResult<()> {
        self.record(format!("session_input {} {} {}", node_id, sandbox_id, session_id))?;
        self.with_vm(sandbox_id, |_| Ok(()))
    }

    async fn destroy_session(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
    ) -> NodeResult<()> {
        self.record(format!("destroy_session {} {} {}", node_id, sandbox_id, session_id))?;
        self.with_vm(sandbox_id, |vm| {
            vm.sessions.remove(session_id);
            Ok(())
        })
    }

    async fn put_file(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
        content: Vec<u8>,
    ) -> NodeResult<()> {
        self.record(format!("put_file {} {} {}", node_id, sandbox_id, path))?;
        self.with_vm(sandbox_id, |vm| {
            vm.files.insert(path.to_string(), content);
            Ok(())
        })
    }

    async fn get_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<Vec<u8>> {
        self.record(format!("get_file {} {} {}", node_id, sandbox_id, path))?;
        self.with_vm(sandbox_id, |vm| {
            vm.files
                .get(path)
                .cloned()
                .ok_or_else(|| NodeError::NotFound(path.to_string()))
        })
    }

    async fn list_files(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
    ) -> NodeResult<Vec<FileEntry>> {
        self.record(format!("list_files {} {} {}", node_id, sandbox_id, path))?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.with_vm(sandbox_id, |vm| {
            Ok(vm
                .files
                .iter()
                .filter(|(file, _)| file.starts_with(&prefix))
                .map(|(file, content)| FileEntry {
                    name: base_name(file),
                    path: file.clone(),
                    kind: "file".to_string(),
                    size_bytes: Some(content.len() as u64),
                })
                .collect())
        })
    }

    async fn delete_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<()> {
        self.record(format!("delete_file {} {} {}", node_id, sandbox_id, path))?;
        self.with_vm(sandbox_id, |vm| {
            vm.files
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| NodeError::NotFound(path.to_string()))
        })
    }

    async fn collect_artifacts(
        &self,
        node_id: &str,
        sandbox_id: &str,
        paths: &[String],
    ) -> NodeResult<Vec<CollectedFile>> {
        self.record(format!("collect_artifacts {} {}", node_id, sandbox_id))?;
        self.with_vm(sandbox_id, |vm| {
            Ok(paths
                .iter()
                .filter_map(|path| {
                    vm.files.get(path).map(|content| CollectedFile {
                        path: path.clone(),
                        name: base_name(path),
                        mime: "application/octet-stream".to_string(),
                        sha256: hex::encode(Sha256::digest(content)),
                        content: content.clone(),
                    })
                })
                .collect())
        })
    }
}
