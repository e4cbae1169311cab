// ABOUTME: Sandbox lifecycle, fork management, replay recording and background reapers
// ABOUTME: Ties the repository, coordination store, object store and node agents into one control plane

pub mod manager;
pub mod node;
pub mod reaper;
pub mod replay;
pub mod scheduler;

pub use manager::{
    ArtifactView, CreateSandboxRequest, ExecOutcome, ExecRequest, ForkRequest, ForkTree,
    ForkTreeNode, ManagerConfig, ManagerDeps, ManagerError, NodeHeartbeat, Result, SandboxManager,
};
pub use node::{
    CollectedFile, ExecCompletion, ExecSpec, FileEntry, HttpNodeClient, NodeClient, NodeDirectory,
    NodeError, OutputChunk, OutputStream, ProvisionSpec, RepositoryDirectory, SessionExecOutput,
    StaticDirectory,
};
pub use reaper::{Reaper, ReaperConfig, SweepReport, DUTIES};
pub use replay::{redact_env, ReplayError, ReplayEvent, ReplayNotifier, ReplayRecorder, ReplayTarget};
pub use scheduler::{Placement, Scheduler};

#[cfg(any(test, feature = "test-utils"))]
pub use node::fake::{FakeNodeClient, ScriptedExec};
