use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use async_trait::async_trait;

use super::capture::CapturedStream;
use super::workspace::Workspace;
use super::ResourceLimits;
use crate::error::SandboxError;

/// Strategy for starting the interpreter on a prepared workspace
///
/// Implementations decide how isolation and resource ceilings are applied;
/// the enforcer and collector only ever see the returned handle.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    /// Short strategy name used in logs
    fn name(&self) -> &'static str;

    /// Starts one run
    ///
    /// Fails with [`SandboxError::Spawn`] when the interpreter or container
    /// engine cannot be started at all.
    async fn launch(
        &self,
        workspace: &Workspace,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError>;
}

/// A running interpreter: can be waited on and forcibly terminated
#[async_trait]
pub trait SandboxHandle: Send {
    /// Identifier of the run, used in logs
    fn id(&self) -> &str;

    /// Waits for the run to exit; returns the cached state on later calls
    async fn wait(&mut self) -> std::io::Result<ExitState>;

    /// Forcibly stops the run and everything it spawned
    ///
    /// Must succeed when called repeatedly or after a natural exit.
    async fn terminate(&mut self) -> std::io::Result<()>;

    /// Drains captured output and final statistics, then releases any engine
    /// side resources held for the run. Called once, after the run ended.
    async fn finish(&mut self) -> SandboxReport;
}

/// How a sandboxed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Code(i32),
    Signal(i32),
}

impl ExitState {
    pub fn success(&self) -> bool {
        matches!(self, ExitState::Code(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitState::Code(code) => Some(*code),
            ExitState::Signal(_) => None,
        }
    }
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitState::Code(code),
            (None, Some(signal)) => ExitState::Signal(signal),
            (None, None) => ExitState::Code(-1),
        }
    }
}

/// Everything a handle knows once its run is over
#[derive(Debug, Default)]
pub struct SandboxReport {
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    /// Peak resident memory of this run only
    pub peak_memory_kb: u64,
    /// The run was killed or failed for exceeding its memory ceiling
    pub memory_exceeded: bool,
    /// The engine itself failed before the interpreter ran
    pub spawn_failure: Option<String>,
}
