use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::runner::SandboxLauncher;
use super::workspace::Workspace;
use super::{
    ExecutionRequest, ExecutionResult, Outcome, ResourceLimits, collector, create_launcher,
    enforcer, validator,
};
use crate::config::{Markers, SandboxConfig};

/// Stages one execution moves through
///
/// Any stage may jump straight to `Cleaned` on failure. `Cleaned` is
/// terminal and is entered exactly once per execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    WorkspaceReady,
    Running,
    Collecting,
    Cleaned,
}

/// Runs single requests end to end: validate, prepare, launch, supervise,
/// collect, clean up
///
/// Each call to [`Orchestrator::execute`] owns its own workspace and sandbox
/// handle; concurrent calls share nothing but the counters.
pub struct Orchestrator {
    launcher: Arc<dyn SandboxLauncher>,
    workspace_root: PathBuf,
    default_limits: ResourceLimits,
    max_limits: ResourceLimits,
    max_source_bytes: usize,
    max_output_bytes: usize,
    kill_grace: Duration,
    markers: Markers,
    stats: ExecutionStats,
}

impl Orchestrator {
    /// Builds an orchestrator with the launch strategy named in `config`
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::with_launcher(config, create_launcher(config))
    }

    /// Builds an orchestrator around an explicit launcher
    pub fn with_launcher(config: &SandboxConfig, launcher: Arc<dyn SandboxLauncher>) -> Self {
        Self {
            launcher,
            workspace_root: config.workspace_root(),
            default_limits: config.default_limits,
            max_limits: config.max_limits,
            max_source_bytes: config.max_source_bytes,
            max_output_bytes: config.max_output_bytes,
            kill_grace: config.kill_grace(),
            markers: config.markers.clone(),
            stats: ExecutionStats::default(),
        }
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Number of sandboxes started so far
    pub fn launch_count(&self) -> u64 {
        self.stats.launches.load(Ordering::Relaxed)
    }

    /// Executes one request; every failure is reported through the result
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let result = self.execute_inner(request, started).await;

        self.stats.record(result.outcome);
        log::info!(
            "Execution finished: {} in {} ms ({} MB peak)",
            result.outcome,
            result.elapsed_ms,
            result.peak_memory_mb
        );
        result
    }

    async fn execute_inner(&self, request: &ExecutionRequest, started: Instant) -> ExecutionResult {
        log::debug!("Execution stage {:?}", Stage::Validating);
        if let Err(e) = validator::validate(&request.source, self.max_source_bytes, &self.markers) {
            log::debug!("Rejected submission: {e}");
            log::debug!("Execution stage {:?}", Stage::Cleaned);
            return ExecutionResult::rejected(Outcome::ValidationError, e.to_string(), started.elapsed());
        }

        let limits = ResourceLimits::resolve(
            request.limits.as_ref(),
            &self.default_limits,
            &self.max_limits,
        );

        let mut workspace = match Workspace::acquire(
            &self.workspace_root,
            &request.source,
            request.input.as_deref(),
        ) {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Failed to prepare workspace: {e}");
                log::debug!("Execution stage {:?}", Stage::Cleaned);
                return ExecutionResult::rejected(Outcome::SpawnError, e.to_string(), started.elapsed());
            }
        };
        log::debug!("Workspace {} stage {:?}", workspace.id(), Stage::WorkspaceReady);

        let result = self.run(&workspace, &limits, started).await;

        if !workspace.release() {
            log::error!("Cleanup of workspace {} was incomplete", workspace.id());
        }
        log::debug!("Workspace {} stage {:?}", workspace.id(), Stage::Cleaned);

        result
    }

    async fn run(&self, workspace: &Workspace, limits: &ResourceLimits, started: Instant) -> ExecutionResult {
        self.stats.launches.fetch_add(1, Ordering::Relaxed);
        let mut handle = match self.launcher.launch(workspace, limits).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!(
                    "{} launcher failed for workspace {}: {e}",
                    self.launcher.name(),
                    workspace.id()
                );
                return ExecutionResult::rejected(Outcome::SpawnError, e.to_string(), started.elapsed());
            }
        };
        log::debug!("Workspace {} stage {:?} as {}", workspace.id(), Stage::Running, handle.id());

        let run = enforcer::supervise(handle.as_mut(), limits, self.kill_grace).await;

        log::debug!("Workspace {} stage {:?}", workspace.id(), Stage::Collecting);
        let result = collector::collect(handle.as_mut(), run, workspace, self.max_output_bytes).await;
        if result.outcome == Outcome::SpawnError {
            log::error!(
                "Sandbox {} failed to start: {}",
                handle.id(),
                result.stderr
            );
        }
        result
    }
}

/// Counters over every execution an orchestrator handled
#[derive(Default)]
pub struct ExecutionStats {
    launches: AtomicU64,
    outcomes: [AtomicU64; 6],
}

impl ExecutionStats {
    fn record(&self, outcome: Outcome) {
        self.outcomes[Self::slot(outcome)].fetch_add(1, Ordering::Relaxed);
    }

    fn slot(outcome: Outcome) -> usize {
        Outcome::ALL
            .iter()
            .position(|o| *o == outcome)
            .unwrap_or_default()
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.outcomes[Self::slot(outcome)].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            launches: self.launches.load(Ordering::Relaxed),
            success: self.count(Outcome::Success),
            runtime_error: self.count(Outcome::RuntimeError),
            timed_out: self.count(Outcome::TimedOut),
            resource_exceeded: self.count(Outcome::ResourceExceeded),
            spawn_error: self.count(Outcome::SpawnError),
            validation_error: self.count(Outcome::ValidationError),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub launches: u64,
    pub success: u64,
    pub runtime_error: u64,
    pub timed_out: u64,
    pub resource_exceeded: u64,
    pub spawn_error: u64,
    pub validation_error: u64,
}
