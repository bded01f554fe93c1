mod capture;
mod collector;
mod container_runner;
mod direct_runner;
mod enforcer;
mod orchestrator;
mod runner;
mod validator;
mod workspace;

// Re-export the traits and common types
pub use capture::{CapturedStream, MemoryUsage};
pub use collector::{classify, collect};
pub use container_runner::ContainerLauncher;
pub use direct_runner::DirectLauncher;
pub use enforcer::{RunOutcome, supervise};
pub use orchestrator::{ExecutionStats, Orchestrator, Stage, StatsSnapshot};
pub use runner::{ExitState, SandboxHandle, SandboxLauncher, SandboxReport};
pub use validator::validate;
pub use workspace::Workspace;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{LaunchStrategy, SandboxConfig};

/// Lowest memory ceiling a run may be given, in megabytes
pub const MIN_MEMORY_MB: u64 = 16;

/// Ceilings applied to a single run
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub cpu_share: f64,
}

impl ResourceLimits {
    /// Resolves caller-requested limits against the service policy
    ///
    /// Missing or non-positive values fall back to `defaults`, and every value
    /// is clamped to `max`.
    pub fn resolve(
        requested: Option<&RequestedLimits>,
        defaults: &ResourceLimits,
        max: &ResourceLimits,
    ) -> ResourceLimits {
        let timeout_ms = requested
            .and_then(|r| r.timeout_ms)
            .filter(|ms| *ms > 0)
            .unwrap_or(defaults.timeout_ms)
            .min(max.timeout_ms);
        let memory_mb = requested
            .and_then(|r| r.memory_mb)
            .filter(|mb| *mb > 0)
            .unwrap_or(defaults.memory_mb)
            .max(MIN_MEMORY_MB)
            .min(max.memory_mb);
        let cpu_share = requested
            .and_then(|r| r.cpu_share)
            .filter(|share| share.is_finite() && *share > 0.0)
            .unwrap_or(defaults.cpu_share)
            .min(max.cpu_share);

        ResourceLimits {
            timeout_ms,
            memory_mb,
            cpu_share,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }

    pub fn memory_kb(&self) -> u64 {
        self.memory_mb * 1024
    }
}

/// Limits as sent by a caller, any of which may be left to the service policy
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestedLimits {
    pub timeout_ms: Option<u64>,
    pub memory_mb: Option<u64>,
    pub cpu_share: Option<f64>,
}

/// One program submitted for execution
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub source: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub limits: Option<RequestedLimits>,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            input: None,
            limits: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_limits(mut self, limits: RequestedLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// Closed set of ways an execution can end
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    RuntimeError,
    TimedOut,
    ResourceExceeded,
    SpawnError,
    ValidationError,
}

impl Outcome {
    pub const ALL: [Outcome; 6] = [
        Outcome::Success,
        Outcome::RuntimeError,
        Outcome::TimedOut,
        Outcome::ResourceExceeded,
        Outcome::SpawnError,
        Outcome::ValidationError,
    ];
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Success => "Success",
            Outcome::RuntimeError => "RuntimeError",
            Outcome::TimedOut => "TimedOut",
            Outcome::ResourceExceeded => "ResourceExceeded",
            Outcome::SpawnError => "SpawnError",
            Outcome::ValidationError => "ValidationError",
        };
        f.write_str(s)
    }
}

/// Structured result of one execution
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
    pub peak_memory_mb: u64,
    /// Whether stdout or stderr was cut at the output cap
    pub truncated: bool,
}

impl ExecutionResult {
    /// A result for a request that never produced a running sandbox
    pub fn rejected(outcome: Outcome, reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            outcome,
            stdout: String::new(),
            stderr: reason.into(),
            exit_code: None,
            elapsed_ms: elapsed.as_millis() as u64,
            peak_memory_mb: 0,
            truncated: false,
        }
    }
}

/// Creates the launcher selected by the deployment configuration
///
/// The container strategy is the default posture for untrusted code. The
/// direct strategy inherits host isolation only and is meant for trusted or
/// development setups.
pub fn create_launcher(config: &SandboxConfig) -> Arc<dyn SandboxLauncher> {
    match &config.strategy {
        LaunchStrategy::Direct { command } => {
            log::info!("Creating DirectLauncher for `{}`", command.join(" "));
            log::warn!(
                "DirectLauncher provides NO network or filesystem isolation - use only with trusted code"
            );
            Arc::new(DirectLauncher::new(
                command.clone(),
                config.max_output_bytes,
                config.memory_poll(),
            ))
        }
        LaunchStrategy::Container {
            engine,
            image,
            command,
            pids_limit,
        } => {
            let engine_found = std::process::Command::new("which")
                .arg(engine)
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false);
            if !engine_found {
                log::warn!("Container engine `{engine}` not found, executions will fail to spawn");
            }

            log::info!("Creating ContainerLauncher with {engine} image {image}");
            Arc::new(ContainerLauncher::new(
                engine.clone(),
                image.clone(),
                command.clone(),
                *pids_limit,
                config.max_output_bytes,
                config.memory_poll(),
            ))
        }
    }
}

/// Substitutes `%SOURCE%` and `%INPUT%` in an interpreter command template
pub(crate) fn expand_command(template: &[String], source: &str, input: Option<&str>) -> Vec<String> {
    template
        .iter()
        .filter(|arg| input.is_some() || arg.as_str() != "%INPUT%")
        .map(|arg| {
            let arg = arg.replace("%SOURCE%", source);
            arg.replace("%INPUT%", input.unwrap_or(""))
        })
        .collect()
}
