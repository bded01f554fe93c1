use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Deserialize;

use crate::sandbox::ResourceLimits;

#[derive(Parser)]
#[command(name = "algo-sandbox", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Number of concurrent executions, overrides the configuration file
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<usize>,
}

impl CliArgs {
    /// Load the configuration from the specified file and apply CLI overrides
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let file = std::fs::File::open(&self.config_path)
            .with_context(|| format!("unable to open config file {}", self.config_path))?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)
            .with_context(|| format!("invalid config file {}", self.config_path))?;

        if let Some(workers) = self.workers {
            config.sandbox.workers = workers;
        }
        config.sandbox.check()?;

        Ok(config)
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SandboxConfig {
    pub strategy: LaunchStrategy,
    pub workspace_root: Option<PathBuf>,
    #[serde(default = "default_limits")]
    pub default_limits: ResourceLimits,
    #[serde(default = "max_limits")]
    pub max_limits: ResourceLimits,
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default = "default_memory_poll_ms")]
    pub memory_poll_ms: u64,
    #[serde(default)]
    pub markers: Markers,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// How the interpreter gets started
///
/// Every argument of `command` goes through template substitution:
/// `%SOURCE%` becomes the source file path and `%INPUT%` the input file path.
/// An argument that is exactly `%INPUT%` is dropped when there is no input.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaunchStrategy {
    Direct {
        command: Vec<String>,
    },
    Container {
        #[serde(default = "default_engine")]
        engine: String,
        image: String,
        command: Vec<String>,
        #[serde(default = "default_pids_limit")]
        pids_limit: u32,
    },
}

/// Keywords every program must contain, in this order
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub entry: String,
    pub begin: String,
    pub end: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            entry: "Algorithme".to_string(),
            begin: "Debut".to_string(),
            end: "Fin".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Builds a config with every optional field at its default
    pub fn new(strategy: LaunchStrategy) -> Self {
        Self {
            strategy,
            workspace_root: None,
            default_limits: default_limits(),
            max_limits: max_limits(),
            max_source_bytes: default_max_source_bytes(),
            max_output_bytes: default_max_output_bytes(),
            kill_grace_ms: default_kill_grace_ms(),
            memory_poll_ms: default_memory_poll_ms(),
            markers: Markers::default(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }

    /// Rejects settings the service cannot run with
    pub fn check(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            bail!("the number of workers must not be 0");
        }
        if self.queue_capacity == 0 {
            bail!("the queue capacity must not be 0");
        }
        let command = match &self.strategy {
            LaunchStrategy::Direct { command } => command,
            LaunchStrategy::Container { command, image, .. } => {
                if image.is_empty() {
                    bail!("container strategy requires an image");
                }
                command
            }
        };
        if command.is_empty() {
            bail!("interpreter command must not be empty");
        }
        if !command.iter().any(|arg| arg.contains("%SOURCE%")) {
            bail!("interpreter command must reference %SOURCE%");
        }
        Ok(())
    }

    /// Directory under which per-execution workspaces are created
    pub fn workspace_root(&self) -> PathBuf {
        use directories::ProjectDirs;

        if let Some(root) = &self.workspace_root {
            return root.clone();
        }
        ProjectDirs::from("", "", "algo-sandbox")
            .map(|dirs| dirs.cache_dir().join("workspaces"))
            .unwrap_or_else(|| std::env::temp_dir().join("algo-sandbox"))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn memory_poll(&self) -> Duration {
        Duration::from_millis(self.memory_poll_ms.max(1))
    }
}

fn default_limits() -> ResourceLimits {
    ResourceLimits {
        timeout_ms: 5_000,
        memory_mb: 128,
        cpu_share: 0.5,
    }
}

fn max_limits() -> ResourceLimits {
    ResourceLimits {
        timeout_ms: 20_000,
        memory_mb: 512,
        cpu_share: 1.0,
    }
}

fn default_max_source_bytes() -> usize {
    64 * 1024
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_kill_grace_ms() -> u64 {
    500
}

fn default_memory_poll_ms() -> u64 {
    50
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_pids_limit() -> u32 {
    64
}
