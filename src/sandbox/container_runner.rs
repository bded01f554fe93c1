use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::capture::{self, CapturedStream, MemoryUsage, MemoryWatch};
use super::runner::{ExitState, SandboxHandle, SandboxLauncher, SandboxReport};
use super::workspace::Workspace;
use super::{ResourceLimits, expand_command};
use crate::error::SandboxError;

// Mount points inside the container; the output mount sits over the
// read-only `out/` of the code mount
const CODE_MOUNT: &str = "/sandbox/code";
const OUTPUT_MOUNT: &str = "/sandbox/code/out";

const SCRATCH_TMPFS: &str = "/tmp:rw,noexec,nosuid,size=16m";

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

const STREAM_GRACE: Duration = Duration::from_millis(500);

// `State.StartedAt` of a container that never ran, in docker and podman format
const NEVER_STARTED: &str = "0001-01-01";

/// Starts the interpreter inside a disposable container
///
/// The container gets no network, a hard memory ceiling with swap equal to
/// it, a fractional CPU share, a pid limit, a read-only root filesystem, the
/// workspace mounted read-only and only its output directory writable, with
/// written files capped at the output limit. It is named after the workspace
/// id, so its cgroup, start and OOM state are always queried for this run
/// alone.
pub struct ContainerLauncher {
    engine: String,
    image: String,
    command: Vec<String>,
    pids_limit: u32,
    max_output_bytes: usize,
    memory_poll: Duration,
}

impl ContainerLauncher {
    pub fn new(
        engine: String,
        image: String,
        command: Vec<String>,
        pids_limit: u32,
        max_output_bytes: usize,
        memory_poll: Duration,
    ) -> Self {
        Self {
            engine,
            image,
            command,
            pids_limit,
            max_output_bytes,
            memory_poll,
        }
    }

    /// Arguments of the `run` invocation for one workspace
    fn run_args(&self, name: &str, workspace: &Workspace, limits: &ResourceLimits) -> Vec<String> {
        let source = format!(
            "{CODE_MOUNT}/{}",
            workspace
                .source_path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        let input = workspace.input_path().map(|p| {
            format!(
                "{CODE_MOUNT}/{}",
                p.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            )
        });
        // SAFETY: getuid/getgid cannot fail
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        let mut args: Vec<String> = vec![
            "run".into(),
            "--name".into(),
            name.into(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            format!("{}m", limits.memory_mb),
            "--memory-swap".into(),
            format!("{}m", limits.memory_mb),
            "--cpus".into(),
            format!("{:.2}", limits.cpu_share),
            "--pids-limit".into(),
            self.pids_limit.to_string(),
            "--ulimit".into(),
            format!("fsize={0}:{0}", self.max_output_bytes as u64 + 1),
            "--read-only".into(),
            "--tmpfs".into(),
            SCRATCH_TMPFS.into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            // Files the run writes stay deletable by the service user
            "--user".into(),
            format!("{uid}:{gid}"),
            "--volume".into(),
            format!("{}:{CODE_MOUNT}:ro", workspace.dir().display()),
            "--volume".into(),
            format!("{}:{OUTPUT_MOUNT}:rw", workspace.output_dir().display()),
            "--workdir".into(),
            CODE_MOUNT.into(),
            self.image.clone(),
        ];
        args.extend(expand_command(&self.command, &source, input.as_deref()));
        args
    }
}

#[async_trait]
impl SandboxLauncher for ContainerLauncher {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn launch(
        &self,
        workspace: &Workspace,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let name = format!("algo-sbx-{}", workspace.id());
        let args = self.run_args(&name, workspace, limits);

        log::debug!("Workspace {} launching `{} {}`", workspace.id(), self.engine, args.join(" "));
        let mut child = Command::new(&self.engine)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Spawn(format!("failed to start container engine `{}`: {e}", self.engine))
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| capture::spawn_capture(out, self.max_output_bytes));
        let stderr = child
            .stderr
            .take()
            .map(|err| capture::spawn_capture(err, self.max_output_bytes));

        let sampler = CgroupSampler {
            engine: self.engine.clone(),
            name: name.clone(),
            cgroup: Arc::new(OnceLock::new()),
        };
        let memory = MemoryWatch::spawn(self.memory_poll, move || sampler.clone().sample());

        Ok(Box::new(ContainerHandle {
            engine: self.engine.clone(),
            name,
            child,
            stdout,
            stderr,
            memory: Some(memory),
            status: None,
            killed: false,
            removed: false,
        }))
    }
}

type CaptureTask = tokio::task::JoinHandle<std::io::Result<CapturedStream>>;

struct ContainerHandle {
    engine: String,
    name: String,
    /// The attached `run` client; its exit status is the container's
    child: Child,
    stdout: Option<CaptureTask>,
    stderr: Option<CaptureTask>,
    memory: Option<MemoryWatch>,
    status: Option<ExitState>,
    killed: bool,
    removed: bool,
}

impl ContainerHandle {
    async fn engine_output(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        engine_output(&self.engine, args).await
    }

    /// `State.StartedAt` of the container, `None` if the engine does not know it
    async fn started_at(&self) -> Option<String> {
        match self
            .engine_output(&["inspect", "--format", "{{.State.StartedAt}}", &self.name])
            .await
        {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(_) => None,
            Err(e) => {
                log::warn!("Failed to inspect container {}: {e}", self.name);
                None
            }
        }
    }

    async fn oom_killed(&self) -> bool {
        match self
            .engine_output(&["inspect", "--format", "{{.State.OOMKilled}}", &self.name])
            .await
        {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            Ok(_) => false,
            Err(e) => {
                log::warn!("Failed to inspect container {}: {e}", self.name);
                false
            }
        }
    }

    async fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;

        match self.engine_output(&["rm", "--force", &self.name]).await {
            Ok(output) if output.status.success() => {
                log::debug!("Container {} removed", self.name);
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                // Never created, nothing to remove
                if !stderr.to_lowercase().contains("no such container") {
                    log::error!("Failed to remove container {}: {}", self.name, stderr.trim());
                }
            }
            Err(e) => log::error!("Failed to remove container {}: {e}", self.name),
        }
    }
}

#[async_trait]
impl SandboxHandle for ContainerHandle {
    fn id(&self) -> &str {
        &self.name
    }

    async fn wait(&mut self) -> std::io::Result<ExitState> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = ExitState::from(self.child.wait().await?);
        self.status = Some(status);
        Ok(status)
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        if self.killed || self.status.is_some() {
            return Ok(());
        }
        self.killed = true;

        log::warn!("Container {} forcibly terminated", self.name);
        // Killing the client alone would leave the container running
        match self.engine_output(&["kill", &self.name]).await {
            Ok(output) if !output.status.success() => log::debug!(
                "Container {} kill: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(_) => {}
            Err(e) => log::error!("Failed to kill container {}: {e}", self.name),
        }
        if let Err(e) = self.child.start_kill() {
            log::debug!("Container client for {} already gone: {e}", self.name);
        }
        Ok(())
    }

    async fn finish(&mut self) -> SandboxReport {
        let peak = self.memory.take().map(MemoryWatch::stop).unwrap_or_default();

        let stdout = capture::join_capture(self.stdout.take(), STREAM_GRACE, "stdout").await;
        let stderr = capture::join_capture(self.stderr.take(), STREAM_GRACE, "stderr").await;

        let failed = !self.status.is_some_and(|s| s.success());
        let spawn_failure = if failed && !self.killed {
            engine_failure(self.started_at().await.as_deref(), &stderr.text)
        } else {
            None
        };
        let memory_exceeded = spawn_failure.is_none() && failed && self.oom_killed().await;

        self.remove().await;

        SandboxReport {
            stdout,
            stderr,
            peak_memory_kb: peak.resident_kb,
            memory_exceeded,
            spawn_failure,
        }
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        // Fire and forget: the async path was skipped by a panic or cancellation
        log::warn!("Container {} dropped without cleanup, removing in background", self.name);
        if let Err(e) = std::process::Command::new(&self.engine)
            .args(["rm", "--force", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            log::error!("Failed to remove container {}: {e}", self.name);
        }
    }
}

async fn engine_output(engine: &str, args: &[&str]) -> std::io::Result<std::process::Output> {
    Command::new(engine)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
}

/// Reason a failed run never got to execute, judged by whether the engine
/// ever started the container
fn engine_failure(started_at: Option<&str>, stderr: &str) -> Option<String> {
    let started = started_at.is_some_and(|at| !at.is_empty() && !at.starts_with(NEVER_STARTED));
    if started {
        return None;
    }
    let stderr = stderr.trim();
    Some(if stderr.is_empty() {
        "container never started".to_string()
    } else {
        stderr.to_string()
    })
}

/// Memory accounting files of one container's cgroup
#[derive(Debug, Clone, PartialEq, Eq)]
enum CgroupMemory {
    /// Unified hierarchy directory
    V2(PathBuf),
    /// Directory in the v1 `memory` controller hierarchy
    V1(PathBuf),
}

impl CgroupMemory {
    /// Locates the memory cgroup from the contents of `/proc/<pid>/cgroup`
    fn from_proc(proc_cgroup: &str, root: &Path) -> Option<Self> {
        let mut unified = None;
        for line in proc_cgroup.lines() {
            let mut fields = line.splitn(3, ':');
            let (Some(_), Some(controllers), Some(path)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let relative = path.trim_start_matches('/');
            if controllers.split(',').any(|c| c == "memory") {
                return Some(CgroupMemory::V1(root.join("memory").join(relative)));
            }
            if controllers.is_empty() {
                unified = Some(CgroupMemory::V2(root.join(relative)));
            }
        }
        unified
    }

    /// Peak usage so far, in kilobytes
    async fn peak_kb(&self) -> Option<u64> {
        let bytes = match self {
            CgroupMemory::V2(dir) => match read_counter(&dir.join("memory.peak")).await {
                Some(peak) => peak,
                // Kernels before 5.19 only expose the current usage
                None => read_counter(&dir.join("memory.current")).await?,
            },
            CgroupMemory::V1(dir) => read_counter(&dir.join("memory.max_usage_in_bytes")).await?,
        };
        Some(bytes.div_ceil(1024))
    }
}

async fn read_counter(path: &Path) -> Option<u64> {
    tokio::fs::read_to_string(path).await.ok()?.trim().parse().ok()
}

/// Samples the memory high-water mark of one container from its cgroup
#[derive(Clone)]
struct CgroupSampler {
    engine: String,
    name: String,
    cgroup: Arc<OnceLock<CgroupMemory>>,
}

impl CgroupSampler {
    async fn sample(self) -> Option<MemoryUsage> {
        if self.cgroup.get().is_none() {
            let found = self.locate().await?;
            log::debug!("Container {} memory cgroup at {found:?}", self.name);
            let _ = self.cgroup.set(found);
        }
        let kb = self.cgroup.get()?.peak_kb().await?;
        Some(MemoryUsage {
            resident_kb: kb,
            virtual_kb: kb,
        })
    }

    /// Finds the cgroup through the host pid of the container's init process
    async fn locate(&self) -> Option<CgroupMemory> {
        let output = engine_output(&self.engine, &["inspect", "--format", "{{.State.Pid}}", &self.name])
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let pid: u32 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
        if pid == 0 {
            return None;
        }
        let proc_cgroup = tokio::fs::read_to_string(format!("/proc/{pid}/cgroup")).await.ok()?;
        CgroupMemory::from_proc(&proc_cgroup, Path::new(CGROUP_ROOT))
    }
}
