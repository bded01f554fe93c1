use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::capture::{self, CapturedStream, MemoryWatch};
use super::runner::{ExitState, SandboxHandle, SandboxLauncher, SandboxReport};
use super::workspace::Workspace;
use super::{ResourceLimits, expand_command};
use crate::error::SandboxError;

const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// Captured streams get this long to close once the process group is gone
const STREAM_GRACE: Duration = Duration::from_millis(500);

// A failed run whose virtual peak reached this share of the ceiling hit it
const MEMORY_HIT_PERCENT: u64 = 90;

/// Interpreter diagnostics that mean an allocation was refused
const OUT_OF_MEMORY_PATTERNS: [&str; 4] = [
    "out of memory",
    "memory exhausted",
    "cannot allocate memory",
    "memoryerror",
];

/// Starts the interpreter as a bare child process
///
/// Only host-level isolation applies. Memory is capped with `RLIMIT_AS`, CPU
/// time with `RLIMIT_CPU` as a backstop past the wall-clock timeout, written
/// files with `RLIMIT_FSIZE`, and the child leads its own process group so
/// termination reaches everything it spawned.
pub struct DirectLauncher {
    command: Vec<String>,
    max_output_bytes: usize,
    memory_poll: Duration,
}

impl DirectLauncher {
    pub fn new(command: Vec<String>, max_output_bytes: usize, memory_poll: Duration) -> Self {
        Self {
            command,
            max_output_bytes,
            memory_poll,
        }
    }
}

#[async_trait]
impl SandboxLauncher for DirectLauncher {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn launch(
        &self,
        workspace: &Workspace,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let source = workspace.source_path().to_string_lossy();
        let input = workspace.input_path().map(|p| p.to_string_lossy());
        let argv = expand_command(&self.command, &source, input.as_deref());
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Spawn("empty interpreter command".to_string()))?;

        let memory_bytes = limits.memory_bytes();
        let cpu_seconds = limits.timeout_ms.div_ceil(1000) + 1;
        // One byte past the output cap, so a full file still reads as truncated
        let file_bytes = self.max_output_bytes as u64 + 1;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workspace.dir())
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        // SAFETY: the hook only calls async-signal-safe `setrlimit`
        unsafe {
            cmd.pre_exec(move || apply_rlimits(memory_bytes, cpu_seconds, file_bytes));
        }

        log::debug!("Workspace {} launching `{}`", workspace.id(), argv.join(" "));
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("failed to start `{program}`: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Spawn(format!("`{program}` exited before it was tracked")))?;

        let stdout = child
            .stdout
            .take()
            .map(|out| capture::spawn_capture(out, self.max_output_bytes));
        let stderr = child
            .stderr
            .take()
            .map(|err| capture::spawn_capture(err, self.max_output_bytes));
        let memory = MemoryWatch::spawn(self.memory_poll, move || capture::read_proc_memory(pid));

        Ok(Box::new(DirectHandle {
            id: workspace.id().to_string(),
            child,
            pid,
            stdout,
            stderr,
            memory: Some(memory),
            memory_limit_kb: limits.memory_kb(),
            status: None,
            killed: false,
        }))
    }
}

type CaptureTask = tokio::task::JoinHandle<std::io::Result<CapturedStream>>;

struct DirectHandle {
    id: String,
    child: Child,
    pid: u32,
    stdout: Option<CaptureTask>,
    stderr: Option<CaptureTask>,
    memory: Option<MemoryWatch>,
    memory_limit_kb: u64,
    status: Option<ExitState>,
    killed: bool,
}

impl DirectHandle {
    /// Sends SIGKILL to the whole process group; a vanished group is fine
    ///
    /// Only valid while the leader is unreaped: its pid, and with it the
    /// group id, cannot be handed out again before that.
    fn kill_group(&self) -> std::io::Result<()> {
        // SAFETY: plain syscall on a process group id we created
        let rc = unsafe { libc::killpg(self.pid as libc::pid_t, libc::SIGKILL) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

#[async_trait]
impl SandboxHandle for DirectHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&mut self) -> std::io::Result<ExitState> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        // At least one reading, even for runs shorter than the poll interval
        let usage = capture::read_proc_memory(self.pid).await;
        if let (Some(memory), Some(usage)) = (&self.memory, usage) {
            memory.record(usage);
        }

        let pid = self.pid;
        tokio::task::spawn_blocking(move || wait_for_exit(pid))
            .await
            .map_err(std::io::Error::other)??;

        // The leader is a zombie now; stragglers that still hold the output
        // pipes go before it is reaped
        if let Err(e) = self.kill_group() {
            log::warn!("Failed to kill process group of sandbox {}: {e}", self.id);
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

        log::warn!("Sandbox {} (pid {}) forcibly terminated", self.id, self.pid);
        self.kill_group()?;
        // The group kill already reached the leader; this covers a leader
        // that left its group
        if let Err(e) = self.child.start_kill() {
            log::debug!("Sandbox {} leader already gone: {e}", self.id);
        }
        Ok(())
    }

    async fn finish(&mut self) -> SandboxReport {
        let peak = self.memory.take().map(MemoryWatch::stop).unwrap_or_default();

        // A reaped leader had its group killed in `wait`
        if self.status.is_none() {
            if let Err(e) = self.kill_group() {
                log::warn!("Failed to kill process group of sandbox {}: {e}", self.id);
            }
        }

        let stdout = capture::join_capture(self.stdout.take(), STREAM_GRACE, "stdout").await;
        let stderr = capture::join_capture(self.stderr.take(), STREAM_GRACE, "stderr").await;

        let failed = !self.status.is_some_and(|s| s.success());
        let memory_exceeded = failed
            && !self.killed
            && (peak.virtual_kb * 100 >= self.memory_limit_kb * MEMORY_HIT_PERCENT
                || reports_out_of_memory(&stderr.text));

        SandboxReport {
            stdout,
            stderr,
            peak_memory_kb: peak.resident_kb,
            memory_exceeded,
            spawn_failure: None,
        }
    }
}

fn reports_out_of_memory(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    OUT_OF_MEMORY_PATTERNS
        .iter()
        .any(|pattern| stderr.contains(pattern))
}

/// Blocks until `pid` has exited, leaving it unreaped
fn wait_for_exit(pid: u32) -> std::io::Result<()> {
    loop {
        // SAFETY: all-zero is a valid `siginfo_t`
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` outlives the call; WNOWAIT leaves the child waitable
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Runs in the forked child before exec
fn apply_rlimits(memory_bytes: u64, cpu_seconds: u64, file_bytes: u64) -> std::io::Result<()> {
    let limits = [
        (libc::RLIMIT_AS, memory_bytes, memory_bytes),
        // SIGXCPU at the soft limit, SIGKILL one second later
        (libc::RLIMIT_CPU, cpu_seconds, cpu_seconds + 1),
        // SIGXFSZ on the write that crosses it
        (libc::RLIMIT_FSIZE, file_bytes, file_bytes),
        (libc::RLIMIT_CORE, 0, 0),
    ];
    for (resource, soft, hard) in limits {
        let rlim = libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        };
        // SAFETY: `rlim` is a valid, initialised struct for the duration of the call
        if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
