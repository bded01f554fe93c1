use tokio::io::AsyncReadExt;

use super::enforcer::RunOutcome;
use super::runner::{ExitState, SandboxHandle, SandboxReport};
use super::workspace::Workspace;
use super::{ExecutionResult, Outcome};

/// Gathers what a finished run left behind and classifies it
///
/// `max_output_bytes` bounds how much of the workspace output file is read
/// when the interpreter wrote nothing to standard output.
pub async fn collect(
    handle: &mut dyn SandboxHandle,
    run: RunOutcome,
    workspace: &Workspace,
    max_output_bytes: usize,
) -> ExecutionResult {
    let report = handle.finish().await;
    let outcome = classify(&run, &report);

    let SandboxReport {
        stdout,
        stderr,
        peak_memory_kb,
        spawn_failure,
        ..
    } = report;

    let mut truncated = stdout.truncated || stderr.truncated;
    let mut stdout = stdout.text;
    if stdout.is_empty() {
        if let Some((text, cut)) = read_output_file(workspace, max_output_bytes).await {
            stdout = text;
            truncated |= cut;
        }
    }

    let mut stderr = stderr.text;
    if let Some(reason) = spawn_failure.or(run.fault) {
        stderr = reason;
    } else if stderr.trim().is_empty() {
        if let Some(ExitState::Signal(signal)) = run.exit {
            if !run.timed_out {
                stderr = format!("terminated by signal {signal}");
            }
        }
    }

    ExecutionResult {
        outcome,
        stdout: trim_line_end(stdout),
        stderr: trim_line_end(stderr),
        exit_code: run.exit.and_then(|exit| exit.code()),
        elapsed_ms: run.elapsed.as_millis() as u64,
        peak_memory_mb: peak_memory_kb.div_ceil(1024),
        truncated,
    }
}

/// Derives the outcome classification of a run
///
/// Precedence: engine failure, then timeout, then resource ceilings, then the
/// exit status. A timeout wins over any partial output.
pub fn classify(run: &RunOutcome, report: &SandboxReport) -> Outcome {
    if report.spawn_failure.is_some() || run.fault.is_some() {
        return Outcome::SpawnError;
    }
    if run.timed_out {
        return Outcome::TimedOut;
    }
    if report.memory_exceeded {
        return Outcome::ResourceExceeded;
    }
    match run.exit {
        Some(ExitState::Signal(libc::SIGXCPU | libc::SIGXFSZ)) => Outcome::ResourceExceeded,
        Some(exit) if exit.success() => Outcome::Success,
        _ => Outcome::RuntimeError,
    }
}

/// Reads at most `limit` bytes of the output file; the flag tells whether
/// the file held more
async fn read_output_file(workspace: &Workspace, limit: usize) -> Option<(String, bool)> {
    let file = tokio::fs::File::open(workspace.output_file()).await.ok()?;
    let mut bytes = Vec::new();
    if let Err(e) = file.take(limit as u64 + 1).read_to_end(&mut bytes).await {
        log::warn!("Failed to read output file of workspace {}: {e}", workspace.id());
        return None;
    }
    if bytes.is_empty() {
        return None;
    }
    let cut = bytes.len() > limit;
    bytes.truncate(limit);
    Some((String::from_utf8_lossy(&bytes).into_owned(), cut))
}

fn trim_line_end(mut text: String) -> String {
    let len = text.trim_end_matches(['\n', '\r']).len();
    text.truncate(len);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn run(exit: Option<ExitState>, timed_out: bool) -> RunOutcome {
        RunOutcome {
            exit,
            timed_out,
            elapsed: Duration::from_millis(5),
            fault: None,
        }
    }

    #[test]
    fn test_classify_exit_status() {
        let report = SandboxReport::default();
        assert_eq!(
            classify(&run(Some(ExitState::Code(0)), false), &report),
            Outcome::Success
        );
        assert_eq!(
            classify(&run(Some(ExitState::Code(3)), false), &report),
            Outcome::RuntimeError
        );
        assert_eq!(
            classify(&run(Some(ExitState::Signal(libc::SIGSEGV)), false), &report),
            Outcome::RuntimeError
        );
        assert_eq!(
            classify(&run(Some(ExitState::Signal(libc::SIGXCPU)), false), &report),
            Outcome::ResourceExceeded
        );
    }

    #[test]
    fn test_timeout_beats_everything_but_engine_failure() {
        let report = SandboxReport {
            memory_exceeded: true,
            ..Default::default()
        };
        assert_eq!(
            classify(&run(Some(ExitState::Signal(libc::SIGKILL)), true), &report),
            Outcome::TimedOut
        );
        assert_eq!(classify(&run(None, true), &report), Outcome::TimedOut);

        let failed = SandboxReport {
            spawn_failure: Some("docker: Cannot connect".to_string()),
            ..Default::default()
        };
        assert_eq!(
            classify(&run(Some(ExitState::Code(125)), false), &failed),
            Outcome::SpawnError
        );
    }

    #[test]
    fn test_memory_exceeded_is_not_a_timeout() {
        let report = SandboxReport {
            memory_exceeded: true,
            ..Default::default()
        };
        assert_eq!(
            classify(&run(Some(ExitState::Code(137)), false), &report),
            Outcome::ResourceExceeded
        );
    }

    #[test]
    fn test_supervision_fault_is_spawn_error() {
        let mut outcome = run(None, false);
        outcome.fault = Some("failed to wait for sandbox".to_string());
        assert_eq!(
            classify(&outcome, &SandboxReport::default()),
            Outcome::SpawnError
        );
    }

    #[test]
    fn test_file_size_signal_is_resource_exceeded() {
        assert_eq!(
            classify(
                &run(Some(ExitState::Signal(libc::SIGXFSZ)), false),
                &SandboxReport::default()
            ),
            Outcome::ResourceExceeded
        );
    }

    #[tokio::test]
    async fn test_output_file_read_is_bounded() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(root.path(), "Algorithme A", None).unwrap();
        std::fs::write(ws.output_file(), vec![b'a'; 256 * 1024]).unwrap();

        let (text, cut) = read_output_file(&ws, 1024).await.unwrap();
        assert_eq!(text.len(), 1024);
        assert!(cut);

        std::fs::write(ws.output_file(), b"exactly").unwrap();
        let (text, cut) = read_output_file(&ws, 7).await.unwrap();
        assert_eq!(text, "exactly");
        assert!(!cut);

        std::fs::write(ws.output_file(), b"").unwrap();
        assert_eq!(read_output_file(&ws, 7).await, None);
    }

    #[test]
    fn test_trim_line_end() {
        assert_eq!(trim_line_end("2\n".to_string()), "2");
        assert_eq!(trim_line_end("a\r\n\n".to_string()), "a");
        assert_eq!(trim_line_end("  indented  \n".to_string()), "  indented  ");
    }
}
