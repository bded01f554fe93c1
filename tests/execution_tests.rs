use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tokio::task::JoinSet;

use algo_sandbox::config::{LaunchStrategy, SandboxConfig};
use algo_sandbox::error::AdmissionError;
use algo_sandbox::sandbox::{ExecutionRequest, Orchestrator, Outcome, RequestedLimits};
use algo_sandbox::worker::ExecutionPool;

fn fixture_command() -> Vec<String> {
    let script = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fake_interpreter.sh");
    vec![
        "sh".to_string(),
        script.to_string_lossy().into_owned(),
        "%SOURCE%".to_string(),
        "%INPUT%".to_string(),
    ]
}

// Helper function to create an orchestrator running the fake interpreter
fn create_orchestrator(root: &Path) -> Orchestrator {
    let mut config = SandboxConfig::new(LaunchStrategy::Direct {
        command: fixture_command(),
    });
    config.workspace_root = Some(root.to_path_buf());
    Orchestrator::from_config(&config)
}

fn program(body: &str) -> String {
    format!("Algorithme Test\nDebut\n{body}\nFin\n")
}

fn timeout_ms(ms: u64) -> RequestedLimits {
    RequestedLimits {
        timeout_ms: Some(ms),
        ..Default::default()
    }
}

fn workspace_count(root: &Path) -> usize {
    std::fs::read_dir(root).map(|dir| dir.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_success_prints_result() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(root.path());

    let result = orchestrator
        .execute(&ExecutionRequest::new(program("  Ecrire(1+1)")))
        .await;

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout, "2");
    assert_eq!(result.stderr, "");
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.truncated);
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(root.path());
    let request = ExecutionRequest::new(program("TantQue Vrai Faire\nFinTantQue"))
        .with_limits(timeout_ms(1000));

    let started = Instant::now();
    let result = orchestrator.execute(&request).await;

    assert_eq!(result.outcome, Outcome::TimedOut);
    assert!(result.elapsed_ms >= 1000);
    assert!(started.elapsed() < Duration::from_millis(2500));
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_timed_out_process_group_is_gone() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(root.path());
    let request = ExecutionRequest::new(program("TantQue Vrai Faire\nFinTantQue"))
        .with_limits(timeout_ms(500));

    let result = orchestrator.execute(&request).await;
    assert_eq!(result.outcome, Outcome::TimedOut);

    // The interpreter printed its pid before looping
    let pid: libc::pid_t = result.stdout.trim().parse().unwrap();
    let rc = unsafe { libc::killpg(pid, 0) };
    assert_eq!(rc, -1);
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ESRCH)
    );
}

#[tokio::test]
async fn test_invalid_source_is_never_launched() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(root.path());

    for source in ["", "   \n", "Ecrire(1+1)", "Algorithme A\nEcrire(1)\nFin"] {
        let result = orchestrator.execute(&ExecutionRequest::new(source)).await;
        assert_eq!(result.outcome, Outcome::ValidationError, "source {source:?}");
        assert!(!result.stderr.is_empty());
        assert_eq!(result.exit_code, None);
    }

    assert_eq!(orchestrator.launch_count(), 0);
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_oversized_source_is_never_launched() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(root.path());
    let body = "Ecrire(1)\n".repeat(10_000);

    let result = orchestrator.execute(&ExecutionRequest::new(program(&body))).await;

    assert_eq!(result.outcome, Outcome::ValidationError);
    assert_eq!(orchestrator.launch_count(), 0);
}

#[tokio::test]
async fn test_runtime_error_keeps_diagnostics() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(root.path());

    let result = orchestrator
        .execute(&ExecutionRequest::new(program("x <- 1 / 0\nErreur(x)")))
        .await;

    assert_eq!(result.outcome, Outcome::RuntimeError);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stderr, "Erreur ligne 3: division par zero");
}

#[tokio::test]
async fn test_input_is_passed_to_interpreter() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(root.path());
    let request = ExecutionRequest::new(program("Lire(n)")).with_input("42\n");

    let result = orchestrator.execute(&request).await;

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout, "42");
}

#[tokio::test]
async fn test_output_file_used_when_stdout_empty() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(root.path());

    let result = orchestrator
        .execute(&ExecutionRequest::new(program("Fichier(\"out\")")))
        .await;

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout, "ecrit dans le fichier");
}

#[tokio::test]
async fn test_oversized_output_file_is_capped() {
    let root = tempfile::tempdir().unwrap();
    let mut config = SandboxConfig::new(LaunchStrategy::Direct {
        command: fixture_command(),
    });
    config.workspace_root = Some(root.path().to_path_buf());
    config.max_output_bytes = 64 * 1024;
    let orchestrator = Orchestrator::from_config(&config);

    let result = orchestrator
        .execute(&ExecutionRequest::new(program("FichierGeant(\"out\")")))
        .await;

    // The write past the cap is refused with SIGXFSZ, the file stays at cap + 1
    assert_eq!(result.outcome, Outcome::ResourceExceeded);
    assert_eq!(result.stdout.len(), 64 * 1024);
    assert!(result.truncated);
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_memory_ceiling_is_resource_exceeded() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(root.path());
    let request = ExecutionRequest::new(program("t <- Tableau(100000000)")).with_limits(
        RequestedLimits {
            memory_mb: Some(32),
            timeout_ms: Some(10_000),
            ..Default::default()
        },
    );

    let result = orchestrator.execute(&request).await;

    assert_eq!(result.outcome, Outcome::ResourceExceeded);
    assert_ne!(result.outcome, Outcome::TimedOut);
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_missing_interpreter_is_spawn_error() {
    let root = tempfile::tempdir().unwrap();
    let mut config = SandboxConfig::new(LaunchStrategy::Direct {
        command: vec![
            "/nonexistent/algo-interpreter".to_string(),
            "%SOURCE%".to_string(),
        ],
    });
    config.workspace_root = Some(root.path().to_path_buf());
    let orchestrator = Orchestrator::from_config(&config);

    let result = orchestrator
        .execute(&ExecutionRequest::new(program("Ecrire(1+1)")))
        .await;

    assert_eq!(result.outcome, Outcome::SpawnError);
    assert!(!result.stderr.is_empty());
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_executions_are_isolated() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = Arc::new(create_orchestrator(root.path()));

    let mut tasks = JoinSet::new();
    for i in 0..50 {
        let orchestrator = orchestrator.clone();
        tasks.spawn(async move {
            let request = ExecutionRequest::new(program(&format!("Ecrire(\"job-{i}\")")));
            (i, orchestrator.execute(&request).await)
        });
    }

    let mut finished = 0;
    while let Some(res) = tasks.join_next().await {
        let (i, result) = res.unwrap();
        assert_eq!(result.outcome, Outcome::Success, "job {i}: {}", result.stderr);
        assert_eq!(result.stdout, format!("job-{i}"));
        finished += 1;
    }

    assert_eq!(finished, 50);
    assert_eq!(orchestrator.launch_count(), 50);
    assert_eq!(orchestrator.stats().count(Outcome::Success), 50);
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_pool_refuses_work_beyond_queue_capacity() {
    let root = tempfile::tempdir().unwrap();
    let orchestrator = Arc::new(create_orchestrator(root.path()));
    let pool = Arc::new(ExecutionPool::start(orchestrator.clone(), 1, 1));
    let looping = || {
        ExecutionRequest::new(program("TantQue Vrai Faire\nFinTantQue"))
            .with_limits(timeout_ms(1000))
    };

    // Occupy the only worker
    let running = {
        let pool = pool.clone();
        let request = looping();
        tokio::spawn(async move { pool.submit(request).await })
    };
    while orchestrator.launch_count() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Fill the only queue slot
    let queue = pool.queue();
    let waiting = {
        let pool = pool.clone();
        let request = looping();
        tokio::spawn(async move { pool.submit(request).await })
    };
    while queue.is_empty().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        pool.submit(looping()).await,
        Err(AdmissionError::QueueFull { capacity: 1 })
    );

    assert_eq!(running.await.unwrap().unwrap().outcome, Outcome::TimedOut);
    assert_eq!(waiting.await.unwrap().unwrap().outcome, Outcome::TimedOut);
    assert_eq!(orchestrator.launch_count(), 2);

    let pool = Arc::try_unwrap(pool).ok().unwrap();
    pool.shutdown().await;
    assert_eq!(workspace_count(root.path()), 0);
}
