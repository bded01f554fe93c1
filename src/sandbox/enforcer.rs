use std::time::{Duration, Instant};

use tokio::time::timeout;

use super::ResourceLimits;
use super::runner::{ExitState, SandboxHandle};

/// How supervision of one run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit state, if the process was reaped
    pub exit: Option<ExitState>,
    /// The wall-clock timer fired before the run exited
    pub timed_out: bool,
    /// Wall-clock time from the start of supervision until exit or timeout
    pub elapsed: Duration,
    /// Supervision itself failed, e.g. the process could not be waited on
    pub fault: Option<String>,
}

/// Waits for `handle` under the wall-clock limit of `limits`
///
/// If the timer fires first the run is terminated unconditionally and the
/// outcome is a timeout, whatever it printed so far. The terminated process
/// is then given `grace` to be reaped.
pub async fn supervise(
    handle: &mut dyn SandboxHandle,
    limits: &ResourceLimits,
    grace: Duration,
) -> RunOutcome {
    let started = Instant::now();

    match timeout(limits.timeout(), handle.wait()).await {
        Ok(Ok(exit)) => RunOutcome {
            exit: Some(exit),
            timed_out: false,
            elapsed: started.elapsed(),
            fault: None,
        },
        Ok(Err(e)) => {
            log::error!("Lost track of sandbox {}: {e}", handle.id());
            if let Err(e) = handle.terminate().await {
                log::error!("Failed to terminate sandbox {}: {e}", handle.id());
            }
            RunOutcome {
                exit: None,
                timed_out: false,
                elapsed: started.elapsed(),
                fault: Some(format!("failed to wait for sandbox: {e}")),
            }
        }
        Err(_) => {
            let elapsed = started.elapsed();
            log::info!(
                "Sandbox {} exceeded its {} ms wall-clock limit",
                handle.id(),
                limits.timeout_ms
            );
            if let Err(e) = handle.terminate().await {
                log::error!("Failed to terminate sandbox {}: {e}", handle.id());
            }
            let exit = match timeout(grace, handle.wait()).await {
                Ok(Ok(exit)) => Some(exit),
                Ok(Err(e)) => {
                    log::error!("Failed to reap sandbox {}: {e}", handle.id());
                    None
                }
                Err(_) => {
                    log::error!(
                        "Sandbox {} still alive {grace:?} after termination",
                        handle.id()
                    );
                    None
                }
            };
            RunOutcome {
                exit,
                timed_out: true,
                elapsed,
                fault: None,
            }
        }
    }
}
