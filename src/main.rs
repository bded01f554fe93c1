use std::sync::Arc;

use clap::Parser;

use algo_sandbox::config::{CliArgs, Config};
use algo_sandbox::sandbox::Orchestrator;
use algo_sandbox::web_server::build_server;
use algo_sandbox::worker::ExecutionPool;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        sandbox: sandbox_config,
    } = match cli.to_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {e:#}");
            std::process::exit(2);
        }
    };

    let orchestrator = Arc::new(Orchestrator::from_config(&sandbox_config));

    // ======= PREPARATION END, EXECUTION START =======

    let mut pool = ExecutionPool::start(
        orchestrator.clone(),
        sandbox_config.workers,
        sandbox_config.queue_capacity,
    );

    let server = build_server(server_config, pool.queue(), orchestrator)?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = pool.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop taking requests
    server_handle.stop(true).await;

    // 2. Let running executions finish and their workspaces be released
    pool.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}
