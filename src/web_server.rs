use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::queue::JobQueue;
use crate::routes::{get_stats_handler, json_error_handler, post_execute_handler};
use crate::sandbox::Orchestrator;

/// Request bodies above this size are refused before deserialization
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

pub fn build_server(
    server_config: ServerConfig,
    queue: Arc<JobQueue>,
    orchestrator: Arc<Orchestrator>,
) -> std::io::Result<Server> {
    let queue = web::Data::from(queue);
    let orchestrator = web::Data::from(orchestrator);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(queue.clone())
            .app_data(orchestrator.clone())
            .app_data(
                web::JsonConfig::default()
                    .limit(MAX_PAYLOAD_BYTES)
                    .error_handler(json_error_handler),
            )
            .wrap(middleware::Logger::default())
            .service(post_execute_handler)
            .service(get_stats_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
