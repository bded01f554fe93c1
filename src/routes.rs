use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use serde::Serialize;

use crate::queue::JobQueue;
use crate::sandbox::{ExecutionRequest, Orchestrator, StatsSnapshot};

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

#[derive(Serialize)]
struct ErrorResponseWithMessage {
    reason: &'static str,
    code: u32,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    #[serde(flatten)]
    executions: StatsSnapshot,
    queued: usize,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

/// Runs one program and answers with its result, whatever the outcome
#[post("/execute")]
pub async fn post_execute_handler(
    job_queue: web::Data<JobQueue>,
    body: web::Json<ExecutionRequest>,
) -> impl Responder {
    match job_queue.submit(body.into_inner()).await {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => {
            log::warn!("Refused execution: {e}");
            HttpResponse::ServiceUnavailable().json(ErrorResponseWithMessage {
                reason: "ERR_BUSY",
                code: 7,
                message: e.to_string(),
            })
        }
    }
}

#[get("/stats")]
pub async fn get_stats_handler(
    job_queue: web::Data<JobQueue>,
    orchestrator: web::Data<Orchestrator>,
) -> impl Responder {
    HttpResponse::Ok().json(StatsResponse {
        executions: orchestrator.stats().snapshot(),
        queued: job_queue.len().await,
    })
}
