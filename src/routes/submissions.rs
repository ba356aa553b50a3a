use actix_web::{HttpResponse, Responder, get, post, web};
use serde::Deserialize;

use super::{ErrorResponse, ErrorResponseWithMessage, external_error, recorded_response};
use crate::service::{JudgeService, SubmissionRequest, SubmitError};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionsQuery {
    pub submitter_id: String,
    pub problem_id: String,
    /// Display order; storage order is always oldest first
    #[serde(default)]
    pub newest_first: bool,
}

#[post("/submissions")]
pub async fn post_submission_handler(
    service: web::Data<JudgeService>,
    body: web::Json<SubmissionRequest>,
) -> impl Responder {
    match service.submit(body.into_inner()).await {
        Ok(recorded) => recorded_response(&recorded),
        Err(e) => submit_error_response(&e),
    }
}

#[post("/submissions/pending/{pending_id}/persist")]
pub async fn retry_persist_handler(
    service: web::Data<JudgeService>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let pending_id = path.into_inner().0;

    match service.retry_persist(&pending_id).await {
        Ok(recorded) => recorded_response(&recorded),
        Err(e) => submit_error_response(&e),
    }
}

#[get("/submissions")]
pub async fn get_submissions_handler(
    service: web::Data<JudgeService>,
    query: web::Query<SubmissionsQuery>,
) -> impl Responder {
    if !service.has_problem(&query.problem_id) {
        return HttpResponse::NotFound().json(ErrorResponseWithMessage {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message: format!("Problem {} not found.", query.problem_id),
        });
    }

    match service.history(&query.submitter_id, &query.problem_id).await {
        Ok(mut records) => {
            log::info!(
                "Got {} submission records of {} for {}",
                records.len(),
                query.submitter_id,
                query.problem_id
            );
            if query.newest_first {
                records.reverse();
            }
            HttpResponse::Ok().json(records)
        }
        Err(e) => {
            log::error!("Failed to retrieve submission records: {e}");
            external_error()
        }
    }
}

fn submit_error_response(e: &SubmitError) -> HttpResponse {
    match e {
        SubmitError::InvalidArgument(message) => {
            HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
                message: message.clone(),
            })
        }
        SubmitError::UnknownProblem(_) | SubmitError::UnknownPending(_) => {
            HttpResponse::NotFound().json(ErrorResponseWithMessage {
                reason: "ERR_NOT_FOUND",
                code: 3,
                message: e.to_string(),
            })
        }
        SubmitError::Busy(_) => HttpResponse::ServiceUnavailable().json(ErrorResponse {
            reason: "ERR_BUSY",
            code: 4,
        }),
        SubmitError::WorkerGone | SubmitError::Judge(_) => {
            log::error!("Submission failed: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
            })
        }
    }
}
