mod submissions;
mod users;

pub use submissions::{get_submissions_handler, post_submission_handler, retry_persist_handler};
pub use users::get_user_stats_handler;

use actix_web::HttpRequest;
use actix_web::HttpResponse;
use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use serde::Serialize;

use crate::recorder::Recorded;
use crate::verdict::Verdict;

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

/// Body returned when a verdict exists but could not be stored
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UnpersistedVerdict<'a> {
    pub judged: &'a Verdict,
    pub persisted: bool,
    pub retryable: bool,
    pub pending_id: &'a str,
}

fn recorded_response(recorded: &Recorded) -> HttpResponse {
    match recorded {
        Recorded::Persisted(verdict) => HttpResponse::Ok().json(verdict),
        Recorded::Pending {
            verdict,
            pending_id,
            error,
        } => HttpResponse::Ok().json(UnpersistedVerdict {
            judged: verdict,
            persisted: false,
            retryable: error.retryable(),
            pending_id,
        }),
    }
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponseWithMessage {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
        message: err.to_string(),
    });
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponseWithMessage {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
        message: err.to_string(),
    });
    InternalError::from_response(err, response).into()
}

fn external_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(ErrorResponse {
        reason: "ERR_EXTERNAL",
        code: 5,
    })
}
