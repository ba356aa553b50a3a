use actix_web::{HttpResponse, Responder, get, web};

use super::external_error;
use crate::service::JudgeService;

#[get("/users/{submitter_id}/stats")]
pub async fn get_user_stats_handler(
    service: web::Data<JudgeService>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let submitter_id = path.into_inner().0;

    match service.stats(&submitter_id).await {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => {
            log::error!("Failed to load stats of {submitter_id}: {e}");
            external_error()
        }
    }
}
