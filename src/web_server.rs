use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::routes::{
    get_submissions_handler, get_user_stats_handler, json_error_handler, post_submission_handler,
    query_error_handler, retry_persist_handler,
};
use crate::service::JudgeService;

/// Registers every route and the JSON/query error handlers
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .app_data(web::QueryConfig::default().error_handler(query_error_handler))
        .service(post_submission_handler)
        .service(retry_persist_handler)
        .service(get_submissions_handler)
        .service(get_user_stats_handler);
}

pub fn build_server(
    server_config: ServerConfig,
    service: Arc<JudgeService>,
) -> std::io::Result<Server> {
    let service = web::Data::from(service);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
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
