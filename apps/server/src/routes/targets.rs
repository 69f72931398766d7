use actix_web::{HttpResponse, get, post, web};
use serde::Deserialize;
use vigil_service::VigilService;

use crate::error::AppError;

macros_utils::routes! {
    route list_targets_route,
    route get_target_route,
    route check_target_route,
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckQuery {
    #[serde(default)]
    force: bool,
}

#[get("/api/targets")]
pub async fn list_targets_route(service: web::Data<VigilService>) -> HttpResponse {
    HttpResponse::Ok().json(service.orchestrator().snapshot().await)
}

#[get("/api/targets/{key}")]
pub async fn get_target_route(
    service: web::Data<VigilService>,
    key: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let key = key.into_inner();
    match service.orchestrator().target_state(&key).await {
        Some(target) => Ok(HttpResponse::Ok().json(target)),
        None => Err(AppError::NotFound(key)),
    }
}

/// Probe one target on demand; `?force=true` skips the result cache
#[post("/api/targets/{key}/check")]
pub async fn check_target_route(
    service: web::Data<VigilService>,
    key: web::Path<String>,
    query: web::Query<CheckQuery>,
) -> Result<HttpResponse, AppError> {
    let result = service.orchestrator().check_target(&key, query.force).await?;
    Ok(HttpResponse::Ok().json(result))
}
