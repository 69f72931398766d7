use actix_web::{HttpResponse, get, post, web};
use vigil_service::VigilService;

use crate::error::AppError;

macros_utils::routes! {
    route status_route,
    route start_route,
    route stop_route,
    route cycle_route,
    route reload_route,
}

/// Loop state, last cycle, cache and bus counters
#[get("/api/monitoring/status")]
pub async fn status_route(service: web::Data<VigilService>) -> HttpResponse {
    HttpResponse::Ok().json(service.orchestrator().status().await)
}

#[post("/api/monitoring/start")]
pub async fn start_route(service: web::Data<VigilService>) -> Result<HttpResponse, AppError> {
    service.start().await?;
    Ok(HttpResponse::Accepted().json(service.orchestrator().status().await))
}

#[post("/api/monitoring/stop")]
pub async fn stop_route(service: web::Data<VigilService>) -> HttpResponse {
    service.orchestrator().stop().await;
    HttpResponse::Ok().json(service.orchestrator().status().await)
}

/// Run one cycle now and return its summary
#[post("/api/monitoring/cycle")]
pub async fn cycle_route(service: web::Data<VigilService>) -> Result<HttpResponse, AppError> {
    let summary = service.orchestrator().run_cycle_now().await?;
    Ok(HttpResponse::Ok().json(summary))
}

/// Re-read the config file and the target list
#[post("/api/monitoring/reload")]
pub async fn reload_route(service: web::Data<VigilService>) -> Result<HttpResponse, AppError> {
    let summary = service.reload_configuration().await?;
    Ok(HttpResponse::Ok().json(summary))
}
