use actix_web::web::ServiceConfig;

mod events;
mod health;
mod monitoring;
mod targets;

pub fn routes(cfg: &mut ServiceConfig) {
    health::routes(cfg);
    monitoring::routes(cfg);
    targets::routes(cfg);
    events::routes(cfg);
}
