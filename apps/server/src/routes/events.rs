use std::convert::Infallible;
use std::time::Duration;

use actix_web::web::Bytes;
use actix_web::{HttpResponse, get, web};
use futures::stream;
use serde::Deserialize;
use tokio::time::{Instant, interval_at};
use tracing::{debug, warn};
use vigil_service::{Event, VigilService};

macros_utils::routes! {
    route history_route,
    route stream_route,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Recent events replayed before live ones
    #[serde(default)]
    replay: usize,
}

#[get("/api/events")]
pub async fn history_route(service: web::Data<VigilService>, query: web::Query<HistoryQuery>) -> HttpResponse {
    HttpResponse::Ok().json(service.bus().history(query.limit))
}

/// Live event feed as server-sent events
#[get("/api/events/stream")]
pub async fn stream_route(service: web::Data<VigilService>, query: web::Query<StreamQuery>) -> HttpResponse {
    let subscription = service.bus().subscribe_with_history(query.replay);
    let period = Duration::from_secs(service.config().bus.heartbeat_secs.max(1));
    let heartbeat = interval_at(Instant::now() + period, period);
    let closing = service.shutdown_coordinator().token();
    debug!("Event stream opened for subscriber {:?}", subscription.id());

    // Ends when the bus closes or shutdown begins
    let body = stream::unfold(
        (subscription, heartbeat, closing),
        |(mut subscription, mut heartbeat, closing)| async move {
            let chunk = tokio::select! {
                event = subscription.recv() => encode(&event?),
                _ = heartbeat.tick() => Bytes::from_static(b": keep-alive\n\n"),
                () = closing.cancelled() => return None,
            };
            Some((Ok::<_, Infallible>(chunk), (subscription, heartbeat, closing)))
        },
    );

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(body)
}

fn encode(event: &Event) -> Bytes {
    match serde_json::to_string(event) {
        Ok(data) => Bytes::from(format!("id: {}\nevent: {}\ndata: {}\n\n", event.id, event.kind.name(), data)),
        Err(e) => {
            warn!("Cannot encode event {}: {}", event.id, e);
            Bytes::from_static(b": encoding error\n\n")
        }
    }
}
