use axum::response::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct Status {
    status: &'static str,
}

/// Liveness only. Broker and model reachability are not checked here.
pub async fn healthcheck() -> Json<Status> {
    Json(Status {
        status: "Available",
    })
}
