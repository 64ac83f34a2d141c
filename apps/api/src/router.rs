use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use scheduling_cell::router::slot_routes;
use scheduling_cell::ScheduleState;

pub fn create_router(state: Arc<ScheduleState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Dental Slots API is running!" }))
        .nest("/slots", slot_routes(state))
}
