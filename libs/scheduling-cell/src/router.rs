// libs/scheduling-cell/src/router.rs
use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::handlers;
use crate::state::ScheduleState;

pub fn slot_routes(state: Arc<ScheduleState>) -> Router {
    Router::new()
        // Slot CRUD
        .route("/", post(handlers::create_slot))
        .route("/", get(handlers::list_slots))
        .route("/bulk", post(handlers::bulk_create_slots))
        .route("/{slot_id}", get(handlers::get_slot))
        .route("/{slot_id}", put(handlers::update_slot))
        .route("/{slot_id}", delete(handlers::delete_slot))
        // Administrative state changes
        .route("/{slot_id}/block", post(handlers::block_slot))
        .route("/{slot_id}/unblock", post(handlers::unblock_slot))
        .route("/{slot_id}/cancel-booking", post(handlers::cancel_booking))
        .route("/{slot_id}/no-show", post(handlers::mark_no_show))
        // Reservation holds
        .route("/{slot_id}/reserve", post(handlers::reserve_slot))
        .route(
            "/reservations/{reservation_id}/confirm",
            post(handlers::confirm_reservation),
        )
        .route(
            "/reservations/{reservation_id}/release",
            post(handlers::release_reservation),
        )
        // Recurrence
        .route("/recurring", post(handlers::generate_recurring))
        // Conflict detection and resolution
        .route("/conflicts/check", post(handlers::check_conflicts))
        .route("/conflicts/suggest", get(handlers::suggest_resolutions))
        .route("/conflicts/validate", post(handlers::validate_resolution))
        .route("/conflicts/apply", post(handlers::apply_resolution))
        // Read-side aggregation
        .route("/stats", get(handlers::get_stats))
        .with_state(state)
}
