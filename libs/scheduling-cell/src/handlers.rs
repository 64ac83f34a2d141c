// libs/scheduling-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use shared_models::error::AppError;

use crate::models::{
    AppointmentType, ApplyResolutionRequest, CreateSlotRequest, GenerateRecurringRequest,
    ReserveSlotRequest, SlotError, SlotFilter, SlotState, SortDirection, SortKey, TimeSlot,
    UpdateSlotRequest,
};
use crate::services::pricing;
use crate::state::ScheduleState;

// ==============================================================================
// QUERY PARAMETER STRUCTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct SlotListQuery {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub dentist_id: Option<Uuid>,
    pub clinic_id: Option<Uuid>,
    pub state: Option<SlotState>,
    pub appointment_type: Option<AppointmentType>,
    pub min_duration_minutes: Option<i64>,
    pub max_duration_minutes: Option<i64>,
    pub time_from: Option<NaiveTime>,
    pub time_to: Option<NaiveTime>,
    pub has_free_capacity: Option<bool>,
    pub recurring_only: Option<bool>,
    pub sort_key: Option<SortKey>,
    pub sort_direction: Option<SortDirection>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl From<SlotListQuery> for SlotFilter {
    fn from(query: SlotListQuery) -> Self {
        SlotFilter {
            date_from: query.date_from,
            date_to: query.date_to,
            dentist_ids: query.dentist_id.map(|id| vec![id]),
            clinic_ids: query.clinic_id.map(|id| vec![id]),
            states: query.state.map(|s| vec![s]),
            appointment_types: query.appointment_type.map(|t| vec![t]),
            min_duration_minutes: query.min_duration_minutes,
            max_duration_minutes: query.max_duration_minutes,
            time_from: query.time_from,
            time_to: query.time_to,
            has_free_capacity: query.has_free_capacity,
            recurring_only: query.recurring_only,
            sort_key: query.sort_key,
            sort_direction: query.sort_direction,
            limit: query.limit,
            offset: query.offset,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SuggestQuery {
    pub conflict_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct VersionedRequest {
    pub version: u64,
}

// ==============================================================================
// RESPONSE SHAPING
// ==============================================================================

/// Slot plus the derived pricing fields; factors are recomputed on every
/// read, never stored.
fn priced(slot: &TimeSlot) -> Result<Value, AppError> {
    let mut value = serde_json::to_value(slot)
        .map_err(|e| AppError::Internal(format!("slot serialization failed: {}", e)))?;
    if let Value::Object(ref mut map) = value {
        map.insert(
            "demand_factor".to_string(),
            json!(pricing::demand_factor(slot.demand_score)),
        );
        map.insert("final_price".to_string(), json!(pricing::final_price(slot)));
    }
    Ok(value)
}

fn map_slot_error(error: SlotError) -> AppError {
    match error {
        SlotError::Validation(msg) => AppError::ValidationError(msg),
        SlotError::ConflictDetected(conflicts) => {
            AppError::SchedulingConflict(json!(conflicts))
        }
        SlotError::ConcurrencyConflict { expected, actual } => AppError::Conflict(format!(
            "stale version: expected {}, found {}",
            expected, actual
        )),
        SlotError::DeletionBlocked => {
            AppError::Conflict("slot has active bookings and cannot be deleted".to_string())
        }
        SlotError::InvalidStateTransition { from, to } => {
            AppError::Conflict(format!("illegal state transition: {} -> {}", from, to))
        }
        SlotError::NotFound => AppError::NotFound("slot not found".to_string()),
        SlotError::ReservationNotFound => {
            AppError::NotFound("reservation not found".to_string())
        }
        SlotError::Expired => AppError::Gone("reservation hold has expired".to_string()),
    }
}

// ==============================================================================
// SLOT CRUD HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_slot(
    State(state): State<Arc<ScheduleState>>,
    Json(request): Json<CreateSlotRequest>,
) -> Result<Json<Value>, AppError> {
    let slot = state
        .scheduling
        .create_slot(request)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot": priced(&slot)?,
        "message": "Slot created successfully"
    })))
}

#[axum::debug_handler]
pub async fn bulk_create_slots(
    State(state): State<Arc<ScheduleState>>,
    Json(requests): Json<Vec<CreateSlotRequest>>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.scheduling.bulk_create_slots(requests).await;
    let created: Vec<Value> = outcome.created.iter().map(priced).collect::<Result<_, _>>()?;

    Ok(Json(json!({
        "success": outcome.errors.is_empty(),
        "created": created,
        "errors": outcome.errors,
    })))
}

#[axum::debug_handler]
pub async fn list_slots(
    State(state): State<Arc<ScheduleState>>,
    Query(query): Query<SlotListQuery>,
) -> Result<Json<Value>, AppError> {
    let filter: SlotFilter = query.into();
    let page = state.scheduling.list_slots(&filter).await;
    let items: Vec<Value> = page.items.iter().map(priced).collect::<Result<_, _>>()?;

    Ok(Json(json!({
        "success": true,
        "slots": items,
        "total": page.total,
        "limit": page.limit,
        "offset": page.offset,
    })))
}

#[axum::debug_handler]
pub async fn get_slot(
    State(state): State<Arc<ScheduleState>>,
    Path(slot_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let slot = state
        .scheduling
        .get_slot(slot_id)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot": priced(&slot)?,
    })))
}

#[axum::debug_handler]
pub async fn update_slot(
    State(state): State<Arc<ScheduleState>>,
    Path(slot_id): Path<Uuid>,
    Json(request): Json<UpdateSlotRequest>,
) -> Result<Json<Value>, AppError> {
    let slot = state
        .scheduling
        .update_slot(slot_id, request.version, request.patch)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot": priced(&slot)?,
        "message": "Slot updated successfully"
    })))
}

#[axum::debug_handler]
pub async fn delete_slot(
    State(state): State<Arc<ScheduleState>>,
    Path(slot_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    state
        .scheduling
        .delete_slot(slot_id)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "message": "Slot deleted successfully"
    })))
}

// ==============================================================================
// ADMINISTRATIVE STATE HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn block_slot(
    State(state): State<Arc<ScheduleState>>,
    Path(slot_id): Path<Uuid>,
    Json(request): Json<VersionedRequest>,
) -> Result<Json<Value>, AppError> {
    let slot = state
        .scheduling
        .block_slot(slot_id, request.version)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot": priced(&slot)?,
        "message": "Slot blocked"
    })))
}

#[axum::debug_handler]
pub async fn unblock_slot(
    State(state): State<Arc<ScheduleState>>,
    Path(slot_id): Path<Uuid>,
    Json(request): Json<VersionedRequest>,
) -> Result<Json<Value>, AppError> {
    let slot = state
        .scheduling
        .unblock_slot(slot_id, request.version)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot": priced(&slot)?,
        "message": "Slot unblocked"
    })))
}

#[axum::debug_handler]
pub async fn cancel_booking(
    State(state): State<Arc<ScheduleState>>,
    Path(slot_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let slot = state
        .scheduling
        .cancel_booking(slot_id)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot": priced(&slot)?,
        "message": "Booking cancelled"
    })))
}

#[axum::debug_handler]
pub async fn mark_no_show(
    State(state): State<Arc<ScheduleState>>,
    Path(slot_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let slot = state
        .scheduling
        .mark_no_show(slot_id)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot": priced(&slot)?,
        "message": "No-show recorded"
    })))
}

// ==============================================================================
// RESERVATION HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn reserve_slot(
    State(state): State<Arc<ScheduleState>>,
    Path(slot_id): Path<Uuid>,
    Json(request): Json<ReserveSlotRequest>,
) -> Result<Json<Value>, AppError> {
    let reservation = state
        .reservations
        .reserve(slot_id, request.hold_minutes)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "reservation_id": reservation.id,
        "expires_at": reservation.expires_at,
        "message": "Slot held pending confirmation"
    })))
}

#[axum::debug_handler]
pub async fn confirm_reservation(
    State(state): State<Arc<ScheduleState>>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let slot = state
        .reservations
        .confirm(reservation_id)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot": priced(&slot)?,
        "message": "Reservation confirmed"
    })))
}

#[axum::debug_handler]
pub async fn release_reservation(
    State(state): State<Arc<ScheduleState>>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    state
        .reservations
        .release(reservation_id)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "message": "Reservation released"
    })))
}

// ==============================================================================
// RECURRENCE HANDLER
// ==============================================================================

#[axum::debug_handler]
pub async fn generate_recurring(
    State(state): State<Arc<ScheduleState>>,
    Json(request): Json<GenerateRecurringRequest>,
) -> Result<Json<Value>, AppError> {
    let report = state
        .scheduling
        .generate_recurring(request)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "report": report,
    })))
}

// ==============================================================================
// CONFLICT HANDLERS
// ==============================================================================

/// Dry-run detection: the candidate is checked but never written. Found
/// conflicts are registered so they can be fed into suggest/apply.
#[axum::debug_handler]
pub async fn check_conflicts(
    State(state): State<Arc<ScheduleState>>,
    Json(request): Json<CreateSlotRequest>,
) -> Result<Json<Value>, AppError> {
    let conflicts = state
        .scheduling
        .check_conflicts(request)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "has_conflicts": !conflicts.is_empty(),
        "conflicts": conflicts,
    })))
}

#[axum::debug_handler]
pub async fn suggest_resolutions(
    State(state): State<Arc<ScheduleState>>,
    Query(query): Query<SuggestQuery>,
) -> Result<Json<Value>, AppError> {
    let suggestions = state
        .resolver
        .suggest(query.conflict_id)
        .await
        .map_err(|e| match e {
            SlotError::NotFound => {
                AppError::Gone("conflict is unknown or already resolved".to_string())
            }
            other => map_slot_error(other),
        })?;

    Ok(Json(json!({
        "success": true,
        "suggestions": suggestions,
    })))
}

#[axum::debug_handler]
pub async fn validate_resolution(
    State(state): State<Arc<ScheduleState>>,
    Json(request): Json<ApplyResolutionRequest>,
) -> Result<Json<Value>, AppError> {
    let validation = state
        .resolver
        .validate(request.conflict_id, &request.resolution)
        .await
        .map_err(|e| match e {
            SlotError::NotFound => {
                AppError::Gone("conflict is unknown or already resolved".to_string())
            }
            other => map_slot_error(other),
        })?;

    Ok(Json(json!({
        "success": true,
        "validation": validation,
    })))
}

#[axum::debug_handler]
pub async fn apply_resolution(
    State(state): State<Arc<ScheduleState>>,
    Json(request): Json<ApplyResolutionRequest>,
) -> Result<Json<Value>, AppError> {
    let outcome = state
        .resolver
        .apply(request.conflict_id, &request.resolution)
        .await
        .map_err(|e| match e {
            SlotError::NotFound => {
                AppError::Gone("conflict is unknown or already resolved".to_string())
            }
            other => map_slot_error(other),
        })?;

    Ok(Json(json!({
        "success": true,
        "outcome": outcome,
        "message": "Resolution applied"
    })))
}

// ==============================================================================
// STATS HANDLER
// ==============================================================================

#[axum::debug_handler]
pub async fn get_stats(
    State(state): State<Arc<ScheduleState>>,
    Query(query): Query<SlotListQuery>,
) -> Result<Json<Value>, AppError> {
    let filter: SlotFilter = query.into();
    let stats = state.stats.schedule_stats(&filter).await;

    Ok(Json(json!({
        "success": true,
        "stats": stats,
    })))
}
