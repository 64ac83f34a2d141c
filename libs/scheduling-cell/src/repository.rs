// libs/scheduling-cell/src/repository.rs
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{
    Conflict, ConflictKind, Page, Severity, SlotError, SlotFilter, SlotPatch, SlotState, SortDirection,
    SortKey, TimeSlot,
};
use crate::services::pricing;

/// Port over the canonical slot collection. All invariants of the slot
/// data model are enforced behind this trait: capacity bounds, the state
/// machine, version discipline, and the reserved_until / state coupling.
#[async_trait]
pub trait SlotRepository: Send + Sync {
    async fn create(&self, slot: TimeSlot) -> Result<TimeSlot, SlotError>;
    async fn get(&self, id: Uuid) -> Result<TimeSlot, SlotError>;
    /// Optimistic-concurrency update: the write only lands when
    /// `expected_version` matches the stored version, and the version then
    /// advances by exactly 1.
    async fn update(
        &self,
        id: Uuid,
        expected_version: u64,
        patch: SlotPatch,
    ) -> Result<TimeSlot, SlotError>;
    async fn delete(&self, id: Uuid) -> Result<(), SlotError>;
    async fn list(&self, filter: &SlotFilter) -> Page<TimeSlot>;
    async fn list_for_dentist_date(&self, dentist_id: Uuid, date: NaiveDate) -> Vec<TimeSlot>;
    async fn list_for_clinic_date(&self, clinic_id: Uuid, date: NaiveDate) -> Vec<TimeSlot>;
    async fn all(&self) -> Vec<TimeSlot>;

    /// Acquire a hold: only legal on an Available slot with free capacity.
    /// A slot can be held by at most one reservation at a time; a second
    /// attempt fails fast with a conflict rather than queuing.
    async fn reserve(&self, id: Uuid, until: DateTime<Utc>) -> Result<TimeSlot, SlotError>;
    /// Confirm a hold into a booking; after `reserved_until` this fails
    /// with `Expired` and reverts the slot to Available.
    async fn confirm_reservation(&self, id: Uuid, now: DateTime<Utc>) -> Result<TimeSlot, SlotError>;
    /// Idempotent: releasing a slot that holds no reservation is `Ok`.
    async fn release_reservation(&self, id: Uuid) -> Result<TimeSlot, SlotError>;
    /// Idempotent booking cancellation; the last cancellation returns an
    /// Occupied slot to Available.
    async fn cancel_booking(&self, id: Uuid) -> Result<TimeSlot, SlotError>;
    async fn record_no_show(&self, id: Uuid) -> Result<TimeSlot, SlotError>;

    /// Revert every `Reserved` slot whose hold lapsed before `now`.
    /// Safe to run from any instance at any time; the check is derived
    /// from slot data alone.
    async fn sweep_expired_reservations(&self, now: DateTime<Utc>) -> Vec<Uuid>;
}

pub struct InMemorySlotRepository {
    slots: RwLock<HashMap<Uuid, TimeSlot>>,
    clock: Arc<dyn Clock>,
}

impl InMemorySlotRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn validate(slot: &TimeSlot) -> Result<(), SlotError> {
        if slot.end_time <= slot.start_time {
            return Err(SlotError::Validation(
                "end_time must be after start_time".to_string(),
            ));
        }
        let minutes = (slot.end_time - slot.start_time).num_minutes();
        if slot.duration_minutes != minutes {
            return Err(SlotError::Validation(format!(
                "duration_minutes {} does not match interval length {}",
                slot.duration_minutes, minutes
            )));
        }
        if slot.capacity_max == 0 {
            return Err(SlotError::Validation(
                "capacity_max must be at least 1".to_string(),
            ));
        }
        if slot.current_bookings > slot.capacity_max {
            return Err(SlotError::Validation(
                "current_bookings exceeds capacity_max".to_string(),
            ));
        }
        if slot.base_price < 0.0 {
            return Err(SlotError::Validation(
                "base_price must not be negative".to_string(),
            ));
        }
        if !(0.0..=10.0).contains(&slot.demand_score) {
            return Err(SlotError::Validation(
                "demand_score must be within 0..=10".to_string(),
            ));
        }
        if slot.reserved_until.is_some() && slot.state != SlotState::Reserved {
            return Err(SlotError::Validation(
                "reserved_until is only valid while the slot is reserved".to_string(),
            ));
        }
        Ok(())
    }

    /// Bump version and stamp updated_at; every successful mutation goes
    /// through here exactly once.
    fn touch(&self, slot: &mut TimeSlot) {
        slot.version += 1;
        slot.updated_at = self.clock.now();
    }

    fn transition(slot: &mut TimeSlot, next: SlotState) -> Result<(), SlotError> {
        if !slot.state.can_transition_to(next) {
            return Err(SlotError::InvalidStateTransition {
                from: slot.state,
                to: next,
            });
        }
        if next == SlotState::Cancelled && slot.current_bookings > 0 {
            return Err(SlotError::DeletionBlocked);
        }
        if next == SlotState::Blocked && slot.current_bookings > 0 {
            return Err(SlotError::Validation(
                "cannot block a slot with active bookings".to_string(),
            ));
        }
        if slot.state == SlotState::Reserved && next != SlotState::Reserved {
            slot.reserved_until = None;
        }
        slot.state = next;
        Ok(())
    }

    fn hold_conflict(slot: &TimeSlot) -> SlotError {
        let mut conflict = Conflict::new(
            ConflictKind::ResourceConflict,
            Severity::High,
            format!("slot is {} and cannot be held", slot.state),
        );
        conflict.affected_slots.push(slot.id);
        SlotError::ConflictDetected(vec![conflict])
    }
}

#[async_trait]
impl SlotRepository for InMemorySlotRepository {
    async fn create(&self, mut slot: TimeSlot) -> Result<TimeSlot, SlotError> {
        Self::validate(&slot)?;
        slot.version = 1;
        let now = self.clock.now();
        slot.created_at = now;
        slot.updated_at = now;

        let mut slots = self.slots.write().await;
        if slots.contains_key(&slot.id) {
            return Err(SlotError::Validation(format!(
                "slot {} already exists",
                slot.id
            )));
        }
        debug!(
            "Creating slot {} for dentist {} on {} {}-{}",
            slot.id, slot.dentist_id, slot.date, slot.start_time, slot.end_time
        );
        slots.insert(slot.id, slot.clone());
        Ok(slot)
    }

    async fn get(&self, id: Uuid) -> Result<TimeSlot, SlotError> {
        self.slots
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SlotError::NotFound)
    }

    async fn update(
        &self,
        id: Uuid,
        expected_version: u64,
        patch: SlotPatch,
    ) -> Result<TimeSlot, SlotError> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(&id).ok_or(SlotError::NotFound)?;

        if slot.version != expected_version {
            return Err(SlotError::ConcurrencyConflict {
                expected: expected_version,
                actual: slot.version,
            });
        }

        let mut updated = slot.clone();

        if let Some(start) = patch.start_time {
            updated.start_time = start;
        }
        if let Some(end) = patch.end_time {
            updated.end_time = end;
        }
        updated.duration_minutes = (updated.end_time - updated.start_time).num_minutes();

        if let Some(clinic_id) = patch.clinic_id {
            updated.clinic_id = clinic_id;
        }
        if let Some(capacity) = patch.capacity_max {
            if capacity < updated.current_bookings {
                return Err(SlotError::Validation(format!(
                    "capacity_max {} is below current bookings {}",
                    capacity, updated.current_bookings
                )));
            }
            updated.capacity_max = capacity;
        }
        if let Some(appointment_type) = patch.appointment_type {
            updated.appointment_type = appointment_type;
        }
        if let Some(priority) = patch.priority {
            updated.priority = priority;
        }
        if let Some(services) = patch.allowed_services {
            updated.allowed_services = services;
        }
        if let Some(price) = patch.base_price {
            updated.base_price = price;
        }
        if let Some(state) = patch.state {
            if state == SlotState::Reserved {
                // Holds carry an expiry; they are acquired through reserve().
                return Err(SlotError::Validation(
                    "reservations are acquired through the reserve operation".to_string(),
                ));
            }
            Self::transition(&mut updated, state)?;
        }

        Self::validate(&updated)?;
        self.touch(&mut updated);
        *slot = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> Result<(), SlotError> {
        let mut slots = self.slots.write().await;
        let slot = slots.get(&id).ok_or(SlotError::NotFound)?;
        if slot.current_bookings > 0 {
            warn!(
                "Refusing to delete slot {} with {} active bookings",
                id, slot.current_bookings
            );
            return Err(SlotError::DeletionBlocked);
        }
        slots.remove(&id);
        info!("Deleted slot {}", id);
        Ok(())
    }

    async fn list(&self, filter: &SlotFilter) -> Page<TimeSlot> {
        let slots = self.slots.read().await;
        let mut matched: Vec<TimeSlot> = slots
            .values()
            .filter(|slot| matches_filter(slot, filter))
            .cloned()
            .collect();

        sort_slots(&mut matched, filter);

        let total = matched.len();
        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(total.max(1));
        let items: Vec<TimeSlot> = matched.into_iter().skip(offset).take(limit).collect();

        Page {
            items,
            total,
            limit,
            offset,
        }
    }

    async fn list_for_dentist_date(&self, dentist_id: Uuid, date: NaiveDate) -> Vec<TimeSlot> {
        let slots = self.slots.read().await;
        let mut result: Vec<TimeSlot> = slots
            .values()
            .filter(|s| s.dentist_id == dentist_id && s.date == date)
            .cloned()
            .collect();
        result.sort_by_key(|s| s.start_time);
        result
    }

    async fn list_for_clinic_date(&self, clinic_id: Uuid, date: NaiveDate) -> Vec<TimeSlot> {
        let slots = self.slots.read().await;
        let mut result: Vec<TimeSlot> = slots
            .values()
            .filter(|s| s.clinic_id == clinic_id && s.date == date)
            .cloned()
            .collect();
        result.sort_by_key(|s| s.start_time);
        result
    }

    async fn all(&self) -> Vec<TimeSlot> {
        self.slots.read().await.values().cloned().collect()
    }

    async fn reserve(&self, id: Uuid, until: DateTime<Utc>) -> Result<TimeSlot, SlotError> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(&id).ok_or(SlotError::NotFound)?;

        if slot.state != SlotState::Available {
            return Err(Self::hold_conflict(slot));
        }
        if !slot.has_free_capacity() {
            return Err(Self::hold_conflict(slot));
        }

        let mut updated = slot.clone();
        updated.state = SlotState::Reserved;
        updated.reserved_until = Some(until);
        self.touch(&mut updated);
        *slot = updated.clone();
        debug!("Reserved slot {} until {}", id, until);
        Ok(updated)
    }

    async fn confirm_reservation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TimeSlot, SlotError> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(&id).ok_or(SlotError::NotFound)?;

        if slot.state != SlotState::Reserved {
            // Already swept or never held; the hold is gone either way.
            return Err(SlotError::Expired);
        }
        match slot.reserved_until {
            Some(until) if until >= now => {}
            _ => {
                // Lapsed but not yet swept: revert right here, then report.
                let mut reverted = slot.clone();
                reverted.state = SlotState::Available;
                reverted.reserved_until = None;
                self.touch(&mut reverted);
                *slot = reverted;
                return Err(SlotError::Expired);
            }
        }

        let mut updated = slot.clone();
        updated.state = SlotState::Occupied;
        updated.reserved_until = None;
        updated.current_bookings += 1;
        updated.times_booked += 1;
        updated.demand_score =
            pricing::demand_score_from_history(updated.times_booked, updated.times_no_show);
        self.touch(&mut updated);
        *slot = updated.clone();
        info!("Confirmed reservation on slot {}", id);
        Ok(updated)
    }

    async fn release_reservation(&self, id: Uuid) -> Result<TimeSlot, SlotError> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(&id).ok_or(SlotError::NotFound)?;

        if slot.state != SlotState::Reserved {
            // Idempotent: nothing held, nothing to release.
            return Ok(slot.clone());
        }

        let mut updated = slot.clone();
        updated.state = SlotState::Available;
        updated.reserved_until = None;
        self.touch(&mut updated);
        *slot = updated.clone();
        debug!("Released reservation on slot {}", id);
        Ok(updated)
    }

    async fn cancel_booking(&self, id: Uuid) -> Result<TimeSlot, SlotError> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(&id).ok_or(SlotError::NotFound)?;

        if slot.current_bookings == 0 {
            // Idempotent: retried cancellations on an empty slot are Ok.
            return Ok(slot.clone());
        }

        let mut updated = slot.clone();
        updated.current_bookings -= 1;
        if updated.current_bookings == 0 && updated.state == SlotState::Occupied {
            updated.state = SlotState::Available;
        }
        self.touch(&mut updated);
        *slot = updated.clone();
        Ok(updated)
    }

    async fn record_no_show(&self, id: Uuid) -> Result<TimeSlot, SlotError> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(&id).ok_or(SlotError::NotFound)?;

        let mut updated = slot.clone();
        updated.times_no_show += 1;
        if updated.current_bookings > 0 {
            updated.current_bookings -= 1;
            if updated.current_bookings == 0 && updated.state == SlotState::Occupied {
                updated.state = SlotState::Available;
            }
        }
        updated.demand_score =
            pricing::demand_score_from_history(updated.times_booked, updated.times_no_show);
        self.touch(&mut updated);
        *slot = updated.clone();
        Ok(updated)
    }

    async fn sweep_expired_reservations(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut slots = self.slots.write().await;
        let mut reverted = Vec::new();

        for slot in slots.values_mut() {
            if slot.state != SlotState::Reserved {
                continue;
            }
            let lapsed = match slot.reserved_until {
                Some(until) => until < now,
                // Reserved without an expiry should not exist; recover it.
                None => true,
            };
            if lapsed {
                let mut updated = slot.clone();
                updated.state = SlotState::Available;
                updated.reserved_until = None;
                self.touch(&mut updated);
                *slot = updated;
                reverted.push(slot.id);
            }
        }

        if !reverted.is_empty() {
            info!("Swept {} expired reservation holds", reverted.len());
        }
        reverted
    }
}

fn matches_filter(slot: &TimeSlot, filter: &SlotFilter) -> bool {
    if let Some(from) = filter.date_from {
        if slot.date < from {
            return false;
        }
    }
    if let Some(to) = filter.date_to {
        if slot.date > to {
            return false;
        }
    }
    if let Some(ref dentists) = filter.dentist_ids {
        if !dentists.contains(&slot.dentist_id) {
            return false;
        }
    }
    if let Some(ref clinics) = filter.clinic_ids {
        if !clinics.contains(&slot.clinic_id) {
            return false;
        }
    }
    if let Some(ref states) = filter.states {
        if !states.contains(&slot.state) {
            return false;
        }
    }
    if let Some(ref types) = filter.appointment_types {
        if !types.contains(&slot.appointment_type) {
            return false;
        }
    }
    if let Some(min) = filter.min_duration_minutes {
        if slot.duration_minutes < min {
            return false;
        }
    }
    if let Some(max) = filter.max_duration_minutes {
        if slot.duration_minutes > max {
            return false;
        }
    }
    if let Some(time_from) = filter.time_from {
        if slot.start_time < time_from {
            return false;
        }
    }
    if let Some(time_to) = filter.time_to {
        if slot.start_time > time_to {
            return false;
        }
    }
    if let Some(free) = filter.has_free_capacity {
        if slot.has_free_capacity() != free {
            return false;
        }
    }
    if let Some(true) = filter.recurring_only {
        if !slot.is_recurring {
            return false;
        }
    }
    true
}

fn sort_slots(slots: &mut [TimeSlot], filter: &SlotFilter) {
    let direction = filter.sort_direction.unwrap_or(SortDirection::Asc);
    let key = filter.sort_key.unwrap_or(SortKey::Date);

    slots.sort_by(|a, b| {
        let ordering = match key {
            SortKey::Date => a
                .date
                .cmp(&b.date)
                .then(a.start_time.cmp(&b.start_time)),
            SortKey::StartTime => a
                .start_time
                .cmp(&b.start_time)
                .then(a.date.cmp(&b.date)),
            SortKey::Price => {
                let a_price = pricing::final_price(a);
                let b_price = pricing::final_price(b);
                a_price
                    .partial_cmp(&b_price)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }
            SortKey::DemandScore => a
                .demand_score
                .partial_cmp(&b.demand_score)
                .unwrap_or(std::cmp::Ordering::Equal),
            SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        };
        match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });
}
