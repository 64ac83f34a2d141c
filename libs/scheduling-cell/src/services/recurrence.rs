// libs/scheduling-cell/src/services/recurrence.rs
use chrono::{Duration, NaiveDate};
use uuid::Uuid;

use crate::models::{
    RecurrenceKind, RecurrencePattern, RecurringSlotTemplate, SlotError, SlotState, TimeSlot,
};

/// Initial demand score for a slot with no history; the neutral middle of
/// the 0-10 band (demand factor 1.0).
pub const INITIAL_DEMAND_SCORE: f64 = 5.0;

/// Lazy walk over `start_date..=end_date`, yielding the dates that
/// qualify under the pattern. Finite by construction: the iterator stops
/// at `end_date` no matter what the pattern says.
pub struct RecurrenceExpansion<'a> {
    pattern: &'a RecurrencePattern,
    cursor: NaiveDate,
}

impl<'a> RecurrenceExpansion<'a> {
    pub fn new(pattern: &'a RecurrencePattern) -> Self {
        Self {
            pattern,
            cursor: pattern.start_date,
        }
    }
}

impl Iterator for RecurrenceExpansion<'_> {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        while self.cursor <= self.pattern.end_date {
            let date = self.cursor;
            self.cursor += Duration::days(1);
            if self.pattern.matches(date) {
                return Some(date);
            }
        }
        None
    }
}

pub fn validate_pattern(pattern: &RecurrencePattern) -> Result<(), SlotError> {
    if pattern.frequency == 0 {
        return Err(SlotError::Validation(
            "recurrence frequency must be at least 1".to_string(),
        ));
    }
    if pattern.end_date < pattern.start_date {
        return Err(SlotError::Validation(
            "recurrence end_date precedes start_date".to_string(),
        ));
    }
    if pattern.kind == RecurrenceKind::Weekly
        && pattern
            .days_of_week
            .as_ref()
            .map(|days| days.is_empty())
            .unwrap_or(true)
    {
        return Err(SlotError::Validation(
            "weekly recurrence requires at least one day of week".to_string(),
        ));
    }
    Ok(())
}

/// One candidate slot for a qualifying day; every instance of a run
/// carries the same `group_id`. Timestamps and version are assigned by
/// the repository on create.
pub fn instantiate(
    template: &RecurringSlotTemplate,
    date: NaiveDate,
    group_id: Uuid,
) -> TimeSlot {
    TimeSlot {
        id: Uuid::new_v4(),
        version: 0,
        dentist_id: template.dentist_id,
        clinic_id: template.clinic_id,
        date,
        start_time: template.start_time,
        end_time: template.end_time,
        duration_minutes: (template.end_time - template.start_time).num_minutes(),
        capacity_max: template.capacity_max,
        current_bookings: 0,
        state: SlotState::Available,
        appointment_type: template.appointment_type.clone(),
        priority: template.priority,
        allowed_services: template.allowed_services.clone(),
        is_recurring: true,
        recurrence_group_id: Some(group_id),
        base_price: template.base_price,
        times_booked: 0,
        times_no_show: 0,
        demand_score: INITIAL_DEMAND_SCORE,
        reserved_until: None,
        created_at: chrono::DateTime::<chrono::Utc>::MIN_UTC,
        updated_at: chrono::DateTime::<chrono::Utc>::MIN_UTC,
        created_by: template.created_by.clone(),
    }
}
