// libs/scheduling-cell/src/services/pricing.rs
//
// Demand-based pricing. Every factor is recomputed from the slot on each
// read so a booking-count change is reflected immediately; nothing here
// is cached or stored.
use chrono::NaiveTime;

use crate::models::TimeSlot;

/// `0.8..=1.2`, linear in the 0-10 demand score.
pub fn demand_factor(demand_score: f64) -> f64 {
    let score = demand_score.clamp(0.0, 10.0);
    0.8 + (score / 10.0) * 0.4
}

/// Peak morning and late-afternoon starts are surcharged, midday is
/// neutral, everything else is discounted.
pub fn time_factor(start_time: NaiveTime) -> f64 {
    let peak_morning = band(8, 10);
    let peak_evening = band(16, 18);
    let midday = band(11, 15);

    if in_band(start_time, peak_morning) || in_band(start_time, peak_evening) {
        1.1
    } else if in_band(start_time, midday) {
        1.0
    } else {
        0.9
    }
}

pub fn capacity_factor(utilization: f64) -> f64 {
    if utilization >= 0.8 {
        1.2
    } else if utilization >= 0.5 {
        1.0
    } else {
        0.9
    }
}

/// `base_price x demand x time x capacity`, rounded to cents.
pub fn final_price(slot: &TimeSlot) -> f64 {
    let price = slot.base_price
        * demand_factor(slot.demand_score)
        * time_factor(slot.start_time)
        * capacity_factor(slot.utilization());
    (price * 100.0).round() / 100.0
}

/// Running 0-10 demand indicator derived from the history counters.
/// Volume saturates at 10 bookings; no-shows scale it down by the
/// attendance rate.
pub fn demand_score_from_history(times_booked: u32, times_no_show: u32) -> f64 {
    if times_booked == 0 {
        return 0.0;
    }
    let volume = f64::from(times_booked.min(10)) / 10.0;
    let attended = times_booked.saturating_sub(times_no_show);
    let attendance = f64::from(attended) / f64::from(times_booked);
    (volume * attendance * 10.0).clamp(0.0, 10.0)
}

fn band(from_hour: u32, to_hour: u32) -> (NaiveTime, NaiveTime) {
    (
        NaiveTime::from_hms_opt(from_hour, 0, 0).unwrap_or_default(),
        NaiveTime::from_hms_opt(to_hour, 0, 0).unwrap_or_default(),
    )
}

// Inclusive on both ends: a slot starting exactly at 10:00 still counts
// as peak morning.
fn in_band(time: NaiveTime, (from, to): (NaiveTime, NaiveTime)) -> bool {
    time >= from && time <= to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppointmentType, SlotState};
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn priced_slot(start: NaiveTime, demand: f64, bookings: u32, capacity: u32) -> TimeSlot {
        TimeSlot {
            id: Uuid::new_v4(),
            version: 1,
            dentist_id: Uuid::new_v4(),
            clinic_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            start_time: start,
            end_time: start + chrono::Duration::minutes(60),
            duration_minutes: 60,
            capacity_max: capacity,
            current_bookings: bookings,
            state: SlotState::Available,
            appointment_type: AppointmentType::Checkup,
            priority: Default::default(),
            allowed_services: Default::default(),
            is_recurring: false,
            recurrence_group_id: None,
            base_price: 100.0,
            times_booked: 0,
            times_no_show: 0,
            demand_score: demand,
            reserved_until: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: "tests".to_string(),
        }
    }

    #[test]
    fn hundred_euro_morning_slot_prices_at_ninety_nine() {
        // base 100, 09:00 start (1.1), demand 5 (1.0), empty 1-seat slot (0.9)
        let slot = priced_slot(NaiveTime::from_hms_opt(9, 0, 0).unwrap(), 5.0, 0, 1);
        assert_eq!(final_price(&slot), 99.0);
    }

    #[test]
    fn demand_factor_spans_expected_range() {
        assert_eq!(demand_factor(0.0), 0.8);
        assert_eq!(demand_factor(5.0), 1.0);
        assert_eq!(demand_factor(10.0), 1.2);
        // Out-of-range scores are clamped, not extrapolated.
        assert_eq!(demand_factor(15.0), 1.2);
    }

    #[test]
    fn time_factor_bands() {
        assert_eq!(time_factor(NaiveTime::from_hms_opt(8, 0, 0).unwrap()), 1.1);
        assert_eq!(time_factor(NaiveTime::from_hms_opt(17, 30, 0).unwrap()), 1.1);
        assert_eq!(time_factor(NaiveTime::from_hms_opt(12, 0, 0).unwrap()), 1.0);
        assert_eq!(time_factor(NaiveTime::from_hms_opt(20, 0, 0).unwrap()), 0.9);
        assert_eq!(time_factor(NaiveTime::from_hms_opt(10, 30, 0).unwrap()), 0.9);
    }

    #[test]
    fn capacity_factor_follows_utilization() {
        let full = priced_slot(NaiveTime::from_hms_opt(12, 0, 0).unwrap(), 5.0, 4, 5);
        assert_eq!(capacity_factor(full.utilization()), 1.2);
        let half = priced_slot(NaiveTime::from_hms_opt(12, 0, 0).unwrap(), 5.0, 2, 4);
        assert_eq!(capacity_factor(half.utilization()), 1.0);
        let empty = priced_slot(NaiveTime::from_hms_opt(12, 0, 0).unwrap(), 5.0, 0, 4);
        assert_eq!(capacity_factor(empty.utilization()), 0.9);
    }

    #[test]
    fn demand_score_rewards_attended_bookings() {
        assert_eq!(demand_score_from_history(0, 0), 0.0);
        assert_eq!(demand_score_from_history(10, 0), 10.0);
        assert_eq!(demand_score_from_history(5, 1), 4.0);
        // No-shows can never push the score negative.
        assert_eq!(demand_score_from_history(2, 5), 0.0);
    }
}
