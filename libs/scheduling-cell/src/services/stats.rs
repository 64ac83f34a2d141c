// libs/scheduling-cell/src/services/stats.rs
use chrono::Timelike;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{DentistEfficiency, ScheduleStats, SlotFilter};
use crate::repository::SlotRepository;
use crate::services::pricing;

/// Read-side aggregation over the current slot collection; computed on
/// demand, never cached and never mutating.
pub struct StatsService {
    repository: Arc<dyn SlotRepository>,
}

impl StatsService {
    pub fn new(repository: Arc<dyn SlotRepository>) -> Self {
        Self { repository }
    }

    pub async fn schedule_stats(&self, filter: &SlotFilter) -> ScheduleStats {
        // Aggregates cover the whole matched set; pagination belongs to
        // listing, not to statistics.
        let filter = SlotFilter {
            limit: None,
            offset: None,
            ..filter.clone()
        };
        let slots = self.repository.list(&filter).await.items;

        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        let mut hourly_distribution: BTreeMap<u32, u32> = BTreeMap::new();
        let mut total_bookings: u64 = 0;
        let mut total_capacity: u64 = 0;
        let mut times_booked: u64 = 0;
        let mut times_no_show: u64 = 0;
        let mut potential_revenue = 0.0;
        let mut realized_revenue = 0.0;
        let mut per_dentist: BTreeMap<Uuid, (usize, u64, u64, u64, u64)> = BTreeMap::new();

        for slot in &slots {
            *by_state.entry(slot.state.to_string()).or_insert(0) += 1;
            if slot.current_bookings > 0 {
                *hourly_distribution
                    .entry(slot.start_time.hour())
                    .or_insert(0) += slot.current_bookings;
            }

            total_bookings += u64::from(slot.current_bookings);
            total_capacity += u64::from(slot.capacity_max);
            times_booked += u64::from(slot.times_booked);
            times_no_show += u64::from(slot.times_no_show);

            let price = pricing::final_price(slot);
            potential_revenue += price * f64::from(slot.capacity_max);
            realized_revenue += price * f64::from(slot.current_bookings);

            let row = per_dentist
                .entry(slot.dentist_id)
                .or_insert((0, 0, 0, 0, 0));
            row.0 += 1;
            row.1 += u64::from(slot.current_bookings);
            row.2 += u64::from(slot.capacity_max);
            row.3 += u64::from(slot.times_booked);
            row.4 += u64::from(slot.times_no_show);
        }

        let per_dentist = per_dentist
            .into_iter()
            .map(
                |(dentist_id, (total, bookings, capacity, booked, no_show))| DentistEfficiency {
                    dentist_id,
                    total_slots: total,
                    utilization_rate: ratio(bookings, capacity),
                    no_show_rate: ratio(no_show, booked),
                },
            )
            .collect();

        ScheduleStats {
            total_slots: slots.len(),
            by_state,
            utilization_rate: ratio(total_bookings, total_capacity),
            no_show_rate: ratio(times_no_show, times_booked),
            hourly_distribution,
            per_dentist,
            potential_revenue: round_cents(potential_revenue),
            realized_revenue: round_cents(realized_revenue),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
