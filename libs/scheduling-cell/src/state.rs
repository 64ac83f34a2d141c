// libs/scheduling-cell/src/state.rs
use chrono::NaiveTime;
use directory_cell::DirectoryService;
use shared_config::AppConfig;
use std::sync::Arc;
use tracing::warn;

use crate::clock::Clock;
use crate::models::SchedulingRules;
use crate::repository::{InMemorySlotRepository, SlotRepository};
use crate::services::conflict::ConflictDetector;
use crate::services::resolution::{ConflictRegistry, ConflictResolver};
use crate::services::reservation::ReservationService;
use crate::services::scheduling::SchedulingService;
use crate::services::stats::StatsService;

/// Wired service graph handed to the router as axum state.
pub struct ScheduleState {
    pub scheduling: Arc<SchedulingService>,
    pub reservations: Arc<ReservationService>,
    pub resolver: Arc<ConflictResolver>,
    pub conflicts: Arc<ConflictRegistry>,
    pub stats: Arc<StatsService>,
    pub directory: Arc<DirectoryService>,
}

impl ScheduleState {
    pub fn new(config: &AppConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let rules = rules_from_config(config);
        let repository: Arc<dyn SlotRepository> =
            Arc::new(InMemorySlotRepository::new(clock.clone()));
        let detector = Arc::new(ConflictDetector::new(rules));
        let directory = DirectoryService::new();
        let registry = Arc::new(ConflictRegistry::new(clock.clone()));

        Arc::new(Self {
            scheduling: Arc::new(SchedulingService::new(
                repository.clone(),
                detector.clone(),
                directory.clone(),
                registry.clone(),
            )),
            reservations: Arc::new(ReservationService::new(
                repository.clone(),
                clock,
                config.default_hold_minutes,
            )),
            resolver: Arc::new(ConflictResolver::new(
                repository.clone(),
                detector,
                directory.clone(),
                registry.clone(),
            )),
            conflicts: registry,
            stats: Arc::new(StatsService::new(repository)),
            directory,
        })
    }
}

fn rules_from_config(config: &AppConfig) -> SchedulingRules {
    let mut rules = SchedulingRules {
        min_slot_duration_minutes: config.min_slot_duration_minutes,
        default_hold_minutes: config.default_hold_minutes,
        ..SchedulingRules::default()
    };
    match parse_time(&config.working_hours_open) {
        Some(open) => rules.working_hours_open = open,
        None => warn!(
            "Unparseable working_hours_open '{}', keeping {}",
            config.working_hours_open, rules.working_hours_open
        ),
    }
    match parse_time(&config.working_hours_close) {
        Some(close) => rules.working_hours_close = close,
        None => warn!(
            "Unparseable working_hours_close '{}', keeping {}",
            config.working_hours_close, rules.working_hours_close
        ),
    }
    rules
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hours_fall_back_to_defaults_when_unparseable() {
        let config = AppConfig {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
            default_hold_minutes: 10,
            sweep_interval_seconds: 30,
            conflict_ttl_minutes: 120,
            working_hours_open: "not a time".to_string(),
            working_hours_close: "21:30".to_string(),
            min_slot_duration_minutes: 20,
        };
        let rules = rules_from_config(&config);
        assert_eq!(rules.working_hours_open, SchedulingRules::default().working_hours_open);
        assert_eq!(rules.working_hours_close, NaiveTime::from_hms_opt(21, 30, 0).unwrap());
        assert_eq!(rules.min_slot_duration_minutes, 20);
        assert_eq!(rules.default_hold_minutes, 10);
    }
}
