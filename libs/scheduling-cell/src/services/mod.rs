// libs/scheduling-cell/src/services/mod.rs
pub mod conflict;
pub mod pricing;
pub mod recurrence;
pub mod reservation;
pub mod resolution;
pub mod scheduling;
pub mod stats;

pub use conflict::ConflictDetector;
pub use recurrence::RecurrenceExpansion;
pub use reservation::ReservationService;
pub use resolution::{ConflictResolver, SuggestionScorer};
pub use scheduling::SchedulingService;
pub use stats::StatsService;
