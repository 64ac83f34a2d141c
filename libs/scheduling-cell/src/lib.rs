pub mod clock;
pub mod handlers;
pub mod models;
pub mod repository;
pub mod router;
pub mod services;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use models::*;
pub use repository::{InMemorySlotRepository, SlotRepository};
pub use state::ScheduleState;
