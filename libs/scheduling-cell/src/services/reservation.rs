// libs/scheduling-cell/src/services/reservation.rs
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{Reservation, SlotError, TimeSlot};
use crate::repository::SlotRepository;
use crate::services::resolution::ConflictRegistry;

/// Short-lived holds on slots pending confirmation.
///
/// The slot's `reserved_until` field is the durable source of truth for
/// expiry. The reservation registry here only maps reservation ids to
/// slot ids for the confirm/release surface; losing it (process restart)
/// loses nothing a sweep over the slots cannot recover, because any
/// instance can revert `reserved` slots whose `reserved_until` lies in
/// the past.
pub struct ReservationService {
    repository: Arc<dyn SlotRepository>,
    clock: Arc<dyn Clock>,
    registry: RwLock<HashMap<Uuid, Reservation>>,
    default_hold: Duration,
}

impl ReservationService {
    pub fn new(
        repository: Arc<dyn SlotRepository>,
        clock: Arc<dyn Clock>,
        default_hold_minutes: i64,
    ) -> Self {
        Self {
            repository,
            clock,
            registry: RwLock::new(HashMap::new()),
            default_hold: Duration::minutes(default_hold_minutes.max(1)),
        }
    }

    /// Acquire an exclusive hold on a slot. Fails fast with a conflict if
    /// the slot is not available; no queueing, no internal retry.
    pub async fn reserve(
        &self,
        slot_id: Uuid,
        hold_minutes: Option<i64>,
    ) -> Result<Reservation, SlotError> {
        let hold = match hold_minutes {
            Some(minutes) if minutes <= 0 => {
                return Err(SlotError::Validation(
                    "hold_minutes must be positive".to_string(),
                ));
            }
            Some(minutes) => Duration::minutes(minutes),
            None => self.default_hold,
        };

        let now = self.clock.now();
        let expires_at = now + hold;
        let slot = self.repository.reserve(slot_id, expires_at).await?;

        let reservation = Reservation {
            id: Uuid::new_v4(),
            slot_id: slot.id,
            expires_at,
            created_at: now,
        };
        self.registry
            .write()
            .await
            .insert(reservation.id, reservation.clone());
        info!(
            "Reservation {} holds slot {} until {}",
            reservation.id, slot_id, expires_at
        );
        Ok(reservation)
    }

    /// Turn a hold into a booking. After `expires_at` this fails with
    /// `Expired` and the slot is already (or will be) reverted.
    pub async fn confirm(&self, reservation_id: Uuid) -> Result<TimeSlot, SlotError> {
        let reservation = self
            .registry
            .read()
            .await
            .get(&reservation_id)
            .cloned()
            .ok_or(SlotError::ReservationNotFound)?;

        let result = self
            .repository
            .confirm_reservation(reservation.slot_id, self.clock.now())
            .await;

        // The hold is finished either way; only a transient repository
        // error leaves the entry for a retry.
        match &result {
            Ok(_) | Err(SlotError::Expired) => {
                self.registry.write().await.remove(&reservation_id);
            }
            Err(_) => {}
        }
        result
    }

    /// Idempotent: releasing an unknown or already-settled reservation is
    /// `Ok`, so unreliable callers can retry freely.
    pub async fn release(&self, reservation_id: Uuid) -> Result<(), SlotError> {
        let reservation = self.registry.write().await.remove(&reservation_id);
        let Some(reservation) = reservation else {
            debug!("Release of unknown reservation {} is a no-op", reservation_id);
            return Ok(());
        };
        self.repository
            .release_reservation(reservation.slot_id)
            .await?;
        info!("Released reservation {}", reservation_id);
        Ok(())
    }

    /// One sweep pass: revert every lapsed hold and drop the matching
    /// registry entries. Idempotent and safe to run concurrently with
    /// confirm — a confirm that already landed leaves nothing to sweep.
    pub async fn sweep_expired(&self) -> Vec<Uuid> {
        let now = self.clock.now();
        let swept = self.repository.sweep_expired_reservations(now).await;

        let mut registry = self.registry.write().await;
        registry.retain(|_, r| r.expires_at >= now && !swept.contains(&r.slot_id));
        swept
    }
}

/// Background expiry loop. Runs until the task is aborted; each tick is a
/// full sweep so a missed tick only delays reverts, never loses them.
/// The same tick ages abandoned entries out of the conflict registry.
pub async fn run_expiry_sweeper(
    reservations: Arc<ReservationService>,
    conflicts: Arc<ConflictRegistry>,
    conflict_ttl_minutes: i64,
    interval_seconds: u64,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let ttl = Duration::minutes(conflict_ttl_minutes.max(1));
    info!("Expiry sweeper running every {}s", interval_seconds);

    loop {
        ticker.tick().await;
        let swept = reservations.sweep_expired().await;
        if !swept.is_empty() {
            warn!("Expired {} reservation hold(s)", swept.len());
        }
        let stale = conflicts.sweep_stale(ttl).await;
        if stale > 0 {
            info!("Dropped {} stale conflict(s)", stale);
        }
    }
}
