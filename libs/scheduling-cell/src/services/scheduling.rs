// libs/scheduling-cell/src/services/scheduling.rs
use directory_cell::DirectoryService;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    BulkCreateError, BulkCreateOutcome, Conflict, CreateSlotRequest, GenerateRecurringRequest,
    GenerationError, GenerationReport, Page, SlotError, SlotFilter, SlotPatch, SlotState, TimeSlot,
};
use crate::repository::SlotRepository;
use crate::services::conflict::ConflictDetector;
use crate::services::recurrence::{
    self, RecurrenceExpansion, INITIAL_DEMAND_SCORE,
};
use crate::services::resolution::ConflictRegistry;

/// Command surface over the slot collection. Every write is routed
/// through the conflict detector before it reaches the repository;
/// detected conflicts abort the write and are registered so the resolver
/// can later be asked about them by id.
pub struct SchedulingService {
    repository: Arc<dyn SlotRepository>,
    detector: Arc<ConflictDetector>,
    directory: Arc<DirectoryService>,
    registry: Arc<ConflictRegistry>,
}

/// Gather the candidate's neighborhood and run pure detection against it.
pub(crate) async fn detect_against_store(
    repository: &dyn SlotRepository,
    detector: &ConflictDetector,
    directory: &DirectoryService,
    candidate: &TimeSlot,
) -> Vec<Conflict> {
    let dentist_slots = repository
        .list_for_dentist_date(candidate.dentist_id, candidate.date)
        .await;
    let clinic_slots = repository
        .list_for_clinic_date(candidate.clinic_id, candidate.date)
        .await;
    let rooms = directory.clinic_room_capacity(candidate.clinic_id).await;
    detector.detect(candidate, &dentist_slots, &clinic_slots, rooms)
}

impl SchedulingService {
    pub fn new(
        repository: Arc<dyn SlotRepository>,
        detector: Arc<ConflictDetector>,
        directory: Arc<DirectoryService>,
        registry: Arc<ConflictRegistry>,
    ) -> Self {
        Self {
            repository,
            detector,
            directory,
            registry,
        }
    }

    async fn detect(&self, candidate: &TimeSlot) -> Vec<Conflict> {
        detect_against_store(
            self.repository.as_ref(),
            &self.detector,
            &self.directory,
            candidate,
        )
        .await
    }

    fn candidate_from_request(request: &CreateSlotRequest) -> Result<TimeSlot, SlotError> {
        if request.end_time <= request.start_time {
            return Err(SlotError::Validation(
                "end_time must be after start_time".to_string(),
            ));
        }
        Ok(TimeSlot {
            id: Uuid::new_v4(),
            version: 0,
            dentist_id: request.dentist_id,
            clinic_id: request.clinic_id,
            date: request.date,
            start_time: request.start_time,
            end_time: request.end_time,
            duration_minutes: (request.end_time - request.start_time).num_minutes(),
            capacity_max: request.capacity_max,
            current_bookings: 0,
            state: SlotState::Available,
            appointment_type: request.appointment_type.clone(),
            priority: request.priority,
            allowed_services: request.allowed_services.clone(),
            is_recurring: false,
            recurrence_group_id: None,
            base_price: request.base_price,
            times_booked: 0,
            times_no_show: 0,
            demand_score: INITIAL_DEMAND_SCORE,
            reserved_until: None,
            created_at: chrono::DateTime::<chrono::Utc>::MIN_UTC,
            updated_at: chrono::DateTime::<chrono::Utc>::MIN_UTC,
            created_by: request.created_by.clone(),
        })
    }

    /// Create a single slot: validate, detect, then commit. A conflicting
    /// candidate is never written; the conflicts are registered and
    /// returned inside the error.
    pub async fn create_slot(&self, request: CreateSlotRequest) -> Result<TimeSlot, SlotError> {
        if self.directory.dentist_is_active(request.dentist_id).await == Some(false) {
            return Err(SlotError::Validation(
                "dentist is inactive and cannot receive new slots".to_string(),
            ));
        }

        let candidate = Self::candidate_from_request(&request)?;
        let conflicts = self.detect(&candidate).await;
        if !conflicts.is_empty() {
            warn!(
                "Rejected slot for dentist {} on {}: {} conflict(s)",
                candidate.dentist_id,
                candidate.date,
                conflicts.len()
            );
            self.registry.register_all(&conflicts, &candidate).await;
            return Err(SlotError::ConflictDetected(conflicts));
        }
        self.repository.create(candidate).await
    }

    /// Dry-run detection: the candidate is checked but never written.
    /// Found conflicts are registered so the resolver can be asked about
    /// them by id afterwards.
    pub async fn check_conflicts(
        &self,
        request: CreateSlotRequest,
    ) -> Result<Vec<Conflict>, SlotError> {
        let candidate = Self::candidate_from_request(&request)?;
        let conflicts = self.detect(&candidate).await;
        if !conflicts.is_empty() {
            self.registry.register_all(&conflicts, &candidate).await;
        }
        Ok(conflicts)
    }

    /// Per-item semantics: each candidate is validated and committed
    /// independently; one failure never rolls back its siblings.
    pub async fn bulk_create_slots(&self, requests: Vec<CreateSlotRequest>) -> BulkCreateOutcome {
        let mut outcome = BulkCreateOutcome {
            created: Vec::new(),
            errors: Vec::new(),
        };
        for (index, request) in requests.into_iter().enumerate() {
            match self.create_slot(request).await {
                Ok(slot) => outcome.created.push(slot),
                Err(error) => {
                    let conflicts = match &error {
                        SlotError::ConflictDetected(conflicts) => conflicts.clone(),
                        _ => Vec::new(),
                    };
                    outcome.errors.push(BulkCreateError {
                        index,
                        error: error.to_string(),
                        conflicts,
                    });
                }
            }
        }
        info!(
            "Bulk create: {} created, {} rejected",
            outcome.created.len(),
            outcome.errors.len()
        );
        outcome
    }

    /// Patch a slot under optimistic concurrency. When the patch touches
    /// the interval or capacity, detection is re-run on the prospective
    /// slot before the write is attempted.
    pub async fn update_slot(
        &self,
        id: Uuid,
        expected_version: u64,
        patch: SlotPatch,
    ) -> Result<TimeSlot, SlotError> {
        let affects_schedule = patch.start_time.is_some()
            || patch.end_time.is_some()
            || patch.clinic_id.is_some()
            || patch.capacity_max.is_some();
        if affects_schedule {
            let current = self.repository.get(id).await?;
            let mut prospective = current.clone();
            if let Some(start) = patch.start_time {
                prospective.start_time = start;
            }
            if let Some(end) = patch.end_time {
                prospective.end_time = end;
            }
            prospective.duration_minutes =
                (prospective.end_time - prospective.start_time).num_minutes();
            if let Some(clinic_id) = patch.clinic_id {
                prospective.clinic_id = clinic_id;
            }
            if let Some(capacity) = patch.capacity_max {
                prospective.capacity_max = capacity;
            }

            let conflicts = self.detect(&prospective).await;
            if !conflicts.is_empty() {
                self.registry.register_all(&conflicts, &prospective).await;
                return Err(SlotError::ConflictDetected(conflicts));
            }
        }
        self.repository.update(id, expected_version, patch).await
    }

    pub async fn get_slot(&self, id: Uuid) -> Result<TimeSlot, SlotError> {
        self.repository.get(id).await
    }

    pub async fn list_slots(&self, filter: &SlotFilter) -> Page<TimeSlot> {
        self.repository.list(filter).await
    }

    pub async fn delete_slot(&self, id: Uuid) -> Result<(), SlotError> {
        self.repository.delete(id).await
    }

    pub async fn block_slot(&self, id: Uuid, expected_version: u64) -> Result<TimeSlot, SlotError> {
        let patch = SlotPatch {
            state: Some(SlotState::Blocked),
            ..Default::default()
        };
        self.repository.update(id, expected_version, patch).await
    }

    pub async fn unblock_slot(
        &self,
        id: Uuid,
        expected_version: u64,
    ) -> Result<TimeSlot, SlotError> {
        let current = self.repository.get(id).await?;
        if current.state != SlotState::Blocked {
            return Err(SlotError::InvalidStateTransition {
                from: current.state,
                to: SlotState::Available,
            });
        }
        let patch = SlotPatch {
            state: Some(SlotState::Available),
            ..Default::default()
        };
        self.repository.update(id, expected_version, patch).await
    }

    pub async fn cancel_booking(&self, id: Uuid) -> Result<TimeSlot, SlotError> {
        self.repository.cancel_booking(id).await
    }

    pub async fn mark_no_show(&self, id: Uuid) -> Result<TimeSlot, SlotError> {
        self.repository.record_no_show(id).await
    }

    /// Expand a recurrence pattern into concrete slots. Each qualifying
    /// day is conflict-checked on its own; a conflicting day becomes a
    /// report entry and the batch continues.
    pub async fn generate_recurring(
        &self,
        request: GenerateRecurringRequest,
    ) -> Result<GenerationReport, SlotError> {
        recurrence::validate_pattern(&request.pattern)?;
        if request.template.end_time <= request.template.start_time {
            return Err(SlotError::Validation(
                "template end_time must be after start_time".to_string(),
            ));
        }
        if self
            .directory
            .dentist_is_active(request.template.dentist_id)
            .await
            == Some(false)
        {
            return Err(SlotError::Validation(
                "dentist is inactive and cannot receive new slots".to_string(),
            ));
        }

        let group_id = Uuid::new_v4();
        let mut report = GenerationReport {
            group_id,
            generated_count: 0,
            created: Vec::new(),
            errors: Vec::new(),
        };

        let dates: Vec<_> = RecurrenceExpansion::new(&request.pattern).collect();
        for date in dates {
            let candidate = recurrence::instantiate(&request.template, date, group_id);
            let conflicts = self.detect(&candidate).await;
            if !conflicts.is_empty() {
                report.errors.push(GenerationError {
                    date,
                    reason: conflicts
                        .iter()
                        .map(|c| c.description.clone())
                        .collect::<Vec<_>>()
                        .join("; "),
                });
                continue;
            }
            match self.repository.create(candidate).await {
                Ok(slot) => report.created.push(slot.id),
                Err(error) => report.errors.push(GenerationError {
                    date,
                    reason: error.to_string(),
                }),
            }
        }
        report.generated_count = report.created.len();
        info!(
            "Recurrence group {} generated {} slot(s), {} day(s) skipped",
            group_id,
            report.generated_count,
            report.errors.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{
        AppointmentType, RecurrenceKind, RecurrencePattern, RecurringSlotTemplate, SchedulingRules,
    };
    use crate::repository::InMemorySlotRepository;
    use assert_matches::assert_matches;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
    use directory_cell::{Clinic, Dentist};

    fn fixture() -> SchedulingService {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        ));
        SchedulingService::new(
            Arc::new(InMemorySlotRepository::new(clock.clone())),
            Arc::new(ConflictDetector::new(SchedulingRules::default())),
            DirectoryService::new(),
            Arc::new(ConflictRegistry::new(clock)),
        )
    }

    fn request(dentist: Uuid, start: (u32, u32), end: (u32, u32)) -> CreateSlotRequest {
        CreateSlotRequest {
            dentist_id: dentist,
            clinic_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            capacity_max: 1,
            appointment_type: AppointmentType::Checkup,
            priority: Default::default(),
            allowed_services: Default::default(),
            base_price: 80.0,
            created_by: "tests".to_string(),
        }
    }

    #[tokio::test]
    async fn conflicting_create_is_rejected_and_nothing_is_written() {
        let service = fixture();
        let dentist = Uuid::new_v4();
        service.create_slot(request(dentist, (9, 0), (10, 0))).await.unwrap();

        let result = service.create_slot(request(dentist, (9, 30), (10, 30))).await;
        assert_matches!(result, Err(SlotError::ConflictDetected(_)));

        let page = service.list_slots(&SlotFilter::default()).await;
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn bulk_create_reports_partial_success() {
        let service = fixture();
        let dentist = Uuid::new_v4();
        let outcome = service
            .bulk_create_slots(vec![
                request(dentist, (9, 0), (10, 0)),
                request(dentist, (9, 30), (10, 30)), // overlaps the first
                request(dentist, (11, 0), (12, 0)),
            ])
            .await;

        assert_eq!(outcome.created.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].index, 1);
        assert!(!outcome.errors[0].conflicts.is_empty());
    }

    #[tokio::test]
    async fn update_that_moves_into_an_overlap_is_rejected() {
        let service = fixture();
        let dentist = Uuid::new_v4();
        let first = service.create_slot(request(dentist, (9, 0), (10, 0))).await.unwrap();
        let mut second_req = request(dentist, (11, 0), (12, 0));
        second_req.clinic_id = first.clinic_id;
        let second = service.create_slot(second_req).await.unwrap();

        let patch = SlotPatch {
            start_time: Some(NaiveTime::from_hms_opt(9, 30, 0).unwrap()),
            end_time: Some(NaiveTime::from_hms_opt(10, 30, 0).unwrap()),
            ..Default::default()
        };
        assert_matches!(
            service.update_slot(second.id, second.version, patch).await,
            Err(SlotError::ConflictDetected(_))
        );
        // The slot is untouched, version included.
        let unchanged = service.get_slot(second.id).await.unwrap();
        assert_eq!(unchanged.version, second.version);
    }

    #[tokio::test]
    async fn inactive_dentist_cannot_receive_slots() {
        let service = fixture();
        let dentist = Dentist {
            id: Uuid::new_v4(),
            first_name: "Ana".to_string(),
            last_name: "Reyes".to_string(),
            specialties: vec!["orthodontics".to_string()],
            active: false,
        };
        service.directory.register_dentist(dentist.clone()).await;

        assert_matches!(
            service.create_slot(request(dentist.id, (9, 0), (10, 0))).await,
            Err(SlotError::Validation(_))
        );
    }

    #[tokio::test]
    async fn recurrence_skips_conflicting_days_without_aborting() {
        let service = fixture();
        let dentist = Uuid::new_v4();
        let clinic = Uuid::new_v4();

        // Pre-existing slot on Wednesday the 6th blocks that instance.
        let mut existing = request(dentist, (9, 0), (10, 0));
        existing.clinic_id = clinic;
        existing.date = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        service.create_slot(existing).await.unwrap();

        let report = service
            .generate_recurring(GenerateRecurringRequest {
                pattern: RecurrencePattern {
                    kind: RecurrenceKind::Weekly,
                    frequency: 1,
                    days_of_week: Some(vec![Weekday::Mon, Weekday::Wed, Weekday::Fri]),
                    start_date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
                    end_date: NaiveDate::from_ymd_opt(2024, 3, 17).unwrap(),
                },
                template: RecurringSlotTemplate {
                    dentist_id: dentist,
                    clinic_id: clinic,
                    start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                    capacity_max: 1,
                    appointment_type: AppointmentType::Cleaning,
                    priority: Default::default(),
                    allowed_services: Default::default(),
                    base_price: 60.0,
                    created_by: "tests".to_string(),
                },
            })
            .await
            .unwrap();

        assert_eq!(report.generated_count, 5);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].date, NaiveDate::from_ymd_opt(2024, 3, 6).unwrap());

        // Every generated instance carries the same group id.
        let page = service
            .list_slots(&SlotFilter {
                recurring_only: Some(true),
                ..Default::default()
            })
            .await;
        assert_eq!(page.total, 5);
        assert!(page
            .items
            .iter()
            .all(|s| s.recurrence_group_id == Some(report.group_id)));
    }

    #[tokio::test]
    async fn room_capacity_gates_concurrent_slots() {
        let service = fixture();
        let clinic = Clinic {
            id: Uuid::new_v4(),
            name: "Centro".to_string(),
            district_id: Uuid::new_v4(),
            capacity_consultorios: 1,
            active: true,
        };
        service.directory.register_clinic(clinic.clone()).await;

        let mut first = request(Uuid::new_v4(), (9, 0), (10, 0));
        first.clinic_id = clinic.id;
        service.create_slot(first).await.unwrap();

        let mut second = request(Uuid::new_v4(), (9, 0), (10, 0));
        second.clinic_id = clinic.id;
        assert_matches!(
            service.create_slot(second).await,
            Err(SlotError::ConflictDetected(_))
        );
    }
}
