/// End-to-end exercises of the scheduling engine: the service graph is
/// wired exactly as the API wires it, against the in-memory store and a
/// manual clock, and driven through full operation sequences.
use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use uuid::Uuid;

use directory_cell::{Clinic, DirectoryService};
use scheduling_cell::models::{
    AppointmentType, CreateSlotRequest, DurationAdjustment, GenerateRecurringRequest,
    RecurrenceKind, RecurrencePattern, RecurringSlotTemplate, ResolutionAction,
    ResolutionSuggestion, SchedulingRules, SlotError, SlotFilter, SlotPatch, SlotState,
};
use scheduling_cell::services::conflict::ConflictDetector;
use scheduling_cell::services::reservation::ReservationService;
use scheduling_cell::services::resolution::{ConflictRegistry, ConflictResolver};
use scheduling_cell::services::scheduling::SchedulingService;
use scheduling_cell::{InMemorySlotRepository, ManualClock, SlotRepository};

struct Engine {
    clock: Arc<ManualClock>,
    repository: Arc<InMemorySlotRepository>,
    directory: Arc<DirectoryService>,
    scheduling: SchedulingService,
    reservations: ReservationService,
    resolver: ConflictResolver,
}

fn engine() -> Engine {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap(),
    ));
    let repository = Arc::new(InMemorySlotRepository::new(clock.clone()));
    let detector = Arc::new(ConflictDetector::new(SchedulingRules::default()));
    let directory = DirectoryService::new();
    let registry = Arc::new(ConflictRegistry::new(clock.clone()));

    Engine {
        clock: clock.clone(),
        repository: repository.clone(),
        directory: directory.clone(),
        scheduling: SchedulingService::new(
            repository.clone(),
            detector.clone(),
            directory.clone(),
            registry.clone(),
        ),
        reservations: ReservationService::new(repository.clone(), clock, 15),
        resolver: ConflictResolver::new(repository, detector, directory, registry),
    }
}

fn request(dentist: Uuid, clinic: Uuid, start: (u32, u32), end: (u32, u32)) -> CreateSlotRequest {
    CreateSlotRequest {
        dentist_id: dentist,
        clinic_id: clinic,
        date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
        start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
        end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
        capacity_max: 1,
        appointment_type: AppointmentType::Checkup,
        priority: Default::default(),
        allowed_services: Default::default(),
        base_price: 100.0,
        created_by: "integration".to_string(),
    }
}

/// No two calendar-occupying slots of one dentist may overlap, no matter
/// how the schedule was produced.
async fn assert_no_overlaps(repository: &InMemorySlotRepository) {
    let slots = repository.all().await;
    for a in &slots {
        for b in &slots {
            if a.id == b.id
                || a.dentist_id != b.dentist_id
                || a.date != b.date
                || !a.occupies_calendar()
                || !b.occupies_calendar()
            {
                continue;
            }
            assert_eq!(
                a.overlap_minutes(b.start_time, b.end_time),
                0,
                "slots {} and {} overlap",
                a.id,
                b.id
            );
        }
    }
}

#[tokio::test]
async fn schedule_stays_overlap_free_through_create_and_resolve() {
    let fx = engine();
    let dentist = Uuid::new_v4();
    let clinic = Uuid::new_v4();

    fx.scheduling
        .create_slot(request(dentist, clinic, (9, 0), (10, 0)))
        .await
        .unwrap();
    let err = fx
        .scheduling
        .create_slot(request(dentist, clinic, (9, 30), (10, 30)))
        .await
        .unwrap_err();
    let SlotError::ConflictDetected(conflicts) = err else {
        panic!("expected a conflict");
    };

    let suggestions = fx.resolver.suggest(conflicts[0].id).await.unwrap();
    let outcome = fx
        .resolver
        .apply(conflicts[0].id, &suggestions[0])
        .await
        .unwrap();
    assert!(outcome.success);

    assert_eq!(fx.repository.all().await.len(), 2);
    assert_no_overlaps(&fx.repository).await;
}

#[tokio::test]
async fn caller_supplied_adjustments_cannot_commit_an_overlap() {
    let fx = engine();
    let dentist = Uuid::new_v4();
    let clinic = Uuid::new_v4();

    fx.scheduling
        .create_slot(request(dentist, clinic, (9, 0), (10, 0)))
        .await
        .unwrap();
    let other = fx
        .scheduling
        .create_slot(request(dentist, clinic, (11, 0), (12, 0)))
        .await
        .unwrap();
    let err = fx
        .scheduling
        .create_slot(request(dentist, clinic, (9, 30), (10, 30)))
        .await
        .unwrap_err();
    let SlotError::ConflictDetected(conflicts) = err else {
        panic!("expected a conflict");
    };

    // An adjustment that drags the unrelated slot onto 09:30-10:30 must
    // be refused, not written.
    let bad = ResolutionSuggestion {
        action: ResolutionAction::AdjustDuration {
            adjustments: vec![DurationAdjustment {
                slot_id: other.id,
                new_start_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                new_end_time: NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
            }],
        },
        confidence: 1.0,
        feasibility: 1.0,
        description: "overlapping adjustment".to_string(),
    };
    assert_matches!(
        fx.resolver.apply(conflicts[0].id, &bad).await,
        Err(SlotError::Validation(_))
    );
    assert_no_overlaps(&fx.repository).await;
}

#[tokio::test]
async fn capacity_bounds_hold_through_a_booking_lifecycle() {
    let fx = engine();
    let dentist = Uuid::new_v4();
    let clinic = Uuid::new_v4();

    let mut req = request(dentist, clinic, (9, 0), (10, 0));
    req.capacity_max = 2;
    let slot = fx.scheduling.create_slot(req).await.unwrap();

    // Book both seats through the reservation flow.
    for _ in 0..2 {
        let hold = fx.reservations.reserve(slot.id, Some(10)).await;
        let hold = match hold {
            Ok(hold) => hold,
            // The slot is Occupied after the first confirm; free capacity
            // remains but holds only apply to Available slots.
            Err(SlotError::ConflictDetected(_)) => break,
            Err(other) => panic!("unexpected {other}"),
        };
        fx.reservations.confirm(hold.id).await.unwrap();
    }

    let booked = fx.repository.get(slot.id).await.unwrap();
    assert!(booked.current_bookings <= booked.capacity_max);

    // Cancelling below zero is impossible; the last cancellation frees
    // the slot.
    for _ in 0..4 {
        fx.scheduling.cancel_booking(slot.id).await.unwrap();
    }
    let emptied = fx.repository.get(slot.id).await.unwrap();
    assert_eq!(emptied.current_bookings, 0);
    assert_eq!(emptied.state, SlotState::Available);
}

#[tokio::test]
async fn booked_slots_cannot_be_deleted_until_emptied() {
    let fx = engine();
    let slot = fx
        .scheduling
        .create_slot(request(Uuid::new_v4(), Uuid::new_v4(), (9, 0), (10, 0)))
        .await
        .unwrap();
    let hold = fx.reservations.reserve(slot.id, None).await.unwrap();
    fx.reservations.confirm(hold.id).await.unwrap();

    assert_matches!(
        fx.scheduling.delete_slot(slot.id).await,
        Err(SlotError::DeletionBlocked)
    );

    fx.scheduling.cancel_booking(slot.id).await.unwrap();
    fx.scheduling.delete_slot(slot.id).await.unwrap();
    assert_matches!(
        fx.scheduling.get_slot(slot.id).await,
        Err(SlotError::NotFound)
    );
}

#[tokio::test]
async fn concurrent_reserves_admit_exactly_one_holder() {
    let fx = engine();
    let slot = fx
        .scheduling
        .create_slot(request(Uuid::new_v4(), Uuid::new_v4(), (9, 0), (10, 0)))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        fx.reservations.reserve(slot.id, Some(15)),
        fx.reservations.reserve(slot.id, Some(15)),
    );
    let winners = [first.is_ok(), second.is_ok()]
        .iter()
        .filter(|&&ok| ok)
        .count();
    assert_eq!(winners, 1);

    let loser = if first.is_ok() { second } else { first };
    assert_matches!(loser, Err(SlotError::ConflictDetected(_)));
}

#[tokio::test]
async fn expired_holds_are_recovered_by_the_sweep() {
    let fx = engine();
    let slot = fx
        .scheduling
        .create_slot(request(Uuid::new_v4(), Uuid::new_v4(), (9, 0), (10, 0)))
        .await
        .unwrap();
    let hold = fx.reservations.reserve(slot.id, Some(15)).await.unwrap();

    fx.clock.advance(Duration::minutes(20));
    let swept = fx.reservations.sweep_expired().await;
    assert_eq!(swept, vec![slot.id]);

    // The hold is gone; the slot can be re-reserved immediately.
    assert_matches!(
        fx.reservations.confirm(hold.id).await,
        Err(SlotError::ReservationNotFound) | Err(SlotError::Expired)
    );
    fx.reservations.reserve(slot.id, Some(15)).await.unwrap();
}

#[tokio::test]
async fn release_tolerates_retries() {
    let fx = engine();
    let slot = fx
        .scheduling
        .create_slot(request(Uuid::new_v4(), Uuid::new_v4(), (9, 0), (10, 0)))
        .await
        .unwrap();
    let hold = fx.reservations.reserve(slot.id, None).await.unwrap();

    fx.reservations.release(hold.id).await.unwrap();
    fx.reservations.release(hold.id).await.unwrap();
    assert_eq!(
        fx.repository.get(slot.id).await.unwrap().state,
        SlotState::Available
    );
}

#[tokio::test]
async fn bulk_create_commits_the_good_and_reports_the_bad() {
    let fx = engine();
    let dentist = Uuid::new_v4();
    let clinic = Uuid::new_v4();

    let outcome = fx
        .scheduling
        .bulk_create_slots(vec![
            request(dentist, clinic, (9, 0), (10, 0)),
            request(dentist, clinic, (9, 45), (10, 45)),
            request(dentist, clinic, (6, 0), (7, 0)), // outside working hours
            request(dentist, clinic, (11, 0), (12, 0)),
        ])
        .await;

    assert_eq!(outcome.created.len(), 2);
    assert_eq!(outcome.errors.len(), 2);
    assert_eq!(outcome.errors[0].index, 1);
    assert_eq!(outcome.errors[1].index, 2);
    // Earlier successes were not rolled back.
    assert_eq!(fx.repository.all().await.len(), 2);
}

#[tokio::test]
async fn stale_writers_are_told_to_re_read() {
    let fx = engine();
    let slot = fx
        .scheduling
        .create_slot(request(Uuid::new_v4(), Uuid::new_v4(), (9, 0), (10, 0)))
        .await
        .unwrap();

    let price_patch = |price: f64| SlotPatch {
        base_price: Some(price),
        ..Default::default()
    };

    // Two writers read version 1; the second write must lose.
    fx.scheduling
        .update_slot(slot.id, slot.version, price_patch(110.0))
        .await
        .unwrap();
    assert_matches!(
        fx.scheduling
            .update_slot(slot.id, slot.version, price_patch(120.0))
            .await,
        Err(SlotError::ConcurrencyConflict { .. })
    );

    // After a re-read the write goes through.
    let fresh = fx.scheduling.get_slot(slot.id).await.unwrap();
    fx.scheduling
        .update_slot(slot.id, fresh.version, price_patch(120.0))
        .await
        .unwrap();
    assert_eq!(
        fx.scheduling.get_slot(slot.id).await.unwrap().base_price,
        120.0
    );
}

#[tokio::test]
async fn recurrence_generation_respects_room_capacity() {
    let fx = engine();
    let clinic = Clinic {
        id: Uuid::new_v4(),
        name: "Norte".to_string(),
        district_id: Uuid::new_v4(),
        capacity_consultorios: 1,
        active: true,
    };
    fx.directory.register_clinic(clinic.clone()).await;

    // Another dentist already works Mondays 9-10 at the only consultorio.
    let other = request(Uuid::new_v4(), clinic.id, (9, 0), (10, 0));
    fx.scheduling.create_slot(other).await.unwrap();

    let report = fx
        .scheduling
        .generate_recurring(GenerateRecurringRequest {
            pattern: RecurrencePattern {
                kind: RecurrenceKind::Weekly,
                frequency: 1,
                days_of_week: Some(vec![Weekday::Mon, Weekday::Fri]),
                start_date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            },
            template: RecurringSlotTemplate {
                dentist_id: Uuid::new_v4(),
                clinic_id: clinic.id,
                start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                capacity_max: 1,
                appointment_type: AppointmentType::Cleaning,
                priority: Default::default(),
                allowed_services: Default::default(),
                base_price: 70.0,
                created_by: "integration".to_string(),
            },
        })
        .await
        .unwrap();

    // Monday collides with the existing occupant, Friday is free.
    assert_eq!(report.generated_count, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(
        report.errors[0].date,
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    );

    let page = fx
        .scheduling
        .list_slots(&SlotFilter {
            recurring_only: Some(true),
            ..Default::default()
        })
        .await;
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].recurrence_group_id, Some(report.group_id));
}
