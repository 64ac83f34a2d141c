// libs/scheduling-cell/src/services/conflict.rs
use crate::models::{Conflict, ConflictKind, SchedulingRules, Severity, TimeSlot};

/// Pure conflict detection. `detect` is a function of its arguments only;
/// callers gather the candidate's neighborhood (same dentist/date, same
/// clinic/date) from the repository and pass it in, which keeps every
/// rule unit-testable without a store.
pub struct ConflictDetector {
    rules: SchedulingRules,
}

impl ConflictDetector {
    pub fn new(rules: SchedulingRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &SchedulingRules {
        &self.rules
    }

    /// Evaluate `candidate` against its surroundings. `dentist_slots` are
    /// the same dentist's slots on the candidate's date; `clinic_slots`
    /// are every dentist's slots at the candidate's clinic on that date;
    /// `clinic_rooms` is the clinic's consultorio count when known. The
    /// candidate itself is excluded from both lists by id, so the same
    /// call works for creates and for re-checks during an update.
    pub fn detect(
        &self,
        candidate: &TimeSlot,
        dentist_slots: &[TimeSlot],
        clinic_slots: &[TimeSlot],
        clinic_rooms: Option<u32>,
    ) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        self.check_time_overlap(candidate, dentist_slots, &mut conflicts);
        self.check_capacity(candidate, clinic_slots, clinic_rooms, &mut conflicts);
        self.check_resource(candidate, clinic_slots, clinic_rooms, &mut conflicts);
        self.check_business_rules(candidate, &mut conflicts);
        conflicts
    }

    fn check_time_overlap(
        &self,
        candidate: &TimeSlot,
        dentist_slots: &[TimeSlot],
        conflicts: &mut Vec<Conflict>,
    ) {
        for existing in dentist_slots {
            if existing.id == candidate.id || !existing.occupies_calendar() {
                continue;
            }
            let overlap = existing.overlap_minutes(candidate.start_time, candidate.end_time);
            if overlap > 0 {
                let mut conflict = Conflict::new(
                    ConflictKind::TimeOverlap,
                    Severity::High,
                    format!(
                        "overlaps an existing {} slot ({}-{}) by {} minutes",
                        existing.state, existing.start_time, existing.end_time, overlap
                    ),
                );
                conflict.affected_slots = vec![existing.id, candidate.id];
                conflict.overlap_minutes = Some(overlap);
                conflict.auto_resolvable = true;
                conflicts.push(conflict);
            }
        }
    }

    /// Seats offered at the same clinic, date and exact start time must
    /// fit the clinic's consultorio count.
    fn check_capacity(
        &self,
        candidate: &TimeSlot,
        clinic_slots: &[TimeSlot],
        clinic_rooms: Option<u32>,
        conflicts: &mut Vec<Conflict>,
    ) {
        let Some(rooms) = clinic_rooms else {
            return;
        };

        let concurrent: Vec<&TimeSlot> = clinic_slots
            .iter()
            .filter(|s| {
                s.id != candidate.id
                    && s.occupies_calendar()
                    && s.start_time == candidate.start_time
            })
            .collect();
        let total: u64 = concurrent
            .iter()
            .map(|s| u64::from(s.capacity_max))
            .sum::<u64>()
            + u64::from(candidate.capacity_max);

        if total > u64::from(rooms) {
            let mut conflict = Conflict::new(
                ConflictKind::CapacityExceeded,
                Severity::Medium,
                format!(
                    "combined capacity {} at {} exceeds the clinic's {} consultorios",
                    total, candidate.start_time, rooms
                ),
            );
            conflict.affected_slots = concurrent.iter().map(|s| s.id).collect();
            conflict.affected_slots.push(candidate.id);
            conflict.auto_resolvable = true;
            conflicts.push(conflict);
        }
    }

    /// A consultorio is exclusively occupied by one dentist for the whole
    /// interval, so the candidate needs a room that no other dentist's
    /// overlapping slot is already holding.
    fn check_resource(
        &self,
        candidate: &TimeSlot,
        clinic_slots: &[TimeSlot],
        clinic_rooms: Option<u32>,
        conflicts: &mut Vec<Conflict>,
    ) {
        let Some(rooms) = clinic_rooms else {
            return;
        };

        let occupied_rooms: Vec<&TimeSlot> = clinic_slots
            .iter()
            .filter(|s| {
                s.id != candidate.id
                    && s.dentist_id != candidate.dentist_id
                    && s.occupies_calendar()
                    && s.overlap_minutes(candidate.start_time, candidate.end_time) > 0
            })
            .collect();

        if occupied_rooms.len() as u64 >= u64::from(rooms) {
            let mut conflict = Conflict::new(
                ConflictKind::ResourceConflict,
                Severity::High,
                format!(
                    "all {} consultorios are taken by other dentists during {}-{}",
                    rooms, candidate.start_time, candidate.end_time
                ),
            );
            conflict.affected_slots = occupied_rooms.iter().map(|s| s.id).collect();
            conflict.affected_slots.push(candidate.id);
            conflicts.push(conflict);
        }
    }

    fn check_business_rules(&self, candidate: &TimeSlot, conflicts: &mut Vec<Conflict>) {
        let rules = &self.rules;

        if candidate.duration_minutes < rules.min_slot_duration_minutes {
            conflicts.push(rule_violation(
                candidate,
                Severity::Medium,
                format!(
                    "duration {} min is below the {} min minimum",
                    candidate.duration_minutes, rules.min_slot_duration_minutes
                ),
            ));
        }
        if candidate.duration_minutes > rules.max_slot_duration_minutes {
            conflicts.push(rule_violation(
                candidate,
                Severity::Medium,
                format!(
                    "duration {} min exceeds the {} min maximum",
                    candidate.duration_minutes, rules.max_slot_duration_minutes
                ),
            ));
        }
        if candidate.start_time < rules.working_hours_open
            || candidate.end_time > rules.working_hours_close
        {
            conflicts.push(rule_violation(
                candidate,
                Severity::Medium,
                format!(
                    "slot {}-{} falls outside working hours {}-{}",
                    candidate.start_time,
                    candidate.end_time,
                    rules.working_hours_open,
                    rules.working_hours_close
                ),
            ));
        }
        for &(from, to) in &rules.blackout_windows {
            if candidate.overlap_minutes(from, to) > 0 {
                conflicts.push(rule_violation(
                    candidate,
                    Severity::Low,
                    format!("slot overlaps the blackout window {}-{}", from, to),
                ));
            }
        }
    }
}

fn rule_violation(candidate: &TimeSlot, severity: Severity, description: String) -> Conflict {
    let mut conflict = Conflict::new(ConflictKind::BusinessRuleViolation, severity, description);
    conflict.affected_slots = vec![candidate.id];
    conflict
}
