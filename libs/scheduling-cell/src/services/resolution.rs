// libs/scheduling-cell/src/services/resolution.rs
use chrono::{DateTime, Duration, NaiveTime, Utc};
use directory_cell::DirectoryService;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{
    AppliedChange, Conflict, ConflictKind, DurationAdjustment, ResolutionAction,
    ResolutionOutcome, ResolutionSuggestion, ResolutionValidation, SlotError, SlotPatch, SlotState,
    TimeSlot,
};
use crate::repository::SlotRepository;
use crate::services::conflict::ConflictDetector;
use crate::services::scheduling::detect_against_store;

// ==============================================================================
// CONFLICT REGISTRY
// ==============================================================================

/// A detected conflict held for later resolution, together with the
/// candidate slot that triggered it. The candidate may not exist in the
/// repository (a rejected create); applying a resolution then creates it
/// in its corrected form.
#[derive(Debug, Clone)]
pub struct RegisteredConflict {
    pub conflict: Conflict,
    pub candidate: TimeSlot,
    pub registered_at: DateTime<Utc>,
}

/// In-memory index of open conflicts by id. Entries are added whenever
/// detection rejects a write, removed once a resolution is applied, and
/// aged out by the periodic sweep so abandoned conflicts do not
/// accumulate forever.
pub struct ConflictRegistry {
    entries: RwLock<HashMap<Uuid, RegisteredConflict>>,
    clock: Arc<dyn Clock>,
}

impl ConflictRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn register_all(&self, conflicts: &[Conflict], candidate: &TimeSlot) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        for conflict in conflicts {
            entries.insert(
                conflict.id,
                RegisteredConflict {
                    conflict: conflict.clone(),
                    candidate: candidate.clone(),
                    registered_at: now,
                },
            );
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<RegisteredConflict> {
        self.entries.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Option<RegisteredConflict> {
        self.entries.write().await.remove(&id)
    }

    pub async fn open_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drop entries that have been open longer than `ttl`. Returns the
    /// number evicted.
    pub async fn sweep_stale(&self, ttl: Duration) -> usize {
        let cutoff = self.clock.now() - ttl;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.registered_at > cutoff);
        before - entries.len()
    }
}

// ==============================================================================
// SUGGESTION SCORING
// ==============================================================================

/// Ranking hook for suggestions. The default multiplies confidence by
/// feasibility; alternative scorers can weight disruption differently
/// without touching generation.
pub trait SuggestionScorer: Send + Sync {
    fn score(&self, suggestion: &ResolutionSuggestion, conflict: &Conflict) -> f64;
}

pub struct DefaultScorer;

impl SuggestionScorer for DefaultScorer {
    fn score(&self, suggestion: &ResolutionSuggestion, _conflict: &Conflict) -> f64 {
        suggestion.score()
    }
}

// ==============================================================================
// RESOLVER
// ==============================================================================

pub struct ConflictResolver {
    repository: Arc<dyn SlotRepository>,
    detector: Arc<ConflictDetector>,
    directory: Arc<DirectoryService>,
    registry: Arc<ConflictRegistry>,
    scorer: Box<dyn SuggestionScorer>,
}

impl ConflictResolver {
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
            scorer: Box::new(DefaultScorer),
        }
    }

    pub fn with_scorer(mut self, scorer: Box<dyn SuggestionScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// The slot an action refers to: either a stored slot or the
    /// conflict's own candidate, which may never have been written.
    async fn target_slot(&self, entry: &RegisteredConflict, id: Uuid) -> Option<TimeSlot> {
        if id == entry.candidate.id {
            Some(entry.candidate.clone())
        } else {
            self.repository.get(id).await.ok()
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

    /// Detection for a slot that moves together with others in the same
    /// resolution: slots in `prospective` are seen at their prospective
    /// intervals, and their stored versions are masked out.
    async fn detect_with_prospective(
        &self,
        candidate: &TimeSlot,
        prospective: &[TimeSlot],
    ) -> Vec<Conflict> {
        let mut dentist_slots: Vec<TimeSlot> = self
            .repository
            .list_for_dentist_date(candidate.dentist_id, candidate.date)
            .await
            .into_iter()
            .filter(|s| prospective.iter().all(|p| p.id != s.id))
            .collect();
        let mut clinic_slots: Vec<TimeSlot> = self
            .repository
            .list_for_clinic_date(candidate.clinic_id, candidate.date)
            .await
            .into_iter()
            .filter(|s| prospective.iter().all(|p| p.id != s.id))
            .collect();
        for other in prospective {
            if other.id == candidate.id {
                continue;
            }
            if other.dentist_id == candidate.dentist_id && other.date == candidate.date {
                dentist_slots.push(other.clone());
            }
            if other.clinic_id == candidate.clinic_id && other.date == candidate.date {
                clinic_slots.push(other.clone());
            }
        }
        let rooms = self.directory.clinic_room_capacity(candidate.clinic_id).await;
        self.detector
            .detect(candidate, &dentist_slots, &clinic_slots, rooms)
    }

    /// Conflict-type-specific suggestions, sorted by the scorer,
    /// best first.
    pub async fn suggest(&self, conflict_id: Uuid) -> Result<Vec<ResolutionSuggestion>, SlotError> {
        let entry = self.registry.get(conflict_id).await.ok_or(SlotError::NotFound)?;

        let mut suggestions = match entry.conflict.kind {
            ConflictKind::TimeOverlap => self.suggest_for_overlap(&entry).await,
            ConflictKind::CapacityExceeded => self.suggest_for_capacity(&entry).await,
            ConflictKind::ResourceConflict => self.suggest_for_resource(&entry).await,
            ConflictKind::BusinessRuleViolation => self.suggest_for_rule(&entry),
        };

        suggestions.sort_by(|a, b| {
            self.scorer
                .score(b, &entry.conflict)
                .partial_cmp(&self.scorer.score(a, &entry.conflict))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        debug!(
            "Produced {} suggestion(s) for conflict {}",
            suggestions.len(),
            conflict_id
        );
        Ok(suggestions)
    }

    /// Probe forward in fixed increments for the first interval where the
    /// moved candidate detects clean, giving up at the configured bound.
    async fn probe_free_interval(
        &self,
        candidate: &TimeSlot,
        from: NaiveTime,
    ) -> Option<(NaiveTime, NaiveTime, i64)> {
        let rules = self.detector.rules();
        let duration = Duration::minutes(candidate.duration_minutes);
        let mut offset = rules.probe_step_minutes;

        while offset <= rules.probe_bound_minutes {
            let new_start = from + Duration::minutes(offset);
            let new_end = new_start + duration;
            if new_end > rules.working_hours_close || new_end < new_start {
                return None;
            }
            let mut probe = candidate.clone();
            probe.start_time = new_start;
            probe.end_time = new_end;
            if self.detect(&probe).await.is_empty() {
                return Some((new_start, new_end, offset));
            }
            offset += rules.probe_step_minutes;
        }
        None
    }

    async fn suggest_for_overlap(&self, entry: &RegisteredConflict) -> Vec<ResolutionSuggestion> {
        let rules = self.detector.rules().clone();
        let candidate = &entry.candidate;
        let mut suggestions = Vec::new();

        if let Some((new_start, new_end, offset)) =
            self.probe_free_interval(candidate, candidate.start_time).await
        {
            let disruption = offset as f64 / rules.probe_bound_minutes as f64;
            suggestions.push(ResolutionSuggestion {
                action: ResolutionAction::MoveSlot {
                    slot_id: candidate.id,
                    new_start_time: new_start,
                    new_end_time: new_end,
                },
                confidence: 0.9,
                feasibility: (1.0 - disruption * 0.5).max(0.1),
                description: format!("move the slot to the free interval {}-{}", new_start, new_end),
            });
        }

        let existing = match entry.conflict.affected_slots.first() {
            Some(&id) => self.repository.get(id).await.ok(),
            None => None,
        };
        if let (Some(existing), Some(overlap)) = (existing, entry.conflict.overlap_minutes) {
            // Each side gives up half the overlap so the intervals touch
            // instead of crossing.
            let candidate_cut = overlap / 2;
            let existing_cut = overlap - candidate_cut;
            let candidate_start = candidate.start_time + Duration::minutes(candidate_cut);
            let existing_end = existing.end_time - Duration::minutes(existing_cut);

            let candidate_len = (candidate.end_time - candidate_start).num_minutes();
            let existing_len = (existing_end - existing.start_time).num_minutes();
            if candidate_len >= rules.min_slot_duration_minutes
                && existing_len >= rules.min_slot_duration_minutes
            {
                suggestions.push(ResolutionSuggestion {
                    action: ResolutionAction::AdjustDuration {
                        adjustments: vec![
                            DurationAdjustment {
                                slot_id: existing.id,
                                new_start_time: existing.start_time,
                                new_end_time: existing_end,
                            },
                            DurationAdjustment {
                                slot_id: candidate.id,
                                new_start_time: candidate_start,
                                new_end_time: candidate.end_time,
                            },
                        ],
                    },
                    confidence: 0.7,
                    feasibility: 0.6,
                    description: format!(
                        "shrink both slots symmetrically to absorb the {} minute overlap",
                        overlap
                    ),
                });
            }

            for slot in [&existing, candidate] {
                if slot.duration_minutes >= rules.split_threshold_minutes {
                    let midpoint =
                        slot.start_time + Duration::minutes(slot.duration_minutes / 2);
                    suggestions.push(ResolutionSuggestion {
                        action: ResolutionAction::SplitSlot {
                            slot_id: slot.id,
                            split_points: vec![midpoint],
                        },
                        confidence: 0.5,
                        feasibility: 0.5,
                        description: format!(
                            "split the {} minute slot at {}",
                            slot.duration_minutes, midpoint
                        ),
                    });
                }
            }
        }

        suggestions
    }

    async fn suggest_for_capacity(&self, entry: &RegisteredConflict) -> Vec<ResolutionSuggestion> {
        let candidate = &entry.candidate;
        let mut suggestions = Vec::new();

        if let Some(rooms) = self.directory.clinic_room_capacity(candidate.clinic_id).await {
            let concurrent: u64 = self
                .repository
                .list_for_clinic_date(candidate.clinic_id, candidate.date)
                .await
                .iter()
                .filter(|s| {
                    s.id != candidate.id
                        && s.occupies_calendar()
                        && s.start_time == candidate.start_time
                })
                .map(|s| u64::from(s.capacity_max))
                .sum();
            let headroom = u64::from(rooms).saturating_sub(concurrent);
            let fitting = u32::try_from(headroom)
                .unwrap_or(u32::MAX)
                .max(candidate.current_bookings)
                .max(1);
            if fitting < candidate.capacity_max {
                suggestions.push(ResolutionSuggestion {
                    action: ResolutionAction::AdjustCapacity {
                        slot_id: candidate.id,
                        new_capacity_max: fitting,
                    },
                    confidence: 0.8,
                    feasibility: 0.9,
                    description: format!(
                        "reduce capacity to the {} consultorio(s) still free at {}",
                        fitting, candidate.start_time
                    ),
                });
            }
        }

        if let Some((new_start, new_end, _)) =
            self.probe_free_interval(candidate, candidate.end_time).await
        {
            suggestions.push(ResolutionSuggestion {
                action: ResolutionAction::CreateAdditionalSlot {
                    template_slot_id: candidate.id,
                    start_time: new_start,
                    end_time: new_end,
                },
                confidence: 0.6,
                feasibility: 0.7,
                description: format!(
                    "offer the spill-over demand an additional slot at {}-{}",
                    new_start, new_end
                ),
            });
        }

        suggestions
    }

    async fn suggest_for_resource(&self, entry: &RegisteredConflict) -> Vec<ResolutionSuggestion> {
        let candidate = &entry.candidate;
        let mut suggestions = Vec::new();

        for clinic in self.directory.list_clinics().await {
            if clinic.id == candidate.clinic_id || !clinic.active {
                continue;
            }
            let taken = self
                .repository
                .list_for_clinic_date(clinic.id, candidate.date)
                .await
                .iter()
                .filter(|s| {
                    s.dentist_id != candidate.dentist_id
                        && s.occupies_calendar()
                        && s.overlap_minutes(candidate.start_time, candidate.end_time) > 0
                })
                .count() as u32;
            if taken < clinic.capacity_consultorios {
                suggestions.push(ResolutionSuggestion {
                    action: ResolutionAction::ReassignResource {
                        slot_id: candidate.id,
                        new_clinic_id: clinic.id,
                    },
                    confidence: 0.7,
                    feasibility: 0.8,
                    description: format!("reassign the slot to {} with free consultorios", clinic.name),
                });
            }
            if suggestions.len() >= 3 {
                break;
            }
        }
        suggestions
    }

    /// The smallest change that satisfies the violated rule.
    fn suggest_for_rule(&self, entry: &RegisteredConflict) -> Vec<ResolutionSuggestion> {
        let rules = self.detector.rules();
        let candidate = &entry.candidate;
        let mut suggestions = Vec::new();

        if candidate.duration_minutes < rules.min_slot_duration_minutes {
            suggestions.push(ResolutionSuggestion {
                action: ResolutionAction::AdjustDuration {
                    adjustments: vec![DurationAdjustment {
                        slot_id: candidate.id,
                        new_start_time: candidate.start_time,
                        new_end_time: candidate.start_time
                            + Duration::minutes(rules.min_slot_duration_minutes),
                    }],
                },
                confidence: 0.9,
                feasibility: 0.8,
                description: format!(
                    "extend the slot to the {} minute minimum",
                    rules.min_slot_duration_minutes
                ),
            });
        } else if candidate.duration_minutes > rules.max_slot_duration_minutes {
            suggestions.push(ResolutionSuggestion {
                action: ResolutionAction::AdjustDuration {
                    adjustments: vec![DurationAdjustment {
                        slot_id: candidate.id,
                        new_start_time: candidate.start_time,
                        new_end_time: candidate.start_time
                            + Duration::minutes(rules.max_slot_duration_minutes),
                    }],
                },
                confidence: 0.9,
                feasibility: 0.8,
                description: format!(
                    "shorten the slot to the {} minute maximum",
                    rules.max_slot_duration_minutes
                ),
            });
        }

        if candidate.start_time < rules.working_hours_open
            || candidate.end_time > rules.working_hours_close
        {
            let duration = Duration::minutes(candidate.duration_minutes);
            let latest_start = rules.working_hours_close
                - Duration::minutes(candidate.duration_minutes);
            let new_start = candidate
                .start_time
                .max(rules.working_hours_open)
                .min(latest_start);
            suggestions.push(ResolutionSuggestion {
                action: ResolutionAction::MoveSlot {
                    slot_id: candidate.id,
                    new_start_time: new_start,
                    new_end_time: new_start + duration,
                },
                confidence: 0.9,
                feasibility: 0.8,
                description: format!(
                    "move the slot inside working hours {}-{}",
                    rules.working_hours_open, rules.working_hours_close
                ),
            });
        }

        for &(_, blackout_end) in &rules.blackout_windows {
            if candidate.overlap_minutes(blackout_end, rules.working_hours_close) == 0
                && candidate.overlap_minutes(rules.working_hours_open, blackout_end) > 0
            {
                let duration = Duration::minutes(candidate.duration_minutes);
                suggestions.push(ResolutionSuggestion {
                    action: ResolutionAction::MoveSlot {
                        slot_id: candidate.id,
                        new_start_time: blackout_end,
                        new_end_time: blackout_end + duration,
                    },
                    confidence: 0.8,
                    feasibility: 0.7,
                    description: format!("move the slot past the blackout window ending {}", blackout_end),
                });
            }
        }

        suggestions
    }

    /// Structural checks plus a dry detection run for actions that move
    /// slots around. Errors make the resolution unusable; warnings flag
    /// residual rule friction the caller may accept.
    pub async fn validate(
        &self,
        conflict_id: Uuid,
        resolution: &ResolutionSuggestion,
    ) -> Result<ResolutionValidation, SlotError> {
        let entry = self.registry.get(conflict_id).await.ok_or(SlotError::NotFound)?;
        let rules = self.detector.rules().clone();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        match &resolution.action {
            ResolutionAction::MoveSlot {
                slot_id,
                new_start_time,
                new_end_time,
            } => {
                let Some(slot) = self.target_slot(&entry, *slot_id).await else {
                    errors.push(format!("slot {} does not exist", slot_id));
                    return Ok(invalid(errors, warnings));
                };
                check_interval(*new_start_time, *new_end_time, &rules, &mut errors, &mut warnings);
                if errors.is_empty() {
                    let mut moved = slot.clone();
                    moved.start_time = *new_start_time;
                    moved.end_time = *new_end_time;
                    moved.duration_minutes = (*new_end_time - *new_start_time).num_minutes();
                    for remaining in self.detect(&moved).await {
                        errors.push(format!("target interval still conflicts: {}", remaining.description));
                    }
                }
            }
            ResolutionAction::AdjustDuration { adjustments } => {
                if adjustments.is_empty() {
                    errors.push("no duration adjustments given".to_string());
                }
                let mut prospective = Vec::new();
                for adjustment in adjustments {
                    let Some(slot) = self.target_slot(&entry, adjustment.slot_id).await else {
                        errors.push(format!("slot {} does not exist", adjustment.slot_id));
                        continue;
                    };
                    check_interval(
                        adjustment.new_start_time,
                        adjustment.new_end_time,
                        &rules,
                        &mut errors,
                        &mut warnings,
                    );
                    let mut adjusted = slot;
                    adjusted.start_time = adjustment.new_start_time;
                    adjusted.end_time = adjustment.new_end_time;
                    adjusted.duration_minutes =
                        (adjustment.new_end_time - adjustment.new_start_time).num_minutes();
                    prospective.push(adjusted);
                }
                if errors.is_empty() {
                    for adjusted in &prospective {
                        for remaining in
                            self.detect_with_prospective(adjusted, &prospective).await
                        {
                            errors.push(format!(
                                "adjusted interval still conflicts: {}",
                                remaining.description
                            ));
                        }
                    }
                }
            }
            ResolutionAction::AdjustCapacity {
                slot_id,
                new_capacity_max,
            } => {
                let Some(slot) = self.target_slot(&entry, *slot_id).await else {
                    errors.push(format!("slot {} does not exist", slot_id));
                    return Ok(invalid(errors, warnings));
                };
                if *new_capacity_max == 0 {
                    errors.push("capacity_max must be at least 1".to_string());
                }
                if *new_capacity_max < slot.current_bookings {
                    errors.push(format!(
                        "capacity {} is below the slot's {} active bookings",
                        new_capacity_max, slot.current_bookings
                    ));
                }
            }
            ResolutionAction::SplitSlot {
                slot_id,
                split_points,
            } => {
                let Some(slot) = self.target_slot(&entry, *slot_id).await else {
                    errors.push(format!("slot {} does not exist", slot_id));
                    return Ok(invalid(errors, warnings));
                };
                if split_points.is_empty() {
                    errors.push("no split points given".to_string());
                }
                let mut previous = slot.start_time;
                for point in split_points {
                    if *point <= previous || *point >= slot.end_time {
                        errors.push(format!("split point {} is outside the slot interval", point));
                        break;
                    }
                    if (*point - previous).num_minutes() < rules.min_slot_duration_minutes {
                        warnings.push(format!(
                            "segment ending {} is shorter than the {} minute minimum",
                            point, rules.min_slot_duration_minutes
                        ));
                    }
                    previous = *point;
                }
                if errors.is_empty() && !split_points.is_empty() {
                    let mut boundaries = vec![slot.start_time];
                    boundaries.extend(split_points.iter().copied());
                    boundaries.push(slot.end_time);

                    let mut segments = Vec::new();
                    let mut first = slot.clone();
                    first.end_time = boundaries[1];
                    first.duration_minutes = (boundaries[1] - slot.start_time).num_minutes();
                    segments.push(first);
                    for window in boundaries[1..].windows(2) {
                        segments.push(derive_additional(&slot, window[0], window[1]));
                    }
                    for segment in &segments {
                        for remaining in self.detect_with_prospective(segment, &segments).await {
                            errors.push(format!(
                                "split segment still conflicts: {}",
                                remaining.description
                            ));
                        }
                    }
                }
            }
            ResolutionAction::ReassignResource {
                slot_id,
                new_clinic_id,
            } => {
                if self.target_slot(&entry, *slot_id).await.is_none() {
                    errors.push(format!("slot {} does not exist", slot_id));
                }
                match self.directory.get_clinic(*new_clinic_id).await {
                    Some(clinic) if clinic.active => {}
                    Some(_) => errors.push("target clinic is inactive".to_string()),
                    None => warnings.push("target clinic is not registered".to_string()),
                }
            }
            ResolutionAction::CreateAdditionalSlot {
                template_slot_id,
                start_time,
                end_time,
            } => {
                let Some(template) = self.target_slot(&entry, *template_slot_id).await else {
                    errors.push(format!("slot {} does not exist", template_slot_id));
                    return Ok(invalid(errors, warnings));
                };
                check_interval(*start_time, *end_time, &rules, &mut errors, &mut warnings);
                if errors.is_empty() {
                    let extra = derive_additional(&template, *start_time, *end_time);
                    for remaining in self.detect(&extra).await {
                        errors.push(format!("additional slot would conflict: {}", remaining.description));
                    }
                }
            }
        }

        Ok(ResolutionValidation {
            valid: errors.is_empty(),
            errors,
            warnings,
        })
    }

    /// Re-validate, then mutate. Multi-slot actions are compensated: when
    /// a later step fails, earlier creations are deleted and earlier
    /// patches rolled back, so the caller observes either the full
    /// resolution or none of it. The conflict stays open on failure.
    pub async fn apply(
        &self,
        conflict_id: Uuid,
        resolution: &ResolutionSuggestion,
    ) -> Result<ResolutionOutcome, SlotError> {
        let entry = self.registry.get(conflict_id).await.ok_or(SlotError::NotFound)?;
        let validation = self.validate(conflict_id, resolution).await?;
        if !validation.valid {
            return Err(SlotError::Validation(validation.errors.join("; ")));
        }

        let mut applied = AppliedSet::new(self.repository.clone());
        let result = self.execute(&entry, &resolution.action, &mut applied).await;

        match result {
            Ok(()) => {
                self.registry.remove(conflict_id).await;
                info!(
                    "Resolved conflict {} with {} change(s)",
                    conflict_id,
                    applied.changes.len()
                );
                Ok(ResolutionOutcome {
                    success: true,
                    changes: applied.changes,
                })
            }
            Err(err) => {
                warn!("Resolution of conflict {} failed: {}", conflict_id, err);
                applied.rollback().await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        entry: &RegisteredConflict,
        action: &ResolutionAction,
        applied: &mut AppliedSet,
    ) -> Result<(), SlotError> {
        match action {
            ResolutionAction::MoveSlot {
                slot_id,
                new_start_time,
                new_end_time,
            } => {
                let patch = SlotPatch {
                    start_time: Some(*new_start_time),
                    end_time: Some(*new_end_time),
                    ..Default::default()
                };
                applied
                    .patch_or_create(entry, *slot_id, patch, "moved to a free interval")
                    .await
            }
            ResolutionAction::AdjustDuration { adjustments } => {
                for adjustment in adjustments {
                    let patch = SlotPatch {
                        start_time: Some(adjustment.new_start_time),
                        end_time: Some(adjustment.new_end_time),
                        ..Default::default()
                    };
                    applied
                        .patch_or_create(entry, adjustment.slot_id, patch, "duration adjusted")
                        .await?;
                }
                Ok(())
            }
            ResolutionAction::AdjustCapacity {
                slot_id,
                new_capacity_max,
            } => {
                let patch = SlotPatch {
                    capacity_max: Some(*new_capacity_max),
                    ..Default::default()
                };
                applied
                    .patch_or_create(entry, *slot_id, patch, "capacity adjusted")
                    .await
            }
            ResolutionAction::ReassignResource {
                slot_id,
                new_clinic_id,
            } => {
                let patch = SlotPatch {
                    clinic_id: Some(*new_clinic_id),
                    ..Default::default()
                };
                applied
                    .patch_or_create(entry, *slot_id, patch, "reassigned to another clinic")
                    .await
            }
            ResolutionAction::SplitSlot {
                slot_id,
                split_points,
            } => {
                let original = if *slot_id == entry.candidate.id {
                    entry.candidate.clone()
                } else {
                    self.repository.get(*slot_id).await?
                };

                let mut boundaries = vec![original.start_time];
                boundaries.extend(split_points.iter().copied());
                boundaries.push(original.end_time);

                // The stored slot keeps its bookings and shrinks to the
                // first segment; the remaining segments become fresh slots.
                let first_end = boundaries[1];
                let patch = SlotPatch {
                    end_time: Some(first_end),
                    ..Default::default()
                };
                applied
                    .patch_or_create(entry, *slot_id, patch, "shrunk to the first split segment")
                    .await?;

                for window in boundaries[1..].windows(2) {
                    let extra = derive_additional(&original, window[0], window[1]);
                    applied.create(extra, "created from a split segment").await?;
                }
                Ok(())
            }
            ResolutionAction::CreateAdditionalSlot {
                template_slot_id,
                start_time,
                end_time,
            } => {
                let template = if *template_slot_id == entry.candidate.id {
                    entry.candidate.clone()
                } else {
                    self.repository.get(*template_slot_id).await?
                };
                let extra = derive_additional(&template, *start_time, *end_time);
                applied.create(extra, "additional slot created").await
            }
        }
    }
}

fn invalid(errors: Vec<String>, warnings: Vec<String>) -> ResolutionValidation {
    ResolutionValidation {
        valid: false,
        errors,
        warnings,
    }
}

fn check_interval(
    start: NaiveTime,
    end: NaiveTime,
    rules: &crate::models::SchedulingRules,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    if end <= start {
        errors.push(format!("interval {}-{} is empty or inverted", start, end));
        return;
    }
    let minutes = (end - start).num_minutes();
    if minutes < rules.min_slot_duration_minutes {
        errors.push(format!(
            "interval {}-{} is shorter than the {} minute minimum",
            start, end, rules.min_slot_duration_minutes
        ));
    }
    if start < rules.working_hours_open || end > rules.working_hours_close {
        warnings.push(format!(
            "interval {}-{} falls outside working hours",
            start, end
        ));
    }
}

/// A fresh slot derived from a template: same dentist, clinic and
/// commercial attributes, empty booking history.
fn derive_additional(template: &TimeSlot, start: NaiveTime, end: NaiveTime) -> TimeSlot {
    let mut slot = template.clone();
    slot.id = Uuid::new_v4();
    slot.version = 0;
    slot.start_time = start;
    slot.end_time = end;
    slot.duration_minutes = (end - start).num_minutes();
    slot.current_bookings = 0;
    slot.state = SlotState::Available;
    slot.reserved_until = None;
    slot.times_booked = 0;
    slot.times_no_show = 0;
    slot
}

/// Mutation log for a resolution in flight; undone in reverse on failure.
struct AppliedSet {
    repository: Arc<dyn SlotRepository>,
    changes: Vec<AppliedChange>,
    created_ids: Vec<Uuid>,
    patched: Vec<TimeSlot>,
}

impl AppliedSet {
    fn new(repository: Arc<dyn SlotRepository>) -> Self {
        Self {
            repository,
            changes: Vec::new(),
            created_ids: Vec::new(),
            patched: Vec::new(),
        }
    }

    /// Patch a stored slot, or create the conflict's candidate (which was
    /// never written) with the patch folded in.
    async fn patch_or_create(
        &mut self,
        entry: &RegisteredConflict,
        slot_id: Uuid,
        patch: SlotPatch,
        description: &str,
    ) -> Result<(), SlotError> {
        match self.repository.get(slot_id).await {
            Ok(before) => {
                let updated = self
                    .repository
                    .update(slot_id, before.version, patch)
                    .await?;
                self.patched.push(before);
                self.changes.push(AppliedChange {
                    slot_id,
                    description: description.to_string(),
                    new_version: Some(updated.version),
                });
                Ok(())
            }
            Err(SlotError::NotFound) if slot_id == entry.candidate.id => {
                let mut candidate = entry.candidate.clone();
                if let Some(start) = patch.start_time {
                    candidate.start_time = start;
                }
                if let Some(end) = patch.end_time {
                    candidate.end_time = end;
                }
                candidate.duration_minutes =
                    (candidate.end_time - candidate.start_time).num_minutes();
                if let Some(clinic_id) = patch.clinic_id {
                    candidate.clinic_id = clinic_id;
                }
                if let Some(capacity) = patch.capacity_max {
                    candidate.capacity_max = capacity;
                }
                self.create(candidate, description).await
            }
            Err(err) => Err(err),
        }
    }

    async fn create(&mut self, slot: TimeSlot, description: &str) -> Result<(), SlotError> {
        let created = self.repository.create(slot).await?;
        self.created_ids.push(created.id);
        self.changes.push(AppliedChange {
            slot_id: created.id,
            description: description.to_string(),
            new_version: Some(created.version),
        });
        Ok(())
    }

    /// Best-effort compensation, newest first.
    async fn rollback(&mut self) {
        for id in self.created_ids.drain(..).rev() {
            if let Err(err) = self.repository.delete(id).await {
                error!("Rollback failed to delete slot {}: {}", id, err);
            }
        }
        for before in self.patched.drain(..).rev() {
            let current = match self.repository.get(before.id).await {
                Ok(slot) => slot,
                Err(err) => {
                    error!("Rollback lost slot {}: {}", before.id, err);
                    continue;
                }
            };
            let patch = SlotPatch {
                start_time: Some(before.start_time),
                end_time: Some(before.end_time),
                clinic_id: Some(before.clinic_id),
                capacity_max: Some(before.capacity_max),
                ..Default::default()
            };
            if let Err(err) = self.repository.update(before.id, current.version, patch).await {
                error!("Rollback failed to restore slot {}: {}", before.id, err);
            }
        }
        self.changes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{AppointmentType, CreateSlotRequest, SchedulingRules};
    use crate::repository::InMemorySlotRepository;
    use crate::services::scheduling::SchedulingService;
    use assert_matches::assert_matches;
    use chrono::{NaiveDate, TimeZone, Utc};

    struct Fixture {
        clock: Arc<ManualClock>,
        scheduling: SchedulingService,
        resolver: ConflictResolver,
        registry: Arc<ConflictRegistry>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        ));
        let repository: Arc<InMemorySlotRepository> =
            Arc::new(InMemorySlotRepository::new(clock.clone()));
        let detector = Arc::new(ConflictDetector::new(SchedulingRules::default()));
        let directory = DirectoryService::new();
        let registry = Arc::new(ConflictRegistry::new(clock.clone()));
        Fixture {
            clock,
            scheduling: SchedulingService::new(
                repository.clone(),
                detector.clone(),
                directory.clone(),
                registry.clone(),
            ),
            resolver: ConflictResolver::new(repository, detector, directory, registry.clone()),
            registry,
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
            base_price: 80.0,
            created_by: "tests".to_string(),
        }
    }

    async fn overlap_conflict(fx: &Fixture) -> (Uuid, Vec<Conflict>) {
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
        match err {
            SlotError::ConflictDetected(conflicts) => (conflicts[0].id, conflicts),
            other => panic!("expected conflicts, got {other}"),
        }
    }

    #[tokio::test]
    async fn overlap_suggestions_lead_with_a_clean_move() {
        let fx = fixture();
        let (conflict_id, _) = overlap_conflict(&fx).await;

        let suggestions = fx.resolver.suggest(conflict_id).await.unwrap();
        assert!(!suggestions.is_empty());
        // Sorted best-first by confidence x feasibility.
        for pair in suggestions.windows(2) {
            assert!(pair[0].score() >= pair[1].score());
        }
        assert_matches!(suggestions[0].action, ResolutionAction::MoveSlot { .. });
    }

    #[tokio::test]
    async fn applying_a_move_creates_the_rejected_candidate() {
        let fx = fixture();
        let (conflict_id, _) = overlap_conflict(&fx).await;
        let suggestions = fx.resolver.suggest(conflict_id).await.unwrap();
        let top = &suggestions[0];

        let outcome = fx.resolver.apply(conflict_id, top).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.changes.len(), 1);

        // Two slots now exist and the conflict entry is gone.
        let page = fx
            .scheduling
            .list_slots(&crate::models::SlotFilter::default())
            .await;
        assert_eq!(page.total, 2);
        assert!(fx.registry.get(conflict_id).await.is_none());
    }

    #[tokio::test]
    async fn apply_refuses_a_resolution_that_no_longer_fits() {
        let fx = fixture();
        let (conflict_id, conflicts) = overlap_conflict(&fx).await;
        let existing_id = conflicts[0].affected_slots[0];

        // Hand-craft a move straight onto the existing slot.
        let bad = ResolutionSuggestion {
            action: ResolutionAction::MoveSlot {
                slot_id: existing_id,
                new_start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                new_end_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            },
            confidence: 1.0,
            feasibility: 1.0,
            description: "inverted interval".to_string(),
        };
        assert_matches!(
            fx.resolver.apply(conflict_id, &bad).await,
            Err(SlotError::Validation(_))
        );
        // Conflict remains open.
        assert!(fx.registry.get(conflict_id).await.is_some());
    }

    #[tokio::test]
    async fn adjustments_that_still_overlap_are_rejected_at_apply() {
        let fx = fixture();
        let dentist = Uuid::new_v4();
        let clinic = Uuid::new_v4();
        let anchor = fx
            .scheduling
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
            panic!("expected conflicts");
        };

        // Hand-craft an adjustment dragging the unrelated slot onto the
        // anchor's interval.
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

        // Nothing moved; the schedule stays overlap-free.
        let unchanged = fx.scheduling.get_slot(other.id).await.unwrap();
        assert_eq!(unchanged.start_time, NaiveTime::from_hms_opt(11, 0, 0).unwrap());
        assert_eq!(
            unchanged.overlap_minutes(anchor.start_time, anchor.end_time),
            0
        );
    }

    #[tokio::test]
    async fn a_symmetric_shrink_suggestion_applies_cleanly() {
        let fx = fixture();
        let (conflict_id, _) = overlap_conflict(&fx).await;
        let suggestions = fx.resolver.suggest(conflict_id).await.unwrap();
        let shrink = suggestions
            .iter()
            .find(|s| matches!(s.action, ResolutionAction::AdjustDuration { .. }))
            .expect("a shrink suggestion for an overlap");

        let outcome = fx.resolver.apply(conflict_id, shrink).await.unwrap();
        assert!(outcome.success);

        let mut slots = fx
            .scheduling
            .list_slots(&crate::models::SlotFilter::default())
            .await
            .items;
        slots.sort_by_key(|s| s.start_time);
        assert_eq!(slots.len(), 2);
        assert!(slots[0].end_time <= slots[1].start_time);
    }

    #[tokio::test]
    async fn stale_conflicts_age_out_of_the_registry() {
        let fx = fixture();
        let (conflict_id, _) = overlap_conflict(&fx).await;
        assert_eq!(fx.registry.open_count().await, 1);

        // A fresh entry survives a sweep.
        assert_eq!(fx.registry.sweep_stale(Duration::hours(2)).await, 0);
        assert!(fx.registry.get(conflict_id).await.is_some());

        fx.clock.advance(Duration::hours(3));
        assert_eq!(fx.registry.sweep_stale(Duration::hours(2)).await, 1);
        assert_matches!(
            fx.resolver.suggest(conflict_id).await,
            Err(SlotError::NotFound)
        );
    }

    #[tokio::test]
    async fn unknown_conflict_id_is_not_found() {
        let fx = fixture();
        assert_matches!(
            fx.resolver.suggest(Uuid::new_v4()).await,
            Err(SlotError::NotFound)
        );
    }

    #[tokio::test]
    async fn split_produces_contiguous_segments() {
        let fx = fixture();
        let dentist = Uuid::new_v4();
        let clinic = Uuid::new_v4();
        // A long slot plus an overlapping candidate gives a split option.
        let long = fx
            .scheduling
            .create_slot(request(dentist, clinic, (9, 0), (12, 0)))
            .await
            .unwrap();
        let err = fx
            .scheduling
            .create_slot(request(dentist, clinic, (11, 0), (12, 0)))
            .await
            .unwrap_err();
        let SlotError::ConflictDetected(conflicts) = err else {
            panic!("expected conflicts");
        };
        let conflict_id = conflicts[0].id;

        let split = ResolutionSuggestion {
            action: ResolutionAction::SplitSlot {
                slot_id: long.id,
                split_points: vec![NaiveTime::from_hms_opt(10, 30, 0).unwrap()],
            },
            confidence: 0.5,
            feasibility: 0.5,
            description: "split".to_string(),
        };
        let outcome = fx.resolver.apply(conflict_id, &split).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.changes.len(), 2);

        let shrunk = fx.scheduling.get_slot(long.id).await.unwrap();
        assert_eq!(shrunk.end_time, NaiveTime::from_hms_opt(10, 30, 0).unwrap());
        let page = fx
            .scheduling
            .list_slots(&crate::models::SlotFilter::default())
            .await;
        assert_eq!(page.total, 2);
    }
}
