// libs/scheduling-cell/src/models.rs
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// CORE SLOT MODELS
// ==============================================================================

/// A bookable time interval for one dentist at one clinic on one date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Uuid,
    /// Monotonic, incremented on every successful mutation. Writers must
    /// present the version they last read; a stale version is rejected
    /// with `SlotError::ConcurrencyConflict`.
    pub version: u64,
    pub dentist_id: Uuid,
    pub clinic_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub duration_minutes: i64,
    pub capacity_max: u32,
    pub current_bookings: u32,
    pub state: SlotState,
    pub appointment_type: AppointmentType,
    pub priority: SlotPriority,
    pub allowed_services: BTreeSet<String>,
    pub is_recurring: bool,
    pub recurrence_group_id: Option<Uuid>,
    pub base_price: f64,
    pub times_booked: u32,
    pub times_no_show: u32,
    /// 0-10 running indicator of historical demand, feeds the pricing engine.
    pub demand_score: f64,
    /// Present only while `state == Reserved`; holds the instant the
    /// reservation lapses. Expiry is recovered from this field alone.
    pub reserved_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

impl TimeSlot {
    /// Utilization in `0.0..=1.0`.
    pub fn utilization(&self) -> f64 {
        if self.capacity_max == 0 {
            return 0.0;
        }
        f64::from(self.current_bookings) / f64::from(self.capacity_max)
    }

    pub fn has_free_capacity(&self) -> bool {
        self.current_bookings < self.capacity_max
    }

    /// States that occupy the dentist's calendar and therefore participate
    /// in overlap detection.
    pub fn occupies_calendar(&self) -> bool {
        matches!(
            self.state,
            SlotState::Available | SlotState::Reserved | SlotState::Occupied
        )
    }

    /// Minutes of overlap with `[start, end)`, zero when disjoint.
    pub fn overlap_minutes(&self, start: NaiveTime, end: NaiveTime) -> i64 {
        let overlap_start = self.start_time.max(start);
        let overlap_end = self.end_time.min(end);
        (overlap_end - overlap_start).num_minutes().max(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Available,
    Reserved,
    Occupied,
    Blocked,
    Cancelled,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotState::Available => write!(f, "available"),
            SlotState::Reserved => write!(f, "reserved"),
            SlotState::Occupied => write!(f, "occupied"),
            SlotState::Blocked => write!(f, "blocked"),
            SlotState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl SlotState {
    /// The slot lifecycle state machine. Cancellation additionally requires
    /// `current_bookings == 0`; that guard lives in the repository because
    /// it depends on slot data, not on the states alone.
    pub fn can_transition_to(self, next: SlotState) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (SlotState::Available, SlotState::Reserved) => true,
            (SlotState::Available, SlotState::Blocked) => true,
            (SlotState::Reserved, SlotState::Available) => true,
            (SlotState::Reserved, SlotState::Occupied) => true,
            (SlotState::Reserved, SlotState::Blocked) => true,
            (SlotState::Occupied, SlotState::Available) => true,
            (SlotState::Blocked, SlotState::Available) => true,
            (_, SlotState::Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentType {
    Checkup,
    Cleaning,
    Filling,
    Extraction,
    RootCanal,
    Orthodontics,
    Whitening,
    Emergency,
}

impl fmt::Display for AppointmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentType::Checkup => write!(f, "checkup"),
            AppointmentType::Cleaning => write!(f, "cleaning"),
            AppointmentType::Filling => write!(f, "filling"),
            AppointmentType::Extraction => write!(f, "extraction"),
            AppointmentType::RootCanal => write!(f, "root_canal"),
            AppointmentType::Orthodontics => write!(f, "orthodontics"),
            AppointmentType::Whitening => write!(f, "whitening"),
            AppointmentType::Emergency => write!(f, "emergency"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SlotPriority {
    Normal,
    High,
    Urgent,
}

impl Default for SlotPriority {
    fn default() -> Self {
        SlotPriority::Normal
    }
}

// ==============================================================================
// RECURRENCE MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub kind: RecurrenceKind,
    /// Every n-th day / week / month; must be >= 1.
    pub frequency: u32,
    /// Weekly patterns only.
    pub days_of_week: Option<Vec<Weekday>>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl RecurrencePattern {
    /// Whether `date` qualifies under this pattern. `start_date` anchors
    /// day/week/month indices.
    pub fn matches(&self, date: NaiveDate) -> bool {
        if date < self.start_date || date > self.end_date {
            return false;
        }
        let freq = i64::from(self.frequency.max(1));
        match self.kind {
            RecurrenceKind::Daily => {
                let days = (date - self.start_date).num_days();
                days % freq == 0
            }
            RecurrenceKind::Weekly => {
                let days = (date - self.start_date).num_days();
                let week_index = days.div_euclid(7);
                let weekday_matches = self
                    .days_of_week
                    .as_ref()
                    .map(|set| set.contains(&date.weekday()))
                    .unwrap_or(false);
                weekday_matches && week_index % freq == 0
            }
            RecurrenceKind::Monthly => {
                let month_index = i64::from(date.year()) * 12 + i64::from(date.month0())
                    - (i64::from(self.start_date.year()) * 12
                        + i64::from(self.start_date.month0()));
                date.day() == self.start_date.day() && month_index % freq == 0
            }
        }
    }
}

/// Slot attributes shared by every instance a recurrence pattern produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringSlotTemplate {
    pub dentist_id: Uuid,
    pub clinic_id: Uuid,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity_max: u32,
    pub appointment_type: AppointmentType,
    #[serde(default)]
    pub priority: SlotPriority,
    #[serde(default)]
    pub allowed_services: BTreeSet<String>,
    pub base_price: f64,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationError {
    pub date: NaiveDate,
    pub reason: String,
}

/// Per-item outcome of a recurrence run; a conflicting day is an entry in
/// `errors`, never fatal to the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationReport {
    pub group_id: Uuid,
    pub generated_count: usize,
    pub created: Vec<Uuid>,
    pub errors: Vec<GenerationError>,
}

// ==============================================================================
// CONFLICT MODELS (TRANSIENT, NEVER PERSISTED)
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    TimeOverlap,
    CapacityExceeded,
    ResourceConflict,
    BusinessRuleViolation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub kind: ConflictKind,
    /// Ordered by start time; for overlap conflicts the first entry is the
    /// existing slot the candidate collided with.
    pub affected_slots: Vec<Uuid>,
    pub overlap_minutes: Option<i64>,
    pub severity: Severity,
    pub auto_resolvable: bool,
    pub description: String,
}

impl Conflict {
    pub fn new(kind: ConflictKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            affected_slots: Vec::new(),
            overlap_minutes: None,
            severity,
            auto_resolvable: false,
            description: description.into(),
        }
    }
}

// ==============================================================================
// RESOLUTION MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationAdjustment {
    pub slot_id: Uuid,
    pub new_start_time: NaiveTime,
    pub new_end_time: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionAction {
    MoveSlot {
        slot_id: Uuid,
        new_start_time: NaiveTime,
        new_end_time: NaiveTime,
    },
    AdjustDuration {
        adjustments: Vec<DurationAdjustment>,
    },
    AdjustCapacity {
        slot_id: Uuid,
        new_capacity_max: u32,
    },
    SplitSlot {
        slot_id: Uuid,
        split_points: Vec<NaiveTime>,
    },
    ReassignResource {
        slot_id: Uuid,
        new_clinic_id: Uuid,
    },
    CreateAdditionalSlot {
        template_slot_id: Uuid,
        start_time: NaiveTime,
        end_time: NaiveTime,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionSuggestion {
    #[serde(flatten)]
    pub action: ResolutionAction,
    /// 0-1, how likely the action eliminates the conflict.
    pub confidence: f64,
    /// 0-1, how disruptive the action is to existing bookings.
    pub feasibility: f64,
    pub description: String,
}

impl ResolutionSuggestion {
    /// Suggestions are ranked by this product, descending.
    pub fn score(&self) -> f64 {
        self.confidence * self.feasibility
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedChange {
    pub slot_id: Uuid,
    pub description: String,
    pub new_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub success: bool,
    pub changes: Vec<AppliedChange>,
}

// ==============================================================================
// REQUEST / RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSlotRequest {
    pub dentist_id: Uuid,
    pub clinic_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity_max: u32,
    pub appointment_type: AppointmentType,
    #[serde(default)]
    pub priority: SlotPriority,
    #[serde(default)]
    pub allowed_services: BTreeSet<String>,
    pub base_price: f64,
    pub created_by: String,
}

/// Partial update; fields left `None` are untouched. Booking counters and
/// `reserved_until` are deliberately absent: they only move through the
/// reservation/booking operations so the capacity invariant cannot be
/// bypassed by a plain update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotPatch {
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    /// Reassigns the slot to another clinic's consultorio.
    pub clinic_id: Option<Uuid>,
    pub capacity_max: Option<u32>,
    pub state: Option<SlotState>,
    pub appointment_type: Option<AppointmentType>,
    pub priority: Option<SlotPriority>,
    pub allowed_services: Option<BTreeSet<String>>,
    pub base_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSlotRequest {
    pub version: u64,
    #[serde(flatten)]
    pub patch: SlotPatch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReserveSlotRequest {
    pub hold_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub slot_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRecurringRequest {
    pub pattern: RecurrencePattern,
    pub template: RecurringSlotTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResolutionRequest {
    pub conflict_id: Uuid,
    pub resolution: ResolutionSuggestion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCreateError {
    pub index: usize,
    pub error: String,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCreateOutcome {
    pub created: Vec<TimeSlot>,
    pub errors: Vec<BulkCreateError>,
}

// ==============================================================================
// QUERY MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Date,
    StartTime,
    Price,
    DemandScore,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Explicit, validated filter over the slot collection; every supported
/// field is enumerated here rather than accepted as an open dictionary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotFilter {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub dentist_ids: Option<Vec<Uuid>>,
    pub clinic_ids: Option<Vec<Uuid>>,
    pub states: Option<Vec<SlotState>>,
    pub appointment_types: Option<Vec<AppointmentType>>,
    pub min_duration_minutes: Option<i64>,
    pub max_duration_minutes: Option<i64>,
    pub time_from: Option<NaiveTime>,
    pub time_to: Option<NaiveTime>,
    pub has_free_capacity: Option<bool>,
    pub recurring_only: Option<bool>,
    pub sort_key: Option<SortKey>,
    pub sort_direction: Option<SortDirection>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

// ==============================================================================
// STATISTICS MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DentistEfficiency {
    pub dentist_id: Uuid,
    pub total_slots: usize,
    pub utilization_rate: f64,
    pub no_show_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleStats {
    pub total_slots: usize,
    pub by_state: BTreeMap<String, usize>,
    pub utilization_rate: f64,
    pub no_show_rate: f64,
    /// Bookings keyed by starting hour (0-23).
    pub hourly_distribution: BTreeMap<u32, u32>,
    pub per_dentist: Vec<DentistEfficiency>,
    pub potential_revenue: f64,
    pub realized_revenue: f64,
}

// ==============================================================================
// SCHEDULING RULES
// ==============================================================================

/// Configurable business rules checked by the conflict detector and used
/// by the resolver when probing for alternatives.
#[derive(Debug, Clone)]
pub struct SchedulingRules {
    pub min_slot_duration_minutes: i64,
    pub max_slot_duration_minutes: i64,
    pub working_hours_open: NaiveTime,
    pub working_hours_close: NaiveTime,
    /// Windows inside working hours where no slot may be scheduled.
    pub blackout_windows: Vec<(NaiveTime, NaiveTime)>,
    /// Resolver probe step when searching for a free interval.
    pub probe_step_minutes: i64,
    /// Resolver gives up probing past this horizon.
    pub probe_bound_minutes: i64,
    /// Slots at least this long are candidates for splitting.
    pub split_threshold_minutes: i64,
    pub default_hold_minutes: i64,
}

impl Default for SchedulingRules {
    fn default() -> Self {
        Self {
            min_slot_duration_minutes: 15,
            max_slot_duration_minutes: 240,
            working_hours_open: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            working_hours_close: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            blackout_windows: Vec::new(),
            probe_step_minutes: 15,
            probe_bound_minutes: 240,
            split_threshold_minutes: 120,
            default_hold_minutes: 15,
        }
    }
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum SlotError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Slot conflicts with existing schedule ({} conflicts)", .0.len())]
    ConflictDetected(Vec<Conflict>),

    #[error("Stale version: expected {expected}, found {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    #[error("Slot has active bookings and cannot be deleted")]
    DeletionBlocked,

    #[error("Illegal state transition: {from} -> {to}")]
    InvalidStateTransition { from: SlotState, to: SlotState },

    #[error("Slot not found")]
    NotFound,

    #[error("Reservation not found")]
    ReservationNotFound,

    #[error("Reservation hold has expired")]
    Expired,
}
