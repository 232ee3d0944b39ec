use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt, str::FromStr};

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn generate() -> Self {
                Self(format!("{}_{}", $prefix, uuid::Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(TripId, "trip");
typed_id!(ProblemId, "problem");
typed_id!(EntryId, "entry");
typed_id!(IdempotencyKey, "idem");

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

// --- Driver & trip ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub registration_number: String,
    pub name: String,
    #[serde(rename = "isLoggedIn")]
    pub logged_in: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TripSession {
    pub id: TripId,
    pub vehicle_number: String,
    pub driver_number: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl TripSession {
    pub fn start(
        vehicle_number: impl Into<String>,
        driver_number: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TripId::generate(),
            vehicle_number: vehicle_number.into(),
            driver_number: driver_number.into(),
            start_time: now,
            end_time: None,
            is_active: true,
        }
    }

    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now);
        self.is_active = false;
    }

    /// Elapsed time so far for an active trip, final duration otherwise.
    pub fn elapsed_label(&self, now: DateTime<Utc>) -> String {
        format_duration(self.start_time, Some(self.end_time.unwrap_or(now)))
    }
}

// --- Problems ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProblemCategory {
    #[serde(alias = "eletrica")]
    Electrical,
    #[serde(alias = "mecanica")]
    Mechanical,
    #[serde(alias = "funilaria")]
    Bodywork,
    #[serde(alias = "limpeza")]
    Cleaning,
    #[serde(alias = "pneus")]
    Tires,
    #[serde(alias = "outros")]
    Other,
}

impl ProblemCategory {
    pub const ALL: [ProblemCategory; 6] = [
        ProblemCategory::Electrical,
        ProblemCategory::Mechanical,
        ProblemCategory::Bodywork,
        ProblemCategory::Cleaning,
        ProblemCategory::Tires,
        ProblemCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemCategory::Electrical => "electrical",
            ProblemCategory::Mechanical => "mechanical",
            ProblemCategory::Bodywork => "bodywork",
            ProblemCategory::Cleaning => "cleaning",
            ProblemCategory::Tires => "tires",
            ProblemCategory::Other => "other",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProblemCategory::Electrical => "Electrical",
            ProblemCategory::Mechanical => "Mechanical",
            ProblemCategory::Bodywork => "Bodywork",
            ProblemCategory::Cleaning => "Cleaning",
            ProblemCategory::Tires => "Tires",
            ProblemCategory::Other => "Other",
        }
    }

    fn legacy_word(&self) -> &'static str {
        match self {
            ProblemCategory::Electrical => "eletrica",
            ProblemCategory::Mechanical => "mecanica",
            ProblemCategory::Bodywork => "funilaria",
            ProblemCategory::Cleaning => "limpeza",
            ProblemCategory::Tires => "pneus",
            ProblemCategory::Other => "outros",
        }
    }
}

impl fmt::Display for ProblemCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProblemCategory {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == needle || c.legacy_word() == needle)
            .ok_or_else(|| ParseError {
                kind: "category",
                value: s.to_string(),
            })
    }
}

/// Declared low to critical so `Ord` ranks by urgency.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "baixa")]
    Low,
    #[serde(alias = "media")]
    Medium,
    #[serde(alias = "alta")]
    High,
    #[serde(alias = "critica")]
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }

    fn legacy_word(&self) -> &'static str {
        match self {
            Severity::Low => "baixa",
            Severity::Medium => "media",
            Severity::High => "alta",
            Severity::Critical => "critica",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == needle || v.legacy_word() == needle)
            .ok_or_else(|| ParseError {
                kind: "severity",
                value: s.to_string(),
            })
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProblemReport {
    pub id: ProblemId,
    pub vehicle_number: String,
    pub driver_number: String,
    pub category: ProblemCategory,
    pub severity: Severity,
    pub observation: String,
    pub reported_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

// Observations are free text typed by drivers; keep them out of logs.
impl fmt::Debug for ProblemReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProblemReport")
            .field("id", &self.id)
            .field("vehicle_number", &self.vehicle_number)
            .field("driver_number", &self.driver_number)
            .field("category", &self.category)
            .field("severity", &self.severity)
            .field("observation_len", &self.observation.chars().count())
            .field("reported_at", &self.reported_at)
            .field("image_count", &self.images.len())
            .finish()
    }
}

/// Display order for problem lists: most severe first.
pub fn by_severity(a: &ProblemReport, b: &ProblemReport) -> Ordering {
    b.severity.cmp(&a.severity)
}

/// Highest severity first; reports of equal severity keep their order.
pub fn sort_by_severity(reports: &mut [ProblemReport]) {
    reports.sort_by(by_severity);
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TripHistory {
    pub id: TripId,
    pub vehicle_number: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub problems: Vec<ProblemReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

impl TripHistory {
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn duration_label(&self) -> String {
        format_duration(self.start_time, self.end_time)
    }
}

pub const IN_PROGRESS_LABEL: &str = "in progress";

/// `"{h}h {m}m"`, or `"in progress"` without an end.
pub fn format_duration(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> String {
    match end {
        None => IN_PROGRESS_LABEL.to_string(),
        Some(end) => {
            let minutes = (end - start).num_minutes().max(0);
            format!("{}h {}m", minutes / 60, minutes % 60)
        }
    }
}

// --- Offline queue ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartTripPayload {
    pub vehicle_number: String,
    pub driver_number: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EndTripPayload {
    pub vehicle_number: String,
    pub driver_number: String,
    pub timestamp: DateTime<Utc>,
    pub problems: Vec<ProblemReport>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum QueuedAction {
    StartTrip(StartTripPayload),
    EndTrip(EndTripPayload),
    ReportProblem(ProblemReport),
}

impl QueuedAction {
    pub fn tag(&self) -> &'static str {
        match self {
            QueuedAction::StartTrip(_) => "start-trip",
            QueuedAction::EndTrip(_) => "end-trip",
            QueuedAction::ReportProblem(_) => "report-problem",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfflineQueueEntry {
    pub id: EntryId,
    pub action: QueuedAction,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OfflineQueueEntry {
    /// Queues `action` under the key its first delivery attempt used.
    pub fn new(action: QueuedAction, idempotency_key: IdempotencyKey, now: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::generate(),
            action,
            timestamp: now,
            idempotency_key,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn reports_problem(&self, id: &ProblemId) -> bool {
        matches!(&self.action, QueuedAction::ReportProblem(p) if &p.id == id)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeadLetterReason {
    ServerRejected { message: String },
    MaxAttempts { attempts: u32 },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub entry: OfflineQueueEntry,
    pub reason: DeadLetterReason,
    pub retired_at: DateTime<Utc>,
}
