use chrono::{DateTime, Utc};
use tracing::debug;

use crate::capabilities::KvBackend;
use crate::device_store::DeviceStore;
use crate::error::SessionError;
use crate::model::{ProblemCategory, ProblemId, ProblemReport, Severity};

pub const MAX_OBSERVATION_CHARS: usize = 2_000;
pub const MAX_IMAGES: usize = 10;

/// A problem as the driver filled it in, before it is tied to a trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemDraft {
    pub category: ProblemCategory,
    pub severity: Severity,
    pub observation: String,
    pub images: Vec<String>,
}

impl ProblemDraft {
    pub fn new(
        category: ProblemCategory,
        severity: Severity,
        observation: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            observation: observation.into(),
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// Builds a draft from raw form values. Blank fields are reported as missing.
    pub fn from_form(
        category: &str,
        severity: &str,
        observation: &str,
    ) -> Result<Self, SessionError> {
        if category.trim().is_empty() {
            return Err(SessionError::MissingField { field: "category" });
        }
        if severity.trim().is_empty() {
            return Err(SessionError::MissingField { field: "severity" });
        }
        let category = category
            .parse::<ProblemCategory>()
            .map_err(|e| SessionError::InvalidValue {
                field: "category",
                reason: e.to_string(),
            })?;
        let severity = severity
            .parse::<Severity>()
            .map_err(|e| SessionError::InvalidValue {
                field: "severity",
                reason: e.to_string(),
            })?;
        Ok(Self::new(category, severity, observation))
    }

    /// Trims the observation and enforces the form's limits.
    pub fn validate(&self) -> Result<String, SessionError> {
        let observation = self.observation.trim();
        if observation.is_empty() {
            return Err(SessionError::MissingField {
                field: "observation",
            });
        }
        let chars = observation.chars().count();
        if chars > MAX_OBSERVATION_CHARS {
            return Err(SessionError::InvalidValue {
                field: "observation",
                reason: format!("{} characters exceeds {}", chars, MAX_OBSERVATION_CHARS),
            });
        }
        if self.images.len() > MAX_IMAGES {
            return Err(SessionError::InvalidValue {
                field: "images",
                reason: format!("{} images exceeds {}", self.images.len(), MAX_IMAGES),
            });
        }
        if self.images.iter().any(|i| i.trim().is_empty()) {
            return Err(SessionError::InvalidValue {
                field: "images",
                reason: "image reference cannot be blank".into(),
            });
        }
        Ok(observation.to_string())
    }

    /// Stamps the draft with the trip's vehicle and driver numbers.
    pub fn into_report(
        self,
        vehicle_number: &str,
        driver_number: &str,
        now: DateTime<Utc>,
    ) -> Result<ProblemReport, SessionError> {
        let observation = self.validate()?;
        Ok(ProblemReport {
            id: ProblemId::generate(),
            vehicle_number: vehicle_number.to_string(),
            driver_number: driver_number.to_string(),
            category: self.category,
            severity: self.severity,
            observation,
            reported_at: now,
            images: self.images,
        })
    }
}

/// Problem reports held for the active trip until it ends.
///
/// A view over the store's pending list, so the queue survives restarts.
pub struct ProblemQueue<'a, K: KvBackend> {
    store: &'a mut DeviceStore<K>,
}

impl<'a, K: KvBackend> ProblemQueue<'a, K> {
    pub fn new(store: &'a mut DeviceStore<K>) -> Self {
        Self { store }
    }

    pub fn add(&mut self, report: &ProblemReport) {
        debug!(problem_id = %report.id, severity = %report.severity, "problem held for trip end");
        self.store.add_pending_problem(report);
    }

    /// Submission order, no reordering.
    pub fn list(&self) -> Vec<ProblemReport> {
        self.store.pending_problems()
    }

    pub fn drain(&mut self) -> Vec<ProblemReport> {
        let reports = self.store.pending_problems();
        self.store.clear_pending_problems();
        reports
    }

    pub fn remove(&mut self, id: &ProblemId) {
        self.store.remove_pending_problem(id);
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list().is_empty()
    }
}
