//! Offline-first core for the fleet driver app.
//!
//! The platform shell links this crate and performs the real I/O: it
//! implements [`capabilities::HttpShell`] for network calls and hands the core a
//! [`capabilities::KvBackend`] for device storage. Everything else lives here:
//! the trip session state machine, problem reports, the offline queue and its
//! replay, and the history view.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod capabilities;
pub mod config;
pub mod device_store;
pub mod error;
pub mod history;
pub mod model;
pub mod problem_queue;
pub mod replay;
pub mod session;
pub mod sync_client;

pub use capabilities::{CancelHandle, HttpShell, KvBackend, MemoryKv};
#[cfg(not(target_arch = "wasm32"))]
pub use capabilities::SqliteKv;
pub use config::{ClientConfig, ConfigError, ReplayConfig};
pub use device_store::DeviceStore;
pub use error::SessionError;
pub use history::{HistoryState, HistoryStats, HistoryView};
pub use model::{
    DeadLetter, Driver, OfflineQueueEntry, ProblemCategory, ProblemReport, QueuedAction,
    Severity, TripHistory, TripSession,
};
pub use problem_queue::{ProblemDraft, ProblemQueue};
pub use replay::{OfflineReplayer, ReplayReport};
pub use session::{ActionOutcome, Dashboard, QueueCause, Session, SessionState};
pub use sync_client::{SyncClient, SyncOutcome};
