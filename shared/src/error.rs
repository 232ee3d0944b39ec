use thiserror::Error;

use crate::session::SessionState;

/// Errors the session API hands back to the shell. Every variant leaves the
/// device state exactly as it was before the call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: SessionState,
        action: &'static str,
    },

    #[error("login rejected: {message}")]
    LoginRejected { message: String },

    #[error("login failed, server unreachable: {reason}")]
    LoginUnreachable { reason: String },
}

impl SessionError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingField { .. } | Self::InvalidValue { .. } => "VALIDATION_ERROR",
            Self::InvalidTransition { .. } => "INVALID_STATE",
            Self::LoginRejected { .. } => "LOGIN_REJECTED",
            Self::LoginUnreachable { .. } => "NETWORK_ERROR",
        }
    }

    /// Only a login that never reached the server is worth retrying as-is.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LoginUnreachable { .. })
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self {
            Self::MissingField { field } => format!("Please fill in the {}.", field_label(field)),
            Self::InvalidValue { field, .. } => {
                format!("The {} is not valid.", field_label(field))
            }
            Self::InvalidTransition { state, .. } => match state {
                SessionState::LoggedOut => "Please sign in first.".into(),
                SessionState::Idle => "Start a trip first.".into(),
                SessionState::TripActive => "Finish the current trip first.".into(),
                SessionState::TripEnding => "The trip is being closed. Please wait.".into(),
            },
            Self::LoginRejected { message } => message.clone(),
            Self::LoginUnreachable { .. } => {
                "Unable to reach the fleet server. Check the Wi-Fi connection and try again."
                    .into()
            }
        }
    }
}

fn field_label(field: &str) -> &str {
    match field {
        "registration_number" => "registration number",
        "vehicle_number" => "vehicle number",
        other => other,
    }
}
