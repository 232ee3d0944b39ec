use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    CancelHandle, HttpError, HttpRequest, HttpResponse, HttpShell, ValidatedUrl,
    IDEMPOTENCY_KEY_HEADER,
};
use crate::config::{ClientConfig, ConfigError};
use crate::model::{
    EndTripPayload, IdempotencyKey, ProblemReport, QueuedAction, StartTripPayload, TripHistory,
};

pub const LOGIN_PATH: &str = "login";
pub const TRIP_START_PATH: &str = "saida";
pub const TRIP_END_PATH: &str = "retorno";
pub const PROBLEM_PATH: &str = "problema";
pub const HISTORY_PATH: &str = "historico";
pub const SYNC_PATH: &str = "sync";

/// Result of one remote call. There is no fallback data: a call either
/// succeeded, was refused by the server, or never got a usable answer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome<T> {
    Success(T),
    ServerRejected { message: String, status: u16 },
    Unreachable { reason: String },
}

impl<T> SyncOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success(_))
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, SyncOutcome::Unreachable { .. })
    }

    pub fn success(self) -> Option<T> {
        match self {
            SyncOutcome::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SyncOutcome<U> {
        match self {
            SyncOutcome::Success(v) => SyncOutcome::Success(f(v)),
            SyncOutcome::ServerRejected { message, status } => {
                SyncOutcome::ServerRejected { message, status }
            }
            SyncOutcome::Unreachable { reason } => SyncOutcome::Unreachable { reason },
        }
    }

    fn unreachable(err: &HttpError) -> Self {
        SyncOutcome::Unreachable {
            reason: err.to_string(),
        }
    }
}

/// `{success, data?, message?}` as the fleet server sends it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    registration_number: &'a str,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest {
    timestamp: DateTime<Utc>,
}

/// Accepted 2xx envelope, before the caller picks out what it needs.
struct Accepted<D> {
    status: u16,
    data: Option<D>,
    message: Option<String>,
}

/// Thin client for the depot's fleet server. Performs exactly one attempt per
/// call; retries belong to the offline replay.
pub struct SyncClient<S: HttpShell> {
    shell: S,
    base_url: ValidatedUrl,
    timeout: Duration,
    cancel: CancelHandle,
}

impl<S: HttpShell> SyncClient<S> {
    pub fn new(shell: S, config: &ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shell,
            base_url: config.base_url()?,
            timeout: config.request_timeout(),
            cancel: CancelHandle::new(),
        })
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    pub fn base_url(&self) -> &ValidatedUrl {
        &self.base_url
    }

    /// Handle the shell can use to abort the call currently in flight.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Returns the driver's display name.
    #[instrument(skip(self))]
    pub async fn login(&self, registration_number: &str) -> SyncOutcome<String> {
        let body = LoginRequest {
            registration_number,
        };
        match self.post::<_, LoginData>(LOGIN_PATH, &body, None).await {
            SyncOutcome::Success(Accepted {
                data: Some(data), ..
            }) => SyncOutcome::Success(data.name),
            SyncOutcome::Success(Accepted { status, message, .. }) => {
                SyncOutcome::ServerRejected {
                    message: message.unwrap_or_else(|| "login response had no driver".into()),
                    status,
                }
            }
            other => other.map(|_| String::new()),
        }
    }

    #[instrument(skip(self, payload), fields(idempotency_key = %key))]
    pub async fn register_trip_start(
        &self,
        payload: &StartTripPayload,
        key: &IdempotencyKey,
    ) -> SyncOutcome<Ack> {
        self.post_ack(TRIP_START_PATH, payload, key).await
    }

    #[instrument(
        skip(self, payload),
        fields(idempotency_key = %key, problems = payload.problems.len())
    )]
    pub async fn register_trip_end(
        &self,
        payload: &EndTripPayload,
        key: &IdempotencyKey,
    ) -> SyncOutcome<Ack> {
        self.post_ack(TRIP_END_PATH, payload, key).await
    }

    #[instrument(skip(self, report), fields(idempotency_key = %key, problem_id = %report.id))]
    pub async fn report_problem(
        &self,
        report: &ProblemReport,
        key: &IdempotencyKey,
    ) -> SyncOutcome<Ack> {
        self.post_ack(PROBLEM_PATH, report, key).await
    }

    #[instrument(skip(self))]
    pub async fn get_history(&self, registration_number: &str) -> SyncOutcome<Vec<TripHistory>> {
        let url = match self
            .base_url
            .join_segments([HISTORY_PATH, registration_number])
        {
            Ok(url) => url,
            Err(e) => return SyncOutcome::unreachable(&e),
        };
        let request = match HttpRequest::get(url).with_timeout(self.timeout) {
            Ok(r) => r,
            Err(e) => return SyncOutcome::unreachable(&e),
        };

        match self.send::<Vec<TripHistory>>(request).await {
            SyncOutcome::Success(Accepted {
                data: Some(trips), ..
            }) => {
                info!(trips = trips.len(), "history loaded");
                SyncOutcome::Success(trips)
            }
            SyncOutcome::Success(Accepted { status, message, .. }) => {
                SyncOutcome::ServerRejected {
                    message: message.unwrap_or_else(|| "history response had no data".into()),
                    status,
                }
            }
            other => other.map(|_| Vec::new()),
        }
    }

    /// Heartbeat to the fleet server.
    #[instrument(skip(self), fields(idempotency_key = %key))]
    pub async fn sync(&self, now: DateTime<Utc>, key: &IdempotencyKey) -> SyncOutcome<Ack> {
        self.post_ack(SYNC_PATH, &HeartbeatRequest { timestamp: now }, key)
            .await
    }

    /// Sends a queued action to the endpoint its tag names.
    pub async fn deliver(&self, action: &QueuedAction, key: &IdempotencyKey) -> SyncOutcome<Ack> {
        match action {
            QueuedAction::StartTrip(payload) => self.register_trip_start(payload, key).await,
            QueuedAction::EndTrip(payload) => self.register_trip_end(payload, key).await,
            QueuedAction::ReportProblem(report) => self.report_problem(report, key).await,
        }
    }

    async fn post_ack<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        key: &IdempotencyKey,
    ) -> SyncOutcome<Ack> {
        self.post::<B, serde_json::Value>(path, body, Some(key))
            .await
            .map(|accepted| Ack {
                message: accepted.message,
            })
    }

    async fn post<B: Serialize, D: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        key: Option<&IdempotencyKey>,
    ) -> SyncOutcome<Accepted<D>> {
        match self.build_post(path, body, key) {
            Ok(request) => self.send(request).await,
            Err(e) => {
                warn!(error = %e, path, "could not build request");
                SyncOutcome::unreachable(&e)
            }
        }
    }

    fn build_post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        key: Option<&IdempotencyKey>,
    ) -> Result<HttpRequest, HttpError> {
        let url = self.base_url.join_segments([path])?;
        let mut request = HttpRequest::post(url)
            .with_json(body)?
            .with_timeout(self.timeout)?;
        if let Some(key) = key {
            request = request.with_header(IDEMPOTENCY_KEY_HEADER, key.as_str())?;
        }
        Ok(request)
    }

    async fn send<D: DeserializeOwned>(&self, request: HttpRequest) -> SyncOutcome<Accepted<D>> {
        let request_id = request.request_id().to_string();
        let path = request.url().path().to_string();
        match self.execute(request).await {
            Ok(response) => classify(&response, &request_id),
            Err(e) => {
                warn!(error = %e, path = %path, "remote call failed");
                SyncOutcome::unreachable(&e)
            }
        }
    }

    /// Runs the request under this client's timeout and a fresh cancel token.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let token = self.cancel.register();
        let request_id = request.request_id().to_string();
        let timeout_ms = request.timeout_ms();
        debug!(
            method = request.method().as_str(),
            url = request.url().as_str(),
            request_id = %request_id,
            "sending request"
        );

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(HttpError::Cancelled {
                request_id: request_id.clone(),
            }),
            res = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.shell.execute(request),
            ) => match res {
                Ok(result) => result,
                Err(_) => Err(HttpError::Timeout {
                    timeout_ms,
                    request_id: request_id.clone(),
                }),
            },
        };

        self.cancel.release(&token);
        result
    }
}

fn classify<D: DeserializeOwned>(
    response: &HttpResponse,
    request_id: &str,
) -> SyncOutcome<Accepted<D>> {
    let status = response.status();

    if response.is_transient() {
        return SyncOutcome::Unreachable {
            reason: format!("server unavailable (HTTP {})", status),
        };
    }

    if !response.is_success() {
        let message = response
            .json::<Envelope<serde_json::Value>>(request_id)
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| format!("HTTP {}", status));
        return SyncOutcome::ServerRejected { message, status };
    }

    match response.json::<Envelope<D>>(request_id) {
        Ok(envelope) if envelope.success => SyncOutcome::Success(Accepted {
            status,
            data: envelope.data,
            message: envelope.message,
        }),
        Ok(envelope) => SyncOutcome::ServerRejected {
            message: envelope
                .message
                .unwrap_or_else(|| "request rejected".to_string()),
            status,
        },
        Err(e) => SyncOutcome::unreachable(&e),
    }
}
