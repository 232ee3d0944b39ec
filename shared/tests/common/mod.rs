#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use fleet_driver::capabilities::{HttpError, HttpRequest, HttpResponse, HttpResult, HttpShell};
use fleet_driver::model::{EndTripPayload, ProblemReport, StartTripPayload, TripHistory, TripId};
use fleet_driver::{ClientConfig, DeviceStore, MemoryKv, Session};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Online,
    /// Every request fails at the transport level.
    Offline,
    /// Every mutating request is refused with this message.
    Rejecting(String),
    /// Requests are applied but the response never arrives.
    LoseResponses,
}

#[derive(Debug, Default)]
struct ServerState {
    drivers: HashMap<String, String>,
    active: HashMap<String, TripHistory>,
    history: HashMap<String, Vec<TripHistory>>,
    seen_keys: HashSet<String>,
    received_problems: HashSet<String>,
    log: Vec<String>,
    next_id: u64,
}

/// In-memory stand-in for the depot's fleet server.
#[derive(Debug, Clone)]
pub struct FakeFleetServer {
    state: Arc<Mutex<ServerState>>,
    mode: Arc<Mutex<Mode>>,
}

impl FakeFleetServer {
    pub fn new() -> Self {
        let server = Self {
            state: Arc::default(),
            mode: Arc::new(Mutex::new(Mode::Online)),
        };
        server.add_driver("M001", "Ana Souza");
        server
    }

    pub fn add_driver(&self, registration: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .drivers
            .insert(registration.to_string(), name.to_string());
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_online(&self, online: bool) {
        self.set_mode(if online { Mode::Online } else { Mode::Offline });
    }

    /// Paths of every request that reached the server, in order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn history_of(&self, registration: &str) -> Vec<TripHistory> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(registration)
            .cloned()
            .unwrap_or_default()
    }

    /// Distinct problem reports the server has received, alone or bundled.
    pub fn received_problem_count(&self) -> usize {
        self.state.lock().unwrap().received_problems.len()
    }

    fn handle(&self, request: &HttpRequest) -> Value {
        let mut state = self.state.lock().unwrap();
        let path = request.url().path().to_string();
        state.log.push(path.clone());

        if let Some(key) = request.idempotency_key() {
            if !state.seen_keys.insert(key.to_string()) {
                return json!({ "success": true, "message": "already processed" });
            }
        }

        let body: Value = request.json().unwrap_or(Value::Null);
        match path.as_str() {
            "/login" => {
                let registration = body["registrationNumber"].as_str().unwrap_or_default();
                match state.drivers.get(registration) {
                    Some(name) => json!({ "success": true, "data": { "name": name } }),
                    None => json!({ "success": false, "message": "Driver not found" }),
                }
            }
            "/saida" => {
                let payload: StartTripPayload = serde_json::from_value(body).unwrap();
                state.next_id += 1;
                let trip = TripHistory {
                    id: TripId::new(format!("srv-{}", state.next_id)),
                    vehicle_number: payload.vehicle_number,
                    start_time: payload.timestamp,
                    end_time: None,
                    problems: vec![],
                    distance: None,
                };
                state.active.insert(payload.driver_number, trip);
                json!({ "success": true, "message": "Trip registered" })
            }
            "/problema" => {
                let report: ProblemReport = serde_json::from_value(body).unwrap();
                state.received_problems.insert(report.id.to_string());
                if let Some(trip) = state.active.get_mut(&report.driver_number) {
                    if !trip.problems.iter().any(|p| p.id == report.id) {
                        trip.problems.push(report);
                    }
                }
                json!({ "success": true, "message": "Problem recorded" })
            }
            "/retorno" => {
                let payload: EndTripPayload = serde_json::from_value(body).unwrap();
                state.next_id += 1;
                let fallback_id = TripId::new(format!("srv-{}", state.next_id));
                let mut trip = state.active.remove(&payload.driver_number).unwrap_or(TripHistory {
                    id: fallback_id,
                    vehicle_number: payload.vehicle_number.clone(),
                    start_time: payload.timestamp,
                    end_time: None,
                    problems: vec![],
                    distance: None,
                });
                for problem in payload.problems {
                    state.received_problems.insert(problem.id.to_string());
                    if !trip.problems.iter().any(|p| p.id == problem.id) {
                        trip.problems.push(problem);
                    }
                }
                trip.end_time = Some(payload.timestamp);
                state
                    .history
                    .entry(payload.driver_number)
                    .or_default()
                    .push(trip);
                json!({ "success": true, "message": "Trip closed" })
            }
            "/sync" => json!({ "success": true, "message": "ok" }),
            other => match other.strip_prefix("/historico/") {
                Some(registration) => {
                    let trips = state.history.get(registration).cloned().unwrap_or_default();
                    json!({ "success": true, "data": trips })
                }
                None => json!({ "success": false, "message": "unknown route" }),
            },
        }
    }
}

#[async_trait::async_trait]
impl HttpShell for FakeFleetServer {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let mode = self.mode.lock().unwrap().clone();
        match mode {
            Mode::Offline => Err(HttpError::ConnectionError {
                host: request.url().host().to_string(),
                message: "network unreachable".into(),
            }),
            Mode::Rejecting(message) if request.idempotency_key().is_some() => {
                Ok(HttpResponse::json_body(
                    422,
                    &json!({ "success": false, "message": message }),
                ))
            }
            Mode::LoseResponses => {
                self.handle(&request);
                Err(HttpError::Timeout {
                    timeout_ms: request.timeout_ms(),
                    request_id: request.request_id().to_string(),
                })
            }
            _ => Ok(HttpResponse::json_body(200, &self.handle(&request))),
        }
    }
}

pub type TestSession = Session<MemoryKv, FakeFleetServer>;

pub fn config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.replay.jitter_max_ms = 0;
    config
}

pub fn session(server: &FakeFleetServer) -> TestSession {
    Session::new(DeviceStore::new(MemoryKv::new()), server.clone(), &config()).unwrap()
}
