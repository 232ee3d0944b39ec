use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::capabilities::HttpShell;
use crate::model::{by_severity, ProblemReport, TripHistory, TripId};
use crate::sync_client::{SyncClient, SyncOutcome};

#[derive(Debug, Clone, Default, PartialEq)]
pub enum HistoryState {
    #[default]
    NotLoaded,
    Loaded(Vec<TripHistory>),
    /// The server could not be reached; nothing is shown in place of real data.
    Unavailable { reason: String },
    Rejected { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub trip_count: usize,
    pub problem_count: usize,
    pub total_distance: f64,
    pub average_distance: f64,
}

impl HistoryStats {
    pub fn from_trips(trips: &[TripHistory]) -> Self {
        let trip_count = trips.len();
        let problem_count = trips.iter().map(|t| t.problems.len()).sum();
        let total_distance: f64 = trips.iter().filter_map(|t| t.distance).sum();
        let average_distance = if trip_count == 0 {
            0.0
        } else {
            total_distance / trip_count as f64
        };
        Self {
            trip_count,
            problem_count,
            total_distance,
            average_distance,
        }
    }

    /// Average distance rounded to the nearest kilometre for display.
    pub fn rounded_average_distance(&self) -> i64 {
        self.average_distance.round() as i64
    }
}

/// A problem in the history's problems tab, with the trip it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryProblem {
    pub trip_id: TripId,
    pub vehicle_number: String,
    pub trip_start: DateTime<Utc>,
    pub problem: ProblemReport,
}

#[derive(Debug, Default)]
pub struct HistoryView {
    state: HistoryState,
}

impl HistoryView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &HistoryState {
        &self.state
    }

    /// Replaces the current state with whatever the server answers.
    #[instrument(skip(self, client))]
    pub async fn load<S: HttpShell>(
        &mut self,
        client: &SyncClient<S>,
        registration_number: &str,
    ) -> &HistoryState {
        self.state = match client.get_history(registration_number).await {
            SyncOutcome::Success(trips) => {
                info!(trips = trips.len(), "history ready");
                HistoryState::Loaded(trips)
            }
            SyncOutcome::ServerRejected { message, status } => {
                warn!(status, "history request rejected");
                HistoryState::Rejected { message }
            }
            SyncOutcome::Unreachable { reason } => {
                warn!(reason = %reason, "history unavailable");
                HistoryState::Unavailable { reason }
            }
        };
        &self.state
    }

    /// Loads a fixed dataset, e.g. [`fixtures::demo_history`] for a demo build.
    pub fn show(&mut self, trips: Vec<TripHistory>) {
        self.state = HistoryState::Loaded(trips);
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, HistoryState::Loaded(_))
    }

    /// Trips in the order the server sent them; empty unless loaded.
    pub fn trips(&self) -> &[TripHistory] {
        match &self.state {
            HistoryState::Loaded(trips) => trips,
            _ => &[],
        }
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats::from_trips(self.trips())
    }

    /// Every problem across loaded trips, most severe first.
    pub fn problems_by_severity(&self) -> Vec<HistoryProblem> {
        let mut problems: Vec<_> = self
            .trips()
            .iter()
            .flat_map(|trip| {
                trip.problems.iter().map(move |p| HistoryProblem {
                    trip_id: trip.id.clone(),
                    vehicle_number: trip.vehicle_number.clone(),
                    trip_start: trip.start_time,
                    problem: p.clone(),
                })
            })
            .collect();
        problems.sort_by(|a, b| by_severity(&a.problem, &b.problem));
        problems
    }
}

/// Illustrative data for demos and screenshots. Never used as a fallback.
pub mod fixtures {
    use chrono::{TimeZone, Utc};

    use crate::model::{ProblemCategory, ProblemId, ProblemReport, Severity, TripHistory, TripId};

    fn at(day: u32, hour: u32, minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn demo_history(driver_number: &str) -> Vec<TripHistory> {
        vec![
            TripHistory {
                id: TripId::new("1"),
                vehicle_number: "05".into(),
                start_time: at(15, 8, 0),
                end_time: Some(at(15, 16, 0)),
                problems: vec![ProblemReport {
                    id: ProblemId::new("p1"),
                    vehicle_number: "05".into(),
                    driver_number: driver_number.into(),
                    category: ProblemCategory::Mechanical,
                    severity: Severity::Medium,
                    observation: "Strange engine noise when accelerating".into(),
                    reported_at: at(15, 12, 30),
                    images: vec![],
                }],
                distance: Some(120.0),
            },
            TripHistory {
                id: TripId::new("2"),
                vehicle_number: "03".into(),
                start_time: at(14, 7, 30),
                end_time: Some(at(14, 15, 45)),
                problems: vec![],
                distance: Some(98.0),
            },
            TripHistory {
                id: TripId::new("3"),
                vehicle_number: "05".into(),
                start_time: at(13, 8, 15),
                end_time: Some(at(13, 16, 30)),
                problems: vec![ProblemReport {
                    id: ProblemId::new("p2"),
                    vehicle_number: "05".into(),
                    driver_number: driver_number.into(),
                    category: ProblemCategory::Cleaning,
                    severity: Severity::Low,
                    observation: "Seats need a deep clean".into(),
                    reported_at: at(13, 15, 0),
                    images: vec![],
                }],
                distance: Some(105.0),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{Reply, ScriptedShell};
    use crate::config::ClientConfig;
    use crate::model::Severity;

    #[test]
    fn test_stats_average_rounds() {
        let stats = HistoryStats::from_trips(&fixtures::demo_history("M001"));
        assert_eq!(stats.trip_count, 3);
        assert_eq!(stats.problem_count, 2);
        assert_eq!(stats.total_distance, 323.0);
        assert!((stats.average_distance - 107.666).abs() < 0.01);
        assert_eq!(stats.rounded_average_distance(), 108);
    }

    #[test]
    fn test_stats_empty() {
        let stats = HistoryStats::from_trips(&[]);
        assert_eq!(stats, HistoryStats::default());
        assert_eq!(stats.rounded_average_distance(), 0);
    }

    #[test]
    fn test_missing_distance_counts_as_zero() {
        let mut trips = fixtures::demo_history("M001");
        trips[1].distance = None;
        let stats = HistoryStats::from_trips(&trips);
        assert_eq!(stats.total_distance, 225.0);
        assert_eq!(stats.rounded_average_distance(), 75);
    }

    #[test]
    fn test_problems_tab_orders_by_severity() {
        let mut view = HistoryView::new();
        assert!(view.problems_by_severity().is_empty());

        view.show(fixtures::demo_history("M001"));
        let problems = view.problems_by_severity();
        let severities: Vec<_> = problems.iter().map(|p| p.problem.severity).collect();
        assert_eq!(severities, vec![Severity::Medium, Severity::Low]);
        assert_eq!(problems[0].trip_id.as_str(), "1");
        assert_eq!(problems[1].vehicle_number, "05");
    }

    #[test]
    fn test_problems_tab_matches_report_sort() {
        let mut trips = fixtures::demo_history("M001");
        let mut extra = trips[0].problems[0].clone();
        extra.id = crate::model::ProblemId::new("p3");
        extra.severity = Severity::Critical;
        trips[2].problems.push(extra);

        let mut view = HistoryView::new();
        view.show(trips.clone());
        let tab: Vec<_> = view.problems_by_severity().into_iter().map(|p| p.problem).collect();

        let mut flat: Vec<_> = trips.into_iter().flat_map(|t| t.problems).collect();
        crate::model::sort_by_severity(&mut flat);
        assert_eq!(tab, flat);
        assert_eq!(tab[0].severity, Severity::Critical);
    }

    #[test]
    fn test_fixture_durations() {
        let trips = fixtures::demo_history("M001");
        let labels: Vec<_> = trips.iter().map(|t| t.duration_label()).collect();
        assert_eq!(labels, vec!["8h 0m", "8h 15m", "8h 15m"]);
        assert!(trips.iter().all(|t| t.problems.iter().all(|p| p.driver_number == "M001")));
    }

    #[tokio::test]
    async fn test_load_failure_shows_no_data() {
        let shell = ScriptedShell::new(vec![Reply::offline(), Reply::rejected("unknown driver")]);
        let client = SyncClient::new(shell, &ClientConfig::default()).unwrap();
        let mut view = HistoryView::new();
        assert_eq!(view.state(), &HistoryState::NotLoaded);

        let state = view.load(&client, "M001").await.clone();
        assert!(matches!(state, HistoryState::Unavailable { .. }));
        assert!(view.trips().is_empty());
        assert_eq!(view.stats().trip_count, 0);

        let state = view.load(&client, "M001").await.clone();
        assert_eq!(
            state,
            HistoryState::Rejected {
                message: "unknown driver".into()
            }
        );
    }

    #[tokio::test]
    async fn test_load_success() {
        let trips = serde_json::to_value(fixtures::demo_history("M001")).unwrap();
        let shell = ScriptedShell::new(vec![Reply::ok_data(trips)]);
        let client = SyncClient::new(shell, &ClientConfig::default()).unwrap();
        let mut view = HistoryView::new();

        view.load(&client, "M001").await;
        assert!(view.is_loaded());
        assert_eq!(view.trips(), fixtures::demo_history("M001").as_slice());
        assert_eq!(view.stats().rounded_average_distance(), 108);
    }
}
