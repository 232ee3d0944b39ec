use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::capabilities::{HttpShell, KvBackend};
use crate::config::{ConfigError, ReplayConfig};
use crate::device_store::DeviceStore;
use crate::model::{DeadLetter, DeadLetterReason, OfflineQueueEntry, QueuedAction};
use crate::sync_client::{SyncClient, SyncOutcome};

/// What one replay pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub delivered: usize,
    pub dead_lettered: usize,
    pub skipped_duplicates: usize,
    /// Set when the pass stopped on an entry that is waiting out its backoff.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub remaining: usize,
}

impl ReplayReport {
    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }
}

/// Drains the offline queue in order against the fleet server.
///
/// The head of the queue blocks everything behind it: an unreachable server
/// ends the pass so actions are never delivered out of order.
pub struct OfflineReplayer {
    config: ReplayConfig,
    delivered: lru::LruCache<String, DateTime<Utc>>,
}

impl OfflineReplayer {
    pub fn new(config: ReplayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache_size = NonZeroUsize::new(config.delivered_cache_size)
            .ok_or_else(|| ConfigError::Validation("delivered_cache_size must be > 0".into()))?;
        Ok(Self {
            config,
            delivered: lru::LruCache::new(cache_size),
        })
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn was_delivered(&self, idempotency_key: &str) -> bool {
        self.delivered.contains(idempotency_key)
    }

    #[instrument(skip_all, fields(now = %now))]
    pub async fn replay<K, S>(
        &mut self,
        store: &mut DeviceStore<K>,
        client: &SyncClient<S>,
        now: DateTime<Utc>,
    ) -> ReplayReport
    where
        K: KvBackend,
        S: HttpShell,
    {
        let mut report = ReplayReport::default();

        for mut entry in store.offline_queue() {
            if !entry.is_due(now) {
                report.next_attempt_at = entry.next_attempt_at;
                break;
            }

            let key = entry.idempotency_key.as_str().to_string();
            if self.delivered.contains(&key) {
                info!(entry_id = %entry.id, "dropping entry already delivered");
                store.remove_offline_entry(&entry.id);
                report.skipped_duplicates += 1;
                continue;
            }

            match client.deliver(&entry.action, &entry.idempotency_key).await {
                SyncOutcome::Success(_) => {
                    self.delivered.put(key, now);
                    settle_delivered(store, &entry);
                    info!(entry_id = %entry.id, action = entry.action.tag(), "queued action delivered");
                    report.delivered += 1;
                }
                SyncOutcome::ServerRejected { message, status } => {
                    warn!(
                        entry_id = %entry.id,
                        action = entry.action.tag(),
                        status,
                        "server rejected queued action"
                    );
                    retire(store, entry, DeadLetterReason::ServerRejected { message }, now);
                    report.dead_lettered += 1;
                }
                SyncOutcome::Unreachable { reason } => {
                    entry.attempts = entry.attempts.saturating_add(1);
                    entry.last_error = Some(reason);

                    if entry.attempts >= self.config.max_attempts {
                        let attempts = entry.attempts;
                        retire(store, entry, DeadLetterReason::MaxAttempts { attempts }, now);
                        report.dead_lettered += 1;
                        break;
                    }

                    let backoff = self.calculate_backoff(entry.attempts);
                    let next = chrono::Duration::from_std(backoff)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d));
                    entry.next_attempt_at = next;
                    store.update_offline_entry(&entry);
                    report.next_attempt_at = next;
                    warn!(
                        entry_id = %entry.id,
                        attempts = entry.attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "server unreachable, pausing replay"
                    );
                    break;
                }
            }
        }

        report.remaining = store.offline_queue().len();
        if report.delivered > 0 || report.dead_lettered > 0 {
            info!(
                delivered = report.delivered,
                dead_lettered = report.dead_lettered,
                remaining = report.remaining,
                "replay pass finished"
            );
        }
        report
    }

    /// `base * 2^(attempts-1)`, capped, plus random jitter.
    pub fn calculate_backoff(&self, attempts: u32) -> Duration {
        use rand::{Rng, SeedableRng};

        let jitter = if self.config.jitter_max_ms == 0 {
            0
        } else {
            let mut rng = rand::rngs::StdRng::from_entropy();
            rng.gen_range(0..=self.config.jitter_max_ms)
        };

        let exponent = attempts.saturating_sub(1).min(16);
        let base_delay = self.config.base_backoff_ms.saturating_mul(1u64 << exponent);
        let capped_delay = base_delay.min(self.config.max_backoff_ms);

        Duration::from_millis(capped_delay.saturating_add(jitter))
    }
}

/// Removes a delivered entry and anything it makes redundant locally.
fn settle_delivered<K: KvBackend>(store: &mut DeviceStore<K>, entry: &OfflineQueueEntry) {
    if let QueuedAction::ReportProblem(problem) = &entry.action {
        // Delivered on its own, so it must not ride along with the trip end.
        store.remove_pending_problem(&problem.id);
    }
    if !store.remove_offline_entry(&entry.id) {
        warn!(entry_id = %entry.id, "delivered entry could not be removed from the queue");
    }
}

fn retire<K: KvBackend>(
    store: &mut DeviceStore<K>,
    entry: OfflineQueueEntry,
    reason: DeadLetterReason,
    now: DateTime<Utc>,
) {
    warn!(entry_id = %entry.id, reason = ?reason, "moving entry to dead letters");
    store.remove_offline_entry(&entry.id);
    store.add_dead_letter(&DeadLetter {
        entry,
        reason,
        retired_at: now,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{Reply, ScriptedShell};
    use crate::capabilities::MemoryKv;
    use crate::config::ClientConfig;
    use crate::model::{
        IdempotencyKey, ProblemCategory, ProblemId, ProblemReport, Severity, StartTripPayload,
    };
    use std::sync::Arc;

    fn no_jitter() -> ReplayConfig {
        ReplayConfig {
            jitter_max_ms: 0,
            ..ReplayConfig::default()
        }
    }

    fn setup(
        replies: Vec<Reply>,
    ) -> (
        DeviceStore<MemoryKv>,
        SyncClient<Arc<ScriptedShell>>,
        Arc<ScriptedShell>,
    ) {
        let shell = Arc::new(ScriptedShell::new(replies));
        let client = SyncClient::new(shell.clone(), &ClientConfig::default()).unwrap();
        (DeviceStore::new(MemoryKv::new()), client, shell)
    }

    fn start_entry(vehicle: &str, now: DateTime<Utc>) -> OfflineQueueEntry {
        OfflineQueueEntry::new(
            QueuedAction::StartTrip(StartTripPayload {
                vehicle_number: vehicle.into(),
                driver_number: "M001".into(),
                timestamp: now,
            }),
            IdempotencyKey::generate(),
            now,
        )
    }

    fn problem_entry(now: DateTime<Utc>) -> (ProblemReport, OfflineQueueEntry) {
        let report = ProblemReport {
            id: ProblemId::generate(),
            vehicle_number: "05".into(),
            driver_number: "M001".into(),
            category: ProblemCategory::Electrical,
            severity: Severity::High,
            observation: "dash lights flicker".into(),
            reported_at: now,
            images: vec![],
        };
        let entry = OfflineQueueEntry::new(
            QueuedAction::ReportProblem(report.clone()),
            IdempotencyKey::generate(),
            now,
        );
        (report, entry)
    }

    #[tokio::test]
    async fn test_replays_in_order_with_original_keys() {
        let now = Utc::now();
        let (mut store, client, shell) = setup(vec![Reply::ok("a"), Reply::ok("b")]);
        let first = start_entry("05", now);
        let second = start_entry("07", now);
        store.add_to_offline_queue(&first);
        store.add_to_offline_queue(&second);

        let mut replayer = OfflineReplayer::new(no_jitter()).unwrap();
        let report = replayer.replay(&mut store, &client, now).await;

        assert_eq!(report.delivered, 2);
        assert!(report.is_drained());
        let keys: Vec<_> = shell
            .requests()
            .iter()
            .map(|r| r.idempotency_key().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            keys,
            vec![
                first.idempotency_key.as_str().to_string(),
                second.idempotency_key.as_str().to_string()
            ]
        );
        assert!(replayer.was_delivered(first.idempotency_key.as_str()));
    }

    #[tokio::test]
    async fn test_unreachable_backs_off_and_stops_pass() {
        let now = Utc::now();
        let (mut store, client, shell) = setup(vec![Reply::offline()]);
        store.add_to_offline_queue(&start_entry("05", now));
        store.add_to_offline_queue(&start_entry("07", now));

        let mut replayer = OfflineReplayer::new(no_jitter()).unwrap();
        let report = replayer.replay(&mut store, &client, now).await;

        assert_eq!(shell.requests().len(), 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(report.next_attempt_at, Some(now + chrono::Duration::seconds(1)));

        let head = &store.offline_queue()[0];
        assert_eq!(head.attempts, 1);
        assert!(head.last_error.is_some());

        // Not due yet: nothing is sent.
        let report = replayer.replay(&mut store, &client, now).await;
        assert_eq!(shell.requests().len(), 1);
        assert_eq!(report.remaining, 2);
    }

    #[tokio::test]
    async fn test_rejected_entry_is_dead_lettered_and_pass_continues() {
        let now = Utc::now();
        let (mut store, client, _) = setup(vec![Reply::rejected("vehicle unknown"), Reply::ok("ok")]);
        let bad = start_entry("99", now);
        store.add_to_offline_queue(&bad);
        store.add_to_offline_queue(&start_entry("05", now));

        let mut replayer = OfflineReplayer::new(no_jitter()).unwrap();
        let report = replayer.replay(&mut store, &client, now).await;

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.delivered, 1);
        assert!(store.offline_queue().is_empty());

        let letters = store.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].entry.id, bad.id);
        assert_eq!(
            letters[0].reason,
            DeadLetterReason::ServerRejected {
                message: "vehicle unknown".into()
            }
        );
    }

    #[tokio::test]
    async fn test_max_attempts_dead_letters() {
        let now = Utc::now();
        let (mut store, client, _) = setup(vec![]);
        let mut entry = start_entry("05", now);
        entry.attempts = 9;
        store.add_to_offline_queue(&entry);

        let mut replayer = OfflineReplayer::new(no_jitter()).unwrap();
        let report = replayer.replay(&mut store, &client, now).await;

        assert_eq!(report.dead_lettered, 1);
        assert!(store.offline_queue().is_empty());
        assert_eq!(
            store.dead_letters()[0].reason,
            DeadLetterReason::MaxAttempts { attempts: 10 }
        );
    }

    #[tokio::test]
    async fn test_delivered_problem_leaves_pending_list() {
        let now = Utc::now();
        let (mut store, client, _) = setup(vec![Reply::ok("noted")]);
        let (report, entry) = problem_entry(now);
        store.add_pending_problem(&report);
        store.add_to_offline_queue(&entry);

        let mut replayer = OfflineReplayer::new(no_jitter()).unwrap();
        replayer.replay(&mut store, &client, now).await;

        assert!(store.pending_problems().is_empty());
        assert!(store.offline_queue().is_empty());
    }

    #[tokio::test]
    async fn test_already_delivered_key_is_not_resent() {
        let now = Utc::now();
        let (mut store, client, shell) = setup(vec![Reply::ok("ok")]);
        let entry = start_entry("05", now);
        store.add_to_offline_queue(&entry);

        let mut replayer = OfflineReplayer::new(no_jitter()).unwrap();
        replayer.replay(&mut store, &client, now).await;

        // Same entry reappears, e.g. its removal was lost.
        store.add_to_offline_queue(&entry);
        let report = replayer.replay(&mut store, &client, now).await;

        assert_eq!(report.skipped_duplicates, 1);
        assert_eq!(shell.requests().len(), 1);
        assert!(store.offline_queue().is_empty());
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let replayer = OfflineReplayer::new(no_jitter()).unwrap();
        assert_eq!(replayer.calculate_backoff(1), Duration::from_millis(1_000));
        assert_eq!(replayer.calculate_backoff(2), Duration::from_millis(2_000));
        assert_eq!(replayer.calculate_backoff(4), Duration::from_millis(8_000));
        assert_eq!(replayer.calculate_backoff(40), Duration::from_millis(300_000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let replayer = OfflineReplayer::new(ReplayConfig::default()).unwrap();
        for _ in 0..50 {
            let ms = replayer.calculate_backoff(1).as_millis();
            assert!((1_000..=2_000).contains(&ms));
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ReplayConfig {
            max_attempts: 0,
            ..ReplayConfig::default()
        };
        assert!(OfflineReplayer::new(config).is_err());
    }
}
