//! Anomaly detector — flags statistically or structurally suspicious
//! patterns in a tenant's change stream.
//!
//! Pure over the fetched record set: detection itself cannot fail, so
//! the reporter only has to guard the fetch. The tuned thresholds are
//! configuration, defaulted to the values the platform shipped with.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::types::*;

/// Detection thresholds. Product-tuned; treat as configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// A day is anomalous when its count exceeds this multiple of the
    /// average daily count.
    pub frequency_multiplier: f64,
    /// Sliding window for the bulk-edit check.
    pub bulk_window: Duration,
    /// Changes by one actor inside the window needed to flag a burst.
    pub bulk_threshold: usize,
    /// Share of compared key fields that must match for a reverted state.
    pub revert_match_ratio: f64,
    /// Fields compared when testing whether a change restores an
    /// earlier state.
    pub key_fields: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            frequency_multiplier: 3.0,
            bulk_window: Duration::hours(1),
            bulk_threshold: 10,
            revert_match_ratio: 0.8,
            key_fields: vec![
                "name".into(),
                "configuration".into(),
                "pricing_model".into(),
                "rate_schedule".into(),
            ],
        }
    }
}

/// Daily-volume check result, embedded in the anomaly details.
#[derive(Debug, Clone, Serialize)]
pub struct FrequencyCheck {
    pub is_anomalous: bool,
    pub average: f64,
    pub peak: usize,
    pub threshold: f64,
    pub daily_counts: BTreeMap<String, usize>,
}

/// One qualifying burst of changes by a single actor.
#[derive(Debug, Clone, Serialize)]
pub struct BulkWindow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub change_count: usize,
}

/// One detected A→B→A triple.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackCycle {
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub original_change: Uuid,
    pub reverted_change: Uuid,
    pub rollback_change: Uuid,
    pub rollback_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: DetectorConfig,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Run every heuristic over a tenant's change stream. Each detected
    /// condition yields exactly one signal.
    pub fn detect(&self, changes: &[ChangeRecord]) -> Vec<AnomalySignal> {
        let mut anomalies = Vec::new();
        let detected_at = Utc::now();

        let frequency = self.check_frequency(changes);
        if frequency.is_anomalous {
            anomalies.push(AnomalySignal {
                kind: AnomalyKind::HighChangeFrequency,
                severity: AnomalyKind::HighChangeFrequency.severity(),
                description: "Unusually high number of configuration changes detected".into(),
                detected_at,
                details: json!(frequency),
            });
        }

        let bulk = self.detect_bulk_changes(changes);
        if !bulk.is_empty() {
            anomalies.push(AnomalySignal {
                kind: AnomalyKind::BulkChanges,
                severity: AnomalyKind::BulkChanges.severity(),
                description: "Multiple rapid changes detected from single user".into(),
                detected_at,
                details: json!(bulk),
            });
        }

        let cycles = self.detect_rollback_cycles(changes);
        if !cycles.is_empty() {
            anomalies.push(AnomalySignal {
                kind: AnomalyKind::ConfigurationRollback,
                severity: AnomalyKind::ConfigurationRollback.severity(),
                description: "Configuration rollbacks detected".into(),
                detected_at,
                details: json!(cycles),
            });
        }

        anomalies
    }

    /// Daily volume check: anomalous when the peak day exceeds
    /// `frequency_multiplier ×` the average over days with data.
    pub fn check_frequency(&self, changes: &[ChangeRecord]) -> FrequencyCheck {
        let mut daily_counts: BTreeMap<String, usize> = BTreeMap::new();
        for change in changes {
            *daily_counts.entry(change.day_key()).or_insert(0) += 1;
        }

        if daily_counts.is_empty() {
            return FrequencyCheck {
                is_anomalous: false,
                average: 0.0,
                peak: 0,
                threshold: 0.0,
                daily_counts,
            };
        }

        let total: usize = daily_counts.values().sum();
        let average = total as f64 / daily_counts.len() as f64;
        let peak = daily_counts.values().copied().max().unwrap_or(0);
        let threshold = average * self.config.frequency_multiplier;

        FrequencyCheck {
            is_anomalous: (peak as f64) > threshold,
            average: round2(average),
            peak,
            threshold: round2(threshold),
            daily_counts,
        }
    }

    /// Per-actor burst scan. For every change at time t the window
    /// `[t, t + bulk_window)` is counted; a count above `bulk_threshold`
    /// records the window. Quadratic per actor by intent — the stream
    /// for one tenant and window is small.
    pub fn detect_bulk_changes(&self, changes: &[ChangeRecord]) -> BTreeMap<String, Vec<BulkWindow>> {
        let mut by_actor: BTreeMap<String, Vec<&ChangeRecord>> = BTreeMap::new();
        for change in changes {
            if let Some(actor) = change.actor_id {
                by_actor.entry(actor.to_string()).or_default().push(change);
            }
        }

        let mut result = BTreeMap::new();
        for (actor, mut records) in by_actor {
            records.sort_by_key(|r| (r.occurred_at, r.seq));

            let mut windows = Vec::new();
            for record in &records {
                let window_start = record.occurred_at;
                let window_end = window_start + self.config.bulk_window;
                let count = records
                    .iter()
                    .filter(|r| r.occurred_at >= window_start && r.occurred_at < window_end)
                    .count();
                if count > self.config.bulk_threshold {
                    windows.push(BulkWindow {
                        window_start,
                        window_end,
                        change_count: count,
                    });
                }
            }

            if !windows.is_empty() {
                result.insert(actor, windows);
            }
        }
        result
    }

    /// A→B→A scan: group update records per entity, walk consecutive
    /// triples in time order, and flag the third change when it restores
    /// the first one's state on the compared key fields.
    pub fn detect_rollback_cycles(&self, changes: &[ChangeRecord]) -> Vec<RollbackCycle> {
        let mut by_entity: BTreeMap<(EntityKind, Uuid), Vec<&ChangeRecord>> = BTreeMap::new();
        for change in changes {
            if change.event == ChangeEvent::Updated {
                by_entity
                    .entry((change.entity_kind, change.entity_id))
                    .or_default()
                    .push(change);
            }
        }

        let mut cycles = Vec::new();
        for ((entity_kind, entity_id), mut history) in by_entity {
            history.sort_by_key(|r| (r.occurred_at, r.seq));

            for triple in history.windows(3) {
                let (c1, c2, c3) = (triple[0], triple[1], triple[2]);
                if self.is_revert(c1, c2, c3) {
                    cycles.push(RollbackCycle {
                        entity_kind,
                        entity_id,
                        original_change: c1.id,
                        reverted_change: c2.id,
                        rollback_change: c3.id,
                        rollback_time: c3.occurred_at,
                    });
                }
            }
        }
        cycles
    }

    /// Does `c3` revert `c2` back toward `c1`'s state? Compares the key
    /// fields present in both end states; declared a revert when the
    /// match ratio reaches the configured threshold and at least one
    /// field was compared.
    fn is_revert(&self, c1: &ChangeRecord, c2: &ChangeRecord, c3: &ChangeRecord) -> bool {
        let (Some(original), Some(_intermediate), Some(candidate)) =
            (&c1.new_state, &c2.new_state, &c3.new_state)
        else {
            return false;
        };

        let mut compared = 0usize;
        let mut matches = 0usize;
        for field in &self.config.key_fields {
            if let (Some(a), Some(b)) = (original.get(field), candidate.get(field)) {
                compared += 1;
                if a == b {
                    matches += 1;
                }
            }
        }

        compared > 0 && (matches as f64 / compared as f64) >= self.config.revert_match_ratio
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update_at(
        time: &str,
        seq: i64,
        entity: Uuid,
        actor: Option<Uuid>,
        new_state: Option<StateMap>,
    ) -> ChangeRecord {
        ChangeRecord {
            id: Uuid::new_v4(),
            entity_kind: EntityKind::UtilityService,
            entity_id: entity,
            tenant_id: Uuid::nil(),
            actor_id: actor,
            event: ChangeEvent::Updated,
            old_state: None,
            new_state,
            occurred_at: time.parse().unwrap(),
            seq,
            note: None,
            metadata: json!({}),
        }
    }

    fn named_state(name: &str) -> StateMap {
        let mut state = StateMap::new();
        state.insert("name".into(), json!(name));
        state
    }

    fn day_spread(counts: &[usize]) -> Vec<ChangeRecord> {
        let entity = Uuid::new_v4();
        let mut changes = Vec::new();
        for (day, count) in counts.iter().enumerate() {
            for i in 0..*count {
                changes.push(update_at(
                    &format!("2026-06-{:02}T08:{:02}:00Z", day + 1, i),
                    0,
                    entity,
                    None,
                    None,
                ));
            }
        }
        changes
    }

    #[test]
    fn empty_stream_is_not_anomalous() {
        let detector = AnomalyDetector::new();
        assert!(detector.detect(&[]).is_empty());
        assert!(!detector.check_frequency(&[]).is_anomalous);
    }

    #[test]
    fn frequency_fires_when_peak_exceeds_three_times_average() {
        // 9 days of 1 change, 1 day of 10: avg = 1.9, threshold = 5.7, peak = 10.
        let mut counts = vec![1usize; 9];
        counts.push(10);
        let detector = AnomalyDetector::new();
        let check = detector.check_frequency(&day_spread(&counts));
        assert_eq!(check.average, 1.9);
        assert_eq!(check.threshold, 5.7);
        assert_eq!(check.peak, 10);
        assert!(check.is_anomalous);

        // And it yields exactly one frequency signal.
        let signals = detector.detect(&day_spread(&counts));
        let frequency: Vec<_> = signals
            .iter()
            .filter(|s| s.kind == AnomalyKind::HighChangeFrequency)
            .collect();
        assert_eq!(frequency.len(), 1);
        assert_eq!(frequency[0].severity, AnomalySeverity::Warning);
    }

    #[test]
    fn frequency_quiet_when_peak_is_within_threshold() {
        // 9 days of 2 changes, 1 day of 7: avg = 2.5, threshold = 7.5, peak = 7.
        let mut counts = vec![2usize; 9];
        counts.push(7);
        let check = AnomalyDetector::new().check_frequency(&day_spread(&counts));
        assert_eq!(check.peak, 7);
        assert_eq!(check.threshold, 7.5);
        assert!(!check.is_anomalous);
    }

    #[test]
    fn bulk_burst_by_one_actor_is_flagged() {
        let actor = Uuid::new_v4();
        let entity = Uuid::new_v4();
        let mut changes = Vec::new();
        // 11 changes within 20 minutes.
        for i in 0..11 {
            changes.push(update_at(
                &format!("2026-06-01T09:{i:02}:00Z"),
                i,
                entity,
                Some(actor),
                None,
            ));
        }
        let detector = AnomalyDetector::new();
        let bulk = detector.detect_bulk_changes(&changes);
        assert_eq!(bulk.len(), 1);
        let windows = &bulk[&actor.to_string()];
        assert_eq!(windows[0].change_count, 11);

        let signals = detector.detect(&changes);
        assert!(signals
            .iter()
            .any(|s| s.kind == AnomalyKind::BulkChanges && s.severity == AnomalySeverity::High));
    }

    #[test]
    fn ten_changes_in_window_is_not_a_burst() {
        let actor = Uuid::new_v4();
        let entity = Uuid::new_v4();
        let changes: Vec<ChangeRecord> = (0..10)
            .map(|i| {
                update_at(
                    &format!("2026-06-01T09:{i:02}:00Z"),
                    i,
                    entity,
                    Some(actor),
                    None,
                )
            })
            .collect();
        assert!(AnomalyDetector::new().detect_bulk_changes(&changes).is_empty());
    }

    #[test]
    fn bulk_window_is_half_open() {
        let actor = Uuid::new_v4();
        let entity = Uuid::new_v4();
        let mut changes: Vec<ChangeRecord> = (0..10)
            .map(|i| {
                update_at(
                    &format!("2026-06-01T09:{i:02}:00Z"),
                    i,
                    entity,
                    Some(actor),
                    None,
                )
            })
            .collect();
        // Exactly one hour after the first change: outside [t, t+1h).
        changes.push(update_at("2026-06-01T10:00:00Z", 10, entity, Some(actor), None));
        assert!(AnomalyDetector::new().detect_bulk_changes(&changes).is_empty());
    }

    #[test]
    fn a_b_a_cycle_is_detected() {
        let entity = Uuid::new_v4();
        let changes = vec![
            update_at("2026-06-01T09:00:00Z", 1, entity, None, Some(named_state("A"))),
            update_at("2026-06-01T10:00:00Z", 2, entity, None, Some(named_state("B"))),
            update_at("2026-06-01T11:00:00Z", 3, entity, None, Some(named_state("A"))),
        ];
        let detector = AnomalyDetector::new();
        let cycles = detector.detect_rollback_cycles(&changes);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].original_change, changes[0].id);
        assert_eq!(cycles[0].reverted_change, changes[1].id);
        assert_eq!(cycles[0].rollback_change, changes[2].id);

        let signals = detector.detect(&changes);
        assert!(signals.iter().any(|s| s.kind == AnomalyKind::ConfigurationRollback
            && s.severity == AnomalySeverity::Medium));
    }

    #[test]
    fn partial_field_match_below_threshold_is_not_a_cycle() {
        let entity = Uuid::new_v4();
        let mut original = named_state("A");
        original.insert("pricing_model".into(), json!("fixed"));
        let mut candidate = named_state("A");
        candidate.insert("pricing_model".into(), json!("tiered"));
        // 1 of 2 compared fields match: 50 % < 80 %.
        let changes = vec![
            update_at("2026-06-01T09:00:00Z", 1, entity, None, Some(original)),
            update_at("2026-06-01T10:00:00Z", 2, entity, None, Some(named_state("B"))),
            update_at("2026-06-01T11:00:00Z", 3, entity, None, Some(candidate)),
        ];
        assert!(AnomalyDetector::new()
            .detect_rollback_cycles(&changes)
            .is_empty());
    }

    #[test]
    fn cycle_needs_at_least_one_compared_field() {
        let entity = Uuid::new_v4();
        let mut other = StateMap::new();
        other.insert("unrelated".into(), json!(1));
        let changes = vec![
            update_at("2026-06-01T09:00:00Z", 1, entity, None, Some(other.clone())),
            update_at("2026-06-01T10:00:00Z", 2, entity, None, Some(other.clone())),
            update_at("2026-06-01T11:00:00Z", 3, entity, None, Some(other)),
        ];
        assert!(AnomalyDetector::new()
            .detect_rollback_cycles(&changes)
            .is_empty());
    }
}
