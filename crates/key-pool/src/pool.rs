//! Key rotation state and selection
//!
//! The pool keeps one `last_limited_at` timestamp per key and a single
//! rotation cursor. Both sit behind one mutex so `acquire` and
//! `report_limited` never interleave.
//!
//! A key is eligible once strictly more than `cooldown` has passed since it
//! was last reported. There is no explicit "cooldown over" transition: the
//! check runs at every scan.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::Secret;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Cooldown applied to a key after the upstream rate-limits it.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Observed status of a pool key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStatus {
    Eligible,
    CoolingDown { remaining: Duration },
}

impl KeyStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Eligible => "eligible",
            KeyStatus::CoolingDown { .. } => "cooling_down",
        }
    }
}

/// A key handed out by `acquire`, ready to attach to a request.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub slot: usize,
    /// Masked form of the key, safe for logs
    pub label: String,
    pub key: Secret<String>,
}

/// Mutable rotation state. `last_limited[i]` belongs to `keys[i]`; `None`
/// means the key has never been limited (or was force-evicted).
struct Rotation {
    cursor: usize,
    last_limited: Vec<Option<Instant>>,
}

/// Fixed pool of upstream API keys with cooldown-aware round-robin selection.
pub struct KeyPool {
    keys: Vec<Secret<String>>,
    labels: Vec<String>,
    rotation: Mutex<Rotation>,
    cooldown: Duration,
    rate_limited_reports: AtomicU64,
    forced_evictions: AtomicU64,
}

impl KeyPool {
    /// Build a pool from the configured keys.
    ///
    /// Rejects an empty key list and duplicate keys: identity is the key
    /// value, so two identical entries could never be told apart.
    pub fn new(keys: Vec<Secret<String>>, cooldown: Duration) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::EmptyPool);
        }
        for (slot, key) in keys.iter().enumerate() {
            if keys[..slot].iter().any(|k| k.expose() == key.expose()) {
                return Err(Error::DuplicateKey {
                    slot,
                    label: mask_key(key.expose()),
                });
            }
        }

        let labels: Vec<String> = keys.iter().map(|k| mask_key(k.expose())).collect();
        info!(
            keys = keys.len(),
            cooldown_secs = cooldown.as_secs(),
            "key pool initialized"
        );
        Ok(Self {
            rotation: Mutex::new(Rotation {
                cursor: 0,
                last_limited: vec![None; keys.len()],
            }),
            keys,
            labels,
            cooldown,
            rate_limited_reports: AtomicU64::new(0),
            forced_evictions: AtomicU64::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false: construction rejects empty pools.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Pick a key believed usable right now.
    ///
    /// Scans one full cycle starting at the cursor and returns the first
    /// eligible key. The cursor does not move here; only `report_limited`
    /// advances it.
    ///
    /// If every key is cooling down, the key with the earliest
    /// `last_limited_at` (lowest slot on ties) has its cooldown cleared and
    /// is returned anyway. The upstream may still reject it, but the caller
    /// always gets a key.
    pub async fn acquire(&self) -> SelectedKey {
        let mut rotation = self.rotation.lock().await;
        let now = Instant::now();
        let n = self.keys.len();

        for offset in 0..n {
            let slot = (rotation.cursor + offset) % n;
            if self.remaining_cooldown(rotation.last_limited[slot], now).is_none() {
                debug!(slot, key = %self.labels[slot], "key selected");
                return self.selected(slot);
            }
        }

        let slot = rotation
            .last_limited
            .iter()
            .enumerate()
            .min_by_key(|(slot, limited_at)| (**limited_at, *slot))
            .map(|(slot, _)| slot)
            .unwrap_or(rotation.cursor);
        rotation.last_limited[slot] = None;

        self.forced_evictions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("key_pool_forced_evictions_total").increment(1);
        warn!(
            slot,
            key = %self.labels[slot],
            "all keys cooling down, force-evicting earliest-limited key"
        );
        self.selected(slot)
    }

    /// Record that the upstream rate-limited `key`.
    ///
    /// Starts the key's cooldown and advances the cursor one position so the
    /// next scan begins elsewhere. Unknown keys are rejected with
    /// `UnknownKey` and leave the pool untouched.
    pub async fn report_limited(&self, key: &str) -> Result<()> {
        let slot = self
            .keys
            .iter()
            .position(|k| k.expose() == key)
            .ok_or_else(|| Error::UnknownKey(mask_key(key)))?;

        let mut rotation = self.rotation.lock().await;
        rotation.last_limited[slot] = Some(Instant::now());
        rotation.cursor = (rotation.cursor + 1) % self.keys.len();

        self.rate_limited_reports.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("key_pool_rate_limited_total", "slot" => slot.to_string())
            .increment(1);
        info!(
            slot,
            key = %self.labels[slot],
            cooldown_secs = self.cooldown.as_secs(),
            next_cursor = rotation.cursor,
            "key rate limited, entering cooldown"
        );
        Ok(())
    }

    /// Current status of every key, in pool order.
    pub async fn statuses(&self) -> Vec<KeyStatus> {
        let rotation = self.rotation.lock().await;
        let now = Instant::now();
        rotation
            .last_limited
            .iter()
            .map(|limited_at| match self.remaining_cooldown(*limited_at, now) {
                Some(remaining) => KeyStatus::CoolingDown { remaining },
                None => KeyStatus::Eligible,
            })
            .collect()
    }

    /// Number of `report_limited` calls accepted since startup.
    pub fn rate_limited_reports(&self) -> u64 {
        self.rate_limited_reports.load(Ordering::Relaxed)
    }

    /// Number of times `acquire` fell back to forced eviction.
    pub fn forced_evictions(&self) -> u64 {
        self.forced_evictions.load(Ordering::Relaxed)
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all eligible → healthy, some eligible → degraded,
    /// none eligible → unhealthy (requests still get force-evicted keys).
    pub async fn health(&self) -> serde_json::Value {
        let statuses = self.statuses().await;

        let mut keys = Vec::with_capacity(statuses.len());
        let mut eligible = 0usize;
        for (slot, status) in statuses.iter().enumerate() {
            match status {
                KeyStatus::Eligible => {
                    eligible += 1;
                    keys.push(serde_json::json!({
                        "slot": slot,
                        "key": self.labels[slot],
                        "status": status.label(),
                    }));
                }
                KeyStatus::CoolingDown { remaining } => {
                    keys.push(serde_json::json!({
                        "slot": slot,
                        "key": self.labels[slot],
                        "status": status.label(),
                        "cooldown_remaining_secs": remaining.as_secs(),
                    }));
                }
            }
        }

        let total = statuses.len();
        let status = if eligible == total {
            "healthy"
        } else if eligible > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "keys_total": total,
            "keys_eligible": eligible,
            "keys_cooling_down": total - eligible,
            "cooldown_secs": self.cooldown.as_secs(),
            "rate_limited_reports": self.rate_limited_reports(),
            "forced_evictions": self.forced_evictions(),
            "keys": keys,
        })
    }

    /// Time left in the cooldown, or `None` when the key is eligible.
    fn remaining_cooldown(&self, limited_at: Option<Instant>, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(limited_at?);
        if elapsed > self.cooldown {
            None
        } else {
            Some(self.cooldown - elapsed)
        }
    }

    fn selected(&self, slot: usize) -> SelectedKey {
        SelectedKey {
            slot,
            label: self.labels[slot].clone(),
            key: self.keys[slot].clone(),
        }
    }
}

/// Mask an API key for logs: `sk-...wxyz`. Short keys are fully hidden.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool(keys: &[&str]) -> KeyPool {
        KeyPool::new(
            keys.iter().map(|k| Secret::new(k.to_string())).collect(),
            DEFAULT_COOLDOWN,
        )
        .unwrap()
    }

    async fn acquire_key(pool: &KeyPool) -> String {
        pool.acquire().await.key.expose().clone()
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = KeyPool::new(vec![], DEFAULT_COOLDOWN).err().unwrap();
        assert!(matches!(err, Error::EmptyPool), "got: {err:?}");
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let keys = vec![
            Secret::new("sk-aaaaaaaaaaaa-1".to_string()),
            Secret::new("sk-bbbbbbbbbbbb-2".to_string()),
            Secret::new("sk-aaaaaaaaaaaa-1".to_string()),
        ];
        let err = KeyPool::new(keys, DEFAULT_COOLDOWN).err().unwrap();
        match err {
            Error::DuplicateKey { slot, label } => {
                assert_eq!(slot, 2);
                assert_eq!(label, "sk-...aa-1");
            }
            other => panic!("expected DuplicateKey, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_pool_returns_key_at_cursor_without_advancing() {
        let pool = pool(&["A", "B", "C"]);

        // Cursor only moves on report_limited, so repeated acquires stay put.
        assert_eq!(acquire_key(&pool).await, "A");
        assert_eq!(acquire_key(&pool).await, "A");
        assert_eq!(pool.acquire().await.slot, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn two_key_rotation_scenario() {
        let pool = pool(&["A", "B"]);

        assert_eq!(acquire_key(&pool).await, "A");
        pool.report_limited("A").await.unwrap();
        assert_eq!(acquire_key(&pool).await, "B");
        assert_eq!(pool.forced_evictions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn just_limited_key_is_skipped_while_others_are_eligible() {
        for limited in ["A", "B", "C"] {
            let pool = pool(&["A", "B", "C"]);
            pool.report_limited(limited).await.unwrap();
            for _ in 0..3 {
                assert_ne!(acquire_key(&pool).await, limited);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scan_wraps_past_end_of_pool() {
        let pool = pool(&["A", "B", "C"]);

        // cursor -> 2 with C cooling: the scan wraps to slot 0
        pool.report_limited("C").await.unwrap();
        pool.report_limited("B").await.unwrap();
        assert_eq!(acquire_key(&pool).await, "A");
    }

    #[tokio::test(start_paused = true)]
    async fn scan_skips_cooling_keys_from_cursor() {
        let pool = pool(&["A", "B", "C"]);

        // cursor -> 1, B cooling: scan from 1 skips B and returns C
        pool.report_limited("B").await.unwrap();
        assert_eq!(acquire_key(&pool).await, "C");
    }

    #[tokio::test(start_paused = true)]
    async fn single_key_pool_force_evicts_itself() {
        let pool = pool(&["X"]);

        pool.report_limited("X").await.unwrap();
        assert_eq!(
            pool.statuses().await[0].label(),
            "cooling_down",
            "X must be cooling after the report"
        );

        assert_eq!(acquire_key(&pool).await, "X");
        assert_eq!(pool.forced_evictions(), 1);
        assert_eq!(pool.statuses().await, vec![KeyStatus::Eligible]);

        // Timestamp was reset, so the next acquire needs no eviction.
        assert_eq!(acquire_key(&pool).await, "X");
        assert_eq!(pool.forced_evictions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_eviction_picks_earliest_limited_key() {
        let pool = pool(&["A", "B", "C"]);

        pool.report_limited("B").await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        pool.report_limited("C").await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        pool.report_limited("A").await.unwrap();

        let selected = pool.acquire().await;
        assert_eq!(selected.key.expose(), "B");
        assert_eq!(selected.slot, 1);
        assert_eq!(pool.forced_evictions(), 1);

        let statuses = pool.statuses().await;
        assert_eq!(statuses[1], KeyStatus::Eligible, "B must be reset to never-limited");
        assert_eq!(statuses[0].label(), "cooling_down");
        assert_eq!(statuses[2].label(), "cooling_down");
    }

    #[tokio::test(start_paused = true)]
    async fn forced_eviction_breaks_ties_by_lowest_slot() {
        let pool = pool(&["A", "B", "C"]);

        // Paused clock: every report lands on the same instant. The fourth
        // report leaves the cursor at slot 1, away from the tie winner.
        for key in ["A", "B", "C", "B"] {
            pool.report_limited(key).await.unwrap();
        }

        let selected = pool.acquire().await;
        assert_eq!(selected.slot, 0);
        assert_eq!(selected.key.expose(), "A");
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_boundary_is_strict() {
        let pool = pool(&["X"]);

        pool.report_limited("X").await.unwrap();
        tokio::time::advance(DEFAULT_COOLDOWN).await;
        assert_eq!(
            pool.statuses().await[0],
            KeyStatus::CoolingDown {
                remaining: Duration::ZERO
            },
            "exactly T + cooldown is still cooling"
        );
        pool.acquire().await;
        assert_eq!(pool.forced_evictions(), 1, "ineligible at T + cooldown");

        pool.report_limited("X").await.unwrap();
        tokio::time::advance(DEFAULT_COOLDOWN + Duration::from_millis(1)).await;
        assert_eq!(pool.statuses().await[0], KeyStatus::Eligible);
        pool.acquire().await;
        assert_eq!(pool.forced_evictions(), 1, "eligible after T + cooldown");
    }

    #[tokio::test(start_paused = true)]
    async fn cooled_key_returns_to_rotation() {
        let pool = pool(&["A", "B"]);

        pool.report_limited("A").await.unwrap();
        pool.report_limited("B").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        // cursor is back at 0 and both cooldowns are over
        assert_eq!(acquire_key(&pool).await, "A");
        assert_eq!(pool.forced_evictions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_always_returns_a_pool_member() {
        for n in 1..=6usize {
            let keys: Vec<String> = (0..n).map(|i| format!("sk-test-key-{i:04}")).collect();
            let pool = KeyPool::new(
                keys.iter().cloned().map(Secret::new).collect(),
                DEFAULT_COOLDOWN,
            )
            .unwrap();

            for round in 0..(3 * n) {
                let selected = pool.acquire().await;
                assert!(selected.slot < n);
                assert_eq!(selected.key.expose(), &keys[selected.slot]);
                if round % 2 == 0 {
                    pool.report_limited(selected.key.expose()).await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn unknown_key_report_is_rejected_without_side_effects() {
        let pool = pool(&["A", "B"]);

        let err = pool
            .report_limited("sk-not-in-the-pool-at-all")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKey(_)), "got: {err:?}");
        assert!(
            !err.to_string().contains("sk-not-in-the-pool-at-all"),
            "error must not leak the key: {err}"
        );
        assert_eq!(pool.rate_limited_reports(), 0);
        assert_eq!(acquire_key(&pool).await, "A");
    }

    #[tokio::test]
    async fn concurrent_acquire_and_report_keep_pool_consistent() {
        let keys = ["K0", "K1", "K2", "K3"];
        let pool = Arc::new(self::pool(&keys));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let selected = pool.acquire().await;
                    pool.report_limited(selected.key.expose()).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(pool.rate_limited_reports(), 16 * 50);
        assert_eq!(pool.statuses().await.len(), keys.len());
        let selected = pool.acquire().await;
        assert!(keys.contains(&selected.key.expose().as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn health_reports_statuses_and_counters() {
        let pool = pool(&["sk-proj-aaaaaaaaaaaa1111", "sk-proj-bbbbbbbbbbbb2222"]);

        let health = pool.health().await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["keys_total"], 2);
        assert_eq!(health["keys_eligible"], 2);

        pool.report_limited("sk-proj-aaaaaaaaaaaa1111").await.unwrap();
        let health = pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["keys_cooling_down"], 1);
        assert_eq!(health["rate_limited_reports"], 1);
        let first = &health["keys"][0];
        assert_eq!(first["status"], "cooling_down");
        assert_eq!(first["key"], "sk-...1111");
        assert_eq!(first["cooldown_remaining_secs"], 60);

        pool.report_limited("sk-proj-bbbbbbbbbbbb2222").await.unwrap();
        let health = pool.health().await;
        assert_eq!(health["status"], "unhealthy");

        let rendered = health.to_string();
        assert!(!rendered.contains("aaaaaaaaaaaa"), "health must not leak keys");
    }

    #[tokio::test(start_paused = true)]
    async fn pool_counters_reach_prometheus() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let pool = pool(&["X"]);
        pool.report_limited("X").await.unwrap();
        pool.acquire().await;

        let output = handle.render();
        assert!(output.contains("key_pool_rate_limited_total"), "got: {output}");
        assert!(output.contains("slot=\"0\""), "got: {output}");
        assert!(output.contains("key_pool_forced_evictions_total"), "got: {output}");
    }

    #[test]
    fn mask_key_hides_middle_of_long_keys() {
        assert_eq!(mask_key("sk-proj-abcdefghijklmnop"), "sk-...mnop");
        assert_eq!(mask_key("short-key"), "***");
        assert_eq!(mask_key(""), "***");
    }
}
