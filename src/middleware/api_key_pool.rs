// Quota-aware API key pool
//
// Rotates round-robin across keys and parks a key after the provider reports
// quota exhaustion, until its retry-after deadline passes.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Longest a key stays parked, whatever the provider asks for
pub const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Availability of an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyHealth {
    Available,
    Parked,
}

/// API key with quota tracking
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub key: String,
    pub index: usize,
    parked_until: Option<Instant>,
    total_requests: u64,
    total_quota_hits: u64,
}

impl ApiKey {
    fn new(key: String, index: usize) -> Self {
        Self {
            key,
            index,
            parked_until: None,
            total_requests: 0,
            total_quota_hits: 0,
        }
    }

    fn health_at(&self, now: Instant) -> KeyHealth {
        match self.parked_until {
            Some(until) if until > now => KeyHealth::Parked,
            _ => KeyHealth::Available,
        }
    }

    fn remaining_at(&self, now: Instant) -> Duration {
        self.parked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

/// Snapshot of one key, without the secret
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyStats {
    pub index: usize,
    pub health: KeyHealth,
    pub total_requests: u64,
    pub total_quota_hits: u64,
    #[serde(rename = "remaining_cooldown_seconds", serialize_with = "as_seconds")]
    pub remaining_cooldown: Duration,
}

fn as_seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// API key pool with quota-aware routing
pub struct ApiKeyPool {
    keys: Arc<RwLock<Vec<ApiKey>>>,
    round_robin_index: AtomicUsize,
    default_cooldown: Duration,
}

impl ApiKeyPool {
    pub fn new(keys: Vec<String>, default_cooldown: Duration) -> Self {
        let api_keys = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| ApiKey::new(key, i))
            .collect();

        Self {
            keys: Arc::new(RwLock::new(api_keys)),
            round_robin_index: AtomicUsize::new(0),
            default_cooldown,
        }
    }

    /// Pick the next available key
    ///
    /// Returns `Err(wait)` with the shortest remaining cooldown when every key
    /// is parked (or `Duration::ZERO` when the pool is empty).
    pub async fn acquire(&self) -> Result<(usize, String), Duration> {
        let now = Instant::now();
        let mut keys = self.keys.write().await;

        let available: Vec<usize> = keys
            .iter()
            .filter(|k| k.health_at(now) == KeyHealth::Available)
            .map(|k| k.index)
            .collect();

        if available.is_empty() {
            let wait = keys
                .iter()
                .map(|k| k.remaining_at(now))
                .min()
                .unwrap_or_default();
            warn!(
                "No API keys available ({} parked, next in {:.1}s)",
                keys.len(),
                wait.as_secs_f64()
            );
            return Err(wait);
        }

        let slot = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
        let chosen = available[slot % available.len()];
        let total = keys.len();
        let key = &mut keys[chosen];
        if key.parked_until.take().is_some() {
            info!("API key {} cooldown elapsed, back in rotation", key.index);
        }
        key.total_requests += 1;
        debug!(
            "Using API key {} ({} of {} available)",
            key.index,
            available.len(),
            total
        );
        Ok((key.index, key.key.clone()))
    }

    /// Park a key after a quota error
    ///
    /// Falls back to the pool's default cooldown when the provider gave no hint,
    /// and never parks for longer than [`MAX_COOLDOWN`].
    pub async fn park(&self, key_index: usize, retry_after: Option<Duration>) {
        let cooldown = retry_after
            .unwrap_or(self.default_cooldown)
            .min(MAX_COOLDOWN);
        let now = Instant::now();
        let until = now
            .checked_add(cooldown)
            .or_else(|| now.checked_add(self.default_cooldown))
            .unwrap_or(now);
        let mut keys = self.keys.write().await;
        if let Some(key) = keys.get_mut(key_index) {
            key.parked_until = Some(until);
            key.total_quota_hits += 1;
            warn!(
                "API key {} parked for {:.1}s ({} quota hits)",
                key.index,
                cooldown.as_secs_f64(),
                key.total_quota_hits
            );
        }
    }

    /// Get statistics for all keys
    pub async fn stats(&self) -> Vec<KeyStats> {
        let now = Instant::now();
        let keys = self.keys.read().await;
        keys.iter()
            .map(|k| KeyStats {
                index: k.index,
                health: k.health_at(now),
                total_requests: k.total_requests,
                total_quota_hits: k.total_quota_hits,
                remaining_cooldown: k.remaining_at(now),
            })
            .collect()
    }
}
