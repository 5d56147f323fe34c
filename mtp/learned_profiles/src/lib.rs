//! Learned performance profiles, keyed by device fingerprint.
//!
//! Every session observes how a device actually behaves: how long the
//! handshake took, what throughput the chosen chunk size achieved, how many
//! transfers succeeded. Those observations accumulate here as exponentially
//! weighted moving averages so the policy resolver has an evidence-based
//! layer to contribute between the built-in defaults and the static quirk
//! catalog.
//!
//! The store is a single serialized JSON dictionary; one writer at a time,
//! bounded at [`MAX_RECORDS`] entries, with stale records expiring after
//! [`MAX_AGE_DAYS`] from creation or [`MAX_IDLE_DAYS`] without an update.
//! A firmware update changes the fingerprint hash (bcd is hashed in), so it
//! naturally starts a fresh record rather than polluting the old one.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
mod test;

/// Records expire this many days after creation.
pub const MAX_AGE_DAYS: i64 = 90;
/// Records expire after this many days without an update.
pub const MAX_IDLE_DAYS: i64 = 30;
/// The store keeps at most this many records; eviction removes the
/// least-recently-updated.
pub const MAX_RECORDS: usize = 1000;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("profile store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// What one session observed. Fields left `None` (and zero attempts) mean
/// the session has nothing to report on that axis.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSample {
    pub chunk_bytes: Option<f64>,
    pub handshake_ms: Option<f64>,
    pub throughput_p50: Option<f64>,
    pub throughput_p90: Option<f64>,
    pub transfers_attempted: u32,
    pub transfers_succeeded: u32,
}

impl SessionSample {
    /// An empty sample must merge as the identity.
    pub fn is_empty(&self) -> bool {
        *self == SessionSample::default()
    }
}

/// The accumulated profile for one device shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearnedProfile {
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sample_count: u32,
    pub chunk_bytes: f64,
    pub handshake_ms: f64,
    pub throughput_p50: f64,
    pub throughput_p90: f64,
    /// Fraction of attempted transfers that completed, in [0, 1].
    pub success_rate: f64,
}

impl LearnedProfile {
    fn new(fingerprint: &str, now: DateTime<Utc>) -> Self {
        LearnedProfile {
            fingerprint: fingerprint.to_string(),
            created_at: now,
            updated_at: now,
            sample_count: 0,
            chunk_bytes: 0.0,
            handshake_ms: 0.0,
            throughput_p50: 0.0,
            throughput_p90: 0.0,
            success_rate: 1.0,
        }
    }

    /// Folds one session's observations in. The weight of the new sample is
    /// `alpha = 1 / sample_count`, so early sessions move the averages a lot
    /// and a long history is stable.
    pub fn merge(&mut self, sample: &SessionSample, now: DateTime<Utc>) {
        if sample.is_empty() {
            return;
        }
        self.sample_count = self.sample_count.saturating_add(1);
        let alpha = 1.0 / self.sample_count as f64;
        let ewma = |old: f64, new: Option<f64>| match new {
            // The very first sample replaces the zero-initialized field.
            Some(new) if self.sample_count == 1 => new,
            Some(new) => old * (1.0 - alpha) + new * alpha,
            None => old,
        };
        self.chunk_bytes = ewma(self.chunk_bytes, sample.chunk_bytes);
        self.handshake_ms = ewma(self.handshake_ms, sample.handshake_ms);
        self.throughput_p50 = ewma(self.throughput_p50, sample.throughput_p50);
        self.throughput_p90 = ewma(self.throughput_p90, sample.throughput_p90);
        if sample.transfers_attempted > 0 {
            let observed = sample.transfers_succeeded as f64 / sample.transfers_attempted as f64;
            self.success_rate = if self.sample_count == 1 {
                observed
            } else {
                self.success_rate * (1.0 - alpha) + observed * alpha
            };
        }
        self.updated_at = now;
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::days(MAX_AGE_DAYS)
            || now - self.updated_at > Duration::days(MAX_IDLE_DAYS)
    }
}

/// The nearest-rank percentile of a set of observations; `q` in [0, 1].
/// Useful for building [`SessionSample`] throughput fields from per-chunk
/// measurements.
pub fn percentile(samples: &mut [f64], q: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let rank = ((q * samples.len() as f64).ceil() as usize).clamp(1, samples.len());
    Some(samples[rank - 1])
}

/// The persistent profile store.
pub struct ProfileStore {
    path: PathBuf,
    inner: Mutex<BTreeMap<String, LearnedProfile>>,
}

impl ProfileStore {
    /// Opens (or creates) the store at `path`, pruning expired records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref().to_path_buf();
        let mut map: BTreeMap<String, LearnedProfile> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        let now = Utc::now();
        let before = map.len();
        map.retain(|_, p| !p.expired(now));
        if map.len() != before {
            info!("pruned {} expired learned profile(s)", before - map.len());
        }
        Ok(ProfileStore {
            path,
            inner: Mutex::new(map),
        })
    }

    /// The current profile for a fingerprint hash, if one is alive.
    pub fn get(&self, fingerprint: &str) -> Option<LearnedProfile> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .get(fingerprint)
            .filter(|p| !p.expired(Utc::now()))
            .cloned()
    }

    /// Merges a session sample into the profile for `fingerprint`,
    /// creating the record on first sight, and persists the store.
    /// Returns the updated profile.
    pub fn record(
        &self,
        fingerprint: &str,
        sample: &SessionSample,
    ) -> Result<LearnedProfile, ProfileError> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        let profile = inner
            .entry(fingerprint.to_string())
            .or_insert_with(|| LearnedProfile::new(fingerprint, now));
        profile.merge(sample, now);
        let updated = profile.clone();

        if inner.len() > MAX_RECORDS {
            evict_oldest(&mut inner);
        }
        self.persist(&inner)?;
        Ok(updated)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, inner: &BTreeMap<String, LearnedProfile>) -> Result<(), ProfileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(inner)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn evict_oldest(map: &mut BTreeMap<String, LearnedProfile>) {
    while map.len() > MAX_RECORDS {
        let Some(oldest) = map
            .iter()
            .min_by_key(|(_, p)| p.updated_at)
            .map(|(k, _)| k.clone())
        else {
            return;
        };
        debug!("evicting least-recently-updated profile {oldest}");
        map.remove(&oldest);
    }
}
