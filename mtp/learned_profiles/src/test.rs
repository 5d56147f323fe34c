//! Unit tests for EWMA merging and store maintenance.

use chrono::{Duration, Utc};

use super::*;

fn sample(chunk: f64, handshake: f64) -> SessionSample {
    SessionSample {
        chunk_bytes: Some(chunk),
        handshake_ms: Some(handshake),
        throughput_p50: Some(20e6),
        throughput_p90: Some(28e6),
        transfers_attempted: 4,
        transfers_succeeded: 4,
    }
}

fn temp_store_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "learned_profiles_test_{tag}_{}.json",
        std::process::id()
    ))
}

/// Merging an empty session sample changes no field.
#[test]
fn empty_sample_is_identity() {
    let now = Utc::now();
    let mut profile = LearnedProfile::new("fp", now);
    profile.merge(&sample(1e6, 350.0), now);
    let before = profile.clone();
    profile.merge(&SessionSample::default(), now + Duration::hours(1));
    assert_eq!(profile, before);
}

#[test]
fn first_sample_replaces_zero_initialization() {
    let now = Utc::now();
    let mut profile = LearnedProfile::new("fp", now);
    profile.merge(&sample(2e6, 400.0), now);
    assert_eq!(profile.sample_count, 1);
    assert_eq!(profile.chunk_bytes, 2e6);
    assert_eq!(profile.handshake_ms, 400.0);
    assert_eq!(profile.success_rate, 1.0);
}

#[test]
fn alpha_is_reciprocal_of_sample_count() {
    let now = Utc::now();
    let mut profile = LearnedProfile::new("fp", now);
    profile.merge(&sample(1000.0, 100.0), now);
    // Second sample: alpha = 1/2.
    profile.merge(&sample(2000.0, 300.0), now);
    assert_eq!(profile.chunk_bytes, 1500.0);
    assert_eq!(profile.handshake_ms, 200.0);
    // Third sample: alpha = 1/3.
    profile.merge(&sample(3000.0, 100.0), now);
    assert!((profile.chunk_bytes - 2000.0).abs() < 1e-9);
}

#[test]
fn failed_transfers_drag_the_success_rate() {
    let now = Utc::now();
    let mut profile = LearnedProfile::new("fp", now);
    profile.merge(&sample(1e6, 100.0), now);
    profile.merge(
        &SessionSample {
            transfers_attempted: 4,
            transfers_succeeded: 1,
            ..Default::default()
        },
        now,
    );
    assert_eq!(profile.success_rate, 0.625);
}

#[test]
fn expiry_honours_age_and_idleness() {
    let created = Utc::now() - Duration::days(91);
    let mut profile = LearnedProfile::new("fp", created);
    profile.updated_at = Utc::now();
    assert!(profile.expired(Utc::now()));

    let mut idle = LearnedProfile::new("fp", Utc::now() - Duration::days(10));
    idle.updated_at = Utc::now() - Duration::days(31);
    assert!(idle.expired(Utc::now()));

    let fresh = LearnedProfile::new("fp", Utc::now());
    assert!(!fresh.expired(Utc::now()));
}

#[test]
fn store_round_trips_across_opens() {
    let path = temp_store_path("roundtrip");
    std::fs::remove_file(&path).ok();
    {
        let store = ProfileStore::open(&path).unwrap();
        store.record("fp-a", &sample(1e6, 250.0)).unwrap();
    }
    let store = ProfileStore::open(&path).unwrap();
    let profile = store.get("fp-a").expect("profile survived restart");
    assert_eq!(profile.sample_count, 1);
    assert_eq!(profile.chunk_bytes, 1e6);
    std::fs::remove_file(&path).ok();
}

#[test]
fn percentile_uses_nearest_rank() {
    let mut samples = vec![10.0, 20.0, 30.0, 40.0];
    assert_eq!(percentile(&mut samples, 0.5), Some(20.0));
    assert_eq!(percentile(&mut samples, 0.9), Some(40.0));
    assert_eq!(percentile(&mut [], 0.5), None);
}
