//! Unit tests for the layered merge, clamping, provenance, and override
//! parsing.

use std::time::Duration;

use device_identity::Fingerprint;
use learned_profiles::LearnedProfile;
use mtp_quirks::{PolicyPatch, QuirkDb};
use ptp_wire::{ops, DeviceInfo};

use super::*;

fn fp(vid: u16, pid: u16, class: u8) -> Fingerprint {
    Fingerprint {
        vid,
        pid,
        bcd_device: 0x0100,
        interface_class: class,
        interface_subclass: 0x01,
        interface_protocol: 0x01,
        bulk_in: 0x81,
        bulk_out: 0x01,
        interrupt_in: Some(0x82),
        info_hash: None,
    }
}

fn android_fp() -> Fingerprint {
    fp(0x18d1, 0x4ee1, 0xff)
}

#[test]
fn defaults_apply_when_no_layer_speaks() {
    let eff = resolve(&fp(0x1234, 0x5678, 0xff), None, None, &QuirkDb::default(), None);
    assert_eq!(eff.max_chunk_bytes, 1024 * 1024);
    assert_eq!(eff.io_timeout_ms, 8_000);
    assert_eq!(eff.source_of("max_chunk_bytes"), Source::Default);
    assert!(!eff.flags.supports_partial_read_64);
}

#[test]
fn probe_layer_sets_capability_flags() {
    let info = DeviceInfo {
        operations_supported: vec![ops::GET_PARTIAL_OBJECT, ops::GET_OBJECT_PROP_LIST],
        ..Default::default()
    };
    let probe = ProbedCapabilities::from_device_info(&info);
    assert!(!probe.supports_partial_read_64);
    assert!(probe.supports_partial_read_32);

    let eff = resolve(
        &fp(0x1234, 0x5678, 0xff),
        Some(&probe),
        None,
        &QuirkDb::default(),
        None,
    );
    assert!(eff.flags.supports_partial_read_32);
    assert!(eff.flags.supports_get_partial_object);
    assert!(eff.flags.prefers_prop_list_enumeration);
    assert!(!eff.flags.supports_partial_read_64);
    assert_eq!(eff.source_of("supports_partial_read_32"), Source::Probe);
}

#[test]
fn quirk_layer_overrides_probe() {
    // The device does not advertise partial-64, but the quirk record for
    // the pixel family says it works anyway.
    let info = DeviceInfo {
        operations_supported: vec![ops::GET_PARTIAL_OBJECT],
        ..Default::default()
    };
    let probe = ProbedCapabilities::from_device_info(&info);
    let eff = resolve(
        &android_fp(),
        Some(&probe),
        None,
        &QuirkDb::builtin(),
        None,
    );
    assert!(eff.flags.supports_partial_read_64);
    assert_eq!(eff.source_of("supports_partial_read_64"), Source::Quirk);
    // Probe's opinion on untouched fields survives.
    assert!(eff.flags.supports_partial_read_32);
}

#[test]
fn user_override_outranks_everything() {
    let overrides = parse_overrides("max-chunk-bytes=262144,disable-partial-read").unwrap();
    let eff = resolve(
        &android_fp(),
        None,
        None,
        &QuirkDb::builtin(),
        Some(&overrides),
    );
    assert_eq!(eff.max_chunk_bytes, 262_144);
    assert_eq!(eff.source_of("max_chunk_bytes"), Source::UserOverride);
    assert!(!eff.flags.supports_partial_read_64);
    assert!(!eff.flags.supports_partial_read_32);
    assert_eq!(
        eff.source_of("supports_partial_read_64"),
        Source::UserOverride
    );
}

/// Resolved tuning numbers always land inside the global safe ranges.
#[test]
fn clamps_hold_for_extreme_inputs() {
    for (chunk, io_ms, deadline_ms, stabilize_ms) in [
        (1u64, 1u64, 1u64, 0u64),
        (u32::MAX as u64, 1 << 40, 1 << 40, 1 << 40),
        (128 * 1024, 1_000, 5_000, 0),
        (16 << 20, 60_000, 300_000, 5_000),
    ] {
        let overrides = parse_overrides(&format!(
            "max-chunk-bytes={chunk},io-timeout-ms={io_ms},overall-deadline-ms={deadline_ms},stabilize-ms={stabilize_ms}"
        ))
        .unwrap();
        let eff = resolve(
            &fp(1, 2, 0xff),
            None,
            None,
            &QuirkDb::default(),
            Some(&overrides),
        );
        assert!((bounds::CHUNK_MIN..=bounds::CHUNK_MAX).contains(&eff.max_chunk_bytes));
        assert!((bounds::IO_TIMEOUT_MIN_MS..=bounds::IO_TIMEOUT_MAX_MS).contains(&eff.io_timeout_ms));
        assert!((bounds::DEADLINE_MIN_MS..=bounds::DEADLINE_MAX_MS).contains(&eff.overall_deadline_ms));
        assert!((bounds::STABILIZE_MIN_MS..=bounds::STABILIZE_MAX_MS).contains(&eff.stabilize_ms));
    }
}

#[test]
fn camera_without_quirk_gets_camera_defaults() {
    let eff = resolve(&fp(0x04b0, 0x0102, 0x06), None, None, &QuirkDb::builtin(), None);
    assert!(eff.flags.needs_longer_open_timeout);
    assert_eq!(eff.handshake_timeout_ms, 15_000);
    assert_eq!(eff.max_chunk_bytes, 512 * 1024);
    assert_eq!(eff.source_of("handshake_timeout_ms"), Source::Quirk);
    // The doubled handshake timeout for slow openers.
    assert_eq!(eff.handshake_timeout(), Duration::from_millis(30_000));
}

#[test]
fn android_device_does_not_get_camera_defaults() {
    let eff = resolve(&fp(0x9999, 0x0001, 0xff), None, None, &QuirkDb::builtin(), None);
    assert!(!eff.flags.needs_longer_open_timeout);
}

#[test]
fn learned_layer_contributes_chunk_after_enough_evidence() {
    let mut profile = LearnedProfile {
        fingerprint: "fp".into(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        sample_count: 5,
        chunk_bytes: (4 * 1024 * 1024) as f64,
        handshake_ms: 200.0,
        throughput_p50: 2e7,
        throughput_p90: 3e7,
        success_rate: 1.0,
    };
    let eff = resolve(
        &fp(1, 2, 0xff),
        None,
        Some(&profile),
        &QuirkDb::default(),
        None,
    );
    assert_eq!(eff.max_chunk_bytes, 4 * 1024 * 1024);
    assert_eq!(eff.source_of("max_chunk_bytes"), Source::Learned);

    // Too few samples: the layer stays silent.
    profile.sample_count = 1;
    let eff = resolve(
        &fp(1, 2, 0xff),
        None,
        Some(&profile),
        &QuirkDb::default(),
        None,
    );
    assert_eq!(eff.source_of("max_chunk_bytes"), Source::Default);

    // Unreliable device: the layer stays silent.
    profile.sample_count = 5;
    profile.success_rate = 0.5;
    let eff = resolve(
        &fp(1, 2, 0xff),
        None,
        Some(&profile),
        &QuirkDb::default(),
        None,
    );
    assert_eq!(eff.source_of("max_chunk_bytes"), Source::Default);
}

/// The resolver is a pure function.
#[test]
fn resolution_is_deterministic() {
    let overrides = parse_overrides("io-timeout-ms=9000").unwrap();
    let a = resolve(
        &android_fp(),
        None,
        None,
        &QuirkDb::builtin(),
        Some(&overrides),
    );
    let b = resolve(
        &android_fp(),
        None,
        None,
        &QuirkDb::builtin(),
        Some(&overrides),
    );
    assert_eq!(a, b);
}

#[test]
fn override_parsing_rejects_junk() {
    assert_eq!(
        parse_overrides("warp-speed=9"),
        Err(PolicyError::UnknownKey("warp-speed".into()))
    );
    assert!(matches!(
        parse_overrides("io-timeout-ms=fast"),
        Err(PolicyError::BadValue { .. })
    ));
    assert!(matches!(
        parse_overrides("disable-partial-read=maybe"),
        Err(PolicyError::BadValue { .. })
    ));
    // Empty input and stray commas are fine.
    assert_eq!(parse_overrides("").unwrap(), PolicyPatch::default());
    assert_eq!(parse_overrides(" , ,").unwrap(), PolicyPatch::default());
}

#[test]
fn override_flags_accept_bare_and_boolean_forms() {
    let patch = parse_overrides("disable-partial-write").unwrap();
    assert_eq!(patch.supports_partial_write, Some(false));
    let patch = parse_overrides("disable-partial-write=false").unwrap();
    assert_eq!(patch.supports_partial_write, None);
}
