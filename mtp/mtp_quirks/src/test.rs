//! Unit tests for match rules, specificity ranking, and catalog loading.

use device_identity::Fingerprint;

use super::*;

fn pixel_fp() -> Fingerprint {
    Fingerprint {
        vid: 0x18d1,
        pid: 0x4ee1,
        bcd_device: 0x0440,
        interface_class: 0x06,
        interface_subclass: 0x01,
        interface_protocol: 0x01,
        bulk_in: 0x81,
        bulk_out: 0x01,
        interrupt_in: Some(0x82),
        info_hash: None,
    }
}

#[test]
fn builtin_catalog_matches_known_devices() {
    let db = QuirkDb::builtin();
    let record = db.lookup(&pixel_fp()).expect("pixel record");
    assert_eq!(record.name, "pixel-family-handshake-reset");
    assert_eq!(
        record.policy.reset_reopen_on_open_session_io_error,
        Some(true)
    );

    let xiaomi = Fingerprint {
        vid: 0x2717,
        pid: 0xff40,
        ..pixel_fp()
    };
    let record = db.lookup(&xiaomi).expect("xiaomi record");
    assert_eq!(record.policy.write_to_subfolder_only, Some(true));
    assert_eq!(
        record.policy.preferred_write_folder.as_deref(),
        Some("Download")
    );
}

#[test]
fn unmatched_fingerprint_yields_nothing() {
    let unknown = Fingerprint {
        vid: 0xdead,
        pid: 0xbeef,
        ..pixel_fp()
    };
    assert!(QuirkDb::builtin().lookup(&unknown).is_none());
}

#[test]
fn more_specific_rule_wins() {
    let json = r#"{
        "version": 1,
        "records": [
            {
                "name": "vendor-wide",
                "match": { "vid": 6353 },
                "policy": { "max_chunk_bytes": 1048576 },
                "provenance": { "author": "a", "date": "2025-01-01", "status": "stable" }
            },
            {
                "name": "exact-model",
                "match": { "vid": 6353, "pid": 20193 },
                "policy": { "max_chunk_bytes": 2097152 },
                "provenance": { "author": "a", "date": "2025-01-01", "status": "stable" }
            }
        ]
    }"#;
    let db = QuirkDb::from_json(json).unwrap();
    let record = db.lookup(&pixel_fp()).unwrap();
    assert_eq!(record.name, "exact-model");
}

#[test]
fn equal_specificity_resolves_to_catalog_order() {
    let json = r#"{
        "version": 1,
        "records": [
            {
                "name": "first",
                "match": { "vid": 6353 },
                "policy": {},
                "provenance": { "author": "a", "date": "2025-01-01", "status": "stable" }
            },
            {
                "name": "second",
                "match": { "vid": 6353 },
                "policy": {},
                "provenance": { "author": "a", "date": "2025-01-01", "status": "stable" }
            }
        ]
    }"#;
    let db = QuirkDb::from_json(json).unwrap();
    assert_eq!(db.lookup(&pixel_fp()).unwrap().name, "first");
}

#[test]
fn deprecated_records_never_match() {
    let json = r#"{
        "version": 1,
        "records": [
            {
                "name": "retired",
                "match": { "vid": 6353 },
                "policy": { "needs_short_reads": true },
                "provenance": { "author": "a", "date": "2023-01-01", "status": "deprecated" }
            }
        ]
    }"#;
    let db = QuirkDb::from_json(json).unwrap();
    assert!(db.lookup(&pixel_fp()).is_none());
    // Still loaded, so diagnostics can show it.
    assert_eq!(db.records().len(), 1);
}

#[test]
fn bcd_ranges_bound_the_match() {
    let json = r#"{
        "version": 1,
        "records": [
            {
                "name": "old-firmware-only",
                "match": { "vid": 6353, "bcd_max": 1024 },
                "policy": { "needs_short_reads": true },
                "provenance": { "author": "a", "date": "2025-01-01", "status": "stable" }
            }
        ]
    }"#;
    let db = QuirkDb::from_json(json).unwrap();
    // bcd 0x0440 > 0x0400: out of range.
    assert!(db.lookup(&pixel_fp()).is_none());
    let older = Fingerprint {
        bcd_device: 0x0300,
        ..pixel_fp()
    };
    assert!(db.lookup(&older).is_some());
}

#[test]
fn unknown_fields_are_tolerated() {
    let json = r#"{
        "version": 1,
        "records": [
            {
                "name": "from-the-future",
                "match": { "vid": 6353 },
                "policy": { "hovercraft_mode": true, "max_chunk_bytes": 262144 },
                "provenance": { "author": "a", "date": "2027-01-01", "status": "stable" }
            }
        ]
    }"#;
    let db = QuirkDb::from_json(json).unwrap();
    let record = db.lookup(&pixel_fp()).unwrap();
    assert_eq!(record.policy.max_chunk_bytes, Some(262_144));
    assert_eq!(record.policy.unknown.len(), 1);
}

#[test]
fn version_mismatch_is_rejected() {
    let json = r#"{ "version": 2, "records": [] }"#;
    assert!(matches!(
        QuirkDb::from_json(json),
        Err(QuirkError::Version(2))
    ));
}
