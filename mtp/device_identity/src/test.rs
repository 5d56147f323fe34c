//! Unit tests for fingerprint canonicalization and the identity store.

use std::path::PathBuf;

use uuid::Uuid;

use super::*;

fn fingerprint() -> Fingerprint {
    Fingerprint {
        vid: 0x18d1,
        pid: 0x4ee1,
        bcd_device: 0x0404,
        interface_class: 0x06,
        interface_subclass: 0x01,
        interface_protocol: 0x01,
        bulk_in: 0x81,
        bulk_out: 0x01,
        interrupt_in: Some(0x82),
        info_hash: None,
    }
}

fn temp_store_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "device_identity_test_{tag}_{}.json",
        Uuid::new_v4().simple()
    ))
}

#[test]
fn canonical_form_is_stable() {
    assert_eq!(
        fingerprint().canonical(),
        "18d1:4ee1:0404/06.01.01/81-01-82"
    );
    let no_evt = Fingerprint {
        interrupt_in: None,
        ..fingerprint()
    };
    assert_eq!(no_evt.canonical(), "18d1:4ee1:0404/06.01.01/81-01-none");
}

/// A firmware update (bcd change) must change the hash, invalidating
/// learned profiles keyed on it.
#[test]
fn bcd_change_invalidates_hash() {
    let before = fingerprint().hash();
    let after = Fingerprint {
        bcd_device: 0x0405,
        ..fingerprint()
    }
    .hash();
    assert_ne!(before, after);
}

#[test]
fn info_strings_fold_into_canonical_form() {
    let fp = fingerprint().with_info_strings("Acme", "Phone 9", "1.0");
    assert!(fp.canonical().contains('#'));
    assert_ne!(fp.hash(), fingerprint().hash());
    // Same strings, same hash.
    let again = fingerprint().with_info_strings("Acme", "Phone 9", "1.0");
    assert_eq!(fp.hash(), again.hash());
}

#[test]
fn serial_devices_resolve_deterministically() {
    let path = temp_store_path("serial");
    let signals = IdentitySignals {
        vid: 0x18d1,
        pid: 0x4ee1,
        bus: 1,
        address: 7,
        usb_serial: Some("R58M123ABC".into()),
        mtp_serial: None,
    };
    let first = {
        let store = IdentityStore::open(&path).unwrap();
        store.resolve_identity(&signals).unwrap()
    };
    // A brand new store file still derives the same id from the serial.
    std::fs::remove_file(&path).unwrap();
    let store = IdentityStore::open(&path).unwrap();
    let second = store.resolve_identity(&signals).unwrap();
    assert_eq!(first.id, second.id);
    std::fs::remove_file(&path).ok();
}

#[test]
fn serial_less_devices_keep_their_random_id_across_opens() {
    let path = temp_store_path("position");
    let signals = IdentitySignals {
        vid: 0x2717,
        pid: 0xff40,
        bus: 2,
        address: 3,
        usb_serial: None,
        mtp_serial: None,
    };
    let first = IdentityStore::open(&path)
        .unwrap()
        .resolve_identity(&signals)
        .unwrap();
    let second = IdentityStore::open(&path)
        .unwrap()
        .resolve_identity(&signals)
        .unwrap();
    assert_eq!(first.id, second.id);
    std::fs::remove_file(&path).ok();
}

#[test]
fn update_and_remove_round_trip() {
    let path = temp_store_path("update");
    let store = IdentityStore::open(&path).unwrap();
    let identity = store
        .resolve_identity(&IdentitySignals {
            vid: 1,
            pid: 2,
            usb_serial: Some("abc".into()),
            ..Default::default()
        })
        .unwrap();

    store.update_mtp_serial(identity.id, "MTPSER99").unwrap();
    let found = store.identity_for(identity.id).unwrap();
    assert_eq!(found.mtp_serial.as_deref(), Some("MTPSER99"));
    assert_eq!(store.list().len(), 1);

    assert!(store.remove(identity.id).unwrap());
    assert!(store.identity_for(identity.id).is_none());
    assert!(!store.remove(identity.id).unwrap());
    std::fs::remove_file(&path).ok();
}
