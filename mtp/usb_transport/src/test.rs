//! Unit tests for interface ranking; the rusb-facing paths need hardware
//! and are exercised by the gateway's virtual-device tests instead.

use super::select::{rank, RawEndpoint, RawInterface};

fn bulk(address: u8, direction_in: bool) -> RawEndpoint {
    RawEndpoint {
        address,
        is_bulk: true,
        is_interrupt: false,
        direction_in,
        max_packet: 512,
    }
}

fn interrupt_in(address: u8) -> RawEndpoint {
    RawEndpoint {
        address,
        is_bulk: false,
        is_interrupt: true,
        direction_in: true,
        max_packet: 28,
    }
}

fn still_image(interface: u8, alt: u8) -> RawInterface {
    RawInterface {
        interface,
        alt,
        class: 0x06,
        subclass: 0x01,
        protocol: 0x01,
        name: Some("MTP".into()),
        endpoints: vec![bulk(0x81, true), bulk(0x01, false), interrupt_in(0x82)],
    }
}

#[test]
fn exact_triple_with_events_scores_105() {
    let report = rank(&[still_image(0, 0)]);
    assert_eq!(report.score, 105);
    let winner = report.winner.expect("winner");
    assert_eq!(winner.bulk_in, 0x81);
    assert_eq!(winner.bulk_out, 0x01);
    assert_eq!(winner.interrupt_in, Some(0x82));
    assert_eq!(winner.max_packet_size, 512);
}

#[test]
fn vendor_specific_named_mtp_beats_unnamed() {
    let named = RawInterface {
        interface: 1,
        alt: 0,
        class: 0xFF,
        subclass: 0xFF,
        protocol: 0,
        name: Some("MTP".into()),
        endpoints: vec![bulk(0x83, true), bulk(0x03, false)],
    };
    let unnamed = RawInterface {
        interface: 0,
        alt: 0,
        class: 0xFF,
        subclass: 0x42,
        protocol: 1,
        name: None,
        endpoints: vec![bulk(0x81, true), bulk(0x01, false)],
    };
    let report = rank(&[unnamed, named]);
    assert_eq!(report.score, 60);
    assert_eq!(report.winner.expect("winner").interface, 1);
}

/// The ADB penalty keeps a debug channel from outranking MTP even when the
/// ADB interface also carries a bulk pair.
#[test]
fn adb_interface_is_penalized() {
    let adb = RawInterface {
        interface: 1,
        alt: 0,
        class: 0xFF,
        subclass: 0x42,
        protocol: 1,
        name: Some("ADB Interface".into()),
        endpoints: vec![bulk(0x83, true), bulk(0x03, false)],
    };
    let report = rank(&[still_image(0, 0), adb.clone()]);
    assert_eq!(report.winner.as_ref().expect("winner").interface, 0);
    let adb_report = report
        .candidates
        .iter()
        .find(|c| c.interface == 1)
        .expect("adb candidate present");
    assert_eq!(adb_report.score, -200);
    assert!(!adb_report.chosen);

    // Even alone, ADB still wins over nothing if it has the pipes; the
    // negative score records how unconvincing the match is.
    let lonely = rank(&[adb]);
    assert_eq!(lonely.score, -200);
    assert!(lonely.winner.is_some());
}

#[test]
fn candidates_without_bulk_pair_are_disqualified() {
    let no_out = RawInterface {
        interface: 0,
        alt: 0,
        class: 0x06,
        subclass: 0x01,
        protocol: 0x01,
        name: None,
        endpoints: vec![bulk(0x81, true), interrupt_in(0x82)],
    };
    let report = rank(&[no_out]);
    assert!(report.winner.is_none());
    assert_eq!(report.candidates.len(), 1);
    assert!(report.candidates[0].reason.contains("disqualified"));
}

#[test]
fn ties_break_by_interface_then_alt() {
    let a = RawInterface {
        interface: 2,
        alt: 1,
        ..still_image(2, 1)
    };
    let b = still_image(2, 0);
    let c = still_image(3, 0);
    let report = rank(&[a, c, b]);
    let winner = report.winner.expect("winner");
    assert_eq!((winner.interface, winner.alt_setting), (2, 0));
}

#[test]
fn selection_report_marks_exactly_one_chosen() {
    let report = rank(&[still_image(0, 0), still_image(1, 0), still_image(2, 0)]);
    assert_eq!(report.candidates.iter().filter(|c| c.chosen).count(), 1);
}

#[test]
fn mtp_candidate_detection() {
    assert!(still_image(0, 0).is_mtp_candidate());
    let vendor = RawInterface {
        class: 0xFF,
        name: Some("MTP".into()),
        ..Default::default()
    };
    assert!(vendor.is_mtp_candidate());
    let vendor_unnamed = RawInterface {
        class: 0xFF,
        name: None,
        ..Default::default()
    };
    assert!(!vendor_unnamed.is_mtp_candidate());
}
