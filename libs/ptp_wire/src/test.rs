//! Unit tests for the wire codecs: endian round-trips, container framing,
//! string edge cases, and dataset round-trips over randomized inputs.

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::*;

fn rng() -> StdRng {
    StdRng::seed_from_u64(0x4d54_5031)
}

/// Encode-decode is the identity for every primitive width.
#[test]
fn endian_round_trip() {
    let mut rng = rng();
    for _ in 0..1000 {
        let a: u8 = rng.gen();
        let b: u16 = rng.gen();
        let c: u32 = rng.gen();
        let d: u64 = rng.gen();
        let mut w = Writer::new();
        w.put_u8(a);
        w.put_u16(b);
        w.put_u32(c);
        w.put_u64(d);
        let buf = w.into_vec();
        let mut r = Reader::new(&buf);
        assert_eq!(r.u8(), Some(a));
        assert_eq!(r.u16(), Some(b));
        assert_eq!(r.u32(), Some(c));
        assert_eq!(r.u64(), Some(d));
        assert!(r.is_empty());
    }
}

/// Truncated buffers yield `None` from every accessor, never a panic.
#[test]
fn truncated_reads_return_none() {
    let buf = [0xAAu8; 3];
    let mut r = Reader::new(&buf);
    assert_eq!(r.u32(), None);
    assert_eq!(Reader::new(&buf).u64(), None);
    assert_eq!(Reader::new(&[]).u8(), None);
    assert_eq!(Reader::new(&[2, 0x41]).string(), None); // 2 units need 4 bytes
    assert_eq!(Reader::new(&[1, 0, 0, 0, 0xFF]).array_u32(), None);
}

/// Container encode-then-decode yields identical fields for every valid
/// combination of type, code, txid, and payload up to 64 KiB.
#[test]
fn container_round_trip() {
    let mut rng = rng();
    let kinds = [
        ContainerKind::Command,
        ContainerKind::Data,
        ContainerKind::Response,
        ContainerKind::Event,
    ];
    for _ in 0..200 {
        let kind = kinds[rng.gen_range(0..kinds.len())];
        let code: u16 = rng.gen();
        let txid: u32 = rng.gen();
        let payload: Vec<u8> = (0..rng.gen_range(0..64 * 1024)).map(|_| rng.gen()).collect();
        let c = Container {
            kind,
            code,
            transaction_id: txid,
            payload: payload.clone(),
        };
        let encoded = c.encode();
        assert_eq!(encoded.len(), CONTAINER_HEADER_LEN + payload.len());
        let decoded = Container::decode(&encoded).unwrap();
        assert_eq!(decoded, c);
    }
}

#[test]
fn container_length_must_cover_header() {
    let mut bad = Container::command(ops::OPEN_SESSION, 1, &[1]).encode();
    bad[0..4].copy_from_slice(&4u32.to_le_bytes());
    assert_eq!(
        ContainerHeader::decode(&bad),
        Err(WireError::BadLength(4))
    );
}

#[test]
fn container_rejects_unknown_kind() {
    let mut bad = Container::command(ops::OPEN_SESSION, 1, &[1]).encode();
    bad[4..6].copy_from_slice(&9u16.to_le_bytes());
    assert_eq!(
        ContainerHeader::decode(&bad),
        Err(WireError::UnknownContainerKind(9))
    );
}

#[test]
fn command_params_encode_as_u32s() {
    let c = Container::command(ops::GET_PARTIAL_OBJECT, 7, &[0x10, 0x20, 0x30]);
    assert_eq!(c.encode()[0..4], 24u32.to_le_bytes());
    assert_eq!(c.params(), vec![0x10, 0x20, 0x30]);
    assert_eq!(c.param(1), Some(0x20));
    assert_eq!(c.param(3), None);
}

/// Empty strings are one zero byte; round-trips preserve content including
/// non-ASCII text.
#[test]
fn ptp_string_round_trip() {
    for s in ["", "DCIM", "fotoğraf", "日本語ファイル名.jpg"] {
        let mut w = Writer::new();
        w.put_string(s);
        let buf = w.into_vec();
        if s.is_empty() {
            assert_eq!(buf, vec![0]);
        } else {
            assert_eq!(buf[0] as usize, s.encode_utf16().count() + 1);
        }
        assert_eq!(Reader::new(&buf).string().as_deref(), Some(s));
    }
}

#[test]
fn ptp_string_tolerates_missing_terminator() {
    // 1 unit, 'A', no NUL: some devices do this.
    let buf = [1u8, 0x41, 0x00];
    assert_eq!(Reader::new(&buf).string().as_deref(), Some("A"));
}

#[test]
fn overlong_string_is_truncated_not_panicking() {
    let long: String = "x".repeat(1000);
    let mut w = Writer::new();
    w.put_string(&long);
    let buf = w.into_vec();
    assert_eq!(buf[0], 255);
    let back = Reader::new(&buf).string().unwrap();
    assert_eq!(back.len(), 254);
}

#[test]
fn device_info_round_trip() {
    let info = DeviceInfo {
        standard_version: 100,
        vendor_extension_id: 0x0000_0006,
        vendor_extension_version: 100,
        vendor_extension_desc: "microsoft.com: 1.0; android.com: 1.0;".into(),
        functional_mode: 0,
        operations_supported: vec![
            ops::GET_DEVICE_INFO,
            ops::OPEN_SESSION,
            ops::GET_PARTIAL_OBJECT,
            ops::GET_PARTIAL_OBJECT_64,
        ],
        events_supported: vec![evt::OBJECT_ADDED, evt::OBJECT_REMOVED],
        device_properties_supported: vec![prop::DEVICE_FRIENDLY_NAME],
        capture_formats: vec![],
        playback_formats: vec![fmt::EXIF_JPEG, fmt::MP3],
        manufacturer: "Acme".into(),
        model: "Phone 9".into(),
        device_version: "1.0".into(),
        serial_number: "SER123".into(),
    };
    let decoded = DeviceInfo::decode(&info.encode()).unwrap();
    assert_eq!(decoded, info);
    assert!(decoded.supports_operation(ops::GET_PARTIAL_OBJECT_64));
    assert!(!decoded.supports_operation(ops::SEND_PARTIAL_OBJECT));
}

#[test]
fn storage_info_round_trip_and_access() {
    let si = StorageInfo {
        storage_type: 0x0003,
        filesystem_type: 0x0002,
        access_capability: 0x0000,
        max_capacity: 64 << 30,
        free_space_bytes: 10 << 30,
        free_space_objects: 0xFFFF_FFFF,
        description: "Internal shared storage".into(),
        volume_label: String::new(),
    };
    let decoded = StorageInfo::decode(&si.encode()).unwrap();
    assert_eq!(decoded, si);
    assert!(!decoded.read_only());
    let ro = StorageInfo {
        access_capability: 0x0001,
        ..si
    };
    assert!(ro.read_only());
}

#[test]
fn object_info_round_trip_and_size_overflow() {
    let oi = ObjectInfo {
        storage_id: 0x0001_0001,
        format_code: fmt::EXIF_JPEG,
        compressed_size: 123_456,
        parent_handle: 0,
        filename: "IMG_0001.JPG".into(),
        modification_date: "20260801T101500".into(),
        ..Default::default()
    };
    let decoded = ObjectInfo::decode(&oi.encode()).unwrap();
    assert_eq!(decoded, oi);
    assert_eq!(decoded.size(), Some(123_456));
    assert!(!decoded.is_folder());

    let big = ObjectInfo {
        compressed_size: SIZE_OVERFLOW,
        ..oi
    };
    assert_eq!(big.size(), None);
}

#[test]
fn truncated_dataset_is_an_error() {
    let full = ObjectInfo {
        filename: "a.txt".into(),
        ..Default::default()
    }
    .encode();
    for cut in [0, 4, 11, full.len() - 1] {
        assert!(matches!(
            ObjectInfo::decode(&full[..cut]),
            Err(WireError::Truncated { .. })
        ));
    }
}

#[test]
fn prop_list_round_trip() {
    let entries = vec![
        PropListEntry {
            handle: 5,
            prop_code: prop::OBJECT_SIZE,
            datatype: prop::datatype::U64,
            value: PropValue::U64(9_000_000_000),
        },
        PropListEntry {
            handle: 5,
            prop_code: prop::OBJECT_FILE_NAME,
            datatype: prop::datatype::STRING,
            value: PropValue::Str("movie.mp4".into()),
        },
        PropListEntry {
            handle: 6,
            prop_code: prop::PARENT_OBJECT,
            datatype: prop::datatype::U32,
            value: PropValue::U32(5),
        },
    ];
    let buf = PropListEntry::encode_list(&entries);
    let back = PropListEntry::decode_list(&buf).unwrap();
    assert_eq!(back, entries);
    assert_eq!(back[0].value.as_u64(), Some(9_000_000_000));
    assert_eq!(back[1].value.as_str(), Some("movie.mp4"));
}
