//! End-to-end gateway tests over the scripted virtual device: the
//! handshake reset ladder, write routing, partial-read fallback, resume
//! across restarts, and the actor's ordering, cancellation, and deadline
//! behavior.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use device_identity::Fingerprint;
use event_pump::InterruptSource;
use mtp_policy::Source;
use mtp_quirks::QuirkDb;
use ptp_link::Pipes;
use ptp_wire::{evt, ops as opcodes};
use transfer_journal::{JournalStore, SqliteJournal};
use usb_transport::{SelectionReport, TransportError};
use uuid::Uuid;
use virtual_mtp::{Script, SharedVirtual, VirtualDevice, STORAGE_ID};

use super::actor::Priority;
use super::session::{connect, Connector, GatewayDeps};
use super::*;

const MIB: u64 = 1024 * 1024;

fn pixel_fingerprint() -> Fingerprint {
    Fingerprint {
        vid: 0x18d1,
        pid: 0x4ee1,
        bcd_device: 0x0440,
        interface_class: 0xff,
        interface_subclass: 0xff,
        interface_protocol: 0x00,
        bulk_in: 0x81,
        bulk_out: 0x01,
        interrupt_in: Some(0x82),
        info_hash: None,
    }
}

fn xiaomi_fingerprint() -> Fingerprint {
    Fingerprint {
        vid: 0x2717,
        pid: 0xff40,
        ..pixel_fingerprint()
    }
}

fn plain_fingerprint() -> Fingerprint {
    Fingerprint {
        vid: 0x1234,
        pid: 0x5678,
        ..pixel_fingerprint()
    }
}

struct VirtIntr(SharedVirtual);

impl InterruptSource for VirtIntr {
    fn read_event(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, TransportError> {
        self.0.read_interrupt(buf, timeout)
    }
}

/// A connector over the shared virtual device, with a counter for reset
/// ladder invocations.
struct VirtualConnector {
    shared: SharedVirtual,
    fingerprint: Fingerprint,
    device_id: Uuid,
    resets: Arc<AtomicU32>,
    with_events: bool,
}

impl VirtualConnector {
    fn new(shared: SharedVirtual, fingerprint: Fingerprint) -> Self {
        VirtualConnector {
            shared,
            device_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, b"virtual-test-device"),
            fingerprint,
            resets: Arc::new(AtomicU32::new(0)),
            with_events: false,
        }
    }

    fn reset_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.resets)
    }
}

impl Connector for VirtualConnector {
    fn fingerprint(&mut self) -> Result<Fingerprint, MtpError> {
        Ok(self.fingerprint.clone())
    }

    fn claim(
        &mut self,
        _policy: &mtp_policy::EffectivePolicy,
    ) -> Result<(Box<dyn Pipes>, Option<SelectionReport>), MtpError> {
        Ok((Box::new(self.shared.clone()), None))
    }

    fn reset_and_reclaim(
        &mut self,
        _policy: &mtp_policy::EffectivePolicy,
    ) -> Result<(Box<dyn Pipes>, Option<SelectionReport>), MtpError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.shared.lock().usb_reset();
        Ok((Box::new(self.shared.clone()), None))
    }

    fn interrupt_source(&mut self) -> Option<Box<dyn InterruptSource>> {
        self.with_events
            .then(|| Box::new(VirtIntr(self.shared.clone())) as Box<dyn InterruptSource>)
    }

    fn device_id(&self) -> Uuid {
        self.device_id
    }
}

fn deps() -> GatewayDeps {
    deps_with_journal(Arc::new(SqliteJournal::open_in_memory().expect("journal")))
}

fn deps_with_journal(journal: Arc<dyn JournalStore>) -> GatewayDeps {
    GatewayDeps {
        quirks: Arc::new(QuirkDb::builtin()),
        journal,
        profiles: None,
        identities: None,
        overrides: None,
    }
}

fn temp_file(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "device_gateway_test_{tag}_{}_{}",
        std::process::id(),
        Uuid::new_v4().simple()
    ))
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 37 % 251) as u8).collect()
}

/// S1: the first OpenSession times out; the quirk-flagged reset ladder
/// runs exactly once, and the retried handshake succeeds.
#[test]
fn s1_handshake_blocked_recovery() {
    let mut device = VirtualDevice::new();
    device.script_mut().swallow_open_session = 1;
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared.clone(), pixel_fingerprint());
    let resets = connector.reset_counter();

    let handle = connect(connector, deps()).expect("connect with reset ladder");
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert!(shared.lock().session_open());
    assert_eq!(handle.info().expect("info").model, "Responder");

    // The session is usable: a subsequent operation succeeds.
    let storages = handle.storages().expect("storages");
    assert_eq!(storages[0].id, STORAGE_ID);
}

/// An unflagged device does not get the ladder: the timeout surfaces.
#[test]
fn handshake_blocked_without_flag_surfaces() {
    let mut device = VirtualDevice::new();
    device.script_mut().swallow_open_session = 1;
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared, plain_fingerprint());
    let resets = connector.reset_counter();

    match connect(connector, deps()) {
        Err(MtpError::Transport(TransportError::Timeout(_))) => {}
        other => panic!("expected transport timeout, got {other:?}"),
    }
    assert_eq!(resets.load(Ordering::SeqCst), 0);
}

/// S2: a subfolder-only device routes a root write into the preferred
/// folder, creating it on demand.
#[test]
fn s2_write_to_root_routes_into_preferred_folder() {
    let mut device = VirtualDevice::new();
    device.script_mut().invalid_param_on_root_write = true;
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared.clone(), xiaomi_fingerprint());

    let data = payload(MIB as usize);
    let src = temp_file("s2-src");
    std::fs::write(&src, &data).expect("write source");

    let handle = connect(connector, deps()).expect("connect");
    let outcome = handle
        .write(None, "x.bin", data.len() as u64, &src, None)
        .expect("routed write");
    assert_eq!(outcome.bytes_transferred, data.len() as u64);

    {
        let dev = shared.lock();
        let download = dev.find_by_name("Download").expect("folder created");
        let object = dev.find_by_name("x.bin").expect("object created");
        assert_eq!(dev.parent_of(object), Some(download));
        assert_eq!(dev.object_data(object), Some(data.as_slice()));
        // SendObjectInfo targeted the folder, never the root.
        let send_infos = dev.operations_of(opcodes::SEND_OBJECT_INFO);
        assert!(send_infos.iter().all(|p| p.get(1) != Some(&0)));
    }
    std::fs::remove_file(&src).ok();
}

/// Without the quirk, a device that rejects root writes triggers the
/// one-shot InvalidParameter retry into a subfolder.
#[test]
fn root_write_retries_after_invalid_parameter() {
    let mut device = VirtualDevice::new();
    device.script_mut().invalid_param_on_root_write = true;
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());

    let data = payload(64 * 1024);
    let src = temp_file("rootretry-src");
    std::fs::write(&src, &data).expect("write source");

    let handle = connect(connector, deps()).expect("connect");
    let outcome = handle
        .write(None, "y.bin", data.len() as u64, &src, None)
        .expect("retried write");

    let labels: Vec<&str> = outcome.attempts.iter().map(|a| a.label).collect();
    assert!(labels.contains(&"send-object-info"));
    assert!(labels.contains(&"send-object-info-routed"));
    assert!(!outcome.attempts[0].succeeded);

    let dev = shared.lock();
    let object = dev.find_by_name("y.bin").expect("object created");
    assert_eq!(dev.object_data(object), Some(data.as_slice()));
    std::fs::remove_file(&src).ok();
}

/// S3: no 64-bit partial support advertised; a 3 MiB read descends to
/// 32-bit partial reads in three 1 MiB chunks.
#[test]
fn s3_partial_read_falls_back_to_32_bit() {
    let mut device = VirtualDevice::with_script(Script {
        support_partial_read_64: false,
        ..Script::default()
    });
    let data = payload((3 * MIB) as usize);
    let big = device.add_object(0, "big.bin", data.clone());
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());

    let dest = temp_file("s3-dest");
    let handle = connect(connector, deps()).expect("connect");
    let outcome = handle.read(big, None, &dest, None).expect("read");

    assert_eq!(outcome.bytes_transferred, 3 * MIB);
    assert_eq!(std::fs::read(&dest).expect("dest file"), data);

    // One failed 64-bit rung, then three successful 32-bit chunks.
    let labels: Vec<(&str, bool)> = outcome
        .attempts
        .iter()
        .map(|a| (a.label, a.succeeded))
        .collect();
    assert_eq!(
        labels,
        vec![
            ("partial-read-64", false),
            ("partial-read-32", true),
            ("partial-read-32", true),
            ("partial-read-32", true),
        ]
    );

    let dev = shared.lock();
    // Nothing 64-bit ever reached the wire.
    assert!(dev.operations_of(opcodes::GET_PARTIAL_OBJECT_64).is_empty());
    let offsets: Vec<u32> = dev
        .operations_of(opcodes::GET_PARTIAL_OBJECT)
        .iter()
        .map(|p| p[1])
        .collect();
    assert_eq!(offsets, vec![0, MIB as u32, 2 * MIB as u32]);
    std::fs::remove_file(&dest).ok();
}

/// A device that advertises partial reads (via quirk) but refuses them at
/// runtime descends the whole ladder and lands on plain GetObject.
#[test]
fn advertised_partial_reads_fall_back_to_full_object() {
    // The pixel quirk asserts partial-64 support; the scripted device
    // refuses every partial operation on the wire.
    let mut device = VirtualDevice::with_script(Script {
        support_partial_read_64: false,
        support_partial_read_32: false,
        ..Script::default()
    });
    let data = payload((2 * MIB) as usize);
    let big = device.add_object(0, "stubborn.bin", data.clone());
    let shared = SharedVirtual::new(device);
    // Force the 64-bit op back on so it is attempted on the wire.
    let mut dev = shared.lock();
    dev.script_mut().support_partial_read_64 = true;
    drop(dev);
    let connector = VirtualConnector::new(shared.clone(), pixel_fingerprint());

    let dest = temp_file("stubborn-dest");
    let handle = connect(connector, deps()).expect("connect");
    // After connect (which probed DeviceInfo), make the wire refuse.
    shared.lock().script_mut().support_partial_read_64 = false;
    let outcome = handle.read(big, None, &dest, None).expect("full-object read");

    assert_eq!(std::fs::read(&dest).expect("dest"), data);
    let labels: Vec<(&str, bool)> = outcome
        .attempts
        .iter()
        .map(|a| (a.label, a.succeeded))
        .collect();
    assert_eq!(
        labels,
        vec![
            ("partial-read-64", false),
            ("partial-read-32", false),
            ("full-object", true),
        ]
    );
    std::fs::remove_file(&dest).ok();
}

/// S4: a read dies mid-transfer; with an unchanged ETag the next attempt
/// resumes at the committed offset and completes the file.
#[test]
fn s4_resume_across_restart() {
    let mut device = VirtualDevice::new();
    device.script_mut().swallow_partial_after = Some(2);
    let data = payload((5 * MIB) as usize);
    let big = device.add_object(0, "huge.bin", data.clone());
    let shared = SharedVirtual::new(device);
    let journal: Arc<dyn JournalStore> =
        Arc::new(SqliteJournal::open_in_memory().expect("journal"));
    let dest = temp_file("s4-dest");

    // First run: two chunks commit, then the device goes silent.
    let device_key = {
        let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
        let handle =
            connect(connector, deps_with_journal(Arc::clone(&journal))).expect("connect #1");
        match handle.read(big, None, &dest, None) {
            Err(MtpError::Transport(TransportError::Timeout(_))) => {}
            other => panic!("expected mid-transfer timeout, got {other:?}"),
        }
        handle.device_id().simple().to_string()
    };

    let resumables = journal.load_resumables(&device_key).expect("resumables");
    assert_eq!(resumables.len(), 1);
    assert_eq!(resumables[0].committed_bytes, 2 * MIB);

    // "Restart": a fresh gateway, same journal, device healthy again.
    shared.lock().script_mut().swallow_partial_after = None;
    let before_restart = shared.lock().operations().len();
    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
    let handle = connect(connector, deps_with_journal(Arc::clone(&journal))).expect("connect #2");
    let outcome = handle.read(big, None, &dest, None).expect("resumed read");

    assert_eq!(outcome.resumed_from, 2 * MIB);
    assert_eq!(outcome.bytes_transferred, 3 * MIB);
    assert_eq!(std::fs::read(&dest).expect("dest"), data);

    // The first partial read of the second session starts at the resume
    // offset, not zero.
    let dev = shared.lock();
    let second_session_partials: Vec<Vec<u32>> = dev.operations()[before_restart..]
        .iter()
        .filter(|(op, _)| *op == opcodes::GET_PARTIAL_OBJECT_64)
        .map(|(_, p)| p.clone())
        .collect();
    assert_eq!(second_session_partials[0][1], (2 * MIB) as u32);
    std::fs::remove_file(&dest).ok();
}

/// A changed ETag (device-side edit) forces a restart from offset zero.
#[test]
fn resume_with_mismatched_etag_restarts() {
    let mut device = VirtualDevice::new();
    device.script_mut().swallow_partial_after = Some(1);
    let data = payload((2 * MIB) as usize);
    let big = device.add_object(0, "edited.bin", data.clone());
    let shared = SharedVirtual::new(device);
    let journal: Arc<dyn JournalStore> =
        Arc::new(SqliteJournal::open_in_memory().expect("journal"));
    let dest = temp_file("etag-dest");

    {
        let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
        let handle =
            connect(connector, deps_with_journal(Arc::clone(&journal))).expect("connect #1");
        assert!(handle.read(big, None, &dest, None).is_err());
    }

    // The object is edited on the device: the journalled mtime no longer
    // matches, so the committed bytes cannot be trusted.
    {
        let mut dev = shared.lock();
        dev.script_mut().swallow_partial_after = None;
        dev.touch_object(big, "20260801T090000");
    }

    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
    let handle = connect(connector, deps_with_journal(Arc::clone(&journal))).expect("connect #2");
    let outcome = handle.read(big, None, &dest, None).expect("fresh read");
    assert_eq!(outcome.resumed_from, 0);
    assert_eq!(outcome.bytes_transferred, 2 * MIB);
    assert_eq!(std::fs::read(&dest).expect("dest"), data);
    std::fs::remove_file(&dest).ok();
}

/// S5: SessionAlreadyOpen during connect is absorbed by the close-retry.
#[test]
fn s5_session_already_open_is_invisible() {
    let mut device = VirtualDevice::new();
    device.script_mut().session_already_open = 1;
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());

    let handle = connect(connector, deps()).expect("connect");
    assert!(shared.lock().session_open());
    assert!(handle.storages().is_ok());
}

/// S6: priority bands dequeue critical > high > medium > low, FIFO within
/// a band.
#[test]
fn s6_priority_ordering() {
    let shared = SharedVirtual::new(VirtualDevice::new());
    let connector = VirtualConnector::new(shared, plain_fingerprint());
    let handle = connect(connector, deps()).expect("connect");
    let gateway = handle.gateway().clone();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    // Hold the worker so the queue builds up behind this op.
    let blocker = gateway.submit(Priority::Critical, None, move |_, _| {
        let _ = release_rx.recv();
        Ok(())
    });
    std::thread::sleep(Duration::from_millis(50));

    let mut handles = Vec::new();
    for (label, priority) in [
        ("A", Priority::Low),
        ("B", Priority::Medium),
        ("C", Priority::Critical),
        ("D", Priority::High),
        ("E", Priority::Low),
    ] {
        let order = Arc::clone(&order);
        handles.push(gateway.submit(priority, None, move |_, _| {
            order.lock().unwrap().push(label);
            Ok(())
        }));
    }

    release_tx.send(()).expect("release blocker");
    blocker.wait().expect("blocker");
    for handle in handles {
        handle.wait().expect("op");
    }
    assert_eq!(*order.lock().unwrap(), vec!["C", "D", "B", "A", "E"]);
}

/// Cancelling a queued op resolves it without running it.
#[test]
fn cancelled_queued_op_never_runs() {
    let shared = SharedVirtual::new(VirtualDevice::new());
    let connector = VirtualConnector::new(shared, plain_fingerprint());
    let handle = connect(connector, deps()).expect("connect");
    let gateway = handle.gateway().clone();

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let blocker = gateway.submit(Priority::Critical, None, move |_, _| {
        let _ = release_rx.recv();
        Ok(())
    });
    std::thread::sleep(Duration::from_millis(50));

    let ran = Arc::new(AtomicU32::new(0));
    let ran_clone = Arc::clone(&ran);
    let victim = gateway.submit(Priority::Low, None, move |_, _| {
        ran_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    victim.cancel();
    release_tx.send(()).expect("release");
    blocker.wait().expect("blocker");

    match victim.wait() {
        Err(MtpError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

/// Deadline expiry surfaces as a flow timeout and forces a session resync
/// before the next operation.
#[test]
fn deadline_expiry_marks_needs_resync() {
    let shared = SharedVirtual::new(VirtualDevice::new());
    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
    let handle = connect(connector, deps()).expect("connect");
    let gateway = handle.gateway().clone();

    let opens_before = shared.lock().operations_of(opcodes::OPEN_SESSION).len();

    let slow = gateway.submit(
        Priority::Medium,
        Some(Duration::from_millis(30)),
        |_, ctx| -> Result<(), MtpError> {
            loop {
                ctx.check()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        },
    );
    match slow.wait() {
        Err(MtpError::DeadlineExpired) => {}
        other => panic!("expected DeadlineExpired, got {other:?}"),
    }

    // The next operation re-opens the session first.
    handle.storages().expect("post-deadline op");
    let opens_after = shared.lock().operations_of(opcodes::OPEN_SESSION).len();
    assert_eq!(opens_after, opens_before + 1);
}

#[test]
fn list_uses_prop_list_fast_path_and_fallback() {
    // Fast path.
    let mut device = VirtualDevice::new();
    let folder = device.add_folder(0, "DCIM");
    device.add_object(folder, "a.jpg", payload(10));
    device.add_object(folder, "b.jpg", payload(20));
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
    let handle = connect(connector, deps()).expect("connect");

    let listed = handle.list(STORAGE_ID, Some(folder)).expect("list");
    let mut names: Vec<&str> = listed.iter().map(|o| o.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a.jpg", "b.jpg"]);
    assert_eq!(
        shared.lock().operations_of(opcodes::GET_OBJECT_PROP_LIST).len(),
        1
    );
    drop(handle);

    // Fallback: device without prop-list support walks handles.
    let mut device = VirtualDevice::with_script(Script {
        support_prop_list: false,
        ..Script::default()
    });
    let folder = device.add_folder(0, "DCIM");
    device.add_object(folder, "c.jpg", payload(30));
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
    let handle = connect(connector, deps()).expect("connect");

    let listed = handle.list(STORAGE_ID, Some(folder)).expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "c.jpg");
    assert!(shared
        .lock()
        .operations_of(opcodes::GET_OBJECT_PROP_LIST)
        .is_empty());
}

#[test]
fn delete_folder_honours_recursive_flag() {
    let mut device = VirtualDevice::new();
    let folder = device.add_folder(0, "Music");
    device.add_object(folder, "song.mp3", payload(100));
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
    let handle = connect(connector, deps()).expect("connect");

    match handle.delete(folder, false) {
        Err(MtpError::PreconditionFailed { .. }) => {}
        other => panic!("expected PreconditionFailed, got {other:?}"),
    }
    handle.delete(folder, true).expect("recursive delete");
    assert!(shared.lock().find_by_name("Music").is_none());
    assert!(shared.lock().find_by_name("song.mp3").is_none());
}

#[test]
fn move_object_reparents() {
    let mut device = VirtualDevice::new();
    let folder = device.add_folder(0, "Target");
    let file = device.add_object(0, "roaming.txt", payload(10));
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
    let handle = connect(connector, deps()).expect("connect");

    handle.r#move(file, Some(folder)).expect("move");
    assert_eq!(shared.lock().parent_of(file), Some(folder));
}

#[test]
fn events_flow_through_the_gateway() {
    let shared = SharedVirtual::new(VirtualDevice::new());
    let mut connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
    connector.with_events = true;
    let handle = connect(connector, deps()).expect("connect");

    let mut events = handle.events().expect("event stream");
    // Takeable once.
    assert!(handle.events().is_none());

    shared.lock().push_event(evt::OBJECT_ADDED, &[17]);
    assert_eq!(events.next(), Some(event_pump::MtpEvent::ObjectAdded(17)));
}

#[test]
fn diagnostics_expose_policy_provenance_and_transactions() {
    let shared = SharedVirtual::new(VirtualDevice::new());
    let connector = VirtualConnector::new(shared, pixel_fingerprint());
    let handle = connect(connector, deps()).expect("connect");
    handle.storages().expect("storages");

    let snapshot = handle.diagnostics().expect("diagnostics");
    assert_eq!(snapshot.model, "Responder");
    assert!(!snapshot.transactions.is_empty());
    // The pixel quirk set this flag; provenance says so.
    assert_eq!(
        snapshot
            .policy
            .source_of("reset_reopen_on_open_session_io_error"),
        Source::Quirk
    );
    assert!(snapshot.policy.flags.reset_reopen_on_open_session_io_error);
}

#[test]
fn exit_codes_follow_the_contract() {
    assert_eq!(MtpError::Transport(TransportError::NoDevice).exit_code(), 69);
    assert_eq!(
        MtpError::Policy(mtp_policy::PolicyError::UnknownKey("x".into())).exit_code(),
        64
    );
    assert_eq!(
        MtpError::Transport(TransportError::Timeout(Duration::from_secs(1))).exit_code(),
        75
    );
    assert_eq!(MtpError::Cancelled.exit_code(), 75);
    assert_eq!(MtpError::ObjectNotFound.exit_code(), 70);
    // Messages are concise and carry the raw code for device errors.
    let err = MtpError::Device {
        code: 0x2019,
        name: "DeviceBusy",
    };
    assert!(err.user_message().contains("0x2019"));
    assert_eq!(err.response_code(), Some(0x2019));
}

/// The wildcard-storage quirk rewrites SendObjectInfo's storage id.
#[test]
fn wildcard_storage_quirk_applies_to_send_object_info() {
    let galaxy = Fingerprint {
        vid: 0x04e8,
        pid: 0x6860,
        ..plain_fingerprint()
    };
    let shared = SharedVirtual::new(VirtualDevice::new());
    let connector = VirtualConnector::new(shared.clone(), galaxy);
    let handle = connect(connector, deps()).expect("connect");

    let data = payload(4096);
    let src = temp_file("wildcard-src");
    std::fs::write(&src, &data).expect("src");
    handle
        .write(None, "w.bin", data.len() as u64, &src, None)
        .expect("write");

    let send_infos = shared.lock().operations_of(opcodes::SEND_OBJECT_INFO);
    assert!(!send_infos.is_empty());
    assert!(send_infos.iter().all(|p| p[0] == 0xFFFF_FFFF));
    std::fs::remove_file(&src).ok();
}

/// Random-content round trip through write-then-read at gateway level.
#[test]
fn write_then_read_round_trip() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let data: Vec<u8> = (0..777_777).map(|_| rng.gen()).collect();

    let shared = SharedVirtual::new(VirtualDevice::new());
    let connector = VirtualConnector::new(shared.clone(), plain_fingerprint());
    let handle = connect(connector, deps()).expect("connect");

    let src = temp_file("rt-src");
    std::fs::write(&src, &data).expect("src");
    let outcome = handle
        .write(None, "rt.bin", data.len() as u64, &src, None)
        .expect("write");
    let new_handle = outcome.handle.expect("created handle");

    let dest = temp_file("rt-dest");
    let read_back = handle.read(new_handle, None, &dest, None).expect("read");
    assert_eq!(read_back.bytes_transferred, data.len() as u64);
    assert_eq!(std::fs::read(&dest).expect("dest"), data);

    std::fs::remove_file(&src).ok();
    std::fs::remove_file(&dest).ok();
}

/// Range reads hit the requested window only.
#[test]
fn range_read_returns_the_window() {
    let mut device = VirtualDevice::new();
    let data = payload((2 * MIB) as usize);
    let big = device.add_object(0, "windowed.bin", data.clone());
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared, plain_fingerprint());
    let handle = connect(connector, deps()).expect("connect");

    let dest = temp_file("range-dest");
    let outcome = handle
        .read(big, Some(100..100 + 4096), &dest, None)
        .expect("range read");
    assert_eq!(outcome.bytes_transferred, 4096);
    assert_eq!(
        std::fs::read(&dest).expect("dest"),
        data[100..100 + 4096].to_vec()
    );
    std::fs::remove_file(&dest).ok();
}

/// A session's observations land in the learned-profile store when the
/// gateway shuts down.
#[test]
fn session_stats_feed_the_learned_profile_store() {
    use learned_profiles::ProfileStore;

    let store_path = temp_file("profiles");
    let profiles = Arc::new(ProfileStore::open(&store_path).expect("profile store"));
    let mut device = VirtualDevice::new();
    let obj = device.add_object(0, "sampled.bin", payload(MIB as usize));
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared, plain_fingerprint());

    let deps = GatewayDeps {
        quirks: Arc::new(QuirkDb::builtin()),
        journal: Arc::new(SqliteJournal::open_in_memory().expect("journal")),
        profiles: Some(Arc::clone(&profiles)),
        identities: None,
        overrides: None,
    };
    let dest = temp_file("profile-dest");
    {
        let handle = connect(connector, deps).expect("connect");
        handle.read(obj, None, &dest, None).expect("read");
    } // drop joins the worker, which records the session sample

    let profile = profiles
        .get(&plain_fingerprint().hash())
        .expect("profile recorded");
    assert_eq!(profile.sample_count, 1);
    assert!(profile.handshake_ms > 0.0);
    assert_eq!(profile.success_rate, 1.0);
    std::fs::remove_file(&dest).ok();
    std::fs::remove_file(&store_path).ok();
}

/// Progress callbacks observe monotone, journal-consistent offsets.
#[test]
fn progress_reports_monotone_offsets() {
    let mut device = VirtualDevice::new();
    let data = payload((3 * MIB) as usize);
    let big = device.add_object(0, "progress.bin", data);
    let shared = SharedVirtual::new(device);
    let connector = VirtualConnector::new(shared, plain_fingerprint());
    let handle = connect(connector, deps()).expect("connect");

    let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let dest = temp_file("progress-dest");
    handle
        .read(
            big,
            None,
            &dest,
            Some(Box::new(move |done, total| {
                sink.lock().unwrap().push((done, total));
            })),
        )
        .expect("read");

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(seen.last().unwrap(), &(3 * MIB, 3 * MIB));
    std::fs::remove_file(&dest).ok();
}
