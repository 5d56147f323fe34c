//! Journal tests over an in-memory database.

use std::path::PathBuf;

use super::*;

fn new_read(device: &str, handle: u32, total: u64, partial: bool) -> NewTransfer {
    NewTransfer {
        device_id: device.into(),
        handle,
        parent: None,
        name: format!("obj-{handle}"),
        total_bytes: total,
        supports_partial: partial,
        temp_path: Some(PathBuf::from(format!("/tmp/obj-{handle}.mtppart"))),
        final_path: Some(PathBuf::from(format!("/tmp/obj-{handle}"))),
        etag: Some(Etag {
            size: total,
            mtime: "20260101T120000".into(),
        }),
    }
}

#[test]
fn begin_progress_complete_round_trip() {
    let journal = SqliteJournal::open_in_memory().unwrap();
    let id = journal.begin_read(&new_read("dev-a", 5, 1000, true)).unwrap();

    journal.update_progress(id, 400).unwrap();
    let record = journal.get(id).unwrap().expect("record");
    assert_eq!(record.kind, TransferKind::Read);
    assert_eq!(record.committed_bytes, 400);
    assert_eq!(record.state, TransferState::Active);
    assert!(record.resumable());
    assert_eq!(record.etag.as_ref().map(|e| e.size), Some(1000));

    journal.complete(id).unwrap();
    let record = journal.get(id).unwrap().expect("record");
    assert_eq!(record.state, TransferState::Done);
    assert!(!record.resumable());
}

#[test]
fn failed_transfers_keep_their_error() {
    let journal = SqliteJournal::open_in_memory().unwrap();
    let id = journal.begin_write(&new_read("dev-a", 9, 100, false)).unwrap();
    journal.fail(id, "device disconnected").unwrap();
    let record = journal.get(id).unwrap().expect("record");
    assert_eq!(record.state, TransferState::Failed);
    assert_eq!(record.last_error.as_deref(), Some("device disconnected"));
}

#[test]
fn resumables_require_active_partial_and_unfinished() {
    let journal = SqliteJournal::open_in_memory().unwrap();

    let resumable = journal.begin_read(&new_read("dev-a", 1, 1000, true)).unwrap();
    journal.update_progress(resumable, 400).unwrap();

    // Finished: not resumable.
    let finished = journal.begin_read(&new_read("dev-a", 2, 1000, true)).unwrap();
    journal.update_progress(finished, 1000).unwrap();

    // No partial support: not resumable.
    journal.begin_read(&new_read("dev-a", 3, 1000, false)).unwrap();

    // Failed: not resumable.
    let failed = journal.begin_read(&new_read("dev-a", 4, 1000, true)).unwrap();
    journal.fail(failed, "boom").unwrap();

    // Other device: not in this device's list.
    journal.begin_read(&new_read("dev-b", 5, 1000, true)).unwrap();

    let list = journal.load_resumables("dev-a").unwrap();
    assert_eq!(
        list.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![resumable]
    );
}

#[test]
fn find_active_read_prefers_the_newest() {
    let journal = SqliteJournal::open_in_memory().unwrap();
    let old = journal.begin_read(&new_read("dev-a", 7, 1000, true)).unwrap();
    journal.fail(old, "first try died").unwrap();
    let newer = journal.begin_read(&new_read("dev-a", 7, 1000, true)).unwrap();

    let found = journal.find_active_read("dev-a", 7).unwrap().expect("found");
    assert_eq!(found.id, newer);
    assert!(journal.find_active_read("dev-a", 99).unwrap().is_none());
}

#[test]
fn clear_stale_temps_touches_only_terminal_entries() {
    let journal = SqliteJournal::open_in_memory().unwrap();
    let active = journal.begin_read(&new_read("dev-a", 1, 10, true)).unwrap();
    let done = journal.begin_read(&new_read("dev-a", 2, 10, true)).unwrap();
    journal.complete(done).unwrap();
    let failed = journal.begin_read(&new_read("dev-a", 3, 10, true)).unwrap();
    journal.fail(failed, "x").unwrap();

    let cleared = journal.clear_stale_temps().unwrap();
    assert_eq!(cleared.len(), 2);

    // The active entry keeps its temp path; terminal ones lost theirs.
    assert!(journal.get(active).unwrap().expect("active").temp_path.is_some());
    assert!(journal.get(done).unwrap().expect("done").temp_path.is_none());
    // A second pass has nothing left to do.
    assert!(journal.clear_stale_temps().unwrap().is_empty());
}
