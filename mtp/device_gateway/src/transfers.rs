//! The streaming transfer pipelines: resumable reads and writes between
//! local files and device objects.
//!
//! Reads follow the temp-then-rename pattern: bytes land in a `.mtppart`
//! file next to the destination, the journal commits progress before the
//! next chunk is requested, and only a complete transfer renames into
//! place, so the destination path is either absent or fully valid.
//! Resume requires the journalled ETag `{size, mtime}` to match fresh
//! object info; any mismatch restarts from offset zero.
//!
//! Writes are not idempotent: a transfer that dies mid-stream leaves a
//! partial object on the device for the caller to delete.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Instant;

use fallback_ladder::Ladder;
use log::{debug, info, warn};
use ptp_link::{ops, Link, LinkError, Pipes};
use ptp_wire::{fmt, rc, ObjectInfo};
use transfer_journal::{Etag, JournalError, NewTransfer};

use crate::actor::OpContext;
use crate::session::{dataset_date, DeviceSession};
use crate::{AttemptView, MtpError, ProgressFn, TransferOutcome};

/// The suffix of in-flight download files, adjacent to their destination.
const PART_SUFFIX: &str = "mtppart";

/// Fallback folder for subfolder-only devices with no configured
/// preference.
const DEFAULT_WRITE_FOLDER: &str = "Download";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadRung {
    Partial64,
    Partial32,
}

impl ReadRung {
    fn label(self) -> &'static str {
        match self {
            ReadRung::Partial64 => "partial-read-64",
            ReadRung::Partial32 => "partial-read-32",
        }
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".into());
    name.push('.');
    name.push_str(PART_SUFFIX);
    destination.with_file_name(name)
}

/// One partial-read transaction into a fresh buffer.
fn read_chunk(
    link: &mut Link<Box<dyn Pipes>>,
    rung: ReadRung,
    handle: u32,
    offset: u64,
    want: u32,
) -> Result<Vec<u8>, LinkError> {
    let mut buf = Vec::with_capacity(want as usize);
    let mut sink = |chunk: &[u8]| -> Result<(), LinkError> {
        buf.extend_from_slice(chunk);
        Ok(())
    };
    match rung {
        ReadRung::Partial64 => {
            ops::get_partial_object_64(link, handle, offset, want, &mut sink)?;
        }
        ReadRung::Partial32 => {
            if offset > u32::MAX as u64 {
                return Err(LinkError::device(rc::INVALID_PARAMETER));
            }
            ops::get_partial_object(link, handle, offset as u32, want, &mut sink)?;
        }
    }
    Ok(buf)
}

/// Picks the partial-read rung by descending the ladder once; rungs the
/// policy rules out fail fast so the attempt log shows why they were not
/// used.
fn pick_read_rung(
    session: &mut DeviceSession,
    handle: u32,
    offset: u64,
    want: u32,
    attempts: &mut Vec<AttemptView>,
) -> Result<(ReadRung, Vec<u8>), Option<MtpError>> {
    let p64 = session.policy.flags.supports_partial_read_64;
    let p32 = session.policy.flags.supports_partial_read_32
        || session.policy.flags.supports_get_partial_object;
    let outcome = Ladder::<DeviceSession, (ReadRung, Vec<u8>), LinkError>::new("read-chunk")
        .rung("partial-read-64", move |session: &mut DeviceSession| {
            if !p64 {
                return Err(LinkError::device(rc::OPERATION_NOT_SUPPORTED));
            }
            read_chunk(&mut session.link, ReadRung::Partial64, handle, offset, want)
                .map(|buf| (ReadRung::Partial64, buf))
        })
        .rung("partial-read-32", move |session: &mut DeviceSession| {
            if !p32 {
                return Err(LinkError::device(rc::OPERATION_NOT_SUPPORTED));
            }
            read_chunk(&mut session.link, ReadRung::Partial32, handle, offset, want)
                .map(|buf| (ReadRung::Partial32, buf))
        })
        .fatal_when(|e: &LinkError| {
            matches!(e, LinkError::Cancelled | LinkError::Deadline)
                || e.response_code() == Some(rc::INVALID_OBJECT_HANDLE)
        })
        .run(session);

    attempts.extend(outcome.attempts.iter().map(AttemptView::from));
    match outcome.result {
        Ok(found) => Ok(found),
        Err(e) => Err(e.into_inner().map(MtpError::from)),
    }
}

/// Resolves the object's real size, honouring the 32-bit overflow sentinel
/// and the `skip_get_object_prop_value` quirk.
fn object_size(session: &mut DeviceSession, handle: u32, info: &ObjectInfo) -> Option<u64> {
    match info.size() {
        Some(size) => Some(size),
        None if !session.policy.flags.skip_get_object_prop_value => {
            ops::get_object_size(&mut session.link, handle).ok()
        }
        None => None,
    }
}

pub(crate) fn read_object(
    session: &mut DeviceSession,
    ctx: &OpContext,
    handle: u32,
    range: Option<Range<u64>>,
    destination: &Path,
    mut progress: Option<ProgressFn>,
) -> Result<TransferOutcome, MtpError> {
    ctx.check()?;
    session.ensure_ready()?;
    session.stats.transfers_attempted += 1;

    let info = ops::get_object_info(&mut session.link, handle)?;
    let size = object_size(session, handle, &info);
    let supports_partial = session.policy.any_partial_read();

    // The byte window of this transfer within the object.
    let (base, total) = match &range {
        Some(range) => {
            if !supports_partial {
                return Err(MtpError::NotSupported {
                    detail: "range reads need a partial-read operation".into(),
                });
            }
            if range.end < range.start {
                return Err(MtpError::PreconditionFailed {
                    reason: "empty byte range".into(),
                });
            }
            let end = size.map_or(range.end, |s| range.end.min(s));
            if size.is_some_and(|s| range.start >= s) {
                return Err(MtpError::PreconditionFailed {
                    reason: "range starts past the end of the object".into(),
                });
            }
            (range.start, Some(end - range.start))
        }
        None => (0, size),
    };

    let etag = Etag {
        size: size.unwrap_or(0),
        mtime: info.modification_date.clone(),
    };
    let temp = part_path(destination);

    // Resume decision: whole-object reads with partial support may pick up
    // where an earlier attempt stopped, if the ETag still matches and the
    // temp file is intact.
    let mut resume_from = 0u64;
    let mut journal_id = None;
    if range.is_none() && supports_partial {
        if let Some(prev) = session
            .journal
            .find_active_read(&session.device_key, handle)?
        {
            let temp_len = std::fs::metadata(&temp).map(|m| m.len()).ok();
            if prev.resumable()
                && prev.etag.as_ref() == Some(&etag)
                && temp_len.is_some_and(|len| len >= prev.committed_bytes)
            {
                info!(
                    "resuming read of {:?} from {} of {} bytes",
                    info.filename, prev.committed_bytes, prev.total_bytes
                );
                resume_from = prev.committed_bytes;
                journal_id = Some(prev.id);
            } else {
                debug!("earlier journal entry not resumable (etag or temp mismatch)");
                session.journal.fail(prev.id, "superseded: etag mismatch")?;
            }
        }
    }
    let journal_id = match journal_id {
        Some(id) => id,
        None => session.journal.begin_read(&NewTransfer {
            device_id: session.device_key.clone(),
            handle,
            parent: (info.parent_handle != 0).then_some(info.parent_handle),
            name: info.filename.clone(),
            total_bytes: total.unwrap_or(0),
            supports_partial,
            temp_path: Some(temp.clone()),
            final_path: Some(destination.to_path_buf()),
            etag: Some(etag),
        })?,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&temp)?;
    file.set_len(resume_from)?;
    file.seek(SeekFrom::Start(resume_from))?;

    let chunk = session.policy.max_chunk_bytes as u64;
    let mut attempts: Vec<AttemptView> = Vec::new();
    let mut resume_from = resume_from;
    let mut committed = resume_from;

    let mut result = if supports_partial {
        stream_partial(
            session,
            ctx,
            handle,
            base,
            total,
            chunk,
            &mut file,
            journal_id,
            &mut committed,
            &mut attempts,
            &mut progress,
        )
    } else {
        stream_full_object(
            session,
            ctx,
            handle,
            total,
            &mut file,
            journal_id,
            &mut committed,
            &mut attempts,
            &mut progress,
        )
    };

    // The bottom rung: a device that advertises partial reads but refuses
    // them at runtime still gets the whole object streamed, from offset
    // zero.
    if supports_partial
        && range.is_none()
        && committed == resume_from
        && matches!(result, Err(MtpError::NotSupported { .. }))
    {
        debug!("partial reads refused at runtime; falling through to GetObject");
        resume_from = 0;
        committed = 0;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        session.journal.update_progress(journal_id, 0)?;
        result = stream_full_object(
            session,
            ctx,
            handle,
            total,
            &mut file,
            journal_id,
            &mut committed,
            &mut attempts,
            &mut progress,
        );
    }

    match result {
        Ok(()) => {
            file.sync_all()?;
            drop(file);
            std::fs::rename(&temp, destination)?;
            session.journal.complete(journal_id)?;
            session.stats.transfers_succeeded += 1;
            Ok(TransferOutcome {
                bytes_transferred: committed - resume_from,
                resumed_from: resume_from,
                handle: None,
                attempts,
            })
        }
        Err(e) => {
            // Transport hiccups (and interruptions) after the first chunk
            // leave the journal active so the next attempt can resume;
            // everything else is terminal.
            let resumable = committed > resume_from || resume_from > 0;
            let transient = matches!(
                e,
                MtpError::Transport(_)
                    | MtpError::Cancelled
                    | MtpError::DeadlineExpired
                    | MtpError::Session(_)
            );
            if !(supports_partial && resumable && transient) {
                session.journal.fail(journal_id, &e.to_string())?;
            }
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_partial(
    session: &mut DeviceSession,
    ctx: &OpContext,
    handle: u32,
    base: u64,
    total: Option<u64>,
    chunk: u64,
    file: &mut File,
    journal_id: i64,
    committed: &mut u64,
    attempts: &mut Vec<AttemptView>,
    progress: &mut Option<ProgressFn>,
) -> Result<(), MtpError> {
    let mut rung: Option<ReadRung> = None;
    loop {
        if let Some(total) = total {
            if *committed >= total {
                break;
            }
        }
        ctx.check()?;
        let want = match total {
            Some(total) => (total - *committed).min(chunk) as u32,
            None => chunk as u32,
        };
        let offset = base + *committed;

        let started = Instant::now();
        let buf = match rung {
            Some(r) => match read_chunk(&mut session.link, r, handle, offset, want) {
                Ok(buf) => {
                    attempts.push(AttemptView {
                        label: r.label(),
                        succeeded: true,
                        error: None,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                    buf
                }
                Err(e) => {
                    attempts.push(AttemptView {
                        label: r.label(),
                        succeeded: false,
                        error: Some(e.to_string()),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                    session.record_ladder("read", attempts);
                    return Err(e.into());
                }
            },
            None => match pick_read_rung(session, handle, offset, want, attempts) {
                Ok((winner, buf)) => {
                    rung = Some(winner);
                    buf
                }
                Err(e) => {
                    session.record_ladder("read", attempts);
                    return Err(e.unwrap_or(MtpError::NotSupported {
                        detail: "no partial-read strategy available".into(),
                    }));
                }
            },
        };

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 && !buf.is_empty() {
            session
                .stats
                .throughput_samples
                .push(buf.len() as f64 / elapsed);
        }

        file.write_all(&buf)?;
        *committed += buf.len() as u64;
        // Commit before asking for the next chunk: the crash-recovery
        // contract.
        session.journal.update_progress(journal_id, *committed)?;
        if let Some(progress) = progress.as_mut() {
            progress(*committed, total.unwrap_or(*committed));
        }

        // A short chunk means the object ended (size was unknown or
        // shrank).
        if (buf.len() as u32) < want {
            break;
        }
    }
    session.record_ladder("read", attempts);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn stream_full_object(
    session: &mut DeviceSession,
    ctx: &OpContext,
    handle: u32,
    total: Option<u64>,
    file: &mut File,
    journal_id: i64,
    committed: &mut u64,
    attempts: &mut Vec<AttemptView>,
    progress: &mut Option<ProgressFn>,
) -> Result<(), MtpError> {
    let journal = session.journal.clone();
    let started = Instant::now();
    let mut write_err: Option<std::io::Error> = None;
    let mut journal_err: Option<JournalError> = None;
    let result = {
        let committed = &mut *committed;
        let mut sink = |chunk: &[u8]| -> Result<(), LinkError> {
            if ctx.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            if ctx.is_expired() {
                return Err(LinkError::Deadline);
            }
            if let Err(e) = file.write_all(chunk) {
                let msg = e.to_string();
                write_err = Some(e);
                return Err(LinkError::Handler(msg));
            }
            *committed += chunk.len() as u64;
            // The commit must land before the next chunk is accepted.
            if let Err(e) = journal.update_progress(journal_id, *committed) {
                let msg = e.to_string();
                journal_err = Some(e);
                return Err(LinkError::Handler(msg));
            }
            if let Some(progress) = progress.as_mut() {
                progress(*committed, total.unwrap_or(*committed));
            }
            Ok(())
        };
        ops::get_object(&mut session.link, handle, &mut sink)
    };
    attempts.push(AttemptView {
        label: "full-object",
        succeeded: result.is_ok(),
        error: result.as_ref().err().map(|e| e.to_string()),
        elapsed_ms: started.elapsed().as_millis() as u64,
    });
    session.record_ladder("read", attempts);
    match result {
        Ok(bytes) => {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 && bytes > 0 {
                session.stats.throughput_samples.push(bytes as f64 / elapsed);
            }
            Ok(())
        }
        Err(e) => match (write_err, journal_err) {
            (Some(io), _) => Err(MtpError::File(io)),
            (None, Some(journal)) => Err(MtpError::Journal(journal)),
            (None, None) => Err(e.into()),
        },
    }
}

/// Finds a root folder by name, creating it when absent.
fn find_or_create_folder(
    session: &mut DeviceSession,
    storage: u32,
    name: &str,
) -> Result<u32, MtpError> {
    let handles = ops::get_object_handles(
        &mut session.link,
        storage,
        Some(fmt::ASSOCIATION),
        ptp_wire::HANDLE_ROOT,
    )?;
    for handle in handles {
        let info = ops::get_object_info(&mut session.link, handle)?;
        if info.is_folder() && info.filename.eq_ignore_ascii_case(name) {
            return Ok(handle);
        }
    }
    debug!("write folder {name:?} absent, creating it");
    session.create_folder(None, name, storage)
}

/// The folder a root write lands in when the device forbids root writes.
fn route_root_write(session: &mut DeviceSession, storage: u32) -> Result<u32, MtpError> {
    let preferred = session
        .policy
        .preferred_write_folder
        .clone()
        .unwrap_or_else(|| DEFAULT_WRITE_FOLDER.to_string());
    find_or_create_folder(session, storage, &preferred)
}

pub(crate) fn write_object(
    session: &mut DeviceSession,
    ctx: &OpContext,
    parent: Option<u32>,
    name: &str,
    size: u64,
    source: &Path,
    mut progress: Option<ProgressFn>,
) -> Result<TransferOutcome, MtpError> {
    ctx.check()?;
    session.ensure_ready()?;
    session.stats.transfers_attempted += 1;

    let storage = match parent {
        Some(parent) => ops::get_object_info(&mut session.link, parent)?.storage_id,
        None => session.default_storage()?,
    };

    let mut attempts: Vec<AttemptView> = Vec::new();
    let mut target_parent = parent.unwrap_or(0);
    if target_parent == 0 && session.policy.flags.write_to_subfolder_only {
        target_parent = route_root_write(session, storage)?;
        debug!("policy routed root write into handle {target_parent:#x}");
    }

    let object_info = ObjectInfo {
        storage_id: storage,
        format_code: fmt::UNDEFINED,
        compressed_size: size.try_into().unwrap_or(u32::MAX),
        parent_handle: target_parent,
        filename: name.to_string(),
        capture_date: dataset_date(&session.policy),
        modification_date: dataset_date(&session.policy),
        ..Default::default()
    };
    let storage_param = session.send_object_info_storage(storage);

    // SendObjectInfo, with the documented one-shot retry: InvalidParameter
    // on a root write routes into the first writable folder and tries
    // again.
    let started = Instant::now();
    let (handle, target_parent) = match ops::send_object_info(
        &mut session.link,
        storage_param,
        target_parent,
        &object_info,
    ) {
        Ok((_, _, handle)) => {
            attempts.push(AttemptView {
                label: "send-object-info",
                succeeded: true,
                error: None,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            (handle, target_parent)
        }
        Err(e)
            if e.response_code() == Some(rc::INVALID_PARAMETER) && target_parent == 0 =>
        {
            attempts.push(AttemptView {
                label: "send-object-info",
                succeeded: false,
                error: Some(e.to_string()),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            warn!("device rejected a root write; retrying in a subfolder");
            let routed = route_root_write(session, storage)?;
            let retry_info = ObjectInfo {
                parent_handle: routed,
                ..object_info
            };
            let retry_started = Instant::now();
            let (_, _, handle) =
                ops::send_object_info(&mut session.link, storage_param, routed, &retry_info)?;
            attempts.push(AttemptView {
                label: "send-object-info-routed",
                succeeded: true,
                error: None,
                elapsed_ms: retry_started.elapsed().as_millis() as u64,
            });
            (handle, routed)
        }
        Err(e) => return Err(e.into()),
    };

    let journal_id = session.journal.begin_write(&NewTransfer {
        device_id: session.device_key.clone(),
        handle,
        parent: (target_parent != 0).then_some(target_parent),
        name: name.to_string(),
        total_bytes: size,
        supports_partial: session.policy.flags.supports_partial_write,
        temp_path: None,
        final_path: None,
        etag: None,
    })?;

    let mut file = File::open(source)?;
    let result = if session.policy.flags.supports_partial_write {
        stream_partial_write(
            session,
            ctx,
            handle,
            size,
            &mut file,
            journal_id,
            &mut attempts,
            &mut progress,
        )
    } else {
        stream_single_send(
            session,
            ctx,
            size,
            &mut file,
            journal_id,
            &mut attempts,
            &mut progress,
        )
    };

    match result {
        Ok(bytes) => {
            session.journal.update_progress(journal_id, bytes)?;
            session.journal.complete(journal_id)?;
            session.stats.transfers_succeeded += 1;
            info!("wrote {name:?} ({bytes} bytes) as handle {handle:#x}");
            Ok(TransferOutcome {
                bytes_transferred: bytes,
                resumed_from: 0,
                handle: Some(handle),
                attempts,
            })
        }
        Err(e) => {
            // Not idempotent: the partial object stays on the device; the
            // caller decides whether to delete it.
            session.journal.fail(journal_id, &e.to_string())?;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_partial_write(
    session: &mut DeviceSession,
    ctx: &OpContext,
    handle: u32,
    size: u64,
    file: &mut File,
    journal_id: i64,
    attempts: &mut Vec<AttemptView>,
    progress: &mut Option<ProgressFn>,
) -> Result<u64, MtpError> {
    let chunk = session.policy.max_chunk_bytes as usize;
    let mut buf = vec![0u8; chunk];
    let mut sent = 0u64;

    ops::begin_edit_object(&mut session.link, handle)?;
    while sent < size {
        ctx.check()?;
        let want = ((size - sent) as usize).min(chunk);
        file.read_exact(&mut buf[..want])?;

        let started = Instant::now();
        let mut cursor = 0usize;
        let mut source = |out: &mut [u8]| -> Result<usize, LinkError> {
            let n = (want - cursor).min(out.len());
            out[..n].copy_from_slice(&buf[cursor..cursor + n]);
            cursor += n;
            Ok(n)
        };
        let result =
            ops::send_partial_object(&mut session.link, handle, sent, want as u32, &mut source);
        attempts.push(AttemptView {
            label: "send-partial-object",
            succeeded: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        result?;

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            session.stats.throughput_samples.push(want as f64 / elapsed);
        }
        sent += want as u64;
        session.journal.update_progress(journal_id, sent)?;
        if let Some(progress) = progress.as_mut() {
            progress(sent, size);
        }
    }
    ops::end_edit_object(&mut session.link, handle)?;
    session.record_ladder("write", attempts);
    Ok(sent)
}

fn stream_single_send(
    session: &mut DeviceSession,
    ctx: &OpContext,
    size: u64,
    file: &mut File,
    journal_id: i64,
    attempts: &mut Vec<AttemptView>,
    progress: &mut Option<ProgressFn>,
) -> Result<u64, MtpError> {
    let journal = session.journal.clone();
    let started = Instant::now();
    let mut sent = 0u64;
    let mut journal_err: Option<JournalError> = None;
    let result = {
        let sent = &mut sent;
        let mut source = |out: &mut [u8]| -> Result<usize, LinkError> {
            if ctx.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            if ctx.is_expired() {
                return Err(LinkError::Deadline);
            }
            let n = file
                .read(out)
                .map_err(|e| LinkError::Handler(e.to_string()))?;
            *sent += n as u64;
            // The commit must land before the next chunk is produced.
            if let Err(e) = journal.update_progress(journal_id, *sent) {
                let msg = e.to_string();
                journal_err = Some(e);
                return Err(LinkError::Handler(msg));
            }
            if let Some(progress) = progress.as_mut() {
                progress(*sent, size);
            }
            Ok(n)
        };
        ops::send_object(&mut session.link, size, &mut source)
    };
    attempts.push(AttemptView {
        label: "send-object",
        succeeded: result.is_ok(),
        error: result.as_ref().err().map(|e| e.to_string()),
        elapsed_ms: started.elapsed().as_millis() as u64,
    });
    session.record_ladder("write", attempts);
    match result {
        Ok(()) => Ok(sent),
        Err(e) => match journal_err {
            Some(journal) => Err(MtpError::Journal(journal)),
            None => Err(e.into()),
        },
    }
}
