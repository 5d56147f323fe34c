//! Typed wrappers for the operations the runtime uses.
//!
//! Each wrapper builds the command parameters, runs the transaction
//! through the engine, checks the response code, and decodes the dataset.
//! Nothing here retries on device errors (that is gateway policy) except
//! the DeviceBusy backoff on the early storage operations, which the error
//! contract places at this layer.

use std::thread;
use std::time::Duration;

use log::debug;
use ptp_wire::{
    ops, prop, DeviceInfo, ObjectInfo, PropListEntry, Reader, StorageInfo,
};

use crate::{DataSink, DataSource, Link, LinkError, Pipes};

/// DeviceBusy backoff: initial delay, cap, and attempt bound.
const BUSY_BACKOFF_START: Duration = Duration::from_millis(100);
const BUSY_BACKOFF_CAP: Duration = Duration::from_secs(1);
const BUSY_MAX_ATTEMPTS: u32 = 5;

/// Retries `f` while the device answers DeviceBusy, backing off
/// exponentially from 100 ms to 1 s, up to 5 attempts in total.
pub fn with_busy_backoff<T>(mut f: impl FnMut() -> Result<T, LinkError>) -> Result<T, LinkError> {
    let mut delay = BUSY_BACKOFF_START;
    let mut attempt = 1;
    loop {
        match f() {
            Err(e) if e.is_busy() && attempt < BUSY_MAX_ATTEMPTS => {
                debug!("device busy (attempt {attempt}), retrying in {delay:?}");
                thread::sleep(delay);
                delay = (delay * 2).min(BUSY_BACKOFF_CAP);
                attempt += 1;
            }
            other => return other,
        }
    }
}

pub fn get_device_info<P: Pipes>(link: &mut Link<P>) -> Result<DeviceInfo, LinkError> {
    let (resp, data) = link.execute_in_buffered(ops::GET_DEVICE_INFO, &[])?;
    resp.ok()?;
    Ok(DeviceInfo::decode(&data)?)
}

pub fn get_storage_ids<P: Pipes>(link: &mut Link<P>) -> Result<Vec<u32>, LinkError> {
    with_busy_backoff(|| {
        let (resp, data) = link.execute_in_buffered(ops::GET_STORAGE_IDS, &[])?;
        resp.ok()?;
        Reader::new(&data)
            .array_u32()
            .ok_or(LinkError::Malformed("storage id array truncated"))
    })
}

pub fn get_storage_info<P: Pipes>(
    link: &mut Link<P>,
    storage_id: u32,
) -> Result<StorageInfo, LinkError> {
    with_busy_backoff(|| {
        let (resp, data) = link.execute_in_buffered(ops::GET_STORAGE_INFO, &[storage_id])?;
        resp.ok()?;
        Ok(StorageInfo::decode(&data)?)
    })
}

/// Handles in `storage` under `parent`. `format` filters by object format
/// (`None` = all); `parent` follows the device's root conventions, which
/// the gateway resolves from policy.
pub fn get_object_handles<P: Pipes>(
    link: &mut Link<P>,
    storage_id: u32,
    format: Option<u16>,
    parent: u32,
) -> Result<Vec<u32>, LinkError> {
    let params = [storage_id, format.map_or(0, u32::from), parent];
    let (resp, data) = link.execute_in_buffered(ops::GET_OBJECT_HANDLES, &params)?;
    resp.ok()?;
    Reader::new(&data)
        .array_u32()
        .ok_or(LinkError::Malformed("object handle array truncated"))
}

pub fn get_object_info<P: Pipes>(
    link: &mut Link<P>,
    handle: u32,
) -> Result<ObjectInfo, LinkError> {
    let (resp, data) = link.execute_in_buffered(ops::GET_OBJECT_INFO, &[handle])?;
    resp.ok()?;
    Ok(ObjectInfo::decode(&data)?)
}

/// Streams the whole object to `sink`; returns the byte count delivered.
pub fn get_object<P: Pipes>(
    link: &mut Link<P>,
    handle: u32,
    sink: DataSink,
) -> Result<u64, LinkError> {
    let mut delivered = 0u64;
    let mut counting = |chunk: &[u8]| -> Result<(), LinkError> {
        delivered += chunk.len() as u64;
        sink(chunk)
    };
    let resp = link.execute_in(ops::GET_OBJECT, &[handle], &mut counting)?;
    resp.ok()?;
    Ok(delivered)
}

/// GetPartialObject (0x101B): 32-bit offset and length.
pub fn get_partial_object<P: Pipes>(
    link: &mut Link<P>,
    handle: u32,
    offset: u32,
    len: u32,
    sink: DataSink,
) -> Result<u64, LinkError> {
    let mut delivered = 0u64;
    let mut counting = |chunk: &[u8]| -> Result<(), LinkError> {
        delivered += chunk.len() as u64;
        sink(chunk)
    };
    let resp = link.execute_in(ops::GET_PARTIAL_OBJECT, &[handle, offset, len], &mut counting)?;
    resp.ok()?;
    Ok(delivered)
}

/// GetPartialObject64 (0x95C4): 64-bit offset split low/high.
pub fn get_partial_object_64<P: Pipes>(
    link: &mut Link<P>,
    handle: u32,
    offset: u64,
    len: u32,
    sink: DataSink,
) -> Result<u64, LinkError> {
    let mut delivered = 0u64;
    let mut counting = |chunk: &[u8]| -> Result<(), LinkError> {
        delivered += chunk.len() as u64;
        sink(chunk)
    };
    let params = [handle, offset as u32, (offset >> 32) as u32, len];
    let resp = link.execute_in(ops::GET_PARTIAL_OBJECT_64, &params, &mut counting)?;
    resp.ok()?;
    Ok(delivered)
}

/// SendObjectInfo: announces the object to create. Returns the
/// `(storage_id, parent_handle, new_handle)` triple from the response.
pub fn send_object_info<P: Pipes>(
    link: &mut Link<P>,
    storage_id: u32,
    parent: u32,
    info: &ObjectInfo,
) -> Result<(u32, u32, u32), LinkError> {
    let data = info.encode();
    let total = data.len() as u64;
    let mut cursor = 0usize;
    let mut source = |buf: &mut [u8]| -> Result<usize, LinkError> {
        let n = (data.len() - cursor).min(buf.len());
        buf[..n].copy_from_slice(&data[cursor..cursor + n]);
        cursor += n;
        Ok(n)
    };
    let resp = link.execute_out(
        ops::SEND_OBJECT_INFO,
        &[storage_id, parent],
        total,
        &mut source,
    )?;
    resp.ok()?;
    match (resp.param(0), resp.param(1), resp.param(2)) {
        (Some(storage), Some(parent), Some(handle)) => Ok((storage, parent, handle)),
        _ => Err(LinkError::Malformed("SendObjectInfo response lacks parameters")),
    }
}

/// SendObject: streams the object bytes announced by the preceding
/// SendObjectInfo.
pub fn send_object<P: Pipes>(
    link: &mut Link<P>,
    total: u64,
    source: DataSource,
) -> Result<(), LinkError> {
    let resp = link.execute_out(ops::SEND_OBJECT, &[], total, source)?;
    resp.ok()
}

/// SendPartialObject (0x95C1): writes `len` bytes at `offset` of an
/// existing object.
pub fn send_partial_object<P: Pipes>(
    link: &mut Link<P>,
    handle: u32,
    offset: u64,
    len: u32,
    source: DataSource,
) -> Result<(), LinkError> {
    let params = [handle, offset as u32, (offset >> 32) as u32, len];
    let resp = link.execute_out(ops::SEND_PARTIAL_OBJECT, &params, len as u64, source)?;
    resp.ok()
}

/// Grows or shrinks an object being edited (0x95C2).
pub fn truncate_object<P: Pipes>(
    link: &mut Link<P>,
    handle: u32,
    size: u64,
) -> Result<(), LinkError> {
    let params = [handle, size as u32, (size >> 32) as u32];
    link.execute(ops::TRUNCATE_OBJECT, &params)?.ok()
}

pub fn begin_edit_object<P: Pipes>(link: &mut Link<P>, handle: u32) -> Result<(), LinkError> {
    link.execute(ops::BEGIN_EDIT_OBJECT, &[handle])?.ok()
}

pub fn end_edit_object<P: Pipes>(link: &mut Link<P>, handle: u32) -> Result<(), LinkError> {
    link.execute(ops::END_EDIT_OBJECT, &[handle])?.ok()
}

pub fn delete_object<P: Pipes>(link: &mut Link<P>, handle: u32) -> Result<(), LinkError> {
    link.execute(ops::DELETE_OBJECT, &[handle, 0])?.ok()
}

pub fn move_object<P: Pipes>(
    link: &mut Link<P>,
    handle: u32,
    storage_id: u32,
    new_parent: u32,
) -> Result<(), LinkError> {
    link.execute(ops::MOVE_OBJECT, &[handle, storage_id, new_parent])?
        .ok()
}

/// GetObjectPropList for one object: every property, no recursion.
pub fn get_object_prop_list<P: Pipes>(
    link: &mut Link<P>,
    handle: u32,
) -> Result<Vec<PropListEntry>, LinkError> {
    // params: handle, format filter (0), prop code (0xFFFFFFFF = all),
    // group code (0), depth (0).
    let params = [handle, 0, 0xFFFF_FFFF, 0, 0];
    let (resp, data) = link.execute_in_buffered(ops::GET_OBJECT_PROP_LIST, &params)?;
    resp.ok()?;
    Ok(PropListEntry::decode_list(&data)?)
}

/// GetObjectPropList over the *children* of `parent` (depth 1): the bulk
/// enumeration fast path, one transaction for a whole folder.
pub fn get_object_prop_list_children<P: Pipes>(
    link: &mut Link<P>,
    parent: u32,
) -> Result<Vec<PropListEntry>, LinkError> {
    let params = [parent, 0, 0xFFFF_FFFF, 0, 1];
    let (resp, data) = link.execute_in_buffered(ops::GET_OBJECT_PROP_LIST, &params)?;
    resp.ok()?;
    Ok(PropListEntry::decode_list(&data)?)
}

/// GetObjectPropValue for an unsigned integer property (e.g. the 64-bit
/// ObjectSize).
pub fn get_object_prop_value_u64<P: Pipes>(
    link: &mut Link<P>,
    handle: u32,
    prop_code: u16,
) -> Result<u64, LinkError> {
    let (resp, data) =
        link.execute_in_buffered(ops::GET_OBJECT_PROP_VALUE, &[handle, prop_code as u32])?;
    resp.ok()?;
    let mut r = Reader::new(&data);
    match data.len() {
        8 => r.u64(),
        4 => r.u32().map(u64::from),
        2 => r.u16().map(u64::from),
        _ => None,
    }
    .ok_or(LinkError::Malformed("unexpected property value width"))
}

/// The object size, preferring the 64-bit ObjectSize property.
pub fn get_object_size<P: Pipes>(link: &mut Link<P>, handle: u32) -> Result<u64, LinkError> {
    get_object_prop_value_u64(link, handle, prop::OBJECT_SIZE)
}

/// GetDevicePropValue for a string property (e.g. the friendly name).
pub fn get_device_prop_value_string<P: Pipes>(
    link: &mut Link<P>,
    prop_code: u16,
) -> Result<String, LinkError> {
    let (resp, data) = link.execute_in_buffered(ops::GET_DEVICE_PROP_VALUE, &[prop_code as u32])?;
    resp.ok()?;
    Reader::new(&data)
        .string()
        .ok_or(LinkError::Malformed("property string truncated"))
}

/// The device's advertised friendly name, when it has one.
pub fn get_friendly_name<P: Pipes>(link: &mut Link<P>) -> Result<String, LinkError> {
    get_device_prop_value_string(link, prop::DEVICE_FRIENDLY_NAME)
}
