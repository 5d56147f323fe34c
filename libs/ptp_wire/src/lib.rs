//! The PTP/MTP wire format: everything that turns bytes into protocol
//! structures and back, with no knowledge of USB or sessions.
//!
//! The important items are summarized below:
//! * [`Reader`], [`Writer`]: little-endian cursor codecs for the primitive
//!   types PTP uses (u8 through u128, length-prefixed UTF-16LE strings,
//!   count-prefixed arrays). Truncated reads yield `None` rather than
//!   panicking.
//! * [`Container`], [`ContainerHeader`], [`ContainerKind`]: the framed
//!   message unit carried on the bulk pipes. A container is a 12-byte
//!   header `{len u32, type u16, code u16, txid u32}` followed by a payload;
//!   `len` includes the header.
//! * [`DeviceInfo`], [`StorageInfo`], [`ObjectInfo`], [`PropListEntry`]:
//!   the variable-length datasets exchanged in data phases.
//! * [`ops`], [`rc`], [`evt`], [`fmt`], [`prop`]: the operation, response,
//!   event, object-format, and property code tables, each with a `name()`
//!   lookup for diagnostics.
//!
//! All integers on the wire are little-endian. PTP strings are
//! length-prefixed (byte holds the count of UTF-16 units *including* the
//! terminator), UTF-16LE, NUL-terminated; an empty string is a single zero
//! byte.

mod codes;
mod container;
mod cursor;
mod dataset;

#[cfg(test)]
mod test;

pub use codes::{evt, fmt, ops, prop, rc};
pub use container::{Container, ContainerHeader, ContainerKind, CONTAINER_HEADER_LEN};
pub use cursor::{Reader, Writer};
pub use dataset::{DeviceInfo, ObjectInfo, PropListEntry, PropValue, StorageInfo};

use thiserror::Error;

/// Errors produced while decoding wire data.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WireError {
    /// The buffer ended before the structure was complete.
    #[error("truncated wire data: needed {needed} bytes, only {have} available")]
    Truncated { needed: usize, have: usize },
    /// A container's length field was inconsistent with its framing.
    #[error("bad container length {0} (must be >= 12 and match the payload)")]
    BadLength(u32),
    /// The container type field was not one of command/data/response/event.
    #[error("unknown container type {0:#06x}")]
    UnknownContainerKind(u16),
    /// A string field was malformed (e.g. missing its NUL terminator).
    #[error("malformed PTP string")]
    BadString,
}

/// The object handle value some vendors use to mean "the storage root".
pub const HANDLE_ROOT: u32 = 0xFFFF_FFFF;

/// The storage id wildcard ("all storages") used in GetObjectHandles and,
/// on some devices, in SendObjectInfo.
pub const STORAGE_ALL: u32 = 0xFFFF_FFFF;

/// The dataset value meaning "size does not fit in 32 bits"; the real size
/// must then come from the ObjectSize property.
pub const SIZE_OVERFLOW: u32 = 0xFFFF_FFFF;
