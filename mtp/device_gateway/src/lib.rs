//! The operation gateway: the only path through which higher layers touch
//! an MTP link.
//!
//! One gateway owns one device. Internally it is an actor: a worker thread
//! owns the link exclusively, callers submit work items onto a priority
//! queue (critical > high > medium > low, FIFO within a band), and every
//! item runs to completion with a deadline and a cancellation token
//! checked at each chunk boundary. Operations with several possible wire
//! implementations descend a recorded fallback ladder; streaming transfers
//! coordinate with the durable journal for crash-safe resume.
//!
//! The public surface is:
//! * [`connect`]: resolve policy, claim, open the session (running the
//!   reset ladder for handshake-blocked devices), probe capabilities, and
//!   hand back an [`MtpDeviceHandle`].
//! * [`MtpDevice`]: the device facade: info, storages, list, read, write,
//!   create_folder, delete, move, events, diagnostics.
//! * [`MtpError`]: the error taxonomy of the whole runtime, with the
//!   user-message table and the process exit-code contract.

mod actor;
mod session;
mod transfers;

#[cfg(test)]
mod test;

pub use actor::{CancelToken, Gateway, OpContext, OpHandle, Priority};
pub use session::{connect, Connector, DeviceSession, GatewayDeps, MtpDeviceHandle, UsbConnector};

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

use event_pump::Events;
use mtp_policy::{EffectivePolicy, PolicyError};
use ptp_link::{LinkError, TransactionRecord};
use ptp_wire::{rc, DeviceInfo};
use serde::Serialize;
use thiserror::Error;
use transfer_journal::JournalError;
use usb_transport::{SelectionReport, TransportError};

/// A storage volume as the facade reports it. Ephemeral; re-read on
/// demand.
#[derive(Clone, Debug, Serialize)]
pub struct StorageSummary {
    pub id: u32,
    pub description: String,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    pub read_only: bool,
}

/// An object as the facade reports it.
#[derive(Clone, Debug, Serialize)]
pub struct ObjectSummary {
    pub handle: u32,
    pub storage_id: u32,
    pub parent: Option<u32>,
    pub name: String,
    /// `None` when the device reports the 32-bit overflow sentinel and the
    /// 64-bit size property is unavailable.
    pub size: Option<u64>,
    /// The raw PTP modification-date string, when the device provides one.
    pub mtime: Option<String>,
    pub format_code: u16,
    pub is_folder: bool,
    /// Any further properties enumeration surfaced, keyed by property
    /// code, rendered as strings.
    pub properties: BTreeMap<u16, String>,
}

/// One attempt from a fallback ladder, rendered for callers.
#[derive(Clone, Debug, Serialize)]
pub struct AttemptView {
    pub label: &'static str,
    pub succeeded: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl From<&fallback_ladder::Attempt> for AttemptView {
    fn from(attempt: &fallback_ladder::Attempt) -> Self {
        let (succeeded, error) = match &attempt.outcome {
            fallback_ladder::AttemptOutcome::Succeeded => (true, None),
            fallback_ladder::AttemptOutcome::Failed(e) => (false, Some(e.clone())),
        };
        AttemptView {
            label: attempt.label,
            succeeded,
            error,
            elapsed_ms: attempt.elapsed.as_millis() as u64,
        }
    }
}

/// The outcome of a streaming transfer.
#[derive(Clone, Debug, Serialize)]
pub struct TransferOutcome {
    pub bytes_transferred: u64,
    /// Offset the transfer continued from (zero for a fresh start).
    pub resumed_from: u64,
    /// For writes: the handle of the created object.
    pub handle: Option<u32>,
    /// The strategy attempts the transfer made, in order.
    pub attempts: Vec<AttemptView>,
}

/// A point-in-time view of the gateway's internals for support tooling.
#[derive(Clone, Debug, Serialize)]
pub struct DiagnosticsSnapshot {
    pub device_id: String,
    pub model: String,
    pub policy: EffectivePolicy,
    pub selection: Option<SelectionReport>,
    /// The tail of the transaction ring.
    pub transactions: Vec<TransactionRecord>,
    /// Recent ladder runs: operation name plus attempts.
    pub ladders: Vec<(String, Vec<AttemptView>)>,
}

/// A progress callback: `(bytes_done, bytes_total)`.
pub type ProgressFn = Box<dyn FnMut(u64, u64) + Send>;

/// The device facade consumed by external collaborators. All methods are
/// safe to call from any thread; execution is serialized on the device's
/// actor.
pub trait MtpDevice: Send + Sync {
    fn info(&self) -> Result<DeviceInfo, MtpError>;
    fn storages(&self) -> Result<Vec<StorageSummary>, MtpError>;
    /// The objects directly under `parent` (`None` = storage root).
    fn list(&self, storage: u32, parent: Option<u32>) -> Result<Vec<ObjectSummary>, MtpError>;
    fn get_info(&self, handle: u32) -> Result<ObjectSummary, MtpError>;
    /// Streams an object (or a byte range of it) to `destination`,
    /// resumably.
    fn read(
        &self,
        handle: u32,
        range: Option<Range<u64>>,
        destination: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<TransferOutcome, MtpError>;
    /// Streams a local file to a new object under `parent`.
    fn write(
        &self,
        parent: Option<u32>,
        name: &str,
        size: u64,
        source: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<TransferOutcome, MtpError>;
    fn create_folder(&self, parent: Option<u32>, name: &str, storage: u32)
        -> Result<u32, MtpError>;
    fn delete(&self, handle: u32, recursive: bool) -> Result<(), MtpError>;
    fn r#move(&self, handle: u32, new_parent: Option<u32>) -> Result<(), MtpError>;
    /// Opens the session if it is not already open; the critical prelude
    /// every other operation implies.
    fn ensure_session(&self) -> Result<(), MtpError>;
    /// The device's event sequence. Takeable once; `None` when the pump is
    /// disabled by policy or the interface has no interrupt endpoint.
    fn events(&self) -> Option<Events>;
    fn diagnostics(&self) -> Result<DiagnosticsSnapshot, MtpError>;
}

/// The runtime error taxonomy: transport, protocol, semantic, and flow
/// kinds, with both the raw device code and a human string exposed.
#[derive(Debug, Error)]
pub enum MtpError {
    // Transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    // Protocol: the raw device response, when no semantic kind applies.
    #[error("device error {code:#06x} ({name})")]
    Device { code: u16, name: &'static str },
    #[error("protocol desynchronized: {0}")]
    Session(String),

    // Semantic.
    #[error("object not found")]
    ObjectNotFound,
    #[error("object is write-protected")]
    ObjectWriteProtected,
    #[error("storage is full")]
    StorageFull,
    #[error("storage is read-only")]
    ReadOnly,
    #[error("precondition failed: {reason}")]
    PreconditionFailed { reason: String },
    #[error("not supported: {detail}")]
    NotSupported { detail: String },

    // Flow.
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation deadline expired")]
    DeadlineExpired,

    // Local machinery.
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("local file I/O failed: {0}")]
    File(#[from] std::io::Error),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LinkError> for MtpError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Transport(t) => MtpError::Transport(t),
            LinkError::Cancelled => MtpError::Cancelled,
            LinkError::Deadline => MtpError::DeadlineExpired,
            LinkError::SessionAlreadyOpen => MtpError::Device {
                code: rc::SESSION_ALREADY_OPEN,
                name: rc::name(rc::SESSION_ALREADY_OPEN),
            },
            LinkError::SessionLost(why) => MtpError::Session(why.to_string()),
            LinkError::NotOpen => MtpError::Session("session is not open".into()),
            LinkError::Wire(w) => MtpError::Session(w.to_string()),
            LinkError::Malformed(m) => MtpError::Session(m.to_string()),
            LinkError::Handler(detail) => {
                MtpError::File(std::io::Error::new(std::io::ErrorKind::Other, detail))
            }
            LinkError::Device { code, name } => match code {
                rc::INVALID_OBJECT_HANDLE => MtpError::ObjectNotFound,
                rc::OBJECT_WRITE_PROTECTED => MtpError::ObjectWriteProtected,
                rc::STORE_FULL | rc::OBJECT_TOO_LARGE => MtpError::StorageFull,
                rc::STORE_READ_ONLY => MtpError::ReadOnly,
                rc::OPERATION_NOT_SUPPORTED => MtpError::NotSupported {
                    detail: "operation not supported by this device".into(),
                },
                _ => MtpError::Device { code, name },
            },
        }
    }
}

impl MtpError {
    /// The raw response code behind this error, when one exists.
    pub fn response_code(&self) -> Option<u16> {
        match self {
            MtpError::Device { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether retrying later can plausibly succeed.
    pub fn is_temporary(&self) -> bool {
        match self {
            MtpError::Transport(t) => t.is_recoverable(),
            MtpError::Device { code, .. } => *code == rc::DEVICE_BUSY,
            MtpError::Session(_) | MtpError::DeadlineExpired => true,
            _ => false,
        }
    }

    /// A concise, action-oriented message for end users. The raw code
    /// stays available via [`MtpError::response_code`] so higher layers
    /// can localize.
    pub fn user_message(&self) -> String {
        match self {
            MtpError::Transport(TransportError::NoDevice) => {
                "No MTP device found. Unlock the phone and select File transfer mode.".into()
            }
            MtpError::Transport(TransportError::ClaimConflict { .. }) => {
                "Another program is using this device. Close other file-transfer apps and retry."
                    .into()
            }
            MtpError::Transport(TransportError::AccessDenied) => {
                "Permission to access the device was denied. Check udev rules or run with access."
                    .into()
            }
            MtpError::Transport(TransportError::Disconnected) => {
                "The device disconnected. Reconnect the cable and retry.".into()
            }
            MtpError::Transport(TransportError::Timeout(_)) => {
                "The device stopped responding. Retry; replug if it persists.".into()
            }
            MtpError::Transport(t) => format!("USB transfer failed: {t}."),
            MtpError::Device { code, name } => {
                format!("The device refused the operation ({name}, code {code:#06x}).")
            }
            MtpError::Session(_) => {
                "The connection desynchronized; it will be re-opened on the next operation.".into()
            }
            MtpError::ObjectNotFound => "That file no longer exists on the device.".into(),
            MtpError::ObjectWriteProtected => "That file is write-protected on the device.".into(),
            MtpError::StorageFull => "The device storage is full.".into(),
            MtpError::ReadOnly => "The device storage is read-only.".into(),
            MtpError::PreconditionFailed { reason } => {
                format!("The operation no longer applies: {reason}.")
            }
            MtpError::NotSupported { detail } => format!("Unsupported by this device: {detail}."),
            MtpError::Cancelled => "The operation was cancelled.".into(),
            MtpError::DeadlineExpired => "The operation took too long and was abandoned.".into(),
            MtpError::Journal(e) => format!("The transfer journal failed: {e}."),
            MtpError::File(e) => format!("A local file operation failed: {e}."),
            MtpError::Policy(e) => format!("Bad configuration: {e}."),
            MtpError::Internal(e) => format!("Internal error: {e}."),
        }
    }

    /// The process exit-code contract: 0 ok, 64 usage, 69 unavailable,
    /// 70 software, 75 temporary (retry).
    pub fn exit_code(&self) -> i32 {
        match self {
            MtpError::Policy(_) => 64,
            MtpError::Transport(
                TransportError::NoDevice
                | TransportError::Disconnected
                | TransportError::ClaimConflict { .. }
                | TransportError::AccessDenied
                | TransportError::NoUsableInterface(_),
            ) => 69,
            e if e.is_temporary() => 75,
            MtpError::Cancelled => 75,
            _ => 70,
        }
    }
}
