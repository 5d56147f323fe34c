//! The PTP link: a synchronous, single-transaction-at-a-time engine that
//! speaks container framing over a claimed pair of bulk pipes.
//!
//! The important items are summarized below:
//! * [`Pipes`]: the seam between the engine and the transport. The real
//!   [`usb_transport::UsbTransport`] implements it, and so does the
//!   in-memory scripted device the tests drive.
//! * [`Link`]: the engine itself. Owns the transaction-id counter, the
//!   session state machine, and the streaming data-phase logic (chunked
//!   reads/writes, short-packet and ZLP handling).
//! * [`ops`]: typed wrappers for each operation the runtime uses, built on
//!   [`Link::execute`] and its streaming variants.
//! * [`Response`]: what a transaction yields, the response code and its
//!   u32 parameters.
//!
//! Exactly one transaction is ever in flight: every entry point takes
//! `&mut self` and runs command, data phase, and response to completion (or
//! failure) before returning. A started container read or write is never
//! left half-framed; failures poison the session state instead.

pub mod ops;

mod engine;

pub use engine::{DataSink, DataSource, Link, Response, TransactionRecord, RING_CAP};

use std::time::Duration;

use thiserror::Error;
use usb_transport::{TransportError, UsbTransport};

/// Where the engine reads and writes bulk data. Implemented by the USB
/// transport and by the virtual test device.
pub trait Pipes: Send {
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;
    fn write_bulk(&mut self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError>;
    /// Max packet size of the bulk-in endpoint; governs short-packet and
    /// ZLP behavior.
    fn max_packet_size(&self) -> usize;
}

impl Pipes for UsbTransport {
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        UsbTransport::read_bulk(self, buf, timeout)
    }

    fn write_bulk(&mut self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        UsbTransport::write_bulk(self, buf, timeout)
    }

    fn max_packet_size(&self) -> usize {
        UsbTransport::max_packet_size(self)
    }
}

impl<P: Pipes + ?Sized> Pipes for Box<P> {
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read_bulk(buf, timeout)
    }

    fn write_bulk(&mut self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).write_bulk(buf, timeout)
    }

    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }
}

/// The session lifecycle. Transitions are driven by [`Link`]; a fatal wire
/// failure lands in `Lost` and only a fresh open recovers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Open,
    InTransaction,
    Closing,
    Closed,
    Lost,
}

/// Link-layer failures.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The device answered with a non-OK response code.
    #[error("device error {code:#06x} ({name})")]
    Device { code: u16, name: &'static str },
    /// The device reported the session as already open (0x201E) even after
    /// the engine's one-shot close-and-retry.
    #[error("session already open")]
    SessionAlreadyOpen,
    /// The wire desynchronized beyond recovery.
    #[error("session lost: {0}")]
    SessionLost(&'static str),
    /// An operation needs an open session and there is none.
    #[error("session is not open")]
    NotOpen,
    #[error(transparent)]
    Wire(#[from] ptp_wire::WireError),
    /// A structurally valid response that does not carry what the
    /// operation requires (e.g. missing parameters).
    #[error("malformed response: {0}")]
    Malformed(&'static str),
    /// A streaming handler refused or failed mid-phase.
    #[error("data phase handler failed: {0}")]
    Handler(String),
    /// A streaming handler observed cancellation at a chunk boundary.
    #[error("cancelled")]
    Cancelled,
    /// A streaming handler observed its deadline at a chunk boundary.
    #[error("deadline expired")]
    Deadline,
}

impl LinkError {
    /// Builds the device-error variant with its code name attached.
    pub fn device(code: u16) -> Self {
        LinkError::Device {
            code,
            name: ptp_wire::rc::name(code),
        }
    }

    /// The raw response code, when this error carries one.
    pub fn response_code(&self) -> Option<u16> {
        match self {
            LinkError::Device { code, .. } => Some(*code),
            LinkError::SessionAlreadyOpen => Some(ptp_wire::rc::SESSION_ALREADY_OPEN),
            _ => None,
        }
    }

    /// True when retrying after a delay could help (DeviceBusy).
    pub fn is_busy(&self) -> bool {
        self.response_code() == Some(ptp_wire::rc::DEVICE_BUSY)
    }
}
