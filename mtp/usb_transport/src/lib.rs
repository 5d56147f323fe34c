//! The USB transport: turns a physical USB device into a claimed pair of
//! bulk pipes (plus an optional interrupt endpoint) ready for PTP framing.
//!
//! The important items are summarized below:
//! * [`enumerate`]: walks the bus and yields a [`DeviceSummary`] for every
//!   device exposing an MTP-capable interface, either the standard
//!   still-image-capture triple (0x06, 0x01, 0x01) or a vendor-specific
//!   (0xFF) interface whose name mentions MTP.
//! * [`select`]: the scored ranking that picks the best alternate setting
//!   among the candidates, retaining a [`select::SelectionReport`] of what
//!   was chosen, what was skipped, and why.
//! * [`UsbTransport`]: the claimed interface. Performs the claim ladder
//!   (kernel-driver detach, configuration, alternate setting, claim,
//!   optional reset, stabilization sleeps), owns the bulk pipes, and
//!   releases everything on drop.
//!
//! Timeouts are a distinct, recoverable error class from hard I/O errors;
//! the link layer above retries or resynchronizes on them where the policy
//! allows.

mod select;
mod transport;

#[cfg(test)]
mod test;

pub use select::{CandidateReport, LinkDescriptor, RawEndpoint, RawInterface, SelectionReport};
pub use transport::{enumerate, probe_fingerprint, InterruptPipe, UsbTransport};

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// A device discovered on the bus. Created by [`enumerate`], read-only
/// afterwards; the key used to open a link to the device.
#[derive(Clone, Debug)]
pub struct DeviceSummary {
    /// The stable identity resolved at discovery time.
    pub stable_id: Uuid,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    pub usb_serial: Option<String>,
}

impl DeviceSummary {
    /// A short human label, e.g. `"Pixel 7 (18d1:4ee1 bus 1 addr 7)"`.
    pub fn label(&self) -> String {
        format!(
            "{} ({:04x}:{:04x} bus {} addr {})",
            self.model.as_deref().unwrap_or("unknown model"),
            self.vendor_id,
            self.product_id,
            self.bus,
            self.address
        )
    }
}

/// Transport-layer failures, classified per the claim/I-O contract.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Enumeration found no device matching the request.
    #[error("no MTP-capable device matched")]
    NoDevice,
    /// Another process (or kernel driver) holds the interface.
    #[error("MTP interface {interface} is held elsewhere; close other MTP clients and retry")]
    ClaimConflict {
        interface: u8,
        #[source]
        libusb: rusb::Error,
    },
    /// Detaching or reattaching the kernel driver failed.
    #[error("kernel driver operation failed on interface {interface}")]
    KernelDriver {
        interface: u8,
        #[source]
        libusb: rusb::Error,
    },
    /// A transfer did not complete in time. Recoverable; distinct from
    /// [`TransportError::Io`].
    #[error("USB transfer timed out after {0:?}")]
    Timeout(Duration),
    #[error("device is busy")]
    Busy,
    #[error("access to the device was denied (udev rules?)")]
    AccessDenied,
    #[error("the device disconnected")]
    Disconnected,
    /// The first bulk transfer after a claim stalled: the device wants a
    /// reset before it will talk.
    #[error("device accepted the claim but stalls on traffic; a reset is required")]
    HandshakeBlocked,
    /// No candidate interface had both bulk pipes.
    #[error("no usable MTP interface: {0}")]
    NoUsableInterface(String),
    /// Anything else libusb reports.
    #[error("USB I/O failed during {during}")]
    Io {
        during: &'static str,
        #[source]
        libusb: rusb::Error,
    },
    /// The identity store refused to resolve a stable id at discovery.
    #[error("identity store failure: {0}")]
    Identity(String),
}

impl TransportError {
    /// Whether a retry at a higher layer can plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Busy | TransportError::HandshakeBlocked
        )
    }
}

/// Maps a libusb error into the transport taxonomy for transfer paths.
pub(crate) fn map_io(e: rusb::Error, during: &'static str, timeout: Duration) -> TransportError {
    match e {
        rusb::Error::Timeout => TransportError::Timeout(timeout),
        rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::Disconnected,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Access => TransportError::AccessDenied,
        other => TransportError::Io {
            during,
            libusb: other,
        },
    }
}
