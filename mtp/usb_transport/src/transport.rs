//! Enumeration, claiming, and raw pipe I/O over libusb.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use device_identity::{Fingerprint, IdentitySignals, IdentityStore};
use log::{debug, info, trace, warn};
use mtp_policy::EffectivePolicy;
use rusb::{Device, DeviceHandle, Direction, GlobalContext, TransferType};

use crate::select::{self, LinkDescriptor, RawEndpoint, RawInterface, SelectionReport};
use crate::{map_io, DeviceSummary, TransportError};

/// Floor applied to the stabilization sleep when the policy flag
/// `require_stabilization` is set.
const FORCED_STABILIZE: Duration = Duration::from_millis(500);

/// Walks the bus and summarizes every device that exposes an MTP-capable
/// interface. Devices that cannot be opened (permissions, races with
/// unplug) are skipped with a debug log rather than failing the walk.
pub fn enumerate(identities: &IdentityStore) -> Result<Vec<DeviceSummary>, TransportError> {
    let devices = rusb::devices().map_err(|e| TransportError::Io {
        during: "device list",
        libusb: e,
    })?;
    let mut out = Vec::new();
    for device in devices.iter() {
        match summarize(&device, identities) {
            Ok(Some(summary)) => {
                debug!("found MTP candidate {}", summary.label());
                out.push(summary);
            }
            Ok(None) => {}
            Err(e) => debug!(
                "skipping bus {} addr {}: {e}",
                device.bus_number(),
                device.address()
            ),
        }
    }
    Ok(out)
}

fn summarize(
    device: &Device<GlobalContext>,
    identities: &IdentityStore,
) -> Result<Option<DeviceSummary>, TransportError> {
    let desc = device.device_descriptor().map_err(|e| TransportError::Io {
        during: "device descriptor",
        libusb: e,
    })?;

    // Structural pre-filter before paying for an open: either the exact
    // still-image triple, or a vendor-specific interface with a bulk pair
    // whose name we will check once the device is open.
    let raw = match raw_interfaces(device, None) {
        Ok(raw) => raw,
        Err(e) => {
            trace!("no readable config descriptor: {e}");
            return Ok(None);
        }
    };
    let structurally_plausible = raw.iter().any(|i| {
        let has_bulk_pair = i
            .endpoints
            .iter()
            .any(|e| e.is_bulk && e.direction_in)
            && i.endpoints.iter().any(|e| e.is_bulk && !e.direction_in);
        has_bulk_pair && (i.is_mtp_candidate() || i.class == 0xFF)
    });
    if !structurally_plausible {
        return Ok(None);
    }

    let handle = device.open().map_err(|e| TransportError::Io {
        during: "open",
        libusb: e,
    })?;
    let named = raw_interfaces(device, Some(&handle)).map_err(|e| TransportError::Io {
        during: "config descriptor",
        libusb: e,
    })?;
    if !named.iter().any(RawInterface::is_mtp_candidate) {
        return Ok(None);
    }

    let read_string = |index: Option<u8>| {
        index.and_then(|i| handle.read_string_descriptor_ascii(i).ok())
    };
    let usb_serial = read_string(desc.serial_number_string_index());
    let signals = IdentitySignals {
        vid: desc.vendor_id(),
        pid: desc.product_id(),
        bus: device.bus_number(),
        address: device.address(),
        usb_serial: usb_serial.clone(),
        mtp_serial: None,
    };
    let identity = identities
        .resolve_identity(&signals)
        .map_err(|e| TransportError::Identity(e.to_string()))?;

    Ok(Some(DeviceSummary {
        stable_id: identity.id,
        manufacturer: read_string(desc.manufacturer_string_index()),
        model: read_string(desc.product_string_index()),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        bus: device.bus_number(),
        address: device.address(),
        usb_serial,
    }))
}

/// Reduces a device's active configuration to ranking inputs. Interface
/// names are only readable with an open handle; pass `None` to skip them.
fn raw_interfaces(
    device: &Device<GlobalContext>,
    handle: Option<&DeviceHandle<GlobalContext>>,
) -> Result<Vec<RawInterface>, rusb::Error> {
    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))?;
    let mut out = Vec::new();
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            let name = handle.and_then(|h| {
                desc.description_string_index()
                    .and_then(|i| h.read_string_descriptor_ascii(i).ok())
            });
            let endpoints = desc
                .endpoint_descriptors()
                .map(|ep| RawEndpoint {
                    address: ep.address(),
                    is_bulk: ep.transfer_type() == TransferType::Bulk,
                    is_interrupt: ep.transfer_type() == TransferType::Interrupt,
                    direction_in: ep.direction() == Direction::In,
                    max_packet: ep.max_packet_size(),
                })
                .collect();
            out.push(RawInterface {
                interface: desc.interface_number(),
                alt: desc.setting_number(),
                class: desc.class_code(),
                subclass: desc.sub_class_code(),
                protocol: desc.protocol_code(),
                name,
                endpoints,
            });
        }
    }
    Ok(out)
}

fn find_device(summary: &DeviceSummary) -> Result<Device<GlobalContext>, TransportError> {
    let devices = rusb::devices().map_err(|e| TransportError::Io {
        during: "device list",
        libusb: e,
    })?;
    for device in devices.iter() {
        if device.bus_number() != summary.bus || device.address() != summary.address {
            continue;
        }
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if desc.vendor_id() == summary.vendor_id && desc.product_id() == summary.product_id {
            return Ok(device);
        }
    }
    Err(TransportError::NoDevice)
}

/// Computes the fingerprint of `summary`'s device without claiming it:
/// opens the device, ranks its interfaces, and reads bcdDevice. Used to
/// resolve policy before the claim that policy governs.
pub fn probe_fingerprint(
    summary: &DeviceSummary,
) -> Result<(Fingerprint, SelectionReport), TransportError> {
    let device = find_device(summary)?;
    let desc = device.device_descriptor().map_err(|e| TransportError::Io {
        during: "device descriptor",
        libusb: e,
    })?;
    let handle = device.open().map_err(|e| match e {
        rusb::Error::Access => TransportError::AccessDenied,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::Disconnected,
        other => TransportError::Io {
            during: "open",
            libusb: other,
        },
    })?;
    let raw = raw_interfaces(&device, Some(&handle)).map_err(|e| TransportError::Io {
        during: "config descriptor",
        libusb: e,
    })?;
    let report = select::rank(&raw);
    let link = report.winner.clone().ok_or_else(|| {
        TransportError::NoUsableInterface("no candidate with a bulk pair".into())
    })?;
    let version = desc.device_version();
    let fingerprint = Fingerprint {
        vid: summary.vendor_id,
        pid: summary.product_id,
        bcd_device: ((version.major() as u16) << 8)
            | ((version.minor() as u16) << 4)
            | (version.sub_minor() as u16 & 0xF),
        interface_class: link.class,
        interface_subclass: link.subclass,
        interface_protocol: link.protocol,
        bulk_in: link.bulk_in,
        bulk_out: link.bulk_out,
        interrupt_in: link.interrupt_in,
        info_hash: None,
    };
    Ok((fingerprint, report))
}

/// A shared handle to the interrupt-in endpoint, owned exclusively by the
/// event pump for the life of a link.
#[derive(Clone)]
pub struct InterruptPipe {
    handle: Arc<DeviceHandle<GlobalContext>>,
    endpoint: u8,
}

impl InterruptPipe {
    /// One interrupt read. `Ok(None)` means the poll timed out with no
    /// event pending, which is the common case.
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, TransportError> {
        match self.handle.read_interrupt(self.endpoint, buf, timeout) {
            Ok(n) => Ok(Some(n)),
            Err(rusb::Error::Timeout) => Ok(None),
            Err(e) => Err(map_io(e, "interrupt read", timeout)),
        }
    }
}

/// A claimed MTP interface: the bulk pipes plus the bookkeeping needed to
/// release them cleanly on drop.
pub struct UsbTransport {
    handle: Arc<DeviceHandle<GlobalContext>>,
    descriptor: LinkDescriptor,
    fingerprint: Fingerprint,
    detached_kernel_driver: bool,
}

impl UsbTransport {
    /// Claims the best MTP interface of `summary`'s device, in the order
    /// the contract prescribes: open, optional kernel-driver detach, set
    /// configuration 1, select and set the alternate setting, claim,
    /// optional reset, stabilization sleeps.
    pub fn claim(
        summary: &DeviceSummary,
        policy: &EffectivePolicy,
    ) -> Result<(Self, SelectionReport), TransportError> {
        let device = find_device(summary)?;
        let desc = device.device_descriptor().map_err(|e| TransportError::Io {
            during: "device descriptor",
            libusb: e,
        })?;
        let mut handle = device.open().map_err(|e| match e {
            rusb::Error::Access => TransportError::AccessDenied,
            rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::Disconnected,
            other => TransportError::Io {
                during: "open",
                libusb: other,
            },
        })?;

        let raw = raw_interfaces(&device, Some(&handle)).map_err(|e| TransportError::Io {
            during: "config descriptor",
            libusb: e,
        })?;
        let report = select::rank(&raw);
        let link = report.winner.clone().ok_or_else(|| {
            TransportError::NoUsableInterface(format!(
                "{} candidates, none with a bulk pair and an MTP score",
                report.candidates.len()
            ))
        })?;

        let mut detached = false;
        if policy.flags.requires_kernel_detach && rusb::supports_detach_kernel_driver() {
            match handle.kernel_driver_active(link.interface) {
                Ok(true) => {
                    handle
                        .detach_kernel_driver(link.interface)
                        .map_err(|e| TransportError::KernelDriver {
                            interface: link.interface,
                            libusb: e,
                        })?;
                    debug!("detached kernel driver from interface {}", link.interface);
                    detached = true;
                }
                Ok(false) => {}
                Err(rusb::Error::NotSupported) => {}
                Err(e) => warn!("kernel_driver_active failed: {e}"),
            }
        }

        match handle.active_configuration() {
            Ok(1) => {}
            _ => {
                if let Err(e) = handle.set_active_configuration(1) {
                    // Many devices refuse while configured; claiming will
                    // tell us whether that mattered.
                    warn!("set_active_configuration(1) failed: {e}");
                }
            }
        }

        handle.claim_interface(link.interface).map_err(|e| match e {
            rusb::Error::Busy | rusb::Error::Access => TransportError::ClaimConflict {
                interface: link.interface,
                libusb: e,
            },
            rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::Disconnected,
            other => TransportError::Io {
                during: "claim",
                libusb: other,
            },
        })?;

        if link.alt_setting != 0 {
            handle
                .set_alternate_setting(link.interface, link.alt_setting)
                .map_err(|e| TransportError::Io {
                    during: "set alternate setting",
                    libusb: e,
                })?;
        }

        if policy.flags.reset_on_open {
            info!("policy requests a reset before first use");
            handle.reset().map_err(|e| TransportError::Io {
                during: "reset on open",
                libusb: e,
            })?;
            // The reset may drop the claim; take it again.
            if let Err(e) = handle.claim_interface(link.interface) {
                if e != rusb::Error::Busy {
                    return Err(TransportError::Io {
                        during: "re-claim after reset",
                        libusb: e,
                    });
                }
            }
        }

        let mut settle = policy.stabilize() + policy.post_claim_stabilize();
        if policy.flags.require_stabilization {
            settle = settle.max(FORCED_STABILIZE);
        }
        if !settle.is_zero() {
            trace!("stabilizing for {settle:?}");
            thread::sleep(settle);
        }

        let version = desc.device_version();
        let fingerprint = Fingerprint {
            vid: summary.vendor_id,
            pid: summary.product_id,
            bcd_device: ((version.major() as u16) << 8)
                | ((version.minor() as u16) << 4)
                | (version.sub_minor() as u16 & 0xF),
            interface_class: link.class,
            interface_subclass: link.subclass,
            interface_protocol: link.protocol,
            bulk_in: link.bulk_in,
            bulk_out: link.bulk_out,
            interrupt_in: link.interrupt_in,
            info_hash: None,
        };

        info!(
            "claimed {} interface {} alt {} (score {})",
            summary.label(),
            link.interface,
            link.alt_setting,
            report.score
        );
        Ok((
            UsbTransport {
                handle: Arc::new(handle),
                descriptor: link,
                fingerprint,
                detached_kernel_driver: detached,
            },
            report,
        ))
    }

    /// The one-shot recovery ladder for a handshake-blocked device: reset,
    /// wait, re-enumerate the bus position, claim again.
    pub fn reset_and_reclaim(
        summary: &DeviceSummary,
        policy: &EffectivePolicy,
    ) -> Result<(Self, SelectionReport), TransportError> {
        info!("running reset ladder for {}", summary.label());
        {
            let device = find_device(summary)?;
            let mut handle = device.open().map_err(|e| TransportError::Io {
                during: "open for reset",
                libusb: e,
            })?;
            if let Err(e) = handle.reset() {
                warn!("device reset failed: {e}");
            }
        }
        thread::sleep(policy.stabilize().max(FORCED_STABILIZE));
        Self::claim(summary, policy)
    }

    pub fn descriptor(&self) -> &LinkDescriptor {
        &self.descriptor
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Max packet size of the bulk-in endpoint.
    pub fn max_packet_size(&self) -> usize {
        self.descriptor.max_packet_size as usize
    }

    /// One bulk-in transfer. Returns the (possibly short) byte count.
    pub fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let n = self
            .handle
            .read_bulk(self.descriptor.bulk_in, buf, timeout)
            .map_err(|e| map_io(e, "bulk read", timeout))?;
        trace!("bulk-in {} bytes", n);
        Ok(n)
    }

    /// One bulk-out transfer. Returns the byte count actually accepted.
    pub fn write_bulk(&self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let n = self
            .handle
            .write_bulk(self.descriptor.bulk_out, buf, timeout)
            .map_err(|e| map_io(e, "bulk write", timeout))?;
        trace!("bulk-out {} bytes", n);
        Ok(n)
    }

    /// The interrupt pipe, if the selected interface has one. The event
    /// pump takes this and owns it for the life of the link.
    pub fn interrupt_pipe(&self) -> Option<InterruptPipe> {
        self.descriptor.interrupt_in.map(|endpoint| InterruptPipe {
            handle: Arc::clone(&self.handle),
            endpoint,
        })
    }

    /// Full device reset. Only possible while nothing else (the event
    /// pump) shares the handle; afterwards the claim is invalid and the
    /// transport must be re-created.
    pub fn reset(&mut self) -> Result<(), TransportError> {
        match Arc::get_mut(&mut self.handle) {
            Some(handle) => handle.reset().map_err(|e| TransportError::Io {
                during: "reset",
                libusb: e,
            }),
            None => Err(TransportError::Busy),
        }
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let interface = self.descriptor.interface;
        let detached = self.detached_kernel_driver;
        if let Some(handle) = Arc::get_mut(&mut self.handle) {
            let _ = handle.release_interface(interface);
            if detached {
                let _ = handle.attach_kernel_driver(interface);
            }
        } else {
            // An InterruptPipe clone is still alive; libusb will clean up
            // when the last reference drops, but the kernel driver stays
            // detached.
            warn!("dropping transport while the interrupt pipe is still shared");
        }
    }
}
