//! Session establishment and the worker-owned device state.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use device_identity::{Fingerprint, IdentityStore};
use event_pump::{EventPump, Events, InterruptSource};
use fallback_ladder::Ladder;
use learned_profiles::{percentile, ProfileStore, SessionSample};
use log::{debug, info, warn};
use mtp_policy::{resolve, EffectivePolicy, ProbedCapabilities};
use mtp_quirks::{PolicyPatch, QuirkDb};
use ptp_link::{ops, Link, LinkError, Pipes, SessionState};
use ptp_wire::{fmt, prop, DeviceInfo, ObjectInfo, PropListEntry, HANDLE_ROOT};
use transfer_journal::JournalStore;
use usb_transport::{SelectionReport, TransportError, UsbTransport};
use uuid::Uuid;

use crate::actor::{self, Gateway, OpContext, Priority};
use crate::{
    transfers, AttemptView, DiagnosticsSnapshot, MtpDevice, MtpError, ObjectSummary, ProgressFn,
    StorageSummary, TransferOutcome,
};

/// Bound on the retained ladder logs in the diagnostics snapshot.
const LADDER_LOG_CAP: usize = 50;

/// A stand-in for pipes that have been released. Holding the old claimed
/// transport while re-claiming would conflict with ourselves, so the link
/// is parked on this while a reclaim is in flight.
struct ClosedPipes;

impl Pipes for ClosedPipes {
    fn read_bulk(
        &mut self,
        _buf: &mut [u8],
        _timeout: std::time::Duration,
    ) -> Result<usize, TransportError> {
        Err(TransportError::Disconnected)
    }

    fn write_bulk(
        &mut self,
        _buf: &[u8],
        _timeout: std::time::Duration,
    ) -> Result<usize, TransportError> {
        Err(TransportError::Disconnected)
    }

    fn max_packet_size(&self) -> usize {
        512
    }
}

/// How a gateway reaches a claimable device. The USB implementation is
/// [`UsbConnector`]; tests substitute a scripted virtual device.
pub trait Connector: Send + 'static {
    /// The device fingerprint, computed without claiming.
    fn fingerprint(&mut self) -> Result<Fingerprint, MtpError>;
    /// Claims the device under `policy`, yielding the bulk pipes.
    fn claim(
        &mut self,
        policy: &EffectivePolicy,
    ) -> Result<(Box<dyn Pipes>, Option<SelectionReport>), MtpError>;
    /// The one-shot recovery for handshake-blocked devices: reset,
    /// re-enumerate, claim again.
    fn reset_and_reclaim(
        &mut self,
        policy: &EffectivePolicy,
    ) -> Result<(Box<dyn Pipes>, Option<SelectionReport>), MtpError>;
    /// The interrupt endpoint, once claimed; `None` when the interface has
    /// no interrupt-in.
    fn interrupt_source(&mut self) -> Option<Box<dyn InterruptSource>>;
    /// The stable identity of the physical device.
    fn device_id(&self) -> Uuid;
}

/// The real connector over a discovered USB device.
pub struct UsbConnector {
    summary: usb_transport::DeviceSummary,
    interrupt: Option<usb_transport::InterruptPipe>,
}

impl UsbConnector {
    pub fn new(summary: usb_transport::DeviceSummary) -> Self {
        UsbConnector {
            summary,
            interrupt: None,
        }
    }
}

impl Connector for UsbConnector {
    fn fingerprint(&mut self) -> Result<Fingerprint, MtpError> {
        let (fingerprint, _) = usb_transport::probe_fingerprint(&self.summary)?;
        Ok(fingerprint)
    }

    fn claim(
        &mut self,
        policy: &EffectivePolicy,
    ) -> Result<(Box<dyn Pipes>, Option<SelectionReport>), MtpError> {
        let (transport, report) = UsbTransport::claim(&self.summary, policy)?;
        self.interrupt = transport.interrupt_pipe();
        Ok((Box::new(transport), Some(report)))
    }

    fn reset_and_reclaim(
        &mut self,
        policy: &EffectivePolicy,
    ) -> Result<(Box<dyn Pipes>, Option<SelectionReport>), MtpError> {
        let (transport, report) = UsbTransport::reset_and_reclaim(&self.summary, policy)?;
        self.interrupt = transport.interrupt_pipe();
        Ok((Box::new(transport), Some(report)))
    }

    fn interrupt_source(&mut self) -> Option<Box<dyn InterruptSource>> {
        self.interrupt
            .take()
            .map(|pipe| Box::new(pipe) as Box<dyn InterruptSource>)
    }

    fn device_id(&self) -> Uuid {
        self.summary.stable_id
    }
}

/// Everything the gateway needs besides the device itself.
pub struct GatewayDeps {
    pub quirks: Arc<QuirkDb>,
    pub journal: Arc<dyn JournalStore>,
    pub profiles: Option<Arc<ProfileStore>>,
    pub identities: Option<Arc<IdentityStore>>,
    /// The pre-parsed user override layer.
    pub overrides: Option<PolicyPatch>,
}

/// Per-session observations folded into the learned-profile store on
/// shutdown.
#[derive(Debug, Default)]
pub(crate) struct SessionStats {
    pub handshake_ms: Option<f64>,
    pub throughput_samples: Vec<f64>,
    pub transfers_attempted: u32,
    pub transfers_succeeded: u32,
}

impl SessionStats {
    fn to_sample(&self, chunk_bytes: u32) -> SessionSample {
        let mut samples = self.throughput_samples.clone();
        SessionSample {
            chunk_bytes: (self.transfers_attempted > 0).then_some(chunk_bytes as f64),
            handshake_ms: self.handshake_ms,
            throughput_p50: percentile(&mut samples, 0.5),
            throughput_p90: percentile(&mut samples, 0.9),
            transfers_attempted: self.transfers_attempted,
            transfers_succeeded: self.transfers_succeeded,
        }
    }
}

/// The worker-owned state of one connected device.
pub struct DeviceSession {
    pub(crate) device_id: Uuid,
    /// The journal key for this device.
    pub(crate) device_key: String,
    pub(crate) link: Link<Box<dyn Pipes>>,
    pub(crate) policy: EffectivePolicy,
    pub(crate) device_info: DeviceInfo,
    pub(crate) fingerprint: Fingerprint,
    pub(crate) selection: Option<SelectionReport>,
    pub(crate) journal: Arc<dyn JournalStore>,
    pub(crate) profiles: Option<Arc<ProfileStore>>,
    pub(crate) stats: SessionStats,
    connector: Box<dyn Connector>,
    needs_resync: bool,
    session_id: u32,
    ladder_log: Vec<(String, Vec<AttemptView>)>,
}

impl DeviceSession {
    /// The critical prelude: every wire operation runs behind an open,
    /// synchronized session.
    pub fn ensure_ready(&mut self) -> Result<(), MtpError> {
        if self.link.state() == SessionState::Open && !self.needs_resync {
            return Ok(());
        }
        debug!("re-synchronizing session (state {:?})", self.link.state());
        self.link.close_session();
        if self.needs_resync && !self.policy.flags.skip_ptp_reset {
            // A PTP-level ResetDevice clears device-side transaction state
            // after a desync; devices that choke on it carry the skip
            // flag. Best-effort either way.
            if let Err(e) = self.link.execute(ptp_wire::ops::RESET_DEVICE, &[]) {
                debug!("ResetDevice before reopen failed (ignored): {e}");
            }
        }
        match self.link.open_session(self.session_id) {
            Ok(()) => {}
            Err(LinkError::Transport(_)) => {
                // The pipes themselves look dead; release them, then try
                // one full re-claim.
                warn!("session reopen failed at the transport; re-claiming");
                self.link = Link::new(Box::new(ClosedPipes), self.policy.clone());
                let (pipes, selection) = self.connector.reset_and_reclaim(&self.policy)?;
                if selection.is_some() {
                    self.selection = selection;
                }
                self.link = Link::new(pipes, self.policy.clone());
                self.link.open_session(self.session_id)?;
            }
            Err(e) => return Err(e.into()),
        }
        self.needs_resync = false;
        Ok(())
    }

    pub(crate) fn mark_needs_resync(&mut self, why: &str) {
        debug!("session needs resync: {why}");
        self.needs_resync = true;
    }

    /// Invoked by the worker after the inactivity timeout elapses with an
    /// empty queue.
    pub(crate) fn close_idle_session(&mut self) {
        if self.link.state() == SessionState::Open {
            debug!("closing idle session");
            self.link.close_session();
        }
    }

    pub(crate) fn record_ladder(&mut self, name: &str, attempts: &[AttemptView]) {
        if self.ladder_log.len() == LADDER_LOG_CAP {
            self.ladder_log.remove(0);
        }
        self.ladder_log.push((name.to_string(), attempts.to_vec()));
    }

    /// Maps the facade's `Option<parent>` to the wire convention for
    /// listing operations.
    fn wire_parent(parent: Option<u32>) -> u32 {
        parent.unwrap_or(HANDLE_ROOT)
    }

    pub(crate) fn storages(&mut self) -> Result<Vec<StorageSummary>, MtpError> {
        self.ensure_ready()?;
        let ids = ops::get_storage_ids(&mut self.link)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let info = ops::get_storage_info(&mut self.link, id)?;
            out.push(StorageSummary {
                id,
                description: if info.description.is_empty() {
                    info.volume_label.clone()
                } else {
                    info.description.clone()
                },
                capacity_bytes: info.max_capacity,
                free_bytes: info.free_space_bytes,
                read_only: info.read_only(),
            });
        }
        Ok(out)
    }

    /// The default storage for writes: the first one the device reports.
    pub(crate) fn default_storage(&mut self) -> Result<u32, MtpError> {
        ops::get_storage_ids(&mut self.link)?
            .first()
            .copied()
            .ok_or(MtpError::NotSupported {
                detail: "device reports no storages".into(),
            })
    }

    pub(crate) fn object_summary(&mut self, handle: u32) -> Result<ObjectSummary, MtpError> {
        self.ensure_ready()?;
        let info = ops::get_object_info(&mut self.link, handle)?;
        Ok(self.summary_from_info(handle, info))
    }

    fn summary_from_info(&mut self, handle: u32, info: ObjectInfo) -> ObjectSummary {
        let size = match info.size() {
            Some(size) => Some(size),
            // The 32-bit field overflowed; ask for the 64-bit property
            // unless the policy says the device cannot answer it.
            None if !self.policy.flags.skip_get_object_prop_value => {
                ops::get_object_size(&mut self.link, handle).ok()
            }
            None => None,
        };
        ObjectSummary {
            handle,
            storage_id: info.storage_id,
            parent: (info.parent_handle != 0).then_some(info.parent_handle),
            name: info.filename.clone(),
            size,
            mtime: (!info.modification_date.is_empty()).then(|| info.modification_date.clone()),
            format_code: info.format_code,
            is_folder: info.is_folder(),
            properties: BTreeMap::new(),
        }
    }

    /// Folder listing, through the enumeration ladder: one prop-list
    /// transaction when the device supports it, else a handle walk with
    /// per-handle GetObjectInfo.
    pub(crate) fn list_objects(
        &mut self,
        ctx: &OpContext,
        storage: u32,
        parent: Option<u32>,
    ) -> Result<Vec<ObjectSummary>, MtpError> {
        ctx.check()?;
        self.ensure_ready()?;
        let wire_parent = Self::wire_parent(parent);
        let prop_list_ok = self.policy.flags.supports_get_object_prop_list
            || self.policy.flags.prefers_prop_list_enumeration;

        let outcome = Ladder::<Self, Vec<ObjectSummary>, MtpError>::new("enumerate")
            .rung("prop-list", move |session: &mut Self| {
                if !prop_list_ok {
                    return Err(MtpError::NotSupported {
                        detail: "GetObjectPropList not advertised".into(),
                    });
                }
                let entries = ops::get_object_prop_list_children(&mut session.link, wire_parent)?;
                Ok(summaries_from_prop_list(storage, parent, &entries))
            })
            .rung("per-handle", move |session: &mut Self| {
                let handles =
                    ops::get_object_handles(&mut session.link, storage, None, wire_parent)?;
                let mut out = Vec::with_capacity(handles.len());
                for handle in handles {
                    let info = ops::get_object_info(&mut session.link, handle)?;
                    out.push(session.summary_from_info(handle, info));
                }
                Ok(out)
            })
            .fatal_when(|e: &MtpError| matches!(e, MtpError::Cancelled | MtpError::DeadlineExpired))
            .run(self);

        let attempts: Vec<AttemptView> = outcome.attempts.iter().map(AttemptView::from).collect();
        self.record_ladder("enumerate", &attempts);
        outcome.result.map_err(|e| {
            e.into_inner().unwrap_or(MtpError::NotSupported {
                detail: "no enumeration strategy".into(),
            })
        })
    }

    pub(crate) fn create_folder(
        &mut self,
        parent: Option<u32>,
        name: &str,
        storage: u32,
    ) -> Result<u32, MtpError> {
        self.ensure_ready()?;
        let parent = parent.unwrap_or(0);
        let info = folder_object_info(&self.policy, storage, parent, name);
        let storage_param = self.send_object_info_storage(storage);
        let (_, _, handle) =
            ops::send_object_info(&mut self.link, storage_param, parent, &info)?;
        info!("created folder {name:?} as handle {handle:#x}");
        Ok(handle)
    }

    /// The storage id SendObjectInfo should carry, honouring the wildcard
    /// quirk.
    pub(crate) fn send_object_info_storage(&self, storage: u32) -> u32 {
        if self.policy.flags.force_wildcard_storage_in_send_object_info {
            ptp_wire::STORAGE_ALL
        } else {
            storage
        }
    }

    pub(crate) fn delete_object(
        &mut self,
        ctx: &OpContext,
        handle: u32,
        recursive: bool,
    ) -> Result<(), MtpError> {
        ctx.check()?;
        self.ensure_ready()?;
        let info = ops::get_object_info(&mut self.link, handle)?;
        if info.is_folder() {
            let children =
                ops::get_object_handles(&mut self.link, info.storage_id, None, handle)?;
            if !children.is_empty() {
                if !recursive {
                    return Err(MtpError::PreconditionFailed {
                        reason: "folder is not empty".into(),
                    });
                }
                for child in children {
                    self.delete_object(ctx, child, true)?;
                }
            }
        }
        ops::delete_object(&mut self.link, handle)?;
        Ok(())
    }

    pub(crate) fn move_object(
        &mut self,
        handle: u32,
        new_parent: Option<u32>,
    ) -> Result<(), MtpError> {
        self.ensure_ready()?;
        let info = ops::get_object_info(&mut self.link, handle)?;
        ops::move_object(
            &mut self.link,
            handle,
            info.storage_id,
            new_parent.unwrap_or(0),
        )?;
        Ok(())
    }

    pub(crate) fn diagnostics(&mut self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            device_id: self.device_id.to_string(),
            model: self.device_info.model.clone(),
            policy: self.policy.clone(),
            selection: self.selection.clone(),
            transactions: self.link.transactions().cloned().collect(),
            ladders: self.ladder_log.clone(),
        }
    }

    /// End-of-life: close the session politely and feed the learned
    /// profile store.
    pub(crate) fn shutdown(&mut self) {
        self.link.close_session();
        if let Some(profiles) = &self.profiles {
            let sample = self.stats.to_sample(self.policy.max_chunk_bytes);
            if !sample.is_empty() {
                match profiles.record(&self.fingerprint.hash(), &sample) {
                    Ok(profile) => debug!(
                        "learned profile updated ({} samples)",
                        profile.sample_count
                    ),
                    Err(e) => warn!("learned profile update failed: {e}"),
                }
            }
        }
    }
}

fn summaries_from_prop_list(
    storage: u32,
    parent: Option<u32>,
    entries: &[PropListEntry],
) -> Vec<ObjectSummary> {
    let mut by_handle: BTreeMap<u32, ObjectSummary> = BTreeMap::new();
    for entry in entries {
        let summary = by_handle.entry(entry.handle).or_insert_with(|| ObjectSummary {
            handle: entry.handle,
            storage_id: storage,
            parent,
            name: String::new(),
            size: None,
            mtime: None,
            format_code: fmt::UNDEFINED,
            is_folder: false,
            properties: BTreeMap::new(),
        });
        match entry.prop_code {
            prop::OBJECT_FILE_NAME => {
                if let Some(name) = entry.value.as_str() {
                    summary.name = name.to_string();
                }
            }
            prop::OBJECT_SIZE => summary.size = entry.value.as_u64(),
            prop::OBJECT_FORMAT => {
                if let Some(format) = entry.value.as_u64() {
                    summary.format_code = format as u16;
                    summary.is_folder = format as u16 == fmt::ASSOCIATION;
                }
            }
            prop::PARENT_OBJECT => {
                if let Some(p) = entry.value.as_u64() {
                    summary.parent = (p != 0).then_some(p as u32);
                }
            }
            prop::DATE_MODIFIED => {
                if let Some(date) = entry.value.as_str() {
                    summary.mtime = Some(date.to_string());
                }
            }
            other => {
                let rendered = match &entry.value {
                    ptp_wire::PropValue::Str(s) => s.clone(),
                    v => v.as_u64().map(|n| n.to_string()).unwrap_or_default(),
                };
                summary.properties.insert(other, rendered);
            }
        }
    }
    by_handle.into_values().collect()
}

/// Builds the ObjectInfo dataset for a new folder.
fn folder_object_info(
    policy: &EffectivePolicy,
    storage: u32,
    parent: u32,
    name: &str,
) -> ObjectInfo {
    ObjectInfo {
        storage_id: storage,
        format_code: fmt::ASSOCIATION,
        association_type: fmt::ASSOC_TYPE_GENERIC_FOLDER,
        parent_handle: parent,
        filename: name.to_string(),
        capture_date: dataset_date(policy),
        modification_date: dataset_date(policy),
        ..Default::default()
    }
}

/// The date string SendObjectInfo datasets carry; empty when the quirk
/// says the device chokes on them.
pub(crate) fn dataset_date(policy: &EffectivePolicy) -> String {
    if policy.flags.empty_dates_in_send_object_info {
        String::new()
    } else {
        chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string()
    }
}

fn handshake_blocked(e: &LinkError) -> bool {
    matches!(
        e,
        LinkError::Transport(
            TransportError::Timeout(_) | TransportError::HandshakeBlocked | TransportError::Io { .. }
        )
    )
}

/// Session id used for every OpenSession this runtime issues.
const SESSION_ID: u32 = 1;

/// Connects to a device: resolve policy, claim, open the session (with the
/// one-shot reset ladder for handshake-blocked devices), probe
/// capabilities, finalize the policy, and spawn the actor.
pub fn connect<C: Connector>(
    mut connector: C,
    deps: GatewayDeps,
) -> Result<MtpDeviceHandle, MtpError> {
    let started = Instant::now();
    let device_id = connector.device_id();
    let fingerprint = connector.fingerprint()?;
    let learned = deps
        .profiles
        .as_ref()
        .and_then(|p| p.get(&fingerprint.hash()));

    // Claim-time policy: everything except the capability probe.
    let pre_policy = resolve(
        &fingerprint,
        None,
        learned.as_ref(),
        &deps.quirks,
        deps.overrides.as_ref(),
    );
    let (pipes, mut selection) = connector.claim(&pre_policy)?;
    let mut link = Link::new(pipes, pre_policy.clone());

    // Most devices answer GetDeviceInfo outside a session; the ones that
    // do not carry `requires_session_before_device_info`.
    let mut device_info = None;
    if !pre_policy.flags.requires_session_before_device_info {
        device_info = Some(ops::get_device_info(&mut link)?);
    }

    let opened = link.open_session(SESSION_ID);
    match opened {
        Ok(()) => {}
        Err(e)
            if handshake_blocked(&e)
                && pre_policy.flags.reset_reopen_on_open_session_io_error =>
        {
            warn!("OpenSession blocked ({e}); running the reset ladder once");
            // Release the claim before taking it again.
            drop(link);
            let (pipes, reselection) = connector.reset_and_reclaim(&pre_policy)?;
            if reselection.is_some() {
                selection = reselection;
            }
            link = Link::new(pipes, pre_policy.clone());
            link.open_session(SESSION_ID)?;
        }
        Err(e) => return Err(e.into()),
    }

    let device_info = match device_info {
        Some(info) => info,
        None => ops::get_device_info(&mut link)?,
    };

    // Final session policy, now that the probe has spoken. Immutable from
    // here on.
    let probe = ProbedCapabilities::from_device_info(&device_info);
    let policy = resolve(
        &fingerprint,
        Some(&probe),
        learned.as_ref(),
        &deps.quirks,
        deps.overrides.as_ref(),
    );
    link.set_policy(policy.clone());

    if let Some(identities) = &deps.identities {
        if let Err(e) = identities.update_mtp_serial(device_id, &device_info.serial_number) {
            warn!("could not record MTP serial: {e}");
        }
    }
    if let Err(e) = deps.journal.clear_stale_temps() {
        warn!("stale temp cleanup failed: {e}");
    }

    let pump_pair = if policy.flags.disable_event_pump {
        None
    } else {
        connector
            .interrupt_source()
            .map(|source| EventPump::start(source, policy.event_poll()))
    };
    let (pump, events) = match pump_pair {
        Some((pump, events)) => (Some(pump), Some(events)),
        None => (None, None),
    };

    let handshake_ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(
        "connected to {} ({}) in {handshake_ms:.0} ms",
        device_info.model, device_id
    );

    let session = DeviceSession {
        device_id,
        device_key: device_id.simple().to_string(),
        link,
        policy,
        device_info: device_info.clone(),
        fingerprint,
        selection,
        journal: deps.journal,
        profiles: deps.profiles,
        stats: SessionStats {
            handshake_ms: Some(handshake_ms),
            ..Default::default()
        },
        connector: Box::new(connector),
        needs_resync: false,
        session_id: SESSION_ID,
        ladder_log: Vec::new(),
    };
    let (gateway, worker) = actor::spawn(session);

    Ok(MtpDeviceHandle {
        gateway,
        worker: Mutex::new(worker),
        device_id,
        device_info,
        pump: Mutex::new(pump),
        events: Mutex::new(events),
    })
}

/// The connected device: the facade over the actor.
pub struct MtpDeviceHandle {
    gateway: Gateway,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    device_id: Uuid,
    device_info: DeviceInfo,
    pump: Mutex<Option<EventPump>>,
    events: Mutex<Option<Events>>,
}

impl std::fmt::Debug for MtpDeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtpDeviceHandle")
            .field("device_id", &self.device_id)
            .field("device_info", &self.device_info)
            .finish_non_exhaustive()
    }
}

impl MtpDeviceHandle {
    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    /// Direct access to the actor, for callers that need explicit
    /// priorities, deadlines, or cancellation handles.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }
}

impl Drop for MtpDeviceHandle {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(pump) = pump.take() {
                pump.stop();
            }
        }
        // Close the session politely before the handle disappears.
        self.gateway.request_shutdown();
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                let _ = worker.join();
            }
        }
    }
}

impl MtpDevice for MtpDeviceHandle {
    fn info(&self) -> Result<DeviceInfo, MtpError> {
        // DeviceInfo is immutable for the life of the session.
        Ok(self.device_info.clone())
    }

    fn storages(&self) -> Result<Vec<StorageSummary>, MtpError> {
        self.gateway
            .submit(Priority::Medium, None, |session, _ctx| session.storages())
            .wait()
    }

    fn list(&self, storage: u32, parent: Option<u32>) -> Result<Vec<ObjectSummary>, MtpError> {
        self.gateway
            .submit(Priority::Medium, None, move |session, ctx| {
                session.list_objects(ctx, storage, parent)
            })
            .wait()
    }

    fn get_info(&self, handle: u32) -> Result<ObjectSummary, MtpError> {
        self.gateway
            .submit(Priority::Medium, None, move |session, _ctx| {
                session.object_summary(handle)
            })
            .wait()
    }

    fn read(
        &self,
        handle: u32,
        range: Option<Range<u64>>,
        destination: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<TransferOutcome, MtpError> {
        let destination = destination.to_path_buf();
        self.gateway
            .submit(Priority::Low, None, move |session, ctx| {
                transfers::read_object(session, ctx, handle, range, &destination, progress)
            })
            .wait()
    }

    fn write(
        &self,
        parent: Option<u32>,
        name: &str,
        size: u64,
        source: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<TransferOutcome, MtpError> {
        let name = name.to_string();
        let source = source.to_path_buf();
        self.gateway
            .submit(Priority::Low, None, move |session, ctx| {
                transfers::write_object(session, ctx, parent, &name, size, &source, progress)
            })
            .wait()
    }

    fn create_folder(
        &self,
        parent: Option<u32>,
        name: &str,
        storage: u32,
    ) -> Result<u32, MtpError> {
        let name = name.to_string();
        self.gateway
            .submit(Priority::Medium, None, move |session, _ctx| {
                session.create_folder(parent, &name, storage)
            })
            .wait()
    }

    fn delete(&self, handle: u32, recursive: bool) -> Result<(), MtpError> {
        self.gateway
            .submit(Priority::Medium, None, move |session, ctx| {
                session.delete_object(ctx, handle, recursive)
            })
            .wait()
    }

    fn r#move(&self, handle: u32, new_parent: Option<u32>) -> Result<(), MtpError> {
        self.gateway
            .submit(Priority::Medium, None, move |session, _ctx| {
                session.move_object(handle, new_parent)
            })
            .wait()
    }

    fn ensure_session(&self) -> Result<(), MtpError> {
        self.gateway
            .submit(Priority::Critical, None, |session, _ctx| {
                session.ensure_ready()
            })
            .wait()
    }

    fn events(&self) -> Option<Events> {
        self.events
            .lock()
            .ok()
            .and_then(|mut events| events.take())
    }

    fn diagnostics(&self) -> Result<DiagnosticsSnapshot, MtpError> {
        self.gateway
            .submit(Priority::High, None, |session, _ctx| {
                Ok(session.diagnostics())
            })
            .wait()
    }
}
