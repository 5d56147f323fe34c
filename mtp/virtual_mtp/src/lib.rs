//! An in-memory MTP responder driven by a scripted byte stream.
//!
//! [`VirtualDevice`] implements [`ptp_link::Pipes`] and answers like a real
//! device: it parses the containers the host writes, walks its own object
//! tree, and queues response packets with faithful max-packet segmentation
//! (including trailing ZLPs, or deliberately without them). A [`Script`]
//! injects the misbehaviors the runtime must survive: OpenSession
//! timeouts, SessionAlreadyOpen, missing partial-transfer support,
//! InvalidParameter on root writes, DeviceBusy bursts, and out-of-order
//! transaction ids.
//!
//! Every handled operation is appended to an operation log so tests can
//! assert exactly what reached the wire.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::trace;
use ptp_link::Pipes;
use ptp_wire::{
    evt, fmt, ops, prop, rc, Container, ContainerHeader, ContainerKind, DeviceInfo, ObjectInfo,
    PropListEntry, PropValue, StorageInfo, Writer, CONTAINER_HEADER_LEN,
};
use usb_transport::TransportError;

/// The default storage id the virtual device exposes.
pub const STORAGE_ID: u32 = 0x0001_0001;

/// "Root" parent handle accepted on the wire (alongside 0).
pub const PARENT_ROOT: u32 = 0xFFFF_FFFF;

/// Behaviors injected into the responder.
#[derive(Clone, Debug)]
pub struct Script {
    /// Swallow this many OpenSession commands entirely (the host sees a
    /// bulk timeout). A device reset clears the remaining count.
    pub swallow_open_session: u32,
    /// Answer this many OpenSession commands with SessionAlreadyOpen.
    pub session_already_open: u32,
    pub support_partial_read_64: bool,
    pub support_partial_read_32: bool,
    pub support_partial_write: bool,
    pub support_prop_list: bool,
    /// Answer SendObjectInfo targeting the storage root with
    /// InvalidParameter (0x201D).
    pub invalid_param_on_root_write: bool,
    /// Answer this many GetStorageIDs with DeviceBusy (0x2019).
    pub busy_on_storage_ids: u32,
    /// Before each correct response, emit this many responses carrying a
    /// wrong transaction id.
    pub out_of_order_responses: u32,
    /// Never emit trailing ZLPs after packet-aligned data phases.
    pub drop_zlp: bool,
    /// Reject the 0xFFFFFFFF storage wildcard in SendObjectInfo.
    pub reject_wildcard_storage: bool,
    /// After serving this many partial reads, swallow further ones (the
    /// host sees bulk timeouts mid-transfer).
    pub swallow_partial_after: Option<u32>,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            swallow_open_session: 0,
            session_already_open: 0,
            support_partial_read_64: true,
            support_partial_read_32: true,
            support_partial_write: true,
            support_prop_list: true,
            invalid_param_on_root_write: false,
            busy_on_storage_ids: 0,
            out_of_order_responses: 0,
            drop_zlp: false,
            reject_wildcard_storage: false,
            swallow_partial_after: None,
        }
    }
}

#[derive(Clone, Debug)]
struct VObject {
    storage: u32,
    parent: u32,
    info: ObjectInfo,
    data: Vec<u8>,
}

/// The in-memory device.
pub struct VirtualDevice {
    max_packet: usize,
    script: Script,
    session: Option<u32>,
    /// Device-to-host bulk packets, each at most `max_packet` bytes; an
    /// empty vec is a ZLP.
    outbound: std::collections::VecDeque<Vec<u8>>,
    /// Host-to-device byte stream being reassembled into containers.
    inbound: Vec<u8>,
    /// A command waiting for its OUT data phase.
    pending_command: Option<Container>,
    /// The handle reserved by the last SendObjectInfo, awaiting SendObject.
    pending_send_target: Option<u32>,
    /// Pending interrupt (event) containers.
    events: std::collections::VecDeque<Vec<u8>>,
    objects: BTreeMap<u32, VObject>,
    next_handle: u32,
    partial_reads_served: u32,
    free_space: u64,
    /// Every operation handled: (opcode, command params).
    op_log: Vec<(u16, Vec<u32>)>,
}

impl VirtualDevice {
    pub fn new() -> Self {
        Self::with_script(Script::default())
    }

    pub fn with_script(script: Script) -> Self {
        VirtualDevice {
            max_packet: 512,
            script,
            session: None,
            outbound: Default::default(),
            inbound: Vec::new(),
            pending_command: None,
            pending_send_target: None,
            events: Default::default(),
            objects: BTreeMap::new(),
            next_handle: 1,
            partial_reads_served: 0,
            free_space: 10 << 30,
            op_log: Vec::new(),
        }
    }

    /// What the device advertises in GetDeviceInfo, derived from the
    /// script's support switches.
    pub fn device_info(&self) -> DeviceInfo {
        let mut operations = vec![
            ops::GET_DEVICE_INFO,
            ops::OPEN_SESSION,
            ops::CLOSE_SESSION,
            ops::GET_STORAGE_IDS,
            ops::GET_STORAGE_INFO,
            ops::GET_OBJECT_HANDLES,
            ops::GET_OBJECT_INFO,
            ops::GET_OBJECT,
            ops::DELETE_OBJECT,
            ops::SEND_OBJECT_INFO,
            ops::SEND_OBJECT,
            ops::MOVE_OBJECT,
            ops::GET_OBJECT_PROP_VALUE,
            ops::GET_DEVICE_PROP_VALUE,
        ];
        if self.script.support_partial_read_32 {
            operations.push(ops::GET_PARTIAL_OBJECT);
        }
        if self.script.support_partial_read_64 {
            operations.push(ops::GET_PARTIAL_OBJECT_64);
        }
        if self.script.support_partial_write {
            operations.push(ops::SEND_PARTIAL_OBJECT);
            operations.push(ops::TRUNCATE_OBJECT);
            operations.push(ops::BEGIN_EDIT_OBJECT);
            operations.push(ops::END_EDIT_OBJECT);
        }
        if self.script.support_prop_list {
            operations.push(ops::GET_OBJECT_PROP_LIST);
        }
        DeviceInfo {
            standard_version: 100,
            vendor_extension_id: 6,
            vendor_extension_version: 100,
            vendor_extension_desc: "microsoft.com: 1.0; android.com: 1.0;".into(),
            functional_mode: 0,
            operations_supported: operations,
            events_supported: vec![
                evt::OBJECT_ADDED,
                evt::OBJECT_REMOVED,
                evt::STORAGE_INFO_CHANGED,
            ],
            device_properties_supported: vec![prop::DEVICE_FRIENDLY_NAME],
            capture_formats: vec![],
            playback_formats: vec![fmt::EXIF_JPEG, fmt::MP3, fmt::MP4],
            manufacturer: "Virtual".into(),
            model: "Responder".into(),
            device_version: "1.0".into(),
            serial_number: "VIRT0001".into(),
        }
    }

    /// Adds a file under `parent` (0 or [`PARENT_ROOT`] for the root).
    pub fn add_object(&mut self, parent: u32, name: &str, data: Vec<u8>) -> u32 {
        let handle = self.alloc_handle();
        let info = ObjectInfo {
            storage_id: STORAGE_ID,
            format_code: fmt::UNDEFINED,
            compressed_size: data.len().try_into().unwrap_or(u32::MAX),
            parent_handle: normalize_parent(parent),
            filename: name.to_string(),
            modification_date: "20260101T120000".into(),
            ..Default::default()
        };
        self.objects.insert(
            handle,
            VObject {
                storage: STORAGE_ID,
                parent: normalize_parent(parent),
                info,
                data,
            },
        );
        handle
    }

    /// Adds a folder under `parent`.
    pub fn add_folder(&mut self, parent: u32, name: &str) -> u32 {
        let handle = self.alloc_handle();
        let info = ObjectInfo {
            storage_id: STORAGE_ID,
            format_code: fmt::ASSOCIATION,
            association_type: fmt::ASSOC_TYPE_GENERIC_FOLDER,
            parent_handle: normalize_parent(parent),
            filename: name.to_string(),
            ..Default::default()
        };
        self.objects.insert(
            handle,
            VObject {
                storage: STORAGE_ID,
                parent: normalize_parent(parent),
                info,
                data: Vec::new(),
            },
        );
        handle
    }

    pub fn object_data(&self, handle: u32) -> Option<&[u8]> {
        self.objects.get(&handle).map(|o| o.data.as_slice())
    }

    pub fn object_name(&self, handle: u32) -> Option<&str> {
        self.objects.get(&handle).map(|o| o.info.filename.as_str())
    }

    pub fn find_by_name(&self, name: &str) -> Option<u32> {
        self.objects
            .iter()
            .find(|(_, o)| o.info.filename == name)
            .map(|(h, _)| *h)
    }

    pub fn parent_of(&self, handle: u32) -> Option<u32> {
        self.objects.get(&handle).map(|o| o.parent)
    }

    /// Rewrites an object's modification date, emulating a device-side
    /// edit that must invalidate host-side resume preconditions.
    pub fn touch_object(&mut self, handle: u32, mtime: &str) {
        if let Some(object) = self.objects.get_mut(&handle) {
            object.info.modification_date = mtime.to_string();
        }
    }

    /// Mutable access to the script, for staging misbehavior mid-test.
    pub fn script_mut(&mut self) -> &mut Script {
        &mut self.script
    }

    /// Every operation handled so far, in arrival order.
    pub fn operations(&self) -> &[(u16, Vec<u32>)] {
        &self.op_log
    }

    /// The operations matching `opcode`, with their parameters.
    pub fn operations_of(&self, opcode: u16) -> Vec<Vec<u32>> {
        self.op_log
            .iter()
            .filter(|(op, _)| *op == opcode)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn session_open(&self) -> bool {
        self.session.is_some()
    }

    /// Queues a device event for the interrupt pipe.
    pub fn push_event(&mut self, code: u16, params: &[u32]) {
        self.events
            .push_back(Container::event(code, 0, params).encode());
    }

    /// Event containers queued but not yet polled off the interrupt pipe.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Emulates a USB device reset: wipes the wire state and the
    /// misbehavior counters a reset is documented to clear.
    pub fn usb_reset(&mut self) {
        self.session = None;
        self.outbound.clear();
        self.inbound.clear();
        self.pending_command = None;
        self.pending_send_target = None;
        self.script.swallow_open_session = 0;
    }

    fn alloc_handle(&mut self) -> u32 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    // ---- outbound framing -------------------------------------------------

    /// Queues a container as max-packet-sized bulk packets, with the
    /// trailing ZLP a packet-aligned stream requires (unless scripted away).
    fn queue_container(&mut self, bytes: Vec<u8>) {
        let mp = self.max_packet;
        for chunk in bytes.chunks(mp) {
            self.outbound.push_back(chunk.to_vec());
        }
        if bytes.len() % mp == 0 && !self.script.drop_zlp {
            self.outbound.push_back(Vec::new());
        }
    }

    fn queue_response(&mut self, code: u16, txid: u32, params: &[u32]) {
        let mut remaining = std::mem::take(&mut self.script.out_of_order_responses);
        while remaining > 0 {
            remaining -= 1;
            self.queue_container(
                Container::response(code, txid.wrapping_add(100 + remaining), params).encode(),
            );
        }
        self.queue_container(Container::response(code, txid, params).encode());
    }

    fn queue_data(&mut self, code: u16, txid: u32, payload: Vec<u8>) {
        self.queue_container(Container::data(code, txid, payload).encode());
    }

    // ---- inbound handling -------------------------------------------------

    fn pump_inbound(&mut self) {
        while self.inbound.len() >= CONTAINER_HEADER_LEN {
            let header = match ContainerHeader::decode(&self.inbound[..CONTAINER_HEADER_LEN]) {
                Ok(h) => h,
                Err(_) => {
                    self.inbound.clear();
                    return;
                }
            };
            let total = header.length as usize;
            if self.inbound.len() < total {
                return;
            }
            let frame: Vec<u8> = self.inbound.drain(..total).collect();
            match Container::decode(&frame) {
                Ok(container) => self.handle_container(container),
                Err(_) => self.inbound.clear(),
            }
        }
    }

    fn handle_container(&mut self, container: Container) {
        match container.kind {
            ContainerKind::Command => {
                let params = container.params();
                self.op_log.push((container.code, params.clone()));
                if expects_data_phase(container.code) {
                    self.pending_command = Some(container);
                } else {
                    self.handle_command(container.code, container.transaction_id, &params, None);
                }
            }
            ContainerKind::Data => {
                let Some(cmd) = self.pending_command.take() else {
                    trace!("unexpected data container, dropping");
                    return;
                };
                let params = cmd.params();
                self.handle_command(
                    cmd.code,
                    cmd.transaction_id,
                    &params,
                    Some(container.payload),
                );
            }
            _ => trace!("host sent container kind {:?}, dropping", container.kind),
        }
    }

    fn handle_command(&mut self, code: u16, txid: u32, params: &[u32], data: Option<Vec<u8>>) {
        match code {
            ops::GET_DEVICE_INFO => {
                let payload = self.device_info().encode();
                self.queue_data(code, txid, payload);
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::OPEN_SESSION => {
                if self.script.swallow_open_session > 0 {
                    self.script.swallow_open_session -= 1;
                    trace!("swallowing OpenSession (host will time out)");
                    return;
                }
                if self.script.session_already_open > 0 {
                    self.script.session_already_open -= 1;
                    self.queue_response(rc::SESSION_ALREADY_OPEN, txid, &[]);
                    return;
                }
                if self.session.is_some() {
                    self.queue_response(rc::SESSION_ALREADY_OPEN, txid, &[]);
                } else {
                    self.session = params.first().copied();
                    self.queue_response(rc::OK, txid, &[]);
                }
            }
            ops::CLOSE_SESSION => {
                self.session = None;
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::GET_STORAGE_IDS => {
                if self.script.busy_on_storage_ids > 0 {
                    self.script.busy_on_storage_ids -= 1;
                    self.queue_response(rc::DEVICE_BUSY, txid, &[]);
                    return;
                }
                let mut w = Writer::new();
                w.put_array_u32(&[STORAGE_ID]);
                self.queue_data(code, txid, w.into_vec());
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::GET_STORAGE_INFO => {
                if params.first() != Some(&STORAGE_ID) {
                    self.queue_response(rc::INVALID_STORAGE_ID, txid, &[]);
                    return;
                }
                let info = StorageInfo {
                    storage_type: 0x0003,
                    filesystem_type: 0x0002,
                    access_capability: 0x0000,
                    max_capacity: 32 << 30,
                    free_space_bytes: self.free_space,
                    free_space_objects: 0xFFFF_FFFF,
                    description: "Internal shared storage".into(),
                    volume_label: String::new(),
                };
                self.queue_data(code, txid, info.encode());
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::GET_OBJECT_HANDLES => {
                let parent = params.get(2).copied().unwrap_or(PARENT_ROOT);
                let parent = normalize_parent(parent);
                let handles: Vec<u32> = self
                    .objects
                    .iter()
                    .filter(|(_, o)| o.parent == parent)
                    .map(|(h, _)| *h)
                    .collect();
                let mut w = Writer::new();
                w.put_array_u32(&handles);
                self.queue_data(code, txid, w.into_vec());
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::GET_OBJECT_INFO => {
                let Some(object) = params.first().and_then(|h| self.objects.get(h)) else {
                    self.queue_response(rc::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                };
                let payload = object.info.encode();
                self.queue_data(code, txid, payload);
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::GET_OBJECT => {
                let Some(object) = params.first().and_then(|h| self.objects.get(h)) else {
                    self.queue_response(rc::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                };
                let payload = object.data.clone();
                self.queue_data(code, txid, payload);
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::GET_PARTIAL_OBJECT => {
                if !self.script.support_partial_read_32 {
                    self.queue_response(rc::OPERATION_NOT_SUPPORTED, txid, &[]);
                    return;
                }
                let (handle, offset, len) = (
                    params.first().copied().unwrap_or(0),
                    params.get(1).copied().unwrap_or(0) as usize,
                    params.get(2).copied().unwrap_or(0) as usize,
                );
                self.partial_read(code, txid, handle, offset as u64, len);
            }
            ops::GET_PARTIAL_OBJECT_64 => {
                if !self.script.support_partial_read_64 {
                    self.queue_response(rc::OPERATION_NOT_SUPPORTED, txid, &[]);
                    return;
                }
                let handle = params.first().copied().unwrap_or(0);
                let offset = (params.get(1).copied().unwrap_or(0) as u64)
                    | ((params.get(2).copied().unwrap_or(0) as u64) << 32);
                let len = params.get(3).copied().unwrap_or(0) as usize;
                self.partial_read(code, txid, handle, offset, len);
            }
            ops::SEND_OBJECT_INFO => {
                let storage = params.first().copied().unwrap_or(0);
                let parent = normalize_parent(params.get(1).copied().unwrap_or(0));
                if self.script.reject_wildcard_storage && storage == 0xFFFF_FFFF {
                    self.queue_response(rc::INVALID_PARAMETER, txid, &[]);
                    return;
                }
                if self.script.invalid_param_on_root_write && parent == 0 {
                    self.queue_response(rc::INVALID_PARAMETER, txid, &[]);
                    return;
                }
                let Some(info) = data.as_deref().and_then(|d| ObjectInfo::decode(d).ok()) else {
                    self.queue_response(rc::NO_VALID_OBJECT_INFO, txid, &[]);
                    return;
                };
                if !parent_exists(&self.objects, parent) {
                    self.queue_response(rc::INVALID_PARENT_OBJECT, txid, &[]);
                    return;
                }
                let handle = self.alloc_handle();
                let is_folder = info.is_folder();
                self.objects.insert(
                    handle,
                    VObject {
                        storage: STORAGE_ID,
                        parent,
                        info,
                        data: Vec::new(),
                    },
                );
                if !is_folder {
                    // The next SendObject targets this handle.
                    self.pending_send_target = Some(handle);
                }
                self.queue_response(rc::OK, txid, &[STORAGE_ID, parent, handle]);
            }
            ops::SEND_OBJECT => {
                let Some(handle) = self.pending_send_target.take() else {
                    self.queue_response(rc::NO_VALID_OBJECT_INFO, txid, &[]);
                    return;
                };
                let payload = data.unwrap_or_default();
                if let Some(object) = self.objects.get_mut(&handle) {
                    object.info.compressed_size =
                        payload.len().try_into().unwrap_or(u32::MAX);
                    object.data = payload;
                }
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::SEND_PARTIAL_OBJECT => {
                if !self.script.support_partial_write {
                    self.queue_response(rc::OPERATION_NOT_SUPPORTED, txid, &[]);
                    return;
                }
                let handle = params.first().copied().unwrap_or(0);
                let offset = (params.get(1).copied().unwrap_or(0) as u64)
                    | ((params.get(2).copied().unwrap_or(0) as u64) << 32);
                let payload = data.unwrap_or_default();
                let Some(object) = self.objects.get_mut(&handle) else {
                    self.queue_response(rc::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                };
                let end = offset as usize + payload.len();
                if object.data.len() < end {
                    object.data.resize(end, 0);
                }
                object.data[offset as usize..end].copy_from_slice(&payload);
                object.info.compressed_size = object.data.len().try_into().unwrap_or(u32::MAX);
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::TRUNCATE_OBJECT => {
                let handle = params.first().copied().unwrap_or(0);
                let size = (params.get(1).copied().unwrap_or(0) as u64)
                    | ((params.get(2).copied().unwrap_or(0) as u64) << 32);
                match self.objects.get_mut(&handle) {
                    Some(object) => {
                        object.data.resize(size as usize, 0);
                        object.info.compressed_size = size.try_into().unwrap_or(u32::MAX);
                        self.queue_response(rc::OK, txid, &[]);
                    }
                    None => self.queue_response(rc::INVALID_OBJECT_HANDLE, txid, &[]),
                }
            }
            ops::BEGIN_EDIT_OBJECT | ops::END_EDIT_OBJECT => {
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::DELETE_OBJECT => {
                let Some(&handle) = params.first().and_then(|h| {
                    self.objects.contains_key(h).then_some(h)
                }) else {
                    self.queue_response(rc::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                };
                self.delete_subtree(handle);
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::MOVE_OBJECT => {
                let handle = params.first().copied().unwrap_or(0);
                let new_parent = normalize_parent(params.get(2).copied().unwrap_or(0));
                if !self.objects.contains_key(&handle) {
                    self.queue_response(rc::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                }
                if !parent_exists(&self.objects, new_parent) {
                    self.queue_response(rc::INVALID_PARENT_OBJECT, txid, &[]);
                    return;
                }
                if let Some(object) = self.objects.get_mut(&handle) {
                    object.parent = new_parent;
                    object.info.parent_handle = new_parent;
                }
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::GET_OBJECT_PROP_LIST => {
                if !self.script.support_prop_list {
                    self.queue_response(rc::OPERATION_NOT_SUPPORTED, txid, &[]);
                    return;
                }
                let target = params.first().copied().unwrap_or(0);
                let depth = params.get(4).copied().unwrap_or(0);
                let entries = self.prop_list(target, depth);
                self.queue_data(code, txid, PropListEntry::encode_list(&entries));
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::GET_OBJECT_PROP_VALUE => {
                let handle = params.first().copied().unwrap_or(0);
                let code_param = params.get(1).copied().unwrap_or(0) as u16;
                let Some(object) = self.objects.get(&handle) else {
                    self.queue_response(rc::INVALID_OBJECT_HANDLE, txid, &[]);
                    return;
                };
                let mut w = Writer::new();
                match code_param {
                    prop::OBJECT_SIZE => w.put_u64(object.data.len() as u64),
                    prop::OBJECT_FILE_NAME => w.put_string(&object.info.filename),
                    _ => {
                        self.queue_response(rc::INVALID_OBJECT_PROP_CODE, txid, &[]);
                        return;
                    }
                }
                self.queue_data(code, txid, w.into_vec());
                self.queue_response(rc::OK, txid, &[]);
            }
            ops::GET_DEVICE_PROP_VALUE => {
                if params.first().copied() == Some(prop::DEVICE_FRIENDLY_NAME as u32) {
                    let mut w = Writer::new();
                    w.put_string("Virtual Responder");
                    self.queue_data(code, txid, w.into_vec());
                    self.queue_response(rc::OK, txid, &[]);
                } else {
                    self.queue_response(rc::DEVICE_PROP_NOT_SUPPORTED, txid, &[]);
                }
            }
            _ => {
                self.queue_response(rc::OPERATION_NOT_SUPPORTED, txid, &[]);
            }
        }
    }

    fn partial_read(&mut self, code: u16, txid: u32, handle: u32, offset: u64, len: usize) {
        if let Some(limit) = self.script.swallow_partial_after {
            if self.partial_reads_served >= limit {
                trace!("swallowing partial read (host will time out)");
                return;
            }
        }
        self.partial_reads_served += 1;
        let Some(object) = self.objects.get(&handle) else {
            self.queue_response(rc::INVALID_OBJECT_HANDLE, txid, &[]);
            return;
        };
        let start = (offset as usize).min(object.data.len());
        let end = (start + len).min(object.data.len());
        let payload = object.data[start..end].to_vec();
        let actual = payload.len() as u32;
        self.queue_data(code, txid, payload);
        self.queue_response(rc::OK, txid, &[actual]);
    }

    fn prop_list(&self, target: u32, depth: u32) -> Vec<PropListEntry> {
        let mut entries = Vec::new();
        let mut emit = |handle: u32, object: &VObject| {
            entries.push(PropListEntry {
                handle,
                prop_code: prop::OBJECT_FILE_NAME,
                datatype: prop::datatype::STRING,
                value: PropValue::Str(object.info.filename.clone()),
            });
            entries.push(PropListEntry {
                handle,
                prop_code: prop::OBJECT_SIZE,
                datatype: prop::datatype::U64,
                value: PropValue::U64(object.data.len() as u64),
            });
            entries.push(PropListEntry {
                handle,
                prop_code: prop::OBJECT_FORMAT,
                datatype: prop::datatype::U16,
                value: PropValue::U16(object.info.format_code),
            });
            entries.push(PropListEntry {
                handle,
                prop_code: prop::PARENT_OBJECT,
                datatype: prop::datatype::U32,
                value: PropValue::U32(object.parent),
            });
            entries.push(PropListEntry {
                handle,
                prop_code: prop::DATE_MODIFIED,
                datatype: prop::datatype::STRING,
                value: PropValue::Str(object.info.modification_date.clone()),
            });
        };
        if depth == 0 {
            if let Some(object) = self.objects.get(&target) {
                emit(target, object);
            }
        } else {
            let parent = normalize_parent(target);
            for (&handle, object) in &self.objects {
                if object.parent == parent {
                    emit(handle, object);
                }
            }
        }
        entries
    }

    fn delete_subtree(&mut self, root: u32) {
        let mut doomed = vec![root];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i];
            i += 1;
            doomed.extend(
                self.objects
                    .iter()
                    .filter(|(_, o)| o.parent == parent)
                    .map(|(h, _)| *h),
            );
        }
        for handle in doomed {
            self.objects.remove(&handle);
        }
    }
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_parent(parent: u32) -> u32 {
    if parent == PARENT_ROOT {
        0
    } else {
        parent
    }
}

fn parent_exists(objects: &BTreeMap<u32, VObject>, parent: u32) -> bool {
    parent == 0 || objects.get(&parent).is_some_and(|o| o.info.is_folder())
}

/// Operations whose host-to-device data phase must arrive before the
/// device can act.
fn expects_data_phase(code: u16) -> bool {
    matches!(
        code,
        ops::SEND_OBJECT_INFO | ops::SEND_OBJECT | ops::SEND_PARTIAL_OBJECT
    )
}

impl Pipes for VirtualDevice {
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut filled = 0;
        loop {
            let Some(packet) = self.outbound.pop_front() else {
                if filled > 0 {
                    return Ok(filled);
                }
                // Nothing to say: the host sees a bulk timeout.
                return Err(TransportError::Timeout(timeout));
            };
            let space = buf.len() - filled;
            if packet.len() > space {
                // The host's buffer ends mid-packet; hand back the rest.
                buf[filled..].copy_from_slice(&packet[..space]);
                self.outbound.push_front(packet[space..].to_vec());
                return Ok(buf.len());
            }
            let n = packet.len();
            buf[filled..filled + n].copy_from_slice(&packet);
            filled += n;
            // A short (or zero-length) packet terminates the transfer, as
            // does an exactly full buffer.
            if n < self.max_packet || filled == buf.len() {
                return Ok(filled);
            }
        }
    }

    fn write_bulk(&mut self, buf: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if !buf.is_empty() {
            self.inbound.extend_from_slice(buf);
            self.pump_inbound();
        }
        Ok(buf.len())
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet
    }
}

/// A cloneable, lockable wrapper so one virtual device can serve as bulk
/// pipes for a link and as an interrupt source for an event pump at the
/// same time, the way one USB handle does.
#[derive(Clone)]
pub struct SharedVirtual(Arc<Mutex<VirtualDevice>>);

impl SharedVirtual {
    pub fn new(device: VirtualDevice) -> Self {
        SharedVirtual(Arc::new(Mutex::new(device)))
    }

    pub fn lock(&self) -> MutexGuard<'_, VirtualDevice> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// One interrupt-endpoint poll: pops a queued event container, or
    /// reports an empty poll after (a fraction of) the timeout.
    pub fn read_interrupt(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, TransportError> {
        let popped = self.lock().events.pop_front();
        match popped {
            Some(container) => {
                let n = container.len().min(buf.len());
                buf[..n].copy_from_slice(&container[..n]);
                Ok(Some(n))
            }
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                Ok(None)
            }
        }
    }
}

impl Pipes for SharedVirtual {
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.lock().read_bulk(buf, timeout)
    }

    fn write_bulk(&mut self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.lock().write_bulk(buf, timeout)
    }

    fn max_packet_size(&self) -> usize {
        self.lock().max_packet_size()
    }
}
