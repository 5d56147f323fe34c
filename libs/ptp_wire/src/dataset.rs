//! Variable-length PTP datasets carried in data phases.
//!
//! Both decode and encode are provided: the host decodes what devices send,
//! and encodes ObjectInfo for SendObjectInfo. The virtual test device uses
//! the encoders to answer like a real responder.

use log::trace;

use crate::codes::prop::datatype;
use crate::{Reader, WireError, Writer, SIZE_OVERFLOW};

fn truncated(r: &Reader) -> WireError {
    WireError::Truncated {
        needed: r.position() + 1,
        have: r.position() + r.remaining(),
    }
}

/// The DeviceInfo dataset (response to GetDeviceInfo).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub standard_version: u16,
    pub vendor_extension_id: u32,
    pub vendor_extension_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub playback_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let info = (|| {
            Some(DeviceInfo {
                standard_version: r.u16()?,
                vendor_extension_id: r.u32()?,
                vendor_extension_version: r.u16()?,
                vendor_extension_desc: r.string()?,
                functional_mode: r.u16()?,
                operations_supported: r.array_u16()?,
                events_supported: r.array_u16()?,
                device_properties_supported: r.array_u16()?,
                capture_formats: r.array_u16()?,
                playback_formats: r.array_u16()?,
                manufacturer: r.string()?,
                model: r.string()?,
                device_version: r.string()?,
                serial_number: r.string()?,
            })
        })()
        .ok_or_else(|| truncated(&r))?;
        trace!(
            "decoded DeviceInfo: model={:?} ops={}",
            info.model,
            info.operations_supported.len()
        );
        Ok(info)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u16(self.standard_version);
        w.put_u32(self.vendor_extension_id);
        w.put_u16(self.vendor_extension_version);
        w.put_string(&self.vendor_extension_desc);
        w.put_u16(self.functional_mode);
        w.put_array_u16(&self.operations_supported);
        w.put_array_u16(&self.events_supported);
        w.put_array_u16(&self.device_properties_supported);
        w.put_array_u16(&self.capture_formats);
        w.put_array_u16(&self.playback_formats);
        w.put_string(&self.manufacturer);
        w.put_string(&self.model);
        w.put_string(&self.device_version);
        w.put_string(&self.serial_number);
        w.into_vec()
    }

    pub fn supports_operation(&self, code: u16) -> bool {
        self.operations_supported.contains(&code)
    }
}

/// The StorageInfo dataset (response to GetStorageInfo).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageInfo {
    pub storage_type: u16,
    pub filesystem_type: u16,
    pub access_capability: u16,
    pub max_capacity: u64,
    pub free_space_bytes: u64,
    pub free_space_objects: u32,
    pub description: String,
    pub volume_label: String,
}

impl StorageInfo {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        (|| {
            Some(StorageInfo {
                storage_type: r.u16()?,
                filesystem_type: r.u16()?,
                access_capability: r.u16()?,
                max_capacity: r.u64()?,
                free_space_bytes: r.u64()?,
                free_space_objects: r.u32()?,
                description: r.string()?,
                volume_label: r.string()?,
            })
        })()
        .ok_or_else(|| truncated(&r))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u16(self.storage_type);
        w.put_u16(self.filesystem_type);
        w.put_u16(self.access_capability);
        w.put_u64(self.max_capacity);
        w.put_u64(self.free_space_bytes);
        w.put_u32(self.free_space_objects);
        w.put_string(&self.description);
        w.put_string(&self.volume_label);
        w.into_vec()
    }

    /// Access capability 0x0000 is read-write; everything else restricts
    /// writes in some way.
    pub fn read_only(&self) -> bool {
        self.access_capability != 0x0000
    }
}

/// The ObjectInfo dataset (GetObjectInfo / SendObjectInfo).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub format_code: u16,
    pub protection_status: u16,
    pub compressed_size: u32,
    pub thumb_format: u16,
    pub thumb_compressed_size: u32,
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub image_depth: u32,
    pub parent_handle: u32,
    pub association_type: u16,
    pub association_desc: u32,
    pub sequence_number: u32,
    pub filename: String,
    pub capture_date: String,
    pub modification_date: String,
    pub keywords: String,
}

impl ObjectInfo {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        (|| {
            Some(ObjectInfo {
                storage_id: r.u32()?,
                format_code: r.u16()?,
                protection_status: r.u16()?,
                compressed_size: r.u32()?,
                thumb_format: r.u16()?,
                thumb_compressed_size: r.u32()?,
                thumb_width: r.u32()?,
                thumb_height: r.u32()?,
                image_width: r.u32()?,
                image_height: r.u32()?,
                image_depth: r.u32()?,
                parent_handle: r.u32()?,
                association_type: r.u16()?,
                association_desc: r.u32()?,
                sequence_number: r.u32()?,
                filename: r.string()?,
                capture_date: r.string()?,
                modification_date: r.string()?,
                keywords: r.string()?,
            })
        })()
        .ok_or_else(|| truncated(&r))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(self.storage_id);
        w.put_u16(self.format_code);
        w.put_u16(self.protection_status);
        w.put_u32(self.compressed_size);
        w.put_u16(self.thumb_format);
        w.put_u32(self.thumb_compressed_size);
        w.put_u32(self.thumb_width);
        w.put_u32(self.thumb_height);
        w.put_u32(self.image_width);
        w.put_u32(self.image_height);
        w.put_u32(self.image_depth);
        w.put_u32(self.parent_handle);
        w.put_u16(self.association_type);
        w.put_u32(self.association_desc);
        w.put_u32(self.sequence_number);
        w.put_string(&self.filename);
        w.put_string(&self.capture_date);
        w.put_string(&self.modification_date);
        w.put_string(&self.keywords);
        w.into_vec()
    }

    pub fn is_folder(&self) -> bool {
        self.format_code == crate::fmt::ASSOCIATION
    }

    /// The object size when it fits the 32-bit dataset field. `None` means
    /// the size overflowed and must be fetched via the ObjectSize property.
    pub fn size(&self) -> Option<u64> {
        if self.compressed_size == SIZE_OVERFLOW {
            None
        } else {
            Some(self.compressed_size as u64)
        }
    }
}

/// A decoded property value from a prop-list element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    U128(u128),
    Str(String),
}

impl PropValue {
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            PropValue::U8(v) => Some(v as u64),
            PropValue::U16(v) => Some(v as u64),
            PropValue::U32(v) => Some(v as u64),
            PropValue::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One element of a GetObjectPropList response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropListEntry {
    pub handle: u32,
    pub prop_code: u16,
    pub datatype: u16,
    pub value: PropValue,
}

impl PropListEntry {
    /// Decodes a full GetObjectPropList payload: u32 element count followed
    /// by `{handle u32, prop u16, datatype u16, value}` elements.
    pub fn decode_list(buf: &[u8]) -> Result<Vec<PropListEntry>, WireError> {
        let mut r = Reader::new(buf);
        let count = r.u32().ok_or_else(|| truncated(&r))?;
        let mut out = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let entry = (|| {
                let handle = r.u32()?;
                let prop_code = r.u16()?;
                let dt = r.u16()?;
                let value = match dt {
                    datatype::I8 => PropValue::I8(r.u8()? as i8),
                    datatype::U8 => PropValue::U8(r.u8()?),
                    datatype::I16 => PropValue::I16(r.u16()? as i16),
                    datatype::U16 => PropValue::U16(r.u16()?),
                    datatype::I32 => PropValue::I32(r.u32()? as i32),
                    datatype::U32 => PropValue::U32(r.u32()?),
                    datatype::I64 => PropValue::I64(r.u64()? as i64),
                    datatype::U64 => PropValue::U64(r.u64()?),
                    datatype::U128 => PropValue::U128(r.u128()?),
                    datatype::STRING => PropValue::Str(r.string()?),
                    _ => return None,
                };
                Some(PropListEntry {
                    handle,
                    prop_code,
                    datatype: dt,
                    value,
                })
            })()
            .ok_or_else(|| truncated(&r))?;
            out.push(entry);
        }
        Ok(out)
    }

    /// Encodes a prop-list payload; the inverse of [`decode_list`].
    ///
    /// [`decode_list`]: PropListEntry::decode_list
    pub fn encode_list(entries: &[PropListEntry]) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(entries.len() as u32);
        for e in entries {
            w.put_u32(e.handle);
            w.put_u16(e.prop_code);
            w.put_u16(e.datatype);
            match &e.value {
                PropValue::I8(v) => w.put_u8(*v as u8),
                PropValue::U8(v) => w.put_u8(*v),
                PropValue::I16(v) => w.put_u16(*v as u16),
                PropValue::U16(v) => w.put_u16(*v),
                PropValue::I32(v) => w.put_u32(*v as u32),
                PropValue::U32(v) => w.put_u32(*v),
                PropValue::I64(v) => w.put_u64(*v as u64),
                PropValue::U64(v) => w.put_u64(*v),
                PropValue::U128(v) => w.put_u128(*v),
                PropValue::Str(s) => w.put_string(s),
            }
        }
        w.into_vec()
    }
}
