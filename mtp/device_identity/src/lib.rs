//! Device fingerprints and stable identities.
//!
//! Two different notions of "which device is this" live here:
//! * [`Fingerprint`] identifies a device *shape*: vid/pid/bcd plus the MTP
//!   interface triple and endpoint addresses. Two physical units of the same
//!   model share a fingerprint; a firmware update (bcd change) deliberately
//!   produces a new one. Quirk records and learned profiles key on this.
//! * [`IdentityStore`] maps a *physical* device to a stable UUID derived
//!   from its USB (or MTP) serial number, so journals and higher layers can
//!   recognize the same unit across reconnects and restarts. Serial-less
//!   devices get a random UUID pinned to their bus position.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[cfg(test)]
mod test;

/// Namespace for UUIDv5 derivation of device identities and fingerprint
/// hashes. Changing it would orphan every existing journal and profile.
const IDENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6d74_7075_7362_4964_656e_7469_7479_3031);

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// The canonical description of a device shape, used as the lookup key for
/// quirk records and learned profiles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub vid: u16,
    pub pid: u16,
    /// The bcdDevice field; firmware revisions bump this on purpose.
    pub bcd_device: u16,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub interrupt_in: Option<u8>,
    /// Optional hash over the DeviceInfo identification strings, folded in
    /// once a session has seen them.
    pub info_hash: Option<String>,
}

impl Fingerprint {
    /// The canonical string form, e.g.
    /// `18d1:4ee1:0404/06.01.01/81-01-82#1a2b3c4d`.
    pub fn canonical(&self) -> String {
        let mut s = format!(
            "{:04x}:{:04x}:{:04x}/{:02x}.{:02x}.{:02x}/{:02x}-{:02x}-{}",
            self.vid,
            self.pid,
            self.bcd_device,
            self.interface_class,
            self.interface_subclass,
            self.interface_protocol,
            self.bulk_in,
            self.bulk_out,
            match self.interrupt_in {
                Some(ep) => format!("{ep:02x}"),
                None => "none".to_string(),
            },
        );
        if let Some(hash) = &self.info_hash {
            s.push('#');
            s.push_str(hash);
        }
        s
    }

    /// A compact stable hash of the canonical form, suitable as a map key.
    pub fn hash(&self) -> String {
        Uuid::new_v5(&IDENTITY_NAMESPACE, self.canonical().as_bytes()).simple().to_string()
    }

    /// Folds the DeviceInfo identification strings into the fingerprint.
    pub fn with_info_strings(mut self, manufacturer: &str, model: &str, version: &str) -> Self {
        let blob = format!("{manufacturer}\u{0}{model}\u{0}{version}");
        let digest = Uuid::new_v5(&IDENTITY_NAMESPACE, blob.as_bytes());
        self.info_hash = Some(digest.simple().to_string()[..8].to_string());
        self
    }

    /// True for the (0x06, 0x01, 0x01) still-image-capture interface class.
    pub fn is_still_image_class(&self) -> bool {
        self.interface_class == 0x06
    }
}

/// The raw signals discovery can provide about a physical device.
#[derive(Clone, Debug, Default)]
pub struct IdentitySignals {
    pub vid: u16,
    pub pid: u16,
    pub bus: u8,
    pub address: u8,
    pub usb_serial: Option<String>,
    pub mtp_serial: Option<String>,
}

impl IdentitySignals {
    /// The anchor string the store keys on. Serial numbers win; otherwise
    /// the bus position has to do.
    fn anchor(&self) -> String {
        let serial = self
            .usb_serial
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.mtp_serial.as_deref().filter(|s| !s.is_empty()));
        match serial {
            Some(serial) => format!("serial/{:04x}:{:04x}/{serial}", self.vid, self.pid),
            None => format!(
                "position/{:04x}:{:04x}/{}:{}",
                self.vid, self.pid, self.bus, self.address
            ),
        }
    }

    fn has_serial(&self) -> bool {
        self.anchor().starts_with("serial/")
    }
}

/// One known physical device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: Uuid,
    pub usb_serial: Option<String>,
    pub mtp_serial: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A persistent map from device anchors to stable identities.
///
/// All mutation happens under one internal lock and is flushed to disk
/// before the call returns.
pub struct IdentityStore {
    path: PathBuf,
    inner: Mutex<BTreeMap<String, DeviceIdentity>>,
}

impl IdentityStore {
    /// Opens (or creates) the store backed by the JSON file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref().to_path_buf();
        let inner = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(IdentityStore {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Resolves the stable identity for a device, creating one on first
    /// sight. Serial-bearing devices derive a deterministic UUIDv5 so the
    /// same unit resolves identically even if the store file is lost.
    pub fn resolve_identity(
        &self,
        signals: &IdentitySignals,
    ) -> Result<DeviceIdentity, IdentityError> {
        let anchor = signals.anchor();
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        let entry = inner.entry(anchor.clone()).or_insert_with(|| {
            let id = if signals.has_serial() {
                Uuid::new_v5(&IDENTITY_NAMESPACE, anchor.as_bytes())
            } else {
                Uuid::new_v4()
            };
            info!("new device identity {id} for {anchor}");
            DeviceIdentity {
                id,
                usb_serial: signals.usb_serial.clone(),
                mtp_serial: signals.mtp_serial.clone(),
                first_seen: now,
                last_seen: now,
            }
        });
        entry.last_seen = now;
        let resolved = entry.clone();
        self.persist(&inner)?;
        Ok(resolved)
    }

    /// Looks up a known identity by its stable id.
    pub fn identity_for(&self, id: Uuid) -> Option<DeviceIdentity> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.values().find(|d| d.id == id).cloned()
    }

    /// Records the MTP-level serial once a session has read DeviceInfo.
    /// This upgrades serial-less identities for future matching.
    pub fn update_mtp_serial(&self, id: Uuid, serial: &str) -> Result<(), IdentityError> {
        if serial.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut changed = false;
        for identity in inner.values_mut() {
            if identity.id == id && identity.mtp_serial.as_deref() != Some(serial) {
                debug!("identity {id}: recording MTP serial");
                identity.mtp_serial = Some(serial.to_string());
                changed = true;
            }
        }
        if changed {
            self.persist(&inner)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<DeviceIdentity> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.values().cloned().collect()
    }

    /// Forgets a device entirely.
    pub fn remove(&self, id: Uuid) -> Result<bool, IdentityError> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = inner.len();
        inner.retain(|_, d| d.id != id);
        let removed = inner.len() != before;
        if removed {
            self.persist(&inner)?;
        }
        Ok(removed)
    }

    fn persist(&self, inner: &BTreeMap<String, DeviceIdentity>) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(inner)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
