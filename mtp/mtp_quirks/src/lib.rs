//! The quirk database: a static catalog of per-device policy deviations.
//!
//! Real MTP devices disagree about almost everything outside the happy
//! path: how large a read they tolerate, whether they survive a PTP reset,
//! where files may be written, whether transaction ids restart per session.
//! Each deviation is captured as a [`QuirkRecord`]: a [`MatchRule`] over the
//! device [`Fingerprint`], a [`PolicyPatch`] of typed fields to apply, and
//! provenance metadata describing who recorded it and how trustworthy it is.
//!
//! The catalog is loaded once (from a JSON document, or the small embedded
//! [`QuirkDb::builtin`] set) and is read-only afterwards. Matching picks the
//! most specific non-deprecated record.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use device_identity::Fingerprint;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
mod test;

#[derive(Debug, Error)]
pub enum QuirkError {
    #[error("cannot read quirk catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("quirk catalog is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported quirk catalog version {0}")]
    Version(u32),
}

/// The catalog document version this build understands.
pub const CATALOG_VERSION: u32 = 1;

/// A partial policy: every tuning number and typed flag as an `Option`.
///
/// `None` means "this layer has no opinion"; the resolver overwrites field
/// by field, later layers winning. The same type serves quirk records,
/// learned-profile contributions, camera defaults, and user overrides.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyPatch {
    // Tuning numbers.
    pub max_chunk_bytes: Option<u32>,
    pub io_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub inactivity_timeout_ms: Option<u64>,
    pub overall_deadline_ms: Option<u64>,
    pub stabilize_ms: Option<u64>,
    pub post_claim_stabilize_ms: Option<u64>,
    pub event_poll_ms: Option<u64>,

    // Typed flags. Each one steers exactly one component.
    pub reset_on_open: Option<bool>,
    pub requires_kernel_detach: Option<bool>,
    pub needs_longer_open_timeout: Option<bool>,
    pub requires_session_before_device_info: Option<bool>,
    pub transaction_id_resets_on_session: Option<bool>,
    pub reset_reopen_on_open_session_io_error: Option<bool>,
    pub supports_partial_read_64: Option<bool>,
    pub supports_partial_read_32: Option<bool>,
    pub supports_partial_write: Option<bool>,
    pub prefers_prop_list_enumeration: Option<bool>,
    pub needs_short_reads: Option<bool>,
    pub stall_on_large_reads: Option<bool>,
    pub disable_event_pump: Option<bool>,
    pub require_stabilization: Option<bool>,
    pub skip_ptp_reset: Option<bool>,
    pub write_to_subfolder_only: Option<bool>,
    pub force_wildcard_storage_in_send_object_info: Option<bool>,
    pub empty_dates_in_send_object_info: Option<bool>,
    pub skip_get_object_prop_value: Option<bool>,
    pub supports_get_object_prop_list: Option<bool>,
    pub supports_get_partial_object: Option<bool>,

    // Write-target hints.
    pub preferred_write_folder: Option<String>,

    /// Fields this build does not know. Retained so newer catalogs degrade
    /// gracefully on older hosts; reported once at load time.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl PolicyPatch {
    pub fn is_empty(&self) -> bool {
        *self == PolicyPatch::default()
    }
}

/// Which fingerprints a quirk record applies to. `vid` is mandatory;
/// everything else narrows the match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    pub vid: u16,
    pub pid: Option<u16>,
    pub bcd_min: Option<u16>,
    pub bcd_max: Option<u16>,
    pub interface_class: Option<u8>,
}

impl MatchRule {
    pub fn matches(&self, fp: &Fingerprint) -> bool {
        self.vid == fp.vid
            && self.pid.map_or(true, |pid| pid == fp.pid)
            && self.bcd_min.map_or(true, |min| fp.bcd_device >= min)
            && self.bcd_max.map_or(true, |max| fp.bcd_device <= max)
            && self
                .interface_class
                .map_or(true, |class| class == fp.interface_class)
    }

    /// More constrained rules outrank broader ones.
    fn specificity(&self) -> u32 {
        let mut score = 1; // vid always present
        score += u32::from(self.pid.is_some()) * 4;
        score += u32::from(self.bcd_min.is_some() || self.bcd_max.is_some()) * 2;
        score += u32::from(self.interface_class.is_some());
        score
    }
}

/// How much a record should be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuirkStatus {
    Experimental,
    Stable,
    Deprecated,
}

/// Who recorded a quirk, when, and with what confidence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuirkProvenance {
    pub author: String,
    /// ISO date of the observation, e.g. "2026-03-14".
    pub date: String,
    pub status: QuirkStatus,
}

/// One catalog entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuirkRecord {
    /// A short human name, e.g. "pixel-family-handshake-reset".
    pub name: String,
    #[serde(rename = "match")]
    pub rule: MatchRule,
    pub policy: PolicyPatch,
    pub provenance: QuirkProvenance,
}

#[derive(Debug, Deserialize, Serialize)]
struct CatalogDocument {
    version: u32,
    records: Vec<QuirkRecord>,
}

/// The loaded, read-only quirk catalog.
#[derive(Clone, Debug, Default)]
pub struct QuirkDb {
    records: Vec<QuirkRecord>,
}

impl QuirkDb {
    /// Loads a catalog from the JSON document at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, QuirkError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Parses a catalog from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, QuirkError> {
        let doc: CatalogDocument = serde_json::from_str(json)?;
        if doc.version != CATALOG_VERSION {
            return Err(QuirkError::Version(doc.version));
        }
        for record in &doc.records {
            if !record.policy.unknown.is_empty() {
                warn!(
                    "quirk {:?} carries {} unknown field(s), ignoring: {:?}",
                    record.name,
                    record.policy.unknown.len(),
                    record.policy.unknown.keys().collect::<Vec<_>>()
                );
            }
        }
        debug!("loaded quirk catalog with {} records", doc.records.len());
        Ok(QuirkDb {
            records: doc.records,
        })
    }

    /// The embedded catalog: the handful of devices this runtime has
    /// first-class knowledge of. A catalog loaded from disk replaces it
    /// wholesale rather than merging.
    pub fn builtin() -> Self {
        QuirkDb {
            records: builtin_records(),
        }
    }

    pub fn records(&self) -> &[QuirkRecord] {
        &self.records
    }

    /// Finds the most specific non-deprecated record matching `fp`.
    /// Equal specificity resolves to the earliest record, so catalog order
    /// is a tiebreaker authors can rely on.
    pub fn lookup(&self, fp: &Fingerprint) -> Option<&QuirkRecord> {
        self.records
            .iter()
            .filter(|r| r.provenance.status != QuirkStatus::Deprecated)
            .filter(|r| r.rule.matches(fp))
            .max_by(|a, b| {
                a.rule
                    .specificity()
                    .cmp(&b.rule.specificity())
                    // max_by keeps the later of equals; invert so the
                    // earlier record wins ties.
                    .then(std::cmp::Ordering::Greater)
            })
    }
}

fn builtin_records() -> Vec<QuirkRecord> {
    vec![
        QuirkRecord {
            name: "pixel-family-handshake-reset".into(),
            rule: MatchRule {
                vid: 0x18d1,
                pid: Some(0x4ee1),
                ..Default::default()
            },
            policy: PolicyPatch {
                reset_reopen_on_open_session_io_error: Some(true),
                supports_partial_read_64: Some(true),
                supports_partial_write: Some(true),
                supports_get_object_prop_list: Some(true),
                ..Default::default()
            },
            provenance: QuirkProvenance {
                author: "device-lab".into(),
                date: "2025-11-02".into(),
                status: QuirkStatus::Stable,
            },
        },
        QuirkRecord {
            name: "xiaomi-root-write-redirect".into(),
            rule: MatchRule {
                vid: 0x2717,
                pid: Some(0xff40),
                ..Default::default()
            },
            policy: PolicyPatch {
                write_to_subfolder_only: Some(true),
                preferred_write_folder: Some("Download".into()),
                empty_dates_in_send_object_info: Some(true),
                ..Default::default()
            },
            provenance: QuirkProvenance {
                author: "device-lab".into(),
                date: "2025-09-18".into(),
                status: QuirkStatus::Stable,
            },
        },
        QuirkRecord {
            name: "galaxy-session-txid-restart".into(),
            rule: MatchRule {
                vid: 0x04e8,
                pid: Some(0x6860),
                ..Default::default()
            },
            policy: PolicyPatch {
                transaction_id_resets_on_session: Some(true),
                requires_kernel_detach: Some(true),
                force_wildcard_storage_in_send_object_info: Some(true),
                ..Default::default()
            },
            provenance: QuirkProvenance {
                author: "device-lab".into(),
                date: "2025-07-30".into(),
                status: QuirkStatus::Stable,
            },
        },
        QuirkRecord {
            name: "eos-slow-open".into(),
            rule: MatchRule {
                vid: 0x04a9,
                interface_class: Some(0x06),
                ..Default::default()
            },
            policy: PolicyPatch {
                needs_longer_open_timeout: Some(true),
                handshake_timeout_ms: Some(15_000),
                requires_session_before_device_info: Some(true),
                disable_event_pump: Some(true),
                ..Default::default()
            },
            provenance: QuirkProvenance {
                author: "device-lab".into(),
                date: "2026-01-12".into(),
                status: QuirkStatus::Experimental,
            },
        },
        QuirkRecord {
            name: "fire-tablet-short-reads".into(),
            rule: MatchRule {
                vid: 0x1949,
                ..Default::default()
            },
            policy: PolicyPatch {
                needs_short_reads: Some(true),
                stall_on_large_reads: Some(true),
                max_chunk_bytes: Some(512 * 1024),
                ..Default::default()
            },
            provenance: QuirkProvenance {
                author: "device-lab".into(),
                date: "2025-05-21".into(),
                status: QuirkStatus::Experimental,
            },
        },
    ]
}
