//! The policy resolver: one [`EffectivePolicy`] from five ordered layers.
//!
//! Merge order, lowest to highest precedence:
//! 1. built-in defaults,
//! 2. runtime-probed capabilities (the DeviceInfo operations array),
//! 3. the learned profile for this fingerprint,
//! 4. the static quirk record (or the camera-defaults fallback for
//!    class-0x06 still-image devices with no record),
//! 5. user overrides parsed from a single `key=value,…` string.
//!
//! Later layers overwrite earlier ones field by field; typed flags follow
//! the same overwrite rule (never a bit-union). After the merge the tuning
//! numbers are clamped to global safe ranges. Each field remembers which
//! layer set it, for diagnostics. [`resolve`] is pure: same inputs, same
//! output.

use std::collections::BTreeMap;
use std::time::Duration;

use device_identity::Fingerprint;
use learned_profiles::LearnedProfile;
use log::debug;
use mtp_quirks::{PolicyPatch, QuirkDb};
use ptp_wire::{ops, DeviceInfo};
use serde::Serialize;
use thiserror::Error;

#[cfg(test)]
mod test;

/// Clamp bounds for the tuning numbers (inclusive).
pub mod bounds {
    pub const CHUNK_MIN: u32 = 128 * 1024;
    pub const CHUNK_MAX: u32 = 16 * 1024 * 1024;
    pub const IO_TIMEOUT_MIN_MS: u64 = 1_000;
    pub const IO_TIMEOUT_MAX_MS: u64 = 60_000;
    pub const HANDSHAKE_MIN_MS: u64 = 1_000;
    pub const HANDSHAKE_MAX_MS: u64 = 120_000;
    pub const INACTIVITY_MIN_MS: u64 = 1_000;
    pub const INACTIVITY_MAX_MS: u64 = 600_000;
    pub const DEADLINE_MIN_MS: u64 = 5_000;
    pub const DEADLINE_MAX_MS: u64 = 300_000;
    pub const STABILIZE_MIN_MS: u64 = 0;
    pub const STABILIZE_MAX_MS: u64 = 5_000;
    pub const EVENT_POLL_MIN_MS: u64 = 50;
    pub const EVENT_POLL_MAX_MS: u64 = 250;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unknown override key {0:?}")]
    UnknownKey(String),
    #[error("bad value {value:?} for override key {key:?}")]
    BadValue { key: String, value: String },
}

/// Which layer set a policy field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Default,
    Probe,
    Learned,
    Quirk,
    UserOverride,
}

/// The typed flags, resolved to concrete booleans. Each flag steers exactly
/// one component; see the component crates for their meaning.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PolicyFlags {
    pub reset_on_open: bool,
    pub requires_kernel_detach: bool,
    pub needs_longer_open_timeout: bool,
    pub requires_session_before_device_info: bool,
    pub transaction_id_resets_on_session: bool,
    pub reset_reopen_on_open_session_io_error: bool,
    pub supports_partial_read_64: bool,
    pub supports_partial_read_32: bool,
    pub supports_partial_write: bool,
    pub prefers_prop_list_enumeration: bool,
    pub needs_short_reads: bool,
    pub stall_on_large_reads: bool,
    pub disable_event_pump: bool,
    pub require_stabilization: bool,
    pub skip_ptp_reset: bool,
    pub write_to_subfolder_only: bool,
    pub force_wildcard_storage_in_send_object_info: bool,
    pub empty_dates_in_send_object_info: bool,
    pub skip_get_object_prop_value: bool,
    pub supports_get_object_prop_list: bool,
    pub supports_get_partial_object: bool,
}

/// The resolved policy governing one session. Immutable once produced;
/// changing any field requires a new session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EffectivePolicy {
    pub max_chunk_bytes: u32,
    pub io_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub overall_deadline_ms: u64,
    pub stabilize_ms: u64,
    pub post_claim_stabilize_ms: u64,
    pub event_poll_ms: u64,
    pub flags: PolicyFlags,
    pub preferred_write_folder: Option<String>,
    /// Which layer set each field, keyed by field name.
    pub provenance: BTreeMap<&'static str, Source>,
}

impl Default for EffectivePolicy {
    fn default() -> Self {
        EffectivePolicy {
            max_chunk_bytes: 1024 * 1024,
            io_timeout_ms: 8_000,
            handshake_timeout_ms: 10_000,
            inactivity_timeout_ms: 30_000,
            overall_deadline_ms: 120_000,
            stabilize_ms: 100,
            post_claim_stabilize_ms: 200,
            event_poll_ms: 100,
            flags: PolicyFlags::default(),
            preferred_write_folder: None,
            provenance: BTreeMap::new(),
        }
    }
}

impl EffectivePolicy {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// The handshake timeout, honouring `needs_longer_open_timeout` by
    /// doubling the configured value.
    pub fn handshake_timeout(&self) -> Duration {
        let ms = if self.flags.needs_longer_open_timeout {
            self.handshake_timeout_ms * 2
        } else {
            self.handshake_timeout_ms
        };
        Duration::from_millis(ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn overall_deadline(&self) -> Duration {
        Duration::from_millis(self.overall_deadline_ms)
    }

    pub fn stabilize(&self) -> Duration {
        Duration::from_millis(self.stabilize_ms)
    }

    pub fn post_claim_stabilize(&self) -> Duration {
        Duration::from_millis(self.post_claim_stabilize_ms)
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }

    /// Which layer set `field` (by its `snake_case` name).
    pub fn source_of(&self, field: &str) -> Source {
        self.provenance.get(field).copied().unwrap_or(Source::Default)
    }

    /// Whether any partial-read strategy is available.
    pub fn any_partial_read(&self) -> bool {
        self.flags.supports_partial_read_64
            || self.flags.supports_partial_read_32
            || self.flags.supports_get_partial_object
    }
}

/// What probing the device (GetDeviceInfo) established.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbedCapabilities {
    pub supports_partial_read_64: bool,
    pub supports_partial_read_32: bool,
    pub supports_partial_write: bool,
    pub supports_get_object_prop_list: bool,
}

impl ProbedCapabilities {
    pub fn from_device_info(info: &DeviceInfo) -> Self {
        ProbedCapabilities {
            supports_partial_read_64: info.supports_operation(ops::GET_PARTIAL_OBJECT_64),
            supports_partial_read_32: info.supports_operation(ops::GET_PARTIAL_OBJECT),
            supports_partial_write: info.supports_operation(ops::SEND_PARTIAL_OBJECT),
            supports_get_object_prop_list: info.supports_operation(ops::GET_OBJECT_PROP_LIST),
        }
    }

    fn patch(&self) -> PolicyPatch {
        PolicyPatch {
            supports_partial_read_64: Some(self.supports_partial_read_64),
            supports_partial_read_32: Some(self.supports_partial_read_32),
            supports_get_partial_object: Some(self.supports_partial_read_32),
            supports_partial_write: Some(self.supports_partial_write),
            supports_get_object_prop_list: Some(self.supports_get_object_prop_list),
            prefers_prop_list_enumeration: Some(self.supports_get_object_prop_list),
            ..Default::default()
        }
    }
}

/// Minimum sessions before a learned profile is allowed to steer tuning.
const LEARNED_MIN_SAMPLES: u32 = 3;
/// A profile whose transfers fail this often does not get to pick the chunk
/// size.
const LEARNED_MIN_SUCCESS_RATE: f64 = 0.8;

fn learned_patch(profile: &LearnedProfile) -> PolicyPatch {
    if profile.sample_count < LEARNED_MIN_SAMPLES
        || profile.success_rate < LEARNED_MIN_SUCCESS_RATE
        || profile.chunk_bytes <= 0.0
    {
        return PolicyPatch::default();
    }
    // Round to the nearest 128 KiB step; the clamp pass bounds it.
    let step = bounds::CHUNK_MIN as f64;
    let chunk = ((profile.chunk_bytes / step).round() * step) as u32;
    PolicyPatch {
        max_chunk_bytes: Some(chunk.max(bounds::CHUNK_MIN)),
        ..Default::default()
    }
}

/// The quirk-layer fallback for still-image-class cameras with no catalog
/// record: slow to open a session, happier with modest chunks.
fn camera_defaults() -> PolicyPatch {
    PolicyPatch {
        needs_longer_open_timeout: Some(true),
        handshake_timeout_ms: Some(15_000),
        max_chunk_bytes: Some(512 * 1024),
        ..Default::default()
    }
}

macro_rules! overwrite_nums {
    ($patch:ident, $eff:ident, $src:expr; $($field:ident),* $(,)?) => {
        $(
            if let Some(v) = $patch.$field {
                $eff.$field = v;
                $eff.provenance.insert(stringify!($field), $src);
            }
        )*
    };
}

macro_rules! overwrite_flags {
    ($patch:ident, $eff:ident, $src:expr; $($field:ident),* $(,)?) => {
        $(
            if let Some(v) = $patch.$field {
                $eff.flags.$field = v;
                $eff.provenance.insert(stringify!($field), $src);
            }
        )*
    };
}

fn apply_patch(eff: &mut EffectivePolicy, patch: &PolicyPatch, src: Source) {
    overwrite_nums!(patch, eff, src;
        max_chunk_bytes,
        io_timeout_ms,
        handshake_timeout_ms,
        inactivity_timeout_ms,
        overall_deadline_ms,
        stabilize_ms,
        post_claim_stabilize_ms,
        event_poll_ms,
    );
    overwrite_flags!(patch, eff, src;
        reset_on_open,
        requires_kernel_detach,
        needs_longer_open_timeout,
        requires_session_before_device_info,
        transaction_id_resets_on_session,
        reset_reopen_on_open_session_io_error,
        supports_partial_read_64,
        supports_partial_read_32,
        supports_partial_write,
        prefers_prop_list_enumeration,
        needs_short_reads,
        stall_on_large_reads,
        disable_event_pump,
        require_stabilization,
        skip_ptp_reset,
        write_to_subfolder_only,
        force_wildcard_storage_in_send_object_info,
        empty_dates_in_send_object_info,
        skip_get_object_prop_value,
        supports_get_object_prop_list,
        supports_get_partial_object,
    );
    if let Some(folder) = &patch.preferred_write_folder {
        eff.preferred_write_folder = Some(folder.clone());
        eff.provenance.insert("preferred_write_folder", src);
    }
}

fn clamp(eff: &mut EffectivePolicy) {
    use bounds::*;
    eff.max_chunk_bytes = eff.max_chunk_bytes.clamp(CHUNK_MIN, CHUNK_MAX);
    eff.io_timeout_ms = eff.io_timeout_ms.clamp(IO_TIMEOUT_MIN_MS, IO_TIMEOUT_MAX_MS);
    eff.handshake_timeout_ms = eff
        .handshake_timeout_ms
        .clamp(HANDSHAKE_MIN_MS, HANDSHAKE_MAX_MS);
    eff.inactivity_timeout_ms = eff
        .inactivity_timeout_ms
        .clamp(INACTIVITY_MIN_MS, INACTIVITY_MAX_MS);
    eff.overall_deadline_ms = eff
        .overall_deadline_ms
        .clamp(DEADLINE_MIN_MS, DEADLINE_MAX_MS);
    eff.stabilize_ms = eff.stabilize_ms.clamp(STABILIZE_MIN_MS, STABILIZE_MAX_MS);
    eff.post_claim_stabilize_ms = eff
        .post_claim_stabilize_ms
        .clamp(STABILIZE_MIN_MS, STABILIZE_MAX_MS);
    eff.event_poll_ms = eff.event_poll_ms.clamp(EVENT_POLL_MIN_MS, EVENT_POLL_MAX_MS);
}

/// Produces the effective policy for one session.
///
/// `overrides` is the pre-parsed user layer; see [`parse_overrides`].
pub fn resolve(
    fingerprint: &Fingerprint,
    probe: Option<&ProbedCapabilities>,
    learned: Option<&LearnedProfile>,
    quirks: &QuirkDb,
    overrides: Option<&PolicyPatch>,
) -> EffectivePolicy {
    let mut eff = EffectivePolicy::default();

    if let Some(probe) = probe {
        apply_patch(&mut eff, &probe.patch(), Source::Probe);
    }
    if let Some(profile) = learned {
        apply_patch(&mut eff, &learned_patch(profile), Source::Learned);
    }
    match quirks.lookup(fingerprint) {
        Some(record) => {
            debug!("quirk record {:?} matched {}", record.name, fingerprint.canonical());
            apply_patch(&mut eff, &record.policy, Source::Quirk);
        }
        None if fingerprint.is_still_image_class() => {
            debug!("no quirk record; applying camera defaults");
            apply_patch(&mut eff, &camera_defaults(), Source::Quirk);
        }
        None => {}
    }
    if let Some(overrides) = overrides {
        apply_patch(&mut eff, overrides, Source::UserOverride);
    }

    clamp(&mut eff);
    eff
}

/// Parses the single `key=value,…` override string of the environment
/// contract. Boolean keys accept `true`/`false`/`1`/`0` or may appear bare.
pub fn parse_overrides(input: &str) -> Result<PolicyPatch, PolicyError> {
    let mut patch = PolicyPatch::default();
    for item in input.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (key, value) = match item.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (item, None),
        };
        let num = |field: &mut Option<u64>| -> Result<(), PolicyError> {
            let value = value.ok_or_else(|| PolicyError::BadValue {
                key: key.to_string(),
                value: String::new(),
            })?;
            *field = Some(value.parse().map_err(|_| PolicyError::BadValue {
                key: key.to_string(),
                value: value.to_string(),
            })?);
            Ok(())
        };
        let flag = || -> Result<bool, PolicyError> {
            match value {
                None | Some("true") | Some("1") => Ok(true),
                Some("false") | Some("0") => Ok(false),
                Some(other) => Err(PolicyError::BadValue {
                    key: key.to_string(),
                    value: other.to_string(),
                }),
            }
        };
        match key {
            "max-chunk-bytes" => {
                let mut tmp = None;
                num(&mut tmp)?;
                patch.max_chunk_bytes = tmp.map(|v| v.min(u32::MAX as u64) as u32);
            }
            "io-timeout-ms" => num(&mut patch.io_timeout_ms)?,
            "handshake-timeout-ms" => num(&mut patch.handshake_timeout_ms)?,
            "inactivity-timeout-ms" => num(&mut patch.inactivity_timeout_ms)?,
            "overall-deadline-ms" => num(&mut patch.overall_deadline_ms)?,
            "stabilize-ms" => num(&mut patch.stabilize_ms)?,
            "post-claim-stabilize-ms" => num(&mut patch.post_claim_stabilize_ms)?,
            "event-poll-ms" => num(&mut patch.event_poll_ms)?,
            "disable-partial-read" => {
                let disable = flag()?;
                if disable {
                    patch.supports_partial_read_64 = Some(false);
                    patch.supports_partial_read_32 = Some(false);
                    patch.supports_get_partial_object = Some(false);
                }
            }
            "disable-partial-write" => {
                if flag()? {
                    patch.supports_partial_write = Some(false);
                }
            }
            other => return Err(PolicyError::UnknownKey(other.to_string())),
        }
    }
    Ok(patch)
}
