//! Interface ranking: the one algorithmic decision in this layer.
//!
//! Every alternate setting of every interface is a candidate. A candidate
//! scores:
//! * +100 when its (class, subclass, protocol) is exactly the
//!   still-image-capture / MTP triple (0x06, 0x01, 0x01);
//! * +60 when it is vendor-specific (0xFF) and its interface name contains
//!   "MTP";
//! * +5 when it has an interrupt-in endpoint (events will work);
//! * −200 when its name looks like a debug channel (ADB, fastboot).
//!
//! The highest-scoring candidate with both a bulk-in and a bulk-out
//! endpoint wins; ties break by interface number, then alternate number.
//! The whole ranking is retained for diagnostics.

use log::debug;
use serde::Serialize;

/// One endpoint of a candidate interface, reduced to what ranking needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawEndpoint {
    pub address: u8,
    pub is_bulk: bool,
    pub is_interrupt: bool,
    pub direction_in: bool,
    pub max_packet: u16,
}

/// One alternate setting of one interface, reduced to what ranking needs.
#[derive(Clone, Debug, Default)]
pub struct RawInterface {
    pub interface: u8,
    pub alt: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub name: Option<String>,
    pub endpoints: Vec<RawEndpoint>,
}

impl RawInterface {
    fn bulk_in(&self) -> Option<&RawEndpoint> {
        self.endpoints.iter().find(|e| e.is_bulk && e.direction_in)
    }

    fn bulk_out(&self) -> Option<&RawEndpoint> {
        self.endpoints.iter().find(|e| e.is_bulk && !e.direction_in)
    }

    fn interrupt_in(&self) -> Option<&RawEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.is_interrupt && e.direction_in)
    }

    fn is_exact_mtp(&self) -> bool {
        (self.class, self.subclass, self.protocol) == (0x06, 0x01, 0x01)
    }

    fn name_contains(&self, needle: &str) -> bool {
        self.name
            .as_deref()
            .is_some_and(|n| n.to_ascii_lowercase().contains(needle))
    }

    /// Whether this interface can plausibly be MTP at all. Used by
    /// enumeration to filter the bus.
    pub fn is_mtp_candidate(&self) -> bool {
        self.is_exact_mtp() || (self.class == 0xFF && self.name_contains("mtp"))
    }
}

/// The endpoints and identity of the claimed interface; consumed by the
/// transaction engine above.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkDescriptor {
    pub interface: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub interrupt_in: Option<u8>,
    /// Max packet size of the bulk-in endpoint; governs ZLP handling.
    pub max_packet_size: u16,
}

/// One ranked candidate, kept for diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct CandidateReport {
    pub interface: u8,
    pub alt: u8,
    pub score: i32,
    pub chosen: bool,
    /// Why the candidate scored (or was disqualified).
    pub reason: String,
}

/// The retained outcome of interface selection.
#[derive(Clone, Debug, Serialize)]
pub struct SelectionReport {
    pub winner: Option<LinkDescriptor>,
    pub score: i32,
    pub candidates: Vec<CandidateReport>,
}

fn score(candidate: &RawInterface) -> (i32, String) {
    let mut score = 0i32;
    let mut reasons: Vec<&str> = Vec::new();
    if candidate.is_exact_mtp() {
        score += 100;
        reasons.push("still-image class triple");
    } else if candidate.class == 0xFF && candidate.name_contains("mtp") {
        score += 60;
        reasons.push("vendor-specific named MTP");
    }
    if candidate.interrupt_in().is_some() {
        score += 5;
        reasons.push("has interrupt-in");
    }
    if candidate.name_contains("adb")
        || candidate.name_contains("debug")
        || candidate.name_contains("fastboot")
    {
        score -= 200;
        reasons.push("debug channel name");
    }
    (score, reasons.join(", "))
}

/// Ranks `candidates` and picks the winner.
pub fn rank(candidates: &[RawInterface]) -> SelectionReport {
    let mut reports = Vec::with_capacity(candidates.len());
    let mut best: Option<(i32, usize)> = None;

    for (idx, candidate) in candidates.iter().enumerate() {
        let (score, mut reason) = score(candidate);
        let eligible = candidate.bulk_in().is_some() && candidate.bulk_out().is_some();
        if !eligible {
            if !reason.is_empty() {
                reason.push_str("; ");
            }
            reason.push_str("missing bulk pair, disqualified");
        }
        reports.push(CandidateReport {
            interface: candidate.interface,
            alt: candidate.alt,
            score,
            chosen: false,
            reason,
        });
        if !eligible {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_score, best_idx)) => {
                let prev = &candidates[best_idx];
                score > best_score
                    || (score == best_score
                        && (candidate.interface, candidate.alt) < (prev.interface, prev.alt))
            }
        };
        if better {
            best = Some((score, idx));
        }
    }

    let Some((score, idx)) = best else {
        return SelectionReport {
            winner: None,
            score: 0,
            candidates: reports,
        };
    };

    let winner = &candidates[idx];
    reports[idx].chosen = true;
    let (bulk_in, bulk_out) = match (winner.bulk_in(), winner.bulk_out()) {
        (Some(i), Some(o)) => (*i, o.address),
        // Unreachable: eligibility required the bulk pair.
        _ => {
            return SelectionReport {
                winner: None,
                score: 0,
                candidates: reports,
            }
        }
    };
    debug!(
        "selected interface {} alt {} (score {score})",
        winner.interface, winner.alt
    );
    SelectionReport {
        winner: Some(LinkDescriptor {
            interface: winner.interface,
            alt_setting: winner.alt,
            class: winner.class,
            subclass: winner.subclass,
            protocol: winner.protocol,
            bulk_in: bulk_in.address,
            bulk_out,
            interrupt_in: winner.interrupt_in().map(|e| e.address),
            max_packet_size: bulk_in.max_packet,
        }),
        score,
        candidates: reports,
    }
}
