//! The transaction engine: command, data phase, response, one at a time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use mtp_policy::EffectivePolicy;
use ptp_wire::{
    ops as opcodes, rc, Container, ContainerHeader, ContainerKind, CONTAINER_HEADER_LEN,
};
use serde::Serialize;
use usb_transport::TransportError;

use crate::{LinkError, Pipes, SessionState};

/// Bound on the transaction diagnostics ring.
pub const RING_CAP: usize = 1000;

/// Consecutive out-of-order containers tolerated before the link is
/// declared lost.
const MISMATCH_LIMIT: u32 = 3;

/// How long to wait for an expected trailing ZLP before assuming the
/// device simply does not send one.
const ZLP_TIMEOUT: Duration = Duration::from_millis(100);

/// Read-request cap applied when the policy flags the device as stalling
/// on large reads.
const STALL_READ_CAP: usize = 256 * 1024;

/// A streaming consumer for IN data phases. Called with successive chunks;
/// returning an error aborts the transaction (cancellation surfaces as
/// [`LinkError::Cancelled`]).
pub type DataSink<'a> = &'a mut dyn FnMut(&[u8]) -> Result<(), LinkError>;

/// A streaming producer for OUT data phases. Fills the buffer it is given
/// and returns how many bytes it produced; zero before the declared total
/// is an error.
pub type DataSource<'a> = &'a mut dyn FnMut(&mut [u8]) -> Result<usize, LinkError>;

/// One completed (or failed) transaction, kept in a bounded ring for
/// diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct TransactionRecord {
    pub opcode: u16,
    pub operation: &'static str,
    pub transaction_id: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_ms: u64,
    pub outcome: String,
}

/// What a transaction yields: the response code and up to five parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub params: Vec<u32>,
}

impl Response {
    /// Fails with the device-error variant unless the code is OK.
    pub fn ok(&self) -> Result<(), LinkError> {
        if self.code == rc::OK {
            Ok(())
        } else {
            Err(LinkError::device(self.code))
        }
    }

    pub fn param(&self, n: usize) -> Option<u32> {
        self.params.get(n).copied()
    }
}

enum DataPhase<'a> {
    None,
    In(DataSink<'a>),
    Out { total: u64, source: DataSource<'a> },
}

enum StreamOutcome {
    /// A data container was streamed to the sink.
    Data { bytes: u64 },
    /// The device skipped the data phase and answered directly.
    Response(Response),
}

/// The PTP transaction engine over a claimed pair of bulk pipes.
pub struct Link<P: Pipes> {
    pipes: P,
    policy: EffectivePolicy,
    state: SessionState,
    session_id: u32,
    next_txid: u32,
    mismatch_strikes: u32,
    /// A packet read while probing for a ZLP that turned out to be the
    /// start of the next container.
    pending_packet: Option<Vec<u8>>,
    ring: VecDeque<TransactionRecord>,
}

impl<P: Pipes> Link<P> {
    pub fn new(pipes: P, policy: EffectivePolicy) -> Self {
        Link {
            pipes,
            policy,
            state: SessionState::Idle,
            session_id: 0,
            next_txid: 1,
            mismatch_strikes: 0,
            pending_packet: None,
            ring: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> &EffectivePolicy {
        &self.policy
    }

    /// Adopts the final resolved policy. Called exactly once, after the
    /// capability probe completes session setup; the policy is immutable
    /// for the rest of the session.
    pub fn set_policy(&mut self, policy: EffectivePolicy) {
        self.policy = policy;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn pipes(&self) -> &P {
        &self.pipes
    }

    pub fn pipes_mut(&mut self) -> &mut P {
        &mut self.pipes
    }

    /// The most recent transaction records, oldest first.
    pub fn transactions(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.ring.iter()
    }

    /// Marks the link unusable; the next operation must re-open.
    pub fn mark_lost(&mut self, why: &'static str) {
        warn!("link marked lost: {why}");
        self.state = SessionState::Lost;
    }

    /// Transaction ids start at 1, increase monotonically, and skip the
    /// 0xFFFFFFFF sentinel; 0 is never allocated.
    fn alloc_txid(&mut self) -> u32 {
        let id = self.next_txid;
        self.next_txid = match self.next_txid.wrapping_add(1) {
            0 | 0xFFFF_FFFF => 1,
            v => v,
        };
        id
    }

    /// Opens session `id`. A SessionAlreadyOpen answer triggers one
    /// close-and-retry cycle; a second refusal surfaces.
    pub fn open_session(&mut self, id: u32) -> Result<(), LinkError> {
        if self.state == SessionState::Open {
            return Ok(());
        }
        if self.policy.flags.transaction_id_resets_on_session {
            self.next_txid = 1;
        }
        self.state = SessionState::Opening;
        let timeout = self.policy.handshake_timeout();

        let resp = self.transact(opcodes::OPEN_SESSION, &[id], DataPhase::None, timeout)?;
        let resp = match resp.code {
            rc::OK => resp,
            rc::SESSION_ALREADY_OPEN => {
                debug!("session already open; closing and retrying once");
                let _ = self.transact(opcodes::CLOSE_SESSION, &[], DataPhase::None, timeout);
                let retry = self.transact(opcodes::OPEN_SESSION, &[id], DataPhase::None, timeout)?;
                if retry.code == rc::SESSION_ALREADY_OPEN {
                    self.state = SessionState::Idle;
                    return Err(LinkError::SessionAlreadyOpen);
                }
                retry
            }
            _ => resp,
        };
        if resp.code != rc::OK {
            self.state = SessionState::Idle;
            return Err(LinkError::device(resp.code));
        }
        self.session_id = id;
        self.state = SessionState::Open;
        debug!("session {id} open");
        Ok(())
    }

    /// Best-effort close; never surfaces errors once the link is known
    /// dead.
    pub fn close_session(&mut self) {
        if matches!(self.state, SessionState::Open | SessionState::InTransaction) {
            self.state = SessionState::Closing;
            let timeout = self.policy.io_timeout();
            if let Err(e) = self.transact(opcodes::CLOSE_SESSION, &[], DataPhase::None, timeout) {
                debug!("close_session failed (ignored): {e}");
            }
        }
        self.state = SessionState::Closed;
    }

    /// A command with no data phase.
    pub fn execute(&mut self, opcode: u16, params: &[u32]) -> Result<Response, LinkError> {
        self.transact(opcode, params, DataPhase::None, self.policy.io_timeout())
    }

    /// A command whose data phase flows device-to-host through `sink`.
    pub fn execute_in(
        &mut self,
        opcode: u16,
        params: &[u32],
        sink: DataSink,
    ) -> Result<Response, LinkError> {
        self.transact(opcode, params, DataPhase::In(sink), self.policy.io_timeout())
    }

    /// Like [`Link::execute_in`] but collects the data phase into a buffer;
    /// for small datasets only.
    pub fn execute_in_buffered(
        &mut self,
        opcode: u16,
        params: &[u32],
    ) -> Result<(Response, Vec<u8>), LinkError> {
        let mut out = Vec::new();
        let mut sink = |chunk: &[u8]| -> Result<(), LinkError> {
            out.extend_from_slice(chunk);
            Ok(())
        };
        let resp = self.execute_in(opcode, params, &mut sink)?;
        Ok((resp, out))
    }

    /// A command whose data phase flows host-to-device: `total` bytes drawn
    /// from `source` in chunks of at most the policy chunk size.
    pub fn execute_out(
        &mut self,
        opcode: u16,
        params: &[u32],
        total: u64,
        source: DataSource,
    ) -> Result<Response, LinkError> {
        self.transact(
            opcode,
            params,
            DataPhase::Out { total, source },
            self.policy.io_timeout(),
        )
    }

    fn transact(
        &mut self,
        opcode: u16,
        params: &[u32],
        mut data: DataPhase<'_>,
        timeout: Duration,
    ) -> Result<Response, LinkError> {
        let txid = self.alloc_txid();
        let prev_state = self.state;
        self.state = SessionState::InTransaction;
        let started = Instant::now();
        let mut bytes_in = 0u64;
        let mut bytes_out = 0u64;

        let result =
            self.run_phases(opcode, params, &mut data, timeout, txid, &mut bytes_in, &mut bytes_out);

        let outcome = match &result {
            Ok(resp) => rc::name(resp.code).to_string(),
            Err(e) => e.to_string(),
        };
        self.push_record(TransactionRecord {
            opcode,
            operation: opcodes::name(opcode),
            transaction_id: txid,
            bytes_in,
            bytes_out,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome,
        });

        match &result {
            Ok(_) => self.state = prev_state,
            // Wire-level failures poison the session; device errors leave
            // it usable.
            Err(LinkError::Transport(_)) | Err(LinkError::SessionLost(_)) => {
                self.state = SessionState::Lost;
            }
            Err(_) => self.state = prev_state,
        }
        result
    }

    fn run_phases(
        &mut self,
        opcode: u16,
        params: &[u32],
        data: &mut DataPhase<'_>,
        timeout: Duration,
        txid: u32,
        bytes_in: &mut u64,
        bytes_out: &mut u64,
    ) -> Result<Response, LinkError> {
        trace!(
            "tx {txid}: {} params {params:x?}",
            opcodes::name(opcode)
        );
        let cmd = Container::command(opcode, txid, params).encode();
        self.write_all(&cmd, timeout)?;
        *bytes_out += cmd.len() as u64;

        match data {
            DataPhase::None => {}
            DataPhase::Out { total, source } => {
                let sent = self.write_data_phase(opcode, txid, *total, source, timeout)?;
                *bytes_out += sent;
            }
            DataPhase::In(sink) => match self.read_data_phase(txid, sink, timeout)? {
                StreamOutcome::Data { bytes } => *bytes_in += bytes,
                StreamOutcome::Response(resp) => return Ok(resp),
            },
        }

        self.read_response(txid, timeout)
    }

    fn push_record(&mut self, record: TransactionRecord) {
        if self.ring.len() == RING_CAP {
            self.ring.pop_front();
        }
        self.ring.push_back(record);
    }

    fn write_all(&mut self, mut buf: &[u8], timeout: Duration) -> Result<(), LinkError> {
        while !buf.is_empty() {
            let n = self.pipes.write_bulk(buf, timeout)?;
            if n == 0 {
                return Err(LinkError::SessionLost("bulk write made no progress"));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// One bulk read for container framing, honouring a packet stashed by
    /// an earlier ZLP probe.
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if let Some(pending) = self.pending_packet.take() {
            let n = pending.len().min(buf.len());
            buf[..n].copy_from_slice(&pending[..n]);
            if n < pending.len() {
                self.pending_packet = Some(pending[n..].to_vec());
            }
            return Ok(n);
        }
        Ok(self.pipes.read_bulk(buf, timeout)?)
    }

    /// Reads one complete small container (command/response/event sized).
    fn read_container_buffered(&mut self, timeout: Duration) -> Result<Container, LinkError> {
        let mp = self.pipes.max_packet_size().max(CONTAINER_HEADER_LEN);
        let mut buf = vec![0u8; mp];
        let mut filled = 0;
        while filled < CONTAINER_HEADER_LEN {
            let n = self.read_chunk(&mut buf[filled..], timeout)?;
            if n == 0 {
                return Err(LinkError::SessionLost("empty read while awaiting container"));
            }
            filled += n;
        }
        let header = ContainerHeader::decode(&buf[..CONTAINER_HEADER_LEN])?;
        let total = header.length as usize;
        let mut whole = Vec::with_capacity(total);
        whole.extend_from_slice(&buf[..filled.min(total)]);
        while whole.len() < total {
            let want = (total - whole.len()).min(buf.len());
            let n = self.read_chunk(&mut buf[..want], timeout)?;
            if n == 0 {
                return Err(LinkError::SessionLost("container truncated on the wire"));
            }
            whole.extend_from_slice(&buf[..n]);
        }
        Ok(Container::decode(&whole[..total])?)
    }

    /// The effective per-read request size for IN data phases: a multiple
    /// of the packet size, bounded by the policy chunk (and the stall cap
    /// when flagged). Short-read devices never see a request larger than
    /// one packet.
    fn read_request_size(&self, mp: usize) -> usize {
        if self.policy.flags.needs_short_reads {
            return mp;
        }
        let mut req = self.policy.max_chunk_bytes as usize;
        if self.policy.flags.stall_on_large_reads {
            req = req.min(STALL_READ_CAP);
        }
        (req / mp).max(1) * mp
    }

    fn read_data_phase(
        &mut self,
        txid: u32,
        sink: &mut DataSink<'_>,
        timeout: Duration,
    ) -> Result<StreamOutcome, LinkError> {
        let mp = self.pipes.max_packet_size().max(CONTAINER_HEADER_LEN);
        let mut first = vec![0u8; mp];
        let mut filled = 0;
        while filled < CONTAINER_HEADER_LEN {
            let n = self.read_chunk(&mut first[filled..], timeout)?;
            if n == 0 {
                return Err(LinkError::SessionLost("empty read while awaiting data"));
            }
            filled += n;
        }
        let header = ContainerHeader::decode(&first[..CONTAINER_HEADER_LEN])?;

        match header.kind {
            ContainerKind::Data => {}
            ContainerKind::Response => {
                // The device skipped the data phase (usually an error
                // response); assemble it and hand it up.
                let total = header.length as usize;
                let mut whole = Vec::with_capacity(total);
                whole.extend_from_slice(&first[..filled.min(total)]);
                while whole.len() < total {
                    let want = (total - whole.len()).min(first.len());
                    let n = self.read_chunk(&mut first[..want], timeout)?;
                    if n == 0 {
                        return Err(LinkError::SessionLost("response truncated on the wire"));
                    }
                    whole.extend_from_slice(&first[..n]);
                }
                let container = Container::decode(&whole[..total])?;
                return self
                    .accept_response(container, txid, timeout)
                    .map(StreamOutcome::Response);
            }
            _ => return Err(LinkError::SessionLost("unexpected container in data phase")),
        }
        if header.transaction_id != txid {
            self.mismatch_strikes += 1;
            return Err(LinkError::SessionLost("data container for wrong transaction"));
        }

        let total_payload = header.payload_len();
        let mut delivered = 0usize;
        let lead = (filled - CONTAINER_HEADER_LEN).min(total_payload);
        if lead > 0 {
            sink(&first[CONTAINER_HEADER_LEN..CONTAINER_HEADER_LEN + lead])?;
            delivered += lead;
        }

        let req = self.read_request_size(mp);
        let mut scratch = vec![0u8; req];
        while delivered < total_payload {
            let remaining = total_payload - delivered;
            let want = if remaining >= mp {
                ((remaining.min(req)) / mp) * mp
            } else {
                remaining
            };
            let n = self.read_chunk(&mut scratch[..want], timeout)?;
            if n == 0 {
                return Err(LinkError::SessionLost("data phase ended early"));
            }
            sink(&scratch[..n])?;
            delivered += n;
        }

        // A packet-aligned stream is terminated by a ZLP. Some devices skip
        // it and go straight to the response; stash whatever arrives.
        if (CONTAINER_HEADER_LEN + total_payload) % mp == 0 {
            match self.pipes.read_bulk(&mut scratch[..mp], ZLP_TIMEOUT) {
                Ok(0) => trace!("consumed trailing ZLP"),
                Ok(n) => {
                    trace!("no ZLP; stashing {n} bytes of the next container");
                    self.pending_packet = Some(scratch[..n].to_vec());
                }
                Err(TransportError::Timeout(_)) => trace!("no ZLP within {ZLP_TIMEOUT:?}"),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(StreamOutcome::Data {
            bytes: delivered as u64,
        })
    }

    fn write_data_phase(
        &mut self,
        opcode: u16,
        txid: u32,
        total: u64,
        source: &mut DataSource<'_>,
        timeout: Duration,
    ) -> Result<u64, LinkError> {
        let mp = self.pipes.max_packet_size().max(CONTAINER_HEADER_LEN);
        let chunk = (self.policy.max_chunk_bytes as usize).max(mp);

        // Header and first chunk go out together; a lone 12-byte packet
        // makes some devices abort the data phase.
        let first_take = (total as usize).min(chunk);
        let mut first = Vec::with_capacity(CONTAINER_HEADER_LEN + first_take);
        first.extend_from_slice(&Container::encode_header(
            ContainerKind::Data,
            opcode,
            txid,
            total as usize,
        ));
        let mut sent = 0u64;
        if first_take > 0 {
            first.resize(CONTAINER_HEADER_LEN + first_take, 0);
            let n = source(&mut first[CONTAINER_HEADER_LEN..])?;
            if n == 0 {
                return Err(LinkError::Handler("data source produced nothing".into()));
            }
            first.truncate(CONTAINER_HEADER_LEN + n);
            sent += n as u64;
        }
        self.write_all(&first, timeout)?;

        let mut scratch = vec![0u8; chunk];
        while sent < total {
            let want = ((total - sent) as usize).min(chunk);
            let n = source(&mut scratch[..want])?;
            if n == 0 {
                return Err(LinkError::Handler("data source ended early".into()));
            }
            self.write_all(&scratch[..n], timeout)?;
            sent += n as u64;
        }

        if (CONTAINER_HEADER_LEN as u64 + total) % (mp as u64) == 0 {
            trace!("emitting trailing ZLP");
            self.pipes.write_bulk(&[], timeout)?;
        }
        Ok(CONTAINER_HEADER_LEN as u64 + sent)
    }

    fn read_response(&mut self, txid: u32, timeout: Duration) -> Result<Response, LinkError> {
        loop {
            let container = self.read_container_buffered(timeout)?;
            match container.kind {
                ContainerKind::Response => {
                    return self.accept_response(container, txid, timeout);
                }
                ContainerKind::Event => {
                    // Some devices interleave events on the bulk pipe.
                    trace!("event {:#06x} on bulk pipe, ignoring", container.code);
                }
                _ => {
                    self.strike("unexpected container while awaiting response")?;
                }
            }
        }
    }

    /// Validates a response's transaction id, applying the out-of-order
    /// discard rule: mismatches are dropped, and three in a row lose the
    /// link.
    fn accept_response(
        &mut self,
        container: Container,
        txid: u32,
        timeout: Duration,
    ) -> Result<Response, LinkError> {
        let mut container = container;
        loop {
            if container.transaction_id == txid {
                self.mismatch_strikes = 0;
                return Ok(Response {
                    code: container.code,
                    params: container.params(),
                });
            }
            warn!(
                "discarding out-of-order response: txid {} != current {}",
                container.transaction_id, txid
            );
            self.strike("out-of-order response")?;
            // Try the next container on the pipe.
            loop {
                let next = self.read_container_buffered(timeout)?;
                match next.kind {
                    ContainerKind::Response => {
                        container = next;
                        break;
                    }
                    ContainerKind::Event => continue,
                    _ => self.strike("unexpected container while resyncing")?,
                }
            }
        }
    }

    fn strike(&mut self, why: &'static str) -> Result<(), LinkError> {
        self.mismatch_strikes += 1;
        if self.mismatch_strikes >= MISMATCH_LIMIT {
            self.state = SessionState::Lost;
            return Err(LinkError::SessionLost(why));
        }
        Ok(())
    }
}
