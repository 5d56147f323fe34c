//! PTP container framing.

use crate::{Reader, WireError, Writer};

/// Size of the container header: `{len u32, type u16, code u16, txid u32}`.
pub const CONTAINER_HEADER_LEN: usize = 12;

/// The four container types carried on the bulk and interrupt pipes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ContainerKind {
    Command = 1,
    Data = 2,
    Response = 3,
    Event = 4,
}

impl ContainerKind {
    pub fn from_u16(v: u16) -> Result<Self, WireError> {
        match v {
            1 => Ok(ContainerKind::Command),
            2 => Ok(ContainerKind::Data),
            3 => Ok(ContainerKind::Response),
            4 => Ok(ContainerKind::Event),
            other => Err(WireError::UnknownContainerKind(other)),
        }
    }
}

/// The decoded fixed-size header of a container.
///
/// `length` is the total container length including these 12 bytes, so the
/// payload that follows is `length - 12` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerHeader {
    pub length: u32,
    pub kind: ContainerKind,
    pub code: u16,
    pub transaction_id: u32,
}

impl ContainerHeader {
    /// Decodes a header from the first 12 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let (length, kind, code, transaction_id) = (|| {
            Some((r.u32()?, r.u16()?, r.u16()?, r.u32()?))
        })()
        .ok_or(WireError::Truncated {
            needed: CONTAINER_HEADER_LEN,
            have: buf.len(),
        })?;
        if (length as usize) < CONTAINER_HEADER_LEN {
            return Err(WireError::BadLength(length));
        }
        Ok(ContainerHeader {
            length,
            kind: ContainerKind::from_u16(kind)?,
            code,
            transaction_id,
        })
    }

    /// The payload length this header announces.
    pub fn payload_len(&self) -> usize {
        self.length as usize - CONTAINER_HEADER_LEN
    }
}

/// A complete container: header fields plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub kind: ContainerKind,
    pub code: u16,
    pub transaction_id: u32,
    pub payload: Vec<u8>,
}

impl Container {
    /// Builds a command container; `params` become the payload as u32s.
    pub fn command(code: u16, transaction_id: u32, params: &[u32]) -> Self {
        Container {
            kind: ContainerKind::Command,
            code,
            transaction_id,
            payload: params_payload(params),
        }
    }

    /// Builds a response container with up to 5 u32 parameters.
    pub fn response(code: u16, transaction_id: u32, params: &[u32]) -> Self {
        Container {
            kind: ContainerKind::Response,
            code,
            transaction_id,
            payload: params_payload(params),
        }
    }

    /// Builds a data container carrying `payload`.
    pub fn data(code: u16, transaction_id: u32, payload: Vec<u8>) -> Self {
        Container {
            kind: ContainerKind::Data,
            code,
            transaction_id,
            payload,
        }
    }

    /// Builds an event container; events are response-shaped.
    pub fn event(code: u16, transaction_id: u32, params: &[u32]) -> Self {
        Container {
            kind: ContainerKind::Event,
            code,
            transaction_id,
            payload: params_payload(params),
        }
    }

    /// Encodes just the 12-byte header for a container whose payload is
    /// `payload_len` bytes. Used when a data phase is streamed and the
    /// payload never exists contiguously in memory.
    pub fn encode_header(
        kind: ContainerKind,
        code: u16,
        transaction_id: u32,
        payload_len: usize,
    ) -> [u8; CONTAINER_HEADER_LEN] {
        let mut out = [0u8; CONTAINER_HEADER_LEN];
        out[0..4].copy_from_slice(&((CONTAINER_HEADER_LEN + payload_len) as u32).to_le_bytes());
        out[4..6].copy_from_slice(&(kind as u16).to_le_bytes());
        out[6..8].copy_from_slice(&code.to_le_bytes());
        out[8..12].copy_from_slice(&transaction_id.to_le_bytes());
        out
    }

    /// Encodes the whole container to a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONTAINER_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&Self::encode_header(
            self.kind,
            self.code,
            self.transaction_id,
            self.payload.len(),
        ));
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes a complete container from `buf`. The buffer must contain the
    /// whole frame; a length field that disagrees with the buffer is an
    /// error, not a short read.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let header = ContainerHeader::decode(buf)?;
        let total = header.length as usize;
        if buf.len() < total {
            return Err(WireError::Truncated {
                needed: total,
                have: buf.len(),
            });
        }
        Ok(Container {
            kind: header.kind,
            code: header.code,
            transaction_id: header.transaction_id,
            payload: buf[CONTAINER_HEADER_LEN..total].to_vec(),
        })
    }

    /// Interprets the payload as u32 parameters (response and event
    /// containers). Trailing bytes that do not fill a u32 are ignored.
    pub fn params(&self) -> Vec<u32> {
        let mut r = Reader::new(&self.payload);
        let mut out = Vec::with_capacity(self.payload.len() / 4);
        while let Some(v) = r.u32() {
            out.push(v);
        }
        out
    }

    /// The n-th u32 parameter, if present.
    pub fn param(&self, n: usize) -> Option<u32> {
        let mut r = Reader::new(&self.payload);
        r.skip(n * 4)?;
        r.u32()
    }
}

fn params_payload(params: &[u32]) -> Vec<u8> {
    let mut w = Writer::with_capacity(params.len() * 4);
    for &p in params {
        w.put_u32(p);
    }
    w.into_vec()
}
