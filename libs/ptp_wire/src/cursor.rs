//! Little-endian cursor codecs over byte slices.

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

/// The longest encodable PTP string: 254 UTF-16 units plus the terminator
/// (the unit count must fit in one byte).
const MAX_STRING_UNITS: usize = 254;

/// A forward-only reader over a byte slice.
///
/// Every accessor returns `None` once the underlying slice is exhausted;
/// none of them panic on truncated input.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// The number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Takes the next `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(LittleEndian::read_u16)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(LittleEndian::read_u32)
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.bytes(8).map(LittleEndian::read_u64)
    }

    pub fn u128(&mut self) -> Option<u128> {
        self.bytes(16).map(LittleEndian::read_u128)
    }

    /// Reads a PTP string: one count byte (UTF-16 units including the NUL
    /// terminator), then that many little-endian UTF-16 units. A count of
    /// zero is the empty string. Unpaired surrogates decode to U+FFFD.
    pub fn string(&mut self) -> Option<String> {
        let units = self.u8()? as usize;
        if units == 0 {
            return Some(String::new());
        }
        let raw = self.bytes(units * 2)?;
        let mut code_units: Vec<u16> = (0..units)
            .map(|i| LittleEndian::read_u16(&raw[i * 2..]))
            .collect();
        // The last unit is the terminator; tolerate devices that omit it
        // and instead pack a final real character.
        if code_units.last() == Some(&0) {
            code_units.pop();
        }
        Some(
            char::decode_utf16(code_units)
                .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        )
    }

    /// Reads a count-prefixed array of u16 values (u32 count, then elements).
    pub fn array_u16(&mut self) -> Option<Vec<u16>> {
        let count = self.u32()? as usize;
        if self.remaining() < count * 2 {
            return None;
        }
        (0..count).map(|_| self.u16()).collect()
    }

    /// Reads a count-prefixed array of u32 values (u32 count, then elements).
    pub fn array_u32(&mut self) -> Option<Vec<u32>> {
        let count = self.u32()? as usize;
        if self.remaining() < count * 4 {
            return None;
        }
        (0..count).map(|_| self.u32()).collect()
    }
}

/// An append-only little-endian writer.
#[derive(Clone, Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Writer {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u128(&mut self, v: u128) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes a PTP string. An empty string encodes as a single zero byte.
    /// Strings longer than 254 UTF-16 units are truncated to fit the
    /// one-byte unit count.
    pub fn put_string(&mut self, s: &str) {
        if s.is_empty() {
            self.buf.push(0);
            return;
        }
        let mut units: Vec<u16> = s.encode_utf16().collect();
        if units.len() > MAX_STRING_UNITS {
            warn!(
                "truncating {}-unit string to {} units for PTP encoding",
                units.len(),
                MAX_STRING_UNITS
            );
            units.truncate(MAX_STRING_UNITS);
            // Avoid splitting a surrogate pair at the cut point.
            if let Some(&last) = units.last() {
                if (0xD800..0xDC00).contains(&last) {
                    units.pop();
                }
            }
        }
        self.buf.push((units.len() + 1) as u8);
        for unit in units {
            self.buf.extend_from_slice(&unit.to_le_bytes());
        }
        self.buf.extend_from_slice(&0u16.to_le_bytes());
    }

    /// Writes a count-prefixed array of u16 values.
    pub fn put_array_u16(&mut self, values: &[u16]) {
        self.put_u32(values.len() as u32);
        for &v in values {
            self.put_u16(v);
        }
    }

    /// Writes a count-prefixed array of u32 values.
    pub fn put_array_u32(&mut self, values: &[u32]) {
        self.put_u32(values.len() as u32);
        for &v in values {
            self.put_u32(v);
        }
    }
}
