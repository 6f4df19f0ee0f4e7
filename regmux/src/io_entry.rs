//! Typed register-access instructions and their results.
//!
//! An io-entry is one instruction in an ordered register program. Programs are
//! submitted through transactions, periodic-I/O registrations, or the
//! synchronous `RegIo` command, and are executed by
//! [`executor::run_program`](crate::executor::run_program) against a device's
//! [`RegisterIo`](crate::device::RegisterIo) capability.
//!
//! Read results are mirrored back to the submitter through a
//! [`TransactionResponse`], which doubles as the binary payload of completion
//! events.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A single typed register-access instruction.
///
/// Offsets and values are at most 64 bits wide; the device's native value
/// bitwidth decides how many of those bits a non-batch access moves. Batch
/// buffers are owned by the runtime-side copy of the program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoEntry {
    /// Read the register at `offset`; the value lands in the response mirror.
    Read { offset: u64 },
    /// Write `value` to the register at `offset`.
    Write { offset: u64, value: u64 },
    /// Read-modify-write: `v <- (v & !mask) | (value & mask)`.
    ///
    /// Atomic only to the extent the underlying register access is; the
    /// runtime performs the read and write as two accesses.
    Modify { offset: u64, mask: u64, value: u64 },
    /// Read `size` bytes starting at `offset` into the response mirror.
    ReadBatch { offset: u64, size: usize },
    /// Write the given bytes starting at `offset`.
    WriteBatch { offset: u64, bytes: Vec<u8> },
    /// Re-read `offset` until `(v & mask) == (value & mask)` or the deadline
    /// passes, failing with `Timeout`.
    Poll {
        offset: u64,
        mask: u64,
        value: u64,
        timeout_ms: u64,
    },
    /// Read once and fail with `InvalidState` unless
    /// `(v & mask) == (expected & mask)`.
    ReadAssert {
        offset: u64,
        mask: u64,
        expected: u64,
    },
}

impl IoEntry {
    /// Whether this entry produces data in the response mirror.
    pub fn is_read(&self) -> bool {
        matches!(self, IoEntry::Read { .. } | IoEntry::ReadBatch { .. })
    }
}

/// Per-result header bytes in the encoded response (offset + length).
const RESULT_HEADER_LEN: usize = 8 + 4;

/// Fixed header bytes in the encoded response.
const RESPONSE_HEADER_LEN: usize = 8 + 4 + 4 + 4;

/// Computes the response-mirror size a program will need, with every step
/// checked against overflow. Caller-supplied batch sizes are untrusted, so a
/// saturating computation is not enough: an overflow is a submit error.
pub fn response_size(entries: &[IoEntry], native_value_bitwidth: u32) -> Result<usize> {
    let value_width = (native_value_bitwidth / 8) as usize;
    let mut total = RESPONSE_HEADER_LEN;
    for entry in entries {
        let result_len = match entry {
            IoEntry::Read { .. } => value_width,
            IoEntry::ReadBatch { size, .. } => *size,
            _ => continue,
        };
        total = total
            .checked_add(RESULT_HEADER_LEN)
            .and_then(|t| t.checked_add(result_len))
            .ok_or(Error::Overflow)?;
    }
    Ok(total)
}

/// Validates and deep-copies a caller-supplied program.
///
/// The count-times-size computation is overflow-checked before any copy is
/// made, and batch entries are bounds-checked.
pub fn copy_entries(entries: &[IoEntry]) -> Result<Vec<IoEntry>> {
    entries
        .len()
        .checked_mul(std::mem::size_of::<IoEntry>())
        .ok_or(Error::Overflow)?;
    for entry in entries {
        if let IoEntry::ReadBatch { size, offset } = entry {
            offset.checked_add(*size as u64).ok_or(Error::Overflow)?;
            if *size == 0 {
                return Err(Error::InvalidArg("zero-length batch read".into()));
            }
        }
        if let IoEntry::WriteBatch { bytes, offset } = entry {
            offset
                .checked_add(bytes.len() as u64)
                .ok_or(Error::Overflow)?;
            if bytes.is_empty() {
                return Err(Error::InvalidArg("zero-length batch write".into()));
            }
        }
    }
    Ok(entries.to_vec())
}

/// One read result inside a response mirror.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoResult {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// The response mirror for one program run.
///
/// `completion_index` is the index of the last entry that completed
/// successfully (-1 when none did); `error_code` is 0 on success, the
/// cancellation code, or a negative device error. The encoded form is the
/// payload of completion events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub id: i64,
    pub error_code: i32,
    pub completion_index: i32,
    pub results: Vec<IoResult>,
}

impl TransactionResponse {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            error_code: 0,
            completion_index: -1,
            results: Vec::new(),
        }
    }

    /// Appends a single-register read result, truncated to the native width.
    pub(crate) fn push_value(&mut self, offset: u64, value: u64, native_value_bitwidth: u32) {
        let width = (native_value_bitwidth / 8) as usize;
        self.results.push(IoResult {
            offset,
            bytes: value.to_le_bytes()[..width.min(8)].to_vec(),
        });
    }

    /// Appends a batch read result.
    pub(crate) fn push_bytes(&mut self, offset: u64, bytes: Vec<u8>) {
        self.results.push(IoResult { offset, bytes });
    }

    /// Reads a single result back as a little-endian value. Test and tooling
    /// convenience for responses produced by `Read` entries.
    pub fn value_at(&self, index: usize) -> Option<u64> {
        let result = self.results.get(index)?;
        let mut raw = [0u8; 8];
        let len = result.bytes.len().min(8);
        raw[..len].copy_from_slice(&result.bytes[..len]);
        Some(u64::from_le_bytes(raw))
    }

    pub fn encoded_len(&self) -> usize {
        RESPONSE_HEADER_LEN
            + self
                .results
                .iter()
                .map(|r| RESULT_HEADER_LEN + r.bytes.len())
                .sum::<usize>()
    }

    /// Little-endian binary encoding used as the event payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.error_code.to_le_bytes());
        out.extend_from_slice(&self.completion_index.to_le_bytes());
        out.extend_from_slice(&(self.results.len() as u32).to_le_bytes());
        for result in &self.results {
            out.extend_from_slice(&result.offset.to_le_bytes());
            out.extend_from_slice(&(result.bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&result.bytes);
        }
        out
    }

    /// Decodes an event payload back into a response mirror.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let id = i64::from_le_bytes(cursor.take()?);
        let error_code = i32::from_le_bytes(cursor.take()?);
        let completion_index = i32::from_le_bytes(cursor.take()?);
        let count = u32::from_le_bytes(cursor.take()?) as usize;
        let mut results = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let offset = u64::from_le_bytes(cursor.take()?);
            let len = u32::from_le_bytes(cursor.take()?) as usize;
            results.push(IoResult {
                offset,
                bytes: cursor.take_slice(len)?.to_vec(),
            });
        }
        Ok(Self {
            id,
            error_code,
            completion_index,
            results,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < len {
            return Err(Error::InvalidArg("truncated response payload".into()));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_size_counts_read_entries_only() {
        let entries = vec![
            IoEntry::Read { offset: 0 },
            IoEntry::Write {
                offset: 4,
                value: 1,
            },
            IoEntry::ReadBatch {
                offset: 0x100,
                size: 32,
            },
        ];
        let size = response_size(&entries, 32).unwrap();
        assert_eq!(size, RESPONSE_HEADER_LEN + (RESULT_HEADER_LEN + 4) + (RESULT_HEADER_LEN + 32));
    }

    #[test]
    fn response_size_rejects_overflowing_batch() {
        let entries = vec![
            IoEntry::ReadBatch {
                offset: 0,
                size: usize::MAX,
            },
            IoEntry::ReadBatch {
                offset: 0,
                size: usize::MAX,
            },
        ];
        assert_eq!(response_size(&entries, 32), Err(Error::Overflow));
    }

    #[test]
    fn copy_entries_rejects_degenerate_batches() {
        assert!(matches!(
            copy_entries(&[IoEntry::ReadBatch { offset: 0, size: 0 }]),
            Err(Error::InvalidArg(_))
        ));
        assert_eq!(
            copy_entries(&[IoEntry::ReadBatch {
                offset: u64::MAX,
                size: 2,
            }]),
            Err(Error::Overflow)
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut resp = TransactionResponse::new(42);
        resp.error_code = -22;
        resp.completion_index = 1;
        resp.push_value(0x100, 0xDEAD_BEEF, 32);
        resp.push_bytes(0x200, vec![1, 2, 3, 4, 5]);

        let encoded = resp.encode();
        assert_eq!(encoded.len(), resp.encoded_len());

        let decoded = TransactionResponse::decode(&encoded).unwrap();
        assert_eq!(decoded, resp);
        assert_eq!(decoded.value_at(0), Some(0xDEAD_BEEF));
    }

    #[test]
    fn decode_rejects_truncation() {
        let resp = TransactionResponse::new(1);
        let encoded = resp.encode();
        assert!(TransactionResponse::decode(&encoded[..encoded.len() - 1]).is_err());
    }
}
