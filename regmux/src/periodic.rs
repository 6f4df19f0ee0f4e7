//! Periodic-I/O: register programs that re-execute at a fixed period.
//!
//! A periodic registration shares the transaction's entry-list semantics but
//! is driven by a per-period timer instead of a trigger condition. Timers use
//! delayed-tick semantics, so consecutive executions of one registration are
//! never closer together than the configured period. Responses may be
//! accumulated and emitted once per `batch_size` executions.

use crate::event::{EventId, EVENT_ID_NONE};
use crate::io_entry::{IoEntry, TransactionResponse};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Identifier of a periodic registration within one client.
pub type PeriodicIoId = i64;

/// User-facing description of a periodic registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeriodicIoInfo {
    /// Assigned by the runtime at submit.
    pub id: PeriodicIoId,
    /// Execution period in nanoseconds; must be non-zero.
    pub period_ns: u64,
    /// Emit the success event once per this many executions (minimum 1).
    pub batch_size: u32,
    /// The ordered register program run on every tick.
    pub entries: Vec<IoEntry>,
    /// Event emitted with the batched responses ([`EVENT_ID_NONE`] to skip).
    pub emit_success_event_id: EventId,
    /// Event emitted with the failing response.
    pub emit_error_event_id: EventId,
}

impl PeriodicIoInfo {
    pub fn new(period: Duration, entries: Vec<IoEntry>) -> Self {
        Self {
            id: 0,
            period_ns: period.as_nanos() as u64,
            batch_size: 1,
            entries,
            emit_success_event_id: EVENT_ID_NONE,
            emit_error_event_id: EVENT_ID_NONE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_success_event(mut self, event_id: EventId) -> Self {
        self.emit_success_event_id = event_id;
        self
    }

    pub fn with_error_event(mut self, event_id: EventId) -> Self {
        self.emit_error_event_id = event_id;
        self
    }
}

/// Encodes a batch of responses as one event payload: a count followed by
/// each encoded response, length-prefixed.
pub fn encode_batch(responses: &[TransactionResponse]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(responses.len() as u32).to_le_bytes());
    for resp in responses {
        let encoded = resp.encode();
        out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        out.extend_from_slice(&encoded);
    }
    out
}

/// Decodes a batch payload back into responses.
pub fn decode_batch(buf: &[u8]) -> crate::error::Result<Vec<TransactionResponse>> {
    let mut rest = buf;
    let count = take_u32(&mut rest)? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let len = take_u32(&mut rest)? as usize;
        out.push(TransactionResponse::decode(take_slice(&mut rest, len)?)?);
    }
    Ok(out)
}

fn take_slice<'a>(rest: &mut &'a [u8], len: usize) -> crate::error::Result<&'a [u8]> {
    if rest.len() < len {
        return Err(crate::error::Error::InvalidArg(
            "truncated batch payload".into(),
        ));
    }
    let (head, tail) = rest.split_at(len);
    *rest = tail;
    Ok(head)
}

fn take_u32(rest: &mut &[u8]) -> crate::error::Result<u32> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(take_slice(rest, 4)?);
    Ok(u32::from_le_bytes(raw))
}

/// Runtime-internal record of one periodic registration.
pub(crate) struct PeriodicEntry {
    pub info: PeriodicIoInfo,
    /// Shared with every queued tick so cancellation does not race execution.
    pub entries: Arc<Vec<IoEntry>>,
    /// Responses accumulated toward the current batch.
    pub pending_results: Vec<TransactionResponse>,
    pub active: bool,
}

/// One timer task keyed by period.
pub(crate) struct PeriodicTimer {
    pub cancel: CancellationToken,
    /// Number of registrations sharing this period.
    pub members: usize,
}

/// Per-client periodic scheduling state.
#[derive(Default)]
pub(crate) struct PeriodicState {
    pub counter: i64,
    pub entries: HashMap<PeriodicIoId, PeriodicEntry>,
    pub timers: HashMap<u64, PeriodicTimer>,
    /// Registrations whose tick is waiting to run, in submission order.
    pub run_queue: VecDeque<PeriodicIoId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_encoding_round_trips() {
        let mut a = TransactionResponse::new(1);
        a.push_value(0x10, 0xAA, 32);
        let mut b = TransactionResponse::new(2);
        b.error_code = -16;

        let payload = encode_batch(&[a.clone(), b.clone()]);
        let decoded = decode_batch(&payload).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn decode_batch_rejects_truncation() {
        let payload = encode_batch(&[TransactionResponse::new(1)]);
        assert!(decode_batch(&payload[..payload.len() - 2]).is_err());
    }

    #[test]
    fn info_builder_defaults() {
        let info = PeriodicIoInfo::new(Duration::from_millis(5), vec![]);
        assert_eq!(info.period_ns, 5_000_000);
        assert_eq!(info.batch_size, 1);
        assert_eq!(info.emit_success_event_id, EVENT_ID_NONE);
    }
}
