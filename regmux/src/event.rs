//! Event state and per-client event queues.
//!
//! Devices keep one event-state table mapping event ids to
//! `(enable_counter, event_counter)`; emission bumps the event counter and
//! fans a record out to every attached client whose control flags select the
//! event. Clients keep two queues: the error queue has strict dispatch
//! priority over the normal queue within one dequeue call.

use crate::error::{Error, Result};
use crate::sync::lock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::warn;

/// Identifier of an event within one device's id space.
pub type EventId = i64;

/// Sentinel for "no event configured".
pub const EVENT_ID_NONE: EventId = -1;

/// Well-known event emitted when an external fault handler reports a memory
/// page fault on the owning device.
pub const EVENT_ID_MEMORY_PAGE_FAULT: EventId = 0x4000_0000_0000_0001;

/// Deliver matching events to the client's normal queue.
pub const EVENT_FLAG_QUEUE: u32 = 1 << 0;
/// Deliver matching events to the client's error queue (wins over normal).
pub const EVENT_FLAG_ERROR_QUEUE: u32 = 1 << 1;
/// Request wakeup-only notification without queueing a record.
pub const EVENT_FLAG_IRQ_NOTIFY: u32 = 1 << 2;

/// Per-(device, event) state: how many clients enable it, and the
/// strictly-increasing emission counter.
#[derive(Clone, Debug, Default)]
pub struct DeviceEventState {
    pub enable_counter: i64,
    pub event_counter: i64,
}

/// One entry of an `EventControlSet` request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventControl {
    pub event_id: EventId,
    pub flags: u32,
}

/// A delivered event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub counter: i64,
    pub timestamp_ns: i64,
    pub payload: Vec<u8>,
}

/// Result of a dequeue attempt against a caller-sized payload buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DequeueOutcome {
    /// The front event fit and was popped.
    Event(EventRecord),
    /// The front event's payload exceeds the caller's capacity; the event
    /// stays queued and the caller retries with at least `required` bytes.
    NeedLargerBuffer { required: usize },
}

/// Payload of the [`EVENT_ID_MEMORY_PAGE_FAULT`] event.
pub fn encode_page_fault(fault_address: u64, fault_flags: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&fault_address.to_le_bytes());
    out.extend_from_slice(&fault_flags.to_le_bytes());
    out
}

/// Per-client event state: control flags plus the two delivery queues.
#[derive(Debug, Default)]
pub(crate) struct ClientEventQueues {
    controls: HashMap<EventId, u32>,
    queue: VecDeque<EventRecord>,
    error_queue: VecDeque<EventRecord>,
    warn_depth: usize,
}

impl ClientEventQueues {
    pub fn new(warn_depth: usize) -> Self {
        Self {
            warn_depth,
            ..Self::default()
        }
    }

    pub fn flags(&self, event_id: EventId) -> u32 {
        self.controls.get(&event_id).copied().unwrap_or(0)
    }

    /// Updates flags for one event, returning the previous value.
    pub fn set_flags(&mut self, event_id: EventId, flags: u32) -> u32 {
        if flags == 0 {
            self.controls.remove(&event_id).unwrap_or(0)
        } else {
            self.controls.insert(event_id, flags).unwrap_or(0)
        }
    }

    /// Drains all controls, returning the event ids that had non-zero flags.
    pub fn clear_controls(&mut self) -> Vec<EventId> {
        self.controls.drain().map(|(id, _)| id).collect()
    }

    pub fn push(&mut self, record: EventRecord, to_error_queue: bool) {
        let queue = if to_error_queue {
            &mut self.error_queue
        } else {
            &mut self.queue
        };
        queue.push_back(record);
        if queue.len() == self.warn_depth && self.warn_depth > 0 {
            warn!(
                depth = self.warn_depth,
                error_queue = to_error_queue,
                "event queue backing up, client is not dequeuing"
            );
        }
    }

    /// Pops the front event, error queue first. An undersized payload buffer
    /// reports the required size without popping so the caller can retry.
    pub fn dequeue(&mut self, payload_capacity: usize) -> Result<DequeueOutcome> {
        let queue = if !self.error_queue.is_empty() {
            &mut self.error_queue
        } else if !self.queue.is_empty() {
            &mut self.queue
        } else {
            return Err(Error::NotFound);
        };

        let front_len = queue.front().map(|r| r.payload.len()).unwrap_or(0);
        if front_len > payload_capacity {
            return Ok(DequeueOutcome::NeedLargerBuffer {
                required: front_len,
            });
        }
        let record = queue.pop_front().ok_or(Error::NotFound)?;
        Ok(DequeueOutcome::Event(record))
    }

    pub fn clear_queues(&mut self) {
        self.queue.clear();
        self.error_queue.clear();
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len() + self.error_queue.len()
    }
}

/// Device-side event-state table.
#[derive(Debug, Default)]
pub(crate) struct DeviceEventTable {
    states: Mutex<HashMap<EventId, DeviceEventState>>,
}

impl DeviceEventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current emission counter for an event, 0 if never emitted.
    pub fn event_counter(&self, event_id: EventId) -> i64 {
        lock(&self.states)
            .get(&event_id)
            .map(|s| s.event_counter)
            .unwrap_or(0)
    }

    pub fn enable_counter(&self, event_id: EventId) -> i64 {
        lock(&self.states)
            .get(&event_id)
            .map(|s| s.enable_counter)
            .unwrap_or(0)
    }

    /// Accepts one emission: bumps the counter by exactly one and returns
    /// its new value.
    pub fn accept_emission(&self, event_id: EventId) -> i64 {
        let mut states = lock(&self.states);
        let state = states.entry(event_id).or_default();
        state.event_counter += 1;
        state.event_counter
    }

    /// Adjusts the enable counter, reporting a 0 <-> non-zero transition as
    /// `Some(enabled)` so the device can run its event-enable hook.
    pub fn adjust_enable(&self, event_id: EventId, delta: i64) -> Option<bool> {
        let mut states = lock(&self.states);
        let state = states.entry(event_id).or_default();
        let before = state.enable_counter;
        state.enable_counter = (state.enable_counter + delta).max(0);
        match (before, state.enable_counter) {
            (0, after) if after > 0 => Some(true),
            (before, 0) if before > 0 => Some(false),
            _ => None,
        }
    }

    /// Drops counters for events no longer enabled by any client. Called on
    /// the last device disable.
    pub fn clear_disabled(&self) {
        lock(&self.states).retain(|_, state| state.enable_counter > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(event_id: EventId, counter: i64, payload_len: usize) -> EventRecord {
        EventRecord {
            event_id,
            counter,
            timestamp_ns: 0,
            payload: vec![0xAB; payload_len],
        }
    }

    #[test]
    fn error_queue_dispatches_first() {
        let mut queues = ClientEventQueues::new(0);
        queues.push(record(1, 1, 0), false);
        queues.push(record(2, 1, 0), true);

        match queues.dequeue(64).unwrap() {
            DequeueOutcome::Event(r) => assert_eq!(r.event_id, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
        match queues.dequeue(64).unwrap() {
            DequeueOutcome::Event(r) => assert_eq!(r.event_id, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(queues.dequeue(64), Err(Error::NotFound));
    }

    #[test]
    fn undersized_buffer_reports_size_without_popping() {
        let mut queues = ClientEventQueues::new(0);
        queues.push(record(7, 1, 1024), false);

        assert_eq!(
            queues.dequeue(256).unwrap(),
            DequeueOutcome::NeedLargerBuffer { required: 1024 }
        );
        // Retry with enough capacity pops the same event.
        match queues.dequeue(1024).unwrap() {
            DequeueOutcome::Event(r) => {
                assert_eq!(r.event_id, 7);
                assert_eq!(r.payload.len(), 1024);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn set_flags_returns_previous_value() {
        let mut queues = ClientEventQueues::new(0);
        assert_eq!(queues.set_flags(5, EVENT_FLAG_QUEUE), 0);
        assert_eq!(queues.set_flags(5, 0), EVENT_FLAG_QUEUE);
        assert_eq!(queues.flags(5), 0);
    }

    #[test]
    fn emission_counter_increments_by_one() {
        let table = DeviceEventTable::new();
        assert_eq!(table.event_counter(9), 0);
        assert_eq!(table.accept_emission(9), 1);
        assert_eq!(table.accept_emission(9), 2);
        assert_eq!(table.event_counter(9), 2);
    }

    #[test]
    fn enable_transitions_are_reported_once() {
        let table = DeviceEventTable::new();
        assert_eq!(table.adjust_enable(3, 1), Some(true));
        assert_eq!(table.adjust_enable(3, 1), None);
        assert_eq!(table.adjust_enable(3, -1), None);
        assert_eq!(table.adjust_enable(3, -1), Some(false));
    }

    #[test]
    fn clear_disabled_keeps_enabled_counters() {
        let table = DeviceEventTable::new();
        table.accept_emission(1);
        table.accept_emission(2);
        table.adjust_enable(2, 1);
        table.clear_disabled();
        assert_eq!(table.event_counter(1), 0);
        assert_eq!(table.event_counter(2), 1);
    }
}
