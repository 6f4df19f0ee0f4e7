//! In-memory register device used by tests and the developer CLI.
//!
//! `TestRegisterIo` models a byte-addressable sparse register space. An
//! optional per-access delay and a shared access recorder make it suitable
//! for exercising bus arbitration: with a delay configured, overlapping
//! executor runs against two devices would produce overlapping access spans,
//! which the recorder can detect.

use crate::device::{DeviceOps, RegisterIo};
use crate::error::Result;
use crate::event::EventId;
use crate::sync::lock;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One recorded register access, with the wall-clock span it occupied.
#[derive(Clone, Debug)]
pub struct AccessSpan {
    pub label: String,
    pub start: Instant,
    pub end: Instant,
}

/// Shared recorder collecting access spans across devices.
#[derive(Clone, Default)]
pub struct AccessRecorder {
    spans: Arc<Mutex<Vec<AccessSpan>>>,
}

impl AccessRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<AccessSpan> {
        lock(&self.spans).clone()
    }

    /// Whether any two spans from differently-labeled devices overlap in
    /// time. Used to assert bus serialization.
    pub fn has_cross_device_overlap(&self) -> bool {
        let spans = lock(&self.spans);
        for (i, a) in spans.iter().enumerate() {
            for b in spans.iter().skip(i + 1) {
                if a.label != b.label && a.start < b.end && b.start < a.end {
                    return true;
                }
            }
        }
        false
    }

    fn record(&self, label: &str, start: Instant) {
        lock(&self.spans).push(AccessSpan {
            label: label.to_string(),
            start,
            end: Instant::now(),
        });
    }
}

/// Byte-addressable in-memory register space.
pub struct TestRegisterIo {
    regs: Mutex<HashMap<u64, u8>>,
    op_delay: Option<Duration>,
    recorder: Option<(AccessRecorder, String)>,
}

impl TestRegisterIo {
    pub fn new() -> Self {
        Self {
            regs: Mutex::new(HashMap::new()),
            op_delay: None,
            recorder: None,
        }
    }

    /// Adds a fixed delay to every access, modeling a slow transport.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.op_delay = Some(delay);
        self
    }

    /// Records every access span under the given label.
    pub fn with_recorder(mut self, recorder: AccessRecorder, label: impl Into<String>) -> Self {
        self.recorder = Some((recorder, label.into()));
        self
    }

    /// Directly sets a register value, bypassing the mediation path. Test
    /// convenience, e.g. to flip a polled bit from outside.
    pub fn poke(&self, offset: u64, value: u64, bitwidth: u32) {
        let mut regs = lock(&self.regs);
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            if (i as u32) < bitwidth / 8 {
                regs.insert(offset + i as u64, *byte);
            }
        }
    }

    /// Directly reads a register value, bypassing the mediation path.
    pub fn peek(&self, offset: u64, bitwidth: u32) -> u64 {
        let regs = lock(&self.regs);
        let mut raw = [0u8; 8];
        for (i, slot) in raw.iter_mut().enumerate().take((bitwidth / 8) as usize) {
            *slot = regs.get(&(offset + i as u64)).copied().unwrap_or(0);
        }
        u64::from_le_bytes(raw)
    }

    async fn access<T>(&self, op: impl FnOnce(&mut HashMap<u64, u8>) -> T) -> T {
        let start = Instant::now();
        if let Some(delay) = self.op_delay {
            tokio::time::sleep(delay).await;
        }
        let out = op(&mut *lock(&self.regs));
        if let Some((recorder, label)) = &self.recorder {
            recorder.record(label, start);
        }
        out
    }
}

impl Default for TestRegisterIo {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterIo for TestRegisterIo {
    fn read(&self, offset: u64, bitwidth: u32) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            Ok(self
                .access(|regs| {
                    let mut raw = [0u8; 8];
                    for (i, slot) in raw.iter_mut().enumerate().take((bitwidth / 8) as usize) {
                        *slot = regs.get(&(offset + i as u64)).copied().unwrap_or(0);
                    }
                    u64::from_le_bytes(raw)
                })
                .await)
        })
    }

    fn write(&self, offset: u64, value: u64, bitwidth: u32) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.access(|regs| {
                for (i, byte) in value.to_le_bytes().iter().enumerate() {
                    if (i as u32) < bitwidth / 8 {
                        regs.insert(offset + i as u64, *byte);
                    }
                }
            })
            .await;
            Ok(())
        })
    }

    fn read_batch<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.access(|regs| {
                for (i, slot) in buf.iter_mut().enumerate() {
                    *slot = regs.get(&(offset + i as u64)).copied().unwrap_or(0);
                }
            })
            .await;
            Ok(())
        })
    }

    fn write_batch<'a>(&'a self, offset: u64, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.access(|regs| {
                for (i, byte) in bytes.iter().enumerate() {
                    regs.insert(offset + i as u64, *byte);
                }
            })
            .await;
            Ok(())
        })
    }
}

/// Device hooks counting lifecycle transitions, for assertions in tests.
#[derive(Default)]
pub struct TestDeviceOps {
    pub power_ups: AtomicUsize,
    pub power_downs: AtomicUsize,
    pub event_enables: AtomicUsize,
    pub event_disables: AtomicUsize,
    pub emissions: AtomicUsize,
}

impl TestDeviceOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl DeviceOps for TestDeviceOps {
    fn power_up(&self) -> Result<()> {
        self.power_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn power_down(&self) -> Result<()> {
        self.power_downs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn event_enable(&self, _event_id: EventId, enabled: bool) -> Result<()> {
        if enabled {
            self.event_enables.fetch_add(1, Ordering::SeqCst);
        } else {
            self.event_disables.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn on_event_emitted(&self, _event_id: EventId, _counter: i64) {
        self.emissions.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_returns_written_value() {
        let io = TestRegisterIo::new();
        io.write(0x100, 0xDEAD, 32).await.unwrap();
        assert_eq!(io.read(0x100, 32).await.unwrap(), 0xDEAD);
    }

    #[tokio::test]
    async fn reads_honor_the_native_width() {
        let io = TestRegisterIo::new();
        io.write(0, 0x1122_3344_5566_7788, 64).await.unwrap();
        assert_eq!(io.read(0, 16).await.unwrap(), 0x7788);
        assert_eq!(io.read(0, 32).await.unwrap(), 0x5566_7788);
    }

    #[tokio::test]
    async fn batch_round_trip() {
        let io = TestRegisterIo::new();
        let data = vec![1u8, 2, 3, 4, 5, 6];
        io.write_batch(0x40, &data).await.unwrap();
        let mut out = vec![0u8; 6];
        io.read_batch(0x40, &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn recorder_sees_spans() {
        let recorder = AccessRecorder::new();
        let io = TestRegisterIo::new().with_recorder(recorder.clone(), "dev-a");
        io.write(0, 1, 32).await.unwrap();
        io.read(0, 32).await.unwrap();
        assert_eq!(recorder.spans().len(), 2);
        assert!(!recorder.has_cross_device_overlap());
    }

    #[test]
    fn poke_peek_round_trip() {
        let io = TestRegisterIo::new();
        io.poke(0x10, 0xBEEF, 32);
        assert_eq!(io.peek(0x10, 32), 0xBEEF);
    }
}
