//! Devices and their capabilities.
//!
//! A device couples an identity (id, name, kind) with an optional
//! [`RegisterIo`] capability, sub-class hooks ([`DeviceOps`]), an event-state
//! table, an enable refcount shared by its clients, and an optional
//! bus-manager attachment for kinds that share a transport.
//!
//! Virtual kinds (`Dpm`, `Top`) carry no register capability; submitting
//! register programs against them is rejected.

mod test_device;

pub use test_device::{AccessRecorder, AccessSpan, TestDeviceOps, TestRegisterIo};

use crate::bus::BusManager;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::event::{
    encode_page_fault, DeviceEventTable, EventId, EventRecord, EVENT_FLAG_ERROR_QUEUE,
    EVENT_FLAG_QUEUE, EVENT_ID_MEMORY_PAGE_FAULT,
};
use crate::sync::lock;
use crate::time::MonotonicClock;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Device classes understood by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Memory-mapped register block.
    Mmio,
    /// Peripheral on a shared I²C bus.
    I2c,
    /// SPI peripheral.
    Spi,
    /// Virtual power/clock management device.
    Dpm,
    /// In-memory device used by tests and tooling.
    Test,
    /// Virtual top-level device.
    Top,
}

impl DeviceKind {
    /// Whether devices of this kind carry a register capability.
    pub fn has_register_io(&self) -> bool {
        !matches!(self, DeviceKind::Dpm | DeviceKind::Top)
    }

    /// Whether devices of this kind are arbitrated by a bus manager.
    pub fn shares_bus(&self) -> bool {
        matches!(self, DeviceKind::I2c)
    }
}

/// Register access capability of a device.
///
/// Implementations may block on their transport; calls are made while the
/// owning bus's mutex is held, so accesses against devices sharing a bus
/// never interleave. The barrier hook brackets whole program runs and
/// defaults to a no-op for transports without ordering requirements.
pub trait RegisterIo: Send + Sync {
    fn read(&self, offset: u64, bitwidth: u32) -> BoxFuture<'_, Result<u64>>;

    fn write(&self, offset: u64, value: u64, bitwidth: u32) -> BoxFuture<'_, Result<()>>;

    fn read_batch<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> BoxFuture<'a, Result<()>>;

    fn write_batch<'a>(&'a self, offset: u64, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Memory-barrier bracket invoked before (write) and after (read) each
    /// program run.
    fn barrier(&self, use_read_barrier: bool, use_write_barrier: bool) {
        let _ = (use_read_barrier, use_write_barrier);
    }
}

/// Sub-class hooks a device kind can override.
pub trait DeviceOps: Send + Sync {
    /// Invoked on the first client enable.
    fn power_up(&self) -> Result<()> {
        Ok(())
    }

    /// Invoked on the last client disable.
    fn power_down(&self) -> Result<()> {
        Ok(())
    }

    /// Invoked when an event's aggregate enable state transitions.
    fn event_enable(&self, event_id: EventId, enabled: bool) -> Result<()> {
        let _ = (event_id, enabled);
        Ok(())
    }

    /// Invoked after an emission has been delivered.
    fn on_event_emitted(&self, event_id: EventId, counter: i64) {
        let _ = (event_id, counter);
    }
}

/// Hooks for devices with no sub-class behavior.
pub struct NullDeviceOps;

impl DeviceOps for NullDeviceOps {}

/// Static description of a device handed to
/// [`Runtime::register_device`](crate::runtime::Runtime::register_device).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: u32,
    pub name: String,
    pub kind: DeviceKind,
    /// Width of a single register access in bits.
    pub native_value_bitwidth: u32,
    pub clocks: Vec<String>,
    pub reg_blocks: Vec<String>,
    /// Priority requested for the worker servicing this device's
    /// transactions. Advisory; mismatches across one bus are logged.
    pub transaction_thread_priority: i32,
    /// Physical bus this device shares, for kinds that share one.
    pub bus_id: Option<i32>,
}

impl DeviceConfig {
    pub fn new(id: u32, name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            native_value_bitwidth: 32,
            clocks: Vec::new(),
            reg_blocks: Vec::new(),
            transaction_thread_priority: 0,
            bus_id: None,
        }
    }

    pub fn with_bus(mut self, bus_id: i32) -> Self {
        self.bus_id = Some(bus_id);
        self
    }

    pub fn with_bitwidth(mut self, bits: u32) -> Self {
        self.native_value_bitwidth = bits;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.transaction_thread_priority = priority;
        self
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    enable_count: i32,
    suspended: bool,
}

/// A mediated hardware or virtual device.
pub struct Device {
    config: DeviceConfig,
    reg_io: Option<Arc<dyn RegisterIo>>,
    ops: Arc<dyn DeviceOps>,
    clock: MonotonicClock,
    poll_interval: Duration,
    events: DeviceEventTable,
    lifecycle: Mutex<Lifecycle>,
    clients: Mutex<Vec<Weak<Client>>>,
    bus: Mutex<Option<Arc<BusManager>>>,
}

impl Device {
    pub(crate) fn new(
        config: DeviceConfig,
        reg_io: Option<Arc<dyn RegisterIo>>,
        ops: Arc<dyn DeviceOps>,
        clock: MonotonicClock,
    ) -> Result<Arc<Self>> {
        Self::with_poll_interval(
            config,
            reg_io,
            ops,
            clock,
            Duration::from_micros(crate::config::DEFAULT_POLL_INTERVAL_US),
        )
    }

    pub(crate) fn with_poll_interval(
        config: DeviceConfig,
        reg_io: Option<Arc<dyn RegisterIo>>,
        ops: Arc<dyn DeviceOps>,
        clock: MonotonicClock,
        poll_interval: Duration,
    ) -> Result<Arc<Self>> {
        if reg_io.is_some() && !config.kind.has_register_io() {
            return Err(Error::InvalidArg(format!(
                "{:?} devices cannot carry a register capability",
                config.kind
            )));
        }
        if config.native_value_bitwidth == 0 || config.native_value_bitwidth > 64 {
            return Err(Error::InvalidArg("native value bitwidth out of range".into()));
        }
        Ok(Arc::new(Self {
            config,
            reg_io,
            ops,
            clock,
            poll_interval,
            events: DeviceEventTable::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            clients: Mutex::new(Vec::new()),
            bus: Mutex::new(None),
        }))
    }

    /// Interval between re-reads while servicing a `Poll` entry.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn id(&self) -> u32 {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.config.kind
    }

    pub fn native_value_bitwidth(&self) -> u32 {
        self.config.native_value_bitwidth
    }

    pub fn clocks(&self) -> &[String] {
        &self.config.clocks
    }

    pub fn reg_blocks(&self) -> &[String] {
        &self.config.reg_blocks
    }

    pub fn transaction_thread_priority(&self) -> i32 {
        self.config.transaction_thread_priority
    }

    /// The register capability, or `NotSupported` for virtual kinds.
    pub(crate) fn register_io(&self) -> Result<&Arc<dyn RegisterIo>> {
        self.reg_io.as_ref().ok_or(Error::NotSupported)
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.lifecycle).enable_count > 0
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.lifecycle).suspended
    }

    pub(crate) fn bus_manager(&self) -> Option<Arc<BusManager>> {
        lock(&self.bus).clone()
    }

    pub(crate) fn attach_bus(&self, manager: Arc<BusManager>) {
        *lock(&self.bus) = Some(manager);
    }

    pub(crate) fn take_bus(&self) -> Option<Arc<BusManager>> {
        lock(&self.bus).take()
    }

    pub(crate) fn attach_client(&self, client: Weak<Client>) {
        lock(&self.clients).push(client);
    }

    pub(crate) fn detach_client(&self, client_id: u64) {
        lock(&self.clients).retain(|weak| match weak.upgrade() {
            Some(client) => client.id() != client_id,
            None => false,
        });
    }

    fn live_clients(&self) -> Vec<Arc<Client>> {
        let mut clients = lock(&self.clients);
        clients.retain(|weak| weak.strong_count() > 0);
        clients.iter().filter_map(Weak::upgrade).collect()
    }

    /// Takes one enable reference. The first reference runs the power-up
    /// hook; a counter at `i32::MAX` is fatal to the call.
    pub(crate) fn client_enable(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.enable_count == i32::MAX {
            tracing::error!(device = %self.config.name, "enable counter overflow");
            return Err(Error::Overflow);
        }
        if lifecycle.enable_count == 0 {
            self.ops.power_up()?;
            info!(device = %self.config.name, "device enabled");
        }
        lifecycle.enable_count += 1;
        lifecycle.suspended = false;
        Ok(())
    }

    /// Drops one enable reference. The last reference runs the power-down
    /// hook and clears event state no client still enables.
    pub(crate) fn client_disable(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.enable_count <= 0 {
            warn!(device = %self.config.name, "disabling a device that is already disabled");
            return Err(Error::InvalidState("device not enabled".into()));
        }
        lifecycle.enable_count -= 1;
        if lifecycle.enable_count == 0 {
            self.ops.power_down()?;
            self.events.clear_disabled();
            lifecycle.suspended = false;
            info!(device = %self.config.name, "device disabled");
        }
        Ok(())
    }

    pub(crate) fn suspend(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if !lifecycle.suspended {
            lifecycle.suspended = true;
            info!(device = %self.config.name, "device suspended");
        }
        Ok(())
    }

    pub(crate) fn resume(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.suspended {
            lifecycle.suspended = false;
            info!(device = %self.config.name, "device resumed");
        }
        Ok(())
    }

    /// Current emission counter for an event.
    pub fn event_counter(&self, event_id: EventId) -> i64 {
        self.events.event_counter(event_id)
    }

    /// Adjusts the per-event enable count, running the sub-class hook on
    /// 0 <-> non-zero transitions.
    pub(crate) fn adjust_event_enable(&self, event_id: EventId, delta: i64) -> Result<()> {
        if let Some(enabled) = self.events.adjust_enable(event_id, delta) {
            self.ops.event_enable(event_id, enabled)?;
        }
        Ok(())
    }

    /// Emits an event with a payload.
    ///
    /// The emission counter advances by exactly one. The record is delivered
    /// to every attached client whose flags select the event (the error flag
    /// wins the queue choice); clients with no delivery flags drop the record
    /// at the source but the trigger engine still observes the emission.
    /// Returns the counter value of this emission.
    ///
    /// This path never blocks and takes only short leaf locks, so it is safe
    /// to call from completion paths and interrupt-style contexts.
    pub fn emit_event(&self, event_id: EventId, payload: Vec<u8>) -> i64 {
        let counter = self.events.accept_emission(event_id);
        let timestamp_ns = self.clock.now_ns();
        debug!(device = %self.config.name, event_id, counter, "event emitted");

        for client in self.live_clients() {
            let flags = client.event_flags(event_id);
            if flags & (EVENT_FLAG_QUEUE | EVENT_FLAG_ERROR_QUEUE) != 0 {
                client.deliver_event(
                    EventRecord {
                        event_id,
                        counter,
                        timestamp_ns,
                        payload: payload.clone(),
                    },
                    flags & EVENT_FLAG_ERROR_QUEUE != 0,
                );
            } else if flags != 0 {
                // IRQ-notify only: wake without queueing a record.
                client.notify_event_waiters();
            }
            client.transaction_event_trigger(event_id, counter);
        }

        self.ops.on_event_emitted(event_id, counter);
        counter
    }

    /// External fault-handler entry point: emits the page-fault error event
    /// on this device with the fault address and flags as payload.
    pub fn report_page_fault(&self, fault_address: u64, fault_flags: u32) {
        tracing::error!(
            device = %self.config.name,
            fault_address,
            fault_flags,
            "memory page fault reported"
        );
        self.emit_event(
            EVENT_ID_MEMORY_PAGE_FAULT,
            encode_page_fault(fault_address, fault_flags),
        );
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.config.id)
            .field("name", &self.config.name)
            .field("kind", &self.config.kind)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> Arc<Device> {
        Device::new(
            DeviceConfig::new(1, "test0", DeviceKind::Test),
            Some(Arc::new(TestRegisterIo::new())),
            Arc::new(NullDeviceOps),
            MonotonicClock::new(),
        )
        .unwrap()
    }

    #[test]
    fn virtual_kinds_reject_register_capability() {
        let result = Device::new(
            DeviceConfig::new(2, "dpm0", DeviceKind::Dpm),
            Some(Arc::new(TestRegisterIo::new())),
            Arc::new(NullDeviceOps),
            MonotonicClock::new(),
        );
        assert!(result.is_err());

        let dpm = Device::new(
            DeviceConfig::new(2, "dpm0", DeviceKind::Dpm),
            None,
            Arc::new(NullDeviceOps),
            MonotonicClock::new(),
        )
        .unwrap();
        assert!(dpm.register_io().is_err());
    }

    #[test]
    fn enable_refcounts_and_is_idempotent_at_device_level() {
        let device = test_device();
        assert!(!device.is_enabled());
        device.client_enable().unwrap();
        device.client_enable().unwrap();
        assert!(device.is_enabled());
        device.client_disable().unwrap();
        assert!(device.is_enabled());
        device.client_disable().unwrap();
        assert!(!device.is_enabled());
        assert!(device.client_disable().is_err());
    }

    #[test]
    fn suspend_resume_round_trip() {
        let device = test_device();
        device.client_enable().unwrap();
        assert!(!device.is_suspended());
        device.suspend().unwrap();
        device.suspend().unwrap();
        assert!(device.is_suspended());
        device.resume().unwrap();
        assert!(!device.is_suspended());
    }

    #[test]
    fn emission_advances_the_counter_without_clients() {
        let device = test_device();
        assert_eq!(device.emit_event(42, vec![]), 1);
        assert_eq!(device.emit_event(42, vec![]), 2);
        assert_eq!(device.event_counter(42), 2);
    }
}
