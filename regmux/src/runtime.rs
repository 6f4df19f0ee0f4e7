//! The mediation runtime facade.
//!
//! A [`Runtime`] owns the device table, the bus-manager registry, the fence
//! table, the DPM backend, and the monotonic clock. Devices are registered
//! with their capabilities and hooks; clients are opened against devices and
//! drive everything else through their methods or the command channel.

use crate::bus::{BusManager, BusRegistry};
use crate::client::Client;
use crate::config::RuntimeConfig;
use crate::device::{Device, DeviceConfig, DeviceOps, RegisterIo};
use crate::dpm::{DpmBackend, NoopDpm};
use crate::error::{Error, Result};
use crate::fence::FenceTable;
use crate::time::MonotonicClock;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The device-mediation runtime.
pub struct Runtime {
    config: RuntimeConfig,
    clock: MonotonicClock,
    devices: DashMap<u32, Arc<Device>>,
    buses: BusRegistry,
    fences: Arc<FenceTable>,
    dpm: Arc<dyn DpmBackend>,
    next_client_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            config,
            clock: MonotonicClock::new(),
            devices: DashMap::new(),
            buses: BusRegistry::new(shutdown.child_token()),
            fences: Arc::new(FenceTable::new()),
            dpm: Arc::new(NoopDpm),
            next_client_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Replaces the DPM backend. Call before opening clients.
    pub fn with_dpm(mut self, dpm: Arc<dyn DpmBackend>) -> Self {
        self.dpm = dpm;
        self
    }

    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    pub fn fences(&self) -> &Arc<FenceTable> {
        &self.fences
    }

    pub(crate) fn dpm(&self) -> &Arc<dyn DpmBackend> {
        &self.dpm
    }

    /// Registers a device with its capabilities and hooks. Devices with a
    /// `bus_id` are connected to that bus's manager, which is created on
    /// first use.
    pub fn register_device(
        &self,
        config: DeviceConfig,
        reg_io: Option<Arc<dyn RegisterIo>>,
        ops: Arc<dyn DeviceOps>,
    ) -> Result<Arc<Device>> {
        if self.devices.contains_key(&config.id) {
            return Err(Error::InvalidArg(format!(
                "device id {} already registered",
                config.id
            )));
        }
        if config.bus_id.is_some() && !config.kind.shares_bus() {
            return Err(Error::InvalidArg(format!(
                "{:?} devices do not connect to a shared bus",
                config.kind
            )));
        }
        let id = config.id;
        let bus_id = config.bus_id;
        let device = Device::with_poll_interval(
            config,
            reg_io,
            ops,
            self.clock,
            self.config.poll_interval,
        )?;
        if let Some(bus_id) = bus_id {
            self.buses.attach_device(bus_id, &device);
        }
        self.devices.insert(id, Arc::clone(&device));
        info!(device = %device.name(), id, "device registered");
        Ok(device)
    }

    pub fn device(&self, id: u32) -> Result<Arc<Device>> {
        self.devices
            .get(&id)
            .map(|d| Arc::clone(d.value()))
            .ok_or(Error::NotFound)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Unregisters a device, disconnecting it from its bus manager. The last
    /// disconnect from a bus flushes and destroys that manager.
    pub async fn remove_device(&self, id: u32) -> Result<()> {
        let (_, device) = self.devices.remove(&id).ok_or(Error::NotFound)?;
        self.buses.detach_device(&device).await;
        info!(device = %device.name(), id, "device removed");
        Ok(())
    }

    pub(crate) fn bus_manager_for(&self, device: &Arc<Device>) -> Option<Arc<BusManager>> {
        device.bus_manager()
    }

    pub fn bus_manager(&self, bus_id: i32) -> Option<Arc<BusManager>> {
        self.buses.manager(bus_id)
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    /// Opens a client session against a device.
    pub fn open_client(&self, device_id: u32) -> Result<Arc<Client>> {
        let device = self.device(device_id)?;
        let client = Client::new(
            self.next_client_id.fetch_add(1, Ordering::Relaxed),
            Arc::clone(&device),
            Arc::clone(&self.fences),
            self.clock,
            self.config.event_queue_warn_depth,
            self.shutdown.child_token(),
        );
        device.attach_client(Arc::downgrade(&client));
        info!(device = %device.name(), client = client.id(), "client opened");
        Ok(client)
    }

    /// Closes a client session: drops its enable reference (flushing all
    /// in-flight work) and stops its workers.
    pub async fn close_client(&self, client: &Arc<Client>) -> Result<()> {
        client.disable_device().await?;
        client.stop();
        client.device().detach_client(client.id());
        info!(client = client.id(), "client closed");
        Ok(())
    }

    /// Stops every worker owned by the runtime.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("devices", &self.device_count())
            .field("buses", &self.bus_count())
            .field("fences", &self.fences.len())
            .finish_non_exhaustive()
    }
}
