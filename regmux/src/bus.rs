//! Shared-bus arbitration.
//!
//! One [`BusManager`] exists per physical shared bus. It owns a FIFO of
//! client references (not transactions: a dequeued client drains its own
//! ready queue), a single consumer task, and the bus-level mutex the executor
//! holds across each program run. Enqueueing deduplicates with a per-client
//! atomic membership flag, bounding the FIFO by clients x 1.
//!
//! The manager registry creates a manager on the first device connect for a
//! bus id and destroys it again when the last device disconnects (flushing
//! the worker first).

use crate::client::Client;
use crate::device::Device;
use crate::sync::{lock, next_worker_id};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum BusWork {
    /// A client with ready work on a device of this bus.
    Client(Arc<Client>),
    /// Flush marker: resolves once every prior entry has drained.
    Flush(oneshot::Sender<()>),
}

struct ConnectedDevice {
    id: u32,
    device: Weak<Device>,
}

/// Serializer over one shared bus.
pub struct BusManager {
    bus_id: i32,
    name: String,
    worker_id: u64,
    bus_lock: AsyncMutex<()>,
    devices: Mutex<Vec<ConnectedDevice>>,
    /// Priority of the first connected device; later mismatches are logged.
    thread_priority: Mutex<Option<i32>>,
    work_tx: mpsc::UnboundedSender<BusWork>,
    shutdown: CancellationToken,
}

impl BusManager {
    fn spawn(bus_id: i32, shutdown: CancellationToken) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            bus_id,
            name: format!("i2c-bus-{bus_id}"),
            worker_id: next_worker_id(),
            bus_lock: AsyncMutex::new(()),
            devices: Mutex::new(Vec::new()),
            thread_priority: Mutex::new(None),
            work_tx,
            shutdown,
        });
        let weak = Arc::downgrade(&manager);
        let token = manager.shutdown.clone();
        tokio::spawn(Self::worker_loop(weak, work_rx, token));
        info!(bus = %manager.name, "bus manager created");
        manager
    }

    pub fn bus_id(&self) -> i32 {
        self.bus_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn thread_priority(&self) -> Option<i32> {
        *lock(&self.thread_priority)
    }

    pub fn connected_device_count(&self) -> usize {
        lock(&self.devices).len()
    }

    /// Acquires the bus mutex for one program run.
    pub(crate) async fn lock_bus(&self) -> MutexGuard<'_, ()> {
        self.bus_lock.lock().await
    }

    /// Queues a client for draining. Idempotent: a client already in the
    /// FIFO is not queued twice.
    pub(crate) fn enqueue(&self, client: Arc<Client>) {
        if client.try_mark_bus_membership() {
            let _ = self.work_tx.send(BusWork::Client(client));
        } else {
            debug!(bus = %self.name, "client already queued");
        }
    }

    /// Resolves once every entry queued before the call has drained.
    pub(crate) async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.work_tx.send(BusWork::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    fn is_connected(&self, device_id: u32) -> bool {
        lock(&self.devices).iter().any(|d| d.id == device_id)
    }

    fn connect(&self, device: &Arc<Device>) {
        let priority = device.transaction_thread_priority();
        {
            let mut current = lock(&self.thread_priority);
            match *current {
                None => *current = Some(priority),
                Some(existing) if existing != priority => warn!(
                    bus = %self.name,
                    device = %device.name(),
                    bus_priority = existing,
                    device_priority = priority,
                    "bus worker priority differs from device thread priority"
                ),
                Some(_) => {}
            }
        }
        lock(&self.devices).push(ConnectedDevice {
            id: device.id(),
            device: Arc::downgrade(device),
        });
        info!(
            bus = %self.name,
            device = %device.name(),
            connected = self.connected_device_count(),
            "device connected to bus manager"
        );
    }

    /// Removes a device, returning how many remain connected.
    fn disconnect(&self, device_id: u32) -> usize {
        let mut devices = lock(&self.devices);
        devices.retain(|d| d.id != device_id && d.device.strong_count() > 0);
        devices.len()
    }

    async fn worker_loop(
        manager: Weak<BusManager>,
        mut work_rx: mpsc::UnboundedReceiver<BusWork>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                work = work_rx.recv() => {
                    match work {
                        None => break,
                        Some(BusWork::Flush(done)) => {
                            let _ = done.send(());
                        }
                        Some(BusWork::Client(client)) => {
                            // Clear membership before draining so work that
                            // arrives mid-drain re-queues the client.
                            client.clear_bus_membership();
                            let Some(manager) = manager.upgrade() else { break };
                            if manager.is_connected(client.device().id()) {
                                client.drain_ready().await;
                            } else {
                                debug!(bus = %manager.name, "dropping stale entry for disconnected device");
                            }
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusManager")
            .field("bus_id", &self.bus_id)
            .field("devices", &self.connected_device_count())
            .finish_non_exhaustive()
    }
}

/// Registry of bus managers keyed by bus id.
pub(crate) struct BusRegistry {
    managers: DashMap<i32, Arc<BusManager>>,
    shutdown: CancellationToken,
}

impl BusRegistry {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            managers: DashMap::new(),
            shutdown,
        }
    }

    /// Connects a device to the manager for its bus, creating the manager on
    /// first use.
    pub fn attach_device(&self, bus_id: i32, device: &Arc<Device>) -> Arc<BusManager> {
        let manager = self
            .managers
            .entry(bus_id)
            .or_insert_with(|| BusManager::spawn(bus_id, self.shutdown.child_token()))
            .clone();
        manager.connect(device);
        device.attach_bus(Arc::clone(&manager));
        manager
    }

    /// Disconnects a device; the last disconnect flushes and destroys the
    /// manager.
    pub async fn detach_device(&self, device: &Arc<Device>) {
        let Some(manager) = device.take_bus() else {
            return;
        };
        let remaining = manager.disconnect(device.id());
        if remaining == 0 {
            manager.flush().await;
            manager.shutdown.cancel();
            self.managers.remove(&manager.bus_id());
            info!(bus = %manager.name(), "bus manager destroyed");
        }
    }

    pub fn manager(&self, bus_id: i32) -> Option<Arc<BusManager>> {
        self.managers.get(&bus_id).map(|m| Arc::clone(m.value()))
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }
}
