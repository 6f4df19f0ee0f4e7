//! Clients and the per-client scheduler.
//!
//! A client belongs to exactly one device and owns the per-session state:
//! event control flags and delivery queues, the transaction table
//! (event buckets of weak records plus the pending map holding the strong
//! references), the periodic-I/O timer table, the buffer handle table, and a
//! single worker task that drains ready work.
//!
//! Drain order is cleanup first (canceled and errored transactions), then
//! ready transactions in submission order, then periodic work in submission
//! order. For devices attached to a bus manager the drain runs on the bus
//! worker instead of the client worker; the per-client drain mutex keeps the
//! two from interleaving and is held across a single transaction's execution
//! so cancellation sees consistent state.

use crate::buffer::{AllocatedBuffer, BufferTable, EnrolledBuffer};
use crate::device::Device;
use crate::error::{Error, Result, CANCELLATION_CODE};
use crate::event::{
    ClientEventQueues, DequeueOutcome, EventControl, EventId, EventRecord, EVENT_FLAG_ERROR_QUEUE,
    EVENT_FLAG_QUEUE, EVENT_ID_NONE,
};
use crate::executor;
use crate::fence::{AddTransactionOutcome, FenceFd, FenceTable};
use crate::io_entry::{self, IoEntry, TransactionResponse};
use crate::periodic::{
    self, PeriodicEntry, PeriodicIoId, PeriodicIoInfo, PeriodicState, PeriodicTimer,
};
use crate::sync::{lock, next_worker_id};
use crate::time::MonotonicClock;
use crate::transaction::{
    Transaction, TransactionId, TransactionInfo, TransactionSubmitResult, WeakRecord,
    INVALID_TRANSACTION_ID,
};
use crate::trigger::{TriggerDecision, TriggerNode, TriggerState};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Default)]
struct TxnState {
    counter: i64,
    /// Weak records keyed by triggering event id.
    event_buckets: HashMap<EventId, Vec<WeakRecord>>,
    /// Strong references to transactions waiting on their condition.
    pending: HashMap<TransactionId, Transaction>,
    /// Ready (or canceled, pending cleanup) transactions in FIFO order.
    process_queue: VecDeque<Transaction>,
}

struct RunningTxn {
    id: TransactionId,
    cancel: CancellationToken,
}

/// A client session against one device.
pub struct Client {
    id: u64,
    worker_id: u64,
    device: Arc<Device>,
    fences: Arc<FenceTable>,
    clock: MonotonicClock,
    weak: Weak<Client>,
    is_enabled: AtomicBool,
    txn: Mutex<TxnState>,
    events: Mutex<ClientEventQueues>,
    event_notify: Notify,
    periodic: Mutex<PeriodicState>,
    buffers: Mutex<BufferTable>,
    /// Held across a single transaction's execution.
    drain_lock: AsyncMutex<()>,
    running: Mutex<Option<RunningTxn>>,
    work_tx: mpsc::UnboundedSender<()>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    in_bus_queue: AtomicBool,
    shutdown: CancellationToken,
}

impl Client {
    pub(crate) fn new(
        id: u64,
        device: Arc<Device>,
        fences: Arc<FenceTable>,
        clock: MonotonicClock,
        event_queue_warn_depth: usize,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let client = Arc::new_cyclic(|weak| Self {
            id,
            worker_id: next_worker_id(),
            device,
            fences,
            clock,
            weak: weak.clone(),
            is_enabled: AtomicBool::new(false),
            txn: Mutex::new(TxnState::default()),
            events: Mutex::new(ClientEventQueues::new(event_queue_warn_depth)),
            event_notify: Notify::new(),
            periodic: Mutex::new(PeriodicState::default()),
            buffers: Mutex::new(BufferTable::new()),
            drain_lock: AsyncMutex::new(()),
            running: Mutex::new(None),
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            in_bus_queue: AtomicBool::new(false),
            shutdown,
        });
        client.start_worker();
        client
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.shutdown.cancel();
    }

    fn start_worker(&self) {
        let rx = lock(&self.work_rx).take();
        let Some(mut rx) = rx else { return };
        let weak = self.weak.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    work = rx.recv() => {
                        if work.is_none() {
                            break;
                        }
                        let Some(client) = weak.upgrade() else { break };
                        client.drain_ready().await;
                    }
                }
            }
        });
    }

    /// Wakes whichever worker services this client's device: the bus worker
    /// for bus-attached devices, the client worker otherwise.
    fn schedule(&self) {
        if let Some(bus) = self.device.bus_manager() {
            if let Some(me) = self.weak.upgrade() {
                bus.enqueue(me);
            }
        } else {
            let _ = self.work_tx.send(());
        }
    }

    pub(crate) fn try_mark_bus_membership(&self) -> bool {
        !self.in_bus_queue.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_bus_membership(&self) {
        self.in_bus_queue.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Device lifecycle
    // ------------------------------------------------------------------

    /// Takes an enable reference on the device. A no-op success if this
    /// client already holds one.
    pub async fn enable_device(&self) -> Result<()> {
        if self.is_enabled() {
            return Ok(());
        }
        // Drop stale events from a previous session before powering up.
        lock(&self.events).clear_queues();
        self.device.client_enable()?;
        self.is_enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Drops this client's enable reference, flushing all in-flight work
    /// first. A no-op success if this client holds none.
    pub async fn disable_device(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.clear_event_controls();
        self.flush_periodic().await;
        self.flush_transactions().await;
        self.device.client_disable()?;
        self.is_enabled.store(false, Ordering::Release);
        Ok(())
    }

    pub async fn suspend_device(&self) -> Result<()> {
        self.device.suspend()
    }

    pub async fn resume_device(&self) -> Result<()> {
        self.device.resume()
    }

    /// Runs reset entries (skip-on-error) if the device is enabled, then
    /// drops queued events. With the device disabled the entries are skipped
    /// with a warning.
    pub async fn reset_device(&self, entries: &[IoEntry]) -> Result<()> {
        if !entries.is_empty() {
            if self.device.is_enabled() {
                let entries = io_entry::copy_entries(entries)?;
                let mut resp = TransactionResponse::new(INVALID_TRANSACTION_ID);
                executor::run_program(&self.device, &entries, &mut resp, None, true).await?;
            } else {
                warn!(
                    device = %self.device.name(),
                    "device not enabled, skipping reset io entries"
                );
            }
        }
        lock(&self.events).clear_queues();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Synchronous register access
    // ------------------------------------------------------------------

    /// Runs a register program synchronously in the caller's context.
    pub async fn reg_io(&self, entries: &[IoEntry]) -> Result<TransactionResponse> {
        let entries = io_entry::copy_entries(entries)?;
        io_entry::response_size(&entries, self.device.native_value_bitwidth())?;
        let mut resp = TransactionResponse::new(INVALID_TRANSACTION_ID);
        executor::run_program(&self.device, &entries, &mut resp, None, false).await?;
        Ok(resp)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub(crate) fn event_flags(&self, event_id: EventId) -> u32 {
        lock(&self.events).flags(event_id)
    }

    pub(crate) fn deliver_event(&self, record: EventRecord, to_error_queue: bool) {
        lock(&self.events).push(record, to_error_queue);
        self.event_notify.notify_waiters();
    }

    pub(crate) fn notify_event_waiters(&self) {
        self.event_notify.notify_waiters();
    }

    /// Applies control-flag updates, driving the device's event-enable hook
    /// on 0 <-> non-zero transitions.
    pub fn event_control_set(&self, controls: &[EventControl]) -> Result<()> {
        for control in controls {
            let previous = lock(&self.events).set_flags(control.event_id, control.flags);
            if previous == 0 && control.flags != 0 {
                self.device.adjust_event_enable(control.event_id, 1)?;
            } else if previous != 0 && control.flags == 0 {
                self.device.adjust_event_enable(control.event_id, -1)?;
            }
        }
        Ok(())
    }

    pub fn event_control_get(&self, event_id: EventId) -> EventControl {
        EventControl {
            event_id,
            flags: self.event_flags(event_id),
        }
    }

    /// Non-blocking dequeue; error queue first, undersized buffers report
    /// the required size without popping.
    pub fn dequeue_event(&self, payload_capacity: usize) -> Result<DequeueOutcome> {
        lock(&self.events).dequeue(payload_capacity)
    }

    /// Waits until an event can be dequeued.
    pub async fn next_event(&self, payload_capacity: usize) -> Result<DequeueOutcome> {
        loop {
            let notified = self.event_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.dequeue_event(payload_capacity) {
                Err(Error::NotFound) => {}
                other => return other,
            }
            notified.await;
        }
    }

    fn clear_event_controls(&self) {
        let ids = lock(&self.events).clear_controls();
        for event_id in ids {
            let _ = self.device.adjust_event_enable(event_id, -1);
        }
        lock(&self.events).clear_queues();
    }

    /// Completion events must reach the submitting client even when it never
    /// issued an explicit control for them; default the flags accordingly.
    fn ensure_completion_event_flags(&self, event_id: EventId, error: bool) -> Result<()> {
        if self.event_flags(event_id) == 0 {
            let flags = if error {
                EVENT_FLAG_ERROR_QUEUE
            } else {
                EVENT_FLAG_QUEUE
            };
            self.event_control_set(&[EventControl { event_id, flags }])?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Submits a transaction. See `TransactionInfo` for the knobs; the
    /// assigned id and any runtime-minted fence descriptors come back in the
    /// result.
    pub fn submit_transaction(&self, info: TransactionInfo) -> Result<TransactionSubmitResult> {
        let mut minted: Vec<FenceFd> = Vec::new();
        let outcome = self.submit_transaction_inner(info, &mut minted);
        if outcome.is_err() {
            // Release fences the caller will never learn about.
            for fd in minted {
                let _ = self.fences.signal(fd, CANCELLATION_CODE);
                let _ = self.fences.close(fd);
            }
        }
        outcome
    }

    fn submit_transaction_inner(
        &self,
        mut info: TransactionInfo,
        minted: &mut Vec<FenceFd>,
    ) -> Result<TransactionSubmitResult> {
        self.device.register_io()?;
        info.trigger.validate()?;
        info.entries = io_entry::copy_entries(&info.entries)?;
        io_entry::response_size(&info.entries, self.device.native_value_bitwidth())?;

        // Substitute placeholder nodes with freshly minted fences; the
        // descriptors are returned to the caller for later signaling.
        let mut trigger_fence_fds = Vec::new();
        for node in info.trigger.nodes.iter_mut() {
            if matches!(node, TriggerNode::NewFence) {
                let (fd, _) = self.fences.create();
                minted.push(fd);
                trigger_fence_fds.push(fd);
                *node = TriggerNode::Fence { fd };
            }
        }

        let completion_fence_fd = if info.create_completion_fence {
            let (fd, _) = self.fences.create();
            minted.push(fd);
            info.completion_fence_fds.push(fd);
            Some(fd)
        } else {
            None
        };

        let mut completion_fences = Vec::new();
        for fd in &info.completion_fence_fds {
            completion_fences.push(self.fences.get(*fd)?);
        }

        if info.emit_success_event_id != EVENT_ID_NONE {
            self.ensure_completion_event_flags(info.emit_success_event_id, false)?;
        }
        if info.emit_error_event_id != EVENT_ID_NONE {
            self.ensure_completion_event_flags(info.emit_error_event_id, true)?;
        }

        let me = self.weak.upgrade().ok_or(Error::NotFound)?;

        let mut st = lock(&self.txn);
        let id = st.counter;
        st.counter += 1;
        info.id = id;

        let mut trigger_state = TriggerState::new(&info.trigger);
        let mut trigger_fences = Vec::new();
        let mut weak_regs: Vec<EventId> = Vec::new();

        for (index, node) in info.trigger.nodes.iter().enumerate() {
            match node {
                TriggerNode::Event { event_id, counter } => {
                    let current = self.device.event_counter(*event_id);
                    if *counter != 0 {
                        if *counter == current {
                            if info.is_level_triggered {
                                trigger_state.prefire(index);
                                continue;
                            }
                            return Err(Error::NotFound);
                        }
                        if *counter < current {
                            return Err(Error::NotFound);
                        }
                    }
                    weak_regs.push(*event_id);
                }
                TriggerNode::Fence { fd } => {
                    let fence = self.fences.get(*fd)?;
                    match fence.add_transaction(&me, id) {
                        AddTransactionOutcome::Added => trigger_fences.push(fence),
                        AddTransactionOutcome::AlreadySignaledOk => trigger_state.prefire(index),
                        AddTransactionOutcome::AlreadySignaledErr(code) => {
                            trigger_state.prefire_error(index, code)
                        }
                    }
                }
                TriggerNode::NewFence => unreachable!("placeholders substituted above"),
            }
        }

        let decision = trigger_state.decision();
        let txn = Transaction {
            resp: TransactionResponse::new(id),
            info,
            trigger_state,
            completion_fences,
            trigger_fences,
            cancel: self.shutdown.child_token(),
            submitted_ns: self.clock.now_ns(),
        };

        let mut queued = false;
        let mut canceled = None;
        match decision {
            TriggerDecision::Run => {
                st.process_queue.push_back(txn);
                queued = true;
            }
            TriggerDecision::Cancel(code) => {
                let mut txn = txn;
                txn.resp.error_code = if code == 0 { CANCELLATION_CODE } else { code };
                canceled = Some(txn);
            }
            TriggerDecision::Pending => {
                for event_id in weak_regs {
                    st.event_buckets
                        .entry(event_id)
                        .or_default()
                        .push(WeakRecord { txn_id: id });
                }
                st.pending.insert(id, txn);
            }
        }
        drop(st);

        debug!(
            client = self.id,
            txn = id,
            immediate = queued,
            "transaction submitted"
        );
        if queued {
            self.schedule();
        }
        if let Some(txn) = canceled {
            self.finish_canceled(txn);
        }

        Ok(TransactionSubmitResult {
            id,
            trigger_fence_fds,
            completion_fence_fd,
        })
    }

    /// Cancels a transaction by id.
    ///
    /// A waiting transaction is unlinked before it can execute; a running
    /// one is stopped cooperatively between entries. Canceling a completed
    /// transaction reports `NotFound`.
    pub fn cancel_transaction(&self, id: TransactionId) -> Result<()> {
        let mut found = false;
        {
            let mut st = lock(&self.txn);
            if let Some(mut txn) = st.pending.remove(&id) {
                txn.resp.error_code = CANCELLATION_CODE;
                st.process_queue.push_back(txn);
                found = true;
            } else if let Some(txn) = st.process_queue.iter_mut().find(|t| t.info.id == id) {
                if txn.resp.error_code == 0 {
                    txn.resp.error_code = CANCELLATION_CODE;
                }
                found = true;
            }
        }
        if found {
            self.schedule();
            return Ok(());
        }
        let running = lock(&self.running);
        if let Some(current) = running.as_ref() {
            if current.id == id {
                current.cancel.cancel();
                return Ok(());
            }
        }
        Err(Error::NotFound)
    }

    /// Atomically supersedes the transaction named by `info.id` with a fresh
    /// submission. A missing predecessor is tolerated.
    pub fn replace_transaction(&self, info: TransactionInfo) -> Result<TransactionSubmitResult> {
        let old_id = info.id;
        if old_id != INVALID_TRANSACTION_ID {
            match self.cancel_transaction(old_id) {
                Ok(()) => {}
                Err(Error::NotFound) => {
                    debug!(client = self.id, txn = old_id, "replace found nothing to cancel")
                }
                Err(e) => return Err(e),
            }
        }
        self.submit_transaction(info)
    }

    /// Re-evaluates waiting transactions after an event emission. Runs in
    /// the emitter's context; never blocks.
    pub(crate) fn transaction_event_trigger(&self, event_id: EventId, counter: i64) {
        let mut ready = false;
        let mut canceled = Vec::new();
        {
            let mut st = lock(&self.txn);
            let TxnState {
                event_buckets,
                pending,
                process_queue,
                ..
            } = &mut *st;
            let Some(records) = event_buckets.get_mut(&event_id) else {
                return;
            };

            let mut decided: Vec<TransactionId> = Vec::new();
            records.retain(|record| {
                let Some(txn) = pending.get_mut(&record.txn_id) else {
                    // Already executed or canceled; drop the stale record.
                    return false;
                };
                let fired = txn.trigger_state.fire_event(event_id, counter);
                if fired && txn.trigger_state.decision() != TriggerDecision::Pending {
                    decided.push(record.txn_id);
                }
                !fired
            });
            if records.is_empty() {
                event_buckets.remove(&event_id);
            }

            for id in decided {
                let Some(mut txn) = pending.remove(&id) else {
                    continue;
                };
                match txn.trigger_state.decision() {
                    TriggerDecision::Run => {
                        process_queue.push_back(txn);
                        ready = true;
                    }
                    TriggerDecision::Cancel(code) => {
                        txn.resp.error_code = if code == 0 { CANCELLATION_CODE } else { code };
                        canceled.push(txn);
                    }
                    TriggerDecision::Pending => {
                        pending.insert(id, txn);
                    }
                }
            }
        }
        for txn in canceled {
            self.finish_canceled(txn);
        }
        if ready {
            self.schedule();
        }
    }

    /// Re-evaluates waiting transactions after a fence signal. Called by the
    /// fence with the bucket it drained for this client.
    pub(crate) fn fence_trigger(&self, fd: FenceFd, status: i32, txn_ids: &[TransactionId]) {
        let mut ready = false;
        let mut canceled = Vec::new();
        {
            let mut st = lock(&self.txn);
            let TxnState {
                pending,
                process_queue,
                ..
            } = &mut *st;
            for id in txn_ids {
                let Some(txn) = pending.get_mut(id) else {
                    // Already executed or canceled.
                    debug!(client = self.id, txn = *id, fd, "fence fired for a settled transaction");
                    continue;
                };
                if !txn.trigger_state.fire_fence(fd, status) {
                    continue;
                }
                match txn.trigger_state.decision() {
                    TriggerDecision::Pending => {}
                    TriggerDecision::Run => {
                        if let Some(txn) = pending.remove(id) {
                            process_queue.push_back(txn);
                            ready = true;
                        }
                    }
                    TriggerDecision::Cancel(code) => {
                        if let Some(mut txn) = pending.remove(id) {
                            txn.resp.error_code = if code == 0 { CANCELLATION_CODE } else { code };
                            canceled.push(txn);
                        }
                    }
                }
            }
        }
        for txn in canceled {
            self.finish_canceled(txn);
        }
        if ready {
            self.schedule();
        }
    }

    /// Cancels every waiting transaction and waits for in-flight work.
    pub(crate) async fn flush_transactions(&self) {
        let canceled: Vec<Transaction> = {
            let mut st = lock(&self.txn);
            st.event_buckets.clear();
            let pending: Vec<TransactionId> = st.pending.keys().copied().collect();
            let mut out = Vec::with_capacity(pending.len());
            for id in pending {
                if let Some(mut txn) = st.pending.remove(&id) {
                    txn.resp.error_code = CANCELLATION_CODE;
                    out.push(txn);
                }
            }
            for txn in st.process_queue.iter_mut() {
                if txn.resp.error_code == 0 {
                    txn.resp.error_code = CANCELLATION_CODE;
                }
            }
            out
        };
        for txn in canceled {
            self.finish_canceled(txn);
        }
        self.drain_ready().await;
    }

    // ------------------------------------------------------------------
    // Periodic-I/O
    // ------------------------------------------------------------------

    /// Registers a periodic program. The first registration for a period
    /// starts that period's timer.
    pub fn submit_periodic_io(&self, mut info: PeriodicIoInfo) -> Result<PeriodicIoId> {
        self.device.register_io()?;
        if info.period_ns == 0 {
            return Err(Error::InvalidArg("periodic io period must be non-zero".into()));
        }
        info.entries = io_entry::copy_entries(&info.entries)?;
        io_entry::response_size(&info.entries, self.device.native_value_bitwidth())?;
        if info.emit_success_event_id != EVENT_ID_NONE {
            self.ensure_completion_event_flags(info.emit_success_event_id, false)?;
        }
        if info.emit_error_event_id != EVENT_ID_NONE {
            self.ensure_completion_event_flags(info.emit_error_event_id, true)?;
        }

        let mut st = lock(&self.periodic);
        let id = st.counter;
        st.counter += 1;
        info.id = id;
        let period_ns = info.period_ns;
        let entries = Arc::new(info.entries.clone());
        st.entries.insert(
            id,
            PeriodicEntry {
                info,
                entries,
                pending_results: Vec::new(),
                active: true,
            },
        );
        match st.timers.get_mut(&period_ns) {
            Some(timer) => timer.members += 1,
            None => {
                let cancel = self.shutdown.child_token();
                self.spawn_period_timer(period_ns, cancel.clone());
                st.timers.insert(period_ns, PeriodicTimer { cancel, members: 1 });
            }
        }
        debug!(client = self.id, periodic = id, period_ns, "periodic io submitted");
        Ok(id)
    }

    /// Cancels a periodic registration and flushes any queued tick for it.
    /// The last registration for a period stops the timer.
    pub fn cancel_periodic_io(&self, id: PeriodicIoId) -> Result<()> {
        let mut st = lock(&self.periodic);
        let entry = st.entries.remove(&id).ok_or(Error::NotFound)?;
        st.run_queue.retain(|queued| *queued != id);
        let period_ns = entry.info.period_ns;
        if let Some(timer) = st.timers.get_mut(&period_ns) {
            timer.members -= 1;
            if timer.members == 0 {
                timer.cancel.cancel();
                st.timers.remove(&period_ns);
            }
        }
        Ok(())
    }

    fn spawn_period_timer(&self, period_ns: u64, cancel: CancellationToken) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_nanos(period_ns));
            // Delayed ticks: consecutive executions are never closer than
            // the period, even after a slow run.
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The interval's first tick fires immediately; the first
            // execution belongs one period out.
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    _ = interval.tick() => {
                        let Some(client) = weak.upgrade() else { break };
                        client.queue_periodic_tick(period_ns);
                    }
                }
            }
        });
    }

    fn queue_periodic_tick(&self, period_ns: u64) {
        let mut queued = false;
        {
            let mut st = lock(&self.periodic);
            let PeriodicState {
                entries, run_queue, ..
            } = &mut *st;
            let mut ids: Vec<PeriodicIoId> = entries
                .iter()
                .filter(|(_, e)| e.active && e.info.period_ns == period_ns)
                .map(|(id, _)| *id)
                .collect();
            ids.sort_unstable();
            for id in ids {
                run_queue.push_back(id);
                queued = true;
            }
        }
        if queued {
            self.schedule();
        }
    }

    /// Drops queued periodic work and waits for the in-flight tick.
    pub(crate) async fn flush_periodic(&self) {
        lock(&self.periodic).run_queue.clear();
        let _guard = self.drain_lock.lock().await;
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    pub fn enroll_buffer(&self, dma_fd: i32, flags: u32) -> Result<EnrolledBuffer> {
        lock(&self.buffers).enroll(dma_fd, flags)
    }

    pub fn disenroll_buffer(&self, handle: u64) -> Result<()> {
        lock(&self.buffers).disenroll(handle)
    }

    pub fn alloc_buffer(&self, size: usize, flags: u32) -> Result<AllocatedBuffer> {
        lock(&self.buffers).alloc(size, flags)
    }

    pub fn free_buffer(&self, handle: u64) -> Result<()> {
        lock(&self.buffers).free(handle)
    }

    pub fn buffer_cpu_access(&self, handle: u64, offset: usize, len: usize) -> Result<()> {
        lock(&self.buffers).cpu_access(handle, offset, len)
    }

    // ------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------

    /// Drains ready work: cleanup first, then transactions, then periodic
    /// ticks. The drain mutex is held for the whole pass and thereby across
    /// each single execution.
    pub(crate) async fn drain_ready(&self) {
        let _guard = self.drain_lock.lock().await;

        // Cleanup pass: canceled and errored transactions leave the queue
        // before any ready work runs.
        loop {
            let next = {
                let mut st = lock(&self.txn);
                match st
                    .process_queue
                    .iter()
                    .position(|t| t.resp.error_code != 0)
                {
                    Some(index) => st.process_queue.remove(index),
                    None => None,
                }
            };
            match next {
                Some(txn) => self.finish_canceled(txn),
                None => break,
            }
        }

        // Ready transactions in submission order.
        loop {
            let next = { lock(&self.txn).process_queue.pop_front() };
            let Some(txn) = next else { break };
            if txn.resp.error_code != 0 {
                self.finish_canceled(txn);
            } else {
                self.execute_transaction(txn).await;
            }
        }

        // Periodic ticks in submission order.
        loop {
            let next = { lock(&self.periodic).run_queue.pop_front() };
            let Some(id) = next else { break };
            self.execute_periodic(id).await;
        }
    }

    async fn execute_transaction(&self, mut txn: Transaction) {
        *lock(&self.running) = Some(RunningTxn {
            id: txn.info.id,
            cancel: txn.cancel.clone(),
        });
        let result = executor::run_program(
            &self.device,
            &txn.info.entries,
            &mut txn.resp,
            Some(&txn.cancel),
            false,
        )
        .await;
        *lock(&self.running) = None;

        let elapsed_ns = self.clock.now_ns() - txn.submitted_ns;
        match &result {
            Ok(()) => debug!(
                client = self.id,
                txn = txn.info.id,
                elapsed_ns,
                "transaction completed"
            ),
            Err(e) => warn!(
                client = self.id,
                txn = txn.info.id,
                elapsed_ns,
                error = %e,
                "transaction failed"
            ),
        }

        let failed = txn.resp.error_code != 0;
        self.emit_completion_event(&txn, failed);
        self.signal_completion_fences(&txn, txn.resp.error_code);
    }

    async fn execute_periodic(&self, id: PeriodicIoId) {
        let (entries, info) = {
            let st = lock(&self.periodic);
            let Some(entry) = st.entries.get(&id) else {
                return;
            };
            if !entry.active {
                return;
            }
            (Arc::clone(&entry.entries), entry.info.clone())
        };

        let mut resp = TransactionResponse::new(id);
        let _ = executor::run_program(&self.device, &entries, &mut resp, None, false).await;

        let emission = {
            let mut st = lock(&self.periodic);
            let Some(entry) = st.entries.get_mut(&id) else {
                // Canceled while running; the results are dropped.
                return;
            };
            if resp.error_code != 0 {
                Some((info.emit_error_event_id, resp.encode()))
            } else {
                entry.pending_results.push(resp);
                if entry.pending_results.len() as u32 >= info.batch_size.max(1) {
                    let batch = std::mem::take(&mut entry.pending_results);
                    Some((info.emit_success_event_id, periodic::encode_batch(&batch)))
                } else {
                    None
                }
            }
        };
        if let Some((event_id, payload)) = emission {
            if event_id != EVENT_ID_NONE {
                self.device.emit_event(event_id, payload);
            }
        }
    }

    /// Terminal path for a transaction that will not execute: emits the
    /// error event and forwards the status to its completion fences.
    fn finish_canceled(&self, txn: Transaction) {
        debug!(
            client = self.id,
            txn = txn.info.id,
            code = txn.resp.error_code,
            trigger_fences = txn.trigger_fences.len(),
            "transaction canceled"
        );
        self.emit_completion_event(&txn, true);
        self.signal_completion_fences(&txn, txn.resp.error_code);
    }

    fn emit_completion_event(&self, txn: &Transaction, failed: bool) {
        let event_id = if failed {
            txn.info.emit_error_event_id
        } else {
            txn.info.emit_success_event_id
        };
        if event_id == EVENT_ID_NONE {
            return;
        }
        self.device.emit_event(event_id, txn.resp.encode());
    }

    fn signal_completion_fences(&self, txn: &Transaction, status: i32) {
        for fence in &txn.completion_fences {
            match self.fences.signal(fence.fd(), status) {
                Ok(()) => {}
                Err(Error::AlreadySignaled) => warn!(
                    fd = fence.fd(),
                    "completion fence was already signaled"
                ),
                Err(e) => warn!(fd = fence.fd(), error = %e, "completion fence signal failed"),
            }
        }
    }

    /// Number of transactions waiting on triggers. Introspection for tests
    /// and tooling.
    pub fn pending_transaction_count(&self) -> usize {
        lock(&self.txn).pending.len()
    }

    /// Number of periodic registrations currently active.
    pub fn periodic_io_count(&self) -> usize {
        lock(&self.periodic).entries.len()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("device", &self.device.name())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
