//! Fences: shareable, signal-once status handles.
//!
//! A fence is addressed by a small integer descriptor, carries a status that
//! transitions exactly once from unsignaled to a final code (0 ok, non-zero
//! error), and keeps per-client buckets of transaction ids waiting on it.
//! Signaling wakes every waiter and hands the buckets to the trigger engine.
//!
//! Descriptors are refcounted in the [`FenceTable`]; dropping the last
//! reference to a fence that never signaled is a client-side bug, logged as
//! such, and the runtime signals the waiters with the cancellation code so
//! nothing waits forever.

use crate::client::Client;
use crate::error::{Error, Result, CANCELLATION_CODE};
use crate::transaction::TransactionId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Descriptor addressing a fence in a [`FenceTable`].
pub type FenceFd = i32;

/// Status of a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Unsignaled,
    Signaled(i32),
}

impl FenceStatus {
    pub fn is_signaled(&self) -> bool {
        matches!(self, FenceStatus::Signaled(_))
    }

    /// The final code, if signaled.
    pub fn code(&self) -> Option<i32> {
        match self {
            FenceStatus::Unsignaled => None,
            FenceStatus::Signaled(code) => Some(*code),
        }
    }
}

/// Outcome of registering a transaction against a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AddTransactionOutcome {
    /// The transaction now waits on this fence.
    Added,
    /// The fence already signaled ok; the predicate is already satisfied.
    AlreadySignaledOk,
    /// The fence already signaled with an error; the transaction is to be
    /// canceled with that code.
    AlreadySignaledErr(i32),
}

/// One client's list of transaction ids waiting on a fence.
pub(crate) struct FenceBucket {
    pub client: Weak<Client>,
    pub txn_ids: Vec<TransactionId>,
}

struct FenceInner {
    status: FenceStatus,
    buckets: Vec<(u64, FenceBucket)>,
}

/// A signal-once status handle shareable across clients.
pub struct Fence {
    fd: FenceFd,
    inner: Mutex<FenceInner>,
    status_tx: watch::Sender<FenceStatus>,
}

impl Fence {
    fn new(fd: FenceFd) -> Arc<Self> {
        let (status_tx, _) = watch::channel(FenceStatus::Unsignaled);
        Arc::new(Self {
            fd,
            inner: Mutex::new(FenceInner {
                status: FenceStatus::Unsignaled,
                buckets: Vec::new(),
            }),
            status_tx,
        })
    }

    pub fn fd(&self) -> FenceFd {
        self.fd
    }

    /// Non-blocking status read.
    pub fn status(&self) -> FenceStatus {
        crate::sync::lock(&self.inner).status
    }

    /// Poll analog: readable once signaled.
    pub fn is_ready(&self) -> bool {
        self.status().is_signaled()
    }

    /// Waits until the fence signals and returns the final code.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.status_tx.subscribe();
        loop {
            if let FenceStatus::Signaled(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return CANCELLATION_CODE;
            }
        }
    }

    /// Registers a transaction as waiting on this fence.
    pub(crate) fn add_transaction(
        &self,
        client: &Arc<Client>,
        txn_id: TransactionId,
    ) -> AddTransactionOutcome {
        let mut inner = crate::sync::lock(&self.inner);
        match inner.status {
            FenceStatus::Signaled(0) => AddTransactionOutcome::AlreadySignaledOk,
            FenceStatus::Signaled(code) => AddTransactionOutcome::AlreadySignaledErr(code),
            FenceStatus::Unsignaled => {
                let client_id = client.id();
                match inner.buckets.iter_mut().find(|(id, _)| *id == client_id) {
                    Some((_, bucket)) => bucket.txn_ids.push(txn_id),
                    None => inner.buckets.push((
                        client_id,
                        FenceBucket {
                            client: Arc::downgrade(client),
                            txn_ids: vec![txn_id],
                        },
                    )),
                }
                AddTransactionOutcome::Added
            }
        }
    }

    /// Transitions the status and drains the buckets for dispatch. Fails
    /// with `AlreadySignaled` if the status is final.
    fn take_signal(&self, status: i32) -> Result<Vec<FenceBucket>> {
        let buckets = {
            let mut inner = crate::sync::lock(&self.inner);
            if inner.status.is_signaled() {
                return Err(Error::AlreadySignaled);
            }
            inner.status = FenceStatus::Signaled(status);
            std::mem::take(&mut inner.buckets)
        };
        let _ = self.status_tx.send(FenceStatus::Signaled(status));
        Ok(buckets.into_iter().map(|(_, bucket)| bucket).collect())
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("fd", &self.fd)
            .field("status", &self.status())
            .finish()
    }
}

struct FenceSlot {
    fence: Arc<Fence>,
    refs: usize,
}

/// Descriptor table mapping fds to refcounted fences.
pub struct FenceTable {
    fences: DashMap<FenceFd, FenceSlot>,
    next_fd: AtomicI32,
}

impl FenceTable {
    pub fn new() -> Self {
        Self {
            fences: DashMap::new(),
            next_fd: AtomicI32::new(1),
        }
    }

    /// Creates a fence and returns its descriptor with one reference held.
    pub fn create(&self) -> (FenceFd, Arc<Fence>) {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        let fence = Fence::new(fd);
        self.fences.insert(
            fd,
            FenceSlot {
                fence: Arc::clone(&fence),
                refs: 1,
            },
        );
        debug!(fd, "created fence");
        (fd, fence)
    }

    pub fn get(&self, fd: FenceFd) -> Result<Arc<Fence>> {
        self.fences
            .get(&fd)
            .map(|slot| Arc::clone(&slot.fence))
            .ok_or(Error::BadFd(fd))
    }

    /// Takes an additional reference on a descriptor (sharing across
    /// clients).
    pub fn retain(&self, fd: FenceFd) -> Result<()> {
        let mut slot = self.fences.get_mut(&fd).ok_or(Error::BadFd(fd))?;
        slot.refs += 1;
        Ok(())
    }

    /// Drops one reference. The last drop of an unsignaled fence is a logged
    /// client bug; waiters and dependents are released with the cancellation
    /// code so they do not hang.
    pub fn close(&self, fd: FenceFd) -> Result<()> {
        let fence = {
            let mut slot = self.fences.get_mut(&fd).ok_or(Error::BadFd(fd))?;
            slot.refs -= 1;
            if slot.refs > 0 {
                return Ok(());
            }
            Arc::clone(&slot.fence)
        };
        self.fences.remove(&fd);
        if !fence.status().is_signaled() {
            error!(fd, "fence released without being signaled");
            if let Ok(buckets) = fence.take_signal(CANCELLATION_CODE) {
                dispatch_buckets(fd, CANCELLATION_CODE, buckets);
            }
        }
        Ok(())
    }

    /// Signals a fence, waking waiters and re-evaluating every dependent
    /// transaction. Signaling an already-signaled fence is an observable
    /// error and leaves the original status in place.
    pub fn signal(&self, fd: FenceFd, status: i32) -> Result<()> {
        let fence = self.get(fd)?;
        let buckets = fence.take_signal(status)?;
        debug!(fd, status, "fence signaled");
        dispatch_buckets(fd, status, buckets);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}

impl Default for FenceTable {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch_buckets(fd: FenceFd, status: i32, buckets: Vec<FenceBucket>) {
    for bucket in buckets {
        match bucket.client.upgrade() {
            Some(client) => client.fence_trigger(fd, status, &bucket.txn_ids),
            None => warn!(fd, "fence bucket for a client that went away"),
        }
    }
}
