//! Transactions: deferred register programs with trigger and completion
//! metadata.
//!
//! The submit/cancel/execute machinery lives on
//! [`Client`](crate::client::Client); this module holds the user-facing info
//! types and the runtime-internal transaction record.

use crate::event::{EventId, EVENT_ID_NONE};
use crate::fence::{Fence, FenceFd};
use crate::io_entry::{IoEntry, TransactionResponse};
use crate::trigger::{TriggerCondition, TriggerState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identifier of a transaction within one client.
pub type TransactionId = i64;

/// Returned through the command channel when a submit fails.
pub const INVALID_TRANSACTION_ID: TransactionId = -1;

/// User-facing description of a transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Assigned by the runtime at submit. On `TransactionReplace` this names
    /// the transaction to supersede.
    pub id: TransactionId,
    /// Condition gating execution; `TriggerCondition::none()` executes
    /// immediately.
    pub trigger: TriggerCondition,
    /// The ordered register program.
    pub entries: Vec<IoEntry>,
    /// Event emitted with the encoded response on success
    /// ([`EVENT_ID_NONE`] to skip).
    pub emit_success_event_id: EventId,
    /// Event emitted with the encoded response on error or cancellation.
    pub emit_error_event_id: EventId,
    /// Fences to signal with the final status when the transaction
    /// terminates.
    pub completion_fence_fds: Vec<FenceFd>,
    /// Ask the runtime to mint one completion fence and return its fd.
    pub create_completion_fence: bool,
    /// Convert an event-counter node whose counter already matched into an
    /// immediately-satisfied node instead of failing the submit.
    pub is_level_triggered: bool,
}

impl TransactionInfo {
    /// An immediate transaction carrying the given program.
    pub fn immediate(entries: Vec<IoEntry>) -> Self {
        Self {
            id: INVALID_TRANSACTION_ID,
            trigger: TriggerCondition::none(),
            entries,
            emit_success_event_id: EVENT_ID_NONE,
            emit_error_event_id: EVENT_ID_NONE,
            completion_fence_fds: Vec::new(),
            create_completion_fence: false,
            is_level_triggered: false,
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerCondition) -> Self {
        self.trigger = trigger;
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

    pub fn with_completion_fence(mut self, fd: FenceFd) -> Self {
        self.completion_fence_fds.push(fd);
        self
    }

    pub fn level_triggered(mut self) -> Self {
        self.is_level_triggered = true;
        self
    }
}

/// What a successful submit hands back to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionSubmitResult {
    pub id: TransactionId,
    /// Descriptors minted for `TriggerNode::NewFence` placeholders, in node
    /// order.
    pub trigger_fence_fds: Vec<FenceFd>,
    /// Descriptor of the completion fence minted for
    /// `create_completion_fence`.
    pub completion_fence_fd: Option<FenceFd>,
}

impl TransactionSubmitResult {
    /// The result reported through the command channel when a submit fails.
    pub fn invalid() -> Self {
        Self {
            id: INVALID_TRANSACTION_ID,
            trigger_fence_fds: Vec::new(),
            completion_fence_fd: None,
        }
    }
}

/// Runtime-internal record of a submitted transaction.
///
/// Owned by the client: while waiting it lives in the pending map (event
/// buckets and fence buckets hold only its id), and once ready it moves to
/// the process queue that drives execution and destruction.
pub(crate) struct Transaction {
    pub info: TransactionInfo,
    pub resp: TransactionResponse,
    pub trigger_state: TriggerState,
    /// Fences to signal at termination, resolved at submit.
    pub completion_fences: Vec<Arc<Fence>>,
    /// Trigger fences held alive for the lifetime of the transaction.
    pub trigger_fences: Vec<Arc<Fence>>,
    pub cancel: CancellationToken,
    pub submitted_ns: i64,
}

/// Non-owning registration of a transaction on one of its trigger events.
///
/// One record is added per event node; when the event fires, the engine finds
/// the owning transaction by id and removes the record it matched. Stale
/// records (the transaction already ran or was canceled) are dropped lazily.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WeakRecord {
    pub txn_id: TransactionId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{TriggerNode, TriggerOp};

    #[test]
    fn immediate_info_defaults() {
        let info = TransactionInfo::immediate(vec![IoEntry::Read { offset: 0 }]);
        assert_eq!(info.id, INVALID_TRANSACTION_ID);
        assert!(info.trigger.is_immediate());
        assert_eq!(info.emit_success_event_id, EVENT_ID_NONE);
        assert!(info.completion_fence_fds.is_empty());
    }

    #[test]
    fn builders_compose() {
        let info = TransactionInfo::immediate(vec![])
            .with_trigger(TriggerCondition::all_of(vec![TriggerNode::Fence { fd: 3 }]))
            .with_success_event(100)
            .with_error_event(101)
            .with_completion_fence(9)
            .level_triggered();
        assert_eq!(info.trigger.op, TriggerOp::And);
        assert_eq!(info.emit_success_event_id, 100);
        assert_eq!(info.emit_error_event_id, 101);
        assert_eq!(info.completion_fence_fds, vec![9]);
        assert!(info.is_level_triggered);
    }
}
