//! Trigger conditions: boolean combinations of event and fence predicates.
//!
//! A trigger condition gates a transaction. Each node is either an
//! event-counter predicate, a fence predicate, or a placeholder asking the
//! runtime to mint a fresh fence at submit time. Readiness is a three-valued
//! decision: still pending, ready to run, or ready to cancel with a status
//! code (a fence that signals with an error under AND cancels the transaction
//! without executing it).

use crate::error::{Error, Result};
use crate::event::EventId;
use crate::fence::FenceFd;
use serde::{Deserialize, Serialize};

/// Maximum number of nodes in one condition.
pub const MAX_TRIGGER_NODES: usize = 16;

/// Boolean operator combining the nodes of a condition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerOp {
    /// No condition: the transaction executes immediately at submit.
    #[default]
    None,
    /// Every node must fire successfully; a fence error cancels.
    And,
    /// The first successful node fires the transaction; exhaustion with no
    /// success cancels.
    Or,
}

/// One predicate inside a condition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerNode {
    /// Fires when the device emits `event_id` with the given counter value.
    /// A counter of 0 fires on the next occurrence regardless of count.
    Event { event_id: EventId, counter: i64 },
    /// Fires when the fence behind `fd` signals.
    Fence { fd: FenceFd },
    /// Placeholder: the runtime creates a fence at submit time, substitutes
    /// its descriptor here, and returns it in the submit result.
    NewFence,
}

/// A complete trigger condition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub op: TriggerOp,
    pub nodes: Vec<TriggerNode>,
}

impl TriggerCondition {
    /// A condition that executes immediately at submit.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all_of(nodes: Vec<TriggerNode>) -> Self {
        Self {
            op: TriggerOp::And,
            nodes,
        }
    }

    pub fn any_of(nodes: Vec<TriggerNode>) -> Self {
        Self {
            op: TriggerOp::Or,
            nodes,
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.op, TriggerOp::None)
    }

    pub fn validate(&self) -> Result<()> {
        match self.op {
            TriggerOp::None => {
                if !self.nodes.is_empty() {
                    return Err(Error::InvalidArg(
                        "trigger nodes given without an operator".into(),
                    ));
                }
            }
            TriggerOp::And | TriggerOp::Or => {
                if self.nodes.is_empty() {
                    return Err(Error::InvalidArg("empty trigger condition".into()));
                }
                if self.nodes.len() > MAX_TRIGGER_NODES {
                    return Err(Error::InvalidArg(format!(
                        "trigger condition exceeds {MAX_TRIGGER_NODES} nodes"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-node firing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
    Waiting,
    FiredOk,
    FiredErr(i32),
}

/// Readiness decision for a parsed condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerDecision {
    Pending,
    Run,
    Cancel(i32),
}

/// Firing state of one transaction's condition.
///
/// Nodes are fixed at parse time (placeholders already substituted); firing
/// marks nodes and the decision derives from the operator.
#[derive(Debug)]
pub(crate) struct TriggerState {
    op: TriggerOp,
    nodes: Vec<TriggerNode>,
    states: Vec<NodeState>,
}

impl TriggerState {
    pub fn new(condition: &TriggerCondition) -> Self {
        Self {
            op: condition.op,
            nodes: condition.nodes.clone(),
            states: vec![NodeState::Waiting; condition.nodes.len()],
        }
    }

    /// Marks a node as already satisfied at parse time (fence signaled ok
    /// before submit, or a level-triggered event counter that already
    /// matched).
    pub fn prefire(&mut self, index: usize) {
        if let Some(state) = self.states.get_mut(index) {
            *state = NodeState::FiredOk;
        }
    }

    /// Marks a fence node as already failed at parse time.
    pub fn prefire_error(&mut self, index: usize, status: i32) {
        if let Some(state) = self.states.get_mut(index) {
            *state = NodeState::FiredErr(status);
        }
    }

    /// Attempts to fire one waiting event node matching this emission.
    /// Returns whether a node fired.
    pub fn fire_event(&mut self, event_id: EventId, emitted_counter: i64) -> bool {
        for (node, state) in self.nodes.iter().zip(self.states.iter_mut()) {
            if *state != NodeState::Waiting {
                continue;
            }
            if let TriggerNode::Event {
                event_id: node_id,
                counter,
            } = node
            {
                if *node_id == event_id && (*counter == 0 || *counter == emitted_counter) {
                    *state = NodeState::FiredOk;
                    return true;
                }
            }
        }
        false
    }

    /// Attempts to fire one waiting fence node for this descriptor.
    /// Returns whether a node fired.
    pub fn fire_fence(&mut self, fd: FenceFd, status: i32) -> bool {
        for (node, state) in self.nodes.iter().zip(self.states.iter_mut()) {
            if *state != NodeState::Waiting {
                continue;
            }
            if let TriggerNode::Fence { fd: node_fd } = node {
                if *node_fd == fd {
                    *state = if status == 0 {
                        NodeState::FiredOk
                    } else {
                        NodeState::FiredErr(status)
                    };
                    return true;
                }
            }
        }
        false
    }

    pub fn decision(&self) -> TriggerDecision {
        match self.op {
            TriggerOp::None => TriggerDecision::Run,
            TriggerOp::And => {
                for state in &self.states {
                    if let NodeState::FiredErr(code) = state {
                        return TriggerDecision::Cancel(*code);
                    }
                }
                if self.states.iter().all(|s| *s == NodeState::FiredOk) {
                    TriggerDecision::Run
                } else {
                    TriggerDecision::Pending
                }
            }
            TriggerOp::Or => {
                if self.states.iter().any(|s| *s == NodeState::FiredOk) {
                    return TriggerDecision::Run;
                }
                let mut last_err = None;
                for state in &self.states {
                    match state {
                        NodeState::Waiting => return TriggerDecision::Pending,
                        NodeState::FiredErr(code) => last_err = Some(*code),
                        NodeState::FiredOk => {}
                    }
                }
                TriggerDecision::Cancel(last_err.unwrap_or(0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_id: EventId, counter: i64) -> TriggerNode {
        TriggerNode::Event { event_id, counter }
    }

    fn fence(fd: FenceFd) -> TriggerNode {
        TriggerNode::Fence { fd }
    }

    #[test]
    fn validate_bounds_node_count() {
        let condition = TriggerCondition::all_of(vec![event(1, 0); MAX_TRIGGER_NODES + 1]);
        assert!(condition.validate().is_err());
        let condition = TriggerCondition::all_of(vec![event(1, 0); MAX_TRIGGER_NODES]);
        assert!(condition.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_combinations() {
        assert!(TriggerCondition::all_of(vec![]).validate().is_err());
        assert!(TriggerCondition::none().validate().is_ok());
    }

    #[test]
    fn and_runs_only_after_every_node() {
        let condition = TriggerCondition::all_of(vec![event(42, 3), fence(5)]);
        let mut state = TriggerState::new(&condition);

        assert!(!state.fire_event(42, 1));
        assert!(!state.fire_event(42, 2));
        assert_eq!(state.decision(), TriggerDecision::Pending);

        assert!(state.fire_fence(5, 0));
        assert_eq!(state.decision(), TriggerDecision::Pending);

        assert!(state.fire_event(42, 3));
        assert_eq!(state.decision(), TriggerDecision::Run);
    }

    #[test]
    fn and_cancels_on_first_fence_error() {
        let condition = TriggerCondition::all_of(vec![fence(9), event(7, 1)]);
        let mut state = TriggerState::new(&condition);

        assert!(state.fire_fence(9, -5));
        assert_eq!(state.decision(), TriggerDecision::Cancel(-5));
    }

    #[test]
    fn or_runs_on_first_success() {
        let condition = TriggerCondition::any_of(vec![fence(1), fence(2)]);
        let mut state = TriggerState::new(&condition);

        assert!(state.fire_fence(1, 0));
        assert_eq!(state.decision(), TriggerDecision::Run);
    }

    #[test]
    fn or_cancels_on_exhaustion_without_success() {
        let condition = TriggerCondition::any_of(vec![fence(1), fence(2)]);
        let mut state = TriggerState::new(&condition);

        assert!(state.fire_fence(1, -3));
        assert_eq!(state.decision(), TriggerDecision::Pending);
        assert!(state.fire_fence(2, -4));
        assert_eq!(state.decision(), TriggerDecision::Cancel(-4));
    }

    #[test]
    fn counter_zero_matches_any_emission() {
        let condition = TriggerCondition::all_of(vec![event(11, 0)]);
        let mut state = TriggerState::new(&condition);
        assert!(state.fire_event(11, 57));
        assert_eq!(state.decision(), TriggerDecision::Run);
    }

    #[test]
    fn each_record_fires_at_most_one_node() {
        let condition = TriggerCondition::all_of(vec![event(4, 0), event(4, 0)]);
        let mut state = TriggerState::new(&condition);
        assert!(state.fire_event(4, 1));
        assert_eq!(state.decision(), TriggerDecision::Pending);
        assert!(state.fire_event(4, 2));
        assert_eq!(state.decision(), TriggerDecision::Run);
    }

    #[test]
    fn prefire_counts_toward_readiness() {
        let condition = TriggerCondition::all_of(vec![fence(3), event(1, 0)]);
        let mut state = TriggerState::new(&condition);
        state.prefire(0);
        assert_eq!(state.decision(), TriggerDecision::Pending);
        assert!(state.fire_event(1, 1));
        assert_eq!(state.decision(), TriggerDecision::Run);
    }
}
