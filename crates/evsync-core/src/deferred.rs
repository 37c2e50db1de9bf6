//! Hub calls held while disconnected.
//!
//! Replayed in FIFO order once the link is up, after conversations have been
//! re-joined. Membership itself never goes through here; only calls that
//! carry payload (messages, typing signals, group joins) do.
//!
//! Bounded. Typing signals collapse to the latest one per conversation, and
//! when the queue is full a typing signal is dropped before anything else.

use std::collections::VecDeque;

use evsync_proto::{ConversationId, HubInvocation};
use tracing::debug;

/// Default queue bound.
pub const DEFAULT_DEFERRED_CAPACITY: usize = 256;

/// Bounded FIFO of deferred hub calls.
#[derive(Debug, Clone)]
pub struct DeferredQueue {
    ops: VecDeque<HubInvocation>,
    capacity: usize,
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DEFERRED_CAPACITY)
    }
}

impl DeferredQueue {
    /// Create a queue holding at most `capacity` calls.
    pub fn new(capacity: usize) -> Self {
        Self { ops: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Append a call. Returns the entry dropped to make room, if any.
    ///
    /// A typing signal replaces any earlier one for the same conversation.
    pub fn push(&mut self, op: HubInvocation) -> Option<HubInvocation> {
        if let Some(conversation) = typing_target(&op)
            && let Some(index) = self.ops.iter().position(|queued| {
                typing_target(queued) == Some(conversation)
            })
        {
            debug!(%conversation, "replacing deferred typing signal");
            self.ops.remove(index);
        }

        let dropped = if self.ops.len() >= self.capacity { self.evict() } else { None };
        self.ops.push_back(op);
        dropped
    }

    /// Take every call in FIFO order.
    pub fn drain(&mut self) -> Vec<HubInvocation> {
        self.ops.drain(..).collect()
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drop everything (session disposed).
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Oldest typing signal first, else the oldest call.
    fn evict(&mut self) -> Option<HubInvocation> {
        match self.ops.iter().position(|queued| typing_target(queued).is_some()) {
            Some(index) => self.ops.remove(index),
            None => self.ops.pop_front(),
        }
    }
}

fn typing_target(op: &HubInvocation) -> Option<ConversationId> {
    match op {
        HubInvocation::NotifyTyping { conversation, .. } => Some(*conversation),
        _ => None,
    }
}
