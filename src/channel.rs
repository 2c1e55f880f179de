//! Named topic subscriptions multiplexed over one socket.
//!
//! A channel is a join/leave state machine plus its event bindings and its
//! outstanding pushes. Channels never touch the wire themselves; the
//! [`Socket`](crate::socket::Socket) owns the registry and drives every
//! transition, so channel methods here only mutate local state.
//!
//! State machine:
//!
//! ```text
//! closed ──join──▶ joining ──ok reply──▶ joined ──leave──▶ leaving ──▶ closed
//!    ▲                │                     │
//!    │                └──error/loss──▶ errored ──rejoin timer──▶ joining
//!    └───────────────────────────────────── phx_close / leave ok
//! ```
//!
//! Every join attempt gets a fresh `join_ref`; inbound envelopes carrying a
//! stale `join_ref` for the topic are discarded at dispatch.

use crate::message::Message;
use crate::push::Push;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Handle to a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) u64);

/// Handle to a push on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushId(pub(crate) u64);

/// The join push reuses a reserved id so its timeout timer can be addressed
/// like any other push's.
pub(crate) const JOIN_PUSH_ID: PushId = PushId(0);

/// Removal token returned by [`Channel::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingRef(u64);

/// Callback invoked with an event's payload.
pub type EventHook = Box<dyn FnMut(&Value)>;

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not joined; the initial state and the terminal one after leaving.
    Closed,
    /// Join request in flight.
    Joining,
    /// Join acknowledged; pushes flow.
    Joined,
    /// Leave request in flight.
    Leaving,
    /// Lost the server side; a rejoin is scheduled.
    Errored,
}

struct Binding {
    binding_ref: BindingRef,
    event: String,
    hook: EventHook,
}

/// One topic subscription.
pub struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) topic: String,
    pub(crate) state: ChannelState,
    pub(crate) params: Value,
    pub(crate) timeout: Duration,
    pub(crate) join_push: Push,
    /// Whether a join was ever attempted. Pushing before that is an error.
    pub(crate) joined_once: bool,
    /// Consecutive failed rejoin attempts, for backoff. Reset on join ok.
    pub(crate) rejoin_tries: u32,
    pushes: HashMap<PushId, Push>,
    /// Push ids awaiting join success, oldest first.
    buffer: Vec<PushId>,
    bindings: Vec<Binding>,
    next_push_id: u64,
    next_binding_ref: u64,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, topic: String, params: Value, timeout: Duration) -> Self {
        let join_push = Push::new(crate::message::events::JOIN, params.clone(), timeout);
        Self {
            id,
            topic,
            state: ChannelState::Closed,
            params,
            timeout,
            join_push,
            joined_once: false,
            rejoin_tries: 0,
            pushes: HashMap::new(),
            buffer: Vec::new(),
            bindings: Vec::new(),
            next_push_id: 0,
            next_binding_ref: 0,
        }
    }

    /// The topic this channel is subscribed to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The join ref of the current join epoch, if a join was attempted.
    pub fn join_ref(&self) -> Option<&str> {
        self.join_push.msg_ref.as_deref()
    }

    /// Whether pushes go straight to the wire rather than the buffer.
    pub(crate) fn can_push(&self) -> bool {
        self.state == ChannelState::Joined
    }

    /// Whether an inbound envelope belongs to this channel's current epoch.
    ///
    /// Envelopes for the topic that carry a different `join_ref` are replies
    /// and broadcasts from a superseded join; they are dropped.
    pub(crate) fn is_member(&self, message: &Message) -> bool {
        if message.topic != self.topic {
            return false;
        }
        match (&message.join_ref, self.join_ref()) {
            (Some(incoming), Some(current)) if incoming != current => {
                tracing::debug!(
                    topic = %self.topic,
                    stale = %incoming,
                    current = %current,
                    "dropping message from superseded join epoch"
                );
                false
            }
            _ => true,
        }
    }

    // ------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------

    /// Register `hook` for `event`. Hooks for the same event fire in
    /// registration order.
    pub fn on(&mut self, event: impl Into<String>, hook: EventHook) -> BindingRef {
        self.next_binding_ref += 1;
        let binding_ref = BindingRef(self.next_binding_ref);
        self.bindings.push(Binding {
            binding_ref,
            event: event.into(),
            hook,
        });
        binding_ref
    }

    /// Remove every hook registered for `event`.
    pub fn off(&mut self, event: &str) {
        self.bindings.retain(|binding| binding.event != event);
    }

    /// Remove the single hook identified by `binding_ref`.
    pub fn off_ref(&mut self, binding_ref: BindingRef) {
        self.bindings
            .retain(|binding| binding.binding_ref != binding_ref);
    }

    pub(crate) fn clear_bindings(&mut self) {
        self.bindings.clear();
    }

    /// Invoke every hook bound to `event` with `payload`.
    pub(crate) fn trigger(&mut self, event: &str, payload: &Value) {
        for binding in &mut self.bindings {
            if binding.event == event {
                (binding.hook)(payload);
            }
        }
    }

    // ------------------------------------------------------------------
    // Pushes
    // ------------------------------------------------------------------

    /// Store a new push; if the channel is not yet joined it also lands in
    /// the FIFO buffer.
    pub(crate) fn add_push(&mut self, push: Push) -> (PushId, bool) {
        self.next_push_id += 1;
        let id = PushId(self.next_push_id);
        let buffered = !self.can_push();
        if buffered {
            self.buffer.push(id);
        }
        self.pushes.insert(id, push);
        (id, buffered)
    }

    pub(crate) fn push(&self, id: PushId) -> Option<&Push> {
        if id == JOIN_PUSH_ID {
            Some(&self.join_push)
        } else {
            self.pushes.get(&id)
        }
    }

    pub(crate) fn push_mut(&mut self, id: PushId) -> Option<&mut Push> {
        if id == JOIN_PUSH_ID {
            Some(&mut self.join_push)
        } else {
            self.pushes.get_mut(&id)
        }
    }

    /// Find the live push whose current incarnation was sent with `msg_ref`.
    pub(crate) fn push_by_ref(&self, msg_ref: &str) -> Option<PushId> {
        if self.join_push.msg_ref.as_deref() == Some(msg_ref) {
            return Some(JOIN_PUSH_ID);
        }
        self.pushes
            .iter()
            .find(|(_, push)| push.msg_ref.as_deref() == Some(msg_ref))
            .map(|(id, _)| *id)
    }

    /// Drain the buffered push ids, oldest first.
    pub(crate) fn drain_buffer(&mut self) -> Vec<PushId> {
        std::mem::take(&mut self.buffer)
    }

    /// Ids of pushes whose current incarnation went on the wire and has not
    /// resolved.
    pub(crate) fn outstanding_sent(&self) -> Vec<PushId> {
        self.pushes
            .iter()
            .filter(|(_, push)| push.sent && !push.is_resolved())
            .map(|(id, _)| *id)
            .collect()
    }

    /// All non-join push ids.
    pub(crate) fn all_push_ids(&self) -> Vec<PushId> {
        self.pushes.keys().copied().collect()
    }

    /// Drop every non-join push and the buffer.
    pub(crate) fn clear_pushes(&mut self) {
        self.pushes.clear();
        self.buffer.clear();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("state", &self.state)
            .field("join_ref", &self.join_ref())
            .field("pushes", &self.pushes.len())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
