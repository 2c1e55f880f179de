//! The connection manager: one socket, many channels.
//!
//! `Socket` is a sans-IO state machine. Inputs are [`TransportEvent`]s and
//! [`tick`](Socket::tick); outputs are [`Effect`]s drained by a driver plus
//! user callbacks. It never performs IO and never awaits, so every protocol
//! rule here is testable with a [`ManualClock`](crate::timer::ManualClock)
//! and hand-scripted events.
//!
//! Responsibilities:
//!
//! - connection lifecycle (`connecting → open → closing → closed`)
//! - the monotonic ref counter shared by every push and heartbeat
//! - the channel registry and inbound demultiplexing by topic + join epoch
//! - the send buffer, replayed FIFO when the connection opens
//! - heartbeats on the reserved `"phoenix"` topic, with force-close when a
//!   heartbeat goes unanswered for a full interval
//! - push timeout and rejoin timers through the injected clock

use crate::backoff::Backoff;
use crate::channel::{
    BindingRef, Channel, ChannelId, ChannelState, EventHook, PushId, JOIN_PUSH_ID,
};
use crate::error::{ChannelError, SocketError};
use crate::message::{events, Message, Reply, CONTROL_TOPIC, VSN};
use crate::push::{Push, ReplyHook};
use crate::timer::{Clock, SystemClock, TimerKind, TimerQueue};
use crate::transport::{CloseEvent, TransportEvent};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A dial is in flight.
    Connecting,
    /// Frames flow.
    Open,
    /// A clean close was requested.
    Closing,
    /// No connection. Initial and post-close state.
    Closed,
}

/// Output produced by the state machine for the driver to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Dial a new connection.
    Connect {
        /// Fully assembled URL including vsn and params.
        url: String,
    },
    /// Write one envelope to the open connection.
    Send(Message),
    /// Close the connection.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Connect query parameters.
pub enum Params {
    /// A fixed set of pairs.
    List(Vec<(String, String)>),
    /// Recomputed on every connect attempt, e.g. to pick up a refreshed
    /// auth token between reconnects.
    Thunk(Box<dyn Fn() -> Vec<(String, String)>>),
}

impl Params {
    fn pairs(&self) -> Vec<(String, String)> {
        match self {
            Params::List(pairs) => pairs.clone(),
            Params::Thunk(thunk) => thunk(),
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::List(Vec::new())
    }
}

impl std::fmt::Debug for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Params::List(pairs) => f.debug_tuple("List").field(pairs).finish(),
            Params::Thunk(_) => f.write_str("Thunk"),
        }
    }
}

/// Socket construction options.
#[derive(Debug)]
pub struct SocketOptions {
    /// Default push and join timeout.
    pub timeout: Duration,
    /// Interval between heartbeats while open.
    pub heartbeat_interval: Duration,
    /// Backoff policy for channel rejoin attempts.
    pub rejoin_backoff: Backoff,
    /// Connect query parameters, merged after `vsn`.
    pub params: Params,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            rejoin_backoff: Backoff::rejoin(),
            params: Params::default(),
        }
    }
}

type OpenHook = Box<dyn FnMut()>;
type CloseHook = Box<dyn FnMut(&CloseEvent)>;
type ErrorHook = Box<dyn FnMut(&SocketError)>;
type MessageHook = Box<dyn FnMut(&Message)>;

/// The connection manager.
pub struct Socket<C: Clock = SystemClock> {
    endpoint: String,
    options: SocketOptions,
    state: ConnectionState,
    clock: C,
    timers: TimerQueue,
    effects: Vec<Effect>,
    channels: Vec<Channel>,
    next_channel_id: u64,
    ref_seq: u64,
    /// Envelopes queued while not open, replayed FIFO on open.
    send_buffer: Vec<Message>,
    /// Ref of the in-flight heartbeat; `Some` at the next interval means the
    /// server went silent.
    pending_heartbeat_ref: Option<String>,
    /// Exactly-once guard for close handling per connection.
    close_handled: bool,
    /// Set when `disconnect` initiated the close.
    clean_close: bool,
    /// Whether the last close should route into reconnection.
    reconnect_advised: bool,
    open_hooks: Vec<OpenHook>,
    close_hooks: Vec<CloseHook>,
    error_hooks: Vec<ErrorHook>,
    message_hooks: Vec<MessageHook>,
}

/// Render the next ref from the shared counter.
///
/// Free function so it can run while a channel is mutably borrowed.
fn next_ref(seq: &mut u64) -> String {
    *seq += 1;
    seq.to_string()
}

impl Socket<SystemClock> {
    /// Create a socket against `endpoint` using the system clock.
    pub fn new(endpoint: impl Into<String>, options: SocketOptions) -> Self {
        Self::with_clock(endpoint, options, SystemClock)
    }
}

impl<C: Clock> Socket<C> {
    /// Create a socket with an injected clock.
    pub fn with_clock(endpoint: impl Into<String>, options: SocketOptions, clock: C) -> Self {
        Self {
            endpoint: endpoint.into(),
            options,
            state: ConnectionState::Closed,
            clock,
            timers: TimerQueue::new(),
            effects: Vec::new(),
            channels: Vec::new(),
            next_channel_id: 0,
            ref_seq: 0,
            send_buffer: Vec::new(),
            pending_heartbeat_ref: None,
            close_handled: true,
            clean_close: false,
            reconnect_advised: false,
            open_hooks: Vec::new(),
            close_hooks: Vec::new(),
            error_hooks: Vec::new(),
            message_hooks: Vec::new(),
        }
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Whether frames currently flow.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Whether the last closure was abnormal and a reconnect makes sense.
    pub fn reconnect_advised(&self) -> bool {
        self.reconnect_advised
    }

    /// The URL a dial should use: the endpoint with `vsn` and the configured
    /// params appended. A params thunk is re-evaluated on every call.
    pub fn endpoint_url(&self) -> String {
        let mut url = self.endpoint.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("vsn=");
        url.push_str(VSN);
        for (key, value) in self.options.params.pairs() {
            url.push('&');
            url.push_str(&urlencoding::encode(&key));
            url.push('=');
            url.push_str(&urlencoding::encode(&value));
        }
        url
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Request a connection. No-op unless currently closed.
    pub fn connect(&mut self) {
        if self.state != ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Connecting;
        self.close_handled = false;
        self.clean_close = false;
        self.reconnect_advised = false;
        let deadline = self.clock.now() + self.options.timeout;
        self.timers.schedule(deadline, TimerKind::ConnectTimeout);
        self.effects.push(Effect::Connect {
            url: self.endpoint_url(),
        });
    }

    /// Request a clean close. Close callbacks run exactly once and
    /// reconnection is not advised.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        self.clean_close = true;
        self.effects.push(Effect::Close {
            code: 1000,
            reason: String::new(),
        });
        // Run teardown now; the transport's close echo is absorbed by the
        // exactly-once guard.
        self.handle_close(CloseEvent::normal());
    }

    // ------------------------------------------------------------------
    // Socket lifecycle hooks
    // ------------------------------------------------------------------

    /// Run `hook` every time the connection opens.
    pub fn on_open(&mut self, hook: OpenHook) {
        self.open_hooks.push(hook);
    }

    /// Run `hook` every time the connection closes.
    pub fn on_close(&mut self, hook: CloseHook) {
        self.close_hooks.push(hook);
    }

    /// Run `hook` on every connection-level error.
    pub fn on_error(&mut self, hook: ErrorHook) {
        self.error_hooks.push(hook);
    }

    /// Run `hook` on every decoded inbound envelope.
    pub fn on_message(&mut self, hook: MessageHook) {
        self.message_hooks.push(hook);
    }

    // ------------------------------------------------------------------
    // Channel registry
    // ------------------------------------------------------------------

    /// Register a channel for `topic` with join `params`. The channel stays
    /// closed until [`join`](Socket::join).
    pub fn channel(&mut self, topic: impl Into<String>, params: Value) -> ChannelId {
        self.next_channel_id += 1;
        let id = ChannelId(self.next_channel_id);
        self.channels
            .push(Channel::new(id, topic.into(), params, self.options.timeout));
        id
    }

    /// Access a registered channel.
    pub fn channel_ref(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|ch| ch.id == id)
    }

    /// State of a registered channel.
    pub fn channel_state(&self, id: ChannelId) -> Option<ChannelState> {
        self.channel_ref(id).map(|ch| ch.state)
    }

    /// Remove a channel without a leave handshake, dropping its pushes,
    /// bindings, and timers.
    pub fn remove(&mut self, id: ChannelId) {
        self.close_channel(id);
    }

    /// Send the join request for a channel (or buffer it until open), with
    /// the channel's default timeout.
    ///
    /// Only one join attempt can be outstanding: while the channel is joining
    /// or joined this is a no-op, so hooks on the join push keep observing
    /// the original attempt. Any other channel joined on the same topic is
    /// left first; the newest join owns the topic.
    pub fn join(&mut self, id: ChannelId) -> Result<(), ChannelError> {
        let timeout = self
            .channel_ref(id)
            .map(|ch| ch.timeout)
            .ok_or(ChannelError::UnknownChannel)?;
        self.join_with_timeout(id, timeout)
    }

    /// Send the join request with an explicit reply deadline. Rejoins reuse
    /// the same deadline.
    pub fn join_with_timeout(
        &mut self,
        id: ChannelId,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let idx = self.index_of(id).ok_or(ChannelError::UnknownChannel)?;
        if matches!(
            self.channels[idx].state,
            ChannelState::Joining | ChannelState::Joined
        ) {
            return Ok(());
        }
        self.leave_open_topic(id);
        let idx = self.index_of(id).ok_or(ChannelError::UnknownChannel)?;
        self.channels[idx].join_push.timeout = timeout;
        self.channels[idx].joined_once = true;
        self.start_join(idx);
        Ok(())
    }

    /// Leave every other channel joining or joined on `id`'s topic, so the
    /// topic's registry slot goes to the newest join.
    fn leave_open_topic(&mut self, id: ChannelId) {
        let Some(idx) = self.index_of(id) else { return };
        let topic = self.channels[idx].topic.clone();
        let duplicates: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|ch| {
                ch.id != id
                    && ch.topic == topic
                    && matches!(ch.state, ChannelState::Joining | ChannelState::Joined)
            })
            .map(|ch| ch.id)
            .collect();
        for duplicate in duplicates {
            tracing::warn!(%topic, "leaving duplicate channel joined on topic");
            let _ = self.leave(duplicate);
        }
    }

    /// Leave a channel: a `phx_leave` handshake when joined, immediate
    /// removal otherwise. Either way the channel ends up unregistered.
    pub fn leave(&mut self, id: ChannelId) -> Result<(), ChannelError> {
        let idx = self.index_of(id).ok_or(ChannelError::UnknownChannel)?;
        let joined = self.channels[idx].can_push();
        if !joined {
            self.close_channel(id);
            return Ok(());
        }
        let timeout = self.channels[idx].timeout;
        let (push_id, _) = self.channels[idx].add_push(Push::new(
            events::LEAVE,
            json!({}),
            timeout,
        ));
        self.channels[idx].state = ChannelState::Leaving;
        self.send_push(idx, push_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pushes and bindings
    // ------------------------------------------------------------------

    /// Push `event` with the channel's default timeout.
    pub fn push(
        &mut self,
        id: ChannelId,
        event: impl Into<String>,
        payload: Value,
    ) -> Result<PushId, ChannelError> {
        let timeout = self
            .channel_ref(id)
            .map(|ch| ch.timeout)
            .unwrap_or(self.options.timeout);
        self.push_with_timeout(id, event, payload, timeout)
    }

    /// Push `event` with an explicit reply deadline.
    ///
    /// Before join success the push buffers FIFO (its timeout still starts
    /// now); pushing on a channel that never attempted a join is an error.
    pub fn push_with_timeout(
        &mut self,
        id: ChannelId,
        event: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Result<PushId, ChannelError> {
        let idx = self.index_of(id).ok_or(ChannelError::UnknownChannel)?;
        let event = event.into();
        if !self.channels[idx].joined_once {
            return Err(ChannelError::NotJoined {
                topic: self.channels[idx].topic.clone(),
                event,
            });
        }
        let (push_id, buffered) = self.channels[idx].add_push(Push::new(event, payload, timeout));
        let deadline = self.clock.now() + timeout;
        let timer = self.timers.schedule(
            deadline,
            TimerKind::PushTimeout {
                channel: id.0,
                push: push_id.0,
            },
        );
        if let Some(push) = self.channels[idx].push_mut(push_id) {
            push.timer = Some(timer);
        }
        if !buffered {
            self.transmit_push(idx, push_id);
        }
        Ok(push_id)
    }

    /// Register a reply hook on a push.
    pub fn receive(
        &mut self,
        id: ChannelId,
        push_id: PushId,
        status: impl Into<String>,
        hook: ReplyHook,
    ) -> Result<(), ChannelError> {
        let idx = self.index_of(id).ok_or(ChannelError::UnknownChannel)?;
        let push = self.channels[idx]
            .push_mut(push_id)
            .ok_or(ChannelError::UnknownPush)?;
        push.receive(status, hook);
        Ok(())
    }

    /// Bind `hook` to `event` on a channel.
    pub fn on(
        &mut self,
        id: ChannelId,
        event: impl Into<String>,
        hook: EventHook,
    ) -> Result<BindingRef, ChannelError> {
        let idx = self.index_of(id).ok_or(ChannelError::UnknownChannel)?;
        Ok(self.channels[idx].on(event, hook))
    }

    /// Remove every hook bound to `event` on a channel.
    pub fn off(&mut self, id: ChannelId, event: &str) -> Result<(), ChannelError> {
        let idx = self.index_of(id).ok_or(ChannelError::UnknownChannel)?;
        self.channels[idx].off(event);
        Ok(())
    }

    /// Remove a single binding by its token.
    pub fn off_ref(&mut self, id: ChannelId, binding: BindingRef) -> Result<(), ChannelError> {
        let idx = self.index_of(id).ok_or(ChannelError::UnknownChannel)?;
        self.channels[idx].off_ref(binding);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Driver interface
    // ------------------------------------------------------------------

    /// Feed one transport event into the state machine.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.handle_open(),
            TransportEvent::Message(text) => match Message::decode(&text) {
                Ok(message) => self.handle_message(message),
                Err(error) => {
                    tracing::warn!(%error, "dropping undecodable frame");
                }
            },
            TransportEvent::Error(error) => {
                tracing::warn!(%error, "transport error");
                self.run_error_hooks(&SocketError::Transport(error));
            }
            TransportEvent::Close(close) => self.handle_close(close),
        }
    }

    /// Fire every timer due at the clock's current instant.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        for kind in self.timers.pop_due(now) {
            match kind {
                TimerKind::Heartbeat => self.heartbeat_due(now),
                TimerKind::ConnectTimeout => self.connect_timed_out(),
                TimerKind::PushTimeout { channel, push } => {
                    self.push_timed_out(ChannelId(channel), PushId(push));
                }
                TimerKind::Rejoin { channel } => self.rejoin_due(ChannelId(channel)),
            }
        }
    }

    /// The earliest pending timer deadline, for the driver's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Drain the pending effects, oldest first.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    // ------------------------------------------------------------------
    // Transport event handling
    // ------------------------------------------------------------------

    fn handle_open(&mut self) {
        tracing::debug!(endpoint = %self.endpoint, "connection open");
        self.timers
            .cancel_where(|kind| *kind == TimerKind::ConnectTimeout);
        self.state = ConnectionState::Open;
        self.close_handled = false;
        self.reconnect_advised = false;
        self.pending_heartbeat_ref = None;
        self.reset_heartbeat();

        // Replay everything queued while disconnected, in order.
        let buffered = std::mem::take(&mut self.send_buffer);
        for message in buffered {
            self.effects.push(Effect::Send(message));
        }

        // Channels that lost their server side rejoin immediately.
        let errored: Vec<usize> = (0..self.channels.len())
            .filter(|&idx| self.channels[idx].state == ChannelState::Errored)
            .collect();
        for idx in errored {
            self.channels[idx].rejoin_tries = 0;
            self.start_join(idx);
        }

        let mut hooks = std::mem::take(&mut self.open_hooks);
        for hook in &mut hooks {
            hook();
        }
        hooks.extend(self.open_hooks.drain(..));
        self.open_hooks = hooks;
    }

    fn handle_close(&mut self, close: CloseEvent) {
        if self.close_handled {
            return;
        }
        self.close_handled = true;
        tracing::debug!(code = close.code, reason = %close.reason, "connection closed");

        self.state = ConnectionState::Closed;
        self.pending_heartbeat_ref = None;
        self.timers.cancel_where(|kind| {
            matches!(kind, TimerKind::Heartbeat | TimerKind::ConnectTimeout)
        });
        self.reconnect_advised = !(self.clean_close || close.is_normal());
        self.clean_close = false;

        self.teardown_channels();

        let mut hooks = std::mem::take(&mut self.close_hooks);
        for hook in &mut hooks {
            hook(&close);
        }
        hooks.extend(self.close_hooks.drain(..));
        self.close_hooks = hooks;
    }

    /// On connection loss: every joining/joined channel becomes errored and
    /// its in-flight pushes resolve once as a disconnect error. Channels
    /// mid-leave just finish closing.
    fn teardown_channels(&mut self) {
        let ids: Vec<ChannelId> = self.channels.iter().map(|ch| ch.id).collect();
        for id in ids {
            let Some(idx) = self.index_of(id) else { continue };
            match self.channels[idx].state {
                ChannelState::Joining | ChannelState::Joined => {
                    let outstanding = self.channels[idx].outstanding_sent();
                    for push_id in outstanding {
                        self.resolve_push(
                            idx,
                            push_id,
                            Reply::new("error", json!({"reason": "disconnected"})),
                        );
                    }
                    if self.channels[idx].join_push.sent
                        && !self.channels[idx].join_push.is_resolved()
                    {
                        self.resolve_push(
                            idx,
                            JOIN_PUSH_ID,
                            Reply::new("error", json!({"reason": "disconnected"})),
                        );
                    }
                    // resolve_push may have moved the channel already.
                    if let Some(idx) = self.index_of(id) {
                        self.channels[idx].state = ChannelState::Errored;
                    }
                }
                ChannelState::Leaving => self.close_channel(id),
                ChannelState::Errored | ChannelState::Closed => {}
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        let mut hooks = std::mem::take(&mut self.message_hooks);
        for hook in &mut hooks {
            hook(&message);
        }
        hooks.extend(self.message_hooks.drain(..));
        self.message_hooks = hooks;

        if message.topic == CONTROL_TOPIC {
            if message.is_reply() && message.msg_ref == self.pending_heartbeat_ref {
                self.pending_heartbeat_ref = None;
            }
            return;
        }

        let targets: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|ch| ch.is_member(&message))
            .map(|ch| ch.id)
            .collect();
        for id in targets {
            if let Some(idx) = self.index_of(id) {
                self.dispatch(idx, &message);
            }
        }
    }

    fn dispatch(&mut self, idx: usize, message: &Message) {
        match message.event.as_str() {
            events::REPLY => {
                let Some(msg_ref) = message.msg_ref.as_deref() else {
                    return;
                };
                let Some(push_id) = self.channels[idx].push_by_ref(msg_ref) else {
                    tracing::debug!(
                        topic = %self.channels[idx].topic,
                        msg_ref,
                        "reply for unknown or already resolved ref"
                    );
                    return;
                };
                let Some(reply) = message.reply() else { return };
                self.resolve_push(idx, push_id, reply);
            }
            events::ERROR => {
                let id = self.channels[idx].id;
                self.channels[idx].trigger(events::ERROR, &message.payload);
                self.channel_errored(id);
            }
            events::CLOSE => {
                let id = self.channels[idx].id;
                self.channels[idx].trigger(events::CLOSE, &message.payload);
                self.close_channel(id);
            }
            _ => {
                self.channels[idx].trigger(&message.event, &message.payload);
            }
        }
    }

    // ------------------------------------------------------------------
    // Push resolution
    // ------------------------------------------------------------------

    fn resolve_push(&mut self, idx: usize, push_id: PushId, reply: Reply) {
        let status = reply.status.clone();
        let (resolved, timer, event) = {
            let Some(push) = self.channels[idx].push_mut(push_id) else {
                return;
            };
            let timer = push.timer.take();
            let event = push.event.clone();
            (push.resolve(reply), timer, event)
        };
        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }
        if !resolved {
            return;
        }

        if push_id == JOIN_PUSH_ID {
            self.finish_join(idx, &status);
        } else if self.channels[idx].state == ChannelState::Leaving && event == events::LEAVE {
            let id = self.channels[idx].id;
            self.close_channel(id);
        }
    }

    fn finish_join(&mut self, idx: usize, status: &str) {
        let id = self.channels[idx].id;
        match status {
            "ok" => {
                tracing::debug!(topic = %self.channels[idx].topic, "joined");
                self.channels[idx].state = ChannelState::Joined;
                self.channels[idx].rejoin_tries = 0;
                let buffered = self.channels[idx].drain_buffer();
                for push_id in buffered {
                    let live = self.channels[idx]
                        .push(push_id)
                        .map(|p| !p.is_resolved())
                        .unwrap_or(false);
                    if live {
                        self.transmit_push(idx, push_id);
                    }
                }
            }
            other => {
                let reason = self.channels[idx]
                    .join_push
                    .reply()
                    .and_then(|r| r.response.get("reason"))
                    .and_then(|v| v.as_str())
                    .unwrap_or(other)
                    .to_string();
                tracing::warn!(topic = %self.channels[idx].topic, %reason, "join failed");
                self.channels[idx].state = ChannelState::Errored;
                self.run_error_hooks(&SocketError::Join { reason });
                self.schedule_rejoin(id);
            }
        }
    }

    fn push_timed_out(&mut self, id: ChannelId, push_id: PushId) {
        let Some(idx) = self.index_of(id) else { return };
        let already = self.channels[idx]
            .push(push_id)
            .map(|p| p.is_resolved())
            .unwrap_or(true);
        if already {
            return;
        }
        tracing::debug!(topic = %self.channels[idx].topic, "push timed out");
        self.resolve_push(idx, push_id, Reply::new("timeout", json!({})));
    }

    // ------------------------------------------------------------------
    // Join / rejoin
    // ------------------------------------------------------------------

    fn start_join(&mut self, idx: usize) {
        // A previous join ref means this is a rejoin: pushes from the
        // superseded epoch are cleared, unresolved ones as timeouts.
        if self.channels[idx].join_ref().is_some() {
            self.clear_stale_pushes(idx);
        }

        let join_ref = next_ref(&mut self.ref_seq);
        let (message, timeout) = {
            let channel = &mut self.channels[idx];
            channel.state = ChannelState::Joining;
            channel.join_push.reset();
            channel.join_push.msg_ref = Some(join_ref.clone());
            channel.join_push.sent = true;
            (
                Message::new(
                    channel.topic.clone(),
                    events::JOIN,
                    channel.params.clone(),
                )
                .with_join_ref(join_ref.clone())
                .with_msg_ref(join_ref),
                channel.join_push.timeout,
            )
        };

        let channel_id = self.channels[idx].id;
        let deadline = self.clock.now() + timeout;
        let timer = self.timers.schedule(
            deadline,
            TimerKind::PushTimeout {
                channel: channel_id.0,
                push: JOIN_PUSH_ID.0,
            },
        );
        self.channels[idx].join_push.timer = Some(timer);
        self.transmit(message);
    }

    fn clear_stale_pushes(&mut self, idx: usize) {
        let ids = self.channels[idx].all_push_ids();
        for push_id in ids {
            self.resolve_push(idx, push_id, Reply::new("timeout", json!({})));
        }
        self.channels[idx].clear_pushes();
        let channel_id = self.channels[idx].id.0;
        self.timers.cancel_where(|kind| {
            matches!(kind, TimerKind::PushTimeout { channel, push }
                if *channel == channel_id && *push != JOIN_PUSH_ID.0)
        });
    }

    fn schedule_rejoin(&mut self, id: ChannelId) {
        if self.state != ConnectionState::Open {
            // The open handler rejoins errored channels; no timer needed.
            return;
        }
        let Some(idx) = self.index_of(id) else { return };
        if self.channels[idx].state != ChannelState::Errored {
            return;
        }
        self.channels[idx].rejoin_tries += 1;
        let wait = self
            .options
            .rejoin_backoff
            .wait_for(self.channels[idx].rejoin_tries);
        let deadline = self.clock.now() + wait;
        self.timers
            .schedule(deadline, TimerKind::Rejoin { channel: id.0 });
    }

    fn rejoin_due(&mut self, id: ChannelId) {
        let Some(idx) = self.index_of(id) else { return };
        if self.state != ConnectionState::Open {
            // The open handler rejoins errored channels itself.
            return;
        }
        if self.channels[idx].state == ChannelState::Errored {
            self.start_join(idx);
        }
    }

    fn channel_errored(&mut self, id: ChannelId) {
        let Some(idx) = self.index_of(id) else { return };
        match self.channels[idx].state {
            ChannelState::Leaving | ChannelState::Closed => return,
            _ => {}
        }
        tracing::debug!(topic = %self.channels[idx].topic, "channel errored");
        self.channels[idx].state = ChannelState::Errored;
        self.schedule_rejoin(id);
    }

    fn close_channel(&mut self, id: ChannelId) {
        self.timers.cancel_where(|kind| match kind {
            TimerKind::PushTimeout { channel, .. } | TimerKind::Rejoin { channel } => {
                *channel == id.0
            }
            TimerKind::Heartbeat | TimerKind::ConnectTimeout => false,
        });
        if let Some(idx) = self.index_of(id) {
            let channel = &mut self.channels[idx];
            tracing::debug!(topic = %channel.topic, "channel closed");
            channel.clear_pushes();
            channel.clear_bindings();
            channel.state = ChannelState::Closed;
            self.channels.remove(idx);
        }
    }

    // ------------------------------------------------------------------
    // Heartbeats
    // ------------------------------------------------------------------

    fn reset_heartbeat(&mut self) {
        self.timers.cancel_where(|kind| *kind == TimerKind::Heartbeat);
        let deadline = self.clock.now() + self.options.heartbeat_interval;
        self.timers.schedule(deadline, TimerKind::Heartbeat);
    }

    fn heartbeat_due(&mut self, _now: Instant) {
        if self.state != ConnectionState::Open {
            return;
        }
        if self.pending_heartbeat_ref.is_some() {
            // A full interval passed with no ack: the connection is dead
            // even though the transport has not noticed.
            tracing::warn!("heartbeat unanswered, closing connection");
            self.run_error_hooks(&SocketError::HeartbeatTimeout);
            self.effects.push(Effect::Close {
                code: 1000,
                reason: "heartbeat timeout".to_string(),
            });
            self.handle_close(CloseEvent::abnormal("heartbeat timeout"));
            return;
        }
        let heartbeat_ref = next_ref(&mut self.ref_seq);
        self.pending_heartbeat_ref = Some(heartbeat_ref.clone());
        self.effects
            .push(Effect::Send(Message::heartbeat(heartbeat_ref)));
        self.reset_heartbeat();
    }

    /// The dial never completed. Abort it and treat the attempt as an
    /// abnormal close so reconnect policy applies.
    fn connect_timed_out(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        tracing::warn!(endpoint = %self.endpoint, "connect attempt timed out");
        self.run_error_hooks(&SocketError::ConnectTimeout);
        self.effects.push(Effect::Close {
            code: 1000,
            reason: "connect timeout".to_string(),
        });
        self.handle_close(CloseEvent::abnormal("connect timeout"));
    }

    // ------------------------------------------------------------------
    // Outbound plumbing
    // ------------------------------------------------------------------

    /// Assign a fresh ref to a push and put its envelope on the wire.
    fn transmit_push(&mut self, idx: usize, push_id: PushId) {
        let msg_ref = next_ref(&mut self.ref_seq);
        let join_ref = self.channels[idx].join_ref().map(str::to_string);
        let topic = self.channels[idx].topic.clone();
        let (event, payload) = {
            let Some(push) = self.channels[idx].push_mut(push_id) else {
                return;
            };
            push.msg_ref = Some(msg_ref.clone());
            push.sent = true;
            (push.event.clone(), push.payload.clone())
        };
        let mut message = Message::new(topic, event, payload).with_msg_ref(msg_ref);
        if let Some(join_ref) = join_ref {
            message = message.with_join_ref(join_ref);
        }
        self.transmit(message);
    }

    fn send_push(&mut self, idx: usize, push_id: PushId) {
        let timeout = self.channels[idx]
            .push(push_id)
            .map(|p| p.timeout)
            .unwrap_or(self.options.timeout);
        let channel_id = self.channels[idx].id;
        let deadline = self.clock.now() + timeout;
        let timer = self.timers.schedule(
            deadline,
            TimerKind::PushTimeout {
                channel: channel_id.0,
                push: push_id.0,
            },
        );
        if let Some(push) = self.channels[idx].push_mut(push_id) {
            push.timer = Some(timer);
        }
        self.transmit_push(idx, push_id);
    }

    fn transmit(&mut self, message: Message) {
        if self.state == ConnectionState::Open {
            self.effects.push(Effect::Send(message));
        } else {
            self.send_buffer.push(message);
        }
    }

    fn run_error_hooks(&mut self, error: &SocketError) {
        let mut hooks = std::mem::take(&mut self.error_hooks);
        for hook in &mut hooks {
            hook(error);
        }
        hooks.extend(self.error_hooks.drain(..));
        self.error_hooks = hooks;
    }

    fn index_of(&self, id: ChannelId) -> Option<usize> {
        self.channels.iter().position(|ch| ch.id == id)
    }
}
