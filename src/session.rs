//! The session controller: reconnection on top of a socket.
//!
//! A [`Session`] wraps a [`Socket`] and supplies the policy the socket
//! itself stays agnostic of: when to redial after an abnormal close
//! (exponential backoff with jitter, reset on a successful open) and when to
//! stop trying (the reload guard: too many reconnect rounds inside a sliding
//! window parks the session in [`SessionStatus::GaveUp`] until the caller
//! explicitly reconnects).
//!
//! The guard counts through an injected [`Storage`] collaborator so a host
//! embedding several sessions can share one ledger.

use crate::backoff::{jitter, Backoff};
use crate::socket::{ConnectionState, Effect, Socket, SocketOptions};
use crate::timer::{Clock, SystemClock};
use crate::transport::TransportEvent;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Key-value collaborator for the reload guard's ledger.
pub trait Storage {
    /// Read a value.
    fn get(&mut self, key: &str) -> Option<String>;
    /// Write a value.
    fn set(&mut self, key: &str, value: String);
}

/// In-process [`Storage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: HashMap<String, String>,
}

impl MemoryStorage {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&mut self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }
}

const GUARD_KEY: &str = "tether:reconnect-window";

/// Counts reconnect rounds inside a sliding window.
///
/// A round outside the window restarts the count; a round inside it
/// increments. Crossing the ceiling means the connection is flapping faster
/// than backoff can help, and the session should stop rather than hammer the
/// server.
struct ReloadGuard<S: Storage> {
    storage: S,
    origin: Instant,
    window: Duration,
    max_rounds: u32,
}

impl<S: Storage> ReloadGuard<S> {
    fn new(storage: S, origin: Instant, window: Duration, max_rounds: u32) -> Self {
        Self {
            storage,
            origin,
            window,
            max_rounds,
        }
    }

    /// Record one reconnect round at `now`. Returns `true` when the ceiling
    /// is exceeded.
    fn record(&mut self, now: Instant) -> bool {
        let elapsed_ms = now.duration_since(self.origin).as_millis() as u64;
        let (count, start_ms) = self
            .storage
            .get(GUARD_KEY)
            .and_then(|raw| {
                let (count, start) = raw.split_once(':')?;
                Some((count.parse::<u32>().ok()?, start.parse::<u64>().ok()?))
            })
            .unwrap_or((0, elapsed_ms));

        let (count, start_ms) = if elapsed_ms.saturating_sub(start_ms) > self.window.as_millis() as u64
        {
            (1, elapsed_ms)
        } else {
            (count + 1, start_ms)
        };
        self.storage.set(GUARD_KEY, format!("{count}:{start_ms}"));
        count > self.max_rounds
    }

    fn reset(&mut self, now: Instant) {
        let elapsed_ms = now.duration_since(self.origin).as_millis() as u64;
        self.storage.set(GUARD_KEY, format!("0:{elapsed_ms}"));
    }
}

/// What the session is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No connection and nothing scheduled.
    Disconnected,
    /// A dial is in flight.
    Connecting,
    /// Frames flow.
    Connected,
    /// A reconnect is scheduled.
    WaitingToReconnect,
    /// The reload guard tripped; only an explicit connect resumes.
    GaveUp,
}

/// Session construction options.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Backoff policy for reconnect attempts.
    pub reconnect_backoff: Backoff,
    /// Jitter spread applied to each reconnect wait, `0.0` to `1.0`.
    pub jitter_spread: f64,
    /// RNG seed for the jitter; random when `None`.
    pub seed: Option<u64>,
    /// Sliding window for the reload guard.
    pub reload_window: Duration,
    /// Reconnect rounds allowed inside one window before giving up.
    pub max_reconnect_rounds: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            reconnect_backoff: Backoff::reconnect(),
            jitter_spread: 0.25,
            seed: None,
            reload_window: Duration::from_secs(30),
            max_reconnect_rounds: 10,
        }
    }
}

/// A socket plus its reconnect policy.
pub struct Session<C: Clock + Clone = SystemClock, S: Storage = MemoryStorage> {
    socket: Socket<C>,
    options: SessionOptions,
    clock: C,
    rng: StdRng,
    guard: ReloadGuard<S>,
    reconnect_tries: u32,
    reconnect_at: Option<Instant>,
    gave_up: bool,
    give_up_hooks: Vec<Box<dyn FnMut()>>,
}

impl Session<SystemClock, MemoryStorage> {
    /// Create a session with the system clock and in-process storage.
    pub fn new(
        endpoint: impl Into<String>,
        socket_options: SocketOptions,
        options: SessionOptions,
    ) -> Self {
        Self::with_parts(
            endpoint,
            socket_options,
            options,
            SystemClock,
            MemoryStorage::new(),
        )
    }
}

impl<C: Clock + Clone, S: Storage> Session<C, S> {
    /// Create a session with injected clock and storage.
    pub fn with_parts(
        endpoint: impl Into<String>,
        socket_options: SocketOptions,
        options: SessionOptions,
        clock: C,
        storage: S,
    ) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let guard = ReloadGuard::new(
            storage,
            clock.now(),
            options.reload_window,
            options.max_reconnect_rounds,
        );
        Self {
            socket: Socket::with_clock(endpoint, socket_options, clock.clone()),
            options,
            clock,
            rng,
            guard,
            reconnect_tries: 0,
            reconnect_at: None,
            gave_up: false,
            give_up_hooks: Vec::new(),
        }
    }

    /// The wrapped socket.
    pub fn socket(&self) -> &Socket<C> {
        &self.socket
    }

    /// The wrapped socket, mutably — channel and binding operations go
    /// through here.
    pub fn socket_mut(&mut self) -> &mut Socket<C> {
        &mut self.socket
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        if self.gave_up {
            return SessionStatus::GaveUp;
        }
        if self.reconnect_at.is_some() {
            return SessionStatus::WaitingToReconnect;
        }
        match self.socket.connection_state() {
            ConnectionState::Open => SessionStatus::Connected,
            ConnectionState::Connecting => SessionStatus::Connecting,
            ConnectionState::Closing | ConnectionState::Closed => SessionStatus::Disconnected,
        }
    }

    /// Run `hook` when the reload guard trips.
    pub fn on_give_up(&mut self, hook: Box<dyn FnMut()>) {
        self.give_up_hooks.push(hook);
    }

    /// Connect. An explicit connect clears a tripped guard and restarts the
    /// backoff schedule from the first step.
    pub fn connect(&mut self) {
        self.gave_up = false;
        self.reconnect_tries = 0;
        self.reconnect_at = None;
        self.guard.reset(self.clock.now());
        self.socket.connect();
    }

    /// Disconnect cleanly and cancel any scheduled reconnect.
    pub fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.socket.disconnect();
    }

    /// Feed one transport event through the socket, then apply reconnect
    /// policy to whatever state it left behind.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        let opened = event == TransportEvent::Open;
        self.socket.handle_transport_event(event);
        if opened {
            self.reconnect_tries = 0;
            self.reconnect_at = None;
        }
        self.maybe_schedule_reconnect();
    }

    /// Fire due socket timers and a due reconnect.
    pub fn tick(&mut self) {
        self.socket.tick();
        let now = self.clock.now();
        if let Some(at) = self.reconnect_at {
            if now >= at {
                self.reconnect_at = None;
                tracing::debug!(attempt = self.reconnect_tries, "reconnecting");
                self.socket.connect();
            }
        }
        self.maybe_schedule_reconnect();
    }

    /// Earliest deadline across socket timers and the scheduled reconnect.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.socket.next_deadline(), self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (deadline, None) | (None, deadline) => deadline,
        }
    }

    /// Drain the socket's pending effects.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        self.socket.take_effects()
    }

    fn maybe_schedule_reconnect(&mut self) {
        if self.gave_up
            || self.reconnect_at.is_some()
            || self.socket.connection_state() != ConnectionState::Closed
            || !self.socket.reconnect_advised()
        {
            return;
        }
        let now = self.clock.now();
        if self.guard.record(now) {
            tracing::warn!(
                rounds = self.options.max_reconnect_rounds,
                "reconnect ceiling exceeded, giving up"
            );
            self.gave_up = true;
            let mut hooks = std::mem::take(&mut self.give_up_hooks);
            for hook in &mut hooks {
                hook();
            }
            hooks.extend(self.give_up_hooks.drain(..));
            self.give_up_hooks = hooks;
            return;
        }
        self.reconnect_tries += 1;
        let base = self.options.reconnect_backoff.wait_for(self.reconnect_tries);
        let wait = jitter(base, self.options.jitter_spread, &mut self.rng);
        tracing::debug!(attempt = self.reconnect_tries, ?wait, "reconnect scheduled");
        self.reconnect_at = Some(now + wait);
    }
}
