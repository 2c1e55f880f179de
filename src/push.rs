//! One outbound request awaiting a correlated reply.
//!
//! A push resolves exactly once with a terminal status (`"ok"`, `"error"`,
//! or the locally synthesized `"timeout"`). The reply is cached so hooks
//! registered after resolution still fire, and late replies to an already
//! resolved ref are ignored.

use crate::message::Reply;
use crate::timer::TimerId;
use serde_json::Value;
use std::time::Duration;

/// Callback invoked with the reply response for a matching status.
pub type ReplyHook = Box<dyn FnMut(&Value)>;

/// An outbound event with per-status reply hooks.
pub struct Push {
    pub(crate) event: String,
    pub(crate) payload: Value,
    pub(crate) timeout: Duration,
    /// The ref the push was last sent with. `None` until it goes on the wire.
    pub(crate) msg_ref: Option<String>,
    /// Whether the current incarnation has been written to the transport.
    pub(crate) sent: bool,
    received: Option<Reply>,
    hooks: Vec<(String, ReplyHook)>,
    pub(crate) timer: Option<TimerId>,
}

impl Push {
    /// Create an unsent push.
    pub fn new(event: impl Into<String>, payload: Value, timeout: Duration) -> Self {
        Self {
            event: event.into(),
            payload,
            timeout,
            msg_ref: None,
            sent: false,
            received: None,
            hooks: Vec::new(),
            timer: None,
        }
    }

    /// Register a hook for `status`.
    ///
    /// If the push already resolved with that status the hook fires
    /// immediately from the cached reply, then stays registered.
    pub fn receive(&mut self, status: impl Into<String>, mut hook: ReplyHook) {
        let status = status.into();
        if let Some(reply) = &self.received {
            if reply.status == status {
                hook(&reply.response);
            }
        }
        self.hooks.push((status, hook));
    }

    /// Resolve with `reply`, firing hooks registered for its status.
    ///
    /// Returns `false` without side effects if already resolved.
    pub fn resolve(&mut self, reply: Reply) -> bool {
        if self.received.is_some() {
            return false;
        }
        for (status, hook) in &mut self.hooks {
            if *status == reply.status {
                hook(&reply.response);
            }
        }
        self.received = Some(reply);
        true
    }

    /// Whether a terminal reply has been recorded.
    pub fn is_resolved(&self) -> bool {
        self.received.is_some()
    }

    /// The cached terminal reply, if resolved.
    pub fn reply(&self) -> Option<&Reply> {
        self.received.as_ref()
    }

    /// Prepare for resend: forget the old ref and cached reply but keep the
    /// hooks, so a rejoin can reuse the same push object.
    pub fn reset(&mut self) {
        self.msg_ref = None;
        self.sent = false;
        self.received = None;
        self.timer = None;
    }
}

impl std::fmt::Debug for Push {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Push")
            .field("event", &self.event)
            .field("msg_ref", &self.msg_ref)
            .field("sent", &self.sent)
            .field("resolved", &self.received.is_some())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording_hook(log: &Rc<RefCell<Vec<Value>>>) -> ReplyHook {
        let log = log.clone();
        Box::new(move |response| log.borrow_mut().push(response.clone()))
    }

    #[test]
    fn test_resolve_fires_matching_hooks_once() {
        let ok_log = Rc::new(RefCell::new(Vec::new()));
        let err_log = Rc::new(RefCell::new(Vec::new()));

        let mut push = Push::new("shout", json!({}), Duration::from_secs(10));
        push.receive("ok", recording_hook(&ok_log));
        push.receive("error", recording_hook(&err_log));

        assert!(push.resolve(Reply::new("ok", json!({"n": 1}))));
        assert_eq!(*ok_log.borrow(), vec![json!({"n": 1})]);
        assert!(err_log.borrow().is_empty());

        // A second resolution is a no-op.
        assert!(!push.resolve(Reply::new("error", json!({}))));
        assert_eq!(ok_log.borrow().len(), 1);
        assert!(err_log.borrow().is_empty());
    }

    #[test]
    fn test_late_hook_fires_from_cached_reply() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut push = Push::new("shout", json!({}), Duration::from_secs(10));
        push.resolve(Reply::new("timeout", json!({})));

        push.receive("timeout", recording_hook(&log));
        assert_eq!(log.borrow().len(), 1);

        // A hook for a different status stays silent.
        let other = Rc::new(RefCell::new(Vec::new()));
        push.receive("ok", recording_hook(&other));
        assert!(other.borrow().is_empty());
    }

    #[test]
    fn test_reset_keeps_hooks_and_clears_resolution() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut push = Push::new("join", json!({}), Duration::from_secs(10));
        push.receive("ok", recording_hook(&log));
        push.msg_ref = Some("3".to_string());
        push.sent = true;
        push.resolve(Reply::new("ok", json!({})));
        assert_eq!(log.borrow().len(), 1);

        push.reset();
        assert!(!push.is_resolved());
        assert_eq!(push.msg_ref, None);
        assert!(!push.sent);

        // The retained hook fires again on the next resolution.
        push.resolve(Reply::new("ok", json!({})));
        assert_eq!(log.borrow().len(), 2);
    }
}
