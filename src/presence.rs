//! Presence set reconciliation.
//!
//! The server holds the authoritative presence set per topic and sends a
//! full `presence_state` snapshot on join followed by incremental
//! `presence_diff` events. The pure functions here ([`sync_state`],
//! [`sync_diff`], [`list`]) reconcile a local replica against those
//! payloads; [`Presence`] wires them onto a channel and buffers diffs that
//! race ahead of the first snapshot.
//!
//! State shape: `{key → {metas: [...]}}`. A key is one logical presence (a
//! user); each meta is one of its sessions (a device, a tab), identified by
//! the server-assigned `phx_ref` field. A stored key always has at least one
//! meta; removing the last meta removes the key.

use crate::channel::ChannelId;
use crate::socket::Socket;
use crate::timer::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// The local replica: key to its live metas. A `BTreeMap` so enumeration
/// order is deterministic (sorted by key).
pub type PresenceState = BTreeMap<String, PresenceEntry>;

/// The sessions currently present for one key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// One entry per session, each carrying a `phx_ref`.
    pub metas: Vec<Value>,
}

/// An incremental presence update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceDiff {
    /// Keys/metas that arrived.
    pub joins: PresenceState,
    /// Keys/metas that departed.
    pub leaves: PresenceState,
}

/// Called with `(key, previous_entry, merged_entry)` when metas arrive.
/// `previous_entry` is `None` for a brand-new key; `merged_entry` holds the
/// full meta list after the join is applied.
pub type JoinHandler<'a> = &'a mut dyn FnMut(&str, Option<&PresenceEntry>, &PresenceEntry);

/// Called with `(key, remaining_entry, departed_entry)` when metas depart.
/// `remaining_entry` holds what is left for the key (possibly no metas, in
/// which case the key is removed).
pub type LeaveHandler<'a> = &'a mut dyn FnMut(&str, &PresenceEntry, &PresenceEntry);

fn meta_ref(meta: &Value) -> Option<&str> {
    meta.get("phx_ref").and_then(Value::as_str)
}

fn contains_ref(metas: &[Value], wanted: &Value) -> bool {
    match meta_ref(wanted) {
        Some(wanted) => metas.iter().any(|m| meta_ref(m) == Some(wanted)),
        None => false,
    }
}

/// Reconcile the replica against a full authoritative snapshot.
///
/// Computes the implied joins and leaves against `current` and applies them
/// through [`sync_diff`], so the handlers see exactly the delta. The result
/// does not depend on map iteration order.
pub fn sync_state(
    current: &PresenceState,
    new_state: PresenceState,
    on_join: Option<JoinHandler<'_>>,
    on_leave: Option<LeaveHandler<'_>>,
) -> PresenceState {
    let mut joins = PresenceState::new();
    let mut leaves = PresenceState::new();

    for (key, presence) in current {
        if !new_state.contains_key(key) {
            leaves.insert(key.clone(), presence.clone());
        }
    }
    for (key, new_presence) in &new_state {
        match current.get(key) {
            Some(current_presence) => {
                let joined: Vec<Value> = new_presence
                    .metas
                    .iter()
                    .filter(|m| !contains_ref(&current_presence.metas, m))
                    .cloned()
                    .collect();
                let left: Vec<Value> = current_presence
                    .metas
                    .iter()
                    .filter(|m| !contains_ref(&new_presence.metas, m))
                    .cloned()
                    .collect();
                if !joined.is_empty() {
                    joins.insert(key.clone(), PresenceEntry { metas: joined });
                }
                if !left.is_empty() {
                    leaves.insert(key.clone(), PresenceEntry { metas: left });
                }
            }
            None => {
                joins.insert(key.clone(), new_presence.clone());
            }
        }
    }

    // Moved, not reborrowed: a reborrow would need the caller's lifetime.
    sync_diff(current.clone(), &PresenceDiff { joins, leaves }, on_join, on_leave)
}

/// Apply an incremental diff to the replica.
///
/// Joins are processed before leaves, so a key present in both (a session
/// replaced in one diff) never transiently disappears.
pub fn sync_diff(
    mut state: PresenceState,
    diff: &PresenceDiff,
    mut on_join: Option<JoinHandler<'_>>,
    mut on_leave: Option<LeaveHandler<'_>>,
) -> PresenceState {
    for (key, new_presence) in &diff.joins {
        let previous = state.get(key).cloned();
        let mut merged = new_presence.clone();
        if let Some(previous) = &previous {
            // Keep existing sessions that the join did not re-announce,
            // oldest first.
            let mut kept: Vec<Value> = previous
                .metas
                .iter()
                .filter(|m| !contains_ref(&merged.metas, m))
                .cloned()
                .collect();
            kept.extend(merged.metas);
            merged.metas = kept;
        }
        state.insert(key.clone(), merged.clone());
        if let Some(on_join) = on_join.as_deref_mut() {
            on_join(key, previous.as_ref(), &merged);
        }
    }

    for (key, departed) in &diff.leaves {
        let Some(current) = state.get_mut(key) else {
            continue;
        };
        current
            .metas
            .retain(|m| !contains_ref(&departed.metas, m));
        let remaining = current.clone();
        if let Some(on_leave) = on_leave.as_deref_mut() {
            on_leave(key, &remaining, departed);
        }
        if remaining.metas.is_empty() {
            state.remove(key);
        }
    }

    state
}

/// Enumerate the replica through `chooser`, in key order.
pub fn list<T>(state: &PresenceState, mut chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
    state
        .iter()
        .map(|(key, entry)| chooser(key, entry))
        .collect()
}

/// Enumerate with the default chooser: each key paired with its first
/// (oldest) meta.
pub fn list_first(state: &PresenceState) -> Vec<(String, Value)> {
    list(state, |key, entry| {
        (
            key.to_string(),
            entry.metas.first().cloned().unwrap_or(Value::Null),
        )
    })
}

// ============================================================================
// Channel-bound presence instance
// ============================================================================

type BoundJoinHook = Box<dyn FnMut(&str, Option<&PresenceEntry>, &PresenceEntry)>;
type BoundLeaveHook = Box<dyn FnMut(&str, &PresenceEntry, &PresenceEntry)>;
type SyncHook = Box<dyn FnMut()>;

#[derive(Default)]
struct PresenceInner {
    state: PresenceState,
    /// Diffs that arrived before the first full snapshot of this epoch.
    pending_diffs: Vec<PresenceDiff>,
    synced: bool,
    on_join: Option<BoundJoinHook>,
    on_leave: Option<BoundLeaveHook>,
    on_sync: Option<SyncHook>,
}

impl PresenceInner {
    fn apply_state(&mut self, snapshot: PresenceState) {
        // Hooks are taken out for the duration so the reconciliation can
        // borrow them without fighting the RefCell they live behind.
        let mut on_join = self.on_join.take();
        let mut on_leave = self.on_leave.take();
        let mut join_fn = |key: &str, prev: Option<&PresenceEntry>, merged: &PresenceEntry| {
            if let Some(hook) = on_join.as_mut() {
                hook(key, prev, merged);
            }
        };
        let mut leave_fn = |key: &str, remaining: &PresenceEntry, departed: &PresenceEntry| {
            if let Some(hook) = on_leave.as_mut() {
                hook(key, remaining, departed);
            }
        };

        self.state = sync_state(
            &self.state,
            snapshot,
            Some(&mut join_fn),
            Some(&mut leave_fn),
        );
        self.synced = true;
        for diff in std::mem::take(&mut self.pending_diffs) {
            self.state = sync_diff(
                std::mem::take(&mut self.state),
                &diff,
                Some(&mut join_fn),
                Some(&mut leave_fn),
            );
        }

        drop(join_fn);
        drop(leave_fn);
        self.on_join = on_join;
        self.on_leave = on_leave;
        self.run_sync();
    }

    fn apply_diff(&mut self, diff: PresenceDiff) {
        if !self.synced {
            self.pending_diffs.push(diff);
            return;
        }
        let mut on_join = self.on_join.take();
        let mut on_leave = self.on_leave.take();
        let mut join_fn = |key: &str, prev: Option<&PresenceEntry>, merged: &PresenceEntry| {
            if let Some(hook) = on_join.as_mut() {
                hook(key, prev, merged);
            }
        };
        let mut leave_fn = |key: &str, remaining: &PresenceEntry, departed: &PresenceEntry| {
            if let Some(hook) = on_leave.as_mut() {
                hook(key, remaining, departed);
            }
        };

        self.state = sync_diff(
            std::mem::take(&mut self.state),
            &diff,
            Some(&mut join_fn),
            Some(&mut leave_fn),
        );

        drop(join_fn);
        drop(leave_fn);
        self.on_join = on_join;
        self.on_leave = on_leave;
        self.run_sync();
    }

    fn run_sync(&mut self) {
        if let Some(mut hook) = self.on_sync.take() {
            hook();
            self.on_sync = Some(hook);
        }
    }
}

/// A presence replica subscribed to one channel.
///
/// Binds the channel's `presence_state` and `presence_diff` events and keeps
/// the replica current; diffs that arrive before the first snapshot are
/// buffered and applied once it lands.
pub struct Presence {
    inner: Rc<RefCell<PresenceInner>>,
}

impl Presence {
    /// Subscribe to `channel`'s presence events.
    pub fn new<C: Clock>(socket: &mut Socket<C>, channel: ChannelId) -> Self {
        let inner = Rc::new(RefCell::new(PresenceInner::default()));

        let state_inner = inner.clone();
        let _ = socket.on(
            channel,
            "presence_state",
            Box::new(move |payload: &Value| {
                match serde_json::from_value::<PresenceState>(payload.clone()) {
                    Ok(snapshot) => state_inner.borrow_mut().apply_state(snapshot),
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed presence_state payload");
                    }
                }
            }),
        );

        let diff_inner = inner.clone();
        let _ = socket.on(
            channel,
            "presence_diff",
            Box::new(move |payload: &Value| {
                match serde_json::from_value::<PresenceDiff>(payload.clone()) {
                    Ok(diff) => diff_inner.borrow_mut().apply_diff(diff),
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed presence_diff payload");
                    }
                }
            }),
        );

        Self { inner }
    }

    /// Run `hook` for each key whose metas arrive.
    pub fn on_join(&self, hook: BoundJoinHook) {
        self.inner.borrow_mut().on_join = Some(hook);
    }

    /// Run `hook` for each key whose metas depart.
    pub fn on_leave(&self, hook: BoundLeaveHook) {
        self.inner.borrow_mut().on_leave = Some(hook);
    }

    /// Run `hook` after every applied snapshot or diff.
    pub fn on_sync(&self, hook: SyncHook) {
        self.inner.borrow_mut().on_sync = Some(hook);
    }

    /// Snapshot of the current replica.
    pub fn state(&self) -> PresenceState {
        self.inner.borrow().state.clone()
    }

    /// Enumerate the replica through `chooser`, in key order.
    pub fn list<T>(&self, chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
        list(&self.inner.borrow().state, chooser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(metas: Vec<Value>) -> PresenceEntry {
        PresenceEntry { metas }
    }

    fn meta(phx_ref: &str) -> Value {
        json!({"phx_ref": phx_ref})
    }

    fn state_of(pairs: Vec<(&str, Vec<Value>)>) -> PresenceState {
        pairs
            .into_iter()
            .map(|(k, metas)| (k.to_string(), entry(metas)))
            .collect()
    }

    #[test]
    fn test_sync_state_from_empty_reports_joins() {
        let snapshot = state_of(vec![("u1", vec![meta("1")]), ("u2", vec![meta("2")])]);
        let mut joined = Vec::new();
        let mut on_join = |key: &str, prev: Option<&PresenceEntry>, _merged: &PresenceEntry| {
            joined.push((key.to_string(), prev.is_none()));
        };

        let state = sync_state(&PresenceState::new(), snapshot.clone(), Some(&mut on_join), None);
        assert_eq!(state, snapshot);
        assert_eq!(
            joined,
            vec![("u1".to_string(), true), ("u2".to_string(), true)]
        );
    }

    #[test]
    fn test_sync_state_detects_meta_level_changes() {
        let current = state_of(vec![("u1", vec![meta("a"), meta("b")])]);
        // "b" departed, "c" arrived, "a" unchanged.
        let snapshot = state_of(vec![("u1", vec![meta("a"), meta("c")])]);

        let mut joined_refs = Vec::new();
        let mut left_refs = Vec::new();
        let mut on_join = |_: &str, _: Option<&PresenceEntry>, merged: &PresenceEntry| {
            joined_refs = merged
                .metas
                .iter()
                .filter_map(|m| meta_ref(m).map(String::from))
                .collect();
        };
        let mut on_leave = |_: &str, _: &PresenceEntry, departed: &PresenceEntry| {
            left_refs = departed
                .metas
                .iter()
                .filter_map(|m| meta_ref(m).map(String::from))
                .collect();
        };

        let state = sync_state(&current, snapshot, Some(&mut on_join), Some(&mut on_leave));
        assert_eq!(state, state_of(vec![("u1", vec![meta("a"), meta("c")])]));
        // The merged entry carries every meta as of the join, including the
        // one the leave half of the delta removes afterwards.
        assert_eq!(
            joined_refs,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(left_refs, vec!["b".to_string()]);
    }

    #[test]
    fn test_sync_diff_joins_before_leaves_same_key() {
        // One diff replaces a key's only session. Joins apply first, so the
        // key never drops to zero metas.
        let state = state_of(vec![("u1", vec![meta("old")])]);
        let diff = PresenceDiff {
            joins: state_of(vec![("u1", vec![meta("new")])]),
            leaves: state_of(vec![("u1", vec![meta("old")])]),
        };

        let mut leave_remaining = None;
        let mut on_leave = |_: &str, remaining: &PresenceEntry, _: &PresenceEntry| {
            leave_remaining = Some(remaining.clone());
        };

        let state = sync_diff(state, &diff, None, Some(&mut on_leave));
        assert_eq!(state, state_of(vec![("u1", vec![meta("new")])]));
        assert_eq!(leave_remaining, Some(entry(vec![meta("new")])));
    }

    #[test]
    fn test_sync_diff_removes_key_when_last_meta_leaves() {
        let state = state_of(vec![("u1", vec![meta("a")]), ("u2", vec![meta("b")])]);
        let diff = PresenceDiff {
            joins: PresenceState::new(),
            leaves: state_of(vec![("u1", vec![meta("a")])]),
        };

        let state = sync_diff(state, &diff, None, None);
        assert!(!state.contains_key("u1"));
        assert!(state.contains_key("u2"));
    }

    #[test]
    fn test_diff_accumulation_matches_full_snapshot() {
        let start = state_of(vec![("u1", vec![meta("a")])]);
        let step1 = PresenceDiff {
            joins: state_of(vec![("u2", vec![meta("b")])]),
            leaves: PresenceState::new(),
        };
        let step2 = PresenceDiff {
            joins: state_of(vec![("u1", vec![meta("c")])]),
            leaves: state_of(vec![("u1", vec![meta("a")])]),
        };

        let via_diffs = sync_diff(sync_diff(start.clone(), &step1, None, None), &step2, None, None);
        let snapshot = state_of(vec![("u1", vec![meta("c")]), ("u2", vec![meta("b")])]);
        let via_state = sync_state(&start, snapshot.clone(), None, None);

        assert_eq!(via_diffs, snapshot);
        assert_eq!(via_state, snapshot);
    }

    #[test]
    fn test_list_enumerates_in_key_order() {
        let state = state_of(vec![
            ("zeta", vec![meta("3")]),
            ("alpha", vec![meta("1")]),
            ("mid", vec![meta("2")]),
        ]);
        let keys = list(&state, |key, _| key.to_string());
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_list_first_picks_the_oldest_meta() {
        let state = state_of(vec![("u1", vec![meta("a"), meta("b")])]);
        assert_eq!(list_first(&state), vec![("u1".to_string(), meta("a"))]);
    }

    #[test]
    fn test_instance_buffers_diffs_until_first_snapshot() {
        let mut inner = PresenceInner::default();

        inner.apply_diff(PresenceDiff {
            joins: state_of(vec![("u2", vec![meta("b")])]),
            leaves: PresenceState::new(),
        });
        assert!(inner.state.is_empty());

        inner.apply_state(state_of(vec![("u1", vec![meta("a")])]));
        assert_eq!(
            inner.state,
            state_of(vec![("u1", vec![meta("a")]), ("u2", vec![meta("b")])])
        );

        // After the snapshot, diffs apply directly.
        inner.apply_diff(PresenceDiff {
            joins: PresenceState::new(),
            leaves: state_of(vec![("u1", vec![meta("a")])]),
        });
        assert_eq!(inner.state, state_of(vec![("u2", vec![meta("b")])]));
    }
}
