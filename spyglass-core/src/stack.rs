// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Per-thread invocation tracking.
//!
//! Every (engine, listener) pair owns, on every thread it sees traffic on, a stack of
//! invoke ids plus the ignore marker, immediate-outcome separator and pending forced
//! throw for that thread. The state lives in a `thread_local!` map and is removed as
//! soon as the stack drains, so idle threads hold nothing.
//!
//! State is stamped with the activation generation of the registration that created
//! it. A handle for a newer activation of the same listener id throws older state
//! away instead of inheriting frames whose exits were never seen.
//!
//! The `RefCell` is only borrowed inside the short closures below; listener callbacks
//! always run with the map released, so re-entrant dispatch on the same thread is safe.

use crate::event::{EventKind, Throwable};
use crate::listener::ProcessControl;
use crate::separator::ImmediateSeparator;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of increasing invoke ids, unique within one engine.
#[derive(Debug)]
pub struct InvokeIdSequencer {
    next: AtomicU64,
}

impl InvokeIdSequencer {
    pub fn new(initial: u64) -> Self {
        Self {
            next: AtomicU64::new(initial),
        }
    }

    #[inline]
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`next_id`](Self::next_id) will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for InvokeIdSequencer {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Ids of one open frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Id of the bottom-most frame on the thread's stack.
    pub process_id: u64,
    pub invoke_id: u64,
}

/// Outcome of pushing or popping a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub frame: Frame,
    /// Whether the recorded root is the bottom frame and `process_id == invoke_id`
    /// agrees with there being no frame below.
    pub consistent: bool,
}

impl Transition {
    fn new(frame: Frame, bottom: u64, frames_below: usize) -> Self {
        let consistent = frame.process_id == bottom
            && (frame.process_id == frame.invoke_id) == (frames_below == 0);
        Self { frame, consistent }
    }
}

/// What is left on this thread for one listener; see [`ThreadContext::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub depth: usize,
    pub ignored_process_id: Option<u64>,
    pub pending_throw: bool,
}

#[derive(Default)]
struct ProcessState {
    generation: u64,
    stack: Vec<u64>,
    /// Id recorded when the bottom frame was pushed.
    root: Option<u64>,
    ignored_process_id: Option<u64>,
    separator: ImmediateSeparator,
    pending_throw: Option<Throwable>,
}

impl ProcessState {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ContextKey {
    engine_id: u64,
    listener_id: u32,
}

thread_local! {
    static CONTEXTS: RefCell<HashMap<ContextKey, ProcessState>> = RefCell::new(HashMap::new());
    static DISPATCHING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Handle on the current thread's state for one (engine, listener) pair.
///
/// A handle built with [`with_generation`](Self::with_generation) only accepts state
/// of that activation; without one it sees whatever the thread holds.
#[derive(Debug, Clone, Copy)]
pub struct ThreadContext {
    key: ContextKey,
    generation: Option<u64>,
}

impl ThreadContext {
    pub fn new(engine_id: u64, listener_id: u32) -> Self {
        Self {
            key: ContextKey {
                engine_id,
                listener_id,
            },
            generation: None,
        }
    }

    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn listener_id(&self) -> u32 {
        self.key.listener_id
    }

    /// State left by an earlier activation.
    fn is_stale(&self, state: &ProcessState) -> bool {
        self.generation
            .is_some_and(|generation| state.generation < generation)
    }

    /// State of a later activation, out of reach for this handle.
    fn is_superseded(&self, state: &ProcessState) -> bool {
        self.generation
            .is_some_and(|generation| state.generation > generation)
    }

    fn log_stale(&self, state: &ProcessState) {
        tracing::debug!(
            listener_id = self.key.listener_id,
            stale_generation = state.generation,
            depth = state.stack.len(),
            "Discarding thread state of an earlier activation"
        );
    }

    /// Run `f` on the state, creating it if needed. `None` during thread teardown or
    /// when a later activation owns the state.
    fn with_state<R>(&self, f: impl FnOnce(&mut ProcessState) -> R) -> Option<R> {
        let generation = self.generation.unwrap_or_default();
        CONTEXTS
            .try_with(|contexts| {
                let mut contexts = contexts.borrow_mut();
                let state = contexts
                    .entry(self.key)
                    .or_insert_with(|| ProcessState::new(generation));
                if self.is_superseded(state) {
                    return None;
                }
                if self.is_stale(state) {
                    self.log_stale(state);
                    *state = ProcessState::new(generation);
                }
                Some(f(state))
            })
            .ok()
            .flatten()
    }

    /// Run `f` on the state if it exists.
    fn peek<R>(&self, f: impl FnOnce(&mut ProcessState) -> R) -> Option<R> {
        CONTEXTS
            .try_with(|contexts| {
                let mut contexts = contexts.borrow_mut();
                let stale = contexts
                    .get(&self.key)
                    .is_some_and(|state| self.is_stale(state));
                if stale {
                    if let Some(state) = contexts.remove(&self.key) {
                        self.log_stale(&state);
                    }
                    return None;
                }
                contexts
                    .get_mut(&self.key)
                    .filter(|state| !self.is_superseded(state))
                    .map(f)
            })
            .ok()
            .flatten()
    }

    /// Open a frame with a fresh id.
    pub fn on_entry(&self, sequencer: &InvokeIdSequencer) -> Option<Transition> {
        self.with_state(|state| {
            let invoke_id = sequencer.next_id();
            let frames_below = state.stack.len();
            if frames_below == 0 {
                state.root = Some(invoke_id);
            }
            state.stack.push(invoke_id);
            let bottom = state.stack[0];
            let frame = Frame {
                process_id: state.root.unwrap_or(bottom),
                invoke_id,
            };
            Transition::new(frame, bottom, frames_below)
        })
    }

    /// Close the innermost frame. `None` when there is no open frame.
    pub fn on_exit(&self) -> Option<Transition> {
        self.peek(|state| {
            let invoke_id = state.stack.pop()?;
            let bottom = state.stack.first().copied().unwrap_or(invoke_id);
            let process_id = state.root.unwrap_or(bottom);
            if state.stack.is_empty() {
                state.root = None;
            }
            Some(Transition::new(
                Frame {
                    process_id,
                    invoke_id,
                },
                bottom,
                state.stack.len(),
            ))
        })
        .flatten()
    }

    /// The innermost open frame.
    pub fn current(&self) -> Option<Frame> {
        self.peek(|state| {
            let invoke_id = *state.stack.last()?;
            Some(Frame {
                process_id: state.root.unwrap_or(state.stack[0]),
                invoke_id,
            })
        })
        .flatten()
    }

    /// Drop everything this thread holds for the listener, whatever its activation.
    pub fn discard(&self) {
        let _ = CONTEXTS.try_with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            if let Some(state) = contexts.remove(&self.key) {
                if !state.stack.is_empty() {
                    tracing::debug!(
                        listener_id = self.key.listener_id,
                        depth = state.stack.len(),
                        "Discarding frames of an inactive listener"
                    );
                }
                if contexts.is_empty() {
                    *contexts = HashMap::new();
                }
            }
        });
    }

    /// Overwrite the recorded root id.
    #[cfg(test)]
    pub(crate) fn set_root(&self, root: u64) {
        self.peek(|state| state.root = Some(root));
    }

    pub fn current_invoke_id(&self) -> Option<u64> {
        self.current().map(|f| f.invoke_id)
    }

    pub fn current_process_id(&self) -> Option<u64> {
        self.current().map(|f| f.process_id)
    }

    pub fn depth(&self) -> usize {
        self.peek(|state| state.stack.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Whether events of `process_id` are suppressed. A marker left by another
    /// process is cleared on the way.
    pub fn is_ignored(&self, process_id: u64) -> bool {
        self.peek(|state| match state.ignored_process_id {
            Some(ignored) if ignored == process_id => true,
            Some(_) => {
                state.ignored_process_id = None;
                false
            }
            None => false,
        })
        .unwrap_or(false)
    }

    pub fn mark_ignored(&self, process_id: u64) {
        self.with_state(|state| state.ignored_process_id = Some(process_id));
    }

    /// Resolve the kind to deliver for an exit, consuming any armed override.
    pub fn classify(&self, kind: EventKind) -> EventKind {
        self.with_state(|state| state.separator.classify(kind))
            .unwrap_or(kind)
    }

    pub fn record_override(&self, control: &ProcessControl) {
        self.with_state(|state| state.separator.record_override(control));
    }

    /// Remember `throwable` as the engine's own forced throw.
    pub fn set_pending_throw(&self, throwable: &Throwable) {
        self.with_state(|state| state.pending_throw = Some(Arc::clone(throwable)));
    }

    /// Clear the pending forced throw, reporting whether it is `throwable`.
    pub fn take_pending_throw(&self, throwable: Option<&Throwable>) -> bool {
        self.peek(|state| match (state.pending_throw.take(), throwable) {
            (Some(pending), Some(thrown)) => Arc::ptr_eq(&pending, thrown),
            _ => false,
        })
        .unwrap_or(false)
    }

    /// Drop this thread's state once no frame is open.
    pub fn release_if_empty(&self) {
        let _ = CONTEXTS.try_with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            let drained = contexts
                .get(&self.key)
                .map(|state| state.stack.is_empty() || self.is_stale(state))
                .unwrap_or(false);
            if drained {
                contexts.remove(&self.key);
                if contexts.is_empty() {
                    // give the table's allocation back too
                    *contexts = HashMap::new();
                }
            }
        });
    }

    /// What this thread still holds for the listener, if anything.
    pub fn snapshot(&self) -> Option<ContextSnapshot> {
        self.peek(|state| ContextSnapshot {
            depth: state.stack.len(),
            ignored_process_id: state.ignored_process_id,
            pending_throw: state.pending_throw.is_some(),
        })
    }
}

/// Number of (engine, listener) entries alive on the current thread.
pub fn live_contexts() -> usize {
    CONTEXTS
        .try_with(|contexts| contexts.borrow().len())
        .unwrap_or(0)
}

/// Marks the current thread as dispatching for an engine until dropped.
pub(crate) struct DispatchScope {
    engine_id: u64,
}

impl DispatchScope {
    /// `None` if this thread is already dispatching for `engine_id`.
    pub(crate) fn enter(engine_id: u64) -> Option<Self> {
        DISPATCHING
            .try_with(|active| {
                let mut active = active.borrow_mut();
                if active.contains(&engine_id) {
                    None
                } else {
                    active.push(engine_id);
                    Some(Self { engine_id })
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        let _ = DISPATCHING.try_with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|id| *id == self.engine_id) {
                active.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::throwable;

    #[derive(Debug, thiserror::Error)]
    #[error("forced")]
    struct Forced;

    #[test]
    fn test_entry_exit_ids() {
        let seq = InvokeIdSequencer::default();
        let ctx = ThreadContext::new(9001, 1);

        let outer = ctx.on_entry(&seq).unwrap();
        assert_eq!(outer.frame.invoke_id, 1000);
        assert_eq!(outer.frame.process_id, 1000);
        assert!(outer.consistent);

        let inner = ctx.on_entry(&seq).unwrap();
        assert_eq!(inner.frame.process_id, 1000);
        assert_eq!(inner.frame.invoke_id, 1001);
        assert!(inner.consistent);
        assert_eq!(ctx.depth(), 2);

        assert_eq!(ctx.on_exit().unwrap().frame.invoke_id, 1001);
        let last = ctx.on_exit().unwrap();
        assert_eq!(last.frame.invoke_id, 1000);
        assert!(last.consistent);
        assert!(ctx.is_empty());
        assert!(ctx.on_exit().is_none());

        ctx.release_if_empty();
        assert!(ctx.snapshot().is_none());
    }

    #[test]
    fn test_ignore_marker_cleared_by_other_process() {
        let seq = InvokeIdSequencer::default();
        let ctx = ThreadContext::new(9002, 1);
        ctx.on_entry(&seq);

        ctx.mark_ignored(1000);
        assert!(ctx.is_ignored(1000));
        assert!(!ctx.is_ignored(2000));
        assert!(!ctx.is_ignored(1000));

        ctx.on_exit();
        ctx.release_if_empty();
    }

    #[test]
    fn test_pending_throw_matches_identity() {
        let ctx = ThreadContext::new(9003, 1);
        let forced = throwable(Forced);
        let other = throwable(Forced);

        ctx.set_pending_throw(&forced);
        assert!(!ctx.take_pending_throw(Some(&other)));
        // consumed by the previous check
        assert!(!ctx.take_pending_throw(Some(&forced)));

        ctx.set_pending_throw(&forced);
        assert!(ctx.take_pending_throw(Some(&forced)));
        ctx.release_if_empty();
    }

    #[test]
    fn test_release_keeps_busy_contexts() {
        let seq = InvokeIdSequencer::default();
        let busy = ThreadContext::new(9004, 1);
        let idle = ThreadContext::new(9004, 2);
        busy.on_entry(&seq);
        idle.mark_ignored(5);

        busy.release_if_empty();
        idle.release_if_empty();
        assert_eq!(busy.depth(), 1);
        assert!(idle.snapshot().is_none());

        busy.on_exit();
        busy.release_if_empty();
        assert!(busy.snapshot().is_none());
    }

    #[test]
    fn test_newer_generation_discards_old_frames() {
        let seq = InvokeIdSequencer::default();
        let first = ThreadContext::new(9005, 1).with_generation(1);
        first.on_entry(&seq);
        first.on_entry(&seq);
        first.mark_ignored(1000);
        assert_eq!(first.depth(), 2);

        let second = ThreadContext::new(9005, 1).with_generation(2);
        assert_eq!(second.depth(), 0);
        assert!(second.snapshot().is_none());

        let root = second.on_entry(&seq).unwrap();
        assert_eq!(root.frame.process_id, root.frame.invoke_id);
        assert!(root.consistent);
        assert!(!second.is_ignored(1000));
        // the old activation neither sees nor touches the new frames
        assert_eq!(first.depth(), 0);
        assert!(first.on_entry(&seq).is_none());
        assert!(first.on_exit().is_none());
        assert_eq!(second.depth(), 1);

        second.on_exit();
        second.release_if_empty();
        assert_eq!(live_contexts(), 0);
    }

    #[test]
    fn test_discard_drops_open_frames() {
        let seq = InvokeIdSequencer::default();
        let ctx = ThreadContext::new(9006, 1).with_generation(4);
        ctx.on_entry(&seq);

        ThreadContext::new(9006, 1).discard();
        assert!(ctx.snapshot().is_none());
        assert!(ctx.on_exit().is_none());
    }

    #[test]
    fn test_root_disagreement_is_inconsistent() {
        let seq = InvokeIdSequencer::default();
        let ctx = ThreadContext::new(9007, 1);
        ctx.on_entry(&seq);
        ctx.set_root(1001);

        let nested = ctx.on_entry(&seq).unwrap();
        assert_eq!(nested.frame.invoke_id, 1001);
        assert!(!nested.consistent);

        ctx.on_exit();
        let last = ctx.on_exit().unwrap();
        assert_eq!(last.frame.process_id, 1001);
        assert!(!last.consistent);
        ctx.release_if_empty();
    }

    #[test]
    fn test_dispatch_scope_is_reentrant_per_engine() {
        let outer = DispatchScope::enter(77).unwrap();
        assert!(DispatchScope::enter(77).is_none());
        let other = DispatchScope::enter(78);
        assert!(other.is_some());
        drop(outer);
        assert!(DispatchScope::enter(77).is_some());
    }
}
