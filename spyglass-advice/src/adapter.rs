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

//! Raw event stream to advice callbacks.
//!
//! [`AdviceAdapter`] wraps an [`AdviceListener`] and keeps its own per-thread stack
//! of open advices, so `RETURN` is delivered with the same [`Advice`] its `BEFORE`
//! created and nested-call events carry the call site seen at `CALL_BEFORE`.

use crate::advice::Advice;
use spyglass_core::{
    CallSite, Event, EventKind, EventKindSet, EventListener, ListenerResult, ProcessControl,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Callbacks for one invocation at a time. Every hook defaults to proceeding.
pub trait AdviceListener: Send + Sync {
    fn before(&self, _advice: &Advice) -> ListenerResult {
        Ok(ProcessControl::Proceed)
    }

    /// Normal or forced return. Falls through to [`after`](AdviceListener::after).
    fn after_returning(&self, advice: &Advice) -> ListenerResult {
        self.after(advice)
    }

    /// Normal or forced throw. Falls through to [`after`](AdviceListener::after).
    fn after_throwing(&self, advice: &Advice) -> ListenerResult {
        self.after(advice)
    }

    /// Any exit.
    fn after(&self, _advice: &Advice) -> ListenerResult {
        Ok(ProcessControl::Proceed)
    }

    fn before_line(&self, _advice: &Advice, _line: i32) -> ListenerResult {
        Ok(ProcessControl::Proceed)
    }

    fn before_call(&self, _advice: &Advice, _call: &CallSite) -> ListenerResult {
        Ok(ProcessControl::Proceed)
    }

    fn after_call_returning(&self, advice: &Advice, call: &CallSite) -> ListenerResult {
        self.after_call(advice, call)
    }

    fn after_call_throwing(
        &self,
        advice: &Advice,
        call: &CallSite,
        _exception_type: &str,
    ) -> ListenerResult {
        self.after_call(advice, call)
    }

    /// Any nested-call exit.
    fn after_call(&self, _advice: &Advice, _call: &CallSite) -> ListenerResult {
        Ok(ProcessControl::Proceed)
    }

    fn name(&self) -> &str {
        "advice"
    }
}

/// Kinds an [`AdviceAdapter`] needs to pair every exit with its entry.
pub const ADVICE_EVENT_KINDS: EventKindSet = EventKindSet::all();

static NEXT_ADAPTER_ID: AtomicU64 = AtomicU64::new(1);

struct OpFrame {
    advice: Arc<Advice>,
    call: Option<CallSite>,
}

thread_local! {
    static OP_STACKS: RefCell<HashMap<u64, Vec<OpFrame>>> = RefCell::new(HashMap::new());
}

/// Exposes an [`AdviceListener`] as an [`EventListener`].
///
/// Activate it with [`ADVICE_EVENT_KINDS`]: forced returns and throws reach
/// the advice side through the `IMMEDIATELY_*` events, without them the frame of a
/// redirected invocation stays open until the next call tree starts on the thread.
pub struct AdviceAdapter<L> {
    id: u64,
    listener: L,
}

impl<L> AdviceAdapter<L> {
    /// Open advices on the calling thread.
    pub fn depth(&self) -> usize {
        OP_STACKS
            .try_with(|stacks| stacks.borrow().get(&self.id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn with_stack<R>(&self, f: impl FnOnce(&mut Vec<OpFrame>) -> R) -> Option<R> {
        OP_STACKS
            .try_with(|stacks| {
                let mut stacks = stacks.borrow_mut();
                let stack = stacks.entry(self.id).or_default();
                let result = f(stack);
                if stack.is_empty() {
                    stacks.remove(&self.id);
                    if stacks.is_empty() {
                        *stacks = HashMap::new();
                    }
                }
                result
            })
            .ok()
    }

    fn discard_all(&self) {
        self.with_stack(|stack| stack.clear());
    }
}

impl<L: AdviceListener> AdviceAdapter<L> {
    pub fn new(listener: L) -> Self {
        Self {
            id: NEXT_ADAPTER_ID.fetch_add(1, Ordering::Relaxed),
            listener,
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    fn open(&self, event: &Event) -> Option<Arc<Advice>> {
        self.with_stack(|stack| {
            if event.process_id() == event.invoke_id() && !stack.is_empty() {
                debug!(
                    listener = self.listener.name(),
                    stale = stack.len(),
                    "Dropping advices left open by an earlier call tree"
                );
                stack.clear();
            }
            let parent = stack.last().map(|frame| Arc::clone(&frame.advice));
            let advice = Arc::new(Advice::from_before(event, parent)?);
            stack.push(OpFrame {
                advice: Arc::clone(&advice),
                call: None,
            });
            Some(advice)
        })
        .flatten()
    }

    /// Pops down to the frame of `invoke_id`. Leaves the stack alone when no frame matches.
    fn close(&self, invoke_id: u64) -> Option<Arc<Advice>> {
        self.with_stack(|stack| {
            let index = stack
                .iter()
                .rposition(|frame| frame.advice.invoke_id() == invoke_id)?;
            if index + 1 != stack.len() {
                debug!(
                    listener = self.listener.name(),
                    invoke_id,
                    skipped = stack.len() - index - 1,
                    "Unwinding advices without an exit"
                );
            }
            stack.truncate(index + 1);
            stack.pop().map(|frame| frame.advice)
        })
        .flatten()
    }

    fn peek<R>(&self, invoke_id: u64, f: impl FnOnce(&mut OpFrame) -> R) -> Option<R> {
        self.with_stack(|stack| {
            let frame = stack.last_mut()?;
            if frame.advice.invoke_id() != invoke_id {
                return None;
            }
            Some(f(frame))
        })
        .flatten()
    }

    fn current(&self, invoke_id: u64) -> Option<Arc<Advice>> {
        self.peek(invoke_id, |frame| Arc::clone(&frame.advice))
    }

    fn on_before(&self, event: &Event) -> ListenerResult {
        let Some(advice) = self.open(event) else {
            return Ok(ProcessControl::Proceed);
        };
        let control = self.listener.before(&advice)?;
        for (index, value) in advice.take_changed_arguments() {
            event.change_argument(index, value);
        }
        if control.ignores_process() {
            // nothing more of this call tree will be delivered
            self.discard_all();
        }
        Ok(control)
    }

    fn on_exit(&self, event: &Event) -> ListenerResult {
        let Some(advice) = self.close(event.invoke_id()) else {
            trace!(
                listener = self.listener.name(),
                invoke_id = event.invoke_id(),
                "Exit without a matching advice"
            );
            return Ok(ProcessControl::Proceed);
        };

        let control = match event.kind() {
            EventKind::Return | EventKind::ImmediatelyReturn => {
                advice.apply_return(event.return_value());
                self.listener.after_returning(&advice)?
            }
            _ => {
                advice.apply_throws(event.throwable());
                self.listener.after_throwing(&advice)?
            }
        };
        if control.ignores_process() {
            self.discard_all();
        }
        Ok(control)
    }

    fn on_line(&self, event: &Event) -> ListenerResult {
        match (self.current(event.invoke_id()), event.line()) {
            (Some(advice), Some(line)) => self.listener.before_line(&advice, line),
            _ => Ok(ProcessControl::Proceed),
        }
    }

    fn on_call_before(&self, event: &Event) -> ListenerResult {
        let Some(site) = event.call_site() else {
            return Ok(ProcessControl::Proceed);
        };
        // owners arrive in internal form (`a/b/C`)
        let call = CallSite {
            owner: site.owner.replace('/', ".").into(),
            ..site.clone()
        };
        let advice = self.peek(event.invoke_id(), |frame| {
            frame.call = Some(call.clone());
            Arc::clone(&frame.advice)
        });
        match advice {
            Some(advice) => self.listener.before_call(&advice, &call),
            None => Ok(ProcessControl::Proceed),
        }
    }

    fn on_call_exit(&self, event: &Event) -> ListenerResult {
        let Some((advice, call)) = self
            .peek(event.invoke_id(), |frame| {
                frame
                    .call
                    .take()
                    .map(|call| (Arc::clone(&frame.advice), call))
            })
            .flatten()
        else {
            return Ok(ProcessControl::Proceed);
        };

        if event.kind() == EventKind::CallReturn {
            self.listener.after_call_returning(&advice, &call)
        } else {
            let exception_type = event.exception_type().unwrap_or_default();
            self.listener
                .after_call_throwing(&advice, &call, exception_type)
        }
    }
}

impl<L: AdviceListener> EventListener for AdviceAdapter<L> {
    fn on_event(&self, event: &Event) -> ListenerResult {
        match event.kind() {
            EventKind::Before => self.on_before(event),
            EventKind::Return
            | EventKind::Throws
            | EventKind::ImmediatelyReturn
            | EventKind::ImmediatelyThrows => self.on_exit(event),
            EventKind::Line => self.on_line(event),
            EventKind::CallBefore => self.on_call_before(event),
            EventKind::CallReturn | EventKind::CallThrows => self.on_call_exit(event),
        }
    }

    fn name(&self) -> &str {
        self.listener.name()
    }
}

impl<L> Drop for AdviceAdapter<L> {
    fn drop(&mut self) {
        self.discard_all();
    }
}
