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

//! Notification dispatch and control-flow resolution.
//!
//! For each notification the dispatcher
//! - looks the listener up,
//! - pushes or pops the thread's invocation frame,
//! - applies the ignore marker and the immediate-outcome separator,
//! - borrows and fills a pooled event,
//! - calls the listener and turns its decision into an [`Outcome`].
//!
//! Argument replacements recorded on a `BEFORE` event are collected after delivery
//! and handed back through [`Dispatcher::dispatch_before`].
//!
//! Everything runs inline on the notifying thread.

use crate::config::{EngineConfig, MismatchPolicy};
use crate::error::{DispatchError, DispatchResult};
use crate::event::{BeforeSite, CallSite, Event, EventKind, Throwable, Value};
use crate::listener::ProcessControl;
use crate::pool::{EventPool, PooledEvent};
use crate::registry::{ListenerRegistry, Registration};
use crate::stack::{DispatchScope, Frame, InvokeIdSequencer, ThreadContext, Transition};
use crate::telemetry::EngineStats;
use std::fmt;
use std::sync::Arc;

/// What the instrumented code should do after a notification.
#[derive(Clone, Default)]
pub enum Outcome {
    /// Continue as if nothing happened.
    #[default]
    Proceed,
    /// Return this value from the instrumented method.
    ReturnWith(Value),
    /// Raise this exception from the instrumented method.
    ThrowWith(Throwable),
}

impl Outcome {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Outcome::Proceed)
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Outcome::ReturnWith(_))
    }

    pub fn is_throw(&self) -> bool {
        matches!(self, Outcome::ThrowWith(_))
    }

    /// The forced return value, typed.
    pub fn return_value<T: Clone + 'static>(&self) -> Option<T> {
        match self {
            Outcome::ReturnWith(value) => value.downcast_ref::<T>().cloned(),
            _ => None,
        }
    }

    pub fn throwable(&self) -> Option<&Throwable> {
        match self {
            Outcome::ThrowWith(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Proceed => f.write_str("Proceed"),
            Outcome::ReturnWith(_) => f.write_str("ReturnWith(..)"),
            Outcome::ThrowWith(t) => write!(f, "ThrowWith({})", t),
        }
    }
}

/// A raw notification from instrumented code.
#[derive(Clone, Copy)]
pub enum Notification<'a> {
    Before {
        site: &'a BeforeSite,
        arguments: &'a [Value],
        receiver: Option<&'a Value>,
    },
    Return {
        value: Option<&'a Value>,
    },
    Throws {
        throwable: &'a Throwable,
    },
    Line {
        line: i32,
    },
    CallBefore {
        site: &'a CallSite,
    },
    CallReturn,
    CallThrows {
        exception_type: &'a str,
    },
}

impl Notification<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Notification::Before { .. } => EventKind::Before,
            Notification::Return { .. } => EventKind::Return,
            Notification::Throws { .. } => EventKind::Throws,
            Notification::Line { .. } => EventKind::Line,
            Notification::CallBefore { .. } => EventKind::CallBefore,
            Notification::CallReturn => EventKind::CallReturn,
            Notification::CallThrows { .. } => EventKind::CallThrows,
        }
    }
}

/// Releases the thread's state for a listener once its stack has drained.
struct ReleaseOnDrop(ThreadContext);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release_if_empty();
    }
}

/// Dispatches notifications for one engine.
pub struct Dispatcher {
    engine_id: u64,
    registry: Arc<ListenerRegistry>,
    pool: Arc<EventPool>,
    sequencer: InvokeIdSequencer,
    config: EngineConfig,
    stats: EngineStats,
}

impl Dispatcher {
    pub fn new(
        engine_id: u64,
        registry: Arc<ListenerRegistry>,
        pool: Arc<EventPool>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine_id,
            registry,
            pool,
            sequencer: InvokeIdSequencer::new(config.initial_invoke_id),
            config,
            stats: EngineStats::new(),
        }
    }

    pub fn engine_id(&self) -> u64 {
        self.engine_id
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Handle of the current thread's state for `listener_id`, bound to its current
    /// activation when the listener is registered.
    pub fn thread_context(&self, listener_id: u32) -> ThreadContext {
        let ctx = ThreadContext::new(self.engine_id, listener_id);
        match self.registry.lookup(listener_id) {
            Some(registration) => ctx.with_generation(registration.generation),
            None => ctx,
        }
    }

    /// Dispatch one notification for `listener_id`.
    ///
    /// `LINE` and `CALL_*` notifications always resolve to [`Outcome::Proceed`] unless
    /// an interrupting listener fails. Argument replacements made on a `BEFORE` event
    /// are dropped here; use [`dispatch_before`](Self::dispatch_before) to keep them.
    pub fn dispatch(
        &self,
        listener_id: u32,
        notification: Notification<'_>,
    ) -> DispatchResult<Outcome> {
        self.route(listener_id, notification, &mut Vec::new())
    }

    /// Dispatch a `BEFORE` notification and write the listener's argument
    /// replacements back into `arguments`.
    pub fn dispatch_before(
        &self,
        listener_id: u32,
        site: &BeforeSite,
        arguments: &mut [Value],
        receiver: Option<&Value>,
    ) -> DispatchResult<Outcome> {
        let mut changes = Vec::new();
        let outcome = self.route(
            listener_id,
            Notification::Before {
                site,
                arguments: &*arguments,
                receiver,
            },
            &mut changes,
        );
        for (index, value) in changes {
            if let Some(slot) = arguments.get_mut(index) {
                tracing::trace!(listener_id = listener_id, index = index, "Argument replaced");
                *slot = value;
            }
        }
        outcome
    }

    fn route(
        &self,
        listener_id: u32,
        notification: Notification<'_>,
        changes: &mut Vec<(usize, Value)>,
    ) -> DispatchResult<Outcome> {
        self.stats.record_notification();

        let Some(registration) = self.registry.lookup(listener_id) else {
            // frames opened before a freeze must not outlive it
            ThreadContext::new(self.engine_id, listener_id).discard();
            return Ok(Outcome::Proceed);
        };
        let kind = notification.kind();
        if kind.is_in_frame() && !registration.subscribes(kind) {
            return Ok(Outcome::Proceed);
        }

        let _scope = if self.config.self_call_barrier {
            match DispatchScope::enter(self.engine_id) {
                Some(scope) => Some(scope),
                None => {
                    tracing::debug!(
                        listener_id = listener_id,
                        event_kind = %kind,
                        "Notification raised inside dispatch, skipped"
                    );
                    return Ok(Outcome::Proceed);
                }
            }
        } else {
            None
        };

        let ctx = ThreadContext::new(self.engine_id, listener_id)
            .with_generation(registration.generation);
        let _release = ReleaseOnDrop(ctx);

        match notification {
            Notification::Before {
                site,
                arguments,
                receiver,
            } => self.on_before(&registration, ctx, site, arguments, receiver, changes),
            Notification::Return { value } => self.on_return(&registration, ctx, value),
            Notification::Throws { throwable } => self.on_throws(&registration, ctx, throwable),
            in_frame => self
                .on_in_frame(&registration, ctx, in_frame)
                .map(|()| Outcome::Proceed),
        }
    }

    fn on_before(
        &self,
        registration: &Registration,
        ctx: ThreadContext,
        site: &BeforeSite,
        arguments: &[Value],
        receiver: Option<&Value>,
        changes: &mut Vec<(usize, Value)>,
    ) -> DispatchResult<Outcome> {
        let Some(transition) = ctx.on_entry(&self.sequencer) else {
            return Ok(Outcome::Proceed);
        };
        if let Err(err) = self.check_transition(registration, EventKind::Before, transition) {
            ctx.on_exit();
            return Err(err);
        }

        let frame = transition.frame;
        if self.suppressed(ctx, frame, EventKind::Before) {
            return Ok(Outcome::Proceed);
        }
        let effective = ctx.classify(EventKind::Before);
        if !registration.subscribes(effective) {
            return Ok(Outcome::Proceed);
        }

        let event = self.pool.borrow_before(
            frame.process_id,
            frame.invoke_id,
            site,
            arguments,
            receiver,
        );
        let outcome = self.deliver(registration, ctx, frame, EventKind::Before, &event);
        changes.extend(event.take_argument_changes());
        outcome
    }

    fn on_return(
        &self,
        registration: &Registration,
        ctx: ThreadContext,
        value: Option<&Value>,
    ) -> DispatchResult<Outcome> {
        // a forced throw that never came back is stale now
        ctx.take_pending_throw(None);

        let Some(frame) = self.exit_frame(registration, ctx, EventKind::Return)? else {
            return Ok(Outcome::Proceed);
        };
        let effective = ctx.classify(EventKind::Return);
        if !registration.subscribes(effective) {
            return Ok(Outcome::Proceed);
        }

        let event = self
            .pool
            .borrow_returning(effective, frame.process_id, frame.invoke_id, value);
        self.deliver(registration, ctx, frame, EventKind::Return, &event)
    }

    fn on_throws(
        &self,
        registration: &Registration,
        ctx: ThreadContext,
        throwable: &Throwable,
    ) -> DispatchResult<Outcome> {
        if ctx.take_pending_throw(Some(throwable)) {
            // our own forced throw unwinding; its frame is already closed
            return Ok(Outcome::ThrowWith(Arc::clone(throwable)));
        }

        let Some(frame) = self.exit_frame(registration, ctx, EventKind::Throws)? else {
            return Ok(Outcome::Proceed);
        };
        let effective = ctx.classify(EventKind::Throws);
        if !registration.subscribes(effective) {
            return Ok(Outcome::Proceed);
        }

        let event = self
            .pool
            .borrow_throwing(effective, frame.process_id, frame.invoke_id, throwable);
        self.deliver(registration, ctx, frame, EventKind::Throws, &event)
    }

    /// Pop the frame for an exit notification. `None` when nothing should be delivered.
    fn exit_frame(
        &self,
        registration: &Registration,
        ctx: ThreadContext,
        kind: EventKind,
    ) -> DispatchResult<Option<Frame>> {
        let Some(transition) = ctx.on_exit() else {
            tracing::debug!(
                listener_id = registration.listener_id,
                event_kind = %kind,
                "No open frame for exit notification"
            );
            return Ok(None);
        };
        self.check_transition(registration, kind, transition)?;

        let frame = transition.frame;
        if self.suppressed(ctx, frame, kind) {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn on_in_frame(
        &self,
        registration: &Registration,
        ctx: ThreadContext,
        notification: Notification<'_>,
    ) -> DispatchResult<()> {
        let kind = notification.kind();
        let Some(frame) = ctx.current() else {
            return Ok(());
        };
        if self.suppressed(ctx, frame, kind) {
            return Ok(());
        }
        ctx.classify(kind);

        let (pid, iid) = (frame.process_id, frame.invoke_id);
        let event = match notification {
            Notification::Line { line } => self.pool.borrow_line(pid, iid, line),
            Notification::CallBefore { site } => self.pool.borrow_call_before(pid, iid, site),
            Notification::CallReturn => self.pool.borrow_call_return(pid, iid),
            Notification::CallThrows { exception_type } => {
                self.pool.borrow_call_throws(pid, iid, exception_type)
            }
            Notification::Before { .. } | Notification::Return { .. } | Notification::Throws { .. } => {
                return Ok(());
            }
        };

        match self.invoke_listener(registration, &event) {
            Ok(control) => {
                if control.ignores_process() {
                    ctx.mark_ignored(pid);
                }
                if !matches!(
                    control,
                    ProcessControl::Proceed | ProcessControl::NoneImmediately { .. }
                ) {
                    tracing::debug!(
                        listener_id = registration.listener_id,
                        event_kind = %kind,
                        control = control.label(),
                        "Redirect requested on an in-frame event, dropped"
                    );
                }
                Ok(())
            }
            Err(err) => self.listener_failed(registration, kind, err).map(|_| ()),
        }
    }

    /// Hand `event` to the listener and resolve its decision.
    fn deliver(
        &self,
        registration: &Registration,
        ctx: ThreadContext,
        frame: Frame,
        notified: EventKind,
        event: &Event,
    ) -> DispatchResult<Outcome> {
        match self.invoke_listener(registration, event) {
            Ok(ProcessControl::Proceed) => Ok(Outcome::Proceed),
            Ok(control) => Ok(self.resolve_control(registration, ctx, frame, notified, control)),
            Err(err) => {
                if registration.interrupting && notified == EventKind::Before {
                    // the call site will not report an exit for this frame
                    ctx.on_exit();
                }
                self.listener_failed(registration, event.kind(), err)
            }
        }
    }

    fn invoke_listener(
        &self,
        registration: &Registration,
        event: &Event,
    ) -> Result<ProcessControl, anyhow::Error> {
        self.stats.record_delivery();
        tracing::debug!(
            listener_id = registration.listener_id,
            event_kind = %event.kind(),
            process_id = event.process_id(),
            invoke_id = event.invoke_id(),
            "Delivering event"
        );
        registration.listener.on_event(event)
    }

    fn listener_failed(
        &self,
        registration: &Registration,
        kind: EventKind,
        err: anyhow::Error,
    ) -> DispatchResult<Outcome> {
        self.stats.record_listener_failure();
        if registration.interrupting {
            tracing::warn!(
                listener_id = registration.listener_id,
                listener = %registration.listener.name(),
                event_kind = %kind,
                error = %err,
                "Interrupting listener failed"
            );
            return Err(DispatchError::Interrupted {
                listener_id: registration.listener_id,
                kind,
                source: err,
            });
        }

        tracing::warn!(
            listener_id = registration.listener_id,
            listener = %registration.listener.name(),
            event_kind = %kind,
            error = %err,
            "Listener failed, proceeding"
        );
        Ok(Outcome::Proceed)
    }

    fn resolve_control(
        &self,
        registration: &Registration,
        ctx: ThreadContext,
        frame: Frame,
        notified: EventKind,
        control: ProcessControl,
    ) -> Outcome {
        let ignore = control.ignores_process();
        if ignore {
            ctx.mark_ignored(frame.process_id);
        }

        tracing::debug!(
            listener_id = registration.listener_id,
            event_kind = %notified,
            process_id = frame.process_id,
            invoke_id = frame.invoke_id,
            control = control.label(),
            ignore_process = ignore,
            "Listener changed control flow"
        );

        // a suppressed process gets no immediate event either
        if !ignore {
            ctx.record_override(&control);
        }

        let outcome = match control {
            ProcessControl::ReturnImmediately { value, .. } => {
                self.stats.record_override();
                if !ignore {
                    self.compensate(registration, ctx, frame, EventKind::Return, |pool, kind| {
                        pool.borrow_returning(kind, frame.process_id, frame.invoke_id, Some(&value))
                    });
                }
                Outcome::ReturnWith(value)
            }
            ProcessControl::ThrowsImmediately { throwable, .. } => {
                self.stats.record_override();
                if !ignore {
                    self.compensate(registration, ctx, frame, EventKind::Throws, |pool, kind| {
                        pool.borrow_throwing(kind, frame.process_id, frame.invoke_id, &throwable)
                    });
                }
                if notified != EventKind::Throws {
                    ctx.set_pending_throw(&throwable);
                }
                Outcome::ThrowWith(throwable)
            }
            ProcessControl::NoneImmediately { .. } | ProcessControl::Proceed => {
                return Outcome::Proceed;
            }
        };

        if notified == EventKind::Before {
            ctx.on_exit();
        }
        outcome
    }

    /// Deliver the immediate event standing in for the exit the call site will not report.
    fn compensate<'p>(
        &'p self,
        registration: &Registration,
        ctx: ThreadContext,
        frame: Frame,
        exit: EventKind,
        borrow: impl FnOnce(&'p EventPool, EventKind) -> PooledEvent<'p>,
    ) {
        let effective = ctx.classify(exit);
        if !registration.subscribes(effective) {
            return;
        }

        let event = borrow(self.pool.as_ref(), effective);
        match self.invoke_listener(registration, &event) {
            Ok(ProcessControl::Proceed) => {}
            Ok(control) => {
                tracing::debug!(
                    listener_id = registration.listener_id,
                    event_kind = %effective,
                    invoke_id = frame.invoke_id,
                    control = control.label(),
                    "Control returned for an immediate event, ignored"
                );
            }
            Err(err) => {
                self.stats.record_listener_failure();
                tracing::warn!(
                    listener_id = registration.listener_id,
                    event_kind = %effective,
                    invoke_id = frame.invoke_id,
                    error = %err,
                    "Listener failed on immediate event"
                );
            }
        }
    }

    fn suppressed(&self, ctx: ThreadContext, frame: Frame, kind: EventKind) -> bool {
        if ctx.is_ignored(frame.process_id) {
            self.stats.record_suppressed();
            tracing::debug!(
                listener_id = ctx.listener_id(),
                event_kind = %kind,
                process_id = frame.process_id,
                "Process ignored, event suppressed"
            );
            return true;
        }
        false
    }

    fn check_transition(
        &self,
        registration: &Registration,
        kind: EventKind,
        transition: Transition,
    ) -> DispatchResult<()> {
        if transition.consistent {
            return Ok(());
        }

        self.stats.record_mismatch();
        let frame = transition.frame;
        tracing::warn!(
            listener_id = registration.listener_id,
            event_kind = %kind,
            process_id = frame.process_id,
            invoke_id = frame.invoke_id,
            "Invocation stack mismatch"
        );
        match self.config.mismatch_policy {
            MismatchPolicy::Warn => Ok(()),
            MismatchPolicy::Strict => Err(DispatchError::StackMismatch {
                listener_id: registration.listener_id,
                process_id: frame.process_id,
                invoke_id: frame.invoke_id,
            }),
        }
    }
}
