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

//! Event kinds and the event objects handed to listeners.
//!
//! Events are mutable in place: the [`EventPool`](crate::pool::EventPool) hands out
//! recycled instances and overwrites their fields on every borrow, so listeners only
//! ever see an event by reference for the duration of one callback.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A type-erased value from the instrumented program (argument, receiver, return value).
pub type Value = Arc<dyn Any + Send + Sync>;

/// An exception raised by (or forced into) the instrumented program.
pub type Throwable = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Id carried by an idle pooled event. Real ids start well above it.
pub const UNASSIGNED_ID: u64 = 0;

/// Line number carried by events that have no line information.
pub const NO_LINE: i32 = -1;

/// Wrap a host value for use as an argument, receiver or return value.
pub fn value<T: Any + Send + Sync>(v: T) -> Value {
    Arc::new(v)
}

/// Wrap an error for use as an exception.
pub fn throwable<E: std::error::Error + Send + Sync + 'static>(e: E) -> Throwable {
    Arc::new(e)
}

/// Kind of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Before,
    Return,
    Throws,
    Line,
    CallBefore,
    CallReturn,
    CallThrows,
    ImmediatelyReturn,
    ImmediatelyThrows,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 9] = [
        EventKind::Before,
        EventKind::Return,
        EventKind::Throws,
        EventKind::Line,
        EventKind::CallBefore,
        EventKind::CallReturn,
        EventKind::CallThrows,
        EventKind::ImmediatelyReturn,
        EventKind::ImmediatelyThrows,
    ];

    /// Number of kinds.
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index of this kind, usable for per-kind arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Before => "BEFORE",
            EventKind::Return => "RETURN",
            EventKind::Throws => "THROWS",
            EventKind::Line => "LINE",
            EventKind::CallBefore => "CALL_BEFORE",
            EventKind::CallReturn => "CALL_RETURN",
            EventKind::CallThrows => "CALL_THROWS",
            EventKind::ImmediatelyReturn => "IMMEDIATELY_RETURN",
            EventKind::ImmediatelyThrows => "IMMEDIATELY_THROWS",
        }
    }

    /// Kinds that push or pop an invocation frame.
    #[inline]
    pub const fn is_frame_boundary(self) -> bool {
        matches!(self, EventKind::Before | EventKind::Return | EventKind::Throws)
    }

    /// Kinds that are observed inside an open frame without changing the stack.
    #[inline]
    pub const fn is_in_frame(self) -> bool {
        matches!(
            self,
            EventKind::Line | EventKind::CallBefore | EventKind::CallReturn | EventKind::CallThrows
        )
    }

    /// Kinds synthesized after a process-control override.
    #[inline]
    pub const fn is_immediate(self) -> bool {
        matches!(self, EventKind::ImmediatelyReturn | EventKind::ImmediatelyThrows)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of event kinds a listener subscribes to.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventKindSet(u16);

impl EventKindSet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every kind.
    pub const fn all() -> Self {
        Self((1 << EventKind::COUNT) - 1)
    }

    /// `BEFORE`, `RETURN` and `THROWS`.
    pub const fn invocation() -> Self {
        Self::empty()
            .with(EventKind::Before)
            .with(EventKind::Return)
            .with(EventKind::Throws)
    }

    pub fn of(kinds: &[EventKind]) -> Self {
        kinds.iter().copied().collect()
    }

    #[must_use]
    pub const fn with(self, kind: EventKind) -> Self {
        Self(self.0 | (1 << kind.index()))
    }

    #[inline]
    pub const fn contains(&self, kind: EventKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    pub fn insert(&mut self, kind: EventKind) {
        self.0 |= 1 << kind.index();
    }

    pub fn remove(&mut self, kind: EventKind) {
        self.0 &= !(1 << kind.index());
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = EventKind> + '_ {
        EventKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<EventKind> for EventKindSet {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        let mut set = Self::empty();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

impl fmt::Debug for EventKindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Identity of an instrumented method, supplied with every `BEFORE` notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BeforeSite {
    pub class_name: Arc<str>,
    pub method_name: Arc<str>,
    pub method_desc: Arc<str>,
}

impl BeforeSite {
    pub fn new(
        class_name: impl Into<Arc<str>>,
        method_name: impl Into<Arc<str>>,
        method_desc: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            method_desc: method_desc.into(),
        }
    }
}

impl fmt::Display for BeforeSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}{}", self.class_name, self.method_name, self.method_desc)
    }
}

/// A call made from inside an instrumented method body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub line: i32,
    pub owner: Arc<str>,
    pub name: Arc<str>,
    pub desc: Arc<str>,
}

impl CallSite {
    pub fn new(
        line: i32,
        owner: impl Into<Arc<str>>,
        name: impl Into<Arc<str>>,
        desc: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            line,
            owner: owner.into(),
            name: name.into(),
            desc: desc.into(),
        }
    }
}

/// Argument replacements requested by a listener during one `BEFORE` delivery.
#[derive(Default)]
pub struct ArgumentChanges(Mutex<Vec<(usize, Value)>>);

impl ArgumentChanges {
    fn record(&self, index: usize, value: Value) {
        let mut changes = self.0.lock();
        changes.retain(|(i, _)| *i != index);
        changes.push((index, value));
    }

    fn take(&self) -> Vec<(usize, Value)> {
        std::mem::take(&mut *self.0.lock())
    }

    fn get(&self, index: usize) -> Option<Value> {
        self.0
            .lock()
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, v)| Arc::clone(v))
    }

    fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Clone for ArgumentChanges {
    fn clone(&self) -> Self {
        Self(Mutex::new(self.0.lock().clone()))
    }
}

/// Kind-specific part of an [`Event`].
#[derive(Clone)]
pub enum EventPayload {
    Before {
        site: Option<BeforeSite>,
        receiver: Option<Value>,
        arguments: Vec<Value>,
        changes: ArgumentChanges,
    },
    Return {
        value: Option<Value>,
    },
    Throws {
        throwable: Option<Throwable>,
    },
    Line {
        line: i32,
    },
    CallBefore {
        site: Option<CallSite>,
    },
    CallReturn,
    CallThrows {
        exception_type: Option<Arc<str>>,
    },
    ImmediatelyReturn {
        value: Option<Value>,
    },
    ImmediatelyThrows {
        throwable: Option<Throwable>,
    },
}

impl EventPayload {
    /// An empty payload of the given kind.
    pub fn blank(kind: EventKind) -> Self {
        match kind {
            EventKind::Before => EventPayload::Before {
                site: None,
                receiver: None,
                arguments: Vec::new(),
                changes: ArgumentChanges::default(),
            },
            EventKind::Return => EventPayload::Return { value: None },
            EventKind::Throws => EventPayload::Throws { throwable: None },
            EventKind::Line => EventPayload::Line { line: NO_LINE },
            EventKind::CallBefore => EventPayload::CallBefore { site: None },
            EventKind::CallReturn => EventPayload::CallReturn,
            EventKind::CallThrows => EventPayload::CallThrows {
                exception_type: None,
            },
            EventKind::ImmediatelyReturn => EventPayload::ImmediatelyReturn { value: None },
            EventKind::ImmediatelyThrows => EventPayload::ImmediatelyThrows { throwable: None },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Before { .. } => EventKind::Before,
            EventPayload::Return { .. } => EventKind::Return,
            EventPayload::Throws { .. } => EventKind::Throws,
            EventPayload::Line { .. } => EventKind::Line,
            EventPayload::CallBefore { .. } => EventKind::CallBefore,
            EventPayload::CallReturn => EventKind::CallReturn,
            EventPayload::CallThrows { .. } => EventKind::CallThrows,
            EventPayload::ImmediatelyReturn { .. } => EventKind::ImmediatelyReturn,
            EventPayload::ImmediatelyThrows { .. } => EventKind::ImmediatelyThrows,
        }
    }
}

/// One observation delivered to a listener.
#[derive(Clone)]
pub struct Event {
    process_id: u64,
    invoke_id: u64,
    payload: EventPayload,
}

impl Event {
    /// A fresh event of `kind` with unassigned ids and an empty payload.
    pub fn blank(kind: EventKind) -> Self {
        Self {
            process_id: UNASSIGNED_ID,
            invoke_id: UNASSIGNED_ID,
            payload: EventPayload::blank(kind),
        }
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Id of the root invocation of the call tree this event belongs to.
    #[inline]
    pub fn process_id(&self) -> u64 {
        self.process_id
    }

    /// Id of the invocation frame this event belongs to.
    #[inline]
    pub fn invoke_id(&self) -> u64 {
        self.invoke_id
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Site of a `BEFORE` event.
    pub fn before_site(&self) -> Option<&BeforeSite> {
        match &self.payload {
            EventPayload::Before { site, .. } => site.as_ref(),
            _ => None,
        }
    }

    /// Arguments of a `BEFORE` event; empty for every other kind.
    pub fn arguments(&self) -> &[Value] {
        match &self.payload {
            EventPayload::Before { arguments, .. } => arguments,
            _ => &[],
        }
    }

    /// Argument `index` of a `BEFORE` event, with any replacement already applied.
    pub fn argument(&self, index: usize) -> Option<Value> {
        match &self.payload {
            EventPayload::Before {
                arguments, changes, ..
            } => changes
                .get(index)
                .or_else(|| arguments.get(index).cloned()),
            _ => None,
        }
    }

    /// Replace argument `index` before the method body runs.
    ///
    /// Only `BEFORE` events accept replacements; `false` for other kinds or an index
    /// past the end. Call sites pick the new values up through
    /// [`DispatchEngine::notify_before_mut`](crate::engine::DispatchEngine::notify_before_mut).
    pub fn change_argument(&self, index: usize, value: Value) -> bool {
        match &self.payload {
            EventPayload::Before {
                arguments, changes, ..
            } if index < arguments.len() => {
                changes.record(index, value);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn take_argument_changes(&self) -> Vec<(usize, Value)> {
        match &self.payload {
            EventPayload::Before { changes, .. } => changes.take(),
            _ => Vec::new(),
        }
    }

    /// Receiver (`self`) of a `BEFORE` event, absent for static methods.
    pub fn receiver(&self) -> Option<&Value> {
        match &self.payload {
            EventPayload::Before { receiver, .. } => receiver.as_ref(),
            _ => None,
        }
    }

    /// Return value of `RETURN` / `IMMEDIATELY_RETURN` events.
    pub fn return_value(&self) -> Option<&Value> {
        match &self.payload {
            EventPayload::Return { value } | EventPayload::ImmediatelyReturn { value } => {
                value.as_ref()
            }
            _ => None,
        }
    }

    /// Typed view of the return value.
    pub fn return_value_as<T: Any>(&self) -> Option<&T> {
        self.return_value().and_then(|v| v.downcast_ref::<T>())
    }

    /// Exception of `THROWS` / `IMMEDIATELY_THROWS` events.
    pub fn throwable(&self) -> Option<&Throwable> {
        match &self.payload {
            EventPayload::Throws { throwable } | EventPayload::ImmediatelyThrows { throwable } => {
                throwable.as_ref()
            }
            _ => None,
        }
    }

    /// Source line of `LINE` and `CALL_BEFORE` events.
    pub fn line(&self) -> Option<i32> {
        match &self.payload {
            EventPayload::Line { line } => Some(*line),
            EventPayload::CallBefore { site } => site.as_ref().map(|s| s.line),
            _ => None,
        }
    }

    /// Call-site descriptor of a `CALL_BEFORE` event.
    pub fn call_site(&self) -> Option<&CallSite> {
        match &self.payload {
            EventPayload::CallBefore { site } => site.as_ref(),
            _ => None,
        }
    }

    /// Exception type name of a `CALL_THROWS` event.
    pub fn exception_type(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::CallThrows { exception_type } => exception_type.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn assign_ids(&mut self, process_id: u64, invoke_id: u64) {
        self.process_id = process_id;
        self.invoke_id = invoke_id;
    }

    /// Make sure the payload is of `kind`, keeping it (and its buffers) when it already is.
    fn reshape(&mut self, kind: EventKind) {
        if self.payload.kind() != kind {
            self.payload = EventPayload::blank(kind);
        }
    }

    pub(crate) fn init_before(
        &mut self,
        process_id: u64,
        invoke_id: u64,
        before: &BeforeSite,
        args: &[Value],
        target: Option<&Value>,
    ) {
        self.assign_ids(process_id, invoke_id);
        self.reshape(EventKind::Before);
        if let EventPayload::Before {
            site,
            receiver,
            arguments,
            changes,
        } = &mut self.payload
        {
            if site.as_ref() != Some(before) {
                *site = Some(before.clone());
            }
            *receiver = target.cloned();
            arguments.clear();
            arguments.extend_from_slice(args);
            changes.clear();
        }
    }

    /// Fill a `RETURN` or `IMMEDIATELY_RETURN` event.
    pub(crate) fn init_return(
        &mut self,
        kind: EventKind,
        process_id: u64,
        invoke_id: u64,
        returned: Option<&Value>,
    ) {
        self.assign_ids(process_id, invoke_id);
        self.reshape(kind);
        if let EventPayload::Return { value } | EventPayload::ImmediatelyReturn { value } =
            &mut self.payload
        {
            *value = returned.cloned();
        }
    }

    /// Fill a `THROWS` or `IMMEDIATELY_THROWS` event.
    pub(crate) fn init_throws(
        &mut self,
        kind: EventKind,
        process_id: u64,
        invoke_id: u64,
        thrown: &Throwable,
    ) {
        self.assign_ids(process_id, invoke_id);
        self.reshape(kind);
        if let EventPayload::Throws { throwable } | EventPayload::ImmediatelyThrows { throwable } =
            &mut self.payload
        {
            *throwable = Some(Arc::clone(thrown));
        }
    }

    pub(crate) fn init_line(&mut self, process_id: u64, invoke_id: u64, at: i32) {
        self.assign_ids(process_id, invoke_id);
        self.payload = EventPayload::Line { line: at };
    }

    pub(crate) fn init_call_before(&mut self, process_id: u64, invoke_id: u64, call: &CallSite) {
        self.assign_ids(process_id, invoke_id);
        self.reshape(EventKind::CallBefore);
        if let EventPayload::CallBefore { site } = &mut self.payload {
            if site.as_ref() != Some(call) {
                *site = Some(call.clone());
            }
        }
    }

    pub(crate) fn init_call_return(&mut self, process_id: u64, invoke_id: u64) {
        self.assign_ids(process_id, invoke_id);
        self.payload = EventPayload::CallReturn;
    }

    pub(crate) fn init_call_throws(&mut self, process_id: u64, invoke_id: u64, ty: &str) {
        self.assign_ids(process_id, invoke_id);
        self.reshape(EventKind::CallThrows);
        if let EventPayload::CallThrows { exception_type } = &mut self.payload {
            if exception_type.as_deref() != Some(ty) {
                *exception_type = Some(Arc::from(ty));
            }
        }
    }

    /// Drop every reference that could pin an application object.
    ///
    /// Site and call descriptors are interned strings and are kept.
    pub(crate) fn passivate(&mut self) {
        self.process_id = UNASSIGNED_ID;
        self.invoke_id = UNASSIGNED_ID;
        match &mut self.payload {
            EventPayload::Before {
                receiver,
                arguments,
                changes,
                ..
            } => {
                *receiver = None;
                arguments.clear();
                changes.clear();
            }
            EventPayload::Return { value } | EventPayload::ImmediatelyReturn { value } => {
                *value = None;
            }
            EventPayload::Throws { throwable } | EventPayload::ImmediatelyThrows { throwable } => {
                *throwable = None;
            }
            EventPayload::Line { .. }
            | EventPayload::CallBefore { .. }
            | EventPayload::CallReturn
            | EventPayload::CallThrows { .. } => {}
        }
    }

    /// True when no large reference is held.
    pub fn is_passive(&self) -> bool {
        match &self.payload {
            EventPayload::Before {
                receiver,
                arguments,
                changes,
                ..
            } => receiver.is_none() && arguments.is_empty() && changes.is_empty(),
            EventPayload::Return { value } | EventPayload::ImmediatelyReturn { value } => {
                value.is_none()
            }
            EventPayload::Throws { throwable } | EventPayload::ImmediatelyThrows { throwable } => {
                throwable.is_none()
            }
            _ => true,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Event");
        s.field("kind", &self.kind())
            .field("process_id", &self.process_id)
            .field("invoke_id", &self.invoke_id);
        if let Some(site) = self.before_site() {
            s.field("site", &format_args!("{}", site));
            s.field("arguments", &self.arguments().len());
        }
        if let Some(line) = self.line() {
            s.field("line", &line);
        }
        if let Some(t) = self.throwable() {
            s.field("throwable", &format_args!("{}", t));
        }
        s.finish()
    }
}
