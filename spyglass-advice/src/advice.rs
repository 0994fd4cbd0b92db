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

//! Per-invocation advice objects.

use parking_lot::Mutex;
use spyglass_core::{BeforeSite, Event, Throwable, Value};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Where an invocation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdviceState {
    Running,
    Returned,
    Threw,
}

#[derive(Default)]
struct Arguments {
    values: Vec<Value>,
    /// Indexes replaced since the adapter last collected them.
    changed: Vec<usize>,
}

#[derive(Default)]
struct Completion {
    return_value: Option<Value>,
    throwable: Option<Throwable>,
    returned: bool,
}

/// One invocation, from its `BEFORE` to its exit.
///
/// Advices of the same call tree are linked to their caller, so a listener can walk
/// up to the root with [`parent`](Advice::parent) / [`process_top`](Advice::process_top).
pub struct Advice {
    process_id: u64,
    invoke_id: u64,
    site: BeforeSite,
    arguments: Mutex<Arguments>,
    receiver: Option<Value>,
    parent: Option<Arc<Advice>>,
    completion: Mutex<Completion>,
    attachment: Mutex<Option<Value>>,
    marks: Mutex<HashSet<String>>,
}

impl Advice {
    /// Build from a `BEFORE` event. Returns `None` for any other kind.
    pub(crate) fn from_before(event: &Event, parent: Option<Arc<Advice>>) -> Option<Self> {
        let site = event.before_site()?.clone();
        Some(Self {
            process_id: event.process_id(),
            invoke_id: event.invoke_id(),
            site,
            arguments: Mutex::new(Arguments {
                values: event.arguments().to_vec(),
                changed: Vec::new(),
            }),
            receiver: event.receiver().cloned(),
            parent,
            completion: Mutex::new(Completion::default()),
            attachment: Mutex::new(None),
            marks: Mutex::new(HashSet::new()),
        })
    }

    /// Replacements made since the last call, in the order they were made.
    pub(crate) fn take_changed_arguments(&self) -> Vec<(usize, Value)> {
        let mut arguments = self.arguments.lock();
        let changed = std::mem::take(&mut arguments.changed);
        changed
            .into_iter()
            .filter_map(|index| Some((index, Arc::clone(arguments.values.get(index)?))))
            .collect()
    }

    pub(crate) fn apply_return(&self, value: Option<&Value>) {
        let mut completion = self.completion.lock();
        completion.return_value = value.cloned();
        completion.throwable = None;
        completion.returned = true;
    }

    pub(crate) fn apply_throws(&self, throwable: Option<&Throwable>) {
        let mut completion = self.completion.lock();
        completion.throwable = throwable.cloned();
        completion.return_value = None;
        completion.returned = false;
    }

    pub fn process_id(&self) -> u64 {
        self.process_id
    }

    pub fn invoke_id(&self) -> u64 {
        self.invoke_id
    }

    pub fn site(&self) -> &BeforeSite {
        &self.site
    }

    pub fn class_name(&self) -> &str {
        &self.site.class_name
    }

    pub fn method_name(&self) -> &str {
        &self.site.method_name
    }

    pub fn method_desc(&self) -> &str {
        &self.site.method_desc
    }

    /// Current arguments, including replacements.
    pub fn arguments(&self) -> Vec<Value> {
        self.arguments.lock().values.clone()
    }

    pub fn argument(&self, index: usize) -> Option<Value> {
        self.arguments.lock().values.get(index).cloned()
    }

    pub fn argument_as<T: Any + Clone>(&self, index: usize) -> Option<T> {
        self.argument(index)
            .and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Replace argument `index` for the method body. Only takes effect from
    /// [`AdviceListener::before`](crate::AdviceListener::before) when the call site
    /// passes arguments through `notify_before_mut`. `false` when out of range.
    pub fn change_argument(&self, index: usize, value: Value) -> bool {
        let mut arguments = self.arguments.lock();
        let Some(slot) = arguments.values.get_mut(index) else {
            return false;
        };
        *slot = value;
        if !arguments.changed.contains(&index) {
            arguments.changed.push(index);
        }
        true
    }

    pub fn receiver(&self) -> Option<&Value> {
        self.receiver.as_ref()
    }

    pub fn state(&self) -> AdviceState {
        let completion = self.completion.lock();
        if completion.returned {
            AdviceState::Returned
        } else if completion.throwable.is_some() {
            AdviceState::Threw
        } else {
            AdviceState::Running
        }
    }

    pub fn is_return(&self) -> bool {
        self.state() == AdviceState::Returned
    }

    pub fn is_throws(&self) -> bool {
        self.state() == AdviceState::Threw
    }

    pub fn return_value(&self) -> Option<Value> {
        self.completion.lock().return_value.clone()
    }

    pub fn return_value_as<T: Any + Clone>(&self) -> Option<T> {
        self.return_value()
            .and_then(|v| v.downcast_ref::<T>().cloned())
    }

    pub fn throwable(&self) -> Option<Throwable> {
        self.completion.lock().throwable.clone()
    }

    /// The calling advice, `None` at the root of the call tree.
    pub fn parent(&self) -> Option<&Advice> {
        self.parent.as_deref()
    }

    pub fn is_process_top(&self) -> bool {
        self.parent.is_none()
    }

    /// Root advice of the call tree.
    pub fn process_top(&self) -> &Advice {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Store a value on this advice, replacing any previous one.
    pub fn attach(&self, attachment: Value) {
        *self.attachment.lock() = Some(attachment);
    }

    /// Attach and mark in one step.
    pub fn attach_marked(&self, attachment: Value, mark: impl Into<String>) {
        self.attach(attachment);
        self.mark(mark);
    }

    pub fn attachment(&self) -> Option<Value> {
        self.attachment.lock().clone()
    }

    pub fn attachment_as<T: Any + Clone>(&self) -> Option<T> {
        self.attachment()
            .and_then(|v| v.downcast_ref::<T>().cloned())
    }

    pub fn mark(&self, mark: impl Into<String>) {
        self.marks.lock().insert(mark.into());
    }

    pub fn has_mark(&self, mark: &str) -> bool {
        self.marks.lock().contains(mark)
    }

    /// Remove `mark`, reporting whether it was set.
    pub fn unmark(&self, mark: &str) -> bool {
        self.marks.lock().remove(mark)
    }

    /// This advice and its callers carrying `mark`, innermost first.
    pub fn marked_on_chain(&self, mark: &str) -> Vec<&Advice> {
        let mut found = Vec::new();
        let mut current = Some(self);
        while let Some(advice) = current {
            if advice.has_mark(mark) {
                found.push(advice);
            }
            current = advice.parent();
        }
        found
    }
}

impl fmt::Debug for Advice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Advice")
            .field("process_id", &self.process_id)
            .field("invoke_id", &self.invoke_id)
            .field("site", &format_args!("{}", self.site))
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
