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

//! Event listener trait, process-control decisions and stock listeners.

use crate::event::{Event, Throwable, Value};
use std::fmt;
use std::sync::Arc;

/// Decision returned by a listener for one event.
#[derive(Clone, Default)]
pub enum ProcessControl {
    /// Let the instrumented code continue normally.
    #[default]
    Proceed,

    /// Skip the rest of the method and return `value` to the caller.
    ReturnImmediately {
        value: Value,
        ignore_process: bool,
    },

    /// Skip the rest of the method and raise `throwable` in the caller.
    ThrowsImmediately {
        throwable: Throwable,
        ignore_process: bool,
    },

    /// No redirect; only meaningful together with `ignore_process`.
    NoneImmediately { ignore_process: bool },
}

impl ProcessControl {
    pub fn proceed() -> Self {
        ProcessControl::Proceed
    }

    /// Force a return of `value`.
    pub fn return_immediately(value: Value) -> Self {
        ProcessControl::ReturnImmediately {
            value,
            ignore_process: false,
        }
    }

    /// Force `throwable` to be raised.
    pub fn throws_immediately(throwable: Throwable) -> Self {
        ProcessControl::ThrowsImmediately {
            throwable,
            ignore_process: false,
        }
    }

    /// Stop receiving events for the current process without redirecting it.
    pub fn ignore_process() -> Self {
        ProcessControl::NoneImmediately {
            ignore_process: true,
        }
    }

    /// Also suppress every further event of the current call tree.
    #[must_use]
    pub fn ignoring_process(self) -> Self {
        match self {
            ProcessControl::Proceed => ProcessControl::ignore_process(),
            ProcessControl::ReturnImmediately { value, .. } => ProcessControl::ReturnImmediately {
                value,
                ignore_process: true,
            },
            ProcessControl::ThrowsImmediately { throwable, .. } => {
                ProcessControl::ThrowsImmediately {
                    throwable,
                    ignore_process: true,
                }
            }
            ProcessControl::NoneImmediately { .. } => ProcessControl::ignore_process(),
        }
    }

    pub fn is_proceed(&self) -> bool {
        matches!(self, ProcessControl::Proceed)
    }

    /// Whether the decision asks to suppress the current process.
    pub fn ignores_process(&self) -> bool {
        match self {
            ProcessControl::Proceed => false,
            ProcessControl::ReturnImmediately { ignore_process, .. }
            | ProcessControl::ThrowsImmediately { ignore_process, .. }
            | ProcessControl::NoneImmediately { ignore_process } => *ignore_process,
        }
    }

    /// Short name used in log fields.
    pub fn label(&self) -> &'static str {
        match self {
            ProcessControl::Proceed => "proceed",
            ProcessControl::ReturnImmediately { .. } => "return_immediately",
            ProcessControl::ThrowsImmediately { .. } => "throws_immediately",
            ProcessControl::NoneImmediately { .. } => "none_immediately",
        }
    }
}

impl fmt::Debug for ProcessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessControl::ThrowsImmediately {
                throwable,
                ignore_process,
            } => f
                .debug_struct("ThrowsImmediately")
                .field("throwable", &format_args!("{}", throwable))
                .field("ignore_process", ignore_process)
                .finish(),
            ProcessControl::ReturnImmediately { ignore_process, .. } => f
                .debug_struct("ReturnImmediately")
                .field("ignore_process", ignore_process)
                .finish_non_exhaustive(),
            ProcessControl::NoneImmediately { ignore_process } => f
                .debug_struct("NoneImmediately")
                .field("ignore_process", ignore_process)
                .finish(),
            ProcessControl::Proceed => f.write_str("Proceed"),
        }
    }
}

/// What a listener hands back: a decision, or a failure of the listener itself.
pub type ListenerResult = Result<ProcessControl, anyhow::Error>;

/// Consumer of events for the kinds it was activated with.
///
/// Runs inline on the instrumented thread. Implementations may call back into
/// instrumented code, which re-enters the engine on the same thread.
pub trait EventListener: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &Event) -> ListenerResult;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Shared handle to a listener, as stored by the registry.
pub type SharedListener = Arc<dyn EventListener>;

/// A listener that proceeds on every event.
pub struct NoOpListener {
    name: String,
}

impl NoOpListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl EventListener for NoOpListener {
    fn on_event(&self, _event: &Event) -> ListenerResult {
        Ok(ProcessControl::Proceed)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Listener that logs every event at debug level.
pub struct LoggingListener {
    name: String,
}

impl LoggingListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl EventListener for LoggingListener {
    fn on_event(&self, event: &Event) -> ListenerResult {
        tracing::debug!(
            listener = %self.name,
            event_kind = %event.kind(),
            process_id = event.process_id(),
            invoke_id = event.invoke_id(),
            "Event received"
        );
        Ok(ProcessControl::Proceed)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Listener backed by a closure.
pub struct CallbackListener<F>
where
    F: Fn(&Event) -> ListenerResult + Send + Sync,
{
    name: String,
    callback: F,
}

impl<F> CallbackListener<F>
where
    F: Fn(&Event) -> ListenerResult + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

impl<F> EventListener for CallbackListener<F>
where
    F: Fn(&Event) -> ListenerResult + Send + Sync,
{
    fn on_event(&self, event: &Event) -> ListenerResult {
        (self.callback)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
