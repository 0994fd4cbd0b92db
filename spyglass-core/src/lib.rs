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

//! Spyglass Core
//!
//! Event dispatch and process control for instrumented code. Instrumented methods
//! report entry, exit, line and nested-call notifications to a [`DispatchEngine`];
//! the engine turns them into typed [`Event`]s, hands them to the listeners
//! subscribed to their kind and translates the listeners' decisions back into
//! control flow ([`Outcome`]).
//!
//! # Architecture
//!
//! - **Event pool**: recycled event objects, one bounded free list per kind
//! - **Invocation stack**: per-thread frame tracking, process and invoke ids
//! - **Listener registry**: copy-on-write id to listener map
//! - **Immediate separator**: tags exits caused by a forced return or throw
//! - **Dispatcher**: ties the above together and resolves process control
//!
//! # Example
//!
//! ```rust
//! use spyglass_core::{
//!     value, BeforeSite, CallbackListener, DispatchEngine, EventKind, EventKindSet,
//!     ProcessControl,
//! };
//! use std::sync::Arc;
//!
//! let engine = DispatchEngine::with_defaults();
//! engine.activate(
//!     1,
//!     Arc::new(CallbackListener::new("stub-add", |event| {
//!         if event.kind() == EventKind::Before {
//!             Ok(ProcessControl::return_immediately(value(100_i32)))
//!         } else {
//!             Ok(ProcessControl::Proceed)
//!         }
//!     })),
//!     EventKindSet::invocation(),
//! );
//!
//! let site = BeforeSite::new("Calculator", "add", "(II)I");
//! let result: i32 = engine
//!     .invoke(1, &site, &[value(1_i32), value(2_i32)], None, || Ok(1 + 2))
//!     .unwrap();
//! assert_eq!(result, 100);
//! ```

pub mod call_site;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod separator;
pub mod stack;
pub mod telemetry;

pub use call_site::InvocationError;
pub use config::{EngineConfig, EventPoolConfig, MismatchPolicy};
pub use dispatcher::{Dispatcher, Notification, Outcome};
pub use engine::{DispatchEngine, DispatchEngineBuilder};
pub use error::{ConfigError, DispatchError, DispatchResult, LeakError};
pub use event::{
    throwable, value, ArgumentChanges, BeforeSite, CallSite, Event, EventKind, EventKindSet,
    EventPayload, Throwable, Value,
};
pub use listener::{
    CallbackListener, EventListener, ListenerResult, LoggingListener, NoOpListener,
    ProcessControl, SharedListener,
};
pub use pool::{EventPool, PooledEvent};
pub use registry::{ListenerRegistry, Registration};
pub use telemetry::{init_tracing, EngineStats, StatsSnapshot, TelemetryConfig};
