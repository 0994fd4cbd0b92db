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

//! The engine facade handed to instrumented code.

use crate::config::{EngineConfig, EventPoolConfig, MismatchPolicy};
use crate::dispatcher::{Dispatcher, Notification, Outcome};
use crate::error::{ConfigError, DispatchResult, LeakError};
use crate::event::{BeforeSite, CallSite, EventKindSet, Throwable, Value};
use crate::listener::SharedListener;
use crate::pool::EventPool;
use crate::registry::{ListenerRegistry, Registration};
use crate::telemetry::StatsSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// An isolated dispatch engine: registry, event pool, id sequence and per-thread state.
///
/// Engines never share state; two engines may track the same thread independently.
pub struct DispatchEngine {
    dispatcher: Dispatcher,
}

impl DispatchEngine {
    /// Create an engine after validating `config`.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::assemble(Arc::new(ListenerRegistry::new()), config))
    }

    /// Create an engine with the default configuration.
    pub fn with_defaults() -> Self {
        Self::assemble(Arc::new(ListenerRegistry::new()), EngineConfig::default())
    }

    pub fn builder() -> DispatchEngineBuilder {
        DispatchEngineBuilder::new()
    }

    fn assemble(registry: Arc<ListenerRegistry>, config: EngineConfig) -> Self {
        let engine_id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::new(EventPool::new(config.event_pool.clone()));
        tracing::info!(
            engine_id = engine_id,
            mismatch_policy = ?config.mismatch_policy,
            self_call_barrier = config.self_call_barrier,
            "Dispatch engine created"
        );
        Self {
            dispatcher: Dispatcher::new(engine_id, registry, pool, config),
        }
    }

    pub fn engine_id(&self) -> u64 {
        self.dispatcher.engine_id()
    }

    pub fn config(&self) -> &EngineConfig {
        self.dispatcher.config()
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        self.dispatcher.registry()
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        self.dispatcher.pool()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats().snapshot()
    }

    /// Start delivering `kinds` to `listener`. Replaces an existing registration.
    pub fn activate(
        &self,
        listener_id: u32,
        listener: SharedListener,
        kinds: EventKindSet,
    ) -> Option<Arc<Registration>> {
        self.registry()
            .activate(Registration::new(listener_id, listener, kinds))
    }

    /// Like [`activate`](Self::activate), but listener failures reach the call site
    /// as [`DispatchError::Interrupted`](crate::error::DispatchError::Interrupted).
    pub fn activate_interrupting(
        &self,
        listener_id: u32,
        listener: SharedListener,
        kinds: EventKindSet,
    ) -> Option<Arc<Registration>> {
        self.registry().activate(
            Registration::new(listener_id, listener, kinds).with_interrupting(true),
        )
    }

    /// Stop delivering to `listener_id`. Unknown ids are ignored.
    pub fn freeze(&self, listener_id: u32) -> Option<Arc<Registration>> {
        self.registry().freeze(listener_id)
    }

    pub fn notify_before(
        &self,
        listener_id: u32,
        site: &BeforeSite,
        arguments: &[Value],
        receiver: Option<&Value>,
    ) -> DispatchResult<Outcome> {
        self.dispatcher.dispatch(
            listener_id,
            Notification::Before {
                site,
                arguments,
                receiver,
            },
        )
    }

    /// Like [`notify_before`](Self::notify_before), but replacements the listener
    /// makes through [`Event::change_argument`](crate::event::Event::change_argument)
    /// are written into `arguments`.
    pub fn notify_before_mut(
        &self,
        listener_id: u32,
        site: &BeforeSite,
        arguments: &mut [Value],
        receiver: Option<&Value>,
    ) -> DispatchResult<Outcome> {
        self.dispatcher
            .dispatch_before(listener_id, site, arguments, receiver)
    }

    /// Report a normal exit. `value` is `None` for methods without a result.
    pub fn notify_return(&self, listener_id: u32, value: Option<&Value>) -> DispatchResult<Outcome> {
        self.dispatcher
            .dispatch(listener_id, Notification::Return { value })
    }

    pub fn notify_throws(&self, listener_id: u32, throwable: &Throwable) -> DispatchResult<Outcome> {
        self.dispatcher
            .dispatch(listener_id, Notification::Throws { throwable })
    }

    pub fn notify_line(&self, listener_id: u32, line: i32) -> DispatchResult<()> {
        self.dispatcher
            .dispatch(listener_id, Notification::Line { line })
            .map(|_| ())
    }

    pub fn notify_call_before(&self, listener_id: u32, site: &CallSite) -> DispatchResult<()> {
        self.dispatcher
            .dispatch(listener_id, Notification::CallBefore { site })
            .map(|_| ())
    }

    pub fn notify_call_return(&self, listener_id: u32) -> DispatchResult<()> {
        self.dispatcher
            .dispatch(listener_id, Notification::CallReturn)
            .map(|_| ())
    }

    pub fn notify_call_throws(&self, listener_id: u32, exception_type: &str) -> DispatchResult<()> {
        self.dispatcher
            .dispatch(listener_id, Notification::CallThrows { exception_type })
            .map(|_| ())
    }

    /// Verify the current thread holds nothing for `listener_id`.
    pub fn check_listener(&self, listener_id: u32) -> Result<(), LeakError> {
        let Some(snapshot) = self.dispatcher.thread_context(listener_id).snapshot() else {
            return Ok(());
        };
        if snapshot.depth > 0 {
            return Err(LeakError::OpenFrames {
                listener_id,
                depth: snapshot.depth,
            });
        }
        if let Some(process_id) = snapshot.ignored_process_id {
            return Err(LeakError::IgnoreMarker {
                listener_id,
                process_id,
            });
        }
        if snapshot.pending_throw {
            return Err(LeakError::PendingThrow { listener_id });
        }
        Ok(())
    }
}

impl Default for DispatchEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Builder for a [`DispatchEngine`].
pub struct DispatchEngineBuilder {
    registry: Option<Arc<ListenerRegistry>>,
    config: EngineConfig,
}

impl Default for DispatchEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchEngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            config: EngineConfig::default(),
        }
    }

    /// Use an existing registry, e.g. one shared with an administrative surface.
    pub fn with_registry(mut self, registry: Arc<ListenerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_pool(mut self, event_pool: EventPoolConfig) -> Self {
        self.config.event_pool = event_pool;
        self
    }

    /// Turn pooling off.
    pub fn without_pool(mut self) -> Self {
        self.config.event_pool.enabled = false;
        self
    }

    pub fn with_mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.config.mismatch_policy = policy;
        self
    }

    pub fn with_self_call_barrier(mut self, enabled: bool) -> Self {
        self.config.self_call_barrier = enabled;
        self
    }

    pub fn with_initial_invoke_id(mut self, id: u64) -> Self {
        self.config.initial_invoke_id = id;
        self
    }

    pub fn build(self) -> Result<DispatchEngine, ConfigError> {
        self.config.validate()?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ListenerRegistry::new()));
        Ok(DispatchEngine::assemble(registry, self.config))
    }
}
