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

//! Keyed pool of reusable event objects.
//!
//! # Design
//!
//! One bounded free list per [`EventKind`]. A borrow moves a boxed event out of the
//! free list into a [`PooledEvent`] guard; dropping the guard passivates the event and
//! pushes it back, or drops it when the free list is already full.
//!
//! # Exhaustion
//!
//! When a kind (or the pool as a whole) already has its maximum number of events in
//! flight, the borrow falls back to a fresh allocation that is simply dropped on
//! return. Borrowing never blocks beyond the free-list mutex.

use crate::config::EventPoolConfig;
use crate::event::{BeforeSite, CallSite, Event, EventKind, Throwable, Value};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

struct KindSlots {
    idle: Mutex<Vec<Box<Event>>>,
    active: AtomicUsize,
}

impl KindSlots {
    fn new(kind: EventKind, prewarm: usize, capacity: usize) -> Self {
        let mut idle = Vec::with_capacity(capacity);
        idle.extend((0..prewarm).map(|_| Box::new(Event::blank(kind))));
        Self {
            idle: Mutex::new(idle),
            active: AtomicUsize::new(0),
        }
    }
}

/// Pool of event objects, one free list per kind.
pub struct EventPool {
    config: EventPoolConfig,
    slots: [KindSlots; EventKind::COUNT],
    active_total: AtomicUsize,
    max_total: usize,
}

impl EventPool {
    pub fn new(config: EventPoolConfig) -> Self {
        let prewarm = if config.enabled {
            config.min_idle_per_kind
        } else {
            0
        };
        let capacity = if config.enabled {
            config.max_idle_per_kind
        } else {
            0
        };
        let slots = EventKind::ALL.map(|kind| KindSlots::new(kind, prewarm, capacity));
        let max_total = config.effective_max_total();

        tracing::info!(
            enabled = config.enabled,
            min_idle_per_kind = config.min_idle_per_kind,
            max_idle_per_kind = config.max_idle_per_kind,
            max_total_per_kind = config.max_total_per_kind,
            max_total = max_total,
            "Event pool created"
        );

        Self {
            config,
            slots,
            active_total: AtomicUsize::new(0),
            max_total,
        }
    }

    /// A pool that always allocates.
    pub fn disabled() -> Self {
        Self::new(EventPoolConfig::disabled())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &EventPoolConfig {
        &self.config
    }

    /// Events currently borrowed from the pool, all kinds.
    pub fn num_active(&self) -> Option<usize> {
        self.is_enabled()
            .then(|| self.active_total.load(Ordering::Acquire))
    }

    pub fn num_active_of(&self, kind: EventKind) -> Option<usize> {
        self.is_enabled()
            .then(|| self.slots[kind.index()].active.load(Ordering::Acquire))
    }

    /// Idle events ready for reuse, all kinds.
    pub fn num_idle(&self) -> Option<usize> {
        self.is_enabled()
            .then(|| self.slots.iter().map(|s| s.idle.lock().len()).sum())
    }

    pub fn num_idle_of(&self, kind: EventKind) -> Option<usize> {
        self.is_enabled()
            .then(|| self.slots[kind.index()].idle.lock().len())
    }

    pub fn borrow_before(
        &self,
        process_id: u64,
        invoke_id: u64,
        site: &BeforeSite,
        arguments: &[Value],
        receiver: Option<&Value>,
    ) -> PooledEvent<'_> {
        let mut event = self.acquire(EventKind::Before);
        event.get_mut().init_before(process_id, invoke_id, site, arguments, receiver);
        event
    }

    pub fn borrow_return(
        &self,
        process_id: u64,
        invoke_id: u64,
        value: Option<&Value>,
    ) -> PooledEvent<'_> {
        self.borrow_returning(EventKind::Return, process_id, invoke_id, value)
    }

    pub fn borrow_immediately_return(
        &self,
        process_id: u64,
        invoke_id: u64,
        value: Option<&Value>,
    ) -> PooledEvent<'_> {
        self.borrow_returning(EventKind::ImmediatelyReturn, process_id, invoke_id, value)
    }

    pub fn borrow_throws(
        &self,
        process_id: u64,
        invoke_id: u64,
        throwable: &Throwable,
    ) -> PooledEvent<'_> {
        self.borrow_throwing(EventKind::Throws, process_id, invoke_id, throwable)
    }

    pub fn borrow_immediately_throws(
        &self,
        process_id: u64,
        invoke_id: u64,
        throwable: &Throwable,
    ) -> PooledEvent<'_> {
        self.borrow_throwing(EventKind::ImmediatelyThrows, process_id, invoke_id, throwable)
    }

    pub fn borrow_line(&self, process_id: u64, invoke_id: u64, line: i32) -> PooledEvent<'_> {
        let mut event = self.acquire(EventKind::Line);
        event.get_mut().init_line(process_id, invoke_id, line);
        event
    }

    pub fn borrow_call_before(
        &self,
        process_id: u64,
        invoke_id: u64,
        site: &CallSite,
    ) -> PooledEvent<'_> {
        let mut event = self.acquire(EventKind::CallBefore);
        event.get_mut().init_call_before(process_id, invoke_id, site);
        event
    }

    pub fn borrow_call_return(&self, process_id: u64, invoke_id: u64) -> PooledEvent<'_> {
        let mut event = self.acquire(EventKind::CallReturn);
        event.get_mut().init_call_return(process_id, invoke_id);
        event
    }

    pub fn borrow_call_throws(
        &self,
        process_id: u64,
        invoke_id: u64,
        exception_type: &str,
    ) -> PooledEvent<'_> {
        let mut event = self.acquire(EventKind::CallThrows);
        event
            .get_mut()
            .init_call_throws(process_id, invoke_id, exception_type);
        event
    }

    /// Borrow a `RETURN` or `IMMEDIATELY_RETURN` event.
    pub(crate) fn borrow_returning(
        &self,
        kind: EventKind,
        process_id: u64,
        invoke_id: u64,
        value: Option<&Value>,
    ) -> PooledEvent<'_> {
        let mut event = self.acquire(kind);
        event.get_mut().init_return(kind, process_id, invoke_id, value);
        event
    }

    /// Borrow a `THROWS` or `IMMEDIATELY_THROWS` event.
    pub(crate) fn borrow_throwing(
        &self,
        kind: EventKind,
        process_id: u64,
        invoke_id: u64,
        throwable: &Throwable,
    ) -> PooledEvent<'_> {
        let mut event = self.acquire(kind);
        event
            .get_mut()
            .init_throws(kind, process_id, invoke_id, throwable);
        event
    }

    fn acquire(&self, kind: EventKind) -> PooledEvent<'_> {
        if !self.is_enabled() {
            return PooledEvent::fresh(self, kind);
        }

        let slots = &self.slots[kind.index()];
        if !self.reserve(slots) {
            tracing::warn!(
                event_kind = %kind,
                max_total_per_kind = self.config.max_total_per_kind,
                max_total = self.max_total,
                "Event pool exhausted, allocating outside the pool"
            );
            return PooledEvent::fresh(self, kind);
        }

        let recycled = slots.idle.lock().pop();
        let event = recycled.unwrap_or_else(|| Box::new(Event::blank(kind)));
        PooledEvent {
            pool: self,
            kind,
            event: Some(event),
            pooled: true,
        }
    }

    /// Count one more in-flight event, unless a limit is already reached.
    fn reserve(&self, slots: &KindSlots) -> bool {
        let per_kind = slots.active.fetch_add(1, Ordering::AcqRel);
        if per_kind >= self.config.max_total_per_kind {
            slots.active.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        let total = self.active_total.fetch_add(1, Ordering::AcqRel);
        if total >= self.max_total {
            self.active_total.fetch_sub(1, Ordering::AcqRel);
            slots.active.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Passivate `event` and keep it for reuse if there is room.
    fn give_back(&self, kind: EventKind, mut event: Box<Event>, pooled: bool) {
        event.passivate();
        if !pooled {
            return;
        }

        let slots = &self.slots[kind.index()];
        {
            let mut idle = slots.idle.lock();
            if idle.len() < self.config.max_idle_per_kind {
                idle.push(event);
            }
        }
        slots.active.fetch_sub(1, Ordering::AcqRel);
        self.active_total.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new(EventPoolConfig::default())
    }
}

/// An event on loan from an [`EventPool`]. Dropping it gives the event back.
pub struct PooledEvent<'a> {
    pool: &'a EventPool,
    kind: EventKind,
    event: Option<Box<Event>>,
    pooled: bool,
}

impl<'a> PooledEvent<'a> {
    fn fresh(pool: &'a EventPool, kind: EventKind) -> Self {
        Self {
            pool,
            kind,
            event: Some(Box::new(Event::blank(kind))),
            pooled: false,
        }
    }

    /// Whether the event came out of a free list (as opposed to a fallback allocation).
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    fn get_mut(&mut self) -> &mut Event {
        match self.event.as_deref_mut() {
            Some(event) => event,
            // only taken in drop
            None => unreachable!("pooled event used after release"),
        }
    }
}

impl Deref for PooledEvent<'_> {
    type Target = Event;

    fn deref(&self) -> &Event {
        match self.event.as_deref() {
            Some(event) => event,
            None => unreachable!("pooled event used after release"),
        }
    }
}

impl Drop for PooledEvent<'_> {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            self.pool.give_back(self.kind, event, self.pooled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::value;

    fn small_config() -> EventPoolConfig {
        EventPoolConfig::default()
            .with_min_idle_per_kind(2)
            .with_max_idle_per_kind(4)
            .with_max_total_per_kind(8)
    }

    #[test]
    fn test_prewarm_and_stats() {
        let pool = EventPool::new(small_config());
        assert_eq!(pool.num_idle_of(EventKind::Before), Some(2));
        assert_eq!(pool.num_idle(), Some(2 * EventKind::COUNT));
        assert_eq!(pool.num_active(), Some(0));

        let site = BeforeSite::new("Calc", "sum", "()I");
        let event = pool.borrow_before(1000, 1000, &site, &[], None);
        assert!(event.is_pooled());
        assert_eq!(pool.num_active_of(EventKind::Before), Some(1));
        assert_eq!(pool.num_idle_of(EventKind::Before), Some(1));

        drop(event);
        assert_eq!(pool.num_active(), Some(0));
        assert_eq!(pool.num_idle_of(EventKind::Before), Some(2));
    }

    #[test]
    fn test_give_back_clears_payload() {
        let pool = EventPool::new(small_config().with_min_idle_per_kind(0).with_max_idle_per_kind(1));
        let site = BeforeSite::new("Calc", "add", "(II)I");
        {
            let event = pool.borrow_before(
                1000,
                1001,
                &site,
                &[value(1_i32), value(2_i32)],
                Some(&value("calc")),
            );
            assert_eq!(event.arguments().len(), 2);
        }

        let idle = pool.slots[EventKind::Before.index()].idle.lock();
        assert_eq!(idle.len(), 1);
        assert!(idle[0].is_passive());
        assert_eq!(idle[0].invoke_id(), crate::event::UNASSIGNED_ID);
    }

    #[test]
    fn test_returned_values_are_released() {
        let pool = EventPool::new(small_config());
        let payload = value(String::from("result"));
        {
            let event = pool.borrow_return(1000, 1000, Some(&payload));
            assert_eq!(event.return_value_as::<String>().map(String::as_str), Some("result"));
            assert_eq!(std::sync::Arc::strong_count(&payload), 2);
        }
        assert_eq!(std::sync::Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_exhaustion_falls_back_to_fresh() {
        let pool = EventPool::new(
            EventPoolConfig::default()
                .with_min_idle_per_kind(0)
                .with_max_idle_per_kind(1)
                .with_max_total_per_kind(1),
        );

        let first = pool.borrow_line(1000, 1000, 10);
        let second = pool.borrow_line(1000, 1000, 11);
        assert!(first.is_pooled());
        assert!(!second.is_pooled());
        assert_eq!(second.line(), Some(11));
        assert_eq!(pool.num_active_of(EventKind::Line), Some(1));

        drop(second);
        drop(first);
        assert_eq!(pool.num_active(), Some(0));
        assert_eq!(pool.num_idle_of(EventKind::Line), Some(1));
    }

    #[test]
    fn test_global_limit() {
        let pool = EventPool::new(
            EventPoolConfig::default()
                .with_min_idle_per_kind(0)
                .with_max_idle_per_kind(2)
                .with_max_total_per_kind(2)
                .with_max_total(1),
        );

        let line = pool.borrow_line(1000, 1000, 1);
        let call = pool.borrow_call_return(1000, 1000);
        assert!(line.is_pooled());
        assert!(!call.is_pooled());
    }

    #[test]
    fn test_max_idle_drops_extras() {
        let pool = EventPool::new(small_config().with_min_idle_per_kind(0).with_max_idle_per_kind(1));
        let a = pool.borrow_call_return(1, 1);
        let b = pool.borrow_call_return(1, 1);
        drop(a);
        drop(b);
        assert_eq!(pool.num_idle_of(EventKind::CallReturn), Some(1));
    }

    #[test]
    fn test_disabled_pool() {
        let pool = EventPool::disabled();
        assert_eq!(pool.num_active(), None);
        assert_eq!(pool.num_idle_of(EventKind::Throws), None);

        let event = pool.borrow_call_throws(1000, 1000, "java.io.IOException");
        assert!(!event.is_pooled());
        assert_eq!(event.exception_type(), Some("java.io.IOException"));
    }
}
