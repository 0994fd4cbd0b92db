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

//! Listener registry.
//!
//! # Concurrency Model
//!
//! Registrations live in an immutable map published through `ArcSwap`. Lookups on
//! the dispatch path are a single atomic load and never wait on `activate` or
//! `freeze`; writers copy the map, modify the copy and publish it.

use crate::event::{EventKind, EventKindSet};
use crate::listener::SharedListener;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An activated listener with its subscription.
pub struct Registration {
    pub listener_id: u32,
    pub listener: SharedListener,
    pub kinds: EventKindSet,
    /// Failures of an interrupting listener are propagated to the call site.
    pub interrupting: bool,
    /// Assigned by [`ListenerRegistry::activate`]; tells apart successive activations
    /// of the same id. Zero until activated.
    pub generation: u64,
}

impl Registration {
    pub fn new(listener_id: u32, listener: SharedListener, kinds: EventKindSet) -> Self {
        Self {
            listener_id,
            listener,
            kinds,
            interrupting: false,
            generation: 0,
        }
    }

    pub fn with_interrupting(mut self, interrupting: bool) -> Self {
        self.interrupting = interrupting;
        self
    }

    #[inline]
    pub fn subscribes(&self, kind: EventKind) -> bool {
        self.kinds.contains(kind)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("listener_id", &self.listener_id)
            .field("listener", &self.listener.name())
            .field("kinds", &self.kinds)
            .field("interrupting", &self.interrupting)
            .field("generation", &self.generation)
            .finish()
    }
}

type Snapshot = HashMap<u32, Arc<Registration>>;

/// Maps listener ids to their registrations.
pub struct ListenerRegistry {
    snapshot: ArcSwap<Snapshot>,
    next_generation: AtomicU64,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Register `registration`, replacing and returning any registration with the same id.
    pub fn activate(&self, mut registration: Registration) -> Option<Arc<Registration>> {
        let listener_id = registration.listener_id;
        registration.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(registration);

        tracing::info!(
            listener_id = listener_id,
            listener = %registration.listener.name(),
            kinds = ?registration.kinds,
            interrupting = registration.interrupting,
            generation = registration.generation,
            "Listener activated"
        );

        let previous = self.snapshot.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.insert(listener_id, Arc::clone(&registration));
            next
        });
        previous.get(&listener_id).cloned()
    }

    /// Remove a registration. Unknown ids are ignored.
    pub fn freeze(&self, listener_id: u32) -> Option<Arc<Registration>> {
        if !self.snapshot.load().contains_key(&listener_id) {
            tracing::debug!(listener_id = listener_id, "Freeze of unknown listener ignored");
            return None;
        }

        let previous = self.snapshot.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.remove(&listener_id);
            next
        });
        let removed = previous.get(&listener_id).cloned();
        if removed.is_some() {
            tracing::info!(listener_id = listener_id, "Listener frozen");
        }
        removed
    }

    #[inline]
    pub fn lookup(&self, listener_id: u32) -> Option<Arc<Registration>> {
        self.snapshot.load().get(&listener_id).cloned()
    }

    pub fn contains(&self, listener_id: u32) -> bool {
        self.snapshot.load().contains_key(&listener_id)
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Active listener ids, ascending.
    pub fn listener_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.snapshot.load().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
