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

//! Property tests for invocation tracking under arbitrary nesting

use parking_lot::Mutex;
use proptest::prelude::*;
use spyglass_core::{
    BeforeSite, DispatchEngine, Event, EventKind, EventKindSet, EventListener, ListenerResult,
    ProcessControl,
};
use std::sync::Arc;

const LISTENER: u32 = 3;

#[derive(Default)]
struct Ids {
    seen: Mutex<Vec<(EventKind, u64, u64)>>,
}

impl EventListener for Ids {
    fn on_event(&self, event: &Event) -> ListenerResult {
        self.seen
            .lock()
            .push((event.kind(), event.process_id(), event.invoke_id()));
        Ok(ProcessControl::Proceed)
    }

    fn name(&self) -> &str {
        "ids"
    }
}

/// `true` enters a method, `false` leaves one.
fn steps() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..64)
}

proptest! {
    #[test]
    fn exits_pop_in_lifo_order(ops in steps()) {
        let engine = DispatchEngine::with_defaults();
        let ids = Arc::new(Ids::default());
        engine.activate(LISTENER, ids.clone(), EventKindSet::invocation());
        let site = BeforeSite::new("Recursive", "walk", "()V");

        let mut model: Vec<u64> = Vec::new();
        for enter in ops {
            let delivered_before = ids.seen.lock().len();
            if enter {
                let was_empty = model.is_empty();
                let outcome = engine.notify_before(LISTENER, &site, &[], None).unwrap();
                prop_assert!(outcome.is_proceed());

                let (kind, process_id, invoke_id) = *ids.seen.lock().last().unwrap();
                prop_assert_eq!(kind, EventKind::Before);
                prop_assert_eq!(process_id == invoke_id, was_empty);
                if let Some(root) = model.first() {
                    prop_assert_eq!(process_id, *root);
                }
                if let Some(top) = model.last() {
                    prop_assert!(invoke_id > *top);
                }
                model.push(invoke_id);
            } else {
                engine.notify_return(LISTENER, None).unwrap();
                match model.pop() {
                    Some(expected) => {
                        let (kind, process_id, invoke_id) = *ids.seen.lock().last().unwrap();
                        prop_assert_eq!(kind, EventKind::Return);
                        prop_assert_eq!(invoke_id, expected);
                        prop_assert_eq!(process_id == invoke_id, model.is_empty());
                    }
                    None => {
                        prop_assert_eq!(ids.seen.lock().len(), delivered_before);
                    }
                }
            }
        }

        while model.pop().is_some() {
            engine.notify_return(LISTENER, None).unwrap();
        }
        prop_assert!(engine.check_listener(LISTENER).is_ok());
        prop_assert_eq!(engine.pool().num_active(), Some(0));
    }

    #[test]
    fn unbalanced_exits_never_underflow(extra in 1usize..8) {
        let engine = DispatchEngine::with_defaults();
        let ids = Arc::new(Ids::default());
        engine.activate(LISTENER, ids.clone(), EventKindSet::invocation());

        for _ in 0..extra {
            prop_assert!(engine.notify_return(LISTENER, None).unwrap().is_proceed());
        }
        prop_assert!(ids.seen.lock().is_empty());
        prop_assert!(engine.check_listener(LISTENER).is_ok());
    }
}
