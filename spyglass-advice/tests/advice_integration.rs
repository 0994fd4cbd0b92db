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

//! Advice pairing driven through a real dispatch engine

use parking_lot::Mutex;
use spyglass_advice::{Advice, AdviceAdapter, AdviceListener, ADVICE_EVENT_KINDS};
use spyglass_core::{
    throwable, value, BeforeSite, CallSite, DispatchEngine, EventKindSet, InvocationError,
    ListenerResult, ProcessControl, Throwable,
};
use std::sync::Arc;

const LISTENER: u32 = 11;

#[derive(Debug, thiserror::Error)]
#[error("boom")]
struct Boom;

/// Records one line per callback.
#[derive(Default)]
struct Tracer {
    log: Mutex<Vec<String>>,
    stub_add: Option<i32>,
    ignore_root: bool,
}

impl Tracer {
    fn record(&self, line: String) {
        self.log.lock().push(line);
    }

    fn lines(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl AdviceListener for Tracer {
    fn before(&self, advice: &Advice) -> ListenerResult {
        let parent = advice.parent().map_or(0, Advice::invoke_id);
        self.record(format!(
            "before {}#{} parent={} top={}",
            advice.method_name(),
            advice.invoke_id(),
            parent,
            advice.process_top().invoke_id()
        ));
        advice.attach(value(advice.arguments().len()));
        if advice.is_process_top() {
            advice.mark("root");
        }

        if self.ignore_root && advice.is_process_top() {
            return Ok(ProcessControl::ignore_process());
        }
        match self.stub_add {
            Some(stub) if advice.method_name() == "add" => {
                Ok(ProcessControl::return_immediately(value(stub)))
            }
            _ => Ok(ProcessControl::Proceed),
        }
    }

    fn after_returning(&self, advice: &Advice) -> ListenerResult {
        self.record(format!(
            "return {}#{}={:?} args={:?} marked={}",
            advice.method_name(),
            advice.invoke_id(),
            advice.return_value_as::<i32>(),
            advice.attachment_as::<usize>(),
            advice.marked_on_chain("root").len()
        ));
        Ok(ProcessControl::Proceed)
    }

    fn after_throwing(&self, advice: &Advice) -> ListenerResult {
        let message = advice.throwable().map(|t| t.to_string()).unwrap_or_default();
        self.record(format!(
            "throw {}#{} {} throws={}",
            advice.method_name(),
            advice.invoke_id(),
            message,
            advice.is_throws()
        ));
        Ok(ProcessControl::Proceed)
    }

    fn before_line(&self, advice: &Advice, line: i32) -> ListenerResult {
        self.record(format!("line {}#{} {}", advice.method_name(), advice.invoke_id(), line));
        Ok(ProcessControl::Proceed)
    }

    fn before_call(&self, advice: &Advice, call: &CallSite) -> ListenerResult {
        self.record(format!(
            "call {}#{} {}.{}@{}",
            advice.method_name(),
            advice.invoke_id(),
            call.owner,
            call.name,
            call.line
        ));
        Ok(ProcessControl::Proceed)
    }

    fn after_call_returning(&self, _advice: &Advice, call: &CallSite) -> ListenerResult {
        self.record(format!("call-return {}.{}", call.owner, call.name));
        Ok(ProcessControl::Proceed)
    }

    fn after_call_throwing(
        &self,
        _advice: &Advice,
        call: &CallSite,
        exception_type: &str,
    ) -> ListenerResult {
        self.record(format!("call-throw {}.{} {}", call.owner, call.name, exception_type));
        Ok(ProcessControl::Proceed)
    }
}

fn setup(tracer: Tracer) -> (DispatchEngine, Arc<AdviceAdapter<Tracer>>) {
    let engine = DispatchEngine::with_defaults();
    let adapter = Arc::new(AdviceAdapter::new(tracer));
    engine.activate(LISTENER, adapter.clone(), ADVICE_EVENT_KINDS);
    (engine, adapter)
}

fn into_throwable(err: InvocationError) -> Throwable {
    match err {
        InvocationError::Raised(t) => t,
        other => throwable(other),
    }
}

fn add(engine: &DispatchEngine, a: i32, b: i32) -> Result<i32, InvocationError> {
    let site = BeforeSite::new("Calculator", "add", "(II)I");
    engine.invoke(LISTENER, &site, &[value(a), value(b)], None, || Ok(a + b))
}

fn sum(engine: &DispatchEngine) -> Result<i32, InvocationError> {
    let site = BeforeSite::new("Calculator", "sum", "()I");
    engine.invoke(LISTENER, &site, &[], None, || {
        let first = add(engine, 1, 2).map_err(into_throwable)?;
        let second = add(engine, 3, 4).map_err(into_throwable)?;
        Ok(first + second)
    })
}

#[test]
fn test_nested_calls_link_to_parent() {
    let (engine, adapter) = setup(Tracer::default());

    assert_eq!(sum(&engine).unwrap(), 10);
    assert_eq!(
        adapter.listener().lines(),
        vec![
            "before sum#1000 parent=0 top=1000",
            "before add#1001 parent=1000 top=1000",
            "return add#1001=Some(3) args=Some(2) marked=1",
            "before add#1002 parent=1000 top=1000",
            "return add#1002=Some(7) args=Some(2) marked=1",
            "return sum#1000=Some(10) args=Some(0) marked=1",
        ]
    );
    assert_eq!(adapter.depth(), 0);
}

#[test]
fn test_forced_return_closes_advice() {
    let (engine, adapter) = setup(Tracer {
        stub_add: Some(100),
        ..Tracer::default()
    });

    assert_eq!(sum(&engine).unwrap(), 200);
    let lines = adapter.listener().lines();
    assert_eq!(lines[1], "before add#1001 parent=1000 top=1000");
    assert_eq!(lines[2], "return add#1001=Some(100) args=Some(2) marked=1");
    assert_eq!(lines.last().unwrap(), "return sum#1000=Some(200) args=Some(0) marked=1");
    assert_eq!(adapter.depth(), 0);
    assert!(engine.check_listener(LISTENER).is_ok());
}

#[test]
fn test_throw_is_reported_on_same_advice() {
    let (engine, adapter) = setup(Tracer::default());
    let site = BeforeSite::new("Calculator", "div", "(II)I");

    let err = engine
        .invoke::<i32, _>(LISTENER, &site, &[], None, || Err(throwable(Boom)))
        .unwrap_err();
    assert_eq!(err.raised().unwrap().to_string(), "boom");
    assert_eq!(
        adapter.listener().lines(),
        vec![
            "before div#1000 parent=0 top=1000",
            "throw div#1000 boom throws=true",
        ]
    );
}

#[test]
fn test_line_and_call_events_use_open_advice() {
    let (engine, adapter) = setup(Tracer::default());
    let site = BeforeSite::new("Service", "handle", "()V");

    engine.notify_before(LISTENER, &site, &[], None).unwrap();
    engine.notify_line(LISTENER, 12).unwrap();
    engine
        .notify_call_before(LISTENER, &CallSite::new(12, "java/util/List", "size", "()I"))
        .unwrap();
    engine.notify_call_return(LISTENER).unwrap();
    engine
        .notify_call_before(LISTENER, &CallSite::new(13, "app/Repo", "load", "()V"))
        .unwrap();
    engine
        .notify_call_throws(LISTENER, "java.lang.IllegalStateException")
        .unwrap();
    // no call open any more
    engine.notify_call_return(LISTENER).unwrap();
    engine.notify_return(LISTENER, None).unwrap();

    assert_eq!(
        adapter.listener().lines(),
        vec![
            "before handle#1000 parent=0 top=1000",
            "line handle#1000 12",
            "call handle#1000 java.util.List.size@12",
            "call-return java.util.List.size",
            "call handle#1000 app.Repo.load@13",
            "call-throw app.Repo.load java.lang.IllegalStateException",
            "return handle#1000=None args=Some(0) marked=1",
        ]
    );
    assert_eq!(adapter.depth(), 0);
}

#[test]
fn test_ignored_process_leaves_nothing_open() {
    let (engine, adapter) = setup(Tracer {
        ignore_root: true,
        ..Tracer::default()
    });

    assert_eq!(sum(&engine).unwrap(), 10);
    assert_eq!(
        adapter.listener().lines(),
        vec!["before sum#1000 parent=0 top=1000"]
    );
    assert_eq!(adapter.depth(), 0);
}

#[test]
fn test_stale_advice_dropped_at_next_root() {
    // without the immediate kinds a forced return never reaches the advice side
    let engine = DispatchEngine::with_defaults();
    let adapter = Arc::new(AdviceAdapter::new(Tracer {
        stub_add: Some(5),
        ..Tracer::default()
    }));
    engine.activate(LISTENER, adapter.clone(), EventKindSet::invocation());

    assert_eq!(add(&engine, 1, 1).unwrap(), 5);
    assert_eq!(adapter.depth(), 1);

    let site = BeforeSite::new("Calculator", "noop", "()V");
    engine
        .invoke(LISTENER, &site, &[], None, || Ok(()))
        .unwrap();
    let lines = adapter.listener().lines();
    assert_eq!(lines[1], "before noop#1001 parent=0 top=1001");
    assert_eq!(adapter.depth(), 0);
}

/// Clamps the divisor of `div` to at least one.
struct ClampDivisor;

impl AdviceListener for ClampDivisor {
    fn before(&self, advice: &Advice) -> ListenerResult {
        if advice.argument_as::<i32>(1).is_some_and(|b| b < 1) {
            advice.change_argument(1, value(1_i32));
        }
        Ok(ProcessControl::Proceed)
    }
}

#[test]
fn test_changed_arguments_reach_body() {
    let engine = DispatchEngine::with_defaults();
    engine.activate(LISTENER, Arc::new(AdviceAdapter::new(ClampDivisor)), ADVICE_EVENT_KINDS);
    let site = BeforeSite::new("Calculator", "div", "(II)I");

    let quotient: i32 = engine
        .invoke_with_arguments(LISTENER, &site, vec![value(9_i32), value(0_i32)], None, |args| {
            let a = args[0].downcast_ref::<i32>().copied().unwrap_or_default();
            let b = args[1].downcast_ref::<i32>().copied().unwrap_or_default();
            Ok(a / b)
        })
        .unwrap();
    assert_eq!(quotient, 9);
    assert!(engine.check_listener(LISTENER).is_ok());
}

#[test]
fn test_adapters_keep_separate_stacks() {
    let engine = DispatchEngine::with_defaults();
    let first = Arc::new(AdviceAdapter::new(Tracer::default()));
    let second = Arc::new(AdviceAdapter::new(Tracer::default()));
    engine.activate(LISTENER, first.clone(), ADVICE_EVENT_KINDS);
    engine.activate(LISTENER + 1, second.clone(), ADVICE_EVENT_KINDS);

    let site = BeforeSite::new("Calculator", "add", "(II)I");
    engine.notify_before(LISTENER, &site, &[], None).unwrap();
    assert_eq!(first.depth(), 1);
    assert_eq!(second.depth(), 0);

    engine.notify_return(LISTENER, Some(&value(1_i32))).unwrap();
    assert_eq!(first.depth(), 0);
}
