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

//! Turning outcomes into control flow at an instrumented call site.
//!
//! [`DispatchEngine::invoke`] is what a rewriter would inline around a method body:
//! report entry, run the body unless told otherwise, report the exit and apply
//! whatever the listener decided.

use crate::dispatcher::Outcome;
use crate::engine::DispatchEngine;
use crate::error::DispatchError;
use crate::event::{BeforeSite, Throwable, Value};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Failure of an instrumented invocation.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The method raised, either on its own or because a listener forced it.
    #[error("Invocation raised: {0}")]
    Raised(Throwable),

    #[error(transparent)]
    Interrupted(#[from] DispatchError),

    /// A forced return value does not have the method's return type.
    #[error("Forced return value is not a {expected}")]
    ReturnTypeMismatch { expected: &'static str },
}

impl InvocationError {
    pub fn raised(&self) -> Option<&Throwable> {
        match self {
            InvocationError::Raised(t) => Some(t),
            _ => None,
        }
    }
}

fn downcast<T: Any + Clone>(value: Value) -> Result<T, InvocationError> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or(InvocationError::ReturnTypeMismatch {
            expected: std::any::type_name::<T>(),
        })
}

impl Outcome {
    /// Split into the call site's three paths: `Ok(None)` to continue, `Ok(Some(v))` to
    /// return `v`, `Err(Raised)` to throw.
    pub fn resolve<T: Any + Clone>(self) -> Result<Option<T>, InvocationError> {
        match self {
            Outcome::Proceed => Ok(None),
            Outcome::ReturnWith(value) => downcast(value).map(Some),
            Outcome::ThrowWith(t) => Err(InvocationError::Raised(t)),
        }
    }
}

impl DispatchEngine {
    /// Run `body` as an instrumented method observed by `listener_id`.
    pub fn invoke<T, F>(
        &self,
        listener_id: u32,
        site: &BeforeSite,
        arguments: &[Value],
        receiver: Option<&Value>,
        body: F,
    ) -> Result<T, InvocationError>
    where
        T: Any + Send + Sync + Clone,
        F: FnOnce() -> Result<T, Throwable>,
    {
        self.invoke_with_arguments(listener_id, site, arguments.to_vec(), receiver, |_| body())
    }

    /// Like [`invoke`](Self::invoke), but `body` receives the arguments after the
    /// listener had the chance to replace them.
    pub fn invoke_with_arguments<T, F>(
        &self,
        listener_id: u32,
        site: &BeforeSite,
        mut arguments: Vec<Value>,
        receiver: Option<&Value>,
        body: F,
    ) -> Result<T, InvocationError>
    where
        T: Any + Send + Sync + Clone,
        F: FnOnce(&[Value]) -> Result<T, Throwable>,
    {
        match self.notify_before_mut(listener_id, site, &mut arguments, receiver)? {
            Outcome::Proceed => {}
            Outcome::ReturnWith(value) => return downcast(value),
            // the forced throw unwinds through the method's own exit path
            Outcome::ThrowWith(t) => return self.exit_by_throw(listener_id, t),
        }

        match body(&arguments) {
            Ok(result) => {
                let returned: Value = Arc::new(result.clone());
                match self.notify_return(listener_id, Some(&returned))? {
                    Outcome::Proceed => Ok(result),
                    Outcome::ReturnWith(value) => downcast(value),
                    Outcome::ThrowWith(t) => self.exit_by_throw(listener_id, t),
                }
            }
            Err(t) => self.exit_by_throw(listener_id, t),
        }
    }

    fn exit_by_throw<T: Any + Clone>(
        &self,
        listener_id: u32,
        thrown: Throwable,
    ) -> Result<T, InvocationError> {
        match self.notify_throws(listener_id, &thrown)? {
            Outcome::Proceed => Err(InvocationError::Raised(thrown)),
            Outcome::ReturnWith(value) => downcast(value),
            Outcome::ThrowWith(t) => Err(InvocationError::Raised(t)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{throwable, value, EventKind, EventKindSet};
    use crate::listener::{CallbackListener, NoOpListener, ProcessControl};

    #[derive(Debug, thiserror::Error)]
    #[error("divide by zero")]
    struct DivideByZero;

    fn site() -> BeforeSite {
        BeforeSite::new("Calc", "div", "(II)I")
    }

    #[test]
    fn test_resolve_paths() {
        assert_eq!(Outcome::Proceed.resolve::<i32>().unwrap(), None);
        assert_eq!(Outcome::ReturnWith(value(3_i32)).resolve::<i32>().unwrap(), Some(3));
        assert!(matches!(
            Outcome::ReturnWith(value("x")).resolve::<i32>(),
            Err(InvocationError::ReturnTypeMismatch { .. })
        ));
        assert!(Outcome::ThrowWith(throwable(DivideByZero))
            .resolve::<i32>()
            .unwrap_err()
            .raised()
            .is_some());
    }

    #[test]
    fn test_invoke_runs_body() {
        let engine = DispatchEngine::with_defaults();
        engine.activate(1, Arc::new(NoOpListener::new("noop")), EventKindSet::all());

        let result = engine.invoke(1, &site(), &[], None, || Ok(6 / 3)).unwrap();
        assert_eq!(result, 2);
        assert!(engine.check_listener(1).is_ok());
    }

    #[test]
    fn test_body_sees_replaced_arguments() {
        let engine = DispatchEngine::with_defaults();
        engine.activate(
            1,
            Arc::new(CallbackListener::new("guard", |event| {
                // never divide by zero
                if event.argument(1).and_then(|v| v.downcast_ref::<i32>().copied()) == Some(0) {
                    event.change_argument(1, value(1_i32));
                }
                Ok(ProcessControl::Proceed)
            })),
            EventKindSet::invocation(),
        );

        let result = engine
            .invoke_with_arguments(1, &site(), vec![value(6_i32), value(0_i32)], None, |args| {
                let a = args[0].downcast_ref::<i32>().copied().unwrap_or_default();
                let b = args[1].downcast_ref::<i32>().copied().unwrap_or_default();
                Ok(a / b)
            })
            .unwrap();
        assert_eq!(result, 6);
        assert!(engine.check_listener(1).is_ok());
    }

    #[test]
    fn test_throw_replaced_by_return() {
        let engine = DispatchEngine::with_defaults();
        engine.activate(
            1,
            Arc::new(CallbackListener::new("rescue", |event| {
                if event.kind() == EventKind::Throws {
                    Ok(ProcessControl::return_immediately(value(0_i32)))
                } else {
                    Ok(ProcessControl::Proceed)
                }
            })),
            EventKindSet::invocation(),
        );

        let result = engine
            .invoke(1, &site(), &[], None, || -> Result<i32, Throwable> {
                Err(throwable(DivideByZero))
            })
            .unwrap();
        assert_eq!(result, 0);
        assert!(engine.check_listener(1).is_ok());
    }

    #[test]
    fn test_forced_throw_on_return() {
        let engine = DispatchEngine::with_defaults();
        let forced = throwable(DivideByZero);
        let thrown = Arc::clone(&forced);
        engine.activate(
            1,
            Arc::new(CallbackListener::new("veto", move |event| {
                if event.kind() == EventKind::Return {
                    Ok(ProcessControl::throws_immediately(Arc::clone(&thrown)))
                } else {
                    Ok(ProcessControl::Proceed)
                }
            })),
            EventKindSet::all(),
        );

        let err = engine.invoke(1, &site(), &[], None, || Ok(1_i32)).unwrap_err();
        assert!(Arc::ptr_eq(err.raised().unwrap(), &forced));
        assert!(engine.check_listener(1).is_ok());
    }
}
