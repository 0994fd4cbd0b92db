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

//! Spyglass Advice
//!
//! Invocation-level view over the raw event stream of `spyglass-core`. Instead of
//! matching `BEFORE`/`RETURN` pairs by invoke id, implement [`AdviceListener`] and
//! receive the same [`Advice`] on entry and exit, linked to the advice of its caller.
//!
//! ```rust
//! use spyglass_advice::{Advice, AdviceAdapter, AdviceListener, ADVICE_EVENT_KINDS};
//! use spyglass_core::{value, BeforeSite, DispatchEngine, ListenerResult, ProcessControl};
//! use std::sync::Arc;
//!
//! struct Doubler;
//!
//! impl AdviceListener for Doubler {
//!     fn after_returning(&self, advice: &Advice) -> ListenerResult {
//!         let result = advice.return_value_as::<i32>().unwrap_or_default();
//!         Ok(ProcessControl::return_immediately(value(result * 2)))
//!     }
//! }
//!
//! let engine = DispatchEngine::with_defaults();
//! engine.activate(1, Arc::new(AdviceAdapter::new(Doubler)), ADVICE_EVENT_KINDS);
//!
//! let site = BeforeSite::new("Calculator", "add", "(II)I");
//! let sum: i32 = engine.invoke(1, &site, &[], None, || Ok(1 + 2)).unwrap();
//! assert_eq!(sum, 6);
//! ```

pub mod adapter;
pub mod advice;

pub use adapter::{AdviceAdapter, AdviceListener, ADVICE_EVENT_KINDS};
pub use advice::{Advice, AdviceState};
