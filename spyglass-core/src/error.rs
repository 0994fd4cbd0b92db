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

//! Engine error types

use crate::event::EventKind;
use thiserror::Error;

/// Result type for notification entry points
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors surfaced to the instrumented call site
#[derive(Debug, Error)]
pub enum DispatchError {
    /// An interrupting listener failed; the failure must reach the call site.
    #[error("Listener {listener_id} interrupted {kind} dispatch: {source}")]
    Interrupted {
        listener_id: u32,
        kind: EventKind,
        #[source]
        source: anyhow::Error,
    },

    /// Process-stack check failed under `MismatchPolicy::Strict`.
    #[error(
        "Invocation stack mismatch for listener {listener_id}: process_id={process_id}, invoke_id={invoke_id}"
    )]
    StackMismatch {
        listener_id: u32,
        process_id: u64,
        invoke_id: u64,
    },
}

impl DispatchError {
    pub fn listener_id(&self) -> u32 {
        match self {
            DispatchError::Interrupted { listener_id, .. }
            | DispatchError::StackMismatch { listener_id, .. } => *listener_id,
        }
    }
}

/// Errors from loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Problems reported by [`DispatchEngine::check_listener`](crate::engine::DispatchEngine::check_listener)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeakError {
    #[error("Listener {listener_id} left {depth} open frame(s) on this thread")]
    OpenFrames { listener_id: u32, depth: usize },

    #[error("Listener {listener_id} left an ignore marker for process {process_id}")]
    IgnoreMarker { listener_id: u32, process_id: u64 },

    #[error("Listener {listener_id} left a pending immediate throw")]
    PendingThrow { listener_id: u32 },
}
