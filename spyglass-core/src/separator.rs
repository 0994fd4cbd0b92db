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

//! Reclassification of exits produced by a process-control override.
//!
//! After a listener forces a return or a throw, the exit that follows is not the
//! method's own outcome. The separator remembers the override and turns the next
//! `RETURN` / `THROWS` into `IMMEDIATELY_RETURN` / `IMMEDIATELY_THROWS`.

use crate::event::EventKind;
use crate::listener::ProcessControl;

/// Step of the per-thread, per-listener separator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImmediateStep {
    #[default]
    Original,
    PendingImmediateReturn,
    PendingImmediateThrows,
}

#[derive(Debug, Default, Clone)]
pub struct ImmediateSeparator {
    step: ImmediateStep,
}

impl ImmediateSeparator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self) -> ImmediateStep {
        self.step
    }

    /// Resolve the kind to deliver for `kind`. Always leaves the separator at `Original`.
    pub fn classify(&mut self, kind: EventKind) -> EventKind {
        let effective = match (self.step, kind) {
            (ImmediateStep::PendingImmediateReturn, EventKind::Return) => {
                EventKind::ImmediatelyReturn
            }
            (ImmediateStep::PendingImmediateThrows, EventKind::Throws) => {
                EventKind::ImmediatelyThrows
            }
            _ => kind,
        };
        self.step = ImmediateStep::Original;
        effective
    }

    /// Remember an override raised by a listener.
    pub fn record_override(&mut self, control: &ProcessControl) {
        self.step = match control {
            ProcessControl::ReturnImmediately { .. } => ImmediateStep::PendingImmediateReturn,
            ProcessControl::ThrowsImmediately { .. } => ImmediateStep::PendingImmediateThrows,
            ProcessControl::Proceed | ProcessControl::NoneImmediately { .. } => {
                ImmediateStep::Original
            }
        };
    }

    pub fn reset(&mut self) {
        self.step = ImmediateStep::Original;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{throwable, value};

    #[derive(Debug, thiserror::Error)]
    #[error("forced")]
    struct Forced;

    #[test]
    fn test_identity_without_override() {
        let mut sep = ImmediateSeparator::new();
        for kind in EventKind::ALL {
            assert_eq!(sep.classify(kind), kind);
        }
    }

    #[test]
    fn test_return_override_reclassifies_once() {
        let mut sep = ImmediateSeparator::new();
        sep.record_override(&ProcessControl::return_immediately(value(1_u8)));
        assert_eq!(sep.step(), ImmediateStep::PendingImmediateReturn);
        assert_eq!(sep.classify(EventKind::Return), EventKind::ImmediatelyReturn);
        assert_eq!(sep.classify(EventKind::Return), EventKind::Return);
    }

    #[test]
    fn test_throws_override_only_matches_throws() {
        let mut sep = ImmediateSeparator::new();
        sep.record_override(&ProcessControl::throws_immediately(throwable(Forced)));
        // a mismatched kind passes through and still resets the step
        assert_eq!(sep.classify(EventKind::Return), EventKind::Return);
        assert_eq!(sep.step(), ImmediateStep::Original);

        sep.record_override(&ProcessControl::throws_immediately(throwable(Forced)));
        assert_eq!(sep.classify(EventKind::Throws), EventKind::ImmediatelyThrows);
    }

    #[test]
    fn test_none_immediately_does_not_arm() {
        let mut sep = ImmediateSeparator::new();
        sep.record_override(&ProcessControl::ignore_process());
        assert_eq!(sep.step(), ImmediateStep::Original);
    }
}
