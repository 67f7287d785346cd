// Copyright (c) 2024 svinit contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runlevel State Machine (spec.md §4.4): tracks the active operating mode
//! and the in-flight transition between two modes, independent of which
//! services that implies — the dependency-aware stop/start sequencing lives
//! in [`crate::reconcile`], which reads this machine's state.

use crate::error::{Error, Result};

/// `Steady(level)` outside a transition; `Transitioning{from,to}` while old
/// services are being torn down and new ones brought up (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelState {
    Steady(u32),
    Transitioning { from: u32, to: u32 },
}

pub struct RunlevelMachine {
    state: LevelState,
    max_runlevels: u32,
}

impl RunlevelMachine {
    pub fn new(initial: u32, max_runlevels: u32) -> Self {
        RunlevelMachine {
            state: LevelState::Steady(initial),
            max_runlevels,
        }
    }

    pub fn state(&self) -> LevelState {
        self.state
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self.state, LevelState::Transitioning { .. })
    }

    /// The runlevel whose service set is (or was, mid-transition) active.
    pub fn from_level(&self) -> u32 {
        match self.state {
            LevelState::Steady(l) => l,
            LevelState::Transitioning { from, .. } => from,
        }
    }

    /// The runlevel reconciliation is driving toward. Equal to
    /// [`Self::from_level`] when steady.
    pub fn target_level(&self) -> u32 {
        match self.state {
            LevelState::Steady(l) => l,
            LevelState::Transitioning { to, .. } => to,
        }
    }

    /// Validates and begins a switch. Returns `Ok(false)` for the
    /// `current == requested` no-op case (spec.md §8 idempotence property),
    /// `Ok(true)` once a transition has started, and `Err(InvalidRunlevel)`
    /// for an out-of-range target — in which case the state is untouched.
    ///
    /// A switch requested while already transitioning replaces the pending
    /// target; stops already in flight for the old target continue (any
    /// service not in the new target's set either way), and the
    /// newly-additional stops are picked up on the next reconciliation pass.
    pub fn request_switch(&mut self, requested: i64) -> Result<bool> {
        if requested < 0 || requested >= self.max_runlevels as i64 {
            return Err(Error::InvalidRunlevel(requested));
        }
        let requested = requested as u32;
        if requested == self.target_level() && !self.is_transitioning() {
            return Ok(false);
        }
        self.state = LevelState::Transitioning {
            from: self.from_level(),
            to: requested,
        };
        Ok(true)
    }

    /// Called once every instance that must stop for this transition has
    /// reached `Stopped`/`Failed`. Moves the machine to `Steady(to)`.
    pub fn settle(&mut self) {
        if let LevelState::Transitioning { to, .. } = self.state {
            self.state = LevelState::Steady(to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_to_same_level_is_noop() {
        let mut m = RunlevelMachine::new(1, 8);
        assert_eq!(m.request_switch(1).unwrap(), false);
        assert_eq!(m.state(), LevelState::Steady(1));
    }

    #[test]
    fn switch_to_new_level_begins_transition() {
        let mut m = RunlevelMachine::new(1, 8);
        assert_eq!(m.request_switch(2).unwrap(), true);
        assert_eq!(
            m.state(),
            LevelState::Transitioning { from: 1, to: 2 }
        );
    }

    #[test]
    fn negative_or_out_of_range_switch_is_rejected_without_state_change() {
        let mut m = RunlevelMachine::new(1, 8);
        assert!(matches!(
            m.request_switch(-1),
            Err(Error::InvalidRunlevel(-1))
        ));
        assert!(matches!(
            m.request_switch(8),
            Err(Error::InvalidRunlevel(8))
        ));
        assert_eq!(m.state(), LevelState::Steady(1));
    }

    #[test]
    fn settle_moves_to_steady_target() {
        let mut m = RunlevelMachine::new(1, 8);
        m.request_switch(2).unwrap();
        m.settle();
        assert_eq!(m.state(), LevelState::Steady(2));
    }

    #[test]
    fn settle_on_steady_state_is_a_noop() {
        let mut m = RunlevelMachine::new(3, 8);
        m.settle();
        assert_eq!(m.state(), LevelState::Steady(3));
    }
}
