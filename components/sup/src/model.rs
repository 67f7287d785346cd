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

//! The declared Service and its runtime Instance — spec.md §3 "Data Model".

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use svinit_core::os::process::Pid;

/// Unique identifier for a declared service. Also the token used in
/// dependency lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceName(pub String);

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceName {
    fn from(s: &str) -> Self {
        ServiceName(s.to_string())
    }
}

/// Optional resource envelope passed to the confinement applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub memory_bytes: u64,
    pub cpu_percent: u8,
}

/// `always` is the only restart policy spec.md defines. Modeled as an enum
/// (rather than a bool) so a future policy doesn't need a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    Always,
}

/// The immutable description of a managed program (spec.md §3 "Service").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: ServiceName,
    pub command: Vec<String>,
    pub runlevels: BTreeSet<u32>,
    pub dependencies: Vec<ServiceName>,
    pub resources: Option<Resources>,
    pub restart_policy: RestartPolicy,
}

impl Service {
    pub fn program(&self) -> &str {
        self.command
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Inactive,
    WaitingDeps,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            State::Inactive => "inactive",
            State::WaitingDeps => "waiting-deps",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
            State::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl State {
    /// Invariant from spec.md §8: `child_id` is set iff state is one of
    /// these three.
    pub fn holds_child_id(&self) -> bool {
        matches!(self, State::Starting | State::Running | State::Stopping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Stopped | State::Failed | State::Inactive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    Exited(i32),
    Signaled(i32),
}

#[derive(Debug, Clone, Copy)]
pub struct ExitRecord {
    pub cause: ExitCause,
    pub at: Instant,
}

/// The mutable record paired 1:1 with a [`Service`] while supervised
/// (spec.md §3 "Service instance (runtime)").
#[derive(Debug)]
pub struct Instance {
    pub state: State,
    pub child_id: Option<Pid>,
    pub attempts: u32,
    pub next_attempt_at: Instant,
    pub last_exit: Option<ExitRecord>,
    /// Set by `Stop` control requests (spec.md §4.6): suppresses restart
    /// until the next reload or runlevel change.
    pub restart_suppressed: bool,
    /// When the instance last entered `Running`, used to compute the
    /// `success_window` that resets `attempts` back to zero.
    pub running_since: Option<Instant>,
    /// Deadline for escalating a graceful stop to a forceful kill.
    pub kill_at: Option<Instant>,
}

impl Default for Instance {
    fn default() -> Self {
        Instance {
            state: State::Inactive,
            child_id: None,
            attempts: 0,
            next_attempt_at: Instant::now(),
            last_exit: None,
            restart_suppressed: false,
            running_since: None,
            kill_at: None,
        }
    }
}

impl Instance {
    /// spec.md §3 "Lifecycle": an instance is "destroyed (returned to
    /// Inactive) on successful stop" — `Stopped` is the momentarily
    /// observable marker a clean exit leaves for `Status` queries, not a
    /// dead end, so reconciliation treats it the same as `Inactive` when
    /// deciding whether a still-wanted service may start again.
    pub fn is_startable_state(&self) -> bool {
        matches!(
            self.state,
            State::Inactive | State::WaitingDeps | State::Stopped | State::Failed
        )
    }
}

pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);
pub const MAX_ATTEMPTS: u32 = 5;
pub const SUCCESS_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// `next_attempt_at = now + min(base * 2^(attempts - 1), cap)` (spec.md §4.3).
pub fn backoff_delay(attempts: u32) -> Duration {
    debug_assert!(attempts >= 1);
    let shift = attempts.saturating_sub(1).min(6); // 2^6 * 1s = 64s already > cap
    let scaled = BACKOFF_BASE.saturating_mul(1u32 << shift);
    scaled.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_matches_spec_scenario() {
        // spec.md §8 scenario 2: deltas of 1s, 2s, 4s for attempts 1, 2, 3.
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn backoff_caps_at_60s() {
        assert_eq!(backoff_delay(10), BACKOFF_CAP);
        assert_eq!(backoff_delay(100), BACKOFF_CAP);
    }

    #[test]
    fn backoff_is_monotonic_until_cap() {
        let mut prev = Duration::from_secs(0);
        for attempt in 1..=8 {
            let d = backoff_delay(attempt);
            assert!(d >= prev, "backoff decreased at attempt {attempt}");
            prev = d;
        }
    }
}
