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

//! Child Table & Reaper (spec.md §4.2): the single place that owns the
//! pid -> service mapping and turns `SIGCHLD` into exit records.
//!
//! Grounded in the launcher's service table / stopping-services split
//! (`launcher/src/server/mod.rs`, `launcher/src/server/service.rs`): one
//! table keyed by pid, drained in a loop until `waitpid` reports nothing
//! left, because a single `SIGCHLD` can coalesce any number of real exits.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use svinit_core::os::process::{try_reap_any, ExitKind, Pid};

use crate::model::{ExitCause, ServiceName};

/// One reaped child, identified back to the service it belonged to.
pub struct ReapedChild {
    pub name: ServiceName,
    pub pid: Pid,
    pub cause: ExitCause,
}

/// Non-blocking "give me the next finished child, if any" source. Abstracted
/// so the reconciliation loop's tests can drive crash/restart and
/// signal-storm scenarios (spec.md §8) without forking real processes —
/// mirrors how [`crate::clock::Clock`] and [`crate::spawn::Spawner`] are
/// already seams for the same reason.
pub trait Reaper: Send + Sync {
    fn try_reap_any(&self) -> svinit_core::Result<Option<(Pid, ExitKind)>>;
}

/// The real reaper: a thin pass-through to `waitpid(-1, WNOHANG)`.
#[derive(Default)]
pub struct SystemReaper;

impl Reaper for SystemReaper {
    fn try_reap_any(&self) -> svinit_core::Result<Option<(Pid, ExitKind)>> {
        try_reap_any()
    }
}

/// A queue of synthetic exits a test pushes onto, drained in FIFO order —
/// the same order real `waitpid` calls would observe them in a single
/// reconciliation pass (spec.md §5 O1).
#[derive(Default)]
pub struct FakeReaper {
    pending: Mutex<VecDeque<(Pid, ExitKind)>>,
}

impl FakeReaper {
    pub fn new() -> Self {
        FakeReaper::default()
    }

    pub fn push_exit(&self, pid: Pid, kind: ExitKind) {
        self.pending.lock().unwrap().push_back((pid, kind));
    }
}

impl Reaper for FakeReaper {
    fn try_reap_any(&self) -> svinit_core::Result<Option<(Pid, ExitKind)>> {
        Ok(self.pending.lock().unwrap().pop_front())
    }
}

/// Tracks which pid belongs to which service while it's alive.
#[derive(Default)]
pub struct ChildTable {
    owners: HashMap<Pid, ServiceName>,
}

impl ChildTable {
    pub fn new() -> Self {
        ChildTable::default()
    }

    pub fn insert(&mut self, pid: Pid, name: ServiceName) {
        self.owners.insert(pid, name);
    }

    /// Drops the pid without crediting anyone an exit. Used when a spawn is
    /// abandoned (e.g. the instance was stopped before we got to record it).
    pub fn forget(&mut self, pid: Pid) {
        self.owners.remove(&pid);
    }

    pub fn owner(&self, pid: Pid) -> Option<&ServiceName> {
        self.owners.get(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.owners.contains_key(&pid)
    }

    /// Drains every exit currently reapable, non-blocking. A pid this table
    /// doesn't recognize (an orphaned grandchild reparented to us, or a
    /// double-reap race) is reaped to keep the zombie table clean and then
    /// silently discarded — it credits no instance.
    pub fn reap_all(&mut self, reaper: &dyn Reaper) -> svinit_core::Result<Vec<ReapedChild>> {
        let mut reaped = Vec::new();
        loop {
            match reaper.try_reap_any()? {
                None => break,
                Some((pid, kind)) => {
                    if let Some(name) = self.owners.remove(&pid) {
                        reaped.push(ReapedChild {
                            name,
                            pid,
                            cause: exit_cause(kind),
                        });
                    }
                }
            }
        }
        Ok(reaped)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

fn exit_cause(kind: ExitKind) -> ExitCause {
    match kind {
        ExitKind::Exited(code) => ExitCause::Exited(code),
        ExitKind::Signaled(sig) => ExitCause::Signaled(sig),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forgotten_pid_is_not_owned() {
        let mut table = ChildTable::new();
        table.insert(42, ServiceName::from("web"));
        table.forget(42);
        assert!(!table.contains(42));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn owner_lookup_reflects_inserts() {
        let mut table = ChildTable::new();
        table.insert(7, ServiceName::from("db"));
        assert_eq!(table.owner(7), Some(&ServiceName::from("db")));
        assert_eq!(table.owner(8), None);
    }

    #[test]
    fn reap_all_ignores_unrecognized_pids() {
        let mut table = ChildTable::new();
        table.insert(1, ServiceName::from("ghost"));
        let reaper = FakeReaper::new();
        reaper.push_exit(999, ExitKind::Exited(0));
        let reaped = table.reap_all(&reaper).unwrap();
        assert!(reaped.is_empty());
        // The unrecognized pid's entry is still gone from the table, but we
        // never held one for it in the first place — the recognized ghost
        // pid is untouched since it never exited.
        assert!(table.contains(1));
    }

    #[test]
    fn reap_all_drains_every_pending_exit_in_one_pass() {
        // spec.md §4.2: "it must loop until no more children are ready,
        // because a single event coalesces multiple exits."
        let mut table = ChildTable::new();
        table.insert(1, ServiceName::from("a"));
        table.insert(2, ServiceName::from("b"));
        let reaper = FakeReaper::new();
        reaper.push_exit(1, ExitKind::Exited(0));
        reaper.push_exit(2, ExitKind::Signaled(9));

        let reaped = table.reap_all(&reaper).unwrap();
        assert_eq!(reaped.len(), 2);
        assert!(table.is_empty());
    }
}
