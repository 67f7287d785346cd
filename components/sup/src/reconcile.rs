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

//! Supervisor Core (spec.md §4.2–§4.4, §5): the single-threaded
//! reconciliation loop tying together the registry, child table, runlevel
//! machine, confinement applier and spawner.
//!
//! Grounded in the launcher's `server::Server::run` tick (poll signals,
//! drain the reap queue, then reconcile desired vs. actual) but reshaped
//! around this spec's dependency-ordered, runlevel-scoped service set
//! instead of a flat supervised-binary list.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use svinit_core::os::process::{signal, Signal};

use crate::child_table::{ChildTable, Reaper};
use crate::clock::Clock;
use crate::config::Registry;
use crate::error::{Error, Result};
use crate::model::{
    backoff_delay, ExitCause, Instance, Service, ServiceName, State, DEFAULT_STOP_GRACE,
    MAX_ATTEMPTS, SUCCESS_WINDOW,
};
use crate::runlevel::RunlevelMachine;
use crate::spawn::Spawner;

pub struct Supervisor {
    registry: Registry,
    instances: BTreeMap<ServiceName, Instance>,
    children: ChildTable,
    runlevel: RunlevelMachine,
    spawner: Arc<dyn Spawner>,
    reaper: Arc<dyn Reaper>,
    clock: Arc<dyn Clock>,
    strict_resources: bool,
    stop_grace: Duration,
    max_processes: usize,
    shutting_down: bool,
}

impl Supervisor {
    pub fn new(
        registry: Registry,
        initial_runlevel: u32,
        max_runlevels: u32,
        spawner: Arc<dyn Spawner>,
        reaper: Arc<dyn Reaper>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let instances = registry
            .names()
            .map(|n| {
                (
                    n.clone(),
                    Instance {
                        next_attempt_at: now,
                        ..Instance::default()
                    },
                )
            })
            .collect();
        Supervisor {
            registry,
            instances,
            children: ChildTable::new(),
            runlevel: RunlevelMachine::new(initial_runlevel, max_runlevels),
            spawner,
            reaper,
            clock,
            strict_resources: false,
            stop_grace: DEFAULT_STOP_GRACE,
            max_processes: 0,
            shutting_down: false,
        }
    }

    pub fn with_strict_resources(mut self, strict: bool) -> Self {
        self.strict_resources = strict;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn runlevel(&self) -> &RunlevelMachine {
        &self.runlevel
    }

    pub fn instance(&self, name: &ServiceName) -> Option<&Instance> {
        self.instances.get(name)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// True once every instance has reached a terminal state; the main
    /// loop uses this to decide when graceful shutdown may exit.
    pub fn all_instances_terminal(&self) -> bool {
        self.instances.values().all(|i| i.state.is_terminal())
    }

    /// One pass of the reconciliation loop: reap finished children, reset
    /// backoff for services that have been up long enough, then either
    /// drive an in-flight runlevel transition or start whatever in the
    /// current runlevel isn't yet running.
    pub fn tick(&mut self) -> Result<()> {
        self.reap_children()?;
        self.reset_success_windows();

        if self.shutting_down {
            self.drive_stop_set(&std::collections::BTreeSet::new())?;
            return Ok(());
        }

        if self.runlevel.is_transitioning() {
            self.drive_transition()?;
        } else {
            let target = self.runlevel.target_level();
            self.start_schedule(target)?;
        }
        Ok(())
    }

    // --- Reaping (spec.md §4.2) ---------------------------------------

    fn reap_children(&mut self) -> Result<()> {
        let reaped = self.children.reap_all(&*self.reaper)?;
        for child in reaped {
            let Some(instance) = self.instances.get_mut(&child.name) else {
                continue;
            };
            let was_stopping = instance.state == State::Stopping;
            let clean = matches!(child.cause, ExitCause::Exited(0));

            instance.child_id = None;
            instance.running_since = None;
            instance.kill_at = None;
            instance.last_exit = Some(crate::model::ExitRecord {
                cause: child.cause,
                at: self.clock.now(),
            });

            if was_stopping && clean {
                instance.state = State::Stopped;
                info!("service '{}' stopped cleanly", child.name);
            } else {
                instance.state = State::Failed;
                instance.attempts += 1;
                let delay = backoff_delay(instance.attempts);
                instance.next_attempt_at = self.clock.now() + delay;
                if instance.attempts >= MAX_ATTEMPTS {
                    warn!(
                        "service '{}' failed {} consecutive times; pinned Failed until external start or reload",
                        child.name, instance.attempts
                    );
                } else {
                    warn!(
                        "service '{}' exited unexpectedly ({:?}); retrying in {:?}",
                        child.name, child.cause, delay
                    );
                }
            }
        }
        Ok(())
    }

    fn reset_success_windows(&mut self) {
        let now = self.clock.now();
        for (name, instance) in self.instances.iter_mut() {
            if instance.state == State::Running && instance.attempts > 0 {
                if let Some(since) = instance.running_since {
                    if now.duration_since(since) >= SUCCESS_WINDOW {
                        instance.attempts = 0;
                        info!("service '{name}' stable for success window; backoff reset");
                    }
                }
            }
        }
    }

    // --- Runlevel transitions (spec.md §4.4) ---------------------------

    fn drive_transition(&mut self) -> Result<()> {
        let to = self.runlevel.target_level();
        let wanted = self.registry.services_for(to)?.into_iter().collect();
        self.drive_stop_set(&wanted)?;

        if self.all_non_members_settled(&wanted) {
            self.runlevel.settle();
            // spec.md §4.6: a `Stop` request's restart suppression lasts only
            // "until the next reload or runlevel change" — this is that
            // change taking effect, so every surviving instance is eligible
            // to start again under the new level.
            for instance in self.instances.values_mut() {
                instance.restart_suppressed = false;
            }
            self.start_schedule(to)?;
        }
        Ok(())
    }

    /// Issues stop signals (and grace-timeout kills) for every instance not
    /// in `wanted`, in reverse dependency order (spec.md §4.4, §8 scenario
    /// 3: dependents stop before their dependencies).
    fn drive_stop_set(&mut self, wanted: &std::collections::BTreeSet<ServiceName>) -> Result<()> {
        let candidates: std::collections::BTreeSet<ServiceName> = self
            .instances
            .iter()
            .filter(|(name, inst)| !wanted.contains(*name) && !inst.state.is_terminal())
            .map(|(name, _)| name.clone())
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        let order = self.registry.topo_order(&candidates)?;
        let now = self.clock.now();

        for name in order.into_iter().rev() {
            let instance = self.instances.get_mut(&name).expect("from instances map");
            match instance.state {
                State::Inactive | State::Stopped | State::Failed => {}
                State::WaitingDeps => {
                    instance.state = State::Inactive;
                }
                State::Starting | State::Running => {
                    if let Some(pid) = instance.child_id {
                        let _ = signal(pid, Signal::TERM);
                    }
                    instance.state = State::Stopping;
                    instance.kill_at = Some(now + self.stop_grace);
                    info!("stopping service '{name}'");
                }
                State::Stopping => {
                    if instance.kill_at.map(|at| now >= at).unwrap_or(false) {
                        if let Some(pid) = instance.child_id {
                            let _ = signal(pid, Signal::KILL);
                            warn!("service '{name}' exceeded stop grace; sent SIGKILL");
                        }
                        instance.kill_at = None;
                    }
                }
            }
        }
        Ok(())
    }

    fn all_non_members_settled(&self, wanted: &std::collections::BTreeSet<ServiceName>) -> bool {
        self.instances
            .iter()
            .filter(|(name, _)| !wanted.contains(*name))
            .all(|(_, inst)| inst.state.is_terminal())
    }

    // --- Dependency-ordered start scheduling (spec.md §4.3) ------------

    fn start_schedule(&mut self, level: u32) -> Result<()> {
        let order = self.registry.services_for(level)?;
        let now = self.clock.now();

        if self.max_processes > 0 && self.children.len() >= self.max_processes {
            return Ok(());
        }

        for name in order {
            if self.max_processes > 0 && self.children.len() >= self.max_processes {
                warn!("max_processes reached; refusing further starts this pass");
                break;
            }
            let deps_ready = {
                let svc = self.registry.get(&name).expect("from services_for");
                svc.dependencies.iter().all(|d| {
                    self.instances
                        .get(d)
                        .map(|i| i.state == State::Running)
                        .unwrap_or(false)
                })
            };

            let instance = self.instances.get_mut(&name).expect("from services_for");
            if instance.state == State::Running {
                continue;
            }
            if !instance.is_startable_state() {
                continue;
            }
            if instance.restart_suppressed {
                continue;
            }
            if instance.state == State::Failed && instance.attempts >= MAX_ATTEMPTS {
                continue;
            }

            if !deps_ready {
                instance.state = State::WaitingDeps;
                continue;
            }
            if now < instance.next_attempt_at {
                continue;
            }

            self.start_one(&name, now)?;
        }
        Ok(())
    }

    fn start_one(&mut self, name: &ServiceName, now: std::time::Instant) -> Result<()> {
        let svc: Service = self.registry.get(name).expect("caller checked").clone();
        let instance = self.instances.get_mut(name).expect("caller checked");
        instance.state = State::Starting;

        match self.spawner.spawn(&svc, self.strict_resources) {
            Ok(outcome) => {
                if let Some(warning) = outcome.resource_warning {
                    warn!(
                        "resource limits for '{}' could not be fully applied: {}",
                        name, warning
                    );
                }
                self.children.insert(outcome.pid, name.clone());
                let instance = self.instances.get_mut(name).expect("just inserted");
                instance.child_id = Some(outcome.pid);
                instance.state = State::Running;
                instance.running_since = Some(now);
                info!("started service '{name}' (pid {})", outcome.pid);
                Ok(())
            }
            Err(e) => {
                let instance = self.instances.get_mut(name).expect("caller checked");
                instance.state = State::Failed;
                instance.attempts += 1;
                instance.next_attempt_at = now + backoff_delay(instance.attempts);
                warn!("failed to spawn service '{name}': {e}");
                Err(Error::SpawnFailed(name.clone(), e))
            }
        }
    }

    // --- Control interface hooks (spec.md §4.6) -------------------------

    pub fn request_start(&mut self, name: &ServiceName) -> Result<()> {
        let instance = self
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::UnknownService(name.clone()))?;
        instance.restart_suppressed = false;
        if instance.state == State::Failed {
            instance.attempts = 0;
        }
        if instance.is_startable_state() {
            instance.next_attempt_at = self.clock.now();
        }
        Ok(())
    }

    pub fn request_stop(&mut self, name: &ServiceName) -> Result<()> {
        let now = self.clock.now();
        let grace = self.stop_grace;
        let instance = self
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::UnknownService(name.clone()))?;
        instance.restart_suppressed = true;
        match instance.state {
            State::Starting | State::Running => {
                if let Some(pid) = instance.child_id {
                    let _ = signal(pid, Signal::TERM);
                }
                instance.state = State::Stopping;
                instance.kill_at = Some(now + grace);
            }
            State::WaitingDeps => {
                instance.state = State::Inactive;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn request_switch(&mut self, level: i64) -> Result<bool> {
        self.runlevel.request_switch(level)
    }

    /// Replaces the registry with a freshly parsed one (spec.md §4.6
    /// `Reload`): services absent from the new registry are stopped;
    /// services whose definition (command/dependencies/resources) changed
    /// are restarted; and so are their dependents, transitively, even when
    /// unchanged themselves — spec.md §8 scenario 4's documented policy.
    /// Unchanged services with no changed ancestor are left running.
    pub fn reload(&mut self, new_registry: Registry) -> Result<()> {
        // spec.md §4.6: `Stop`'s restart suppression lasts only "until the
        // next reload or runlevel change" — this is that reload, so every
        // instance surviving it is eligible to start again.
        for instance in self.instances.values_mut() {
            instance.restart_suppressed = false;
        }

        let mut to_restart: std::collections::BTreeSet<ServiceName> =
            std::collections::BTreeSet::new();
        for old_name in self.registry.names() {
            let changed_or_removed = match new_registry.get(old_name) {
                None => true,
                Some(new_svc) => self.registry.get(old_name) != Some(new_svc),
            };
            if changed_or_removed {
                to_restart.insert(old_name.clone());
            }
        }

        loop {
            let mut added = false;
            for svc in new_registry.iter() {
                if to_restart.contains(&svc.name) {
                    continue;
                }
                if svc.dependencies.iter().any(|d| to_restart.contains(d)) {
                    to_restart.insert(svc.name.clone());
                    added = true;
                }
            }
            if !added {
                break;
            }
        }

        for name in &to_restart {
            if self.instances.contains_key(name) {
                self.stop_for_reload(name);
            }
        }

        for name in new_registry.names() {
            self.instances.entry(name.clone()).or_insert_with(|| Instance {
                next_attempt_at: self.clock.now(),
                ..Instance::default()
            });
        }

        self.registry = new_registry;
        Ok(())
    }

    /// Like the stopping half of [`Self::request_stop`], but doesn't set
    /// `restart_suppressed` — the service is expected to come back once
    /// reconciliation sees it's still wanted in the current runlevel.
    fn stop_for_reload(&mut self, name: &ServiceName) {
        let now = self.clock.now();
        let grace = self.stop_grace;
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        match instance.state {
            State::Starting | State::Running => {
                if let Some(pid) = instance.child_id {
                    let _ = signal(pid, Signal::TERM);
                }
                instance.state = State::Stopping;
                instance.kill_at = Some(now + grace);
            }
            State::WaitingDeps => {
                instance.state = State::Inactive;
            }
            _ => {}
        }
    }

    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }
}
