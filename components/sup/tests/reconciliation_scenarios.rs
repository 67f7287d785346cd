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

//! Integration tests for the six concrete scenarios in spec.md §8, driven
//! against a [`FakeClock`], [`FakeSpawner`], and [`FakeReaper`] so dependency
//! ordering, backoff timing, and runlevel transitions are exercised without
//! forking real processes.

use std::sync::Arc;
use std::time::Duration;

use svinit::child_table::{FakeReaper, Reaper};
use svinit::clock::{Clock, FakeClock};
use svinit::config;
use svinit::model::{ServiceName, State};
use svinit::reconcile::Supervisor;
use svinit::spawn::{FakeSpawner, Spawner};

use svinit_core::os::process::ExitKind;

const MAX_RUNLEVELS: u32 = 8;

struct Harness {
    sup: Supervisor,
    clock: Arc<FakeClock>,
    spawner: Arc<FakeSpawner>,
    reaper: Arc<FakeReaper>,
}

fn harness(conf: &str, runlevel: u32) -> Harness {
    let registry = config::parse(conf, std::path::Path::new("test.conf")).unwrap();
    let clock = Arc::new(FakeClock::new());
    let spawner = Arc::new(FakeSpawner::new());
    let reaper = Arc::new(FakeReaper::new());
    let sup = Supervisor::new(
        registry,
        runlevel,
        MAX_RUNLEVELS,
        Arc::clone(&spawner) as Arc<dyn Spawner>,
        Arc::clone(&reaper) as Arc<dyn Reaper>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    Harness {
        sup,
        clock,
        spawner,
        reaper,
    }
}

fn pid_of(sup: &Supervisor, name: &str) -> i32 {
    sup.instance(&ServiceName::from(name))
        .and_then(|i| i.child_id)
        .expect("service should have a pid")
}

// Scenario 1: {A in {1}, B in {1} deps=A, C in {2}}, boot at runlevel 1.
#[test]
fn scenario_1_start_order_is_a_then_b_and_c_stays_inactive() {
    let mut h = harness("1 A /bin/a\n1 B /bin/b deps=A\n2 C /bin/c\n", 1);
    h.sup.tick().unwrap();

    assert_eq!(*h.spawner.spawned.lock().unwrap(), vec!["A", "B"]);
    assert_eq!(
        h.sup.instance(&ServiceName::from("A")).unwrap().state,
        State::Running
    );
    assert_eq!(
        h.sup.instance(&ServiceName::from("B")).unwrap().state,
        State::Running
    );
    assert_eq!(
        h.sup.instance(&ServiceName::from("C")).unwrap().state,
        State::Inactive
    );
}

// Scenario 2: B crashes 3 times with base=1s; deltas are 1s, 2s, 4s; on the
// 4th successful run, 30s of uptime resets attempts to 0.
#[test]
fn scenario_2_backoff_deltas_and_success_window_reset() {
    let mut h = harness("1 B /bin/b\n", 1);
    h.sup.tick().unwrap(); // B starts, attempts == 0

    let mut expected_deltas = vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
    ];

    for expected in expected_deltas.drain(..) {
        let pid = pid_of(&h.sup, "B");
        h.reaper.push_exit(pid, ExitKind::Signaled(9));
        h.sup.tick().unwrap(); // reaps the crash, computes next_attempt_at

        let inst = h.sup.instance(&ServiceName::from("B")).unwrap();
        let crash_at = inst.last_exit.unwrap().at;
        assert_eq!(inst.next_attempt_at - crash_at, expected);

        // Advance the clock to the gate and let it restart.
        h.clock.advance(expected);
        h.sup.tick().unwrap();
        assert_eq!(
            h.sup.instance(&ServiceName::from("B")).unwrap().state,
            State::Running
        );
    }

    assert_eq!(h.sup.instance(&ServiceName::from("B")).unwrap().attempts, 3);

    // Stay up for the full success window; attempts resets to 0.
    h.clock.advance(Duration::from_secs(30));
    h.sup.tick().unwrap();
    assert_eq!(h.sup.instance(&ServiceName::from("B")).unwrap().attempts, 0);
}

// Scenario 3: Switch(2) from the scenario-1 state stops B then A (reverse
// deps) before C starts; C and A are never running at the same time.
#[test]
fn scenario_3_switch_stops_in_reverse_dep_order_then_starts_new_level() {
    let mut h = harness("1 A /bin/a\n1 B /bin/b deps=A\n2 C /bin/c\n", 1);
    h.sup.tick().unwrap();

    assert!(h.sup.request_switch(2).unwrap());
    h.sup.tick().unwrap(); // issues stops for B and A, reverse dep order

    assert_eq!(
        h.sup.instance(&ServiceName::from("B")).unwrap().state,
        State::Stopping
    );
    assert_eq!(
        h.sup.instance(&ServiceName::from("A")).unwrap().state,
        State::Stopping
    );
    // C must not have started while A was still up.
    assert_eq!(
        h.sup.instance(&ServiceName::from("C")).unwrap().state,
        State::Inactive
    );
    assert!(!h.spawner.spawned.lock().unwrap().contains(&"C".to_string()));

    let pid_b = pid_of(&h.sup, "B");
    let pid_a = pid_of(&h.sup, "A");
    h.reaper.push_exit(pid_b, ExitKind::Exited(0));
    h.reaper.push_exit(pid_a, ExitKind::Exited(0));
    h.sup.tick().unwrap(); // reaps both, settles the transition, starts C

    assert_eq!(
        h.sup.instance(&ServiceName::from("A")).unwrap().state,
        State::Stopped
    );
    assert_eq!(
        h.sup.instance(&ServiceName::from("B")).unwrap().state,
        State::Stopped
    );
    assert_eq!(
        h.sup.instance(&ServiceName::from("C")).unwrap().state,
        State::Running
    );
    assert_eq!(h.sup.runlevel().target_level(), 2);
}

// Scenario 4: reload after changing A's command restarts A; B (unchanged)
// is also restarted because its dependency restarted.
#[test]
fn scenario_4_reload_restarts_changed_service_and_its_dependents() {
    let mut h = harness("1 A /bin/a\n1 B /bin/b deps=A\n", 1);
    h.sup.tick().unwrap();
    let old_pid_a = pid_of(&h.sup, "A");
    let old_pid_b = pid_of(&h.sup, "B");

    let new_registry = config::parse(
        "1 A /bin/a --changed\n1 B /bin/b deps=A\n",
        std::path::Path::new("test.conf"),
    )
    .unwrap();
    h.sup.reload(new_registry).unwrap();

    assert_eq!(
        h.sup.instance(&ServiceName::from("A")).unwrap().state,
        State::Stopping
    );
    assert_eq!(
        h.sup.instance(&ServiceName::from("B")).unwrap().state,
        State::Stopping
    );

    h.reaper.push_exit(old_pid_a, ExitKind::Exited(0));
    h.reaper.push_exit(old_pid_b, ExitKind::Exited(0));
    h.sup.tick().unwrap(); // both reach Stopped
    h.sup.tick().unwrap(); // both restart under the new registry

    assert_eq!(
        h.sup.instance(&ServiceName::from("A")).unwrap().state,
        State::Running
    );
    assert_eq!(
        h.sup.instance(&ServiceName::from("B")).unwrap().state,
        State::Running
    );
    let spawned = h.spawner.spawned.lock().unwrap();
    assert_eq!(spawned.iter().filter(|n| *n == "A").count(), 2);
    assert_eq!(spawned.iter().filter(|n| *n == "B").count(), 2);
    assert_eq!(
        h.sup.registry().get(&ServiceName::from("A")).unwrap().command,
        vec!["/bin/a".to_string(), "--changed".to_string()]
    );
}

// Scenario 5: 50 children exit simultaneously; all are reaped and credited,
// and only the ones whose runlevels contain the current level are
// rescheduled.
#[test]
fn scenario_5_signal_storm_reaps_and_reschedules_only_current_level() {
    let mut conf = String::new();
    for i in 0..50 {
        conf.push_str(&format!("1 svc{i} /bin/svc{i}\n"));
    }
    // A handful of level-2 services that must stay untouched throughout.
    for i in 0..5 {
        conf.push_str(&format!("2 other{i} /bin/other{i}\n"));
    }

    let mut h = harness(&conf, 1);
    h.sup.tick().unwrap();
    assert_eq!(h.spawner.spawned.lock().unwrap().len(), 50);

    let mut pids = Vec::new();
    for i in 0..50 {
        pids.push(pid_of(&h.sup, &format!("svc{i}")));
    }
    for pid in &pids {
        h.reaper.push_exit(*pid, ExitKind::Signaled(9));
    }

    h.sup.tick().unwrap(); // one tick must drain every pending exit

    for i in 0..50 {
        let inst = h.sup.instance(&ServiceName::from(format!("svc{i}").as_str())).unwrap();
        assert_eq!(inst.state, State::Failed);
        assert!(inst.last_exit.is_some());
        assert_eq!(inst.attempts, 1);
    }
    for i in 0..5 {
        let inst = h
            .sup
            .instance(&ServiceName::from(format!("other{i}").as_str()))
            .unwrap();
        assert_eq!(inst.state, State::Inactive);
    }

    // Past backoff, every crashed level-1 service is rescheduled.
    h.clock.advance(Duration::from_secs(1));
    h.sup.tick().unwrap();
    for i in 0..50 {
        let inst = h.sup.instance(&ServiceName::from(format!("svc{i}").as_str())).unwrap();
        assert_eq!(inst.state, State::Running);
    }
}

// Scenario 6: Switch(-1) / Switch(MAX_RUNLEVELS) are rejected without
// disturbing state.
#[test]
fn scenario_6_invalid_switch_is_rejected_and_state_is_untouched() {
    let mut h = harness("1 A /bin/a\n", 1);
    h.sup.tick().unwrap();

    assert!(h.sup.request_switch(-1).is_err());
    assert!(h.sup.request_switch(MAX_RUNLEVELS as i64).is_err());
    assert_eq!(h.sup.runlevel().target_level(), 1);
    assert!(!h.sup.runlevel().is_transitioning());
    assert_eq!(
        h.sup.instance(&ServiceName::from("A")).unwrap().state,
        State::Running
    );
}
