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

//! Turns a declared [`Service`] into a running child process.
//!
//! The real implementation spawns in the service's own process group (so a
//! `SIGTERM` to the group can't reach the supervisor) and applies the
//! confinement envelope from inside the child's `pre_exec` hook, against the
//! child's own pid, reporting failures back through a dedicated pipe rather
//! than the parent's own file descriptors — the fix for the design flaw
//! spec.md §9 calls out in the source ("cgroup application in the child
//! after fork but referencing the parent's pipe fds").

use std::io::{self, Read};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use svinit_core::os::process::{self, Pid};

use crate::confinement::ConfinementApplier;
use crate::model::Service;

/// What happened when we tried to start a service.
pub struct SpawnOutcome {
    pub pid: Pid,
    /// `Some` when the confinement applier failed but the service started
    /// anyway (non-strict mode); the supervisor logs this as a WARNING.
    pub resource_warning: Option<io::Error>,
}

pub trait Spawner: Send + Sync {
    fn spawn(&self, service: &Service, strict_resources: bool) -> io::Result<SpawnOutcome>;
}

pub struct ProcessSpawner {
    pub confinement: Arc<dyn ConfinementApplier>,
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, service: &Service, strict_resources: bool) -> io::Result<SpawnOutcome> {
        let mut cmd = Command::new(service.program());
        cmd.args(service.args());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let resources = service.resources;
        let confinement = Arc::clone(&self.confinement);
        let name = service.name.0.clone();

        let (err_read, err_write) = make_cloexec_pipe()?;

        unsafe {
            cmd.pre_exec(move || {
                process::own_process_group()?;
                if let Some(resources) = resources {
                    if let Err(e) = confinement.apply(&name, std::process::id() as Pid, &resources)
                    {
                        report_resource_failure(err_write, &e);
                        if strict_resources {
                            return Err(e);
                        }
                    }
                }
                Ok(())
            });
        }

        let child = cmd.spawn();
        unsafe {
            libc::close(err_write);
        }

        let child = match child {
            Ok(c) => c,
            Err(e) => {
                unsafe {
                    libc::close(err_read);
                }
                return Err(e);
            }
        };
        let pid = child.id() as Pid;
        // We intentionally don't keep `std::process::Child` around: reaping
        // goes exclusively through the child table's pid-indexed `waitpid`,
        // per spec.md §4.2, so nothing else may independently wait() on it.
        std::mem::forget(child);

        let resource_warning = read_resource_failure(err_read);
        Ok(SpawnOutcome {
            pid,
            resource_warning,
        })
    }
}

fn make_cloexec_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Runs inside the forked child, before `exec`. Writes the raw errno as four
/// bytes — no formatting, no allocation, safe in a freshly-forked
/// single-threaded child.
fn report_resource_failure(err_write: RawFd, e: &io::Error) {
    let code = e.raw_os_error().unwrap_or(libc::EIO);
    let bytes = code.to_ne_bytes();
    unsafe {
        libc::write(err_write, bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}

/// Reads the resource-failure marker the child may have written, then
/// closes the pipe. The write end is closed (directly, or by `exec`
/// succeeding, since it's `O_CLOEXEC`) essentially immediately after
/// `pre_exec` returns, so a couple of non-blocking attempts are enough to
/// observe it without stalling the sequential start scheduler.
fn read_resource_failure(err_read: RawFd) -> Option<io::Error> {
    let mut file = unsafe { std::fs::File::from_raw_fd(err_read) };
    let mut buf = [0u8; 4];
    let mut total = 0;
    let mut result = None;
    for _ in 0..20 {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if total == buf.len() {
                    result = Some(io::Error::from_raw_os_error(i32::from_ne_bytes(buf)));
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_micros(500));
            }
            Err(_) => break,
        }
    }
    result
}

/// A non-forking spawner for the reconciliation-loop integration tests in
/// `tests/`: assigns each "spawn" a synthetic, strictly increasing pid so
/// scenarios can exercise dependency ordering, backoff, and runlevel
/// transitions without a real program to exec.
#[derive(Default)]
pub struct FakeSpawner {
    next_pid: AtomicI32,
    /// Names that should fail to "spawn" (simulating fork/exec failure) the
    /// next time they're attempted; consumed on use.
    fail_next: Mutex<std::collections::HashSet<String>>,
    pub spawned: Mutex<Vec<String>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        FakeSpawner {
            next_pid: AtomicI32::new(100),
            fail_next: Mutex::new(std::collections::HashSet::new()),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// The next spawn attempt for `name` will fail with `SpawnFailed`.
    pub fn fail_next_spawn_of(&self, name: &str) {
        self.fail_next.lock().unwrap().insert(name.to_string());
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, service: &Service, _strict_resources: bool) -> io::Result<SpawnOutcome> {
        if self.fail_next.lock().unwrap().remove(&service.name.0) {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated spawn failure"));
        }
        self.spawned.lock().unwrap().push(service.name.0.clone());
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(SpawnOutcome {
            pid,
            resource_warning: None,
        })
    }
}
