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

//! Low-level process and signal primitives.
//!
//! Mirrors the shape of a typical `core::os::process` module: a `Pid` alias,
//! a portable `Signal` enum independent of the raw platform signal numbers,
//! and thin wrappers around `kill`/`waitpid` that turn `-1` returns into
//! `Result`s instead of requiring callers to inspect `errno` themselves.

use std::io;
use std::ops::Neg;

use crate::error::{Error, Result};

pub type Pid = libc::pid_t;

#[allow(non_snake_case)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    HUP,
    INT,
    QUIT,
    KILL,
    TERM,
    CHLD,
    USR1,
    USR2,
}

impl From<Signal> for libc::c_int {
    fn from(sig: Signal) -> libc::c_int {
        match sig {
            Signal::HUP => libc::SIGHUP,
            Signal::INT => libc::SIGINT,
            Signal::QUIT => libc::SIGQUIT,
            Signal::KILL => libc::SIGKILL,
            Signal::TERM => libc::SIGTERM,
            Signal::CHLD => libc::SIGCHLD,
            Signal::USR1 => libc::SIGUSR1,
            Signal::USR2 => libc::SIGUSR2,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Signal::HUP => "HUP",
            Signal::INT => "INT",
            Signal::QUIT => "QUIT",
            Signal::KILL => "KILL",
            Signal::TERM => "TERM",
            Signal::CHLD => "CHLD",
            Signal::USR1 => "USR1",
            Signal::USR2 => "USR2",
        };
        write!(f, "{}", s)
    }
}

/// The outcome of reaping a single child.
#[derive(Debug, Clone, Copy)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
}

/// Send `sig` to `pid`. If `pid` is the root of its own process group (as
/// every service we spawn is, via [`own_process_group`]), the signal targets
/// the whole group so that grandchildren don't outlive the service entry.
pub fn signal(pid: Pid, sig: Signal) -> Result<()> {
    let target = pid_to_signal(pid);
    let rc = unsafe { libc::kill(target, sig.into()) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        // ESRCH means the process is already gone; that's not a failure
        // worth propagating to the reconciliation loop.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(Error::Signal(sig.into(), pid, err));
    }
    Ok(())
}

/// True if `pid` can still be signaled (not necessarily a child of ours —
/// used only for the supervisor's own liveness checks).
pub fn is_alive(pid: Pid) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

fn pid_to_signal(pid: Pid) -> Pid {
    let pgid = unsafe { libc::getpgid(pid) };
    if pid == pgid {
        pid.neg()
    } else {
        pid
    }
}

/// Arrange for the calling (post-fork, pre-exec) process to become the
/// leader of its own process group. Services are spawned this way so a
/// `SIGTERM` to the group root can't escape into the supervisor's own group.
///
/// # Safety
/// Must only be called between `fork` and `exec`, i.e. from a
/// `pre_exec` hook, where only async-signal-safe calls are permitted.
/// `setpgid(0, 0)` is async-signal-safe.
pub unsafe fn own_process_group() -> io::Result<()> {
    if libc::setpgid(0, 0) == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking reap of a single child: `WNOHANG`-based `waitpid(-1, ...)`.
/// Returns `Ok(None)` when no child has a pending status.
pub fn try_reap_any() -> Result<Option<(Pid, ExitKind)>> {
    let mut status: libc::c_int = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    match pid {
        0 => Ok(None),
        -1 => {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ECHILD) {
                // No children left to wait for at all; not an error condition
                // for a reaper that may be called speculatively.
                return Ok(None);
            }
            Err(Error::Wait(-1, err))
        }
        pid => Ok(Some((pid, decode_status(status)))),
    }
}

fn decode_status(status: libc::c_int) -> ExitKind {
    if libc::WIFSIGNALED(status) {
        ExitKind::Signaled(libc::WTERMSIG(status))
    } else {
        ExitKind::Exited(libc::WEXITSTATUS(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_display_matches_name() {
        assert_eq!(Signal::TERM.to_string(), "TERM");
        assert_eq!(Signal::CHLD.to_string(), "CHLD");
    }

    #[test]
    fn is_alive_true_for_self() {
        assert!(is_alive(std::process::id() as Pid));
    }

    #[test]
    fn is_alive_false_for_bogus_pid() {
        // A pid this large is never valid on a sane system.
        assert!(!is_alive(i32::MAX / 2));
    }

    #[test]
    fn decode_status_distinguishes_exit_and_signal() {
        // WIFEXITED(status) with exit code 7 is encoded as (7 << 8).
        match decode_status(7 << 8) {
            ExitKind::Exited(7) => (),
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
