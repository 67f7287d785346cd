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

//! Confinement Applier (spec.md §2, §4.3, §5): installs a resource envelope
//! on a child before its program image is loaded.
//!
//! Grounded in the design note in spec.md §9: the source applied cgroup
//! limits in the child after `fork` but referenced the parent's pipe fds;
//! here the applier runs from the `pre_exec` hook against the child's own
//! pid, and [`crate::spawn`] reports failures back to the parent through a
//! dedicated close-on-exec pipe rather than letting the child touch
//! anything belonging to the parent.

use std::fs;
use std::io;
use std::path::PathBuf;

use svinit_core::os::process::Pid;

use crate::model::Resources;

/// Abstraction over "install this resource envelope for this pid". The
/// default implementation manipulates cgroup v2 control files; tests use a
/// no-op implementation so they don't depend on a real cgroup filesystem.
pub trait ConfinementApplier: Send + Sync {
    fn apply(&self, service: &str, pid: Pid, resources: &Resources) -> io::Result<()>;
}

/// Writes `memory.max`, `cpu.max`, and `cgroup.procs` under
/// `<root>/<service>/` for a cgroup v2 hierarchy.
pub struct CgroupApplier {
    pub root: PathBuf,
}

impl Default for CgroupApplier {
    fn default() -> Self {
        CgroupApplier {
            root: PathBuf::from("/sys/fs/cgroup/svinit"),
        }
    }
}

impl ConfinementApplier for CgroupApplier {
    fn apply(&self, service: &str, pid: Pid, resources: &Resources) -> io::Result<()> {
        let dir = self.root.join(service);
        fs::create_dir_all(&dir)?;

        fs::write(dir.join("memory.max"), resources.memory_bytes.to_string())?;

        // cpu.max is "<quota> <period>" in microseconds; period fixed at
        // 100ms, quota scaled by the requested percentage.
        let period_us: u64 = 100_000;
        let quota_us = period_us * resources.cpu_percent.min(100) as u64 / 100;
        fs::write(dir.join("cpu.max"), format!("{quota_us} {period_us}"))?;

        fs::write(dir.join("cgroup.procs"), pid.to_string())?;
        Ok(())
    }
}

/// Applies nothing; used when the platform has no cgroup filesystem, or in
/// tests that don't want to touch the real one.
#[derive(Default)]
pub struct NullApplier;

impl ConfinementApplier for NullApplier {
    fn apply(&self, _service: &str, _pid: Pid, _resources: &Resources) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_applier_writes_expected_files() {
        let tmp = tempfile::tempdir().unwrap();
        let applier = CgroupApplier {
            root: tmp.path().to_path_buf(),
        };
        let resources = Resources {
            memory_bytes: 16 * 1024 * 1024,
            cpu_percent: 25,
        };
        applier.apply("web", 4242, &resources).unwrap();

        let dir = tmp.path().join("web");
        assert_eq!(
            fs::read_to_string(dir.join("memory.max")).unwrap(),
            (16 * 1024 * 1024).to_string()
        );
        assert_eq!(fs::read_to_string(dir.join("cpu.max")).unwrap(), "25000 100000");
        assert_eq!(fs::read_to_string(dir.join("cgroup.procs")).unwrap(), "4242");
    }

    #[test]
    fn null_applier_always_succeeds() {
        let resources = Resources {
            memory_bytes: 0,
            cpu_percent: 0,
        };
        assert!(NullApplier.apply("x", 1, &resources).is_ok());
    }
}
