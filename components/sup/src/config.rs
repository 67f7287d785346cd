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

//! Service Registry: parses the line-oriented configuration grammar from
//! spec.md §6 into a [`Registry`], and computes dependency-ordered start
//! lists for a runlevel (spec.md §4.1).
//!
//! The grammar is frozen to the keyword-tagged form; the ambiguous
//! positional `sscanf`-style grammar the original C sources evolved through
//! (`original_source/init_main_v3.c`) is never accepted, per the Open
//! Question resolution in SPEC_FULL.md §9.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::model::{Resources, Service, ServiceName};

#[derive(Debug, Default, Clone)]
pub struct Registry {
    services: BTreeMap<ServiceName, Service>,
}

impl Registry {
    pub fn get(&self, name: &ServiceName) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &ServiceName> {
        self.services.keys()
    }

    /// All services whose `runlevels` contains `level`, topologically
    /// sorted by dependency (dependencies before dependents), ties broken
    /// by stable name order (spec.md §4.1, §4.3 "tie-break").
    pub fn services_for(&self, level: u32) -> Result<Vec<ServiceName>> {
        let wanted: BTreeSet<&ServiceName> = self
            .services
            .values()
            .filter(|s| s.runlevels.contains(&level))
            .map(|s| &s.name)
            .collect();
        self.topo_sort(wanted.into_iter().cloned().collect())
    }

    /// Topologically sorts an arbitrary subset of registered names, e.g. the
    /// set of instances a runlevel transition must stop — which, unlike
    /// [`Self::services_for`], isn't itself a single runlevel's membership.
    pub fn topo_order(&self, subset: &BTreeSet<ServiceName>) -> Result<Vec<ServiceName>> {
        self.topo_sort(subset.iter().cloned().collect())
    }

    /// Kahn's algorithm restricted to `subset`; dependencies outside the
    /// subset are treated as already-satisfied (they belong to a different
    /// runlevel and are not part of this ordering problem).
    fn topo_sort(&self, subset: Vec<ServiceName>) -> Result<Vec<ServiceName>> {
        let subset_set: HashSet<&ServiceName> = subset.iter().collect();
        let mut indegree: BTreeMap<ServiceName, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<ServiceName, Vec<ServiceName>> = BTreeMap::new();

        for name in &subset {
            indegree.entry(name.clone()).or_insert(0);
        }

        for name in &subset {
            let svc = self.services.get(name).expect("subset drawn from registry");
            let mut seen = HashSet::new();
            for dep in &svc.dependencies {
                if !subset_set.contains(dep) || !seen.insert(dep.clone()) {
                    continue;
                }
                *indegree.get_mut(name).unwrap() += 1;
                dependents.entry(dep.clone()).or_default().push(name.clone());
            }
        }

        let mut ready: VecDeque<ServiceName> = indegree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(n, _)| n.clone())
            .collect();
        // Stable name order among ties: BTreeMap iteration is already sorted.
        let mut ordered = Vec::with_capacity(subset.len());

        while let Some(name) = ready.pop_front() {
            ordered.push(name.clone());
            if let Some(deps) = dependents.get(&name) {
                let mut newly_ready = Vec::new();
                for dependent in deps {
                    let deg = indegree.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        newly_ready.push(dependent.clone());
                    }
                }
                newly_ready.sort();
                for n in newly_ready {
                    // Keep overall stable-name tie-break: insert in sorted
                    // position rather than always at the back.
                    let pos = ready.iter().position(|r| r > &n).unwrap_or(ready.len());
                    ready.insert(pos, n);
                }
            }
        }

        if ordered.len() != subset.len() {
            return Err(Error::ConfigInvalid {
                path: PathBuf::new(),
                line: 0,
                reason: "dependency cycle detected among services for this runlevel".to_string(),
            });
        }
        Ok(ordered)
    }
}

/// Parse a configuration source (already read into memory) into a
/// [`Registry`]. Pure: no I/O, no side effects (spec.md §4.1 contract).
pub fn parse(source: &str, path: &Path) -> Result<Registry> {
    let mut services = BTreeMap::new();

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let svc = parse_line(line, path, line_no)?;
        match services.get_mut(&svc.name) {
            None => {
                services.insert(svc.name.clone(), svc);
            }
            Some(existing) => {
                // A service may legitimately appear on more than one line to
                // declare membership in more than one runlevel (spec.md §9:
                // "runlevels" is a set). Anything else differing between the
                // two declarations is a genuine duplicate, not a multi-level
                // declaration, and fails the load.
                let same_definition = existing.command == svc.command
                    && existing.dependencies == svc.dependencies
                    && existing.resources == svc.resources;
                if !same_definition {
                    return Err(Error::ConfigInvalid {
                        path: path.to_path_buf(),
                        line: line_no,
                        reason: format!(
                            "duplicate service name '{}' with conflicting definition",
                            svc.name
                        ),
                    });
                }
                existing.runlevels.extend(svc.runlevels.iter().copied());
            }
        }
    }

    // Unknown dependency names fail the whole load before any service
    // starts (spec.md §4.1).
    for svc in services.values() {
        for dep in &svc.dependencies {
            if !services.contains_key(dep) {
                return Err(Error::ConfigInvalid {
                    path: path.to_path_buf(),
                    line: 0,
                    reason: format!("service '{}' depends on unknown service '{}'", svc.name, dep),
                });
            }
        }
    }

    let registry = Registry { services };

    // Cycle detection across every runlevel the registry declares, so a
    // `ConfigInvalid` is raised at load time rather than only discovered on
    // the first reconciliation pass that touches the offending runlevel.
    let mut levels = BTreeSet::new();
    for svc in registry.services.values() {
        levels.extend(svc.runlevels.iter().copied());
    }
    for level in levels {
        registry.services_for(level).map_err(|e| match e {
            Error::ConfigInvalid { reason, .. } => Error::ConfigInvalid {
                path: path.to_path_buf(),
                line: 0,
                reason,
            },
            other => other,
        })?;
    }

    Ok(registry)
}

pub fn load(path: &Path) -> Result<Registry> {
    let source = std::fs::read_to_string(path).map_err(|e| Error::ConfigInvalid {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("could not read configuration file: {e}"),
    })?;
    parse(&source, path)
}

fn parse_line(line: &str, path: &Path, line_no: usize) -> Result<Service> {
    let tokens = tokenize(line);
    let invalid = |reason: String| Error::ConfigInvalid {
        path: path.to_path_buf(),
        line: line_no,
        reason,
    };

    if tokens.len() < 3 {
        return Err(invalid(
            "expected '<runlevel> <name> <command> [deps=..] [mem=..] [cpu=..]'".to_string(),
        ));
    }

    let runlevel: u32 = tokens[0]
        .parse()
        .map_err(|_| invalid(format!("'{}' is not a valid runlevel integer", tokens[0])))?;

    let name_token = &tokens[1];
    if name_token.is_empty()
        || !name_token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid(format!(
            "'{name_token}' is not a valid service name (expected [A-Za-z0-9_-]+)"
        )));
    }
    let name = ServiceName(name_token.clone());

    let command = tokenize(&tokens[2]);
    if command.is_empty() {
        return Err(invalid("command must not be empty".to_string()));
    }

    let mut dependencies = Vec::new();
    let mut resources: Option<Resources> = None;
    let mut memory_bytes: Option<u64> = None;
    let mut cpu_percent: Option<u8> = None;

    for tok in &tokens[3..] {
        let (key, value) = tok.split_once('=').ok_or_else(|| {
            invalid(format!(
                "'{tok}' is not a recognized keyword field (expected key=value)"
            ))
        })?;
        match key {
            "deps" => {
                if !value.is_empty() {
                    dependencies.extend(value.split(',').map(ServiceName::from));
                }
            }
            "mem" => {
                memory_bytes = Some(
                    value
                        .parse()
                        .map_err(|_| invalid(format!("'{value}' is not a valid mem= byte count")))?,
                );
            }
            "cpu" => {
                cpu_percent = Some(
                    value
                        .parse()
                        .map_err(|_| invalid(format!("'{value}' is not a valid cpu= percentage")))?,
                );
            }
            other => {
                return Err(invalid(format!("unknown keyword field '{other}='")));
            }
        }
    }

    if memory_bytes.is_some() || cpu_percent.is_some() {
        resources = Some(Resources {
            memory_bytes: memory_bytes.unwrap_or(0),
            cpu_percent: cpu_percent.unwrap_or(100),
        });
    }

    Ok(Service {
        name,
        command,
        runlevels: BTreeSet::from([runlevel]),
        dependencies,
        resources,
        restart_policy: Default::default(),
    })
}

/// Split a line on whitespace, honoring single/double quoted fields so a
/// `command` can contain spaces. Unlike the `strtok`-on-`strdup` pattern in
/// the source this replaces, the scratch state lives entirely in this
/// function's locals and is dropped when it returns.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => {
                quote = None;
            }
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(src: &str) -> Result<Registry> {
        parse(src, Path::new("test.conf"))
    }

    #[test]
    fn scenario_one_start_order() {
        // spec.md §8 scenario 1.
        let reg = p(
            "1 A /bin/a\n\
             1 B /bin/b deps=A\n\
             2 C /bin/c\n",
        )
        .unwrap();
        let order = reg.services_for(1).unwrap();
        assert_eq!(order, vec![ServiceName::from("A"), ServiceName::from("B")]);
        assert!(reg.get(&ServiceName::from("C")).unwrap().runlevels.contains(&2));
    }

    #[test]
    fn duplicate_name_is_config_invalid() {
        let err = p("1 A /bin/a\n1 A /bin/b\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn unknown_dependency_is_config_invalid() {
        let err = p("1 A /bin/a deps=ghost\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn dependency_cycle_is_config_invalid() {
        let err = p("1 A /bin/a deps=B\n1 B /bin/b deps=A\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let reg = p("# comment\n\n1 A /bin/a\n").unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn quoted_command_can_contain_spaces_and_args() {
        let reg = p("1 A \"/bin/sh -c 'echo hi'\"\n").unwrap();
        let svc = reg.get(&ServiceName::from("A")).unwrap();
        assert_eq!(svc.program(), "/bin/sh");
        assert_eq!(svc.args(), &["-c", "echo hi"]);
    }

    #[test]
    fn mem_and_cpu_fields_populate_resources() {
        let reg = p("1 A /bin/a mem=1048576 cpu=50\n").unwrap();
        let svc = reg.get(&ServiceName::from("A")).unwrap();
        let res = svc.resources.unwrap();
        assert_eq!(res.memory_bytes, 1_048_576);
        assert_eq!(res.cpu_percent, 50);
    }

    #[test]
    fn rejects_legacy_positional_five_field_line() {
        // This is the original source's ambiguous grammar
        // (runlevel command deps mem cpu, all via %[^\n]); it must never
        // be silently accepted.
        let err = p("1 /bin/a some,deps 1024 50\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn unknown_keyword_field_is_rejected() {
        let err = p("1 A /bin/a nice=10\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn service_in_multiple_runlevels_is_a_set() {
        let reg = p("1 A /bin/a\n2 A /bin/a\n").unwrap();
        let svc = reg.get(&ServiceName::from("A")).unwrap();
        assert!(svc.runlevels.contains(&1) && svc.runlevels.contains(&2));
    }

    #[test]
    fn conflicting_redeclaration_is_config_invalid() {
        let err = p("1 A /bin/a\n2 A /bin/different\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }
}
