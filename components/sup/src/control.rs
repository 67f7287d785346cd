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

//! Control Interface (spec.md §4.6): a JSON-lines protocol over a Unix
//! domain socket through which `start`/`stop`/`status`/`switch`/`reload`
//! requests reach the Supervisor Core.
//!
//! Grounded in `sup/src/http_gateway.rs`'s request/response split, but
//! swapped for a socket because the spec treats this as "an abstract,
//! serialized request stream" rather than committing to HTTP.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::{ExitCause, ServiceName, State};
use crate::reconcile::Supervisor;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Start { name: String },
    Stop { name: String },
    Status { name: String },
    Switch { level: i64 },
    Reload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: String,
    pub child_id: Option<i32>,
    pub last_exit: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Status(StatusReport),
    Error { message: String },
}

/// Listens on a Unix socket and hands each accepted connection's requests,
/// one line at a time, to `handle`. Requests are read and dispatched
/// strictly in the order they're accepted and lines are read within a
/// connection, satisfying the FIFO processing guarantee (spec.md §4.6, §5
/// "Control requests are processed in FIFO order").
pub struct ControlListener {
    listener: UnixListener,
}

impl ControlListener {
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(ControlListener { listener })
    }

    /// Accepts and fully services any connections currently pending,
    /// without blocking the reconciliation loop. Returns the number of
    /// requests handled.
    pub fn poll(
        &self,
        sup: &mut Supervisor,
        reload_config: impl Fn() -> crate::error::Result<crate::config::Registry>,
    ) -> usize {
        let mut handled = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    handled += service_connection(stream, sup, &reload_config);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        handled
    }
}

fn service_connection(
    stream: UnixStream,
    sup: &mut Supervisor,
    reload_config: &impl Fn() -> crate::error::Result<crate::config::Registry>,
) -> usize {
    let mut count = 0;
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(_) => return 0,
    };
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(req) => dispatch(req, sup, reload_config),
            Err(e) => ControlResponse::Error {
                message: format!("malformed request: {e}"),
            },
        };
        count += 1;
        if let Ok(mut out) = serde_json::to_vec(&response) {
            out.push(b'\n');
            let _ = writer.write_all(&out);
        }
    }
    count
}

fn dispatch(
    req: ControlRequest,
    sup: &mut Supervisor,
    reload_config: &impl Fn() -> crate::error::Result<crate::config::Registry>,
) -> ControlResponse {
    if sup.is_shutting_down() {
        return ControlResponse::Error {
            message: "supervisor is shutting down".to_string(),
        };
    }

    let result = match req {
        ControlRequest::Start { name } => sup.request_start(&ServiceName::from(name.as_str())),
        ControlRequest::Stop { name } => sup.request_stop(&ServiceName::from(name.as_str())),
        ControlRequest::Status { name } => {
            return status_response(sup, &ServiceName::from(name.as_str()))
        }
        ControlRequest::Switch { level } => sup.request_switch(level).map(|_| ()),
        ControlRequest::Reload => reload_config().and_then(|reg| sup.reload(reg)),
    };

    match result {
        Ok(()) => ControlResponse::Ok,
        Err(e) => ControlResponse::Error {
            message: e.to_string(),
        },
    }
}

fn status_response(sup: &Supervisor, name: &ServiceName) -> ControlResponse {
    match sup.instance(name) {
        None => ControlResponse::Error {
            message: Error::UnknownService(name.clone()).to_string(),
        },
        Some(instance) => ControlResponse::Status(StatusReport {
            state: state_label(instance.state),
            child_id: instance.child_id,
            last_exit: instance.last_exit.as_ref().map(|e| exit_cause_label(e.cause)),
            attempts: instance.attempts,
        }),
    }
}

fn state_label(state: State) -> String {
    state.to_string()
}

fn exit_cause_label(cause: ExitCause) -> String {
    match cause {
        ExitCause::Exited(code) => format!("exited({code})"),
        ExitCause::Signaled(sig) => format!("signaled({sig})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_round_trips_through_json() {
        let req = ControlRequest::Start {
            name: "web".to_string(),
        };
        let line = serde_json::to_string(&req).unwrap();
        let back: ControlRequest = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, ControlRequest::Start { name } if name == "web"));
    }

    #[test]
    fn switch_request_round_trips_through_json() {
        let req = ControlRequest::Switch { level: 2 };
        let line = serde_json::to_string(&req).unwrap();
        let back: ControlRequest = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, ControlRequest::Switch { level: 2 }));
    }

    #[test]
    fn malformed_json_does_not_panic() {
        let parsed = serde_json::from_str::<ControlRequest>("not json");
        assert!(parsed.is_err());
    }
}
