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

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::ServiceName;

/// The error taxonomy from spec.md §7.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration at {path}:{line}: {reason}")]
    ConfigInvalid {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("failed to spawn service '{0}': {1}")]
    SpawnFailed(ServiceName, io::Error),

    #[error("failed to apply resource limits for '{0}': {1}")]
    ResourceApplyFailed(ServiceName, io::Error),

    #[error("unknown service '{0}'")]
    UnknownService(ServiceName),

    #[error("invalid runlevel {0}")]
    InvalidRunlevel(i64),

    #[error("control protocol error: {0}")]
    ControlProtocolError(String),

    #[error("transient error, retryable within backoff: {0}")]
    Transient(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Core(#[from] svinit_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
