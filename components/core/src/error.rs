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

use thiserror::Error;

/// Errors surfaced by the OS primitives in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to wait on child {0}: {1}")]
    Wait(libc::pid_t, io::Error),

    #[error("failed to send signal {0} to pid {1}: {2}")]
    Signal(i32, libc::pid_t, io::Error),

    #[error("failed to install signal handler for {0}: {1}")]
    SignalHandler(i32, io::Error),

    #[error("self-pipe setup failed: {0}")]
    SelfPipe(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
