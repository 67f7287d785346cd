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

//! `svinit`: a minimalist process supervisor in the lineage of classical
//! `init` — dependency-ordered service startup, crash-restart with
//! backoff, runlevel transitions, and an external control channel, built
//! around a single-threaded reconciliation loop.

pub mod clock;
pub mod child_table;
pub mod confinement;
pub mod config;
pub mod control;
pub mod error;
pub mod log_sink;
pub mod model;
pub mod reconcile;
pub mod runlevel;
pub mod spawn;

pub use error::{Error, Result};
pub use reconcile::Supervisor;
