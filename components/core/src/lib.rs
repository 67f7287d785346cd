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

//! OS primitives shared by the svinit supervisor.
//!
//! Everything here is deliberately ignorant of services, runlevels, or
//! configuration — it only knows about pids, signals, and process exit
//! status. The supervisor core in the `svinit` crate builds the actual
//! reconciliation logic on top of these primitives.

pub mod error;
pub mod os;

pub use error::{Error, Result};
