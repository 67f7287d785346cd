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

//! Log Sink (spec.md §2 item 2, §7): an append-only record stream that
//! rotates to `log.<unix_seconds>` once the active file crosses a size
//! threshold. Declared out of scope for the core's correctness properties,
//! but installed as the process's global `log::Log` backend ([`install`])
//! so every `info!`/`warn!`/`error!` call elsewhere in the crate ends up
//! here.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Default rotation threshold: 8 MiB, matching the order of magnitude the
/// source used for its fixed log buffer before rotating.
pub const DEFAULT_ROTATE_BYTES: u64 = 8 * 1024 * 1024;

pub struct LogSink {
    dir: PathBuf,
    active_path: PathBuf,
    file: File,
    written: u64,
    rotate_at: u64,
}

impl LogSink {
    pub fn open(dir: &Path, rotate_at: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let active_path = dir.join("log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        let written = file.metadata()?.len();
        Ok(LogSink {
            dir: dir.to_path_buf(),
            active_path,
            file,
            written,
            rotate_at,
        })
    }

    /// Appends one structured record. A write failure is retried exactly
    /// once and then swallowed (spec.md §7: "logging must never take down
    /// the supervisor").
    pub fn record(&mut self, level: Level, message: &str) {
        let line = format!("{} [{}] {}\n", unix_seconds(), level, message);
        if self.try_write(line.as_bytes()).is_err() {
            let _ = self.try_write(line.as_bytes());
        }
    }

    fn try_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.written + bytes.len() as u64 > self.rotate_at {
            self.rotate()?;
        }
        self.file.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        let rotated = self.dir.join(format!("log.{}", unix_seconds()));
        fs::rename(&self.active_path, &rotated)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active_path)?;
        self.written = 0;
        Ok(())
    }
}

/// Installs a [`LogSink`]-backed `log::Log` as the global logger, mirroring
/// every record to stderr as well so an operator running the supervisor in
/// the foreground still sees it the way `env_logger` would show it — the
/// rotated on-disk file is the only *persisted* artifact (spec.md §6), but
/// nothing says the console has to go dark to get it.
pub fn install(dir: &Path, rotate_at: u64, filter: LevelFilter) -> io::Result<()> {
    let sink = LogSink::open(dir, rotate_at)?;
    let logger = SinkLogger {
        sink: Mutex::new(sink),
    };
    log::set_max_level(filter);
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(())
}

struct SinkLogger {
    sink: Mutex<LogSink>,
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("{}", record.args());
        eprintln!("{} [{}] {}", unix_seconds(), record.level(), message);
        if let Ok(mut sink) = self.sink.lock() {
            sink.record(record.level(), &message);
        }
    }

    fn flush(&self) {}
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_and_rotates_past_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = LogSink::open(tmp.path(), 16).unwrap();
        sink.record(Level::Info, "short");
        assert!(fs::read_to_string(tmp.path().join("log")).unwrap().len() <= 16);

        sink.record(Level::Info, "this one pushes past the threshold");
        let rotated: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("log."))
            .collect();
        assert_eq!(rotated.len(), 1);
    }

    #[test]
    fn open_reuses_existing_file_length() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut sink = LogSink::open(tmp.path(), DEFAULT_ROTATE_BYTES).unwrap();
            sink.record(Level::Info, "first");
        }
        let sink = LogSink::open(tmp.path(), DEFAULT_ROTATE_BYTES).unwrap();
        assert!(sink.written > 0);
    }
}
