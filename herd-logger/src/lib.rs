/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Logger backend for herd processes.
//!
//! Records go to stderr, prefixed with the wall-clock time, the process id and the
//! kernel thread id. Forked and spawned workers inherit stderr from the scheduler, so
//! the prefix is what tells their output apart.

use herd_log::{LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod thread;

/// Initialize the global logger with `level`
///
/// Calling this more than once is harmless; only the first call installs the logger.
pub fn init(level: LevelFilter) {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let logger = Logger { level };
        if herd_log::set_boxed_logger(Box::new(logger)).is_ok() {
            herd_log::set_max_level(level);
        }
    });
}

struct Logger {
    level: LevelFilter,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let line = format!(
            "{}.{:03} {}/{} {:<5} {}: {}\n",
            now.as_secs(),
            now.subsec_millis(),
            std::process::id(),
            thread::current(),
            record.level(),
            record.target(),
            record.args()
        );

        // A single write keeps lines of concurrent workers from interleaving
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
