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

//! Scheduler configuration

use crate::error::Error;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Isolation strategy of the worker pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Child processes created with `fork`
    #[default]
    Fork,
    /// Child processes started from a program image
    Spawn,
    /// Threads of the scheduler process
    Thread,
}

/// Program started by the spawn backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("herd")),
            args: vec!["worker".into()],
        }
    }
}

/// Handling of envelopes that found no recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequeueConfig {
    /// Upper bound of the queue, the oldest envelopes are dropped beyond it
    pub max_queued: usize,
    /// Age after which an undeliverable envelope is dropped
    pub ttl_ms: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            max_queued: 1024,
            ttl_ms: 30_000,
        }
    }
}

impl RequeueConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Configuration of one [Scheduler](crate::scheduler::Scheduler)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub service_name: String,
    pub start_processes: usize,
    pub max_processes: usize,
    pub min_spare_processes: usize,
    pub max_spare_processes: usize,
    /// Seconds an idle worker may live while more than `min_spare_processes` are idle
    pub process_idle_timeout: u64,
    /// Tasks after which a worker exits, 0 for no limit
    pub max_process_tasks: u64,
    /// Directory of the pid-lock file
    pub ipc_directory: PathBuf,
    /// Listen address of the IPC bus; port 0 picks an ephemeral port
    pub ipc_address: SocketAddr,
    pub backend: Backend,
    pub spawn: SpawnConfig,
    pub tick_interval_ms: u64,
    pub worker_tick_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub requeue: RequeueConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            service_name: "herd".into(),
            start_processes: 4,
            max_processes: 8,
            min_spare_processes: 2,
            max_spare_processes: 4,
            process_idle_timeout: 10,
            max_process_tasks: 0,
            ipc_directory: std::env::temp_dir(),
            ipc_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            backend: Backend::default(),
            spawn: SpawnConfig::default(),
            tick_interval_ms: 1000,
            worker_tick_ms: 100,
            shutdown_timeout_ms: 5000,
            requeue: RequeueConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load a JSON configuration, missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| Error::Io((e, "failed to read configuration")))?;
        let config: SchedulerConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject pool limits that no discipline could satisfy
    pub fn validate(&self) -> Result<(), Error> {
        if self.service_name.is_empty() {
            return Err(Error::Config("service_name must not be empty".into()));
        }
        if self.max_processes == 0 {
            return Err(Error::Config("max_processes must be at least 1".into()));
        }
        if self.start_processes > self.max_processes {
            return Err(Error::Config(format!(
                "start_processes ({}) exceeds max_processes ({})",
                self.start_processes, self.max_processes
            )));
        }
        if self.min_spare_processes > self.max_spare_processes {
            return Err(Error::Config(format!(
                "min_spare_processes ({}) exceeds max_spare_processes ({})",
                self.min_spare_processes, self.max_spare_processes
            )));
        }
        if self.min_spare_processes > self.max_processes {
            return Err(Error::Config(format!(
                "min_spare_processes ({}) exceeds max_processes ({})",
                self.min_spare_processes, self.max_processes
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.process_idle_timeout)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Location of the pid-lock file
    pub fn pid_file_path(&self) -> PathBuf {
        self.ipc_directory.join(format!("{}.pid", self.service_name))
    }
}
