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

//! What a backend needs to bring a worker to life

use crate::error::Error;
use crate::ids::WorkerId;
use crate::os_signals::SignalTriggeredFlagRef;
use alloc::sync::Arc;
use core::fmt;
use core::time::Duration;
use std::net::SocketAddr;

/// Environment variables handing [WorkerSettings] to spawned workers
pub const ENV_IPC_ADDR: &str = "HERD_IPC_ADDR";
pub const ENV_SERVICE: &str = "HERD_SERVICE";
pub const ENV_MAX_TASKS: &str = "HERD_MAX_TASKS";
pub const ENV_WORKER_TICK_MS: &str = "HERD_WORKER_TICK_MS";

/// Parameters of one worker, independent of its isolation level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub service_name: String,
    pub ipc_address: SocketAddr,
    /// Tasks after which the worker exits, 0 for no limit
    pub max_tasks: u64,
    /// Upper bound of one IPC receive
    pub worker_tick: Duration,
}

impl WorkerSettings {
    /// Settings handed over by the spawn backend
    pub fn from_env() -> Result<Self, Error> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Settings from a variable lookup, see [WorkerSettings::to_env]
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let var = |name: &str| lookup(name).ok_or_else(|| Error::Config(format!("{name} is not set")));
        let invalid = |name: &str| Error::Config(format!("{name} is malformed"));

        Ok(Self {
            service_name: var(ENV_SERVICE)?,
            ipc_address: var(ENV_IPC_ADDR)?.parse().map_err(|_| invalid(ENV_IPC_ADDR))?,
            max_tasks: match lookup(ENV_MAX_TASKS) {
                Some(value) => value.parse().map_err(|_| invalid(ENV_MAX_TASKS))?,
                None => 0,
            },
            worker_tick: match lookup(ENV_WORKER_TICK_MS) {
                Some(value) => Duration::from_millis(value.parse().map_err(|_| invalid(ENV_WORKER_TICK_MS))?),
                None => Duration::from_millis(100),
            },
        })
    }

    /// Settings as environment variables of a spawned worker
    pub fn to_env(&self) -> [(&'static str, String); 4] {
        [
            (ENV_IPC_ADDR, self.ipc_address.to_string()),
            (ENV_SERVICE, self.service_name.clone()),
            (ENV_MAX_TASKS, self.max_tasks.to_string()),
            (ENV_WORKER_TICK_MS, self.worker_tick.as_millis().to_string()),
        ]
    }
}

/// Body of a worker, returning its exit code
///
/// Fork and thread workers run it directly; the flag is raised when the worker is asked
/// to stop.
pub type WorkerEntry = Arc<dyn Fn(WorkerId, &WorkerSettings, SignalTriggeredFlagRef) -> i32 + Send + Sync>;

/// Box a closure as [WorkerEntry]
pub fn worker_entry<F>(entry: F) -> WorkerEntry
where
    F: Fn(WorkerId, &WorkerSettings, SignalTriggeredFlagRef) -> i32 + Send + Sync + 'static,
{
    Arc::new(entry)
}

/// Request to create one worker
#[derive(Clone)]
pub struct WorkerLaunch {
    pub settings: WorkerSettings,
    pub entry: WorkerEntry,
}

impl fmt::Debug for WorkerLaunch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLaunch")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn settings_survive_the_environment() {
        let settings = WorkerSettings {
            service_name: "echo".into(),
            ipc_address: "127.0.0.1:7001".parse().unwrap(),
            max_tasks: 12,
            worker_tick: Duration::from_millis(25),
        };
        let vars: HashMap<&str, String> = settings.to_env().into_iter().collect();
        let parsed = WorkerSettings::from_vars(|name| vars.get(name).cloned()).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn missing_or_malformed_variables_are_config_errors() {
        assert!(matches!(WorkerSettings::from_vars(|_| None), Err(Error::Config(_))));

        let result = WorkerSettings::from_vars(|name| match name {
            ENV_SERVICE => Some("echo".into()),
            ENV_IPC_ADDR => Some("not an address".into()),
            _ => None,
        });
        assert!(matches!(result, Err(Error::Config(message)) if message.contains(ENV_IPC_ADDR)));

        let defaults = WorkerSettings::from_vars(|name| match name {
            ENV_SERVICE => Some("echo".into()),
            ENV_IPC_ADDR => Some("127.0.0.1:1".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(defaults.max_tasks, 0);
        assert_eq!(defaults.worker_tick, Duration::from_millis(100));
    }
}
