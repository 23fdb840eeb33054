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

//! Execution backends creating and terminating isolated workers

pub mod fork;
pub mod spawn;
pub mod thread;

use crate::config::{Backend, SchedulerConfig};
use crate::error::Error;
use crate::lifecycle::{LifecycleBus, LifecycleKind, LifecycleListener};

pub use fork::{ForkBackend, NixProcessOps, ProcessOps};
pub use spawn::SpawnBackend;
pub use thread::ThreadBackend;

/// Whether workers share the scheduler's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Process,
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub isolation: Isolation,
}

/// Lifecycle events every backend reacts to
pub const SUBSCRIPTIONS: [(LifecycleKind, i32); 7] = [
    (LifecycleKind::KernelStart, 0),
    (LifecycleKind::WorkerCreate, 0),
    (LifecycleKind::WorkerLoop, 0),
    (LifecycleKind::WorkerTerminate, 0),
    (LifecycleKind::SchedulerStart, 0),
    (LifecycleKind::SchedulerLoop, 0),
    (LifecycleKind::SchedulerStop, 0),
];

/// A strategy to run workers in isolation
///
/// A backend reacts to lifecycle events: it creates a worker on `WorkerCreate` and
/// answers with `WorkerCreated`, stops one on `WorkerTerminate` and reports every worker
/// it saw end with `WorkerTerminated`, checked once per `SchedulerLoop`.
pub trait MultiProcessingModule: LifecycleListener {
    fn capabilities(&self) -> Capabilities;

    /// Probe whether the backend can work on this host
    fn is_supported(throw_on_failure: bool) -> Result<bool, Error>
    where
        Self: Sized;

    fn into_listener(self: Box<Self>) -> Box<dyn LifecycleListener>;

    /// Subscribe to the lifecycle events of `bus`
    fn attach(self: Box<Self>, bus: &mut LifecycleBus) -> Capabilities {
        let capabilities = self.capabilities();
        bus.subscribe(self.into_listener(), &SUBSCRIPTIONS);
        capabilities
    }
}

/// Create the backend selected by `config`
pub fn from_config(config: &SchedulerConfig) -> Result<Box<dyn MultiProcessingModule>, Error> {
    let backend: Box<dyn MultiProcessingModule> = match config.backend {
        Backend::Fork => {
            ForkBackend::<NixProcessOps>::is_supported(true)?;
            Box::new(ForkBackend::new(NixProcessOps))
        },
        Backend::Spawn => {
            SpawnBackend::is_supported(true)?;
            Box::new(SpawnBackend::new(&config.spawn.program, &config.spawn.args))
        },
        Backend::Thread => {
            ThreadBackend::is_supported(true)?;
            Box::new(ThreadBackend::new())
        },
    };
    Ok(backend)
}

/// Shared failure path of [MultiProcessingModule::is_supported]
fn unsupported(throw_on_failure: bool, reason: &'static str) -> Result<bool, Error> {
    if throw_on_failure {
        Err(Error::Unsupported(reason))
    } else {
        Ok(false)
    }
}
