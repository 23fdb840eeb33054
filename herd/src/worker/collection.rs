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

//! The scheduler's authoritative view of its workers

use crate::error::Error;
use crate::ids::WorkerId;
use crate::worker::state::{WorkerState, WorkerStatus};
use alloc::collections::BTreeMap;

/// Worker states by uid, bounded by the pool size
#[derive(Debug)]
pub struct WorkerCollection {
    workers: BTreeMap<WorkerId, WorkerState>,
    max: usize,
}

impl WorkerCollection {
    pub fn new(max: usize) -> Self {
        Self {
            workers: BTreeMap::new(),
            max,
        }
    }

    /// Track a new worker
    pub fn insert(&mut self, state: WorkerState) -> Result<(), Error> {
        if !self.workers.contains_key(&state.uid) && self.workers.len() >= self.max {
            return Err(Error::PoolFull(self.max));
        }
        self.workers.insert(state.uid, state);
        Ok(())
    }

    pub fn remove(&mut self, uid: WorkerId) -> Option<WorkerState> {
        self.workers.remove(&uid)
    }

    pub fn get(&self, uid: WorkerId) -> Option<&WorkerState> {
        self.workers.get(&uid)
    }

    /// Take over a status report of a worker
    ///
    /// The reported status must be reachable from the recorded one. Reports for workers
    /// already marked terminated are ignored.
    pub fn update(&mut self, report: WorkerState) -> Result<(), Error> {
        let uid = report.uid;
        let Some(state) = self.workers.get_mut(&uid) else {
            return Err(Error::Protocol("status report of an unknown worker"));
        };
        if state.code == WorkerStatus::Terminated {
            return Ok(());
        }
        if !state.code.can_transition_to(report.code) {
            return Err(Error::InvalidTransition(uid, state.code, report.code));
        }

        // The scheduler keeps its own notion of when the worker was created
        let start_time = state.start_time;
        *state = report;
        state.start_time = start_time;
        Ok(())
    }

    /// Mark a worker terminated ahead of the backend's confirmation
    pub fn mark_terminated(&mut self, uid: WorkerId) {
        if let Some(state) = self.workers.get_mut(&uid) {
            state.set_status(WorkerStatus::Terminated);
        }
    }

    pub fn clear(&mut self) {
        self.workers.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerState> {
        self.workers.values()
    }

    pub fn uids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    /// Workers that can take a task: new and waiting ones
    pub fn idle(&self) -> impl Iterator<Item = &WorkerState> {
        self.workers.values().filter(|state| state.code.is_idle())
    }

    /// Number of tracked workers, including those marked terminated
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
