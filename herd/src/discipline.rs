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

//! Scaling policy of the worker pool

use crate::config::SchedulerConfig;
use crate::ids::WorkerId;
use crate::worker::collection::WorkerCollection;
use core::time::Duration;
use std::time::SystemTime;

/// What the pool should do in this tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    pub to_create: usize,
    pub to_terminate: Vec<WorkerId>,
}

/// Pure decision function over the pool occupancy
pub trait Discipline {
    fn decide(&mut self, workers: &WorkerCollection, now: SystemTime) -> Decision;
}

/// Keeps the number of idle workers between the spare bounds, retiring the least
/// recently used idle workers first
#[derive(Debug, Clone)]
pub struct LruDiscipline {
    pub min_spare: usize,
    pub max_spare: usize,
    pub max: usize,
    pub idle_timeout: Duration,
}

impl LruDiscipline {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            min_spare: config.min_spare_processes,
            max_spare: config.max_spare_processes,
            max: config.max_processes,
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Discipline for LruDiscipline {
    fn decide(&mut self, workers: &WorkerCollection, now: SystemTime) -> Decision {
        let mut idle: Vec<_> = workers.idle().collect();

        if idle.len() < self.min_spare {
            // Workers marked terminated still count until the backend confirms their end
            let room = self.max.saturating_sub(workers.len());
            return Decision {
                to_create: (self.min_spare - idle.len()).min(room),
                to_terminate: Vec::new(),
            };
        }

        idle.sort_by_key(|state| (state.time, state.uid));
        let excess = idle.len().saturating_sub(self.max_spare);
        let mut to_terminate: Vec<WorkerId> = idle[..excess].iter().map(|state| state.uid).collect();

        let mut remaining = idle.len() - excess;
        for state in &idle[excess..] {
            if remaining <= self.min_spare {
                break;
            }
            if state.time_in_status(now) > self.idle_timeout {
                to_terminate.push(state.uid);
                remaining -= 1;
            }
        }

        Decision {
            to_create: 0,
            to_terminate,
        }
    }
}
