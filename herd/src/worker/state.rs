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

//! Status record of a single worker

use crate::ids::WorkerId;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Status code of a worker
///
/// The numeric values are part of the status messages exchanged over IPC.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    New = 0,
    Waiting = 1,
    Running = 2,
    Terminated = 4,
    Exiting = 8,
}

impl WorkerStatus {
    /// Numeric status code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether a worker in this status may move to `next`
    ///
    /// The order is New, then Waiting and Running alternating, then Exiting. Exiting is
    /// entered from Waiting as well as from Running: a worker reaching its task limit or
    /// asked to stop is back in Waiting when it leaves. Repeating the current status is
    /// allowed, it carries refreshed counters. [WorkerStatus::Terminated] is reachable
    /// from everywhere, a New worker included, because the scheduler marks a worker
    /// terminated when it stops it, possibly before its first report. Terminated is never
    /// left again.
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;

        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (current, next) if current == next => true,
            (New, Waiting) => true,
            (Waiting, Running) | (Running, Waiting) => true,
            (Waiting, Exiting) | (Running, Exiting) => true,
            _ => false,
        }
    }

    /// Whether the worker is idle and could pick up work
    pub fn is_idle(self) -> bool {
        matches!(self, WorkerStatus::New | WorkerStatus::Waiting)
    }
}

impl TryFrom<u8> for WorkerStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use WorkerStatus::*;

        match value {
            v if v == New as u8 => Ok(New),
            v if v == Waiting as u8 => Ok(Waiting),
            v if v == Running as u8 => Ok(Running),
            v if v == Terminated as u8 => Ok(Terminated),
            v if v == Exiting as u8 => Ok(Exiting),
            other => Err(other),
        }
    }
}

/// Identity and status of one worker
///
/// The scheduler owns the authoritative copy. A worker keeps its own copy and pushes
/// it to the scheduler in status messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    /// OS process id of the worker (the scheduler's pid for thread workers)
    pub process_id: u32,
    /// Kernel thread id of the worker's main thread
    pub thread_id: u32,
    /// Worker uid on the IPC bus
    pub uid: WorkerId,
    /// Name of the service run by the worker
    pub service_name: String,
    /// Current status
    pub code: WorkerStatus,
    /// Time of the last status change, ms since the unix epoch
    pub time: u64,
    /// Time the worker was created, ms since the unix epoch
    pub start_time: u64,
    /// Number of tasks finished since start
    pub tasks_finished: u64,
    /// Task throughput since start
    pub tasks_per_second: f64,
    /// User CPU time consumed, in microseconds
    pub cpu_user_time: u64,
    /// System CPU time consumed, in microseconds
    pub cpu_sys_time: u64,
    /// Free-form description of what the worker is doing
    pub status_description: String,
}

impl WorkerState {
    /// Create the state of a freshly created worker
    pub fn new(uid: WorkerId, service_name: impl Into<String>) -> Self {
        let now = unix_millis(SystemTime::now());
        Self {
            process_id: std::process::id(),
            thread_id: 0,
            uid,
            service_name: service_name.into(),
            code: WorkerStatus::New,
            time: now,
            start_time: now,
            tasks_finished: 0,
            tasks_per_second: 0.0,
            cpu_user_time: 0,
            cpu_sys_time: 0,
            status_description: String::new(),
        }
    }

    /// Move to `next`, stamping the transition time
    pub fn set_status(&mut self, next: WorkerStatus) -> bool {
        if !self.code.can_transition_to(next) {
            return false;
        }
        if self.code != next {
            self.time = unix_millis(SystemTime::now());
        }
        self.code = next;
        true
    }

    /// Count one finished task and refresh the throughput figure
    pub fn finish_task(&mut self) {
        self.tasks_finished += 1;
        let alive = self.age(SystemTime::now()).as_secs_f64();
        if alive > 0.0 {
            self.tasks_per_second = self.tasks_finished as f64 / alive;
        }
    }

    /// Time since the worker was created
    pub fn age(&self, now: SystemTime) -> Duration {
        Duration::from_millis(unix_millis(now).saturating_sub(self.start_time))
    }

    /// Time since the last status change
    pub fn time_in_status(&self, now: SystemTime) -> Duration {
        Duration::from_millis(unix_millis(now).saturating_sub(self.time))
    }

    /// Refresh the CPU time counters of the calling thread
    pub fn sample_cpu_times(&mut self) {
        let mut usage = core::mem::MaybeUninit::<libc::rusage>::zeroed();
        // Safety: the pointer refers to a properly sized, writable rusage struct
        let rc = unsafe { libc::getrusage(libc::RUSAGE_THREAD, usage.as_mut_ptr()) };
        if rc != 0 {
            return;
        }
        // Safety: getrusage succeeded and initialized the struct
        let usage = unsafe { usage.assume_init() };
        self.cpu_user_time = timeval_micros(usage.ru_utime);
        self.cpu_sys_time = timeval_micros(usage.ru_stime);
    }
}

fn timeval_micros(tv: libc::timeval) -> u64 {
    (tv.tv_sec as u64) * 1_000_000 + tv.tv_usec as u64
}

/// Milliseconds since the unix epoch
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_wire_values() {
        assert_eq!(WorkerStatus::New.code(), 0);
        assert_eq!(WorkerStatus::Waiting.code(), 1);
        assert_eq!(WorkerStatus::Running.code(), 2);
        assert_eq!(WorkerStatus::Terminated.code(), 4);
        assert_eq!(WorkerStatus::Exiting.code(), 8);
        assert_eq!(WorkerStatus::try_from(8), Ok(WorkerStatus::Exiting));
        assert_eq!(WorkerStatus::try_from(3), Err(3));
    }

    #[test]
    fn lifecycle_order_is_enforced() {
        use WorkerStatus::*;

        assert!(New.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Running));
        assert!(Running.can_transition_to(Waiting));
        assert!(Running.can_transition_to(Exiting));
        assert!(Waiting.can_transition_to(Exiting));
        assert!(Exiting.can_transition_to(Terminated));
        assert!(New.can_transition_to(Terminated));
        assert!(Running.can_transition_to(Terminated));

        assert!(!New.can_transition_to(Running));
        assert!(!New.can_transition_to(Exiting));
        assert!(!Exiting.can_transition_to(Waiting));
        assert!(!Waiting.can_transition_to(New));
        assert!(!Terminated.can_transition_to(Waiting));
        assert!(!Terminated.can_transition_to(Terminated));
    }

    #[test]
    fn set_status_rejects_invalid_moves() {
        let mut state = WorkerState::new(WorkerId::new(5), "echo");
        assert!(!state.set_status(WorkerStatus::Running));
        assert_eq!(state.code, WorkerStatus::New);
        assert!(state.set_status(WorkerStatus::Waiting));
        assert!(state.set_status(WorkerStatus::Running));
        assert!(state.set_status(WorkerStatus::Terminated));
        assert!(!state.set_status(WorkerStatus::Waiting));
    }

    #[test]
    fn finished_tasks_are_counted() {
        let mut state = WorkerState::new(WorkerId::new(5), "echo");
        state.finish_task();
        state.finish_task();
        assert_eq!(state.tasks_finished, 2);
    }
}
