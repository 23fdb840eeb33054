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

//! Kernel thread ids, as shown in log records and worker status reports

use core::fmt;

/// Kernel id of a thread, equal to the process id for the main thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<ThreadId> for u32 {
    fn from(id: ThreadId) -> Self {
        id.0
    }
}

/// Kernel id of the calling thread
pub fn current() -> ThreadId {
    // Safety: gettid has no failure case
    let tid = unsafe { libc::gettid() };
    ThreadId(tid as u32)
}
