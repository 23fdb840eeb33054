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

//! IDs of workers, selectors and streams

use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use serde::{Deserialize, Serialize};

/// Identifies a worker
///
/// For process isolation this is the pid of the worker, for thread isolation a
/// synthetic counter value. Zero is reserved for the scheduler itself.
pub type WorkerId = GenericId<WorkerIdMarker>;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerIdMarker;

impl GetPrefix for WorkerIdMarker {
    fn prefix() -> &'static str {
        "W"
    }
}

impl WorkerId {
    /// The uid of the scheduler process on the IPC bus
    pub const SERVER: WorkerId = WorkerId::new(0);

    /// Whether this is the reserved scheduler uid
    pub fn is_server(&self) -> bool {
        self.id == 0
    }
}

/// Identifies a selector observed by a reactor
pub type SelectorId = GenericId<SelectorIdMarker>;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SelectorIdMarker;

impl GetPrefix for SelectorIdMarker {
    fn prefix() -> &'static str {
        "Sel"
    }
}

/// Identifies a stream handle, unique within the process
pub type StreamId = GenericId<StreamIdMarker>;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamIdMarker;

impl GetPrefix for StreamIdMarker {
    fn prefix() -> &'static str {
        "St"
    }
}

pub trait GetPrefix: fmt::Debug + Clone + Copy + Hash + PartialEq + Eq {
    fn prefix() -> &'static str {
        ""
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenericId<T: GetPrefix> {
    id: u64,
    // Marker to make distinct ID types not interchangeable
    _discriminator: PhantomData<T>,
}

impl<T: GetPrefix> GenericId<T> {
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _discriminator: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T: GetPrefix> From<u64> for GenericId<T> {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl<T: GetPrefix> From<GenericId<T>> for u64 {
    fn from(value: GenericId<T>) -> Self {
        value.id
    }
}

impl<T: GetPrefix> fmt::Display for GenericId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.id)
    }
}

#[test]
fn ids_display_with_prefix() {
    assert_eq!(WorkerId::new(42).to_string(), "W42");
    assert_eq!(SelectorId::new(3).to_string(), "Sel3");
    assert_eq!(StreamId::from(7).to_string(), "St7");
    assert!(WorkerId::SERVER.is_server());
    assert!(!WorkerId::new(1).is_server());
}
