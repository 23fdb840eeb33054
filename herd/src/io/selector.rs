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

//! Readiness multiplexer over a set of owned streams

use crate::error::Error;
use crate::ids::StreamId;
use crate::io::ops::Ops;
use crate::io::stream::{Stream, StreamKind};
use crate::io::sys::{PollEntry, Poller, Readiness, SysPoller};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::any::Any;
use core::time::Duration;
use herd_log::{debug, trace};
use std::io;

/// Registration of one stream with one [Selector]
pub struct SelectionKey {
    stream: Stream,
    interest: Ops,
    ready: Ops,
    attachment: Option<Box<dyn Any + Send>>,
}

impl SelectionKey {
    fn new(stream: Stream, interest: Ops) -> Self {
        Self {
            stream,
            interest,
            ready: Ops::NONE,
            attachment: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.stream.id()
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    pub fn interest_ops(&self) -> Ops {
        self.interest
    }

    /// Operations found ready by the last select
    pub fn ready_ops(&self) -> Ops {
        self.ready
    }

    pub fn is_readable(&self) -> bool {
        self.ready.contains(Ops::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.ready.contains(Ops::WRITE)
    }

    pub fn is_acceptable(&self) -> bool {
        self.ready.contains(Ops::ACCEPT)
    }

    /// Attach arbitrary owner data to the key, replacing any previous attachment
    pub fn attach<T: Any + Send>(&mut self, value: T) {
        self.attachment = Some(Box::new(value));
    }

    pub fn attachment<T: Any + Send>(&self) -> Option<&T> {
        self.attachment.as_ref().and_then(|a| a.downcast_ref())
    }

    pub fn attachment_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.attachment.as_mut().and_then(|a| a.downcast_mut())
    }

    /// Split borrow of the stream and a typed attachment
    pub fn stream_and_attachment<T: Any + Send>(&mut self) -> (&mut Stream, Option<&mut T>) {
        (
            &mut self.stream,
            self.attachment.as_mut().and_then(|a| a.downcast_mut()),
        )
    }

    fn set_readiness(&mut self, readiness: Readiness) -> bool {
        let input = readiness.readable || readiness.hangup || readiness.error;

        // A ready listener only ever means "accept", never read or write
        self.ready = if self.interest.contains(Ops::ACCEPT) && self.stream.kind() == StreamKind::Listener {
            if input { Ops::ACCEPT } else { Ops::NONE }
        } else {
            let mut ops = Ops::NONE;
            if input {
                ops |= Ops::READ;
            }
            if readiness.writable || readiness.error {
                ops |= Ops::WRITE;
            }
            ops & self.interest
        };

        !self.ready.is_empty()
    }
}

impl core::fmt::Debug for SelectionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SelectionKey")
            .field("stream", &self.stream)
            .field("interest", &self.interest)
            .field("ready", &self.ready)
            .finish()
    }
}

/// Readiness multiplexer
///
/// The selector owns every stream registered with it. A stream is handed back to
/// the caller when its last interest is unregistered.
pub struct Selector {
    keys: BTreeMap<StreamId, SelectionKey>,
    ready: Vec<StreamId>,
    poller: Arc<dyn Poller>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector {
    /// Create a selector polling through `poll(2)`
    pub fn new() -> Self {
        Self::with_poller(Arc::new(SysPoller))
    }

    /// Create a selector polling through `poller`
    pub fn with_poller(poller: Arc<dyn Poller>) -> Self {
        Self {
            keys: BTreeMap::new(),
            ready: Vec::new(),
            poller,
        }
    }

    /// Register `stream` with interest in `ops`, taking ownership
    pub fn register(&mut self, stream: Stream, ops: Ops) -> Result<StreamId, Error> {
        Self::validate(&stream, ops)?;
        let id = stream.id();
        trace!("Registering stream {id} for {ops:?}");
        self.keys.insert(id, SelectionKey::new(stream, ops));
        Ok(id)
    }

    /// Add interest in `ops` to an already registered stream
    pub fn reregister(&mut self, id: StreamId, ops: Ops) -> Result<&mut SelectionKey, Error> {
        let key = self.keys.get_mut(&id).ok_or(Error::UnknownStream(id))?;
        Self::validate(&key.stream, ops)?;
        key.interest |= ops;
        Ok(key)
    }

    /// Remove interest in `ops`
    ///
    /// Once no interest is left the key is dropped and the stream returned.
    pub fn unregister(&mut self, id: StreamId, ops: Ops) -> Result<Option<Stream>, Error> {
        let key = self.keys.get_mut(&id).ok_or(Error::UnknownStream(id))?;
        key.interest = key.interest.remove(ops);
        key.ready = key.ready & key.interest;
        if !key.interest.is_empty() {
            return Ok(None);
        }

        self.ready.retain(|ready| *ready != id);
        Ok(self.keys.remove(&id).map(|key| key.stream))
    }

    /// Drop the key of `id` regardless of its interest, returning the stream
    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        self.ready.retain(|ready| *ready != id);
        self.keys.remove(&id).map(|key| key.stream)
    }

    /// Poll the registered streams once
    ///
    /// Returns the number of streams with at least one ready operation. Closed streams
    /// are dropped silently before polling; an interrupted poll counts as zero.
    pub fn select(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        self.prune_closed();
        let mut entries = self.poll_entries();
        if entries.is_empty() {
            return Ok(0);
        }

        match self.poller.poll(&mut entries, timeout) {
            Ok(_) => {},
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(Error::Io((e, "select failed"))),
        }

        Ok(self.apply_readiness(&entries))
    }

    /// Keys that became ready in the last [Selector::select]
    pub fn selection_keys(&self) -> impl Iterator<Item = &SelectionKey> {
        self.ready.iter().filter_map(|id| self.keys.get(id))
    }

    /// IDs of the keys that became ready in the last [Selector::select]
    pub fn ready_ids(&self) -> Vec<StreamId> {
        self.ready.clone()
    }

    /// All registered keys
    pub fn keys(&self) -> impl Iterator<Item = &SelectionKey> {
        self.keys.values()
    }

    pub fn key(&self, id: StreamId) -> Option<&SelectionKey> {
        self.keys.get(&id)
    }

    pub fn key_mut(&mut self, id: StreamId) -> Option<&mut SelectionKey> {
        self.keys.get_mut(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Drop keys of closed streams
    pub(crate) fn prune_closed(&mut self) {
        let closed: Vec<StreamId> = self
            .keys
            .values()
            .filter(|key| key.stream.is_closed())
            .map(SelectionKey::id)
            .collect();
        for id in closed {
            debug!("Pruning closed stream {id}");
            self.remove(id);
        }
    }

    /// Poll entries for every open stream with non-empty interest
    pub(crate) fn poll_entries(&self) -> Vec<PollEntry> {
        self.keys
            .values()
            .filter(|key| !key.interest.is_empty())
            .filter_map(|key| {
                key.stream.raw_fd().map(|fd| PollEntry {
                    id: key.id(),
                    fd,
                    interest: key.interest,
                    readiness: Readiness::default(),
                })
            })
            .collect()
    }

    /// Take over the readiness reported for `entries`, returning the number of ready keys
    pub(crate) fn apply_readiness(&mut self, entries: &[PollEntry]) -> usize {
        self.ready.clear();
        for key in self.keys.values_mut() {
            key.ready = Ops::NONE;
        }

        for entry in entries {
            if entry.readiness.is_empty() {
                continue;
            }
            if let Some(key) = self.keys.get_mut(&entry.id)
                && key.set_readiness(entry.readiness)
            {
                self.ready.push(entry.id);
            }
        }

        self.ready.len()
    }

    fn validate(stream: &Stream, ops: Ops) -> Result<(), Error> {
        if ops.is_empty() {
            return Err(Error::InvalidOps(ops.bits()));
        }
        if ops.contains(Ops::ACCEPT) && stream.kind() != StreamKind::Listener {
            return Err(Error::InvalidOps(ops.bits()));
        }
        Ok(())
    }
}
