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

//! Single-threaded event loop merging many selectors into one poll

use crate::error::Error;
use crate::ids::SelectorId;
use crate::io::selector::{SelectionKey, Selector};
use crate::io::sys::{PollEntry, Poller, SysPoller};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use herd_log::{debug, trace};
use std::io;
use std::thread;
use std::time::Instant;

/// Default upper bound of one reactor tick
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Callbacks of the owner of observed selectors
pub trait ReactorHandler {
    /// Called with the selector `id` whenever at least one of its keys became ready
    fn on_ready(&mut self, id: SelectorId, selector: &mut Selector) -> Result<(), Error>;

    /// Called when selector `id` has seen no readiness for longer than its timeout
    fn on_timeout(&mut self, _id: SelectorId, _selector: &mut Selector) -> Result<(), Error> {
        Ok(())
    }

    /// Called once after every select/dispatch cycle of [Reactor::main_loop]
    fn on_tick(&mut self, _reactor: &mut Reactor) -> Result<(), Error> {
        Ok(())
    }
}

struct Observed {
    id: SelectorId,
    selector: Selector,
    timeout: Duration,
    last_ready: Instant,
}

/// Cooperative event loop
///
/// Each tick polls the union of all keys of all observed selectors with exactly one
/// OS call and hands every selector its own ready keys.
pub struct Reactor {
    observed: Vec<Observed>,
    next_id: u64,
    poller: Arc<dyn Poller>,
    terminating: Arc<AtomicBool>,
    tick_interval: Duration,
    last_tick: Option<Instant>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self::with_poller(Arc::new(SysPoller))
    }

    pub fn with_poller(poller: Arc<dyn Poller>) -> Self {
        Self {
            observed: Vec::new(),
            next_id: 1,
            poller,
            terminating: Arc::new(AtomicBool::new(false)),
            tick_interval: TICK_INTERVAL,
            last_tick: None,
        }
    }

    /// Set the upper bound of one tick
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Start observing `selector`
    ///
    /// `timeout` is the idle time after which [ReactorHandler::on_timeout] fires.
    pub fn observe(&mut self, selector: Selector, timeout: Duration) -> SelectorId {
        let id = SelectorId::new(self.next_id);
        self.next_id += 1;
        debug!("Observing selector {id}");
        self.observed.push(Observed {
            id,
            selector,
            timeout,
            last_ready: Instant::now(),
        });
        id
    }

    /// Stop observing selector `id`, handing it back
    pub fn unregister(&mut self, id: SelectorId) -> Result<Selector, Error> {
        let index = self
            .observed
            .iter()
            .position(|o| o.id == id)
            .ok_or(Error::UnknownSelector(id))?;
        debug!("No longer observing selector {id}");
        Ok(self.observed.remove(index).selector)
    }

    pub fn selector(&self, id: SelectorId) -> Option<&Selector> {
        self.observed.iter().find(|o| o.id == id).map(|o| &o.selector)
    }

    pub fn selector_mut(&mut self, id: SelectorId) -> Option<&mut Selector> {
        self.observed
            .iter_mut()
            .find(|o| o.id == id)
            .map(|o| &mut o.selector)
    }

    /// Keys of all observed selectors
    pub fn keys(&self) -> Vec<&SelectionKey> {
        self.observed.iter().flat_map(|o| o.selector.keys()).collect()
    }

    /// Shared flag ending [Reactor::main_loop]
    pub fn terminating_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminating)
    }

    pub fn set_terminating(&self) {
        self.terminating.store(true, Ordering::Relaxed);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Relaxed)
    }

    /// Time the next select may block
    ///
    /// Ticks are at most [Reactor::with_tick_interval] apart but never busy-spin.
    pub fn wait_budget(&self, now: Instant) -> Duration {
        match self.last_tick {
            None => Duration::ZERO,
            Some(last) => self.tick_interval.saturating_sub(now.saturating_duration_since(last)),
        }
    }

    /// Run one select/dispatch cycle, returning the number of ready streams
    pub fn tick<H: ReactorHandler>(&mut self, handler: &mut H) -> Result<usize, Error> {
        let budget = self.wait_budget(Instant::now());

        // Merge the interest of all observed selectors; entries stay grouped by owner
        let mut entries: Vec<PollEntry> = Vec::new();
        let mut ranges = Vec::with_capacity(self.observed.len());
        for observed in self.observed.iter_mut() {
            observed.selector.prune_closed();
            let start = entries.len();
            entries.extend(observed.selector.poll_entries());
            ranges.push(start..entries.len());
        }

        let ready = if entries.is_empty() {
            thread::sleep(budget);
            0
        } else {
            match self.poller.poll(&mut entries, Some(budget)) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => return Err(Error::Io((e, "select failed"))),
            }
        };
        let now = Instant::now();
        self.last_tick = Some(now);
        trace!("Reactor tick: {ready} of {} streams ready", entries.len());

        let mut total = 0;
        for (observed, range) in self.observed.iter_mut().zip(ranges) {
            let count = observed.selector.apply_readiness(&entries[range]);
            total += count;

            if count > 0 {
                observed.last_ready = now;
                handler.on_ready(observed.id, &mut observed.selector)?;
            } else if now.saturating_duration_since(observed.last_ready) >= observed.timeout {
                observed.last_ready = now;
                handler.on_timeout(observed.id, &mut observed.selector)?;
            }
        }

        Ok(total)
    }

    /// Tick until the terminating flag is observed after a cycle
    pub fn main_loop<H: ReactorHandler>(&mut self, handler: &mut H) -> Result<(), Error> {
        loop {
            self.tick(handler)?;
            handler.on_tick(self)?;
            if self.is_terminating() {
                debug!("Reactor terminating");
                return Ok(());
            }
        }
    }
}
