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

//! Typed lifecycle event bus
//!
//! Listeners subscribe statically to a set of event kinds, each with a priority. When an
//! event is raised its handler chain runs in descending priority, ties in subscription
//! order. A handler may stop the propagation of the current event and emit follow-up
//! events, which are dispatched after the current chain in emission order.

use crate::error::Error;
use crate::ids::WorkerId;
use crate::worker::launch::WorkerLaunch;
use alloc::collections::{BTreeMap, VecDeque};
use herd_log::{debug, trace};

/// Upper bound of follow-up events raised by one event
const MAX_CASCADE: usize = 1024;

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    KernelStart,
    SchedulerStart,
    /// Raised once per control-loop tick
    SchedulerLoop,
    SchedulerStop,
    WorkerCreate(WorkerLaunch),
    /// A backend created a worker and assigned its uid
    WorkerCreated { uid: WorkerId },
    WorkerInit { uid: WorkerId },
    WorkerLoop { uid: WorkerId },
    WorkerExit { uid: WorkerId },
    WorkerTerminate { uid: WorkerId, hard: bool },
    /// A backend observed the end of a worker; `code` is `None` when unknown
    WorkerTerminated { uid: WorkerId, code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleKind {
    KernelStart,
    SchedulerStart,
    SchedulerLoop,
    SchedulerStop,
    WorkerCreate,
    WorkerCreated,
    WorkerInit,
    WorkerLoop,
    WorkerExit,
    WorkerTerminate,
    WorkerTerminated,
}

impl LifecycleEvent {
    pub fn kind(&self) -> LifecycleKind {
        match self {
            LifecycleEvent::KernelStart => LifecycleKind::KernelStart,
            LifecycleEvent::SchedulerStart => LifecycleKind::SchedulerStart,
            LifecycleEvent::SchedulerLoop => LifecycleKind::SchedulerLoop,
            LifecycleEvent::SchedulerStop => LifecycleKind::SchedulerStop,
            LifecycleEvent::WorkerCreate(_) => LifecycleKind::WorkerCreate,
            LifecycleEvent::WorkerCreated { .. } => LifecycleKind::WorkerCreated,
            LifecycleEvent::WorkerInit { .. } => LifecycleKind::WorkerInit,
            LifecycleEvent::WorkerLoop { .. } => LifecycleKind::WorkerLoop,
            LifecycleEvent::WorkerExit { .. } => LifecycleKind::WorkerExit,
            LifecycleEvent::WorkerTerminate { .. } => LifecycleKind::WorkerTerminate,
            LifecycleEvent::WorkerTerminated { .. } => LifecycleKind::WorkerTerminated,
        }
    }
}

/// Handle given to listeners while an event is dispatched
#[derive(Debug, Default)]
pub struct Dispatch {
    emitted: Vec<LifecycleEvent>,
    stopped: bool,
}

impl Dispatch {
    /// Queue a follow-up event
    pub fn emit(&mut self, event: LifecycleEvent) {
        self.emitted.push(event);
    }

    /// Skip the remaining handlers of the current event
    pub fn stop_propagation(&mut self) {
        self.stopped = true;
    }
}

pub trait LifecycleListener {
    fn on_event(&mut self, event: &LifecycleEvent, dispatch: &mut Dispatch) -> Result<(), Error>;
}

/// Identifies a listener subscribed to a [LifecycleBus]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(usize);

#[derive(Debug, Clone, Copy)]
struct Handler {
    listener: usize,
    priority: i32,
}

#[derive(Default)]
pub struct LifecycleBus {
    listeners: Vec<Box<dyn LifecycleListener>>,
    chains: BTreeMap<LifecycleKind, Vec<Handler>>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to `kinds`, each with its priority
    pub fn subscribe(&mut self, listener: Box<dyn LifecycleListener>, kinds: &[(LifecycleKind, i32)]) -> ListenerId {
        let index = self.listeners.len();
        self.listeners.push(listener);
        for (kind, priority) in kinds {
            let chain = self.chains.entry(*kind).or_default();
            chain.push(Handler {
                listener: index,
                priority: *priority,
            });
            // Stable, so equal priorities keep subscription order
            chain.sort_by_key(|handler| core::cmp::Reverse(handler.priority));
        }
        debug!("Subscribed lifecycle listener {index} to {} event kinds", kinds.len());
        ListenerId(index)
    }

    /// Number of handlers registered for `kind`
    pub fn handlers(&self, kind: LifecycleKind) -> usize {
        self.chains.get(&kind).map_or(0, Vec::len)
    }

    /// Dispatch `event` and all follow-ups it causes
    ///
    /// Returns the follow-up events in dispatch order. The first handler error aborts the
    /// cascade.
    pub fn raise(&mut self, event: LifecycleEvent) -> Result<Vec<LifecycleEvent>, Error> {
        let mut queue = VecDeque::from([event]);
        let mut emitted = Vec::new();
        let mut first = true;

        while let Some(event) = queue.pop_front() {
            trace!("Dispatching lifecycle event {:?}", event.kind());
            let mut dispatch = Dispatch::default();
            if let Some(chain) = self.chains.get(&event.kind()) {
                for handler in chain {
                    self.listeners[handler.listener].on_event(&event, &mut dispatch)?;
                    if dispatch.stopped {
                        trace!("Propagation of {:?} stopped", event.kind());
                        break;
                    }
                }
            }

            queue.extend(dispatch.emitted);
            if !first {
                emitted.push(event);
                if emitted.len() > MAX_CASCADE {
                    return Err(Error::Protocol("lifecycle event cascade does not terminate"));
                }
            }
            first = false;
        }

        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use core::cell::RefCell;

    type Log = Rc<RefCell<Vec<(&'static str, LifecycleKind)>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        stop: bool,
        emit: Vec<LifecycleEvent>,
    }

    impl Recorder {
        fn boxed(name: &'static str, log: &Log) -> Box<Self> {
            Box::new(Self {
                name,
                log: Rc::clone(log),
                stop: false,
                emit: Vec::new(),
            })
        }
    }

    impl LifecycleListener for Recorder {
        fn on_event(&mut self, event: &LifecycleEvent, dispatch: &mut Dispatch) -> Result<(), Error> {
            self.log.borrow_mut().push((self.name, event.kind()));
            for follow_up in self.emit.drain(..) {
                dispatch.emit(follow_up);
            }
            if self.stop {
                dispatch.stop_propagation();
            }
            Ok(())
        }
    }

    #[test]
    fn handlers_run_by_priority_then_subscription_order() {
        let log = Log::default();
        let mut bus = LifecycleBus::new();
        bus.subscribe(Recorder::boxed("low", &log), &[(LifecycleKind::SchedulerLoop, -5)]);
        bus.subscribe(Recorder::boxed("first", &log), &[(LifecycleKind::SchedulerLoop, 0)]);
        bus.subscribe(Recorder::boxed("high", &log), &[(LifecycleKind::SchedulerLoop, 10)]);
        bus.subscribe(Recorder::boxed("second", &log), &[(LifecycleKind::SchedulerLoop, 0)]);

        assert!(bus.raise(LifecycleEvent::SchedulerLoop).unwrap().is_empty());
        let names: Vec<_> = log.borrow().iter().map(|(name, _)| *name).collect();
        assert_eq!(names, ["high", "first", "second", "low"]);
        assert_eq!(bus.handlers(LifecycleKind::SchedulerLoop), 4);
        assert_eq!(bus.handlers(LifecycleKind::SchedulerStop), 0);
    }

    #[test]
    fn stop_propagation_skips_remaining_handlers() {
        let log = Log::default();
        let mut bus = LifecycleBus::new();
        let mut blocker = Recorder::boxed("blocker", &log);
        blocker.stop = true;
        bus.subscribe(blocker, &[(LifecycleKind::KernelStart, 1)]);
        bus.subscribe(Recorder::boxed("skipped", &log), &[(LifecycleKind::KernelStart, 0)]);

        bus.raise(LifecycleEvent::KernelStart).unwrap();
        assert_eq!(*log.borrow(), [("blocker", LifecycleKind::KernelStart)]);
    }

    #[test]
    fn follow_ups_are_dispatched_in_order_and_returned() {
        let log = Log::default();
        let mut bus = LifecycleBus::new();
        let mut creator = Recorder::boxed("creator", &log);
        creator.emit = vec![
            LifecycleEvent::WorkerCreated { uid: WorkerId::new(9) },
            LifecycleEvent::WorkerTerminated {
                uid: WorkerId::new(9),
                code: Some(0),
            },
        ];
        bus.subscribe(
            creator,
            &[
                (LifecycleKind::SchedulerLoop, 0),
                (LifecycleKind::WorkerCreated, 0),
                (LifecycleKind::WorkerTerminated, 0),
            ],
        );

        let emitted = bus.raise(LifecycleEvent::SchedulerLoop).unwrap();
        let kinds: Vec<_> = emitted.iter().map(LifecycleEvent::kind).collect();
        assert_eq!(kinds, [LifecycleKind::WorkerCreated, LifecycleKind::WorkerTerminated]);
        let seen: Vec<_> = log.borrow().iter().map(|(_, kind)| *kind).collect();
        assert_eq!(
            seen,
            [
                LifecycleKind::SchedulerLoop,
                LifecycleKind::WorkerCreated,
                LifecycleKind::WorkerTerminated
            ]
        );
    }

    #[test]
    fn handler_errors_abort_the_cascade() {
        struct Failing;

        impl LifecycleListener for Failing {
            fn on_event(&mut self, _event: &LifecycleEvent, _dispatch: &mut Dispatch) -> Result<(), Error> {
                Err(Error::Unsupported("test"))
            }
        }

        let mut bus = LifecycleBus::new();
        bus.subscribe(Box::new(Failing), &[(LifecycleKind::SchedulerStart, 0)]);
        assert!(matches!(
            bus.raise(LifecycleEvent::SchedulerStart),
            Err(Error::Unsupported("test"))
        ));
    }
}
