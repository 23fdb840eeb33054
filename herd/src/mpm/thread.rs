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

//! Workers on threads of the scheduler process
//!
//! Threads cannot be killed or waited on like processes. Each worker thread gets a stop
//! flag, and liveness is checked once per control-loop tick through its join handle.

use crate::error::Error;
use crate::ids::WorkerId;
use crate::lifecycle::{Dispatch, LifecycleEvent, LifecycleListener};
use crate::mpm::{Capabilities, Isolation, MultiProcessingModule};
use crate::os_signals::SignalTriggeredFlagRef;
use crate::worker::launch::WorkerLaunch;
use alloc::collections::BTreeMap;
use herd_log::{debug, error, info};
use std::thread::{self, JoinHandle};

struct ThreadWorker {
    handle: JoinHandle<i32>,
    stop: SignalTriggeredFlagRef,
}

/// Backend running each worker on its own thread; uids are synthetic, starting at 1
pub struct ThreadBackend {
    next_uid: u64,
    workers: BTreeMap<WorkerId, ThreadWorker>,
}

impl Default for ThreadBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadBackend {
    pub fn new() -> Self {
        Self {
            next_uid: 1,
            workers: BTreeMap::new(),
        }
    }

    fn create(&mut self, launch: &WorkerLaunch, dispatch: &mut Dispatch) -> Result<(), Error> {
        let uid = WorkerId::new(self.next_uid);
        let stop = SignalTriggeredFlagRef::manual();

        let entry = launch.entry.clone();
        let settings = launch.settings.clone();
        let worker_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", settings.service_name, uid.id()))
            .spawn(move || entry(uid, &settings, worker_stop))
            .map_err(|e| Error::Spawn((e, "failed to start worker thread")))?;

        self.next_uid += 1;
        self.workers.insert(uid, ThreadWorker { handle, stop });
        debug!("Started worker thread {uid}");
        dispatch.emit(LifecycleEvent::WorkerCreated { uid });
        Ok(())
    }

    fn terminate(&mut self, uid: WorkerId, hard: bool, dispatch: &mut Dispatch) {
        match self.workers.get(&uid) {
            Some(worker) => {
                if hard {
                    debug!("Worker thread {uid} cannot be killed, asking it to stop");
                }
                worker.stop.trigger();
            },
            None => {
                debug!("Worker thread {uid} is already gone");
                dispatch.emit(LifecycleEvent::WorkerTerminated { uid, code: None });
            },
        }
    }

    fn reap(&mut self, dispatch: &mut Dispatch) {
        let finished: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.handle.is_finished())
            .map(|(uid, _)| *uid)
            .collect();

        for uid in finished {
            let Some(worker) = self.workers.remove(&uid) else {
                continue;
            };
            let code = match worker.handle.join() {
                Ok(code) => Some(code),
                Err(_) => {
                    error!("Worker thread {uid} panicked");
                    None
                },
            };
            debug!("Worker thread {uid} ended with {code:?}");
            dispatch.emit(LifecycleEvent::WorkerTerminated { uid, code });
        }
    }
}

impl LifecycleListener for ThreadBackend {
    fn on_event(&mut self, event: &LifecycleEvent, dispatch: &mut Dispatch) -> Result<(), Error> {
        match event {
            LifecycleEvent::SchedulerStart => info!("Running workers on threads"),
            LifecycleEvent::WorkerCreate(launch) => return self.create(launch, dispatch),
            LifecycleEvent::WorkerTerminate { uid, hard } => self.terminate(*uid, *hard, dispatch),
            LifecycleEvent::SchedulerLoop => self.reap(dispatch),
            LifecycleEvent::SchedulerStop => {
                for worker in self.workers.values() {
                    worker.stop.trigger();
                }
            },
            _ => {},
        }
        Ok(())
    }
}

impl MultiProcessingModule for ThreadBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            isolation: Isolation::Thread,
        }
    }

    fn is_supported(_throw_on_failure: bool) -> Result<bool, Error> {
        Ok(true)
    }

    fn into_listener(self: Box<Self>) -> Box<dyn LifecycleListener> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleBus;
    use crate::worker::launch::{WorkerSettings, worker_entry};
    use core::time::Duration;

    fn launch() -> WorkerLaunch {
        WorkerLaunch {
            settings: WorkerSettings {
                service_name: "spin".into(),
                ipc_address: "127.0.0.1:1".parse().unwrap(),
                max_tasks: 0,
                worker_tick: Duration::from_millis(1),
            },
            entry: worker_entry(|uid, _, stop| {
                while !stop.is_triggered() {
                    thread::sleep(Duration::from_millis(1));
                }
                uid.id() as i32 + 40
            }),
        }
    }

    fn bus() -> LifecycleBus {
        let mut bus = LifecycleBus::new();
        Box::new(ThreadBackend::new()).attach(&mut bus);
        bus
    }

    fn create(bus: &mut LifecycleBus) -> WorkerId {
        match bus.raise(LifecycleEvent::WorkerCreate(launch())).unwrap().as_slice() {
            [LifecycleEvent::WorkerCreated { uid }] => *uid,
            other => panic!("unexpected events {other:?}"),
        }
    }

    fn terminated(bus: &mut LifecycleBus) -> Vec<(WorkerId, Option<i32>)> {
        let mut ended = Vec::new();
        for _ in 0..500 {
            for event in bus.raise(LifecycleEvent::SchedulerLoop).unwrap() {
                if let LifecycleEvent::WorkerTerminated { uid, code } = event {
                    ended.push((uid, code));
                }
            }
            if !ended.is_empty() {
                return ended;
            }
            thread::sleep(Duration::from_millis(2));
        }
        ended
    }

    #[test]
    fn uids_are_synthetic_and_increasing() {
        let mut bus = bus();
        assert_eq!(create(&mut bus), WorkerId::new(1));
        assert_eq!(create(&mut bus), WorkerId::new(2));
        bus.raise(LifecycleEvent::SchedulerStop).unwrap();
    }

    #[test]
    fn liveness_is_reported_on_the_next_loop() {
        let mut bus = bus();
        let uid = create(&mut bus);
        assert!(bus.raise(LifecycleEvent::SchedulerLoop).unwrap().is_empty());

        bus.raise(LifecycleEvent::WorkerTerminate { uid, hard: true }).unwrap();
        assert_eq!(terminated(&mut bus), [(uid, Some(41))]);
    }

    #[test]
    fn panicking_worker_ends_without_code() {
        let mut bus = bus();
        let mut panicking = launch();
        panicking.entry = worker_entry(|_, _, _| panic!("worker failure"));
        let uid = match bus.raise(LifecycleEvent::WorkerCreate(panicking)).unwrap().as_slice() {
            [LifecycleEvent::WorkerCreated { uid }] => *uid,
            other => panic!("unexpected events {other:?}"),
        };
        assert_eq!(terminated(&mut bus), [(uid, None)]);
    }

    #[test]
    fn stopping_unknown_worker_reports_it_gone() {
        let mut bus = bus();
        let emitted = bus
            .raise(LifecycleEvent::WorkerTerminate {
                uid: WorkerId::new(77),
                hard: false,
            })
            .unwrap();
        assert!(matches!(emitted.as_slice(), [LifecycleEvent::WorkerTerminated { code: None, .. }]));
    }
}
