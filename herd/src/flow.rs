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

//! Worker lifecycle transitions driven through the lifecycle bus

use crate::error::Error;
use crate::ids::WorkerId;
use crate::lifecycle::{LifecycleBus, LifecycleEvent};
use crate::mpm::{Capabilities, MultiProcessingModule};
use crate::worker::collection::WorkerCollection;
use crate::worker::launch::WorkerLaunch;
use herd_log::{debug, error};

/// Raises the create, init and terminate transitions of workers
///
/// The attached backend does the actual work and answers with follow-up events, which
/// every operation hands back to the caller.
pub struct WorkerFlowManager {
    bus: LifecycleBus,
    capabilities: Capabilities,
}

impl WorkerFlowManager {
    /// Attach `backend` to a fresh lifecycle bus
    pub fn new(backend: Box<dyn MultiProcessingModule>) -> Self {
        let mut bus = LifecycleBus::new();
        let capabilities = backend.attach(&mut bus);
        Self { bus, capabilities }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The bus, e.g. to subscribe additional listeners
    pub fn bus_mut(&mut self) -> &mut LifecycleBus {
        &mut self.bus
    }

    pub fn raise(&mut self, event: LifecycleEvent) -> Result<Vec<LifecycleEvent>, Error> {
        self.bus.raise(event)
    }

    /// Create one worker, returning its uid
    ///
    /// A failed creation is logged and yields `None`; the next discipline pass retries.
    pub fn start_worker(&mut self, launch: WorkerLaunch) -> Option<WorkerId> {
        let emitted = match self.bus.raise(LifecycleEvent::WorkerCreate(launch)) {
            Ok(emitted) => emitted,
            Err(e) => {
                error!("Failed to create worker: {e}");
                return None;
            },
        };

        let Some(uid) = emitted.iter().find_map(|event| match event {
            LifecycleEvent::WorkerCreated { uid } => Some(*uid),
            _ => None,
        }) else {
            error!("Backend created no worker");
            return None;
        };

        if let Err(e) = self.bus.raise(LifecycleEvent::WorkerInit { uid }) {
            error!("Failed to initialize worker {uid}: {e}");
        }
        debug!("Worker {uid} created");
        Some(uid)
    }

    /// Ask the backend to stop `uid` and mark it terminated right away
    ///
    /// Its removal from `workers` waits for the backend's `WorkerTerminated`.
    pub fn stop_worker(
        &mut self,
        uid: WorkerId,
        hard: bool,
        workers: &mut WorkerCollection,
    ) -> Result<Vec<LifecycleEvent>, Error> {
        debug!("Stopping worker {uid} ({})", if hard { "hard" } else { "soft" });
        workers.mark_terminated(uid);
        self.bus.raise(LifecycleEvent::WorkerTerminate { uid, hard })
    }

    /// Run the per-tick duties of the backend
    pub fn loop_tick(&mut self) -> Result<Vec<LifecycleEvent>, Error> {
        self.bus.raise(LifecycleEvent::SchedulerLoop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{Dispatch, LifecycleKind, LifecycleListener};
    use crate::mpm::{Isolation, ThreadBackend};
    use crate::worker::launch::{WorkerSettings, worker_entry};
    use crate::worker::state::{WorkerState, WorkerStatus};
    use alloc::rc::Rc;
    use core::cell::RefCell;
    use core::time::Duration;
    use std::thread;

    fn launch() -> WorkerLaunch {
        WorkerLaunch {
            settings: WorkerSettings {
                service_name: "flow".into(),
                ipc_address: "127.0.0.1:1".parse().unwrap(),
                max_tasks: 0,
                worker_tick: Duration::from_millis(1),
            },
            entry: worker_entry(|_, _, stop| {
                while !stop.is_triggered() {
                    thread::sleep(Duration::from_millis(1));
                }
                0
            }),
        }
    }

    struct Observer(Rc<RefCell<Vec<LifecycleKind>>>);

    impl LifecycleListener for Observer {
        fn on_event(&mut self, event: &LifecycleEvent, _dispatch: &mut Dispatch) -> Result<(), Error> {
            self.0.borrow_mut().push(event.kind());
            Ok(())
        }
    }

    #[test]
    fn start_raises_create_then_init() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut flow = WorkerFlowManager::new(Box::new(ThreadBackend::new()));
        assert_eq!(flow.capabilities().isolation, Isolation::Thread);
        flow.bus_mut().subscribe(
            Box::new(Observer(Rc::clone(&seen))),
            &[
                (LifecycleKind::WorkerCreate, -1),
                (LifecycleKind::WorkerCreated, 0),
                (LifecycleKind::WorkerInit, 0),
            ],
        );

        let uid = flow.start_worker(launch()).unwrap();
        assert_eq!(uid, WorkerId::new(1));
        assert_eq!(
            *seen.borrow(),
            [LifecycleKind::WorkerCreate, LifecycleKind::WorkerCreated, LifecycleKind::WorkerInit]
        );
        flow.raise(LifecycleEvent::SchedulerStop).unwrap();
    }

    #[test]
    fn failed_creation_yields_none() {
        struct Refusing;

        impl LifecycleListener for Refusing {
            fn on_event(&mut self, _event: &LifecycleEvent, _dispatch: &mut Dispatch) -> Result<(), Error> {
                Err(Error::Unsupported("no workers today"))
            }
        }

        let mut flow = WorkerFlowManager::new(Box::new(ThreadBackend::new()));
        flow.bus_mut()
            .subscribe(Box::new(Refusing), &[(LifecycleKind::WorkerCreate, 10)]);
        assert_eq!(flow.start_worker(launch()), None);
    }

    #[test]
    fn stop_marks_terminated_until_confirmed() {
        let mut flow = WorkerFlowManager::new(Box::new(ThreadBackend::new()));
        let mut workers = WorkerCollection::new(4);
        let uid = flow.start_worker(launch()).unwrap();
        workers.insert(WorkerState::new(uid, "flow")).unwrap();

        assert!(flow.stop_worker(uid, false, &mut workers).unwrap().is_empty());
        assert_eq!(workers.get(uid).unwrap().code, WorkerStatus::Terminated);

        let mut confirmed = false;
        for _ in 0..500 {
            for event in flow.loop_tick().unwrap() {
                if let LifecycleEvent::WorkerTerminated { uid: ended, .. } = event {
                    assert_eq!(ended, uid);
                    workers.remove(ended);
                    confirmed = true;
                }
            }
            if confirmed {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(confirmed);
        assert!(workers.is_empty());
    }
}
