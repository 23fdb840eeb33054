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

//! Pool supervisor
//!
//! The [Scheduler] owns the worker collection, the active [Discipline], the execution
//! backend (through the [WorkerFlowManager]) and the IPC bus. One control thread drives
//! everything from a [Reactor] tick.

use crate::config::SchedulerConfig;
use crate::discipline::{Discipline, LruDiscipline};
use crate::error::Error;
use crate::flow::WorkerFlowManager;
use crate::ids::{SelectorId, WorkerId};
use crate::io::{Reactor, ReactorHandler, Selector};
use crate::ipc::{Audience, Envelope, IpcServer, Message};
use crate::lifecycle::LifecycleEvent;
use crate::mpm::{self, Capabilities, MultiProcessingModule};
use crate::os_signals::SignalTriggeredFlagRef;
use crate::pid_file::PidFile;
use crate::worker::collection::WorkerCollection;
use crate::worker::launch::{WorkerEntry, WorkerLaunch, WorkerSettings};
use crate::worker::state::{WorkerState, WorkerStatus};
use core::time::Duration;
use herd_log::{debug, error, info, trace, warn};
use std::net::SocketAddr;
use std::thread;
use std::time::{Instant, SystemTime};

/// Pause between two liveness checks while shutting down
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Keeps a pool of workers alive
pub struct Scheduler {
    reactor: Reactor,
    core: SchedulerCore,
}

impl Scheduler {
    /// Create a scheduler running `entry` in workers of the configured backend
    pub fn new(config: SchedulerConfig, entry: WorkerEntry) -> Result<Self, Error> {
        config.validate()?;
        let backend = mpm::from_config(&config)?;
        Self::with_backend(config, entry, backend)
    }

    /// Create a scheduler on an explicitly chosen backend
    pub fn with_backend(
        config: SchedulerConfig,
        entry: WorkerEntry,
        backend: Box<dyn MultiProcessingModule>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let reactor = Reactor::new().with_tick_interval(config.tick_interval());
        let discipline = Box::new(LruDiscipline::from_config(&config));
        let workers = WorkerCollection::new(config.max_processes);

        Ok(Self {
            reactor,
            core: SchedulerCore {
                flow: WorkerFlowManager::new(backend),
                workers,
                discipline,
                entry,
                ipc: None,
                pid_file: None,
                shutdown: SignalTriggeredFlagRef::manual(),
                signals: None,
                received: Vec::new(),
                terminating: false,
                config,
            },
        })
    }

    /// Replace the default [LruDiscipline]
    pub fn with_discipline(mut self, discipline: Box<dyn Discipline>) -> Self {
        self.core.discipline = discipline;
        self
    }

    /// End [Scheduler::run] on SIGTERM or SIGINT
    pub fn handle_signals(mut self) -> Result<Self, Error> {
        self.core.signals = Some(SignalTriggeredFlagRef::termination()?);
        Ok(self)
    }

    /// Flag ending [Scheduler::run] when triggered, usable from other threads
    pub fn shutdown_handle(&self) -> SignalTriggeredFlagRef {
        self.core.shutdown.clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.core.flow.capabilities()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    pub fn workers(&self) -> &WorkerCollection {
        &self.core.workers
    }

    /// Address of the IPC bus, once started
    pub fn ipc_address(&self) -> Option<SocketAddr> {
        self.core.ipc.as_ref().map(|(server, _)| server.address())
    }

    pub fn is_terminating(&self) -> bool {
        self.core.terminating
    }

    /// Take the pid-lock, open the IPC bus and create the initial workers
    pub fn start(&mut self) -> Result<(), Error> {
        if self.core.ipc.is_some() {
            return Ok(());
        }
        let config = &self.core.config;
        info!(
            "Starting {} with {} workers (spare {}..{}, max {})",
            config.service_name,
            config.start_processes,
            config.min_spare_processes,
            config.max_spare_processes,
            config.max_processes
        );

        self.core.pid_file = Some(PidFile::acquire(config.pid_file_path())?);
        let (server, selector) = IpcServer::bind(config.ipc_address, config.requeue)?;
        let selector = self.reactor.observe(selector, Duration::MAX);
        self.core.ipc = Some((server, selector));

        self.core.raise(LifecycleEvent::KernelStart)?;
        self.core.raise(LifecycleEvent::SchedulerStart)?;
        let initial = self.core.config.start_processes;
        for _ in 0..initial {
            self.core.create_worker();
        }
        Ok(())
    }

    /// Start if needed, supervise until terminating, then stop
    pub fn run(&mut self) -> Result<(), Error> {
        self.start()?;
        let result = self.reactor.main_loop(&mut self.core);
        if let Err(e) = &result {
            error!("Scheduler loop failed: {e}");
        }
        self.stop()?;
        result
    }

    /// Run one control-loop tick
    pub fn tick(&mut self) -> Result<(), Error> {
        self.reactor.tick(&mut self.core)?;
        self.core.on_tick(&mut self.reactor)
    }

    /// Publish a message to the pool as uid 0
    pub fn send(&mut self, audience: Audience, number: u64, message: impl Into<Message>) -> Result<(), Error> {
        let (server, selector) = self.core.ipc.as_mut().ok_or(Error::ChannelClosed)?;
        let selector = self.reactor.selector_mut(*selector).ok_or(Error::UnknownSelector(*selector))?;
        server.send(selector, audience, number, message);
        Ok(())
    }

    /// Non-status messages addressed to the scheduler since the last call
    pub fn take_messages(&mut self) -> Vec<Envelope> {
        core::mem::take(&mut self.core.received)
    }

    /// Hard-stop every worker and wait for the backend to confirm, then release
    /// the IPC bus and the pid-lock
    pub fn stop(&mut self) -> Result<(), Error> {
        let Some((mut server, selector)) = self.core.ipc.take() else {
            return Ok(());
        };
        self.core.terminating = true;
        self.reactor.set_terminating();
        info!("Stopping {} workers", self.core.workers.len());

        for uid in self.core.workers.uids() {
            self.core.stop_worker(uid, true);
        }

        let deadline = Instant::now() + self.core.config.shutdown_timeout();
        while !self.core.workers.is_empty() && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL);
            match self.core.flow.loop_tick() {
                Ok(events) => self.core.handle_events(events),
                Err(e) => error!("Backend failed while shutting down: {e}"),
            }
        }
        if !self.core.workers.is_empty() {
            warn!(
                "{} workers did not confirm their end within {:?}",
                self.core.workers.len(),
                self.core.config.shutdown_timeout()
            );
            self.core.workers.clear();
        }

        if let Err(e) = self.core.flow.raise(LifecycleEvent::SchedulerStop) {
            error!("Backend failed to stop: {e}");
        }
        if let Ok(mut selector) = self.reactor.unregister(selector) {
            server.close(&mut selector);
        }
        if let Some(mut pid_file) = self.core.pid_file.take() {
            pid_file.release()?;
        }
        info!("Scheduler stopped");
        Ok(())
    }
}

/// Control-loop state, driven by the reactor
struct SchedulerCore {
    config: SchedulerConfig,
    flow: WorkerFlowManager,
    workers: WorkerCollection,
    discipline: Box<dyn Discipline>,
    entry: WorkerEntry,
    ipc: Option<(IpcServer, SelectorId)>,
    pid_file: Option<PidFile>,
    shutdown: SignalTriggeredFlagRef,
    signals: Option<SignalTriggeredFlagRef>,
    /// Messages for the scheduler that are not status reports
    received: Vec<Envelope>,
    terminating: bool,
}

impl SchedulerCore {
    fn raise(&mut self, event: LifecycleEvent) -> Result<(), Error> {
        let events = self.flow.raise(event)?;
        self.handle_events(events);
        Ok(())
    }

    fn launch(&self) -> Option<WorkerLaunch> {
        let (server, _) = self.ipc.as_ref()?;
        Some(WorkerLaunch {
            settings: WorkerSettings {
                service_name: self.config.service_name.clone(),
                ipc_address: server.address(),
                max_tasks: self.config.max_process_tasks,
                worker_tick: self.config.worker_tick(),
            },
            entry: self.entry.clone(),
        })
    }

    fn create_worker(&mut self) {
        let Some(launch) = self.launch() else {
            return;
        };
        let Some(uid) = self.flow.start_worker(launch) else {
            return;
        };
        if let Err(e) = self.workers.insert(WorkerState::new(uid, self.config.service_name.as_str())) {
            error!("Cannot track worker {uid}: {e}");
            self.stop_worker(uid, true);
        }
    }

    fn stop_worker(&mut self, uid: WorkerId, hard: bool) {
        match self.flow.stop_worker(uid, hard, &mut self.workers) {
            Ok(events) => self.handle_events(events),
            Err(e) => error!("Failed to stop worker {uid}: {e}"),
        }
    }

    /// React to what the backend reported
    fn handle_events(&mut self, events: Vec<LifecycleEvent>) {
        for event in events {
            match event {
                LifecycleEvent::WorkerTerminated { uid, code } => self.on_terminated(uid, code),
                LifecycleEvent::SchedulerStop => {
                    warn!("Backend requested the scheduler to stop");
                    self.terminating = true;
                },
                other => trace!("Ignoring lifecycle event {:?}", other.kind()),
            }
        }
    }

    fn on_terminated(&mut self, uid: WorkerId, code: Option<i32>) {
        match self.workers.remove(uid) {
            Some(state) if matches!(state.code, WorkerStatus::Terminated | WorkerStatus::Exiting) => {
                debug!("Worker {uid} ended with {code:?}");
            },
            Some(state) => {
                let lifetime = state.age(SystemTime::now());
                error!(
                    "Worker {uid} ended prematurely with {code:?} after {:.3}s in status {:?}",
                    lifetime.as_secs_f64(),
                    state.code
                );
            },
            None => trace!("End of untracked worker {uid}"),
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        match envelope.message {
            Message::Status(report) => {
                let uid = report.uid;
                let code = report.code;
                if uid != envelope.sender_id {
                    warn!("Worker {} reported the status of {uid}", envelope.sender_id);
                    return;
                }
                if let Err(e) = self.workers.update(report) {
                    warn!("Ignoring status report of worker {uid}: {e}");
                    return;
                }
                let event = match code {
                    WorkerStatus::Exiting => LifecycleEvent::WorkerExit { uid },
                    _ => LifecycleEvent::WorkerLoop { uid },
                };
                if let Err(e) = self.raise(event) {
                    error!("Backend failed on the report of worker {uid}: {e}");
                }
            },
            message => self.received.push(Envelope { message, ..envelope }),
        }
    }

    /// Apply one decision of the discipline
    fn balance(&mut self) {
        let decision = self.discipline.decide(&self.workers, SystemTime::now());
        if decision.to_create > 0 || !decision.to_terminate.is_empty() {
            debug!(
                "Pool of {}: creating {}, retiring {:?}",
                self.workers.len(),
                decision.to_create,
                decision.to_terminate
            );
        }
        for _ in 0..decision.to_create {
            self.create_worker();
        }
        for uid in decision.to_terminate {
            self.stop_worker(uid, false);
        }
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.is_triggered() || self.signals.as_ref().is_some_and(SignalTriggeredFlagRef::is_triggered)
    }
}

impl ReactorHandler for SchedulerCore {
    fn on_ready(&mut self, id: SelectorId, selector: &mut Selector) -> Result<(), Error> {
        match self.ipc.as_mut() {
            Some((server, ipc)) if *ipc == id => server.on_ready(selector),
            _ => Ok(()),
        }
    }

    fn on_tick(&mut self, reactor: &mut Reactor) -> Result<(), Error> {
        // Reports first, so a worker that announced its exit is not taken for a crash when
        // it is reaped in the same tick
        let inbox = match self.ipc.as_mut() {
            Some((server, id)) => {
                let selector = reactor.selector_mut(*id).ok_or(Error::UnknownSelector(*id))?;
                for uid in server.sweep(selector) {
                    debug!("Worker {uid} left the IPC bus");
                }
                server.route(selector);
                server.take_inbox()
            },
            None => Vec::new(),
        };
        for envelope in inbox {
            self.on_envelope(envelope);
        }

        match self.flow.loop_tick() {
            Ok(events) => self.handle_events(events),
            Err(e) => error!("Backend failed in the control loop: {e}"),
        }

        if self.stop_requested() {
            self.terminating = true;
        }
        if self.terminating {
            reactor.set_terminating();
        } else {
            self.balance();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::ipc::SocketIpc;
    use crate::lifecycle::{Dispatch, LifecycleBus, LifecycleKind, LifecycleListener};
    use crate::mpm::{Isolation, SUBSCRIPTIONS};
    use crate::worker::launch::worker_entry;
    use crate::worker::{self, Service, ServiceFactory, Step, WorkerContext};
    use alloc::sync::Arc;
    use std::sync::Mutex;

    type Inbox = Arc<Mutex<Vec<String>>>;

    /// Idles, remembers text messages and completes a task for every "task"
    struct Recorder {
        inbox: Inbox,
        tasks: usize,
    }

    impl Service for Recorder {
        fn step(&mut self, _ctx: &mut WorkerContext) -> Result<Step, Error> {
            if self.tasks > 0 {
                self.tasks -= 1;
                return Ok(Step::Finished);
            }
            Ok(Step::Idle)
        }

        fn on_message(&mut self, ctx: &mut WorkerContext, envelope: Envelope) -> Result<(), Error> {
            if let Message::Text(text) = envelope.message {
                if text == "task" {
                    self.tasks += 1;
                }
                if text == "echo" {
                    ctx.send(Audience::Server, 0, format!("echo from {}", ctx.uid()))?;
                }
                self.inbox.lock().unwrap().push(text);
            }
            Ok(())
        }
    }

    fn factory(inbox: &Inbox) -> ServiceFactory {
        let inbox = Arc::clone(inbox);
        Arc::new(move || {
            Box::new(Recorder {
                inbox: Arc::clone(&inbox),
                tasks: 0,
            }) as Box<dyn Service>
        })
    }

    fn config(dir: &tempfile::TempDir) -> SchedulerConfig {
        SchedulerConfig {
            service_name: "scheduler-test".into(),
            start_processes: 2,
            max_processes: 4,
            min_spare_processes: 1,
            max_spare_processes: 3,
            ipc_directory: dir.path().to_path_buf(),
            backend: Backend::Thread,
            tick_interval_ms: 10,
            worker_tick_ms: 5,
            shutdown_timeout_ms: 2000,
            ..SchedulerConfig::default()
        }
    }

    fn tick_until(scheduler: &mut Scheduler, condition: impl Fn(&Scheduler) -> bool) -> bool {
        for _ in 0..500 {
            scheduler.tick().unwrap();
            if condition(scheduler) {
                return true;
            }
        }
        false
    }

    fn waiting(scheduler: &Scheduler) -> usize {
        scheduler
            .workers()
            .iter()
            .filter(|state| state.code == WorkerStatus::Waiting)
            .count()
    }

    #[test]
    fn starts_the_initial_pool_and_stops_it() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::default();
        let mut scheduler = Scheduler::new(config(&dir), worker::entry(factory(&inbox))).unwrap();
        assert_eq!(scheduler.capabilities().isolation, Isolation::Thread);

        scheduler.start().unwrap();
        let pid_file = scheduler.config().pid_file_path();
        assert!(pid_file.exists());
        assert!(tick_until(&mut scheduler, |s| waiting(s) == 2));

        scheduler.stop().unwrap();
        assert!(scheduler.workers().is_empty());
        assert!(!pid_file.exists());
        assert!(scheduler.ipc_address().is_none());
    }

    #[test]
    fn refuses_to_start_next_to_a_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::default();
        let config = config(&dir);
        std::fs::write(config.pid_file_path(), "1\n").unwrap();

        let mut scheduler = Scheduler::new(config, worker::entry(factory(&inbox))).unwrap();
        assert!(matches!(scheduler.start(), Err(Error::AlreadyRunning(1))));
        assert!(scheduler.ipc_address().is_none());
        assert!(scheduler.workers().is_empty());
    }

    #[test]
    fn broadcasts_reach_every_worker_and_replies_come_back() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::default();
        let mut scheduler = Scheduler::new(config(&dir), worker::entry(factory(&inbox))).unwrap();
        scheduler.start().unwrap();
        assert!(tick_until(&mut scheduler, |s| waiting(s) == 2));

        scheduler.send(Audience::All, 0, "echo").unwrap();
        let mut replies = Vec::new();
        for _ in 0..500 {
            scheduler.tick().unwrap();
            replies.extend(scheduler.take_messages());
            if replies.len() == 2 {
                break;
            }
        }
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|e| matches!(&e.message, Message::Text(t) if t.starts_with("echo from"))));
        assert_eq!(inbox.lock().unwrap().iter().filter(|t| *t == "echo").count(), 2);

        scheduler.stop().unwrap();
    }

    #[test]
    fn workers_at_their_task_limit_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::default();
        let config = SchedulerConfig {
            start_processes: 1,
            max_process_tasks: 1,
            ..config(&dir)
        };
        let mut scheduler = Scheduler::new(config, worker::entry(factory(&inbox))).unwrap();
        scheduler.start().unwrap();
        assert!(tick_until(&mut scheduler, |s| waiting(s) == 1));
        let first = scheduler.workers().uids();

        scheduler.send(Audience::Any, 0, "task").unwrap();
        assert!(tick_until(&mut scheduler, |s| {
            waiting(s) >= 1 && s.workers().uids().iter().all(|uid| !first.contains(uid))
        }));

        scheduler.stop().unwrap();
        assert!(scheduler.workers().is_empty());
    }

    #[test]
    fn shutdown_handle_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::default();
        let mut scheduler = Scheduler::new(config(&dir), worker::entry(factory(&inbox))).unwrap();
        let handle = scheduler.shutdown_handle();

        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            handle.trigger();
        });
        scheduler.run().unwrap();
        trigger.join().unwrap();

        assert!(scheduler.is_terminating());
        assert!(scheduler.workers().is_empty());
        assert!(!scheduler.config().pid_file_path().exists());
    }

    /// Workers that exist only as uids, ended when the test says so
    #[derive(Default)]
    struct Script {
        created: Vec<WorkerId>,
        ending: Vec<WorkerId>,
        exits: Vec<WorkerId>,
    }

    struct ScriptedBackend(Arc<Mutex<Script>>);

    impl LifecycleListener for ScriptedBackend {
        fn on_event(&mut self, event: &LifecycleEvent, dispatch: &mut Dispatch) -> Result<(), Error> {
            let mut script = self.0.lock().unwrap();
            match event {
                LifecycleEvent::WorkerCreate(_) => {
                    let uid = WorkerId::new(1000 + script.created.len() as u64);
                    script.created.push(uid);
                    dispatch.emit(LifecycleEvent::WorkerCreated { uid });
                },
                LifecycleEvent::WorkerExit { uid } => script.exits.push(*uid),
                LifecycleEvent::WorkerTerminate { uid, .. } => {
                    dispatch.emit(LifecycleEvent::WorkerTerminated { uid: *uid, code: None });
                },
                LifecycleEvent::SchedulerLoop => {
                    for uid in script.ending.drain(..) {
                        dispatch.emit(LifecycleEvent::WorkerTerminated { uid, code: Some(0) });
                    }
                },
                _ => (),
            }
            Ok(())
        }
    }

    impl MultiProcessingModule for ScriptedBackend {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                isolation: Isolation::Process,
            }
        }

        fn is_supported(_throw_on_failure: bool) -> Result<bool, Error> {
            Ok(true)
        }

        fn into_listener(self: Box<Self>) -> Box<dyn LifecycleListener> {
            self
        }

        fn attach(self: Box<Self>, bus: &mut LifecycleBus) -> Capabilities {
            let capabilities = self.capabilities();
            let mut kinds = SUBSCRIPTIONS.to_vec();
            kinds.push((LifecycleKind::WorkerExit, 0));
            bus.subscribe(self.into_listener(), &kinds);
            capabilities
        }
    }

    #[test]
    fn exit_report_is_handled_before_the_reap_of_the_same_tick() {
        let dir = tempfile::tempdir().unwrap();
        let script = Arc::new(Mutex::new(Script::default()));
        let config = SchedulerConfig {
            start_processes: 1,
            ..config(&dir)
        };
        let backend = Box::new(ScriptedBackend(Arc::clone(&script)));
        let mut scheduler = Scheduler::with_backend(config, worker_entry(|_, _, _| 0), backend).unwrap();
        scheduler.start().unwrap();
        let uid = script.lock().unwrap().created[0];

        let address = scheduler.ipc_address().unwrap();
        let mut client = SocketIpc::connect(address, uid, Duration::from_secs(2)).unwrap();
        let mut state = WorkerState::new(uid, "scheduler-test");
        state.set_status(WorkerStatus::Waiting);
        client.send(Audience::Server, 0, state.clone()).unwrap();
        client.flush_blocking(Duration::from_secs(2)).unwrap();
        assert!(tick_until(&mut scheduler, |s| waiting(s) == 1));

        state.set_status(WorkerStatus::Exiting);
        client.send(Audience::Server, 0, state).unwrap();
        client.flush_blocking(Duration::from_secs(2)).unwrap();
        thread::sleep(Duration::from_millis(50));

        // The worker is gone by the time its last report is read
        script.lock().unwrap().ending.push(uid);
        scheduler.tick().unwrap();

        assert_eq!(script.lock().unwrap().exits, [uid]);
        assert!(!scheduler.workers().uids().contains(&uid));
        scheduler.stop().unwrap();
    }
}
