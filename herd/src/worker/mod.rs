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

//! Worker runtime
//!
//! A worker connects to the scheduler's IPC bus, reports `WAITING` and then alternates
//! between receiving envelopes and stepping its [Service]. Status changes are pushed to
//! the scheduler as [Message::Status] envelopes.

pub mod collection;
pub mod launch;
pub mod state;

use crate::error::Error;
use crate::ids::WorkerId;
use crate::ipc::{Audience, Command, Envelope, Message, SocketIpc};
use crate::os_signals::SignalTriggeredFlagRef;
use crate::worker::launch::{WorkerEntry, WorkerSettings, worker_entry};
use crate::worker::state::{WorkerState, WorkerStatus};
use alloc::sync::Arc;
use core::time::Duration;
use herd_log::{debug, error, info, warn};
use std::process;

/// Time a worker waits for the scheduler's IPC bus
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a leaving worker waits for its last status report to be written
const EXIT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of one [Service::step]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing to do, the worker may block on its IPC connection
    Idle,
    /// A task is in progress
    Busy,
    /// A task was completed
    Finished,
}

/// The workload run by a worker
pub trait Service: Send {
    fn start(&mut self, _ctx: &mut WorkerContext) -> Result<(), Error> {
        Ok(())
    }

    /// Make progress without blocking for longer than one worker tick
    fn step(&mut self, ctx: &mut WorkerContext) -> Result<Step, Error>;

    fn on_message(&mut self, _ctx: &mut WorkerContext, _envelope: Envelope) -> Result<(), Error> {
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut WorkerContext) {}
}

/// Creates a fresh service in every worker
pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// What a [Service] sees of its worker
pub struct WorkerContext {
    state: WorkerState,
    ipc: SocketIpc,
    stop: SignalTriggeredFlagRef,
    exit_requested: bool,
}

impl WorkerContext {
    pub fn uid(&self) -> WorkerId {
        self.state.uid
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Send a message over the IPC bus
    pub fn send(&mut self, audience: Audience, number: u64, message: impl Into<Message>) -> Result<(), Error> {
        self.ipc.send(audience, number, message)
    }

    /// Describe what the worker is doing in its next status report
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.state.status_description = description.into();
    }

    /// Leave after the current step
    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    pub fn is_terminating(&self) -> bool {
        self.exit_requested || self.stop.is_triggered()
    }

    fn report(&mut self) -> Result<(), Error> {
        self.state.sample_cpu_times();
        let state = self.state.clone();
        self.ipc.send(Audience::Server, 0, state)
    }

    /// Move to `status` and report it, unless already there
    fn transition(&mut self, status: WorkerStatus) -> Result<(), Error> {
        if self.state.code != status && self.state.set_status(status) {
            self.report()?;
        }
        Ok(())
    }
}

/// One worker, connected to the scheduler
pub struct Worker {
    ctx: WorkerContext,
    service: Box<dyn Service>,
    max_tasks: u64,
    tick: Duration,
}

impl Worker {
    /// Connect to the IPC bus named in `settings`
    pub fn connect(
        uid: WorkerId,
        settings: &WorkerSettings,
        stop: SignalTriggeredFlagRef,
        service: Box<dyn Service>,
    ) -> Result<Self, Error> {
        let ipc = SocketIpc::connect(settings.ipc_address, uid, CONNECT_TIMEOUT)?;
        let mut state = WorkerState::new(uid, settings.service_name.as_str());
        state.thread_id = herd_logger::thread::current().into();

        Ok(Self {
            ctx: WorkerContext {
                state,
                ipc,
                stop,
                exit_requested: false,
            },
            service,
            max_tasks: settings.max_tasks,
            tick: settings.worker_tick,
        })
    }

    /// Serve until asked to stop, returning the exit code
    pub fn run(mut self) -> Result<i32, Error> {
        let uid = self.ctx.uid();
        let result = self.serve();

        match self.ctx.transition(WorkerStatus::Exiting) {
            Ok(()) => {
                if let Err(e) = self.ctx.ipc.flush_blocking(EXIT_FLUSH_TIMEOUT) {
                    debug!("Worker {uid} could not deliver its exit report: {e}");
                }
            },
            Err(e) => debug!("Worker {uid} could not report its exit: {e}"),
        }
        self.service.stop(&mut self.ctx);

        info!("Worker {uid} exiting after {} tasks", self.ctx.state.tasks_finished);
        result.map(|()| 0)
    }

    fn serve(&mut self) -> Result<(), Error> {
        let uid = self.ctx.uid();
        self.service.start(&mut self.ctx)?;
        self.ctx.transition(WorkerStatus::Waiting)?;

        let mut busy = false;
        while !self.ctx.is_terminating() {
            let timeout = if busy { Duration::ZERO } else { self.tick };
            match self.ctx.ipc.receive(timeout) {
                Ok(Some(envelope)) => self.dispatch(envelope)?,
                Ok(None) => {},
                Err(Error::ChannelClosed) => {
                    warn!("Worker {uid} lost the scheduler");
                    return Ok(());
                },
                Err(e) => return Err(e),
            }
            if self.ctx.is_terminating() {
                break;
            }

            match self.service.step(&mut self.ctx)? {
                Step::Idle => {
                    busy = false;
                    self.ctx.transition(WorkerStatus::Waiting)?;
                },
                Step::Busy => {
                    busy = true;
                    self.ctx.transition(WorkerStatus::Running)?;
                },
                Step::Finished => {
                    busy = false;
                    self.ctx.state.finish_task();
                    self.ctx.state.set_status(WorkerStatus::Waiting);
                    self.ctx.report()?;
                    if self.max_tasks != 0 && self.ctx.state.tasks_finished >= self.max_tasks {
                        debug!("Worker {uid} reached its task limit");
                        return Ok(());
                    }
                },
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<(), Error> {
        match envelope.message {
            Message::Command(Command::Stop) => {
                debug!("Worker {} asked to stop by {}", self.ctx.uid(), envelope.sender_id);
                self.ctx.request_exit();
                Ok(())
            },
            _ => self.service.on_message(&mut self.ctx, envelope),
        }
    }
}

/// Entry point running services made by `factory`, for fork and thread workers
pub fn entry(factory: ServiceFactory) -> WorkerEntry {
    worker_entry(move |uid, settings, stop| {
        match Worker::connect(uid, settings, stop, factory()).and_then(Worker::run) {
            Ok(code) => code,
            Err(e) => {
                error!("Worker {uid} failed: {e}");
                1
            },
        }
    })
}

/// Entry point of a spawned worker process, configured through the environment
pub fn run_from_env(factory: ServiceFactory) -> Result<i32, Error> {
    let settings = WorkerSettings::from_env()?;
    let uid = WorkerId::new(u64::from(process::id()));
    let stop = SignalTriggeredFlagRef::termination()?;
    Worker::connect(uid, &settings, stop, factory())?.run()
}
