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

//! Workers in subprocesses started from a program image
//!
//! The child learns its settings from the environment and reports its own pid as uid.
//! Its stdout and stderr are piped and relayed to the scheduler's own streams once per
//! control-loop tick.

use crate::error::Error;
use crate::ids::{StreamId, WorkerId};
use crate::io::{Ops, Selector, Stream};
use crate::lifecycle::{Dispatch, LifecycleEvent, LifecycleListener};
use crate::mpm::{Capabilities, Isolation, MultiProcessingModule, unsupported};
use crate::worker::launch::WorkerLaunch;
use alloc::collections::BTreeMap;
use core::time::Duration;
use herd_log::{debug, info, trace, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

const RELAY_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Stdout,
    Stderr,
}

/// Attachment of a relayed pipe
struct Relay {
    uid: WorkerId,
    channel: Channel,
}

struct SpawnedWorker {
    child: Child,
    pipes: Vec<StreamId>,
}

/// Backend running each worker as a subprocess
pub struct SpawnBackend {
    program: PathBuf,
    args: Vec<String>,
    workers: BTreeMap<WorkerId, SpawnedWorker>,
    relay: Selector,
    stdout: Box<dyn Write>,
    stderr: Box<dyn Write>,
}

impl SpawnBackend {
    pub fn new(program: impl AsRef<Path>, args: &[String]) -> Self {
        Self::with_sinks(program, args, Box::new(io::stdout()), Box::new(io::stderr()))
    }

    /// Relay child output to `stdout` and `stderr` instead of the own streams
    pub fn with_sinks(
        program: impl AsRef<Path>,
        args: &[String],
        stdout: Box<dyn Write>,
        stderr: Box<dyn Write>,
    ) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: args.to_vec(),
            workers: BTreeMap::new(),
            relay: Selector::new(),
            stdout,
            stderr,
        }
    }

    fn create(&mut self, launch: &WorkerLaunch, dispatch: &mut Dispatch) -> Result<(), Error> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(launch.settings.to_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn((e, "failed to spawn worker process")))?;

        let uid = WorkerId::new(u64::from(child.id()));
        let mut pipes = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pipes.push(self.register_pipe(Stream::pipe(stdout)?, uid, Channel::Stdout)?);
        }
        if let Some(stderr) = child.stderr.take() {
            pipes.push(self.register_pipe(Stream::pipe(stderr)?, uid, Channel::Stderr)?);
        }

        debug!("Spawned worker {uid} from {}", self.program.display());
        self.workers.insert(uid, SpawnedWorker { child, pipes });
        dispatch.emit(LifecycleEvent::WorkerCreated { uid });
        Ok(())
    }

    fn register_pipe(&mut self, stream: Stream, uid: WorkerId, channel: Channel) -> Result<StreamId, Error> {
        let id = self.relay.register(stream, Ops::READ)?;
        if let Some(key) = self.relay.key_mut(id) {
            key.attach(Relay { uid, channel });
        }
        Ok(id)
    }

    fn terminate(&mut self, uid: WorkerId, hard: bool, dispatch: &mut Dispatch) {
        let Some(worker) = self.workers.get_mut(&uid) else {
            debug!("Worker {uid} is already gone");
            dispatch.emit(LifecycleEvent::WorkerTerminated { uid, code: None });
            return;
        };

        if !hard {
            match signal::kill(Pid::from_raw(worker.child.id() as i32), Signal::SIGINT) {
                Ok(()) | Err(Errno::ESRCH) => {},
                Err(e) => warn!("Failed to interrupt worker {uid}: {e}"),
            }
            return;
        }

        for id in core::mem::take(&mut worker.pipes) {
            if let Some(mut pipe) = self.relay.remove(id) {
                let _ = pipe.close();
            }
        }
        if let Err(e) = worker.child.kill() {
            warn!("Failed to kill worker {uid}: {e}");
        }
    }

    /// Copy whatever the children wrote since the last tick
    fn relay_output(&mut self) -> Result<(), Error> {
        if self.relay.select(Some(Duration::ZERO))? == 0 {
            return Ok(());
        }
        for id in self.relay.ready_ids() {
            self.drain_pipe(id);
        }
        Ok(())
    }

    /// Read a pipe until it would block, dropping it at end of stream
    fn drain_pipe(&mut self, id: StreamId) {
        let Some(key) = self.relay.key_mut(id) else {
            return;
        };
        let (stream, Some(relay)) = key.stream_and_attachment::<Relay>() else {
            return;
        };
        let sink = match relay.channel {
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
        };
        let uid = relay.uid;

        let mut chunk = [0u8; RELAY_CHUNK];
        let finished = loop {
            match stream.read(&mut chunk) {
                Ok(0) => break true,
                Ok(n) => {
                    if let Err(e) = sink.write_all(&chunk[..n]) {
                        warn!("Failed to relay output of worker {uid}: {e}");
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => {
                    trace!("Pipe of worker {uid} failed: {e}");
                    break true;
                },
            }
        };
        let _ = sink.flush();

        if finished && let Some(mut pipe) = self.relay.remove(id) {
            let _ = pipe.close();
            if let Some(worker) = self.workers.get_mut(&uid) {
                worker.pipes.retain(|pipe| *pipe != id);
            }
        }
    }

    fn reap(&mut self, dispatch: &mut Dispatch) -> Result<(), Error> {
        self.relay_output()?;

        let mut exited = Vec::new();
        for (uid, worker) in self.workers.iter_mut() {
            match worker.child.try_wait() {
                Ok(Some(status)) => exited.push((*uid, status.code())),
                Ok(None) => {},
                Err(e) => warn!("Failed to poll worker {uid}: {e}"),
            }
        }

        for (uid, code) in exited {
            if let Some(worker) = self.workers.remove(&uid) {
                // Output written right before exiting is still buffered in the pipes
                for id in worker.pipes {
                    self.drain_pipe(id);
                    if let Some(mut pipe) = self.relay.remove(id) {
                        let _ = pipe.close();
                    }
                }
            }
            debug!("Worker {uid} exited with {code:?}");
            dispatch.emit(LifecycleEvent::WorkerTerminated { uid, code });
        }
        Ok(())
    }
}

impl LifecycleListener for SpawnBackend {
    fn on_event(&mut self, event: &LifecycleEvent, dispatch: &mut Dispatch) -> Result<(), Error> {
        match event {
            LifecycleEvent::SchedulerStart => {
                info!("Running workers as {}", self.program.display());
                Ok(())
            },
            LifecycleEvent::WorkerCreate(launch) => self.create(launch, dispatch),
            LifecycleEvent::WorkerTerminate { uid, hard } => {
                self.terminate(*uid, *hard, dispatch);
                Ok(())
            },
            LifecycleEvent::SchedulerLoop => self.reap(dispatch),
            _ => Ok(()),
        }
    }
}

impl MultiProcessingModule for SpawnBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            isolation: Isolation::Process,
        }
    }

    fn is_supported(throw_on_failure: bool) -> Result<bool, Error> {
        if cfg!(unix) {
            Ok(true)
        } else {
            unsupported(throw_on_failure, "subprocess workers need a unix host")
        }
    }

    fn into_listener(self: Box<Self>) -> Box<dyn LifecycleListener> {
        self
    }
}
