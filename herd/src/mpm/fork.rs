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

//! Workers in child processes created with `fork`

use crate::error::Error;
use crate::ids::WorkerId;
use crate::lifecycle::{Dispatch, LifecycleEvent, LifecycleListener};
use crate::mpm::{Capabilities, Isolation, MultiProcessingModule};
use crate::os_signals::SignalTriggeredFlagRef;
use crate::worker::launch::WorkerLaunch;
use alloc::collections::BTreeSet;
use herd_log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid};
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::{fs, process};

/// Signals restored to their default disposition in a fresh child
const RESET_SIGNALS: [Signal; 7] = [
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// Exit code of a forked worker whose entry panicked
pub const PANIC_EXIT_CODE: i32 = 70;

/// Side of a completed fork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    Parent { child: i32 },
    Child,
}

/// Process syscalls used by [ForkBackend]
pub trait ProcessOps {
    fn fork(&mut self) -> Result<Forked, Error>;

    fn kill(&mut self, pid: i32, signal: Signal) -> nix::Result<()>;

    /// Reap one terminated child without blocking
    ///
    /// Returns its pid and exit code, the code is `None` for children killed by a signal.
    fn reap(&mut self) -> Result<Option<(i32, Option<i32>)>, Error>;

    fn parent_pid(&self) -> i32;

    /// Restore default signal dispositions and an empty signal mask in a fresh child
    fn reset_signals(&mut self);

    /// Close every descriptor above stdio that a fresh child inherited
    fn close_inherited(&mut self);
}

/// [ProcessOps] backed by the real system calls
#[derive(Debug, Default, Clone, Copy)]
pub struct NixProcessOps;

impl ProcessOps for NixProcessOps {
    fn fork(&mut self) -> Result<Forked, Error> {
        // Safety: the child only runs the worker entry and exits without returning
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { child }) => Ok(Forked::Parent { child: child.as_raw() }),
            Ok(ForkResult::Child) => Ok(Forked::Child),
            Err(e) => Err(Error::Spawn((e.into(), "fork failed"))),
        }
    }

    fn kill(&mut self, pid: i32, signal: Signal) -> nix::Result<()> {
        signal::kill(Pid::from_raw(pid), signal)
    }

    fn reap(&mut self) -> Result<Option<(i32, Option<i32>)>, Error> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(None),
                Ok(WaitStatus::Exited(pid, code)) => return Ok(Some((pid.as_raw(), Some(code)))),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    trace!("Child {pid} killed by {signal}");
                    return Ok(Some((pid.as_raw(), None)));
                },
                // Stopped and continued children are still alive
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn parent_pid(&self) -> i32 {
        unistd::getppid().as_raw()
    }

    fn reset_signals(&mut self) {
        for sig in RESET_SIGNALS {
            // Safety: installing the default disposition has no handler to race with
            if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigDfl) } {
                warn!("Failed to reset {sig}: {e}");
            }
        }
        if let Err(e) = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None) {
            warn!("Failed to clear the signal mask: {e}");
        }
    }

    fn close_inherited(&mut self) {
        let fds: Vec<RawFd> = match fs::read_dir("/proc/self/fd") {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
                .filter(|fd| *fd > libc::STDERR_FILENO)
                .collect(),
            Err(e) => {
                warn!("Cannot list inherited descriptors: {e}");
                return;
            },
        };
        // The directory's own descriptor is in the list and already closed
        for fd in fds {
            match unistd::close(fd) {
                Ok(()) | Err(Errno::EBADF) => (),
                Err(e) => warn!("Failed to close inherited descriptor {fd}: {e}"),
            }
        }
    }
}

/// Backend forking one child process per worker; the uid is the child's pid
pub struct ForkBackend<P: ProcessOps = NixProcessOps> {
    ops: P,
    children: BTreeSet<WorkerId>,
    parent_pid: Option<i32>,
}

impl<P: ProcessOps> ForkBackend<P> {
    pub fn new(ops: P) -> Self {
        Self {
            ops,
            children: BTreeSet::new(),
            parent_pid: None,
        }
    }

    /// uids of children not yet reaped
    pub fn children(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.children.iter().copied()
    }

    fn create(&mut self, launch: &WorkerLaunch, dispatch: &mut Dispatch) -> Result<(), Error> {
        match self.ops.fork()? {
            Forked::Parent { child } => {
                let uid = WorkerId::new(child as u64);
                self.children.insert(uid);
                debug!("Forked worker {uid}");
                dispatch.emit(LifecycleEvent::WorkerCreated { uid });
                Ok(())
            },
            Forked::Child => self.run_child(launch),
        }
    }

    /// Run the worker in the child and exit
    ///
    /// Must never unwind: the frames below belong to the scheduler the child was forked
    /// from, and their destructors would release the scheduler's pid lock and sockets.
    fn run_child(&mut self, launch: &WorkerLaunch) -> ! {
        self.ops.reset_signals();
        self.ops.close_inherited();
        let uid = WorkerId::new(u64::from(process::id()));
        let code = match SignalTriggeredFlagRef::forked_termination() {
            Ok(stop) => {
                trace!("Worker {uid} initializing");
                let entry = AssertUnwindSafe(|| (launch.entry)(uid, &launch.settings, stop));
                panic::catch_unwind(entry).unwrap_or_else(|_| {
                    error!("Worker {uid} panicked");
                    PANIC_EXIT_CODE
                })
            },
            Err(e) => {
                error!("Worker {uid} cannot watch termination signals: {e}");
                1
            },
        };
        process::exit(code)
    }

    fn terminate(&mut self, uid: WorkerId, hard: bool, dispatch: &mut Dispatch) {
        let signal = if hard { Signal::SIGKILL } else { Signal::SIGINT };
        match self.ops.kill(uid.id() as i32, signal) {
            Ok(()) => debug!("Sent {signal} to worker {uid}"),
            Err(Errno::ESRCH) => {
                debug!("Worker {uid} is already gone");
                self.children.remove(&uid);
                dispatch.emit(LifecycleEvent::WorkerTerminated { uid, code: None });
            },
            Err(e) => warn!("Failed to send {signal} to worker {uid}: {e}"),
        }
    }

    fn reap(&mut self, dispatch: &mut Dispatch) {
        loop {
            // Children reaped so far must still be reported
            let (pid, code) = match self.ops.reap() {
                Ok(Some(reaped)) => reaped,
                Ok(None) => break,
                Err(e) => {
                    warn!("Reaping workers failed: {e}");
                    break;
                },
            };
            let uid = WorkerId::new(pid as u64);
            if !self.children.remove(&uid) {
                trace!("Reaped foreign child {pid}");
                continue;
            }
            debug!("Worker {uid} exited with {code:?}");
            dispatch.emit(LifecycleEvent::WorkerTerminated { uid, code });
        }

        if let Some(expected) = self.parent_pid {
            let current = self.ops.parent_pid();
            if current != expected {
                warn!("Parent process {expected} is gone (now {current}), stopping");
                self.parent_pid = Some(current);
                dispatch.emit(LifecycleEvent::SchedulerStop);
            }
        }
    }
}

impl<P: ProcessOps> LifecycleListener for ForkBackend<P> {
    fn on_event(&mut self, event: &LifecycleEvent, dispatch: &mut Dispatch) -> Result<(), Error> {
        match event {
            LifecycleEvent::KernelStart => {
                self.parent_pid = Some(self.ops.parent_pid());
                Ok(())
            },
            LifecycleEvent::SchedulerStart => {
                info!("Running workers in forked processes");
                Ok(())
            },
            LifecycleEvent::WorkerCreate(launch) => self.create(launch, dispatch),
            LifecycleEvent::WorkerLoop { uid } => {
                trace!("Worker {uid} loop");
                Ok(())
            },
            LifecycleEvent::WorkerTerminate { uid, hard } => {
                self.terminate(*uid, *hard, dispatch);
                Ok(())
            },
            LifecycleEvent::SchedulerLoop => {
                self.reap(dispatch);
                Ok(())
            },
            _ => Ok(()),
        }
    }
}

impl<P: ProcessOps + 'static> MultiProcessingModule for ForkBackend<P> {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            isolation: Isolation::Process,
        }
    }

    fn is_supported(_throw_on_failure: bool) -> Result<bool, Error> {
        Ok(cfg!(unix))
    }

    fn into_listener(self: Box<Self>) -> Box<dyn LifecycleListener> {
        self
    }
}
