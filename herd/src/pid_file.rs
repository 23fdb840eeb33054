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

//! Pid-lock file guarding one scheduler per service

use crate::error::Error;
use herd_log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

/// Exclusive claim on a pid file, released on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    released: bool,
}

impl PidFile {
    /// Write the own pid to `path`
    ///
    /// Fails with [Error::AlreadyRunning] if the file names another live process.
    /// Files left behind by dead processes are replaced.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let own = process::id() as i32;

        if let Ok(contents) = fs::read_to_string(&path) {
            match contents.trim().parse::<i32>() {
                Ok(pid) if pid != own && is_alive(pid) => return Err(Error::AlreadyRunning(pid)),
                Ok(pid) if pid != own => warn!("Replacing stale pid file {} of pid {pid}", path.display()),
                Ok(_) => {},
                Err(_) => warn!("Replacing malformed pid file {}", path.display()),
            }
        }

        fs::write(&path, format!("{own}\n")).map_err(|e| Error::Io((e, "failed to write pid file")))?;
        debug!("Acquired pid file {}", path.display());
        Ok(Self { path, released: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file; later calls are no-ops
    pub fn release(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Released pid file {}", self.path.display());
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io((e, "failed to remove pid file"))),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{e}");
        }
    }
}

/// Whether a process with `pid` exists
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
