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

//! Bridge to the OS readiness poll
//!
//! [Selector](crate::io::selector::Selector) and [Reactor](crate::io::reactor::Reactor)
//! never call the OS directly but go through a [Poller] handed to them at construction.

use crate::ids::StreamId;
use crate::io::ops::Ops;
use core::time::Duration;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Readiness reported by the OS for one file descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.hangup || self.error)
    }
}

/// One file descriptor handed to a [Poller]
#[derive(Debug, Clone)]
pub struct PollEntry {
    /// Stream the descriptor belongs to
    pub id: StreamId,
    /// Raw descriptor to poll
    pub fd: RawFd,
    /// Operations the owner is interested in
    pub interest: Ops,
    /// Filled in by the poller
    pub readiness: Readiness,
}

/// OS-level readiness poll
pub trait Poller: Send + Sync {
    /// Wait until at least one entry is ready or `timeout` expired
    ///
    /// `None` waits indefinitely. Returns the number of entries with non-empty readiness.
    fn poll(&self, entries: &mut [PollEntry], timeout: Option<Duration>) -> io::Result<usize>;
}

/// [Poller] backed by `poll(2)`
#[derive(Debug, Default, Clone, Copy)]
pub struct SysPoller;

impl Poller for SysPoller {
    fn poll(&self, entries: &mut [PollEntry], timeout: Option<Duration>) -> io::Result<usize> {
        let mut fds: Vec<libc::pollfd> = entries
            .iter()
            .map(|entry| {
                let mut events: libc::c_short = 0;
                if entry.interest.intersects(Ops::READ | Ops::ACCEPT) {
                    events |= libc::POLLIN;
                }
                if entry.interest.contains(Ops::WRITE) {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd: entry.fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        let timeout_ms = match timeout {
            None => -1,
            // Round up so that sub-millisecond budgets do not degrade into busy polling
            Some(d) => d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as libc::c_int,
        };

        // Safety: `fds` is a valid, exclusively borrowed array of `fds.len()` pollfd structs
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        for (entry, fd) in entries.iter_mut().zip(fds.iter()) {
            entry.readiness = Readiness {
                readable: fd.revents & (libc::POLLIN | libc::POLLPRI) != 0,
                writable: fd.revents & libc::POLLOUT != 0,
                hangup: fd.revents & libc::POLLHUP != 0,
                error: fd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            };
        }

        Ok(rc as usize)
    }
}

/// Trait extending methods available on file descriptors
pub(crate) trait FdExt {
    fn set_nonblocking(&self) -> io::Result<()>;
}

impl<T> FdExt for T
where
    T: AsRawFd,
{
    /// Set the descriptor nonblocking
    ///
    /// Pipes have no `set_nonblocking` in std, so this goes through `fcntl` for every kind.
    fn set_nonblocking(&self) -> io::Result<()> {
        let fd = self.as_raw_fd();

        // Safety: fd is available since T implements AsRawFd
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }

        // Safety: fd is available since T implements AsRawFd and flags
        // is the valid value returned by the previous call to libc::fcntl
        let err = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if err != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

/// Bind a listener that other processes can bind to the same address
///
/// With `SO_REUSEPORT` every worker process owns a listener on the service port and the
/// kernel spreads incoming connections across them. Only IPv4 is supported.
pub fn reuse_port_listener(address: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let SocketAddr::V4(v4) = address else {
        return Err(io::Error::new(io::ErrorKind::Unsupported, "only IPv4 listeners support port reuse"));
    };

    // Safety: plain socket creation, the result is checked before use
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: fd is a freshly created descriptor owned by nobody else
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    for option in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
        let enable: libc::c_int = 1;
        // Safety: the option value points to a live c_int of the given size
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                option,
                (&enable as *const libc::c_int).cast(),
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: v4.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*v4.ip()).to_be(),
        },
        sin_zero: [0; 8],
    };
    // Safety: addr is a valid sockaddr_in and the length matches its size
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&addr as *const libc::sockaddr_in).cast(),
            core::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // Safety: fd is a bound stream socket
    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TcpListener::from(fd))
}
