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

//! Single-owner stream handle
//!
//! One handle type covers every descriptor kind the selector layer multiplexes:
//! listening sockets, connected sockets, pipes and plain files. All of them are put
//! into non-blocking mode on construction.

use crate::error::Error;
use crate::ids::StreamId;
use crate::io::sys::FdExt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Kind of descriptor behind a [Stream]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Listener,
    Socket,
    Pipe,
    File,
}

enum Handle {
    Listener(TcpListener),
    Socket(TcpStream),
    Pipe(File),
    File(File),
}

impl Handle {
    fn raw_fd(&self) -> RawFd {
        match self {
            Handle::Listener(l) => l.as_raw_fd(),
            Handle::Socket(s) => s.as_raw_fd(),
            Handle::Pipe(f) | Handle::File(f) => f.as_raw_fd(),
        }
    }
}

/// Stream handle with exactly one owner
///
/// Closing is explicit; a closed handle keeps its [StreamId] so that selectors can
/// still find and prune it.
pub struct Stream {
    id: StreamId,
    kind: StreamKind,
    handle: Option<Handle>,
}

impl Stream {
    fn with_handle(kind: StreamKind, handle: Handle) -> Self {
        /// Next stream id, process-wide
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        Self {
            id: StreamId::from(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            handle: Some(handle),
        }
    }

    /// Wrap a listening socket
    pub fn listener(listener: TcpListener) -> Result<Self, Error> {
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Io((e, "failed to set listener non-blocking")))?;
        Ok(Self::with_handle(StreamKind::Listener, Handle::Listener(listener)))
    }

    /// Wrap a connected socket
    pub fn socket(stream: TcpStream) -> Result<Self, Error> {
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::Io((e, "failed to set socket non-blocking")))?;
        // Frames are small and latency matters more than throughput
        let _ = stream.set_nodelay(true);
        Ok(Self::with_handle(StreamKind::Socket, Handle::Socket(stream)))
    }

    /// Wrap one end of a pipe, e.g. a child's stdout
    pub fn pipe(fd: impl Into<OwnedFd>) -> Result<Self, Error> {
        let file = File::from(fd.into());
        <File as FdExt>::set_nonblocking(&file)
            .map_err(|e| Error::Io((e, "failed to set pipe non-blocking")))?;
        Ok(Self::with_handle(StreamKind::Pipe, Handle::Pipe(file)))
    }

    /// Wrap a regular file
    pub fn file(file: File) -> Self {
        Self::with_handle(StreamKind::File, Handle::File(file))
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Close the underlying descriptor
    ///
    /// Closing twice is a programming error.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.handle.take() {
            Some(Handle::Socket(socket)) => {
                // Wake up the peer even if the descriptor is shared with a forked child
                let _ = socket.shutdown(Shutdown::Both);
                Ok(())
            },
            Some(_) => Ok(()),
            None => Err(Error::StreamClosed(self.id)),
        }
    }

    /// Accept one pending connection, `None` if there is none right now
    pub fn accept(&mut self) -> io::Result<Option<(Stream, SocketAddr)>> {
        let Some(Handle::Listener(listener)) = &self.handle else {
            return Err(io::ErrorKind::InvalidInput.into());
        };

        match listener.accept() {
            Ok((socket, peer)) => {
                let stream = Stream::socket(socket).map_err(|e| match e {
                    Error::Io((e, _)) => e,
                    _ => io::ErrorKind::Other.into(),
                })?;
                Ok(Some((stream, peer)))
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Local address of a socket stream
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.handle {
            Some(Handle::Listener(l)) => l.local_addr(),
            Some(Handle::Socket(s)) => s.local_addr(),
            _ => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    /// Raw descriptor, `None` once closed
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.handle.as_ref().map(Handle::raw_fd)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.handle {
            Some(Handle::Socket(s)) => s.read(buf),
            Some(Handle::Pipe(f)) | Some(Handle::File(f)) => f.read(buf),
            Some(Handle::Listener(_)) => Err(io::ErrorKind::InvalidInput.into()),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.handle {
            Some(Handle::Socket(s)) => s.write(buf),
            Some(Handle::Pipe(f)) | Some(Handle::File(f)) => f.write(buf),
            Some(Handle::Listener(_)) => Err(io::ErrorKind::InvalidInput.into()),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.handle {
            Some(Handle::Socket(s)) => s.flush(),
            Some(Handle::Pipe(f)) | Some(Handle::File(f)) => f.flush(),
            Some(Handle::Listener(_)) => Ok(()),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl core::fmt::Debug for Stream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("fd", &self.raw_fd())
            .finish()
    }
}
