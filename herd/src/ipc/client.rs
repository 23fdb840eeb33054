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

//! Worker side of the IPC bus

use crate::error::Error;
use crate::ids::WorkerId;
use crate::ipc::envelope::{Audience, Envelope, Message};
use crate::ipc::packager::{FrameReader, MessagePackager, handshake};
use alloc::collections::VecDeque;
use core::time::Duration;
use herd_log::{debug, trace};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::thread;
use std::time::Instant;

const CLIENT_TOKEN: Token = Token(0);

/// Pause between connection attempts
const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Connection of one worker to the scheduler's IPC bus
pub struct SocketIpc {
    uid: WorkerId,
    poll: Poll,
    events: Events,
    stream: TcpStream,
    reader: FrameReader,
    outbound: Vec<u8>,
    /// Envelopes addressed to the sender itself
    local: VecDeque<Envelope>,
    write_interest: bool,
    closed: bool,
}

impl SocketIpc {
    /// Connect to `address` and announce `uid`
    ///
    /// Connection attempts are retried until `timeout` has passed.
    pub fn connect(address: SocketAddr, uid: WorkerId, timeout: Duration) -> Result<Self, Error> {
        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            match std::net::TcpStream::connect(address) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() >= deadline => {
                    debug!("Giving up connecting to {address}: {e}");
                    return Err(Error::Timeout(timeout, "connecting to the IPC bus"));
                },
                Err(e) => {
                    trace!("Retrying connection to {address}: {e}");
                    thread::sleep(CONNECT_RETRY);
                },
            }
        };

        stream
            .set_nodelay(true)
            .map_err(|e| Error::Io((e, "failed to set TCP_NODELAY")))?;
        stream
            .write_all(&handshake(uid))
            .map_err(|e| Error::Io((e, "failed to send IPC handshake")))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::Io((e, "failed to set IPC socket non-blocking")))?;

        let mut stream = TcpStream::from_std(stream);
        let poll = Poll::new().map_err(|e| Error::Io((e, "failed to create poll")))?;
        poll.registry()
            .register(&mut stream, CLIENT_TOKEN, Interest::READABLE)
            .map_err(|e| Error::Io((e, "failed to register IPC socket")))?;
        debug!("Worker {uid} connected to the IPC bus at {address}");

        Ok(Self {
            uid,
            poll,
            events: Events::with_capacity(8),
            stream,
            reader: FrameReader::new(),
            outbound: Vec::new(),
            local: VecDeque::new(),
            write_interest: false,
            closed: false,
        })
    }

    pub fn uid(&self) -> WorkerId {
        self.uid
    }

    /// Send `message` to `audience`
    ///
    /// Envelopes for [Audience::Sender] never touch the socket.
    pub fn send(&mut self, audience: Audience, number: u64, message: impl Into<Message>) -> Result<(), Error> {
        let envelope = Envelope::new(self.uid, audience, number, message);
        if audience == Audience::Sender {
            self.local.push_back(envelope);
            return Ok(());
        }
        if self.closed {
            return Err(Error::ChannelClosed);
        }

        self.outbound.extend_from_slice(&MessagePackager::frame(&envelope)?);
        self.flush()
    }

    /// Wait up to `timeout` for the next envelope
    ///
    /// Fails with [Error::ChannelClosed] once the scheduler closed the connection and
    /// every buffered envelope has been taken.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Envelope>, Error> {
        if let Some(envelope) = self.local.pop_front() {
            return Ok(Some(envelope));
        }
        if let Some(envelope) = self.next_envelope()? {
            return Ok(Some(envelope));
        }
        if self.closed {
            return Err(Error::ChannelClosed);
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(Error::Io((e, "IPC poll failed"))),
        }

        let mut readable = false;
        let mut writable = false;
        for event in self.events.iter() {
            readable |= event.is_readable() || event.is_read_closed() || event.is_error();
            writable |= event.is_writable();
        }

        if writable {
            self.flush()?;
        }
        if readable && let Err(e) = self.reader.read_from(&mut self.stream) {
            debug!("IPC connection of {} closed: {e}", self.uid);
            self.closed = true;
        }

        match self.next_envelope()? {
            Some(envelope) => Ok(Some(envelope)),
            None if self.closed => Err(Error::ChannelClosed),
            None => Ok(None),
        }
    }

    /// Write buffered frames, blocking up to `timeout` until the buffer is drained
    pub fn flush_blocking(&mut self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        self.flush()?;
        while !self.outbound.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout, "flushing the IPC connection"));
            }
            match self.poll.poll(&mut self.events, Some(deadline - now)) {
                Ok(()) => {},
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(Error::Io((e, "IPC poll failed"))),
            }
            self.flush()?;
        }
        Ok(())
    }

    /// Number of bytes not yet written to the socket
    pub fn pending_bytes(&self) -> usize {
        self.outbound.len()
    }

    fn next_envelope(&mut self) -> Result<Option<Envelope>, Error> {
        match self.reader.next_frame()? {
            Some(frame) => Ok(Some(MessagePackager::unpack(&frame)?)),
            None => Ok(None),
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    self.closed = true;
                    return Err(Error::ChannelClosed);
                },
                Ok(n) => {
                    self.outbound.drain(..n);
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset) => {
                    self.closed = true;
                    return Err(Error::ChannelClosed);
                },
                Err(e) => return Err(Error::Io((e, "failed to write to the IPC bus"))),
            }
        }

        // Edge-triggered writability is only interesting while bytes are pending
        let want_write = !self.outbound.is_empty();
        if want_write != self.write_interest {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.poll
                .registry()
                .reregister(&mut self.stream, CLIENT_TOKEN, interest)
                .map_err(|e| Error::Io((e, "failed to reregister IPC socket")))?;
            self.write_interest = want_write;
        }
        Ok(())
    }
}
