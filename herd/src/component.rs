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

//! Boundary to protocol plug-ins
//!
//! A [MessageComponent] handles the byte traffic of client connections. The core owns
//! the streams; components only see a [Connection] they can write to and close.

use crate::error::Error;
use crate::ids::{SelectorId, StreamId};
use crate::io::sys::reuse_port_listener;
use crate::io::{Ops, Reactor, ReactorHandler, Selector, Stream};
use crate::worker::{Service, Step, WorkerContext};
use core::time::Duration;
use herd_log::{debug, trace, warn};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

const READ_CHUNK: usize = 4096;
const LISTEN_BACKLOG: i32 = 128;

/// Default upper bound of one reactor tick inside a worker
pub const COMPONENT_TICK: Duration = Duration::from_millis(10);

/// Default idle time after which connections get a heartbeat
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A client connection as seen by a [MessageComponent]
#[derive(Debug)]
pub struct Connection {
    id: StreamId,
    peer: SocketAddr,
    outbound: Vec<u8>,
    closing: bool,
}

impl Connection {
    fn new(id: StreamId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            outbound: Vec::new(),
            closing: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queue bytes for the client
    pub fn write(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    /// Close once everything queued has been written; closing twice is harmless
    pub fn close(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    fn flush(&mut self, stream: &mut Stream) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match stream.write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound.drain(..n);
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Protocol plug-in driven by the connections of one worker
///
/// Callbacks must not block.
pub trait MessageComponent: Send {
    fn on_open(&mut self, connection: &mut Connection) -> Result<(), Error>;

    fn on_message(&mut self, connection: &mut Connection, bytes: &[u8]) -> Result<(), Error>;

    fn on_close(&mut self, connection: &mut Connection);

    fn on_error(&mut self, connection: &mut Connection, fault: &Error);

    /// Called for every open connection when the worker saw no traffic for a while
    fn on_heartbeat(&mut self, _connection: &mut Connection) {}
}

/// Runs a [MessageComponent] as the [Service] of a worker
///
/// Each worker binds its own listener with `SO_REUSEPORT`, so every worker process can
/// accept on the service port.
pub struct ComponentService<C: MessageComponent> {
    address: SocketAddr,
    component: C,
    tick: Duration,
    heartbeat: Duration,
    reactor: Option<(Reactor, SelectorId, StreamId)>,
}

impl<C: MessageComponent> ComponentService<C> {
    pub fn new(address: SocketAddr, component: C) -> Self {
        Self {
            address,
            component,
            tick: COMPONENT_TICK,
            heartbeat: HEARTBEAT_INTERVAL,
            reactor: None,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn component(&self) -> &C {
        &self.component
    }

    /// Address of the bound listener, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let (reactor, selector, listener) = self.reactor.as_ref()?;
        reactor.selector(*selector)?.key(*listener)?.stream().local_addr().ok()
    }
}

impl<C: MessageComponent> Service for ComponentService<C> {
    fn start(&mut self, ctx: &mut WorkerContext) -> Result<(), Error> {
        let listener = reuse_port_listener(self.address, LISTEN_BACKLOG)
            .map_err(|e| Error::Io((e, "failed to bind service listener")))?;
        let listener = Stream::listener(listener)?;

        let mut selector = Selector::new();
        let listener = selector.register(listener, Ops::ACCEPT)?;
        let mut reactor = Reactor::new().with_tick_interval(self.tick);
        let selector = reactor.observe(selector, self.heartbeat);
        self.reactor = Some((reactor, selector, listener));

        if let Some(address) = self.local_addr() {
            ctx.set_description(format!("serving {address}"));
            debug!("Worker {} serving {address}", ctx.uid());
        }
        Ok(())
    }

    fn step(&mut self, _ctx: &mut WorkerContext) -> Result<Step, Error> {
        let Some((reactor, selector, listener)) = self.reactor.as_mut() else {
            return Ok(Step::Idle);
        };

        let mut dispatcher = Dispatcher {
            component: &mut self.component,
            listener: *listener,
            closed: 0,
        };
        reactor.tick(&mut dispatcher)?;
        let closed = dispatcher.closed;

        let open = reactor.selector(*selector).map_or(0, |s| s.len().saturating_sub(1));
        Ok(if closed > 0 {
            Step::Finished
        } else if open > 0 {
            Step::Busy
        } else {
            Step::Idle
        })
    }

    fn stop(&mut self, _ctx: &mut WorkerContext) {
        let Some((mut reactor, selector, listener)) = self.reactor.take() else {
            return;
        };
        let Ok(mut selector) = reactor.unregister(selector) else {
            return;
        };

        let ids: Vec<StreamId> = selector.keys().map(|key| key.id()).collect();
        for id in ids {
            if id != listener
                && let Some(key) = selector.key_mut(id)
                && let Some(connection) = key.attachment_mut::<Connection>()
            {
                self.component.on_close(connection);
            }
            if let Some(mut stream) = selector.remove(id)
                && !stream.is_closed()
            {
                let _ = stream.close();
            }
        }
    }
}

/// Reactor callbacks of one [ComponentService] tick
struct Dispatcher<'a, C> {
    component: &'a mut C,
    listener: StreamId,
    /// Connections closed in this tick
    closed: usize,
}

impl<C: MessageComponent> Dispatcher<'_, C> {
    fn accept(&mut self, selector: &mut Selector) -> Result<(), Error> {
        loop {
            let accepted = match selector.key_mut(self.listener) {
                Some(key) => key.stream_mut().accept(),
                None => return Err(Error::UnknownStream(self.listener)),
            };
            let (stream, peer) = match accepted {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("Failed to accept client connection: {e}");
                    return Ok(());
                },
            };

            let id = selector.register(stream, Ops::READ)?;
            let mut connection = Connection::new(id, peer);
            trace!("Client {peer} connected as {id}");
            if let Err(e) = self.component.on_open(&mut connection) {
                self.component.on_error(&mut connection, &e);
                connection.close();
            }
            if let Some(key) = selector.key_mut(id) {
                key.attach(connection);
            }
            self.settle(selector, id, true);
        }
    }

    /// Read what arrived on `id`, returning false at end of stream or on failure
    fn read(&mut self, selector: &mut Selector, id: StreamId) -> bool {
        let Some(key) = selector.key_mut(id) else {
            return false;
        };
        let (stream, Some(connection)) = key.stream_and_attachment::<Connection>() else {
            return false;
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => {
                    if let Err(e) = self.component.on_message(connection, &chunk[..n]) {
                        self.component.on_error(connection, &e);
                        connection.close();
                        return true;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => {
                    self.component.on_error(connection, &Error::Io((e, "client read failed")));
                    return false;
                },
            }
        }
    }

    /// Flush, then close or adjust the write interest of `id`
    fn settle(&mut self, selector: &mut Selector, id: StreamId, open: bool) {
        let Some(key) = selector.key_mut(id) else {
            return;
        };
        let write_interest = key.interest_ops().contains(Ops::WRITE);
        let (stream, Some(connection)) = key.stream_and_attachment::<Connection>() else {
            return;
        };

        let mut open = open;
        if open && let Err(e) = connection.flush(stream) {
            self.component.on_error(connection, &Error::Io((e, "client write failed")));
            open = false;
        }

        if !open || (connection.closing && connection.outbound.is_empty()) {
            self.component.on_close(connection);
            if let Some(mut stream) = selector.remove(id) {
                let _ = stream.close();
            }
            self.closed += 1;
            return;
        }

        let pending = !connection.outbound.is_empty();
        if pending && !write_interest {
            let _ = selector.reregister(id, Ops::WRITE);
        } else if !pending && write_interest {
            let _ = selector.unregister(id, Ops::WRITE);
        }
    }
}

impl<C: MessageComponent> ReactorHandler for Dispatcher<'_, C> {
    fn on_ready(&mut self, _id: SelectorId, selector: &mut Selector) -> Result<(), Error> {
        for id in selector.ready_ids() {
            if id == self.listener {
                self.accept(selector)?;
                continue;
            }
            let readable = selector.key(id).is_some_and(|key| key.is_readable());
            let open = !readable || self.read(selector, id);
            self.settle(selector, id, open);
        }
        Ok(())
    }

    fn on_timeout(&mut self, _id: SelectorId, selector: &mut Selector) -> Result<(), Error> {
        let ids: Vec<StreamId> = selector
            .keys()
            .map(|key| key.id())
            .filter(|id| *id != self.listener)
            .collect();
        for id in ids {
            if let Some(connection) = selector.key_mut(id).and_then(|key| key.attachment_mut::<Connection>()) {
                self.component.on_heartbeat(connection);
            }
            self.settle(selector, id, true);
        }
        Ok(())
    }
}
