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

//! Scheduler side of the IPC bus
//!
//! The server owns routing state only. Its listener and every peer connection live in a
//! [Selector] that the caller hands to each operation, usually the selector observed by
//! the scheduler's reactor.

use crate::config::RequeueConfig;
use crate::error::Error;
use crate::ids::{StreamId, WorkerId};
use crate::io::{Ops, Selector, Stream};
use crate::ipc::envelope::{Audience, Envelope, Message};
use crate::ipc::packager::{FrameReader, MessagePackager, parse_handshake};
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use herd_log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener};
use std::time::Instant;

/// Unwritten bytes a peer may accumulate before it counts as stalled and is dropped
pub const MAX_OUTBOUND_BYTES: usize = 4 << 20;

/// Outcome of routing one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handled in the routing process itself
    Local,
    /// Write to these connected workers
    Recipients(Vec<WorkerId>),
    /// Not enough recipients right now, try again on the next pass
    Requeue,
    /// The addressed worker is not connected
    Drop,
}

/// Decide where `envelope` goes given the connected uids
///
/// The sender and the reserved uid 0 never receive their own broadcast.
pub fn plan_delivery<R: Rng + ?Sized>(envelope: &Envelope, connected: &[WorkerId], rng: &mut R) -> Delivery {
    let candidates: Vec<WorkerId> = connected
        .iter()
        .copied()
        .filter(|uid| *uid != envelope.sender_id && !uid.is_server())
        .collect();

    match envelope.audience {
        Audience::All => Delivery::Recipients(candidates),
        Audience::Any => match candidates.choose(rng) {
            Some(uid) => Delivery::Recipients(vec![*uid]),
            None => Delivery::Requeue,
        },
        Audience::Amount => {
            let wanted = usize::try_from(envelope.number).unwrap_or(usize::MAX);
            if candidates.len() < wanted {
                Delivery::Requeue
            } else {
                Delivery::Recipients(candidates.choose_multiple(rng, wanted).copied().collect())
            }
        },
        Audience::Selected => {
            let target = WorkerId::new(envelope.number);
            if target.is_server() {
                Delivery::Local
            } else if connected.contains(&target) {
                Delivery::Recipients(vec![target])
            } else {
                Delivery::Drop
            }
        },
        Audience::Server | Audience::Sender => Delivery::Local,
    }
}

/// Per-connection state attached to the selection key
#[derive(Default)]
struct Peer {
    uid: Option<WorkerId>,
    reader: FrameReader,
    outbound: Vec<u8>,
}

impl Peer {
    /// Write as much of the outbound buffer as the socket takes, true once drained
    fn flush(&mut self, stream: &mut Stream) -> io::Result<bool> {
        while !self.outbound.is_empty() {
            match stream.write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound.drain(..n);
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

struct Queued {
    envelope: Envelope,
    queued_at: Instant,
}

/// Broker of the IPC bus
pub struct IpcServer {
    address: SocketAddr,
    listener: StreamId,
    peers: BTreeMap<WorkerId, StreamId>,
    pending: BTreeSet<StreamId>,
    queue: VecDeque<Queued>,
    inbox: VecDeque<Envelope>,
    requeue: RequeueConfig,
    outbound_limit: usize,
    rng: StdRng,
}

impl IpcServer {
    /// Bind the listener and register it with a fresh selector
    pub fn bind(address: SocketAddr, requeue: RequeueConfig) -> Result<(Self, Selector), Error> {
        let mut selector = Selector::new();
        let server = Self::bind_into(address, requeue, &mut selector)?;
        Ok((server, selector))
    }

    /// Bind the listener and register it with `selector`
    pub fn bind_into(address: SocketAddr, requeue: RequeueConfig, selector: &mut Selector) -> Result<Self, Error> {
        let listener = TcpListener::bind(address).map_err(|e| Error::Io((e, "failed to bind IPC listener")))?;
        let stream = Stream::listener(listener)?;
        let address = stream
            .local_addr()
            .map_err(|e| Error::Io((e, "failed to query IPC listener address")))?;
        let listener = selector.register(stream, Ops::ACCEPT)?;
        info!("IPC bus listening on {address}");

        Ok(Self {
            address,
            listener,
            peers: BTreeMap::new(),
            pending: BTreeSet::new(),
            queue: VecDeque::new(),
            inbox: VecDeque::new(),
            requeue,
            outbound_limit: MAX_OUTBOUND_BYTES,
            rng: StdRng::from_entropy(),
        })
    }

    /// Replace [MAX_OUTBOUND_BYTES] as the limit of unwritten bytes per peer
    pub fn with_outbound_limit(mut self, limit: usize) -> Self {
        self.outbound_limit = limit;
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Uids of workers that completed the handshake
    pub fn connected(&self) -> Vec<WorkerId> {
        self.peers.keys().copied().collect()
    }

    pub fn is_connected(&self, uid: WorkerId) -> bool {
        self.peers.contains_key(&uid)
    }

    /// Number of connections still waiting for their handshake
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of envelopes waiting to be routed
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Handle the ready keys of the last select, then route
    pub fn on_ready(&mut self, selector: &mut Selector) -> Result<(), Error> {
        for id in selector.ready_ids() {
            if id == self.listener {
                self.accept(selector)?;
                continue;
            }

            let Some(key) = selector.key(id) else {
                continue;
            };
            let (readable, writable) = (key.is_readable(), key.is_writable());
            if writable {
                self.flush_peer(selector, id);
            }
            if readable {
                self.read_peer(selector, id);
            }
        }

        self.route(selector);
        Ok(())
    }

    /// Queue an envelope for the next routing pass
    pub fn submit(&mut self, envelope: Envelope) {
        self.queue.push_back(Queued {
            envelope,
            queued_at: Instant::now(),
        });
        self.enforce_bound();
    }

    /// Send a message on behalf of the scheduler and route it right away
    pub fn send(&mut self, selector: &mut Selector, audience: Audience, number: u64, message: impl Into<Message>) {
        self.submit(Envelope::new(WorkerId::SERVER, audience, number, message));
        self.route(selector);
    }

    /// Route every queued envelope once
    ///
    /// Envelopes without enough recipients go back to the queue until they expire.
    pub fn route(&mut self, selector: &mut Selector) {
        if self.queue.is_empty() {
            return;
        }

        let connected = self.connected();
        let now = Instant::now();
        let ttl = self.requeue.ttl();
        let batch = core::mem::take(&mut self.queue);

        for queued in batch {
            let envelope = &queued.envelope;
            match plan_delivery(envelope, &connected, &mut self.rng) {
                Delivery::Local => {
                    trace!("Delivering {:?} envelope of {} locally", envelope.audience, envelope.sender_id);
                    self.inbox.push_back(queued.envelope);
                },
                Delivery::Recipients(recipients) => {
                    let frame = match MessagePackager::frame(envelope) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Dropping envelope of {}: {e}", envelope.sender_id);
                            continue;
                        },
                    };
                    for uid in recipients {
                        self.deliver(selector, uid, &frame);
                    }
                },
                Delivery::Requeue if now.saturating_duration_since(queued.queued_at) >= ttl => {
                    warn!(
                        "Dropping {:?} envelope of {} after {}ms without recipients",
                        envelope.audience,
                        envelope.sender_id,
                        ttl.as_millis()
                    );
                },
                Delivery::Requeue => self.queue.push_back(queued),
                Delivery::Drop => {
                    warn!(
                        "Dropping envelope of {} for unknown worker {}",
                        envelope.sender_id,
                        WorkerId::new(envelope.number)
                    );
                },
            }
        }

        self.enforce_bound();
    }

    /// Evict every connection whose stream is gone or closed, returning the evicted uids
    pub fn sweep(&mut self, selector: &mut Selector) -> Vec<WorkerId> {
        let dead = |id: &StreamId| selector.key(*id).is_none_or(|key| key.stream().is_closed());

        let dead_pending: Vec<StreamId> = self.pending.iter().filter(|id| dead(id)).copied().collect();
        let dead_peers: Vec<(WorkerId, StreamId)> = self
            .peers
            .iter()
            .filter(|(_, id)| dead(id))
            .map(|(uid, id)| (*uid, *id))
            .collect();

        for id in dead_pending {
            self.drop_connection(selector, id);
        }
        dead_peers
            .into_iter()
            .map(|(uid, id)| {
                debug!("Sweeping dead IPC connection of {uid}");
                self.drop_connection(selector, id);
                uid
            })
            .collect()
    }

    /// Envelopes delivered to the scheduler since the last call
    pub fn take_inbox(&mut self) -> Vec<Envelope> {
        self.inbox.drain(..).collect()
    }

    /// Close the listener and every connection
    pub fn close(&mut self, selector: &mut Selector) {
        let connections: Vec<StreamId> = self.pending.iter().chain(self.peers.values()).copied().collect();
        for id in connections {
            self.drop_connection(selector, id);
        }
        if let Some(mut listener) = selector.remove(self.listener)
            && !listener.is_closed()
        {
            let _ = listener.close();
        }
    }

    fn accept(&mut self, selector: &mut Selector) -> Result<(), Error> {
        loop {
            let accepted = match selector.key_mut(self.listener) {
                Some(key) => key.stream_mut().accept(),
                None => return Err(Error::UnknownStream(self.listener)),
            };
            match accepted {
                Ok(Some((stream, peer_addr))) => {
                    let id = selector.register(stream, Ops::READ)?;
                    if let Some(key) = selector.key_mut(id) {
                        key.attach(Peer::default());
                    }
                    self.pending.insert(id);
                    debug!("Accepted IPC connection {id} from {peer_addr}");
                },
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("Failed to accept IPC connection: {e}");
                    return Ok(());
                },
            }
        }
    }

    fn read_peer(&mut self, selector: &mut Selector, id: StreamId) {
        let Some(key) = selector.key_mut(id) else {
            return;
        };
        let (stream, Some(peer)) = key.stream_and_attachment::<Peer>() else {
            return;
        };

        // The bytes read before end of stream are still processed
        let read = peer.reader.read_from(stream);

        if peer.uid.is_none() {
            match parse_handshake(peer.reader.unparsed()) {
                Ok(Some((uid, consumed))) if !uid.is_server() => {
                    peer.reader.consume(consumed);
                    peer.uid = Some(uid);
                    self.promote(selector, id, uid);
                },
                Ok(Some(_)) | Err(_) => {
                    warn!("Rejecting IPC connection {id} with invalid handshake");
                    self.drop_connection(selector, id);
                    return;
                },
                Ok(None) => {},
            }
        }

        let Some(key) = selector.key_mut(id) else {
            return;
        };
        let Some(peer) = key.attachment_mut::<Peer>() else {
            return;
        };
        if let Some(uid) = peer.uid {
            loop {
                match peer.reader.next_frame() {
                    Ok(Some(frame)) => match MessagePackager::unpack::<Envelope>(&frame) {
                        Ok(mut envelope) => {
                            // A peer can only ever speak for itself
                            envelope.sender_id = uid;
                            self.queue.push_back(Queued {
                                envelope,
                                queued_at: Instant::now(),
                            });
                        },
                        Err(e) => warn!("Discarding malformed frame from {uid}: {e}"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Evicting {uid}: {e}");
                        self.drop_connection(selector, id);
                        return;
                    },
                }
            }
            self.enforce_bound();
        }

        if let Err(e) = read {
            debug!("IPC connection {id} closed: {e}");
            self.drop_connection(selector, id);
        }
    }

    fn promote(&mut self, selector: &mut Selector, id: StreamId, uid: WorkerId) {
        self.pending.remove(&id);
        if let Some(previous) = self.peers.insert(uid, id)
            && previous != id
        {
            warn!("Worker {uid} reconnected, dropping its previous connection");
            if let Some(mut stream) = selector.remove(previous) {
                let _ = stream.close();
            }
        }
        info!("Worker {uid} joined the IPC bus");
    }

    fn deliver(&mut self, selector: &mut Selector, uid: WorkerId, frame: &[u8]) {
        let Some(id) = self.peers.get(&uid).copied() else {
            return;
        };
        let Some(key) = selector.key_mut(id) else {
            self.peers.remove(&uid);
            return;
        };
        let stalled = match key.stream_and_attachment::<Peer>() {
            (_, Some(peer)) if peer.outbound.len() > self.outbound_limit => Some(peer.outbound.len()),
            (_, Some(peer)) => {
                peer.outbound.extend_from_slice(frame);
                None
            },
            _ => None,
        };
        if let Some(pending) = stalled {
            warn!("Worker {uid} stopped reading with {pending} bytes pending, dropping its connection");
            self.drop_connection(selector, id);
            return;
        }
        self.flush_peer(selector, id);
    }

    fn flush_peer(&mut self, selector: &mut Selector, id: StreamId) {
        let Some(key) = selector.key_mut(id) else {
            return;
        };
        let (stream, Some(peer)) = key.stream_and_attachment::<Peer>() else {
            return;
        };

        match peer.flush(stream) {
            Ok(true) if key.interest_ops().contains(Ops::WRITE) => {
                let _ = selector.unregister(id, Ops::WRITE);
            },
            Ok(true) => {},
            Ok(false) => {
                let _ = selector.reregister(id, Ops::WRITE);
            },
            Err(e) => {
                warn!("Failed to write to IPC connection {id}: {e}");
                self.drop_connection(selector, id);
            },
        }
    }

    fn drop_connection(&mut self, selector: &mut Selector, id: StreamId) {
        self.pending.remove(&id);
        self.peers.retain(|uid, stream| {
            if *stream == id {
                info!("Worker {uid} left the IPC bus");
            }
            *stream != id
        });
        if let Some(mut stream) = selector.remove(id)
            && !stream.is_closed()
        {
            let _ = stream.close();
        }
    }

    fn enforce_bound(&mut self) {
        while self.queue.len() > self.requeue.max_queued {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(
                    "IPC queue full, dropping {:?} envelope of {}",
                    dropped.envelope.audience, dropped.envelope.sender_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::packager::{FrameReader, handshake};
    use std::collections::BTreeSet as Set;
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    fn ids(raw: &[u64]) -> Vec<WorkerId> {
        raw.iter().copied().map(WorkerId::new).collect()
    }

    fn envelope(sender: u64, audience: Audience, number: u64) -> Envelope {
        Envelope::new(WorkerId::new(sender), audience, number, "payload")
    }

    #[test]
    fn all_skips_sender_and_server() {
        let mut rng = StdRng::seed_from_u64(1);
        let plan = plan_delivery(&envelope(2, Audience::All, 0), &ids(&[0, 2, 3, 4]), &mut rng);
        assert_eq!(plan, Delivery::Recipients(ids(&[3, 4])));
    }

    #[test]
    fn any_picks_one_or_requeues() {
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..20 {
            let Delivery::Recipients(picked) = plan_delivery(&envelope(2, Audience::Any, 0), &ids(&[2, 3, 4]), &mut rng)
            else {
                panic!("expected a recipient");
            };
            assert_eq!(picked.len(), 1);
            assert!(picked[0] == WorkerId::new(3) || picked[0] == WorkerId::new(4));
        }
        assert_eq!(
            plan_delivery(&envelope(2, Audience::Any, 0), &ids(&[2]), &mut rng),
            Delivery::Requeue
        );
    }

    #[test]
    fn amount_never_delivers_partially() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            plan_delivery(&envelope(1, Audience::Amount, 3), &ids(&[2, 3]), &mut rng),
            Delivery::Requeue
        );

        let Delivery::Recipients(picked) = plan_delivery(&envelope(1, Audience::Amount, 2), &ids(&[1, 2, 3, 4]), &mut rng)
        else {
            panic!("expected recipients");
        };
        let distinct: Set<WorkerId> = picked.iter().copied().collect();
        assert_eq!(distinct.len(), 2);
        assert!(!distinct.contains(&WorkerId::new(1)));
    }

    #[test]
    fn selected_and_local_audiences() {
        let mut rng = StdRng::seed_from_u64(4);
        let connected = ids(&[5, 6]);
        assert_eq!(
            plan_delivery(&envelope(0, Audience::Selected, 6), &connected, &mut rng),
            Delivery::Recipients(ids(&[6]))
        );
        assert_eq!(plan_delivery(&envelope(5, Audience::Selected, 9), &connected, &mut rng), Delivery::Drop);
        assert_eq!(plan_delivery(&envelope(5, Audience::Selected, 0), &connected, &mut rng), Delivery::Local);
        assert_eq!(plan_delivery(&envelope(5, Audience::Server, 0), &connected, &mut rng), Delivery::Local);
        assert_eq!(plan_delivery(&envelope(0, Audience::Sender, 0), &connected, &mut rng), Delivery::Local);
    }

    fn server(requeue: RequeueConfig) -> (IpcServer, Selector) {
        IpcServer::bind("127.0.0.1:0".parse().unwrap(), requeue).unwrap()
    }

    /// Select and dispatch until `done` holds or a second has passed
    fn pump(server: &mut IpcServer, selector: &mut Selector, done: impl Fn(&IpcServer) -> bool) {
        for _ in 0..100 {
            if done(server) {
                return;
            }
            selector.select(Some(Duration::from_millis(10))).unwrap();
            server.on_ready(selector).unwrap();
        }
        assert!(done(server), "condition not reached");
    }

    fn connect(server: &IpcServer, uid: u64) -> TcpStream {
        let mut client = TcpStream::connect(server.address()).unwrap();
        client.write_all(&handshake(WorkerId::new(uid))).unwrap();
        client
    }

    /// Keep the server busy until `client` received one envelope
    fn receive(server: &mut IpcServer, selector: &mut Selector, client: &mut TcpStream) -> Envelope {
        client.set_nonblocking(true).unwrap();
        let mut reader = FrameReader::new();
        for _ in 0..100 {
            reader.read_from(client).unwrap();
            if let Some(frame) = reader.next_frame().unwrap() {
                return MessagePackager::unpack(&frame).unwrap();
            }
            selector.select(Some(Duration::from_millis(10))).unwrap();
            server.on_ready(selector).unwrap();
        }
        panic!("nothing received");
    }

    #[test]
    fn handshake_promotes_pending_connection() {
        let (mut server, mut selector) = server(RequeueConfig::default());
        let _client = connect(&server, 7);

        pump(&mut server, &mut selector, |s| s.is_connected(WorkerId::new(7)));
        assert_eq!(server.pending(), 0);
        assert_eq!(server.connected(), ids(&[7]));
    }

    #[test]
    fn broadcast_reaches_every_other_worker() {
        let (mut server, mut selector) = server(RequeueConfig::default());
        let mut a = connect(&server, 2);
        let mut b = connect(&server, 3);
        let mut c = connect(&server, 4);
        pump(&mut server, &mut selector, |s| s.connected().len() == 3);

        let frame = MessagePackager::frame(&envelope(99, Audience::All, 0)).unwrap();
        a.write_all(&frame).unwrap();

        for client in [&mut b, &mut c] {
            let received = receive(&mut server, &mut selector, client);
            // The sender id is the uid of the connection, not what the frame claims
            assert_eq!(received.sender_id, WorkerId::new(2));
            assert_eq!(received.message, Message::from("payload"));
        }

        a.set_nonblocking(true).unwrap();
        let mut probe = [0u8; 1];
        assert_eq!(
            io::Read::read(&mut a, &mut probe).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn server_audience_lands_in_inbox() {
        let (mut server, mut selector) = server(RequeueConfig::default());
        let mut client = connect(&server, 5);
        pump(&mut server, &mut selector, |s| s.is_connected(WorkerId::new(5)));

        client
            .write_all(&MessagePackager::frame(&envelope(5, Audience::Server, 0)).unwrap())
            .unwrap();
        pump(&mut server, &mut selector, |s| !s.inbox.is_empty());

        let inbox = server.take_inbox();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].sender_id, WorkerId::new(5));
        assert!(server.take_inbox().is_empty());
    }

    #[test]
    fn scheduler_can_address_a_worker() {
        let (mut server, mut selector) = server(RequeueConfig::default());
        let mut client = connect(&server, 8);
        pump(&mut server, &mut selector, |s| s.is_connected(WorkerId::new(8)));

        server.send(&mut selector, Audience::Selected, 8, "direct");
        let received = receive(&mut server, &mut selector, &mut client);
        assert_eq!(received.sender_id, WorkerId::SERVER);
        assert_eq!(received.message, Message::from("direct"));
    }

    #[test]
    fn undeliverable_envelopes_expire() {
        let requeue = RequeueConfig {
            max_queued: 16,
            ttl_ms: 20,
        };
        let (mut server, mut selector) = server(requeue);

        server.send(&mut selector, Audience::Any, 0, "nobody");
        assert_eq!(server.queued(), 1);
        server.route(&mut selector);
        assert_eq!(server.queued(), 1);

        thread::sleep(Duration::from_millis(30));
        server.route(&mut selector);
        assert_eq!(server.queued(), 0);
    }

    #[test]
    fn queue_is_bounded() {
        let requeue = RequeueConfig {
            max_queued: 3,
            ttl_ms: 60_000,
        };
        let (mut server, _selector) = server(requeue);
        for number in 1..=5 {
            server.submit(envelope(0, Audience::Amount, number));
        }
        assert_eq!(server.queued(), 3);
        assert_eq!(server.queue.front().unwrap().envelope.number, 3);
    }

    #[test]
    fn closed_connections_are_swept() {
        let (mut server, mut selector) = server(RequeueConfig::default());
        let client = connect(&server, 11);
        pump(&mut server, &mut selector, |s| s.is_connected(WorkerId::new(11)));

        drop(client);
        pump(&mut server, &mut selector, |s| !s.is_connected(WorkerId::new(11)));
        assert!(server.sweep(&mut selector).is_empty());

        let _client = connect(&server, 12);
        pump(&mut server, &mut selector, |s| s.is_connected(WorkerId::new(12)));
        let id = server.peers[&WorkerId::new(12)];
        selector.key_mut(id).unwrap().stream_mut().close().unwrap();
        assert_eq!(server.sweep(&mut selector), ids(&[12]));
        assert!(!selector.contains(id));
    }

    #[test]
    fn bad_handshake_is_rejected() {
        let (mut server, mut selector) = server(RequeueConfig::default());
        let mut client = TcpStream::connect(server.address()).unwrap();
        client.write_all(b"abc!").unwrap();
        client.set_nonblocking(true).unwrap();

        let mut closed = false;
        let mut probe = [0u8; 8];
        for _ in 0..100 {
            selector.select(Some(Duration::from_millis(10))).unwrap();
            server.on_ready(&mut selector).unwrap();
            if let Ok(0) = io::Read::read(&mut client, &mut probe) {
                closed = true;
                break;
            }
        }

        assert!(closed);
        assert_eq!(server.pending(), 0);
        assert_eq!(selector.len(), 1);
        assert!(server.connected().is_empty());
    }

    #[test]
    fn failed_recipient_does_not_hold_back_the_others() {
        let (mut server, mut selector) = server(RequeueConfig::default());
        let mut a = connect(&server, 2);
        let _b = connect(&server, 3);
        let mut c = connect(&server, 4);
        pump(&mut server, &mut selector, |s| s.connected().len() == 3);

        let id = server.peers[&WorkerId::new(3)];
        selector.key_mut(id).unwrap().stream_mut().close().unwrap();
        server.send(&mut selector, Audience::All, 0, "payload");

        assert!(!server.is_connected(WorkerId::new(3)));
        assert_eq!(server.connected(), ids(&[2, 4]));
        for client in [&mut a, &mut c] {
            let received = receive(&mut server, &mut selector, client);
            assert_eq!(received.message, Message::from("payload"));
        }
    }

    #[test]
    fn peer_that_stops_reading_is_dropped() {
        let (server, mut selector) = server(RequeueConfig::default());
        let mut server = server.with_outbound_limit(0);
        let _stalled = connect(&server, 9);
        pump(&mut server, &mut selector, |s| s.is_connected(WorkerId::new(9)));

        let chunk = "x".repeat(64 * 1024);
        for _ in 0..1024 {
            server.send(&mut selector, Audience::Selected, 9, chunk.as_str());
            if !server.is_connected(WorkerId::new(9)) {
                break;
            }
        }
        assert!(!server.is_connected(WorkerId::new(9)));
        assert_eq!(selector.len(), 1);
    }
}
