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

use core::time::Duration;
use herd::config::RequeueConfig;
use herd::error::Error;
use herd::ids::{SelectorId, WorkerId};
use herd::io::{Reactor, ReactorHandler, Selector};
use herd::ipc::{Audience, Envelope, IpcServer, Message, SocketIpc};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Hands the readiness of the bus selector to the broker
struct Broker<'a>(&'a mut IpcServer);

impl ReactorHandler for Broker<'_> {
    fn on_ready(&mut self, _id: SelectorId, selector: &mut Selector) -> Result<(), Error> {
        self.0.on_ready(selector)
    }
}

struct Bus {
    server: IpcServer,
    reactor: Reactor,
    selector: SelectorId,
}

impl Bus {
    fn start(requeue: RequeueConfig) -> Self {
        let _ = env_logger::try_init();
        let (server, selector) = IpcServer::bind("127.0.0.1:0".parse().unwrap(), requeue).unwrap();
        let mut reactor = Reactor::new().with_tick_interval(Duration::from_millis(5));
        let selector = reactor.observe(selector, Duration::MAX);
        Self {
            server,
            reactor,
            selector,
        }
    }

    fn join(&self, uid: u64) -> SocketIpc {
        SocketIpc::connect(self.server.address(), WorkerId::new(uid), CONNECT_TIMEOUT).unwrap()
    }

    fn tick(&mut self) {
        self.reactor.tick(&mut Broker(&mut self.server)).unwrap();
    }

    fn tick_until(&mut self, condition: impl Fn(&IpcServer) -> bool) {
        for _ in 0..400 {
            if condition(&self.server) {
                return;
            }
            self.tick();
        }
        assert!(condition(&self.server), "condition not reached");
    }

    /// Keep the broker running until `client` got an envelope
    fn receive(&mut self, client: &mut SocketIpc) -> Option<Envelope> {
        for _ in 0..100 {
            self.tick();
            if let Some(envelope) = client.receive(Duration::from_millis(2)).unwrap() {
                return Some(envelope);
            }
        }
        None
    }

    fn sweep(&mut self) -> Vec<WorkerId> {
        let selector = self.reactor.selector_mut(self.selector).unwrap();
        self.server.sweep(selector)
    }
}

fn text(envelope: &Envelope) -> &str {
    match &envelope.message {
        Message::Text(text) => text,
        other => panic!("unexpected message {other:?}"),
    }
}

#[test]
fn selected_message_reaches_only_its_target() {
    let mut bus = Bus::start(RequeueConfig::default());
    let mut sender = bus.join(11);
    let mut target = bus.join(12);
    let mut bystander = bus.join(13);
    bus.tick_until(|s| s.connected().len() == 3);

    sender.send(Audience::Selected, 12, "only for 12").unwrap();
    let envelope = bus.receive(&mut target).expect("target received nothing");
    assert_eq!(envelope.sender_id, WorkerId::new(11));
    assert_eq!(text(&envelope), "only for 12");

    assert!(bus.receive(&mut bystander).is_none());
}

#[test]
fn broadcast_skips_the_sender() {
    let mut bus = Bus::start(RequeueConfig::default());
    let mut sender = bus.join(2);
    let mut first = bus.join(3);
    let mut second = bus.join(4);
    bus.tick_until(|s| s.connected().len() == 3);

    sender.send(Audience::All, 0, "to everyone").unwrap();
    assert_eq!(text(&bus.receive(&mut first).unwrap()), "to everyone");
    assert_eq!(text(&bus.receive(&mut second).unwrap()), "to everyone");
    assert!(bus.receive(&mut sender).is_none());
}

#[test]
fn amount_waits_until_enough_workers_joined() {
    let mut bus = Bus::start(RequeueConfig::default());
    let mut sender = bus.join(21);
    let mut first = bus.join(22);
    bus.tick_until(|s| s.connected().len() == 2);

    sender.send(Audience::Amount, 2, "two of you").unwrap();
    bus.tick_until(|s| s.queued() == 1);
    assert!(bus.receive(&mut first).is_none());

    let mut second = bus.join(23);
    assert_eq!(text(&bus.receive(&mut first).unwrap()), "two of you");
    assert_eq!(text(&bus.receive(&mut second).unwrap()), "two of you");
    assert_eq!(bus.server.queued(), 0);
}

#[test]
fn undeliverable_envelopes_expire() {
    let mut bus = Bus::start(RequeueConfig {
        max_queued: 16,
        ttl_ms: 20,
    });
    let mut lonely = bus.join(31);
    bus.tick_until(|s| s.is_connected(WorkerId::new(31)));

    lonely.send(Audience::Any, 0, "anybody?").unwrap();
    bus.tick_until(|s| s.queued() == 1);

    // A late peer triggers another routing pass, after the envelope expired
    std::thread::sleep(Duration::from_millis(40));
    let mut late = bus.join(32);
    bus.tick_until(|s| s.is_connected(WorkerId::new(32)));
    assert_eq!(bus.server.queued(), 0);
    assert!(bus.receive(&mut late).is_none());
}

#[test]
fn messages_for_the_server_land_in_its_inbox() {
    let mut bus = Bus::start(RequeueConfig::default());
    let mut worker = bus.join(41);
    bus.tick_until(|s| s.is_connected(WorkerId::new(41)));

    worker.send(Audience::Server, 0, "status please").unwrap();
    let mut inbox = Vec::new();
    for _ in 0..100 {
        bus.tick();
        inbox.extend(bus.server.take_inbox());
        if !inbox.is_empty() {
            break;
        }
    }
    assert_eq!(inbox.len(), 1);
    assert_eq!(text(&inbox[0]), "status please");
}

#[test]
fn self_audience_never_leaves_the_process() {
    let mut bus = Bus::start(RequeueConfig::default());
    let mut worker = bus.join(51);

    worker.send(Audience::Sender, 0, "note to self").unwrap();
    let envelope = worker.receive(Duration::ZERO).unwrap().unwrap();
    assert_eq!(text(&envelope), "note to self");
    assert!(bus.server.take_inbox().is_empty());
}

#[test]
fn departed_workers_are_evicted() {
    let mut bus = Bus::start(RequeueConfig::default());
    let stays = bus.join(61);
    let leaves = bus.join(62);
    bus.tick_until(|s| s.connected().len() == 2);

    drop(leaves);
    bus.tick_until(|s| !s.is_connected(WorkerId::new(62)));
    assert!(bus.sweep().is_empty());
    assert_eq!(bus.server.connected(), vec![stays.uid()]);
}
