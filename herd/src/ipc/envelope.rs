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

//! Envelopes routed over the IPC bus

use crate::ids::WorkerId;
use crate::worker::state::WorkerState;
use serde::{Deserialize, Serialize};

/// Routing target class of an [Envelope]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Audience {
    /// Every connected worker except the sender
    All,
    /// One randomly chosen worker, re-queued while there is none
    Any,
    /// `number` distinct random workers, re-queued while fewer are connected
    Amount,
    /// The worker whose uid is `number`
    Selected,
    /// The scheduler process
    Server,
    /// The sending process itself
    Sender,
}

impl Audience {
    /// Whether envelopes for this audience never leave the process
    pub fn is_local(self) -> bool {
        matches!(self, Audience::Server | Audience::Sender)
    }
}

/// Commands the scheduler sends to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Finish the current task and exit
    Stop,
}

/// Payload of an [Envelope]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Text(String),
    Bytes(Vec<u8>),
    Status(WorkerState),
    Command(Command),
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.into())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

/// A message together with its routing information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: WorkerId,
    pub audience: Audience,
    /// Count for [Audience::Amount], target uid for [Audience::Selected]
    pub number: u64,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender_id: WorkerId, audience: Audience, number: u64, message: impl Into<Message>) -> Self {
        Self {
            sender_id,
            audience,
            number,
            message: message.into(),
        }
    }
}

impl From<WorkerState> for Message {
    fn from(state: WorkerState) -> Self {
        Message::Status(state)
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}
