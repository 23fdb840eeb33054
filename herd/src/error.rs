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

//! Herd error implementation

use crate::ids::{SelectorId, StreamId, WorkerId};
use crate::worker::state::WorkerStatus;
use core::time::Duration;

/// Herd error type
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    AlreadyRunning(i32),
    ChannelClosed,
    Codec(postcard::Error),
    Config(String),
    InvalidOps(u8),
    InvalidTransition(WorkerId, WorkerStatus, WorkerStatus),
    Io((std::io::Error, &'static str)),
    PoolFull(usize),
    Protocol(&'static str),
    Spawn((std::io::Error, &'static str)),
    StreamClosed(StreamId),
    Timeout(Duration, &'static str),
    UnknownSelector(SelectorId),
    UnknownStream(StreamId),
    Unsupported(&'static str),
}

impl core::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::AlreadyRunning(pid) => write!(f, "scheduler already running with pid {pid}"),
            Error::ChannelClosed => write!(f, "channel closed by peer"),
            Error::Codec(e) => write!(f, "codec error: {e}"),
            Error::Config(description) => write!(f, "invalid configuration: {description}"),
            Error::InvalidOps(bits) => write!(f, "invalid operation bitmask {bits:#05b}"),
            Error::InvalidTransition(id, from, to) => {
                write!(f, "worker {id} cannot change status from {from:?} to {to:?}")
            },
            Error::Io((e, description)) => write!(f, "{description}: io error: {e}"),
            Error::PoolFull(max) => write!(f, "worker pool is full ({max} workers)"),
            Error::Protocol(description) => write!(f, "protocol error: {description}"),
            Error::Spawn((e, description)) => write!(f, "{description}: spawn error: {e}"),
            Error::StreamClosed(id) => write!(f, "stream {id} is already closed"),
            Error::Timeout(duration, action) => {
                write!(f, "timeout reached ({:0.3}s) while {action}", duration.as_secs_f64())
            },
            Error::UnknownSelector(id) => write!(f, "failed to find selector with ID {id}"),
            Error::UnknownStream(id) => write!(f, "failed to find stream with ID {id}"),
            Error::Unsupported(what) => write!(f, "not supported on this platform: {what}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io((err, "failed"))
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Error::Codec(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io((err.into(), "system call failed"))
    }
}
