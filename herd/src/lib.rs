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

//! herd keeps a pool of worker executors alive on one host.
//!
//! # Workers and Backends
//!
//! A [Scheduler](crate::scheduler::Scheduler) creates, retires and replaces workers as told by a
//! [Discipline](crate::discipline::Discipline). Workers run in a forked process, a spawned
//! subprocess or a thread, depending on the [execution backend](crate::mpm) in use.
//!
//! # Control Channel
//!
//! Scheduler and workers talk over a loopback [IPC bus](crate::ipc) with audience based
//! routing. Workers push their [status](crate::worker::state::WorkerState) over it.
//!
//! # I/O
//!
//! Everything in the control process is driven by one [Reactor](crate::io::Reactor), which
//! merges any number of [Selectors](crate::io::Selector) into a single poll per tick.
//! Protocol plug-ins use the same machinery through [MessageComponent](crate::component::MessageComponent).

extern crate alloc;

pub mod component;
pub mod config;
pub mod discipline;
pub mod error;
pub mod flow;
pub mod ids;
pub mod io;
pub mod ipc;
pub mod lifecycle;
pub mod mpm;
pub mod os_signals;
pub mod pid_file;
pub mod scheduler;
pub mod worker;
