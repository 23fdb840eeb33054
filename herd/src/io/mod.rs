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

//! Readiness-based I/O multiplexing
//!
//! [Selector](selector::Selector) polls a set of owned [Stream](stream::Stream)s,
//! [Reactor](reactor::Reactor) merges many selectors into a single OS poll per tick.

pub mod ops;
pub mod reactor;
pub mod selector;
pub mod stream;
pub mod sys;

pub use ops::Ops;
pub use reactor::{Reactor, ReactorHandler};
pub use selector::{SelectionKey, Selector};
pub use stream::{Stream, StreamKind};
