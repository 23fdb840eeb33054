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

use crate::error::Error;
use alloc::sync::Arc;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::OnceLock;

/// Flag of the current process raised by [on_forked_termination]
static FORKED_TERMINATION: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_forked_termination(_: libc::c_int) {
    if let Some(flag) = FORKED_TERMINATION.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

/// Flag raised by SIGTERM or SIGINT
#[derive(Clone, Debug)]
pub struct SignalTriggeredFlagRef(Arc<AtomicBool>);

impl SignalTriggeredFlagRef {
    /// Register a flag for SIGTERM and SIGINT
    pub fn termination() -> Result<Self, Error> {
        let flag = Arc::new(AtomicBool::new(false));
        for signal in [SIGTERM, SIGINT] {
            signal_hook::flag::register(signal, Arc::clone(&flag))
                .map_err(|e| Error::Io((e, "can't register termination handler")))?;
        }
        Ok(Self(flag))
    }

    /// Flag for SIGTERM and SIGINT in a child created by `fork`
    ///
    /// The signal-hook registry is inherited from the parent and keeps the parent's
    /// handlers, and it never reinstalls a handler for a signal it already knows. So the
    /// child installs a plain handler of its own, after its dispositions were reset.
    pub fn forked_termination() -> Result<Self, Error> {
        let flag = Arc::clone(FORKED_TERMINATION.get_or_init(|| Arc::new(AtomicBool::new(false))));
        flag.store(false, Ordering::Relaxed);
        let action = SigAction::new(
            SigHandler::Handler(on_forked_termination),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in [Signal::SIGTERM, Signal::SIGINT] {
            // Safety: the handler only stores into an atomic
            unsafe { signal::sigaction(sig, &action) }
                .map_err(|e| Error::Io((e.into(), "can't install termination handler")))?;
        }
        Ok(Self(flag))
    }

    /// A flag that is only ever raised by [SignalTriggeredFlagRef::trigger]
    pub fn manual() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed)
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[test]
fn manual_flag_is_shared_between_clones() {
    let flag = SignalTriggeredFlagRef::manual();
    let clone = flag.clone();
    assert!(!clone.is_triggered());
    flag.trigger();
    assert!(clone.is_triggered());
}
