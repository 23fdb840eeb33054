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

//! Operation bits of a selection key

use crate::error::Error;
use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitmask over the operations a stream can be selected for
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Ops = Ops(0);
    pub const READ: Ops = Ops(1);
    pub const WRITE: Ops = Ops(2);
    pub const ACCEPT: Ops = Ops(4);
    pub const ALL: Ops = Ops(Self::READ.0 | Self::WRITE.0 | Self::ACCEPT.0);

    /// Build from raw bits, rejecting bits outside [Ops::ALL]
    pub fn from_bits(bits: u8) -> Result<Self, Error> {
        if bits & !Self::ALL.0 != 0 {
            return Err(Error::InvalidOps(bits));
        }
        Ok(Ops(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether all bits of `other` are set
    pub fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set
    pub fn intersects(self, other: Ops) -> bool {
        self.0 & other.0 != 0
    }

    /// Clear the bits of `other`
    pub fn remove(self, other: Ops) -> Ops {
        Ops(self.0 & !other.0)
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        Ops(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ops {
    type Output = Ops;

    fn bitand(self, rhs: Ops) -> Ops {
        Ops(self.0 & rhs.0)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [(Ops::READ, "READ"), (Ops::WRITE, "WRITE"), (Ops::ACCEPT, "ACCEPT")]
            .into_iter()
            .filter(|(op, _)| self.contains(*op))
            .map(|(_, name)| name)
            .collect();
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

#[test]
fn ops_bits() {
    assert_eq!(Ops::ALL.bits(), 7);
    assert_eq!((Ops::READ | Ops::WRITE).bits(), 3);
    assert!(Ops::ALL.contains(Ops::ACCEPT));
    assert_eq!(Ops::ALL.remove(Ops::WRITE), Ops::READ | Ops::ACCEPT);
    assert!(Ops::from_bits(7).is_ok());
    assert!(matches!(Ops::from_bits(8), Err(Error::InvalidOps(8))));
    assert_eq!(format!("{:?}", Ops::READ | Ops::ACCEPT), "READ|ACCEPT");
}
