// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Formatters for interrupt tracing.

use core::fmt;

pub struct HexBuf<'a>(pub &'a [u8]);

impl fmt::Debug for HexBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, b) in self.0.iter().enumerate() {
            write!(f, "{}{:02x}", if i > 0 { " " } else { "" }, b)?;
        }
        write!(f, "]")
    }
}

macro_rules! debug_flags {
    ( $tyname:ident {$( $flag:ident = $offset:expr; )*} ) => {

        pub struct $tyname(pub u16);

        impl fmt::Debug for $tyname {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let w: u16 = self.0;
                write!(f, "{{")?;
                $(
                    if w & (1 << $offset) != 0 {
                        write!(f, "{} ", stringify!($flag))?;
                    }
                )*
                write!(f, "}}")
            }
        }
    };
}

debug_flags!(IntSts0Flags {
    VBINT = 15;
    RESM = 14;
    SOFR = 13;
    DVST = 12;
    CTRT = 11;
    BEMP = 10;
    NRDY = 9;
    BRDY = 8;
    VALID = 3;
});

debug_flags!(IntSts1Flags {
    OVRCR = 15;
    BCHG = 14;
    DTCH = 12;
    ATTCH = 11;
    EOFERR = 6;
    SIGN = 5;
    SACK = 4;
});

/// A `BRDYSTS`/`NRDYSTS`/`BEMPSTS` bitmap.
pub struct PipeBitmap(pub u16);

impl fmt::Debug for PipeBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for pipe in 0..16 {
            if self.0 & (1 << pipe) != 0 {
                write!(f, " P{}", pipe)?;
            }
        }
        write!(f, " }}")
    }
}
