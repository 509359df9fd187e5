//! Machine address handling for the relift decompiler

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// A native machine address.
///
/// Addresses are printed in fixed-width hex (`0x00001000`) so that CFG and
/// RTL dumps are byte-stable across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u64);

impl Address {
    pub const ZERO: Address = Address(0);

    pub fn new(value: u64) -> Self {
        Address(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Offset of `self` from `base`, if `self >= base`.
    pub fn offset_from(self, base: Address) -> Option<u64> {
        self.0.checked_sub(base.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Add<u64> for Address {
    type Output = Address;

    fn add(self, rhs: u64) -> Address {
        Address(self.0 + rhs)
    }
}

impl AddAssign<u64> for Address {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<u64> for Address {
    type Output = Address;

    fn sub(self, rhs: u64) -> Address {
        Address(self.0 - rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_fixed_width() {
        assert_eq!(Address(0x1000).to_string(), "0x00001000");
        assert_eq!(Address(0x10684).to_string(), "0x00010684");
        assert_eq!(Address(0).to_string(), "0x00000000");
    }

    #[test]
    fn test_arithmetic() {
        let a = Address(0x1000);
        assert_eq!(a + 4, Address(0x1004));
        assert_eq!(a + 4 - 4, a);
        assert_eq!((a + 8).offset_from(a), Some(8));
        assert_eq!(a.offset_from(a + 8), None);
    }

    #[test]
    fn test_ordering() {
        assert!(Address(0x1000) < Address(0x1004));
    }
}
