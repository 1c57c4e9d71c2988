use super::Addr;
use core::fmt;
use core::ops::{Add, Sub};

/// A linear (virtual) address.
#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct VAddr(usize);

impl VAddr {
    pub const fn from_val(val: usize) -> Self {
        Self(val)
    }

    /// Reinterpret the address as a pointer into the kernel's own address
    /// space. Only meaningful for addresses the kernel has mapped (or, in
    /// host tests, addresses inside the test's backing buffer).
    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl Addr for VAddr {
    fn addr(self) -> usize {
        let Self(addr) = self;
        addr
    }
}

impl From<usize> for VAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl Sub for VAddr {
    type Output = usize;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Sub<usize> for VAddr {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Add<usize> for VAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl fmt::Debug for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VAddr({:#x})", self.0)
    }
}
