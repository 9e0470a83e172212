//! Provides primitive operations for working with the CPUs I/O ports

pub mod com;

use core::ops;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use core::arch::asm;

/// A CPU I/O port number.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PortNumber(pub u16);

impl ops::Add<u16> for PortNumber {
    type Output = PortNumber;

    fn add(self, offset: u16) -> PortNumber {
        PortNumber(self.0 + offset)
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[inline]
pub unsafe fn outb(port: PortNumber, data: u8) {
    asm!("out dx, al", in("dx") port.0, in("al") data, options(nomem, nostack, preserves_flags));
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[inline]
pub unsafe fn inb(port: PortNumber) -> u8 {
    let data: u8;
    asm!("in al, dx", out("al") data, in("dx") port.0, options(nomem, nostack, preserves_flags));
    data
}
