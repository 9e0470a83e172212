//! The handful of privileged instructions the boot path needs.

pub mod io;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use core::arch::asm;

/// Pause the CPU until the next interrupt arrives.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[inline]
pub unsafe fn hlt() {
    asm!("hlt", options(nomem, nostack));
}

/// Mask maskable interrupts on the current CPU.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[inline]
pub unsafe fn cli() {
    asm!("cli", options(nomem, nostack));
}

/// Stop the CPU for good. Interrupts are masked first, so only an NMI can wake it,
/// and it goes straight back to sleep afterwards.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub unsafe fn hang() -> ! {
    cli();
    loop {
        hlt();
    }
}
