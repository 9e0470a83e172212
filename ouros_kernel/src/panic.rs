use bare_metal::cpu;
use bare_metal::cpu::io::com::{SerialPort, COM1_ADDR};

use core::fmt::Write;
use core::panic::PanicInfo;

use crate::logger;

#[panic_handler]
fn panic(panic_info: &PanicInfo) -> ! {
    // The logger may hold the port if the panic happened while logging. Fall back to a fresh
    // handle then, interleaved output beats none.
    match logger::COM1.try_lock() {
        Some(mut com1) => {
            let _ = writeln!(com1, "[PANIC] {}", panic_info);
        }
        None => {
            let mut com1 = unsafe { SerialPort::new(COM1_ADDR) };
            let _ = writeln!(com1, "[PANIC] {}", panic_info);
        }
    }

    unsafe { cpu::hang() }
}
