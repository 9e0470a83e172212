//! Provides an interface to the serial COM ports (16550 compatible UARTs).

use core::fmt;

use super::PortNumber;

/// The usual address of the COM1 port.
pub const COM1_ADDR: PortNumber = PortNumber(0x3F8);

/// Register offsets relative to the base port.
const DATA: u16 = 0;
const INTERRUPT_ENABLE: u16 = 1;
const FIFO_CONTROL: u16 = 2;
const LINE_CONTROL: u16 = 3;
const MODEM_CONTROL: u16 = 4;
const LINE_STATUS: u16 = 5;

/// Line status bit: transmit holding register empty.
const LSR_THR_EMPTY: u8 = 0x20;

/// A safe interface to a serial port identified by its base port number.
#[derive(Debug, Eq, PartialEq)]
pub struct SerialPort(PortNumber);

impl SerialPort {
    /// Creates a new handle to a serial port.
    ///
    /// # Safety
    ///
    /// The caller must make sure that the port number refers to a COM port, that writing
    /// to it can do no harm, and that the same port is not instantiated twice.
    pub const unsafe fn new(port_number: PortNumber) -> SerialPort {
        SerialPort(port_number)
    }

    /// Programs the UART for 38400 baud, 8 data bits, no parity, one stop bit.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn init(&mut self) {
        let base = self.0;
        unsafe {
            super::outb(base + INTERRUPT_ENABLE, 0x00);
            // DLAB on, divisor 3 (115200 / 3)
            super::outb(base + LINE_CONTROL, 0x80);
            super::outb(base + DATA, 0x03);
            super::outb(base + INTERRUPT_ENABLE, 0x00);
            super::outb(base + LINE_CONTROL, 0x03);
            super::outb(base + FIFO_CONTROL, 0xC7);
            super::outb(base + MODEM_CONTROL, 0x0B);
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn write_byte(&mut self, data: u8) {
        unsafe {
            while super::inb(self.0 + LINE_STATUS) & LSR_THR_EMPTY == 0 {}
            super::outb(self.0 + DATA, data);
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn write(&mut self, data: &[u8]) {
        for &byte in data {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s.as_bytes());
        Ok(())
    }
}
