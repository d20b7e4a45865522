//! Port I/O capability
//!
//! The engine never touches hardware directly. Every register access goes
//! through a [`PortIo`] implementation handed to the engine at construction,
//! which keeps the state machine testable against a simulated channel.

/// Raw register access on absolute I/O port numbers.
pub trait PortIo {
    fn inb(&self, port: u16) -> u8;
    fn outb(&self, port: u16, value: u8);
    fn inw(&self, port: u16) -> u16;
    fn outw(&self, port: u16, value: u16);

    /// Read `buf.len()` words from a data port.
    fn insw(&self, port: u16, buf: &mut [u16]) {
        for word in buf.iter_mut() {
            *word = self.inw(port);
        }
    }

    /// Write `buf.len()` words to a data port.
    fn outsw(&self, port: u16, buf: &[u16]) {
        for &word in buf {
            self.outw(port, word);
        }
    }

    /// Busy-wait for roughly `us` microseconds.
    fn delay_us(&self, us: u32);
}

impl<P: PortIo + ?Sized> PortIo for &P {
    fn inb(&self, port: u16) -> u8 {
        (**self).inb(port)
    }

    fn outb(&self, port: u16, value: u8) {
        (**self).outb(port, value)
    }

    fn inw(&self, port: u16) -> u16 {
        (**self).inw(port)
    }

    fn outw(&self, port: u16, value: u16) {
        (**self).outw(port, value)
    }

    fn insw(&self, port: u16, buf: &mut [u16]) {
        (**self).insw(port, buf)
    }

    fn outsw(&self, port: u16, buf: &[u16]) {
        (**self).outsw(port, buf)
    }

    fn delay_us(&self, us: u32) {
        (**self).delay_us(us)
    }
}

#[cfg(target_arch = "x86_64")]
pub use self::x86::X86PortIo;

#[cfg(target_arch = "x86_64")]
mod x86 {
    use x86_64::instructions::port::Port;

    use super::PortIo;

    /// Unused POST diagnostic port, one write takes about a microsecond.
    const IO_WAIT_PORT: u16 = 0x80;

    /// Legacy port I/O through `in`/`out` instructions.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct X86PortIo;

    impl PortIo for X86PortIo {
        fn inb(&self, port: u16) -> u8 {
            unsafe { Port::<u8>::new(port).read() }
        }

        fn outb(&self, port: u16, value: u8) {
            unsafe { Port::<u8>::new(port).write(value) }
        }

        fn inw(&self, port: u16) -> u16 {
            unsafe { Port::<u16>::new(port).read() }
        }

        fn outw(&self, port: u16, value: u16) {
            unsafe { Port::<u16>::new(port).write(value) }
        }

        fn delay_us(&self, us: u32) {
            let mut wait = Port::<u8>::new(IO_WAIT_PORT);
            for _ in 0..us {
                unsafe { wait.write(0) };
            }
        }
    }
}
