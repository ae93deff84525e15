//! Console I/O is an out-of-scope collaborator (spec.md 1): the kernel
//! only needs something `cputs`/`cgetc` can drive through. Real hardware
//! backs this with the serial port the same way the teacher's `DebugCons`
//! does; tests use an in-memory buffer.

pub trait Console {
    fn putc(&mut self, c: u8);
    /// Non-blocking read. `None` when nothing is buffered (4.6, `cgetc`).
    fn try_getc(&mut self) -> Option<u8>;
}

#[cfg(not(test))]
pub struct SerialConsole;

#[cfg(not(test))]
impl Console for SerialConsole {
    fn putc(&mut self, c: u8) {
        use x86_64::instructions::port::Port;
        unsafe {
            let mut port: Port<u8> = Port::new(0x3f8);
            port.write(c);
        }
    }

    fn try_getc(&mut self) -> Option<u8> {
        None
    }
}

#[cfg(any(test, feature = "sim-memory"))]
#[derive(Default)]
pub struct BufferConsole {
    pub out: alloc::vec::Vec<u8>,
    pub input: alloc::collections::VecDeque<u8>,
}

#[cfg(any(test, feature = "sim-memory"))]
impl Console for BufferConsole {
    fn putc(&mut self, c: u8) {
        self.out.push(c);
    }

    fn try_getc(&mut self) -> Option<u8> {
        self.input.pop_front()
    }
}
