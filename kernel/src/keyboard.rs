//! PS/2 keyboard driver: ISR reads a raw scancode and pushes it into a ring
//! buffer; `/dev/tty1` (the only consumer) drains the buffer and decodes it.
//!
//! Decoding (shift/caps/ctrl state machine) deliberately does not live here:
//! the base spec places scancode-to-ASCII translation and editor-key
//! handling inside the tty device, not the driver, so this module stays a
//! thin producer.

use crate::config::KEYBOARD_RING_CAPACITY;
use crate::sync::IrqSpinLock;

const DATA_PORT: u16 = 0x60;

struct RingBuffer {
    buf: [u8; KEYBOARD_RING_CAPACITY],
    head: usize,
    tail: usize,
    len: usize,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            buf: [0; KEYBOARD_RING_CAPACITY],
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    /// Pushes `byte`. If full, drops the oldest byte to make room (P8: the
    /// buffer drops the oldest event on overflow, never the newest).
    fn push(&mut self, byte: u8) {
        if self.len == self.buf.len() {
            self.head = (self.head + 1) % self.buf.len();
            self.len -= 1;
        }
        self.buf[self.tail] = byte;
        self.tail = (self.tail + 1) % self.buf.len();
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        Some(byte)
    }
}

static RING: IrqSpinLock<RingBuffer> = IrqSpinLock::new(RingBuffer::new());

/// Process woken (set `READY` if it was `BLOCKED`) whenever a scancode
/// arrives. Set by `/dev/tty1` before it blocks on an empty buffer.
static WAITING_PROCESS: IrqSpinLock<Option<*mut crate::process::Process>> = IrqSpinLock::new(None);

/// Registers `process` to be woken on the next scancode.
///
/// # Safety
/// `process` must remain valid (not freed) until either a scancode arrives
/// or [`clear_waiting_process`] is called.
pub unsafe fn set_waiting_process(process: *mut crate::process::Process) {
    *WAITING_PROCESS.lock() = Some(process);
}

/// Clears the waiting-process registration without waking it.
pub fn clear_waiting_process() {
    *WAITING_PROCESS.lock() = None;
}

/// Reads one pending scancode, if any.
pub fn pop_scancode() -> Option<u8> {
    RING.lock().pop()
}

/// IRQ1 handler: reads the scancode, buffers it, and wakes the waiting
/// process if one is registered.
pub fn on_keyboard_irq() {
    // SAFETY: port 0x60 is the architectural PS/2 data port; reading it
    // acknowledges the keyboard's byte and has no other side effect.
    let scancode = read_data_port();
    RING.lock().push(scancode);

    let waiting = WAITING_PROCESS.lock().take();
    if let Some(process) = waiting {
        // SAFETY: the registration contract in `set_waiting_process`
        // guarantees this pointer is still valid.
        unsafe {
            crate::process::wake_if_blocked(process);
        }
    }

    crate::apic::send_eoi();
}

#[cfg(target_os = "none")]
fn read_data_port() -> u8 {
    use x86_64::instructions::port::Port;
    let mut port: Port<u8> = Port::new(DATA_PORT);
    // SAFETY: reading the PS/2 controller's data port is the documented way
    // to retrieve a pending scancode byte.
    unsafe { port.read() }
}

#[cfg(not(target_os = "none"))]
fn read_data_port() -> u8 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_fifo_order() {
        let mut ring = RingBuffer::new();
        ring.push(1);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn ring_buffer_drops_oldest_on_overflow() {
        let mut ring = RingBuffer::new();
        for i in 0..(KEYBOARD_RING_CAPACITY + 2) {
            ring.push(i as u8);
        }
        // The oldest two entries (0, 1) were evicted.
        assert_eq!(ring.pop(), Some(2));
    }
}
