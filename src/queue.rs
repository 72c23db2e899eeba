//! Fixed capacity byte queue between the UART receive interrupt and the
//! bootloader driver.
//!
//! All methods take `&self` and run inside a critical section, so a single
//! `static` queue can be pushed from the interrupt handler and drained from
//! the foreground loop.

use core::cell::RefCell;

use critical_section::Mutex;

struct Ring<const N: usize> {
    buf: [u8; N],
    head: usize,
    len: usize,
    overruns: usize,
}

impl<const N: usize> Ring<N> {
    fn push(&mut self, byte: u8) -> bool {
        if self.len == N {
            self.overruns += 1;
            return false;
        }
        self.buf[(self.head + self.len) % N] = byte;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % N;
        self.len -= 1;
        Some(byte)
    }
}

pub struct ByteQueue<const N: usize> {
    inner: Mutex<RefCell<Ring<N>>>,
}

impl<const N: usize> ByteQueue<N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Ring {
                buf: [0u8; N],
                head: 0,
                len: 0,
                overruns: 0,
            })),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Queue a byte without blocking, safe from interrupt context.
    ///
    /// Returns false and counts an overrun when the queue is full.
    pub fn push_no_wait(&self, byte: u8) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).push(byte))
    }

    pub fn pop(&self) -> Option<u8> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).pop())
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard queued bytes and any overrun count
    pub fn reset(&self) {
        critical_section::with(|cs| {
            let mut ring = self.inner.borrow_ref_mut(cs);
            ring.head = 0;
            ring.len = 0;
            ring.overruns = 0;
        })
    }

    /// Number of bytes dropped since the last call, clearing the count
    pub fn take_overruns(&self) -> usize {
        critical_section::with(|cs| core::mem::take(&mut self.inner.borrow_ref_mut(cs).overruns))
    }
}

impl<const N: usize> Default for ByteQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}
