//! Gateway side link to the target.
//!
//! Received UART bytes arrive through a [`ByteQueue`] filled by the platform's
//! receive interrupt, transmitted bytes go straight to the UART, and the
//! BOOT0 / NRST lines are plain output pins.

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial::{Read, Write};

use crate::queue::ByteQueue;
use crate::SerialPort;

#[derive(Clone, PartialEq, Debug)]
pub enum BridgeError<U, P> {
    Uart(U),
    Pin(P),
    /// Bytes were dropped by the receive queue, the exchange is out of sync
    Overrun(usize),
}

pub struct Bridge<'q, U, B, R, const N: usize> {
    uart: U,
    rx: &'q ByteQueue<N>,
    boot0: B,
    nrst: R,
}

impl<'q, U, B, R, const N: usize> Bridge<'q, U, B, R, N> {
    /// `rx` must be fed from the platform's receive interrupt through [`on_uart_rx`]
    pub fn new(uart: U, rx: &'q ByteQueue<N>, boot0: B, nrst: R) -> Self {
        Self {
            uart,
            rx,
            boot0,
            nrst,
        }
    }

    pub fn free(self) -> (U, B, R) {
        (self.uart, self.boot0, self.nrst)
    }
}

/// Receive interrupt hook, call once per byte read from the UART.
///
/// Never blocks, a full queue drops the byte and the next read reports
/// [`BridgeError::Overrun`].
pub fn on_uart_rx<const N: usize>(rx: &ByteQueue<N>, byte: u8) {
    let _ = rx.push_no_wait(byte);
}

impl<'q, U, B, R, P, const N: usize> Write<u8> for Bridge<'q, U, B, R, N>
where
    U: Write<u8>,
    B: OutputPin<Error = P>,
    R: OutputPin<Error = P>,
{
    type Error = BridgeError<U::Error, P>;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.uart.write(word).map_err(|e| e.map(BridgeError::Uart))
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        self.uart.flush().map_err(|e| e.map(BridgeError::Uart))
    }
}

impl<'q, U, B, R, P, const N: usize> Read<u8> for Bridge<'q, U, B, R, N>
where
    U: Write<u8>,
    B: OutputPin<Error = P>,
    R: OutputPin<Error = P>,
{
    type Error = BridgeError<U::Error, P>;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        let dropped = self.rx.take_overruns();
        if dropped > 0 {
            warn!("UART receive queue dropped {} bytes", dropped);
            return Err(nb::Error::Other(BridgeError::Overrun(dropped)));
        }

        self.rx.pop().ok_or(nb::Error::WouldBlock)
    }
}

impl<'q, U, B, R, P, const N: usize> SerialPort<BridgeError<U::Error, P>> for Bridge<'q, U, B, R, N>
where
    U: Write<u8>,
    B: OutputPin<Error = P>,
    R: OutputPin<Error = P>,
{
    fn set_boot_select(&mut self, asserted: bool) -> Result<(), BridgeError<U::Error, P>> {
        let r = if asserted {
            self.boot0.set_high()
        } else {
            self.boot0.set_low()
        };
        r.map_err(BridgeError::Pin)
    }

    fn set_reset(&mut self, asserted: bool) -> Result<(), BridgeError<U::Error, P>> {
        // NRST is active low
        let r = if asserted {
            self.nrst.set_low()
        } else {
            self.nrst.set_high()
        };
        r.map_err(BridgeError::Pin)
    }

    fn clear_input(&mut self) -> Result<(), BridgeError<U::Error, P>> {
        self.rx.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    #[derive(Default)]
    struct Uart(Vec<u8>);

    impl Write<u8> for Uart {
        type Error = Infallible;

        fn write(&mut self, word: u8) -> nb::Result<(), Infallible> {
            self.0.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), Infallible> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Pin(Vec<bool>);

    impl OutputPin for Pin {
        type Error = Infallible;

        fn set_low(&mut self) -> Result<(), Infallible> {
            self.0.push(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.0.push(true);
            Ok(())
        }
    }

    #[test]
    fn reads_from_queue_and_writes_to_uart() {
        let rx = ByteQueue::<4>::new();
        let mut b = Bridge::new(Uart::default(), &rx, Pin::default(), Pin::default());

        assert_eq!(b.read(), Err(nb::Error::WouldBlock));
        on_uart_rx(&rx, 0x79);
        assert_eq!(b.read(), Ok(0x79));

        b.write(0x7F).unwrap();
        let (uart, _, _) = b.free();
        assert_eq!(uart.0, vec![0x7F]);
    }

    #[test]
    fn overrun_is_reported_once() {
        let rx = ByteQueue::<2>::new();
        let mut b = Bridge::new(Uart::default(), &rx, Pin::default(), Pin::default());

        for v in 0..4 {
            on_uart_rx(&rx, v);
        }

        assert_eq!(b.read(), Err(nb::Error::Other(BridgeError::Overrun(2))));
        assert_eq!(b.read(), Ok(0));
    }

    #[test]
    fn pin_polarity() {
        let rx = ByteQueue::<2>::new();
        let mut b = Bridge::new(Uart::default(), &rx, Pin::default(), Pin::default());

        b.set_boot_select(true).unwrap();
        b.set_reset(true).unwrap();
        b.set_reset(false).unwrap();
        b.set_boot_select(false).unwrap();

        let (_, boot0, nrst) = b.free();
        assert_eq!(boot0.0, vec![true, false]);
        assert_eq!(nrst.0, vec![false, true]);
    }

    #[test]
    fn clear_input_drops_stale_bytes() {
        let rx = ByteQueue::<4>::new();
        let mut b = Bridge::new(Uart::default(), &rx, Pin::default(), Pin::default());

        on_uart_rx(&rx, 0x00);
        b.clear_input().unwrap();
        assert_eq!(b.read(), Err(nb::Error::WouldBlock));
    }
}
