//! STM32 Serial Bootloader bridge.
//!
//! Based on AN3155. A gateway device sits between a USB host and the target's
//! UART, the host frames the firmware image into [`packet`]s and the gateway
//! replays them as ROM bootloader commands through a [`Programmer`].
//!
//! - [`packet`]: host <-> gateway framing
//! - [`programmer`]: bootloader handshake, erase and write
//! - [`gateway`]: packet dispatch on the gateway
//! - [`bridge`] and [`queue`]: gateway side UART, GPIO and receive buffering
//! - [`host`]: the flashing side of the link (feature `std`)
//!
//! Without the `std` feature the crate is `no_std`, so everything the gateway
//! runs builds for the device.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod bridge;
pub mod gateway;
#[cfg(feature = "std")]
pub mod host;
pub mod packet;
pub mod programmer;
pub mod protocol;
pub mod queue;

#[cfg(feature = "linux")]
pub mod linux;

pub use bridge::{Bridge, BridgeError};
pub use gateway::{Dispatcher, Gateway};
pub use programmer::{BootloaderSession, Programmer, State};
pub use protocol::{BootloaderConfig, Command};
pub use queue::ByteQueue;

/// Link to the target bootloader: UART bytes plus the boot-select and reset lines
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    /// Drive the boot-select line, asserted selects the ROM bootloader
    fn set_boot_select(&mut self, asserted: bool) -> Result<(), E>;

    /// Drive the target reset line, asserted holds the target in reset
    fn set_reset(&mut self, asserted: bool) -> Result<(), E>;

    /// Drop anything received but not read yet
    fn clear_input(&mut self) -> Result<(), E> {
        Ok(())
    }
}

/// Why a single exchange with the bootloader failed
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Cause<E: core::fmt::Debug> {
    #[error("serial error: {0:?}")]
    Serial(E),

    #[error("timed out waiting for the bootloader")]
    ReadTimeout,

    #[error("bootloader NACK")]
    Nack,

    #[error("unexpected bootloader response 0x{0:02x}")]
    InvalidResponse(u8),

    #[error("unexpected command table length {0}")]
    InvalidLength(u8),

    #[error("invalid payload length {0}")]
    InvalidPayload(usize),
}

impl<E: core::fmt::Debug> From<E> for Cause<E> {
    fn from(e: E) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<E: core::fmt::Debug> {
    #[error("handshake failed: {0}")]
    HandshakeFailed(Cause<E>),

    #[error("erase failed: {0}")]
    EraseFailed(Cause<E>),

    #[error("write failed: {0}")]
    WriteFailed(Cause<E>),

    #[error("bootloader configuration unknown, handshake first")]
    NotConfigured,
}

impl<E: core::fmt::Debug> Error<E> {
    /// Underlying exchange failure, if any
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Error::HandshakeFailed(c) | Error::EraseFailed(c) | Error::WriteFailed(c) => Some(c),
            Error::NotConfigured => None,
        }
    }
}

pub const DEFAULT_RESPONSE_TIMEOUT_MS: u32 = 2000;

/// Mass erase of a large part can take tens of seconds
pub const DEFAULT_ERASE_TIMEOUT_MS: u32 = 20_000;

pub const DEFAULT_INIT_DELAY_MS: u32 = 100;

/// Line rate of the target UART unless the platform says otherwise
pub const DEFAULT_TARGET_BAUD: u32 = 115_200;

#[derive(Clone, PartialEq, Debug)]
pub struct Options {
    /// Do not toggle the boot-select and reset lines
    pub no_reset: bool,

    /// Time to wait for each byte from the bootloader
    pub response_timeout_ms: u32,

    /// Time to wait for the ACK closing a mass erase
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    pub poll_delay_ms: u32,

    /// Settling time between steps of the boot-select / reset sequence
    pub init_delay_ms: u32,

    /// Fold the length byte into the write checksum as AN3155 requires
    pub checksum_covers_length: bool,

    /// Send the simulator's session reset command when leaving the bootloader
    pub simulation_reset: bool,

    /// Line rate the platform set the target UART to, reported to the host
    pub target_baud: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            erase_timeout_ms: DEFAULT_ERASE_TIMEOUT_MS,
            poll_delay_ms: 1,
            init_delay_ms: DEFAULT_INIT_DELAY_MS,
            checksum_covers_length: true,
            simulation_reset: false,
            target_baud: DEFAULT_TARGET_BAUD,
        }
    }
}

impl Options {
    /// Longest an INIT can keep the gateway busy with a responsive target: the
    /// entry sequence, one slow handshake byte and a full mass erase
    pub fn init_latency_ms(&self) -> u32 {
        let entry = if self.no_reset { 0 } else { 3 * self.init_delay_ms };
        entry
            .saturating_add(self.response_timeout_ms)
            .saturating_add(self.erase_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_core_errors() {
        fn assert_error<T: core::error::Error>() {}

        assert_error::<Cause<core::convert::Infallible>>();
        assert_error::<Error<core::convert::Infallible>>();
        assert_error::<packet::DecodeError>();
        assert_error::<packet::BuildError>();
    }

    #[test]
    fn init_latency_covers_erase() {
        let o = Options::default();
        assert_eq!(o.init_latency_ms(), 300 + 2000 + 20_000);

        let quiet = Options {
            no_reset: true,
            ..Options::default()
        };
        assert_eq!(quiet.init_latency_ms(), 22_000);
    }
}
