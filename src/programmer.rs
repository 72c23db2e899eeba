//! Bootloader handshake, erase and write over a [`SerialPort`].

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{
    framed, xor_checksum, BootloaderConfig, Command, CHECKSUM_VERSION, COMMAND_TABLE_LEN,
    GET_LENGTHS, MAX_CHUNK, UART_ACK, UART_DISC, UART_NACK,
};
use crate::{Cause, Error, Options, SerialPort};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Target is running its application, or has not been touched yet
    Idle,
    Handshaking,
    ConfigKnown,
    Erasing,
    Writing,
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

/// What the programmer knows about the attached bootloader.
///
/// The configuration is only replaced by a successful handshake, a failed one
/// keeps whatever was discovered before.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct BootloaderSession {
    state: State,
    config: Option<BootloaderConfig>,
}

impl BootloaderSession {
    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> Option<&BootloaderConfig> {
        self.config.as_ref()
    }

    /// Configuration for erase / write, present while the bootloader is active
    fn active_config(&self) -> Option<BootloaderConfig> {
        match self.state {
            State::ConfigKnown | State::Erasing | State::Writing => self.config,
            State::Idle | State::Handshaking => None,
        }
    }
}

pub struct Programmer<P, D, E> {
    session: BootloaderSession,
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            session: BootloaderSession::default(),
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.session.state
    }

    pub fn session(&self) -> &BootloaderSession {
        &self.session
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Restart the target into its ROM bootloader
    pub fn enter_bootloader(&mut self) {
        if self.options.no_reset {
            return;
        }

        debug!("Selecting bootloader and resetting target");

        if let Err(e) = self.port.set_boot_select(true) {
            warn!("Failed to assert boot-select: {:?}", e);
        }
        self.delay.delay_ms(self.options.init_delay_ms);
        self.pulse_reset();
    }

    /// Restart the target into its application, always succeeds
    pub fn exit_bootloader(&mut self) {
        self.session.state = State::Idle;

        if self.options.no_reset {
            return;
        }

        debug!("Deselecting bootloader and resetting target");

        if let Err(e) = self.port.set_boot_select(false) {
            warn!("Failed to release boot-select: {:?}", e);
        }
        self.delay.delay_ms(self.options.init_delay_ms);
        self.pulse_reset();
    }

    fn pulse_reset(&mut self) {
        if let Err(e) = self.port.set_reset(true) {
            warn!("Failed to assert reset: {:?}", e);
        }
        self.delay.delay_ms(self.options.init_delay_ms);
        if let Err(e) = self.port.set_reset(false) {
            warn!("Failed to release reset: {:?}", e);
        }
        self.delay.delay_ms(self.options.init_delay_ms);
    }

    /// Send the simulator's session reset command, ignored by real targets
    pub fn send_simulation_reset(&mut self) {
        if let Err(e) = self.send(&crate::protocol::SIMULATION_RESET) {
            warn!("Failed to send simulation reset: {}", e);
        }
    }

    /// Synchronise with the bootloader and discover its command set
    pub fn handshake(&mut self) -> Result<BootloaderConfig, Error<E>> {
        self.session.state = State::Handshaking;

        match self.get_config() {
            Ok(config) => {
                debug!("Bootloader configuration: {:02x?}", config);
                self.session.config = Some(config);
                self.session.state = State::ConfigKnown;
                Ok(config)
            }
            Err(e) => {
                self.session.state = State::Idle;
                Err(Error::HandshakeFailed(e))
            }
        }
    }

    fn get_config(&mut self) -> Result<BootloaderConfig, Cause<E>> {
        self.port.clear_input()?;

        debug!("Sending discovery character");
        self.send(&[UART_DISC])?;

        // The first byte read after the target comes out of reset can be a
        // stray zero, the ACK follows it
        let timeout = self.options.response_timeout_ms;
        let mut response = self.read_byte(timeout)?;
        if response == 0 {
            response = self.read_byte(timeout)?;
        }
        check_ack(response)?;

        debug!("Requesting command table");
        self.send(&Command::Get.framed())?;
        self.await_ack(timeout)?;

        let len = self.read_byte(timeout)?;
        if !GET_LENGTHS.contains(&len) {
            return Err(Cause::InvalidLength(len));
        }

        let mut table = [0u8; COMMAND_TABLE_LEN];
        self.read_exact(&mut table, timeout)?;

        let checksum = if table[0] == CHECKSUM_VERSION {
            Some(self.read_byte(timeout)?)
        } else {
            None
        };

        self.await_ack(timeout)?;

        Ok(BootloaderConfig::from_table(&table, checksum))
    }

    /// Mass erase the target flash
    pub fn erase(&mut self) -> Result<(), Error<E>> {
        let config = self.session.active_config().ok_or(Error::NotConfigured)?;
        self.session.state = State::Erasing;

        let r = self.erase_all(&config);
        self.session.state = State::ConfigKnown;

        r.map_err(Error::EraseFailed)
    }

    fn erase_all(&mut self, config: &BootloaderConfig) -> Result<(), Cause<E>> {
        debug!("Erasing flash (command 0x{:02x})", config.erase);

        self.send(&framed(config.erase))?;
        self.await_ack(self.options.response_timeout_ms)?;

        self.send(config.mass_erase())?;
        self.await_ack(self.options.erase_timeout_ms)
    }

    /// Write one block of at most 256 bytes at `address`.
    ///
    /// `checksum` is the XOR of `payload`. Failures are not retried, the
    /// target may be left partially written.
    pub fn write_block(&mut self, address: u32, payload: &[u8], checksum: u8) -> Result<(), Error<E>> {
        let config = self.session.active_config().ok_or(Error::NotConfigured)?;
        if payload.is_empty() || payload.len() > MAX_CHUNK {
            return Err(Error::WriteFailed(Cause::InvalidPayload(payload.len())));
        }
        self.session.state = State::Writing;

        let r = self.write_memory(&config, address, payload, checksum);
        self.session.state = State::ConfigKnown;

        r.map_err(Error::WriteFailed)
    }

    fn write_memory(
        &mut self,
        config: &BootloaderConfig,
        address: u32,
        payload: &[u8],
        checksum: u8,
    ) -> Result<(), Cause<E>> {
        let timeout = self.options.response_timeout_ms;
        trace!("Writing {} bytes at 0x{:08x}", payload.len(), address);

        self.send(&framed(config.write_memory))?;
        self.await_ack(timeout)?;

        let addr = address.to_be_bytes();
        self.send(&addr)?;
        self.send(&[xor_checksum(&addr)])?;
        self.await_ack(timeout)?;

        // N + 1 bytes follow a length byte of N
        let n = (payload.len() - 1) as u8;
        let checksum = if self.options.checksum_covers_length {
            checksum ^ n
        } else {
            checksum
        };

        self.send(&[n])?;
        self.send(payload)?;
        self.send(&[checksum])?;
        self.await_ack(timeout)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), Cause<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<(), Cause<E>> {
        for b in buf.iter_mut() {
            *b = self.read_byte(timeout_ms)?;
        }
        Ok(())
    }

    /// Poll for a single byte, giving up once `timeout_ms` has elapsed
    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, Cause<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut t = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            if t >= timeout_ms {
                error!("Receive timeout");
                return Err(Cause::ReadTimeout);
            }

            // Wait for delay period
            self.delay.delay_ms(poll);
            t += poll;
        }
    }

    fn await_ack(&mut self, timeout_ms: u32) -> Result<(), Cause<E>> {
        let v = self.read_byte(timeout_ms)?;
        check_ack(v)
    }
}

fn check_ack<E: core::fmt::Debug>(v: u8) -> Result<(), Cause<E>> {
    match v {
        UART_ACK => {
            trace!("Received bootloader ack");
            Ok(())
        }
        UART_NACK => {
            debug!("Received bootloader nack");
            Err(Cause::Nack)
        }
        _ => {
            debug!("Received unexpected value: 0x{:x}", v);
            Err(Cause::InvalidResponse(v))
        }
    }
}
