//! Reactive STM32 bootloader model and recording HAL mocks shared by the
//! integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::serial::Write as BlockingWrite;
use embedded_hal::serial::{Read, Write};

use stm32_uart_bridge::packet::PacketAssembler;
use stm32_uart_bridge::protocol::{SIMULATION_RESET, UART_ACK, UART_DISC, UART_NACK};
use stm32_uart_bridge::SerialPort;

pub const BASE: u32 = 0x0800_0000;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub version: u8,
    /// Length byte sent ahead of the Get table
    pub get_len: u8,
    pub erase_code: u8,
    /// Send a zero ahead of the first ACK after reset
    pub leading_zero: bool,
    /// Byte answered to the discovery character
    pub discovery_reply: u8,
    pub nack_get: bool,
    pub nack_erase: bool,
    /// Expect the write length byte folded into the write checksum
    pub checksum_covers_length: bool,
    /// Never answer anything
    pub silent: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            version: 0x31,
            get_len: 11,
            erase_code: 0x43,
            leading_zero: false,
            discovery_reply: UART_ACK,
            nack_get: false,
            nack_erase: false,
            checksum_covers_length: true,
            silent: false,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum PinEvent {
    BootSelect(bool),
    Reset(bool),
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Stage {
    Application,
    HeldInReset,
    AwaitDiscovery,
    Command,
    EraseArgs,
    WriteAddress,
    WriteData(u32),
}

pub struct SimTarget {
    pub config: SimConfig,
    stage: Stage,
    boot_select: bool,
    input: Vec<u8>,
    output: VecDeque<u8>,

    /// Everything the programmer sent, in order
    pub received: Vec<u8>,
    pub pins: Vec<PinEvent>,
    pub flash: BTreeMap<u32, u8>,
    pub erase_count: usize,
    pub simulation_resets: usize,
}

impl SimTarget {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            stage: Stage::Application,
            boot_select: false,
            input: Vec::new(),
            output: VecDeque::new(),
            received: Vec::new(),
            pins: Vec::new(),
            flash: BTreeMap::new(),
            erase_count: 0,
            simulation_resets: 0,
        }
    }

    /// Target already sitting in its bootloader, as after a manual reset
    pub fn in_bootloader(config: SimConfig) -> Self {
        let mut t = Self::new(config);
        t.stage = Stage::AwaitDiscovery;
        t
    }

    pub fn in_application(&self) -> bool {
        self.stage == Stage::Application
    }

    /// Bytes queued for the programmer but never read
    pub fn unread(&self) -> usize {
        self.output.len()
    }

    /// Times the target was released from reset with boot-select low
    pub fn application_starts(&self) -> usize {
        let mut boot = false;
        let mut n = 0;
        for e in &self.pins {
            match *e {
                PinEvent::BootSelect(v) => boot = v,
                PinEvent::Reset(false) if !boot => n += 1,
                PinEvent::Reset(_) => (),
            }
        }
        n
    }

    /// Flash contents, erased bytes read back as 0xFF
    pub fn read_flash(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| *self.flash.get(&(address + i)).unwrap_or(&0xFF))
            .collect()
    }

    fn reply(&mut self, data: &[u8]) {
        if !self.config.silent {
            self.output.extend(data);
        }
    }

    fn table(&self) -> [u8; 12] {
        [
            self.config.version,
            0x00,
            0x01,
            0x02,
            0x11,
            0x21,
            0x31,
            self.config.erase_code,
            0x63,
            0x73,
            0x82,
            0x92,
        ]
    }

    fn mass_erase_args(&self) -> &'static [u8] {
        if self.config.erase_code == 0x44 {
            &[0xFF, 0xFF, 0x00]
        } else {
            &[0xFF, 0x00]
        }
    }

    fn accept(&mut self, byte: u8) {
        self.received.push(byte);
        self.input.push(byte);

        match self.stage {
            Stage::Application => {
                if self.input.ends_with(&SIMULATION_RESET) {
                    self.simulation_resets += 1;
                    self.input.clear();
                }
            }
            Stage::HeldInReset => self.input.clear(),
            Stage::AwaitDiscovery => {
                if byte == UART_DISC {
                    if self.config.leading_zero {
                        self.reply(&[0x00]);
                    }
                    let reply = self.config.discovery_reply;
                    self.reply(&[reply]);
                    self.stage = Stage::Command;
                }
                self.input.clear();
            }
            Stage::Command => {
                if self.input.len() < 2 {
                    return;
                }
                let (code, complement) = (self.input[0], self.input[1]);
                self.input.clear();

                if code != !complement || (code == 0x00 && self.config.nack_get) {
                    self.reply(&[UART_NACK]);
                } else if code == 0x00 {
                    let table = self.table();
                    self.reply(&[UART_ACK, self.config.get_len]);
                    self.reply(&table);
                    if self.config.version == 0x33 {
                        let checksum = table.iter().fold(self.config.get_len, |a, b| a ^ b);
                        self.reply(&[checksum]);
                    }
                    self.reply(&[UART_ACK]);
                } else if code == self.config.erase_code {
                    if self.config.nack_erase {
                        self.reply(&[UART_NACK]);
                    } else {
                        self.reply(&[UART_ACK]);
                        self.stage = Stage::EraseArgs;
                    }
                } else if code == 0x31 {
                    self.reply(&[UART_ACK]);
                    self.stage = Stage::WriteAddress;
                } else {
                    self.reply(&[UART_NACK]);
                }
            }
            Stage::EraseArgs => {
                let expected = self.mass_erase_args();
                if self.input.len() < expected.len() {
                    return;
                }
                if self.input == expected {
                    self.flash.clear();
                    self.erase_count += 1;
                    self.reply(&[UART_ACK]);
                } else {
                    self.reply(&[UART_NACK]);
                }
                self.input.clear();
                self.stage = Stage::Command;
            }
            Stage::WriteAddress => {
                if self.input.len() < 5 {
                    return;
                }
                let a = &self.input[..4];
                if a.iter().fold(0, |x, b| x ^ b) == self.input[4] {
                    let address = u32::from_be_bytes([a[0], a[1], a[2], a[3]]);
                    self.reply(&[UART_ACK]);
                    self.stage = Stage::WriteData(address);
                } else {
                    self.reply(&[UART_NACK]);
                    self.stage = Stage::Command;
                }
                self.input.clear();
            }
            Stage::WriteData(address) => {
                let n = self.input[0] as usize;
                if self.input.len() < n + 3 {
                    return;
                }
                let payload = self.input[1..n + 2].to_vec();
                let seed = if self.config.checksum_covers_length {
                    n as u8
                } else {
                    0
                };
                let checksum = payload.iter().fold(seed, |x, b| x ^ b);

                if checksum == self.input[n + 2] {
                    for (i, b) in payload.iter().enumerate() {
                        self.flash.insert(address + i as u32, *b);
                    }
                    self.reply(&[UART_ACK]);
                } else {
                    self.reply(&[UART_NACK]);
                }
                self.input.clear();
                self.stage = Stage::Command;
            }
        }
    }
}

impl Write<u8> for SimTarget {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Infallible> {
        self.accept(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Infallible> {
        Ok(())
    }
}

impl Read<u8> for SimTarget {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Infallible> {
        self.output.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<Infallible> for SimTarget {
    fn set_boot_select(&mut self, asserted: bool) -> Result<(), Infallible> {
        self.pins.push(PinEvent::BootSelect(asserted));
        self.boot_select = asserted;
        Ok(())
    }

    fn set_reset(&mut self, asserted: bool) -> Result<(), Infallible> {
        self.pins.push(PinEvent::Reset(asserted));
        self.input.clear();
        self.output.clear();

        self.stage = if asserted {
            Stage::HeldInReset
        } else if self.boot_select {
            Stage::AwaitDiscovery
        } else {
            Stage::Application
        };
        Ok(())
    }
}

/// Records requested delays instead of sleeping
#[derive(Default)]
pub struct MockDelay {
    pub calls: Vec<u32>,
}

impl MockDelay {
    pub fn total_ms(&self) -> u32 {
        self.calls.iter().sum()
    }
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.calls.push(ms);
    }
}

/// USB side of the gateway, collects everything sent to the host
#[derive(Default)]
pub struct UsbSink {
    pub sent: Vec<u8>,
}

impl UsbSink {
    /// Split the collected bytes into packets, emptying the sink
    pub fn take_packets(&mut self) -> Vec<Vec<u8>> {
        let mut assembler = PacketAssembler::new();
        let mut packets = Vec::new();
        for b in self.sent.drain(..) {
            if let Some(p) = assembler.push(b) {
                packets.push(p.to_vec());
            }
        }
        packets
    }
}

impl BlockingWrite<u8> for UsbSink {
    type Error = Infallible;

    fn bwrite_all(&mut self, buffer: &[u8]) -> Result<(), Infallible> {
        self.sent.extend_from_slice(buffer);
        Ok(())
    }

    fn bflush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}
