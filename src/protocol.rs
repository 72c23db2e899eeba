//! STM32 ROM bootloader command set (AN3155)

/// Sent once after reset so the bootloader can detect the baud rate
pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Maximum number of bytes a single Write Memory command accepts
pub const MAX_CHUNK: usize = 256;

/// Accepted values of the length byte in a Get response
pub const GET_LENGTHS: [u8; 2] = [11, 12];

/// Version + the eleven command codes reported by Get
pub const COMMAND_TABLE_LEN: usize = 12;

/// Bootloader version that appends a checksum command code to the Get table
pub const CHECKSUM_VERSION: u8 = 0x33;

/// Character format the ROM bootloader requires: 8 data bits, even parity, 1 stop bit
pub const UART_DATA_BITS: u8 = 8;
pub const UART_PARITY: &str = "even";
pub const UART_STOP_BITS: u8 = 1;

/// Custom command understood by the bootloader simulator, ends its session
pub const SIMULATION_RESET: [u8; 2] = [0x03, 0xFC];

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    /// Command code followed by its complement, as framed on the wire
    pub fn framed(self) -> [u8; 2] {
        framed(self as u8)
    }
}

/// Frame a raw command code with its complement
pub fn framed(code: u8) -> [u8; 2] {
    [code, code ^ 0xFF]
}

/// XOR of every byte in `data`
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Capabilities reported by the target in response to Get.
///
/// Each field holds the command code the target expects for that operation,
/// which is normally the matching [`Command`] value.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct BootloaderConfig {
    pub version: u8,
    pub get: u8,
    pub get_version: u8,
    pub get_id: u8,
    pub read_memory: u8,
    pub go: u8,
    pub write_memory: u8,
    pub erase: u8,
    pub write_protect: u8,
    pub write_unprotect: u8,
    pub readout_protect: u8,
    pub readout_unprotect: u8,
    /// Only reported by version 0x33 bootloaders
    pub checksum: Option<u8>,
}

impl BootloaderConfig {
    /// Build a configuration from the Get table, in the order the target sends it
    pub fn from_table(table: &[u8; COMMAND_TABLE_LEN], checksum: Option<u8>) -> Self {
        Self {
            version: table[0],
            get: table[1],
            get_version: table[2],
            get_id: table[3],
            read_memory: table[4],
            go: table[5],
            write_memory: table[6],
            erase: table[7],
            write_protect: table[8],
            write_unprotect: table[9],
            readout_protect: table[10],
            readout_unprotect: table[11],
            checksum,
        }
    }

    /// Whether the target uses two byte page numbers for erase
    pub fn extended_erase(&self) -> bool {
        self.erase == Command::ExtendedErase as u8
    }

    /// Payload that requests a mass erase with the target's erase command
    pub fn mass_erase(&self) -> &'static [u8] {
        if self.extended_erase() {
            &[0xFF, 0xFF, 0x00]
        } else {
            &[0xFF, 0x00]
        }
    }
}
