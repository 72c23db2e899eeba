//! Gateway packet dispatch.
//!
//! Each host packet is handled to completion, including every bootloader
//! exchange it triggers, before the next one is looked at. The host gets a
//! RESPONSE for INIT, FRAME and RESET packets and any number of MSG packets
//! carrying diagnostics.

use core::fmt::{self, Write as _};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::serial::Write as UsbWrite;

use crate::packet::{
    packet_kind, FramePacket, InitPacket, MsgBuilder, PacketAssembler, PacketKind, ResetPacket,
    ResponseBuilder, ResponseCode, MAX_PACKET_LEN, RESPONSE_LEN,
};
use crate::programmer::Programmer;
use crate::protocol::{UART_DATA_BITS, UART_PARITY, UART_STOP_BITS};
use crate::SerialPort;

/// Format a diagnostic into a MSG packet for the host
macro_rules! report {
    ($d:expr, $($arg:tt)*) => {
        $d.report(format_args!($($arg)*))
    };
}

pub struct Dispatcher<P, D, E, U> {
    programmer: Programmer<P, D, E>,
    usb: U,
    release_target: bool,
}

impl<P, D, E, U> Dispatcher<P, D, E, U>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
    U: UsbWrite<u8>,
    U::Error: core::fmt::Debug,
{
    pub fn new(programmer: Programmer<P, D, E>, usb: U) -> Self {
        Self {
            programmer,
            usb,
            release_target: false,
        }
    }

    pub fn programmer(&self) -> &Programmer<P, D, E> {
        &self.programmer
    }

    pub fn programmer_mut(&mut self) -> &mut Programmer<P, D, E> {
        &mut self.programmer
    }

    pub fn usb(&self) -> &U {
        &self.usb
    }

    pub fn usb_mut(&mut self) -> &mut U {
        &mut self.usb
    }

    pub fn free(self) -> (Programmer<P, D, E>, U) {
        (self.programmer, self.usb)
    }

    /// Handle one complete packet from the host.
    ///
    /// Returns the response sent back, `None` for packets that get no answer.
    pub fn handle_packet(&mut self, data: &[u8]) -> Option<ResponseCode> {
        let kind = match packet_kind(data) {
            Ok(k) => k,
            Err(e) => {
                report!(self, "Incorrect packet received: {}", e);
                return Some(self.respond(ResponseCode::Nack));
            }
        };

        debug!("Handling {:?} packet ({} bytes)", kind, data.len());

        let code = match kind {
            PacketKind::Init => self.handle_init(data),
            PacketKind::Frame => self.handle_frame(data),
            PacketKind::Reset => self.handle_reset(data),
            PacketKind::Response | PacketKind::Msg => {
                warn!("Ignoring {:?} packet from host", kind);
                return None;
            }
        };

        Some(self.respond(code))
    }

    fn handle_init(&mut self, data: &[u8]) -> ResponseCode {
        let init = match InitPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                report!(self, "Received init packet incorrect: {}", e);
                return ResponseCode::Nack;
            }
        };

        let baud = self.programmer.options().target_baud;
        report!(
            self,
            "Target UART {} baud, {} data bits, {} parity, {} stop bit",
            baud,
            UART_DATA_BITS,
            UART_PARITY,
            UART_STOP_BITS
        );
        report!(self, "Entering bootloader, image base 0x{:08x}", init.address());
        self.programmer.enter_bootloader();

        let config = match self.programmer.handshake() {
            Ok(c) => c,
            Err(e) => return self.abort(e),
        };
        report!(self, "Bootloader version 0x{:02x} connected", config.version);

        report!(self, "Erasing flash");
        if let Err(e) = self.programmer.erase() {
            return self.abort(e);
        }
        report!(self, "Erasing flash done");

        ResponseCode::Ack
    }

    fn handle_frame(&mut self, data: &[u8]) -> ResponseCode {
        let frame = match FramePacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                report!(self, "Received frame packet incorrect: {}", e);
                return ResponseCode::Nack;
            }
        };

        match self
            .programmer
            .write_block(frame.address(), frame.payload(), frame.checksum())
        {
            Ok(()) => ResponseCode::Ack,
            Err(e) => {
                report!(self, "Writing 0x{:08x} failed: {}", frame.address(), e);
                ResponseCode::Nack
            }
        }
    }

    fn handle_reset(&mut self, data: &[u8]) -> ResponseCode {
        if let Err(e) = ResetPacket::parse(data) {
            report!(self, "Received reset packet incorrect: {}", e);
            return ResponseCode::Nack;
        }

        self.programmer.exit_bootloader();
        if self.programmer.options().simulation_reset {
            self.programmer.send_simulation_reset();
        }
        report!(self, "Reset done");

        ResponseCode::Ack
    }

    /// Report a failed INIT, the target is released once the NACK is out
    fn abort(&mut self, e: crate::Error<E>) -> ResponseCode {
        report!(self, "{}", e);
        self.release_target = true;
        ResponseCode::Nack
    }

    fn respond(&mut self, code: ResponseCode) -> ResponseCode {
        let mut buf = [0u8; RESPONSE_LEN];
        if let Ok(mut b) = ResponseBuilder::new(&mut buf) {
            b.set_response_code(code);
            self.send(b.as_bytes());
        }

        if core::mem::take(&mut self.release_target) {
            self.programmer.exit_bootloader();
        }

        code
    }

    /// Send a MSG packet to the host, truncated to fit one packet
    pub fn report(&mut self, args: fmt::Arguments) {
        info!("{}", args);

        let mut buf = [0u8; MAX_PACKET_LEN];
        let mut msg = match MsgBuilder::new(&mut buf) {
            Ok(b) => b,
            Err(_) => return,
        };
        let _ = msg.write_fmt(args);

        self.send(msg.as_bytes());
    }

    fn send(&mut self, data: &[u8]) {
        if let Err(e) = self.usb.bwrite_all(data).and_then(|_| self.usb.bflush()) {
            warn!("USB write failed: {:?}", e);
        }
    }
}

/// Foreground loop of the gateway: reassembles USB bytes into packets and
/// dispatches them in arrival order
pub struct Gateway<P, D, E, U> {
    assembler: PacketAssembler,
    dispatcher: Dispatcher<P, D, E, U>,
}

impl<P, D, E, U> Gateway<P, D, E, U>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
    U: UsbWrite<u8>,
    U::Error: core::fmt::Debug,
{
    pub fn new(dispatcher: Dispatcher<P, D, E, U>) -> Self {
        Self {
            assembler: PacketAssembler::new(),
            dispatcher,
        }
    }

    /// Feed bytes received from the host, handling every packet they complete
    pub fn on_usb_rx(&mut self, data: &[u8]) {
        for b in data {
            if let Some(packet) = self.assembler.push(*b) {
                self.dispatcher.handle_packet(packet);
            }
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<P, D, E, U> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<P, D, E, U> {
        &mut self.dispatcher
    }

    pub fn free(self) -> Dispatcher<P, D, E, U> {
        self.dispatcher
    }
}
