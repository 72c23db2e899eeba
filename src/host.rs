//! Host side of the gateway link.
//!
//! The image is sent as one INIT, a FRAME per chunk and a closing RESET, each
//! waiting for the gateway's RESPONSE before the next goes out. Responses are
//! picked up by a separate receiver (see [`receive`]) and handed over through
//! a [`ResponseSlot`].

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::packet::{
    packet_kind, BuildError, FrameBuilder, InitBuilder, MsgPacket, PacketAssembler, PacketKind,
    ResetBuilder, ResponseCode, ResponsePacket, FRAME_ALIGN, FRAME_MAX_PAYLOAD, INIT_LEN,
    MAX_PACKET_LEN, RESET_LEN,
};

/// Start of flash on STM32 parts
pub const DEFAULT_BASE_ADDRESS: u32 = 0x0800_0000;

/// Must outlast the gateway's [`Options::init_latency_ms`](crate::Options::init_latency_ms),
/// the INIT response only comes back once the target is erased
pub const DEFAULT_RESPONSE_TIMEOUT_S: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to build packet: {0}")]
    Build(#[from] BuildError),

    #[error("no response from gateway within {0:?}")]
    ResponseTimeout(Duration),

    #[error("gateway rejected {0}")]
    Rejected(String),
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct FlashOptions {
    /// Flash address the image is written to
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x08000000", parse(try_from_str = parse_address)))]
    pub base_address: u32,

    /// Seconds to wait for each gateway response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "30"))]
    pub response_timeout_s: u64,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
            response_timeout_s: DEFAULT_RESPONSE_TIMEOUT_S,
        }
    }
}

impl FlashOptions {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_s)
    }
}

/// Parse a hex (`0x` prefixed) or decimal address
pub fn parse_address(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Hand-over point for gateway responses.
///
/// Holds at most one response, a newer one replaces an unclaimed older one.
#[derive(Default)]
pub struct ResponseSlot {
    code: Mutex<Option<ResponseCode>>,
    ready: Condvar,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a response and wake the waiter
    pub fn notify(&self, code: ResponseCode) {
        let mut slot = self.code.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(code);
        self.ready.notify_one();
    }

    /// Drop a response nobody waited for
    pub fn clear(&self) {
        self.code
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Block until a response arrives or `timeout` elapses
    pub fn wait_for_response(&self, timeout: Duration) -> Result<ResponseCode, Error> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.code.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some(code) = slot.take() {
                return Ok(code);
            }

            let now = Instant::now();
            if now >= deadline {
                error!("No response from gateway within {:?}", timeout);
                return Err(Error::ResponseTimeout(timeout));
            }

            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Route one packet from the gateway
pub fn handle_inbound(packet: &[u8], responses: &ResponseSlot) {
    trace!("Gateway packet: {:02x?}", packet);

    match packet_kind(packet) {
        Ok(PacketKind::Response) => match ResponsePacket::parse(packet) {
            Ok(p) => {
                debug!("Gateway response: {:?}", p.response_code());
                responses.notify(p.response_code());
            }
            Err(e) => warn!("Invalid response packet: {}", e),
        },
        Ok(PacketKind::Msg) => match MsgPacket::parse(packet) {
            Ok(p) => info!("gateway: {}", String::from_utf8_lossy(p.message()).trim_end_matches('\0')),
            Err(e) => warn!("Invalid message packet: {}", e),
        },
        Ok(kind) => warn!("Unexpected {:?} packet from gateway", kind),
        Err(e) => warn!("Incorrect packet from gateway: {}", e),
    }
}

/// Read packets from the gateway until `finished` is set or the link closes.
///
/// Read timeouts are expected, they give the loop a chance to check `finished`.
pub fn receive<R: Read>(mut rx: R, responses: &ResponseSlot, finished: &AtomicBool) -> io::Result<()> {
    let mut assembler = PacketAssembler::new();
    let mut byte = [0u8; 1];

    while !finished.load(Ordering::Relaxed) {
        match rx.read(&mut byte) {
            Ok(0) => {
                debug!("Gateway link closed");
                return Ok(());
            }
            Ok(_) => {
                if let Some(packet) = assembler.push(byte[0]) {
                    handle_inbound(packet, responses);
                }
            }
            Err(e) => match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => (),
                _ => return Err(e),
            },
        }
    }

    Ok(())
}

/// Sends an image through the gateway
pub struct Flasher<'a, W> {
    link: W,
    responses: &'a ResponseSlot,
    options: FlashOptions,
}

impl<'a, W: Write> Flasher<'a, W> {
    pub fn new(link: W, responses: &'a ResponseSlot, options: FlashOptions) -> Self {
        Self {
            link,
            responses,
            options,
        }
    }

    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    /// Put the target in its bootloader and erase it
    pub fn init(&mut self) -> Result<(), Error> {
        let mut buf = [0u8; INIT_LEN];
        let mut b = InitBuilder::new(&mut buf)?;
        b.set_address(self.options.base_address);

        info!("Initialising target, base 0x{:08x}", self.options.base_address);
        self.transact(b.as_bytes(), || "init".to_string())
    }

    /// Write `payload` at `address`, its length must be a multiple of 4
    pub fn send_frame(&mut self, address: u32, payload: &[u8]) -> Result<(), Error> {
        let mut buf = [0u8; MAX_PACKET_LEN];
        let mut b = FrameBuilder::new(&mut buf)?;
        b.set_address(address);
        b.append_payload(payload)?;

        self.transact(b.as_bytes(), || format!("frame at 0x{:08x}", address))
    }

    /// Return the target to its application
    pub fn reset(&mut self) -> Result<(), Error> {
        let mut buf = [0u8; RESET_LEN];
        let b = ResetBuilder::new(&mut buf)?;

        info!("Resetting target");
        self.transact(b.as_bytes(), || "reset".to_string())
    }

    /// Flash a whole image, returning the number of image bytes written.
    ///
    /// `progress` is called with the running byte count after each frame.
    pub fn flash<R: Read, F: FnMut(usize)>(&mut self, mut image: R, mut progress: F) -> Result<usize, Error> {
        self.init()?;

        let mut chunk = [0u8; FRAME_MAX_PAYLOAD];
        let mut sent = 0;

        loop {
            let n = match read_chunk(&mut image, &mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    error!("Reading image failed: {}", e);
                    if let Err(r) = self.reset() {
                        warn!("Reset after read failure failed: {}", r);
                    }
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }

            // Only the last chunk can be short, pad it to a whole word
            let padded = (n + FRAME_ALIGN - 1) & !(FRAME_ALIGN - 1);
            chunk[n..padded].iter_mut().for_each(|b| *b = 0);

            let address = self.options.base_address.wrapping_add(sent as u32);
            if let Err(e) = self.send_frame(address, &chunk[..padded]) {
                if let Error::Rejected(_) = e {
                    if let Err(r) = self.reset() {
                        warn!("Reset after rejected frame failed: {}", r);
                    }
                }
                return Err(e);
            }

            sent += n;
            progress(sent);

            if n < chunk.len() {
                break;
            }
        }

        self.reset()?;
        Ok(sent)
    }

    fn transact<F: FnOnce() -> String>(&mut self, packet: &[u8], what: F) -> Result<(), Error> {
        trace!("Sending {:02x?}", packet);

        self.responses.clear();
        self.link.write_all(packet)?;
        self.link.flush()?;

        match self.responses.wait_for_response(self.options.response_timeout())? {
            ResponseCode::Ack => Ok(()),
            code => {
                let what = what();
                error!("Gateway answered {:?} to {}", code, what);
                Err(Error::Rejected(what))
            }
        }
    }
}

/// Fill `buf` from `r`, short only at end of file
fn read_chunk<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(read) => n += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}
