//! Host <-> gateway packet framing.
//!
//! Every packet starts with `[total_length][kind]`. Builders stamp that header
//! into a caller supplied buffer and expose only the setters valid for their
//! kind, parsers validate a byte slice and hand back a read-only view. Neither
//! side allocates or copies, accessors read straight from fixed offsets.
//!
//! | Kind     | Code | Length   | Body                                          |
//! |----------|------|----------|-----------------------------------------------|
//! | Init     | 0x00 | 6        | target base address (u32, big endian)         |
//! | Frame    | 0x01 | 8..=252  | address (u32 BE), size, xor checksum, payload |
//! | Reset    | 0x02 | 2        |                                               |
//! | Response | 0x03 | 3        | response code                                 |
//! | Msg      | 0x04 | 3..=255  | size, text                                    |

use core::convert::TryFrom;
use core::fmt;
use core::marker::PhantomData;

pub const LENGTH_POS: usize = 0;
pub const KIND_POS: usize = 1;
pub const HEADER_LEN: usize = 2;

/// Largest packet on the link, `total_length` must fit its byte
pub const MAX_PACKET_LEN: usize = 255;

pub const INIT_ADDR_POS: usize = 2;
pub const INIT_LEN: usize = 6;

pub const FRAME_ADDR_POS: usize = 2;
pub const FRAME_SIZE_POS: usize = 6;
pub const FRAME_CHECKSUM_POS: usize = 7;
pub const FRAME_PAYLOAD_POS: usize = 8;
pub const FRAME_HEADER_LEN: usize = FRAME_PAYLOAD_POS;
/// Frame payloads are written in whole words
pub const FRAME_ALIGN: usize = 4;
pub const FRAME_MAX_PAYLOAD: usize = (MAX_PACKET_LEN - FRAME_HEADER_LEN) & !(FRAME_ALIGN - 1);

pub const RESET_LEN: usize = 2;

pub const RESPONSE_CODE_POS: usize = 2;
pub const RESPONSE_LEN: usize = 3;

pub const MSG_SIZE_POS: usize = 2;
pub const MSG_PAYLOAD_POS: usize = 3;
pub const MSG_HEADER_LEN: usize = MSG_PAYLOAD_POS;
pub const MSG_MAX_PAYLOAD: usize = MAX_PACKET_LEN - MSG_HEADER_LEN;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PacketKind {
    Init = 0x00,
    Frame = 0x01,
    Reset = 0x02,
    Response = 0x03,
    Msg = 0x04,
}

impl TryFrom<u8> for PacketKind {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x00 => Ok(PacketKind::Init),
            0x01 => Ok(PacketKind::Frame),
            0x02 => Ok(PacketKind::Reset),
            0x03 => Ok(PacketKind::Response),
            0x04 => Ok(PacketKind::Msg),
            _ => Err(DecodeError::UnknownKind(v)),
        }
    }
}

/// Gateway verdict on the last host request, mirrors the bootloader ACK/NACK bytes
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ResponseCode {
    None = 0x00,
    Ack = 0x79,
    Nack = 0x1F,
}

impl TryFrom<u8> for ResponseCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x00 => Ok(ResponseCode::None),
            0x79 => Ok(ResponseCode::Ack),
            0x1F => Ok(ResponseCode::Nack),
            _ => Err(DecodeError::UnknownResponse(v)),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("packet truncated, {actual} bytes available but {expected} required")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown packet kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("expected {expected:?} packet, found {actual:?}")]
    WrongKind { expected: PacketKind, actual: PacketKind },

    #[error("invalid packet length {actual}, expected {expected}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid payload size {0}")]
    InvalidPayloadSize(usize),

    #[error("unknown response code 0x{0:02x}")]
    UnknownResponse(u8),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum BuildError {
    #[error("buffer of {actual} bytes is too small, {required} required")]
    BufferTooSmall { required: usize, actual: usize },

    #[error("payload length {0} is not a multiple of 4")]
    Unaligned(usize),

    #[error("payload of {requested} bytes exceeds remaining capacity of {available}")]
    Overflow { requested: usize, available: usize },
}

/// Read the kind discriminant without validating the rest of the packet
pub fn packet_kind(bytes: &[u8]) -> Result<PacketKind, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }
    PacketKind::try_from(bytes[KIND_POS])
}

/// Per-kind layout used by [`Builder`] and [`Packet`]
pub trait Kind {
    const KIND: PacketKind;

    /// Header size, the smallest buffer a builder accepts
    const MIN_LEN: usize;

    /// Set for kinds whose `total_length` never varies
    const FIXED_LEN: Option<usize>;

    /// Kind specific checks on a packet already trimmed to `total_length`
    fn validate(_packet: &[u8]) -> Result<(), DecodeError> {
        Ok(())
    }
}

/// Marker types selecting a packet layout
pub mod kind {
    use super::*;

    pub enum Init {}
    pub enum Frame {}
    pub enum Reset {}
    pub enum Response {}
    pub enum Msg {}

    impl Kind for Init {
        const KIND: PacketKind = PacketKind::Init;
        const MIN_LEN: usize = INIT_LEN;
        const FIXED_LEN: Option<usize> = Some(INIT_LEN);
    }

    impl Kind for Frame {
        const KIND: PacketKind = PacketKind::Frame;
        const MIN_LEN: usize = FRAME_HEADER_LEN;
        const FIXED_LEN: Option<usize> = None;

        fn validate(packet: &[u8]) -> Result<(), DecodeError> {
            let size = packet[FRAME_SIZE_POS] as usize;
            if size % FRAME_ALIGN != 0 || size > FRAME_MAX_PAYLOAD {
                return Err(DecodeError::InvalidPayloadSize(size));
            }
            if packet.len() != FRAME_HEADER_LEN + size {
                return Err(DecodeError::InvalidLength {
                    expected: FRAME_HEADER_LEN + size,
                    actual: packet.len(),
                });
            }
            Ok(())
        }
    }

    impl Kind for Reset {
        const KIND: PacketKind = PacketKind::Reset;
        const MIN_LEN: usize = RESET_LEN;
        const FIXED_LEN: Option<usize> = Some(RESET_LEN);
    }

    impl Kind for Response {
        const KIND: PacketKind = PacketKind::Response;
        const MIN_LEN: usize = RESPONSE_LEN;
        const FIXED_LEN: Option<usize> = Some(RESPONSE_LEN);

        fn validate(packet: &[u8]) -> Result<(), DecodeError> {
            ResponseCode::try_from(packet[RESPONSE_CODE_POS]).map(|_| ())
        }
    }

    impl Kind for Msg {
        const KIND: PacketKind = PacketKind::Msg;
        const MIN_LEN: usize = MSG_HEADER_LEN;
        const FIXED_LEN: Option<usize> = None;

        fn validate(packet: &[u8]) -> Result<(), DecodeError> {
            let size = packet[MSG_SIZE_POS] as usize;
            if packet.len() != MSG_HEADER_LEN + size {
                return Err(DecodeError::InvalidLength {
                    expected: MSG_HEADER_LEN + size,
                    actual: packet.len(),
                });
            }
            Ok(())
        }
    }
}

pub type InitBuilder<'a> = Builder<'a, kind::Init>;
pub type FrameBuilder<'a> = Builder<'a, kind::Frame>;
pub type ResetBuilder<'a> = Builder<'a, kind::Reset>;
pub type ResponseBuilder<'a> = Builder<'a, kind::Response>;
pub type MsgBuilder<'a> = Builder<'a, kind::Msg>;

pub type InitPacket<'a> = Packet<'a, kind::Init>;
pub type FramePacket<'a> = Packet<'a, kind::Frame>;
pub type ResetPacket<'a> = Packet<'a, kind::Reset>;
pub type ResponsePacket<'a> = Packet<'a, kind::Response>;
pub type MsgPacket<'a> = Packet<'a, kind::Msg>;

/// Writes a packet of kind `K` into a borrowed buffer
pub struct Builder<'a, K> {
    buf: &'a mut [u8],
    _kind: PhantomData<K>,
}

impl<'a, K: Kind> Builder<'a, K> {
    /// Stamp the header of a `K` packet into `buf`.
    ///
    /// Anything beyond [`MAX_PACKET_LEN`] is left untouched.
    pub fn new(buf: &'a mut [u8]) -> Result<Self, BuildError> {
        if buf.len() < K::MIN_LEN {
            return Err(BuildError::BufferTooSmall {
                required: K::MIN_LEN,
                actual: buf.len(),
            });
        }

        let capacity = buf.len().min(MAX_PACKET_LEN);
        let buf = &mut buf[..capacity];

        buf[..K::MIN_LEN].iter_mut().for_each(|b| *b = 0);
        buf[LENGTH_POS] = K::FIXED_LEN.unwrap_or(K::MIN_LEN) as u8;
        buf[KIND_POS] = K::KIND as u8;

        Ok(Self {
            buf,
            _kind: PhantomData,
        })
    }

    /// Current `total_length` of the packet
    pub fn len(&self) -> usize {
        self.buf[LENGTH_POS] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoded packet, ready to send
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len()]
    }

    /// Stop building and view the result
    pub fn finish(self) -> Packet<'a, K> {
        let len = self.len();
        let buf: &'a [u8] = self.buf;
        Packet {
            bytes: &buf[..len],
            _kind: PhantomData,
        }
    }
}

impl<'a> Builder<'a, kind::Init> {
    pub fn set_address(&mut self, addr: u32) {
        self.buf[INIT_ADDR_POS..INIT_ADDR_POS + 4].copy_from_slice(&addr.to_be_bytes());
    }
}

impl<'a> Builder<'a, kind::Frame> {
    pub fn set_address(&mut self, addr: u32) {
        self.buf[FRAME_ADDR_POS..FRAME_ADDR_POS + 4].copy_from_slice(&addr.to_be_bytes());
    }

    pub fn payload_size(&self) -> usize {
        self.buf[FRAME_SIZE_POS] as usize
    }

    /// Largest payload this buffer can carry
    pub fn payload_capacity(&self) -> usize {
        (self.buf.len() - FRAME_HEADER_LEN) & !(FRAME_ALIGN - 1)
    }

    /// Append whole words to the payload, folding them into the checksum.
    ///
    /// A rejected append leaves the frame untouched.
    pub fn append_payload(&mut self, data: &[u8]) -> Result<(), BuildError> {
        if data.len() % FRAME_ALIGN != 0 {
            return Err(BuildError::Unaligned(data.len()));
        }

        let current = self.payload_size();
        let available = self.payload_capacity() - current;
        if data.len() > available {
            return Err(BuildError::Overflow {
                requested: data.len(),
                available,
            });
        }

        let start = FRAME_PAYLOAD_POS + current;
        self.buf[start..start + data.len()].copy_from_slice(data);
        for b in data {
            self.buf[FRAME_CHECKSUM_POS] ^= b;
        }

        let size = current + data.len();
        self.buf[FRAME_SIZE_POS] = size as u8;
        self.buf[LENGTH_POS] = (FRAME_HEADER_LEN + size) as u8;

        Ok(())
    }
}

impl<'a> Builder<'a, kind::Response> {
    pub fn set_response_code(&mut self, code: ResponseCode) {
        self.buf[RESPONSE_CODE_POS] = code as u8;
    }
}

impl<'a> Builder<'a, kind::Msg> {
    /// Replace the message text
    pub fn set_message(&mut self, text: &[u8]) -> Result<(), BuildError> {
        let available = self.buf.len() - MSG_HEADER_LEN;
        if text.len() > available {
            return Err(BuildError::Overflow {
                requested: text.len(),
                available,
            });
        }

        self.buf[MSG_PAYLOAD_POS..MSG_PAYLOAD_POS + text.len()].copy_from_slice(text);
        self.set_message_size(text.len());
        Ok(())
    }

    pub fn message_size(&self) -> usize {
        self.buf[MSG_SIZE_POS] as usize
    }

    fn set_message_size(&mut self, size: usize) {
        self.buf[MSG_SIZE_POS] = size as u8;
        self.buf[LENGTH_POS] = (MSG_HEADER_LEN + size) as u8;
    }
}

/// Appends formatted text, keeping whatever fits when the buffer runs out
impl<'a> fmt::Write for Builder<'a, kind::Msg> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let current = self.message_size();
        let available = self.buf.len() - MSG_HEADER_LEN - current;
        let n = s.len().min(available);

        let start = MSG_PAYLOAD_POS + current;
        self.buf[start..start + n].copy_from_slice(&s.as_bytes()[..n]);
        self.set_message_size(current + n);

        if n < s.len() {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

/// Validated, read-only view of a packet of kind `K`
pub struct Packet<'a, K> {
    bytes: &'a [u8],
    _kind: PhantomData<K>,
}

impl<'a, K> Clone for Packet<'a, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, K> Copy for Packet<'a, K> {}

impl<'a, K: Kind> Packet<'a, K> {
    /// Validate `bytes` as a `K` packet.
    ///
    /// Bytes past `total_length` are ignored.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, DecodeError> {
        let actual = packet_kind(bytes)?;
        if actual != K::KIND {
            return Err(DecodeError::WrongKind {
                expected: K::KIND,
                actual,
            });
        }

        if bytes.len() < K::MIN_LEN {
            return Err(DecodeError::Truncated {
                expected: K::MIN_LEN,
                actual: bytes.len(),
            });
        }

        let len = bytes[LENGTH_POS] as usize;
        match K::FIXED_LEN {
            Some(expected) if len != expected => {
                return Err(DecodeError::InvalidLength {
                    expected,
                    actual: len,
                })
            }
            None if len < K::MIN_LEN => {
                return Err(DecodeError::InvalidLength {
                    expected: K::MIN_LEN,
                    actual: len,
                })
            }
            _ => (),
        }
        if len > bytes.len() {
            return Err(DecodeError::Truncated {
                expected: len,
                actual: bytes.len(),
            });
        }

        let bytes = &bytes[..len];
        K::validate(bytes)?;

        Ok(Self {
            bytes,
            _kind: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn kind(&self) -> PacketKind {
        K::KIND
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

impl<'a> Packet<'a, kind::Init> {
    pub fn address(&self) -> u32 {
        read_u32_be(self.bytes, INIT_ADDR_POS)
    }
}

impl<'a> Packet<'a, kind::Frame> {
    pub fn address(&self) -> u32 {
        read_u32_be(self.bytes, FRAME_ADDR_POS)
    }

    pub fn payload_size(&self) -> usize {
        self.bytes[FRAME_SIZE_POS] as usize
    }

    pub fn checksum(&self) -> u8 {
        self.bytes[FRAME_CHECKSUM_POS]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[FRAME_PAYLOAD_POS..]
    }
}

impl<'a> Packet<'a, kind::Response> {
    pub fn response_code(&self) -> ResponseCode {
        // Checked in `parse`
        ResponseCode::try_from(self.bytes[RESPONSE_CODE_POS]).unwrap_or(ResponseCode::None)
    }
}

impl<'a> Packet<'a, kind::Msg> {
    pub fn message_size(&self) -> usize {
        self.bytes[MSG_SIZE_POS] as usize
    }

    pub fn message(&self) -> &'a [u8] {
        &self.bytes[MSG_PAYLOAD_POS..]
    }
}

impl<'a, K: Kind> fmt::Debug for Packet<'a, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &K::KIND)
            .field("bytes", &self.bytes)
            .finish()
    }
}

fn read_u32_be(bytes: &[u8], pos: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[pos..pos + 4]);
    u32::from_be_bytes(b)
}

/// Splits a byte stream back into packets using their `total_length`.
///
/// A length byte smaller than the header is treated as a bare header so the
/// resulting packet still reaches the parser and gets rejected there.
pub struct PacketAssembler {
    buf: [u8; MAX_PACKET_LEN],
    len: usize,
}

impl PacketAssembler {
    pub const fn new() -> Self {
        Self {
            buf: [0u8; MAX_PACKET_LEN],
            len: 0,
        }
    }

    /// Feed one byte, returning the packet it completes
    pub fn push(&mut self, byte: u8) -> Option<&[u8]> {
        if self.len > 0 && self.len >= self.expected() {
            self.len = 0;
        }

        self.buf[self.len] = byte;
        self.len += 1;

        if self.len >= HEADER_LEN && self.len == self.expected() {
            Some(&self.buf[..self.len])
        } else {
            None
        }
    }

    /// Drop any partially received packet
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Bytes held for a packet that is not complete yet
    pub fn pending(&self) -> usize {
        if self.len > 0 && self.len >= self.expected() {
            0
        } else {
            self.len
        }
    }

    fn expected(&self) -> usize {
        (self.buf[LENGTH_POS] as usize).max(HEADER_LEN)
    }
}

impl Default for PacketAssembler {
    fn default() -> Self {
        Self::new()
    }
}
