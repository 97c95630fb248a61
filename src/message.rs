//! NTLM messages and their binary representation.
//!
//! Every message starts with the magic value, followed by a 32-bit message number and a fixed-size
//! part. Variable-length fields live in a payload after the fixed part and are referenced by
//! security buffers (length, capacity, offset from the start of the message).


use std::fmt;

use bitflags::bitflags;

use crate::oem;


/// The magic value at the start of every NTLMSSP data packet.
pub const NTLMSSP_MAGIC: [u8; 8] = *b"NTLMSSP\0";

const NEGOTIATE_MESSAGE_NUMBER: u32 = 0x0000_0001;
const CHALLENGE_MESSAGE_NUMBER: u32 = 0x0000_0002;
const AUTHENTICATE_MESSAGE_NUMBER: u32 = 0x0000_0003;


bitflags! {
    /// NTLM negotiation flags.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd)]
    pub struct Flags: u32 {
        const NEGOTIATE_UNICODE = 0x0000_0001;
        const NEGOTIATE_OEM = 0x0000_0002;
        const REQUEST_TARGET = 0x0000_0004;
        const UNKNOWN_8 = 0x0000_0008;
        const NEGOTIATE_SIGN = 0x0000_0010;
        const NEGOTIATE_SEAL = 0x0000_0020;
        const NEGOTIATE_DATAGRAM = 0x0000_0040;
        const NEGOTIATE_LANMAN_KEY = 0x0000_0080;
        const NEGOTIATE_NETWARE = 0x0000_0100;
        const NEGOTIATE_NTLM = 0x0000_0200;
        const UNKNOWN_400 = 0x0000_0400;
        const NEGOTIATE_ANONYMOUS = 0x0000_0800;
        const NEGOTIATE_DOMAIN_SUPPLIED = 0x0000_1000;
        const NEGOTIATE_WORKSTATION_SUPPLIED = 0x0000_2000;
        const NEGOTIATE_LOCAL_CALL = 0x0000_4000;
        const NEGOTIATE_ALWAYS_SIGN = 0x0000_8000;
        const TARGET_TYPE_DOMAIN = 0x0001_0000;
        const TARGET_TYPE_SERVER = 0x0002_0000;
        const TARGET_TYPE_SHARE = 0x0004_0000;
        /// Also known as "extended session security".
        const NEGOTIATE_NTLM2_KEY = 0x0008_0000;
        const REQUEST_INIT_RESPONSE = 0x0010_0000;
        const REQUEST_ACCEPT_RESPONSE = 0x0020_0000;
        const REQUEST_NON_NT_SESSION_KEY = 0x0040_0000;
        const NEGOTIATE_TARGET_INFO = 0x0080_0000;
        const UNKNOWN_1000000 = 0x0100_0000;
        const NEGOTIATE_VERSION = 0x0200_0000;
        const UNKNOWN_4000000 = 0x0400_0000;
        const UNKNOWN_8000000 = 0x0800_0000;
        const UNKNOWN_10000000 = 0x1000_0000;
        const NEGOTIATE_128BIT = 0x2000_0000;
        const NEGOTIATE_KEY_EXCHANGE = 0x4000_0000;
        const NEGOTIATE_56BIT = 0x8000_0000;
    }
}


/// An error that may occur while parsing an NTLM message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParsingError {
    /// The token is not valid base64.
    InvalidBase64 { reason: String },

    /// The message is shorter than its fixed-size part.
    ShortHeader { expected_min_len: usize, obtained_len: usize },

    /// The magic value does not match the expected one.
    MagicMismatch { obtained: Vec<u8> },

    /// The message number is not the one expected at this point of the exchange.
    UnexpectedMessageType { expected: u32, obtained: u32 },

    /// A security buffer points outside of the message.
    BufferOutOfRange { offset: u32, length: u16, message_len: usize },

    /// An item's length is not divisible by an expected divisor.
    ItemLengthNotDivisible { expected_divisor: usize, obtained_length: usize },

    /// A byte string cannot be decoded using the current OEM encoding.
    InvalidOemEncoding { value: Vec<u8> },

    /// A string of 16-bit characters could not be decoded as UTF-16.
    InvalidUtf16 { value: Vec<u16> },

    /// Neither Unicode nor OEM encoding was selected.
    NeitherUnicodeNorOem,
}
impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBase64 { reason }
                => write!(f, "token is not valid base64: {}", reason),
            Self::ShortHeader { expected_min_len, obtained_len }
                => write!(f, "header too short (expected at least {} bytes, obtained {})", expected_min_len, obtained_len),
            Self::MagicMismatch { obtained }
                => write!(f, "mismatched magic (expected {:?}, obtained {:?})", NTLMSSP_MAGIC, obtained),
            Self::UnexpectedMessageType { expected, obtained }
                => write!(f, "unexpected message type (expected {}, obtained {})", expected, obtained),
            Self::BufferOutOfRange { offset, length, message_len }
                => write!(f, "buffer of {} bytes at offset {} exceeds message of {} bytes", length, offset, message_len),
            Self::ItemLengthNotDivisible { expected_divisor, obtained_length }
                => write!(f, "item length {} not divisible by {}", obtained_length, expected_divisor),
            Self::InvalidOemEncoding { value }
                => write!(f, "failed to decode value with the current OEM encoding: {:?}", value),
            Self::InvalidUtf16 { value }
                => write!(f, "failed to decode value as UTF-16: {:?}", value),
            Self::NeitherUnicodeNorOem
                => write!(f, "neither Unicode nor OEM encoding was selected"),
        }
    }
}
impl std::error::Error for ParsingError {
}

/// An error that may occur while writing an NTLM message.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum StoringError {
    /// The string cannot be encoded using the OEM encoding.
    NonOemEncodable { string: String },

    /// Neither Unicode nor OEM encoding was selected.
    NeitherUnicodeNorOem,

    /// A field does not fit into a security buffer.
    BufferTooLong { length: usize },
}
impl fmt::Display for StoringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonOemEncodable { string }
                => write!(f, "failed to encode {:?} using OEM encoding", string),
            Self::NeitherUnicodeNorOem
                => write!(f, "neither Unicode nor OEM encoding was selected"),
            Self::BufferTooLong { length }
                => write!(f, "field of {} bytes does not fit into a security buffer", length),
        }
    }
}
impl std::error::Error for StoringError {
}


/// The version of an operating system as well as the NTLM revision used.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct OsVersion {
    pub major_version: u8,
    pub minor_version: u8,
    pub build_number: u16,
    pub ntlm_revision: u8,
}
impl OsVersion {
    /// The version advertised by this client: Windows XP SP2 with NTLMSSP revision 15.
    pub const CLIENT: OsVersion = OsVersion {
        major_version: 5,
        minor_version: 1,
        build_number: 2600,
        ntlm_revision: 15,
    };

    pub fn to_bytes(&self) -> [u8; 8] {
        let build = self.build_number.to_le_bytes();
        [self.major_version, self.minor_version, build[0], build[1], 0, 0, 0, self.ntlm_revision]
    }

    fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            major_version: bytes[0],
            minor_version: bytes[1],
            build_number: u16::from_le_bytes([bytes[2], bytes[3]]),
            ntlm_revision: bytes[7],
        }
    }
}


/// An NTLM security buffer, pointing to data contained later in the message.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct SecurityBuffer {
    pub length: u16,
    pub capacity: u16,
    pub offset: u32,
}
impl SecurityBuffer {
    fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            length: u16::from_le_bytes([bytes[0], bytes[1]]),
            capacity: u16::from_le_bytes([bytes[2], bytes[3]]),
            offset: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    fn to_bytes(&self) -> [u8; 8] {
        let mut ret = [0u8; 8];
        ret[0..2].copy_from_slice(&self.length.to_le_bytes());
        ret[2..4].copy_from_slice(&self.capacity.to_le_bytes());
        ret[4..8].copy_from_slice(&self.offset.to_le_bytes());
        ret
    }

    /// Extracts the data this buffer points to. Offsets are relative to the start of the message.
    pub fn apply_to<'a>(&self, message: &'a [u8]) -> Result<&'a [u8], ParsingError> {
        if self.length == 0 {
            return Ok(&[]);
        }
        let out_of_range = ParsingError::BufferOutOfRange {
            offset: self.offset,
            length: self.length,
            message_len: message.len(),
        };
        let start = usize::try_from(self.offset).map_err(|_| out_of_range.clone())?;
        let end = start.checked_add(usize::from(self.length)).ok_or_else(|| out_of_range.clone())?;
        message.get(start..end).ok_or(out_of_range)
    }
}


/// Encodes a string according to the character set selected by `flags`, preferring Unicode.
fn encode_string(flags: Flags, text: &str) -> Result<Vec<u8>, StoringError> {
    if flags.contains(Flags::NEGOTIATE_UNICODE) {
        Ok(text.encode_utf16().flat_map(|w| w.to_le_bytes()).collect())
    } else if flags.contains(Flags::NEGOTIATE_OEM) {
        oem::encode(text).ok_or_else(|| StoringError::NonOemEncodable { string: text.to_owned() })
    } else {
        Err(StoringError::NeitherUnicodeNorOem)
    }
}

/// Converts UTF-16 values stored as bytes in little-endian format into a string.
fn utf16_le_to_string(bytes: &[u8]) -> Result<String, ParsingError> {
    if bytes.len() % 2 != 0 {
        return Err(ParsingError::ItemLengthNotDivisible { expected_divisor: 2, obtained_length: bytes.len() });
    }
    let units: Vec<u16> = bytes.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| ParsingError::InvalidUtf16 { value: units })
}

fn decode_oem(bytes: &[u8]) -> Result<String, ParsingError> {
    oem::decode(bytes)
        .ok_or_else(|| ParsingError::InvalidOemEncoding { value: bytes.to_vec() })
}

/// Decodes a string according to the character set selected by `flags`.
fn decode_string(flags: Flags, bytes: &[u8]) -> Result<String, ParsingError> {
    if bytes.is_empty() {
        Ok(String::new())
    } else if flags.contains(Flags::NEGOTIATE_UNICODE) {
        utf16_le_to_string(bytes)
    } else if flags.contains(Flags::NEGOTIATE_OEM) {
        decode_oem(bytes)
    } else {
        Err(ParsingError::NeitherUnicodeNorOem)
    }
}


/// Assembles a message from its fixed-size part and its payload.
///
/// Security buffers are written into the fixed part as they are added, while their data is
/// collected in the payload, which is appended once the fixed part is complete.
struct MessageWriter {
    fixed: Vec<u8>,
    payload: Vec<u8>,
    fixed_len: usize,
}
impl MessageWriter {
    fn new(message_number: u32, fixed_len: usize) -> Self {
        let mut fixed = Vec::with_capacity(fixed_len);
        fixed.extend_from_slice(&NTLMSSP_MAGIC);
        fixed.extend_from_slice(&message_number.to_le_bytes());
        Self {
            fixed,
            payload: Vec::new(),
            fixed_len,
        }
    }

    fn put_u32(&mut self, value: u32) {
        self.fixed.extend_from_slice(&value.to_le_bytes());
    }

    fn put_raw(&mut self, bytes: &[u8]) {
        self.fixed.extend_from_slice(bytes);
    }

    fn put_buffer(&mut self, data: &[u8]) -> Result<(), StoringError> {
        let too_long = StoringError::BufferTooLong { length: data.len() };
        let length = u16::try_from(data.len()).map_err(|_| too_long.clone())?;
        let offset = u32::try_from(self.fixed_len + self.payload.len()).map_err(|_| too_long)?;
        let buffer = SecurityBuffer { length, capacity: length, offset };
        self.fixed.extend_from_slice(&buffer.to_bytes());
        self.payload.extend_from_slice(data);
        Ok(())
    }

    fn put_string(&mut self, flags: Flags, text: &str) -> Result<(), StoringError> {
        let bytes = encode_string(flags, text)?;
        self.put_buffer(&bytes)
    }

    fn finish(mut self) -> Vec<u8> {
        debug_assert_eq!(self.fixed.len(), self.fixed_len);
        self.fixed.append(&mut self.payload);
        self.fixed
    }
}

/// Reads the fields of a message whose magic, type and minimum length have been verified.
struct MessageReader<'a> {
    bytes: &'a [u8],
}
impl<'a> MessageReader<'a> {
    fn new(bytes: &'a [u8], message_number: u32, min_len: usize) -> Result<Self, ParsingError> {
        if bytes.len() < min_len {
            return Err(ParsingError::ShortHeader { expected_min_len: min_len, obtained_len: bytes.len() });
        }
        let reader = Self { bytes };
        let magic: [u8; 8] = reader.array_at(0);
        if magic != NTLMSSP_MAGIC {
            return Err(ParsingError::MagicMismatch { obtained: magic.to_vec() });
        }
        let obtained = reader.u32_at(8);
        if obtained != message_number {
            return Err(ParsingError::UnexpectedMessageType { expected: message_number, obtained });
        }
        Ok(reader)
    }

    fn has(&self, pos: usize, len: usize) -> bool {
        self.bytes.len() >= pos + len
    }

    fn array_at<const N: usize>(&self, pos: usize) -> [u8; N] {
        let mut ret = [0u8; N];
        ret.copy_from_slice(&self.bytes[pos..pos + N]);
        ret
    }

    fn u32_at(&self, pos: usize) -> u32 {
        u32::from_le_bytes(self.array_at(pos))
    }

    fn flags_at(&self, pos: usize) -> Flags {
        Flags::from_bits_retain(self.u32_at(pos))
    }

    fn buffer_at(&self, pos: usize) -> Result<&'a [u8], ParsingError> {
        SecurityBuffer::from_bytes(self.array_at(pos)).apply_to(self.bytes)
    }

    /// The version field is only meaningful if the flags say so and the header is long enough.
    fn version_at(&self, pos: usize, flags: Flags) -> OsVersion {
        if flags.contains(Flags::NEGOTIATE_VERSION) && self.has(pos, 8) {
            OsVersion::from_bytes(self.array_at(pos))
        } else {
            OsVersion::default()
        }
    }
}


/// The contents of an NTLM Negotiate message.
///
/// The Negotiate message is the first message of the exchange and is sent by the client; the
/// server is expected to respond with a Challenge message. Domain and workstation are always
/// transmitted in the OEM character set.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NegotiateMessage {
    pub flags: Flags,
    pub domain: String,
    pub workstation: String,
    pub os_version: OsVersion,
}
impl NegotiateMessage {
    const FIXED_LEN: usize
        = 8 // magic
        + 4 // message type
        + 4 // flags
        + 8 // domain secbuffer
        + 8 // workstation secbuffer
        + 8 // version
        ;
    const MIN_LEN: usize = Self::FIXED_LEN - 8;

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoringError> {
        let mut writer = MessageWriter::new(NEGOTIATE_MESSAGE_NUMBER, Self::FIXED_LEN);
        writer.put_u32(self.flags.bits());
        writer.put_string(Flags::NEGOTIATE_OEM, &self.domain)?;
        writer.put_string(Flags::NEGOTIATE_OEM, &self.workstation)?;
        writer.put_raw(&self.os_version.to_bytes());
        Ok(writer.finish())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParsingError> {
        let reader = MessageReader::new(bytes, NEGOTIATE_MESSAGE_NUMBER, Self::MIN_LEN)?;
        let flags = reader.flags_at(12);
        let domain = decode_oem(reader.buffer_at(16)?)?;
        let workstation = decode_oem(reader.buffer_at(24)?)?;
        let os_version = reader.version_at(32, flags);
        Ok(Self {
            flags,
            domain,
            workstation,
            os_version,
        })
    }
}

/// The contents of an NTLM Challenge message.
///
/// Sent by the server in response to the Negotiate message. Older servers omit the target
/// information and version fields, leaving a 32-byte fixed part.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ChallengeMessage {
    /// The host or domain against which the client is authenticating.
    pub target_name: String,

    /// The flags the server accepted from the client's request.
    pub flags: Flags,

    /// The challenge value.
    pub server_challenge: [u8; 8],

    /// Serialized target information entries, used verbatim by NTLMv2 responses.
    pub target_info: Vec<u8>,

    pub os_version: OsVersion,
}
impl ChallengeMessage {
    const FIXED_LEN: usize
        = 8 // magic
        + 4 // message type
        + 8 // target name secbuffer
        + 4 // flags
        + 8 // challenge
        + 8 // context
        + 8 // target information secbuffer
        + 8 // version
        ;
    const MIN_LEN: usize = 32;

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoringError> {
        let mut writer = MessageWriter::new(CHALLENGE_MESSAGE_NUMBER, Self::FIXED_LEN);
        writer.put_string(self.flags, &self.target_name)?;
        writer.put_u32(self.flags.bits());
        writer.put_raw(&self.server_challenge);
        writer.put_raw(&[0u8; 8]);
        writer.put_buffer(&self.target_info)?;
        writer.put_raw(&self.os_version.to_bytes());
        Ok(writer.finish())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParsingError> {
        let reader = MessageReader::new(bytes, CHALLENGE_MESSAGE_NUMBER, Self::MIN_LEN)?;
        let flags = reader.flags_at(20);
        let target_name = decode_string(flags, reader.buffer_at(12)?)?;
        let server_challenge = reader.array_at(24);
        let target_info = if reader.has(40, 8) {
            reader.buffer_at(40)?.to_vec()
        } else {
            Vec::new()
        };
        let os_version = reader.version_at(48, flags);
        Ok(Self {
            target_name,
            flags,
            server_challenge,
            target_info,
            os_version,
        })
    }
}

/// The contents of an NTLM Authenticate message.
///
/// Sent by the client in response to the server's Challenge message; once it is accepted by the
/// server, the authentication has succeeded.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AuthenticateMessage {
    pub lm_response: Vec<u8>,
    pub nt_response: Vec<u8>,
    pub domain: String,
    pub user_name: String,
    pub workstation: String,
    pub session_key: Vec<u8>,
    pub flags: Flags,
    pub os_version: OsVersion,
}
impl AuthenticateMessage {
    const FIXED_LEN: usize
        = 8 // magic
        + 4 // message type
        + 8 // LM response secbuffer
        + 8 // NT response secbuffer
        + 8 // domain secbuffer
        + 8 // user name secbuffer
        + 8 // workstation secbuffer
        + 8 // session key secbuffer
        + 4 // flags
        + 8 // version
        ;
    const MIN_LEN: usize = Self::FIXED_LEN - 8;

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoringError> {
        let mut writer = MessageWriter::new(AUTHENTICATE_MESSAGE_NUMBER, Self::FIXED_LEN);
        writer.put_buffer(&self.lm_response)?;
        writer.put_buffer(&self.nt_response)?;
        writer.put_string(self.flags, &self.domain)?;
        writer.put_string(self.flags, &self.user_name)?;
        writer.put_string(self.flags, &self.workstation)?;
        writer.put_buffer(&self.session_key)?;
        writer.put_u32(self.flags.bits());
        writer.put_raw(&self.os_version.to_bytes());
        Ok(writer.finish())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParsingError> {
        let reader = MessageReader::new(bytes, AUTHENTICATE_MESSAGE_NUMBER, Self::MIN_LEN)?;
        let flags = reader.flags_at(60);
        Ok(Self {
            lm_response: reader.buffer_at(12)?.to_vec(),
            nt_response: reader.buffer_at(20)?.to_vec(),
            domain: decode_string(flags, reader.buffer_at(28)?)?,
            user_name: decode_string(flags, reader.buffer_at(36)?)?,
            workstation: decode_string(flags, reader.buffer_at(44)?)?,
            session_key: reader.buffer_at(52)?.to_vec(),
            flags,
            os_version: reader.version_at(64, flags),
        })
    }
}
