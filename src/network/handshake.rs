//! Login Handshake
//!
//! The exchange that runs while a session is HANDSHAKING:
//!
//! ```text
//! client: [14][name hash]
//! server: [0; 8][0][server key: u64]
//! client: [16 | 18][block length][login block]
//! server: [response code]([rights][flagged] on success)
//! ```
//!
//! `Handshake` is a pure state machine over the inbound buffer so the
//! reactor can feed it partial reads; it never touches a socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::{ByteOrder, CodecError, IsaacCipher, ReadBuffer, ValueType, WriteBuffer};

/// First byte of a login connection.
pub const LOGIN_REQUEST: u8 = 14;
/// Fresh login.
pub const LOGIN_NEW: u8 = 16;
/// Reconnect after a dropped connection.
pub const LOGIN_RECONNECT: u8 = 18;
/// First byte of the login block.
pub const LOGIN_MAGIC: u8 = 255;
/// Opcode opening the (plaintext) RSA section.
pub const RSA_OPCODE: u8 = 10;
/// Offset added to each seed word of the server's outbound cipher.
pub const ENCRYPTOR_SEED_OFFSET: u32 = 50;
/// Longest accepted username.
pub const MAX_USERNAME_LEN: usize = 12;

const ARCHIVE_CRC_COUNT: usize = 9;

/// Handshake failures. Each one drops the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// First byte was not a login request.
    #[error("unexpected request type {0}")]
    BadRequest(u8),

    /// Second stage was neither a new login nor a reconnect.
    #[error("unexpected login type {0}")]
    BadLoginType(u8),

    /// Block did not start with the magic byte.
    #[error("bad login magic {0}")]
    BadMagic(u8),

    /// Client built for another revision.
    #[error("client revision {actual}, server expects {expected}")]
    RevisionMismatch {
        /// Server revision.
        expected: u16,
        /// Client revision.
        actual: u16,
    },

    /// RSA section did not open with the expected opcode.
    #[error("bad rsa opcode {0}")]
    BadRsaOpcode(u8),

    /// Client echoed a different server key.
    #[error("server session key mismatch")]
    SessionKeyMismatch,

    /// Block fields ran past the declared length.
    #[error("malformed login block: {0}")]
    Malformed(#[from] CodecError),
}

/// Login response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginResponse {
    /// Logged in.
    Success = 2,
    /// Bad username or password.
    InvalidCredentials = 3,
    /// Account already logged in.
    AlreadyOnline = 5,
    /// No free player slot.
    WorldFull = 7,
}

impl LoginResponse {
    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// True for [`LoginResponse::Success`].
    pub fn is_success(self) -> bool {
        self == LoginResponse::Success
    }

    /// Raw response bytes. Only a success carries rights and the flagged byte.
    pub fn to_bytes(self, rights: u8) -> Bytes {
        if self.is_success() {
            Bytes::copy_from_slice(&[self.code(), rights, 0])
        } else {
            Bytes::copy_from_slice(&[self.code()])
        }
    }
}

/// A decoded login block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    /// Reconnecting rather than logging in fresh.
    pub reconnecting: bool,
    /// Client revision.
    pub revision: u16,
    /// Low-memory client.
    pub low_memory: bool,
    /// Client-chosen session key.
    pub client_key: u64,
    /// Server session key echoed back.
    pub server_key: u64,
    /// Client uid.
    pub uid: u32,
    /// Username as typed.
    pub username: String,
    /// Password as typed.
    pub password: String,
}

impl LoginRequest {
    /// Username in display form.
    pub fn display_name(&self) -> String {
        format_username(&self.username)
    }

    /// Check the credentials' shape. Authentication is up to content.
    pub fn validate(&self) -> Result<(), LoginResponse> {
        let name = self.username.trim();
        let name_ok = !name.is_empty()
            && name.len() <= MAX_USERNAME_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_');
        if !name_ok || self.password.is_empty() {
            return Err(LoginResponse::InvalidCredentials);
        }
        Ok(())
    }

    /// Seed words shared by both ciphers.
    pub fn seed(&self) -> [u32; 4] {
        [
            (self.client_key >> 32) as u32,
            self.client_key as u32,
            (self.server_key >> 32) as u32,
            self.server_key as u32,
        ]
    }

    /// Server side ciphers: `(decryptor, encryptor)`.
    pub fn ciphers(&self) -> (IsaacCipher, IsaacCipher) {
        let seed = self.seed();
        let decryptor = IsaacCipher::new(&seed);
        let encryptor = IsaacCipher::new(&seed.map(|word| word.wrapping_add(ENCRYPTOR_SEED_OFFSET)));
        (decryptor, encryptor)
    }

    /// Encode as a client would: `[16|18][length][block]`.
    pub fn encode(&self) -> Bytes {
        let mut block = WriteBuffer::new();
        block.write_u8(LOGIN_MAGIC, ValueType::Standard);
        // Big endian is always defined for shorts, ints and longs.
        let _ = block.write_u16(self.revision, ValueType::Standard, ByteOrder::Big);
        block.write_u8(self.low_memory as u8, ValueType::Standard);
        block.write_bytes(&[0; ARCHIVE_CRC_COUNT * 4]);

        let mut rsa = WriteBuffer::new();
        rsa.write_u8(RSA_OPCODE, ValueType::Standard);
        let _ = rsa.write_u64(self.client_key, ByteOrder::Big);
        let _ = rsa.write_u64(self.server_key, ByteOrder::Big);
        let _ = rsa.write_u32(self.uid, ValueType::Standard, ByteOrder::Big);
        rsa.write_string(&self.username);
        rsa.write_string(&self.password);

        block.write_u8(rsa.len() as u8, ValueType::Standard);
        block.write_bytes(rsa.as_slice());

        let mut out = BytesMut::with_capacity(block.len() + 2);
        out.put_u8(if self.reconnecting { LOGIN_RECONNECT } else { LOGIN_NEW });
        out.put_u8(block.len() as u8);
        out.put_slice(block.as_slice());
        out.freeze()
    }
}

/// Normalize a username for display: underscores become spaces and each
/// word is capitalized.
pub fn format_username(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut capitalize = true;
    for c in raw.trim().chars() {
        let c = if c == '_' { ' ' } else { c };
        if capitalize {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        capitalize = c == ' ';
    }
    out
}

/// What the handshake produced from the bytes so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send these bytes and keep reading.
    Reply(Bytes),
    /// Login block received.
    Complete(LoginRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Request,
    Block,
    Done,
}

/// Server side of the login exchange.
#[derive(Debug)]
pub struct Handshake {
    stage: Stage,
    revision: u16,
    server_key: u64,
}

impl Handshake {
    /// Start a handshake that will hand out `server_key`.
    pub fn new(revision: u16, server_key: u64) -> Self {
        Self {
            stage: Stage::Request,
            revision,
            server_key,
        }
    }

    /// Key sent to the client.
    pub fn server_key(&self) -> u64 {
        self.server_key
    }

    /// True once the login block has been read.
    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Consume whatever the next stage needs from `buf`.
    ///
    /// `Ok(None)` means more bytes are needed; nothing was consumed.
    pub fn advance(&mut self, buf: &mut BytesMut) -> Result<Option<HandshakeStep>, HandshakeError> {
        match self.stage {
            Stage::Request => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                let request = buf.get_u8();
                if request != LOGIN_REQUEST {
                    return Err(HandshakeError::BadRequest(request));
                }
                let _name_hash = buf.get_u8();

                let mut reply = BytesMut::with_capacity(17);
                reply.put_bytes(0, 8);
                reply.put_u8(0);
                reply.put_u64(self.server_key);
                self.stage = Stage::Block;
                Ok(Some(HandshakeStep::Reply(reply.freeze())))
            }
            Stage::Block => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                let login_type = buf[0];
                if login_type != LOGIN_NEW && login_type != LOGIN_RECONNECT {
                    return Err(HandshakeError::BadLoginType(login_type));
                }
                let length = buf[1] as usize;
                if buf.len() < 2 + length {
                    return Ok(None);
                }
                buf.advance(2);
                let block = buf.split_to(length);
                let request = self.parse_block(login_type == LOGIN_RECONNECT, &block)?;
                self.stage = Stage::Done;
                Ok(Some(HandshakeStep::Complete(request)))
            }
            Stage::Done => Ok(None),
        }
    }

    fn parse_block(&self, reconnecting: bool, block: &[u8]) -> Result<LoginRequest, HandshakeError> {
        let mut buf = ReadBuffer::new(block);

        let magic = buf.read_u8(ValueType::Standard)?;
        if magic != LOGIN_MAGIC {
            return Err(HandshakeError::BadMagic(magic));
        }
        let revision = buf.read_u16(ValueType::Standard, ByteOrder::Big)?;
        if revision != self.revision {
            return Err(HandshakeError::RevisionMismatch {
                expected: self.revision,
                actual: revision,
            });
        }
        let low_memory = buf.read_u8(ValueType::Standard)? == 1;
        buf.read_bytes(ARCHIVE_CRC_COUNT * 4)?;

        let _rsa_length = buf.read_u8(ValueType::Standard)?;
        let rsa_opcode = buf.read_u8(ValueType::Standard)?;
        if rsa_opcode != RSA_OPCODE {
            return Err(HandshakeError::BadRsaOpcode(rsa_opcode));
        }
        let client_key = buf.read_u64(ByteOrder::Big)?;
        let server_key = buf.read_u64(ByteOrder::Big)?;
        if server_key != self.server_key {
            return Err(HandshakeError::SessionKeyMismatch);
        }
        let uid = buf.read_u32(ValueType::Standard, ByteOrder::Big)?;
        let username = buf.read_string()?;
        let password = buf.read_string()?;

        Ok(LoginRequest {
            reconnecting,
            revision,
            low_memory,
            client_key,
            server_key,
            uid,
            username,
            password,
        })
    }
}
