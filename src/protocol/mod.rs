//! memcached binary protocol definitions
//!
//! This module holds the wire-level vocabulary shared by the codec and the
//! command layer:
//! - Request/response magic bytes
//! - Opcode table
//! - Response status table
pub mod codec;
pub mod command;

pub use codec::{CodecError, Decoded, Frame, FrameCodec};
pub use command::{Command, Response, Routing, DELTA_NO_ADD};

use std::fmt;

/// Fixed size of every frame header
pub const HEADER_LEN: usize = 24;

/// Longest key accepted by memcached servers
pub const MAX_KEY_LEN: usize = 250;

/// Frame direction marker (first header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    pub fn as_u8(self) -> u8 {
        match self {
            Magic::Request => 0x80,
            Magic::Response => 0x81,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x80 => Some(Magic::Request),
            0x81 => Some(Magic::Response),
            _ => None,
        }
    }
}

/// Command opcodes understood by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    Touch = 0x1c,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        let opcode = match byte {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x07 => Opcode::Quit,
            0x08 => Opcode::Flush,
            0x0a => Opcode::Noop,
            0x0b => Opcode::Version,
            0x0c => Opcode::GetK,
            0x0e => Opcode::Append,
            0x0f => Opcode::Prepend,
            0x10 => Opcode::Stat,
            0x1c => Opcode::Touch,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            _ => return None,
        };
        Some(opcode)
    }

    /// Commands that are routed by key through the hash ring
    pub fn is_keyed(self) -> bool {
        matches!(
            self,
            Opcode::Get
                | Opcode::GetK
                | Opcode::Set
                | Opcode::Add
                | Opcode::Replace
                | Opcode::Delete
                | Opcode::Increment
                | Opcode::Decrement
                | Opcode::Append
                | Opcode::Prepend
                | Opcode::Touch
        )
    }

    /// STAT answers with a stream of frames closed by an empty-key frame
    pub fn is_multi_response(self) -> bool {
        matches!(self, Opcode::Stat)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Get => "get",
            Opcode::Set => "set",
            Opcode::Add => "add",
            Opcode::Replace => "replace",
            Opcode::Delete => "delete",
            Opcode::Increment => "increment",
            Opcode::Decrement => "decrement",
            Opcode::Quit => "quit",
            Opcode::Flush => "flush",
            Opcode::Noop => "noop",
            Opcode::Version => "version",
            Opcode::GetK => "getk",
            Opcode::Append => "append",
            Opcode::Prepend => "prepend",
            Opcode::Stat => "stat",
            Opcode::Touch => "touch",
            Opcode::SaslListMechs => "sasl_list_mechs",
            Opcode::SaslAuth => "sasl_auth",
            Opcode::SaslStep => "sasl_step",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    NonNumeric,
    AuthError,
    AuthContinue,
    UnknownCommand,
    OutOfMemory,
    Busy,
    TemporaryFailure,
    Other(u16),
}

impl Status {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => Status::NoError,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0006 => Status::NonNumeric,
            0x0020 => Status::AuthError,
            0x0021 => Status::AuthContinue,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            other => Status::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Status::NoError => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::NonNumeric => 0x0006,
            Status::AuthError => 0x0020,
            Status::AuthContinue => 0x0021,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::Busy => 0x0085,
            Status::TemporaryFailure => 0x0086,
            Status::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::NoError
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::NoError => write!(f, "no error"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::KeyExists => write!(f, "key exists"),
            Status::ValueTooLarge => write!(f, "value too large"),
            Status::InvalidArguments => write!(f, "invalid arguments"),
            Status::ItemNotStored => write!(f, "item not stored"),
            Status::NonNumeric => write!(f, "incr/decr on non-numeric value"),
            Status::AuthError => write!(f, "authentication error"),
            Status::AuthContinue => write!(f, "authentication continue"),
            Status::UnknownCommand => write!(f, "unknown command"),
            Status::OutOfMemory => write!(f, "out of memory"),
            Status::Busy => write!(f, "busy"),
            Status::TemporaryFailure => write!(f, "temporary failure"),
            Status::Other(code) => write!(f, "status 0x{:04x}", code),
        }
    }
}
