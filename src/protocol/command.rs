//! Commands submitted by callers and the responses they complete with
use super::codec::Frame;
use super::{Opcode, Status, MAX_KEY_LEN};
use crate::error::{MemringError, MemringResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;

/// Expiration value that tells the server not to create a missing counter
pub const DELTA_NO_ADD: u32 = 0xffff_ffff;

/// How the dispatcher picks the server for a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Hash the key through the ring
    Key,
    /// Send to one server, identified by its `host:port` label
    Server(String),
}

/// A single protocol operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub flags: u32,
    pub expiration: u32,
    pub cas: u64,
    /// Increment/decrement amount
    pub delta: u64,
    /// Counter value stored when an increment/decrement creates the key
    pub initial: u64,
    pub routing: Routing,
    /// Per-command deadline override
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(opcode: Opcode, key: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            key: key.into(),
            value: None,
            flags: 0,
            expiration: 0,
            cas: 0,
            delta: 0,
            initial: 0,
            routing: Routing::Key,
            timeout: None,
        }
    }

    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Get, key)
    }

    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Set, key).with_value(value)
    }

    pub fn add(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Add, key).with_value(value)
    }

    pub fn replace(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Replace, key).with_value(value)
    }

    pub fn append(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Append, key).with_value(value)
    }

    pub fn prepend(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Prepend, key).with_value(value)
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Delete, key)
    }

    pub fn touch(key: impl Into<Bytes>, expiration: u32) -> Self {
        Self::new(Opcode::Touch, key).with_expiration(expiration)
    }

    pub fn increment(key: impl Into<Bytes>, delta: u64, initial: u64) -> Self {
        let mut command = Self::new(Opcode::Increment, key);
        command.delta = delta;
        command.initial = initial;
        command
    }

    pub fn decrement(key: impl Into<Bytes>, delta: u64, initial: u64) -> Self {
        let mut command = Self::new(Opcode::Decrement, key);
        command.delta = delta;
        command.initial = initial;
        command
    }

    pub fn noop(server: impl Into<String>) -> Self {
        Self::new(Opcode::Noop, Bytes::new()).on_server(server)
    }

    pub fn version(server: impl Into<String>) -> Self {
        Self::new(Opcode::Version, Bytes::new()).on_server(server)
    }

    /// STAT with an optional group name (`"items"`, `"slabs"`, ...)
    pub fn stat(server: impl Into<String>, group: Option<&str>) -> Self {
        let key = group.map(|g| Bytes::copy_from_slice(g.as_bytes())).unwrap_or_default();
        Self::new(Opcode::Stat, key).on_server(server)
    }

    pub fn flush(server: impl Into<String>, expiration: u32) -> Self {
        Self::new(Opcode::Flush, Bytes::new())
            .with_expiration(expiration)
            .on_server(server)
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_expiration(mut self, expiration: u32) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_server(mut self, server: impl Into<String>) -> Self {
        self.routing = Routing::Server(server.into());
        self
    }

    /// Reject commands the server would refuse or the codec cannot encode
    pub fn validate(&self) -> MemringResult<()> {
        if self.key.len() > MAX_KEY_LEN {
            return Err(MemringError::invalid_command(format!(
                "key of {} bytes exceeds the {} byte limit",
                self.key.len(),
                MAX_KEY_LEN
            )));
        }
        if self.opcode.is_keyed() && self.key.is_empty() {
            return Err(MemringError::invalid_command(format!(
                "{} requires a key",
                self.opcode
            )));
        }
        if !self.opcode.is_keyed() && self.routing == Routing::Key {
            return Err(MemringError::invalid_command(format!(
                "{} requires a target server",
                self.opcode
            )));
        }
        Ok(())
    }

    /// Build the request frame for this command
    pub fn to_frame(&self, opaque: u32) -> Frame {
        let mut frame = Frame::request(self.opcode.as_u8(), opaque);
        frame.cas = self.cas;
        frame.key = self.key.clone();
        frame.value = self.value.clone().unwrap_or_default();

        match self.opcode {
            Opcode::Set | Opcode::Add | Opcode::Replace => {
                let mut extras = BytesMut::with_capacity(8);
                extras.put_u32(self.flags);
                extras.put_u32(self.expiration);
                frame.extras = extras.freeze();
            }
            Opcode::Increment | Opcode::Decrement => {
                let mut extras = BytesMut::with_capacity(20);
                extras.put_u64(self.delta);
                extras.put_u64(self.initial);
                extras.put_u32(self.expiration);
                frame.extras = extras.freeze();
            }
            Opcode::Touch => {
                frame.extras = Bytes::copy_from_slice(&self.expiration.to_be_bytes());
            }
            Opcode::Flush if self.expiration != 0 => {
                frame.extras = Bytes::copy_from_slice(&self.expiration.to_be_bytes());
            }
            _ => {}
        }
        frame
    }

    /// Short description used in logs and timeout errors
    pub fn describe(&self) -> String {
        if self.key.is_empty() {
            self.opcode.to_string()
        } else {
            format!("{} {}", self.opcode, String::from_utf8_lossy(&self.key))
        }
    }
}

/// Decoded reply to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u8,
    pub status: Status,
    pub cas: u64,
    /// Item flags (get responses only)
    pub flags: u32,
    pub key: Bytes,
    pub value: Bytes,
    /// Name/value pairs collected from a STAT reply stream
    pub stats: Vec<(String, String)>,
}

impl Response {
    pub fn from_frame(frame: Frame) -> Self {
        let flags = if frame.extras.len() >= 4 {
            (&frame.extras[..4]).get_u32()
        } else {
            0
        };
        Self {
            opcode: frame.opcode,
            status: Status::from_u16(frame.vbucket_or_status),
            cas: frame.cas,
            flags,
            key: frame.key,
            value: frame.value,
            stats: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Counter value carried by increment/decrement replies
    pub fn counter(&self) -> Option<u64> {
        if self.value.len() == 8 {
            Some((&self.value[..]).get_u64())
        } else {
            None
        }
    }

    /// Turn a non-success status into the matching error
    pub fn into_result(self) -> MemringResult<Response> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(MemringError::from_status(self.status))
        }
    }
}
