use std::fmt;

use bytes::{Buf, BufMut};

use crate::wire::{ensure, WireError};

/// Longest permitted interface name, excluding the terminating NUL.
pub const MAX_NAME_LEN: usize = 255;

/// Size of the fixed, NUL-padded name field on the wire.
pub(crate) const NAME_FIELD_LEN: usize = MAX_NAME_LEN + 1;

/// An interface version as requested or registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InterfaceVersion {
    pub major: u16,
    pub minor: u16,
}

impl InterfaceVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.major);
        buf.put_u16_le(self.minor);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, 4)?;
        Ok(Self {
            major: buf.get_u16_le(),
            minor: buf.get_u16_le(),
        })
    }
}

impl fmt::Display for InterfaceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The version of a concrete server implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImplVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ImplVersion {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.major);
        buf.put_u16_le(self.minor);
        buf.put_u16_le(self.patch);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, 6)?;
        Ok(Self {
            major: buf.get_u16_le(),
            minor: buf.get_u16_le(),
            patch: buf.get_u16_le(),
        })
    }
}

/// A named, versioned service interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceDescription {
    pub name: String,
    pub version: InterfaceVersion,
}

impl InterfaceDescription {
    pub fn new(name: impl Into<String>, major: u16, minor: u16) -> Self {
        Self {
            name: name.into(),
            version: InterfaceVersion::new(major, minor),
        }
    }

    /// A name is valid when every byte is printable ASCII and it fits the
    /// fixed wire field. Version `0.0` is reserved and rejected as well.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
            && self.name.len() <= MAX_NAME_LEN
            && self
                .name
                .bytes()
                .all(|b| b.is_ascii() && !b.is_ascii_control())
            && (self.version.major != 0 || self.version.minor != 0)
    }

    /// Version compatibility: same name, same major, and the registered
    /// minor must cover the requested one.
    pub fn satisfies(&self, requested: &InterfaceDescription) -> bool {
        self.name == requested.name
            && self.version.major == requested.version.major
            && self.version.minor >= requested.version.minor
    }

    /// Interfaces named `*_tcp` address a DSI-over-TCP transport; they are
    /// subject to the loopback pid rewrite rule.
    pub fn is_tcp_name(name: &str) -> bool {
        name.len() > 5 && name.ends_with("_tcp")
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        self.version.put(buf);
        put_name(buf, &self.name);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let version = InterfaceVersion::get(buf)?;
        let name = get_name(buf)?;
        Ok(Self { name, version })
    }
}

impl fmt::Display for InterfaceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// Writes a string into the fixed 256-byte NUL-padded wire field,
/// truncating oversized input at the field boundary.
pub(crate) fn put_name(buf: &mut impl BufMut, name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(MAX_NAME_LEN);
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, NAME_FIELD_LEN - len);
}

/// Reads the fixed 256-byte name field back into a string.
pub(crate) fn get_name(buf: &mut impl Buf) -> Result<String, WireError> {
    ensure(buf, NAME_FIELD_LEN)?;
    let mut raw = [0u8; NAME_FIELD_LEN];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
    String::from_utf8(raw[..end].to_vec()).map_err(|_| WireError::BadName)
}
