use bytes::{Buf, BufMut};

use crate::wire::{ensure, WireError};

/// Size of a pulse datagram on the wire.
pub const PULSE_LEN: usize = 8;

/// The fixed `{code, value}` datagram delivered to notification targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub code: i32,
    pub value: i32,
}

impl Pulse {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.code);
        buf.put_i32_le(self.value);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, PULSE_LEN)?;
        Ok(Self {
            code: buf.get_i32_le(),
            value: buf.get_i32_le(),
        })
    }

    pub fn to_bytes(self) -> [u8; PULSE_LEN] {
        let mut out = [0u8; PULSE_LEN];
        out[..4].copy_from_slice(&self.code.to_le_bytes());
        out[4..].copy_from_slice(&self.value.to_le_bytes());
        out
    }
}

/// Where and what to pulse when a notification fires.
///
/// For local targets `pid`/`chid` name the receiver's pulse listener; for
/// broker-to-broker targets `pid` carries an IPv4 address (host order) and
/// `chid` a TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PulseInfo {
    pub code: i32,
    pub value: i32,
    pub chid: i32,
    pub pid: i32,
}

impl PulseInfo {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.code);
        buf.put_i32_le(self.value);
        buf.put_i32_le(self.chid);
        buf.put_i32_le(self.pid);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, 16)?;
        Ok(Self {
            code: buf.get_i32_le(),
            value: buf.get_i32_le(),
            chid: buf.get_i32_le(),
            pid: buf.get_i32_le(),
        })
    }

    pub fn pulse(&self) -> Pulse {
        Pulse {
            code: self.code,
            value: self.value,
        }
    }
}
