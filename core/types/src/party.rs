use std::fmt;

use bytes::{Buf, BufMut};

use crate::wire::{ensure, WireError};

/// A 64-bit composite identity for a server or a client.
///
/// `extended` names the broker that minted the id (1000 for a classic
/// slave, a user-assigned value >= 1 in tree mode); `local` is allocated
/// monotonically per broker. No two live parties in a federation share the
/// same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PartyId {
    pub extended: u32,
    pub local: u32,
}

impl PartyId {
    pub const NULL: PartyId = PartyId {
        extended: 0,
        local: 0,
    };

    pub const fn new(extended: u32, local: u32) -> Self {
        Self { extended, local }
    }

    /// Marks a per-entry failure in batched registration replies.
    pub const fn invalid_for(local: u32) -> Self {
        Self {
            extended: u32::MAX,
            local,
        }
    }

    pub fn is_null(&self) -> bool {
        self.extended == 0 && self.local == 0
    }

    pub fn as_u64(&self) -> u64 {
        (self.extended as u64) << 32 | self.local as u64
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.local);
        buf.put_u32_le(self.extended);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, 8)?;
        let local = buf.get_u32_le();
        let extended = buf.get_u32_le();
        Ok(Self { extended, local })
    }
}

impl From<u64> for PartyId {
    fn from(value: u64) -> Self {
        Self {
            extended: (value >> 32) as u32,
            local: value as u32,
        }
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}>", self.extended, self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_round_trip() {
        let id = PartyId::new(7, 500042);
        assert_eq!(PartyId::from(id.as_u64()), id);
    }

    #[test]
    fn wire_layout_is_local_then_extended() {
        let mut buf = bytes::BytesMut::new();
        PartyId::new(0xAABBCCDD, 0x11223344).put(&mut buf);
        assert_eq!(&buf[..4], &0x11223344u32.to_le_bytes());
        assert_eq!(&buf[4..], &0xAABBCCDDu32.to_le_bytes());
    }
}
