use bytes::{Buf, BufMut};

use crate::wire::{ensure, WireError};

/// Frame magic, `"SBRK"`.
pub const FRAME_MAGIC: u32 = 0x5342_524B;

/// Total prefix in front of a request body: envelope plus command header.
pub const REQUEST_HEADER_LEN: usize = 16;
/// Total prefix in front of a response body: envelope plus result header.
pub const RESPONSE_HEADER_LEN: usize = 16;

/// The fixed prefix of every request: `{magic, size, command, _pad}`.
/// `size` is the body length following the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub size: u32,
    pub command: u32,
}

impl RequestHeader {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(FRAME_MAGIC);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.command);
        buf.put_u32_le(0);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, REQUEST_HEADER_LEN)?;
        if buf.get_u32_le() != FRAME_MAGIC {
            return Err(WireError::BadMagic);
        }
        let size = buf.get_u32_le();
        let command = buf.get_u32_le();
        let _pad = buf.get_u32_le();
        Ok(Self { size, command })
    }
}

/// The fixed prefix of every response: `{magic, size, return_code, _pad}`.
///
/// `return_code` is zero or a positive [`crate::Status`] code, except for
/// list commands where a non-positive value encodes the negated entry
/// count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub size: u32,
    pub return_code: i32,
}

impl ResponseHeader {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(FRAME_MAGIC);
        buf.put_u32_le(self.size);
        buf.put_i32_le(self.return_code);
        buf.put_u32_le(0);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, RESPONSE_HEADER_LEN)?;
        if buf.get_u32_le() != FRAME_MAGIC {
            return Err(WireError::BadMagic);
        }
        let size = buf.get_u32_le();
        let return_code = buf.get_i32_le();
        let _pad = buf.get_u32_le();
        Ok(Self { size, return_code })
    }
}

/// The 8-byte greeting every connection must send before its first frame:
/// the literal bytes `AUTH` followed by the peer's declared pid.
///
/// On unix sockets the kernel-attached credentials are authoritative and
/// the declared pid is ignored; on TCP only the declared pid is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPreamble {
    pub pid: i32,
}

pub const AUTH_MAGIC: [u8; 4] = *b"AUTH";
pub const AUTH_PREAMBLE_LEN: usize = 8;

impl AuthPreamble {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_slice(&AUTH_MAGIC);
        buf.put_i32_le(self.pid);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, AUTH_PREAMBLE_LEN)?;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != AUTH_MAGIC {
            return Err(WireError::BadMagic);
        }
        Ok(Self {
            pid: buf.get_i32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn request_header_round_trip() {
        let mut buf = BytesMut::new();
        let hdr = RequestHeader {
            size: 280,
            command: 5,
        };
        hdr.put(&mut buf);
        assert_eq!(buf.len(), REQUEST_HEADER_LEN);
        assert_eq!(RequestHeader::get(&mut buf.freeze()).unwrap(), hdr);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0xDEADBEEF);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        assert!(matches!(
            RequestHeader::get(&mut buf.freeze()),
            Err(WireError::BadMagic)
        ));
    }

    #[test]
    fn negative_return_code_survives() {
        let mut buf = BytesMut::new();
        ResponseHeader {
            size: 520,
            return_code: -2,
        }
        .put(&mut buf);
        let hdr = ResponseHeader::get(&mut buf.freeze()).unwrap();
        assert_eq!(hdr.return_code, -2);
    }

    #[test]
    fn auth_preamble_checks_magic() {
        let mut buf = BytesMut::new();
        AuthPreamble { pid: 4711 }.put(&mut buf);
        assert_eq!(buf.len(), AUTH_PREAMBLE_LEN);
        assert_eq!(
            AuthPreamble::get(&mut buf.freeze()).unwrap(),
            AuthPreamble { pid: 4711 }
        );

        let mut bad = BytesMut::new();
        bad.put_slice(b"HTUA");
        bad.put_i32_le(1);
        assert!(AuthPreamble::get(&mut bad.freeze()).is_err());
    }
}
