//! Thread TLV codec.
//!
//! Short-form only: `type:u8 | length:u8 | value:length bytes`. Extended
//! length (length byte `0xFF` followed by a u16) is not part of this
//! protocol's wire grammar and is rejected rather than silently
//! misparsed.

use crate::error::TlvError;

/// Sub-TLV types used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    TargetEid = 0,
    MlEid = 1,
    Rloc16 = 2,
    Status = 6,
    Ipv6Addresses = 9,
    Timeout = 11,
    CommissionerSessionId = 12,
    TimeSinceLastTransaction = 13,
    NetworkName = 17,
}

impl TlvType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One decoded TLV record, borrowing its value from the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadTlv<'a> {
    pub ty: u8,
    pub value: &'a [u8],
}

impl<'a> ThreadTlv<'a> {
    pub fn length(&self) -> usize {
        self.value.len()
    }

    pub fn ty_matches(&self, ty: TlvType) -> bool {
        self.ty == ty.as_u8()
    }

    /// Decode the value as a big-endian u16. Caller is responsible for
    /// checking `length() == 2` first if an exact size is required.
    pub fn as_u16(&self) -> Option<u16> {
        self.value.try_into().ok().map(u16::from_be_bytes)
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.value.try_into().ok().map(u32::from_be_bytes)
    }

    pub fn as_u8(&self) -> Option<u8> {
        self.value.first().copied()
    }

    pub fn as_ipv6(&self) -> Option<std::net::Ipv6Addr> {
        let bytes: [u8; 16] = self.value.try_into().ok()?;
        Some(std::net::Ipv6Addr::from(bytes))
    }

    pub fn as_eui64(&self) -> Option<[u8; 8]> {
        self.value.try_into().ok()
    }

    /// `A_IPV6_ADDRESSES` holds zero or more 16-byte addresses back to back.
    pub fn as_ipv6_list(&self) -> Option<Vec<std::net::Ipv6Addr>> {
        if self.value.len() % 16 != 0 {
            return None;
        }
        Some(
            self.value
                .chunks_exact(16)
                .map(|chunk| {
                    let bytes: [u8; 16] = chunk.try_into().unwrap();
                    std::net::Ipv6Addr::from(bytes)
                })
                .collect(),
        )
    }

    pub fn as_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.value).ok()
    }
}

/// Parse a flat byte slice into the sequence of TLVs it contains.
///
/// Surfaces malformed input as an error instead of truncating silently.
pub fn parse(mut data: &[u8]) -> Result<Vec<ThreadTlv<'_>>, TlvError> {
    let mut out = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 {
            return Err(TlvError::TruncatedHeader);
        }
        let ty = data[0];
        let len = data[1];
        if len == 0xFF {
            return Err(TlvError::ExtendedLengthUnsupported);
        }
        let len = len as usize;
        let remaining = data.len() - 2;
        if len > remaining {
            return Err(TlvError::LengthOutOfBounds { length: len, remaining });
        }
        let value = &data[2..2 + len];
        out.push(ThreadTlv { ty, value });
        data = &data[2 + len..];
    }
    Ok(out)
}

/// Return the value bytes of the first TLV matching `ty`, if any.
pub fn find<'a>(data: &[ThreadTlv<'a>], ty: TlvType) -> Option<ThreadTlv<'a>> {
    data.iter().find(|t| t.ty_matches(ty)).copied()
}

/// Build one encoded TLV record.
pub fn build(ty: TlvType, value: &[u8]) -> Vec<u8> {
    assert!(value.len() < 0xFF, "extended-length TLVs are not supported");
    let mut out = Vec::with_capacity(2 + value.len());
    out.push(ty.as_u8());
    out.push(value.len() as u8);
    out.extend_from_slice(value);
    out
}

/// Concatenate a sequence of already-built TLV records.
pub fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.iter().flat_map(|p| p.iter().copied()).collect()
}
