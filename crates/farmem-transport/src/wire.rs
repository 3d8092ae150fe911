//! Wire format of the peer page-server protocol.
//!
//! Messages are either exactly page-sized (`PUT_DATA` / `RESPONSE`) or
//! carry a single 8-byte buffer offset (`PUT_OFFSET` / `GET`).
//! `TERMINATE` has an empty body. Offsets travel big-endian when the
//! deployment is heterogeneous and native-endian otherwise.

use farmem_error::{FarmemError, Result};

/// Message tags, shared by both sides of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// The peer should terminate.
    Terminate = 0,
    /// Buffer offset the next `PutData` will write to.
    PutOffset = 1,
    /// Page data to write at the previously announced offset.
    PutData = 2,
    /// Buffer offset to read a page from.
    Get = 3,
    /// Page data sent from peer to master.
    Response = 4,
}

impl Tag {
    /// Raw tag byte.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Tag {
    type Error = FarmemError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Terminate),
            1 => Ok(Self::PutOffset),
            2 => Ok(Self::PutData),
            3 => Ok(Self::Get),
            4 => Ok(Self::Response),
            _ => Err(FarmemError::UnknownTag { tag }),
        }
    }
}

/// Size of an encoded buffer offset on the wire.
pub const OFFSET_WIRE_SIZE: usize = 8;

/// Encodes and decodes buffer offsets.
///
/// Offsets are fixed at eight bytes regardless of platform word width.
/// Canonical (big-endian) order is used between heterogeneous hosts;
/// a homogeneous deployment skips the swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetCodec {
    canonical: bool,
}

impl OffsetCodec {
    #[must_use]
    pub const fn new(canonical: bool) -> Self {
        Self { canonical }
    }

    /// Encode an offset for the wire.
    #[must_use]
    pub fn encode(&self, offset: u64) -> [u8; OFFSET_WIRE_SIZE] {
        if self.canonical {
            offset.to_be_bytes()
        } else {
            offset.to_ne_bytes()
        }
    }

    /// Decode an offset from a message body, checking the length.
    pub fn decode(&self, tag: Tag, body: &[u8]) -> Result<u64> {
        let bytes: [u8; OFFSET_WIRE_SIZE] =
            body.try_into().map_err(|_| FarmemError::WireLength {
                tag: tag.raw(),
                expected: OFFSET_WIRE_SIZE,
                actual: body.len(),
            })?;
        Ok(if self.canonical {
            u64::from_be_bytes(bytes)
        } else {
            u64::from_ne_bytes(bytes)
        })
    }
}

/// Check that a page-carrying body has exactly the page size.
pub fn check_page_body(tag: Tag, body: &[u8], page_size: usize) -> Result<()> {
    if body.len() == page_size {
        Ok(())
    } else {
        Err(FarmemError::WireLength {
            tag: tag.raw(),
            expected: page_size,
            actual: body.len(),
        })
    }
}
