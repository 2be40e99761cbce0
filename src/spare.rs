//! The out-of-band record written alongside every physical page.
//!
//! Layout (little endian, 12 bytes):
//!
//! ```text
//! +---------+---------+-------+----------+------+
//! | lpn u32 | usn u32 | flags | reserved | crc8 |
//! +---------+---------+-------+----------+------+
//! ```
//!
//! `lpn` is a logical page number for user pages, a TOC group for index pages, and a page index
//! for reverse-index and checkpoint pages.

use bitflags::bitflags;
use crc::{Crc, CRC_8_SMBUS};
use deku::prelude::*;

use crate::vfl::PageUtil;

pub const SPARE_BYTES: usize = 12;

const SPARE_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct PageFlags: u8 {
        /// Host data
        const USER = 0x01;
        /// A page of the mapping table
        const INDEX = 0x02;
        /// Part of a block's trailing reverse index
        const CLOSED = 0x04;
        /// Part of a checkpoint
        const CONTEXT = 0x08;
        /// Marks a checkpoint as superseded
        const MAGIC = 0x10;
    }
}

/// What a page holds, according to its spare
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageKind {
    Erased,
    User,
    UserBtoc,
    Index,
    IndexBtoc,
    Context,
    Marker,
    /// Checksum failure or a flag combination we never write
    Unknown,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct RawSpare {
    lpn: u32,
    usn: u32,
    flags: u8,
    reserved: u16,
    crc: u8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageSpare {
    pub lpn: u32,
    pub usn: u32,
    pub flags: PageFlags,
}

impl PageSpare {
    pub fn user(lpn: u32, usn: u32) -> Self {
        Self {
            lpn,
            usn,
            flags: PageFlags::USER,
        }
    }

    pub fn index(group: u32, usn: u32) -> Self {
        Self {
            lpn: group,
            usn,
            flags: PageFlags::INDEX,
        }
    }

    /// Spare for page `n` of a block's reverse index; `flags` is USER or INDEX
    pub fn btoc(flags: PageFlags, n: u32, usn: u32) -> Self {
        Self {
            lpn: n,
            usn,
            flags: flags | PageFlags::CLOSED,
        }
    }

    pub fn context(n: u32, usn: u32) -> Self {
        Self {
            lpn: n,
            usn,
            flags: PageFlags::CONTEXT,
        }
    }

    pub fn marker(usn: u32) -> Self {
        Self {
            lpn: 0,
            usn,
            flags: PageFlags::CONTEXT | PageFlags::MAGIC,
        }
    }

    pub fn encode(&self) -> Result<[u8; SPARE_BYTES], DekuError> {
        let mut raw = RawSpare {
            lpn: self.lpn,
            usn: self.usn,
            flags: self.flags.bits(),
            reserved: 0xFFFF,
            crc: 0,
        };
        let bytes = raw.to_bytes()?;
        raw.crc = SPARE_CRC.checksum(&bytes[..SPARE_BYTES - 1]);

        let mut out = [0u8; SPARE_BYTES];
        out.copy_from_slice(&raw.to_bytes()?);
        Ok(out)
    }

    /// Parse a spare, verifying its checksum. Returns None for erased or damaged spares.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..SPARE_BYTES)?;
        if bytes.is_erased() {
            return None;
        }
        let (_, raw) = RawSpare::from_bytes((bytes, 0)).ok()?;
        if raw.crc != SPARE_CRC.checksum(&bytes[..SPARE_BYTES - 1]) {
            return None;
        }

        Some(Self {
            lpn: raw.lpn,
            usn: raw.usn,
            flags: PageFlags::from_bits(raw.flags)?,
        })
    }

    pub fn kind(&self) -> PageKind {
        const USER: u8 = PageFlags::USER.bits();
        const INDEX: u8 = PageFlags::INDEX.bits();
        const CONTEXT: u8 = PageFlags::CONTEXT.bits();
        const USER_BTOC: u8 = USER | PageFlags::CLOSED.bits();
        const INDEX_BTOC: u8 = INDEX | PageFlags::CLOSED.bits();
        const MARKER: u8 = CONTEXT | PageFlags::MAGIC.bits();

        match self.flags.bits() {
            USER => PageKind::User,
            INDEX => PageKind::Index,
            CONTEXT => PageKind::Context,
            USER_BTOC => PageKind::UserBtoc,
            INDEX_BTOC => PageKind::IndexBtoc,
            MARKER => PageKind::Marker,
            _ => PageKind::Unknown,
        }
    }
}

/// Classify a raw spare area
pub fn classify(bytes: &[u8]) -> PageKind {
    match bytes.get(..SPARE_BYTES) {
        Some(spare) if spare.is_erased() => PageKind::Erased,
        _ => PageSpare::decode(bytes).map_or(PageKind::Unknown, |x| x.kind()),
    }
}

#[test]
fn test_spare_codec() -> Result<(), DekuError> {
    let spare = PageSpare::user(0x1234, 77);
    let bytes = spare.encode()?;
    assert_eq!(&bytes[..4], &0x1234u32.to_le_bytes());
    assert_eq!(&bytes[4..8], &77u32.to_le_bytes());
    assert_eq!(bytes[8], PageFlags::USER.bits());
    assert_eq!(PageSpare::decode(&bytes), Some(spare));
    assert_eq!(classify(&bytes), PageKind::User);
    Ok(())
}

#[test]
fn test_spare_kinds() -> Result<(), DekuError> {
    let cases = [
        (PageSpare::index(3, 1), PageKind::Index),
        (PageSpare::btoc(PageFlags::USER, 0, 1), PageKind::UserBtoc),
        (PageSpare::btoc(PageFlags::INDEX, 1, 1), PageKind::IndexBtoc),
        (PageSpare::context(4, 9), PageKind::Context),
        (PageSpare::marker(9), PageKind::Marker),
    ];
    for (spare, kind) in cases {
        assert_eq!(classify(&spare.encode()?), kind);
    }

    let odd = PageSpare {
        lpn: 0,
        usn: 0,
        flags: PageFlags::USER | PageFlags::INDEX,
    };
    assert_eq!(classify(&odd.encode()?), PageKind::Unknown);
    Ok(())
}

#[test]
fn test_spare_damage() -> Result<(), DekuError> {
    assert_eq!(classify(&[0xFF; SPARE_BYTES]), PageKind::Erased);
    assert_eq!(classify(&[0xFF; 4]), PageKind::Unknown);

    let mut bytes = PageSpare::user(5, 6).encode()?;
    bytes[1] ^= 0x40;
    assert_eq!(PageSpare::decode(&bytes), None);
    assert_eq!(classify(&bytes), PageKind::Unknown);
    Ok(())
}
