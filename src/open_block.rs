//! The block currently accepting sequential writes, and its in-memory reverse index.

use bytes::{Buf, BufMut};

use crate::geometry::{Geometry, ENTRY_BYTES, UNMAPPED};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenBlock {
    pub block: u32,
    pub usn: u32,
    pub used: u32,

    /// In-block offset to logical page (or TOC group), `UNMAPPED` where nothing was written
    pub shadow: Box<[u32]>,
}

impl OpenBlock {
    pub fn new(block: u32, usn: u32, pages_per_block: u32) -> Self {
        Self {
            block,
            usn,
            used: 0,
            shadow: vec![UNMAPPED; pages_per_block as usize].into_boxed_slice(),
        }
    }

    /// Pages left before the reverse index has to be written
    pub fn remaining(&self, geometry: &Geometry) -> u32 {
        geometry.usable_pages().saturating_sub(self.used)
    }

    pub fn is_full(&self, geometry: &Geometry) -> bool {
        self.remaining(geometry) == 0
    }

    /// How many pages the next batch may program: bounded by the request, the room left, and the
    /// per-bank parallelism limit (kept aligned to the bank count).
    pub fn reserve(&self, geometry: &Geometry, requested: u32, pages_per_bank: u32) -> u32 {
        let banks = geometry.banks;
        let parallel = pages_per_bank * banks - self.used % banks;
        requested.min(self.remaining(geometry)).min(parallel)
    }

    /// The next physical page to program
    pub fn next_page(&self, geometry: &Geometry) -> u32 {
        geometry.page_of(self.block, self.used)
    }

    /// Record that the next page now holds `id`, returning its physical page
    pub fn append(&mut self, geometry: &Geometry, id: u32) -> u32 {
        let page = self.next_page(geometry);
        self.shadow[self.used as usize] = id;
        self.used += 1;
        page
    }

    /// Serialize the reverse index into `btoc_pages` whole pages
    pub fn btoc_bytes(&self, geometry: &Geometry) -> Vec<u8> {
        encode_entries(&self.shadow, geometry.btoc_pages as usize * geometry.bytes_per_page)
    }
}

/// Serialize mapping entries into `len` bytes, padding with erased bytes
pub fn encode_entries(entries: &[u32], len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(len);
    for &entry in entries {
        buf.put_u32_le(entry);
    }
    buf.resize(len, 0xFF);
    buf
}

/// Parse up to `count` mapping entries from raw bytes
pub fn decode_entries(mut bytes: &[u8], count: usize) -> Vec<u32> {
    let count = count.min(bytes.len() / ENTRY_BYTES);
    (0..count).map(|_| bytes.get_u32_le()).collect()
}

#[cfg(test)]
fn test_geometry(banks: u32) -> Geometry {
    Geometry::new(32, 32, 512, banks).unwrap()
}

#[test]
fn test_append() {
    let geo = test_geometry(1);
    let mut open = OpenBlock::new(5, 9, geo.pages_per_block);
    assert_eq!(open.append(&geo, 42), 160);
    assert_eq!(open.append(&geo, 43), 161);
    assert_eq!(open.remaining(&geo), 29);
    assert_eq!(&open.shadow[..3], &[42, 43, UNMAPPED]);

    let bytes = open.btoc_bytes(&geo);
    assert_eq!(bytes.len(), 512);
    assert_eq!(decode_entries(&bytes, 32), open.shadow.to_vec());
}

#[test]
fn test_reserve_limits() {
    let geo = test_geometry(4);
    let mut open = OpenBlock::new(0, 1, geo.pages_per_block);
    assert_eq!(open.reserve(&geo, 100, 4), 16);
    assert_eq!(open.reserve(&geo, 3, 4), 3);

    open.used = 2;
    assert_eq!(open.reserve(&geo, 100, 4), 14);

    open.used = 28;
    assert_eq!(open.reserve(&geo, 100, 4), 3);
    open.used = 31;
    assert!(open.is_full(&geo));
    assert_eq!(open.reserve(&geo, 100, 4), 0);
}
