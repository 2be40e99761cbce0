//! Running counters, persisted with every checkpoint.

use bytes::{Buf, BufMut};

use crate::geometry::STATS_REGION_BYTES;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FtlStats {
    /// Host read requests
    pub reads: u64,
    /// Host write requests
    pub writes: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub flushes: u64,
    pub restores: u64,
    pub blocks_refreshed: u64,
    /// Pages moved by garbage collection
    pub gc_relocations: u64,
    pub erases: u64,
    /// Live user pages
    pub data_pages: u64,
    /// Live TOC pages on flash
    pub index_pages: u64,
}

impl FtlStats {
    const FIELDS: usize = 11;

    /// Serialize into one statistics region
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STATS_REGION_BYTES);
        for field in [
            self.reads,
            self.writes,
            self.pages_read,
            self.pages_written,
            self.flushes,
            self.restores,
            self.blocks_refreshed,
            self.gc_relocations,
            self.erases,
            self.data_pages,
            self.index_pages,
        ] {
            buf.put_u64_le(field);
        }
        buf.resize(STATS_REGION_BYTES, 0xFF);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::FIELDS * 8 {
            return None;
        }

        Some(Self {
            reads: bytes.get_u64_le(),
            writes: bytes.get_u64_le(),
            pages_read: bytes.get_u64_le(),
            pages_written: bytes.get_u64_le(),
            flushes: bytes.get_u64_le(),
            restores: bytes.get_u64_le(),
            blocks_refreshed: bytes.get_u64_le(),
            gc_relocations: bytes.get_u64_le(),
            erases: bytes.get_u64_le(),
            data_pages: bytes.get_u64_le(),
            index_pages: bytes.get_u64_le(),
        })
    }
}

#[test]
fn test_stats_region() {
    let stats = FtlStats {
        reads: 1,
        writes: 2,
        flushes: 3,
        erases: 0x1_0000_0000,
        index_pages: 9,
        ..Default::default()
    };
    let bytes = stats.encode();
    assert_eq!(bytes.len(), STATS_REGION_BYTES);
    assert_eq!(FtlStats::decode(&bytes), Some(stats));
    assert_eq!(FtlStats::decode(&bytes[..80]), None);
}
