//! Serialization of the checkpoint ("context") record.
//!
//! A checkpoint occupies one slot of consecutive pages in a control block. Every section starts
//! on a page boundary:
//!
//! ```text
//! header | user BTOC | index BTOC | stats (3 x 0x200) | TOC index pages | block statuses |
//! read counts (u16) | erase counts (u32) | valid index counts (u16) | valid data counts (u16)
//! ```
//!
//! The header begins with a four-byte version tag and carries a CRC-32 of itself and of all the
//! other sections. Bit 7 of a block status byte is set when the block still needs an erase.

use bytes::{Buf, BufMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;

use crate::block::{BlockEntry, BlockStatus};
use crate::error::{CheckpointError, FtlError};
use crate::geometry::{Geometry, ENTRY_BYTES, STATS_REGION_BYTES, UNMAPPED};
use crate::open_block::{decode_entries, encode_entries};
use crate::stats::FtlStats;

pub const CONTEXT_TAG: [u8; 4] = *b"CX01";

const CONTEXT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const NEEDS_ERASE: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ContextHeader {
    pub tag: [u8; 4],

    pub pages_per_block: u32,
    pub blocks: u32,
    pub bytes_per_page: u32,
    pub total_pages: u32,
    pub toc_len: u32,
    pub slot_pages: u32,

    /// Open user block, `UNMAPPED` for none
    pub user_block: u32,
    pub user_used: u32,
    pub user_usn: u32,
    pub index_block: u32,
    pub index_used: u32,
    pub index_usn: u32,

    /// Next block sequence number
    pub usn: u32,
    /// Sequence number of this checkpoint
    pub ctx_usn: u32,
    pub flush_count: u32,

    pub payload_crc: u32,
    pub crc: u32,
}

impl ContextHeader {
    fn compute_crc(&self) -> Result<u32, DekuError> {
        let bytes = self.to_bytes()?;
        Ok(CONTEXT_CRC.checksum(&bytes[..bytes.len() - std::mem::size_of::<u32>()]))
    }
}

/// An open block as recorded in a checkpoint
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenBlockRecord {
    pub block: u32,
    pub used: u32,
    pub usn: u32,
    pub shadow: Vec<u32>,
}

/// Everything a checkpoint holds, decoded
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    pub user: Option<OpenBlockRecord>,
    pub index: Option<OpenBlockRecord>,
    pub usn: u32,
    pub ctx_usn: u32,
    pub flush_count: u32,
    pub stats: FtlStats,
    pub vfl_stats: Vec<u8>,
    pub toc_index: Vec<Option<u32>>,
    pub blocks: Vec<BlockEntry>,
}

/// Wear summary stored in the third statistics region
fn encode_wear(blocks: &[BlockEntry]) -> Vec<u8> {
    let min = blocks.iter().map(|x| x.erase_count).min().unwrap_or(0);
    let max = blocks.iter().map(|x| x.erase_count).max().unwrap_or(0);
    let total: u64 = blocks.iter().map(|x| u64::from(x.erase_count)).sum();

    let mut buf = Vec::with_capacity(STATS_REGION_BYTES);
    buf.put_u32_le(min);
    buf.put_u32_le(max);
    buf.put_u64_le(total);
    buf.resize(STATS_REGION_BYTES, 0xFF);
    buf
}

/// Slices `buf` into the page-aligned sections of a slot
struct Sections<'a> {
    buf: &'a [u8],
    page_bytes: usize,
}

impl<'a> Sections<'a> {
    fn take(&mut self, pages: u32) -> &'a [u8] {
        let (head, tail) = self.buf.split_at(pages as usize * self.page_bytes);
        self.buf = tail;
        head
    }
}

fn put_section(out: &mut Vec<u8>, mut section: Vec<u8>, pages: u32, page_bytes: usize) {
    section.resize(pages as usize * page_bytes, 0xFF);
    out.extend_from_slice(&section);
}

impl Context {
    /// Serialize into exactly `geometry.slot.pages()` pages
    pub fn encode(&self, geometry: &Geometry) -> Result<Vec<u8>, FtlError> {
        let page_bytes = geometry.bytes_per_page;
        let layout = geometry.slot;
        let btoc_len = layout.user_btoc as usize * page_bytes;
        let empty_btoc = vec![UNMAPPED; geometry.pages_per_block as usize];

        let mut payload = Vec::with_capacity((layout.pages() - 1) as usize * page_bytes);
        let shadow = |x: &Option<OpenBlockRecord>| {
            encode_entries(x.as_ref().map_or(&empty_btoc[..], |x| &x.shadow[..]), btoc_len)
        };
        put_section(&mut payload, shadow(&self.user), layout.user_btoc, page_bytes);
        put_section(&mut payload, shadow(&self.index), layout.index_btoc, page_bytes);

        let mut stats = self.stats.encode();
        let mut vfl_stats = self.vfl_stats.clone();
        vfl_stats.resize(STATS_REGION_BYTES, 0xFF);
        stats.extend_from_slice(&vfl_stats[..STATS_REGION_BYTES]);
        stats.extend_from_slice(&encode_wear(&self.blocks));
        put_section(&mut payload, stats, layout.stats, page_bytes);

        let toc: Vec<u32> = self.toc_index.iter().map(|x| x.unwrap_or(UNMAPPED)).collect();
        let toc = encode_entries(&toc, toc.len() * ENTRY_BYTES);
        put_section(&mut payload, toc, layout.toc_index, page_bytes);

        let blocks = &self.blocks;
        let statuses = blocks
            .iter()
            .map(|x| x.status.persisted() as u8 | if x.needs_erase { NEEDS_ERASE } else { 0 })
            .collect();
        put_section(&mut payload, statuses, layout.statuses, page_bytes);

        let u16s = |f: fn(&BlockEntry) -> u32| {
            let mut buf = Vec::with_capacity(blocks.len() * 2);
            for entry in blocks {
                buf.put_u16_le(f(entry).min(u32::from(u16::MAX)) as u16);
            }
            buf
        };
        put_section(&mut payload, u16s(|x| x.read_count), layout.read_counts, page_bytes);

        let mut erase_counts = Vec::with_capacity(blocks.len() * 4);
        for entry in blocks {
            erase_counts.put_u32_le(entry.erase_count);
        }
        put_section(&mut payload, erase_counts, layout.erase_counts, page_bytes);
        put_section(&mut payload, u16s(|x| x.valid_index), layout.valid_index, page_bytes);
        put_section(&mut payload, u16s(|x| x.valid_data), layout.valid_data, page_bytes);

        let open = |x: &Option<OpenBlockRecord>| {
            x.as_ref()
                .map_or((UNMAPPED, 0, 0), |x| (x.block, x.used, x.usn))
        };
        let (user_block, user_used, user_usn) = open(&self.user);
        let (index_block, index_used, index_usn) = open(&self.index);

        let mut header = ContextHeader {
            tag: CONTEXT_TAG,
            pages_per_block: geometry.pages_per_block,
            blocks: geometry.blocks,
            bytes_per_page: geometry.bytes_per_page as u32,
            total_pages: geometry.total_pages,
            toc_len: geometry.toc_len,
            slot_pages: layout.pages(),
            user_block,
            user_used,
            user_usn,
            index_block,
            index_used,
            index_usn,
            usn: self.usn,
            ctx_usn: self.ctx_usn,
            flush_count: self.flush_count,
            payload_crc: CONTEXT_CRC.checksum(&payload),
            crc: 0,
        };
        header.crc = header.compute_crc()?;

        let mut out = header.to_bytes()?;
        out.resize(page_bytes, 0xFF);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse a slot read back from flash. `first_page` is only used for error reporting.
    pub fn decode(
        geometry: &Geometry,
        bytes: &[u8],
        first_page: u32,
    ) -> Result<Self, CheckpointError> {
        let page_bytes = geometry.bytes_per_page;
        let layout = geometry.slot;
        if bytes.len() < layout.pages() as usize * page_bytes {
            return Err(CheckpointError::Corrupt(first_page));
        }

        let (_, header) = ContextHeader::from_bytes((bytes, 0))
            .map_err(|_| CheckpointError::Corrupt(first_page))?;
        if header.compute_crc().ok() != Some(header.crc) {
            return Err(CheckpointError::Corrupt(first_page));
        }
        if header.tag != CONTEXT_TAG {
            return Err(CheckpointError::UnsupportedVersion(header.tag));
        }

        let expected = [
            ("pages per block", header.pages_per_block, geometry.pages_per_block),
            ("block count", header.blocks, geometry.blocks),
            ("page size", header.bytes_per_page, geometry.bytes_per_page as u32),
            ("logical capacity", header.total_pages, geometry.total_pages),
            ("TOC length", header.toc_len, geometry.toc_len),
            ("slot size", header.slot_pages, layout.pages()),
        ];
        for (what, found, want) in expected {
            if found != want {
                return Err(CheckpointError::GeometryMismatch(what));
            }
        }

        let mut sections = Sections {
            buf: &bytes[page_bytes..layout.pages() as usize * page_bytes],
            page_bytes,
        };
        if CONTEXT_CRC.checksum(sections.buf) != header.payload_crc {
            return Err(CheckpointError::Corrupt(first_page));
        }

        let ppb = geometry.pages_per_block as usize;
        let user_btoc = decode_entries(sections.take(layout.user_btoc), ppb);
        let index_btoc = decode_entries(sections.take(layout.index_btoc), ppb);

        let stats = sections.take(layout.stats);
        let ftl_stats = FtlStats::decode(stats).ok_or(CheckpointError::Corrupt(first_page))?;
        let vfl_stats = stats[STATS_REGION_BYTES..2 * STATS_REGION_BYTES].to_vec();
        let mut wear = &stats[2 * STATS_REGION_BYTES..];

        let toc_index = decode_entries(sections.take(layout.toc_index), geometry.toc_len as usize)
            .into_iter()
            .map(|x| (x != UNMAPPED).then_some(x))
            .collect();

        let count = geometry.blocks as usize;
        let statuses = &sections.take(layout.statuses)[..count];
        let mut read_counts = sections.take(layout.read_counts);
        let mut erase_counts = sections.take(layout.erase_counts);
        let mut valid_index = sections.take(layout.valid_index);
        let mut valid_data = sections.take(layout.valid_data);

        let mut blocks = Vec::with_capacity(count);
        for &status in statuses {
            let needs_erase = status & NEEDS_ERASE != 0;
            let status = BlockStatus::try_from(status & !NEEDS_ERASE)
                .map_err(|_| CheckpointError::Corrupt(first_page))?;
            blocks.push(BlockEntry {
                status,
                read_count: u32::from(read_counts.get_u16_le()),
                erase_count: erase_counts.get_u32_le(),
                valid_index: u32::from(valid_index.get_u16_le()),
                valid_data: u32::from(valid_data.get_u16_le()),
                needs_erase,
            });
        }

        let (_min, _max, total) = (wear.get_u32_le(), wear.get_u32_le(), wear.get_u64_le());
        if total != blocks.iter().map(|x| u64::from(x.erase_count)).sum::<u64>() {
            return Err(CheckpointError::Corrupt(first_page));
        }

        let open = |block: u32, used: u32, usn: u32, shadow: Vec<u32>| {
            (block != UNMAPPED).then_some(OpenBlockRecord {
                block,
                used,
                usn,
                shadow,
            })
        };

        Ok(Self {
            user: open(header.user_block, header.user_used, header.user_usn, user_btoc),
            index: open(header.index_block, header.index_used, header.index_usn, index_btoc),
            usn: header.usn,
            ctx_usn: header.ctx_usn,
            flush_count: header.flush_count,
            stats: ftl_stats,
            vfl_stats,
            toc_index,
            blocks,
        })
    }
}

#[cfg(test)]
fn test_context(geometry: &Geometry) -> Context {
    let mut blocks = vec![BlockEntry::default(); geometry.blocks as usize];
    blocks[3].status = BlockStatus::Current;
    blocks[3].valid_data = 7;
    blocks[4].status = BlockStatus::ICurrent;
    blocks[4].valid_index = 2;
    blocks[5].erase_count = 12;
    blocks[6].read_count = 100_000;
    blocks[7].needs_erase = true;

    let mut shadow = vec![UNMAPPED; geometry.pages_per_block as usize];
    shadow[..7].copy_from_slice(&[10, 11, 12, 13, 14, 15, 16]);

    let mut toc_index = vec![None; geometry.toc_len as usize];
    toc_index[1] = Some(130);

    Context {
        user: Some(OpenBlockRecord {
            block: 3,
            used: 7,
            usn: 20,
            shadow,
        }),
        index: None,
        usn: 21,
        ctx_usn: 4,
        flush_count: 2,
        stats: FtlStats {
            writes: 5,
            ..Default::default()
        },
        vfl_stats: vec![1, 2, 3],
        toc_index,
        blocks,
    }
}

#[test]
fn test_context_codec() -> anyhow::Result<()> {
    let geometry = Geometry::new(32, 32, 512, 1)?;
    let context = test_context(&geometry);
    let bytes = context.encode(&geometry)?;
    assert_eq!(bytes.len(), 12 * 512);
    assert_eq!(&bytes[..4], b"CX01");

    let decoded = Context::decode(&geometry, &bytes, 0)?;
    assert_eq!(decoded.user, context.user);
    assert_eq!(decoded.index, None);
    assert_eq!((decoded.usn, decoded.ctx_usn, decoded.flush_count), (21, 4, 2));
    assert_eq!(decoded.stats, context.stats);
    assert_eq!(&decoded.vfl_stats[..3], &[1, 2, 3]);
    assert_eq!(decoded.toc_index, context.toc_index);

    // Open blocks are folded into their "full" state
    assert_eq!(decoded.blocks[3].status, BlockStatus::Allocated);
    assert_eq!(decoded.blocks[4].status, BlockStatus::IAllocated);
    assert_eq!(decoded.blocks[3].valid_data, 7);
    assert_eq!(decoded.blocks[5].erase_count, 12);
    assert_eq!(decoded.blocks[6].read_count, 0xFFFF);
    assert!(decoded.blocks[7].needs_erase);
    assert_eq!(decoded.blocks[7].status, BlockStatus::Free);
    assert!(!decoded.blocks[8].needs_erase);
    Ok(())
}

#[test]
fn test_context_rejects() -> anyhow::Result<()> {
    let geometry = Geometry::new(32, 32, 512, 1)?;
    let bytes = test_context(&geometry).encode(&geometry)?;

    let mut damaged = bytes.clone();
    damaged[3 * 512 + 17] ^= 1;
    assert_eq!(
        Context::decode(&geometry, &damaged, 40),
        Err(CheckpointError::Corrupt(40))
    );

    let mut old = bytes.clone();
    old[..4].copy_from_slice(b"CX00");
    let mut header = ContextHeader::from_bytes((&old[..], 0))?.1;
    header.crc = header.compute_crc()?;
    old[..header.to_bytes()?.len()].copy_from_slice(&header.to_bytes()?);
    assert_eq!(
        Context::decode(&geometry, &old, 0),
        Err(CheckpointError::UnsupportedVersion(*b"CX00"))
    );

    let other = Geometry::new(32, 40, 512, 1)?;
    assert!(matches!(
        Context::decode(&other, &bytes, 0),
        Err(CheckpointError::GeometryMismatch(_))
    ));

    assert_eq!(
        Context::decode(&geometry, &bytes[..512], 0),
        Err(CheckpointError::Corrupt(0))
    );
    Ok(())
}
