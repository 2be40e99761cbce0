//! Fixed layout constants derived from the raw flash geometry.

use crate::error::FtlError;
use crate::spare::SPARE_BYTES;
use crate::vfl::{GeometryValue, Vfl};

/// Blocks held back from the logical capacity (control blocks plus slack for garbage collection)
pub const RESERVED_BLOCKS: u32 = 8;

/// Size of one mapping entry, both in TOC pages and in block reverse indexes
pub const ENTRY_BYTES: usize = 4;

/// Entry value for "no page"
pub const UNMAPPED: u32 = u32::MAX;

/// Size of each of the three statistics regions in a checkpoint
pub const STATS_REGION_BYTES: usize = 0x200;

/// How many pages each section of a checkpoint slot occupies
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SlotLayout {
    pub header: u32,
    pub user_btoc: u32,
    pub index_btoc: u32,
    pub stats: u32,
    pub toc_index: u32,
    pub statuses: u32,
    pub read_counts: u32,
    pub erase_counts: u32,
    pub valid_index: u32,
    pub valid_data: u32,
}

impl SlotLayout {
    /// Total pages of one checkpoint slot
    pub fn pages(&self) -> u32 {
        self.header
            + self.user_btoc
            + self.index_btoc
            + self.stats
            + self.toc_index
            + self.statuses
            + self.read_counts
            + self.erase_counts
            + self.valid_index
            + self.valid_data
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub pages_per_block: u32,
    pub blocks: u32,
    pub bytes_per_page: usize,
    pub banks: u32,

    /// Mapping entries held by one TOC page
    pub toc_entries_per_page: u32,

    /// Trailing pages of every block that hold its reverse index
    pub btoc_pages: u32,

    /// Upper bound on blocks holding TOC pages
    pub index_blocks: u32,

    /// Logical capacity in pages
    pub total_pages: u32,

    /// Number of TOC groups
    pub toc_len: u32,

    pub slot: SlotLayout,
}

fn pages_for(bytes: usize, bytes_per_page: usize) -> u32 {
    bytes.div_ceil(bytes_per_page) as u32
}

impl Geometry {
    pub fn new(
        pages_per_block: u32,
        blocks: u32,
        bytes_per_page: usize,
        banks: u32,
    ) -> Result<Self, FtlError> {
        let bad = |why: &str| FtlError::Geometry(why.to_string());

        if bytes_per_page < 64 || bytes_per_page % ENTRY_BYTES != 0 {
            return Err(bad("page size must be a multiple of 4 and at least 64 bytes"));
        }
        if !(4..=0xFFFF).contains(&pages_per_block) {
            return Err(bad("pages per block must be between 4 and 65535"));
        }
        if banks == 0 {
            return Err(bad("at least one bank is required"));
        }
        if blocks <= RESERVED_BLOCKS {
            return Err(bad("too few blocks"));
        }

        let toc_entries_per_page = (bytes_per_page / ENTRY_BYTES) as u32;
        let btoc_pages = pages_for(pages_per_block as usize * ENTRY_BYTES, bytes_per_page);
        let data_blocks = blocks - RESERVED_BLOCKS;
        let index_blocks = 3 * data_blocks.div_ceil(toc_entries_per_page);

        let usable = u64::from(pages_per_block - btoc_pages);
        let total = u64::from(data_blocks) * usable;
        let index = u64::from(index_blocks) * u64::from(pages_per_block);
        if total <= index {
            return Err(bad("no room left for user data"));
        }
        let total_pages = u32::try_from(total - index)
            .map_err(|_| bad("logical capacity exceeds 32-bit page numbers"))?;
        if u64::from(blocks) * u64::from(pages_per_block) >= u64::from(UNMAPPED) {
            return Err(bad("physical capacity exceeds 32-bit page numbers"));
        }
        let toc_len = total_pages.div_ceil(toc_entries_per_page);

        let per_block = |bytes: usize| pages_for(blocks as usize * bytes, bytes_per_page);
        let slot = SlotLayout {
            header: 1,
            user_btoc: btoc_pages,
            index_btoc: btoc_pages,
            stats: pages_for(3 * STATS_REGION_BYTES, bytes_per_page),
            toc_index: pages_for(toc_len as usize * ENTRY_BYTES, bytes_per_page),
            statuses: per_block(1),
            read_counts: per_block(2),
            erase_counts: per_block(4),
            valid_index: per_block(2),
            valid_data: per_block(2),
        };

        // One extra page after each slot is reserved for the staleness marker.
        if slot.pages() + 1 > pages_per_block {
            return Err(bad("a checkpoint does not fit in one block"));
        }

        Ok(Self {
            pages_per_block,
            blocks,
            bytes_per_page,
            banks,
            toc_entries_per_page,
            btoc_pages,
            index_blocks,
            total_pages,
            toc_len,
            slot,
        })
    }

    /// Query the raw flash for its geometry, checking that it can carry our metadata
    pub fn from_vfl<V: Vfl>(vfl: &V) -> Result<Self, FtlError> {
        let spare = vfl.geometry_value(GeometryValue::SpareBytes) as usize;
        if spare < SPARE_BYTES {
            return Err(FtlError::Geometry(format!(
                "{spare}-byte spare area cannot hold {SPARE_BYTES} bytes of page metadata"
            )));
        }

        Self::new(
            vfl.geometry_value(GeometryValue::PagesPerBlock),
            vfl.geometry_value(GeometryValue::Blocks),
            vfl.geometry_value(GeometryValue::BytesPerPage) as usize,
            vfl.geometry_value(GeometryValue::Banks).max(1),
        )
    }

    /// Pages of a block that may hold data (everything but its reverse index)
    pub fn usable_pages(&self) -> u32 {
        self.pages_per_block - self.btoc_pages
    }

    pub fn block_of(&self, page: u32) -> u32 {
        page / self.pages_per_block
    }

    pub fn offset_of(&self, page: u32) -> u32 {
        page % self.pages_per_block
    }

    pub fn page_of(&self, block: u32, offset: u32) -> u32 {
        block * self.pages_per_block + offset
    }

    /// The TOC group of a logical page, and its position within that group
    pub fn group_of(&self, lpn: u32) -> (u32, usize) {
        (
            lpn / self.toc_entries_per_page,
            (lpn % self.toc_entries_per_page) as usize,
        )
    }

    /// Distance between consecutive checkpoint slots in a control block
    pub fn slot_stride(&self) -> u32 {
        self.slot.pages() + 1
    }

    /// Does a checkpoint slot (and its marker page) starting at `offset` fit in a block?
    pub fn slot_fits(&self, offset: u32) -> bool {
        offset + self.slot_stride() <= self.pages_per_block
    }

    /// Total physical pages of the medium
    pub fn physical_pages(&self) -> u64 {
        u64::from(self.blocks) * u64::from(self.pages_per_block)
    }
}

#[test]
fn test_small_geometry() -> Result<(), FtlError> {
    let geo = Geometry::new(32, 32, 512, 1)?;
    assert_eq!(geo.toc_entries_per_page, 128);
    assert_eq!(geo.btoc_pages, 1);
    assert_eq!(geo.index_blocks, 3);
    assert_eq!(geo.total_pages, 24 * 31 - 3 * 32);
    assert_eq!(geo.toc_len, 6);
    assert_eq!(geo.slot.stats, 3);
    assert_eq!(geo.slot.pages(), 12);
    assert!(geo.slot_fits(0));
    assert!(geo.slot_fits(13));
    assert!(!geo.slot_fits(26));
    Ok(())
}

#[test]
fn test_large_geometry() -> Result<(), FtlError> {
    let geo = Geometry::new(64, 100, 2048, 1)?;
    assert_eq!(geo.toc_entries_per_page, 512);
    assert_eq!(geo.btoc_pages, 1);
    assert_eq!(geo.total_pages, 92 * 63 - 3 * 64);
    assert_eq!(geo.toc_len, 11);
    assert_eq!(geo.group_of(1000), (1, 488));
    assert_eq!(geo.page_of(3, 5), 197);
    assert_eq!((geo.block_of(197), geo.offset_of(197)), (3, 5));
    Ok(())
}

#[test]
fn test_rejected_geometry() {
    assert!(Geometry::new(32, 8, 512, 1).is_err());
    assert!(Geometry::new(32, 32, 510, 1).is_err());
    // Checkpoint slot cannot fit in such short blocks
    assert!(Geometry::new(8, 512, 512, 1).is_err());
}
