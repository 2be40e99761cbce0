//! Per-block status and counters.

use crate::error::ConsistencyError;

/// The state machine of a physical block
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum BlockStatus {
    Free = 0,
    /// Full (or abandoned) block holding user data
    Allocated = 1,
    /// The open user block
    Current = 2,
    /// User block being reclaimed
    Gc = 3,
    IAllocated = 4,
    ICurrent = 5,
    IGc = 6,
    /// One of the three checkpoint blocks
    FtlCtrl = 7,
    /// The checkpoint block written most recently
    FtlCtrlSel = 8,
}

impl TryFrom<u8> for BlockStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        use BlockStatus::*;

        Ok(match value {
            0 => Free,
            1 => Allocated,
            2 => Current,
            3 => Gc,
            4 => IAllocated,
            5 => ICurrent,
            6 => IGc,
            7 => FtlCtrl,
            8 => FtlCtrlSel,
            x => return Err(x),
        })
    }
}

impl BlockStatus {
    pub fn is_index(self) -> bool {
        matches!(self, Self::IAllocated | Self::ICurrent | Self::IGc)
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::FtlCtrl | Self::FtlCtrlSel)
    }

    /// The status a checkpoint records: open blocks are restored separately from the header.
    pub fn persisted(self) -> Self {
        match self {
            Self::Current => Self::Allocated,
            Self::ICurrent => Self::IAllocated,
            x => x,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockEntry {
    pub status: BlockStatus,
    pub erase_count: u32,
    pub read_count: u32,
    pub valid_data: u32,
    pub valid_index: u32,

    /// Holds stale data and must be erased before it is programmed again
    pub needs_erase: bool,
}

impl Default for BlockEntry {
    fn default() -> Self {
        Self {
            status: BlockStatus::Free,
            erase_count: 0,
            read_count: 0,
            valid_data: 0,
            valid_index: 0,
            needs_erase: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockTable {
    entries: Box<[BlockEntry]>,
    max_erase: u32,
    min_erase: u32,
}

impl BlockTable {
    pub fn new(blocks: u32) -> Self {
        Self {
            entries: vec![BlockEntry::default(); blocks as usize].into_boxed_slice(),
            max_erase: 0,
            min_erase: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, block: u32) -> &BlockEntry {
        &self.entries[block as usize]
    }

    pub fn get_mut(&mut self, block: u32) -> &mut BlockEntry {
        &mut self.entries[block as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &BlockEntry)> {
        (0u32..).zip(self.entries.iter())
    }

    pub fn status(&self, block: u32) -> BlockStatus {
        self.get(block).status
    }

    pub fn set_status(&mut self, block: u32, status: BlockStatus) {
        self.get_mut(block).status = status;
    }

    /// Account for one erase of `block`
    pub fn record_erase(&mut self, block: u32) {
        let entry = self.get_mut(block);
        let old = entry.erase_count;
        entry.erase_count += 1;
        entry.read_count = 0;
        entry.needs_erase = false;

        self.max_erase = self.max_erase.max(old + 1);
        if old == self.min_erase {
            self.update_wear_range();
        }
    }

    /// Recompute the erase-count range after bulk changes
    pub fn update_wear_range(&mut self) {
        let counts = self.entries.iter().map(|x| x.erase_count);
        self.max_erase = counts.clone().max().unwrap_or(0);
        self.min_erase = counts.min().unwrap_or(0);
    }

    /// The least- and most-erased blocks' erase counts
    pub fn wear_range(&self) -> (u32, u32) {
        (self.min_erase, self.max_erase)
    }

    pub fn total_erases(&self) -> u64 {
        self.entries.iter().map(|x| u64::from(x.erase_count)).sum()
    }

    /// Count a read of one page in `block`, returning the new count
    pub fn record_read(&mut self, block: u32) -> u32 {
        let entry = self.get_mut(block);
        entry.read_count = entry.read_count.saturating_add(1);
        entry.read_count
    }

    pub fn add_valid_data(&mut self, block: u32, pages: u32) {
        self.get_mut(block).valid_data += pages;
    }

    pub fn remove_valid_data(&mut self, block: u32, pages: u32) -> Result<(), ConsistencyError> {
        let entry = self.get_mut(block);
        entry.valid_data = entry
            .valid_data
            .checked_sub(pages)
            .ok_or(ConsistencyError::ValidCountUnderflow(block))?;
        Ok(())
    }

    pub fn add_valid_index(&mut self, block: u32, pages: u32) {
        self.get_mut(block).valid_index += pages;
    }

    pub fn remove_valid_index(&mut self, block: u32, pages: u32) -> Result<(), ConsistencyError> {
        let entry = self.get_mut(block);
        entry.valid_index = entry
            .valid_index
            .checked_sub(pages)
            .ok_or(ConsistencyError::ValidCountUnderflow(block))?;
        Ok(())
    }

    pub fn count(&self, status: BlockStatus) -> u32 {
        self.entries.iter().filter(|x| x.status == status).count() as u32
    }

    /// Blocks currently holding TOC pages, including the open one
    pub fn index_block_count(&self) -> u32 {
        self.entries.iter().filter(|x| x.status.is_index()).count() as u32
    }

    /// Sum of valid data pages over all blocks
    pub fn total_valid_data(&self) -> u64 {
        self.entries.iter().map(|x| u64::from(x.valid_data)).sum()
    }

    pub fn total_valid_index(&self) -> u64 {
        self.entries.iter().map(|x| u64::from(x.valid_index)).sum()
    }

    /// The free block with the lowest erase count
    pub fn least_worn_free(&self) -> Option<u32> {
        self.iter()
            .filter(|(_, x)| x.status == BlockStatus::Free)
            .min_by_key(|(_, x)| x.erase_count)
            .map(|(b, _)| b)
    }

    /// The `status` block with the fewest pages counted by `valid`
    pub fn fewest_valid(
        &self,
        status: BlockStatus,
        valid: impl Fn(&BlockEntry) -> u32,
    ) -> Option<u32> {
        self.iter()
            .filter(|(_, x)| x.status == status)
            .min_by_key(|(_, x)| valid(x))
            .map(|(b, _)| b)
    }

    /// Forget everything but wear: every block becomes free with no valid pages
    pub fn reset_keep_wear(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = BlockEntry {
                erase_count: entry.erase_count,
                ..Default::default()
            };
        }
    }
}

#[test]
fn test_status_codes() {
    for code in 0..=8u8 {
        let status = BlockStatus::try_from(code).unwrap();
        assert_eq!(status as u8, code);
    }
    assert_eq!(BlockStatus::try_from(9), Err(9));
    assert_eq!(BlockStatus::Current.persisted(), BlockStatus::Allocated);
    assert_eq!(BlockStatus::ICurrent.persisted(), BlockStatus::IAllocated);
    assert_eq!(BlockStatus::FtlCtrlSel.persisted(), BlockStatus::FtlCtrlSel);
}

#[test]
fn test_valid_counts() {
    let mut table = BlockTable::new(4);
    table.add_valid_data(1, 3);
    table.remove_valid_data(1, 2).unwrap();
    assert_eq!(table.get(1).valid_data, 1);
    assert_eq!(
        table.remove_valid_data(1, 2),
        Err(ConsistencyError::ValidCountUnderflow(1))
    );
    assert_eq!(table.get(1).valid_data, 1);
    assert_eq!(
        table.remove_valid_index(2, 1),
        Err(ConsistencyError::ValidCountUnderflow(2))
    );
    assert_eq!(table.total_valid_data(), 1);
}

#[test]
fn test_wear_tracking() {
    let mut table = BlockTable::new(3);
    table.get_mut(0).needs_erase = true;
    table.record_read(0);
    table.record_erase(0);
    assert_eq!(table.get(0).erase_count, 1);
    assert_eq!(table.get(0).read_count, 0);
    assert!(!table.get(0).needs_erase);
    assert_eq!(table.wear_range(), (0, 1));

    table.record_erase(1);
    table.record_erase(2);
    assert_eq!(table.wear_range(), (1, 1));
    assert_eq!(table.total_erases(), 3);

    table.record_erase(2);
    assert_eq!(table.least_worn_free(), Some(0));
    table.set_status(0, BlockStatus::Allocated);
    assert_eq!(table.least_worn_free(), Some(1));
}

#[test]
fn test_victim_selection() {
    let mut table = BlockTable::new(4);
    for block in 0..3 {
        table.set_status(block, BlockStatus::Allocated);
        table.add_valid_data(block, 10 - block * 3);
    }
    table.set_status(3, BlockStatus::Current);
    assert_eq!(
        table.fewest_valid(BlockStatus::Allocated, |x| x.valid_data),
        Some(2)
    );
    assert_eq!(table.fewest_valid(BlockStatus::IAllocated, |x| x.valid_index), None);

    table.record_erase(1);
    table.reset_keep_wear();
    assert_eq!(table.count(BlockStatus::Free), 4);
    assert_eq!(table.get(1).erase_count, 1);
    assert_eq!(table.total_valid_data(), 0);
}
