//! Tunable policy of the translation layer.

/// A pub-fields struct of policy knobs; `Default` gives the values used on real hardware
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FtlConfig {
    /// Number of TOC pages kept in memory
    pub toc_caches: usize,

    /// Mapping entries the restore scan may hold in memory at once (rounded down to whole TOC
    /// pages). Smaller values mean more passes over the user blocks.
    pub restore_scratch_entries: usize,

    /// Page reads after which a block is rewritten to counter read disturb. Checkpoints keep read
    /// counts as 16 bits, so this must stay below 65535.
    pub refresh_threshold: u32,

    /// Pages programmed since the last checkpoint that force a flush; `None` means half of all
    /// physical pages
    pub flush_write_threshold: Option<u64>,

    /// Erases since the last checkpoint that force a flush; `None` means half of all blocks
    pub flush_erase_threshold: Option<u64>,

    /// Checkpoints after which all three control blocks are moved elsewhere
    pub ctrl_replace_interval: u32,

    /// A replacement control block must be erased at least this many times less than the block
    /// it replaces
    pub ctrl_replace_margin: u32,

    /// Pages programmed per bank in one batch
    pub write_pages_per_bank: u32,

    /// Free blocks garbage collection keeps in hand beyond what a request needs
    pub gc_reserve_blocks: u32,

    /// Ignore any checkpoint and rebuild everything by scanning the medium
    pub force_restore: bool,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            toc_caches: 10,
            restore_scratch_entries: 0x20_0000,
            refresh_threshold: 50_000,
            flush_write_threshold: None,
            flush_erase_threshold: None,
            ctrl_replace_interval: 1000,
            ctrl_replace_margin: 50,
            write_pages_per_bank: 32,
            gc_reserve_blocks: 2,
            force_restore: false,
        }
    }
}
