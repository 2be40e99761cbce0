//! The translation layer proper.
//!
//! [`Ftl`] owns every piece of translation state: the TOC and its cache, the block table, the two
//! open blocks and the checkpoint bookkeeping. All operations take `&mut self`, so callers that
//! share an instance must serialize access themselves.

mod cache;
mod checkpoint;
mod gc;
mod pipeline;
mod recovery;

use log::{debug, info, warn};

use crate::block::{BlockEntry, BlockStatus, BlockTable};
use crate::config::FtlConfig;
use crate::error::{FtlError, VflError};
use crate::geometry::Geometry;
use crate::l2v::{L2v, NullL2v};
use crate::open_block::OpenBlock;
use crate::spare::{self, PageFlags, PageKind, PageSpare, SPARE_BYTES};
use crate::stats::FtlStats;
use crate::toc::TocTable;
use crate::vfl::Vfl;

/// Program failures tolerated within one request before giving up
const MAX_PROGRAM_RETRIES: u32 = 4;

/// How the current state was obtained
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpenKind {
    /// Loaded from an up-to-date checkpoint
    Checkpoint,
    /// Rebuilt by scanning the medium
    Restored,
}

/// Result of resolving a logical page through the TOC
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Lookup {
    Mapped(u32),
    Unmapped,
    /// Neither a cached nor an on-flash copy of the page's group exists. Groups only become known
    /// once something in them is written, so this reads as unmapped.
    Unknown,
}

/// The two append streams
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Stream {
    User,
    Index,
}

impl Stream {
    fn current(self) -> BlockStatus {
        match self {
            Self::User => BlockStatus::Current,
            Self::Index => BlockStatus::ICurrent,
        }
    }

    fn full(self) -> BlockStatus {
        match self {
            Self::User => BlockStatus::Allocated,
            Self::Index => BlockStatus::IAllocated,
        }
    }

    fn flags(self) -> PageFlags {
        match self {
            Self::User => PageFlags::USER,
            Self::Index => PageFlags::INDEX,
        }
    }

    fn page_kind(self) -> PageKind {
        match self {
            Self::User => PageKind::User,
            Self::Index => PageKind::Index,
        }
    }

    fn btoc_kind(self) -> PageKind {
        match self {
            Self::User => PageKind::UserBtoc,
            Self::Index => PageKind::IndexBtoc,
        }
    }
}

/// Where checkpoints go
#[derive(Debug, Clone)]
struct CtrlState {
    blocks: [u32; 3],
    selected: usize,

    /// Offset of the newest complete checkpoint in the selected block
    slot: Option<u32>,

    /// The selected block is known to be erased
    erased: bool,

    ctx_usn: u32,

    /// Nothing changed since the newest checkpoint
    clean: bool,

    /// Checkpoints written since the control blocks were last replaced
    flushes: u32,
}

/// Work accumulated since the last checkpoint
#[derive(Debug, Default, Copy, Clone)]
struct FlushDebt {
    pages: u64,
    erases: u64,
}

pub struct Ftl<V: Vfl, L: L2v = NullL2v> {
    vfl: V,
    l2v: L,
    geometry: Geometry,
    config: FtlConfig,

    toc: TocTable,
    blocks: BlockTable,
    user: Option<OpenBlock>,
    index: Option<OpenBlock>,

    /// Sequence number handed to the next opened block
    usn: u32,

    ctrl: CtrlState,
    stats: FtlStats,
    debt: FlushDebt,

    /// Blocks whose programming failed; reclaimed at the next capacity request
    pending_reclaim: Vec<u32>,

    /// Blocks whose read count crossed the refresh threshold
    refresh: Vec<u32>,

    /// The last TOC page read while no cache slot was free
    last_toc: Option<(u32, Box<[u32]>)>,

    open_kind: OpenKind,
}

impl<V: Vfl, L: L2v> Ftl<V, L> {
    /// Bring up the translation layer on `vfl`, from its newest checkpoint if that is usable, or
    /// else by scanning every block.
    pub fn open(vfl: V, l2v: L, config: FtlConfig) -> Result<Self, FtlError> {
        let geometry = Geometry::from_vfl(&vfl)?;
        if config.toc_caches < 2 {
            return Err(FtlError::Config("at least two TOC caches are required".into()));
        }
        if config.gc_reserve_blocks == 0 || config.write_pages_per_bank == 0 {
            return Err(FtlError::Config(
                "GC reserve and write batch size must be nonzero".into(),
            ));
        }
        if config.refresh_threshold >= u32::from(u16::MAX) {
            return Err(FtlError::Config(format!(
                "refresh threshold {} does not fit a checkpointed read count",
                config.refresh_threshold
            )));
        }

        let mut ftl = Self {
            toc: TocTable::new(
                geometry.toc_len,
                config.toc_caches,
                geometry.toc_entries_per_page,
            ),
            blocks: BlockTable::new(geometry.blocks),
            user: None,
            index: None,
            usn: 0,
            ctrl: CtrlState {
                blocks: [0, 1, 2],
                selected: 0,
                slot: None,
                erased: false,
                ctx_usn: 0,
                clean: false,
                flushes: 0,
            },
            stats: FtlStats::default(),
            debt: FlushDebt::default(),
            pending_reclaim: Vec::new(),
            refresh: Vec::new(),
            last_toc: None,
            open_kind: OpenKind::Restored,
            vfl,
            l2v,
            geometry,
            config,
        };

        info!(
            "opening FTL: {} blocks of {} x {} byte pages, {} logical pages",
            geometry.blocks, geometry.pages_per_block, geometry.bytes_per_page, geometry.total_pages
        );
        ftl.l2v.init(
            geometry.total_pages,
            geometry.blocks,
            geometry.pages_per_block,
        );

        if ftl.config.force_restore {
            info!("full restore requested");
            ftl.import_wear();
            ftl.restore()?;
        } else {
            match ftl.load_checkpoint() {
                Ok(()) => ftl.open_kind = OpenKind::Checkpoint,
                Err(FtlError::Recovery(why)) => {
                    info!("{why}; restoring from flash");
                    ftl.restore()?;
                }
                Err(e) => return Err(e),
            }
        }

        if ftl.l2v.open() {
            ftl.rebuild_l2v()?;
        }

        Ok(ftl)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Logical capacity in pages
    pub fn total_pages(&self) -> u32 {
        self.geometry.total_pages
    }

    pub fn open_kind(&self) -> OpenKind {
        self.open_kind
    }

    pub fn block(&self, block: u32) -> &BlockEntry {
        self.blocks.get(block)
    }

    pub fn blocks(&self) -> impl Iterator<Item = (u32, &BlockEntry)> {
        self.blocks.iter()
    }

    /// Number of blocks in each status
    pub fn block_counts(&self) -> Vec<(BlockStatus, u32)> {
        (0..=8u8)
            .filter_map(|x| BlockStatus::try_from(x).ok())
            .map(|x| (x, self.blocks.count(x)))
            .collect()
    }

    pub fn control_blocks(&self) -> [u32; 3] {
        self.ctrl.blocks
    }

    /// Has anything changed since the newest checkpoint?
    pub fn is_dirty(&self) -> bool {
        !self.ctrl.clean
    }

    pub fn stats(&self) -> FtlStats {
        FtlStats {
            data_pages: self.blocks.total_valid_data(),
            index_pages: self.blocks.total_valid_index(),
            ..self.stats
        }
    }

    /// The physical page currently holding `lpn`
    pub fn mapping(&mut self, lpn: u32) -> Result<Option<u32>, FtlError> {
        if lpn >= self.geometry.total_pages {
            return Err(FtlError::OutOfRange {
                lpn,
                count: 1,
                total: self.geometry.total_pages,
            });
        }

        Ok(match self.lookup(lpn)? {
            Lookup::Mapped(page) => Some(page),
            Lookup::Unmapped | Lookup::Unknown => None,
        })
    }

    pub fn vfl(&self) -> &V {
        &self.vfl
    }

    pub fn l2v(&self) -> &L {
        &self.l2v
    }

    /// Tear down without flushing, handing back the collaborators. Anything written since the
    /// last [`Ftl::flush`] is left for the next open to recover.
    pub fn into_parts(self) -> (V, L) {
        (self.vfl, self.l2v)
    }

    fn next_usn(&mut self) -> u32 {
        let usn = self.usn;
        self.usn = self.usn.wrapping_add(1);
        usn
    }

    fn open_block_mut(&mut self, stream: Stream) -> &mut Option<OpenBlock> {
        match stream {
            Stream::User => &mut self.user,
            Stream::Index => &mut self.index,
        }
    }

    /// Read a page, returning the classification and decoded form of its spare
    fn read_page(
        &mut self,
        page: u32,
        data: &mut [u8],
    ) -> Result<(PageKind, Option<PageSpare>), VflError> {
        let mut spare = [0u8; SPARE_BYTES];
        self.vfl.read_page(page, data, &mut spare)?;
        Ok((spare::classify(&spare), PageSpare::decode(&spare)))
    }

    fn read_spare(&mut self, page: u32) -> Result<(PageKind, Option<PageSpare>), VflError> {
        let mut data = vec![0u8; self.geometry.bytes_per_page];
        self.read_page(page, &mut data)
    }

    fn program(&mut self, page: u32, data: &[u8], spare: PageSpare) -> Result<(), FtlError> {
        let spare = spare.encode()?;
        self.vfl.write_page(page, data, &spare)?;
        self.debt.pages += 1;
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> Result<(), FtlError> {
        self.vfl.erase_block(block, true)?;
        self.blocks.record_erase(block);
        self.stats.erases += 1;
        self.debt.erases += 1;
        Ok(())
    }

    /// Count one page read from `block`, queueing it for refresh once it has been read too often
    fn note_read(&mut self, block: u32) {
        let reads = self.blocks.record_read(block);
        if reads > self.config.refresh_threshold && !self.refresh.contains(&block) {
            debug!("block {block} read {reads} times; queueing refresh");
            self.refresh.push(block);
        }
    }

    /// Take the least-worn free block for `status`, erasing it first if it holds stale data
    fn allocate_block(&mut self, status: BlockStatus) -> Result<u32, FtlError> {
        let mut failed = Vec::new();
        loop {
            let block = self
                .blocks
                .iter()
                .filter(|(b, x)| x.status == BlockStatus::Free && !failed.contains(b))
                .min_by_key(|(_, x)| x.erase_count)
                .map(|(b, _)| b)
                .ok_or(FtlError::Capacity)?;

            if self.blocks.get(block).needs_erase {
                if let Err(e) = self.erase_block(block) {
                    warn!("cannot erase block {block}: {e}");
                    failed.push(block);
                    continue;
                }
            }

            self.blocks.set_status(block, status);
            return Ok(block);
        }
    }

    fn open_block(&mut self, stream: Stream) -> Result<(), FtlError> {
        let block = self.allocate_block(stream.current())?;
        let usn = self.next_usn();
        debug!("opened {stream:?} block {block} (usn {usn})");
        *self.open_block_mut(stream) = Some(OpenBlock::new(
            block,
            usn,
            self.geometry.pages_per_block,
        ));
        Ok(())
    }

    /// Finish a full open block by writing its reverse index into its trailing pages
    fn close_block(&mut self, stream: Stream) -> Result<(), FtlError> {
        let Some(open) = self.open_block_mut(stream).take() else {
            return Ok(());
        };

        let page_bytes = self.geometry.bytes_per_page;
        let btoc = open.btoc_bytes(&self.geometry);
        for (n, chunk) in (0u32..).zip(btoc.chunks(page_bytes)) {
            let page = self
                .geometry
                .page_of(open.block, self.geometry.usable_pages() + n);
            let spare = PageSpare::btoc(stream.flags(), n, open.usn);
            if let Err(e) = self.program(page, chunk, spare) {
                // Recovery falls back to scanning the block page by page.
                warn!("reverse index of block {} not written: {e}", open.block);
                break;
            }
        }

        self.blocks.set_status(open.block, stream.full());
        Ok(())
    }

    /// Give up on an open block after a program failure; it is reclaimed later
    fn abandon_block(&mut self, stream: Stream) -> Option<u32> {
        let open = self.open_block_mut(stream).take()?;
        self.blocks.set_status(open.block, stream.full());
        if !self.pending_reclaim.contains(&open.block) {
            self.pending_reclaim.push(open.block);
        }
        Some(open.block)
    }

    /// Make sure an open user block with room exists. When a new block is needed and `request` is
    /// given, garbage collection is asked to make room for that many pages first.
    fn ensure_user_block(&mut self, request: Option<u32>) -> Result<(), FtlError> {
        if self
            .user
            .as_ref()
            .is_some_and(|x| x.is_full(&self.geometry))
        {
            self.close_block(Stream::User)?;
        }

        if self.user.is_none() {
            if let Some(pages) = request {
                self.request_free_pages(pages)?;
            }
            if self.user.is_none() {
                self.open_block(Stream::User)?;
            }
        }

        Ok(())
    }

    fn ensure_index_block(&mut self) -> Result<(), FtlError> {
        if self
            .index
            .as_ref()
            .is_some_and(|x| x.is_full(&self.geometry))
        {
            self.close_block(Stream::Index)?;
        }
        if self.index.is_none() {
            self.open_block(Stream::Index)?;
        }
        Ok(())
    }

    /// Append one page to an open block, moving to a fresh block on program failure
    fn append_page(
        &mut self,
        stream: Stream,
        id: u32,
        data: &[u8],
    ) -> Result<u32, FtlError> {
        let mut failures = 0;
        loop {
            match stream {
                Stream::User => self.ensure_user_block(None)?,
                Stream::Index => self.ensure_index_block()?,
            }
            let open = match stream {
                Stream::User => self.user.as_ref(),
                Stream::Index => self.index.as_ref(),
            };
            let Some(open) = open else {
                return Err(FtlError::Capacity);
            };
            let page = open.next_page(&self.geometry);
            let spare = match stream {
                Stream::User => PageSpare::user(id, open.usn),
                Stream::Index => PageSpare::index(id, open.usn),
            };

            match self.program(page, data, spare) {
                Ok(()) => {
                    let geometry = self.geometry;
                    if let Some(open) = self.open_block_mut(stream).as_mut() {
                        open.append(&geometry, id);
                    }
                    return Ok(page);
                }
                Err(FtlError::Media(VflError::ProgramFailed(_))) if failures < MAX_PROGRAM_RETRIES => {
                    failures += 1;
                    let block = self.abandon_block(stream);
                    warn!("program of page {page} failed; abandoning block {block:?}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Flush if enough has been written or erased since the last checkpoint
    fn maybe_flush(&mut self) -> Result<(), FtlError> {
        let pages = self
            .config
            .flush_write_threshold
            .unwrap_or(self.geometry.physical_pages() / 2);
        let erases = self
            .config
            .flush_erase_threshold
            .unwrap_or(u64::from(self.geometry.blocks) / 2);

        if self.debt.pages >= pages || self.debt.erases >= erases {
            debug!(
                "flushing after {} programs and {} erases",
                self.debt.pages, self.debt.erases
            );
            self.flush()?;
        }
        Ok(())
    }

    /// Replay the whole TOC into the L2V
    fn rebuild_l2v(&mut self) -> Result<(), FtlError> {
        for group in 0..self.geometry.toc_len {
            let entry = *self.toc.group(group);
            let entries = match (entry.cache, entry.index_page) {
                (Some(slot), _) => self.toc.slot(slot).entries.clone(),
                (None, Some(page)) => self.read_toc_page(group, page)?,
                (None, None) => continue,
            };
            self.l2v.update_from_toc_page(group, &entries);
        }
        Ok(())
    }
}
