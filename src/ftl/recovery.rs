//! Rebuilding the translation state by scanning the medium.
//!
//! Every block is classified by the spare of its first readable page. Index blocks are replayed
//! newest first to recover the location of each TOC page, then the user blocks are replayed
//! newest first, one slice of the logical space at a time, to recover the mapping itself. The
//! user blocks are authoritative: a TOC page that disagrees with them is dropped and the group is
//! rewritten from the scan.

use std::cmp::Reverse;

use log::{debug, info, trace, warn};

use super::checkpoint::valid_triple;
use super::gc::BlockContents;
use super::{CtrlState, FlushDebt, Ftl, OpenKind, Stream};
use crate::block::BlockStatus;
use crate::error::FtlError;
use crate::geometry::UNMAPPED;
use crate::l2v::L2v;
use crate::open_block::OpenBlock;
use crate::spare::PageKind;
use crate::vfl::Vfl;

/// A block found holding user or index pages
#[derive(Debug, Clone)]
struct Candidate {
    block: u32,
    usn: u32,

    /// Whether the block's reverse index was found
    closed: bool,

    /// Whether some programmed page could not be read
    damaged: bool,

    /// Lowest and highest logical page (or TOC group) seen in the block, once scanned
    range: Option<(u32, u32)>,
}

impl Candidate {
    fn new(block: u32, usn: u32) -> Self {
        Self {
            block,
            usn,
            closed: false,
            damaged: false,
            range: None,
        }
    }

    fn note(&mut self, contents: &BlockContents) {
        self.closed = contents.closed;
        self.damaged = contents.damaged;
    }

    /// An unclosed block that can take more pages where it left off
    fn can_continue(&self) -> bool {
        !self.closed && !self.damaged
    }

    fn overlaps(&self, begin: u32, end: u32) -> bool {
        self.range.map_or(true, |(lo, hi)| lo < end && hi >= begin)
    }
}

/// Blocks sorted into what they hold
#[derive(Debug, Default)]
struct Classified {
    users: Vec<Candidate>,
    indexes: Vec<Candidate>,
    max_usn: Option<u32>,
}

fn sort_newest_first(candidates: &mut [Candidate]) {
    candidates.sort_by_key(|x| Reverse(x.usn));
    for pair in candidates.windows(2) {
        if pair[0].usn == pair[1].usn {
            warn!(
                "blocks {} and {} share sequence number {}",
                pair[0].block, pair[1].block, pair[0].usn
            );
        }
    }
}

impl<V: Vfl, L: L2v> Ftl<V, L> {
    /// Discard all in-memory state and rebuild it from the contents of the medium, then write a
    /// fresh checkpoint
    pub(super) fn restore(&mut self) -> Result<(), FtlError> {
        info!("restoring translation state from flash");

        self.toc.reset();
        self.blocks.reset_keep_wear();
        self.user = None;
        self.index = None;
        self.pending_reclaim.clear();
        self.refresh.clear();
        self.last_toc = None;
        self.debt = FlushDebt::default();

        let triple = self
            .vfl
            .control_blocks()
            .filter(|x| valid_triple(x, self.geometry.blocks));
        for block in triple.iter().flatten() {
            self.blocks.set_status(*block, BlockStatus::FtlCtrl);
        }

        let mut found = self.classify_blocks()?;
        sort_newest_first(&mut found.users);
        sort_newest_first(&mut found.indexes);
        self.usn = found.max_usn.map_or(0, |x| x.wrapping_add(1));
        info!(
            "found {} user and {} index blocks",
            found.users.len(),
            found.indexes.len()
        );

        self.setup_control_blocks(triple)?;
        self.restore_index_blocks(&mut found.indexes)?;
        self.restore_user_blocks(&mut found.users)?;
        self.reclaim_after_restore(&found)?;

        self.stats.restores += 1;
        self.ctrl.clean = false;
        self.flush()?;
        self.open_kind = OpenKind::Restored;

        info!(
            "restore complete: {} live user pages, {} live TOC pages",
            self.blocks.total_valid_data(),
            self.blocks.total_valid_index()
        );
        Ok(())
    }

    /// Sort every block by the spare of its first readable page. Blocks holding anything else are
    /// erased.
    fn classify_blocks(&mut self) -> Result<Classified, FtlError> {
        let blocks = self.geometry.blocks;
        let rpt = howudoin::new()
            .label("Scanning blocks")
            .set_len(u64::from(blocks));

        let mut found = Classified::default();
        for block in 0..blocks {
            rpt.inc();
            if self.blocks.status(block).is_control() {
                continue;
            }

            let mut first = None;
            let mut unreadable = false;
            for offset in 0..self.geometry.pages_per_block {
                match self.read_spare(self.geometry.page_of(block, offset)) {
                    Ok(x) => {
                        first = Some(x);
                        break;
                    }
                    Err(e) => {
                        trace!("block {block} page {offset} unreadable: {e}");
                        unreadable = true;
                    }
                }
            }

            match first {
                Some((PageKind::Erased, _)) => {
                    self.blocks.get_mut(block).needs_erase = unreadable;
                }
                Some((kind, Some(spare)))
                    if matches!(kind, PageKind::User | PageKind::UserBtoc) =>
                {
                    self.blocks.set_status(block, BlockStatus::Allocated);
                    found.users.push(Candidate::new(block, spare.usn));
                    found.max_usn = found.max_usn.max(Some(spare.usn));
                }
                Some((kind, Some(spare)))
                    if matches!(kind, PageKind::Index | PageKind::IndexBtoc) =>
                {
                    self.blocks.set_status(block, BlockStatus::IAllocated);
                    found.indexes.push(Candidate::new(block, spare.usn));
                    found.max_usn = found.max_usn.max(Some(spare.usn));
                }
                _ => {
                    debug!("block {block} holds nothing usable; erasing");
                    self.free_block(block, true);
                }
            }
        }

        rpt.close();
        Ok(found)
    }

    /// Adopt the control blocks the flash layer knows about, or choose and register new ones
    fn setup_control_blocks(&mut self, triple: Option<[u32; 3]>) -> Result<(), FtlError> {
        let triple = match triple {
            Some(triple) => triple,
            None => {
                let mut free: Vec<(u32, u32)> = self
                    .blocks
                    .iter()
                    .filter(|(_, x)| x.status == BlockStatus::Free)
                    .map(|(b, x)| (x.erase_count, b))
                    .collect();
                free.sort_unstable();
                let [a, b, c, ..] = free.as_slice() else {
                    return Err(FtlError::Capacity);
                };

                let triple = [a.1, b.1, c.1];
                info!("choosing blocks {triple:?} for checkpoints");
                self.vfl.write_control_blocks(triple)?;
                triple
            }
        };

        self.adopt_control_blocks(triple)
    }

    /// Start checkpointing into `triple`. The next checkpoint goes into the block after the one
    /// holding the newest checkpoint, so that one survives until it is superseded.
    fn adopt_control_blocks(&mut self, triple: [u32; 3]) -> Result<(), FtlError> {
        let mut newest: Option<(usize, u32)> = None;
        for (i, &block) in triple.iter().enumerate() {
            if let Ok((PageKind::Context, Some(spare))) =
                self.read_spare(self.geometry.page_of(block, 0))
            {
                if newest.map_or(true, |(_, usn)| spare.usn > usn) {
                    newest = Some((i, spare.usn));
                }
            }
        }

        let selected = newest.map_or(2, |(i, _)| i);
        for (i, &block) in triple.iter().enumerate() {
            let entry = self.blocks.get_mut(block);
            entry.status = if i == selected {
                BlockStatus::FtlCtrlSel
            } else {
                BlockStatus::FtlCtrl
            };
            entry.valid_data = 0;
            entry.valid_index = 0;
        }

        self.ctrl = CtrlState {
            blocks: triple,
            selected,
            slot: None,
            erased: false,
            ctx_usn: newest.map_or(self.ctrl.ctx_usn, |(_, usn)| usn.max(self.ctrl.ctx_usn)),
            clean: false,
            flushes: 0,
        };
        Ok(())
    }

    /// Recover where each TOC page lives from the index blocks, newest first. The newest index
    /// block stays open if it was never closed.
    fn restore_index_blocks(&mut self, indexes: &mut [Candidate]) -> Result<(), FtlError> {
        let toc_len = self.geometry.toc_len;
        for candidate in indexes.iter_mut() {
            let contents = self.block_entries(candidate.block, Stream::Index)?;
            candidate.note(&contents);

            for (offset, &group) in contents.entries.iter().enumerate().rev() {
                if group >= toc_len {
                    continue;
                }
                let entry = self.toc.group_mut(group);
                if entry.index_page.is_none() {
                    entry.index_page = Some(self.geometry.page_of(candidate.block, offset as u32));
                }
            }
        }

        for group in 0..toc_len {
            if let Some(page) = self.toc.group(group).index_page {
                self.blocks.add_valid_index(self.geometry.block_of(page), 1);
            }
        }

        if let Some(newest) = indexes.first().filter(|x| x.can_continue()) {
            self.reopen_block(Stream::Index, newest.block, newest.usn)?;
        }

        let empty: Vec<u32> = indexes
            .iter()
            .map(|x| x.block)
            .filter(|&b| {
                let entry = self.blocks.get(b);
                entry.status == BlockStatus::IAllocated && entry.valid_index == 0
            })
            .collect();
        for block in empty {
            self.free_block(block, false);
        }
        Ok(())
    }

    /// Recover the mapping from the user blocks, newest first, in slices of the logical space no
    /// larger than the configured scratch space
    fn restore_user_blocks(&mut self, users: &mut [Candidate]) -> Result<(), FtlError> {
        let total = self.geometry.total_pages;
        let per_group = self.geometry.toc_entries_per_page as usize;
        let chunk = (self.config.restore_scratch_entries / per_group).max(1) * per_group;
        let chunk = chunk.min(self.geometry.toc_len as usize * per_group);

        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(chunk)
            .map_err(|_| FtlError::OutOfMemory)?;
        scratch.resize(chunk, UNMAPPED);

        let passes = (total as usize).div_ceil(chunk);
        let rpt = howudoin::new()
            .label("Restoring mappings")
            .set_len(passes as u64);

        let mut begin = 0u32;
        while begin < total {
            let end = begin.saturating_add(chunk as u32).min(total);
            scratch.fill(UNMAPPED);

            for candidate in users.iter_mut() {
                if !candidate.overlaps(begin, end)
                    || self.blocks.status(candidate.block) != BlockStatus::Allocated
                {
                    continue;
                }
                let contents = self.block_entries(candidate.block, Stream::User)?;
                candidate.note(&contents);

                let mut range = (u32::MAX, 0);
                for (offset, &lpn) in contents.entries.iter().enumerate().rev() {
                    if lpn >= total {
                        continue;
                    }
                    range = (range.0.min(lpn), range.1.max(lpn));
                    if (begin..end).contains(&lpn) {
                        let entry = &mut scratch[(lpn - begin) as usize];
                        if *entry == UNMAPPED {
                            *entry = self.geometry.page_of(candidate.block, offset as u32);
                        }
                    }
                }
                candidate.range = Some(range);
            }

            let scanned = &scratch[..(end - begin) as usize];
            for &page in scanned.iter().filter(|&&x| x != UNMAPPED) {
                self.blocks.add_valid_data(self.geometry.block_of(page), 1);
            }
            self.free_superseded(users, end);
            self.reconcile_groups(begin, scanned)?;

            begin = end;
            rpt.inc();
        }

        rpt.close();
        Ok(())
    }

    /// Free the user blocks left with nothing live once every logical page they hold lies below
    /// `end`, so they can take TOC pages while the rest of the space is replayed
    fn free_superseded(&mut self, users: &[Candidate], end: u32) {
        for candidate in users {
            let entry = self.blocks.get(candidate.block);
            let replayed = candidate.range.is_some_and(|(_, hi)| hi < end);
            if replayed && entry.status == BlockStatus::Allocated && entry.valid_data == 0 {
                trace!("block {} holds nothing live", candidate.block);
                self.free_block(candidate.block, false);
            }
        }
    }

    /// Install one slice of scanned mappings, which starts on a group boundary
    fn reconcile_groups(&mut self, begin: u32, scanned: &[u32]) -> Result<(), FtlError> {
        let per_group = self.geometry.toc_entries_per_page as usize;
        let first = begin / per_group as u32;

        for (group, entries) in (first..).zip(scanned.chunks(per_group)) {
            if let Some(page) = self.toc.group(group).index_page {
                let agrees = match self.read_toc_page(group, page) {
                    Ok(on_flash) => {
                        on_flash[..entries.len()] == *entries
                            && on_flash[entries.len()..].iter().all(|&x| x == UNMAPPED)
                    }
                    Err(e) => {
                        warn!("TOC page of group {group} at {page} unusable: {e}");
                        false
                    }
                };
                if agrees {
                    continue;
                }
                debug!("TOC page of group {group} is out of date");
                self.drop_index_page(group)?;
            }

            if entries.iter().any(|&x| x != UNMAPPED) {
                let slot = self.acquire_for_write(group)?;
                self.toc.slot_mut(slot).entries[..entries.len()].copy_from_slice(entries);
            }
        }
        Ok(())
    }

    /// Continue appending to a block that was open when the medium was last used
    fn reopen_block(&mut self, stream: Stream, block: u32, usn: u32) -> Result<(), FtlError> {
        let contents = self.block_entries(block, stream)?;
        let mut open = OpenBlock::new(block, usn, self.geometry.pages_per_block);
        open.used = contents.used;
        for (entry, id) in open.shadow.iter_mut().zip(contents.entries) {
            *entry = id;
        }

        debug!("reopened {stream:?} block {block} at page {}", open.used);
        self.blocks.set_status(block, stream.current());
        *self.open_block_mut(stream) = Some(open);
        Ok(())
    }

    /// Free blocks left with nothing live, carry on with the newest user block if it was left
    /// open, and move everything out of any other block that was never closed
    fn reclaim_after_restore(&mut self, found: &Classified) -> Result<(), FtlError> {
        let empty: Vec<u32> = self
            .blocks
            .iter()
            .filter(|(_, x)| {
                (x.status == BlockStatus::Allocated && x.valid_data == 0)
                    || (x.status == BlockStatus::IAllocated && x.valid_index == 0)
            })
            .map(|(b, _)| b)
            .collect();
        for block in empty {
            self.free_block(block, false);
        }

        if let Some(newest) = found.users.first().filter(|x| x.can_continue()) {
            if self.blocks.status(newest.block) == BlockStatus::Allocated {
                self.reopen_block(Stream::User, newest.block, newest.usn)?;
            }
        }

        for candidate in found.users.iter().filter(|x| !x.closed) {
            if self.blocks.status(candidate.block) != BlockStatus::Allocated {
                continue;
            }
            let valid = self.blocks.get(candidate.block).valid_data;
            self.request_free_pages(valid)?;

            // Garbage collection may already have taken it
            if self.blocks.status(candidate.block) == BlockStatus::Allocated {
                debug!("relocating unclosed user block {}", candidate.block);
                self.reclaim_data_block(Some(candidate.block), true)?;
            }
        }
        for candidate in found.indexes.iter().filter(|x| !x.closed) {
            if self.blocks.status(candidate.block) == BlockStatus::IAllocated {
                debug!("relocating unclosed index block {}", candidate.block);
                self.reclaim_index_block(Some(candidate.block), true)?;
            }
        }

        // Room for the TOC pages the closing checkpoint writes out
        self.request_free_pages(0)
    }
}

#[test]
fn test_candidate_order() {
    let mut candidates = vec![
        Candidate::new(4, 10),
        Candidate::new(9, 30),
        Candidate::new(2, 20),
    ];
    sort_newest_first(&mut candidates);
    let blocks: Vec<u32> = candidates.iter().map(|x| x.block).collect();
    assert_eq!(blocks, [9, 2, 4]);

    let mut scanned = Candidate::new(1, 1);
    assert!(scanned.overlaps(0, 10));
    scanned.range = Some((100, 200));
    assert!(!scanned.overlaps(0, 100));
    assert!(scanned.overlaps(200, 300));
    assert!(!scanned.overlaps(201, 300));

    // A block with nothing in range never overlaps
    scanned.range = Some((u32::MAX, 0));
    assert!(!scanned.overlaps(0, u32::MAX));
}

#[test]
fn test_candidate_can_continue() {
    let mut candidate = Candidate::new(3, 5);
    assert!(candidate.can_continue());

    candidate.damaged = true;
    assert!(!candidate.can_continue());

    candidate.damaged = false;
    candidate.closed = true;
    assert!(!candidate.can_continue());
}
