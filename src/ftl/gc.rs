//! Reclaiming blocks whose contents are mostly superseded.

use log::{debug, trace, warn};

use super::{Ftl, Lookup, Stream};
use crate::block::BlockStatus;
use crate::error::{ConsistencyError, FtlError};
use crate::geometry::UNMAPPED;
use crate::l2v::L2v;
use crate::open_block::decode_entries;
use crate::spare::PageKind;
use crate::vfl::Vfl;

/// What a block says it holds
#[derive(Debug)]
pub(super) struct BlockContents {
    /// Logical page (or TOC group) at each usable offset, UNMAPPED where nothing was found
    pub entries: Vec<u32>,

    /// Taken from the block's reverse index rather than by scanning its pages
    pub closed: bool,

    /// Pages programmed ahead of the first erased one
    pub used: u32,

    /// Some programmed page could not be read
    pub damaged: bool,
}

impl<V: Vfl, L: L2v> Ftl<V, L> {
    /// Make enough free blocks available to take `pages` more user pages, plus a small reserve
    pub(super) fn request_free_pages(&mut self, pages: u32) -> Result<(), FtlError> {
        self.process_pending_reclaims()?;
        self.enforce_index_budget()?;

        let usable = self.geometry.usable_pages();
        let target = pages.div_ceil(usable).max(1) + self.config.gc_reserve_blocks;
        let mut rounds = 0;

        while self.blocks.count(BlockStatus::Free) < target {
            let victim = self
                .blocks
                .fewest_valid(BlockStatus::Allocated, |x| x.valid_data)
                .filter(|&b| self.blocks.get(b).valid_data < usable);

            let Some(victim) = victim.filter(|_| rounds < self.geometry.blocks) else {
                if self.blocks.count(BlockStatus::Free) > 0 {
                    // Short of the reserve, but the request can still make progress
                    break;
                }
                return Err(FtlError::Capacity);
            };

            self.reclaim_data_block(Some(victim), false)?;
            rounds += 1;
        }

        Ok(())
    }

    /// Reclaim the blocks whose programming failed
    fn process_pending_reclaims(&mut self) -> Result<(), FtlError> {
        for block in std::mem::take(&mut self.pending_reclaim) {
            match self.blocks.status(block) {
                BlockStatus::Allocated | BlockStatus::Gc => {
                    self.reclaim_data_block(Some(block), true)?;
                }
                BlockStatus::IAllocated | BlockStatus::IGc => {
                    self.reclaim_index_block(Some(block), true)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Free index blocks with nothing live in them, and compact TOC pages into fewer blocks while
    /// more index blocks are in use than budgeted
    pub(super) fn enforce_index_budget(&mut self) -> Result<(), FtlError> {
        let empty: Vec<u32> = self
            .blocks
            .iter()
            .filter(|(_, x)| x.status == BlockStatus::IAllocated && x.valid_index == 0)
            .map(|(b, _)| b)
            .collect();
        for block in empty {
            self.free_block(block, false);
        }

        let mut rounds = 0;
        while self.blocks.index_block_count() > self.geometry.index_blocks
            && rounds < self.geometry.index_blocks
        {
            let Some(victim) = self
                .blocks
                .fewest_valid(BlockStatus::IAllocated, |x| x.valid_index)
            else {
                break;
            };
            self.reclaim_index_block(Some(victim), false)?;
            rounds += 1;
        }

        Ok(())
    }

    /// Anything that must happen before a checkpoint captures the block table
    pub(super) fn prepare_for_flush(&mut self) -> Result<(), FtlError> {
        self.process_pending_reclaims()
    }

    /// Move every live page out of a user block (the one with the fewest live pages if `block` is
    /// None) and free it. With `scrub`, the block is erased right away.
    pub(super) fn reclaim_data_block(
        &mut self,
        block: Option<u32>,
        scrub: bool,
    ) -> Result<u32, FtlError> {
        let block = match block {
            Some(block) => block,
            None => self
                .blocks
                .fewest_valid(BlockStatus::Allocated, |x| x.valid_data)
                .ok_or(FtlError::Capacity)?,
        };

        let entries = match self.user.take() {
            Some(open) if open.block == block => open.shadow.into_vec(),
            open => {
                self.user = open;
                self.block_entries(block, Stream::User)?.entries
            }
        };
        self.blocks.set_status(block, BlockStatus::Gc);
        debug!(
            "reclaiming data block {block} ({} valid pages)",
            self.blocks.get(block).valid_data
        );

        let mut data = vec![0u8; self.geometry.bytes_per_page];
        for (offset, &lpn) in (0u32..).zip(entries.iter()) {
            if self.blocks.get(block).valid_data == 0 {
                break;
            }
            if lpn >= self.geometry.total_pages {
                continue;
            }

            let page = self.geometry.page_of(block, offset);
            if self.lookup(lpn)? != Lookup::Mapped(page) {
                continue;
            }

            let (kind, spare) = self.read_page(page, &mut data)?;
            match spare {
                Some(spare) if kind == PageKind::User && spare.lpn == lpn => {}
                Some(spare) if kind == PageKind::User => {
                    return Err(ConsistencyError::LpnMismatch {
                        page,
                        expected: lpn,
                        found: spare.lpn,
                    }
                    .into())
                }
                _ => return Err(ConsistencyError::WrongPageType(page).into()),
            }

            let new = self.append_page(Stream::User, lpn, &data)?;
            if self.set_entry(lpn, new)? != page {
                return Err(ConsistencyError::DoubleMapping(lpn).into());
            }
            self.blocks.remove_valid_data(block, 1)?;
            self.blocks.add_valid_data(self.geometry.block_of(new), 1);
            self.l2v.update(lpn, 1, Some(new));
            self.stats.gc_relocations += 1;
            trace!("relocated logical page {lpn:#x} from {page} to {new}");
        }

        let valid = self.blocks.get(block).valid_data;
        if valid != 0 {
            return Err(ConsistencyError::ValidCountLeft { block, valid }.into());
        }

        self.free_block(block, scrub);
        Ok(block)
    }

    /// Supersede every TOC page held by an index block (the one with the fewest live pages if
    /// `block` is None) and free it. The affected groups are left dirty in the cache.
    pub(super) fn reclaim_index_block(
        &mut self,
        block: Option<u32>,
        scrub: bool,
    ) -> Result<u32, FtlError> {
        let block = match block {
            Some(block) => block,
            None => self
                .blocks
                .fewest_valid(BlockStatus::IAllocated, |x| x.valid_index)
                .ok_or(FtlError::Capacity)?,
        };

        if self.index.as_ref().is_some_and(|x| x.block == block) {
            self.index = None;
        }
        self.blocks.set_status(block, BlockStatus::IGc);
        debug!(
            "reclaiming index block {block} ({} valid pages)",
            self.blocks.get(block).valid_index
        );

        let geometry = self.geometry;
        let groups: Vec<u32> = self
            .toc
            .groups()
            .filter(|(_, x)| x.index_page.is_some_and(|p| geometry.block_of(p) == block))
            .map(|(g, _)| g)
            .collect();
        for group in groups {
            self.acquire_for_write(group)?;
        }

        let valid = self.blocks.get(block).valid_index;
        if valid != 0 {
            return Err(ConsistencyError::ValidCountLeft { block, valid }.into());
        }

        self.free_block(block, scrub);
        Ok(block)
    }

    /// Return a block with no live pages to the free pool
    pub(super) fn free_block(&mut self, block: u32, scrub: bool) {
        let entry = self.blocks.get_mut(block);
        entry.status = BlockStatus::Free;
        entry.valid_data = 0;
        entry.valid_index = 0;
        entry.needs_erase = true;

        if scrub {
            if let Err(e) = self.erase_block(block) {
                warn!("cannot scrub block {block}: {e}");
            }
        }
    }

    /// The reverse index of a block: its BTOC when the block was closed, otherwise whatever the
    /// spares of its pages say
    pub(super) fn block_entries(
        &mut self,
        block: u32,
        stream: Stream,
    ) -> Result<BlockContents, FtlError> {
        let geometry = self.geometry;
        let usable = geometry.usable_pages();
        let mut data = vec![0u8; geometry.bytes_per_page];

        let mut btoc = Vec::with_capacity(geometry.btoc_pages as usize * geometry.bytes_per_page);
        for n in 0..geometry.btoc_pages {
            match self.read_page(geometry.page_of(block, usable + n), &mut data) {
                Ok((kind, Some(spare))) if kind == stream.btoc_kind() && spare.lpn == n => {
                    btoc.extend_from_slice(&data);
                }
                _ => break,
            }
        }

        if btoc.len() == geometry.btoc_pages as usize * geometry.bytes_per_page {
            let mut entries = decode_entries(&btoc, geometry.pages_per_block as usize);
            entries.truncate(usable as usize);
            return Ok(BlockContents {
                entries,
                closed: true,
                used: usable,
                damaged: false,
            });
        }

        trace!("block {block} has no reverse index; scanning its pages");
        let mut contents = BlockContents {
            entries: vec![UNMAPPED; usable as usize],
            closed: false,
            used: 0,
            damaged: false,
        };
        for (offset, entry) in (0u32..).zip(contents.entries.iter_mut()) {
            match self.read_page(geometry.page_of(block, offset), &mut data) {
                Ok((kind, Some(spare))) if kind == stream.page_kind() => *entry = spare.lpn,
                Ok((PageKind::Erased, _)) => break,
                Ok(_) => {}
                Err(e) => {
                    trace!("skipping unreadable page {offset} of block {block}: {e}");
                    contents.damaged = true;
                }
            }
            contents.used = offset + 1;
        }
        Ok(contents)
    }
}

#[cfg(test)]
mod tests {
    use crate::block::BlockStatus;
    use crate::config::FtlConfig;
    use crate::error::FtlError;
    use crate::ftl::{Ftl, Stream};
    use crate::l2v::NullL2v;
    use crate::vfl::{NandLayout, SimVfl};

    fn ftl() -> Ftl<SimVfl> {
        let vfl = SimVfl::new(NandLayout {
            blocks: 32,
            pages_per_block: 32,
            bytes_per_page: 512,
            banks: 1,
        });
        Ftl::open(vfl, NullL2v, FtlConfig::default()).unwrap()
    }

    #[test]
    fn test_reclaim_moves_live_pages() -> Result<(), FtlError> {
        let mut ftl = ftl();
        let data = vec![0x33; 31 * 512];
        ftl.write(0, 31, &data)?;
        let first = ftl.mapping(0)?.unwrap();
        let old = ftl.geometry().block_of(first);

        // Supersede most of the block
        ftl.write(0, 25, &data[..25 * 512])?;
        assert_eq!(ftl.block(old).status, BlockStatus::Allocated);
        assert_eq!(ftl.block(old).valid_data, 6);

        let contents = ftl.block_entries(old, Stream::User)?;
        assert!(contents.closed);
        assert_eq!(contents.used, 31);
        assert_eq!(contents.entries[30], 30);

        ftl.reclaim_data_block(None, true)?;
        assert_eq!(ftl.block(old).status, BlockStatus::Free);
        assert!(!ftl.block(old).needs_erase);
        assert_eq!(ftl.stats().gc_relocations, 6);
        assert_eq!(ftl.stats().data_pages, 31);

        let mut buf = vec![0; data.len()];
        ftl.read(0, 31, &mut buf)?;
        assert_eq!(buf, data);
        Ok(())
    }

    #[test]
    fn test_scan_unclosed_block() -> Result<(), FtlError> {
        let mut ftl = ftl();
        ftl.write(7, 3, &[0x44; 3 * 512])?;
        let page = ftl.mapping(7)?.unwrap();
        let block = ftl.geometry().block_of(page);

        let contents = ftl.block_entries(block, Stream::User)?;
        assert!(!contents.closed);
        assert!(!contents.damaged);
        assert_eq!(contents.used, 3);
        assert_eq!(&contents.entries[..4], &[7, 8, 9, u32::MAX]);
        Ok(())
    }
}
