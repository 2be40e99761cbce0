//! Writing checkpoints into the control blocks, and loading them back.
//!
//! Each control block holds consecutive checkpoint slots of `slot.pages()` pages, each followed by
//! one marker page. The marker is programmed by the first change after a checkpoint, so a
//! checkpoint whose marker page is still erased describes the medium exactly.

use log::{debug, info, warn};
use retry::{delay::NoDelay, retry};

use super::{CtrlState, FlushDebt, Ftl};
use crate::block::BlockStatus;
use crate::context::{Context, OpenBlockRecord};
use crate::error::{CheckpointError, FtlError};
use crate::l2v::L2v;
use crate::open_block::OpenBlock;
use crate::spare::{PageKind, PageSpare};
use crate::vfl::Vfl;

/// A checkpoint found on flash
struct Located {
    triple: [u32; 3],
    selected: usize,
    slot: u32,
    ctx_usn: u32,
    context: Context,
    stale: bool,
}

/// Three distinct blocks within the medium
pub(super) fn valid_triple(triple: &[u32; 3], blocks: u32) -> bool {
    triple.iter().all(|&b| b < blocks)
        && triple[0] != triple[1]
        && triple[1] != triple[2]
        && triple[0] != triple[2]
}

impl<V: Vfl, L: L2v> Ftl<V, L> {
    /// Persist all translation state. Does nothing when nothing changed since the last
    /// checkpoint.
    pub fn flush(&mut self) -> Result<(), FtlError> {
        if self.ctrl.clean {
            return Ok(());
        }

        self.prepare_for_flush()?;
        self.write_dirty_groups()?;

        self.stats.flushes += 1;
        // A failed attempt leaves the slot unset, so each retry moves to the next control block
        retry(NoDelay.take(2), || self.write_checkpoint()).map_err(|e| e.error)?;

        self.ctrl.clean = true;
        self.ctrl.flushes += 1;
        self.debt = FlushDebt::default();

        if self.ctrl.flushes >= self.config.ctrl_replace_interval {
            self.replace_control_blocks()?;
        }
        Ok(())
    }

    /// Note that the newest checkpoint no longer describes the medium. Must be called before the
    /// first change after a flush.
    pub(super) fn mark_dirty(&mut self) -> Result<(), FtlError> {
        if !self.ctrl.clean {
            return Ok(());
        }
        self.ctrl.clean = false;

        let Some(slot) = self.ctrl.slot else {
            return Ok(());
        };
        let block = self.ctrl.blocks[self.ctrl.selected];
        let page = self
            .geometry
            .page_of(block, slot + self.geometry.slot.pages());
        let data = vec![0u8; self.geometry.bytes_per_page];

        if let Err(e) = self.program(page, &data, PageSpare::marker(self.ctrl.ctx_usn)) {
            // Without a marker the old checkpoint would look current, so nothing may survive
            warn!("cannot mark checkpoint stale ({e}); erasing control blocks");
            for block in self.ctrl.blocks {
                self.erase_block(block)?;
            }
            self.ctrl.slot = None;
            self.ctrl.erased = true;
        }
        Ok(())
    }

    fn snapshot(&self) -> Context {
        let record = |x: &Option<OpenBlock>| {
            x.as_ref().map(|x| OpenBlockRecord {
                block: x.block,
                used: x.used,
                usn: x.usn,
                shadow: x.shadow.to_vec(),
            })
        };

        Context {
            user: record(&self.user),
            index: record(&self.index),
            usn: self.usn,
            ctx_usn: self.ctrl.ctx_usn,
            flush_count: self.ctrl.flushes,
            stats: self.stats(),
            vfl_stats: self.vfl.stats(),
            toc_index: self.toc.groups().map(|(_, x)| x.index_page).collect(),
            blocks: self.blocks.iter().map(|(_, x)| *x).collect(),
        }
    }

    /// Write one checkpoint into the next free slot, rotating to the next control block when the
    /// selected one is full
    fn write_checkpoint(&mut self) -> Result<(), FtlError> {
        let stride = self.geometry.slot_stride();
        let offset = match self.ctrl.slot {
            Some(slot) if self.geometry.slot_fits(slot + stride) => slot + stride,
            None if self.ctrl.erased => 0,
            _ => {
                self.rotate_control_block()?;
                0
            }
        };

        self.ctrl.ctx_usn = self.ctrl.ctx_usn.wrapping_add(1);
        let block = self.ctrl.blocks[self.ctrl.selected];
        let bytes = self.snapshot().encode(&self.geometry)?;

        self.ctrl.slot = None;
        self.ctrl.erased = false;
        for (n, chunk) in (0u32..).zip(bytes.chunks(self.geometry.bytes_per_page)) {
            let page = self.geometry.page_of(block, offset + n);
            if let Err(e) = self.program(page, chunk, PageSpare::context(n, self.ctrl.ctx_usn)) {
                warn!("checkpoint write to block {block} failed: {e}");
                return Err(e);
            }
        }

        self.ctrl.slot = Some(offset);
        debug!(
            "checkpoint {} written to block {block} at page {offset}",
            self.ctrl.ctx_usn
        );
        Ok(())
    }

    /// Leave the selected control block for the next one in rotation, erasing it
    fn rotate_control_block(&mut self) -> Result<(), FtlError> {
        let old = self.ctrl.blocks[self.ctrl.selected];
        self.blocks.set_status(old, BlockStatus::FtlCtrl);

        self.ctrl.selected = (self.ctrl.selected + 1) % 3;
        self.ctrl.slot = None;
        self.ctrl.erased = false;

        let block = self.ctrl.blocks[self.ctrl.selected];
        self.blocks.set_status(block, BlockStatus::FtlCtrlSel);
        self.erase_block(block)?;
        self.ctrl.erased = true;
        debug!("checkpoints move from block {old} to block {block}");
        Ok(())
    }

    /// Move all three control blocks to the least-worn free blocks, if those are worn
    /// sufficiently less than the current ones
    fn replace_control_blocks(&mut self) -> Result<(), FtlError> {
        self.ctrl.flushes = 0;

        let old = self.ctrl.blocks;
        let worn = old
            .iter()
            .map(|&b| self.blocks.get(b).erase_count)
            .min()
            .unwrap_or(0);
        let margin = self.config.ctrl_replace_margin;

        let mut fresh: Vec<(u32, u32)> = self
            .blocks
            .iter()
            .filter(|(_, x)| x.status == BlockStatus::Free)
            .filter(|(_, x)| x.erase_count.saturating_add(margin) < worn)
            .map(|(b, x)| (x.erase_count, b))
            .collect();
        if fresh.len() < 3 {
            debug!("no free blocks worn less than the control blocks ({worn} erases)");
            return Ok(());
        }
        fresh.sort_unstable();
        let new = [fresh[0].1, fresh[1].1, fresh[2].1];

        for block in new {
            self.erase_block(block)?;
            self.blocks.set_status(block, BlockStatus::FtlCtrl);
        }
        self.vfl.write_control_blocks(new)?;

        for block in old {
            let entry = self.blocks.get_mut(block);
            entry.status = BlockStatus::Free;
            entry.needs_erase = true;
        }

        self.ctrl.blocks = new;
        self.ctrl.selected = 0;
        self.ctrl.slot = None;
        self.ctrl.erased = true;
        self.blocks.set_status(new[0], BlockStatus::FtlCtrlSel);
        self.write_checkpoint()?;

        for block in old {
            if let Err(e) = self.erase_block(block) {
                warn!("cannot erase old control block {block}: {e}");
            }
        }
        // Record the erases above
        self.write_checkpoint()?;

        info!("control blocks moved from {old:?} to {new:?}");
        Ok(())
    }

    /// Find the newest checkpoint: the control block whose first page carries the highest
    /// sequence number, and the last slot written in it
    fn locate_checkpoint(&mut self) -> Result<Located, FtlError> {
        let triple = self
            .vfl
            .control_blocks()
            .filter(|x| valid_triple(x, self.geometry.blocks))
            .ok_or(CheckpointError::NotFound)?;

        let mut newest: Option<(usize, u32)> = None;
        for (i, &block) in triple.iter().enumerate() {
            if let Ok((PageKind::Context, Some(spare))) =
                self.read_spare(self.geometry.page_of(block, 0))
            {
                if spare.lpn == 0 && newest.map_or(true, |(_, usn)| spare.usn > usn) {
                    newest = Some((i, spare.usn));
                }
            }
        }
        let (selected, ctx_usn) = newest.ok_or(CheckpointError::NotFound)?;
        let block = triple[selected];

        let stride = self.geometry.slot_stride();
        let mut slot = 0;
        let mut next = stride;
        while self.geometry.slot_fits(next) {
            match self.read_spare(self.geometry.page_of(block, next)) {
                Ok((PageKind::Context, Some(spare))) if spare.lpn == 0 => slot = next,
                _ => break,
            }
            next += stride;
        }

        let page_bytes = self.geometry.bytes_per_page;
        let pages = self.geometry.slot.pages();
        let first = self.geometry.page_of(block, slot);
        let mut bytes = vec![0u8; pages as usize * page_bytes];
        let mut slot_usn = None;
        for (n, chunk) in (0u32..).zip(bytes.chunks_exact_mut(page_bytes)) {
            let page = first + n;
            match self.read_page(page, chunk) {
                Ok((PageKind::Context, Some(spare)))
                    if spare.lpn == n && slot_usn.map_or(true, |x| x == spare.usn) =>
                {
                    slot_usn = Some(spare.usn);
                }
                _ => return Err(CheckpointError::Corrupt(page).into()),
            }
        }
        let context = Context::decode(&self.geometry, &bytes, first)?;

        let stale = !matches!(self.read_spare(first + pages), Ok((PageKind::Erased, _)));

        Ok(Located {
            triple,
            selected,
            slot,
            ctx_usn: ctx_usn.max(context.ctx_usn),
            context,
            stale,
        })
    }

    /// Restore all state from the newest checkpoint, if it is current
    pub(super) fn load_checkpoint(&mut self) -> Result<(), FtlError> {
        let Located {
            triple,
            selected,
            slot,
            ctx_usn,
            context,
            stale,
        } = self.locate_checkpoint()?;

        if stale {
            self.keep_wear(&context, ctx_usn);
            return Err(CheckpointError::Stale.into());
        }

        for (b, entry) in (0u32..).zip(context.blocks) {
            let target = self.blocks.get_mut(b);
            *target = entry;
            if entry.status.is_control() && !triple.contains(&b) {
                target.status = BlockStatus::Free;
                target.needs_erase = true;
            }
        }
        for (i, &block) in triple.iter().enumerate() {
            let status = if i == selected {
                BlockStatus::FtlCtrlSel
            } else {
                BlockStatus::FtlCtrl
            };
            self.blocks.set_status(block, status);
        }

        let ppb = self.geometry.pages_per_block;
        let reopen = |record: OpenBlockRecord| {
            let mut open = OpenBlock::new(record.block, record.usn, ppb);
            open.used = record.used;
            for (entry, lpn) in open.shadow.iter_mut().zip(record.shadow) {
                *entry = lpn;
            }
            open
        };
        self.user = context.user.map(reopen);
        self.index = context.index.map(reopen);
        if let Some(open) = &self.user {
            self.blocks.set_status(open.block, BlockStatus::Current);
        }
        if let Some(open) = &self.index {
            self.blocks.set_status(open.block, BlockStatus::ICurrent);
        }

        for (group, page) in (0u32..).zip(context.toc_index) {
            self.toc.group_mut(group).index_page = page;
        }

        self.usn = context.usn;
        self.stats = context.stats;
        self.ctrl = CtrlState {
            blocks: triple,
            selected,
            slot: Some(slot),
            erased: false,
            ctx_usn,
            clean: true,
            flushes: context.flush_count,
        };
        self.blocks.update_wear_range();

        info!(
            "loaded checkpoint {ctx_usn} from block {} page {slot}",
            triple[selected]
        );
        Ok(())
    }

    /// Take only the erase counts and statistics of the newest checkpoint, if there is one
    pub(super) fn import_wear(&mut self) {
        match self.locate_checkpoint() {
            Ok(located) => self.keep_wear(&located.context, located.ctx_usn),
            Err(e) => debug!("no wear history to import: {e}"),
        }
    }

    fn keep_wear(&mut self, context: &Context, ctx_usn: u32) {
        for (b, entry) in (0u32..).zip(&context.blocks) {
            self.blocks.get_mut(b).erase_count = entry.erase_count;
        }
        self.blocks.update_wear_range();
        self.stats = context.stats;
        self.ctrl.ctx_usn = ctx_usn;
    }
}

#[test]
fn test_valid_triple() {
    assert!(valid_triple(&[0, 1, 2], 3));
    assert!(!valid_triple(&[0, 1, 3], 3));
    assert!(!valid_triple(&[4, 1, 4], 8));
}
