//! Moving TOC groups between flash and the cache slots.

use log::trace;

use super::{Ftl, Lookup, Stream};
use crate::error::{ConsistencyError, FtlError};
use crate::geometry::UNMAPPED;
use crate::l2v::L2v;
use crate::open_block::{decode_entries, encode_entries};
use crate::spare::PageKind;
use crate::toc::SlotState;
use crate::vfl::Vfl;

impl<V: Vfl, L: L2v> Ftl<V, L> {
    /// Resolve one logical page
    pub(super) fn lookup(&mut self, lpn: u32) -> Result<Lookup, FtlError> {
        let (group, index) = self.geometry.group_of(lpn);
        let entry = *self.toc.group(group);

        let last = self
            .last_toc
            .as_ref()
            .filter(|(g, _)| *g == group)
            .map(|(_, entries)| entries[index]);

        let value = if let Some(slot) = entry.cache {
            self.toc.touch(slot);
            self.toc.slot(slot).entries[index]
        } else if let Some(value) = last {
            value
        } else if let Some(page) = entry.index_page {
            let entries = self.read_toc_page(group, page)?;
            let value = entries[index];
            match self.toc.free_slot() {
                Some(slot) => {
                    self.toc.bind(slot, group, SlotState::Clean);
                    self.toc.slot_mut(slot).entries.copy_from_slice(&entries);
                }
                None => self.last_toc = Some((group, entries)),
            }
            value
        } else {
            return Ok(Lookup::Unknown);
        };

        Ok(if value == UNMAPPED {
            Lookup::Unmapped
        } else {
            Lookup::Mapped(value)
        })
    }

    /// Read and verify the on-flash copy of `group`
    pub(super) fn read_toc_page(&mut self, group: u32, page: u32) -> Result<Box<[u32]>, FtlError> {
        let mut data = vec![0u8; self.geometry.bytes_per_page];
        let (kind, spare) = self.read_page(page, &mut data)?;
        if kind != PageKind::Index {
            return Err(ConsistencyError::WrongPageType(page).into());
        }
        if let Some(spare) = spare.filter(|x| x.lpn != group) {
            return Err(ConsistencyError::LpnMismatch {
                page,
                expected: group,
                found: spare.lpn,
            }
            .into());
        }

        self.note_read(self.geometry.block_of(page));
        let entries = decode_entries(&data, self.geometry.toc_entries_per_page as usize);
        Ok(entries.into_boxed_slice())
    }

    /// Forget the on-flash copy of `group`, which is about to be superseded
    pub(super) fn drop_index_page(&mut self, group: u32) -> Result<(), FtlError> {
        if self.last_toc.as_ref().is_some_and(|(g, _)| *g == group) {
            self.last_toc = None;
        }
        if let Some(page) = self.toc.group_mut(group).index_page.take() {
            self.blocks
                .remove_valid_index(self.geometry.block_of(page), 1)?;
        }
        Ok(())
    }

    /// Get the cache slot of `group` ready for modification, loading the group and evicting
    /// another slot if necessary. The returned slot is dirty.
    pub(super) fn acquire_for_write(&mut self, group: u32) -> Result<usize, FtlError> {
        if self.last_toc.as_ref().is_some_and(|(g, _)| *g == group) {
            self.last_toc = None;
        }

        if let Some(slot) = self.toc.group(group).cache {
            self.toc.touch(slot);
            if self.toc.slot(slot).state == SlotState::Clean {
                self.drop_index_page(group)?;
                self.toc.slot_mut(slot).state = SlotState::Dirty;
            }
            return Ok(slot);
        }

        let entries = match self.toc.group(group).index_page {
            Some(page) => Some(self.read_toc_page(group, page)?),
            None => None,
        };

        let slot = self.take_slot()?;
        self.toc.bind(slot, group, SlotState::Dirty);
        match entries {
            Some(entries) => self.toc.slot_mut(slot).entries.copy_from_slice(&entries),
            None => self.toc.slot_mut(slot).entries.fill(UNMAPPED),
        }
        self.drop_index_page(group)?;
        Ok(slot)
    }

    /// A free cache slot, evicting (and if needed writing out) the least valuable one
    fn take_slot(&mut self) -> Result<usize, FtlError> {
        if let Some(slot) = self.toc.free_slot() {
            return Ok(slot);
        }

        let slot = self.toc.pick_victim().ok_or(FtlError::OutOfMemory)?;
        if self.toc.slot(slot).state == SlotState::Dirty {
            self.write_group(slot)?;
        }
        trace!("evicting TOC group {:?} from slot {slot}", self.toc.slot(slot).group);
        self.toc.release(slot);
        Ok(slot)
    }

    /// Write a dirty slot out as an index page; the slot stays cached, now clean
    pub(super) fn write_group(&mut self, slot: usize) -> Result<(), FtlError> {
        let cache = self.toc.slot(slot);
        let Some(group) = cache.group else {
            return Ok(());
        };
        if cache.state != SlotState::Dirty {
            return Ok(());
        }

        let bytes = encode_entries(&cache.entries, self.geometry.bytes_per_page);
        let page = self.append_page(Stream::Index, group, &bytes)?;
        self.blocks.add_valid_index(self.geometry.block_of(page), 1);
        self.toc.group_mut(group).index_page = Some(page);
        self.toc.slot_mut(slot).state = SlotState::Clean;
        Ok(())
    }

    /// Write out every dirty slot
    pub(super) fn write_dirty_groups(&mut self) -> Result<(), FtlError> {
        for slot in self.toc.dirty_slots() {
            self.write_group(slot)?;
        }
        Ok(())
    }

    /// Set one entry of an acquired slot, returning the entry it replaced
    pub(super) fn set_entry(&mut self, lpn: u32, value: u32) -> Result<u32, FtlError> {
        let (group, index) = self.geometry.group_of(lpn);
        let slot = self.acquire_for_write(group)?;
        let entry = &mut self.toc.slot_mut(slot).entries[index];
        Ok(std::mem::replace(entry, value))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::FtlConfig;
    use crate::ftl::{Ftl, Lookup};
    use crate::l2v::NullL2v;
    use crate::toc::SlotState;
    use crate::vfl::{NandLayout, SimVfl};

    fn small_ftl(caches: usize) -> Ftl<SimVfl> {
        let vfl = SimVfl::new(NandLayout {
            blocks: 32,
            pages_per_block: 32,
            bytes_per_page: 512,
            banks: 1,
        });
        let config = FtlConfig {
            toc_caches: caches,
            ..Default::default()
        };
        Ftl::open(vfl, NullL2v, config).unwrap()
    }

    #[test]
    fn test_unknown_group() {
        let mut ftl = small_ftl(2);
        assert_eq!(ftl.lookup(0).unwrap(), Lookup::Unknown);
        assert_eq!(ftl.mapping(300).unwrap(), None);
    }

    #[test]
    fn test_eviction_writes_index_page() {
        let mut ftl = small_ftl(2);
        let page = vec![0x5A; 512];

        // Touch three groups with only two slots
        for lpn in [0, 128, 256] {
            ftl.write(lpn, 1, &page).unwrap();
        }
        assert!(ftl.toc.group(0).index_page.is_some());
        assert_eq!(ftl.blocks.total_valid_index(), 1);

        // Looking the evicted group up again reads it back from flash
        assert!(matches!(ftl.lookup(0).unwrap(), Lookup::Mapped(_)));

        ftl.flush().unwrap();
        assert!(ftl.toc.dirty_slots().is_empty());
        for group in 0..3 {
            assert!(ftl.toc.group(group).index_page.is_some());
        }
        assert_eq!(ftl.blocks.total_valid_index(), 3);
    }

    #[test]
    fn test_acquire_supersedes_flash_copy() {
        let mut ftl = small_ftl(2);
        let page = vec![1; 512];
        ftl.write(5, 1, &page).unwrap();
        ftl.flush().unwrap();
        assert_eq!(ftl.blocks.total_valid_index(), 1);

        let slot = ftl.acquire_for_write(0).unwrap();
        assert_eq!(ftl.toc.slot(slot).state, SlotState::Dirty);
        assert_eq!(ftl.toc.group(0).index_page, None);
        assert_eq!(ftl.blocks.total_valid_index(), 0);
    }
}
