//! The mapping table ("TOC") and the bookkeeping of its in-memory cache slots.
//!
//! The logical address space is split into groups of `toc_entries_per_page` pages. Each group's
//! mapping lives either on flash as one index page, in one cache slot, or both (when the slot is
//! clean). A dirty slot supersedes the flash copy, which is then forgotten. Flash I/O for loading
//! and evicting slots is driven by the core; this module only keeps the tables consistent.

use crate::geometry::UNMAPPED;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TocEntry {
    /// Physical page holding this group's mapping
    pub index_page: Option<u32>,

    /// Cache slot holding a live copy
    pub cache: Option<usize>,
}

impl TocEntry {
    /// Nothing was ever mapped in this group
    pub fn is_unknown(&self) -> bool {
        self.index_page.is_none() && self.cache.is_none()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlotState {
    Free,
    /// Identical to the group's index page on flash
    Clean,
    /// Newer than anything on flash
    Dirty,
}

#[derive(Debug, Clone)]
pub struct CacheSlot {
    pub state: SlotState,
    pub group: Option<u32>,
    pub entries: Box<[u32]>,
    pub use_count: u32,
}

#[derive(Debug, Clone)]
pub struct TocTable {
    groups: Box<[TocEntry]>,
    slots: Box<[CacheSlot]>,
}

impl TocTable {
    pub fn new(toc_len: u32, slots: usize, entries_per_page: u32) -> Self {
        let slot = CacheSlot {
            state: SlotState::Free,
            group: None,
            entries: vec![UNMAPPED; entries_per_page as usize].into_boxed_slice(),
            use_count: 0,
        };

        Self {
            groups: vec![TocEntry::default(); toc_len as usize].into_boxed_slice(),
            slots: vec![slot; slots].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> u32 {
        self.groups.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, group: u32) -> &TocEntry {
        &self.groups[group as usize]
    }

    pub fn group_mut(&mut self, group: u32) -> &mut TocEntry {
        &mut self.groups[group as usize]
    }

    pub fn groups(&self) -> impl Iterator<Item = (u32, &TocEntry)> {
        (0u32..).zip(self.groups.iter())
    }

    pub fn slot(&self, slot: usize) -> &CacheSlot {
        &self.slots[slot]
    }

    pub fn slot_mut(&mut self, slot: usize) -> &mut CacheSlot {
        &mut self.slots[slot]
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|x| x.state == SlotState::Free)
    }

    /// Choose a slot to give up: the least used clean slot, or failing that the least used dirty
    /// one (which must be written out before reuse).
    pub fn pick_victim(&self) -> Option<usize> {
        let least_used = |state| {
            self.slots
                .iter()
                .enumerate()
                .filter(|(_, x)| x.state == state)
                .min_by_key(|(_, x)| x.use_count)
                .map(|(i, _)| i)
        };

        least_used(SlotState::Clean).or_else(|| least_used(SlotState::Dirty))
    }

    /// Attach `slot` to `group`. The slot's entries are left for the caller to fill.
    pub fn bind(&mut self, slot: usize, group: u32, state: SlotState) {
        debug_assert_eq!(self.slots[slot].state, SlotState::Free);
        debug_assert_eq!(self.groups[group as usize].cache, None);

        let cache = &mut self.slots[slot];
        cache.state = state;
        cache.group = Some(group);
        cache.use_count = 0;
        self.groups[group as usize].cache = Some(slot);
    }

    /// Detach `slot` from its group, discarding its contents
    pub fn release(&mut self, slot: usize) {
        let cache = &mut self.slots[slot];
        if let Some(group) = cache.group.take() {
            self.groups[group as usize].cache = None;
        }
        cache.state = SlotState::Free;
        cache.use_count = 0;
        cache.entries.fill(UNMAPPED);
    }

    pub fn touch(&mut self, slot: usize) {
        let cache = &mut self.slots[slot];
        cache.use_count = cache.use_count.saturating_add(1);
    }

    pub fn dirty_slots(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].state == SlotState::Dirty)
            .collect()
    }

    /// Drop every cached group and forget all index pages
    pub fn reset(&mut self) {
        for slot in 0..self.slots.len() {
            self.release(slot);
        }
        self.groups.fill(TocEntry::default());
    }
}

#[test]
fn test_bind_release() {
    let mut toc = TocTable::new(4, 2, 8);
    assert!(toc.group(2).is_unknown());

    let slot = toc.free_slot().unwrap();
    toc.bind(slot, 2, SlotState::Dirty);
    toc.slot_mut(slot).entries[3] = 100;
    assert_eq!(toc.group(2).cache, Some(slot));
    assert_eq!(toc.slot(slot).group, Some(2));
    assert_eq!(toc.dirty_slots(), vec![slot]);

    toc.release(slot);
    assert_eq!(toc.group(2).cache, None);
    assert_eq!(toc.slot(slot).state, SlotState::Free);
    assert!(toc.slot(slot).entries.iter().all(|&x| x == UNMAPPED));
}

#[test]
fn test_victim_policy() {
    let mut toc = TocTable::new(8, 3, 8);
    toc.bind(0, 0, SlotState::Dirty);
    toc.bind(1, 1, SlotState::Clean);
    toc.bind(2, 2, SlotState::Clean);
    assert_eq!(toc.free_slot(), None);

    toc.touch(1);
    toc.touch(1);
    toc.touch(2);
    // Clean slots go first, least used first
    assert_eq!(toc.pick_victim(), Some(2));

    toc.release(2);
    toc.release(1);
    toc.bind(1, 4, SlotState::Dirty);
    toc.bind(2, 5, SlotState::Dirty);
    toc.touch(0);
    toc.touch(2);
    assert_eq!(toc.pick_victim(), Some(1));

    toc.reset();
    assert!(toc.groups().all(|(_, x)| x.is_unknown()));
    assert_eq!(toc.free_slot(), Some(0));
}
