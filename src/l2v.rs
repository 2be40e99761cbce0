//! The auxiliary logical-to-virtual index kept in step with the TOC.

use crate::geometry::UNMAPPED;

/// A fast-path mapping structure fed by the translation layer
pub trait L2v {
    fn init(&mut self, total_pages: u32, blocks: u32, pages_per_block: u32);

    /// Called once the TOC is consistent. Returning true asks for every TOC page to be replayed
    /// through [`L2v::update_from_toc_page`].
    fn open(&mut self) -> bool;

    /// `count` logical pages starting at `lpn` now live at consecutive physical pages starting at
    /// `base`, or are gone when `base` is None.
    fn update(&mut self, lpn: u32, count: u32, base: Option<u32>);

    /// Replace the mapping of one whole TOC group
    fn update_from_toc_page(&mut self, group: u32, entries: &[u32]);
}

/// An L2V that keeps nothing
#[derive(Debug, Default, Copy, Clone)]
pub struct NullL2v;

impl L2v for NullL2v {
    fn init(&mut self, _total_pages: u32, _blocks: u32, _pages_per_block: u32) {}

    fn open(&mut self) -> bool {
        false
    }

    fn update(&mut self, _lpn: u32, _count: u32, _base: Option<u32>) {}

    fn update_from_toc_page(&mut self, _group: u32, _entries: &[u32]) {}
}

/// A flat array with one entry per logical page
#[derive(Debug, Default, Clone)]
pub struct DenseL2v {
    map: Vec<u32>,
    entries_per_group: Option<usize>,
}

impl DenseL2v {
    pub fn lookup(&self, lpn: u32) -> Option<u32> {
        self.map
            .get(lpn as usize)
            .copied()
            .filter(|&x| x != UNMAPPED)
    }

    /// Number of mapped logical pages
    pub fn mapped(&self) -> usize {
        self.map.iter().filter(|&&x| x != UNMAPPED).count()
    }
}

impl L2v for DenseL2v {
    fn init(&mut self, total_pages: u32, _blocks: u32, _pages_per_block: u32) {
        self.map = vec![UNMAPPED; total_pages as usize];
    }

    fn open(&mut self) -> bool {
        true
    }

    fn update(&mut self, lpn: u32, count: u32, base: Option<u32>) {
        let begin = (lpn as usize).min(self.map.len());
        let end = (begin + count as usize).min(self.map.len());
        for (i, entry) in self.map[begin..end].iter_mut().enumerate() {
            *entry = base.map_or(UNMAPPED, |x| x + i as u32);
        }
    }

    fn update_from_toc_page(&mut self, group: u32, entries: &[u32]) {
        let per_group = *self.entries_per_group.get_or_insert(entries.len());
        let begin = (group as usize * per_group).min(self.map.len());
        let end = (begin + entries.len()).min(self.map.len());
        self.map[begin..end].copy_from_slice(&entries[..end - begin]);
    }
}

#[test]
fn test_dense_l2v() {
    let mut l2v = DenseL2v::default();
    l2v.init(10, 4, 4);
    l2v.update(2, 3, Some(100));
    assert_eq!(l2v.lookup(3), Some(101));
    assert_eq!(l2v.mapped(), 3);

    l2v.update(3, 1, None);
    assert_eq!(l2v.lookup(3), None);

    // The last group is clipped to the logical capacity
    l2v.update_from_toc_page(2, &[7, 8, 9, 10]);
    assert_eq!(l2v.lookup(8), Some(7));
    assert_eq!(l2v.lookup(9), Some(8));
    assert_eq!(l2v.lookup(10), None);
}
