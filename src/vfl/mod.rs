//! Abstractions over the raw, page-addressed flash layer that the translation layer sits on.
//!
//! Bad-block remapping and chip addressing live behind the [`Vfl`] trait; the translation layer
//! only ever sees a flat array of equally-sized blocks.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::VflError;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub banks: u32,
}

/// Parse strings like "BLOCKSxPAGESxBYTES", optionally followed by "xBANKS"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<_> = s.split('x').collect();
        let (blocks, pages_per_block, bytes_per_page, banks) = match parts[..] {
            [b, p, s] => (b, p, s, "1"),
            [b, p, s, k] => (b, p, s, k),
            _ => anyhow::bail!("expected #x#x# or #x#x#x#"),
        };

        let layout = NandLayout {
            blocks: blocks.parse()?,
            pages_per_block: pages_per_block.parse()?,
            bytes_per_page: bytes_per_page.parse()?,
            banks: banks.parse()?,
        };
        anyhow::ensure!(layout.banks > 0, "at least one bank is required");

        Ok(layout)
    }
}

/// Identifiers for [`Vfl::geometry_value`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GeometryValue {
    PagesPerBlock,
    Blocks,
    BytesPerPage,
    SpareBytes,
    Banks,
}

/// Whether a page read back anything at all
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageState {
    Written,
    Erased,
}

/// The raw flash layer consumed by the translation layer
///
/// Pages are addressed globally: page `p` lives in block `p / pages_per_block`. Within a block,
/// pages must be programmed in ascending order, and a block must be erased before any of its pages
/// can be programmed again.
pub trait Vfl {
    fn geometry_value(&self, id: GeometryValue) -> u32;

    /// Read one page and its out-of-band area
    fn read_page(
        &mut self,
        page: u32,
        data: &mut [u8],
        spare: &mut [u8],
    ) -> Result<PageState, VflError>;

    /// Program one page and its out-of-band area
    fn write_page(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<(), VflError>;

    /// Erase a whole block. With `allow_replacement`, the layer may swap a failing physical block
    /// for a spare one instead of reporting an error.
    fn erase_block(&mut self, block: u32, allow_replacement: bool) -> Result<(), VflError>;

    /// The three blocks the translation layer keeps its checkpoints in, if it ever chose any
    fn control_blocks(&self) -> Option<[u32; 3]>;

    fn write_control_blocks(&mut self, blocks: [u32; 3]) -> Result<(), VflError>;

    /// Opaque statistics of this layer, stored verbatim alongside each checkpoint
    fn stats(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Read `count` consecutive pages; `data` and `spare` hold one page (or spare) per chunk.
    fn read_pages(
        &mut self,
        page: u32,
        count: u32,
        data: &mut [u8],
        spare: &mut [u8],
    ) -> Result<(), VflError> {
        if count == 0 {
            return Ok(());
        }
        let page_len = data.len() / count as usize;
        let spare_len = spare.len() / count as usize;
        for (i, (data, spare)) in data
            .chunks_exact_mut(page_len)
            .zip(spare.chunks_exact_mut(spare_len))
            .enumerate()
        {
            self.read_page(page + i as u32, data, spare)?;
        }
        Ok(())
    }
}

impl<T: Vfl + ?Sized> Vfl for &mut T {
    fn geometry_value(&self, id: GeometryValue) -> u32 {
        (**self).geometry_value(id)
    }
    fn read_page(
        &mut self,
        page: u32,
        data: &mut [u8],
        spare: &mut [u8],
    ) -> Result<PageState, VflError> {
        (**self).read_page(page, data, spare)
    }
    fn write_page(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<(), VflError> {
        (**self).write_page(page, data, spare)
    }
    fn erase_block(&mut self, block: u32, allow_replacement: bool) -> Result<(), VflError> {
        (**self).erase_block(block, allow_replacement)
    }
    fn control_blocks(&self) -> Option<[u32; 3]> {
        (**self).control_blocks()
    }
    fn write_control_blocks(&mut self, blocks: [u32; 3]) -> Result<(), VflError> {
        (**self).write_control_blocks(blocks)
    }
    fn stats(&self) -> Vec<u8> {
        (**self).stats()
    }
}

/// Size of the out-of-band area of every simulated page
pub const SIM_SPARE_BYTES: usize = 16;

const SIM_IMAGE_MAGIC: &[u8; 8] = b"SIMVFL01";

/// A simulated in-memory flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimVfl {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
    control: Option<[u32; 3]>,

    /// Pages whose next program attempt fails
    program_faults: BTreeSet<u32>,

    /// Pages that read back as uncorrectable until their block is erased
    read_faults: BTreeSet<u32>,

    /// Blocks that refuse to erase
    erase_faults: BTreeSet<u32>,

    pages_read: u64,
    pages_written: u64,
    erases: u64,
}

/// A block of SimVfl
#[derive(Debug, Clone, Default)]
struct SimBlock {
    /// Bytes of all programmed pages (legally, can only append to this)
    data: Vec<u8>,

    /// Out-of-band bytes of all programmed pages, `SIM_SPARE_BYTES` per page
    spare: Vec<u8>,

    /// How many times this block was erased
    erase_count: u32,
}

impl SimVfl {
    /// Create an erased SimVfl with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::default(); layout.blocks as usize].into_boxed_slice();

        Self {
            blocks,
            layout,
            control: None,
            program_faults: BTreeSet::new(),
            read_faults: BTreeSet::new(),
            erase_faults: BTreeSet::new(),
            pages_read: 0,
            pages_written: 0,
            erases: 0,
        }
    }

    pub fn layout(&self) -> NandLayout {
        self.layout
    }

    /// How many times `block` was erased since this flash was created (or loaded)
    pub fn erase_count(&self, block: u32) -> u32 {
        self.blocks[block as usize].erase_count
    }

    /// Make the next program of `page` fail
    pub fn fail_program(&mut self, page: u32) {
        self.program_faults.insert(page);
    }

    /// Make `page` unreadable until its block is erased
    pub fn fail_read(&mut self, page: u32) {
        self.read_faults.insert(page);
    }

    /// Make every erase of `block` fail
    pub fn fail_erase(&mut self, block: u32) {
        self.erase_faults.insert(block);
    }

    /// Replace the flash contents with an image previously produced by [`SimVfl::save`]
    pub fn load<R: Read>(read: &mut R) -> anyhow::Result<Self> {
        let mut image = Vec::new();
        read.read_to_end(&mut image)?;
        let mut buf = &image[..];

        anyhow::ensure!(
            buf.len() >= SIM_IMAGE_MAGIC.len() && &buf[..SIM_IMAGE_MAGIC.len()] == SIM_IMAGE_MAGIC,
            "not a simulated flash image"
        );
        buf.advance(SIM_IMAGE_MAGIC.len());
        anyhow::ensure!(buf.remaining() >= 29, "truncated image header");

        let layout = NandLayout {
            blocks: buf.get_u32_le(),
            pages_per_block: buf.get_u32_le(),
            bytes_per_page: buf.get_u32_le() as usize,
            banks: buf.get_u32_le(),
        };
        let has_control = buf.get_u8() != 0;
        let control = [buf.get_u32_le(), buf.get_u32_le(), buf.get_u32_le()];

        let mut sim = Self::new(layout);
        sim.control = has_control.then_some(control);

        for block in sim.blocks.iter_mut() {
            anyhow::ensure!(buf.remaining() >= 8, "truncated block header");
            block.erase_count = buf.get_u32_le();
            let pages = buf.get_u32_le();
            anyhow::ensure!(pages <= layout.pages_per_block, "block holds too many pages");

            let data_len = pages as usize * layout.bytes_per_page;
            let spare_len = pages as usize * SIM_SPARE_BYTES;
            anyhow::ensure!(buf.remaining() >= data_len + spare_len, "truncated block");
            block.data = buf[..data_len].to_vec();
            buf.advance(data_len);
            block.spare = buf[..spare_len].to_vec();
            buf.advance(spare_len);
        }

        Ok(sim)
    }

    /// Write the contents of this simulated flash out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut header = BytesMut::with_capacity(64);
        header.put_slice(SIM_IMAGE_MAGIC);
        header.put_u32_le(self.layout.blocks);
        header.put_u32_le(self.layout.pages_per_block);
        header.put_u32_le(self.layout.bytes_per_page as u32);
        header.put_u32_le(self.layout.banks);
        header.put_u8(self.control.is_some() as u8);
        for block in self.control.unwrap_or([u32::MAX; 3]) {
            header.put_u32_le(block);
        }
        write.write_all(&header)?;

        for block in self.blocks.iter() {
            let pages = block.spare.len() / SIM_SPARE_BYTES;
            write.write_all(&block.erase_count.to_le_bytes())?;
            write.write_all(&(pages as u32).to_le_bytes())?;
            write.write_all(&block.data)?;
            write.write_all(&block.spare)?;
        }

        Ok(())
    }

    fn locate(&self, page: u32) -> Result<(usize, usize), VflError> {
        let block = page / self.layout.pages_per_block;
        if block >= self.layout.blocks {
            return Err(VflError::OutOfRange(page));
        }
        Ok((block as usize, (page % self.layout.pages_per_block) as usize))
    }
}

impl Vfl for SimVfl {
    fn geometry_value(&self, id: GeometryValue) -> u32 {
        match id {
            GeometryValue::PagesPerBlock => self.layout.pages_per_block,
            GeometryValue::Blocks => self.layout.blocks,
            GeometryValue::BytesPerPage => self.layout.bytes_per_page as u32,
            GeometryValue::SpareBytes => SIM_SPARE_BYTES as u32,
            GeometryValue::Banks => self.layout.banks,
        }
    }

    fn read_page(
        &mut self,
        page: u32,
        data: &mut [u8],
        spare: &mut [u8],
    ) -> Result<PageState, VflError> {
        let page_size = self.layout.bytes_per_page;
        if data.len() != page_size || spare.len() > SIM_SPARE_BYTES {
            return Err(VflError::BadBuffer);
        }
        let (block, index) = self.locate(page)?;
        if self.read_faults.contains(&page) {
            return Err(VflError::Uncorrectable(page));
        }
        self.pages_read += 1;

        let block = &self.blocks[block];
        let begin = index * page_size;
        match block.data.get(begin..begin + page_size) {
            Some(bytes) => data.copy_from_slice(bytes),
            None => data.fill(0xFF),
        }
        let begin = index * SIM_SPARE_BYTES;
        match block.spare.get(begin..begin + spare.len()) {
            Some(bytes) => spare.copy_from_slice(bytes),
            None => spare.fill(0xFF),
        }

        if data.is_erased() && spare.is_erased() {
            Ok(PageState::Erased)
        } else {
            Ok(PageState::Written)
        }
    }

    fn write_page(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<(), VflError> {
        let page_size = self.layout.bytes_per_page;
        if data.len() != page_size || spare.len() > SIM_SPARE_BYTES {
            return Err(VflError::BadBuffer);
        }
        let (block, index) = self.locate(page)?;
        let block_data = &mut self.blocks[block];

        let begin = index * page_size;
        if begin < block_data.data.len() {
            return Err(VflError::OutOfOrder(page));
        }

        block_data.data.resize(begin, 0xFF);
        block_data.spare.resize(index * SIM_SPARE_BYTES, 0xFF);

        if self.program_faults.remove(&page) {
            // The page is consumed but holds nothing trustworthy.
            block_data.data.resize(begin + page_size, 0x00);
            block_data.spare.resize((index + 1) * SIM_SPARE_BYTES, 0x00);
            self.read_faults.insert(page);
            return Err(VflError::ProgramFailed(page));
        }

        block_data.data.extend_from_slice(data);
        block_data.spare.extend_from_slice(spare);
        block_data
            .spare
            .resize((index + 1) * SIM_SPARE_BYTES, 0xFF);
        self.pages_written += 1;

        Ok(())
    }

    fn erase_block(&mut self, block: u32, _allow_replacement: bool) -> Result<(), VflError> {
        if block >= self.layout.blocks {
            return Err(VflError::OutOfRange(block * self.layout.pages_per_block));
        }
        if self.erase_faults.contains(&block) {
            return Err(VflError::EraseFailed(block));
        }

        let ppb = self.layout.pages_per_block;
        let pages = block * ppb..(block + 1) * ppb;
        self.read_faults.retain(|page| !pages.contains(page));

        let block = &mut self.blocks[block as usize];
        block.data.clear();
        block.spare.clear();
        block.erase_count += 1;
        self.erases += 1;

        Ok(())
    }

    fn control_blocks(&self) -> Option<[u32; 3]> {
        self.control
    }

    fn write_control_blocks(&mut self, blocks: [u32; 3]) -> Result<(), VflError> {
        if blocks.iter().any(|&b| b >= self.layout.blocks) {
            return Err(VflError::OutOfRange(u32::MAX));
        }
        self.control = Some(blocks);
        Ok(())
    }

    fn stats(&self) -> Vec<u8> {
        let mut stats = BytesMut::with_capacity(24);
        stats.put_u64_le(self.pages_read);
        stats.put_u64_le(self.pages_written);
        stats.put_u64_le(self.erases);
        stats.to_vec()
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    banks: 1,
};

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    let layout: NandLayout = "100x64x2048".parse()?;
    assert_eq!(
        layout,
        NandLayout {
            blocks: 100,
            pages_per_block: 64,
            bytes_per_page: 2048,
            banks: 1,
        }
    );
    assert_eq!("32x32x512x4".parse::<NandLayout>()?.banks, 4);
    assert!("32x32".parse::<NandLayout>().is_err());
    assert!("32x32x512x0".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut sim = SimVfl::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let spare_in = [0x11u8; 12];
    let mut data_out = data_in.clone();
    let mut spare_out = [0u8; 12];

    sim.write_page(2, &data_in, &spare_in)?;
    assert!(matches!(
        sim.write_page(1, &data_in, &spare_in),
        Err(VflError::OutOfOrder(1))
    ));

    assert_eq!(sim.read_page(1, &mut data_out, &mut spare_out)?, PageState::Erased);
    assert!(data_out.is_erased());

    assert_eq!(sim.read_page(2, &mut data_out, &mut spare_out)?, PageState::Written);
    assert_eq!(data_out, data_in);
    assert_eq!(spare_out, spare_in);

    assert_eq!(sim.read_page(3, &mut data_out, &mut spare_out)?, PageState::Erased);
    Ok(())
}

#[test]
fn test_sim_erase_and_faults() -> anyhow::Result<()> {
    let mut sim = SimVfl::new(TEST_LAYOUT);
    let page = vec![0u8; TEST_LAYOUT.bytes_per_page];
    let mut out = page.clone();
    let mut spare = [0u8; 12];

    sim.fail_program(16);
    assert!(matches!(
        sim.write_page(16, &page, &spare),
        Err(VflError::ProgramFailed(16))
    ));
    assert!(matches!(
        sim.read_page(16, &mut out, &mut spare),
        Err(VflError::Uncorrectable(16))
    ));
    // The failed page still advanced the program cursor
    assert!(sim.write_page(16, &page, &spare).is_err());
    sim.write_page(17, &page, &spare)?;

    sim.erase_block(1, false)?;
    assert_eq!(sim.erase_count(1), 1);
    assert_eq!(sim.read_page(16, &mut out, &mut spare)?, PageState::Erased);
    sim.write_page(16, &page, &spare)?;

    sim.fail_erase(2);
    assert!(sim.erase_block(2, true).is_err());
    assert_eq!(sim.erase_count(2), 0);
    Ok(())
}

#[test]
fn test_sim_save_load() -> anyhow::Result<()> {
    let mut sim = SimVfl::new(TEST_LAYOUT);
    let page = vec![0x55u8; TEST_LAYOUT.bytes_per_page];
    sim.write_page(33, &page, &[1, 2, 3])?;
    sim.erase_block(5, false)?;
    sim.write_control_blocks([0, 1, 2])?;

    let mut image = Vec::new();
    sim.save(&mut image)?;
    let mut loaded = SimVfl::load(&mut &image[..])?;

    assert_eq!(loaded.layout(), TEST_LAYOUT);
    assert_eq!(loaded.control_blocks(), Some([0, 1, 2]));
    assert_eq!(loaded.erase_count(5), 1);

    let mut out = vec![0u8; TEST_LAYOUT.bytes_per_page];
    let mut spare = [0u8; 3];
    loaded.read_page(33, &mut out, &mut spare)?;
    assert_eq!(out, page);
    assert_eq!(spare, [1, 2, 3]);
    assert!(loaded.write_page(32, &page, &spare).is_err());
    Ok(())
}
