//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Read to EOF, appending whole pages of `page_bytes` to `vec`. A short final page is padded
    /// with 0xFF, as if its tail had never been programmed. Returns the number of pages appended.
    fn read_pages(&mut self, vec: &mut Vec<u8>, page_bytes: usize) -> io::Result<u32>;
}

impl<T: Read> ReadExt for T {
    fn read_pages(&mut self, vec: &mut Vec<u8>, page_bytes: usize) -> io::Result<u32> {
        assert!(page_bytes > 0);

        let start = vec.len();
        let mut cursor = start;
        loop {
            // Always keep a page of room past the cursor
            vec.resize(cursor + page_bytes, 0xFF);

            cursor += match self.read(&mut vec[cursor..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }

        let pages = (cursor - start).div_ceil(page_bytes);
        vec.truncate(start + pages * page_bytes);
        vec[cursor..].fill(0xFF);
        Ok(pages as u32)
    }
}

#[test]
fn test_read_pages() -> io::Result<()> {
    let mut vec = Vec::new();
    assert_eq!(io::repeat(0xAA).take(8).read_pages(&mut vec, 4)?, 2);
    assert_eq!(vec, [0xAA; 8]);

    assert_eq!((&[1, 2, 3][..]).read_pages(&mut vec, 4)?, 1);
    assert_eq!(vec[8..], [1, 2, 3, 0xFF]);

    assert_eq!(io::empty().read_pages(&mut vec, 4)?, 0);
    assert_eq!(vec.len(), 12);
    Ok(())
}
