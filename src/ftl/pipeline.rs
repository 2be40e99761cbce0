//! Logical reads and writes.

use log::{debug, error, info, warn};

use super::{Ftl, Lookup, Stream, MAX_PROGRAM_RETRIES};
use crate::block::BlockStatus;
use crate::error::{ConsistencyError, FtlError, VflError};
use crate::geometry::UNMAPPED;
use crate::l2v::L2v;
use crate::spare::{PageKind, PageSpare, SPARE_BYTES};
use crate::vfl::Vfl;

/// Log fatal errors on their way out to the caller
fn report(result: Result<(), FtlError>) -> Result<(), FtlError> {
    if let Err(e) = &result {
        if e.is_fatal() {
            error!("{e}");
        }
    }
    result
}

impl<V: Vfl, L: L2v> Ftl<V, L> {
    /// Read `count` logical pages starting at `lpn` into `buf`. Pages that were never written read
    /// back as all ones.
    pub fn read(&mut self, lpn: u32, count: u32, buf: &mut [u8]) -> Result<(), FtlError> {
        report(self.read_request(lpn, count, buf))
    }

    /// Write `count` logical pages starting at `lpn` from `buf`
    pub fn write(&mut self, lpn: u32, count: u32, buf: &[u8]) -> Result<(), FtlError> {
        report(self.write_request(lpn, count, buf))
    }

    fn read_request(&mut self, lpn: u32, count: u32, buf: &mut [u8]) -> Result<(), FtlError> {
        self.check_request(lpn, count, buf.len())?;

        let page_bytes = self.geometry.bytes_per_page;
        let mut done = 0;
        while done < count {
            let first = lpn + done;
            let span = done as usize * page_bytes;

            let Lookup::Mapped(base) = self.lookup(first)? else {
                buf[span..span + page_bytes].fill(0xFF);
                done += 1;
                continue;
            };

            // Gather a run of physically consecutive pages within one block
            let block = self.geometry.block_of(base);
            let room = self.geometry.usable_pages() - self.geometry.offset_of(base);
            let mut run = 1;
            while run < room && done + run < count {
                match self.lookup(first + run)? {
                    Lookup::Mapped(page) if page == base + run => run += 1,
                    _ => break,
                }
            }

            let mut spares = vec![0u8; run as usize * SPARE_BYTES];
            let data = &mut buf[span..span + run as usize * page_bytes];
            self.vfl.read_pages(base, run, data, &mut spares)?;

            for (i, spare) in (0u32..).zip(spares.chunks_exact(SPARE_BYTES)) {
                let page = base + i;
                let expected = first + i;
                match PageSpare::decode(spare) {
                    Some(x) if x.kind() == PageKind::User && x.lpn == expected => {}
                    Some(x) if x.kind() == PageKind::User => {
                        return Err(ConsistencyError::LpnMismatch {
                            page,
                            expected,
                            found: x.lpn,
                        }
                        .into())
                    }
                    _ => return Err(ConsistencyError::WrongPageType(page).into()),
                }
                self.note_read(block);
            }

            done += run;
        }

        self.stats.reads += 1;
        self.stats.pages_read += u64::from(count);

        self.refresh_worn()?;
        self.maybe_flush()
    }

    fn write_request(&mut self, lpn: u32, count: u32, buf: &[u8]) -> Result<(), FtlError> {
        self.check_request(lpn, count, buf.len())?;
        if count == 0 {
            return Ok(());
        }

        self.mark_dirty()?;
        self.invalidate(lpn, count)?;

        let page_bytes = self.geometry.bytes_per_page;
        let mut done = 0;
        let mut failures = 0;

        // Block being filled by this request, and the first page of the request it took
        let mut attempt: Option<(u32, u32)> = None;

        while done < count {
            self.ensure_user_block(Some(count - done))?;
            let Some(open) = self.user.as_ref() else {
                return Err(FtlError::Capacity);
            };

            if attempt.map(|(block, _)| block) != Some(open.block) {
                attempt = Some((open.block, done));
            }

            let batch = open.reserve(&self.geometry, count - done, self.config.write_pages_per_bank);
            let base = open.next_page(&self.geometry);
            let usn = open.usn;

            let mut programmed = 0;
            let mut outcome = Ok(());
            let data = &buf[done as usize * page_bytes..(done + batch) as usize * page_bytes];
            for chunk in data.chunks_exact(page_bytes) {
                let spare = PageSpare::user(lpn + done + programmed, usn);
                if let Err(e) = self.program(base + programmed, chunk, spare) {
                    outcome = Err(e);
                    break;
                }
                programmed += 1;
            }

            self.commit_user_pages(lpn + done, base, programmed)?;
            done += programmed;

            match outcome {
                Ok(()) => {}
                Err(FtlError::Media(VflError::ProgramFailed(page))) => {
                    failures += 1;
                    if failures > MAX_PROGRAM_RETRIES {
                        return Err(VflError::ProgramFailed(page).into());
                    }

                    // Everything this request put into the failed block is written again
                    let start = attempt.map_or(done, |(_, start)| start);
                    let block = self.abandon_block(Stream::User);
                    warn!(
                        "program of page {page} failed; rewriting {} pages outside block {block:?}",
                        done - start
                    );
                    self.invalidate(lpn + start, done - start)?;
                    done = start;
                    attempt = None;
                }
                Err(e) => return Err(e),
            }
        }

        self.stats.writes += 1;
        self.stats.pages_written += u64::from(count);

        self.maybe_flush()
    }

    fn check_request(&self, lpn: u32, count: u32, len: usize) -> Result<(), FtlError> {
        let total = self.geometry.total_pages;
        match lpn.checked_add(count) {
            Some(end) if end <= total => {}
            _ => return Err(FtlError::OutOfRange { lpn, count, total }),
        }

        let need = count as usize * self.geometry.bytes_per_page;
        if len < need {
            return Err(FtlError::BufferSize { have: len, need });
        }
        Ok(())
    }

    /// Install mappings for `count` pages just programmed at `base` in the open user block
    fn commit_user_pages(&mut self, lpn: u32, base: u32, count: u32) -> Result<(), FtlError> {
        for i in 0..count {
            if let Some(open) = self.user.as_mut() {
                open.append(&self.geometry, lpn + i);
            }
            if self.set_entry(lpn + i, base + i)? != UNMAPPED {
                return Err(ConsistencyError::DoubleMapping(lpn + i).into());
            }
        }

        if count > 0 {
            self.blocks
                .add_valid_data(self.geometry.block_of(base), count);
            self.l2v.update(lpn, count, Some(base));
        }
        Ok(())
    }

    /// Drop the mappings of `count` logical pages starting at `lpn`. Pages that are not mapped are
    /// left alone.
    pub(super) fn invalidate(&mut self, lpn: u32, count: u32) -> Result<(), FtlError> {
        let end = lpn + count;
        let mut cursor = lpn;

        while cursor < end {
            let (group, index) = self.geometry.group_of(cursor);
            let n = (self.geometry.toc_entries_per_page - index as u32).min(end - cursor);

            let mut mapped = false;
            for l in cursor..cursor + n {
                if matches!(self.lookup(l)?, Lookup::Mapped(_)) {
                    mapped = true;
                    break;
                }
            }

            if mapped {
                let slot = self.acquire_for_write(group)?;
                for i in index..index + n as usize {
                    let old = std::mem::replace(&mut self.toc.slot_mut(slot).entries[i], UNMAPPED);
                    if old != UNMAPPED {
                        self.blocks
                            .remove_valid_data(self.geometry.block_of(old), 1)?;
                    }
                }
                self.l2v.update(cursor, n, None);
            }

            cursor += n;
        }

        Ok(())
    }

    /// Rewrite every block whose read count crossed the refresh threshold
    fn refresh_worn(&mut self) -> Result<(), FtlError> {
        if self.refresh.is_empty() {
            return Ok(());
        }
        self.mark_dirty()?;

        for block in std::mem::take(&mut self.refresh) {
            let entry = *self.blocks.get(block);
            match entry.status {
                BlockStatus::Allocated => {
                    self.request_free_pages(entry.valid_data)?;
                    // Garbage collection may have picked this very block
                    if self.blocks.status(block) != BlockStatus::Allocated {
                        continue;
                    }
                    self.reclaim_data_block(Some(block), true)?;
                }
                BlockStatus::IAllocated => {
                    self.reclaim_index_block(Some(block), true)?;
                }
                status => {
                    debug!("not refreshing block {block} while it is {status:?}");
                    continue;
                }
            }

            info!("refreshed block {block} after {} reads", entry.read_count);
            self.stats.blocks_refreshed += 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::FtlConfig;
    use crate::error::FtlError;
    use crate::ftl::Ftl;
    use crate::l2v::NullL2v;
    use crate::vfl::{NandLayout, SimVfl};

    const LAYOUT: NandLayout = NandLayout {
        blocks: 32,
        pages_per_block: 32,
        bytes_per_page: 512,
        banks: 2,
    };

    fn pattern(lpn: u32, count: u32, seed: u8) -> Vec<u8> {
        (0..count * 512)
            .map(|i| (lpn + i / 512) as u8 ^ seed ^ (i as u8))
            .collect()
    }

    #[test]
    fn test_request_checks() -> Result<(), FtlError> {
        let mut ftl = Ftl::open(SimVfl::new(LAYOUT), NullL2v, FtlConfig::default())?;
        let total = ftl.total_pages();
        let mut buf = vec![0; 1024];

        assert!(matches!(
            ftl.read(total - 1, 2, &mut buf),
            Err(FtlError::OutOfRange { .. })
        ));
        assert!(matches!(
            ftl.write(u32::MAX, 2, &buf),
            Err(FtlError::OutOfRange { .. })
        ));
        assert!(matches!(
            ftl.write(0, 3, &buf),
            Err(FtlError::BufferSize {
                have: 1024,
                need: 1536
            })
        ));

        // Nothing was written yet
        ftl.read(total - 2, 2, &mut buf)?;
        assert!(buf.iter().all(|&x| x == 0xFF));
        assert_eq!(ftl.stats().data_pages, 0);
        Ok(())
    }

    #[test]
    fn test_overwrite_within_block() -> Result<(), FtlError> {
        let mut ftl = Ftl::open(SimVfl::new(LAYOUT), NullL2v, FtlConfig::default())?;
        ftl.write(10, 5, &pattern(10, 5, 1))?;
        ftl.write(12, 2, &pattern(12, 2, 2))?;

        let mut buf = vec![0; 5 * 512];
        ftl.read(10, 5, &mut buf)?;
        assert_eq!(&buf[..1024], &pattern(10, 2, 1)[..]);
        assert_eq!(&buf[1024..2048], &pattern(12, 2, 2)[..]);
        assert_eq!(&buf[2048..], &pattern(14, 1, 1)[..]);
        assert_eq!(ftl.stats().data_pages, 5);

        // Rewriting the same range again must not underflow anything
        ftl.write(12, 2, &pattern(12, 2, 3))?;
        ftl.invalidate(100, 20)?;
        assert_eq!(ftl.stats().data_pages, 5);
        Ok(())
    }

    #[test]
    fn test_write_spans_blocks() -> Result<(), FtlError> {
        let mut ftl = Ftl::open(SimVfl::new(LAYOUT), NullL2v, FtlConfig::default())?;
        let data = pattern(0, 70, 9);
        ftl.write(0, 70, &data)?;

        let mut buf = vec![0; data.len()];
        ftl.read(0, 70, &mut buf)?;
        assert_eq!(buf, data);

        let first = ftl.mapping(0)?.unwrap();
        let last = ftl.mapping(69)?.unwrap();
        assert_ne!(
            ftl.geometry().block_of(first),
            ftl.geometry().block_of(last)
        );
        Ok(())
    }
}
