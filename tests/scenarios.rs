use std::collections::HashSet;

use rand::prelude::*;

use nand_ftl::{
    BlockStatus, DenseL2v, Ftl, FtlConfig, FtlError, NandLayout, NullL2v, OpenKind, SimVfl, Vfl,
};

const LARGE: NandLayout = NandLayout {
    blocks: 100,
    pages_per_block: 64,
    bytes_per_page: 2048,
    banks: 1,
};

const SMALL: NandLayout = NandLayout {
    blocks: 32,
    pages_per_block: 32,
    bytes_per_page: 512,
    banks: 1,
};

fn open(vfl: SimVfl, config: FtlConfig) -> Ftl<SimVfl> {
    Ftl::open(vfl, NullL2v, config).unwrap()
}

/// Page contents that differ per logical page and per generation
fn pattern(lpn: u32, count: u32, generation: u8, page_bytes: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(count as usize * page_bytes);
    for lpn in lpn..lpn + count {
        let seed = lpn.to_le_bytes();
        for i in 0..page_bytes {
            data.push(seed[i % 4] ^ generation ^ (i / 4) as u8);
        }
    }
    data
}

fn read_all<V: Vfl, L: nand_ftl::L2v>(ftl: &mut Ftl<V, L>, lpn: u32, count: u32) -> Vec<u8> {
    let mut data = vec![0; count as usize * ftl.geometry().bytes_per_page];
    ftl.read(lpn, count, &mut data).unwrap();
    data
}

/// Random writes over `span` logical pages, remembering what each page should contain
fn random_workload<V: Vfl, L: nand_ftl::L2v>(
    ftl: &mut Ftl<V, L>,
    rng: &mut SmallRng,
    model: &mut [Option<Vec<u8>>],
    requests: u32,
    max_run: u32,
) {
    let page_bytes = ftl.geometry().bytes_per_page;
    let span = model.len() as u32;
    for _ in 0..requests {
        let run = rng.gen_range(1..=max_run);
        let lpn = rng.gen_range(0..=span - run);
        let mut data = vec![0u8; run as usize * page_bytes];
        rng.fill_bytes(&mut data);
        ftl.write(lpn, run, &data).unwrap();

        for (i, page) in data.chunks(page_bytes).enumerate() {
            model[lpn as usize + i] = Some(page.to_vec());
        }
    }
}

fn check_model<V: Vfl, L: nand_ftl::L2v>(ftl: &mut Ftl<V, L>, model: &[Option<Vec<u8>>]) {
    let page_bytes = ftl.geometry().bytes_per_page;
    for (lpn, expected) in (0u32..).zip(model) {
        let data = read_all(ftl, lpn, 1);
        match expected {
            Some(expected) => assert_eq!(&data, expected, "logical page {lpn}"),
            None => assert_eq!(data, vec![0xFF; page_bytes], "logical page {lpn}"),
        }
    }
}

/// Every mapped logical page has its own physical page, and the live counts agree
fn check_mappings<V: Vfl, L: nand_ftl::L2v>(ftl: &mut Ftl<V, L>) {
    let mut physical = HashSet::new();
    for lpn in 0..ftl.total_pages() {
        if let Some(page) = ftl.mapping(lpn).unwrap() {
            assert!(physical.insert(page), "page {page} mapped twice");
        }
    }
    assert_eq!(ftl.stats().data_pages, physical.len() as u64);
}

fn block_with_status<V: Vfl, L: nand_ftl::L2v>(ftl: &Ftl<V, L>, status: BlockStatus) -> u32 {
    ftl.blocks()
        .find(|(_, x)| x.status == status)
        .map(|(b, _)| b)
        .unwrap()
}

#[test]
fn test_round_trip() {
    let mut ftl = open(SimVfl::new(LARGE), FtlConfig::default());
    assert_eq!(ftl.open_kind(), OpenKind::Restored);

    let data = pattern(10, 4, 1, 2048);
    ftl.write(10, 4, &data).unwrap();
    assert_eq!(read_all(&mut ftl, 10, 4), data);

    // Never-written pages read as erased
    assert_eq!(read_all(&mut ftl, 9, 1), vec![0xFF; 2048]);
    assert_eq!(read_all(&mut ftl, 4000, 1), vec![0xFF; 2048]);
    assert_eq!(ftl.mapping(4000).unwrap(), None);
}

#[test]
fn test_superseded_block_becomes_reclaimable() {
    let mut ftl = open(SimVfl::new(LARGE), FtlConfig::default());

    let a = pattern(0, 64, 0xA0, 2048);
    ftl.write(0, 64, &a).unwrap();
    let page = ftl.mapping(0).unwrap().unwrap();
    let first = ftl.geometry().block_of(page);

    let b = pattern(0, 64, 0xB0, 2048);
    ftl.write(0, 64, &b).unwrap();
    assert_eq!(read_all(&mut ftl, 0, 64), b);

    let entry = ftl.block(first);
    assert_eq!(entry.valid_data, 0);
    assert!(matches!(
        entry.status,
        BlockStatus::Allocated | BlockStatus::Free
    ));
    assert_eq!(ftl.stats().data_pages, 64);
}

#[test]
fn test_rewrites_keep_one_mapping() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());

    for generation in 0..3 {
        ftl.write(5, 20, &pattern(5, 20, generation, 512)).unwrap();
        assert_eq!(ftl.stats().data_pages, 20);
    }
    assert_eq!(read_all(&mut ftl, 5, 20), pattern(5, 20, 2, 512));
    check_mappings(&mut ftl);
}

#[test]
fn test_random_writes_with_gc() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    let mut rng = SmallRng::seed_from_u64(1);
    let mut model = vec![None; 400];

    random_workload(&mut ftl, &mut rng, &mut model, 400, 8);
    assert!(ftl.stats().gc_relocations > 0 || ftl.stats().erases > 3);

    check_mappings(&mut ftl);
    check_model(&mut ftl, &model);
}

#[test]
fn test_out_of_range() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    let total = ftl.total_pages();

    let err = ftl.write(total - 1, 2, &[0; 1024]).unwrap_err();
    assert!(matches!(err, FtlError::OutOfRange { .. }));
    let err = ftl.read(total, 1, &mut [0; 512]).unwrap_err();
    assert!(matches!(err, FtlError::OutOfRange { .. }));
    assert!(ftl.mapping(total).is_err());

    // The last page is still fine
    ftl.write(total - 1, 1, &[0x5A; 512]).unwrap();
    assert_eq!(read_all(&mut ftl, total - 1, 1), vec![0x5A; 512]);
}

#[test]
fn test_checkpoint_reopen() -> Result<(), FtlError> {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    let mut rng = SmallRng::seed_from_u64(2);
    let mut model = vec![None; 300];
    random_workload(&mut ftl, &mut rng, &mut model, 60, 8);
    ftl.flush()?;
    assert!(!ftl.is_dirty());

    let mappings: Vec<_> = (0..300).map(|x| ftl.mapping(x)).collect::<Result<_, _>>()?;
    let restores = ftl.stats().restores;
    let (vfl, _) = ftl.into_parts();

    let mut ftl = open(vfl, FtlConfig::default());
    assert_eq!(ftl.open_kind(), OpenKind::Checkpoint);
    assert_eq!(ftl.stats().restores, restores);
    for (lpn, mapping) in (0u32..).zip(mappings) {
        assert_eq!(ftl.mapping(lpn)?, mapping);
    }
    check_model(&mut ftl, &model);

    // Carry on from the checkpoint and do it again
    random_workload(&mut ftl, &mut rng, &mut model, 60, 8);
    ftl.flush()?;
    let (vfl, _) = ftl.into_parts();

    let mut ftl = open(vfl, FtlConfig::default());
    assert_eq!(ftl.open_kind(), OpenKind::Checkpoint);
    check_mappings(&mut ftl);
    check_model(&mut ftl, &model);
    Ok(())
}

#[test]
fn test_reads_leave_checkpoint_fresh() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    ftl.write(0, 8, &pattern(0, 8, 1, 512)).unwrap();
    ftl.flush().unwrap();

    read_all(&mut ftl, 0, 8);
    assert!(!ftl.is_dirty());
    let (vfl, _) = ftl.into_parts();

    let mut ftl = open(vfl, FtlConfig::default());
    assert_eq!(ftl.open_kind(), OpenKind::Checkpoint);
    assert_eq!(read_all(&mut ftl, 0, 8), pattern(0, 8, 1, 512));
}

#[test]
fn test_crash_recovery() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    let mut rng = SmallRng::seed_from_u64(3);
    let mut model = vec![None; 400];

    random_workload(&mut ftl, &mut rng, &mut model, 80, 8);
    ftl.flush().unwrap();

    // These land after the checkpoint, some in a block that is never closed
    random_workload(&mut ftl, &mut rng, &mut model, 40, 8);
    assert!(ftl.is_dirty());
    let (vfl, _) = ftl.into_parts();

    let mut ftl = open(vfl, FtlConfig::default());
    assert_eq!(ftl.open_kind(), OpenKind::Restored);
    assert!(!ftl.is_dirty());
    check_mappings(&mut ftl);
    check_model(&mut ftl, &model);

    // The restored state is itself checkpointed
    let (vfl, _) = ftl.into_parts();
    let mut ftl = open(vfl, FtlConfig::default());
    assert_eq!(ftl.open_kind(), OpenKind::Checkpoint);
    check_model(&mut ftl, &model);
}

#[test]
fn test_crash_before_first_flush() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    let data = pattern(100, 50, 7, 512);
    ftl.write(100, 50, &data).unwrap();
    let (vfl, _) = ftl.into_parts();

    let mut ftl = open(vfl, FtlConfig::default());
    assert_eq!(ftl.open_kind(), OpenKind::Restored);
    assert_eq!(read_all(&mut ftl, 100, 50), data);
    assert_eq!(ftl.stats().data_pages, 50);
}

#[test]
fn test_restore_continues_open_blocks() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    ftl.write(0, 10, &pattern(0, 10, 1, 512)).unwrap();
    ftl.flush().unwrap();
    let index = block_with_status(&ftl, BlockStatus::ICurrent);

    ftl.write(50, 5, &pattern(50, 5, 1, 512)).unwrap();
    let last = ftl.mapping(54).unwrap().unwrap();
    let user = ftl.geometry().block_of(last);
    let (vfl, _) = ftl.into_parts();

    // Neither open block is moved out; both carry on where they stopped
    let mut ftl = open(vfl, FtlConfig::default());
    assert_eq!(ftl.open_kind(), OpenKind::Restored);
    assert_eq!(ftl.block(user).status, BlockStatus::Current);
    assert_eq!(ftl.block(index).status, BlockStatus::ICurrent);
    assert_eq!(ftl.block(user).valid_data, 15);

    ftl.write(60, 1, &pattern(60, 1, 1, 512)).unwrap();
    assert_eq!(ftl.mapping(60).unwrap(), Some(last + 1));
    assert_eq!(read_all(&mut ftl, 0, 10), pattern(0, 10, 1, 512));
    assert_eq!(read_all(&mut ftl, 50, 5), pattern(50, 5, 1, 512));
    check_mappings(&mut ftl);
}

#[test]
fn test_repeated_crashes_on_busy_device() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    let mut rng = SmallRng::seed_from_u64(8);
    let span = ftl.total_pages() * 2 / 3;
    let mut model = vec![None; span as usize];

    for lpn in (0..span).step_by(16) {
        let count = 16u32.min(span - lpn);
        let data = pattern(lpn, count, 0, 512);
        ftl.write(lpn, count, &data).unwrap();
        for (i, page) in data.chunks(512).enumerate() {
            model[lpn as usize + i] = Some(page.to_vec());
        }
    }

    for cycle in 0..25 {
        random_workload(&mut ftl, &mut rng, &mut model, 17, 16);
        let dirty = ftl.is_dirty();
        let (vfl, _) = ftl.into_parts();

        ftl = open(vfl, FtlConfig::default());
        let restored = ftl.open_kind() == OpenKind::Restored;
        assert_eq!(restored, dirty, "cycle {cycle}");
        assert!(ftl.block_counts().contains(&(BlockStatus::Current, 1)), "cycle {cycle}");
        check_mappings(&mut ftl);
        check_model(&mut ftl, &model);
    }
    assert!(ftl.stats().restores > 1);
}

#[test]
fn test_refresh_threshold_must_fit_checkpoint() {
    let config = FtlConfig {
        refresh_threshold: 70_000,
        ..FtlConfig::default()
    };
    let result = Ftl::open(SimVfl::new(SMALL), NullL2v, config);
    assert!(matches!(result, Err(FtlError::Config(_))));

    let config = FtlConfig {
        refresh_threshold: 65_534,
        ..FtlConfig::default()
    };
    assert!(Ftl::open(SimVfl::new(SMALL), NullL2v, config).is_ok());
}

#[test]
fn test_forced_restore() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    let mut rng = SmallRng::seed_from_u64(4);
    let mut model = vec![None; 300];
    random_workload(&mut ftl, &mut rng, &mut model, 50, 8);
    ftl.flush().unwrap();
    let restores = ftl.stats().restores;
    let (vfl, _) = ftl.into_parts();

    let config = FtlConfig {
        force_restore: true,
        ..FtlConfig::default()
    };
    let mut ftl = open(vfl, config);
    assert_eq!(ftl.open_kind(), OpenKind::Restored);
    assert_eq!(ftl.stats().restores, restores + 1);
    check_mappings(&mut ftl);
    check_model(&mut ftl, &model);
}

#[test]
fn test_restore_without_reverse_index() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    let data = pattern(0, 31, 9, 512);
    ftl.write(0, 31, &data).unwrap();
    ftl.write(200, 1, &pattern(200, 1, 9, 512)).unwrap();
    let page = ftl.mapping(0).unwrap().unwrap();
    let block = ftl.geometry().block_of(page);
    assert_eq!(ftl.block(block).status, BlockStatus::Allocated);
    let btoc = ftl.geometry().page_of(block, 31);

    let (mut vfl, _) = ftl.into_parts();
    vfl.fail_read(btoc);

    // The block is scanned page by page instead, and moved out of
    let mut ftl = open(vfl, FtlConfig::default());
    assert_eq!(ftl.open_kind(), OpenKind::Restored);
    assert_eq!(read_all(&mut ftl, 0, 31), data);
    assert_eq!(read_all(&mut ftl, 200, 1), pattern(200, 1, 9, 512));
    assert_eq!(ftl.block(block).status, BlockStatus::Free);
    check_mappings(&mut ftl);
}

#[test]
fn test_restore_in_several_passes() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    let mut rng = SmallRng::seed_from_u64(5);
    let mut model = vec![None; 600];
    random_workload(&mut ftl, &mut rng, &mut model, 120, 6);
    let (vfl, _) = ftl.into_parts();

    // One TOC page worth of scratch at a time
    let config = FtlConfig {
        restore_scratch_entries: 128,
        ..FtlConfig::default()
    };
    let mut ftl = open(vfl, config);
    assert_eq!(ftl.open_kind(), OpenKind::Restored);
    check_mappings(&mut ftl);
    check_model(&mut ftl, &model);
}

#[test]
fn test_wear_accounting() {
    let mut ftl = open(SimVfl::new(SMALL), FtlConfig::default());
    let mut rng = SmallRng::seed_from_u64(6);
    let mut model = vec![None; 400];

    random_workload(&mut ftl, &mut rng, &mut model, 200, 8);
    ftl.flush().unwrap();

    let before: Vec<u32> = ftl.blocks().map(|(_, x)| x.erase_count).collect();
    for (block, entry) in ftl.blocks() {
        assert_eq!(entry.erase_count, ftl.vfl().erase_count(block), "block {block}");
    }
    let (vfl, _) = ftl.into_parts();

    let mut ftl = open(vfl, FtlConfig::default());
    assert_eq!(ftl.open_kind(), OpenKind::Checkpoint);
    random_workload(&mut ftl, &mut rng, &mut model, 200, 8);
    ftl.flush().unwrap();

    for (block, entry) in ftl.blocks() {
        assert_eq!(entry.erase_count, ftl.vfl().erase_count(block), "block {block}");
        assert!(entry.erase_count >= before[block as usize]);
    }
    assert!(ftl.stats().erases > 0);
}

#[test]
fn test_program_failure() {
    let mut ftl = open(SimVfl::new(LARGE), FtlConfig::default());
    ftl.write(0, 1, &pattern(0, 1, 1, 2048)).unwrap();
    let first = ftl.mapping(0).unwrap().unwrap();
    let block = ftl.geometry().block_of(first);
    ftl.flush().unwrap();

    let (mut vfl, l2v) = ftl.into_parts();
    vfl.fail_program(first + 1);
    let mut ftl = Ftl::open(vfl, l2v, FtlConfig::default()).unwrap();
    assert_eq!(ftl.open_kind(), OpenKind::Checkpoint);

    let data = pattern(1, 5, 1, 2048);
    ftl.write(1, 5, &data).unwrap();
    assert_eq!(read_all(&mut ftl, 0, 6), pattern(0, 6, 1, 2048));

    // The failed block gave up its one live page and was scrubbed
    assert_eq!(ftl.block(block).status, BlockStatus::Free);
    assert_eq!(ftl.block(block).valid_data, 0);
    assert_ne!(ftl.mapping(0).unwrap(), Some(first));
    check_mappings(&mut ftl);
}

#[test]
fn test_read_disturb_refresh() {
    let config = FtlConfig {
        refresh_threshold: 20,
        ..FtlConfig::default()
    };
    let mut ftl = open(SimVfl::new(SMALL), config);

    let data = pattern(0, 31, 3, 512);
    ftl.write(0, 31, &data).unwrap();
    let page = ftl.mapping(0).unwrap().unwrap();
    let block = ftl.geometry().block_of(page);
    // Close the first block by starting the next one
    ftl.write(100, 1, &pattern(100, 1, 3, 512)).unwrap();
    assert_eq!(ftl.block(block).status, BlockStatus::Allocated);

    for _ in 0..10 {
        assert_eq!(read_all(&mut ftl, 0, 4), data[..4 * 512]);
    }

    assert_eq!(ftl.stats().blocks_refreshed, 1);
    assert_eq!(ftl.block(block).status, BlockStatus::Free);
    assert_eq!(ftl.block(block).read_count, 0);
    let page = ftl.mapping(0).unwrap().unwrap();
    assert_ne!(ftl.geometry().block_of(page), block);
    assert_eq!(read_all(&mut ftl, 0, 31), data);
}

#[test]
fn test_control_block_rotation_and_replacement() {
    let config = FtlConfig {
        ctrl_replace_interval: 4,
        ctrl_replace_margin: 0,
        ..FtlConfig::default()
    };
    let mut ftl = open(SimVfl::new(SMALL), config.clone());
    let original = ftl.control_blocks();

    let mut model = vec![None; 100];
    for generation in 0..12u8 {
        let lpn = u32::from(generation) * 8;
        let data = pattern(lpn, 8, generation, 512);
        ftl.write(lpn, 8, &data).unwrap();
        for (i, page) in data.chunks(512).enumerate() {
            model[lpn as usize + i] = Some(page.to_vec());
        }
        ftl.flush().unwrap();
    }

    let current = ftl.control_blocks();
    assert_ne!(current, original);
    assert_eq!(ftl.vfl().control_blocks(), Some(current));
    for block in current {
        assert!(ftl.block(block).status.is_control());
    }
    for block in original {
        if !current.contains(&block) {
            assert!(!ftl.block(block).status.is_control());
        }
    }

    let (vfl, _) = ftl.into_parts();
    let mut ftl = open(vfl, config);
    assert_eq!(ftl.open_kind(), OpenKind::Checkpoint);
    assert_eq!(ftl.control_blocks(), current);
    check_model(&mut ftl, &model);
}

#[test]
fn test_dense_l2v_tracks_mappings() {
    let mut ftl = Ftl::open(SimVfl::new(SMALL), DenseL2v::default(), FtlConfig::default()).unwrap();
    let mut rng = SmallRng::seed_from_u64(7);
    let mut model = vec![None; 400];
    random_workload(&mut ftl, &mut rng, &mut model, 300, 8);

    for lpn in 0..ftl.total_pages() {
        assert_eq!(ftl.l2v().lookup(lpn), ftl.mapping(lpn).unwrap(), "lpn {lpn}");
    }
    ftl.flush().unwrap();
    let (vfl, _) = ftl.into_parts();

    // A fresh index is rebuilt from the checkpointed TOC
    let mut ftl = Ftl::open(vfl, DenseL2v::default(), FtlConfig::default()).unwrap();
    assert_eq!(ftl.open_kind(), OpenKind::Checkpoint);
    for lpn in 0..ftl.total_pages() {
        assert_eq!(ftl.l2v().lookup(lpn), ftl.mapping(lpn).unwrap(), "lpn {lpn}");
    }
    assert_eq!(
        ftl.l2v().mapped() as u64,
        ftl.stats().data_pages
    );
    check_model(&mut ftl, &model);
}
