//! Drive the translation layer against a simulated flash image.
//!
//! The image is loaded (or created, given `--layout`), one command is run against it, and the
//! image is written back. With `--crash`, the final flush is skipped so that the next run has to
//! recover whatever was written since the last checkpoint.

use anyhow::{Context, Result};
use byte_unit::Byte;
use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use rand::prelude::*;
use simplelog::{ConfigBuilder, SimpleLogger};
use time::macros::format_description;

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use nand_ftl::{util::ReadExt, DenseL2v, Ftl, FtlConfig, NandLayout, SimVfl};

#[derive(Args, Debug)]
struct ImageOptions {
    /// Path to the flash image
    #[clap(long)]
    image: PathBuf,

    /// Create a new, erased image with this layout (BLOCKSxPAGESxBYTES[xBANKS])
    #[clap(long)]
    layout: Option<NandLayout>,

    /// Leave without flushing, as if power were cut
    #[clap(long)]
    crash: bool,

    /// Rebuild everything by scanning, ignoring any checkpoint
    #[clap(long)]
    force_restore: bool,

    /// Number of TOC pages to cache
    #[clap(long)]
    toc_caches: Option<usize>,
}

impl ImageOptions {
    fn open(&self) -> Result<SimVfl> {
        match self.layout {
            Some(layout) => Ok(SimVfl::new(layout)),
            None => {
                let mut file = File::open(&self.image).context("opening flash image")?;
                SimVfl::load(&mut file)
            }
        }
    }

    fn config(&self) -> FtlConfig {
        let defaults = FtlConfig::default();
        FtlConfig {
            force_restore: self.force_restore,
            toc_caches: self.toc_caches.unwrap_or(defaults.toc_caches),
            ..defaults
        }
    }

    fn save(&self, vfl: &SimVfl) -> Result<()> {
        vfl.save(&mut File::create(&self.image)?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the geometry and counters
    Info,

    /// Print the status and counters of every block
    Blocks,

    /// Write a file to consecutive logical pages; the last page is padded with 0xFF
    Write {
        #[clap(long)]
        lpn: u32,

        #[clap(long)]
        input: PathBuf,
    },

    /// Read consecutive logical pages, to a file or standard output
    Read {
        #[clap(long)]
        lpn: u32,

        #[clap(long, default_value_t = 1)]
        count: u32,

        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Write random pages at random logical addresses
    Fill {
        /// Number of pages to write
        #[clap(long)]
        pages: u32,

        /// Largest number of pages per request
        #[clap(long, default_value_t = 16)]
        max_run: u32,

        #[clap(long, default_value_t = 7)]
        seed: u64,
    },

    /// Write a checkpoint
    Flush,

    /// Rebuild everything by scanning the medium, then write a checkpoint
    Restore,
}

impl Command {
    fn execute(self, ftl: &mut Ftl<SimVfl, DenseL2v>) -> Result<()> {
        let page_bytes = ftl.geometry().bytes_per_page;

        match self {
            Command::Info => {
                let geometry = *ftl.geometry();
                let capacity = u64::from(geometry.total_pages) * page_bytes as u64;
                println!(
                    "Geometry:    {} blocks x {} pages x {} bytes, {} banks",
                    geometry.blocks, geometry.pages_per_block, geometry.bytes_per_page, geometry.banks
                );
                println!(
                    "Capacity:    {} pages, {}",
                    geometry.total_pages,
                    Byte::from(capacity).get_appropriate_unit(true)
                );
                println!("Opened from: {:?}", ftl.open_kind());
                println!("Control:     {:?}", ftl.control_blocks());
                println!("Mapped:      {} pages", ftl.l2v().mapped());
                println!("{:#?}", ftl.stats());
                for (status, count) in ftl.block_counts() {
                    println!("{:>12}: {count}", format!("{status:?}"));
                }
            }

            Command::Blocks => {
                for (block, entry) in ftl.blocks() {
                    println!(
                        "{block:5} {:>12} erases={:<6} reads={:<8} data={:<5} index={:<5}{}",
                        format!("{:?}", entry.status),
                        entry.erase_count,
                        entry.read_count,
                        entry.valid_data,
                        entry.valid_index,
                        if entry.needs_erase { " needs-erase" } else { "" }
                    );
                }
            }

            Command::Write { lpn, input } => {
                let mut data = Vec::new();
                let count = File::open(&input)
                    .context("opening input")?
                    .read_pages(&mut data, page_bytes)?;
                ftl.write(lpn, count, &data)?;
                info!(
                    "wrote {} to {count} pages at {lpn}",
                    Byte::from(data.len() as u64).get_appropriate_unit(true)
                );
            }

            Command::Read { lpn, count, output } => {
                let mut data = vec![0u8; count as usize * page_bytes];
                ftl.read(lpn, count, &mut data)?;
                match output {
                    Some(path) => File::create(path)?.write_all(&data)?,
                    None => io::stdout().write_all(&data)?,
                }
            }

            Command::Fill {
                pages,
                max_run,
                seed,
            } => {
                let mut rng = SmallRng::seed_from_u64(seed);
                let total = ftl.total_pages();
                let rpt = howudoin::new()
                    .label("Writing pages")
                    .set_len(u64::from(pages));

                let mut written = 0;
                let mut data = Vec::new();
                while written < pages {
                    let run = rng.gen_range(1..=max_run.max(1)).min(pages - written);
                    let lpn = rng.gen_range(0..=total - run);
                    data.resize(run as usize * page_bytes, 0);
                    rng.fill_bytes(&mut data);
                    ftl.write(lpn, run, &data)?;

                    written += run;
                    for _ in 0..run {
                        rpt.inc();
                    }
                }
                rpt.close();
                info!("{} pages mapped", ftl.l2v().mapped());
            }

            Command::Flush => ftl.flush()?,

            Command::Restore => {} // Handled when opening
        }

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    image: ImageOptions,

    /// Log more (repeat for even more)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();
    SimpleLogger::init(level, log_cfg)?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let vfl = args.image.open()?;
    let mut config = args.image.config();
    if matches!(args.cmd, Command::Restore) {
        config.force_restore = true;
    }

    let mut ftl = Ftl::open(vfl, DenseL2v::default(), config)?;
    args.cmd.execute(&mut ftl)?;

    if !args.image.crash {
        ftl.flush()?;
    }
    let (vfl, _) = ftl.into_parts();
    args.image.save(&vfl)
}
