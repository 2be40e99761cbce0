//! A flash translation layer: a dense logical page space on top of raw NAND, which can only be
//! programmed sequentially within a block and erased a whole block at a time.
//!
//! The entry point is [`Ftl`], which sits on a [`Vfl`] (the raw flash) and feeds an optional
//! [`L2v`] index. [`SimVfl`] is an in-memory flash for tests and simulation.

pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod ftl;
pub mod geometry;
pub mod l2v;
pub mod open_block;
pub mod spare;
pub mod stats;
pub mod toc;
pub mod util;
pub mod vfl;

pub use block::{BlockEntry, BlockStatus};
pub use config::FtlConfig;
pub use error::{CheckpointError, ConsistencyError, FtlError, VflError};
pub use ftl::{Ftl, OpenKind};
pub use geometry::Geometry;
pub use l2v::{DenseL2v, L2v, NullL2v};
pub use stats::FtlStats;
pub use vfl::{NandLayout, SimVfl, Vfl};
