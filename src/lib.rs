//! # Booster
//!
//! Delta-transfer synchronization engine for container image
//! registries.
//!
//! Adjacent versions of an image layer share large runs of identical
//! bytes that gzip compression hides. Booster decompresses layers in a
//! recompressibility-preserving way, computes a block-indexed binary
//! delta over the uncompressed bytes, and re-gzips after patching —
//! moving only the differences between versions while leaving the
//! on-disk registry layout bit-identical to an ordinary push/pull.
//!
//! ## Example
//!
//! ```rust
//! use std::io::Cursor;
//! use booster::{create_delta, create_signature, Operation};
//!
//! let target = b"the quick brown fox jumps over the lazy dog";
//! let signature = create_signature(&mut Cursor::new(target)).unwrap();
//!
//! let mut ops: Vec<Operation> = Vec::new();
//! create_delta(&mut Cursor::new(target), &signature, |op| {
//!     ops.push(op);
//!     Ok(())
//! })
//! .unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
mod checksum;
mod container;
mod delta;
mod error;
mod fileset;
mod hash;
mod patch;
mod pool;
pub mod recompress;
mod signature;
mod stage;

pub use checksum::RollingChecksum;
pub use container::{AcceptListFilter, Container, FileEntry, FilterResult, KeepAll, PathFilter};
pub use delta::{create_delta, Operation, MAX_DATA_OP};
pub use error::{BoosterError, Result};
pub use fileset::{merge, minus, FileSet};
pub use hash::StrongHash;
pub use patch::{apply, create_patch, PATCH_MAGIC, PATCH_VERSION};
pub use pool::{copy_block_range, ContainerReader, FsPool, Pool, ReadSeek};
pub use signature::{create_signature, BlockHash, SignatureTable, BLOCK_SIZE};
pub use stage::StagingDir;
