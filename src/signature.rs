//! Signature generation and lookup for delta computation.
//!
//! The signature of a target stream is one [`BlockHash`] per
//! fixed-size block, carrying the weak rolling checksum for fast
//! candidate filtering and the strong hash for confirmation.

use std::io::{self, Read};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::checksum::RollingChecksum;
use crate::error::Result;
use crate::hash::StrongHash;

/// Fixed block size of the delta protocol.
pub const BLOCK_SIZE: usize = 1024 * 6;

/// Signature of a single target block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHash {
    /// Dense ascending block index, in target read order.
    pub index: u64,
    /// Weak rolling checksum of the block.
    pub weak: u32,
    /// Strong digest of the block.
    pub strong: StrongHash,
}

/// Read until the buffer is full or the stream ends. Returns the
/// number of bytes read; fewer than `buf.len()` means end of stream.
pub(crate) fn read_at_least<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match reader.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

/// Compute the signature of a target stream.
///
/// The stream is read in [`BLOCK_SIZE`] chunks; a final short chunk
/// produces one trailing short block. A stream of length `L` yields
/// `⌈L / BLOCK_SIZE⌉` block hashes.
///
/// # Errors
///
/// Returns an error if reading the target fails.
pub fn create_signature<R: Read>(target: &mut R) -> Result<Vec<BlockHash>> {
    let mut buffer = vec![0u8; BLOCK_SIZE];
    let mut result = Vec::new();
    let mut index: u64 = 0;

    loop {
        let n = read_at_least(target, &mut buffer)?;
        if n == 0 {
            return Ok(result);
        }
        let block = &buffer[..n];
        result.push(BlockHash {
            index,
            weak: RollingChecksum::from_block(block).digest(),
            strong: StrongHash::compute(block),
        });
        index += 1;
        if n < BLOCK_SIZE {
            // Trailing short block: end of stream.
            return Ok(result);
        }
    }
}

/// Weak-hash lookup table over a signature.
///
/// One weak hash may collect several blocks; candidates are confirmed
/// against the strong hash in bucket insertion order, first match
/// wins.
#[derive(Debug, Default)]
pub struct SignatureTable {
    buckets: FxHashMap<u32, Vec<BlockHash>>,
}

impl SignatureTable {
    /// Build the lookup table from a signature.
    #[must_use]
    pub fn new(signature: &[BlockHash]) -> Self {
        let mut buckets: FxHashMap<u32, Vec<BlockHash>> =
            FxHashMap::with_capacity_and_hasher(signature.len(), rustc_hash::FxBuildHasher);
        for block in signature {
            buckets.entry(block.weak).or_default().push(*block);
        }
        Self { buckets }
    }

    /// True if any block carries this weak hash.
    #[must_use]
    pub fn has_weak(&self, weak: u32) -> bool {
        self.buckets.contains_key(&weak)
    }

    /// Find the index of the first block in the `weak` bucket whose
    /// strong hash matches `strong`.
    #[must_use]
    pub fn find(&self, weak: u32, strong: &StrongHash) -> Option<u64> {
        self.buckets
            .get(&weak)?
            .iter()
            .find(|block| block.strong == *strong)
            .map(|block| block.index)
    }

    /// True if the table holds no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
