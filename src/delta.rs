//! Delta computation: the instruction stream transforming a target
//! into a source.
//!
//! [`create_delta`] scans the source through a ring buffer one byte at
//! a time, looking up each window's weak hash in the target signature
//! and confirming candidates with the strong hash. Matches become
//! block-copy instructions, everything else queues up as literal data.
//! Adjacent block copies are coalesced into ranges before emission.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::checksum::RollingChecksum;
use crate::error::Result;
use crate::hash::StrongHash;
use crate::signature::{read_at_least, BlockHash, SignatureTable, BLOCK_SIZE};

/// Largest literal instruction emitted; longer runs are split.
pub const MAX_DATA_OP: usize = BLOCK_SIZE * 10;

/// One instruction of a delta stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Emit these bytes verbatim.
    Literal(Vec<u8>),
    /// Copy the target block at this index.
    Block(u64),
    /// Copy consecutive target blocks `start..=end` (end inclusive).
    BlockRange {
        /// First block to copy.
        start: u64,
        /// Last block to copy.
        end: u64,
    },
    /// Reserved instruction kind; not emitted by the encoder.
    Hash(StrongHash),
}

impl Operation {
    /// True for the literal variant.
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// The block span this instruction copies, if it copies one.
    #[must_use]
    pub const fn copied_blocks(&self) -> Option<(u64, u64)> {
        match self {
            Self::Block(idx) => Some((*idx, *idx)),
            Self::BlockRange { start, end } => Some((*start, *end)),
            Self::Literal(_) | Self::Hash(_) => None,
        }
    }
}

/// Coalesces adjacent block copies before handing instructions to the
/// sink. At most one non-literal instruction is buffered; a literal
/// flushes it unconditionally.
struct Coalescer<'a, F: FnMut(Operation) -> Result<()>> {
    sink: &'a mut F,
    pending: Option<Operation>,
}

impl<'a, F: FnMut(Operation) -> Result<()>> Coalescer<'a, F> {
    fn new(sink: &'a mut F) -> Self {
        Self {
            sink,
            pending: None,
        }
    }

    fn block(&mut self, index: u64) -> Result<()> {
        match self.pending.take() {
            Some(Operation::Block(prev)) if prev + 1 == index => {
                self.pending = Some(Operation::BlockRange {
                    start: prev,
                    end: index,
                });
            }
            Some(Operation::BlockRange { start, end }) if end + 1 == index => {
                self.pending = Some(Operation::BlockRange { start, end: index });
            }
            Some(op) => {
                (self.sink)(op)?;
                self.pending = Some(Operation::Block(index));
            }
            None => self.pending = Some(Operation::Block(index)),
        }
        Ok(())
    }

    fn literal(&mut self, data: &[u8]) -> Result<()> {
        if let Some(op) = self.pending.take() {
            (self.sink)(op)?;
        }
        (self.sink)(Operation::Literal(data.to_vec()))
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(op) = self.pending.take() {
            (self.sink)(op)?;
        }
        Ok(())
    }
}

/// Compute the delta turning the signed target into `source`.
///
/// Instructions are passed to `sink` in source-stream order; a
/// consumer replaying them sequentially reproduces the source bytes
/// exactly. The final short window of the source is never matched
/// against the signature; it is flushed as literal data.
///
/// # Errors
///
/// Propagates I/O errors from `source` and errors returned by `sink`.
pub fn create_delta<R, F>(source: &mut R, signature: &[BlockHash], mut sink: F) -> Result<()>
where
    R: Read,
    F: FnMut(Operation) -> Result<()>,
{
    let table = SignatureTable::new(signature);
    let mut emit = Coalescer::new(&mut sink);

    // Ring buffer: enough room for the hash window, one refill, and a
    // maximal queued literal.
    let mut buffer = vec![0u8; 2 * BLOCK_SIZE + MAX_DATA_OP];

    // [data_tail, data_head): unmatched bytes queued for the next
    // literal. [sum_tail, sum_head): the current hash window.
    let mut data_tail = 0usize;
    let mut data_head = 0usize;
    let mut sum_tail = 0usize;
    let mut valid_to = 0usize;

    // None after a match: the next window is hashed from scratch.
    let mut rolling: Option<RollingChecksum> = None;
    let mut alpha_pop = 0u8;
    let mut last_run = false;

    while !last_run {
        // Refill when the window would run past the valid region.
        if sum_tail + BLOCK_SIZE > valid_to {
            // Wrap the buffer first if the refill would not fit.
            if valid_to + BLOCK_SIZE > buffer.len() {
                if data_tail < data_head {
                    emit.literal(&buffer[data_tail..data_head])?;
                }
                let live = valid_to - sum_tail;
                buffer.copy_within(sum_tail..valid_to, 0);
                valid_to = live;
                sum_tail = 0;
                data_tail = 0;
                data_head = 0;
            }

            let n = read_at_least(source, &mut buffer[valid_to..valid_to + BLOCK_SIZE])?;
            valid_to += n;
            if n < BLOCK_SIZE {
                last_run = true;
                data_head = valid_to;
            }
            if n == 0 {
                if data_tail < data_head {
                    emit.literal(&buffer[data_tail..data_head])?;
                }
                break;
            }
        }

        // Window ends at a full block or the end of valid data.
        let sum_head = (sum_tail + BLOCK_SIZE).min(valid_to);
        let window_len = sum_head - sum_tail;

        let beta = match rolling.as_mut() {
            None => {
                let sum = RollingChecksum::from_block(&buffer[sum_tail..sum_head]);
                let digest = sum.digest();
                rolling = Some(sum);
                digest
            }
            Some(sum) => {
                sum.roll(alpha_pop, buffer[sum_head - 1], window_len);
                sum.digest()
            }
        };

        let mut found = None;
        if !last_run && table.has_weak(beta) {
            let strong = StrongHash::compute(&buffer[sum_tail..sum_head]);
            found = table.find(beta, &strong);
        }

        // Queued literal goes out before a match, when it reaches the
        // instruction size cap, or at end of stream.
        if data_tail < data_head
            && (found.is_some() || data_head - data_tail >= MAX_DATA_OP || last_run)
        {
            emit.literal(&buffer[data_tail..data_head])?;
            data_tail = data_head;
        }

        if let Some(index) = found {
            emit.block(index)?;
            rolling = None;
            sum_tail += BLOCK_SIZE;
            data_head = sum_tail;
            data_tail = sum_tail;
        } else {
            if !last_run && rolling.is_some() {
                alpha_pop = buffer[sum_tail];
            }
            sum_tail += 1;
            data_head = data_head.max(sum_tail);
        }
    }

    emit.finish()
}


#[cfg(test)]
mod proptests {
    use super::tests_support::replay;
    use super::*;
    use crate::signature::create_signature;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Applying the delta of (source, signature(target)) to the
        /// target reproduces the source for arbitrary inputs.
        #[test]
        fn delta_round_trip(
            target in prop::collection::vec(any::<u8>(), 0..(3 * BLOCK_SIZE)),
            source in prop::collection::vec(any::<u8>(), 0..(3 * BLOCK_SIZE))
        ) {
            let sig = create_signature(&mut Cursor::new(&target)).unwrap();
            let mut ops = Vec::new();
            create_delta(&mut Cursor::new(&source), &sig, |op| {
                ops.push(op);
                Ok(())
            }).unwrap();
            prop_assert_eq!(replay(&target, &ops), source);
        }

        /// Deltas of shuffled-block sources still round-trip.
        #[test]
        fn delta_round_trip_shared_blocks(
            seed in prop::collection::vec(any::<u8>(), BLOCK_SIZE..(2 * BLOCK_SIZE)),
            copies in 1usize..5
        ) {
            let target: Vec<u8> = seed.iter().copied().cycle().take(copies * BLOCK_SIZE).collect();
            let mut source = target.clone();
            source.rotate_left(seed.len() / 2);

            let sig = create_signature(&mut Cursor::new(&target)).unwrap();
            let mut ops = Vec::new();
            create_delta(&mut Cursor::new(&source), &sig, |op| {
                ops.push(op);
                Ok(())
            }).unwrap();
            prop_assert_eq!(replay(&target, &ops), source);
        }
    }
}
