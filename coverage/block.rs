//! Partitioning of the ordered target space into contiguous blocks.
//!
//! A block is the unit of ownership for model parameters and sample caches.
//! Samples are never blocked; only the target axis is.

use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Blocks smaller than this are allowed but reported, since they make the
/// per-block bookkeeping dominate the arithmetic.
pub const DEFAULT_MIN_TARGET_BLOCK_SIZE: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("A target block must contain at least one target, but [{begin}, {end}) is empty.")]
    EmptyBlock { begin: usize, end: usize },

    #[error(
        "Number of target blocks must be between 1 and the size of the target space ({num_targets}), but was {requested}."
    )]
    InvalidBlockCount { requested: usize, num_targets: usize },
}

/// A half-open interval `[begin, end)` of target indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetSpaceBlock {
    begin: usize,
    end: usize,
}

impl TargetSpaceBlock {
    pub fn new(begin: usize, end: usize) -> Result<Self, BlockError> {
        if end <= begin {
            return Err(BlockError::EmptyBlock { begin, end });
        }
        Ok(Self { begin, end })
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn num_targets(&self) -> usize {
        self.end - self.begin
    }

    pub fn range(&self) -> Range<usize> {
        self.begin..self.end
    }

    pub fn contains(&self, target_index: usize) -> bool {
        self.range().contains(&target_index)
    }
}

impl fmt::Display for TargetSpaceBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Splits `[0, num_targets)` into exactly `num_blocks` contiguous blocks.
///
/// Every block but the last holds `floor(num_targets / num_blocks)` targets and the
/// last block absorbs the remainder. The result depends only on the two counts.
pub fn partition_target_space(
    num_targets: usize,
    num_blocks: usize,
    min_block_size: usize,
) -> Result<Vec<TargetSpaceBlock>, BlockError> {
    if num_blocks == 0 || num_blocks > num_targets {
        return Err(BlockError::InvalidBlockCount {
            requested: num_blocks,
            num_targets,
        });
    }

    let block_size = num_targets / num_blocks;
    if block_size < min_block_size {
        log::debug!(
            "Requested {} blocks over {} targets; blocks hold {} targets, below the preferred minimum of {}.",
            num_blocks,
            num_targets,
            block_size,
            min_block_size
        );
    }

    let blocks: Vec<TargetSpaceBlock> = (0..num_blocks)
        .map(|index| {
            let begin = index * block_size;
            let end = if index + 1 == num_blocks {
                num_targets
            } else {
                begin + block_size
            };
            TargetSpaceBlock { begin, end }
        })
        .collect();

    log::debug!(
        "Target space blocks: {}",
        blocks
            .iter()
            .map(TargetSpaceBlock::to_string)
            .collect::<Vec<_>>()
            .join("\t")
    );

    Ok(blocks)
}
