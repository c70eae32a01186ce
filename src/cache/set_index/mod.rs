//! Set index functions.
//!
//! All functions work on the block number of a block in its own direction,
//! so row and column blocks share the same machinery.

use serde::{Deserialize, Serialize};

pub trait SetIndexer: std::fmt::Debug + Send + Sync + 'static {
    /// Compute set index of a block number.
    #[must_use]
    fn compute_set_index(&self, block_number: u64) -> usize;
}

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    #[default]
    Linear,
    BitwiseXor,
    /// W rows and W columns of a tile share W consecutive sets
    Tiled,
}

#[must_use]
pub fn build(
    function: Function,
    num_sets: usize,
    words_per_block: usize,
    row_width: u64,
) -> Box<dyn SetIndexer> {
    match function {
        Function::Linear => Box::new(linear::SetIndex::new(num_sets)),
        Function::BitwiseXor => Box::new(bitwise_xor::SetIndex::new(num_sets)),
        Function::Tiled => Box::new(tiled::SetIndex::new(num_sets, words_per_block, row_width)),
    }
}

pub mod linear {
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct SetIndex {
        pub num_sets: usize,
    }

    impl SetIndex {
        #[must_use]
        pub fn new(num_sets: usize) -> Self {
            Self { num_sets }
        }
    }

    impl super::SetIndexer for SetIndex {
        fn compute_set_index(&self, block_number: u64) -> usize {
            let set_idx = (block_number % self.num_sets as u64) as usize;
            assert!(set_idx < self.num_sets, "set index out of bounds");
            set_idx
        }
    }
}

pub mod bitwise_xor {
    #[must_use]
    pub fn bitwise_hash_function(higher_bits: u64, index: usize, bank_set_num: usize) -> usize {
        index ^ (higher_bits & (bank_set_num as u64 - 1)) as usize
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct SetIndex {
        pub num_sets: usize,
        pub num_sets_log2: u32,
    }

    impl SetIndex {
        #[must_use]
        pub fn new(num_sets: usize) -> Self {
            assert!(
                num_sets.is_power_of_two(),
                "bitwise xor set index needs a power of two number of sets (got {num_sets})"
            );
            Self {
                num_sets,
                num_sets_log2: num_sets.ilog2(),
            }
        }
    }

    impl super::SetIndexer for SetIndex {
        fn compute_set_index(&self, block_number: u64) -> usize {
            let higher_bits = block_number >> self.num_sets_log2;
            let index = (block_number as usize) & (self.num_sets - 1);
            let set_idx = bitwise_hash_function(higher_bits, index, self.num_sets);
            assert!(set_idx < self.num_sets, "set index out of bounds");
            set_idx
        }
    }
}

pub mod tiled {
    /// Places each tile in a group of `words_per_block` consecutive sets.
    ///
    /// Row `i` and column `i` of a tile map to the same set.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct SetIndex {
        pub num_sets: usize,
        pub num_groups: usize,
        pub words_per_block: usize,
        pub row_width_log2: u32,
        pub words_log2: u32,
    }

    impl SetIndex {
        #[must_use]
        pub fn new(num_sets: usize, words_per_block: usize, row_width: u64) -> Self {
            assert!(
                num_sets % words_per_block == 0,
                "tiled set index needs a multiple of {words_per_block} sets (got {num_sets})"
            );
            Self {
                num_sets,
                num_groups: num_sets / words_per_block,
                words_per_block,
                row_width_log2: row_width.ilog2(),
                words_log2: words_per_block.ilog2(),
            }
        }

        /// Position of the block inside its tile.
        #[must_use]
        pub fn position(&self, block_number: u64) -> usize {
            ((block_number >> self.row_width_log2) as usize) & (self.words_per_block - 1)
        }

        /// Tile number shared by all blocks of a tile in either direction.
        #[must_use]
        pub fn tile_number(&self, block_number: u64) -> u64 {
            let in_row = block_number & ((1 << self.row_width_log2) - 1);
            let rows = block_number >> (self.row_width_log2 + self.words_log2);
            (rows << self.row_width_log2) | in_row
        }

        /// First set of the group holding a tile.
        #[must_use]
        pub fn group_base(&self, block_number: u64) -> usize {
            (self.tile_number(block_number) % self.num_groups as u64) as usize
                * self.words_per_block
        }
    }

    impl super::SetIndexer for SetIndex {
        fn compute_set_index(&self, block_number: u64) -> usize {
            let set_idx = self.group_base(block_number) + self.position(block_number);
            assert!(set_idx < self.num_sets, "set index out of bounds");
            set_idx
        }
    }
}
