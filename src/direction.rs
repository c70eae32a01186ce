//! Row and column addressing of a two dimensional memory layout.
//!
//! Memory is viewed as rows of `row_width` blocks. A column block holds one
//! word from each of `words_per_block` consecutive rows. All direction
//! dependent address arithmetic goes through [`Geometry::transpose`].

use crate::address;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Size of the unit at which row and column blocks intersect.
pub const WORD_SIZE: u64 = 8;

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Direction {
    #[default]
    Row,
    Column,
}

impl Direction {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Direction::Row => Direction::Column,
            Direction::Column => Direction::Row,
        }
    }

    #[must_use]
    pub fn is_column(self) -> bool {
        self == Direction::Column
    }
}

impl From<Direction> for stats::Direction {
    fn from(dir: Direction) -> Self {
        match dir {
            Direction::Row => stats::Direction::Row,
            Direction::Column => stats::Direction::Column,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("block size {0} must be a power of two of at least {WORD_SIZE} bytes")]
    BlockSize(u64),
    #[error("block size {0} holds more than 64 words")]
    TooManyWords(u64),
    #[error("row width {0} must be a non-zero power of two")]
    RowWidth(u64),
}

/// Address decomposition shared by every direction aware component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    block_size: u64,
    row_width: u64,
    word_bits: u32,
    block_bits: u32,
    col_shift: u32,
}

impl Geometry {
    pub fn new(block_size: u64, row_width: u64) -> Result<Self, GeometryError> {
        if !block_size.is_power_of_two() || block_size < WORD_SIZE {
            return Err(GeometryError::BlockSize(block_size));
        }
        if block_size / WORD_SIZE > 64 {
            return Err(GeometryError::TooManyWords(block_size));
        }
        if !row_width.is_power_of_two() {
            return Err(GeometryError::RowWidth(row_width));
        }
        let block_bits = block_size.ilog2();
        Ok(Self {
            block_size,
            row_width,
            word_bits: (block_size / WORD_SIZE).ilog2(),
            block_bits,
            col_shift: row_width.ilog2() + block_bits,
        })
    }

    #[inline]
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[inline]
    #[must_use]
    pub fn row_width(&self) -> u64 {
        self.row_width
    }

    #[inline]
    #[must_use]
    pub fn words_per_block(&self) -> usize {
        1 << self.word_bits
    }

    /// Distance in bytes between two vertically adjacent words.
    #[inline]
    #[must_use]
    pub fn row_stride(&self) -> u64 {
        self.row_width * self.block_size
    }

    #[inline]
    fn field_mask(&self) -> u64 {
        (1 << self.word_bits) - 1
    }

    /// Swaps the word-in-block field with the row-in-tile field.
    ///
    /// This is an involution, `transpose(transpose(a)) == a`.
    #[must_use]
    pub fn transpose(&self, addr: address) -> address {
        let row_shift = WORD_SIZE.ilog2();
        let mask = self.field_mask();
        let word = (addr >> row_shift) & mask;
        let row = (addr >> self.col_shift) & mask;
        let cleared = addr & !(mask << row_shift) & !(mask << self.col_shift);
        cleared | (word << self.col_shift) | (row << row_shift)
    }

    /// Maps an address into the linear byte space of `dir`.
    ///
    /// Its own inverse.
    #[inline]
    #[must_use]
    pub fn linearize(&self, addr: address, dir: Direction) -> address {
        match dir {
            Direction::Row => addr,
            Direction::Column => self.transpose(addr),
        }
    }

    #[must_use]
    pub fn block_align(&self, addr: address, dir: Direction) -> address {
        let aligned = self.linearize(addr, dir) & !(self.block_size - 1);
        self.linearize(aligned, dir)
    }

    /// Byte offset of `addr` inside its block in direction `dir`.
    #[must_use]
    pub fn block_offset(&self, addr: address, dir: Direction) -> u64 {
        self.linearize(addr, dir) & (self.block_size - 1)
    }

    /// Block number of `addr` in the linear space of `dir`.
    #[must_use]
    pub fn block_number(&self, addr: address, dir: Direction) -> u64 {
        self.linearize(addr, dir) >> self.block_bits
    }

    /// Adds `offset` bytes to `base` in the linear space of `dir`.
    #[must_use]
    pub fn add_offset(&self, base: address, dir: Direction, offset: u64) -> address {
        self.linearize(self.linearize(base, dir) + offset, dir)
    }

    /// Physical address of word `index` of the block at `block_addr`.
    #[must_use]
    pub fn word_addr(&self, block_addr: address, dir: Direction, index: usize) -> address {
        assert!(
            index < self.words_per_block(),
            "word index {index} out of range for {} words",
            self.words_per_block()
        );
        self.add_offset(block_addr, dir, index as u64 * WORD_SIZE)
    }

    /// Index of the word holding `addr` inside its block in direction `dir`.
    #[must_use]
    pub fn word_index(&self, addr: address, dir: Direction) -> usize {
        (self.block_offset(addr, dir) / WORD_SIZE) as usize
    }

    /// Word indices touched by an access of `size` bytes at `addr`.
    #[must_use]
    pub fn words_touched(&self, addr: address, dir: Direction, size: u64) -> Range<usize> {
        let offset = self.block_offset(addr, dir);
        assert!(
            size > 0 && offset + size <= self.block_size,
            "access of {size} bytes at offset {offset} crosses a {} byte block",
            self.block_size
        );
        let first = (offset / WORD_SIZE) as usize;
        let last = ((offset + size - 1) / WORD_SIZE) as usize;
        first..last + 1
    }

    /// Block and word index in the opposite direction that share word `index`.
    #[must_use]
    pub fn cross_word(&self, block_addr: address, dir: Direction, index: usize) -> (address, usize) {
        let word = self.word_addr(block_addr, dir, index);
        let cross = dir.opposite();
        (self.block_align(word, cross), self.word_index(word, cross))
    }

    /// Whether two blocks share at least one word.
    #[must_use]
    pub fn blocks_intersect(
        &self,
        a: address,
        a_dir: Direction,
        b: address,
        b_dir: Direction,
    ) -> bool {
        if a_dir == b_dir {
            return self.block_align(a, a_dir) == self.block_align(b, b_dir);
        }
        let b = self.block_align(b, b_dir);
        (0..self.words_per_block()).any(|i| self.cross_word(a, a_dir, i).0 == b)
    }

    /// Address with the byte offset and both transposed fields cleared.
    ///
    /// All row and column blocks of a tile share it.
    #[must_use]
    pub fn tile_of(&self, addr: address) -> address {
        let mask = self.field_mask();
        addr & !(WORD_SIZE - 1)
            & !(mask << WORD_SIZE.ilog2())
            & !(mask << self.col_shift)
    }

    /// Block addresses of a tile in direction `dir`, in word order.
    #[must_use]
    pub fn tile_blocks(&self, tile: address, dir: Direction) -> Vec<address> {
        (0..self.words_per_block())
            .map(|i| match dir {
                Direction::Row => tile + i as u64 * self.row_stride(),
                Direction::Column => tile + i as u64 * WORD_SIZE,
            })
            .collect()
    }

    /// Position of a block inside its tile.
    #[must_use]
    pub fn tile_position(&self, block_addr: address, dir: Direction) -> usize {
        ((self.block_number(block_addr, dir) >> self.row_width.ilog2()) & self.field_mask())
            as usize
    }

    /// Physical addresses of the words covered by an access.
    pub fn physical_words(
        &self,
        addr: address,
        dir: Direction,
        size: u64,
    ) -> impl Iterator<Item = address> + '_ {
        let base = self.block_align(addr, dir);
        self.words_touched(addr, dir, size)
            .map(move |i| self.word_addr(base, dir, i))
    }

    /// Next block after `block_addr` in the linear space of `dir`.
    #[must_use]
    pub fn next_block(&self, block_addr: address, dir: Direction) -> address {
        self.add_offset(self.block_align(block_addr, dir), dir, self.block_size)
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Geometry(block={}, row_width={}, words={})",
            human_bytes::human_bytes(self.block_size as f64),
            self.row_width,
            self.words_per_block()
        )
    }
}
