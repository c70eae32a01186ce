use crate::{
    address,
    cache::{self, set_index},
    config::SimConfig,
    direction::{Direction, Geometry},
    packet::Command,
    WORD_SIZE,
};
use std::collections::BTreeMap;

pub use crate::sim::System;

static LOGGER: std::sync::Once = std::sync::Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        env_logger::builder().is_test(true).init();
    });
}

/// Default cache with both directions in separate blocks.
#[must_use]
pub fn small_config() -> SimConfig {
    SimConfig::default()
}

/// A 1KiB cache that evicts a lot.
#[must_use]
pub fn tiny_config() -> SimConfig {
    SimConfig {
        cache: cache::Config {
            name: "tiny".to_string(),
            size: 1024,
            assoc: 2,
            mshrs: 4,
            targets_per_mshr: 4,
            write_buffers: 16,
            track_duplicates: true,
            ..cache::Config::default()
        },
        ..SimConfig::default()
    }
}

/// A physically 2D cache with 32 sets.
#[must_use]
pub fn tiled_config() -> SimConfig {
    SimConfig {
        cache: cache::Config {
            name: "tiled".to_string(),
            size: 4096,
            assoc: 2,
            set_index: set_index::Function::Tiled,
            physically_2d: true,
            write_buffers: 16,
            ..cache::Config::default()
        },
        ..SimConfig::default()
    }
}

/// Deterministic pseudo random numbers.
#[derive(Debug, Clone)]
pub struct XorShift(u64);

impl XorShift {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }
}

/// A read or write of one word, two words or a whole block.
///
/// Addresses stay inside 16 rows of 4 blocks so rows and columns overlap.
pub fn random_access(
    rng: &mut XorShift,
    geometry: &Geometry,
) -> (Command, address, Direction, u64, Option<Vec<u8>>) {
    let dir = if rng.below(2) == 0 {
        Direction::Row
    } else {
        Direction::Column
    };
    let phys = rng.below(16) * geometry.row_stride()
        + rng.below(4) * geometry.block_size()
        + rng.below(geometry.words_per_block() as u64) * WORD_SIZE;
    let words = match rng.below(4) {
        0 => geometry.words_per_block(),
        1 => 2,
        _ => 1,
    };
    let block = geometry.block_align(phys, dir);
    let first = geometry
        .word_index(phys, dir)
        .min(geometry.words_per_block() - words);
    let addr = geometry.word_addr(block, dir, first);
    let size = words as u64 * WORD_SIZE;

    if rng.below(2) == 0 {
        (Command::ReadReq, addr, dir, size, None)
    } else {
        let data = (0..words)
            .flat_map(|_| rng.next_u64().to_le_bytes())
            .collect();
        (Command::WriteReq, addr, dir, size, Some(data))
    }
}

/// Flat memory that sees every write immediately.
#[derive(Debug, Default, Clone)]
pub struct Oracle {
    words: BTreeMap<address, [u8; WORD_SIZE as usize]>,
}

impl Oracle {
    pub fn write(&mut self, geometry: &Geometry, addr: address, dir: Direction, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            let phys = geometry.add_offset(addr, dir, offset as u64);
            let word = self.words.entry(phys & !(WORD_SIZE - 1)).or_default();
            word[(phys % WORD_SIZE) as usize] = *byte;
        }
    }

    #[must_use]
    pub fn read(&self, geometry: &Geometry, addr: address, dir: Direction, size: u64) -> Vec<u8> {
        (0..size)
            .map(|offset| {
                let phys = geometry.add_offset(addr, dir, offset);
                self.words
                    .get(&(phys & !(WORD_SIZE - 1)))
                    .map_or(0, |word| word[(phys % WORD_SIZE) as usize])
            })
            .collect()
    }

    /// Every written word and its value.
    pub fn iter(&self) -> impl Iterator<Item = (address, u64)> + '_ {
        self.words
            .iter()
            .map(|(addr, bytes)| (*addr, u64::from_le_bytes(*bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::{Oracle, XorShift};
    use crate::direction::{Direction, Geometry};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    #[test]
    fn oracle_reads_columns_across_rows() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let mut oracle = Oracle::default();
        oracle.write(&geometry, 0x0, Direction::Row, &7u64.to_le_bytes());
        oracle.write(&geometry, 0x200, Direction::Row, &9u64.to_le_bytes());
        let column = oracle.read(&geometry, 0x0, Direction::Column, 16);
        diff::assert_eq!(column[..8].to_vec(), 7u64.to_le_bytes().to_vec());
        diff::assert_eq!(column[8..].to_vec(), 9u64.to_le_bytes().to_vec());
        diff::assert_eq!(oracle.iter().collect::<Vec<_>>(), vec![(0x0, 7), (0x200, 9)]);
        Ok(())
    }

    #[test]
    fn xorshift_is_deterministic() {
        let mut a = XorShift::new(3);
        let mut b = XorShift::new(3);
        for _ in 0..10 {
            diff::assert_eq!(a.next_u64(), b.next_u64());
        }
        assert!((0..100).all(|_| a.below(5) < 5));
    }
}
