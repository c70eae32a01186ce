use super::{block::Block, config::ReplacementPolicy};

/// Replacement strategy of a tag store.
pub trait Policy: std::fmt::Debug + Send + Sync + 'static {
    /// Resets the state of a freshly inserted block.
    fn reset(&mut self, block: &mut Block);

    /// Updates the state of an accessed block.
    fn touch(&mut self, block: &mut Block);

    fn invalidate(&mut self, block: &mut Block);

    /// Index of the victim among the candidates.
    #[must_use]
    fn victim(&self, candidates: &[&Block]) -> Option<usize>;
}

#[must_use]
pub fn build(policy: ReplacementPolicy) -> Box<dyn Policy> {
    match policy {
        ReplacementPolicy::LRU => Box::<Lru>::default(),
        ReplacementPolicy::FIFO => Box::<Fifo>::default(),
    }
}

/// Index of the minimum key, ties go to the lowest way.
fn oldest_by(candidates: &[&Block], key: impl Fn(&Block) -> u64) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, block)| (key(block), block.way))
        .map(|(idx, _)| idx)
}

#[derive(Debug, Default)]
pub struct Lru {
    tick: u64,
}

impl Policy for Lru {
    fn reset(&mut self, block: &mut Block) {
        self.tick += 1;
        block.inserted_at = self.tick;
        block.last_touch = self.tick;
    }

    fn touch(&mut self, block: &mut Block) {
        self.tick += 1;
        block.last_touch = self.tick;
    }

    fn invalidate(&mut self, block: &mut Block) {
        block.last_touch = 0;
    }

    fn victim(&self, candidates: &[&Block]) -> Option<usize> {
        oldest_by(candidates, |block| block.last_touch)
    }
}

#[derive(Debug, Default)]
pub struct Fifo {
    tick: u64,
}

impl Policy for Fifo {
    fn reset(&mut self, block: &mut Block) {
        self.tick += 1;
        block.inserted_at = self.tick;
        block.last_touch = self.tick;
    }

    fn touch(&mut self, block: &mut Block) {
        self.tick += 1;
        block.last_touch = self.tick;
    }

    fn invalidate(&mut self, block: &mut Block) {
        block.inserted_at = 0;
    }

    fn victim(&self, candidates: &[&Block]) -> Option<usize> {
        oldest_by(candidates, |block| block.inserted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::{Fifo, Lru, Policy};
    use crate::{cache::block::Block, direction::Geometry};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    fn ways(geometry: &Geometry, n: usize) -> Vec<Block> {
        (0..n).map(|way| Block::new(0, way, geometry)).collect()
    }

    #[test]
    fn lru_evicts_least_recently_touched() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let mut policy = Lru::default();
        let mut blocks = ways(&geometry, 3);
        for block in &mut blocks {
            policy.reset(block);
        }
        policy.touch(&mut blocks[0]);
        let candidates: Vec<_> = blocks.iter().collect();
        diff::assert_eq!(policy.victim(&candidates), Some(1));
        Ok(())
    }

    #[test]
    fn fifo_ignores_touches() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let mut policy = Fifo::default();
        let mut blocks = ways(&geometry, 3);
        for block in &mut blocks {
            policy.reset(block);
        }
        policy.touch(&mut blocks[0]);
        let candidates: Vec<_> = blocks.iter().collect();
        diff::assert_eq!(policy.victim(&candidates), Some(0));
        Ok(())
    }

    #[test]
    fn ties_go_to_lowest_way() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let policy = Lru::default();
        let blocks = ways(&geometry, 4);
        let candidates: Vec<_> = blocks.iter().rev().collect();
        // all untouched, way 0 is the last candidate
        diff::assert_eq!(policy.victim(&candidates), Some(3));
        diff::assert_eq!(policy.victim(&[]), None);
        Ok(())
    }
}
