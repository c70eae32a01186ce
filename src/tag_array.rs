use crate::{
    address,
    cache::{
        self,
        block::Block,
        replacement,
        set_index::{self, SetIndexer},
    },
    direction::{Direction, Geometry},
    engine::Time,
};

/// Index of a block in the tag array.
pub type BlockId = usize;

/// Block chosen for replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    pub id: BlockId,
    /// blocks of the same way group that must leave with the victim
    pub companions: Vec<BlockId>,
}

/// Result of a tag lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub block: Option<BlockId>,
    pub latency: u64,
    /// the block was found in the other direction
    pub cross: bool,
}

/// A word of a block and the block holding it in the other direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossBlock {
    pub word: usize,
    pub cross_addr: address,
    pub cross_word: usize,
    pub block: Option<BlockId>,
}

/// Tag array.
///
/// Holds `num_sets` x `ways` blocks, addressed by the block number of the
/// block in its own direction.
#[derive(Debug)]
pub struct TagArray {
    geometry: Geometry,
    num_sets: usize,
    ways: usize,
    /// `set * ways + way`
    blocks: Vec<Block>,
    indexer: Box<dyn SetIndexer>,
    tiles: Option<set_index::tiled::SetIndex>,
    policy: Box<dyn replacement::Policy>,
    tag_latency: u64,
    data_latency: u64,
    sequential_access: bool,
    track_duplicates: bool,
    duplicates: i64,
    max_duplicates: i64,
}

impl TagArray {
    #[must_use]
    pub fn new(config: &cache::Config, geometry: Geometry) -> Self {
        let num_sets = config.num_sets();
        let ways = config.ways();
        let blocks = (0..num_sets * ways)
            .map(|idx| Block::new(idx / ways, idx % ways, &geometry))
            .collect();
        let indexer = set_index::build(
            config.set_index,
            num_sets,
            geometry.words_per_block(),
            geometry.row_width(),
        );
        let tiles = config.physically_2d.then(|| {
            set_index::tiled::SetIndex::new(num_sets, geometry.words_per_block(), geometry.row_width())
        });
        Self {
            geometry,
            num_sets,
            ways,
            blocks,
            indexer,
            tiles,
            policy: replacement::build(config.replacement),
            tag_latency: config.tag_latency,
            data_latency: config.data_latency,
            sequential_access: config.sequential_access,
            track_duplicates: config.track_duplicates
                && config.supports_dual_direction
                && !config.physically_2d,
            duplicates: 0,
            max_duplicates: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[inline]
    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.num_sets
    }

    #[inline]
    #[must_use]
    pub fn ways(&self) -> usize {
        self.ways
    }

    #[inline]
    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &Block)> + '_ {
        self.blocks.iter().enumerate()
    }

    pub fn valid_blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> + '_ {
        self.iter().filter(|(_, block)| block.is_valid())
    }

    #[must_use]
    pub fn set_index(&self, addr: address, dir: Direction) -> usize {
        self.indexer
            .compute_set_index(self.geometry.block_number(addr, dir))
    }

    fn set_ids(&self, set: usize) -> std::ops::Range<BlockId> {
        set * self.ways..(set + 1) * self.ways
    }

    /// Finds the valid block holding `addr` in direction `dir`.
    #[must_use]
    pub fn find_block(&self, addr: address, dir: Direction, secure: bool) -> Option<BlockId> {
        let tag = self.geometry.block_number(addr, dir);
        let set = self.set_index(addr, dir);
        self.set_ids(set)
            .find(|&id| self.blocks[id].matches(tag, dir, secure))
    }

    fn hit_latency(&self) -> u64 {
        if self.sequential_access {
            self.tag_latency + self.data_latency
        } else {
            self.tag_latency.max(self.data_latency)
        }
    }

    fn touch(&mut self, id: BlockId, now: Time, extra: u64) -> u64 {
        let mut latency = self.hit_latency() + extra;
        let block = &mut self.blocks[id];
        self.policy.touch(block);
        block.ref_count += 1;
        if block.when_ready > now && block.when_ready - now > latency {
            latency += block.when_ready - now;
        }
        latency
    }

    /// Looks up a block and updates its replacement state.
    pub fn access_block(
        &mut self,
        addr: address,
        dir: Direction,
        secure: bool,
        now: Time,
    ) -> Lookup {
        match self.find_block(addr, dir, secure) {
            Some(id) => Lookup {
                block: Some(id),
                latency: self.touch(id, now, 0),
                cross: false,
            },
            None => Lookup {
                block: None,
                latency: self.tag_latency,
                cross: false,
            },
        }
    }

    /// Looks up a single word access in its own direction, then in the other.
    ///
    /// The second lookup costs another tag access.
    pub fn access_block_one_word(
        &mut self,
        addr: address,
        dir: Direction,
        secure: bool,
        now: Time,
    ) -> Lookup {
        let primary = self.access_block(addr, dir, secure, now);
        if primary.block.is_some() {
            return primary;
        }
        let cross = dir.opposite();
        match self.find_block(addr, cross, secure) {
            Some(id) => Lookup {
                block: Some(id),
                latency: self.touch(id, now, self.tag_latency),
                cross: true,
            },
            None => Lookup {
                block: None,
                latency: 2 * self.tag_latency,
                cross: false,
            },
        }
    }

    /// Whether a block in way group mode conflicts with inserting `addr`.
    fn conflicts(&self, other: &Block, addr: address, dir: Direction) -> bool {
        other.is_valid()
            && (other.dir != dir
                || (dir == Direction::Column
                    && self.geometry.tile_of(other.addr) != self.geometry.tile_of(addr)))
    }

    /// Blocks in `way` of the other sets of the tile group of `addr` that
    /// must be evicted before `addr` is placed in that way.
    #[must_use]
    pub fn companions(&self, addr: address, dir: Direction, way: usize) -> Vec<BlockId> {
        let Some(tiles) = &self.tiles else {
            return Vec::new();
        };
        let block_number = self.geometry.block_number(addr, dir);
        let base = tiles.group_base(block_number);
        let own = base + tiles.position(block_number);
        (base..base + tiles.words_per_block)
            .filter(|&set| set != own)
            .map(|set| set * self.ways + way)
            .filter(|&id| self.conflicts(&self.blocks[id], addr, dir))
            .collect()
    }

    /// Chooses a block to replace for `addr`.
    ///
    /// Blocks for which `is_pinned` holds are never chosen, neither as
    /// victim nor as companion. Returns `None` if every way is pinned.
    pub fn find_victim(
        &self,
        addr: address,
        dir: Direction,
        is_pinned: impl Fn(&Block) -> bool,
    ) -> Option<Victim> {
        let set = self.set_index(addr, dir);
        let mut candidates: Vec<(BlockId, Vec<BlockId>)> = Vec::with_capacity(self.ways);
        for id in self.set_ids(set) {
            let block = &self.blocks[id];
            if block.is_valid() && is_pinned(block) {
                continue;
            }
            let companions = self.companions(addr, dir, block.way);
            if companions.iter().any(|&c| is_pinned(&self.blocks[c])) {
                continue;
            }
            candidates.push((id, companions));
        }

        if let Some(free) = candidates
            .iter()
            .position(|(id, companions)| !self.blocks[*id].is_valid() && companions.is_empty())
        {
            let (id, companions) = candidates.swap_remove(free);
            return Some(Victim { id, companions });
        }

        let blocks: Vec<&Block> = candidates.iter().map(|(id, _)| &self.blocks[*id]).collect();
        let chosen = self.policy.victim(&blocks)?;
        let (id, companions) = candidates.swap_remove(chosen);
        Some(Victim { id, companions })
    }

    /// Number of valid blocks in the other direction sharing a word.
    fn count_cross_valid(&self, addr: address, dir: Direction, secure: bool) -> i64 {
        self.cross_blocks(addr, dir, secure)
            .iter()
            .filter(|cross| cross.block.is_some())
            .count() as i64
    }

    /// Places a block for `addr` in the (invalid) slot `id`.
    pub fn insert_block(
        &mut self,
        id: BlockId,
        addr: address,
        dir: Direction,
        secure: bool,
        now: Time,
    ) {
        assert!(
            !self.blocks[id].is_valid(),
            "inserting into valid {}",
            self.blocks[id]
        );
        if self.track_duplicates {
            self.duplicates += self.count_cross_valid(addr, dir, secure);
            self.max_duplicates = self.max_duplicates.max(self.duplicates);
        }
        let tag = self.geometry.block_number(addr, dir);
        let block_addr = self.geometry.block_align(addr, dir);
        let block = &mut self.blocks[id];
        block.tag = tag;
        block.addr = block_addr;
        block.dir = dir;
        block.ref_count = 0;
        block.when_ready = now;
        block.set_valid();
        block.set_secure(secure);
        self.policy.reset(block);
        log::trace!("tag_array::insert_block({})", self.blocks[id]);
    }

    pub fn invalidate(&mut self, id: BlockId) {
        if !self.blocks[id].is_valid() {
            return;
        }
        if self.track_duplicates {
            let block = &self.blocks[id];
            self.duplicates -= self.count_cross_valid(block.addr, block.dir, block.is_secure());
        }
        let block = &mut self.blocks[id];
        self.policy.invalidate(block);
        block.invalidate();
    }

    /// Cross direction blocks of every word of the block at `addr`.
    #[must_use]
    pub fn cross_blocks(&self, addr: address, dir: Direction, secure: bool) -> Vec<CrossBlock> {
        let base = self.geometry.block_align(addr, dir);
        (0..self.geometry.words_per_block())
            .map(|word| {
                let (cross_addr, cross_word) = self.geometry.cross_word(base, dir, word);
                CrossBlock {
                    word,
                    cross_addr,
                    cross_word,
                    block: self.find_block(cross_addr, dir.opposite(), secure),
                }
            })
            .collect()
    }

    /// Valid blocks of the tile holding `addr`, in both directions.
    #[must_use]
    pub fn tile_blocks(&self, addr: address, secure: bool) -> Vec<BlockId> {
        let tile = self.geometry.tile_of(addr);
        [Direction::Row, Direction::Column]
            .into_iter()
            .flat_map(|dir| {
                self.geometry
                    .tile_blocks(tile, dir)
                    .into_iter()
                    .filter_map(move |block| self.find_block(block, dir, secure))
            })
            .collect()
    }

    /// Current number of valid block pairs sharing a word.
    #[must_use]
    pub fn duplicates(&self) -> i64 {
        self.duplicates
    }

    #[must_use]
    pub fn max_duplicates(&self) -> i64 {
        self.max_duplicates
    }

    #[must_use]
    pub fn is_physically_2d(&self) -> bool {
        self.tiles.is_some()
    }
}
