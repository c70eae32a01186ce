//! Keeping the row and column views of a word consistent.
//!
//! A word may be cached twice, once in its row block and once in its column
//! block. Only one of the copies may be written: before a write the copies
//! in the other direction are invalidated, and before a fetch the other
//! direction gives up write permission and hands its dirty words to memory.

use super::{Cache, Slot};
use crate::{
    address,
    direction::Direction,
    engine::Scheduler,
    mshr::Key,
    packet::WordMask,
};

impl Cache {
    /// Prepares the other direction for fetching a block.
    ///
    /// Cross blocks holding a word in `written` are written back (or clean
    /// evicted) and invalidated. The remaining cross blocks lose write
    /// permission, and are written back first if their shared word is dirty.
    /// The writebacks are ordered before the fetch.
    pub(super) fn fetch_pass(
        &mut self,
        block_addr: address,
        dir: Direction,
        secure: bool,
        written: &WordMask,
        sched: &mut dyn Scheduler,
    ) {
        if !self.config.supports_dual_direction {
            return;
        }
        let now = sched.now();
        for cross in self.tags.cross_blocks(block_addr, dir, secure) {
            let Some(id) = cross.block else {
                continue;
            };
            let slot = Slot::Tag(id);
            if written.get(cross.word).is_some_and(|bit| *bit) {
                let order = self.next_order();
                self.evict_block(slot, order, sched);
                self.stats.consistency.cross_invalidations += 1;
                continue;
            }
            if self.tags.block(id).is_word_dirty(cross.cross_word) {
                let pkt = self.writeback_block(slot, now);
                let order = self.next_order();
                self.allocate_write_buffer(pkt, now, order, sched);
                self.stats.consistency.cross_writebacks += 1;
            }
            let block = self.tags.block_mut(id);
            if block.is_writable() {
                block.set_writable(false);
                self.stats.consistency.cross_downgrades += 1;
            }
        }
    }

    /// Drops the blocks of the other direction holding a word a write joining
    /// a pending miss is going to change.
    pub(super) fn invalidate_written_cross(
        &mut self,
        block_addr: address,
        dir: Direction,
        secure: bool,
        written: &[usize],
        sched: &mut dyn Scheduler,
    ) {
        if !self.config.supports_dual_direction || written.is_empty() {
            return;
        }
        for cross in self.tags.cross_blocks(block_addr, dir, secure) {
            let Some(id) = cross.block else {
                continue;
            };
            if written.contains(&cross.word) {
                let order = self.next_order();
                self.evict_block(Slot::Tag(id), order, sched);
                self.stats.consistency.cross_invalidations += 1;
            }
        }
    }

    /// Invalidates the other direction's copies of the words a write touches.
    ///
    /// In a physically 2D cache every block of the other direction within
    /// the tile goes. Pending misses of the other direction that cover a
    /// written word are marked stale.
    pub(super) fn invalidate_cross_for_write(
        &mut self,
        block_addr: address,
        dir: Direction,
        secure: bool,
        words: &[usize],
        sched: &mut dyn Scheduler,
    ) {
        if !self.config.supports_dual_direction || words.is_empty() {
            return;
        }
        let geometry = self.geometry;
        if self.tags.is_physically_2d() {
            for id in self.tags.tile_blocks(block_addr, secure) {
                if self.tags.block(id).dir == dir {
                    continue;
                }
                let order = self.next_order();
                self.evict_block(Slot::Tag(id), order, sched);
                self.stats.consistency.tile_invalidations += 1;
            }
        } else {
            for &word in words {
                let (cross_addr, _) = geometry.cross_word(block_addr, dir, word);
                if let Some(id) = self.tags.find_block(cross_addr, dir.opposite(), secure) {
                    let order = self.next_order();
                    self.evict_block(Slot::Tag(id), order, sched);
                    self.stats.consistency.cross_invalidations += 1;
                }
            }
        }
        for &word in words {
            let (cross_addr, cross_word) = geometry.cross_word(block_addr, dir, word);
            let key = Key::block(cross_addr, dir.opposite(), secure);
            self.mshrs
                .mark_stale(&key, cross_word, geometry.words_per_block());
        }
    }

    /// Invalidates everything an invalidating snoop of a block reaches
    /// besides the block itself.
    pub(super) fn invalidate_cross_for_snoop(
        &mut self,
        block_addr: address,
        dir: Direction,
        secure: bool,
        sched: &mut dyn Scheduler,
    ) {
        if !self.config.supports_dual_direction {
            return;
        }
        let ids: Vec<_> = if self.tags.is_physically_2d() {
            self.tags
                .tile_blocks(block_addr, secure)
                .into_iter()
                .filter(|&id| {
                    let block = self.tags.block(id);
                    block.addr != block_addr || block.dir != dir
                })
                .collect()
        } else {
            self.tags
                .cross_blocks(block_addr, dir, secure)
                .into_iter()
                .filter_map(|cross| cross.block)
                .collect()
        };
        for id in ids {
            let order = self.next_order();
            self.evict_block(Slot::Tag(id), order, sched);
            self.stats.consistency.cross_invalidations += 1;
        }
    }

    /// Words an MSHR's targets are going to write.
    pub(super) fn written_words(&self, key: &Key) -> WordMask {
        let mut written = WordMask::repeat(false, self.geometry.words_per_block());
        let Some(mshr) = self.mshrs.get(key) else {
            return written;
        };
        let targets = mshr
            .targets
            .iter()
            .chain(mshr.deferred.iter())
            .filter_map(|id| self.mshrs.target(id));
        for target in targets {
            if target.source == crate::mshr::Source::Snoop || !target.pkt.needs_writable() {
                continue;
            }
            for word in target.pkt.words(&self.geometry) {
                written.set(word, true);
            }
        }
        written
    }

    /// Carries out the obligations serviced targets left on a block.
    ///
    /// Writebacks take the order of the obligating target so they reach
    /// memory before the miss that waits for them.
    pub(super) fn service_obligations(
        &mut self,
        slot: Slot,
        post_writeback: Option<u64>,
        post_invalidate: Option<u64>,
        sched: &mut dyn Scheduler,
    ) {
        if !self.block(slot).is_valid() {
            return;
        }
        let now = sched.now();
        if let Some(order) = post_invalidate {
            self.stats.consistency.post_invalidates += 1;
            if self.block(slot).is_dirty() {
                self.stats.consistency.conflict_writebacks += 1;
            }
            self.evict_block(slot, order, sched);
        } else if let Some(order) = post_writeback {
            self.stats.consistency.post_writebacks += 1;
            if self.block(slot).is_dirty() {
                self.stats.consistency.conflict_writebacks += 1;
                let pkt = self.writeback_block(slot, now);
                self.allocate_write_buffer(pkt, now, order, sched);
            }
            self.block_mut(slot).set_writable(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        direction::Direction,
        packet::Command,
        testing::{self, System},
    };
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    #[test]
    fn column_read_sees_row_write() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        // word 2 of row 3 lies in word 3 of column 0x10
        let row = 3 * 512;
        sys.write(row + 16, Direction::Row, 0xfeed)?;
        let values = sys.read_words(0x10, Direction::Column, 8)?;
        diff::assert_eq!(values[3], 0xfeed);

        let stats = sys.cache.stats();
        diff::assert_eq!(stats.consistency.cross_writebacks, 1);
        // the row block stays valid but read only
        let block = sys.cache.tags().find_block(row, Direction::Row, false);
        let block = block.map(|id| sys.cache.tags().block(id));
        assert!(block.is_some_and(|b| b.is_valid() && !b.is_writable() && !b.is_dirty()));
        Ok(())
    }

    #[test]
    fn single_word_read_hits_other_direction() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        let row = 5 * 512;
        sys.write(row + 8, Direction::Row, 0xbeef)?;
        diff::assert_eq!(sys.read(row + 8, Direction::Column)?, 0xbeef);
        let stats = sys.cache.stats();
        diff::assert_eq!(
            stats.count(
                stats::Direction::Column,
                stats::AccessKind::Read,
                stats::RequestStatus::CROSS_HIT
            ),
            1
        );
        // no memory traffic for the column view
        diff::assert_eq!(sys.memory.stats.writebacks, 0);
        Ok(())
    }

    #[test]
    fn column_write_invalidates_rows() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        // bring rows 0 and 1 into the cache
        sys.read_words(0, Direction::Row, 8)?;
        sys.read_words(512, Direction::Row, 8)?;
        // a column write covering word 0 of both rows
        sys.access(Command::WriteReq, 0, Direction::Column, 16, Some(vec![7; 16]))?;
        let tags = sys.cache.tags();
        assert!(tags.find_block(0, Direction::Row, false).is_none());
        assert!(tags.find_block(512, Direction::Row, false).is_none());
        diff::assert_eq!(sys.read(0, Direction::Row)?, u64::from_le_bytes([7; 8]));
        diff::assert_eq!(sys.read(512, Direction::Row)?, u64::from_le_bytes([7; 8]));
        Ok(())
    }

    #[test]
    fn write_hit_invalidates_cross_copy() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        // column 0x8 covers word 1 of rows 0..8
        sys.read_words(0x8, Direction::Column, 8)?;
        sys.read_words(0, Direction::Row, 8)?;
        // the row block is the only writable copy candidate, the write
        // upgrades it and the column copy goes away
        sys.write(0x8, Direction::Row, 42)?;
        assert!(sys
            .cache
            .tags()
            .find_block(0x8, Direction::Column, false)
            .is_none());
        let column = sys.read_words(0x8, Direction::Column, 8)?;
        diff::assert_eq!(column[0], 42);
        Ok(())
    }

    #[test]
    fn read_waits_for_write_joining_cross_miss() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        // column 0x1000 holds word 0 of rows 0x1000, 0x1200, ...
        sys.write(0x1000, Direction::Row, 1)?;
        let fetch = sys.request(Command::ReadReq, 0x1200, Direction::Column, 8, None);
        sys.issue(fetch);
        sys.run_until(|sys| sys.cache.mshrs().iter().any(|mshr| mshr.in_service))?;

        // the write joins the column miss, the row copy of its word goes
        let write = sys.request(
            Command::WriteReq,
            0x1000,
            Direction::Column,
            8,
            Some(2u64.to_le_bytes().to_vec()),
        );
        sys.issue(write);
        let read = sys.request(Command::ReadReq, 0x1000, Direction::Row, 8, None);
        let read_id = read.id;
        sys.issue(read);
        sys.run()?;

        let responses = sys.take_responses();
        diff::assert_eq!(responses.len(), 3);
        let value = responses
            .iter()
            .find(|(_, pkt)| pkt.id == read_id)
            .and_then(|(_, pkt)| pkt.value());
        diff::assert_eq!(value, Some(2));
        diff::assert_eq!(sys.cache.stats().mshr.hits, 1);
        assert!(sys.cache.is_idle());
        Ok(())
    }

    macro_rules! cross_direction_checks {
        ($($name:ident: ($write:expr, $read:expr),)*) => {
            $(
                paste::paste! {
                    #[test]
                    fn [<write_through_ $name _is_seen_by_both_directions>]() -> eyre::Result<()> {
                        testing::init_logging();
                        let mut sys = System::new(testing::small_config())?;
                        let geometry = *sys.cache.geometry();
                        // word 2 of row 3, word 3 of column 0x10
                        let addr = 3 * 512 + 16;
                        sys.write(addr, $write, 0x1234)?;

                        let block = geometry.block_align(addr, $read);
                        let values = sys.read_words(block, $read, geometry.words_per_block())?;
                        diff::assert_eq!(values[geometry.word_index(addr, $read)], 0x1234);
                        diff::assert_eq!(sys.read(addr, $write)?, 0x1234);

                        sys.write(addr, $read, 0x5678)?;
                        diff::assert_eq!(sys.read(addr, $write)?, 0x5678);
                        sys.run()?;
                        assert!(sys.cache.is_idle());
                        Ok(())
                    }
                }
            )*
        }
    }

    cross_direction_checks! {
        row: (Direction::Row, Direction::Column),
        column: (Direction::Column, Direction::Row),
    }
}
