//! Snoops arriving from the memory side.

use super::{Cache, Slot};
use crate::{
    address,
    engine::Scheduler,
    mshr::Key,
    packet::{Command, Flags, Packet},
};

impl Cache {
    /// Resolves a snoop against the pending misses, the write queue and the
    /// cached block.
    ///
    /// Flags are set on `pkt` in place. A response carrying data is queued
    /// and handed out by [`Cache::take_snoop_responses`].
    pub fn handle_snoop(&mut self, pkt: &mut Packet, sched: &mut dyn Scheduler) {
        let now = sched.now();
        let geometry = self.geometry;
        let block_addr = pkt.block_addr(&geometry);
        self.stats.snoop.received += 1;
        log::debug!("{}: handle_snoop({pkt})", self.name);

        if pkt.cmd.is_prefetch() {
            // a probe only asks whether the block is here
            if self.tags.find_block(block_addr, pkt.dir, pkt.secure).is_some() {
                pkt.flags |= Flags::BLOCK_CACHED;
            }
            return;
        }

        if self.config.forward_snoops {
            if let Some(upper) = self.upper.as_mut() {
                upper.snoop(pkt);
                self.stats.snoop.forwarded += 1;
            }
        }

        if pkt.is_invalidate() {
            self.invalidate_cross_for_snoop(block_addr, pkt.dir, pkt.secure, sched);
        }

        let key = Key::block(block_addr, pkt.dir, pkt.secure);
        let order = self.next_order();
        if self.mshrs.handle_snoop(&key, pkt, order, now) {
            log::trace!("{}: snoop {pkt} deferred to MSHR {key}", self.name);
            self.stats.snoop.deferred += 1;
            return;
        }

        if self.snoop_write_queue(pkt, block_addr, sched) {
            return;
        }

        let slot = self
            .tags
            .find_block(block_addr, pkt.dir, pkt.secure)
            .map(Slot::Tag);
        self.snoop_block(pkt, slot, false);
    }

    /// A pending writeback of the block answers the snoop.
    fn snoop_write_queue(
        &mut self,
        pkt: &mut Packet,
        block_addr: address,
        sched: &mut dyn Scheduler,
    ) -> bool {
        let Some(entry) = self
            .writes
            .find_match(block_addr, pkt.dir, pkt.secure)
            .filter(|entry| !entry.in_service)
        else {
            return false;
        };
        self.stats.snoop.write_buffer_hits += 1;
        let order = entry.order;
        let responds = entry.pkt.cmd == Command::WritebackDirty
            && pkt.needs_response()
            && !pkt.cache_responding();
        if !responds {
            return false;
        }

        let offset = self.geometry.block_offset(pkt.addr, pkt.dir) as usize;
        let data = entry.pkt.data.as_ref().map(|data| {
            // only the part of the snoop that falls inside the block
            let end = (offset + pkt.size as usize).min(data.len());
            data[offset.min(end)..end].to_vec()
        });
        let word_dirty = entry.pkt.word_dirty.clone();

        pkt.flags |= Flags::CACHE_RESPONDING;
        let invalidate = pkt.is_invalidate();
        if !invalidate {
            pkt.flags |= Flags::HAS_SHARERS;
        }
        let mut response = pkt.clone();
        response.make_response();
        response.data = data;
        response.word_dirty = word_dirty;
        log::debug!("{}: write queue responds to {pkt}", self.name);
        self.snoop_responses.push_back(response);
        self.stats.snoop.responded += 1;

        if invalidate {
            // the requester owns the data now
            self.writes.mark_in_service(order);
            self.write_released(sched);
        }
        true
    }

    /// Applies a snoop to a cached block.
    ///
    /// A `deferred` snoop was queued behind a miss and answers if the MSHR
    /// promised a response.
    pub(super) fn snoop_block(
        &mut self,
        pkt: &mut Packet,
        slot: Option<Slot>,
        deferred: bool,
    ) {
        let Some(slot) = slot.filter(|&slot| self.block(slot).is_valid()) else {
            return;
        };
        let geometry = self.geometry;
        let invalidate = pkt.is_invalidate();
        let block = self.block(slot);
        let had_writable = block.is_writable();
        let respond = pkt.needs_response()
            && if deferred {
                pkt.cache_responding()
            } else {
                block.is_dirty() && !pkt.cache_responding()
            };

        if !invalidate && !pkt.needs_writable() {
            pkt.flags |= Flags::HAS_SHARERS;
            if had_writable {
                self.block_mut(slot).set_writable(false);
                self.stats.snoop.downgraded += 1;
            }
        }

        if respond {
            pkt.flags |= Flags::CACHE_RESPONDING;
            if had_writable {
                pkt.flags |= Flags::RESPONDER_HAD_WRITABLE;
            }
            log::debug!("{}: respond to snoop {pkt} from {}", self.name, self.block(slot));
            let mut response = pkt.clone();
            if !response.is_response() {
                response.make_response();
            }
            response.data = None;
            let block = self.block_mut(slot);
            if response.cmd.has_data() {
                block.read_into(&mut response, &geometry);
            }
            response.word_dirty = Some(block.dirty_words().clone());
            if invalidate {
                block.clear_dirty();
            }
            self.snoop_responses.push_back(response);
            self.stats.snoop.responded += 1;
        }

        if invalidate {
            log::trace!("{}: snoop {pkt} invalidates {}", self.name, self.block(slot));
            self.invalidate_slot(slot);
            self.stats.snoop.invalidated += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        direction::Direction,
        packet::{self, Command, Flags, Packet},
        testing::{self, System},
    };
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    fn snoop(cmd: Command, addr: u64, dir: Direction) -> Packet {
        packet::Builder {
            cmd,
            addr,
            dir,
            size: 64,
            ..packet::Builder::default()
        }
        .build()
    }

    #[test]
    fn invalidating_snoop_takes_modified_data() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        sys.write(0x1000, Direction::Row, 0xabcd)?;

        let mut pkt = snoop(Command::ReadExReq, 0x1000, Direction::Row);
        sys.cache.handle_snoop(&mut pkt, &mut sys.events);
        assert!(pkt.cache_responding());
        assert!(pkt.flags.contains(Flags::RESPONDER_HAD_WRITABLE));

        let responses = sys.cache.take_snoop_responses();
        diff::assert_eq!(responses.len(), 1);
        let response = &responses[0];
        diff::assert_eq!(response.cmd, Command::ReadExResp);
        diff::assert_eq!(response.value(), Some(0xabcd));
        assert!(response
            .word_dirty
            .as_ref()
            .is_some_and(|dirty| dirty[0] && dirty.count_ones() == 1));
        assert!(sys
            .cache
            .tags()
            .find_block(0x1000, Direction::Row, false)
            .is_none());
        diff::assert_eq!(sys.cache.stats().snoop.invalidated, 1);
        Ok(())
    }

    #[test]
    fn shared_snoop_downgrades_and_keeps_dirty() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        sys.write(0x1000, Direction::Row, 3)?;

        let mut pkt = snoop(Command::ReadSharedReq, 0x1000, Direction::Row);
        sys.cache.handle_snoop(&mut pkt, &mut sys.events);
        assert!(pkt.has_sharers());
        assert!(pkt.cache_responding());
        diff::assert_eq!(sys.cache.take_snoop_responses().len(), 1);

        let id = sys.cache.tags().find_block(0x1000, Direction::Row, false);
        let block = id.map(|id| sys.cache.tags().block(id));
        assert!(block.is_some_and(|b| b.is_valid() && !b.is_writable() && b.is_dirty()));
        diff::assert_eq!(sys.cache.stats().snoop.downgraded, 1);
        Ok(())
    }

    #[test]
    fn clean_block_does_not_respond() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        sys.read(0x1000, Direction::Row)?;

        let mut pkt = snoop(Command::ReadSharedReq, 0x1000, Direction::Row);
        sys.cache.handle_snoop(&mut pkt, &mut sys.events);
        assert!(!pkt.cache_responding());
        assert!(pkt.has_sharers());
        assert!(sys.cache.take_snoop_responses().is_empty());
        Ok(())
    }

    #[test]
    fn snoop_defers_behind_pending_write_miss() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        let write = sys.request(Command::WriteReq, 0x2000, Direction::Row, 8, Some(vec![9; 8]));
        sys.issue(write);
        sys.run_until(|sys| sys.cache.mshrs().iter().any(|mshr| mshr.in_service))?;

        let mut pkt = snoop(Command::ReadSharedReq, 0x2000, Direction::Row);
        sys.cache.handle_snoop(&mut pkt, &mut sys.events);
        assert!(pkt.cache_responding());
        assert!(pkt.has_sharers());
        diff::assert_eq!(sys.cache.stats().snoop.deferred, 1);
        assert!(sys.cache.take_snoop_responses().is_empty());

        sys.run()?;
        let responses = sys.cache.take_snoop_responses();
        diff::assert_eq!(responses.len(), 1);
        diff::assert_eq!(responses[0].value(), Some(u64::from_le_bytes([9; 8])));
        let id = sys.cache.tags().find_block(0x2000, Direction::Row, false);
        let block = id.map(|id| sys.cache.tags().block(id));
        assert!(block.is_some_and(|b| !b.is_writable() && b.is_dirty()));
        Ok(())
    }

    #[test]
    fn invalidating_snoop_drops_cross_copies() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        // column 0x1000 holds word 0 of rows 0x1000, 0x1200, ...
        sys.read_words(0x1000, Direction::Column, 8)?;
        let mut pkt = snoop(Command::ReadExReq, 0x1200, Direction::Row);
        sys.cache.handle_snoop(&mut pkt, &mut sys.events);
        assert!(sys
            .cache
            .tags()
            .find_block(0x1000, Direction::Column, false)
            .is_none());
        diff::assert_eq!(sys.cache.stats().consistency.cross_invalidations, 1);
        Ok(())
    }

    #[test]
    fn pending_writeback_answers_snoop_running_past_the_block() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        sys.write(0x1038, Direction::Row, 0x55)?;

        // an uncacheable read flushes the dirty block into the write queue
        let mut flush = sys.request(Command::ReadReq, 0x1038, Direction::Row, 8, None);
        flush.uncacheable = true;
        sys.issue(flush);
        sys.run_until(|sys| {
            sys.cache
                .write_queue()
                .iter()
                .any(|entry| entry.pkt.cmd == Command::WritebackDirty && !entry.in_service)
        })?;

        let mut pkt = snoop(Command::ReadSharedReq, 0x1038, Direction::Row);
        sys.cache.handle_snoop(&mut pkt, &mut sys.events);
        assert!(pkt.cache_responding());
        diff::assert_eq!(sys.cache.stats().snoop.write_buffer_hits, 1);
        let responses = sys.cache.take_snoop_responses();
        diff::assert_eq!(responses.len(), 1);
        diff::assert_eq!(responses[0].data, Some(0x55u64.to_le_bytes().to_vec()));
        sys.run()?;
        Ok(())
    }

    #[test]
    fn prefetch_probe_reports_cached_block() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        sys.read(0x3000, Direction::Row)?;
        let mut hit = snoop(Command::HardPrefetchReq, 0x3000, Direction::Row);
        sys.cache.handle_snoop(&mut hit, &mut sys.events);
        assert!(hit.flags.contains(Flags::BLOCK_CACHED));
        let mut miss = snoop(Command::HardPrefetchReq, 0x3040, Direction::Row);
        sys.cache.handle_snoop(&mut miss, &mut sys.events);
        assert!(!miss.flags.contains(Flags::BLOCK_CACHED));
        Ok(())
    }
}
