//! CPU side requests, misses and fills.

use super::{Cache, Slot};
use crate::{
    address,
    direction::Direction,
    engine::{Event, Scheduler, Time},
    mshr::{Key, Source, Target},
    packet::{Command, Flags, Packet, WordMask},
    tag_array::BlockId,
};
use stats::{BlockCause, RequestStatus};

/// Outcome of a lookup on the CPU side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub satisfied: bool,
    pub latency: u64,
    /// served by the block of the other direction
    pub cross: bool,
}

impl Cache {
    /// Offers a request from the CPU side.
    ///
    /// A blocked cache hands the packet back. The requester keeps it until
    /// [`Event::CpuRetry`] and sends it again.
    pub fn recv_timing_req(&mut self, mut pkt: Packet, sched: &mut dyn Scheduler) -> Result<(), Packet> {
        let now = sched.now();
        assert!(pkt.cmd.is_request(), "{}: {pkt} is not a request", self.name);
        assert!(
            self.config.supports_dual_direction || pkt.dir == Direction::Row,
            "{}: column access {pkt} to a row only cache",
            self.name
        );
        if !self.blocked.is_empty() {
            let cause = self.blocked_cause();
            log::debug!("{}: refusing {pkt} ({cause:?})", self.name);
            self.stats.inc(pkt.dir, pkt.cmd.access_kind(), cause, 1);
            self.stats.blocking.rejected += 1;
            self.must_retry = true;
            return Err(pkt);
        }
        log::debug!("{}: recv_timing_req({pkt})", self.name);

        if pkt.uncacheable {
            self.handle_uncacheable(pkt, sched);
            return Ok(());
        }

        let access = self.access(&mut pkt, sched);
        if let Some(prefetcher) = self.prefetcher.as_mut() {
            prefetcher.notify(&pkt, !access.satisfied, now);
        }
        if access.satisfied {
            let status = if access.cross {
                RequestStatus::CROSS_HIT
            } else {
                RequestStatus::HIT
            };
            self.stats.inc(pkt.dir, pkt.cmd.access_kind(), status, 1);
            self.stats.latency.hit_total += access.latency;
            self.stats.latency.hit_count += 1;
            if pkt.needs_response() {
                respond(pkt, now + access.latency, sched);
            }
        } else {
            self.handle_miss(pkt, access.latency, sched);
        }
        self.schedule_next_send(sched);
        Ok(())
    }

    /// Looks up a request and satisfies it if the cached block permits.
    pub(super) fn access(&mut self, pkt: &mut Packet, sched: &mut dyn Scheduler) -> Access {
        let now = sched.now();
        let geometry = self.geometry;
        let lookup = if self.config.supports_dual_direction && pkt.is_single_word(&geometry) {
            self.tags
                .access_block_one_word(pkt.addr, pkt.dir, pkt.secure, now)
        } else {
            self.tags.access_block(pkt.addr, pkt.dir, pkt.secure, now)
        };
        let mut access = Access {
            satisfied: false,
            latency: lookup.latency,
            cross: lookup.cross,
        };

        if pkt.is_eviction() {
            let own = lookup.block.filter(|&id| self.tags.block(id).dir == pkt.dir);
            access.satisfied = self.access_eviction(pkt, own, sched);
            access.cross = false;
            return access;
        }

        let Some(id) = lookup.block else {
            return access;
        };
        // a pending miss keeps later requests to the block behind it
        let block_addr = pkt.block_addr(&geometry);
        if self.mshrs.find(block_addr, pkt.dir, pkt.secure).is_some() {
            return access;
        }
        let block = self.tags.block(id);
        let permitted = if pkt.needs_writable() {
            block.is_writable()
        } else {
            block.is_readable()
        };
        if !permitted {
            return access;
        }
        if pkt.needs_writable() {
            if self.has_cross_mshr(id, pkt) {
                self.stats.consistency.ordered_write_hits += 1;
                return access;
            }
        } else if self.has_cross_write(id, pkt) {
            self.stats.consistency.ordered_read_hits += 1;
            return access;
        }

        let slot = Slot::Tag(id);
        if self.block(slot).was_prefetched() {
            self.block_mut(slot).set_prefetched(false);
            self.stats.mshr.useful_prefetches += 1;
        }
        self.satisfy_request(pkt, slot, sched);
        self.maintain_clusivity(pkt.from_cache(), slot);
        access.satisfied = true;
        access
    }

    /// Whether a word a request touches is pending in the other direction.
    fn has_cross_mshr(&self, id: BlockId, pkt: &Packet) -> bool {
        let block = self.tags.block(id);
        block.words_of(pkt, &self.geometry).any(|word| {
            let (cross_addr, _) = self.geometry.cross_word(block.addr, block.dir, word);
            self.mshrs
                .find(cross_addr, block.dir.opposite(), block.is_secure())
                .is_some()
        })
    }

    /// Whether a word a request touches is about to be written by a pending
    /// miss of the other direction.
    fn has_cross_write(&self, id: BlockId, pkt: &Packet) -> bool {
        let block = self.tags.block(id);
        block.words_of(pkt, &self.geometry).any(|word| {
            let (cross_addr, cross_word) = self.geometry.cross_word(block.addr, block.dir, word);
            let key = Key::block(cross_addr, block.dir.opposite(), block.is_secure());
            self.mshrs.writes_word(&key, cross_word, &self.geometry)
        })
    }

    /// Absorbs an eviction from the level above.
    ///
    /// Returns false if the eviction must be forwarded.
    fn access_eviction(
        &mut self,
        pkt: &Packet,
        block: Option<BlockId>,
        sched: &mut dyn Scheduler,
    ) -> bool {
        let geometry = self.geometry;
        let block_addr = pkt.block_addr(&geometry);
        if pkt.cmd == Command::CleanEvict {
            return block.is_some();
        }
        let id = match block {
            Some(id) => id,
            None => match self.allocate_block(block_addr, pkt.dir, pkt.secure, sched) {
                Some(id) => {
                    self.tags.block_mut(id).set_readable(true);
                    id
                }
                None => return false,
            },
        };
        let Some(data) = &pkt.data else {
            panic!("{}: {pkt} carries no data", self.name);
        };
        if pkt.cmd == Command::WritebackDirty {
            let dirty = pkt
                .word_dirty
                .clone()
                .unwrap_or_else(|| WordMask::repeat(true, geometry.words_per_block()));
            let words: Vec<usize> = dirty.iter_ones().collect();
            self.invalidate_cross_for_write(block_addr, pkt.dir, pkt.secure, &words, sched);
            let block = self.tags.block_mut(id);
            block.copy_block(data);
            block.set_dirty_words(&dirty);
            if !pkt.has_sharers() {
                block.set_writable(true);
            }
        } else if !self.tags.block(id).is_dirty() {
            self.tags.block_mut(id).copy_block(data);
        }
        true
    }

    /// Applies a request to a valid block.
    pub(super) fn satisfy_request(
        &mut self,
        pkt: &mut Packet,
        slot: Slot,
        sched: &mut dyn Scheduler,
    ) {
        let geometry = self.geometry;
        let block = self.block(slot);
        assert!(block.is_valid(), "{}: {pkt} satisfied by invalid {block}", self.name);

        if pkt.is_write() {
            assert!(
                block.is_writable(),
                "{}: {pkt} writes to a non-writable {block}",
                self.name
            );
            let (addr, dir, secure) = (block.addr, block.dir, block.is_secure());
            let words: Vec<usize> = block.words_of(pkt, &geometry).collect();
            self.invalidate_cross_for_write(addr, dir, secure, &words, sched);

            let block = self.block_mut(slot);
            if !block.check_write(pkt, &geometry) {
                // a failed store conditional leaves the data alone
                block.touch_dirty(pkt, &geometry);
            } else if pkt.cmd == Command::SwapReq {
                let mut old = pkt.clone();
                old.data = None;
                block.read_into(&mut old, &geometry);
                block.write_from(pkt, &geometry);
                pkt.data = old.data;
            } else {
                block.write_from(pkt, &geometry);
            }
        } else if pkt.is_read() {
            let block = self.block_mut(slot);
            if pkt.cmd == Command::LoadLockedReq {
                block.track_load_locked(pkt, &geometry);
            }
            block.read_into(pkt, &geometry);
            if pkt.from_cache() {
                self.grant_to_upper(pkt, slot);
            }
        } else if matches!(pkt.cmd, Command::UpgradeReq | Command::InvalidateReq) {
            // the level above takes the only copy
            let order = self.next_order();
            self.evict_block(slot, order, sched);
        }
    }

    /// Coherence state handed to a cache above along with a read.
    fn grant_to_upper(&mut self, pkt: &mut Packet, slot: Slot) {
        let block = self.block_mut(slot);
        let pass_ownership = if pkt.needs_writable() {
            true
        } else if pkt.cmd != Command::ReadCleanReq && block.is_writable() && !pkt.has_sharers() {
            true
        } else {
            pkt.flags |= Flags::HAS_SHARERS;
            false
        };
        if pass_ownership && block.is_dirty() {
            pkt.flags |= Flags::CACHE_RESPONDING;
            pkt.word_dirty = Some(block.dirty_words().clone());
            block.clear_dirty();
        }
    }

    fn alloc_on_fill(&self, pkt: &Packet) -> bool {
        !(self.config.is_mostly_exclusive() && pkt.from_cache())
    }

    /// Drops clean blocks a cache above now holds.
    fn maintain_clusivity(&mut self, from_cache: bool, slot: Slot) {
        let block = self.block(slot);
        if from_cache
            && self.config.is_mostly_exclusive()
            && block.is_valid()
            && !block.is_dirty()
        {
            log::trace!("{}: dropping {block} held above", self.name);
            self.invalidate_slot(slot);
        }
    }

    fn handle_miss(&mut self, pkt: Packet, latency: u64, sched: &mut dyn Scheduler) {
        let now = sched.now();
        let geometry = self.geometry;
        let ready = now + latency;
        let (dir, kind) = (pkt.dir, pkt.cmd.access_kind());
        let block_addr = pkt.block_addr(&geometry);

        if pkt.is_eviction() {
            self.stats.inc(dir, kind, RequestStatus::MISS, 1);
            let order = self.next_order();
            self.allocate_write_buffer(pkt, ready, order, sched);
            return;
        }

        let key = Key::block(block_addr, pkt.dir, pkt.secure);
        let source = if pkt.cmd.is_prefetch() {
            Source::Prefetcher
        } else {
            Source::Cpu
        };
        let alloc_on_fill = self.alloc_on_fill(&pkt);

        if self.mshrs.contains(&key) {
            self.stats.inc(dir, kind, RequestStatus::MSHR_HIT, 1);
            self.stats.mshr.hits += 1;
            if pkt.needs_writable() {
                let written: Vec<usize> = pkt.words(&geometry).collect();
                self.invalidate_written_cross(block_addr, pkt.dir, pkt.secure, &written, sched);
            }
            let order = self.next_order();
            let mut target = Target::new(pkt, source, ready, order);
            target.recv_time = now;
            target.alloc_on_fill = alloc_on_fill;
            let allocated = self.mshrs.allocate_target(&key, target);
            if allocated.deferred {
                self.stats.mshr.deferred_targets += 1;
            }
            if allocated.bonus {
                self.stats.mshr.bonus_targets += 1;
            }
            self.mark_target(&key, allocated.id);
            if self.mshrs.is_target_full(&key) {
                self.no_targets = Some(key);
                self.set_blocked(BlockCause::NO_TARGETS, now);
            }
            return;
        }

        self.stats.inc(dir, kind, RequestStatus::MISS, 1);
        self.stats.mshr.misses += 1;
        let mut written = WordMask::repeat(false, geometry.words_per_block());
        if pkt.needs_writable() {
            for word in pkt.words(&geometry) {
                written.set(word, true);
            }
        }
        self.fetch_pass(block_addr, pkt.dir, pkt.secure, &written, sched);
        if let Some(id) = self.tags.find_block(block_addr, pkt.dir, pkt.secure) {
            // reads of the block queue behind the upgrade
            self.tags.block_mut(id).set_readable(false);
        }

        let order = self.next_order();
        let mut target = Target::new(pkt, source, ready, order);
        target.recv_time = now;
        target.alloc_on_fill = alloc_on_fill;
        let id = self.mshrs.allocate(key, target, ready);
        self.mark_target(&key, id);
        if self.mshrs.is_full() {
            self.set_blocked(BlockCause::NO_MSHRS, now);
        }
        self.schedule_mem_send(ready, sched);
    }

    fn mark_target(&mut self, key: &Key, id: crate::mshr::TargetId) {
        let marked = self.mshrs.mark_block_info(key, id, &self.geometry);
        self.stats.consistency.mshr_conflicts += marked.conflicts as u64;
        if marked.blocked {
            self.stats.mshr.blocked_targets += 1;
        }
    }

    /// Forwards an uncacheable request after flushing cached copies of its
    /// words.
    fn handle_uncacheable(&mut self, pkt: Packet, sched: &mut dyn Scheduler) {
        let now = sched.now();
        let geometry = self.geometry;
        self.stats
            .inc(pkt.dir, pkt.cmd.access_kind(), RequestStatus::UNCACHEABLE, 1);
        self.stats.mshr.uncacheable += 1;
        let ready = now + self.config.forward_latency;
        let block_addr = pkt.block_addr(&geometry);

        if let Some(id) = self.tags.find_block(block_addr, pkt.dir, pkt.secure) {
            let order = self.next_order();
            self.evict_block(Slot::Tag(id), order, sched);
        }
        if self.config.supports_dual_direction {
            for word in pkt.words(&geometry) {
                let (cross_addr, _) = geometry.cross_word(block_addr, pkt.dir, word);
                if let Some(id) = self.tags.find_block(cross_addr, pkt.dir.opposite(), pkt.secure) {
                    let order = self.next_order();
                    self.evict_block(Slot::Tag(id), order, sched);
                }
            }
        }

        let order = self.next_order();
        if pkt.is_write() {
            self.allocate_write_buffer(pkt, ready, order, sched);
            return;
        }
        let key = Key {
            forward: Some(pkt.id),
            ..Key::block(block_addr, pkt.dir, pkt.secure)
        };
        let mut target = Target::new(pkt, Source::Cpu, ready, order);
        target.recv_time = now;
        target.alloc_on_fill = false;
        self.mshrs.allocate(key, target, ready);
        if self.mshrs.is_full() {
            self.set_blocked(BlockCause::NO_MSHRS, now);
        }
        self.schedule_mem_send(ready, sched);
    }

    /// Handles a response from memory.
    pub fn recv_timing_resp(&mut self, mut pkt: Packet, sched: &mut dyn Scheduler) {
        assert!(pkt.is_response(), "{}: {pkt} is not a response", self.name);
        log::debug!("{}: recv_timing_resp({pkt})", self.name);
        if pkt.uncacheable {
            self.handle_uncacheable_resp(pkt, sched);
            self.schedule_next_send(sched);
            return;
        }

        let geometry = self.geometry;
        let key = Key::block(pkt.block_addr(&geometry), pkt.dir, pkt.secure);
        let Some(mshr) = self.mshrs.get(&key) else {
            panic!("{}: {pkt} matches no MSHR", self.name);
        };
        assert!(mshr.in_service, "{}: {pkt} for MSHR {key} not in service", self.name);
        if mshr.stale.any() {
            pkt.stale_words = Some(mshr.stale.clone());
        }
        let (post_invalidate, post_downgrade, alloc_on_fill) =
            (mshr.post_invalidate, mshr.post_downgrade, mshr.alloc_on_fill);

        let slot = if pkt.cmd.has_data() {
            self.handle_fill(&pkt, &key, alloc_on_fill, sched)
        } else if let Some(id) = self.tags.find_block(key.block_addr, key.dir, key.secure) {
            let block = self.tags.block_mut(id);
            block.set_readable(true);
            if !pkt.has_sharers() {
                block.set_writable(true);
            }
            Slot::Tag(id)
        } else {
            // the block was invalidated while the upgrade was in flight
            log::debug!("{}: upgrade {key} lost its block, refetching", self.name);
            self.reissue(&key, sched);
            self.schedule_next_send(sched);
            return;
        };

        if self.block(slot).is_writable() {
            self.mshrs.promote_writable(&key);
        }

        let mut post_writeback = None;
        let mut post_target_invalidate = None;
        let mut from_cache = false;
        for id in self.mshrs.extract_serviceable_targets(&key, &pkt, &geometry) {
            let Some(target) = self.mshrs.retire_target(id) else {
                continue;
            };
            if target.post_invalidate {
                post_target_invalidate.get_or_insert(target.order);
            } else if target.post_writeback {
                post_writeback.get_or_insert(target.order);
            }
            match target.source {
                Source::Cpu => {
                    from_cache |= target.pkt.from_cache();
                    self.service_cpu_target(target, slot, sched);
                }
                Source::Prefetcher => {
                    if self.block(slot).is_valid() {
                        self.block_mut(slot).set_prefetched(true);
                    }
                }
                Source::Snoop => {
                    let mut snoop = target.pkt;
                    self.snoop_block(&mut snoop, Some(slot), true);
                }
            }
        }
        self.maintain_clusivity(from_cache, slot);
        self.service_obligations(slot, post_writeback, post_target_invalidate, sched);

        // a fill holding words written in the other direction must not stay
        let stale = pkt.stale_words.as_ref().is_some_and(|stale| stale.any());
        if self.block(slot).is_valid() {
            if post_invalidate || stale || pkt.cmd == Command::ReadRespWithInvalidate {
                let order = self.next_order();
                self.evict_block(slot, order, sched);
            } else if post_downgrade {
                self.block_mut(slot).set_writable(false);
            }
        }
        if slot == Slot::Temp && self.temp.is_valid() {
            let order = self.next_order();
            self.evict_block(Slot::Temp, order, sched);
        }

        if !self.reissue(&key, sched) {
            self.mshrs.deallocate(&key);
            self.mshr_released(&key, sched);
        }
        self.schedule_next_send(sched);
    }

    /// Sends an MSHR again for its remaining and deferred targets.
    ///
    /// Returns false if the MSHR has no targets left.
    fn reissue(&mut self, key: &Key, sched: &mut dyn Scheduler) -> bool {
        let now = sched.now();
        let order = self.next_order();
        if !self.mshrs.promote_deferred_targets(key, now, order) {
            return false;
        }
        self.stats.mshr.refetches += 1;
        let written = self.written_words(key);
        self.fetch_pass(key.block_addr, key.dir, key.secure, &written, sched);
        if let Some(id) = self.tags.find_block(key.block_addr, key.dir, key.secure) {
            self.tags.block_mut(id).set_readable(false);
        }
        let ready = self.mshrs.get(key).map_or(now, |mshr| mshr.ready_time);
        log::debug!("{}: reissue MSHR {key} with order {order}", self.name);
        self.schedule_mem_send(ready, sched);
        true
    }

    fn service_cpu_target(&mut self, target: Target, slot: Slot, sched: &mut dyn Scheduler) {
        let now = sched.now();
        let mut pkt = target.pkt;
        if self.block(slot).was_prefetched() {
            self.block_mut(slot).set_prefetched(false);
            self.stats.mshr.useful_prefetches += 1;
        }
        self.satisfy_request(&mut pkt, slot, sched);
        let completion = (now + self.config.response_latency).max(self.block(slot).when_ready);
        self.stats.latency.miss_total += completion - target.recv_time;
        self.stats.latency.miss_count += 1;
        if pkt.needs_response() {
            respond(pkt, completion, sched);
        }
    }

    /// Installs the data of a response.
    fn handle_fill(
        &mut self,
        pkt: &Packet,
        key: &Key,
        alloc_on_fill: bool,
        sched: &mut dyn Scheduler,
    ) -> Slot {
        let now = sched.now();
        let geometry = self.geometry;
        assert_eq!(
            pkt.size,
            geometry.block_size(),
            "{}: fill {pkt} is not block sized",
            self.name
        );
        let slot = match self.tags.find_block(key.block_addr, key.dir, key.secure) {
            Some(id) => Slot::Tag(id),
            None if alloc_on_fill => self
                .allocate_block(key.block_addr, key.dir, key.secure, sched)
                .map_or(Slot::Temp, Slot::Tag),
            None => Slot::Temp,
        };
        if slot == Slot::Temp {
            self.stats.temp_block_fills += 1;
            let temp = &mut self.temp;
            temp.invalidate();
            temp.tag = geometry.block_number(key.block_addr, key.dir);
            temp.addr = key.block_addr;
            temp.dir = key.dir;
            temp.set_valid();
            temp.set_secure(key.secure);
        }

        let writable = !pkt.has_sharers();
        let when_ready = now + self.config.data_latency;
        let block = self.block_mut(slot);
        if let Some(data) = &pkt.data {
            block.merge_fill(data);
        }
        block.set_readable(true);
        block.set_writable(writable);
        if writable && pkt.cache_responding() {
            match &pkt.word_dirty {
                Some(dirty) => {
                    for word in dirty.iter_ones() {
                        block.set_word_dirty(word);
                    }
                }
                None => block.set_all_dirty(),
            }
        }
        block.when_ready = when_ready;
        log::trace!("{}: fill {}", self.name, self.block(slot));
        self.stats.fills += 1;
        slot
    }

    /// Finds room for a block, evicting the victim and its way group.
    ///
    /// Returns `None` if every candidate has a pending miss.
    pub(super) fn allocate_block(
        &mut self,
        addr: address,
        dir: Direction,
        secure: bool,
        sched: &mut dyn Scheduler,
    ) -> Option<BlockId> {
        let now = sched.now();
        let mshrs = &self.mshrs;
        let victim = self
            .tags
            .find_victim(addr, dir, |block| Self::is_pinned(mshrs, block))?;
        for id in victim.companions {
            if self.tags.block(id).is_valid() {
                self.stats.consistency.tile_evictions += 1;
                let order = self.next_order();
                self.evict_block(Slot::Tag(id), order, sched);
            }
        }
        if self.tags.block(victim.id).is_valid() {
            self.stats.replacements += 1;
            let order = self.next_order();
            self.evict_block(Slot::Tag(victim.id), order, sched);
        }
        self.tags.insert_block(victim.id, addr, dir, secure, now);
        Some(victim.id)
    }

    fn handle_uncacheable_resp(&mut self, pkt: Packet, sched: &mut dyn Scheduler) {
        let now = sched.now();
        if matches!(
            pkt.cmd,
            Command::WriteResp | Command::SwapResp | Command::StoreCondResp
        ) {
            if self.writes.deallocate_by_packet(pkt.id).is_none() {
                panic!("{}: {pkt} matches no write queue entry", self.name);
            }
            self.write_released(sched);
        } else {
            let key = Key {
                forward: Some(pkt.id),
                ..Key::block(pkt.block_addr(&self.geometry), pkt.dir, pkt.secure)
            };
            if self.mshrs.deallocate(&key).is_none() {
                panic!("{}: {pkt} matches no MSHR", self.name);
            }
            self.mshr_released(&key, sched);
        }
        respond(pkt, now + self.config.response_latency, sched);
    }
}

/// Schedules the response to a CPU request.
fn respond(mut pkt: Packet, time: Time, sched: &mut dyn Scheduler) {
    if !pkt.is_response() {
        pkt.make_response();
    }
    if !pkt.cmd.has_data() {
        pkt.data = None;
    }
    sched.schedule(time, Event::CpuResponse(pkt));
}
