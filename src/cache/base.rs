//! Memory side plumbing: blocking, the send event and queue selection.

use super::{Blocked, Cache, Slot};
use crate::{
    engine::{Event, Scheduler, Time},
    interconn::RequestPort,
    mshr::{Key, Source, Target},
    packet::{self, Command, Flags, Packet, WordMask},
};
use stats::BlockCause;

/// Entry chosen to be sent next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEntry {
    Mshr(Key),
    /// write queue entry, by order
    Write(u64),
}

impl Cache {
    pub(super) fn set_blocked(&mut self, cause: BlockCause, now: Time) {
        let flag = Blocked::from(cause);
        if self.blocked.contains(flag) {
            return;
        }
        if self.blocked.is_empty() {
            self.blocked_since = now;
        }
        log::debug!("{}: blocked on {cause:?}", self.name);
        self.blocked |= flag;
        *self.stats.blocking.count.entry(cause).or_insert(0) += 1;
    }

    pub(super) fn clear_blocked(&mut self, cause: BlockCause, sched: &mut dyn Scheduler) {
        let flag = Blocked::from(cause);
        if !self.blocked.contains(flag) {
            return;
        }
        self.blocked.remove(flag);
        if cause == BlockCause::NO_TARGETS {
            self.no_targets = None;
        }
        if !self.blocked.is_empty() {
            return;
        }
        let now = sched.now();
        *self.stats.blocking.cycles.entry(cause).or_insert(0) += now - self.blocked_since;
        log::debug!("{}: unblocked after {} cycles", self.name, now - self.blocked_since);
        if self.must_retry {
            self.must_retry = false;
            self.stats.blocking.retries += 1;
            sched.schedule(now + 1, Event::CpuRetry);
        }
    }

    /// Cause reported for a refused request.
    pub(super) fn blocked_cause(&self) -> BlockCause {
        if self.blocked.contains(Blocked::NO_MSHRS) {
            BlockCause::NO_MSHRS
        } else if self.blocked.contains(Blocked::NO_WRITE_BUFFERS) {
            BlockCause::NO_WRITE_BUFFERS
        } else {
            BlockCause::NO_TARGETS
        }
    }

    /// Clears the blocking causes an MSHR release may resolve.
    pub(super) fn mshr_released(&mut self, key: &Key, sched: &mut dyn Scheduler) {
        if !self.mshrs.is_full() {
            self.clear_blocked(BlockCause::NO_MSHRS, sched);
        }
        if self.no_targets.as_ref() == Some(key) {
            self.clear_blocked(BlockCause::NO_TARGETS, sched);
        }
    }

    pub(super) fn write_released(&mut self, sched: &mut dyn Scheduler) {
        if !self.writes.is_full() {
            self.clear_blocked(BlockCause::NO_WRITE_BUFFERS, sched);
        }
    }

    /// Schedules the send event at `time` unless it already fires earlier.
    pub(super) fn schedule_mem_send(&mut self, time: Time, sched: &mut dyn Scheduler) {
        if self.waiting_on_retry {
            return;
        }
        let now = sched.now();
        let earliest = self.last_send.map_or(now, |last| (last + 1).max(now));
        let time = time.max(earliest);
        if let Some((id, at)) = self.send_event {
            if sched.is_scheduled(id) {
                if at <= time {
                    return;
                }
                sched.deschedule(id);
            }
        }
        let id = sched.schedule(time, Event::MemSideSend);
        self.send_event = Some((id, time));
    }

    /// Earliest time an entry of either queue, or a prefetch, is ready.
    fn next_send_time(&self) -> Option<Time> {
        let prefetch = if self.mshrs.can_prefetch() {
            self.prefetcher.as_ref().and_then(|p| p.next_ready_time())
        } else {
            None
        };
        [
            self.mshrs.next_ready_time(),
            self.writes.next_ready_time(),
            prefetch,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Earliest time after `now` a queue entry becomes ready.
    ///
    /// Entries that are ready already but held back behind an older conflict
    /// are skipped, the response that releases them reschedules the send.
    fn next_send_time_after(&self, now: Time) -> Option<Time> {
        let prefetch = if self.mshrs.can_prefetch() {
            self.prefetcher
                .as_ref()
                .and_then(|p| p.next_ready_time())
                .filter(|&time| time > now)
        } else {
            None
        };
        [
            self.mshrs.next_ready_after(now),
            self.writes.next_ready_after(now),
            prefetch,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Schedules the send event for the next entry that becomes ready.
    pub(super) fn schedule_next_send(&mut self, sched: &mut dyn Scheduler) {
        if let Some(time) = self.next_send_time() {
            self.schedule_mem_send(time, sched);
        }
    }

    /// Puts a packet into the write queue.
    pub(super) fn allocate_write_buffer(
        &mut self,
        pkt: Packet,
        ready_time: Time,
        order: u64,
        sched: &mut dyn Scheduler,
    ) {
        let block_addr = pkt.block_addr(&self.geometry);
        self.writes.allocate(pkt, block_addr, ready_time, order);
        if self.writes.is_full() {
            self.set_blocked(BlockCause::NO_WRITE_BUFFERS, sched.now());
        }
        self.schedule_mem_send(ready_time, sched);
    }

    /// Writeback of the dirty words of a block, the block becomes clean.
    pub(super) fn writeback_block(&mut self, slot: Slot, now: Time) -> Packet {
        let block_size = self.geometry.block_size();
        let block = self.block_mut(slot);
        let dirty = block.is_dirty();
        let mut pkt = packet::Builder {
            cmd: if dirty {
                Command::WritebackDirty
            } else {
                Command::WritebackClean
            },
            addr: block.addr,
            dir: block.dir,
            size: block_size,
            secure: block.is_secure(),
            data: Some(block.data().to_vec()),
            issued_at: now,
            ..packet::Builder::default()
        }
        .build();
        pkt.word_dirty = Some(block.dirty_words().clone());
        if !block.is_writable() {
            pkt.flags |= Flags::HAS_SHARERS;
        }
        block.clear_dirty();
        self.stats.writebacks += 1;
        pkt
    }

    pub(super) fn clean_evict_block(&mut self, slot: Slot, now: Time) -> Packet {
        let block_size = self.geometry.block_size();
        let block = self.block(slot);
        let pkt = packet::Builder {
            cmd: Command::CleanEvict,
            addr: block.addr,
            dir: block.dir,
            size: block_size,
            secure: block.is_secure(),
            issued_at: now,
            ..packet::Builder::default()
        }
        .build();
        self.stats.clean_evicts += 1;
        pkt
    }

    /// Writes back (or clean evicts) a block and invalidates it.
    pub(super) fn evict_block(&mut self, slot: Slot, order: u64, sched: &mut dyn Scheduler) {
        let now = sched.now();
        let block = self.block(slot);
        if !block.is_valid() {
            return;
        }
        let pkt = if block.is_dirty() || self.config.writeback_clean {
            self.writeback_block(slot, now)
        } else {
            self.clean_evict_block(slot, now)
        };
        log::trace!("{}: evict {} as {pkt}", self.name, self.block(slot));
        self.invalidate_slot(slot);
        self.allocate_write_buffer(pkt, now, order, sched);
    }

    /// Request sent downstream for an MSHR.
    pub(super) fn create_miss_packet(&self, key: &Key, now: Time) -> Packet {
        let Some(mshr) = self.mshrs.get(key) else {
            panic!("{}: creating miss packet for missing MSHR {key}", self.name);
        };
        let first = mshr
            .targets
            .front()
            .and_then(|id| self.mshrs.target(id))
            .map(|target| target.pkt.cmd);
        let block_valid = self
            .tags
            .find_block(key.block_addr, key.dir, key.secure)
            .is_some();
        let needs_writable = mshr.needs_writable();
        let cmd = if block_valid && needs_writable {
            Command::UpgradeReq
        } else if first == Some(Command::InvalidateReq) {
            Command::InvalidateReq
        } else if needs_writable {
            Command::ReadExReq
        } else if first == Some(Command::ReadCleanReq) {
            Command::ReadCleanReq
        } else {
            Command::ReadSharedReq
        };
        packet::Builder {
            cmd,
            addr: key.block_addr,
            dir: key.dir,
            size: self.geometry.block_size(),
            secure: key.secure,
            issued_at: now,
            ..packet::Builder::default()
        }
        .build()
    }

    /// Picks the entry to send next.
    ///
    /// MSHRs go before writes, unless the write queue is full. An entry
    /// never overtakes an older entry of the other queue that shares a word
    /// with it.
    pub(super) fn next_queue_entry(&mut self, sched: &mut dyn Scheduler) -> Option<QueueEntry> {
        let now = sched.now();
        loop {
            let mshr = self.mshrs.get_next(now).map(|m| (m.key, m.order));
            let write = self
                .writes
                .get_next(now)
                .map(|w| (w.order, w.block_addr, w.dir(), w.secure()));

            if let Some((order, block_addr, dir, secure)) = write {
                if self.writes.is_full() || mshr.is_none() {
                    let conflict = self
                        .mshrs
                        .iter()
                        .filter(|m| !m.in_service && m.order < order && m.key.secure == secure)
                        .filter(|m| {
                            self.geometry
                                .blocks_intersect(m.key.block_addr, m.key.dir, block_addr, dir)
                        })
                        .min_by_key(|m| m.order)
                        .map(|m| m.key);
                    match conflict {
                        None => return Some(QueueEntry::Write(order)),
                        Some(key) if mshr.is_some_and(|(k, _)| k == key) => {
                            return Some(QueueEntry::Mshr(key));
                        }
                        Some(key) => {
                            log::trace!("{}: write {order} waits for MSHR {key}", self.name);
                            if mshr.is_none() {
                                return None;
                            }
                        }
                    }
                }
            }

            if let Some((key, order)) = mshr {
                if let Some(write) = self.writes.find_older_conflict(
                    &self.geometry,
                    key.block_addr,
                    key.dir,
                    key.secure,
                    order,
                ) {
                    return Some(QueueEntry::Write(write.order));
                }
                return Some(QueueEntry::Mshr(key));
            }

            if !self.allocate_prefetch(sched) {
                return None;
            }
        }
    }

    /// Turns the next ready prefetch into an MSHR.
    ///
    /// Returns false if nothing was allocated.
    fn allocate_prefetch(&mut self, sched: &mut dyn Scheduler) -> bool {
        let now = sched.now();
        if !self.mshrs.can_prefetch() {
            return false;
        }
        loop {
            let Some(pkt) = self
                .prefetcher
                .as_mut()
                .and_then(|p| p.next_prefetch(now))
            else {
                return false;
            };
            let block_addr = pkt.block_addr(&self.geometry);
            let redundant = self
                .tags
                .find_block(block_addr, pkt.dir, pkt.secure)
                .is_some()
                || self.mshrs.find(block_addr, pkt.dir, pkt.secure).is_some()
                || self
                    .writes
                    .find_match(block_addr, pkt.dir, pkt.secure)
                    .is_some();
            if redundant {
                self.stats.mshr.redundant_prefetches += 1;
                continue;
            }
            log::debug!("{}: prefetch {pkt}", self.name);
            self.fetch_pass(block_addr, pkt.dir, pkt.secure, &WordMask::new(), sched);
            let key = Key::block(block_addr, pkt.dir, pkt.secure);
            let order = self.next_order();
            let target = Target::new(pkt, Source::Prefetcher, now, order);
            self.mshrs.allocate(key, target, now);
            self.stats.mshr.issued_prefetches += 1;
            if self.mshrs.is_full() {
                self.set_blocked(BlockCause::NO_MSHRS, now);
            }
            return true;
        }
    }

    /// Handles the send event.
    pub fn send_next(&mut self, port: &mut dyn RequestPort, sched: &mut dyn Scheduler) {
        self.send_event = None;
        if self.waiting_on_retry {
            return;
        }
        let sent = match self.next_queue_entry(sched) {
            Some(QueueEntry::Mshr(key)) => self.send_mshr_packet(&key, port, sched),
            Some(QueueEntry::Write(order)) => self.send_write_packet(order, port, sched),
            None => {
                // whatever is ready waits for a response
                let now = sched.now();
                if let Some(time) = self.next_send_time_after(now) {
                    self.schedule_mem_send(time, sched);
                }
                return;
            }
        };
        if !sent {
            log::debug!("{}: memory side refused, waiting for retry", self.name);
            self.waiting_on_retry = true;
            return;
        }
        self.schedule_next_send(sched);
    }

    /// Memory accepts requests again.
    pub fn recv_req_retry(&mut self, port: &mut dyn RequestPort, sched: &mut dyn Scheduler) {
        self.waiting_on_retry = false;
        self.send_next(port, sched);
    }

    fn send_mshr_packet(
        &mut self,
        key: &Key,
        port: &mut dyn RequestPort,
        sched: &mut dyn Scheduler,
    ) -> bool {
        let now = sched.now();
        let Some(mshr) = self.mshrs.get(key) else {
            return true;
        };
        let is_forward = mshr.is_forward;
        let Some(first) = mshr
            .targets
            .front()
            .and_then(|id| self.mshrs.target(id))
            .cloned()
        else {
            panic!("{}: sending MSHR {key} without targets", self.name);
        };

        if first.source == Source::Prefetcher {
            if let Some(upper) = self.upper.as_mut() {
                let mut probe = first.pkt.clone();
                upper.snoop(&mut probe);
                if probe.flags.contains(Flags::BLOCK_CACHED) {
                    log::debug!("{}: squashing prefetch {key}", self.name);
                    self.mshrs.deallocate(key);
                    self.stats.mshr.squashed_prefetches += 1;
                    self.mshr_released(key, sched);
                    return true;
                }
            }
        }

        let pkt = if is_forward {
            first.pkt
        } else {
            self.create_miss_packet(key, now)
        };
        log::debug!("{}: send {pkt} for MSHR {key}", self.name);
        if !port.send_timing_req(pkt.clone(), sched) {
            return false;
        }
        self.last_send = Some(now);
        let pending_modified = pkt.needs_writable();
        self.mshrs.mark_in_service(key, pending_modified);
        true
    }

    fn send_write_packet(
        &mut self,
        order: u64,
        port: &mut dyn RequestPort,
        sched: &mut dyn Scheduler,
    ) -> bool {
        let Some(entry) = self.writes.iter().find(|e| e.order == order) else {
            return true;
        };
        let pkt = entry.pkt.clone();
        log::debug!("{}: send {pkt} from write queue", self.name);
        if !port.send_timing_req(pkt, sched) {
            return false;
        }
        self.last_send = Some(sched.now());
        self.writes.mark_in_service(order);
        self.write_released(sched);
        true
    }
}

