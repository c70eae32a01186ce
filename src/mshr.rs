//! Miss status handling registers.
//!
//! Targets live in an arena owned by the [`Queue`] and refer to each other
//! through generation checked [`TargetId`]s. A target is blocked while any
//! of its blockers is still alive, so servicing a target releases its
//! dependents without further bookkeeping.

use crate::{
    address,
    direction::{Direction, Geometry},
    engine::Time,
    packet::{Command, Packet, WordMask},
};
use bitvec::prelude::*;
use indexmap::IndexMap;
use std::collections::VecDeque;

/// Who is waiting for a target.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Source {
    Cpu,
    Snoop,
    Prefetcher,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TargetId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub pkt: Packet,
    pub source: Source,
    pub ready_time: Time,
    pub recv_time: Time,
    pub order: u64,
    pub alloc_on_fill: bool,
    /// the block must be written back and lose write permission after this target
    pub post_writeback: bool,
    /// the block must be invalidated after this target
    pub post_invalidate: bool,
    pub blocked_by: Vec<TargetId>,
    pub blocking: Vec<TargetId>,
}

impl Target {
    #[must_use]
    pub fn new(pkt: Packet, source: Source, ready_time: Time, order: u64) -> Self {
        Self {
            source,
            ready_time,
            recv_time: ready_time,
            order,
            alloc_on_fill: true,
            post_writeback: false,
            post_invalidate: false,
            blocked_by: Vec::new(),
            blocking: Vec::new(),
            pkt,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    target: Option<Target>,
}

/// Target storage with stale handle detection.
#[derive(Debug, Default)]
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub fn insert(&mut self, target: Target) -> TargetId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.target = Some(target);
        TargetId {
            index,
            generation: slot.generation,
        }
    }

    #[must_use]
    pub fn get(&self, id: TargetId) -> Option<&Target> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.target.as_ref()
    }

    pub fn get_mut(&mut self, id: TargetId) -> Option<&mut Target> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.target.as_mut()
    }

    #[must_use]
    pub fn contains(&self, id: TargetId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: TargetId) -> Option<Target> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let target = slot.target.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(target)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct TargetList {
    ids: VecDeque<TargetId>,
    pub needs_writable: bool,
    pub has_upgrade: bool,
}

impl TargetList {
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn front(&self) -> Option<TargetId> {
        self.ids.front().copied()
    }

    #[must_use]
    pub fn back(&self) -> Option<TargetId> {
        self.ids.back().copied()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = TargetId> + '_ {
        self.ids.iter().copied()
    }

    fn push(&mut self, id: TargetId, target: &Target) {
        if target.source != Source::Snoop {
            self.needs_writable |= target.pkt.needs_writable();
            self.has_upgrade |= target.pkt.cmd.is_upgrade();
        }
        self.ids.push_back(id);
    }

    fn reset_flags(&mut self) {
        self.needs_writable = false;
        self.has_upgrade = false;
    }

    fn update_flags(&mut self, arena: &Arena) {
        self.reset_flags();
        for id in &self.ids {
            if let Some(target) = arena.get(*id) {
                if target.source != Source::Snoop {
                    self.needs_writable |= target.pkt.needs_writable();
                    self.has_upgrade |= target.pkt.cmd.is_upgrade();
                }
            }
        }
    }
}

/// MSHR key.
///
/// Cacheable misses are unique per block, direction and security. Forwarded
/// uncacheable requests are keyed by their packet id.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key {
    pub block_addr: address,
    pub dir: Direction,
    pub secure: bool,
    pub forward: Option<u64>,
}

impl Key {
    #[must_use]
    pub fn block(block_addr: address, dir: Direction, secure: bool) -> Self {
        Self {
            block_addr,
            dir,
            secure,
            forward: None,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}/{}", self.block_addr, self.dir)?;
        if self.secure {
            write!(f, "/s")?;
        }
        if let Some(id) = self.forward {
            write!(f, "/fwd#{id}")?;
        }
        Ok(())
    }
}

/// Miss status handling register.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone)]
pub struct Mshr {
    pub key: Key,
    pub order: u64,
    pub ready_time: Time,
    pub in_service: bool,
    /// a downstream cache will deliver the response
    pub downstream_pending: bool,
    pub is_forward: bool,
    /// the pending response grants a writable copy
    pub pending_modified: bool,
    pub post_invalidate: bool,
    pub post_downgrade: bool,
    pub alloc_on_fill: bool,
    pub targets: TargetList,
    pub deferred: TargetList,
    /// words written in the other direction after the request was allocated
    pub stale: WordMask,
}

impl Mshr {
    #[must_use]
    pub fn total_targets(&self) -> usize {
        self.targets.len() + self.deferred.len()
    }

    /// Most recently added target.
    #[must_use]
    pub fn last_target(&self) -> Option<TargetId> {
        self.deferred.back().or_else(|| self.targets.back())
    }

    #[must_use]
    pub fn needs_writable(&self) -> bool {
        self.targets.needs_writable
    }

    #[must_use]
    pub fn is_cross_of(&self, block_addr: address, dir: Direction, secure: bool) -> bool {
        self.key.forward.is_none()
            && self.key.dir != dir
            && self.key.secure == secure
            && self.key.block_addr == block_addr
    }
}

/// Outcome of adding a target to an MSHR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocated {
    pub id: TargetId,
    pub deferred: bool,
    /// the MSHR holds more targets than configured
    pub bonus: bool,
}

/// Effect of marking a target against the MSHRs of the other direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Marked {
    pub conflicts: usize,
    pub blocked: bool,
    pub post_writebacks: usize,
    pub post_invalidates: usize,
}

/// Queue of MSHRs.
#[derive(Debug)]
pub struct Queue {
    entries: IndexMap<Key, Mshr>,
    arena: Arena,
    capacity: usize,
    demand_reserve: usize,
    targets_per_mshr: usize,
}

impl Queue {
    #[must_use]
    pub fn new(capacity: usize, demand_reserve: usize, targets_per_mshr: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
            arena: Arena::default(),
            capacity,
            demand_reserve,
            targets_per_mshr,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Whether a prefetch may allocate without eating into the demand reserve.
    #[must_use]
    pub fn can_prefetch(&self) -> bool {
        self.entries.len() + self.demand_reserve < self.capacity
    }

    #[must_use]
    pub fn targets_per_mshr(&self) -> usize {
        self.targets_per_mshr
    }

    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&Mshr> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Mshr> {
        self.entries.get_mut(key)
    }

    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    /// Cacheable MSHR of a block.
    #[must_use]
    pub fn find(&self, block_addr: address, dir: Direction, secure: bool) -> Option<&Mshr> {
        self.entries.get(&Key::block(block_addr, dir, secure))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mshr> + '_ {
        self.entries.values()
    }

    #[must_use]
    pub fn target(&self, id: TargetId) -> Option<&Target> {
        self.arena.get(id)
    }

    pub fn target_mut(&mut self, id: TargetId) -> Option<&mut Target> {
        self.arena.get_mut(id)
    }

    /// Whether any blocker of the target is still pending.
    #[must_use]
    pub fn is_blocked(&self, id: TargetId) -> bool {
        self.arena
            .get(id)
            .is_some_and(|target| target.blocked_by.iter().any(|b| self.arena.contains(*b)))
    }

    /// Allocates a new MSHR with a single target.
    pub fn allocate(&mut self, key: Key, target: Target, ready_time: Time) -> TargetId {
        assert!(
            !self.entries.contains_key(&key),
            "double allocation of MSHR {key}"
        );
        let order = target.order;
        let alloc_on_fill = target.alloc_on_fill;
        let id = self.arena.insert(target);
        let mut targets = TargetList::default();
        if let Some(target) = self.arena.get(id) {
            targets.push(id, target);
        }
        let mshr = Mshr {
            key,
            order,
            ready_time,
            in_service: false,
            downstream_pending: false,
            is_forward: key.forward.is_some(),
            pending_modified: false,
            post_invalidate: false,
            post_downgrade: false,
            alloc_on_fill,
            targets,
            deferred: TargetList::default(),
            stale: WordMask::new(),
        };
        log::trace!("mshr::allocate({key}, order={order})");
        self.entries.insert(key, mshr);
        id
    }

    /// Adds a target to a live MSHR.
    ///
    /// Targets that the outstanding request cannot satisfy are deferred.
    pub fn allocate_target(&mut self, key: &Key, mut target: Target) -> Allocated {
        let limit = self.targets_per_mshr;
        let Some(mshr) = self.entries.get_mut(key) else {
            panic!("allocating a target on missing MSHR {key}");
        };
        assert!(
            !mshr.targets.is_empty(),
            "allocating a target on MSHR {key} without targets"
        );
        let needs_writable = target.pkt.needs_writable();
        let defer = mshr.in_service
            && (!mshr.deferred.is_empty()
                || mshr.post_invalidate
                || (needs_writable
                    && (!mshr.pending_modified || mshr.post_downgrade || mshr.is_forward)));
        if defer && mshr.post_invalidate && target.pkt.cmd == Command::UpgradeReq {
            target.pkt.cmd = Command::ReadExReq;
        }
        mshr.alloc_on_fill |= target.alloc_on_fill;
        let id = self.arena.insert(target);
        let Some(target) = self.arena.get(id) else {
            unreachable!("target was just inserted");
        };
        if defer {
            mshr.deferred.push(id, target);
        } else {
            mshr.targets.push(id, target);
        }
        let bonus = mshr.total_targets() > limit;
        if bonus {
            log::warn!(
                "mshr::allocate_target({key}): {} targets exceed the limit of {limit}",
                mshr.total_targets()
            );
        }
        log::trace!("mshr::allocate_target({key}, deferred={defer})");
        Allocated {
            id,
            deferred: defer,
            bonus,
        }
    }

    /// Whether the MSHR reached its target limit.
    #[must_use]
    pub fn is_target_full(&self, key: &Key) -> bool {
        self.entries
            .get(key)
            .is_some_and(|mshr| mshr.total_targets() >= self.targets_per_mshr)
    }

    fn block_on(&mut self, target: TargetId, blocker: TargetId) {
        if let Some(t) = self.arena.get_mut(target) {
            t.blocked_by.push(blocker);
        }
        if let Some(b) = self.arena.get_mut(blocker) {
            b.blocking.push(target);
        }
    }

    /// Youngest target of the MSHR that writes the word.
    fn last_writer(&self, mshr: &Mshr, word: usize, geometry: &Geometry) -> Option<TargetId> {
        mshr.targets
            .iter()
            .chain(mshr.deferred.iter())
            .rev()
            .find(|id| {
                self.arena.get(*id).is_some_and(|t| {
                    t.source != Source::Snoop
                        && t.pkt.needs_writable()
                        && t.pkt.words(geometry).contains(&word)
                })
            })
    }

    /// Whether a pending target of the block's MSHR writes the word.
    #[must_use]
    pub fn writes_word(&self, key: &Key, word: usize, geometry: &Geometry) -> bool {
        self.entries
            .get(key)
            .is_some_and(|mshr| self.last_writer(mshr, word, geometry).is_some())
    }

    /// Orders a new target against the MSHRs of the other direction that
    /// cover words of its block.
    pub fn mark_block_info(&mut self, key: &Key, new: TargetId, geometry: &Geometry) -> Marked {
        let mut marked = Marked::default();
        if key.forward.is_some() {
            return marked;
        }
        let Some(target) = self.arena.get(new) else {
            return marked;
        };
        let is_write = target.pkt.needs_writable();
        let covered = target.pkt.words(geometry);
        if target
            .pkt
            .stale_words
            .as_ref()
            .is_some_and(|stale| stale.any())
        {
            if let Some(t) = self.arena.get_mut(new) {
                t.post_invalidate = true;
            }
            marked.post_invalidates += 1;
        }

        for word in 0..geometry.words_per_block() {
            let (cross_addr, cross_word) = geometry.cross_word(key.block_addr, key.dir, word);
            let cross_key = Key::block(cross_addr, key.dir.opposite(), key.secure);
            let Some(cross) = self.entries.get(&cross_key) else {
                continue;
            };
            let Some(last) = cross.last_target() else {
                continue;
            };
            marked.conflicts += 1;
            let covers = covered.contains(&word);

            if is_write {
                self.block_on(new, last);
                marked.blocked = true;
                if let Some(last) = self.arena.get_mut(last) {
                    if covers {
                        last.post_invalidate = true;
                        marked.post_invalidates += 1;
                    } else {
                        last.post_writeback = true;
                        marked.post_writebacks += 1;
                    }
                }
                continue;
            }

            let cross_write = covers
                .then(|| self.last_writer(cross, cross_word, geometry))
                .flatten();
            match cross_write {
                Some(writer) => {
                    self.block_on(new, writer);
                    marked.blocked = true;
                    if let Some(writer) = self.arena.get_mut(writer) {
                        writer.post_writeback = true;
                    }
                    marked.post_writebacks += 1;
                }
                None => {
                    if let Some(last) = self.arena.get_mut(last) {
                        last.post_writeback = true;
                    }
                    marked.post_writebacks += 1;
                    if let Some(t) = self.arena.get_mut(new) {
                        if !t.pkt.needs_writable() {
                            t.post_writeback = true;
                            marked.post_writebacks += 1;
                        }
                    }
                }
            }
        }
        log::trace!("mshr::mark_block_info({key}) => {marked:?}");
        marked
    }

    /// Records that a word of a pending block was written in the other direction.
    pub fn mark_stale(&mut self, key: &Key, word: usize, words_per_block: usize) {
        if let Some(mshr) = self.entries.get_mut(key) {
            if mshr.stale.is_empty() {
                mshr.stale = bitvec![0; words_per_block];
            }
            mshr.stale.set(word, true);
        }
    }

    pub fn mark_in_service(&mut self, key: &Key, pending_modified: bool) {
        let Some(mshr) = self.entries.get_mut(key) else {
            panic!("marking missing MSHR {key} in service");
        };
        mshr.in_service = true;
        mshr.downstream_pending = true;
        mshr.post_invalidate = false;
        mshr.post_downgrade = false;
        mshr.pending_modified = mshr.targets.needs_writable || pending_modified;
    }

    /// Returns an MSHR to the queue so it is sent again.
    pub fn mark_pending(&mut self, key: &Key) {
        let Some(mshr) = self.entries.get_mut(key) else {
            panic!("marking missing MSHR {key} pending");
        };
        mshr.in_service = false;
        mshr.downstream_pending = false;
        mshr.stale.clear();
    }

    fn touches_stale(&self, target: &Target, response: &Packet, geometry: &Geometry) -> bool {
        target.source == Source::Cpu
            && target.pkt.dir == response.dir
            && target
                .pkt
                .words(geometry)
                .any(|word| response.is_word_stale(word))
    }

    /// Removes and returns the targets a response can satisfy, in order.
    ///
    /// The returned targets are still alive and keep blocking their
    /// dependents until [`Queue::retire_target`] is called.
    pub fn extract_serviceable_targets(
        &mut self,
        key: &Key,
        response: &Packet,
        geometry: &Geometry,
    ) -> Vec<TargetId> {
        let Some(mshr) = self.entries.get(key) else {
            panic!("extracting targets of missing MSHR {key}");
        };
        let mut ready = Vec::new();
        let mut remaining = VecDeque::new();

        if response.cmd == Command::ReadRespWithInvalidate {
            let mut first_cpu = true;
            for id in mshr.targets.iter() {
                let Some(target) = self.arena.get(id) else {
                    continue;
                };
                let take = match target.source {
                    Source::Cpu if first_cpu => {
                        first_cpu = false;
                        true
                    }
                    Source::Snoop => !self.is_blocked(id),
                    _ => false,
                };
                if take {
                    ready.push(id);
                } else {
                    remaining.push_back(id);
                }
            }
        } else {
            let mut ids = mshr.targets.iter();
            for id in ids.by_ref() {
                let Some(target) = self.arena.get(id) else {
                    continue;
                };
                if self.is_blocked(id) || self.touches_stale(target, response, geometry) {
                    remaining.push_back(id);
                    break;
                }
                ready.push(id);
                if target.post_invalidate {
                    break;
                }
            }
            remaining.extend(ids);
        }

        if let Some(mshr) = self.entries.get_mut(key) {
            mshr.targets.ids = remaining;
            mshr.targets.update_flags(&self.arena);
        }
        log::trace!(
            "mshr::extract_serviceable_targets({key}) => {} ready",
            ready.len()
        );
        ready
    }

    /// Drops a serviced target, releasing the targets it blocked.
    pub fn retire_target(&mut self, id: TargetId) -> Option<Target> {
        self.arena.remove(id)
    }

    /// Moves deferred targets behind the writable response that can
    /// satisfy them.
    pub fn promote_writable(&mut self, key: &Key) -> usize {
        let Some(mshr) = self.entries.get_mut(key) else {
            return 0;
        };
        if !mshr.deferred.needs_writable || mshr.post_invalidate || mshr.post_downgrade {
            return 0;
        }
        let promoted = mshr.deferred.len();
        let deferred = std::mem::take(&mut mshr.deferred.ids);
        mshr.targets.ids.extend(deferred);
        mshr.deferred.reset_flags();
        mshr.targets.update_flags(&self.arena);
        promoted
    }

    /// Turns deferred targets into regular targets.
    ///
    /// Returns whether the MSHR still has targets and must be sent again.
    pub fn promote_deferred_targets(&mut self, key: &Key, now: Time, order: u64) -> bool {
        let Some(mshr) = self.entries.get_mut(key) else {
            return false;
        };
        if mshr.targets.is_empty() && mshr.deferred.is_empty() {
            return false;
        }
        let deferred = std::mem::take(&mut mshr.deferred.ids);
        mshr.targets.ids.extend(deferred);
        mshr.deferred.reset_flags();
        mshr.in_service = false;
        mshr.downstream_pending = false;
        mshr.pending_modified = false;
        mshr.post_invalidate = false;
        mshr.post_downgrade = false;
        mshr.stale.clear();
        mshr.order = order;
        mshr.targets.update_flags(&self.arena);
        mshr.ready_time = mshr
            .targets
            .front()
            .and_then(|id| self.arena.get(id))
            .map_or(now, |target| target.ready_time.max(now));
        true
    }

    /// Lets an MSHR react to a snoop.
    ///
    /// Returns true if the MSHR takes responsibility for the snoop.
    pub fn handle_snoop(&mut self, key: &Key, pkt: &mut Packet, order: u64, now: Time) -> bool {
        let Some(mshr) = self.entries.get(key) else {
            return false;
        };
        if !mshr.in_service {
            if pkt.needs_writable() || pkt.is_invalidate() {
                self.replace_upgrades(key);
            }
            return false;
        }
        if mshr.post_invalidate {
            return true;
        }
        let pending_modified = mshr.pending_modified;
        let will_respond = pending_modified && pkt.needs_response();
        if pending_modified || pkt.is_invalidate() {
            let mut copy = pkt.clone();
            if will_respond {
                pkt.flags |= crate::packet::Flags::CACHE_RESPONDING;
                copy.flags |= crate::packet::Flags::CACHE_RESPONDING;
            }
            let mut target = Target::new(copy, Source::Snoop, now, order);
            target.alloc_on_fill = false;
            let id = self.arena.insert(target);
            if let (Some(mshr), Some(target)) = (self.entries.get_mut(key), self.arena.get(id)) {
                mshr.targets.push(id, target);
                if pkt.needs_writable() || pkt.is_invalidate() {
                    mshr.post_invalidate = true;
                }
            }
        }
        if !pkt.needs_writable() && !pkt.uncacheable {
            if let Some(mshr) = self.entries.get_mut(key) {
                mshr.post_downgrade = true;
            }
            pkt.flags |= crate::packet::Flags::HAS_SHARERS;
        }
        true
    }

    fn replace_upgrades(&mut self, key: &Key) {
        let Some(mshr) = self.entries.get_mut(key) else {
            return;
        };
        if !mshr.targets.has_upgrade {
            return;
        }
        for id in mshr.targets.iter() {
            if let Some(target) = self.arena.get_mut(id) {
                if target.pkt.cmd == Command::UpgradeReq {
                    target.pkt.cmd = Command::ReadExReq;
                }
            }
        }
        mshr.targets.has_upgrade = false;
    }

    /// Oldest MSHR that may be sent at `now`.
    #[must_use]
    pub fn get_next(&self, now: Time) -> Option<&Mshr> {
        self.entries
            .values()
            .filter(|mshr| !mshr.in_service && mshr.ready_time <= now)
            .filter(|mshr| mshr.targets.front().is_some_and(|id| !self.is_blocked(id)))
            .min_by_key(|mshr| mshr.order)
    }

    /// Earliest time an MSHR becomes ready to send.
    #[must_use]
    pub fn next_ready_time(&self) -> Option<Time> {
        self.entries
            .values()
            .filter(|mshr| !mshr.in_service)
            .filter(|mshr| mshr.targets.front().is_some_and(|id| !self.is_blocked(id)))
            .map(|mshr| mshr.ready_time)
            .min()
    }

    /// Earliest time after `now` an MSHR becomes ready to send.
    #[must_use]
    pub fn next_ready_after(&self, now: Time) -> Option<Time> {
        self.entries
            .values()
            .filter(|mshr| !mshr.in_service && mshr.ready_time > now)
            .filter(|mshr| mshr.targets.front().is_some_and(|id| !self.is_blocked(id)))
            .map(|mshr| mshr.ready_time)
            .min()
    }

    /// Removes an MSHR together with any targets it still holds.
    pub fn deallocate(&mut self, key: &Key) -> Option<Mshr> {
        let mshr = self.entries.shift_remove(key)?;
        for id in mshr.targets.iter().chain(mshr.deferred.iter()) {
            self.arena.remove(id);
        }
        log::trace!("mshr::deallocate({key})");
        Some(mshr)
    }

    /// Pending live targets held by the queue.
    #[must_use]
    pub fn live_targets(&self) -> usize {
        self.arena.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{Key, Queue, Source, Target};
    use crate::{
        direction::{Direction, Geometry},
        packet::{self, Command, Packet},
    };
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    fn packet(cmd: Command, addr: u64, dir: Direction, size: u64) -> Packet {
        packet::Builder {
            cmd,
            addr,
            dir,
            size,
            data: cmd.has_data().then(|| vec![1; size as usize]),
            ..packet::Builder::default()
        }
        .build()
    }

    fn cpu(pkt: Packet, order: u64) -> Target {
        Target::new(pkt, Source::Cpu, 0, order)
    }

    #[test]
    #[should_panic(expected = "double allocation")]
    fn one_mshr_per_block_and_direction() {
        let mut queue = Queue::new(4, 0, 4);
        let key = Key::block(0x40, Direction::Row, false);
        queue.allocate(key, cpu(packet(Command::ReadReq, 0x40, Direction::Row, 8), 0), 0);
        // the column view of the same address is a different key
        let column = Key::block(0x40, Direction::Column, false);
        queue.allocate(column, cpu(packet(Command::ReadReq, 0x40, Direction::Column, 8), 1), 0);
        diff::assert_eq!(queue.len(), 2);
        queue.allocate(key, cpu(packet(Command::ReadReq, 0x48, Direction::Row, 8), 2), 0);
    }

    #[test]
    fn writes_to_in_service_reads_are_deferred() {
        let mut queue = Queue::new(4, 0, 4);
        let key = Key::block(0x40, Direction::Row, false);
        queue.allocate(key, cpu(packet(Command::ReadReq, 0x40, Direction::Row, 8), 0), 0);
        let read = queue.allocate_target(&key, cpu(packet(Command::ReadReq, 0x48, Direction::Row, 8), 1));
        assert!(!read.deferred);
        queue.mark_in_service(&key, false);
        let write =
            queue.allocate_target(&key, cpu(packet(Command::WriteReq, 0x48, Direction::Row, 8), 2));
        assert!(write.deferred);
        // everything after a deferred target is deferred too
        let read =
            queue.allocate_target(&key, cpu(packet(Command::ReadReq, 0x50, Direction::Row, 8), 3));
        assert!(read.deferred);
        let mshr = queue.get(&key).expect("mshr");
        diff::assert_eq!((mshr.targets.len(), mshr.deferred.len()), (2, 2));
        assert!(mshr.deferred.needs_writable);
    }

    #[test]
    fn writes_coalesce_into_pending_modified_requests() {
        let mut queue = Queue::new(4, 0, 4);
        let key = Key::block(0x40, Direction::Row, false);
        queue.allocate(key, cpu(packet(Command::WriteReq, 0x40, Direction::Row, 8), 0), 0);
        queue.mark_in_service(&key, false);
        let write =
            queue.allocate_target(&key, cpu(packet(Command::WriteReq, 0x48, Direction::Row, 8), 1));
        assert!(!write.deferred);
    }

    #[test]
    fn target_limit_reports_bonus_targets() {
        let mut queue = Queue::new(4, 0, 2);
        let key = Key::block(0x40, Direction::Row, false);
        queue.allocate(key, cpu(packet(Command::ReadReq, 0x40, Direction::Row, 8), 0), 0);
        assert!(!queue.is_target_full(&key));
        let second = queue.allocate_target(&key, cpu(packet(Command::ReadReq, 0x48, Direction::Row, 8), 1));
        assert!(!second.bonus);
        assert!(queue.is_target_full(&key));
        let third = queue.allocate_target(&key, cpu(packet(Command::ReadReq, 0x50, Direction::Row, 8), 2));
        assert!(third.bonus);
    }

    #[test]
    fn extraction_is_fifo_until_blocked() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let mut queue = Queue::new(4, 0, 8);
        // column MSHR for word 0 of rows 0..8 with a pending write to row 2
        let column = Key::block(0, Direction::Column, false);
        let column_write = queue.allocate(
            column,
            cpu(packet(Command::WriteReq, 2 * 512, Direction::Column, 8), 0),
            0,
        );
        // row 2 MSHR, the first read does not touch word 0
        let row = Key::block(2 * 512, Direction::Row, false);
        let first = queue.allocate(row, cpu(packet(Command::ReadReq, 2 * 512 + 8, Direction::Row, 8), 1), 0);
        let marked = queue.mark_block_info(&row, first, &geometry);
        assert!(!marked.blocked);
        diff::assert_eq!(marked.conflicts, 1);
        // the second read covers word 0, written by the column MSHR
        let second = queue
            .allocate_target(&row, cpu(packet(Command::ReadReq, 2 * 512, Direction::Row, 8), 2))
            .id;
        let marked = queue.mark_block_info(&row, second, &geometry);
        assert!(marked.blocked);
        assert!(queue.is_blocked(second));
        assert!(queue.target(column_write).is_some_and(|t| t.post_writeback));
        let third = queue
            .allocate_target(&row, cpu(packet(Command::ReadReq, 2 * 512 + 16, Direction::Row, 8), 3))
            .id;

        queue.mark_in_service(&row, false);
        let mut response = packet(Command::ReadReq, 2 * 512, Direction::Row, 64);
        response.make_response();
        let ready = queue.extract_serviceable_targets(&row, &response, &geometry);
        diff::assert_eq!(ready, vec![first]);
        let mshr = queue.get(&row).expect("row mshr");
        diff::assert_eq!(mshr.targets.iter().collect::<Vec<_>>(), vec![second, third]);

        // servicing the column write releases the blocked read
        queue.retire_target(column_write);
        assert!(!queue.is_blocked(second));
        Ok(())
    }

    #[test]
    fn cross_writes_are_blocked_on_the_latest_target() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let mut queue = Queue::new(4, 0, 8);
        let row = Key::block(0, Direction::Row, false);
        let read = queue.allocate(row, cpu(packet(Command::ReadReq, 0, Direction::Row, 64), 0), 0);
        let column = Key::block(3 * 8, Direction::Column, false);
        let write = queue.allocate(
            column,
            cpu(packet(Command::WriteReq, 3 * 8, Direction::Column, 8), 1),
            0,
        );
        let marked = queue.mark_block_info(&column, write, &geometry);
        assert!(marked.blocked);
        diff::assert_eq!(marked.post_invalidates, 1);
        assert!(queue.target(read).is_some_and(|t| t.post_invalidate));
        // the blocked MSHR is not eligible until the read is serviced
        queue.mark_in_service(&row, false);
        assert!(queue.get_next(0).is_none());
        queue.retire_target(read);
        diff::assert_eq!(queue.get_next(0).map(|m| m.key), Some(column));
        Ok(())
    }

    #[test]
    fn post_invalidate_target_ends_extraction() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let mut queue = Queue::new(4, 0, 8);
        let key = Key::block(0, Direction::Row, false);
        let first = queue.allocate(key, cpu(packet(Command::ReadReq, 0, Direction::Row, 8), 0), 0);
        let second = queue
            .allocate_target(&key, cpu(packet(Command::ReadReq, 8, Direction::Row, 8), 1))
            .id;
        if let Some(t) = queue.target_mut(first) {
            t.post_invalidate = true;
        }
        let mut response = packet(Command::ReadReq, 0, Direction::Row, 64);
        response.make_response();
        diff::assert_eq!(
            queue.extract_serviceable_targets(&key, &response, &geometry),
            vec![first]
        );
        queue.retire_target(first);
        assert!(queue.promote_deferred_targets(&key, 10, 5));
        let mshr = queue.get(&key).expect("mshr");
        diff::assert_eq!((mshr.order, mshr.ready_time, mshr.in_service), (5, 10, false));
        diff::assert_eq!(mshr.targets.front(), Some(second));
        Ok(())
    }

    #[test]
    fn stale_words_stop_cpu_targets() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let mut queue = Queue::new(4, 0, 8);
        let key = Key::block(0, Direction::Row, false);
        let first = queue.allocate(key, cpu(packet(Command::ReadReq, 0, Direction::Row, 8), 0), 0);
        queue.allocate_target(&key, cpu(packet(Command::ReadReq, 16, Direction::Row, 8), 1));
        queue.mark_stale(&key, 2, 8);
        let mut response = packet(Command::ReadReq, 0, Direction::Row, 64);
        response.make_response();
        response.stale_words = Some(queue.get(&key).expect("mshr").stale.clone());
        diff::assert_eq!(
            queue.extract_serviceable_targets(&key, &response, &geometry),
            vec![first]
        );
        Ok(())
    }

    #[test]
    fn snoops_on_pending_modified_requests_become_targets() {
        let mut queue = Queue::new(4, 0, 8);
        let key = Key::block(0, Direction::Row, false);
        queue.allocate(key, cpu(packet(Command::WriteReq, 0, Direction::Row, 8), 0), 0);
        let mut snoop = packet(Command::ReadExReq, 0, Direction::Row, 64);
        assert!(!queue.handle_snoop(&key, &mut snoop, 1, 0));

        queue.mark_in_service(&key, false);
        assert!(queue.handle_snoop(&key, &mut snoop, 1, 0));
        assert!(snoop.cache_responding());
        let mshr = queue.get(&key).expect("mshr");
        assert!(mshr.post_invalidate);
        diff::assert_eq!(mshr.targets.len(), 2);

        let mut read = packet(Command::ReadSharedReq, 0, Direction::Row, 64);
        // a pending invalidation already owns the block
        assert!(queue.handle_snoop(&key, &mut read, 2, 0));
        diff::assert_eq!(queue.get(&key).expect("mshr").targets.len(), 2);
    }

    #[test]
    fn prefetches_respect_demand_reserve() {
        let mut queue = Queue::new(2, 1, 4);
        assert!(queue.can_prefetch());
        let key = Key::block(0, Direction::Row, false);
        queue.allocate(key, cpu(packet(Command::ReadReq, 0, Direction::Row, 8), 0), 0);
        assert!(!queue.can_prefetch());
        assert!(!queue.is_full());
        let dealloc = queue.deallocate(&key).expect("mshr");
        diff::assert_eq!(dealloc.key, key);
        diff::assert_eq!(queue.live_targets(), 0);
    }
}
