use crate::{
    address,
    direction::{Direction, Geometry, WORD_SIZE},
    engine::Time,
    packet::{Command, Packet, WordMask},
};
use bitvec::prelude::*;
use smallvec::SmallVec;
use std::ops::Range;

bitflags::bitflags! {
    /// Coherence and bookkeeping bits of a block.
    #[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct Status: u8 {
        const VALID = 0x01;
        const WRITABLE = 0x02;
        const READABLE = 0x04;
        const DIRTY = 0x08;
        const HW_PREFETCHED = 0x20;
        const SECURE = 0x40;
    }
}

/// Load-locked reservation.
///
/// `low` and `high` are inclusive bounds in the linear space of `dir`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lock {
    pub context: usize,
    pub low: address,
    pub high: address,
    pub dir: Direction,
}

impl Lock {
    #[must_use]
    pub fn new(pkt: &Packet, geometry: &Geometry) -> Self {
        let low = geometry.linearize(pkt.addr, pkt.dir);
        Self {
            context: pkt.context,
            low,
            high: low + pkt.size - 1,
            dir: pkt.dir,
        }
    }

    fn overlaps(&self, low: address, high: address) -> bool {
        low <= self.high && high >= self.low
    }

    /// Whether a store-conditional may use this reservation.
    #[must_use]
    pub fn matches(&self, pkt: &Packet, geometry: &Geometry) -> bool {
        if self.context != pkt.context {
            return false;
        }
        if self.dir != pkt.dir && !pkt.is_single_word(geometry) {
            return false;
        }
        let low = geometry.linearize(pkt.addr, self.dir);
        let high = low + pkt.size - 1;
        self.low <= low && high <= self.high
    }

    /// Whether a write touches bytes covered by this reservation.
    #[must_use]
    pub fn intersects(&self, pkt: &Packet, geometry: &Geometry) -> bool {
        if self.dir == pkt.dir || pkt.is_single_word(geometry) {
            let low = geometry.linearize(pkt.addr, self.dir);
            return self.overlaps(low, low + pkt.size - 1);
        }
        geometry
            .physical_words(pkt.addr, pkt.dir, pkt.size)
            .any(|word| {
                let low = geometry.linearize(word, self.dir);
                self.overlaps(low, low + WORD_SIZE - 1)
            })
    }
}

/// A cache block viewed in one direction.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    /// block number in the linear space of `dir`
    pub tag: u64,
    /// physical address of the first word
    pub addr: address,
    pub dir: Direction,
    pub set: usize,
    pub way: usize,
    pub ref_count: u64,
    pub when_ready: Time,
    pub inserted_at: u64,
    pub last_touch: u64,
    status: Status,
    data: Vec<u8>,
    word_dirty: WordMask,
    locks: SmallVec<[Lock; 2]>,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("dir", &self.dir)
            .field("set", &self.set)
            .field("way", &self.way)
            .field("status", &self.status)
            .field("dirty", &format_args!("{}", self.word_dirty))
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block({:#x}, {}, set={}, way={}, {:?})",
            self.addr, self.dir, self.set, self.way, self.status
        )
    }
}

impl Block {
    #[must_use]
    pub fn new(set: usize, way: usize, geometry: &Geometry) -> Self {
        Self {
            tag: 0,
            addr: 0,
            dir: Direction::Row,
            set,
            way,
            ref_count: 0,
            when_ready: 0,
            inserted_at: 0,
            last_touch: 0,
            status: Status::empty(),
            data: vec![0; geometry.block_size() as usize],
            word_dirty: bitvec![0; geometry.words_per_block()],
            locks: SmallVec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status.contains(Status::VALID)
    }

    #[inline]
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.status.contains(Status::WRITABLE)
    }

    #[inline]
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.status.contains(Status::READABLE)
    }

    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.status.contains(Status::DIRTY)
    }

    #[inline]
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.status.contains(Status::SECURE)
    }

    #[inline]
    #[must_use]
    pub fn was_prefetched(&self) -> bool {
        self.status.contains(Status::HW_PREFETCHED)
    }

    /// Whether the block is valid and holds `addr` in direction `dir`.
    #[must_use]
    pub fn matches(&self, tag: u64, dir: Direction, secure: bool) -> bool {
        self.is_valid() && self.tag == tag && self.dir == dir && self.is_secure() == secure
    }

    pub fn set_valid(&mut self) {
        self.status |= Status::VALID;
    }

    pub fn set_secure(&mut self, secure: bool) {
        self.status.set(Status::SECURE, secure);
    }

    pub fn set_writable(&mut self, writable: bool) {
        assert!(
            !writable || self.is_valid(),
            "{self} cannot become writable while invalid"
        );
        self.status.set(Status::WRITABLE, writable);
    }

    pub fn set_readable(&mut self, readable: bool) {
        self.status.set(Status::READABLE, readable);
    }

    pub fn set_prefetched(&mut self, prefetched: bool) {
        self.status.set(Status::HW_PREFETCHED, prefetched);
    }

    /// Clears all status bits and reservations, the data is kept.
    pub fn invalidate(&mut self) {
        self.status = Status::empty();
        self.word_dirty.fill(false);
        self.locks.clear();
        self.ref_count = 0;
    }

    #[inline]
    #[must_use]
    pub fn words(&self) -> usize {
        self.word_dirty.len()
    }

    #[must_use]
    pub fn is_word_dirty(&self, index: usize) -> bool {
        assert!(
            index < self.words(),
            "word index {index} out of range for {} words",
            self.words()
        );
        self.word_dirty[index]
    }

    #[must_use]
    pub fn dirty_words(&self) -> &WordMask {
        &self.word_dirty
    }

    pub fn set_word_dirty(&mut self, index: usize) {
        assert!(
            index < self.words(),
            "word index {index} out of range for {} words",
            self.words()
        );
        self.word_dirty.set(index, true);
        self.status |= Status::DIRTY;
    }

    /// Replaces the dirty vector.
    pub fn set_dirty_words(&mut self, mask: &WordMask) {
        assert_eq!(mask.len(), self.words());
        self.word_dirty.copy_from_bitslice(mask);
        self.status.set(Status::DIRTY, self.word_dirty.any());
    }

    /// Marks every word dirty.
    pub fn set_all_dirty(&mut self) {
        self.word_dirty.fill(true);
        self.status |= Status::DIRTY;
    }

    pub fn clear_dirty(&mut self) {
        self.word_dirty.fill(false);
        self.status.remove(Status::DIRTY);
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes of word `index`.
    #[must_use]
    pub fn word(&self, index: usize) -> &[u8] {
        let start = index * WORD_SIZE as usize;
        &self.data[start..start + WORD_SIZE as usize]
    }

    /// Overwrites the data with a fill, keeping words that are dirty here.
    ///
    /// Returns the words that were kept.
    pub fn merge_fill(&mut self, data: &[u8]) -> WordMask {
        assert_eq!(data.len(), self.data.len(), "fill size mismatch");
        let word = WORD_SIZE as usize;
        for (i, (local, incoming)) in self
            .data
            .chunks_exact_mut(word)
            .zip(data.chunks_exact(word))
            .enumerate()
        {
            if !self.word_dirty[i] {
                local.copy_from_slice(incoming);
            }
        }
        self.word_dirty.clone()
    }

    /// Byte offset and word range of a packet within this block.
    ///
    /// Packets in the other direction must stay within a single word.
    fn locate(&self, pkt: &Packet, geometry: &Geometry) -> (usize, Range<usize>) {
        if pkt.dir != self.dir {
            assert!(
                pkt.is_single_word(geometry),
                "{pkt} spans several words of cross block {self}"
            );
        }
        let offset = geometry.block_offset(pkt.addr, self.dir);
        let first = (offset / WORD_SIZE) as usize;
        let last = ((offset + pkt.size - 1) / WORD_SIZE) as usize;
        assert!(
            offset + pkt.size <= geometry.block_size(),
            "{pkt} exceeds {self}"
        );
        (offset as usize, first..last + 1)
    }

    /// Word indices of this block touched by a packet.
    #[must_use]
    pub fn words_of(&self, pkt: &Packet, geometry: &Geometry) -> Range<usize> {
        self.locate(pkt, geometry).1
    }

    /// Copies the accessed bytes into the packet.
    pub fn read_into(&self, pkt: &mut Packet, geometry: &Geometry) {
        let (offset, _) = self.locate(pkt, geometry);
        let size = pkt.size as usize;
        let data = pkt.allocate_data();
        data.copy_from_slice(&self.data[offset..offset + size]);
    }

    /// Copies the packet data into the block and marks the words dirty.
    pub fn write_from(&mut self, pkt: &Packet, geometry: &Geometry) {
        let (offset, words) = self.locate(pkt, geometry);
        if let Some(data) = &pkt.data {
            self.data[offset..offset + data.len()].copy_from_slice(data);
        }
        for word in words {
            self.set_word_dirty(word);
        }
    }

    /// Marks the words touched by a packet dirty without changing data.
    pub fn touch_dirty(&mut self, pkt: &Packet, geometry: &Geometry) {
        for word in self.words_of(pkt, geometry) {
            self.set_word_dirty(word);
        }
    }

    /// Copies a block sized writeback or response into the block.
    pub fn copy_block(&mut self, data: &[u8]) {
        assert_eq!(data.len(), self.data.len(), "block size mismatch");
        self.data.copy_from_slice(data);
    }

    pub fn track_load_locked(&mut self, pkt: &Packet, geometry: &Geometry) {
        debug_assert_eq!(pkt.cmd, Command::LoadLockedReq);
        self.locks.push(Lock::new(pkt, geometry));
    }

    #[must_use]
    pub fn locks(&self) -> &[Lock] {
        &self.locks
    }

    /// Checks reservations before a write.
    ///
    /// Returns false for a failing store-conditional which must not update
    /// the data. Writes that proceed clear the intersecting reservations of
    /// other contexts.
    pub fn check_write(&mut self, pkt: &mut Packet, geometry: &Geometry) -> bool {
        if pkt.cmd == Command::StoreCondReq {
            let matching = self
                .locks
                .iter()
                .position(|lock| lock.matches(pkt, geometry));
            let success = matching.is_some();
            if let Some(idx) = matching {
                self.locks.remove(idx);
            }
            pkt.sc_success = Some(success);
            if !success {
                return false;
            }
        }
        let pkt: &Packet = pkt;
        self.locks
            .retain(|lock| lock.context == pkt.context || !lock.intersects(pkt, geometry));
        true
    }
}
