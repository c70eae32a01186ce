//! Buffer of outgoing writebacks, clean evictions and uncacheable writes.

use crate::{
    address,
    direction::{Direction, Geometry},
    engine::Time,
    packet::Packet,
};

#[derive(Debug, Clone)]
pub struct Entry {
    pub pkt: Packet,
    pub block_addr: address,
    pub order: u64,
    pub ready_time: Time,
    /// sent and waiting for a response
    pub in_service: bool,
}

impl Entry {
    #[must_use]
    pub fn dir(&self) -> Direction {
        self.pkt.dir
    }

    #[must_use]
    pub fn secure(&self) -> bool {
        self.pkt.secure
    }

    /// Whether the entry shares a word with a block.
    #[must_use]
    pub fn intersects(
        &self,
        geometry: &Geometry,
        block_addr: address,
        dir: Direction,
        secure: bool,
    ) -> bool {
        self.secure() == secure
            && geometry.blocks_intersect(self.block_addr, self.dir(), block_addr, dir)
    }
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WriteQueueEntry({}, order={})", self.pkt, self.order)
    }
}

#[derive(Debug)]
pub struct Queue {
    entries: Vec<Entry>,
    capacity: usize,
}

impl Queue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
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

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    pub fn allocate(&mut self, pkt: Packet, block_addr: address, ready_time: Time, order: u64) {
        log::trace!("write_queue::allocate({pkt}, order={order})");
        self.entries.push(Entry {
            pkt,
            block_addr,
            order,
            ready_time,
            in_service: false,
        });
    }

    /// Most recent entry for exactly this block.
    #[must_use]
    pub fn find_match(&self, block_addr: address, dir: Direction, secure: bool) -> Option<&Entry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.block_addr == block_addr && e.dir() == dir && e.secure() == secure)
    }

    pub fn find_match_mut(
        &mut self,
        block_addr: address,
        dir: Direction,
        secure: bool,
    ) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .rev()
            .find(|e| e.block_addr == block_addr && e.dir() == dir && e.secure() == secure)
    }

    /// Oldest pending entry sharing a word with the block that is older than `order`.
    #[must_use]
    pub fn find_older_conflict(
        &self,
        geometry: &Geometry,
        block_addr: address,
        dir: Direction,
        secure: bool,
        order: u64,
    ) -> Option<&Entry> {
        self.entries
            .iter()
            .filter(|e| !e.in_service && e.order < order)
            .filter(|e| e.intersects(geometry, block_addr, dir, secure))
            .min_by_key(|e| e.order)
    }

    /// Oldest entry that may be sent at `now`.
    #[must_use]
    pub fn get_next(&self, now: Time) -> Option<&Entry> {
        self.entries
            .iter()
            .filter(|e| !e.in_service && e.ready_time <= now)
            .min_by_key(|e| e.order)
    }

    #[must_use]
    pub fn next_ready_time(&self) -> Option<Time> {
        self.entries
            .iter()
            .filter(|e| !e.in_service)
            .map(|e| e.ready_time)
            .min()
    }

    #[must_use]
    pub fn next_ready_after(&self, now: Time) -> Option<Time> {
        self.entries
            .iter()
            .filter(|e| !e.in_service && e.ready_time > now)
            .map(|e| e.ready_time)
            .min()
    }

    /// Marks an entry sent.
    ///
    /// Entries that expect no response are removed and returned.
    pub fn mark_in_service(&mut self, order: u64) -> Option<Entry> {
        let idx = self.entries.iter().position(|e| e.order == order)?;
        if self.entries[idx].pkt.needs_response() {
            self.entries[idx].in_service = true;
            None
        } else {
            Some(self.entries.remove(idx))
        }
    }

    /// Removes the in service entry a response belongs to.
    pub fn deallocate_by_packet(&mut self, id: u64) -> Option<Entry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.in_service && e.pkt.id == id)?;
        Some(self.entries.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::Queue;
    use crate::{
        direction::{Direction, Geometry},
        packet::{self, Command},
    };
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    fn writeback(addr: u64, dir: Direction) -> packet::Packet {
        packet::Builder {
            cmd: Command::WritebackDirty,
            addr,
            dir,
            size: 64,
            data: Some(vec![0; 64]),
            ..packet::Builder::default()
        }
        .build()
    }

    #[test]
    fn oldest_ready_entry_goes_first() {
        let mut queue = Queue::new(2);
        queue.allocate(writeback(0x40, Direction::Row), 0x40, 5, 3);
        queue.allocate(writeback(0x80, Direction::Row), 0x80, 0, 7);
        assert!(queue.is_full());
        diff::assert_eq!(queue.get_next(0).map(|e| e.order), Some(7));
        diff::assert_eq!(queue.get_next(5).map(|e| e.order), Some(3));
        diff::assert_eq!(queue.next_ready_time(), Some(0));
        // writebacks leave the queue once sent
        assert!(queue.mark_in_service(3).is_some());
        diff::assert_eq!(queue.len(), 1);
    }

    #[test]
    fn conflicts_include_the_other_direction() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let mut queue = Queue::new(4);
        queue.allocate(writeback(0x8, Direction::Column), 0x8, 0, 1);
        // row 3 holds word 3 of column 0x8
        let row = 3 * 512;
        let conflict = queue.find_older_conflict(&geometry, row, Direction::Row, false, 2);
        diff::assert_eq!(conflict.map(|e| e.order), Some(1));
        assert!(queue
            .find_older_conflict(&geometry, row, Direction::Row, false, 1)
            .is_none());
        assert!(queue
            .find_older_conflict(&geometry, 8 * 512, Direction::Row, false, 2)
            .is_none());
        assert!(queue.find_match(0x8, Direction::Column, false).is_some());
        assert!(queue.find_match(0x8, Direction::Row, false).is_none());
        Ok(())
    }

    #[test]
    fn uncacheable_writes_wait_for_their_response() {
        let mut queue = Queue::new(4);
        let write = packet::Builder {
            cmd: Command::WriteReq,
            addr: 0x48,
            size: 8,
            uncacheable: true,
            data: Some(vec![1; 8]),
            ..packet::Builder::default()
        }
        .build();
        let id = write.id;
        queue.allocate(write, 0x40, 0, 0);
        assert!(queue.mark_in_service(0).is_none());
        assert!(queue.get_next(10).is_none());
        assert!(queue.deallocate_by_packet(id).is_some());
        assert!(queue.is_empty());
    }
}
