//! Discrete event queue.

use crate::packet::Packet;
use std::collections::{BinaryHeap, HashSet};

pub type Time = u64;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// request issued by the CPU to the cache
    CpuRequest(Packet),
    /// response from the cache to the CPU
    CpuResponse(Packet),
    /// the cache accepts requests again
    CpuRetry,
    /// the cache may send its next queued packet downstream
    MemSideSend,
    /// memory accepts requests again
    MemRequestRetry,
    /// response from memory to the cache
    MemResponse(Packet),
    /// snoop from below
    Snoop(Packet),
}

/// Scheduling interface used by the timing components.
pub trait Scheduler {
    #[must_use]
    fn now(&self) -> Time;

    fn schedule(&mut self, time: Time, event: Event) -> EventId;

    /// Removes a pending event.
    ///
    /// Returns false if the event is not pending.
    fn deschedule(&mut self, id: EventId) -> bool;

    #[must_use]
    fn is_scheduled(&self, id: EventId) -> bool;
}

struct Entry {
    time: Time,
    id: EventId,
    event: Event,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        (self.time, self.id) == (other.time, other.id)
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // min heap, events at the same time run in scheduling order
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.time, self.id).cmp(&(other.time, other.id)).reverse()
    }
}

/// Time ordered event queue.
#[derive(Default)]
pub struct EventQueue {
    now: Time,
    next_id: u64,
    queue: BinaryHeap<Entry>,
    pending: HashSet<EventId>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("now", &self.now)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Time of the next pending event.
    #[must_use]
    pub fn peek_time(&mut self) -> Option<Time> {
        self.skip_cancelled();
        self.queue.peek().map(|entry| entry.time)
    }

    /// Advances time to the next pending event and returns it.
    pub fn pop(&mut self) -> Option<(Time, Event)> {
        self.skip_cancelled();
        let Entry { time, id, event } = self.queue.pop()?;
        self.pending.remove(&id);
        debug_assert!(time >= self.now);
        self.now = time;
        Some((time, event))
    }

    fn skip_cancelled(&mut self) {
        while let Some(entry) = self.queue.peek() {
            if self.pending.contains(&entry.id) {
                break;
            }
            self.queue.pop();
        }
    }
}

impl Scheduler for EventQueue {
    fn now(&self) -> Time {
        self.now
    }

    fn schedule(&mut self, time: Time, event: Event) -> EventId {
        assert!(
            time >= self.now,
            "cannot schedule {event:?} at {time} in the past (now={})",
            self.now
        );
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.pending.insert(id);
        self.queue.push(Entry { time, id, event });
        id
    }

    fn deschedule(&mut self, id: EventId) -> bool {
        self.pending.remove(&id)
    }

    fn is_scheduled(&self, id: EventId) -> bool {
        self.pending.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventQueue, Scheduler};
    use pretty_assertions_sorted as diff;

    #[test]
    fn pops_in_time_then_schedule_order() {
        let mut queue = EventQueue::new();
        queue.schedule(10, Event::MemSideSend);
        queue.schedule(5, Event::CpuRetry);
        queue.schedule(10, Event::MemRequestRetry);
        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        diff::assert_eq!(
            order,
            vec![
                (5, Event::CpuRetry),
                (10, Event::MemSideSend),
                (10, Event::MemRequestRetry)
            ]
        );
        diff::assert_eq!(queue.now(), 10);
    }

    #[test]
    fn descheduled_events_are_skipped() {
        let mut queue = EventQueue::new();
        let a = queue.schedule(1, Event::MemSideSend);
        queue.schedule(2, Event::CpuRetry);
        assert!(queue.is_scheduled(a));
        assert!(queue.deschedule(a));
        assert!(!queue.deschedule(a));
        assert!(!queue.is_scheduled(a));
        diff::assert_eq!(queue.len(), 1);
        diff::assert_eq!(queue.peek_time(), Some(2));
        diff::assert_eq!(queue.pop(), Some((2, Event::CpuRetry)));
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic(expected = "in the past")]
    fn rejects_past_events() {
        let mut queue = EventQueue::new();
        queue.schedule(5, Event::CpuRetry);
        queue.pop();
        queue.schedule(4, Event::CpuRetry);
    }
}
