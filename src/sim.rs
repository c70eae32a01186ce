//! A CPU driving one cache level backed by memory.

use crate::{
    address,
    cache::{self, Cache},
    config::SimConfig,
    direction::Direction,
    engine::{Event, EventQueue, Scheduler, Time},
    mem::SimpleMemory,
    packet::{self, Command, Packet},
    trace,
};
use color_eyre::eyre;
use std::collections::{HashSet, VecDeque};

/// Single CPU system.
///
/// Requests the cache refuses are parked in issue order and offered again
/// on [`Event::CpuRetry`].
#[derive(Debug)]
pub struct System {
    pub events: EventQueue,
    pub cache: Cache,
    pub memory: SimpleMemory,
    parked: VecDeque<Packet>,
    /// requests waiting for their response
    outstanding: HashSet<u64>,
    completed: Vec<(Time, Packet)>,
    pub stats: stats::Sim,
}

impl System {
    pub fn new(config: SimConfig) -> Result<Self, cache::Error> {
        let cache = Cache::new(config.cache)?;
        let memory = SimpleMemory::new(&config.memory, *cache.geometry());
        Ok(Self {
            events: EventQueue::new(),
            cache,
            memory,
            parked: VecDeque::new(),
            outstanding: HashSet::new(),
            completed: Vec::new(),
            stats: stats::Sim::default(),
        })
    }

    #[must_use]
    pub fn now(&self) -> Time {
        self.events.now()
    }

    /// Builds a CPU request issued now.
    #[must_use]
    pub fn request(
        &self,
        cmd: Command,
        addr: address,
        dir: Direction,
        size: u64,
        data: Option<Vec<u8>>,
    ) -> Packet {
        packet::Builder {
            cmd,
            addr,
            dir,
            size,
            data,
            issued_at: self.now(),
            ..packet::Builder::default()
        }
        .build()
    }

    /// Issues a request now.
    pub fn issue(&mut self, pkt: Packet) {
        let now = self.now();
        self.issue_at(now, pkt);
    }

    pub fn issue_at(&mut self, time: Time, pkt: Packet) {
        if pkt.needs_response() {
            self.outstanding.insert(pkt.id);
        }
        self.stats.requests += 1;
        self.events.schedule(time, Event::CpuRequest(pkt));
    }

    /// Responses delivered to the CPU since the last call.
    pub fn take_responses(&mut self) -> Vec<(Time, Packet)> {
        std::mem::take(&mut self.completed)
    }

    /// Requests still waiting for a response.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Handles the next event.
    ///
    /// Returns false if no event is left.
    pub fn step(&mut self) -> bool {
        let Some((time, event)) = self.events.pop() else {
            return false;
        };
        self.stats.events += 1;
        self.stats.ticks = time;
        match event {
            Event::CpuRequest(pkt) => {
                if self.parked.is_empty() {
                    self.offer(pkt);
                } else {
                    self.parked.push_back(pkt);
                }
            }
            Event::CpuRetry => {
                while let Some(pkt) = self.parked.pop_front() {
                    if !self.offer(pkt) {
                        break;
                    }
                }
            }
            Event::CpuResponse(pkt) => {
                assert!(
                    self.outstanding.remove(&pkt.id),
                    "unexpected response {pkt} at {time}"
                );
                log::debug!("cpu: received {pkt} at {time}");
                self.stats.responses += 1;
                self.completed.push((time, pkt));
            }
            Event::MemSideSend => self.cache.send_next(&mut self.memory, &mut self.events),
            Event::MemRequestRetry => self.cache.recv_req_retry(&mut self.memory, &mut self.events),
            Event::MemResponse(pkt) => {
                self.memory.response_delivered(&mut self.events);
                self.cache.recv_timing_resp(pkt, &mut self.events);
            }
            Event::Snoop(mut pkt) => self.cache.handle_snoop(&mut pkt, &mut self.events),
        }
        true
    }

    /// Offers a request to the cache, parking it if refused.
    fn offer(&mut self, pkt: Packet) -> bool {
        match self.cache.recv_timing_req(pkt, &mut self.events) {
            Ok(()) => true,
            Err(pkt) => {
                log::debug!("cpu: {pkt} refused, waiting for retry");
                self.parked.push_front(pkt);
                false
            }
        }
    }

    /// Runs until `done` holds.
    pub fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> eyre::Result<()> {
        while !done(self) {
            if !self.step() {
                eyre::bail!("ran out of events at {} ({})", self.now(), self.cache);
            }
        }
        Ok(())
    }

    /// Runs until no event is left.
    ///
    /// Fails if a request never got its response.
    pub fn run(&mut self) -> eyre::Result<()> {
        while self.step() {}
        if !self.parked.is_empty() || !self.outstanding.is_empty() {
            eyre::bail!(
                "{} requests parked and {} without response at {} ({})",
                self.parked.len(),
                self.outstanding.len(),
                self.now(),
                self.cache
            );
        }
        Ok(())
    }

    /// Issues a request and runs until its response arrives.
    pub fn access(
        &mut self,
        cmd: Command,
        addr: address,
        dir: Direction,
        size: u64,
        data: Option<Vec<u8>>,
    ) -> eyre::Result<Packet> {
        let pkt = self.request(cmd, addr, dir, size, data);
        let id = pkt.id;
        self.issue(pkt);
        self.run_until(|sys| sys.completed.iter().any(|(_, pkt)| pkt.id == id))?;
        let Some(idx) = self.completed.iter().position(|(_, pkt)| pkt.id == id) else {
            unreachable!("response {id} was just delivered");
        };
        Ok(self.completed.remove(idx).1)
    }

    /// Reads a word.
    pub fn read(&mut self, addr: address, dir: Direction) -> eyre::Result<u64> {
        let response = self.access(Command::ReadReq, addr, dir, 8, None)?;
        response
            .value()
            .ok_or_else(|| eyre::eyre!("read of {addr:#x} returned no data"))
    }

    /// Reads `count` consecutive words in the order of `dir`.
    pub fn read_words(
        &mut self,
        addr: address,
        dir: Direction,
        count: usize,
    ) -> eyre::Result<Vec<u64>> {
        let size = count as u64 * crate::WORD_SIZE;
        let response = self.access(Command::ReadReq, addr, dir, size, None)?;
        let data = response
            .data
            .ok_or_else(|| eyre::eyre!("read of {addr:#x} returned no data"))?;
        data.chunks_exact(crate::WORD_SIZE as usize)
            .map(|word| Ok(u64::from_le_bytes(word.try_into()?)))
            .collect()
    }

    /// Writes a word.
    pub fn write(&mut self, addr: address, dir: Direction, value: u64) -> eyre::Result<()> {
        let data = value.to_le_bytes().to_vec();
        self.access(Command::WriteReq, addr, dir, 8, Some(data))?;
        Ok(())
    }

    /// Issues every trace record at its tick and runs to completion.
    pub fn replay(&mut self, records: &[trace::Record]) -> eyre::Result<()> {
        let geometry = *self.cache.geometry();
        for record in records {
            let pkt = record.to_packet(&geometry)?;
            let time = record.tick.max(self.now());
            self.issue_at(time, pkt);
        }
        self.run()
    }

    #[must_use]
    pub fn all_stats(&self) -> stats::Stats {
        stats::Stats {
            cache: self.cache.stats(),
            memory: self.memory.stats.clone(),
            sim: self.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::System;
    use crate::{
        cache,
        config::SimConfig,
        direction::Direction,
        packet::Command,
        testing::{self, Oracle, XorShift},
    };
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;
    use stats::{AccessKind, BlockCause, RequestStatus};
    use std::collections::HashMap;

    #[test]
    fn coalesced_reads_share_one_fetch() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        let a = sys.request(Command::ReadReq, 0x100, Direction::Row, 8, None);
        let b = sys.request(Command::ReadReq, 0x108, Direction::Row, 8, None);
        sys.issue(a);
        sys.issue(b);
        sys.run_until(|sys| sys.cache.mshrs().iter().any(|mshr| mshr.total_targets() == 2))?;
        diff::assert_eq!(sys.cache.mshrs().len(), 1);
        sys.run()?;

        diff::assert_eq!(sys.take_responses().len(), 2);
        diff::assert_eq!(sys.memory.stats.reads, 1);
        let stats = sys.cache.stats();
        diff::assert_eq!(stats.total(RequestStatus::MISS), 1);
        diff::assert_eq!(stats.total(RequestStatus::MSHR_HIT), 1);
        Ok(())
    }

    #[test]
    fn write_behind_in_service_read_is_deferred() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        let read = sys.request(Command::ReadReq, 0x100, Direction::Row, 8, None);
        let read_id = read.id;
        sys.issue(read);
        sys.run_until(|sys| sys.cache.mshrs().iter().any(|mshr| mshr.in_service))?;

        let write = sys.request(
            Command::WriteReq,
            0x100,
            Direction::Row,
            8,
            Some(5u64.to_le_bytes().to_vec()),
        );
        let write_id = write.id;
        sys.issue(write);
        sys.run()?;

        let stats = sys.cache.stats();
        diff::assert_eq!(stats.mshr.deferred_targets, 1);
        let responses = sys.take_responses();
        let order: Vec<u64> = responses.iter().map(|(_, pkt)| pkt.id).collect();
        diff::assert_eq!(order, vec![read_id, write_id]);
        // the read saw the old value
        diff::assert_eq!(responses[0].1.value(), Some(0));
        diff::assert_eq!(sys.read(0x100, Direction::Row)?, 5);
        Ok(())
    }

    #[test]
    fn blocked_cache_retries_parked_requests() -> eyre::Result<()> {
        testing::init_logging();
        let config = SimConfig {
            cache: cache::Config {
                mshrs: 1,
                ..testing::small_config().cache
            },
            ..SimConfig::default()
        };
        let mut sys = System::new(config)?;
        for addr in [0x0, 0x1000, 0x2000] {
            let pkt = sys.request(Command::ReadReq, addr, Direction::Row, 8, None);
            sys.issue(pkt);
        }
        sys.run()?;

        diff::assert_eq!(sys.take_responses().len(), 3);
        let stats = sys.cache.stats();
        assert!(stats.blocking.rejected >= 1);
        assert!(stats.blocking.retries >= 1);
        assert!(stats.blocking.cycles.get(&BlockCause::NO_MSHRS).is_some_and(|c| *c > 0));
        assert!(
            stats.count(
                stats::Direction::Row,
                AccessKind::Read,
                BlockCause::NO_MSHRS
            ) >= 1
        );
        Ok(())
    }

    #[test]
    fn uncacheable_accesses_bypass_the_cache() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::small_config())?;
        sys.write(0x200, Direction::Row, 7)?;

        let mut read = sys.request(Command::ReadReq, 0x200, Direction::Row, 8, None);
        read.uncacheable = true;
        sys.issue(read);
        sys.run()?;
        let responses = sys.take_responses();
        diff::assert_eq!(responses.len(), 1);
        // the dirty copy was flushed before the read went to memory
        diff::assert_eq!(responses[0].1.value(), Some(7));
        assert!(sys
            .cache
            .tags()
            .find_block(0x200, Direction::Row, false)
            .is_none());

        let mut write = sys.request(
            Command::WriteReq,
            0x200,
            Direction::Row,
            8,
            Some(9u64.to_le_bytes().to_vec()),
        );
        write.uncacheable = true;
        sys.issue(write);
        sys.run()?;
        diff::assert_eq!(sys.memory.read_word(0x200), 9);
        diff::assert_eq!(sys.cache.stats().total(RequestStatus::UNCACHEABLE), 2);
        Ok(())
    }

    #[test]
    fn every_request_gets_one_response() -> eyre::Result<()> {
        testing::init_logging();
        let mut sys = System::new(testing::tiny_config())?;
        let mut rng = XorShift::new(7);
        let mut issued = 0;
        for tick in 0..200 {
            let (cmd, addr, dir, size, data) = testing::random_access(&mut rng, sys.cache.geometry());
            let pkt = sys.request(cmd, addr, dir, size, data);
            sys.issue_at(tick, pkt);
            issued += 1;
        }
        sys.run()?;
        diff::assert_eq!(sys.take_responses().len(), issued);
        assert!(sys.cache.is_idle());
        Ok(())
    }

    #[test]
    fn held_write_does_not_stall_later_misses() -> eyre::Result<()> {
        testing::init_logging();
        // few MSHRs and back to back requests keep writes waiting behind
        // misses that are not ready yet
        for seed in [3, 7, 11] {
            let mut sys = System::new(testing::tiny_config())?;
            let mut rng = XorShift::new(seed);
            for tick in 0..300 {
                let (cmd, addr, dir, size, data) =
                    testing::random_access(&mut rng, sys.cache.geometry());
                let pkt = sys.request(cmd, addr, dir, size, data);
                sys.issue_at(tick, pkt);
            }
            sys.run()?;
            diff::assert_eq!(sys.take_responses().len(), 300, "seed {seed}");
            assert!(sys.cache.is_idle(), "seed {seed}");
        }
        Ok(())
    }

    #[test]
    fn overlapping_accesses_match_flat_memory() -> eyre::Result<()> {
        testing::init_logging();
        let configs = [
            testing::tiny_config(),
            testing::tiled_config(),
            testing::small_config(),
        ];
        for config in configs {
            for seed in 1..=20 {
                let mut sys = System::new(config.clone())?;
                let geometry = *sys.cache.geometry();
                let mut oracle = Oracle::default();
                let mut rng = XorShift::new(seed);
                // reads see every write issued before them
                let mut expected = HashMap::new();
                for i in 0..300 {
                    let (cmd, addr, dir, size, data) = testing::random_access(&mut rng, &geometry);
                    let pkt = sys.request(cmd, addr, dir, size, data.clone());
                    match data {
                        Some(data) => oracle.write(&geometry, addr, dir, &data),
                        None => {
                            let what = format!("seed {seed}: #{i} {cmd} {addr:#x} {dir} {size}");
                            expected.insert(pkt.id, (what, oracle.read(&geometry, addr, dir, size)));
                        }
                    }
                    sys.issue_at(i * 3, pkt);
                }
                sys.run()?;

                for (_, pkt) in sys.take_responses() {
                    if let Some((what, data)) = expected.remove(&pkt.id) {
                        diff::assert_eq!(pkt.data, Some(data), "{what}");
                    }
                }
                assert!(expected.is_empty(), "{} reads without response", expected.len());
                for (addr, value) in oracle.iter() {
                    diff::assert_eq!(sys.read(addr, Direction::Row)?, value, "seed {seed}: {addr:#x}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn sequential_accesses_match_flat_memory() -> eyre::Result<()> {
        testing::init_logging();
        for config in [testing::tiny_config(), testing::tiled_config()] {
            let mut sys = System::new(config)?;
            let mut oracle = Oracle::default();
            let mut rng = XorShift::new(42);
            for _ in 0..600 {
                let (cmd, addr, dir, size, data) =
                    testing::random_access(&mut rng, sys.cache.geometry());
                let response = sys.access(cmd, addr, dir, size, data.clone())?;
                let geometry = *sys.cache.geometry();
                match data {
                    Some(data) => oracle.write(&geometry, addr, dir, &data),
                    None => diff::assert_eq!(
                        response.data,
                        Some(oracle.read(&geometry, addr, dir, size)),
                        "{cmd} {addr:#x} {dir}"
                    ),
                }
            }
            sys.run()?;
            for (addr, value) in oracle.iter() {
                diff::assert_eq!(sys.read(addr, Direction::Row)?, value, "{addr:#x}");
            }
        }
        Ok(())
    }
}
