//! Functional memory with a fixed access latency.

use crate::{
    address,
    direction::{Geometry, WORD_SIZE},
    engine::{Event, Scheduler, Time},
    interconn,
    packet::{Command, Packet},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_latency() -> u64 {
    30
}

fn default_max_outstanding() -> usize {
    16
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_latency")]
    pub latency: u64,
    /// Requests in flight before the memory refuses new ones.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            latency: default_latency(),
            max_outstanding: default_max_outstanding(),
        }
    }
}

/// Memory backing a single cache.
///
/// Contents are stored per physical word, so packets of either direction
/// observe the same bytes.
#[derive(Debug)]
pub struct SimpleMemory {
    geometry: Geometry,
    latency: u64,
    max_outstanding: usize,
    words: BTreeMap<address, [u8; WORD_SIZE as usize]>,
    outstanding: usize,
    retry_pending: bool,
    pub stats: stats::Memory,
}

impl SimpleMemory {
    #[must_use]
    pub fn new(config: &Config, geometry: Geometry) -> Self {
        Self {
            geometry,
            latency: config.latency,
            max_outstanding: config.max_outstanding.max(1),
            words: BTreeMap::new(),
            outstanding: 0,
            retry_pending: false,
            stats: stats::Memory::default(),
        }
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn read_byte(&self, addr: address) -> u8 {
        let word = addr & !(WORD_SIZE - 1);
        self.words
            .get(&word)
            .map_or(0, |bytes| bytes[(addr - word) as usize])
    }

    fn write_byte(&mut self, addr: address, value: u8) {
        let word = addr & !(WORD_SIZE - 1);
        self.words.entry(word).or_insert([0; WORD_SIZE as usize])[(addr - word) as usize] = value;
    }

    /// Reads `size` bytes at `addr` in the linear order of `dir`.
    #[must_use]
    pub fn read(&self, addr: address, dir: crate::Direction, size: u64) -> Vec<u8> {
        (0..size)
            .map(|k| self.read_byte(self.geometry.add_offset(addr, dir, k)))
            .collect()
    }

    /// Writes bytes at `addr` in the linear order of `dir`.
    pub fn write(&mut self, addr: address, dir: crate::Direction, data: &[u8]) {
        for (k, value) in data.iter().enumerate() {
            let phys = self.geometry.add_offset(addr, dir, k as u64);
            self.write_byte(phys, *value);
        }
    }

    /// Little endian word at a physical address.
    #[must_use]
    pub fn read_word(&self, addr: address) -> u64 {
        let word = addr & !(WORD_SIZE - 1);
        u64::from_le_bytes(self.words.get(&word).copied().unwrap_or_default())
    }

    /// Applies the words of a block sized writeback that are marked dirty.
    fn write_back(&mut self, pkt: &Packet) {
        let Some(data) = &pkt.data else {
            return;
        };
        let word_size = WORD_SIZE as usize;
        for (i, bytes) in data.chunks_exact(word_size).enumerate() {
            let dirty = pkt
                .word_dirty
                .as_ref()
                .map_or(true, |mask| mask.get(i).is_some_and(|bit| *bit));
            if dirty {
                let offset = i as u64 * WORD_SIZE;
                let addr = self.geometry.add_offset(pkt.addr, pkt.dir, offset);
                self.write(addr, crate::Direction::Row, bytes);
            }
        }
    }

    /// Performs the functional part of a request.
    ///
    /// Returns the response, if one is needed.
    pub fn access(&mut self, mut pkt: Packet) -> Option<Packet> {
        use Command::*;
        log::debug!("memory::access({pkt})");
        match pkt.cmd {
            ReadReq | ReadSharedReq | ReadCleanReq | ReadExReq | LoadLockedReq
            | HardPrefetchReq => {
                self.stats.reads += 1;
                self.stats.bytes_read += pkt.size;
                pkt.data = Some(self.read(pkt.addr, pkt.dir, pkt.size));
            }
            WriteReq => {
                self.stats.writes += 1;
                self.stats.bytes_written += pkt.size;
                if let Some(data) = pkt.data.take() {
                    self.write(pkt.addr, pkt.dir, &data);
                }
            }
            StoreCondReq => {
                // without a reservation at this level the store always succeeds
                self.stats.writes += 1;
                if let Some(data) = pkt.data.take() {
                    self.write(pkt.addr, pkt.dir, &data);
                }
                pkt.sc_success = Some(true);
            }
            SwapReq => {
                self.stats.reads += 1;
                self.stats.writes += 1;
                let old = self.read(pkt.addr, pkt.dir, pkt.size);
                if let Some(data) = &pkt.data {
                    self.write(pkt.addr, pkt.dir, data);
                }
                pkt.data = Some(old);
            }
            WritebackDirty => {
                self.stats.writebacks += 1;
                self.stats.bytes_written += pkt.size;
                self.write_back(&pkt);
            }
            WritebackClean => {
                self.stats.writebacks += 1;
            }
            CleanEvict => {
                self.stats.clean_evicts += 1;
            }
            UpgradeReq | InvalidateReq => {
                self.stats.upgrades += 1;
            }
            ReadResp | ReadRespWithInvalidate | WriteResp | ReadExResp | UpgradeResp
            | InvalidateResp | SwapResp | StoreCondResp | HardPrefetchResp => {
                panic!("memory received response {pkt}");
            }
        }
        if !pkt.needs_response() {
            return None;
        }
        pkt.make_response();
        Some(pkt)
    }

    /// A response scheduled earlier reached the cache.
    pub fn response_delivered(&mut self, sched: &mut dyn Scheduler) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.retry_pending && self.outstanding < self.max_outstanding {
            self.retry_pending = false;
            let now = sched.now();
            sched.schedule(now, Event::MemRequestRetry);
        }
    }

    fn response_time(&self, now: Time) -> Time {
        now + self.latency
    }
}

impl interconn::RequestPort for SimpleMemory {
    fn send_timing_req(&mut self, pkt: Packet, sched: &mut dyn Scheduler) -> bool {
        if self.outstanding >= self.max_outstanding {
            self.stats.rejected += 1;
            self.retry_pending = true;
            log::debug!("memory::send_timing_req({pkt}) refused");
            return false;
        }
        if let Some(response) = self.access(pkt) {
            self.outstanding += 1;
            let time = self.response_time(sched.now());
            sched.schedule(time, Event::MemResponse(response));
        }
        true
    }
}
