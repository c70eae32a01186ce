//! Hardware prefetchers.

use crate::{
    address,
    direction::{Direction, Geometry},
    engine::Time,
    packet::{self, Command, Packet},
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    #[default]
    None,
    /// fetch the following blocks in the direction of the access
    NextLine,
}

fn default_degree() -> usize {
    1
}

fn default_latency() -> u64 {
    1
}

fn default_queue_size() -> usize {
    16
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub kind: Kind,
    #[serde(default = "default_degree")]
    pub degree: usize,
    /// Time between the triggering access and the prefetch becoming ready.
    #[serde(default = "default_latency")]
    pub latency: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Only misses train the prefetcher.
    #[serde(default)]
    pub on_miss_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kind: Kind::default(),
            degree: default_degree(),
            latency: default_latency(),
            queue_size: default_queue_size(),
            on_miss_only: false,
        }
    }
}

/// Prefetch strategy driven by the cache.
pub trait Prefetcher: std::fmt::Debug {
    /// Observes a demand access.
    fn notify(&mut self, pkt: &Packet, miss: bool, now: Time);

    /// Time at which the next prefetch becomes ready.
    #[must_use]
    fn next_ready_time(&self) -> Option<Time>;

    /// Takes the next ready prefetch request.
    fn next_prefetch(&mut self, now: Time) -> Option<Packet>;
}

#[must_use]
pub fn build(config: &Config, geometry: Geometry) -> Option<Box<dyn Prefetcher>> {
    match config.kind {
        Kind::None => None,
        Kind::NextLine => Some(Box::new(NextLine::new(config, geometry))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    ready_time: Time,
    block_addr: address,
    dir: Direction,
    secure: bool,
}

/// Next line prefetcher working in the direction of the triggering access.
#[derive(Debug)]
pub struct NextLine {
    geometry: Geometry,
    degree: usize,
    latency: u64,
    queue_size: usize,
    on_miss_only: bool,
    queue: VecDeque<Candidate>,
}

impl NextLine {
    #[must_use]
    pub fn new(config: &Config, geometry: Geometry) -> Self {
        Self {
            geometry,
            degree: config.degree,
            latency: config.latency,
            queue_size: config.queue_size.max(1),
            on_miss_only: config.on_miss_only,
            queue: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Prefetcher for NextLine {
    fn notify(&mut self, pkt: &Packet, miss: bool, now: Time) {
        if pkt.uncacheable || pkt.cmd.is_prefetch() || pkt.from_cache() {
            return;
        }
        if self.on_miss_only && !miss {
            return;
        }
        let mut block_addr = pkt.block_addr(&self.geometry);
        for _ in 0..self.degree {
            block_addr = self.geometry.next_block(block_addr, pkt.dir);
            let duplicate = self
                .queue
                .iter()
                .any(|c| c.block_addr == block_addr && c.dir == pkt.dir && c.secure == pkt.secure);
            if duplicate {
                continue;
            }
            if self.queue.len() >= self.queue_size {
                self.queue.pop_front();
            }
            self.queue.push_back(Candidate {
                ready_time: now + self.latency,
                block_addr,
                dir: pkt.dir,
                secure: pkt.secure,
            });
        }
    }

    fn next_ready_time(&self) -> Option<Time> {
        self.queue.front().map(|c| c.ready_time)
    }

    fn next_prefetch(&mut self, now: Time) -> Option<Packet> {
        if self.queue.front()?.ready_time > now {
            return None;
        }
        let candidate = self.queue.pop_front()?;
        Some(
            packet::Builder {
                cmd: Command::HardPrefetchReq,
                addr: candidate.block_addr,
                dir: candidate.dir,
                size: self.geometry.block_size(),
                secure: candidate.secure,
                issued_at: now,
                ..packet::Builder::default()
            }
            .build(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Kind, NextLine, Prefetcher};
    use crate::{
        direction::{Direction, Geometry},
        packet::{self, Command},
    };
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    fn read(addr: u64, dir: Direction) -> packet::Packet {
        packet::Builder {
            cmd: Command::ReadReq,
            addr,
            dir,
            size: 8,
            ..packet::Builder::default()
        }
        .build()
    }

    #[test]
    fn prefetches_follow_the_access_direction() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let config = Config {
            kind: Kind::NextLine,
            degree: 2,
            latency: 3,
            ..Config::default()
        };
        let mut prefetcher = NextLine::new(&config, geometry);
        prefetcher.notify(&read(0x48, Direction::Row), true, 10);
        prefetcher.notify(&read(0x8, Direction::Column), true, 10);
        diff::assert_eq!(prefetcher.len(), 4);
        diff::assert_eq!(prefetcher.next_ready_time(), Some(13));
        assert!(prefetcher.next_prefetch(12).is_none());

        let addrs: Vec<_> = std::iter::from_fn(|| prefetcher.next_prefetch(13))
            .map(|pkt| (pkt.addr, pkt.dir))
            .collect();
        // column blocks advance along the row like their rows do
        diff::assert_eq!(
            addrs,
            vec![
                (0x80, Direction::Row),
                (0xc0, Direction::Row),
                (0x8 + 64, Direction::Column),
                (0x8 + 128, Direction::Column),
            ]
        );
        Ok(())
    }

    #[test]
    fn duplicates_and_filtered_accesses_are_ignored() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        let config = Config {
            kind: Kind::NextLine,
            on_miss_only: true,
            ..Config::default()
        };
        let mut prefetcher = NextLine::new(&config, geometry);
        prefetcher.notify(&read(0x40, Direction::Row), false, 0);
        assert!(prefetcher.is_empty());
        prefetcher.notify(&read(0x40, Direction::Row), true, 0);
        prefetcher.notify(&read(0x48, Direction::Row), true, 0);
        diff::assert_eq!(prefetcher.len(), 1);
        let pkt = prefetcher.next_prefetch(5).expect("prefetch");
        diff::assert_eq!(pkt.cmd, Command::HardPrefetchReq);
        diff::assert_eq!(pkt.size, 64);
        Ok(())
    }

    #[test]
    fn disabled_by_default() -> eyre::Result<()> {
        let geometry = Geometry::new(64, 8)?;
        assert!(super::build(&Config::default(), geometry).is_none());
        Ok(())
    }
}
