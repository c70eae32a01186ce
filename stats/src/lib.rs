#![allow(non_camel_case_types, clippy::upper_case_acronyms)]

pub mod cache;

pub use cache::{
    AccessKind, AccessStat, BlockCause, Blocking, Cache, Consistency, Direction, Latency, Mshr,
    RequestStatus, Snoop,
};

use serde::{Deserialize, Serialize};

/// Statistics of one simulated cache level and its backing memory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub cache: Cache,
    pub memory: Memory,
    pub sim: Sim,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub reads: u64,
    pub writes: u64,
    pub writebacks: u64,
    pub clean_evicts: u64,
    pub upgrades: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub rejected: u64,
}

impl std::ops::AddAssign for Memory {
    fn add_assign(&mut self, other: Self) {
        self.reads += other.reads;
        self.writes += other.writes;
        self.writebacks += other.writebacks;
        self.clean_evicts += other.clean_evicts;
        self.upgrades += other.upgrades;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.rejected += other.rejected;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sim {
    pub ticks: u64,
    pub requests: u64,
    pub responses: u64,
    pub events: u64,
}

impl Stats {
    /// Flat `(section, key, value)` rows for csv output.
    #[must_use]
    pub fn flatten(self) -> Vec<(String, String, u64)> {
        let mut rows: Vec<(String, String, u64)> = self
            .cache
            .clone()
            .flatten()
            .into_iter()
            .map(|((dir, kind, stat), count)| {
                (
                    "cache".to_string(),
                    format!("{dir:?}.{kind:?}.{stat}"),
                    count as u64,
                )
            })
            .collect();
        for (key, value) in self.cache.counters() {
            rows.push(("cache".to_string(), key, value));
        }
        let Memory {
            reads,
            writes,
            writebacks,
            clean_evicts,
            upgrades,
            bytes_read,
            bytes_written,
            rejected,
        } = self.memory;
        for (key, value) in [
            ("reads", reads),
            ("writes", writes),
            ("writebacks", writebacks),
            ("clean_evicts", clean_evicts),
            ("upgrades", upgrades),
            ("bytes_read", bytes_read),
            ("bytes_written", bytes_written),
            ("rejected", rejected),
        ] {
            rows.push(("memory".to_string(), key.to_string(), value));
        }
        let Sim {
            ticks,
            requests,
            responses,
            events,
        } = self.sim;
        for (key, value) in [
            ("ticks", ticks),
            ("requests", requests),
            ("responses", responses),
            ("events", events),
        ] {
            rows.push(("sim".to_string(), key.to_string(), value));
        }
        rows
    }
}
