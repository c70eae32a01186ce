use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use strum::IntoEnumIterator;

#[derive(
    Debug,
    strum::EnumIter,
    strum::Display,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum Direction {
    Row,
    Column,
}

#[derive(
    Debug,
    strum::EnumIter,
    strum::Display,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum AccessKind {
    Read,
    Write,
    LoadLocked,
    StoreCond,
    Swap,
    ReadShared,
    ReadExclusive,
    Upgrade,
    Invalidate,
    Writeback,
    CleanEvict,
    Prefetch,
}

impl AccessKind {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(
            self,
            AccessKind::Write
                | AccessKind::StoreCond
                | AccessKind::Swap
                | AccessKind::ReadExclusive
                | AccessKind::Upgrade
                | AccessKind::Invalidate
                | AccessKind::Writeback
        )
    }
}

#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum RequestStatus {
    HIT = 0,
    MISS,
    MSHR_HIT,
    UNCACHEABLE,
    /// hit in the cross direction block (single word accesses)
    CROSS_HIT,
}

#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum BlockCause {
    /// all MSHRs are allocated
    NO_MSHRS = 0,
    /// write buffer is full
    NO_WRITE_BUFFERS,
    /// an MSHR ran out of targets
    NO_TARGETS,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessStat {
    Status(RequestStatus),
    Rejected(BlockCause),
}

impl std::fmt::Display for AccessStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessStat::Status(status) => write!(f, "{status:?}"),
            AccessStat::Rejected(cause) => write!(f, "REJECTED_{cause:?}"),
        }
    }
}

impl From<RequestStatus> for AccessStat {
    fn from(status: RequestStatus) -> Self {
        AccessStat::Status(status)
    }
}

impl From<BlockCause> for AccessStat {
    fn from(cause: BlockCause) -> Self {
        AccessStat::Rejected(cause)
    }
}

pub type AccessKey = (Direction, AccessKind, AccessStat);
pub type CacheCsvRow = (AccessKey, usize);

mod as_rows {
    use super::AccessKey;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S>(accesses: &HashMap<AccessKey, usize>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut rows: Vec<_> = accesses.iter().collect();
        rows.sort();
        serializer.collect_seq(rows)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<AccessKey, usize>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let rows: Vec<(AccessKey, usize)> = Vec::deserialize(deserializer)?;
        Ok(rows.into_iter().collect())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocking {
    pub count: BTreeMap<BlockCause, u64>,
    pub cycles: BTreeMap<BlockCause, u64>,
    /// requests refused while blocked
    pub rejected: u64,
    pub retries: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mshr {
    pub hits: u64,
    pub misses: u64,
    pub uncacheable: u64,
    pub deferred_targets: u64,
    pub bonus_targets: u64,
    pub blocked_targets: u64,
    pub refetches: u64,
    pub issued_prefetches: u64,
    pub redundant_prefetches: u64,
    pub squashed_prefetches: u64,
    pub useful_prefetches: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consistency {
    /// cross direction blocks invalidated before a write completed
    pub cross_invalidations: u64,
    /// cross direction blocks written back so a fetch observes their words
    pub cross_writebacks: u64,
    /// cross direction blocks that lost write permission
    pub cross_downgrades: u64,
    /// cross direction MSHRs found while marking a new target
    pub mshr_conflicts: u64,
    pub post_writebacks: u64,
    pub post_invalidates: u64,
    /// writebacks generated by post service obligations
    pub conflict_writebacks: u64,
    /// writes hitting a writable block that were ordered behind a cross MSHR
    pub ordered_write_hits: u64,
    /// reads hitting a readable block that waited for a pending cross write
    pub ordered_read_hits: u64,
    pub max_duplicates: i64,
    pub tile_evictions: u64,
    pub tile_invalidations: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latency {
    pub hit_total: u64,
    pub hit_count: u64,
    pub miss_total: u64,
    pub miss_count: u64,
}

impl Latency {
    #[must_use]
    pub fn mean_miss_latency(&self) -> Option<f64> {
        if self.miss_count == 0 {
            None
        } else {
            Some(self.miss_total as f64 / self.miss_count as f64)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snoop {
    pub received: u64,
    pub responded: u64,
    pub invalidated: u64,
    pub downgraded: u64,
    pub deferred: u64,
    pub forwarded: u64,
    pub write_buffer_hits: u64,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    #[serde(with = "as_rows")]
    pub accesses: HashMap<AccessKey, usize>,
    pub blocking: Blocking,
    pub mshr: Mshr,
    pub consistency: Consistency,
    pub latency: Latency,
    pub snoop: Snoop,
    pub fills: u64,
    pub replacements: u64,
    pub writebacks: u64,
    pub clean_evicts: u64,
    pub temp_block_fills: u64,
}

impl Default for Cache {
    fn default() -> Self {
        let mut accesses = HashMap::new();
        for dir in Direction::iter() {
            for kind in AccessKind::iter() {
                for status in RequestStatus::iter() {
                    accesses.insert((dir, kind, AccessStat::Status(status)), 0);
                }
                for cause in BlockCause::iter() {
                    accesses.insert((dir, kind, AccessStat::Rejected(cause)), 0);
                }
            }
        }
        Self {
            accesses,
            blocking: Blocking::default(),
            mshr: Mshr::default(),
            consistency: Consistency::default(),
            latency: Latency::default(),
            snoop: Snoop::default(),
            fills: 0,
            replacements: 0,
            writebacks: 0,
            clean_evicts: 0,
            temp_block_fills: 0,
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut accesses: Vec<_> = self
            .accesses
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|((dir, kind, stat), count)| (format!("{dir}.{kind}[{stat}]"), count))
            .collect();
        accesses.sort_by_key(|(key, _)| key.clone());

        let mut out = f.debug_struct("CacheStats");
        for (key, count) in accesses {
            out.field(&key, count);
        }
        out.field("blocking", &self.blocking)
            .field("mshr", &self.mshr)
            .field("consistency", &self.consistency)
            .field("latency", &self.latency)
            .field("snoop", &self.snoop)
            .finish_non_exhaustive()
    }
}

impl Cache {
    #[inline]
    pub fn inc(
        &mut self,
        dir: impl Into<Direction>,
        kind: impl Into<AccessKind>,
        access: impl Into<AccessStat>,
        count: usize,
    ) {
        *self
            .accesses
            .entry((dir.into(), kind.into(), access.into()))
            .or_insert(0) += count;
    }

    #[must_use]
    pub fn count(&self, dir: Direction, kind: AccessKind, access: impl Into<AccessStat>) -> usize {
        self.accesses
            .get(&(dir, kind, access.into()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of accesses with the given status summed over directions and kinds.
    #[must_use]
    pub fn total(&self, status: RequestStatus) -> usize {
        self.accesses
            .iter()
            .filter(|((_, _, stat), _)| *stat == AccessStat::Status(status))
            .map(|(_, count)| count)
            .sum()
    }

    pub fn shave(&mut self) {
        self.accesses.retain(|_, v| *v > 0);
    }

    #[must_use]
    pub fn flatten(self) -> Vec<CacheCsvRow> {
        let mut flattened: Vec<_> = self.accesses.into_iter().collect();
        flattened.sort_by_key(|(access, _)| *access);
        flattened
    }

    /// Scalar counters as `(name, value)` pairs.
    #[must_use]
    pub fn counters(&self) -> Vec<(String, u64)> {
        let mut rows = vec![
            ("fills".to_string(), self.fills),
            ("replacements".to_string(), self.replacements),
            ("writebacks".to_string(), self.writebacks),
            ("clean_evicts".to_string(), self.clean_evicts),
            ("temp_block_fills".to_string(), self.temp_block_fills),
            ("blocking.rejected".to_string(), self.blocking.rejected),
            ("blocking.retries".to_string(), self.blocking.retries),
        ];
        for (cause, count) in &self.blocking.count {
            rows.push((format!("blocking.count.{cause:?}"), *count));
        }
        for (cause, cycles) in &self.blocking.cycles {
            rows.push((format!("blocking.cycles.{cause:?}"), *cycles));
        }
        let m = &self.mshr;
        rows.extend([
            ("mshr.hits".to_string(), m.hits),
            ("mshr.misses".to_string(), m.misses),
            ("mshr.uncacheable".to_string(), m.uncacheable),
            ("mshr.deferred_targets".to_string(), m.deferred_targets),
            ("mshr.bonus_targets".to_string(), m.bonus_targets),
            ("mshr.blocked_targets".to_string(), m.blocked_targets),
            ("mshr.refetches".to_string(), m.refetches),
            ("mshr.issued_prefetches".to_string(), m.issued_prefetches),
            ("mshr.redundant_prefetches".to_string(), m.redundant_prefetches),
            ("mshr.squashed_prefetches".to_string(), m.squashed_prefetches),
            ("mshr.useful_prefetches".to_string(), m.useful_prefetches),
        ]);
        let c = &self.consistency;
        rows.extend([
            ("consistency.cross_invalidations".to_string(), c.cross_invalidations),
            ("consistency.cross_writebacks".to_string(), c.cross_writebacks),
            ("consistency.cross_downgrades".to_string(), c.cross_downgrades),
            ("consistency.mshr_conflicts".to_string(), c.mshr_conflicts),
            ("consistency.post_writebacks".to_string(), c.post_writebacks),
            ("consistency.post_invalidates".to_string(), c.post_invalidates),
            ("consistency.conflict_writebacks".to_string(), c.conflict_writebacks),
            ("consistency.ordered_write_hits".to_string(), c.ordered_write_hits),
            ("consistency.ordered_read_hits".to_string(), c.ordered_read_hits),
            (
                "consistency.max_duplicates".to_string(),
                u64::try_from(c.max_duplicates).unwrap_or(0),
            ),
            ("consistency.tile_evictions".to_string(), c.tile_evictions),
            ("consistency.tile_invalidations".to_string(), c.tile_invalidations),
        ]);
        let l = &self.latency;
        rows.extend([
            ("latency.hit_total".to_string(), l.hit_total),
            ("latency.hit_count".to_string(), l.hit_count),
            ("latency.miss_total".to_string(), l.miss_total),
            ("latency.miss_count".to_string(), l.miss_count),
        ]);
        let s = &self.snoop;
        rows.extend([
            ("snoop.received".to_string(), s.received),
            ("snoop.responded".to_string(), s.responded),
            ("snoop.invalidated".to_string(), s.invalidated),
            ("snoop.downgraded".to_string(), s.downgraded),
            ("snoop.deferred".to_string(), s.deferred),
            ("snoop.forwarded".to_string(), s.forwarded),
            ("snoop.write_buffer_hits".to_string(), s.write_buffer_hits),
        ]);
        rows
    }
}

impl std::ops::AddAssign for Cache {
    fn add_assign(&mut self, other: Self) {
        for (k, v) in other.accesses {
            *self.accesses.entry(k).or_insert(0) += v;
        }
        for (k, v) in other.blocking.count {
            *self.blocking.count.entry(k).or_insert(0) += v;
        }
        for (k, v) in other.blocking.cycles {
            *self.blocking.cycles.entry(k).or_insert(0) += v;
        }
        self.blocking.rejected += other.blocking.rejected;
        self.blocking.retries += other.blocking.retries;

        self.mshr.hits += other.mshr.hits;
        self.mshr.misses += other.mshr.misses;
        self.mshr.uncacheable += other.mshr.uncacheable;
        self.mshr.deferred_targets += other.mshr.deferred_targets;
        self.mshr.bonus_targets += other.mshr.bonus_targets;
        self.mshr.blocked_targets += other.mshr.blocked_targets;
        self.mshr.refetches += other.mshr.refetches;
        self.mshr.issued_prefetches += other.mshr.issued_prefetches;
        self.mshr.redundant_prefetches += other.mshr.redundant_prefetches;
        self.mshr.squashed_prefetches += other.mshr.squashed_prefetches;
        self.mshr.useful_prefetches += other.mshr.useful_prefetches;

        let c = other.consistency;
        self.consistency.cross_invalidations += c.cross_invalidations;
        self.consistency.cross_writebacks += c.cross_writebacks;
        self.consistency.cross_downgrades += c.cross_downgrades;
        self.consistency.mshr_conflicts += c.mshr_conflicts;
        self.consistency.post_writebacks += c.post_writebacks;
        self.consistency.post_invalidates += c.post_invalidates;
        self.consistency.conflict_writebacks += c.conflict_writebacks;
        self.consistency.ordered_write_hits += c.ordered_write_hits;
        self.consistency.ordered_read_hits += c.ordered_read_hits;
        self.consistency.max_duplicates = self.consistency.max_duplicates.max(c.max_duplicates);
        self.consistency.tile_evictions += c.tile_evictions;
        self.consistency.tile_invalidations += c.tile_invalidations;

        self.latency.hit_total += other.latency.hit_total;
        self.latency.hit_count += other.latency.hit_count;
        self.latency.miss_total += other.latency.miss_total;
        self.latency.miss_count += other.latency.miss_count;

        self.snoop.received += other.snoop.received;
        self.snoop.responded += other.snoop.responded;
        self.snoop.invalidated += other.snoop.invalidated;
        self.snoop.downgraded += other.snoop.downgraded;
        self.snoop.deferred += other.snoop.deferred;
        self.snoop.forwarded += other.snoop.forwarded;
        self.snoop.write_buffer_hits += other.snoop.write_buffer_hits;

        self.fills += other.fills;
        self.replacements += other.replacements;
        self.writebacks += other.writebacks;
        self.clean_evicts += other.clean_evicts;
        self.temp_block_fills += other.temp_block_fills;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_and_total() {
        let mut stats = Cache::default();
        stats.inc(Direction::Row, AccessKind::Read, RequestStatus::HIT, 2);
        stats.inc(Direction::Column, AccessKind::Write, RequestStatus::HIT, 1);
        stats.inc(Direction::Column, AccessKind::Read, RequestStatus::MISS, 1);
        assert_eq!(stats.total(RequestStatus::HIT), 3);
        assert_eq!(stats.total(RequestStatus::MISS), 1);
        assert_eq!(
            stats.count(Direction::Row, AccessKind::Read, RequestStatus::HIT),
            2
        );
    }

    #[test]
    fn add_assign_merges_counters() {
        let mut a = Cache::default();
        let mut b = Cache::default();
        a.inc(Direction::Row, AccessKind::Read, RequestStatus::MISS, 1);
        b.inc(Direction::Row, AccessKind::Read, RequestStatus::MISS, 2);
        b.consistency.max_duplicates = 4;
        b.mshr.hits = 3;
        a += b;
        assert_eq!(a.count(Direction::Row, AccessKind::Read, RequestStatus::MISS), 3);
        assert_eq!(a.consistency.max_duplicates, 4);
        assert_eq!(a.mshr.hits, 3);
    }

    #[test]
    fn shave_keeps_only_nonzero() {
        let mut stats = Cache::default();
        stats.inc(Direction::Row, AccessKind::Swap, BlockCause::NO_MSHRS, 1);
        stats.shave();
        assert_eq!(stats.accesses.len(), 1);
        let rows = stats.flatten();
        assert_eq!(
            rows,
            vec![(
                (
                    Direction::Row,
                    AccessKind::Swap,
                    AccessStat::Rejected(BlockCause::NO_MSHRS)
                ),
                1
            )]
        );
    }
}
