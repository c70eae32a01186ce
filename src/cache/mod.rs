pub mod base;
pub mod block;
pub mod config;
pub mod consistency;
pub mod controller;
pub mod replacement;
pub mod set_index;
pub mod snoop;

pub use config::Config;

use crate::{
    direction::Geometry,
    engine::{EventId, Time},
    interconn::UpperLevel,
    mshr,
    packet::Packet,
    prefetch::{self, Prefetcher},
    tag_array::{BlockId, TagArray},
    write_queue,
};
use block::Block;
use std::collections::VecDeque;

bitflags::bitflags! {
    /// Reasons for refusing CPU requests.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Blocked: u8 {
        const NO_MSHRS = 0b001;
        const NO_WRITE_BUFFERS = 0b010;
        const NO_TARGETS = 0b100;
    }
}

impl From<stats::BlockCause> for Blocked {
    fn from(cause: stats::BlockCause) -> Self {
        match cause {
            stats::BlockCause::NO_MSHRS => Self::NO_MSHRS,
            stats::BlockCause::NO_WRITE_BUFFERS => Self::NO_WRITE_BUFFERS,
            stats::BlockCause::NO_TARGETS => Self::NO_TARGETS,
        }
    }
}

/// Storage a request is served from.
///
/// Fills that find no replaceable block go to the temporary block and leave
/// the cache once their targets are serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Tag(BlockId),
    Temp,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
}

/// Dual direction cache.
///
/// Blocks are cached either as a row or as a column of the memory array.
/// The cache keeps both views of a word consistent: a word is never dirty
/// in one direction while the other direction holds a valid copy of it.
#[derive(Debug)]
pub struct Cache {
    pub name: String,
    config: Config,
    geometry: Geometry,
    tags: TagArray,
    temp: Block,
    mshrs: mshr::Queue,
    writes: write_queue::Queue,
    prefetcher: Option<Box<dyn Prefetcher>>,
    upper: Option<Box<dyn UpperLevel>>,
    /// global order of MSHR targets and write queue entries
    order: u64,
    blocked: Blocked,
    blocked_since: Time,
    /// MSHR whose target limit caused [`Blocked::NO_TARGETS`]
    no_targets: Option<mshr::Key>,
    /// a request was refused and the CPU waits for a retry
    must_retry: bool,
    send_event: Option<(EventId, Time)>,
    last_send: Option<Time>,
    waiting_on_retry: bool,
    snoop_responses: VecDeque<Packet>,
    pub stats: stats::Cache,
}

impl Cache {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let geometry = config.geometry().map_err(config::Error::from)?;
        let tags = TagArray::new(&config, geometry);
        log::info!(
            "{}: {} sets x {} ways, {geometry}",
            config.name,
            tags.num_sets(),
            tags.ways()
        );
        Ok(Self {
            name: config.name.clone(),
            temp: Block::new(usize::MAX, 0, &geometry),
            mshrs: mshr::Queue::new(
                config.mshrs,
                config.demand_mshr_reserve,
                config.targets_per_mshr,
            ),
            writes: write_queue::Queue::new(config.write_buffers),
            prefetcher: prefetch::build(&config.prefetcher, geometry),
            upper: None,
            order: 0,
            blocked: Blocked::empty(),
            blocked_since: 0,
            no_targets: None,
            must_retry: false,
            send_event: None,
            last_send: None,
            waiting_on_retry: false,
            snoop_responses: VecDeque::new(),
            stats: stats::Cache::default(),
            geometry,
            tags,
            config,
        })
    }

    /// Attaches the level above, which receives forwarded snoops and
    /// prefetch probes.
    pub fn set_upper(&mut self, upper: Box<dyn UpperLevel>) {
        self.upper = Some(upper);
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn tags(&self) -> &TagArray {
        &self.tags
    }

    #[must_use]
    pub fn mshrs(&self) -> &mshr::Queue {
        &self.mshrs
    }

    #[must_use]
    pub fn write_queue(&self) -> &write_queue::Queue {
        &self.writes
    }

    #[must_use]
    pub fn blocked(&self) -> Blocked {
        self.blocked
    }

    /// No request is pending in either queue.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.mshrs.is_empty() && self.writes.is_empty()
    }

    /// Snoop responses produced since the last call.
    pub fn take_snoop_responses(&mut self) -> Vec<Packet> {
        self.snoop_responses.drain(..).collect()
    }

    /// Statistics, including the duplicate tracking of the tag array.
    #[must_use]
    pub fn stats(&self) -> stats::Cache {
        let mut stats = self.stats.clone();
        stats.consistency.max_duplicates = self.tags.max_duplicates();
        stats
    }

    /// Drops every block without writing anything back.
    pub(crate) fn invalidate_all(&mut self) {
        assert!(self.is_idle(), "{self}: dropping blocks while requests are pending");
        let ids: Vec<_> = self.tags.valid_blocks().map(|(id, _)| id).collect();
        for id in ids {
            self.tags.invalidate(id);
        }
    }

    fn next_order(&mut self) -> u64 {
        let order = self.order;
        self.order += 1;
        order
    }

    fn block(&self, slot: Slot) -> &Block {
        match slot {
            Slot::Tag(id) => self.tags.block(id),
            Slot::Temp => &self.temp,
        }
    }

    fn block_mut(&mut self, slot: Slot) -> &mut Block {
        match slot {
            Slot::Tag(id) => self.tags.block_mut(id),
            Slot::Temp => &mut self.temp,
        }
    }

    fn invalidate_slot(&mut self, slot: Slot) {
        match slot {
            Slot::Tag(id) => self.tags.invalidate(id),
            Slot::Temp => self.temp.invalidate(),
        }
    }

    /// Whether a block has an MSHR and must not be replaced.
    fn is_pinned(mshrs: &mshr::Queue, block: &Block) -> bool {
        mshrs.find(block.addr, block.dir, block.is_secure()).is_some()
    }
}

impl std::fmt::Display for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(mshrs={}, writes={}, blocked={:?})",
            self.name,
            self.mshrs.len(),
            self.writes.len(),
            self.blocked
        )
    }
}
