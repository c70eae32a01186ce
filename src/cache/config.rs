use super::set_index;
use crate::direction::{Geometry, GeometryError};
use crate::prefetch;
use serde::{Deserialize, Serialize};

/// A cache replacement policy
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
)]
pub enum ReplacementPolicy {
    #[default]
    LRU,
    FIFO,
}

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
pub enum Organization {
    #[default]
    SetAssociative,
    /// a single set holding every block
    FullyAssociative,
}

/// Relation of the cache contents to the caches above.
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
pub enum Clusivity {
    #[default]
    MostlyInclusive,
    MostlyExclusive,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("cache size {size} is not a multiple of {assoc} ways of {block_size} bytes")]
    Size {
        size: u64,
        assoc: usize,
        block_size: u64,
    },
    #[error("associativity must be non-zero")]
    ZeroAssociativity,
    #[error("{function} set index needs a power of two number of sets (got {num_sets})")]
    SetIndex {
        function: set_index::Function,
        num_sets: usize,
    },
    #[error("{0} must be non-zero")]
    ZeroResource(&'static str),
    #[error("demand reserve of {reserve} leaves no room in {mshrs} MSHRs")]
    DemandReserve { reserve: usize, mshrs: usize },
    #[error("a physically 2D cache must support both directions")]
    TwoDimensionalWithoutDual,
    #[error("a physically 2D cache requires the tiled set index function")]
    TwoDimensionalSetIndex,
    #[error("a physically 2D cache needs a multiple of {words} sets (got {num_sets})")]
    TwoDimensionalSets { num_sets: usize, words: usize },
}

fn default_name() -> String {
    "cache".to_string()
}

fn default_size() -> u64 {
    32 * 1024
}

fn default_assoc() -> usize {
    4
}

fn default_block_size() -> u64 {
    64
}

fn default_row_width() -> u64 {
    8
}

fn default_tag_latency() -> u64 {
    2
}

fn default_data_latency() -> u64 {
    2
}

fn default_response_latency() -> u64 {
    2
}

fn default_forward_latency() -> u64 {
    1
}

fn default_mshrs() -> usize {
    4
}

fn default_targets_per_mshr() -> usize {
    8
}

fn default_write_buffers() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_track_duplicates() -> bool {
    crate::is_debug()
}

/// Cache configuration.
#[allow(clippy::struct_excessive_bools)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    /// Cache size in bytes.
    #[serde(default = "default_size")]
    pub size: u64,
    /// Cache associativity.
    #[serde(default = "default_assoc")]
    pub assoc: usize,
    /// Cache line size.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Length of a memory row in blocks.
    #[serde(default = "default_row_width")]
    pub row_width: u64,
    #[serde(default)]
    pub organization: Organization,
    #[serde(default)]
    pub replacement: ReplacementPolicy,
    #[serde(default)]
    pub set_index: set_index::Function,
    #[serde(default = "default_tag_latency")]
    pub tag_latency: u64,
    #[serde(default = "default_data_latency")]
    pub data_latency: u64,
    #[serde(default = "default_response_latency")]
    pub response_latency: u64,
    /// Latency of forwarding a request that does not allocate.
    #[serde(default = "default_forward_latency")]
    pub forward_latency: u64,
    /// Tag and data lookups happen one after the other.
    #[serde(default)]
    pub sequential_access: bool,
    #[serde(default = "default_mshrs")]
    pub mshrs: usize,
    #[serde(default = "default_targets_per_mshr")]
    pub targets_per_mshr: usize,
    #[serde(default = "default_write_buffers")]
    pub write_buffers: usize,
    /// MSHRs that prefetches may not use.
    #[serde(default)]
    pub demand_mshr_reserve: usize,
    #[serde(default)]
    pub clusivity: Clusivity,
    /// Evicted clean blocks are written back instead of clean evicted.
    #[serde(default)]
    pub writeback_clean: bool,
    /// Snoops are forwarded to the level above first.
    #[serde(default)]
    pub forward_snoops: bool,
    #[serde(default = "default_true")]
    pub supports_dual_direction: bool,
    #[serde(default)]
    pub physically_2d: bool,
    /// Count blocks sharing words across directions.
    #[serde(default = "default_track_duplicates")]
    pub track_duplicates: bool,
    #[serde(default)]
    pub prefetcher: prefetch::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            size: default_size(),
            assoc: default_assoc(),
            block_size: default_block_size(),
            row_width: default_row_width(),
            organization: Organization::default(),
            replacement: ReplacementPolicy::default(),
            set_index: set_index::Function::default(),
            tag_latency: default_tag_latency(),
            data_latency: default_data_latency(),
            response_latency: default_response_latency(),
            forward_latency: default_forward_latency(),
            sequential_access: false,
            mshrs: default_mshrs(),
            targets_per_mshr: default_targets_per_mshr(),
            write_buffers: default_write_buffers(),
            demand_mshr_reserve: 0,
            clusivity: Clusivity::default(),
            writeback_clean: false,
            forward_snoops: false,
            supports_dual_direction: true,
            physically_2d: false,
            track_duplicates: default_track_duplicates(),
            prefetcher: prefetch::Config::default(),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}, {}-way, {}B blocks, {} sets{})",
            self.name,
            human_bytes::human_bytes(self.size as f64),
            self.ways(),
            self.block_size,
            self.num_sets(),
            if self.physically_2d { ", 2D" } else { "" }
        )
    }
}

impl Config {
    pub fn geometry(&self) -> Result<Geometry, GeometryError> {
        Geometry::new(self.block_size, self.row_width)
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        (self.size / self.block_size) as usize
    }

    /// Number of ways per set.
    #[must_use]
    pub fn ways(&self) -> usize {
        match self.organization {
            Organization::SetAssociative => self.assoc,
            Organization::FullyAssociative => self.num_blocks(),
        }
    }

    #[must_use]
    pub fn num_sets(&self) -> usize {
        match self.organization {
            Organization::SetAssociative => self.num_blocks() / self.assoc.max(1),
            Organization::FullyAssociative => 1,
        }
    }

    /// Latency of a lookup that hits.
    #[must_use]
    pub fn access_latency(&self) -> u64 {
        if self.sequential_access {
            self.tag_latency + self.data_latency
        } else {
            self.tag_latency.max(self.data_latency)
        }
    }

    #[must_use]
    pub fn is_mostly_exclusive(&self) -> bool {
        self.clusivity == Clusivity::MostlyExclusive
    }

    pub fn validate(&self) -> Result<(), Error> {
        let geometry = self.geometry()?;
        if self.assoc == 0 {
            return Err(Error::ZeroAssociativity);
        }
        let way_bytes = self.block_size * self.assoc as u64;
        if self.size == 0 || self.size % way_bytes != 0 {
            return Err(Error::Size {
                size: self.size,
                assoc: self.assoc,
                block_size: self.block_size,
            });
        }
        let num_sets = self.num_sets();
        if self.set_index == set_index::Function::BitwiseXor && !num_sets.is_power_of_two() {
            return Err(Error::SetIndex {
                function: self.set_index,
                num_sets,
            });
        }
        for (name, value) in [
            ("mshrs", self.mshrs),
            ("targets_per_mshr", self.targets_per_mshr),
            ("write_buffers", self.write_buffers),
        ] {
            if value == 0 {
                return Err(Error::ZeroResource(name));
            }
        }
        if self.demand_mshr_reserve >= self.mshrs {
            return Err(Error::DemandReserve {
                reserve: self.demand_mshr_reserve,
                mshrs: self.mshrs,
            });
        }
        if self.physically_2d {
            if !self.supports_dual_direction {
                return Err(Error::TwoDimensionalWithoutDual);
            }
            if self.set_index != set_index::Function::Tiled {
                return Err(Error::TwoDimensionalSetIndex);
            }
        }
        let words = geometry.words_per_block();
        if self.set_index == set_index::Function::Tiled && num_sets % words != 0 {
            return Err(Error::TwoDimensionalSets { num_sets, words });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Error, Organization};
    use crate::cache::set_index;
    use crate::direction::GeometryError;
    use pretty_assertions_sorted as diff;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        diff::assert_eq!(config.validate(), Ok(()));
        diff::assert_eq!(config.num_sets(), 128);
        diff::assert_eq!(config.ways(), 4);
    }

    #[test]
    fn fully_associative_has_one_set() {
        let config = Config {
            size: 1024,
            organization: Organization::FullyAssociative,
            ..Config::default()
        };
        diff::assert_eq!(config.num_sets(), 1);
        diff::assert_eq!(config.ways(), 16);
    }

    #[test]
    fn rejects_invalid_configs() {
        let bad_block = Config {
            block_size: 48,
            ..Config::default()
        };
        diff::assert_eq!(
            bad_block.validate(),
            Err(Error::Geometry(GeometryError::BlockSize(48)))
        );

        let no_mshrs = Config {
            mshrs: 0,
            ..Config::default()
        };
        diff::assert_eq!(no_mshrs.validate(), Err(Error::ZeroResource("mshrs")));

        let linear_2d = Config {
            physically_2d: true,
            ..Config::default()
        };
        diff::assert_eq!(linear_2d.validate(), Err(Error::TwoDimensionalSetIndex));

        let few_sets = Config {
            size: 64 * 4 * 4,
            physically_2d: true,
            set_index: set_index::Function::Tiled,
            ..Config::default()
        };
        diff::assert_eq!(
            few_sets.validate(),
            Err(Error::TwoDimensionalSets {
                num_sets: 4,
                words: 8
            })
        );
    }

    #[test]
    fn deserializes_with_defaults() -> color_eyre::eyre::Result<()> {
        let config: Config = serde_yaml::from_str("size: 4096\nassoc: 2\nclusivity: mostly_exclusive\n")?;
        diff::assert_eq!(config.num_sets(), 32);
        assert!(config.is_mostly_exclusive());
        diff::assert_eq!(config.block_size, 64);
        Ok(())
    }
}
