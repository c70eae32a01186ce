//! Checkpoints of cache state.
//!
//! Cache contents are not saved. A cache without dirty data can be
//! restored empty and refetch from memory, a cache with dirty data cannot.

use crate::cache::Cache;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("checkpoint of {name} is invalid: {dirty_blocks} dirty blocks were not saved")]
    Dirty { name: String, dirty_blocks: usize },
    #[error("checkpoint of {found} does not belong to {expected}")]
    Name { expected: String, found: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    /// false if dirty data was lost
    pub valid: bool,
    pub dirty_blocks: usize,
}

impl Cache {
    /// Takes a checkpoint.
    ///
    /// Dirty blocks make the checkpoint invalid: restoring from it fails.
    pub fn checkpoint(&self) -> Checkpoint {
        let dirty_blocks = self
            .tags()
            .valid_blocks()
            .filter(|(_, block)| block.is_dirty())
            .count();
        if dirty_blocks > 0 {
            log::warn!(
                "{}: {dirty_blocks} dirty blocks are not saved, the checkpoint is invalid",
                self.name
            );
        }
        Checkpoint {
            name: self.name.clone(),
            valid: dirty_blocks == 0,
            dirty_blocks,
        }
    }

    /// Restores from a checkpoint, starting with an empty cache.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), Error> {
        checkpoint.check(&self.name)?;
        self.invalidate_all();
        log::info!("{}: restored from checkpoint", self.name);
        Ok(())
    }
}

impl Checkpoint {
    /// Fails for invalid checkpoints and checkpoints of another cache.
    pub fn check(&self, name: &str) -> Result<(), Error> {
        if self.name != name {
            return Err(Error::Name {
                expected: name.to_string(),
                found: self.name.clone(),
            });
        }
        if !self.valid {
            return Err(Error::Dirty {
                name: self.name.clone(),
                dirty_blocks: self.dirty_blocks,
            });
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = std::fs::File::open(path)?;
        let checkpoint = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(checkpoint)
    }
}
