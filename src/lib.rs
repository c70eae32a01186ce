#![allow(
    clippy::upper_case_acronyms,
    non_camel_case_types,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::module_name_repetitions
)]

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod direction;
pub mod engine;
pub mod interconn;
pub mod mem;
pub mod mshr;
pub mod packet;
pub mod prefetch;
pub mod sim;
pub mod tag_array;
pub mod trace;
pub mod write_queue;

#[cfg(test)]
pub mod testing;

pub use cache::Cache;
pub use direction::{Direction, Geometry, WORD_SIZE};
pub use packet::{Command, Packet};

pub type address = u64;

/// Whether this is a diagnostic (debug) build.
#[must_use]
pub fn is_debug() -> bool {
    cfg!(diagnostics)
}
