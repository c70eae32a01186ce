//! Access traces.
//!
//! A trace is a csv file with one request per row:
//!
//! ```text
//! tick,command,address,direction,size,value,context,uncacheable
//! 0,WriteReq,0x1000,Row,8,42,0,false
//! 100,ReadReq,0x1000,Column,8,,0,false
//! ```
//!
//! Addresses and values are decimal or `0x` prefixed hex.

use crate::{
    address,
    direction::{Direction, Geometry},
    packet::{self, Command, Packet},
    WORD_SIZE,
};
use color_eyre::eyre::{self, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{0} is not a request")]
    NotARequest(Command),
    #[error("{command} at {addr:#x} carries data but has no value")]
    MissingValue { command: Command, addr: address },
    #[error("access of {size} bytes at {addr:#x} does not fit in one {dir} block")]
    Size {
        addr: address,
        dir: Direction,
        size: u64,
    },
}

fn parse_number(value: &str) -> Result<u64, std::num::ParseIntError> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

fn deserialize_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse_number(&value).map_err(serde::de::Error::custom)
}

fn deserialize_option_number<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(value) if !value.trim().is_empty() => parse_number(&value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn serialize_hex<S>(addr: &address, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{addr:#x}"))
}

/// One request of a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub tick: u64,
    pub command: Command,
    #[serde(
        deserialize_with = "deserialize_number",
        serialize_with = "serialize_hex"
    )]
    pub address: address,
    pub direction: Direction,
    pub size: u64,
    /// Written value, repeated over the access.
    #[serde(default, deserialize_with = "deserialize_option_number")]
    pub value: Option<u64>,
    #[serde(default)]
    pub context: usize,
    #[serde(default)]
    pub uncacheable: bool,
}

impl Record {
    pub fn to_packet(&self, geometry: &Geometry) -> Result<Packet, Error> {
        if !self.command.is_request() {
            return Err(Error::NotARequest(self.command));
        }
        let offset = geometry.block_offset(self.address, self.direction);
        if self.size == 0 || offset + self.size > geometry.block_size() {
            return Err(Error::Size {
                addr: self.address,
                dir: self.direction,
                size: self.size,
            });
        }
        let data = if self.command.has_data() {
            let value = self.value.ok_or(Error::MissingValue {
                command: self.command,
                addr: self.address,
            })?;
            let bytes = value.to_le_bytes();
            Some(
                (0..self.size)
                    .map(|i| bytes[(i % WORD_SIZE) as usize])
                    .collect(),
            )
        } else {
            None
        };
        Ok(packet::Builder {
            cmd: self.command,
            addr: self.address,
            dir: self.direction,
            size: self.size,
            uncacheable: self.uncacheable,
            context: self.context,
            data,
            issued_at: self.tick,
            ..packet::Builder::default()
        }
        .build())
    }
}

pub fn read_records(reader: impl std::io::Read) -> Result<Vec<Record>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(reader);
    let records = reader.deserialize().collect::<Result<Vec<Record>, _>>()?;
    Ok(records)
}

pub fn load(path: impl AsRef<Path>) -> eyre::Result<Vec<Record>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .wrap_err_with(|| format!("failed to open trace {}", path.display()))?;
    let records = read_records(std::io::BufReader::new(file))
        .wrap_err_with(|| format!("bad trace {}", path.display()))?;
    log::info!("trace::load({}, records={})", path.display(), records.len());
    Ok(records)
}
