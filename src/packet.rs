use crate::{
    address,
    direction::{Direction, Geometry},
};
use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic;

/// One bit per word of a block.
pub type WordMask = BitVec;

static NEXT_PACKET_ID: atomic::AtomicU64 = atomic::AtomicU64::new(0);

/// Packet command.
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
    strum::EnumString,
)]
pub enum Command {
    #[default]
    ReadReq,
    ReadResp,
    ReadRespWithInvalidate,
    WriteReq,
    WriteResp,
    ReadSharedReq,
    ReadCleanReq,
    ReadExReq,
    ReadExResp,
    UpgradeReq,
    UpgradeResp,
    InvalidateReq,
    InvalidateResp,
    WritebackDirty,
    WritebackClean,
    CleanEvict,
    SwapReq,
    SwapResp,
    LoadLockedReq,
    StoreCondReq,
    StoreCondResp,
    HardPrefetchReq,
    HardPrefetchResp,
}

impl Command {
    #[must_use]
    pub fn is_read(self) -> bool {
        use Command::*;
        matches!(
            self,
            ReadReq
                | ReadResp
                | ReadRespWithInvalidate
                | ReadSharedReq
                | ReadCleanReq
                | ReadExReq
                | ReadExResp
                | SwapReq
                | SwapResp
                | LoadLockedReq
                | HardPrefetchReq
                | HardPrefetchResp
        )
    }

    #[must_use]
    pub fn is_write(self) -> bool {
        use Command::*;
        matches!(
            self,
            WriteReq
                | WriteResp
                | WritebackDirty
                | WritebackClean
                | SwapReq
                | SwapResp
                | StoreCondReq
                | StoreCondResp
        )
    }

    #[must_use]
    pub fn is_response(self) -> bool {
        use Command::*;
        matches!(
            self,
            ReadResp
                | ReadRespWithInvalidate
                | WriteResp
                | ReadExResp
                | UpgradeResp
                | InvalidateResp
                | SwapResp
                | StoreCondResp
                | HardPrefetchResp
        )
    }

    #[must_use]
    pub fn is_request(self) -> bool {
        !self.is_response()
    }

    #[must_use]
    pub fn needs_response(self) -> bool {
        !self.is_response() && self.response_command().is_some()
    }

    /// Whether the requester needs a writable copy of the block.
    #[must_use]
    pub fn needs_writable(self) -> bool {
        use Command::*;
        matches!(
            self,
            WriteReq
                | WriteResp
                | ReadExReq
                | ReadExResp
                | UpgradeReq
                | UpgradeResp
                | InvalidateReq
                | InvalidateResp
                | SwapReq
                | SwapResp
                | StoreCondReq
                | StoreCondResp
        )
    }

    /// Whether other copies of the block must be invalidated.
    #[must_use]
    pub fn is_invalidate(self) -> bool {
        use Command::*;
        matches!(
            self,
            ReadRespWithInvalidate | ReadExReq | UpgradeReq | InvalidateReq
        )
    }

    #[must_use]
    pub fn is_upgrade(self) -> bool {
        matches!(self, Command::UpgradeReq | Command::UpgradeResp)
    }

    #[must_use]
    pub fn is_eviction(self) -> bool {
        matches!(
            self,
            Command::WritebackDirty | Command::WritebackClean | Command::CleanEvict
        )
    }

    #[must_use]
    pub fn is_writeback(self) -> bool {
        matches!(self, Command::WritebackDirty | Command::WritebackClean)
    }

    #[must_use]
    pub fn is_llsc(self) -> bool {
        matches!(
            self,
            Command::LoadLockedReq | Command::StoreCondReq | Command::StoreCondResp
        )
    }

    #[must_use]
    pub fn is_prefetch(self) -> bool {
        matches!(self, Command::HardPrefetchReq | Command::HardPrefetchResp)
    }

    /// Whether the request is issued by a cache rather than a CPU.
    #[must_use]
    pub fn from_cache(self) -> bool {
        use Command::*;
        matches!(
            self,
            ReadSharedReq
                | ReadCleanReq
                | ReadExReq
                | UpgradeReq
                | InvalidateReq
                | WritebackDirty
                | WritebackClean
                | CleanEvict
        )
    }

    #[must_use]
    pub fn has_data(self) -> bool {
        use Command::*;
        matches!(
            self,
            ReadResp
                | ReadRespWithInvalidate
                | WriteReq
                | ReadExResp
                | WritebackDirty
                | WritebackClean
                | SwapReq
                | SwapResp
                | StoreCondReq
                | HardPrefetchResp
        )
    }

    #[must_use]
    pub fn response_command(self) -> Option<Command> {
        use Command::*;
        match self {
            ReadReq | ReadSharedReq | ReadCleanReq | LoadLockedReq => Some(ReadResp),
            WriteReq => Some(WriteResp),
            ReadExReq => Some(ReadExResp),
            UpgradeReq => Some(UpgradeResp),
            InvalidateReq => Some(InvalidateResp),
            SwapReq => Some(SwapResp),
            StoreCondReq => Some(StoreCondResp),
            HardPrefetchReq => Some(HardPrefetchResp),
            _ => None,
        }
    }

    /// Statistics access kind.
    #[must_use]
    pub fn access_kind(self) -> stats::AccessKind {
        use stats::AccessKind as Kind;
        use Command::*;
        match self {
            ReadReq | ReadResp | ReadRespWithInvalidate | ReadCleanReq => Kind::Read,
            WriteReq | WriteResp => Kind::Write,
            ReadSharedReq => Kind::ReadShared,
            ReadExReq | ReadExResp => Kind::ReadExclusive,
            UpgradeReq | UpgradeResp => Kind::Upgrade,
            InvalidateReq | InvalidateResp => Kind::Invalidate,
            WritebackDirty | WritebackClean => Kind::Writeback,
            CleanEvict => Kind::CleanEvict,
            SwapReq | SwapResp => Kind::Swap,
            LoadLockedReq => Kind::LoadLocked,
            StoreCondReq | StoreCondResp => Kind::StoreCond,
            HardPrefetchReq | HardPrefetchResp => Kind::Prefetch,
        }
    }
}

bitflags::bitflags! {
    /// Coherence response flags.
    #[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u8 {
        /// another cache keeps a copy, the requester must not become writable
        const HAS_SHARERS = 0b0001;
        /// a cache supplies the data instead of memory
        const CACHE_RESPONDING = 0b0010;
        const RESPONDER_HAD_WRITABLE = 0b0100;
        /// a prefetch probe found the block in an upper cache
        const BLOCK_CACHED = 0b1000;
    }
}

/// A memory request or response.
///
/// `data` holds the accessed bytes in the linear order of `dir`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Packet {
    pub id: u64,
    pub cmd: Command,
    pub addr: address,
    pub dir: Direction,
    pub size: u64,
    pub secure: bool,
    pub uncacheable: bool,
    pub context: usize,
    pub data: Option<Vec<u8>>,
    /// per word dirty vector of a block sized response or writeback
    pub word_dirty: Option<WordMask>,
    /// words of the block that became stale while the request was pending
    pub stale_words: Option<WordMask>,
    pub flags: Flags,
    /// order of the request this packet has to be sent after
    pub order: Option<u64>,
    pub sc_success: Option<bool>,
    pub issued_at: u64,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("Packet");
        out.field("id", &self.id)
            .field("cmd", &self.cmd)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("dir", &self.dir)
            .field("size", &self.size);
        if self.uncacheable {
            out.field("uncacheable", &true);
        }
        if !self.flags.is_empty() {
            out.field("flags", &self.flags);
        }
        if let Some(order) = self.order {
            out.field("order", &order);
        }
        out.finish_non_exhaustive()
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}({:#x}, {}, {}B)",
            self.cmd, self.id, self.addr, self.dir, self.size
        )
    }
}

/// Packet builder.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    pub cmd: Command,
    pub addr: address,
    pub dir: Direction,
    pub size: u64,
    pub secure: bool,
    pub uncacheable: bool,
    pub context: usize,
    pub data: Option<Vec<u8>>,
    pub issued_at: u64,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> Packet {
        if let Some(data) = &self.data {
            assert_eq!(
                data.len() as u64,
                self.size,
                "packet data does not match its size"
            );
        }
        Packet {
            id: NEXT_PACKET_ID.fetch_add(1, atomic::Ordering::Relaxed),
            cmd: self.cmd,
            addr: self.addr,
            dir: self.dir,
            size: self.size,
            secure: self.secure,
            uncacheable: self.uncacheable,
            context: self.context,
            data: self.data,
            word_dirty: None,
            stale_words: None,
            flags: Flags::empty(),
            order: None,
            sc_success: None,
            issued_at: self.issued_at,
        }
    }
}

impl Packet {
    #[inline]
    #[must_use]
    pub fn is_read(&self) -> bool {
        self.cmd.is_read()
    }

    #[inline]
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.cmd.is_write()
    }

    #[inline]
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.cmd.is_response()
    }

    #[inline]
    #[must_use]
    pub fn needs_response(&self) -> bool {
        self.cmd.needs_response()
    }

    #[inline]
    #[must_use]
    pub fn needs_writable(&self) -> bool {
        self.cmd.needs_writable()
    }

    #[inline]
    #[must_use]
    pub fn is_invalidate(&self) -> bool {
        self.cmd.is_invalidate()
    }

    #[inline]
    #[must_use]
    pub fn is_eviction(&self) -> bool {
        self.cmd.is_eviction()
    }

    #[inline]
    #[must_use]
    pub fn from_cache(&self) -> bool {
        self.cmd.from_cache()
    }

    #[inline]
    #[must_use]
    pub fn has_sharers(&self) -> bool {
        self.flags.contains(Flags::HAS_SHARERS)
    }

    #[inline]
    #[must_use]
    pub fn cache_responding(&self) -> bool {
        self.flags.contains(Flags::CACHE_RESPONDING)
    }

    #[must_use]
    pub fn block_addr(&self, geometry: &Geometry) -> address {
        geometry.block_align(self.addr, self.dir)
    }

    /// Words of the block touched by this packet.
    #[must_use]
    pub fn words(&self, geometry: &Geometry) -> Range<usize> {
        geometry.words_touched(self.addr, self.dir, self.size)
    }

    /// Whether the packet touches at most a single word.
    #[must_use]
    pub fn is_single_word(&self, geometry: &Geometry) -> bool {
        self.words(geometry).len() == 1
    }

    #[must_use]
    pub fn is_block_sized(&self, geometry: &Geometry) -> bool {
        self.size == geometry.block_size() && geometry.block_offset(self.addr, self.dir) == 0
    }

    /// Turns the request into its response in place.
    pub fn make_response(&mut self) {
        let Some(cmd) = self.cmd.response_command() else {
            panic!("{self} does not expect a response");
        };
        self.cmd = cmd;
    }

    /// Allocates zeroed data of the packet size.
    pub fn allocate_data(&mut self) -> &mut Vec<u8> {
        let size = self.size as usize;
        self.data.get_or_insert_with(|| vec![0; size])
    }

    /// Little endian value of the first (at most eight) data bytes.
    #[must_use]
    pub fn value(&self) -> Option<u64> {
        let data = self.data.as_ref()?;
        let mut bytes = [0u8; 8];
        let n = data.len().min(8);
        bytes[..n].copy_from_slice(&data[..n]);
        Some(u64::from_le_bytes(bytes))
    }

    /// Whether a word of this block sized packet is marked stale.
    #[must_use]
    pub fn is_word_stale(&self, index: usize) -> bool {
        self.stale_words
            .as_ref()
            .is_some_and(|stale| stale.get(index).is_some_and(|bit| *bit))
    }
}
