use crate::api::{CoreId, TargetAddress};
use crate::backend::MemoryError;
use crate::registers::HexError;
use crate::threads::{SnapshotError, ThreadId};
use thiserror::Error;

/// The error type of everything that can go wrong on the plug-in side.
///
/// None of these ever cross the plug-in boundary as such; every `RTOS_*`
/// entry point folds them into the C return convention the server expects.
#[derive(Error, Debug)]
pub enum Error {
    /// The server attached to a core this plug-in has no layout knowledge
    /// for. The session stays down and the server falls back to bare-metal
    /// debugging.
    #[error("core {0} is not supported by this plug-in")]
    UnsupportedCore(CoreId),
    /// A target memory access failed and the host status is surfaced
    /// verbatim. Whether to halt the target and retry is host policy.
    #[error("a target memory access failed")]
    Memory(#[from] MemoryError),
    /// A symbol the walk depends on has no resolved address. For mandatory
    /// symbols the server's own gate makes this a logic inconsistency
    /// rather than a normal runtime case.
    #[error("symbol {0} has no resolved address")]
    UnresolvedSymbol(&'static str),
    /// The queried thread is not part of the current snapshot.
    #[error("thread {0} is unknown to the current snapshot")]
    UnknownThread(ThreadId),
    /// A query arrived before the first successful `RTOS_UpdateThreads`.
    #[error("no thread snapshot has been built yet")]
    NoSnapshot,
    /// A register hex string from the server could not be decoded.
    #[error("invalid register data")]
    Hex(#[from] HexError),
    /// The freshly walked thread set violated a snapshot invariant.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// A kernel thread list kept going past the configured node limit,
    /// which means a corrupted or mid-update link chain.
    #[error("thread list at {address:#010X} exceeds {limit} nodes")]
    ThreadListRunaway {
        /// First node of the runaway list.
        address: TargetAddress,
        /// The node cap the walker was configured with.
        limit: usize,
    },
    /// Any other error, from the RTOS-specific walk code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
