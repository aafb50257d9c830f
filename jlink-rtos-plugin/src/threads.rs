//! The thread inventory: turning kernel control blocks into a stable,
//! queryable list of threads.
//!
//! `RTOS_UpdateThreads` triggers one complete re-walk of the kernel's
//! thread control data; everything the server may ask about afterwards
//! (ids, display text, saved-context addresses) is captured in an immutable
//! [`Snapshot`] so the queries themselves cause no target traffic. A failed
//! walk keeps the previous snapshot: a stale thread list is recoverable, a
//! half-built one is not, because a thread deleted mid-walk cannot be
//! detected from raw memory alone.

use std::fmt;
use std::fmt::Write as _;

use crate::api::{CoreId, TargetAddress};
use crate::backend::{Backend, Endianness, TruncatingWriter};
use crate::registers::{decode_bytes, encode_bytes, RegisterAccess, RegisterLayout};
use crate::symbols::SymbolsRef;
use crate::Error;

/// Identifier of one kernel thread, assigned by the RTOS itself (for most
/// kernels this is the control block address).
///
/// A `ThreadId` is only meaningful within the update cycle that produced
/// it; a thread may be deleted at any point once the target runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010X}", self.0)
    }
}

/// Everything the snapshot retains about one thread.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    /// Kernel-assigned identity.
    pub id: ThreadId,
    /// Thread name read out of target memory, possibly empty.
    pub name: String,
    /// Short scheduler state text, e.g. `ready` or `blocked`.
    pub state: String,
    /// Scheduling priority, if the kernel has one.
    pub priority: Option<u32>,
    /// Address of the thread's saved register context. `None` for the
    /// running thread, whose registers live in the CPU.
    pub context: Option<TargetAddress>,
}

/// A freshly walked thread set violated a snapshot invariant.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The same id came up twice, which means the walk crossed a list that
    /// was being modified or followed a corrupted link.
    #[error("thread {0} appears twice in one update cycle")]
    DuplicateThread(ThreadId),
    /// The id designated as running is not part of the walked set.
    #[error("current thread {0} is not part of the walked thread set")]
    CurrentNotMember(ThreadId),
    /// The walk produced no threads at all.
    #[error("the walk produced no threads")]
    Empty,
}

/// One update cycle's view of the kernel's threads.
///
/// Immutable once built; [`ThreadInventory::update`] replaces the whole
/// value atomically instead of patching it, so readers can never observe a
/// half-built state. Index order is stable within one snapshot but carries
/// no meaning across update cycles.
#[derive(Debug)]
pub struct Snapshot {
    threads: Vec<ThreadInfo>,
    current: ThreadId,
}

impl Snapshot {
    /// Starts building a snapshot.
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder {
            threads: Vec::new(),
        }
    }

    /// Number of threads.
    pub fn len(&self) -> u32 {
        self.threads.len() as u32
    }

    /// A snapshot is never empty; the running thread is always a member.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Id of the thread at `index`, if `index` is within range.
    pub fn thread_id(&self, index: u32) -> Option<ThreadId> {
        self.threads.get(index as usize).map(|info| info.id)
    }

    /// Id of the thread the target is executing.
    pub fn current_thread_id(&self) -> ThreadId {
        self.current
    }

    /// The retained data of thread `id`.
    pub fn get(&self, id: ThreadId) -> Option<&ThreadInfo> {
        self.threads.iter().find(|info| info.id == id)
    }

    /// All threads in snapshot order.
    pub fn threads(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.iter()
    }
}

/// Accumulates threads during a walk and validates the snapshot
/// invariants before anything becomes visible.
pub struct SnapshotBuilder {
    threads: Vec<ThreadInfo>,
}

impl SnapshotBuilder {
    /// Adds one walked thread, rejecting duplicate ids.
    pub fn push(&mut self, info: ThreadInfo) -> Result<(), SnapshotError> {
        if self.threads.iter().any(|existing| existing.id == info.id) {
            return Err(SnapshotError::DuplicateThread(info.id));
        }
        self.threads.push(info);
        Ok(())
    }

    /// Number of threads pushed so far.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether nothing has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Seals the snapshot, verifying that `current` is a member.
    pub fn finish(self, current: ThreadId) -> Result<Snapshot, SnapshotError> {
        if self.threads.is_empty() {
            return Err(SnapshotError::Empty);
        }
        if !self.threads.iter().any(|info| info.id == current) {
            return Err(SnapshotError::CurrentNotMember(current));
        }
        Ok(Snapshot {
            threads: self.threads,
            current,
        })
    }
}

/// The RTOS-specific side of the bridge.
///
/// The bridge knows how to talk to the server, cache snapshots and encode
/// registers; what it does not know is the kernel's memory layout. A
/// concrete plug-in supplies that here: which symbols anchor the walk, how
/// the target is laid out, and how to decode control blocks into
/// [`ThreadInfo`] values using the [`Backend`].
pub trait RtosAwareness {
    /// The symbol table the server resolves before `RTOS_Init` runs.
    fn symbols() -> SymbolsRef<'static>
    where
        Self: Sized;

    /// Whether this plug-in understands `core`. `RTOS_Init` fails on a
    /// mismatch and the server drops the plug-in for the session.
    fn supports_core(&self, core: CoreId) -> bool;

    /// Byte order of the target.
    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    /// Saved-context layout for `thread`. May differ between threads, e.g.
    /// with lazy floating point stacking.
    fn register_layout(&self, thread: &ThreadInfo) -> &RegisterLayout;

    /// Walks the kernel's thread control data and builds a complete
    /// snapshot. Called once per `RTOS_UpdateThreads`; any error makes the
    /// inventory keep the previous snapshot.
    fn build_snapshot(&mut self, backend: &Backend<'_>) -> Result<Snapshot, Error>;
}

/// Owner of the per-cycle snapshot and the register query logic.
#[derive(Debug)]
pub struct ThreadInventory<R: RtosAwareness> {
    rtos: R,
    snapshot: Option<Snapshot>,
}

impl<R: RtosAwareness> ThreadInventory<R> {
    /// An inventory with no snapshot yet.
    pub fn new(rtos: R) -> Self {
        Self {
            rtos,
            snapshot: None,
        }
    }

    /// The wrapped RTOS walker.
    pub fn rtos(&self) -> &R {
        &self.rtos
    }

    /// Whether a snapshot has ever been built.
    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Rebuilds the snapshot wholesale.
    ///
    /// On failure the previous snapshot stays in place untouched
    /// (report-then-keep-stale); the error is returned for the caller to
    /// surface to the server.
    pub fn update(&mut self, backend: &Backend<'_>) -> Result<(), Error> {
        match self.rtos.build_snapshot(backend) {
            Ok(snapshot) => {
                tracing::debug!(
                    threads = snapshot.len(),
                    current = %snapshot.current_thread_id(),
                    "thread snapshot rebuilt"
                );
                self.snapshot = Some(snapshot);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%error, "thread walk failed, keeping previous snapshot");
                Err(error)
            }
        }
    }

    fn snapshot(&self) -> Result<&Snapshot, Error> {
        self.snapshot.as_ref().ok_or(Error::NoSnapshot)
    }

    /// Number of threads in the current snapshot, 0 before the first
    /// successful update.
    pub fn num_threads(&self) -> u32 {
        self.snapshot.as_ref().map(Snapshot::len).unwrap_or(0)
    }

    /// Id of the thread at `index` in the current snapshot.
    pub fn thread_id(&self, index: u32) -> Option<ThreadId> {
        self.snapshot.as_ref().and_then(|snap| snap.thread_id(index))
    }

    /// Id of the thread the target is executing, per the current snapshot.
    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.snapshot.as_ref().map(Snapshot::current_thread_id)
    }

    /// Formats the status line for thread `id` into `out`, returning the
    /// written length. `out` is the server's 256-byte display buffer;
    /// overlong text is truncated, never overrun.
    pub fn display_into(&self, out: &mut [u8], id: ThreadId) -> Result<usize, Error> {
        let info = self
            .snapshot()?
            .get(id)
            .ok_or(Error::UnknownThread(id))?;
        let mut writer = TruncatingWriter::new(out);
        let name = if info.name.is_empty() {
            "<unnamed>"
        } else {
            info.name.as_str()
        };
        let _ = match info.priority {
            Some(priority) => write!(writer, "{name} [{}, prio {priority}]", info.state),
            None => write!(writer, "{name} [{}]", info.state),
        };
        Ok(writer.finish())
    }

    /// Reads register `reg_index` of thread `id` from its saved context,
    /// hex-encoded in target memory order.
    pub fn thread_reg(
        &self,
        backend: &Backend<'_>,
        reg_index: u32,
        id: ThreadId,
    ) -> Result<RegisterAccess<String>, Error> {
        let snapshot = self.snapshot()?;
        let info = snapshot.get(id).ok_or(Error::UnknownThread(id))?;
        if id == snapshot.current_thread_id() {
            // The running thread's registers live in the CPU.
            return Ok(RegisterAccess::Cpu);
        }
        let Some(context) = info.context else {
            return Ok(RegisterAccess::Cpu);
        };
        let Some(stacked) = self.rtos.register_layout(info).stacked_register(reg_index) else {
            return Ok(RegisterAccess::Cpu);
        };

        let mut raw = [0u8; 8];
        let bytes = stacked.width.bytes();
        backend.read_bytes(context.wrapping_add(stacked.offset), &mut raw[..bytes])?;
        Ok(RegisterAccess::Value(encode_bytes(&raw[..bytes])))
    }

    /// Reads the full register bank of thread `id`, hex-encoded in
    /// register index order.
    ///
    /// Delegates to the server unless the port stacks the complete bank,
    /// because the server cannot mix a partial list with CPU reads.
    pub fn thread_reg_list(
        &self,
        backend: &Backend<'_>,
        id: ThreadId,
    ) -> Result<RegisterAccess<String>, Error> {
        let snapshot = self.snapshot()?;
        let info = snapshot.get(id).ok_or(Error::UnknownThread(id))?;
        if id == snapshot.current_thread_id() || info.context.is_none() {
            return Ok(RegisterAccess::Cpu);
        }
        let layout = *self.rtos.register_layout(info);
        if !layout.covers_full_bank() {
            return Ok(RegisterAccess::Cpu);
        }
        let context = info.context.expect("checked above");

        let mut hex = String::new();
        for index in 0..layout.bank_size {
            let stacked = layout
                .stacked_register(index)
                .expect("covers_full_bank checked");
            let mut raw = [0u8; 8];
            let bytes = stacked.width.bytes();
            backend.read_bytes(context.wrapping_add(stacked.offset), &mut raw[..bytes])?;
            hex.push_str(&encode_bytes(&raw[..bytes]));
        }
        Ok(RegisterAccess::Value(hex))
    }

    /// Writes register `reg_index` of thread `id` into its saved context.
    pub fn set_thread_reg(
        &self,
        backend: &Backend<'_>,
        hex: &str,
        reg_index: u32,
        id: ThreadId,
    ) -> Result<RegisterAccess<()>, Error> {
        let snapshot = self.snapshot()?;
        let info = snapshot.get(id).ok_or(Error::UnknownThread(id))?;
        if id == snapshot.current_thread_id() {
            return Ok(RegisterAccess::Cpu);
        }
        let Some(context) = info.context else {
            return Ok(RegisterAccess::Cpu);
        };
        let Some(stacked) = self.rtos.register_layout(info).stacked_register(reg_index) else {
            return Ok(RegisterAccess::Cpu);
        };

        let mut raw = [0u8; 8];
        let bytes = stacked.width.bytes();
        decode_bytes(hex, &mut raw[..bytes])?;
        backend.write_bytes(context.wrapping_add(stacked.offset), &raw[..bytes])?;
        Ok(RegisterAccess::Value(()))
    }

    /// Writes the full register bank of thread `id` from one concatenated
    /// hex string, mirroring [`thread_reg_list`](Self::thread_reg_list).
    pub fn set_thread_reg_list(
        &self,
        backend: &Backend<'_>,
        hex: &str,
        id: ThreadId,
    ) -> Result<RegisterAccess<()>, Error> {
        let snapshot = self.snapshot()?;
        let info = snapshot.get(id).ok_or(Error::UnknownThread(id))?;
        if id == snapshot.current_thread_id() || info.context.is_none() {
            return Ok(RegisterAccess::Cpu);
        }
        let layout = *self.rtos.register_layout(info);
        if !layout.covers_full_bank() {
            return Ok(RegisterAccess::Cpu);
        }
        let context = info.context.expect("checked above");

        let mut cursor = hex;
        for index in 0..layout.bank_size {
            let stacked = layout
                .stacked_register(index)
                .expect("covers_full_bank checked");
            let digits = stacked.width.hex_digits();
            if cursor.len() < digits {
                return Err(Error::Hex(crate::registers::HexError::Length {
                    expected: digits,
                    got: cursor.len(),
                }));
            }
            let (chunk, rest) = cursor.split_at(digits);
            cursor = rest;

            let mut raw = [0u8; 8];
            let bytes = stacked.width.bytes();
            decode_bytes(chunk, &mut raw[..bytes])?;
            backend.write_bytes(context.wrapping_add(stacked.offset), &raw[..bytes])?;
        }
        Ok(RegisterAccess::Value(()))
    }
}

/// Reads a NUL-terminated string out of target memory, capped at
/// `max_len` bytes.
///
/// Reads in small chunks so a name sitting right before an unmapped page
/// does not drag a huge access across it. Non-UTF-8 bytes are replaced.
pub fn read_c_string(
    backend: &Backend<'_>,
    address: TargetAddress,
    max_len: usize,
) -> Result<String, Error> {
    const CHUNK: usize = 16;

    let mut raw: Vec<u8> = Vec::with_capacity(max_len.min(64));
    let mut offset = 0usize;
    'outer: while offset < max_len {
        let take = CHUNK.min(max_len - offset);
        let mut chunk = [0u8; CHUNK];
        backend.read_bytes(address.wrapping_add(offset as TargetAddress), &mut chunk[..take])?;
        for &byte in &chunk[..take] {
            if byte == 0 {
                break 'outer;
            }
            raw.push(byte);
        }
        offset += take;
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Iterator over a kernel's linked list of control blocks.
///
/// Yields node addresses starting at `head`, following the next pointer at
/// `next_offset` inside each node, and stops cleanly on a null pointer or
/// when the chain wraps back to `head` (circular kernel lists). A chain
/// longer than `limit` nodes yields [`Error::ThreadListRunaway`], since an
/// unbounded chain means a corrupted or mid-update list.
pub struct TargetList<'b, 'a> {
    backend: &'b Backend<'a>,
    head: TargetAddress,
    next: TargetAddress,
    next_offset: u32,
    remaining: usize,
    limit: usize,
    done: bool,
}

impl<'b, 'a> TargetList<'b, 'a> {
    /// Starts walking at `head` with at most `limit` nodes.
    pub fn new(
        backend: &'b Backend<'a>,
        head: TargetAddress,
        next_offset: u32,
        limit: usize,
    ) -> Self {
        Self {
            backend,
            head,
            next: head,
            next_offset,
            remaining: limit,
            limit,
            done: false,
        }
    }
}

impl Iterator for TargetList<'_, '_> {
    type Item = Result<TargetAddress, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next == 0 {
            return None;
        }
        if self.remaining == 0 {
            self.done = true;
            return Some(Err(Error::ThreadListRunaway {
                address: self.head,
                limit: self.limit,
            }));
        }
        self.remaining -= 1;

        let node = self.next;
        match self.backend.read_u32(node.wrapping_add(self.next_offset)) {
            Ok(next) => {
                // A link back to the head closes a circular list.
                self.next = if next == self.head { 0 } else { next };
                Some(Ok(node))
            }
            Err(error) => {
                self.done = true;
                Some(Err(error.into()))
            }
        }
    }
}
