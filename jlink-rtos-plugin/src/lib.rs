//! # RTOS awareness for the J-Link GDB server
//!
//! The SEGGER J-Link GDB server can load an RTOS plug-in, a shared library
//! that teaches it to present the kernel's threads as GDB threads. This
//! crate is the Rust side of that contract: it carries the raw C tables,
//! wraps the server's memory/alloc/log callbacks in safe typed interfaces,
//! caches a validated per-halt thread snapshot, and generates the exported
//! `RTOS_*` entry points.
//!
//! A concrete plug-in supplies the kernel knowledge by implementing
//! [`RtosAwareness`] and exporting it:
//!
//! ```no_run
//! use jlink_rtos_plugin::{
//!     export_rtos_plugin, symbol_table, Backend, CoreId, Error, RegisterLayout, Snapshot,
//!     SymbolTable, SymbolsRef, RtosAwareness,
//! };
//!
//! #[derive(Default)]
//! struct MyRtos;
//!
//! static SYMBOLS: SymbolTable<3> = symbol_table! {
//!     mandatory "OS_TaskList",
//!     optional "OS_TickCount",
//! };
//!
//! impl RtosAwareness for MyRtos {
//!     fn symbols() -> SymbolsRef<'static> {
//!         SYMBOLS.as_ref()
//!     }
//!
//!     fn supports_core(&self, core: CoreId) -> bool {
//!         core == CoreId::CORTEX_M4
//!     }
//!
//!     fn register_layout(&self, _thread: &jlink_rtos_plugin::ThreadInfo) -> &RegisterLayout {
//!         unimplemented!("port specific")
//!     }
//!
//!     fn build_snapshot(&mut self, backend: &Backend<'_>) -> Result<Snapshot, Error> {
//!         unimplemented!("walk OS_TaskList with `backend`")
//!     }
//! }
//!
//! export_rtos_plugin!(MyRtos);
//! ```

pub mod api;
#[warn(missing_docs)]
pub mod backend;
mod error;
#[cfg(feature = "test")]
pub mod fake_host;
#[warn(missing_docs)]
pub mod host_alloc;
#[warn(missing_docs)]
pub mod plugin;
#[warn(missing_docs)]
pub mod registers;
pub mod symbols;
#[warn(missing_docs)]
pub mod threads;

pub use crate::api::{CoreId, ServerApi, SymbolEntry, TargetAddress};
pub use crate::backend::{Access, Backend, Endianness, MemoryError, SCRATCH_BUF_SIZE};
pub use crate::error::Error;
pub use crate::host_alloc::{AllocError, HostAllocator, HostMemoryResource};
pub use crate::plugin::{PluginCell, PluginSession, SessionState, VERSION};
pub use crate::registers::{
    HexError, RegisterAccess, RegisterLayout, RegisterWidth, StackedRegister,
};
pub use crate::symbols::{SymbolTable, SymbolsRef};
pub use crate::threads::{
    read_c_string, RtosAwareness, Snapshot, SnapshotBuilder, SnapshotError, TargetList, ThreadId,
    ThreadInfo, ThreadInventory,
};
