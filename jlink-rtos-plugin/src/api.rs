//! Raw C ABI shared with the J-Link GDB server.
//!
//! The GDB server loads an RTOS plug-in as a shared library and talks to it
//! through a fixed set of `RTOS_*` entry points (generated by
//! [`export_rtos_plugin!`](crate::export_rtos_plugin)). In the other
//! direction the server hands the plug-in a [`ServerApi`] table of function
//! pointers for memory access, allocation and logging. Both sides of the
//! boundary are plain C with a fixed layout and no version field, so
//! changing any of the types in this module breaks binary compatibility
//! with already-built servers.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::fmt;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// An address in the target's memory space.
///
/// The J-Link RTOS plug-in protocol is fixed to 32-bit target addresses.
pub type TargetAddress = u32;

/// J-Link identifier of the target's CPU core, as passed to `RTOS_Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreId(pub u32);

impl CoreId {
    /// Cortex-M0.
    pub const CORTEX_M0: CoreId = CoreId(0x0600_00FF);
    /// Cortex-M1.
    pub const CORTEX_M1: CoreId = CoreId(0x0100_00FF);
    /// Cortex-M3.
    pub const CORTEX_M3: CoreId = CoreId(0x0300_00FF);
    /// Cortex-M4.
    pub const CORTEX_M4: CoreId = CoreId(0x0E00_00FF);
    /// Cortex-M7.
    pub const CORTEX_M7: CoreId = CoreId(0x0E01_00FF);

    /// Well-known name of this core, if it is one the J-Link SDK defines.
    pub fn name(&self) -> Option<&'static str> {
        match *self {
            CoreId::CORTEX_M0 => Some("Cortex-M0"),
            CoreId::CORTEX_M1 => Some("Cortex-M1"),
            CoreId::CORTEX_M3 => Some("Cortex-M3"),
            CoreId::CORTEX_M4 => Some("Cortex-M4"),
            CoreId::CORTEX_M7 => Some("Cortex-M7"),
            _ => None,
        }
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{:#010X} ({name})", self.0),
            None => write!(f, "{:#010X}", self.0),
        }
    }
}

/// One entry of the plug-in's RTOS symbol table.
///
/// The plug-in publishes a null-name-terminated array of these via
/// `RTOS_GetSymbols`. The server looks every name up in the debug
/// information and writes the resolved address back into the entry, or 0 if
/// the symbol is absent. If a symbol that is not marked optional stays
/// unresolved, the server does not use the plug-in for this session, so
/// later code may rely on every mandatory symbol having an address.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SymbolEntry {
    /// NUL-terminated symbol name, or null for the terminating sentinel.
    pub name: *const c_char,
    /// Non-zero if the plug-in can work without this symbol.
    pub optional: c_int,
    /// Resolved target address, written by the server. 0 while unresolved.
    pub address: TargetAddress,
}

impl SymbolEntry {
    /// The table terminator.
    pub const SENTINEL: SymbolEntry = SymbolEntry {
        name: std::ptr::null(),
        optional: 0,
        address: 0,
    };

    /// A mandatory symbol entry. `name_z` must be NUL-terminated; the
    /// [`symbol_table!`](crate::symbol_table) macro appends the NUL for you.
    pub const fn mandatory(name_z: &'static str) -> Self {
        Self::entry(name_z, 0)
    }

    /// An optional symbol entry. `name_z` must be NUL-terminated.
    pub const fn optional(name_z: &'static str) -> Self {
        Self::entry(name_z, 1)
    }

    const fn entry(name_z: &'static str, optional: c_int) -> Self {
        let bytes = name_z.as_bytes();
        assert!(
            !bytes.is_empty() && bytes[bytes.len() - 1] == 0,
            "symbol names must carry a trailing NUL"
        );
        Self {
            name: name_z.as_ptr().cast::<c_char>(),
            optional,
            address: 0,
        }
    }

    /// Whether this entry terminates the table.
    pub fn is_sentinel(&self) -> bool {
        self.name.is_null()
    }

    /// Whether the plug-in tolerates this symbol staying unresolved.
    pub fn is_optional(&self) -> bool {
        self.optional != 0
    }

    /// The symbol name, or `None` for the sentinel.
    pub fn name(&self) -> Option<&CStr> {
        if self.name.is_null() {
            return None;
        }
        // SAFETY: non-sentinel entries are only constructed from
        // NUL-terminated string literals with 'static lifetime.
        Some(unsafe { CStr::from_ptr(self.name) })
    }
}

/// GDB server functions the plug-in may call, handed to `RTOS_Init`.
///
/// Every memory operation may transparently halt the target CPU while the
/// server services it, so none of them should be assumed to be cheap or
/// free of effect on target execution state. The `output*` channels take a
/// `printf`-style format string; the plug-in side always pre-formats and
/// passes finished text.
#[repr(C)]
pub struct ServerApi {
    /// Return a block obtained from [`allocate`](Self::allocate) to the server.
    pub deallocate: unsafe extern "C" fn(p: *mut c_void),
    /// Allocate `nbytes` of server-owned memory. Null on exhaustion.
    pub allocate: unsafe extern "C" fn(nbytes: usize) -> *mut c_void,
    /// Resize a previously allocated block. Null on exhaustion.
    pub reallocate: unsafe extern "C" fn(p: *mut c_void, nbytes: c_uint) -> *mut c_void,

    /// Log to the GDB server console (and log file, if configured).
    pub output: unsafe extern "C" fn(fmt: *const c_char, ...),
    /// Log to the debug channel; suppressed in non-debug server builds.
    pub output_debug: unsafe extern "C" fn(fmt: *const c_char, ...),
    /// Log to the console with a `WARNING: ` prefix.
    pub output_warning: unsafe extern "C" fn(fmt: *const c_char, ...),
    /// Log to the console with an `ERROR: ` prefix.
    pub output_error: unsafe extern "C" fn(fmt: *const c_char, ...),

    /// Read `nbytes` of target memory. 0 on success, negative on failure.
    pub read_byte_array:
        unsafe extern "C" fn(addr: TargetAddress, out: *mut u8, nbytes: usize) -> c_int,
    /// Read one byte of target memory.
    pub read_byte: unsafe extern "C" fn(addr: TargetAddress, out: *mut u8) -> c_int,
    /// Read two bytes of target memory, converted to host order.
    pub read_short: unsafe extern "C" fn(addr: TargetAddress, out: *mut u16) -> c_int,
    /// Read four bytes of target memory, converted to host order.
    pub read_long: unsafe extern "C" fn(addr: TargetAddress, out: *mut u32) -> c_int,

    /// Write `nbytes` to target memory. 0 on success, negative on failure.
    pub write_byte_array:
        unsafe extern "C" fn(addr: TargetAddress, data: *const u8, nbytes: usize) -> c_int,
    /// Write one byte to target memory.
    pub write_byte: unsafe extern "C" fn(addr: TargetAddress, data: u8),
    /// Write two bytes to target memory.
    pub write_short: unsafe extern "C" fn(addr: TargetAddress, data: u16),
    /// Write four bytes to target memory.
    pub write_long: unsafe extern "C" fn(addr: TargetAddress, data: u32),

    /// Decode two buffered bytes according to the target endianness.
    pub load_short: unsafe extern "C" fn(p: *const u8) -> u32,
    /// Decode three buffered bytes according to the target endianness.
    pub load_3bytes: unsafe extern "C" fn(p: *const u8) -> u32,
    /// Decode four buffered bytes according to the target endianness.
    pub load_long: unsafe extern "C" fn(p: *const u8) -> u32,
}

// The server indexes this table by field position; a size change here means
// a field was added or removed and the ABI is broken.
const_assert_eq!(
    std::mem::size_of::<ServerApi>(),
    18 * std::mem::size_of::<usize>()
);
const_assert_eq!(
    std::mem::size_of::<SymbolEntry>(),
    std::mem::size_of::<usize>() + 8
);
