//! Session lifecycle and the exported `RTOS_*` entry points.
//!
//! [`PluginSession`] is the safe core: it owns the [`ThreadInventory`] and
//! maps its results onto the C return conventions the GDB server expects.
//! The [`export_rtos_plugin!`](crate::export_rtos_plugin) macro wraps one
//! session in a process-wide [`PluginCell`] and generates the twelve
//! `#[no_mangle]` C entry points around it. Everything crossing the FFI
//! boundary goes through [`guard`], so a panic can never unwind into the
//! server.

use std::cell::UnsafeCell;
use std::ffi::{c_char, c_int, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::api::{CoreId, ServerApi};
use crate::backend::{Backend, Endianness, SCRATCH_BUF_SIZE};
use crate::registers::RegisterAccess;
use crate::threads::{RtosAwareness, ThreadId, ThreadInventory};
use crate::Error;

/// Value reported by `RTOS_GetVersion`: `100 * major + minor` of this
/// crate. The server only gates on the major number.
pub const VERSION: u32 =
    100 * parse_decimal(env!("CARGO_PKG_VERSION_MAJOR")) + parse_decimal(env!("CARGO_PKG_VERSION_MINOR"));

const fn parse_decimal(digits: &str) -> u32 {
    let bytes = digits.as_bytes();
    let mut value = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        assert!(bytes[i].is_ascii_digit(), "version components are decimal");
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}

/// Where the session is in its lifecycle. "No session at all" is the
/// empty [`PluginCell`], before `RTOS_Init` has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Attached to a supported core; no thread snapshot exists yet.
    Attached,
    /// At least one `RTOS_UpdateThreads` succeeded; queries are served
    /// from the snapshot.
    Active,
}

/// One debug session's worth of plug-in state.
pub struct PluginSession<R: RtosAwareness> {
    api: &'static ServerApi,
    core: CoreId,
    endianness: Endianness,
    inventory: ThreadInventory<R>,
}

impl<R: RtosAwareness> PluginSession<R> {
    /// Binds `rtos` to a server and core, the body of `RTOS_Init`.
    ///
    /// An unsupported core fails here, before any target I/O; the server
    /// then debugs the session bare-metal.
    pub fn attach(rtos: R, api: &'static ServerApi, core: CoreId) -> Result<Self, Error> {
        if !rtos.supports_core(core) {
            tracing::warn!(%core, "unsupported core, leaving the plug-in inactive");
            return Err(Error::UnsupportedCore(core));
        }
        let endianness = rtos.endianness();
        let session = Self {
            api,
            core,
            endianness,
            inventory: ThreadInventory::new(rtos),
        };
        session.backend().output(format_args!(
            "{} v{} attached, core {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            core,
        ));
        Ok(session)
    }

    /// The core id the server attached with.
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if self.inventory.has_snapshot() {
            SessionState::Active
        } else {
            SessionState::Attached
        }
    }

    /// A fresh backend over this session's server table and symbols.
    ///
    /// `'static` because the server table and symbol table both outlive
    /// the session; this is what allows queries to borrow the inventory
    /// and a backend at the same time.
    pub fn backend(&self) -> Backend<'static> {
        Backend::new(self.api, R::symbols(), self.endianness)
    }

    /// The thread inventory, for direct queries.
    pub fn inventory(&self) -> &ThreadInventory<R> {
        &self.inventory
    }

    /// Rebuilds the thread snapshot, keeping the previous one on failure.
    /// The body of `RTOS_UpdateThreads`; failures are reported on the
    /// server console.
    pub fn update_threads(&mut self) -> Result<(), Error> {
        let backend = self.backend();
        self.inventory.update(&backend).inspect_err(|error| {
            backend.output_warning(format_args!("thread list update failed: {error}"));
        })
    }

    /// Id of the thread at `index`, or 0 for an out-of-range index.
    ///
    /// The server only asks for indexes below `RTOS_GetNumThreads`, so an
    /// out-of-range index is its contract violation; answering 0 beats
    /// panicking next to an FFI boundary.
    pub fn thread_id(&self, index: u32) -> u32 {
        match self.inventory.thread_id(index) {
            Some(id) => id.0,
            None => {
                tracing::warn!(index, "thread index out of range");
                0
            }
        }
    }

    /// Id of the running thread, or 0 before the first snapshot.
    pub fn current_thread_id(&self) -> u32 {
        self.inventory
            .current_thread_id()
            .map(|id| id.0)
            .unwrap_or(0)
    }

    /// Writes the display line for thread `id` into `out` and returns its
    /// length, the convention of `RTOS_GetThreadDisplay`. An unknown id or
    /// a missing snapshot leaves an empty string and reports failure with
    /// a negative length.
    pub fn thread_display(&self, out: &mut [u8], id: ThreadId) -> c_int {
        match self.inventory.display_into(out, id) {
            Ok(len) => len as c_int,
            Err(error) => {
                tracing::warn!(%error, %id, "thread display failed");
                out[0] = 0;
                -1
            }
        }
    }

    /// Hex value of one saved register, or `Cpu` when the server should
    /// read the CPU itself. Errors are logged and collapse to `Cpu`,
    /// which is the only recovery the protocol offers.
    pub fn thread_reg(&self, reg_index: u32, id: ThreadId) -> RegisterAccess<String> {
        let backend = self.backend();
        match self.inventory.thread_reg(&backend, reg_index, id) {
            Ok(access) => access,
            Err(error) => {
                backend.output_warning(format_args!(
                    "reading register {reg_index} of thread {id} failed: {error}"
                ));
                RegisterAccess::Cpu
            }
        }
    }

    /// Hex value of the full saved register bank, in register order.
    pub fn thread_reg_list(&self, id: ThreadId) -> RegisterAccess<String> {
        let backend = self.backend();
        match self.inventory.thread_reg_list(&backend, id) {
            Ok(access) => access,
            Err(error) => {
                backend.output_warning(format_args!(
                    "reading registers of thread {id} failed: {error}"
                ));
                RegisterAccess::Cpu
            }
        }
    }

    /// Writes one saved register from a server hex string.
    pub fn set_thread_reg(&self, hex: &str, reg_index: u32, id: ThreadId) -> RegisterAccess<()> {
        let backend = self.backend();
        match self.inventory.set_thread_reg(&backend, hex, reg_index, id) {
            Ok(access) => access,
            Err(error) => {
                backend.output_warning(format_args!(
                    "writing register {reg_index} of thread {id} failed: {error}"
                ));
                RegisterAccess::Cpu
            }
        }
    }

    /// Writes the full saved register bank from one concatenated hex
    /// string.
    pub fn set_thread_reg_list(&self, hex: &str, id: ThreadId) -> RegisterAccess<()> {
        let backend = self.backend();
        match self.inventory.set_thread_reg_list(&backend, hex, id) {
            Ok(access) => access,
            Err(error) => {
                backend.output_warning(format_args!(
                    "writing registers of thread {id} failed: {error}"
                ));
                RegisterAccess::Cpu
            }
        }
    }
}

impl<R: RtosAwareness> std::fmt::Debug for PluginSession<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSession")
            .field("core", &self.core)
            .field("endianness", &self.endianness)
            .field("state", &self.state())
            .finish()
    }
}

/// Holder of the one session the exported entry points operate on.
///
/// The raw protocol is stateful (`RTOS_Init` stores, everything else
/// reads), so the generated entry points need one process-wide mutable
/// slot.
pub struct PluginCell<R: RtosAwareness> {
    session: UnsafeCell<Option<PluginSession<R>>>,
}

// SAFETY: the GDB server calls plug-in entry points strictly sequentially
// from one thread; the cell is only reachable through those entry points,
// so no two accesses ever overlap.
unsafe impl<R: RtosAwareness> Sync for PluginCell<R> {}

impl<R: RtosAwareness> PluginCell<R> {
    /// An empty cell, for a `static`.
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            session: UnsafeCell::new(None),
        }
    }

    /// The session slot.
    ///
    /// # Safety
    ///
    /// Callers must uphold the server's sequential call contract: no other
    /// reference obtained from this cell may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn session(&self) -> &mut Option<PluginSession<R>> {
        &mut *self.session.get()
    }
}

/// Runs an entry point body, turning a panic into `default` instead of
/// letting it unwind into the C caller.
pub fn guard<T>(default: T, body: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!("panic reached an RTOS entry point, reporting failure");
            default
        }
    }
}

/// Marshalling body of `RTOS_GetThreadDisplay`.
///
/// # Safety
///
/// `out` must point to the server's display buffer of at least
/// [`SCRATCH_BUF_SIZE`] bytes.
pub unsafe fn get_thread_display<R: RtosAwareness>(
    session: &PluginSession<R>,
    out: *mut c_char,
    thread_id: u32,
) -> c_int {
    let out = std::slice::from_raw_parts_mut(out.cast::<u8>(), SCRATCH_BUF_SIZE);
    session.thread_display(out, ThreadId(thread_id))
}

/// Marshalling body of `RTOS_GetThreadReg`.
///
/// # Safety
///
/// `out` must point to a buffer the server sized for the register's hex
/// digits plus a NUL.
pub unsafe fn get_thread_reg<R: RtosAwareness>(
    session: &PluginSession<R>,
    out: *mut c_char,
    reg_index: u32,
    thread_id: u32,
) -> c_int {
    match session.thread_reg(reg_index, ThreadId(thread_id)) {
        RegisterAccess::Value(hex) => {
            copy_out(out, &hex);
            0
        }
        RegisterAccess::Cpu => -1,
    }
}

/// Marshalling body of `RTOS_GetThreadRegList`.
///
/// # Safety
///
/// `out` must point to a buffer the server sized for the whole register
/// bank's hex digits plus a NUL.
pub unsafe fn get_thread_reg_list<R: RtosAwareness>(
    session: &PluginSession<R>,
    out: *mut c_char,
    thread_id: u32,
) -> c_int {
    match session.thread_reg_list(ThreadId(thread_id)) {
        RegisterAccess::Value(hex) => {
            copy_out(out, &hex);
            0
        }
        RegisterAccess::Cpu => -1,
    }
}

/// Marshalling body of `RTOS_SetThreadReg`.
///
/// # Safety
///
/// `hex` must point to a NUL-terminated string.
pub unsafe fn set_thread_reg<R: RtosAwareness>(
    session: &PluginSession<R>,
    hex: *const c_char,
    reg_index: u32,
    thread_id: u32,
) -> c_int {
    let Some(hex) = parse_in(hex) else { return -1 };
    match session.set_thread_reg(hex, reg_index, ThreadId(thread_id)) {
        RegisterAccess::Value(()) => 0,
        RegisterAccess::Cpu => -1,
    }
}

/// Marshalling body of `RTOS_SetThreadRegList`.
///
/// # Safety
///
/// `hex` must point to a NUL-terminated string.
pub unsafe fn set_thread_reg_list<R: RtosAwareness>(
    session: &PluginSession<R>,
    hex: *const c_char,
    thread_id: u32,
) -> c_int {
    let Some(hex) = parse_in(hex) else { return -1 };
    match session.set_thread_reg_list(hex, ThreadId(thread_id)) {
        RegisterAccess::Value(()) => 0,
        RegisterAccess::Cpu => -1,
    }
}

unsafe fn copy_out(out: *mut c_char, text: &str) {
    std::ptr::copy_nonoverlapping(text.as_ptr().cast::<c_char>(), out, text.len());
    out.add(text.len()).write(0);
}

unsafe fn parse_in<'a>(text: *const c_char) -> Option<&'a str> {
    if text.is_null() {
        return None;
    }
    CStr::from_ptr(text).to_str().ok()
}

/// Generates the twelve `RTOS_*` entry points for one
/// [`RtosAwareness`] implementation.
///
/// The single-argument form builds the plug-in with `Default::default()`
/// on every `RTOS_Init`; the two-argument form takes a constructor
/// expression instead.
///
/// ```ignore
/// export_rtos_plugin!(MyRtos);
/// export_rtos_plugin!(MyRtos, MyRtos::with_defaults());
/// ```
#[macro_export]
macro_rules! export_rtos_plugin {
    ($rtos:ty) => {
        $crate::export_rtos_plugin!($rtos, <$rtos as ::core::default::Default>::default());
    };
    ($rtos:ty, $make:expr) => {
        static RTOS_PLUGIN: $crate::plugin::PluginCell<$rtos> = $crate::plugin::PluginCell::new();

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_Init(
            api: *const $crate::api::ServerApi,
            core: u32,
        ) -> ::std::ffi::c_int {
            $crate::plugin::guard(0, || {
                let Some(api) = (unsafe { api.as_ref() }) else {
                    return 0;
                };
                let slot = unsafe { RTOS_PLUGIN.session() };
                match $crate::plugin::PluginSession::attach($make, api, $crate::api::CoreId(core)) {
                    Ok(session) => {
                        *slot = Some(session);
                        1
                    }
                    Err(_) => {
                        *slot = None;
                        0
                    }
                }
            })
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_GetVersion() -> u32 {
            $crate::plugin::VERSION
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_GetSymbols() -> *mut $crate::api::SymbolEntry {
            // The table sits in an UnsafeCell'd static so the server may
            // write resolved addresses through this pointer.
            <$rtos as $crate::threads::RtosAwareness>::symbols()
                .as_ptr()
                .cast_mut()
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_GetNumThreads() -> u32 {
            $crate::plugin::guard(0, || {
                match unsafe { RTOS_PLUGIN.session() } {
                    Some(session) => session.inventory().num_threads(),
                    None => 0,
                }
            })
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_GetThreadId(index: u32) -> u32 {
            $crate::plugin::guard(0, || {
                match unsafe { RTOS_PLUGIN.session() } {
                    Some(session) => session.thread_id(index),
                    None => 0,
                }
            })
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_GetCurrentThreadId() -> u32 {
            $crate::plugin::guard(0, || {
                match unsafe { RTOS_PLUGIN.session() } {
                    Some(session) => session.current_thread_id(),
                    None => 0,
                }
            })
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_GetThreadDisplay(
            out_description: *mut ::std::ffi::c_char,
            thread_id: u32,
        ) -> ::std::ffi::c_int {
            $crate::plugin::guard(-1, || {
                match unsafe { RTOS_PLUGIN.session() } {
                    Some(session) => unsafe {
                        $crate::plugin::get_thread_display(session, out_description, thread_id)
                    },
                    None => -1,
                }
            })
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_GetThreadReg(
            out_hex_value: *mut ::std::ffi::c_char,
            reg_index: u32,
            thread_id: u32,
        ) -> ::std::ffi::c_int {
            $crate::plugin::guard(-1, || {
                match unsafe { RTOS_PLUGIN.session() } {
                    Some(session) => unsafe {
                        $crate::plugin::get_thread_reg(session, out_hex_value, reg_index, thread_id)
                    },
                    None => -1,
                }
            })
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_GetThreadRegList(
            out_hex_values: *mut ::std::ffi::c_char,
            thread_id: u32,
        ) -> ::std::ffi::c_int {
            $crate::plugin::guard(-1, || {
                match unsafe { RTOS_PLUGIN.session() } {
                    Some(session) => unsafe {
                        $crate::plugin::get_thread_reg_list(session, out_hex_values, thread_id)
                    },
                    None => -1,
                }
            })
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_SetThreadReg(
            hex_value: *mut ::std::ffi::c_char,
            reg_index: u32,
            thread_id: u32,
        ) -> ::std::ffi::c_int {
            $crate::plugin::guard(-1, || {
                match unsafe { RTOS_PLUGIN.session() } {
                    Some(session) => unsafe {
                        $crate::plugin::set_thread_reg(session, hex_value, reg_index, thread_id)
                    },
                    None => -1,
                }
            })
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_SetThreadRegList(
            hex_values: *mut ::std::ffi::c_char,
            thread_id: u32,
        ) -> ::std::ffi::c_int {
            $crate::plugin::guard(-1, || {
                match unsafe { RTOS_PLUGIN.session() } {
                    Some(session) => unsafe {
                        $crate::plugin::set_thread_reg_list(session, hex_values, thread_id)
                    },
                    None => -1,
                }
            })
        }

        #[no_mangle]
        pub unsafe extern "C" fn RTOS_UpdateThreads() -> ::std::ffi::c_int {
            $crate::plugin::guard(0, || {
                match unsafe { RTOS_PLUGIN.session() } {
                    Some(session) => match session.update_threads() {
                        Ok(()) => 1,
                        Err(_) => 0,
                    },
                    None => 0,
                }
            })
        }
    };
}
