//! An in-process stand-in for the GDB server, for tests.
//!
//! [`FakeHost`] serves a real [`ServerApi`] table whose function pointers
//! operate on a byte-addressed sparse memory image, a [`System`]-backed
//! heap with call counters, and a captured log. Entry points and the
//! backend can then be exercised end to end without a J-Link attached.
//!
//! The table and its state are process-wide statics because the protocol
//! hands out plain function pointers with no context argument. Tests
//! therefore serialize on a guard taken by [`FakeHost::install`]; state is
//! reset each time, so every test starts from an empty image.

use std::alloc::{GlobalAlloc, Layout, System};
use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;

use crate::api::{ServerApi, TargetAddress};
use crate::backend::Endianness;

struct HostState {
    endianness: Endianness,
    memory: BTreeMap<TargetAddress, u8>,
    /// Remaining read calls allowed to succeed, if limited.
    read_budget: Option<u32>,
    read_calls: u32,
    write_calls: u32,
    load_calls: u32,
    alloc_calls: u32,
    dealloc_calls: u32,
    /// Base address and size of every outstanding heap block.
    live: BTreeMap<usize, usize>,
    log: Vec<(&'static str, String)>,
}

impl HostState {
    const fn new() -> Self {
        Self {
            endianness: Endianness::Little,
            memory: BTreeMap::new(),
            read_budget: None,
            read_calls: 0,
            write_calls: 0,
            load_calls: 0,
            alloc_calls: 0,
            dealloc_calls: 0,
            live: BTreeMap::new(),
            log: Vec::new(),
        }
    }
}

static TEST_GUARD: Mutex<()> = Mutex::new(());
static STATE: Mutex<HostState> = Mutex::new(HostState::new());

fn state() -> MutexGuard<'static, HostState> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive handle on the fake server for the duration of one test.
pub struct FakeHost {
    _guard: MutexGuard<'static, ()>,
}

impl FakeHost {
    /// Takes over the process-wide fake server with a cleared state.
    pub fn install() -> Self {
        let guard = TEST_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
        *state() = HostState::new();
        Self { _guard: guard }
    }

    /// The server table to hand to the code under test.
    pub fn api(&self) -> &'static ServerApi {
        Lazy::force(&SERVER_API)
    }

    /// Sets the byte order the word-sized primitives convert with.
    pub fn set_endianness(&self, endianness: Endianness) {
        state().endianness = endianness;
    }

    /// Maps `bytes` into the target image at `address`.
    pub fn set_memory(&self, address: TargetAddress, bytes: &[u8]) {
        let mut state = state();
        for (i, byte) in bytes.iter().enumerate() {
            state.memory.insert(address.wrapping_add(i as TargetAddress), *byte);
        }
    }

    /// Maps a 32-bit word at `address` in the current byte order.
    pub fn set_u32(&self, address: TargetAddress, value: u32) {
        let mut state = state();
        let bytes = match state.endianness {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => value.to_be_bytes(),
        };
        for (i, byte) in bytes.into_iter().enumerate() {
            state.memory.insert(address.wrapping_add(i as TargetAddress), byte);
        }
    }

    /// Lets the next `count` read calls succeed and fails every one after,
    /// simulating a target that drops off mid-walk.
    pub fn fail_after_reads(&self, count: u32) {
        state().read_budget = Some(count);
    }

    /// Number of memory read calls made so far.
    pub fn read_calls(&self) -> u32 {
        state().read_calls
    }

    /// Number of memory write calls made so far.
    pub fn write_calls(&self) -> u32 {
        state().write_calls
    }

    /// Number of buffered-decode (`load_*`) calls made so far.
    pub fn load_calls(&self) -> u32 {
        state().load_calls
    }

    /// Number of `allocate` calls made so far.
    pub fn alloc_calls(&self) -> u32 {
        state().alloc_calls
    }

    /// Number of `deallocate` calls made so far.
    pub fn dealloc_calls(&self) -> u32 {
        state().dealloc_calls
    }

    /// Number of heap blocks currently outstanding.
    pub fn live_allocs(&self) -> usize {
        state().live.len()
    }

    /// Everything the plug-in printed, as (channel, text) pairs.
    pub fn log(&self) -> Vec<(&'static str, String)> {
        state().log.clone()
    }
}

fn charge_read(state: &mut HostState) -> bool {
    state.read_calls += 1;
    match &mut state.read_budget {
        Some(0) => false,
        Some(remaining) => {
            *remaining -= 1;
            true
        }
        None => true,
    }
}

fn fetch(state: &HostState, address: TargetAddress, count: usize) -> Option<Vec<u8>> {
    (0..count)
        .map(|i| {
            let address = address.wrapping_add(i as TargetAddress);
            state.memory.get(&address).copied()
        })
        .collect()
}

fn store(state: &mut HostState, address: TargetAddress, bytes: &[u8]) {
    for (i, byte) in bytes.iter().enumerate() {
        state.memory.insert(address.wrapping_add(i as TargetAddress), *byte);
    }
}

fn to_target_order(endianness: Endianness, value: u32, count: usize) -> Vec<u8> {
    match endianness {
        Endianness::Little => value.to_le_bytes()[..count].to_vec(),
        Endianness::Big => value.to_be_bytes()[4 - count..].to_vec(),
    }
}

fn from_target_order(endianness: Endianness, bytes: &[u8]) -> u32 {
    let mut value = 0u32;
    match endianness {
        Endianness::Big => {
            for byte in bytes {
                value = (value << 8) | u32::from(*byte);
            }
        }
        Endianness::Little => {
            for byte in bytes.iter().rev() {
                value = (value << 8) | u32::from(*byte);
            }
        }
    }
    value
}

extern "C" fn allocate(nbytes: usize) -> *mut c_void {
    let mut state = state();
    state.alloc_calls += 1;
    let Ok(layout) = Layout::from_size_align(nbytes.max(1), 16) else {
        return std::ptr::null_mut();
    };
    let ptr = unsafe { System.alloc(layout) };
    if !ptr.is_null() {
        state.live.insert(ptr as usize, nbytes);
    }
    ptr.cast::<c_void>()
}

extern "C" fn deallocate(p: *mut c_void) {
    if p.is_null() {
        return;
    }
    let mut state = state();
    state.dealloc_calls += 1;
    let size = state
        .live
        .remove(&(p as usize))
        .expect("deallocate of a pointer this host never produced");
    let layout = Layout::from_size_align(size.max(1), 16).expect("was valid at allocation");
    unsafe { System.dealloc(p.cast::<u8>(), layout) };
}

extern "C" fn reallocate(p: *mut c_void, nbytes: c_uint) -> *mut c_void {
    let fresh = allocate(nbytes as usize);
    if fresh.is_null() || p.is_null() {
        return fresh;
    }
    let old_size = *state().live.get(&(p as usize)).expect("unknown pointer");
    unsafe {
        std::ptr::copy_nonoverlapping(
            p.cast::<u8>(),
            fresh.cast::<u8>(),
            old_size.min(nbytes as usize),
        );
    }
    deallocate(p);
    fresh
}

extern "C" fn read_byte_array(addr: TargetAddress, out: *mut u8, nbytes: usize) -> c_int {
    let mut state = state();
    if !charge_read(&mut state) {
        return -1;
    }
    match fetch(&state, addr, nbytes) {
        Some(bytes) => {
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, nbytes) };
            0
        }
        None => -1,
    }
}

fn read_word(addr: TargetAddress, count: usize) -> Option<u32> {
    let mut state = state();
    if !charge_read(&mut state) {
        return None;
    }
    let bytes = fetch(&state, addr, count)?;
    Some(from_target_order(state.endianness, &bytes))
}

extern "C" fn read_byte(addr: TargetAddress, out: *mut u8) -> c_int {
    match read_word(addr, 1) {
        Some(value) => {
            unsafe { out.write(value as u8) };
            0
        }
        None => -1,
    }
}

extern "C" fn read_short(addr: TargetAddress, out: *mut u16) -> c_int {
    match read_word(addr, 2) {
        Some(value) => {
            unsafe { out.write(value as u16) };
            0
        }
        None => -1,
    }
}

extern "C" fn read_long(addr: TargetAddress, out: *mut u32) -> c_int {
    match read_word(addr, 4) {
        Some(value) => {
            unsafe { out.write(value) };
            0
        }
        None => -1,
    }
}

extern "C" fn write_byte_array(addr: TargetAddress, data: *const u8, nbytes: usize) -> c_int {
    let mut state = state();
    state.write_calls += 1;
    let bytes = unsafe { std::slice::from_raw_parts(data, nbytes) };
    store(&mut state, addr, bytes);
    0
}

fn write_word(addr: TargetAddress, value: u32, count: usize) {
    let mut state = state();
    state.write_calls += 1;
    let bytes = to_target_order(state.endianness, value, count);
    store(&mut state, addr, &bytes);
}

extern "C" fn write_byte(addr: TargetAddress, data: u8) {
    write_word(addr, u32::from(data), 1);
}

extern "C" fn write_short(addr: TargetAddress, data: u16) {
    write_word(addr, u32::from(data), 2);
}

extern "C" fn write_long(addr: TargetAddress, data: u32) {
    write_word(addr, data, 4);
}

fn load(p: *const u8, count: usize) -> u32 {
    let bytes = unsafe { std::slice::from_raw_parts(p, count) };
    let mut state = state();
    state.load_calls += 1;
    from_target_order(state.endianness, bytes)
}

extern "C" fn load_short(p: *const u8) -> u32 {
    load(p, 2)
}

extern "C" fn load_3bytes(p: *const u8) -> u32 {
    load(p, 3)
}

extern "C" fn load_long(p: *const u8) -> u32 {
    load(p, 4)
}

fn capture(channel: &'static str, fmt: *const c_char) {
    let text = if fmt.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(fmt) }.to_string_lossy().into_owned()
    };
    state().log.push((channel, text));
}

extern "C" fn sink_output(fmt: *const c_char) {
    capture("output", fmt);
}

extern "C" fn sink_debug(fmt: *const c_char) {
    capture("debug", fmt);
}

extern "C" fn sink_warning(fmt: *const c_char) {
    capture("warning", fmt);
}

extern "C" fn sink_error(fmt: *const c_char) {
    capture("error", fmt);
}

type Sink = extern "C" fn(*const c_char);
type VariadicSink = unsafe extern "C" fn(*const c_char, ...);

/// Reinterprets a plain sink as the table's variadic signature.
///
/// Sound for this crate's usage: the backend always calls the sinks with
/// exactly one pre-formatted string argument, which matches the shim's
/// real signature under the C calling convention.
fn variadic(sink: Sink) -> VariadicSink {
    unsafe { mem::transmute::<Sink, VariadicSink>(sink) }
}

static SERVER_API: Lazy<ServerApi> = Lazy::new(|| ServerApi {
    deallocate,
    allocate,
    reallocate,
    output: variadic(sink_output),
    output_debug: variadic(sink_debug),
    output_warning: variadic(sink_warning),
    output_error: variadic(sink_error),
    read_byte_array,
    read_byte,
    read_short,
    read_long,
    write_byte_array,
    write_byte,
    write_short,
    write_long,
    load_short,
    load_3bytes,
    load_long,
});
