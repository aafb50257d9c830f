//! End-to-end exercise of the exported `RTOS_*` entry points against a
//! small synthetic kernel living in fake host memory.
//!
//! The kernel model: a singly linked task list anchored at `OS_TaskList`,
//! the running task in `OS_CurrentTask`, and task control blocks holding
//! next pointer, name pointer, state word, priority and an optional saved
//! register context of two 32-bit registers.

use std::ffi::c_char;

use jlink_rtos_plugin::fake_host::FakeHost;
use jlink_rtos_plugin::{
    export_rtos_plugin, read_c_string, symbol_table, Backend, CoreId, Error, RegisterLayout,
    RegisterWidth, RtosAwareness, Snapshot, StackedRegister, SymbolTable, SymbolsRef, TargetList,
    ThreadId, ThreadInfo,
};

const TASK_LIST_ANCHOR: u32 = 0x2000_0000;
const CURRENT_TASK_ANCHOR: u32 = 0x2000_0008;

const NEXT_OFFSET: u32 = 0;
const NAME_OFFSET: u32 = 4;
const STATE_OFFSET: u32 = 8;
const PRIO_OFFSET: u32 = 12;
const CONTEXT_OFFSET: u32 = 16;

static SYMBOLS: SymbolTable<3> = symbol_table! {
    mandatory "OS_TaskList",
    mandatory "OS_CurrentTask",
};

static LAYOUT: RegisterLayout = RegisterLayout {
    bank_size: 2,
    stacked: &[
        StackedRegister {
            index: 0,
            offset: 0,
            width: RegisterWidth::U32,
        },
        StackedRegister {
            index: 1,
            offset: 4,
            width: RegisterWidth::U32,
        },
    ],
};

#[derive(Default)]
struct ToyRtos;

impl RtosAwareness for ToyRtos {
    fn symbols() -> SymbolsRef<'static> {
        SYMBOLS.as_ref()
    }

    fn supports_core(&self, core: CoreId) -> bool {
        core == CoreId::CORTEX_M0
    }

    fn register_layout(&self, _thread: &ThreadInfo) -> &RegisterLayout {
        &LAYOUT
    }

    fn build_snapshot(&mut self, backend: &Backend<'_>) -> Result<Snapshot, Error> {
        let head = backend.read_u32(backend.require_symbol("OS_TaskList")?)?;
        let current = backend.read_u32(backend.require_symbol("OS_CurrentTask")?)?;

        let mut builder = Snapshot::builder();
        for node in TargetList::new(backend, head, NEXT_OFFSET, 16) {
            let node = node?;
            let name_ptr = backend.read_u32(node + NAME_OFFSET)?;
            let state = match backend.read_u32(node + STATE_OFFSET)? {
                0 => "ready",
                1 => "blocked",
                _ => "unknown",
            };
            let priority = backend.read_u32(node + PRIO_OFFSET)?;
            let context = match backend.read_u32(node + CONTEXT_OFFSET)? {
                0 => None,
                address => Some(address),
            };
            builder.push(ThreadInfo {
                id: ThreadId(node),
                name: read_c_string(backend, name_ptr, 512)?,
                state: state.into(),
                priority: Some(priority),
                context,
            })?;
        }
        Ok(builder.finish(ThreadId(current))?)
    }
}

export_rtos_plugin!(ToyRtos);

/// Plays the server's symbol resolution step: writes the anchor addresses
/// into the table returned by `RTOS_GetSymbols`.
fn resolve_symbols() {
    unsafe {
        let mut entry = RTOS_GetSymbols();
        while !(*entry).is_sentinel() {
            let name = (*entry).name().unwrap().to_str().unwrap();
            (*entry).address = match name {
                "OS_TaskList" => TASK_LIST_ANCHOR,
                "OS_CurrentTask" => CURRENT_TASK_ANCHOR,
                other => panic!("unexpected symbol {other}"),
            };
            entry = entry.add(1);
        }
    }
}

fn write_tcb(
    host: &FakeHost,
    address: u32,
    next: u32,
    name_addr: u32,
    state: u32,
    priority: u32,
    context: u32,
) {
    host.set_u32(address + NEXT_OFFSET, next);
    host.set_u32(address + NAME_OFFSET, name_addr);
    host.set_u32(address + STATE_OFFSET, state);
    host.set_u32(address + PRIO_OFFSET, priority);
    host.set_u32(address + CONTEXT_OFFSET, context);
}

/// Two tasks: "main" running (registers on the CPU) and "worker" blocked
/// with a saved two-register context.
fn setup_kernel(host: &FakeHost) {
    host.set_u32(TASK_LIST_ANCHOR, 0x1000);
    host.set_u32(CURRENT_TASK_ANCHOR, 0x1000);

    // Names padded to the reader's chunk size; only bytes up to the NUL
    // are meaningful.
    host.set_memory(0x3000, b"main\0\0\0\0\0\0\0\0\0\0\0\0");
    host.set_memory(0x3010, b"worker\0\0\0\0\0\0\0\0\0\0");

    write_tcb(host, 0x1000, 0x1040, 0x3000, 0, 1, 0);
    write_tcb(host, 0x1040, 0, 0x3010, 1, 7, 0x4000);

    // worker's saved context: r0, r1.
    host.set_u32(0x4000, 0xDEAD_BEEF);
    host.set_u32(0x4004, 0x0102_0304);
}

fn display(thread_id: u32) -> (i32, String) {
    let mut buf = [0u8; 256];
    let len = unsafe { RTOS_GetThreadDisplay(buf.as_mut_ptr().cast::<c_char>(), thread_id) };
    let text = std::str::from_utf8(&buf[..len.max(0) as usize])
        .unwrap()
        .to_owned();
    (len, text)
}

fn get_reg(reg_index: u32, thread_id: u32) -> (i32, String) {
    let mut buf = [0u8; 64];
    let status = unsafe { RTOS_GetThreadReg(buf.as_mut_ptr().cast::<c_char>(), reg_index, thread_id) };
    let end = buf.iter().position(|b| *b == 0).unwrap();
    (status, String::from_utf8(buf[..end].to_vec()).unwrap())
}

#[test]
fn unsupported_core_is_rejected_without_target_io() {
    let host = FakeHost::install();

    let status = unsafe { RTOS_Init(host.api(), CoreId::CORTEX_M7.0) };
    assert_eq!(status, 0);
    assert_eq!(host.read_calls(), 0);
    assert_eq!(host.write_calls(), 0);

    // The plug-in stays inactive: every query answers the empty default.
    assert_eq!(unsafe { RTOS_GetNumThreads() }, 0);
    assert_eq!(unsafe { RTOS_GetCurrentThreadId() }, 0);
    assert_eq!(unsafe { RTOS_UpdateThreads() }, 0);
}

#[test]
fn session_serves_threads_from_one_snapshot() {
    let host = FakeHost::install();
    setup_kernel(&host);
    resolve_symbols();

    assert_eq!(unsafe { RTOS_GetVersion() }, jlink_rtos_plugin::VERSION);
    assert_eq!(unsafe { RTOS_Init(host.api(), CoreId::CORTEX_M0.0) }, 1);
    assert_eq!(unsafe { RTOS_UpdateThreads() }, 1);

    assert_eq!(unsafe { RTOS_GetNumThreads() }, 2);
    assert_eq!(unsafe { RTOS_GetThreadId(0) }, 0x1000);
    assert_eq!(unsafe { RTOS_GetThreadId(1) }, 0x1040);
    assert_eq!(unsafe { RTOS_GetCurrentThreadId() }, 0x1000);
    // Out-of-range index is the server's contract violation; answer 0.
    assert_eq!(unsafe { RTOS_GetThreadId(7) }, 0);

    let reads_before = host.read_calls();
    let (len, text) = display(0x1040);
    assert_eq!(text, "worker [blocked, prio 7]");
    assert_eq!(len as usize, text.len());
    let (_, text) = display(0x1000);
    assert_eq!(text, "main [ready, prio 1]");
    // Queries are pure snapshot lookups.
    assert_eq!(host.read_calls(), reads_before);
}

#[test]
fn registers_come_from_the_saved_context_in_wire_order() {
    let host = FakeHost::install();
    setup_kernel(&host);
    resolve_symbols();
    assert_eq!(unsafe { RTOS_Init(host.api(), CoreId::CORTEX_M0.0) }, 1);
    assert_eq!(unsafe { RTOS_UpdateThreads() }, 1);

    // Little-endian target: 0xDEADBEEF serializes as "efbeadde".
    assert_eq!(get_reg(0, 0x1040), (0, "efbeadde".to_owned()));
    assert_eq!(get_reg(1, 0x1040), (0, "04030201".to_owned()));

    // The running thread and unstacked registers delegate to the CPU.
    assert_eq!(get_reg(0, 0x1000).0, -1);
    assert_eq!(get_reg(9, 0x1040).0, -1);

    let mut buf = [0u8; 64];
    let status =
        unsafe { RTOS_GetThreadRegList(buf.as_mut_ptr().cast::<c_char>(), 0x1040) };
    assert_eq!(status, 0);
    let end = buf.iter().position(|b| *b == 0).unwrap();
    assert_eq!(&buf[..end], b"efbeadde04030201");

    // Write one register back and observe it through the same path.
    let mut value = *b"0a0b0c0d\0";
    let status = unsafe {
        RTOS_SetThreadReg(value.as_mut_ptr().cast::<c_char>(), 1, 0x1040)
    };
    assert_eq!(status, 0);
    assert_eq!(get_reg(1, 0x1040), (0, "0a0b0c0d".to_owned()));

    // Writing the running thread's register goes to the CPU instead.
    let status = unsafe {
        RTOS_SetThreadReg(value.as_mut_ptr().cast::<c_char>(), 1, 0x1000)
    };
    assert_eq!(status, -1);

    let mut bank = *b"1111111122222222\0";
    let status = unsafe {
        RTOS_SetThreadRegList(bank.as_mut_ptr().cast::<c_char>(), 0x1040)
    };
    assert_eq!(status, 0);
    assert_eq!(get_reg(0, 0x1040), (0, "11111111".to_owned()));
    assert_eq!(get_reg(1, 0x1040), (0, "22222222".to_owned()));
}

#[test]
fn display_of_an_unknown_thread_reports_failure() {
    let host = FakeHost::install();
    setup_kernel(&host);
    resolve_symbols();
    assert_eq!(unsafe { RTOS_Init(host.api(), CoreId::CORTEX_M0.0) }, 1);
    assert_eq!(unsafe { RTOS_UpdateThreads() }, 1);

    // An id outside the snapshot must fail with a negative length, not
    // hand the server diagnostic text as if it were a thread line.
    let mut buf = [0xFFu8; 256];
    let len = unsafe { RTOS_GetThreadDisplay(buf.as_mut_ptr().cast::<c_char>(), 0xBAD0) };
    assert!(len < 0);
    assert_eq!(buf[0], 0);
}

#[test]
fn failed_update_keeps_the_previous_snapshot() {
    let host = FakeHost::install();
    setup_kernel(&host);
    resolve_symbols();
    assert_eq!(unsafe { RTOS_Init(host.api(), CoreId::CORTEX_M0.0) }, 1);
    assert_eq!(unsafe { RTOS_UpdateThreads() }, 1);

    let before = (
        unsafe { RTOS_GetNumThreads() },
        unsafe { RTOS_GetThreadId(0) },
        unsafe { RTOS_GetThreadId(1) },
        unsafe { RTOS_GetCurrentThreadId() },
        display(0x1040),
    );

    // The target drops off mid-walk; the update must fail as a whole.
    host.fail_after_reads(3);
    assert_eq!(unsafe { RTOS_UpdateThreads() }, 0);
    assert!(host
        .log()
        .iter()
        .any(|(channel, text)| *channel == "warning" && text.contains("update failed")));

    let after = (
        unsafe { RTOS_GetNumThreads() },
        unsafe { RTOS_GetThreadId(0) },
        unsafe { RTOS_GetThreadId(1) },
        unsafe { RTOS_GetCurrentThreadId() },
        display(0x1040),
    );
    assert_eq!(before, after);
}

#[test]
fn overlong_names_truncate_inside_the_display_buffer() {
    let host = FakeHost::install();
    setup_kernel(&host);
    resolve_symbols();

    // Replace worker's name with something far past the display buffer.
    let long_name = [b'n'; 300];
    host.set_memory(0x5000, &long_name);
    // NUL plus padding, so the chunked name reader stays in mapped memory.
    host.set_memory(0x5000 + 300, &[0u8; 16]);
    host.set_u32(0x1040 + NAME_OFFSET, 0x5000);

    assert_eq!(unsafe { RTOS_Init(host.api(), CoreId::CORTEX_M0.0) }, 1);
    assert_eq!(unsafe { RTOS_UpdateThreads() }, 1);

    let mut buf = [0xFFu8; 257];
    let len = unsafe { RTOS_GetThreadDisplay(buf.as_mut_ptr().cast::<c_char>(), 0x1040) };
    assert_eq!(len, 255);
    assert_eq!(buf[255], 0);
    // The byte after the server's 256-byte buffer stays untouched.
    assert_eq!(buf[256], 0xFF);
}

#[test]
fn queries_before_the_first_update_answer_empty() {
    let host = FakeHost::install();
    setup_kernel(&host);
    resolve_symbols();
    assert_eq!(unsafe { RTOS_Init(host.api(), CoreId::CORTEX_M0.0) }, 1);

    assert_eq!(unsafe { RTOS_GetNumThreads() }, 0);
    assert_eq!(unsafe { RTOS_GetCurrentThreadId() }, 0);
    // Register queries fall back to the CPU rather than guessing, and a
    // display request has nothing to serve yet.
    assert_eq!(get_reg(0, 0x1040).0, -1);
    assert!(display(0x1040).0 < 0);
}
