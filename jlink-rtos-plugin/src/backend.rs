//! The single choke point for all target I/O and host logging.
//!
//! [`Backend`] wraps the raw [`ServerApi`] function pointer table in typed
//! operations: status-checked memory access, buffered decodes delegated to
//! the server's converters, endianness-aware 64-bit assembly, symbol
//! lookup and bounded formatted output. Nothing else in the crate touches
//! the host primitives directly.

use std::ffi::{c_char, c_int};
use std::fmt;

use scroll::Pwrite;
use serde::{Deserialize, Serialize};

use crate::api::{ServerApi, TargetAddress};
use crate::symbols::SymbolsRef;
use crate::Error;

/// Size of the stack-local scratch buffer used for formatted output,
/// including the terminating NUL. Matches the 256-byte display buffer the
/// server hands to `RTOS_GetThreadDisplay`.
pub const SCRATCH_BUF_SIZE: usize = 256;

/// Byte order of the target CPU.
///
/// The server's primitives already deliver word values in host order and
/// decode buffered data itself; the explicit byte order is needed for the
/// 64-bit accesses assembled on this side and for the register wire
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl From<Endianness> for scroll::Endian {
    fn from(endianness: Endianness) -> Self {
        match endianness {
            Endianness::Little => scroll::LE,
            Endianness::Big => scroll::BE,
        }
    }
}

/// Direction of a failed target memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, docsplay::Display)]
pub enum Access {
    /// read
    Read,
    /// write
    Write,
}

/// {access} of {count} byte(s) at target address {address:#010X} failed with host status {status}
///
/// The status is whatever the server returned: the target may be running,
/// the address unmapped, or the CPU faulted on the access. The backend
/// never retries; halting and retrying is host policy.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub struct MemoryError {
    /// Whether the failed access was a read or a write.
    pub access: Access,
    /// Start address of the access.
    pub address: TargetAddress,
    /// Length of the access in bytes.
    pub count: usize,
    /// Host status code, always negative.
    pub status: i32,
}

impl MemoryError {
    fn check(status: c_int, access: Access, address: TargetAddress, count: usize) -> Result<(), Self> {
        if status < 0 {
            Err(MemoryError {
                access,
                address,
                count,
                status,
            })
        } else {
            Ok(())
        }
    }
}

/// Typed facade over the host's raw memory, logging and symbol primitives.
///
/// Cheap to construct; the plug-in session builds one per entry point call.
/// A `Backend` has no knowledge of threads, it only moves and decodes
/// bytes.
#[derive(Clone, Copy)]
pub struct Backend<'a> {
    api: &'a ServerApi,
    symbols: SymbolsRef<'a>,
    endianness: Endianness,
}

impl<'a> Backend<'a> {
    /// Wraps a server API table and a resolved symbol table.
    pub fn new(api: &'a ServerApi, symbols: SymbolsRef<'a>, endianness: Endianness) -> Self {
        Self {
            api,
            symbols,
            endianness,
        }
    }

    /// The target byte order this backend decodes with.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Address of `name`, or 0 if unresolved or absent from the table.
    pub fn get_symbol_address(&self, name: &str) -> TargetAddress {
        self.symbols.address_of(name)
    }

    /// Address of `name`, failing if it is unresolved.
    ///
    /// Use for symbols the walk cannot proceed without; optional symbols
    /// should go through [`get_symbol_address`](Self::get_symbol_address)
    /// and handle 0 themselves.
    pub fn require_symbol(&self, name: &'static str) -> Result<TargetAddress, Error> {
        match self.get_symbol_address(name) {
            0 => Err(Error::UnresolvedSymbol(name)),
            address => Ok(address),
        }
    }

    /// Reads one byte of target memory.
    pub fn read_u8(&self, address: TargetAddress) -> Result<u8, MemoryError> {
        let mut value = 0u8;
        let status = unsafe { (self.api.read_byte)(address, &mut value) };
        MemoryError::check(status, Access::Read, address, 1)?;
        Ok(value)
    }

    /// Reads a 16-bit word, converted to host order by the server.
    pub fn read_u16(&self, address: TargetAddress) -> Result<u16, MemoryError> {
        let mut value = 0u16;
        let status = unsafe { (self.api.read_short)(address, &mut value) };
        MemoryError::check(status, Access::Read, address, 2)?;
        Ok(value)
    }

    /// Reads a 32-bit word, converted to host order by the server.
    pub fn read_u32(&self, address: TargetAddress) -> Result<u32, MemoryError> {
        let mut value = 0u32;
        let status = unsafe { (self.api.read_long)(address, &mut value) };
        MemoryError::check(status, Access::Read, address, 4)?;
        Ok(value)
    }

    /// Reads a 64-bit word.
    ///
    /// The server API has no 64-bit primitive, so the value is assembled
    /// from two 32-bit reads in target word order.
    pub fn read_u64(&self, address: TargetAddress) -> Result<u64, MemoryError> {
        let first = self.read_u32(address)?;
        let second = self.read_u32(address.wrapping_add(4))?;
        Ok(match self.endianness {
            Endianness::Little => (u64::from(second) << 32) | u64::from(first),
            Endianness::Big => (u64::from(first) << 32) | u64::from(second),
        })
    }

    /// Fills `buf` from target memory at `address`.
    pub fn read_bytes(&self, address: TargetAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        if buf.is_empty() {
            return Ok(());
        }
        let status =
            unsafe { (self.api.read_byte_array)(address, buf.as_mut_ptr(), buf.len()) };
        MemoryError::check(status, Access::Read, address, buf.len())
    }

    /// Writes one byte of target memory. The server reports no status for
    /// single-word writes.
    pub fn write_u8(&self, address: TargetAddress, value: u8) {
        unsafe { (self.api.write_byte)(address, value) };
    }

    /// Writes a 16-bit word in target order.
    pub fn write_u16(&self, address: TargetAddress, value: u16) {
        unsafe { (self.api.write_short)(address, value) };
    }

    /// Writes a 32-bit word in target order.
    pub fn write_u32(&self, address: TargetAddress, value: u32) {
        unsafe { (self.api.write_long)(address, value) };
    }

    /// Writes a 64-bit word as one checked byte-array store in target
    /// order, since the server has no 64-bit primitive.
    pub fn write_u64(&self, address: TargetAddress, value: u64) -> Result<(), MemoryError> {
        let mut buf = [0u8; 8];
        buf.pwrite_with(value, 0, scroll::Endian::from(self.endianness))
            .expect("an u64 - this is a bug, please report it");
        self.write_bytes(address, &buf)
    }

    /// Writes `data` to target memory at `address`.
    pub fn write_bytes(&self, address: TargetAddress, data: &[u8]) -> Result<(), MemoryError> {
        if data.is_empty() {
            return Ok(());
        }
        let status =
            unsafe { (self.api.write_byte_array)(address, data.as_ptr(), data.len()) };
        MemoryError::check(status, Access::Write, address, data.len())
    }

    /// Decodes two buffered bytes through the server's converter, which
    /// is the authority on target byte order.
    pub fn load_u16(&self, bytes: &[u8; 2]) -> u16 {
        unsafe { (self.api.load_short)(bytes.as_ptr()) as u16 }
    }

    /// Decodes three buffered bytes through the server's converter.
    pub fn load_u24(&self, bytes: &[u8; 3]) -> u32 {
        unsafe { (self.api.load_3bytes)(bytes.as_ptr()) }
    }

    /// Decodes four buffered bytes through the server's converter.
    pub fn load_u32(&self, bytes: &[u8; 4]) -> u32 {
        unsafe { (self.api.load_long)(bytes.as_ptr()) }
    }

    /// Decodes eight buffered bytes.
    ///
    /// The server has no 64-bit converter; the value is assembled from
    /// two 32-bit host decodes in target word order.
    pub fn load_u64(&self, bytes: &[u8; 8]) -> u64 {
        let first = unsafe { (self.api.load_long)(bytes.as_ptr()) };
        let second = unsafe { (self.api.load_long)(bytes[4..].as_ptr()) };
        match self.endianness {
            Endianness::Little => (u64::from(second) << 32) | u64::from(first),
            Endianness::Big => (u64::from(first) << 32) | u64::from(second),
        }
    }

    /// Logs to the GDB server console. Returns the emitted length, which is
    /// silently capped at [`SCRATCH_BUF_SIZE`] minus the NUL.
    pub fn output(&self, args: fmt::Arguments<'_>) -> usize {
        tracing::debug!(target: "host", "{args}");
        self.emit(self.api.output, args)
    }

    /// Logs to the server's debug channel.
    pub fn output_debug(&self, args: fmt::Arguments<'_>) -> usize {
        tracing::trace!(target: "host", "{args}");
        self.emit(self.api.output_debug, args)
    }

    /// Logs to the server console with a warning prefix.
    pub fn output_warning(&self, args: fmt::Arguments<'_>) -> usize {
        tracing::warn!(target: "host", "{args}");
        self.emit(self.api.output_warning, args)
    }

    /// Logs to the server console with an error prefix.
    pub fn output_error(&self, args: fmt::Arguments<'_>) -> usize {
        tracing::error!(target: "host", "{args}");
        self.emit(self.api.output_error, args)
    }

    fn emit(
        &self,
        sink: unsafe extern "C" fn(fmt: *const c_char, ...),
        args: fmt::Arguments<'_>,
    ) -> usize {
        let mut storage = [0u8; SCRATCH_BUF_SIZE];
        let mut writer = TruncatingWriter::new(&mut storage);
        // Truncation is accepted silently; this is a diagnostic channel.
        let _ = fmt::Write::write_fmt(&mut writer, args);
        let len = writer.finish();
        unsafe { sink(storage.as_ptr().cast::<c_char>()) };
        len
    }
}

impl fmt::Debug for Backend<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("api", &(self.api as *const ServerApi))
            .field("endianness", &self.endianness)
            .finish()
    }
}

/// A [`fmt::Write`] sink over a fixed byte buffer that drops everything
/// past the end instead of failing, always leaving room for one NUL.
pub(crate) struct TruncatingWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> TruncatingWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        debug_assert!(!buf.is_empty());
        Self { buf, len: 0 }
    }

    /// Terminates the buffer and returns the number of bytes written,
    /// excluding the NUL.
    pub(crate) fn finish(self) -> usize {
        self.buf[self.len] = 0;
        self.len
    }
}

impl fmt::Write for TruncatingWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let space = self.buf.len() - 1 - self.len;
        let take = s.len().min(space);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_host::FakeHost;
    use crate::symbol_table;
    use crate::symbols::SymbolTable;
    use pretty_assertions::assert_eq;
    use std::fmt::Write;
    use test_case::test_case;

    static NO_SYMBOLS: SymbolTable<1> = symbol_table! {};

    fn backend(host: &FakeHost, endianness: Endianness) -> Backend<'static> {
        Backend::new(host.api(), NO_SYMBOLS.as_ref(), endianness)
    }

    #[test_case(Endianness::Little; "little endian")]
    #[test_case(Endianness::Big; "big endian")]
    fn u64_roundtrip_through_target_memory(endianness: Endianness) {
        let host = FakeHost::install();
        host.set_endianness(endianness);
        let backend = backend(&host, endianness);

        for value in [0u64, u64::MAX, 0x0123_4567_89AB_CDEF] {
            backend.write_u64(0x2000_0000, value).unwrap();
            assert_eq!(backend.read_u64(0x2000_0000).unwrap(), value);
        }
    }

    #[test_case(Endianness::Little; "little endian")]
    #[test_case(Endianness::Big; "big endian")]
    fn loads_reconstruct_stored_values(endianness: Endianness) {
        let host = FakeHost::install();
        host.set_endianness(endianness);
        let backend = backend(&host, endianness);

        for value in [0u16, u16::MAX, 0xA55A] {
            backend.write_u16(0x2000_0100, value);
            let mut raw = [0u8; 2];
            backend.read_bytes(0x2000_0100, &mut raw).unwrap();
            assert_eq!(backend.load_u16(&raw), value);
        }
        for value in [0u32, u32::MAX, 0xDEAD_BEEF] {
            backend.write_u32(0x2000_0200, value);
            let mut raw = [0u8; 4];
            backend.read_bytes(0x2000_0200, &mut raw).unwrap();
            assert_eq!(backend.load_u32(&raw), value);
        }
        for value in [0u64, u64::MAX, 0x0123_4567_89AB_CDEF] {
            backend.write_u64(0x2000_0300, value).unwrap();
            let mut raw = [0u8; 8];
            backend.read_bytes(0x2000_0300, &mut raw).unwrap();
            assert_eq!(backend.load_u64(&raw), value);
        }
    }

    #[test]
    fn load_u24_follows_the_host_byte_order() {
        let host = FakeHost::install();

        host.set_endianness(Endianness::Little);
        let little = backend(&host, Endianness::Little);
        assert_eq!(little.load_u24(&[0x01, 0x02, 0x03]), 0x0003_0201);

        host.set_endianness(Endianness::Big);
        let big = backend(&host, Endianness::Big);
        assert_eq!(big.load_u24(&[0x01, 0x02, 0x03]), 0x0001_0203);
    }

    #[test]
    fn buffered_loads_use_the_host_decoders() {
        let host = FakeHost::install();
        let backend = backend(&host, Endianness::Little);

        backend.load_u16(&[0x01, 0x02]);
        backend.load_u32(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(host.load_calls(), 2);

        // The 64-bit assembly runs the 32-bit decoder twice.
        backend.load_u64(&[0u8; 8]);
        assert_eq!(host.load_calls(), 4);
    }

    #[test]
    fn read_failure_surfaces_host_status() {
        let host = FakeHost::install();
        let backend = backend(&host, Endianness::Little);

        // Nothing was placed at this address.
        let error = backend.read_u32(0x1000_0000).unwrap_err();
        assert_eq!(error.status, -1);
        assert_eq!(error.access, Access::Read);
        assert_eq!(error.address, 0x1000_0000);
    }

    #[test]
    fn output_truncates_silently_at_scratch_size() {
        let host = FakeHost::install();
        let backend = backend(&host, Endianness::Little);

        let long = "x".repeat(4 * SCRATCH_BUF_SIZE);
        let len = backend.output(format_args!("{long}"));
        assert_eq!(len, SCRATCH_BUF_SIZE - 1);

        let log = host.log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1.len(), SCRATCH_BUF_SIZE - 1);
    }

    #[test]
    fn output_channels_reach_their_sinks() {
        let host = FakeHost::install();
        let backend = backend(&host, Endianness::Little);

        backend.output(format_args!("plain"));
        backend.output_debug(format_args!("debug"));
        backend.output_warning(format_args!("warn"));
        backend.output_error(format_args!("error"));

        let channels: Vec<&str> = host.log().iter().map(|(c, _)| *c).collect();
        assert_eq!(channels, vec!["output", "debug", "warning", "error"]);
    }

    #[test]
    fn truncating_writer_never_overruns() {
        let mut buf = [0xFFu8; 16];
        let mut writer = TruncatingWriter::new(&mut buf[..8]);
        write!(writer, "0123456789abcdef").unwrap();
        assert_eq!(writer.finish(), 7);
        assert_eq!(&buf[..8], b"0123456\0");
        // Bytes past the sub-buffer stay untouched.
        assert_eq!(buf[8], 0xFF);
    }
}
