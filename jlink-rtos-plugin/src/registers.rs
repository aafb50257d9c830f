//! Register descriptions and the hex wire encoding.
//!
//! The GDB server exchanges register values with the plug-in as hex
//! strings in target memory order, two digits per byte, the same layout a
//! GDB `g` packet uses. Where each numbered register of a suspended thread
//! lives inside its saved stack context is RTOS- and port-specific, so a
//! plug-in describes it as data with [`RegisterLayout`] instead of code.

use serde::{Deserialize, Serialize};

use crate::backend::Endianness;

/// Width of a CPU register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterWidth {
    /// 16-bit register.
    U16,
    /// 32-bit register.
    U32,
    /// 64-bit register.
    U64,
}

impl RegisterWidth {
    /// Width in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            RegisterWidth::U16 => 2,
            RegisterWidth::U32 => 4,
            RegisterWidth::U64 => 8,
        }
    }

    /// Number of hex digits encoding one value of this width.
    pub const fn hex_digits(self) -> usize {
        self.bytes() * 2
    }
}

/// A register hex string from the server could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, docsplay::Display)]
pub enum HexError {
    /// the register hex string contains the non-hex character {0:?}
    InvalidDigit(char),
    /// the register hex string is {got} digits long, expected {expected}
    Length {
        /// Digits required for the register width.
        expected: usize,
        /// Digits actually supplied.
        got: usize,
    },
}

/// Encodes raw target-order bytes as lowercase hex.
pub fn encode_bytes(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len() * 2);
    for byte in raw {
        out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap());
        out.push(char::from_digit(u32::from(byte & 0xF), 16).unwrap());
    }
    out
}

/// Decodes a hex string into `out`, which fixes the expected length.
pub fn decode_bytes(hex: &str, out: &mut [u8]) -> Result<(), HexError> {
    if hex.len() != out.len() * 2 {
        return Err(HexError::Length {
            expected: out.len() * 2,
            got: hex.len(),
        });
    }
    for (byte, pair) in out.iter_mut().zip(hex.as_bytes().chunks_exact(2)) {
        let digit = |b: u8| {
            (b as char)
                .to_digit(16)
                .map(|d| d as u8)
                .ok_or(HexError::InvalidDigit(b as char))
        };
        *byte = (digit(pair[0])? << 4) | digit(pair[1])?;
    }
    Ok(())
}

/// Encodes `value` the way the server expects it on the wire: the bytes
/// the value has in target memory, in memory order, as lowercase hex.
pub fn encode_value(value: u64, width: RegisterWidth, endianness: Endianness) -> String {
    let mut raw = [0u8; 8];
    let bytes = width.bytes();
    match endianness {
        Endianness::Little => raw[..bytes].copy_from_slice(&value.to_le_bytes()[..bytes]),
        Endianness::Big => raw[..bytes].copy_from_slice(&value.to_be_bytes()[8 - bytes..]),
    }
    encode_bytes(&raw[..bytes])
}

/// Decodes a wire hex string back into a register value.
pub fn decode_value(
    hex: &str,
    width: RegisterWidth,
    endianness: Endianness,
) -> Result<u64, HexError> {
    let bytes = width.bytes();
    let mut raw = [0u8; 8];
    decode_bytes(hex, &mut raw[..bytes])?;
    Ok(match endianness {
        Endianness::Little => u64::from_le_bytes(raw),
        Endianness::Big => u64::from_be_bytes(raw) >> (8 * (8 - bytes)),
    })
}

/// Where one numbered CPU register of a suspended thread is saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackedRegister {
    /// Register number in the server's indexing scheme.
    pub index: u32,
    /// Byte offset of the saved value inside the thread's register context.
    pub offset: u32,
    /// Width of the saved value.
    pub width: RegisterWidth,
}

/// The saved-context layout of one thread flavor.
///
/// `bank_size` is the number of registers the server expects in a full
/// register list; registers the RTOS port does not stack are simply absent
/// from `stacked` and get delegated back to the server at query time.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegisterLayout {
    /// Number of registers in the server's register bank for this core.
    pub bank_size: u32,
    /// Saved locations, one per register the port stacks.
    pub stacked: &'static [StackedRegister],
}

impl RegisterLayout {
    /// The saved location of register `index`, if the port stacks it.
    pub fn stacked_register(&self, index: u32) -> Option<&StackedRegister> {
        self.stacked.iter().find(|reg| reg.index == index)
    }

    /// Whether every register of the bank has a saved location, which is
    /// what serving a full register list from memory requires.
    pub fn covers_full_bank(&self) -> bool {
        (0..self.bank_size).all(|index| self.stacked_register(index).is_some())
    }
}

/// Outcome of a register request against the thread snapshot.
///
/// `Cpu` is a capability response, not a failure: it tells the server to
/// read or write the register on the live CPU itself. Keeping it apart
/// from the error path preserves a distinction the C return convention
/// collapses into "negative".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterAccess<T> {
    /// Served from the thread's saved context.
    Value(T),
    /// The server must access the live CPU register instead.
    Cpu,
}

impl<T> RegisterAccess<T> {
    /// The served value, if there is one.
    pub fn value(self) -> Option<T> {
        match self {
            RegisterAccess::Value(value) => Some(value),
            RegisterAccess::Cpu => None,
        }
    }
}
