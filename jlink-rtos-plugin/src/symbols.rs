//! The RTOS symbol table and its resolver.
//!
//! A plug-in declares, at compile time, the kernel symbols it needs to walk
//! thread control data. The GDB server resolves all of them once per target
//! connection, writing the addresses straight into the table the plug-in
//! returned from `RTOS_GetSymbols`. After that the table is only ever
//! searched, never modified, by this side.

use std::cell::UnsafeCell;
use std::marker::PhantomData;

use crate::api::{SymbolEntry, TargetAddress};

/// A null-name-terminated RTOS symbol table.
///
/// Declare one with the [`symbol_table!`](crate::symbol_table) macro:
///
/// ```
/// use jlink_rtos_plugin::{symbol_table, symbols::SymbolTable};
///
/// static SYMBOLS: SymbolTable<3> = symbol_table! {
///     mandatory "OS_Global",
///     optional "OS_TickCnt",
/// };
/// ```
///
/// The const parameter counts the entries including the sentinel. The host
/// writes resolved addresses into the table in place, which is why the
/// entries live in an [`UnsafeCell`]; the host's call contract (one call at
/// a time, from one thread) makes this sound.
pub struct SymbolTable<const N: usize> {
    entries: UnsafeCell<[SymbolEntry; N]>,
}

// SAFETY: the GDB server invokes plug-in entry points strictly sequentially
// from a single thread, and the table is not otherwise reachable.
unsafe impl<const N: usize> Sync for SymbolTable<N> {}

impl<const N: usize> SymbolTable<N> {
    /// Builds a table from entries whose last element must be the sentinel.
    pub const fn new(entries: [SymbolEntry; N]) -> Self {
        assert!(N > 0, "a symbol table carries at least the sentinel");
        assert!(
            entries[N - 1].name.is_null(),
            "symbol tables must be terminated by the null-name sentinel"
        );
        Self {
            entries: UnsafeCell::new(entries),
        }
    }

    /// Pointer handed to the GDB server from `RTOS_GetSymbols`.
    ///
    /// Ownership stays with the plug-in; the server only reads the names and
    /// writes resolved addresses back into the entries.
    pub fn as_mut_ptr(&self) -> *mut SymbolEntry {
        self.entries.get().cast::<SymbolEntry>()
    }

    /// Number of entries, excluding the sentinel.
    pub const fn len(&self) -> usize {
        N - 1
    }

    /// Whether the table holds no real entries.
    pub const fn is_empty(&self) -> bool {
        N == 1
    }

    /// A borrowed, size-erased view of this table.
    pub fn as_ref(&self) -> SymbolsRef<'_> {
        SymbolsRef {
            head: self.entries.get().cast::<SymbolEntry>(),
            _table: PhantomData,
        }
    }
}

/// Borrowed view of a [`SymbolTable`] with the entry count erased.
///
/// This is what [`Backend`](crate::backend::Backend) carries around; the
/// table end is found by scanning for the sentinel, exactly the way the
/// server consumes the table.
#[derive(Clone, Copy)]
pub struct SymbolsRef<'t> {
    head: *const SymbolEntry,
    _table: PhantomData<&'t ()>,
}

impl<'t> SymbolsRef<'t> {
    /// Address of `name`, or 0 if the table has no such symbol or the
    /// server could not resolve it.
    ///
    /// First exact, case-sensitive match wins. An address of 0 for a symbol
    /// marked optional is an expected outcome the caller must handle; for a
    /// mandatory symbol the server's own gate keeps the plug-in from ever
    /// running with it unresolved.
    pub fn address_of(&self, name: &str) -> TargetAddress {
        self.find(name).map(|entry| entry.address).unwrap_or(0)
    }

    /// The entry for `name`, if the table has one.
    pub fn find(&self, name: &str) -> Option<SymbolEntry> {
        self.iter().find(|entry| {
            entry
                .name()
                .is_some_and(|n| n.to_bytes() == name.as_bytes())
        })
    }

    /// Iterates over the real entries, stopping before the sentinel.
    pub fn iter(&self) -> impl Iterator<Item = SymbolEntry> + 't {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            // SAFETY: `head` points into a live table and the sentinel is
            // guaranteed by `SymbolTable::new`, so the scan stays in bounds.
            let entry = unsafe { *cursor };
            if entry.is_sentinel() {
                None
            } else {
                cursor = unsafe { cursor.add(1) };
                Some(entry)
            }
        })
    }

    /// Raw pointer to the first entry.
    pub fn as_ptr(&self) -> *const SymbolEntry {
        self.head
    }
}

/// Declares a `static` [`SymbolTable`], appending the NUL terminators and
/// the table sentinel.
///
/// Each entry is either `mandatory "name"` or `optional "name"`; the const
/// parameter of the table type is the number of entries plus one for the
/// sentinel.
#[macro_export]
macro_rules! symbol_table {
    ($($kind:ident $name:literal),* $(,)?) => {
        $crate::symbols::SymbolTable::new([
            $($crate::api::SymbolEntry::$kind(concat!($name, "\0")),)*
            $crate::api::SymbolEntry::SENTINEL,
        ])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    static TABLE: SymbolTable<4> = symbol_table! {
        mandatory "OS_Global",
        mandatory "OS_Global",
        optional "OS_TickCnt",
    };

    fn resolve(table: &SymbolTable<4>, addresses: &[TargetAddress]) {
        // The server writes addresses into the table in place; do the same.
        let ptr = table.as_mut_ptr();
        for (i, addr) in addresses.iter().enumerate() {
            unsafe { (*ptr.add(i)).address = *addr };
        }
    }

    #[test]
    fn lookup_is_first_match_and_zero_on_miss() {
        resolve(&TABLE, &[0x2000_0000, 0x2000_1000, 0x2000_2000]);

        let symbols = TABLE.as_ref();
        // The duplicated name resolves to the first entry.
        assert_eq!(symbols.address_of("OS_Global"), 0x2000_0000);
        assert_eq!(symbols.address_of("OS_TickCnt"), 0x2000_2000);
        assert_eq!(symbols.address_of("OS_NoSuchSymbol"), 0);
        // Case-sensitive comparison.
        assert_eq!(symbols.address_of("os_global"), 0);
    }

    #[test]
    fn all_zero_table_is_tolerated() {
        static EMPTY: SymbolTable<2> = symbol_table! {
            optional "OS_NotExported",
        };
        assert_eq!(EMPTY.as_ref().address_of("OS_NotExported"), 0);
        assert_eq!(EMPTY.len(), 1);
    }

    #[test]
    fn optional_flag_is_visible_to_callers() {
        let entry = TABLE.as_ref().find("OS_TickCnt").unwrap();
        assert!(entry.is_optional());
        let entry = TABLE.as_ref().find("OS_Global").unwrap();
        assert!(!entry.is_optional());
    }
}
