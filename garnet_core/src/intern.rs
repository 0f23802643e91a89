//! Symbol interning for O(1) symbol equality and reduced memory usage.
//!
//! This module provides an interner that stores unique copies of symbol
//! names and returns lightweight handles. Interned symbols can be compared
//! by pointer equality, making selector dispatch and name lookup fast.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

/// A handle to an interned symbol.
///
/// `Symbol` is a thin wrapper around an `Arc<str>` that provides O(1)
/// equality comparison via pointer comparison. Two `Symbol`s are equal if
/// and only if they were produced by the same interner from the same name,
/// which the global [`intern`] entry point guarantees.
#[derive(Clone)]
pub struct Symbol {
    inner: Arc<str>,
}

impl Symbol {
    #[inline]
    fn new(s: Arc<str>) -> Self {
        Self { inner: s }
    }

    /// Get the symbol name.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Get the length of the name in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if the name is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    fn ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }
}

impl PartialEq for Symbol {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        // Pointer comparison for O(1) equality
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash the pointer for consistency with Eq
        self.ptr().hash(state);
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Symbol {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// An interner mapping symbol names to unique [`Symbol`] handles.
///
/// The interner deduplicates names: interning the same string twice
/// returns handles that share storage and compare equal by pointer.
pub struct SymbolInterner {
    map: RwLock<FxHashMap<Arc<str>, Symbol>>,
}

impl SymbolInterner {
    /// Create an empty interner.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: RwLock::new(FxHashMap::default()),
        }
    }

    /// Intern a name, returning its unique handle.
    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(sym) = self.map.read().get(name) {
            return sym.clone();
        }
        let mut map = self.map.write();
        // Re-check under the write lock: another thread may have interned
        // the name between the read and write acquisitions.
        if let Some(sym) = map.get(name) {
            return sym.clone();
        }
        let arc: Arc<str> = Arc::from(name);
        let sym = Symbol::new(Arc::clone(&arc));
        map.insert(arc, sym.clone());
        sym
    }

    /// Number of distinct symbols interned so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Check whether the interner is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl Default for SymbolInterner {
    fn default() -> Self {
        Self::new()
    }
}

fn global_interner() -> &'static SymbolInterner {
    static INTERNER: OnceLock<SymbolInterner> = OnceLock::new();
    INTERNER.get_or_init(SymbolInterner::new)
}

/// Intern a name in the process-wide interner.
///
/// All symbols that flow through instruction operands, method tables and
/// global tables go through this entry point so that pointer equality
/// holds everywhere.
#[must_use]
pub fn intern(name: &str) -> Symbol {
    global_interner().intern(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_deduplicates() {
        let a = intern("length");
        let b = intern("length");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "length");
    }

    #[test]
    fn test_distinct_names_differ() {
        let a = intern("foo");
        let b = intern("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn test_local_interner() {
        let interner = SymbolInterner::new();
        let a = interner.intern("x");
        let b = interner.intern("x");
        assert_eq!(a, b);
        assert_eq!(interner.len(), 1);
        interner.intern("y");
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_symbol_in_hash_map() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(intern("key"), 1);
        assert_eq!(map.get(&intern("key")), Some(&1));
        assert_eq!(map.get(&intern("other")), None);
    }

    #[test]
    fn test_display_and_debug() {
        let sym = intern("upcase");
        assert_eq!(sym.to_string(), "upcase");
        assert_eq!(format!("{:?}", sym), ":upcase");
    }
}
