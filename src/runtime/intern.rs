//! String interning for property names
//!
//! Property keys are interned once by the program builder; the VM starts from a
//! clone of the program's table, so atoms baked into bytecode and compiled
//! units resolve identically at run time.

use string_interner::{DefaultStringInterner, DefaultSymbol};

/// Interned property key
pub type Atom = DefaultSymbol;

/// Interning table for property names
#[derive(Debug, Clone)]
pub struct AtomTable {
    interner: DefaultStringInterner,
    well_known: WellKnown,
}

/// Property names the engine itself consults
#[derive(Debug, Clone, Copy)]
pub struct WellKnown {
    pub prototype: Atom,
    pub constructor: Atom,
    pub length: Atom,
    pub name: Atom,
    pub message: Atom,
    pub stack: Atom,
    pub value: Atom,
    pub get: Atom,
    pub set: Atom,
    pub writable: Atom,
    pub enumerable: Atom,
    pub configurable: Atom,
}

impl AtomTable {
    /// Create a table seeded with the well-known names
    pub fn new() -> Self {
        let mut interner = DefaultStringInterner::default();
        let well_known = WellKnown {
            prototype: interner.get_or_intern("prototype"),
            constructor: interner.get_or_intern("constructor"),
            length: interner.get_or_intern("length"),
            name: interner.get_or_intern("name"),
            message: interner.get_or_intern("message"),
            stack: interner.get_or_intern("stack"),
            value: interner.get_or_intern("value"),
            get: interner.get_or_intern("get"),
            set: interner.get_or_intern("set"),
            writable: interner.get_or_intern("writable"),
            enumerable: interner.get_or_intern("enumerable"),
            configurable: interner.get_or_intern("configurable"),
        };
        Self {
            interner,
            well_known,
        }
    }

    /// Intern a string, returning its atom
    #[inline]
    pub fn intern(&mut self, s: &str) -> Atom {
        self.interner.get_or_intern(s)
    }

    /// Look up an atom without interning
    #[inline]
    pub fn get(&self, s: &str) -> Option<Atom> {
        self.interner.get(s)
    }

    /// Resolve an atom back to its string
    pub fn resolve(&self, atom: Atom) -> &str {
        self.interner.resolve(atom).unwrap_or("<unknown>")
    }

    /// The pre-seeded names
    #[inline]
    pub fn well_known(&self) -> WellKnown {
        self.well_known
    }

    /// Number of interned names
    pub fn len(&self) -> usize {
        self.interner.len()
    }

    /// Whether no names are interned
    pub fn is_empty(&self) -> bool {
        self.interner.is_empty()
    }
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut table = AtomTable::new();
        let a = table.intern("x");
        let b = table.intern("x");
        assert_eq!(a, b);
        assert_eq!(table.resolve(a), "x");
    }

    #[test]
    fn test_clone_preserves_atoms() {
        let mut table = AtomTable::new();
        let x = table.intern("x");
        let mut copy = table.clone();
        assert_eq!(copy.intern("x"), x);
        let y = copy.intern("y");
        assert_eq!(copy.resolve(y), "y");
        assert_eq!(table.get("y"), None);
    }

    #[test]
    fn test_well_known_names() {
        let table = AtomTable::new();
        let wk = table.well_known();
        assert_eq!(table.resolve(wk.prototype), "prototype");
        assert_eq!(table.resolve(wk.configurable), "configurable");
        assert_eq!(table.get("length"), Some(wk.length));
    }
}
