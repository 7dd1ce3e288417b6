// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/symtab.rs

// Tables to intern atoms (symbols, strings, instance names, numbers,
// external addresses) under efficient internal IDs, each carrying a
// busy count.

// <>

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntegerId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FloatId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternalId(pub(crate) u32);

/// Lexical flavor of an interned name; each kind is a separate
/// namespace within the shared symbol table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Symbol,
    String,
    InstanceName,
}

impl SymbolKind {
    pub fn to_byte(self) -> u8 {
        match self {
            SymbolKind::Symbol => 0,
            SymbolKind::String => 1,
            SymbolKind::InstanceName => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(SymbolKind::Symbol),
            1 => Some(SymbolKind::String),
            2 => Some(SymbolKind::InstanceName),
            _ => None,
        }
    }
}

struct Entry<K> {
    key: K,
    count: u32,
    permanent: bool,
}

/// Interning table mapping keys to dense IDs
///
/// IDs of reclaimed entries are reused, so a holder must keep an
/// entry installed for as long as it keeps the ID
pub struct AtomTable<K> {
    entries: Vec<Option<Entry<K>>>,
    index: HashMap<K, u32>,
    free: Vec<u32>,
}

impl<K: Eq + Hash + Clone> Default for AtomTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> AtomTable<K> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
        }
    }

    /// Returns the ID for a key, interning it with a zero count if new
    pub fn get_id(&mut self, key: K) -> u32 {
        if let Some(id) = self.index.get(&key) {
            return *id;
        }

        let entry = Entry {
            key: key.clone(),
            count: 0,
            permanent: false,
        };

        let id = match self.free.pop() {
            Some(id) => {
                self.entries[id as usize] = Some(entry);
                id
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        };

        self.index.insert(key, id);
        id
    }

    pub fn lookup_by_id(&self, id: u32) -> Option<&K> {
        self.entry(id).map(|e| &e.key)
    }

    pub fn lookup_by_name(&self, key: &K) -> Option<u32> {
        self.index.get(key).copied()
    }

    pub fn count(&self, id: u32) -> u32 {
        self.entry(id).map_or(0, |e| e.count)
    }

    pub fn is_permanent(&self, id: u32) -> bool {
        self.entry(id).is_some_and(|e| e.permanent)
    }

    /// Keeps an entry alive regardless of its count
    pub fn make_permanent(&mut self, id: u32) {
        if let Some(Some(e)) = self.entries.get_mut(id as usize) {
            e.permanent = true;
        }
    }

    pub fn increment(&mut self, id: u32) -> bool {
        match self.entries.get_mut(id as usize) {
            Some(Some(e)) => {
                e.count += 1;
                true
            }
            _ => false,
        }
    }

    /// Fails on a missing entry or a count already at zero
    pub fn decrement(&mut self, id: u32) -> bool {
        match self.entries.get_mut(id as usize) {
            Some(Some(e)) if e.count > 0 => {
                e.count -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entry(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Live entries as (id, key, count)
    pub fn iter(&self) -> impl Iterator<Item = (u32, &K, u32)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i as u32, &e.key, e.count)))
    }

    /// Removes every non-permanent entry whose count is zero,
    /// returning the IDs and keys removed
    pub fn sweep(&mut self) -> Vec<(u32, K)> {
        let mut gone = Vec::new();
        for (i, slot) in self.entries.iter_mut().enumerate() {
            let dead = slot.as_ref().is_some_and(|e| e.count == 0 && !e.permanent);
            if dead {
                if let Some(e) = slot.take() {
                    self.index.remove(&e.key);
                    self.free.push(i as u32);
                    gone.push((i as u32, e.key));
                }
            }
        }
        gone
    }

    fn entry(&self, id: u32) -> Option<&Entry<K>> {
        self.entries.get(id as usize).and_then(|e| e.as_ref())
    }
}

/// Key for an external address: its type index and pointer identity
pub type ExternalKey = (u16, usize);

/// External addresses, interned by pointer identity
#[derive(Default)]
pub struct ExternalTable {
    table: AtomTable<ExternalKey>,
    data: Vec<Option<Rc<dyn Any>>>,
}

impl ExternalTable {
    pub fn get_id(&mut self, kind: u16, data: Rc<dyn Any>) -> ExternalId {
        let key = (kind, Rc::as_ptr(&data) as *const () as usize);
        let id = self.table.get_id(key);
        let slot = id as usize;
        if self.data.len() <= slot {
            self.data.resize_with(slot + 1, || None);
        }
        if self.data[slot].is_none() {
            self.data[slot] = Some(data);
        }
        ExternalId(id)
    }

    pub fn kind(&self, id: ExternalId) -> Option<u16> {
        self.table.lookup_by_id(id.0).map(|k| k.0)
    }

    pub fn data(&self, id: ExternalId) -> Option<Rc<dyn Any>> {
        self.data.get(id.0 as usize).cloned().flatten()
    }

    pub fn table(&self) -> &AtomTable<ExternalKey> {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut AtomTable<ExternalKey> {
        &mut self.table
    }

    /// Removes idle addresses, returning their type and data so
    /// discard callbacks may run
    pub fn sweep(&mut self) -> Vec<(u16, Rc<dyn Any>)> {
        let mut gone = Vec::new();
        for (id, (kind, _)) in self.table.sweep() {
            if let Some(data) = self.data.get_mut(id as usize).and_then(|d| d.take()) {
                gone.push((kind, data));
            }
        }
        gone
    }
}

/// All atom tables of an environment
#[derive(Default)]
pub struct Atoms {
    pub symbols: AtomTable<(SymbolKind, String)>,
    pub integers: AtomTable<i64>,
    pub floats: AtomTable<u64>,
    pub externals: ExternalTable,
}

impl Atoms {
    pub fn symbol_id(&mut self, kind: SymbolKind, name: &str) -> SymbolId {
        SymbolId(self.symbols.get_id((kind, name.to_string())))
    }

    pub fn find_symbol(&self, kind: SymbolKind, name: &str) -> Option<SymbolId> {
        self.symbols
            .lookup_by_name(&(kind, name.to_string()))
            .map(SymbolId)
    }

    pub fn symbol_text(&self, id: SymbolId) -> Option<&str> {
        self.symbols.lookup_by_id(id.0).map(|(_, s)| s.as_str())
    }

    pub fn symbol_kind(&self, id: SymbolId) -> Option<SymbolKind> {
        self.symbols.lookup_by_id(id.0).map(|(k, _)| *k)
    }

    pub fn integer_id(&mut self, n: i64) -> IntegerId {
        IntegerId(self.integers.get_id(n))
    }

    pub fn integer(&self, id: IntegerId) -> Option<i64> {
        self.integers.lookup_by_id(id.0).copied()
    }

    pub fn float_id(&mut self, x: f64) -> FloatId {
        FloatId(self.floats.get_id(x.to_bits()))
    }

    pub fn float(&self, id: FloatId) -> Option<f64> {
        self.floats.lookup_by_id(id.0).map(|b| f64::from_bits(*b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mut atoms = Atoms::default();
        let a = atoms.symbol_id(SymbolKind::Symbol, "alpha");
        let b = atoms.symbol_id(SymbolKind::Symbol, "alpha");
        let s = atoms.symbol_id(SymbolKind::String, "alpha");

        assert_eq!(a, b);
        assert_ne!(a, s);
        assert_eq!(atoms.symbol_text(a), Some("alpha"));
        assert_eq!(atoms.symbol_kind(s), Some(SymbolKind::String));
        assert_eq!(atoms.find_symbol(SymbolKind::InstanceName, "alpha"), None);
    }

    #[test]
    fn counts_and_sweep() {
        let mut table: AtomTable<i64> = AtomTable::new();
        let one = table.get_id(1);
        let two = table.get_id(2);

        assert!(table.increment(one));
        assert_eq!(table.count(one), 1);
        assert!(!table.decrement(two));

        let gone = table.sweep();
        assert_eq!(gone, vec![(two, 2)]);
        assert!(table.contains(one));
        assert!(!table.contains(two));

        // freed IDs are reused
        let three = table.get_id(3);
        assert_eq!(three, two);
    }

    #[test]
    fn permanent_entries_survive() {
        let mut table: AtomTable<i64> = AtomTable::new();
        let id = table.get_id(7);
        table.make_permanent(id);
        assert!(table.sweep().is_empty());
        assert_eq!(table.lookup_by_id(id), Some(&7));
    }

    #[test]
    fn externals_by_identity() {
        let mut ext = ExternalTable::default();
        let data: Rc<dyn Any> = Rc::new(5u32);
        let a = ext.get_id(0, data.clone());
        let b = ext.get_id(0, data.clone());
        let c = ext.get_id(0, Rc::new(5u32));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ext.kind(a), Some(0));

        ext.table_mut().increment(a.0);
        let gone = ext.sweep();
        assert_eq!(gone.len(), 1);
        assert!(ext.data(a).is_some());
        assert!(ext.data(c).is_none());
    }
}
