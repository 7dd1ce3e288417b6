// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/constraint.rs

// Slot constraint records, shared by content and counted by use.

// <>

use super::core::Value;
use super::types::{TypeCode, TypeSet};
use super::Env;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstraintId(pub(crate) u32);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConstraintRecord {
    pub any_allowed: bool,
    pub allowed: TypeSet,
    /// Field count bounds, applied to multifield values
    pub min_fields: i64,
    pub max_fields: Option<i64>,
}

impl Default for ConstraintRecord {
    fn default() -> Self {
        Self {
            any_allowed: true,
            allowed: TypeSet::EMPTY,
            min_fields: 0,
            max_fields: None,
        }
    }
}

impl ConstraintRecord {
    pub fn of_types(codes: &[TypeCode]) -> Self {
        Self {
            any_allowed: false,
            allowed: TypeSet::of(codes),
            ..Default::default()
        }
    }

    pub fn with_fields(self, min: i64, max: Option<i64>) -> Self {
        Self {
            min_fields: min,
            max_fields: max,
            ..self
        }
    }

    fn type_ok(&self, code: TypeCode) -> bool {
        self.any_allowed || self.allowed.contains(code)
    }
}

struct Entry {
    record: ConstraintRecord,
    count: u32,
    loaded: bool,
}

#[derive(Default)]
pub struct ConstraintTable {
    entries: Vec<Option<Entry>>,
    /// First index of the block read from a binary image
    loaded_base: Option<usize>,
}

impl ConstraintTable {
    /// Returns the ID of an equal record, or stores a new one; either
    /// way the record gains one user
    pub fn add(&mut self, record: ConstraintRecord) -> ConstraintId {
        let found = self.entries.iter().position(|e| {
            e.as_ref()
                .is_some_and(|e| !e.loaded && e.record == record)
        });
        let index = match found {
            Some(i) => i,
            None => {
                self.entries.push(Some(Entry {
                    record,
                    count: 0,
                    loaded: false,
                }));
                self.entries.len() - 1
            }
        };
        if let Some(Some(e)) = self.entries.get_mut(index) {
            e.count += 1;
        }
        ConstraintId(index as u32)
    }

    /// Drops one user; unused records defined at run time are freed
    pub fn release(&mut self, id: ConstraintId) {
        let slot = self.entries.get_mut(id.0 as usize);
        if let Some(entry) = slot {
            if let Some(e) = entry.as_mut() {
                e.count = e.count.saturating_sub(1);
                if e.count == 0 && !e.loaded {
                    *entry = None;
                }
            }
        }
    }

    pub fn retain(&mut self, id: ConstraintId) {
        if let Some(Some(e)) = self.entries.get_mut(id.0 as usize) {
            e.count += 1;
        }
    }

    pub fn get(&self, id: ConstraintId) -> Option<&ConstraintRecord> {
        self.entries
            .get(id.0 as usize)
            .and_then(|e| e.as_ref())
            .map(|e| &e.record)
    }

    pub fn count(&self, id: ConstraintId) -> u32 {
        self.entries
            .get(id.0 as usize)
            .and_then(|e| e.as_ref())
            .map_or(0, |e| e.count)
    }

    /// Starts the block of loaded records, returning its base
    pub(crate) fn begin_loaded(&mut self) -> usize {
        let base = self.entries.len();
        self.loaded_base = Some(base);
        base
    }

    pub(crate) fn push_loaded(&mut self, record: ConstraintRecord) -> ConstraintId {
        self.entries.push(Some(Entry {
            record,
            count: 0,
            loaded: true,
        }));
        ConstraintId((self.entries.len() - 1) as u32)
    }

    /// ID of the `index`th record of the loaded block
    pub(crate) fn loaded_id(&self, index: i64) -> Option<ConstraintId> {
        let i = self.loaded_base?.checked_add(usize::try_from(index).ok()?)?;
        match self.entries.get(i) {
            Some(Some(e)) if e.loaded => Some(ConstraintId(i as u32)),
            _ => None,
        }
    }

    /// Frees the loaded block; records added at run time stay put
    pub(crate) fn clear_loaded(&mut self) {
        if self.loaded_base.take().is_some() {
            for entry in &mut self.entries {
                if entry.as_ref().is_some_and(|e| e.loaded) {
                    *entry = None;
                }
            }
            while matches!(self.entries.last(), Some(None)) {
                self.entries.pop();
            }
        }
    }

    /// Live records, in index order
    pub fn iter(&self) -> impl Iterator<Item = (ConstraintId, &ConstraintRecord)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.as_ref().map(|e| (ConstraintId(i as u32), &e.record))
        })
    }
}

impl Env {
    pub fn add_constraint(&mut self, record: ConstraintRecord) -> ConstraintId {
        self.constraints.add(record)
    }

    pub fn constraint(&self, id: ConstraintId) -> Option<&ConstraintRecord> {
        self.constraints.get(id)
    }

    /// Whether `value` satisfies a constraint; multifields are checked
    /// for cardinality and field by field
    pub fn satisfies_constraint(&self, record: &ConstraintRecord, value: Value) -> bool {
        match self.multifield_fields(value) {
            Some(fields) => {
                let n = fields.len() as i64;
                if n < record.min_fields || record.max_fields.is_some_and(|max| n > max) {
                    return false;
                }
                fields.iter().all(|f| record.type_ok(f.type_code()))
            }
            None => record.type_ok(value.type_code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_shared() {
        let mut table = ConstraintTable::default();
        let a = table.add(ConstraintRecord::of_types(&[TypeCode::INTEGER]));
        let b = table.add(ConstraintRecord::of_types(&[TypeCode::INTEGER]));
        let c = table.add(ConstraintRecord::default());

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.count(a), 2);

        table.release(a);
        assert!(table.get(a).is_some());
        table.release(a);
        assert!(table.get(a).is_none());
    }

    #[test]
    fn loaded_block_clears() {
        let mut table = ConstraintTable::default();
        let kept = table.add(ConstraintRecord::default());
        table.begin_loaded();
        let loaded = table.push_loaded(ConstraintRecord::of_types(&[TypeCode::SYMBOL]));
        table.retain(loaded);
        table.release(loaded);
        assert!(table.get(loaded).is_some());

        table.clear_loaded();
        assert!(table.get(loaded).is_none());
        assert!(table.get(kept).is_some());
    }

    #[test]
    fn checks_types_and_cardinality() {
        let mut env = Env::new();
        let ints = ConstraintRecord::of_types(&[TypeCode::INTEGER]).with_fields(1, Some(2));
        let one = env.integer(1);
        let sym = env.symbol("s");

        assert!(env.satisfies_constraint(&ints, one));
        assert!(!env.satisfies_constraint(&ints, sym));

        let empty = env.create_multifield(vec![]);
        let pair = env.create_multifield(vec![one, one]);
        let mixed = env.create_multifield(vec![one, sym]);
        assert!(!env.satisfies_constraint(&ints, empty));
        assert!(env.satisfies_constraint(&ints, pair));
        assert!(!env.satisfies_constraint(&ints, mixed));
        assert!(env.satisfies_constraint(&ConstraintRecord::default(), mixed));
    }
}
