// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/core.rs

// The value representation shared by the evaluator, the dispatcher,
// and the loader: a tagged union of atom handles, multifield segment
// storage, constructors, accessors, and busy count maintenance.

// <>

use super::class::{ClassId, InstanceId};
use super::symtab::{ExternalId, FloatId, IntegerId, SymbolId, SymbolKind};
use super::types::TypeCode;
use super::Env;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MultifieldId(pub(crate) u32);

/// Half-open view `[begin, end)` into a multifield's fields
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Segment {
    pub multifield: MultifieldId,
    pub begin: usize,
    pub end: usize,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A rule engine value
///
/// Values hold handles into the environment's tables and own nothing;
/// anything that keeps a value beyond the current evaluation step must
/// install it (see `Env::install_value`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Float(FloatId),
    Integer(IntegerId),
    Symbol(SymbolId),
    String(SymbolId),
    InstanceName(SymbolId),
    Multifield(Segment),
    ExternalAddress(ExternalId),
    FactAddress(u32),
    InstanceAddress(InstanceId),
    Class(ClassId),
    Void,
}

impl Value {
    pub fn type_code(&self) -> TypeCode {
        match self {
            Value::Float(_) => TypeCode::FLOAT,
            Value::Integer(_) => TypeCode::INTEGER,
            Value::Symbol(_) => TypeCode::SYMBOL,
            Value::String(_) => TypeCode::STRING,
            Value::InstanceName(_) => TypeCode::INSTANCE_NAME,
            Value::Multifield(_) => TypeCode::MULTIFIELD,
            Value::ExternalAddress(_) => TypeCode::EXTERNAL_ADDRESS,
            Value::FactAddress(_) => TypeCode::FACT_ADDRESS,
            Value::InstanceAddress(_) => TypeCode::INSTANCE_ADDRESS,
            Value::Class(_) => TypeCode::DEFCLASS_PTR,
            Value::Void => TypeCode::VOID,
        }
    }
}

pub struct Multifield {
    fields: Vec<Value>,
    busy: u32,
}

impl Multifield {
    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn busy(&self) -> u32 {
        self.busy
    }
}

/// Backing storage for multifield values
#[derive(Default)]
pub struct MultifieldStore {
    slots: Vec<Option<Multifield>>,
    free: Vec<u32>,
}

impl MultifieldStore {
    pub fn create(&mut self, fields: Vec<Value>) -> MultifieldId {
        let mf = Multifield { fields, busy: 0 };
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(mf);
                MultifieldId(id)
            }
            None => {
                self.slots.push(Some(mf));
                MultifieldId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: MultifieldId) -> Option<&Multifield> {
        self.slots.get(id.0 as usize).and_then(|m| m.as_ref())
    }

    fn get_mut(&mut self, id: MultifieldId) -> Option<&mut Multifield> {
        self.slots.get_mut(id.0 as usize).and_then(|m| m.as_mut())
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|m| m.is_some()).count()
    }

    /// Frees every multifield nobody has installed
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.as_ref().is_some_and(|m| m.busy == 0) {
                *slot = None;
                self.free.push(i as u32);
                freed += 1;
            }
        }
        freed
    }
}

impl Env {
    pub fn symbol(&mut self, name: &str) -> Value {
        Value::Symbol(self.atoms.symbol_id(SymbolKind::Symbol, name))
    }

    pub fn string(&mut self, text: &str) -> Value {
        Value::String(self.atoms.symbol_id(SymbolKind::String, text))
    }

    pub fn instance_name(&mut self, name: &str) -> Value {
        Value::InstanceName(self.atoms.symbol_id(SymbolKind::InstanceName, name))
    }

    pub fn integer(&mut self, n: i64) -> Value {
        Value::Integer(self.atoms.integer_id(n))
    }

    pub fn float(&mut self, x: f64) -> Value {
        Value::Float(self.atoms.float_id(x))
    }

    pub fn true_value(&self) -> Value {
        Value::Symbol(self.true_sym)
    }

    pub fn false_value(&self) -> Value {
        Value::Symbol(self.false_sym)
    }

    pub fn nil_value(&self) -> Value {
        Value::Symbol(self.nil_sym)
    }

    pub fn boolean(&self, b: bool) -> Value {
        if b {
            self.true_value()
        } else {
            self.false_value()
        }
    }

    pub fn is_false(&self, value: Value) -> bool {
        value == self.false_value()
    }

    /// Wraps a symbol table ID in the value variant of its kind
    pub fn symbol_value(&self, id: SymbolId) -> Option<Value> {
        Some(match self.atoms.symbol_kind(id)? {
            SymbolKind::Symbol => Value::Symbol(id),
            SymbolKind::String => Value::String(id),
            SymbolKind::InstanceName => Value::InstanceName(id),
        })
    }

    pub fn symbol_text(&self, id: SymbolId) -> Option<&str> {
        self.atoms.symbol_text(id)
    }

    /// Interns a symbol name without creating a value
    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.atoms.symbol_id(SymbolKind::Symbol, name)
    }

    /// Creates an uninstalled multifield spanning all of `fields`
    pub fn create_multifield(&mut self, fields: Vec<Value>) -> Value {
        let end = fields.len();
        let multifield = self.multifields.create(fields);
        Value::Multifield(Segment {
            multifield,
            begin: 0,
            end,
        })
    }

    /// The fields a multifield value's segment covers
    pub fn multifield_fields(&self, value: Value) -> Option<&[Value]> {
        match value {
            Value::Multifield(seg) => self
                .multifields
                .get(seg.multifield)
                .and_then(|m| m.fields.get(seg.begin..seg.end)),
            _ => None,
        }
    }

    pub fn multifield_busy(&self, id: MultifieldId) -> u32 {
        self.multifields.get(id).map_or(0, |m| m.busy)
    }

    pub fn as_integer(&self, value: Value) -> Option<i64> {
        match value {
            Value::Integer(id) => self.atoms.integer(id),
            _ => None,
        }
    }

    pub fn as_float(&self, value: Value) -> Option<f64> {
        match value {
            Value::Float(id) => self.atoms.float(id),
            _ => None,
        }
    }

    pub fn as_number(&self, value: Value) -> Option<f64> {
        match value {
            Value::Integer(id) => self.atoms.integer(id).map(|n| n as f64),
            Value::Float(id) => self.atoms.float(id),
            _ => None,
        }
    }

    /// Text of a symbol, string, or instance name
    pub fn as_text(&self, value: Value) -> Option<&str> {
        match value {
            Value::Symbol(id) | Value::String(id) | Value::InstanceName(id) => {
                self.atoms.symbol_text(id)
            }
            _ => None,
        }
    }

    /// Current busy count of the atom or object a value refers to
    pub fn busy_count(&self, value: Value) -> u32 {
        match value {
            Value::Symbol(id) | Value::String(id) | Value::InstanceName(id) => {
                self.atoms.symbols.count(id.0)
            }
            Value::Integer(id) => self.atoms.integers.count(id.0),
            Value::Float(id) => self.atoms.floats.count(id.0),
            Value::ExternalAddress(id) => self.atoms.externals.table().count(id.0),
            Value::Multifield(seg) => self.multifield_busy(seg.multifield),
            Value::InstanceAddress(id) => self.classes.instance(id).map_or(0, |i| i.busy),
            Value::Class(id) => self.classes.class(id).map_or(0, |c| c.refs),
            Value::FactAddress(_) | Value::Void => 0,
        }
    }

    /// Records one more holder of `value`
    pub fn install_value(&mut self, value: Value) {
        if let Some(entry) = self.primitives.get(value.type_code()) {
            entry.install(self, value);
        }
    }

    /// Drops one holder of `value`
    pub fn deinstall_value(&mut self, value: Value) {
        if let Some(entry) = self.primitives.get(value.type_code()) {
            entry.deinstall(self, value);
        }
    }

    /// Textual rendering through the value's primitive-type entry
    pub fn value_to_string(&self, value: Value) -> String {
        match self.primitives.get(value.type_code()) {
            Some(entry) => entry.print(self, value),
            None => format!("<{:?}>", value.type_code()),
        }
    }

    /// Busy count increment for a single atom or object
    pub(crate) fn retain_atom(&mut self, value: Value) {
        let ok = match value {
            Value::Symbol(id) | Value::String(id) | Value::InstanceName(id) => {
                self.atoms.symbols.increment(id.0)
            }
            Value::Integer(id) => self.atoms.integers.increment(id.0),
            Value::Float(id) => self.atoms.floats.increment(id.0),
            Value::ExternalAddress(id) => self.atoms.externals.table_mut().increment(id.0),
            Value::InstanceAddress(id) => match self.classes.instance_mut(id) {
                Some(ins) => {
                    ins.busy += 1;
                    true
                }
                None => false,
            },
            Value::Class(id) => match self.classes.class_mut(id) {
                Some(c) => {
                    c.refs += 1;
                    true
                }
                None => false,
            },
            Value::Multifield(_) | Value::FactAddress(_) | Value::Void => true,
        };

        if !ok {
            self.system_error("SYMBOL", 2, &format!("install of a freed atom {:?}", value));
        }
        if cfg!(feature = "memdbg") {
            log::trace!("install {:?} -> {}", value, self.busy_count(value));
        }
    }

    /// Busy count decrement; dropping below zero is fatal
    pub(crate) fn release_atom(&mut self, value: Value) {
        let ok = match value {
            Value::Symbol(id) | Value::String(id) | Value::InstanceName(id) => {
                self.atoms.symbols.decrement(id.0)
            }
            Value::Integer(id) => self.atoms.integers.decrement(id.0),
            Value::Float(id) => self.atoms.floats.decrement(id.0),
            Value::ExternalAddress(id) => self.atoms.externals.table_mut().decrement(id.0),
            Value::InstanceAddress(id) => match self.classes.instance_mut(id) {
                Some(ins) if ins.busy > 0 => {
                    ins.busy -= 1;
                    true
                }
                _ => false,
            },
            Value::Class(id) => match self.classes.class_mut(id) {
                Some(c) if c.refs > 0 => {
                    c.refs -= 1;
                    true
                }
                _ => false,
            },
            Value::Multifield(_) | Value::FactAddress(_) | Value::Void => true,
        };

        if !ok {
            self.system_error("SYMBOL", 3, &format!("busy count underflow for {:?}", value));
        }
        if cfg!(feature = "memdbg") {
            log::trace!("deinstall {:?} -> {}", value, self.busy_count(value));
        }
    }

    /// Installs a multifield segment and every field of its backing
    /// array
    pub(crate) fn retain_multifield(&mut self, id: MultifieldId) {
        let fields = match self.multifields.get_mut(id) {
            Some(mf) => {
                mf.busy += 1;
                mf.fields.clone()
            }
            None => self.system_error("MULTIFLD", 1, "install of a freed multifield"),
        };
        for field in fields {
            self.install_value(field);
        }
    }

    pub(crate) fn release_multifield(&mut self, id: MultifieldId) {
        let fields = match self.multifields.get_mut(id) {
            Some(mf) if mf.busy > 0 => {
                mf.busy -= 1;
                mf.fields.clone()
            }
            _ => self.system_error("MULTIFLD", 2, "busy count underflow for multifield"),
        };
        for field in fields {
            self.deinstall_value(field);
        }
    }
}
