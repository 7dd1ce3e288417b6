// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/class.rs

// The object system the message dispatcher runs against: modules,
// classes with linearized precedence lists, message handlers, slots,
// and instances.

// <>

use super::constraint::ConstraintId;
use super::core::Value;
use super::expr::ExprId;
use super::symtab::{SymbolId, SymbolKind};
use super::types::{HandlerRole, TypeCode};
use super::Env;

use std::collections::{HashMap, HashSet};

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) u32);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub(crate) u32);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefineError {
    #[error("cannot define or remove constructs while a binary image is loaded")]
    BloadActive,
    #[error("{0} {1} is in use")]
    InUse(&'static str, String),
    #[error("class {0} has subclasses")]
    HasSubclasses(String),
    #[error("{0} is a system class")]
    SystemClass(String),
    #[error("unknown class")]
    UnknownClass,
    #[error("module {0} already exists")]
    DuplicateModule(String),
    #[error("no message-handler {0} ({1}) in class {2}")]
    UnknownHandler(String, &'static str, String),
    #[error("default value of slot {0} could not be evaluated")]
    SlotDefault(String),
}

pub struct Module {
    pub(crate) name: SymbolId,
    pub(crate) class_head: Option<ClassId>,
    pub(crate) class_tail: Option<ClassId>,
    pub(crate) loaded: bool,
}

pub struct Slot {
    pub(crate) name: SymbolId,
    pub(crate) constraint: Option<ConstraintId>,
    pub(crate) default: Option<ExprId>,
    /// Copied from a superclass, which owns the resources
    pub(crate) inherited: bool,
}

pub struct Handler {
    pub(crate) name: SymbolId,
    pub(crate) role: HandlerRole,
    pub(crate) min_params: u16,
    /// `None` takes any number of extra arguments
    pub(crate) max_params: Option<u16>,
    pub(crate) actions: Option<ExprId>,
    /// Number of live handler links referring to this handler
    pub(crate) busy: u32,
}

pub struct Class {
    pub(crate) name: SymbolId,
    pub(crate) module: ModuleId,
    pub(crate) next: Option<ClassId>,
    pub(crate) system: bool,
    pub(crate) loaded: bool,
    /// Self first, then superclasses from most to least specific
    pub(crate) precedence: Vec<ClassId>,
    pub(crate) slots: Vec<Slot>,
    pub(crate) handlers: Vec<Handler>,
    /// Number of this class's handlers linked into active cores
    pub(crate) busy: u32,
    /// Installed values referring to the class
    pub(crate) refs: u32,
    pub(crate) instances: u32,
}

impl Class {
    pub(crate) fn placeholder(name: SymbolId) -> Self {
        Self {
            name,
            module: ModuleId(0),
            next: None,
            system: false,
            loaded: true,
            precedence: Vec::new(),
            slots: Vec::new(),
            handlers: Vec::new(),
            busy: 0,
            refs: 0,
            instances: 0,
        }
    }
}

pub struct Instance {
    pub(crate) name: SymbolId,
    pub(crate) class: ClassId,
    pub(crate) slots: Vec<Value>,
    pub(crate) garbage: bool,
    pub(crate) busy: u32,
}

/// Slot description for `define_class`
#[derive(Clone, Debug)]
pub struct SlotSpec {
    pub name: String,
    pub constraint: Option<ConstraintId>,
    pub default: Option<ExprId>,
}

impl SlotSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            constraint: None,
            default: None,
        }
    }

    pub fn constraint(self, id: ConstraintId) -> Self {
        Self {
            constraint: Some(id),
            ..self
        }
    }

    pub fn default(self, expr: ExprId) -> Self {
        Self {
            default: Some(expr),
            ..self
        }
    }
}

/// Range of classes created by the current binary image
#[derive(Clone, Copy, Debug)]
pub(crate) struct LoadedClasses {
    pub base: usize,
    pub count: usize,
}

#[derive(Default)]
pub struct ClassSystem {
    classes: Vec<Option<Class>>,
    by_name: HashMap<SymbolId, ClassId>,
    modules: Vec<Option<Module>>,
    pub(crate) current_module: ModuleId,
    instances: Vec<Option<Instance>>,
    instances_by_name: HashMap<SymbolId, InstanceId>,
    primitive_classes: HashMap<TypeCode, ClassId>,
    pub(crate) system_count: usize,
    pub(crate) loaded: Option<LoadedClasses>,
    /// Module of each module record in the loaded image
    pub(crate) loaded_modules: Vec<ModuleId>,
}

impl ClassSystem {
    pub fn class(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.0 as usize).and_then(|c| c.as_ref())
    }

    pub(crate) fn class_mut(&mut self, id: ClassId) -> Option<&mut Class> {
        self.classes.get_mut(id.0 as usize).and_then(|c| c.as_mut())
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(id.0 as usize).and_then(|i| i.as_ref())
    }

    pub(crate) fn instance_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.instances.get_mut(id.0 as usize).and_then(|i| i.as_mut())
    }

    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id.0 as usize).and_then(|m| m.as_ref())
    }

    pub(crate) fn module_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.modules.get_mut(id.0 as usize).and_then(|m| m.as_mut())
    }

    pub(crate) fn module_ids(&self) -> Vec<ModuleId> {
        self.modules
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_some())
            .map(|(i, _)| ModuleId(i as u32))
            .collect()
    }

    pub(crate) fn class_ids(&self) -> Vec<ClassId> {
        self.classes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| ClassId(i as u32))
            .collect()
    }

    pub(crate) fn class_slot_count(&self) -> usize {
        self.classes.len()
    }

    pub(crate) fn push_module(&mut self, module: Module) -> ModuleId {
        self.modules.push(Some(module));
        ModuleId((self.modules.len() - 1) as u32)
    }

    pub(crate) fn remove_module(&mut self, id: ModuleId) -> Option<Module> {
        let module = self.modules.get_mut(id.0 as usize)?.take();
        while matches!(self.modules.last(), Some(None)) {
            self.modules.pop();
        }
        module
    }

    /// Appends placeholder classes for a binary image; returns the base
    pub(crate) fn push_placeholders(&mut self, name: SymbolId, count: usize) -> usize {
        let base = self.classes.len();
        for _ in 0..count {
            self.classes.push(Some(Class::placeholder(name)));
        }
        base
    }

    pub(crate) fn take_class(&mut self, id: ClassId) -> Option<Class> {
        let class = self.classes.get_mut(id.0 as usize)?.take();
        if let Some(c) = &class {
            if self.by_name.get(&c.name) == Some(&id) {
                self.by_name.remove(&c.name);
            }
        }
        while matches!(self.classes.last(), Some(None)) {
            self.classes.pop();
        }
        class
    }

    pub(crate) fn register_name(&mut self, name: SymbolId, id: ClassId) {
        self.by_name.insert(name, id);
    }

    /// Appends a class to its module's class list
    pub(crate) fn link_class(&mut self, id: ClassId) {
        let Some(module_id) = self.class(id).map(|c| c.module) else {
            return;
        };
        let tail = self.module(module_id).and_then(|m| m.class_tail);
        match tail.and_then(|t| self.class_mut(t)) {
            Some(t) => t.next = Some(id),
            None => {
                if let Some(m) = self.module_mut(module_id) {
                    m.class_head = Some(id);
                }
            }
        }
        if let Some(m) = self.module_mut(module_id) {
            m.class_tail = Some(id);
        }
    }

    pub(crate) fn unlink_class(&mut self, id: ClassId) {
        let Some((module_id, next)) = self.class(id).map(|c| (c.module, c.next)) else {
            return;
        };
        let mut prev = None;
        let mut cursor = self.module(module_id).and_then(|m| m.class_head);
        while let Some(c) = cursor {
            if c == id {
                break;
            }
            prev = Some(c);
            cursor = self.class(c).and_then(|c| c.next);
        }
        if cursor.is_none() {
            return;
        }

        match prev.and_then(|p| self.class_mut(p)) {
            Some(p) => p.next = next,
            None => {
                if let Some(m) = self.module_mut(module_id) {
                    m.class_head = next;
                }
            }
        }
        if let Some(m) = self.module_mut(module_id) {
            if m.class_tail == Some(id) {
                m.class_tail = prev;
            }
        }
        if let Some(c) = self.class_mut(id) {
            c.next = None;
        }
    }
}

/// Precedence list of a new class: itself, then the superclasses'
/// lists in order, keeping the last occurrence of any repeat
fn linearize(env: &Env, id: ClassId, supers: &[ClassId]) -> Vec<ClassId> {
    let mut seq = vec![id];
    for s in supers {
        if let Some(c) = env.classes.class(*s) {
            seq.extend(c.precedence.iter().copied());
        }
    }
    let mut seen = HashSet::new();
    let mut out: Vec<ClassId> = seq.into_iter().rev().filter(|c| seen.insert(*c)).collect();
    out.reverse();
    out
}

const SYSTEM_CLASSES: &[(&str, &[&str])] = &[
    ("OBJECT", &[]),
    ("PRIMITIVE", &["OBJECT"]),
    ("NUMBER", &["PRIMITIVE"]),
    ("INTEGER", &["NUMBER"]),
    ("FLOAT", &["NUMBER"]),
    ("LEXEME", &["PRIMITIVE"]),
    ("SYMBOL", &["LEXEME"]),
    ("STRING", &["LEXEME"]),
    ("MULTIFIELD", &["PRIMITIVE"]),
    ("ADDRESS", &["PRIMITIVE"]),
    ("EXTERNAL-ADDRESS", &["ADDRESS"]),
    ("FACT-ADDRESS", &["ADDRESS"]),
    ("INSTANCE", &["PRIMITIVE"]),
    ("INSTANCE-ADDRESS", &["ADDRESS", "INSTANCE"]),
    ("INSTANCE-NAME", &["INSTANCE"]),
    ("USER", &["OBJECT"]),
];

const PRIMITIVE_CLASSES: &[(TypeCode, &str)] = &[
    (TypeCode::FLOAT, "FLOAT"),
    (TypeCode::INTEGER, "INTEGER"),
    (TypeCode::SYMBOL, "SYMBOL"),
    (TypeCode::STRING, "STRING"),
    (TypeCode::MULTIFIELD, "MULTIFIELD"),
    (TypeCode::EXTERNAL_ADDRESS, "EXTERNAL-ADDRESS"),
    (TypeCode::FACT_ADDRESS, "FACT-ADDRESS"),
    (TypeCode::INSTANCE_ADDRESS, "INSTANCE-ADDRESS"),
    (TypeCode::INSTANCE_NAME, "INSTANCE-NAME"),
];

/// Creates module MAIN and the system classes
pub(crate) fn create_system_classes(env: &mut Env) {
    let main = env.intern("MAIN");
    env.install_value(Value::Symbol(main));
    env.classes.push_module(Module {
        name: main,
        class_head: None,
        class_tail: None,
        loaded: false,
    });

    for (name, supers) in SYSTEM_CLASSES {
        let supers: Vec<ClassId> = supers.iter().filter_map(|s| env.find_class(s)).collect();
        let name = env.intern(name);
        env.install_value(Value::Symbol(name));

        let id = ClassId(env.classes.classes.len() as u32);
        let precedence = linearize(env, id, &supers);
        env.classes.classes.push(Some(Class {
            name,
            module: ModuleId(0),
            next: None,
            system: true,
            loaded: false,
            precedence,
            slots: Vec::new(),
            handlers: Vec::new(),
            busy: 0,
            refs: 0,
            instances: 0,
        }));
        env.classes.by_name.insert(name, id);
    }
    env.classes.system_count = env.classes.classes.len();

    for (code, name) in PRIMITIVE_CLASSES {
        if let Some(class) = env.find_class(name) {
            env.classes.primitive_classes.insert(*code, class);
        }
    }
}

impl Env {
    pub fn define_module(&mut self, name: &str) -> Result<ModuleId, DefineError> {
        if self.bload.active {
            return Err(DefineError::BloadActive);
        }
        if self.find_module(name).is_some() {
            return Err(DefineError::DuplicateModule(name.to_string()));
        }
        let sym = self.intern(name);
        self.install_value(Value::Symbol(sym));
        Ok(self.classes.push_module(Module {
            name: sym,
            class_head: None,
            class_tail: None,
            loaded: false,
        }))
    }

    pub fn find_module(&self, name: &str) -> Option<ModuleId> {
        let sym = self.atoms.find_symbol(SymbolKind::Symbol, name)?;
        self.classes
            .module_ids()
            .into_iter()
            .find(|id| self.classes.module(*id).is_some_and(|m| m.name == sym))
    }

    pub fn module_name(&self, id: ModuleId) -> Option<&str> {
        self.symbol_text(self.classes.module(id)?.name)
    }

    pub fn current_module(&self) -> ModuleId {
        self.classes.current_module
    }

    pub fn set_current_module(&mut self, id: ModuleId) -> bool {
        if self.classes.module(id).is_none() {
            return false;
        }
        self.classes.current_module = id;
        true
    }

    /// Classes of a module in definition order
    pub fn module_classes(&self, id: ModuleId) -> Vec<ClassId> {
        let mut out = Vec::new();
        let mut cursor = self.classes.module(id).and_then(|m| m.class_head);
        while let Some(c) = cursor {
            out.push(c);
            cursor = self.classes.class(c).and_then(|c| c.next);
        }
        out
    }

    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        let sym = self.atoms.find_symbol(SymbolKind::Symbol, name)?;
        self.classes.by_name.get(&sym).copied()
    }

    pub fn class_name(&self, id: ClassId) -> Option<&str> {
        self.symbol_text(self.classes.class(id)?.name)
    }

    pub fn class_precedence(&self, id: ClassId) -> Vec<ClassId> {
        self.classes
            .class(id)
            .map(|c| c.precedence.clone())
            .unwrap_or_default()
    }

    pub fn class_busy(&self, id: ClassId) -> u32 {
        self.classes.class(id).map_or(0, |c| c.busy)
    }

    pub fn class_slot_names(&self, id: ClassId) -> Vec<String> {
        self.classes.class(id).map_or_else(Vec::new, |c| {
            c.slots
                .iter()
                .filter_map(|s| self.symbol_text(s.name).map(str::to_string))
                .collect()
        })
    }

    pub fn primitive_class(&self, code: TypeCode) -> Option<ClassId> {
        self.classes.primitive_classes.get(&code).copied()
    }

    pub(crate) fn find_handler(&self, class: ClassId, name: SymbolId, role: HandlerRole) -> Option<usize> {
        self.classes
            .class(class)?
            .handlers
            .iter()
            .position(|h| h.name == name && h.role == role)
    }

    /// Busy count of a handler, if the class defines it
    pub fn handler_busy(&self, class: ClassId, name: &str, role: HandlerRole) -> Option<u32> {
        let sym = self.atoms.find_symbol(SymbolKind::Symbol, name)?;
        let index = self.find_handler(class, sym, role)?;
        self.classes.class(class).map(|c| c.handlers[index].busy)
    }

    /// Defines a class in the current module
    ///
    /// A class with no superclasses inherits from USER. An idle user
    /// class of the same name is replaced
    pub fn define_class(
        &mut self,
        name: &str,
        supers: &[ClassId],
        slots: Vec<SlotSpec>,
    ) -> Result<ClassId, DefineError> {
        if self.bload.active {
            return Err(DefineError::BloadActive);
        }
        if let Some(old) = self.find_class(name) {
            self.undefine_class(old)?;
        }
        if supers.iter().any(|s| self.classes.class(*s).is_none()) {
            return Err(DefineError::UnknownClass);
        }
        let supers = if supers.is_empty() {
            vec![self.find_class("USER").ok_or(DefineError::UnknownClass)?]
        } else {
            supers.to_vec()
        };

        let sym = self.intern(name);
        self.install_value(Value::Symbol(sym));
        let id = ClassId(self.classes.classes.len() as u32);
        let precedence = linearize(self, id, &supers);

        let mut own = Vec::new();
        for spec in slots {
            let slot_name = self.intern(&spec.name);
            self.install_value(Value::Symbol(slot_name));
            if let Some(c) = spec.constraint {
                self.constraints.retain(c);
            }
            if let Some(d) = spec.default {
                self.install_expression(d);
            }
            own.push(Slot {
                name: slot_name,
                constraint: spec.constraint,
                default: spec.default,
                inherited: false,
            });
        }

        // inherited slots follow, most specific superclass first
        for sup in precedence.iter().skip(1) {
            let Some(c) = self.classes.class(*sup) else {
                continue;
            };
            let extra: Vec<Slot> = c
                .slots
                .iter()
                .filter(|s| !s.inherited && !own.iter().any(|o| o.name == s.name))
                .map(|s| Slot {
                    name: s.name,
                    constraint: s.constraint,
                    default: s.default,
                    inherited: true,
                })
                .collect();
            own.extend(extra);
        }

        let module = self.classes.current_module;
        self.classes.classes.push(Some(Class {
            name: sym,
            module,
            next: None,
            system: false,
            loaded: false,
            precedence,
            slots: own,
            handlers: Vec::new(),
            busy: 0,
            refs: 0,
            instances: 0,
        }));
        self.classes.by_name.insert(sym, id);
        self.classes.link_class(id);

        log::debug!("defined class {}", name);
        Ok(id)
    }

    /// Removes an idle user class with no subclasses or instances
    pub fn undefine_class(&mut self, id: ClassId) -> Result<(), DefineError> {
        let class = self.classes.class(id).ok_or(DefineError::UnknownClass)?;
        let name = self.symbol_text(class.name).unwrap_or("").to_string();
        if class.loaded {
            return Err(DefineError::BloadActive);
        }
        if class.system {
            return Err(DefineError::SystemClass(name));
        }
        if class.busy > 0 || class.refs > 0 || class.instances > 0 {
            return Err(DefineError::InUse("defclass", name));
        }
        let has_subclasses = self.classes.class_ids().into_iter().any(|other| {
            other != id
                && self
                    .classes
                    .class(other)
                    .is_some_and(|c| c.precedence.contains(&id))
        });
        if has_subclasses {
            return Err(DefineError::HasSubclasses(name));
        }

        self.classes.unlink_class(id);
        let Some(class) = self.classes.take_class(id) else {
            return Err(DefineError::UnknownClass);
        };

        for handler in class.handlers {
            self.discard_handler(handler);
        }
        for slot in class.slots.into_iter().filter(|s| !s.inherited) {
            self.deinstall_value(Value::Symbol(slot.name));
            if let Some(c) = slot.constraint {
                self.constraints.release(c);
            }
            if let Some(d) = slot.default {
                self.deinstall_expression(d);
                self.release_expression(d);
            }
        }
        self.deinstall_value(Value::Symbol(class.name));

        log::debug!("removed class {}", name);
        Ok(())
    }

    fn discard_handler(&mut self, handler: Handler) {
        self.deinstall_value(Value::Symbol(handler.name));
        if let Some(actions) = handler.actions {
            self.deinstall_expression(actions);
            self.release_expression(actions);
        }
    }

    /// Defines a message handler; `actions` is the head of an action
    /// list and becomes owned by the handler
    pub fn define_handler(
        &mut self,
        class: ClassId,
        name: &str,
        role: HandlerRole,
        min_params: u16,
        max_params: Option<u16>,
        actions: Option<ExprId>,
    ) -> Result<(), DefineError> {
        if self.bload.active {
            return Err(DefineError::BloadActive);
        }
        match self.classes.class(class) {
            None => return Err(DefineError::UnknownClass),
            Some(c) if c.busy > 0 => {
                return Err(DefineError::InUse("defmessage-handler", name.to_string()))
            }
            Some(_) => {}
        }

        let sym = self.intern(name);
        if let Some(index) = self.find_handler(class, sym, role) {
            let old = self.classes.class_mut(class).map(|c| c.handlers.remove(index));
            if let Some(old) = old {
                self.discard_handler(old);
            }
        }

        self.install_value(Value::Symbol(sym));
        if let Some(a) = actions {
            self.install_expression(a);
        }
        if let Some(c) = self.classes.class_mut(class) {
            c.handlers.push(Handler {
                name: sym,
                role,
                min_params,
                max_params,
                actions,
                busy: 0,
            });
        }
        Ok(())
    }

    pub fn undefine_handler(
        &mut self,
        class: ClassId,
        name: &str,
        role: HandlerRole,
    ) -> Result<(), DefineError> {
        if self.bload.active {
            return Err(DefineError::BloadActive);
        }
        let class_name = self.class_name(class).unwrap_or("").to_string();
        let missing = || DefineError::UnknownHandler(name.to_string(), role.name(), class_name.clone());
        let sym = self
            .atoms
            .find_symbol(SymbolKind::Symbol, name)
            .ok_or_else(missing)?;
        let index = self.find_handler(class, sym, role).ok_or_else(missing)?;

        // Active links address handlers by position
        if self.class_busy(class) > 0 {
            return Err(DefineError::InUse("defmessage-handler", name.to_string()));
        }
        let old = self.classes.class_mut(class).map(|c| c.handlers.remove(index));
        if let Some(old) = old {
            self.discard_handler(old);
        }
        Ok(())
    }

    /// Creates an instance, replacing any live instance of that name;
    /// returns its address
    pub fn make_instance(&mut self, name: &str, class: ClassId) -> Result<Value, DefineError> {
        let slots: Vec<(SymbolId, Option<ExprId>)> = match self.classes.class(class) {
            Some(c) if c.system => {
                let n = self.symbol_text(c.name).unwrap_or("").to_string();
                return Err(DefineError::SystemClass(n));
            }
            Some(c) => c.slots.iter().map(|s| (s.name, s.default)).collect(),
            None => return Err(DefineError::UnknownClass),
        };
        if let Some(old) = self.find_instance(name) {
            self.delete_instance(old);
        }

        let mut values = Vec::with_capacity(slots.len());
        for (slot, default) in slots {
            let v = match default {
                Some(expr) => self.evaluate(expr),
                None => self.nil_value(),
            };
            if self.evaluation_error() {
                for v in values {
                    self.deinstall_value(v);
                }
                let slot = self.symbol_text(slot).unwrap_or("").to_string();
                return Err(DefineError::SlotDefault(slot));
            }
            self.install_value(v);
            values.push(v);
        }

        let sym = self.atoms.symbol_id(SymbolKind::InstanceName, name);
        self.install_value(Value::InstanceName(sym));
        self.classes.instances.push(Some(Instance {
            name: sym,
            class,
            slots: values,
            garbage: false,
            busy: 0,
        }));
        let id = InstanceId((self.classes.instances.len() - 1) as u32);
        self.classes.instances_by_name.insert(sym, id);
        if let Some(c) = self.classes.class_mut(class) {
            c.instances += 1;
        }
        Ok(Value::InstanceAddress(id))
    }

    pub fn find_instance(&self, name: &str) -> Option<InstanceId> {
        let sym = self.atoms.find_symbol(SymbolKind::InstanceName, name)?;
        self.classes.instances_by_name.get(&sym).copied()
    }

    pub(crate) fn find_instance_by_symbol(&self, sym: SymbolId) -> Option<InstanceId> {
        self.classes.instances_by_name.get(&sym).copied()
    }

    /// Deleted or freed instances are stale; their addresses must not
    /// be used
    pub fn is_stale(&self, id: InstanceId) -> bool {
        self.classes.instance(id).map_or(true, |i| i.garbage)
    }

    pub fn instance_class(&self, id: InstanceId) -> Option<ClassId> {
        self.classes.instance(id).filter(|i| !i.garbage).map(|i| i.class)
    }

    pub(crate) fn slot_index(&self, class: ClassId, slot: SymbolId) -> Option<usize> {
        self.classes
            .class(class)?
            .slots
            .iter()
            .position(|s| s.name == slot)
    }

    pub fn instance_slot(&self, id: InstanceId, slot: &str) -> Option<Value> {
        let sym = self.atoms.find_symbol(SymbolKind::Symbol, slot)?;
        let ins = self.classes.instance(id).filter(|i| !i.garbage)?;
        let index = self.slot_index(ins.class, sym)?;
        ins.slots.get(index).copied()
    }

    /// Stores a slot value, installing it and releasing the old one
    pub(crate) fn put_instance_slot(&mut self, id: InstanceId, index: usize, value: Value) -> bool {
        self.install_value(value);
        let old = self
            .classes
            .instance_mut(id)
            .and_then(|i| i.slots.get_mut(index))
            .map(|slot| std::mem::replace(slot, value));
        match old {
            Some(old) => {
                self.deinstall_value(old);
                true
            }
            None => {
                self.deinstall_value(value);
                false
            }
        }
    }

    /// Marks an instance deleted; its storage goes once it is idle
    pub fn delete_instance(&mut self, id: InstanceId) -> bool {
        let (class, name, busy) = match self.classes.instance_mut(id) {
            Some(ins) if !ins.garbage => {
                ins.garbage = true;
                (ins.class, ins.name, ins.busy)
            }
            _ => return false,
        };
        if self.classes.instances_by_name.get(&name) == Some(&id) {
            self.classes.instances_by_name.remove(&name);
        }
        if let Some(c) = self.classes.class_mut(class) {
            c.instances = c.instances.saturating_sub(1);
        }
        if busy == 0 {
            self.free_instance(id);
        }
        true
    }

    fn free_instance(&mut self, id: InstanceId) {
        let Some(ins) = self
            .classes
            .instances
            .get_mut(id.0 as usize)
            .and_then(|i| i.take())
        else {
            return;
        };
        for v in ins.slots {
            self.deinstall_value(v);
        }
        self.deinstall_value(Value::InstanceName(ins.name));
    }

    pub(crate) fn reclaim_instances(&mut self) -> usize {
        let idle: Vec<InstanceId> = self
            .classes
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.as_ref().is_some_and(|i| i.garbage && i.busy == 0))
            .map(|(n, _)| InstanceId(n as u32))
            .collect();
        for id in &idle {
            self.free_instance(*id);
        }
        idle.len()
    }

    /// Deletes every instance, then removes idle user classes and
    /// empty user modules defined at run time
    pub(crate) fn clear_runtime_objects(&mut self) {
        let live: Vec<InstanceId> = self
            .classes
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.as_ref().is_some_and(|i| !i.garbage))
            .map(|(n, _)| InstanceId(n as u32))
            .collect();
        for id in live {
            self.delete_instance(id);
        }

        let user: Vec<ClassId> = self
            .classes
            .class_ids()
            .into_iter()
            .filter(|id| {
                self.classes
                    .class(*id)
                    .is_some_and(|c| !c.system && !c.loaded)
            })
            .collect();
        for id in user.into_iter().rev() {
            if let Err(e) = self.undefine_class(id) {
                log::debug!("class kept across binary load: {}", e);
            }
        }

        for id in self.classes.module_ids() {
            let empty = self
                .classes
                .module(id)
                .is_some_and(|m| !m.loaded && m.class_head.is_none());
            if id != ModuleId(0) && empty {
                if let Some(m) = self.classes.remove_module(id) {
                    self.deinstall_value(Value::Symbol(m.name));
                }
            }
        }
        self.classes.current_module = ModuleId(0);
    }
}
