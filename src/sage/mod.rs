// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/mod.rs

// The environment object that every operation of the rule engine
// core threads through, its error flags and control signal, scoped
// state restoration, and the diagnostic sink.

// <>

//! SAGE, the Symbolic Augmentation Guidance Engine
//!
//! Evaluation core for STARK's embedded rule system: an expression
//! evaluator, an object message dispatcher, and a binary image loader

use std::any::Any;
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};

pub mod bload;
pub mod bsave;
pub mod class;
pub mod config;
pub mod constraint;
pub mod core;
pub mod eval;
pub mod expr;
pub mod func;
pub mod items;
pub mod memmgt;
pub mod msgpass;
pub mod primtab;
pub mod stdenv;
pub mod symtab;
pub mod types;

pub use self::bload::{BinaryItem, BloadError};
pub use self::bsave::BsaveError;
pub use self::class::{ClassId, DefineError, InstanceId, ModuleId, SlotSpec};
pub use self::config::{ConfigError, SageConfig};
pub use self::core::{MultifieldId, Segment, Value};
pub use self::eval::Call;
pub use self::expr::{ExprId, Payload};
pub use self::func::FunctionId;
pub use self::symtab::{ExternalId, FloatId, IntegerId, SymbolId, SymbolKind};
pub use self::types::{HandlerRole, TypeCode, TypeSet};

/// Non-local control flow requested by the running code
///
/// Loops that run user code poll this between steps and unwind when
/// it is anything but `None`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ControlSignal {
    #[default]
    None,
    Halt,
    Break,
    Return,
}

/// A rule engine environment
///
/// Owns every table, stack, and flag of one independent engine
/// instance; nothing is global
pub struct Env {
    pub(crate) config: SageConfig,
    pub(crate) atoms: symtab::Atoms,
    pub(crate) multifields: core::MultifieldStore,
    pub(crate) exprs: expr::ExprArena,
    pub(crate) functions: func::FunctionRegistry,
    pub(crate) primitives: primtab::PrimitiveTable,
    pub(crate) external_types: primtab::ExternalTypes,
    pub(crate) classes: class::ClassSystem,
    pub(crate) constraints: constraint::ConstraintTable,
    pub(crate) eval: eval::EvalState,
    pub(crate) messages: msgpass::MessageState,
    pub(crate) bload: bload::BloadState,
    pub(crate) memory: memmgt::MemoryState,
    data: Vec<Option<Box<dyn Any>>>,
    error_sink: Box<dyn Write>,
    pub(crate) true_sym: SymbolId,
    pub(crate) false_sym: SymbolId,
    pub(crate) nil_sym: SymbolId,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    pub fn new() -> Self {
        Self::with_config(SageConfig::default())
    }

    pub fn with_config(config: SageConfig) -> Self {
        let mut atoms = symtab::Atoms::default();
        let mut permanent = |name: &str| {
            let id = atoms.symbol_id(SymbolKind::Symbol, name);
            atoms.symbols.make_permanent(id.0);
            id
        };
        let true_sym = permanent("TRUE");
        let false_sym = permanent("FALSE");
        let nil_sym = permanent("nil");

        let mut env = Env {
            memory: memmgt::MemoryState::new(config.scratch_limit),
            config,
            atoms,
            multifields: core::MultifieldStore::default(),
            exprs: expr::ExprArena::default(),
            functions: func::FunctionRegistry::default(),
            primitives: primtab::PrimitiveTable::default(),
            external_types: primtab::ExternalTypes::default(),
            classes: class::ClassSystem::default(),
            constraints: constraint::ConstraintTable::default(),
            eval: eval::EvalState::default(),
            messages: msgpass::MessageState::default(),
            bload: bload::BloadState::default(),
            data: Vec::new(),
            error_sink: Box::new(io::stderr()),
            true_sym,
            false_sym,
            nil_sym,
        };

        primtab::install_builtin_primitives(&mut env);
        class::create_system_classes(&mut env);
        stdenv::register_builtins(&mut env);
        items::register_construct_items(&mut env);

        log::debug!("created rule engine environment");
        env
    }

    pub fn config(&self) -> &SageConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SageConfig {
        &mut self.config
    }

    /// Replaces the sink that receives error diagnostics
    pub fn set_error_sink(&mut self, sink: Box<dyn Write>) {
        self.error_sink = sink;
    }

    /// Prints a diagnostic prefixed with its component and code
    pub fn print_error_id(&mut self, component: &str, code: u32, message: &str) {
        log::warn!("[{}{}] {}", component, code, message);
        // a broken sink must not take the engine down with it
        let _ = writeln!(self.error_sink, "[{}{}] {}", component, code, message);
    }

    /// Continues a diagnostic started with `print_error_id`
    pub fn print_error_line(&mut self, line: &str) {
        log::warn!("{}", line);
        let _ = writeln!(self.error_sink, "{}", line);
    }

    /// Reports a violated internal invariant and aborts
    pub fn system_error(&mut self, component: &str, code: u32, message: &str) -> ! {
        let _ = writeln!(self.error_sink, "[{}{}] {}", component, code, message);
        log::error!("[{}{}] {}", component, code, message);
        panic!("internal consistency violation [{}{}]: {}", component, code, message);
    }

    pub fn evaluation_error(&self) -> bool {
        self.eval.error
    }

    /// Setting the evaluation error also requests a halt
    pub fn set_evaluation_error(&mut self, value: bool) {
        self.eval.error = value;
        if value {
            self.eval.control = ControlSignal::Halt;
        }
    }

    pub fn halt_execution(&self) -> bool {
        self.eval.control == ControlSignal::Halt
    }

    pub fn set_halt_execution(&mut self, value: bool) {
        if value {
            self.eval.control = ControlSignal::Halt;
        } else if self.eval.control == ControlSignal::Halt {
            self.eval.control = ControlSignal::None;
        }
    }

    pub fn control(&self) -> ControlSignal {
        self.eval.control
    }

    /// Raises a control signal; a pending halt is never downgraded
    pub fn set_control(&mut self, signal: ControlSignal) {
        if self.eval.control != ControlSignal::Halt || signal == ControlSignal::None {
            self.eval.control = signal;
        }
    }

    /// Resets the error flag and any control signal
    pub fn clear_errors(&mut self) {
        self.eval.error = false;
        self.eval.control = ControlSignal::None;
    }

    /// Borrows the environment so that `undo` runs when the borrow
    /// ends, on every exit path
    pub fn scoped<'a>(&'a mut self, undo: impl FnOnce(&mut Env) + 'a) -> Restore<'a> {
        Restore {
            env: self,
            undo: Some(Box::new(undo)),
        }
    }

    /// Reserves environment data slot `id`; fails if already taken
    pub fn allocate_environment_data(&mut self, id: usize, value: Box<dyn Any>) -> bool {
        if self.data.len() <= id {
            self.data.resize_with(id + 1, || None);
        }
        if self.data[id].is_some() {
            return false;
        }
        self.data[id] = Some(value);
        true
    }

    pub fn environment_data<T: 'static>(&self, id: usize) -> Option<&T> {
        self.data.get(id)?.as_ref()?.downcast_ref()
    }

    pub fn environment_data_mut<T: 'static>(&mut self, id: usize) -> Option<&mut T> {
        self.data.get_mut(id)?.as_mut()?.downcast_mut()
    }
}

/// Environment borrow that restores saved state when dropped
pub struct Restore<'a> {
    env: &'a mut Env,
    undo: Option<Box<dyn FnOnce(&mut Env) + 'a>>,
}

impl Deref for Restore<'_> {
    type Target = Env;

    fn deref(&self) -> &Env {
        self.env
    }
}

impl DerefMut for Restore<'_> {
    fn deref_mut(&mut self) -> &mut Env {
        self.env
    }
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            undo(self.env);
        }
    }
}
