// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/bsave.rs

// Binary image writer; produces exactly the layout the loader reads.

// <>

use super::bload::{
    BINARY_PREFIX, BINARY_VERSION, CONSTRAINT_RECORD, EXPRESSION_RECORD, TAG_LEN,
};
use super::bload::section_tag;
use super::class::{ClassId, ModuleId};
use super::constraint::ConstraintId;
use super::core::Value;
use super::expr::{ExprId, Payload};
use super::func::FunctionId;
use super::symtab::{FloatId, IntegerId, SymbolId};
use super::Env;

use std::collections::HashMap;
use std::fs::File;
use std::hash::Hash;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BsaveError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("unable to open file {path}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot save while a binary image is loaded")]
    BloadActive,
    #[error("cannot save {0}")]
    Unsupported(String),
}

pub(crate) fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub(crate) fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Items in first-marked order, each with its index in the image
struct Marks<T> {
    order: Vec<T>,
    index: HashMap<T, i64>,
}

impl<T> Default for Marks<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Copy + Eq + Hash> Marks<T> {
    fn mark(&mut self, item: T) -> bool {
        if self.index.contains_key(&item) {
            return false;
        }
        self.index.insert(item, self.order.len() as i64);
        self.order.push(item);
        true
    }

    fn get(&self, item: T) -> Option<i64> {
        self.index.get(&item).copied()
    }

    fn reorder(&mut self, order: Vec<T>) {
        self.index = order.iter().enumerate().map(|(i, t)| (*t, i as i64)).collect();
        self.order = order;
    }
}

/// Everything a binary image refers to, with its index in the image
///
/// Filled by the items' `find_needed` callbacks before any output
#[derive(Default)]
pub struct BsaveContext {
    functions: Marks<FunctionId>,
    symbols: Marks<SymbolId>,
    floats: Marks<FloatId>,
    integers: Marks<IntegerId>,
    expressions: Marks<ExprId>,
    constraints: Marks<ConstraintId>,
    modules: Marks<ModuleId>,
    classes: Marks<ClassId>,
}

impl BsaveContext {
    pub fn mark_symbol(&mut self, id: SymbolId) {
        self.symbols.mark(id);
    }

    pub fn mark_value(&mut self, value: Value) {
        match value {
            Value::Symbol(id) | Value::String(id) | Value::InstanceName(id) => {
                self.symbols.mark(id);
            }
            Value::Integer(id) => {
                self.integers.mark(id);
            }
            Value::Float(id) => {
                self.floats.mark(id);
            }
            _ => {}
        }
    }

    /// Marks an expression list with all its nodes and atoms
    pub fn mark_expression(&mut self, env: &Env, root: Option<ExprId>) {
        let Some(root) = root else {
            return;
        };
        if self.expressions.get(root).is_some() {
            return;
        }
        for id in env.expression_nodes(root) {
            if !self.expressions.mark(id) {
                continue;
            }
            let Some(node) = env.expression_node(id) else {
                continue;
            };
            match node.value {
                Payload::Function(f) => {
                    self.functions.mark(f);
                }
                Payload::Value(v) => self.mark_value(v),
                Payload::Variable(sym) => self.mark_symbol(sym),
                Payload::None | Payload::Index(_) => {}
            }
        }
    }

    pub fn mark_constraint(&mut self, id: Option<ConstraintId>) {
        if let Some(id) = id {
            self.constraints.mark(id);
        }
    }

    pub fn mark_module(&mut self, id: ModuleId) {
        self.modules.mark(id);
    }

    pub fn mark_class(&mut self, id: ClassId) {
        self.classes.mark(id);
    }

    pub fn symbol_index(&self, id: SymbolId) -> Result<i64, BsaveError> {
        self.symbols
            .get(id)
            .ok_or_else(|| BsaveError::Unsupported(format!("unmarked symbol {:?}", id)))
    }

    /// Image index of an expression; `-1` for none
    pub fn expression_index(&self, id: Option<ExprId>) -> Result<i64, BsaveError> {
        match id {
            None => Ok(-1),
            Some(id) => self
                .expressions
                .get(id)
                .ok_or_else(|| BsaveError::Unsupported(format!("unmarked expression {:?}", id))),
        }
    }

    pub fn constraint_index(&self, id: Option<ConstraintId>) -> Result<i64, BsaveError> {
        match id {
            None => Ok(-1),
            Some(id) => self
                .constraints
                .get(id)
                .ok_or_else(|| BsaveError::Unsupported(format!("unmarked constraint {:?}", id))),
        }
    }

    pub fn module_index(&self, id: ModuleId) -> Option<i64> {
        self.modules.get(id)
    }

    pub fn modules(&self) -> &[ModuleId] {
        &self.modules.order
    }

    pub fn classes(&self) -> &[ClassId] {
        &self.classes.order
    }

    /// Image index of a class; system class `k` is saved as `-(k + 2)`
    /// since every environment creates those itself
    pub fn class_index(&self, env: &Env, id: Option<ClassId>) -> Result<i64, BsaveError> {
        let Some(id) = id else {
            return Ok(-1);
        };
        if (id.0 as usize) < env.classes.system_count {
            return Ok(-(id.0 as i64 + 2));
        }
        self.classes
            .get(id)
            .ok_or_else(|| BsaveError::Unsupported(format!("unmarked class {:?}", id)))
    }

    fn payload_index(&self, env: &Env, value: Payload) -> Result<i64, BsaveError> {
        let missing = || BsaveError::Unsupported(format!("unmarked {:?}", value));
        match value {
            Payload::None => Ok(-1),
            Payload::Index(n) => Ok(n as i64),
            Payload::Function(f) => self.functions.get(f).ok_or_else(missing),
            Payload::Variable(sym) => self.symbols.get(sym).ok_or_else(missing),
            Payload::Value(v) => match v {
                Value::Symbol(id) | Value::String(id) | Value::InstanceName(id) => {
                    self.symbols.get(id).ok_or_else(missing)
                }
                Value::Integer(id) => self.integers.get(id).ok_or_else(missing),
                Value::Float(id) => self.floats.get(id).ok_or_else(missing),
                Value::Void => Ok(0),
                Value::Class(id) => self.class_index(env, Some(id)),
                other => Err(BsaveError::Unsupported(format!(
                    "{} constant",
                    other.type_code().name()
                ))),
            },
        }
    }
}

impl Env {
    /// Writes a binary image of every saveable construct to `path`,
    /// reporting failures through the error sink
    pub fn bsave(&mut self, path: impl AsRef<Path>) -> bool {
        match self.try_bsave(path) {
            Ok(()) => true,
            Err(e) => {
                self.print_error_id("BSAVE", 1, &format!("Binary save failed: {}.", e));
                false
            }
        }
    }

    pub fn try_bsave(&self, path: impl AsRef<Path>) -> Result<(), BsaveError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| BsaveError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let mut out = BufWriter::new(file);
        self.bsave_to(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn bsave_to(&self, out: &mut dyn Write) -> Result<(), BsaveError> {
        if self.bload.active {
            return Err(BsaveError::BloadActive);
        }

        let items = self.bload.items();
        let mut ctx = BsaveContext::default();
        for item in &items {
            item.find_needed(self, &mut ctx);
        }
        // registration order lets the loader resolve names in one pass
        let mut functions = ctx.functions.order.clone();
        functions.sort();
        ctx.functions.reorder(functions);

        let mut image = Vec::new();
        image.extend_from_slice(BINARY_PREFIX);
        image.extend_from_slice(BINARY_VERSION);
        self.write_function_table(&ctx, &mut image);
        self.write_atoms(&ctx, &mut image)?;
        put_i64(&mut image, ctx.expressions.order.len() as i64);

        for item in &items {
            let mut section = Vec::new();
            item.bsave_storage(self, &ctx, &mut section)?;
            put_section(&mut image, item.name(), &section);
        }
        image.extend_from_slice(BINARY_PREFIX);

        self.write_expressions(&ctx, &mut image)?;
        self.write_constraints(&ctx, &mut image)?;

        for item in &items {
            let mut section = Vec::new();
            item.bsave(self, &ctx, &mut section)?;
            put_section(&mut image, item.name(), &section);
        }
        image.extend_from_slice(BINARY_PREFIX);

        out.write_all(&image)?;
        log::debug!(
            "saved binary image: {} functions, {} symbols, {} expressions, {} bytes",
            ctx.functions.order.len(),
            ctx.symbols.order.len(),
            ctx.expressions.order.len(),
            image.len()
        );
        Ok(())
    }

    fn write_function_table(&self, ctx: &BsaveContext, out: &mut Vec<u8>) {
        put_i64(out, ctx.functions.order.len() as i64);
        if ctx.functions.order.is_empty() {
            return;
        }
        let mut names = Vec::new();
        for f in &ctx.functions.order {
            names.extend_from_slice(self.function_name(*f).unwrap_or("").as_bytes());
            names.push(0);
        }
        put_u64(out, names.len() as u64);
        out.extend_from_slice(&names);
    }

    fn write_atoms(&self, ctx: &BsaveContext, out: &mut Vec<u8>) -> Result<(), BsaveError> {
        let mut text = Vec::new();
        for id in &ctx.symbols.order {
            let kind = self
                .atoms
                .symbol_kind(*id)
                .ok_or_else(|| BsaveError::Unsupported(format!("freed symbol {:?}", id)))?;
            text.push(kind.to_byte());
            text.extend_from_slice(self.symbol_text(*id).unwrap_or("").as_bytes());
            text.push(0);
        }
        put_i64(out, ctx.symbols.order.len() as i64);
        put_u64(out, text.len() as u64);
        out.extend_from_slice(&text);

        put_i64(out, ctx.floats.order.len() as i64);
        for id in &ctx.floats.order {
            put_f64(out, self.atoms.float(*id).unwrap_or(0.0));
        }
        put_i64(out, ctx.integers.order.len() as i64);
        for id in &ctx.integers.order {
            put_i64(out, self.atoms.integer(*id).unwrap_or(0));
        }
        Ok(())
    }

    fn write_expressions(&self, ctx: &BsaveContext, out: &mut Vec<u8>) -> Result<(), BsaveError> {
        for id in &ctx.expressions.order {
            let node = self
                .expression_node(*id)
                .ok_or_else(|| BsaveError::Unsupported(format!("freed expression {:?}", id)))?;
            let start = out.len();
            put_u16(out, node.kind.0);
            put_i64(out, ctx.payload_index(self, node.value)?);
            put_i64(out, ctx.expression_index(node.arg_list)?);
            put_i64(out, ctx.expression_index(node.next_arg)?);
            debug_assert_eq!(out.len() - start, EXPRESSION_RECORD);
        }
        Ok(())
    }

    fn write_constraints(&self, ctx: &BsaveContext, out: &mut Vec<u8>) -> Result<(), BsaveError> {
        put_i64(out, ctx.constraints.order.len() as i64);
        for id in &ctx.constraints.order {
            let record = self
                .constraint(*id)
                .ok_or_else(|| BsaveError::Unsupported(format!("freed constraint {:?}", id)))?;
            let start = out.len();
            put_u32(out, record.allowed.0);
            put_u8(out, record.any_allowed as u8);
            put_i64(out, record.min_fields);
            put_i64(out, record.max_fields.unwrap_or(-1));
            debug_assert_eq!(out.len() - start, CONSTRAINT_RECORD);
        }
        Ok(())
    }
}

/// Tagged, length-prefixed section; empty sections are left out
fn put_section(out: &mut Vec<u8>, name: &str, section: &[u8]) {
    if section.is_empty() {
        return;
    }
    let tag: [u8; TAG_LEN] = section_tag(name);
    out.extend_from_slice(&tag);
    put_u64(out, section.len() as u64);
    out.extend_from_slice(section);
}
