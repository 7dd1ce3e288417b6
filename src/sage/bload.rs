// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/bload.rs

// Binary image loader. Validates the image header, resolves the
// function table against the live registry, reads atoms, expressions
// and constraints, and drives the registered binary items through a
// storage pass and a population pass. Failures after the before-load
// hooks unwind through the abort hooks; a loaded image is removed by
// a binary clear.

// <>

use super::bsave::BsaveContext;
use super::bsave::BsaveError;
use super::constraint::ConstraintRecord;
use super::core::Value;
use super::expr::{ExprId, ExprNode, Payload};
use super::func::FunctionId;
use super::symtab::{FloatId, IntegerId, SymbolId, SymbolKind};
use super::types::{TypeCode, TypeSet};
use super::Env;

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;

/// Leading bytes of every binary image; a section tag equal to it
/// ends a section pass
pub const BINARY_PREFIX: &[u8; TAG_LEN] = b"\x01\x02\x03\x04SAGE-IMG\0";

pub const BINARY_VERSION: &[u8; 16] = b"SAGE BIN V0.2\0\0\0";

/// Width of a section tag
pub const TAG_LEN: usize = 13;

/// kind u16, value i64, argument i64, sibling i64
pub(crate) const EXPRESSION_RECORD: usize = 26;

/// allowed u32, any u8, min i64, max i64
pub(crate) const CONSTRAINT_RECORD: usize = 21;

#[derive(Debug, Error)]
pub enum BloadError {
    #[error("file {0} is not a binary construct file")]
    NotBinaryFile(String),
    #[error("file {0} is an incompatible binary construct version")]
    IncompatibleVersion(String),
    #[error("unable to open file {path}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("the current binary image cannot be cleared")]
    ClearRefused,
    #[error("undefined functions referenced: {}", .0.join(", "))]
    UnresolvedFunctions(Vec<String>),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("not enough memory to read the binary image")]
    OutOfMemory,
    #[error("corrupt binary image: {0}")]
    Corrupt(String),
    #[error("binary load halted")]
    Halted,
}

/// Save and load behavior of one construct type
///
/// Items are found by name when their section tags are read. Every
/// callback has a default that does nothing, so an item implements
/// only the passes it takes part in
pub trait BinaryItem {
    fn name(&self) -> &str;

    /// Items are saved and cleared from highest priority down
    fn priority(&self) -> i32 {
        0
    }

    /// Marks the functions, atoms, expressions and constraints the
    /// item's constructs refer to
    fn find_needed(&self, _env: &Env, _ctx: &mut BsaveContext) {}

    fn bsave_storage(
        &self,
        _env: &Env,
        _ctx: &BsaveContext,
        _out: &mut Vec<u8>,
    ) -> Result<(), BsaveError> {
        Ok(())
    }

    fn bsave(&self, _env: &Env, _ctx: &BsaveContext, _out: &mut Vec<u8>) -> Result<(), BsaveError> {
        Ok(())
    }

    /// Reads the item's storage header and allocates its arrays
    fn bload_storage(&self, _env: &mut Env, _input: &mut dyn Read) -> Result<(), BloadError> {
        Ok(())
    }

    /// Reads construct data into the allocated arrays
    fn bload(&self, _env: &mut Env, _input: &mut dyn Read) -> Result<(), BloadError> {
        Ok(())
    }

    /// Releases everything the item loaded; must cope with a partial
    /// load
    fn clear(&self, _env: &mut Env) {}
}

struct Hook<F: ?Sized> {
    name: String,
    priority: i32,
    action: Rc<F>,
}

type Action = dyn Fn(&mut Env);
type ReadyCheck = dyn Fn(&Env) -> bool;

fn insert_hook<F: ?Sized>(hooks: &mut Vec<Hook<F>>, name: &str, priority: i32, action: Rc<F>) -> bool {
    if hooks.iter().any(|h| h.name == name) {
        return false;
    }
    let at = hooks
        .iter()
        .position(|h| h.priority < priority)
        .unwrap_or(hooks.len());
    hooks.insert(
        at,
        Hook {
            name: name.to_string(),
            priority,
            action,
        },
    );
    true
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    Storage,
    Population,
}

#[derive(Default)]
pub struct BloadState {
    pub(crate) active: bool,
    pub(crate) clear_in_progress: bool,
    items: Vec<Rc<dyn BinaryItem>>,
    before: Vec<Hook<Action>>,
    after: Vec<Hook<Action>>,
    abort: Vec<Hook<Action>>,
    ready: Vec<Hook<ReadyCheck>>,
    /// Scratch tables of the image being read
    functions: Vec<FunctionId>,
    symbols: Vec<SymbolId>,
    floats: Vec<FloatId>,
    integers: Vec<IntegerId>,
    /// Expression block of the image: base, count, nodes refreshed
    expressions: Option<(u32, usize, usize)>,
    constraints: bool,
}

impl BloadState {
    pub(crate) fn items(&self) -> Vec<Rc<dyn BinaryItem>> {
        self.items.clone()
    }

    fn clear_scratch(&mut self) {
        self.functions = Vec::new();
        self.symbols = Vec::new();
        self.floats = Vec::new();
        self.integers = Vec::new();
    }
}

/// Cursor over one fixed-size record
pub(crate) struct Record<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Record<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], BloadError> {
        let end = self
            .offset
            .checked_add(N)
            .ok_or_else(|| BloadError::Corrupt("record offset overflow".to_string()))?;
        let bytes = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| BloadError::Corrupt(format!("record truncated at byte {}", self.offset)))?;
        self.offset = end;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, BloadError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, BloadError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub fn u32(&mut self) -> Result<u32, BloadError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub fn i64(&mut self) -> Result<i64, BloadError> {
        Ok(i64::from_le_bytes(self.take()?))
    }
}

pub(crate) fn read_i64(input: &mut dyn Read) -> Result<i64, BloadError> {
    let mut buf = [0; 8];
    input.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub(crate) fn read_u64(input: &mut dyn Read) -> Result<u64, BloadError> {
    let mut buf = [0; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64(input: &mut dyn Read) -> Result<f64, BloadError> {
    let mut buf = [0; 8];
    input.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Reads a non-negative record count
pub(crate) fn read_count(input: &mut dyn Read, what: &str) -> Result<usize, BloadError> {
    let n = read_i64(input)?;
    usize::try_from(n).map_err(|_| BloadError::Corrupt(format!("negative {} count", what)))
}

/// Tag bytes for a construct type name, NUL padded
pub(crate) fn section_tag(name: &str) -> [u8; TAG_LEN] {
    let mut tag = [0; TAG_LEN];
    let len = name.len().min(TAG_LEN - 1);
    tag[..len].copy_from_slice(&name.as_bytes()[..len]);
    tag
}

fn tag_name(tag: &[u8; TAG_LEN]) -> String {
    let end = tag.iter().position(|b| *b == 0).unwrap_or(TAG_LEN);
    String::from_utf8_lossy(&tag[..end]).into_owned()
}

impl Env {
    pub fn bload_active(&self) -> bool {
        self.bload.active
    }

    /// True while before-load hooks run
    pub fn clear_in_progress(&self) -> bool {
        self.bload.clear_in_progress
    }

    /// Registers a construct type; fails for a taken name or while an
    /// image is loaded
    pub fn register_binary_item(&mut self, item: Rc<dyn BinaryItem>) -> bool {
        if self.bload.active || self.bload.items.iter().any(|i| i.name() == item.name()) {
            return false;
        }
        let at = self
            .bload
            .items
            .iter()
            .position(|i| i.priority() < item.priority())
            .unwrap_or(self.bload.items.len());
        self.bload.items.insert(at, item);
        true
    }

    pub fn add_before_bload(&mut self, name: &str, priority: i32, f: impl Fn(&mut Env) + 'static) -> bool {
        insert_hook(&mut self.bload.before, name, priority, Rc::new(f) as Rc<Action>)
    }

    pub fn add_after_bload(&mut self, name: &str, priority: i32, f: impl Fn(&mut Env) + 'static) -> bool {
        insert_hook(&mut self.bload.after, name, priority, Rc::new(f) as Rc<Action>)
    }

    pub fn add_abort_bload(&mut self, name: &str, priority: i32, f: impl Fn(&mut Env) + 'static) -> bool {
        insert_hook(&mut self.bload.abort, name, priority, Rc::new(f) as Rc<Action>)
    }

    /// Adds a check consulted before a binary clear; it returns false
    /// while constructs named `name` are still in use
    pub fn add_clear_bload_ready(
        &mut self,
        name: &str,
        priority: i32,
        f: impl Fn(&Env) -> bool + 'static,
    ) -> bool {
        insert_hook(&mut self.bload.ready, name, priority, Rc::new(f) as Rc<ReadyCheck>)
    }

    fn run_hooks(&mut self, which: fn(&BloadState) -> &Vec<Hook<Action>>) {
        let actions: Vec<Rc<Action>> = which(&self.bload).iter().map(|h| h.action.clone()).collect();
        for action in actions {
            action(self);
        }
    }

    /// Loads a binary image file, reporting failures through the error
    /// sink
    pub fn bload(&mut self, path: impl AsRef<Path>) -> bool {
        self.try_bload(path).is_ok()
    }

    pub fn try_bload(&mut self, path: impl AsRef<Path>) -> Result<(), BloadError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(source) => {
                self.print_error_id("BLOAD", 1, &format!("Unable to open file {}.", name));
                return Err(BloadError::Open { path: name, source });
            }
        };
        self.bload_from(&mut BufReader::new(file), &name)
    }

    /// Loads a binary image from any reader; `name` labels diagnostics
    pub fn bload_from(&mut self, input: &mut dyn Read, name: &str) -> Result<(), BloadError> {
        self.check_header(input, name)?;
        // a halt left by earlier evaluation must not stop this load
        self.clear_errors();
        if !self.clear_bload() {
            return Err(BloadError::ClearRefused);
        }

        log::debug!("loading binary image {}", name);
        {
            let mut env = self.scoped(|env| env.bload.clear_in_progress = false);
            env.bload.clear_in_progress = true;
            env.run_hooks(|b| &b.before);
        }

        match self.load_image(input) {
            Ok(()) => {
                self.bload.clear_scratch();
                self.run_hooks(|b| &b.after);
                self.bload.active = true;
                log::debug!("binary image {} loaded", name);
                Ok(())
            }
            Err(e) => {
                if !matches!(e, BloadError::UnresolvedFunctions(_)) {
                    self.print_error_id(
                        "BLOAD",
                        4,
                        &format!("Binary load of {} aborted: {}.", name, e),
                    );
                }
                self.abort_bload();
                Err(e)
            }
        }
    }

    fn check_header(&mut self, input: &mut dyn Read, name: &str) -> Result<(), BloadError> {
        let mut prefix = [0; TAG_LEN];
        if input.read_exact(&mut prefix).is_err() || &prefix != BINARY_PREFIX {
            self.print_error_id(
                "BLOAD",
                2,
                &format!("File {} is not a binary construct file.", name),
            );
            return Err(BloadError::NotBinaryFile(name.to_string()));
        }

        let mut version = [0; 16];
        if input.read_exact(&mut version).is_err() || &version != BINARY_VERSION {
            self.print_error_id(
                "BLOAD",
                3,
                &format!("File {} is an incompatible binary construct version.", name),
            );
            return Err(BloadError::IncompatibleVersion(name.to_string()));
        }
        Ok(())
    }

    /// Everything between the before-load hooks and teardown
    fn load_image(&mut self, input: &mut dyn Read) -> Result<(), BloadError> {
        self.read_function_table(input)?;
        self.read_atoms(input)?;

        let count = read_count(input, "expression")?;
        let base = self.exprs.alloc_block(count);
        self.bload.expressions = Some((base, count, 0));
        log::debug!("allocated {} image expressions", count);

        self.read_sections(input, Pass::Storage)?;
        self.bload_and_refresh(input, count, EXPRESSION_RECORD, |env, rec, i| {
            env.refresh_expression(rec, i)
        })?;
        self.read_constraints(input)?;
        self.read_sections(input, Pass::Population)
    }

    fn read_function_table(&mut self, input: &mut dyn Read) -> Result<(), BloadError> {
        let count = read_count(input, "function")?;
        if count == 0 {
            return Ok(());
        }

        let size = read_u64(input)?;
        let size = usize::try_from(size).map_err(|_| BloadError::OutOfMemory)?;
        let mut buf = self.allocate_scratch(size).ok_or(BloadError::OutOfMemory)?;
        input.read_exact(&mut buf)?;

        let names: Vec<String> = buf
            .split(|b| *b == 0)
            .take(count)
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .collect();
        if names.len() < count {
            return Err(BloadError::Corrupt("short function name table".to_string()));
        }

        let mut missing = Vec::new();
        let mut start = 0;
        for name in names {
            match self.functions.find_from(&name, start) {
                Some(id) => {
                    self.bload.functions.push(id);
                    start = id.0 as usize + 1;
                }
                None => {
                    if missing.is_empty() {
                        self.print_error_id(
                            "BLOAD",
                            6,
                            "The following undefined functions are referenced by this binary image:",
                        );
                    }
                    self.print_error_line(&format!("   {}", name));
                    missing.push(name);
                }
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BloadError::UnresolvedFunctions(missing))
        }
    }

    /// Interns the image's atoms without installing them
    fn read_atoms(&mut self, input: &mut dyn Read) -> Result<(), BloadError> {
        let count = read_count(input, "symbol")?;
        let size = read_u64(input)?;
        let size = usize::try_from(size).map_err(|_| BloadError::OutOfMemory)?;
        let mut buf = self.allocate_scratch(size).ok_or(BloadError::OutOfMemory)?;
        input.read_exact(&mut buf)?;

        let mut rest = buf.as_slice();
        for _ in 0..count {
            let (&kind, tail) = rest
                .split_first()
                .ok_or_else(|| BloadError::Corrupt("short symbol table".to_string()))?;
            let kind = SymbolKind::from_byte(kind)
                .ok_or_else(|| BloadError::Corrupt(format!("symbol kind {}", kind)))?;
            let end = tail
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| BloadError::Corrupt("unterminated symbol".to_string()))?;
            let text = String::from_utf8_lossy(&tail[..end]);
            let id = self.atoms.symbol_id(kind, &text);
            self.bload.symbols.push(id);
            rest = &tail[end + 1..];
        }

        for _ in 0..read_count(input, "float")? {
            let x = read_f64(input)?;
            let id = self.atoms.float_id(x);
            self.bload.floats.push(id);
        }
        for _ in 0..read_count(input, "integer")? {
            let n = read_i64(input)?;
            let id = self.atoms.integer_id(n);
            self.bload.integers.push(id);
        }

        log::debug!(
            "read {} symbols, {} floats, {} integers",
            self.bload.symbols.len(),
            self.bload.floats.len(),
            self.bload.integers.len()
        );
        Ok(())
    }

    fn read_sections(&mut self, input: &mut dyn Read, pass: Pass) -> Result<(), BloadError> {
        loop {
            if self.halt_execution() {
                return Err(BloadError::Halted);
            }

            let mut tag = [0; TAG_LEN];
            input.read_exact(&mut tag)?;
            if &tag == BINARY_PREFIX {
                return Ok(());
            }
            let len = read_u64(input)?;
            let name = tag_name(&tag);

            let item = self.bload.items.iter().find(|i| i.name() == name).cloned();
            let mut section = (&mut *input).take(len);
            match item {
                Some(item) if pass == Pass::Storage => item.bload_storage(self, &mut section)?,
                Some(item) => item.bload(self, &mut section)?,
                None if len > 0 => self.print_error_line(&format!("Skipping {} binary data.", name)),
                None => {}
            }
            // whatever the item left unread
            let rest = io::copy(&mut section, &mut io::sink())?;
            if rest > 0 {
                log::trace!("skipped {} trailing bytes of {}", rest, name);
            }
        }
    }

    /// Reads `count` records of `record_size` bytes, in batches sized
    /// to fit scratch memory, calling `update` once per record in order
    ///
    /// The batch halves whenever its buffer cannot be allocated. If not
    /// even one record fits, the out-of-memory handler installed before
    /// the call runs and the read fails
    pub fn bload_and_refresh(
        &mut self,
        input: &mut dyn Read,
        count: usize,
        record_size: usize,
        mut update: impl FnMut(&mut Env, &[u8], usize) -> Result<(), BloadError>,
    ) -> Result<(), BloadError> {
        if count == 0 {
            return Ok(());
        }
        if record_size == 0 {
            return Err(BloadError::Corrupt("zero record size".to_string()));
        }

        let previous = self.memory.oom.take();
        let restored = previous.clone();
        let mut env = self.scoped(move |env| env.memory.oom = restored);

        let mut batch = count;
        let mut done = 0;
        while done < count {
            batch = batch.min(count - done);
            let mut buf = loop {
                let bytes = batch.checked_mul(record_size);
                match bytes.and_then(|b| env.allocate_scratch(b)) {
                    Some(buf) => break buf,
                    None if batch > 1 => {
                        batch /= 2;
                        log::trace!("bload batch reduced to {} records", batch);
                    }
                    None => {
                        if let Some(handler) = &previous {
                            handler(&mut *env, record_size);
                        }
                        return Err(BloadError::OutOfMemory);
                    }
                }
            };

            input.read_exact(&mut buf)?;
            for (k, record) in buf.chunks_exact(record_size).enumerate() {
                update(&mut *env, record, done + k)?;
            }
            done += batch;
        }
        Ok(())
    }

    fn refresh_expression(&mut self, record: &[u8], index: usize) -> Result<(), BloadError> {
        let mut r = Record::new(record);
        let kind = TypeCode(r.u16()?);
        let value = r.i64()?;
        let arg = r.i64()?;
        let next = r.i64()?;

        let payload = self.bloaded_payload(kind, value)?;
        let node = ExprNode {
            kind,
            value: payload,
            arg_list: self.bloaded_expression(arg)?,
            next_arg: self.bloaded_expression(next)?,
        };

        let Some((base, count, _)) = self.bload.expressions else {
            return Err(BloadError::Corrupt("expression block missing".to_string()));
        };
        if !image_class(payload) {
            self.install_payload(payload);
        }
        self.exprs.set(ExprId(base + index as u32), node);
        self.bload.expressions = Some((base, count, index + 1));
        if cfg!(feature = "memdbg") {
            log::trace!("refreshed expression {} as {:?}", index, node);
        }
        Ok(())
    }

    fn bloaded_payload(&self, kind: TypeCode, value: i64) -> Result<Payload, BloadError> {
        Ok(match kind {
            TypeCode::FCALL => Payload::Function(index(&self.bload.functions, value, "function")?),
            TypeCode::SYMBOL | TypeCode::STRING | TypeCode::INSTANCE_NAME => {
                let sym = self.bloaded_symbol(value)?;
                let v = self
                    .symbol_value(sym)
                    .ok_or_else(|| BloadError::Corrupt("freed symbol".to_string()))?;
                if v.type_code() != kind {
                    return Err(BloadError::Corrupt(format!("symbol {} kind", value)));
                }
                Payload::Value(v)
            }
            TypeCode::INTEGER => Payload::Value(Value::Integer(index(&self.bload.integers, value, "integer")?)),
            TypeCode::FLOAT => Payload::Value(Value::Float(index(&self.bload.floats, value, "float")?)),
            TypeCode::VOID => Payload::Value(Value::Void),
            TypeCode::SF_VARIABLE | TypeCode::MF_VARIABLE => Payload::Variable(self.bloaded_symbol(value)?),
            TypeCode::DEFCLASS_PTR => match self.bloaded_class(value)? {
                Some(class) => Payload::Value(Value::Class(class)),
                None => return Err(BloadError::Corrupt("class reference missing".to_string())),
            },
            TypeCode::MULTIFIELD
            | TypeCode::EXTERNAL_ADDRESS
            | TypeCode::FACT_ADDRESS
            | TypeCode::INSTANCE_ADDRESS => {
                return Err(BloadError::Corrupt(format!("unsaveable {:?} node", kind)))
            }
            _ if value < 0 => Payload::None,
            _ => Payload::Index(value as usize),
        })
    }

    pub(crate) fn bloaded_symbol(&self, value: i64) -> Result<SymbolId, BloadError> {
        index(&self.bload.symbols, value, "symbol")
    }

    /// Expression of the image block; `-1` is none
    pub(crate) fn bloaded_expression(&self, value: i64) -> Result<Option<ExprId>, BloadError> {
        if value == -1 {
            return Ok(None);
        }
        match self.bload.expressions {
            Some((base, count, _)) if (0..count as i64).contains(&value) => {
                Ok(Some(ExprId(base + value as u32)))
            }
            _ => Err(BloadError::Corrupt(format!("expression index {}", value))),
        }
    }

    /// Constraint of the image table; `-1` is none
    pub(crate) fn bloaded_constraint(
        &self,
        value: i64,
    ) -> Result<Option<super::constraint::ConstraintId>, BloadError> {
        if value == -1 {
            return Ok(None);
        }
        self.constraints
            .loaded_id(value)
            .map(Some)
            .ok_or_else(|| BloadError::Corrupt(format!("constraint index {}", value)))
    }

    fn read_constraints(&mut self, input: &mut dyn Read) -> Result<(), BloadError> {
        let count = read_count(input, "constraint")?;
        self.constraints.begin_loaded();
        self.bload.constraints = true;
        self.bload_and_refresh(input, count, CONSTRAINT_RECORD, |env, rec, _| {
            let mut r = Record::new(rec);
            let allowed = TypeSet(r.u32()?);
            let any_allowed = r.u8()? != 0;
            let min_fields = r.i64()?;
            let max_fields = r.i64()?;
            env.constraints.push_loaded(ConstraintRecord {
                any_allowed,
                allowed,
                min_fields,
                max_fields: (max_fields >= 0).then_some(max_fields),
            });
            Ok(())
        })?;
        log::debug!("read {} constraints", count);
        Ok(())
    }

    /// Releases the image's expressions and constraints
    fn release_bloaded_tables(&mut self) {
        if let Some((base, count, refreshed)) = self.bload.expressions.take() {
            for i in 0..refreshed {
                if let Some(node) = self.exprs.get(ExprId(base + i as u32)) {
                    if !image_class(node.value) {
                        self.deinstall_payload(node.value);
                    }
                }
            }
            self.exprs.free_block(base, count);
        }
        if std::mem::take(&mut self.bload.constraints) {
            self.constraints.clear_loaded();
        }
    }

    fn abort_bload(&mut self) {
        log::debug!("aborting binary load");
        self.run_hooks(|b| &b.abort);
        for item in self.bload.items() {
            item.clear(self);
        }
        self.release_bloaded_tables();
        self.bload.clear_scratch();
        self.bload.active = false;
    }

    /// Removes the loaded image; false if some construct type reports
    /// it is still in use, in which case the image stays
    pub fn clear_bload(&mut self) -> bool {
        if !self.bload.active {
            return true;
        }

        let mut busy = Vec::new();
        for hook in &self.bload.ready {
            if !(hook.action)(self) {
                busy.push(hook.name.clone());
            }
        }
        if !busy.is_empty() {
            self.print_error_id(
                "BLOAD",
                5,
                "Some constructs are still in use by the current binary image:",
            );
            for name in &busy {
                self.print_error_line(&format!("   {}", name));
            }
            self.print_error_line("Binary clear cannot continue.");
            return false;
        }

        for item in self.bload.items() {
            item.clear(self);
        }
        self.release_bloaded_tables();
        self.bload.active = false;

        if self.config.reclaim_on_clear {
            self.reclaim();
        }
        log::debug!("binary image cleared");
        true
    }
}

/// Class references inside an image are not counted; the image's
/// classes live exactly as long as its expressions
fn image_class(payload: Payload) -> bool {
    matches!(payload, Payload::Value(Value::Class(_)))
}

/// Scratch table entry for a saved index
fn index<T: Copy>(table: &[T], value: i64, what: &str) -> Result<T, BloadError> {
    usize::try_from(value)
        .ok()
        .and_then(|i| table.get(i).copied())
        .ok_or_else(|| BloadError::Corrupt(format!("{} index {}", what, value)))
}

#[cfg(test)]
mod tests {
    use super::super::bsave::{put_i64, put_u64};
    use super::super::testutil::captured_env;
    use super::*;

    use pretty_assertions::assert_eq;
    use std::cell::{Cell, RefCell};
    use std::io::Cursor;

    /// Header through the atom tables, with no functions or atoms
    fn header() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(BINARY_PREFIX);
        out.extend_from_slice(BINARY_VERSION);
        put_i64(&mut out, 0); // functions
        put_i64(&mut out, 0); // symbols
        put_u64(&mut out, 0);
        put_i64(&mut out, 0); // floats
        put_i64(&mut out, 0); // integers
        out
    }

    /// Smallest loadable image, with `sections` in the storage pass
    fn image(sections: &[u8]) -> Vec<u8> {
        let mut out = header();
        put_i64(&mut out, 0); // expressions
        out.extend_from_slice(sections);
        out.extend_from_slice(BINARY_PREFIX);
        put_i64(&mut out, 0); // constraints
        out.extend_from_slice(BINARY_PREFIX);
        out
    }

    fn load(env: &mut Env, bytes: &[u8]) -> Result<(), BloadError> {
        env.bload_from(&mut Cursor::new(bytes), "test.bin")
    }

    #[test]
    fn corrupt_prefix_is_rejected() {
        let (mut env, sink) = captured_env();
        let mut bytes = image(&[]);
        bytes[..5].copy_from_slice(b"XXXXX");

        assert!(matches!(load(&mut env, &bytes), Err(BloadError::NotBinaryFile(_))));
        assert!(!env.bload_active());
        assert_eq!(sink.text(), "[BLOAD2] File test.bin is not a binary construct file.\n");
    }

    #[test]
    fn rejection_keeps_loaded_image() {
        let (mut env, sink) = captured_env();
        load(&mut env, &image(&[])).unwrap();
        assert!(env.bload_active());

        let mut bytes = image(&[]);
        bytes[TAG_LEN] ^= 0xff;
        assert!(matches!(
            load(&mut env, &bytes),
            Err(BloadError::IncompatibleVersion(_))
        ));
        assert!(env.bload_active());
        assert!(sink.text().starts_with("[BLOAD3]"));
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let (mut env, sink) = captured_env();
        let mut sections = Vec::new();
        sections.extend_from_slice(&section_tag("defwidget"));
        put_u64(&mut sections, 5);
        sections.extend_from_slice(&[9, 9, 9, 9, 9]);
        sections.extend_from_slice(&section_tag("defgadget"));
        put_u64(&mut sections, 0);

        load(&mut env, &image(&sections)).unwrap();
        assert!(env.bload_active());
        assert_eq!(sink.text(), "Skipping defwidget binary data.\n");
    }

    #[test]
    fn unresolved_functions_abort() {
        let (mut env, sink) = captured_env();
        let aborted = Rc::new(Cell::new(0));
        let seen = aborted.clone();
        env.add_abort_bload("count", 0, move |_| seen.set(seen.get() + 1));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(BINARY_PREFIX);
        bytes.extend_from_slice(BINARY_VERSION);
        let names = b"progn\0no-such-fn\0create$\0also-missing\0";
        put_i64(&mut bytes, 4);
        put_u64(&mut bytes, names.len() as u64);
        bytes.extend_from_slice(names);

        match load(&mut env, &bytes) {
            Err(BloadError::UnresolvedFunctions(names)) => {
                assert_eq!(names, vec!["no-such-fn", "also-missing"])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(aborted.get(), 1);
        assert!(!env.bload_active());
        assert_eq!(
            sink.text(),
            "[BLOAD6] The following undefined functions are referenced by this binary image:\n   no-such-fn\n   also-missing\n"
        );
    }

    #[test]
    fn hooks_run_in_priority_order() {
        let mut env = Env::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (name, priority) in [("low", -5), ("high", 10)] {
            let before = order.clone();
            env.add_before_bload(name, priority, move |env| {
                assert!(env.clear_in_progress());
                before.borrow_mut().push(format!("before-{}", name));
            });
            let after = order.clone();
            env.add_after_bload(name, priority, move |env| {
                assert!(!env.clear_in_progress());
                after.borrow_mut().push(format!("after-{}", name));
            });
        }
        assert!(!env.add_after_bload("low", 0, |_| {}));

        load(&mut env, &image(&[])).unwrap();
        assert_eq!(
            *order.borrow(),
            vec!["before-high", "before-low", "after-high", "after-low"]
        );
    }

    #[test]
    fn clear_refusal_keeps_image() {
        let (mut env, sink) = captured_env();
        let busy = Rc::new(Cell::new(true));
        let flag = busy.clone();
        env.add_clear_bload_ready("defwidget", 0, move |_| !flag.get());
        load(&mut env, &image(&[])).unwrap();

        assert!(matches!(load(&mut env, &image(&[])), Err(BloadError::ClearRefused)));
        assert!(env.bload_active());
        assert_eq!(
            sink.text(),
            "[BLOAD5] Some constructs are still in use by the current binary image:\n   defwidget\nBinary clear cannot continue.\n"
        );

        busy.set(false);
        assert!(env.clear_bload());
        assert!(!env.bload_active());
    }

    #[test]
    fn batches_halve_until_they_fit() {
        let mut env = Env::new();
        let records: Vec<u8> = (0..10u8).flat_map(|n| [n; 4]).collect();
        env.set_scratch_limit(Some(12));

        let seen = RefCell::new(Vec::new());
        env.bload_and_refresh(&mut Cursor::new(records), 10, 4, |_, rec, i| {
            assert_eq!(rec, [i as u8; 4]);
            seen.borrow_mut().push(i);
            Ok(())
        })
        .unwrap();
        assert_eq!(*seen.borrow(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn one_record_must_fit() {
        let mut env = Env::new();
        env.set_scratch_limit(Some(3));
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        env.set_out_of_memory_handler(Some(Rc::new(move |_: &mut Env, bytes: usize| {
            assert_eq!(bytes, 4);
            seen.set(seen.get() + 1);
            false
        })));

        let records = vec![0u8; 8];
        let result = env.bload_and_refresh(&mut Cursor::new(records), 2, 4, |_, _, _| Ok(()));
        assert!(matches!(result, Err(BloadError::OutOfMemory)));
        // only the final failure reaches the handler
        assert_eq!(calls.get(), 1);
        assert!(env.memory.oom.is_some());
    }

    #[test]
    fn truncated_image_aborts() {
        let (mut env, sink) = captured_env();
        let live = env.exprs.live();
        let mut bytes = header();
        put_i64(&mut bytes, 3); // expressions, none follow

        assert!(matches!(load(&mut env, &bytes), Err(BloadError::Io(_))));
        assert!(!env.bload_active());
        assert_eq!(env.exprs.live(), live);
        assert!(sink.text().starts_with("[BLOAD4] Binary load of test.bin aborted"));
    }

    #[test]
    fn halt_stops_section_reading() {
        let mut env = Env::new();
        env.add_before_bload("stop", 0, |env| env.set_halt_execution(true));
        assert!(matches!(load(&mut env, &image(&[])), Err(BloadError::Halted)));
        assert!(!env.bload_active());
    }

    #[test]
    fn earlier_halt_does_not_block_loading() {
        let mut env = Env::new();
        env.set_evaluation_error(true);
        assert!(env.halt_execution());
        load(&mut env, &image(&[])).unwrap();
        assert!(env.bload_active());
        assert!(!env.evaluation_error());

        env.set_halt_execution(true);
        load(&mut env, &image(&[])).unwrap();
        assert!(env.bload_active());
    }

    #[test]
    fn missing_file_reports_open_failure() {
        let (mut env, sink) = captured_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.bin");
        assert!(!env.bload(&path));
        assert!(sink.text().starts_with("[BLOAD1] Unable to open file"));
    }
}
