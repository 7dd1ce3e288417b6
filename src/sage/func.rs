// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/func.rs

// Registry of callable functions, in registration order.

// <>

use super::core::Value;
use super::eval::Call;
use super::Env;

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

/// Native procedure signature usable in constant tables
pub type NativeFn = fn(&mut Env, &mut Call) -> Value;

pub type Callback = Rc<dyn Fn(&mut Env, &mut Call) -> Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub(crate) u32);

pub struct FunctionDef {
    pub name: String,
    pub callback: Callback,
    pub min_args: u16,
    /// `None` accepts any number of arguments
    pub max_args: Option<u16>,
    /// Host data visible to the callback while it runs
    pub context: Option<Rc<dyn Any>>,
}

#[derive(Default)]
pub struct FunctionRegistry {
    defs: Vec<Rc<FunctionDef>>,
    by_name: HashMap<String, FunctionId>,
}

impl FunctionRegistry {
    pub fn get(&self, id: FunctionId) -> Option<Rc<FunctionDef>> {
        self.defs.get(id.0 as usize).cloned()
    }

    pub fn find(&self, name: &str) -> Option<FunctionId> {
        self.by_name.get(name).copied()
    }

    /// Linear search by name starting at position `start` and wrapping
    /// around; names read in registration order resolve in one pass
    pub fn find_from(&self, name: &str, start: usize) -> Option<FunctionId> {
        let len = self.defs.len();
        (0..len)
            .map(|k| (start + k) % len)
            .find(|i| self.defs[*i].name == name)
            .map(|i| FunctionId(i as u32))
    }

    pub fn name(&self, id: FunctionId) -> Option<&str> {
        self.defs.get(id.0 as usize).map(|d| d.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

impl Env {
    /// Registers a function; `None` if the name is taken
    pub fn define_function(
        &mut self,
        name: &str,
        min_args: u16,
        max_args: Option<u16>,
        callback: impl Fn(&mut Env, &mut Call) -> Value + 'static,
    ) -> Option<FunctionId> {
        self.define_function_with_context(name, min_args, max_args, callback, None)
    }

    pub fn define_function_with_context(
        &mut self,
        name: &str,
        min_args: u16,
        max_args: Option<u16>,
        callback: impl Fn(&mut Env, &mut Call) -> Value + 'static,
        context: Option<Rc<dyn Any>>,
    ) -> Option<FunctionId> {
        if self.functions.by_name.contains_key(name) {
            return None;
        }

        let id = FunctionId(self.functions.defs.len() as u32);
        self.functions.defs.push(Rc::new(FunctionDef {
            name: name.to_string(),
            callback: Rc::new(callback),
            min_args,
            max_args,
            context,
        }));
        self.functions.by_name.insert(name.to_string(), id);
        log::trace!("defined function {}", name);
        Some(id)
    }

    pub fn find_function(&self, name: &str) -> Option<FunctionId> {
        self.functions.find(name)
    }

    pub fn function_name(&self, id: FunctionId) -> Option<&str> {
        self.functions.name(id)
    }

    /// Function whose callback is currently running
    pub fn current_function(&self) -> Option<FunctionId> {
        self.eval.current_function
    }

    /// Host data of the running function
    pub fn function_context(&self) -> Option<Rc<dyn Any>> {
        let id = self.eval.current_function?;
        self.functions.get(id)?.context.clone()
    }
}
