// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/expr.rs

// Expression arena. Nodes refer to their argument list and their
// next sibling by ID, so a loaded image can resolve stored indices
// directly into a contiguous block of nodes.

// <>

use super::core::Value;
use super::func::FunctionId;
use super::symtab::SymbolId;
use super::types::TypeCode;
use super::Env;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub(crate) u32);

/// Kind-specific contents of an expression node
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Payload {
    None,
    /// Constants and multifield literals
    Value(Value),
    Function(FunctionId),
    /// Name of a bound variable
    Variable(SymbolId),
    /// Parameter positions and host-defined data
    Index(usize),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExprNode {
    pub kind: TypeCode,
    pub value: Payload,
    /// First argument; the node owns its argument list
    pub arg_list: Option<ExprId>,
    /// Next sibling within the enclosing argument list
    pub next_arg: Option<ExprId>,
}

impl ExprNode {
    pub fn new(kind: TypeCode, value: Payload) -> Self {
        Self {
            kind,
            value,
            arg_list: None,
            next_arg: None,
        }
    }
}

#[derive(Default)]
pub struct ExprArena {
    nodes: Vec<Option<ExprNode>>,
    free: Vec<u32>,
}

impl ExprArena {
    pub fn get(&self, id: ExprId) -> Option<ExprNode> {
        self.nodes.get(id.0 as usize).copied().flatten()
    }

    fn alloc(&mut self, node: ExprNode) -> ExprId {
        match self.free.pop() {
            Some(i) => {
                self.nodes[i as usize] = Some(node);
                ExprId(i)
            }
            None => {
                self.nodes.push(Some(node));
                ExprId((self.nodes.len() - 1) as u32)
            }
        }
    }

    /// Reserves `count` contiguous placeholder nodes at the end of the
    /// arena, returning the first index
    pub(crate) fn alloc_block(&mut self, count: usize) -> u32 {
        let base = self.nodes.len() as u32;
        let placeholder = ExprNode::new(TypeCode::VOID, Payload::Value(Value::Void));
        self.nodes.resize(self.nodes.len() + count, Some(placeholder));
        base
    }

    pub(crate) fn set(&mut self, id: ExprId, node: ExprNode) {
        if let Some(slot) = self.nodes.get_mut(id.0 as usize) {
            *slot = Some(node);
        }
    }

    pub(crate) fn free_block(&mut self, base: u32, count: usize) {
        let end = base as usize + count;
        if end == self.nodes.len() {
            self.nodes.truncate(base as usize);
            self.free.retain(|i| *i < base);
        } else {
            for i in base as usize..end.min(self.nodes.len()) {
                self.nodes[i] = None;
                self.free.push(i as u32);
            }
        }
    }

    fn free_node(&mut self, id: ExprId) {
        if let Some(slot) = self.nodes.get_mut(id.0 as usize) {
            if slot.take().is_some() {
                self.free.push(id.0);
            }
        }
    }

    pub fn live(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }
}

impl Env {
    /// Creates a node of any kind with an already linked argument list
    pub fn expression(&mut self, kind: TypeCode, value: Payload, args: Option<ExprId>) -> ExprId {
        let mut node = ExprNode::new(kind, value);
        node.arg_list = args;
        self.exprs.alloc(node)
    }

    pub fn constant(&mut self, value: Value) -> ExprId {
        self.expression(value.type_code(), Payload::Value(value), None)
    }

    /// Call of a registered function; `None` if no such function
    pub fn function_call(&mut self, name: &str, args: &[ExprId]) -> Option<ExprId> {
        let function = self.find_function(name)?;
        let args = self.link_expressions(args);
        Some(self.expression(TypeCode::FCALL, Payload::Function(function), args))
    }

    pub fn variable(&mut self, name: &str) -> ExprId {
        let sym = self.intern(name);
        self.expression(TypeCode::SF_VARIABLE, Payload::Variable(sym), None)
    }

    /// Reference to procedure parameter `index`; zero is `?self`
    pub fn parameter(&mut self, index: usize) -> ExprId {
        self.expression(TypeCode::PROC_PARAM, Payload::Index(index), None)
    }

    /// All procedure parameters from `index` on, as a multifield
    pub fn wild_parameter(&mut self, index: usize) -> ExprId {
        self.expression(TypeCode::PROC_WILD_PARAM, Payload::Index(index), None)
    }

    /// Chains expressions through their sibling links, returning the
    /// head of the list
    pub fn link_expressions(&mut self, exprs: &[ExprId]) -> Option<ExprId> {
        for pair in exprs.windows(2) {
            if let Some(mut node) = self.exprs.get(pair[0]) {
                node.next_arg = Some(pair[1]);
                self.exprs.set(pair[0], node);
            }
        }
        exprs.first().copied()
    }

    pub fn expression_node(&self, id: ExprId) -> Option<ExprNode> {
        self.exprs.get(id)
    }

    /// Every node reachable from `root`: its arguments, and its
    /// siblings with theirs
    pub(crate) fn expression_nodes(&self, root: ExprId) -> Vec<ExprId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.exprs.get(id) else {
                continue;
            };
            out.push(id);
            if let Some(next) = node.next_arg {
                stack.push(next);
            }
            if let Some(arg) = node.arg_list {
                stack.push(arg);
            }
        }
        out
    }

    pub fn expression_count(&self, root: ExprId) -> usize {
        self.expression_nodes(root).len()
    }

    pub(crate) fn install_payload(&mut self, value: Payload) {
        match value {
            Payload::Value(v) => self.install_value(v),
            Payload::Variable(sym) => {
                if let Some(v) = self.symbol_value(sym) {
                    self.install_value(v);
                }
            }
            Payload::None | Payload::Function(_) | Payload::Index(_) => {}
        }
    }

    pub(crate) fn deinstall_payload(&mut self, value: Payload) {
        match value {
            Payload::Value(v) => self.deinstall_value(v),
            Payload::Variable(sym) => {
                if let Some(v) = self.symbol_value(sym) {
                    self.deinstall_value(v);
                }
            }
            Payload::None | Payload::Function(_) | Payload::Index(_) => {}
        }
    }

    /// Installs every atom an expression list refers to
    pub fn install_expression(&mut self, root: ExprId) {
        for id in self.expression_nodes(root) {
            if let Some(node) = self.exprs.get(id) {
                self.install_payload(node.value);
            }
        }
    }

    pub fn deinstall_expression(&mut self, root: ExprId) {
        for id in self.expression_nodes(root) {
            if let Some(node) = self.exprs.get(id) {
                self.deinstall_payload(node.value);
            }
        }
    }

    /// Frees the nodes of an expression list without touching counts
    pub fn release_expression(&mut self, root: ExprId) {
        for id in self.expression_nodes(root) {
            self.exprs.free_node(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_walks_args_and_siblings() {
        let mut env = Env::new();
        let a = env.symbol("a");
        let b = env.string("b");
        let ca = env.constant(a);
        let cb = env.constant(b);
        let call = env.function_call("create$", &[ca, cb]).unwrap();
        let tail = env.constant(a);
        let list = env.link_expressions(&[call, tail]).unwrap();

        assert_eq!(env.expression_count(list), 4);

        env.install_expression(list);
        assert_eq!(env.busy_count(a), 2);
        assert_eq!(env.busy_count(b), 1);

        env.deinstall_expression(list);
        assert_eq!(env.busy_count(a), 0);

        let before = env.exprs.live();
        env.release_expression(list);
        assert_eq!(env.exprs.live(), before - 4);
    }

    #[test]
    fn unknown_functions_do_not_build() {
        let mut env = Env::new();
        assert!(env.function_call("no-such-function", &[]).is_none());
    }

    #[test]
    fn blocks_are_contiguous_and_freeable() {
        let mut env = Env::new();
        let lone = env.constant(Value::Void);
        let base = env.exprs.alloc_block(3);
        assert_eq!(base, lone.0 + 1);
        assert!(env.exprs.get(ExprId(base + 2)).is_some());

        env.exprs.free_block(base, 3);
        assert!(env.exprs.get(ExprId(base)).is_none());
        assert!(env.exprs.get(lone).is_some());
    }
}
