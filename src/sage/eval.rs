// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/eval.rs

// Generic expression evaluator. Dispatches on node kind, invokes
// functions through an argument cursor, resolves variables, and
// maintains the procedure parameter stack used by message handlers.

// <>

use super::core::Value;
use super::expr::{ExprId, ExprNode, Payload};
use super::func::FunctionId;
use super::primtab::PrimitiveType;
use super::symtab::SymbolId;
use super::types::TypeCode;
use super::{ControlSignal, Env};

/// Evaluator registers: error flag, control signal, and the context
/// of the running function
#[derive(Default)]
pub struct EvalState {
    pub(crate) error: bool,
    pub(crate) control: ControlSignal,
    pub(crate) current_expression: Option<ExprId>,
    pub(crate) current_function: Option<FunctionId>,
    pub(crate) depth: usize,
    frames: Vec<ProcFrame>,
    bindings: Vec<Vec<(SymbolId, Value)>>,
}

/// Parameter array of one active procedure (message or handler call)
struct ProcFrame {
    name: String,
    params: Vec<Value>,
}

/// Argument cursor handed to a function callback
///
/// Tracks the next unconsumed argument expression and the 1-based
/// position of the last one consumed
pub struct Call {
    function: FunctionId,
    expr: ExprId,
    next: Option<ExprId>,
    position: usize,
}

impl Call {
    pub(crate) fn new(function: FunctionId, expr: ExprId, args: Option<ExprId>) -> Self {
        Self {
            function,
            expr,
            next: args,
            position: 0,
        }
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// The call node being evaluated
    pub fn expression(&self) -> ExprId {
        self.expr
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Total number of arguments, consumed or not
    pub fn arg_count(&self, env: &Env) -> usize {
        let args = env.exprs.get(self.expr).and_then(|n| n.arg_list);
        env.count_siblings(args)
    }

    /// Advances past the next argument without evaluating it
    pub fn next_expr(&mut self, env: &Env) -> Option<ExprId> {
        let id = self.next?;
        self.next = env.exprs.get(id).and_then(|n| n.next_arg);
        self.position += 1;
        Some(id)
    }

    /// Skips `n` arguments without evaluating them
    pub fn skip(&mut self, env: &Env, n: usize) {
        for _ in 0..n {
            if self.next_expr(env).is_none() {
                break;
            }
        }
    }

    /// Head of the unconsumed argument list
    pub fn remaining(&self) -> Option<ExprId> {
        self.next
    }

    pub fn next_arg(&mut self, env: &mut Env) -> Option<Value> {
        let id = self.next_expr(env)?;
        Some(env.evaluate(id))
    }

    /// Evaluates every remaining argument, stopping at an error
    pub fn rest(&mut self, env: &mut Env) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(v) = self.next_arg(env) {
            if env.evaluation_error() {
                break;
            }
            out.push(v);
        }
        out
    }

    pub fn next_integer(&mut self, env: &mut Env) -> Option<i64> {
        let v = self.next_arg(env)?;
        match env.as_integer(v) {
            Some(n) => Some(n),
            None => self.type_error(env, "integer"),
        }
    }

    pub fn next_float(&mut self, env: &mut Env) -> Option<f64> {
        let v = self.next_arg(env)?;
        match env.as_float(v) {
            Some(x) => Some(x),
            None => self.type_error(env, "float"),
        }
    }

    pub fn next_number(&mut self, env: &mut Env) -> Option<f64> {
        let v = self.next_arg(env)?;
        match env.as_number(v) {
            Some(x) => Some(x),
            None => self.type_error(env, "integer or float"),
        }
    }

    /// Next argument as a symbol or string
    pub fn next_lexeme(&mut self, env: &mut Env) -> Option<SymbolId> {
        match self.next_arg(env)? {
            Value::Symbol(id) | Value::String(id) => Some(id),
            _ => self.type_error(env, "symbol or string"),
        }
    }

    fn type_error<T>(&self, env: &mut Env, expected: &str) -> Option<T> {
        if env.evaluation_error() {
            return None;
        }
        let name = env.function_name(self.function).unwrap_or("?").to_string();
        env.print_error_id(
            "ARGACCES",
            2,
            &format!(
                "Function {} expected argument #{} to be of type {}.",
                name, self.position, expected
            ),
        );
        env.set_evaluation_error(true);
        None
    }
}

impl Env {
    /// Evaluates an expression node
    ///
    /// Errors are reported through the evaluation error flag; the
    /// returned value is then `FALSE` by convention
    pub fn evaluate(&mut self, expr: ExprId) -> Value {
        let node = match self.exprs.get(expr) {
            Some(node) => node,
            None => self.system_error("EVALUATN", 4, "evaluation of a freed expression"),
        };

        match node.kind {
            TypeCode::FCALL => self.call_function(expr, &node),
            TypeCode::SF_VARIABLE | TypeCode::MF_VARIABLE => self.resolve_variable(&node),
            kind if kind.is_constant() || kind == TypeCode::MULTIFIELD => match node.value {
                Payload::Value(v) => v,
                _ => self.system_error("EVALUATN", 2, "constant node without a value"),
            },
            _ => self.evaluate_primitive(&node),
        }
    }

    fn evaluate_primitive(&mut self, node: &ExprNode) -> Value {
        let entry = match self.primitives.get(node.kind) {
            Some(entry) => entry,
            None => self.system_error(
                "EVALUATN",
                3,
                &format!("no primitive type entry for {:?}", node.kind),
            ),
        };

        if entry.copy_to_evaluate() {
            return match node.value {
                Payload::Value(v) => v,
                _ => Value::Void,
            };
        }

        match entry.evaluate(self, node) {
            Some(v) => v,
            None => self.system_error(
                "EVALUATN",
                3,
                &format!("primitive type {} cannot be evaluated", entry.name()),
            ),
        }
    }

    fn call_function(&mut self, expr: ExprId, node: &ExprNode) -> Value {
        let id = match node.value {
            Payload::Function(id) => id,
            _ => self.system_error("EVALUATN", 2, "function call node without a function"),
        };
        let def = match self.functions.get(id) {
            Some(def) => def,
            None => self.system_error("EVALUATN", 2, "call of an unregistered function"),
        };

        let argc = self.count_siblings(node.arg_list);
        let too_few = argc < def.min_args as usize;
        let too_many = def.max_args.is_some_and(|max| argc > max as usize);
        if too_few || too_many {
            let (bound, n) = if too_few {
                ("at least", def.min_args)
            } else {
                ("no more than", def.max_args.unwrap_or(0))
            };
            self.print_error_id(
                "ARGACCES",
                1,
                &format!("Function {} expected {} {} argument(s).", def.name, bound, n),
            );
            self.set_evaluation_error(true);
            return self.false_value();
        }

        let saved = (self.eval.current_function, self.eval.current_expression);
        let result = {
            let mut env = self.scoped(move |env| {
                env.eval.current_function = saved.0;
                env.eval.current_expression = saved.1;
                env.eval.depth -= 1;
            });
            env.eval.current_function = Some(id);
            env.eval.current_expression = Some(expr);
            env.eval.depth += 1;

            let mut call = Call::new(id, expr, node.arg_list);
            (def.callback)(&mut *env, &mut call)
        };

        // the result is held while tasks may sweep
        self.install_value(result);
        self.run_periodic_tasks();
        self.finish_deferred_reclaim();
        self.deinstall_value(result);
        result
    }

    fn resolve_variable(&mut self, node: &ExprNode) -> Value {
        let sym = match node.value {
            Payload::Variable(sym) => sym,
            _ => self.system_error("EVALUATN", 2, "variable node without a name"),
        };

        if let Some(v) = self.lookup_binding(sym) {
            return v;
        }

        let name = self.symbol_text(sym).unwrap_or("?").to_string();
        self.print_error_id("EVALUATN", 1, &format!("Variable ?{} is unbound.", name));
        self.set_evaluation_error(true);
        self.false_value()
    }

    pub(crate) fn count_siblings(&self, mut cursor: Option<ExprId>) -> usize {
        let mut n = 0;
        while let Some(id) = cursor {
            n += 1;
            cursor = self.exprs.get(id).and_then(|node| node.next_arg);
        }
        n
    }

    /// Expression whose function is currently running
    pub fn current_expression(&self) -> Option<ExprId> {
        self.eval.current_expression
    }

    /// Nesting depth of function calls in progress
    pub fn evaluation_depth(&self) -> usize {
        self.eval.depth
    }

    pub fn push_bindings(&mut self) {
        self.eval.bindings.push(Vec::new());
    }

    /// Drops the top binding frame, releasing its values
    pub fn pop_bindings(&mut self) {
        if let Some(frame) = self.eval.bindings.pop() {
            for (_, v) in frame {
                self.deinstall_value(v);
            }
        }
    }

    /// Binds a variable in the top frame; fails with no frame active
    pub fn bind(&mut self, name: SymbolId, value: Value) -> bool {
        self.install_value(value);
        let old = match self.eval.bindings.last_mut() {
            Some(frame) => match frame.iter_mut().find(|(n, _)| *n == name) {
                Some(slot) => Some(std::mem::replace(&mut slot.1, value)),
                None => {
                    frame.push((name, value));
                    None
                }
            },
            None => {
                self.deinstall_value(value);
                return false;
            }
        };
        if let Some(old) = old {
            self.deinstall_value(old);
        }
        true
    }

    /// Removes a binding from the top frame
    pub fn unbind(&mut self, name: SymbolId) -> bool {
        let old = self.eval.bindings.last_mut().and_then(|frame| {
            let pos = frame.iter().position(|(n, _)| *n == name)?;
            Some(frame.remove(pos).1)
        });
        match old {
            Some(v) => {
                self.deinstall_value(v);
                true
            }
            None => false,
        }
    }

    pub fn lookup_binding(&self, name: SymbolId) -> Option<Value> {
        self.eval
            .bindings
            .last()?
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    /// Pushes a parameter array, installing every value
    pub fn push_proc_parameters(&mut self, name: &str, params: Vec<Value>) {
        for v in &params {
            self.install_value(*v);
        }
        self.eval.frames.push(ProcFrame {
            name: name.to_string(),
            params,
        });
    }

    /// Evaluates an argument list into a new parameter array; on error
    /// nothing is pushed
    pub fn push_proc_arguments(&mut self, name: &str, args: Option<ExprId>) -> bool {
        let mut params = Vec::new();
        let mut cursor = args;
        while let Some(id) = cursor {
            let v = self.evaluate(id);
            if self.evaluation_error() {
                return false;
            }
            // held across later argument evaluations
            self.install_value(v);
            params.push(v);
            cursor = self.exprs.get(id).and_then(|n| n.next_arg);
        }
        for v in &params {
            self.deinstall_value(*v);
        }
        self.push_proc_parameters(name, params);
        true
    }

    pub fn pop_proc_parameters(&mut self) {
        if let Some(frame) = self.eval.frames.pop() {
            for v in frame.params {
                self.deinstall_value(v);
            }
        }
    }

    pub fn proc_parameter(&self, index: usize) -> Option<Value> {
        self.eval.frames.last()?.params.get(index).copied()
    }

    pub fn proc_parameters(&self) -> &[Value] {
        self.eval.frames.last().map_or(&[], |f| f.params.as_slice())
    }

    pub fn proc_name(&self) -> Option<&str> {
        self.eval.frames.last().map(|f| f.name.as_str())
    }

    /// Runs an action list in a fresh binding frame
    ///
    /// Stops at the first control signal; a `Return` is consumed here.
    /// The value of the last action run is the result
    pub fn evaluate_actions(&mut self, actions: Option<ExprId>) -> Value {
        let mut env = self.scoped(|env| env.pop_bindings());
        env.push_bindings();

        let mut result = env.false_value();
        let mut cursor = actions;
        while let Some(id) = cursor {
            result = env.evaluate(id);
            if env.control() != ControlSignal::None {
                break;
            }
            cursor = env.exprs.get(id).and_then(|n| n.next_arg);
        }

        if env.control() == ControlSignal::Return {
            env.set_control(ControlSignal::None);
        }
        if env.evaluation_error() {
            result = env.false_value();
        }
        result
    }
}

/// `PROC_PARAM` nodes read one slot of the active parameter array
pub(crate) struct ParamPrimitive;

impl PrimitiveType for ParamPrimitive {
    fn name(&self) -> &str {
        "PROC-PARAM"
    }

    fn evaluate(&self, env: &mut Env, node: &ExprNode) -> Option<Value> {
        let Payload::Index(index) = node.value else {
            return None;
        };
        match env.proc_parameter(index) {
            Some(v) => Some(v),
            None => {
                env.print_error_id(
                    "PRCCODE",
                    1,
                    &format!("Parameter #{} is not available.", index),
                );
                env.set_evaluation_error(true);
                Some(env.false_value())
            }
        }
    }
}

/// `PROC_WILD_PARAM` nodes gather the trailing parameters
pub(crate) struct WildParamPrimitive;

impl PrimitiveType for WildParamPrimitive {
    fn name(&self) -> &str {
        "PROC-WILD-PARAM"
    }

    fn evaluate(&self, env: &mut Env, node: &ExprNode) -> Option<Value> {
        let Payload::Index(index) = node.value else {
            return None;
        };
        let rest = env.proc_parameters().get(index..).unwrap_or(&[]).to_vec();
        Some(env.create_multifield(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::captured_env;
    use super::*;

    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn constants_evaluate_to_themselves() {
        let mut env = Env::new();
        for v in [env.integer(3), env.float(1.5), env.string("s"), Value::Void] {
            let e = env.constant(v);
            assert_eq!(env.evaluate(e), v);
        }
    }

    #[test]
    fn call_context_is_restored() {
        let mut env = Env::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        env.define_function("probe", 0, None, move |env, call| {
            log.borrow_mut().push((env.current_function(), env.evaluation_depth()));
            call.rest(env);
            env.true_value()
        });

        let inner = env.function_call("probe", &[]).unwrap();
        let outer = env.function_call("probe", &[inner]).unwrap();
        assert_eq!(env.evaluate(outer), env.true_value());

        let probe = env.find_function("probe");
        assert_eq!(*seen.borrow(), vec![(probe, 1), (probe, 2)]);
        assert_eq!(env.current_function(), None);
        assert_eq!(env.current_expression(), None);
        assert_eq!(env.evaluation_depth(), 0);
    }

    #[test]
    fn arity_is_checked() {
        let (mut env, sink) = captured_env();
        env.define_function("one", 1, Some(1), |env, call| {
            call.next_arg(env).unwrap_or(Value::Void)
        });
        let call = env.function_call("one", &[]).unwrap();
        let out = env.evaluate(call);

        assert!(env.is_false(out));
        assert!(env.evaluation_error());
        assert_eq!(
            sink.text(),
            "[ARGACCES1] Function one expected at least 1 argument(s).\n"
        );
    }

    #[test]
    fn typed_arguments_report_position() {
        let (mut env, sink) = captured_env();
        env.define_function("twice", 1, Some(1), |env, call| match call.next_integer(env) {
            Some(n) => env.integer(n * 2),
            None => env.false_value(),
        });

        let s = env.symbol("x");
        let arg = env.constant(s);
        let call = env.function_call("twice", &[arg]).unwrap();
        env.evaluate(call);
        assert!(sink
            .text()
            .contains("Function twice expected argument #1 to be of type integer."));

        env.clear_errors();
        let seven = env.integer(7);
        let arg = env.constant(seven);
        let call = env.function_call("twice", &[arg]).unwrap();
        let out = env.evaluate(call);
        assert_eq!(env.as_integer(out), Some(14));
    }

    #[test]
    fn unbound_variables() {
        let (mut env, sink) = captured_env();
        let var = env.variable("x");
        let out = env.evaluate(var);

        assert!(env.is_false(out));
        assert!(env.evaluation_error());
        assert!(env.halt_execution());
        assert_eq!(sink.text(), "[EVALUATN1] Variable ?x is unbound.\n");
    }

    #[test]
    fn bound_variables() {
        let mut env = Env::new();
        let x = env.intern("x");
        let five = env.integer(5);
        env.push_bindings();
        assert!(env.bind(x, five));
        assert_eq!(env.busy_count(five), 1);

        let var = env.variable("x");
        assert_eq!(env.evaluate(var), five);

        env.pop_bindings();
        assert_eq!(env.busy_count(five), 0);
        assert!(!env.bind(x, five));
    }

    #[test]
    fn parameters_and_wildcards() {
        let mut env = Env::new();
        let vals: Vec<Value> = (1..=3).map(|n| env.integer(n)).collect();
        env.push_proc_parameters("test", vals.clone());
        assert_eq!(env.busy_count(vals[0]), 1);

        let p = env.parameter(1);
        assert_eq!(env.evaluate(p), vals[1]);

        let w = env.wild_parameter(1);
        let rest = env.evaluate(w);
        assert_eq!(env.multifield_fields(rest).unwrap(), &vals[1..]);

        env.pop_proc_parameters();
        assert_eq!(env.busy_count(vals[0]), 0);
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let (mut env, sink) = captured_env();
        let p = env.parameter(0);
        let out = env.evaluate(p);
        assert!(env.is_false(out));
        assert!(env.evaluation_error());
        assert!(sink.text().starts_with("[PRCCODE1]"));
    }

    #[test]
    fn actions_stop_on_return() {
        let mut env = Env::new();
        let hits = Rc::new(RefCell::new(0));
        let counter = hits.clone();
        env.define_function("tick", 0, Some(0), move |env, _| {
            *counter.borrow_mut() += 1;
            env.true_value()
        });

        let first = env.function_call("tick", &[]).unwrap();
        let nine = env.integer(9);
        let nine_expr = env.constant(nine);
        let ret = env.function_call("return", &[nine_expr]).unwrap();
        let last = env.function_call("tick", &[]).unwrap();
        let actions = env.link_expressions(&[first, ret, last]);

        let out = env.evaluate_actions(actions);
        assert_eq!(out, nine);
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(env.control(), ControlSignal::None);
    }

    #[test]
    fn actions_stop_on_halt() {
        let mut env = Env::new();
        let halt = env.function_call("halt", &[]).unwrap();
        let one = env.integer(1);
        let after = env.constant(one);
        let actions = env.link_expressions(&[halt, after]);

        let out = env.evaluate_actions(actions);
        assert_eq!(out, Value::Void);
        assert!(env.halt_execution());
        assert!(!env.evaluation_error());
    }
}
