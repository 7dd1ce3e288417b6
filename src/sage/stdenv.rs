// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/stdenv.rs

// Native functions every environment starts with: message passing
// entry points, direct slot access for handlers, variable binding,
// control flow, and external address construction.

// <>

use super::core::Value;
use super::eval::Call;
use super::expr::Payload;
use super::func::NativeFn;
use super::{ControlSignal, Env};

/// Generates a constant table of native functions with their names
/// and argument bounds
///
/// Each entry reads `"name" min max { body }`, where `max` is a
/// literal or `*` for no upper bound. The body sees the environment
/// and the argument cursor under the two names given after the table
/// name, and must produce a value.
macro_rules! sage_fn {
    (@max *) => { None };
    (@max $max:literal) => { Some($max) };

    ( const $array:ident; $env:ident $call:ident;
      $( $name:literal $min:literal $max:tt $body:block )+
    ) => {
        #[allow(unused_variables)]
        pub const $array: &[(&str, NativeFn, u16, Option<u16>)] =
            &[$(($name, |$env: &mut Env, $call: &mut Call| -> Value { $body },
                 $min, sage_fn!(@max $max))),+];
    };
}

sage_fn! {
    const ENVFNS;
    env call;

    "send" 2 * {
        let Some(receiver) = call.next_arg(env) else {
            return env.false_value();
        };
        if env.evaluation_error() {
            return env.false_value();
        }
        // held while the message name and arguments evaluate
        env.install_value(receiver);
        let message = call.next_arg(env);
        env.deinstall_value(receiver);

        match message {
            Some(Value::Symbol(message)) if !env.evaluation_error() => {
                let args = call.remaining();
                env.send_message(receiver, message, args)
            }
            Some(_) if !env.evaluation_error() => {
                env.print_error_id(
                    "ARGACCES",
                    2,
                    "Function send expected argument #2 to be of type symbol.",
                );
                env.set_evaluation_error(true);
                env.false_value()
            }
            _ => env.false_value(),
        }
    }

    "call-next-handler" 0 0 {
        env.call_next_handler(None)
    }

    "override-next-handler" 0 * {
        let args = call.rest(env);
        if env.evaluation_error() {
            return env.false_value();
        }
        for v in &args {
            env.install_value(*v);
        }
        let result = env.call_next_handler(Some(args.clone()));
        for v in args {
            env.deinstall_value(v);
        }
        result
    }

    "next-handlerp" 0 0 {
        let available = env.next_handler_available();
        env.boolean(available)
    }

    "dynamic-get" 1 1 {
        let Some(slot) = call.next_lexeme(env) else {
            return env.false_value();
        };
        match env.active_slot(slot, "dynamic-get") {
            Some((id, index)) => env
                .classes
                .instance(id)
                .and_then(|i| i.slots.get(index).copied())
                .unwrap_or(Value::Void),
            None => env.false_value(),
        }
    }

    "dynamic-put" 1 * {
        let Some(slot) = call.next_lexeme(env) else {
            return env.false_value();
        };
        let mut values = call.rest(env);
        if env.evaluation_error() {
            return env.false_value();
        }
        let value = match values.len() {
            1 => values.remove(0),
            _ => env.create_multifield(values),
        };

        let Some((id, index)) = env.active_slot(slot, "dynamic-put") else {
            return env.false_value();
        };
        if !env.slot_accepts(id, index, value, "dynamic-put") {
            return env.false_value();
        }
        env.put_instance_slot(id, index, value);
        value
    }

    "bind" 1 * {
        let name = match call.next_expr(env).and_then(|e| env.expression_node(e)) {
            Some(node) => match node.value {
                Payload::Variable(sym) => sym,
                _ => {
                    env.print_error_id(
                        "ARGACCES",
                        2,
                        "Function bind expected argument #1 to be of type variable.",
                    );
                    env.set_evaluation_error(true);
                    return env.false_value();
                }
            },
            None => return env.false_value(),
        };

        let mut values = call.rest(env);
        if env.evaluation_error() {
            return env.false_value();
        }
        match values.len() {
            0 => {
                env.unbind(name);
                env.false_value()
            }
            1 => {
                let v = values.remove(0);
                env.bind(name, v);
                v
            }
            _ => {
                let v = env.create_multifield(values);
                env.bind(name, v);
                v
            }
        }
    }

    "return" 0 1 {
        let value = call.next_arg(env).unwrap_or(Value::Void);
        env.set_control(ControlSignal::Return);
        value
    }

    "halt" 0 0 {
        env.set_halt_execution(true);
        Value::Void
    }

    "progn" 0 * {
        let mut result = env.false_value();
        while let Some(v) = call.next_arg(env) {
            result = v;
            if env.control() != ControlSignal::None {
                break;
            }
        }
        result
    }

    "create$" 0 * {
        let mut fields = Vec::new();
        for v in call.rest(env) {
            match env.multifield_fields(v) {
                Some(inner) => fields.extend_from_slice(inner),
                None => fields.push(v),
            }
        }
        env.create_multifield(fields)
    }

    "new" 1 * {
        let Some(name) = call.next_lexeme(env) else {
            return env.false_value();
        };
        let name = env.symbol_text(name).unwrap_or("").to_string();
        let found = env
            .find_external_address_type(&name)
            .and_then(|kind| env.external_types.get(kind));
        match found.and_then(|t| t.new.clone()) {
            Some(new) => new(env, call),
            None => {
                env.print_error_id(
                    "EVALUATN",
                    7,
                    &format!("Function new does not support external address type {}.", name),
                );
                env.set_evaluation_error(true);
                env.false_value()
            }
        }
    }

    "call" 1 * {
        let Some(target) = call.next_arg(env) else {
            return env.false_value();
        };
        let Value::ExternalAddress(id) = target else {
            if !env.evaluation_error() {
                env.print_error_id(
                    "ARGACCES",
                    2,
                    "Function call expected argument #1 to be of type external-address.",
                );
                env.set_evaluation_error(true);
            }
            return env.false_value();
        };

        let kind = env.atoms.externals.kind(id).unwrap_or(0);
        let found = env.external_types.get(kind);
        match found.as_ref().and_then(|t| t.call.clone()) {
            Some(handler) => {
                env.install_value(target);
                let result = handler(env, call, id);
                env.deinstall_value(target);
                result
            }
            None => {
                let name = found.map_or_else(|| "???".to_string(), |t| t.name.clone());
                env.print_error_id(
                    "EVALUATN",
                    8,
                    &format!("Function call does not support external address type {}.", name),
                );
                env.set_evaluation_error(true);
                env.false_value()
            }
        }
    }
}

impl Env {
    /// Active instance and slot position for direct slot access from
    /// a handler body
    fn active_slot(
        &mut self,
        slot: super::SymbolId,
        function: &str,
    ) -> Option<(super::InstanceId, usize)> {
        let active = match self.proc_parameter(0) {
            Some(Value::InstanceAddress(id)) => self.instance_class(id).map(|c| (id, c)),
            _ => None,
        };
        let Some((id, class)) = active else {
            self.print_error_id(
                "INSFUN",
                4,
                &format!("Invalid instance-address in function {}.", function),
            );
            self.set_evaluation_error(true);
            return None;
        };

        match self.slot_index(class, slot) {
            Some(index) => Some((id, index)),
            None => {
                let name = self.symbol_text(slot).unwrap_or("?").to_string();
                self.print_error_id(
                    "INSFUN",
                    3,
                    &format!("No such slot {} in function {}.", name, function),
                );
                self.set_evaluation_error(true);
                None
            }
        }
    }

    /// Constraint check for a slot write, when enabled
    fn slot_accepts(
        &mut self,
        id: super::InstanceId,
        index: usize,
        value: Value,
        function: &str,
    ) -> bool {
        if !self.config.dynamic_constraint_checking {
            return true;
        }
        let Some(ins) = self.classes.instance(id) else {
            return false;
        };
        let (ins_name, class) = (ins.name, ins.class);
        let Some(slot) = self.classes.class(class).and_then(|c| c.slots.get(index)) else {
            return false;
        };
        let slot_name = slot.name;
        let ok = slot
            .constraint
            .and_then(|c| self.constraints.get(c))
            .map_or(true, |record| self.satisfies_constraint(record, value));
        if ok {
            return true;
        }

        let slot_name = self.symbol_text(slot_name).unwrap_or("?").to_string();
        let ins_name = self.symbol_text(ins_name).unwrap_or("?").to_string();
        self.print_error_id(
            "CSTRNCHK",
            1,
            &format!(
                "Value for slot {} of instance [{}] found in function {} does not match the allowed types.",
                slot_name, ins_name, function
            ),
        );
        self.set_evaluation_error(true);
        false
    }
}

/// Registers the native function table
pub(crate) fn register_builtins(env: &mut Env) {
    for (name, function, min, max) in ENVFNS {
        env.define_function(name, *min, *max, *function);
    }
    log::trace!("registered {} native functions", ENVFNS.len());
}
