// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/primtab.rs

// Primitive-type dispatch table indexed by type code, and the
// registry of external address types.

// <>

use super::core::Value;
use super::eval::{Call, ParamPrimitive, WildParamPrimitive};
use super::expr::ExprNode;
use super::symtab::ExternalId;
use super::types::{TypeCode, MAXIMUM_EXTERNAL_ADDRESS_TYPES, MAXIMUM_PRIMITIVES};
use super::Env;

use std::any::Any;
use std::rc::Rc;

/// Behavior of one primitive type
///
/// The evaluator consults an entry for every expression kind it does
/// not handle itself. An entry must either copy its node's value or
/// provide `evaluate`
pub trait PrimitiveType {
    fn name(&self) -> &str;

    /// Evaluating a node of this type yields the node's own value
    fn copy_to_evaluate(&self) -> bool {
        false
    }

    /// `None` when the type has no evaluate behavior
    fn evaluate(&self, _env: &mut Env, _node: &ExprNode) -> Option<Value> {
        None
    }

    fn install(&self, _env: &mut Env, _value: Value) {}

    fn deinstall(&self, _env: &mut Env, _value: Value) {}

    fn print(&self, _env: &Env, _value: Value) -> String {
        format!("<{}>", self.name())
    }
}

pub struct PrimitiveTable {
    entries: Vec<Option<Rc<dyn PrimitiveType>>>,
}

impl Default for PrimitiveTable {
    fn default() -> Self {
        Self {
            entries: vec![None; MAXIMUM_PRIMITIVES],
        }
    }
}

impl PrimitiveTable {
    pub fn get(&self, code: TypeCode) -> Option<Rc<dyn PrimitiveType>> {
        self.entries.get(code.index()).cloned().flatten()
    }
}

/// Value kinds built into every environment
struct Builtin {
    name: &'static str,
}

impl PrimitiveType for Builtin {
    fn name(&self) -> &str {
        self.name
    }

    fn copy_to_evaluate(&self) -> bool {
        true
    }

    fn install(&self, env: &mut Env, value: Value) {
        match value {
            Value::Multifield(seg) => env.retain_multifield(seg.multifield),
            _ => env.retain_atom(value),
        }
    }

    fn deinstall(&self, env: &mut Env, value: Value) {
        match value {
            Value::Multifield(seg) => env.release_multifield(seg.multifield),
            _ => env.release_atom(value),
        }
    }

    fn print(&self, env: &Env, value: Value) -> String {
        match value {
            Value::Symbol(id) => env.symbol_text(id).unwrap_or("").to_string(),
            Value::String(id) => format!("\"{}\"", env.symbol_text(id).unwrap_or("")),
            Value::InstanceName(id) => format!("[{}]", env.symbol_text(id).unwrap_or("")),
            Value::Integer(_) => env.as_integer(value).unwrap_or(0).to_string(),
            Value::Float(_) => format!("{:?}", env.as_float(value).unwrap_or(0.0)),
            Value::Multifield(_) => {
                let parts: Vec<String> = env
                    .multifield_fields(value)
                    .unwrap_or(&[])
                    .iter()
                    .map(|v| env.value_to_string(*v))
                    .collect();
                format!("({})", parts.join(" "))
            }
            Value::ExternalAddress(id) => env.external_address_text(id),
            Value::FactAddress(n) => format!("<Fact-{}>", n),
            Value::InstanceAddress(id) => match env.classes.instance(id) {
                Some(ins) if !ins.garbage => {
                    format!("<Instance-{}>", env.symbol_text(ins.name).unwrap_or(""))
                }
                _ => "<Instance-???>".to_string(),
            },
            Value::Class(id) => format!("<Defclass-{}>", env.class_name(id).unwrap_or("")),
            Value::Void => String::new(),
        }
    }
}

/// Registers the built-in value kinds and the parameter reference
/// kinds of the procedure layer
pub(crate) fn install_builtin_primitives(env: &mut Env) {
    let builtins = [
        (TypeCode::FLOAT, "FLOAT"),
        (TypeCode::INTEGER, "INTEGER"),
        (TypeCode::SYMBOL, "SYMBOL"),
        (TypeCode::STRING, "STRING"),
        (TypeCode::MULTIFIELD, "MULTIFIELD"),
        (TypeCode::EXTERNAL_ADDRESS, "EXTERNAL-ADDRESS"),
        (TypeCode::FACT_ADDRESS, "FACT-ADDRESS"),
        (TypeCode::INSTANCE_ADDRESS, "INSTANCE-ADDRESS"),
        (TypeCode::INSTANCE_NAME, "INSTANCE-NAME"),
        (TypeCode::VOID, "VOID"),
        (TypeCode::DEFCLASS_PTR, "DEFCLASS-PTR"),
    ];
    for (code, name) in builtins {
        env.install_primitive(code, Rc::new(Builtin { name }));
    }

    env.install_primitive(TypeCode::PROC_PARAM, Rc::new(ParamPrimitive));
    env.install_primitive(TypeCode::PROC_WILD_PARAM, Rc::new(WildParamPrimitive));

    let c_pointer = ExternalAddressType {
        name: "C_POINTER".to_string(),
        ..Default::default()
    };
    env.install_external_address_type(c_pointer);
}

/// Callbacks for one kind of host-owned external address
#[derive(Default)]
pub struct ExternalAddressType {
    pub name: String,
    pub print: Option<Rc<dyn Fn(&Env, &dyn Any) -> String>>,
    /// Backs the `new` function for this type
    pub new: Option<Rc<dyn Fn(&mut Env, &mut Call) -> Value>>,
    /// Backs the `call` function for addresses of this type
    pub call: Option<Rc<dyn Fn(&mut Env, &mut Call, ExternalId) -> Value>>,
    /// Runs when an idle address of this type is reclaimed
    pub discard: Option<Rc<dyn Fn(&mut Env, Rc<dyn Any>)>>,
}

#[derive(Default)]
pub struct ExternalTypes {
    types: Vec<Rc<ExternalAddressType>>,
}

impl ExternalTypes {
    pub fn get(&self, index: u16) -> Option<Rc<ExternalAddressType>> {
        self.types.get(index as usize).cloned()
    }

    pub fn find(&self, name: &str) -> Option<u16> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .map(|i| i as u16)
    }
}

impl Env {
    /// Installs a primitive-type entry; fails for an out-of-range or
    /// occupied code
    pub fn install_primitive(&mut self, code: TypeCode, entry: Rc<dyn PrimitiveType>) -> bool {
        if matches!(self.primitives.entries.get(code.index()), Some(None)) {
            self.primitives.entries[code.index()] = Some(entry);
            return true;
        }

        self.print_error_id(
            "EVALUATN",
            5,
            &format!("Illegal primitive type index {}.", code.0),
        );
        false
    }

    /// Returns the new type's index, or `None` once the table is full
    pub fn install_external_address_type(&mut self, kind: ExternalAddressType) -> Option<u16> {
        if self.external_types.types.len() >= MAXIMUM_EXTERNAL_ADDRESS_TYPES {
            self.print_error_id(
                "EVALUATN",
                6,
                &format!("Too many external address types; cannot add {}.", kind.name),
            );
            return None;
        }
        self.external_types.types.push(Rc::new(kind));
        Some((self.external_types.types.len() - 1) as u16)
    }

    pub fn find_external_address_type(&self, name: &str) -> Option<u16> {
        self.external_types.find(name)
    }

    /// Wraps host data as an (uninstalled) external address value
    pub fn external_address(&mut self, kind: u16, data: Rc<dyn Any>) -> Value {
        Value::ExternalAddress(self.atoms.externals.get_id(kind, data))
    }

    pub fn external_data(&self, value: Value) -> Option<Rc<dyn Any>> {
        match value {
            Value::ExternalAddress(id) => self.atoms.externals.data(id),
            _ => None,
        }
    }

    fn external_address_text(&self, id: ExternalId) -> String {
        let kind = self.atoms.externals.kind(id).unwrap_or(0);
        let data = self.atoms.externals.data(id);
        match (self.external_types.get(kind), data) {
            (Some(t), Some(data)) => match &t.print {
                Some(print) => print(self, data.as_ref()),
                None => format!("<Pointer-{}-{:p}>", t.name, Rc::as_ptr(&data)),
            },
            _ => "<Pointer-???>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::expr::Payload;
    use super::super::testutil::captured_env;
    use super::*;

    struct Doubler;

    impl PrimitiveType for Doubler {
        fn name(&self) -> &str {
            "DOUBLER"
        }

        fn evaluate(&self, env: &mut Env, node: &ExprNode) -> Option<Value> {
            match node.value {
                Payload::Index(n) => Some(env.integer(2 * n as i64)),
                _ => None,
            }
        }
    }

    struct Inert;

    impl PrimitiveType for Inert {
        fn name(&self) -> &str {
            "INERT"
        }
    }

    #[test]
    fn table_dispatch() {
        let mut env = Env::new();
        let code = TypeCode::FIRST_USER;
        assert!(env.install_primitive(code, Rc::new(Doubler)));

        let expr = env.expression(code, Payload::Index(21), None);
        let out = env.evaluate(expr);
        assert_eq!(env.as_integer(out), Some(42));
    }

    #[test]
    fn occupied_codes_are_refused() {
        let (mut env, sink) = captured_env();
        assert!(!env.install_primitive(TypeCode::SYMBOL, Rc::new(Inert)));
        assert!(sink.text().starts_with("[EVALUATN5]"));
    }

    #[test]
    #[should_panic]
    fn entry_without_behavior_is_fatal() {
        let mut env = Env::new();
        let code = TypeCode(TypeCode::FIRST_USER.0 + 1);
        env.install_primitive(code, Rc::new(Inert));
        let expr = env.expression(code, Payload::None, None);
        env.evaluate(expr);
    }

    #[test]
    #[should_panic]
    fn missing_entry_is_fatal() {
        let mut env = Env::new();
        let expr = env.expression(TypeCode(50), Payload::None, None);
        env.evaluate(expr);
    }

    #[test]
    fn defclass_pointers_copy() {
        let mut env = Env::new();
        let object = env.find_class("OBJECT").unwrap();
        let expr = env.constant(Value::Class(object));
        assert_eq!(env.evaluate(expr), Value::Class(object));
        assert_eq!(env.value_to_string(Value::Class(object)), "<Defclass-OBJECT>");
    }

    #[test]
    fn external_types_are_bounded() {
        let (mut env, sink) = captured_env();
        assert_eq!(env.find_external_address_type("C_POINTER"), Some(0));
        for i in 1..MAXIMUM_EXTERNAL_ADDRESS_TYPES {
            let kind = ExternalAddressType {
                name: format!("T{}", i),
                ..Default::default()
            };
            assert_eq!(env.install_external_address_type(kind), Some(i as u16));
        }
        let extra = ExternalAddressType {
            name: "ONE-TOO-MANY".to_string(),
            ..Default::default()
        };
        assert_eq!(env.install_external_address_type(extra), None);
        assert!(sink.text().contains("[EVALUATN6]"));
    }

    #[test]
    fn external_print_callback() {
        let mut env = Env::new();
        let kind = env
            .install_external_address_type(ExternalAddressType {
                name: "COUNTER".to_string(),
                print: Some(Rc::new(|_env: &Env, data: &dyn Any| {
                    format!("<Counter-{}>", data.downcast_ref::<u32>().unwrap())
                })),
                ..Default::default()
            })
            .unwrap();
        let addr = env.external_address(kind, Rc::new(7u32));
        assert_eq!(env.value_to_string(addr), "<Counter-7>");
    }
}
