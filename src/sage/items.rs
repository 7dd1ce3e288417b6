// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/items.rs

// Binary save and load of modules and classes. Classes get their
// placeholders in the storage pass so that expressions can refer to
// them, and their contents in the population pass.

// <>

use super::bload::{read_count, BinaryItem, BloadError, Record};
use super::bsave::{put_i64, put_u16, put_u8, BsaveContext, BsaveError};
use super::class::{Class, ClassId, Handler, LoadedClasses, Module, ModuleId, Slot};
use super::core::Value;
use super::types::HandlerRole;
use super::Env;

use std::io::Read;
use std::rc::Rc;

const MODULE_RECORD: usize = 8;
/// name, constraint, default, inherited flag
const SLOT_RECORD: usize = 25;
/// name, role, minimum, maximum, actions
const HANDLER_RECORD: usize = 27;
/// name, module, then first and count of links, slots and handlers
const CLASS_RECORD: usize = 64;
const LINK_RECORD: usize = 8;

struct DefmoduleItem;

impl BinaryItem for DefmoduleItem {
    fn name(&self) -> &str {
        "defmodule"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn find_needed(&self, env: &Env, ctx: &mut BsaveContext) {
        for id in env.classes.module_ids() {
            if let Some(m) = env.classes.module(id) {
                ctx.mark_module(id);
                ctx.mark_symbol(m.name);
            }
        }
    }

    fn bsave(&self, env: &Env, ctx: &BsaveContext, out: &mut Vec<u8>) -> Result<(), BsaveError> {
        put_i64(out, ctx.modules().len() as i64);
        for id in ctx.modules() {
            let name = env
                .classes
                .module(*id)
                .map(|m| m.name)
                .ok_or_else(|| BsaveError::Unsupported(format!("freed module {:?}", id)))?;
            put_i64(out, ctx.symbol_index(name)?);
        }
        Ok(())
    }

    /// Modules already present are reused, so MAIN stays MAIN
    fn bload(&self, env: &mut Env, input: &mut dyn Read) -> Result<(), BloadError> {
        let count = read_count(input, "module")?;
        env.bload_and_refresh(input, count, MODULE_RECORD, |env, rec, _| {
            let name = env.bloaded_symbol(Record::new(rec).i64()?)?;
            let existing = env
                .classes
                .module_ids()
                .into_iter()
                .find(|id| env.classes.module(*id).is_some_and(|m| m.name == name));
            let id = match existing {
                Some(id) => id,
                None => {
                    env.install_value(Value::Symbol(name));
                    env.classes.push_module(Module {
                        name,
                        class_head: None,
                        class_tail: None,
                        loaded: true,
                    })
                }
            };
            env.classes.loaded_modules.push(id);
            Ok(())
        })
    }

    fn clear(&self, env: &mut Env) {
        let loaded = std::mem::take(&mut env.classes.loaded_modules);
        for id in loaded.into_iter().rev() {
            if !env.classes.module(id).is_some_and(|m| m.loaded) {
                continue;
            }
            if let Some(m) = env.classes.remove_module(id) {
                env.deinstall_value(Value::Symbol(m.name));
            }
        }
        if env.classes.module(env.classes.current_module).is_none() {
            env.classes.current_module = ModuleId(0);
        }
    }
}

struct DefclassItem;

/// Classes of every saved module, in module then definition order
fn saved_classes(env: &Env, ctx: &BsaveContext) -> Vec<ClassId> {
    ctx.modules()
        .iter()
        .flat_map(|m| env.module_classes(*m))
        .collect()
}

impl BinaryItem for DefclassItem {
    fn name(&self) -> &str {
        "defclass"
    }

    fn find_needed(&self, env: &Env, ctx: &mut BsaveContext) {
        for id in saved_classes(env, ctx) {
            let Some(class) = env.classes.class(id) else {
                continue;
            };
            ctx.mark_class(id);
            ctx.mark_symbol(class.name);
            for slot in &class.slots {
                ctx.mark_symbol(slot.name);
                ctx.mark_constraint(slot.constraint);
                ctx.mark_expression(env, slot.default);
            }
            for handler in &class.handlers {
                ctx.mark_symbol(handler.name);
                ctx.mark_expression(env, handler.actions);
            }
        }
    }

    fn bsave_storage(
        &self,
        _env: &Env,
        ctx: &BsaveContext,
        out: &mut Vec<u8>,
    ) -> Result<(), BsaveError> {
        if !ctx.classes().is_empty() {
            put_i64(out, ctx.classes().len() as i64);
        }
        Ok(())
    }

    fn bsave(&self, env: &Env, ctx: &BsaveContext, out: &mut Vec<u8>) -> Result<(), BsaveError> {
        if ctx.classes().is_empty() {
            return Ok(());
        }
        let classes: Vec<&Class> = ctx
            .classes()
            .iter()
            .filter_map(|id| env.classes.class(*id))
            .collect();

        put_i64(out, classes.iter().map(|c| c.precedence.len()).sum::<usize>() as i64);
        for class in &classes {
            for link in &class.precedence {
                put_i64(out, ctx.class_index(env, Some(*link))?);
            }
        }

        put_i64(out, classes.iter().map(|c| c.slots.len()).sum::<usize>() as i64);
        for class in &classes {
            for slot in &class.slots {
                put_i64(out, ctx.symbol_index(slot.name)?);
                put_i64(out, ctx.constraint_index(slot.constraint)?);
                put_i64(out, ctx.expression_index(slot.default)?);
                put_u8(out, slot.inherited as u8);
            }
        }

        put_i64(out, classes.iter().map(|c| c.handlers.len()).sum::<usize>() as i64);
        for class in &classes {
            for handler in &class.handlers {
                put_i64(out, ctx.symbol_index(handler.name)?);
                put_u8(out, handler.role.to_byte());
                put_u16(out, handler.min_params);
                put_i64(out, handler.max_params.map_or(-1, i64::from));
                put_i64(out, ctx.expression_index(handler.actions)?);
            }
        }

        let (mut link, mut slot, mut handler) = (0, 0, 0);
        for class in &classes {
            let module = ctx
                .module_index(class.module)
                .ok_or_else(|| BsaveError::Unsupported("class outside saved modules".to_string()))?;
            put_i64(out, ctx.symbol_index(class.name)?);
            put_i64(out, module);
            for (first, len) in [
                (&mut link, class.precedence.len()),
                (&mut slot, class.slots.len()),
                (&mut handler, class.handlers.len()),
            ] {
                put_i64(out, *first as i64);
                put_i64(out, len as i64);
                *first += len;
            }
        }
        Ok(())
    }

    fn bload_storage(&self, env: &mut Env, input: &mut dyn Read) -> Result<(), BloadError> {
        let count = read_count(input, "class")?;
        let base = env.classes.push_placeholders(env.nil_sym, count);
        env.classes.loaded = Some(LoadedClasses { base, count });
        log::debug!("reserved {} loaded classes", count);
        Ok(())
    }

    fn bload(&self, env: &mut Env, input: &mut dyn Read) -> Result<(), BloadError> {
        let Some(loaded) = env.classes.loaded else {
            return Err(BloadError::Corrupt("class data without storage".to_string()));
        };

        let mut link_pool = Vec::new();
        let count = read_count(input, "class link")?;
        env.bload_and_refresh(input, count, LINK_RECORD, |env, rec, _| {
            let class = env.bloaded_class(Record::new(rec).i64()?)?;
            let class = class.ok_or_else(|| BloadError::Corrupt("empty class link".to_string()))?;
            link_pool.push(Some(class));
            Ok(())
        })?;

        let mut slot_pool = Vec::new();
        let count = read_count(input, "slot")?;
        env.bload_and_refresh(input, count, SLOT_RECORD, |env, rec, _| {
            let mut r = Record::new(rec);
            slot_pool.push(Some(Slot {
                name: env.bloaded_symbol(r.i64()?)?,
                constraint: env.bloaded_constraint(r.i64()?)?,
                default: env.bloaded_expression(r.i64()?)?,
                inherited: r.u8()? != 0,
            }));
            Ok(())
        })?;

        let mut handler_pool = Vec::new();
        let count = read_count(input, "handler")?;
        env.bload_and_refresh(input, count, HANDLER_RECORD, |env, rec, _| {
            let mut r = Record::new(rec);
            let name = env.bloaded_symbol(r.i64()?)?;
            let role = r.u8()?;
            let role = HandlerRole::from_byte(role)
                .ok_or_else(|| BloadError::Corrupt(format!("handler role {}", role)))?;
            let min_params = r.u16()?;
            let max_params = u16::try_from(r.i64()?).ok();
            let actions = env.bloaded_expression(r.i64()?)?;
            handler_pool.push(Some(Handler {
                name,
                role,
                min_params,
                max_params,
                actions,
                busy: 0,
            }));
            Ok(())
        })?;

        env.bload_and_refresh(input, loaded.count, CLASS_RECORD, |env, rec, i| {
            let mut r = Record::new(rec);
            let name = env.bloaded_symbol(r.i64()?)?;
            let module = usize::try_from(r.i64()?)
                .ok()
                .and_then(|m| env.classes.loaded_modules.get(m).copied())
                .ok_or_else(|| BloadError::Corrupt(format!("module of class {}", i)))?;
            let precedence = take_range(&mut r, &mut link_pool)?;
            let slots = take_range(&mut r, &mut slot_pool)?;
            let handlers = take_range(&mut r, &mut handler_pool)?;

            env.install_value(Value::Symbol(name));
            for slot in &slots {
                env.install_value(Value::Symbol(slot.name));
                if let (Some(c), false) = (slot.constraint, slot.inherited) {
                    env.constraints.retain(c);
                }
            }
            for handler in &handlers {
                env.install_value(Value::Symbol(handler.name));
            }

            let id = ClassId((loaded.base + i) as u32);
            if let Some(c) = env.classes.class_mut(id) {
                let refs = c.refs;
                *c = Class {
                    name,
                    module,
                    next: None,
                    system: false,
                    loaded: true,
                    precedence,
                    slots,
                    handlers,
                    busy: 0,
                    refs,
                    instances: 0,
                };
            }
            env.classes.register_name(name, id);
            env.classes.link_class(id);
            Ok(())
        })?;

        log::debug!("loaded {} classes", loaded.count);
        Ok(())
    }

    fn clear(&self, env: &mut Env) {
        let Some(loaded) = env.classes.loaded.take() else {
            return;
        };
        for i in (loaded.base..loaded.base + loaded.count).rev() {
            let id = ClassId(i as u32);
            env.classes.unlink_class(id);
            let Some(class) = env.classes.take_class(id) else {
                continue;
            };
            // placeholders never got a precedence list or a name
            if class.precedence.is_empty() {
                continue;
            }
            for slot in class.slots {
                env.deinstall_value(Value::Symbol(slot.name));
                if let (Some(c), false) = (slot.constraint, slot.inherited) {
                    env.constraints.release(c);
                }
            }
            for handler in class.handlers {
                env.deinstall_value(Value::Symbol(handler.name));
            }
            env.deinstall_value(Value::Symbol(class.name));
        }
        log::debug!("cleared {} loaded classes", loaded.count);
    }
}

/// Moves the `first, count` range named by the next two fields out of
/// `pool`; every entry goes to exactly one class
fn take_range<T>(r: &mut Record<'_>, pool: &mut [Option<T>]) -> Result<Vec<T>, BloadError> {
    let first = usize::try_from(r.i64()?).ok();
    let count = usize::try_from(r.i64()?).ok();
    let range = first
        .zip(count)
        .and_then(|(f, c)| Some(f..f.checked_add(c)?))
        .filter(|range| range.end <= pool.len())
        .ok_or_else(|| BloadError::Corrupt("class member range".to_string()))?;
    pool[range]
        .iter_mut()
        .map(|entry| {
            entry
                .take()
                .ok_or_else(|| BloadError::Corrupt("shared class member".to_string()))
        })
        .collect()
}

impl Env {
    /// Class of the image; `-1` is none, `-(k + 2)` system class `k`
    pub(crate) fn bloaded_class(&self, value: i64) -> Result<Option<ClassId>, BloadError> {
        let bad = || BloadError::Corrupt(format!("class index {}", value));
        match value {
            -1 => Ok(None),
            v if v >= 0 => {
                let loaded = self.classes.loaded.ok_or_else(bad)?;
                let i = v as usize;
                if i < loaded.count {
                    Ok(Some(ClassId((loaded.base + i) as u32)))
                } else {
                    Err(bad())
                }
            }
            v => {
                let k = (-(v + 2)) as usize;
                if k < self.classes.system_count {
                    Ok(Some(ClassId(k as u32)))
                } else {
                    Err(bad())
                }
            }
        }
    }
}

/// Registers the module and class binary items and their hooks
pub(crate) fn register_construct_items(env: &mut Env) {
    env.register_binary_item(Rc::new(DefmoduleItem));
    env.register_binary_item(Rc::new(DefclassItem));

    env.add_before_bload("defclass", 0, |env| env.clear_runtime_objects());
    env.add_after_bload("defmodule", 0, |env| env.classes.current_module = ModuleId(0));
    env.add_abort_bload("defmodule", 0, |env| env.classes.current_module = ModuleId(0));
    env.add_clear_bload_ready("defclass", 0, |env| {
        env.classes.loaded.map_or(true, |l| {
            (l.base..l.base + l.count).all(|i| {
                env.classes
                    .class(ClassId(i as u32))
                    .map_or(true, |c| c.busy == 0 && c.refs == 0 && c.instances == 0)
            })
        })
    });
}

#[cfg(test)]
mod tests {
    use super::super::bload::BINARY_PREFIX;
    use super::super::constraint::ConstraintRecord;
    use super::super::types::TypeCode;
    use super::super::SlotSpec;
    use super::*;

    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn names(env: &Env, ids: &[ClassId]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| env.class_name(*id).map(str::to_string))
            .collect()
    }

    /// Module SHAPES with classes point and point3 and their handlers
    fn shapes() -> Env {
        let mut env = Env::new();
        let shapes = env.define_module("SHAPES").unwrap();
        env.set_current_module(shapes);

        let integer = env.add_constraint(ConstraintRecord::of_types(&[TypeCode::INTEGER]));
        let zero = env.integer(0);
        let zero = env.constant(zero);
        let point = env
            .define_class(
                "point",
                &[],
                vec![
                    SlotSpec::new("x").constraint(integer).default(zero),
                    SlotSpec::new("y"),
                ],
            )
            .unwrap();
        let point3 = env
            .define_class("point3", &[point], vec![SlotSpec::new("z")])
            .unwrap();

        let label = env.symbol("point");
        let label = env.constant(label);
        env.define_handler(point, "describe", HandlerRole::Primary, 0, Some(0), Some(label))
            .unwrap();
        let next = env.function_call("call-next-handler", &[]).unwrap();
        env.define_handler(point3, "describe", HandlerRole::Around, 0, None, Some(next))
            .unwrap();
        env
    }

    fn image(env: &Env) -> Vec<u8> {
        let mut out = Vec::new();
        env.bsave_to(&mut out).unwrap();
        out
    }

    #[test]
    fn classes_survive_a_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shapes.bin");
        assert!(shapes().bsave(&path));

        let mut env = Env::new();
        let live = env.exprs.live();
        assert!(env.bload(&path));
        assert!(env.bload_active());
        assert_eq!(env.current_module(), ModuleId(0));

        let module = env.find_module("SHAPES").unwrap();
        assert_eq!(names(&env, &env.module_classes(module)), vec!["point", "point3"]);
        let point3 = env.find_class("point3").unwrap();
        assert_eq!(
            names(&env, &env.class_precedence(point3)),
            vec!["point3", "point", "USER", "OBJECT"]
        );
        assert_eq!(env.class_slot_names(point3), vec!["z", "x", "y"]);

        let p = env.make_instance("p", point3).unwrap();
        let zero = env.integer(0);
        let Value::InstanceAddress(id) = p else {
            panic!("not an instance address: {:?}", p);
        };
        assert_eq!(env.instance_slot(id, "x"), Some(zero));

        let reply = env.send(p, "describe", None);
        let expected = env.symbol("point");
        assert_eq!(reply, expected);
        assert_eq!(env.handler_busy(point3, "describe", HandlerRole::Around), Some(0));
        assert_eq!(env.class_busy(point3), 0);

        assert_eq!(env.define_class("other", &[], vec![]), Err(super::super::DefineError::BloadActive));

        // instances pin the image
        assert!(!env.clear_bload());
        env.delete_instance(id);
        assert!(env.clear_bload());
        assert!(env.find_class("point3").is_none());
        assert!(env.find_module("SHAPES").is_none());
        assert_eq!(env.exprs.live(), live);
        assert_eq!(env.classes.class_slot_count(), env.classes.system_count);
    }

    #[test]
    fn atom_counts_return_after_clear() {
        let bytes = image(&shapes());
        let mut env = Env::new();
        env.config.reclaim_on_clear = false;
        let atoms: Vec<Value> = ["point", "point3", "x", "describe", "MAIN"]
            .into_iter()
            .map(|name| {
                let v = env.symbol(name);
                env.install_value(v);
                v
            })
            .collect();
        let counts = |env: &Env| atoms.iter().map(|v| env.busy_count(*v)).collect::<Vec<_>>();
        let before = counts(&env);

        env.bload_from(&mut Cursor::new(bytes), "shapes.bin").unwrap();
        let during = counts(&env);
        assert!(before.iter().zip(&during).take(4).all(|(b, d)| d > b));

        assert!(env.clear_bload());
        assert_eq!(counts(&env), before);
    }

    #[test]
    fn class_values_pin_the_image() {
        let bytes = image(&shapes());
        let mut env = Env::new();
        env.bload_from(&mut Cursor::new(bytes), "shapes.bin").unwrap();
        let point = env.find_class("point").unwrap();
        assert_eq!(env.busy_count(Value::Class(point)), 0);

        env.install_value(Value::Class(point));
        assert!(!env.clear_bload());
        assert!(env.bload_active());
        env.deinstall_value(Value::Class(point));
        assert!(env.clear_bload());
    }

    #[test]
    fn loaded_constraints_check_slots() {
        let mut env = Env::new();
        let bytes = image(&shapes());
        env.bload_from(&mut Cursor::new(bytes), "shapes.bin").unwrap();

        let point = env.find_class("point").unwrap();
        let slot = &env.classes.class(point).unwrap().slots[0];
        let constraint = slot.constraint.unwrap();
        assert_eq!(env.constraints.count(constraint), 1);

        let record = env.constraint(constraint).unwrap().clone();
        let one = env.integer(1);
        let word = env.symbol("one");
        assert!(env.satisfies_constraint(&record, one));
        assert!(!env.satisfies_constraint(&record, word));
    }

    #[test]
    fn runtime_classes_go_before_a_load() {
        let bytes = image(&shapes());
        let mut env = Env::new();
        let old = env.define_class("scratch", &[], vec![]).unwrap();
        env.make_instance("s", old).unwrap();

        env.bload_from(&mut Cursor::new(bytes), "shapes.bin").unwrap();
        assert!(env.find_class("scratch").is_none());
        assert!(env.find_instance("s").is_none());
        assert!(env.find_class("point").is_some());
    }

    #[test]
    fn truncated_population_unwinds() {
        let mut bytes = image(&shapes());
        // drop the final section and its terminator
        bytes.truncate(bytes.len() - BINARY_PREFIX.len() - 20);

        let mut env = Env::new();
        let live = env.exprs.live();
        assert!(env.bload_from(&mut Cursor::new(bytes), "shapes.bin").is_err());
        assert!(!env.bload_active());
        assert!(env.find_class("point").is_none());
        assert!(env.find_module("SHAPES").is_none());
        assert_eq!(env.classes.class_slot_count(), env.classes.system_count);
        assert_eq!(env.exprs.live(), live);
        assert_eq!(env.current_module(), ModuleId(0));
    }

    #[test]
    fn reload_replaces_the_image() {
        let bytes = image(&shapes());
        let mut env = Env::new();
        env.bload_from(&mut Cursor::new(bytes.clone()), "a.bin").unwrap();
        let first = env.find_class("point").unwrap();
        env.bload_from(&mut Cursor::new(bytes), "b.bin").unwrap();

        // the old classes were released before the new ones were placed
        assert_eq!(env.find_class("point"), Some(first));
        assert_eq!(env.module_classes(env.find_module("SHAPES").unwrap()).len(), 2);
    }

    #[test]
    fn system_class_encoding() {
        let env = Env::new();
        let user = env.find_class("USER").unwrap();
        assert_eq!(env.bloaded_class(-1).unwrap(), None);
        assert_eq!(env.bloaded_class(-(user.0 as i64 + 2)).unwrap(), Some(user));
        assert!(env.bloaded_class(0).is_err());
        assert!(env.bloaded_class(-1000).is_err());
    }
}
