// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/msgpass.rs

// Message dispatch. Collects the applicable handlers of a message
// along the receiver's class precedence list, joins them into a core,
// and runs the core with around, before, primary, and after
// semantics plus call-next-handler continuations.

// <>

use super::class::ClassId;
use super::core::Value;
use super::expr::ExprId;
use super::symtab::SymbolId;
use super::types::HandlerRole;
use super::{ControlSignal, Env};

/// One applicable handler within a core
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HandlerLink {
    pub class: ClassId,
    /// Position in the class's handler list
    pub index: usize,
    pub role: HandlerRole,
}

struct Core {
    message: SymbolId,
    links: Vec<HandlerLink>,
}

/// Dispatch registers: the stack of active cores, one per nested
/// send, and the running and next links of the top core
#[derive(Default)]
pub struct MessageState {
    cores: Vec<Core>,
    current: Option<usize>,
    next: Option<usize>,
}

impl Env {
    /// Sends `message` to `receiver`, evaluating the argument list
    /// first
    ///
    /// Errors are reported through the evaluation error flag and the
    /// result is then `FALSE`
    pub fn send(&mut self, receiver: Value, message: &str, args: Option<ExprId>) -> Value {
        let message = self.intern(message);
        self.send_message(receiver, message, args)
    }

    pub(crate) fn send_message(
        &mut self,
        receiver: Value,
        message: SymbolId,
        args: Option<ExprId>,
    ) -> Value {
        // arguments are held while later ones evaluate
        self.install_value(receiver);
        let mut params = vec![receiver];
        let mut cursor = args;
        while let Some(id) = cursor {
            let v = self.evaluate(id);
            if self.evaluation_error() {
                for p in params {
                    self.deinstall_value(p);
                }
                return self.false_value();
            }
            self.install_value(v);
            params.push(v);
            cursor = self.exprs.get(id).and_then(|n| n.next_arg);
        }

        let result = self.perform_message(message, params.clone());
        for p in params {
            self.deinstall_value(p);
        }
        result
    }

    /// Sends a message with already evaluated arguments
    pub fn send_values(&mut self, receiver: Value, message: &str, args: &[Value]) -> Value {
        let message = self.intern(message);
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(receiver);
        params.extend_from_slice(args);
        self.perform_message(message, params)
    }

    /// Dispatches a message whose parameter array, receiver first, is
    /// already evaluated
    fn perform_message(&mut self, message: SymbolId, mut params: Vec<Value>) -> Value {
        let msg_name = self.symbol_text(message).unwrap_or("?").to_string();
        let Some(class) = self.receiver_class(&mut params, &msg_name) else {
            return self.false_value();
        };

        let Some(links) = self.find_applicable_handlers(class, message) else {
            return self.false_value();
        };

        let depth = self.messages.cores.len() + 1;
        if self.config.watch_messages {
            let receiver = self.value_to_string(params[0]);
            log::info!(">> {} ED:{} {}", msg_name, depth, receiver);
        }

        let saved = (self.messages.current, self.messages.next);
        let result = {
            let mut env = self.scoped(move |env| {
                if let Some(core) = env.messages.cores.pop() {
                    env.release_links(&core.links);
                }
                env.messages.current = saved.0;
                env.messages.next = saved.1;
                env.pop_proc_parameters();
                if cfg!(feature = "stkdbg") {
                    log::debug!("core stack pop: {}", env.core_stack_readout());
                }
            });
            env.push_proc_parameters(&msg_name, params);

            let around = links[0].role == HandlerRole::Around;
            let successor = (links.len() > 1).then_some(1);
            env.messages.cores.push(Core { message, links });
            env.messages.current = None;
            env.messages.next = None;
            if cfg!(feature = "stkdbg") {
                log::debug!("core stack push: {}", env.core_stack_readout());
            }

            if around {
                env.run_handler(0, successor)
            } else {
                env.call_handlers(0)
            }
        };

        if self.config.watch_messages {
            log::info!("<< {} ED:{}", msg_name, depth);
        }
        if self.evaluation_error() {
            return self.false_value();
        }
        result
    }

    /// Messages of the active cores, innermost last, with their
    /// handler counts
    fn core_stack_readout(&self) -> String {
        let frames: Vec<String> = self
            .messages
            .cores
            .iter()
            .map(|c| format!("{}/{}", self.symbol_text(c.message).unwrap_or("?"), c.links.len()))
            .collect();
        format!("[{}]", frames.join(" "))
    }

    /// Class that handles messages for the receiver in `params[0]`;
    /// instance names are replaced by the instance's address
    fn receiver_class(&mut self, params: &mut [Value], msg_name: &str) -> Option<ClassId> {
        match params[0] {
            Value::InstanceAddress(id) => {
                if let Some(class) = self.instance_class(id) {
                    return Some(class);
                }
                self.print_error_id("MSGPASS", 3, "Static reference to deleted instance.");
                self.print_error_line(&format!("Message {} not sent.", msg_name));
                self.set_evaluation_error(true);
                None
            }
            Value::InstanceName(sym) => {
                let found = self
                    .find_instance_by_symbol(sym)
                    .and_then(|id| Some((id, self.instance_class(id)?)));
                if let Some((id, class)) = found {
                    params[0] = Value::InstanceAddress(id);
                    return Some(class);
                }
                let name = self.symbol_text(sym).unwrap_or("?").to_string();
                self.print_error_id(
                    "MSGPASS",
                    2,
                    &format!("No such instance {} in function send.", name),
                );
                self.set_evaluation_error(true);
                None
            }
            other => match self.primitive_class(other.type_code()) {
                Some(class) => Some(class),
                None => self.system_error(
                    "MSGPASS",
                    6,
                    &format!("no class for primitive type {:?}", other.type_code()),
                ),
            },
        }
    }

    /// Collects the handlers of `message` along the precedence list of
    /// `class` and joins them around, before, primary, after
    ///
    /// Every collected handler and its class are marked busy. With no
    /// primary handler the links are released and `None` returned
    pub(crate) fn find_applicable_handlers(
        &mut self,
        class: ClassId,
        message: SymbolId,
    ) -> Option<Vec<HandlerLink>> {
        let mut arounds = Vec::new();
        let mut befores = Vec::new();
        let mut primaries = Vec::new();
        let mut afters = Vec::new();

        for c in self.class_precedence(class) {
            let Some(cls) = self.classes.class(c) else {
                continue;
            };
            for (index, h) in cls.handlers.iter().enumerate() {
                if h.name != message {
                    continue;
                }
                let link = HandlerLink {
                    class: c,
                    index,
                    role: h.role,
                };
                match h.role {
                    HandlerRole::Around => arounds.push(link),
                    HandlerRole::Before => befores.push(link),
                    HandlerRole::Primary => primaries.push(link),
                    // general to specific
                    HandlerRole::After => afters.insert(0, link),
                }
            }
        }

        let no_primary = primaries.is_empty();
        let mut links = arounds;
        links.append(&mut befores);
        links.append(&mut primaries);
        links.append(&mut afters);
        self.retain_links(&links);

        if no_primary {
            let name = self.symbol_text(message).unwrap_or("?").to_string();
            self.print_error_id(
                "MSGPASS",
                4,
                &format!("No primary message-handlers found for {}.", name),
            );
            self.release_links(&links);
            self.set_evaluation_error(true);
            return None;
        }
        Some(links)
    }

    fn retain_links(&mut self, links: &[HandlerLink]) {
        for link in links {
            if let Some(cls) = self.classes.class_mut(link.class) {
                cls.busy += 1;
                if let Some(h) = cls.handlers.get_mut(link.index) {
                    h.busy += 1;
                }
            }
            if cfg!(feature = "memdbg") {
                log::trace!("link {:?} busy -> {}", link, self.class_busy(link.class));
            }
        }
    }

    fn release_links(&mut self, links: &[HandlerLink]) {
        for link in links {
            let ok = match self.classes.class_mut(link.class) {
                Some(cls) if cls.busy > 0 => {
                    cls.busy -= 1;
                    match cls.handlers.get_mut(link.index) {
                        Some(h) if h.busy > 0 => {
                            h.busy -= 1;
                            true
                        }
                        _ => false,
                    }
                }
                _ => false,
            };
            if !ok {
                self.system_error("MSGPASS", 7, "handler link released twice");
            }
            if cfg!(feature = "memdbg") {
                log::trace!("unlink {:?} busy -> {}", link, self.class_busy(link.class));
            }
        }
    }

    fn core_links(&self) -> &[HandlerLink] {
        self.messages
            .cores
            .last()
            .map_or(&[], |c| c.links.as_slice())
    }

    /// Runs the befores from `start`, the first primary, and the
    /// afters; the primary's result is the result
    fn call_handlers(&mut self, start: usize) -> Value {
        let links = self.core_links().to_vec();
        let mut result = self.false_value();
        let mut i = start;

        while i < links.len() && links[i].role == HandlerRole::Before {
            self.run_handler(i, None);
            if self.control() != ControlSignal::None {
                return self.false_value();
            }
            i += 1;
        }

        if i < links.len() && links[i].role == HandlerRole::Primary {
            let shadowed = links
                .get(i + 1)
                .filter(|l| l.role == HandlerRole::Primary)
                .map(|_| i + 1);
            result = self.run_handler(i, shadowed);
            if self.control() != ControlSignal::None {
                return result;
            }
            i += 1;
            while i < links.len() && links[i].role == HandlerRole::Primary {
                i += 1;
            }
        }

        while i < links.len() && links[i].role == HandlerRole::After {
            self.run_handler(i, None);
            if self.control() != ControlSignal::None {
                break;
            }
            i += 1;
        }
        result
    }

    /// Runs one handler body with the given next link
    fn run_handler(&mut self, index: usize, next: Option<usize>) -> Value {
        let Some(link) = self.core_links().get(index).copied() else {
            self.system_error("MSGPASS", 8, "handler link out of range");
        };
        let (name, min, max, actions) = match self
            .classes
            .class(link.class)
            .and_then(|c| c.handlers.get(link.index))
        {
            Some(h) => (h.name, h.min_params, h.max_params, h.actions),
            None => self.system_error("MSGPASS", 8, "handler link to a removed handler"),
        };

        let msg_name = self.symbol_text(name).unwrap_or("?").to_string();
        let class_name = self.class_name(link.class).unwrap_or("?").to_string();
        let nargs = self.proc_parameters().len().saturating_sub(1);
        let too_few = nargs < min as usize;
        let too_many = max.is_some_and(|m| nargs > m as usize);
        if too_few || too_many {
            let expected = match max {
                Some(m) if m == min => format!("exactly {}", min),
                Some(m) if too_many => format!("no more than {}", m),
                _ => format!("at least {}", min),
            };
            self.print_error_id(
                "MSGPASS",
                5,
                &format!(
                    "Message-handler {} {} in class {} expected {} argument(s).",
                    msg_name,
                    link.role.name(),
                    class_name,
                    expected
                ),
            );
            self.set_evaluation_error(true);
            return self.false_value();
        }

        let watch = self.config.watch_handlers;
        if watch {
            log::info!(">> {} {} in class {}", msg_name, link.role.name(), class_name);
        }

        self.messages.current = Some(index);
        self.messages.next = next;
        let result = self.evaluate_actions(actions);

        if watch {
            log::info!("<< {} {} in class {}", msg_name, link.role.name(), class_name);
        }
        result
    }

    /// Whether `call-next-handler` may run from the current handler
    pub fn next_handler_available(&self) -> bool {
        let (Some(cur), Some(nxt)) = (self.messages.current, self.messages.next) else {
            return false;
        };
        let links = self.core_links();
        match (links.get(cur), links.get(nxt)) {
            (Some(c), Some(_)) if c.role == HandlerRole::Around => true,
            (Some(c), Some(n)) => c.role == HandlerRole::Primary && n.role == HandlerRole::Primary,
            _ => false,
        }
    }

    /// Runs the shadowed part of the core; `args` replaces everything
    /// but `?self` in the parameter array for the duration of the call
    pub(crate) fn call_next_handler(&mut self, args: Option<Vec<Value>>) -> Value {
        if !self.next_handler_available() {
            self.print_error_id(
                "MSGPASS",
                1,
                "Shadowed message-handlers not applicable in current context.",
            );
            self.set_evaluation_error(true);
            return self.false_value();
        }
        let (Some(cur), Some(nxt)) = (self.messages.current, self.messages.next) else {
            return self.false_value();
        };

        let links = self.core_links().to_vec();
        let overriding = args.is_some();
        let saved = (self.messages.current, self.messages.next);
        let mut env = self.scoped(move |env| {
            env.messages.current = saved.0;
            env.messages.next = saved.1;
            if overriding {
                env.pop_proc_parameters();
            }
        });

        if let Some(args) = args {
            let name = env.proc_name().unwrap_or("").to_string();
            let receiver = env.proc_parameter(0).unwrap_or(Value::Void);
            let mut params = Vec::with_capacity(args.len() + 1);
            params.push(receiver);
            params.extend(args);
            env.push_proc_parameters(&name, params);
        }

        let successor = |at: usize, role: HandlerRole| {
            links
                .get(at + 1)
                .filter(|l| role == HandlerRole::Around || l.role == role)
                .map(|_| at + 1)
        };
        match (links[cur].role, links[nxt].role) {
            (HandlerRole::Around, HandlerRole::Around) => {
                env.run_handler(nxt, successor(nxt, HandlerRole::Around))
            }
            (HandlerRole::Around, _) => env.call_handlers(nxt),
            _ => env.run_handler(nxt, successor(nxt, HandlerRole::Primary)),
        }
    }

    /// Nesting depth of message sends in progress
    pub fn message_depth(&self) -> usize {
        self.messages.cores.len()
    }

    /// Message being handled by the innermost send
    pub fn current_message(&self) -> Option<&str> {
        let core = self.messages.cores.last()?;
        self.symbol_text(core.message)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::captured_env;
    use super::super::types::TypeCode;
    use super::*;

    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    /// Registers `note`, which appends its symbol argument to the log
    fn with_log(env: &mut Env) -> Log {
        let log: Log = Rc::default();
        let sink = log.clone();
        env.define_function("note", 1, Some(1), move |env, call| {
            let v = call.next_arg(env).unwrap_or(Value::Void);
            sink.borrow_mut().push(env.value_to_string(v));
            v
        });
        log
    }

    fn note(env: &mut Env, text: &str) -> ExprId {
        let s = env.symbol(text);
        let arg = env.constant(s);
        env.function_call("note", &[arg]).unwrap()
    }

    fn call_next(env: &mut Env) -> ExprId {
        env.function_call("call-next-handler", &[]).unwrap()
    }

    fn handler(env: &mut Env, class: ClassId, role: HandlerRole, body: &[ExprId]) {
        let actions = env.link_expressions(body);
        env.define_handler(class, "go", role, 0, None, actions).unwrap();
    }

    fn instance(env: &mut Env, name: &str, class: ClassId) -> Value {
        let v = env.make_instance(name, class).unwrap();
        env.install_value(v);
        v
    }

    #[test]
    fn around_wraps_first_primary() {
        let mut env = Env::new();
        let log = with_log(&mut env);
        let a = env.define_class("A", &[], vec![]).unwrap();
        let b = env.define_class("B", &[a], vec![]).unwrap();

        for (class, name) in [(a, "A"), (b, "B")] {
            let primary = note(&mut env, name);
            handler(&mut env, class, HandlerRole::Primary, &[primary]);
            let enter = note(&mut env, &format!("enter-{}", name));
            let next = call_next(&mut env);
            let exit = note(&mut env, &format!("exit-{}", name));
            handler(&mut env, class, HandlerRole::Around, &[enter, next, exit]);
        }

        let obj = instance(&mut env, "b1", b);
        env.send(obj, "go", None);
        assert!(!env.evaluation_error());
        assert_eq!(
            *log.borrow(),
            vec!["enter-B", "enter-A", "B", "exit-A", "exit-B"]
        );
    }

    #[test]
    fn roles_run_in_order() {
        let mut env = Env::new();
        let log = with_log(&mut env);
        let a = env.define_class("A", &[], vec![]).unwrap();
        let b = env.define_class("B", &[a], vec![]).unwrap();

        for (class, name) in [(a, "A"), (b, "B")] {
            for role in [HandlerRole::Before, HandlerRole::Primary, HandlerRole::After] {
                let body = note(&mut env, &format!("{}-{}", role.name(), name));
                handler(&mut env, class, role, &[body]);
            }
        }

        let obj = instance(&mut env, "b1", b);
        let out = env.send(obj, "go", None);
        assert_eq!(env.as_text(out), Some("primary-B"));
        assert_eq!(
            *log.borrow(),
            vec!["before-B", "before-A", "primary-B", "after-A", "after-B"]
        );
    }

    #[test]
    fn repeated_call_next_reruns_shadowed_primary() {
        let mut env = Env::new();
        let log = with_log(&mut env);
        let a = env.define_class("A", &[], vec![]).unwrap();
        let b = env.define_class("B", &[a], vec![]).unwrap();

        let body = note(&mut env, "A");
        handler(&mut env, a, HandlerRole::Primary, &[body]);
        let first = call_next(&mut env);
        let second = call_next(&mut env);
        let own = note(&mut env, "B");
        handler(&mut env, b, HandlerRole::Primary, &[first, second, own]);

        let obj = instance(&mut env, "b1", b);
        env.send(obj, "go", None);
        assert_eq!(*log.borrow(), vec!["A", "A", "B"]);
    }

    #[test]
    fn next_handlerp_and_misuse() {
        let (mut env, sink) = captured_env();
        let a = env.define_class("A", &[], vec![]).unwrap();
        let probe = env.function_call("next-handlerp", &[]).unwrap();
        handler(&mut env, a, HandlerRole::Primary, &[probe]);

        let obj = instance(&mut env, "a1", a);
        let out = env.send(obj, "go", None);
        assert!(env.is_false(out));
        assert!(!env.evaluation_error());

        let next = call_next(&mut env);
        let out = env.evaluate(next);
        assert!(env.is_false(out));
        assert!(env.evaluation_error());
        assert!(sink
            .text()
            .starts_with("[MSGPASS1] Shadowed message-handlers not applicable"));
    }

    #[test]
    fn override_replaces_arguments() {
        let mut env = Env::new();
        let log = with_log(&mut env);
        let a = env.define_class("A", &[], vec![]).unwrap();
        let b = env.define_class("B", &[a], vec![]).unwrap();

        // A's primary notes its first argument
        let p1 = env.parameter(1);
        let body = env.function_call("note", &[p1]).unwrap();
        env.define_handler(a, "go", HandlerRole::Primary, 1, Some(1), Some(body))
            .unwrap();

        let s = env.symbol("replaced");
        let arg = env.constant(s);
        let over = env.function_call("override-next-handler", &[arg]).unwrap();
        let p1 = env.parameter(1);
        let after = env.function_call("note", &[p1]).unwrap();
        let actions = env.link_expressions(&[over, after]);
        env.define_handler(b, "go", HandlerRole::Primary, 1, Some(1), actions)
            .unwrap();

        let obj = instance(&mut env, "b1", b);
        let orig = env.symbol("original");
        let arg = env.constant(orig);
        env.send(obj, "go", Some(arg));
        assert!(!env.evaluation_error());
        assert_eq!(*log.borrow(), vec!["replaced", "original"]);
    }

    #[test]
    fn missing_primary_is_reported_once() {
        let (mut env, sink) = captured_env();
        let a = env.define_class("A", &[], vec![]).unwrap();
        let b = env.define_class("B", &[a], vec![]).unwrap();
        let t = env.true_value();
        for class in [a, b] {
            let body = env.constant(t);
            env.define_handler(class, "go", HandlerRole::Before, 0, None, Some(body))
                .unwrap();
        }

        let obj = instance(&mut env, "b1", b);
        let out = env.send(obj, "go", None);
        assert!(env.is_false(out));
        assert!(env.evaluation_error());
        assert_eq!(sink.text(), "[MSGPASS4] No primary message-handlers found for go.\n");
        assert_eq!(env.class_busy(a), 0);
        assert_eq!(env.handler_busy(b, "go", HandlerRole::Before), Some(0));
    }

    #[test]
    fn stale_instances_are_rejected() {
        let (mut env, sink) = captured_env();
        let log = with_log(&mut env);
        let a = env.define_class("A", &[], vec![]).unwrap();
        let body = note(&mut env, "ran");
        handler(&mut env, a, HandlerRole::Primary, &[body]);

        let obj = instance(&mut env, "a1", a);
        let Value::InstanceAddress(id) = obj else {
            panic!("not an instance");
        };
        env.delete_instance(id);

        let out = env.send(obj, "go", None);
        assert!(env.is_false(out));
        assert!(env.evaluation_error());
        assert!(log.borrow().is_empty());
        assert!(sink.text().starts_with("[MSGPASS3] Static reference to deleted instance."));
    }

    #[test]
    fn instance_names_resolve() {
        let (mut env, sink) = captured_env();
        let a = env.define_class("A", &[], vec![]).unwrap();
        let self_ref = env.parameter(0);
        handler(&mut env, a, HandlerRole::Primary, &[self_ref]);
        let obj = instance(&mut env, "a1", a);

        let name = env.instance_name("a1");
        assert_eq!(env.send(name, "go", None), obj);

        let missing = env.instance_name("nobody");
        env.send(missing, "go", None);
        assert!(env.evaluation_error());
        assert_eq!(sink.text(), "[MSGPASS2] No such instance nobody in function send.\n");
    }

    #[test]
    fn busy_counts_track_active_sends() {
        let mut env = Env::new();
        let a = env.define_class("A", &[], vec![]).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let out = seen.clone();
        env.define_function("busy", 0, Some(0), move |env, _| {
            let class = env.find_class("A").unwrap();
            out.borrow_mut().push((
                env.class_busy(class),
                env.handler_busy(class, "go", HandlerRole::Primary),
                env.message_depth(),
            ));
            env.true_value()
        });
        let body = env.function_call("busy", &[]).unwrap();
        handler(&mut env, a, HandlerRole::Primary, &[body]);

        let obj = instance(&mut env, "a1", a);
        env.send(obj, "go", None);
        assert_eq!(*seen.borrow(), vec![(1, Some(1), 1)]);
        assert_eq!(env.class_busy(a), 0);
        assert_eq!(env.handler_busy(a, "go", HandlerRole::Primary), Some(0));
        assert_eq!(env.message_depth(), 0);
    }

    #[test]
    fn handlers_are_pinned_during_sends() {
        let mut env = Env::new();
        let log = with_log(&mut env);
        let a = env.define_class("A", &[], vec![]).unwrap();
        let b = env.define_class("B", &[a], vec![]).unwrap();

        let body = note(&mut env, "other");
        env.define_handler(a, "other", HandlerRole::Primary, 0, None, Some(body))
            .unwrap();
        let results = Rc::new(RefCell::new(Vec::new()));
        let out = results.clone();
        env.define_function("drop-other", 0, Some(0), move |env, _| {
            let a = env.find_class("A").unwrap();
            let b = env.find_class("B").unwrap();
            let mut out = out.borrow_mut();
            out.push(env.undefine_handler(a, "other", HandlerRole::Primary).is_ok());
            out.push(env.define_handler(a, "other", HandlerRole::Primary, 0, None, None).is_ok());
            out.push(env.define_handler(b, "fresh", HandlerRole::Primary, 0, None, None).is_ok());
            env.true_value()
        });
        let dropper = env.function_call("drop-other", &[]).unwrap();
        let next = call_next(&mut env);
        handler(&mut env, b, HandlerRole::Primary, &[dropper, next]);
        let tail = note(&mut env, "A");
        handler(&mut env, a, HandlerRole::Primary, &[tail]);

        let obj = instance(&mut env, "b1", b);
        env.send(obj, "go", None);
        assert!(!env.evaluation_error());
        assert_eq!(*results.borrow(), vec![false, false, false]);
        assert_eq!(*log.borrow(), vec!["A"]);
        assert_eq!(env.class_busy(a), 0);
        assert_eq!(env.class_busy(b), 0);

        env.undefine_handler(a, "other", HandlerRole::Primary).unwrap();
        env.send(obj, "go", None);
        assert_eq!(*log.borrow(), vec!["A", "A"]);
        assert_eq!(env.handler_busy(a, "go", HandlerRole::Primary), Some(0));
    }

    #[test]
    fn nested_sends_restore_core() {
        let mut env = Env::new();
        let log = with_log(&mut env);
        let a = env.define_class("A", &[], vec![]).unwrap();
        let b = env.define_class("B", &[a], vec![]).unwrap();
        let other = env.define_class("OTHER", &[], vec![]).unwrap();

        let inner = note(&mut env, "inner");
        env.define_handler(other, "ping", HandlerRole::Primary, 0, Some(0), Some(inner))
            .unwrap();
        let body = note(&mut env, "A");
        handler(&mut env, a, HandlerRole::Primary, &[body]);

        // B sends ping before calling the shadowed primary
        let target = env.instance_name("o1");
        let target = env.constant(target);
        let ping = env.symbol("ping");
        let ping = env.constant(ping);
        let send = env.function_call("send", &[target, ping]).unwrap();
        let next = call_next(&mut env);
        handler(&mut env, b, HandlerRole::Primary, &[send, next]);

        instance(&mut env, "o1", other);
        let obj = instance(&mut env, "b1", b);
        env.send(obj, "go", None);
        assert!(!env.evaluation_error());
        assert_eq!(*log.borrow(), vec!["inner", "A"]);
    }

    #[test]
    fn handler_arguments_are_checked() {
        let (mut env, sink) = captured_env();
        let a = env.define_class("A", &[], vec![]).unwrap();
        let t = env.true_value();
        let body = env.constant(t);
        env.define_handler(a, "go", HandlerRole::Primary, 1, Some(1), Some(body))
            .unwrap();

        let obj = instance(&mut env, "a1", a);
        env.send(obj, "go", None);
        assert!(env.evaluation_error());
        assert_eq!(
            sink.text(),
            "[MSGPASS5] Message-handler go primary in class A expected exactly 1 argument(s).\n"
        );
    }

    #[test]
    fn primitives_use_system_classes() {
        let mut env = Env::new();
        let integer = env.find_class("INTEGER").unwrap();
        let number = env.find_class("NUMBER").unwrap();
        let self_ref = env.parameter(0);
        env.define_handler(number, "twin", HandlerRole::Primary, 0, Some(0), Some(self_ref))
            .unwrap();
        assert_eq!(env.primitive_class(TypeCode::INTEGER), Some(integer));

        let five = env.integer(5);
        assert_eq!(env.send_values(five, "twin", &[]), five);
        assert!(!env.evaluation_error());
    }

    #[test]
    #[should_panic(expected = "MSGPASS6")]
    fn classless_primitive_is_fatal() {
        let (mut env, _sink) = captured_env();
        env.send_values(Value::Void, "go", &[]);
    }

    #[test]
    fn halt_stops_the_core() {
        let mut env = Env::new();
        let log = with_log(&mut env);
        let a = env.define_class("A", &[], vec![]).unwrap();
        let halt = env.function_call("halt", &[]).unwrap();
        handler(&mut env, a, HandlerRole::Before, &[halt]);
        let body = note(&mut env, "primary");
        handler(&mut env, a, HandlerRole::Primary, &[body]);

        let obj = instance(&mut env, "a1", a);
        env.send(obj, "go", None);
        assert!(env.halt_execution());
        assert!(log.borrow().is_empty());
        assert_eq!(env.class_busy(a), 0);
    }
}
