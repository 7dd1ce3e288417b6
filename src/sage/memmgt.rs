// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/memmgt.rs

// Memory management for the rule engine. Hands out fallible scratch
// buffers under an optional ceiling, holds the out-of-memory handler,
// runs periodic tasks at evaluation yield points, and reclaims idle
// atoms, multifields, and deleted instances.

// <>

use super::Env;

use std::rc::Rc;

/// Called with the size of a failed request; returning true asks for
/// one more attempt
pub type OomHandler = Rc<dyn Fn(&mut Env, usize) -> bool>;

struct PeriodicTask {
    name: String,
    priority: i32,
    action: Rc<dyn Fn(&mut Env)>,
}

pub struct MemoryState {
    /// Byte ceiling for a single scratch request
    limit: Option<usize>,
    pub(crate) oom: Option<OomHandler>,
    periodic: Vec<PeriodicTask>,
    /// Set while periodic tasks run, so they never nest
    in_periodic: bool,
    /// A sweep was asked for while calls were in progress
    reclaim_pending: bool,
}

impl MemoryState {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            oom: None,
            periodic: Vec::new(),
            in_periodic: false,
            reclaim_pending: false,
        }
    }

    fn try_alloc(&self, bytes: usize) -> Option<Vec<u8>> {
        if self.limit.is_some_and(|limit| bytes > limit) {
            return None;
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes).ok()?;
        buf.resize(bytes, 0);
        Some(buf)
    }
}

impl Env {
    pub fn set_scratch_limit(&mut self, limit: Option<usize>) {
        self.memory.limit = limit;
        self.config.scratch_limit = limit;
    }

    /// Installs an out-of-memory handler, returning the previous one
    pub fn set_out_of_memory_handler(&mut self, handler: Option<OomHandler>) -> Option<OomHandler> {
        std::mem::replace(&mut self.memory.oom, handler)
    }

    /// Zeroed scratch buffer of `bytes` bytes, or `None` if memory is
    /// unavailable and the handler could not free any
    pub fn allocate_scratch(&mut self, bytes: usize) -> Option<Vec<u8>> {
        if let Some(buf) = self.memory.try_alloc(bytes) {
            return Some(buf);
        }

        let handler = self.memory.oom.clone()?;
        if handler(self, bytes) {
            self.memory.try_alloc(bytes)
        } else {
            None
        }
    }

    /// Adds a task run at every evaluation yield point, highest
    /// priority first; fails if the name is taken
    pub fn add_periodic_task(
        &mut self,
        name: &str,
        priority: i32,
        action: impl Fn(&mut Env) + 'static,
    ) -> bool {
        if self.memory.periodic.iter().any(|t| t.name == name) {
            return false;
        }
        let at = self
            .memory
            .periodic
            .iter()
            .position(|t| t.priority < priority)
            .unwrap_or(self.memory.periodic.len());
        self.memory.periodic.insert(
            at,
            PeriodicTask {
                name: name.to_string(),
                priority,
                action: Rc::new(action),
            },
        );
        true
    }

    pub fn remove_periodic_task(&mut self, name: &str) -> bool {
        let before = self.memory.periodic.len();
        self.memory.periodic.retain(|t| t.name != name);
        before != self.memory.periodic.len()
    }

    pub(crate) fn run_periodic_tasks(&mut self) {
        if self.memory.in_periodic || self.memory.periodic.is_empty() {
            return;
        }

        let tasks: Vec<_> = self.memory.periodic.iter().map(|t| t.action.clone()).collect();
        let mut env = self.scoped(|env| env.memory.in_periodic = false);
        env.memory.in_periodic = true;
        for task in tasks {
            task(&mut *env);
        }
    }

    /// Runs a sweep that `reclaim` deferred, once no call is in
    /// progress
    pub(crate) fn finish_deferred_reclaim(&mut self) {
        if self.memory.reclaim_pending && self.evaluation_depth() == 0 && self.message_depth() == 0 {
            self.reclaim();
        }
    }

    /// Frees deleted idle instances, then every atom and multifield
    /// whose busy count is zero; returns the number of entries freed
    ///
    /// Values not installed by anyone are invalid afterwards. While a
    /// function call or message is in progress the sweep is deferred
    /// until the outermost call returns, and 0 is returned
    pub fn reclaim(&mut self) -> usize {
        if self.evaluation_depth() > 0 || self.message_depth() > 0 {
            self.memory.reclaim_pending = true;
            log::debug!("reclaim deferred at depth {}", self.evaluation_depth());
            return 0;
        }
        self.memory.reclaim_pending = false;

        let mut freed = self.reclaim_instances();
        freed += self.multifields.sweep();
        freed += self.atoms.symbols.sweep().len();
        freed += self.atoms.integers.sweep().len();
        freed += self.atoms.floats.sweep().len();

        for (kind, data) in self.atoms.externals.sweep() {
            freed += 1;
            let discard = self.external_types.get(kind).and_then(|t| t.discard.clone());
            if let Some(discard) = discard {
                discard(self, data);
            }
        }

        log::debug!("reclaimed {} idle entries", freed);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::super::primtab::ExternalAddressType;
    use super::super::SymbolKind;
    use super::*;

    use std::any::Any;
    use std::cell::{Cell, RefCell};

    #[test]
    fn scratch_respects_limit() {
        let mut env = Env::new();
        env.set_scratch_limit(Some(64));
        assert_eq!(env.allocate_scratch(64).map(|b| b.len()), Some(64));
        assert!(env.allocate_scratch(65).is_none());
    }

    #[test]
    fn handler_can_free_memory() {
        let mut env = Env::new();
        env.set_scratch_limit(Some(8));
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        env.set_out_of_memory_handler(Some(Rc::new(move |env: &mut Env, bytes: usize| {
            seen.set(seen.get() + 1);
            env.set_scratch_limit(Some(bytes));
            true
        })));

        assert!(env.allocate_scratch(32).is_some());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn periodic_tasks_in_priority_order() {
        let mut env = Env::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (name, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
            let order = order.clone();
            assert!(env.add_periodic_task(name, priority, move |_| {
                order.borrow_mut().push(name)
            }));
        }
        assert!(!env.add_periodic_task("low", 0, |_| {}));

        let call = env.function_call("create$", &[]).unwrap();
        env.evaluate(call);
        assert_eq!(*order.borrow(), vec!["high", "mid", "low"]);

        assert!(env.remove_periodic_task("mid"));
        assert!(!env.remove_periodic_task("mid"));
    }

    #[test]
    fn reclaim_frees_only_idle_entries() {
        let mut env = Env::new();
        let kept = env.symbol("kept");
        env.symbol("idle");
        env.install_value(kept);

        env.reclaim();
        assert_eq!(env.as_text(kept), Some("kept"));
        assert!(env.atoms.find_symbol(SymbolKind::Symbol, "idle").is_none());

        // permanent symbols stay
        assert_eq!(env.as_text(env.false_value()), Some("FALSE"));
    }

    #[test]
    fn reclaim_waits_for_calls_in_progress() {
        let mut env = Env::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let out = seen.clone();
        env.define_function("sweep", 0, Some(0), move |env, _| {
            let fresh = env.symbol("fresh");
            out.borrow_mut().push(env.reclaim());
            let kept = env.atoms.find_symbol(SymbolKind::Symbol, "fresh").is_some();
            out.borrow_mut().push(kept as usize);
            fresh
        });
        env.symbol("idle");

        let call = env.function_call("sweep", &[]).unwrap();
        let result = env.evaluate(call);
        assert_eq!(*seen.borrow(), vec![0, 1]);
        // the deferred sweep ran after the call and kept its result
        assert!(env.atoms.find_symbol(SymbolKind::Symbol, "idle").is_none());
        assert_eq!(env.as_text(result), Some("fresh"));
    }

    #[test]
    fn reclaim_discards_external_addresses() {
        let mut env = Env::new();
        let dropped = Rc::new(Cell::new(false));
        let flag = dropped.clone();
        let kind = env
            .install_external_address_type(ExternalAddressType {
                name: "HANDLE".to_string(),
                discard: Some(Rc::new(move |_env: &mut Env, data: Rc<dyn Any>| {
                    assert_eq!(data.downcast_ref::<i32>(), Some(&3));
                    flag.set(true);
                })),
                ..Default::default()
            })
            .unwrap();

        let addr = env.external_address(kind, Rc::new(3i32));
        env.install_value(addr);
        env.reclaim();
        assert!(!dropped.get());

        env.deinstall_value(addr);
        env.reclaim();
        assert!(dropped.get());
    }
}
