//! Mark-sweep cycle collector (spec.md §4.4). Plain `Rc` already frees every
//! acyclic structure for free; this module exists only to reclaim the
//! `Pointer`-induced cycles `Rc` can never see on its own, mirroring the
//! five-step sweep in `roman2.c`'s `VM_Gar`.

use std::collections::HashSet;

use crate::value::{Payload, Value};

/// Buffer added to the live-set size after a sweep before the next
/// collection is triggered again, so `Gar` doesn't thrash on a
/// steady-state working set that sits right at the threshold.
pub const SWEEP_BUFFER: usize = 64;

/// Tracks every `Value` the VM has ever allocated that could participate in
/// a cycle (Queue/Map/Pointer), keyed by heap address. A plain `Vec` would
/// do, but a running `cap` lets the VM skip the walk entirely until the
/// tracked set has actually grown since the last sweep.
pub struct Collector {
    tracked: Vec<Value>,
    cap: usize,
}

impl Collector {
    pub fn new() -> Collector {
        Collector {
            tracked: Vec::new(),
            cap: SWEEP_BUFFER,
        }
    }

    pub fn track(&mut self, value: Value) {
        self.tracked.push(value);
    }

    /// Tracks `v` and, recursively, every Queue/Map/Pointer value reachable
    /// from it. Used wherever the VM materializes a value that isn't itself
    /// a clone of something already tracked — `Cop`'s `deep_copy`, chiefly,
    /// which mints brand-new containers at every level it descends into.
    pub fn track_tree(&mut self, v: &Value) {
        if matches!(
            &*v.0.payload.borrow(),
            Payload::Queue(_) | Payload::Map(_) | Payload::Pointer(_)
        ) {
            self.track(v.clone());
        }
        for child in Self::all_children(v) {
            self.track_tree(&child);
        }
    }

    pub fn should_collect(&self) -> bool {
        self.tracked.len() >= self.cap
    }

    /// Step 1-5 of spec.md §4.4: reach everything from the stack roots,
    /// treat whatever in the tracked set wasn't reached (and isn't
    /// constant) as garbage, identify which garbage values are referenced
    /// *only* by other garbage (the "parents"), and drop those — breaking
    /// the cycle lets `Rc`'s own refcounting free the rest on the next
    /// drop. Returns the number of values collected.
    pub fn collect(&mut self, roots: &[Value]) -> usize {
        let reachable = Self::reachable_from(roots);

        let garbage: Vec<Value> = self
            .tracked
            .iter()
            .filter(|v| !v.is_constant() && !reachable.contains(&v.addr()))
            .cloned()
            .collect();
        let garbage_addrs: HashSet<usize> = garbage.iter().map(|v| v.addr()).collect();

        // A "parent" is a garbage value not referenced by any other garbage
        // value via a non-Pointer edge (Queue/Map element) — i.e. the entry
        // point of a cycle component, found by elimination: start from every
        // garbage value reachable, and mark any value it points to (except
        // through Pointer, which sweeping will already sever) as "has a
        // parent inside the garbage set".
        let mut referenced_within_garbage: HashSet<usize> = HashSet::new();
        for v in &garbage {
            for child in Self::non_pointer_children(v) {
                if garbage_addrs.contains(&child.addr()) {
                    referenced_within_garbage.insert(child.addr());
                }
            }
        }

        let mut collected = 0;
        for v in &garbage {
            if !referenced_within_garbage.contains(&v.addr()) {
                Self::sever(v);
                collected += 1;
            }
        }

        self.tracked.retain(|v| !garbage_addrs.contains(&v.addr()));
        self.cap = self.tracked.len() + SWEEP_BUFFER;
        collected
    }

    fn reachable_from(roots: &[Value]) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack: Vec<Value> = roots.to_vec();
        while let Some(v) = stack.pop() {
            if !seen.insert(v.addr()) {
                continue;
            }
            for child in Self::all_children(&v) {
                stack.push(child);
            }
        }
        seen
    }

    fn all_children(v: &Value) -> Vec<Value> {
        match &*v.0.payload.borrow() {
            Payload::Queue(q) => q.borrow().iter().cloned().collect(),
            Payload::Map(m) => m.borrow().values().cloned().collect(),
            Payload::Char { parent, .. } => vec![parent.clone()],
            Payload::Pointer(p) => vec![p.borrow().clone()],
            _ => Vec::new(),
        }
    }

    /// Same as `all_children` but never follows a `Pointer` edge — used to
    /// find cycle entry points, since a `Pointer` destructor doesn't
    /// recurse during sweep (spec.md §4.4 step 3).
    fn non_pointer_children(v: &Value) -> Vec<Value> {
        match &*v.0.payload.borrow() {
            Payload::Queue(q) => q.borrow().iter().cloned().collect(),
            Payload::Map(m) => m.borrow().values().cloned().collect(),
            Payload::Char { parent, .. } => vec![parent.clone()],
            _ => Vec::new(),
        }
    }

    /// Empty out a garbage parent's container in place so its `Rc` strong
    /// count to its children drops; a `Pointer`'s target is left alone
    /// (sweep mode doesn't recurse through pointers).
    fn sever(v: &Value) {
        match &*v.0.payload.borrow() {
            Payload::Queue(q) => q.borrow_mut().clear(),
            Payload::Map(m) => m.borrow_mut().clear(),
            _ => {}
        }
    }
}

impl Default for Collector {
    fn default() -> Collector {
        Collector::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn collects_a_self_referential_queue() {
        let mut gc = Collector::new();
        let q = Value::empty_queue();
        let ptr = Value::pointer(q.clone());
        q.push_back(ptr.clone()).unwrap();
        gc.track(q.clone());
        gc.track(ptr.clone());
        drop(q);
        drop(ptr);
        let collected = gc.collect(&[]);
        assert_eq!(collected, 1);
    }

    #[test]
    fn live_roots_survive() {
        let mut gc = Collector::new();
        let q = Value::empty_queue();
        gc.track(q.clone());
        let collected = gc.collect(&[q.clone()]);
        assert_eq!(collected, 0);
    }
}
