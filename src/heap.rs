//! The managed heap.
//!
//! Every compound value (pair, vector, bytevector, string, closure,
//! environment frame, call frame) lives in a heap node. Nodes are
//! reference-counted through `Rc`, so acyclic data is reclaimed promptly as
//! the last handle to it drops; cloning and dropping a [`Value`] is the
//! retain/release protocol. Reference counting alone cannot reclaim cycles
//! (pairs can point at themselves, closures and environments refer to each
//! other, reified continuations keep whole frame chains alive), so the heap
//! also registers a weak handle to every node it ever allocates and offers
//! a mark pass over that registry.
//!
//! [`Collector`] implements the mark pass: the caller marks its roots (the
//! VM registers, the frame chain, the top-level environment, plus anything
//! on the protection stack), then `finish` severs the body of every
//! registered live node the marking never reached. Severing replaces the
//! body with [`NodeBody::Freed`], which drops the node's outgoing
//! references in one step without recursing through reference counts - the
//! cycle is broken, and `Rc` reclaims the garbage as the counts hit zero.
//! Collection is idempotent: a second pass with the same roots frees
//! nothing further.

use crate::env::EnvRef;
use crate::value::{Formals, Rib, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Collections are considered once this many allocations have happened
/// since the previous one.
pub const DEFAULT_GC_THRESHOLD: usize = 4096;

/// A strong handle to a heap node.
pub type NodeRef = Rc<Node>;

/// One heap allocation: a mark bit for the collector and the payload.
pub struct Node {
    pub(crate) marked: Cell<bool>,
    pub body: RefCell<NodeBody>,
}

/// Payload of a heap node.
pub enum NodeBody {
    Pair(Value, Value),
    Vector(Vec<Value>),
    Bytevector(Vec<u8>),
    Text(String),
    Closure(ClosureBody),
    Env(EnvBody),
    Frame(FrameBody),
    /// Severed by the cycle collector. Reachable code never observes this.
    Freed,
}

/// A closure: captured environment, compiled body, formal parameters, and
/// (for reified continuations only) the captured call frame.
pub struct ClosureBody {
    pub env: EnvRef,
    pub body: Value,
    pub formals: Formals,
    pub frame: Option<NodeRef>,
}

/// One environment frame: bindings are shared cells, so every closure
/// capturing this frame observes later assignments.
pub struct EnvBody {
    pub bindings: HashMap<String, Value>,
    pub parent: Option<NodeRef>,
}

/// The suspended state of a caller, pushed by the `frame` instruction and
/// popped by `return`. Frames chain through `next` to form the control
/// stack; because they are heap nodes, `call/cc` can capture a chain that
/// outlives the call that created it.
pub struct FrameBody {
    /// The instruction list to resume once the call returns.
    pub ret: Value,
    pub env: EnvRef,
    pub rib: Rib,
    pub next: Option<NodeRef>,
}

pub struct Heap {
    registry: Vec<Weak<Node>>,
    protected: Vec<Value>,
    allocations_since_collect: usize,
    threshold: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_GC_THRESHOLD)
    }

    /// A heap with a custom collection watermark. Tests use a tiny
    /// threshold to force frequent collections.
    pub fn with_threshold(threshold: usize) -> Self {
        Heap {
            registry: Vec::new(),
            protected: Vec::new(),
            allocations_since_collect: 0,
            threshold,
        }
    }

    /// Allocate a node, register it with the collector, and hand back a
    /// strong reference.
    pub fn allocate(&mut self, body: NodeBody) -> NodeRef {
        let node = Rc::new(Node {
            marked: Cell::new(false),
            body: RefCell::new(body),
        });
        self.registry.push(Rc::downgrade(&node));
        self.allocations_since_collect += 1;
        node
    }

    /// Whether the allocation watermark has been crossed since the last
    /// collection. The VM polls this between instructions.
    pub fn wants_collect(&self) -> bool {
        self.allocations_since_collect >= self.threshold
    }

    /// Number of registered nodes that are still alive. This is the
    /// heap-size accessor the collection tests observe.
    pub fn live_nodes(&self) -> usize {
        self.registry
            .iter()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }

    /// Shield a value from the collector until the matching
    /// [`Heap::unprotect`]. Used by the host for values that are live but
    /// not reachable from any VM register, such as a datum being compiled.
    pub fn protect(&mut self, value: Value) {
        self.protected.push(value);
    }

    pub fn unprotect(&mut self) {
        self.protected.pop();
    }

    /// Begin a collection. Mark the roots on the returned collector, then
    /// call [`Collector::finish`].
    pub fn collector(&mut self) -> Collector<'_> {
        Collector::new(self)
    }

    // -- allocation helpers ------------------------------------------------

    pub fn cons(&mut self, car: Value, cdr: Value) -> Value {
        Value::Pair(self.allocate(NodeBody::Pair(car, cdr)))
    }

    /// Build a proper list from the items.
    pub fn list_from(&mut self, items: Vec<Value>) -> Value {
        self.improper_from(items, Value::Null)
    }

    /// Build a list from the items ending in `tail` rather than `()`.
    pub fn improper_from(&mut self, items: Vec<Value>, tail: Value) -> Value {
        let mut list = tail;
        for item in items.into_iter().rev() {
            list = self.cons(item, list);
        }
        list
    }

    pub fn string_value(&mut self, text: String) -> Value {
        Value::String(self.allocate(NodeBody::Text(text)))
    }

    pub fn vector_value(&mut self, items: Vec<Value>) -> Value {
        Value::Vector(self.allocate(NodeBody::Vector(items)))
    }

    pub fn bytevector_value(&mut self, bytes: Vec<u8>) -> Value {
        Value::Bytevector(self.allocate(NodeBody::Bytevector(bytes)))
    }

    pub fn closure(
        &mut self,
        env: EnvRef,
        body: Value,
        formals: Formals,
        frame: Option<NodeRef>,
    ) -> Value {
        Value::Closure(self.allocate(NodeBody::Closure(ClosureBody {
            env,
            body,
            formals,
            frame,
        })))
    }

    pub fn frame(&mut self, ret: Value, env: EnvRef, rib: Rib, next: Option<NodeRef>) -> NodeRef {
        self.allocate(NodeBody::Frame(FrameBody {
            ret,
            env,
            rib,
            next,
        }))
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-progress mark phase. Tri-color marking with an explicit gray
/// worklist, so deep structures do not recurse on the native stack.
pub struct Collector<'h> {
    heap: &'h mut Heap,
    gray: Vec<NodeRef>,
}

impl<'h> Collector<'h> {
    fn new(heap: &'h mut Heap) -> Self {
        let protected = heap.protected.clone();
        let mut collector = Collector {
            heap,
            gray: Vec::new(),
        };
        for value in &protected {
            collector.mark_value(value);
        }
        collector
    }

    pub fn mark_value(&mut self, value: &Value) {
        if let Some(node) = value.node() {
            self.mark_node(node);
        }
    }

    pub fn mark_node(&mut self, node: &NodeRef) {
        if !node.marked.get() {
            node.marked.set(true);
            self.gray.push(node.clone());
        }
    }

    /// Trace the gray set to fixpoint, then sever every registered node
    /// the marking never reached. Returns the number of nodes severed.
    pub fn finish(mut self) -> usize {
        while let Some(node) = self.gray.pop() {
            let children: Vec<NodeRef> = {
                let body = node.body.borrow();
                body_children(&body)
            };
            for child in &children {
                self.mark_node(child);
            }
        }

        let mut severed = 0;
        for weak in &self.heap.registry {
            if let Some(node) = weak.upgrade()
                && !node.marked.get()
            {
                // Dropping the old body releases the node's outgoing
                // references without recursing through refcounts.
                *node.body.borrow_mut() = NodeBody::Freed;
                severed += 1;
            }
        }

        self.heap.registry.retain(|weak| match weak.upgrade() {
            Some(node) => {
                node.marked.set(false);
                true
            }
            None => false,
        });
        self.heap.allocations_since_collect = 0;

        debug!(
            severed,
            live = self.heap.registry.len(),
            "heap collection finished"
        );
        severed
    }
}

fn body_children(body: &NodeBody) -> Vec<NodeRef> {
    let mut children = Vec::new();
    fn push_value(value: &Value, children: &mut Vec<NodeRef>) {
        if let Some(node) = value.node() {
            children.push(node.clone());
        }
    }
    match body {
        NodeBody::Pair(car, cdr) => {
            push_value(car, &mut children);
            push_value(cdr, &mut children);
        }
        NodeBody::Vector(items) => {
            for item in items {
                push_value(item, &mut children);
            }
        }
        NodeBody::Closure(closure) => {
            children.push(closure.env.node().clone());
            push_value(&closure.body, &mut children);
            if let Some(frame) = &closure.frame {
                children.push(frame.clone());
            }
        }
        NodeBody::Env(env) => {
            for value in env.bindings.values() {
                push_value(value, &mut children);
            }
            if let Some(parent) = &env.parent {
                children.push(parent.clone());
            }
        }
        NodeBody::Frame(frame) => {
            push_value(&frame.ret, &mut children);
            children.push(frame.env.node().clone());
            for value in &frame.rib {
                push_value(value, &mut children);
            }
            if let Some(next) = &frame.next {
                children.push(next.clone());
            }
        }
        NodeBody::Bytevector(_) | NodeBody::Text(_) | NodeBody::Freed => {}
    }
    children
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acyclic_data_is_reclaimed_by_refcount_alone() {
        let mut heap = Heap::new();
        let list = heap.list_from(vec![Value::Null, Value::Boolean(true)]);
        assert_eq!(heap.live_nodes(), 2);
        drop(list);
        // No collection needed: the Rc counts hit zero immediately.
        assert_eq!(heap.live_nodes(), 0);
    }

    #[test]
    fn test_self_referential_pair_survives_refcount_but_not_collection() {
        let mut heap = Heap::new();
        let pair = heap.cons(Value::Null, Value::Null);
        if let Value::Pair(node) = &pair {
            *node.body.borrow_mut() = NodeBody::Pair(pair.clone(), Value::Null);
        }
        drop(pair);
        // The cycle keeps the node alive despite having no external owner.
        assert_eq!(heap.live_nodes(), 1);

        let severed = heap.collector().finish();
        assert_eq!(severed, 1);
        assert_eq!(heap.live_nodes(), 0);
    }

    #[test]
    fn test_marked_roots_survive_collection() {
        let mut heap = Heap::new();
        let keep = heap.cons(Value::Boolean(true), Value::Null);
        let lose = heap.cons(Value::Boolean(false), Value::Null);

        let mut gc = heap.collector();
        gc.mark_value(&keep);
        let severed = gc.finish();
        assert_eq!(severed, 1);

        // The kept pair is still addressable with its payload intact.
        assert_eq!(keep.car().and_then(|v| v.as_bool()), Some(true));
        // The severed pair's handle still exists but its body is gone.
        if let Value::Pair(node) = &lose {
            assert!(matches!(*node.body.borrow(), NodeBody::Freed));
        }
    }

    #[test]
    fn test_collection_is_idempotent() {
        let mut heap = Heap::new();
        let pair = heap.cons(Value::Null, Value::Null);
        if let Value::Pair(node) = &pair {
            *node.body.borrow_mut() = NodeBody::Pair(pair.clone(), pair.clone());
        }
        drop(pair);
        assert_eq!(heap.collector().finish(), 1);
        assert_eq!(heap.collector().finish(), 0);
        assert_eq!(heap.collector().finish(), 0);
    }

    #[test]
    fn test_protection_stack_shields_unrooted_values() {
        let mut heap = Heap::new();
        let datum = heap.cons(Value::Boolean(true), Value::Null);
        heap.protect(datum.clone());
        heap.collector().finish();
        assert_eq!(heap.live_nodes(), 1);

        heap.unprotect();
        drop(datum);
        assert_eq!(heap.live_nodes(), 0);
    }

    #[test]
    fn test_watermark_policy() {
        let mut heap = Heap::with_threshold(3);
        assert!(!heap.wants_collect());
        let _a = heap.cons(Value::Null, Value::Null);
        let _b = heap.cons(Value::Null, Value::Null);
        assert!(!heap.wants_collect());
        let _c = heap.cons(Value::Null, Value::Null);
        assert!(heap.wants_collect());
        let mut gc = heap.collector();
        gc.mark_value(&_a);
        gc.mark_value(&_b);
        gc.mark_value(&_c);
        gc.finish();
        assert!(!heap.wants_collect());
    }
}
