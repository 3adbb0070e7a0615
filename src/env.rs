//! Chained binding frames.
//!
//! An environment maps symbols to value cells and optionally points at a
//! parent frame; lookup walks the chain to the first match. Frames are heap
//! nodes, so closures capturing a frame share its cells and observe every
//! later mutation.

use crate::heap::{EnvBody, Heap, NodeBody, NodeRef};
use crate::value::Value;
use std::collections::HashMap;

/// A handle to an environment frame in the heap.
#[derive(Clone)]
pub struct EnvRef(NodeRef);

impl EnvRef {
    pub fn new(heap: &mut Heap, parent: Option<&EnvRef>) -> EnvRef {
        EnvRef(heap.allocate(NodeBody::Env(EnvBody {
            bindings: HashMap::new(),
            parent: parent.map(|p| p.0.clone()),
        })))
    }

    /// A fresh frame whose parent is this one.
    pub fn new_child(&self, heap: &mut Heap) -> EnvRef {
        EnvRef::new(heap, Some(self))
    }

    pub fn from_node(node: NodeRef) -> EnvRef {
        EnvRef(node)
    }

    pub fn node(&self) -> &NodeRef {
        &self.0
    }

    /// Bind `name` in *this* frame, shadowing any binding in a parent.
    pub fn define(&self, name: &str, value: Value) {
        if let NodeBody::Env(env) = &mut *self.0.body.borrow_mut() {
            env.bindings.insert(name.to_owned(), value);
        }
    }

    /// The nearest enclosing binding of `name`.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut cursor = self.0.clone();
        loop {
            let parent = {
                let body = cursor.body.borrow();
                match &*body {
                    NodeBody::Env(env) => {
                        if let Some(value) = env.bindings.get(name) {
                            return Some(value.clone());
                        }
                        env.parent.clone()
                    }
                    _ => None,
                }
            };
            match parent {
                Some(next) => cursor = next,
                None => return None,
            }
        }
    }

    /// Mutate the nearest enclosing binding of `name` in place. Returns
    /// false when no binding exists anywhere on the chain.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        let mut cursor = self.0.clone();
        loop {
            let parent = {
                let mut body = cursor.body.borrow_mut();
                match &mut *body {
                    NodeBody::Env(env) => {
                        if let Some(cell) = env.bindings.get_mut(name) {
                            *cell = value;
                            return true;
                        }
                        env.parent.clone()
                    }
                    _ => None,
                }
            };
            match parent {
                Some(next) => cursor = next,
                None => return false,
            }
        }
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Whether `name` is bound in this frame itself, ignoring parents.
    pub fn has_local(&self, name: &str) -> bool {
        match &*self.0.body.borrow() {
            NodeBody::Env(env) => env.bindings.contains_key(name),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number::Number;
    use crate::value::eqv;

    fn int(i: i64) -> Value {
        Value::Number(Number::Integer(i))
    }

    #[test]
    fn test_define_then_lookup() {
        let mut heap = Heap::new();
        let env = EnvRef::new(&mut heap, None);
        assert!(env.lookup("x").is_none());
        env.define("x", int(42));
        assert!(eqv(&env.lookup("x").unwrap_or(Value::Null), &int(42)));
        assert!(env.is_defined("x"));
        assert!(!env.is_defined("y"));
    }

    #[test]
    fn test_lookup_walks_the_parent_chain() {
        let mut heap = Heap::new();
        let outer = EnvRef::new(&mut heap, None);
        outer.define("x", int(1));
        outer.define("y", int(2));

        let inner = outer.new_child(&mut heap);
        inner.define("x", int(10));

        // Nearest binding wins; unshadowed names come from the parent.
        assert!(eqv(&inner.lookup("x").unwrap_or(Value::Null), &int(10)));
        assert!(eqv(&inner.lookup("y").unwrap_or(Value::Null), &int(2)));
        // The parent is unaffected by the shadowing define.
        assert!(eqv(&outer.lookup("x").unwrap_or(Value::Null), &int(1)));
    }

    #[test]
    fn test_assign_mutates_nearest_binding() {
        let mut heap = Heap::new();
        let outer = EnvRef::new(&mut heap, None);
        outer.define("x", int(1));
        let inner = outer.new_child(&mut heap);

        assert!(inner.assign("x", int(5)));
        assert!(eqv(&outer.lookup("x").unwrap_or(Value::Null), &int(5)));

        // Assignment never creates a binding.
        assert!(!inner.assign("missing", int(0)));
        assert!(!inner.is_defined("missing"));
    }

    #[test]
    fn test_bindings_are_shared_cells() {
        let mut heap = Heap::new();
        let env = EnvRef::new(&mut heap, None);
        env.define("counter", int(0));

        // Two handles to the same frame observe each other's mutations,
        // the way two closures capturing one environment must.
        let alias = env.clone();
        alias.assign("counter", int(7));
        assert!(eqv(&env.lookup("counter").unwrap_or(Value::Null), &int(7)));
    }
}
