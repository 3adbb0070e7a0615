//! The universal datum.
//!
//! [`Value`] is the one representation threaded through the whole pipeline:
//! the parser produces it, the compiler emits instruction lists made of it,
//! and the virtual machine consumes it. Atoms are stored inline and are
//! cheap to copy; every structured payload lives behind a heap node
//! reference, so cloning a `Value` is a refcount bump.

use crate::builtins::NativeOp;
use crate::heap::{NodeBody, NodeRef};
use crate::number::Number;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// The ordered sequence of evaluated arguments awaiting `apply`.
pub type Rib = SmallVec<[Value; 8]>;

/// The special forms the compiler recognizes. These are bound as ordinary
/// values in the initial top-level environment, so shadowing one (say,
/// `(define if 3)`) degrades gracefully to ordinary lookup instead of
/// breaking the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveForm {
    Quote,
    Define,
    Lambda,
    If,
    Set,
    Begin,
    CallCc,
}

impl PrimitiveForm {
    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveForm::Quote => "quote",
            PrimitiveForm::Define => "define",
            PrimitiveForm::Lambda => "lambda",
            PrimitiveForm::If => "if",
            PrimitiveForm::Set => "set!",
            PrimitiveForm::Begin => "begin",
            PrimitiveForm::CallCc => "call/cc",
        }
    }
}

/// A Scheme value.
///
/// The `Pair` variant is the only structural constructor: lists, trees and
/// the compiler's instruction stream are all built from it.
#[derive(Clone)]
pub enum Value {
    /// The empty list `()`.
    Null,
    Boolean(bool),
    Character(char),
    Number(Number),
    /// Symbols compare by name; no intern table is required.
    Symbol(String),
    PrimitiveForm(PrimitiveForm),
    /// A host-provided procedure from the native registry.
    Native(&'static NativeOp),
    Pair(NodeRef),
    Vector(NodeRef),
    Bytevector(NodeRef),
    String(NodeRef),
    Closure(NodeRef),
    /// A reified call frame, embedded in `nuate` instructions.
    Frame(NodeRef),
    /// The result of expressions with no useful value, such as `set!`.
    Unspecified,
}

/// Formal parameters of a closure: fixed arity, or fixed parameters plus a
/// rest parameter that collects the remaining arguments into a list.
#[derive(Debug, Clone, PartialEq)]
pub enum Formals {
    Fixed(Vec<String>),
    Rest(Vec<String>, String),
}

impl Formals {
    /// Parse a formals datum: a symbol (`(lambda args ...)`), a proper list
    /// of symbols, or a dotted list of symbols. `None` for anything else.
    pub fn from_datum(datum: &Value) -> Option<Formals> {
        match datum {
            Value::Symbol(rest) => Some(Formals::Rest(Vec::new(), rest.clone())),
            Value::Null => Some(Formals::Fixed(Vec::new())),
            Value::Pair(_) => {
                let mut fixed = Vec::new();
                let mut cursor = datum.clone();
                loop {
                    match cursor {
                        Value::Pair(node) => {
                            let (car, cdr) = pair_parts(&node)?;
                            match car {
                                Value::Symbol(name) => fixed.push(name),
                                _ => return None,
                            }
                            cursor = cdr;
                        }
                        Value::Null => return Some(Formals::Fixed(fixed)),
                        Value::Symbol(rest) => return Some(Formals::Rest(fixed, rest)),
                        _ => return None,
                    }
                }
            }
            _ => None,
        }
    }

    /// All parameter names, rest parameter included.
    pub fn names(&self) -> Vec<&str> {
        match self {
            Formals::Fixed(fixed) => fixed.iter().map(String::as_str).collect(),
            Formals::Rest(fixed, rest) => {
                let mut names: Vec<&str> = fixed.iter().map(String::as_str).collect();
                names.push(rest.as_str());
                names
            }
        }
    }
}

impl Value {
    pub fn symbol(name: impl AsRef<str>) -> Value {
        Value::Symbol(name.as_ref().to_owned())
    }

    /// The heap node behind a compound value, if any.
    pub fn node(&self) -> Option<&NodeRef> {
        match self {
            Value::Pair(n)
            | Value::Vector(n)
            | Value::Bytevector(n)
            | Value::String(n)
            | Value::Closure(n)
            | Value::Frame(n) => Some(n),
            _ => None,
        }
    }

    /// Scheme truth: everything except `#f` is true.
    pub fn is_false(&self) -> bool {
        matches!(self, Value::Boolean(false))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn car(&self) -> Option<Value> {
        match self {
            Value::Pair(node) => pair_parts(node).map(|(car, _)| car),
            _ => None,
        }
    }

    pub fn cdr(&self) -> Option<Value> {
        match self {
            Value::Pair(node) => pair_parts(node).map(|(_, cdr)| cdr),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Character(_) => "character",
            Value::Number(_) => "number",
            Value::Symbol(_) => "symbol",
            Value::PrimitiveForm(_) => "syntax",
            Value::Native(_) => "procedure",
            Value::Pair(_) => "pair",
            Value::Vector(_) => "vector",
            Value::Bytevector(_) => "bytevector",
            Value::String(_) => "string",
            Value::Closure(_) => "procedure",
            Value::Frame(_) => "frame",
            Value::Unspecified => "unspecified",
        }
    }

    /// `display` representation: strings and characters print raw, all
    /// other values print as [`fmt::Display`] (the `write` representation).
    pub fn to_display_string(&self) -> String {
        let mut out = String::new();
        let _ = write_value(&mut out, self, false);
        out
    }
}

/// Both fields of a pair node, or `None` if the node has been severed.
pub fn pair_parts(node: &NodeRef) -> Option<(Value, Value)> {
    match &*node.body.borrow() {
        NodeBody::Pair(car, cdr) => Some((car.clone(), cdr.clone())),
        _ => None,
    }
}

/// The elements of a proper list, or `None` for improper lists and
/// non-lists.
pub fn list_elements(value: &Value) -> Option<Vec<Value>> {
    let mut elements = Vec::new();
    let mut cursor = value.clone();
    loop {
        match cursor {
            Value::Null => return Some(elements),
            Value::Pair(node) => {
                let (car, cdr) = pair_parts(&node)?;
                elements.push(car);
                cursor = cdr;
            }
            _ => return None,
        }
    }
}

/// Element `index` of a list, counting the head as zero.
pub fn list_ref(value: &Value, index: usize) -> Option<Value> {
    let mut cursor = value.clone();
    for _ in 0..index {
        cursor = cursor.cdr()?;
    }
    cursor.car()
}

/// Identity equivalence: atoms compare by value (numbers additionally by
/// exactness), compound values by node identity.
pub fn eqv(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) | (Value::Unspecified, Value::Unspecified) => true,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Character(x), Value::Character(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x.eqv(y),
        (Value::Symbol(x), Value::Symbol(y)) => x == y,
        (Value::PrimitiveForm(x), Value::PrimitiveForm(y)) => x == y,
        (Value::Native(x), Value::Native(y)) => std::ptr::eq(*x, *y),
        (Value::Pair(x), Value::Pair(y))
        | (Value::Vector(x), Value::Vector(y))
        | (Value::Bytevector(x), Value::Bytevector(y))
        | (Value::String(x), Value::String(y))
        | (Value::Closure(x), Value::Closure(y))
        | (Value::Frame(x), Value::Frame(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Structural equivalence by recursive descent. Terminates on cyclic data:
/// once a pair of nodes has been visited the comparison assumes equality
/// for that pair, which is sound because any difference will be found on
/// another path.
pub fn equal(a: &Value, b: &Value) -> bool {
    equal_rec(a, b, &mut HashSet::new())
}

fn equal_rec(a: &Value, b: &Value, seen: &mut HashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Pair(x), Value::Pair(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            if !seen.insert((Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize)) {
                return true;
            }
            match (pair_parts(x), pair_parts(y)) {
                (Some((xa, xd)), Some((ya, yd))) => {
                    equal_rec(&xa, &ya, seen) && equal_rec(&xd, &yd, seen)
                }
                _ => false,
            }
        }
        (Value::Vector(x), Value::Vector(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            if !seen.insert((Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize)) {
                return true;
            }
            let xs = match &*x.body.borrow() {
                NodeBody::Vector(items) => items.clone(),
                _ => return false,
            };
            let ys = match &*y.body.borrow() {
                NodeBody::Vector(items) => items.clone(),
                _ => return false,
            };
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys.iter())
                    .all(|(xe, ye)| equal_rec(xe, ye, seen))
        }
        (Value::String(x), Value::String(y)) => {
            let xs = x.body.borrow();
            let ys = y.body.borrow();
            match (&*xs, &*ys) {
                (NodeBody::Text(xt), NodeBody::Text(yt)) => xt == yt,
                _ => false,
            }
        }
        (Value::Bytevector(x), Value::Bytevector(y)) => {
            let xs = x.body.borrow();
            let ys = y.body.borrow();
            match (&*xs, &*ys) {
                (NodeBody::Bytevector(xb), NodeBody::Bytevector(yb)) => xb == yb,
                _ => false,
            }
        }
        _ => eqv(a, b),
    }
}

fn write_char(out: &mut impl fmt::Write, c: char) -> fmt::Result {
    match c {
        ' ' => write!(out, "#\\space"),
        '\n' => write!(out, "#\\newline"),
        '\t' => write!(out, "#\\tab"),
        '\r' => write!(out, "#\\return"),
        '\x07' => write!(out, "#\\alarm"),
        '\x08' => write!(out, "#\\backspace"),
        '\x7f' => write!(out, "#\\delete"),
        '\x1b' => write!(out, "#\\escape"),
        '\0' => write!(out, "#\\null"),
        c if c.is_control() => write!(out, "#\\x{:x}", c as u32),
        c => write!(out, "#\\{c}"),
    }
}

fn write_string_escaped(out: &mut impl fmt::Write, text: &str) -> fmt::Result {
    write!(out, "\"")?;
    for c in text.chars() {
        match c {
            '"' => write!(out, "\\\"")?,
            '\\' => write!(out, "\\\\")?,
            '\n' => write!(out, "\\n")?,
            '\t' => write!(out, "\\t")?,
            '\r' => write!(out, "\\r")?,
            c => write!(out, "{c}")?,
        }
    }
    write!(out, "\"")
}

fn write_value(out: &mut impl fmt::Write, value: &Value, write_mode: bool) -> fmt::Result {
    match value {
        Value::Null => write!(out, "()"),
        Value::Boolean(true) => write!(out, "#t"),
        Value::Boolean(false) => write!(out, "#f"),
        Value::Character(c) => {
            if write_mode {
                write_char(out, *c)
            } else {
                write!(out, "{c}")
            }
        }
        Value::Number(n) => write!(out, "{n}"),
        Value::Symbol(s) => write!(out, "{s}"),
        Value::PrimitiveForm(form) => write!(out, "#<syntax {}>", form.name()),
        Value::Native(op) => write!(out, "#<native:{}>", op.name),
        Value::String(node) => match &*node.body.borrow() {
            NodeBody::Text(text) => {
                if write_mode {
                    write_string_escaped(out, text)
                } else {
                    write!(out, "{text}")
                }
            }
            _ => write!(out, "#<reclaimed>"),
        },
        Value::Pair(_) => {
            write!(out, "(")?;
            let mut cursor = value.clone();
            let mut first = true;
            loop {
                match cursor {
                    Value::Pair(node) => match pair_parts(&node) {
                        Some((car, cdr)) => {
                            if !first {
                                write!(out, " ")?;
                            }
                            first = false;
                            write_value(out, &car, write_mode)?;
                            cursor = cdr;
                        }
                        None => {
                            write!(out, "#<reclaimed>")?;
                            break;
                        }
                    },
                    Value::Null => break,
                    tail => {
                        write!(out, " . ")?;
                        write_value(out, &tail, write_mode)?;
                        break;
                    }
                }
            }
            write!(out, ")")
        }
        Value::Vector(node) => match &*node.body.borrow() {
            NodeBody::Vector(items) => {
                write!(out, "#(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(out, " ")?;
                    }
                    write_value(out, item, write_mode)?;
                }
                write!(out, ")")
            }
            _ => write!(out, "#<reclaimed>"),
        },
        Value::Bytevector(node) => match &*node.body.borrow() {
            NodeBody::Bytevector(bytes) => {
                write!(out, "#u8(")?;
                for (i, byte) in bytes.iter().enumerate() {
                    if i > 0 {
                        write!(out, " ")?;
                    }
                    write!(out, "{byte}")?;
                }
                write!(out, ")")
            }
            _ => write!(out, "#<reclaimed>"),
        },
        Value::Closure(node) => match &*node.body.borrow() {
            NodeBody::Closure(closure) if closure.frame.is_some() => {
                write!(out, "#<continuation>")
            }
            _ => write!(out, "#<procedure>"),
        },
        Value::Frame(_) => write!(out, "#<frame>"),
        Value::Unspecified => write!(out, "#<unspecified>"),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_value(f, self, true)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_value(f, self, true)
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn test_eqv_atoms() {
        let cases = vec![
            (Value::Null, Value::Null, true),
            (Value::Boolean(true), Value::Boolean(true), true),
            (Value::Boolean(true), Value::Boolean(false), false),
            (Value::symbol("abc"), Value::symbol("abc"), true),
            (Value::symbol("abc"), Value::symbol("abd"), false),
            (Value::Character('x'), Value::Character('x'), true),
            (
                Value::Number(Number::Integer(1)),
                Value::Number(Number::Integer(1)),
                true,
            ),
            // Equal value but different exactness is not eqv?.
            (
                Value::Number(Number::Integer(1)),
                Value::Number(Number::Real(1.0)),
                false,
            ),
            (Value::Null, Value::Boolean(false), false),
        ];
        for (i, (a, b, expected)) in cases.iter().enumerate() {
            assert_eq!(eqv(a, b), *expected, "eqv case {}", i + 1);
        }
    }

    #[test]
    fn test_eqv_is_identity_for_pairs() {
        let mut heap = Heap::new();
        let a = heap.cons(Value::Number(Number::Integer(1)), Value::Null);
        let b = heap.cons(Value::Number(Number::Integer(1)), Value::Null);
        assert!(eqv(&a, &a.clone()));
        assert!(!eqv(&a, &b));
        // But they are structurally equal.
        assert!(equal(&a, &b));
    }

    #[test]
    fn test_equal_on_nested_structure() {
        let mut heap = Heap::new();
        let inner_a = heap.list_from(vec![Value::symbol("x"), Value::Boolean(true)]);
        let inner_b = heap.list_from(vec![Value::symbol("x"), Value::Boolean(true)]);
        let a = heap.list_from(vec![inner_a, Value::Number(Number::Integer(3))]);
        let b = heap.list_from(vec![inner_b, Value::Number(Number::Integer(3))]);
        assert!(equal(&a, &b));

        let c = heap.list_from(vec![Value::symbol("y")]);
        assert!(!equal(&a, &c));
    }

    #[test]
    fn test_equal_terminates_on_cycles() {
        let mut heap = Heap::new();
        let a = heap.cons(Value::Null, Value::Null);
        if let Value::Pair(node) = &a {
            *node.body.borrow_mut() = NodeBody::Pair(a.clone(), a.clone());
        }
        // equal?(V, V) holds even for cyclic V.
        assert!(equal(&a, &a.clone()));

        // Two distinct self-loops are also equal: every path through them
        // is indistinguishable.
        let b = heap.cons(Value::Null, Value::Null);
        if let Value::Pair(node) = &b {
            *node.body.borrow_mut() = NodeBody::Pair(b.clone(), b.clone());
        }
        assert!(equal(&a, &b));
    }

    #[test]
    fn test_formals_from_datum() {
        let mut heap = Heap::new();
        let fixed = heap.list_from(vec![Value::symbol("a"), Value::symbol("b")]);
        assert_eq!(
            Formals::from_datum(&fixed),
            Some(Formals::Fixed(vec!["a".into(), "b".into()]))
        );

        let dotted = heap.improper_from(vec![Value::symbol("a")], Value::symbol("rest"));
        assert_eq!(
            Formals::from_datum(&dotted),
            Some(Formals::Rest(vec!["a".into()], "rest".into()))
        );

        assert_eq!(
            Formals::from_datum(&Value::symbol("args")),
            Some(Formals::Rest(Vec::new(), "args".into()))
        );
        assert_eq!(Formals::from_datum(&Value::Null), Some(Formals::Fixed(Vec::new())));

        let bad = heap.list_from(vec![Value::Number(Number::Integer(1))]);
        assert_eq!(Formals::from_datum(&bad), None);
    }

    #[test]
    fn test_write_representations() {
        let mut heap = Heap::new();
        let cases: Vec<(Value, &str)> = vec![
            (Value::Null, "()"),
            (Value::Boolean(true), "#t"),
            (Value::Character(' '), "#\\space"),
            (Value::Character('a'), "#\\a"),
            (Value::symbol("foo"), "foo"),
            (heap.string_value("a\"b".into()), "\"a\\\"b\""),
            (heap.bytevector_value(vec![1, 2, 255]), "#u8(1 2 255)"),
        ];
        for (value, expected) in cases {
            assert_eq!(format!("{value}"), expected);
        }

        let list = heap.list_from(vec![
            Value::symbol("a"),
            Value::Number(Number::Integer(2)),
        ]);
        assert_eq!(format!("{list}"), "(a 2)");

        let dotted = heap.improper_from(vec![Value::symbol("a")], Value::symbol("b"));
        assert_eq!(format!("{dotted}"), "(a . b)");

        let vector = heap.vector_value(vec![Value::Boolean(false), Value::Null]);
        assert_eq!(format!("{vector}"), "#(#f ())");
    }

    #[test]
    fn test_display_mode_prints_strings_raw() {
        let mut heap = Heap::new();
        let s = heap.string_value("hi there".into());
        assert_eq!(s.to_display_string(), "hi there");
        assert_eq!(format!("{s}"), "\"hi there\"");

        let list = heap.list_from(vec![s, Value::Character('x')]);
        assert_eq!(list.to_display_string(), "(hi there x)");
    }

    #[test]
    fn test_list_helpers() {
        let mut heap = Heap::new();
        let list = heap.list_from(vec![
            Value::symbol("a"),
            Value::symbol("b"),
            Value::symbol("c"),
        ]);
        let elements = list_elements(&list).unwrap();
        assert_eq!(elements.len(), 3);
        assert!(eqv(&list_ref(&list, 1).unwrap(), &Value::symbol("b")));

        let improper = heap.improper_from(vec![Value::symbol("a")], Value::symbol("b"));
        assert!(list_elements(&improper).is_none());
    }
}
