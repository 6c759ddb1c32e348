//! Runtime values.
//!
//! Lists are immutable cons chains; a tail may be a strict cell, `Nil` or a
//! lazy [`Generator`]. Long spines are dropped, compared and printed with
//! loops rather than recursion so that a million-element list does not
//! exhaust the host stack.

use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ast::{NumberType, write_escaped};
use crate::environment::Environment;
use crate::generator::{Forced, Generator};
use crate::program::LambdaDef;
use crate::types::{Type, TypeBindings, TypeRegistry};

/// A strict list cell
pub struct Cons {
    pub head: Value,
    pub tail: Value,
    /// Join of the element types of the strict prefix, filled on first use
    elem_type: OnceCell<Type>,
}

/// A closure: one clause plus the environment it was created in
pub struct Lambda {
    pub def: Rc<LambdaDef>,
    pub env: Environment,
    /// Unique for the life of the process, unlike the allocation address
    pub id: u64,
}

static NEXT_LAMBDA_ID: AtomicU64 = AtomicU64::new(0);

impl Lambda {
    pub fn new(def: Rc<LambdaDef>, env: Environment) -> Self {
        Lambda {
            def,
            env,
            id: NEXT_LAMBDA_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// A value branded with a user type by calling a `deftype` constructor
#[derive(Debug)]
pub struct Tagged {
    pub type_name: String,
    pub value: Value,
}

#[derive(Clone)]
pub enum Value {
    Int(NumberType),
    Bool(bool),
    Str(String),
    /// The empty list `'()`
    Nil,
    Cons(Rc<Cons>),
    Generator(Rc<Generator>),
    /// Named function, builtin or type constructor, resolved at call time
    FuncRef(String),
    Lambda(Rc<Lambda>),
    Tagged(Rc<Tagged>),
}

impl Value {
    pub fn cons(head: Value, tail: Value) -> Value {
        Value::Cons(Rc::new(Cons {
            head,
            tail,
            elem_type: OnceCell::new(),
        }))
    }

    /// Build a strict list from its elements
    pub fn list(items: impl IntoIterator<Item = Value, IntoIter: DoubleEndedIterator>) -> Value {
        items
            .into_iter()
            .rev()
            .fold(Value::Nil, |tail, head| Value::cons(head, tail))
    }

    pub fn tagged(type_name: impl Into<String>, value: Value) -> Value {
        Value::Tagged(Rc::new(Tagged {
            type_name: type_name.into(),
            value: value.into_untagged(),
        }))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.untagged(), Value::Nil)
    }

    pub fn is_list(&self) -> bool {
        matches!(
            self.untagged(),
            Value::Nil | Value::Cons(_) | Value::Generator(_)
        )
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::FuncRef(_) | Value::Lambda(_))
    }

    /// The base value underneath any user-type brand
    pub fn untagged(&self) -> &Value {
        match self {
            Value::Tagged(tagged) => &tagged.value,
            other => other,
        }
    }

    pub fn into_untagged(self) -> Value {
        match self {
            Value::Tagged(tagged) => tagged.value.clone(),
            other => other,
        }
    }

    /// Strict elements, if this is a fully strict list
    pub fn strict_items(&self) -> Option<Vec<Value>> {
        let mut items = Vec::new();
        let mut current = self.untagged();
        loop {
            match current {
                Value::Nil => return Some(items),
                Value::Cons(cell) => {
                    items.push(cell.head.clone());
                    current = &cell.tail;
                }
                _ => return None,
            }
        }
    }

    /// Runtime type of this value
    pub fn type_of(&self, types: &TypeRegistry) -> Type {
        match self {
            Value::Int(_) => Type::int(),
            Value::Bool(_) => Type::bool(),
            Value::Str(_) => Type::str(),
            Value::Nil | Value::Generator(_) => Type::list_any(),
            Value::Cons(cell) => Type::list(cell.element_type(types)),
            Value::FuncRef(_) | Value::Lambda(_) => Type::func(),
            Value::Tagged(tagged) => Type::named(tagged.type_name.clone()),
        }
    }

    /// Does this value satisfy a declared (possibly generic) type?
    ///
    /// The empty list and generators satisfy every `list[T]`; generator
    /// elements are not inspected since that would force them.
    pub fn conforms_to(
        &self,
        declared: &Type,
        types: &TypeRegistry,
        bindings: &mut TypeBindings,
    ) -> bool {
        match (self, declared) {
            (Value::Nil | Value::Generator(_), Type::List(_)) => true,
            (Value::Cons(cell), Type::List(elem)) => {
                types.unify(elem, &cell.element_type(types), bindings)
            }
            _ => types.unify(declared, &self.type_of(types), bindings),
        }
    }

    /// Printable form with strings quoted, as used inside lists and diagnostics
    pub fn repr(&self) -> Repr<'_> {
        Repr(self)
    }

    fn write_repr(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write_escaped(f, s),
            Value::Nil | Value::Cons(_) | Value::Generator(_) => write_list(self, f),
            Value::FuncRef(name) => write!(f, "#<function {name}>"),
            Value::Lambda(_) => write!(f, "#<lambda>"),
            Value::Tagged(tagged) => tagged.value.write_repr(f),
        }
    }
}

/// Lists print their strict cells and the already-forced part of any
/// generator; an unforced remainder prints as `...`.
fn write_list(value: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "(")?;
    let mut first = true;
    let mut current = value.clone();
    loop {
        let next = match &current {
            Value::Cons(cell) => {
                if !first {
                    write!(f, " ")?;
                }
                cell.head.write_repr(f)?;
                cell.tail.clone()
            }
            Value::Generator(generator) => match generator.forced() {
                Some(Forced::Item { head, next }) => {
                    if !first {
                        write!(f, " ")?;
                    }
                    head.write_repr(f)?;
                    next.clone()
                }
                Some(Forced::Exhausted) => break,
                None => {
                    if !first {
                        write!(f, " ")?;
                    }
                    write!(f, "...")?;
                    break;
                }
            },
            _ => break,
        };
        first = false;
        current = next;
    }
    write!(f, ")")
}

/// Display adapter returned by [`Value::repr`]
pub struct Repr<'a>(&'a Value);

impl fmt::Display for Repr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.write_repr(f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.untagged() {
            Value::Str(s) => write!(f, "{s}"),
            other => other.write_repr(f),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tagged(tagged) => write!(f, "{}({})", tagged.type_name, tagged.value.repr()),
            other => write!(f, "{}", other.repr()),
        }
    }
}

impl PartialEq for Value {
    /// Structural equality over strict data; tags are looked through,
    /// generators and lambdas compare by identity.
    fn eq(&self, other: &Self) -> bool {
        let mut left = self.untagged().clone();
        let mut right = other.untagged().clone();
        loop {
            let (next_left, next_right) = match (&left, &right) {
                (Value::Cons(a), Value::Cons(b)) => {
                    if Rc::ptr_eq(a, b) {
                        return true;
                    }
                    if a.head != b.head {
                        return false;
                    }
                    (a.tail.untagged().clone(), b.tail.untagged().clone())
                }
                (Value::Int(a), Value::Int(b)) => return a == b,
                (Value::Bool(a), Value::Bool(b)) => return a == b,
                (Value::Str(a), Value::Str(b)) => return a == b,
                (Value::Nil, Value::Nil) => return true,
                (Value::FuncRef(a), Value::FuncRef(b)) => return a == b,
                (Value::Generator(a), Value::Generator(b)) => return Rc::ptr_eq(a, b),
                (Value::Lambda(a), Value::Lambda(b)) => return Rc::ptr_eq(a, b),
                _ => return false,
            };
            left = next_left;
            right = next_right;
        }
    }
}

impl Cons {
    /// Element type of the strict prefix of this list.
    ///
    /// Computed back to front over the uncached part of the spine, so each
    /// cell is visited once over the lifetime of the list.
    pub fn element_type(&self, types: &TypeRegistry) -> Type {
        if let Some(ty) = self.elem_type.get() {
            return ty.clone();
        }
        let mut spine: Vec<&Cons> = vec![self];
        let mut tail_type: Option<Type> = None;
        let mut current = &self.tail;
        while let Value::Cons(cell) = current {
            if let Some(ty) = cell.elem_type.get() {
                tail_type = Some(ty.clone());
                break;
            }
            spine.push(cell);
            current = &cell.tail;
        }
        for cell in spine.iter().rev() {
            let head_type = cell.head.type_of(types);
            let joined = match &tail_type {
                Some(ty) => types.join(&head_type, ty),
                None => head_type,
            };
            let _ = cell.elem_type.set(joined.clone());
            tail_type = Some(joined);
        }
        tail_type.unwrap_or_else(Type::any)
    }
}

/// Release a list spine iteratively instead of through nested drops
pub(crate) fn drop_spine(mut next: Value) {
    loop {
        next = match next {
            Value::Cons(rc) => match Rc::try_unwrap(rc) {
                Ok(mut cell) => std::mem::replace(&mut cell.tail, Value::Nil),
                Err(_) => return,
            },
            Value::Generator(rc) => match Rc::try_unwrap(rc) {
                Ok(mut generator) => generator.take_next(),
                Err(_) => return,
            },
            _ => return,
        };
    }
}

impl Drop for Cons {
    fn drop(&mut self) {
        drop_spine(std::mem::replace(&mut self.tail, Value::Nil));
    }
}

impl From<NumberType> for Value {
    fn from(n: NumberType) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(NumberType::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::list(v.into_iter().map(Into::into).collect::<Vec<_>>())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::list(arr.into_iter().map(Into::into).collect::<Vec<_>>())
    }
}

/// Helper for building expected values in tests
#[cfg(test)]
pub(crate) fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        types.declare_type("mytype", &Type::int()).unwrap();
        types.declare_type("sibling", &Type::int()).unwrap();
        types
    }

    #[test]
    fn test_display_forms() {
        let cases = vec![
            (val(42), "42", "42"),
            (val(true), "true", "true"),
            (val("hi"), "hi", "\"hi\""),
            (Value::Nil, "()", "()"),
            (val(vec![val(1), val("a"), val(vec![2])]), "(1 \"a\" (2))", "(1 \"a\" (2))"),
            (Value::FuncRef("f".into()), "#<function f>", "#<function f>"),
            (Value::tagged("mytype", val(5)), "5", "5"),
        ];
        for (value, display, repr) in cases {
            assert_eq!(value.to_string(), display);
            assert_eq!(value.repr().to_string(), repr);
        }
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(val([1, 2, 3]), Value::list(vec![val(1), val(2), val(3)]));
        assert_ne!(val([1, 2, 3]), val([1, 2]));
        assert_ne!(val([1, 2]), val([1, 3]));
        assert_ne!(val(1), val("1"));
        assert_eq!(Value::tagged("mytype", val(5)), val(5));
        // Re-tagging keeps a single layer
        let twice = Value::tagged("sibling", Value::tagged("mytype", val(5)));
        assert!(matches!(twice.untagged(), Value::Int(5)));
    }

    #[test]
    fn test_runtime_types() {
        let types = registry();
        let cases = vec![
            (val(1), "int"),
            (val("x"), "str"),
            (Value::Nil, "list"),
            (val([1, 2]), "list[int]"),
            (val(vec![val(1), val("x")]), "list"),
            (
                val(vec![Value::tagged("mytype", val(1)), Value::tagged("sibling", val(2))]),
                "list[int]",
            ),
            (Value::tagged("mytype", val(1)), "mytype"),
            (Value::FuncRef("f".into()), "func"),
        ];
        for (value, expected) in cases {
            assert_eq!(value.type_of(&types).to_string(), expected, "type of {value:?}");
        }
    }

    #[test]
    fn test_conformance() {
        let types = registry();
        let list_int = Type::list(Type::int());
        let mut bindings = TypeBindings::default();
        assert!(Value::Nil.conforms_to(&list_int, &types, &mut bindings));
        assert!(val([1, 2]).conforms_to(&list_int, &types, &mut bindings));
        assert!(!val(["a"]).conforms_to(&list_int, &types, &mut bindings));
        assert!(Value::tagged("mytype", val(1)).conforms_to(&Type::int(), &types, &mut bindings));
        assert!(!val(1).conforms_to(&Type::named("mytype"), &types, &mut bindings));

        let mut bindings = TypeBindings::default();
        assert!(val([1]).conforms_to(&Type::list(Type::var("a")), &types, &mut bindings));
        assert_eq!(bindings.apply(&Type::var("a")), Type::int());
    }

    #[test]
    fn test_long_lists_do_not_recurse() {
        let long = Value::list((0..1_000_000).map(Value::Int).collect::<Vec<_>>());
        let other = Value::list((0..1_000_000).map(Value::Int).collect::<Vec<_>>());
        assert_eq!(long, other);
        let types = TypeRegistry::new();
        assert_eq!(long.type_of(&types), Type::list(Type::int()));
        drop(long);
        drop(other);
    }
}
