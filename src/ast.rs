//! Reader-level syntax tree.
//!
//! The reader produces [`Node`] trees: atoms (integers, booleans, strings and
//! identifiers), ordered child lists, quoted forms and standalone `:Type`
//! annotations. Type annotations written as identifier suffixes (`n:int`) are
//! attached to the identifier node. Helper functions such as [`sym`],
//! [`typed`], [`val`] and [`nil`] keep test tables short.

use std::fmt;

use crate::types::Type;

/// Type alias for integer literals
pub(crate) type NumberType = i64;

/// Allowed non-alphanumeric characters in identifiers.
/// Mostly mathematical symbols or predicates ("?"); `'` marks memoized or
/// scoped variants such as `def'` and `set'` and may not lead.
pub(crate) const SYMBOL_SPECIAL_CHARS: &str = "+-*/%<>=!?_$'";

/// Check if a string is a valid identifier
/// Valid: non-empty, no leading digit or quote, no "-digit" prefix,
/// alphanumeric + SYMBOL_SPECIAL_CHARS
/// Note: This function is tested as part of the parser tests in parser.rs
pub(crate) fn is_valid_symbol(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        None => false, // name is empty
        Some(first_char) => {
            if first_char.is_ascii_digit() || first_char == '\'' {
                return false;
            }

            if first_char == '-'
                && let Some(second_char) = chars.next()
                && second_char.is_ascii_digit()
            {
                return false;
            }

            name.chars()
                .all(|c| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c))
        }
    }
}

/// A node of the reader's output
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Int(NumberType),
    Bool(bool),
    Str(String),
    /// Identifier with an optional `:Type` suffix
    Symbol { name: String, ty: Option<Type> },
    /// Standalone `:Type`, used for return types and `do` casts
    Annotation(Type),
    List(Vec<Node>),
    /// `'x` or `(quote x)`
    Quote(Box<Node>),
}

impl Node {
    /// Identifier name, ignoring any type suffix
    pub fn symbol_name(&self) -> Option<&str> {
        match self {
            Node::Symbol { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Identifier name, only if it has no type suffix
    pub fn plain_symbol(&self) -> Option<&str> {
        match self {
            Node::Symbol { name, ty: None } => Some(name),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Node::List(items) if items.is_empty())
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::Str(s.to_owned())
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Node::Str(s)
    }
}

impl From<bool> for Node {
    fn from(b: bool) -> Self {
        Node::Bool(b)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Node {
            fn from(n: $int_type) -> Self {
                Node::Int(n as NumberType)
            }
        }
    };
}

impl_from_integer!(i32);
impl_from_integer!(NumberType); // Special case - no casting
impl_from_integer!(u8);
impl_from_integer!(u32);

impl<T: Into<Node>> From<Vec<T>> for Node {
    fn from(v: Vec<T>) -> Self {
        Node::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Node>, const N: usize> From<[T; N]> for Node {
    fn from(arr: [T; N]) -> Self {
        Node::List(arr.into_iter().map(Into::into).collect())
    }
}

/// Helper for identifier nodes without a type suffix
#[cfg_attr(not(test), expect(dead_code))]
pub(crate) fn sym<S: AsRef<str>>(name: S) -> Node {
    Node::Symbol {
        name: name.as_ref().to_owned(),
        ty: None,
    }
}

/// Helper for identifier nodes with a type suffix
#[cfg_attr(not(test), expect(dead_code))]
pub(crate) fn typed<S: AsRef<str>>(name: S, ty: Type) -> Node {
    Node::Symbol {
        name: name.as_ref().to_owned(),
        ty: Some(ty),
    }
}

/// Helper for literal nodes and mixed lists
#[cfg_attr(not(test), expect(dead_code))]
pub(crate) fn val<T: Into<Node>>(value: T) -> Node {
    value.into()
}

/// Helper for the empty list `()`
#[cfg_attr(not(test), expect(dead_code))]
pub(crate) fn nil() -> Node {
    Node::List(vec![])
}

/// Write a string literal with escapes, as the reader accepts it
pub(crate) fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "\"")?;
    for ch in s.chars() {
        match ch {
            '"' => write!(f, "\\\"")?,
            '\\' => write!(f, "\\\\")?,
            '\n' => write!(f, "\\n")?,
            '\t' => write!(f, "\\t")?,
            '\r' => write!(f, "\\r")?,
            c => write!(f, "{c}")?,
        }
    }
    write!(f, "\"")
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Int(n) => write!(f, "{n}"),
            Node::Bool(b) => write!(f, "{b}"),
            Node::Str(s) => write_escaped(f, s),
            Node::Symbol { name, ty: None } => write!(f, "{name}"),
            Node::Symbol { name, ty: Some(ty) } => write!(f, "{name}:{ty}"),
            Node::Annotation(ty) => write!(f, ":{ty}"),
            Node::List(elements) => {
                write!(f, "(")?;
                for (i, elem) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, ")")
            }
            Node::Quote(inner) => write!(f, "'{inner}"),
        }
    }
}
