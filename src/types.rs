//! Static type model shared by the runtime dispatcher and the checker.
//!
//! Types form a tree rooted at `any`. The built-in roots are `int`, `str`,
//! `bool`, `list` and `func`; `deftype` adds user types below a previously
//! known parent. `list[T]` is covariant in `T`, and `list` is the same type as
//! `list[any]`. A parametrized `func[T1..Tn,R]` is interchangeable with the
//! bare `func` in both directions but otherwise only equal to itself.
//!
//! Generic variables (`a`..`e`, plus names declared with `contract`) are
//! resolved per dispatch attempt by [`TypeRegistry::unify`], which threads an
//! explicit [`TypeBindings`] map through one clause match.

use std::collections::HashMap;
use std::fmt;

use nom::{
    IResult, Parser,
    bytes::complete::take_while1,
    character::complete::{char, multispace0},
    combinator::opt,
    error::ErrorKind,
    multi::separated_list1,
    sequence::{delimited, preceded, terminated},
};

use crate::Error;
use crate::MAX_TYPE_DEPTH;

/// Single-letter generic variables that are always available
pub const GENERIC_VARIABLES: [&str; 5] = ["a", "b", "c", "d", "e"];

/// Names of the built-in root types
pub const BUILTIN_TYPES: [&str; 6] = ["int", "str", "bool", "list", "func", "any"];

/// A node in the type lattice
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// `int`, `str`, `bool`, `any` or a user type introduced by `deftype`
    Named(String),
    /// `list[T]`; the bare `list` is `list[any]`
    List(Box<Type>),
    /// `func` when `None`, otherwise `func[T1..Tn,R]`
    Func(Option<FuncSig>),
    /// A generic variable, resolved by unification
    Var(String),
}

/// Parameter and return types of a parametrized `func`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncSig {
    pub params: Vec<Type>,
    pub ret: Box<Type>,
}

impl Type {
    pub fn int() -> Type {
        Type::Named("int".to_owned())
    }

    pub fn str() -> Type {
        Type::Named("str".to_owned())
    }

    pub fn bool() -> Type {
        Type::Named("bool".to_owned())
    }

    pub fn any() -> Type {
        Type::Named("any".to_owned())
    }

    pub fn named(name: impl Into<String>) -> Type {
        Type::Named(name.into())
    }

    pub fn var(name: impl Into<String>) -> Type {
        Type::Var(name.into())
    }

    pub fn list(elem: Type) -> Type {
        Type::List(Box::new(elem))
    }

    /// The bare `list` type
    pub fn list_any() -> Type {
        Type::list(Type::any())
    }

    /// The bare `func` type
    pub fn func() -> Type {
        Type::Func(None)
    }

    pub fn func_of(params: Vec<Type>, ret: Type) -> Type {
        Type::Func(Some(FuncSig {
            params,
            ret: Box::new(ret),
        }))
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Type::Named(name) if name == "any")
    }

    /// True if any generic variable occurs inside this type
    pub fn has_vars(&self) -> bool {
        match self {
            Type::Var(_) => true,
            Type::Named(_) => false,
            Type::List(elem) => elem.has_vars(),
            Type::Func(None) => false,
            Type::Func(Some(sig)) => sig.params.iter().any(Type::has_vars) || sig.ret.has_vars(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Named(name) | Type::Var(name) => write!(f, "{name}"),
            Type::List(elem) if elem.is_any() => write!(f, "list"),
            Type::List(elem) => write!(f, "list[{elem}]"),
            Type::Func(None) => write!(f, "func"),
            Type::Func(Some(sig)) => {
                write!(f, "func[")?;
                for param in &sig.params {
                    write!(f, "{param},")?;
                }
                write!(f, "{}]", sig.ret)
            }
        }
    }
}

/// Generic variable bindings for one dispatch attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeBindings {
    bound: HashMap<String, Type>,
}

impl TypeBindings {
    pub fn get(&self, name: &str) -> Option<&Type> {
        self.bound.get(name)
    }

    fn bind(&mut self, name: &str, ty: Type) {
        self.bound.insert(name.to_owned(), ty);
    }

    /// Substitute bound variables; variables left unbound become `any`
    pub fn apply(&self, ty: &Type) -> Type {
        match ty {
            Type::Var(name) => self.bound.get(name).cloned().unwrap_or_else(Type::any),
            Type::Named(_) | Type::Func(None) => ty.clone(),
            Type::List(elem) => Type::list(self.apply(elem)),
            Type::Func(Some(sig)) => Type::func_of(
                sig.params.iter().map(|p| self.apply(p)).collect(),
                self.apply(&sig.ret),
            ),
        }
    }
}

/// The subtype tree plus declared generic contracts
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    /// User type name -> declared parent
    parents: HashMap<String, Type>,
    /// Contract name -> optional bound
    contracts: HashMap<String, Option<Type>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_taken(&self, name: &str) -> bool {
        BUILTIN_TYPES.contains(&name)
            || GENERIC_VARIABLES.contains(&name)
            || self.parents.contains_key(name)
            || self.contracts.contains_key(name)
    }

    /// Declare `name` as a user type below `parent`.
    ///
    /// The parent must already be known, which keeps the relation acyclic.
    pub fn declare_type(&mut self, name: &str, parent: &Type) -> Result<(), Error> {
        if self.is_taken(name) {
            return Err(Error::TypeError(format!("type {name} is already defined")));
        }
        let parent = self.resolve(parent)?;
        if parent.has_vars() {
            return Err(Error::TypeError(format!(
                "type {name} cannot have a generic parent {parent}"
            )));
        }
        self.parents.insert(name.to_owned(), parent);
        Ok(())
    }

    /// Declare a generic variable name, optionally bounded by a type
    pub fn declare_contract(&mut self, name: &str, bound: Option<&Type>) -> Result<(), Error> {
        if self.is_taken(name) {
            return Err(Error::TypeError(format!("type {name} is already defined")));
        }
        let bound = bound.map(|b| self.resolve(b)).transpose()?;
        self.contracts.insert(name.to_owned(), bound);
        Ok(())
    }

    pub fn is_user_type(&self, name: &str) -> bool {
        self.parents.contains_key(name)
    }

    pub fn parent_of(&self, name: &str) -> Option<&Type> {
        self.parents.get(name)
    }

    pub fn is_generic(&self, name: &str) -> bool {
        GENERIC_VARIABLES.contains(&name) || self.contracts.contains_key(name)
    }

    /// Turn generic names into variables and reject unknown type names
    pub fn resolve(&self, ty: &Type) -> Result<Type, Error> {
        match ty {
            Type::Named(name) if self.is_generic(name) => Ok(Type::Var(name.clone())),
            Type::Named(name) if BUILTIN_TYPES.contains(&name.as_str()) => Ok(ty.clone()),
            Type::Named(name) if self.parents.contains_key(name) => Ok(ty.clone()),
            Type::Named(name) => Err(Error::TypeError(format!("unknown type: {name}"))),
            Type::Var(_) | Type::Func(None) => Ok(ty.clone()),
            Type::List(elem) => Ok(Type::list(self.resolve(elem)?)),
            Type::Func(Some(sig)) => Ok(Type::func_of(
                sig.params
                    .iter()
                    .map(|p| self.resolve(p))
                    .collect::<Result<_, _>>()?,
                self.resolve(&sig.ret)?,
            )),
        }
    }

    /// Is a value of type `a` acceptable where `b` is required?
    pub fn is_subtype(&self, a: &Type, b: &Type) -> bool {
        self.subtype_at(a, b, 0)
    }

    fn subtype_at(&self, a: &Type, b: &Type, depth: usize) -> bool {
        if a == b || b.is_any() {
            return true;
        }
        if depth >= MAX_TYPE_DEPTH {
            return false;
        }
        match (a, b) {
            (Type::List(x), Type::List(y)) => self.subtype_at(x, y, depth + 1),
            (Type::Func(_), Type::Func(None)) | (Type::Func(None), Type::Func(_)) => true,
            (Type::Named(name), _) => match self.parents.get(name) {
                Some(parent) => self.subtype_at(parent, b, depth + 1),
                None => false,
            },
            _ => false,
        }
    }

    /// Least common ancestor of two types
    pub fn join(&self, a: &Type, b: &Type) -> Type {
        if self.is_subtype(a, b) {
            return b.clone();
        }
        if self.is_subtype(b, a) {
            return a.clone();
        }
        match (a, b) {
            (Type::List(x), Type::List(y)) => Type::list(self.join(x, y)),
            (Type::Func(_), Type::Func(_)) => Type::func(),
            (Type::Named(name), _) => match self.parents.get(name) {
                Some(parent) => self.join(parent, b),
                None => Type::any(),
            },
            _ => Type::any(),
        }
    }

    fn contract_bound(&self, name: &str) -> Option<&Type> {
        self.contracts.get(name).and_then(Option::as_ref)
    }

    /// Match an actual type against a declared (possibly generic) type.
    ///
    /// Variables bind on first occurrence; a later occurrence must be
    /// compatible with the earlier binding (one a subtype of the other), in
    /// which case the binding widens to the more general type.
    pub fn unify(&self, declared: &Type, actual: &Type, bindings: &mut TypeBindings) -> bool {
        self.unify_at(declared, actual, bindings, 0)
    }

    fn unify_at(
        &self,
        declared: &Type,
        actual: &Type,
        bindings: &mut TypeBindings,
        depth: usize,
    ) -> bool {
        if declared.is_any() {
            return true;
        }
        if depth >= MAX_TYPE_DEPTH {
            return false;
        }
        match (declared, actual) {
            (Type::Var(name), _) => self.bind_var(name, actual, bindings),
            (Type::List(elem), Type::List(actual_elem)) => {
                self.unify_at(elem, actual_elem, bindings, depth + 1)
            }
            (Type::Func(None), Type::Func(_)) | (Type::Func(Some(_)), Type::Func(None)) => true,
            (Type::Func(Some(expected)), Type::Func(Some(found))) => {
                expected.params.len() == found.params.len()
                    && expected
                        .params
                        .iter()
                        .zip(&found.params)
                        .all(|(e, f)| self.unify_exact(e, f, bindings, depth + 1))
                    && self.unify_exact(&expected.ret, &found.ret, bindings, depth + 1)
            }
            (Type::Named(_), _) if self.is_subtype(actual, declared) => true,
            // A user type is acceptable wherever one of its ancestors is
            (_, Type::Named(name)) => match self.parents.get(name) {
                Some(parent) => self.unify_at(declared, parent, bindings, depth + 1),
                None => false,
            },
            _ => false,
        }
    }

    /// Invariant matching used inside `func` signatures
    fn unify_exact(
        &self,
        declared: &Type,
        actual: &Type,
        bindings: &mut TypeBindings,
        depth: usize,
    ) -> bool {
        if depth >= MAX_TYPE_DEPTH {
            return false;
        }
        match (declared, actual) {
            (Type::Var(name), _) => self.bind_var(name, actual, bindings),
            (Type::List(e), Type::List(a)) => self.unify_exact(e, a, bindings, depth + 1),
            (Type::Func(Some(e)), Type::Func(Some(a))) => {
                e.params.len() == a.params.len()
                    && e
                        .params
                        .iter()
                        .zip(&a.params)
                        .all(|(x, y)| self.unify_exact(x, y, bindings, depth + 1))
                    && self.unify_exact(&e.ret, &a.ret, bindings, depth + 1)
            }
            _ => declared == actual,
        }
    }

    fn bind_var(&self, name: &str, actual: &Type, bindings: &mut TypeBindings) -> bool {
        if let Some(bound) = self.contract_bound(name)
            && !self.is_subtype(actual, bound)
        {
            return false;
        }
        match bindings.get(name).cloned() {
            None => {
                bindings.bind(name, actual.clone());
                true
            }
            Some(existing) if self.is_subtype(actual, &existing) => true,
            Some(existing) if self.is_subtype(&existing, actual) => {
                bindings.bind(name, actual.clone());
                true
            }
            Some(_) => false,
        }
    }
}

//
// Annotation parsing
//

fn type_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-').parse(input)
}

/// Parse a type annotation such as `int`, `list[a]` or `func[int,str,bool]`.
///
/// Names are not resolved here; [`TypeRegistry::resolve`] turns generic names
/// into variables once all declarations are known.
pub(crate) fn type_expr(input: &str) -> IResult<&str, Type> {
    let (rest, name) = type_name(input)?;
    let (rest, args) = opt(delimited(
        terminated(char('['), multispace0),
        separated_list1(
            delimited(multispace0, char(','), multispace0),
            type_expr,
        ),
        preceded(multispace0, char(']')),
    ))
    .parse(rest)?;

    let ty = match (name, args) {
        ("list", None) => Type::list_any(),
        ("list", Some(mut elems)) if elems.len() == 1 => Type::List(Box::new(elems.remove(0))),
        ("func", None) => Type::func(),
        ("func", Some(mut parts)) => {
            let ret = parts.pop().unwrap_or_else(Type::any);
            Type::func_of(parts, ret)
        }
        (other, None) => Type::Named(other.to_owned()),
        _ => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                ErrorKind::Verify,
            )));
        }
    };
    Ok((rest, ty))
}

/// Parse a complete type annotation string
pub fn parse_type(text: &str) -> Result<Type, Error> {
    match type_expr(text.trim()) {
        Ok(("", ty)) => Ok(ty),
        Ok((rest, _)) => Err(Error::ParseError(format!(
            "Unexpected input after type annotation: '{rest}'"
        ))),
        Err(_) => Err(Error::ParseError(format!("Invalid type annotation '{text}'"))),
    }
}
