//! Clause selection for multi-clause functions.
//!
//! The same algorithm runs at runtime over [`Value`]s and in the checker over
//! static [`Type`]s; the [`Subject`] trait supplies the per-pattern match
//! predicates for each.

use tracing::debug;

use crate::Error;
use crate::program::{Clause, Pattern};
use crate::types::{Type, TypeBindings, TypeRegistry};
use crate::value::Value;

/// Something a clause can be matched against
pub trait Subject {
    /// Does this argument match a literal pattern?
    fn matches_literal(&self, literal: &Value, types: &TypeRegistry) -> bool;

    /// Does this argument satisfy a declared parameter type?
    fn matches_type(
        &self,
        declared: &Type,
        types: &TypeRegistry,
        bindings: &mut TypeBindings,
    ) -> bool;

    /// Form used in dispatch diagnostics
    fn describe(&self) -> String;
}

impl Subject for Value {
    fn matches_literal(&self, literal: &Value, _types: &TypeRegistry) -> bool {
        self == literal
    }

    fn matches_type(
        &self,
        declared: &Type,
        types: &TypeRegistry,
        bindings: &mut TypeBindings,
    ) -> bool {
        self.conforms_to(declared, types, bindings)
    }

    fn describe(&self) -> String {
        self.repr().to_string()
    }
}

impl Subject for Type {
    /// A literal pattern may match when the literal's type and the argument
    /// type overlap
    fn matches_literal(&self, literal: &Value, types: &TypeRegistry) -> bool {
        let literal_type = literal.type_of(types);
        types.is_subtype(&literal_type, self) || types.is_subtype(self, &literal_type)
    }

    /// Statically unknown arguments (`any`, or a list of unknown elements
    /// where a list is declared) are let through for the runtime to check
    fn matches_type(
        &self,
        declared: &Type,
        types: &TypeRegistry,
        bindings: &mut TypeBindings,
    ) -> bool {
        match (self, declared) {
            (actual, _) if actual.is_any() => true,
            (Type::List(elem), Type::List(_)) if elem.is_any() => true,
            _ => types.unify(declared, self, bindings),
        }
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

/// The clause chosen for a call
#[derive(Debug)]
pub struct Selection<'c> {
    pub index: usize,
    pub clause: &'c Clause,
    pub bindings: TypeBindings,
    /// Declared return type with generic bindings applied
    pub return_type: Option<Type>,
}

fn match_clause<S: Subject>(
    clause: &Clause,
    args: &[S],
    types: &TypeRegistry,
) -> Option<TypeBindings> {
    if clause.params.len() != args.len() {
        return None;
    }
    let mut bindings = TypeBindings::default();
    for (pattern, arg) in clause.params.iter().zip(args) {
        let matched = match pattern {
            Pattern::Literal(literal) => arg.matches_literal(literal, types),
            Pattern::Bind(_) => true,
            Pattern::Typed(_, declared) => arg.matches_type(declared, types, &mut bindings),
        };
        if !matched {
            return None;
        }
    }
    Some(bindings)
}

/// Pick the first clause whose every parameter matches
pub fn select<'c, S: Subject>(
    name: &str,
    clauses: &'c [Clause],
    args: &[S],
    types: &TypeRegistry,
) -> Result<Selection<'c>, Error> {
    for (index, clause) in clauses.iter().enumerate() {
        if let Some(bindings) = match_clause(clause, args, types) {
            debug!(function = name, clause = index, "dispatched");
            let return_type = clause.return_type.as_ref().map(|ty| bindings.apply(ty));
            return Ok(Selection {
                index,
                clause,
                bindings,
                return_type,
            });
        }
    }
    Err(Error::Dispatch {
        function: name.to_owned(),
        arguments: args
            .iter()
            .map(Subject::describe)
            .collect::<Vec<_>>()
            .join(" "),
    })
}
