//! Ahead-of-time type checking.
//!
//! The checker walks the same lowered program the evaluator runs, carrying
//! static [`Type`]s where the evaluator carries values. Every call site with a
//! known callee is dispatched over its argument types with the runtime's own
//! clause selection, so a call is well-typed exactly when some clause could
//! accept those types.
//!
//! Checking is gradual: `any` (bare parameters, unannotated results, lists of
//! unknown elements) is accepted everywhere and left to the runtime. The pass
//! never stops at the first problem; every diagnostic is collected into the
//! [`CheckReport`].

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::Error;
use crate::builtinops::{BuiltinOp, find_op};
use crate::dispatch::{self, Subject};
use crate::program::{Clause, Expr, FunctionDef, Pattern, Program};
use crate::types::{FuncSig, Type, TypeBindings, TypeRegistry};

/// Diagnostics produced by [`check_program`]
#[derive(Debug, Default)]
pub struct CheckReport {
    /// In program order; diagnostics from a function body are wrapped with
    /// the function's name
    pub diagnostics: Vec<Error>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for diagnostic in &self.diagnostics {
            writeln!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

/// Static bindings in scope: name to type
type Scope = HashMap<String, Type>;

/// The definition whose clause is being checked
struct Context {
    function: String,
    pure: bool,
}

struct Checker<'p> {
    program: &'p Program,
    diagnostics: Vec<Error>,
    context: Option<Context>,
}

/// Check a whole program: top-level expressions first, then every clause of
/// every function with its parameters in scope
pub fn check_program(program: &Program) -> CheckReport {
    let mut checker = Checker {
        program,
        diagnostics: Vec::new(),
        context: None,
    };

    let mut globals = Scope::new();
    predeclare(program.statements.iter().map(|expr| &**expr), &mut globals);
    for statement in &program.statements {
        checker.infer(statement, &mut globals);
    }

    let mut functions: Vec<&FunctionDef> = program.functions.values().map(|def| &**def).collect();
    functions.sort_by(|a, b| a.name.cmp(&b.name));
    for def in functions {
        for clause in &def.clauses {
            checker.check_clause(def, clause, &globals);
        }
    }

    debug!(diagnostics = checker.diagnostics.len(), "check finished");
    CheckReport {
        diagnostics: checker.diagnostics,
    }
}

/// Names a sequence of expressions will `set`, visible to lambdas created
/// before the binding runs
fn predeclare<'e>(exprs: impl Iterator<Item = &'e Expr>, scope: &mut Scope) {
    for expr in exprs {
        if let Expr::Set { name, .. } = expr {
            scope.entry(name.clone()).or_insert_with(Type::any);
        }
    }
}

/// Static type of a parameter inside the clause body; generic variables are
/// unknown until a call binds them
fn param_type(pattern: &Pattern) -> Option<Type> {
    match pattern {
        Pattern::Literal(_) => None,
        Pattern::Bind(_) => Some(Type::any()),
        Pattern::Typed(_, ty) => Some(TypeBindings::default().apply(ty)),
    }
}

impl Checker<'_> {
    fn types(&self) -> &TypeRegistry {
        &self.program.types
    }

    fn report(&mut self, error: Error) {
        let error = match &self.context {
            Some(context) => error.in_call(context.function.clone()),
            None => error,
        };
        self.diagnostics.push(error);
    }

    /// Could a value of static type `actual` satisfy `expected` at runtime?
    ///
    /// True when `actual` is acceptable outright, or when `expected` is
    /// narrower and a runtime value of `actual` may still be of that subtype.
    fn compatible(&self, actual: &Type, expected: &Type) -> bool {
        let expected = TypeBindings::default().apply(expected);
        actual.matches_type(&expected, self.types(), &mut TypeBindings::default())
            || self.types().is_subtype(&expected, actual)
    }

    fn is_callable(&self, ty: &Type) -> bool {
        ty.is_any() || self.types().is_subtype(ty, &Type::func())
    }

    fn check_clause(&mut self, def: &FunctionDef, clause: &Clause, globals: &Scope) {
        self.context = Some(Context {
            function: def.name.clone(),
            pure: clause.pure,
        });

        let mut scope = globals.clone();
        for pattern in &clause.params {
            if let (Some(name), Some(ty)) = (pattern.binding(), param_type(pattern)) {
                scope.insert(name.to_owned(), ty);
            }
        }
        let body = self.infer(&clause.body, &mut scope);
        if let Some(declared) = &clause.return_type
            && !self.compatible(&body, declared)
        {
            self.report(Error::TypeError(format!(
                "{}: body returns {body} but declared return type is {declared}",
                def.name
            )));
        }

        self.context = None;
    }

    fn infer(&mut self, expr: &Expr, scope: &mut Scope) -> Type {
        match expr {
            Expr::Literal(value) => value.type_of(self.types()),
            Expr::Var(name) => self.infer_var(name, scope),
            Expr::If(condition, then, otherwise) => {
                let condition = self.infer(condition, scope);
                if !self.compatible(&condition, &Type::bool()) {
                    self.report(Error::TypeError(format!(
                        "if: condition must be a boolean, got {condition}"
                    )));
                }
                let then = self.infer(then, scope);
                let otherwise = self.infer(otherwise, scope);
                self.types().join(&then, &otherwise)
            }
            Expr::Do { body, cast } => {
                let mut inner = scope.clone();
                predeclare(body.iter().map(|expr| &**expr), &mut inner);
                let mut last = Type::list_any();
                for item in body {
                    last = self.infer(item, &mut inner);
                }
                match cast {
                    Some(target) => {
                        self.check_cast(&last, target, "do");
                        target.clone()
                    }
                    None => last,
                }
            }
            Expr::Set {
                name, ty, value, ..
            } => {
                if matches!(value.as_ref(), Expr::Lambda(_)) {
                    scope.entry(name.clone()).or_insert_with(Type::func);
                }
                let inferred = self.infer(value, scope);
                let bound = match ty {
                    Some(declared) => {
                        self.check_cast(&inferred, declared, "set");
                        declared.clone()
                    }
                    None => inferred,
                };
                scope.insert(name.clone(), bound.clone());
                bound
            }
            Expr::Lambda(def) => self.infer_lambda(&def.clause, scope),
            Expr::And(operands) => self.infer_logical("and", operands, scope),
            Expr::Or(operands) => self.infer_logical("or", operands, scope),
            Expr::Call { callee, args } => {
                let arg_types: Vec<Type> = args.iter().map(|arg| self.infer(arg, scope)).collect();
                match callee.as_ref() {
                    Expr::Var(name) if !scope.contains_key(name) => {
                        self.infer_named_call(name, &arg_types)
                    }
                    _ => {
                        let callee_type = self.infer(callee, scope);
                        let name = match callee.as_ref() {
                            Expr::Var(name) => name.as_str(),
                            _ => "lambda",
                        };
                        self.infer_value_call(name, &callee_type, &arg_types)
                    }
                }
            }
        }
    }

    fn infer_var(&mut self, name: &str, scope: &Scope) -> Type {
        if let Some(ty) = scope.get(name) {
            return ty.clone();
        }
        if let Some(def) = self.program.functions.get(name) {
            return def.signature();
        }
        if let Some(parent) = self.types().parent_of(name) {
            return Type::func_of(vec![parent.clone()], Type::named(name));
        }
        if find_op(name).is_some() {
            return Type::func();
        }
        self.report(Error::UnboundVariable(name.to_owned()));
        Type::any()
    }

    fn infer_logical(&mut self, form: &str, operands: &[Rc<Expr>], scope: &mut Scope) -> Type {
        for operand in operands {
            let ty = self.infer(operand, scope);
            if !self.compatible(&ty, &Type::bool()) {
                self.report(Error::TypeError(format!("{form}: expected boolean, got {ty}")));
            }
        }
        Type::bool()
    }

    fn infer_lambda(&mut self, clause: &Clause, scope: &Scope) -> Type {
        let mut inner = scope.clone();
        let mut params = Vec::with_capacity(clause.params.len());
        for pattern in &clause.params {
            if let (Some(name), Some(ty)) = (pattern.binding(), param_type(pattern)) {
                inner.insert(name.to_owned(), ty);
            }
            params.push(match pattern {
                Pattern::Typed(_, ty) => Some(ty.clone()),
                _ => None,
            });
        }
        let body = self.infer(&clause.body, &mut inner);
        if let Some(declared) = &clause.return_type
            && !self.compatible(&body, declared)
        {
            self.report(Error::TypeError(format!(
                "lambda: body returns {body} but declared return type is {declared}"
            )));
        }
        let ret = clause.return_type.clone().unwrap_or(body);
        match params.into_iter().collect::<Option<Vec<_>>>() {
            Some(params) => Type::func_of(params, ret),
            None => Type::func(),
        }
    }

    fn check_cast(&mut self, actual: &Type, target: &Type, context: &str) {
        if !self.compatible(actual, target) {
            self.report(Error::Cast {
                context: context.to_owned(),
                expected: target.to_string(),
                found: actual.to_string(),
                position: 0,
            });
        }
    }

    fn check_purity(&mut self, callee: &str, callee_is_pure: bool) {
        if let Some(context) = &self.context
            && context.pure
            && !callee_is_pure
        {
            let error = Error::Purity {
                function: context.function.clone(),
                callee: callee.to_owned(),
            };
            self.report(error);
        }
    }

    /// A call whose callee names a function, type or builtin
    fn infer_named_call(&mut self, name: &str, args: &[Type]) -> Type {
        let program = self.program;
        if let Some(def) = program.functions.get(name) {
            self.check_purity(name, def.is_pure());
            return match dispatch::select(name, &def.clauses, args, &program.types) {
                Ok(selection) => selection.return_type.unwrap_or_else(Type::any),
                Err(err) => {
                    self.report(err);
                    Type::any()
                }
            };
        }
        if let Some(parent) = self.types().parent_of(name).cloned() {
            match args {
                [arg] => self.check_cast(arg, &parent, name),
                _ => self.report(Error::arity_error(1, args.len())),
            }
            return Type::named(name);
        }
        if let Some(op) = find_op(name) {
            self.check_purity(name, op.pure);
            return self.infer_builtin_call(op, args);
        }
        self.report(Error::UnboundVariable(name.to_owned()));
        Type::any()
    }

    fn infer_builtin_call(&mut self, op: &BuiltinOp, args: &[Type]) -> Type {
        if let Err(err) = op.validate_arity(args.len()) {
            self.report(err);
            return TypeBindings::default().apply(&op.signature.ret);
        }
        match (op.id, args) {
            ("list", []) => return Type::list_any(),
            ("list", [first, rest @ ..]) => {
                let elem = rest
                    .iter()
                    .fold(first.clone(), |acc, ty| self.types().join(&acc, ty));
                return Type::list(elem);
            }
            ("cons", [head, Type::List(elem)]) => return Type::list(self.types().join(head, elem)),
            _ => {}
        }

        let mut bindings = TypeBindings::default();
        for (position, arg) in args.iter().enumerate() {
            let Some(param) = op.signature.param_at(position) else {
                continue;
            };
            if !arg.matches_type(param, self.types(), &mut bindings) && !self.compatible(arg, param) {
                self.report(Error::Cast {
                    context: op.id.to_owned(),
                    expected: bindings.apply(param).to_string(),
                    found: arg.to_string(),
                    position,
                });
            }
        }
        bindings.apply(&op.signature.ret)
    }

    /// A call through a value: a local binding or a computed callee
    fn infer_value_call(&mut self, name: &str, callee: &Type, args: &[Type]) -> Type {
        if !self.is_callable(callee) {
            self.report(Error::TypeError(format!(
                "cannot call a value of type {callee}"
            )));
            return Type::any();
        }
        let Type::Func(Some(FuncSig { params, ret })) = callee else {
            return Type::any();
        };
        let accepted = params.len() == args.len()
            && params
                .iter()
                .zip(args)
                .all(|(param, arg)| self.compatible(arg, param));
        if !accepted {
            self.report(Error::Dispatch {
                function: name.to_owned(),
                arguments: args.iter().map(Subject::describe).collect::<Vec<_>>().join(" "),
            });
            return Type::any();
        }
        TypeBindings::default().apply(ret)
    }
}
