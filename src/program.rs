//! Lowering of reader nodes into executable definitions and expressions,
//! plus module loading for `(use "path")`.
//!
//! Loading runs in two passes over all modules in load order: type
//! declarations (`deftype`, `contract`) first, so every annotation can be
//! resolved, then function definitions and top-level expressions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::Error;
use crate::ast::Node;
use crate::memo::MemoCache;
use crate::parser::parse_program;
use crate::types::{Type, TypeRegistry, parse_type};
use crate::value::Value;

/// Executable expression tree
#[derive(Debug)]
pub enum Expr {
    Literal(Value),
    Var(String),
    If(Rc<Expr>, Rc<Expr>, Rc<Expr>),
    /// Sequence in a fresh scope, with an optional trailing `:T` cast
    Do {
        body: Vec<Rc<Expr>>,
        cast: Option<Type>,
    },
    /// `set` binds in the current scope; `set'` also claims the resources
    /// opened while evaluating the value
    Set {
        name: String,
        ty: Option<Type>,
        value: Rc<Expr>,
        scoped: bool,
    },
    Lambda(Rc<LambdaDef>),
    Call {
        callee: Rc<Expr>,
        args: Vec<Rc<Expr>>,
    },
    And(Vec<Rc<Expr>>),
    Or(Vec<Rc<Expr>>),
}

/// One parameter of a clause
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Literal(Value),
    Bind(String),
    Typed(String, Type),
}

impl Pattern {
    pub fn binding(&self) -> Option<&str> {
        match self {
            Pattern::Literal(_) => None,
            Pattern::Bind(name) | Pattern::Typed(name, _) => Some(name),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Literal(value) => write!(f, "{}", value.repr()),
            Pattern::Bind(name) => write!(f, "{name}"),
            Pattern::Typed(name, ty) => write!(f, "{name}:{ty}"),
        }
    }
}

#[derive(Debug)]
pub struct Clause {
    pub params: Vec<Pattern>,
    pub return_type: Option<Type>,
    pub body: Rc<Expr>,
    pub memoize: bool,
    pub pure: bool,
}

impl Clause {
    /// `func[T1..Tn,R]` when every parameter and the result are typed
    pub fn signature(&self) -> Option<Type> {
        let params = self
            .params
            .iter()
            .map(|param| match param {
                Pattern::Typed(_, ty) => Some(ty.clone()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Type::func_of(params, self.return_type.clone()?))
    }
}

/// A named multi-clause function
#[derive(Debug)]
pub struct FunctionDef {
    pub name: String,
    pub clauses: Vec<Clause>,
    pub memo: MemoCache,
}

impl FunctionDef {
    fn new(name: &str) -> Self {
        FunctionDef {
            name: name.to_owned(),
            clauses: Vec::new(),
            memo: MemoCache::default(),
        }
    }

    /// True if some clause has a literal pattern at `position`
    pub fn has_literal_at(&self, position: usize) -> bool {
        self.clauses
            .iter()
            .any(|clause| matches!(clause.params.get(position), Some(Pattern::Literal(_))))
    }

    /// A function is pure if any of its clauses is declared pure
    pub fn is_pure(&self) -> bool {
        self.clauses.iter().any(|clause| clause.pure)
    }

    /// Static type of a reference to this function.
    ///
    /// Functions whose clauses disagree on their signature are typed as the
    /// bare `func`, so calls through such references are not checked.
    pub fn signature(&self) -> Type {
        let mut signatures = self.clauses.iter().map(Clause::signature);
        match signatures.next().flatten() {
            Some(first) if signatures.all(|sig| sig.as_ref() == Some(&first)) => first,
            _ => Type::func(),
        }
    }
}

/// The clause behind a `lambda` expression
#[derive(Debug)]
pub struct LambdaDef {
    pub clause: Clause,
}

/// Source of modules named by `(use "path")`
pub trait ModuleLoader {
    fn load(&self, path: &str) -> Result<String, Error>;
}

/// Loads modules from files relative to a root directory
#[derive(Debug, Clone)]
pub struct FsLoader {
    root: PathBuf,
}

impl FsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsLoader { root: root.into() }
    }
}

impl ModuleLoader for FsLoader {
    fn load(&self, path: &str) -> Result<String, Error> {
        let full = self.root.join(path);
        std::fs::read_to_string(&full)
            .map_err(|e| Error::EvalError(format!("cannot load module {}: {e}", full.display())))
    }
}

/// Modules kept in memory, keyed by path
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    modules: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, path: &str, source: &str) -> Self {
        self.modules.insert(path.to_owned(), source.to_owned());
        self
    }
}

impl ModuleLoader for MemoryLoader {
    fn load(&self, path: &str) -> Result<String, Error> {
        self.modules
            .get(path)
            .cloned()
            .ok_or_else(|| Error::EvalError(format!("cannot load module {path}: not found")))
    }
}

/// Definitions and top-level expressions of a loaded program
#[derive(Debug, Default)]
pub struct Program {
    pub types: TypeRegistry,
    pub functions: HashMap<String, Rc<FunctionDef>>,
    pub statements: Vec<Rc<Expr>>,
    loaded_modules: HashSet<String>,
}

fn malformed(form: &str, node: &Node) -> Error {
    Error::ParseError(format!("malformed {form}: {node}"))
}

const DEFINITION_FORMS: [&str; 6] = ["def", "def'", "defpure", "deftype", "contract", "use"];

impl Program {
    /// Load a program and the modules it uses
    pub fn load(source: &str, loader: &dyn ModuleLoader) -> Result<Program, Error> {
        let mut program = Program::default();
        program.extend(source, loader)?;
        Ok(program)
    }

    /// Load more source into this program as a new module, returning the
    /// top-level expressions it added (including those of used modules).
    pub fn extend(
        &mut self,
        source: &str,
        loader: &dyn ModuleLoader,
    ) -> Result<Vec<Rc<Expr>>, Error> {
        let mut modules = Vec::new();
        self.collect_modules(parse_program(source)?, loader, &mut modules)?;

        for forms in &modules {
            for form in forms {
                self.declare(form)?;
            }
        }

        let mut added = Vec::new();
        for forms in &modules {
            added.extend(self.lower_module(forms)?);
        }
        self.statements.extend(added.iter().cloned());
        Ok(added)
    }

    /// Flatten `use` forms into modules listed dependencies first
    fn collect_modules(
        &mut self,
        forms: Vec<Node>,
        loader: &dyn ModuleLoader,
        modules: &mut Vec<Vec<Node>>,
    ) -> Result<(), Error> {
        let mut own = Vec::new();
        for form in forms {
            match form_keyword(&form) {
                Some("use") => {
                    let path = match &form {
                        Node::List(items) => match items.as_slice() {
                            [_, Node::Str(path)] => path.clone(),
                            _ => return Err(malformed("use", &form)),
                        },
                        _ => return Err(malformed("use", &form)),
                    };
                    // Each module is loaded once; a cycle sees the module as loaded
                    if self.loaded_modules.insert(path.clone()) {
                        debug!(module = %path, "loading module");
                        let source = loader.load(&path)?;
                        self.collect_modules(parse_program(&source)?, loader, modules)?;
                    }
                }
                _ => own.push(form),
            }
        }
        modules.push(own);
        Ok(())
    }

    fn declare(&mut self, form: &Node) -> Result<(), Error> {
        let Node::List(items) = form else {
            return Ok(());
        };
        match form_keyword(form) {
            Some("deftype") => match items.as_slice() {
                [_, name, parent] => {
                    let name = name.plain_symbol().ok_or_else(|| malformed("deftype", form))?;
                    if self.functions.contains_key(name) {
                        return Err(Error::TypeError(format!(
                            "type {name} collides with a function of the same name"
                        )));
                    }
                    let parent = type_from_node(parent).ok_or_else(|| malformed("deftype", form))??;
                    self.types.declare_type(name, &parent)
                }
                _ => Err(malformed("deftype", form)),
            },
            Some("contract") => match items.as_slice() {
                [_, name] => {
                    let name = name.plain_symbol().ok_or_else(|| malformed("contract", form))?;
                    self.types.declare_contract(name, None)
                }
                [_, name, bound] => {
                    let name = name.plain_symbol().ok_or_else(|| malformed("contract", form))?;
                    let bound = type_from_node(bound).ok_or_else(|| malformed("contract", form))??;
                    self.types.declare_contract(name, Some(&bound))
                }
                _ => Err(malformed("contract", form)),
            },
            _ => Ok(()),
        }
    }

    fn lower_module(&mut self, forms: &[Node]) -> Result<Vec<Rc<Expr>>, Error> {
        let mut defined: Vec<FunctionDef> = Vec::new();
        let mut statements = Vec::new();
        for form in forms {
            match form_keyword(form) {
                Some(keyword @ ("def" | "def'" | "defpure")) => {
                    let (name, clause) = self.lower_definition(keyword, form)?;
                    if self.types.is_user_type(&name) {
                        return Err(Error::TypeError(format!(
                            "function {name} collides with a type of the same name"
                        )));
                    }
                    match defined.iter_mut().find(|def| def.name == name) {
                        Some(def) => def.clauses.push(clause),
                        None => {
                            let mut def = FunctionDef::new(&name);
                            def.clauses.push(clause);
                            defined.push(def);
                        }
                    }
                }
                Some("deftype" | "contract") => {}
                _ => statements.push(self.lower_expr(form, true)?),
            }
        }
        for def in defined {
            if self.functions.contains_key(&def.name) {
                warn!(function = %def.name, "definition shadows an earlier module");
            }
            debug!(function = %def.name, clauses = def.clauses.len(), "defined function");
            self.functions.insert(def.name.clone(), Rc::new(def));
        }
        Ok(statements)
    }

    fn lower_definition(&self, keyword: &str, form: &Node) -> Result<(String, Clause), Error> {
        let Node::List(items) = form else {
            return Err(malformed(keyword, form));
        };
        let [_, name, params, rest @ ..] = items.as_slice() else {
            return Err(malformed(keyword, form));
        };
        let name = name.plain_symbol().ok_or_else(|| malformed(keyword, form))?;
        let memoize = keyword == "def'";
        let pure = memoize || keyword == "defpure";
        let clause = self.lower_clause(keyword, params, rest, memoize, pure, form)?;
        Ok((name.to_owned(), clause))
    }

    /// Parameters, optional `:Ret`, then one or more body expressions
    fn lower_clause(
        &self,
        form_name: &str,
        params: &Node,
        rest: &[Node],
        memoize: bool,
        pure: bool,
        form: &Node,
    ) -> Result<Clause, Error> {
        let Node::List(param_nodes) = params else {
            return Err(malformed(form_name, form));
        };
        let mut patterns = Vec::with_capacity(param_nodes.len());
        for node in param_nodes {
            let pattern = self.lower_pattern(node, form_name, form)?;
            if let Some(name) = pattern.binding()
                && patterns
                    .iter()
                    .any(|p: &Pattern| p.binding() == Some(name))
            {
                return Err(Error::ParseError(format!(
                    "Duplicate parameter name: {name}"
                )));
            }
            patterns.push(pattern);
        }

        let (return_type, body_nodes) = match rest {
            [Node::Annotation(ty), body @ ..] => (Some(self.types.resolve(ty)?), body),
            body => (None, body),
        };
        if body_nodes.is_empty() {
            return Err(malformed(form_name, form));
        }

        Ok(Clause {
            params: patterns,
            return_type,
            body: self.lower_body(body_nodes)?,
            memoize,
            pure,
        })
    }

    fn lower_pattern(&self, node: &Node, form_name: &str, form: &Node) -> Result<Pattern, Error> {
        match node {
            Node::Int(n) => Ok(Pattern::Literal(Value::Int(*n))),
            Node::Bool(b) => Ok(Pattern::Literal(Value::Bool(*b))),
            Node::Str(s) => Ok(Pattern::Literal(Value::Str(s.clone()))),
            Node::Quote(inner) if inner.is_nil() => Ok(Pattern::Literal(Value::Nil)),
            Node::Symbol { name, ty: None } => Ok(Pattern::Bind(name.clone())),
            Node::Symbol { name, ty: Some(ty) } => {
                Ok(Pattern::Typed(name.clone(), self.types.resolve(ty)?))
            }
            _ => Err(malformed(form_name, form)),
        }
    }

    /// A clause body; several expressions form an implicit `do`
    fn lower_body(&self, nodes: &[Node]) -> Result<Rc<Expr>, Error> {
        match nodes {
            [single] => self.lower_expr(single, false),
            many => Ok(Rc::new(Expr::Do {
                body: many
                    .iter()
                    .map(|node| self.lower_expr(node, true))
                    .collect::<Result<_, _>>()?,
                cast: None,
            })),
        }
    }

    /// Lower one expression; `set` forms are only accepted where
    /// `allow_set` is true (directly inside `do` or at top level)
    pub(crate) fn lower_expr(&self, node: &Node, allow_set: bool) -> Result<Rc<Expr>, Error> {
        let expr = match node {
            Node::Int(n) => Expr::Literal(Value::Int(*n)),
            Node::Bool(b) => Expr::Literal(Value::Bool(*b)),
            Node::Str(s) => Expr::Literal(Value::Str(s.clone())),
            Node::Quote(inner) => Expr::Literal(quote_value(inner)),
            Node::Symbol { name, ty: None } => Expr::Var(name.clone()),
            Node::Symbol { ty: Some(_), .. } | Node::Annotation(_) => {
                return Err(Error::ParseError(format!(
                    "type annotation not allowed here: {node}"
                )));
            }
            Node::List(items) => match items.as_slice() {
                [] => return Err(Error::ParseError("Cannot evaluate empty list".into())),
                [head, args @ ..] => match head.plain_symbol() {
                    Some("if") => match args {
                        [cond, then, otherwise] => Expr::If(
                            self.lower_expr(cond, false)?,
                            self.lower_expr(then, false)?,
                            self.lower_expr(otherwise, false)?,
                        ),
                        _ => {
                            return Err(Error::arity_error_with_expr(
                                3,
                                args.len(),
                                node.to_string(),
                            ));
                        }
                    },
                    Some("do") => self.lower_do(args)?,
                    Some(keyword @ ("set" | "set'")) => {
                        if !allow_set {
                            return Err(Error::ParseError(format!(
                                "{keyword} is only allowed directly inside do or at top level: {node}"
                            )));
                        }
                        self.lower_set(keyword, args, node)?
                    }
                    Some("lambda") => match args {
                        [params, rest @ ..] => {
                            let clause =
                                self.lower_clause("lambda", params, rest, false, false, node)?;
                            Expr::Lambda(Rc::new(LambdaDef { clause }))
                        }
                        [] => return Err(malformed("lambda", node)),
                    },
                    Some(keyword @ ("and" | "or")) => {
                        if args.is_empty() {
                            return Err(Error::arity_error_with_expr(1, 0, node.to_string()));
                        }
                        let operands = args
                            .iter()
                            .map(|arg| self.lower_expr(arg, false))
                            .collect::<Result<_, _>>()?;
                        if keyword == "and" {
                            Expr::And(operands)
                        } else {
                            Expr::Or(operands)
                        }
                    }
                    Some(keyword) if DEFINITION_FORMS.contains(&keyword) => {
                        return Err(Error::ParseError(format!(
                            "{keyword} is only allowed at top level"
                        )));
                    }
                    _ => Expr::Call {
                        callee: self.lower_expr(head, false)?,
                        args: args
                            .iter()
                            .map(|arg| self.lower_expr(arg, false))
                            .collect::<Result<_, _>>()?,
                    },
                },
            },
        };
        Ok(Rc::new(expr))
    }

    fn lower_do(&self, args: &[Node]) -> Result<Expr, Error> {
        let (body_nodes, cast) = match args {
            [body @ .., Node::Annotation(ty)] => (body, Some(self.types.resolve(ty)?)),
            body => (body, None),
        };
        if body_nodes.is_empty() {
            return Err(Error::ParseError("do requires at least one expression".into()));
        }
        Ok(Expr::Do {
            body: body_nodes
                .iter()
                .map(|node| self.lower_expr(node, true))
                .collect::<Result<_, _>>()?,
            cast,
        })
    }

    fn lower_set(&self, keyword: &str, args: &[Node], node: &Node) -> Result<Expr, Error> {
        match args {
            [Node::Symbol { name, ty }, value] => Ok(Expr::Set {
                name: name.clone(),
                ty: ty.as_ref().map(|ty| self.types.resolve(ty)).transpose()?,
                value: self.lower_expr(value, false)?,
                scoped: keyword == "set'",
            }),
            [_, _] => Err(malformed(keyword, node)),
            _ => Err(Error::arity_error_with_expr(2, args.len(), node.to_string())),
        }
    }
}

/// Leading keyword of a list form
fn form_keyword(node: &Node) -> Option<&str> {
    match node {
        Node::List(items) => items.first().and_then(Node::plain_symbol),
        _ => None,
    }
}

/// A type written as `list[int]`, `:T` or a bare type name
fn type_from_node(node: &Node) -> Option<Result<Type, Error>> {
    match node {
        Node::Annotation(ty) => Some(Ok(ty.clone())),
        Node::Symbol { name, ty: None } => Some(parse_type(name)),
        _ => None,
    }
}

/// Quoted data; identifiers become strings
fn quote_value(node: &Node) -> Value {
    match node {
        Node::Int(n) => Value::Int(*n),
        Node::Bool(b) => Value::Bool(*b),
        Node::Str(s) => Value::Str(s.clone()),
        Node::Symbol { .. } | Node::Annotation(_) => Value::Str(node.to_string()),
        Node::List(items) => Value::list(items.iter().map(quote_value).collect::<Vec<_>>()),
        Node::Quote(inner) => Value::list(vec![Value::Str("quote".into()), quote_value(inner)]),
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn load(source: &str) -> Result<Program, Error> {
        Program::load(source, &MemoryLoader::new())
    }

    #[test]
    fn test_clauses_append_in_source_order() {
        let program = load(
            "(def factorial (0) 1)\n\
             (def factorial (n:int) :int (* n (factorial (- n 1))))\n\
             (factorial 5)",
        )
        .unwrap();
        let factorial = &program.functions["factorial"];
        assert_eq!(factorial.clauses.len(), 2);
        assert_eq!(factorial.clauses[0].params, vec![Pattern::Literal(Value::Int(0))]);
        assert_eq!(
            factorial.clauses[1].params,
            vec![Pattern::Typed("n".into(), Type::int())]
        );
        assert_eq!(factorial.clauses[1].return_type, Some(Type::int()));
        assert!(factorial.has_literal_at(0));
        assert!(!factorial.has_literal_at(1));
        assert_eq!(program.statements.len(), 1);
    }

    #[test]
    fn test_definition_flags() {
        let program = load(
            "(def' fib (n) n)\n(defpure square (n) (* n n))\n(def show (x) (print x))",
        )
        .unwrap();
        let fib = &program.functions["fib"].clauses[0];
        assert!(fib.memoize && fib.pure);
        let square = &program.functions["square"].clauses[0];
        assert!(!square.memoize && square.pure);
        assert!(!program.functions["show"].is_pure());
    }

    #[test]
    fn test_signatures() {
        let program = load(
            "(def inc (n:int) :int (+ n 1))\n\
             (def mixed (n:int) :int n)\n\
             (def mixed (s:str) :str s)\n\
             (def untyped (x) x)",
        )
        .unwrap();
        assert_eq!(
            program.functions["inc"].signature(),
            Type::func_of(vec![Type::int()], Type::int())
        );
        assert_eq!(program.functions["mixed"].signature(), Type::func());
        assert_eq!(program.functions["untyped"].signature(), Type::func());
    }

    #[test]
    fn test_generic_names_resolve_to_variables() {
        let program = load(
            "(contract elem)\n\
             (def first (n:int l:list[elem]) :elem (head l))\n\
             (def second (x:a) :a x)",
        )
        .unwrap();
        let first = &program.functions["first"].clauses[0];
        assert_eq!(
            first.params[1],
            Pattern::Typed("l".into(), Type::list(Type::var("elem")))
        );
        assert_eq!(first.return_type, Some(Type::var("elem")));
        assert_eq!(
            program.functions["second"].clauses[0].params[0],
            Pattern::Typed("x".into(), Type::var("a"))
        );
    }

    #[test]
    fn test_declarations_precede_definitions() {
        // The type is usable before its declaration appears in the source
        let program = load("(def wrap (x:ints) x)\n(deftype ints list[int])").unwrap();
        assert!(program.types.is_user_type("ints"));
        assert!(program.types.is_subtype(&Type::named("ints"), &Type::list_any()));
    }

    #[test]
    fn test_load_errors() {
        let cases = vec![
            ("(def f (x:nosuch) x)", "unknown type: nosuch"),
            ("(deftype t int)\n(def t (x) x)", "collides"),
            ("(def f (x x) x)", "Duplicate parameter name"),
            ("(def f (x))", "malformed def"),
            ("(if true 1)", "ArityError"),
            ("(and)", "ArityError"),
            ("(+ 1 (set x 2))", "only allowed directly inside do"),
            ("(do (def g (x) x))", "only allowed at top level"),
            ("(deftype t nosuch)", "unknown type"),
            ("(deftype int any)", "already defined"),
            ("(use 42)", "malformed use"),
            ("(use \"missing.cl\")", "not found"),
            ("(f x:int)", "type annotation not allowed"),
        ];
        for (source, expected) in cases {
            let err = load(source).unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "loading {source:?}: expected error containing {expected:?}, got {err}"
            );
        }
    }

    #[test]
    fn test_set_is_allowed_in_do_and_bodies() {
        assert!(load("(set x 1)").is_ok());
        assert!(load("(do (set x 1) x)").is_ok());
        assert!(load("(def f (y) (set x y) x)").is_ok());
        assert!(load("(do (set' f (open \"a\")) :list)").is_ok());
    }

    #[test]
    fn test_use_loads_modules_once_and_shadows() {
        let loader = MemoryLoader::new()
            .with_module("lib.cl", "(use \"base.cl\")\n(def greet (x) \"lib\")")
            .with_module("base.cl", "(use \"lib.cl\")\n(def greet (x) \"base\")\n(def base-only (x) x)");
        let program = Program::load(
            "(use \"lib.cl\")\n(use \"base.cl\")\n(greet 1)",
            &loader,
        )
        .unwrap();
        // base.cl loads first (dependency of lib.cl), lib.cl's greet replaces it
        let greet = &program.functions["greet"];
        assert_eq!(greet.clauses.len(), 1);
        assert!(matches!(
            greet.clauses[0].body.as_ref(),
            Expr::Literal(Value::Str(s)) if s == "lib"
        ));
        assert!(program.functions.contains_key("base-only"));
    }

    #[test]
    fn test_quoted_data() {
        let program = load("'(1 a \"s\" (true))").unwrap();
        match program.statements[0].as_ref() {
            Expr::Literal(value) => assert_eq!(
                value.clone(),
                Value::from(vec![
                    Value::Int(1),
                    Value::from("a"),
                    Value::from("s"),
                    Value::from(vec![true]),
                ])
            ),
            other => panic!("expected literal, got {other:?}"),
        }
    }
}
