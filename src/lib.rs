//! Clausal - a small functional language runtime over S-expressions
//!
//! This crate provides a tree-walking evaluator for programs written as
//! S-expressions, together with an optional ahead-of-time type checker.
//! Functions are defined as ordered sets of pattern-matched clauses:
//!
//! ```text
//! (def factorial (0) 1)
//! (def factorial (n:int) :int (* n (factorial (- n 1))))
//! (factorial 5)
//! ```
//!
//! ## Core mechanisms
//!
//! - **Dispatch**: the first clause whose literal, bare and typed parameter
//!   patterns all match is selected. The same matching algorithm runs over
//!   runtime values and over static types.
//! - **Tail calls**: the evaluator is a trampoline. Calls in tail position
//!   rebind the loop's expression and environment instead of recursing, so
//!   tail-recursive programs run in constant host stack.
//! - **Lazy lists**: `(gen iter state)` builds a generator whose elements are
//!   computed on demand by `head`/`tail`. Every node is forced at most once.
//! - **Types**: a subtype lattice rooted at `any`, user types via `deftype`,
//!   covariant `list[T]`, `func[T1..Tn,R]` signatures and generic variables
//!   (`a`..`e` or declared with `contract`) resolved per call by unification.
//!
//! ## Modules
//!
//! - `parser`: S-expression reader producing [`ast::Node`] trees
//! - `program`: lowering of nodes into definitions and expressions, module loading
//! - `value`, `environment`: runtime data and scope chains
//! - `types`, `dispatch`: the type lattice and clause selection
//! - `evaluator`, `generator`, `memo`: execution
//! - `checker`: static type checking
//! - `builtinops`: the builtin operation registry

use thiserror::Error;

/// Maximum parsing depth to prevent stack overflow attacks
/// This limits deeply nested structures in the reader
pub const MAX_PARSE_DEPTH: usize = 256;

/// Maximum depth of non-tail evaluation.
///
/// Tail calls do not count against this limit; it only bounds the host
/// recursion caused by nested argument evaluation and non-tail calls.
pub const MAX_EVAL_DEPTH: usize = 1000;

/// Maximum number of parent links walked when checking `deftype` ancestry
pub const MAX_TYPE_DEPTH: usize = 64;

/// Error types for the interpreter and the static checker
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("ParseError: {0}")]
    ParseError(String),
    /// No clause of a function accepts the given arguments (or argument types)
    #[error("{function}: no matching function implementation found for [{arguments}]")]
    Dispatch { function: String, arguments: String },
    /// A value (or static type) is not acceptable where a type is required
    #[error("{context}: Expected all {expected} arguments, found {found} at position {position}")]
    Cast {
        context: String,
        expected: String,
        found: String,
        position: usize,
    },
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("Unbound variable: {0}")]
    UnboundVariable(String),
    /// A pure or memoized function calls one with side effects
    #[error("{function}: pure function calls impure function {callee}")]
    Purity { function: String, callee: String },
    #[error("{}", arity_message(.expected, .got, .expression))]
    ArityError {
        expected: usize,
        got: usize,
        expression: Option<String>, // Optional expression context
    },
    #[error("EvaluationError: {0}")]
    EvalError(String),
    /// Failure while releasing a scoped resource
    #[error("ResourceError: {0}")]
    ResourceError(String),
    /// Call-context wrapper added while an error unwinds through a function call
    #[error("{source}\n  in {function}")]
    InCall {
        function: String,
        #[source]
        source: Box<Error>,
    },
}

fn arity_message(expected: &usize, got: &usize, expression: &Option<String>) -> String {
    match expression {
        Some(expr) => {
            format!("ArityError: expression {expr}: expected {expected} arguments, got {got}")
        }
        None => format!("ArityError: function expected {expected} arguments but got {got}"),
    }
}

impl Error {
    /// Create an ArityError without expression context
    pub fn arity_error(expected: usize, got: usize) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: None,
        }
    }

    /// Create an ArityError with expression context
    pub fn arity_error_with_expr(expected: usize, got: usize, expression: String) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: Some(expression),
        }
    }

    /// Wrap this error with the name of the function it unwound through
    pub fn in_call(self, function: impl Into<String>) -> Self {
        Error::InCall {
            function: function.into(),
            source: Box::new(self),
        }
    }

    /// The underlying error with every call-context wrapper removed
    pub fn root(&self) -> &Error {
        match self {
            Error::InCall { source, .. } => source.root(),
            other => other,
        }
    }

    /// Function names this error unwound through, innermost first
    pub fn call_chain(&self) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self;
        while let Error::InCall { function, source } = current {
            chain.push(function.as_str());
            current = source;
        }
        chain.reverse();
        chain
    }
}

pub mod ast;
pub mod builtinops;
pub mod checker;
pub mod dispatch;
pub mod environment;
pub mod evaluator;
pub mod generator;
pub mod memo;
pub mod parser;
pub mod program;
pub mod types;
pub mod value;

pub use checker::{CheckReport, check_program};
pub use evaluator::Interpreter;
pub use program::{FsLoader, MemoryLoader, ModuleLoader, Program};
pub use value::Value;
