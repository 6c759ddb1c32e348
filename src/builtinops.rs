//! Built-in operations registry.
//!
//! Every builtin is described once by a [`BuiltinOp`]: its identifier, its
//! implementation, the number of arguments it accepts, whether it is free of
//! side effects, and the static [`Signature`] the checker uses at call sites.
//!
//! ```text
//! (+ 1 2 3)              ; arithmetic with overflow detection
//! (< 1 2 3)              ; chained comparison
//! (cons 1 (list 2 3))    ; list construction
//! (head (gen next 0))    ; lazy lists
//! ```
//!
//! ## Functions vs Intrinsics
//!
//! - **Functions** only see their evaluated arguments and are built from
//!   ordinary typed Rust functions through the adapter layer in
//!   [`crate::evaluator::intooperation`]. User-type brands survive in `Value`
//!   arguments, so `(list (meters 5))` holds a `meters`.
//! - **Intrinsics** additionally get the running [`Interpreter`], because
//!   they force lazy lists or touch the interpreter's output and files.
//!
//! Special forms (`if`, `do`, `set`, `lambda`, `and`, `or`) are lowered by
//! [`crate::program`] and evaluated directly; they are not in this registry.
//!
//! ## Error Handling
//!
//! - **Type Safety**: arguments of the wrong type fail with
//!   `<op>: Expected all <type> arguments, found <value> at position <n>`
//! - **No Coercion**: numbers don't become strings, no truthiness
//! - **Overflow Detection**: arithmetic detects and reports overflow
//! - **Arity Checking**: argument counts are validated before the call

use crate::Error;
use crate::ast::NumberType;
use crate::evaluator::Interpreter;
use crate::evaluator::intooperation::{
    IntoOperation, IntoVariadicOperation, NumIter, OperationFn, ValueIter, argument_error,
};
use crate::generator::{self, Generator, force_all, uncons};
use crate::types::Type;
use crate::value::Value;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, LazyLock};

/// Number of arguments an operation accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub fn validate(&self, got: usize) -> Result<(), Error> {
        match *self {
            Arity::Exact(expected) if got != expected => Err(Error::arity_error(expected, got)),
            Arity::AtLeast(min) if got < min => Err(Error::arity_error(min, got)),
            _ => Ok(()),
        }
    }
}

/// Static parameter and result types of a builtin.
///
/// Parameters past the fixed prefix all have the `rest` type.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub params: Vec<Type>,
    pub rest: Option<Type>,
    pub ret: Type,
}

impl Signature {
    fn fixed(params: Vec<Type>, ret: Type) -> Self {
        Signature {
            params,
            rest: None,
            ret,
        }
    }

    fn variadic(params: Vec<Type>, rest: Type, ret: Type) -> Self {
        Signature {
            params,
            rest: Some(rest),
            ret,
        }
    }

    /// Declared type of the argument at `position`
    pub fn param_at(&self, position: usize) -> Option<&Type> {
        self.params.get(position).or(self.rest.as_ref())
    }
}

/// Builtin that needs the interpreter itself
pub(crate) type IntrinsicFn = fn(&mut Interpreter, Vec<Value>) -> Result<Value, Error>;

/// Represents the implementation of a built-in operation
#[derive(Clone)]
pub enum OpKind {
    /// Regular function over evaluated arguments, via the canonical erased
    /// builtin signature used by the evaluator.
    Function(Arc<OperationFn>),
    /// Operation that needs access to the running interpreter
    Intrinsic(IntrinsicFn),
}

impl std::fmt::Debug for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Function(_) => write!(f, "Function(<fn>)"),
            OpKind::Intrinsic(_) => write!(f, "Intrinsic(<fn>)"),
        }
    }
}

impl PartialEq for OpKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OpKind::Function(f1), OpKind::Function(f2)) => Arc::ptr_eq(f1, f2),
            (OpKind::Intrinsic(f1), OpKind::Intrinsic(f2)) => std::ptr::fn_addr_eq(*f1, *f2),
            _ => false,
        }
    }
}

/// Definition of a built-in operation
#[derive(Debug, Clone)]
pub struct BuiltinOp {
    /// The identifier programs call this operation by
    pub id: &'static str,
    pub op_kind: OpKind,
    pub arity: Arity,
    /// False for operations with observable side effects
    pub pure: bool,
    pub signature: Signature,
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl BuiltinOp {
    /// Check if the given number of arguments is valid for this operation
    pub(crate) fn validate_arity(&self, arg_count: usize) -> Result<(), Error> {
        self.arity.validate(arg_count)
    }

    /// Invoke the operation on arguments whose count is already validated
    pub(crate) fn call(&self, interp: &mut Interpreter, args: Vec<Value>) -> Result<Value, Error> {
        let result = match &self.op_kind {
            OpKind::Function(func) => func(args),
            OpKind::Intrinsic(func) => func(interp, args),
        };
        result.map_err(|err| with_operation_context(err, self.id))
    }
}

/// Name the operation in argument errors raised by the adapter layer
pub(crate) fn with_operation_context(err: Error, id: &str) -> Error {
    match err {
        Error::Cast {
            context,
            expected,
            found,
            position,
        } if context.is_empty() => Error::Cast {
            context: id.to_owned(),
            expected,
            found,
            position,
        },
        other => other,
    }
}

//
// Builtin Function Implementations
//

// Macro to generate numeric comparison functions
macro_rules! numeric_comparison {
    ($name:ident, $op:tt) => {
        fn $name(first: NumberType, rest: NumIter<'_>) -> bool {
            // Chain comparisons: all adjacent pairs must satisfy the comparison.
            let mut prev = first;
            for current in rest {
                if !(prev $op current) {
                    return false;
                }
                prev = current;
            }
            true
        }
    };
}

numeric_comparison!(builtin_lt, <);
numeric_comparison!(builtin_gt, >);
numeric_comparison!(builtin_le, <=);
numeric_comparison!(builtin_ge, >=);

fn builtin_add(args: NumIter<'_>) -> Result<NumberType, Error> {
    let mut sum = 0 as NumberType;
    for arg in args {
        sum = sum
            .checked_add(arg)
            .ok_or_else(|| Error::EvalError("Integer overflow in addition".into()))?;
    }
    Ok(sum)
}

fn builtin_sub(first: NumberType, rest: NumIter<'_>) -> Result<NumberType, Error> {
    let mut iter = rest.peekable();

    if iter.peek().is_none() {
        return first
            .checked_neg()
            .ok_or_else(|| Error::EvalError("Integer overflow in negation".into()));
    }

    let mut result = first;
    for n in iter {
        result = result
            .checked_sub(n)
            .ok_or_else(|| Error::EvalError("Integer overflow in subtraction".into()))?;
    }

    Ok(result)
}

fn builtin_mul(first: NumberType, rest: NumIter<'_>) -> Result<NumberType, Error> {
    let mut product = first;
    for n in rest {
        product = product
            .checked_mul(n)
            .ok_or_else(|| Error::EvalError("Integer overflow in multiplication".into()))?;
    }
    Ok(product)
}

fn builtin_div(dividend: NumberType, divisor: NumberType) -> Result<NumberType, Error> {
    if divisor == 0 {
        return Err(Error::EvalError("division by zero".into()));
    }
    dividend
        .checked_div(divisor)
        .ok_or_else(|| Error::EvalError("Integer overflow in division".into()))
}

fn builtin_mod(dividend: NumberType, divisor: NumberType) -> Result<NumberType, Error> {
    if divisor == 0 {
        return Err(Error::EvalError("modulo by zero".into()));
    }
    dividend
        .checked_rem(divisor)
        .ok_or_else(|| Error::EvalError("Integer overflow in modulo".into()))
}

fn builtin_not(b: bool) -> bool {
    !b
}

fn builtin_list(args: ValueIter<'_>) -> Value {
    Value::list(args.cloned().collect::<Vec<_>>())
}

/// The head keeps its brand; a branded tail list is extended as a plain list
fn builtin_cons(head: Value, tail: Value) -> Result<Value, Error> {
    if !tail.is_list() {
        return Err(argument_error("list", &tail, 1));
    }
    Ok(Value::cons(head, tail.into_untagged()))
}

fn builtin_gen(iterator: Value, state: Value) -> Result<Value, Error> {
    if !iterator.untagged().is_callable() {
        return Err(argument_error("func", &iterator, 0));
    }
    Ok(Value::Generator(Rc::new(Generator::new(iterator, state))))
}

fn builtin_str(args: ValueIter<'_>) -> String {
    args.map(ToString::to_string).collect()
}

fn builtin_error(args: ValueIter<'_>) -> Result<Value, Error> {
    let parts: Vec<String> = args.map(ToString::to_string).collect();

    let message = if parts.is_empty() {
        "Error".to_string()
    } else {
        parts.join(" ")
    };

    Err(Error::EvalError(message))
}

//
// Intrinsics
//

/// Only list arguments are accepted
fn expect_list(args: &[Value], position: usize) -> Result<&Value, Error> {
    match args.get(position) {
        Some(value) if value.is_list() => Ok(value),
        Some(other) => Err(argument_error("list", other, position)),
        None => Err(Error::arity_error(position + 1, args.len())),
    }
}

fn intrinsic_head(interp: &mut Interpreter, args: Vec<Value>) -> Result<Value, Error> {
    generator::head(expect_list(&args, 0)?, interp)
}

fn intrinsic_tail(interp: &mut Interpreter, args: Vec<Value>) -> Result<Value, Error> {
    generator::tail(expect_list(&args, 0)?, interp)
}

fn intrinsic_is_empty(interp: &mut Interpreter, args: Vec<Value>) -> Result<Value, Error> {
    generator::is_empty(expect_list(&args, 0)?, interp).map(Value::Bool)
}

/// Structural equality; lazy lists are forced as far as the comparison needs
fn values_equal(left: &Value, right: &Value, interp: &mut Interpreter) -> Result<bool, Error> {
    if !(left.is_list() && right.is_list()) {
        return Ok(left == right);
    }
    let mut left = left.clone();
    let mut right = right.clone();
    loop {
        match (uncons(&left, interp, "=")?, uncons(&right, interp, "=")?) {
            (None, None) => return Ok(true),
            (Some((lhead, ltail)), Some((rhead, rtail))) => {
                if !values_equal(&lhead, &rhead, interp)? {
                    return Ok(false);
                }
                left = ltail;
                right = rtail;
            }
            _ => return Ok(false),
        }
    }
}

fn intrinsic_equal(interp: &mut Interpreter, args: Vec<Value>) -> Result<Value, Error> {
    for pair in args.windows(2) {
        if !values_equal(&pair[0], &pair[1], interp)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

/// Strings concatenate into a string; lists into a list whose last part is
/// shared, so a lazy final argument stays lazy.
fn intrinsic_concat(interp: &mut Interpreter, args: Vec<Value>) -> Result<Value, Error> {
    if !args.is_empty() && args.iter().all(|arg| matches!(arg.untagged(), Value::Str(_))) {
        return Ok(Value::Str(args.iter().map(ToString::to_string).collect()));
    }
    for (position, arg) in args.iter().enumerate() {
        if !arg.is_list() {
            return Err(argument_error("list", arg, position));
        }
    }
    let Some((last, init)) = args.split_last() else {
        return Ok(Value::Nil);
    };
    let mut items = Vec::new();
    for arg in init {
        items.extend(force_all(arg, interp, "concat")?);
    }
    Ok(items
        .into_iter()
        .rev()
        .fold(last.clone().into_untagged(), |tail, head| Value::cons(head, tail)))
}

/// Lists are forced before printing so their full contents show
fn intrinsic_print(interp: &mut Interpreter, args: Vec<Value>) -> Result<Value, Error> {
    for arg in &args {
        if arg.is_list() {
            force_all(arg, interp, "print")?;
        }
    }
    let line = args
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    interp.write_line(&line)?;
    Ok(Value::Nil)
}

fn intrinsic_open(interp: &mut Interpreter, args: Vec<Value>) -> Result<Value, Error> {
    match args.as_slice() {
        [arg] => match arg.untagged() {
            Value::Str(path) => interp.open_file(path),
            other => Err(argument_error("str", other, 0)),
        },
        _ => Err(Error::arity_error(1, args.len())),
    }
}

/// Iterator behind the lazy list returned by `open`
fn intrinsic_read_char(interp: &mut Interpreter, args: Vec<Value>) -> Result<Value, Error> {
    match args.as_slice() {
        [Value::Int(handle)] => interp.read_char(*handle),
        [other] => Err(argument_error("int", other, 0)),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

/// Name of the iterator function used by file streams
pub(crate) const READ_CHAR: &str = "%read-char";

/// Global registry of all built-in operations.
///
/// The registry is a single contiguous collection of `BuiltinOp` values
/// for ease of auditing; typed implementations are wired through the same
/// adapter layer used for host-registered builtins.
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    fn builtin_fixed<Args, F>(f: F) -> Arc<OperationFn>
    where
        F: IntoOperation<Args>,
    {
        <F as IntoOperation<Args>>::into_operation(f)
    }

    fn builtin_variadic<Args, F>(f: F) -> Arc<OperationFn>
    where
        F: IntoVariadicOperation<Args>,
    {
        <F as IntoVariadicOperation<Args>>::into_variadic_operation(f)
    }

    let int = Type::int;
    let a = || Type::var("a");
    let arithmetic = || Signature::variadic(vec![int()], int(), int());
    let comparison = || Signature::variadic(vec![int()], int(), Type::bool());

    vec![
        // Arithmetic operations
        BuiltinOp {
            id: "+",
            op_kind: OpKind::Function(builtin_variadic::<(NumIter<'static>,), _>(builtin_add)),
            arity: Arity::Any,
            pure: true,
            signature: Signature::variadic(vec![], int(), int()),
        },
        BuiltinOp {
            id: "-",
            op_kind: OpKind::Function(builtin_variadic::<(NumberType, NumIter<'static>), _>(
                builtin_sub,
            )),
            arity: Arity::AtLeast(1),
            pure: true,
            signature: arithmetic(),
        },
        BuiltinOp {
            id: "*",
            op_kind: OpKind::Function(builtin_variadic::<(NumberType, NumIter<'static>), _>(
                builtin_mul,
            )),
            arity: Arity::AtLeast(1),
            pure: true,
            signature: arithmetic(),
        },
        BuiltinOp {
            id: "/",
            op_kind: OpKind::Function(builtin_fixed::<(NumberType, NumberType), _>(builtin_div)),
            arity: Arity::Exact(2),
            pure: true,
            signature: Signature::fixed(vec![int(), int()], int()),
        },
        BuiltinOp {
            id: "%",
            op_kind: OpKind::Function(builtin_fixed::<(NumberType, NumberType), _>(builtin_mod)),
            arity: Arity::Exact(2),
            pure: true,
            signature: Signature::fixed(vec![int(), int()], int()),
        },
        // Comparison operations
        BuiltinOp {
            id: "<",
            op_kind: OpKind::Function(builtin_variadic::<(NumberType, NumIter<'static>), _>(
                builtin_lt,
            )),
            arity: Arity::AtLeast(2),
            pure: true,
            signature: comparison(),
        },
        BuiltinOp {
            id: ">",
            op_kind: OpKind::Function(builtin_variadic::<(NumberType, NumIter<'static>), _>(
                builtin_gt,
            )),
            arity: Arity::AtLeast(2),
            pure: true,
            signature: comparison(),
        },
        BuiltinOp {
            id: "<=",
            op_kind: OpKind::Function(builtin_variadic::<(NumberType, NumIter<'static>), _>(
                builtin_le,
            )),
            arity: Arity::AtLeast(2),
            pure: true,
            signature: comparison(),
        },
        BuiltinOp {
            id: ">=",
            op_kind: OpKind::Function(builtin_variadic::<(NumberType, NumIter<'static>), _>(
                builtin_ge,
            )),
            arity: Arity::AtLeast(2),
            pure: true,
            signature: comparison(),
        },
        BuiltinOp {
            id: "=",
            op_kind: OpKind::Intrinsic(intrinsic_equal),
            arity: Arity::AtLeast(2),
            pure: true,
            signature: Signature::variadic(vec![Type::any()], Type::any(), Type::bool()),
        },
        // Logic
        BuiltinOp {
            id: "not",
            op_kind: OpKind::Function(builtin_fixed::<(bool,), _>(builtin_not)),
            arity: Arity::Exact(1),
            pure: true,
            signature: Signature::fixed(vec![Type::bool()], Type::bool()),
        },
        // Lists
        BuiltinOp {
            id: "list",
            op_kind: OpKind::Function(builtin_variadic::<(ValueIter<'static>,), _>(builtin_list)),
            arity: Arity::Any,
            pure: true,
            signature: Signature::variadic(vec![], Type::any(), Type::list_any()),
        },
        BuiltinOp {
            id: "cons",
            op_kind: OpKind::Function(builtin_fixed::<(Value, Value), _>(builtin_cons)),
            arity: Arity::Exact(2),
            pure: true,
            signature: Signature::fixed(vec![Type::any(), Type::list_any()], Type::list_any()),
        },
        BuiltinOp {
            id: "head",
            op_kind: OpKind::Intrinsic(intrinsic_head),
            arity: Arity::Exact(1),
            pure: true,
            signature: Signature::fixed(vec![Type::list(a())], a()),
        },
        BuiltinOp {
            id: "tail",
            op_kind: OpKind::Intrinsic(intrinsic_tail),
            arity: Arity::Exact(1),
            pure: true,
            signature: Signature::fixed(vec![Type::list(a())], Type::list(a())),
        },
        BuiltinOp {
            id: "empty?",
            op_kind: OpKind::Intrinsic(intrinsic_is_empty),
            arity: Arity::Exact(1),
            pure: true,
            signature: Signature::fixed(vec![Type::list_any()], Type::bool()),
        },
        BuiltinOp {
            id: "gen",
            op_kind: OpKind::Function(builtin_fixed::<(Value, Value), _>(builtin_gen)),
            arity: Arity::Exact(2),
            pure: true,
            signature: Signature::fixed(vec![Type::func(), Type::any()], Type::list_any()),
        },
        BuiltinOp {
            id: "concat",
            op_kind: OpKind::Intrinsic(intrinsic_concat),
            arity: Arity::Any,
            pure: true,
            signature: Signature::variadic(vec![], Type::any(), Type::any()),
        },
        // Strings and errors
        BuiltinOp {
            id: "str",
            op_kind: OpKind::Function(builtin_variadic::<(ValueIter<'static>,), _>(builtin_str)),
            arity: Arity::Any,
            pure: true,
            signature: Signature::variadic(vec![], Type::any(), Type::str()),
        },
        BuiltinOp {
            id: "error",
            op_kind: OpKind::Function(builtin_variadic::<(ValueIter<'static>,), _>(builtin_error)),
            arity: Arity::Any,
            pure: true,
            signature: Signature::variadic(vec![], Type::any(), Type::any()),
        },
        // I/O
        BuiltinOp {
            id: "print",
            op_kind: OpKind::Intrinsic(intrinsic_print),
            arity: Arity::Any,
            pure: false,
            signature: Signature::variadic(vec![], Type::any(), Type::list_any()),
        },
        BuiltinOp {
            id: "open",
            op_kind: OpKind::Intrinsic(intrinsic_open),
            arity: Arity::Exact(1),
            pure: false,
            signature: Signature::fixed(vec![Type::str()], Type::list(Type::str())),
        },
        BuiltinOp {
            id: READ_CHAR,
            op_kind: OpKind::Intrinsic(intrinsic_read_char),
            arity: Arity::Exact(1),
            pure: false,
            signature: Signature::fixed(vec![int()], Type::list_any()),
        },
    ]
});

/// Lazy static map from id to BuiltinOp (private - use find_op)
static BUILTIN_BY_ID: LazyLock<HashMap<&'static str, &'static BuiltinOp>> = LazyLock::new(|| {
    let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
    ops.iter().map(|op| (op.id, op)).collect()
});

/// Get all builtin operations
pub fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Find a builtin operation by its identifier
pub fn find_op(id: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_BY_ID.get(id).copied()
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::program::Program;
    use crate::value::val;

    /// Micro-helper for success cases in comprehensive tests
    fn success<T: Into<Value>>(value: T) -> Result<Value, String> {
        Ok(val(value))
    }

    /// Invoke a builtin through the registry the way the evaluator does:
    /// arity first, then the erased implementation.
    fn call_builtin(name: &str, args: &[Value]) -> Result<Value, Error> {
        let op = find_op(name).unwrap();
        op.validate_arity(args.len())?;
        let mut interp = Interpreter::new(Program::default());
        op.call(&mut interp, args.to_vec())
    }

    #[test]
    fn test_builtin_ops_registry() {
        let not_op = find_op("not").unwrap();
        assert_eq!(not_op.arity, Arity::Exact(1));
        assert!(matches!(not_op.op_kind, OpKind::Function(_)));
        assert!(not_op.pure);

        let add_op = find_op("+").unwrap();
        assert_eq!(add_op.arity, Arity::Any);
        if let OpKind::Function(func) = &add_op.op_kind {
            assert_eq!(func(vec![val(1), val(2)]).unwrap(), val(3));
        } else {
            panic!("Expected Function variant");
        }

        assert!(matches!(find_op("head").unwrap().op_kind, OpKind::Intrinsic(_)));
        assert!(!find_op("print").unwrap().pure);
        assert!(!find_op("open").unwrap().pure);
        assert!(find_op("unknown").is_none());

        // Every registered id resolves back to its own entry
        for op in get_builtin_ops() {
            assert!(std::ptr::eq(find_op(op.id).unwrap(), op), "{}", op.id);
        }
    }

    #[test]
    fn test_arity_validation() {
        assert!(Arity::Exact(2).validate(2).is_ok());
        assert_eq!(Arity::Exact(2).validate(3), Err(Error::arity_error(2, 3)));
        assert!(Arity::AtLeast(1).validate(5).is_ok());
        assert_eq!(Arity::AtLeast(2).validate(1), Err(Error::arity_error(2, 1)));
        assert!(Arity::Any.validate(0).is_ok());
    }

    #[test]
    fn test_builtin_cases() {
        let cast = |op: &str, expected: &str, found: &str, position: usize| {
            Err(Error::Cast {
                context: op.into(),
                expected: expected.into(),
                found: found.into(),
                position,
            }
            .to_string())
        };
        let cases: Vec<(&str, Vec<Value>, Result<Value, String>)> = vec![
            // Arithmetic
            ("+", vec![], success(0)),
            ("+", vec![val(1), val(2), val(3)], success(6)),
            ("+", vec![val(1), val("2")], cast("+", "int", "\"2\"", 1)),
            ("+", vec![val(NumberType::MAX), val(1)], Err("EvaluationError: Integer overflow in addition".into())),
            ("-", vec![val(5)], success(-5)),
            ("-", vec![val(10), val(3), val(2)], success(5)),
            ("-", vec![val(NumberType::MIN)], Err("EvaluationError: Integer overflow in negation".into())),
            ("*", vec![val(2), val(3), val(4)], success(24)),
            ("/", vec![val(7), val(2)], success(3)),
            ("/", vec![val(7), val(0)], Err("EvaluationError: division by zero".into())),
            ("%", vec![val(7), val(3)], success(1)),
            ("%", vec![val(7), val(0)], Err("EvaluationError: modulo by zero".into())),
            ("/", vec![val(1)], Err("ArityError: function expected 2 arguments but got 1".into())),
            // Comparison
            ("<", vec![val(1), val(2), val(3)], success(true)),
            ("<", vec![val(1), val(3), val(2)], success(false)),
            (">=", vec![val(3), val(3), val(1)], success(true)),
            ("<", vec![val(1)], Err("ArityError: function expected 2 arguments but got 1".into())),
            ("<", vec![val(1), val(true)], cast("<", "int", "true", 1)),
            ("=", vec![val(1), val(1), val(1)], success(true)),
            ("=", vec![val("a"), val("b")], success(false)),
            ("=", vec![val([1, 2]), val([1, 2])], success(true)),
            ("=", vec![val(1), val("1")], success(false)),
            // Logic
            ("not", vec![val(true)], success(false)),
            ("not", vec![val(0)], cast("not", "bool", "0", 0)),
            // Lists
            ("list", vec![], Ok(Value::Nil)),
            ("list", vec![val(1), val("a")], Ok(val(vec![val(1), val("a")]))),
            ("cons", vec![val(0), val([1, 2])], success([0, 1, 2])),
            ("cons", vec![val(0), val(1)], cast("cons", "list", "1", 1)),
            ("head", vec![val([1, 2])], success(1)),
            ("head", vec![Value::Nil], Err("EvaluationError: empty list has no head".into())),
            ("head", vec![val(3)], cast("head", "list", "3", 0)),
            ("tail", vec![val([1, 2])], success([2])),
            ("tail", vec![Value::Nil], Ok(Value::Nil)),
            ("empty?", vec![Value::Nil], success(true)),
            ("empty?", vec![val([1])], success(false)),
            ("gen", vec![val(1), val(2)], cast("gen", "func", "1", 0)),
            ("concat", vec![val("ab"), val("cd")], success("abcd")),
            ("concat", vec![val([1]), Value::Nil, val([2, 3])], success([1, 2, 3])),
            ("concat", vec![], Ok(Value::Nil)),
            ("concat", vec![val([1]), val("x")], cast("concat", "list", "\"x\"", 1)),
            // Strings and errors
            ("str", vec![val("n="), val(1), val([1, 2])], success("n=1(1 2)")),
            ("error", vec![val("bad"), val(42)], Err("EvaluationError: bad 42".into())),
        ];

        for (name, args, expected) in cases {
            let result = call_builtin(name, &args).map_err(|e| e.to_string());
            assert_eq!(result, expected, "({name} {args:?})");
        }
    }

    #[test]
    fn test_value_builtins_keep_user_type_brands() {
        let mut types = crate::types::TypeRegistry::new();
        types.declare_type("meters", &Type::int()).unwrap();
        let meters = || Value::tagged("meters", val(5));
        let head_type = |list: Value| {
            let head = call_builtin("head", &[list]).unwrap();
            head.type_of(&types)
        };

        let listed = call_builtin("list", &[meters(), val(1)]).unwrap();
        assert_eq!(head_type(listed), Type::named("meters"));
        let consed = call_builtin("cons", &[meters(), Value::Nil]).unwrap();
        assert_eq!(head_type(consed), Type::named("meters"));
        let joined = call_builtin("concat", &[val([meters()]), val([1])]).unwrap();
        assert_eq!(head_type(joined), Type::named("meters"));

        // Typed builtins still see the underlying value
        assert_eq!(call_builtin("+", &[meters(), val(1)]).unwrap(), val(6));
        assert_eq!(
            call_builtin("concat", &[Value::tagged("name", val("a")), val("b")]).unwrap(),
            val("ab")
        );
    }

    #[test]
    fn test_signatures() {
        let head = &find_op("head").unwrap().signature;
        assert_eq!(head.param_at(0), Some(&Type::list(Type::var("a"))));
        assert_eq!(head.param_at(1), None);

        let add = &find_op("+").unwrap().signature;
        assert_eq!(add.param_at(7), Some(&Type::int()));
        assert_eq!(add.ret, Type::int());
    }
}
