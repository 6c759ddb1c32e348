//! The evaluation loop.
//!
//! [`Interpreter::eval`] is a trampoline: the expression in tail position
//! (the chosen branch of an `if`, the last expression of a `do`, the body of
//! a called clause) replaces the loop's current expression and environment
//! instead of being evaluated by a nested call. Only argument evaluation and
//! other non-tail positions recurse, and that recursion is bounded by
//! [`MAX_EVAL_DEPTH`].

pub mod intooperation;

use crate::Error;
use crate::MAX_EVAL_DEPTH;
use crate::ast::NumberType;
use crate::builtinops::{Arity, find_op, with_operation_context};
use crate::dispatch;
use crate::environment::{Environment, Resource};
use crate::generator::{Generator, settle};
use crate::memo::memo_key;
use crate::program::{Expr, FunctionDef, ModuleLoader, Pattern, Program};
use crate::types::{Type, TypeBindings};
use crate::value::{Lambda, Value};
use intooperation::{IntoOperation, IntoVariadicOperation, OperationFn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

pub use intooperation::{NumIter, StringIter, ValueIter};

/// Builtin registered by the host program
struct NativeOp {
    func: Arc<OperationFn>,
    arity: Arity,
}

/// A memoized call waiting for its result
struct MemoSlot {
    def: Rc<FunctionDef>,
    key: String,
}

/// A clause body ready to run in its parameter scope
struct Frame {
    function: String,
    body: Rc<Expr>,
    env: Environment,
    memo: Option<MemoSlot>,
}

/// Outcome of resolving a call
enum Step {
    Done(Value),
    Enter(Frame),
}

/// State of one trampoline run
struct Continuation {
    expr: Rc<Expr>,
    env: Environment,
    /// Function whose body is being evaluated, for error context
    function: Option<String>,
    /// Memoized frames entered by tail calls; all share the final result
    memo: Vec<MemoSlot>,
}

impl Continuation {
    fn new(expr: Rc<Expr>, env: Environment) -> Self {
        Continuation {
            expr,
            env,
            function: None,
            memo: Vec::new(),
        }
    }

    fn enter(&mut self, frame: Frame) {
        self.expr = frame.body;
        self.env = frame.env;
        self.function = Some(frame.function);
        self.memo.extend(frame.memo);
    }
}

impl From<Frame> for Continuation {
    fn from(frame: Frame) -> Self {
        let mut continuation = Continuation::new(Rc::clone(&frame.body), frame.env.clone());
        continuation.enter(frame);
        continuation
    }
}

/// Runs a loaded [`Program`]
pub struct Interpreter {
    program: Program,
    globals: Environment,
    output: Box<dyn Write>,
    depth: usize,
    /// Resources opened but not yet claimed by a `set'` binding
    unclaimed: Vec<Rc<dyn Resource>>,
    files: Vec<Rc<FileStream>>,
    natives: HashMap<String, NativeOp>,
}

impl Interpreter {
    pub fn new(program: Program) -> Self {
        Interpreter {
            program,
            globals: Environment::new(),
            output: Box::new(std::io::stdout()),
            depth: 0,
            unclaimed: Vec::new(),
            files: Vec::new(),
            natives: HashMap::new(),
        }
    }

    /// Send `print` output somewhere other than stdout
    pub fn with_output(mut self, output: impl Write + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn globals(&self) -> &Environment {
        &self.globals
    }

    /// Register a strongly-typed Rust function as a builtin operation using
    /// automatic argument extraction and result conversion.
    ///
    /// ```rust,ignore
    /// fn add(a: i64, b: i64) -> i64 { a + b }
    /// interpreter.register_builtin_operation::<_, (i64, i64)>("add", add);
    /// ```
    ///
    /// Supported parameter types: `i64`, `bool`, `&str` and `Value`.
    /// Supported return types: `Value`, `i64`, `bool`, `String`, `&str`, or a
    /// `Result` of one of them.
    ///
    /// Arity is enforced automatically; an argument of the wrong type fails
    /// with the usual `<name>: Expected all <type> arguments, ...` error.
    pub fn register_builtin_operation<F, Args>(&mut self, name: &str, func: F)
    where
        F: IntoOperation<Args> + 'static,
    {
        let func = func.into_operation();
        self.natives.insert(
            name.to_owned(),
            NativeOp {
                func,
                arity: Arity::Any,
            },
        );
    }

    /// Register a builtin whose last Rust parameter is a rest iterator
    /// (`ValueIter<'_>`, `NumIter<'_>` or `StringIter<'_>`).
    ///
    /// The provided [`Arity`] is validated before the call, since the
    /// minimum argument count of a variadic operation is not always
    /// derivable from its Rust signature.
    pub fn register_variadic_builtin_operation<F, Args>(
        &mut self,
        name: &str,
        arity: Arity,
        func: F,
    ) where
        F: IntoVariadicOperation<Args> + 'static,
    {
        let func = func.into_variadic_operation();
        self.natives
            .insert(name.to_owned(), NativeOp { func, arity });
    }

    /// Run every top-level expression of the program, then release all
    /// remaining resources. Returns the value of the last expression.
    pub fn run(&mut self) -> Result<Value, Error> {
        let statements = self.program.statements.clone();
        let outcome = self.eval_statements(&statements);
        let outcome = self.release_unclaimed(outcome);
        let outcome = self.globals.exit(outcome);
        self.flush_output()?;
        outcome
    }

    /// Load more source into the running program and evaluate its
    /// top-level expressions
    pub fn eval_source(
        &mut self,
        source: &str,
        loader: &dyn ModuleLoader,
    ) -> Result<Value, Error> {
        let statements = self.program.extend(source, loader)?;
        let outcome = self.eval_statements(&statements);
        let outcome = self.release_unclaimed(outcome);
        self.flush_output()?;
        outcome
    }

    fn eval_statements(&mut self, statements: &[Rc<Expr>]) -> Result<Value, Error> {
        let globals = self.globals.clone();
        let mut last = Value::Nil;
        for statement in statements {
            last = self.eval(statement, &globals)?;
        }
        Ok(last)
    }

    /// Evaluate an expression in an environment
    pub fn eval(&mut self, expr: &Rc<Expr>, env: &Environment) -> Result<Value, Error> {
        self.trampoline(Continuation::new(Rc::clone(expr), env.clone()))
    }

    /// Call a function value with already evaluated arguments
    pub fn apply(&mut self, function: &Value, args: Vec<Value>) -> Result<Value, Error> {
        match self.prepare_call(function.clone(), args)? {
            Step::Done(value) => Ok(value),
            Step::Enter(frame) => self.trampoline(Continuation::from(frame)),
        }
    }

    fn trampoline(&mut self, mut state: Continuation) -> Result<Value, Error> {
        if self.depth >= MAX_EVAL_DEPTH {
            return Err(Error::EvalError(format!(
                "Evaluation depth limit exceeded (max: {MAX_EVAL_DEPTH})"
            )));
        }
        self.depth += 1;
        let result = self.run_loop(&mut state);
        self.depth -= 1;

        match result {
            Ok(value) => {
                for slot in state.memo {
                    slot.def.memo.insert(slot.key, value.clone());
                }
                Ok(value)
            }
            Err(err) => Err(match state.function {
                Some(function) => err.in_call(function),
                None => err,
            }),
        }
    }

    fn run_loop(&mut self, state: &mut Continuation) -> Result<Value, Error> {
        loop {
            let expr = Rc::clone(&state.expr);
            match expr.as_ref() {
                Expr::Literal(value) => return Ok(value.clone()),
                Expr::Var(name) => return self.resolve(name, &state.env),
                Expr::If(condition, then, otherwise) => {
                    let condition = self.eval(condition, &state.env)?;
                    state.expr = match condition.untagged() {
                        Value::Bool(true) => Rc::clone(then),
                        Value::Bool(false) => Rc::clone(otherwise),
                        other => {
                            return Err(Error::TypeError(format!(
                                "if: condition must be a boolean, got {}",
                                other.repr()
                            )));
                        }
                    };
                }
                Expr::Do { body, cast } => {
                    let scope = state.env.child();
                    let Some((last, init)) = body.split_last() else {
                        return Ok(Value::Nil);
                    };
                    for item in init {
                        if let Err(err) = self.eval(item, &scope) {
                            return scope.exit(Err(err));
                        }
                    }
                    let claims = matches!(last.as_ref(), Expr::Set { scoped: true, .. });
                    if cast.is_none() && !claims && !scope.holds_resources() {
                        state.env = scope;
                        state.expr = Rc::clone(last);
                        continue;
                    }
                    let outcome = self.eval(last, &scope).and_then(|value| match cast {
                        Some(ty) => self.check_type(value, ty, "do"),
                        None => Ok(value),
                    });
                    return scope.exit(outcome);
                }
                Expr::Set {
                    name,
                    ty,
                    value,
                    scoped,
                } => return self.eval_set(name, ty.as_ref(), value, *scoped, &state.env),
                Expr::Lambda(def) => {
                    return Ok(Value::Lambda(Rc::new(Lambda::new(
                        Rc::clone(def),
                        state.env.clone(),
                    ))));
                }
                Expr::And(operands) => return self.eval_logical("and", operands, false, &state.env),
                Expr::Or(operands) => return self.eval_logical("or", operands, true, &state.env),
                Expr::Call { callee, args } => {
                    let function = self.eval(callee, &state.env)?;
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg, &state.env)?);
                    }
                    match self.prepare_call(function, values)? {
                        Step::Done(value) => return Ok(value),
                        Step::Enter(frame) => {
                            trace!(function = %frame.function, depth = self.depth, "tail call");
                            state.enter(frame);
                        }
                    }
                }
            }
        }
    }

    /// Local bindings first, then global function, type and builtin names
    fn resolve(&self, name: &str, env: &Environment) -> Result<Value, Error> {
        if let Some(value) = env.get(name) {
            return Ok(value);
        }
        if self.is_global_function(name) {
            return Ok(Value::FuncRef(name.to_owned()));
        }
        Err(Error::UnboundVariable(name.to_owned()))
    }

    /// True if `name` refers to a callable without a local binding
    pub fn is_global_function(&self, name: &str) -> bool {
        self.program.functions.contains_key(name)
            || self.program.types.is_user_type(name)
            || self.natives.contains_key(name)
            || find_op(name).is_some()
    }

    fn eval_logical(
        &mut self,
        form: &str,
        operands: &[Rc<Expr>],
        short_circuit_on: bool,
        env: &Environment,
    ) -> Result<Value, Error> {
        for operand in operands {
            match self.eval(operand, env)?.untagged() {
                Value::Bool(b) if *b == short_circuit_on => return Ok(Value::Bool(*b)),
                Value::Bool(_) => {}
                other => {
                    return Err(Error::TypeError(format!(
                        "{form}: expected boolean, got {}",
                        other.repr()
                    )));
                }
            }
        }
        Ok(Value::Bool(!short_circuit_on))
    }

    fn eval_set(
        &mut self,
        name: &str,
        ty: Option<&Type>,
        value: &Rc<Expr>,
        scoped: bool,
        env: &Environment,
    ) -> Result<Value, Error> {
        let mark = self.unclaimed.len();
        let mut value = self.eval(value, env)?;
        if let Some(ty) = ty {
            value = self.check_type(value, ty, "set")?;
        }
        if scoped {
            let claimed = self.unclaimed.split_off(mark.min(self.unclaimed.len()));
            for resource in claimed {
                env.acquire(resource);
            }
        }
        env.bind(name, value.clone())?;
        Ok(value)
    }

    /// The value itself if it satisfies `ty`
    fn check_type(&self, value: Value, ty: &Type, context: &str) -> Result<Value, Error> {
        if value.conforms_to(ty, &self.program.types, &mut TypeBindings::default()) {
            Ok(value)
        } else {
            Err(Error::Cast {
                context: context.to_owned(),
                expected: ty.to_string(),
                found: value.repr().to_string(),
                position: 0,
            })
        }
    }

    fn prepare_call(&mut self, function: Value, args: Vec<Value>) -> Result<Step, Error> {
        match function.into_untagged() {
            Value::Lambda(lambda) => self.enter_lambda(&lambda, args),
            Value::FuncRef(name) => self.call_named(name, args),
            other => Err(Error::EvalError(format!(
                "Cannot apply non-function: {}",
                other.repr()
            ))),
        }
    }

    fn enter_lambda(&mut self, lambda: &Lambda, mut args: Vec<Value>) -> Result<Step, Error> {
        let clause = &lambda.def.clause;
        if clause.params.len() != args.len() {
            return Err(Error::arity_error(clause.params.len(), args.len()));
        }
        for (position, pattern) in clause.params.iter().enumerate() {
            if matches!(pattern, Pattern::Literal(_)) {
                let arg = std::mem::replace(&mut args[position], Value::Nil);
                args[position] = settle(arg, self)?;
            }
        }
        dispatch::select(
            "lambda",
            std::slice::from_ref(clause),
            &args,
            &self.program.types,
        )?;
        let scope = lambda.env.child();
        bind_params(&scope, &clause.params, args)?;
        Ok(Step::Enter(Frame {
            function: "lambda".to_owned(),
            body: Rc::clone(&clause.body),
            env: scope,
            memo: None,
        }))
    }

    /// User functions, then type constructors, host builtins and builtins
    fn call_named(&mut self, name: String, mut args: Vec<Value>) -> Result<Step, Error> {
        if let Some(def) = self.program.functions.get(&name).cloned() {
            for position in 0..args.len() {
                if def.has_literal_at(position) {
                    let arg = std::mem::replace(&mut args[position], Value::Nil);
                    args[position] = settle(arg, self)?;
                }
            }
            let index = dispatch::select(&name, &def.clauses, &args, &self.program.types)?.index;
            let clause = &def.clauses[index];

            let memo = if clause.memoize {
                let key = memo_key(&args, self)?;
                if let Some(value) = def.memo.get(&key) {
                    debug!(function = %name, "memo hit");
                    return Ok(Step::Done(value));
                }
                debug!(function = %name, "memo miss");
                Some(MemoSlot {
                    def: Rc::clone(&def),
                    key,
                })
            } else {
                None
            };

            let scope = self.globals.child();
            bind_params(&scope, &clause.params, args)?;
            return Ok(Step::Enter(Frame {
                function: name,
                body: Rc::clone(&clause.body),
                env: scope,
                memo,
            }));
        }

        if let Some(parent) = self.program.types.parent_of(&name).cloned() {
            return self.construct(&name, &parent, args).map(Step::Done);
        }

        if let Some(native) = self.natives.get(&name) {
            native.arity.validate(args.len())?;
            let func = Arc::clone(&native.func);
            return func(args)
                .map_err(|err| with_operation_context(err, &name))
                .map(Step::Done);
        }
        if let Some(op) = find_op(&name) {
            op.validate_arity(args.len())?;
            return op.call(self, args).map(Step::Done);
        }
        Err(Error::UnboundVariable(name))
    }

    /// Brand a value with a user type after checking it against the parent
    fn construct(&self, name: &str, parent: &Type, args: Vec<Value>) -> Result<Value, Error> {
        let [value] = <[Value; 1]>::try_from(args)
            .map_err(|args| Error::arity_error(1, args.len()))?;
        let value = self.check_type(value, parent, name)?;
        Ok(Value::tagged(name, value))
    }

    /// Release resources nobody claimed; a release failure only surfaces
    /// if the run itself succeeded
    fn release_unclaimed(&mut self, outcome: Result<Value, Error>) -> Result<Value, Error> {
        if self.unclaimed.is_empty() {
            return outcome;
        }
        let holder = Environment::new();
        for resource in self.unclaimed.drain(..) {
            holder.acquire(resource);
        }
        holder.exit(outcome)
    }

    fn flush_output(&mut self) -> Result<(), Error> {
        self.output
            .flush()
            .map_err(|e| Error::EvalError(format!("cannot write output: {e}")))
    }

    pub(crate) fn write_line(&mut self, line: &str) -> Result<(), Error> {
        writeln!(self.output, "{line}")
            .map_err(|e| Error::EvalError(format!("cannot write output: {e}")))
    }

    /// Open a file as a lazy list of one-character strings
    pub(crate) fn open_file(&mut self, path: &str) -> Result<Value, Error> {
        let file =
            File::open(path).map_err(|e| Error::EvalError(format!("cannot open {path}: {e}")))?;
        let handle = NumberType::try_from(self.files.len())
            .map_err(|_| Error::EvalError("too many open files".into()))?;
        let stream = Rc::new(FileStream {
            path: path.to_owned(),
            reader: RefCell::new(Some(BufReader::new(file))),
        });
        debug!(path, handle, "opened file");
        self.files.push(Rc::clone(&stream));
        self.unclaimed.push(stream);
        Ok(Value::Generator(Rc::new(Generator::new(
            Value::FuncRef(crate::builtinops::READ_CHAR.to_owned()),
            Value::Int(handle),
        ))))
    }

    /// One step of a file stream: `(char handle)` or `'()` at end of file
    pub(crate) fn read_char(&mut self, handle: NumberType) -> Result<Value, Error> {
        let stream = usize::try_from(handle)
            .ok()
            .and_then(|index| self.files.get(index))
            .cloned()
            .ok_or_else(|| Error::EvalError(format!("invalid file handle {handle}")))?;
        Ok(match stream.read_char()? {
            Some(c) => Value::list([Value::Str(c.to_string()), Value::Int(handle)]),
            None => Value::Nil,
        })
    }
}

fn bind_params(scope: &Environment, params: &[Pattern], args: Vec<Value>) -> Result<(), Error> {
    for (pattern, arg) in params.iter().zip(args) {
        if let Some(name) = pattern.binding() {
            scope.bind(name, arg)?;
        }
    }
    Ok(())
}

/// Buffered file read one UTF-8 character at a time
struct FileStream {
    path: String,
    reader: RefCell<Option<BufReader<File>>>,
}

fn utf8_width(first: u8) -> Option<usize> {
    match first {
        0x00..=0x7F => Some(1),
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF7 => Some(4),
        _ => None,
    }
}

impl FileStream {
    fn read_char(&self) -> Result<Option<char>, Error> {
        let mut guard = self.reader.borrow_mut();
        let reader = guard
            .as_mut()
            .ok_or_else(|| Error::EvalError(format!("read from closed file {}", self.path)))?;
        let io_error = |e: std::io::Error| Error::EvalError(format!("cannot read {}: {e}", self.path));
        let invalid = || Error::EvalError(format!("invalid UTF-8 in {}", self.path));

        let Some(&first) = reader.fill_buf().map_err(io_error)?.first() else {
            return Ok(None);
        };
        let width = utf8_width(first).ok_or_else(invalid)?;
        let mut bytes = [0u8; 4];
        reader.read_exact(&mut bytes[..width]).map_err(io_error)?;
        let text = std::str::from_utf8(&bytes[..width]).map_err(|_| invalid())?;
        text.chars().next().map(Some).ok_or_else(invalid)
    }
}

impl Resource for FileStream {
    fn describe(&self) -> String {
        format!("file {}", self.path)
    }

    fn release(&self) -> Result<(), Error> {
        self.reader.borrow_mut().take();
        Ok(())
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::program::MemoryLoader;
    use crate::value::val;

    /// `print` sink the test can read back
    #[derive(Clone, Default)]
    struct SharedOutput(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedOutput {
        fn text(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    fn interpreter() -> Interpreter {
        Interpreter::new(Program::default())
    }

    fn eval_str(interp: &mut Interpreter, source: &str) -> Result<Value, Error> {
        interp.eval_source(source, &MemoryLoader::new())
    }

    /// Test result variants for comprehensive testing
    #[derive(Debug)]
    enum TestResult {
        EvalResult(Value),           // Evaluation should succeed with this value
        SpecificError(&'static str), // Evaluation should fail with error containing this string
        Failure,                     // Evaluation should fail (any error)
    }
    use TestResult::*;

    /// Test environment containing test cases that share state
    struct TestEnvironment(Vec<(&'static str, TestResult)>);

    /// Micro-helper for success cases in comprehensive tests
    fn success<T: Into<Value>>(value: T) -> TestResult {
        EvalResult(val(value))
    }

    /// Execute a single test case with detailed error reporting
    fn execute_test_case(input: &str, expected: &TestResult, interp: &mut Interpreter, test_id: &str) {
        match (eval_str(interp, input), expected) {
            (Ok(actual), EvalResult(expected_val)) => {
                assert!(
                    actual == *expected_val,
                    "{test_id}: '{input}' expected {expected_val:?}, got {actual:?}"
                );
            }
            (Err(_), Failure) => {}
            (Err(e), SpecificError(expected_text)) => {
                let error_msg = format!("{e}");
                assert!(
                    error_msg.contains(expected_text),
                    "{test_id}: '{input}' error should contain '{expected_text}', got: {error_msg}"
                );
            }
            (Ok(actual), Failure) => {
                panic!("{test_id}: '{input}' expected error, got {actual:?}");
            }
            (Ok(actual), SpecificError(expected_text)) => {
                panic!("{test_id}: '{input}' expected error containing '{expected_text}', got {actual:?}");
            }
            (Err(err), EvalResult(expected_val)) => {
                panic!("{test_id}: '{input}' expected {expected_val:?}, got error {err}");
            }
        }
    }

    /// Run tests in isolated interpreters with shared state per environment
    fn run_tests_in_environment(test_environments: Vec<TestEnvironment>) {
        for (env_idx, TestEnvironment(test_cases)) in test_environments.iter().enumerate() {
            let mut interp = interpreter();
            for (test_idx, (input, expected)) in test_cases.iter().enumerate() {
                let test_id = format!("Environment #{} test #{}", env_idx + 1, test_idx + 1);
                execute_test_case(input, expected, &mut interp, &test_id);
            }
        }
    }

    /// Every case in a fresh interpreter
    fn run_comprehensive_tests(test_cases: Vec<(&str, TestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let mut interp = interpreter();
            let test_id = format!("#{}", i + 1);
            execute_test_case(input, expected, &mut interp, &test_id);
        }
    }

    #[test]
    fn test_register_builtin_operation_add() {
        fn add(a: i64, b: i64) -> i64 {
            a + b
        }
        let mut interp = interpreter();
        interp.register_builtin_operation::<_, (i64, i64)>("add2", add);
        assert_eq!(eval_str(&mut interp, "(add2 7 5)").unwrap(), val(12));
        assert_eq!(
            eval_str(&mut interp, "(add2 7 \"5\")").unwrap_err().to_string(),
            "add2: Expected all int arguments, found \"5\" at position 1"
        );
        assert!(interp.is_global_function("add2"));
    }

    #[test]
    fn test_register_builtin_operation_result_builtin() {
        fn safe_div(a: i64, b: i64) -> Result<i64, Error> {
            if b == 0 {
                Err(Error::EvalError("safe-div by zero".into()))
            } else {
                Ok(a / b)
            }
        }

        let mut interp = interpreter();
        interp.register_builtin_operation::<_, (i64, i64)>("safe-div", safe_div);
        assert_eq!(eval_str(&mut interp, "(safe-div 6 3)").unwrap(), val(2));
        let err = eval_str(&mut interp, "(safe-div 1 0)").unwrap_err();
        assert!(err.to_string().contains("safe-div by zero"));
    }

    #[test]
    fn test_register_variadic_builtin_operation_with_explicit_arity() {
        fn join_with(sep: &str, rest: StringIter<'_>) -> String {
            rest.collect::<Vec<_>>().join(sep)
        }

        let mut interp = interpreter();
        interp.register_variadic_builtin_operation::<_, (&str, StringIter<'static>)>(
            "join-with",
            Arity::AtLeast(2),
            join_with,
        );
        assert_eq!(
            eval_str(&mut interp, "(join-with \"-\" \"a\" \"b\" \"c\")").unwrap(),
            val("a-b-c")
        );
        assert!(matches!(
            eval_str(&mut interp, "(join-with \"-\")").unwrap_err(),
            Error::ArityError { expected: 2, got: 1, .. }
        ));
        assert_eq!(
            eval_str(&mut interp, "(join-with \"-\" \"a\" 1)").unwrap_err().to_string(),
            "join-with: Expected all str arguments, found 1 at position 2"
        );
    }

    #[test]
    #[expect(clippy::too_many_lines)] // Comprehensive test coverage is intentionally thorough
    fn test_comprehensive_operations_data_driven() {
        let test_cases = vec![
            // === SELF-EVALUATING FORMS ===
            ("42", success(42)),
            ("-271", success(-271)),
            ("#x1F", success(31)),
            ("#t", success(true)),
            ("false", success(false)),
            ("\"hello\"", success("hello")),
            ("\"with\\\"quotes\"", success("with\"quotes")),
            // === QUOTED DATA ===
            ("'()", EvalResult(Value::Nil)),
            ("'(1 2 3)", success([1, 2, 3])),
            ("'(a b)", success(["a", "b"])),
            ("(quote (1 (2)))", EvalResult(val(vec![val(1), val(vec![2])]))),
            // === ARITHMETIC ===
            ("(+ 1 2 3)", success(6)),
            ("(+)", success(0)),
            ("(- 10)", success(-10)),
            ("(* (+ 1 2) (- 5 2))", success(9)),
            ("(/ 7 2)", success(3)),
            ("(% 7 2)", success(1)),
            ("(/ 1 0)", SpecificError("division by zero")),
            ("(% 1 0)", SpecificError("modulo by zero")),
            ("(+ 9223372036854775807 1)", SpecificError("overflow")),
            ("(+ 1 \"a\")", SpecificError("+: Expected all int arguments, found \"a\" at position 1")),
            // === COMPARISON AND EQUALITY ===
            ("(< 1 2 3)", success(true)),
            ("(> 3 1 2)", success(false)),
            ("(= '(1 2) (list 1 2))", success(true)),
            ("(= \"a\" \"a\" \"b\")", success(false)),
            // === CONDITIONALS ===
            ("(if (< 1 2) \"yes\" \"no\")", success("yes")),
            ("(if #f (/ 1 0) 2)", success(2)),
            ("(if 1 2 3)", SpecificError("if: condition must be a boolean, got 1")),
            ("(and #t #t)", success(true)),
            ("(and #f (/ 1 0))", success(false)),
            ("(or #f #t)", success(true)),
            ("(or #t (/ 1 0))", success(true)),
            ("(and #t 1)", SpecificError("and: expected boolean, got 1")),
            // === DO AND SET ===
            ("(do 1 2 3)", success(3)),
            ("(do (set x 5) (* x x))", success(25)),
            ("(do (set x:int 5) x)", success(5)),
            ("(do (set x:str 5) x)", SpecificError("set: Expected all str arguments, found 5 at position 0")),
            ("(do 5 :int)", success(5)),
            ("(do \"x\" :int)", SpecificError("do: Expected all int arguments, found \"x\" at position 0")),
            ("(do '(1 2) :list[int])", success([1, 2])),
            ("(do '(1 \"a\") :list[int])", SpecificError("do: Expected all list[int] arguments")),
            // === LAMBDAS ===
            ("((lambda (x y) (+ x y)) 1 2)", success(3)),
            ("((lambda (x) x) 1 2)", SpecificError("ArityError")),
            ("((lambda (0) \"zero\") 0)", success("zero")),
            ("((lambda (0) \"zero\") 1)", SpecificError("lambda: no matching function implementation found for [1]")),
            ("((lambda (x:int) x) \"s\")", SpecificError("no matching function implementation")),
            // === ERRORS ===
            ("undefined", SpecificError("Unbound variable: undefined")),
            ("(1 2)", SpecificError("Cannot apply non-function: 1")),
            ("(error \"boom\" 1)", SpecificError("boom 1")),
            ("(head '())", SpecificError("empty list has no head")),
            // === BUILTINS AS VALUES ===
            ("(set plus +)\n(plus 2 3)", success(5)),
            ("(str 1 \"-\" '(1 \"a\"))", success("1-(1 \"a\")")),
        ];

        run_comprehensive_tests(test_cases);
    }

    #[test]
    fn test_multi_clause_functions() {
        run_tests_in_environment(vec![
            TestEnvironment(vec![
                (
                    "(def factorial (0) 1)\n\
                     (def factorial (n:int) :int (* n (factorial (- n 1))))",
                    EvalResult(Value::Nil),
                ),
                ("(factorial 0)", success(1)),
                ("(factorial 10)", success(3_628_800)),
                (
                    "(factorial \"x\")",
                    SpecificError("factorial: no matching function implementation found for [\"x\"]"),
                ),
            ]),
            TestEnvironment(vec![
                (
                    "(def len ('()) 0)\n\
                     (def len (l) (+ 1 (len (tail l))))",
                    EvalResult(Value::Nil),
                ),
                ("(len '(1 2 3))", success(3)),
                ("(len '())", success(0)),
                // A later entry replaces the whole definition
                ("(def len (l) -1)", EvalResult(Value::Nil)),
                ("(len '())", success(-1)),
            ]),
            TestEnvironment(vec![
                // Closures see globals bound after their creation
                ("(set make-adder (lambda (n) (lambda (x) (+ x n))))\n0", success(0)),
                ("((make-adder 2) 3)", success(5)),
                ("(set later (lambda () offset))\n(set offset 10)\n(later)", success(10)),
                // Bindings made inside do stay local to it
                ("(do (set hidden 1) hidden)", success(1)),
                ("hidden", SpecificError("Unbound variable: hidden")),
            ]),
        ]);
    }

    #[test]
    fn test_recursive_lambdas_through_globals() {
        run_tests_in_environment(vec![TestEnvironment(vec![
            (
                "(set fact (lambda (n) (if (= n 0) 1 (* n (fact (- n 1))))))\n0",
                success(0),
            ),
            ("(fact 5)", success(120)),
            (
                "(set is-even (lambda (n) (if (= n 0) #t (is-odd (- n 1)))))\n\
                 (set is-odd (lambda (n) (if (= n 0) #f (is-even (- n 1)))))\n\
                 (is-even 10)",
                success(true),
            ),
            ("(is-odd 7)", success(true)),
        ])]);
    }

    #[test]
    fn test_tail_calls_do_not_grow_the_stack() {
        let mut interp = interpreter();
        let result = eval_str(
            &mut interp,
            "(def count (0 acc) acc)\n\
             (def count (n acc) (count (- n 1) (+ acc 1)))\n\
             (count 100000 0)",
        )
        .unwrap();
        assert_eq!(result, val(100_000));

        // Tail position through if, do and lambdas
        let result = eval_str(
            &mut interp,
            "(set loop (lambda (n) (if (= n 0) \"done\" (do (set m (- n 1)) (loop m)))))\n\
             (loop 50000)",
        )
        .unwrap();
        assert_eq!(result, val("done"));
    }

    #[test]
    fn test_evaluation_depth_limit() {
        // Non-tail recursion is bounded; run on a large stack so the limit,
        // not the host stack, is what stops it.
        let handle = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(|| {
                let mut interp = interpreter();
                let source = "(def deep (0) 42)\n(def deep (n) (+ 1 (deep (- n 1))))";
                eval_str(&mut interp, source).unwrap();
                // Values are not Send, so only text leaves the thread
                let shallow = eval_str(&mut interp, "(deep 10)")
                    .map(|v| v.to_string())
                    .map_err(|e| e.to_string());
                let deep = eval_str(&mut interp, "(deep 100000)")
                    .map(|v| v.to_string())
                    .map_err(|e| e.to_string());
                (shallow, deep)
            })
            .unwrap();
        let (shallow, deep) = handle.join().unwrap();
        assert_eq!(shallow, Ok("52".to_string()));
        assert!(deep.unwrap_err().contains("depth limit exceeded"));
    }

    #[test]
    fn test_error_call_chain() {
        let mut interp = interpreter();
        let err = eval_str(
            &mut interp,
            "(def inner (x) (/ x 0))\n\
             (def outer (x) (+ 1 (inner x)))\n\
             (outer 1)",
        )
        .unwrap_err();
        assert_eq!(err.root(), &Error::EvalError("division by zero".into()));
        assert_eq!(err.call_chain(), vec!["inner", "outer"]);
    }

    #[test]
    fn test_generator_forcing_is_idempotent() {
        let output = SharedOutput::default();
        let mut interp = interpreter().with_output(output.clone());
        let source = "(def step (n) (print \"step\" n) (list (* n 2) (+ n 1)))\n\
                      (set g (gen step 1))\n\
                      (head g)\n\
                      (head g)\n\
                      (head (tail g))\n\
                      (head (tail g))";
        assert_eq!(eval_str(&mut interp, source).unwrap(), val(4));
        assert_eq!(output.text(), "step 1\nstep 2\n");

        // Single-element results reuse the value as the next state
        let result = eval_str(
            &mut interp,
            "(def halve (1) '())\n\
             (def halve (n) (list (/ n 2)))\n\
             (concat (gen halve 16) '())",
        );
        // concat keeps the final list lazy only; earlier lists are forced
        assert_eq!(result.unwrap(), val([8, 4, 2, 1]));
    }

    #[test]
    fn test_generator_edge_cases() {
        run_tests_in_environment(vec![TestEnvironment(vec![
            ("(def none (s) '())\n(set empty (gen none 0))\n(empty? empty)", success(true)),
            ("(head empty)", SpecificError("empty list has no head")),
            ("(tail empty)", EvalResult(Value::Nil)),
            ("(tail 5)", Failure),
            ("(def bad (s) 5)\n(head (gen bad 0))", SpecificError("gen: iterator must return")),
            ("(def nat (n) (list n (+ n 1)))\n(set nats (gen nat 0))\n(head (tail (tail nats)))", success(2)),
            // An exhausted generator is passed as '() to literal patterns
            ("(def size ('()) 0)\n(def size (l) (+ 1 (size (tail l))))\n(def upto (3) '())\n(def upto (n) (list n (+ n 1)))\n(size (gen upto 0))", success(3)),
            ("(= (gen upto 0) '(0 1 2))", success(true)),
        ])]);
    }

    #[test]
    fn test_memoized_side_effects_run_once() {
        let output = SharedOutput::default();
        let mut interp = interpreter().with_output(output.clone());
        let source = "(def' slow-square (n) (print \"computing\" n) (* n n))\n\
                      (+ (slow-square 4) (slow-square 4) (slow-square 5))";
        assert_eq!(eval_str(&mut interp, source).unwrap(), val(57));
        assert_eq!(output.text(), "computing 4\ncomputing 5\n");
        assert_eq!(interp.program().functions["slow-square"].memo.len(), 2);
    }

    #[test]
    fn test_memoized_tail_calls_share_the_result() {
        let mut interp = interpreter();
        let source = "(def' fib (n) (fib-acc n 0 1))\n\
                      (def fib-acc (0 a b) a)\n\
                      (def fib-acc (n a b) (fib-acc (- n 1) b (+ a b)))\n\
                      (fib 50)";
        assert_eq!(eval_str(&mut interp, source).unwrap(), val(12_586_269_025_i64));
        let fib = &interp.program().functions["fib"];
        assert_eq!(fib.memo.get("50 "), Some(val(12_586_269_025_i64)));
    }

    #[test]
    fn test_user_types() {
        run_tests_in_environment(vec![TestEnvironment(vec![
            ("(deftype meters int)\n(deftype feet int)\n(def show (m:meters) \"meters\")\n(def show (n:int) \"int\")\n0", success(0)),
            ("(show (meters 5))", success("meters")),
            ("(show (feet 5))", success("int")),
            ("(show 5)", success("int")),
            ("(+ (meters 2) 3)", success(5)),
            ("(meters \"x\")", SpecificError("meters: Expected all int arguments, found \"x\" at position 0")),
            ("(do (meters 2) :meters)", success(2)),
            ("(do 2 :meters)", SpecificError("do: Expected all meters arguments, found 2")),
        ])]);
    }

    #[test]
    fn test_print_output() {
        let output = SharedOutput::default();
        let mut interp = interpreter().with_output(output.clone());
        let result = eval_str(&mut interp, "(print \"a\" 1 '(\"b\" #t))").unwrap();
        assert_eq!(result, Value::Nil);
        assert_eq!(output.text(), "a 1 (\"b\" true)\n");
    }

    #[test]
    fn test_open_reads_lazily_and_releases_on_scope_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "hé!").unwrap();
        let path = path.display().to_string().replace('\\', "\\\\");

        let mut interp = interpreter();
        let source = format!(
            "(def drain ('() acc) acc)\n\
             (def drain (s acc) (drain (tail s) (concat acc (head s))))\n\
             (do (set' chars (open \"{path}\")) (set escaped chars) (drain chars \"\"))"
        );
        assert_eq!(eval_str(&mut interp, &source).unwrap(), val("hé!"));

        // The handle was released when the do scope exited
        assert_eq!(interp.files.len(), 1);
        assert!(interp.files[0].reader.borrow().is_none());
        assert!(interp.unclaimed.is_empty());

        // An unclaimed handle stays open until the end of the evaluation
        let source = format!("(set unread (open \"{path}\"))\n(head (tail unread))");
        assert_eq!(eval_str(&mut interp, &source).unwrap(), val("é"));
        let reopened = format!("(set lazy (open \"{path}\"))\n0");
        assert_eq!(eval_str(&mut interp, &reopened).unwrap(), val(0));
        assert_eq!(
            eval_str(&mut interp, "(head lazy)").unwrap_err().to_string(),
            format!("EvaluationError: read from closed file {}", path.replace("\\\\", "\\"))
        );
    }

    #[test]
    fn test_scoped_handle_is_released_when_the_body_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "abc").unwrap();
        let path = path.display().to_string().replace('\\', "\\\\");

        let mut interp = interpreter();
        let source = format!(
            "(def boom (s) (do (set' f (open \"{path}\")) (head f) (/ 1 0)))\n(boom 0)"
        );
        let err = eval_str(&mut interp, &source).unwrap_err();
        assert_eq!(err.root().to_string(), "EvaluationError: division by zero");
        assert_eq!(err.call_chain(), vec!["boom"]);

        assert_eq!(interp.files.len(), 1);
        assert!(interp.files[0].reader.borrow().is_none());
        assert!(interp.unclaimed.is_empty());
    }

    #[test]
    fn test_open_missing_file() {
        let mut interp = interpreter();
        let err = eval_str(&mut interp, "(open \"/definitely/not/here.txt\")").unwrap_err();
        assert!(err.to_string().contains("cannot open /definitely/not/here.txt"));
    }

    #[test]
    fn test_run_executes_statements_in_order() {
        let output = SharedOutput::default();
        let program = Program::load(
            "(print 1)\n(def twice (x) (* 2 x))\n(print (twice 2))\n(twice 21)",
            &MemoryLoader::new(),
        )
        .unwrap();
        let mut interp = Interpreter::new(program).with_output(output.clone());
        assert_eq!(interp.run().unwrap(), val(42));
        assert_eq!(output.text(), "1\n4\n");
        assert!(interp.globals().is_frozen());
    }
}
