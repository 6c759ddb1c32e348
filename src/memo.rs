use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::Error;
use crate::evaluator::Interpreter;
use crate::generator::uncons;
use crate::value::Value;

/// Per-function cache of results keyed by the serialized argument tuple.
///
/// Entries are never evicted; the cache lives as long as its function
/// definition.
#[derive(Default)]
pub struct MemoCache {
    entries: RefCell<HashMap<String, Value>>,
}

impl MemoCache {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn insert(&self, key: String, value: Value) {
        self.entries.borrow_mut().insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl std::fmt::Debug for MemoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoCache({} entries)", self.len())
    }
}

/// Structural key for an argument tuple.
///
/// Lists are keyed by their elements, so lazy lists are forced to the end;
/// an infinite generator used as an argument of a memoized function never
/// produces a key. Lambdas are keyed by their creation id, never by address,
/// because a freed closure's allocation can be reused by the next one.
pub(crate) fn memo_key(args: &[Value], interp: &mut Interpreter) -> Result<String, Error> {
    let mut key = String::new();
    for arg in args {
        write_key(arg, interp, &mut key)?;
        key.push(' ');
    }
    Ok(key)
}

fn write_key(value: &Value, interp: &mut Interpreter, out: &mut String) -> Result<(), Error> {
    match value {
        Value::Int(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Bool(b) => {
            let _ = write!(out, "#{b}");
        }
        Value::Str(_) => {
            let _ = write!(out, "{}", value.repr());
        }
        Value::FuncRef(name) => {
            let _ = write!(out, "#<function {name}>");
        }
        Value::Lambda(lambda) => {
            let _ = write!(out, "#<lambda {}>", lambda.id);
        }
        Value::Tagged(tagged) => {
            let _ = write!(out, "{}:", tagged.type_name);
            write_key(&tagged.value, interp, out)?;
        }
        Value::Nil | Value::Cons(_) | Value::Generator(_) => {
            out.push('(');
            let mut current = value.clone();
            while let Some((head, tail)) = uncons(&current, interp, "memo")? {
                write_key(&head, interp, out)?;
                out.push(' ');
                current = tail;
            }
            out.push(')');
        }
    }
    Ok(())
}
