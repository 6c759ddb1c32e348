//! Lazy lists.
//!
//! `(gen iter state)` creates an unforced [`Generator`]. Forcing calls
//! `(iter state)` once and interprets the result:
//!
//! - `'()`: the list is exhausted
//! - `(v)`: head `v`, and `v` is also the next state
//! - `(v s)`: head `v`, next state `s`
//!
//! The outcome is stored in a write-once cell, so side effects of the
//! iterator are observed exactly once per list position no matter how often
//! the node is traversed.

use std::cell::OnceCell;

use tracing::trace;

use crate::Error;
use crate::evaluator::Interpreter;
use crate::value::{Value, drop_spine};

/// Result of forcing one generator node
pub enum Forced {
    Exhausted,
    Item { head: Value, next: Value },
}

pub struct Generator {
    iterator: Value,
    state: Value,
    forced: OnceCell<Forced>,
}

impl Generator {
    pub fn new(iterator: Value, state: Value) -> Self {
        Generator {
            iterator,
            state,
            forced: OnceCell::new(),
        }
    }

    /// Cached outcome, if this node has been forced
    pub fn forced(&self) -> Option<&Forced> {
        self.forced.get()
    }

    pub(crate) fn take_next(&mut self) -> Value {
        match self.forced.take() {
            Some(Forced::Item { next, .. }) => next,
            _ => Value::Nil,
        }
    }

    /// Force this node, invoking the iterator at most once
    pub(crate) fn force(&self, interp: &mut Interpreter) -> Result<&Forced, Error> {
        if let Some(forced) = self.forced.get() {
            return Ok(forced);
        }
        trace!(iterator = %self.iterator.repr(), state = %self.state.repr(), "forcing generator");
        let step = interp.apply(&self.iterator, vec![self.state.clone()])?;
        let forced = self.interpret_step(&step)?;
        // A re-entrant force of this node may already have filled the cell;
        // the first stored outcome stands.
        let _ = self.forced.set(forced);
        self.forced
            .get()
            .ok_or_else(|| Error::EvalError("generator could not be forced".into()))
    }

    fn interpret_step(&self, step: &Value) -> Result<Forced, Error> {
        let items = step.strict_items().unwrap_or_default();
        match (step.untagged(), items.as_slice()) {
            (Value::Nil, _) => Ok(Forced::Exhausted),
            (Value::Cons(_), [value]) => Ok(Forced::Item {
                head: value.clone(),
                next: Value::Generator(std::rc::Rc::new(Generator::new(
                    self.iterator.clone(),
                    value.clone(),
                ))),
            }),
            (Value::Cons(_), [value, state]) => Ok(Forced::Item {
                head: value.clone(),
                next: Value::Generator(std::rc::Rc::new(Generator::new(
                    self.iterator.clone(),
                    state.clone(),
                ))),
            }),
            _ => Err(Error::EvalError(format!(
                "gen: iterator must return '(), (value) or (value state), got {}",
                step.repr()
            ))),
        }
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        drop_spine(self.take_next());
    }
}

/// Split a list into head and tail, forcing a generator node if needed.
///
/// Returns `None` for the empty list and for exhausted generators.
pub(crate) fn uncons(
    value: &Value,
    interp: &mut Interpreter,
    context: &str,
) -> Result<Option<(Value, Value)>, Error> {
    match value.untagged() {
        Value::Nil => Ok(None),
        Value::Cons(cell) => Ok(Some((cell.head.clone(), cell.tail.clone()))),
        Value::Generator(generator) => match generator.force(interp)? {
            Forced::Exhausted => Ok(None),
            Forced::Item { head, next } => Ok(Some((head.clone(), next.clone()))),
        },
        other => Err(Error::Cast {
            context: context.to_owned(),
            expected: "list".into(),
            found: other.repr().to_string(),
            position: 0,
        }),
    }
}

pub(crate) fn head(value: &Value, interp: &mut Interpreter) -> Result<Value, Error> {
    match uncons(value, interp, "head")? {
        Some((head, _)) => Ok(head),
        None => Err(Error::EvalError("empty list has no head".into())),
    }
}

/// The tail of an exhausted list is `'()`
pub(crate) fn tail(value: &Value, interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(uncons(value, interp, "tail")?.map_or(Value::Nil, |(_, tail)| tail))
}

pub(crate) fn is_empty(value: &Value, interp: &mut Interpreter) -> Result<bool, Error> {
    Ok(uncons(value, interp, "empty?")?.is_none())
}

/// Every element of a list, forcing generators to the end.
///
/// Never returns for an infinite generator.
pub(crate) fn force_all(
    value: &Value,
    interp: &mut Interpreter,
    context: &str,
) -> Result<Vec<Value>, Error> {
    let mut items = Vec::new();
    let mut current = value.clone();
    while let Some((head, tail)) = uncons(&current, interp, context)? {
        items.push(head);
        current = tail;
    }
    Ok(items)
}

/// Force the first node of a generator so literal patterns can compare it;
/// an exhausted generator becomes `'()`.
pub(crate) fn settle(value: Value, interp: &mut Interpreter) -> Result<Value, Error> {
    if let Value::Generator(generator) = &value
        && let Forced::Exhausted = generator.force(interp)?
    {
        return Ok(Value::Nil);
    }
    Ok(value)
}
