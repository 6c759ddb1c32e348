use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::Error;
use crate::value::Value;

/// A handle that must be released when its owning scope exits
pub trait Resource {
    /// Short description used in diagnostics
    fn describe(&self) -> String;

    fn release(&self) -> Result<(), Error>;
}

struct Scope {
    bindings: RefCell<HashMap<String, Value>>,
    parent: Option<Environment>,
    frozen: Cell<bool>,
    resources: RefCell<Vec<Rc<dyn Resource>>>,
}

/// Shared handle to a chain of scopes.
///
/// Cloning is cheap and shares the scope: a lambda created in a scope sees
/// bindings added to that scope (or its parents) after its creation.
#[derive(Clone)]
pub struct Environment(Rc<Scope>);

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Environment(Rc::new(Scope {
            bindings: RefCell::new(HashMap::new()),
            parent: None,
            frozen: Cell::new(false),
            resources: RefCell::new(Vec::new()),
        }))
    }

    /// A new empty scope whose parent is this one
    pub fn child(&self) -> Self {
        Environment(Rc::new(Scope {
            bindings: RefCell::new(HashMap::new()),
            parent: Some(self.clone()),
            frozen: Cell::new(false),
            resources: RefCell::new(Vec::new()),
        }))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let mut scope = self;
        loop {
            if let Some(value) = scope.0.bindings.borrow().get(name) {
                return Some(value.clone());
            }
            scope = scope.0.parent.as_ref()?;
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Value, Error> {
        self.get(name)
            .ok_or_else(|| Error::UnboundVariable(name.to_owned()))
    }

    /// Bind in the innermost scope, shadowing outer bindings
    pub fn bind(&self, name: impl Into<String>, value: Value) -> Result<(), Error> {
        let name = name.into();
        if self.0.frozen.get() {
            return Err(Error::EvalError(format!(
                "cannot bind {name} in a scope that has already exited"
            )));
        }
        self.0.bindings.borrow_mut().insert(name, value);
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    /// Register a resource to be released when this scope exits
    pub fn acquire(&self, resource: Rc<dyn Resource>) {
        debug!(resource = %resource.describe(), "resource acquired");
        self.0.resources.borrow_mut().push(resource);
    }

    pub fn holds_resources(&self) -> bool {
        !self.0.resources.borrow().is_empty()
    }

    /// Leave this scope: freeze it and release its resources in reverse
    /// acquisition order.
    ///
    /// A release failure after a successful body becomes a `ResourceError`;
    /// if the body already failed, release failures are only logged and the
    /// original error continues to unwind.
    pub fn exit(&self, outcome: Result<Value, Error>) -> Result<Value, Error> {
        self.0.frozen.set(true);
        let resources: Vec<_> = self.0.resources.borrow_mut().drain(..).collect();
        let mut first_failure = None;
        for resource in resources.iter().rev() {
            if let Err(err) = resource.release() {
                warn!(resource = %resource.describe(), error = %err, "failed to release resource");
                first_failure.get_or_insert(err);
            } else {
                debug!(resource = %resource.describe(), "resource released");
            }
        }
        match (outcome, first_failure) {
            (Ok(_), Some(err)) => Err(Error::ResourceError(err.to_string())),
            (outcome, _) => outcome,
        }
    }

    /// Names bound in this scope and its parents, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut scope = Some(self);
        while let Some(current) = scope {
            names.extend(current.0.bindings.borrow().keys().cloned());
            scope = current.0.parent.as_ref();
        }
        names.sort();
        names.dedup();
        names
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.0.bindings.borrow().keys().cloned().collect();
        names.sort();
        f.debug_struct("Environment")
            .field("bindings", &names)
            .field("has_parent", &self.0.parent.is_some())
            .finish()
    }
}
