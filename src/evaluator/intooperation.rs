//! Adapters from typed Rust functions to builtin operations.
//!
//! A builtin written as `fn(NumberType, NumIter<'_>) -> Result<NumberType, Error>`
//! is turned into an [`OperationFn`] that checks and converts each argument.
//! A conversion failure is an `Error::Cast` with an empty context and the
//! 0-based argument position; the caller names the operation.
//!
//! Typed parameters look through user-type brands, so `(+ (meters 1) 2)`
//! is `3`; `Value` parameters receive arguments exactly as passed.

use crate::Error;
use crate::ast::NumberType;
use crate::value::Value;
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::sync::Arc;

/// Type-erased builtin: owned arguments in, one value out
pub type OperationFn = dyn Fn(Vec<Value>) -> Result<Value, Error> + Send + Sync;

/// Cast error for an argument that does not have the expected type
pub(crate) fn argument_error(expected: &str, found: &Value, position: usize) -> Error {
    Error::Cast {
        context: String::new(),
        expected: expected.to_owned(),
        found: found.repr().to_string(),
        position,
    }
}

// =====================================================================
// Fixed-arity argument conversion
// =====================================================================

/// A single parameter type a builtin may declare.
///
/// `Param<'a>` may borrow from the argument slot (`&str`) or take it
/// over (`Value`).
pub trait FromParam {
    type Param<'a>;

    fn from_arg<'a>(value: &'a mut Value, position: usize) -> Result<Self::Param<'a>, Error>;
}

impl FromParam for Value {
    type Param<'a> = Value;

    fn from_arg<'a>(value: &'a mut Value, _position: usize) -> Result<Self::Param<'a>, Error> {
        Ok(std::mem::replace(value, Value::Nil))
    }
}

impl FromParam for NumberType {
    type Param<'a> = NumberType;

    fn from_arg<'a>(value: &'a mut Value, position: usize) -> Result<Self::Param<'a>, Error> {
        match value.untagged() {
            Value::Int(n) => Ok(*n),
            other => Err(argument_error("int", other, position)),
        }
    }
}

impl FromParam for bool {
    type Param<'a> = bool;

    fn from_arg<'a>(value: &'a mut Value, position: usize) -> Result<Self::Param<'a>, Error> {
        match value.untagged() {
            Value::Bool(b) => Ok(*b),
            other => Err(argument_error("bool", other, position)),
        }
    }
}

impl FromParam for &str {
    type Param<'a> = &'a str;

    fn from_arg<'a>(value: &'a mut Value, position: usize) -> Result<Self::Param<'a>, Error> {
        let value: &'a Value = value;
        match value.untagged() {
            Value::Str(s) => Ok(s.as_str()),
            other => Err(argument_error("str", other, position)),
        }
    }
}

// =====================================================================
// Typed iterators over rest arguments
// =====================================================================

/// Element type of a rest iterator. All elements are checked before
/// the builtin runs, so `project` never sees a mismatched value.
#[doc(hidden)]
pub trait ValueElementKind {
    type Item<'a>;

    /// `offset` is the argument position of `slice[0]`
    fn precheck(slice: &[Value], offset: usize) -> Result<(), Error>;
    fn project<'a>(v: &'a Value) -> Self::Item<'a>;
}

/// Rest arguments viewed through a [`ValueElementKind`]
#[doc(hidden)]
pub struct TypedValueIter<'a, K: ValueElementKind> {
    inner: std::slice::Iter<'a, Value>,
    _marker: PhantomData<K>,
}

impl<'a, K> TypedValueIter<'a, K>
where
    K: ValueElementKind,
{
    pub(crate) fn new(values: &'a [Value], offset: usize) -> Result<Self, Error> {
        K::precheck(values, offset)?;
        Ok(TypedValueIter {
            inner: values.iter(),
            _marker: PhantomData,
        })
    }
}

impl<'a, K> Iterator for TypedValueIter<'a, K>
where
    K: ValueElementKind,
{
    type Item = K::Item<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let v = self.inner.next()?;
        Some(K::project(v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K> ExactSizeIterator for TypedValueIter<'_, K> where K: ValueElementKind {}
impl<K> FusedIterator for TypedValueIter<'_, K> where K: ValueElementKind {}

/// Element kind that views each argument as a borrowed `Value`
#[doc(hidden)]
pub struct ValueKind;

impl ValueElementKind for ValueKind {
    type Item<'a> = &'a Value;

    fn precheck(_slice: &[Value], _offset: usize) -> Result<(), Error> {
        Ok(())
    }

    fn project<'a>(v: &'a Value) -> Self::Item<'a> {
        v
    }
}

#[doc(hidden)]
pub struct NumberKind;

impl ValueElementKind for NumberKind {
    type Item<'a> = NumberType;

    fn precheck(slice: &[Value], offset: usize) -> Result<(), Error> {
        match slice.iter().position(|v| !matches!(v.untagged(), Value::Int(_))) {
            Some(index) => Err(argument_error("int", &slice[index], offset + index)),
            None => Ok(()),
        }
    }

    fn project<'a>(v: &'a Value) -> Self::Item<'a> {
        if let Value::Int(n) = v.untagged() {
            *n
        } else {
            debug_assert!(false, "NumberKind::project saw non-number after precheck");
            unreachable!("NumberKind invariant violated")
        }
    }
}

#[doc(hidden)]
pub struct StringKind;

impl ValueElementKind for StringKind {
    type Item<'a> = &'a str;

    fn precheck(slice: &[Value], offset: usize) -> Result<(), Error> {
        match slice.iter().position(|v| !matches!(v.untagged(), Value::Str(_))) {
            Some(index) => Err(argument_error("str", &slice[index], offset + index)),
            None => Ok(()),
        }
    }

    fn project<'a>(v: &'a Value) -> Self::Item<'a> {
        if let Value::Str(s) = v.untagged() {
            s.as_str()
        } else {
            debug_assert!(false, "StringKind::project saw non-string after precheck");
            unreachable!("StringKind invariant violated")
        }
    }
}

/// Borrowed iterator over rest arguments of any type
pub type ValueIter<'a> = TypedValueIter<'a, ValueKind>;

/// Borrowed iterator over integer rest arguments; every element is
/// checked before the builtin runs
pub type NumIter<'a> = TypedValueIter<'a, NumberKind>;

/// Borrowed iterator over string rest arguments
pub type StringIter<'a> = TypedValueIter<'a, StringKind>;

// =====================================================================
// Rest-parameter support for variadic operations
// =====================================================================

/// A trailing rest parameter built from the remaining arguments
pub trait FromRest {
    type Param<'a>;

    fn from_rest<'a>(slice: &'a [Value], offset: usize) -> Result<Self::Param<'a>, Error>;
}

impl<K> FromRest for TypedValueIter<'static, K>
where
    K: ValueElementKind,
{
    type Param<'a> = TypedValueIter<'a, K>;

    fn from_rest<'a>(slice: &'a [Value], offset: usize) -> Result<Self::Param<'a>, Error> {
        TypedValueIter::<K>::new(slice, offset)
    }
}

// =====================================================================
// Return-type adaptation for builtin functions
// =====================================================================

/// Return types a builtin may use
pub trait IntoValueResult {
    fn into_value_result(self) -> Result<Value, Error>;
}

impl<T> IntoValueResult for Result<T, Error>
where
    T: Into<Value>,
{
    fn into_value_result(self) -> Result<Value, Error> {
        self.map(Into::into)
    }
}

macro_rules! impl_into_value_result {
    ($($ty:ty),+) => {
        $(
            impl IntoValueResult for $ty {
                fn into_value_result(self) -> Result<Value, Error> {
                    Ok(self.into())
                }
            }
        )+
    };
}

impl_into_value_result!(Value, NumberType, bool, String, &'static str);

/// Fixed-arity functions; `Args` is the tuple of parameter types
pub trait IntoOperation<Args> {
    fn into_operation(self) -> Arc<OperationFn>;
}

/// Functions ending in a rest iterator (`ValueIter`, `NumIter` or
/// `StringIter`) after zero to two fixed parameters
pub trait IntoVariadicOperation<Args> {
    fn into_variadic_operation(self) -> Arc<OperationFn>;
}

// =====================================================================
// Variadic adapters
// =====================================================================

impl<F, I, R> IntoVariadicOperation<(I,)> for F
where
    I: FromRest,
    F: for<'a> Fn(<I as FromRest>::Param<'a>) -> R + Send + Sync + 'static,
    R: IntoValueResult,
{
    fn into_variadic_operation(self) -> Arc<OperationFn> {
        Arc::new(move |args: Vec<Value>| {
            let rest_param: <I as FromRest>::Param<'_> = <I as FromRest>::from_rest(&args[..], 0)?;
            let result: R = (self)(rest_param);
            result.into_value_result()
        })
    }
}

macro_rules! impl_into_variadic_operation_for_prefix_and_rest {
    ($prefix:expr, $( $v:ident, $p:ident : $A:ident @ $i:expr ),+ ) => {
        impl<F, I, R, $( $A ),+> IntoVariadicOperation<( $( $A, )+ I, )> for F
        where
            I: FromRest,
            $( $A: FromParam, )+
            F: for<'a> Fn(
                    $( <$A as FromParam>::Param<'a> ),+,
                    <I as FromRest>::Param<'a>,
                ) -> R
                + Send
                + Sync
                + 'static,
            R: IntoValueResult,
        {
            fn into_variadic_operation(self) -> Arc<OperationFn> {
                Arc::new(move |mut args: Vec<Value>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        &mut [ $( ref mut $v ),+, ref mut rest @ .. ] => {
                            $(
                                let $p: <$A as FromParam>::Param<'_> =
                                    <$A as FromParam>::from_arg($v, $i)?;
                            )+

                            let rest_param: <I as FromRest>::Param<'_> =
                                <I as FromRest>::from_rest(&*rest, $prefix)?;

                            let result: R = (self)( $( $p ),+, rest_param );
                            result.into_value_result()
                        }
                        _ => Err(Error::arity_error($prefix, len)),
                    }
                })
            }
        }
    };
}

impl_into_variadic_operation_for_prefix_and_rest!(1, v0, p0: A1 @ 0);
impl_into_variadic_operation_for_prefix_and_rest!(2, v0, p0: A1 @ 0, v1, p1: A2 @ 1);

// =====================================================================
// Fixed-arity adapters
// =====================================================================

// The argument vector is destructured into slots that each parameter
// borrows from or takes over.
macro_rules! impl_into_operation_for_arity {
    ($arity:expr, $( $v:ident, $p:ident : $A:ident @ $i:expr ),+ ) => {
        impl<F, R, $( $A ),+> IntoOperation<( $( $A, )+ )> for F
        where
            F: for<'a> Fn( $( <$A as FromParam>::Param<'a> ),+ ) -> R
                + Send
                + Sync
                + 'static,
            $( $A: FromParam, )+
            R: IntoValueResult,
        {
            fn into_operation(self) -> Arc<OperationFn> {
                Arc::new(move |mut args: Vec<Value>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        &mut [ $( ref mut $v ),+ ] => {
                            $(
                                let $p: <$A as FromParam>::Param<'_> =
                                    <$A as FromParam>::from_arg($v, $i)?;
                            )+

                            let result: R = (self)( $( $p ),+ );
                            result.into_value_result()
                        }
                        _ => Err(Error::arity_error($arity, len)),
                    }
                })
            }
        }
    };
}

impl<F, R> IntoOperation<()> for F
where
    F: Fn() -> R + Send + Sync + 'static,
    R: IntoValueResult,
{
    fn into_operation(self) -> Arc<OperationFn> {
        Arc::new(move |args: Vec<Value>| {
            if !args.is_empty() {
                return Err(Error::arity_error(0, args.len()));
            }

            let result: R = (self)();
            result.into_value_result()
        })
    }
}

impl_into_operation_for_arity!(1, v0, p0: A1 @ 0);
impl_into_operation_for_arity!(2, v0, p0: A1 @ 0, v1, p1: A2 @ 1);
impl_into_operation_for_arity!(3, v0, p0: A1 @ 0, v1, p1: A2 @ 1, v2, p2: A3 @ 2);

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::value::val;

    fn cast(expected: &str, found: &str, position: usize) -> Error {
        Error::Cast {
            context: String::new(),
            expected: expected.into(),
            found: found.into(),
            position,
        }
    }

    #[test]
    fn test_fixed_arity_conversion() {
        let repeat = IntoOperation::<(&str, NumberType)>::into_operation(
            |s: &str, n: NumberType| -> Value { val(s.repeat(usize::try_from(n).unwrap_or(0))) },
        );

        assert_eq!(repeat(vec![val("ab"), val(2)]).unwrap(), val("abab"));
        assert_eq!(
            repeat(vec![val("ab"), val("2")]).unwrap_err(),
            cast("int", "\"2\"", 1)
        );
        assert_eq!(repeat(vec![val("ab")]).unwrap_err(), Error::arity_error(2, 1));
    }

    #[test]
    fn test_rest_positions_follow_the_prefix() {
        let sum_from = IntoVariadicOperation::<(NumberType, NumIter<'static>)>::into_variadic_operation(
            |base: NumberType, rest: NumIter<'_>| base + rest.sum::<NumberType>(),
        );

        assert_eq!(sum_from(vec![val(1), val(2), val(3)]).unwrap(), val(6));
        assert_eq!(sum_from(vec![val(1)]).unwrap(), val(1));
        assert_eq!(
            sum_from(vec![val(1), val(2), val(true)]).unwrap_err(),
            cast("int", "true", 2)
        );
        assert_eq!(sum_from(vec![]).unwrap_err(), Error::arity_error(1, 0));
    }

    #[test]
    fn test_value_and_string_iterators() {
        let count = IntoVariadicOperation::<(ValueIter<'static>,)>::into_variadic_operation(
            |rest: ValueIter<'_>| rest.len() as NumberType,
        );
        assert_eq!(count(vec![val(1), val("x"), Value::Nil]).unwrap(), val(3));

        let join = IntoVariadicOperation::<(StringIter<'static>,)>::into_variadic_operation(
            |rest: StringIter<'_>| rest.collect::<String>(),
        );
        assert_eq!(join(vec![val("a"), val("b")]).unwrap(), val("ab"));
        assert_eq!(join(vec![val("a"), val(1)]).unwrap_err(), cast("str", "1", 1));
    }

    #[test]
    fn test_typed_parameters_look_through_brands() {
        let meters = Value::tagged("meters", val(5));
        let double = IntoOperation::<(NumberType,)>::into_operation(|n: NumberType| n * 2);
        assert_eq!(double(vec![meters.clone()]).unwrap(), val(10));

        let total = IntoVariadicOperation::<(NumIter<'static>,)>::into_variadic_operation(
            |rest: NumIter<'_>| rest.sum::<NumberType>(),
        );
        assert_eq!(total(vec![meters.clone(), val(1)]).unwrap(), val(6));

        let greet = IntoOperation::<(&str,)>::into_operation(|s: &str| format!("hi {s}"));
        assert_eq!(
            greet(vec![Value::tagged("name", val("bo"))]).unwrap(),
            val("hi bo")
        );

        // Value parameters keep the brand
        let keep = IntoOperation::<(Value,)>::into_operation(|v: Value| v);
        let kept = keep(vec![meters]).unwrap();
        assert!(matches!(&kept, Value::Tagged(tagged) if tagged.type_name == "meters"));
    }

    #[test]
    fn test_nullary_operation() {
        let answer = IntoOperation::<()>::into_operation(|| 42 as NumberType);
        assert_eq!(answer(vec![]).unwrap(), val(42));
        assert_eq!(answer(vec![val(1)]).unwrap_err(), Error::arity_error(0, 1));
    }
}
