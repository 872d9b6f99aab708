//! Typed method handlers.
//!
//! `SyncMethod` and `AsyncMethod` are implemented for plain functions and
//! closures of up to four arguments. The `Args` tuple parameter only exists
//! to keep the implementations for different arities apart; for synchronous
//! methods it also carries the return type, which the borrowed receiver
//! would otherwise leave unconstrained.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::Fault;
use crate::module::Instance;
use crate::value::Expect;
use crate::value::FromValue;
use crate::value::IntoValue;
use crate::value::Value;

/// What an invoked member produced.
pub enum Returned {
    Ready(Value),
    Pending(BoxFuture<'static, Result<Value, Fault>>),
}

/// A type-erased member invocation.
pub(crate) type Invoke = Box<dyn Fn(Instance, Vec<Value>) -> Result<Returned, Fault> + Send + Sync>;

/// A synchronous method on `T`: `Fn(&T, A1, .., An) -> Result<R, Fault>`.
pub trait SyncMethod<T, Args>: Send + Sync + 'static {
    fn params() -> Vec<Expect>;
    fn call(&self, this: &T, args: Vec<Value>) -> Result<Value, Fault>;
}

/// An asynchronous method on `T`: `Fn(Arc<T>, A1, .., An) -> Fut`.
pub trait AsyncMethod<T, Args>: Send + Sync + 'static {
    fn params() -> Vec<Expect>;
    fn call(&self, this: Arc<T>, args: Vec<Value>) -> Result<BoxFuture<'static, Result<Value, Fault>>, Fault>;
}

fn check_arity(expected: usize, args: &[Value]) -> Result<(), Fault> {
    if args.len() != expected {
        return Err(Fault::argument(format!(
            "expected {} argument(s), got {}",
            expected,
            args.len()
        )));
    }
    Ok(())
}

macro_rules! impl_methods {
    ($count:literal; $($arg:ident $var:ident),*) => {
        impl<T, F, R, $($arg,)*> SyncMethod<T, (R, $($arg,)*)> for F
        where
            T: 'static,
            F: Fn(&T, $($arg),*) -> Result<R, Fault> + Send + Sync + 'static,
            R: IntoValue,
            $($arg: FromValue,)*
        {
            fn params() -> Vec<Expect> {
                vec![$(<$arg as FromValue>::expect()),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn call(&self, this: &T, args: Vec<Value>) -> Result<Value, Fault> {
                check_arity($count, &args)?;
                let mut args = args.into_iter();
                $(let $var = <$arg as FromValue>::from_value(args.next().unwrap_or(Value::Null))?;)*
                (self)(this, $($var),*)?.into_value()
            }
        }

        impl<T, F, Fut, R, $($arg,)*> AsyncMethod<T, ($($arg,)*)> for F
        where
            T: Send + Sync + 'static,
            F: Fn(Arc<T>, $($arg),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R, Fault>> + Send + 'static,
            R: IntoValue,
            $($arg: FromValue,)*
        {
            fn params() -> Vec<Expect> {
                vec![$(<$arg as FromValue>::expect()),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn call(&self, this: Arc<T>, args: Vec<Value>) -> Result<BoxFuture<'static, Result<Value, Fault>>, Fault> {
                check_arity($count, &args)?;
                let mut args = args.into_iter();
                $(let $var = <$arg as FromValue>::from_value(args.next().unwrap_or(Value::Null))?;)*
                let fut = (self)(this, $($var),*);
                Ok(async move { fut.await?.into_value() }.boxed())
            }
        }
    };
}

impl_methods!(0;);
impl_methods!(1; A1 a1);
impl_methods!(2; A1 a1, A2 a2);
impl_methods!(3; A1 a1, A2 a2, A3 a3);
impl_methods!(4; A1 a1, A2 a2, A3 a3, A4 a4);
