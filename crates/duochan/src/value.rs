//! # Values
//!
//! `Value` is everything that can be an argument or a result. The scalar
//! variants map one-to-one onto duopack fast-path tags. Object references
//! come in two forms: `Proxy`, a proxy that may point across the channel, and
//! `Object`, a local instance handed back unwrapped. Anything else is an
//! `Other` MessagePack blob.
//!
//! `IntoValue` and `FromValue` are the typed edges used by method handlers
//! and by callers awaiting results.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Fault;
use crate::module::ClassEntry;
use crate::module::Instance;
use crate::module::Remote;
use crate::proxy::AnyProxy;
use crate::proxy::RemoteProxy;

/// A dynamically typed argument or result.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(u8),
    Char(char),
    String(String),
    Int32(i32),
    Proxy(AnyProxy),
    Object(Object),
    /// Serialized with the general-purpose serializer.
    Other(Vec<u8>),
}

impl Value {
    /// Encodes any serde value as `Other`.
    pub fn serde<T: Serialize + ?Sized>(value: &T) -> Result<Self, Fault> {
        Ok(Self::Other(duopack::to_other(value)?))
    }

    /// Human readable kind, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Byte(_) => "byte",
            Self::Char(_) => "char",
            Self::String(_) => "string",
            Self::Int32(_) => "int32",
            Self::Proxy(_) => "proxy",
            Self::Object(_) => "object",
            Self::Other(_) => "other",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Byte(a), Self::Byte(b)) => a == b,
            (Self::Char(a), Self::Char(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Proxy(a), Self::Proxy(b)) => a.same_proxy(b),
            (Self::Object(a), Self::Object(b)) => a.same_instance(b),
            (Self::Other(a), Self::Other(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(v) => write!(f, "Bool({})", v),
            Self::Byte(v) => write!(f, "Byte({})", v),
            Self::Char(v) => write!(f, "Char({:?})", v),
            Self::String(v) => write!(f, "String({:?})", v),
            Self::Int32(v) => write!(f, "Int32({})", v),
            Self::Proxy(p) => write!(f, "{:?}", p),
            Self::Object(o) => write!(f, "Object({})", o.type_name()),
            Self::Other(blob) => write!(f, "Other({} bytes)", blob.len()),
        }
    }
}

/// A local instance together with its class.
#[derive(Clone)]
pub struct Object {
    pub(crate) instance: Instance,
    pub(crate) class: Arc<ClassEntry>,
}

impl Object {
    pub fn new<T: Remote>(instance: Arc<T>) -> Self {
        Self { instance, class: ClassEntry::of::<T>() }
    }

    pub(crate) fn from_parts(instance: Instance, class: Arc<ClassEntry>) -> Self {
        Self { instance, class }
    }

    pub fn type_name(&self) -> &'static str {
        self.class.name()
    }

    pub fn downcast<T: Remote>(&self) -> Option<Arc<T>> {
        self.instance.clone().downcast::<T>().ok()
    }

    fn same_instance(&self, other: &Object) -> bool {
        instance_key(&self.instance) == instance_key(&other.instance)
    }
}

/// Identity of a local instance: the address of its data.
pub(crate) fn instance_key(instance: &Instance) -> usize {
    Arc::as_ptr(instance) as *const () as usize
}

/// What a decoder should produce for a proxy that points back home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Keep proxies as proxies.
    Any,
    /// Unwrap a local instance assignable to the named type.
    Instance(&'static str),
}

/// Conversion into a `Value`.
pub trait IntoValue {
    fn into_value(self) -> Result<Value, Fault>;
}

/// Conversion out of a `Value`.
pub trait FromValue: Sized {
    /// Decoding hint for parameters of this type.
    fn expect() -> Expect {
        Expect::Any
    }

    fn from_value(value: Value) -> Result<Self, Fault>;
}

fn mismatch(expected: &str, value: &Value) -> Fault {
    Fault::argument(format!("expected {}, found {}", expected, value.kind()))
}

impl IntoValue for Value {
    fn into_value(self) -> Result<Value, Fault> {
        Ok(self)
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, Fault> {
        Ok(value)
    }
}

impl IntoValue for () {
    fn into_value(self) -> Result<Value, Fault> {
        Ok(Value::Null)
    }
}

impl FromValue for () {
    fn from_value(_: Value) -> Result<Self, Fault> {
        Ok(())
    }
}

macro_rules! impl_scalar {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl IntoValue for $ty {
            fn into_value(self) -> Result<Value, Fault> {
                Ok(Value::$variant(self))
            }
        }

        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self, Fault> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => Err(mismatch($name, &other)),
                }
            }
        }
    };
}

impl_scalar!(bool, Bool, "bool");
impl_scalar!(u8, Byte, "byte");
impl_scalar!(char, Char, "char");
impl_scalar!(String, String, "string");
impl_scalar!(i32, Int32, "int32");

impl IntoValue for &str {
    fn into_value(self) -> Result<Value, Fault> {
        Ok(Value::String(self.to_string()))
    }
}

// Types without a fast path go through the general serializer.
macro_rules! impl_other {
    ($($ty:ty),*) => {
        $(
            impl IntoValue for $ty {
                fn into_value(self) -> Result<Value, Fault> {
                    Value::serde(&self)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self, Fault> {
                    match value {
                        Value::Other(blob) => Ok(duopack::from_other(&blob)?),
                        other => Err(mismatch(stringify!($ty), &other)),
                    }
                }
            }
        )*
    };
}

impl_other!(i8, i16, i64, u16, u32, u64, f32, f64);

impl<V: IntoValue> IntoValue for Option<V> {
    fn into_value(self) -> Result<Value, Fault> {
        match self {
            Some(v) => v.into_value(),
            None => Ok(Value::Null),
        }
    }
}

impl<V: FromValue> FromValue for Option<V> {
    fn expect() -> Expect {
        V::expect()
    }

    fn from_value(value: Value) -> Result<Self, Fault> {
        match value {
            Value::Null => Ok(None),
            other => V::from_value(other).map(Some),
        }
    }
}

/// Carries any serde type through the `Other` path.
#[derive(Debug, Clone, PartialEq)]
pub struct Serde<T>(pub T);

impl<T: Serialize> IntoValue for Serde<T> {
    fn into_value(self) -> Result<Value, Fault> {
        Value::serde(&self.0)
    }
}

impl<T: DeserializeOwned> FromValue for Serde<T> {
    fn from_value(value: Value) -> Result<Self, Fault> {
        match value {
            Value::Other(blob) => Ok(Serde(duopack::from_other(&blob)?)),
            other => Err(mismatch("serialized value", &other)),
        }
    }
}

impl IntoValue for Object {
    fn into_value(self) -> Result<Value, Fault> {
        Ok(Value::Object(self))
    }
}

impl IntoValue for AnyProxy {
    fn into_value(self) -> Result<Value, Fault> {
        Ok(Value::Proxy(self))
    }
}

impl FromValue for AnyProxy {
    fn from_value(value: Value) -> Result<Self, Fault> {
        match value {
            Value::Proxy(p) => Ok(p),
            Value::Object(o) => Ok(AnyProxy::from_object(o)),
            other => Err(mismatch("proxy", &other)),
        }
    }
}

impl<T: Remote> IntoValue for Arc<T> {
    fn into_value(self) -> Result<Value, Fault> {
        Ok(Value::Object(Object::new(self)))
    }
}

impl<T: Remote> FromValue for Arc<T> {
    fn expect() -> Expect {
        Expect::Instance(T::TYPE_NAME)
    }

    fn from_value(value: Value) -> Result<Self, Fault> {
        let found = match &value {
            Value::Object(o) => o.downcast::<T>(),
            Value::Proxy(p) => p.state.instance().and_then(|i| i.downcast::<T>().ok()),
            _ => None,
        };
        found.ok_or_else(|| mismatch(T::TYPE_NAME, &value))
    }
}

impl<T: Remote> IntoValue for RemoteProxy<T> {
    fn into_value(self) -> Result<Value, Fault> {
        Ok(Value::Proxy(self.into_any()))
    }
}

impl<T: Remote> FromValue for RemoteProxy<T> {
    fn from_value(value: Value) -> Result<Self, Fault> {
        let proxy = AnyProxy::from_value(value)?;
        proxy.downcast::<T>().map_err(|e| Fault::argument(e.to_string()))
    }
}
