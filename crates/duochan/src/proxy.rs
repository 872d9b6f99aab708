//! # Remote Proxy
//!
//! A `RemoteProxy<T>` is a typed handle on an object that lives either in
//! this process or behind a channel. Calls go straight to the instance when
//! there is one; otherwise they are sent as `MethodCall` messages.
//!
//! ## States
//!
//! - **Local-only**: instance set, no channel.
//! - **Registered**: instance set, bound to a channel under a handle.
//! - **Remote-only**: no instance; channel, handle and endpoint set.
//! - **Disconnected**: neither instance nor channel.
//!
//! ## Invariants
//!
//! - All typed handles on one object share one `ProxyState`, so a cast
//!   proxy and its origin disconnect together.
//! - The disconnect callback runs at most once.
//! - A remote-only proxy sends at most one `Deactivation`, either from
//!   `disconnect` or when the last handle is dropped.

use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::Endpoint;
use crate::Handle;
use crate::channel::Shared;
use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::handler::Returned;
use crate::module::ClassEntry;
use crate::module::Instance;
use crate::module::MemberKind;
use crate::module::Remote;
use crate::module::TypeDesc;
use crate::value::FromValue;
use crate::value::IntoValue;
use crate::value::Object;
use crate::value::Value;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type InlineFn<T> = Box<dyn FnOnce(&T) -> Result<Value> + Send>;

pub(crate) enum Target<T> {
    Method(&'static str),
    Property(&'static str),
    /// Arbitrary code against the instance; only valid in-process.
    Inline(InlineFn<T>),
}

/// A call against a `T`: a method with arguments, a property read, or an
/// inline closure.
pub struct Call<T> {
    pub(crate) target: Target<T>,
    pub(crate) args: Vec<Value>,
    /// First argument that failed to convert; reported when the call runs.
    pub(crate) invalid: Option<Fault>,
}

impl<T: Remote> Call<T> {
    pub fn method(name: &'static str) -> Self {
        Self { target: Target::Method(name), args: Vec::new(), invalid: None }
    }

    pub fn property(name: &'static str) -> Self {
        Self { target: Target::Property(name), args: Vec::new(), invalid: None }
    }

    /// Runs `f` directly against a local instance. Rejected for remote targets.
    pub fn inline<R, F>(f: F) -> Self
    where
        F: FnOnce(&T) -> R + Send + 'static,
        R: IntoValue,
    {
        let f: InlineFn<T> = Box::new(move |this| Ok(f(this).into_value()?));
        Self { target: Target::Inline(f), args: Vec::new(), invalid: None }
    }

    pub fn arg(mut self, value: impl IntoValue) -> Self {
        match value.into_value() {
            Ok(value) => self.args.push(value),
            Err(fault) => {
                self.invalid.get_or_insert(fault);
            }
        }
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    /// Member name, or `None` for inline calls.
    pub fn member(&self) -> Option<(MemberKind, &'static str)> {
        match self.target {
            Target::Method(name) => Some((MemberKind::Method, name)),
            Target::Property(name) => Some((MemberKind::Property, name)),
            Target::Inline(_) => None,
        }
    }
}

/// A pending result. Local calls complete immediately.
pub struct Reply<T> {
    inner: BoxFuture<'static, Result<T>>,
}

impl<T: Send + 'static> Reply<T> {
    pub(crate) fn new(fut: impl Future<Output = Result<T>> + Send + 'static) -> Self {
        Self { inner: fut.boxed() }
    }

    pub(crate) fn ready(result: Result<T>) -> Self {
        Self::new(futures::future::ready(result))
    }
}

impl<T> Future for Reply<T> {
    type Output = Result<T>;

    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> std::fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Reply")
    }
}

struct ProxyInner {
    instance: Option<Instance>,
    actual: TypeDesc,
    channel: Option<Weak<Shared>>,
    handle: Handle,
    endpoint: Endpoint,
    on_disconnect: Option<Box<dyn FnOnce() + Send>>,
}

/// Point-in-time copy of a proxy's routing fields.
pub(crate) struct Snapshot {
    pub instance: Option<Instance>,
    pub actual: TypeDesc,
    pub channel: Option<Weak<Shared>>,
    pub handle: Handle,
    pub endpoint: Endpoint,
}

/// The shared state behind every handle on one object.
pub(crate) struct ProxyState {
    inner: Mutex<ProxyInner>,
}

impl ProxyState {
    pub(crate) fn local(instance: Instance, class: Arc<ClassEntry>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ProxyInner {
                instance: Some(instance),
                actual: TypeDesc::of(class),
                channel: None,
                handle: Handle::NONE,
                endpoint: Endpoint::UNSET,
                on_disconnect: None,
            }),
        })
    }

    pub(crate) fn remote(
        handle: Handle,
        endpoint: Endpoint,
        actual: TypeDesc,
        channel: Option<Weak<Shared>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ProxyInner {
                instance: None,
                actual,
                channel,
                handle,
                endpoint,
                on_disconnect: None,
            }),
        })
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let inner = lock(&self.inner);
        Snapshot {
            instance: inner.instance.clone(),
            actual: inner.actual.clone(),
            channel: inner.channel.clone(),
            handle: inner.handle,
            endpoint: inner.endpoint,
        }
    }

    pub(crate) fn instance(&self) -> Option<Instance> {
        lock(&self.inner).instance.clone()
    }

    /// The local instance with its class, if there is one.
    pub(crate) fn object(&self) -> Option<Object> {
        let inner = lock(&self.inner);
        let instance = inner.instance.clone()?;
        let class = inner.actual.class.clone()?;
        Some(Object::from_parts(instance, class))
    }

    pub(crate) fn actual(&self) -> TypeDesc {
        lock(&self.inner).actual.clone()
    }

    /// Records a registration with a channel.
    pub(crate) fn bind(&self, channel: Weak<Shared>, handle: Handle, endpoint: Endpoint) {
        let mut inner = lock(&self.inner);
        inner.channel = Some(channel);
        inner.handle = handle;
        inner.endpoint = endpoint;
    }

    pub(crate) fn set_on_disconnect(&self, callback: Box<dyn FnOnce() + Send>) {
        lock(&self.inner).on_disconnect = Some(callback);
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        let inner = lock(&self.inner);
        inner.instance.is_none() && inner.channel.is_none()
    }

    /// Forgets the channel binding after the peer released the object.
    ///
    /// The instance stays, so whoever else holds this proxy keeps calling it
    /// in-process.
    pub(crate) fn detach(&self) {
        let mut inner = lock(&self.inner);
        inner.channel = None;
        inner.handle = Handle::NONE;
        inner.endpoint = Endpoint::UNSET;
    }

    /// Runs the disconnect callback, then releases the instance and the
    /// channel binding. The proxy ends up disconnected for good.
    ///
    /// Remote-only proxies tell the peer to deactivate; registered local
    /// proxies are removed from their channel's registry.
    pub(crate) fn disconnect(self: &Arc<Self>) {
        let (callback, channel, handle, local) = {
            let mut inner = lock(&self.inner);
            let callback = inner.on_disconnect.take();
            let channel = inner.channel.take();
            let handle = std::mem::replace(&mut inner.handle, Handle::NONE);
            let local = inner.instance.take().is_some();
            (callback, channel, handle, local)
        };

        if let Some(callback) = callback {
            callback();
        }

        let Some(shared) = channel.and_then(|w| w.upgrade()) else {
            return;
        };
        if handle == Handle::NONE {
            return;
        }
        if local {
            shared.unregister(handle);
        } else {
            shared.forget_remote(handle, Arc::as_ptr(self));
            shared.internal_deactivate(handle);
        }
    }
}

impl Drop for ProxyState {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.instance.is_some() {
            return;
        }
        let callback = inner.on_disconnect.take();
        let channel = inner.channel.take();
        let handle = inner.handle;

        if let Some(callback) = callback {
            callback();
        }
        if handle == Handle::NONE {
            return;
        }
        if let Some(shared) = channel.and_then(|w| w.upgrade()) {
            tracing::trace!(%handle, "deactivating dropped proxy");
            shared.forget_remote(handle, self as *const ProxyState);
            shared.internal_deactivate(handle);
        }
    }
}

/// A proxy whose declared type is only known at runtime.
#[derive(Clone)]
pub struct AnyProxy {
    pub(crate) state: Arc<ProxyState>,
    declared: Cow<'static, str>,
}

impl AnyProxy {
    pub(crate) fn new(state: Arc<ProxyState>, declared: impl Into<Cow<'static, str>>) -> Self {
        Self { state, declared: declared.into() }
    }

    pub(crate) fn from_object(object: Object) -> Self {
        let declared = object.class.name();
        Self::new(ProxyState::local(object.instance, object.class), declared)
    }

    pub fn declared_type(&self) -> &str {
        &self.declared
    }

    pub fn object_type(&self) -> String {
        self.state.actual().name
    }

    pub fn handle(&self) -> Option<Handle> {
        let handle = self.state.snapshot().handle;
        (handle != Handle::NONE).then_some(handle)
    }

    pub fn is_local(&self) -> bool {
        self.state.instance().is_some()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.is_disconnected()
    }

    /// True if both are handles on the same object.
    pub fn same_proxy(&self, other: &AnyProxy) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Retypes the proxy as `U` if its declared or actual type allows it.
    pub fn downcast<U: Remote>(self) -> Result<RemoteProxy<U>> {
        if self.declared == U::TYPE_NAME || self.state.actual().is_assignable_to(U::TYPE_NAME) {
            return Ok(RemoteProxy::from_state(self.state));
        }
        Err(Error::Cast { from: self.state.actual().name, to: U::TYPE_NAME.to_string() })
    }
}

impl std::fmt::Debug for AnyProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.state.snapshot();
        f.debug_struct("AnyProxy")
            .field("declared", &self.declared)
            .field("actual", &snap.actual.name)
            .field("handle", &snap.handle)
            .field("endpoint", &snap.endpoint)
            .field("local", &snap.instance.is_some())
            .finish()
    }
}

/// A typed proxy on a `T` that may live in this process or the peer.
pub struct RemoteProxy<T: Remote> {
    state: Arc<ProxyState>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Remote> Clone for RemoteProxy<T> {
    fn clone(&self) -> Self {
        Self::from_state(self.state.clone())
    }
}

impl<T: Remote> From<Arc<T>> for RemoteProxy<T> {
    fn from(instance: Arc<T>) -> Self {
        Self::new(instance)
    }
}

impl<T: Remote> RemoteProxy<T> {
    /// Wraps a local instance. Calls run in-process until it is exposed.
    pub fn new(instance: Arc<T>) -> Self {
        Self::from_state(ProxyState::local(instance, ClassEntry::of::<T>()))
    }

    pub(crate) fn from_state(state: Arc<ProxyState>) -> Self {
        Self { state, _marker: PhantomData }
    }

    pub fn into_any(self) -> AnyProxy {
        AnyProxy::new(self.state, T::TYPE_NAME)
    }

    /// The local instance, if this proxy has one and it is a `T`.
    pub fn instance(&self) -> Option<Arc<T>> {
        self.state.instance()?.downcast::<T>().ok()
    }

    pub fn is_local(&self) -> bool {
        self.state.instance().is_some()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.is_disconnected()
    }

    /// Channel handle, once registered or when remote.
    pub fn handle(&self) -> Option<Handle> {
        let handle = self.state.snapshot().handle;
        (handle != Handle::NONE).then_some(handle)
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        let endpoint = self.state.snapshot().endpoint;
        endpoint.is_set().then_some(endpoint)
    }

    /// Runtime type of the object, which may differ from `T`.
    pub fn object_type(&self) -> String {
        self.state.actual().name
    }

    /// Fails if the object lives in this process.
    pub fn assert_remote(&self) -> Result<()> {
        if self.is_local() {
            return Err(Error::NotRemote { type_name: self.object_type() });
        }
        Ok(())
    }

    /// Installs a callback run once when the proxy disconnects.
    pub fn on_disconnect(&self, callback: impl FnOnce() + Send + 'static) {
        self.state.set_on_disconnect(Box::new(callback));
    }

    /// Releases the object. Idempotent.
    pub fn disconnect(&self) {
        self.state.disconnect();
    }

    /// A handle on the same object typed as `U`.
    pub fn cast_to<U: Remote>(&self) -> Result<RemoteProxy<U>> {
        let actual = self.state.actual();
        if !actual.is_assignable_to(U::TYPE_NAME) {
            return Err(Error::Cast { from: actual.name, to: U::TYPE_NAME.to_string() });
        }
        Ok(RemoteProxy::from_state(self.state.clone()))
    }

    pub fn run(&self, call: Call<T>) -> Reply<()> {
        self.dispatch(call, false)
    }

    pub fn eval<R: FromValue + Send + 'static>(&self, call: Call<T>) -> Reply<R> {
        self.dispatch(call, false)
    }

    /// Like `run`, but an asynchronous method is awaited before replying.
    pub fn run_async(&self, call: Call<T>) -> Reply<()> {
        self.dispatch(call, true)
    }

    pub fn eval_async<R: FromValue + Send + 'static>(&self, call: Call<T>) -> Reply<R> {
        self.dispatch(call, true)
    }

    fn dispatch<R: FromValue + Send + 'static>(&self, call: Call<T>, await_remote: bool) -> Reply<R> {
        let snap = self.state.snapshot();

        if let Some(instance) = snap.instance {
            return match invoke_local(instance, &snap.actual, call, await_remote) {
                Ok(Returned::Ready(value)) => Reply::ready(R::from_value(value).map_err(Error::Fault)),
                Ok(Returned::Pending(fut)) => Reply::new(async move {
                    let value = fut.await?;
                    Ok(R::from_value(value)?)
                }),
                Err(e) => Reply::ready(Err(e)),
            };
        }

        let Some(channel) = snap.channel else {
            return Reply::ready(Err(Error::Disconnected { type_name: snap.actual.name }));
        };
        let Some(shared) = channel.upgrade() else {
            return Reply::ready(Err(Error::ChannelDisposed));
        };
        match shared.call::<T, R>(snap.handle, &snap.actual, call, await_remote) {
            Ok(reply) => reply,
            Err(e) => Reply::ready(Err(e)),
        }
    }
}

impl<T: Remote> std::fmt::Debug for RemoteProxy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.state.snapshot();
        f.debug_struct("RemoteProxy")
            .field("declared", &T::TYPE_NAME)
            .field("actual", &snap.actual.name)
            .field("handle", &snap.handle)
            .field("endpoint", &snap.endpoint)
            .field("local", &snap.instance.is_some())
            .finish()
    }
}

/// In-process dispatch through the instance's class table.
fn invoke_local<T: Remote>(
    instance: Instance,
    actual: &TypeDesc,
    call: Call<T>,
    await_remote: bool,
) -> Result<Returned> {
    if let Some(fault) = call.invalid {
        return Err(fault.into());
    }

    let (kind, name) = match call.target {
        Target::Inline(f) => {
            let this = instance.downcast::<T>().map_err(|_| {
                Error::Contract(format!("inline call on {} needs a {}", actual.name, T::TYPE_NAME))
            })?;
            return Ok(Returned::Ready(f(&this)?));
        }
        Target::Method(name) => (MemberKind::Method, name),
        Target::Property(name) => (MemberKind::Property, name),
    };

    let class = actual
        .class
        .as_ref()
        .ok_or_else(|| Error::Contract(format!("{} has no class table", actual.name)))?;
    let (_, member) = class
        .member(kind, name)
        .ok_or_else(|| Fault::unknown_member(class.name(), name))?;
    if member.is_async && !await_remote {
        return Err(Error::Contract(async_without_await(class.name(), name)));
    }
    Ok((member.invoke)(instance, call.args)?)
}

pub(crate) fn async_without_await(type_name: &str, member: &str) -> String {
    format!("{}.{} is asynchronous; call it with run_async or eval_async", type_name, member)
}
