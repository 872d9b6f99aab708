//! # Channel
//!
//! One end of a bidirectional remote-object channel. A channel owns an
//! outbound and an inbound shared memory pipe, the registry of local objects
//! it has exposed, and the table of calls awaiting a reply.
//!
//! ## Architecture
//!
//! - Outbound messages are written synchronously under the pipe mutex; the
//!   caller then awaits a `Reply` completed by the reader thread.
//! - The reader thread decodes every inbound message. Replies complete
//!   pending calls in place; activations and deactivations are handled in
//!   place; method calls are spawned onto the tokio runtime captured when the
//!   channel was opened, and reply when the invocation finishes.
//! - Sequence numbers and handles are per-channel counters starting at 1.
//!
//! ## Invariants
//!
//! - A local instance has at most one registration.
//! - A pending call is completed exactly once: by its reply, or by disposal.
//! - After disposal new calls fail with `ChannelDisposed` and everything
//!   else the channel would send is silently dropped.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use duopack::Reader;
use duopack::Writer;
use duopipe::InPipe;
use duopipe::OutPipe;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::Endpoint;
use crate::Handle;
use crate::builder::ChannelBuilder;
use crate::codec::ProxyTable;
use crate::codec::decode_value;
use crate::codec::encode_value;
use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::handler::Returned;
use crate::message;
use crate::message::CallHeader;
use crate::message::MessageKind;
use crate::module::ClassEntry;
use crate::module::Instance;
use crate::module::Module;
use crate::module::Remote;
use crate::module::TypeDesc;
use crate::proxy::AnyProxy;
use crate::proxy::Call;
use crate::proxy::ProxyState;
use crate::proxy::RemoteProxy;
use crate::proxy::Reply;
use crate::proxy::Target;
use crate::proxy::async_without_await;
use crate::proxy::lock;
use crate::value::Expect;
use crate::value::FromValue;
use crate::value::Value;
use crate::value::instance_key;

/// Completion side of a call awaiting its reply.
struct Pending {
    expect: Expect,
    tx: oneshot::Sender<std::result::Result<Value, Fault>>,
}

#[derive(Default)]
struct Registry {
    by_handle: HashMap<Handle, Arc<ProxyState>>,
    by_instance: HashMap<usize, Handle>,
    /// Live proxies on peer objects, so a handle received twice maps to one proxy.
    remotes: HashMap<Handle, Weak<ProxyState>>,
}

/// State shared by the `Channel` handle, its reader thread, spawned
/// invocations and every proxy bound to it.
pub(crate) struct Shared {
    name: String,
    endpoint: Endpoint,
    module: Arc<Module>,
    runtime: tokio::runtime::Handle,
    this: Weak<Shared>,
    outbound: Mutex<Option<OutPipe>>,
    inbound: Mutex<Option<InPipe>>,
    registry: Mutex<Registry>,
    pending: DashMap<i32, Pending>,
    next_seq: AtomicI32,
    next_handle: AtomicI32,
    disposed: AtomicBool,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// A bidirectional remote-object channel. Disposed on drop.
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    pub fn builder(name: impl Into<String>) -> ChannelBuilder {
        ChannelBuilder::new(name)
    }

    pub(crate) fn open(builder: ChannelBuilder) -> Result<Self> {
        let runtime = match builder.runtime {
            Some(runtime) => runtime,
            None => tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?,
        };
        let endpoint = if builder.owner { Endpoint::OWNER } else { Endpoint::GUEST };
        let (out_name, in_name) = pipe_names(&builder.name, builder.owner);

        let shared = Arc::new_cyclic(|this| Shared {
            name: builder.name.clone(),
            endpoint,
            module: builder.module.clone(),
            runtime,
            this: this.clone(),
            outbound: Mutex::new(None),
            inbound: Mutex::new(None),
            registry: Mutex::new(Registry::default()),
            pending: DashMap::new(),
            next_seq: AtomicI32::new(1),
            next_handle: AtomicI32::new(1),
            disposed: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&shared);
        let failed = weak.clone();
        let inbound = InPipe::open_with_failure(
            &in_name,
            builder.owner,
            builder.pipe.clone(),
            move |bytes| {
                if let Some(shared) = weak.upgrade() {
                    shared.receive(&bytes);
                }
            },
            move |e| {
                if let Some(shared) = failed.upgrade() {
                    shared.reader_failed(e);
                }
            },
        )?;
        let outbound = OutPipe::open(&out_name, builder.owner, builder.pipe.clone())?;
        *lock(&shared.inbound) = Some(inbound);
        *lock(&shared.outbound) = Some(outbound);

        debug!(channel = %shared.name, %endpoint, module = shared.module.name(), "opened channel");
        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint
    }

    pub fn is_owner(&self) -> bool {
        self.shared.endpoint == Endpoint::OWNER
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.shared.module
    }

    /// Asks the peer to construct a `T` and returns a proxy on it.
    pub fn activate<T: Remote>(&self) -> Result<Reply<RemoteProxy<T>>> {
        self.shared.activate::<T>()
    }

    /// Sends a call against `handle` on the peer, resolving members on `T`.
    pub fn send_method_call<T, R>(&self, handle: Handle, call: Call<T>, await_remote: bool) -> Result<Reply<R>>
    where
        T: Remote,
        R: FromValue + Send + 'static,
    {
        let class = self.shared.module.class_of::<T>().cloned().unwrap_or_else(ClassEntry::of::<T>);
        self.shared.call(handle, &TypeDesc::of(class), call, await_remote)
    }

    /// Exposes a local proxy on this channel, returning its handle.
    /// An instance already exposed keeps its existing handle.
    pub fn register_local_proxy<T: Remote>(&self, proxy: &RemoteProxy<T>) -> Result<Handle> {
        let any = proxy.clone().into_any();
        Ok(self.shared.register_local(&any.state)?)
    }

    /// The proxy registered under `handle`, if any.
    pub fn find_proxy(&self, handle: Handle) -> Option<AnyProxy> {
        let state = self.shared.find_local(handle)?;
        let declared = state.actual().name;
        Some(AnyProxy::new(state, declared))
    }

    /// Tells the peer to drop `handle`. No-op once disposed.
    pub fn internal_deactivate(&self, handle: Handle) {
        self.shared.internal_deactivate(handle);
    }

    pub fn dispose(&self) {
        self.shared.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    pub fn messages_received(&self) -> u64 {
        self.shared.messages_received.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.shared.messages_sent.load(Ordering::Relaxed)
    }

    /// Local objects currently exposed to the peer.
    pub fn registered_count(&self) -> usize {
        lock(&self.shared.registry).by_handle.len()
    }

    /// Calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.shared.name)
            .field("endpoint", &self.shared.endpoint)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Owner writes `.A` and reads `.B`; the guest the reverse.
fn pipe_names(name: &str, owner: bool) -> (String, String) {
    let a = format!("{}.A", name);
    let b = format!("{}.B", name);
    if owner { (a, b) } else { (b, a) }
}

async fn await_reply(rx: oneshot::Receiver<std::result::Result<Value, Fault>>) -> Result<Value> {
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(Error::Fault(fault)),
        Err(_) => Err(Error::ChannelDisposed),
    }
}

impl Shared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::ChannelDisposed);
        }
        Ok(())
    }

    fn next_seq(&self) -> i32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut outbound = lock(&self.outbound);
        let pipe = outbound.as_mut().ok_or(Error::ChannelDisposed)?;
        pipe.write(bytes)?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sends a message nobody waits on; failures are only logged.
    fn post(&self, bytes: &[u8]) {
        if self.is_disposed() {
            return;
        }
        match self.send(bytes) {
            Ok(()) | Err(Error::ChannelDisposed) => {}
            Err(e) => warn!(channel = %self.name, error = %e, "failed to send message"),
        }
    }

    /// Registers a pending reply and sends `w`; the entry is removed again if
    /// the send fails.
    fn send_request(&self, seq: i32, w: Writer, expect: Expect) -> Result<oneshot::Receiver<std::result::Result<Value, Fault>>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, Pending { expect, tx });
        if let Err(e) = self.send(w.as_bytes()) {
            self.pending.remove(&seq);
            return Err(e);
        }
        Ok(rx)
    }

    fn activate<T: Remote>(&self) -> Result<Reply<RemoteProxy<T>>> {
        self.ensure_open()?;
        let seq = self.next_seq();
        let mut w = message::begin(MessageKind::Activation, seq);
        self.module.write_type_ref(&mut w, T::TYPE_NAME)?;

        let rx = self.send_request(seq, w, Expect::Any)?;
        trace!(channel = %self.name, seq, type_name = T::TYPE_NAME, "sent activation");
        Ok(Reply::new(async move {
            let value = await_reply(rx).await?;
            Ok(RemoteProxy::<T>::from_value(value)?)
        }))
    }

    pub(crate) fn call<T, R>(&self, handle: Handle, target: &TypeDesc, call: Call<T>, await_remote: bool) -> Result<Reply<R>>
    where
        T: Remote,
        R: FromValue + Send + 'static,
    {
        self.ensure_open()?;
        if let Some(fault) = call.invalid {
            return Err(fault.into());
        }
        let (kind, member) = match call.target {
            Target::Method(name) => (crate::module::MemberKind::Method, name),
            Target::Property(name) => (crate::module::MemberKind::Property, name),
            Target::Inline(_) => {
                return Err(Error::Contract(
                    "Only method calls and property reads can be serialized".to_string(),
                ));
            }
        };
        let argc = u8::try_from(call.args.len())
            .map_err(|_| Error::Contract(format!("{} arguments exceed the limit of 255", call.args.len())))?;
        if let Some(class) = &target.class {
            if let Some((_, m)) = class.member(kind, member) {
                if m.is_async() && !await_remote {
                    return Err(Error::Contract(async_without_await(class.name(), member)));
                }
            }
        }

        let seq = self.next_seq();
        let mut w = message::begin(MessageKind::MethodCall, seq);
        CallHeader { handle, await_remote }.encode(&mut w);
        self.module.write_method_ref(&mut w, target, kind, member)?;
        w.u8_raw(argc);
        for arg in &call.args {
            encode_value(self, &mut w, arg)?;
        }

        let rx = self.send_request(seq, w, R::expect())?;
        trace!(channel = %self.name, seq, %handle, member, "sent method call");
        Ok(Reply::new(async move {
            let value = await_reply(rx).await?;
            Ok(R::from_value(value)?)
        }))
    }

    pub(crate) fn internal_deactivate(&self, handle: Handle) {
        if self.is_disposed() {
            return;
        }
        trace!(channel = %self.name, %handle, "sent deactivation");
        self.post(&message::deactivation(handle));
    }

    pub(crate) fn unregister(&self, handle: Handle) -> Option<Arc<ProxyState>> {
        let mut registry = lock(&self.registry);
        let state = registry.by_handle.remove(&handle)?;
        // The instance may already be gone from a disconnected proxy.
        registry.by_instance.retain(|_, registered| *registered != handle);
        Some(state)
    }

    /// Drops the cached entry for a remote proxy that is going away.
    pub(crate) fn forget_remote(&self, handle: Handle, state: *const ProxyState) {
        let mut registry = lock(&self.registry);
        if registry.remotes.get(&handle).is_some_and(|w| std::ptr::eq(w.as_ptr(), state)) {
            registry.remotes.remove(&handle);
        }
    }

    /// The inbound stream is unreadable, so no reply can arrive any more.
    fn reader_failed(&self, e: duopipe::Error) {
        warn!(channel = %self.name, error = %e, "inbound pipe failed; disposing channel");
        self.dispose();
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The outbound pipe goes first: a request that registers itself
        // after the pending table is cleared then fails to send and removes
        // its own entry.
        let outbound = lock(&self.outbound).take();
        // Proxy teardown may call back into the channel, so nothing is
        // dropped while a lock is held.
        let registry = std::mem::take(&mut *lock(&self.registry));
        let cancelled = self.pending.len();
        self.pending.clear();
        let inbound = lock(&self.inbound).take();
        drop(inbound);
        drop(outbound);
        let exposed = registry.by_handle.len();
        drop(registry);
        debug!(channel = %self.name, exposed, cancelled, "disposed channel");
    }

    // ------------------------------------------------------------------------
    //  Inbound
    // ------------------------------------------------------------------------

    fn receive(&self, bytes: &[u8]) {
        if self.is_disposed() {
            return;
        }
        self.messages_received.fetch_add(1, Ordering::Relaxed);

        let mut r = Reader::new(bytes);
        let result = match r.u8_raw().map(MessageKind::from_u8) {
            Ok(Some(MessageKind::ReturnValue)) => self.receive_return(&mut r, false),
            Ok(Some(MessageKind::ReturnException)) => self.receive_return(&mut r, true),
            Ok(Some(MessageKind::MethodCall)) => self.receive_call(&mut r),
            Ok(Some(MessageKind::Activation)) => self.receive_activation(&mut r),
            Ok(Some(MessageKind::Deactivation)) => self.receive_deactivation(&mut r),
            Ok(None) => Err(Fault::protocol("unknown message kind")),
            Err(e) => Err(e.into()),
        };
        if let Err(fault) = result {
            warn!(channel = %self.name, error = %fault, "dropped malformed message");
        }
    }

    fn receive_return(&self, r: &mut Reader, failed: bool) -> std::result::Result<(), Fault> {
        let seq = r.i32_raw()?;
        let expect = self.pending.get(&seq).map(|p| p.expect).unwrap_or(Expect::Any);
        let decoded = decode_value(self, r, expect);

        let Some((_, pending)) = self.pending.remove(&seq) else {
            trace!(channel = %self.name, seq, "dropped orphaned reply");
            return Ok(());
        };
        let outcome = match decoded {
            Ok(value) if failed => Err(fault_from_value(value)),
            other => other,
        };
        let _ = pending.tx.send(outcome);
        Ok(())
    }

    fn receive_call(&self, r: &mut Reader) -> std::result::Result<(), Fault> {
        let seq = r.i32_raw()?;
        let prepared = self.prepare_invocation(r);
        let Some(shared) = self.this.upgrade() else {
            return Ok(());
        };

        self.runtime.spawn(async move {
            let outcome = match prepared {
                Ok(invocation) => AssertUnwindSafe(invocation.run())
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(Fault::invocation("method panicked"))),
                Err(fault) => Err(fault),
            };
            shared.send_reply(seq, outcome);
        });
        Ok(())
    }

    /// Decodes the rest of a call. Any failure here is replied to the caller.
    fn prepare_invocation(&self, r: &mut Reader) -> std::result::Result<Invocation, Fault> {
        let header = CallHeader::decode(r)?;
        let (class, index) = self.module.read_method_ref(r)?;
        let member = class
            .member_at(index)
            .ok_or_else(|| Fault::unknown_member(class.name(), &format!("#{}", index)))?;

        let argc = r.u8_raw()? as usize;
        let mut args = Vec::with_capacity(argc);
        for i in 0..argc {
            let expect = member.params.get(i).copied().unwrap_or(Expect::Any);
            args.push(decode_value(self, r, expect)?);
        }

        let instance = self
            .find_local(header.handle)
            .and_then(|state| state.instance())
            .ok_or_else(|| Fault::disposed(header.handle, class.name()))?;
        if member.is_async() && !header.await_remote {
            return Err(Fault::contract(async_without_await(class.name(), member.name())));
        }
        Ok(Invocation { instance, class, index, args })
    }

    fn send_reply(&self, seq: i32, outcome: std::result::Result<Value, Fault>) {
        let bytes = match outcome {
            Ok(value) => {
                let mut w = message::begin(MessageKind::ReturnValue, seq);
                match encode_value(self, &mut w, &value) {
                    Ok(()) => w.into_bytes(),
                    Err(fault) => self.encode_fault(seq, &fault),
                }
            }
            Err(fault) => self.encode_fault(seq, &fault),
        };
        self.post(&bytes);
    }

    fn encode_fault(&self, seq: i32, fault: &Fault) -> Vec<u8> {
        let mut w = message::begin(MessageKind::ReturnException, seq);
        if let Err(e) = w.serde(fault) {
            warn!(channel = %self.name, seq, error = %e, "fault could not be serialized");
            let mut w = message::begin(MessageKind::ReturnException, seq);
            w.null();
            return w.into_bytes();
        }
        w.into_bytes()
    }

    fn receive_activation(&self, r: &mut Reader) -> std::result::Result<(), Fault> {
        let seq = r.i32_raw()?;
        let outcome = self.activate_local(r);
        if let Err(fault) = &outcome {
            debug!(channel = %self.name, seq, error = %fault, "activation failed");
        }
        self.send_reply(seq, outcome);
        Ok(())
    }

    fn activate_local(&self, r: &mut Reader) -> std::result::Result<Value, Fault> {
        let desc = self.module.read_type_ref(r)?;
        let class = desc.class.ok_or_else(|| Fault::unknown_type(&desc.name))?;
        let instance = class.construct()?;
        let declared = class.name();
        let state = ProxyState::local(instance, class);
        self.register_local(&state)?;
        Ok(Value::Proxy(AnyProxy::new(state, declared)))
    }

    fn receive_deactivation(&self, r: &mut Reader) -> std::result::Result<(), Fault> {
        let handle = Handle(r.i32_raw()?);
        match self.unregister(handle) {
            Some(state) => {
                trace!(channel = %self.name, %handle, "deactivated");
                state.detach();
            }
            None => trace!(channel = %self.name, %handle, "deactivation for unknown handle"),
        }
        Ok(())
    }
}

fn fault_from_value(value: Value) -> Fault {
    match value {
        Value::Other(blob) => duopack::from_other(&blob).unwrap_or_else(Fault::from),
        other => Fault::protocol(format!("exception reply carried {}", other.kind())),
    }
}

/// A decoded call ready to run against a local instance.
struct Invocation {
    instance: Instance,
    class: Arc<ClassEntry>,
    index: usize,
    args: Vec<Value>,
}

impl Invocation {
    async fn run(self) -> std::result::Result<Value, Fault> {
        let member = self
            .class
            .member_at(self.index)
            .ok_or_else(|| Fault::unknown_member(self.class.name(), &format!("#{}", self.index)))?;
        match (member.invoke)(self.instance, self.args)? {
            Returned::Ready(value) => Ok(value),
            Returned::Pending(fut) => fut.await,
        }
    }
}

impl ProxyTable for Shared {
    fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn module(&self) -> &Module {
        &self.module
    }

    fn register_local(&self, state: &Arc<ProxyState>) -> std::result::Result<Handle, Fault> {
        let instance = state
            .instance()
            .ok_or_else(|| Fault::contract("only proxies with a local instance can be registered"))?;
        let key = instance_key(&instance);

        let mut registry = lock(&self.registry);
        if let Some(handle) = registry.by_instance.get(&key).copied() {
            state.bind(self.this.clone(), handle, self.endpoint);
            return Ok(handle);
        }
        let handle = Handle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state.bind(self.this.clone(), handle, self.endpoint);
        registry.by_handle.insert(handle, state.clone());
        registry.by_instance.insert(key, handle);
        trace!(channel = %self.name, %handle, "registered local proxy");
        Ok(handle)
    }

    fn find_local(&self, handle: Handle) -> Option<Arc<ProxyState>> {
        lock(&self.registry).by_handle.get(&handle).cloned()
    }

    fn bind_remote(&self, handle: Handle, endpoint: Endpoint, actual: TypeDesc) -> Arc<ProxyState> {
        let mut registry = lock(&self.registry);
        if let Some(state) = registry.remotes.get(&handle).and_then(Weak::upgrade) {
            return state;
        }
        let state = ProxyState::remote(handle, endpoint, actual, Some(self.this.clone()));
        registry.remotes.insert(handle, Arc::downgrade(&state));
        state
    }
}
