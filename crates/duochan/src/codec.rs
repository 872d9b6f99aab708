//! Proxy-aware value codec.
//!
//! Scalars and `Other` blobs are delegated to duopack. Proxies are written as
//! `[Proxy][declared type ref][actual type ref][handle: i32][endpoint: u8]`
//! and need a `ProxyTable` to give handles meaning: encoding registers local
//! instances, decoding either finds a local registration (own endpoint) or
//! binds a remote proxy (peer endpoint).

use std::sync::Arc;

use duopack::Reader;
use duopack::Tag;
use duopack::Writer;

use crate::Endpoint;
use crate::Handle;
use crate::error::Fault;
use crate::module::Module;
use crate::module::TypeDesc;
use crate::proxy::AnyProxy;
use crate::proxy::ProxyState;
use crate::value::Expect;
use crate::value::Value;

/// The registry side of a channel, as seen by the codec.
pub(crate) trait ProxyTable {
    fn endpoint(&self) -> Endpoint;

    fn module(&self) -> &Module;

    /// Registers a proxy holding a local instance, at most once per instance.
    fn register_local(&self, state: &Arc<ProxyState>) -> Result<Handle, Fault>;

    fn find_local(&self, handle: Handle) -> Option<Arc<ProxyState>>;

    /// A proxy on an object hosted by the peer.
    fn bind_remote(&self, handle: Handle, endpoint: Endpoint, actual: TypeDesc) -> Arc<ProxyState>;
}

pub(crate) fn encode_value<P: ProxyTable + ?Sized>(table: &P, w: &mut Writer, value: &Value) -> Result<(), Fault> {
    match value {
        Value::Null => w.null(),
        Value::Bool(v) => w.bool(*v),
        Value::Byte(v) => w.byte(*v),
        Value::Char(v) => w.char(*v),
        Value::String(v) => w.string(v)?,
        Value::Int32(v) => w.int32(*v),
        Value::Other(blob) => w.other(blob)?,
        Value::Proxy(proxy) => encode_proxy(table, w, &proxy.state, proxy.declared_type())?,
        Value::Object(object) => {
            let state = ProxyState::local(object.instance.clone(), object.class.clone());
            encode_proxy(table, w, &state, object.class.name())?
        }
    }
    Ok(())
}

fn encode_proxy<P: ProxyTable + ?Sized>(
    table: &P,
    w: &mut Writer,
    state: &Arc<ProxyState>,
    declared: &str,
) -> Result<(), Fault> {
    let snap = state.snapshot();
    let (handle, endpoint) = if snap.instance.is_some() {
        (table.register_local(state)?, table.endpoint())
    } else if snap.endpoint.is_set() {
        (snap.handle, snap.endpoint)
    } else {
        (snap.handle, table.endpoint())
    };

    w.tag(Tag::Proxy);
    table.module().write_type_ref(w, declared)?;
    table.module().write_type_ref(w, &snap.actual.name)?;
    w.i32_raw(handle.0);
    w.u8_raw(endpoint.0);
    Ok(())
}

pub(crate) fn decode_value<P: ProxyTable + ?Sized>(table: &P, r: &mut Reader, expect: Expect) -> Result<Value, Fault> {
    let value = match r.tag()? {
        Tag::Null => Value::Null,
        Tag::False => Value::Bool(false),
        Tag::True => Value::Bool(true),
        Tag::Byte => Value::Byte(r.u8_raw()?),
        Tag::Char => Value::Char(r.char_body()?),
        Tag::String => Value::String(r.str_raw()?.to_string()),
        Tag::Int32 => Value::Int32(r.i32_raw()?),
        Tag::Other => Value::Other(r.blob_raw()?.to_vec()),
        Tag::Proxy => decode_proxy(table, r, expect)?,
    };
    Ok(value)
}

fn decode_proxy<P: ProxyTable + ?Sized>(table: &P, r: &mut Reader, expect: Expect) -> Result<Value, Fault> {
    let declared = table.module().read_type_ref(r)?;
    let actual = table.module().read_type_ref(r)?;
    let handle = Handle(r.i32_raw()?);
    let endpoint = Endpoint(r.u8_raw()?);

    if handle == Handle::NONE {
        return Err(Fault::disposed(handle, &declared.name));
    }

    if endpoint != table.endpoint() {
        let state = table.bind_remote(handle, endpoint, actual);
        return Ok(Value::Proxy(AnyProxy::new(state, declared.name)));
    }

    let state = table
        .find_local(handle)
        .ok_or_else(|| Fault::disposed(handle, &declared.name))?;
    if let Expect::Instance(type_name) = expect {
        if let Some(object) = state.object() {
            if object.class.is_assignable_to(type_name) {
                return Ok(Value::Object(object));
            }
        }
    }
    Ok(Value::Proxy(AnyProxy::new(state, declared.name)))
}
