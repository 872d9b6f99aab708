//! # Duochan
//!
//! Remote objects between two processes over shared memory.
//!
//! A `Channel` connects two endpoints through a pair of duopipe pipes. Either
//! side can activate objects on the other, call methods on them through a
//! `RemoteProxy<T>`, and pass proxies back and forth as arguments and results.
//! A proxy on an object that lives in the calling process skips the channel
//! entirely and dispatches directly.
//!
//! ## Philosophy
//!
//! - **No reflection**: types opt in by implementing `Remote` and describing
//!   their members once. Handlers are ordinary typed functions.
//! - **Handles, not pointers**: an object crosses the channel as a handle in
//!   its host's registry. The host keeps it alive until the peer deactivates
//!   it or the channel is disposed.
//! - **Replies are futures**: sending never blocks on the peer. The reader
//!   thread completes pending calls by sequence number, in any order.
//!
//! ## Example
//!
//! ```ignore
//! struct Counter(AtomicI32);
//!
//! impl Remote for Counter {
//!     const TYPE_NAME: &'static str = "demo.Counter";
//!
//!     fn describe(class: &mut Class<Self>) {
//!         class
//!             .constructor(|| Counter(AtomicI32::new(0)))
//!             .method("increment", Counter::increment);
//!     }
//! }
//!
//! let module = Module::builder("demo").register::<Counter>().build();
//! let owner = Channel::builder("demo").owner(true).module(module.clone()).open()?;
//! let guest = Channel::builder("demo").module(module).open()?;
//!
//! let counter = guest.activate::<Counter>()?.await?;
//! let n: i32 = counter.eval(Call::method("increment")).await?;
//! ```


mod builder;
mod channel;
mod codec;
mod error;
mod handler;
mod message;
mod module;
mod proxy;
mod value;

pub use builder::ChannelBuilder;
pub use channel::Channel;
pub use duopipe::PipeConfig;
pub use error::Error;
pub use error::Fault;
pub use error::FaultKind;
pub use error::Result;
pub use handler::AsyncMethod;
pub use handler::Returned;
pub use handler::SyncMethod;
pub use message::MessageKind;
pub use module::Class;
pub use module::ClassEntry;
pub use module::Instance;
pub use module::Member;
pub use module::MemberKind;
pub use module::Module;
pub use module::ModuleBuilder;
pub use module::Remote;
pub use module::TypeDesc;
pub use proxy::AnyProxy;
pub use proxy::Call;
pub use proxy::RemoteProxy;
pub use proxy::Reply;
pub use value::Expect;
pub use value::FromValue;
pub use value::IntoValue;
pub use value::Object;
pub use value::Serde;
pub use value::Value;

/// Channel-unique id of an exposed object. Zero means "not registered".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub i32);

impl Handle {
    pub const NONE: Handle = Handle(0);
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which end of a channel hosts an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(pub u8);

impl Endpoint {
    /// Not yet bound to any channel.
    pub const UNSET: Endpoint = Endpoint(0);
    pub const OWNER: Endpoint = Endpoint(1);
    pub const GUEST: Endpoint = Endpoint(2);

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::OWNER => write!(f, "owner"),
            Self::GUEST => write!(f, "guest"),
            Self::UNSET => write!(f, "unset"),
            Endpoint(other) => write!(f, "endpoint-{}", other),
        }
    }
}
