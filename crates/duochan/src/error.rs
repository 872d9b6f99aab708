//! # Errors
//!
//! Two layers. `Fault` is what travels: a serializable description of a
//! failure that happened while resolving, activating or invoking something,
//! on either side of the channel. `Error` is what a local caller sees, and
//! wraps a `Fault` alongside failures that never leave the process.

use serde::Deserialize;
use serde::Serialize;

use crate::Handle;

/// Broad category of a `Fault`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// The target object is no longer registered.
    Disposed,
    /// The invoked method reported a failure.
    Invocation,
    /// The target type could not be constructed.
    Activation,
    /// The call was not valid for the target.
    Contract,
    /// An argument or result had the wrong shape.
    Argument,
    /// A type reference did not resolve.
    UnknownType,
    /// A method reference did not resolve.
    UnknownMember,
    /// The message itself was malformed.
    Protocol,
}

/// A failure that can be sent across the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    /// Best available name of the type involved.
    pub type_name: Option<String>,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self { kind, type_name: None, message: message.into() }
    }

    /// The error a method handler reports for a failed operation.
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Invocation, message)
    }

    pub fn disposed(handle: Handle, type_name: &str) -> Self {
        Self::new(FaultKind::Disposed, format!("Proxy {} is disposed. Type: {}", handle, type_name))
            .with_type(type_name)
    }

    pub fn activation(type_name: &str, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Activation, message).with_type(type_name)
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Contract, message)
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Argument, message)
    }

    pub fn unknown_type(type_name: &str) -> Self {
        Self::new(FaultKind::UnknownType, format!("Type {} is not registered", type_name))
            .with_type(type_name)
    }

    pub fn unknown_member(type_name: &str, member: &str) -> Self {
        Self::new(FaultKind::UnknownMember, format!("{} has no member {}", type_name, member))
            .with_type(type_name)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Protocol, message)
    }

    pub fn with_type(mut self, type_name: &str) -> Self {
        self.type_name = Some(type_name.to_string());
        self
    }

    pub fn is_disposed(&self) -> bool {
        self.kind == FaultKind::Disposed
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

impl From<duopack::Error> for Fault {
    fn from(e: duopack::Error) -> Self {
        Self::protocol(e.to_string())
    }
}

/// Errors surfaced to local callers.
#[derive(Debug)]
pub enum Error {
    /// The shared memory transport failed.
    Pipe(duopipe::Error),
    /// A message could not be encoded.
    Pack(duopack::Error),
    /// Resolution, activation or invocation failed, locally or remotely.
    Fault(Fault),
    /// The channel was disposed before or while the call was pending.
    ChannelDisposed,
    /// Channels must be opened inside a tokio runtime.
    NoRuntime,
    /// The proxy has neither a local instance nor a channel.
    Disconnected { type_name: String },
    /// The call cannot be expressed for this target; nothing was sent.
    Contract(String),
    /// `assert_remote` found a local instance.
    NotRemote { type_name: String },
    /// The proxy's actual type is not assignable to the requested one.
    Cast { from: String, to: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipe(e) => write!(f, "Pipe error: {}", e),
            Self::Pack(e) => write!(f, "Encoding error: {}", e),
            Self::Fault(fault) => write!(f, "{}", fault),
            Self::ChannelDisposed => write!(f, "Channel has been disposed"),
            Self::NoRuntime => write!(f, "Channel must be opened within a tokio runtime"),
            Self::Disconnected { type_name } => write!(f, "Proxy<{}> is disconnected", type_name),
            Self::Contract(msg) => write!(f, "Contract violation: {}", msg),
            Self::NotRemote { type_name } => write!(f, "Proxy<{}> is not remote", type_name),
            Self::Cast { from, to } => write!(f, "Cannot cast from {} to {}", from, to),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pipe(e) => Some(e),
            Self::Pack(e) => Some(e),
            Self::Fault(e) => Some(e),
            _ => None,
        }
    }
}

impl From<duopipe::Error> for Error {
    fn from(e: duopipe::Error) -> Self {
        Self::Pipe(e)
    }
}

impl From<duopack::Error> for Error {
    fn from(e: duopack::Error) -> Self {
        Self::Pack(e)
    }
}

impl From<Fault> for Error {
    fn from(e: Fault) -> Self {
        Self::Fault(e)
    }
}

impl Error {
    /// True if the target object had already been deactivated.
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Fault(fault) if fault.is_disposed())
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
