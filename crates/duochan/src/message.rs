//! Message framing.
//!
//! Every pipe message starts with a `MessageKind` byte:
//!
//! ```text
//! Activation       [0][seq: i32][type ref]
//! Deactivation     [1][handle: i32]
//! MethodCall       [2][seq: i32][handle: i32][await: u8][method ref][argc: u8][value]*
//! ReturnValue      [3][seq: i32][value]
//! ReturnException  [4][seq: i32][fault as Other value]
//! ```

use duopack::Reader;
use duopack::Writer;

use crate::Handle;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Activation = 0,
    Deactivation = 1,
    MethodCall = 2,
    ReturnValue = 3,
    ReturnException = 4,
}

impl MessageKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Activation),
            1 => Some(Self::Deactivation),
            2 => Some(Self::MethodCall),
            3 => Some(Self::ReturnValue),
            4 => Some(Self::ReturnException),
            _ => None,
        }
    }
}

/// Starts a message that carries a sequence number.
pub(crate) fn begin(kind: MessageKind, seq: i32) -> Writer {
    let mut w = Writer::with_capacity(64);
    w.u8_raw(kind as u8);
    w.i32_raw(seq);
    w
}

pub(crate) fn deactivation(handle: Handle) -> Vec<u8> {
    let mut w = Writer::with_capacity(5);
    w.u8_raw(MessageKind::Deactivation as u8);
    w.i32_raw(handle.0);
    w.into_bytes()
}

/// The fixed part of a `MethodCall` after its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallHeader {
    pub handle: Handle,
    pub await_remote: bool,
}

impl CallHeader {
    pub fn encode(&self, w: &mut Writer) {
        w.i32_raw(self.handle.0);
        w.bool_raw(self.await_remote);
    }

    pub fn decode(r: &mut Reader) -> duopack::Result<Self> {
        Ok(Self { handle: Handle(r.i32_raw()?), await_remote: r.bool_raw()? })
    }
}
