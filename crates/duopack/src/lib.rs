//! # Duopack
//!
//! The byte-level value codec spoken over a duo channel.
//!
//! ## Philosophy
//!
//! - **Fast paths first**: the handful of scalars that dominate method calls
//!   (null, booleans, bytes, chars, strings, 32-bit ints) get a one byte tag
//!   and a fixed little-endian payload. No allocation beyond the buffer.
//! - **One escape hatch**: everything else travels as an `Other` blob produced
//!   by a general-purpose serializer (MessagePack through `rmp-serde`).
//! - **Bounded**: the `Reader` is a zero-copy, bounds-checked view. A short
//!   buffer is always an `UnexpectedEnd`, never a panic.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Strings**: `[Tag: 1b][Len: 4b][UTF-8: Len]`
//! - **Other**: `[Tag: 1b][Len: 4b][MessagePack: Len]`
//!
//! Proxy values share the `Proxy` tag but their body is written by the channel
//! layer, which owns the registry that gives handles their meaning.


use serde::Serialize;
use serde::de::DeserializeOwned;

/// Duopack serialization and deserialization errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Byte does not correspond to a valid `Tag`.
    InvalidTag(u8),
    /// A specific tag was required but another one was found.
    UnexpectedTag { expected: Tag, actual: Tag },
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// Encoded char is not a Unicode scalar value.
    InvalidChar(u32),
    /// Blob length exceeds `u32::MAX`.
    BlobTooLarge(usize),
    /// The general-purpose serializer rejected a value.
    Serializer(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "Invalid Tag byte: {:#04x}", b),
            Error::UnexpectedTag { expected, actual } => {
                write!(f, "Unexpected Tag: expected {:?}, found {:?}", expected, actual)
            }
            Error::InvalidChar(c) => write!(f, "Invalid char scalar: {:#x}", c),
            Error::BlobTooLarge(n) => write!(f, "Blob of {} bytes exceeds u32 length prefix", n),
            Error::Serializer(msg) => write!(f, "Serializer error: {}", msg),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for Duopack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the kind of the encoded value.
///
/// The numbering is part of the wire contract and must never be reordered.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Null = 0,
    False = 1,
    True = 2,
    Byte = 3,
    Char = 4,
    String = 5,
    Int32 = 6,
    Proxy = 7,
    Other = 8,
}

impl Tag {
    /// Returns the Tag variant for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Tag::Null),
            1 => Some(Tag::False),
            2 => Some(Tag::True),
            3 => Some(Tag::Byte),
            4 => Some(Tag::Char),
            5 => Some(Tag::String),
            6 => Some(Tag::Int32),
            7 => Some(Tag::Proxy),
            8 => Some(Tag::Other),
            _ => None,
        }
    }
}

/// Serializes an arbitrary value into an `Other` blob.
pub fn to_other<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| Error::Serializer(e.to_string()))
}

/// Deserializes an `Other` blob back into a concrete type.
pub fn from_other<T: DeserializeOwned>(blob: &[u8]) -> Result<T> {
    rmp_serde::from_slice(blob).map_err(|e| Error::Serializer(e.to_string()))
}

/// A growable, append-only encoder.
///
/// Raw methods (`*_raw`) write untagged primitives and are used for message
/// headers. Tagged methods write a complete value.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Creates a new writer with a small default capacity.
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    // ------------------------------------------------------------------------
    //  Raw primitives
    // ------------------------------------------------------------------------

    pub fn u8_raw(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool_raw(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn i32_raw(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32_raw(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes a `u32` length prefix followed by the bytes.
    pub fn blob_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::BlobTooLarge(bytes.len()))?;
        self.u32_raw(len);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn str_raw(&mut self, v: &str) -> Result<()> {
        self.blob_raw(v.as_bytes())
    }

    // ------------------------------------------------------------------------
    //  Tagged values
    // ------------------------------------------------------------------------

    pub fn tag(&mut self, tag: Tag) {
        self.buf.push(tag as u8);
    }

    pub fn null(&mut self) {
        self.tag(Tag::Null);
    }

    pub fn bool(&mut self, v: bool) {
        self.tag(if v { Tag::True } else { Tag::False });
    }

    pub fn byte(&mut self, v: u8) {
        self.tag(Tag::Byte);
        self.u8_raw(v);
    }

    pub fn char(&mut self, v: char) {
        self.tag(Tag::Char);
        self.u32_raw(v as u32);
    }

    pub fn string(&mut self, v: &str) -> Result<()> {
        self.tag(Tag::String);
        self.str_raw(v)
    }

    pub fn int32(&mut self, v: i32) {
        self.tag(Tag::Int32);
        self.i32_raw(v);
    }

    /// Writes an already-serialized `Other` blob.
    pub fn other(&mut self, blob: &[u8]) -> Result<()> {
        self.tag(Tag::Other);
        self.blob_raw(blob)
    }

    /// Serializes `value` and writes it as an `Other` blob.
    pub fn serde<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let blob = to_other(value)?;
        self.other(&blob)
    }
}

/// A zero-copy, bounds-checked decoder over a byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    // ------------------------------------------------------------------------
    //  Raw primitives
    // ------------------------------------------------------------------------

    pub fn u8_raw(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn bool_raw(&mut self) -> Result<bool> {
        Ok(self.u8_raw()? != 0)
    }

    pub fn i32_raw(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn u32_raw(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn blob_raw(&mut self) -> Result<&'a [u8]> {
        let len = self.u32_raw()? as usize;
        self.read_bytes(len)
    }

    pub fn str_raw(&mut self) -> Result<&'a str> {
        let bytes = self.blob_raw()?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    // ------------------------------------------------------------------------
    //  Tagged values
    // ------------------------------------------------------------------------

    /// Returns the next tag without consuming it.
    pub fn peek_tag(&self) -> Result<Tag> {
        let b = *self.buf.first().ok_or(Error::UnexpectedEnd)?;
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    pub fn tag(&mut self) -> Result<Tag> {
        let b = self.u8_raw()?;
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn expect_tag(&mut self, expected: Tag) -> Result<()> {
        let actual = self.tag()?;
        if actual != expected {
            return Err(Error::UnexpectedTag { expected, actual });
        }
        Ok(())
    }

    /// Reads the payload of a `Char` whose tag was already consumed.
    pub fn char_body(&mut self) -> Result<char> {
        let raw = self.u32_raw()?;
        char::from_u32(raw).ok_or(Error::InvalidChar(raw))
    }

    pub fn null(&mut self) -> Result<()> {
        self.expect_tag(Tag::Null)
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.tag()? {
            Tag::True => Ok(true),
            Tag::False => Ok(false),
            actual => Err(Error::UnexpectedTag { expected: Tag::True, actual }),
        }
    }

    pub fn byte(&mut self) -> Result<u8> {
        self.expect_tag(Tag::Byte)?;
        self.u8_raw()
    }

    pub fn char(&mut self) -> Result<char> {
        self.expect_tag(Tag::Char)?;
        self.char_body()
    }

    pub fn string(&mut self) -> Result<&'a str> {
        self.expect_tag(Tag::String)?;
        self.str_raw()
    }

    pub fn int32(&mut self) -> Result<i32> {
        self.expect_tag(Tag::Int32)?;
        self.i32_raw()
    }

    pub fn other(&mut self) -> Result<&'a [u8]> {
        self.expect_tag(Tag::Other)?;
        self.blob_raw()
    }

    pub fn serde<T: DeserializeOwned>(&mut self) -> Result<T> {
        from_other(self.other()?)
    }
}
