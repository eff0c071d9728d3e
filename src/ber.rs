//! BER packet tree: decoding of client bytes into [`Packet`]s and encoding of response trees.
//!
//! Only the definite-length form is supported, which is all LDAP (RFC 4511, section 5.1) allows.
//! Decoding is strict about lengths and nesting since every byte comes from an untrusted peer.

use bytes::BytesMut;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum nesting of constructed nodes accepted from a peer.
pub const MAX_DEPTH: usize = 64;

/// Maximum size of one top-level frame (tag + length + content).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

// Universal tag numbers
pub const TAG_EOC: u32 = 0x00;
pub const TAG_BOOLEAN: u32 = 0x01;
pub const TAG_INTEGER: u32 = 0x02;
pub const TAG_OCTET_STRING: u32 = 0x04;
pub const TAG_NULL: u32 = 0x05;
pub const TAG_ENUMERATED: u32 = 0x0A;
pub const TAG_SEQUENCE: u32 = 0x10;
pub const TAG_SET: u32 = 0x11;

#[derive(Debug, Error)]
pub enum BerError {
    #[error("BER truncated: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("indefinite length not supported")]
    IndefiniteLength,
    #[error("length too large: {0} length bytes")]
    LengthTooLarge(usize),
    #[error("tag number does not fit in 32 bits")]
    TagTooLarge,
    #[error("packet nesting deeper than {0} levels")]
    TooDeep(usize),
    #[error("integer too large: {0} bytes")]
    IntegerTooLarge(usize),
    #[error("integer has no content octets")]
    EmptyInteger,
    #[error("boolean value must be 1 byte, got: {0}")]
    InvalidBoolean(usize),
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),
    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
    #[error("connection closed mid-frame with {0} bytes buffered")]
    UnexpectedEof(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Universal = 0,
    Application = 1,
    Context = 2,
    Private = 3,
}

impl Class {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Class::Universal,
            1 => Class::Application,
            2 => Class::Context,
            _ => Class::Private,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Primitive,
    Constructed,
}

/// Scalar content of a primitive node.
///
/// Universal BOOLEAN, INTEGER, ENUMERATED and NULL are decoded to their typed form;
/// every other primitive keeps its raw content octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Null,
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Null => Ok(()),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Primitive(Value),
    Constructed(Vec<Packet>),
}

/// One BER node. Immutable once decoded; response trees are built with the constructors below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub class: Class,
    pub tag: u32,
    pub content: Content,
}

impl Packet {
    pub fn primitive(class: Class, tag: u32, value: Value) -> Self {
        Self {
            class,
            tag,
            content: Content::Primitive(value),
        }
    }

    pub fn constructed(class: Class, tag: u32, children: Vec<Packet>) -> Self {
        Self {
            class,
            tag,
            content: Content::Constructed(children),
        }
    }

    pub fn sequence(children: Vec<Packet>) -> Self {
        Self::constructed(Class::Universal, TAG_SEQUENCE, children)
    }

    pub fn set(children: Vec<Packet>) -> Self {
        Self::constructed(Class::Universal, TAG_SET, children)
    }

    pub fn integer(value: i64) -> Self {
        Self::primitive(Class::Universal, TAG_INTEGER, Value::Integer(value))
    }

    pub fn enumerated(value: i64) -> Self {
        Self::primitive(Class::Universal, TAG_ENUMERATED, Value::Integer(value))
    }

    pub fn boolean(value: bool) -> Self {
        Self::primitive(Class::Universal, TAG_BOOLEAN, Value::Boolean(value))
    }

    pub fn octet_string(data: impl Into<Vec<u8>>) -> Self {
        Self::primitive(Class::Universal, TAG_OCTET_STRING, Value::Bytes(data.into()))
    }

    pub fn kind(&self) -> Kind {
        match self.content {
            Content::Primitive(_) => Kind::Primitive,
            Content::Constructed(_) => Kind::Constructed,
        }
    }

    /// Child nodes; empty for primitives.
    pub fn children(&self) -> &[Packet] {
        match &self.content {
            Content::Constructed(children) => children,
            Content::Primitive(_) => &[],
        }
    }

    pub fn child(&self, index: usize) -> Option<&Packet> {
        self.children().get(index)
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.content {
            Content::Primitive(value) => Some(value),
            Content::Constructed(_) => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.value()? {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value()? {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.value()? {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Content octets as text, replacing invalid UTF-8.
    pub fn as_string(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

// BER parsing utilities
struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8, BerError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(BerError::Truncated { needed: 1, remaining: 0 })?;
        self.pos += 1;
        Ok(b)
    }

    fn read_identifier(&mut self) -> Result<(Class, Kind, u32), BerError> {
        let first = self.read_u8()?;
        let class = Class::from_bits(first >> 6);
        let kind = if first & 0x20 != 0 {
            Kind::Constructed
        } else {
            Kind::Primitive
        };
        let mut tag = (first & 0x1F) as u32;
        if tag == 0x1F {
            // High tag number form: base-128, most significant group first
            tag = 0;
            loop {
                let b = self.read_u8()?;
                if tag > (u32::MAX >> 7) {
                    return Err(BerError::TagTooLarge);
                }
                tag = (tag << 7) | (b & 0x7F) as u32;
                if b & 0x80 == 0 {
                    break;
                }
            }
        }
        Ok((class, kind, tag))
    }

    fn read_length(&mut self) -> Result<usize, BerError> {
        let first_byte = self.read_u8()?;
        if (first_byte & 0x80) == 0 {
            // Short form
            return Ok(first_byte as usize);
        }
        // Long form
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 {
            return Err(BerError::IndefiniteLength);
        }
        if length_bytes > 4 {
            return Err(BerError::LengthTooLarge(length_bytes));
        }
        let mut length = 0usize;
        for _ in 0..length_bytes {
            length = (length << 8) | self.read_u8()? as usize;
        }
        Ok(length)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], BerError> {
        if self.remaining() < n {
            return Err(BerError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..start + n])
    }

    fn read_packet(&mut self, depth: usize) -> Result<Packet, BerError> {
        if depth > MAX_DEPTH {
            return Err(BerError::TooDeep(MAX_DEPTH));
        }
        let (class, kind, tag) = self.read_identifier()?;
        let length = self.read_length()?;
        let content = self.read_bytes(length)?;

        match kind {
            Kind::Constructed => {
                let mut inner = BerReader::new(content);
                let mut children = Vec::new();
                while inner.remaining() > 0 {
                    children.push(inner.read_packet(depth + 1)?);
                }
                Ok(Packet::constructed(class, tag, children))
            }
            Kind::Primitive => Ok(Packet::primitive(class, tag, decode_primitive(class, tag, content)?)),
        }
    }
}

fn decode_primitive(class: Class, tag: u32, content: &[u8]) -> Result<Value, BerError> {
    if class != Class::Universal {
        return Ok(Value::Bytes(content.to_vec()));
    }
    match tag {
        TAG_BOOLEAN => {
            if content.len() != 1 {
                return Err(BerError::InvalidBoolean(content.len()));
            }
            Ok(Value::Boolean(content[0] != 0))
        }
        TAG_INTEGER | TAG_ENUMERATED => decode_integer(content).map(Value::Integer),
        TAG_NULL => Ok(Value::Null),
        _ => Ok(Value::Bytes(content.to_vec())),
    }
}

fn decode_integer(content: &[u8]) -> Result<i64, BerError> {
    if content.is_empty() {
        return Err(BerError::EmptyInteger);
    }
    if content.len() > 8 {
        return Err(BerError::IntegerTooLarge(content.len()));
    }
    // Sign extension for negative numbers
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in content {
        value = (value << 8) | byte as i64;
    }
    Ok(value)
}

/// Decode exactly one packet; bytes left over after it are an error.
pub fn decode(data: &[u8]) -> Result<Packet, BerError> {
    let mut reader = BerReader::new(data);
    let packet = reader.read_packet(0)?;
    if reader.remaining() > 0 {
        return Err(BerError::TrailingBytes(reader.remaining()));
    }
    Ok(packet)
}

// BER encoding utilities
struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn write_identifier(&mut self, class: Class, kind: Kind, tag: u32) {
        let mut first = (class as u8) << 6;
        if kind == Kind::Constructed {
            first |= 0x20;
        }
        if tag < 0x1F {
            self.buffer.push(first | tag as u8);
            return;
        }
        self.buffer.push(first | 0x1F);
        let mut groups = Vec::new();
        let mut t = tag;
        loop {
            groups.push((t & 0x7F) as u8);
            t >>= 7;
            if t == 0 {
                break;
            }
        }
        groups.reverse();
        let last = groups.len() - 1;
        for (i, g) in groups.iter().enumerate() {
            self.buffer.push(if i < last { g | 0x80 } else { *g });
        }
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let mut bytes = Vec::new();
            let mut len = length;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    fn write_packet(&mut self, packet: &Packet) {
        match &packet.content {
            Content::Primitive(value) => {
                let body = encode_value(value);
                self.write_identifier(packet.class, Kind::Primitive, packet.tag);
                self.write_length(body.len());
                self.buffer.extend_from_slice(&body);
            }
            Content::Constructed(children) => {
                let mut inner = BerWriter::new();
                for child in children {
                    inner.write_packet(child);
                }
                self.write_identifier(packet.class, Kind::Constructed, packet.tag);
                self.write_length(inner.buffer.len());
                self.buffer.extend_from_slice(&inner.buffer);
            }
        }
    }

    fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Boolean(b) => vec![if *b { 0xFF } else { 0x00 }],
        Value::Integer(i) => encode_integer(*i),
        Value::Null => Vec::new(),
        Value::Bytes(b) => b.clone(),
    }
}

/// Minimal two's complement encoding.
fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut writer = BerWriter::new();
    writer.write_packet(packet);
    writer.into_vec()
}

/// Length of the first complete TLV at the front of `buf`, or `None` if more bytes are needed.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, BerError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut pos = 1;
    if buf[0] & 0x1F == 0x1F {
        loop {
            let Some(&b) = buf.get(pos) else {
                return Ok(None);
            };
            pos += 1;
            if pos > 6 {
                return Err(BerError::TagTooLarge);
            }
            if b & 0x80 == 0 {
                break;
            }
        }
    }
    let Some(&first_byte) = buf.get(pos) else {
        return Ok(None);
    };
    pos += 1;
    let content_length = if (first_byte & 0x80) == 0 {
        first_byte as usize
    } else {
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 {
            return Err(BerError::IndefiniteLength);
        }
        if length_bytes > 4 {
            return Err(BerError::LengthTooLarge(length_bytes));
        }
        if buf.len() < pos + length_bytes {
            return Ok(None);
        }
        let mut length = 0usize;
        for &b in &buf[pos..pos + length_bytes] {
            length = (length << 8) | b as usize;
        }
        pos += length_bytes;
        length
    };
    let total = pos + content_length;
    if total > MAX_FRAME_LEN {
        return Err(BerError::FrameTooLarge(total));
    }
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

/// Read one complete packet from `reader`, buffering partial frames in `buf`.
/// Returns `Ok(None)` on a clean end of stream between packets.
pub async fn read_packet<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Packet>, BerError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(total) = frame_length(buf)? {
            let frame = buf.split_to(total);
            return decode(&frame).map(Some);
        }
        buf.reserve(4096);
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(BerError::UnexpectedEof(buf.len()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Bind request: cn=root,dc=example,dc=com password: root
    const BIND_REQUEST: [u8; 43] = [
        0x30, 0x29, 0x02, 0x01, 0x01, 0x60, 0x24, 0x02, 0x01, 0x03, 0x04, 0x19, 0x63, 0x6e, 0x3d,
        0x72, 0x6f, 0x6f, 0x74, 0x2c, 0x64, 0x63, 0x3d, 0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65,
        0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d, 0x80, 0x04, 0x72, 0x6f, 0x6f, 0x74,
    ];

    #[test]
    fn test_decode_bind_request_tree() {
        let p = decode(&BIND_REQUEST).unwrap();
        assert_eq!(p.class, Class::Universal);
        assert_eq!(p.kind(), Kind::Constructed);
        assert_eq!(p.tag, TAG_SEQUENCE);
        assert_eq!(p.children().len(), 2);
        assert_eq!(p.children()[0].as_integer(), Some(1));

        let op = &p.children()[1];
        assert_eq!(op.class, Class::Application);
        assert_eq!(op.kind(), Kind::Constructed);
        assert_eq!(op.tag, 0);
        assert_eq!(op.children()[0].as_integer(), Some(3));
        assert_eq!(op.children()[1].as_string().unwrap(), "cn=root,dc=example,dc=com");

        let pw = &op.children()[2];
        assert_eq!(pw.class, Class::Context);
        assert_eq!(pw.kind(), Kind::Primitive);
        assert_eq!(pw.as_bytes(), Some(&b"root"[..]));
    }

    #[test]
    fn test_encode_decode_preserves_bytes() {
        let p = decode(&BIND_REQUEST).unwrap();
        assert_eq!(encode(&p), BIND_REQUEST.to_vec());
    }

    #[test]
    fn test_encode_bind_response() {
        let p = Packet::sequence(vec![
            Packet::integer(1),
            Packet::constructed(
                Class::Application,
                1,
                vec![Packet::enumerated(0), Packet::octet_string(""), Packet::octet_string("")],
            ),
        ]);
        assert_eq!(
            encode(&p),
            vec![0x30, 0x0c, 0x02, 0x01, 0x01, 0x61, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00]
        );
    }

    #[test]
    fn test_encode_integer_minimal() {
        assert_eq!(encode_integer(0), vec![0x00]);
        assert_eq!(encode_integer(127), vec![0x7F]);
        assert_eq!(encode_integer(128), vec![0x00, 0x80]);
        assert_eq!(encode_integer(256), vec![0x01, 0x00]);
        assert_eq!(encode_integer(-1), vec![0xFF]);
        assert_eq!(encode_integer(-128), vec![0x80]);
        assert_eq!(encode_integer(-129), vec![0xFF, 0x7F]);
    }

    #[test]
    fn test_decode_negative_integer() {
        let p = decode(&[0x02, 0x01, 0xFF]).unwrap();
        assert_eq!(p.as_integer(), Some(-1));
        let p = decode(&[0x02, 0x02, 0xFF, 0x7F]).unwrap();
        assert_eq!(p.as_integer(), Some(-129));
    }

    #[test]
    fn test_long_form_length() {
        let p = Packet::octet_string(vec![b'a'; 200]);
        let bytes = encode(&p);
        assert_eq!(&bytes[..3], &[0x04, 0x81, 0xC8]);
        assert_eq!(decode(&bytes).unwrap(), p);
    }

    #[test]
    fn test_high_tag_number() {
        let p = Packet::primitive(Class::Context, 40, Value::Bytes(vec![]));
        let bytes = encode(&p);
        assert_eq!(bytes, vec![0x9F, 0x28, 0x00]);
        assert_eq!(decode(&bytes).unwrap(), p);

        let p = Packet::primitive(Class::Private, 300, Value::Bytes(vec![0x01]));
        let bytes = encode(&p);
        assert_eq!(bytes, vec![0xDF, 0x82, 0x2C, 0x01, 0x01]);
        assert_eq!(decode(&bytes).unwrap(), p);
    }

    #[test]
    fn test_boolean_and_null() {
        let p = decode(&[0x01, 0x01, 0xFF]).unwrap();
        assert_eq!(p.as_bool(), Some(true));
        let p = decode(&[0x05, 0x00]).unwrap();
        assert_eq!(p.value(), Some(&Value::Null));
        assert!(matches!(decode(&[0x01, 0x02, 0x00, 0x00]), Err(BerError::InvalidBoolean(2))));
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Boolean(false).to_string(), "false");
        assert_eq!(Value::Integer(-5).to_string(), "-5");
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Bytes(b"uid".to_vec()).to_string(), "uid");
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode(&[]), Err(BerError::Truncated { .. })));
        assert!(matches!(decode(&[0x30, 0x80, 0x00, 0x00]), Err(BerError::IndefiniteLength)));
        assert!(matches!(decode(&[0x04, 0x05, 0x61]), Err(BerError::Truncated { .. })));
        assert!(matches!(decode(&[0x04, 0x85, 0, 0, 0, 0, 1]), Err(BerError::LengthTooLarge(5))));
        assert!(matches!(decode(&[0x02, 0x00]), Err(BerError::EmptyInteger)));
        assert!(matches!(decode(&[0x05, 0x00, 0x00]), Err(BerError::TrailingBytes(1))));
        let mut big = vec![0x02, 0x09];
        big.extend_from_slice(&[0x01; 9]);
        assert!(matches!(decode(&big), Err(BerError::IntegerTooLarge(9))));
    }

    #[test]
    fn test_truncation_inside_identifier_and_length() {
        // High tag number form cut off after its first byte
        assert!(matches!(
            decode(&[0x7F, 0x81]),
            Err(BerError::Truncated { needed: 1, remaining: 0 })
        ));
        // Long-form length missing its second byte
        assert!(matches!(decode(&[0x04, 0x82, 0x01]), Err(BerError::Truncated { .. })));
        // Child overruns its parent's content
        assert!(matches!(
            decode(&[0x30, 0x03, 0x04, 0x05, 0x61]),
            Err(BerError::Truncated { needed: 5, remaining: 1 })
        ));
    }

    #[test]
    fn test_decode_rejects_deep_nesting() {
        let mut p = Packet::sequence(vec![]);
        for _ in 0..(MAX_DEPTH + 5) {
            p = Packet::sequence(vec![p]);
        }
        let bytes = encode(&p);
        assert!(matches!(decode(&bytes), Err(BerError::TooDeep(_))));
    }

    #[test]
    fn test_frame_length() {
        assert_eq!(frame_length(&[]).unwrap(), None);
        assert_eq!(frame_length(&[0x30]).unwrap(), None);
        assert_eq!(frame_length(&BIND_REQUEST[..10]).unwrap(), None);
        assert_eq!(frame_length(&BIND_REQUEST).unwrap(), Some(43));
        assert_eq!(frame_length(&[0x30, 0x82, 0x01]).unwrap(), None);
        assert!(matches!(frame_length(&[0x30, 0x80]), Err(BerError::IndefiniteLength)));
        assert!(matches!(
            frame_length(&[0x30, 0x84, 0x7F, 0xFF, 0xFF, 0xFF]),
            Err(BerError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_read_packet_sequence_then_eof() {
        let mut data = BIND_REQUEST.to_vec();
        data.extend_from_slice(&BIND_REQUEST);
        let mut reader: &[u8] = &data;
        let mut buf = BytesMut::new();
        let first = read_packet(&mut reader, &mut buf).await.unwrap().unwrap();
        let second = read_packet(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert!(read_packet(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_packet_eof_mid_frame() {
        let mut reader: &[u8] = &BIND_REQUEST[..20];
        let mut buf = BytesMut::new();
        let err = read_packet(&mut reader, &mut buf).await.unwrap_err();
        assert!(matches!(err, BerError::UnexpectedEof(20)));
    }
}
