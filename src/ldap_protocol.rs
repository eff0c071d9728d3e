// LDAP protocol constants and envelope validation over decoded BER packets.
// Message structure per RFC 4511: LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }

use crate::ber::{self, Class, Kind, Packet};
use std::fmt;
use thiserror::Error;

// LDAP application tag numbers (protocolOp CHOICE)
pub const APP_BIND_REQUEST: u32 = 0;
pub const APP_BIND_RESPONSE: u32 = 1;
pub const APP_UNBIND_REQUEST: u32 = 2;
pub const APP_SEARCH_REQUEST: u32 = 3;
pub const APP_SEARCH_RESULT_ENTRY: u32 = 4;
pub const APP_SEARCH_RESULT_DONE: u32 = 5;
pub const APP_MODIFY_REQUEST: u32 = 6;
pub const APP_MODIFY_RESPONSE: u32 = 7;
pub const APP_ADD_REQUEST: u32 = 8;
pub const APP_ADD_RESPONSE: u32 = 9;
pub const APP_DEL_REQUEST: u32 = 10;
pub const APP_DEL_RESPONSE: u32 = 11;
pub const APP_MODIFY_DN_REQUEST: u32 = 12;
pub const APP_MODIFY_DN_RESPONSE: u32 = 13;
pub const APP_COMPARE_REQUEST: u32 = 14;
pub const APP_COMPARE_RESPONSE: u32 = 15;
pub const APP_ABANDON_REQUEST: u32 = 16;
pub const APP_SEARCH_RESULT_REFERENCE: u32 = 19;
pub const APP_EXTENDED_REQUEST: u32 = 23;
pub const APP_EXTENDED_RESPONSE: u32 = 24;

/// OID for StartTLS extended operation (RFC 4511).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// Lowest protocol version a bind may negotiate.
pub const MIN_PROTOCOL_VERSION: i64 = 3;

/// LDAPResult resultCode values (RFC 4511, section 4.1.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    StrongerAuthRequired = 8,
    Referral = 10,
    NoSuchAttribute = 16,
    NoSuchObject = 32,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    UnwillingToPerform = 53,
    EntryAlreadyExists = 68,
    Other = 80,
}

impl ResultCode {
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// Request operations a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Bind,
    Unbind,
    Search,
    Modify,
    Add,
    Delete,
    ModifyDn,
    Compare,
    Abandon,
    Extended,
}

impl Operation {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            APP_BIND_REQUEST => Some(Operation::Bind),
            APP_UNBIND_REQUEST => Some(Operation::Unbind),
            APP_SEARCH_REQUEST => Some(Operation::Search),
            APP_MODIFY_REQUEST => Some(Operation::Modify),
            APP_ADD_REQUEST => Some(Operation::Add),
            APP_DEL_REQUEST => Some(Operation::Delete),
            APP_MODIFY_DN_REQUEST => Some(Operation::ModifyDn),
            APP_COMPARE_REQUEST => Some(Operation::Compare),
            APP_ABANDON_REQUEST => Some(Operation::Abandon),
            APP_EXTENDED_REQUEST => Some(Operation::Extended),
            _ => None,
        }
    }

    /// Request-type label used in the event log.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Bind => "bind",
            Operation::Unbind => "unbind",
            Operation::Search => "search",
            Operation::Modify => "modify",
            Operation::Add => "add",
            Operation::Delete => "delete",
            Operation::ModifyDn => "modify-dn",
            Operation::Compare => "compare",
            Operation::Abandon => "abandon",
            Operation::Extended => "extended",
        }
    }

    /// Application tag of the matching response. None for operations that get no reply.
    pub fn response_tag(self) -> Option<u32> {
        match self {
            Operation::Bind => Some(APP_BIND_RESPONSE),
            Operation::Search => Some(APP_SEARCH_RESULT_DONE),
            Operation::Modify => Some(APP_MODIFY_RESPONSE),
            Operation::Add => Some(APP_ADD_RESPONSE),
            Operation::Delete => Some(APP_DEL_RESPONSE),
            Operation::ModifyDn => Some(APP_MODIFY_DN_RESPONSE),
            Operation::Compare => Some(APP_COMPARE_RESPONSE),
            Operation::Extended => Some(APP_EXTENDED_RESPONSE),
            Operation::Unbind | Operation::Abandon => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("malformed LDAP message: {0}")]
    MalformedMessage(String),
    #[error("unexpected structure: expected {expected}, got {found}")]
    UnexpectedStructure { expected: String, found: String },
}

fn describe(class: Class, kind: Kind, tag: u32) -> String {
    format!("{:?}/{:?}/{}", class, kind, tag)
}

/// Assert that `packet` has the given class, kind and tag.
pub fn check_packet(packet: &Packet, class: Class, kind: Kind, tag: u32) -> Result<(), PacketError> {
    if packet.class != class || packet.kind() != kind || packet.tag != tag {
        return Err(PacketError::UnexpectedStructure {
            expected: describe(class, kind, tag),
            found: describe(packet.class, packet.kind(), packet.tag),
        });
    }
    Ok(())
}

/// Extract the message ID from an LDAPMessage envelope.
pub fn message_id(packet: &Packet) -> Result<i64, PacketError> {
    check_packet(packet, Class::Universal, Kind::Constructed, ber::TAG_SEQUENCE)
        .map_err(|e| PacketError::MalformedMessage(e.to_string()))?;
    if packet.children().len() < 2 {
        return Err(PacketError::MalformedMessage(format!(
            "envelope needs messageID and protocolOp, found {} elements",
            packet.children().len()
        )));
    }
    let id = &packet.children()[0];
    check_packet(id, Class::Universal, Kind::Primitive, ber::TAG_INTEGER)
        .map_err(|e| PacketError::MalformedMessage(format!("messageID: {}", e)))?;
    id.as_integer()
        .ok_or_else(|| PacketError::MalformedMessage("messageID is not an integer".to_string()))
}

/// True only for a well-formed envelope carrying the primitive [APPLICATION 2] UnbindRequest.
pub fn is_unbind_request(packet: &Packet) -> bool {
    if message_id(packet).is_err() {
        return false;
    }
    check_packet(&packet.children()[1], Class::Application, Kind::Primitive, APP_UNBIND_REQUEST).is_ok()
}

/// Read-only view over a validated LDAPMessage.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub id: i64,
    /// Raw protocolOp tag; may name an operation this server does not know.
    pub op_tag: u32,
    pub operation: Option<Operation>,
    pub op: &'a Packet,
}

impl<'a> Message<'a> {
    pub fn from_packet(packet: &'a Packet) -> Result<Self, PacketError> {
        let id = message_id(packet)?;
        let op = &packet.children()[1];
        let operation = if op.class == Class::Application {
            Operation::from_tag(op.tag)
        } else {
            None
        };
        Ok(Self {
            id,
            op_tag: op.tag,
            operation,
            op,
        })
    }

    /// Operation name when known, otherwise the numeric opcode.
    pub fn label(&self) -> String {
        match self.operation {
            Some(op) => op.to_string(),
            None => self.op_tag.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::Value;

    fn envelope(id: i64, op: Packet) -> Packet {
        Packet::sequence(vec![Packet::integer(id), op])
    }

    fn unbind() -> Packet {
        Packet::primitive(Class::Application, APP_UNBIND_REQUEST, Value::Null)
    }

    #[test]
    fn test_check_packet() {
        let p = Packet::integer(5);
        assert!(check_packet(&p, Class::Universal, Kind::Primitive, ber::TAG_INTEGER).is_ok());
        let err = check_packet(&p, Class::Universal, Kind::Constructed, ber::TAG_INTEGER).unwrap_err();
        assert!(matches!(err, PacketError::UnexpectedStructure { .. }));
        assert!(check_packet(&p, Class::Context, Kind::Primitive, ber::TAG_INTEGER).is_err());
        assert!(check_packet(&p, Class::Universal, Kind::Primitive, ber::TAG_ENUMERATED).is_err());
    }

    #[test]
    fn test_message_id() {
        assert_eq!(message_id(&envelope(42, unbind())).unwrap(), 42);
        assert_eq!(message_id(&envelope(0, unbind())).unwrap(), 0);
    }

    #[test]
    fn test_message_id_malformed() {
        // Not a sequence
        assert!(message_id(&Packet::octet_string("x")).is_err());
        // Missing protocolOp
        assert!(message_id(&Packet::sequence(vec![Packet::integer(1)])).is_err());
        // messageID is a string
        let p = Packet::sequence(vec![Packet::octet_string("1"), unbind()]);
        assert!(matches!(message_id(&p), Err(PacketError::MalformedMessage(_))));
        // messageID is an enumerated
        let p = Packet::sequence(vec![Packet::enumerated(1), unbind()]);
        assert!(message_id(&p).is_err());
    }

    #[test]
    fn test_is_unbind_request() {
        assert!(is_unbind_request(&envelope(3, unbind())));
        // Constructed [APPLICATION 2] is not an unbind
        let p = envelope(3, Packet::constructed(Class::Application, APP_UNBIND_REQUEST, vec![]));
        assert!(!is_unbind_request(&p));
        // Context [2] is not an unbind
        let p = envelope(3, Packet::primitive(Class::Context, 2, Value::Null));
        assert!(!is_unbind_request(&p));
        assert!(!is_unbind_request(&Packet::sequence(vec![unbind()])));
    }

    #[test]
    fn test_message_view() {
        let p = envelope(7, Packet::constructed(Class::Application, APP_DEL_REQUEST, vec![]));
        let m = Message::from_packet(&p).unwrap();
        assert_eq!(m.id, 7);
        assert_eq!(m.operation, Some(Operation::Delete));
        assert_eq!(m.label(), "delete");
        assert_eq!(Operation::ModifyDn.to_string(), "modify-dn");

        let p = envelope(8, Packet::constructed(Class::Application, 30, vec![]));
        let m = Message::from_packet(&p).unwrap();
        assert_eq!(m.operation, None);
        assert_eq!(m.label(), "30");

        // Universal class never names an LDAP operation
        let p = envelope(9, Packet::integer(0));
        assert_eq!(Message::from_packet(&p).unwrap().operation, None);
    }

    #[test]
    fn test_operation_response_tags() {
        assert_eq!(Operation::Bind.response_tag(), Some(APP_BIND_RESPONSE));
        assert_eq!(Operation::Search.response_tag(), Some(APP_SEARCH_RESULT_DONE));
        assert_eq!(Operation::ModifyDn.response_tag(), Some(APP_MODIFY_DN_RESPONSE));
        assert_eq!(Operation::Extended.response_tag(), Some(APP_EXTENDED_RESPONSE));
        assert_eq!(Operation::Abandon.response_tag(), None);
        assert_eq!(Operation::Unbind.response_tag(), None);
    }

    #[test]
    fn test_result_code_values() {
        assert_eq!(ResultCode::Success.code(), 0);
        assert_eq!(ResultCode::OperationsError.code(), 1);
        assert_eq!(ResultCode::ProtocolError.code(), 2);
        assert_eq!(ResultCode::NoSuchObject.code(), 32);
        assert_eq!(ResultCode::InvalidCredentials.code(), 49);
    }
}
