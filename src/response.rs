//! Response packet construction.
//!
//! Every reply is an LDAPMessage envelope: `SEQUENCE { INTEGER id, [APPLICATION n] {...} }`.
//! Result-bearing replies carry `ENUMERATED resultCode, matchedDN "", diagnosticMessage ""`.

use crate::ber::{Class, Packet};
use crate::event::{self, EventLog};
use crate::ldap_handler::Outcome;
use crate::ldap_protocol::{self, ResultCode, APP_SEARCH_RESULT_DONE, APP_SEARCH_RESULT_ENTRY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Wrap a protocolOp in the message envelope.
pub fn envelope(message_id: i64, op: Packet) -> Packet {
    Packet::sequence(vec![Packet::integer(message_id), op])
}

/// `[APPLICATION tag] { resultCode, "", "" }`
pub fn ldap_result(reply_tag: u32, code: ResultCode) -> Packet {
    Packet::constructed(
        Class::Application,
        reply_tag,
        vec![
            Packet::enumerated(code.code()),
            Packet::octet_string(Vec::new()),
            Packet::octet_string(Vec::new()),
        ],
    )
}

/// Generic "reply with this tag and this code" responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCodeResponse {
    pub reply_tag: u32,
    pub result_code: ResultCode,
}

impl ResultCodeResponse {
    pub const fn new(reply_tag: u32, result_code: ResultCode) -> Self {
        Self {
            reply_tag,
            result_code,
        }
    }

    pub fn build(&self, message_id: i64) -> Packet {
        envelope(message_id, ldap_result(self.reply_tag, self.result_code))
    }

    /// Answer `request` under its own message ID. Declines if the envelope does not parse.
    pub fn respond(&self, request: &Packet, log: &mut EventLog) -> Outcome {
        match ldap_protocol::message_id(request) {
            Ok(id) => {
                log.insert(event::MESSAGE_ID, id);
                Outcome::Handled(vec![self.build(id)])
            }
            Err(e) => {
                debug!("Cannot build response: {}", e);
                Outcome::NotMine
            }
        }
    }
}

/// Value of one attribute in a synthesized entry.
///
/// Only text and lists of text go on the wire; the other variants exist so that
/// loosely typed sources (YAML, JSON) can be passed through and are skipped at encode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    List(Vec<String>),
    Integer(i64),
    Boolean(bool),
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(v: Vec<String>) -> Self {
        AttributeValue::List(v)
    }
}

impl AttributeValue {
    fn wire_values(&self) -> Option<Vec<&str>> {
        match self {
            AttributeValue::Text(s) => Some(vec![s.as_str()]),
            AttributeValue::List(items) => Some(items.iter().map(String::as_str).collect()),
            AttributeValue::Integer(_) | AttributeValue::Boolean(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultEntry {
    pub dn: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl SearchResultEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// `[APPLICATION 4] { objectName, SEQUENCE OF SEQUENCE { type, SET OF value } }`
    ///
    /// With `types_only` the value sets are left empty.
    pub fn to_packet(&self, message_id: i64, types_only: bool) -> Packet {
        let mut attrs = Vec::with_capacity(self.attributes.len());
        for (name, value) in &self.attributes {
            let Some(values) = value.wire_values() else {
                debug!("Skipping attribute {} of {}: unsupported value type {:?}", name, self.dn, value);
                continue;
            };
            let set = if types_only {
                Vec::new()
            } else {
                values.into_iter().map(Packet::octet_string).collect()
            };
            attrs.push(Packet::sequence(vec![
                Packet::octet_string(name.as_str()),
                Packet::set(set),
            ]));
        }
        envelope(
            message_id,
            Packet::constructed(
                Class::Application,
                APP_SEARCH_RESULT_ENTRY,
                vec![Packet::octet_string(self.dn.as_str()), Packet::sequence(attrs)],
            ),
        )
    }
}

pub fn search_result_done(message_id: i64, code: ResultCode) -> Packet {
    ResultCodeResponse::new(APP_SEARCH_RESULT_DONE, code).build(message_id)
}
