//! Simple bind handling.
//!
//! BindRequest ::= [APPLICATION 0] SEQUENCE {
//!     version INTEGER, name LDAPDN, authentication CHOICE { simple [0], sasl [3] } }

use crate::ber::{self, Class, Kind, Packet};
use crate::event::{self, EventLog};
use crate::ldap_handler::{Outcome, RequestHandler, Session};
use crate::ldap_protocol::{
    check_packet, ResultCode, APP_BIND_REQUEST, APP_BIND_RESPONSE, MIN_PROTOCOL_VERSION,
};
use crate::response::ResultCodeResponse;
use std::sync::Arc;
use tracing::debug;

const AUTH_SIMPLE: u32 = 0;
const AUTH_SASL: u32 = 3;

/// Credential decision for a simple bind. Shared by every connection; must not mutate.
pub trait BindCheck: Send + Sync {
    fn bind_check(&self, dn: &str, password: &[u8]) -> bool;
}

impl<F> BindCheck for F
where
    F: Fn(&str, &[u8]) -> bool + Send + Sync,
{
    fn bind_check(&self, dn: &str, password: &[u8]) -> bool {
        self(dn, password)
    }
}

/// Reduce a bind DN to the value of its first RDN: `cn=root,dc=example` becomes `root`.
pub fn bind_username(dn: &str) -> &str {
    let name = dn.strip_prefix("cn=").unwrap_or(dn);
    match name.find(',') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

pub struct BindHandler {
    check: Arc<dyn BindCheck>,
}

impl BindHandler {
    pub fn new(check: Arc<dyn BindCheck>) -> Self {
        Self { check }
    }
}

fn mark_malformed(op: &Packet, log: &mut EventLog) -> Outcome {
    log.insert(event::MALFORMED_PAYLOAD, ber::encode(op));
    Outcome::NotMine
}

impl RequestHandler for BindHandler {
    fn name(&self) -> &'static str {
        "bind"
    }

    fn handle(&self, packet: &Packet, session: &mut Session, log: &mut EventLog) -> Outcome {
        let Some(op) = packet.child(1) else {
            return Outcome::NotMine;
        };
        if check_packet(op, Class::Application, Kind::Constructed, APP_BIND_REQUEST).is_err() {
            return Outcome::NotMine;
        }
        log.insert(event::REQUEST_TYPE, "bind");
        // Every bind starts from anonymous; only a successful one authenticates again
        session.reset_auth();

        let children = op.children();
        if children.is_empty() {
            debug!("Bind request without a version");
            return mark_malformed(op, log);
        }

        let version = if check_packet(&children[0], Class::Universal, Kind::Primitive, ber::TAG_INTEGER).is_ok() {
            children[0].as_integer().unwrap_or(0)
        } else {
            debug!("Cannot read LDAP version from bind request");
            0
        };
        log.insert(event::VERSION, version);
        if version < MIN_PROTOCOL_VERSION {
            return ResultCodeResponse::new(APP_BIND_RESPONSE, ResultCode::ProtocolError).respond(packet, log);
        }

        if children.len() < 3 {
            debug!("At least 3 elements required in bind request, found {}", children.len());
            return mark_malformed(op, log);
        }

        if let Err(e) = check_packet(&children[1], Class::Universal, Kind::Primitive, ber::TAG_OCTET_STRING) {
            debug!("Bind DN: {}", e);
            return mark_malformed(op, log);
        }
        let dn = children[1].as_string().unwrap_or_default();

        let auth = &children[2];
        if check_packet(auth, Class::Context, Kind::Constructed, AUTH_SASL).is_ok() {
            let mechanism = auth.child(0).and_then(Packet::as_string).unwrap_or_default();
            debug!("SASL bind with mechanism {:?} rejected", mechanism);
            log.insert(event::USERNAME, bind_username(&dn));
            log.insert(event::BIND_SASL_MECHANISM, mechanism);
            return ResultCodeResponse::new(APP_BIND_RESPONSE, ResultCode::AuthMethodNotSupported)
                .respond(packet, log);
        }

        let username = bind_username(&dn).to_string();
        debug!("Bind name: {}", username);
        log.insert(event::USERNAME, username.as_str());

        if let Err(e) = check_packet(auth, Class::Context, Kind::Primitive, AUTH_SIMPLE) {
            debug!("Bind password: {}", e);
            return mark_malformed(op, log);
        }
        let password = auth.as_bytes().unwrap_or_default();
        log.insert(event::PASSWORD, String::from_utf8_lossy(password).into_owned());

        let code = if self.check.bind_check(&username, password) {
            session.authenticate(&username);
            log.insert(event::BIND_RESULT, "success");
            ResultCode::Success
        } else {
            log.insert(event::BIND_RESULT, "invalid-credentials");
            ResultCode::InvalidCredentials
        };
        ResultCodeResponse::new(APP_BIND_RESPONSE, code).respond(packet, log)
    }
}
