//! Extended operations. Only StartTLS is understood; everything else is a protocol error.

use crate::ber::{self, Class, Kind, Packet};
use crate::event::{self, EventLog};
use crate::ldap_handler::{Outcome, RequestHandler, Session};
use crate::ldap_protocol::{
    check_packet, ResultCode, APP_EXTENDED_REQUEST, APP_EXTENDED_RESPONSE, START_TLS_OID,
};
use crate::response::ResultCodeResponse;
use tracing::{debug, warn};

const REQUEST_NAME: u32 = 0;

pub struct ExtendedHandler;

impl RequestHandler for ExtendedHandler {
    fn name(&self) -> &'static str {
        "extended"
    }

    fn handle(&self, packet: &Packet, session: &mut Session, log: &mut EventLog) -> Outcome {
        let Some(op) = packet.child(1) else {
            return Outcome::NotMine;
        };
        if check_packet(op, Class::Application, Kind::Constructed, APP_EXTENDED_REQUEST).is_err() {
            return Outcome::NotMine;
        }
        log.insert(event::REQUEST_TYPE, "extended");

        let mut oid = None;
        if let Some(name) = op.child(0) {
            if let Err(e) = check_packet(name, Class::Context, Kind::Primitive, REQUEST_NAME) {
                debug!("Extended request without an OID: {}", e);
                log.insert(event::MALFORMED_PAYLOAD, ber::encode(op));
                return Outcome::NotMine;
            }
            let value = name.as_string().unwrap_or_default();
            log.insert(event::EXTENDED_OID, value.as_str());
            oid = Some(value);

            if let Some(request_value) = op.child(1) {
                let bytes = match request_value.as_bytes() {
                    Some(b) => b.to_vec(),
                    None => ber::encode(request_value),
                };
                log.insert(event::EXTENDED_OID_VALUE, bytes);
            }
        }

        let mut code = ResultCode::ProtocolError;
        if oid.as_deref() == Some(START_TLS_OID) {
            log.insert(event::REQUEST_TYPE, "extended.tls");
            if session.request_start_tls() {
                debug!("StartTLS accepted for {}", session.peer);
                code = ResultCode::Success;
            } else {
                warn!("StartTLS from {} refused: tls state {:?}", session.peer, session.tls);
            }
        }

        ResultCodeResponse::new(APP_EXTENDED_RESPONSE, code).respond(packet, log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::Value;
    use crate::event::EventValue;
    use crate::ldap_handler::TlsState;

    fn session(tls: TlsState) -> Session {
        Session::new("127.0.0.1:1".parse().unwrap(), None, tls)
    }

    fn extended(id: i64, children: Vec<Packet>) -> Packet {
        Packet::sequence(vec![
            Packet::integer(id),
            Packet::constructed(Class::Application, APP_EXTENDED_REQUEST, children),
        ])
    }

    fn oid(s: &str) -> Packet {
        Packet::primitive(Class::Context, REQUEST_NAME, Value::Bytes(s.as_bytes().to_vec()))
    }

    fn result_code(outcome: &Outcome) -> i64 {
        let Outcome::Handled(packets) = outcome else {
            panic!("expected a response");
        };
        assert_eq!(packets.len(), 1);
        let op = packets[0].child(1).unwrap();
        assert_eq!(op.tag, APP_EXTENDED_RESPONSE);
        op.child(0).unwrap().as_integer().unwrap()
    }

    #[test]
    fn test_start_tls_success() {
        let mut s = session(TlsState::Available);
        let mut log = EventLog::new();
        let out = ExtendedHandler.handle(&extended(1, vec![oid(START_TLS_OID)]), &mut s, &mut log);
        assert_eq!(result_code(&out), 0);
        assert_eq!(s.tls, TlsState::Requested);
        assert_eq!(log.request_type().as_deref(), Some("extended.tls"));
        assert_eq!(log.get(event::EXTENDED_OID), Some(&EventValue::Text(START_TLS_OID.into())));
    }

    #[test]
    fn test_start_tls_failure() {
        let mut s = session(TlsState::Unavailable);
        let out = ExtendedHandler.handle(&extended(1, vec![oid(START_TLS_OID)]), &mut s, &mut EventLog::new());
        assert_eq!(result_code(&out), 2);

        let mut s = session(TlsState::Active);
        let out = ExtendedHandler.handle(&extended(2, vec![oid(START_TLS_OID)]), &mut s, &mut EventLog::new());
        assert_eq!(result_code(&out), 2);
        assert_eq!(s.tls, TlsState::Active);
    }

    #[test]
    fn test_other_oid_is_protocol_error() {
        // Password modify (RFC 3062) with a value
        let mut log = EventLog::new();
        let value = Packet::primitive(Class::Context, 1, Value::Bytes(vec![0x30, 0x00]));
        let out = ExtendedHandler.handle(
            &extended(3, vec![oid("1.3.6.1.4.1.4203.1.11.1"), value]),
            &mut session(TlsState::Available),
            &mut log,
        );
        assert_eq!(result_code(&out), 2);
        assert_eq!(log.request_type().as_deref(), Some("extended"));
        assert_eq!(log.get(event::EXTENDED_OID_VALUE), Some(&EventValue::Bytes(vec![0x30, 0x00])));
    }

    #[test]
    fn test_missing_oid_is_protocol_error() {
        let out = ExtendedHandler.handle(&extended(4, vec![]), &mut session(TlsState::Available), &mut EventLog::new());
        assert_eq!(result_code(&out), 2);
    }

    #[test]
    fn test_bad_oid_shape_declines() {
        let mut log = EventLog::new();
        let out = ExtendedHandler.handle(
            &extended(5, vec![Packet::octet_string(START_TLS_OID)]),
            &mut session(TlsState::Available),
            &mut log,
        );
        assert_eq!(out, Outcome::NotMine);
        assert!(log.contains_key(event::MALFORMED_PAYLOAD));
    }
}
