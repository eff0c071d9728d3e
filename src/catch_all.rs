use crate::ber::{self, Packet};
use crate::event::{self, EventLog};
use crate::ldap_handler::{Outcome, RequestHandler, Session};
use crate::ldap_protocol::{Message, Operation, ResultCode, APP_EXTENDED_RESPONSE};
use crate::response::ResultCodeResponse;
use tracing::debug;

/// Last handler in the chain: answers every request with a parseable envelope.
pub struct CatchAllHandler;

impl RequestHandler for CatchAllHandler {
    fn name(&self) -> &'static str {
        "catch-all"
    }

    fn handle(&self, packet: &Packet, _session: &mut Session, log: &mut EventLog) -> Outcome {
        log.insert(event::RAW_MESSAGE, ber::encode(packet));

        let message = match Message::from_packet(packet) {
            Ok(m) => m,
            Err(e) => {
                debug!("Can't read message id: {}", e);
                return Outcome::NotMine;
            }
        };

        let Some(operation) = message.operation else {
            log.insert(event::REQUEST_TYPE, i64::from(message.op_tag));
            debug!("Unknown opcode {} in message {}", message.label(), message.id);
            return ResultCodeResponse::new(APP_EXTENDED_RESPONSE, ResultCode::ProtocolError)
                .respond(packet, log);
        };
        log.insert(event::REQUEST_TYPE, operation.name());

        let Some(reply_tag) = operation.response_tag() else {
            // abandon and unbind get no answer
            return Outcome::Handled(Vec::new());
        };

        let code = match operation {
            // Only reach here when their own handler gave up on a malformed request
            Operation::Bind | Operation::Extended => ResultCode::ProtocolError,
            Operation::Search if log.contains_key(event::MALFORMED_PAYLOAD) => ResultCode::ProtocolError,
            _ => ResultCode::Success,
        };
        debug!("Generic {:?} answer to {} (message {})", code, message.label(), message.id);
        ResultCodeResponse::new(reply_tag, code).respond(packet, log)
    }
}
