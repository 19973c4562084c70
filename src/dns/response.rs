//! Error responses for handlers
//!
//! Resolver failures are answered with a DNS response code rather than
//! silence, so clients fail fast instead of waiting for their own timeout.

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};

/// Response carrying `rcode` with the query's id, flags and question
pub fn error_response(query: &Message, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_response_code(rcode);
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);

    // Copy question section
    for q in query.queries() {
        response.add_query(q.clone());
    }

    response
}

/// Build a SERVFAIL response
///
/// Used when the resolver could not produce an answer.
pub fn servfail(query: &Message) -> Message {
    error_response(query, ResponseCode::ServFail)
}

/// Build a NOTIMP (Not Implemented) response
///
/// Used for opcodes other than QUERY.
pub fn notimp(query: &Message) -> Message {
    let mut response = error_response(query, ResponseCode::NotImp);
    response.set_op_code(OpCode::Query);
    response.set_recursion_available(false);
    response
}

/// Build a REFUSED response
pub fn refused(query: &Message) -> Message {
    error_response(query, ResponseCode::Refused)
}

/// Build a FORMERR response
///
/// Used for queries without a question section.
pub fn formerr(query: &Message) -> Message {
    error_response(query, ResponseCode::FormErr)
}
