//! DNS message construction and inspection helpers

use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::{Name, RData, Record};
use std::net::IpAddr;

/// ECS source prefix lengths: a full host address for either family.
const ECS_SOURCE_PREFIX_V4: u8 = 32;
const ECS_SOURCE_PREFIX_V6: u8 = 128;

/// EDNS advertised payload size on outgoing queries.
const EDNS_MAX_PAYLOAD: u16 = 4096;

/// Build a response message for a request.
///
/// Copies the request id, opcode and first question, sets `NOERROR` and
/// `RA`, and attaches the given answer records. An empty answer list yields
/// a valid "no data" reply.
pub fn reply_from_request(req: &Message, answers: Vec<Record>) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_response_code(ResponseCode::NoError);
    resp.set_recursion_available(true);
    if let Some(question) = req.queries().first() {
        resp.add_query(question.clone());
    }
    resp.add_answers(answers);
    resp
}

/// Set the EDNS client-subnet option on a message.
///
/// Ensures a single OPT record exists and carries exactly one client-subnet
/// option for `addr`, with a full-host source prefix and scope 0. Calling
/// this repeatedly with the same address leaves the message byte-identical.
pub fn set_ecs(msg: &mut Message, addr: IpAddr) {
    let source_prefix = match addr {
        IpAddr::V4(_) => ECS_SOURCE_PREFIX_V4,
        IpAddr::V6(_) => ECS_SOURCE_PREFIX_V6,
    };

    let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
    edns.set_max_payload(EDNS_MAX_PAYLOAD);
    edns.set_version(0);

    let options = edns.options_mut();
    options.remove(EdnsCode::Subnet);
    options.insert(EdnsOption::Subnet(ClientSubnet::new(addr, source_prefix, 0)));
}

/// Read the client-subnet address out of a message's OPT record, if any.
pub fn ecs_addr(msg: &Message) -> Option<IpAddr> {
    let edns = msg.extensions().as_ref()?;
    match edns.options().get(EdnsCode::Subnet)? {
        EdnsOption::Subnet(subnet) => Some(subnet.addr()),
        _ => None,
    }
}

/// Extract the first address answer from a message.
///
/// Scans the answer section for the first A or AAAA record and returns it
/// together with its address. CNAME chains are not followed: a response
/// whose answers are aliases only yields `None`.
pub fn extract_answer(msg: &Message) -> Option<(Record, IpAddr)> {
    for record in msg.answers() {
        match record.data() {
            RData::A(a) => return Some((record.clone(), IpAddr::V4(a.0))),
            RData::AAAA(aaaa) => return Some((record.clone(), IpAddr::V6(aaaa.0))),
            _ => {}
        }
    }
    None
}

/// Address carried by a single A/AAAA record, if it is one.
pub fn record_addr(record: &Record) -> Option<IpAddr> {
    match record.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

/// True when the query name falls under the `DHCP\ HOST.` pseudo-zone used
/// by some home routers for local hostnames.
pub fn is_dhcp_host(name: &Name) -> bool {
    name.iter().last() == Some(&b"DHCP HOST"[..])
}
