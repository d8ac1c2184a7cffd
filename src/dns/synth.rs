use super::{read_question, CLASS_IN, HEADER_LEN, TYPE_A};

/// TTL (seconds) advertised on the synthetic 0.0.0.0 answer.
pub const BLOCKED_ANSWER_TTL: u32 = 60;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
/// Answer name pointing back at the question name (offset 12).
const NAME_POINTER: [u8; 2] = [0xC0, 0x0C];

/// Builds "resolved to 0.0.0.0" for `query`.
///
/// The answer is a successful A record rather than NXDOMAIN so stub
/// resolvers cache it instead of retrying. Returns `None` if the query has
/// no readable question.
pub fn synthesize_blocked(query: &[u8]) -> Option<Vec<u8>> {
    let question = read_question(query)?;
    let mut response = Vec::with_capacity(HEADER_LEN + question.section.len() + 4 + 16);

    let query_flags = u16::from_be_bytes([query[2], query[3]]);
    let flags = FLAG_QR | FLAG_RA | (query_flags & FLAG_RD);

    response.extend_from_slice(&query[..2]);
    response.extend_from_slice(&flags.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    response.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
    response.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    response.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    response.extend_from_slice(question.section);
    if !question.has_type_class {
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&CLASS_IN.to_be_bytes());
    }

    response.extend_from_slice(&NAME_POINTER);
    response.extend_from_slice(&TYPE_A.to_be_bytes());
    response.extend_from_slice(&CLASS_IN.to_be_bytes());
    response.extend_from_slice(&BLOCKED_ANSWER_TTL.to_be_bytes());
    response.extend_from_slice(&4u16.to_be_bytes());
    response.extend_from_slice(&[0, 0, 0, 0]);
    Some(response)
}
