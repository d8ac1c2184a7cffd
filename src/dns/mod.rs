//! DNS message helpers: question extraction, transaction-id rewriting and the
//! synthetic answer returned for blocked names.

mod synth;

pub use synth::{synthesize_blocked, BLOCKED_ANSWER_TTL};

use smallvec::SmallVec;

/// Fixed DNS header length.
pub const HEADER_LEN: usize = 12;
/// Longest presentation-format name we accept.
const MAX_NAME_LEN: usize = 253;

pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

/// First question of a DNS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question<'a> {
    /// Lowercased, dot-joined name without a trailing dot.
    pub name: String,
    /// Raw question bytes: encoded name, plus QTYPE/QCLASS when present.
    pub section: &'a [u8],
    /// False when the message ended before QTYPE/QCLASS.
    pub has_type_class: bool,
}

/// Reads the first question name starting right after the header.
///
/// Returns `None` when a label runs past the buffer, the name is not
/// terminated, or a label length uses the pointer/reserved bits (queries
/// never compress their first name).
pub fn read_question(message: &[u8]) -> Option<Question<'_>> {
    if message.len() < HEADER_LEN {
        return None;
    }
    let mut labels: SmallVec<[&[u8]; 8]> = SmallVec::new();
    let mut offset = HEADER_LEN;
    loop {
        let len = usize::from(*message.get(offset)?);
        offset += 1;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        let label = message.get(offset..offset + len)?;
        labels.push(label);
        offset += len;
    }

    let mut name = String::with_capacity(offset - HEADER_LEN);
    for (idx, label) in labels.iter().enumerate() {
        if idx > 0 {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
    }
    if name.len() > MAX_NAME_LEN {
        return None;
    }
    name.make_ascii_lowercase();

    let has_type_class = message.len() >= offset + 4;
    let end = if has_type_class { offset + 4 } else { offset };
    Some(Question {
        name,
        section: &message[HEADER_LEN..end],
        has_type_class,
    })
}

/// Transaction id of a DNS message, if the header is present.
pub fn transaction_id(message: &[u8]) -> Option<u16> {
    match message {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Copies `payload` and stamps `id` into its header.
pub fn with_transaction_id(payload: &[u8], id: u16) -> Vec<u8> {
    let mut response = payload.to_vec();
    if response.len() >= 2 {
        response[..2].copy_from_slice(&id.to_be_bytes());
    }
    response
}

/// Header fields worth logging about an upstream answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseSummary {
    pub is_response: bool,
    pub rcode: u8,
    pub answers: u16,
}

pub fn summarize_response(payload: &[u8]) -> Option<ResponseSummary> {
    if payload.len() < HEADER_LEN {
        return None;
    }
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    Some(ResponseSummary {
        is_response: flags & 0x8000 != 0,
        rcode: (flags & 0x000F) as u8,
        answers: u16::from_be_bytes([payload[6], payload[7]]),
    })
}
