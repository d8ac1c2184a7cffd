//! IPv4/UDP framing for DNS traffic crossing the tunnel.
//!
//! Parsing is deliberately narrow: anything that is not an IPv4 UDP datagram
//! addressed to port 53 carrying a readable DNS question is rejected with a
//! [`ParseError`] and dropped by the caller.

pub mod checksum;
mod packet_builder;

pub use packet_builder::build_udp_response;

use crate::dns::{self, HEADER_LEN as DNS_HEADER_LEN};
use std::net::Ipv4Addr;

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
/// Smallest datagram that can carry a UDP header.
pub const MIN_PACKET_LEN: usize = IPV4_MIN_HEADER_LEN + UDP_HEADER_LEN;
pub const DNS_PORT: u16 = 53;
const PROTO_UDP: u8 = 17;

/// Why a tunnel packet was not treated as a DNS query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer than 28 bytes.
    TooShort(usize),
    /// IP version nibble is not 4.
    NotIpv4(u8),
    /// IPv4 payload is not UDP.
    NotUdp(u8),
    /// UDP destination port is not 53.
    NotDnsPort(u16),
    /// IHL smaller than 5 or header/UDP extends past the packet.
    MalformedIpv4Header,
    /// DNS header shorter than 12 bytes or the question name is unreadable.
    MalformedDns,
}

impl ParseError {
    /// True for ordinary non-DNS traffic as opposed to broken packets.
    pub fn is_irrelevant(&self) -> bool {
        matches!(
            self,
            Self::NotIpv4(_) | Self::NotUdp(_) | Self::NotDnsPort(_)
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::TooShort(_) => "packet shorter than IPv4+UDP headers",
            Self::NotIpv4(_) => "not IPv4",
            Self::NotUdp(_) => "not UDP",
            Self::NotDnsPort(_) => "not addressed to port 53",
            Self::MalformedIpv4Header => "malformed IPv4 header",
            Self::MalformedDns => "malformed DNS question",
        }
    }
}

/// A DNS query lifted out of a tunnel packet. Borrows the packet buffer and
/// must not outlive the processing of that packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery<'a> {
    pub transaction_id: u16,
    /// Question name + QTYPE/QCLASS, verbatim.
    pub question: &'a [u8],
    /// Lowercase queried name.
    pub domain: String,
    pub client_addr: Ipv4Addr,
    pub client_port: u16,
    pub server_addr: Ipv4Addr,
    /// Whole DNS message, verbatim.
    pub message: &'a [u8],
}

/// Parses a raw tunnel packet of `packet.len()` bytes.
pub fn parse_query(packet: &[u8]) -> Result<ParsedQuery<'_>, ParseError> {
    if packet.len() < MIN_PACKET_LEN {
        return Err(ParseError::TooShort(packet.len()));
    }
    let version = packet[0] >> 4;
    if version != 4 {
        return Err(ParseError::NotIpv4(version));
    }
    let protocol = packet[9];
    if protocol != PROTO_UDP {
        return Err(ParseError::NotUdp(protocol));
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || header_len + UDP_HEADER_LEN > packet.len() {
        return Err(ParseError::MalformedIpv4Header);
    }

    let udp = &packet[header_len..];
    let client_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    if dst_port != DNS_PORT {
        return Err(ParseError::NotDnsPort(dst_port));
    }

    // Trust the IPv4 total length only when it is consistent with what was read.
    let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    let end = if (header_len + UDP_HEADER_LEN..=packet.len()).contains(&total_len) {
        total_len
    } else {
        packet.len()
    };
    let message = &packet[header_len + UDP_HEADER_LEN..end];
    if message.len() < DNS_HEADER_LEN {
        return Err(ParseError::MalformedDns);
    }
    let question = dns::read_question(message).ok_or(ParseError::MalformedDns)?;

    Ok(ParsedQuery {
        transaction_id: u16::from_be_bytes([message[0], message[1]]),
        question: question.section,
        domain: question.name,
        client_addr: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
        client_port,
        server_addr: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        message,
    })
}
