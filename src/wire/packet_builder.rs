use super::{checksum, DNS_PORT, IPV4_MIN_HEADER_LEN, UDP_HEADER_LEN};
use std::net::Ipv4Addr;

const DEFAULT_TTL: u8 = 64;
const PROTO_UDP: u8 = 17;

/// Frames a DNS `payload` as an IPv4/UDP datagram from the virtual DNS server
/// (`server:53`) back to `client:client_port`.
///
/// The UDP checksum is left at zero, which IPv4 defines as "not computed".
pub fn build_udp_response(
    server: Ipv4Addr,
    client: Ipv4Addr,
    client_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_MIN_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];

    // IPv4 header
    buffer[0] = 0x45; // version 4, IHL 5
    buffer[1] = 0; // DSCP/ECN
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    buffer[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/fragment
    buffer[8] = DEFAULT_TTL;
    buffer[9] = PROTO_UDP;
    buffer[12..16].copy_from_slice(&server.octets());
    buffer[16..20].copy_from_slice(&client.octets());

    // UDP header
    let udp_offset = IPV4_MIN_HEADER_LEN;
    buffer[udp_offset..udp_offset + 2].copy_from_slice(&DNS_PORT.to_be_bytes());
    buffer[udp_offset + 2..udp_offset + 4].copy_from_slice(&client_port.to_be_bytes());
    buffer[udp_offset + 4..udp_offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    // checksum at udp_offset + 6..8 stays zero

    buffer[udp_offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    let ip_cksum = checksum::ipv4_header(&buffer[..IPV4_MIN_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
    buffer
}
