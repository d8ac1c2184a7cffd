//! Packet builders shared by unit tests.

use std::net::Ipv4Addr;

pub const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 111, 222, 1);
pub const SERVER: Ipv4Addr = Ipv4Addr::new(10, 111, 222, 2);
pub const CLIENT_PORT: u16 = 40_123;

pub fn encode_name(name: &str) -> Vec<u8> {
    let mut encoded = Vec::new();
    if !name.is_empty() {
        for label in name.split('.') {
            encoded.push(label.len() as u8);
            encoded.extend_from_slice(label.as_bytes());
        }
    }
    encoded.push(0);
    encoded
}

/// Standard recursive A/IN query for `name`.
pub fn dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(&[0x01, 0x00]); // RD
    payload.extend_from_slice(&[0x00, 0x01]); // qdcount
    payload.extend_from_slice(&[0x00, 0x00]); // ancount
    payload.extend_from_slice(&[0x00, 0x00]); // nscount
    payload.extend_from_slice(&[0x00, 0x00]); // arcount
    payload.extend_from_slice(&encode_name(name));
    payload.extend_from_slice(&[0x00, 0x01]); // type A
    payload.extend_from_slice(&[0x00, 0x01]); // class IN
    payload
}

/// Upstream-style answer for `name` resolving to `addr`.
pub fn dns_answer(id: u16, name: &str, addr: [u8; 4]) -> Vec<u8> {
    let mut payload = dns_query(id, name);
    payload[2] = 0x81;
    payload[3] = 0x80;
    payload[7] = 1; // ancount
    payload.extend_from_slice(&[0xC0, 0x0C]);
    payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    payload.extend_from_slice(&300u32.to_be_bytes());
    payload.extend_from_slice(&[0x00, 0x04]);
    payload.extend_from_slice(&addr);
    payload
}

/// IPv4/UDP datagram with a 20-byte header carrying `payload`.
pub fn udp_packet(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = 28 + payload.len();
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..22].copy_from_slice(&src_port.to_be_bytes());
    packet[22..24].copy_from_slice(&dst_port.to_be_bytes());
    packet[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    packet[28..].copy_from_slice(payload);
    packet
}

/// Tunnel packet carrying an A query for `name` from the test client.
pub fn query_packet(id: u16, name: &str) -> Vec<u8> {
    udp_packet(CLIENT, CLIENT_PORT, SERVER, 53, &dns_query(id, name))
}
