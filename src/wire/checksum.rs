//! Internet checksum helpers for the IPv4 header.

/// Sums `bytes` as big-endian 16-bit words on top of `sum`, folding carries.
/// An odd trailing byte is padded with zero.
pub fn fold_sum(mut sum: u32, bytes: &[u8]) -> u16 {
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
    }
    if let Some(&byte) = chunks.remainder().first() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([byte, 0])));
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Ones' complement of the folded sum.
pub fn ones_complement(sum: u32, bytes: &[u8]) -> u16 {
    !fold_sum(sum, bytes)
}

/// Checksum for an IPv4 header whose checksum field is zeroed.
pub fn ipv4_header(header: &[u8]) -> u16 {
    ones_complement(0, header)
}

/// True when the header, checksum field included, folds to 0xFFFF.
pub fn verify_ipv4_header(header: &[u8]) -> bool {
    fold_sum(0, header) == 0xFFFF
}
