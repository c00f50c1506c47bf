#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The packet handle that flows through a core's receive/admission/process
//! pipeline.
//!
//! The original dataplane attaches a per-flow-state pointer directly to each
//! packet's metadata area. Here a packet instead carries an index
//! (`flow_slot`) into the owning core's `FlowTable`, so no raw pointer is
//! ever shared across cores: a packet handed to a sw-queue and drained by a
//! different core simply gets re-resolved against that core's own table.

use flow::{FlowKey, L4Protocol};

/// A packet handle owned by exactly one core at a time.
///
/// `data` is the raw bytes starting at the Ethernet header. `rss_hash` is the
/// hash the NIC (or, in tests, the `FakeNic`) computed for this packet;
/// `rss_bucket` is `rss_hash % 512`. `flow_slot` is set once the owning core
/// has looked up or created the `FlowState` for this packet's flow.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Raw packet bytes, Ethernet header first.
    pub data: Vec<u8>,
    /// RSS hash as computed by the NIC.
    pub rss_hash: u32,
    /// Index into the owning core's `FlowTable`. `None` until the admission
    /// path resolves it.
    pub flow_slot: Option<u32>,
}

impl Packet {
    /// Creates a new packet from raw bytes, computing its RSS hash from the
    /// parsed flow key (mirrors what a real NIC's RSS hash function would do
    /// over the same tuple, since no hardware is present in this workspace).
    pub fn new(data: Vec<u8>) -> Self {
        let rss_hash = match parse_flow_key(&data) {
            Some(key) => key.crc32c(),
            None => 0,
        };
        Self {
            data,
            rss_hash,
            flow_slot: None,
        }
    }

    /// Returns the RSS bucket this packet belongs to, given a table size.
    pub fn rss_bucket(&self, rss_size: u16) -> u16 {
        (self.rss_hash % u32::from(rss_size)) as u16
    }

    /// Parses the 5-tuple flow key for this packet, or `None` if the packet
    /// is not a TCP/UDP-over-IPv4 packet (non-L4 packets are freed by the
    /// caller, per the receive-path spec).
    pub fn flow_key(&self) -> Option<FlowKey> {
        parse_flow_key(&self.data)
    }
}

const ETH_HEADER_LEN: usize = 14;
const IPV4_MIN_HEADER_LEN: usize = 20;

/// Parses an Ethernet + IPv4 + TCP/UDP header chain into a `FlowKey`.
///
/// This is intentionally minimal: it supports exactly the framing the
/// integration tests and the `FakeNic` produce (untagged Ethernet, IPv4, no
/// options). Anything else (IPv6, VLAN tags, IP options, other L4 protocols)
/// returns `None`, matching the "non-L4 is freed" rule of the receive path.
pub fn parse_flow_key(data: &[u8]) -> Option<FlowKey> {
    if data.len() < ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    if ethertype != 0x0800 {
        return None; // not IPv4
    }

    let ip = &data[ETH_HEADER_LEN..];
    let version = ip[0] >> 4;
    if version != 4 {
        return None;
    }
    let ihl = usize::from(ip[0] & 0x0F) * 4;
    if ihl < IPV4_MIN_HEADER_LEN || data.len() < ETH_HEADER_LEN + ihl + 4 {
        return None;
    }
    let proto = ip[9];
    let (l4_proto, src_ip, dst_ip) = match proto {
        6 => (L4Protocol::Tcp, ip[12..16].try_into().ok()?, ip[16..20].try_into().ok()?),
        17 => (L4Protocol::Udp, ip[12..16].try_into().ok()?, ip[16..20].try_into().ok()?),
        _ => return None,
    };

    let l4 = &data[ETH_HEADER_LEN + ihl..];
    if l4.len() < 4 {
        return None;
    }
    let src_port = u16::from_be_bytes([l4[0], l4[1]]);
    let dst_port = u16::from_be_bytes([l4[2], l4[3]]);

    Some(FlowKey::new(src_ip, dst_ip, l4_proto, src_port, dst_port))
}

/// Builds a synthetic Ethernet+IPv4+TCP/UDP packet carrying `payload_len`
/// bytes after the L4 header. Used by tests to inject literal flows.
pub fn build_test_packet(
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    proto: L4Protocol,
    src_port: u16,
    dst_port: u16,
    payload_len: usize,
) -> Packet {
    let mut data = vec![0u8; ETH_HEADER_LEN];
    data[12] = 0x08;
    data[13] = 0x00;

    let mut ip_header = vec![0u8; IPV4_MIN_HEADER_LEN];
    ip_header[0] = 0x45; // version 4, IHL 5
    ip_header[9] = match proto {
        L4Protocol::Tcp => 6,
        L4Protocol::Udp => 17,
    };
    ip_header[12..16].copy_from_slice(&src_ip);
    ip_header[16..20].copy_from_slice(&dst_ip);
    data.extend_from_slice(&ip_header);

    let mut l4_header = vec![0u8; 4];
    l4_header[0..2].copy_from_slice(&src_port.to_be_bytes());
    l4_header[2..4].copy_from_slice(&dst_port.to_be_bytes());
    data.extend_from_slice(&l4_header);
    data.extend(std::iter::repeat(0u8).take(payload_len));

    Packet::new(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_flow_key() {
        let packet = build_test_packet([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, 1000, 80, 8);
        let key = packet.flow_key().expect("tcp packet should parse");
        assert_eq!(key.src_ip, u32::from_be_bytes([10, 0, 0, 1]));
        assert_eq!(key.dst_ip, u32::from_be_bytes([10, 0, 0, 2]));
        assert_eq!(key.src_port, 1000);
        assert_eq!(key.dst_port, 80);
    }

    #[test]
    fn non_ip_packet_has_no_flow_key() {
        let data = vec![0u8; 40];
        let packet = Packet::new(data);
        assert!(packet.flow_key().is_none());
    }

    #[test]
    fn rss_bucket_is_bounded() {
        let packet = build_test_packet([1, 2, 3, 4], [5, 6, 7, 8], L4Protocol::Udp, 1, 2, 0);
        assert!(packet.rss_bucket(512) < 512);
    }
}
