//! Ethernet/ARP/IPv4/IPv6/ICMPv6-ND frame parsing.
//!
//! Every accessor here takes a raw byte slice beginning at the Ethernet
//! header and returns a parsed view or an error; nothing is parsed via
//! pointer casts, only explicit big-endian field reads.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::addr_table::ProtoAddr;
use crate::error::ClassifyError;
use crate::mac::MacAddr;

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

const ETH_HLEN: usize = 14;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Direction a frame is being evaluated for, relative to the host's own
/// tunnel-originated traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// A 5-tuple key used by the state table, family-generic over v4/v6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowKey {
    pub proto: u8,
    pub src: IpEndpoint,
    pub dst: IpEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpEndpoint {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
}

pub fn ether_src(buf: &[u8]) -> Option<MacAddr> {
    if buf.len() < ETH_HLEN {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&buf[6..12]);
    Some(MacAddr(mac))
}

pub fn ether_type(buf: &[u8]) -> Option<u16> {
    if buf.len() < ETH_HLEN {
        return None;
    }
    Some(u16::from_be_bytes([buf[12], buf[13]]))
}

/// Extract the source protocol address for passive learning, per the rules
/// in the frame-parser component design: ARP request/reply yields the
/// sender IPv4, ICMPv6 ND messages yield the IPv6 source (and flag ROUTER
/// for Router Advertisements).
pub fn learn_source(buf: &[u8]) -> (Option<ProtoAddr>, u8) {
    match ether_type(buf) {
        Some(ETHERTYPE_ARP) => parse_arp_source(buf).map(|a| (Some(a), 0)).unwrap_or((None, 0)),
        Some(ETHERTYPE_IPV6) => parse_icmp6_nd_source(buf).unwrap_or((None, 0)),
        _ => (None, 0),
    }
}

fn parse_arp_source(buf: &[u8]) -> Option<ProtoAddr> {
    // Ethernet header (14) + ARP packet (28 for HW=Ethernet, PRO=IPv4)
    if buf.len() < ETH_HLEN + 28 {
        return None;
    }
    let arp = &buf[ETH_HLEN..];
    let hrd = u16::from_be_bytes([arp[0], arp[1]]);
    let pro = u16::from_be_bytes([arp[2], arp[3]]);
    let op = u16::from_be_bytes([arp[6], arp[7]]);
    const ARPHRD_ETHER: u16 = 1;
    const ARPOP_REQUEST: u16 = 1;
    const ARPOP_REPLY: u16 = 2;
    if hrd != ARPHRD_ETHER || pro != ETHERTYPE_IPV4 {
        return None;
    }
    if op != ARPOP_REQUEST && op != ARPOP_REPLY {
        return None;
    }
    // sender hw addr (6) then sender proto addr (4) starting at offset 8
    let spa = &arp[14..18];
    Some(ProtoAddr::Ipv4(Ipv4Addr::new(spa[0], spa[1], spa[2], spa[3])))
}

fn parse_icmp6_nd_source(buf: &[u8]) -> Option<(Option<ProtoAddr>, u8)> {
    const IP6_HLEN: usize = 40;
    if buf.len() < ETH_HLEN + IP6_HLEN {
        return None;
    }
    let ip6 = &buf[ETH_HLEN..];
    let version = ip6[0] >> 4;
    if version != 6 {
        return None;
    }
    let next_header = ip6[6];
    if next_header != 58 {
        // not ICMPv6
        return None;
    }
    if buf.len() < ETH_HLEN + IP6_HLEN + 4 {
        return None;
    }
    let icmp6_type = buf[ETH_HLEN + IP6_HLEN];
    let mut src = [0u8; 16];
    src.copy_from_slice(&ip6[8..24]);
    let addr = Ipv6Addr::from(src);

    match icmp6_type {
        133 | 134 | 135 | 136 => {
            let flags = if icmp6_type == 134 { crate::addr_table::ROUTER } else { 0 };
            Some((Some(ProtoAddr::Ipv6(addr)), flags))
        }
        _ => None,
    }
}

/// Classify a frame into a state-table flow key for the given direction.
/// Returns `Ok(None)` for a well-formed frame whose protocol isn't tracked
/// (e.g. ICMPv6, or plain "not an IP frame").
pub fn classify(buf: &[u8], dir: Direction) -> Result<FlowKey, ClassifyError> {
    match ether_type(buf).ok_or(ClassifyError::TooShort)? {
        ETHERTYPE_IPV4 => classify_ipv4(&buf[ETH_HLEN..], dir),
        ETHERTYPE_IPV6 => classify_ipv6(&buf[ETH_HLEN..], dir),
        other => Err(ClassifyError::UnsupportedEtherType(other)),
    }
}

fn classify_ipv4(ip: &[u8], dir: Direction) -> Result<FlowKey, ClassifyError> {
    if ip.len() < 20 {
        return Err(ClassifyError::TooShort);
    }
    let version = ip[0] >> 4;
    let ihl = (ip[0] & 0x0f) as usize;
    if version != 4 || ihl < 5 {
        return Err(ClassifyError::NotIp);
    }
    let hlen = ihl * 4;
    if ip.len() < hlen + 4 {
        return Err(ClassifyError::TooShort);
    }
    let proto = ip[9];
    let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

    match proto {
        PROTO_TCP | PROTO_UDP => {
            let sport = u16::from_be_bytes([ip[hlen], ip[hlen + 1]]);
            let dport = u16::from_be_bytes([ip[hlen + 2], ip[hlen + 3]]);
            Ok(match dir {
                Direction::Outgoing => FlowKey {
                    proto,
                    src: IpEndpoint::V4(src, sport),
                    dst: IpEndpoint::V4(dst, dport),
                },
                Direction::Incoming => FlowKey {
                    proto,
                    src: IpEndpoint::V4(dst, dport),
                    dst: IpEndpoint::V4(src, sport),
                },
            })
        }
        PROTO_ICMP => {
            if ip.len() < hlen + 8 {
                return Err(ClassifyError::TooShort);
            }
            let icmp_type = ip[hlen];
            let icmp_code = ip[hlen + 1];
            let ident = u16::from_be_bytes([ip[hlen + 4], ip[hlen + 5]]);
            match dir {
                Direction::Outgoing if icmp_type == 8 && icmp_code == 0 => Ok(FlowKey {
                    proto,
                    src: IpEndpoint::V4(src, 0),
                    dst: IpEndpoint::V4(dst, ident),
                }),
                Direction::Incoming if icmp_type == 0 && icmp_code == 0 => Ok(FlowKey {
                    proto,
                    src: IpEndpoint::V4(dst, 0),
                    dst: IpEndpoint::V4(src, ident),
                }),
                _ => Err(ClassifyError::UnsupportedProto(proto)),
            }
        }
        other => Err(ClassifyError::UnsupportedProto(other)),
    }
}

fn classify_ipv6(ip: &[u8], dir: Direction) -> Result<FlowKey, ClassifyError> {
    if ip.len() < 40 + 4 {
        return Err(ClassifyError::TooShort);
    }
    let version = ip[0] >> 4;
    if version != 6 {
        return Err(ClassifyError::NotIp);
    }
    let next_header = ip[6];
    // explicit divergence from the historical always-true `!= UDP || != TCP`
    // condition: only TCP and UDP flows are tracked over IPv6.
    if next_header != PROTO_TCP && next_header != PROTO_UDP {
        return Err(ClassifyError::UnsupportedProto(next_header));
    }
    let mut src_bytes = [0u8; 16];
    let mut dst_bytes = [0u8; 16];
    src_bytes.copy_from_slice(&ip[8..24]);
    dst_bytes.copy_from_slice(&ip[24..40]);
    let src = Ipv6Addr::from(src_bytes);
    let dst = Ipv6Addr::from(dst_bytes);
    let sport = u16::from_be_bytes([ip[40], ip[41]]);
    let dport = u16::from_be_bytes([ip[42], ip[43]]);

    Ok(match dir {
        Direction::Outgoing => {
            FlowKey { proto: next_header, src: IpEndpoint::V6(src, sport), dst: IpEndpoint::V6(dst, dport) }
        }
        Direction::Incoming => {
            FlowKey { proto: next_header, src: IpEndpoint::V6(dst, dport), dst: IpEndpoint::V6(src, sport) }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth(src: [u8; 6], dst: [u8; 6], ethertype: u16) -> Vec<u8> {
        let mut v = vec![0u8; ETH_HLEN];
        v[0..6].copy_from_slice(&dst);
        v[6..12].copy_from_slice(&src);
        v[12..14].copy_from_slice(&ethertype.to_be_bytes());
        v
    }

    #[test]
    fn arp_reply_source_learned() {
        let mut frame = eth([0xaa; 6], [0xbb; 6], ETHERTYPE_ARP);
        let mut arp = vec![0u8; 28];
        arp[0..2].copy_from_slice(&1u16.to_be_bytes()); // ARPHRD_ETHER
        arp[2..4].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        arp[4] = 6;
        arp[5] = 4;
        arp[6..8].copy_from_slice(&2u16.to_be_bytes()); // reply
        arp[8..14].copy_from_slice(&[0xaa; 6]);
        arp[14..18].copy_from_slice(&[10, 0, 0, 5]);
        frame.extend_from_slice(&arp);

        let (addr, flags) = learn_source(&frame);
        assert_eq!(addr, Some(ProtoAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 5))));
        assert_eq!(flags, 0);
    }

    #[test]
    fn tcp_classify_roundtrips_direction() {
        let mut frame = eth([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12], ETHERTYPE_IPV4);
        let mut ip = vec![0u8; 20 + 4];
        ip[0] = 0x45;
        ip[9] = PROTO_TCP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 5]);
        ip[16..20].copy_from_slice(&[93, 184, 216, 34]);
        ip[20..22].copy_from_slice(&54321u16.to_be_bytes());
        ip[22..24].copy_from_slice(&80u16.to_be_bytes());
        frame.extend_from_slice(&ip);

        let out = classify(&frame, Direction::Outgoing).unwrap();
        assert_eq!(out.src, IpEndpoint::V4(Ipv4Addr::new(10, 0, 0, 5), 54321));
        assert_eq!(out.dst, IpEndpoint::V4(Ipv4Addr::new(93, 184, 216, 34), 80));

        let reply = classify(&frame, Direction::Incoming).unwrap();
        assert_eq!(reply.src, IpEndpoint::V4(Ipv4Addr::new(93, 184, 216, 34), 80));
        assert_eq!(reply.dst, IpEndpoint::V4(Ipv4Addr::new(10, 0, 0, 5), 54321));
    }

    #[test]
    fn ipv6_icmp_is_unsupported() {
        let mut frame = eth([1; 6], [2; 6], ETHERTYPE_IPV6);
        let mut ip6 = vec![0u8; 44];
        ip6[0] = 0x60;
        ip6[6] = 58; // ICMPv6
        frame.extend_from_slice(&ip6);
        assert_eq!(
            classify(&frame, Direction::Outgoing),
            Err(ClassifyError::UnsupportedProto(58))
        );
    }
}
