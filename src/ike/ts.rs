//! IKEv2 traffic selectors: wire format, the subnet <-> range
//! conversions, and the range arithmetic the narrowing engine scores
//! with.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::config::conn::End;
use crate::ike::IkeError;

/// Hard cap on selectors per payload. Policy, not protocol.
pub const MAX_SELECTORS: usize = 16;

pub const TS_IPV4_ADDR_RANGE: u8 = 7;
pub const TS_IPV6_ADDR_RANGE: u8 = 8;
pub const TS_FC_ADDR_RANGE: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSelector {
    pub ts_type: u8,
    pub ipprotoid: u8,
    pub startport: u16,
    pub endport: u16,
    pub start_addr: IpAddr,
    pub end_addr: IpAddr,
}

impl TrafficSelector {
    pub fn ipv4(proto: u8, ports: (u16, u16), start: Ipv4Addr, end: Ipv4Addr) -> Self {
        TrafficSelector {
            ts_type: TS_IPV4_ADDR_RANGE,
            ipprotoid: proto,
            startport: ports.0,
            endport: ports.1,
            start_addr: IpAddr::V4(start),
            end_addr: IpAddr::V4(end),
        }
    }

    fn addr_len(&self) -> usize {
        match self.start_addr {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        }
    }

    fn selector_len(&self) -> usize {
        8 + 2 * self.addr_len()
    }
}

impl std::fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}/{}/{}..{}",
            self.start_addr, self.end_addr, self.ipprotoid, self.startport, self.endport
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TsPayload {
    pub selectors: Vec<TrafficSelector>,
}

impl TsPayload {
    pub fn single(ts: TrafficSelector) -> Self {
        TsPayload {
            selectors: vec![ts],
        }
    }

    /// Payload body:
    ///   u8 num_ts, u8 reserved[3], then per selector:
    ///   u8 ts_type, u8 ip_protocol, u16 selector_length,
    ///   u16 start_port, u16 end_port, start_address, end_address.
    pub fn emit(&self, out: &mut Vec<u8>) {
        out.push(self.selectors.len() as u8);
        out.extend_from_slice(&[0, 0, 0]);
        for ts in &self.selectors {
            out.push(ts.ts_type);
            out.push(ts.ipprotoid);
            out.extend_from_slice(&(ts.selector_len() as u16).to_be_bytes());
            out.extend_from_slice(&ts.startport.to_be_bytes());
            out.extend_from_slice(&ts.endport.to_be_bytes());
            match (ts.start_addr, ts.end_addr) {
                (IpAddr::V4(s), IpAddr::V4(e)) => {
                    out.extend_from_slice(&s.octets());
                    out.extend_from_slice(&e.octets());
                }
                (IpAddr::V6(s), IpAddr::V6(e)) => {
                    out.extend_from_slice(&s.octets());
                    out.extend_from_slice(&e.octets());
                }
                _ => unreachable!("mixed-family selector"),
            }
        }
    }

    pub fn parse(body: &[u8]) -> Result<TsPayload, IkeError> {
        if body.len() < 4 {
            return Err(IkeError::Truncated);
        }
        let num = body[0] as usize;
        if num > MAX_SELECTORS {
            return Err(IkeError::Malformed(format!(
                "TS payload carries {} selectors, cap is {}",
                num, MAX_SELECTORS
            )));
        }
        let mut rest = &body[4..];
        let mut selectors = Vec::with_capacity(num);
        for i in 0..num {
            if rest.len() < 8 {
                return Err(IkeError::Truncated);
            }
            let ts_type = rest[0];
            let ipprotoid = rest[1];
            let sel_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            let startport = u16::from_be_bytes([rest[4], rest[5]]);
            let endport = u16::from_be_bytes([rest[6], rest[7]]);
            if startport > endport {
                return Err(IkeError::Malformed(format!(
                    "traffic selector {} has an invalid port range",
                    i
                )));
            }
            let addr_len = match ts_type {
                TS_IPV4_ADDR_RANGE => 4,
                TS_IPV6_ADDR_RANGE => 16,
                other => {
                    return Err(IkeError::Malformed(format!(
                        "unsupported TS type {}",
                        other
                    )))
                }
            };
            if sel_len != 8 + 2 * addr_len || rest.len() < sel_len {
                return Err(IkeError::Malformed(format!(
                    "TS selector length {} does not match type {}",
                    sel_len, ts_type
                )));
            }
            let (start_addr, end_addr) = if addr_len == 4 {
                let s: [u8; 4] = rest[8..12].try_into().unwrap();
                let e: [u8; 4] = rest[12..16].try_into().unwrap();
                (
                    IpAddr::V4(Ipv4Addr::from(s)),
                    IpAddr::V4(Ipv4Addr::from(e)),
                )
            } else {
                let s: [u8; 16] = rest[8..24].try_into().unwrap();
                let e: [u8; 16] = rest[24..40].try_into().unwrap();
                (
                    IpAddr::V6(Ipv6Addr::from(s)),
                    IpAddr::V6(Ipv6Addr::from(e)),
                )
            };
            selectors.push(TrafficSelector {
                ts_type,
                ipprotoid,
                startport,
                endport,
                start_addr,
                end_addr,
            });
            rest = &rest[sel_len..];
        }
        Ok(TsPayload { selectors })
    }
}

fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(a) as u128,
        IpAddr::V6(a) => u128::from(a),
    }
}

/// Number of significant bits in the size of the range:
/// floor(lg(|high - low| + 1)).
pub fn iprange_bits(low: IpAddr, high: IpAddr) -> u32 {
    let lo = addr_to_u128(low);
    let hi = addr_to_u128(high);
    let diff = hi.wrapping_sub(lo);
    // floor(lg(x)) is the bit length of x minus one
    let size = diff.saturating_add(1);
    127 - size.leading_zeros()
}

/// Turn a connection end into the selector we announce for it:
/// subnet becomes an address range; port 0 or a wildcard port becomes
/// the full 0..65535 range.
pub fn end_to_ts(end: &End) -> TrafficSelector {
    let (ts_type, start_addr, end_addr) = match end.client {
        IpNet::V4(net) => (
            TS_IPV4_ADDR_RANGE,
            IpAddr::V4(net.network()),
            IpAddr::V4(net.broadcast()),
        ),
        IpNet::V6(net) => (
            TS_IPV6_ADDR_RANGE,
            IpAddr::V6(net.network()),
            IpAddr::V6(net.broadcast()),
        ),
    };

    let (startport, endport) = if end.port == 0 || end.has_port_wildcard {
        (0, 65535)
    } else {
        (end.port, end.port)
    };

    TrafficSelector {
        ts_type,
        ipprotoid: end.protocol,
        startport,
        endport,
        start_addr,
        end_addr,
    }
}

/// Inverse of the address part of `end_to_ts`: a range that is exactly
/// one CIDR block becomes a subnet. Anything else is an error; nothing
/// is silently truncated.
pub fn ts_to_subnet(ts: &TrafficSelector) -> Result<IpNet, IkeError> {
    match (ts.start_addr, ts.end_addr) {
        (IpAddr::V4(start), IpAddr::V4(end)) => {
            let s = u32::from(start);
            let e = u32::from(end);
            if s > e {
                return Err(IkeError::Malformed("inverted address range".to_string()));
            }
            let size = (e - s) as u64 + 1;
            if !size.is_power_of_two() || (s as u64) % size != 0 {
                return Err(IkeError::Malformed(format!(
                    "range {}-{} is not a CIDR block",
                    start, end
                )));
            }
            let prefix = 32 - size.trailing_zeros() as u8;
            Ok(IpNet::V4(Ipv4Net::new(start, prefix).unwrap()))
        }
        (IpAddr::V6(start), IpAddr::V6(end)) => {
            let s = u128::from(start);
            let e = u128::from(end);
            if s > e {
                return Err(IkeError::Malformed("inverted address range".to_string()));
            }
            let diff = e - s;
            let size_bits = if diff == u128::MAX {
                128
            } else if (diff + 1).is_power_of_two() {
                (diff + 1).trailing_zeros()
            } else {
                return Err(IkeError::Malformed("range is not a CIDR block".to_string()));
            };
            if size_bits < 128 && s % (1u128 << size_bits) != 0 {
                return Err(IkeError::Malformed("range is not aligned".to_string()));
            }
            let prefix = (128 - size_bits) as u8;
            Ok(IpNet::V6(Ipv6Net::new(start, prefix).unwrap()))
        }
        _ => Err(IkeError::Malformed("mixed-family range".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::conn::PeerId;

    fn end(client: &str, port: u16, protocol: u8) -> End {
        End {
            client: client.parse().unwrap(),
            host_addr: "192.0.2.1".parse().unwrap(),
            port,
            protocol,
            has_port_wildcard: false,
            id: PeerId::None,
            ca: None,
            sig_pub_key: None,
        }
    }

    #[test]
    fn end_to_ts_expands_subnet_and_wildcard_port() {
        let ts = end_to_ts(&end("10.0.1.0/24", 0, 0));
        assert_eq!(ts.start_addr, "10.0.1.0".parse::<IpAddr>().unwrap());
        assert_eq!(ts.end_addr, "10.0.1.255".parse::<IpAddr>().unwrap());
        assert_eq!((ts.startport, ts.endport), (0, 65535));
        assert_eq!(ts.ipprotoid, 0);
    }

    #[test]
    fn end_to_ts_pins_single_port() {
        let ts = end_to_ts(&end("10.0.1.8/32", 443, 6));
        assert_eq!((ts.startport, ts.endport), (443, 443));
        assert_eq!(ts.ipprotoid, 6);
        assert_eq!(ts.start_addr, ts.end_addr);
    }

    #[test]
    fn end_to_ts_then_ts_to_subnet_is_identity() {
        for cidr in ["10.0.1.0/24", "172.16.0.0/12", "192.0.2.77/32", "2001:db8::/64"] {
            let e = end(cidr, 0, 0);
            let ts = end_to_ts(&e);
            assert_eq!(ts_to_subnet(&ts).unwrap(), e.client, "cidr {}", cidr);
        }
    }

    #[test]
    fn ts_to_subnet_rejects_non_cidr() {
        let ts = TrafficSelector::ipv4(
            0,
            (0, 65535),
            "10.0.0.1".parse().unwrap(),
            "10.0.0.7".parse().unwrap(),
        );
        assert!(ts_to_subnet(&ts).is_err());
    }

    #[test]
    fn iprange_bits_counts_range_size() {
        let bits = |a: &str, b: &str| {
            iprange_bits(a.parse::<IpAddr>().unwrap(), b.parse::<IpAddr>().unwrap())
        };
        assert_eq!(bits("10.0.2.0", "10.0.2.255"), 8);
        assert_eq!(bits("10.0.2.5", "10.0.2.5"), 0);
        assert_eq!(bits("0.0.0.0", "255.255.255.255"), 32);
        assert_eq!(bits("10.0.0.0", "10.0.0.2"), 1); // floor(lg 3)
    }

    #[test]
    fn payload_wire_round_trip() {
        let payload = TsPayload {
            selectors: vec![
                TrafficSelector::ipv4(
                    6,
                    (443, 443),
                    "10.0.2.5".parse().unwrap(),
                    "10.0.2.5".parse().unwrap(),
                ),
                TrafficSelector {
                    ts_type: TS_IPV6_ADDR_RANGE,
                    ipprotoid: 0,
                    startport: 0,
                    endport: 65535,
                    start_addr: "2001:db8::".parse().unwrap(),
                    end_addr: "2001:db8::ffff".parse().unwrap(),
                },
            ],
        };
        let mut out = Vec::new();
        payload.emit(&mut out);
        // v4 selector is 16 bytes, v6 selector is 40
        assert_eq!(out.len(), 4 + 16 + 40);
        assert_eq!(out[0], 2);
        let parsed = TsPayload::parse(&out).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn parse_rejects_inverted_ports() {
        let ts = TrafficSelector::ipv4(
            0,
            (0, 65535),
            "10.0.0.0".parse().unwrap(),
            "10.0.0.255".parse().unwrap(),
        );
        let mut out = Vec::new();
        TsPayload::single(ts).emit(&mut out);
        out[8] = 0xff; // start_port > end_port
        out[9] = 0xff;
        assert!(TsPayload::parse(&out).is_err());
    }

    #[test]
    fn parse_rejects_selector_overflow() {
        let ts = TrafficSelector::ipv4(
            0,
            (0, 65535),
            "10.0.0.0".parse().unwrap(),
            "10.0.0.255".parse().unwrap(),
        );
        let payload = TsPayload {
            selectors: vec![ts; MAX_SELECTORS + 1],
        };
        let mut out = Vec::new();
        payload.emit(&mut out);
        assert!(TsPayload::parse(&out).is_err());
    }
}
