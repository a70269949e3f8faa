//! Runtime connection entries: the operator-configured policies that
//! authorize SAs. Read-mostly; the only mutable fields are the newest-SA
//! serials, the version-fallback flag, and the narrowing rewrites the TS
//! engine applies.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;

use crate::crypto::cipher::CipherSuite;
use crate::crypto::sig::SigKeyPair;
use crate::engine::state::SerialNumber;
use crate::ike::proposal::V1AuthMethod;

/// Index of a connection in the store. Connections live for the process
/// lifetime; an id never dangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub usize);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn[{}]", self.0)
    }
}

/// Peer identity carried in IDi/IDr and matched against configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerId {
    None,
    Addr(IpAddr),
    Fqdn(String),
}

impl PeerId {
    /// Strict equality; two absent ids also match.
    pub fn same_id(&self, other: &PeerId) -> bool {
        match (self, other) {
            (PeerId::None, PeerId::None) => true,
            _ => self == other,
        }
    }

    /// Pattern match: an absent id on `other` is a wildcard, and an
    /// FQDN pattern may carry a leading `*.` label.
    pub fn match_id(&self, other: &PeerId) -> bool {
        match (self, other) {
            (_, PeerId::None) => true,
            (PeerId::Fqdn(name), PeerId::Fqdn(pattern)) => {
                if let Some(suffix) = pattern.strip_prefix("*.") {
                    name.ends_with(suffix)
                } else {
                    name == pattern
                }
            }
            _ => self == other,
        }
    }
}

/// Is `ca` acceptable under `trust_anchor`? No anchor configured means
/// any issuer is fine; certificate-chain walking is out of scope, so a
/// configured anchor must match exactly.
pub fn trusted_ca(ca: Option<&str>, trust_anchor: Option<&str>) -> bool {
    match trust_anchor {
        None => true,
        Some(anchor) => ca == Some(anchor),
    }
}

/// One side of an SPD route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct End {
    /// The client subnet this end protects.
    pub client: IpNet,
    /// IKE endpoint address.
    pub host_addr: IpAddr,
    /// Protected port; 0 means all ports.
    pub port: u16,
    /// Protected IP protocol; 0 means any.
    pub protocol: u8,
    pub has_port_wildcard: bool,
    pub id: PeerId,
    pub ca: Option<String>,
    /// Pinned raw public key for signature authentication of this end.
    pub sig_pub_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdRoute {
    pub this: End,
    pub that: End,
}

/// Connection policy bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Policy(u32);

impl Policy {
    pub const NONE: Policy = Policy(0);
    pub const ALLOW_NARROWING: Policy = Policy(1 << 0);
    pub const DONT_REKEY: Policy = Policy(1 << 1);
    pub const OPPORTUNISTIC: Policy = Policy(1 << 2);
    pub const IKEV1_ALLOW: Policy = Policy(1 << 3);
    pub const IKEV2_ALLOW: Policy = Policy(1 << 4);
    pub const IKEV2_PROPOSE: Policy = Policy(1 << 5);
    pub const GROUP: Policy = Policy(1 << 6);
    pub const GROUPINSTANCE: Policy = Policy(1 << 7);
    pub const REPLACE_IF_USED: Policy = Policy(1 << 8);
    pub const UP: Policy = Policy(1 << 9);
    pub const AGGRESSIVE: Policy = Policy(1 << 10);

    pub fn contains(self, other: Policy) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Policy) -> bool {
        self.0 & other.0 != 0
    }

    pub fn with(self, other: Policy) -> Policy {
        Policy(self.0 | other.0)
    }

    pub fn without(self, other: Policy) -> Policy {
        Policy(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Policy {
    type Output = Policy;
    fn bitor(self, rhs: Policy) -> Policy {
        self.with(rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpdAction {
    Hold,
    Clear,
    Restart,
}

impl std::fmt::Display for DpdAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DpdAction::Hold => "hold",
            DpdAction::Clear => "clear",
            DpdAction::Restart => "restart",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Permanent,
    Template,
    Instance,
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub name: String,
    pub kind: ConnKind,
    pub policy: Policy,
    /// Group-instance template family, when part of one.
    pub foodgroup: Option<String>,
    pub spd: Vec<SpdRoute>,

    pub retransmit_interval: Duration,
    pub retransmit_timeout: Duration,
    pub keying_tries: u32,

    pub dpd_delay: Duration,
    pub dpd_timeout: Duration,
    pub dpd_action: DpdAction,

    pub rekey_margin: Duration,
    pub sa_lifetime: Duration,
    /// Extra slack between the replace event and hard expiry.
    pub margin: Duration,

    pub psk: Option<Vec<u8>>,
    /// Our signing identity; present when the connection authenticates
    /// with signatures instead of a PSK.
    pub sig_key: Option<Arc<SigKeyPair>>,
    pub if_id: Option<u32>,
    pub suite: CipherSuite,

    pub newest_isakmp_sa: SerialNumber,
    pub newest_ipsec_sa: SerialNumber,
    /// Flipped by the every-third-keying-attempt version fallback.
    pub failed_ikev2: bool,
}

impl Connection {
    pub fn dpd_enabled(&self) -> bool {
        !self.dpd_delay.is_zero()
    }

    /// The phase-1 authentication mode this connection runs. A PSK wins
    /// when both are configured; the config loader guarantees at least
    /// one is.
    pub fn v1_auth_method(&self) -> V1AuthMethod {
        if self.psk.is_some() {
            V1AuthMethod::PreSharedKey
        } else {
            V1AuthMethod::EcdsaSha256
        }
    }

    /// Which IKE major version a fresh attempt should use.
    pub fn next_version_is_v2(&self) -> bool {
        if !self.policy.contains(Policy::IKEV2_ALLOW) {
            return false;
        }
        if !self.policy.contains(Policy::IKEV1_ALLOW) {
            return true;
        }
        self.policy.contains(Policy::IKEV2_PROPOSE) && !self.failed_ikev2
    }
}

#[derive(Debug, Default)]
pub struct ConnectionStore {
    conns: Vec<Connection>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        ConnectionStore { conns: Vec::new() }
    }

    pub fn add(&mut self, conn: Connection) -> ConnId {
        self.conns.push(conn);
        ConnId(self.conns.len() - 1)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(id.0)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(id.0)
    }

    pub fn by_name(&self, name: &str) -> Option<ConnId> {
        self.conns.iter().position(|c| c.name == name).map(ConnId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.conns.iter().enumerate().map(|(i, c)| (ConnId(i), c))
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Connections sharing the given host pair, in configuration order.
    pub fn find_host_pair(
        &self,
        this_addr: IpAddr,
        this_port: u16,
        that_addr: IpAddr,
        that_port: u16,
    ) -> Vec<ConnId> {
        let _ = (this_port, that_port); // host pairs key on addresses; IKE ports float with NAT
        self.conns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.spd.iter().any(|sr| {
                    sr.this.host_addr == this_addr && sr.that.host_addr == that_addr
                })
            })
            .map(|(i, _)| ConnId(i))
            .collect()
    }

    /// Group-instance templates, for the narrowing fallback scan.
    pub fn group_instance_templates(&self) -> Vec<ConnId> {
        self.conns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.policy.contains(Policy::GROUPINSTANCE) && c.kind == ConnKind::Template
            })
            .map(|(i, _)| ConnId(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end(client: &str, host: &str) -> End {
        End {
            client: client.parse().unwrap(),
            host_addr: host.parse().unwrap(),
            port: 0,
            protocol: 0,
            has_port_wildcard: false,
            id: PeerId::None,
            ca: None,
            sig_pub_key: None,
        }
    }

    pub(crate) fn test_conn(name: &str, this: End, that: End) -> Connection {
        Connection {
            name: name.to_string(),
            kind: ConnKind::Permanent,
            policy: Policy::IKEV2_ALLOW | Policy::IKEV2_PROPOSE,
            foodgroup: None,
            spd: vec![SpdRoute { this, that }],
            retransmit_interval: Duration::from_millis(500),
            retransmit_timeout: Duration::from_secs(60),
            keying_tries: 3,
            dpd_delay: Duration::ZERO,
            dpd_timeout: Duration::from_secs(120),
            dpd_action: DpdAction::Hold,
            rekey_margin: Duration::from_secs(540),
            sa_lifetime: Duration::from_secs(3600),
            margin: Duration::from_secs(60),
            psk: Some(b"test-psk".to_vec()),
            sig_key: None,
            if_id: None,
            suite: CipherSuite::default(),
            newest_isakmp_sa: SerialNumber::NOBODY,
            newest_ipsec_sa: SerialNumber::NOBODY,
            failed_ikev2: false,
        }
    }

    #[test]
    fn policy_bit_operations() {
        let p = Policy::IKEV2_ALLOW | Policy::ALLOW_NARROWING;
        assert!(p.contains(Policy::ALLOW_NARROWING));
        assert!(!p.contains(Policy::IKEV1_ALLOW));
        assert!(p.intersects(Policy::IKEV2_ALLOW | Policy::GROUP));
        assert!(!p.without(Policy::ALLOW_NARROWING).contains(Policy::ALLOW_NARROWING));
    }

    #[test]
    fn id_matching_rules() {
        let a = PeerId::Fqdn("east.example.org".to_string());
        assert!(a.same_id(&a));
        assert!(!a.same_id(&PeerId::None));
        assert!(a.match_id(&PeerId::None));
        assert!(a.match_id(&PeerId::Fqdn("*.example.org".to_string())));
        assert!(!a.match_id(&PeerId::Fqdn("*.example.net".to_string())));
    }

    #[test]
    fn trusted_ca_requires_exact_anchor() {
        assert!(trusted_ca(None, None));
        assert!(trusted_ca(Some("CN=Root"), None));
        assert!(trusted_ca(Some("CN=Root"), Some("CN=Root")));
        assert!(!trusted_ca(Some("CN=Other"), Some("CN=Root")));
        assert!(!trusted_ca(None, Some("CN=Root")));
    }

    #[test]
    fn host_pair_lookup_matches_addresses() {
        let mut store = ConnectionStore::new();
        let c1 = test_conn(
            "east-west",
            end("10.0.1.0/24", "192.0.2.1"),
            end("10.0.2.0/24", "192.0.2.2"),
        );
        let c2 = test_conn(
            "east-north",
            end("10.0.1.0/24", "192.0.2.1"),
            end("10.0.3.0/24", "192.0.2.3"),
        );
        let id1 = store.add(c1);
        let _id2 = store.add(c2);

        let found = store.find_host_pair(
            "192.0.2.1".parse().unwrap(),
            500,
            "192.0.2.2".parse().unwrap(),
            500,
        );
        assert_eq!(found, vec![id1]);
    }

    #[test]
    fn auth_method_follows_configured_material() {
        let mut c = test_conn(
            "a",
            end("10.0.1.0/24", "192.0.2.1"),
            end("10.0.2.0/24", "192.0.2.2"),
        );
        assert_eq!(c.v1_auth_method(), V1AuthMethod::PreSharedKey);
        c.psk = None;
        assert_eq!(c.v1_auth_method(), V1AuthMethod::EcdsaSha256);
    }

    #[test]
    fn version_selection_respects_fallback_flag() {
        let mut c = test_conn(
            "v",
            end("10.0.1.0/24", "192.0.2.1"),
            end("10.0.2.0/24", "192.0.2.2"),
        );
        c.policy = Policy::IKEV1_ALLOW | Policy::IKEV2_ALLOW | Policy::IKEV2_PROPOSE;
        assert!(c.next_version_is_v2());
        c.failed_ikev2 = true;
        assert!(!c.next_version_is_v2());
        c.policy = Policy::IKEV2_ALLOW;
        assert!(c.next_version_is_v2());
    }
}
