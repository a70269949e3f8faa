//! SA lifetime events (replace, replace-if-used, expire) and dead-peer
//! detection. Liveness is scheduled on the established child SA; the
//! probe bookkeeping lives on the parent IKE SA.

use std::time::{Duration, Instant};

use crate::config::conn::{ConnId, DpdAction, Policy};
use crate::engine::state::{SaKind, SerialNumber};
use crate::engine::timer::EventKind;
use crate::engine::{Engine, MIN_LIVENESS};
use crate::ike::IkeVersion;
use crate::kernel::{SaId, SaProto};

impl Engine {
    fn inbound_said(&self, serial: SerialNumber) -> Option<SaId> {
        let st = self.table.get(serial)?;
        if st.esp_spi_local == 0 {
            return None;
        }
        Some(SaId {
            proto: SaProto::Esp,
            spi: st.esp_spi_local,
            dst: st.local_addr.ip(),
        })
    }

    /// Soft-lifetime event: rekey the SA unless it is already
    /// superseded, or (in if-used mode) let an idle SA and its parent
    /// age out instead.
    pub(crate) async fn handle_sa_replace(&mut self, serial: SerialNumber, if_used: bool) {
        let Some(st) = self.table.get(serial) else {
            return;
        };
        let conn_id = st.connection;
        let is_ike = st.is_ike_sa();
        let parent = st.parent;
        let Some(conn) = self.conns.get(conn_id) else {
            return;
        };
        let newest = if is_ike {
            conn.newest_isakmp_sa
        } else {
            conn.newest_ipsec_sa
        };
        let rekey_margin = conn.rekey_margin;
        let margin = conn.margin;

        if !newest.is_nobody() && newest > serial {
            // already superseded; it will expire on its own
            tracing::debug!(
                "not replacing stale {} SA: {} will do",
                if is_ike { "ISAKMP" } else { "IPsec" },
                newest
            );
        } else if if_used && !is_ike {
            let age = match self.inbound_said(serial) {
                Some(said) => self.kernel.get_sa_info(said).await.unwrap_or(None),
                None => None,
            };
            match age {
                Some(age) if age >= rekey_margin => {
                    // no recent inbound traffic: let this SA and its
                    // parent expire rather than rekeying dead weight
                    tracing::debug!(
                        "not replacing unused IPsec SA {}: last used {}s ago > {}s, \
                         letting it and parent {} expire",
                        serial,
                        age.as_secs(),
                        rekey_margin.as_secs(),
                        parent
                    );
                    if !parent.is_nobody() && self.table.get(parent).is_some() {
                        self.delete_event(parent);
                        self.schedule_state_event(parent, EventKind::SaExpire, Duration::ZERO);
                    }
                    return;
                }
                _ => {
                    tracing::debug!("replacing stale IPsec SA {} (recently used)", serial);
                    self.replace_sa(serial, conn_id, parent).await;
                }
            }
        } else {
            tracing::debug!(
                "replacing stale {} SA {}",
                if is_ike { "ISAKMP" } else { "IPsec" },
                serial
            );
            self.replace_sa(serial, conn_id, parent).await;
        }

        // the old SA stays up until its hard expiry
        if let Some(st) = self.table.get_mut(serial) {
            if let Some(key) = st.events.liveness.take() {
                self.timers.cancel(key);
            }
        }
        if let Some(st) = self.table.get_mut(serial) {
            if let Some(key) = st.events.dpd.take() {
                self.timers.cancel(key);
            }
        }
        self.schedule_state_event(serial, EventKind::SaExpire, margin);
    }

    /// A child under a healthy IKEv2 parent rekeys in place with
    /// CREATE_CHILD_SA; everything else starts a fresh keying attempt.
    async fn replace_sa(&mut self, serial: SerialNumber, conn_id: ConnId, parent: SerialNumber) {
        let rekey_in_place = self
            .table
            .get(serial)
            .map(|st| st.kind == SaKind::ChildSa && st.version == IkeVersion::V2)
            .unwrap_or(false)
            && self
                .table
                .get(parent)
                .map(|p| p.is_established())
                .unwrap_or(false);
        if rekey_in_place {
            self.initiate_v2_child_rekey(parent).await;
        } else {
            self.initiate_replacement(conn_id, 1).await;
        }
    }

    /// Hard expiry.
    pub(crate) async fn handle_sa_expire(&mut self, serial: SerialNumber) {
        let Some(st) = self.table.get(serial) else {
            return;
        };
        let conn_id = st.connection;
        let is_ike = st.is_ike_sa();
        let satype = if is_ike { "ISAKMP" } else { "IPsec" };
        let established = st.is_established();
        let is_v2 = st.version == IkeVersion::V2;
        let parent = st.parent;

        if let Some(conn) = self.conns.get(conn_id) {
            let latest = if is_ike {
                conn.newest_isakmp_sa
            } else {
                conn.newest_ipsec_sa
            };
            if serial < latest {
                tracing::debug!("{} SA expired (superseded by {})", satype, latest);
            } else if !established {
                tracing::debug!("un-established partial {} SA timeout", satype);
            } else {
                tracing::info!(
                    "{} SA expired ({})",
                    satype,
                    if conn.policy.contains(Policy::DONT_REKEY) {
                        "--dontrekey"
                    } else {
                        "LATEST!"
                    }
                );
            }
        }

        if is_v2 && is_ike {
            // parent takes the children with it
            self.delete_state(serial, "SA expired").await;
        } else {
            self.delete_state(serial, "SA expired").await;
            // a parent left with no children can go too
            if !parent.is_nobody()
                && self.table.get(parent).is_some()
                && self.table.children_of(parent).is_empty()
            {
                tracing::debug!("expiring unused parent {}", parent);
                self.delete_event(parent);
                self.schedule_state_event(parent, EventKind::SaExpire, Duration::ZERO);
            }
        }
    }

    /// One liveness tick. Scheduled on the child SA; probe state lives
    /// on the parent.
    pub(crate) async fn liveness_check(&mut self, serial: SerialNumber) {
        let Some(st) = self.table.get(serial) else {
            return;
        };
        let conn_id = st.connection;
        let version = st.version;
        let remote = st.remote_addr;
        let is_child = st.kind == SaKind::ChildSa;
        let parent_serial = if is_child { st.parent } else { serial };

        let Some(conn) = self.conns.get(conn_id) else {
            return;
        };
        let dpd_delay = conn.dpd_delay;
        let dpd_timeout = conn.dpd_timeout;
        let dpd_action = conn.dpd_action;

        if is_child && self.table.get(parent_serial).is_none() {
            tracing::warn!(
                "liveness check: no parent state {} left, taking {}",
                parent_serial,
                dpd_action
            );
            self.liveness_action(conn_id).await;
            return;
        }

        // skip the probe entirely when inbound traffic proves liveness
        let age = match self.inbound_said(serial) {
            Some(said) => self.kernel.get_sa_info(said).await.unwrap_or(None),
            None => None,
        };

        match age {
            Some(age) if age < dpd_timeout => {
                let pst = self.table.get_mut(parent_serial).expect("checked above");
                pst.pending_liveness = false;
                pst.last_liveness = None;
            }
            _ => {
                let now = Instant::now();
                let timeout = std::cmp::max(dpd_timeout, dpd_delay * 3);
                let (pending, last) = {
                    let pst = self.table.get_mut(parent_serial).expect("checked above");
                    // make the very first check well-defined
                    let last = *pst.last_liveness.get_or_insert(now);
                    (pst.pending_liveness, last)
                };

                if pending && now.duration_since(last) >= timeout {
                    tracing::warn!(
                        "liveness check: peer {} has not responded in {}s \
                         (timeout {}s), taking {}",
                        remote,
                        now.duration_since(last).as_secs(),
                        timeout.as_secs(),
                        dpd_action
                    );
                    self.liveness_action(conn_id).await;
                    return;
                }

                tracing::debug!(
                    "liveness check: peer {} is quiet, probing {}",
                    remote,
                    parent_serial
                );
                let sent = match version {
                    IkeVersion::V2 => self.send_v2_liveness_probe(parent_serial).await,
                    IkeVersion::V1 => self.send_v1_dpd_probe(parent_serial).await,
                };
                if sent {
                    let pst = self.table.get_mut(parent_serial).expect("checked above");
                    pst.pending_liveness = true;
                } else {
                    tracing::debug!("failed to send liveness probe from {}", parent_serial);
                    return; // no reschedule; the SA is wedged
                }
            }
        }

        let delay = std::cmp::max(dpd_delay, MIN_LIVENESS);
        let kind = match version {
            IkeVersion::V2 => EventKind::Liveness,
            IkeVersion::V1 => EventKind::Dpd,
        };
        self.schedule_state_event(serial, kind, delay);
    }

    /// The configured dead-peer action.
    pub(crate) async fn liveness_action(&mut self, conn_id: ConnId) {
        let Some(conn) = self.conns.get(conn_id) else {
            return;
        };
        let action = conn.dpd_action;
        let name = conn.name.clone();
        tracing::info!("performing DPD action {} for connection \"{}\"", action, name);

        match action {
            DpdAction::Hold => {
                // tear down SAs, keep the connection ready for the peer
                self.terminate_connection(conn_id).await;
            }
            DpdAction::Clear => {
                self.terminate_connection(conn_id).await;
                if let Some(conn) = self.conns.get_mut(conn_id) {
                    conn.newest_isakmp_sa = SerialNumber::NOBODY;
                    conn.newest_ipsec_sa = SerialNumber::NOBODY;
                    conn.policy = conn.policy.without(Policy::UP);
                }
            }
            DpdAction::Restart => {
                self.terminate_connection(conn_id).await;
                self.initiate_connection(conn_id, 1, None).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::conn::{
        ConnKind, Connection, ConnectionStore, End, PeerId, SpdRoute,
    };
    use crate::crypto::cipher::CipherSuite;
    use crate::engine::state::{SaRole, StateLabel};
    use crate::kernel::MockKernel;
    use std::sync::Arc;

    fn test_conn() -> Connection {
        let end = |client: &str, host: &str| End {
            client: client.parse().unwrap(),
            host_addr: host.parse().unwrap(),
            port: 0,
            protocol: 0,
            has_port_wildcard: false,
            id: PeerId::None,
            ca: None,
            sig_pub_key: None,
        };
        Connection {
            name: "east-west".to_string(),
            kind: ConnKind::Permanent,
            policy: Policy::IKEV2_ALLOW,
            foodgroup: None,
            spd: vec![SpdRoute {
                this: end("10.0.1.0/24", "192.0.2.1"),
                that: end("10.0.2.0/24", "192.0.2.2"),
            }],
            retransmit_interval: Duration::from_millis(500),
            retransmit_timeout: Duration::from_secs(60),
            keying_tries: 1,
            dpd_delay: Duration::from_secs(10),
            dpd_timeout: Duration::from_secs(30),
            dpd_action: DpdAction::Hold,
            rekey_margin: Duration::from_secs(540),
            sa_lifetime: Duration::from_secs(3600),
            margin: Duration::from_secs(60),
            psk: Some(b"secret".to_vec()),
            sig_key: None,
            if_id: None,
            suite: CipherSuite::default(),
            newest_isakmp_sa: SerialNumber::NOBODY,
            newest_ipsec_sa: SerialNumber::NOBODY,
            failed_ikev2: false,
        }
    }

    struct Fixture {
        engine: Engine,
        kernel: Arc<MockKernel>,
        conn_id: ConnId,
        parent: SerialNumber,
        child: SerialNumber,
    }

    fn fixture() -> Fixture {
        let mut conns = ConnectionStore::new();
        let conn_id = conns.add(test_conn());
        let kernel = Arc::new(MockKernel::default());
        let (mut engine, _tx) = Engine::for_tests(conns, kernel.clone());

        let parent = engine.table.create(
            SaKind::IkeSa,
            SaRole::Responder,
            IkeVersion::V2,
            conn_id,
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
            StateLabel::ParentR2,
        );
        let child = engine.table.create(
            SaKind::ChildSa,
            SaRole::Responder,
            IkeVersion::V2,
            conn_id,
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
            StateLabel::V2IpsecR,
        );
        {
            let st = engine.table.get_mut(child).unwrap();
            st.parent = parent;
            st.esp_spi_local = 0x1000;
            st.esp_spi_remote = 0x2000;
        }
        Fixture {
            engine,
            kernel,
            conn_id,
            parent,
            child,
        }
    }

    #[tokio::test]
    async fn superseded_sa_is_not_replaced() {
        let mut f = fixture();
        // a newer child SA exists
        f.engine.conns.get_mut(f.conn_id).unwrap().newest_ipsec_sa = SerialNumber(999);
        f.engine.handle_sa_replace(f.child, false).await;

        // no replacement initiated: no new IKE state appeared
        assert_eq!(f.engine.table.len(), 2);
        // hard expiry still armed
        let st = f.engine.table.get(f.child).unwrap();
        assert!(matches!(st.events.event, Some((EventKind::SaExpire, _))));
    }

    #[tokio::test]
    async fn idle_sa_expires_parent_instead_of_rekeying() {
        let mut f = fixture();
        let said = SaId {
            proto: SaProto::Esp,
            spi: 0x1000,
            dst: "192.0.2.1".parse().unwrap(),
        };
        // inbound silence way beyond the rekey margin
        f.kernel.set_age(said, Duration::from_secs(1000));

        f.engine.handle_sa_replace(f.child, true).await;

        let pst = f.engine.table.get(f.parent).unwrap();
        assert!(
            matches!(pst.events.event, Some((EventKind::SaExpire, _))),
            "parent hard expiry scheduled"
        );
        // the child got no replace-margin event (it dies with the parent)
        let st = f.engine.table.get(f.child).unwrap();
        assert!(st.events.event.is_none());
    }

    #[tokio::test]
    async fn used_sa_is_rekeyed_and_expiry_armed() {
        let mut f = fixture();
        let said = SaId {
            proto: SaProto::Esp,
            spi: 0x1000,
            dst: "192.0.2.1".parse().unwrap(),
        };
        f.kernel.set_age(said, Duration::from_secs(5));

        f.engine.handle_sa_replace(f.child, true).await;

        // replacement exchange created a fresh initiator state
        assert!(f.engine.table.len() > 2);
        let st = f.engine.table.get(f.child).unwrap();
        assert!(matches!(st.events.event, Some((EventKind::SaExpire, _))));
    }

    #[tokio::test]
    async fn liveness_clears_pending_when_traffic_flows() {
        let mut f = fixture();
        let said = SaId {
            proto: SaProto::Esp,
            spi: 0x1000,
            dst: "192.0.2.1".parse().unwrap(),
        };
        f.kernel.set_age(said, Duration::from_secs(1));
        f.engine.table.get_mut(f.parent).unwrap().pending_liveness = true;
        f.engine.table.get_mut(f.parent).unwrap().last_liveness = Some(Instant::now());

        f.engine.liveness_check(f.child).await;

        let pst = f.engine.table.get(f.parent).unwrap();
        assert!(!pst.pending_liveness);
        assert!(pst.last_liveness.is_none());
        // next tick armed on the child
        assert!(f.engine.table.get(f.child).unwrap().events.liveness.is_some());
    }

    #[tokio::test]
    async fn silent_peer_beyond_timeout_triggers_action() {
        let mut f = fixture();
        // no kernel age at all: the SA looks dead
        {
            let pst = f.engine.table.get_mut(f.parent).unwrap();
            pst.pending_liveness = true;
            pst.last_liveness = Some(Instant::now() - Duration::from_secs(120));
        }

        f.engine.liveness_check(f.child).await;

        // dpd-action hold tears the whole family down
        assert!(f.engine.table.get(f.parent).is_none());
        assert!(f.engine.table.get(f.child).is_none());
    }

    #[tokio::test]
    async fn orphaned_child_liveness_takes_action() {
        let mut f = fixture();
        f.engine.table.get_mut(f.child).unwrap().parent = SerialNumber(12345);
        f.engine.liveness_check(f.child).await;
        assert!(f.engine.table.get(f.child).is_none(), "hold action fired");
    }
}
