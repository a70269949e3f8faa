//! IKEv2 exchange handlers. Each handler runs to completion on the
//! event loop; anything involving a DH shared secret suspends into the
//! crypto pipeline and resumes in a `continue_*` method.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::conn::{ConnId, Policy};
use crate::crypto::dh::DhSecret;
use crate::crypto::prf::{prf_plus, skeyseed_v2, v2_sk_keys};
use crate::crypto::sig::{verify_signature, SigKeyPair};
use crate::crypto::task::DhContinuation;
use crate::crypto::{random_nonce, random_spi, SymKey};
use crate::engine::state::{SaKind, SaRole, SerialNumber, SpiPair, StateLabel, WhackHandle};
use crate::engine::timer::EventKind;
use crate::engine::{Engine, MIN_LIVENESS};
use crate::ike::narrow::{process_ts_request, process_ts_response};
use crate::ike::proposal::{esp_proposal, ike_proposal, select_esp, select_ike};
use crate::ike::ts::end_to_ts;
use crate::ike::{
    open_sk, seal_sk, AuthPayload, DeletePayload, ExchangeType, IdPayload, IdType, IkeMessage,
    IkeVersion, KePayload, NoncePayload, NotifyPayload, NotifyType, Payload, TsPayload,
    FLAG_INITIATOR, FLAG_RESPONSE,
};
use crate::kernel::{SaId, SaInstall, SaProto};

/// Result of one exchange step, observed by the dispatcher which
/// performs the corresponding bookkeeping. Mirrors early-return error
/// codes rather than unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// Handled; state advanced.
    Ok,
    /// Not for us, a duplicate, or stale; dropped without side effects.
    Ignore,
    /// Parked waiting for a crypto completion.
    Suspend,
    /// Unrecoverable for this SA; the dispatcher deletes the state.
    FatalDeleteState(SerialNumber),
    /// Policy or auth failure answered with a NOTIFY.
    FailWithNotify(NotifyType),
}

const RELEASE_WHACK_DELAY: Duration = Duration::from_secs(60);
const NONCE_SIZE: usize = 32;
const PSK_PAD: &[u8] = b"Key Pad for IKEv2";

/// RFC 7296 / RFC 4754 AUTH method values.
const AUTH_METHOD_PSK: u8 = 2;
const AUTH_METHOD_ECDSA_P256: u8 = 9;

/// What this connection authenticates the IKE SA with.
enum V2AuthMaterial {
    Psk(Vec<u8>),
    Sig(Arc<SigKeyPair>),
}

/// ID payload body exactly as it appears on the wire, for the AUTH
/// octets.
fn id_octets(id: &IdPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + id.data.len());
    out.push(id.id_type.wire());
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&id.data);
    out
}

fn find<'a, T>(payloads: &'a [Payload], pick: impl Fn(&'a Payload) -> Option<&'a T>) -> Option<&'a T> {
    payloads.iter().find_map(pick)
}

fn find_nonce(payloads: &[Payload]) -> Option<&NoncePayload> {
    find(payloads, |p| match p {
        Payload::Nonce(n) => Some(n),
        _ => None,
    })
}

fn find_ke(payloads: &[Payload]) -> Option<&KePayload> {
    find(payloads, |p| match p {
        Payload::KeyExchange(k) => Some(k),
        _ => None,
    })
}

impl Engine {
    /// First connection authorized for this peer address.
    pub(crate) fn find_connection_for_peer(&self, peer: std::net::IpAddr) -> Option<ConnId> {
        self.conns
            .iter()
            .find(|(_, c)| {
                c.policy.contains(Policy::IKEV2_ALLOW)
                    && c.spd.iter().any(|r| r.that.host_addr == peer)
            })
            .map(|(id, _)| id)
    }

    pub(crate) fn id_payload_for(&self, conn_id: ConnId) -> IdPayload {
        use crate::config::conn::PeerId;
        let conn = self.conns.get(conn_id);
        let id = conn.map(|c| c.spd[0].this.id.clone()).unwrap_or(PeerId::None);
        match id {
            PeerId::Fqdn(name) => IdPayload {
                id_type: IdType::Fqdn,
                data: name.into_bytes(),
            },
            PeerId::Addr(std::net::IpAddr::V4(a)) => IdPayload {
                id_type: IdType::Ipv4Addr,
                data: a.octets().to_vec(),
            },
            PeerId::Addr(std::net::IpAddr::V6(a)) => IdPayload {
                id_type: IdType::Ipv6Addr,
                data: a.octets().to_vec(),
            },
            PeerId::None => {
                let addr = conn.map(|c| c.spd[0].this.host_addr);
                match addr {
                    Some(std::net::IpAddr::V4(a)) => IdPayload {
                        id_type: IdType::Ipv4Addr,
                        data: a.octets().to_vec(),
                    },
                    Some(std::net::IpAddr::V6(a)) => IdPayload {
                        id_type: IdType::Ipv6Addr,
                        data: a.octets().to_vec(),
                    },
                    None => IdPayload {
                        id_type: IdType::KeyId,
                        data: Vec::new(),
                    },
                }
            }
        }
    }

    /// The PSK when configured, otherwise our signing key. `None` means
    /// the connection cannot authenticate at all (the config loader
    /// prevents this; belt and braces here).
    fn v2_auth_material(&self, conn_id: ConnId) -> Option<V2AuthMaterial> {
        let conn = self.conns.get(conn_id)?;
        if let Some(psk) = conn.psk.clone() {
            return Some(V2AuthMaterial::Psk(psk));
        }
        conn.sig_key.clone().map(V2AuthMaterial::Sig)
    }

    /// Signed octets per RFC 7296 section 2.15: the signer's first
    /// message, the peer's nonce, and the MACed identity.
    fn v2_auth_octets(
        &self,
        serial: SerialNumber,
        signer_packet: &[u8],
        peer_nonce: &[u8],
        id: &IdPayload,
        signer_is_initiator: bool,
    ) -> Option<Vec<u8>> {
        let st = self.table.get(serial)?;
        let suite = st.suite?;
        let sk = st.sk.as_ref()?;
        let prf = suite.prf;
        let id_key = if signer_is_initiator { &sk.sk_pi } else { &sk.sk_pr };

        let maced_id = prf.prf(id_key.as_bytes(), &id_octets(id));
        let mut octets = Vec::with_capacity(signer_packet.len() + peer_nonce.len() + maced_id.len());
        octets.extend_from_slice(signer_packet);
        octets.extend_from_slice(peer_nonce);
        octets.extend_from_slice(maced_id.as_bytes());
        Some(octets)
    }

    /// Produce our AUTH payload over the octets: a prf MIC keyed
    /// through the PSK pad, or an ECDSA signature.
    fn v2_auth_sign(
        &self,
        serial: SerialNumber,
        material: &V2AuthMaterial,
        octets: &[u8],
    ) -> Option<AuthPayload> {
        match material {
            V2AuthMaterial::Psk(psk) => {
                let suite = self.table.get(serial)?.suite?;
                let pad_key = suite.prf.prf(psk, PSK_PAD);
                let auth = suite.prf.prf(pad_key.as_bytes(), octets);
                Some(AuthPayload {
                    method: AUTH_METHOD_PSK,
                    data: auth.as_bytes().to_vec(),
                })
            }
            V2AuthMaterial::Sig(key) => match key.sign(octets) {
                Ok(data) => Some(AuthPayload {
                    method: AUTH_METHOD_ECDSA_P256,
                    data,
                }),
                Err(e) => {
                    tracing::error!("cannot sign AUTH octets: {}", e);
                    None
                }
            },
        }
    }

    /// Check the peer's AUTH payload. The method byte must match the
    /// connection's mode; a MIC never authenticates a signature
    /// connection or vice versa.
    fn v2_auth_verify(
        &self,
        serial: SerialNumber,
        conn_id: ConnId,
        material: &V2AuthMaterial,
        octets: &[u8],
        auth: &AuthPayload,
    ) -> bool {
        match material {
            V2AuthMaterial::Psk(psk) => {
                if auth.method != AUTH_METHOD_PSK {
                    return false;
                }
                let Some(suite) = self.table.get(serial).and_then(|st| st.suite) else {
                    return false;
                };
                let pad_key = suite.prf.prf(psk, PSK_PAD);
                let expected = suite.prf.prf(pad_key.as_bytes(), octets);
                ring::constant_time::verify_slices_are_equal(expected.as_bytes(), &auth.data)
                    .is_ok()
            }
            V2AuthMaterial::Sig(_) => {
                if auth.method != AUTH_METHOD_ECDSA_P256 {
                    return false;
                }
                let Some(peer_key) = self
                    .conns
                    .get(conn_id)
                    .and_then(|c| c.spd[0].that.sig_pub_key.as_deref())
                else {
                    return false;
                };
                verify_signature(peer_key, octets, &auth.data)
            }
        }
    }

    fn sk_encrypt_key(&self, serial: SerialNumber) -> Option<(crate::crypto::cipher::CipherSuite, SymKey)> {
        let st = self.table.get(serial)?;
        let suite = st.suite?;
        let sk = st.sk.as_ref()?;
        let key = match st.original_role {
            SaRole::Initiator => sk.sk_ei.clone(),
            SaRole::Responder => sk.sk_er.clone(),
        };
        Some((suite, key))
    }

    fn sk_decrypt_key(&self, serial: SerialNumber) -> Option<(crate::crypto::cipher::CipherSuite, SymKey)> {
        let st = self.table.get(serial)?;
        let suite = st.suite?;
        let sk = st.sk.as_ref()?;
        // the peer encrypts with the key of *their* original role
        let key = match st.original_role {
            SaRole::Initiator => sk.sk_er.clone(),
            SaRole::Responder => sk.sk_ei.clone(),
        };
        Some((suite, key))
    }

    async fn send_plain_notify(
        &mut self,
        msg: &IkeMessage,
        from: SocketAddr,
        local_port: u16,
        notify: NotifyType,
    ) {
        let reply = IkeMessage {
            initiator_spi: msg.initiator_spi,
            responder_spi: msg.responder_spi,
            version: IkeVersion::V2,
            exchange_type: msg.exchange_type,
            flags: FLAG_RESPONSE,
            message_id: msg.message_id,
            payloads: vec![Payload::Notify(NotifyPayload::error(notify))],
        };
        let mut local = from;
        local.set_port(local_port);
        self.send_packet(local, from, &reply.to_bytes()).await;
    }

    // ================= IKE_SA_INIT =================

    /// Operator or replacement keying: send the IKE_SA_INIT request.
    pub(crate) async fn initiate_v2(
        &mut self,
        conn_id: ConnId,
        try_count: u32,
        whack: Option<WhackHandle>,
    ) {
        let Some(conn) = self.conns.get(conn_id) else {
            return;
        };
        let suite = conn.suite;
        let route = &conn.spd[0];
        let local: SocketAddr = (route.this.host_addr, self.ike_port).into();
        let remote: SocketAddr = (route.that.host_addr, self.ike_port).into();

        let (ispi, nonce, dh) = match (
            random_spi(),
            random_nonce(NONCE_SIZE),
            DhSecret::generate(suite.dh),
        ) {
            (Ok(s), Ok(n), Ok(d)) => (s, n, d),
            _ => {
                tracing::error!("cannot gather entropy for a new exchange");
                if let Some(w) = whack {
                    w.release("internal error: entropy");
                }
                return;
            }
        };

        let serial = self.table.create(
            SaKind::IkeSa,
            SaRole::Initiator,
            IkeVersion::V2,
            conn_id,
            local,
            remote,
            StateLabel::ParentI1,
        );

        let msg = IkeMessage {
            initiator_spi: ispi,
            responder_spi: 0,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::IkeSaInit,
            flags: FLAG_INITIATOR,
            message_id: 0,
            payloads: vec![
                Payload::Sa(ike_proposal(&suite)),
                Payload::KeyExchange(KePayload {
                    dh_group: suite.dh.ikev2_id(),
                    data: dh.public_value().to_vec(),
                }),
                Payload::Nonce(NoncePayload {
                    data: nonce.clone(),
                }),
            ],
        };
        let bytes = msg.to_bytes();

        {
            let st = self.table.get_mut(serial).expect("just created");
            st.spis = SpiPair {
                initiator: ispi,
                responder: 0,
            };
            st.try_count = try_count;
            st.suite = Some(suite);
            st.nonce_i = nonce;
            st.dh_secret = Some(dh);
            st.first_packet_me = bytes.clone();
            st.msgid_out = 1;
            st.whack = whack;
        }
        if self.table.get(serial).unwrap().whack.is_some() {
            self.schedule_state_event(serial, EventKind::ReleaseWhack, RELEASE_WHACK_DELAY);
        }
        self.send_request(serial, bytes).await;
    }

    pub(crate) async fn dispatch_v2(
        &mut self,
        msg: IkeMessage,
        raw: Vec<u8>,
        from: SocketAddr,
        local_port: u16,
    ) {
        let outcome = match (msg.exchange_type, msg.is_response()) {
            (ExchangeType::IkeSaInit, false) => {
                self.v2_sa_init_request(&msg, &raw, from, local_port).await
            }
            (ExchangeType::IkeSaInit, true) => self.v2_sa_init_response(&msg, &raw).await,
            (ExchangeType::IkeAuth, false) => self.v2_auth_request(&msg, &raw).await,
            (ExchangeType::IkeAuth, true) => self.v2_auth_response(&msg, &raw).await,
            (ExchangeType::CreateChildSa, false) => self.v2_child_request(&msg, &raw).await,
            (ExchangeType::CreateChildSa, true) => self.v2_child_response(&msg, &raw).await,
            (ExchangeType::Informational, false) => self.v2_informational_request(&msg, &raw).await,
            (ExchangeType::Informational, true) => self.v2_informational_response(&msg).await,
            _ => ExchangeOutcome::Ignore,
        };

        match outcome {
            ExchangeOutcome::Ok | ExchangeOutcome::Suspend | ExchangeOutcome::Ignore => {}
            ExchangeOutcome::FatalDeleteState(serial) => {
                self.delete_state(serial, "fatal exchange failure").await;
            }
            ExchangeOutcome::FailWithNotify(notify) => {
                self.send_plain_notify(&msg, from, local_port, notify).await;
            }
        }
    }

    async fn v2_sa_init_request(
        &mut self,
        msg: &IkeMessage,
        raw: &[u8],
        from: SocketAddr,
        local_port: u16,
    ) -> ExchangeOutcome {
        // duplicate of a half-open exchange: resend our reply verbatim
        // (or drop it while the reply is still being computed)
        if let Some(serial) = self.table.find_by_initiator_spi(msg.initiator_spi) {
            let st = self.table.get(serial).unwrap();
            if st.remote_addr == from {
                if st.label == StateLabel::ParentR1 {
                    if let Some(reply) = st.tpacket.clone() {
                        let (local, remote) = (st.local_addr, st.remote_addr);
                        tracing::debug!("retransmitting IKE_SA_INIT reply to {}", from);
                        self.send_packet(local, remote, &reply).await;
                    }
                }
                return ExchangeOutcome::Ignore;
            }
        }

        let Some(conn_id) = self.find_connection_for_peer(from.ip()) else {
            tracing::debug!("no connection authorizes peer {}; dropping", from);
            return ExchangeOutcome::Ignore;
        };

        let sa = match find(&msg.payloads, |p| match p {
            Payload::Sa(sa) => Some(sa),
            _ => None,
        }) {
            Some(sa) => sa,
            None => return ExchangeOutcome::FailWithNotify(NotifyType::InvalidSyntax),
        };
        let (ke, nonce) = match (find_ke(&msg.payloads), find_nonce(&msg.payloads)) {
            (Some(k), Some(n)) => (k, n),
            _ => return ExchangeOutcome::FailWithNotify(NotifyType::InvalidSyntax),
        };
        let Some(suite) = select_ike(sa) else {
            tracing::info!("no acceptable IKE proposal from {}", from);
            return ExchangeOutcome::FailWithNotify(NotifyType::NoProposalChosen);
        };
        if ke.dh_group != suite.dh.ikev2_id() {
            tracing::info!(
                "peer sent KE for group {} but negotiation chose {}",
                ke.dh_group,
                suite.dh.ikev2_id()
            );
            return ExchangeOutcome::FailWithNotify(NotifyType::InvalidKePayload);
        }

        let (rspi, nr, dh) = match (
            random_spi(),
            random_nonce(NONCE_SIZE),
            DhSecret::generate(suite.dh),
        ) {
            (Ok(s), Ok(n), Ok(d)) => (s, n, d),
            _ => return ExchangeOutcome::Ignore,
        };

        let local: SocketAddr = self
            .conns
            .get(conn_id)
            .map(|c| (c.spd[0].this.host_addr, local_port).into())
            .unwrap_or_else(|| {
                let mut a = from;
                a.set_port(local_port);
                a
            });
        let serial = self.table.create(
            SaKind::IkeSa,
            SaRole::Responder,
            IkeVersion::V2,
            conn_id,
            local,
            from,
            StateLabel::ParentR1,
        );
        let spis = SpiPair {
            initiator: msg.initiator_spi,
            responder: rspi,
        };
        {
            let st = self.table.get_mut(serial).expect("just created");
            st.suite = Some(suite);
            st.nonce_i = nonce.data.clone();
            st.nonce_r = nr;
            st.dh_secret = Some(dh);
            st.first_packet_him = raw.to_vec();
            st.behind_nat = local_port == self.natt_port;
        }
        if !self.table.index_spis(serial, spis) {
            self.delete_state(serial, "SPI pair collision").await;
            return ExchangeOutcome::Ignore;
        }

        self.submit_dh(serial, ke.data.clone(), DhContinuation::V2SaInitResponder);
        ExchangeOutcome::Suspend
    }

    /// DH done on the responder: derive the SK keys and send our
    /// IKE_SA_INIT reply.
    pub(crate) async fn continue_v2_sa_init_responder(&mut self, serial: SerialNumber) {
        let Some(st) = self.table.get(serial) else {
            return;
        };
        let Some(suite) = st.suite else {
            return;
        };
        let spis = st.spis;
        let nr = st.nonce_r.clone();
        let dh_public = st
            .dh_secret
            .as_ref()
            .map(|d| d.public_value().to_vec())
            .unwrap_or_default();

        let reply = IkeMessage {
            initiator_spi: spis.initiator,
            responder_spi: spis.responder,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::IkeSaInit,
            flags: FLAG_RESPONSE,
            message_id: 0,
            payloads: vec![
                Payload::Sa(ike_proposal(&suite)),
                Payload::KeyExchange(KePayload {
                    dh_group: suite.dh.ikev2_id(),
                    data: dh_public,
                }),
                Payload::Nonce(NoncePayload { data: nr }),
            ],
        };
        let bytes = reply.to_bytes();

        {
            let st = self.table.get_mut(serial).expect("checked above");
            let shared = st.shared_secret.as_ref().expect("completion installed it");
            let skeyseed = skeyseed_v2(suite.prf, &st.nonce_i, &st.nonce_r, shared);
            let sk = v2_sk_keys(
                suite.prf,
                &skeyseed,
                &st.nonce_i,
                &st.nonce_r,
                st.spis.initiator,
                st.spis.responder,
                suite.encr.key_len(),
            );
            st.sk = Some(sk);
            st.first_packet_me = bytes.clone();
        }
        self.send_reply(serial, bytes).await;
    }

    async fn v2_sa_init_response(&mut self, msg: &IkeMessage, raw: &[u8]) -> ExchangeOutcome {
        let Some(serial) = self.table.find_by_initiator_spi(msg.initiator_spi) else {
            return ExchangeOutcome::Ignore;
        };
        {
            let st = self.table.get(serial).unwrap();
            if st.label != StateLabel::ParentI1 || st.role != SaRole::Initiator {
                return ExchangeOutcome::Ignore;
            }
            if st.dh_task.is_some() {
                // duplicate reply while the first is still keying
                return ExchangeOutcome::Ignore;
            }
        }

        let sa = match find(&msg.payloads, |p| match p {
            Payload::Sa(sa) => Some(sa),
            _ => None,
        }) {
            Some(sa) => sa,
            None => {
                // a bare NOTIFY here is a rejection such as NO_PROPOSAL_CHOSEN
                for p in &msg.payloads {
                    if let Payload::Notify(n) = p {
                        tracing::warn!("IKE_SA_INIT rejected with {:?}", n.notify_type);
                    }
                }
                return ExchangeOutcome::FatalDeleteState(serial);
            }
        };
        let (ke, nonce) = match (find_ke(&msg.payloads), find_nonce(&msg.payloads)) {
            (Some(k), Some(n)) => (k, n),
            _ => return ExchangeOutcome::FatalDeleteState(serial),
        };
        let Some(suite) = select_ike(sa) else {
            return ExchangeOutcome::FatalDeleteState(serial);
        };
        {
            let st = self.table.get(serial).unwrap();
            if st.suite != Some(suite) {
                tracing::warn!("responder chose transforms we did not offer");
                return ExchangeOutcome::FatalDeleteState(serial);
            }
        }

        self.delete_event(serial); // response received; stop retransmitting

        let spis = SpiPair {
            initiator: msg.initiator_spi,
            responder: msg.responder_spi,
        };
        if !self.table.index_spis(serial, spis) {
            return ExchangeOutcome::FatalDeleteState(serial);
        }
        {
            let st = self.table.get_mut(serial).unwrap();
            st.nonce_r = nonce.data.clone();
            st.first_packet_him = raw.to_vec();
        }

        self.submit_dh(serial, ke.data.clone(), DhContinuation::V2SaInitInitiator);
        ExchangeOutcome::Suspend
    }

    /// DH done on the initiator: derive keys and send IKE_AUTH.
    pub(crate) async fn continue_v2_sa_init_initiator(&mut self, serial: SerialNumber) {
        let (suite, conn_id, spis) = {
            let Some(st) = self.table.get(serial) else {
                return;
            };
            let Some(suite) = st.suite else { return };
            (suite, st.connection, st.spis)
        };

        {
            let st = self.table.get_mut(serial).expect("checked above");
            let shared = st.shared_secret.as_ref().expect("completion installed it");
            let skeyseed = skeyseed_v2(suite.prf, &st.nonce_i, &st.nonce_r, shared);
            let sk = v2_sk_keys(
                suite.prf,
                &skeyseed,
                &st.nonce_i,
                &st.nonce_r,
                st.spis.initiator,
                st.spis.responder,
                suite.encr.key_len(),
            );
            st.sk = Some(sk);
        }

        let Some(material) = self.v2_auth_material(conn_id) else {
            tracing::error!("connection has no authentication material");
            self.delete_state(serial, "no authentication material").await;
            return;
        };

        let id = self.id_payload_for(conn_id);
        let (first_packet_me, nonce_r) = {
            let st = self.table.get(serial).unwrap();
            (st.first_packet_me.clone(), st.nonce_r.clone())
        };
        let Some(octets) = self.v2_auth_octets(serial, &first_packet_me, &nonce_r, &id, true)
        else {
            self.delete_state(serial, "auth computation failed").await;
            return;
        };
        let auth = self.v2_auth_sign(serial, &material, &octets);
        drop(SymKey::new(octets));
        let Some(auth) = auth else {
            self.delete_state(serial, "auth computation failed").await;
            return;
        };

        // pending child SA, carried inside this AUTH exchange
        let esp_spi = random_spi().map(|s| s as u32).unwrap_or(1).max(1);
        let (local_addr, remote_addr) = {
            let st = self.table.get(serial).unwrap();
            (st.local_addr, st.remote_addr)
        };
        let child = self.table.create(
            SaKind::ChildSa,
            SaRole::Initiator,
            IkeVersion::V2,
            conn_id,
            local_addr,
            remote_addr,
            StateLabel::V2IpsecI,
        );
        {
            let st = self.table.get_mut(child).unwrap();
            st.parent = serial;
            st.esp_spi_local = esp_spi;
        }

        let (ts_i, ts_r) = {
            let conn = self.conns.get(conn_id).expect("conn exists");
            let route = &conn.spd[0];
            (end_to_ts(&route.this), end_to_ts(&route.that))
        };

        // exactly one TSi and one TSr payload, one selector each
        let inner = vec![
            Payload::IdInitiator(id),
            Payload::Auth(auth),
            Payload::Sa(esp_proposal(suite.encr, esp_spi)),
            Payload::TsInitiator(TsPayload::single(ts_i)),
            Payload::TsResponder(TsPayload::single(ts_r)),
        ];

        let Some((suite, key)) = self.sk_encrypt_key(serial) else {
            self.delete_state(serial, "no SK keys").await;
            return;
        };
        let msg = IkeMessage {
            initiator_spi: spis.initiator,
            responder_spi: spis.responder,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::IkeAuth,
            flags: FLAG_INITIATOR,
            message_id: 1,
            payloads: Vec::new(),
        };
        let bytes = match seal_sk(msg, &inner, &suite, &key) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("failed to seal IKE_AUTH: {}", e);
                self.delete_state(serial, "seal failure").await;
                return;
            }
        };

        {
            let st = self.table.get_mut(serial).unwrap();
            st.label = StateLabel::ParentI2;
            st.msgid_out = 2;
        }
        self.send_request(serial, bytes).await;
    }

    // ================= IKE_AUTH =================

    async fn v2_auth_request(&mut self, msg: &IkeMessage, raw: &[u8]) -> ExchangeOutcome {
        let spis = SpiPair {
            initiator: msg.initiator_spi,
            responder: msg.responder_spi,
        };
        let Some(serial) = self.table.find_by_spis(spis) else {
            return ExchangeOutcome::Ignore;
        };
        {
            let st = self.table.get(serial).unwrap();
            if st.label != StateLabel::ParentR1 {
                // duplicate AUTH for an established SA: resend our reply
                if st.label == StateLabel::ParentR2 {
                    if let Some(reply) = st.tpacket.clone() {
                        let (local, remote) = (st.local_addr, st.remote_addr);
                        self.send_packet(local, remote, &reply).await;
                    }
                }
                return ExchangeOutcome::Ignore;
            }
        }

        let Some((suite, dec_key)) = self.sk_decrypt_key(serial) else {
            return ExchangeOutcome::Ignore; // keys not derived yet
        };
        let inner = match open_sk(msg, raw, &suite, &dec_key) {
            Ok(inner) => inner,
            Err(e) => {
                tracing::info!("cannot decrypt IKE_AUTH from peer: {}", e);
                return ExchangeOutcome::Ignore;
            }
        };

        let conn_id = self.table.get(serial).unwrap().connection;
        let Some(material) = self.v2_auth_material(conn_id) else {
            return self.v2_auth_reject(serial, msg).await;
        };

        let (id_i, auth) = match (
            find(&inner, |p| match p {
                Payload::IdInitiator(id) => Some(id),
                _ => None,
            }),
            find(&inner, |p| match p {
                Payload::Auth(a) => Some(a),
                _ => None,
            }),
        ) {
            (Some(id), Some(a)) => (id.clone(), a.clone()),
            _ => return self.v2_auth_reject(serial, msg).await,
        };

        let (first_packet_him, nonce_r) = {
            let st = self.table.get(serial).unwrap();
            (st.first_packet_him.clone(), st.nonce_r.clone())
        };
        let ok = match self.v2_auth_octets(serial, &first_packet_him, &nonce_r, &id_i, true) {
            Some(octets) => {
                let ok = self.v2_auth_verify(serial, conn_id, &material, &octets, &auth);
                drop(SymKey::new(octets));
                ok
            }
            None => false,
        };
        if !ok {
            tracing::warn!("IKE_AUTH authentication failed for {}", serial);
            return self.v2_auth_reject(serial, msg).await;
        }

        // authenticated; now pick the child SA parameters
        let (esp, tsi, tsr) = match (
            find(&inner, |p| match p {
                Payload::Sa(sa) => Some(sa),
                _ => None,
            }),
            find(&inner, |p| match p {
                Payload::TsInitiator(ts) => Some(ts),
                _ => None,
            }),
            find(&inner, |p| match p {
                Payload::TsResponder(ts) => Some(ts),
                _ => None,
            }),
        ) {
            (Some(sa), Some(tsi), Some(tsr)) => (sa, tsi.clone(), tsr.clone()),
            _ => return self.v2_child_reject(serial, msg, NotifyType::InvalidSyntax).await,
        };
        let Some((child_encr, peer_spi)) = select_esp(esp) else {
            return self
                .v2_child_reject(serial, msg, NotifyType::NoProposalChosen)
                .await;
        };

        let Some(narrowed) = process_ts_request(&mut self.conns, conn_id, &tsi, &tsr) else {
            tracing::info!("no connection fits the peer's traffic selectors");
            return self
                .v2_child_reject(serial, msg, NotifyType::TsUnacceptable)
                .await;
        };

        // child state, rebound to the winning connection
        let (local_addr, remote_addr) = {
            let st = self.table.get(serial).unwrap();
            (st.local_addr, st.remote_addr)
        };
        let esp_spi = random_spi().map(|s| s as u32).unwrap_or(1).max(1);
        let child = self.table.create(
            SaKind::ChildSa,
            SaRole::Responder,
            IkeVersion::V2,
            narrowed.conn,
            local_addr,
            remote_addr,
            StateLabel::V2IpsecR,
        );
        {
            let st = self.table.get_mut(child).unwrap();
            st.parent = serial;
            st.esp_spi_local = esp_spi;
            st.esp_spi_remote = peer_spi;
            st.ts_this = Some(narrowed.ts_this);
            st.ts_that = Some(narrowed.ts_that);
        }
        if let Err(e) = self.install_child_sas(serial, child, child_encr, None).await {
            tracing::error!("kernel rejected the child SA: {}", e);
            self.delete_state(child, "kernel install failed").await;
            return self
                .v2_child_reject(serial, msg, NotifyType::NoProposalChosen)
                .await;
        }

        // build the reply
        let id_r = self.id_payload_for(narrowed.conn);
        let (first_packet_me, nonce_i) = {
            let st = self.table.get(serial).unwrap();
            (st.first_packet_me.clone(), st.nonce_i.clone())
        };
        let Some(octets) = self.v2_auth_octets(serial, &first_packet_me, &nonce_i, &id_r, false)
        else {
            self.delete_state(serial, "auth computation failed").await;
            return ExchangeOutcome::Ignore;
        };
        let auth_r = self.v2_auth_sign(serial, &material, &octets);
        drop(SymKey::new(octets));
        let Some(auth_r) = auth_r else {
            self.delete_state(serial, "auth computation failed").await;
            return ExchangeOutcome::Ignore;
        };

        // responder order: TSi carries the initiator's traffic (our
        // "that"), TSr ours
        let inner_reply = vec![
            Payload::IdResponder(id_r),
            Payload::Auth(auth_r),
            Payload::Sa(esp_proposal(child_encr, esp_spi)),
            Payload::TsInitiator(TsPayload::single(narrowed.ts_that)),
            Payload::TsResponder(TsPayload::single(narrowed.ts_this)),
        ];
        let Some((suite, enc_key)) = self.sk_encrypt_key(serial) else {
            return ExchangeOutcome::Ignore;
        };
        let reply = IkeMessage {
            initiator_spi: spis.initiator,
            responder_spi: spis.responder,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::IkeAuth,
            flags: FLAG_RESPONSE,
            message_id: msg.message_id,
            payloads: Vec::new(),
        };
        let bytes = match seal_sk(reply, &inner_reply, &suite, &enc_key) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("failed to seal IKE_AUTH reply: {}", e);
                return ExchangeOutcome::Ignore;
            }
        };

        {
            let st = self.table.get_mut(serial).unwrap();
            st.label = StateLabel::ParentR2;
        }
        if let Some(conn) = self.conns.get_mut(narrowed.conn) {
            conn.newest_isakmp_sa = serial;
            conn.newest_ipsec_sa = child;
        }
        self.send_reply(serial, bytes).await;
        self.schedule_sa_lifetimes(serial).await;
        self.schedule_sa_lifetimes(child).await;
        tracing::info!("IKEv2 SA established (responder) {} child {}", serial, child);
        ExchangeOutcome::Ok
    }

    async fn v2_auth_reject(&mut self, serial: SerialNumber, msg: &IkeMessage) -> ExchangeOutcome {
        let notify = vec![Payload::Notify(NotifyPayload::error(
            NotifyType::AuthenticationFailed,
        ))];
        self.send_sk_reply(serial, msg, notify).await;
        ExchangeOutcome::FatalDeleteState(serial)
    }

    /// Child-scoped failure: the IKE SA survives, the reply carries the
    /// error notify.
    async fn v2_child_reject(
        &mut self,
        serial: SerialNumber,
        msg: &IkeMessage,
        notify: NotifyType,
    ) -> ExchangeOutcome {
        let payloads = vec![Payload::Notify(NotifyPayload::error(notify))];
        self.send_sk_reply(serial, msg, payloads).await;
        // the parent is authenticated and stays up
        if self.table.get(serial).map(|s| s.label) == Some(StateLabel::ParentR1) {
            let st = self.table.get_mut(serial).unwrap();
            st.label = StateLabel::ParentR2;
        }
        ExchangeOutcome::Ok
    }

    async fn send_sk_reply(
        &mut self,
        serial: SerialNumber,
        msg: &IkeMessage,
        inner: Vec<Payload>,
    ) {
        let Some((suite, key)) = self.sk_encrypt_key(serial) else {
            return;
        };
        let Some(st) = self.table.get(serial) else {
            return;
        };
        let reply = IkeMessage {
            initiator_spi: st.spis.initiator,
            responder_spi: st.spis.responder,
            version: IkeVersion::V2,
            exchange_type: msg.exchange_type,
            flags: FLAG_RESPONSE,
            message_id: msg.message_id,
            payloads: Vec::new(),
        };
        match seal_sk(reply, &inner, &suite, &key) {
            Ok(bytes) => self.send_reply(serial, bytes).await,
            Err(e) => tracing::error!("failed to seal reply: {}", e),
        }
    }

    async fn v2_auth_response(&mut self, msg: &IkeMessage, raw: &[u8]) -> ExchangeOutcome {
        let spis = SpiPair {
            initiator: msg.initiator_spi,
            responder: msg.responder_spi,
        };
        let Some(serial) = self.table.find_by_spis(spis) else {
            return ExchangeOutcome::Ignore;
        };
        if self.table.get(serial).map(|s| s.label) != Some(StateLabel::ParentI2) {
            return ExchangeOutcome::Ignore;
        }

        let Some((suite, dec_key)) = self.sk_decrypt_key(serial) else {
            return ExchangeOutcome::Ignore;
        };
        let inner = match open_sk(msg, raw, &suite, &dec_key) {
            Ok(inner) => inner,
            Err(e) => {
                tracing::info!("cannot decrypt IKE_AUTH response: {}", e);
                return ExchangeOutcome::Ignore;
            }
        };

        self.delete_event(serial); // response received

        // an error notify instead of AUTH means we were rejected
        for p in &inner {
            if let Payload::Notify(n) = p {
                match n.notify_type {
                    NotifyType::AuthenticationFailed | NotifyType::NoProposalChosen => {
                        tracing::warn!("IKE_AUTH rejected with {:?}", n.notify_type);
                        return ExchangeOutcome::FatalDeleteState(serial);
                    }
                    NotifyType::TsUnacceptable => {
                        tracing::warn!("peer found our traffic selectors unacceptable");
                        return ExchangeOutcome::FatalDeleteState(serial);
                    }
                    _ => {}
                }
            }
        }

        let conn_id = self.table.get(serial).unwrap().connection;
        let Some(material) = self.v2_auth_material(conn_id) else {
            return ExchangeOutcome::FatalDeleteState(serial);
        };
        let (id_r, auth) = match (
            find(&inner, |p| match p {
                Payload::IdResponder(id) => Some(id),
                _ => None,
            }),
            find(&inner, |p| match p {
                Payload::Auth(a) => Some(a),
                _ => None,
            }),
        ) {
            (Some(id), Some(a)) => (id.clone(), a.clone()),
            _ => return ExchangeOutcome::FatalDeleteState(serial),
        };
        let (first_packet_him, nonce_i) = {
            let st = self.table.get(serial).unwrap();
            (st.first_packet_him.clone(), st.nonce_i.clone())
        };
        let ok = match self.v2_auth_octets(serial, &first_packet_him, &nonce_i, &id_r, false) {
            Some(octets) => {
                let ok = self.v2_auth_verify(serial, conn_id, &material, &octets, &auth);
                drop(SymKey::new(octets));
                ok
            }
            None => false,
        };
        if !ok {
            tracing::warn!("responder authentication failed; deleting half-open SA");
            return ExchangeOutcome::FatalDeleteState(serial);
        }

        let (esp, tsi, tsr) = match (
            find(&inner, |p| match p {
                Payload::Sa(sa) => Some(sa),
                _ => None,
            }),
            find(&inner, |p| match p {
                Payload::TsInitiator(ts) => Some(ts),
                _ => None,
            }),
            find(&inner, |p| match p {
                Payload::TsResponder(ts) => Some(ts),
                _ => None,
            }),
        ) {
            (Some(sa), Some(tsi), Some(tsr)) => (sa, tsi.clone(), tsr.clone()),
            _ => return ExchangeOutcome::FatalDeleteState(serial),
        };
        let Some((child_encr, peer_spi)) = select_esp(esp) else {
            return ExchangeOutcome::FatalDeleteState(serial);
        };

        let Some((ts_this, ts_that)) = process_ts_response(&mut self.conns, conn_id, &tsi, &tsr)
        else {
            tracing::warn!("responder's narrowed selectors do not fit our policy");
            return ExchangeOutcome::FatalDeleteState(serial);
        };

        let Some(child) = self.table.children_of(serial).first().copied() else {
            return ExchangeOutcome::FatalDeleteState(serial);
        };
        {
            let st = self.table.get_mut(child).unwrap();
            st.esp_spi_remote = peer_spi;
            st.ts_this = Some(ts_this);
            st.ts_that = Some(ts_that);
        }
        if let Err(e) = self.install_child_sas(serial, child, child_encr, None).await {
            tracing::error!("kernel rejected the child SA: {}", e);
            return ExchangeOutcome::FatalDeleteState(serial);
        }

        {
            let st = self.table.get_mut(serial).unwrap();
            st.label = StateLabel::V2Established;
        }
        if let Some(conn) = self.conns.get_mut(conn_id) {
            conn.newest_isakmp_sa = serial;
            conn.newest_ipsec_sa = child;
            conn.failed_ikev2 = false;
        }
        self.schedule_sa_lifetimes(serial).await;
        self.schedule_sa_lifetimes(child).await;
        if let Some(st) = self.table.get_mut(serial) {
            if let Some(key) = st.events.release_whack.take() {
                self.timers.cancel(key);
            }
        }
        if let Some(st) = self.table.get_mut(serial) {
            st.release_whack("IPsec SA established");
        }
        tracing::info!("IKEv2 SA established (initiator) {} child {}", serial, child);
        ExchangeOutcome::Ok
    }

    // ================= CREATE_CHILD_SA =================

    async fn v2_child_request(&mut self, msg: &IkeMessage, raw: &[u8]) -> ExchangeOutcome {
        let spis = SpiPair {
            initiator: msg.initiator_spi,
            responder: msg.responder_spi,
        };
        let Some(serial) = self.table.find_by_spis(spis) else {
            return ExchangeOutcome::Ignore;
        };
        if !self
            .table
            .get(serial)
            .map(|s| s.is_established() || s.label == StateLabel::ParentR2)
            .unwrap_or(false)
        {
            return ExchangeOutcome::Ignore;
        }

        let Some((suite, dec_key)) = self.sk_decrypt_key(serial) else {
            return ExchangeOutcome::Ignore;
        };
        let inner = match open_sk(msg, raw, &suite, &dec_key) {
            Ok(inner) => inner,
            Err(_) => return ExchangeOutcome::Ignore,
        };

        let conn_id = self.table.get(serial).unwrap().connection;
        let (esp, nonce, tsi, tsr) = match (
            find(&inner, |p| match p {
                Payload::Sa(sa) => Some(sa),
                _ => None,
            }),
            find_nonce(&inner),
            find(&inner, |p| match p {
                Payload::TsInitiator(ts) => Some(ts),
                _ => None,
            }),
            find(&inner, |p| match p {
                Payload::TsResponder(ts) => Some(ts),
                _ => None,
            }),
        ) {
            (Some(sa), Some(n), Some(tsi), Some(tsr)) => {
                (sa, n.clone(), tsi.clone(), tsr.clone())
            }
            _ => {
                return self
                    .v2_child_reject(serial, msg, NotifyType::InvalidSyntax)
                    .await
            }
        };
        let Some((child_encr, peer_spi)) = select_esp(esp) else {
            return self
                .v2_child_reject(serial, msg, NotifyType::NoProposalChosen)
                .await;
        };
        let Some(narrowed) = process_ts_request(&mut self.conns, conn_id, &tsi, &tsr) else {
            return self
                .v2_child_reject(serial, msg, NotifyType::TsUnacceptable)
                .await;
        };

        let (local_addr, remote_addr) = {
            let st = self.table.get(serial).unwrap();
            (st.local_addr, st.remote_addr)
        };
        let esp_spi = random_spi().map(|s| s as u32).unwrap_or(1).max(1);
        let nr = match random_nonce(NONCE_SIZE) {
            Ok(n) => n,
            Err(_) => return ExchangeOutcome::Ignore,
        };
        let child = self.table.create(
            SaKind::ChildSa,
            SaRole::Responder,
            IkeVersion::V2,
            narrowed.conn,
            local_addr,
            remote_addr,
            StateLabel::V2IpsecR,
        );
        {
            let st = self.table.get_mut(child).unwrap();
            st.parent = serial;
            st.esp_spi_local = esp_spi;
            st.esp_spi_remote = peer_spi;
            st.ts_this = Some(narrowed.ts_this);
            st.ts_that = Some(narrowed.ts_that);
            st.nonce_i = nonce.data.clone();
            st.nonce_r = nr.clone();
        }
        if let Err(e) = self.install_child_sas(serial, child, child_encr, Some(child)).await {
            tracing::error!("kernel rejected the child SA: {}", e);
            self.delete_state(child, "kernel install failed").await;
            return self
                .v2_child_reject(serial, msg, NotifyType::NoProposalChosen)
                .await;
        }

        let inner_reply = vec![
            Payload::Sa(esp_proposal(child_encr, esp_spi)),
            Payload::Nonce(NoncePayload { data: nr }),
            Payload::TsInitiator(TsPayload::single(narrowed.ts_that)),
            Payload::TsResponder(TsPayload::single(narrowed.ts_this)),
        ];
        self.send_sk_reply(serial, msg, inner_reply).await;
        if let Some(conn) = self.conns.get_mut(narrowed.conn) {
            conn.newest_ipsec_sa = child;
        }
        self.schedule_sa_lifetimes(child).await;
        tracing::info!("rekeyed child SA {} under {}", child, serial);
        ExchangeOutcome::Ok
    }

    async fn v2_child_response(&mut self, msg: &IkeMessage, raw: &[u8]) -> ExchangeOutcome {
        let spis = SpiPair {
            initiator: msg.initiator_spi,
            responder: msg.responder_spi,
        };
        let Some(serial) = self.table.find_by_spis(spis) else {
            return ExchangeOutcome::Ignore;
        };
        let Some((suite, dec_key)) = self.sk_decrypt_key(serial) else {
            return ExchangeOutcome::Ignore;
        };
        let inner = match open_sk(msg, raw, &suite, &dec_key) {
            Ok(inner) => inner,
            Err(_) => return ExchangeOutcome::Ignore,
        };
        self.delete_event(serial);

        for p in &inner {
            if let Payload::Notify(n) = p {
                if matches!(
                    n.notify_type,
                    NotifyType::TsUnacceptable | NotifyType::NoProposalChosen
                ) {
                    tracing::warn!("CREATE_CHILD_SA rejected with {:?}", n.notify_type);
                    return ExchangeOutcome::Ok; // parent SA stays up
                }
            }
        }

        let conn_id = self.table.get(serial).unwrap().connection;
        let (esp, nonce, tsi, tsr) = match (
            find(&inner, |p| match p {
                Payload::Sa(sa) => Some(sa),
                _ => None,
            }),
            find_nonce(&inner),
            find(&inner, |p| match p {
                Payload::TsInitiator(ts) => Some(ts),
                _ => None,
            }),
            find(&inner, |p| match p {
                Payload::TsResponder(ts) => Some(ts),
                _ => None,
            }),
        ) {
            (Some(sa), Some(n), Some(tsi), Some(tsr)) => {
                (sa, n.clone(), tsi.clone(), tsr.clone())
            }
            _ => return ExchangeOutcome::Ignore,
        };
        let Some((child_encr, peer_spi)) = select_esp(esp) else {
            return ExchangeOutcome::Ignore;
        };
        let Some((ts_this, ts_that)) = process_ts_response(&mut self.conns, conn_id, &tsi, &tsr)
        else {
            tracing::warn!("rekey response selectors do not fit; dropping child");
            return ExchangeOutcome::Ok;
        };

        // the pending child is the newest unestablished one
        let pending = self
            .table
            .children_of(serial)
            .into_iter()
            .rev()
            .find(|c| {
                self.table
                    .get(*c)
                    .map(|s| s.esp_spi_remote == 0)
                    .unwrap_or(false)
            });
        let Some(child) = pending else {
            return ExchangeOutcome::Ignore;
        };
        {
            let st = self.table.get_mut(child).unwrap();
            st.esp_spi_remote = peer_spi;
            st.ts_this = Some(ts_this);
            st.ts_that = Some(ts_that);
            st.nonce_r = nonce.data.clone();
        }
        if let Err(e) = self.install_child_sas(serial, child, child_encr, Some(child)).await {
            tracing::error!("kernel rejected the rekeyed child SA: {}", e);
            self.delete_state(child, "kernel install failed").await;
            return ExchangeOutcome::Ok;
        }
        if let Some(conn) = self.conns.get_mut(conn_id) {
            conn.newest_ipsec_sa = child;
        }
        self.schedule_sa_lifetimes(child).await;
        tracing::info!("rekeyed child SA {} under {} (initiator)", child, serial);
        ExchangeOutcome::Ok
    }

    /// Rekey an existing child SA: CREATE_CHILD_SA request without PFS.
    pub(crate) async fn initiate_v2_child_rekey(&mut self, parent: SerialNumber) {
        let Some(pst) = self.table.get(parent) else {
            return;
        };
        let conn_id = pst.connection;
        let (local_addr, remote_addr) = (pst.local_addr, pst.remote_addr);
        let Some(conn) = self.conns.get(conn_id) else {
            return;
        };
        let suite = conn.suite;
        let route = &conn.spd[0];
        let (ts_i, ts_r) = (end_to_ts(&route.this), end_to_ts(&route.that));

        let esp_spi = random_spi().map(|s| s as u32).unwrap_or(1).max(1);
        let ni = match random_nonce(NONCE_SIZE) {
            Ok(n) => n,
            Err(_) => return,
        };
        let child = self.table.create(
            SaKind::ChildSa,
            SaRole::Initiator,
            IkeVersion::V2,
            conn_id,
            local_addr,
            remote_addr,
            StateLabel::V2IpsecI,
        );
        {
            let st = self.table.get_mut(child).unwrap();
            st.parent = parent;
            st.esp_spi_local = esp_spi;
            st.nonce_i = ni.clone();
        }

        let inner = vec![
            Payload::Sa(esp_proposal(suite.encr, esp_spi)),
            Payload::Nonce(NoncePayload { data: ni }),
            Payload::TsInitiator(TsPayload::single(ts_i)),
            Payload::TsResponder(TsPayload::single(ts_r)),
        ];
        let Some((suite, key)) = self.sk_encrypt_key(parent) else {
            return;
        };
        let msgid = {
            let pst = self.table.get_mut(parent).unwrap();
            let id = pst.msgid_out;
            pst.msgid_out += 1;
            id
        };
        let pst = self.table.get(parent).unwrap();
        let msg = IkeMessage {
            initiator_spi: pst.spis.initiator,
            responder_spi: pst.spis.responder,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::CreateChildSa,
            flags: if pst.original_role == SaRole::Initiator {
                FLAG_INITIATOR
            } else {
                0
            },
            message_id: msgid,
            payloads: Vec::new(),
        };
        match seal_sk(msg, &inner, &suite, &key) {
            Ok(bytes) => self.send_request(parent, bytes).await,
            Err(e) => tracing::error!("failed to seal CREATE_CHILD_SA: {}", e),
        }
    }

    // ================= INFORMATIONAL =================

    async fn v2_informational_request(&mut self, msg: &IkeMessage, raw: &[u8]) -> ExchangeOutcome {
        let spis = SpiPair {
            initiator: msg.initiator_spi,
            responder: msg.responder_spi,
        };
        let Some(serial) = self.table.find_by_spis(spis) else {
            return ExchangeOutcome::Ignore;
        };
        let Some((suite, dec_key)) = self.sk_decrypt_key(serial) else {
            return ExchangeOutcome::Ignore;
        };
        let inner = match open_sk(msg, raw, &suite, &dec_key) {
            Ok(inner) => inner,
            Err(_) => return ExchangeOutcome::Ignore,
        };

        let mut delete_parent = false;
        let mut dead_children: Vec<SerialNumber> = Vec::new();
        for p in &inner {
            if let Payload::Delete(d) = p {
                if d.protocol_id == 1 {
                    delete_parent = true;
                } else {
                    for spi in &d.spis {
                        if spi.len() == 4 {
                            let spi = u32::from_be_bytes([spi[0], spi[1], spi[2], spi[3]]);
                            let child = self
                                .table
                                .children_of(serial)
                                .into_iter()
                                .find(|c| {
                                    self.table
                                        .get(*c)
                                        .map(|s| s.esp_spi_remote == spi)
                                        .unwrap_or(false)
                                });
                            if let Some(child) = child {
                                dead_children.push(child);
                            }
                        }
                    }
                }
            }
        }

        // acknowledge before tearing anything down
        self.send_sk_reply(serial, msg, Vec::new()).await;

        for child in dead_children {
            self.delete_state(child, "peer sent DELETE").await;
        }
        if delete_parent {
            self.delete_state(serial, "peer sent DELETE").await;
        } else {
            // any authenticated traffic proves the peer is alive
            if let Some(st) = self.table.get_mut(serial) {
                st.pending_liveness = false;
                st.last_liveness = None;
            }
        }
        ExchangeOutcome::Ok
    }

    async fn v2_informational_response(&mut self, msg: &IkeMessage) -> ExchangeOutcome {
        let spis = SpiPair {
            initiator: msg.initiator_spi,
            responder: msg.responder_spi,
        };
        let Some(serial) = self.table.find_by_spis(spis) else {
            return ExchangeOutcome::Ignore;
        };
        self.delete_event(serial);
        if let Some(st) = self.table.get_mut(serial) {
            st.pending_liveness = false;
            st.last_liveness = None;
            tracing::debug!("liveness confirmed for {}", serial);
        }
        ExchangeOutcome::Ok
    }

    /// Empty INFORMATIONAL request used as a liveness probe. Returns
    /// false when the SA has no keys to protect it with yet.
    pub(crate) async fn send_v2_liveness_probe(&mut self, serial: SerialNumber) -> bool {
        let Some((suite, key)) = self.sk_encrypt_key(serial) else {
            return false;
        };
        let Some(st) = self.table.get_mut(serial) else {
            return false;
        };
        let msgid = st.msgid_out;
        st.msgid_out += 1;
        let msg = IkeMessage {
            initiator_spi: st.spis.initiator,
            responder_spi: st.spis.responder,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::Informational,
            flags: if st.original_role == SaRole::Initiator {
                FLAG_INITIATOR
            } else {
                0
            },
            message_id: msgid,
            payloads: Vec::new(),
        };
        let (local, remote) = (st.local_addr, st.remote_addr);
        match seal_sk(msg, &[], &suite, &key) {
            Ok(bytes) => {
                self.send_packet(local, remote, &bytes).await;
                true
            }
            Err(e) => {
                tracing::warn!("failed to seal liveness probe: {}", e);
                false
            }
        }
    }

    /// Announce deletion to the peer, then drop the family locally.
    pub(crate) async fn send_v2_delete(&mut self, serial: SerialNumber) {
        let payloads = vec![Payload::Delete(DeletePayload {
            protocol_id: 1,
            spi_size: 0,
            spis: Vec::new(),
        })];
        let Some((suite, key)) = self.sk_encrypt_key(serial) else {
            return;
        };
        let Some(st) = self.table.get_mut(serial) else {
            return;
        };
        let msgid = st.msgid_out;
        st.msgid_out += 1;
        let msg = IkeMessage {
            initiator_spi: st.spis.initiator,
            responder_spi: st.spis.responder,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::Informational,
            flags: if st.original_role == SaRole::Initiator {
                FLAG_INITIATOR
            } else {
                0
            },
            message_id: msgid,
            payloads: Vec::new(),
        };
        let (local, remote) = (st.local_addr, st.remote_addr);
        if let Ok(bytes) = seal_sk(msg, &payloads, &suite, &key) {
            self.send_packet(local, remote, &bytes).await;
        }
    }

    // ================= shared plumbing =================

    /// Derive the child keymat from SK_d and push both directions into
    /// the kernel.
    pub(crate) async fn install_child_sas(
        &mut self,
        parent: SerialNumber,
        child: SerialNumber,
        encr: crate::crypto::cipher::EncrAlgorithm,
        nonce_source: Option<SerialNumber>,
    ) -> Result<(), crate::kernel::KernelError> {
        let (prf, sk_d) = {
            let pst = match self.table.get(parent) {
                Some(p) => p,
                None => return Ok(()),
            };
            let suite = match pst.suite {
                Some(s) => s,
                None => return Ok(()),
            };
            let sk_d = match &pst.sk {
                Some(sk) => sk.sk_d.clone(),
                None => return Ok(()),
            };
            (suite.prf, sk_d)
        };

        let seed = {
            // AUTH-exchange children reuse the parent nonces; rekeys
            // carry their own
            let src = nonce_source.unwrap_or(parent);
            let st = self.table.get(src).ok_or(crate::kernel::KernelError::NoSuchSa(
                "nonce source".to_string(),
            ))?;
            let mut seed = Vec::with_capacity(st.nonce_i.len() + st.nonce_r.len());
            seed.extend_from_slice(&st.nonce_i);
            seed.extend_from_slice(&st.nonce_r);
            seed
        };

        let key_len = encr.key_len();
        let keymat = prf_plus(prf, &sk_d, &seed, key_len * 2);
        let key_ir = keymat.truncated(key_len);
        let key_ri = SymKey::new(keymat.as_bytes()[key_len..key_len * 2].to_vec());

        let (local_ip, remote_ip, spi_in, spi_out, ts_this, ts_that, we_initiated, conn_id, lifetime) = {
            let st = self
                .table
                .get(child)
                .ok_or(crate::kernel::KernelError::NoSuchSa("child".to_string()))?;
            let conn_id = st.connection;
            let lifetime = self
                .conns
                .get(conn_id)
                .map(|c| c.sa_lifetime)
                .unwrap_or(Duration::from_secs(3600));
            (
                st.local_addr.ip(),
                st.remote_addr.ip(),
                st.esp_spi_local,
                st.esp_spi_remote,
                st.ts_this.expect("narrowed before install"),
                st.ts_that.expect("narrowed before install"),
                st.role == SaRole::Initiator,
                conn_id,
                lifetime,
            )
        };

        // keymat order: first key protects initiator->responder traffic
        let (key_in, key_out) = if we_initiated {
            (key_ri, key_ir)
        } else {
            (key_ir, key_ri)
        };

        let inbound = SaInstall {
            said: SaId {
                proto: SaProto::Esp,
                spi: spi_in,
                dst: local_ip,
            },
            src: remote_ip,
            dst: local_ip,
            encr_key: key_in,
            ts_src: ts_that,
            ts_dst: ts_this,
            inbound: true,
            if_id: self.conns.get(conn_id).and_then(|c| c.if_id),
            lifetime,
        };
        let outbound = SaInstall {
            said: SaId {
                proto: SaProto::Esp,
                spi: spi_out,
                dst: remote_ip,
            },
            src: local_ip,
            dst: remote_ip,
            encr_key: key_out,
            ts_src: ts_this,
            ts_dst: ts_that,
            inbound: false,
            if_id: self.conns.get(conn_id).and_then(|c| c.if_id),
            lifetime,
        };
        self.kernel.install_sa(inbound).await?;
        self.kernel.install_sa(outbound).await?;

        if let Some(if_id) = self.conns.get(conn_id).and_then(|c| c.if_id) {
            let name = format!("ipsec{}", if_id);
            let device = self.interface_device.clone();
            if let Err(e) = self
                .kernel
                .create_virtual_interface(&name, &device, if_id)
                .await
            {
                tracing::warn!("virtual interface {} not created: {}", name, e);
            } else if let Err(e) = self.kernel.set_interface_up(&name).await {
                tracing::warn!("virtual interface {} not brought up: {}", name, e);
            }
        }
        Ok(())
    }

    /// Arm the soft replace and (for children with DPD) liveness events
    /// once an SA is established.
    pub(crate) async fn schedule_sa_lifetimes(&mut self, serial: SerialNumber) {
        let Some(st) = self.table.get(serial) else {
            return;
        };
        let conn_id = st.connection;
        let is_child = st.is_child_sa();
        let version = st.version;
        let Some(conn) = self.conns.get(conn_id) else {
            return;
        };

        let soft = conn.sa_lifetime.saturating_sub(conn.rekey_margin);
        let kind = if conn.policy.contains(Policy::REPLACE_IF_USED) {
            EventKind::SaReplaceIfUsed
        } else {
            EventKind::SaReplace
        };
        let dpd = conn.dpd_enabled().then_some(conn.dpd_delay);
        self.schedule_state_event(serial, kind, soft);

        if is_child {
            if let Some(delay) = dpd {
                let kind = match version {
                    IkeVersion::V2 => EventKind::Liveness,
                    IkeVersion::V1 => EventKind::Dpd,
                };
                self.schedule_state_event(serial, kind, std::cmp::max(delay, MIN_LIVENESS));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::conn::{
        ConnKind, Connection, ConnectionStore, DpdAction, End, PeerId,
        SpdRoute,
    };
    use crate::crypto::cipher::CipherSuite;
    use crate::engine::state::SaKind;
    use crate::kernel::MockKernel;
    use std::sync::Arc;

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

    fn conn(this: End, that: End) -> Connection {
        Connection {
            name: "east-west".to_string(),
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
            psk: Some(b"interop-psk".to_vec()),
            sig_key: None,
            if_id: None,
            suite: CipherSuite::default(),
            newest_isakmp_sa: SerialNumber::NOBODY,
            newest_ipsec_sa: SerialNumber::NOBODY,
            failed_ikev2: false,
        }
    }

    struct Peer {
        engine: Engine,
        kernel: Arc<MockKernel>,
        addr: SocketAddr,
    }

    fn peer(this: End, that: End) -> Peer {
        let addr: SocketAddr = (this.host_addr, 500u16).into();
        let mut conns = ConnectionStore::new();
        conns.add(conn(this, that));
        let kernel = Arc::new(MockKernel::default());
        let (engine, _tx) = Engine::for_tests(conns, kernel.clone());
        Peer {
            engine,
            kernel,
            addr,
        }
    }

    fn west_east() -> (Peer, Peer) {
        let west = peer(
            end("10.0.1.0/24", "192.0.2.1"),
            end("10.0.2.0/24", "192.0.2.2"),
        );
        let east = peer(
            end("10.0.2.0/24", "192.0.2.2"),
            end("10.0.1.0/24", "192.0.2.1"),
        );
        (west, east)
    }

    /// Two peers authenticating with ECDSA signatures, no PSK anywhere.
    fn sig_west_east() -> (Peer, Peer) {
        let (west_key, west_pub) = crate::crypto::sig::test_keypair();
        let (east_key, east_pub) = crate::crypto::sig::test_keypair();

        let make = |this: End, that: End, key, peer_pub: Vec<u8>| {
            let addr: SocketAddr = (this.host_addr, 500u16).into();
            let mut c = conn(this, that);
            c.psk = None;
            c.sig_key = Some(Arc::new(key));
            c.spd[0].that.sig_pub_key = Some(peer_pub);
            let mut conns = ConnectionStore::new();
            conns.add(c);
            let kernel = Arc::new(MockKernel::default());
            let (engine, _tx) = Engine::for_tests(conns, kernel.clone());
            Peer {
                engine,
                kernel,
                addr,
            }
        };

        let west = make(
            end("10.0.1.0/24", "192.0.2.1"),
            end("10.0.2.0/24", "192.0.2.2"),
            west_key,
            east_pub,
        );
        let east = make(
            end("10.0.2.0/24", "192.0.2.2"),
            end("10.0.1.0/24", "192.0.2.1"),
            east_key,
            west_pub,
        );
        (west, east)
    }

    fn parent_of(engine: &Engine) -> SerialNumber {
        engine
            .table
            .iter()
            .find(|s| s.kind == SaKind::IkeSa)
            .map(|s| s.serial)
            .expect("parent SA exists")
    }

    fn last_sent(engine: &Engine, serial: SerialNumber) -> Vec<u8> {
        engine
            .table
            .get(serial)
            .and_then(|s| s.tpacket.clone())
            .expect("a message was recorded")
    }

    #[tokio::test]
    async fn full_v2_handshake_establishes_both_sides() {
        let (mut west, mut east) = west_east();

        // west starts keying
        west.engine.initiate_connection(ConnId(0), 1, None).await;
        let w_parent = parent_of(&west.engine);
        let sa_init = last_sent(&west.engine, w_parent);

        // east answers IKE_SA_INIT (reply built after its DH completes)
        east.engine.handle_datagram(&sa_init, west.addr, 500).await;
        east.engine.drain_one_completion().await;
        let e_parent = parent_of(&east.engine);
        let sa_init_reply = last_sent(&east.engine, e_parent);
        assert_eq!(
            east.engine.table.get(e_parent).unwrap().label,
            StateLabel::ParentR1
        );

        // west keys up and sends IKE_AUTH
        west.engine.handle_datagram(&sa_init_reply, east.addr, 500).await;
        west.engine.drain_one_completion().await;
        assert_eq!(
            west.engine.table.get(w_parent).unwrap().label,
            StateLabel::ParentI2
        );
        let auth_req = last_sent(&west.engine, w_parent);

        // east authenticates, narrows, installs, replies
        east.engine.handle_datagram(&auth_req, west.addr, 500).await;
        assert_eq!(
            east.engine.table.get(e_parent).unwrap().label,
            StateLabel::ParentR2
        );
        assert_eq!(east.kernel.installed.lock().unwrap().len(), 2);
        let auth_reply = last_sent(&east.engine, e_parent);

        // west verifies the answer and installs its side
        west.engine.handle_datagram(&auth_reply, east.addr, 500).await;
        assert_eq!(
            west.engine.table.get(w_parent).unwrap().label,
            StateLabel::V2Established
        );
        assert_eq!(west.kernel.installed.lock().unwrap().len(), 2);

        // both sides agree on the negotiated selectors
        let w_child = west
            .engine
            .table
            .children_of(w_parent)
            .first()
            .copied()
            .unwrap();
        let e_child = east
            .engine
            .table
            .children_of(e_parent)
            .first()
            .copied()
            .unwrap();
        let w_child_st = west.engine.table.get(w_child).unwrap();
        let e_child_st = east.engine.table.get(e_child).unwrap();
        assert!(w_child_st.is_established());
        assert!(e_child_st.is_established());
        assert_eq!(w_child_st.ts_this, e_child_st.ts_that);
        assert_eq!(w_child_st.ts_that, e_child_st.ts_this);

        // ESP SPIs crossed over correctly
        assert_eq!(w_child_st.esp_spi_remote, e_child_st.esp_spi_local);
        assert_eq!(e_child_st.esp_spi_remote, w_child_st.esp_spi_local);

        // bookkeeping: newest SAs recorded, lifetimes armed
        let w_conn = west.engine.conns.get(ConnId(0)).unwrap();
        assert_eq!(w_conn.newest_isakmp_sa, w_parent);
        assert_eq!(w_conn.newest_ipsec_sa, w_child);
        assert!(west
            .engine
            .table
            .get(w_child)
            .unwrap()
            .events
            .event
            .is_some());
    }

    #[tokio::test]
    async fn full_v2_handshake_with_signature_auth() {
        let (mut west, mut east) = sig_west_east();

        west.engine.initiate_connection(ConnId(0), 1, None).await;
        let w_parent = parent_of(&west.engine);
        let sa_init = last_sent(&west.engine, w_parent);

        east.engine.handle_datagram(&sa_init, west.addr, 500).await;
        east.engine.drain_one_completion().await;
        let e_parent = parent_of(&east.engine);
        let sa_init_reply = last_sent(&east.engine, e_parent);

        west.engine.handle_datagram(&sa_init_reply, east.addr, 500).await;
        west.engine.drain_one_completion().await;
        let auth_req = last_sent(&west.engine, w_parent);

        east.engine.handle_datagram(&auth_req, west.addr, 500).await;
        assert_eq!(
            east.engine.table.get(e_parent).unwrap().label,
            StateLabel::ParentR2
        );
        assert_eq!(east.kernel.installed.lock().unwrap().len(), 2);
        let auth_reply = last_sent(&east.engine, e_parent);

        west.engine.handle_datagram(&auth_reply, east.addr, 500).await;
        assert_eq!(
            west.engine.table.get(w_parent).unwrap().label,
            StateLabel::V2Established
        );
        assert_eq!(west.kernel.installed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn signature_auth_against_wrong_pinned_key_is_rejected() {
        let (mut west, mut east) = sig_west_east();
        // east pins a key that was never west's
        let (_, stranger_pub) = crate::crypto::sig::test_keypair();
        east.engine.conns.get_mut(ConnId(0)).unwrap().spd[0].that.sig_pub_key =
            Some(stranger_pub);

        west.engine.initiate_connection(ConnId(0), 1, None).await;
        let w_parent = parent_of(&west.engine);
        let sa_init = last_sent(&west.engine, w_parent);
        east.engine.handle_datagram(&sa_init, west.addr, 500).await;
        east.engine.drain_one_completion().await;
        let e_parent = parent_of(&east.engine);
        let sa_init_reply = last_sent(&east.engine, e_parent);
        west.engine.handle_datagram(&sa_init_reply, east.addr, 500).await;
        west.engine.drain_one_completion().await;
        let auth_req = last_sent(&west.engine, w_parent);

        east.engine.handle_datagram(&auth_req, west.addr, 500).await;

        // the forged signature never authenticates: no child, no kernel
        // SAs, and the half-open IKE SA is gone
        assert!(east.engine.table.get(e_parent).is_none());
        assert_eq!(east.kernel.installed.lock().unwrap().len(), 0);
        // the initiator is still waiting; nothing was established
        assert_ne!(
            west.engine.table.get(w_parent).unwrap().label,
            StateLabel::V2Established
        );
    }

    #[tokio::test]
    async fn duplicate_auth_request_is_answered_from_the_record() {
        let (mut west, mut east) = west_east();

        west.engine.initiate_connection(ConnId(0), 1, None).await;
        let w_parent = parent_of(&west.engine);
        let sa_init = last_sent(&west.engine, w_parent);
        east.engine.handle_datagram(&sa_init, west.addr, 500).await;
        east.engine.drain_one_completion().await;
        let e_parent = parent_of(&east.engine);
        let sa_init_reply = last_sent(&east.engine, e_parent);
        west.engine.handle_datagram(&sa_init_reply, east.addr, 500).await;
        west.engine.drain_one_completion().await;
        let auth_req = last_sent(&west.engine, w_parent);

        east.engine.handle_datagram(&auth_req, west.addr, 500).await;
        let states_after_first = east.engine.table.len();
        let installs_after_first = east.kernel.installed.lock().unwrap().len();

        // the retransmitted AUTH must not create more state or SAs
        east.engine.handle_datagram(&auth_req, west.addr, 500).await;
        assert_eq!(east.engine.table.len(), states_after_first);
        assert_eq!(
            east.kernel.installed.lock().unwrap().len(),
            installs_after_first
        );
    }

    #[tokio::test]
    async fn unacceptable_selectors_reject_child_but_keep_responder_ike_sa() {
        let mut west = peer(
            end("10.0.1.0/24", "192.0.2.1"),
            end("10.0.9.0/24", "192.0.2.2"),
        );
        // east protects different subnets; nothing west asks for fits
        let mut east = peer(
            end("10.0.5.0/24", "192.0.2.2"),
            end("10.0.6.0/24", "192.0.2.1"),
        );

        west.engine.initiate_connection(ConnId(0), 1, None).await;
        let w_parent = parent_of(&west.engine);
        let sa_init = last_sent(&west.engine, w_parent);
        east.engine.handle_datagram(&sa_init, west.addr, 500).await;
        east.engine.drain_one_completion().await;
        let e_parent = parent_of(&east.engine);
        let sa_init_reply = last_sent(&east.engine, e_parent);
        west.engine.handle_datagram(&sa_init_reply, east.addr, 500).await;
        west.engine.drain_one_completion().await;
        let auth_req = last_sent(&west.engine, w_parent);

        east.engine.handle_datagram(&auth_req, west.addr, 500).await;

        // authenticated but unprotectable: TS_UNACCEPTABLE, no child,
        // IKE SA kept for a later CREATE_CHILD_SA attempt
        assert_eq!(
            east.engine.table.get(e_parent).unwrap().label,
            StateLabel::ParentR2
        );
        assert!(east.engine.table.children_of(e_parent).is_empty());
        assert_eq!(east.kernel.installed.lock().unwrap().len(), 0);

        // the initiator reads the notify and gives up on this SA
        let auth_reply = last_sent(&east.engine, e_parent);
        west.engine.handle_datagram(&auth_reply, east.addr, 500).await;
        assert!(west.engine.table.get(w_parent).is_none());
    }

    #[tokio::test]
    async fn sa_init_from_unknown_peer_is_dropped_silently() {
        let (_, mut east) = west_east();
        let stranger: SocketAddr = "198.51.100.77:500".parse().unwrap();

        let msg = IkeMessage {
            initiator_spi: 0x1111,
            responder_spi: 0,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::IkeSaInit,
            flags: FLAG_INITIATOR,
            message_id: 0,
            payloads: vec![Payload::Sa(ike_proposal(&CipherSuite::default()))],
        };
        east.engine
            .handle_datagram(&msg.to_bytes(), stranger, 500)
            .await;
        assert!(east.engine.table.is_empty());
    }
}
