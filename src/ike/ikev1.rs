//! IKEv1 (ISAKMP) exchanges: main mode, aggressive mode, quick mode,
//! and the DPD informationals. Phase 1 feeds the SKEYID ladder; quick
//! mode derives child keymat from SKEYID_d and installs the SAs.

use std::net::SocketAddr;

use crate::config::conn::{ConnId, Policy};
use crate::crypto::cipher::EncrAlgorithm;
use crate::crypto::dh::DhSecret;
use crate::crypto::prf::{v1_keymat, V1Auth};
use crate::crypto::sig::verify_signature;
use crate::crypto::task::DhContinuation;
use crate::crypto::{random_nonce, random_spi, PrfAlgorithm, SymKey};
use crate::engine::state::{SaKind, SaRole, SerialNumber, SpiPair, StateLabel, WhackHandle};
use crate::engine::Engine;
use crate::ike::proposal::{
    esp_proposal, select_esp, select_v1_auth, v1_ike_proposal, V1AuthMethod,
};
use crate::ike::{
    emit_payload_chain, ExchangeType, IdPayload, IkeMessage, IkeVersion, KePayload, NoncePayload,
    NotifyPayload, NotifyType, Payload,
};

/// DPD notify types (RFC 3706).
const DPD_R_U_THERE: u16 = 36136;
const DPD_R_U_THERE_ACK: u16 = 36137;

const NONCE_SIZE: usize = 32;

fn id_body(id: &IdPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + id.data.len());
    out.push(id.id_type.wire());
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&id.data);
    out
}

/// HASH_I = prf(SKEYID, g^xi | g^xr | CKY-I | CKY-R | SAi_b | IDii_b);
/// HASH_R swaps the KE values and cookies.
#[allow(clippy::too_many_arguments)]
fn phase1_hash(
    prf: PrfAlgorithm,
    skeyid: &SymKey,
    ke_a: &[u8],
    ke_b: &[u8],
    cky_a: u64,
    cky_b: u64,
    sa_body: &[u8],
    id: &[u8],
) -> Vec<u8> {
    prf.prf_parts(
        skeyid.as_bytes(),
        &[
            ke_a,
            ke_b,
            &cky_a.to_be_bytes(),
            &cky_b.to_be_bytes(),
            sa_body,
            id,
        ],
    )
    .as_bytes()
    .to_vec()
}

/// HASH(1) = prf(SKEYID_a, M-ID | rest-of-message);
/// HASH(2) adds Ni_b between them.
fn quick_hash(
    prf: PrfAlgorithm,
    skeyid_a: &SymKey,
    msgid: u32,
    ni: Option<&[u8]>,
    rest: &[u8],
) -> Vec<u8> {
    let msgid = msgid.to_be_bytes();
    let out = match ni {
        Some(ni) => prf.prf_parts(skeyid_a.as_bytes(), &[&msgid, ni, rest]),
        None => prf.prf_parts(skeyid_a.as_bytes(), &[&msgid, rest]),
    };
    out.as_bytes().to_vec()
}

/// HASH(3) = prf(SKEYID_a, 0 | M-ID | Ni_b | Nr_b)
fn quick_hash3(prf: PrfAlgorithm, skeyid_a: &SymKey, msgid: u32, ni: &[u8], nr: &[u8]) -> Vec<u8> {
    prf.prf_parts(skeyid_a.as_bytes(), &[&[0u8], &msgid.to_be_bytes(), ni, nr])
        .as_bytes()
        .to_vec()
}

/// Quick-mode KEYMAT for one SA direction:
/// K1 = prf(SKEYID_d, [g^xy |] protocol | SPI | Ni_b | Nr_b),
/// Kn = prf(SKEYID_d, Kn-1 | [g^xy |] protocol | SPI | Ni_b | Nr_b),
/// concatenated until the cipher is satisfied.
#[allow(clippy::too_many_arguments)]
fn v1_child_keymat(
    prf: PrfAlgorithm,
    skeyid_d: &SymKey,
    g_xy: Option<&SymKey>,
    protocol: u8,
    spi: u32,
    ni: &[u8],
    nr: &[u8],
    needed: usize,
) -> SymKey {
    let mut base = Vec::new();
    if let Some(g) = g_xy {
        base.extend_from_slice(g.as_bytes());
    }
    base.push(protocol);
    base.extend_from_slice(&spi.to_be_bytes());
    base.extend_from_slice(ni);
    base.extend_from_slice(nr);

    let mut keymat = prf.prf(skeyid_d.as_bytes(), &base);
    let mut last = keymat.clone();
    while keymat.len() < needed {
        last = prf.prf_parts(skeyid_d.as_bytes(), &[last.as_bytes(), &base]);
        keymat.append(&last);
    }
    drop(last);
    drop(SymKey::new(base));
    keymat.truncated(needed)
}

fn chain_bytes(payloads: &[Payload]) -> Vec<u8> {
    let mut out = Vec::new();
    emit_payload_chain(IkeVersion::V1, payloads, &mut out);
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

fn find_sa(payloads: &[Payload]) -> Option<&crate::ike::SaPayload> {
    payloads.iter().find_map(|p| match p {
        Payload::Sa(sa) => Some(sa),
        _ => None,
    })
}

fn find_ke(payloads: &[Payload]) -> Option<&KePayload> {
    payloads.iter().find_map(|p| match p {
        Payload::KeyExchange(k) => Some(k),
        _ => None,
    })
}

fn find_nonce(payloads: &[Payload]) -> Option<&NoncePayload> {
    payloads.iter().find_map(|p| match p {
        Payload::Nonce(n) => Some(n),
        _ => None,
    })
}

fn find_id(payloads: &[Payload]) -> Option<&IdPayload> {
    payloads.iter().find_map(|p| match p {
        Payload::IdInitiator(id) | Payload::IdResponder(id) => Some(id),
        _ => None,
    })
}

fn find_hash(payloads: &[Payload]) -> Option<&Vec<u8>> {
    payloads.iter().find_map(|p| match p {
        Payload::Hash(h) => Some(h),
        _ => None,
    })
}

fn find_signature(payloads: &[Payload]) -> Option<&Vec<u8>> {
    payloads.iter().find_map(|p| match p {
        Payload::Signature(s) => Some(s),
        _ => None,
    })
}

/// The peer's authenticator bytes, HASH or SIG; the verifier decides
/// which one the connection's mode actually accepts.
fn find_v1_auth_bytes(payloads: &[Payload]) -> Option<&Vec<u8>> {
    find_hash(payloads).or_else(|| find_signature(payloads))
}

impl Engine {
    fn v1_msg(
        &self,
        spis: SpiPair,
        exchange: ExchangeType,
        msgid: u32,
        payloads: Vec<Payload>,
    ) -> IkeMessage {
        IkeMessage {
            initiator_spi: spis.initiator,
            responder_spi: spis.responder,
            version: IkeVersion::V1,
            exchange_type: exchange,
            flags: 0,
            message_id: msgid,
            payloads,
        }
    }

    /// Start phase 1: main mode by default, aggressive when policy asks
    /// for it.
    pub(crate) async fn initiate_v1(
        &mut self,
        conn_id: ConnId,
        try_count: u32,
        whack: Option<WhackHandle>,
    ) {
        let Some(conn) = self.conns.get(conn_id) else {
            return;
        };
        let suite = conn.suite;
        let auth_mode = conn.v1_auth_method();
        let aggressive = conn.policy.contains(Policy::AGGRESSIVE);
        let route = &conn.spd[0];
        let local: SocketAddr = (route.this.host_addr, self.ike_port).into();
        let remote: SocketAddr = (route.that.host_addr, self.ike_port).into();

        let Ok(ispi) = random_spi() else { return };
        let label = if aggressive {
            StateLabel::AggrI1
        } else {
            StateLabel::MainI1
        };
        let serial = self.table.create(
            SaKind::IkeSa,
            SaRole::Initiator,
            IkeVersion::V1,
            conn_id,
            local,
            remote,
            label,
        );

        let sa = v1_ike_proposal(&suite, auth_mode);
        let mut sa_body = Vec::new();
        sa.emit(IkeVersion::V1, &mut sa_body);

        let mut payloads = vec![Payload::Sa(sa)];
        if aggressive {
            let (Ok(nonce), Ok(dh)) = (random_nonce(NONCE_SIZE), DhSecret::generate(suite.dh))
            else {
                self.delete_state(serial, "entropy failure").await;
                return;
            };
            payloads.push(Payload::KeyExchange(KePayload {
                dh_group: 0,
                data: dh.public_value().to_vec(),
            }));
            payloads.push(Payload::Nonce(NoncePayload {
                data: nonce.clone(),
            }));
            payloads.push(Payload::IdInitiator(self.id_payload_for(conn_id)));
            let st = self.table.get_mut(serial).expect("just created");
            st.nonce_i = nonce;
            st.dh_secret = Some(dh);
        }

        let msg = self.v1_msg(
            SpiPair {
                initiator: ispi,
                responder: 0,
            },
            if aggressive {
                ExchangeType::Aggressive
            } else {
                ExchangeType::IdProt
            },
            0,
            payloads,
        );
        {
            let st = self.table.get_mut(serial).expect("just created");
            st.spis.initiator = ispi;
            st.suite = Some(suite);
            st.try_count = try_count;
            st.v1_sa_body = sa_body;
            st.whack = whack;
        }
        self.send_request(serial, msg.to_bytes()).await;
    }

    pub(crate) async fn dispatch_v1(
        &mut self,
        msg: IkeMessage,
        raw: Vec<u8>,
        from: SocketAddr,
        local_port: u16,
    ) {
        match msg.exchange_type {
            ExchangeType::IdProt => self.v1_main(msg, from, local_port).await,
            ExchangeType::Aggressive => self.v1_aggressive(msg, from, local_port).await,
            ExchangeType::QuickMode => self.v1_quick(msg, raw, from).await,
            ExchangeType::InformationalV1 => self.v1_informational(msg).await,
            _ => {}
        }
    }

    fn v1_find_parent(&self, msg: &IkeMessage) -> Option<SerialNumber> {
        let pair = SpiPair {
            initiator: msg.initiator_spi,
            responder: msg.responder_spi,
        };
        self.table
            .find_by_spis(pair)
            .or_else(|| self.table.find_by_initiator_spi(msg.initiator_spi))
    }

    // ================= main mode =================

    async fn v1_main(&mut self, msg: IkeMessage, from: SocketAddr, local_port: u16) {
        let existing = self.v1_find_parent(&msg);

        // message 1: a fresh SA offer
        if existing.is_none() && msg.responder_spi == 0 {
            self.v1_main_new_responder(msg, from, local_port).await;
            return;
        }
        let Some(serial) = existing else {
            return;
        };
        let (role, label) = {
            let st = self.table.get(serial).unwrap();
            (st.role, st.label)
        };

        match (role, label) {
            // message 2: responder's SA choice
            (SaRole::Initiator, StateLabel::MainI1) => {
                let Some(sa) = find_sa(&msg.payloads) else {
                    return;
                };
                // the echoed auth method must be the one we proposed
                let mode = self
                    .conns
                    .get(self.table.get(serial).unwrap().connection)
                    .map(|c| c.v1_auth_method());
                if select_v1_auth(sa) != mode {
                    tracing::warn!(
                        "responder switched the authentication method; rejecting"
                    );
                    self.delete_state(serial, "auth method mismatch").await;
                    return;
                }
                self.delete_event(serial);
                if !self.table.index_spis(
                    serial,
                    SpiPair {
                        initiator: msg.initiator_spi,
                        responder: msg.responder_spi,
                    },
                ) {
                    self.delete_state(serial, "SPI collision").await;
                    return;
                }
                let suite = self.table.get(serial).unwrap().suite.expect("set at init");
                let (Ok(nonce), Ok(dh)) =
                    (random_nonce(NONCE_SIZE), DhSecret::generate(suite.dh))
                else {
                    self.delete_state(serial, "entropy failure").await;
                    return;
                };
                let payloads = vec![
                    Payload::KeyExchange(KePayload {
                        dh_group: 0,
                        data: dh.public_value().to_vec(),
                    }),
                    Payload::Nonce(NoncePayload {
                        data: nonce.clone(),
                    }),
                ];
                let spis = self.table.get(serial).unwrap().spis;
                let out = self.v1_msg(spis, ExchangeType::IdProt, 0, payloads);
                {
                    let st = self.table.get_mut(serial).unwrap();
                    st.nonce_i = nonce;
                    st.dh_secret = Some(dh);
                    st.label = StateLabel::MainI2;
                }
                self.send_request(serial, out.to_bytes()).await;
            }

            // message 3: initiator's KE and nonce
            (SaRole::Responder, StateLabel::MainR1) => {
                let (Some(ke), Some(nonce)) = (find_ke(&msg.payloads), find_nonce(&msg.payloads))
                else {
                    return;
                };
                if self.table.get(serial).unwrap().dh_task.is_some() {
                    return; // duplicate while keying
                }
                let suite = self.table.get(serial).unwrap().suite.expect("set at reply");
                let (Ok(nr), Ok(dh)) = (random_nonce(NONCE_SIZE), DhSecret::generate(suite.dh))
                else {
                    self.delete_state(serial, "entropy failure").await;
                    return;
                };
                let peer_ke = ke.data.clone();
                {
                    let st = self.table.get_mut(serial).unwrap();
                    st.nonce_i = nonce.data.clone();
                    st.nonce_r = nr;
                    st.v1_peer_ke = peer_ke.clone();
                    st.dh_secret = Some(dh);
                }
                self.submit_dh(serial, peer_ke, DhContinuation::V1PhaseOne);
            }

            // message 4: responder's KE and nonce
            (SaRole::Initiator, StateLabel::MainI2) => {
                let (Some(ke), Some(nonce)) = (find_ke(&msg.payloads), find_nonce(&msg.payloads))
                else {
                    return;
                };
                if self.table.get(serial).unwrap().dh_task.is_some() {
                    return; // duplicate while keying
                }
                self.delete_event(serial);
                let peer_ke = ke.data.clone();
                {
                    let st = self.table.get_mut(serial).unwrap();
                    st.nonce_r = nonce.data.clone();
                    st.v1_peer_ke = peer_ke.clone();
                }
                self.submit_dh(serial, peer_ke, DhContinuation::V1PhaseOne);
            }

            // message 5: initiator's identity and HASH_I / SIG_I
            (SaRole::Responder, StateLabel::MainR2) => {
                let Some(id) = find_id(&msg.payloads) else {
                    return;
                };
                let id = id.clone();
                if !self.v1_verify_peer_auth(serial, &id_body(&id), &msg.payloads, true) {
                    tracing::warn!("phase 1 authentication failed for {}", from);
                    self.v1_send_notify(serial, NotifyType::AuthenticationFailed).await;
                    self.delete_state(serial, "phase 1 authentication failed").await;
                    return;
                }
                let conn_id = self.table.get(serial).unwrap().connection;
                let id_r = self.id_payload_for(conn_id);
                let Some(auth_r) = self.v1_own_auth_payload(serial, &id_body(&id_r), false)
                else {
                    return;
                };
                let spis = self.table.get(serial).unwrap().spis;
                let out = self.v1_msg(
                    spis,
                    ExchangeType::IdProt,
                    0,
                    vec![Payload::IdResponder(id_r), auth_r],
                );
                {
                    let st = self.table.get_mut(serial).unwrap();
                    st.v1_peer_id = id_body(&id);
                    st.label = StateLabel::MainR3;
                }
                if let Some(conn) = self.conns.get_mut(conn_id) {
                    conn.newest_isakmp_sa = serial;
                }
                self.send_reply(serial, out.to_bytes()).await;
                self.schedule_sa_lifetimes(serial).await;
                tracing::info!("IKEv1 ISAKMP SA established (responder) {}", serial);
            }

            // message 6: responder's identity and HASH_R / SIG_R
            (SaRole::Initiator, StateLabel::MainI3) => {
                let Some(id) = find_id(&msg.payloads) else {
                    return;
                };
                let id = id.clone();
                self.delete_event(serial);
                if !self.v1_verify_peer_auth(serial, &id_body(&id), &msg.payloads, false) {
                    tracing::warn!("responder authentication failed");
                    self.delete_state(serial, "phase 1 authentication failed").await;
                    return;
                }
                let conn_id = self.table.get(serial).unwrap().connection;
                {
                    let st = self.table.get_mut(serial).unwrap();
                    st.label = StateLabel::MainI4;
                }
                if let Some(conn) = self.conns.get_mut(conn_id) {
                    conn.newest_isakmp_sa = serial;
                    conn.failed_ikev2 = true; // v1 worked; stay here on replace
                }
                self.schedule_sa_lifetimes(serial).await;
                tracing::info!("IKEv1 ISAKMP SA established (initiator) {}", serial);
                self.initiate_v1_quick(serial).await;
            }

            _ => {
                tracing::debug!(
                    "unexpected main mode message for {} in {}",
                    serial,
                    label.name()
                );
            }
        }
    }

    async fn v1_main_new_responder(&mut self, msg: IkeMessage, from: SocketAddr, local_port: u16) {
        let Some(sa) = find_sa(&msg.payloads) else {
            return;
        };
        let Some(conn_id) = self.find_v1_connection_for_peer(from.ip()) else {
            tracing::debug!("no IKEv1 connection authorizes peer {}", from);
            return;
        };
        let conn = self.conns.get(conn_id).unwrap();
        let suite = conn.suite;
        let auth_mode = conn.v1_auth_method();

        let peer_auth = select_v1_auth(sa);
        if peer_auth != Some(auth_mode) {
            tracing::warn!(
                "peer {} proposed auth method {:?}, policy runs {:?}; rejecting",
                from,
                peer_auth,
                auth_mode
            );
            self.v1_send_unprotected_notify(&msg, from, local_port, NotifyType::NoProposalChosen)
                .await;
            return;
        }

        let mut sa_body = Vec::new();
        sa.emit(IkeVersion::V1, &mut sa_body);

        let Ok(rspi) = random_spi() else { return };
        let local: SocketAddr = self
            .conns
            .get(conn_id)
            .map(|c| (c.spd[0].this.host_addr, local_port).into())
            .unwrap_or(from);
        let serial = self.table.create(
            SaKind::IkeSa,
            SaRole::Responder,
            IkeVersion::V1,
            conn_id,
            local,
            from,
            StateLabel::MainR1,
        );
        let spis = SpiPair {
            initiator: msg.initiator_spi,
            responder: rspi,
        };
        {
            let st = self.table.get_mut(serial).expect("just created");
            st.suite = Some(suite);
            st.v1_sa_body = sa_body;
        }
        if !self.table.index_spis(serial, spis) {
            self.delete_state(serial, "SPI collision").await;
            return;
        }

        // echo the first acceptable proposal, auth method included
        let out = self.v1_msg(
            spis,
            ExchangeType::IdProt,
            0,
            vec![Payload::Sa(v1_ike_proposal(&suite, auth_mode))],
        );
        self.send_reply(serial, out.to_bytes()).await;
    }

    /// Reject an exchange that never earned a state of its own.
    async fn v1_send_unprotected_notify(
        &mut self,
        msg: &IkeMessage,
        from: SocketAddr,
        local_port: u16,
        notify: NotifyType,
    ) {
        let reply = IkeMessage {
            initiator_spi: msg.initiator_spi,
            responder_spi: 0,
            version: IkeVersion::V1,
            exchange_type: ExchangeType::InformationalV1,
            flags: 0,
            message_id: 0,
            payloads: vec![Payload::Notify(NotifyPayload::error(notify))],
        };
        let mut local = from;
        local.set_port(local_port);
        self.send_packet(local, from, &reply.to_bytes()).await;
    }

    fn find_v1_connection_for_peer(&self, peer: std::net::IpAddr) -> Option<ConnId> {
        self.conns
            .iter()
            .find(|(_, c)| {
                c.policy.contains(Policy::IKEV1_ALLOW)
                    && c.spd.iter().any(|r| r.that.host_addr == peer)
            })
            .map(|(id, _)| id)
    }

    // ================= aggressive mode =================

    async fn v1_aggressive(&mut self, msg: IkeMessage, from: SocketAddr, local_port: u16) {
        let existing = self.v1_find_parent(&msg);

        if existing.is_none() && msg.responder_spi == 0 {
            // message 1: SA, KE, Ni, IDi all at once
            let (Some(sa), Some(ke), Some(nonce), Some(id)) = (
                find_sa(&msg.payloads),
                find_ke(&msg.payloads),
                find_nonce(&msg.payloads),
                find_id(&msg.payloads),
            ) else {
                return;
            };
            let Some(conn_id) = self.find_v1_connection_for_peer(from.ip()) else {
                return;
            };
            let conn = self.conns.get(conn_id).unwrap();
            let suite = conn.suite;
            let auth_mode = conn.v1_auth_method();
            if select_v1_auth(sa) != Some(auth_mode) {
                tracing::warn!(
                    "aggressive mode peer {} proposed auth method {:?}, policy runs {:?}",
                    from,
                    select_v1_auth(sa),
                    auth_mode
                );
                self.v1_send_unprotected_notify(&msg, from, local_port, NotifyType::NoProposalChosen)
                    .await;
                return;
            }
            let mut sa_body = Vec::new();
            sa.emit(IkeVersion::V1, &mut sa_body);
            let peer_ke = ke.data.clone();
            let nonce_i = nonce.data.clone();
            let peer_id = id_body(id);

            let (Ok(rspi), Ok(nr), Ok(dh)) = (
                random_spi(),
                random_nonce(NONCE_SIZE),
                DhSecret::generate(suite.dh),
            ) else {
                return;
            };
            let local: SocketAddr = self
                .conns
                .get(conn_id)
                .map(|c| (c.spd[0].this.host_addr, local_port).into())
                .unwrap_or(from);
            let serial = self.table.create(
                SaKind::IkeSa,
                SaRole::Responder,
                IkeVersion::V1,
                conn_id,
                local,
                from,
                StateLabel::AggrR1,
            );
            let spis = SpiPair {
                initiator: msg.initiator_spi,
                responder: rspi,
            };
            {
                let st = self.table.get_mut(serial).expect("just created");
                st.suite = Some(suite);
                st.v1_sa_body = sa_body;
                st.v1_peer_ke = peer_ke.clone();
                st.v1_peer_id = peer_id;
                st.nonce_i = nonce_i;
                st.nonce_r = nr;
                st.dh_secret = Some(dh);
            }
            if !self.table.index_spis(serial, spis) {
                self.delete_state(serial, "SPI collision").await;
                return;
            }
            self.submit_dh(serial, peer_ke, DhContinuation::V1PhaseOne);
            return;
        }

        let Some(serial) = existing else { return };
        let (role, label) = {
            let st = self.table.get(serial).unwrap();
            (st.role, st.label)
        };
        match (role, label) {
            // message 2: everything plus HASH_R / SIG_R
            (SaRole::Initiator, StateLabel::AggrI1) => {
                let (Some(ke), Some(nonce), Some(id), Some(auth)) = (
                    find_ke(&msg.payloads),
                    find_nonce(&msg.payloads),
                    find_id(&msg.payloads),
                    find_v1_auth_bytes(&msg.payloads),
                ) else {
                    return;
                };
                if self.table.get(serial).unwrap().dh_task.is_some() {
                    return; // duplicate while keying
                }
                // the echoed auth method must be the one we proposed
                if let Some(sa) = find_sa(&msg.payloads) {
                    let mode = self
                        .conns
                        .get(self.table.get(serial).unwrap().connection)
                        .map(|c| c.v1_auth_method());
                    if select_v1_auth(sa) != mode {
                        tracing::warn!("responder switched the authentication method");
                        self.delete_state(serial, "auth method mismatch").await;
                        return;
                    }
                }
                self.delete_event(serial);
                if !self.table.index_spis(
                    serial,
                    SpiPair {
                        initiator: msg.initiator_spi,
                        responder: msg.responder_spi,
                    },
                ) {
                    self.delete_state(serial, "SPI collision").await;
                    return;
                }
                let peer_ke = ke.data.clone();
                {
                    let st = self.table.get_mut(serial).unwrap();
                    st.nonce_r = nonce.data.clone();
                    st.v1_peer_ke = peer_ke.clone();
                    st.v1_peer_id = id_body(id);
                    st.v1_pending_auth = auth.clone();
                }
                self.submit_dh(serial, peer_ke, DhContinuation::V1PhaseOne);
            }

            // message 3: initiator's HASH_I / SIG_I
            (SaRole::Responder, StateLabel::AggrR1) => {
                let peer_id = self.table.get(serial).unwrap().v1_peer_id.clone();
                if !self.v1_verify_peer_auth(serial, &peer_id, &msg.payloads, true) {
                    tracing::warn!("aggressive mode authentication failed for {}", from);
                    self.v1_send_notify(serial, NotifyType::AuthenticationFailed).await;
                    self.delete_state(serial, "phase 1 authentication failed").await;
                    return;
                }
                let conn_id = self.table.get(serial).unwrap().connection;
                {
                    let st = self.table.get_mut(serial).unwrap();
                    st.label = StateLabel::AggrR2;
                }
                if let Some(conn) = self.conns.get_mut(conn_id) {
                    conn.newest_isakmp_sa = serial;
                }
                self.schedule_sa_lifetimes(serial).await;
                tracing::info!("IKEv1 ISAKMP SA established (aggressive responder) {}", serial);
            }

            _ => {}
        }
    }

    // ================= phase 1 keying =================

    /// DH done for phase 1: run the SKEYID ladder, then continue the
    /// exchange wherever it was parked.
    pub(crate) async fn continue_v1_phase_one(&mut self, serial: SerialNumber) {
        let (role, label, conn_id) = {
            let Some(st) = self.table.get(serial) else {
                return;
            };
            (st.role, st.label, st.connection)
        };
        let psk = self.conns.get(conn_id).and_then(|c| c.psk.clone());
        {
            let st = self.table.get_mut(serial).expect("checked above");
            let suite = st.suite.expect("phase 1 has a suite");
            let shared = st.shared_secret.as_ref().expect("completion installed it");
            let keymat = v1_keymat(
                suite.prf,
                match &psk {
                    Some(p) => V1Auth::PreSharedKey(p),
                    None => V1Auth::Signature,
                },
                shared,
                &st.nonce_i,
                &st.nonce_r,
                &st.spis.initiator.to_be_bytes(),
                &st.spis.responder.to_be_bytes(),
            );
            st.v1_keymat = Some(keymat);
        }

        match (role, label) {
            // main mode responder: reply with our KE and Nr
            (SaRole::Responder, StateLabel::MainR1) => {
                let (spis, payloads) = {
                    let st = self.table.get(serial).unwrap();
                    let dh_public = st
                        .dh_secret
                        .as_ref()
                        .map(|d| d.public_value().to_vec())
                        .unwrap_or_default();
                    (
                        st.spis,
                        vec![
                            Payload::KeyExchange(KePayload {
                                dh_group: 0,
                                data: dh_public,
                            }),
                            Payload::Nonce(NoncePayload {
                                data: st.nonce_r.clone(),
                            }),
                        ],
                    )
                };
                let out = self.v1_msg(spis, ExchangeType::IdProt, 0, payloads);
                self.table.get_mut(serial).unwrap().label = StateLabel::MainR2;
                self.send_reply(serial, out.to_bytes()).await;
            }

            // main mode initiator: send IDi and HASH_I / SIG_I
            (SaRole::Initiator, StateLabel::MainI2) => {
                let id_i = self.id_payload_for(conn_id);
                let Some(auth_i) = self.v1_own_auth_payload(serial, &id_body(&id_i), true)
                else {
                    return;
                };
                let spis = self.table.get(serial).unwrap().spis;
                let out = self.v1_msg(
                    spis,
                    ExchangeType::IdProt,
                    0,
                    vec![Payload::IdInitiator(id_i), auth_i],
                );
                self.table.get_mut(serial).unwrap().label = StateLabel::MainI3;
                self.send_request(serial, out.to_bytes()).await;
            }

            // aggressive responder: the big reply with HASH_R / SIG_R
            (SaRole::Responder, StateLabel::AggrR1) => {
                let id_r = self.id_payload_for(conn_id);
                let Some(auth_r) = self.v1_own_auth_payload(serial, &id_body(&id_r), false)
                else {
                    return;
                };
                let auth_mode = match self.conns.get(conn_id) {
                    Some(conn) => conn.v1_auth_method(),
                    None => return,
                };
                let (spis, suite, dh_public, nr) = {
                    let st = self.table.get(serial).unwrap();
                    (
                        st.spis,
                        st.suite.unwrap(),
                        st.dh_secret
                            .as_ref()
                            .map(|d| d.public_value().to_vec())
                            .unwrap_or_default(),
                        st.nonce_r.clone(),
                    )
                };
                let out = self.v1_msg(
                    spis,
                    ExchangeType::Aggressive,
                    0,
                    vec![
                        Payload::Sa(v1_ike_proposal(&suite, auth_mode)),
                        Payload::KeyExchange(KePayload {
                            dh_group: 0,
                            data: dh_public,
                        }),
                        Payload::Nonce(NoncePayload { data: nr }),
                        Payload::IdResponder(id_r),
                        auth_r,
                    ],
                );
                self.send_reply(serial, out.to_bytes()).await;
            }

            // aggressive initiator: verify the responder, answer with
            // our own HASH_I / SIG_I, done
            (SaRole::Initiator, StateLabel::AggrI1) => {
                let (peer_id, pending) = {
                    let st = self.table.get(serial).unwrap();
                    (st.v1_peer_id.clone(), st.v1_pending_auth.clone())
                };
                if !self.v1_verify_stashed_auth(serial, &peer_id, &pending, false) {
                    tracing::warn!("aggressive mode responder authentication failed");
                    self.delete_state(serial, "phase 1 authentication failed").await;
                    return;
                }
                let id_i = self.id_payload_for(conn_id);
                let Some(auth_i) = self.v1_own_auth_payload(serial, &id_body(&id_i), true)
                else {
                    return;
                };
                let spis = self.table.get(serial).unwrap().spis;
                let out = self.v1_msg(spis, ExchangeType::Aggressive, 0, vec![auth_i]);
                {
                    let st = self.table.get_mut(serial).unwrap();
                    st.label = StateLabel::AggrI2;
                }
                if let Some(conn) = self.conns.get_mut(conn_id) {
                    conn.newest_isakmp_sa = serial;
                    conn.failed_ikev2 = true;
                }
                self.send_reply(serial, out.to_bytes()).await;
                self.schedule_sa_lifetimes(serial).await;
                tracing::info!("IKEv1 ISAKMP SA established (aggressive initiator) {}", serial);
                self.initiate_v1_quick(serial).await;
            }

            _ => {
                tracing::debug!(
                    "phase 1 keying finished in unexpected state {} {:?}",
                    label.name(),
                    role
                );
            }
        }
    }

    /// Our own HASH_I (initiator true) or HASH_R over the stored
    /// exchange pieces.
    fn v1_own_phase1_hash(
        &self,
        serial: SerialNumber,
        id: &[u8],
        initiator: bool,
    ) -> Option<Vec<u8>> {
        let st = self.table.get(serial)?;
        let suite = st.suite?;
        let keymat = st.v1_keymat.as_ref()?;
        let our_ke = st
            .dh_secret
            .as_ref()
            .map(|d| d.public_value().to_vec())
            .unwrap_or_default();
        // our role decides which KE value is "ours" in the hash layout
        let we_are_initiator = st.role == SaRole::Initiator;
        let (ke_a, ke_b, cky_a, cky_b) = if initiator == we_are_initiator {
            if initiator {
                (&our_ke[..], &st.v1_peer_ke[..], st.spis.initiator, st.spis.responder)
            } else {
                (&our_ke[..], &st.v1_peer_ke[..], st.spis.responder, st.spis.initiator)
            }
        } else if initiator {
            (&st.v1_peer_ke[..], &our_ke[..], st.spis.initiator, st.spis.responder)
        } else {
            (&st.v1_peer_ke[..], &our_ke[..], st.spis.responder, st.spis.initiator)
        };
        Some(phase1_hash(
            suite.prf,
            &keymat.skeyid,
            ke_a,
            ke_b,
            cky_a,
            cky_b,
            &st.v1_sa_body,
            id,
        ))
    }

    /// Build our authenticator for the phase-1 hash: HASH in PSK mode,
    /// a SIG payload over the hash in signature mode.
    fn v1_own_auth_payload(
        &self,
        serial: SerialNumber,
        id: &[u8],
        initiator: bool,
    ) -> Option<Payload> {
        let hash = self.v1_own_phase1_hash(serial, id, initiator)?;
        let conn = self
            .table
            .get(serial)
            .and_then(|st| self.conns.get(st.connection))?;
        match conn.v1_auth_method() {
            V1AuthMethod::PreSharedKey => Some(Payload::Hash(hash)),
            V1AuthMethod::EcdsaSha256 => {
                let key = conn.sig_key.as_ref()?;
                match key.sign(&hash) {
                    Ok(sig) => Some(Payload::Signature(sig)),
                    Err(e) => {
                        tracing::error!("cannot sign phase 1 hash: {}", e);
                        None
                    }
                }
            }
            V1AuthMethod::Other(_) => None,
        }
    }

    /// Verify the peer's authenticator bytes under the connection's
    /// mode: a matching HASH for PSK, a valid signature over the hash
    /// against the pinned peer key otherwise. The mode decides which
    /// payload counts; a bare HASH never authenticates a signature
    /// connection.
    fn v1_verify_stashed_auth(
        &self,
        serial: SerialNumber,
        peer_id: &[u8],
        auth: &[u8],
        peer_is_initiator: bool,
    ) -> bool {
        let Some(expected) = self.v1_own_phase1_hash(serial, peer_id, peer_is_initiator) else {
            return false;
        };
        let Some(conn) = self
            .table
            .get(serial)
            .and_then(|st| self.conns.get(st.connection))
        else {
            return false;
        };
        match conn.v1_auth_method() {
            V1AuthMethod::PreSharedKey => constant_time_eq(&expected, auth),
            V1AuthMethod::EcdsaSha256 => match conn.spd[0].that.sig_pub_key.as_deref() {
                Some(peer_key) => verify_signature(peer_key, &expected, auth),
                None => false,
            },
            V1AuthMethod::Other(_) => false,
        }
    }

    /// Like `v1_verify_stashed_auth`, but picks the payload the mode
    /// requires out of the message.
    fn v1_verify_peer_auth(
        &self,
        serial: SerialNumber,
        peer_id: &[u8],
        payloads: &[Payload],
        peer_is_initiator: bool,
    ) -> bool {
        let Some(conn) = self
            .table
            .get(serial)
            .and_then(|st| self.conns.get(st.connection))
        else {
            return false;
        };
        let auth = match conn.v1_auth_method() {
            V1AuthMethod::PreSharedKey => find_hash(payloads),
            V1AuthMethod::EcdsaSha256 => find_signature(payloads),
            V1AuthMethod::Other(_) => None,
        };
        match auth {
            Some(auth) => {
                let auth = auth.clone();
                self.v1_verify_stashed_auth(serial, peer_id, &auth, peer_is_initiator)
            }
            None => false,
        }
    }

    async fn v1_send_notify(&mut self, serial: SerialNumber, notify: NotifyType) {
        let Some(st) = self.table.get(serial) else {
            return;
        };
        let out = self.v1_msg(
            st.spis,
            ExchangeType::InformationalV1,
            0,
            vec![Payload::Notify(NotifyPayload::error(notify))],
        );
        let (local, remote) = (st.local_addr, st.remote_addr);
        self.send_packet(local, remote, &out.to_bytes()).await;
    }

    // ================= quick mode =================

    /// Start quick mode under an established phase 1: HASH(1), SA, Ni,
    /// KE (PFS).
    pub(crate) async fn initiate_v1_quick(&mut self, parent: SerialNumber) {
        let Some(pst) = self.table.get(parent) else {
            return;
        };
        let conn_id = pst.connection;
        let (local_addr, remote_addr, spis) = (pst.local_addr, pst.remote_addr, pst.spis);
        let Some(suite) = pst.suite else { return };
        let Some(ska) = pst.v1_keymat.as_ref().map(|k| k.skeyid_a.clone()) else {
            return;
        };

        let (Ok(nonce), Ok(dh), Ok(msgid_raw)) = (
            random_nonce(NONCE_SIZE),
            DhSecret::generate(suite.dh),
            random_spi(),
        ) else {
            return;
        };
        let msgid = (msgid_raw as u32) | 1; // nonzero phase 2 message id
        let esp_spi = (msgid_raw >> 32) as u32 | 1;

        let child = self.table.create(
            SaKind::ChildSa,
            SaRole::Initiator,
            IkeVersion::V1,
            conn_id,
            local_addr,
            remote_addr,
            StateLabel::QuickI1,
        );
        {
            let st = self.table.get_mut(child).unwrap();
            st.parent = parent;
            st.spis = spis;
            st.msgid_out = msgid;
            st.esp_spi_local = esp_spi;
            st.nonce_i = nonce.clone();
            st.dh_secret = Some(dh);
        }

        let body = vec![
            Payload::Sa(esp_proposal(suite.encr, esp_spi)),
            Payload::Nonce(NoncePayload { data: nonce }),
            Payload::KeyExchange(KePayload {
                dh_group: 0,
                data: self
                    .table
                    .get(child)
                    .unwrap()
                    .dh_secret
                    .as_ref()
                    .unwrap()
                    .public_value()
                    .to_vec(),
            }),
        ];
        let hash = quick_hash(suite.prf, &ska, msgid, None, &chain_bytes(&body));
        let mut payloads = vec![Payload::Hash(hash)];
        payloads.extend(body);

        let out = self.v1_msg(spis, ExchangeType::QuickMode, msgid, payloads);
        self.send_request(child, out.to_bytes()).await;
    }

    async fn v1_quick(&mut self, msg: IkeMessage, _raw: Vec<u8>, from: SocketAddr) {
        let Some(parent) = self.v1_find_parent(&msg) else {
            return;
        };
        {
            let pst = self.table.get(parent).unwrap();
            if !pst.is_established() || pst.v1_keymat.is_none() {
                tracing::debug!("quick mode before phase 1 is complete; dropped");
                return;
            }
        }

        // an existing quick exchange with this message id?
        let child = self.table.children_of(parent).into_iter().find(|c| {
            self.table
                .get(*c)
                .map(|s| s.msgid_out == msg.message_id && !matches!(s.label, StateLabel::Deleting))
                .unwrap_or(false)
        });

        match child {
            None => self.v1_quick_new_responder(parent, msg, from).await,
            Some(child) => {
                let (role, label) = {
                    let st = self.table.get(child).unwrap();
                    (st.role, st.label)
                };
                match (role, label) {
                    (SaRole::Initiator, StateLabel::QuickI1) => {
                        self.v1_quick_reply_to_initiator(parent, child, msg).await
                    }
                    (SaRole::Responder, StateLabel::QuickR1) => {
                        self.v1_quick_hash3_to_responder(parent, child, msg).await
                    }
                    _ => {}
                }
            }
        }
    }

    async fn v1_quick_new_responder(
        &mut self,
        parent: SerialNumber,
        msg: IkeMessage,
        from: SocketAddr,
    ) {
        let (Some(hash), Some(sa), Some(nonce), Some(ke)) = (
            find_hash(&msg.payloads),
            find_sa(&msg.payloads),
            find_nonce(&msg.payloads),
            find_ke(&msg.payloads),
        ) else {
            return;
        };
        let (suite, ska, conn_id, local_addr, remote_addr, spis) = {
            let pst = self.table.get(parent).unwrap();
            (
                pst.suite.unwrap(),
                pst.v1_keymat.as_ref().unwrap().skeyid_a.clone(),
                pst.connection,
                pst.local_addr,
                pst.remote_addr,
                pst.spis,
            )
        };

        // verify HASH(1) over the message after the hash payload
        let rest: Vec<Payload> = msg
            .payloads
            .iter()
            .filter(|p| !matches!(p, Payload::Hash(_)))
            .cloned()
            .collect();
        let expected = quick_hash(suite.prf, &ska, msg.message_id, None, &chain_bytes(&rest));
        if !constant_time_eq(&expected, hash) {
            tracing::warn!("quick mode HASH(1) mismatch from {}", from);
            return;
        }

        let Some((encr, peer_spi)) = select_esp(sa) else {
            self.v1_send_notify(parent, NotifyType::NoProposalChosen).await;
            return;
        };

        let (Ok(nr), Ok(dh), Ok(spi_raw)) = (
            random_nonce(NONCE_SIZE),
            DhSecret::generate(suite.dh),
            random_spi(),
        ) else {
            return;
        };
        let esp_spi = (spi_raw as u32) | 1;

        let child = self.table.create(
            SaKind::ChildSa,
            SaRole::Responder,
            IkeVersion::V1,
            conn_id,
            local_addr,
            remote_addr,
            StateLabel::QuickR1,
        );
        let peer_ke = ke.data.clone();
        {
            let st = self.table.get_mut(child).unwrap();
            st.parent = parent;
            st.spis = spis;
            st.msgid_out = msg.message_id;
            st.esp_spi_local = esp_spi;
            st.esp_spi_remote = peer_spi;
            st.nonce_i = nonce.data.clone();
            st.nonce_r = nr;
            st.dh_secret = Some(dh);
            st.suite = Some(crate::crypto::cipher::CipherSuite { encr, ..suite });
        }
        self.submit_dh(child, peer_ke, DhContinuation::V1Quick);
    }

    async fn v1_quick_reply_to_initiator(
        &mut self,
        parent: SerialNumber,
        child: SerialNumber,
        msg: IkeMessage,
    ) {
        let (Some(hash), Some(sa), Some(nonce), Some(ke)) = (
            find_hash(&msg.payloads),
            find_sa(&msg.payloads),
            find_nonce(&msg.payloads),
            find_ke(&msg.payloads),
        ) else {
            return;
        };
        let (suite, ska) = {
            let pst = self.table.get(parent).unwrap();
            (
                pst.suite.unwrap(),
                pst.v1_keymat.as_ref().unwrap().skeyid_a.clone(),
            )
        };
        let ni = self.table.get(child).unwrap().nonce_i.clone();

        let rest: Vec<Payload> = msg
            .payloads
            .iter()
            .filter(|p| !matches!(p, Payload::Hash(_)))
            .cloned()
            .collect();
        let expected = quick_hash(
            suite.prf,
            &ska,
            msg.message_id,
            Some(&ni),
            &chain_bytes(&rest),
        );
        if !constant_time_eq(&expected, hash) {
            tracing::warn!("quick mode HASH(2) mismatch");
            return;
        }

        let Some((encr, peer_spi)) = select_esp(sa) else {
            return;
        };
        if self.table.get(child).unwrap().dh_task.is_some() {
            return; // duplicate reply while keying
        }
        self.delete_event(child);
        let peer_ke = ke.data.clone();
        {
            let st = self.table.get_mut(child).unwrap();
            st.nonce_r = nonce.data.clone();
            st.esp_spi_remote = peer_spi;
            st.suite = Some(crate::crypto::cipher::CipherSuite { encr, ..suite });
        }
        self.submit_dh(child, peer_ke, DhContinuation::V1Quick);
    }

    async fn v1_quick_hash3_to_responder(
        &mut self,
        parent: SerialNumber,
        child: SerialNumber,
        msg: IkeMessage,
    ) {
        let Some(hash) = find_hash(&msg.payloads) else {
            return;
        };
        let (suite, ska) = {
            let pst = self.table.get(parent).unwrap();
            (
                pst.suite.unwrap(),
                pst.v1_keymat.as_ref().unwrap().skeyid_a.clone(),
            )
        };
        let (ni, nr) = {
            let st = self.table.get(child).unwrap();
            (st.nonce_i.clone(), st.nonce_r.clone())
        };
        let expected = quick_hash3(suite.prf, &ska, msg.message_id, &ni, &nr);
        if !constant_time_eq(&expected, hash) {
            tracing::warn!("quick mode HASH(3) mismatch");
            return;
        }
        self.v1_install_child(parent, child).await;
        let conn_id = self.table.get(child).map(|s| s.connection);
        if let Some(st) = self.table.get_mut(child) {
            st.label = StateLabel::QuickR2;
        }
        if let Some(conn_id) = conn_id {
            if let Some(conn) = self.conns.get_mut(conn_id) {
                conn.newest_ipsec_sa = child;
            }
        }
        self.schedule_sa_lifetimes(child).await;
        tracing::info!("IKEv1 IPsec SA established (responder) {}", child);
    }

    /// PFS DH done for quick mode: derive the keymat and either reply
    /// (responder) or close the exchange with HASH(3) (initiator).
    pub(crate) async fn continue_v1_quick(&mut self, child: SerialNumber) {
        let (role, parent) = {
            let Some(st) = self.table.get(child) else {
                return;
            };
            (st.role, st.parent)
        };
        let Some(pst) = self.table.get(parent) else {
            self.delete_state(child, "parent vanished").await;
            return;
        };
        let suite = pst.suite.unwrap();
        let ska = pst.v1_keymat.as_ref().unwrap().skeyid_a.clone();

        match role {
            SaRole::Responder => {
                let (spis, msgid, esp_spi, nr, dh_public, ni) = {
                    let st = self.table.get(child).unwrap();
                    (
                        st.spis,
                        st.msgid_out,
                        st.esp_spi_local,
                        st.nonce_r.clone(),
                        st.dh_secret
                            .as_ref()
                            .map(|d| d.public_value().to_vec())
                            .unwrap_or_default(),
                        st.nonce_i.clone(),
                    )
                };
                let encr = self.table.get(child).unwrap().suite.unwrap().encr;
                let body = vec![
                    Payload::Sa(esp_proposal(encr, esp_spi)),
                    Payload::Nonce(NoncePayload { data: nr }),
                    Payload::KeyExchange(KePayload {
                        dh_group: 0,
                        data: dh_public,
                    }),
                ];
                let hash = quick_hash(suite.prf, &ska, msgid, Some(&ni), &chain_bytes(&body));
                let mut payloads = vec![Payload::Hash(hash)];
                payloads.extend(body);
                let out = self.v1_msg(spis, ExchangeType::QuickMode, msgid, payloads);
                self.send_reply(child, out.to_bytes()).await;
            }
            SaRole::Initiator => {
                let (spis, msgid, ni, nr) = {
                    let st = self.table.get(child).unwrap();
                    (st.spis, st.msgid_out, st.nonce_i.clone(), st.nonce_r.clone())
                };
                self.v1_install_child(parent, child).await;
                let hash3 = quick_hash3(suite.prf, &ska, msgid, &ni, &nr);
                let out = self.v1_msg(
                    spis,
                    ExchangeType::QuickMode,
                    msgid,
                    vec![Payload::Hash(hash3)],
                );
                let conn_id = self.table.get(child).map(|s| s.connection);
                if let Some(st) = self.table.get_mut(child) {
                    st.label = StateLabel::QuickI2;
                }
                if let Some(conn_id) = conn_id {
                    if let Some(conn) = self.conns.get_mut(conn_id) {
                        conn.newest_ipsec_sa = child;
                    }
                }
                self.send_reply(child, out.to_bytes()).await;
                self.schedule_sa_lifetimes(child).await;
                if let Some(pst) = self.table.get_mut(parent) {
                    pst.release_whack("IPsec SA established");
                }
                tracing::info!("IKEv1 IPsec SA established (initiator) {}", child);
            }
        }
    }

    /// Quick-mode KEYMAT per direction, then both kernel installs. The
    /// PFS shared secret comes from the child's own DH.
    async fn v1_install_child(&mut self, parent: SerialNumber, child: SerialNumber) {
        use crate::kernel::{SaId, SaInstall, SaProto};

        let (prf, skeyid_d) = {
            let Some(pst) = self.table.get(parent) else {
                return;
            };
            (
                pst.suite.unwrap().prf,
                pst.v1_keymat.as_ref().unwrap().skeyid_d.clone(),
            )
        };
        // keys are per-SPI in v1; direction falls out of the SPI
        let (encr, g_xy, ni, nr, spi_in, spi_out, local_ip, remote_ip, conn_id) = {
            let Some(st) = self.table.get(child) else {
                return;
            };
            (
                st.suite.map(|s| s.encr).unwrap_or(EncrAlgorithm::Aes256Gcm),
                st.shared_secret.clone(),
                st.nonce_i.clone(),
                st.nonce_r.clone(),
                st.esp_spi_local,
                st.esp_spi_remote,
                st.local_addr.ip(),
                st.remote_addr.ip(),
                st.connection,
            )
        };

        let key_len = encr.key_len();
        let key_in = v1_child_keymat(
            prf,
            &skeyid_d,
            g_xy.as_ref(),
            3, // ESP
            spi_in,
            &ni,
            &nr,
            key_len,
        );
        let key_out = v1_child_keymat(prf, &skeyid_d, g_xy.as_ref(), 3, spi_out, &ni, &nr, key_len);

        let (ts_this, ts_that) = {
            let conn = self.conns.get(conn_id);
            let route = conn.map(|c| &c.spd[0]);
            match route {
                Some(r) => (
                    crate::ike::ts::end_to_ts(&r.this),
                    crate::ike::ts::end_to_ts(&r.that),
                ),
                None => return,
            }
        };
        {
            let st = self.table.get_mut(child).unwrap();
            st.ts_this = Some(ts_this);
            st.ts_that = Some(ts_that);
        }

        let lifetime = self
            .conns
            .get(conn_id)
            .map(|c| c.sa_lifetime)
            .unwrap_or(std::time::Duration::from_secs(3600));
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
        if let Err(e) = self.kernel.install_sa(inbound).await {
            tracing::error!("kernel rejected inbound v1 child SA: {}", e);
        }
        if let Err(e) = self.kernel.install_sa(outbound).await {
            tracing::error!("kernel rejected outbound v1 child SA: {}", e);
        }
    }

    // ================= informationals / DPD =================

    async fn v1_informational(&mut self, msg: IkeMessage) {
        let Some(serial) = self.v1_find_parent(&msg) else {
            return;
        };
        for p in &msg.payloads {
            match p {
                Payload::Notify(n) => match n.notify_type {
                    NotifyType::Unknown(DPD_R_U_THERE) => {
                        tracing::debug!("DPD R_U_THERE from peer on {}", serial);
                        self.v1_send_dpd(serial, DPD_R_U_THERE_ACK, &n.data.clone()).await;
                    }
                    NotifyType::Unknown(DPD_R_U_THERE_ACK) => {
                        tracing::debug!("DPD R_U_THERE_ACK on {}", serial);
                        if let Some(st) = self.table.get_mut(serial) {
                            st.pending_liveness = false;
                            st.last_liveness = None;
                        }
                    }
                    other => {
                        tracing::debug!("informational notify {:?} on {}", other, serial);
                    }
                },
                Payload::Delete(d) => {
                    if d.protocol_id == 1 {
                        self.delete_state(serial, "peer sent DELETE").await;
                        return;
                    }
                    for spi in &d.spis {
                        if spi.len() == 4 {
                            let spi = u32::from_be_bytes([spi[0], spi[1], spi[2], spi[3]]);
                            let victim = self.table.children_of(serial).into_iter().find(|c| {
                                self.table
                                    .get(*c)
                                    .map(|s| s.esp_spi_remote == spi)
                                    .unwrap_or(false)
                            });
                            if let Some(victim) = victim {
                                self.delete_state(victim, "peer sent DELETE").await;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    async fn v1_send_dpd(&mut self, serial: SerialNumber, notify_type: u16, seq: &[u8]) {
        let Some(st) = self.table.get(serial) else {
            return;
        };
        let mut spi = Vec::with_capacity(16);
        spi.extend_from_slice(&st.spis.initiator.to_be_bytes());
        spi.extend_from_slice(&st.spis.responder.to_be_bytes());
        let out = self.v1_msg(
            st.spis,
            ExchangeType::InformationalV1,
            0,
            vec![Payload::Notify(NotifyPayload {
                protocol_id: 1,
                spi,
                notify_type: NotifyType::Unknown(notify_type),
                data: seq.to_vec(),
            })],
        );
        let (local, remote) = (st.local_addr, st.remote_addr);
        self.send_packet(local, remote, &out.to_bytes()).await;
    }

    /// RFC 3706 R_U_THERE probe with a monotonically increasing
    /// sequence number.
    pub(crate) async fn send_v1_dpd_probe(&mut self, serial: SerialNumber) -> bool {
        let seq = {
            let Some(st) = self.table.get_mut(serial) else {
                return false;
            };
            if st.v1_keymat.is_none() {
                return false;
            }
            st.dpd_seqno = st.dpd_seqno.wrapping_add(1);
            st.dpd_seqno
        };
        self.v1_send_dpd(serial, DPD_R_U_THERE, &seq.to_be_bytes()).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase1_hash_is_order_sensitive() {
        let skeyid = SymKey::new(vec![9u8; 32]);
        let hi = phase1_hash(
            PrfAlgorithm::HmacSha256,
            &skeyid,
            b"ke-i",
            b"ke-r",
            1,
            2,
            b"sa-body",
            b"id-i",
        );
        let hr = phase1_hash(
            PrfAlgorithm::HmacSha256,
            &skeyid,
            b"ke-r",
            b"ke-i",
            2,
            1,
            b"sa-body",
            b"id-r",
        );
        assert_ne!(hi, hr);
        // deterministic
        let hi2 = phase1_hash(
            PrfAlgorithm::HmacSha256,
            &skeyid,
            b"ke-i",
            b"ke-r",
            1,
            2,
            b"sa-body",
            b"id-i",
        );
        assert_eq!(hi, hi2);
    }

    #[test]
    fn quick_hashes_follow_the_rfc_layout() {
        let ska = SymKey::new(vec![7u8; 32]);
        let prf = PrfAlgorithm::HmacSha1;

        let h1 = quick_hash(prf, &ska, 0x1234, None, b"rest");
        let mut seed = 0x1234u32.to_be_bytes().to_vec();
        seed.extend_from_slice(b"rest");
        assert_eq!(h1, prf.prf(ska.as_bytes(), &seed).as_bytes());

        let h3 = quick_hash3(prf, &ska, 0x1234, b"ni", b"nr");
        let mut seed = vec![0u8];
        seed.extend_from_slice(&0x1234u32.to_be_bytes());
        seed.extend_from_slice(b"ni");
        seed.extend_from_slice(b"nr");
        assert_eq!(h3, prf.prf(ska.as_bytes(), &seed).as_bytes());
    }

    #[test]
    fn child_keymat_differs_per_spi_and_stretches() {
        let skeyid_d = SymKey::new(vec![3u8; 20]);
        let prf = PrfAlgorithm::HmacSha1; // 20-byte output forces stretching
        let a = v1_child_keymat(prf, &skeyid_d, None, 3, 0x1111, b"ni", b"nr", 32);
        let b = v1_child_keymat(prf, &skeyid_d, None, 3, 0x2222, b"ni", b"nr", 32);
        assert_eq!(a.len(), 32);
        assert_ne!(a.as_bytes(), b.as_bytes());

        // first block is prf(skeyid_d, proto|spi|ni|nr)
        let mut base = vec![3u8];
        base.extend_from_slice(&0x1111u32.to_be_bytes());
        base.extend_from_slice(b"ni");
        base.extend_from_slice(b"nr");
        let k1 = prf.prf(skeyid_d.as_bytes(), &base);
        assert_eq!(&a.as_bytes()[..20], k1.as_bytes());
    }

    #[test]
    fn child_keymat_mixes_pfs_secret() {
        let skeyid_d = SymKey::new(vec![3u8; 20]);
        let g = SymKey::new(vec![8u8; 32]);
        let prf = PrfAlgorithm::HmacSha256;
        let without = v1_child_keymat(prf, &skeyid_d, None, 3, 1, b"ni", b"nr", 32);
        let with = v1_child_keymat(prf, &skeyid_d, Some(&g), 3, 1, b"ni", b"nr", 32);
        assert_ne!(without.as_bytes(), with.as_bytes());
    }
}
