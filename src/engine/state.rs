//! Per-exchange SA state. Everything here is owned by the event loop;
//! other components refer to states by serial number only.

use std::net::SocketAddr;
use std::time::Instant;

use crate::config::conn::ConnId;
use crate::crypto::cipher::CipherSuite;
use crate::crypto::dh::DhSecret;
use crate::crypto::prf::{SkKeys, V1Keymat};
use crate::crypto::task::{DhTask, TaskId};
use crate::crypto::SymKey;
use crate::engine::timer::{EventKind, TimerKey};
use crate::ike::ts::TrafficSelector;
use crate::ike::IkeVersion;

/// Serial number of a state object: the safe handle used everywhere a C
/// daemon would carry a pointer. Monotonic and unique for the process
/// lifetime; zero means "no state".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(pub u64);

impl SerialNumber {
    pub const NOBODY: SerialNumber = SerialNumber(0);
    pub const FIRST: SerialNumber = SerialNumber(1);

    pub fn is_nobody(self) -> bool {
        self == SerialNumber::NOBODY
    }
}

impl std::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaKind {
    IkeSa,
    ChildSa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaRole {
    Initiator,
    Responder,
}

/// The finite state labels of both exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum StateLabel {
    // IKEv1 main mode
    MainI1,
    MainI2,
    MainI3,
    MainI4,
    MainR1,
    MainR2,
    MainR3,
    // IKEv1 aggressive mode
    AggrI1,
    AggrI2,
    AggrR1,
    AggrR2,
    // IKEv1 quick mode
    QuickI1,
    QuickI2,
    QuickR1,
    QuickR2,
    // IKEv2 parent SA
    ParentI1,
    ParentI2,
    ParentR1,
    ParentR2,
    /// IKEv2 parent established on the initiator after the AUTH
    /// response is in.
    V2Established,
    // IKEv2 child SA
    V2IpsecI,
    V2IpsecR,
    /// Terminal; deletion in progress.
    Deleting,
}

impl StateLabel {
    pub fn is_established(self) -> bool {
        matches!(
            self,
            StateLabel::MainI4
                | StateLabel::MainR3
                | StateLabel::AggrI2
                | StateLabel::AggrR2
                | StateLabel::QuickI2
                | StateLabel::QuickR2
                | StateLabel::ParentR2
                | StateLabel::V2Established
                | StateLabel::V2IpsecI
                | StateLabel::V2IpsecR
        )
    }

    /// States in which a responder must not retransmit its reply, to
    /// avoid being used as an amplifier.
    pub fn suppress_retransmit(self) -> bool {
        matches!(self, StateLabel::MainR1 | StateLabel::AggrR1)
    }

    pub fn name(self) -> &'static str {
        match self {
            StateLabel::MainI1 => "MAIN_I1",
            StateLabel::MainI2 => "MAIN_I2",
            StateLabel::MainI3 => "MAIN_I3",
            StateLabel::MainI4 => "MAIN_I4",
            StateLabel::MainR1 => "MAIN_R1",
            StateLabel::MainR2 => "MAIN_R2",
            StateLabel::MainR3 => "MAIN_R3",
            StateLabel::AggrI1 => "AGGR_I1",
            StateLabel::AggrI2 => "AGGR_I2",
            StateLabel::AggrR1 => "AGGR_R1",
            StateLabel::AggrR2 => "AGGR_R2",
            StateLabel::QuickI1 => "QUICK_I1",
            StateLabel::QuickI2 => "QUICK_I2",
            StateLabel::QuickR1 => "QUICK_R1",
            StateLabel::QuickR2 => "QUICK_R2",
            StateLabel::ParentI1 => "PARENT_I1",
            StateLabel::ParentI2 => "PARENT_I2",
            StateLabel::ParentR1 => "PARENT_R1",
            StateLabel::ParentR2 => "PARENT_R2",
            StateLabel::V2Established => "V2_ESTABLISHED",
            StateLabel::V2IpsecI => "V2_IPSEC_I",
            StateLabel::V2IpsecR => "V2_IPSEC_R",
            StateLabel::Deleting => "DELETING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpiPair {
    pub initiator: u64,
    pub responder: u64,
}

/// Operator status channel held open for synchronous feedback. The
/// exchange that owns it sends progress lines and releases it with a
/// final message on establishment or give-up.
#[derive(Debug, Clone)]
pub struct WhackHandle {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl WhackHandle {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<String>) -> Self {
        WhackHandle { tx }
    }

    pub fn notify(&self, msg: &str) {
        let _ = self.tx.send(msg.to_string());
    }

    pub fn release(self, msg: &str) {
        let _ = self.tx.send(msg.to_string());
        // sender drops here; the operator side sees the channel close
    }
}

/// Scheduled-event bookkeeping: at most one timer per slot. The general
/// slot carries retransmit, replace/expire and crypto-timeout events;
/// liveness, DPD and release-whack get their own slots.
#[derive(Debug, Default)]
pub struct EventSlots {
    pub event: Option<(EventKind, TimerKey)>,
    pub liveness: Option<TimerKey>,
    pub dpd: Option<TimerKey>,
    pub release_whack: Option<TimerKey>,
}

impl EventSlots {
    pub fn drain(&mut self) -> Vec<TimerKey> {
        let mut keys = Vec::new();
        if let Some((_, k)) = self.event.take() {
            keys.push(k);
        }
        if let Some(k) = self.liveness.take() {
            keys.push(k);
        }
        if let Some(k) = self.dpd.take() {
            keys.push(k);
        }
        if let Some(k) = self.release_whack.take() {
            keys.push(k);
        }
        keys
    }
}

pub struct SaState {
    pub serial: SerialNumber,
    pub kind: SaKind,
    /// Parent IKE SA of a child; NOBODY for a parent.
    pub parent: SerialNumber,
    pub version: IkeVersion,
    pub role: SaRole,
    /// Frozen at SA birth; `role` flips on rekey, this does not.
    pub original_role: SaRole,
    pub label: StateLabel,
    pub connection: ConnId,

    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub spis: SpiPair,
    /// Next outgoing request message id (IKEv2).
    pub msgid_out: u32,

    pub try_count: u32,
    pub retransmit_count: u32,
    pub events: EventSlots,

    /// Exclusive ownership of the DH private/public pair; logically
    /// transferred to an in-flight crypto task and back.
    pub dh_secret: Option<DhSecret>,
    /// Derived DH shared secret once computed.
    pub shared_secret: Option<SymKey>,
    /// Serial of the in-flight DH task, for stale-completion rejection.
    pub dh_task: Option<TaskId>,

    pub suite: Option<CipherSuite>,
    pub sk: Option<SkKeys>,
    pub v1_keymat: Option<V1Keymat>,
    /// IKEv1: the peer's phase-1 KE value, kept for the HASH_I/HASH_R
    /// computation.
    pub v1_peer_ke: Vec<u8>,
    /// IKEv1: the initiator's SA payload body, hashed into HASH_I/R.
    pub v1_sa_body: Vec<u8>,
    /// IKEv1 aggressive mode: the responder's HASH_R or SIG_R bytes
    /// until the ladder is ready to verify them.
    pub v1_pending_auth: Vec<u8>,
    /// IKEv1: the peer's ID payload body, hashed into HASH_I/R.
    pub v1_peer_id: Vec<u8>,
    /// IKEv1 DPD sequence number.
    pub dpd_seqno: u32,
    pub nonce_i: Vec<u8>,
    pub nonce_r: Vec<u8>,

    pub ts_this: Option<TrafficSelector>,
    pub ts_that: Option<TrafficSelector>,
    /// Verbatim first exchange bytes, ours and the peer's, kept for the
    /// AUTH computation.
    pub first_packet_me: Vec<u8>,
    pub first_packet_him: Vec<u8>,

    /// Last transmitted message, for retransmission.
    pub tpacket: Option<Vec<u8>>,

    pub pending_liveness: bool,
    pub last_liveness: Option<Instant>,
    pub outbound_time: Option<Instant>,

    /// Child SA SPIs (ESP), ours and the peer's.
    pub esp_spi_local: u32,
    pub esp_spi_remote: u32,

    pub behind_nat: bool,
    pub whack: Option<WhackHandle>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl SaState {
    pub fn new(
        serial: SerialNumber,
        kind: SaKind,
        role: SaRole,
        version: IkeVersion,
        connection: ConnId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        label: StateLabel,
    ) -> Self {
        SaState {
            serial,
            kind,
            parent: SerialNumber::NOBODY,
            version,
            role,
            original_role: role,
            label,
            connection,
            local_addr,
            remote_addr,
            spis: SpiPair::default(),
            msgid_out: 0,
            try_count: 0,
            retransmit_count: 0,
            events: EventSlots::default(),
            dh_secret: None,
            shared_secret: None,
            dh_task: None,
            suite: None,
            sk: None,
            v1_keymat: None,
            v1_peer_ke: Vec::new(),
            v1_sa_body: Vec::new(),
            v1_pending_auth: Vec::new(),
            v1_peer_id: Vec::new(),
            dpd_seqno: 0,
            nonce_i: Vec::new(),
            nonce_r: Vec::new(),
            ts_this: None,
            ts_that: None,
            first_packet_me: Vec::new(),
            first_packet_him: Vec::new(),
            tpacket: None,
            pending_liveness: false,
            last_liveness: None,
            outbound_time: None,
            esp_spi_local: 0,
            esp_spi_remote: 0,
            behind_nat: false,
            whack: None,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn is_ike_sa(&self) -> bool {
        self.kind == SaKind::IkeSa
    }

    pub fn is_child_sa(&self) -> bool {
        self.kind == SaKind::ChildSa
    }

    pub fn is_established(&self) -> bool {
        self.label.is_established()
    }

    /// Move the DH secret into a task at submit time. Single-assignment
    /// transfer: the source is nulled before the destination is written.
    /// Double ownership is a fatal bug.
    pub fn transfer_dh_to_task(&mut self, task: &mut DhTask) {
        assert!(
            task.local_secret.is_none(),
            "{}: task already owns a DH secret",
            self.serial
        );
        let secret = self
            .dh_secret
            .take()
            .unwrap_or_else(|| panic!("{}: no DH secret to transfer", self.serial));
        task.local_secret = Some(secret);
        self.dh_task = Some(task.task_id);
    }

    /// Move the DH secret back from a completed task.
    pub fn transfer_dh_from_task(&mut self, task: &mut DhTask) {
        assert!(
            self.dh_secret.is_none(),
            "{}: state already owns a DH secret",
            self.serial
        );
        let secret = task
            .local_secret
            .take()
            .unwrap_or_else(|| panic!("{}: completed task has no DH secret", self.serial));
        self.dh_secret = Some(secret);
        self.dh_task = None;
    }

    /// Install the computed shared secret; the slot must be empty.
    pub fn set_shared_secret(&mut self, shared: SymKey) {
        assert!(
            self.shared_secret.is_none(),
            "{}: shared secret already present",
            self.serial
        );
        self.shared_secret = Some(shared);
    }

    pub fn release_whack(&mut self, msg: &str) {
        if let Some(whack) = self.whack.take() {
            whack.release(msg);
        }
    }
}

impl std::fmt::Debug for SaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaState")
            .field("serial", &self.serial)
            .field("kind", &self.kind)
            .field("label", &self.label.name())
            .field("role", &self.role)
            .field("connection", &self.connection)
            .field("remote", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::dh::{DhGroup, DhSecret};
    use crate::crypto::task::DhContinuation;

    fn state() -> SaState {
        SaState::new(
            SerialNumber(1),
            SaKind::IkeSa,
            SaRole::Initiator,
            IkeVersion::V2,
            ConnId(0),
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
            StateLabel::ParentI1,
        )
    }

    fn task() -> DhTask {
        DhTask {
            task_id: 9,
            serial: SerialNumber(1),
            remote_ke: vec![0; 32],
            local_secret: None,
            shared_secret: None,
            continuation: DhContinuation::V2SaInitInitiator,
        }
    }

    #[test]
    fn dh_transfer_round_trip() {
        let mut st = state();
        st.dh_secret = Some(DhSecret::generate(DhGroup::Curve25519).unwrap());
        let mut t = task();

        st.transfer_dh_to_task(&mut t);
        assert!(st.dh_secret.is_none(), "source nulled after submit");
        assert!(t.local_secret.is_some());
        assert_eq!(st.dh_task, Some(9));

        st.transfer_dh_from_task(&mut t);
        assert!(st.dh_secret.is_some());
        assert!(t.local_secret.is_none());
        assert!(st.dh_task.is_none());
    }

    #[test]
    #[should_panic(expected = "no DH secret to transfer")]
    fn transfer_without_secret_is_fatal() {
        let mut st = state();
        let mut t = task();
        st.transfer_dh_to_task(&mut t);
    }

    #[test]
    #[should_panic(expected = "already owns a DH secret")]
    fn double_transfer_is_fatal() {
        let mut st = state();
        st.dh_secret = Some(DhSecret::generate(DhGroup::Curve25519).unwrap());
        let mut t = task();
        t.local_secret = Some(DhSecret::generate(DhGroup::Curve25519).unwrap());
        st.transfer_dh_to_task(&mut t);
    }

    #[test]
    #[should_panic(expected = "shared secret already present")]
    fn shared_secret_slot_is_single_assignment() {
        let mut st = state();
        st.set_shared_secret(SymKey::new(vec![1; 32]));
        st.set_shared_secret(SymKey::new(vec![2; 32]));
    }

    #[test]
    fn established_labels() {
        assert!(StateLabel::MainI4.is_established());
        assert!(StateLabel::V2IpsecR.is_established());
        assert!(StateLabel::ParentR2.is_established());
        assert!(!StateLabel::ParentI1.is_established());
        assert!(!StateLabel::QuickI1.is_established());
        assert!(StateLabel::MainR1.suppress_retransmit());
        assert!(!StateLabel::ParentI1.suppress_retransmit());
    }
}
