//! The event loop. One task owns every piece of protocol state and
//! multiplexes UDP reads on the IKE ports, the timer wheel, and the
//! crypto completion inbox. Handlers run to completion and never block;
//! anything slow goes through the crypto pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::conn::{ConnId, ConnectionStore, Policy};
use crate::config::IronswanConfig;
use crate::crypto::task::{CryptoPool, DhContinuation, DhTask, TaskId};
use crate::engine::state::{SaKind, SerialNumber, WhackHandle};
use crate::engine::timer::{EventKind, TimerEvent, TimerQueue};
use crate::ike::{IkeMessage, IkeVersion, NON_ESP_MARKER};
use crate::kernel::{KernelInterface, SaId, SaProto};

pub mod liveness;
pub mod retransmit;
pub mod state;
pub mod table;
pub mod timer;

use table::StateTable;

/// Minimum spacing of liveness probes, whatever dpd-delay says.
pub const MIN_LIVENESS: Duration = Duration::from_secs(1);

/// Fuse on in-flight crypto tasks.
const CRYPTO_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Engine {
    pub(crate) conns: ConnectionStore,
    pub(crate) table: StateTable,
    pub(crate) timers: TimerQueue,
    pub(crate) kernel: Arc<dyn KernelInterface>,
    pool: CryptoPool,
    completions: mpsc::UnboundedReceiver<DhTask>,

    sock_ike: Option<Arc<UdpSocket>>,
    sock_natt: Option<Arc<UdpSocket>>,

    listen_addr: std::net::IpAddr,
    pub(crate) ike_port: u16,
    pub(crate) natt_port: u16,
    pub(crate) interface_device: String,
    pub(crate) impair_retransmits: bool,
    shunt_scan_interval: Duration,
    nat_keepalive_interval: Duration,

    next_task_id: TaskId,
}

impl Engine {
    pub fn new(
        config: &IronswanConfig,
        conns: ConnectionStore,
        kernel: Arc<dyn KernelInterface>,
    ) -> Self {
        let workers = if config.daemon.crypto_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        } else {
            config.daemon.crypto_workers
        };
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let pool = CryptoPool::spawn(workers, done_tx);

        Engine {
            conns,
            table: StateTable::new(),
            timers: TimerQueue::new(),
            kernel,
            pool,
            completions: done_rx,
            sock_ike: None,
            sock_natt: None,
            listen_addr: config.daemon.listen_addr(),
            ike_port: config.daemon.ike_port,
            natt_port: config.daemon.natt_port,
            interface_device: config.daemon.interface_device.clone(),
            impair_retransmits: config.daemon.impair_retransmits,
            shunt_scan_interval: Duration::from_secs(config.daemon.shunt_scan_interval_s),
            nat_keepalive_interval: Duration::from_secs(config.daemon.nat_keepalive_s),
            next_task_id: 1,
        }
    }

    /// Bind the IKE sockets and run until the process is told to stop.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let ike = UdpSocket::bind((self.listen_addr, self.ike_port)).await?;
        let natt = UdpSocket::bind((self.listen_addr, self.natt_port)).await?;
        tracing::info!(
            "listening for IKE on {}:{} and {}:{}",
            self.listen_addr,
            self.ike_port,
            self.listen_addr,
            self.natt_port
        );
        let ike = Arc::new(ike);
        let natt = Arc::new(natt);
        self.sock_ike = Some(Arc::clone(&ike));
        self.sock_natt = Some(Arc::clone(&natt));

        // standing global timers
        self.timers.schedule(
            EventKind::ShuntScan,
            SerialNumber::NOBODY,
            self.shunt_scan_interval,
        );
        self.timers.schedule(
            EventKind::NatKeepalive,
            SerialNumber::NOBODY,
            self.nat_keepalive_interval,
        );

        // bring up connections marked for automatic start
        let auto: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.policy.contains(Policy::UP))
            .map(|(id, _)| id)
            .collect();
        for conn_id in auto {
            self.initiate_connection(conn_id, 1, None).await;
        }

        let mut buf_ike = [0u8; 8192];
        let mut buf_natt = [0u8; 8192];
        loop {
            tokio::select! {
                r = ike.recv_from(&mut buf_ike) => match r {
                    Ok((len, from)) => {
                        self.handle_datagram(&buf_ike[..len], from, self.ike_port).await;
                    }
                    Err(e) => tracing::error!("IKE socket error: {}", e),
                },
                r = natt.recv_from(&mut buf_natt) => match r {
                    Ok((len, from)) => {
                        self.handle_datagram(&buf_natt[..len], from, self.natt_port).await;
                    }
                    Err(e) => tracing::error!("NAT-T socket error: {}", e),
                },
                Some(event) = self.timers.next_expired(), if !self.timers.is_empty() => {
                    self.handle_timer_event(event).await;
                }
                Some(task) = self.completions.recv() => {
                    self.handle_completion(task).await;
                }
            }
        }
    }

    // ---- inbound datagrams ---------------------------------------------

    pub(crate) async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, local_port: u16) {
        let mut data = data;
        if local_port == self.natt_port {
            if data.len() == 1 && data[0] == 0xff {
                tracing::trace!("NAT-T keepalive from {}", from);
                return;
            }
            if data.len() < NON_ESP_MARKER.len() || data[..4] != NON_ESP_MARKER {
                // ESP-in-UDP is the kernel's problem, not ours
                return;
            }
            data = &data[4..];
        }

        let raw = data.to_vec();
        let msg = match IkeMessage::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                // unauthenticated parse failures are dropped silently to
                // avoid amplification
                tracing::debug!("dropping unparseable datagram from {}: {}", from, e);
                return;
            }
        };

        tracing::debug!(
            "received {:?} {} from {} ({} bytes)",
            msg.exchange_type,
            if msg.is_response() { "response" } else { "request" },
            from,
            raw.len()
        );

        match msg.version {
            IkeVersion::V2 => self.dispatch_v2(msg, raw, from, local_port).await,
            IkeVersion::V1 => self.dispatch_v1(msg, raw, from, local_port).await,
        }
    }

    // ---- timers --------------------------------------------------------

    async fn handle_timer_event(&mut self, event: TimerEvent) {
        tracing::debug!("handling event {} for {}", event.kind.name(), event.serial);

        if event.kind.is_global() {
            match event.kind {
                EventKind::ShuntScan => {
                    if let Err(e) = self.kernel.expire_bare_shunts().await {
                        tracing::warn!("shunt scan failed: {}", e);
                    }
                    self.timers.schedule(
                        EventKind::ShuntScan,
                        SerialNumber::NOBODY,
                        self.shunt_scan_interval,
                    );
                }
                EventKind::NatKeepalive => {
                    self.send_nat_keepalives().await;
                    self.timers.schedule(
                        EventKind::NatKeepalive,
                        SerialNumber::NOBODY,
                        self.nat_keepalive_interval,
                    );
                }
                _ => unreachable!("not a global event"),
            }
            return;
        }

        // Validate the serial and clear the backpointer slot; a deleted
        // state's events die here.
        let Some(st) = self.table.get_mut(event.serial) else {
            tracing::debug!("event {} for vanished {}", event.kind.name(), event.serial);
            return;
        };
        let valid = match event.kind {
            EventKind::Liveness => st.events.liveness.take().is_some(),
            EventKind::Dpd => st.events.dpd.take().is_some(),
            EventKind::ReleaseWhack => st.events.release_whack.take().is_some(),
            _ => match &st.events.event {
                Some((kind, _)) if *kind == event.kind => {
                    st.events.event = None;
                    true
                }
                _ => false,
            },
        };
        if !valid {
            tracing::debug!(
                "stale event {} for {}, dropped",
                event.kind.name(),
                event.serial
            );
            return;
        }

        match event.kind {
            EventKind::Retransmit => self.handle_retransmit(event.serial).await,
            EventKind::Liveness | EventKind::Dpd => self.liveness_check(event.serial).await,
            EventKind::ReleaseWhack => {
                if let Some(st) = self.table.get_mut(event.serial) {
                    st.release_whack("exchange still in progress; releasing status channel");
                }
            }
            EventKind::SaReplace => self.handle_sa_replace(event.serial, false).await,
            EventKind::SaReplaceIfUsed => self.handle_sa_replace(event.serial, true).await,
            EventKind::SaExpire => self.handle_sa_expire(event.serial).await,
            EventKind::CryptoTimeout => {
                tracing::warn!("crypto task timed out on state {}, aborting", event.serial);
                self.delete_state(event.serial, "crypto timeout").await;
            }
            EventKind::NatKeepalive | EventKind::ShuntScan => unreachable!(),
        }
    }

    /// (Re)arm a state event in its slot, cancelling any previous timer
    /// in the same slot.
    pub(crate) fn schedule_state_event(
        &mut self,
        serial: SerialNumber,
        kind: EventKind,
        delay: Duration,
    ) {
        let Some(st) = self.table.get_mut(serial) else {
            return;
        };
        let old = match kind {
            EventKind::Liveness => st.events.liveness.take(),
            EventKind::Dpd => st.events.dpd.take(),
            EventKind::ReleaseWhack => st.events.release_whack.take(),
            _ => st.events.event.take().map(|(_, k)| k),
        };
        if let Some(key) = old {
            self.timers.cancel(key);
        }
        let key = self.timers.schedule(kind, serial, delay);
        let st = self.table.get_mut(serial).expect("still present");
        match kind {
            EventKind::Liveness => st.events.liveness = Some(key),
            EventKind::Dpd => st.events.dpd = Some(key),
            EventKind::ReleaseWhack => st.events.release_whack = Some(key),
            _ => st.events.event = Some((kind, key)),
        }
    }

    /// Cancel the general event slot; a cancelled retransmit resets the
    /// backoff counter.
    pub(crate) fn delete_event(&mut self, serial: SerialNumber) {
        let Some(st) = self.table.get_mut(serial) else {
            return;
        };
        if let Some((kind, key)) = st.events.event.take() {
            if kind == EventKind::Retransmit {
                st.retransmit_count = 0;
            }
            self.timers.cancel(key);
        }
    }

    // ---- crypto pipeline -----------------------------------------------

    pub(crate) fn next_task_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    /// Hand the state's DH secret and the peer's KE to the worker pool.
    /// After this returns the state owns no private key material until
    /// the completion comes back.
    pub(crate) fn submit_dh(
        &mut self,
        serial: SerialNumber,
        remote_ke: Vec<u8>,
        continuation: DhContinuation,
    ) {
        let task_id = self.next_task_id();
        let Some(st) = self.table.get_mut(serial) else {
            return;
        };
        let mut task = DhTask {
            task_id,
            serial,
            remote_ke,
            local_secret: None,
            shared_secret: None,
            continuation,
        };
        st.transfer_dh_to_task(&mut task);
        self.schedule_state_event(serial, EventKind::CryptoTimeout, CRYPTO_TIMEOUT);
        tracing::debug!(
            "submitted DH task {} for {} ({:?})",
            task_id,
            serial,
            continuation
        );
        self.pool.submit(task);
    }

    /// A worker finished. If the target state is gone or has moved on,
    /// the task is orphaned: key material drops on the floor (and is
    /// wiped), the continuation never runs.
    async fn handle_completion(&mut self, mut task: DhTask) {
        let serial = task.serial;
        let matches = self
            .table
            .get(serial)
            .map(|st| st.dh_task == Some(task.task_id))
            .unwrap_or(false);
        if !matches {
            tracing::debug!(
                "orphaned crypto task {} for {}; discarding result",
                task.task_id,
                serial
            );
            return; // drop frees local_secret, remote_ke and any shared key
        }

        self.delete_event(serial); // the crypto timeout

        self.table
            .get_mut(serial)
            .expect("checked above")
            .transfer_dh_from_task(&mut task);

        let shared = match task.shared_secret.take() {
            Some(Ok(shared)) => shared,
            Some(Err(e)) => {
                tracing::warn!("DH computation failed on {}: {}", serial, e);
                self.delete_state(serial, "key exchange failed").await;
                return;
            }
            None => {
                tracing::error!("crypto task {} completed without result", task.task_id);
                self.delete_state(serial, "crypto pipeline error").await;
                return;
            }
        };
        self.table
            .get_mut(serial)
            .expect("checked above")
            .set_shared_secret(shared);

        match task.continuation {
            DhContinuation::V2SaInitResponder => self.continue_v2_sa_init_responder(serial).await,
            DhContinuation::V2SaInitInitiator => self.continue_v2_sa_init_initiator(serial).await,
            DhContinuation::V1PhaseOne => self.continue_v1_phase_one(serial).await,
            DhContinuation::V1Quick => self.continue_v1_quick(serial).await,
        }
    }

    // ---- state lifecycle ----------------------------------------------

    /// Delete a state; for a parent, the whole family. Cancels timers,
    /// releases operator handles, tears kernel SAs down, and leaves any
    /// in-flight crypto task to be dropped as an orphan on completion.
    pub(crate) async fn delete_state(&mut self, serial: SerialNumber, reason: &str) {
        let removed = self.table.remove_family(serial);
        if removed.is_empty() {
            return;
        }
        for mut st in removed {
            tracing::info!(
                "deleting state {} ({}): {}",
                st.serial,
                st.label.name(),
                reason
            );
            for key in st.events.drain() {
                self.timers.cancel(key);
            }
            st.release_whack(&format!("{}: {}", st.label.name(), reason));
            if st.dh_task.is_some() {
                tracing::debug!("state {} dies with a crypto task in flight", st.serial);
            }
            if st.kind == SaKind::ChildSa && st.is_established() {
                let local_ip = st.local_addr.ip();
                let remote_ip = st.remote_addr.ip();
                for (spi, dst) in [(st.esp_spi_local, local_ip), (st.esp_spi_remote, remote_ip)] {
                    if spi != 0 {
                        let said = SaId {
                            proto: SaProto::Esp,
                            spi,
                            dst,
                        };
                        if let Err(e) = self.kernel.delete_sa(said).await {
                            tracing::warn!("failed to remove {}: {}", said, e);
                        }
                    }
                }
            }
        }
    }

    // ---- outbound ------------------------------------------------------

    pub(crate) async fn send_packet(&self, local: SocketAddr, remote: SocketAddr, data: &[u8]) {
        let (sock, natt) = if local.port() == self.natt_port {
            (&self.sock_natt, true)
        } else {
            (&self.sock_ike, false)
        };
        let Some(sock) = sock else {
            tracing::debug!("no socket bound; dropping {} bytes to {}", data.len(), remote);
            return;
        };
        let result = if natt {
            let mut framed = Vec::with_capacity(4 + data.len());
            framed.extend_from_slice(&NON_ESP_MARKER);
            framed.extend_from_slice(data);
            sock.send_to(&framed, remote).await
        } else {
            sock.send_to(data, remote).await
        };
        match result {
            Ok(n) => tracing::trace!("sent {} bytes to {}", n, remote),
            Err(e) => tracing::warn!("send to {} failed: {}", remote, e),
        }
    }

    /// Send a request, keep it for retransmission, arm the retransmit
    /// timer at the connection's base interval.
    pub(crate) async fn send_request(&mut self, serial: SerialNumber, data: Vec<u8>) {
        let Some(st) = self.table.get_mut(serial) else {
            return;
        };
        let local = st.local_addr;
        let remote = st.remote_addr;
        st.tpacket = Some(data.clone());
        st.outbound_time = Some(std::time::Instant::now());

        let base = self
            .conns
            .get(self.table.get(serial).unwrap().connection)
            .map(|c| c.retransmit_interval)
            .unwrap_or(Duration::from_millis(500));
        self.send_packet(local, remote, &data).await;
        self.schedule_state_event(serial, EventKind::Retransmit, base);
    }

    /// Send a reply; kept for retransmission on duplicate requests but
    /// without a timer of its own.
    pub(crate) async fn send_reply(&mut self, serial: SerialNumber, data: Vec<u8>) {
        let Some(st) = self.table.get_mut(serial) else {
            return;
        };
        let local = st.local_addr;
        let remote = st.remote_addr;
        st.tpacket = Some(data.clone());
        self.send_packet(local, remote, &data).await;
    }

    async fn send_nat_keepalives(&mut self) {
        let Some(sock) = self.sock_natt.clone() else {
            return;
        };
        let targets: Vec<SocketAddr> = self
            .table
            .iter()
            .filter(|st| st.is_ike_sa() && st.is_established() && st.behind_nat)
            .map(|st| st.remote_addr)
            .collect();
        for remote in targets {
            tracing::trace!("NAT-T keepalive to {}", remote);
            let _ = sock.send_to(&[0xffu8], remote).await;
        }
    }

    // ---- operator entry points ----------------------------------------

    /// Start keying a connection. `try_count` is 1 for a fresh operator
    /// request, higher for replacement attempts.
    pub async fn initiate_connection(
        &mut self,
        conn_id: ConnId,
        try_count: u32,
        whack: Option<WhackHandle>,
    ) {
        let Some(conn) = self.conns.get(conn_id) else {
            if let Some(w) = whack {
                w.release("no such connection");
            }
            return;
        };
        let name = conn.name.clone();
        let use_v2 = conn.next_version_is_v2();
        tracing::info!(
            "initiating connection \"{}\" (attempt {}, {})",
            name,
            try_count,
            if use_v2 { "IKEv2" } else { "IKEv1" }
        );
        if use_v2 {
            self.initiate_v2(conn_id, try_count, whack).await;
        } else {
            self.initiate_v1(conn_id, try_count, whack).await;
        }
    }

    pub(crate) async fn initiate_replacement(&mut self, conn_id: ConnId, new_try: u32) {
        self.initiate_connection(conn_id, new_try, None).await;
    }

    /// Tear down every state bound to a connection, telling the peer
    /// about established IKEv2 SAs first.
    pub async fn terminate_connection(&mut self, conn_id: ConnId) {
        for serial in self.table.by_connection(conn_id) {
            let announce = self
                .table
                .get(serial)
                .map(|st| {
                    st.is_ike_sa() && st.is_established() && st.version == IkeVersion::V2
                })
                .unwrap_or(false);
            if announce {
                self.send_v2_delete(serial).await;
            }
            self.delete_state(serial, "terminated by operator").await;
        }
    }

    /// One status line per state, for the operator channel.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for serial in self.table.serials() {
            let st = self.table.get(serial).unwrap();
            let conn = self
                .conns
                .get(st.connection)
                .map(|c| c.name.as_str())
                .unwrap_or("<gone>");
            lines.push(format!(
                "{} \"{}\" {} {:?} {} -> {}",
                serial,
                conn,
                st.label.name(),
                st.kind,
                st.local_addr,
                st.remote_addr
            ));
        }
        lines
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        conns: ConnectionStore,
        kernel: Arc<dyn KernelInterface>,
    ) -> (Self, mpsc::UnboundedSender<DhTask>) {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let pool = CryptoPool::spawn(1, done_tx.clone());
        let engine = Engine {
            conns,
            table: StateTable::new(),
            timers: TimerQueue::new(),
            kernel,
            pool,
            completions: done_rx,
            sock_ike: None,
            sock_natt: None,
            listen_addr: "127.0.0.1".parse().unwrap(),
            ike_port: 500,
            natt_port: 4500,
            interface_device: "eth0".to_string(),
            impair_retransmits: false,
            shunt_scan_interval: Duration::from_secs(60),
            nat_keepalive_interval: Duration::from_secs(20),
            next_task_id: 1,
        };
        (engine, done_tx)
    }

    #[cfg(test)]
    pub(crate) async fn drain_one_completion(&mut self) {
        if let Some(task) = self.completions.recv().await {
            self.handle_completion(task).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::conn::{
        ConnKind, Connection, DpdAction, End, PeerId, SpdRoute,
    };
    use crate::crypto::cipher::CipherSuite;
    use crate::crypto::dh::{DhGroup, DhSecret};
    use crate::engine::state::{SaRole, StateLabel};
    use crate::kernel::MockKernel;

    fn test_conn() -> Connection {
        let this = End {
            client: "10.0.1.0/24".parse().unwrap(),
            host_addr: "192.0.2.1".parse().unwrap(),
            port: 0,
            protocol: 0,
            has_port_wildcard: false,
            id: PeerId::None,
            ca: None,
            sig_pub_key: None,
        };
        let that = End {
            client: "10.0.2.0/24".parse().unwrap(),
            host_addr: "192.0.2.2".parse().unwrap(),
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
            policy: Policy::IKEV2_ALLOW | Policy::IKEV2_PROPOSE,
            foodgroup: None,
            spd: vec![SpdRoute { this, that }],
            retransmit_interval: Duration::from_millis(500),
            retransmit_timeout: Duration::from_secs(60),
            keying_tries: 1,
            dpd_delay: Duration::ZERO,
            dpd_timeout: Duration::from_secs(120),
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

    fn engine_with_state() -> (Engine, SerialNumber) {
        let mut conns = ConnectionStore::new();
        let conn_id = conns.add(test_conn());
        let (mut engine, _tx) = Engine::for_tests(conns, Arc::new(MockKernel::default()));
        let serial = engine.table.create(
            SaKind::IkeSa,
            SaRole::Initiator,
            IkeVersion::V2,
            conn_id,
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
            StateLabel::ParentI1,
        );
        (engine, serial)
    }

    #[tokio::test]
    async fn dh_pipeline_transfers_ownership_and_derives_shared_secret() {
        let (mut engine, serial) = engine_with_state();
        let peer = DhSecret::generate(DhGroup::EcpP256).unwrap();
        {
            let st = engine.table.get_mut(serial).unwrap();
            st.dh_secret = Some(DhSecret::generate(DhGroup::EcpP256).unwrap());
            st.nonce_i = vec![0xaa; 32];
            st.nonce_r = vec![0xbb; 32];
            st.suite = Some(CipherSuite::default());
            st.spis.initiator = 1;
            st.spis.responder = 2;
        }

        engine.submit_dh(
            serial,
            peer.public_value().to_vec(),
            DhContinuation::V2SaInitInitiator,
        );
        // after submit the event loop owns no private key material
        assert!(engine.table.get(serial).unwrap().dh_secret.is_none());
        assert!(engine.table.get(serial).unwrap().dh_task.is_some());

        engine.drain_one_completion().await;
        let st = engine.table.get(serial).unwrap();
        assert!(st.dh_secret.is_some(), "secret returned to the state");
        assert!(st.shared_secret.is_some(), "shared secret installed");
        assert!(st.dh_task.is_none());
    }

    #[tokio::test]
    async fn completion_for_deleted_state_is_orphaned() {
        let (mut engine, serial) = engine_with_state();
        let peer = DhSecret::generate(DhGroup::EcpP256).unwrap();
        engine.table.get_mut(serial).unwrap().dh_secret =
            Some(DhSecret::generate(DhGroup::EcpP256).unwrap());

        engine.submit_dh(
            serial,
            peer.public_value().to_vec(),
            DhContinuation::V2SaInitInitiator,
        );
        engine.delete_state(serial, "test teardown").await;

        // the completion arrives for a dead serial and is dropped
        engine.drain_one_completion().await;
        assert!(engine.table.get(serial).is_none());
        assert!(engine.timers.is_empty(), "crypto timeout cancelled with state");
    }

    #[tokio::test]
    async fn delete_event_resets_retransmit_counter() {
        let (mut engine, serial) = engine_with_state();
        engine.schedule_state_event(serial, EventKind::Retransmit, Duration::from_secs(5));
        engine.table.get_mut(serial).unwrap().retransmit_count = 4;

        engine.delete_event(serial);
        let st = engine.table.get(serial).unwrap();
        assert_eq!(st.retransmit_count, 0);
        assert!(st.events.event.is_none());
        assert!(engine.timers.is_empty());
    }

    #[tokio::test]
    async fn rescheduling_a_slot_cancels_the_previous_timer() {
        let (mut engine, serial) = engine_with_state();
        engine.schedule_state_event(serial, EventKind::SaReplace, Duration::from_secs(100));
        assert_eq!(engine.timers.len(), 1);
        engine.schedule_state_event(serial, EventKind::SaExpire, Duration::from_secs(200));
        assert_eq!(engine.timers.len(), 1, "general slot holds one event");
    }

    #[tokio::test]
    async fn timer_event_for_deleted_state_is_dropped() {
        let (mut engine, serial) = engine_with_state();
        engine.schedule_state_event(serial, EventKind::SaExpire, Duration::from_secs(1));
        engine.delete_state(serial, "test").await;

        // a straggler firing after deletion is validated and dropped
        engine
            .handle_timer_event(TimerEvent {
                kind: EventKind::SaExpire,
                serial,
            })
            .await;
        assert!(engine.table.is_empty());
    }

    #[tokio::test]
    async fn retransmit_exhaustion_schedules_replacement_attempt() {
        let (mut engine, serial) = engine_with_state();
        {
            let conn_id = engine.table.get(serial).unwrap().connection;
            engine.conns.get_mut(conn_id).unwrap().keying_tries = 2;
            let st = engine.table.get_mut(serial).unwrap();
            st.try_count = 1;
            // far past the hard retransmit limit: next delay is "give up"
            st.retransmit_count = crate::engine::retransmit::MAX_RETRANSMITS_PER_EXCHANGE + 2;
        }

        engine.handle_retransmit(serial).await;

        assert!(engine.table.get(serial).is_none(), "exhausted state deleted");
        let replacement = engine
            .table
            .iter()
            .find(|s| s.is_ike_sa())
            .expect("replacement attempt created");
        assert_eq!(replacement.try_count, 2);
    }

    #[tokio::test]
    async fn retransmit_exhaustion_at_try_limit_stops_for_good() {
        let (mut engine, serial) = engine_with_state();
        {
            let conn_id = engine.table.get(serial).unwrap().connection;
            engine.conns.get_mut(conn_id).unwrap().keying_tries = 1;
            let st = engine.table.get_mut(serial).unwrap();
            st.try_count = 1;
            st.retransmit_count = crate::engine::retransmit::MAX_RETRANSMITS_PER_EXCHANGE + 2;
        }

        engine.handle_retransmit(serial).await;
        assert!(engine.table.is_empty(), "no further keying attempts");
    }

    #[tokio::test]
    async fn deleting_parent_cancels_children_timers() {
        let (mut engine, parent) = engine_with_state();
        let conn_id = engine.table.get(parent).unwrap().connection;
        let child = engine.table.create(
            SaKind::ChildSa,
            SaRole::Initiator,
            IkeVersion::V2,
            conn_id,
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
            StateLabel::V2IpsecI,
        );
        engine.table.get_mut(child).unwrap().parent = parent;
        engine.schedule_state_event(child, EventKind::SaReplace, Duration::from_secs(300));
        engine.schedule_state_event(parent, EventKind::SaReplace, Duration::from_secs(300));

        engine.delete_state(parent, "test").await;
        assert!(engine.table.is_empty());
        assert!(engine.timers.is_empty());
    }
}
