use std::net::IpAddr;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

pub mod conn;

use conn::{
    ConnKind, Connection, ConnectionStore, DpdAction, End, PeerId, Policy, SpdRoute,
};
use crate::crypto::cipher::CipherSuite;
use crate::crypto::sig::SigKeyPair;
use crate::engine::state::SerialNumber;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection \"{0}\": bad address \"{1}\"")]
    BadAddress(String, String),
    #[error("connection \"{0}\": bad subnet \"{1}\"")]
    BadSubnet(String, String),
    #[error("connection \"{0}\": unknown dpd-action \"{1}\"")]
    BadDpdAction(String, String),
    #[error("connection \"{0}\": unknown ikev2 mode \"{1}\" (no|permit|propose|insist)")]
    BadIkeMode(String, String),
    #[error("connection \"{0}\": cannot use key file \"{1}\": {2}")]
    BadKeyFile(String, String, String),
    #[error("connection \"{0}\": no PSK and no signature key; every connection needs one")]
    NoAuthMaterial(String),
    #[error("connection \"{0}\": signature auth without a pinned peer public key")]
    MissingPeerKey(String),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IronswanConfig {
    pub daemon: DaemonConfig,
    pub defaults: SaDefaults,
    #[serde(default)]
    pub connections: Vec<ConnEntry>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    pub listen: String,
    pub ike_port: u16,
    pub natt_port: u16,
    /// 0 means one worker per CPU.
    pub crypto_workers: usize,
    pub interface_device: String,
    pub impair_retransmits: bool,
    pub shunt_scan_interval_s: u64,
    pub nat_keepalive_s: u64,
    pub log_level: String,
}

impl DaemonConfig {
    pub fn listen_addr(&self) -> IpAddr {
        self.listen.parse().unwrap_or_else(|_| "0.0.0.0".parse().unwrap())
    }
}

/// Per-connection knobs and their daemon-wide fallbacks.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SaDefaults {
    pub retransmit_interval_ms: u64,
    pub retransmit_timeout_ms: u64,
    pub keying_tries: u32,
    pub dpd_delay_s: u64,
    pub dpd_timeout_s: u64,
    pub dpd_action: String,
    pub rekey_margin_s: u64,
    pub sa_lifetime_s: u64,
    pub margin_s: u64,
    #[serde(default)]
    pub psk: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EndEntry {
    pub addr: String,
    pub subnet: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: u8,
    #[serde(default)]
    pub port_wildcard: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub ca: Option<String>,
    /// Path to this end's raw public key, for signature authentication.
    #[serde(default)]
    pub sig_pub_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConnEntry {
    pub name: String,
    pub this: EndEntry,
    pub that: EndEntry,
    /// Enables responder-side selector narrowing.
    #[serde(default)]
    pub narrowing: bool,
    /// no | permit | propose | insist
    #[serde(default = "default_ikev2_mode")]
    pub ikev2: String,
    #[serde(default)]
    pub aggressive: bool,
    /// Keyed automatically at daemon start.
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub dont_rekey: bool,
    #[serde(default)]
    pub opportunistic: bool,
    #[serde(default)]
    pub replace_if_used: bool,
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub group_instance: bool,
    #[serde(default)]
    pub foodgroup: Option<String>,
    #[serde(default)]
    pub psk: Option<String>,
    /// Path to our PKCS#8 private key, for signature authentication.
    #[serde(default)]
    pub sig_priv_key: Option<String>,
    #[serde(default)]
    pub if_id: Option<u32>,
    #[serde(default)]
    pub keying_tries: Option<u32>,
    #[serde(default)]
    pub retransmit_interval_ms: Option<u64>,
    #[serde(default)]
    pub retransmit_timeout_ms: Option<u64>,
    #[serde(default)]
    pub dpd_delay_s: Option<u64>,
    #[serde(default)]
    pub dpd_timeout_s: Option<u64>,
    #[serde(default)]
    pub dpd_action: Option<String>,
    #[serde(default)]
    pub rekey_margin_s: Option<u64>,
    #[serde(default)]
    pub sa_lifetime_s: Option<u64>,
    #[serde(default)]
    pub margin_s: Option<u64>,
}

fn default_ikev2_mode() -> String {
    "propose".to_string()
}

fn parse_peer_id(id: &Option<String>) -> PeerId {
    match id {
        None => PeerId::None,
        Some(s) => match s.parse::<IpAddr>() {
            Ok(addr) => PeerId::Addr(addr),
            Err(_) => PeerId::Fqdn(s.trim_start_matches('@').to_string()),
        },
    }
}

fn parse_dpd_action(name: &str) -> Option<DpdAction> {
    match name {
        "hold" => Some(DpdAction::Hold),
        "clear" => Some(DpdAction::Clear),
        "restart" => Some(DpdAction::Restart),
        _ => None,
    }
}

impl ConnEntry {
    fn read_key_file(&self, path: &str) -> Result<Vec<u8>, ConnectionError> {
        std::fs::read(path).map_err(|e| {
            ConnectionError::BadKeyFile(self.name.clone(), path.to_string(), e.to_string())
        })
    }

    fn build_end(&self, entry: &EndEntry) -> Result<End, ConnectionError> {
        let host_addr = entry
            .addr
            .parse()
            .map_err(|_| ConnectionError::BadAddress(self.name.clone(), entry.addr.clone()))?;
        let client = entry
            .subnet
            .parse()
            .map_err(|_| ConnectionError::BadSubnet(self.name.clone(), entry.subnet.clone()))?;
        let sig_pub_key = match &entry.sig_pub_key {
            Some(path) => Some(self.read_key_file(path)?),
            None => None,
        };
        Ok(End {
            client,
            host_addr,
            port: entry.port,
            protocol: entry.protocol,
            has_port_wildcard: entry.port_wildcard,
            id: parse_peer_id(&entry.id),
            ca: entry.ca.clone(),
            sig_pub_key,
        })
    }

    fn build(&self, defaults: &SaDefaults) -> Result<Connection, ConnectionError> {
        let mut policy = Policy::NONE;
        match self.ikev2.as_str() {
            "no" | "never" => policy = policy | Policy::IKEV1_ALLOW,
            "permit" => policy = policy | Policy::IKEV1_ALLOW | Policy::IKEV2_ALLOW,
            "propose" => {
                policy = policy
                    | Policy::IKEV1_ALLOW
                    | Policy::IKEV2_ALLOW
                    | Policy::IKEV2_PROPOSE
            }
            "insist" => policy = policy | Policy::IKEV2_ALLOW | Policy::IKEV2_PROPOSE,
            other => {
                return Err(ConnectionError::BadIkeMode(
                    self.name.clone(),
                    other.to_string(),
                ))
            }
        }
        if self.narrowing {
            policy = policy | Policy::ALLOW_NARROWING;
        }
        if self.aggressive {
            policy = policy | Policy::AGGRESSIVE;
        }
        if self.auto {
            policy = policy | Policy::UP;
        }
        if self.dont_rekey {
            policy = policy | Policy::DONT_REKEY;
        }
        if self.opportunistic {
            policy = policy | Policy::OPPORTUNISTIC;
        }
        if self.replace_if_used {
            policy = policy | Policy::REPLACE_IF_USED;
        }
        if self.group_instance {
            policy = policy | Policy::GROUPINSTANCE;
        }

        let dpd_action_name = self
            .dpd_action
            .clone()
            .unwrap_or_else(|| defaults.dpd_action.clone());
        let dpd_action = parse_dpd_action(&dpd_action_name)
            .ok_or_else(|| ConnectionError::BadDpdAction(self.name.clone(), dpd_action_name))?;

        let psk = self
            .psk
            .clone()
            .or_else(|| defaults.psk.clone())
            .map(String::into_bytes);

        let sig_key = match &self.sig_priv_key {
            Some(path) => {
                let der = self.read_key_file(path)?;
                let pair = SigKeyPair::from_pkcs8(&der).map_err(|e| {
                    ConnectionError::BadKeyFile(self.name.clone(), path.clone(), e.to_string())
                })?;
                Some(std::sync::Arc::new(pair))
            }
            None => None,
        };

        let this = self.build_end(&self.this)?;
        let that = self.build_end(&self.that)?;

        // never fall through to an unauthenticated exchange: a
        // connection needs a PSK or a complete signature setup
        if psk.is_none() {
            if sig_key.is_none() {
                return Err(ConnectionError::NoAuthMaterial(self.name.clone()));
            }
            if that.sig_pub_key.is_none() {
                return Err(ConnectionError::MissingPeerKey(self.name.clone()));
            }
        }

        Ok(Connection {
            name: self.name.clone(),
            kind: if self.template {
                ConnKind::Template
            } else {
                ConnKind::Permanent
            },
            policy,
            foodgroup: self.foodgroup.clone(),
            spd: vec![SpdRoute { this, that }],
            retransmit_interval: Duration::from_millis(
                self.retransmit_interval_ms
                    .unwrap_or(defaults.retransmit_interval_ms),
            ),
            retransmit_timeout: Duration::from_millis(
                self.retransmit_timeout_ms
                    .unwrap_or(defaults.retransmit_timeout_ms),
            ),
            keying_tries: self.keying_tries.unwrap_or(defaults.keying_tries),
            dpd_delay: Duration::from_secs(self.dpd_delay_s.unwrap_or(defaults.dpd_delay_s)),
            dpd_timeout: Duration::from_secs(self.dpd_timeout_s.unwrap_or(defaults.dpd_timeout_s)),
            dpd_action,
            rekey_margin: Duration::from_secs(
                self.rekey_margin_s.unwrap_or(defaults.rekey_margin_s),
            ),
            sa_lifetime: Duration::from_secs(self.sa_lifetime_s.unwrap_or(defaults.sa_lifetime_s)),
            margin: Duration::from_secs(self.margin_s.unwrap_or(defaults.margin_s)),
            psk,
            sig_key,
            if_id: self.if_id,
            suite: CipherSuite::default(),
            newest_isakmp_sa: SerialNumber::NOBODY,
            newest_ipsec_sa: SerialNumber::NOBODY,
            failed_ikev2: false,
        })
    }
}

impl IronswanConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    pub fn load_from(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        } else {
            builder = builder
                .add_source(File::with_name("ironswan.toml").required(false))
                .add_source(File::with_name("/etc/ironswan/config.toml").required(false));
        }
        let config = builder
            .add_source(Environment::with_prefix("IRONSWAN"))
            .set_default("daemon.listen", "0.0.0.0")?
            .set_default("daemon.ike_port", 500)?
            .set_default("daemon.natt_port", 4500)?
            .set_default("daemon.crypto_workers", 0)?
            .set_default("daemon.interface_device", "eth0")?
            .set_default("daemon.impair_retransmits", false)?
            .set_default("daemon.shunt_scan_interval_s", 120)?
            .set_default("daemon.nat_keepalive_s", 20)?
            .set_default("daemon.log_level", "info")?
            .set_default("defaults.retransmit_interval_ms", 500)?
            .set_default("defaults.retransmit_timeout_ms", 60_000)?
            .set_default("defaults.keying_tries", 0)?
            .set_default("defaults.dpd_delay_s", 0)?
            .set_default("defaults.dpd_timeout_s", 120)?
            .set_default("defaults.dpd_action", "hold")?
            .set_default("defaults.rekey_margin_s", 540)?
            .set_default("defaults.sa_lifetime_s", 28_800)?
            .set_default("defaults.margin_s", 60)?
            .build()?;

        config.try_deserialize()
    }

    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let toml_content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Turn the configuration entries into the runtime connection
    /// store.
    pub fn build_connections(&self) -> Result<ConnectionStore, ConnectionError> {
        let mut store = ConnectionStore::new();
        for entry in &self.connections {
            let conn = entry.build(&self.defaults)?;
            tracing::debug!("loaded connection \"{}\"", conn.name);
            store.add(conn);
        }
        Ok(store)
    }
}
