use serde::{Deserialize, Serialize};

use crate::crypto::cipher::CipherSuite;
use crate::crypto::{CryptoError, SymKey};

pub mod exchange;
pub mod ikev1;
pub mod narrow;
pub mod proposal;
pub mod ts;

pub use proposal::{Proposal, ProtocolId, SaPayload, Transform, TransformType};
pub use ts::{TrafficSelector, TsPayload};

pub const IKEV1_VERSION: u8 = 0x10;
pub const IKEV2_VERSION: u8 = 0x20;

pub const IKE_HEADER_LEN: usize = 28;

/// Header flag bits.
pub const FLAG_INITIATOR: u8 = 0x08;
pub const FLAG_VERSION: u8 = 0x10;
pub const FLAG_RESPONSE: u8 = 0x20;

/// Non-ESP marker prefixed to IKE packets on the NAT-T port.
pub const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];

#[derive(Debug, thiserror::Error)]
pub enum IkeError {
    #[error("truncated message")]
    Truncated,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unsupported IKE version {0:#x}")]
    UnsupportedVersion(u8),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IkeVersion {
    V1,
    V2,
}

impl IkeVersion {
    pub fn wire(self) -> u8 {
        match self {
            IkeVersion::V1 => IKEV1_VERSION,
            IkeVersion::V2 => IKEV2_VERSION,
        }
    }

    pub fn from_wire(b: u8) -> Result<Self, IkeError> {
        match b & 0xf0 {
            IKEV1_VERSION => Ok(IkeVersion::V1),
            IKEV2_VERSION => Ok(IkeVersion::V2),
            _ => Err(IkeError::UnsupportedVersion(b)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeType {
    // IKEv1
    IdProt,
    Aggressive,
    InformationalV1,
    QuickMode,
    // IKEv2
    IkeSaInit,
    IkeAuth,
    CreateChildSa,
    Informational,
    Other(u8),
}

impl ExchangeType {
    pub fn wire(self) -> u8 {
        match self {
            ExchangeType::IdProt => 2,
            ExchangeType::Aggressive => 4,
            ExchangeType::InformationalV1 => 5,
            ExchangeType::QuickMode => 32,
            ExchangeType::IkeSaInit => 34,
            ExchangeType::IkeAuth => 35,
            ExchangeType::CreateChildSa => 36,
            ExchangeType::Informational => 37,
            ExchangeType::Other(b) => b,
        }
    }

    pub fn from_wire(b: u8) -> Self {
        match b {
            2 => ExchangeType::IdProt,
            4 => ExchangeType::Aggressive,
            5 => ExchangeType::InformationalV1,
            32 => ExchangeType::QuickMode,
            34 => ExchangeType::IkeSaInit,
            35 => ExchangeType::IkeAuth,
            36 => ExchangeType::CreateChildSa,
            37 => ExchangeType::Informational,
            other => ExchangeType::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyType {
    InvalidSyntax,
    NoProposalChosen,
    InvalidKePayload,
    AuthenticationFailed,
    TsUnacceptable,
    Unknown(u16),
}

impl NotifyType {
    pub fn wire(self) -> u16 {
        match self {
            NotifyType::InvalidSyntax => 7,
            NotifyType::NoProposalChosen => 14,
            NotifyType::InvalidKePayload => 17,
            NotifyType::AuthenticationFailed => 24,
            NotifyType::TsUnacceptable => 38,
            NotifyType::Unknown(v) => v,
        }
    }

    pub fn from_wire(v: u16) -> Self {
        match v {
            7 => NotifyType::InvalidSyntax,
            14 => NotifyType::NoProposalChosen,
            17 => NotifyType::InvalidKePayload,
            24 => NotifyType::AuthenticationFailed,
            38 => NotifyType::TsUnacceptable,
            other => NotifyType::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    pub dh_group: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Ipv4Addr,
    Fqdn,
    Ipv6Addr,
    KeyId,
    Other(u8),
}

impl IdType {
    pub fn wire(self) -> u8 {
        match self {
            IdType::Ipv4Addr => 1,
            IdType::Fqdn => 2,
            IdType::Ipv6Addr => 5,
            IdType::KeyId => 11,
            IdType::Other(b) => b,
        }
    }

    pub fn from_wire(b: u8) -> Self {
        match b {
            1 => IdType::Ipv4Addr,
            2 => IdType::Fqdn,
            5 => IdType::Ipv6Addr,
            11 => IdType::KeyId,
            other => IdType::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    pub id_type: IdType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// RFC 7296: 1 = RSA signature, 2 = shared key MIC;
    /// RFC 4754: 9 = ECDSA with SHA-256 on P-256
    pub method: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    pub protocol_id: u8,
    pub spi: Vec<u8>,
    pub notify_type: NotifyType,
    pub data: Vec<u8>,
}

impl NotifyPayload {
    pub fn error(notify_type: NotifyType) -> Self {
        NotifyPayload {
            protocol_id: 0,
            spi: Vec::new(),
            notify_type,
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    pub protocol_id: u8,
    pub spi_size: u8,
    pub spis: Vec<Vec<u8>>,
}

/// SK payload: the first inner payload type plus nonce-prefixed
/// ciphertext. Sealing and opening live in `seal_sk` / `open_sk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub first_inner: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPayload {
    /// Certificate encoding (4 = X.509 signature certificate).
    pub encoding: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Sa(SaPayload),
    KeyExchange(KePayload),
    IdInitiator(IdPayload),
    IdResponder(IdPayload),
    Auth(AuthPayload),
    Nonce(NoncePayload),
    Notify(NotifyPayload),
    Delete(DeletePayload),
    Vendor(Vec<u8>),
    TsInitiator(TsPayload),
    TsResponder(TsPayload),
    Encrypted(EncryptedPayload),
    /// IKEv1 HASH payload
    Hash(Vec<u8>),
    /// IKEv1 SIG payload: a DER signature over HASH_I/HASH_R
    Signature(Vec<u8>),
    Cert(CertPayload),
    Unknown { payload_type: u8, data: Vec<u8> },
}

impl Payload {
    fn wire_type(&self, version: IkeVersion) -> u8 {
        match version {
            IkeVersion::V2 => match self {
                Payload::Sa(_) => 33,
                Payload::KeyExchange(_) => 34,
                Payload::IdInitiator(_) => 35,
                Payload::IdResponder(_) => 36,
                Payload::Cert(_) => 37,
                Payload::Auth(_) => 39,
                Payload::Nonce(_) => 40,
                Payload::Notify(_) => 41,
                Payload::Delete(_) => 42,
                Payload::Vendor(_) => 43,
                Payload::TsInitiator(_) => 44,
                Payload::TsResponder(_) => 45,
                Payload::Encrypted(_) => 46,
                Payload::Hash(_) | Payload::Signature(_) => 0,
                Payload::Unknown { payload_type, .. } => *payload_type,
            },
            IkeVersion::V1 => match self {
                Payload::Sa(_) => 1,
                Payload::KeyExchange(_) => 4,
                Payload::IdInitiator(_) | Payload::IdResponder(_) => 5,
                Payload::Cert(_) => 6,
                Payload::Hash(_) => 8,
                Payload::Signature(_) => 9,
                Payload::Nonce(_) => 10,
                Payload::Notify(_) => 11,
                Payload::Delete(_) => 12,
                Payload::Vendor(_) => 13,
                // no v1 equivalents; never emitted on a v1 exchange
                Payload::Auth(_)
                | Payload::TsInitiator(_)
                | Payload::TsResponder(_)
                | Payload::Encrypted(_) => 0,
                Payload::Unknown { payload_type, .. } => *payload_type,
            },
        }
    }

    fn emit_body(&self, version: IkeVersion, out: &mut Vec<u8>) {
        match self {
            Payload::Sa(sa) => sa.emit(version, out),
            Payload::KeyExchange(ke) => {
                if version == IkeVersion::V2 {
                    out.extend_from_slice(&ke.dh_group.to_be_bytes());
                    out.extend_from_slice(&[0, 0]);
                }
                out.extend_from_slice(&ke.data);
            }
            Payload::IdInitiator(id) | Payload::IdResponder(id) => {
                match version {
                    IkeVersion::V2 => {
                        out.push(id.id_type.wire());
                        out.extend_from_slice(&[0, 0, 0]);
                    }
                    IkeVersion::V1 => {
                        out.push(id.id_type.wire());
                        out.extend_from_slice(&[0, 0, 0]); // protocol + port, unused
                    }
                }
                out.extend_from_slice(&id.data);
            }
            Payload::Auth(auth) => {
                out.push(auth.method);
                out.extend_from_slice(&[0, 0, 0]);
                out.extend_from_slice(&auth.data);
            }
            Payload::Nonce(n) => out.extend_from_slice(&n.data),
            Payload::Notify(n) => {
                if version == IkeVersion::V1 {
                    out.extend_from_slice(&1u32.to_be_bytes()); // IPsec DOI
                }
                out.push(n.protocol_id);
                out.push(n.spi.len() as u8);
                out.extend_from_slice(&n.notify_type.wire().to_be_bytes());
                out.extend_from_slice(&n.spi);
                out.extend_from_slice(&n.data);
            }
            Payload::Delete(d) => {
                if version == IkeVersion::V1 {
                    out.extend_from_slice(&1u32.to_be_bytes()); // IPsec DOI
                }
                out.push(d.protocol_id);
                out.push(d.spi_size);
                out.extend_from_slice(&(d.spis.len() as u16).to_be_bytes());
                for spi in &d.spis {
                    out.extend_from_slice(spi);
                }
            }
            Payload::Vendor(v) => out.extend_from_slice(v),
            Payload::TsInitiator(ts) | Payload::TsResponder(ts) => ts.emit(out),
            Payload::Encrypted(e) => out.extend_from_slice(&e.data),
            Payload::Hash(h) => out.extend_from_slice(h),
            Payload::Signature(s) => out.extend_from_slice(s),
            Payload::Cert(c) => {
                out.push(c.encoding);
                out.extend_from_slice(&c.data);
            }
            Payload::Unknown { data, .. } => out.extend_from_slice(data),
        }
    }

    fn parse_body(
        version: IkeVersion,
        payload_type: u8,
        body: &[u8],
    ) -> Result<Payload, IkeError> {
        match (version, payload_type) {
            (IkeVersion::V2, 33) | (IkeVersion::V1, 1) => {
                Ok(Payload::Sa(SaPayload::parse(version, body)?))
            }
            (IkeVersion::V2, 34) => {
                if body.len() < 4 {
                    return Err(IkeError::Truncated);
                }
                Ok(Payload::KeyExchange(KePayload {
                    dh_group: u16::from_be_bytes([body[0], body[1]]),
                    data: body[4..].to_vec(),
                }))
            }
            (IkeVersion::V1, 4) => Ok(Payload::KeyExchange(KePayload {
                dh_group: 0,
                data: body.to_vec(),
            })),
            (IkeVersion::V2, 35) | (IkeVersion::V2, 36) | (IkeVersion::V1, 5) => {
                if body.len() < 4 {
                    return Err(IkeError::Truncated);
                }
                let id = IdPayload {
                    id_type: IdType::from_wire(body[0]),
                    data: body[4..].to_vec(),
                };
                if payload_type == 36 {
                    Ok(Payload::IdResponder(id))
                } else {
                    Ok(Payload::IdInitiator(id))
                }
            }
            (IkeVersion::V2, 39) => {
                if body.len() < 4 {
                    return Err(IkeError::Truncated);
                }
                Ok(Payload::Auth(AuthPayload {
                    method: body[0],
                    data: body[4..].to_vec(),
                }))
            }
            (IkeVersion::V2, 40) | (IkeVersion::V1, 10) => {
                Ok(Payload::Nonce(NoncePayload { data: body.to_vec() }))
            }
            (IkeVersion::V2, 41) | (IkeVersion::V1, 11) => {
                let body = if version == IkeVersion::V1 {
                    if body.len() < 4 {
                        return Err(IkeError::Truncated);
                    }
                    &body[4..] // skip DOI
                } else {
                    body
                };
                if body.len() < 4 {
                    return Err(IkeError::Truncated);
                }
                let spi_size = body[1] as usize;
                if body.len() < 4 + spi_size {
                    return Err(IkeError::Truncated);
                }
                Ok(Payload::Notify(NotifyPayload {
                    protocol_id: body[0],
                    notify_type: NotifyType::from_wire(u16::from_be_bytes([body[2], body[3]])),
                    spi: body[4..4 + spi_size].to_vec(),
                    data: body[4 + spi_size..].to_vec(),
                }))
            }
            (IkeVersion::V2, 42) | (IkeVersion::V1, 12) => {
                let body = if version == IkeVersion::V1 {
                    if body.len() < 4 {
                        return Err(IkeError::Truncated);
                    }
                    &body[4..]
                } else {
                    body
                };
                if body.len() < 4 {
                    return Err(IkeError::Truncated);
                }
                let spi_size = body[1] as usize;
                let count = u16::from_be_bytes([body[2], body[3]]) as usize;
                let spi_bytes = &body[4..];
                if spi_bytes.len() < spi_size * count {
                    return Err(IkeError::Truncated);
                }
                let spis = (0..count)
                    .map(|i| spi_bytes[i * spi_size..(i + 1) * spi_size].to_vec())
                    .collect();
                Ok(Payload::Delete(DeletePayload {
                    protocol_id: body[0],
                    spi_size: spi_size as u8,
                    spis,
                }))
            }
            (IkeVersion::V2, 43) | (IkeVersion::V1, 13) => Ok(Payload::Vendor(body.to_vec())),
            (IkeVersion::V2, 44) => Ok(Payload::TsInitiator(TsPayload::parse(body)?)),
            (IkeVersion::V2, 45) => Ok(Payload::TsResponder(TsPayload::parse(body)?)),
            (IkeVersion::V1, 8) => Ok(Payload::Hash(body.to_vec())),
            (IkeVersion::V1, 9) => Ok(Payload::Signature(body.to_vec())),
            (IkeVersion::V2, 37) | (IkeVersion::V1, 6) => {
                if body.is_empty() {
                    return Err(IkeError::Truncated);
                }
                Ok(Payload::Cert(CertPayload {
                    encoding: body[0],
                    data: body[1..].to_vec(),
                }))
            }
            _ => Ok(Payload::Unknown {
                payload_type,
                data: body.to_vec(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeMessage {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub version: IkeVersion,
    pub exchange_type: ExchangeType,
    pub flags: u8,
    pub message_id: u32,
    pub payloads: Vec<Payload>,
}

impl IkeMessage {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn is_initiator(&self) -> bool {
        self.flags & FLAG_INITIATOR != 0
    }

    pub fn parse(data: &[u8]) -> Result<IkeMessage, IkeError> {
        if data.len() < IKE_HEADER_LEN {
            return Err(IkeError::Truncated);
        }
        let initiator_spi = u64::from_be_bytes(data[0..8].try_into().unwrap());
        let responder_spi = u64::from_be_bytes(data[8..16].try_into().unwrap());
        let first_payload = data[16];
        let version = IkeVersion::from_wire(data[17])?;
        let exchange_type = ExchangeType::from_wire(data[18]);
        let flags = data[19];
        let message_id = u32::from_be_bytes(data[20..24].try_into().unwrap());
        let length = u32::from_be_bytes(data[24..28].try_into().unwrap()) as usize;
        if length != data.len() {
            return Err(IkeError::Malformed(format!(
                "header length {} but datagram is {} bytes",
                length,
                data.len()
            )));
        }

        let payloads = parse_payload_chain(version, first_payload, &data[IKE_HEADER_LEN..])?;
        Ok(IkeMessage {
            initiator_spi,
            responder_spi,
            version,
            exchange_type,
            flags,
            message_id,
            payloads,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IKE_HEADER_LEN + 256);
        let first = self
            .payloads
            .first()
            .map(|p| p.wire_type(self.version))
            .unwrap_or(0);
        out.extend_from_slice(&self.initiator_spi.to_be_bytes());
        out.extend_from_slice(&self.responder_spi.to_be_bytes());
        out.push(first);
        out.push(self.version.wire());
        out.push(self.exchange_type.wire());
        out.push(self.flags);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // patched below

        emit_payload_chain(self.version, &self.payloads, &mut out);

        let total = out.len() as u32;
        out[24..28].copy_from_slice(&total.to_be_bytes());
        out
    }
}

pub(crate) fn parse_payload_chain(
    version: IkeVersion,
    first: u8,
    mut rest: &[u8],
) -> Result<Vec<Payload>, IkeError> {
    let mut payloads = Vec::new();
    let mut next = first;
    while next != 0 {
        if rest.len() < 4 {
            return Err(IkeError::Truncated);
        }
        let this = next;
        next = rest[0];
        let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        if length < 4 || length > rest.len() {
            return Err(IkeError::Malformed(format!(
                "payload {} has length {} with {} bytes remaining",
                this,
                length,
                rest.len()
            )));
        }
        let body = &rest[4..length];
        // An SK payload swallows the rest of the message; its inner chain
        // is parsed after decryption using the recorded first_inner type.
        if version == IkeVersion::V2 && this == 46 {
            payloads.push(Payload::Encrypted(EncryptedPayload {
                first_inner: next,
                data: body.to_vec(),
            }));
            return Ok(payloads);
        }
        payloads.push(Payload::parse_body(version, this, body)?);
        rest = &rest[length..];
    }
    Ok(payloads)
}

pub(crate) fn emit_payload_chain(version: IkeVersion, payloads: &[Payload], out: &mut Vec<u8>) {
    for (i, payload) in payloads.iter().enumerate() {
        let next = if i + 1 < payloads.len() {
            payloads[i + 1].wire_type(version)
        } else {
            0
        };
        // For SK the generic header's next-payload names the first inner
        // payload rather than a sibling.
        let next = match payload {
            Payload::Encrypted(e) => e.first_inner,
            _ => next,
        };
        let start = out.len();
        out.push(next);
        out.push(0);
        out.extend_from_slice(&[0, 0]); // length patched below
        payload.emit_body(version, out);
        let length = (out.len() - start) as u16;
        out[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
    }
}

/// Build a fully-encrypted IKEv2 message: the inner payloads are sealed
/// into an SK payload with the header and SK generic header as AAD.
pub fn seal_sk(
    mut msg: IkeMessage,
    inner: &[Payload],
    suite: &CipherSuite,
    key: &SymKey,
) -> Result<Vec<u8>, IkeError> {
    let mut plain = Vec::new();
    emit_payload_chain(IkeVersion::V2, inner, &mut plain);
    let first_inner = inner
        .first()
        .map(|p| p.wire_type(IkeVersion::V2))
        .unwrap_or(0);

    let nonce_len = suite.encr.nonce_len();
    let sk_body_len = nonce_len + plain.len() + suite.encr.tag_len();
    let sk_len = 4 + sk_body_len;

    msg.payloads = Vec::new();
    let mut out = msg.to_bytes(); // bare header, length patched below
    out[16] = 46; // first payload: SK
    let total = (IKE_HEADER_LEN + sk_len) as u32;
    out[24..28].copy_from_slice(&total.to_be_bytes());

    // SK generic header
    out.push(first_inner);
    out.push(0);
    out.extend_from_slice(&(sk_len as u16).to_be_bytes());

    let mut nonce = vec![0u8; nonce_len];
    crate::crypto::fill_random(&mut nonce)?;

    let aad = out.clone(); // header + SK generic header
    let sealed = suite.seal(key, &nonce, &aad, &plain)?;
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    debug_assert_eq!(out.len(), total as usize);
    Ok(out)
}

/// Decrypt the SK payload of `msg` (parsed from `raw`) and parse the
/// inner payload chain.
pub fn open_sk(
    msg: &IkeMessage,
    raw: &[u8],
    suite: &CipherSuite,
    key: &SymKey,
) -> Result<Vec<Payload>, IkeError> {
    let sk = msg
        .payloads
        .iter()
        .find_map(|p| match p {
            Payload::Encrypted(e) => Some(e),
            _ => None,
        })
        .ok_or_else(|| IkeError::Malformed("missing SK payload".to_string()))?;

    let nonce_len = suite.encr.nonce_len();
    if sk.data.len() < nonce_len + suite.encr.tag_len() {
        return Err(IkeError::Truncated);
    }
    if raw.len() < IKE_HEADER_LEN + 4 {
        return Err(IkeError::Truncated);
    }
    let aad = &raw[..IKE_HEADER_LEN + 4];
    let nonce = &sk.data[..nonce_len];
    let ciphertext = &sk.data[nonce_len..];
    let plain = suite.open(key, nonce, aad, ciphertext)?;
    parse_payload_chain(IkeVersion::V2, sk.first_inner, &plain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrfAlgorithm;
    use crate::crypto::cipher::EncrAlgorithm;
    use crate::crypto::dh::DhGroup;

    fn sample_message() -> IkeMessage {
        IkeMessage {
            initiator_spi: 0x0102030405060708,
            responder_spi: 0,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::IkeSaInit,
            flags: FLAG_INITIATOR,
            message_id: 0,
            payloads: vec![
                Payload::Nonce(NoncePayload {
                    data: vec![0xaa; 32],
                }),
                Payload::Notify(NotifyPayload::error(NotifyType::NoProposalChosen)),
            ],
        }
    }

    #[test]
    fn header_round_trip() {
        let msg = sample_message();
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[24..28], &(bytes.len() as u32).to_be_bytes());
        let parsed = IkeMessage::parse(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn v1_signature_and_cert_payloads_round_trip() {
        let msg = IkeMessage {
            initiator_spi: 0x1111,
            responder_spi: 0x2222,
            version: IkeVersion::V1,
            exchange_type: ExchangeType::IdProt,
            flags: 0,
            message_id: 0,
            payloads: vec![
                Payload::IdInitiator(IdPayload {
                    id_type: IdType::Fqdn,
                    data: b"west.example.org".to_vec(),
                }),
                Payload::Cert(CertPayload {
                    encoding: 4,
                    data: vec![0x30, 0x82, 0x01, 0x00],
                }),
                Payload::Signature(vec![0x30, 0x45, 0x02, 0x20]),
            ],
        };
        let bytes = msg.to_bytes();
        let parsed = IkeMessage::parse(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(matches!(
            IkeMessage::parse(&[0u8; 20]),
            Err(IkeError::Truncated)
        ));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut bytes = sample_message().to_bytes();
        bytes[27] = bytes[27].wrapping_add(4);
        assert!(matches!(
            IkeMessage::parse(&bytes),
            Err(IkeError::Malformed(_))
        ));
    }

    #[test]
    fn bad_payload_length_is_rejected() {
        let mut bytes = sample_message().to_bytes();
        // corrupt the first payload's length to overrun the datagram
        let off = IKE_HEADER_LEN + 2;
        bytes[off] = 0xff;
        bytes[off + 1] = 0xff;
        assert!(matches!(
            IkeMessage::parse(&bytes),
            Err(IkeError::Malformed(_))
        ));
    }

    #[test]
    fn sk_seal_open_round_trip() {
        let suite = CipherSuite {
            encr: EncrAlgorithm::Aes256Gcm,
            prf: PrfAlgorithm::HmacSha256,
            dh: DhGroup::EcpP256,
        };
        let key = SymKey::new(vec![3u8; 32]);
        let inner = vec![
            Payload::IdInitiator(IdPayload {
                id_type: IdType::Fqdn,
                data: b"east.example.org".to_vec(),
            }),
            Payload::Auth(AuthPayload {
                method: 2,
                data: vec![0x55; 32],
            }),
        ];
        let msg = IkeMessage {
            initiator_spi: 7,
            responder_spi: 9,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::IkeAuth,
            flags: FLAG_INITIATOR,
            message_id: 1,
            payloads: Vec::new(),
        };

        let bytes = seal_sk(msg, &inner, &suite, &key).unwrap();
        let parsed = IkeMessage::parse(&bytes).unwrap();
        let opened = open_sk(&parsed, &bytes, &suite, &key).unwrap();
        assert_eq!(opened, inner);
    }

    #[test]
    fn sk_open_fails_with_wrong_key() {
        let suite = CipherSuite::default();
        let key = SymKey::new(vec![3u8; 32]);
        let wrong = SymKey::new(vec![4u8; 32]);
        let msg = IkeMessage {
            initiator_spi: 7,
            responder_spi: 9,
            version: IkeVersion::V2,
            exchange_type: ExchangeType::Informational,
            flags: FLAG_RESPONSE,
            message_id: 2,
            payloads: Vec::new(),
        };
        let bytes = seal_sk(msg, &[], &suite, &key).unwrap();
        let parsed = IkeMessage::parse(&bytes).unwrap();
        assert!(open_sk(&parsed, &bytes, &suite, &wrong).is_err());
    }
}
