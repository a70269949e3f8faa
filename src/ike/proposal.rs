//! SA payload proposals and transform negotiation.
//!
//! Algorithm families are tagged enum variants; the negotiated result is
//! a `CipherSuite` for the IKE SA or an ESP transform plus SPI for a
//! child SA.

use crate::crypto::cipher::{CipherSuite, EncrAlgorithm};
use crate::crypto::dh::DhGroup;
use crate::crypto::PrfAlgorithm;
use crate::ike::{IkeError, IkeVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformType {
    Encryption,
    Prf,
    Integrity,
    DhGroup,
    Esn,
    Other(u8),
}

impl TransformType {
    pub fn wire(self) -> u8 {
        match self {
            TransformType::Encryption => 1,
            TransformType::Prf => 2,
            TransformType::Integrity => 3,
            TransformType::DhGroup => 4,
            TransformType::Esn => 5,
            TransformType::Other(b) => b,
        }
    }

    pub fn from_wire(b: u8) -> Self {
        match b {
            1 => TransformType::Encryption,
            2 => TransformType::Prf,
            3 => TransformType::Integrity,
            4 => TransformType::DhGroup,
            5 => TransformType::Esn,
            other => TransformType::Other(other),
        }
    }
}

/// ISAKMP phase-1 authentication methods (RFC 2409 appendix A plus the
/// ECDSA extension registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V1AuthMethod {
    PreSharedKey,
    EcdsaSha256,
    Other(u16),
}

impl V1AuthMethod {
    pub fn wire(self) -> u16 {
        match self {
            V1AuthMethod::PreSharedKey => 1,
            V1AuthMethod::EcdsaSha256 => 9,
            V1AuthMethod::Other(v) => v,
        }
    }

    pub fn from_wire(v: u16) -> Self {
        match v {
            1 => V1AuthMethod::PreSharedKey,
            9 => V1AuthMethod::EcdsaSha256,
            other => V1AuthMethod::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    Ike,
    Ah,
    Esp,
    Other(u8),
}

impl ProtocolId {
    pub fn wire(self) -> u8 {
        match self {
            ProtocolId::Ike => 1,
            ProtocolId::Ah => 2,
            ProtocolId::Esp => 3,
            ProtocolId::Other(b) => b,
        }
    }

    pub fn from_wire(b: u8) -> Self {
        match b {
            1 => ProtocolId::Ike,
            2 => ProtocolId::Ah,
            3 => ProtocolId::Esp,
            other => ProtocolId::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    pub transform_type: TransformType,
    pub id: u16,
    /// Key-length attribute, when the transform carries one.
    pub keylen: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub number: u8,
    pub protocol_id: ProtocolId,
    pub spi: Vec<u8>,
    pub transforms: Vec<Transform>,
    /// Phase-1 authentication method; ISAKMP proposals only.
    pub v1_auth: Option<V1AuthMethod>,
}

impl Proposal {
    fn transform_id(&self, t: TransformType) -> Option<u16> {
        self.transforms
            .iter()
            .find(|tr| tr.transform_type == t)
            .map(|tr| tr.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload {
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    pub fn emit(&self, version: IkeVersion, out: &mut Vec<u8>) {
        if version == IkeVersion::V1 {
            out.extend_from_slice(&1u32.to_be_bytes()); // IPsec DOI
            out.extend_from_slice(&1u32.to_be_bytes()); // SIT_IDENTITY_ONLY
        }
        for (i, prop) in self.proposals.iter().enumerate() {
            let last = i + 1 == self.proposals.len();
            let start = out.len();
            out.push(if last { 0 } else { 2 });
            out.push(0);
            out.extend_from_slice(&[0, 0]); // length patched below
            out.push(prop.number);
            out.push(prop.protocol_id.wire());
            out.push(prop.spi.len() as u8);
            match version {
                IkeVersion::V2 => {
                    out.push(prop.transforms.len() as u8);
                    out.extend_from_slice(&prop.spi);
                    emit_v2_transforms(&prop.transforms, out);
                }
                IkeVersion::V1 => {
                    out.push(1); // single KEY_IKE transform
                    out.extend_from_slice(&prop.spi);
                    emit_v1_transform(prop, out);
                }
            }
            let length = (out.len() - start) as u16;
            out[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
        }
    }

    pub fn parse(version: IkeVersion, body: &[u8]) -> Result<SaPayload, IkeError> {
        let mut rest = if version == IkeVersion::V1 {
            if body.len() < 8 {
                return Err(IkeError::Truncated);
            }
            &body[8..] // skip DOI + situation
        } else {
            body
        };

        let mut proposals = Vec::new();
        while !rest.is_empty() {
            if rest.len() < 8 {
                return Err(IkeError::Truncated);
            }
            let more = rest[0];
            let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            if length < 8 || length > rest.len() {
                return Err(IkeError::Malformed("proposal length".to_string()));
            }
            let number = rest[4];
            let protocol_id = ProtocolId::from_wire(rest[5]);
            let spi_size = rest[6] as usize;
            let num_transforms = rest[7] as usize;
            if 8 + spi_size > length {
                return Err(IkeError::Malformed("proposal SPI overrun".to_string()));
            }
            let spi = rest[8..8 + spi_size].to_vec();
            let tbody = &rest[8 + spi_size..length];
            let (transforms, v1_auth) = match version {
                IkeVersion::V2 => (parse_v2_transforms(tbody, num_transforms)?, None),
                IkeVersion::V1 => parse_v1_transform(tbody)?,
            };
            proposals.push(Proposal {
                number,
                protocol_id,
                spi,
                transforms,
                v1_auth,
            });
            rest = &rest[length..];
            if more == 0 {
                break;
            }
        }
        if proposals.is_empty() {
            return Err(IkeError::Malformed("SA payload without proposals".to_string()));
        }
        Ok(SaPayload { proposals })
    }
}

fn emit_v2_transforms(transforms: &[Transform], out: &mut Vec<u8>) {
    for (i, t) in transforms.iter().enumerate() {
        let last = i + 1 == transforms.len();
        let start = out.len();
        out.push(if last { 0 } else { 3 });
        out.push(0);
        out.extend_from_slice(&[0, 0]);
        out.push(t.transform_type.wire());
        out.push(0);
        out.extend_from_slice(&t.id.to_be_bytes());
        if let Some(keylen) = t.keylen {
            // TV attribute: key length (14)
            out.extend_from_slice(&(0x8000u16 | 14).to_be_bytes());
            out.extend_from_slice(&keylen.to_be_bytes());
        }
        let length = (out.len() - start) as u16;
        out[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
    }
}

fn parse_v2_transforms(mut rest: &[u8], expected: usize) -> Result<Vec<Transform>, IkeError> {
    let mut transforms = Vec::new();
    while !rest.is_empty() {
        if rest.len() < 8 {
            return Err(IkeError::Truncated);
        }
        let more = rest[0];
        let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        if length < 8 || length > rest.len() {
            return Err(IkeError::Malformed("transform length".to_string()));
        }
        let transform_type = TransformType::from_wire(rest[4]);
        let id = u16::from_be_bytes([rest[6], rest[7]]);
        let mut keylen = None;
        let mut attrs = &rest[8..length];
        while attrs.len() >= 4 {
            let atype = u16::from_be_bytes([attrs[0], attrs[1]]);
            if atype & 0x8000 != 0 {
                // TV format
                if atype & 0x7fff == 14 {
                    keylen = Some(u16::from_be_bytes([attrs[2], attrs[3]]));
                }
                attrs = &attrs[4..];
            } else {
                // TLV format, skip
                let alen = u16::from_be_bytes([attrs[2], attrs[3]]) as usize;
                if attrs.len() < 4 + alen {
                    return Err(IkeError::Truncated);
                }
                attrs = &attrs[4 + alen..];
            }
        }
        transforms.push(Transform {
            transform_type,
            id,
            keylen,
        });
        rest = &rest[length..];
        if more == 0 {
            break;
        }
    }
    if transforms.len() != expected {
        return Err(IkeError::Malformed(format!(
            "proposal declares {} transforms, {} present",
            expected,
            transforms.len()
        )));
    }
    Ok(transforms)
}

/// ISAKMP (v1) encodes one KEY_IKE transform whose attributes carry the
/// algorithm choices.
fn emit_v1_transform(prop: &Proposal, out: &mut Vec<u8>) {
    let start = out.len();
    out.push(0); // last transform
    out.push(0);
    out.extend_from_slice(&[0, 0]);
    out.push(1); // transform number
    out.push(1); // KEY_IKE
    out.extend_from_slice(&[0, 0]);

    let mut attr = |atype: u16, value: u16| {
        out.extend_from_slice(&(0x8000 | atype).to_be_bytes());
        out.extend_from_slice(&value.to_be_bytes());
    };
    if let Some(id) = prop.transform_id(TransformType::Encryption) {
        attr(1, id);
    }
    if let Some(id) = prop.transform_id(TransformType::Prf) {
        attr(2, id);
    }
    // authentication method reflects the connection's configured mode
    let auth = prop.v1_auth.unwrap_or(V1AuthMethod::PreSharedKey);
    attr(3, auth.wire());
    if let Some(id) = prop.transform_id(TransformType::DhGroup) {
        attr(4, id);
    }

    let length = (out.len() - start) as u16;
    out[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
}

fn parse_v1_transform(
    body: &[u8],
) -> Result<(Vec<Transform>, Option<V1AuthMethod>), IkeError> {
    if body.len() < 8 {
        return Err(IkeError::Truncated);
    }
    let length = u16::from_be_bytes([body[2], body[3]]) as usize;
    if length < 8 || length > body.len() {
        return Err(IkeError::Malformed("v1 transform length".to_string()));
    }
    let mut transforms = Vec::new();
    let mut v1_auth = None;
    let mut attrs = &body[8..length];
    while attrs.len() >= 4 {
        let atype = u16::from_be_bytes([attrs[0], attrs[1]]);
        let value = u16::from_be_bytes([attrs[2], attrs[3]]);
        if atype & 0x8000 == 0 {
            let alen = value as usize;
            if attrs.len() < 4 + alen {
                return Err(IkeError::Truncated);
            }
            attrs = &attrs[4 + alen..];
            continue;
        }
        match atype & 0x7fff {
            1 => transforms.push(Transform {
                transform_type: TransformType::Encryption,
                id: value,
                keylen: None,
            }),
            2 => transforms.push(Transform {
                transform_type: TransformType::Prf,
                id: value,
                keylen: None,
            }),
            3 => v1_auth = Some(V1AuthMethod::from_wire(value)),
            4 => transforms.push(Transform {
                transform_type: TransformType::DhGroup,
                id: value,
                keylen: None,
            }),
            _ => {} // lifetimes
        }
        attrs = &attrs[4..];
    }
    Ok((transforms, v1_auth))
}

/// Our IKE SA offer for the given suite.
pub fn ike_proposal(suite: &CipherSuite) -> SaPayload {
    SaPayload {
        proposals: vec![Proposal {
            number: 1,
            protocol_id: ProtocolId::Ike,
            spi: Vec::new(),
            transforms: vec![
                Transform {
                    transform_type: TransformType::Encryption,
                    id: suite.encr.ikev2_id(),
                    keylen: Some((suite.encr.key_len() * 8) as u16),
                },
                Transform {
                    transform_type: TransformType::Prf,
                    id: suite.prf.ikev2_id(),
                    keylen: None,
                },
                Transform {
                    transform_type: TransformType::DhGroup,
                    id: suite.dh.ikev2_id(),
                    keylen: None,
                },
            ],
            v1_auth: None,
        }],
    }
}

/// The ISAKMP phase-1 offer: the suite plus the connection's actual
/// authentication mode.
pub fn v1_ike_proposal(suite: &CipherSuite, auth: V1AuthMethod) -> SaPayload {
    let mut sa = ike_proposal(suite);
    sa.proposals[0].v1_auth = Some(auth);
    sa
}

/// The phase-1 authentication method a peer proposed.
pub fn select_v1_auth(sa: &SaPayload) -> Option<V1AuthMethod> {
    sa.proposals.first().and_then(|p| p.v1_auth)
}

/// Our ESP offer for a child SA; `spi` is our inbound SPI.
pub fn esp_proposal(encr: EncrAlgorithm, spi: u32) -> SaPayload {
    SaPayload {
        proposals: vec![Proposal {
            number: 1,
            protocol_id: ProtocolId::Esp,
            spi: spi.to_be_bytes().to_vec(),
            transforms: vec![
                Transform {
                    transform_type: TransformType::Encryption,
                    id: encr.ikev2_id(),
                    keylen: Some((encr.key_len() * 8) as u16),
                },
                Transform {
                    transform_type: TransformType::Esn,
                    id: 0,
                    keylen: None,
                },
            ],
            v1_auth: None,
        }],
    }
}

/// Pick the first IKE proposal we can satisfy.
pub fn select_ike(sa: &SaPayload) -> Option<CipherSuite> {
    for prop in &sa.proposals {
        if prop.protocol_id != ProtocolId::Ike {
            continue;
        }
        let encr = prop
            .transform_id(TransformType::Encryption)
            .and_then(EncrAlgorithm::from_ikev2_id);
        let prf = prop
            .transform_id(TransformType::Prf)
            .and_then(PrfAlgorithm::from_ikev2_id);
        let dh = prop
            .transform_id(TransformType::DhGroup)
            .and_then(DhGroup::from_ikev2_id);
        if let (Some(encr), Some(prf), Some(dh)) = (encr, prf, dh) {
            return Some(CipherSuite { encr, prf, dh });
        }
    }
    None
}

/// Pick the first ESP proposal we can satisfy; returns the transform and
/// the peer's SPI.
pub fn select_esp(sa: &SaPayload) -> Option<(EncrAlgorithm, u32)> {
    for prop in &sa.proposals {
        if prop.protocol_id != ProtocolId::Esp || prop.spi.len() != 4 {
            continue;
        }
        let spi = u32::from_be_bytes([prop.spi[0], prop.spi[1], prop.spi[2], prop.spi[3]]);
        if let Some(encr) = prop
            .transform_id(TransformType::Encryption)
            .and_then(EncrAlgorithm::from_ikev2_id)
        {
            return Some((encr, spi));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_sa_round_trip() {
        let sa = ike_proposal(&CipherSuite::default());
        let mut out = Vec::new();
        sa.emit(IkeVersion::V2, &mut out);
        let parsed = SaPayload::parse(IkeVersion::V2, &out).unwrap();
        assert_eq!(parsed, sa);
    }

    #[test]
    fn v2_esp_round_trip_keeps_spi() {
        let sa = esp_proposal(EncrAlgorithm::Aes256Gcm, 0xdeadbeef);
        let mut out = Vec::new();
        sa.emit(IkeVersion::V2, &mut out);
        let parsed = SaPayload::parse(IkeVersion::V2, &out).unwrap();
        let (encr, spi) = select_esp(&parsed).unwrap();
        assert_eq!(encr, EncrAlgorithm::Aes256Gcm);
        assert_eq!(spi, 0xdeadbeef);
    }

    #[test]
    fn select_ike_finds_supported_suite() {
        let suite = CipherSuite::default();
        let sa = ike_proposal(&suite);
        assert_eq!(select_ike(&sa), Some(suite));
    }

    #[test]
    fn select_ike_rejects_unknown_transforms() {
        let mut sa = ike_proposal(&CipherSuite::default());
        sa.proposals[0].transforms[0].id = 999;
        assert_eq!(select_ike(&sa), None);
    }

    #[test]
    fn v1_sa_keeps_algorithm_attributes() {
        let sa = SaPayload {
            proposals: vec![Proposal {
                number: 1,
                protocol_id: ProtocolId::Ike,
                spi: Vec::new(),
                transforms: vec![
                    Transform {
                        transform_type: TransformType::Encryption,
                        id: 7, // AES-CBC
                        keylen: None,
                    },
                    Transform {
                        transform_type: TransformType::Prf,
                        id: 2,
                        keylen: None,
                    },
                    Transform {
                        transform_type: TransformType::DhGroup,
                        id: 19,
                        keylen: None,
                    },
                ],
                v1_auth: None,
            }],
        };
        let mut out = Vec::new();
        sa.emit(IkeVersion::V1, &mut out);
        let parsed = SaPayload::parse(IkeVersion::V1, &out).unwrap();
        let prop = &parsed.proposals[0];
        assert_eq!(prop.transform_id(TransformType::Encryption), Some(7));
        assert_eq!(prop.transform_id(TransformType::Prf), Some(2));
        assert_eq!(prop.transform_id(TransformType::DhGroup), Some(19));
        // an unset auth mode is emitted as pre-shared key
        assert_eq!(prop.v1_auth, Some(V1AuthMethod::PreSharedKey));
    }

    #[test]
    fn v1_auth_method_survives_the_wire() {
        for auth in [V1AuthMethod::PreSharedKey, V1AuthMethod::EcdsaSha256] {
            let sa = v1_ike_proposal(&CipherSuite::default(), auth);
            let mut out = Vec::new();
            sa.emit(IkeVersion::V1, &mut out);
            let parsed = SaPayload::parse(IkeVersion::V1, &out).unwrap();
            assert_eq!(select_v1_auth(&parsed), Some(auth), "{:?}", auth);
        }
    }

    #[test]
    fn unknown_v1_auth_method_is_surfaced_not_dropped() {
        let sa = v1_ike_proposal(&CipherSuite::default(), V1AuthMethod::Other(5));
        let mut out = Vec::new();
        sa.emit(IkeVersion::V1, &mut out);
        let parsed = SaPayload::parse(IkeVersion::V1, &out).unwrap();
        assert_eq!(select_v1_auth(&parsed), Some(V1AuthMethod::Other(5)));
    }
}
