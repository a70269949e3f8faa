//! The IKEv1 SKEYID derivation ladder (RFC 2409 section 5 and appendix B)
//! and the IKEv2 SKEYSEED / prf+ analog (RFC 7296 section 2.13 and 2.14).

use crate::crypto::{PrfAlgorithm, SymKey};

/// SKEYID for pre-shared-key authentication: prf(psk, Ni | Nr).
pub fn skeyid_psk(prf: PrfAlgorithm, psk: &[u8], ni: &[u8], nr: &[u8]) -> SymKey {
    prf.prf_parts(psk, &[ni, nr])
}

/// SKEYID for signature authentication: prf(Ni | Nr, g^xy).
pub fn skeyid_sig(prf: PrfAlgorithm, ni: &[u8], nr: &[u8], g_xy: &SymKey) -> SymKey {
    let mut key = Vec::with_capacity(ni.len() + nr.len());
    key.extend_from_slice(ni);
    key.extend_from_slice(nr);
    let out = prf.prf(&key, g_xy.as_bytes());
    drop(SymKey::new(key)); // wipe the Ni|Nr scratch
    out
}

/// SKEYID_d = prf(SKEYID, g^xy | CKY-I | CKY-R | 0x00)
pub fn skeyid_d(
    prf: PrfAlgorithm,
    skeyid: &SymKey,
    g_xy: &SymKey,
    cky_i: &[u8],
    cky_r: &[u8],
) -> SymKey {
    prf.prf_parts(skeyid.as_bytes(), &[g_xy.as_bytes(), cky_i, cky_r, &[0x00]])
}

/// SKEYID_a = prf(SKEYID, SKEYID_d | g^xy | CKY-I | CKY-R | 0x01)
pub fn skeyid_a(
    prf: PrfAlgorithm,
    skeyid: &SymKey,
    skeyid_d: &SymKey,
    g_xy: &SymKey,
    cky_i: &[u8],
    cky_r: &[u8],
) -> SymKey {
    prf.prf_parts(
        skeyid.as_bytes(),
        &[skeyid_d.as_bytes(), g_xy.as_bytes(), cky_i, cky_r, &[0x01]],
    )
}

/// SKEYID_e = prf(SKEYID, SKEYID_a | g^xy | CKY-I | CKY-R | 0x02)
pub fn skeyid_e(
    prf: PrfAlgorithm,
    skeyid: &SymKey,
    skeyid_a: &SymKey,
    g_xy: &SymKey,
    cky_i: &[u8],
    cky_r: &[u8],
) -> SymKey {
    prf.prf_parts(
        skeyid.as_bytes(),
        &[skeyid_a.as_bytes(), g_xy.as_bytes(), cky_i, cky_r, &[0x02]],
    )
}

/// The complete phase-1 key set.
#[derive(Debug)]
pub struct V1Keymat {
    pub skeyid: SymKey,
    pub skeyid_d: SymKey,
    pub skeyid_a: SymKey,
    pub skeyid_e: SymKey,
}

/// How SKEYID itself is seeded.
pub enum V1Auth<'a> {
    PreSharedKey(&'a [u8]),
    Signature,
}

/// Run the full ladder from the shared DH secret and nonces.
pub fn v1_keymat(
    prf: PrfAlgorithm,
    auth: V1Auth<'_>,
    g_xy: &SymKey,
    ni: &[u8],
    nr: &[u8],
    cky_i: &[u8],
    cky_r: &[u8],
) -> V1Keymat {
    let skeyid = match auth {
        V1Auth::PreSharedKey(psk) => skeyid_psk(prf, psk, ni, nr),
        V1Auth::Signature => skeyid_sig(prf, ni, nr, g_xy),
    };
    let d = skeyid_d(prf, &skeyid, g_xy, cky_i, cky_r);
    let a = skeyid_a(prf, &skeyid, &d, g_xy, cky_i, cky_r);
    let e = skeyid_e(prf, &skeyid, &a, g_xy, cky_i, cky_r);
    V1Keymat {
        skeyid,
        skeyid_d: d,
        skeyid_a: a,
        skeyid_e: e,
    }
}

/// Appendix-B key stretching: when SKEYID_e is shorter than the cipher
/// needs, expand K1 = prf(SKEYID_e, 0), Kn+1 = prf(SKEYID_e, Kn) and
/// take the head of the concatenation. Intermediates are wiped on drop.
pub fn appendix_b_keymat(prf: PrfAlgorithm, skeyid_e: &SymKey, required: usize) -> SymKey {
    if skeyid_e.len() >= required {
        return skeyid_e.truncated(required);
    }

    let mut keymat = prf.prf(skeyid_e.as_bytes(), &[0x00]);
    let mut old_k = keymat.clone();
    while keymat.len() < required {
        let new_k = prf.prf(skeyid_e.as_bytes(), old_k.as_bytes());
        keymat.append(&new_k);
        old_k = new_k;
    }
    let out = keymat.truncated(required);
    drop(old_k);
    drop(keymat);
    out
}

/// IKEv2 SKEYSEED = prf(Ni | Nr, g^ir).
pub fn skeyseed_v2(prf: PrfAlgorithm, ni: &[u8], nr: &[u8], g_ir: &SymKey) -> SymKey {
    let mut key = Vec::with_capacity(ni.len() + nr.len());
    key.extend_from_slice(ni);
    key.extend_from_slice(nr);
    let out = prf.prf(&key, g_ir.as_bytes());
    drop(SymKey::new(key));
    out
}

/// The IKEv2 SK_* key set sliced out of prf+ output.
#[derive(Debug)]
pub struct SkKeys {
    pub sk_d: SymKey,
    pub sk_ai: SymKey,
    pub sk_ar: SymKey,
    pub sk_ei: SymKey,
    pub sk_er: SymKey,
    pub sk_pi: SymKey,
    pub sk_pr: SymKey,
}

/// KEYMAT = prf+(SKEYSEED, Ni | Nr | SPIi | SPIr), carved into
/// SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr.
pub fn v2_sk_keys(
    prf: PrfAlgorithm,
    skeyseed: &SymKey,
    ni: &[u8],
    nr: &[u8],
    spi_i: u64,
    spi_r: u64,
    encr_key_len: usize,
) -> SkKeys {
    let prf_len = prf.output_len();
    let needed = prf_len * 5 + encr_key_len * 2;

    let mut seed = Vec::with_capacity(ni.len() + nr.len() + 16);
    seed.extend_from_slice(ni);
    seed.extend_from_slice(nr);
    seed.extend_from_slice(&spi_i.to_be_bytes());
    seed.extend_from_slice(&spi_r.to_be_bytes());

    let keymat = prf_plus(prf, skeyseed, &seed, needed);
    drop(SymKey::new(seed));

    let bytes = keymat.as_bytes();
    let mut off = 0;
    let mut take = |n: usize| {
        let k = SymKey::new(bytes[off..off + n].to_vec());
        off += n;
        k
    };
    SkKeys {
        sk_d: take(prf_len),
        sk_ai: take(prf_len),
        sk_ar: take(prf_len),
        sk_ei: take(encr_key_len),
        sk_er: take(encr_key_len),
        sk_pi: take(prf_len),
        sk_pr: take(prf_len),
    }
}

/// IKEv2 prf+: T1 = prf(K, S | 0x01), Tn = prf(K, Tn-1 | S | n),
/// concatenated until `needed` bytes are available.
pub fn prf_plus(prf: PrfAlgorithm, key: &SymKey, seed: &[u8], needed: usize) -> SymKey {
    assert!(needed <= 255 * prf.output_len(), "prf+ output bound exceeded");
    let mut out = SymKey::new(Vec::with_capacity(needed));
    let mut last = prf.prf_parts(key.as_bytes(), &[seed, &[0x01]]);
    let mut n: u8 = 1;
    loop {
        out.append(&last);
        if out.len() >= needed {
            break;
        }
        n += 1;
        last = prf.prf_parts(key.as_bytes(), &[last.as_bytes(), seed, &[n]]);
    }
    out.truncated(needed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::hmac;

    fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
        let k = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
        hmac::sign(&k, data).as_ref().to_vec()
    }

    #[test]
    fn ladder_is_deterministic_and_chained() {
        let prf = PrfAlgorithm::HmacSha256;
        let g_xy = SymKey::new(vec![0x11; 32]);
        let ni = [0xaa; 16];
        let nr = [0xbb; 16];
        let cky_i = [0x01; 8];
        let cky_r = [0x02; 8];

        let a = v1_keymat(prf, V1Auth::PreSharedKey(b"secret"), &g_xy, &ni, &nr, &cky_i, &cky_r);
        let b = v1_keymat(prf, V1Auth::PreSharedKey(b"secret"), &g_xy, &ni, &nr, &cky_i, &cky_r);
        assert_eq!(a.skeyid.as_bytes(), b.skeyid.as_bytes());
        assert_eq!(a.skeyid_e.as_bytes(), b.skeyid_e.as_bytes());

        // SKEYID = prf(psk, Ni|Nr)
        let mut seed = ni.to_vec();
        seed.extend_from_slice(&nr);
        let expect_skeyid = prf.prf(b"secret", &seed);
        assert_eq!(a.skeyid.as_bytes(), expect_skeyid.as_bytes());

        // SKEYID_d = prf(SKEYID, g^xy | CKY-I | CKY-R | 0)
        let mut seed = g_xy.as_bytes().to_vec();
        seed.extend_from_slice(&cky_i);
        seed.extend_from_slice(&cky_r);
        seed.push(0);
        let expect_d = prf.prf(expect_skeyid.as_bytes(), &seed);
        assert_eq!(a.skeyid_d.as_bytes(), expect_d.as_bytes());
    }

    #[test]
    fn signature_mode_keys_prf_with_nonces() {
        let prf = PrfAlgorithm::HmacSha1;
        let g_xy = SymKey::new(vec![0x42; 20]);
        let skeyid = skeyid_sig(prf, &[0x01, 0x02], &[0x03, 0x04], &g_xy);
        let expect = hmac_sha1(&[0x01, 0x02, 0x03, 0x04], g_xy.as_bytes());
        assert_eq!(skeyid.as_bytes(), &expect[..]);
    }

    #[test]
    fn appendix_b_stretches_sha1_to_40_bytes() {
        // SKEYID_e = 20 * 0x42, required 40: K1 = prf(e, 0x00),
        // K2 = prf(e, K1), key = head 40 of K1|K2.
        let skeyid_e = SymKey::new(vec![0x42; 20]);
        let out = appendix_b_keymat(PrfAlgorithm::HmacSha1, &skeyid_e, 40);

        let k1 = hmac_sha1(skeyid_e.as_bytes(), &[0x00]);
        let k2 = hmac_sha1(skeyid_e.as_bytes(), &k1);
        let mut expect = k1.clone();
        expect.extend_from_slice(&k2);
        assert_eq!(out.len(), 40);
        assert_eq!(out.as_bytes(), &expect[..40]);
    }

    #[test]
    fn appendix_b_truncates_when_long_enough() {
        let skeyid_e = SymKey::new((0..32).collect());
        let out = appendix_b_keymat(PrfAlgorithm::HmacSha256, &skeyid_e, 16);
        assert_eq!(out.as_bytes(), &skeyid_e.as_bytes()[..16]);
    }

    #[test]
    fn v2_key_carving_is_disjoint_and_sized() {
        let prf = PrfAlgorithm::HmacSha256;
        let skeyseed = SymKey::new(vec![0x31; 32]);
        let keys = v2_sk_keys(prf, &skeyseed, &[0xaa; 16], &[0xbb; 16], 1, 2, 32);
        assert_eq!(keys.sk_d.len(), 32);
        assert_eq!(keys.sk_ei.len(), 32);
        assert_eq!(keys.sk_er.len(), 32);
        assert_ne!(keys.sk_ei.as_bytes(), keys.sk_er.as_bytes());
        assert_ne!(keys.sk_d.as_bytes(), keys.sk_pi.as_bytes());
    }

    #[test]
    fn prf_plus_first_block_is_t1() {
        let prf = PrfAlgorithm::HmacSha256;
        let key = SymKey::new(vec![0x99; 32]);
        let seed = b"nonces and spis";
        let out = prf_plus(prf, &key, seed, 72);
        assert_eq!(out.len(), 72);

        let t1 = prf.prf_parts(key.as_bytes(), &[seed, &[0x01]]);
        assert_eq!(&out.as_bytes()[..32], t1.as_bytes());
        let t2 = prf.prf_parts(key.as_bytes(), &[t1.as_bytes(), seed, &[0x02]]);
        assert_eq!(&out.as_bytes()[32..64], t2.as_bytes());
    }
}
