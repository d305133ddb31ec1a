//! Packet protection key schedule (RFC 9001).
//!
//! Derives Initial keys from the destination connection ID, installs
//! Handshake/Application keys from secrets surfaced by the TLS collaborator,
//! and applies AEAD plus header protection per epoch. HKDF is implemented
//! directly on HMAC; the label framing follows TLS 1.3 `HkdfLabel`.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit as BlockKeyInit};
use aes::{Aes128, Aes256};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use chacha20poly1305::ChaCha20Poly1305;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384};

use crate::error::TransportError;

/// RFC 9001 §5.2 initial salt for QUIC v1.
const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// RFC 9001 §5.8 Retry integrity key and nonce for QUIC v1.
const RETRY_KEY_V1: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];
const RETRY_NONCE_V1: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// AEAD tag length for every suite QUIC v1 admits.
pub const TAG_LEN: usize = 16;

/// Length of the ciphertext sample taken for header protection.
pub const SAMPLE_LEN: usize = 16;

/// Negotiated AEAD suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherSuite {
    fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128Gcm => 16,
            CipherSuite::Aes256Gcm | CipherSuite::ChaCha20Poly1305 => 32,
        }
    }
}

/// Hash backing the HKDF operations for a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HkdfHash {
    Sha256,
    Sha384,
}

impl From<CipherSuite> for HkdfHash {
    fn from(suite: CipherSuite) -> Self {
        match suite {
            CipherSuite::Aes256Gcm => HkdfHash::Sha384,
            _ => HkdfHash::Sha256,
        }
    }
}

fn hmac_digest(hash: HkdfHash, key: &[u8], data: &[&[u8]]) -> Vec<u8> {
    match hash {
        HkdfHash::Sha256 => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
                .expect("HMAC accepts keys of any length");
            for part in data {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
        HkdfHash::Sha384 => {
            let mut mac = <Hmac<Sha384> as Mac>::new_from_slice(key)
                .expect("HMAC accepts keys of any length");
            for part in data {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn hkdf_extract(hash: HkdfHash, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    hmac_digest(hash, salt, &[ikm])
}

fn hkdf_expand(hash: HkdfHash, prk: &[u8], info: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut previous: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while out.len() < len {
        let block = hmac_digest(hash, prk, &[&previous, info, &[counter]]);
        let take = (len - out.len()).min(block.len());
        out.extend_from_slice(&block[..take]);
        previous = block;
        counter += 1;
    }
    out
}

/// TLS 1.3 `HKDF-Expand-Label` with the `tls13 ` prefix (RFC 8446 §7.1).
fn hkdf_expand_label(hash: HkdfHash, secret: &[u8], label: &str, len: usize) -> Vec<u8> {
    let full = format!("tls13 {label}");
    let mut info = Vec::with_capacity(4 + full.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push(full.len() as u8);
    info.extend_from_slice(full.as_bytes());
    info.push(0); // empty context
    hkdf_expand(hash, secret, &info, len)
}

enum AeadKey {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
    ChaCha(ChaCha20Poly1305),
}

#[derive(Clone)]
enum HeaderKey {
    Aes128(Aes128),
    Aes256(Aes256),
    ChaCha([u8; 32]),
}

/// Keys for one direction of one epoch.
pub struct DirectionalKeys {
    secret: Vec<u8>,
    suite: CipherSuite,
    aead: AeadKey,
    iv: [u8; 12],
    hp: HeaderKey,
}

impl DirectionalKeys {
    fn derive(suite: CipherSuite, secret: &[u8]) -> Self {
        let hash = HkdfHash::from(suite);
        let key = hkdf_expand_label(hash, secret, "quic key", suite.key_len());
        let iv_bytes = hkdf_expand_label(hash, secret, "quic iv", 12);
        let hp_bytes = hkdf_expand_label(hash, secret, "quic hp", suite.key_len());

        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_bytes);

        let aead = match suite {
            CipherSuite::Aes128Gcm => {
                AeadKey::Aes128(Aes128Gcm::new(GenericArray::from_slice(&key)))
            }
            CipherSuite::Aes256Gcm => {
                AeadKey::Aes256(Aes256Gcm::new(GenericArray::from_slice(&key)))
            }
            CipherSuite::ChaCha20Poly1305 => {
                AeadKey::ChaCha(ChaCha20Poly1305::new(GenericArray::from_slice(&key)))
            }
        };
        let hp = match suite {
            CipherSuite::Aes128Gcm => {
                HeaderKey::Aes128(Aes128::new(GenericArray::from_slice(&hp_bytes)))
            }
            CipherSuite::Aes256Gcm => {
                HeaderKey::Aes256(Aes256::new(GenericArray::from_slice(&hp_bytes)))
            }
            CipherSuite::ChaCha20Poly1305 => {
                let mut k = [0u8; 32];
                k.copy_from_slice(&hp_bytes);
                HeaderKey::ChaCha(k)
            }
        };

        DirectionalKeys { secret: secret.to_vec(), suite, aead, iv, hp }
    }

    fn nonce(&self, packet_number: u64) -> [u8; 12] {
        let mut nonce = self.iv;
        let pn = packet_number.to_be_bytes();
        for (n, p) in nonce[4..].iter_mut().zip(pn.iter()) {
            *n ^= p;
        }
        nonce
    }

    /// AEAD-seal `payload` with the packet header as associated data.
    pub fn seal(&self, packet_number: u64, header: &[u8], payload: &[u8]) -> Vec<u8> {
        let nonce = self.nonce(packet_number);
        let nonce = GenericArray::from_slice(&nonce);
        let payload = Payload { msg: payload, aad: header };
        // Encryption with a well-formed key and nonce cannot fail.
        match &self.aead {
            AeadKey::Aes128(k) => k.encrypt(nonce, payload),
            AeadKey::Aes256(k) => k.encrypt(nonce, payload),
            AeadKey::ChaCha(k) => k.encrypt(nonce, payload),
        }
        .expect("AEAD seal is infallible for valid key material")
    }

    /// AEAD-open `ciphertext`; failure means the packet is dropped.
    pub fn open(
        &self,
        packet_number: u64,
        header: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let nonce = self.nonce(packet_number);
        let nonce = GenericArray::from_slice(&nonce);
        let payload = Payload { msg: ciphertext, aad: header };
        match &self.aead {
            AeadKey::Aes128(k) => k.decrypt(nonce, payload),
            AeadKey::Aes256(k) => k.decrypt(nonce, payload),
            AeadKey::ChaCha(k) => k.decrypt(nonce, payload),
        }
        .map_err(|_| TransportError::AeadFailure)
    }

    /// 5-byte header protection mask for a 16-byte ciphertext sample.
    pub fn hp_mask(&self, sample: &[u8]) -> Result<[u8; 5], TransportError> {
        if sample.len() < SAMPLE_LEN {
            return Err(TransportError::InsufficientData);
        }
        let mut mask = [0u8; 5];
        match &self.hp {
            HeaderKey::Aes128(k) => {
                let mut block = GenericArray::clone_from_slice(&sample[..16]);
                k.encrypt_block(&mut block);
                mask.copy_from_slice(&block[..5]);
            }
            HeaderKey::Aes256(k) => {
                let mut block = GenericArray::clone_from_slice(&sample[..16]);
                k.encrypt_block(&mut block);
                mask.copy_from_slice(&block[..5]);
            }
            HeaderKey::ChaCha(key) => {
                let counter = u32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                let mut cipher = ChaCha20::new(
                    GenericArray::from_slice(key),
                    GenericArray::from_slice(&sample[4..16]),
                );
                cipher.seek(u64::from(counter) * 64);
                cipher.apply_keystream(&mut mask);
            }
        }
        Ok(mask)
    }

    /// Next-generation keys for a key update (`quic ku`, RFC 9001 §6).
    ///
    /// The header-protection key is carried over unchanged; only the AEAD
    /// key and IV rotate.
    pub fn update(&self) -> DirectionalKeys {
        let hash = HkdfHash::from(self.suite);
        let next_secret = hkdf_expand_label(hash, &self.secret, "quic ku", self.secret.len());
        let mut next = DirectionalKeys::derive(self.suite, &next_secret);
        next.hp = self.hp.clone();
        next
    }
}

/// Key pair for one epoch: `local` protects what we send, `remote` opens
/// what the peer sends.
pub struct PacketKeys {
    pub local: DirectionalKeys,
    pub remote: DirectionalKeys,
    pub suite: CipherSuite,
}

impl PacketKeys {
    /// Initial keys derived from the client's destination CID (RFC 9001 §5.2).
    ///
    /// The client's `local` direction is the "client in" secret.
    pub fn initial(dcid: &[u8], is_client: bool) -> PacketKeys {
        let hash = HkdfHash::Sha256;
        let initial_secret = hkdf_extract(hash, &INITIAL_SALT_V1, dcid);
        let client = hkdf_expand_label(hash, &initial_secret, "client in", 32);
        let server = hkdf_expand_label(hash, &initial_secret, "server in", 32);
        let (local, remote) = if is_client { (client, server) } else { (server, client) };
        PacketKeys {
            local: DirectionalKeys::derive(CipherSuite::Aes128Gcm, &local),
            remote: DirectionalKeys::derive(CipherSuite::Aes128Gcm, &remote),
            suite: CipherSuite::Aes128Gcm,
        }
    }

    /// Keys installed from handshake-derived secrets (client perspective).
    pub fn from_secrets(suite: CipherSuite, client_secret: &[u8], server_secret: &[u8]) -> Self {
        PacketKeys {
            local: DirectionalKeys::derive(suite, client_secret),
            remote: DirectionalKeys::derive(suite, server_secret),
            suite,
        }
    }

    /// Both directions advanced one key-update generation.
    pub fn update(&self) -> PacketKeys {
        PacketKeys {
            local: self.local.update(),
            remote: self.remote.update(),
            suite: self.suite,
        }
    }
}

/// Compute the Retry integrity tag over the retry pseudo-packet
/// (RFC 9001 §5.8): original DCID length-prefixed, then the Retry packet
/// up to but not including the tag.
pub fn retry_integrity_tag(original_dcid: &[u8], retry_without_tag: &[u8]) -> [u8; 16] {
    let mut pseudo = Vec::with_capacity(1 + original_dcid.len() + retry_without_tag.len());
    pseudo.push(original_dcid.len() as u8);
    pseudo.extend_from_slice(original_dcid);
    pseudo.extend_from_slice(retry_without_tag);

    let key = Aes128Gcm::new(GenericArray::from_slice(&RETRY_KEY_V1));
    let sealed = key
        .encrypt(
            GenericArray::from_slice(&RETRY_NONCE_V1),
            Payload { msg: &[], aad: &pseudo },
        )
        .expect("AEAD seal is infallible for valid key material");
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&sealed);
    tag
}

/// Verify a Retry packet's integrity tag.
pub fn verify_retry_tag(original_dcid: &[u8], retry_packet: &[u8]) -> bool {
    if retry_packet.len() < TAG_LEN {
        return false;
    }
    let (body, tag) = retry_packet.split_at(retry_packet.len() - TAG_LEN);
    retry_integrity_tag(original_dcid, body) == tag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    // RFC 9001 Appendix A keys for DCID 0x8394c8f03e515708.
    const APPENDIX_A_DCID: &str = "8394c8f03e515708";

    #[test]
    fn test_initial_client_keys_match_rfc9001() {
        let keys = PacketKeys::initial(&hex(APPENDIX_A_DCID), true);
        assert_eq!(
            keys.local.secret,
            hex("c00cf151ca5be075ed0ebfb5c80323c42d6b7db67881289af4008f1f6c357aea")
        );
        assert_eq!(keys.local.iv.to_vec(), hex("fa044b2f42a3fd3b46fb255c"));
    }

    #[test]
    fn test_initial_server_keys_match_rfc9001() {
        let keys = PacketKeys::initial(&hex(APPENDIX_A_DCID), true);
        assert_eq!(
            keys.remote.secret,
            hex("3c199828fd139efd216c155ad844cc81fb82fa8d7446fa7d78be803acdda951b")
        );
        assert_eq!(keys.remote.iv.to_vec(), hex("0ac1493ca1905853b0bba03e"));
    }

    #[test]
    fn test_seal_open_round_trip() {
        let keys = PacketKeys::initial(&hex(APPENDIX_A_DCID), true);
        let header = b"example-header";
        let payload = b"hello quic";
        let sealed = keys.local.seal(7, header, payload);
        assert_eq!(sealed.len(), payload.len() + TAG_LEN);

        // The server-side view of the same keys opens it.
        let server = PacketKeys::initial(&hex(APPENDIX_A_DCID), false);
        let opened = server.remote.open(7, header, &sealed).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_open_rejects_tampered_header() {
        let keys = PacketKeys::initial(&hex(APPENDIX_A_DCID), true);
        let sealed = keys.local.seal(1, b"aad", b"data");
        let server = PacketKeys::initial(&hex(APPENDIX_A_DCID), false);
        assert_eq!(
            server.remote.open(1, b"bad", &sealed).unwrap_err(),
            TransportError::AeadFailure
        );
    }

    #[test]
    fn test_key_update_changes_material() {
        let keys = PacketKeys::initial(&hex(APPENDIX_A_DCID), true);
        let updated = keys.update();
        assert_ne!(keys.local.secret, updated.local.secret);
        assert_ne!(keys.local.iv, updated.local.iv);

        // A payload sealed under generation N does not open under N+1.
        let sealed = keys.local.seal(1, b"h", b"p");
        let server_next = PacketKeys::initial(&hex(APPENDIX_A_DCID), false).update();
        assert!(server_next.remote.open(1, b"h", &sealed).is_err());
    }

    #[test]
    fn test_chacha_hp_mask_rfc9001_a5() {
        // RFC 9001 A.5: ChaCha20-Poly1305 short header sample and mask.
        let secret =
            hex("9ac312a7f877468ebe69422748ad00a15443f18203a07d6060f688f30f21632b");
        let keys = DirectionalKeys::derive(CipherSuite::ChaCha20Poly1305, &secret);
        let sample = hex("5e5cd55c41f69080575d7999c25a5bfb");
        let mask = keys.hp_mask(&sample).unwrap();
        assert_eq!(mask.to_vec(), hex("aefefe7d03"));
    }

    #[test]
    fn test_retry_tag_round_trip() {
        let odcid = hex("8394c8f03e515708");
        let mut retry = vec![0xf0u8, 0x00, 0x00, 0x00, 0x01, 0x00, 0x04];
        retry.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        retry.extend_from_slice(b"token");
        let tag = retry_integrity_tag(&odcid, &retry);
        retry.extend_from_slice(&tag);
        assert!(verify_retry_tag(&odcid, &retry));

        retry[6] ^= 1;
        assert!(!verify_retry_tag(&odcid, &retry));
    }
}
