//! Node identity: Ed25519 keypairs and the peer ids derived from them.
//!
//! A [`PeerId`] is a multihash of the protobuf-encoded public key, the same
//! construction libp2p uses, so its text form is a base58btc string such as
//! `12D3KooW...`. Encoded keys of at most 42 bytes (every Ed25519 key) are
//! embedded with the identity multihash; longer encodings are hashed with
//! SHA2-256. Both forms are accepted when parsing.
//!
//! The private half of a [`Keypair`] never leaves the process: the type does
//! not implement `Serialize`, its `Debug` output is redacted, and the signing
//! key is zeroized on drop.

use crate::error::{WireError, WireResult};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::{OsRng, StdRng};
use rand::{CryptoRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use zeroize::Zeroizing;

/// Multihash code for the identity "hash" (bytes embedded verbatim).
const MULTIHASH_IDENTITY: u8 = 0x00;
/// Multihash code for SHA2-256.
const MULTIHASH_SHA2_256: u8 = 0x12;
/// Longest key encoding that is inlined instead of hashed.
const MAX_INLINE_KEY_LENGTH: usize = 42;

/// Protobuf field tag for `KeyType Type = 1` (varint).
const PROTOBUF_TYPE_TAG: u8 = 0x08;
/// Protobuf field tag for `bytes Data = 2` (length-delimited).
const PROTOBUF_DATA_TAG: u8 = 0x12;
/// `KeyType::Ed25519`.
const KEY_TYPE_ED25519: u8 = 0x01;

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Raw 32-byte key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Protobuf `PublicKey { Type: Ed25519, Data: <32 bytes> }` encoding.
    pub fn to_protobuf_encoding(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(36);
        out.extend_from_slice(&[PROTOBUF_TYPE_TAG, KEY_TYPE_ED25519, PROTOBUF_DATA_TAG, 32]);
        out.extend_from_slice(self.0.as_bytes());
        out
    }

    /// Parse the protobuf encoding produced by [`Self::to_protobuf_encoding`].
    pub fn from_protobuf_encoding(bytes: &[u8]) -> WireResult<Self> {
        match bytes {
            [PROTOBUF_TYPE_TAG, KEY_TYPE_ED25519, PROTOBUF_DATA_TAG, 32, key @ ..] if key.len() == 32 => {
                let mut raw = [0u8; 32];
                raw.copy_from_slice(key);
                VerifyingKey::from_bytes(&raw)
                    .map(Self)
                    .map_err(|e| WireError::Handshake(format!("invalid Ed25519 key: {e}")))
            }
            [PROTOBUF_TYPE_TAG, other, ..] => Err(WireError::Handshake(format!(
                "unsupported key type {other}"
            ))),
            _ => Err(WireError::Handshake("malformed public key encoding".into())),
        }
    }

    /// Verify an Ed25519 signature over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        let Ok(raw): Result<[u8; 64], _> = signature.try_into() else {
            return false;
        };
        self.0
            .verify_strict(msg, &Signature::from_bytes(&raw))
            .is_ok()
    }

    /// The peer id derived from this key.
    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0.as_bytes()))
    }
}

/// An Ed25519 keypair owned by exactly one host.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a keypair.
    ///
    /// With no seed (or a seed of `0`) the secret comes from the operating
    /// system's CSPRNG. Any other seed drives a deterministic generator so the
    /// same seed always yields the same identity. Seeded identities are
    /// predictable by construction and must only be used for tests and local
    /// debugging.
    pub fn generate(seed: Option<i64>) -> WireResult<Self> {
        match seed.filter(|s| *s != 0) {
            None => Self::generate_with_rng(&mut OsRng),
            Some(seed) => {
                warn!(seed, "Generating a deterministic identity; do not use in production");
                Self::generate_with_rng(&mut StdRng::seed_from_u64(seed as u64))
            }
        }
    }

    /// Generate a keypair from the given randomness source.
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> WireResult<Self> {
        let mut secret = Zeroizing::new([0u8; 32]);
        rng.try_fill_bytes(&mut *secret)
            .map_err(|e| WireError::KeyGeneration(e.to_string()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&secret),
        })
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }

    /// Sign `msg` with the private key.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.signing.sign(msg).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Location-independent identifier of a node.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    multihash: Vec<u8>,
}

impl PeerId {
    /// Derive the id of a public key. Pure and deterministic.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let encoded = key.to_protobuf_encoding();
        let mut multihash = Vec::with_capacity(2 + MAX_INLINE_KEY_LENGTH);
        if encoded.len() <= MAX_INLINE_KEY_LENGTH {
            multihash.push(MULTIHASH_IDENTITY);
            multihash.push(encoded.len() as u8);
            multihash.extend_from_slice(&encoded);
        } else {
            let digest = Sha256::digest(&encoded);
            multihash.push(MULTIHASH_SHA2_256);
            multihash.push(digest.len() as u8);
            multihash.extend_from_slice(&digest);
        }
        Self { multihash }
    }

    /// Parse a binary multihash.
    pub fn from_bytes(bytes: &[u8]) -> WireResult<Self> {
        let [code, len, digest @ ..] = bytes else {
            return Err(WireError::UnknownIdentifierEncoding(
                "multihash shorter than its header".into(),
            ));
        };
        let len = usize::from(*len);
        if len >= 0x80 || digest.len() != len {
            return Err(WireError::UnknownIdentifierEncoding(format!(
                "multihash length {len} does not match {} digest bytes",
                digest.len()
            )));
        }
        match *code {
            MULTIHASH_IDENTITY if len <= MAX_INLINE_KEY_LENGTH => {}
            MULTIHASH_SHA2_256 if len == 32 => {}
            other => {
                return Err(WireError::UnknownIdentifierEncoding(format!(
                    "unsupported multihash code 0x{other:02x} with length {len}"
                )))
            }
        }
        Ok(Self {
            multihash: bytes.to_vec(),
        })
    }

    /// Parse the base58btc text form.
    pub fn from_base58(s: &str) -> WireResult<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| WireError::UnknownIdentifierEncoding(format!("'{s}': {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.multihash).into_string()
    }

    /// The binary multihash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.multihash
    }

    /// The public key embedded in an identity multihash, if any.
    pub fn public_key(&self) -> Option<PublicKey> {
        if self.multihash.first() != Some(&MULTIHASH_IDENTITY) {
            return None;
        }
        PublicKey::from_protobuf_encoding(&self.multihash[2..]).ok()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}

impl FromStr for PeerId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingRng;

    impl RngCore for FailingRng {
        fn next_u32(&mut self) -> u32 {
            unimplemented!()
        }
        fn next_u64(&mut self) -> u64 {
            unimplemented!()
        }
        fn fill_bytes(&mut self, _dest: &mut [u8]) {
            unimplemented!()
        }
        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            Err(rand::Error::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                "entropy unavailable",
            )))
        }
    }

    impl CryptoRng for FailingRng {}

    #[test]
    fn test_peer_id_is_deterministic() {
        let keypair = Keypair::generate(None).unwrap();
        let a = PeerId::from_public_key(&keypair.public());
        let b = PeerId::from_public_key(&keypair.public());
        assert_eq!(a, b);
        assert_eq!(a, keypair.peer_id());
    }

    #[test]
    fn test_distinct_keys_distinct_ids() {
        let a = Keypair::generate(None).unwrap();
        let b = Keypair::generate(None).unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let a = Keypair::generate(Some(42)).unwrap();
        let b = Keypair::generate(Some(42)).unwrap();
        let c = Keypair::generate(Some(43)).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
        assert_ne!(a.peer_id(), c.peer_id());
    }

    #[test]
    fn test_negative_seed_is_reproducible() {
        let a = Keypair::generate(Some(-5)).unwrap();
        let b = Keypair::generate(Some(-5)).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
        assert_ne!(a.peer_id(), Keypair::generate(Some(5)).unwrap().peer_id());
    }

    #[test]
    fn test_zero_seed_is_random() {
        let a = Keypair::generate(Some(0)).unwrap();
        let b = Keypair::generate(Some(0)).unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_failing_rng_reports_key_generation_error() {
        let err = Keypair::generate_with_rng(&mut FailingRng).unwrap_err();
        assert!(matches!(err, WireError::KeyGeneration(_)), "got {err:?}");
    }

    #[test]
    fn test_ed25519_peer_id_text_form() {
        let id = Keypair::generate(None).unwrap().peer_id();
        let text = id.to_string();
        assert!(text.starts_with("12D3KooW"), "unexpected id {text}");
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn test_embedded_public_key_recovered() {
        let keypair = Keypair::generate(None).unwrap();
        assert_eq!(keypair.peer_id().public_key(), Some(keypair.public()));
    }

    #[test]
    fn test_sha256_multihash_accepted() {
        let mut bytes = vec![MULTIHASH_SHA2_256, 32];
        bytes.extend_from_slice(&Sha256::digest(b"some rsa key"));
        let id = PeerId::from_bytes(&bytes).unwrap();
        assert!(id.to_base58().starts_with("Qm"));
        assert!(id.public_key().is_none());
        assert_eq!(PeerId::from_base58(&id.to_base58()).unwrap(), id);
    }

    #[test]
    fn test_invalid_encodings_rejected() {
        // '0', 'O', 'I' and 'l' are not in the base58 alphabet.
        assert!(matches!(
            "0OIl".parse::<PeerId>(),
            Err(WireError::UnknownIdentifierEncoding(_))
        ));
        // Valid base58, but a length byte that disagrees with the payload.
        let bogus = bs58::encode([MULTIHASH_IDENTITY, 10, 1, 2, 3]).into_string();
        assert!(matches!(
            PeerId::from_base58(&bogus),
            Err(WireError::UnknownIdentifierEncoding(_))
        ));
        // Unsupported hash code.
        assert!(PeerId::from_bytes(&[0x13, 1, 0]).is_err());
        assert!(PeerId::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::generate(None).unwrap();
        let sig = keypair.sign(b"hello");
        assert!(keypair.public().verify(b"hello", &sig));
        assert!(!keypair.public().verify(b"hell0", &sig));
        assert!(!keypair.public().verify(b"hello", &sig[..63]));
    }

    #[test]
    fn test_protobuf_roundtrip() {
        let key = Keypair::generate(None).unwrap().public();
        let encoded = key.to_protobuf_encoding();
        assert_eq!(encoded.len(), 36);
        assert_eq!(PublicKey::from_protobuf_encoding(&encoded).unwrap(), key);
        assert!(PublicKey::from_protobuf_encoding(&encoded[..20]).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let keypair = Keypair::generate(Some(9)).unwrap();
        let debug = format!("{keypair:?}");
        assert!(debug.contains("peer_id"));
        assert!(!debug.contains(&hex::encode(keypair.signing.to_bytes())));
    }
}
